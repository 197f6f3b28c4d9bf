use hub_shared::{
    command_topic, DeviceId, HubResult, LocationId, OutboundCommand, QoS, TenantId, Transport,
};
use std::sync::Arc;
use tracing::{debug, error};

/// 命令下发：只保证交给传输层，不保证设备已收到
#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn Transport>,
    qos: QoS,
}

impl CommandPublisher {
    pub fn new(transport: Arc<dyn Transport>, qos: QoS) -> Self {
        Self { transport, qos }
    }

    pub async fn publish(
        &self,
        tenant_id: TenantId,
        location_id: LocationId,
        device_id: DeviceId,
        command: &OutboundCommand,
    ) -> HubResult<()> {
        let topic = command_topic(tenant_id, location_id, device_id);
        let payload = serde_json::to_vec(command)?;

        if let Err(e) = self.transport.publish(&topic, payload, self.qos).await {
            error!("Failed to publish {} command to {}: {}", command.command_type, topic, e);
            return Err(e.into());
        }

        debug!("Published {} command to {}", command.command_type, topic);
        Ok(())
    }
}
