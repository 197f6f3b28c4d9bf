use hub_shared::{
    decode_topic, payload_preview, DeviceId, DeviceRepository, DeviceStatus, HubError,
    MessageKind, RoutingKey, TelemetryReading, TopicError,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::resolver::DeviceResolver;
use crate::telemetry::TelemetrySink;

/// 单条入站消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    TelemetryStored { device_id: DeviceId, samples: u64, skipped: u64 },
    StatusUpdated { device_id: DeviceId, status: DeviceStatus },
    CommandIgnored,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    DecodeFailed,
    PayloadMalformed,
    UnknownStatus,
    DeviceNotFound,
    StorageFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DropReason::DecodeFailed => "decode failed",
            DropReason::PayloadMalformed => "payload malformed",
            DropReason::UnknownStatus => "unknown status",
            DropReason::DeviceNotFound => "device not found",
            DropReason::StorageFailed => "storage failed",
        };
        f.write_str(reason)
    }
}

// 丢弃原因和底层错误
#[derive(Debug)]
struct Rejection {
    reason: DropReason,
    error: HubError,
}

impl Rejection {
    fn new(reason: DropReason, error: HubError) -> Self {
        Self { reason, error }
    }

    fn malformed(detail: impl fmt::Display) -> Self {
        Self::new(DropReason::PayloadMalformed, HubError::PayloadMalformed(detail.to_string()))
    }

    fn storage(error: HubError) -> Self {
        Self::new(DropReason::StorageFailed, error)
    }

    // 解析设备时的错误
    fn from_lookup(error: HubError) -> Self {
        let reason = match &error {
            HubError::NotFound { .. } | HubError::InvalidInput(_) => DropReason::DeviceNotFound,
            _ => DropReason::StorageFailed,
        };
        Self::new(reason, error)
    }
}

impl From<TopicError> for Rejection {
    fn from(err: TopicError) -> Self {
        Self::new(DropReason::DecodeFailed, HubError::Decode(err))
    }
}

/// 入站消息分发器。不持有可变状态，可被多个任务并发调用。
#[derive(Clone)]
pub struct IngestionDispatcher {
    resolver: DeviceResolver,
    sink: TelemetrySink,
    devices: Arc<dyn DeviceRepository>,
}

impl IngestionDispatcher {
    pub fn new(resolver: DeviceResolver, sink: TelemetrySink, devices: Arc<dyn DeviceRepository>) -> Self {
        Self {
            resolver,
            sink,
            devices,
        }
    }

    /// 处理一条消息；所有失败都在这里记录并吞掉，不会向传输层传播
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        debug!("Received message on topic {} ({} bytes)", topic, payload.len());

        match self.try_dispatch(topic, payload).await {
            Ok(outcome) => outcome,
            Err(dropped) => {
                warn!(
                    "Dropping message on topic {}: {} ({}); payload: {}",
                    topic,
                    dropped.reason,
                    dropped.error,
                    payload_preview(payload)
                );
                DispatchOutcome::Dropped(dropped.reason)
            }
        }
    }

    async fn try_dispatch(&self, topic: &str, payload: &[u8]) -> Result<DispatchOutcome, Rejection> {
        let key = decode_topic(topic)?;

        match key.kind {
            MessageKind::Telemetry => self.handle_telemetry(&key, topic, payload).await,
            MessageKind::Status => self.handle_status(&key, payload).await,
            MessageKind::Command => {
                debug!("Ignoring inbound command message on topic {}", topic);
                Ok(DispatchOutcome::CommandIgnored)
            }
        }
    }

    async fn handle_telemetry(
        &self,
        key: &RoutingKey,
        topic: &str,
        payload: &[u8],
    ) -> Result<DispatchOutcome, Rejection> {
        let elements: Vec<serde_json::Value> = serde_json::from_slice(payload)
            .map_err(|e| Rejection::malformed(format!("expected JSON array: {}", e)))?;

        let total = elements.len();
        let mut readings = Vec::with_capacity(total);
        for (index, element) in elements.into_iter().enumerate() {
            match serde_json::from_value::<TelemetryReading>(element) {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!(
                    "Skipping malformed telemetry element {} on topic {}: {}",
                    index, topic, e
                ),
            }
        }

        if total > 0 && readings.is_empty() {
            return Err(Rejection::malformed(format!(
                "all {} telemetry elements are malformed",
                total
            )));
        }

        let device = self
            .resolver
            .resolve_routing_key(key)
            .await
            .map_err(Rejection::from_lookup)?;

        let stored = self
            .sink
            .record_batch(&device, &readings)
            .await
            .map_err(Rejection::storage)?;

        info!("Stored {} telemetry samples for device {} ({})", stored, device.id, key);
        Ok(DispatchOutcome::TelemetryStored {
            device_id: device.id,
            samples: stored,
            skipped: (total - readings.len()) as u64,
        })
    }

    async fn handle_status(&self, key: &RoutingKey, payload: &[u8]) -> Result<DispatchOutcome, Rejection> {
        let status = parse_status_payload(payload)?;

        let device = self
            .resolver
            .resolve_routing_key(key)
            .await
            .map_err(Rejection::from_lookup)?;

        self.devices
            .update_device_status(device.id, status)
            .await
            .map_err(Rejection::storage)?;

        info!("Device {} status {} -> {}", device.id, device.status, status);
        Ok(DispatchOutcome::StatusUpdated {
            device_id: device.id,
            status,
        })
    }
}

/// 状态载荷：`{"state": "..."}`、JSON 字符串或裸状态字
fn parse_status_payload(payload: &[u8]) -> Result<DeviceStatus, Rejection> {
    let text = std::str::from_utf8(payload)
        .map_err(Rejection::malformed)?
        .trim();

    if text.is_empty() {
        return Err(Rejection::malformed("empty status payload"));
    }

    let token = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(object)) => match object.get("state") {
            Some(serde_json::Value::String(state)) => state.clone(),
            Some(other) => {
                return Err(Rejection::malformed(format!("state field is not a string: {}", other)))
            }
            None => return Err(Rejection::malformed("missing state field")),
        },
        Ok(serde_json::Value::String(state)) => state,
        Ok(other) => {
            return Err(Rejection::malformed(format!("unexpected status payload: {}", other)))
        }
        // 非 JSON 视为裸状态字
        Err(_) => text.to_string(),
    };

    token
        .parse::<DeviceStatus>()
        .map_err(|e| Rejection::new(DropReason::UnknownStatus, e))
}
