use hub_shared::{
    generate_hardware_id, normalize_mac_address, Device, DeviceAddress, DeviceId,
    DeviceRepository, DeviceStatus, HubError, HubResult, NewDevice, RoutingKey, TenantId,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 设备解析器：所有按 ID 的查询都经过租户过滤
#[derive(Clone)]
pub struct DeviceResolver {
    devices: Arc<dyn DeviceRepository>,
}

impl DeviceResolver {
    pub fn new(devices: Arc<dyn DeviceRepository>) -> Self {
        Self { devices }
    }

    pub async fn resolve(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<Device> {
        self.devices
            .find_device_for_tenant(tenant_id, device_id)
            .await?
            .ok_or_else(|| HubError::not_found("Device", device_id))
    }

    pub async fn resolve_by_hardware_id(&self, mac_address: &str) -> HubResult<Device> {
        let mac = normalize_mac_address(mac_address)
            .ok_or_else(|| HubError::InvalidInput(format!("Invalid MAC address: {}", mac_address)))?;

        self.devices
            .find_device_by_mac(&mac)
            .await?
            .ok_or_else(|| HubError::not_found("Device", mac))
    }

    /// 解析入站路由键对应的设备。
    /// 数字形式下设备当前的 location 必须与主题一致，否则按不存在处理。
    pub async fn resolve_routing_key(&self, key: &RoutingKey) -> HubResult<Device> {
        match &key.address {
            DeviceAddress::Scoped {
                tenant_id,
                location_id,
                device_id,
            } => {
                let device = self.resolve(*tenant_id, *device_id).await?;
                if device.location_id != Some(*location_id) {
                    debug!(
                        "Device {} is bound to location {:?}, topic names location {}",
                        device.id, device.location_id, location_id
                    );
                    return Err(HubError::not_found("Device", device_id));
                }
                Ok(device)
            }
            DeviceAddress::Hardware { mac_address, .. } => {
                self.resolve_by_hardware_id(mac_address).await
            }
        }
    }

    /// 认领前的设备查找或自动注册。
    ///
    /// 不存在时以 Unclaimed 状态创建；已存在时要求凭证完全一致，
    /// 并且在线设备必须先恢复出厂设置。两项检查都在任何写操作之前完成。
    pub async fn resolve_or_provision(
        &self,
        mac_address: &str,
        proof_of_possession: &str,
    ) -> HubResult<Device> {
        let mac = normalize_request_mac(mac_address)?;

        let device = match self.devices.find_device_by_mac(&mac).await? {
            Some(device) => device,
            None => {
                let device = self
                    .devices
                    .insert_device(NewDevice {
                        mac_address: mac.clone(),
                        hardware_id: generate_hardware_id(),
                        proof_of_possession: proof_of_possession.to_string(),
                        status: DeviceStatus::Unclaimed,
                        location_id: None,
                        name: None,
                    })
                    .await?;
                info!("Provisioned new device {} for MAC {}", device.id, mac);
                return Ok(device);
            }
        };

        if device.proof_of_possession != proof_of_possession {
            warn!("Proof of possession mismatch for device {} ({})", device.id, mac);
            return Err(HubError::Authorization(format!(
                "Proof of possession does not match device {}",
                mac
            )));
        }

        if device.status == DeviceStatus::Online {
            return Err(HubError::IllegalState(format!(
                "Device {} is online and must be factory reset before it can be claimed",
                mac
            )));
        }

        Ok(device)
    }

    pub async fn exists_for_tenant(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<bool> {
        self.devices.device_exists_for_tenant(tenant_id, device_id).await
    }
}

/// 租户提交的 MAC 允许首尾空白；主题里的 MAC 不允许
pub fn normalize_request_mac(mac_address: &str) -> HubResult<String> {
    normalize_mac_address(mac_address.trim())
        .ok_or_else(|| HubError::InvalidInput(format!("Invalid MAC address: {:?}", mac_address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_shared::memory::InMemoryStore;
    use hub_shared::MessageKind;

    async fn setup() -> (Arc<InMemoryStore>, DeviceResolver) {
        let store = Arc::new(InMemoryStore::new());
        let resolver = DeviceResolver::new(store.clone());
        (store, resolver)
    }

    async fn claimed_device(store: &InMemoryStore, tenant_id: TenantId, mac: &str) -> Device {
        let location = store.add_location(tenant_id, "Office").await;
        store
            .insert_device(NewDevice {
                mac_address: mac.to_string(),
                hardware_id: generate_hardware_id(),
                proof_of_possession: "secret".to_string(),
                status: DeviceStatus::Offline,
                location_id: Some(location.id),
                name: Some("Sensor".to_string()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_is_tenant_scoped() {
        let (store, resolver) = setup().await;
        let device = claimed_device(&store, 1, "AA:BB:CC:DD:EE:01").await;

        assert_eq!(resolver.resolve(1, device.id).await.unwrap().id, device.id);
        assert!(resolver.resolve(2, device.id).await.unwrap_err().is_not_found());
        assert!(resolver.exists_for_tenant(1, device.id).await.unwrap());
        assert!(!resolver.exists_for_tenant(2, device.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_by_hardware_id_normalizes() {
        let (store, resolver) = setup().await;
        let device = claimed_device(&store, 1, "AA:BB:CC:DD:EE:01").await;

        let found = resolver.resolve_by_hardware_id("aa-bb-cc-dd-ee-01").await.unwrap();
        assert_eq!(found.id, device.id);
        assert!(resolver
            .resolve_by_hardware_id("AA:BB:CC:DD:EE:02")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_routing_key_location_must_match() {
        let (store, resolver) = setup().await;
        let device = claimed_device(&store, 3, "AA:BB:CC:DD:EE:01").await;
        let location_id = device.location_id.unwrap();

        let key = RoutingKey::scoped(3, location_id, device.id, MessageKind::Status);
        assert!(resolver.resolve_routing_key(&key).await.is_ok());

        let wrong = RoutingKey::scoped(3, location_id + 100, device.id, MessageKind::Status);
        assert!(resolver.resolve_routing_key(&wrong).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_provision_creates_unclaimed_device() {
        let (store, resolver) = setup().await;

        let device = resolver
            .resolve_or_provision("aa:bb:cc:dd:ee:09", "pop-1")
            .await
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Unclaimed);
        assert_eq!(device.mac_address, "AA:BB:CC:DD:EE:09");
        assert_eq!(device.hardware_id.len(), 36);
        assert!(!device.is_claimed());

        // 再次调用返回同一设备
        let again = resolver.resolve_or_provision("AA:BB:CC:DD:EE:09", "pop-1").await.unwrap();
        assert_eq!(again.id, device.id);
        assert_eq!(store.device_count().await, 1);
    }

    #[tokio::test]
    async fn test_request_mac_is_trimmed_but_not_mixed() {
        let (store, resolver) = setup().await;

        let device = resolver
            .resolve_or_provision(" aa:bb:cc:dd:ee:09\n", "pop-1")
            .await
            .unwrap();
        assert_eq!(device.mac_address, "AA:BB:CC:DD:EE:09");

        let err = resolver
            .resolve_or_provision("AA:BB-CC:DD-EE:0A", "pop-1")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
        assert_eq!(store.device_count().await, 1);
    }

    #[tokio::test]
    async fn test_provision_rejects_wrong_proof() {
        let (store, resolver) = setup().await;
        let device = claimed_device(&store, 1, "AA:BB:CC:DD:EE:01").await;

        let err = resolver
            .resolve_or_provision("AA:BB:CC:DD:EE:01", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Authorization(_)));

        let unchanged = store.find_device(device.id).await.unwrap().unwrap();
        assert_eq!(unchanged, device);
    }

    #[tokio::test]
    async fn test_online_device_cannot_be_reclaimed() {
        let (store, resolver) = setup().await;
        let device = claimed_device(&store, 1, "AA:BB:CC:DD:EE:01").await;
        store.update_device_status(device.id, DeviceStatus::Online).await.unwrap();

        let err = resolver
            .resolve_or_provision("AA:BB:CC:DD:EE:01", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_invalid_mac_is_rejected() {
        let (_store, resolver) = setup().await;
        let err = resolver.resolve_or_provision("not-a-mac", "pop").await.unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
    }
}
