//! 内存实现：用于测试和本地调试，语义与 Postgres 存储保持一致

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::mqtt::{MqttError, QoS, Transport};
use crate::repository::{DeviceRepository, LocationRepository, TelemetryRepository};
use crate::types::{
    Device, DeviceId, DeviceStatus, HubError, HubResult, Location, LocationId, NewDevice,
    NewTelemetrySample, TelemetrySample, TenantId,
};
use crate::utils::now_utc;

#[derive(Debug, Default)]
struct Tables {
    locations: HashMap<LocationId, Location>,
    devices: HashMap<DeviceId, Device>,
    telemetry: Vec<TelemetrySample>,
    next_location_id: i64,
    next_device_id: i64,
    next_sample_id: i64,
}

impl Tables {
    // 租户只从 location 推导
    fn resolve_tenant(&self, mut device: Device) -> Device {
        device.tenant_id = device
            .location_id
            .and_then(|id| self.locations.get(&id))
            .map(|location| location.tenant_id);
        device
    }

    fn tenant_of(&self, device_id: DeviceId) -> Option<TenantId> {
        self.devices
            .get(&device_id)
            .and_then(|device| device.location_id)
            .and_then(|id| self.locations.get(&id))
            .map(|location| location.tenant_id)
    }

    fn check_location(&self, location_id: Option<LocationId>) -> HubResult<()> {
        match location_id {
            Some(id) if !self.locations.contains_key(&id) => Err(HubError::Database(format!(
                "foreign key violation: location {} does not exist",
                id
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_location(&self, tenant_id: TenantId, name: &str) -> Location {
        let mut tables = self.tables.write().await;
        tables.next_location_id += 1;

        let location = Location {
            id: tables.next_location_id,
            tenant_id,
            name: name.to_string(),
            created_at: now_utc(),
        };
        tables.locations.insert(location.id, location.clone());
        location
    }

    pub async fn samples(&self) -> Vec<TelemetrySample> {
        self.tables.read().await.telemetry.clone()
    }

    pub async fn device_count(&self) -> usize {
        self.tables.read().await.devices.len()
    }
}

#[async_trait]
impl LocationRepository for InMemoryStore {
    async fn find_location_for_tenant(
        &self,
        tenant_id: TenantId,
        location_id: LocationId,
    ) -> HubResult<Option<Location>> {
        let tables = self.tables.read().await;
        Ok(tables
            .locations
            .get(&location_id)
            .filter(|location| location.tenant_id == tenant_id)
            .cloned())
    }
}

#[async_trait]
impl DeviceRepository for InMemoryStore {
    async fn find_device(&self, device_id: DeviceId) -> HubResult<Option<Device>> {
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .get(&device_id)
            .cloned()
            .map(|device| tables.resolve_tenant(device)))
    }

    async fn find_device_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<Option<Device>> {
        Ok(self
            .find_device(device_id)
            .await?
            .filter(|device| device.belongs_to(tenant_id)))
    }

    async fn find_device_by_mac(&self, mac_address: &str) -> HubResult<Option<Device>> {
        let tables = self.tables.read().await;
        Ok(tables
            .devices
            .values()
            .find(|device| device.mac_address.eq_ignore_ascii_case(mac_address))
            .cloned()
            .map(|device| tables.resolve_tenant(device)))
    }

    async fn list_devices_for_tenant(&self, tenant_id: TenantId) -> HubResult<Vec<Device>> {
        let tables = self.tables.read().await;
        let mut devices: Vec<Device> = tables
            .devices
            .values()
            .cloned()
            .map(|device| tables.resolve_tenant(device))
            .filter(|device| device.belongs_to(tenant_id))
            .collect();
        devices.sort_by_key(|device| device.id);
        Ok(devices)
    }

    async fn device_exists_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<bool> {
        Ok(self.find_device_for_tenant(tenant_id, device_id).await?.is_some())
    }

    async fn insert_device(&self, device: NewDevice) -> HubResult<Device> {
        let mut tables = self.tables.write().await;

        if tables
            .devices
            .values()
            .any(|existing| existing.mac_address.eq_ignore_ascii_case(&device.mac_address))
        {
            return Err(HubError::Database(format!(
                "unique violation: mac_address {} already exists",
                device.mac_address
            )));
        }
        tables.check_location(device.location_id)?;

        tables.next_device_id += 1;
        let now = now_utc();
        let record = Device {
            id: tables.next_device_id,
            tenant_id: None,
            location_id: device.location_id,
            mac_address: device.mac_address,
            hardware_id: device.hardware_id,
            proof_of_possession: device.proof_of_possession,
            status: device.status,
            name: device.name,
            created_at: now,
            updated_at: now,
        };
        tables.devices.insert(record.id, record.clone());

        Ok(tables.resolve_tenant(record))
    }

    async fn save_device(&self, device: &Device) -> HubResult<Device> {
        let mut tables = self.tables.write().await;
        tables.check_location(device.location_id)?;

        let stored = tables
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| HubError::not_found("Device", device.id))?;
        stored.location_id = device.location_id;
        stored.name = device.name.clone();
        stored.status = device.status;
        stored.updated_at = now_utc();

        let updated = stored.clone();
        Ok(tables.resolve_tenant(updated))
    }

    async fn update_device_status(&self, device_id: DeviceId, status: DeviceStatus) -> HubResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| HubError::not_found("Device", device_id))?;
        stored.status = status;
        stored.updated_at = now_utc();
        Ok(())
    }

    async fn delete_device(&self, device_id: DeviceId) -> HubResult<()> {
        let mut tables = self.tables.write().await;
        if tables.telemetry.iter().any(|sample| sample.device_id == device_id) {
            return Err(HubError::Database(format!(
                "foreign key violation: telemetry still references device {}",
                device_id
            )));
        }
        tables
            .devices
            .remove(&device_id)
            .map(|_| ())
            .ok_or_else(|| HubError::not_found("Device", device_id))
    }
}

#[async_trait]
impl TelemetryRepository for InMemoryStore {
    async fn insert_samples(&self, samples: &[NewTelemetrySample]) -> HubResult<u64> {
        let mut tables = self.tables.write().await;

        // 整批校验后再写入，与事务语义一致
        if let Some(missing) = samples
            .iter()
            .find(|sample| !tables.devices.contains_key(&sample.device_id))
        {
            return Err(HubError::Database(format!(
                "foreign key violation: device {} does not exist",
                missing.device_id
            )));
        }

        let created_at = now_utc();
        for sample in samples {
            tables.next_sample_id += 1;
            let record = TelemetrySample {
                id: tables.next_sample_id,
                device_id: sample.device_id,
                timestamp: sample.timestamp,
                temperature: sample.temperature,
                humidity: sample.humidity,
                pressure: sample.pressure,
                person_count: sample.person_count,
                created_at,
            };
            tables.telemetry.push(record);
        }

        Ok(samples.len() as u64)
    }

    async fn find_samples(
        &self,
        device_id: DeviceId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>> {
        let tables = self.tables.read().await;
        let mut samples: Vec<TelemetrySample> = tables
            .telemetry
            .iter()
            .filter(|sample| {
                sample.device_id == device_id
                    && sample.timestamp >= start_ms
                    && sample.timestamp <= end_ms
            })
            .cloned()
            .collect();
        samples.sort_by_key(|sample| (sample.timestamp, sample.id));
        Ok(samples)
    }

    async fn find_samples_for_tenant(
        &self,
        tenant_id: TenantId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>> {
        let tables = self.tables.read().await;
        let mut samples: Vec<TelemetrySample> = tables
            .telemetry
            .iter()
            .filter(|sample| {
                sample.timestamp >= start_ms
                    && sample.timestamp <= end_ms
                    && tables.tenant_of(sample.device_id) == Some(tenant_id)
            })
            .cloned()
            .collect();
        samples.sort_by_key(|sample| (sample.device_id, sample.timestamp, sample.id));
        Ok(samples)
    }

    async fn latest_sample(&self, device_id: DeviceId) -> HubResult<Option<TelemetrySample>> {
        let tables = self.tables.read().await;
        Ok(tables
            .telemetry
            .iter()
            .filter(|sample| sample.device_id == device_id)
            .max_by_key(|sample| (sample.timestamp, sample.id))
            .cloned())
    }

    async fn delete_samples_for_device(&self, device_id: DeviceId) -> HubResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.telemetry.len();
        tables.telemetry.retain(|sample| sample.device_id != device_id);
        Ok((before - tables.telemetry.len()) as u64)
    }
}

// 记录下发的消息
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl PublishedMessage {
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

/// 记录所有发布请求的传输层，可切换为失败模式
#[derive(Debug, Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MqttError::Publish(format!("broker unavailable for {}", topic)));
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_device(mac: &str, location_id: Option<LocationId>) -> NewDevice {
        NewDevice {
            mac_address: mac.to_string(),
            hardware_id: crate::utils::generate_hardware_id(),
            proof_of_possession: "pop".to_string(),
            status: DeviceStatus::Offline,
            location_id,
            name: None,
        }
    }

    #[tokio::test]
    async fn test_tenant_is_derived_from_location() {
        let store = InMemoryStore::new();
        let location = store.add_location(7, "Warehouse").await;

        let device = store
            .insert_device(new_device("AA:BB:CC:DD:EE:01", Some(location.id)))
            .await
            .unwrap();
        assert_eq!(device.tenant_id, Some(7));

        assert!(store.device_exists_for_tenant(7, device.id).await.unwrap());
        assert!(!store.device_exists_for_tenant(8, device.id).await.unwrap());
        assert!(store.find_device_for_tenant(8, device.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_mac_is_rejected() {
        let store = InMemoryStore::new();
        store.insert_device(new_device("AA:BB:CC:DD:EE:01", None)).await.unwrap();
        let result = store.insert_device(new_device("aa:bb:cc:dd:ee:01", None)).await;
        assert!(matches!(result, Err(HubError::Database(_))));
    }

    #[tokio::test]
    async fn test_samples_are_ordered_and_bounded() {
        let store = InMemoryStore::new();
        let device = store.insert_device(new_device("AA:BB:CC:DD:EE:01", None)).await.unwrap();

        let samples: Vec<NewTelemetrySample> = [300, 100, 200]
            .iter()
            .map(|ts| NewTelemetrySample {
                device_id: device.id,
                timestamp: *ts,
                temperature: Some(20.0),
                humidity: None,
                pressure: None,
                person_count: None,
            })
            .collect();
        assert_eq!(store.insert_samples(&samples).await.unwrap(), 3);

        let found = store.find_samples(device.id, 100, 200).await.unwrap();
        let timestamps: Vec<i64> = found.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200]);

        let latest = store.latest_sample(device.id).await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 300);
    }

    #[tokio::test]
    async fn test_tenant_samples_follow_device_location() {
        let store = InMemoryStore::new();
        let ours = store.add_location(7, "Warehouse").await;
        let theirs = store.add_location(8, "Shop").await;
        let a = store.insert_device(new_device("AA:BB:CC:DD:EE:01", Some(ours.id))).await.unwrap();
        let b = store.insert_device(new_device("AA:BB:CC:DD:EE:02", Some(ours.id))).await.unwrap();
        let other = store.insert_device(new_device("AA:BB:CC:DD:EE:03", Some(theirs.id))).await.unwrap();
        let loose = store.insert_device(new_device("AA:BB:CC:DD:EE:04", None)).await.unwrap();

        let readings = [
            (b.id, 200),
            (a.id, 300),
            (other.id, 200),
            (loose.id, 200),
            (a.id, 100),
            (a.id, 900),
        ];
        let samples: Vec<NewTelemetrySample> = readings
            .iter()
            .map(|(device_id, ts)| NewTelemetrySample {
                device_id: *device_id,
                timestamp: *ts,
                temperature: None,
                humidity: Some(40.0),
                pressure: None,
                person_count: None,
            })
            .collect();
        store.insert_samples(&samples).await.unwrap();

        let found = store.find_samples_for_tenant(7, 100, 300).await.unwrap();
        let keys: Vec<(DeviceId, i64)> = found.iter().map(|s| (s.device_id, s.timestamp)).collect();
        assert_eq!(keys, vec![(a.id, 100), (a.id, 300), (b.id, 200)]);

        assert!(store.find_samples_for_tenant(9, 0, i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recording_transport_failure_mode() {
        let transport = RecordingTransport::new();
        transport.publish("a/b", b"{}".to_vec(), QoS::AtLeastOnce).await.unwrap();

        transport.set_failing(true);
        assert!(transport.publish("a/b", vec![], QoS::AtLeastOnce).await.is_err());
        assert_eq!(transport.published().await.len(), 1);
    }
}
