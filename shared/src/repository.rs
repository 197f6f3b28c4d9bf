use async_trait::async_trait;

use crate::types::{
    Device, DeviceId, DeviceStatus, HubResult, Location, LocationId, NewDevice,
    NewTelemetrySample, TelemetrySample, TenantId,
};

// 位置存储
#[async_trait]
pub trait LocationRepository: Send + Sync {
    /// 只返回属于该租户的位置
    async fn find_location_for_tenant(
        &self,
        tenant_id: TenantId,
        location_id: LocationId,
    ) -> HubResult<Option<Location>>;
}

// 设备存储。租户归属始终通过 location 推导。
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find_device(&self, device_id: DeviceId) -> HubResult<Option<Device>>;

    async fn find_device_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<Option<Device>>;

    async fn find_device_by_mac(&self, mac_address: &str) -> HubResult<Option<Device>>;

    async fn list_devices_for_tenant(&self, tenant_id: TenantId) -> HubResult<Vec<Device>>;

    async fn device_exists_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<bool>;

    async fn insert_device(&self, device: NewDevice) -> HubResult<Device>;

    /// 写回 location、name、status 三个可变字段
    async fn save_device(&self, device: &Device) -> HubResult<Device>;

    async fn update_device_status(&self, device_id: DeviceId, status: DeviceStatus) -> HubResult<()>;

    async fn delete_device(&self, device_id: DeviceId) -> HubResult<()>;
}

// 遥测存储，样本写入后只读
#[async_trait]
pub trait TelemetryRepository: Send + Sync {
    /// 返回写入的条数
    async fn insert_samples(&self, samples: &[NewTelemetrySample]) -> HubResult<u64>;

    /// 时间范围为闭区间，按时间升序
    async fn find_samples(
        &self,
        device_id: DeviceId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>>;

    /// 租户名下所有设备的遥测，按设备再按时间升序
    async fn find_samples_for_tenant(
        &self,
        tenant_id: TenantId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>>;

    async fn latest_sample(&self, device_id: DeviceId) -> HubResult<Option<TelemetrySample>>;

    async fn delete_samples_for_device(&self, device_id: DeviceId) -> HubResult<u64>;
}
