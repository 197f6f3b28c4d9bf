// 设备管理服务 - 租户作用域的设备操作
use std::collections::BTreeMap;
use std::sync::Arc;
use hub_shared::{
    generate_hardware_id, now_millis, validate_device_name, ClaimRequest, CreateDeviceRequest,
    Device, DeviceId, DeviceRepository, DeviceStatus, HubError, HubResult, Location, LocationId,
    LocationRepository, NewDevice, OutboundCommand, TelemetryRepository, TelemetrySample, TenantId,
};
use tracing::{info, warn};

use crate::publisher::CommandPublisher;
use crate::resolver::{normalize_request_mac, DeviceResolver};

// 设备服务
#[derive(Clone)]
pub struct DeviceService {
    locations: Arc<dyn LocationRepository>,
    devices: Arc<dyn DeviceRepository>,
    telemetry: Arc<dyn TelemetryRepository>,
    resolver: DeviceResolver,
    publisher: CommandPublisher,
}

impl DeviceService {
    pub fn new(
        locations: Arc<dyn LocationRepository>,
        devices: Arc<dyn DeviceRepository>,
        telemetry: Arc<dyn TelemetryRepository>,
        publisher: CommandPublisher,
    ) -> Self {
        let resolver = DeviceResolver::new(devices.clone());
        Self {
            locations,
            devices,
            telemetry,
            resolver,
            publisher,
        }
    }

    /// 认领设备：位置必须属于该租户，凭证匹配且设备不在线
    pub async fn claim_device(&self, tenant_id: TenantId, request: ClaimRequest) -> HubResult<Device> {
        let name = checked_name(&request.name)?;
        let location = self.owned_location(tenant_id, request.location_id).await?;

        let mut device = self
            .resolver
            .resolve_or_provision(&request.mac_address, &request.proof_of_possession)
            .await?;

        device.location_id = Some(location.id);
        device.name = Some(name);
        device.status = DeviceStatus::Offline;
        let device = self.devices.save_device(&device).await?;

        info!(
            "Device {} ({}) claimed by tenant {} into location {}",
            device.id, device.mac_address, tenant_id, location.id
        );
        Ok(device)
    }

    /// 租户直接登记设备，不经过认领流程；MAC 已存在时拒绝
    pub async fn create_device(
        &self,
        tenant_id: TenantId,
        request: CreateDeviceRequest,
    ) -> HubResult<Device> {
        let name = checked_name(&request.name)?;
        let location = self.owned_location(tenant_id, request.location_id).await?;
        let mac = normalize_request_mac(&request.mac_address)?;

        if request.proof_of_possession.is_empty() {
            return Err(HubError::InvalidInput("Proof of possession cannot be empty".to_string()));
        }

        if self.devices.find_device_by_mac(&mac).await?.is_some() {
            return Err(HubError::IllegalState(format!("Device with MAC {} already exists", mac)));
        }

        let device = self
            .devices
            .insert_device(NewDevice {
                mac_address: mac,
                hardware_id: generate_hardware_id(),
                proof_of_possession: request.proof_of_possession,
                status: DeviceStatus::Offline,
                location_id: Some(location.id),
                name: Some(name),
            })
            .await?;

        info!(
            "Device {} ({}) created by tenant {} in location {}",
            device.id, device.mac_address, tenant_id, location.id
        );
        Ok(device)
    }

    /// 解绑：先下发恢复出厂设置，成功后清空位置和名称
    pub async fn unbind_device(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<Device> {
        let mut device = self.resolver.resolve(tenant_id, device_id).await?;

        self.send_to_device(tenant_id, &device, &OutboundCommand::factory_reset())
            .await?;

        device.location_id = None;
        device.name = None;
        device.status = DeviceStatus::Unclaimed;
        let device = self.devices.save_device(&device).await?;

        info!("Device {} unbound from tenant {}", device.id, tenant_id);
        Ok(device)
    }

    pub async fn set_device_status(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        status: DeviceStatus,
    ) -> HubResult<Device> {
        let mut device = self.resolver.resolve(tenant_id, device_id).await?;
        let previous = device.status;

        device.status = status;
        let device = self.devices.save_device(&device).await?;

        info!("Device {} status {} -> {} (tenant {})", device.id, previous, status, tenant_id);
        Ok(device)
    }

    /// 删除设备，先批量删除其遥测
    pub async fn delete_device(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<()> {
        let device = self.resolver.resolve(tenant_id, device_id).await?;

        let removed = self.telemetry.delete_samples_for_device(device.id).await?;
        self.devices.delete_device(device.id).await?;

        info!(
            "Deleted device {} for tenant {} with {} telemetry samples",
            device.id, tenant_id, removed
        );
        Ok(())
    }

    pub async fn rename_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        name: &str,
    ) -> HubResult<Device> {
        let name = checked_name(name)?;
        let mut device = self.resolver.resolve(tenant_id, device_id).await?;

        device.name = Some(name);
        self.devices.save_device(&device).await
    }

    pub async fn list_devices(&self, tenant_id: TenantId) -> HubResult<Vec<Device>> {
        self.devices.list_devices_for_tenant(tenant_id).await
    }

    pub async fn get_device(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<Device> {
        self.resolver.resolve(tenant_id, device_id).await
    }

    pub async fn device_exists(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<bool> {
        self.resolver.exists_for_tenant(tenant_id, device_id).await
    }

    pub async fn send_command(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        command: &OutboundCommand,
    ) -> HubResult<()> {
        let device = self.resolver.resolve(tenant_id, device_id).await?;
        self.send_to_device(tenant_id, &device, command).await
    }

    /// 查询时间范围内的遥测
    pub async fn device_telemetry(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> HubResult<Vec<TelemetrySample>> {
        self.ensure_owned(tenant_id, device_id).await?;
        let (start, end) = time_range(start_ms, end_ms)?;
        self.telemetry.find_samples(device_id, start, end).await
    }

    /// 租户全部设备的遥测，按设备分组
    pub async fn tenant_telemetry(
        &self,
        tenant_id: TenantId,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> HubResult<BTreeMap<DeviceId, Vec<TelemetrySample>>> {
        let (start, end) = time_range(start_ms, end_ms)?;
        let samples = self.telemetry.find_samples_for_tenant(tenant_id, start, end).await?;

        let mut grouped: BTreeMap<DeviceId, Vec<TelemetrySample>> = BTreeMap::new();
        for sample in samples {
            grouped.entry(sample.device_id).or_default().push(sample);
        }
        Ok(grouped)
    }

    pub async fn latest_telemetry(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<Option<TelemetrySample>> {
        self.ensure_owned(tenant_id, device_id).await?;
        self.telemetry.latest_sample(device_id).await
    }

    async fn owned_location(&self, tenant_id: TenantId, location_id: LocationId) -> HubResult<Location> {
        self.locations
            .find_location_for_tenant(tenant_id, location_id)
            .await?
            .ok_or_else(|| HubError::not_found("Location", location_id))
    }

    async fn ensure_owned(&self, tenant_id: TenantId, device_id: DeviceId) -> HubResult<()> {
        if self.resolver.exists_for_tenant(tenant_id, device_id).await? {
            Ok(())
        } else {
            Err(HubError::not_found("Device", device_id))
        }
    }

    async fn send_to_device(
        &self,
        tenant_id: TenantId,
        device: &Device,
        command: &OutboundCommand,
    ) -> HubResult<()> {
        // 未认领的设备没有规范主题
        let location_id = device.location_id.ok_or_else(|| {
            HubError::IllegalState(format!("Device {} is not assigned to a location", device.id))
        })?;

        self.publisher
            .publish(tenant_id, location_id, device.id, command)
            .await
            .map_err(|e| {
                warn!("Command {} to device {} failed: {}", command.command_type, device.id, e);
                e
            })
    }
}

// 缺省边界取当前时间
fn time_range(start_ms: Option<i64>, end_ms: Option<i64>) -> HubResult<(i64, i64)> {
    let now = now_millis();
    let start = start_ms.unwrap_or(now);
    let end = end_ms.unwrap_or(now);
    if start > end {
        return Err(HubError::InvalidInput(format!(
            "Start time {} is after end time {}",
            start, end
        )));
    }
    Ok((start, end))
}

fn checked_name(name: &str) -> HubResult<String> {
    if !validate_device_name(name) {
        return Err(HubError::InvalidInput(
            "Device name must be non-blank and at most 50 characters".to_string(),
        ));
    }
    Ok(name.trim().to_string())
}
