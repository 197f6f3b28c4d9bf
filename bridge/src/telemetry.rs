use hub_shared::{
    now_millis, sanitize_timestamp, Device, DeviceId, HubResult, NewTelemetrySample,
    TelemetryReading, TelemetryRepository,
};
use std::sync::Arc;
use tracing::debug;

// 遥测写入
#[derive(Clone)]
pub struct TelemetrySink {
    telemetry: Arc<dyn TelemetryRepository>,
}

impl TelemetrySink {
    pub fn new(telemetry: Arc<dyn TelemetryRepository>) -> Self {
        Self { telemetry }
    }

    pub async fn record(&self, device: &Device, reading: TelemetryReading) -> HubResult<u64> {
        self.record_batch(device, &[reading]).await
    }

    /// 设备已由调用方解析，整批共用；不做去重
    pub async fn record_batch(&self, device: &Device, readings: &[TelemetryReading]) -> HubResult<u64> {
        if readings.is_empty() {
            return Ok(0);
        }

        let samples = build_samples(device.id, readings, now_millis());
        let stored = self.telemetry.insert_samples(&samples).await?;

        debug!("Stored {} telemetry samples for device {}", stored, device.id);
        Ok(stored)
    }
}

/// 同一批次使用同一个接收时间替换无效时间戳
pub fn build_samples(device_id: DeviceId, readings: &[TelemetryReading], now_ms: i64) -> Vec<NewTelemetrySample> {
    readings
        .iter()
        .map(|reading| NewTelemetrySample {
            device_id,
            timestamp: sanitize_timestamp(reading.timestamp, now_ms),
            temperature: reading.temperature,
            humidity: reading.humidity,
            pressure: reading.pressure,
            person_count: reading.person_count,
        })
        .collect()
}
