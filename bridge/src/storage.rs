// 存储层 - PostgreSQL 持久化
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hub_shared::{
    DatabaseConfig, Device, DeviceId, DeviceRepository, DeviceStatus, HubError, HubResult,
    Location, LocationId, LocationRepository, NewDevice, NewTelemetrySample, TelemetryRepository,
    TelemetrySample, TenantId,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

// 建表语句，可重复执行
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        id BIGSERIAL PRIMARY KEY,
        tenant_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_locations_tenant ON locations (tenant_id)",
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id BIGSERIAL PRIMARY KEY,
        location_id BIGINT REFERENCES locations (id),
        mac_address TEXT NOT NULL UNIQUE,
        hardware_id TEXT NOT NULL UNIQUE,
        proof_of_possession TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'UNCLAIMED',
        name TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_devices_location ON devices (location_id)",
    r#"
    CREATE TABLE IF NOT EXISTS telemetry (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices (id),
        timestamp_ms BIGINT NOT NULL,
        temperature DOUBLE PRECISION,
        humidity DOUBLE PRECISION,
        pressure DOUBLE PRECISION,
        person_count INTEGER,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_telemetry_device_time ON telemetry (device_id, timestamp_ms)",
];

// 租户通过 location 关联得到
const DEVICE_COLUMNS: &str = r#"
    d.id, l.tenant_id, d.location_id, d.mac_address, d.hardware_id,
    d.proof_of_possession, d.status, d.name, d.created_at, d.updated_at
"#;

const TELEMETRY_COLUMNS: &str =
    "id, device_id, timestamp_ms, temperature, humidity, pressure, person_count, created_at";

// 租户归属经由设备当前的位置
fn tenant_telemetry_sql() -> String {
    format!(
        "SELECT {} FROM telemetry WHERE device_id IN (\
         SELECT d.id FROM devices d JOIN locations l ON l.id = d.location_id WHERE l.tenant_id = $1) \
         AND timestamp_ms BETWEEN $2 AND $3 ORDER BY device_id, timestamp_ms, id",
        TELEMETRY_COLUMNS
    )
}

fn db_err(err: sqlx::Error) -> HubError {
    HubError::Database(err.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct LocationRow {
    id: i64,
    tenant_id: i64,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Location {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: i64,
    tenant_id: Option<i64>,
    location_id: Option<i64>,
    mac_address: String,
    hardware_id: String,
    proof_of_possession: String,
    status: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = HubError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<DeviceStatus>().map_err(|_| {
            HubError::Database(format!("Device {} has unknown status {:?}", row.id, row.status))
        })?;

        Ok(Device {
            id: row.id,
            tenant_id: row.tenant_id,
            location_id: row.location_id,
            mac_address: row.mac_address,
            hardware_id: row.hardware_id,
            proof_of_possession: row.proof_of_possession,
            status,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TelemetryRow {
    id: i64,
    device_id: i64,
    timestamp_ms: i64,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    person_count: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<TelemetryRow> for TelemetrySample {
    fn from(row: TelemetryRow) -> Self {
        TelemetrySample {
            id: row.id,
            device_id: row.device_id,
            timestamp: row.timestamp_ms,
            temperature: row.temperature,
            humidity: row.humidity,
            pressure: row.pressure,
            person_count: row.person_count,
            created_at: row.created_at,
        }
    }
}

fn into_devices(rows: Vec<DeviceRow>) -> HubResult<Vec<Device>> {
    rows.into_iter().map(Device::try_from).collect()
}

// PostgreSQL 存储
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .with_context(|| "Failed to connect to database")?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to start migration")?;
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Migration failed: {}", statement.trim()))?;
        }
        tx.commit().await.context("Failed to commit migration")?;

        info!("Database schema is up to date");
        Ok(())
    }

    /// 健康检查
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_device(&self, query: DeviceQuery<'_>) -> HubResult<Option<Device>> {
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;
        row.map(Device::try_from).transpose()
    }
}

type DeviceQuery<'q> = sqlx::query::QueryAs<'q, sqlx::Postgres, DeviceRow, sqlx::postgres::PgArguments>;

fn device_select(filter: &str) -> String {
    format!(
        "SELECT {} FROM devices d LEFT JOIN locations l ON l.id = d.location_id WHERE {}",
        DEVICE_COLUMNS, filter
    )
}

#[async_trait]
impl LocationRepository for PgStore {
    async fn find_location_for_tenant(
        &self,
        tenant_id: TenantId,
        location_id: LocationId,
    ) -> HubResult<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT id, tenant_id, name, created_at FROM locations WHERE id = $1 AND tenant_id = $2",
        )
        .bind(location_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Location::from))
    }
}

#[async_trait]
impl DeviceRepository for PgStore {
    async fn find_device(&self, device_id: DeviceId) -> HubResult<Option<Device>> {
        let sql = device_select("d.id = $1");
        self.fetch_device(sqlx::query_as(&sql).bind(device_id)).await
    }

    async fn find_device_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<Option<Device>> {
        let sql = device_select("d.id = $1 AND l.tenant_id = $2");
        self.fetch_device(sqlx::query_as(&sql).bind(device_id).bind(tenant_id))
            .await
    }

    async fn find_device_by_mac(&self, mac_address: &str) -> HubResult<Option<Device>> {
        let sql = device_select("upper(d.mac_address) = upper($1)");
        self.fetch_device(sqlx::query_as(&sql).bind(mac_address)).await
    }

    async fn list_devices_for_tenant(&self, tenant_id: TenantId) -> HubResult<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM devices d JOIN locations l ON l.id = d.location_id \
             WHERE l.tenant_id = $1 ORDER BY d.id",
            DEVICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        into_devices(rows)
    }

    async fn device_exists_for_tenant(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> HubResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM devices d JOIN locations l ON l.id = d.location_id \
             WHERE d.id = $1 AND l.tenant_id = $2)",
        )
        .bind(device_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(exists)
    }

    async fn insert_device(&self, device: NewDevice) -> HubResult<Device> {
        let sql = format!(
            "WITH d AS (\
                INSERT INTO devices (mac_address, hardware_id, proof_of_possession, status, location_id, name) \
                VALUES ($1, $2, $3, $4, $5, $6) RETURNING *\
             ) SELECT {} FROM d LEFT JOIN locations l ON l.id = d.location_id",
            DEVICE_COLUMNS
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(&device.mac_address)
            .bind(&device.hardware_id)
            .bind(&device.proof_of_possession)
            .bind(device.status.as_str())
            .bind(device.location_id)
            .bind(&device.name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Device::try_from(row)
    }

    async fn save_device(&self, device: &Device) -> HubResult<Device> {
        let sql = format!(
            "WITH d AS (\
                UPDATE devices SET location_id = $2, name = $3, status = $4, updated_at = NOW() \
                WHERE id = $1 RETURNING *\
             ) SELECT {} FROM d LEFT JOIN locations l ON l.id = d.location_id",
            DEVICE_COLUMNS
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(device.id)
            .bind(device.location_id)
            .bind(&device.name)
            .bind(device.status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| HubError::not_found("Device", device.id))?;

        Device::try_from(row)
    }

    async fn update_device_status(&self, device_id: DeviceId, status: DeviceStatus) -> HubResult<()> {
        let result = sqlx::query("UPDATE devices SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(device_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(HubError::not_found("Device", device_id));
        }
        Ok(())
    }

    async fn delete_device(&self, device_id: DeviceId) -> HubResult<()> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(HubError::not_found("Device", device_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryRepository for PgStore {
    async fn insert_samples(&self, samples: &[NewTelemetrySample]) -> HubResult<u64> {
        // 同一条消息的样本在一个事务里写入
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0;

        for sample in samples {
            let result = sqlx::query(
                "INSERT INTO telemetry (device_id, timestamp_ms, temperature, humidity, pressure, person_count) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(sample.device_id)
            .bind(sample.timestamp)
            .bind(sample.temperature)
            .bind(sample.humidity)
            .bind(sample.pressure)
            .bind(sample.person_count)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn find_samples(
        &self,
        device_id: DeviceId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>> {
        let sql = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 AND timestamp_ms BETWEEN $2 AND $3 \
             ORDER BY timestamp_ms, id",
            TELEMETRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, TelemetryRow>(&sql)
            .bind(device_id)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(TelemetrySample::from).collect())
    }

    async fn find_samples_for_tenant(
        &self,
        tenant_id: TenantId,
        start_ms: i64,
        end_ms: i64,
    ) -> HubResult<Vec<TelemetrySample>> {
        let rows = sqlx::query_as::<_, TelemetryRow>(&tenant_telemetry_sql())
            .bind(tenant_id)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(TelemetrySample::from).collect())
    }

    async fn latest_sample(&self, device_id: DeviceId) -> HubResult<Option<TelemetrySample>> {
        let sql = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
            TELEMETRY_COLUMNS
        );
        let row = sqlx::query_as::<_, TelemetryRow>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(TelemetrySample::from))
    }

    async fn delete_samples_for_device(&self, device_id: DeviceId) -> HubResult<u64> {
        let result = sqlx::query("DELETE FROM telemetry WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
