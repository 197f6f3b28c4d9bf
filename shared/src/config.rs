use crate::types::AppConfig;
use anyhow::Result;
use ::config::{Config, Environment, File};
use dotenvy::dotenv;
use std::env;
use tracing::info;

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let environment = env::var("ENV").unwrap_or_else(|_| "development".to_string());

    let settings = Config::builder()
        // 添加默认配置文件
        .add_source(File::with_name("config/default").required(false))
        // 添加环境特定配置文件
        .add_source(File::with_name(&format!("config/{}", environment)).required(false))
        // 环境变量：APP_MQTT__BROKER_HOST -> mqtt.broker_host
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    // 未设置的字段使用 Default
    let config: AppConfig = settings.try_deserialize()?;

    validate_config(&config)?;
    info!("Loaded configuration for environment: {}", environment);

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.database.url.trim().is_empty() {
        return Err(anyhow::anyhow!("Database URL cannot be empty"));
    }

    if config.database.max_connections == 0 {
        return Err(anyhow::anyhow!("Database max_connections must be positive"));
    }

    if config.database.min_connections > config.database.max_connections {
        return Err(anyhow::anyhow!(
            "Database min_connections ({}) exceeds max_connections ({})",
            config.database.min_connections,
            config.database.max_connections
        ));
    }

    if config.mqtt.broker_host.trim().is_empty() {
        return Err(anyhow::anyhow!("MQTT broker host cannot be empty"));
    }

    if config.mqtt.client_id.trim().is_empty() {
        return Err(anyhow::anyhow!("MQTT client id cannot be empty"));
    }

    if config.mqtt.request_channel_capacity == 0 {
        return Err(anyhow::anyhow!("MQTT request channel capacity must be positive"));
    }

    Ok(())
}
