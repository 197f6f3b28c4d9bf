use anyhow::{Context, Result};
use hub_bridge::mqtt_client::BridgeMqttClient;
use hub_bridge::storage::PgStore;
use hub_bridge::Hub;
use hub_shared::load_config;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sensor Hub Bridge...");

    // 加载配置
    let config = load_config().context("Failed to load configuration")?;
    info!(
        "MQTT broker {}:{}, legacy namespace {:?}",
        config.mqtt.broker_host, config.mqtt.broker_port, config.mqtt.legacy_namespace
    );

    // 初始化数据库连接
    info!("Initializing database connection...");
    let store = Arc::new(PgStore::connect(&config.database).await?);
    if config.ingestion.run_migrations {
        store.run_migrations().await?;
    }
    if !store.health_check().await {
        warn!("Database health check failed; continuing, queries will be retried per message");
    }
    info!("Database connected successfully");

    // 创建 MQTT 客户端
    let (mqtt_client, event_loop) =
        BridgeMqttClient::new(config.mqtt.clone()).context("Failed to create MQTT client")?;
    let mqtt_client = Arc::new(mqtt_client);

    let hub = Hub::new(store.clone(), mqtt_client.clone(), config.mqtt.qos);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_loop_task = mqtt_client.start(event_loop, hub.dispatcher.clone(), shutdown_rx);

    info!("Sensor Hub Bridge started successfully");

    // 保持服务运行
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping Sensor Hub Bridge...");

    shutdown_tx.send(true).ok();
    if let Err(e) = event_loop_task.await {
        warn!("MQTT event loop task failed: {}", e);
    }
    store.close().await;

    info!("Sensor Hub Bridge stopped");
    Ok(())
}
