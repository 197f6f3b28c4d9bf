use anyhow::Result;
use async_trait::async_trait;
use hub_shared::{MqttConfig, MqttError, QoS, TopicFilter, Transport};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS as RumqttQoS};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::IngestionDispatcher;

fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

// Bridge MQTT 客户端
#[derive(Clone)]
pub struct BridgeMqttClient {
    client: AsyncClient,
    config: MqttConfig,
}

impl BridgeMqttClient {
    pub fn new(config: MqttConfig) -> Result<(Self, EventLoop)> {
        let mut mqtt_options = rumqttc::MqttOptions::new(
            config.client_id.clone(),
            &config.broker_host,
            config.broker_port,
        );

        // 设置认证信息
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        // 设置保持连接
        mqtt_options.set_keep_alive(StdDuration::from_secs(config.keep_alive));
        mqtt_options.set_clean_session(config.clean_session);

        let (client, event_loop) = AsyncClient::new(mqtt_options, config.request_channel_capacity);

        Ok((Self { client, config }, event_loop))
    }

    /// 启动事件循环任务，直到 shutdown 被触发
    pub fn start(
        &self,
        event_loop: EventLoop,
        dispatcher: Arc<IngestionDispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        info!(
            "Starting MQTT client {} for {}:{}",
            self.config.client_id, self.config.broker_host, self.config.broker_port
        );

        let client = self.client.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            run_event_loop(client, config, event_loop, dispatcher, shutdown).await;
        })
    }
}

#[async_trait]
impl Transport for BridgeMqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        self.client
            .publish(topic, to_rumqtt_qos(qos), false, payload)
            .await
            .map_err(|e| MqttError::Publish(format!("{}: {}", topic, e)))?;

        debug!("Published MQTT message to topic: {}", topic);
        Ok(())
    }
}

// 订阅主题
async fn subscribe_filter(client: &AsyncClient, topic_filter: &TopicFilter) -> Result<(), MqttError> {
    client
        .subscribe(&topic_filter.topic_pattern, to_rumqtt_qos(topic_filter.qos))
        .await
        .map_err(|e| MqttError::Subscribe(format!("{}: {}", topic_filter.topic_pattern, e)))?;

    info!("Subscribed to MQTT topic: {}", topic_filter.topic_pattern);
    Ok(())
}

async fn subscribe_inbound(client: AsyncClient, filters: Vec<TopicFilter>) {
    for filter in &filters {
        if let Err(e) = subscribe_filter(&client, filter).await {
            error!("{}", e);
        }
    }
}

// 运行事件循环
async fn run_event_loop(
    client: AsyncClient,
    config: MqttConfig,
    mut event_loop: EventLoop,
    dispatcher: Arc<IngestionDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting MQTT event loop");
    let reconnect_delay = StdDuration::from_millis(config.reconnect_interval_ms);

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                info!("MQTT connection established: {:?}", connack.code);

                // 每次重连都重新订阅；在独立任务中发送，避免阻塞 poll
                tokio::spawn(subscribe_inbound(client.clone(), TopicFilter::inbound(&config)));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // 每条消息一个任务，处理失败不影响事件循环
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(&publish.topic, &publish.payload).await;
                });
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!("Subscription acknowledged: {:?}", suback.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker requested disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}; retrying in {:?}", e, reconnect_delay);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    disconnect(&client, &mut event_loop).await;
    info!("MQTT event loop stopped");
}

// 发送 DISCONNECT 并等待其写出
async fn disconnect(client: &AsyncClient, event_loop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        warn!("Failed to queue MQTT disconnect: {}", e);
        return;
    }

    let flush = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    if tokio::time::timeout(StdDuration::from_secs(2), flush).await.is_err() {
        warn!("Timed out waiting for MQTT disconnect to flush");
    }
}
