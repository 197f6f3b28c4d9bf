use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{DeviceId, LocationId, TenantId};
use crate::utils::normalize_mac_address;

mod qos_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use super::QoS;

    pub fn serialize<S>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        QoS::try_from(value).map_err(serde::de::Error::custom)
    }
}

// MQTT 消息质量等级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(format!("Invalid QoS value: {}", value)),
        }
    }
}

// 主题中的消息类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Telemetry,
    Status,
    Command,
}

impl MessageKind {
    /// 主题最后一段
    pub fn as_segment(&self) -> &'static str {
        match self {
            MessageKind::Telemetry => "telemetry",
            MessageKind::Status => "status",
            MessageKind::Command => "cmd",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_segment())
    }
}

impl FromStr for MessageKind {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(MessageKind::Telemetry),
            "status" => Ok(MessageKind::Status),
            "cmd" => Ok(MessageKind::Command),
            other => Err(TopicError::UnknownKind(other.to_string())),
        }
    }
}

/// 主题中引用的设备：租户作用域的数字 ID，或旧版的 MAC 地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    // customer/{tenant}/location/{location}/device/{device}/{kind}
    Scoped {
        tenant_id: TenantId,
        location_id: LocationId,
        device_id: DeviceId,
    },
    // {namespace}/device/{mac}/{kind}，只解码不编码
    Hardware {
        namespace: String,
        mac_address: String,
    },
}

// 解码后的路由键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub address: DeviceAddress,
    pub kind: MessageKind,
}

impl RoutingKey {
    pub fn scoped(tenant_id: TenantId, location_id: LocationId, device_id: DeviceId, kind: MessageKind) -> Self {
        Self {
            address: DeviceAddress::Scoped {
                tenant_id,
                location_id,
                device_id,
            },
            kind,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        match &self.address {
            DeviceAddress::Scoped { tenant_id, .. } => Some(*tenant_id),
            DeviceAddress::Hardware { .. } => None,
        }
    }

    pub fn location_id(&self) -> Option<LocationId> {
        match &self.address {
            DeviceAddress::Scoped { location_id, .. } => Some(*location_id),
            DeviceAddress::Hardware { .. } => None,
        }
    }

    pub fn mac_address(&self) -> Option<&str> {
        match &self.address {
            DeviceAddress::Scoped { .. } => None,
            DeviceAddress::Hardware { mac_address, .. } => Some(mac_address),
        }
    }

    /// 重新编码为规范的数字主题；MAC 形式不可编码
    pub fn to_topic(&self) -> Result<String, TopicError> {
        match &self.address {
            DeviceAddress::Scoped {
                tenant_id,
                location_id,
                device_id,
            } => Ok(encode_topic(*tenant_id, *location_id, *device_id, self.kind)),
            DeviceAddress::Hardware { mac_address, .. } => {
                Err(TopicError::NotEncodable(mac_address.clone()))
            }
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            DeviceAddress::Scoped {
                tenant_id,
                location_id,
                device_id,
            } => write!(
                f,
                "tenant={} location={} device={} kind={}",
                tenant_id, location_id, device_id, self.kind
            ),
            DeviceAddress::Hardware {
                namespace,
                mac_address,
            } => write!(f, "namespace={} mac={} kind={}", namespace, mac_address, self.kind),
        }
    }
}

const SCOPED_ROOT: &str = "customer";

/// 严格解析主题字符串。允许一个前导 `/`，其余必须完全匹配两种格式之一。
pub fn decode_topic(topic: &str) -> Result<RoutingKey, TopicError> {
    let path = topic.strip_prefix('/').unwrap_or(topic);
    let parts: Vec<&str> = path.split('/').collect();

    match parts.as_slice() {
        [SCOPED_ROOT, tenant, "location", location, "device", device, kind] => {
            let kind = kind.parse::<MessageKind>()?;
            Ok(RoutingKey::scoped(
                parse_id("tenant", tenant)?,
                parse_id("location", location)?,
                parse_id("device", device)?,
                kind,
            ))
        }
        [namespace, "device", mac, kind] if !namespace.is_empty() => {
            let kind = kind.parse::<MessageKind>()?;
            let mac_address = normalize_mac_address(mac)
                .ok_or_else(|| TopicError::InvalidHardwareId(mac.to_string()))?;
            Ok(RoutingKey {
                address: DeviceAddress::Hardware {
                    namespace: namespace.to_string(),
                    mac_address,
                },
                kind,
            })
        }
        _ => Err(TopicError::InvalidShape(topic.to_string())),
    }
}

/// 构建规范主题 `customer/{t}/location/{l}/device/{d}/{kind}`
pub fn encode_topic(
    tenant_id: TenantId,
    location_id: LocationId,
    device_id: DeviceId,
    kind: MessageKind,
) -> String {
    format!(
        "{}/{}/location/{}/device/{}/{}",
        SCOPED_ROOT,
        tenant_id,
        location_id,
        device_id,
        kind.as_segment()
    )
}

pub fn command_topic(tenant_id: TenantId, location_id: LocationId, device_id: DeviceId) -> String {
    encode_topic(tenant_id, location_id, device_id, MessageKind::Command)
}

// 只接受 ASCII 数字，拒绝符号和空段
fn parse_id(segment: &'static str, value: &str) -> Result<i64, TopicError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TopicError::InvalidSegment {
            segment,
            value: value.to_string(),
        });
    }

    value.parse::<i64>().map_err(|_| TopicError::InvalidSegment {
        segment,
        value: value.to_string(),
    })
}

// 主题错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("Topic does not match any known grammar: {0}")]
    InvalidShape(String),

    #[error("Invalid {segment} id segment: {value:?}")]
    InvalidSegment { segment: &'static str, value: String },

    #[error("Invalid hardware id segment: {0:?}")]
    InvalidHardwareId(String),

    #[error("Unknown message kind: {0:?}")]
    UnknownKind(String),

    #[error("Hardware-addressed key cannot be encoded: {0}")]
    NotEncodable(String),
}

// MQTT 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: u64,
    pub clean_session: bool,
    pub reconnect_interval_ms: u64,
    pub request_channel_capacity: usize,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    /// 旧版扁平主题的前缀，None 表示不订阅
    pub legacy_namespace: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "sensor-hub-bridge".to_string(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: false,
            reconnect_interval_ms: 5000,
            request_channel_capacity: 100,
            qos: QoS::AtLeastOnce,
            legacy_namespace: Some("smart-led".to_string()),
        }
    }
}

// MQTT 错误类型
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),
}

// 主题过滤器
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFilter {
    pub topic_pattern: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(topic_pattern: String, qos: QoS) -> Self {
        Self {
            topic_pattern,
            qos,
        }
    }

    // 所有租户的某类消息
    pub fn all_scoped(kind: MessageKind, qos: QoS) -> Self {
        Self::new(
            format!("{}/+/location/+/device/+/{}", SCOPED_ROOT, kind.as_segment()),
            qos,
        )
    }

    // 旧版扁平主题
    pub fn legacy(namespace: &str, kind: MessageKind, qos: QoS) -> Self {
        Self::new(format!("{}/device/+/{}", namespace, kind.as_segment()), qos)
    }

    /// 入站订阅列表：只订阅遥测和状态，命令只下发
    pub fn inbound(config: &MqttConfig) -> Vec<Self> {
        let mut filters = vec![
            Self::all_scoped(MessageKind::Telemetry, config.qos),
            Self::all_scoped(MessageKind::Status, config.qos),
        ];

        if let Some(namespace) = config.legacy_namespace.as_deref().filter(|ns| !ns.is_empty()) {
            filters.push(Self::legacy(namespace, MessageKind::Telemetry, config.qos));
            filters.push(Self::legacy(namespace, MessageKind::Status, config.qos));
        }

        filters
    }
}

/// 消息传输层：命令发布器通过它把消息交给 broker
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError>;
}
