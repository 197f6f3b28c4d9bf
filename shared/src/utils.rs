use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// 2020-01-01T00:00:00Z，早于或等于此值的设备时间戳视为时钟未同步
pub const MIN_VALID_TIMESTAMP_MS: i64 = 1_577_836_800_000;

// 日志中载荷预览的最大长度
pub const PAYLOAD_PREVIEW_LEN: usize = 256;

// UUID 生成工具函数
pub fn generate_hardware_id() -> String {
    Uuid::new_v4().to_string()
}

// 时间工具函数
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 缺失或不可信的时间戳替换为 `now_ms`
pub fn sanitize_timestamp(timestamp: Option<i64>, now_ms: i64) -> i64 {
    match timestamp {
        Some(ts) if ts > MIN_VALID_TIMESTAMP_MS => ts,
        _ => now_ms,
    }
}

// 六组十六进制，整串只能用同一种分隔符
const MAC_PATTERN: &str =
    r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$|^[0-9A-Fa-f]{2}(-[0-9A-Fa-f]{2}){5}$";

fn mac_regex() -> Option<&'static Regex> {
    static MAC_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    MAC_REGEX.get_or_init(|| Regex::new(MAC_PATTERN).ok()).as_ref()
}

// 验证工具函数
pub fn is_valid_mac_address(mac: &str) -> bool {
    mac_regex().is_some_and(|re| re.is_match(mac))
}

/// 统一为大写冒号形式，如 `AA:BB:CC:DD:EE:FF`；不做空白裁剪
pub fn normalize_mac_address(mac: &str) -> Option<String> {
    if !is_valid_mac_address(mac) {
        return None;
    }
    Some(mac.replace('-', ":").to_ascii_uppercase())
}

pub fn validate_device_name(name: &str) -> bool {
    !name.trim().is_empty() && name.chars().count() <= 50
}

// 字符串工具函数
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// 供日志使用的载荷预览，非 UTF-8 字节做有损替换
pub fn payload_preview(payload: &[u8]) -> String {
    truncate_string(&String::from_utf8_lossy(payload), PAYLOAD_PREVIEW_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_id_generation() {
        let id1 = generate_hardware_id();
        let id2 = generate_hardware_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // 标准UUID长度
    }

    #[test]
    fn test_timestamp_sanitizing() {
        let now = 1_700_000_000_000;
        assert_eq!(sanitize_timestamp(None, now), now);
        assert_eq!(sanitize_timestamp(Some(0), now), now);
        assert_eq!(sanitize_timestamp(Some(12_345), now), now);
        assert_eq!(sanitize_timestamp(Some(MIN_VALID_TIMESTAMP_MS), now), now);
        assert_eq!(sanitize_timestamp(Some(MIN_VALID_TIMESTAMP_MS + 1), now), MIN_VALID_TIMESTAMP_MS + 1);
        assert_eq!(sanitize_timestamp(Some(1_690_000_000_000), now), 1_690_000_000_000);
    }

    #[test]
    fn test_mac_pattern_compiles() {
        assert!(mac_regex().is_some());
    }

    #[test]
    fn test_mac_validation() {
        assert!(is_valid_mac_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_mac_address("aa-bb-cc-dd-ee-ff"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac_address("AABBCCDDEEFF"));
        assert!(!is_valid_mac_address("GG:BB:CC:DD:EE:FF"));
        assert!(!is_valid_mac_address("AA:BB-CC:DD-EE:FF"));
        assert!(!is_valid_mac_address(" AA:BB:CC:DD:EE:FF"));
        assert!(!is_valid_mac_address("AA:BB:CC:DD:EE:FF\n"));
    }

    #[test]
    fn test_mac_normalization() {
        assert_eq!(
            normalize_mac_address("aa-bb-cc-dd-ee-0f").as_deref(),
            Some("AA:BB:CC:DD:EE:0F")
        );
        assert_eq!(normalize_mac_address("01:02:03:04:05:06").as_deref(), Some("01:02:03:04:05:06"));
        assert_eq!(normalize_mac_address(" 01:02:03:04:05:06 "), None);
        assert_eq!(normalize_mac_address("nope"), None);
    }

    #[test]
    fn test_device_name_validation() {
        assert!(validate_device_name("Living room sensor"));
        assert!(!validate_device_name("   "));
        assert!(!validate_device_name(&"x".repeat(51)));
    }

    #[test]
    fn test_string_truncation() {
        let long_string = "This is a very long string that needs to be truncated";
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string(long_string, 20), "This is a very lo...");
        assert_eq!(truncate_string("温度温度温度", 5), "温度...");
    }

    #[test]
    fn test_payload_preview_handles_binary() {
        let preview = payload_preview(&[0xff, 0xfe, b'o', b'k']);
        assert!(preview.ends_with("ok"));
    }
}
