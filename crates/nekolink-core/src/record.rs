//! 规范化的通知记录

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// 会话产出、交给投递方的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Unix 时间戳 (秒)
    pub timestamp: f64,
    /// iPhone 的 BLE 地址
    pub device_id: String,
    pub app_identifier: String,
    pub title: String,
    /// 只有请求了 Subtitle 才会有值
    pub subtitle: Option<String>,
    pub message: String,
    /// ANCS 原始日期串 (yyyyMMdd'T'HHmmSS)，原样透传
    pub date: String,
    pub battery_percent: Option<u8>,
    pub extracted_codes: Vec<String>,
}

/// 当前墙钟时间 (秒)
pub fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let record = NotificationRecord {
            timestamp: 1.5,
            device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            app_identifier: "com.apple.MobileSMS".to_string(),
            title: "Mom".to_string(),
            subtitle: None,
            message: "hi".to_string(),
            date: "20261016T101500".to_string(),
            battery_percent: Some(80),
            extracted_codes: vec![],
        };

        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["device_id"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["battery_percent"], 80);
        assert!(json["subtitle"].is_null());
    }

    #[test]
    fn test_wall_clock_is_positive() {
        assert!(wall_clock_seconds() > 0.0);
    }
}
