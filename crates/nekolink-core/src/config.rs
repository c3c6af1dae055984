//! 应用配置和持久化
//!
//! 会话启动时拿到的是一份不可变快照 (`Arc<BridgeSettings>`)，
//! 修改配置只会在下次 (重新) 启动会话时生效。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ancs::codec::AttributeRequestProfile;

pub const DEFAULT_CODE_REGEX: &str = r"\b\d{4,8}\b";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No device address configured")]
    NoDevices,

    #[error("Invalid code pattern: {0}")]
    InvalidCodePattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 桥接设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// 要连接的 iPhone BLE 地址
    pub ble_addresses: Vec<String>,

    /// 去重窗口 (秒)，最小按 1 秒处理
    pub dedup_seconds: u64,

    /// 屏蔽关键词
    pub block_keywords: Vec<String>,
    pub block_case_insensitive: bool,

    /// 验证码提取
    pub enable_code_highlight: bool,
    pub code_regex: String,
    pub code_send_separately: bool,
    pub code_separate_prefix: String,

    pub show_battery_in_message: bool,

    /// 属性请求
    pub request_subtitle: bool,
    pub title_max_len: u16,
    pub subtitle_max_len: u16,
    pub message_max_len: u16,

    pub connect_timeout_secs: u64,

    /// 扫描
    pub scan_timeout_secs: u64,
    pub scan_name_filter: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let profile = AttributeRequestProfile::default();
        Self {
            ble_addresses: Vec::new(),
            dedup_seconds: 8,
            block_keywords: Vec::new(),
            block_case_insensitive: true,
            enable_code_highlight: true,
            code_regex: DEFAULT_CODE_REGEX.to_string(),
            code_send_separately: true,
            code_separate_prefix: "🔑 Code".to_string(),
            show_battery_in_message: true,
            request_subtitle: true,
            title_max_len: profile.title_max_len,
            subtitle_max_len: profile.subtitle_max_len.unwrap_or(64),
            message_max_len: profile.message_max_len,
            connect_timeout_secs: 30,
            scan_timeout_secs: 8,
            scan_name_filter: "heart rate".to_string(),
        }
    }
}

impl BridgeSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nekolink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("{}, using defaults", e),
            }
        }
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let settings = toml::from_str(&content)?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 启动会话前的检查
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses().is_empty() {
            return Err(ConfigError::NoDevices);
        }
        regex::Regex::new(&self.code_regex)?;
        Ok(())
    }

    /// 去掉空白项后的地址列表
    pub fn addresses(&self) -> Vec<String> {
        self.ble_addresses
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect()
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_seconds.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }

    pub fn request_profile(&self) -> AttributeRequestProfile {
        AttributeRequestProfile {
            title_max_len: self.title_max_len,
            subtitle_max_len: self.request_subtitle.then_some(self.subtitle_max_len),
            message_max_len: self.message_max_len,
        }
    }
}
