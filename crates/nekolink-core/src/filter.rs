//! 屏蔽关键词和验证码提取

use regex::Regex;

use crate::config::{BridgeSettings, ConfigError};

/// 从配置编译出的过滤器
#[derive(Debug, Clone)]
pub struct NotificationFilter {
    keywords: Vec<String>,
    case_insensitive: bool,
    code_pattern: Option<Regex>,
}

impl NotificationFilter {
    pub fn new(
        keywords: &[String],
        case_insensitive: bool,
        code_pattern: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let keywords = keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|k| {
                if case_insensitive {
                    k.to_lowercase()
                } else {
                    k.clone()
                }
            })
            .collect();
        let code_pattern = code_pattern.map(Regex::new).transpose()?;
        Ok(Self {
            keywords,
            case_insensitive,
            code_pattern,
        })
    }

    pub fn from_settings(settings: &BridgeSettings) -> Result<Self, ConfigError> {
        let pattern = settings
            .enable_code_highlight
            .then_some(settings.code_regex.as_str());
        Self::new(
            &settings.block_keywords,
            settings.block_case_insensitive,
            pattern,
        )
    }

    /// `haystack` 是否包含任一屏蔽词
    pub fn is_blocked(&self, haystack: &str) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        if self.case_insensitive {
            let lowered = haystack.to_lowercase();
            self.keywords.iter().any(|k| lowered.contains(k.as_str()))
        } else {
            self.keywords.iter().any(|k| haystack.contains(k.as_str()))
        }
    }

    /// 提取验证码，按首次出现顺序去重；未启用时返回空
    pub fn extract_codes(&self, text: &str) -> Vec<String> {
        let Some(pattern) = &self.code_pattern else {
            return Vec::new();
        };
        let mut codes: Vec<String> = Vec::new();
        for m in pattern.find_iter(text) {
            if !codes.iter().any(|c| c == m.as_str()) {
                codes.push(m.as_str().to_string());
            }
        }
        codes
    }
}
