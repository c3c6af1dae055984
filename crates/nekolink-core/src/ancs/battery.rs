//! 电量缓存
//!
//! 5 秒内的读数直接复用；过期后由会话重新读取，读取失败则继续使用上次的值。
//! 只有在会话 (重新) 连接时才会清空。

use std::time::Duration;
use tokio::time::Instant;

pub const BATTERY_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
pub struct BatteryCache {
    level: Option<u8>,
    read_at: Option<Instant>,
}

impl BatteryCache {
    /// 解析 Battery Level 特征值 (首字节, 0-100)
    pub fn parse_level(raw: &[u8]) -> Option<u8> {
        raw.first().copied().filter(|level| *level <= 100)
    }

    pub fn update(&mut self, level: u8, now: Instant) {
        self.level = Some(level);
        self.read_at = Some(now);
    }

    /// 用原始特征值更新，非法值被忽略
    pub fn update_raw(&mut self, raw: &[u8], now: Instant) -> Option<u8> {
        let level = Self::parse_level(raw)?;
        self.update(level, now);
        Some(level)
    }

    pub fn last_known(&self) -> Option<u8> {
        self.level
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.read_at
            .is_some_and(|at| now.saturating_duration_since(at) < BATTERY_TTL)
    }

    pub fn reset(&mut self) {
        self.level = None;
        self.read_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(BatteryCache::parse_level(&[87]), Some(87));
        assert_eq!(BatteryCache::parse_level(&[100, 1]), Some(100));
        assert_eq!(BatteryCache::parse_level(&[101]), None);
        assert_eq!(BatteryCache::parse_level(&[]), None);
    }

    #[test]
    fn test_freshness_and_fallback() {
        let start = Instant::now();
        let mut cache = BatteryCache::default();
        assert!(!cache.is_fresh(start));
        assert_eq!(cache.last_known(), None);

        cache.update(50, start);
        assert!(cache.is_fresh(start + Duration::from_secs(4)));
        assert!(!cache.is_fresh(start + Duration::from_secs(5)));

        // 过期但仍保留上次的值
        assert_eq!(cache.last_known(), Some(50));

        // 非法读数不覆盖旧值
        assert_eq!(cache.update_raw(&[200], start + Duration::from_secs(6)), None);
        assert_eq!(cache.last_known(), Some(50));

        cache.reset();
        assert_eq!(cache.last_known(), None);
    }
}
