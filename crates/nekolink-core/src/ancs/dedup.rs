//! 去重用的有界时间窗口表

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 512;

/// key -> 上次放行时间
///
/// 超过容量时先清掉窗口外的条目，仍然超出则淘汰最旧的条目。
#[derive(Debug)]
pub struct RecencyMap<K> {
    window: Duration,
    capacity: usize,
    last_seen: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> RecencyMap<K> {
    pub fn new(window: Duration) -> Self {
        Self::with_capacity(window, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            last_seen: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// 窗口内见过则返回 `false`；否则记录 `now` 并返回 `true`
    pub fn admit(&mut self, key: K, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(&key) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        let stamp = match self.last_seen.get(&key) {
            Some(last) if *last > now => *last,
            _ => now,
        };
        self.last_seen.insert(key, stamp);
        self.evict(now);
        true
    }

    fn evict(&mut self, now: Instant) {
        if self.last_seen.len() <= self.capacity {
            return;
        }
        let window = self.window;
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);

        while self.last_seen.len() > self.capacity {
            let oldest = self
                .last_seen
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.last_seen.remove(&key);
                }
                None => break,
            }
        }
    }
}
