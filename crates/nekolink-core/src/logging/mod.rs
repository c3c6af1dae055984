//! 日志模块
//!
//! 会话和管理器通过 [`LogSink`] 报告每台设备的运行状况，
//! 供 UI/守护进程展示。实现不能阻塞，也不能失败。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 设备级日志出口
pub trait LogSink: Send + Sync {
    fn log(&self, device: &str, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn log(&self, device: &str, message: &str) {
        self(device, message)
    }
}

/// 写入 `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, device: &str, message: &str) {
        log::info!(target: "nekolink::device", "[{}] {}", device, message);
    }
}

/// 日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub device: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// 发送到 channel，队列满时丢弃
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::Sender<LogEntry>,
}

impl ChannelLogSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn log(&self, device: &str, message: &str) {
        let _ = self.tx.try_send(LogEntry::new(device, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_never_blocks() {
        let (sink, mut rx) = ChannelLogSink::new(1);
        sink.log("AA", "first");
        sink.log("AA", "dropped");

        assert_eq!(rx.try_recv().unwrap(), LogEntry::new("AA", "first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |device: &str, message: &str| {
            seen.lock().unwrap().push(format!("{device}:{message}"));
        };
        sink.log("BB", "hello");
        assert_eq!(*seen.lock().unwrap(), vec!["BB:hello".to_string()]);
    }
}
