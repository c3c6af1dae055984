//! 投递接口
//!
//! 核心只调用 [`Deliver`]；怎么把通知发到 Telegram/钉钉/邮件等目的地
//! 由外部实现 [`DeliveryTarget`] 决定。[`Forwarder`] 负责把记录格式化为
//! 文本并逐个发送到目标，失败只记录日志，不回传到核心。

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::BridgeSettings;
use crate::logging::LogSink;
use crate::record::NotificationRecord;

/// 每条通过去重的记录调用一次；不能阻塞，也不能失败
pub trait Deliver: Send + Sync {
    fn deliver(&self, record: &NotificationRecord);
}

impl<F> Deliver for F
where
    F: Fn(&NotificationRecord) + Send + Sync,
{
    fn deliver(&self, record: &NotificationRecord) {
        self(record)
    }
}

/// 单个投递目的地
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// 日志中显示的简称，例如 "TG"
    fn name(&self) -> &str;

    async fn send(&self, subject: &str, text: &str) -> anyhow::Result<()>;
}

/// 文本格式选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOptions {
    pub show_battery: bool,
    pub highlight_codes: bool,
    pub send_codes_separately: bool,
    pub code_prefix: String,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

impl MessageOptions {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            show_battery: settings.show_battery_in_message,
            highlight_codes: settings.enable_code_highlight,
            send_codes_separately: settings.code_send_separately,
            code_prefix: settings.code_separate_prefix.clone(),
        }
    }
}

fn battery_text(record: &NotificationRecord) -> String {
    match record.battery_percent {
        Some(level) => format!("{}%", level),
        None => "--".to_string(),
    }
}

pub fn subject(record: &NotificationRecord) -> String {
    format!("NekoLink: {}", record.app_identifier)
}

/// 主消息: 应用/标题/正文，空行后是验证码、电量、设备和时间
pub fn format_notification(record: &NotificationRecord, options: &MessageOptions) -> String {
    let mut lines = vec![format!("🔔 {}", record.app_identifier).trim().to_string()];
    if !record.title.is_empty() {
        lines.push(record.title.clone());
    }
    if !record.message.is_empty() {
        lines.push(record.message.clone());
    }
    lines.push(String::new());

    if options.highlight_codes && !record.extracted_codes.is_empty() {
        lines.push(format!("🔑 {}", record.extracted_codes.join(" ")));
    }
    if options.show_battery {
        lines.push(format!("🔋 {}", battery_text(record)));
    }
    lines.push(format!("📱 {}", record.device_id));
    if !record.date.is_empty() {
        lines.push(format!("🕒 {}", record.date));
    }

    lines.join("\n").trim().to_string()
}

/// 单独发送的验证码消息；没有验证码或未开启时返回 `None`
pub fn format_code_message(
    record: &NotificationRecord,
    options: &MessageOptions,
) -> Option<String> {
    if !options.highlight_codes
        || !options.send_codes_separately
        || record.extracted_codes.is_empty()
    {
        return None;
    }

    let mut lines = vec![format!(
        "{}: {}",
        options.code_prefix,
        record.extracted_codes.join(" ")
    )];
    if options.show_battery {
        lines.push(format!("🔋 {}", battery_text(record)));
    }
    lines.push(format!("📱 {}", record.device_id));
    Some(lines.join("\n").trim().to_string())
}

/// 格式化并发送到所有目标
pub struct Forwarder {
    targets: Vec<Arc<dyn DeliveryTarget>>,
    options: MessageOptions,
    log: Arc<dyn LogSink>,
}

impl Forwarder {
    pub fn new(options: MessageOptions, log: Arc<dyn LogSink>) -> Self {
        Self {
            targets: Vec::new(),
            options,
            log,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn DeliveryTarget>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn messages(&self, record: &NotificationRecord) -> Vec<String> {
        let mut messages = vec![format_notification(record, &self.options)];
        messages.extend(format_code_message(record, &self.options));
        messages
    }
}

impl Deliver for Forwarder {
    fn deliver(&self, record: &NotificationRecord) {
        if self.targets.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.log
                .log(&record.device_id, "no async runtime, notification not forwarded");
            return;
        };

        let messages = self.messages(record);
        let subject = subject(record);
        let targets = self.targets.clone();
        let log = self.log.clone();
        let device = record.device_id.clone();
        let app = record.app_identifier.clone();

        runtime.spawn(async move {
            for text in &messages {
                for target in &targets {
                    match target.send(&subject, text).await {
                        Ok(()) => log.log(&device, &format!("[{}] ok ({})", target.name(), app)),
                        Err(e) => log.log(&device, &format!("[{}] failed: {}", target.name(), e)),
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn record() -> NotificationRecord {
        NotificationRecord {
            timestamp: 0.0,
            device_id: "AA:BB:CC:DD:EE:FF".to_string(),
            app_identifier: "com.apple.MobileSMS".to_string(),
            title: "Bank".to_string(),
            subtitle: Some(String::new()),
            message: "Your code is 123456".to_string(),
            date: "20261016T101500".to_string(),
            battery_percent: Some(76),
            extracted_codes: vec!["123456".to_string()],
        }
    }

    #[test]
    fn test_format_notification() {
        let text = format_notification(&record(), &MessageOptions::default());
        assert_eq!(
            text,
            "🔔 com.apple.MobileSMS\nBank\nYour code is 123456\n\n🔑 123456\n🔋 76%\n📱 AA:BB:CC:DD:EE:FF\n🕒 20261016T101500"
        );
    }

    #[test]
    fn test_format_without_battery_or_codes() {
        let mut r = record();
        r.extracted_codes.clear();
        r.battery_percent = None;
        r.date.clear();
        let options = MessageOptions {
            show_battery: true,
            ..Default::default()
        };

        let text = format_notification(&r, &options);
        assert!(text.ends_with("\n\n🔋 --\n📱 AA:BB:CC:DD:EE:FF"));
        assert_eq!(format_code_message(&r, &options), None);
    }

    #[test]
    fn test_format_code_message() {
        let options = MessageOptions {
            show_battery: false,
            ..Default::default()
        };
        assert_eq!(
            format_code_message(&record(), &options).as_deref(),
            Some("🔑 Code: 123456\n📱 AA:BB:CC:DD:EE:FF")
        );

        let inline_only = MessageOptions {
            send_codes_separately: false,
            ..Default::default()
        };
        assert_eq!(format_code_message(&record(), &inline_only), None);
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<(String, String)>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryTarget for Recorder {
        fn name(&self) -> &str {
            "REC"
        }

        async fn send(&self, subject: &str, text: &str) -> anyhow::Result<()> {
            let _ = self.tx.send((subject.to_string(), text.to_string()));
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forwarder_sends_main_and_code_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink_logs = logs.clone();
        let sink =
            move |_: &str, message: &str| sink_logs.lock().unwrap().push(message.to_string());

        let forwarder = Forwarder::new(MessageOptions::default(), Arc::new(sink))
            .with_target(Arc::new(Recorder { tx, fail: true }));
        forwarder.deliver(&record());

        let (subject, first) = rx.recv().await.unwrap();
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(subject, "NekoLink: com.apple.MobileSMS");
        assert!(first.starts_with("🔔 com.apple.MobileSMS"));
        assert!(second.starts_with("🔑 Code: 123456"));

        // 失败只进日志，每条消息一行
        for _ in 0..100 {
            if logs.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 2);
        for line in logs.iter() {
            assert!(line.contains("[REC] failed: boom"), "unexpected log: {}", line);
        }
    }
}
