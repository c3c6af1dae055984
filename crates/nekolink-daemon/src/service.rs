//! Core Service - 设备管理和通知输出

use anyhow::{Context, Result};
use async_trait::async_trait;
use nekolink_core::{
    BleClient, BridgeSettings, Deliver, DeliveryTarget, DeviceManager, Forwarder, MessageOptions,
    NotificationRecord, TracingLogSink,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// 与转发到聊天工具的文本相同
    Text,
    /// 每条记录一行 JSON
    Json,
}

/// 把格式化后的消息打印到 stdout
struct StdoutTarget;

#[async_trait]
impl DeliveryTarget for StdoutTarget {
    fn name(&self) -> &str {
        "STDOUT"
    }

    async fn send(&self, subject: &str, text: &str) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "=== {} ===\n{}\n", subject, text)?;
        out.flush()?;
        Ok(())
    }
}

struct JsonLines;

impl Deliver for JsonLines {
    fn deliver(&self, record: &NotificationRecord) {
        match serde_json::to_string(record) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("无法序列化通知: {}", e),
        }
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<BridgeSettings> {
    let settings = match path {
        Some(path) => BridgeSettings::load_from(&path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?,
        None => {
            tracing::info!("配置文件: {:?}", BridgeSettings::config_path());
            BridgeSettings::load()
        }
    };
    settings
        .validate()
        .context("配置无效，请先用 `nekolink config add-device <ADDRESS>` 添加设备")?;
    Ok(settings)
}

pub async fn run_service(config: Option<PathBuf>, output: Output) -> Result<()> {
    tracing::info!("核心服务初始化...");

    let settings = Arc::new(load_settings(config)?);
    let log = Arc::new(TracingLogSink);

    let delivery: Arc<dyn Deliver> = match output {
        Output::Text => Arc::new(
            Forwarder::new(MessageOptions::from_settings(&settings), log.clone())
                .with_target(Arc::new(StdoutTarget)),
        ),
        Output::Json => Arc::new(JsonLines),
    };

    let transport = BleClient::new().await.context("无法初始化蓝牙适配器")?;
    let mut manager = DeviceManager::new(settings.clone(), Arc::new(transport), delivery, log);

    let started = manager.start_all(&settings.addresses())?;
    tracing::info!("已启动 {} 个设备会话", started);

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，正在断开设备...");

    for (address, phase) in manager.phases() {
        tracing::debug!("{}: {}", address, phase);
    }
    manager.shutdown(SHUTDOWN_GRACE).await;

    tracing::info!("NekoLink Daemon stopped");
    Ok(())
}
