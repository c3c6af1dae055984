//! NekoLink Daemon
//!
//! 后台守护进程，负责：
//! - 读取配置并连接所有已配置的 iPhone
//! - 接收 ANCS 通知并输出到 stdout (文本或 JSON Lines)

mod service;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nekolink-daemon", version, about = "NekoLink - iPhone 通知转发守护进程")]
struct Args {
    /// 配置文件路径 (默认: <config_dir>/nekolink/settings.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 以 JSON Lines 输出通知记录
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 桥接 log crate（nekolink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 日志写到 stderr，stdout 留给通知输出
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nekolink_core=debug")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    tracing::info!("NekoLink Daemon starting...");

    let output = if args.json {
        service::Output::Json
    } else {
        service::Output::Text
    };
    service::run_service(args.config, output).await
}
