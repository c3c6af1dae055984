//! NekoLink CLI
//!
//! 扫描附近的设备并维护配置文件，守护进程启动时读取同一份配置

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nekolink_core::{BleScanner, BridgeSettings};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nekolink", version, about = "NekoLink - iPhone 通知转发")]
struct Cli {
    /// 配置文件路径 (默认: <config_dir>/nekolink/settings.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描超时时间 (秒)，默认取配置
        #[arg(short, long)]
        timeout: Option<u64>,
        /// 名称过滤 (不区分大小写)，默认取配置
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// 查看或修改配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前配置
    Show,
    /// 打印配置文件路径
    Path,
    /// 添加设备地址
    AddDevice { address: String },
    /// 移除设备地址
    RemoveDevice { address: String },
    /// 设置去重窗口 (秒)
    SetDedup { seconds: u64 },
}

struct Store {
    path: PathBuf,
}

impl Store {
    fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.unwrap_or_else(BridgeSettings::config_path),
        }
    }

    fn load(&self) -> Result<BridgeSettings> {
        if !self.path.exists() {
            return Ok(BridgeSettings::default());
        }
        BridgeSettings::load_from(&self.path)
            .with_context(|| format!("读取配置失败: {}", self.path.display()))
    }

    fn save(&self, settings: &BridgeSettings) -> Result<()> {
        settings
            .save_to(&self.path)
            .with_context(|| format!("保存配置失败: {}", self.path.display()))
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

async fn scan(
    settings: &BridgeSettings,
    timeout: Option<u64>,
    filter: Option<String>,
) -> Result<()> {
    let timeout = timeout
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| settings.scan_timeout());
    let filter = filter.unwrap_or_else(|| settings.scan_name_filter.clone());

    println!("🔍 扫描设备 ({}s, 过滤: \"{}\")...", timeout.as_secs(), filter);

    let scanner = BleScanner::new().await.context("无法初始化蓝牙适配器")?;
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    let devices = scanner.scan(timeout, &filter, &cancel).await?;
    if cancel.is_cancelled() {
        println!("   已取消");
    } else if devices.is_empty() {
        println!("   未发现设备");
    } else {
        for (i, dev) in devices.iter().enumerate() {
            println!("   [{}] {} ({}) {} dBm", i, dev.name, dev.address, dev.rssi);
        }
    }
    Ok(())
}

fn config(store: &Store, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = store.load()?;
            print!("{}", toml::to_string_pretty(&settings)?);
        }
        ConfigAction::Path => {
            println!("{}", store.path.display());
        }
        ConfigAction::AddDevice { address } => {
            let address = address.trim().to_uppercase();
            anyhow::ensure!(!address.is_empty(), "地址不能为空");

            let mut settings = store.load()?;
            if settings.ble_addresses.iter().any(|a| same_address(a, &address)) {
                println!("设备已存在: {}", address);
                return Ok(());
            }
            settings.ble_addresses.push(address.clone());
            store.save(&settings)?;
            println!("✅ 已添加设备: {}", address);
        }
        ConfigAction::RemoveDevice { address } => {
            let mut settings = store.load()?;
            let before = settings.ble_addresses.len();
            settings.ble_addresses.retain(|a| !same_address(a, &address));
            if settings.ble_addresses.len() == before {
                anyhow::bail!("未找到设备: {}", address.trim());
            }
            store.save(&settings)?;
            println!("🗑️  已移除设备: {}", address.trim());
        }
        ConfigAction::SetDedup { seconds } => {
            let mut settings = store.load()?;
            settings.dedup_seconds = seconds.max(1);
            store.save(&settings)?;
            println!("去重窗口: {}s", settings.dedup_seconds);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let store = Store::new(cli.config);
    match cli.command {
        Commands::Scan { timeout, filter } => {
            let settings = store.load()?;
            scan(&settings, timeout, filter).await?;
        }
        Commands::Config { action } => config(&store, action)?,
    }

    Ok(())
}
