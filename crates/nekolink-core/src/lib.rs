//! NekoLink Core Library
//!
//! 通过 BLE 上的 Apple Notification Center Service (ANCS) 接收 iPhone 通知，
//! 解析后交给外部投递目标 (聊天机器人、Webhook、邮件等)。
//!
//! # 模块
//!
//! - **ancs**: 属性请求编解码、单设备会话、断线重连
//! - **ble**: btleplug 传输层和设备扫描
//! - **manager**: 多设备管理和跨设备去重
//! - **config**: 配置文件读写
//! - **filter**: 屏蔽词和验证码提取
//! - **delivery**: 投递接口和消息格式化
//! - **logging**: 设备级日志出口
//!
//! # 使用示例
//!
//! ```ignore
//! use nekolink_core::{BleClient, BridgeSettings, DeviceManager, Forwarder, MessageOptions, TracingLogSink};
//! use std::sync::Arc;
//!
//! let settings = Arc::new(BridgeSettings::load());
//! settings.validate()?;
//!
//! let log = Arc::new(TracingLogSink);
//! let forwarder = Forwarder::new(MessageOptions::from_settings(&settings), log.clone())
//!     .with_target(my_target);
//!
//! let mut manager = DeviceManager::new(
//!     settings.clone(),
//!     Arc::new(BleClient::new().await?),
//!     Arc::new(forwarder),
//!     log,
//! );
//! manager.start_all(&settings.addresses())?;
//! tokio::signal::ctrl_c().await?;
//! manager.shutdown(std::time::Duration::from_secs(5)).await;
//! ```

pub mod ancs;
pub mod ble;
pub mod config;
pub mod delivery;
pub mod filter;
pub mod logging;
pub mod manager;
pub mod record;

// ANCS re-exports
pub use ancs::{
    AncsSession, AttributeId, AttributeRequestProfile, AttributeSet, Backoff, CodecError,
    ReconnectSupervisor, SessionExit, SessionPhase,
};

// BLE re-exports
pub use ble::{
    AncsCharacteristic, AncsLink, AncsTransport, BleClient, BleError, BleScanner, Connection,
    DiscoveredDevice, LinkEvent,
};

pub use config::{BridgeSettings, ConfigError};
pub use delivery::{Deliver, DeliveryTarget, Forwarder, MessageOptions};
pub use filter::NotificationFilter;
pub use logging::{ChannelLogSink, LogEntry, LogSink, TracingLogSink};
pub use manager::{DeviceManager, NotificationAggregator};
pub use record::NotificationRecord;
