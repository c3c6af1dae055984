//! BLE 传输层
//!
//! ANCS 会话只依赖这里定义的 [`AncsTransport`] / [`AncsLink`] 两个 trait，
//! 具体实现见 [`client::BleClient`] (btleplug)。
//!
//! 传输层回调 (notify) 在边界处被转换为 [`LinkEvent`] 并送入会话自己的
//! 事件队列，会话从不在传输层线程上直接执行 ANCS 逻辑。

pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod scanner;

pub use client::BleClient;
pub use scanner::{BleScanner, DiscoveredDevice};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const ANCS_SERVICE_UUID: Uuid = Uuid::from_u128(0x7905f431_b5ce_4e99_a40f_4b1e122d00d0);
pub const NOTIFICATION_SOURCE_UUID: Uuid =
    Uuid::from_u128(0x9fbf120d_6301_42d9_8c58_25e699a21dbd);
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x69d1d8f3_45e1_49a8_9821_9bbdfdaad9d9);
pub const DATA_SOURCE_UUID: Uuid = Uuid::from_u128(0x22eac6e9_24d6_4bb5_be44_b36ace7c7bfb);

pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// 会话用到的四个特征
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AncsCharacteristic {
    NotificationSource,
    ControlPoint,
    DataSource,
    BatteryLevel,
}

impl AncsCharacteristic {
    pub const ALL: [AncsCharacteristic; 4] = [
        AncsCharacteristic::NotificationSource,
        AncsCharacteristic::ControlPoint,
        AncsCharacteristic::DataSource,
        AncsCharacteristic::BatteryLevel,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            AncsCharacteristic::NotificationSource => NOTIFICATION_SOURCE_UUID,
            AncsCharacteristic::ControlPoint => CONTROL_POINT_UUID,
            AncsCharacteristic::DataSource => DATA_SOURCE_UUID,
            AncsCharacteristic::BatteryLevel => BATTERY_LEVEL_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for AncsCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AncsCharacteristic::NotificationSource => "Notification Source",
            AncsCharacteristic::ControlPoint => "Control Point",
            AncsCharacteristic::DataSource => "Data Source",
            AncsCharacteristic::BatteryLevel => "Battery Level",
        };
        f.write_str(name)
    }
}

/// BLE 传输错误
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Link disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] btleplug::Error),
}

/// 传输层推送给会话的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// 某个已订阅特征的 notify 值
    Value {
        characteristic: AncsCharacteristic,
        data: Vec<u8>,
    },
    /// BLE 协议栈报告连接已断开
    Disconnected,
}

/// 一次成功建立的连接: 操作句柄 + 事件队列
pub struct Connection {
    pub link: Arc<dyn AncsLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// 能建立到指定地址的 BLE 连接
#[async_trait]
pub trait AncsTransport: Send + Sync {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Connection, BleError>;
}

/// 单条已建立的 BLE 连接
#[async_trait]
pub trait AncsLink: Send + Sync {
    async fn subscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError>;

    async fn unsubscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError>;

    async fn write(
        &self,
        characteristic: AncsCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    async fn read(&self, characteristic: AncsCharacteristic) -> Result<Vec<u8>, BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuid_lookup() {
        for c in AncsCharacteristic::ALL {
            assert_eq!(AncsCharacteristic::from_uuid(c.uuid()), Some(c));
        }
        assert_eq!(AncsCharacteristic::from_uuid(ANCS_SERVICE_UUID), None);
    }

    #[test]
    fn test_wire_constants() {
        assert_eq!(
            NOTIFICATION_SOURCE_UUID.to_string(),
            "9fbf120d-6301-42d9-8c58-25e699a21dbd"
        );
        assert_eq!(
            CONTROL_POINT_UUID.to_string(),
            "69d1d8f3-45e1-49a8-9821-9bbdfdaad9d9"
        );
        assert_eq!(
            DATA_SOURCE_UUID.to_string(),
            "22eac6e9-24d6-4bb5-be44-b36ace7c7bfb"
        );
        assert_eq!(
            BATTERY_LEVEL_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }
}
