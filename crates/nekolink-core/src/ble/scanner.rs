//! BLE Scanner - 为配置挑选 iPhone 地址
//!
//! iPhone 本身不会主动广播 ANCS，通常借助 LightBlue 之类的 App
//! 模拟一个外设 (默认名称 "Heart Rate") 让 PC 发现并连接。
//! 扫描只用于填充配置中的地址列表，不参与稳态协议。
//!
//! 结果按信号强度降序排列，只保留名称包含过滤串 (不区分大小写) 的设备。
//! 扫描总是等满超时时间；中途取消时丢弃已发现的设备。

use crate::ble::BleError;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use log::{debug, info};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// 没有 RSSI 的设备排在最后
pub const UNKNOWN_RSSI: i16 = -999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: i16,
}

pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)?;
        Ok(Self { adapter })
    }

    /// 扫描 `timeout` 后返回匹配 `name_filter` 的设备
    ///
    /// `cancel` 先触发时返回空列表。
    pub async fn scan(
        &self,
        timeout: Duration,
        name_filter: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DiscoveredDevice>, BleError> {
        info!("Starting BLE scan for {} seconds", timeout.as_secs());
        self.adapter.start_scan(ScanFilter::default()).await?;

        let cancelled = tokio::select! {
            _ = time::sleep(timeout) => false,
            _ = cancel.cancelled() => true,
        };

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        if cancelled {
            info!("Scan cancelled");
            return Ok(Vec::new());
        }

        let mut seen = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            seen.push(DiscoveredDevice {
                name,
                address: props.address.to_string(),
                rssi: props.rssi.unwrap_or(UNKNOWN_RSSI),
            });
        }
        debug!("Scan saw {} named device(s)", seen.len());

        let devices = rank_devices(seen, name_filter);
        info!("Scan complete: {} matching device(s)", devices.len());
        Ok(devices)
    }
}

/// 过滤并按 RSSI 降序排序; 空过滤串匹配所有有名称的设备
pub fn rank_devices(
    devices: Vec<DiscoveredDevice>,
    name_filter: &str,
) -> Vec<DiscoveredDevice> {
    let needle = name_filter.trim().to_lowercase();
    let mut matched: Vec<_> = devices
        .into_iter()
        .filter(|d| {
            let name = d.name.trim();
            !name.is_empty() && name.to_lowercase().contains(&needle)
        })
        .collect();
    matched.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, address: &str, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.to_string(),
            address: address.to_string(),
            rssi,
        }
    }

    #[test]
    fn test_rank_devices_filters_and_sorts() {
        let devices = vec![
            device("Heart Rate", "AA:00:00:00:00:01", -80),
            device("Mi Band", "AA:00:00:00:00:02", -40),
            device("heart rate monitor", "AA:00:00:00:00:03", -55),
            device("HEART RATE", "AA:00:00:00:00:04", UNKNOWN_RSSI),
        ];

        let ranked = rank_devices(devices, "Heart Rate");
        let addrs: Vec<_> = ranked.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(
            addrs,
            vec!["AA:00:00:00:00:03", "AA:00:00:00:00:01", "AA:00:00:00:00:04"]
        );
    }

    #[test]
    fn test_rank_devices_empty_when_nothing_matches() {
        let devices = vec![device("Mi Band", "AA:00:00:00:00:02", -40)];
        assert!(rank_devices(devices, "heart rate").is_empty());
    }

    #[test]
    fn test_rank_devices_empty_filter_keeps_named() {
        let devices = vec![
            device("  ", "AA:00:00:00:00:01", -10),
            device("Watch", "AA:00:00:00:00:02", -40),
        ];
        let ranked = rank_devices(devices, "");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "Watch");
    }
}
