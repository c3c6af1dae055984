//! BLE Client - btleplug 实现的 ANCS 传输
//!
//! 流程:
//! 1. 按地址查找 iPhone (找不到时短暂扫描)
//! 2. 连接并重新发现服务 (不复用缓存的 GATT 表)
//! 3. 启动 notify 泵和断线监听，把回调转换为 [`LinkEvent`]

use crate::ble::{AncsCharacteristic, AncsLink, AncsTransport, BleError, Connection, LinkEvent};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(250);
const EVENT_QUEUE_DEPTH: usize = 64;

pub struct BleClient {
    adapter: Adapter,
}

impl BleClient {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(BleError::NoAdapter)?;

        Ok(Self { adapter })
    }

    async fn find_device(
        &self,
        address: &str,
        progress: &ConnectProgress,
    ) -> Result<Peripheral, BleError> {
        if let Some(peripheral) = self.lookup(address).await? {
            return Ok(peripheral);
        }

        // 适配器还没见过这个地址，扫描直到出现 (外层 connect 超时负责兜底)
        debug!("{} not cached by adapter, scanning", address);
        self.adapter.start_scan(ScanFilter::default()).await?;
        progress.scanning.store(true, Ordering::SeqCst);
        let found = loop {
            time::sleep(LOOKUP_POLL_INTERVAL).await;
            if let Some(peripheral) = self.lookup(address).await? {
                break peripheral;
            }
        };
        progress.scanning.store(false, Ordering::SeqCst);
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        Ok(found)
    }

    async fn lookup(&self, address: &str) -> Result<Option<Peripheral>, BleError> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl AncsTransport for BleClient {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<Connection, BleError> {
        let progress = Arc::new(ConnectProgress::default());
        // 超时、出错或 connect future 被丢弃时收尾，成功后解除
        let guard = CleanupGuard::new(abandon_connect(
            self.adapter.clone(),
            progress.clone(),
            address.to_string(),
        ));

        let attempt = async {
            let peripheral = self.find_device(address, &progress).await?;
            progress.peripheral.get_or_init(|| peripheral.clone());
            info!("Connecting to {}", address);
            peripheral.connect().await?;
            debug!("Discovering services on {}", address);
            peripheral.discover_services().await?;
            Ok::<_, BleError>(peripheral)
        };
        let peripheral = match time::timeout(timeout, attempt).await {
            Ok(Ok(peripheral)) => peripheral,
            Ok(Err(e)) => {
                guard.run().await;
                return Err(e);
            }
            Err(_) => {
                guard.run().await;
                return Err(BleError::ConnectTimeout(timeout));
            }
        };

        let characteristics = resolve_characteristics(&peripheral);
        for required in [
            AncsCharacteristic::NotificationSource,
            AncsCharacteristic::ControlPoint,
            AncsCharacteristic::DataSource,
        ] {
            if !characteristics.contains_key(&required) {
                guard.run().await;
                return Err(BleError::CharacteristicNotFound(required.uuid()));
            }
        }

        let notifications = match peripheral.notifications().await {
            Ok(notifications) => notifications,
            Err(e) => {
                guard.run().await;
                return Err(e.into());
            }
        };
        guard.disarm();

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let stop = CancellationToken::new();
        tokio::spawn(pump_notifications(notifications, tx.clone(), stop.clone()));
        tokio::spawn(watch_disconnect(
            self.adapter.clone(),
            peripheral.id(),
            tx,
            stop.clone(),
        ));

        let link = BtleLink {
            peripheral,
            characteristics,
            stop,
        };
        Ok(Connection {
            link: Arc::new(link),
            events: rx,
        })
    }
}

/// 一次连接尝试已经占用的资源
#[derive(Default)]
struct ConnectProgress {
    scanning: AtomicBool,
    peripheral: OnceLock<Peripheral>,
}

/// 停止残留的扫描，断开半开的连接
async fn abandon_connect(adapter: Adapter, progress: Arc<ConnectProgress>, address: String) {
    if progress.scanning.swap(false, Ordering::SeqCst) {
        match adapter.stop_scan().await {
            Ok(()) => debug!("Stopped scan for {}", address),
            Err(e) => warn!("Failed to stop scan for {}: {}", address, e),
        }
    }

    let Some(peripheral) = progress.peripheral.get() else {
        return;
    };
    if let Ok(false) = peripheral.is_connected().await {
        return;
    }
    match peripheral.disconnect().await {
        Ok(()) => debug!("Disconnected {} after aborted connect", address),
        Err(e) => warn!("Failed to disconnect {} after aborted connect: {}", address, e),
    }
}

/// 持有一段收尾逻辑: `run` 就地执行，`disarm` 放弃，未处理就被丢弃时交给后台任务
struct CleanupGuard {
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl CleanupGuard {
    fn new(cleanup: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::pin(cleanup)),
        }
    }

    async fn run(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.await;
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => warn!("No runtime left to clean up an aborted connect"),
        }
    }
}

fn resolve_characteristics(peripheral: &Peripheral) -> HashMap<AncsCharacteristic, Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .filter_map(|c| AncsCharacteristic::from_uuid(c.uuid).map(|kind| (kind, c)))
        .collect()
}

async fn pump_notifications(
    mut notifications: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    tx: mpsc::Sender<LinkEvent>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            notification = notifications.next() => match notification {
                Some(n) => {
                    let Some(characteristic) = AncsCharacteristic::from_uuid(n.uuid) else {
                        continue;
                    };
                    let event = LinkEvent::Value { characteristic, data: n.value };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                None => {
                    debug!("Notification stream ended");
                    let _ = tx.send(LinkEvent::Disconnected).await;
                    break;
                }
            }
        }
    }
}

async fn watch_disconnect(
    adapter: Adapter,
    id: PeripheralId,
    tx: mpsc::Sender<LinkEvent>,
    stop: CancellationToken,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Disconnect watcher: could not subscribe to adapter events: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                    let _ = tx.send(LinkEvent::Disconnected).await;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    }
}

struct BtleLink {
    peripheral: Peripheral,
    characteristics: HashMap<AncsCharacteristic, Characteristic>,
    stop: CancellationToken,
}

impl BtleLink {
    fn characteristic(&self, kind: AncsCharacteristic) -> Result<&Characteristic, BleError> {
        self.characteristics
            .get(&kind)
            .ok_or(BleError::CharacteristicNotFound(kind.uuid()))
    }
}

#[async_trait]
impl AncsLink for BtleLink {
    async fn subscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.subscribe(c).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(c).await?;
        Ok(())
    }

    async fn write(
        &self,
        characteristic: AncsCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        let c = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(c, data, write_type).await?;
        Ok(())
    }

    async fn read(&self, characteristic: AncsCharacteristic) -> Result<Vec<u8>, BleError> {
        let c = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.stop.cancel();
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
