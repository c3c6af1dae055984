//! 单设备 ANCS 会话
//!
//! 状态机: `Disconnected -> Connecting -> Subscribing -> Listening -> Disconnected`
//!
//! 一次 [`AncsSession::run`] 对应一次连接。任何失败都回到 `Disconnected`，
//! 由 [`ReconnectSupervisor`](super::supervisor::ReconnectSupervisor) 决定何时重连。
//!
//! 所有事件都在 `run` 所在的任务里串行处理；写 Control Point 的请求放进
//! `FuturesUnordered` 与事件处理并行推进，写失败不会阻塞后续事件。

use crate::ancs::battery::BatteryCache;
use crate::ancs::codec::{
    AttributeId, AttributeRequestProfile, AttributeSet, EventId, NotificationSourceEvent,
    ResponseBuffer,
};
use crate::ancs::dedup::RecencyMap;
use crate::ble::{AncsCharacteristic, AncsLink, AncsTransport, BleError, Connection, LinkEvent};
use crate::config::{BridgeSettings, ConfigError};
use crate::filter::NotificationFilter;
use crate::logging::LogSink;
use crate::record::{NotificationRecord, wall_clock_seconds};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use log::{debug, trace, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

const BATTERY_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Subscribing,
    Listening,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Subscribing => "subscribing",
            SessionPhase::Listening => "listening",
        };
        f.write_str(name)
    }
}

/// 一次连接的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// 外部请求停止
    Stopped,
    /// 连接建立后被 BLE 协议栈断开
    Disconnected,
}

type DedupKey = (String, String, String);
type PendingWrite = BoxFuture<'static, (u32, Result<(), BleError>)>;

/// 通过去重和过滤、等待补充电量的通知
struct Screened {
    app_identifier: String,
    title: String,
    subtitle: Option<String>,
    message: String,
    date: String,
    codes: Vec<String>,
}

pub struct AncsSession {
    address: String,
    profile: AttributeRequestProfile,
    filter: NotificationFilter,
    connect_timeout: Duration,
    log: Arc<dyn LogSink>,
    output: mpsc::Sender<NotificationRecord>,
    phase: watch::Sender<SessionPhase>,

    pending_uid: Option<u32>,
    buffer: ResponseBuffer,
    battery: BatteryCache,
    battery_subscribed: bool,
    recent: RecencyMap<DedupKey>,
}

impl AncsSession {
    /// `settings` 是启动时的配置快照，运行中不会再读取
    pub fn new(
        address: impl Into<String>,
        settings: &BridgeSettings,
        log: Arc<dyn LogSink>,
        output: mpsc::Sender<NotificationRecord>,
    ) -> Result<Self, ConfigError> {
        let (phase, _) = watch::channel(SessionPhase::Disconnected);
        Ok(Self {
            address: address.into(),
            profile: settings.request_profile(),
            filter: NotificationFilter::from_settings(settings)?,
            connect_timeout: settings.connect_timeout(),
            log,
            output,
            phase,
            pending_uid: None,
            buffer: ResponseBuffer::default(),
            battery: BatteryCache::default(),
            battery_subscribed: false,
            recent: RecencyMap::new(settings.dedup_window()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn pending_uid(&self) -> Option<u32> {
        self.pending_uid
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.battery.last_known()
    }

    pub(crate) fn note(&self, message: &str) {
        self.log.log(&self.address, message);
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        debug!("{}: {}", self.address, phase);
        self.phase.send_replace(phase);
    }

    fn reset_for_connect(&mut self) {
        self.pending_uid = None;
        self.buffer.clear();
        self.battery.reset();
        self.battery_subscribed = false;
    }

    /// 连接、订阅并监听，直到断线或 `cancel` 触发
    pub async fn run(
        &mut self,
        transport: &dyn AncsTransport,
        cancel: &CancellationToken,
    ) -> Result<SessionExit, BleError> {
        self.reset_for_connect();
        if cancel.is_cancelled() {
            return Ok(SessionExit::Stopped);
        }

        self.set_phase(SessionPhase::Connecting);
        self.note("connecting ...");
        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            result = transport.connect(&self.address, self.connect_timeout) => Some(result),
        };
        let Connection { link, mut events } = match connected {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                self.set_phase(SessionPhase::Disconnected);
                return Err(e);
            }
            None => {
                self.set_phase(SessionPhase::Disconnected);
                return Ok(SessionExit::Stopped);
            }
        };
        self.note("connected");

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.subscribe(link.as_ref()) => Some(result),
        };
        let result = match subscribed {
            Some(Ok(())) => self.listen(&link, &mut events, cancel).await,
            Some(Err(e)) => Err(e),
            None => Ok(SessionExit::Stopped),
        };

        self.teardown(link.as_ref()).await;
        self.set_phase(SessionPhase::Disconnected);
        result
    }

    async fn subscribe(&mut self, link: &dyn AncsLink) -> Result<(), BleError> {
        self.set_phase(SessionPhase::Subscribing);
        link.subscribe(AncsCharacteristic::DataSource).await?;
        link.subscribe(AncsCharacteristic::NotificationSource).await?;
        self.note("subscribed ANCS");

        self.setup_battery(link).await;
        Ok(())
    }

    /// 电量只是附加信息，失败不影响 ANCS
    async fn setup_battery(&mut self, link: &dyn AncsLink) {
        let read = time::timeout(
            BATTERY_READ_TIMEOUT,
            link.read(AncsCharacteristic::BatteryLevel),
        );
        match read.await {
            Ok(Ok(raw)) => {
                if let Some(level) = self.battery.update_raw(&raw, Instant::now()) {
                    self.note(&format!("battery={}% (read)", level));
                }
            }
            Ok(Err(e)) => self.note(&format!("battery read fail: {}", e)),
            Err(_) => self.note("battery read fail: timed out"),
        }

        match link.subscribe(AncsCharacteristic::BatteryLevel).await {
            Ok(()) => {
                self.battery_subscribed = true;
                self.note("battery notify on");
            }
            Err(e) => self.note(&format!("battery notify fail: {}", e)),
        }
    }

    async fn listen(
        &mut self,
        link: &Arc<dyn AncsLink>,
        events: &mut mpsc::Receiver<LinkEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionExit, BleError> {
        self.set_phase(SessionPhase::Listening);
        let mut writes: FuturesUnordered<PendingWrite> = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(SessionExit::Stopped),

                Some((uid, result)) = writes.next(), if !writes.is_empty() => {
                    if let Err(e) = result {
                        self.note(&format!("[CP] request for uid {} failed: {}", uid, e));
                    }
                }

                event = events.recv() => match event {
                    Some(LinkEvent::Value { characteristic, data }) => match characteristic {
                        AncsCharacteristic::NotificationSource => {
                            if let Some(uid) = self.on_notification_source(&data) {
                                writes.push(self.request_attributes(link, uid));
                            }
                        }
                        AncsCharacteristic::DataSource => {
                            let accepted = self.on_data_source(&data);
                            let delivered = async {
                                for attributes in accepted {
                                    self.emit(link.as_ref(), attributes).await;
                                }
                            };
                            // 电量读取和输出队列都可能等待，停止请求优先
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Ok(SessionExit::Stopped),
                                () = delivered => {}
                            }
                        }
                        AncsCharacteristic::BatteryLevel => {
                            self.battery.update_raw(&data, Instant::now());
                        }
                        AncsCharacteristic::ControlPoint => {}
                    },
                    Some(LinkEvent::Disconnected) | None => {
                        self.note("disconnected");
                        return Ok(SessionExit::Disconnected);
                    }
                },
            }
        }
    }

    async fn teardown(&mut self, link: &dyn AncsLink) {
        let mut subscribed = vec![
            AncsCharacteristic::NotificationSource,
            AncsCharacteristic::DataSource,
        ];
        if self.battery_subscribed {
            subscribed.push(AncsCharacteristic::BatteryLevel);
        }
        for characteristic in subscribed {
            if let Err(e) = link.unsubscribe(characteristic).await {
                debug!(
                    "{}: unsubscribe {} failed: {}",
                    self.address, characteristic, e
                );
            }
        }
        if let Err(e) = link.disconnect().await {
            warn!("{}: disconnect failed: {}", self.address, e);
        }
        self.battery_subscribed = false;
    }

    /// 处理 Notification Source 事件，返回需要请求属性的 UID
    fn on_notification_source(&mut self, data: &[u8]) -> Option<u32> {
        let event = NotificationSourceEvent::parse(data)?;
        if event.event_id != EventId::Added {
            trace!("{}: ignoring {:?} uid={}", self.address, event.event_id, event.uid);
            return None;
        }

        debug!(
            "{}: notification added uid={} category={}",
            self.address, event.uid, event.category_id
        );
        self.pending_uid = Some(event.uid);
        self.buffer.clear();
        Some(event.uid)
    }

    fn request_attributes(&self, link: &Arc<dyn AncsLink>, uid: u32) -> PendingWrite {
        let command = self.profile.build_request(uid);
        let link = Arc::clone(link);
        Box::pin(async move {
            let result = link
                .write(AncsCharacteristic::ControlPoint, &command, true)
                .await;
            (uid, result)
        })
    }

    /// 追加 Data Source 数据，返回属于当前等待 UID 的完整响应
    fn on_data_source(&mut self, data: &[u8]) -> Vec<AttributeSet> {
        self.buffer.extend(data);

        let mut accepted = Vec::new();
        loop {
            match self.buffer.next_response(Some(self.profile.last_attribute())) {
                Ok(Some(parsed)) => {
                    if self.pending_uid != Some(parsed.uid) {
                        trace!("{}: stale response uid={}", self.address, parsed.uid);
                        continue;
                    }
                    self.pending_uid = None;
                    accepted.push(parsed.attributes);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: {}, buffer reset", self.address, e);
                    break;
                }
            }
        }
        accepted
    }

    /// 去重 -> 屏蔽词 -> 验证码提取，顺序固定
    fn screen(&mut self, attributes: AttributeSet, now: Instant) -> Option<Screened> {
        let app_identifier = attributes.text(AttributeId::AppIdentifier);
        let title = attributes.text(AttributeId::Title);
        let subtitle = attributes.get(AttributeId::Subtitle).map(str::to_string);
        let message = attributes.text(AttributeId::Message);
        let date = attributes.text(AttributeId::Date);

        let key = (app_identifier.clone(), title.clone(), message.clone());
        if !self.recent.admit(key, now) {
            debug!("{}: duplicate from {} suppressed", self.address, app_identifier);
            return None;
        }

        let subtitle_text = subtitle.as_deref().unwrap_or_default();
        let haystack = [
            app_identifier.as_str(),
            title.as_str(),
            subtitle_text,
            message.as_str(),
            date.as_str(),
        ]
        .join("\n");
        if self.filter.is_blocked(&haystack) {
            self.note(&format!("blocked notification from {}", app_identifier));
            return None;
        }

        let codes = self
            .filter
            .extract_codes(&format!("{}\n{}\n{}", title, subtitle_text, message));

        Some(Screened {
            app_identifier,
            title,
            subtitle,
            message,
            date,
            codes,
        })
    }

    async fn emit(&mut self, link: &dyn AncsLink, attributes: AttributeSet) {
        let Some(screened) = self.screen(attributes, Instant::now()) else {
            return;
        };
        let battery_percent = self.current_battery(link).await;

        let record = NotificationRecord {
            timestamp: wall_clock_seconds(),
            device_id: self.address.clone(),
            app_identifier: screened.app_identifier,
            title: screened.title,
            subtitle: screened.subtitle,
            message: screened.message,
            date: screened.date,
            battery_percent,
            extracted_codes: screened.codes,
        };
        if self.output.send(record).await.is_err() {
            debug!("{}: record receiver closed", self.address);
        }
    }

    /// 缓存过期时重新读取，失败则沿用上次的值
    async fn current_battery(&mut self, link: &dyn AncsLink) -> Option<u8> {
        let now = Instant::now();
        if !self.battery.is_fresh(now) {
            match time::timeout(
                BATTERY_READ_TIMEOUT,
                link.read(AncsCharacteristic::BatteryLevel),
            )
            .await
            {
                Ok(Ok(raw)) => {
                    self.battery.update_raw(&raw, now);
                }
                Ok(Err(e)) => debug!("{}: battery read failed: {}", self.address, e),
                Err(_) => debug!("{}: battery read timed out", self.address),
            }
        }
        self.battery.last_known()
    }
}
