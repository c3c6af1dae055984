//! 多设备管理
//!
//! 每个地址一个 [`ReconnectSupervisor`] 任务，各设备互不阻塞。
//! 所有设备的记录汇入同一个 channel，由单个聚合任务做跨设备去重后交给
//! [`Deliver`]，所以聚合回调永远不会并发执行。

use crate::ancs::dedup::RecencyMap;
use crate::ancs::session::{AncsSession, SessionPhase};
use crate::ancs::supervisor::ReconnectSupervisor;
use crate::ble::AncsTransport;
use crate::config::{BridgeSettings, ConfigError};
use crate::delivery::Deliver;
use crate::logging::LogSink;
use crate::record::NotificationRecord;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RECORD_QUEUE: usize = 64;
const MANAGER: &str = "MANAGER";

/// (device, app, title, message, date)
type AggregateKey = (String, String, String, String, String);

/// 跨设备去重，之后投递
pub struct NotificationAggregator {
    recent: RecencyMap<AggregateKey>,
    delivery: Arc<dyn Deliver>,
    log: Arc<dyn LogSink>,
}

impl NotificationAggregator {
    pub fn new(window: Duration, delivery: Arc<dyn Deliver>, log: Arc<dyn LogSink>) -> Self {
        Self {
            recent: RecencyMap::new(window),
            delivery,
            log,
        }
    }

    /// 返回记录是否被投递
    pub fn handle(&mut self, record: NotificationRecord, now: Instant) -> bool {
        let key = (
            record.device_id.clone(),
            record.app_identifier.clone(),
            record.title.clone(),
            record.message.clone(),
            record.date.clone(),
        );
        if !self.recent.admit(key, now) {
            debug!(
                "{}: cross-device duplicate from {} dropped",
                record.device_id, record.app_identifier
            );
            return false;
        }

        self.log.log(
            &record.device_id,
            &format!("[{}] {}", record.app_identifier, record.title),
        );
        self.delivery.deliver(&record);
        true
    }
}

struct Worker {
    cancel: CancellationToken,
    phase: watch::Receiver<SessionPhase>,
    handle: JoinHandle<AncsSession>,
}

pub struct DeviceManager {
    settings: Arc<BridgeSettings>,
    transport: Arc<dyn AncsTransport>,
    log: Arc<dyn LogSink>,
    records: mpsc::Sender<NotificationRecord>,
    workers: HashMap<String, Worker>,
    /// 已发出停止信号、尚未结束的任务
    stopping: Vec<JoinHandle<AncsSession>>,
    aggregator: JoinHandle<()>,
    closing: CancellationToken,
}

impl DeviceManager {
    /// 必须在 tokio runtime 内调用
    pub fn new(
        settings: Arc<BridgeSettings>,
        transport: Arc<dyn AncsTransport>,
        delivery: Arc<dyn Deliver>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let (records, mut rx) = mpsc::channel(RECORD_QUEUE);
        let mut aggregator =
            NotificationAggregator::new(settings.dedup_window(), delivery, log.clone());
        let closing = CancellationToken::new();
        let closed = closing.clone();
        let aggregator = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    record = rx.recv() => match record {
                        Some(record) => {
                            aggregator.handle(record, Instant::now());
                        }
                        None => break,
                    },
                    _ = closed.cancelled() => {
                        while let Ok(record) = rx.try_recv() {
                            aggregator.handle(record, Instant::now());
                        }
                        break;
                    }
                }
            }
            debug!("aggregator finished");
        });

        Self {
            settings,
            transport,
            log,
            records,
            workers: HashMap::new(),
            stopping: Vec::new(),
            aggregator,
            closing,
        }
    }

    /// 为尚未运行的地址启动会话，返回新启动的数量
    pub fn start_all(&mut self, addresses: &[String]) -> Result<usize, ConfigError> {
        let mut started = 0;
        for address in addresses {
            let address = address.trim();
            if address.is_empty() || self.workers.contains_key(address) {
                continue;
            }

            let session = AncsSession::new(
                address,
                &self.settings,
                self.log.clone(),
                self.records.clone(),
            )?;
            let phase = session.subscribe_phase();
            let cancel = CancellationToken::new();
            let supervisor = ReconnectSupervisor::new(session, self.transport.clone());
            let handle = tokio::spawn(supervisor.run(cancel.clone()));

            self.workers.insert(
                address.to_string(),
                Worker {
                    cancel,
                    phase,
                    handle,
                },
            );
            self.log.log(MANAGER, &format!("started {}", address));
            started += 1;
        }
        Ok(started)
    }

    /// 通知所有会话停止并立即清空；不等待断开完成
    pub fn stop_all(&mut self) {
        self.stopping.retain(|handle| !handle.is_finished());
        for (address, worker) in self.workers.drain() {
            worker.cancel.cancel();
            self.log.log(MANAGER, &format!("stopping {}", address));
            self.stopping.push(worker.handle);
        }
    }

    pub fn running(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.workers.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn is_running(&self, address: &str) -> bool {
        self.workers.contains_key(address.trim())
    }

    pub fn phases(&self) -> Vec<(String, SessionPhase)> {
        let mut phases: Vec<(String, SessionPhase)> = self
            .workers
            .iter()
            .map(|(address, worker)| (address.clone(), *worker.phase.borrow()))
            .collect();
        phases.sort_by(|a, b| a.0.cmp(&b.0));
        phases
    }

    /// 停止所有会话并等待其断开 (最多 `grace`)，然后投递已排队的记录
    pub async fn shutdown(mut self, grace: Duration) {
        self.stop_all();
        let handles = std::mem::take(&mut self.stopping);

        let joined = tokio::time::timeout(grace, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("session task failed: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("sessions still tearing down after {:?}", grace);
        }

        self.closing.cancel();
        if tokio::time::timeout(grace, &mut self.aggregator).await.is_err() {
            warn!("aggregator did not drain within {:?}", grace);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        for worker in self.workers.values() {
            worker.cancel.cancel();
        }
        self.closing.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockLink, MockTransport, mock_connection};
    use crate::ble::{AncsCharacteristic, LinkEvent};
    use crate::logging::TracingLogSink;
    use std::sync::Mutex;

    fn record(device: &str, message: &str) -> NotificationRecord {
        NotificationRecord {
            timestamp: 0.0,
            device_id: device.to_string(),
            app_identifier: "com.apple.MobileSMS".to_string(),
            title: "Bank".to_string(),
            subtitle: None,
            message: message.to_string(),
            date: "20261016T101500".to_string(),
            battery_percent: None,
            extracted_codes: Vec::new(),
        }
    }

    fn collector() -> (Arc<dyn Deliver>, Arc<Mutex<Vec<NotificationRecord>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let deliver = move |r: &NotificationRecord| sink.lock().unwrap().push(r.clone());
        (Arc::new(deliver), seen)
    }

    fn addresses(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_aggregator_drops_duplicates_within_window() {
        let (deliver, seen) = collector();
        let mut aggregator =
            NotificationAggregator::new(Duration::from_secs(8), deliver, Arc::new(TracingLogSink));
        let t0 = Instant::now();

        assert!(aggregator.handle(record("AA", "hi"), t0));
        assert!(!aggregator.handle(record("AA", "hi"), t0 + Duration::from_secs(3)));
        // 不同设备的同一通知不算重复
        assert!(aggregator.handle(record("BB", "hi"), t0 + Duration::from_secs(3)));
        assert!(aggregator.handle(record("AA", "hi"), t0 + Duration::from_secs(9)));

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_start_all_is_idempotent() {
        let (deliver, _) = collector();
        let mut manager = DeviceManager::new(
            Arc::new(BridgeSettings::default()),
            Arc::new(MockTransport::hanging()),
            deliver,
            Arc::new(TracingLogSink),
        );

        let first = manager.start_all(&addresses(&["AA", "BB", " ", "AA"])).unwrap();
        assert_eq!(first, 2);
        assert_eq!(manager.start_all(&addresses(&["BB", "CC"])).unwrap(), 1);
        assert_eq!(manager.running(), vec!["AA", "BB", "CC"]);
        assert!(manager.is_running("CC"));

        manager.stop_all();
        assert!(manager.running().is_empty());
        assert!(manager.phases().is_empty());

        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_start_all_rejects_bad_code_pattern() {
        let (deliver, _) = collector();
        let settings = BridgeSettings {
            code_regex: "(".to_string(),
            ..Default::default()
        };
        let mut manager = DeviceManager::new(
            Arc::new(settings),
            Arc::new(MockTransport::hanging()),
            deliver,
            Arc::new(TracingLogSink),
        );

        assert!(matches!(
            manager.start_all(&addresses(&["AA"])),
            Err(ConfigError::InvalidCodePattern(_))
        ));
        assert!(manager.running().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_from_two_devices_are_merged() {
        let (conn_a, events_a, _) = mock_connection(MockLink::default());
        let (conn_b, events_b, _) = mock_connection(MockLink::default());
        let (deliver, seen) = collector();
        let mut manager = DeviceManager::new(
            Arc::new(BridgeSettings::default()),
            Arc::new(MockTransport::new(vec![conn_a, conn_b])),
            deliver,
            Arc::new(TracingLogSink),
        );
        manager.start_all(&addresses(&["AA"])).unwrap();
        manager.start_all(&addresses(&["BB"])).unwrap();

        for (uid, events, text) in [(1u32, &events_a, "from a"), (2, &events_b, "from b")] {
            let mut added = vec![0x00, 0x00, 0x04, 0x01];
            added.extend_from_slice(&uid.to_le_bytes());
            let mut response = vec![0x00];
            response.extend_from_slice(&uid.to_le_bytes());
            for (id, value) in [(0u8, "app"), (1, "t"), (2, ""), (3, text), (5, "d")] {
                response.push(id);
                response.extend_from_slice(&(value.len() as u16).to_le_bytes());
                response.extend_from_slice(value.as_bytes());
            }

            events
                .send(LinkEvent::Value {
                    characteristic: AncsCharacteristic::NotificationSource,
                    data: added,
                })
                .await
                .unwrap();
            events
                .send(LinkEvent::Value {
                    characteristic: AncsCharacteristic::DataSource,
                    data: response,
                })
                .await
                .unwrap();
        }

        // 等待投递
        for _ in 0..100 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown(Duration::from_secs(1)).await;

        // 连接按任务调度顺序分配，只比较集合
        let seen = seen.lock().unwrap();
        let mut devices: Vec<&str> = seen.iter().map(|r| r.device_id.as_str()).collect();
        let mut messages: Vec<&str> = seen.iter().map(|r| r.message.as_str()).collect();
        devices.sort();
        messages.sort();
        assert_eq!(devices, vec!["AA", "BB"]);
        assert_eq!(messages, vec!["from a", "from b"]);
    }
}
