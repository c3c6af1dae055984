//! 测试用传输: 记录链路操作，事件由测试代码推送

use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkOp {
    Subscribe(AncsCharacteristic),
    Unsubscribe(AncsCharacteristic),
    Write {
        characteristic: AncsCharacteristic,
        data: Vec<u8>,
        with_response: bool,
    },
    Read(AncsCharacteristic),
    Disconnect,
}

pub(crate) type OpLog = Arc<Mutex<Vec<LinkOp>>>;

#[derive(Default)]
pub(crate) struct MockLink {
    pub ops: OpLog,
    pub battery: Option<u8>,
    pub fail_writes: bool,
    pub fail_subscribe: Option<AncsCharacteristic>,
    /// 读取永不返回
    pub stall_reads: bool,
}

impl MockLink {
    fn record(&self, op: LinkOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl AncsLink for MockLink {
    async fn subscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError> {
        self.record(LinkOp::Subscribe(characteristic));
        if self.fail_subscribe == Some(characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic.uuid()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: AncsCharacteristic) -> Result<(), BleError> {
        self.record(LinkOp::Unsubscribe(characteristic));
        Ok(())
    }

    async fn write(
        &self,
        characteristic: AncsCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        self.record(LinkOp::Write {
            characteristic,
            data: data.to_vec(),
            with_response,
        });
        if self.fail_writes {
            return Err(BleError::Disconnected);
        }
        Ok(())
    }

    async fn read(&self, characteristic: AncsCharacteristic) -> Result<Vec<u8>, BleError> {
        self.record(LinkOp::Read(characteristic));
        if self.stall_reads {
            std::future::pending::<()>().await;
        }
        match (characteristic, self.battery) {
            (AncsCharacteristic::BatteryLevel, Some(level)) => Ok(vec![level]),
            _ => Err(BleError::CharacteristicNotFound(characteristic.uuid())),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.record(LinkOp::Disconnect);
        Ok(())
    }
}

/// 包装一条 mock 连接，返回 (连接, 事件发送端, 操作记录)
pub(crate) fn mock_connection(link: MockLink) -> (Connection, mpsc::Sender<LinkEvent>, OpLog) {
    let ops = link.ops.clone();
    let (tx, rx) = mpsc::channel(16);
    let connection = Connection {
        link: Arc::new(link),
        events: rx,
    };
    (connection, tx, ops)
}

/// 依次交出预先准备好的连接，用完后连接失败 (或一直挂起)
#[derive(Default)]
pub(crate) struct MockTransport {
    connections: Mutex<VecDeque<Option<Connection>>>,
    attempts: Mutex<Vec<Instant>>,
    hang_when_empty: bool,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl MockTransport {
    pub fn new(connections: Vec<Connection>) -> Self {
        Self::scripted(connections.into_iter().map(Some).collect())
    }

    /// `None` 表示该次连接失败
    pub fn scripted(script: Vec<Option<Connection>>) -> Self {
        Self {
            connections: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang_when_empty: true,
            ..Default::default()
        }
    }

    /// 第 `attempts` 次连接尝试时触发 `cancel`
    pub fn cancel_after(mut self, attempts: usize, cancel: CancellationToken) -> Self {
        self.cancel_after = Some((attempts, cancel));
        self
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AncsTransport for MockTransport {
    async fn connect(&self, address: &str, _timeout: Duration) -> Result<Connection, BleError> {
        let count = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            attempts.len()
        };
        if let Some((limit, cancel)) = &self.cancel_after {
            if count >= *limit {
                cancel.cancel();
            }
        }

        let next = self.connections.lock().unwrap().pop_front();
        match next {
            Some(Some(connection)) => Ok(connection),
            Some(None) => Err(BleError::ConnectTimeout(Duration::from_secs(30))),
            None if self.hang_when_empty => std::future::pending().await,
            None => Err(BleError::DeviceNotFound(address.to_string())),
        }
    }
}
