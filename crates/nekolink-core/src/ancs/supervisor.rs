//! 断线重连
//!
//! 整个核心唯一的重试策略：属性请求本身从不重试，丢失的请求只意味着
//! 少一条通知正文。

use crate::ancs::session::{AncsSession, SessionExit};
use crate::ble::AncsTransport;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 指数退避：2, 4, 8, 16, 30, 30, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// 返回本次等待时间并把下一次翻倍 (不超过上限)
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }
}

pub struct ReconnectSupervisor {
    session: AncsSession,
    transport: Arc<dyn AncsTransport>,
    backoff: Backoff,
}

impl ReconnectSupervisor {
    pub fn new(session: AncsSession, transport: Arc<dyn AncsTransport>) -> Self {
        Self {
            session,
            transport,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// 循环运行会话直到 `cancel` 触发，返回会话以便检查状态
    pub async fn run(mut self, cancel: CancellationToken) -> AncsSession {
        loop {
            let delay = match self.session.run(self.transport.as_ref(), &cancel).await {
                Ok(SessionExit::Stopped) => break,
                Ok(SessionExit::Disconnected) => {
                    self.backoff.reset();
                    self.backoff.initial()
                }
                Err(e) => {
                    self.session.note(&format!("[RETRY] {}", e));
                    self.backoff.next_delay()
                }
            };

            if cancel.is_cancelled() {
                break;
            }
            self.session
                .note(&format!("reconnect in {}s", delay.as_secs()));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("{}: supervisor exiting", self.session.address());
        self.session.note("stopped");
        self.session
    }
}
