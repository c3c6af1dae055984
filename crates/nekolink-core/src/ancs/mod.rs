//! ANCS 协议客户端
//!
//! - [`codec`]: Control Point 请求编码、Data Source 响应解析和重组
//! - [`session`]: 单设备订阅/监听状态机
//! - [`supervisor`]: 断线重连和退避
//! - [`dedup`], [`battery`]: 会话内的去重表和电量缓存

pub mod battery;
pub mod codec;
pub mod dedup;
pub mod session;
pub mod supervisor;

pub use battery::BatteryCache;
pub use codec::{
    AttributeId, AttributeRequestProfile, AttributeSet, CodecError, EventId,
    NotificationSourceEvent, ResponseBuffer,
};
pub use dedup::RecencyMap;
pub use session::{AncsSession, SessionExit, SessionPhase};
pub use supervisor::{Backoff, ReconnectSupervisor};
