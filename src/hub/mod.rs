//! Hub 模块 - 节点接入 + 统计汇总 + 通知下发 + 连接裁决
//!
//! Hub 是防火墙节点的控制面，负责：
//! - 维护在线节点及其配置 / 统计
//! - 向全部节点广播控制通知
//! - 把节点的 AskRule 交给操作员裁决，超时或无人值守时返回兜底规则

mod broadcaster;
mod broker;
mod handler;
mod registry;
mod server;
mod session;
mod stats;
mod writer;

// Re-export protocol types from crate root
pub use crate::protocol::{ConnectionPrompt, Push, QueryType, Request, Response};
pub use broadcaster::{Broadcaster, FanoutReport};
pub use broker::{
    ArbitrationState, BrokerConfig, BrokerStats, DecisionBroker, DecisionConsumer, Outcome,
    Resolution, Verdict,
};
pub use handler::{Handler, HUB_VERSION};
pub use registry::{NodeRegistry, PeerInfo, LOCAL_HOST};
pub use server::{cleanup_stale_hub, is_hub_running, Hub, Listener};
pub use session::{NodeSession, NotifyError, Outbox};
pub use stats::{stats_sum, summarize, FleetSummary, StatsField};
pub use writer::{StorageWriter, WRITE_QUEUE_CAPACITY};
