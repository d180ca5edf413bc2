//! snitch-hub - 出站防火墙节点的控制面
//!
//! 节点接入 Hub 后上报配置与统计；遇到无规则匹配的出站连接时向 Hub 请求裁决，
//! Hub 交给操作员决定，超时或无人值守时返回兜底规则；Hub 也可以向全部节点广播启停拦截的通知。
//!
//! # 核心功能
//!
//! - **节点注册**: 每个地址一个会话，重连整体替换
//! - **统计汇总**: 读取时遍历全部会话求和
//! - **通知广播**: 每个节点独立入队，卡住的节点不影响其它节点
//! - **连接裁决**: 单飞（single-flight）、超时兜底、无人值守模式
//! - **持久化**: 可选 SQLite 落库，失败不影响 RPC
//!
//! # Feature Flags
//!
//! - `server`: Hub 服务（TCP / Unix Socket + JSONL）
//! - `client`: Hub Client（节点 / 操作员 / CLI 使用）

pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod storage;
pub mod types;

#[cfg(feature = "server")]
pub mod hub;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::{FallbackPolicy, HubConfig, ListenAddr};
pub use db::SqliteStorage;
pub use error::{Error, Result};
pub use storage::{Order, Storage};
pub use types::*;

// Protocol types (always available)
pub use protocol::{ConnectionPrompt, Push, QueryType, Request, Response};

#[cfg(feature = "server")]
pub use hub::{cleanup_stale_hub, is_hub_running, Hub, Listener};

#[cfg(feature = "client")]
pub use client::{HubClient, HubClientConfig, NotificationStream};
