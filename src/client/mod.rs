//! Hub Client 模块
//!
//! 提供连接 Hub 的客户端功能（节点 / 操作员 / CLI 共用）

mod connect;

pub use connect::{HubClient, HubClientConfig, NotificationStream};
