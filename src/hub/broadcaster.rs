//! 通知广播器
//!
//! 把控制通知推给注册表中的全部节点。每个节点独立入队，
//! 某个节点的发件箱卡住不影响其它节点。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;

use super::registry::NodeRegistry;
use super::session::NotifyError;
use crate::types::{Notification, NotificationAction};

/// 单次广播的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// 通知广播器
pub struct Broadcaster {
    registry: Arc<NodeRegistry>,
    /// 单个节点入队的等待上限
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<NodeRegistry>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self { registry, timeout })
    }

    /// 广播通知
    ///
    /// 每个节点一个任务并发入队，整体耗时不超过 `timeout`。
    /// 已接入通知流却超时未取走的节点视为卡死，关闭其会话。
    pub async fn broadcast(&self, notification: Notification) -> FanoutReport {
        let sessions = self.registry.all();
        if sessions.is_empty() {
            tracing::debug!("📡 无在线节点，跳过通知: {:?}", notification.action);
            return FanoutReport::default();
        }

        tracing::info!(
            "📡 广播通知: id={}, action={:?}, nodes={}",
            notification.id,
            notification.action,
            sessions.len()
        );

        let mut tasks = JoinSet::new();
        for session in sessions {
            let notification = notification.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let res = session.send_notification(notification, timeout).await;
                if let Err(e) = res {
                    tracing::warn!("📡 通知未送达: {}, {}", session.addr(), e);
                    if e == NotifyError::Timeout && session.has_stream() {
                        tracing::warn!("📡 通知流卡住，关闭会话: {}", session.addr());
                        session.close();
                    }
                }
                (session.addr().to_string(), res.is_ok())
            });
        }

        let mut report = FanoutReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((addr, true)) => report.delivered.push(addr),
                Ok((addr, false)) => report.failed.push(addr),
                Err(e) => tracing::error!("通知任务异常: {}", e),
            }
        }
        report
    }

    /// 通知全部节点开始拦截
    pub async fn start_firewall(&self) -> FanoutReport {
        self.broadcast(Notification::new(NotificationAction::LoadFirewall)).await
    }

    /// 通知全部节点停止拦截
    pub async fn stop_firewall(&self) -> FanoutReport {
        self.broadcast(Notification::new(NotificationAction::UnloadFirewall)).await
    }
}
