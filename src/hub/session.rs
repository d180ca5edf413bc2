//! 节点会话
//!
//! 一个已接入节点在 hub 侧的实时状态：配置、统计、最后心跳时间、通知发件箱

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::types::{ClientConfig, NodeInfo, NodeStatus, Notification, Statistics};

/// 发件箱容量：前一条未被取走时，下一条发送方需要等待
const OUTBOX_CAPACITY: usize = 1;

/// 通知入队失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// 会话已关闭
    Closed,
    /// 等待超时（发件箱一直未被取走）
    Timeout,
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Closed => write!(f, "session closed"),
            NotifyError::Timeout => write!(f, "outbox full, timed out"),
        }
    }
}

struct SessionState {
    config: ClientConfig,
    stats: Option<Statistics>,
    last_seen: DateTime<Utc>,
    status: NodeStatus,
}

/// 节点会话
pub struct NodeSession {
    /// 会话键：`网络类型:主机`
    addr: String,
    state: RwLock<SessionState>,
    outbox_tx: mpsc::Sender<Notification>,
    /// 通知流接入时取走
    outbox_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
    closed: watch::Sender<bool>,
    stream_attached: AtomicBool,
}

impl NodeSession {
    pub fn new(addr: impl Into<String>, config: ClientConfig) -> Arc<Self> {
        let addr = addr.into();
        tracing::info!(
            "🆕 新节点: {} - {}, {}",
            config.name,
            config.version,
            addr
        );

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            addr,
            state: RwLock::new(SessionState {
                config,
                stats: None,
                last_seen: Utc::now(),
                status: NodeStatus::Online,
            }),
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            closed,
            stream_attached: AtomicBool::new(false),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> ClientConfig {
        self.state.read().config.clone()
    }

    pub fn stats(&self) -> Option<Statistics> {
        self.state.read().stats.clone()
    }

    /// 在读锁内访问统计，避免整份克隆
    pub fn with_stats<R>(&self, f: impl FnOnce(Option<&Statistics>) -> R) -> R {
        f(self.state.read().stats.as_ref())
    }

    /// 替换统计快照并刷新 last_seen
    pub fn update_stats(&self, stats: Statistics) {
        let mut state = self.state.write();
        state.stats = Some(stats);
        state.last_seen = Utc::now();
    }

    /// 只刷新 last_seen
    pub fn touch(&self) {
        self.state.write().last_seen = Utc::now();
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.state.read().last_seen
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    /// 标记离线并唤醒通知流，使其退出
    pub fn close(&self) {
        self.state.write().status = NodeStatus::Offline;
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn has_stream(&self) -> bool {
        self.stream_attached.load(Ordering::Acquire)
    }

    pub fn summary(&self) -> NodeInfo {
        let state = self.state.read();
        NodeInfo {
            address: self.addr.clone(),
            name: state.config.name.clone(),
            version: state.config.version.clone(),
            status: state.status,
            is_firewall_running: state.config.is_firewall_running,
            last_seen: state.last_seen,
            has_stream: self.has_stream(),
        }
    }

    /// 通知入队
    ///
    /// 发件箱满时等待，最长 `timeout`；会话关闭时立即失败。
    pub async fn send_notification(
        &self,
        notification: Notification,
        timeout: Duration,
    ) -> Result<(), NotifyError> {
        if self.is_closed() {
            return Err(NotifyError::Closed);
        }
        let mut closed = self.closed.subscribe();

        tokio::select! {
            res = self.outbox_tx.send(notification) => res.map_err(|_| NotifyError::Closed),
            _ = closed.wait_for(|c| *c) => Err(NotifyError::Closed),
            _ = tokio::time::sleep(timeout) => Err(NotifyError::Timeout),
        }
    }

    /// 接入通知流，取走发件箱
    ///
    /// 每个会话只能接入一次，重复接入返回 None。
    pub fn attach_stream(&self) -> Option<Outbox> {
        let rx = self.outbox_rx.lock().take()?;
        self.stream_attached.store(true, Ordering::Release);
        tracing::debug!("📡 通知流已接入: {}", self.addr);
        Some(Outbox {
            rx,
            closed: self.closed.subscribe(),
        })
    }
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("NodeSession")
            .field("addr", &self.addr)
            .field("name", &state.config.name)
            .field("status", &state.status)
            .field("last_seen", &state.last_seen)
            .finish()
    }
}

/// 通知流侧的发件箱
pub struct Outbox {
    rx: mpsc::Receiver<Notification>,
    closed: watch::Receiver<bool>,
}

impl Outbox {
    /// 取下一条通知；会话关闭后返回 None
    pub async fn next(&mut self) -> Option<Notification> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            notification = self.rx.recv() => notification,
            _ = self.closed.wait_for(|c| *c) => None,
        }
    }
}
