//! 节点注册表
//!
//! 以 `网络类型:主机` 为键保存在线节点会话。注册表是会话的唯一持有者，
//! 会话移除后其它组件不再持有。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use super::session::NodeSession;
use crate::types::{ClientConfig, Statistics};

/// 本地（Unix Socket）节点统一使用的主机名
pub const LOCAL_HOST: &str = "localhost";

/// 传输层对端信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// 网络类型：tcp / unix
    pub network: String,
    /// 对端地址原文（`host:port`、socket 路径或 `@`）
    pub addr: String,
}

impl PeerInfo {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }

    /// 未命名的 Unix Socket 对端
    pub fn unix() -> Self {
        Self::new("unix", "@")
    }

    /// 由对端信息得到会话键，端口不参与
    ///
    /// - `tcp` + `10.0.0.5:40022` → `tcp:10.0.0.5`
    /// - `unix` + 任意 → `unix:localhost`
    /// - 无法解析 → None（不允许以空串作键）
    pub fn node_addr(&self) -> Option<String> {
        if self.network.is_empty() {
            return None;
        }
        if self.network == "unix" {
            return Some(format!("unix:{}", LOCAL_HOST));
        }

        let host = match self.addr.parse::<SocketAddr>() {
            Ok(sock) => sock.ip().to_string(),
            Err(_) => {
                let (host, port) = self.addr.rsplit_once(':')?;
                port.parse::<u16>().ok()?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return None;
                }
                host.to_string()
            }
        };
        Some(format!("{}:{}", self.network, host))
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

/// 节点注册表
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeSession>>>,
    /// 当前节点数，用于等待首个节点接入
    count: watch::Sender<usize>,
}

impl NodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 节点注册
    ///
    /// 同一地址已存在会话时整体替换，旧会话被关闭。对端地址无法解析时只记日志，
    /// 不创建会话。
    pub fn add(&self, peer: &PeerInfo, config: ClientConfig) -> Option<Arc<NodeSession>> {
        let Some(addr) = peer.node_addr() else {
            tracing::warn!("⚠️ 节点未注册，无效地址: {}", peer);
            return None;
        };
        Some(self.insert(addr, config))
    }

    /// 以已知会话键插入或替换会话
    pub fn insert(&self, addr: String, config: ClientConfig) -> Arc<NodeSession> {
        let session = NodeSession::new(addr.clone(), config);
        let replaced = {
            let mut nodes = self.nodes.write();
            let replaced = nodes.insert(addr, session.clone());
            self.count.send_replace(nodes.len());
            replaced
        };

        if let Some(old) = replaced {
            tracing::info!("🔁 节点重连，替换旧会话: {}", old.addr());
            old.close();
        }
        session
    }

    pub fn get(&self, addr: &str) -> Option<Arc<NodeSession>> {
        self.nodes.read().get(addr).cloned()
    }

    /// 按地址查找会话
    pub fn lookup(&self, peer: &PeerInfo) -> Option<Arc<NodeSession>> {
        peer.node_addr().and_then(|addr| self.get(&addr))
    }

    /// 标记离线并移除
    pub fn remove(&self, addr: &str) -> bool {
        let removed = {
            let mut nodes = self.nodes.write();
            let removed = nodes.remove(addr);
            self.count.send_replace(nodes.len());
            removed
        };

        match removed {
            Some(session) => {
                session.close();
                tracing::info!("👋 节点下线: {}", addr);
                true
            }
            None => false,
        }
    }

    /// 仅当注册表中仍是同一个会话时移除
    ///
    /// 通知流退出时使用：节点可能已经重连，新会话占用了同一个地址。
    pub fn remove_session(&self, session: &Arc<NodeSession>) -> bool {
        let removed = {
            let mut nodes = self.nodes.write();
            let same = nodes
                .get(session.addr())
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if same {
                nodes.remove(session.addr());
                self.count.send_replace(nodes.len());
            }
            same
        };

        session.close();
        if removed {
            tracing::info!("👋 节点下线: {}", session.addr());
        }
        removed
    }

    /// 替换节点统计；节点不存在时告警并忽略
    pub fn update_stats(&self, peer: &PeerInfo, stats: Statistics) -> bool {
        match self.lookup(peer) {
            Some(session) => {
                session.update_stats(stats);
                true
            }
            None => {
                tracing::warn!("⚠️ update_stats: 节点不存在 {}", peer);
                false
            }
        }
    }

    /// 刷新节点 last_seen（不带统计的 Ping）
    pub fn touch(&self, peer: &PeerInfo) -> bool {
        match self.lookup(peer) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// 当前全部会话的快照
    pub fn all(&self) -> Vec<Arc<NodeSession>> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn total(&self) -> usize {
        self.nodes.read().len()
    }

    /// 等待至少一个节点接入
    pub async fn wait_for_nodes(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            nodes: RwLock::new(HashMap::new()),
            count,
        }
    }
}
