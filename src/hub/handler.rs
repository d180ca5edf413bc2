//! 请求处理器
//!
//! 把节点和操作员的请求分发到注册表、裁决器和广播器。
//! 持久化只在后台执行，失败不影响回执。

use std::sync::Arc;

use parking_lot::RwLock;

use super::broadcaster::Broadcaster;
use super::broker::{DecisionBroker, DecisionConsumer, Outcome, Resolution};
use super::registry::{NodeRegistry, PeerInfo};
use super::stats::summarize;
use super::writer::StorageWriter;
use crate::protocol::{code, QueryType, Request, Response};
use crate::storage::Storage;
use crate::types::{ClientConfig, ConnectionRequest, NotificationAction, Statistics};

/// Hub 版本号（跟随 crate 版本）
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub struct Handler {
    registry: Arc<NodeRegistry>,
    broker: Arc<DecisionBroker>,
    broadcaster: Arc<Broadcaster>,
    /// 当前操作员持有的裁决方
    consumer: tokio::sync::Mutex<Option<DecisionConsumer>>,
    writer: Option<StorageWriter>,
    /// 最近一次收到的统计（任意节点）
    last_stats: RwLock<Option<Statistics>>,
    /// 监听地址（状态查询用）
    listen: String,
}

impl Handler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        broker: Arc<DecisionBroker>,
        broadcaster: Arc<Broadcaster>,
        writer: Option<StorageWriter>,
        listen: String,
    ) -> Self {
        Self {
            registry,
            broker,
            broadcaster,
            consumer: tokio::sync::Mutex::new(None),
            writer,
            last_stats: RwLock::new(None),
            listen,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn last_stats(&self) -> Option<Statistics> {
        self.last_stats.read().clone()
    }

    /// 处理请求
    pub async fn handle(&self, peer: &PeerInfo, request: Request) -> Response {
        match request {
            Request::Subscribe(config) => self.handle_subscribe(peer, config),

            Request::Ping { id, stats } => self.handle_ping(peer, id, stats),

            Request::AskRule(con) => self.handle_ask_rule(peer, con).await,

            Request::NextConnection => self.handle_next_connection().await,

            Request::ResolveConnection { id, rule } => match self.broker.resolve(id, rule) {
                Resolution::Delivered => Response::Ok,
                Resolution::Stale => {
                    Response::error(code::GONE, format!("连接请求已过期: {}", id))
                }
            },

            Request::Firewall { action } => {
                let report = match action {
                    NotificationAction::LoadFirewall => self.broadcaster.start_firewall().await,
                    NotificationAction::UnloadFirewall => self.broadcaster.stop_firewall().await,
                };
                Response::Broadcast {
                    delivered: report.delivered.len(),
                    failed: report.failed.len(),
                }
            }

            Request::Query { query } => self.handle_query(query),

            Request::Heartbeat => Response::Ok,

            // 通知流由连接层接管，不应到达这里
            Request::Notifications | Request::NotificationReply { .. } => {
                Response::error(code::BAD_REQUEST, "通知流请求只能在独立连接上使用")
            }
        }
    }

    fn handle_subscribe(&self, peer: &PeerInfo, config: ClientConfig) -> Response {
        tracing::info!(
            "🤝 节点注册: peer={}, name={}, version={}, rules={}",
            peer,
            config.name,
            config.version,
            config.rules.len()
        );

        if let Some(session) = self.registry.add(peer, config.clone()) {
            let addr = session.addr().to_string();
            self.persist("add_node", move |storage| storage.add_node(&addr, &config));
        }

        // 注册失败也正常回执
        Response::Config(ClientConfig::default())
    }

    fn handle_ping(&self, peer: &PeerInfo, id: u64, stats: Option<Statistics>) -> Response {
        tracing::debug!("💓 Ping: peer={}, id={}", peer, id);

        let Some(stats) = stats else {
            self.registry.touch(peer);
            return Response::Pong { id };
        };

        *self.last_stats.write() = Some(stats.clone());
        if self.registry.update_stats(peer, stats.clone()) {
            if let Some(addr) = peer.node_addr() {
                self.persist("update_stats", move |storage| {
                    storage.update_stats(&addr, &stats)
                });
            }
        }

        Response::Pong { id }
    }

    async fn handle_ask_rule(&self, peer: &PeerInfo, con: ConnectionRequest) -> Response {
        let node = peer.node_addr().unwrap_or_else(|| peer.to_string());
        tracing::debug!(
            "❓ AskRule: node={}, {} {} -> {}:{}",
            node,
            con.process_path,
            con.protocol,
            con.dst_ip,
            con.dst_port
        );

        let verdict = self.broker.ask(&node, con).await;
        tracing::info!(
            "⚖️ 裁决: node={}, rule={}, outcome={:?}",
            node,
            verdict.rule.name,
            verdict.outcome
        );

        // 兜底规则不是裁决结果，不落库
        let rule = verdict.rule;
        if verdict.outcome == Outcome::Decided {
            let persisted = rule.clone();
            self.persist("add_rules", move |storage| {
                storage.add_rules(&node, std::slice::from_ref(&persisted))
            });
        }

        Response::Rule { rule }
    }

    /// 等待下一条待裁决连接
    ///
    /// 同一时刻只允许一个操作员等待。
    async fn handle_next_connection(&self) -> Response {
        let Ok(mut guard) = self.consumer.try_lock() else {
            return Response::error(code::CONFLICT, "已有操作员在等待裁决");
        };

        if guard.is_none() {
            match self.broker.take_consumer() {
                Some(consumer) => *guard = Some(consumer),
                None => return Response::error(code::CONFLICT, "裁决方已被占用"),
            }
        }

        let Some(consumer) = guard.as_mut() else {
            return Response::error(code::INTERNAL, "裁决方不可用");
        };
        match consumer.recv().await {
            Some(prompt) => Response::Prompt { prompt },
            None => Response::error(code::INTERNAL, "裁决通道已关闭"),
        }
    }

    fn handle_query(&self, query: QueryType) -> Response {
        let data = match query {
            QueryType::Status => serde_json::json!({
                "hub_version": HUB_VERSION,
                "listen": self.listen,
                "nodes": self.registry.total(),
                "headless": self.broker.is_headless(),
                "ask_timeout_secs": self.broker.timeout().as_secs(),
                "pending": self.broker.pending().map(|(id, state)| {
                    serde_json::json!({ "id": id, "state": state })
                }),
                "arbitration": self.broker.stats(),
                "persistence": self.writer.is_some(),
            }),
            QueryType::Nodes => {
                let mut nodes: Vec<_> = self.registry.all().iter().map(|s| s.summary()).collect();
                nodes.sort_by(|a, b| a.address.cmp(&b.address));
                serde_json::json!(nodes)
            }
            QueryType::Summary => serde_json::json!({
                "fleet": summarize(&self.registry),
                "last_stats": self.last_stats(),
            }),
        };
        Response::QueryResult { data }
    }

    /// 交给写库线程，不等待结果
    fn persist<F>(&self, op: &'static str, f: F)
    where
        F: FnOnce(&dyn Storage) -> crate::Result<()> + Send + 'static,
    {
        if let Some(writer) = &self.writer {
            writer.submit(op, f);
        }
    }

    /// 等待已提交的写库任务完成
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }
}
