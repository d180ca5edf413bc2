//! 连接裁决
//!
//! 节点的 AskRule 在这里阻塞，直到外部裁决方（操作员 / 自动策略）给出规则，
//! 或超时后返回兜底规则。
//!
//! 两个交接点：
//! - 请求交接：容量 1 的通道，裁决方从这里取待裁决连接
//! - 裁决交接：每个请求一个 oneshot，登记在 `in_flight` 槽位
//!
//! 同一时刻只允许一个请求处于裁决中（single-flight，面向单个操作员）。
//! 后来者排队等待许可，整个等待过程同样计入超时。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::config::{FallbackPolicy, HubConfig};
use crate::protocol::ConnectionPrompt;
use crate::types::{ConnectionRequest, Rule};

/// 单个请求的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArbitrationState {
    /// 已收到，等待 single-flight 许可
    Received,
    /// 已交给裁决方
    AwaitingDecision,
    /// 裁决方已给出规则
    Decided,
    /// 超时，使用兜底规则
    TimedOut,
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// 裁决方给出
    Decided,
    /// 超时兜底
    TimedOut,
    /// 无人值守模式，直接兜底
    Headless,
}

/// AskRule 的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub rule: Rule,
    pub outcome: Outcome,
}

/// 提交裁决的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 已交给等待中的请求
    Delivered,
    /// 请求已超时或不存在，裁决被丢弃
    Stale,
}

/// 裁决计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub submitted: u64,
    pub decided: u64,
    pub timed_out: u64,
    pub headless: u64,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub headless: bool,
    pub timeout: Duration,
    pub fallback: FallbackPolicy,
}

impl From<&HubConfig> for BrokerConfig {
    fn from(config: &HubConfig) -> Self {
        Self {
            headless: config.headless,
            timeout: config.ask_timeout,
            fallback: config.fallback,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

struct InFlight {
    id: u64,
    state: ArbitrationState,
    reply: Option<oneshot::Sender<Rule>>,
}

/// 连接裁决器
pub struct DecisionBroker {
    config: BrokerConfig,
    /// single-flight 许可
    flight: Semaphore,
    /// 请求交接（发送端）
    request_tx: mpsc::Sender<ConnectionPrompt>,
    /// 请求交接（接收端），裁决方接入时取走
    request_rx: Mutex<Option<mpsc::Receiver<ConnectionPrompt>>>,
    /// 当前裁决中的请求
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    submitted: AtomicU64,
    decided: AtomicU64,
    timed_out: AtomicU64,
    headless_count: AtomicU64,
}

impl DecisionBroker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            flight: Semaphore::new(1),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            decided: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            headless_count: AtomicU64::new(0),
        })
    }

    pub fn is_headless(&self) -> bool {
        self.config.headless
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// 兜底规则：按进程路径匹配，动作与有效期取配置
    pub fn fallback_rule(&self, request: &ConnectionRequest) -> Rule {
        Rule::for_connection(
            request,
            self.config.fallback.action,
            self.config.fallback.duration,
        )
    }

    /// 接入裁决方
    ///
    /// 同一时刻只有一个裁决方；已被取走时返回 None，裁决方 drop 后可再次接入。
    pub fn take_consumer(self: &Arc<Self>) -> Option<DecisionConsumer> {
        let rx = self.request_rx.lock().take()?;
        tracing::info!("🧑‍⚖️ 裁决方已接入");
        Some(DecisionConsumer {
            broker: self.clone(),
            rx: Some(rx),
        })
    }

    /// 请求裁决，最长等待 `timeout`
    ///
    /// 无人值守模式下立即返回兜底规则。
    pub async fn ask(&self, node: &str, request: ConnectionRequest) -> Verdict {
        self.submitted.fetch_add(1, Ordering::Relaxed);

        if self.config.headless {
            self.headless_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("🤖 无人值守，直接兜底: {} {}", node, request.process_path);
            return Verdict {
                rule: self.fallback_rule(&request),
                outcome: Outcome::Headless,
            };
        }

        let fallback = self.fallback_rule(&request);
        match tokio::time::timeout(self.config.timeout, self.arbitrate(node, request)).await {
            Ok(Some(rule)) => {
                self.decided.fetch_add(1, Ordering::Relaxed);
                Verdict {
                    rule,
                    outcome: Outcome::Decided,
                }
            }
            Ok(None) | Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "⏰ 裁决超时 ({}s)，使用兜底规则: {} -> {}",
                    self.config.timeout.as_secs(),
                    node,
                    fallback.name
                );
                Verdict {
                    rule: fallback,
                    outcome: Outcome::TimedOut,
                }
            }
        }
    }

    /// 取得许可 → 登记 → 交给裁决方 → 等待裁决
    ///
    /// future 被丢弃（超时 / 节点断开）时，`FlightGuard` 清理槽位，许可随之释放。
    async fn arbitrate(&self, node: &str, request: ConnectionRequest) -> Option<Rule> {
        let _permit = self.flight.acquire().await.ok()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.in_flight.lock() = Some(InFlight {
            id,
            state: ArbitrationState::Received,
            reply: Some(reply_tx),
        });
        let _guard = FlightGuard { broker: self, id };

        let prompt = ConnectionPrompt {
            id,
            node: node.to_string(),
            connection: request,
        };
        tracing::debug!("❓ 待裁决: id={}, node={}, process={}", id, node, prompt.connection.process_path);
        self.request_tx.send(prompt).await.ok()?;
        self.set_state(id, ArbitrationState::AwaitingDecision);

        let rule = reply_rx.await.ok()?;
        self.set_state(id, ArbitrationState::Decided);
        Some(rule)
    }

    fn set_state(&self, id: u64, state: ArbitrationState) {
        if let Some(current) = self.in_flight.lock().as_mut() {
            if current.id == id {
                current.state = state;
            }
        }
    }

    /// 提交裁决
    ///
    /// 只接受当前裁决中的请求 ID；超时后到达的裁决被丢弃。
    pub fn resolve(&self, id: u64, rule: Rule) -> Resolution {
        let reply = {
            let mut slot = self.in_flight.lock();
            match slot.as_mut() {
                Some(current) if current.id == id => current.reply.take(),
                _ => None,
            }
        };

        let delivered = match reply {
            Some(tx) => tx.send(rule).is_ok(),
            None => false,
        };
        if delivered {
            tracing::debug!("✅ 裁决送达: id={}", id);
            Resolution::Delivered
        } else {
            tracing::warn!("🗑️ 丢弃过期裁决: id={}", id);
            Resolution::Stale
        }
    }

    /// 当前裁决中的请求
    pub fn pending(&self) -> Option<(u64, ArbitrationState)> {
        self.in_flight.lock().as_ref().map(|f| (f.id, f.state))
    }

    fn is_pending(&self, id: u64) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.id == id && f.reply.is_some())
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            decided: self.decided.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            headless: self.headless_count.load(Ordering::Relaxed),
        }
    }
}

/// 请求结束时清理裁决槽位
struct FlightGuard<'a> {
    broker: &'a DecisionBroker,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.broker.in_flight.lock();
        if let Some(current) = slot.as_ref() {
            if current.id == self.id {
                if current.state != ArbitrationState::Decided {
                    tracing::debug!("⌛ 请求结束未裁决: id={}, state={:?}", self.id, current.state);
                }
                *slot = None;
            }
        }
    }
}

/// 裁决方
///
/// 阻塞获取下一条待裁决连接，并提交规则。
pub struct DecisionConsumer {
    broker: Arc<DecisionBroker>,
    rx: Option<mpsc::Receiver<ConnectionPrompt>>,
}

impl DecisionConsumer {
    /// 等待下一条待裁决连接
    ///
    /// 已超时的请求残留在交接通道中时直接跳过。
    pub async fn recv(&mut self) -> Option<ConnectionPrompt> {
        let rx = self.rx.as_mut()?;
        loop {
            let prompt = rx.recv().await?;
            if self.broker.is_pending(prompt.id) {
                return Some(prompt);
            }
            tracing::debug!("🗑️ 跳过已过期请求: id={}", prompt.id);
        }
    }

    pub fn resolve(&self, id: u64, rule: Rule) -> Resolution {
        self.broker.resolve(id, rule)
    }
}

impl Drop for DecisionConsumer {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.broker.request_rx.lock() = Some(rx);
            tracing::info!("🧑‍⚖️ 裁决方已断开");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, RuleDuration};

    fn curl() -> ConnectionRequest {
        ConnectionRequest {
            protocol: "tcp".into(),
            src_port: 40000,
            dst_ip: "93.184.216.34".into(),
            dst_port: 443,
            process_path: "/usr/bin/curl".into(),
            ..Default::default()
        }
    }

    fn wget() -> ConnectionRequest {
        ConnectionRequest {
            process_path: "/usr/bin/wget".into(),
            ..curl()
        }
    }

    fn broker(timeout: Duration) -> Arc<DecisionBroker> {
        DecisionBroker::new(BrokerConfig {
            headless: false,
            timeout,
            fallback: FallbackPolicy::default(),
        })
    }

    #[tokio::test]
    async fn test_headless_returns_immediately() {
        let broker = DecisionBroker::new(BrokerConfig {
            headless: true,
            ..Default::default()
        });

        let start = tokio::time::Instant::now();
        let verdict = broker.ask("tcp:10.0.0.5", curl()).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(verdict.outcome, Outcome::Headless);
        assert_eq!(verdict.rule.action, Action::Deny);
        assert_eq!(verdict.rule.duration, RuleDuration::Once);
        assert_eq!(verdict.rule.operator.data, "/usr/bin/curl");

        // 结果确定
        assert_eq!(broker.ask("tcp:10.0.0.5", curl()).await, verdict);
    }

    #[tokio::test]
    async fn test_decision_delivered() {
        let broker = broker(Duration::from_secs(120));
        let mut consumer = broker.take_consumer().unwrap();

        let asker = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.5", curl()).await })
        };

        let prompt = consumer.recv().await.unwrap();
        assert_eq!(prompt.node, "tcp:10.0.0.5");
        assert_eq!(prompt.connection.process_path, "/usr/bin/curl");
        assert_eq!(
            broker.pending(),
            Some((prompt.id, ArbitrationState::AwaitingDecision))
        );

        let rule = Rule::for_connection(&prompt.connection, Action::Allow, RuleDuration::Always);
        assert_eq!(consumer.resolve(prompt.id, rule.clone()), Resolution::Delivered);

        let verdict = asker.await.unwrap();
        assert_eq!(verdict.outcome, Outcome::Decided);
        assert_eq!(verdict.rule, rule);
        assert_eq!(broker.pending(), None);
        assert_eq!(broker.stats().decided, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_fallback_within_deadline() {
        let broker = broker(Duration::from_secs(120));
        let _consumer = broker.take_consumer().unwrap();

        let start = tokio::time::Instant::now();
        let verdict = broker.ask("tcp:10.0.0.5", curl()).await;
        let elapsed = start.elapsed();

        assert_eq!(verdict.outcome, Outcome::TimedOut);
        assert_eq!(verdict.rule, broker.fallback_rule(&curl()));
        assert!(elapsed >= Duration::from_secs(120));
        assert!(elapsed < Duration::from_secs(121));
        assert_eq!(broker.pending(), None);
        assert_eq!(broker.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_consumer() {
        let broker = broker(Duration::from_secs(120));
        let verdict = broker.ask("unix:localhost", curl()).await;
        assert_eq!(verdict.outcome, Outcome::TimedOut);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let broker = broker(Duration::from_secs(120));
        let mut consumer = broker.take_consumer().unwrap();

        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.1", curl()).await })
        };
        let p1 = consumer.recv().await.unwrap();

        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.2", wget()).await })
        };

        // 第一个请求裁决前，第二个请求不会到达裁决方
        let early = tokio::time::timeout(Duration::from_millis(100), consumer.recv()).await;
        assert!(early.is_err());
        assert_eq!(broker.pending().map(|(id, _)| id), Some(p1.id));

        let allow = Rule::for_connection(&p1.connection, Action::Allow, RuleDuration::Once);
        consumer.resolve(p1.id, allow);
        assert_eq!(first.await.unwrap().outcome, Outcome::Decided);

        let p2 = consumer.recv().await.unwrap();
        assert_eq!(p2.node, "tcp:10.0.0.2");
        assert_eq!(p2.connection.process_path, "/usr/bin/wget");
        let deny = Rule::for_connection(&p2.connection, Action::Deny, RuleDuration::Once);
        consumer.resolve(p2.id, deny.clone());
        assert_eq!(second.await.unwrap().rule, deny);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_decision_discarded() {
        let broker = broker(Duration::from_secs(5));
        let mut consumer = broker.take_consumer().unwrap();

        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.1", curl()).await })
        };
        let p1 = consumer.recv().await.unwrap();
        assert_eq!(first.await.unwrap().outcome, Outcome::TimedOut);

        // 超时后到达的裁决被丢弃，不会串到下一个请求
        let late = Rule::for_connection(&p1.connection, Action::Allow, RuleDuration::Always);
        assert_eq!(consumer.resolve(p1.id, late.clone()), Resolution::Stale);

        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.2", wget()).await })
        };
        let p2 = consumer.recv().await.unwrap();
        assert_ne!(p2.id, p1.id);
        let rule = Rule::for_connection(&p2.connection, Action::Deny, RuleDuration::Minutes5);
        consumer.resolve(p2.id, rule.clone());

        let verdict = second.await.unwrap();
        assert_eq!(verdict.rule, rule);
        assert_ne!(verdict.rule, late);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_prompt_skipped_by_late_consumer() {
        let broker = broker(Duration::from_secs(5));

        // 无裁决方时请求超时，残留在交接通道
        assert_eq!(
            broker.ask("tcp:10.0.0.1", curl()).await.outcome,
            Outcome::TimedOut
        );

        let mut consumer = broker.take_consumer().unwrap();
        let asker = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.2", wget()).await })
        };

        let prompt = consumer.recv().await.unwrap();
        assert_eq!(prompt.connection.process_path, "/usr/bin/wget");
        let rule = Rule::for_connection(&prompt.connection, Action::Allow, RuleDuration::Once);
        consumer.resolve(prompt.id, rule.clone());
        assert_eq!(asker.await.unwrap().rule, rule);
    }

    #[tokio::test]
    async fn test_consumer_reattach() {
        let broker = broker(Duration::from_secs(1));
        let consumer = broker.take_consumer().unwrap();
        assert!(broker.take_consumer().is_none());
        drop(consumer);
        assert!(broker.take_consumer().is_some());
    }

    #[tokio::test]
    async fn test_resolve_twice() {
        let broker = broker(Duration::from_secs(120));
        let mut consumer = broker.take_consumer().unwrap();

        let asker = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.ask("tcp:10.0.0.5", curl()).await })
        };
        let prompt = consumer.recv().await.unwrap();

        let rule = Rule::for_connection(&prompt.connection, Action::Allow, RuleDuration::Once);
        assert_eq!(broker.resolve(prompt.id, rule.clone()), Resolution::Delivered);
        // 回复通道已取走，第二次提交丢弃
        assert_eq!(broker.resolve(prompt.id, rule.clone()), Resolution::Stale);
        assert_eq!(asker.await.unwrap().rule, rule);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let broker = broker(Duration::from_secs(1));
        let rule = broker.fallback_rule(&curl());
        assert_eq!(broker.resolve(42, rule), Resolution::Stale);
    }
}
