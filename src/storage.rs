//! 持久化接口
//!
//! Hub 在 Subscribe / Ping / AskRule 时顺带落库，失败只记日志，不影响 RPC。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ClientConfig, Rule, Statistics};

/// 排序方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(Order::Asc),
            "desc" => Ok(Order::Desc),
            _ => Err(format!("Invalid order: {}", s)),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// 节点统计行
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub node: String,
    pub daemon_version: String,
    pub rules: u64,
    pub uptime: u64,
    pub dns_responses: u64,
    pub connections: u64,
    pub ignored: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub rule_hits: u64,
    pub rule_misses: u64,
}

impl StatsRecord {
    pub fn from_stats(node: &str, stats: &Statistics) -> Self {
        Self {
            node: node.to_string(),
            daemon_version: stats.daemon_version.clone(),
            rules: stats.rules,
            uptime: stats.uptime,
            dns_responses: stats.dns_responses,
            connections: stats.connections,
            ignored: stats.ignored,
            accepted: stats.accepted,
            dropped: stats.dropped,
            rule_hits: stats.rule_hits,
            rule_misses: stats.rule_misses,
        }
    }
}

/// 节点行（含统计）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    pub name: String,
    pub version: String,
    pub is_firewall_running: bool,
    pub config: String,
    pub log_level: u32,
    pub statistics: Option<StatsRecord>,
}

/// 连接事件行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub time: String,
    pub node: String,
    pub protocol: String,
    pub src_ip: String,
    pub src_port: u32,
    pub dst_ip: String,
    pub dst_host: String,
    pub dst_port: u32,
    pub user_id: u32,
    pub pid: u32,
    pub process_path: String,
    pub process_cwd: String,
    pub process_args: String,
    pub rule_name: String,
    pub rule_action: String,
}

/// 规则行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub name: String,
    pub node: String,
    pub enabled: bool,
    pub action: String,
    pub duration: String,
    pub operator_type: String,
    pub operator_operand: String,
    pub operator_data: String,
}

/// 分维度统计行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventByTypeRecord {
    pub time: String,
    pub node: String,
    /// 维度：ByProto / ByAddress / ByHost / ByPort / ByUid / ByExecutable
    pub name: String,
    pub what: String,
    pub hits: u64,
}

/// 持久化协作方
pub trait Storage: Send + Sync {
    /// 记录节点（重复注册整体更新），同时记录节点声明的规则
    fn add_node(&self, addr: &str, config: &ClientConfig) -> Result<()>;

    /// 记录规则，已存在的规则名忽略
    fn add_rules(&self, addr: &str, rules: &[Rule]) -> Result<()>;

    /// 记录节点统计、连接事件和分维度统计
    fn update_stats(&self, addr: &str, stats: &Statistics) -> Result<()>;

    fn get_stats(&self) -> Result<Vec<StatsRecord>>;

    fn get_node_stats(&self) -> Result<Vec<NodeRecord>>;

    fn get_events(&self, order: Order, limit: usize) -> Result<Vec<ConnectionRecord>>;

    fn get_events_by_type(
        &self,
        view: &str,
        order: Order,
        limit: usize,
    ) -> Result<Vec<EventByTypeRecord>>;

    fn get_rules(&self, order: Order, limit: usize) -> Result<Vec<RuleRecord>>;
}
