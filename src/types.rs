//! 数据类型定义
//!
//! 节点上报的配置 / 统计、待裁决的连接、下发的规则与通知。

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 规则动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            _ => Err(format!("Invalid action: {}", s)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

/// 规则有效期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleDuration {
    #[serde(rename = "once")]
    Once,
    #[serde(rename = "15s")]
    Seconds15,
    #[serde(rename = "30s")]
    Seconds30,
    #[serde(rename = "5m")]
    Minutes5,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "until restart")]
    UntilRestart,
    #[serde(rename = "always")]
    Always,
}

impl RuleDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleDuration::Once => "once",
            RuleDuration::Seconds15 => "15s",
            RuleDuration::Seconds30 => "30s",
            RuleDuration::Minutes5 => "5m",
            RuleDuration::Hour1 => "1h",
            RuleDuration::UntilRestart => "until restart",
            RuleDuration::Always => "always",
        }
    }
}

impl FromStr for RuleDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "once" => Ok(RuleDuration::Once),
            "15s" => Ok(RuleDuration::Seconds15),
            "30s" => Ok(RuleDuration::Seconds30),
            "5m" => Ok(RuleDuration::Minutes5),
            "1h" => Ok(RuleDuration::Hour1),
            "until restart" | "until-restart" => Ok(RuleDuration::UntilRestart),
            "always" => Ok(RuleDuration::Always),
            _ => Err(format!("Invalid rule duration: {}", s)),
        }
    }
}

impl fmt::Display for RuleDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorType {
    Simple,
    List,
    Regexp,
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorType::Simple => write!(f, "simple"),
            OperatorType::List => write!(f, "list"),
            OperatorType::Regexp => write!(f, "regexp"),
        }
    }
}

/// 匹配字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    #[serde(rename = "process.path")]
    ProcessPath,
    #[serde(rename = "process.command")]
    ProcessCommand,
    #[serde(rename = "user.id")]
    UserId,
    #[serde(rename = "dest.ip")]
    DestIp,
    #[serde(rename = "dest.port")]
    DestPort,
    #[serde(rename = "dest.host")]
    DestHost,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operand::ProcessPath => "process.path",
            Operand::ProcessCommand => "process.command",
            Operand::UserId => "user.id",
            Operand::DestIp => "dest.ip",
            Operand::DestPort => "dest.port",
            Operand::DestHost => "dest.host",
        };
        f.write_str(s)
    }
}

/// 规则匹配条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    #[serde(rename = "type")]
    pub operator_type: OperatorType,
    pub operand: Operand,
    pub data: String,
}

/// 规则（裁决结果，下发给节点）
///
/// 规则名在节点内唯一，由节点保证，hub 不做校验。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub action: Action,
    pub duration: RuleDuration,
    pub operator: Operator,
}

impl Rule {
    /// 以进程路径为匹配条件，为一条连接生成规则
    ///
    /// 规则名格式：`{进程名}-{协议}-sport{源端口}-dport{目的端口}-{动作}`
    pub fn for_connection(con: &ConnectionRequest, action: Action, duration: RuleDuration) -> Self {
        Self {
            name: format!(
                "{}-{}-sport{}-dport{}-{}",
                con.process_name(),
                con.protocol,
                con.src_port,
                con.dst_port,
                action
            ),
            enabled: true,
            action,
            duration,
            operator: Operator {
                operator_type: OperatorType::Simple,
                operand: Operand::ProcessPath,
                data: con.process_path.clone(),
            },
        }
    }
}

/// 待裁决的出站连接
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRequest {
    pub protocol: String,
    pub src_ip: String,
    pub src_port: u32,
    pub dst_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_host: Option<String>,
    pub dst_port: u32,
    pub user_id: u32,
    pub process_id: u32,
    pub process_path: String,
    pub process_cwd: String,
    pub process_args: Vec<String>,
}

impl ConnectionRequest {
    /// 进程名（process_path 的最后一段）
    pub fn process_name(&self) -> &str {
        Path::new(&self.process_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.process_path)
    }
}

/// 节点上报的一条连接事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub time: String,
    pub connection: ConnectionRequest,
    pub rule: Rule,
}

/// 节点配置（Subscribe 时上报，整体替换）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    pub version: String,
    pub is_firewall_running: bool,
    /// 节点原始配置（不解析）
    pub config: String,
    pub log_level: u32,
    pub rules: Vec<Rule>,
}

/// 节点统计快照（Ping 时上报，整体替换，不合并）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
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
    pub by_proto: HashMap<String, u64>,
    pub by_address: HashMap<String, u64>,
    pub by_host: HashMap<String, u64>,
    pub by_port: HashMap<String, u64>,
    pub by_uid: HashMap<String, u64>,
    pub by_executable: HashMap<String, u64>,
    pub events: Vec<Event>,
}

impl Statistics {
    /// 按维度遍历频率表：(维度名, 表)
    pub fn by_type(&self) -> [(&'static str, &HashMap<String, u64>); 6] {
        [
            ("ByProto", &self.by_proto),
            ("ByAddress", &self.by_address),
            ("ByHost", &self.by_host),
            ("ByPort", &self.by_port),
            ("ByUid", &self.by_uid),
            ("ByExecutable", &self.by_executable),
        ]
    }
}

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationAction {
    LoadFirewall,
    UnloadFirewall,
}

/// 下发给节点的控制通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub action: NotificationAction,
}

static LAST_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(0);

impl Notification {
    /// 创建通知，id 取当前纳秒时间戳，并保证严格递增
    pub fn new(action: NotificationAction) -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let mut last = LAST_NOTIFICATION_ID.load(Ordering::Relaxed);
        let id = loop {
            let next = now.max(last + 1);
            match LAST_NOTIFICATION_ID.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };
        Self { id, action }
    }
}

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// 节点概要（列表展示用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: String,
    pub name: String,
    pub version: String,
    pub status: NodeStatus,
    pub is_firewall_running: bool,
    pub last_seen: DateTime<Utc>,
    pub has_stream: bool,
}
