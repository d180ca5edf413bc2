//! IPC 协议定义
//!
//! 通信方式：TCP / Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 节点接入流程：
//! 1. `Subscribe` 上报配置
//! 2. 另开连接发送 `Notifications`，该连接随即转为推送流，保持打开
//! 3. 定期 `Ping` 上报统计
//! 4. 遇到无规则匹配的出站连接时 `AskRule`，阻塞等待裁决

use serde::{Deserialize, Serialize};

use crate::types::{ClientConfig, ConnectionRequest, Notification, NotificationAction, Rule, Statistics};

/// 请求类型（Client → Hub）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 节点注册（上报配置）
    Subscribe(ClientConfig),

    /// 节点心跳 + 统计
    Ping {
        id: u64,
        #[serde(default)]
        stats: Option<Statistics>,
    },

    /// 请求裁决（阻塞，最长 ask_timeout）
    AskRule(ConnectionRequest),

    /// 打开通知流，之后本连接只用于推送
    Notifications,

    /// 节点对通知的回执（仅出现在通知流上）
    NotificationReply {
        id: u64,
        #[serde(default)]
        code: i32,
        #[serde(default)]
        data: String,
    },

    /// 操作员：阻塞获取下一条待裁决连接
    NextConnection,

    /// 操作员：提交裁决
    ResolveConnection { id: u64, rule: Rule },

    /// 操作员：启停全部节点的拦截
    Firewall { action: NotificationAction },

    /// 查询
    Query { query: QueryType },

    /// 心跳（保持连接）
    Heartbeat,
}

/// 响应类型（Hub → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// Subscribe 回执
    Config(ClientConfig),

    /// Ping 回执
    Pong { id: u64 },

    /// AskRule 结果
    Rule { rule: Rule },

    /// 待裁决连接
    Prompt { prompt: ConnectionPrompt },

    /// 通知广播结果
    Broadcast { delivered: usize, failed: usize },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

/// 推送消息（Hub → 节点通知流）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    Notification(Notification),
}

/// 交给操作员的待裁决连接
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPrompt {
    /// 裁决 ID，提交裁决时回传
    pub id: u64,
    /// 发起请求的节点
    pub node: String,
    pub connection: ConnectionRequest,
}

/// 查询类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// Hub 状态
    Status,
    /// 节点列表
    Nodes,
    /// 全局统计汇总
    Summary,
}

/// 错误码
pub mod code {
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const CONFLICT: i32 = 409;
    pub const GONE: i32 = 410;
    pub const INTERNAL: i32 = 500;
}

impl Response {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

/// 序列化为一行 JSONL
pub fn to_line<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, RuleDuration};

    #[test]
    fn test_subscribe_deserialize() {
        let json = r#"{
            "type": "Subscribe",
            "name": "host1",
            "version": "1.0.1",
            "is_firewall_running": true
        }"#;

        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::Subscribe(config) => {
                assert_eq!(config.name, "host1");
                assert!(config.is_firewall_running);
                assert!(config.rules.is_empty());
            }
            _ => panic!("Expected Subscribe"),
        }
    }

    #[test]
    fn test_ask_rule_deserialize() {
        let json = r#"{
            "type": "AskRule",
            "protocol": "tcp",
            "dst_ip": "1.1.1.1",
            "dst_port": 443,
            "process_path": "/usr/bin/curl",
            "process_args": ["curl", "https://one.one.one.one"]
        }"#;

        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::AskRule(con) => {
                assert_eq!(con.process_path, "/usr/bin/curl");
                assert_eq!(con.dst_port, 443);
                assert_eq!(con.dst_host, None);
            }
            _ => panic!("Expected AskRule"),
        }
    }

    #[test]
    fn test_ping_without_stats() {
        let request: Request = serde_json::from_str(r#"{"type":"Ping","id":7}"#).unwrap();
        assert!(matches!(request, Request::Ping { id: 7, stats: None }));
    }

    #[test]
    fn test_unit_requests() {
        let json = serde_json::to_string(&Request::Notifications).unwrap();
        assert_eq!(json, r#"{"type":"Notifications"}"#);

        let json = serde_json::to_string(&Request::Query { query: QueryType::Summary }).unwrap();
        assert!(json.contains("\"query\":\"Summary\""));
    }

    #[test]
    fn test_rule_response_line() {
        let con = ConnectionRequest {
            protocol: "udp".into(),
            dst_port: 53,
            process_path: "/usr/sbin/ntpd".into(),
            ..Default::default()
        };
        let response = Response::Rule {
            rule: Rule::for_connection(&con, Action::Allow, RuleDuration::Always),
        };
        let line = to_line(&response).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: Response = serde_json::from_str(line.trim_end()).unwrap();
        match parsed {
            Response::Rule { rule } => assert_eq!(rule.name, "ntpd-udp-sport0-dport53-allow"),
            _ => panic!("Expected Rule"),
        }
    }

    #[test]
    fn test_push_notification_serialize() {
        let push = Push::Notification(Notification {
            id: 1,
            action: NotificationAction::UnloadFirewall,
        });
        let json = serde_json::to_string(&push).unwrap();
        assert_eq!(json, r#"{"type":"Notification","id":1,"action":"UnloadFirewall"}"#);
    }
}
