//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- 节点表（以会话键为主键，重复注册整体更新）
CREATE TABLE IF NOT EXISTS nodes (
    address TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    is_firewall_running INTEGER NOT NULL DEFAULT 0,
    config TEXT NOT NULL DEFAULT '',
    log_level INTEGER NOT NULL DEFAULT 0
);

-- 节点统计（每个节点一行，只保留最新值）
CREATE TABLE IF NOT EXISTS statistics (
    node TEXT PRIMARY KEY NOT NULL,
    daemon_version TEXT NOT NULL DEFAULT '',
    rules INTEGER NOT NULL DEFAULT 0,
    uptime INTEGER NOT NULL DEFAULT 0,
    dns_responses INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    ignored INTEGER NOT NULL DEFAULT 0,
    accepted INTEGER NOT NULL DEFAULT 0,
    dropped INTEGER NOT NULL DEFAULT 0,
    rule_hits INTEGER NOT NULL DEFAULT 0,
    rule_misses INTEGER NOT NULL DEFAULT 0
);

-- 连接事件（同一连接只记录一次）
CREATE TABLE IF NOT EXISTS connections (
    time TEXT NOT NULL,
    node TEXT NOT NULL,
    protocol TEXT NOT NULL,
    src_ip TEXT NOT NULL,
    src_port INTEGER NOT NULL,
    dst_ip TEXT NOT NULL,
    dst_host TEXT NOT NULL DEFAULT '',
    dst_port INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    process_path TEXT NOT NULL,
    process_cwd TEXT NOT NULL DEFAULT '',
    process_args TEXT NOT NULL DEFAULT '',
    rule_name TEXT NOT NULL DEFAULT '',
    rule_action TEXT NOT NULL DEFAULT '',
    UNIQUE (node, protocol, src_ip, src_port, dst_ip, dst_host, dst_port, user_id, pid, process_path)
);

-- 规则（规则名由节点保证唯一，重复忽略）
CREATE TABLE IF NOT EXISTS rules (
    name TEXT PRIMARY KEY NOT NULL,
    node TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    action TEXT NOT NULL,
    duration TEXT NOT NULL,
    operator_type TEXT NOT NULL,
    operator_operand TEXT NOT NULL,
    operator_data TEXT NOT NULL
);

-- 分维度统计（协议 / 主机 / 地址 / 端口 / 用户 / 可执行文件）
CREATE TABLE IF NOT EXISTS events_by_type (
    time TEXT NOT NULL,
    node TEXT NOT NULL,
    name TEXT NOT NULL,
    what TEXT NOT NULL,
    hits INTEGER NOT NULL DEFAULT 0,
    UNIQUE (node, name, what)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_connections_time ON connections(time);
CREATE INDEX IF NOT EXISTS idx_connections_node ON connections(node);
CREATE INDEX IF NOT EXISTS idx_events_by_type_name ON events_by_type(name, hits);
"#;
