//! SQLite 持久化

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::schema;
use crate::storage::{
    ConnectionRecord, EventByTypeRecord, NodeRecord, Order, RuleRecord, StatsRecord, Storage,
};
use crate::types::{ClientConfig, Event, Rule, Statistics};

/// SQLite 存储
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// 打开（必要时创建）数据库文件
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, &format!("{:?}", path))
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA_SQL)?;
        tracing::info!("数据库已连接: {}", label);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    fn insert_rules(conn: &Connection, addr: &str, rules: &[Rule]) -> Result<usize> {
        let mut inserted = 0;
        for rule in rules {
            inserted += conn.execute(
                r#"
                INSERT INTO rules (name, node, enabled, action, duration, operator_type, operator_operand, operator_data)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(name) DO NOTHING
                "#,
                params![
                    &rule.name,
                    addr,
                    rule.enabled,
                    rule.action.to_string(),
                    rule.duration.as_str(),
                    rule.operator.operator_type.to_string(),
                    rule.operator.operand.to_string(),
                    &rule.operator.data,
                ],
            )?;
        }
        Ok(inserted)
    }

    fn insert_event(conn: &Connection, addr: &str, event: &Event) -> Result<()> {
        let con = &event.connection;
        conn.execute(
            r#"
            INSERT INTO connections (time, node, protocol, src_ip, src_port, dst_ip, dst_host, dst_port, user_id, pid, process_path, process_cwd, process_args, rule_name, rule_action)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT DO NOTHING
            "#,
            params![
                &event.time,
                addr,
                &con.protocol,
                &con.src_ip,
                con.src_port,
                &con.dst_ip,
                con.dst_host.as_deref().unwrap_or_default(),
                con.dst_port,
                con.user_id,
                con.process_id,
                &con.process_path,
                &con.process_cwd,
                con.process_args.join(" "),
                &event.rule.name,
                event.rule.action.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn add_node(&self, addr: &str, config: &ClientConfig) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO nodes (address, name, version, is_firewall_running, config, log_level)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(address) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                is_firewall_running = excluded.is_firewall_running,
                config = excluded.config,
                log_level = excluded.log_level
            "#,
            params![
                addr,
                &config.name,
                &config.version,
                config.is_firewall_running,
                &config.config,
                config.log_level,
            ],
        )?;
        Self::insert_rules(&tx, addr, &config.rules)?;
        tx.commit()?;
        Ok(())
    }

    fn add_rules(&self, addr: &str, rules: &[Rule]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::insert_rules(&tx, addr, rules)?;
        tx.commit()?;
        Ok(())
    }

    fn update_stats(&self, addr: &str, stats: &Statistics) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO statistics (node, daemon_version, rules, uptime, dns_responses, connections, ignored, accepted, dropped, rule_hits, rule_misses)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                addr,
                &stats.daemon_version,
                stats.rules as i64,
                stats.uptime as i64,
                stats.dns_responses as i64,
                stats.connections as i64,
                stats.ignored as i64,
                stats.accepted as i64,
                stats.dropped as i64,
                stats.rule_hits as i64,
                stats.rule_misses as i64,
            ],
        )?;

        for event in &stats.events {
            Self::insert_event(&tx, addr, event)?;
            Self::insert_rules(&tx, addr, std::slice::from_ref(&event.rule))?;
        }

        let now = Utc::now().to_rfc3339();
        for (name, table) in stats.by_type() {
            for (what, hits) in table {
                tx.execute(
                    r#"
                    INSERT INTO events_by_type (time, node, name, what, hits)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(node, name, what) DO UPDATE SET
                        time = excluded.time,
                        hits = excluded.hits
                    "#,
                    params![&now, addr, name, what, *hits as i64],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_stats(&self) -> Result<Vec<StatsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT node, daemon_version, rules, uptime, dns_responses, connections, ignored, accepted, dropped, rule_hits, rule_misses
            FROM statistics
            ORDER BY node
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(StatsRecord {
                node: row.get(0)?,
                daemon_version: row.get(1)?,
                rules: row.get::<_, i64>(2)? as u64,
                uptime: row.get::<_, i64>(3)? as u64,
                dns_responses: row.get::<_, i64>(4)? as u64,
                connections: row.get::<_, i64>(5)? as u64,
                ignored: row.get::<_, i64>(6)? as u64,
                accepted: row.get::<_, i64>(7)? as u64,
                dropped: row.get::<_, i64>(8)? as u64,
                rule_hits: row.get::<_, i64>(9)? as u64,
                rule_misses: row.get::<_, i64>(10)? as u64,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn get_node_stats(&self) -> Result<Vec<NodeRecord>> {
        let stats = self.get_stats()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT address, name, version, is_firewall_running, config, log_level FROM nodes ORDER BY address",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(NodeRecord {
                address: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
                is_firewall_running: row.get(3)?,
                config: row.get(4)?,
                log_level: row.get(5)?,
                statistics: None,
            })
        })?;

        let mut nodes = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        for node in &mut nodes {
            node.statistics = stats.iter().find(|s| s.node == node.address).cloned();
        }
        Ok(nodes)
    }

    fn get_events(&self, order: Order, limit: usize) -> Result<Vec<ConnectionRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT time, node, protocol, src_ip, src_port, dst_ip, dst_host, dst_port, user_id, pid, process_path, process_cwd, process_args, rule_name, rule_action
            FROM connections
            ORDER BY time {}, rowid {}
            LIMIT ?1
            "#,
            order.as_sql(),
            order.as_sql()
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ConnectionRecord {
                time: row.get(0)?,
                node: row.get(1)?,
                protocol: row.get(2)?,
                src_ip: row.get(3)?,
                src_port: row.get(4)?,
                dst_ip: row.get(5)?,
                dst_host: row.get(6)?,
                dst_port: row.get(7)?,
                user_id: row.get(8)?,
                pid: row.get(9)?,
                process_path: row.get(10)?,
                process_cwd: row.get(11)?,
                process_args: row.get(12)?,
                rule_name: row.get(13)?,
                rule_action: row.get(14)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn get_events_by_type(
        &self,
        view: &str,
        order: Order,
        limit: usize,
    ) -> Result<Vec<EventByTypeRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT time, node, name, what, hits
            FROM events_by_type
            WHERE name = ?1
            ORDER BY hits {}, what ASC
            LIMIT ?2
            "#,
            order.as_sql()
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt.query_map(params![view, limit as i64], |row| {
            Ok(EventByTypeRecord {
                time: row.get(0)?,
                node: row.get(1)?,
                name: row.get(2)?,
                what: row.get(3)?,
                hits: row.get::<_, i64>(4)? as u64,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn get_rules(&self, order: Order, limit: usize) -> Result<Vec<RuleRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT name, node, enabled, action, duration, operator_type, operator_operand, operator_data
            FROM rules
            ORDER BY name {}
            LIMIT ?1
            "#,
            order.as_sql()
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RuleRecord {
                name: row.get(0)?,
                node: row.get(1)?,
                enabled: row.get(2)?,
                action: row.get(3)?,
                duration: row.get(4)?,
                operator_type: row.get(5)?,
                operator_operand: row.get(6)?,
                operator_data: row.get(7)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

impl SqliteStorage {
    /// 查询单个节点记录
    pub fn get_node(&self, addr: &str) -> Result<Option<NodeRecord>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                "SELECT address, name, version, is_firewall_running, config, log_level FROM nodes WHERE address = ?1",
                params![addr],
                |row| {
                    Ok(NodeRecord {
                        address: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                        is_firewall_running: row.get(3)?,
                        config: row.get(4)?,
                        log_level: row.get(5)?,
                        statistics: None,
                    })
                },
            )
            .optional()?;
        Ok(node)
    }
}
