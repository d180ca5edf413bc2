//! 全局统计汇总
//!
//! 每次读取时遍历注册表求和，不缓存。

use serde::{Deserialize, Serialize};

use super::registry::NodeRegistry;
use crate::types::Statistics;

/// 可汇总的计数项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsField {
    Connections,
    Dropped,
    RuleHits,
    Events,
}

impl StatsField {
    fn read(self, stats: &Statistics) -> u64 {
        match self {
            StatsField::Connections => stats.connections,
            StatsField::Dropped => stats.dropped,
            StatsField::RuleHits => stats.rule_hits,
            StatsField::Events => stats.events.len() as u64,
        }
    }
}

/// 全局汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub nodes: usize,
    pub connections: u64,
    pub dropped: u64,
    pub rule_hits: u64,
    pub events: u64,
}

/// 单项求和；尚未上报统计的节点计 0
pub fn stats_sum(registry: &NodeRegistry, field: StatsField) -> u64 {
    registry
        .all()
        .iter()
        .map(|session| session.with_stats(|stats| stats.map_or(0, |s| field.read(s))))
        .sum()
}

/// 基于同一份会话快照计算全部汇总项
pub fn summarize(registry: &NodeRegistry) -> FleetSummary {
    let sessions = registry.all();
    let mut summary = FleetSummary {
        nodes: sessions.len(),
        ..Default::default()
    };

    for session in &sessions {
        session.with_stats(|stats| {
            if let Some(s) = stats {
                summary.connections += StatsField::Connections.read(s);
                summary.dropped += StatsField::Dropped.read(s);
                summary.rule_hits += StatsField::RuleHits.read(s);
                summary.events += StatsField::Events.read(s);
            }
        });
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::registry::PeerInfo;
    use crate::types::ClientConfig;

    fn registry_with(connections: &[Option<u64>]) -> std::sync::Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        for (i, conns) in connections.iter().enumerate() {
            let peer = PeerInfo::new("tcp", format!("10.0.0.{}:5000", i + 1));
            let session = registry.add(&peer, ClientConfig::default()).unwrap();
            if let Some(c) = conns {
                session.update_stats(Statistics {
                    connections: *c,
                    dropped: 1,
                    ..Default::default()
                });
            }
        }
        registry
    }

    #[test]
    fn test_sum_skips_nodes_without_stats() {
        let registry = registry_with(&[Some(5), None, Some(12)]);
        assert_eq!(stats_sum(&registry, StatsField::Connections), 17);
        assert_eq!(stats_sum(&registry, StatsField::Dropped), 2);
    }

    #[test]
    fn test_empty_registry() {
        let registry = NodeRegistry::new();
        assert_eq!(summarize(&registry), FleetSummary::default());
    }

    #[test]
    fn test_summary_tracks_latest_ping() {
        let registry = registry_with(&[Some(5), Some(12)]);
        let session = registry.get("tcp:10.0.0.1").unwrap();
        session.update_stats(Statistics {
            connections: 6,
            rule_hits: 4,
            ..Default::default()
        });

        let summary = summarize(&registry);
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.connections, 18);
        assert_eq!(summary.rule_hits, 4);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.events, 0);
    }
}
