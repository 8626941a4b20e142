//! Read-only status view over peer runtime state and configured shares
//! (§4.12). Nothing here mutates anything; it only snapshots state owned
//! elsewhere for the CLI's `peers` command and the status HTTP server.

use serde::Serialize;

use crate::config::ShareConfig;
use crate::net::peer_state::PeerStateSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct ShareSummary {
    pub name: String,
    pub path: String,
    pub delete_propagation: bool,
}

impl From<&ShareConfig> for ShareSummary {
    fn from(share: &ShareConfig) -> Self {
        Self {
            name: share.name.clone(),
            path: share.path.display().to_string(),
            delete_propagation: share.delete_propagation,
        }
    }
}

pub fn share_summaries(shares: &[ShareConfig]) -> Vec<ShareSummary> {
    shares.iter().map(ShareSummary::from).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub node_id: String,
    pub time: i64,
}

pub fn health(node_id: &str) -> HealthStatus {
    HealthStatus {
        ok: true,
        node_id: node_id.to_string(),
        time: chrono::Utc::now().timestamp(),
    }
}

pub type PeerSummary = PeerStateSnapshot;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_summary_carries_delete_propagation_flag() {
        let share = ShareConfig {
            name: "docs".to_string(),
            path: "./docs".into(),
            delete_propagation: true,
            ignore_file: None,
        };
        let summary = ShareSummary::from(&share);
        assert_eq!(summary.name, "docs");
        assert!(summary.delete_propagation);
    }

    #[test]
    fn health_reports_ok_true() {
        let h = health("node-a");
        assert!(h.ok);
        assert_eq!(h.node_id, "node-a");
    }
}
