//! Process-wide application context (§4.13): the single place that owns
//! the peer registry, the in-memory manifest cache, and the handle used
//! to wait for every configured peer's first handshake. Constructed once
//! at startup from `KeyMeshConfig` and shared behind an `Arc` with the
//! server accept loop, the client connectors, the transfer engine, and
//! the status HTTP server.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::KeyMeshConfig;
use crate::manifest::Manifest;
use crate::net::peer_state::{PeerRuntimeState, PeerStateSnapshot};

pub struct AppContext {
    pub config: Arc<KeyMeshConfig>,
    peers_by_id: HashMap<String, Arc<PeerRuntimeState>>,
    peers_by_fingerprint: HashMap<String, Arc<PeerRuntimeState>>,
    manifest_cache: Mutex<HashMap<String, Arc<Manifest>>>,
}

impl AppContext {
    pub fn new(config: Arc<KeyMeshConfig>) -> Self {
        let mut peers_by_id = HashMap::new();
        let mut peers_by_fingerprint = HashMap::new();
        for peer in &config.peers {
            let allowed = config.allowed_shares_for_peer(&peer.id);
            let state = Arc::new(PeerRuntimeState::new(&peer.id, &peer.addr, allowed));
            if let Some(fp) = &peer.cert_fingerprint {
                peers_by_fingerprint.insert(fp.to_lowercase(), state.clone());
            }
            peers_by_id.insert(peer.id.clone(), state);
        }
        Self {
            config,
            peers_by_id,
            peers_by_fingerprint,
            manifest_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn peer_by_id(&self, id: &str) -> Option<Arc<PeerRuntimeState>> {
        self.peers_by_id.get(id).cloned()
    }

    pub fn peer_by_fingerprint(&self, fingerprint: &str) -> Option<Arc<PeerRuntimeState>> {
        self.peers_by_fingerprint.get(&fingerprint.to_lowercase()).cloned()
    }

    pub fn peers_by_id(&self) -> &HashMap<String, Arc<PeerRuntimeState>> {
        &self.peers_by_id
    }

    pub fn peers_by_fingerprint(&self) -> &HashMap<String, Arc<PeerRuntimeState>> {
        &self.peers_by_fingerprint
    }

    pub async fn peer_snapshots(&self) -> Vec<PeerStateSnapshot> {
        let mut snapshots = Vec::with_capacity(self.peers_by_id.len());
        for state in self.peers_by_id.values() {
            snapshots.push(state.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn allowed_shares_for_peer(&self, peer_id: &str) -> Vec<String> {
        self.config.allowed_shares_for_peer(peer_id)
    }

    /// Wait for every configured peer to complete at least one handshake.
    /// Used by `run --once-handshake` to exit once the mesh is up instead
    /// of serving forever.
    pub async fn wait_all_handshakes(&self) {
        let mut set = tokio::task::JoinSet::new();
        for state in self.peers_by_id.values().cloned() {
            set.spawn(async move { state.wait_handshake().await });
        }
        while set.join_next().await.is_some() {}
    }

    pub async fn cache_manifest(&self, share: &str, manifest: Arc<Manifest>) {
        self.manifest_cache
            .lock()
            .await
            .insert(share.to_string(), manifest);
    }

    pub async fn cached_manifest(&self, share: &str) -> Option<Arc<Manifest>> {
        self.manifest_cache.lock().await.get(share).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectivityConfig, IndexingConfig, LoggingConfig, NodeConfig, PeerConfig, SecurityConfig, ShareAccess, ShareConfig, StatusHttpConfig, TransferConfig};

    fn sample_config() -> KeyMeshConfig {
        KeyMeshConfig {
            node: NodeConfig {
                id: "node-a".to_string(),
                listen_port: 51888,
                bind_host: "0.0.0.0".to_string(),
            },
            security: SecurityConfig {
                ca_cert: "ca.pem".into(),
                cert: "node.pem".into(),
                key: "node.key".into(),
                fingerprint_whitelist: vec![],
            },
            peers: vec![PeerConfig {
                id: "node-b".to_string(),
                addr: "127.0.0.1:51889".to_string(),
                cert_fingerprint: Some("sha256:AABB".to_string()),
                shares_access: vec![ShareAccess {
                    share: "docs".to_string(),
                    mode: "rw".to_string(),
                }],
            }],
            shares: vec![ShareConfig {
                name: "docs".to_string(),
                path: "./docs".into(),
                delete_propagation: false,
                ignore_file: None,
            }],
            transfer: TransferConfig {
                chunk_size_mb: 16,
                max_concurrent_per_peer: 2,
                retry_backoff_sec: vec![1.0],
                max_retries: 1,
                rate_limit_mb_s: None,
                sessions_dir: "data/sessions".into(),
                audit_log_dir: "logs/transfers".into(),
            },
            connectivity: ConnectivityConfig {
                heartbeat_sec: 10,
                connect_timeout_ms: 5000,
                backoff: vec![1.0],
            },
            status_http: StatusHttpConfig::default(),
            indexing: IndexingConfig {
                small_threshold_mb: 8,
                sample_mb: 1,
                hash_policy: "auto".to_string(),
                ignore_hidden: true,
                max_workers: 4,
            },
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn builds_peer_registry_by_id_and_fingerprint() {
        let ctx = AppContext::new(Arc::new(sample_config()));
        assert!(ctx.peer_by_id("node-b").is_some());
        assert!(ctx.peer_by_fingerprint("sha256:aabb").is_some());
        assert!(ctx.peer_by_fingerprint("sha256:ccdd").is_none());
    }

    #[test]
    fn allowed_shares_delegates_to_config() {
        let ctx = AppContext::new(Arc::new(sample_config()));
        assert_eq!(ctx.allowed_shares_for_peer("node-b"), vec!["docs".to_string()]);
    }

    #[tokio::test]
    async fn manifest_cache_round_trips() {
        let ctx = AppContext::new(Arc::new(sample_config()));
        assert!(ctx.cached_manifest("docs").await.is_none());
        let manifest = Arc::new(Manifest {
            share: "docs".to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            entries: vec![],
            policy: crate::manifest::ManifestPolicy {
                hash: "auto".to_string(),
                ignore_count: 0,
                skipped: 0,
                small_threshold_mb: 1,
                sample_mb: 1,
            },
        });
        ctx.cache_manifest("docs", manifest.clone()).await;
        assert!(ctx.cached_manifest("docs").await.is_some());
    }
}
