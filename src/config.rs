//! YAML-shaped configuration: deserialization plus the full cross-field
//! validation ruleset. `load` is the only entry point other modules use;
//! everything downstream treats `KeyMeshConfig` as immutable truth.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hash::HashPolicy;

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub listen_port: u16,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub fingerprint_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareAccess {
    pub share: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub cert_fingerprint: Option<String>,
    #[serde(default)]
    pub shares_access: Vec<ShareAccess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub delete_propagation: bool,
    #[serde(default)]
    pub ignore_file: Option<String>,
}

fn default_chunk_size_mb() -> u64 {
    16
}
fn default_max_concurrent_per_peer() -> usize {
    2
}
fn default_retry_backoff() -> Vec<f64> {
    vec![1.0, 3.0, 10.0]
}
fn default_max_retries() -> u32 {
    5
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}
fn default_audit_log_dir() -> PathBuf {
    PathBuf::from("logs/transfers")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_max_concurrent_per_peer")]
    pub max_concurrent_per_peer: usize,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_sec: Vec<f64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub rate_limit_mb_s: Option<f64>,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    #[serde(default = "default_audit_log_dir")]
    pub audit_log_dir: PathBuf,
}

fn default_heartbeat_sec() -> u64 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_backoff() -> Vec<f64> {
    vec![1.0, 3.0, 10.0, 30.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_heartbeat_sec")]
    pub heartbeat_sec: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: Vec<f64>,
}

fn default_status_port() -> u16 {
    8787
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

fn default_small_threshold_mb() -> u64 {
    8
}
fn default_sample_mb() -> u64 {
    1
}
fn default_max_workers() -> usize {
    4
}
fn default_hash_policy() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_small_threshold_mb")]
    pub small_threshold_mb: u64,
    #[serde(default = "default_sample_mb")]
    pub sample_mb: u64,
    #[serde(default = "default_hash_policy")]
    pub hash_policy: String,
    #[serde(default = "default_ignore_hidden")]
    pub ignore_hidden: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_ignore_hidden() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeshConfig {
    pub node: NodeConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub shares: Vec<ShareConfig>,
    #[serde(default = "TransferConfig::default_config")]
    pub transfer: TransferConfig,
    #[serde(default = "ConnectivityConfig::default_config")]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub status_http: StatusHttpConfig,
    #[serde(default = "IndexingConfig::default_config")]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransferConfig {
    fn default_config() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            max_concurrent_per_peer: default_max_concurrent_per_peer(),
            retry_backoff_sec: default_retry_backoff(),
            max_retries: default_max_retries(),
            rate_limit_mb_s: None,
            sessions_dir: default_sessions_dir(),
            audit_log_dir: default_audit_log_dir(),
        }
    }
}

impl ConnectivityConfig {
    fn default_config() -> Self {
        Self {
            heartbeat_sec: default_heartbeat_sec(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff: default_backoff(),
        }
    }
}

impl IndexingConfig {
    fn default_config() -> Self {
        Self {
            small_threshold_mb: default_small_threshold_mb(),
            sample_mb: default_sample_mb(),
            hash_policy: default_hash_policy(),
            ignore_hidden: default_ignore_hidden(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for StatusHttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_bind_host(),
            port: default_status_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl KeyMeshConfig {
    pub fn share(&self, name: &str) -> Option<&ShareConfig> {
        self.shares.iter().find(|s| s.name == name)
    }

    pub fn peer(&self, id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Share names a given peer may touch, filtered to shares that exist.
    pub fn allowed_shares_for_peer(&self, peer_id: &str) -> Vec<String> {
        match self.peer(peer_id) {
            None => Vec::new(),
            Some(peer) => peer
                .shares_access
                .iter()
                .filter(|sa| self.share(&sa.share).is_some())
                .map(|sa| sa.share.clone())
                .collect(),
        }
    }
}

fn port_in_range(addr: &str) -> Result<(), ConfigError> {
    let port_part = addr
        .rsplit_once(':')
        .map(|(_, p)| p)
        .ok_or_else(|| ConfigError::Invalid(format!("address {addr} missing a port")))?;
    let port: u32 = port_part
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("address {addr} has a non-numeric port")))?;
    if port == 0 || port > 65535 {
        return Err(ConfigError::Invalid(format!(
            "address {addr} has an out-of-range port"
        )));
    }
    Ok(())
}

fn validate(cfg: &KeyMeshConfig) -> Result<(), ConfigError> {
    if cfg.node.listen_port == 0 {
        return Err(ConfigError::Invalid(
            "node.listen_port must be in 1..65535".to_string(),
        ));
    }

    let mut seen_shares = std::collections::HashSet::new();
    for share in &cfg.shares {
        if !seen_shares.insert(share.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate share name: {}",
                share.name
            )));
        }
    }

    for peer in &cfg.peers {
        port_in_range(&peer.addr)?;
        for access in &peer.shares_access {
            if cfg.share(&access.share).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "peer {} references undefined share {}",
                    peer.id, access.share
                )));
            }
            if access.mode != "ro" && access.mode != "rw" {
                return Err(ConfigError::Invalid(format!(
                    "peer {} share {} has invalid mode {}",
                    peer.id, access.share, access.mode
                )));
            }
        }
    }

    if cfg.connectivity.heartbeat_sec == 0 {
        return Err(ConfigError::Invalid(
            "connectivity.heartbeat_sec must be positive".to_string(),
        ));
    }
    if cfg.connectivity.connect_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "connectivity.connect_timeout_ms must be positive".to_string(),
        ));
    }
    if cfg.connectivity.backoff.iter().any(|v| *v <= 0.0) {
        return Err(ConfigError::Invalid(
            "connectivity.backoff values must be positive".to_string(),
        ));
    }

    if cfg.transfer.retry_backoff_sec.iter().any(|v| *v <= 0.0) {
        return Err(ConfigError::Invalid(
            "transfer.retry_backoff_sec values must be positive".to_string(),
        ));
    }
    if cfg.transfer.max_retries == 0 {
        return Err(ConfigError::Invalid(
            "transfer.max_retries must be positive".to_string(),
        ));
    }
    if cfg.transfer.max_concurrent_per_peer == 0 {
        return Err(ConfigError::Invalid(
            "transfer.max_concurrent_per_peer must be positive".to_string(),
        ));
    }

    if cfg.indexing.small_threshold_mb == 0 {
        return Err(ConfigError::Invalid(
            "indexing.small_threshold_mb must be positive".to_string(),
        ));
    }
    if cfg.indexing.sample_mb == 0 {
        return Err(ConfigError::Invalid(
            "indexing.sample_mb must be positive".to_string(),
        ));
    }
    if cfg.indexing.max_workers == 0 {
        return Err(ConfigError::Invalid(
            "indexing.max_workers must be positive".to_string(),
        ));
    }
    cfg.indexing
        .hash_policy
        .parse::<HashPolicy>()
        .map_err(ConfigError::Invalid)?;

    Ok(())
}

fn check_files_exist(cfg: &KeyMeshConfig) -> Result<(), ConfigError> {
    for (label, path) in [
        ("security.ca_cert", &cfg.security.ca_cert),
        ("security.cert", &cfg.security.cert),
        ("security.key", &cfg.security.key),
    ] {
        if !path.exists() {
            return Err(ConfigError::MissingFile(format!(
                "{label}: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

pub fn load(path: &Path, check_files: bool) -> Result<KeyMeshConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let cfg: KeyMeshConfig = serde_yaml::from_str(&text)?;
    validate(&cfg)?;
    if check_files {
        check_files_exist(&cfg)?;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
node:
  id: node-a
  listen_port: 51888
security:
  ca_cert: ca.pem
  cert: node.pem
  key: node.key
shares:
  - name: docs
    path: ./docs
peers:
  - id: node-b
    addr: "127.0.0.1:51889"
    shares_access:
      - share: docs
        mode: rw
"#
    }

    #[test]
    fn loads_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();
        let cfg = load(&path, false).unwrap();
        assert_eq!(cfg.node.id, "node-a");
        assert_eq!(cfg.allowed_shares_for_peer("node-b"), vec!["docs".to_string()]);
    }

    #[test]
    fn rejects_unknown_share_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = minimal_yaml().replace("share: docs", "share: missing");
        std::fs::write(&path, yaml).unwrap();
        assert!(load(&path, false).is_err());
    }

    #[test]
    fn rejects_duplicate_share_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = format!(
            "{}\n  - name: docs\n    path: ./docs2\n",
            minimal_yaml().trim_end()
        );
        std::fs::write(&path, yaml).unwrap();
        assert!(load(&path, false).is_err());
    }

    #[test]
    fn rejects_invalid_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = minimal_yaml().replace("mode: rw", "mode: rx");
        std::fs::write(&path, yaml).unwrap();
        assert!(load(&path, false).is_err());
    }

    #[test]
    fn check_files_reports_missing_cert_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();
        assert!(load(&path, true).is_err());
    }
}
