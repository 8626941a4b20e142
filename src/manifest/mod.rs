pub mod differ;
pub mod indexer;
pub mod store;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPolicy {
    pub hash: String,
    pub ignore_count: u64,
    pub skipped: u64,
    pub small_threshold_mb: u64,
    pub sample_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub share: String,
    pub generated_at: String,
    pub entries: Vec<ManifestEntry>,
    pub policy: ManifestPolicy,
}

impl Manifest {
    /// `M.entries` must be sorted ascending by `path`; the indexer builds
    /// them that way, this just documents and asserts the invariant where
    /// it is load-bearing (e.g. after deserializing an externally-written
    /// manifest file).
    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].path < w[1].path)
    }
}
