//! Path-keyed three-way manifest comparison: hash-first, mtime-fallback.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{Manifest, ManifestEntry};

#[derive(Debug, Clone, Serialize, Default)]
pub struct DiffSummary {
    pub added: u64,
    pub modified: u64,
    pub deleted: u64,
    pub delta: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub summary: DiffSummary,
}

fn entry_map(manifest: &Manifest) -> BTreeMap<&str, &ManifestEntry> {
    manifest
        .entries
        .iter()
        .map(|e| (e.path.as_str(), e))
        .collect()
}

/// `p ∈ L ∩ R` is modified iff: both hashes present and differ; exactly
/// one hash present; or both blank and `local.mtime > remote.mtime`.
/// Equal hashes always mean "not modified", regardless of mtime.
fn is_modified(local: &ManifestEntry, remote: &ManifestEntry) -> bool {
    match (local.hash.is_empty(), remote.hash.is_empty()) {
        (false, false) => local.hash != remote.hash,
        (true, true) => local.mtime > remote.mtime,
        _ => true,
    }
}

pub fn compare_manifests(local: &Manifest, remote: &Manifest) -> DiffResult {
    let local_map = entry_map(local);
    let remote_map = entry_map(remote);

    let mut added: Vec<String> = local_map
        .keys()
        .filter(|p| !remote_map.contains_key(*p))
        .map(|p| p.to_string())
        .collect();
    added.sort();

    let mut deleted: Vec<String> = remote_map
        .keys()
        .filter(|p| !local_map.contains_key(*p))
        .map(|p| p.to_string())
        .collect();
    deleted.sort();

    let mut modified: Vec<String> = local_map
        .iter()
        .filter_map(|(path, local_entry)| {
            remote_map.get(path).and_then(|remote_entry| {
                is_modified(local_entry, remote_entry).then(|| path.to_string())
            })
        })
        .collect();
    modified.sort();

    let summary = DiffSummary {
        added: added.len() as u64,
        modified: modified.len() as u64,
        deleted: deleted.len() as u64,
        delta: (added.len() + modified.len() + deleted.len()) as u64,
    };

    DiffResult {
        added,
        modified,
        deleted,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPolicy;

    fn manifest(share: &str, entries: Vec<ManifestEntry>) -> Manifest {
        Manifest {
            share: share.to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            entries,
            policy: ManifestPolicy {
                hash: "auto".to_string(),
                ignore_count: 0,
                skipped: 0,
                small_threshold_mb: 1,
                sample_mb: 1,
            },
        }
    }

    fn entry(path: &str, hash: &str, mtime: i64) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            size: 1,
            mtime,
            hash: hash.to_string(),
        }
    }

    #[test]
    fn scenario_manifest_diff() {
        let local = manifest(
            "docs",
            vec![entry("a.txt", "h1", 100), entry("b.txt", "h2", 100)],
        );
        let remote = manifest(
            "docs",
            vec![entry("a.txt", "h1", 50), entry("c.txt", "h3", 200)],
        );
        let diff = compare_manifests(&local, &remote);
        assert_eq!(diff.added, vec!["b.txt"]);
        assert_eq!(diff.deleted, vec!["c.txt"]);
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn idempotence() {
        let m = manifest("docs", vec![entry("a.txt", "h1", 100)]);
        let diff = compare_manifests(&m, &m);
        assert!(diff.added.is_empty() && diff.modified.is_empty() && diff.deleted.is_empty());
    }

    #[test]
    fn symmetry() {
        let a = manifest(
            "docs",
            vec![entry("a.txt", "h1", 100), entry("b.txt", "h2", 100)],
        );
        let b = manifest(
            "docs",
            vec![entry("a.txt", "h1", 50), entry("c.txt", "h3", 200)],
        );
        let ab = compare_manifests(&a, &b);
        let ba = compare_manifests(&b, &a);
        assert_eq!(ab.added, ba.deleted);
        assert_eq!(ab.deleted, ba.added);
        assert_eq!(ab.modified, ba.modified);
    }

    #[test]
    fn both_hashes_blank_equal_mtime_is_not_modified() {
        let local = manifest("docs", vec![entry("a.txt", "", 100)]);
        let remote = manifest("docs", vec![entry("a.txt", "", 100)]);
        let diff = compare_manifests(&local, &remote);
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn exactly_one_hash_present_is_modified() {
        let local = manifest("docs", vec![entry("a.txt", "h1", 100)]);
        let remote = manifest("docs", vec![entry("a.txt", "", 100)]);
        let diff = compare_manifests(&local, &remote);
        assert_eq!(diff.modified, vec!["a.txt"]);
    }
}
