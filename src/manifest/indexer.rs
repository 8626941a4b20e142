//! Builds a `Manifest` by walking a share tree in sorted order, pruning
//! hidden directories and ignore-pattern matches, and hashing the
//! remaining regular files under a bounded worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::hash::{compute_file_hash, HashOptions, HashPolicy};
use crate::util::ignore::IgnoreSet;
use crate::util::pathing::to_posix_string;

use super::{Manifest, ManifestEntry, ManifestPolicy};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub hash_policy: HashPolicy,
    pub small_threshold_mb: u64,
    pub sample_mb: u64,
    pub ignore_hidden: bool,
    pub max_workers: usize,
}

struct Candidate {
    rel: String,
    abs: PathBuf,
}

/// Walk `root`, pruning hidden dirs / ignore matches, collecting the
/// sorted list of regular files still in scope. `ignore_count` is bumped
/// once per pruned directory or file, matching the policy counter.
fn walk_sorted(
    root: &Path,
    dir: &Path,
    ignore: &IgnoreSet,
    ignore_hidden: bool,
    ignore_count: &mut u64,
    out: &mut Vec<Candidate>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_path_buf();
        let rel_posix = to_posix_string(&rel);

        if file_type.is_dir() {
            let hidden = ignore_hidden && (name.starts_with('.') || name == "__pycache__");
            let ignored = ignore.is_ignored(&rel_posix) || ignore.is_ignored(&format!("{rel_posix}/"));
            if hidden || ignored {
                *ignore_count += 1;
                continue;
            }
            walk_sorted(root, &path, ignore, ignore_hidden, ignore_count, out)?;
        } else if file_type.is_file() {
            if ignore.is_ignored(&rel_posix) {
                *ignore_count += 1;
                continue;
            }
            out.push(Candidate {
                rel: rel_posix,
                abs: path,
            });
        }
        // Symlinks and other non-regular entries are skipped silently.
    }
    Ok(())
}

pub async fn build_manifest(
    share_name: &str,
    root: PathBuf,
    ignore_patterns: Vec<String>,
    cfg: IndexerConfig,
) -> std::io::Result<Manifest> {
    let ignore = IgnoreSet::new(ignore_patterns);
    let root_for_walk = root.clone();
    let ignore_hidden = cfg.ignore_hidden;

    let (candidates, ignore_count) = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        let mut ignore_count = 0u64;
        walk_sorted(&root_for_walk, &root_for_walk, &ignore, ignore_hidden, &mut ignore_count, &mut out)?;
        out.sort_by(|a, b| a.rel.cmp(&b.rel));
        std::io::Result::Ok((out, ignore_count))
    })
    .await
    .expect("indexer walk task panicked")?;

    let semaphore = Arc::new(Semaphore::new(cfg.max_workers.max(1)));
    let hash_opts = HashOptions {
        policy: cfg.hash_policy,
        small_threshold_mb: cfg.small_threshold_mb,
        sample_mb: cfg.sample_mb,
    };

    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
        let opts = hash_opts;
        tasks.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            stat_and_hash(candidate, &opts)
        }));
    }

    let mut entries = Vec::with_capacity(tasks.len());
    let mut skipped = 0u64;
    for task in tasks {
        match task.await.expect("hash task panicked") {
            StatResult::Entry(entry) => entries.push(entry),
            StatResult::SkippedPermission => skipped += 1,
            StatResult::SkippedSilent => {}
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let generated_at = Utc::now().format("%Y-%m-%dT%H:%M:%S%.fZ").to_string();
    Ok(Manifest {
        share: share_name.to_string(),
        generated_at,
        entries,
        policy: ManifestPolicy {
            hash: format!("{:?}", hash_opts.policy).to_lowercase(),
            ignore_count,
            skipped,
            small_threshold_mb: cfg.small_threshold_mb,
            sample_mb: cfg.sample_mb,
        },
    })
}

enum StatResult {
    Entry(ManifestEntry),
    SkippedPermission,
    SkippedSilent,
}

/// `stat` the candidate on the calling (blocking) thread; permission
/// errors count toward `skipped`, vanished files are dropped silently.
fn stat_and_hash(candidate: Candidate, opts: &HashOptions) -> StatResult {
    let meta = match std::fs::symlink_metadata(&candidate.abs) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StatResult::SkippedSilent,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!(path = %candidate.abs.display(), "permission denied during stat");
            return StatResult::SkippedPermission;
        }
        Err(e) => {
            tracing::warn!(path = %candidate.abs.display(), error = %e, "stat failed");
            return StatResult::SkippedSilent;
        }
    };
    if !meta.is_file() {
        return StatResult::SkippedSilent;
    }
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let hash = match compute_file_hash(&candidate.abs, size, mtime, opts) {
        Ok(h) => h,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StatResult::SkippedSilent,
        Err(e) => {
            tracing::warn!(path = %candidate.abs.display(), error = %e, "hashing failed");
            return StatResult::SkippedSilent;
        }
    };

    StatResult::Entry(ManifestEntry {
        path: candidate.rel,
        size,
        mtime,
        hash,
    })
}
