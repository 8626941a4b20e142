//! Persists manifests as `<share>_<sanitized-ts>.json` plus a stable
//! `<share>_latest.json` alias, and loads them back for `diff`.

use std::path::{Path, PathBuf};

use super::Manifest;

fn safe_share_name(share: &str) -> String {
    share.replace('/', "-")
}

/// Strip `:`/`-` from an RFC3339 timestamp so it is safe as a filename
/// component, keeping the file-sortable ordering of the original string.
fn sanitize_timestamp(ts: &str) -> String {
    ts.replace([':', '-'], "")
}

fn versioned_path(out_dir: &Path, share: &str, generated_at: &str) -> PathBuf {
    out_dir.join(format!(
        "{}_{}.json",
        safe_share_name(share),
        sanitize_timestamp(generated_at)
    ))
}

fn latest_path(out_dir: &Path, share: &str) -> PathBuf {
    out_dir.join(format!("{}_latest.json", safe_share_name(share)))
}

/// Write the versioned manifest file plus the `_latest.json` alias, both
/// as 2-space-indented JSON with a trailing newline.
pub fn save_manifest(out_dir: &Path, manifest: &Manifest) -> std::io::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let mut body = serde_json::to_string_pretty(manifest).expect("manifest always serializable");
    body.push('\n');
    let versioned = versioned_path(out_dir, &manifest.share, &manifest.generated_at);
    std::fs::write(&versioned, &body)?;
    std::fs::write(latest_path(out_dir, &manifest.share), &body)?;
    Ok(())
}

pub fn load_manifest(path: &Path) -> std::io::Result<Manifest> {
    let body = std::fs::read_to_string(path)?;
    serde_json::from_str(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Load the `_latest.json` alias for `share` under `out_dir`, if present.
pub fn load_latest_manifest(out_dir: &Path, share: &str) -> std::io::Result<Option<Manifest>> {
    let path = latest_path(out_dir, share);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(load_manifest(&path)?))
}

/// Load the most recent *previous* (non-`_latest`) version, requiring at
/// least two persisted versions to exist.
pub fn load_previous_manifest(out_dir: &Path, share: &str) -> std::io::Result<Option<Manifest>> {
    let prefix = format!("{}_", safe_share_name(share));
    let mut versions: Vec<PathBuf> = std::fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".json") && !n.ends_with("_latest.json"))
                .unwrap_or(false)
        })
        .collect();
    versions.sort();
    if versions.len() < 2 {
        return Ok(None);
    }
    let previous = &versions[versions.len() - 2];
    Ok(Some(load_manifest(previous)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPolicy;

    fn sample(share: &str, generated_at: &str) -> Manifest {
        Manifest {
            share: share.to_string(),
            generated_at: generated_at.to_string(),
            entries: vec![],
            policy: ManifestPolicy {
                hash: "auto".to_string(),
                ignore_count: 0,
                skipped: 0,
                small_threshold_mb: 1,
                sample_mb: 1,
            },
        }
    }

    #[test]
    fn save_then_load_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = sample("docs", "2026-01-01T00:00:00.000Z");
        save_manifest(dir.path(), &m).unwrap();
        let loaded = load_latest_manifest(dir.path(), "docs").unwrap().unwrap();
        assert_eq!(loaded.share, "docs");
    }

    #[test]
    fn latest_and_versioned_files_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let m = sample("docs", "2026-01-01T00:00:00.000Z");
        save_manifest(dir.path(), &m).unwrap();
        let versioned = versioned_path(dir.path(), "docs", &m.generated_at);
        let latest = latest_path(dir.path(), "docs");
        assert_eq!(
            std::fs::read(versioned).unwrap(),
            std::fs::read(latest).unwrap()
        );
    }
}
