//! Per-file resume metadata: a `SessionRecord` JSON file next to a
//! `.part` body. `finalize()` is the only way a `.part` becomes the real
//! file — it removes the record, then atomically replaces the target.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub peer: String,
    pub share: String,
    pub file: String,
    pub mode: String,
    pub chunk_id: u64,
    pub bytes_done: u64,
    pub updated: i64,
}

/// Replace `/`, `\`, `:` with `_` so `(peer, share, absolute_path)` maps
/// to a single filesystem-safe record name.
fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

pub fn record_path(sessions_dir: &Path, peer: &str, share: &str, absolute_path: &Path) -> PathBuf {
    let name = format!(
        "{}__{}__{}.json",
        sanitize_component(peer),
        sanitize_component(share),
        sanitize_component(&absolute_path.display().to_string())
    );
    sessions_dir.join(name)
}

pub fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(PART_SUFFIX);
    PathBuf::from(os)
}

pub fn load(path: &Path) -> std::io::Result<Option<SessionRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = std::fs::read_to_string(path)?;
    let record = serde_json::from_str(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(record))
}

pub fn save(path: &Path, record: &SessionRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(record).expect("session record always serializable");
    std::fs::write(path, body)
}

/// Delete the session record, then atomically replace `final_path` with
/// its `.part` file. A no-op if no `.part` exists.
pub fn finalize(record_path: &Path, final_path: &Path) -> std::io::Result<()> {
    let part = part_path(final_path);
    if !part.exists() {
        return Ok(());
    }
    if record_path.exists() {
        std::fs::remove_file(record_path)?;
    }
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&part, final_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_path_sanitizes_separators_and_colons() {
        let dir = Path::new("/sessions");
        let p = record_path(dir, "node-b", "docs", Path::new("/shares/docs/a/b.txt"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains('/'));
        assert!(!name.contains('\\'));
        assert!(!name.contains(':'));
        assert!(name.starts_with("node-b__docs__"));
    }

    #[test]
    fn finalize_is_noop_without_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("rec.json");
        let final_path = dir.path().join("a.bin");
        finalize(&record, &final_path).unwrap();
        assert!(!final_path.exists());
    }

    #[test]
    fn finalize_renames_part_and_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let record_file = dir.path().join("rec.json");
        let final_path = dir.path().join("a.bin");
        let part = part_path(&final_path);
        std::fs::write(&part, b"content").unwrap();
        std::fs::write(&record_file, "{}").unwrap();

        finalize(&record_file, &final_path).unwrap();

        assert!(!part.exists());
        assert!(!record_file.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"content");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        let record = SessionRecord {
            peer: "node-b".to_string(),
            share: "docs".to_string(),
            file: "a.bin".to_string(),
            mode: "push".to_string(),
            chunk_id: 3,
            bytes_done: 24,
            updated: 1000,
        };
        save(&path, &record).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.bytes_done, 24);
        assert_eq!(loaded.chunk_id, 3);
    }
}
