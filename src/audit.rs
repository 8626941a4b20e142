//! Append-only daily transfer audit log (§4.11). One line per event,
//! flushed immediately; callers never see a torn write because each
//! `record` call holds the log's mutex for the duration of the append.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct AuditLog {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for_today(&self) -> PathBuf {
        self.dir.join(format!("{}.log", Utc::now().format("%Y-%m-%d")))
    }

    /// Append one line: `[<ts>] peer=<> share=<> file=<> action=<> status=<> size=<int> time=<secs>s`.
    pub async fn record(
        &self,
        peer: &str,
        share: &str,
        file: &str,
        action: &str,
        status: &str,
        size: u64,
        elapsed_secs: f64,
    ) {
        let _guard = self.lock.lock().await;
        if let Err(e) = self.append(peer, share, file, action, status, size, elapsed_secs).await {
            tracing::warn!(error = %e, "failed to append audit log entry");
        }
    }

    async fn append(
        &self,
        peer: &str,
        share: &str,
        file: &str,
        action: &str,
        status: &str,
        size: u64,
        elapsed_secs: f64,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let line = format!(
            "[{timestamp}] peer={peer} share={share} file={file} action={action} status={status} size={size} time={elapsed_secs:.2}s\n"
        );
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for_today())
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }
}

/// Read every audit line under `dir` across all days, newest file last.
pub fn log_paths(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "log").unwrap_or(false))
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_appends_one_formatted_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.record("node-b", "docs", "a.bin", "push", "success", 12582912, 4.5)
            .await;
        log.record("node-b", "docs", "b.bin", "push", "failed", 0, 0.1)
            .await;

        let paths = log_paths(dir.path()).unwrap();
        assert_eq!(paths.len(), 1);
        let contents = std::fs::read_to_string(&paths[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("peer=node-b"));
        assert!(lines[0].contains("size=12582912"));
        assert!(lines[0].contains("status=success"));
        assert!(lines[1].contains("status=failed"));
    }
}
