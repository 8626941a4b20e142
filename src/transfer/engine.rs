//! Transfer engine (§4.8): one FIFO queue and worker pool per configured
//! peer, chunk-level retry with bounded backoff, and a persisted task
//! table + queue snapshot so `queue`/`send` survive restarts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::sync::{watch, Mutex, Notify};

use crate::audit::AuditLog;
use crate::error::KeyMeshError;
use crate::net::client::{connect_tls, hello_and_ack};
use crate::transfer::protocol::{send_file, SendConfig};
use crate::transfer::session;
use crate::transfer::{TaskStatus, TransferTask};
use crate::util::pathing::{ensure_within, normalize_path, to_posix_string};

#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub address: String,
    pub expected_fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: String,
    pub chunk_size: u64,
    pub max_concurrent_per_peer: usize,
    pub retry_backoff: Vec<f64>,
    pub max_retries: u32,
    pub rate_limit_bytes_per_sec: Option<f64>,
    pub sessions_dir: PathBuf,
    pub connect_timeout_ms: u64,
    pub whitelist: Vec<String>,
}

struct PeerQueue {
    items: Mutex<VecDeque<u64>>,
    notify: Notify,
}

impl PeerQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, task_id: u64) {
        self.items.lock().await.push_back(task_id);
        self.notify.notify_one();
    }

    async fn pop_wait(&self, dur: Duration) -> Option<u64> {
        if let Some(id) = self.items.lock().await.pop_front() {
            return Some(id);
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(dur, notified).await;
        self.items.lock().await.pop_front()
    }
}

pub struct TransferEngine {
    cfg: EngineConfig,
    share_roots: HashMap<String, PathBuf>,
    peers: HashMap<String, PeerTarget>,
    tls_client_config: Arc<ClientConfig>,
    queues: HashMap<String, Arc<PeerQueue>>,
    tasks: Mutex<BTreeMap<u64, TransferTask>>,
    next_task_id: AtomicU64,
    audit: Arc<AuditLog>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl TransferEngine {
    pub fn new(
        cfg: EngineConfig,
        share_roots: HashMap<String, PathBuf>,
        peers: HashMap<String, PeerTarget>,
        tls_client_config: Arc<ClientConfig>,
        audit: Arc<AuditLog>,
    ) -> Arc<Self> {
        let queues = peers
            .keys()
            .map(|id| (id.clone(), Arc::new(PeerQueue::new())))
            .collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            cfg,
            share_roots,
            peers,
            tls_client_config,
            queues,
            tasks: Mutex::new(BTreeMap::new()),
            next_task_id: AtomicU64::new(1),
            audit,
            stop_tx,
            stop_rx,
        })
    }

    fn queue_snapshot_path(&self) -> PathBuf {
        self.cfg.sessions_dir.join("queue.json")
    }

    fn cancel_flag_path(&self, task_id: u64) -> PathBuf {
        self.cfg.sessions_dir.join(format!("cancel_{task_id}.flag"))
    }

    async fn persist_snapshot(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cfg.sessions_dir)?;
        let tasks = self.tasks.lock().await;
        let ordered: Vec<&TransferTask> = tasks.values().collect();
        let body = serde_json::to_string_pretty(&ordered).expect("task list always serializable");
        std::fs::write(self.queue_snapshot_path(), body)
    }

    /// Resolve `relative_path` under `share`'s root, confirm it exists,
    /// seed `bytes_done` from any prior session record, and assign the
    /// task a monotonic id. Persists the queue snapshot before returning.
    pub async fn enqueue(
        &self,
        peer: &str,
        share: &str,
        relative_path: &str,
        mode: &str,
    ) -> Result<TransferTask, KeyMeshError> {
        let root = self
            .share_roots
            .get(share)
            .ok_or_else(|| KeyMeshError::Other(anyhow::anyhow!("unknown share {share}")))?;
        let queue = self
            .queues
            .get(peer)
            .ok_or_else(|| KeyMeshError::Other(anyhow::anyhow!("unknown peer {peer}")))?;

        let absolute = normalize_path(root, Path::new(relative_path));
        let rel = ensure_within(root, &absolute)?;
        let metadata = tokio::fs::metadata(&absolute).await?;

        let record_path = session::record_path(&self.cfg.sessions_dir, peer, share, &absolute);
        let bytes_done = session::load(&record_path)?.map(|r| r.bytes_done).unwrap_or(0);

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let now = now_ts();
        let task = TransferTask {
            task_id,
            peer: peer.to_string(),
            share: share.to_string(),
            relative_path: to_posix_string(&rel),
            absolute_path: absolute.display().to_string(),
            mode: mode.to_string(),
            total_bytes: metadata.len(),
            status: TaskStatus::Queued,
            retries: 0,
            error: None,
            bytes_done,
            created_at: now,
            updated_at: now,
        };

        self.tasks.lock().await.insert(task_id, task.clone());
        queue.push(task_id).await;
        self.persist_snapshot().await.map_err(KeyMeshError::Io)?;
        Ok(task)
    }

    /// Mark a task cancelled and drop a `cancel_<id>.flag` for a worker
    /// that may already have dequeued it.
    pub async fn cancel(&self, task_id: u64) -> Result<(), KeyMeshError> {
        {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or_else(|| KeyMeshError::Other(anyhow::anyhow!("unknown task {task_id}")))?;
            if !task.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.updated_at = now_ts();
            }
        }
        std::fs::create_dir_all(&self.cfg.sessions_dir)?;
        std::fs::write(self.cancel_flag_path(task_id), b"")?;
        self.persist_snapshot().await?;
        Ok(())
    }

    pub async fn list_tasks(&self) -> Vec<TransferTask> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn get_task(&self, task_id: u64) -> Option<TransferTask> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    /// Start the per-peer worker fleet and block until `stop()` is called.
    pub async fn run_forever(self: Arc<Self>) {
        let mut handles = Vec::new();
        for peer_id in self.queues.keys().cloned().collect::<Vec<_>>() {
            for _ in 0..self.cfg.max_concurrent_per_peer {
                let engine = self.clone();
                let peer_id = peer_id.clone();
                let stop = self.stop_rx.clone();
                handles.push(tokio::spawn(async move {
                    engine.worker_loop(peer_id, stop).await;
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn worker_loop(self: Arc<Self>, peer_id: String, mut stop: watch::Receiver<bool>) {
        let queue = match self.queues.get(&peer_id) {
            Some(q) => q.clone(),
            None => return,
        };
        loop {
            if *stop.borrow() {
                return;
            }
            let task_id = tokio::select! {
                popped = queue.pop_wait(Duration::from_secs(1)) => popped,
                _ = stop.changed() => {
                    if *stop.borrow() { return; }
                    continue;
                }
            };
            let Some(task_id) = task_id else { continue };

            let status = self.tasks.lock().await.get(&task_id).map(|t| t.status);
            if status == Some(TaskStatus::Cancelled) {
                continue;
            }
            let flag = self.cancel_flag_path(task_id);
            if flag.exists() {
                let _ = std::fs::remove_file(&flag);
                self.set_status(task_id, TaskStatus::Cancelled, None).await;
                continue;
            }

            self.run_task(task_id).await;
        }
    }

    async fn set_status(&self, task_id: u64, status: TaskStatus, error: Option<String>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(&task_id) {
            task.status = status;
            task.error = error;
            task.updated_at = now_ts();
        }
        drop(tasks);
        let _ = self.persist_snapshot().await;
    }

    async fn run_task(&self, task_id: u64) {
        let Some(task) = self.tasks.lock().await.get(&task_id).cloned() else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }

        let record_path = session::record_path(
            &self.cfg.sessions_dir,
            &task.peer,
            &task.share,
            Path::new(&task.absolute_path),
        );
        if self.cancel_flag_path(task_id).exists() {
            self.set_status(task_id, TaskStatus::Cancelled, None).await;
            return;
        }

        self.set_status(task_id, TaskStatus::Running, None).await;

        match self.attempt_transfer(&task, &record_path).await {
            Ok(()) => {
                let final_path = Path::new(&task.absolute_path);
                if let Err(e) = session::finalize(&record_path, final_path) {
                    tracing::warn!(task_id, error = %e, "finalize failed after a successful transfer");
                }
                self.set_status(task_id, TaskStatus::Success, None).await;
                self.audit
                    .record(&task.peer, &task.share, &task.relative_path, "push", "success", task.total_bytes, 0.0)
                    .await;
            }
            Err(e) => {
                let mut tasks = self.tasks.lock().await;
                let retries = tasks.get(&task_id).map(|t| t.retries).unwrap_or(0) + 1;
                drop(tasks);
                if retries <= self.cfg.max_retries {
                    let idx = (retries as usize)
                        .saturating_sub(1)
                        .min(self.cfg.retry_backoff.len().saturating_sub(1));
                    let delay = self.cfg.retry_backoff.get(idx).copied().unwrap_or(1.0);
                    {
                        let mut tasks = self.tasks.lock().await;
                        if let Some(t) = tasks.get_mut(&task_id) {
                            t.retries = retries;
                            t.error = Some(e.to_string());
                        }
                    }
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    self.set_status(task_id, TaskStatus::Queued, Some(e.to_string())).await;
                    if let Some(queue) = self.queues.get(&task.peer) {
                        queue.push(task_id).await;
                    }
                } else {
                    self.set_status(task_id, TaskStatus::Failed, Some(e.to_string())).await;
                    self.audit
                        .record(&task.peer, &task.share, &task.relative_path, "push", "failed", task.bytes_done, 0.0)
                        .await;
                }
            }
        }
    }

    async fn attempt_transfer(
        &self,
        task: &TransferTask,
        record_path: &Path,
    ) -> Result<(), KeyMeshError> {
        let progress = session::load(record_path)?;
        let resume_bytes = progress
            .as_ref()
            .map(|p| p.bytes_done.min(task.total_bytes))
            .unwrap_or(0);

        if self.cancel_flag_path(task.task_id).exists() {
            return Err(KeyMeshError::Cancelled);
        }

        let target = self
            .peers
            .get(&task.peer)
            .ok_or_else(|| KeyMeshError::Other(anyhow::anyhow!("unknown peer {}", task.peer)))?;

        let mut stream = connect_tls(
            &target.address,
            self.tls_client_config.clone(),
            self.cfg.connect_timeout_ms,
        )
        .await?;

        crate::net::client::authorize_peer_fingerprint(
            &stream,
            target.expected_fingerprint.as_deref(),
            &self.cfg.whitelist,
        )?;

        let ack = hello_and_ack(
            &mut stream,
            &self.cfg.node_id,
            std::slice::from_ref(&task.share),
            &task.peer,
            self.cfg.connect_timeout_ms,
        )
        .await?;
        if !ack.capabilities.shares.iter().any(|s| s == &task.share) {
            return Err(KeyMeshError::Other(anyhow::anyhow!(
                "peer {} does not grant access to share {}",
                task.peer,
                task.share
            )));
        }

        if self.cancel_flag_path(task.task_id).exists() {
            return Err(KeyMeshError::Cancelled);
        }

        let send_cfg = SendConfig {
            chunk_size: self.cfg.chunk_size,
            max_retries: self.cfg.max_retries,
            rate_limit_bytes_per_sec: self.cfg.rate_limit_bytes_per_sec,
        };

        let peer = task.peer.clone();
        let share = task.share.clone();
        let file = task.relative_path.clone();
        let task_id = task.task_id;
        let record_path = record_path.to_path_buf();

        send_file(
            &mut stream,
            &task.relative_path,
            &task.share,
            Path::new(&task.absolute_path),
            resume_bytes,
            &send_cfg,
            &self.cfg.retry_backoff,
            move |chunk_id, bytes_done| {
                let record = session::SessionRecord {
                    peer: peer.clone(),
                    share: share.clone(),
                    file: file.clone(),
                    mode: "push".to_string(),
                    chunk_id,
                    bytes_done,
                    updated: now_ts(),
                };
                if let Err(e) = session::save(&record_path, &record) {
                    tracing::warn!(task_id, error = %e, "failed to persist session progress");
                }
            },
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_queue_pop_wait_returns_pushed_item_immediately() {
        let queue = PeerQueue::new();
        queue.push(7).await;
        let popped = queue.pop_wait(Duration::from_millis(50)).await;
        assert_eq!(popped, Some(7));
    }

    #[tokio::test]
    async fn peer_queue_pop_wait_times_out_when_empty() {
        let queue = PeerQueue::new();
        let popped = queue.pop_wait(Duration::from_millis(20)).await;
        assert_eq!(popped, None);
    }
}
