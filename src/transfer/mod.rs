pub mod engine;
pub mod protocol;
pub mod session;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub task_id: u64,
    pub peer: String,
    pub share: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub mode: String,
    pub total_bytes: u64,
    pub status: TaskStatus,
    pub retries: u32,
    pub error: Option<String>,
    pub bytes_done: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransferTask {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}
