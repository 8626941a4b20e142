//! Process-wide defaults shared by the CLI, config loader, and net layer.

pub const DEFAULT_PORT: u16 = 51888;
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_CONFIG_SAMPLE: &str = "config.sample.yaml";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_LOG_FILE: &str = "logs/keymesh.log";
pub const DEFAULT_SHARE_IGNORE: &str = ".keymeshignore";
pub const DEFAULT_CHUNK_MB: u64 = 16;

pub const PROTO_VERSION: &str = "0.2";
pub const MSG_HELLO: &str = "HELLO";
pub const MSG_ACK: &str = "ACK";
pub const MSG_HEARTBEAT: &str = "HEARTBEAT";
pub const DEFAULT_FEATURES: &[&str] = &["mtls", "heartbeat"];

pub const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;
pub const HASH_SALT: &[u8] = b"KeyMesh::hash::v1";
pub const HASH_READ_CHUNK: usize = 4 * 1024 * 1024;
