//! Typed error taxonomy. Each family maps to one failure mode described in
//! the design's error handling section; callers match on variants rather
//! than strings so retry/propagation rules stay mechanical.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("required file missing: {0}")]
    MissingFile(String),
}

#[derive(Debug, Error)]
#[error("path {attempted} escapes base {base}")]
pub struct PathEscapeError {
    pub base: String,
    pub attempted: String,
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls handshake timed out after {0}ms")]
    HandshakeTimeout(u64),
    #[error("peer did not present a certificate")]
    MissingPeerCertificate,
    #[error("certificate verification failed: {0}")]
    Verify(String),
    #[error("tls io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("certificate fingerprint mismatch")]
    FingerprintMismatch,
    #[error("peer not configured")]
    UnknownPeer,
    #[error("incompatible protocol version: {0}")]
    IncompatibleVersion(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    InvalidFrame(String),
    #[error("frame of {0} bytes exceeds the maximum of {1} bytes")]
    FrameTooLarge(u32, u32),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("expected message type {expected}, found {found}")]
    WrongMessageType { expected: String, found: String },
    #[error("chunk acknowledgement mismatch for chunk {0}")]
    ChunkAckMismatch(u64),
    #[error("chunk id {got} is out of order, expected {expected}")]
    OutOfOrderChunk { expected: u64, got: u64 },
    #[error("checksum mismatch: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("peer reported error: {0}")]
    PeerError(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("checksum mismatch: expected {expected}, got {got}")]
pub struct ChecksumError {
    pub expected: String,
    pub got: String,
}

#[derive(Debug, Error)]
pub enum KeyMeshError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = KeyMeshError> = std::result::Result<T, E>;
