//! Streaming transfer protocol: `FILE_REQ` / `FILE_META` / `CHUNK` (+ raw
//! payload) / `CHUNK_ACK` / `FILE_END`. Control frames are length-prefixed
//! JSON; CHUNK payload bytes are raw and immediately follow the CHUNK
//! header frame, not framed themselves.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChecksumError, ProtocolError};
use crate::net::framing::{read_json, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferFrame {
    #[serde(rename = "FILE_REQ")]
    FileReq {
        file: String,
        share: String,
        size: u64,
        mode: String,
        resume_offset: u64,
        hash: String,
    },
    #[serde(rename = "FILE_META")]
    FileMeta {
        status: String,
        resume_offset: u64,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "CHUNK")]
    Chunk {
        file: String,
        share: String,
        chunk: u64,
        offset: u64,
        size: u32,
        hash: String,
    },
    #[serde(rename = "CHUNK_ACK")]
    ChunkAck {
        chunk: u64,
        status: String,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "FILE_END")]
    FileEnd {
        file: String,
        share: String,
        hash: String,
        bytes: u64,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl TransferFrame {
    fn type_name(&self) -> &'static str {
        match self {
            Self::FileReq { .. } => "FILE_REQ",
            Self::FileMeta { .. } => "FILE_META",
            Self::Chunk { .. } => "CHUNK",
            Self::ChunkAck { .. } => "CHUNK_ACK",
            Self::FileEnd { .. } => "FILE_END",
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}

pub fn sha256_hex_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut HashSink(&mut hasher))?;
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256:{hex}"))
}

struct HashSink<'a>(&'a mut Sha256);
impl std::io::Write for HashSink<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SendConfig {
    pub chunk_size: u64,
    pub max_retries: u32,
    pub rate_limit_bytes_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct SendResult {
    pub bytes: u64,
    pub chunks: u64,
    pub elapsed: Duration,
}

/// Sender half of §4.7: compute the whole-file hash up front, negotiate a
/// resume offset, then stream chunks with per-chunk retry.
#[allow(clippy::too_many_arguments)]
pub async fn send_file<S, F>(
    stream: &mut S,
    file: &str,
    share: &str,
    local_path: &Path,
    local_resume: u64,
    cfg: &SendConfig,
    retry_backoff: &[f64],
    mut on_progress: F,
) -> Result<SendResult, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(u64, u64),
{
    let started = Instant::now();
    let metadata = tokio::fs::metadata(local_path).await?;
    let size = metadata.len();
    let whole_hash = sha256_hex_of_file(local_path)?;

    write_json(
        stream,
        &TransferFrame::FileReq {
            file: file.to_string(),
            share: share.to_string(),
            size,
            mode: "push".to_string(),
            resume_offset: local_resume,
            hash: whole_hash.clone(),
        },
    )
    .await?;

    let meta = match read_json::<_, TransferFrame>(stream).await? {
        TransferFrame::FileMeta {
            status,
            resume_offset,
            error,
        } => {
            if status != "ok" {
                return Err(ProtocolError::PeerError(
                    error.unwrap_or_else(|| "FILE_META error".to_string()),
                ));
            }
            resume_offset
        }
        other => {
            return Err(ProtocolError::WrongMessageType {
                expected: "FILE_META".to_string(),
                found: other.type_name().to_string(),
            })
        }
    };

    let start_offset = local_resume.max(meta);
    let mut handle = tokio::fs::File::open(local_path).await?;
    handle.seek(std::io::SeekFrom::Start(start_offset)).await?;

    let mut offset = start_offset;
    let mut chunk_id = start_offset / cfg.chunk_size.max(1);
    let mut buf = vec![0u8; cfg.chunk_size as usize];

    while offset < size {
        let want = ((size - offset).min(cfg.chunk_size)) as usize;
        let n = handle.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        let chunk_hash = sha256_hex(data);

        let mut attempt = 0u32;
        loop {
            write_json(
                stream,
                &TransferFrame::Chunk {
                    file: file.to_string(),
                    share: share.to_string(),
                    chunk: chunk_id,
                    offset,
                    size: n as u32,
                    hash: chunk_hash.clone(),
                },
            )
            .await?;
            stream.write_all(data).await?;
            stream.flush().await?;

            if let Some(rate) = cfg.rate_limit_bytes_per_sec {
                if rate > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(n as f64 / rate)).await;
                }
            }

            match read_json::<_, TransferFrame>(stream).await? {
                TransferFrame::ChunkAck {
                    chunk: acked,
                    status,
                    ..
                } if acked == chunk_id && status == "ok" => break,
                _ => {
                    attempt += 1;
                    if attempt > cfg.max_retries {
                        return Err(ProtocolError::ChunkAckMismatch(chunk_id));
                    }
                    let delay = retry_backoff
                        .get((attempt as usize).saturating_sub(1).min(retry_backoff.len().saturating_sub(1)))
                        .copied()
                        .unwrap_or(1.0);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
        }

        offset += n as u64;
        chunk_id += 1;
        on_progress(chunk_id, offset);
    }

    write_json(
        stream,
        &TransferFrame::FileEnd {
            file: file.to_string(),
            share: share.to_string(),
            hash: whole_hash,
            bytes: offset,
            status: None,
            error: None,
        },
    )
    .await?;

    match read_json::<_, TransferFrame>(stream).await? {
        TransferFrame::FileEnd {
            status: Some(status),
            error,
            ..
        } if status == "ok" => Ok(SendResult {
            bytes: offset,
            chunks: chunk_id,
            elapsed: started.elapsed(),
        }),
        TransferFrame::FileEnd { error, .. } => Err(ProtocolError::PeerError(
            error.unwrap_or_else(|| "FILE_END rejected".to_string()),
        )),
        other => Err(ProtocolError::WrongMessageType {
            expected: "FILE_END".to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

pub struct RecvResult {
    pub bytes: u64,
}

/// Receiver half of §4.7. `request` is the already-read `FILE_REQ` frame;
/// `part_path` is the `.part` file to append to. `chunk_size` must match
/// the sender's configured chunk size so the resumed chunk numbering
/// (`existing_bytes / chunk_size`) lines up with the sender's own
/// `offset / chunk_size` derivation; it is not carried on the wire.
pub async fn receive_file<S>(
    stream: &mut S,
    request: &TransferFrame,
    part_path: &Path,
    chunk_size: u64,
) -> Result<RecvResult, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (file, share, claimed_hash) = match request {
        TransferFrame::FileReq {
            file, share, hash, mode, ..
        } if mode == "push" => (file.clone(), share.clone(), hash.clone()),
        TransferFrame::FileReq { .. } => {
            return Err(ProtocolError::InvalidFrame(
                "FILE_REQ mode must be push".to_string(),
            ))
        }
        other => {
            return Err(ProtocolError::WrongMessageType {
                expected: "FILE_REQ".to_string(),
                found: other.type_name().to_string(),
            })
        }
    };

    if let Some(parent) = part_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let existing_bytes = tokio::fs::metadata(part_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut running_hash = Sha256::new();
    if existing_bytes > 0 {
        let existing = tokio::fs::read(part_path).await?;
        running_hash.update(&existing);
    }

    write_json(
        stream,
        &TransferFrame::FileMeta {
            status: "ok".to_string(),
            resume_offset: existing_bytes,
            error: None,
        },
    )
    .await?;

    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(part_path)
        .await?;

    let mut next_chunk = existing_bytes / chunk_size.max(1);
    let mut total = existing_bytes;

    loop {
        match read_json::<_, TransferFrame>(stream).await? {
            TransferFrame::Chunk {
                chunk,
                size,
                hash,
                ..
            } => {
                if chunk != next_chunk {
                    return Err(ProtocolError::OutOfOrderChunk {
                        expected: next_chunk,
                        got: chunk,
                    });
                }
                let mut data = vec![0u8; size as usize];
                stream.read_exact(&mut data).await?;
                let actual = sha256_hex(&data);
                if actual != hash {
                    return Err(ProtocolError::Checksum(ChecksumError {
                        expected: hash,
                        got: actual,
                    }));
                }
                out.write_all(&data).await?;
                out.flush().await?;
                running_hash.update(&data);
                total += data.len() as u64;
                next_chunk += 1;

                write_json(
                    stream,
                    &TransferFrame::ChunkAck {
                        chunk,
                        status: "ok".to_string(),
                        error: None,
                    },
                )
                .await?;
            }
            TransferFrame::FileEnd { hash, .. } => {
                let digest = running_hash.clone().finalize();
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                let computed = format!("sha256:{hex}");
                if computed != claimed_hash || computed != hash {
                    write_json(
                        stream,
                        &TransferFrame::FileEnd {
                            file,
                            share,
                            hash: computed.clone(),
                            bytes: total,
                            status: Some("error".to_string()),
                            error: Some("checksum mismatch".to_string()),
                        },
                    )
                    .await?;
                    return Err(ProtocolError::Checksum(ChecksumError {
                        expected: claimed_hash,
                        got: computed,
                    }));
                }
                write_json(
                    stream,
                    &TransferFrame::FileEnd {
                        file,
                        share,
                        hash: computed,
                        bytes: total,
                        status: Some("ok".to_string()),
                        error: None,
                    },
                )
                .await?;
                return Ok(RecvResult { bytes: total });
            }
            other => {
                return Err(ProtocolError::WrongMessageType {
                    expected: "CHUNK or FILE_END".to_string(),
                    found: other.type_name().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn end_to_end_small_file_transfers_and_verifies() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("a.bin");
        let content = b"hello keymesh transfer protocol".to_vec();
        std::fs::write(&src_path, &content).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let part_path = dst_dir.path().join("a.bin.part");

        let (mut client_stream, mut server_stream) = duplex(1 << 20);

        let cfg = SendConfig {
            chunk_size: 8,
            max_retries: 3,
            rate_limit_bytes_per_sec: None,
        };

        let sender = tokio::spawn(async move {
            send_file(
                &mut client_stream,
                "a.bin",
                "docs",
                &src_path,
                0,
                &cfg,
                &[0.01],
                |_, _| {},
            )
            .await
        });

        let receiver = tokio::spawn(async move {
            let request = read_json::<_, TransferFrame>(&mut server_stream)
                .await
                .unwrap();
            let result = receive_file(&mut server_stream, &request, &part_path, 8)
                .await
                .unwrap();
            (result, part_path)
        });

        let send_result = sender.await.unwrap().unwrap();
        let (recv_result, part_path) = receiver.await.unwrap();

        assert_eq!(send_result.bytes, content.len() as u64);
        assert_eq!(recv_result.bytes, content.len() as u64);
        assert_eq!(std::fs::read(&part_path).unwrap(), content);
    }

    #[tokio::test]
    async fn resumes_from_existing_part_bytes_without_duplicating() {
        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("a.bin");
        let content: Vec<u8> = (0..40u8).cycle().take(400).collect();
        std::fs::write(&src_path, &content).unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let part_path = dst_dir.path().join("a.bin.part");
        // Pre-seed the first two 8-byte chunks as if a prior attempt wrote them.
        std::fs::write(&part_path, &content[..16]).unwrap();

        let (mut client_stream, mut server_stream) = duplex(1 << 20);
        let cfg = SendConfig {
            chunk_size: 8,
            max_retries: 3,
            rate_limit_bytes_per_sec: None,
        };

        let sender = tokio::spawn(async move {
            send_file(
                &mut client_stream,
                "a.bin",
                "docs",
                &src_path,
                16,
                &cfg,
                &[0.01],
                |_, _| {},
            )
            .await
        });

        let receiver = tokio::spawn(async move {
            let request = read_json::<_, TransferFrame>(&mut server_stream)
                .await
                .unwrap();
            let result = receive_file(&mut server_stream, &request, &part_path, 8)
                .await
                .unwrap();
            (result, part_path)
        });

        let send_result = sender.await.unwrap().unwrap();
        let (recv_result, part_path) = receiver.await.unwrap();

        assert_eq!(send_result.bytes, content.len() as u64);
        assert_eq!(recv_result.bytes, content.len() as u64);
        assert_eq!(std::fs::read(&part_path).unwrap(), content);
    }
}
