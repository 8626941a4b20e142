//! Per-peer client connector: dial, mTLS, HELLO/ACK, then a concurrent
//! heartbeat sender/receiver pair that share-cancels on the first
//! failure. Reconnects with exponential backoff on any failure that
//! happens before the handshake latch is reached.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{AuthError, KeyMeshError, ProtocolError, TlsError};
use crate::net::framing::{read_json, write_json};
use crate::net::handshake::{self, Capabilities, HandshakeMessage};
use crate::net::peer_state::PeerRuntimeState;
use crate::net::tls;

pub struct HandshakeOutcome {
    pub peer_id: String,
    pub capabilities: Capabilities,
}

/// Dial `address`, completing the TLS handshake within `connect_timeout_ms`.
pub async fn connect_tls(
    address: &str,
    tls_config: Arc<ClientConfig>,
    connect_timeout_ms: u64,
) -> Result<TlsStream<TcpStream>, TlsError> {
    let connector = TlsConnector::from(tls_config);
    let server_name = tls::placeholder_server_name();
    let fut = async {
        let tcp = TcpStream::connect(address).await?;
        connector.connect(server_name, tcp).await
    };
    match timeout(Duration::from_millis(connect_timeout_ms), fut).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TlsError::Io(e)),
        Err(_) => Err(TlsError::HandshakeTimeout(connect_timeout_ms)),
    }
}

/// Extract the server's fingerprint and authorize it: exact match against
/// `expected_fingerprint` when configured, else whitelist membership.
pub fn authorize_peer_fingerprint(
    stream: &TlsStream<TcpStream>,
    expected_fingerprint: Option<&str>,
    whitelist: &[String],
) -> Result<String, KeyMeshError> {
    let (_, conn) = stream.get_ref();
    let fingerprint =
        tls::peer_fingerprint(conn.peer_certificates()).ok_or(TlsError::MissingPeerCertificate)?;
    let authorized = match expected_fingerprint {
        Some(expected) => expected.trim().eq_ignore_ascii_case(fingerprint.trim()),
        None => tls::fingerprint_in_whitelist(&fingerprint, whitelist),
    };
    if authorized {
        Ok(fingerprint)
    } else {
        Err(AuthError::FingerprintMismatch.into())
    }
}

/// HELLO/ACK exchange from the client side, per §4.6.
pub async fn hello_and_ack<S>(
    stream: &mut S,
    node_id: &str,
    shares: &[String],
    expected_peer_id: &str,
    timeout_ms: u64,
) -> Result<HandshakeOutcome, KeyMeshError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let hello = handshake::build_hello(node_id, shares);
    let fut = async {
        write_json(stream, &hello).await?;
        let msg: HandshakeMessage = read_json(stream).await?;
        Ok::<_, ProtocolError>(msg)
    };
    let msg = timeout(Duration::from_millis(timeout_ms), fut)
        .await
        .map_err(|_| ProtocolError::Timeout("waiting for ACK".to_string()))??;
    let (ok, reason, peer_id, capabilities) = handshake::expect_ack(msg)?;
    if !ok {
        return Err(ProtocolError::PeerError(
            reason.unwrap_or_else(|| "handshake rejected".to_string()),
        )
        .into());
    }
    if peer_id != expected_peer_id {
        return Err(ProtocolError::PeerError(format!(
            "ack.peer_id {peer_id} does not match expected peer {expected_peer_id}"
        ))
        .into());
    }
    Ok(HandshakeOutcome { peer_id, capabilities })
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub node_id: String,
    pub peer_id: String,
    pub address: String,
    pub expected_fingerprint: Option<String>,
    pub whitelist: Vec<String>,
    pub shares: Vec<String>,
    pub heartbeat_sec: u64,
    pub connect_timeout_ms: u64,
    pub backoff: Vec<f64>,
}

enum SessionEnd {
    Stopped,
    Failed {
        reached_ready: bool,
        error: KeyMeshError,
    },
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn run_one_session(
    cfg: &ConnectorConfig,
    tls_config: Arc<ClientConfig>,
    state: &Arc<PeerRuntimeState>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    if *stop.borrow() {
        return SessionEnd::Stopped;
    }

    let mut stream = match connect_tls(&cfg.address, tls_config, cfg.connect_timeout_ms).await {
        Ok(s) => s,
        Err(e) => {
            return SessionEnd::Failed {
                reached_ready: false,
                error: e.into(),
            }
        }
    };

    let fingerprint = match authorize_peer_fingerprint(
        &stream,
        cfg.expected_fingerprint.as_deref(),
        &cfg.whitelist,
    ) {
        Ok(fp) => fp,
        Err(e) => {
            return SessionEnd::Failed {
                reached_ready: false,
                error: e,
            }
        }
    };

    let outcome = match hello_and_ack(
        &mut stream,
        &cfg.node_id,
        &cfg.shares,
        &cfg.peer_id,
        cfg.connect_timeout_ms,
    )
    .await
    {
        Ok(o) => o,
        Err(e) => {
            return SessionEnd::Failed {
                reached_ready: false,
                error: e,
            }
        }
    };

    state
        .mark_handshake(
            fingerprint,
            serde_json::to_value(&outcome.capabilities).unwrap_or_default(),
            &cfg.shares,
        )
        .await;

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let heartbeat_interval = Duration::from_secs(cfg.heartbeat_sec.max(1));
    let read_timeout = Duration::from_secs(cfg.heartbeat_sec.max(1) * 3);
    let heartbeat_state = state.clone();

    let sender_task: tokio::task::JoinHandle<Result<(), ProtocolError>> =
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_interval).await;
                let hb = handshake::build_heartbeat(now_ts());
                write_json(&mut write_half, &hb).await?;
                heartbeat_state.mark_heartbeat().await;
            }
        });

    let receiver_task: tokio::task::JoinHandle<Result<(), ProtocolError>> =
        tokio::spawn(async move {
            loop {
                match timeout(read_timeout, read_json::<_, HandshakeMessage>(&mut read_half)).await
                {
                    Ok(Ok(_frame)) => continue,
                    Ok(Err(e)) => return Err(e),
                    // Silence within the window is not an error, just loop again.
                    Err(_) => continue,
                }
            }
        });

    let result = tokio::select! {
        sender_result = sender_task => {
            receiver_task.abort();
            sender_result
        }
        receiver_result = receiver_task => {
            sender_task.abort();
            receiver_result
        }
        _ = stop.changed() => {
            sender_task.abort();
            receiver_task.abort();
            return SessionEnd::Stopped;
        }
    };

    state.mark_disconnected().await;
    match result {
        Ok(Ok(())) => SessionEnd::Stopped,
        Ok(Err(e)) => SessionEnd::Failed {
            reached_ready: true,
            error: e.into(),
        },
        Err(_join_error) => SessionEnd::Failed {
            reached_ready: true,
            error: ProtocolError::Io(std::io::Error::other("session task aborted")).into(),
        },
    }
}

/// Run the maintenance loop for one peer until `stop` is signalled.
/// Consecutive connection failures (those that never reach a completed
/// handshake) escalate through `cfg.backoff`, saturating at its last
/// element; reaching the handshake latch resets the count.
pub async fn run_peer_connector(
    cfg: ConnectorConfig,
    tls_config: Arc<ClientConfig>,
    state: Arc<PeerRuntimeState>,
    mut stop: watch::Receiver<bool>,
) {
    let mut consecutive_failures: usize = 0;
    loop {
        if *stop.borrow() {
            return;
        }
        match run_one_session(&cfg, tls_config.clone(), &state, &mut stop).await {
            SessionEnd::Stopped => return,
            SessionEnd::Failed {
                reached_ready,
                error,
            } => {
                state.mark_error(error.to_string()).await;
                tracing::warn!(peer = %cfg.peer_id, error = %error, "peer session ended");
                if reached_ready {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                }
            }
        }

        if *stop.borrow() {
            return;
        }
        let idx = consecutive_failures
            .saturating_sub(1)
            .min(cfg.backoff.len().saturating_sub(1));
        let delay = cfg.backoff.get(idx).copied().unwrap_or(1.0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
            _ = stop.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_index_saturates_at_last_element() {
        let backoff = vec![1.0, 3.0, 10.0, 30.0];
        let idx_for = |failures: usize| failures.saturating_sub(1).min(backoff.len() - 1);
        assert_eq!(idx_for(1), 0);
        assert_eq!(idx_for(2), 1);
        assert_eq!(idx_for(4), 3);
        assert_eq!(idx_for(10), 3);
    }
}
