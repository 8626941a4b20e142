//! Server accept loop and per-connection state machine (§4.6): Accepted →
//! AwaitingHello → Authorize → Ready → Serving → Closing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::{AuthError, ProtocolError, TlsError};
use crate::net::framing::{read_json, write_json};
use crate::net::handshake::{self, HandshakeMessage};
use crate::net::peer_state::PeerRuntimeState;
use crate::net::tls;

/// Everything the accept loop needs to authorize and service a session,
/// independent of how the application assembled its peer registry.
pub struct ServerContext {
    pub tls_config: Arc<ServerConfig>,
    pub bind_host: String,
    pub port: u16,
    pub node_id: String,
    pub peers_by_id: HashMap<String, Arc<PeerRuntimeState>>,
    pub peers_by_fingerprint: HashMap<String, Arc<PeerRuntimeState>>,
    pub whitelist: Vec<String>,
    pub heartbeat_sec: u64,
    pub connect_timeout_ms: u64,
}

/// Accept connections until `stop` fires, spawning one task per
/// connection and awaiting every in-flight task before returning.
pub async fn run_accept_loop(
    ctx: Arc<ServerContext>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", ctx.bind_host, ctx.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "peer session server listening");
    let acceptor = TlsAcceptor::from(ctx.tls_config.clone());

    let mut tasks = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (tcp, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                let mut conn_stop = stop.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        result = handle_connection(ctx, acceptor, tcp) => {
                            if let Err(e) = result {
                                tracing::warn!(peer_addr = %peer_addr, error = %e, "session ended with error");
                            }
                        }
                        _ = conn_stop.changed() => {}
                    }
                });
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
) -> Result<(), ProtocolError> {
    let tls_deadline = Duration::from_millis(ctx.connect_timeout_ms);
    let mut stream = match timeout(tls_deadline, acceptor.accept(tcp)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(TlsError::Io(e).into()),
        Err(_) => return Err(TlsError::HandshakeTimeout(ctx.connect_timeout_ms).into()),
    };

    // Accepted: extract fingerprint; absent certificate closes the session.
    let fingerprint = {
        let (_, conn) = stream.get_ref();
        tls::peer_fingerprint(conn.peer_certificates()).ok_or(TlsError::MissingPeerCertificate)?
    };

    // AwaitingHello
    let hello = match timeout(tls_deadline, read_json::<_, HandshakeMessage>(&mut stream)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            let _ = send_ack(&mut stream, false, Some(e.to_string()), &ctx.node_id).await;
            return Err(e);
        }
        Err(_) => {
            let err = ProtocolError::Timeout("waiting for HELLO".to_string());
            let _ = send_ack(&mut stream, false, Some(err.to_string()), &ctx.node_id).await;
            return Err(err);
        }
    };
    let (node_id, version, remote_caps) = match handshake::expect_hello(hello) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = send_ack(&mut stream, false, Some(e.to_string()), &ctx.node_id).await;
            return Err(e);
        }
    };

    // Authorize
    let matched = ctx
        .peers_by_fingerprint
        .get(&fingerprint)
        .or_else(|| ctx.peers_by_id.get(&node_id))
        .cloned();
    let is_fingerprint_matched = ctx.peers_by_fingerprint.contains_key(&fingerprint);

    let state = match authorize(
        matched,
        is_fingerprint_matched,
        &fingerprint,
        &version,
        &ctx.whitelist,
    ) {
        Ok(state) => state,
        Err((reason, matched)) => {
            if let Some(matched) = matched {
                matched.mark_error(reason.clone()).await;
            }
            let _ = send_ack(&mut stream, false, Some(reason.clone()), &ctx.node_id).await;
            return Err(ProtocolError::PeerError(reason));
        }
    };

    // Ready
    let allowed = state.allowed_shares.clone();
    let ack = handshake::build_ack(
        true,
        None,
        &ctx.node_id,
        handshake::build_capabilities(&allowed),
    );
    write_json(&mut stream, &ack).await?;
    state
        .mark_handshake(
            fingerprint,
            serde_json::to_value(&remote_caps).unwrap_or_default(),
            &allowed,
        )
        .await;

    // Serving
    let read_timeout = Duration::from_secs(ctx.heartbeat_sec.max(1) * 3);
    let serving_result = serve_heartbeats(&mut stream, read_timeout, &state).await;

    // Closing
    if let Err(ref e) = serving_result {
        state.mark_error(e.to_string()).await;
    }
    state.mark_disconnected().await;
    serving_result
}

/// Resolve and authorize the connecting peer: looked up by fingerprint
/// first, then by the HELLO's `node_id` (requiring either a matching
/// `expected_fingerprint` on that peer or global whitelist membership),
/// then checked for major-version compatibility. Returns the matched
/// state alongside a failure reason so the caller can stamp `last_error`
/// even when authorization ultimately fails. An unmatched peer gets one
/// of two reasons: "unknown peer" when it is neither configured nor
/// whitelisted, "peer not configured" when the whitelist let it past TLS
/// but no matching `PeerConfig` exists.
fn authorize(
    matched: Option<Arc<PeerRuntimeState>>,
    is_fingerprint_matched: bool,
    fingerprint: &str,
    version: &str,
    whitelist: &[String],
) -> Result<Arc<PeerRuntimeState>, (String, Option<Arc<PeerRuntimeState>>)> {
    let state = match matched {
        Some(s) => s,
        None => {
            return if tls::fingerprint_in_whitelist(fingerprint, whitelist) {
                Err(("peer not configured".to_string(), None))
            } else {
                Err(("unknown peer".to_string(), None))
            };
        }
    };

    let fingerprint_ok = is_fingerprint_matched || tls::fingerprint_in_whitelist(fingerprint, whitelist);
    if !fingerprint_ok {
        return Err((AuthError::FingerprintMismatch.to_string(), Some(state)));
    }

    if !handshake::versions_compatible(version, crate::constants::PROTO_VERSION) {
        return Err((
            AuthError::IncompatibleVersion(version.to_string()).to_string(),
            Some(state),
        ));
    }

    Ok(state)
}

async fn send_ack(
    stream: &mut TlsStream<TcpStream>,
    ok: bool,
    reason: Option<String>,
    node_id: &str,
) -> Result<(), ProtocolError> {
    let ack = handshake::build_ack(ok, reason, node_id, handshake::build_capabilities(&[]));
    write_json(stream, &ack).await
}

async fn serve_heartbeats(
    stream: &mut TlsStream<TcpStream>,
    read_timeout: Duration,
    state: &Arc<PeerRuntimeState>,
) -> Result<(), ProtocolError> {
    loop {
        let msg = timeout(read_timeout, read_json::<_, HandshakeMessage>(stream))
            .await
            .map_err(|_| ProtocolError::Timeout("heartbeat read".to_string()))??;
        match msg {
            HandshakeMessage::Heartbeat { ts } => {
                tracing::trace!(ts, "heartbeat received");
                state.mark_heartbeat().await;
            }
            other => {
                tracing::debug!(
                    kind = other.type_name(),
                    "ignoring non-heartbeat frame while serving"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_rejects_unconfigured_peer_not_on_whitelist_as_unknown() {
        let result = authorize(None, false, "sha256:aa", "0.2", &[]);
        let (reason, state) = result.unwrap_err();
        assert_eq!(reason, "unknown peer");
        assert!(state.is_none());
    }

    #[test]
    fn authorize_rejects_whitelisted_but_unconfigured_peer_as_not_configured() {
        let result = authorize(None, false, "sha256:aa", "0.2", &["sha256:aa".to_string()]);
        let (reason, state) = result.unwrap_err();
        assert_eq!(reason, "peer not configured");
        assert!(state.is_none());
    }

    #[test]
    fn authorize_accepts_matched_fingerprint() {
        let state = Arc::new(PeerRuntimeState::new("node-b", "h:1", vec!["docs".to_string()]));
        let result = authorize(Some(state), true, "sha256:aa", "0.2", &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn authorize_falls_back_to_whitelist() {
        let state = Arc::new(PeerRuntimeState::new("node-b", "h:1", vec![]));
        let whitelist = vec!["sha256:aa".to_string()];
        let result = authorize(Some(state), false, "sha256:AA", "0.2", &whitelist);
        assert!(result.is_ok());
    }

    #[test]
    fn authorize_rejects_incompatible_major_version() {
        let state = Arc::new(PeerRuntimeState::new("node-b", "h:1", vec![]));
        let result = authorize(Some(state), true, "sha256:aa", "9.0", &[]);
        assert!(result.is_err());
    }
}
