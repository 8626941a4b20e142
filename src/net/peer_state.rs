//! Per-peer runtime state: connection status, handshake bookkeeping, and
//! the one-shot "handshake completed" latch. Reads/writes to the mutable
//! fields always go through the mutex; the latch is a `watch` channel so
//! every waiter — whether it subscribed before or after the handshake
//! completed — observes it exactly once, with no spurious wakeup.

use serde::Serialize;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Default)]
struct Inner {
    connected: bool,
    last_error: Option<String>,
    last_hello_ts: Option<i64>,
    last_ack_ts: Option<i64>,
    last_heartbeat_ts: Option<i64>,
    fingerprint: Option<String>,
    remote_capabilities: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStateSnapshot {
    pub id: String,
    pub address: String,
    pub allowed_shares: Vec<String>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_hello_ts: Option<i64>,
    pub last_ack_ts: Option<i64>,
    pub last_heartbeat_ts: Option<i64>,
    pub fingerprint: Option<String>,
    pub remote_capabilities: Option<serde_json::Value>,
}

pub struct PeerRuntimeState {
    pub id: String,
    pub address: String,
    pub allowed_shares: Vec<String>,
    inner: Mutex<Inner>,
    handshake_tx: watch::Sender<bool>,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl PeerRuntimeState {
    pub fn new(id: impl Into<String>, address: impl Into<String>, allowed_shares: Vec<String>) -> Self {
        let (handshake_tx, _rx) = watch::channel(false);
        Self {
            id: id.into(),
            address: address.into(),
            allowed_shares,
            inner: Mutex::new(Inner::default()),
            handshake_tx,
        }
    }

    /// Stamps hello/ack/heartbeat timestamps, records the fingerprint and
    /// remote capabilities, marks the peer connected, and releases the
    /// handshake latch. Safe to call more than once (reconnects).
    pub async fn mark_handshake(
        &self,
        fingerprint: String,
        remote_capabilities: serde_json::Value,
        allowed_shares: &[String],
    ) {
        let ts = now_ts();
        let mut inner = self.inner.lock().await;
        inner.connected = true;
        inner.last_hello_ts = Some(ts);
        inner.last_ack_ts = Some(ts);
        inner.last_heartbeat_ts = Some(ts);
        inner.fingerprint = Some(fingerprint);
        inner.remote_capabilities = Some(remote_capabilities);
        inner.last_error = None;
        drop(inner);
        let _ = allowed_shares; // allowed_shares is fixed at construction time; kept for call-site symmetry with the source.
        let _ = self.handshake_tx.send(true);
    }

    pub async fn mark_heartbeat(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_heartbeat_ts = Some(now_ts());
    }

    pub async fn mark_error(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(error.into());
        inner.connected = false;
    }

    pub async fn mark_disconnected(&self) {
        let mut inner = self.inner.lock().await;
        inner.connected = false;
    }

    /// Resolves once `mark_handshake` has been called at least once for
    /// this peer, whether that happened before or after this call.
    pub async fn wait_handshake(&self) {
        let mut rx = self.handshake_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // `changed()` cannot miss the transition: the sender holds the
        // latest value, and `subscribe()` above captured it before we
        // checked, so any send that lands concurrently is still observed.
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn snapshot(&self) -> PeerStateSnapshot {
        let inner = self.inner.lock().await;
        PeerStateSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            allowed_shares: self.allowed_shares.clone(),
            connected: inner.connected,
            last_error: inner.last_error.clone(),
            last_hello_ts: inner.last_hello_ts,
            last_ack_ts: inner.last_ack_ts,
            last_heartbeat_ts: inner.last_heartbeat_ts,
            fingerprint: inner.fingerprint.clone(),
            remote_capabilities: inner.remote_capabilities.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn waiter_before_handshake_completes_on_mark() {
        let state = Arc::new(PeerRuntimeState::new("b", "host:1", vec!["docs".to_string()]));
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state.wait_handshake().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state
            .mark_handshake("sha256:aa".to_string(), serde_json::json!({}), &[])
            .await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn waiter_after_handshake_does_not_block() {
        let state = PeerRuntimeState::new("b", "host:1", vec![]);
        state
            .mark_handshake("sha256:aa".to_string(), serde_json::json!({}), &[])
            .await;
        tokio::time::timeout(Duration::from_millis(50), state.wait_handshake())
            .await
            .expect("late waiter must not block");
    }
}
