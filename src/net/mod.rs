pub mod client;
pub mod framing;
pub mod handshake;
pub mod peer_state;
pub mod server;
pub mod tls;
