//! Transport abstraction.
//!
//! The core never touches sockets. A stream-multiplexing datagram transport
//! (QUIC in production, an in-memory pair in tests) implements these traits
//! and the core drives it: one [`Listener`] per host, one [`Client`] per
//! established session. Clients are shared between the send and receive
//! loops, so every method takes `&self`; `close` must unblock a pending
//! `receive` on either end.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::TransportError;

/// Lowest port accepted for a relayer address.
const MIN_PORT: u16 = 80;

/// One received frame: protocol version plus the type-prefixed payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub payload: Vec<u8>,
}

/// Factory for listeners and outbound clients.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Client>>;
}

/// Accepts inbound sessions.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&mut self) -> Result<Arc<dyn Client>>;
    async fn close(&mut self);
}

/// One established bidirectional stream session.
#[async_trait]
pub trait Client: Send + Sync {
    async fn send(&self, payload: &[u8]) -> Result<()>;
    async fn receive(&self) -> Result<Frame>;
    /// The observed remote address, never a self-advertised one.
    fn remote_addr(&self) -> String;
    async fn close(&self, reason: &str);
}

/// Check a "host:port" relayer address: parseable IP, port ≥ 80.
pub fn validate_address(addr: &str) -> Result<(), TransportError> {
    let sock: SocketAddr = addr
        .parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
    if sock.ip().is_unspecified() || sock.port() < MIN_PORT {
        return Err(TransportError::InvalidAddress(addr.to_string()));
    }
    Ok(())
}
