//! Trait seams between the protocol engine and the outside world.
//!
//! | Seam | Trait | Default implementation |
//! |------|-------|------------------------|
//! | Datagram transport | [`Transport`] | `tokio::net::UdpSocket` |
//! | Peer/user directory | [`crate::registry::Registry`] | `MemoryRegistry` |
//! | Message handlers | [`crate::dispatch::Handler`] | closures via `FnHandler` |
//!
//! The engine depends only on these traits, so tests drive it with an
//! in-memory transport and several engines can share one process.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Best-effort datagram delivery. No ordering, no retransmission.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `to`.
    async fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()>;

    /// Address this transport receives on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_datagram(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let sent = self.send_to(bytes, to).await?;
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {sent} of {} bytes", bytes.len()),
            ));
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
