//! Boundary to the duplex channel the relay runs on.
//!
//! The relay only needs a handful of operations from the channel: open it in
//! an accepting (many peers) or initiating (one peer) configuration, find out
//! which peers have something to read, read one message, write one message,
//! and close. Message boundaries are the channel's business; every `read`
//! yields exactly one message and every `write` sends exactly one.

use std::io;

use async_trait::async_trait;

use crate::session::TransportError;

/// Identifies a peer within one channel.
pub type PeerId = u64;

/// The single peer of an initiating channel: the accepting side it connected to.
pub const UPSTREAM: PeerId = 0;

/// Opens channels by endpoint name.
#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: DuplexChannel + 'static;

    /// Opens a channel that accepts any number of peers under `name`.
    async fn bind(&self, name: &str) -> io::Result<Self::Channel>;

    /// Opens a channel to the accepting side published under `name`.
    async fn connect(&self, name: &str) -> io::Result<Self::Channel>;
}

#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Currently connected peers, in the channel's enumeration order.
    async fn peers(&self) -> Vec<PeerId>;

    /// Resolves once at least one peer has a pending message.
    ///
    /// Fails once the channel has been closed, which releases anyone blocked
    /// here during shutdown.
    async fn wait_for_data(&self) -> io::Result<()>;

    async fn can_read(&self, peer: PeerId) -> bool;

    /// `false` once the peer hung up or was never connected.
    async fn is_open(&self, peer: PeerId) -> bool;

    /// Blocks until the peer delivers a message. `None` means the peer hung up
    /// with nothing left to read.
    async fn read(&self, peer: PeerId) -> io::Result<Option<String>>;

    async fn write(&self, peer: PeerId, message: &str) -> io::Result<()>;

    async fn close(&self) -> io::Result<()>;
}

/// The channel implementation for this host.
#[cfg(unix)]
pub fn host_connector() -> Result<crate::local::LocalSocket, TransportError> {
    Ok(crate::local::LocalSocket::new())
}

/// The channel implementation for this host.
#[cfg(not(unix))]
pub fn host_connector() -> Result<Unsupported, TransportError> {
    Err(TransportError::UnsupportedPlatform)
}

/// Stand-in connector for hosts without a channel implementation. It has no
/// values, so a session over it can never be built.
#[cfg(not(unix))]
pub enum Unsupported {}

#[cfg(not(unix))]
#[async_trait]
impl Connector for Unsupported {
    type Channel = Unsupported;

    async fn bind(&self, _name: &str) -> io::Result<Self::Channel> {
        match *self {}
    }

    async fn connect(&self, _name: &str) -> io::Result<Self::Channel> {
        match *self {}
    }
}

#[cfg(not(unix))]
#[async_trait]
impl DuplexChannel for Unsupported {
    async fn peers(&self) -> Vec<PeerId> {
        match *self {}
    }

    async fn wait_for_data(&self) -> io::Result<()> {
        match *self {}
    }

    async fn can_read(&self, _peer: PeerId) -> bool {
        match *self {}
    }

    async fn is_open(&self, _peer: PeerId) -> bool {
        match *self {}
    }

    async fn read(&self, _peer: PeerId) -> io::Result<Option<String>> {
        match *self {}
    }

    async fn write(&self, _peer: PeerId, _message: &str) -> io::Result<()> {
        match *self {}
    }

    async fn close(&self) -> io::Result<()> {
        match *self {}
    }
}
