//! Mode-aware wrapper around a duplex channel.
//!
//! A session starts [`Role::Unbound`] and becomes a server (via
//! [`TransportSession::bind`]) or a client (via [`TransportSession::connect`])
//! exactly once. The role decides how `send` and `recv` treat peers:
//!
//! - a server fans every relayable envelope out to all peers, and a failed
//!   write aborts the fan-out;
//! - a server `recv` reads at most one message per peer and skips peers that
//!   fail, so one bad peer never hides the others;
//! - a client talks to its single upstream peer only.

use std::{io, time::Duration};

use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    channel::{Connector, DuplexChannel, PeerId, UPSTREAM},
    envelope::{Envelope, EnvelopeError},
};

/// Longest a client `recv` waits between checks that upstream is still there.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport must be bound or connected first")]
    InvalidState,
    #[error("transport is already bound, refusing to bind twice")]
    AlreadyBound,
    #[error("no endpoint name provided")]
    MissingName,
    #[error("no duplex channel implementation for this platform")]
    UnsupportedPlatform,
    #[error("upstream peer disconnected")]
    Disconnected,
    #[error("failed to write to peer {peer}: {source}")]
    Write {
        peer: PeerId,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unbound,
    Server,
    Client,
}

impl Role {
    /// The only transitions are `Unbound -> Server` and `Unbound -> Client`.
    pub fn advance(self, next: Role) -> Result<Role, TransportError> {
        match (self, next) {
            (Role::Unbound, Role::Server | Role::Client) => Ok(next),
            (Role::Unbound, Role::Unbound) => Err(TransportError::InvalidState),
            (Role::Server | Role::Client, _) => Err(TransportError::AlreadyBound),
        }
    }
}

pub struct TransportSession<C: Connector> {
    connector: C,
    role: Role,
    name: Option<String>,
    channel: Option<C::Channel>,
}

impl<C: Connector> TransportSession<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            role: Role::Unbound,
            name: None,
            channel: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The endpoint name remembered from the last successful bind or connect.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Opens the channel in its accepting configuration.
    pub async fn bind(&mut self, name: Option<&str>) -> Result<(), TransportError> {
        let name = self.resolve_name(name)?;
        let role = self.ensure_unbound(Role::Server)?;

        info!(name = %name, "binding relay endpoint");
        let channel = self.connector.bind(&name).await?;
        self.attach(role, name, channel);
        Ok(())
    }

    /// Opens the channel in its initiating configuration.
    pub async fn connect(&mut self, name: Option<&str>) -> Result<(), TransportError> {
        let name = self.resolve_name(name)?;
        let role = self.ensure_unbound(Role::Client)?;

        info!(name = %name, "connecting to relay endpoint");
        let channel = self.connector.connect(&name).await?;
        self.attach(role, name, channel);
        Ok(())
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let channel = self.channel()?;
        match self.role {
            Role::Server if envelope.is_norelay() => {
                info!(
                    source = envelope.source(),
                    content = envelope.content(),
                    "NORELAY set, keeping message local"
                );
                Ok(())
            }
            Role::Server => {
                let payload = envelope.to_json()?;
                for peer in channel.peers().await {
                    channel
                        .write(peer, &payload)
                        .await
                        .map_err(|source| TransportError::Write { peer, source })?;
                }
                Ok(())
            }
            Role::Client => {
                let payload = envelope.to_json()?;
                channel
                    .write(UPSTREAM, &payload)
                    .await
                    .map_err(|source| TransportError::Write {
                        peer: UPSTREAM,
                        source,
                    })
            }
            Role::Unbound => Err(TransportError::InvalidState),
        }
    }

    /// Returns whatever arrived, possibly nothing.
    pub async fn recv(&self) -> Result<Vec<Envelope>, TransportError> {
        let channel = self.channel()?;
        match self.role {
            Role::Server => Ok(recv_from_peers(channel).await?),
            Role::Client => recv_from_upstream(channel).await,
            Role::Unbound => Err(TransportError::InvalidState),
        }
    }

    /// Releases the channel. Call at most once.
    pub async fn close(&self) -> Result<(), TransportError> {
        if let Some(channel) = &self.channel {
            channel.close().await?;
        }
        Ok(())
    }

    fn resolve_name(&self, name: Option<&str>) -> Result<String, TransportError> {
        match name.filter(|name| !name.is_empty()) {
            Some(name) => Ok(name.to_string()),
            None => self.name.clone().ok_or(TransportError::MissingName),
        }
    }

    fn ensure_unbound(&self, next: Role) -> Result<Role, TransportError> {
        if self.channel.is_some() {
            return Err(TransportError::AlreadyBound);
        }
        self.role.advance(next)
    }

    fn attach(&mut self, role: Role, name: String, channel: C::Channel) {
        self.role = role;
        self.name = Some(name);
        self.channel = Some(channel);
    }

    fn channel(&self) -> Result<&C::Channel, TransportError> {
        self.channel.as_ref().ok_or(TransportError::InvalidState)
    }
}

async fn recv_from_peers<D: DuplexChannel>(channel: &D) -> io::Result<Vec<Envelope>> {
    channel.wait_for_data().await?;

    let mut batch = Vec::new();
    for peer in channel.peers().await {
        match read_ready(channel, peer).await {
            Ok(Some(envelope)) => batch.push(envelope),
            Ok(None) => {}
            Err(err) => {
                warn!(peer, error = %err, "failed to read from peer, skipping");
            }
        }
    }
    Ok(batch)
}

async fn read_ready<D: DuplexChannel>(
    channel: &D,
    peer: PeerId,
) -> Result<Option<Envelope>, TransportError> {
    if !channel.can_read(peer).await {
        return Ok(None);
    }
    match channel.read(peer).await? {
        Some(raw) => Ok(Some(Envelope::from_json(&raw)?)),
        None => Ok(None),
    }
}

async fn recv_from_upstream<D: DuplexChannel>(
    channel: &D,
) -> Result<Vec<Envelope>, TransportError> {
    while !channel.can_read(UPSTREAM).await {
        if !channel.is_open(UPSTREAM).await {
            return Err(TransportError::Disconnected);
        }
        // Data arrival wakes us early; the interval only bounds how long a
        // hang-up goes unnoticed.
        if let Ok(Err(err)) = timeout(READ_POLL_INTERVAL, channel.wait_for_data()).await {
            return Err(err.into());
        }
    }

    match channel.read(UPSTREAM).await? {
        Some(raw) if !raw.is_empty() => Ok(vec![Envelope::from_json(&raw)?]),
        _ => Ok(Vec::new()),
    }
}
