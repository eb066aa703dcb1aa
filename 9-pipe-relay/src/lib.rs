//! Relay between an HTTP ingress and a local duplex channel.
//!
//! A process runs in one of two roles:
//!
//! - **server**: accepts envelopes over HTTP, queues them, and a background
//!   drain worker fans each one out to every peer connected to the channel.
//! - **client**: connects to a server's channel, prints every envelope it
//!   receives as one JSON line on stdout, and acknowledges each batch so the
//!   server side keeps moving.
//!
//! Modules, leaves first:
//!
//! - [`envelope`] is the message record and its JSON codec.
//! - [`channel`] is the boundary to the duplex channel; [`local`] implements
//!   it over Unix domain sockets.
//! - [`session`] wraps a channel with the server/client send and receive rules.
//! - [`queue`] holds the outbound FIFO and its drain worker.
//! - [`client`] runs the receive/acknowledge loop.
//! - [`ingress`] is the axum router that feeds the queue.
//! - [`server`] wires the server role together; [`cli`] parses arguments.

pub mod channel;
pub mod cli;
pub mod client;
pub mod envelope;
pub mod ingress;
#[cfg(unix)]
pub mod local;
pub mod queue;
pub mod server;
pub mod session;
