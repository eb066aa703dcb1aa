//! Outbound FIFO between the HTTP ingress and the transport.
//!
//! Any number of [`OutboundQueue`] handles push raw payloads; a single
//! [`DrainWorker`] owns the [`QueueDrain`] end and forwards each payload to
//! the transport in push order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{channel::Connector, envelope::Envelope, session::TransportSession};

/// Longest the drain worker sits idle before re-checking liveness.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
#[error("outbound queue is closed")]
pub struct QueueClosed;

/// Process-wide flag that keeps the relay loops running.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn shut_down(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle. Cheap to clone, one per request handler if needed.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::UnboundedSender<String>,
    depth: Arc<AtomicUsize>,
}

/// Consumer end, owned by the drain worker.
#[derive(Debug)]
pub struct QueueDrain {
    receiver: mpsc::UnboundedReceiver<String>,
    depth: Arc<AtomicUsize>,
}

/// Result of waiting on the drain end.
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    Payload(String),
    Idle,
    Closed,
}

pub fn outbound_queue() -> (OutboundQueue, QueueDrain) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        OutboundQueue {
            sender,
            depth: Arc::clone(&depth),
        },
        QueueDrain { receiver, depth },
    )
}

impl OutboundQueue {
    /// Appends to the tail. Never blocks.
    pub fn push(&self, raw: impl Into<String>) -> Result<(), QueueClosed> {
        // Count first so the drain side never observes a negative depth.
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(raw.into()).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Payloads pushed but not yet taken by the drain worker.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueDrain {
    /// Takes the head payload, waiting at most `wait` for one to arrive.
    pub async fn next(&mut self, wait: Duration) -> Next {
        match timeout(wait, self.receiver.recv()).await {
            Ok(Some(raw)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Next::Payload(raw)
            }
            Ok(None) => Next::Closed,
            Err(_) => Next::Idle,
        }
    }
}

/// Background task that empties the queue into a server session.
pub struct DrainWorker {
    handle: JoinHandle<()>,
}

impl DrainWorker {
    pub fn spawn<C>(
        drain: QueueDrain,
        session: Arc<TransportSession<C>>,
        liveness: Liveness,
    ) -> Self
    where
        C: Connector + 'static,
    {
        let handle = tokio::spawn(drain_loop(drain, session, liveness));
        Self { handle }
    }

    /// Waits for the worker to notice shutdown and exit.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            warn!(error = %err, "drain worker ended abnormally");
        }
    }

    /// Like [`DrainWorker::join`], but aborts the worker if it is still busy
    /// after `grace`.
    pub async fn stop_within(mut self, grace: Duration) {
        match timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "drain worker ended abnormally"),
            Err(_) => {
                warn!("drain worker still busy after shutdown, aborting it");
                self.handle.abort();
            }
        }
    }
}

async fn drain_loop<C: Connector>(
    mut drain: QueueDrain,
    session: Arc<TransportSession<C>>,
    liveness: Liveness,
) {
    while liveness.is_alive() {
        match drain.next(IDLE_INTERVAL).await {
            Next::Payload(raw) => deliver(&session, &raw).await,
            Next::Idle => {}
            Next::Closed => {
                debug!("all producers gone, stopping drain worker");
                break;
            }
        }
    }
    info!("drain worker stopped");
}

async fn deliver<C: Connector>(session: &TransportSession<C>, raw: &str) {
    let result = match Envelope::from_json(raw) {
        Ok(envelope) => session.send(&envelope).await,
        Err(err) => Err(err.into()),
    };
    if let Err(err) = result {
        warn!(error = %err, payload = raw, "dropping message that failed to transmit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_grows_depth_and_next_shrinks_it() {
        let (queue, mut drain) = outbound_queue();
        assert!(queue.is_empty());

        queue.push("first").expect("push");
        queue.push("second").expect("push");
        assert_eq!(queue.len(), 2);

        assert_eq!(drain.next(IDLE_INTERVAL).await, Next::Payload("first".into()));
        assert_eq!(queue.len(), 1);
        assert_eq!(drain.next(IDLE_INTERVAL).await, Next::Payload("second".into()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_reports_idle() {
        let (_queue, mut drain) = outbound_queue();
        assert_eq!(drain.next(Duration::from_millis(10)).await, Next::Idle);
    }

    #[tokio::test]
    async fn dropping_producers_closes_drain() {
        let (queue, mut drain) = outbound_queue();
        drop(queue);
        assert_eq!(drain.next(IDLE_INTERVAL).await, Next::Closed);
    }

    #[test]
    fn push_after_drain_dropped_fails() {
        let (queue, drain) = outbound_queue();
        drop(drain);
        assert!(queue.push("late").is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn liveness_is_shared_between_clones() {
        let liveness = Liveness::new();
        let observer = liveness.clone();
        assert!(observer.is_alive());
        liveness.shut_down();
        assert!(!observer.is_alive());
    }
}
