use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    channel::{Connector, host_connector},
    cli::RelayArgs,
    ingress,
    queue::{DrainWorker, Liveness, OutboundQueue, outbound_queue},
    session::{TransportError, TransportSession},
};

/// How long shutdown waits for the drain worker after the channel is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub async fn run(args: RelayArgs) -> Result<()> {
    let mut session = TransportSession::new(host_connector()?);
    session
        .bind(Some(&args.name))
        .await
        .with_context(|| format!("failed to bind '{}'", args.name))?;

    let (relay, queue) = RelayTasks::start(Arc::new(session));
    let served = serve_http(queue, &args).await;
    if let Err(err) = relay.shut_down().await {
        warn!(error = %err, "failed to close transport cleanly");
    }
    served
}

/// The background half of a server: the drain worker feeding the channel
/// and the task that drains inbound peer traffic.
pub struct RelayTasks<C: Connector> {
    session: Arc<TransportSession<C>>,
    liveness: Liveness,
    worker: DrainWorker,
    inbound: JoinHandle<()>,
}

impl<C: Connector + 'static> RelayTasks<C> {
    /// Spawns both tasks on a bound session and returns the queue that feeds
    /// them.
    pub fn start(session: Arc<TransportSession<C>>) -> (Self, OutboundQueue) {
        let liveness = Liveness::new();
        let (queue, drain) = outbound_queue();
        let worker = DrainWorker::spawn(drain, Arc::clone(&session), liveness.clone());
        let inbound = spawn_inbound_logger(Arc::clone(&session), liveness.clone());
        let tasks = Self {
            session,
            liveness,
            worker,
            inbound,
        };
        (tasks, queue)
    }

    /// Stops both tasks and closes the session exactly once.
    ///
    /// The channel is closed before the worker is joined: closing is what
    /// fails a fan-out write stuck on a peer that stopped reading.
    pub async fn shut_down(self) -> Result<(), TransportError> {
        self.liveness.shut_down();
        let closed = self.session.close().await;
        self.worker.stop_within(SHUTDOWN_GRACE).await;
        self.inbound.abort();
        closed
    }
}

async fn serve_http(queue: OutboundQueue, args: &RelayArgs) -> Result<()> {
    let addr = args.http_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!("relay listening on {}", listener.local_addr()?);

    axum::serve(listener, ingress::router(queue))
        .with_graceful_shutdown(ctrl_c())
        .await
        .context("HTTP server failed")
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    info!("relay shutting down");
}

/// Keeps peer inboxes drained so client acknowledgements do not pile up.
fn spawn_inbound_logger<C: Connector + 'static>(
    session: Arc<TransportSession<C>>,
    liveness: Liveness,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while liveness.is_alive() {
            match session.recv().await {
                Ok(batch) => {
                    for envelope in batch {
                        debug!(
                            source = envelope.source(),
                            destination = envelope.destination(),
                            content = envelope.content(),
                            "received from peer"
                        );
                    }
                }
                Err(err) => {
                    debug!(error = %err, "inbound receive stopped");
                    break;
                }
            }
        }
    })
}
