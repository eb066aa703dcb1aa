use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
};
use tracing::{info, warn};

use crate::{
    channel::{Connector, host_connector},
    cli::RelayArgs,
    envelope::Envelope,
    queue::Liveness,
    session::{TransportError, TransportSession},
};

pub async fn run(args: RelayArgs) -> Result<()> {
    let mut session = TransportSession::new(host_connector()?);
    session
        .connect(Some(&args.name))
        .await
        .with_context(|| format!("failed to connect to '{}'", args.name))?;

    let result = relay_until_ctrl_c(&session).await;
    if let Err(err) = session.close().await {
        warn!(error = %err, "failed to close transport cleanly");
    }
    result
}

async fn relay_until_ctrl_c<C: Connector>(session: &TransportSession<C>) -> Result<()> {
    let liveness = Liveness::new();
    let relay = ClientRelayLoop::new(session, tokio::io::stdout(), liveness.clone());

    select! {
        result = relay.run() => match result {
            Err(TransportError::Disconnected) => {
                info!("relay endpoint went away");
                Ok(())
            }
            other => other.context("client relay loop failed"),
        },
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            liveness.shut_down();
            Ok(())
        }
    }
}

/// Drains a client session into an output sink, one JSON line per message.
///
/// Every non-empty batch is acknowledged before it is emitted. The ack is
/// addressed to `NORELAY` and carries no correlation data; its only job is
/// to let the server side's flow control move on to the next write.
pub struct ClientRelayLoop<'a, C: Connector, W> {
    session: &'a TransportSession<C>,
    sink: W,
    liveness: Liveness,
}

impl<'a, C, W> ClientRelayLoop<'a, C, W>
where
    C: Connector,
    W: AsyncWrite + Unpin,
{
    pub fn new(session: &'a TransportSession<C>, sink: W, liveness: Liveness) -> Self {
        Self {
            session,
            sink,
            liveness,
        }
    }

    pub async fn run(mut self) -> Result<(), TransportError> {
        let ack = Envelope::acknowledgement();

        while self.liveness.is_alive() {
            let batch = match self.session.recv().await {
                Ok(batch) => batch,
                Err(TransportError::Envelope(err)) => {
                    // The message was consumed even though it was garbage.
                    warn!(error = %err, "discarding malformed message from upstream");
                    self.session.send(&ack).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if batch.is_empty() {
                continue;
            }

            self.session.send(&ack).await?;
            for envelope in &batch {
                self.emit(envelope).await?;
            }
        }

        Ok(())
    }

    async fn emit(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut line = envelope.to_json()?;
        line.push('\n');
        self.sink.write_all(line.as_bytes()).await?;
        self.sink.flush().await?;
        Ok(())
    }
}
