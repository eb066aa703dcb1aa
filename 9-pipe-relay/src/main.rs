use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;

use pipe_relay::{
    cli::{Cli, Mode},
    client, server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Stdout carries relayed messages in client mode, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Server => server::run(cli.relay).await,
        Mode::Client => client::run(cli.relay).await,
    }
}
