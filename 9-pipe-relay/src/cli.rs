use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Args, Parser, ValueEnum};

pub const DEFAULT_PORT: u16 = 8080;

/// Relay messages between an HTTP API and a local duplex channel.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Operational mode for this process.
    #[arg(short, long, value_enum)]
    pub mode: Mode,

    #[command(flatten)]
    pub relay: RelayArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accept HTTP posts and fan them out to every connected peer.
    #[value(alias = "s")]
    Server,
    /// Connect to a server and print every message it relays.
    #[value(alias = "c")]
    Client,
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Name of the channel endpoint to create or connect to.
    #[arg(short, long)]
    pub name: String,

    /// Port on which to bind the HTTP interface (server mode only).
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address on which to bind the HTTP interface (server mode only).
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
}

impl RelayArgs {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_mode_aliases_parse() {
        let cli = Cli::try_parse_from(["pipe-relay", "-m", "s", "-n", "relay"]).expect("parse");
        assert_eq!(cli.mode, Mode::Server);
        assert_eq!(cli.relay.port, DEFAULT_PORT);
        assert_eq!(cli.relay.http_addr(), "127.0.0.1:8080".parse::<SocketAddr>().unwrap());

        let cli = Cli::try_parse_from(["pipe-relay", "--mode", "c", "--name", "relay"])
            .expect("parse");
        assert_eq!(cli.mode, Mode::Client);
    }

    #[test]
    fn name_is_required() {
        assert!(Cli::try_parse_from(["pipe-relay", "--mode", "server"]).is_err());
    }

    #[test]
    fn port_and_host_override() {
        let cli = Cli::try_parse_from([
            "pipe-relay",
            "--mode",
            "server",
            "--name",
            "relay",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
        ])
        .expect("parse");
        assert_eq!(cli.relay.http_addr(), "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    }
}
