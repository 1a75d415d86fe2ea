use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "streamshare-signal",
    author,
    version,
    about = "StreamShare signaling server: session membership and negotiation relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(
        long,
        env = "STREAMSHARE_SIGNAL_LISTEN_ADDR",
        default_value = "0.0.0.0:8787"
    )]
    pub listen_addr: String,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "STREAMSHARE_SIGNAL_LOG", default_value = "info")]
    pub log_filter: String,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, env = "STREAMSHARE_SIGNAL_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "STREAMSHARE_SIGNAL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub otel_stdout: bool,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            log_filter: cli.log_filter,
            otel_stdout: cli.otel_stdout,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_8787() {
        let cli = Cli::try_parse_from(["streamshare-signal"]).expect("parse defaults");
        let config = ServerConfig::try_from(cli).expect("valid config");
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn rejects_unparseable_listen_addr() {
        let cli = Cli::try_parse_from(["streamshare-signal", "--listen-addr", "nowhere"])
            .expect("parse args");
        let err = ServerConfig::try_from(cli).expect_err("invalid address");
        assert!(err.to_string().contains("invalid listen address"));
    }
}
