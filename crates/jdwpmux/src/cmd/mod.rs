use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Subcommand};
use jdwpmux_session::{
    DdmsProtocolKind, JdwpSession, SessionConfig, SharedJdwpSession, SharedSessionConfig,
};
use jdwpmux_transport::TcpEndpoint;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exit::{session_error, transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod gc;
pub mod info;
pub mod monitor;
pub mod proxy;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Collect and print process properties over DDMS.
    Info(InfoArgs),
    /// Print every packet the VM sends.
    Monitor(MonitorArgs),
    /// Expose the connection to one external debugger at a time.
    Proxy(ProxyArgs),
    /// Request a garbage collection.
    Gc(GcArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Info(args) => info::run(args, format).await,
        Command::Monitor(args) => monitor::run(args, format).await,
        Command::Proxy(args) => proxy::run(args, format).await,
        Command::Gc(args) => gc::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// JDWP address, typically a port forwarded to the process.
    pub addr: SocketAddr,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "JDWPMUX_CONNECT_TIMEOUT")]
    pub connect_timeout: String,
    /// Device API level; 28 and up discard empty DDMS replies.
    #[arg(long, env = "JDWPMUX_API_LEVEL")]
    pub api_level: Option<u32>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Process id to report the properties under.
    #[arg(long, default_value = "0")]
    pub pid: u32,
    /// Bound on one property collection attempt (e.g. 1s, 300ms).
    #[arg(long, default_value = "1s", env = "JDWPMUX_COLLECT_TIMEOUT")]
    pub collect_timeout: String,
    /// Overall timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "JDWPMUX_TIMEOUT")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Exit after printing N packets.
    #[arg(long)]
    pub count: Option<usize>,
    /// Send a DDMS HELO once the monitor is listening.
    #[arg(long)]
    pub send_helo: bool,
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Address debuggers connect to. Port 0 lets the OS choose.
    #[arg(long, default_value = "127.0.0.1:0", env = "JDWPMUX_LISTEN")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug)]
pub struct GcArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// How long to wait for a reply the VM may never send (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s", env = "JDWPMUX_REPLY_TIMEOUT")]
    pub reply_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

impl ConnectArgs {
    pub fn timeout(&self) -> CliResult<Duration> {
        parse_duration(&self.connect_timeout)
    }

    /// Shared session defaults, adjusted for the device API level.
    pub fn shared_config(&self) -> SharedSessionConfig {
        let mut config = SharedSessionConfig::default();
        if let Some(level) = self.api_level {
            config.ddms_protocol_kind = DdmsProtocolKind::from_api_level(level);
        }
        config
    }

    pub async fn connect_shared(&self, config: SharedSessionConfig) -> CliResult<SharedJdwpSession> {
        let timeout = self.timeout()?;
        let stream = TcpEndpoint::connect_timeout(self.addr, timeout)
            .await
            .map_err(|err| transport_error("connect failed", &err))?;
        let session_config = SessionConfig {
            handshake_timeout: timeout,
            ..SessionConfig::default()
        };
        let session = JdwpSession::connect(stream, session_config)
            .await
            .map_err(|err| session_error("handshake failed", &err))?;
        debug!(addr = %self.addr, "connected");
        Ok(SharedJdwpSession::builder(session).with_config(config).build())
    }
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            token.cancel();
        }
    });
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
