// vara-test-app -- CLI tool for exercising varalib against a running VARA
// HF or VARA FM modem.
//
// Usage:
//   vara-test-app --call N0CALL listen
//   vara-test-app --host 192.168.1.20 --port 8300 --call N0CALL --call N0CALL-1 listen --echo
//   vara-test-app --call N0CALL --kind fm -vv listen --greeting "Welcome to N0CALL"

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use varalib::{
    Connection, ConnectionEvent, ListenConfig, ModemKind, ReconnectPolicy, Server, ServerEvent,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// vara-test-app -- listens on a VARA modem from the command line.
#[derive(Parser)]
#[command(name = "vara-test-app", version, about)]
struct Cli {
    /// Host running the modem.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Modem control port.
    #[arg(long, default_value_t = 8300)]
    port: u16,

    /// Modem data port (default: control port + 1).
    #[arg(long)]
    data_port: Option<u16>,

    /// Call sign to register. Repeat for more than one.
    #[arg(long = "call", required = true)]
    calls: Vec<String>,

    /// Modem flavour: hf or fm.
    #[arg(long, default_value = "hf", value_parser = parse_kind)]
    kind: ModemKind,

    /// Connect timeout for the control and data sockets, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// Give up after this many consecutive reconnect attempts.
    #[arg(long)]
    max_reconnects: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for inbound links until interrupted.
    Listen {
        /// Send received data back to the remote station.
        #[arg(long)]
        echo: bool,

        /// Text sent to each station when its link comes up.
        #[arg(long)]
        greeting: Option<String>,
    },
}

fn parse_kind(s: &str) -> std::result::Result<ModemKind, String> {
    s.parse::<ModemKind>().map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "varalib=debug,vara_test_app=debug,info",
        _ => "varalib=trace,vara_test_app=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn listen_config(cli: &Cli) -> ListenConfig {
    let mut reconnect = ReconnectPolicy::default();
    if let Some(max) = cli.max_reconnects {
        reconnect = reconnect.max_attempts(max);
    }

    let mut config = ListenConfig::new()
        .host(&cli.host)
        .control_port(cli.port)
        .my_call_signs(cli.calls.iter().cloned())
        .kind(cli.kind)
        .connect_timeout(Duration::from_millis(cli.connect_timeout_ms))
        .reconnect(reconnect);
    if let Some(port) = cli.data_port {
        config = config.data_port(port);
    }
    config
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_listen(cli: &Cli, echo: bool, greeting: Option<&str>) -> Result<()> {
    let mut server = Server::new();
    let mut events = server.subscribe();
    server
        .listen(listen_config(cli))
        .context("invalid listen options")?;

    let greeting = greeting.map(|text| Bytes::from(format!("{text}\r")));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing");
                if server.close().is_err() {
                    debug!("server already stopped");
                }
                server.closed().await;
                return Ok(());
            }

            event = events.recv() => match event {
                Ok(ServerEvent::Closed) => {
                    server.closed().await;
                    bail!("server closed");
                }
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!(missed = n, "event receiver lagged"),
                Err(RecvError::Closed) => bail!("event channel closed"),
            },

            Some(conn) = server.accept() => {
                tokio::spawn(serve_link(conn, echo, greeting.clone()));
            }
        }
    }
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::Listening(info) => println!(
            "listening as {} on {}:{}/{} ({})",
            info.my_call_signs.join(" "),
            info.host,
            info.control_port,
            info.data_port,
            info.kind
        ),
        ServerEvent::Connection { remote, local } => println!("link up: {remote} -> {local}"),
        ServerEvent::Disconnected { reason } => match reason {
            Some(reason) => println!("link down: {reason}"),
            None => println!("link down"),
        },
        ServerEvent::Error(e) => eprintln!("error: {e}"),
        ServerEvent::Reconnecting { attempt } => println!("reconnecting (attempt {attempt})"),
        ServerEvent::Closed => println!("closed"),
    }
}

/// Greet, then print (and optionally echo) everything the station sends.
async fn serve_link(mut conn: Connection, echo: bool, greeting: Option<Bytes>) {
    let remote = conn.remote_call_sign().to_string();

    if let Some(greeting) = greeting {
        if let Err(e) = conn.write(&greeting).await {
            warn!(%remote, error = %e, "greeting failed");
        }
    }

    let mut received = 0usize;
    while let Some(event) = conn.next_event().await {
        match event {
            ConnectionEvent::Data(data) => {
                received += data.len();
                println!("{remote}: {}", String::from_utf8_lossy(&data).trim_end());
                if echo {
                    if let Err(e) = conn.write(&data).await {
                        warn!(%remote, error = %e, "echo failed");
                    }
                }
            }
            ConnectionEvent::Error(e) => eprintln!("{remote}: error: {e}"),
            ConnectionEvent::End => conn.end().await,
            ConnectionEvent::Close => {}
        }
    }
    println!("{remote}: link closed after {received} bytes");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::Listen { echo, greeting } => cmd_listen(&cli, *echo, greeting.as_deref()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_options() {
        let cli = Cli::try_parse_from([
            "vara-test-app",
            "--call",
            "N0CALL",
            "--call",
            "N0CALL-1",
            "--kind",
            "fm",
            "--data-port",
            "9001",
            "listen",
            "--echo",
            "--greeting",
            "hello",
        ])
        .unwrap();
        assert_eq!(cli.calls, vec!["N0CALL", "N0CALL-1"]);
        assert_eq!(cli.kind, ModemKind::Fm);
        assert_eq!(cli.port, 8300);
        assert_eq!(cli.data_port, Some(9001));
        match cli.command {
            Command::Listen { echo, greeting } => {
                assert!(echo);
                assert_eq!(greeting.as_deref(), Some("hello"));
            }
        }
    }

    #[test]
    fn call_sign_is_required() {
        assert!(Cli::try_parse_from(["vara-test-app", "listen"]).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let args = ["vara-test-app", "--call", "N0CALL", "--kind", "vhf", "listen"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
