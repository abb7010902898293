//! Print server events while listening on a modem.
//!
//! Connects to a VARA modem on localhost, registers a call sign and prints
//! every [`ServerEvent`] for 60 seconds. Inbound links are accepted and
//! their data is printed, then the link is ended.
//!
//! # Requirements
//!
//! - VARA HF or VARA FM running with its TCP ports at 8300/8301
//! - Call sign adjusted for your station
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=varalib=debug cargo run -p varalib --example monitor_events
//! ```

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use varalib::{ConnectionEvent, ListenConfig, Server, ServerEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut server = Server::new();
    let mut events = server.subscribe();
    server.listen(
        ListenConfig::new()
            .host("127.0.0.1")
            .control_port(8300)
            .my_call("N0CALL"),
    )?;

    tokio::spawn(async move {
        while let Some(mut conn) = server.accept().await {
            println!("accepted link from {}", conn.remote_call_sign());
            while let Some(event) = conn.next_event().await {
                match event {
                    ConnectionEvent::Data(data) => {
                        println!("  {} bytes: {}", data.len(), varalib::summarize(&data));
                    }
                    ConnectionEvent::Error(e) => println!("  error: {e}"),
                    ConnectionEvent::End => {
                        println!("  remote ended");
                        conn.end().await;
                    }
                    ConnectionEvent::Close => println!("  closed"),
                }
            }
        }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let timestamp = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());
                match event {
                    ServerEvent::Listening(info) => println!(
                        "{timestamp} Listening     {} on {}:{} ({})",
                        info.my_call_signs.join(" "),
                        info.host,
                        info.control_port,
                        info.kind
                    ),
                    ServerEvent::Connection { remote, local } => {
                        println!("{timestamp} Connection    {remote} -> {local}");
                    }
                    ServerEvent::Disconnected { reason } => println!(
                        "{timestamp} Disconnected  {}",
                        reason.as_deref().unwrap_or("-")
                    ),
                    ServerEvent::Error(e) => println!("{timestamp} Error         {e}"),
                    ServerEvent::Reconnecting { attempt } => {
                        println!("{timestamp} Reconnecting  attempt {attempt}");
                    }
                    ServerEvent::Closed => {
                        println!("{timestamp} Closed");
                        break;
                    }
                }
            }
            Ok(Err(RecvError::Lagged(n))) => println!("(missed {n} events due to lag)"),
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => break,
        }
    }

    println!("\nMonitoring complete.");
    Ok(())
}
