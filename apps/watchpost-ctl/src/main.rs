//! Watchpost controller
//!
//! Sends one command to a running daemon and prints the response.
//!
//! ## Usage
//!
//! ```bash
//! watchpost-ctl status
//! watchpost-ctl alarm on
//! WATCHPOST_ADDR=10.0.0.5:65432 watchpost-ctl schedule
//! ```

use anyhow::{Context, Result};
use tracing::debug;

use watchpost::server::{send_command, DEFAULT_ADDR};

const USAGE: &str = "\
Usage: watchpost-ctl <command>

Commands:
  status        Show alarm state and next scheduled change
  schedule      Show arm/disarm hours
  alarm on      Arm the system
  alarm off     Disarm the system
  alarm reset   Silence a triggered alarm and re-arm
  last          Send the last motion frame to the notification sinks";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let request = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if request.is_empty() || request == "--help" || request == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let addr = std::env::var("WATCHPOST_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    debug!(%addr, %request, "Sending command");

    let response = send_command(addr.as_str(), &request)
        .await
        .with_context(|| format!("Failed to reach watchpost at {}", addr))?;

    println!("{}", response);
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watchpost=warn".parse().unwrap()),
        )
        .init();
}
