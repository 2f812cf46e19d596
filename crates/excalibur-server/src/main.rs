//! excalibur-tunnel-server: hub side of the excalibur tunnel

use clap::Parser;
use tracing::{error, info};

use excalibur_common::shutdown::cancel_on_signal;
use excalibur_common::telemetry::{init_telemetry, TelemetryConfig};
use excalibur_server::{run_server, ServerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // aws-lc-rs is the only provider the TLS stack is built against
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}",
            e
        );
        std::process::exit(1);
    }

    let options = ServerOptions::parse();

    let telemetry = TelemetryConfig {
        json: !options.log_text,
        ..TelemetryConfig::for_service("excalibur-tunnel-server")
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting excalibur tunnel server");

    let stop = cancel_on_signal();
    if let Err(e) = run_server(options, stop).await {
        error!(error = %e, "Tunnel server failed");
        return Err(e.into());
    }
    Ok(())
}
