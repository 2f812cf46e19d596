//! excalibur-tunnel-agent: cluster side of the excalibur tunnel

use clap::Parser;
use tracing::{error, info};

use excalibur_agent::{run_agent, AgentOptions};
use excalibur_common::shutdown::cancel_on_signal;
use excalibur_common::telemetry::{init_telemetry, TelemetryConfig};

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

    let options = AgentOptions::parse();

    let telemetry = TelemetryConfig {
        json: !options.log_text,
        ..TelemetryConfig::for_service("excalibur-tunnel-agent")
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster = %options.cluster_name,
        "Starting excalibur tunnel agent"
    );

    let stop = cancel_on_signal();
    if let Err(e) = run_agent(options, stop).await {
        error!(error = %e, "Tunnel agent failed");
        return Err(e.into());
    }
    Ok(())
}
