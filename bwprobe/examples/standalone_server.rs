//! Standalone probe server example.
//!
//! Runs a probe server that pathmux forwarders (or the probe_client
//! example) can measure against.
//!
//! Run with:
//! ```bash
//! cargo run --example standalone_server
//! ```

use bwprobe::{ProbeServer, ProbeServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ProbeServerConfig {
        enabled: true,
        host: "0.0.0.0".to_string(),
        port: 9876,
        ..Default::default()
    };

    let server = Arc::new(ProbeServer::new(config));

    println!("probe server starting on 0.0.0.0:9876");
    println!("Press Ctrl+C to stop");

    let server_for_signal = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        println!("\nShutting down...");
        server_for_signal.shutdown();
    });

    if let Err(e) = server.run().await {
        eprintln!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
