//! One-shot probe run against a server.
//!
//! Run a server first (see the standalone_server example), then:
//! ```bash
//! cargo run --example probe_client
//! ```

use bwprobe::{ProbeConfig, ProbeEngine};
use common::Proto;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ProbeConfig {
        host: "127.0.0.1".to_string(),
        port: 9876,
        network: Proto::Tcp,
        bandwidth_bps: 50_000_000,
        reverse: false,
        samples: 3,
        sample_bytes: 5_000_000,
        ..Default::default()
    };

    let engine = ProbeEngine::new(config)?;
    let (_stop_tx, stop_rx) = watch::channel(false);
    let results = engine.run(stop_rx).await?;

    println!("samples:      {}", results.samples);
    println!("total bytes:  {}", results.total_bytes);
    println!("trimmed mean: {:.1} Mbit/s", results.trimmed_mean_bps / 1e6);
    println!("1s peak:      {:.1} Mbit/s", results.peak_1s_bps / 1e6);
    println!("p80 / p90:    {:.1} / {:.1} Mbit/s", results.p80_bps / 1e6, results.p90_bps / 1e6);
    println!(
        "rtt:          {:.2} ms mean ({:.2} min, {:.2} max, jitter {:.2})",
        results.rtt.mean_ms, results.rtt.min_ms, results.rtt.max_ms, results.rtt.jitter_ms
    );
    if let Some(rate) = results.retrans_rate {
        println!("retransmits:  {:.4}", rate);
    }
    if let Some(rate) = results.loss_rate {
        println!("loss:         {:.4}", rate);
    }

    Ok(())
}
