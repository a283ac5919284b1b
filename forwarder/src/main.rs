#![deny(unused_must_use)]
mod api;
mod collector;
mod config;
mod error;
mod events;
mod flow_table;
mod forwarder;
mod metrics;
mod ratebook;
mod reachability;
mod scheduler;
mod scoring;
mod switching;
mod upstream;

use collector::Collector;
use events::EventBus;
use flow_table::FlowTable;
use forwarder::DataPlaneDeps;
use ratebook::RateBook;
use scheduler::MeasurementScheduler;
use switching::SwitchController;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use upstream::UpstreamManager;

fn init_logging(logging: &config::LoggingConfig) {
    if let Some(filter_directive) = &logging.filter {
        use tracing_subscriber::EnvFilter;
        match EnvFilter::try_new(filter_directive) {
            Ok(env_filter) => {
                tracing_subscriber::fmt().with_env_filter(env_filter).init();
                return;
            }
            Err(e) => {
                eprintln!(
                    "Warning: Invalid filter directive '{}': {}. Using level instead.",
                    filter_directive, e
                );
            }
        }
    }
    let level = match logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::load_or_default();
    init_logging(&config.logging);

    config.validate()?;

    tracing::info!("Starting pathmux forwarder");
    tracing::info!("Configuration loaded:");
    tracing::info!("  Listeners: {}", config.listeners.len());
    tracing::info!(
        "  Upstreams: {}",
        config
            .upstreams
            .iter()
            .map(|u| u.tag.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::info!("  Switching mode: {}", config.switching.mode);
    tracing::info!(
        "  Measurement interval: {}-{}s",
        config.measurement.min_interval_secs,
        config.measurement.max_interval_secs
    );
    tracing::info!("  Probe server enabled: {}", config.probe_server.enabled);
    tracing::info!("  ICMP probing enabled: {}", config.icmp.enabled);

    if config.listeners.is_empty() && !config.probe_server.enabled {
        tracing::error!("No listeners and no probe server enabled; nothing to do.");
        return Err("no listeners configured".into());
    }

    let events = EventBus::new();
    let manager = Arc::new(UpstreamManager::new(
        config.upstreams.clone(),
        config.scoring.clone(),
        events.clone(),
    )?);
    manager.resolve_all().await;

    let flows = Arc::new(FlowTable::new(config.forwarder.max_flows));
    let controller = Arc::new(SwitchController::new(
        config.switching.clone(),
        manager.clone(),
        flows.clone(),
        events.clone(),
    ));
    controller.begin_warmup(
        Duration::from_secs(config.switching.warmup_secs),
        Instant::now(),
    );

    let scheduler = Arc::new(MeasurementScheduler::new(config.measurement.clone()));
    let rates = Arc::new(RateBook::new(manager.tags()));
    let collector = Arc::new(Collector::new(
        config.measurement.clone(),
        scheduler.clone(),
        manager.clone(),
        controller.clone(),
        rates.clone(),
        events.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    let deps = Arc::new(DataPlaneDeps {
        controller: controller.clone(),
        flows: flows.clone(),
        rates: rates.clone(),
        cfg: config.forwarder.clone(),
    });

    for listener in &config.listeners {
        if matches!(listener.proto.as_str(), "tcp" | "both") {
            let deps = deps.clone();
            let cfg = listener.clone();
            let shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = forwarder::run_tcp_listener(deps, cfg, shutdown).await {
                    tracing::error!("tcp listener error: {}", e);
                }
            }));
        }
        if matches!(listener.proto.as_str(), "udp" | "both") {
            let deps = deps.clone();
            let cfg = listener.clone();
            let shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = forwarder::run_udp_listener(deps, cfg, shutdown).await {
                    tracing::error!("udp listener error: {}", e);
                }
            }));
        }
    }

    {
        let deps = deps.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(forwarder::run_idle_sweeper(deps, shutdown)));
    }

    {
        let collector = collector.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(collector.run(shutdown)));
    }

    if config.icmp.enabled {
        let cfg = config.icmp.clone();
        let manager = manager.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(reachability::run_reachability(
            cfg, manager, shutdown,
        )));
    } else {
        tracing::info!("ICMP probing disabled; upstreams stay reachable");
    }

    let probe_server = if config.probe_server.enabled {
        let server = Arc::new(bwprobe::ProbeServer::new(config.probe_server.clone()));
        let runner = server.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                tracing::error!("probe server error: {}", e);
            }
        }));
        Some(server)
    } else {
        None
    };

    if config.api.enabled {
        let state = api::ApiState {
            controller: controller.clone(),
            manager: manager.clone(),
            flows: flows.clone(),
            scheduler: scheduler.clone(),
            events: events.clone(),
        };
        let cfg = config.api.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(api::run_api(cfg, state, shutdown)));
    } else {
        tracing::info!("status api disabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    if let Some(server) = probe_server {
        server.shutdown();
    }

    // Bounded grace period for listeners and flows to wind down.
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed with tasks still running");
    }

    tracing::info!("pathmux stopped");
    Ok(())
}
