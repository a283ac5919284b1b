//! The measurement collector.
//!
//! Runs the scheduler's tick loop and, single-flight, the probe engine
//! for each dequeued (upstream, protocol) entry: one forward run for
//! upload, one reverse run for download. Successful cycles feed the
//! scorer and the switching controller; failures requeue with a delay
//! and count toward the ICMP-only observability flag.

use crate::config::{MeasurementConfig, ProtoProbeConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::ratebook::RateBook;
use crate::scheduler::{MeasurementScheduler, QueueEntry};
use crate::switching::SwitchController;
use crate::upstream::{MeasurementUpdate, UpstreamManager};
use bwprobe::{ProbeConfig, ProbeEngine, ProbeError, Results};
use common::{Direction, Event, Proto};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

pub struct Collector {
    cfg: MeasurementConfig,
    scheduler: Arc<MeasurementScheduler>,
    manager: Arc<UpstreamManager>,
    controller: Arc<SwitchController>,
    rates: Arc<RateBook>,
    events: EventBus,
    /// Consecutive probe failures per upstream.
    failures: Mutex<HashMap<String, u32>>,
}

impl Collector {
    pub fn new(
        cfg: MeasurementConfig,
        scheduler: Arc<MeasurementScheduler>,
        manager: Arc<UpstreamManager>,
        controller: Arc<SwitchController>,
        rates: Arc<RateBook>,
        events: EventBus,
    ) -> Self {
        Self {
            cfg,
            scheduler,
            manager,
            controller,
            rates,
            events,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Tick loop: bookkeeping every second, at most one probe cycle in
    /// flight at a time.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = Instant::now();
                    self.manager.refresh(now);
                    self.rates.roll(now);
                    self.scheduler.tick(&self.manager.tags(), now);

                    let window = Duration::from_secs(self.cfg.headroom_window_secs);
                    let current_rate = self.rates.aggregate_rate_bps(window, now);
                    let capacity = self
                        .manager
                        .aggregate_capacity_bps(self.cfg.tcp.max_target_bps());
                    if let Some(entry) = self.scheduler.next_ready(now, current_rate, capacity) {
                        self.run_entry(entry).await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("collector shutting down");
                    return;
                }
            }
        }
    }

    async fn run_entry(&self, entry: QueueEntry) {
        let tag = entry.tag.clone();
        let proto = entry.proto;
        let Some((host, port)) = self.manager.measure_endpoint(&tag) else {
            tracing::error!("no measure endpoint for upstream {}", tag);
            return;
        };
        let probe_cfg = match proto {
            Proto::Tcp => self.cfg.tcp.clone(),
            Proto::Udp => self.cfg.udp.clone(),
        };
        tracing::info!("measuring {} over {} against {}:{}", tag, proto.as_str(), host, port);

        let mut runs: Vec<(Direction, Results)> = Vec::with_capacity(2);
        for (direction, reverse, target_bps) in [
            (Direction::Up, false, probe_cfg.target_up_bps),
            (Direction::Down, true, probe_cfg.target_down_bps),
        ] {
            let started_ms = bwprobe::now_ms();
            let started = Instant::now();
            match self
                .run_probe(&host, port, proto, reverse, target_bps, &probe_cfg)
                .await
            {
                Ok(results) => {
                    self.events.publish(Event::TestComplete {
                        tag: tag.clone(),
                        proto,
                        direction,
                        started_at_ms: started_ms,
                        duration_ms: started.elapsed().as_millis() as u64,
                        success: true,
                        bandwidth_bps: Some(results.trimmed_mean_bps),
                        rtt_ms: Some(results.rtt.mean_ms),
                        loss: results.retrans_rate.or(results.loss_rate),
                        error: None,
                    });
                    runs.push((direction, results));
                }
                Err(e) => {
                    tracing::warn!(
                        "measurement of {} over {} ({}) failed: {}",
                        tag,
                        proto.as_str(),
                        direction.as_str(),
                        e
                    );
                    self.events.publish(Event::TestComplete {
                        tag: tag.clone(),
                        proto,
                        direction,
                        started_at_ms: started_ms,
                        duration_ms: started.elapsed().as_millis() as u64,
                        success: false,
                        bandwidth_bps: None,
                        rtt_ms: None,
                        loss: None,
                        error: Some(e.to_string()),
                    });
                    self.record_failure(&tag);
                    self.scheduler.requeue(
                        entry,
                        Duration::from_secs(self.cfg.retry_delay_secs),
                        Instant::now(),
                    );
                    return;
                }
            }
        }

        let now = Instant::now();
        let update = self.combine(proto, &runs, &tag, &probe_cfg, now);
        if let Err(e) = self.manager.apply_measurement(&tag, update, now) {
            tracing::error!("failed to apply measurement for {}: {}", tag, e);
            return;
        }
        self.scheduler.mark_run(&tag, proto, now);
        self.controller.on_scores_updated(now);
        self.clear_failure(&tag);
    }

    /// Fold the forward and reverse runs into one scorer update.
    fn combine(
        &self,
        proto: Proto,
        runs: &[(Direction, Results)],
        tag: &str,
        probe_cfg: &ProtoProbeConfig,
        now: Instant,
    ) -> MeasurementUpdate {
        let mut bw_up = 0.0;
        let mut bw_down = 0.0;
        let mut rtt_weighted = 0.0;
        let mut jitter_weighted = 0.0;
        let mut rtt_samples = 0usize;
        let mut loss: f64 = 0.0;

        for (direction, results) in runs {
            match direction {
                Direction::Up => bw_up = results.trimmed_mean_bps,
                Direction::Down => bw_down = results.trimmed_mean_bps,
            }
            if results.rtt.samples > 0 {
                rtt_weighted += results.rtt.mean_ms * results.rtt.samples as f64;
                jitter_weighted += results.rtt.jitter_ms * results.rtt.samples as f64;
                rtt_samples += results.rtt.samples;
            }
            let run_loss = match proto {
                Proto::Tcp => results.retrans_rate.unwrap_or(0.0),
                Proto::Udp => results.loss_rate.unwrap_or(0.0),
            };
            loss = loss.max(run_loss);
        }

        let (rtt_ms, jitter_ms) = if rtt_samples > 0 {
            (
                rtt_weighted / rtt_samples as f64,
                jitter_weighted / rtt_samples as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let (cap_up, cap_down) = self.manager.capacity_for(
            tag,
            proto,
            probe_cfg.target_up_bps as f64,
            probe_cfg.target_down_bps as f64,
        );
        let utilization = self.rates.utilization(
            tag,
            cap_up,
            cap_down,
            Duration::from_secs(self.cfg.utilization_window_secs),
            now,
        );

        MeasurementUpdate {
            proto,
            bw_up_bps: bw_up,
            bw_down_bps: bw_down,
            rtt_ms,
            jitter_ms,
            loss,
            utilization,
        }
    }

    async fn run_probe(
        &self,
        host: &str,
        port: u16,
        proto: Proto,
        reverse: bool,
        target_bps: u64,
        probe_cfg: &ProtoProbeConfig,
    ) -> Result<Results> {
        let config = ProbeConfig {
            host: host.to_string(),
            port,
            network: proto,
            bandwidth_bps: target_bps,
            reverse,
            samples: probe_cfg.samples,
            sample_bytes: probe_cfg.sample_bytes,
            chunk_bytes: probe_cfg.chunk_bytes,
            max_sample_duration: Some(Duration::from_secs(probe_cfg.sample_timeout_secs)),
            ..ProbeConfig::default()
        };
        let engine = ProbeEngine::new(config)?;
        let (_stop_tx, stop_rx) = watch::channel(false);
        let results = tokio::time::timeout(
            Duration::from_secs(self.cfg.cycle_timeout_secs),
            engine.run(stop_rx),
        )
        .await
        .map_err(|_| ProbeError::Timeout("measurement cycle".to_string()))??;
        Ok(results)
    }

    fn record_failure(&self, tag: &str) {
        let mut failures = self.failures.lock();
        let count = failures.entry(tag.to_string()).or_insert(0);
        *count += 1;
        if *count == self.cfg.failure_trip {
            // Observability only: scoring keeps running on EMA state and
            // staleness does the demotion.
            if self.cfg.fallback_to_icmp_on_stale {
                tracing::warn!(
                    "upstream {} failed {} consecutive measurements, running on ICMP reachability only (stale fallback enabled)",
                    tag,
                    count
                );
            } else {
                tracing::warn!(
                    "upstream {} failed {} consecutive measurements, running on ICMP reachability only",
                    tag,
                    count
                );
            }
        }
    }

    fn clear_failure(&self, tag: &str) {
        let mut failures = self.failures.lock();
        if let Some(count) = failures.remove(tag) {
            if count >= self.cfg.failure_trip {
                tracing::info!("upstream {} measurements recovered after {} failures", tag, count);
            }
        }
    }

    /// Consecutive failures for an upstream, for tests and diagnostics.
    pub fn failure_count(&self, tag: &str) -> u32 {
        self.failures.lock().get(tag).copied().unwrap_or(0)
    }
}
