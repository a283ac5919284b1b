//! Upstream state and the score pipeline.
//!
//! One [`UpstreamManager`] owns every upstream's mutable state. All
//! mutation goes through its lock; scores and usability are recomputed
//! on every measurement, reachability change and refresh tick.

use crate::config::{ScoringConfig, UpstreamConfig};
use crate::error::{ForwarderError, Result};
use crate::events::EventBus;
use crate::scoring::{self, ScoreInputs};
use common::{Event, Proto, UpstreamSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One scored measurement cycle's worth of inputs.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementUpdate {
    pub proto: Proto,
    pub bw_up_bps: f64,
    pub bw_down_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Retransmit rate (TCP) or loss rate (UDP).
    pub loss: f64,
    pub utilization: f64,
}

/// EMA that seeds directly on its first input.
#[derive(Debug, Clone, Copy, Default)]
struct Ema {
    value: f64,
    seeded: bool,
}

impl Ema {
    fn update(&mut self, input: f64, alpha: f64) {
        if self.seeded {
            self.value = alpha * input + (1.0 - alpha) * self.value;
        } else {
            self.value = input;
            self.seeded = true;
        }
    }

    fn get(&self) -> f64 {
        self.value
    }
}

/// Freshness of one protocol's measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Measured within the stale threshold.
    Fresh,
    /// Measured once, but too long ago.
    Stale,
    /// Never measured. Scored on degraded references but does not count
    /// against usability, so a freshly booted upstream can take flows.
    Never,
}

struct UpstreamState {
    cfg: UpstreamConfig,
    addrs: Vec<SocketAddr>,
    active_addr: Option<SocketAddr>,

    reachable: bool,
    last_reachable: Option<Instant>,
    last_reachable_ms: Option<u64>,

    up_bps: Ema,
    down_bps: Ema,
    rtt_ms: Ema,
    jitter_ms: Ema,
    retrans_rate: Ema,
    loss_rate: Ema,

    tcp_up_bps: f64,
    tcp_down_bps: f64,
    udp_up_bps: f64,
    udp_down_bps: f64,

    last_tcp_update: Option<Instant>,
    last_tcp_update_ms: Option<u64>,
    last_udp_update: Option<Instant>,
    last_udp_update_ms: Option<u64>,

    score_tcp: f64,
    score_udp: f64,
    score_overall: f64,
    usable: bool,
    utilization: f64,

    consecutive_dial_failures: u32,
    cooldown_until: Option<Instant>,
    cooldown_until_ms: Option<u64>,
}

impl UpstreamState {
    fn new(cfg: UpstreamConfig) -> Self {
        Self {
            cfg,
            addrs: Vec::new(),
            active_addr: None,
            // Upstreams start reachable; the ICMP integrator demotes them.
            reachable: true,
            last_reachable: None,
            last_reachable_ms: None,
            up_bps: Ema::default(),
            down_bps: Ema::default(),
            rtt_ms: Ema::default(),
            jitter_ms: Ema::default(),
            retrans_rate: Ema::default(),
            loss_rate: Ema::default(),
            tcp_up_bps: 0.0,
            tcp_down_bps: 0.0,
            udp_up_bps: 0.0,
            udp_down_bps: 0.0,
            last_tcp_update: None,
            last_tcp_update_ms: None,
            last_udp_update: None,
            last_udp_update_ms: None,
            score_tcp: 0.0,
            score_udp: 0.0,
            score_overall: 0.0,
            usable: true,
            utilization: 0.0,
            consecutive_dial_failures: 0,
            cooldown_until: None,
            cooldown_until_ms: None,
        }
    }

    fn freshness(&self, last: Option<Instant>, threshold: u64, now: Instant) -> Freshness {
        match last {
            None => Freshness::Never,
            Some(_) if threshold == 0 => Freshness::Fresh,
            Some(at) if now.duration_since(at) <= Duration::from_secs(threshold) => Freshness::Fresh,
            Some(_) => Freshness::Stale,
        }
    }

    /// Recompute scores and usability from current state.
    fn recompute(&mut self, scoring: &ScoringConfig, now: Instant) {
        let threshold = scoring.stale_threshold_secs;
        let tcp_fresh = self.freshness(self.last_tcp_update, threshold, now);
        let udp_fresh = self.freshness(self.last_udp_update, threshold, now);

        let tcp_inputs = if tcp_fresh == Freshness::Fresh {
            ScoreInputs {
                bw_up_bps: self.tcp_up_bps,
                bw_down_bps: self.tcp_down_bps,
                rtt_ms: self.rtt_ms.get(),
                jitter_ms: self.jitter_ms.get(),
                loss: self.retrans_rate.get(),
            }
        } else {
            scoring::degraded_inputs(&scoring.tcp)
        };
        let udp_inputs = if udp_fresh == Freshness::Fresh {
            ScoreInputs {
                bw_up_bps: self.udp_up_bps,
                bw_down_bps: self.udp_down_bps,
                rtt_ms: self.rtt_ms.get(),
                jitter_ms: self.jitter_ms.get(),
                loss: self.loss_rate.get(),
            }
        } else {
            scoring::degraded_inputs(&scoring.udp)
        };

        let mult = scoring::utilization_multiplier(self.utilization, &scoring.utilization)
            * scoring::bias_multiplier(self.cfg.bias, scoring.bias_kappa);
        self.score_tcp = scoring::clamp_score(
            scoring::protocol_score(&tcp_inputs, &scoring.tcp) * mult,
        );
        self.score_udp = scoring::clamp_score(
            scoring::protocol_score(&udp_inputs, &scoring.udp) * mult,
        );

        // Usability: a positive threshold with no fresh protocol and at
        // least one gone stale demotes the upstream. A never-measured
        // pair keeps its boot grace.
        let any_fresh = tcp_fresh == Freshness::Fresh || udp_fresh == Freshness::Fresh;
        let any_stale = tcp_fresh == Freshness::Stale || udp_fresh == Freshness::Stale;
        self.usable = self.reachable && (any_fresh || !any_stale);

        self.score_overall = if !self.usable {
            0.0
        } else {
            match (tcp_fresh, udp_fresh) {
                (Freshness::Fresh, Freshness::Fresh) => scoring::blend(
                    Some(self.score_tcp),
                    Some(self.score_udp),
                    scoring.blend_tcp_weight,
                    scoring.blend_udp_weight,
                ),
                (Freshness::Fresh, _) => self.score_tcp,
                (_, Freshness::Fresh) => self.score_udp,
                // Boot grace: selectable on degraded-reference scores.
                _ => scoring::blend(
                    Some(self.score_tcp),
                    Some(self.score_udp),
                    scoring.blend_tcp_weight,
                    scoring.blend_udp_weight,
                ),
            }
        };
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    fn snapshot(&self, active: bool) -> UpstreamSnapshot {
        UpstreamSnapshot {
            tag: self.cfg.tag.clone(),
            host: self.cfg.host.clone(),
            priority: self.cfg.priority,
            bias: self.cfg.bias,
            active,
            reachable: self.reachable,
            usable: self.usable,
            last_reachable_ms: self.last_reachable_ms,
            up_bps: self.up_bps.get(),
            down_bps: self.down_bps.get(),
            tcp_up_bps: self.tcp_up_bps,
            tcp_down_bps: self.tcp_down_bps,
            udp_up_bps: self.udp_up_bps,
            udp_down_bps: self.udp_down_bps,
            rtt_ms: self.rtt_ms.get(),
            jitter_ms: self.jitter_ms.get(),
            retrans_rate: self.retrans_rate.get(),
            loss_rate: self.loss_rate.get(),
            loss: self.retrans_rate.get().max(self.loss_rate.get()),
            last_tcp_update_ms: self.last_tcp_update_ms,
            last_udp_update_ms: self.last_udp_update_ms,
            score_tcp: self.score_tcp,
            score_udp: self.score_udp,
            score_overall: self.score_overall,
            utilization: self.utilization,
            consecutive_dial_failures: self.consecutive_dial_failures,
            cooldown_until_ms: self.cooldown_until_ms,
        }
    }
}

/// Owner of all upstream state.
pub struct UpstreamManager {
    inner: RwLock<HashMap<String, UpstreamState>>,
    /// Config order, used for deterministic iteration and initial pick.
    order: Vec<String>,
    scoring: ScoringConfig,
    events: EventBus,
}

impl UpstreamManager {
    pub fn new(
        upstreams: Vec<UpstreamConfig>,
        scoring: ScoringConfig,
        events: EventBus,
    ) -> Result<Self> {
        if upstreams.is_empty() {
            return Err(ForwarderError::Config("no upstreams configured".into()));
        }
        let order: Vec<String> = upstreams.iter().map(|u| u.tag.clone()).collect();
        let mut map = HashMap::new();
        for cfg in upstreams {
            if map
                .insert(cfg.tag.clone(), UpstreamState::new(cfg))
                .is_some()
            {
                return Err(ForwarderError::Config("duplicate upstream tag".into()));
            }
        }
        Ok(Self {
            inner: RwLock::new(map),
            order,
            scoring,
            events,
        })
    }

    pub fn tags(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Initial pick: lowest priority value wins, config order breaks ties.
    pub fn initial_tag(&self) -> String {
        let inner = self.inner.read();
        self.order
            .iter()
            .min_by_key(|tag| inner.get(*tag).map(|s| s.cfg.priority).unwrap_or(u32::MAX))
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve every upstream's dial address. DNS sits at the boundary;
    /// failures log and leave the upstream without an address until the
    /// next resolve.
    pub async fn resolve_all(&self) {
        let targets: Vec<(String, String)> = {
            let inner = self.inner.read();
            self.order
                .iter()
                .filter_map(|tag| inner.get(tag).map(|s| (tag.clone(), s.cfg.host.clone())))
                .collect()
        };

        for (tag, host) in targets {
            match tokio::net::lookup_host(&host).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    if addrs.is_empty() {
                        tracing::warn!("upstream {}: {} resolved to nothing", tag, host);
                        continue;
                    }
                    let mut inner = self.inner.write();
                    if let Some(state) = inner.get_mut(&tag) {
                        state.active_addr = Some(addrs[0]);
                        state.addrs = addrs;
                    }
                }
                Err(e) => {
                    tracing::warn!("upstream {}: failed to resolve {}: {}", tag, host, e);
                }
            }
        }
    }

    /// Dial target for new flows on this upstream.
    pub fn dial_addr(&self, tag: &str, dst_port: Option<u16>) -> Option<SocketAddr> {
        let inner = self.inner.read();
        let state = inner.get(tag)?;
        let mut addr = state
            .active_addr
            .or_else(|| state.addrs.first().copied())?;
        if let Some(port) = dst_port {
            addr.set_port(port);
        }
        Some(addr)
    }

    pub fn measure_endpoint(&self, tag: &str) -> Option<(String, u16)> {
        let inner = self.inner.read();
        inner
            .get(tag)
            .map(|s| (s.cfg.measure_host(), s.cfg.measure_port))
    }

    /// Probe-capacity estimate for the headroom gate: the best measured
    /// bandwidth per upstream, falling back to `fallback_bps`.
    pub fn aggregate_capacity_bps(&self, fallback_bps: f64) -> f64 {
        let inner = self.inner.read();
        inner
            .values()
            .map(|s| {
                let best = s
                    .tcp_up_bps
                    .max(s.tcp_down_bps)
                    .max(s.udp_up_bps)
                    .max(s.udp_down_bps);
                if best > 0.0 {
                    best
                } else {
                    fallback_bps
                }
            })
            .sum()
    }

    /// Per-direction capacity for utilization accounting: last measured
    /// per-protocol bandwidth when positive, else the configured target.
    pub fn capacity_for(&self, tag: &str, proto: Proto, target_up: f64, target_down: f64) -> (f64, f64) {
        let inner = self.inner.read();
        match inner.get(tag) {
            Some(state) => {
                let (up, down) = match proto {
                    Proto::Tcp => (state.tcp_up_bps, state.tcp_down_bps),
                    Proto::Udp => (state.udp_up_bps, state.udp_down_bps),
                };
                (
                    if up > 0.0 { up } else { target_up },
                    if down > 0.0 { down } else { target_down },
                )
            }
            None => (target_up, target_down),
        }
    }

    /// Fold one measurement cycle into the state and rescore.
    pub fn apply_measurement(&self, tag: &str, update: MeasurementUpdate, now: Instant) -> Result<()> {
        let alpha = self.scoring.alpha;
        let mut inner = self.inner.write();
        let state = inner
            .get_mut(tag)
            .ok_or_else(|| ForwarderError::UnknownUpstream(tag.to_string()))?;

        let was_usable = state.usable;
        state.up_bps.update(update.bw_up_bps, alpha);
        state.down_bps.update(update.bw_down_bps, alpha);
        state.rtt_ms.update(update.rtt_ms, alpha);
        state.jitter_ms.update(update.jitter_ms, alpha);

        let now_ms = bwprobe::now_ms();
        match update.proto {
            Proto::Tcp => {
                state.retrans_rate.update(update.loss, alpha);
                state.tcp_up_bps = update.bw_up_bps;
                state.tcp_down_bps = update.bw_down_bps;
                state.last_tcp_update = Some(now);
                state.last_tcp_update_ms = Some(now_ms);
            }
            Proto::Udp => {
                state.loss_rate.update(update.loss, alpha);
                state.udp_up_bps = update.bw_up_bps;
                state.udp_down_bps = update.bw_down_bps;
                state.last_udp_update = Some(now);
                state.last_udp_update_ms = Some(now_ms);
            }
        }
        state.utilization = update.utilization.clamp(0.0, 1.0);
        state.recompute(&self.scoring, now);

        tracing::debug!(
            "upstream {} scored: tcp {:.1} udp {:.1} overall {:.1} (rtt {:.1}ms loss {:.4})",
            tag,
            state.score_tcp,
            state.score_udp,
            state.score_overall,
            state.rtt_ms.get(),
            update.loss
        );

        let usable = state.usable;
        drop(inner);
        if usable != was_usable {
            self.events.publish(Event::UpstreamStateChange {
                tag: tag.to_string(),
                usable,
            });
        }
        Ok(())
    }

    /// Reachability toggle from the ICMP integrator.
    pub fn set_reachable(&self, tag: &str, reachable: bool, now: Instant) {
        let mut inner = self.inner.write();
        let Some(state) = inner.get_mut(tag) else {
            return;
        };
        let was_usable = state.usable;
        if reachable {
            state.last_reachable = Some(now);
            state.last_reachable_ms = Some(bwprobe::now_ms());
        }
        if state.reachable != reachable {
            tracing::info!(
                "upstream {} became {}",
                tag,
                if reachable { "reachable" } else { "unreachable" }
            );
        }
        state.reachable = reachable;
        state.recompute(&self.scoring, now);
        let usable = state.usable;
        drop(inner);
        if usable != was_usable {
            self.events.publish(Event::UpstreamStateChange {
                tag: tag.to_string(),
                usable,
            });
        }
    }

    /// Periodic rescore so staleness demotion and cooldown expiry take
    /// effect without waiting for a measurement.
    pub fn refresh(&self, now: Instant) {
        let mut flipped = Vec::new();
        {
            let mut inner = self.inner.write();
            for (tag, state) in inner.iter_mut() {
                let was_usable = state.usable;
                if state.cooldown_until.is_some_and(|until| until <= now) {
                    state.cooldown_until = None;
                    state.cooldown_until_ms = None;
                }
                state.recompute(&self.scoring, now);
                if state.usable != was_usable {
                    flipped.push((tag.clone(), state.usable));
                }
            }
        }
        for (tag, usable) in flipped {
            tracing::info!(
                "upstream {} became {}",
                tag,
                if usable { "usable" } else { "unusable" }
            );
            self.events.publish(Event::UpstreamStateChange { tag, usable });
        }
    }

    /// Record a dial failure; returns the consecutive count.
    pub fn mark_dial_failure(&self, tag: &str, cooldown: Duration, now: Instant) -> u32 {
        let mut inner = self.inner.write();
        let Some(state) = inner.get_mut(tag) else {
            return 0;
        };
        state.consecutive_dial_failures += 1;
        state.cooldown_until = Some(now + cooldown);
        state.cooldown_until_ms = Some(bwprobe::now_ms() + cooldown.as_millis() as u64);
        tracing::warn!(
            "upstream {} dial failure #{}, cooldown {}s",
            tag,
            state.consecutive_dial_failures,
            cooldown.as_secs()
        );
        state.consecutive_dial_failures
    }

    pub fn clear_dial_failure(&self, tag: &str) {
        let mut inner = self.inner.write();
        if let Some(state) = inner.get_mut(tag) {
            if state.consecutive_dial_failures > 0 {
                tracing::debug!("upstream {} dial failures cleared", tag);
            }
            state.consecutive_dial_failures = 0;
            state.cooldown_until = None;
            state.cooldown_until_ms = None;
        }
    }

    pub fn is_usable(&self, tag: &str) -> bool {
        self.inner.read().get(tag).map(|s| s.usable).unwrap_or(false)
    }

    pub fn score_of(&self, tag: &str) -> Option<f64> {
        self.inner.read().get(tag).map(|s| s.score_overall)
    }

    /// Smoothed `(retrans_rate, loss_rate)` for the failover check.
    pub fn loss_of(&self, tag: &str) -> Option<(f64, f64)> {
        self.inner
            .read()
            .get(tag)
            .map(|s| (s.retrans_rate.get(), s.loss_rate.get()))
    }

    /// Highest-scoring usable upstream outside dial cooldown. Ties favor
    /// `prefer` (hysteresis), then config order.
    pub fn best_candidate(
        &self,
        exclude: Option<&str>,
        prefer: Option<&str>,
        now: Instant,
    ) -> Option<(String, f64)> {
        let inner = self.inner.read();
        let mut best: Option<(String, f64)> = None;
        for tag in &self.order {
            if exclude == Some(tag.as_str()) {
                continue;
            }
            let Some(state) = inner.get(tag) else { continue };
            if !state.usable || state.in_cooldown(now) {
                continue;
            }
            let score = state.score_overall;
            match &best {
                None => best = Some((tag.clone(), score)),
                Some((best_tag, best_score)) => {
                    let wins = score > *best_score
                        || (score == *best_score
                            && prefer == Some(tag.as_str())
                            && prefer != Some(best_tag.as_str()));
                    if wins {
                        best = Some((tag.clone(), score));
                    }
                }
            }
        }
        best
    }

    pub fn snapshot(&self, active_tag: Option<&str>) -> Vec<UpstreamSnapshot> {
        let inner = self.inner.read();
        self.order
            .iter()
            .filter_map(|tag| {
                inner
                    .get(tag)
                    .map(|s| s.snapshot(active_tag == Some(tag.as_str())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn upstream(tag: &str, priority: u32) -> UpstreamConfig {
        UpstreamConfig {
            tag: tag.to_string(),
            host: format!("10.0.0.{}:8000", priority + 1),
            measure_host: None,
            measure_port: 9876,
            priority,
            bias: 0.0,
        }
    }

    fn manager() -> UpstreamManager {
        UpstreamManager::new(
            vec![upstream("a", 0), upstream("b", 1)],
            ScoringConfig::default(),
            EventBus::new(),
        )
        .unwrap()
    }

    fn good_update(proto: Proto) -> MeasurementUpdate {
        MeasurementUpdate {
            proto,
            bw_up_bps: 50_000_000.0,
            bw_down_bps: 200_000_000.0,
            rtt_ms: 20.0,
            jitter_ms: 2.0,
            loss: 0.001,
            utilization: 0.0,
        }
    }

    #[test]
    fn test_initial_tag_by_priority() {
        let manager = UpstreamManager::new(
            vec![upstream("low", 5), upstream("high", 1)],
            ScoringConfig::default(),
            EventBus::new(),
        )
        .unwrap();
        assert_eq!(manager.initial_tag(), "high");
    }

    #[test]
    fn test_boot_grace_is_usable_with_degraded_score() {
        let manager = manager();
        manager.refresh(Instant::now());
        assert!(manager.is_usable("a"));
        let score = manager.score_of("a").unwrap();
        assert!(score > 0.0 && score <= 100.0);
    }

    #[test]
    fn test_ema_seeds_then_smooths() {
        let mut ema = Ema::default();
        ema.update(100.0, 0.3);
        assert_eq!(ema.get(), 100.0);
        ema.update(0.0, 0.3);
        assert!((ema.get() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_converges_to_constant_input() {
        let mut ema = Ema::default();
        for _ in 0..100 {
            ema.update(42.0, 0.3);
        }
        assert!((ema.get() - 42.0).abs() < 1e-9);

        let mut ema = Ema::default();
        ema.update(1000.0, 0.05);
        for _ in 0..500 {
            ema.update(10.0, 0.05);
        }
        assert!((ema.get() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_identical_streams_equal_scores() {
        let manager = manager();
        let now = Instant::now();
        for tag in ["a", "b"] {
            manager.apply_measurement(tag, good_update(Proto::Tcp), now).unwrap();
            manager.apply_measurement(tag, good_update(Proto::Udp), now).unwrap();
        }
        let a = manager.score_of("a").unwrap();
        let b = manager.score_of("b").unwrap();
        assert!((a - b).abs() < 1e-3, "a {} vs b {}", a, b);
        assert!(a > 0.0);
    }

    #[test]
    fn test_unreachable_zeroes_score() {
        let manager = manager();
        let now = Instant::now();
        manager.apply_measurement("a", good_update(Proto::Tcp), now).unwrap();
        assert!(manager.score_of("a").unwrap() > 0.0);

        manager.set_reachable("a", false, now);
        assert!(!manager.is_usable("a"));
        assert_eq!(manager.score_of("a").unwrap(), 0.0);

        manager.set_reachable("a", true, now);
        assert!(manager.is_usable("a"));
        assert!(manager.score_of("a").unwrap() > 0.0);
    }

    #[test]
    fn test_stale_demotion_and_recovery() {
        let mut scoring = ScoringConfig::default();
        scoring.stale_threshold_secs = 60;
        let manager = UpstreamManager::new(
            vec![upstream("c", 0)],
            scoring,
            EventBus::new(),
        )
        .unwrap();

        let t0 = Instant::now();
        manager.apply_measurement("c", good_update(Proto::Tcp), t0).unwrap();
        manager.apply_measurement("c", good_update(Proto::Udp), t0).unwrap();
        let blended = manager.score_of("c").unwrap();

        // UDP ages past the threshold; overall falls to the TCP-only value.
        let t1 = t0 + Duration::from_secs(61);
        manager.apply_measurement("c", good_update(Proto::Tcp), t1).unwrap();
        let tcp_only = manager.score_of("c").unwrap();
        assert!(manager.is_usable("c"));
        assert_ne!(blended, tcp_only);

        // A UDP update brings the blend back within one update.
        manager.apply_measurement("c", good_update(Proto::Udp), t1).unwrap();
        let restored = manager.score_of("c").unwrap();
        assert!((restored - blended).abs() < blended * 0.35);

        // Both stale: unusable, score zero.
        let t2 = t1 + Duration::from_secs(120);
        manager.refresh(t2);
        assert!(!manager.is_usable("c"));
        assert_eq!(manager.score_of("c").unwrap(), 0.0);
    }

    #[test]
    fn test_dial_failure_cooldown_excludes_candidate() {
        let manager = manager();
        let now = Instant::now();
        manager.apply_measurement("a", good_update(Proto::Tcp), now).unwrap();
        manager.apply_measurement("b", good_update(Proto::Tcp), now).unwrap();

        let count = manager.mark_dial_failure("a", Duration::from_secs(30), now);
        assert_eq!(count, 1);
        let (tag, _) = manager.best_candidate(None, None, now).unwrap();
        assert_eq!(tag, "b");

        // Cooldown expires.
        manager.refresh(now + Duration::from_secs(31));
        let candidates = manager.best_candidate(None, Some("a"), now + Duration::from_secs(31));
        assert!(candidates.is_some());

        manager.clear_dial_failure("a");
        let snap = &manager.snapshot(None)[0];
        assert_eq!(snap.consecutive_dial_failures, 0);
        assert!(snap.cooldown_until_ms.is_none());
    }

    #[test]
    fn test_hysteresis_prefers_active_on_tie() {
        let manager = manager();
        let now = Instant::now();
        manager.apply_measurement("a", good_update(Proto::Tcp), now).unwrap();
        manager.apply_measurement("b", good_update(Proto::Tcp), now).unwrap();

        let (tag, _) = manager.best_candidate(None, Some("b"), now).unwrap();
        assert_eq!(tag, "b");
        let (tag, _) = manager.best_candidate(None, Some("a"), now).unwrap();
        assert_eq!(tag, "a");
    }

    #[test]
    fn test_snapshot_marks_active() {
        let manager = manager();
        let snaps = manager.snapshot(Some("b"));
        assert_eq!(snaps.len(), 2);
        assert!(!snaps[0].active);
        assert!(snaps[1].active);
        assert_eq!(snaps[1].tag, "b");
    }
}
