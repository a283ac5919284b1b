//! The switching controller.
//!
//! Owns the active-upstream decision. In auto mode a better path must
//! sustain its advantage through a pending-switch confirmation before it
//! takes over; fast failover bypasses the timers when the active path
//! degrades hard. Existing flows stay pinned either way; only new flows
//! see a switch.

use crate::config::SwitchingConfig;
use crate::error::{ForwarderError, Result};
use crate::events::EventBus;
use crate::flow_table::FlowTable;
use crate::upstream::UpstreamManager;
use common::Event;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Selection mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Manual(String),
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual(_) => "manual",
        }
    }
}

/// Outcome of `select_upstream` for a new flow.
#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    pub tag: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
struct Pending {
    tag: String,
    since: Instant,
}

struct ControllerState {
    mode: Mode,
    active_tag: Option<String>,
    pending: Option<Pending>,
    last_switch: Option<Instant>,
    warmup_until: Option<Instant>,
}

/// Linearizes every switching decision under one mutex.
pub struct SwitchController {
    cfg: SwitchingConfig,
    manager: Arc<UpstreamManager>,
    flows: Arc<FlowTable>,
    events: EventBus,
    state: Mutex<ControllerState>,
}

impl SwitchController {
    pub fn new(
        cfg: SwitchingConfig,
        manager: Arc<UpstreamManager>,
        flows: Arc<FlowTable>,
        events: EventBus,
    ) -> Self {
        let mode = match (cfg.mode.as_str(), &cfg.manual_tag) {
            ("manual", Some(tag)) => Mode::Manual(tag.clone()),
            _ => Mode::Auto,
        };
        let active_tag = match &mode {
            Mode::Manual(tag) => Some(tag.clone()),
            Mode::Auto => Some(manager.initial_tag()),
        };
        tracing::info!(
            "switch controller starting in {} mode, active upstream {:?}",
            mode.as_str(),
            active_tag
        );
        Self {
            cfg,
            manager,
            flows,
            events,
            state: Mutex::new(ControllerState {
                mode,
                active_tag,
                pending: None,
                last_switch: None,
                warmup_until: None,
            }),
        }
    }

    /// Relax thresholds and timers for `duration` so the first full
    /// measurement cycle can take effect without flapping.
    pub fn begin_warmup(&self, duration: Duration, now: Instant) {
        if duration.is_zero() {
            return;
        }
        let mut state = self.state.lock();
        state.warmup_until = Some(now + duration);
        tracing::info!("switching warmup for {}s", duration.as_secs());
    }

    pub fn in_warmup(&self, now: Instant) -> bool {
        self.state.lock().warmup_until.is_some_and(|until| until > now)
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode.clone()
    }

    pub fn active_tag(&self) -> Option<String> {
        self.state.lock().active_tag.clone()
    }

    /// Switch between auto and manual selection.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        if let Mode::Manual(tag) = &mode {
            if self.manager.score_of(tag).is_none() {
                return Err(ForwarderError::UnknownUpstream(tag.clone()));
            }
        }
        let mut state = self.state.lock();
        tracing::info!("switching mode set to {}", mode.as_str());
        match &mode {
            Mode::Manual(tag) => {
                state.active_tag = Some(tag.clone());
                state.pending = None;
            }
            Mode::Auto => {
                state.pending = None;
            }
        }
        state.mode = mode;
        Ok(())
    }

    /// Upstream for a new flow. Callers MUST refuse the flow on error;
    /// retrying is their choice.
    pub fn select_upstream(&self, dst_port: Option<u16>) -> Result<SelectedUpstream> {
        let tag = {
            let state = self.state.lock();
            match (&state.mode, &state.active_tag) {
                (Mode::Manual(tag), _) => tag.clone(),
                (Mode::Auto, Some(tag)) => tag.clone(),
                (Mode::Auto, None) => {
                    return Err(ForwarderError::NoUsableUpstream(
                        "no active upstream".into(),
                    ))
                }
            }
        };
        if !self.manager.is_usable(&tag) {
            return Err(ForwarderError::NoUsableUpstream(format!(
                "upstream {} is not usable",
                tag
            )));
        }
        let addr = self.manager.dial_addr(&tag, dst_port).ok_or_else(|| {
            ForwarderError::NoUsableUpstream(format!("upstream {} has no resolved address", tag))
        })?;
        Ok(SelectedUpstream { tag, addr })
    }

    /// Evaluate switching after a scored update. Called by the collector
    /// on every successful measurement.
    pub fn on_scores_updated(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.mode != Mode::Auto {
            return;
        }
        let warmup = state.warmup_until.is_some_and(|until| until > now);

        // The active upstream may have vanished from usability entirely.
        let active = match state.active_tag.clone() {
            Some(tag) => tag,
            None => {
                if let Some((tag, _)) = self.manager.best_candidate(None, None, now) {
                    self.commit_switch(&mut state, None, tag, now, "initial selection");
                }
                return;
            }
        };

        // Fast failover on hard degradation of the active path.
        if let Some((retrans, loss)) = self.manager.loss_of(&active) {
            let worst = retrans.max(loss);
            if worst >= self.cfg.failover_loss_threshold {
                tracing::warn!(
                    "upstream {} loss {:.3} crossed failover threshold {:.3}",
                    active,
                    worst,
                    self.cfg.failover_loss_threshold
                );
                self.fast_failover(&mut state, &active, now);
                return;
            }
        }

        let Some((best, best_score)) = self.manager.best_candidate(None, Some(&active), now)
        else {
            return;
        };
        if best == active {
            state.pending = None;
            return;
        }

        let active_score = self.manager.score_of(&active).unwrap_or(0.0);
        let delta = best_score - active_score;
        let mut threshold = self.cfg.score_delta_threshold;
        if warmup {
            threshold /= 2.0;
        }
        if delta < threshold {
            state.pending = None;
            return;
        }

        let (confirm, min_hold) = if warmup {
            (Duration::ZERO, Duration::ZERO)
        } else {
            (
                Duration::from_secs(self.cfg.confirm_duration_secs),
                Duration::from_secs(self.cfg.min_hold_secs),
            )
        };

        match &state.pending {
            Some(pending) if pending.tag == best => {
                let confirmed = now.duration_since(pending.since) >= confirm;
                let held = state
                    .last_switch
                    .map(|at| now.duration_since(at) >= min_hold)
                    .unwrap_or(true);
                if confirmed && held {
                    self.commit_switch(
                        &mut state,
                        Some(active),
                        best,
                        now,
                        "sustained score advantage",
                    );
                } else {
                    tracing::debug!(
                        "switch to {} pending (confirmed: {}, hold satisfied: {})",
                        best,
                        confirmed,
                        held
                    );
                }
            }
            _ => {
                tracing::info!(
                    "upstream {} outscores active {} by {:.1}, starting confirmation",
                    best,
                    active,
                    delta
                );
                state.pending = Some(Pending {
                    tag: best.clone(),
                    since: now,
                });
                // With zeroed warmup timers the first evaluation commits.
                if confirm.is_zero() {
                    let held = state
                        .last_switch
                        .map(|at| now.duration_since(at) >= min_hold)
                        .unwrap_or(true);
                    if held {
                        self.commit_switch(
                            &mut state,
                            Some(active),
                            best,
                            now,
                            "warmup fast path",
                        );
                    }
                }
            }
        }
    }

    /// Forwarder-reported dial failure. Trips fast failover in auto mode
    /// after the configured consecutive count on the active upstream.
    pub fn on_dial_failure(&self, tag: &str, now: Instant) {
        let count = self.manager.mark_dial_failure(
            tag,
            Duration::from_secs(self.cfg.dial_cooldown_secs),
            now,
        );
        let mut state = self.state.lock();
        if state.mode != Mode::Auto {
            return;
        }
        if state.active_tag.as_deref() == Some(tag) && count >= self.cfg.dial_failure_trip {
            tracing::warn!(
                "upstream {} hit {} consecutive dial failures, failing over",
                tag,
                count
            );
            let failing = tag.to_string();
            self.fast_failover(&mut state, &failing, now);
        }
    }

    /// Successful dial clears the failure counter.
    pub fn on_dial_success(&self, tag: &str) {
        self.manager.clear_dial_failure(tag);
    }

    /// Immediate switch to the next-best usable upstream, skipping the
    /// confirmation timers.
    fn fast_failover(&self, state: &mut ControllerState, failing: &str, now: Instant) {
        match self.manager.best_candidate(Some(failing), None, now) {
            Some((next, _)) => {
                self.commit_switch(
                    state,
                    Some(failing.to_string()),
                    next,
                    now,
                    "fast failover",
                );
                if self.cfg.close_flows_on_failover {
                    let closed = self.flows.close_by_upstream(failing);
                    tracing::warn!(
                        "closed {} flows pinned to failing upstream {}",
                        closed,
                        failing
                    );
                }
            }
            None => {
                tracing::error!(
                    "fast failover from {} impossible: no other usable upstream",
                    failing
                );
            }
        }
    }

    fn commit_switch(
        &self,
        state: &mut ControllerState,
        old: Option<String>,
        new: String,
        now: Instant,
        reason: &str,
    ) {
        tracing::info!(
            "switching active upstream {:?} -> {} ({})",
            old,
            new,
            reason
        );
        state.active_tag = Some(new.clone());
        state.pending = None;
        state.last_switch = Some(now);
        self.events.publish(Event::UpstreamSwitch {
            old_tag: old,
            new_tag: new,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig, UpstreamConfig};
    use crate::upstream::MeasurementUpdate;
    use common::Proto;

    fn upstream(tag: &str, priority: u32) -> UpstreamConfig {
        UpstreamConfig {
            tag: tag.to_string(),
            host: format!("10.0.{}.1:8000", priority),
            measure_host: None,
            measure_port: 9876,
            priority,
            bias: 0.0,
        }
    }

    fn update(rtt_ms: f64, loss: f64) -> MeasurementUpdate {
        MeasurementUpdate {
            proto: Proto::Tcp,
            bw_up_bps: 50_000_000.0,
            bw_down_bps: 200_000_000.0,
            rtt_ms,
            jitter_ms: 2.0,
            loss,
            utilization: 0.0,
        }
    }

    struct Rig {
        manager: Arc<UpstreamManager>,
        controller: SwitchController,
    }

    fn rig(cfg: SwitchingConfig) -> Rig {
        let events = EventBus::new();
        let manager = Arc::new(
            UpstreamManager::new(
                vec![upstream("a", 0), upstream("b", 1)],
                ScoringConfig::default(),
                events.clone(),
            )
            .unwrap(),
        );
        let flows = Arc::new(FlowTable::new(1024));
        let controller =
            SwitchController::new(cfg, manager.clone(), flows, events);
        Rig {
            manager,
            controller,
        }
    }

    fn default_cfg() -> SwitchingConfig {
        SwitchingConfig {
            warmup_secs: 0,
            ..SwitchingConfig::default()
        }
    }

    #[test]
    fn test_initial_active_is_priority_pick() {
        let rig = rig(default_cfg());
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));
    }

    #[test]
    fn test_equal_scores_keep_active() {
        let rig = rig(default_cfg());
        let now = Instant::now();
        rig.manager.apply_measurement("a", update(20.0, 0.001), now).unwrap();
        rig.manager.apply_measurement("b", update(20.0, 0.001), now).unwrap();
        for tick in 0..60 {
            rig.controller
                .on_scores_updated(now + Duration::from_secs(tick));
        }
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));
    }

    #[test]
    fn test_confirmed_switch_after_sustained_advantage() {
        let rig = rig(default_cfg());
        let t0 = Instant::now();
        rig.manager.apply_measurement("a", update(20.0, 0.001), t0).unwrap();
        rig.manager.apply_measurement("b", update(5.0, 0.001), t0).unwrap();

        // Advantage present but unconfirmed: no switch inside 15 s.
        rig.controller.on_scores_updated(t0);
        rig.controller.on_scores_updated(t0 + Duration::from_secs(10));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));

        // Confirm duration (15 s) elapsed, no prior switch to hold.
        rig.controller.on_scores_updated(t0 + Duration::from_secs(16));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
    }

    #[test]
    fn test_pending_clears_when_advantage_fades() {
        let rig = rig(default_cfg());
        let t0 = Instant::now();
        rig.manager.apply_measurement("a", update(20.0, 0.001), t0).unwrap();
        rig.manager.apply_measurement("b", update(5.0, 0.001), t0).unwrap();
        rig.controller.on_scores_updated(t0);

        // The advantage disappears before confirmation.
        rig.manager.apply_measurement("b", update(20.0, 0.001), t0).unwrap();
        rig.controller.on_scores_updated(t0 + Duration::from_secs(5));

        // Re-advantage restarts the confirmation clock.
        rig.manager.apply_measurement("b", update(2.0, 0.001), t0).unwrap();
        rig.controller.on_scores_updated(t0 + Duration::from_secs(6));
        rig.controller.on_scores_updated(t0 + Duration::from_secs(20));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));
        rig.controller.on_scores_updated(t0 + Duration::from_secs(22));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
    }

    #[test]
    fn test_min_hold_delays_second_switch() {
        let rig = rig(default_cfg());
        let t0 = Instant::now();
        rig.manager.apply_measurement("a", update(20.0, 0.001), t0).unwrap();
        rig.manager.apply_measurement("b", update(5.0, 0.001), t0).unwrap();
        rig.controller.on_scores_updated(t0);
        rig.controller.on_scores_updated(t0 + Duration::from_secs(16));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));

        // b degrades (loss below the failover threshold); a's advantage
        // confirms at +32 s but the 30 s hold from the switch at +16 s
        // blocks until +46 s.
        rig.manager.apply_measurement("b", update(20.0, 0.1), t0).unwrap();
        rig.controller.on_scores_updated(t0 + Duration::from_secs(17));
        rig.controller.on_scores_updated(t0 + Duration::from_secs(33));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
        rig.controller.on_scores_updated(t0 + Duration::from_secs(47));
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));
    }

    #[test]
    fn test_fast_failover_on_loss() {
        let rig = rig(default_cfg());
        let now = Instant::now();
        rig.manager.apply_measurement("b", update(20.0, 0.001), now).unwrap();

        // Active upstream a at retransmit rate 0.25, past the 0.2
        // threshold: switch on the next update, no confirmation wait.
        rig.manager.apply_measurement("a", update(20.0, 0.25), now).unwrap();
        rig.controller.on_scores_updated(now);
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
    }

    #[test]
    fn test_dial_failures_trip_failover() {
        let rig = rig(default_cfg());
        let now = Instant::now();
        rig.manager.apply_measurement("a", update(20.0, 0.001), now).unwrap();
        rig.manager.apply_measurement("b", update(20.0, 0.001), now).unwrap();

        rig.controller.on_dial_failure("a", now);
        assert_eq!(rig.controller.active_tag().as_deref(), Some("a"));
        rig.controller.on_dial_failure("a", now);
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
    }

    #[test]
    fn test_warmup_switches_without_timers() {
        let rig = rig(default_cfg());
        let t0 = Instant::now();
        rig.controller.begin_warmup(Duration::from_secs(60), t0);
        assert!(rig.controller.in_warmup(t0));

        rig.manager.apply_measurement("a", update(20.0, 0.001), t0).unwrap();
        rig.manager.apply_measurement("b", update(5.0, 0.001), t0).unwrap();
        rig.controller.on_scores_updated(t0);
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));

        assert!(!rig.controller.in_warmup(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_manual_mode_fixed_and_errors_when_unusable() {
        let mut cfg = default_cfg();
        cfg.mode = "manual".to_string();
        cfg.manual_tag = Some("b".to_string());
        let rig = rig(cfg);
        let now = Instant::now();

        rig.manager.apply_measurement("a", update(2.0, 0.001), now).unwrap();
        rig.manager.apply_measurement("b", update(50.0, 0.001), now).unwrap();
        rig.controller.on_scores_updated(now);
        // Manual mode never moves.
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));

        rig.manager.set_reachable("b", false, now);
        let err = rig.controller.select_upstream(None).unwrap_err();
        assert!(matches!(err, ForwarderError::NoUsableUpstream(_)));
    }

    #[test]
    fn test_set_mode_validates_tag() {
        let rig = rig(default_cfg());
        assert!(rig
            .controller
            .set_mode(Mode::Manual("nope".to_string()))
            .is_err());
        rig.controller.set_mode(Mode::Manual("b".to_string())).unwrap();
        assert_eq!(rig.controller.active_tag().as_deref(), Some("b"));
        rig.controller.set_mode(Mode::Auto).unwrap();
        assert_eq!(rig.controller.mode(), Mode::Auto);
    }
}
