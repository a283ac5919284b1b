//! Forwarder configuration.
//!
//! Loaded from an optional `pathmux` config file plus `PATHMUX__`
//! environment overrides. `validate()` enforces the construction
//! invariants; the process refuses to start on violation.

use crate::error::{ForwarderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub switching: SwitchingConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub icmp: IcmpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Embedded probe server so forwarders can measure against each other.
    #[serde(default)]
    pub probe_server: bwprobe::ProbeServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// "ip:port" to accept flows on.
    pub listen: String,
    /// "tcp", "udp" or "both".
    #[serde(default = "default_listener_proto")]
    pub proto: String,
    /// Overrides the destination port of the active upstream's host.
    #[serde(default)]
    pub dst_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Unique identifier.
    pub tag: String,
    /// "host:port" forwarded traffic is dialed to.
    pub host: String,
    /// Probe endpoint host; defaults to the host part of `host`.
    #[serde(default)]
    pub measure_host: Option<String>,
    #[serde(default = "default_measure_port")]
    pub measure_port: u16,
    /// Lower value is preferred for the initial selection.
    #[serde(default)]
    pub priority: u32,
    /// Operator preference in [-1, 1]; positive favors this upstream.
    #[serde(default)]
    pub bias: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// EMA smoothing factor in (0, 1].
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// A protocol unmeasured for this long scores on degraded reference
    /// inputs; 0 disables staleness entirely.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    #[serde(default = "ProtoScoringConfig::default_tcp")]
    pub tcp: ProtoScoringConfig,
    #[serde(default = "ProtoScoringConfig::default_udp")]
    pub udp: ProtoScoringConfig,
    /// Cross-protocol blend weights, normalized at use.
    #[serde(default = "default_blend_weight")]
    pub blend_tcp_weight: f64,
    #[serde(default = "default_blend_weight")]
    pub blend_udp_weight: f64,
    #[serde(default)]
    pub utilization: UtilizationConfig,
    /// Bias multiplier steepness; `clamp(exp(kappa * bias), 0.67, 1.5)`.
    #[serde(default = "default_bias_kappa")]
    pub bias_kappa: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            stale_threshold_secs: default_stale_threshold(),
            tcp: ProtoScoringConfig::default_tcp(),
            udp: ProtoScoringConfig::default_udp(),
            blend_tcp_weight: default_blend_weight(),
            blend_udp_weight: default_blend_weight(),
            utilization: UtilizationConfig::default(),
            bias_kappa: default_bias_kappa(),
        }
    }
}

/// Reference values and weights for one protocol's score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoScoringConfig {
    pub ref_bandwidth_up_bps: f64,
    pub ref_bandwidth_down_bps: f64,
    pub ref_rtt_ms: f64,
    pub ref_jitter_ms: f64,
    /// Reference retransmit rate (TCP) or loss rate (UDP).
    pub ref_loss: f64,
    pub weight_bandwidth_up: f64,
    pub weight_bandwidth_down: f64,
    pub weight_rtt: f64,
    pub weight_jitter: f64,
    pub weight_loss: f64,
}

impl ProtoScoringConfig {
    pub fn default_tcp() -> Self {
        Self {
            ref_bandwidth_up_bps: 50_000_000.0,
            ref_bandwidth_down_bps: 200_000_000.0,
            ref_rtt_ms: 50.0,
            ref_jitter_ms: 10.0,
            ref_loss: 0.01,
            weight_bandwidth_up: 0.25,
            weight_bandwidth_down: 0.25,
            weight_rtt: 0.3,
            weight_jitter: 0.1,
            weight_loss: 0.1,
        }
    }

    pub fn default_udp() -> Self {
        Self {
            ref_bandwidth_up_bps: 20_000_000.0,
            ref_bandwidth_down_bps: 50_000_000.0,
            ..Self::default_tcp()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Multiplier floor in (0, 1].
    #[serde(default = "default_util_min")]
    pub min_multiplier: f64,
    /// Utilization at which the penalty bites.
    #[serde(default = "default_util_threshold")]
    pub threshold: f64,
    #[serde(default = "default_util_exponent")]
    pub exponent: f64,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            min_multiplier: default_util_min(),
            threshold: default_util_threshold(),
            exponent: default_util_exponent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchingConfig {
    /// "auto" or "manual".
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Pinned tag in manual mode.
    #[serde(default)]
    pub manual_tag: Option<String>,
    /// Minimum score advantage before a switch is considered.
    #[serde(default = "default_score_delta")]
    pub score_delta_threshold: f64,
    /// How long the advantage must be sustained.
    #[serde(default = "default_confirm")]
    pub confirm_duration_secs: u64,
    /// Minimum time between switches.
    #[serde(default = "default_min_hold")]
    pub min_hold_secs: u64,
    /// Retransmit/loss rate on the active upstream that triggers fast
    /// failover.
    #[serde(default = "default_failover_loss")]
    pub failover_loss_threshold: f64,
    /// Consecutive dial failures that trigger fast failover.
    #[serde(default = "default_dial_trip")]
    pub dial_failure_trip: u32,
    #[serde(default = "default_dial_cooldown")]
    pub dial_cooldown_secs: u64,
    /// Startup window with halved delta and zeroed timers.
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,
    /// Authorize closing the failing upstream's flows on fast failover.
    #[serde(default)]
    pub close_flows_on_failover: bool,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            manual_tag: None,
            score_delta_threshold: default_score_delta(),
            confirm_duration_secs: default_confirm(),
            min_hold_secs: default_min_hold(),
            failover_loss_threshold: default_failover_loss(),
            dial_failure_trip: default_dial_trip(),
            dial_cooldown_secs: default_dial_cooldown(),
            warmup_secs: default_warmup(),
            close_flows_on_failover: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    /// Spacing between probes of different queue entries.
    #[serde(default = "default_gap")]
    pub inter_upstream_gap_secs: u64,
    /// Push-back applied when a due entry fails its gates or its run.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Window for the recent-rate side of the headroom gate.
    #[serde(default = "default_headroom_window")]
    pub headroom_window_secs: u64,
    #[serde(default = "default_required_free")]
    pub required_free_bandwidth_bps: f64,
    #[serde(default = "default_max_link_util")]
    pub max_link_utilization: f64,
    /// Window for the utilization fed into scoring.
    #[serde(default = "default_util_window")]
    pub utilization_window_secs: u64,
    /// Consecutive probe failures before the upstream is flagged as
    /// running on ICMP only.
    #[serde(default = "default_failure_trip")]
    pub failure_trip: u32,
    /// Log-output flag only; scoring behavior is unchanged.
    #[serde(default)]
    pub fallback_to_icmp_on_stale: bool,
    /// Hard cap on one (upstream, protocol) measurement cycle.
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
    #[serde(default = "ProtoProbeConfig::default_tcp")]
    pub tcp: ProtoProbeConfig,
    #[serde(default = "ProtoProbeConfig::default_udp")]
    pub udp: ProtoProbeConfig,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            inter_upstream_gap_secs: default_gap(),
            retry_delay_secs: default_retry_delay(),
            headroom_window_secs: default_headroom_window(),
            required_free_bandwidth_bps: default_required_free(),
            max_link_utilization: default_max_link_util(),
            utilization_window_secs: default_util_window(),
            failure_trip: default_failure_trip(),
            fallback_to_icmp_on_stale: false,
            cycle_timeout_secs: default_cycle_timeout(),
            tcp: ProtoProbeConfig::default_tcp(),
            udp: ProtoProbeConfig::default_udp(),
        }
    }
}

/// Probe shape for one protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoProbeConfig {
    pub target_up_bps: u64,
    pub target_down_bps: u64,
    pub sample_bytes: u64,
    pub samples: u32,
    pub chunk_bytes: usize,
    pub sample_timeout_secs: u64,
}

impl ProtoProbeConfig {
    pub fn default_tcp() -> Self {
        Self {
            target_up_bps: 50_000_000,
            target_down_bps: 200_000_000,
            sample_bytes: 5_000_000,
            samples: 3,
            chunk_bytes: 16 * 1024,
            sample_timeout_secs: 15,
        }
    }

    pub fn default_udp() -> Self {
        Self {
            target_up_bps: 20_000_000,
            target_down_bps: 50_000_000,
            sample_bytes: 2_000_000,
            samples: 3,
            chunk_bytes: 1200,
            sample_timeout_secs: 15,
        }
    }

    /// Bandwidth the headroom gate must reserve for this protocol.
    pub fn max_target_bps(&self) -> f64 {
        self.target_up_bps.max(self.target_down_bps) as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
    #[serde(default = "default_tcp_idle")]
    pub tcp_idle_secs: u64,
    #[serde(default = "default_udp_idle")]
    pub udp_idle_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            tcp_idle_secs: default_tcp_idle(),
            udp_idle_secs: default_udp_idle(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcmpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_icmp_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_icmp_window")]
    pub window_secs: u64,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_icmp_interval(),
            window_secs: default_icmp_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// EnvFilter directive; takes precedence over `level`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

fn default_listener_proto() -> String {
    "both".to_string()
}
fn default_measure_port() -> u16 {
    9876
}
fn default_alpha() -> f64 {
    0.3
}
fn default_stale_threshold() -> u64 {
    60
}
fn default_blend_weight() -> f64 {
    0.5
}
fn default_bias_kappa() -> f64 {
    0.4
}
fn default_true() -> bool {
    true
}
fn default_util_min() -> f64 {
    0.5
}
fn default_util_threshold() -> f64 {
    0.7
}
fn default_util_exponent() -> f64 {
    2.0
}
fn default_mode() -> String {
    "auto".to_string()
}
fn default_score_delta() -> f64 {
    5.0
}
fn default_confirm() -> u64 {
    15
}
fn default_min_hold() -> u64 {
    30
}
fn default_failover_loss() -> f64 {
    0.2
}
fn default_dial_trip() -> u32 {
    2
}
fn default_dial_cooldown() -> u64 {
    30
}
fn default_warmup() -> u64 {
    60
}
fn default_min_interval() -> u64 {
    30
}
fn default_max_interval() -> u64 {
    60
}
fn default_gap() -> u64 {
    5
}
fn default_retry_delay() -> u64 {
    30
}
fn default_headroom_window() -> u64 {
    5
}
fn default_required_free() -> f64 {
    10_000_000.0
}
fn default_max_link_util() -> f64 {
    0.8
}
fn default_util_window() -> u64 {
    10
}
fn default_failure_trip() -> u32 {
    3
}
fn default_cycle_timeout() -> u64 {
    60
}
fn default_max_flows() -> usize {
    4096
}
fn default_tcp_idle() -> u64 {
    300
}
fn default_udp_idle() -> u64 {
    60
}
fn default_dial_timeout() -> u64 {
    3
}
fn default_icmp_interval() -> u64 {
    1
}
fn default_icmp_window() -> u64 {
    10
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl UpstreamConfig {
    /// Host the probe endpoint lives on.
    pub fn measure_host(&self) -> String {
        match &self.measure_host {
            Some(host) => host.clone(),
            None => self
                .host
                .rsplit_once(':')
                .map(|(h, _)| h.trim_matches(['[', ']']).to_string())
                .unwrap_or_else(|| self.host.clone()),
        }
    }
}

impl Config {
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("pathmux").required(false))
            .add_source(config::Environment::with_prefix("PATHMUX").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config file: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.forwarder.dial_timeout_secs)
    }

    /// Enforce the construction invariants. The process refuses to start
    /// when any fails.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if !(s.alpha > 0.0 && s.alpha <= 1.0) {
            return Err(ForwarderError::Config(format!(
                "scoring.alpha {} outside (0, 1]",
                s.alpha
            )));
        }
        for (name, proto) in [("tcp", &s.tcp), ("udp", &s.udp)] {
            for (field, value) in [
                ("ref_bandwidth_up_bps", proto.ref_bandwidth_up_bps),
                ("ref_bandwidth_down_bps", proto.ref_bandwidth_down_bps),
                ("ref_rtt_ms", proto.ref_rtt_ms),
                ("ref_jitter_ms", proto.ref_jitter_ms),
                ("ref_loss", proto.ref_loss),
            ] {
                if value <= 0.0 {
                    return Err(ForwarderError::Config(format!(
                        "scoring.{}.{} must be positive",
                        name, field
                    )));
                }
            }
            let weights = [
                proto.weight_bandwidth_up,
                proto.weight_bandwidth_down,
                proto.weight_rtt,
                proto.weight_jitter,
                proto.weight_loss,
            ];
            if weights.iter().any(|w| *w < 0.0) {
                return Err(ForwarderError::Config(format!(
                    "scoring.{} weights must be non-negative",
                    name
                )));
            }
            if weights.iter().sum::<f64>() <= 0.0 {
                return Err(ForwarderError::Config(format!(
                    "scoring.{} weights must not all be zero",
                    name
                )));
            }
        }
        if s.blend_tcp_weight < 0.0
            || s.blend_udp_weight < 0.0
            || s.blend_tcp_weight + s.blend_udp_weight <= 0.0
        {
            return Err(ForwarderError::Config(
                "scoring blend weights must be non-negative and not all zero".into(),
            ));
        }
        if s.bias_kappa <= 0.0 {
            return Err(ForwarderError::Config("scoring.bias_kappa must be positive".into()));
        }
        let u = &s.utilization;
        if !(u.min_multiplier > 0.0 && u.min_multiplier <= 1.0) {
            return Err(ForwarderError::Config(
                "scoring.utilization.min_multiplier outside (0, 1]".into(),
            ));
        }
        if u.threshold <= 0.0 || u.exponent <= 0.0 {
            return Err(ForwarderError::Config(
                "scoring.utilization threshold and exponent must be positive".into(),
            ));
        }

        if self.upstreams.is_empty() {
            return Err(ForwarderError::Config("no upstreams configured".into()));
        }
        let mut tags = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.tag.is_empty() {
                return Err(ForwarderError::Config("upstream with empty tag".into()));
            }
            if !tags.insert(upstream.tag.clone()) {
                return Err(ForwarderError::Config(format!(
                    "duplicate upstream tag {}",
                    upstream.tag
                )));
            }
            if !(-1.0..=1.0).contains(&upstream.bias) {
                return Err(ForwarderError::Config(format!(
                    "upstream {} bias {} outside [-1, 1]",
                    upstream.tag, upstream.bias
                )));
            }
        }

        if self.switching.mode == "manual" {
            match &self.switching.manual_tag {
                Some(tag) if tags.contains(tag) => {}
                Some(tag) => {
                    return Err(ForwarderError::Config(format!(
                        "manual_tag {} is not a configured upstream",
                        tag
                    )))
                }
                None => {
                    return Err(ForwarderError::Config(
                        "manual mode requires switching.manual_tag".into(),
                    ))
                }
            }
        } else if self.switching.mode != "auto" {
            return Err(ForwarderError::Config(format!(
                "switching.mode {} is neither auto nor manual",
                self.switching.mode
            )));
        }

        let m = &self.measurement;
        if m.min_interval_secs == 0 || m.max_interval_secs < m.min_interval_secs {
            return Err(ForwarderError::Config(
                "measurement intervals must satisfy 0 < min <= max".into(),
            ));
        }
        if !(m.max_link_utilization > 0.0 && m.max_link_utilization <= 1.0) {
            return Err(ForwarderError::Config(
                "measurement.max_link_utilization outside (0, 1]".into(),
            ));
        }

        for listener in &self.listeners {
            listener.listen.parse::<std::net::SocketAddr>().map_err(|e| {
                ForwarderError::Config(format!("listener {}: {}", listener.listen, e))
            })?;
            if !matches!(listener.proto.as_str(), "tcp" | "udp" | "both") {
                return Err(ForwarderError::Config(format!(
                    "listener {} proto {} is not tcp, udp or both",
                    listener.listen, listener.proto
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listeners: vec![ListenerConfig {
                listen: "0.0.0.0:8000".to_string(),
                proto: "both".to_string(),
                dst_port: None,
            }],
            upstreams: vec![
                UpstreamConfig {
                    tag: "wan0".to_string(),
                    host: "10.0.0.1:8000".to_string(),
                    measure_host: None,
                    measure_port: 9876,
                    priority: 0,
                    bias: 0.0,
                },
                UpstreamConfig {
                    tag: "wan1".to_string(),
                    host: "10.0.1.1:8000".to_string(),
                    measure_host: Some("10.0.1.2".to_string()),
                    measure_port: 9876,
                    priority: 1,
                    bias: -0.2,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_alpha_bounds() {
        let mut config = valid_config();
        config.scoring.alpha = 0.0;
        assert!(config.validate().is_err());
        config.scoring.alpha = 1.0;
        assert!(config.validate().is_ok());
        config.scoring.alpha = 1.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let mut config = valid_config();
        config.upstreams[1].tag = "wan0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bias_range() {
        let mut config = valid_config();
        config.upstreams[0].bias = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = valid_config();
        config.scoring.tcp.weight_rtt = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manual_mode_needs_known_tag() {
        let mut config = valid_config();
        config.switching.mode = "manual".to_string();
        assert!(config.validate().is_err());
        config.switching.manual_tag = Some("nope".to_string());
        assert!(config.validate().is_err());
        config.switching.manual_tag = Some("wan1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_ordering() {
        let mut config = valid_config();
        config.measurement.min_interval_secs = 90;
        config.measurement.max_interval_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_measure_host_defaults_to_host_part() {
        let config = valid_config();
        assert_eq!(config.upstreams[0].measure_host(), "10.0.0.1");
        assert_eq!(config.upstreams[1].measure_host(), "10.0.1.2");
    }
}
