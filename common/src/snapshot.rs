//! Shared state snapshots and observer events.
//!
//! These types cross the boundary between the forwarder core and its
//! observers (status API, logs). They carry no behavior.

use serde::{Deserialize, Serialize};

/// Transport protocol of a flow or measurement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Some(Proto::Tcp),
            "udp" => Some(Proto::Udp),
            _ => None,
        }
    }
}

/// Direction of traffic relative to this host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Point-in-time view of one upstream's state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamSnapshot {
    pub tag: String,
    pub host: String,
    pub priority: u32,
    pub bias: f64,
    /// Whether this upstream is the current choice for new flows.
    pub active: bool,

    pub reachable: bool,
    pub usable: bool,
    /// Unix milliseconds of the last positive reachability result.
    pub last_reachable_ms: Option<u64>,

    // Smoothed overall bandwidth, bits/second.
    pub up_bps: f64,
    pub down_bps: f64,
    // Raw per-protocol bandwidth from the last measurement, bits/second.
    pub tcp_up_bps: f64,
    pub tcp_down_bps: f64,
    pub udp_up_bps: f64,
    pub udp_down_bps: f64,

    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub retrans_rate: f64,
    pub loss_rate: f64,
    /// `max(retrans_rate, loss_rate)`.
    pub loss: f64,

    pub last_tcp_update_ms: Option<u64>,
    pub last_udp_update_ms: Option<u64>,

    pub score_tcp: f64,
    pub score_udp: f64,
    pub score_overall: f64,

    pub utilization: f64,
    pub consecutive_dial_failures: u32,
    /// Unix milliseconds until which the upstream is in dial cooldown.
    pub cooldown_until_ms: Option<u64>,
}

/// Full forwarder status for the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// "auto" or "manual".
    pub mode: String,
    pub active_tag: Option<String>,
    pub warmup: bool,
    pub skipped_measurements: u64,
    pub tcp_flows: usize,
    pub udp_flows: usize,
    pub upstreams: Vec<UpstreamSnapshot>,
}

/// One live flow, for the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub proto: Proto,
    pub client: String,
    pub dst: String,
    pub upstream_tag: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// `POST /api/mode` body: `{"mode":"auto"}` or `{"mode":"manual","tag":"a"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Observer events published by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TestComplete {
        tag: String,
        proto: Proto,
        direction: Direction,
        started_at_ms: u64,
        duration_ms: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        bandwidth_bps: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rtt_ms: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        loss: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UpstreamStateChange {
        tag: String,
        usable: bool,
    },
    UpstreamSwitch {
        old_tag: Option<String>,
        new_tag: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_parsing() {
        assert_eq!(Proto::from_str_loose("TCP"), Some(Proto::Tcp));
        assert_eq!(Proto::from_str_loose("udp"), Some(Proto::Udp));
        assert_eq!(Proto::from_str_loose("sctp"), None);
    }

    #[test]
    fn test_event_serialization() {
        let ev = Event::UpstreamSwitch {
            old_tag: Some("a".to_string()),
            new_tag: "b".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"upstream_switch\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        match parsed {
            Event::UpstreamSwitch { old_tag, new_tag } => {
                assert_eq!(old_tag.as_deref(), Some("a"));
                assert_eq!(new_tag, "b");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut snap = UpstreamSnapshot::default();
        snap.tag = "wan0".to_string();
        snap.score_overall = 87.5;

        let json = serde_json::to_string(&snap).unwrap();
        let parsed: UpstreamSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tag, "wan0");
        assert_eq!(parsed.score_overall, 87.5);
    }
}
