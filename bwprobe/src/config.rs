//! Configuration for the probe server.

use serde::{Deserialize, Serialize};

/// Configuration for the probe server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeServerConfig {
    /// Whether the probe server is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Host/IP address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Control and data port (default: 9876)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions with no heartbeat for this long are swept
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Heartbeat interval announced to clients
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Maximum bandwidth per reverse sample in bits/second (0 = unlimited)
    #[serde(default = "default_max_bandwidth")]
    pub max_bandwidth_bps: u64,

    /// Maximum bytes per sample (0 = unlimited)
    #[serde(default = "default_max_sample_bytes")]
    pub max_sample_bytes: u64,

    /// Delay before answering `sample.stop` on forward samples, to let
    /// in-flight bytes drain
    #[serde(default = "default_recv_wait_ms")]
    pub recv_wait_ms: u64,

    /// Effective UDP payload ceiling per datagram
    #[serde(default = "default_udp_mtu")]
    pub udp_mtu: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9876
}

fn default_max_sessions() -> usize {
    16
}

fn default_session_timeout() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_max_bandwidth() -> u64 {
    1_000_000_000 // 1 Gbit/s
}

fn default_max_sample_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_recv_wait_ms() -> u64 {
    200
}

fn default_udp_mtu() -> usize {
    1472 // 1500 - IP - UDP headers
}

impl Default for ProbeServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_bandwidth_bps: default_max_bandwidth(),
            max_sample_bytes: default_max_sample_bytes(),
            recv_wait_ms: default_recv_wait_ms(),
            udp_mtu: default_udp_mtu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProbeServerConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.port, 9876);
        assert_eq!(config.session_timeout_secs, 60);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.recv_wait_ms, 200);
    }

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let config: ProbeServerConfig =
            serde_json::from_str(r#"{"enabled": true, "port": 19876}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.port, 19876);
        assert_eq!(config.max_sessions, 16);
        assert_eq!(config.udp_mtu, 1472);
    }
}
