//! Bandwidth-probe wire protocol definitions.
//!
//! The probe protocol uses a single TCP port for everything. A fresh
//! connection announces its role with a 4-byte preamble: `"RPC\0"` selects
//! the JSON-RPC control channel, `"DAT\0"` a forward data channel and
//! `"REV\0"` a reverse data channel. After the preamble, control and
//! binding messages are JSON objects with a 4-byte big-endian length
//! prefix.

use serde::{Deserialize, Serialize};

/// Preamble selecting JSON-RPC framing on a fresh connection.
pub const RPC_PREAMBLE: [u8; 4] = *b"RPC\0";

/// Preamble for a forward data channel (client sends samples to server).
pub const DATA_PREAMBLE: [u8; 4] = *b"DAT\0";

/// Preamble for a reverse data channel (server sends samples to client).
pub const REVERSE_PREAMBLE: [u8; 4] = *b"REV\0";

/// Upper bound on a single length-prefixed message. Violations abort the
/// connection rather than being answered as JSON-RPC errors.
pub const MAX_MESSAGE_BYTES: u32 = 10 * 1024 * 1024;

/// TCP data frame header size: `sample_id: u32` + `payload_len: u32`.
pub const TCP_FRAME_HEADER_BYTES: usize = 8;

/// UDP datagram header size: `type: u8` + `sample_id: u32` + `seq: u64`.
pub const UDP_HEADER_BYTES: usize = 13;

/// Width of a server-side accounting interval in milliseconds.
pub const INTERVAL_MS: u64 = 100;

// ============ Method names ============

pub const METHOD_SESSION_HELLO: &str = "session.hello";
pub const METHOD_SESSION_HEARTBEAT: &str = "session.heartbeat";
pub const METHOD_SESSION_CLOSE: &str = "session.close";
pub const METHOD_SAMPLE_START: &str = "sample.start";
pub const METHOD_SAMPLE_START_REVERSE: &str = "sample.start_reverse";
pub const METHOD_SAMPLE_STOP: &str = "sample.stop";
pub const METHOD_PING: &str = "ping";
pub const METHOD_UDP_REGISTER: &str = "udp.register";
pub const METHOD_SERVER_INFO: &str = "server.info";

// ============ JSON-RPC envelope ============

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub id: u64,
}

impl RpcRequest {
    pub fn new(method: &str, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 response: exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: u64,
}

impl RpcResponse {
    pub fn result(result: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: RpcError, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// The error member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Protocol error codes. The standard JSON-RPC block plus the probe
/// domain errors in the `-32001..` range. Values are stable within a
/// deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerError = -32000,
    InvalidSession = -32001,
    SampleAlreadyActive = -32002,
    SampleNotFound = -32003,
    SampleIdMismatch = -32004,
    InvalidNetwork = -32005,
    InvalidBandwidth = -32006,
    InvalidSampleSize = -32007,
    UdpNotRegistered = -32008,
    ReverseNotAvailable = -32009,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32000 => Some(ErrorCode::ServerError),
            -32001 => Some(ErrorCode::InvalidSession),
            -32002 => Some(ErrorCode::SampleAlreadyActive),
            -32003 => Some(ErrorCode::SampleNotFound),
            -32004 => Some(ErrorCode::SampleIdMismatch),
            -32005 => Some(ErrorCode::InvalidNetwork),
            -32006 => Some(ErrorCode::InvalidBandwidth),
            -32007 => Some(ErrorCode::InvalidSampleSize),
            -32008 => Some(ErrorCode::UdpNotRegistered),
            -32009 => Some(ErrorCode::ReverseNotAvailable),
            _ => None,
        }
    }

    /// Default human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerError => "Server error",
            ErrorCode::InvalidSession => "Invalid session",
            ErrorCode::SampleAlreadyActive => "Sample already active",
            ErrorCode::SampleNotFound => "Sample not found",
            ErrorCode::SampleIdMismatch => "Sample ID mismatch",
            ErrorCode::InvalidNetwork => "Invalid network",
            ErrorCode::InvalidBandwidth => "Invalid bandwidth",
            ErrorCode::InvalidSampleSize => "Invalid sample size",
            ErrorCode::UdpNotRegistered => "UDP endpoint not registered",
            ErrorCode::ReverseNotAvailable => "Reverse data connection not available",
        }
    }

    pub fn to_rpc_error(self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.message().to_string(),
            data: None,
        }
    }
}

// ============ Data-channel binding ============

/// Binding message sent after a `"DAT\0"`/`"REV\0"` preamble, associating
/// the new connection with an existing session. `sample_id` is optional:
/// per-frame sample ids identify traffic on a shared data connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBinding {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<u32>,
}

// ============ Method params / results ============

/// `session.hello` params. The client may announce its own limits; the
/// server stores the effective (min of both) capabilities on the session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HelloParams {
    #[serde(default)]
    pub client_version: String,
    /// Highest bandwidth the client is willing to receive, bits/second
    /// (0 = no preference).
    #[serde(default)]
    pub max_bandwidth_bps: u64,
    /// Largest sample the client is willing to receive, bytes
    /// (0 = no preference).
    #[serde(default)]
    pub max_sample_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub session_id: String,
    /// Effective bandwidth cap for this session, bits/second.
    pub max_bandwidth_bps: u64,
    /// Effective per-sample byte cap for this session.
    pub max_sample_bytes: u64,
    /// Interval at which the client must send `session.heartbeat`.
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

/// `sample.start` / `sample.start_reverse` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartParams {
    pub session_id: String,
    pub sample_id: u32,
    /// "tcp" or "udp".
    pub network: String,
    /// Payload bytes the sender intends to transfer.
    pub sample_bytes: u64,
    /// Target send rate, bits/second.
    pub bandwidth_bps: u64,
    /// Frame/datagram size including the data-plane header.
    pub chunk_bytes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStartResult {
    pub sample_id: u32,
}

/// Client-observed receive statistics for a reverse UDP sample, carried
/// in `sample.stop` so the server can report loss it cannot see itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpRecvStats {
    pub base_seq: u64,
    pub max_seq: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub ooo_packets: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStopParams {
    pub session_id: String,
    pub sample_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_recv: Option<UdpRecvStats>,
}

/// One accounting interval of a sample. Every interval spans
/// [`INTERVAL_MS`] except the last, whose true length is
/// `SampleStopResult::last_interval_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct SampleInterval {
    /// Payload bytes observed in this interval.
    pub bytes: u64,
    /// Out-of-order UDP datagrams observed in this interval.
    #[serde(default)]
    pub ooo_packets: u64,
}

/// Final report for a sample, returned from `sample.stop`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SampleStopResult {
    pub sample_id: u32,
    /// Total payload bytes accounted.
    pub total_bytes: u64,
    /// Wall-clock time of the first observed byte, unix milliseconds
    /// (0 when no data arrived).
    pub first_byte_ms: u64,
    /// Wall-clock time of the last observed byte, unix milliseconds.
    pub last_byte_ms: u64,
    /// Average throughput over first..last byte, bits/second.
    pub avg_bps: f64,
    /// Ordered interval list; see [`SampleInterval`].
    pub intervals: Vec<SampleInterval>,
    /// Duration of the final interval in milliseconds (the remainder of
    /// the sample past the last full interval boundary).
    pub last_interval_ms: u64,
    /// UDP only: datagrams received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_received: Option<u64>,
    /// UDP only: `max(0, max_seq - base_seq + 1 - received)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_lost: Option<u64>,
    /// TCP only: send buffer size in effect on the sending socket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_send_buffer_bytes: Option<u64>,
    /// TCP only: retransmitted segments during the sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_retransmits: Option<u64>,
    /// TCP only: segments sent during the sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_segments_sent: Option<u64>,
}

/// `ping` params; `session_id` is optional and only checked when given.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Sender wall clock, unix milliseconds. Echoed back.
    #[serde(default)]
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    /// Echo of the request timestamp.
    pub timestamp_ms: u64,
    /// Server wall clock, unix milliseconds.
    pub server_time_ms: u64,
}

/// `udp.register` params. The claimed address must match a source
/// address from which the server recently observed a UDP ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpRegisterParams {
    pub session_id: String,
    /// "ip:port" as observed by the server (echoed in UDP pongs).
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpRegisterResult {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfoResult {
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub max_bandwidth_bps: u64,
    pub max_sample_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::ServerError,
            ErrorCode::InvalidSession,
            ErrorCode::SampleAlreadyActive,
            ErrorCode::SampleNotFound,
            ErrorCode::SampleIdMismatch,
            ErrorCode::InvalidNetwork,
            ErrorCode::InvalidBandwidth,
            ErrorCode::InvalidSampleSize,
            ErrorCode::UdpNotRegistered,
            ErrorCode::ReverseNotAvailable,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
            assert!(!code.message().is_empty());
        }
        assert_eq!(ErrorCode::from_code(42), None);
    }

    #[test]
    fn test_request_serialization() {
        let req = RpcRequest::new(
            METHOD_SAMPLE_START,
            serde_json::to_value(SampleStartParams {
                session_id: "s-1".to_string(),
                sample_id: 7,
                network: "tcp".to_string(),
                sample_bytes: 5_000_000,
                bandwidth_bps: 50_000_000,
                chunk_bytes: 16384,
            })
            .unwrap(),
            3,
        );

        let json = serde_json::to_string(&req).unwrap();
        let parsed: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.jsonrpc, "2.0");
        assert_eq!(parsed.method, METHOD_SAMPLE_START);
        assert_eq!(parsed.id, 3);

        let params: SampleStartParams = serde_json::from_value(parsed.params).unwrap();
        assert_eq!(params.sample_id, 7);
        assert_eq!(params.network, "tcp");
    }

    #[test]
    fn test_response_error_exclusivity() {
        let ok = RpcResponse::result(serde_json::json!({"x": 1}), 1);
        let json = serde_json::to_string(&ok).unwrap();
        assert!(!json.contains("error"));

        let err = RpcResponse::error(ErrorCode::InvalidSession.to_rpc_error(), 2);
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("result"));
        let parsed: RpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.unwrap().code, -32001);
    }

    #[test]
    fn test_stop_result_optional_fields() {
        let mut report = SampleStopResult {
            sample_id: 1,
            total_bytes: 1000,
            intervals: vec![SampleInterval {
                bytes: 1000,
                ooo_packets: 0,
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("tcp_retransmits"));
        assert!(!json.contains("packets_lost"));

        report.packets_received = Some(10);
        report.packets_lost = Some(2);
        let json = serde_json::to_string(&report).unwrap();
        let parsed: SampleStopResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.packets_lost, Some(2));
    }
}
