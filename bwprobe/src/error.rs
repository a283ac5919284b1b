//! Error types for the probe engine and server.

use common::{ErrorCode, RpcError};
use thiserror::Error;

/// Errors surfaced by the probe client and server.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing or sequencing violation; the connection is not recoverable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A JSON-RPC error answered by the remote side
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// A call or transfer exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller requested cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ProbeError {
    /// Build from a wire-level JSON-RPC error.
    pub fn from_rpc(err: RpcError) -> Self {
        ProbeError::Rpc {
            code: err.code,
            message: err.message,
        }
    }

    /// The typed error code, when this is a wire error with a known code.
    pub fn rpc_code(&self) -> Option<ErrorCode> {
        match self {
            ProbeError::Rpc { code, .. } => ErrorCode::from_code(*code),
            _ => None,
        }
    }

    /// True for session-invariant violations the caller should treat by
    /// tearing the session down rather than retrying the call.
    pub fn is_session_violation(&self) -> bool {
        matches!(
            self.rpc_code(),
            Some(
                ErrorCode::InvalidSession
                    | ErrorCode::SampleAlreadyActive
                    | ErrorCode::SampleNotFound
                    | ErrorCode::SampleIdMismatch
            )
        )
    }
}

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;
