//! Error types for the forwarder core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwarderError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration; refused at startup
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No upstream can accept a new flow right now
    #[error("No usable upstream: {0}")]
    NoUsableUpstream(String),

    /// Unknown upstream tag
    #[error("Unknown upstream: {0}")]
    UnknownUpstream(String),

    /// The flow table is at capacity
    #[error("Flow limit of {0} reached")]
    FlowLimit(usize),

    /// Probe run failure
    #[error("Probe error: {0}")]
    Probe(#[from] bwprobe::ProbeError),
}

/// Result type for forwarder operations
pub type Result<T> = std::result::Result<T, ForwarderError>;
