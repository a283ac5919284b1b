//! # bwprobe
//!
//! A bandwidth, RTT and loss measurement engine, both sides:
//!
//! - [`ProbeServer`] answers a framed JSON-RPC control channel on a single
//!   TCP port, accounts forward samples into 100 ms intervals, and runs
//!   paced reverse senders over TCP or UDP.
//! - [`ProbeEngine`] drives a full measurement against a server: session
//!   handshake, heartbeats, paced sample transfers, an RTT sampler over
//!   the control channel, and aggregation of the per-interval reports
//!   into a [`Results`] summary.
//!
//! The crate is embeddable: it never installs a tracing subscriber and
//! all sockets are owned by the caller-created server/engine values.

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod pacing;
pub mod report;
pub mod rpc;
pub mod server;
pub mod session;

pub use client::{ProbeConfig, ProbeEngine};
pub use config::ProbeServerConfig;
pub use error::{ProbeError, Result};
pub use report::{Results, RttStats};
pub use server::ProbeServer;

/// Wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
