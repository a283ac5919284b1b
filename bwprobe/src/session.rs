//! Server-side probe session state.
//!
//! A session owns at most one active sample. All accounting runs under
//! the session's sample mutex; data-plane receivers call the sync
//! `record_*` methods from their read loops.

use crate::error::Result;
use crate::pacing::TcpSockInfo;
use crate::rpc::RpcFailure;
use common::{
    ErrorCode, Proto, SampleInterval, SampleStopResult, UdpRecvStats, INTERVAL_MS,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};

/// Effective limits negotiated at `session.hello`.
#[derive(Debug, Clone, Copy)]
pub struct SessionCaps {
    pub max_bandwidth_bps: u64,
    pub max_sample_bytes: u64,
}

/// Accumulated per-interval counters.
#[derive(Debug, Clone, Copy, Default)]
struct IntervalAcc {
    bytes: u64,
    ooo_packets: u64,
}

/// Byte and sequence accounting for one sample.
#[derive(Debug, Default)]
struct SampleAccounting {
    started: Option<Instant>,
    first_byte_ms: u64,
    last_byte: Option<Instant>,
    last_byte_ms: u64,
    total_bytes: u64,
    intervals: Vec<IntervalAcc>,
    base_seq: Option<u64>,
    max_seq: u64,
    packets_received: u64,
}

impl SampleAccounting {
    /// Interval bucket for an arrival time, growing the list as needed.
    fn bucket(&mut self, now: Instant) -> usize {
        let started = *self.started.get_or_insert(now);
        let idx = (now.duration_since(started).as_millis() / INTERVAL_MS as u128) as usize;
        if self.intervals.len() <= idx {
            self.intervals.resize(idx + 1, IntervalAcc::default());
        }
        idx
    }

    fn record_bytes(&mut self, len: usize, now: Instant, wall_ms: u64) {
        let idx = self.bucket(now);
        if self.first_byte_ms == 0 {
            self.first_byte_ms = wall_ms;
        }
        self.intervals[idx].bytes += len as u64;
        self.total_bytes += len as u64;
        self.last_byte = Some(now);
        self.last_byte_ms = wall_ms;
    }

    fn record_seq(&mut self, seq: u64, now: Instant) {
        self.packets_received += 1;
        match self.base_seq {
            None => {
                self.base_seq = Some(seq);
                self.max_seq = seq;
            }
            Some(base) => {
                if seq > self.max_seq {
                    self.max_seq = seq;
                } else if seq < self.max_seq && seq >= base {
                    let idx = self.bucket(now);
                    self.intervals[idx].ooo_packets += 1;
                }
            }
        }
    }

    fn udp_loss(&self) -> (u64, u64) {
        match self.base_seq {
            Some(base) => {
                let expected = self.max_seq - base + 1;
                (
                    self.packets_received,
                    expected.saturating_sub(self.packets_received),
                )
            }
            None => (0, 0),
        }
    }
}

/// Handles returned by the reverse sender when it finishes: the TCP data
/// connection goes back to the session for the next sample.
#[derive(Debug)]
pub struct ReverseDone {
    pub stream: Option<TcpStream>,
    pub datagrams_sent: u64,
}

/// The sample a session is currently running.
struct ActiveSample {
    sample_id: u32,
    network: Proto,
    reverse: bool,
    acct: SampleAccounting,
    /// Kernel counters at sample start, for delta reporting (reverse TCP).
    tcp_baseline: Option<TcpSockInfo>,
    stop_tx: Option<watch::Sender<bool>>,
    done_rx: Option<oneshot::Receiver<ReverseDone>>,
}

/// One probe session, indexed by its server-generated id.
pub struct ProbeSession {
    pub id: String,
    pub caps: SessionCaps,
    created: Instant,
    last_heartbeat: Mutex<Instant>,
    sample: Mutex<Option<ActiveSample>>,
    /// A reverse data connection parked between samples.
    pub reverse_conn: tokio::sync::Mutex<Option<TcpStream>>,
    udp_endpoint: Mutex<Option<SocketAddr>>,
}

impl ProbeSession {
    pub fn new(id: String, caps: SessionCaps) -> Self {
        let now = Instant::now();
        Self {
            id,
            caps,
            created: now,
            last_heartbeat: Mutex::new(now),
            sample: Mutex::new(None),
            reverse_conn: tokio::sync::Mutex::new(None),
            udp_endpoint: Mutex::new(None),
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Refresh liveness; called by heartbeats and any session-scoped RPC.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_heartbeat.lock().elapsed() > timeout
    }

    pub fn set_udp_endpoint(&self, addr: SocketAddr) {
        *self.udp_endpoint.lock() = Some(addr);
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        *self.udp_endpoint.lock()
    }

    pub fn has_active_sample(&self) -> bool {
        self.sample.lock().is_some()
    }

    /// Claim the sample slot. A second claim before `finalize` fails with
    /// `SAMPLE_ALREADY_ACTIVE`.
    pub fn begin_sample(
        &self,
        sample_id: u32,
        network: Proto,
        reverse: bool,
    ) -> std::result::Result<(), RpcFailure> {
        let mut slot = self.sample.lock();
        if slot.is_some() {
            return Err(RpcFailure::new(ErrorCode::SampleAlreadyActive));
        }
        *slot = Some(ActiveSample {
            sample_id,
            network,
            reverse,
            acct: SampleAccounting::default(),
            tcp_baseline: None,
            stop_tx: None,
            done_rx: None,
        });
        Ok(())
    }

    /// Roll back a claim whose transport setup failed.
    pub fn abort_sample(&self, sample_id: u32) {
        let mut slot = self.sample.lock();
        if slot.as_ref().map(|s| s.sample_id) == Some(sample_id) {
            *slot = None;
        }
    }

    /// Attach the reverse sender's stop/done handles and the kernel
    /// counter baseline.
    pub fn attach_reverse(
        &self,
        sample_id: u32,
        stop_tx: watch::Sender<bool>,
        done_rx: oneshot::Receiver<ReverseDone>,
        tcp_baseline: Option<TcpSockInfo>,
    ) {
        let mut slot = self.sample.lock();
        if let Some(sample) = slot.as_mut() {
            if sample.sample_id == sample_id {
                sample.stop_tx = Some(stop_tx);
                sample.done_rx = Some(done_rx);
                sample.tcp_baseline = tcp_baseline;
            }
        }
    }

    /// Account payload bytes against the active sample. Frames for other
    /// sample ids are drained but not counted.
    pub fn record_bytes(&self, sample_id: u32, len: usize, now: Instant, wall_ms: u64) -> bool {
        let mut slot = self.sample.lock();
        match slot.as_mut() {
            Some(sample) if sample.sample_id == sample_id => {
                sample.acct.record_bytes(len, now, wall_ms);
                true
            }
            _ => false,
        }
    }

    /// Account one UDP data datagram: payload bytes plus sequence
    /// bookkeeping for loss and reordering.
    pub fn record_udp_data(
        &self,
        sample_id: u32,
        seq: u64,
        payload_len: usize,
        now: Instant,
        wall_ms: u64,
    ) -> bool {
        let mut slot = self.sample.lock();
        match slot.as_mut() {
            Some(sample) if sample.sample_id == sample_id => {
                sample.acct.record_seq(seq, now);
                sample.acct.record_bytes(payload_len, now, wall_ms);
                true
            }
            _ => false,
        }
    }

    /// Validate a `sample.stop` and take the reverse handles so the
    /// caller can run the stop/done handshake outside the lock.
    #[allow(clippy::type_complexity)]
    pub fn take_stop_handles(
        &self,
        sample_id: u32,
    ) -> std::result::Result<
        (
            bool,
            Option<watch::Sender<bool>>,
            Option<oneshot::Receiver<ReverseDone>>,
        ),
        RpcFailure,
    > {
        let mut slot = self.sample.lock();
        match slot.as_mut() {
            None => Err(RpcFailure::new(ErrorCode::SampleNotFound)),
            Some(sample) if sample.sample_id != sample_id => Err(RpcFailure::with(
                ErrorCode::SampleIdMismatch,
                format!("active sample is {}", sample.sample_id),
            )),
            Some(sample) => Ok((
                sample.reverse,
                sample.stop_tx.take(),
                sample.done_rx.take(),
            )),
        }
    }

    /// Finish the sample and build its report. `udp_recv` carries the
    /// client-observed receive stats for reverse UDP samples; `tcp_now`
    /// the kernel counters at stop time for reverse TCP.
    pub fn finalize_sample(
        &self,
        sample_id: u32,
        udp_recv: Option<UdpRecvStats>,
        tcp_now: Option<TcpSockInfo>,
    ) -> std::result::Result<SampleStopResult, RpcFailure> {
        let mut slot = self.sample.lock();
        match slot.as_ref() {
            None => return Err(RpcFailure::new(ErrorCode::SampleNotFound)),
            Some(s) if s.sample_id != sample_id => {
                return Err(RpcFailure::with(
                    ErrorCode::SampleIdMismatch,
                    format!("active sample is {}", s.sample_id),
                ))
            }
            Some(_) => {}
        }
        let Some(sample) = slot.take() else {
            return Err(RpcFailure::new(ErrorCode::SampleNotFound));
        };
        drop(slot);

        let acct = &sample.acct;
        let duration = match (acct.started, acct.last_byte) {
            (Some(start), Some(last)) => last.duration_since(start),
            _ => Duration::ZERO,
        };
        let avg_bps = if duration > Duration::ZERO {
            acct.total_bytes as f64 * 8.0 / duration.as_secs_f64()
        } else {
            0.0
        };

        // The final interval only spans the remainder past the last full
        // boundary.
        let full_intervals = acct.intervals.len().saturating_sub(1) as u64;
        let last_interval_ms = if acct.intervals.is_empty() {
            0
        } else {
            (duration.as_millis() as u64)
                .saturating_sub(full_intervals * INTERVAL_MS)
                .clamp(1, INTERVAL_MS)
        };

        let (packets_received, packets_lost) = match (sample.network, sample.reverse) {
            (Proto::Udp, false) => {
                let (received, lost) = acct.udp_loss();
                (Some(received), Some(lost))
            }
            (Proto::Udp, true) => match udp_recv {
                Some(stats) => {
                    let expected = stats.max_seq.saturating_sub(stats.base_seq) + 1;
                    (
                        Some(stats.packets_received),
                        Some(expected.saturating_sub(stats.packets_received)),
                    )
                }
                None => (Some(0), Some(0)),
            },
            _ => (None, None),
        };

        let (tcp_retransmits, tcp_segments_sent, tcp_send_buffer_bytes) =
            match (sample.tcp_baseline, tcp_now) {
                (Some(base), Some(now)) => (
                    Some(now.retransmits.saturating_sub(base.retransmits)),
                    Some(now.segments_sent.saturating_sub(base.segments_sent)),
                    Some(now.send_buffer_bytes),
                ),
                (None, Some(now)) => (
                    Some(now.retransmits),
                    Some(now.segments_sent),
                    Some(now.send_buffer_bytes),
                ),
                _ => (None, None, None),
            };

        Ok(SampleStopResult {
            sample_id,
            total_bytes: acct.total_bytes,
            first_byte_ms: acct.first_byte_ms,
            last_byte_ms: acct.last_byte_ms,
            avg_bps,
            intervals: acct
                .intervals
                .iter()
                .map(|i| SampleInterval {
                    bytes: i.bytes,
                    ooo_packets: i.ooo_packets,
                })
                .collect(),
            last_interval_ms,
            packets_received,
            packets_lost,
            tcp_send_buffer_bytes,
            tcp_retransmits,
            tcp_segments_sent,
        })
    }

    /// Tear the session down: stop any running reverse sender.
    pub fn close(&self) -> Result<()> {
        let mut slot = self.sample.lock();
        if let Some(sample) = slot.take() {
            if let Some(stop) = sample.stop_tx {
                let _ = stop.send(true);
            }
        }
        Ok(())
    }
}
