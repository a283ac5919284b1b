//! Bandwidth pacing and socket sizing.
//!
//! Both senders pace with a leaky-bucket token scheduler. For TCP the
//! send buffer is sized near the bandwidth-delay product and, on Linux,
//! `SO_MAX_PACING_RATE` is set as well so the kernel smooths bursts
//! between wakeups.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Floor for the BDP-derived send buffer.
const MIN_SEND_BUFFER: usize = 64 * 1024;

/// Fallback when the sysctl ceiling cannot be read.
const DEFAULT_WMEM_MAX: usize = 4 * 1024 * 1024;

/// Leaky-bucket pacer. Tokens replenish at `bps/8` bytes per second;
/// each send withdraws its length and the sender sleeps while the
/// balance is negative.
pub struct TokenBucket {
    /// Bytes per second.
    rate: f64,
    tokens: f64,
    burst: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(bandwidth_bps: u64) -> Self {
        let rate = (bandwidth_bps as f64 / 8.0).max(1.0);
        // One bucket of ~20 ms worth of traffic keeps bursts short
        // without starving the timer resolution.
        let burst = (rate / 50.0).max(64.0 * 1024.0);
        Self {
            rate,
            tokens: burst,
            burst,
            last: Instant::now(),
        }
    }

    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }

    /// Withdraw `len` bytes and return how long the sender must pause to
    /// pay off a negative balance. Callers that need to observe a stop
    /// signal select over the returned wait themselves.
    pub fn debit(&mut self, len: usize) -> Duration {
        self.replenish(Instant::now());
        self.tokens -= len as f64;
        if self.tokens < 0.0 {
            Duration::from_secs_f64(-self.tokens / self.rate)
        } else {
            Duration::ZERO
        }
    }

    /// Withdraw `len` bytes, sleeping off any negative balance.
    pub async fn consume(&mut self, len: usize) {
        let wait = self.debit(len);
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Send-buffer size near the bandwidth-delay product:
/// `clamp(bps * rtt / 8, max(4 * payload, 64 KiB), wmem_max)`.
pub fn bdp_send_buffer(bandwidth_bps: u64, rtt: Duration, payload_len: usize) -> usize {
    let bdp = (bandwidth_bps as f64 * rtt.as_secs_f64() / 8.0) as usize;
    let floor = (4 * payload_len).max(MIN_SEND_BUFFER);
    let ceiling = sysctl_wmem_max().max(floor);
    bdp.clamp(floor, ceiling)
}

/// The kernel's socket send-buffer ceiling, or a conservative default.
pub fn sysctl_wmem_max() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(raw) = std::fs::read_to_string("/proc/sys/net/core/wmem_max") {
            if let Ok(v) = raw.trim().parse::<usize>() {
                return v;
            }
        }
    }
    DEFAULT_WMEM_MAX
}

/// Apply the BDP send buffer to a connected stream. Best effort.
pub fn size_send_buffer(stream: &TcpStream, bandwidth_bps: u64, rtt: Duration, payload_len: usize) {
    let target = bdp_send_buffer(bandwidth_bps, rtt, payload_len);
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(target) {
        tracing::debug!("Failed to size send buffer to {}: {}", target, e);
    }
}

/// Ask the kernel to cap the socket's pacing rate (Linux only). Best
/// effort: absence of the option is not an error.
#[cfg(target_os = "linux")]
pub fn set_pacing_rate(stream: &TcpStream, bandwidth_bps: u64) {
    use std::os::fd::AsRawFd;

    let bytes_per_sec = (bandwidth_bps / 8) as u32;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MAX_PACING_RATE,
            &bytes_per_sec as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::debug!(
            "SO_MAX_PACING_RATE unavailable: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_pacing_rate(_stream: &TcpStream, _bandwidth_bps: u64) {}

/// Kernel TCP counters read at the end of a sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSockInfo {
    pub retransmits: u64,
    pub segments_sent: u64,
    pub send_buffer_bytes: u64,
}

/// Read `TCP_INFO` (and the effective send buffer) from a stream.
/// Returns `None` where the platform offers no equivalent.
#[cfg(target_os = "linux")]
pub fn tcp_sock_info(stream: &TcpStream) -> Option<TcpSockInfo> {
    use std::os::fd::AsRawFd;

    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        tracing::debug!("TCP_INFO unavailable: {}", std::io::Error::last_os_error());
        return None;
    }

    let send_buffer_bytes = socket2::SockRef::from(stream)
        .send_buffer_size()
        .unwrap_or(0) as u64;

    Some(TcpSockInfo {
        retransmits: info.tcpi_total_retrans as u64,
        segments_sent: info.tcpi_segs_out as u64,
        send_buffer_bytes,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn tcp_sock_info(_stream: &TcpStream) -> Option<TcpSockInfo> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bdp_buffer_clamps() {
        // 100 Mbit/s * 20 ms / 8 = 250 KB
        let buf = bdp_send_buffer(100_000_000, Duration::from_millis(20), 16 * 1024);
        assert!(buf >= 250_000 && buf <= sysctl_wmem_max().max(250_000));

        // Tiny BDP floors at max(4 * payload, 64 KiB)
        let buf = bdp_send_buffer(1_000_000, Duration::from_millis(1), 64 * 1024);
        assert_eq!(buf, 4 * 64 * 1024);

        let buf = bdp_send_buffer(1_000_000, Duration::from_millis(1), 1200);
        assert_eq!(buf, MIN_SEND_BUFFER);
    }

    #[tokio::test]
    async fn test_token_bucket_paces() {
        // 8 Mbit/s = 1 MB/s; sending 200 KB beyond the burst allowance
        // must take roughly 200 ms.
        let mut bucket = TokenBucket::new(8_000_000);
        let start = Instant::now();
        let mut sent = 0usize;
        while sent < 300 * 1024 {
            bucket.consume(10 * 1024).await;
            sent += 10 * 1024;
        }
        let elapsed = start.elapsed();
        // Burst covers ~64-128 KB; the rest is paced at 1 MB/s.
        assert!(elapsed >= Duration::from_millis(120), "too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(800), "too slow: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_token_bucket_idle_does_not_bank_unbounded() {
        let mut bucket = TokenBucket::new(1_000_000);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // After idling, available tokens are capped at the burst size.
        bucket.replenish(Instant::now());
        assert!(bucket.tokens <= bucket.burst + 1.0);
    }
}
