//! ICMP reachability probing.
//!
//! One raw ICMPv4 socket pings every upstream's measure host once per
//! interval and summarizes replies per window; the window summary
//! toggles the upstream's `reachable` flag. Requires CAP_NET_RAW or
//! root; without it the prober logs a warning and leaves every upstream
//! reachable so bandwidth probing still governs scoring.

use crate::config::IcmpConfig;
use crate::upstream::UpstreamManager;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// ICMP echo request/reply types.
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// Echo payload size; carries the sequence redundantly for matching.
const ECHO_PAYLOAD_BYTES: usize = 16;

/// Outstanding requests older than this are forgotten.
const PENDING_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an ICMPv4 echo request.
fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + ECHO_PAYLOAD_BYTES];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0; // code
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..10].copy_from_slice(&seq.to_be_bytes());
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Extract `(ident, seq)` from a raw IPv4 datagram holding an echo
/// reply. Raw ICMP sockets deliver the full IP packet.
fn parse_echo_reply(buf: &[u8]) -> Option<(u16, u16)> {
    if buf.len() < 20 {
        return None;
    }
    let ihl = ((buf[0] & 0x0f) as usize) * 4;
    if buf.len() < ihl + 8 {
        return None;
    }
    let icmp = &buf[ihl..];
    if icmp[0] != ICMP_ECHO_REPLY || icmp[1] != 0 {
        return None;
    }
    let ident = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((ident, seq))
}

#[derive(Default)]
struct WindowStats {
    sent: u64,
    received: u64,
    rtt_sum_ms: f64,
}

/// Resolve each upstream's measure host to an IPv4 address.
async fn resolve_targets(manager: &UpstreamManager) -> Vec<(String, Ipv4Addr)> {
    let mut targets = Vec::new();
    for tag in manager.tags() {
        let Some((host, _)) = manager.measure_endpoint(&tag) else {
            continue;
        };
        let lookup_result = tokio::net::lookup_host((host.as_str(), 0)).await;
        match lookup_result {
            Ok(addrs) => {
                let v4 = addrs.filter_map(|a| match a.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                });
                match v4.into_iter().next() {
                    Some(ip) => targets.push((tag, ip)),
                    None => {
                        tracing::warn!("upstream {}: {} has no IPv4 address to ping", tag, host)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("upstream {}: failed to resolve {} for ping: {}", tag, host, e);
            }
        }
    }
    targets
}

#[cfg(target_os = "linux")]
fn open_icmp_socket() -> std::io::Result<tokio::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(std_socket)
}

#[cfg(not(target_os = "linux"))]
fn open_icmp_socket() -> std::io::Result<tokio::net::UdpSocket> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "ICMP probing only implemented for Linux",
    ))
}

/// Run the prober until shutdown.
pub async fn run_reachability(
    cfg: IcmpConfig,
    manager: Arc<UpstreamManager>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let targets = resolve_targets(&manager).await;
    if targets.is_empty() {
        tracing::warn!("reachability prober has no pingable upstreams");
        return;
    }

    let sock = match open_icmp_socket() {
        Ok(sock) => sock,
        Err(e) => {
            tracing::warn!(
                "ICMP socket unavailable ({}); leaving all upstreams reachable",
                e
            );
            return;
        }
    };
    tracing::info!(
        "reachability prober started for {} upstreams (interval {}s, window {}s)",
        targets.len(),
        cfg.interval_secs,
        cfg.window_secs
    );

    let ident = std::process::id() as u16;
    let mut seq_counter: u16 = 0;
    // seq -> (tag, sent_at) for RTT matching.
    let mut pending: HashMap<u16, (String, Instant)> = HashMap::new();
    let mut windows: HashMap<String, WindowStats> = HashMap::new();
    let mut window_started = Instant::now();

    let window = Duration::from_secs(cfg.window_secs.max(1));
    let mut tick = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
    let mut buf = vec![0u8; 2048];

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (tag, ip) in &targets {
                    seq_counter = seq_counter.wrapping_add(1);
                    let packet = build_echo_request(ident, seq_counter);
                    let dst = SocketAddr::new(IpAddr::V4(*ip), 0);
                    match sock.send_to(&packet, dst).await {
                        Ok(_) => {
                            pending.insert(seq_counter, (tag.clone(), Instant::now()));
                            windows.entry(tag.clone()).or_default().sent += 1;
                        }
                        Err(e) => {
                            tracing::debug!("ping to {} ({}) failed: {}", tag, ip, e);
                            windows.entry(tag.clone()).or_default().sent += 1;
                        }
                    }
                }

                let now = Instant::now();
                pending.retain(|_, (_, at)| now.duration_since(*at) <= PENDING_TIMEOUT);

                if now.duration_since(window_started) >= window {
                    for (tag, stats) in windows.drain() {
                        let reachable = stats.received > 0;
                        let avg_rtt = if stats.received > 0 {
                            stats.rtt_sum_ms / stats.received as f64
                        } else {
                            0.0
                        };
                        tracing::debug!(
                            "reachability {}: {}/{} replies, avg rtt {:.1}ms",
                            tag,
                            stats.received,
                            stats.sent,
                            avg_rtt
                        );
                        manager.set_reachable(&tag, reachable, now);
                    }
                    window_started = now;
                }
            }
            received = sock.recv_from(&mut buf) => {
                match received {
                    Ok((len, _from)) => {
                        if let Some((reply_ident, seq)) = parse_echo_reply(&buf[..len]) {
                            if reply_ident != ident {
                                continue;
                            }
                            if let Some((tag, sent_at)) = pending.remove(&seq) {
                                let stats = windows.entry(tag).or_default();
                                stats.received += 1;
                                stats.rtt_sum_ms += sent_at.elapsed().as_secs_f64() * 1000.0;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("ICMP recv error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("reachability prober shutting down");
                return;
            }
        }
    }
}
