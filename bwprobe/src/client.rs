//! The probe engine: client side of a measurement run.
//!
//! One run opens a session, keeps it alive with heartbeats, samples RTT
//! over the control channel, and drives `samples` paced transfers in the
//! configured direction, aggregating the server's per-interval reports
//! into a [`Results`] summary.

use crate::error::{ProbeError, Result};
use crate::framing::{
    tcp_payload_len, udp_datagram_len, TcpFrameHeader, UdpHeader, DGRAM_DATA, DGRAM_END,
    DGRAM_PING, DGRAM_PONG,
};
use crate::now_ms;
use crate::pacing::{self, TokenBucket};
use crate::report::{self, Results};
use crate::rpc::{write_message, RpcClient};
use common::{
    DataBinding, HelloParams, HelloResult, PingParams, PingResult, Proto, SampleStartParams,
    SampleStartResult, SampleStopParams, SampleStopResult, SessionParams, UdpRecvStats,
    UdpRegisterParams, UdpRegisterResult, DATA_PREAMBLE, METHOD_PING, METHOD_SAMPLE_START,
    METHOD_SAMPLE_START_REVERSE, METHOD_SAMPLE_STOP, METHOD_SESSION_CLOSE,
    METHOD_SESSION_HEARTBEAT, METHOD_SESSION_HELLO, METHOD_UDP_REGISTER, REVERSE_PREAMBLE,
    UDP_HEADER_BYTES,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::Instant;

/// Pings sent while establishing the UDP endpoint.
const UDP_SETUP_PINGS: u32 = 3;

/// Per-pong wait during UDP endpoint setup.
const UDP_PONG_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle margin added to a reverse sample's expected transfer time.
const REVERSE_DEADLINE_MARGIN: Duration = Duration::from_secs(2);

/// Probe run configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    pub network: Proto,
    /// Target rate for the paced sender, bits/second.
    pub bandwidth_bps: u64,
    /// Reverse: the server sends, measuring the download direction.
    pub reverse: bool,
    pub samples: u32,
    pub sample_bytes: u64,
    /// Frame/datagram size including the data-plane header.
    pub chunk_bytes: usize,
    /// Hard cap on one sample's transfer time.
    pub max_sample_duration: Option<Duration>,
    /// Control-channel RTT sampling rate.
    pub rtt_rate_hz: f64,
    /// Pause between samples.
    pub sample_wait: Duration,
    pub rpc_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9876,
            network: Proto::Tcp,
            bandwidth_bps: 50_000_000,
            reverse: false,
            samples: 3,
            sample_bytes: 5_000_000,
            chunk_bytes: 16 * 1024,
            max_sample_duration: None,
            rtt_rate_hz: 5.0,
            sample_wait: Duration::from_millis(200),
            rpc_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

impl ProbeConfig {
    fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            return Err(ProbeError::Config("samples must be positive".into()));
        }
        if self.bandwidth_bps == 0 {
            return Err(ProbeError::Config("bandwidth must be positive".into()));
        }
        if self.sample_bytes == 0 {
            return Err(ProbeError::Config("sample_bytes must be positive".into()));
        }
        if self.network == Proto::Tcp {
            tcp_payload_len(self.chunk_bytes)?;
        }
        if self.rtt_rate_hz <= 0.0 {
            return Err(ProbeError::Config("rtt_rate_hz must be positive".into()));
        }
        Ok(())
    }
}

/// One measurement run against a probe server.
pub struct ProbeEngine {
    config: ProbeConfig,
}

enum DataPlane {
    Tcp(TcpStream),
    Udp(Arc<UdpSocket>),
}

impl ProbeEngine {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the full probe. `stop` cancels between I/O steps.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<Results> {
        let cfg = &self.config;
        let started = Instant::now();

        let addr = resolve(&cfg.host, cfg.port).await?;
        let rpc = Arc::new(RpcClient::connect(addr, cfg.dial_timeout, cfg.rpc_timeout).await?);

        let hello: HelloResult = rpc
            .call_as(
                METHOD_SESSION_HELLO,
                &HelloParams {
                    client_version: env!("CARGO_PKG_VERSION").to_string(),
                    max_bandwidth_bps: 0,
                    max_sample_bytes: 0,
                },
            )
            .await?;
        let session_id = hello.session_id.clone();
        tracing::debug!("probe session {} open against {}", session_id, addr);

        let bandwidth_bps = clamp_cap(cfg.bandwidth_bps, hello.max_bandwidth_bps, "bandwidth");
        let sample_bytes = clamp_cap(cfg.sample_bytes, hello.max_sample_bytes, "sample size");

        // Background heartbeat for the lifetime of the run.
        let (bg_stop_tx, bg_stop_rx) = watch::channel(false);
        let hb_rpc = rpc.clone();
        let hb_session = session_id.clone();
        let hb_interval = Duration::from_secs(hello.heartbeat_interval_secs.max(1));
        let mut hb_stop = bg_stop_rx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(hb_interval);
            tick.tick().await; // the hello already proved liveness
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let params = SessionParams { session_id: hb_session.clone() };
                        if let Err(e) = hb_rpc
                            .call(METHOD_SESSION_HEARTBEAT, match serde_json::to_value(&params) {
                                Ok(v) => v,
                                Err(_) => break,
                            })
                            .await
                        {
                            tracing::debug!("heartbeat failed: {}", e);
                            break;
                        }
                    }
                    _ = hb_stop.changed() => break,
                }
            }
        });

        // Concurrent RTT sampler over the control channel.
        let rtt_samples = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let rtt_rpc = rpc.clone();
        let rtt_session = session_id.clone();
        let rtt_sink = rtt_samples.clone();
        let rtt_period = Duration::from_secs_f64(1.0 / cfg.rtt_rate_hz);
        let mut rtt_stop = bg_stop_rx.clone();
        let rtt_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(rtt_period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let t0 = Instant::now();
                        let params = PingParams {
                            session_id: Some(rtt_session.clone()),
                            timestamp_ms: now_ms(),
                        };
                        match rtt_rpc.call_as::<_, PingResult>(METHOD_PING, &params).await {
                            Ok(_) => {
                                rtt_sink.lock().push(t0.elapsed().as_secs_f64() * 1000.0);
                            }
                            Err(e) => {
                                tracing::debug!("rtt ping failed: {}", e);
                                break;
                            }
                        }
                    }
                    _ = rtt_stop.changed() => break,
                }
            }
        });

        let run = self
            .run_samples(addr, &rpc, &session_id, bandwidth_bps, sample_bytes, stop)
            .await;

        // Wind the background tasks and the session down regardless of
        // how the sample loop ended.
        let _ = bg_stop_tx.send(true);
        let _ = heartbeat.await;
        let _ = rtt_task.await;
        let close = SessionParams {
            session_id: session_id.clone(),
        };
        if let Ok(params) = serde_json::to_value(&close) {
            let _ = rpc.call(METHOD_SESSION_CLOSE, params).await;
        }

        let (reports, tcp_client_counters) = run?;
        let rtts = rtt_samples.lock().clone();
        Ok(report::aggregate(
            cfg.network,
            cfg.reverse,
            &reports,
            &rtts,
            tcp_client_counters,
            started.elapsed(),
        ))
    }

    /// Establish the data plane and run the sample loop.
    async fn run_samples(
        &self,
        addr: SocketAddr,
        rpc: &Arc<RpcClient>,
        session_id: &str,
        bandwidth_bps: u64,
        sample_bytes: u64,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(Vec<SampleStopResult>, Option<(u64, u64)>)> {
        let cfg = &self.config;

        let mut plane = match cfg.network {
            Proto::Tcp => {
                let preamble = if cfg.reverse {
                    REVERSE_PREAMBLE
                } else {
                    DATA_PREAMBLE
                };
                let stream = dial_data(addr, cfg.dial_timeout, &preamble, session_id).await?;
                if !cfg.reverse {
                    let payload_len = tcp_payload_len(cfg.chunk_bytes)?;
                    pacing::size_send_buffer(
                        &stream,
                        bandwidth_bps,
                        Duration::from_millis(100),
                        payload_len,
                    );
                    pacing::set_pacing_rate(&stream, bandwidth_bps);
                }
                DataPlane::Tcp(stream)
            }
            Proto::Udp => {
                let sock = setup_udp(addr, rpc, session_id).await?;
                DataPlane::Udp(sock)
            }
        };

        let tcp_baseline = match (&plane, cfg.reverse) {
            (DataPlane::Tcp(stream), false) => pacing::tcp_sock_info(stream),
            _ => None,
        };

        let mut reports = Vec::with_capacity(cfg.samples as usize);
        for i in 0..cfg.samples {
            if *stop.borrow() {
                return Err(ProbeError::Cancelled);
            }
            let sample_id = i + 1;
            let report = self
                .run_one_sample(
                    rpc,
                    session_id,
                    sample_id,
                    &mut plane,
                    bandwidth_bps,
                    sample_bytes,
                    &mut stop,
                )
                .await?;
            reports.push(report);

            if i + 1 < cfg.samples {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.sample_wait) => {}
                    _ = stop.changed() => return Err(ProbeError::Cancelled),
                }
            }
        }

        let tcp_client_counters = match (&plane, tcp_baseline) {
            (DataPlane::Tcp(stream), Some(base)) => pacing::tcp_sock_info(stream).map(|now| {
                (
                    now.retransmits.saturating_sub(base.retransmits),
                    now.segments_sent.saturating_sub(base.segments_sent),
                )
            }),
            _ => None,
        };

        Ok((reports, tcp_client_counters))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_sample(
        &self,
        rpc: &Arc<RpcClient>,
        session_id: &str,
        sample_id: u32,
        plane: &mut DataPlane,
        bandwidth_bps: u64,
        sample_bytes: u64,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SampleStopResult> {
        let cfg = &self.config;
        let start_params = SampleStartParams {
            session_id: session_id.to_string(),
            sample_id,
            network: cfg.network.as_str().to_string(),
            sample_bytes,
            bandwidth_bps,
            chunk_bytes: cfg.chunk_bytes as u32,
        };

        let method = if cfg.reverse {
            METHOD_SAMPLE_START_REVERSE
        } else {
            METHOD_SAMPLE_START
        };
        let _: SampleStartResult = rpc.call_as(method, &start_params).await?;

        let deadline = self.sample_deadline(bandwidth_bps, sample_bytes);
        let mut udp_recv = None;
        if cfg.reverse {
            match plane {
                DataPlane::Tcp(stream) => {
                    recv_tcp_sample(stream, sample_id, sample_bytes, deadline, stop).await?;
                }
                DataPlane::Udp(sock) => {
                    udp_recv =
                        Some(recv_udp_sample(sock, sample_id, sample_bytes, deadline, stop).await?);
                }
            }
        } else {
            match plane {
                DataPlane::Tcp(stream) => {
                    send_tcp_sample(
                        stream,
                        sample_id,
                        sample_bytes,
                        bandwidth_bps,
                        cfg.chunk_bytes,
                        deadline,
                        stop,
                    )
                    .await?;
                }
                DataPlane::Udp(sock) => {
                    send_udp_sample(
                        sock,
                        sample_id,
                        sample_bytes,
                        bandwidth_bps,
                        cfg.chunk_bytes,
                        deadline,
                        stop,
                    )
                    .await?;
                }
            }
        }

        let stop_params = SampleStopParams {
            session_id: session_id.to_string(),
            sample_id,
            udp_recv,
        };
        let report: SampleStopResult = rpc.call_as(METHOD_SAMPLE_STOP, &stop_params).await?;
        Ok(report)
    }

    /// When a sample must give up: twice the expected transfer time plus
    /// a margin, capped by the configured maximum.
    fn sample_deadline(&self, bandwidth_bps: u64, sample_bytes: u64) -> Instant {
        let expected = Duration::from_secs_f64(sample_bytes as f64 * 8.0 / bandwidth_bps as f64);
        let mut allowance = expected * 2 + REVERSE_DEADLINE_MARGIN;
        if let Some(cap) = self.config.max_sample_duration {
            allowance = allowance.min(cap);
        }
        Instant::now() + allowance
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ProbeError::Config(format!("{} did not resolve", host)))
}

fn clamp_cap(requested: u64, cap: u64, what: &str) -> u64 {
    if cap > 0 && requested > cap {
        tracing::debug!("server caps {} to {} (requested {})", what, cap, requested);
        cap
    } else {
        requested
    }
}

/// Dial a data connection and bind it to the session.
async fn dial_data(
    addr: SocketAddr,
    dial_timeout: Duration,
    preamble: &[u8; 4],
    session_id: &str,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout(format!("dial data {}", addr)))??;
    stream.set_nodelay(true)?;
    stream.write_all(preamble).await?;
    let binding = DataBinding {
        session_id: session_id.to_string(),
        sample_id: None,
    };
    write_message(&mut stream, &serde_json::to_value(&binding)?).await?;
    Ok(stream)
}

/// Open the UDP socket, prove it to the server with pings, and register
/// the address the server observed.
async fn setup_udp(addr: SocketAddr, rpc: &Arc<RpcClient>, session_id: &str) -> Result<Arc<UdpSocket>> {
    let bind: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().map_err(|_| ProbeError::Config("ipv6 bind".into()))?
    } else {
        "0.0.0.0:0"
            .parse()
            .map_err(|_| ProbeError::Config("ipv4 bind".into()))?
    };
    let sock = Arc::new(UdpSocket::bind(bind).await?);
    sock.connect(addr).await?;

    let mut observed: Option<String> = None;
    let mut buf = vec![0u8; 2048];
    for seq in 0..UDP_SETUP_PINGS as u64 {
        let header = UdpHeader {
            kind: DGRAM_PING,
            sample_id: 0,
            seq,
        };
        let mut ping = header.encode().to_vec();
        ping.extend_from_slice(session_id.as_bytes());
        sock.send(&ping).await?;

        match tokio::time::timeout(UDP_PONG_TIMEOUT, sock.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                if let Some(reply) = UdpHeader::decode(&buf[..len]) {
                    if reply.kind == DGRAM_PONG {
                        observed = Some(
                            String::from_utf8_lossy(&buf[UDP_HEADER_BYTES..len]).to_string(),
                        );
                    }
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
    }

    let observed = observed
        .ok_or_else(|| ProbeError::Protocol("no pong from server during udp setup".into()))?;
    let _: UdpRegisterResult = rpc
        .call_as(
            METHOD_UDP_REGISTER,
            &UdpRegisterParams {
                session_id: session_id.to_string(),
                addr: observed.clone(),
            },
        )
        .await?;
    tracing::debug!("udp endpoint {} registered", observed);
    Ok(sock)
}

async fn send_tcp_sample(
    stream: &mut TcpStream,
    sample_id: u32,
    sample_bytes: u64,
    bandwidth_bps: u64,
    chunk_bytes: usize,
    deadline: Instant,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    let payload_len = tcp_payload_len(chunk_bytes)?;
    let mut frame = TcpFrameHeader {
        sample_id,
        payload_len: payload_len as u32,
    }
    .encode()
    .to_vec();
    let mut payload = vec![0u8; payload_len];
    rand::Rng::fill(&mut rand::thread_rng(), &mut payload[..]);
    frame.extend_from_slice(&payload);

    let mut bucket = TokenBucket::new(bandwidth_bps);
    let mut sent: u64 = 0;
    while sent < sample_bytes && Instant::now() < deadline {
        if *stop.borrow() {
            return Err(ProbeError::Cancelled);
        }
        let wait = bucket.debit(frame.len());
        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => return Err(ProbeError::Cancelled),
            }
        }
        stream.write_all(&frame).await?;
        sent += payload_len as u64;
    }
    stream.flush().await?;
    Ok(())
}

async fn send_udp_sample(
    sock: &UdpSocket,
    sample_id: u32,
    sample_bytes: u64,
    bandwidth_bps: u64,
    chunk_bytes: usize,
    deadline: Instant,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    let dgram_len = udp_datagram_len(chunk_bytes, 1472);
    let payload_len = dgram_len - UDP_HEADER_BYTES;
    let mut dgram = vec![0u8; dgram_len];
    rand::Rng::fill(&mut rand::thread_rng(), &mut dgram[UDP_HEADER_BYTES..]);

    let mut bucket = TokenBucket::new(bandwidth_bps);
    let mut seq: u64 = 0;
    let mut sent: u64 = 0;
    while sent < sample_bytes && Instant::now() < deadline {
        if *stop.borrow() {
            return Err(ProbeError::Cancelled);
        }
        let wait = bucket.debit(dgram_len);
        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.changed() => return Err(ProbeError::Cancelled),
            }
        }
        let header = UdpHeader {
            kind: DGRAM_DATA,
            sample_id,
            seq,
        };
        dgram[..UDP_HEADER_BYTES].copy_from_slice(&header.encode());
        sock.send(&dgram).await?;
        seq += 1;
        sent += payload_len as u64;
    }

    for _ in 0..UDP_SETUP_PINGS {
        let header = UdpHeader {
            kind: DGRAM_END,
            sample_id,
            seq,
        };
        let _ = sock.send(&header.encode()).await;
    }
    Ok(())
}

/// Drain reverse TCP frames until the expected bytes landed or the
/// deadline passed.
async fn recv_tcp_sample(
    stream: &mut TcpStream,
    sample_id: u32,
    sample_bytes: u64,
    deadline: Instant,
    stop: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut header_buf = [0u8; common::TCP_FRAME_HEADER_BYTES];
    let mut payload = Vec::new();
    let mut received: u64 = 0;

    while received < sample_bytes {
        if *stop.borrow() {
            return Err(ProbeError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
        let header = TcpFrameHeader::decode(&header_buf);
        payload.resize(header.payload_len as usize, 0);
        stream.read_exact(&mut payload).await?;
        if header.sample_id == sample_id {
            received += header.payload_len as u64;
        }
    }
    Ok(())
}

/// Receive reverse UDP datagrams, tracking sequence state for the loss
/// report the server cannot compute on its own.
async fn recv_udp_sample(
    sock: &UdpSocket,
    sample_id: u32,
    sample_bytes: u64,
    deadline: Instant,
    stop: &mut watch::Receiver<bool>,
) -> Result<UdpRecvStats> {
    let mut stats = UdpRecvStats::default();
    let mut base_seq: Option<u64> = None;
    let mut buf = vec![0u8; 64 * 1024];

    while stats.bytes_received < sample_bytes {
        if *stop.borrow() {
            return Err(ProbeError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let len = match tokio::time::timeout(remaining, sock.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        };
        let Some(header) = UdpHeader::decode(&buf[..len]) else {
            continue;
        };
        if header.sample_id != sample_id {
            continue;
        }
        match header.kind {
            DGRAM_DATA => {
                stats.packets_received += 1;
                stats.bytes_received += (len - UDP_HEADER_BYTES) as u64;
                match base_seq {
                    None => {
                        base_seq = Some(header.seq);
                        stats.base_seq = header.seq;
                        stats.max_seq = header.seq;
                    }
                    Some(_) => {
                        if header.seq > stats.max_seq {
                            stats.max_seq = header.seq;
                        } else {
                            stats.ooo_packets += 1;
                        }
                    }
                }
            }
            DGRAM_END => break,
            _ => {}
        }
    }
    Ok(stats)
}
