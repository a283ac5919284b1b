//! The probe server.
//!
//! One TCP listener serves three connection roles, selected by the
//! 4-byte preamble: JSON-RPC control, forward data, reverse data. A UDP
//! socket on the same port carries all UDP samples for all sessions,
//! routed by source address. Method failures are answered as JSON-RPC
//! errors and keep the connection alive; framing violations abort it.

use crate::config::ProbeServerConfig;
use crate::error::{ProbeError, Result};
use crate::framing::{
    udp_datagram_len, tcp_payload_len, TcpFrameHeader, UdpHeader, DGRAM_DATA, DGRAM_END,
    DGRAM_PING, DGRAM_PONG,
};
use crate::now_ms;
use crate::pacing::{self, TokenBucket};
use crate::rpc::{read_message, write_message, RpcFailure};
use crate::session::{ProbeSession, ReverseDone, SessionCaps};
use common::{
    DataBinding, ErrorCode, HelloParams, HelloResult, PingParams, PingResult, RpcRequest,
    RpcResponse, SampleStartParams, SampleStartResult, SampleStopParams, ServerInfoResult,
    SessionParams, UdpRegisterParams, UdpRegisterResult, DATA_PREAMBLE, METHOD_PING,
    METHOD_SAMPLE_START, METHOD_SAMPLE_START_REVERSE, METHOD_SAMPLE_STOP, METHOD_SERVER_INFO,
    METHOD_SESSION_CLOSE, METHOD_SESSION_HEARTBEAT, METHOD_SESSION_HELLO, METHOD_UDP_REGISTER,
    Proto, RPC_PREAMBLE, REVERSE_PREAMBLE, UDP_HEADER_BYTES,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, oneshot, watch, RwLock};

/// How long `sample.start_reverse` waits for the reverse data connection.
const REVERSE_WAIT: Duration = Duration::from_secs(2);

/// Polling interval while waiting for the reverse connection.
const REVERSE_POLL: Duration = Duration::from_millis(50);

/// A UDP ping older than this no longer validates `udp.register`.
const UDP_PING_FRESHNESS: Duration = Duration::from_secs(15);

/// Deadline for a reverse sender to acknowledge its stop signal.
const SENDER_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// RTT assumed for send-buffer sizing before any measurement exists.
const ASSUMED_RTT: Duration = Duration::from_millis(100);

/// Ceiling on a single TCP data frame payload.
const MAX_FRAME_PAYLOAD: u32 = 4 * 1024 * 1024;

/// Trailing end-of-sample markers sent after a reverse UDP sample.
const UDP_END_MARKERS: u32 = 3;

struct PingRecord {
    session_id: String,
    seen: Instant,
}

struct Shared {
    config: ProbeServerConfig,
    sessions: RwLock<HashMap<String, Arc<ProbeSession>>>,
    udp_pings: Mutex<HashMap<SocketAddr, PingRecord>>,
    udp_sock: OnceLock<Arc<UdpSocket>>,
    local_addr: OnceLock<SocketAddr>,
    started: Instant,
}

/// The probe server.
pub struct ProbeServer {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProbeServer {
    pub fn new(config: ProbeServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                sessions: RwLock::new(HashMap::new()),
                udp_pings: Mutex::new(HashMap::new()),
                udp_sock: OnceLock::new(),
                local_addr: OnceLock::new(),
                started: Instant::now(),
            }),
            shutdown_tx,
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Address the server bound to, once [`ProbeServer::run`] has bound.
    /// Lets embedders configure port 0 and discover the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Signal every loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the server until shutdown.
    pub async fn run(&self) -> Result<()> {
        let ip: IpAddr = self
            .shared
            .config
            .host
            .parse()
            .map_err(|e| ProbeError::Config(format!("invalid host {}: {}", self.shared.config.host, e)))?;
        let addr = SocketAddr::new(ip, self.shared.config.port);

        let listener = TcpListener::bind(addr).await?;
        // The UDP socket must share the TCP port; bind it to whatever
        // port the listener actually got (matters for port 0).
        let bound = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(bound).await?);
        let _ = self.shared.udp_sock.set(udp.clone());
        let _ = self.shared.local_addr.set(bound);
        tracing::info!("probe server listening on {} (tcp+udp)", bound);

        let udp_shared = self.shared.clone();
        let mut udp_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = run_udp(udp_shared, udp) => {}
                _ = udp_shutdown.recv() => {}
            }
        });

        let sweep_shared = self.shared.clone();
        let mut sweep_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = run_sweeper(sweep_shared) => {}
                _ = sweep_shutdown.recv() => {}
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(shared, stream, peer).await {
                                    tracing::debug!("probe connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("probe accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("probe server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn get_session(shared: &Shared, id: &str) -> std::result::Result<Arc<ProbeSession>, RpcFailure> {
    shared
        .sessions
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| RpcFailure::new(ErrorCode::InvalidSession))
}

/// Dispatch a fresh connection by its role preamble.
async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut preamble = [0u8; 4];
    stream.read_exact(&mut preamble).await?;

    match preamble {
        RPC_PREAMBLE => run_rpc_connection(shared, stream, peer).await,
        DATA_PREAMBLE => run_forward_data(shared, stream, peer).await,
        REVERSE_PREAMBLE => park_reverse_connection(shared, stream, peer).await,
        other => Err(ProbeError::Protocol(format!(
            "unknown preamble {:?} from {}",
            other, peer
        ))),
    }
}

/// Serve JSON-RPC requests strictly in order until the peer disconnects.
async fn run_rpc_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    tracing::debug!("rpc connection from {}", peer);

    loop {
        let value = match read_message(&mut stream).await {
            Ok(v) => v,
            Err(ProbeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let id = value.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
        let response = match serde_json::from_value::<RpcRequest>(value) {
            Err(e) => RpcResponse::error(
                RpcFailure::with(ErrorCode::ParseError, e.to_string()).to_rpc_error(),
                id,
            ),
            Ok(req) if req.jsonrpc != "2.0" => RpcResponse::error(
                RpcFailure::new(ErrorCode::InvalidRequest).to_rpc_error(),
                id,
            ),
            Ok(req) => match dispatch(&shared, &req).await {
                Ok(result) => RpcResponse::result(result, req.id),
                Err(failure) => {
                    tracing::debug!(
                        "rpc {} from {} failed: {:?} ({:?})",
                        req.method,
                        peer,
                        failure.code,
                        failure.detail
                    );
                    RpcResponse::error(failure.to_rpc_error(), req.id)
                }
            },
        };

        write_message(&mut stream, &serde_json::to_value(&response)?).await?;
    }
}

/// Handle one JSON-RPC method.
async fn dispatch(
    shared: &Arc<Shared>,
    req: &RpcRequest,
) -> std::result::Result<serde_json::Value, RpcFailure> {
    let params = req.params.clone();
    match req.method.as_str() {
        METHOD_SESSION_HELLO => {
            let params: HelloParams = serde_json::from_value(params)?;
            handle_hello(shared, params).await
        }
        METHOD_SESSION_HEARTBEAT => {
            let params: SessionParams = serde_json::from_value(params)?;
            let session = get_session(shared, &params.session_id).await?;
            session.touch();
            Ok(serde_json::json!({}))
        }
        METHOD_SESSION_CLOSE => {
            let params: SessionParams = serde_json::from_value(params)?;
            let removed = shared.sessions.write().await.remove(&params.session_id);
            if let Some(session) = removed {
                let _ = session.close();
                tracing::info!("session {} closed", params.session_id);
            }
            // Closing an already-gone session is not an error.
            Ok(serde_json::json!({}))
        }
        METHOD_SAMPLE_START => {
            let params: SampleStartParams = serde_json::from_value(params)?;
            let session = get_session(shared, &params.session_id).await?;
            session.touch();
            let network = parse_network(&params.network)?;
            if network == Proto::Tcp {
                tcp_payload_len(params.chunk_bytes as usize)
                    .map_err(|e| RpcFailure::with(ErrorCode::InvalidParams, e.to_string()))?;
            }
            session.begin_sample(params.sample_id, network, false)?;
            tracing::debug!(
                "session {} sample {} started ({})",
                session.id,
                params.sample_id,
                params.network
            );
            result(&SampleStartResult {
                sample_id: params.sample_id,
            })
        }
        METHOD_SAMPLE_START_REVERSE => {
            let params: SampleStartParams = serde_json::from_value(params)?;
            handle_start_reverse(shared, params).await
        }
        METHOD_SAMPLE_STOP => {
            let params: SampleStopParams = serde_json::from_value(params)?;
            handle_stop(shared, params).await
        }
        METHOD_PING => {
            let params: PingParams = serde_json::from_value(params)?;
            if let Some(session_id) = &params.session_id {
                let session = get_session(shared, session_id).await?;
                session.touch();
            }
            result(&PingResult {
                timestamp_ms: params.timestamp_ms,
                server_time_ms: now_ms(),
            })
        }
        METHOD_UDP_REGISTER => {
            let params: UdpRegisterParams = serde_json::from_value(params)?;
            handle_udp_register(shared, params).await
        }
        METHOD_SERVER_INFO => {
            let sessions = shared.sessions.read().await.len();
            result(&ServerInfoResult {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: shared.started.elapsed().as_secs(),
                active_sessions: sessions,
                max_bandwidth_bps: shared.config.max_bandwidth_bps,
                max_sample_bytes: shared.config.max_sample_bytes,
            })
        }
        _ => Err(RpcFailure::with(ErrorCode::MethodNotFound, req.method.clone())),
    }
}

fn result<T: serde::Serialize>(value: &T) -> std::result::Result<serde_json::Value, RpcFailure> {
    serde_json::to_value(value).map_err(|e| RpcFailure::with(ErrorCode::InternalError, e.to_string()))
}

fn parse_network(network: &str) -> std::result::Result<Proto, RpcFailure> {
    Proto::from_str_loose(network)
        .ok_or_else(|| RpcFailure::with(ErrorCode::InvalidNetwork, network.to_string()))
}

/// Effective limit: the stricter of server config and client preference,
/// where 0 means "no preference".
fn effective_cap(server: u64, client: u64) -> u64 {
    match (server, client) {
        (0, c) => c,
        (s, 0) => s,
        (s, c) => s.min(c),
    }
}

async fn handle_hello(
    shared: &Arc<Shared>,
    params: HelloParams,
) -> std::result::Result<serde_json::Value, RpcFailure> {
    let mut sessions = shared.sessions.write().await;
    if sessions.len() >= shared.config.max_sessions {
        return Err(RpcFailure::with(
            ErrorCode::ServerError,
            format!("session limit of {} reached", shared.config.max_sessions),
        ));
    }

    let caps = SessionCaps {
        max_bandwidth_bps: effective_cap(shared.config.max_bandwidth_bps, params.max_bandwidth_bps),
        max_sample_bytes: effective_cap(shared.config.max_sample_bytes, params.max_sample_bytes),
    };
    let session_id = uuid::Uuid::new_v4().to_string();
    sessions.insert(
        session_id.clone(),
        Arc::new(ProbeSession::new(session_id.clone(), caps)),
    );
    drop(sessions);

    tracing::info!(
        "session {} opened (client: {})",
        session_id,
        if params.client_version.is_empty() {
            "unknown"
        } else {
            &params.client_version
        }
    );

    result(&HelloResult {
        session_id,
        max_bandwidth_bps: caps.max_bandwidth_bps,
        max_sample_bytes: caps.max_sample_bytes,
        heartbeat_interval_secs: shared.config.heartbeat_interval_secs,
    })
}

async fn handle_start_reverse(
    shared: &Arc<Shared>,
    params: SampleStartParams,
) -> std::result::Result<serde_json::Value, RpcFailure> {
    let session = get_session(shared, &params.session_id).await?;
    session.touch();
    let network = parse_network(&params.network)?;

    let caps = session.caps;
    if params.bandwidth_bps == 0
        || (caps.max_bandwidth_bps > 0 && params.bandwidth_bps > caps.max_bandwidth_bps)
    {
        return Err(RpcFailure::with(
            ErrorCode::InvalidBandwidth,
            format!("{} bps", params.bandwidth_bps),
        ));
    }
    if params.sample_bytes == 0
        || (caps.max_sample_bytes > 0 && params.sample_bytes > caps.max_sample_bytes)
    {
        return Err(RpcFailure::with(
            ErrorCode::InvalidSampleSize,
            format!("{} bytes", params.sample_bytes),
        ));
    }

    // Claim the sample slot first so concurrent starts cannot both win,
    // then roll the claim back if the transport is missing.
    session.begin_sample(params.sample_id, network, true)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();

    match network {
        Proto::Tcp => {
            let payload_len = match tcp_payload_len(params.chunk_bytes as usize) {
                Ok(len) => len,
                Err(e) => {
                    session.abort_sample(params.sample_id);
                    return Err(RpcFailure::with(ErrorCode::InvalidParams, e.to_string()));
                }
            };

            let stream = match wait_for_reverse_conn(&session).await {
                Some(stream) => stream,
                None => {
                    session.abort_sample(params.sample_id);
                    return Err(RpcFailure::new(ErrorCode::ReverseNotAvailable));
                }
            };

            pacing::size_send_buffer(&stream, params.bandwidth_bps, ASSUMED_RTT, payload_len);
            pacing::set_pacing_rate(&stream, params.bandwidth_bps);
            let baseline = pacing::tcp_sock_info(&stream);
            session.attach_reverse(params.sample_id, stop_tx, done_rx, baseline);

            let sender_session = session.clone();
            tokio::spawn(run_reverse_tcp_sender(
                sender_session,
                params.sample_id,
                stream,
                params.bandwidth_bps,
                params.sample_bytes,
                payload_len,
                stop_rx,
                done_tx,
            ));
        }
        Proto::Udp => {
            let endpoint = match session.udp_endpoint() {
                Some(addr) => addr,
                None => {
                    session.abort_sample(params.sample_id);
                    return Err(RpcFailure::new(ErrorCode::UdpNotRegistered));
                }
            };
            let sock = match shared.udp_sock.get() {
                Some(sock) => sock.clone(),
                None => {
                    session.abort_sample(params.sample_id);
                    return Err(RpcFailure::with(ErrorCode::InternalError, "udp socket not ready"));
                }
            };

            session.attach_reverse(params.sample_id, stop_tx, done_rx, None);

            let sender_session = session.clone();
            let dgram_len = udp_datagram_len(params.chunk_bytes as usize, shared.config.udp_mtu);
            tokio::spawn(run_reverse_udp_sender(
                sender_session,
                params.sample_id,
                sock,
                endpoint,
                params.bandwidth_bps,
                params.sample_bytes,
                dgram_len,
                stop_rx,
                done_tx,
            ));
        }
    }

    tracing::debug!(
        "session {} reverse sample {} started ({}, {} bps)",
        session.id,
        params.sample_id,
        params.network,
        params.bandwidth_bps
    );
    result(&SampleStartResult {
        sample_id: params.sample_id,
    })
}

/// The client dials the reverse connection right after `session.hello`;
/// give it a short grace window to arrive.
async fn wait_for_reverse_conn(session: &Arc<ProbeSession>) -> Option<TcpStream> {
    let deadline = Instant::now() + REVERSE_WAIT;
    loop {
        if let Some(stream) = session.reverse_conn.lock().await.take() {
            return Some(stream);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(REVERSE_POLL).await;
    }
}

async fn handle_stop(
    shared: &Arc<Shared>,
    params: SampleStopParams,
) -> std::result::Result<serde_json::Value, RpcFailure> {
    let session = get_session(shared, &params.session_id).await?;
    session.touch();

    let (reverse, stop_tx, done_rx) = session.take_stop_handles(params.sample_id)?;

    let mut tcp_now = None;
    if reverse {
        if let Some(stop) = stop_tx {
            let _ = stop.send(true);
        }
        if let Some(done_rx) = done_rx {
            match tokio::time::timeout(SENDER_STOP_DEADLINE, done_rx).await {
                Ok(Ok(done)) => {
                    if done.datagrams_sent > 0 {
                        tracing::debug!(
                            "session {} sample {}: reverse sender sent {} datagrams",
                            session.id,
                            params.sample_id,
                            done.datagrams_sent
                        );
                    }
                    if let Some(stream) = done.stream {
                        tcp_now = pacing::tcp_sock_info(&stream);
                        // Park the data connection for the next sample.
                        *session.reverse_conn.lock().await = Some(stream);
                    }
                }
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(
                        "session {} sample {}: reverse sender did not confirm stop",
                        session.id,
                        params.sample_id
                    );
                }
            }
        }
    } else {
        // Let in-flight bytes land before the report is cut.
        tokio::time::sleep(Duration::from_millis(shared.config.recv_wait_ms)).await;
    }

    let report = session.finalize_sample(params.sample_id, params.udp_recv, tcp_now)?;
    tracing::debug!(
        "session {} sample {} stopped: {} bytes over {} intervals",
        session.id,
        params.sample_id,
        report.total_bytes,
        report.intervals.len()
    );
    result(&report)
}

async fn handle_udp_register(
    shared: &Arc<Shared>,
    params: UdpRegisterParams,
) -> std::result::Result<serde_json::Value, RpcFailure> {
    let session = get_session(shared, &params.session_id).await?;
    session.touch();

    let addr: SocketAddr = params
        .addr
        .parse()
        .map_err(|e| RpcFailure::with(ErrorCode::InvalidParams, format!("addr: {}", e)))?;

    let fresh = {
        let pings = shared.udp_pings.lock();
        match pings.get(&addr) {
            Some(record) => {
                record.session_id == params.session_id
                    && record.seen.elapsed() <= UDP_PING_FRESHNESS
            }
            None => false,
        }
    };
    if !fresh {
        return Err(RpcFailure::with(
            ErrorCode::UdpNotRegistered,
            format!("no recent udp ping from {}", addr),
        ));
    }

    session.set_udp_endpoint(addr);
    tracing::info!("session {} registered udp endpoint {}", session.id, addr);
    result(&UdpRegisterResult { addr: params.addr })
}

/// Forward data connection: account frames into the bound session.
async fn run_forward_data(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let binding: DataBinding = serde_json::from_value(read_message(&mut stream).await?)?;
    let session = shared
        .sessions
        .read()
        .await
        .get(&binding.session_id)
        .cloned()
        .ok_or_else(|| {
            ProbeError::Protocol(format!("data connection for unknown session from {}", peer))
        })?;

    tracing::debug!("forward data connection for session {}", session.id);

    let mut header_buf = [0u8; common::TCP_FRAME_HEADER_BYTES];
    let mut payload = Vec::new();
    loop {
        match stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let header = TcpFrameHeader::decode(&header_buf);
        if header.payload_len == 0 || header.payload_len > MAX_FRAME_PAYLOAD {
            return Err(ProbeError::Protocol(format!(
                "frame payload of {} bytes from {}",
                header.payload_len, peer
            )));
        }
        payload.resize(header.payload_len as usize, 0);
        stream.read_exact(&mut payload).await?;
        session.record_bytes(
            header.sample_id,
            header.payload_len as usize,
            Instant::now(),
            now_ms(),
        );
    }
}

/// Reverse data connection: park it on the session until a reverse
/// sample claims it.
async fn park_reverse_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let binding: DataBinding = serde_json::from_value(read_message(&mut stream).await?)?;
    let session = shared
        .sessions
        .read()
        .await
        .get(&binding.session_id)
        .cloned()
        .ok_or_else(|| {
            ProbeError::Protocol(format!("reverse connection for unknown session from {}", peer))
        })?;

    stream.set_nodelay(true)?;
    *session.reverse_conn.lock().await = Some(stream);
    tracing::debug!("reverse data connection parked for session {}", session.id);
    Ok(())
}

/// UDP datagram loop: pings refresh the endpoint map and are answered
/// with pongs echoing the observed source address; data datagrams are
/// routed to the session registered for their source address.
async fn run_udp(shared: Arc<Shared>, sock: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = match sock.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("probe udp recv error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(header) = UdpHeader::decode(&buf[..len]) else {
            tracing::debug!("short udp datagram ({} bytes) from {}", len, peer);
            continue;
        };
        let payload = &buf[UDP_HEADER_BYTES..len];

        match header.kind {
            DGRAM_PING => {
                let session_id = String::from_utf8_lossy(payload).to_string();
                {
                    let mut pings = shared.udp_pings.lock();
                    pings.insert(
                        peer,
                        PingRecord {
                            session_id,
                            seen: Instant::now(),
                        },
                    );
                    pings.retain(|_, r| r.seen.elapsed() <= UDP_PING_FRESHNESS);
                }
                let pong = UdpHeader {
                    kind: DGRAM_PONG,
                    sample_id: header.sample_id,
                    seq: header.seq,
                };
                let mut reply = pong.encode().to_vec();
                reply.extend_from_slice(peer.to_string().as_bytes());
                if let Err(e) = sock.send_to(&reply, peer).await {
                    tracing::debug!("pong to {} failed: {}", peer, e);
                }
            }
            DGRAM_DATA => {
                let session_id = {
                    let pings = shared.udp_pings.lock();
                    pings.get(&peer).map(|r| r.session_id.clone())
                };
                // The ping record ages out; a registered endpoint keeps
                // routing for the rest of the session.
                let session = match session_id {
                    Some(id) => shared.sessions.read().await.get(&id).cloned(),
                    None => shared
                        .sessions
                        .read()
                        .await
                        .values()
                        .find(|s| s.udp_endpoint() == Some(peer))
                        .cloned(),
                };
                if session.is_none() {
                    tracing::debug!("udp data from unknown endpoint {}", peer);
                }
                if let Some(session) = session {
                    session.record_udp_data(
                        header.sample_id,
                        header.seq,
                        payload.len(),
                        Instant::now(),
                        now_ms(),
                    );
                }
            }
            DGRAM_END | DGRAM_PONG => {}
            other => {
                tracing::debug!("unknown udp datagram type {} from {}", other, peer);
            }
        }
    }
}

/// Close sessions whose heartbeat went stale.
async fn run_sweeper(shared: Arc<Shared>) {
    let timeout = Duration::from_secs(shared.config.session_timeout_secs);
    let mut tick = tokio::time::interval(Duration::from_secs(
        shared.config.heartbeat_interval_secs.max(1),
    ));
    loop {
        tick.tick().await;
        let expired: Vec<String> = {
            let sessions = shared.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.is_expired(timeout))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            continue;
        }
        let mut sessions = shared.sessions.write().await;
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                let _ = session.close();
                tracing::info!(
                    "session {} swept after {}s without heartbeat",
                    id,
                    timeout.as_secs()
                );
            }
        }
    }
}

/// Paced reverse TCP sender. Accounts sent payload through the same
/// interval path as forward receivers, then hands the connection back.
#[allow(clippy::too_many_arguments)]
async fn run_reverse_tcp_sender(
    session: Arc<ProbeSession>,
    sample_id: u32,
    mut stream: TcpStream,
    bandwidth_bps: u64,
    sample_bytes: u64,
    payload_len: usize,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<ReverseDone>,
) {
    let mut bucket = TokenBucket::new(bandwidth_bps);
    let mut frame = TcpFrameHeader {
        sample_id,
        payload_len: payload_len as u32,
    }
    .encode()
    .to_vec();
    let mut payload = vec![0u8; payload_len];
    rand::Rng::fill(&mut rand::thread_rng(), &mut payload[..]);
    frame.extend_from_slice(&payload);

    let mut sent: u64 = 0;
    let mut failed = false;
    while sent < sample_bytes && !*stop_rx.borrow() {
        let wait = bucket.debit(frame.len());
        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_rx.changed() => break,
            }
        }
        if let Err(e) = stream.write_all(&frame).await {
            tracing::debug!(
                "session {} reverse sample {} write failed: {}",
                session.id,
                sample_id,
                e
            );
            failed = true;
            break;
        }
        sent += payload_len as u64;
        session.record_bytes(sample_id, payload_len, Instant::now(), now_ms());
    }

    let _ = done_tx.send(ReverseDone {
        stream: if failed { None } else { Some(stream) },
        datagrams_sent: 0,
    });
}

/// Paced reverse UDP sender over the shared server socket.
#[allow(clippy::too_many_arguments)]
async fn run_reverse_udp_sender(
    session: Arc<ProbeSession>,
    sample_id: u32,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    bandwidth_bps: u64,
    sample_bytes: u64,
    dgram_len: usize,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: oneshot::Sender<ReverseDone>,
) {
    let payload_len = dgram_len - UDP_HEADER_BYTES;
    let mut bucket = TokenBucket::new(bandwidth_bps);
    let mut dgram = vec![0u8; dgram_len];
    rand::Rng::fill(&mut rand::thread_rng(), &mut dgram[UDP_HEADER_BYTES..]);

    let mut seq: u64 = 0;
    let mut sent: u64 = 0;
    while sent < sample_bytes && !*stop_rx.borrow() {
        let wait = bucket.debit(dgram_len);
        if wait > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_rx.changed() => break,
            }
        }
        let header = UdpHeader {
            kind: DGRAM_DATA,
            sample_id,
            seq,
        };
        dgram[..UDP_HEADER_BYTES].copy_from_slice(&header.encode());
        if let Err(e) = sock.send_to(&dgram, peer).await {
            tracing::debug!(
                "session {} reverse udp sample {} send failed: {}",
                session.id,
                sample_id,
                e
            );
            break;
        }
        seq += 1;
        sent += payload_len as u64;
        session.record_bytes(sample_id, payload_len, Instant::now(), now_ms());
    }

    // A few end markers so the receiver can finish early instead of
    // waiting out its deadline.
    for _ in 0..UDP_END_MARKERS {
        let header = UdpHeader {
            kind: DGRAM_END,
            sample_id,
            seq,
        };
        let _ = sock.send_to(&header.encode(), peer).await;
    }

    let _ = done_tx.send(ReverseDone {
        stream: None,
        datagrams_sent: seq,
    });
}
