//! The L4 data plane.
//!
//! One accept loop per TCP listener and one datagram loop per UDP
//! listener. Each new flow asks the switch controller for an upstream
//! once, pins it, and keeps it for life; a refused selection refuses the
//! flow. Byte counts feed both the flow table and the rate book.

use crate::config::{ForwarderConfig, ListenerConfig};
use crate::error::Result;
use crate::flow_table::{FlowHandle, FlowKey, FlowTable};
use crate::ratebook::RateBook;
use crate::switching::SwitchController;
use common::{Direction, Proto};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

/// Copy buffer per direction.
const COPY_BUF_BYTES: usize = 16 * 1024;

/// Maximum UDP datagram accepted from clients.
const UDP_BUF_BYTES: usize = 64 * 1024;

/// Idle sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a listener needs to run flows.
pub struct DataPlaneDeps {
    pub controller: Arc<SwitchController>,
    pub flows: Arc<FlowTable>,
    pub rates: Arc<RateBook>,
    pub cfg: ForwarderConfig,
}

/// Accept TCP flows on one listener until shutdown.
pub async fn run_tcp_listener(
    deps: Arc<DataPlaneDeps>,
    listener_cfg: ListenerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = listener_cfg
        .listen
        .parse()
        .map_err(|e| crate::error::ForwarderError::Config(format!("listener: {}", e)))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("tcp listener on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client)) => {
                        let deps = deps.clone();
                        let dst_port = listener_cfg.dst_port;
                        tokio::spawn(async move {
                            handle_tcp_flow(deps, stream, client, dst_port).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error on {}: {}", addr, e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("tcp listener on {} shutting down", addr);
                return Ok(());
            }
        }
    }
}

async fn handle_tcp_flow(
    deps: Arc<DataPlaneDeps>,
    client_stream: TcpStream,
    client: SocketAddr,
    dst_port: Option<u16>,
) {
    // Selection happens exactly once; the flow is pinned to the outcome.
    let selected = match deps.controller.select_upstream(dst_port) {
        Ok(selected) => selected,
        Err(e) => {
            tracing::warn!("refusing tcp flow from {}: {}", client, e);
            return;
        }
    };

    let key = FlowKey {
        proto: Proto::Tcp,
        client,
        dst: selected.addr,
    };
    let handle = match deps.flows.register(key.clone(), &selected.tag) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("refusing tcp flow from {}: {}", client, e);
            return;
        }
    };

    let dial = tokio::time::timeout(
        Duration::from_secs(deps.cfg.dial_timeout_secs),
        TcpStream::connect(selected.addr),
    )
    .await;
    let upstream_stream = match dial {
        Ok(Ok(stream)) => {
            deps.controller.on_dial_success(&selected.tag);
            stream
        }
        Ok(Err(e)) => {
            tracing::warn!(
                "dial {} for {} via {} failed: {}",
                selected.addr,
                client,
                selected.tag,
                e
            );
            deps.controller
                .on_dial_failure(&selected.tag, std::time::Instant::now());
            deps.flows.remove(&key);
            return;
        }
        Err(_) => {
            tracing::warn!(
                "dial {} for {} via {} timed out",
                selected.addr,
                client,
                selected.tag
            );
            deps.controller
                .on_dial_failure(&selected.tag, std::time::Instant::now());
            deps.flows.remove(&key);
            return;
        }
    };

    tracing::debug!(
        "tcp flow {} -> {} pinned to {}",
        client,
        selected.addr,
        selected.tag
    );

    let handle = Arc::new(handle);
    let tag = selected.tag.clone();
    let (mut client_read, mut client_write) = client_stream.into_split();
    let (mut upstream_read, mut upstream_write) = upstream_stream.into_split();

    let up_deps = deps.clone();
    let up_handle = handle.clone();
    let up_tag = tag.clone();
    let upstream_copy = async move {
        copy_counted(&mut client_read, &mut upstream_write, |n| {
            up_handle.add_up(n as u64);
            up_deps.rates.add_bytes(&up_tag, n as u64, Proto::Tcp, Direction::Up);
        })
        .await
    };

    let down_deps = deps.clone();
    let down_handle = handle.clone();
    let down_tag = tag.clone();
    let downstream_copy = async move {
        copy_counted(&mut upstream_read, &mut client_write, |n| {
            down_handle.add_down(n as u64);
            down_deps
                .rates
                .add_bytes(&down_tag, n as u64, Proto::Tcp, Direction::Down);
        })
        .await
    };

    let mut close_rx = handle.close_rx.clone();
    tokio::select! {
        _ = upstream_copy => {}
        _ = downstream_copy => {}
        _ = close_rx.changed() => {
            tracing::debug!("tcp flow {} closed by controller", client);
        }
    }

    deps.flows.remove(&key);
    tracing::debug!("tcp flow {} via {} ended", client, tag);
}

/// Copy until EOF or error, reporting every chunk.
async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, mut on_chunk: F) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
    F: FnMut(usize),
{
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        on_chunk(n);
        total += n as u64;
    }
}

struct UdpFlow {
    upstream_sock: Arc<UdpSocket>,
    handle: Arc<FlowHandle>,
}

/// Serve UDP flows on one listener socket until shutdown. Each distinct
/// client address becomes one flow with its own upstream socket.
pub async fn run_udp_listener(
    deps: Arc<DataPlaneDeps>,
    listener_cfg: ListenerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = listener_cfg
        .listen
        .parse()
        .map_err(|e| crate::error::ForwarderError::Config(format!("listener: {}", e)))?;
    let sock = Arc::new(UdpSocket::bind(addr).await?);
    tracing::info!("udp listener on {}", addr);

    let flows: Arc<parking_lot::Mutex<HashMap<SocketAddr, UdpFlow>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; UDP_BUF_BYTES];

    loop {
        let (len, client) = tokio::select! {
            received = sock.recv_from(&mut buf) => {
                match received {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("udp recv error on {}: {}", addr, e);
                        continue;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("udp listener on {} shutting down", addr);
                return Ok(());
            }
        };

        let existing = flows.lock().get(&client).map(|f| {
            (f.upstream_sock.clone(), f.handle.clone())
        });
        let (upstream_sock, handle) = match existing {
            Some(flow) => flow,
            None => match open_udp_flow(&deps, &sock, &flows, client, listener_cfg.dst_port).await {
                Some(flow) => flow,
                None => continue,
            },
        };

        match upstream_sock.send(&buf[..len]).await {
            Ok(_) => {
                handle.add_up(len as u64);
                deps.rates
                    .add_bytes(&handle.upstream_tag, len as u64, Proto::Udp, Direction::Up);
            }
            Err(e) => {
                tracing::debug!("udp forward for {} failed: {}", client, e);
            }
        }
    }
}

/// Create the upstream socket and return path for a new UDP 5-tuple.
async fn open_udp_flow(
    deps: &Arc<DataPlaneDeps>,
    listener_sock: &Arc<UdpSocket>,
    flows: &Arc<parking_lot::Mutex<HashMap<SocketAddr, UdpFlow>>>,
    client: SocketAddr,
    dst_port: Option<u16>,
) -> Option<(Arc<UdpSocket>, Arc<FlowHandle>)> {
    let selected = match deps.controller.select_upstream(dst_port) {
        Ok(selected) => selected,
        Err(e) => {
            tracing::warn!("refusing udp flow from {}: {}", client, e);
            return None;
        }
    };

    let key = FlowKey {
        proto: Proto::Udp,
        client,
        dst: selected.addr,
    };
    let handle = match deps.flows.register(key.clone(), &selected.tag) {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            tracing::warn!("refusing udp flow from {}: {}", client, e);
            return None;
        }
    };

    let bind: SocketAddr = if selected.addr.is_ipv6() {
        "[::]:0".parse().ok()?
    } else {
        "0.0.0.0:0".parse().ok()?
    };
    let upstream_sock = match UdpSocket::bind(bind).await {
        Ok(sock) => Arc::new(sock),
        Err(e) => {
            tracing::warn!("udp bind for {} failed: {}", client, e);
            deps.flows.remove(&key);
            return None;
        }
    };
    if let Err(e) = upstream_sock.connect(selected.addr).await {
        tracing::warn!("udp connect {} failed: {}", selected.addr, e);
        deps.controller
            .on_dial_failure(&selected.tag, std::time::Instant::now());
        deps.flows.remove(&key);
        return None;
    }
    deps.controller.on_dial_success(&selected.tag);

    tracing::debug!(
        "udp flow {} -> {} pinned to {}",
        client,
        selected.addr,
        selected.tag
    );

    flows.lock().insert(
        client,
        UdpFlow {
            upstream_sock: upstream_sock.clone(),
            handle: handle.clone(),
        },
    );

    // Return path: upstream datagrams go back to this client until the
    // flow is closed or expires.
    let deps = deps.clone();
    let flows = flows.clone();
    let listener_sock = listener_sock.clone();
    let return_sock = upstream_sock.clone();
    let return_handle = handle.clone();
    tokio::spawn(async move {
        let mut close_rx = return_handle.close_rx.clone();
        let mut buf = vec![0u8; UDP_BUF_BYTES];
        loop {
            tokio::select! {
                received = return_sock.recv(&mut buf) => {
                    match received {
                        Ok(len) => {
                            if let Err(e) = listener_sock.send_to(&buf[..len], client).await {
                                tracing::debug!("udp return to {} failed: {}", client, e);
                                break;
                            }
                            return_handle.add_down(len as u64);
                            deps.rates.add_bytes(
                                &return_handle.upstream_tag,
                                len as u64,
                                Proto::Udp,
                                Direction::Down,
                            );
                        }
                        Err(e) => {
                            tracing::debug!("udp upstream recv for {} failed: {}", client, e);
                            break;
                        }
                    }
                }
                _ = close_rx.changed() => {
                    tracing::debug!("udp flow {} closed", client);
                    break;
                }
            }
        }
        flows.lock().remove(&client);
        deps.flows.remove(&return_handle.key);
    });

    Some((upstream_sock, handle))
}

/// Expire idle flows periodically.
pub async fn run_idle_sweeper(deps: Arc<DataPlaneDeps>, mut shutdown: broadcast::Receiver<()>) {
    let tcp_idle_ms = deps.cfg.tcp_idle_secs * 1000;
    let udp_idle_ms = deps.cfg.udp_idle_secs * 1000;
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let expired = deps.flows.expire_idle(bwprobe::now_ms(), tcp_idle_ms, udp_idle_ms);
                if expired > 0 {
                    tracing::info!("expired {} idle flows", expired);
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig, UpstreamConfig};
    use crate::events::EventBus;
    use crate::upstream::UpstreamManager;

    async fn echo_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        (addr, task)
    }

    async fn rig_with_upstream(addr: SocketAddr) -> (Arc<DataPlaneDeps>, Arc<UpstreamManager>) {
        let events = EventBus::new();
        let manager = Arc::new(
            UpstreamManager::new(
                vec![UpstreamConfig {
                    tag: "echo".to_string(),
                    host: addr.to_string(),
                    measure_host: None,
                    measure_port: 9876,
                    priority: 0,
                    bias: 0.0,
                }],
                ScoringConfig::default(),
                events.clone(),
            )
            .unwrap(),
        );
        manager.resolve_all().await;
        let flows = Arc::new(FlowTable::new(64));
        let controller = Arc::new(SwitchController::new(
            SwitchingConfig::default(),
            manager.clone(),
            flows.clone(),
            events,
        ));
        let rates = Arc::new(RateBook::new(["echo".to_string()]));
        (
            Arc::new(DataPlaneDeps {
                controller,
                flows,
                rates,
                cfg: ForwarderConfig::default(),
            }),
            manager,
        )
    }

    #[tokio::test]
    async fn test_tcp_forward_roundtrip() {
        let (echo_addr, _echo) = echo_server().await;
        let (deps, _manager) = rig_with_upstream(echo_addr).await;

        let listener_cfg = ListenerConfig {
            listen: "127.0.0.1:0".to_string(),
            proto: "tcp".to_string(),
            dst_port: None,
        };
        // Bind ourselves so the test knows the port, then run the accept
        // loop by hand the way run_tcp_listener does.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let accept_deps = deps.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, client)) = listener.accept().await else {
                    return;
                };
                let deps = accept_deps.clone();
                let dst_port = listener_cfg.dst_port;
                tokio::spawn(async move {
                    handle_tcp_flow(deps, stream, client, dst_port).await;
                });
            }
        });

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"ping through the relay").await.unwrap();
        let mut reply = vec![0u8; 22];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
            .await
            .expect("echo deadline")
            .expect("echo read");
        assert_eq!(&reply, b"ping through the relay");

        // The flow is registered and pinned while alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snaps = deps.flows.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].upstream_tag, "echo");
        assert!(snaps[0].bytes_up >= 22);
        assert!(snaps[0].bytes_down >= 22);

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(deps.flows.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_reported() {
        // An upstream address nobody listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let (deps, manager) = rig_with_upstream(dead_addr).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let accept_deps = deps.clone();
        tokio::spawn(async move {
            let Ok((stream, client)) = listener.accept().await else {
                return;
            };
            handle_tcp_flow(accept_deps, stream, client, None).await;
        });

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        // The relay drops the connection after the failed dial.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), client.read(&mut buf))
            .await
            .expect("close deadline")
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deps.flows.is_empty());
        let snap = &manager.snapshot(None)[0];
        assert!(snap.consecutive_dial_failures >= 1);
    }

    #[tokio::test]
    async fn test_udp_forward_roundtrip() {
        // UDP echo upstream.
        let upstream = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let upstream_addr = upstream.local_addr().unwrap();
        let echo = upstream.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((len, peer)) = echo.recv_from(&mut buf).await else {
                    return;
                };
                let _ = echo.send_to(&buf[..len], peer).await;
            }
        });

        let (deps, _manager) = rig_with_upstream(upstream_addr).await;
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener_cfg = ListenerConfig {
            listen: "127.0.0.1:0".to_string(),
            proto: "udp".to_string(),
            dst_port: None,
        };
        // Bind first so the port is known.
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = sock.local_addr().unwrap();
        drop(sock);
        let cfg = ListenerConfig {
            listen: listen_addr.to_string(),
            ..listener_cfg
        };
        let run_deps = deps.clone();
        tokio::spawn(async move {
            let _ = run_udp_listener(run_deps, cfg, shutdown_tx.subscribe()).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        client.send(b"udp ping").await.unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .expect("udp echo deadline")
            .expect("udp recv");
        assert_eq!(&buf[..len], b"udp ping");

        let (tcp_flows, udp_flows) = deps.flows.counts();
        assert_eq!((tcp_flows, udp_flows), (0, 1));
    }
}
