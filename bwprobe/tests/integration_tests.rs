//! Integration tests for the probe server and engine over loopback.

use bwprobe::{ProbeConfig, ProbeEngine, ProbeServer, ProbeServerConfig};
use common::{
    ErrorCode, HelloParams, HelloResult, Proto, SampleStartParams, SampleStartResult,
    SampleStopParams, SampleStopResult, UdpRegisterParams,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn test_server_config() -> ProbeServerConfig {
    ProbeServerConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// Start a server on an ephemeral port and wait until it is listening.
async fn start_server(config: ProbeServerConfig) -> (Arc<ProbeServer>, SocketAddr) {
    let server = Arc::new(ProbeServer::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            eprintln!("probe server error: {}", e);
        }
    });

    for _ in 0..100 {
        if let Some(addr) = server.local_addr() {
            return (server, addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("probe server did not bind");
}

async fn rpc_client(addr: SocketAddr) -> bwprobe::rpc::RpcClient {
    bwprobe::rpc::RpcClient::connect(addr, Duration::from_secs(3), Duration::from_secs(10))
        .await
        .expect("control connect")
}

async fn open_session(rpc: &bwprobe::rpc::RpcClient) -> HelloResult {
    rpc.call_as("session.hello", &HelloParams::default())
        .await
        .expect("hello")
}

fn start_params(session_id: &str, sample_id: u32, network: &str) -> SampleStartParams {
    SampleStartParams {
        session_id: session_id.to_string(),
        sample_id,
        network: network.to_string(),
        sample_bytes: 100_000,
        bandwidth_bps: 10_000_000,
        chunk_bytes: 8192,
    }
}

#[tokio::test]
async fn test_server_starts_with_no_sessions() {
    let (server, _addr) = start_server(test_server_config()).await;
    assert_eq!(server.session_count().await, 0);
    server.shutdown();
}

#[tokio::test]
async fn test_forward_tcp_probe() {
    let (server, addr) = start_server(test_server_config()).await;

    let config = ProbeConfig {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        network: Proto::Tcp,
        bandwidth_bps: 40_000_000,
        reverse: false,
        samples: 2,
        sample_bytes: 200_000,
        chunk_bytes: 8192,
        sample_wait: Duration::from_millis(50),
        ..Default::default()
    };
    let engine = ProbeEngine::new(config).unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let results = tokio::time::timeout(Duration::from_secs(30), engine.run(stop_rx))
        .await
        .expect("probe run deadline")
        .expect("probe run");

    assert_eq!(results.network, Proto::Tcp);
    assert!(!results.reverse);
    assert_eq!(results.samples, 2);
    // Both samples should have fully drained on loopback.
    assert!(
        results.total_bytes >= 400_000,
        "only {} bytes accounted",
        results.total_bytes
    );
    assert!(results.trimmed_mean_bps > 0.0);
    assert!(results.peak_1s_bps > 0.0);
    assert!(results.rtt.samples > 0);
    assert!(results.retrans_rate.is_some());

    // The engine closes its session on the way out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count().await, 0);
    server.shutdown();
}

#[tokio::test]
async fn test_reverse_udp_probe() {
    let (server, addr) = start_server(test_server_config()).await;

    let config = ProbeConfig {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        network: Proto::Udp,
        bandwidth_bps: 10_000_000,
        reverse: true,
        samples: 1,
        sample_bytes: 100_000,
        chunk_bytes: 1200,
        sample_wait: Duration::from_millis(50),
        ..Default::default()
    };
    let engine = ProbeEngine::new(config).unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let results = tokio::time::timeout(Duration::from_secs(30), engine.run(stop_rx))
        .await
        .expect("probe run deadline")
        .expect("probe run");

    assert_eq!(results.network, Proto::Udp);
    assert!(results.reverse);
    assert_eq!(results.samples, 1);
    assert!(results.total_bytes > 0);
    let loss = results.loss_rate.expect("udp loss rate");
    assert!(loss <= 0.1, "loss {} on loopback", loss);
    let received = results.packets_received.expect("packets received");
    let lost = results.packets_lost.expect("packets lost");
    assert!(received > 0);
    // Everything the client saw is accounted as received or lost.
    assert!(received + lost >= received);
    server.shutdown();
}

#[tokio::test]
async fn test_second_sample_start_rejected() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;
    let hello = open_session(&rpc).await;

    let _: SampleStartResult = rpc
        .call_as("sample.start", &start_params(&hello.session_id, 1, "tcp"))
        .await
        .expect("first start");

    let err = rpc
        .call_as::<_, SampleStartResult>("sample.start", &start_params(&hello.session_id, 2, "tcp"))
        .await
        .expect_err("second start must fail");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::SampleAlreadyActive.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Stopping the active sample frees the slot again.
    let _: SampleStopResult = rpc
        .call_as(
            "sample.stop",
            &SampleStopParams {
                session_id: hello.session_id.clone(),
                sample_id: 1,
                udp_recv: None,
            },
        )
        .await
        .expect("stop");
    let _: SampleStartResult = rpc
        .call_as("sample.start", &start_params(&hello.session_id, 2, "tcp"))
        .await
        .expect("start after stop");
    server.shutdown();
}

#[tokio::test]
async fn test_stop_validates_sample_id() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;
    let hello = open_session(&rpc).await;

    let err = rpc
        .call_as::<_, SampleStopResult>(
            "sample.stop",
            &SampleStopParams {
                session_id: hello.session_id.clone(),
                sample_id: 1,
                udp_recv: None,
            },
        )
        .await
        .expect_err("stop without start");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::SampleNotFound.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let _: SampleStartResult = rpc
        .call_as("sample.start", &start_params(&hello.session_id, 5, "tcp"))
        .await
        .expect("start");
    let err = rpc
        .call_as::<_, SampleStopResult>(
            "sample.stop",
            &SampleStopParams {
                session_id: hello.session_id.clone(),
                sample_id: 6,
                udp_recv: None,
            },
        )
        .await
        .expect_err("stop with wrong id");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::SampleIdMismatch.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_udp_register_requires_recent_ping() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;
    let hello = open_session(&rpc).await;

    let err = rpc
        .call_as::<_, serde_json::Value>(
            "udp.register",
            &UdpRegisterParams {
                session_id: hello.session_id.clone(),
                addr: "127.0.0.1:1".to_string(),
            },
        )
        .await
        .expect_err("register without ping");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::UdpNotRegistered.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_reverse_without_data_connection() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;
    let hello = open_session(&rpc).await;

    let err = rpc
        .call_as::<_, SampleStartResult>(
            "sample.start_reverse",
            &start_params(&hello.session_id, 1, "tcp"),
        )
        .await
        .expect_err("reverse without data connection");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::ReverseNotAvailable.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The failed claim must not leave the sample slot occupied.
    let _: SampleStartResult = rpc
        .call_as("sample.start", &start_params(&hello.session_id, 1, "tcp"))
        .await
        .expect("forward start after failed reverse");
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_session_rejected() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;

    let err = rpc
        .call_as::<_, SampleStartResult>("sample.start", &start_params("no-such-session", 1, "tcp"))
        .await
        .expect_err("unknown session");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::InvalidSession.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    server.shutdown();
}

#[tokio::test]
async fn test_unknown_method_rejected() {
    let (server, addr) = start_server(test_server_config()).await;
    let rpc = rpc_client(addr).await;

    let err = rpc
        .call("sample.fnord", serde_json::json!({}))
        .await
        .expect_err("unknown method");
    match err {
        bwprobe::ProbeError::Rpc { code, .. } => {
            assert_eq!(code, ErrorCode::MethodNotFound.code());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    server.shutdown();
}
