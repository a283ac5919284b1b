//! HTTP status API.
//!
//! Read-only views of the forwarder's state plus the mode switch. Bind
//! failure is logged, not fatal; the data plane does not depend on the
//! API.

use crate::config::ApiConfig;
use crate::events::EventBus;
use crate::flow_table::FlowTable;
use crate::scheduler::MeasurementScheduler;
use crate::switching::{Mode, SwitchController};
use crate::upstream::UpstreamManager;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use common::{Event, FlowSnapshot, SetModeRequest, StatusSnapshot};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<SwitchController>,
    pub manager: Arc<UpstreamManager>,
    pub flows: Arc<FlowTable>,
    pub scheduler: Arc<MeasurementScheduler>,
    pub events: EventBus,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    let active_tag = state.controller.active_tag();
    let (tcp_flows, udp_flows) = state.flows.counts();
    Json(StatusSnapshot {
        mode: state.controller.mode().as_str().to_string(),
        warmup: state.controller.in_warmup(Instant::now()),
        skipped_measurements: state.scheduler.skipped(),
        tcp_flows,
        udp_flows,
        upstreams: state.manager.snapshot(active_tag.as_deref()),
        active_tag,
    })
}

async fn flows(State(state): State<ApiState>) -> Json<Vec<FlowSnapshot>> {
    Json(state.flows.snapshot())
}

async fn events(State(state): State<ApiState>) -> Json<Vec<Event>> {
    Json(state.events.recent())
}

async fn metrics(State(state): State<ApiState>) -> String {
    let Json(snapshot) = status(State(state)).await;
    crate::metrics::render_prometheus(&snapshot)
}

async fn set_mode(
    State(state): State<ApiState>,
    Json(request): Json<SetModeRequest>,
) -> impl IntoResponse {
    let mode = match (request.mode.as_str(), request.tag) {
        ("auto", _) => Mode::Auto,
        ("manual", Some(tag)) => Mode::Manual(tag),
        ("manual", None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "manual mode requires a tag".to_string(),
                }),
            )
                .into_response()
        }
        (other, _) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown mode {}", other),
                }),
            )
                .into_response()
        }
    };

    match state.controller.set_mode(mode) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/flows", get(flows))
        .route("/api/events", get(events))
        .route("/api/mode", post(set_mode))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until shutdown. Never fatal.
pub async fn run_api(cfg: ApiConfig, state: ApiState, mut shutdown: broadcast::Receiver<()>) {
    let addr = match format!("{}:{}", cfg.host, cfg.port).parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("invalid api address {}:{}: {}", cfg.host, cfg.port, e);
            return;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("api bind on {} failed: {}", addr, e);
            return;
        }
    };
    tracing::info!("status api listening on {}", addr);

    let app = router(state);
    let served = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    });
    if let Err(e) = served.await {
        tracing::error!("api server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig, UpstreamConfig, MeasurementConfig};

    fn state() -> ApiState {
        let events = EventBus::new();
        let manager = Arc::new(
            UpstreamManager::new(
                vec![UpstreamConfig {
                    tag: "a".to_string(),
                    host: "10.0.0.1:8000".to_string(),
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
        let flows = Arc::new(FlowTable::new(16));
        let controller = Arc::new(SwitchController::new(
            SwitchingConfig::default(),
            manager.clone(),
            flows.clone(),
            events.clone(),
        ));
        ApiState {
            controller,
            manager,
            flows,
            scheduler: Arc::new(MeasurementScheduler::new(MeasurementConfig::default())),
            events,
        }
    }

    #[tokio::test]
    async fn test_status_snapshot_shape() {
        let state = state();
        let Json(snapshot) = status(State(state)).await;
        assert_eq!(snapshot.mode, "auto");
        assert_eq!(snapshot.active_tag.as_deref(), Some("a"));
        assert_eq!(snapshot.upstreams.len(), 1);
        assert!(snapshot.upstreams[0].active);
    }

    #[tokio::test]
    async fn test_set_mode_validation() {
        let state = state();
        let response = set_mode(
            State(state.clone()),
            Json(SetModeRequest {
                mode: "manual".to_string(),
                tag: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = set_mode(
            State(state.clone()),
            Json(SetModeRequest {
                mode: "manual".to_string(),
                tag: Some("a".to_string()),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.controller.mode().as_str(), "manual");
    }
}
