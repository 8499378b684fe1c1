use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::channel::{BroadcastChannel, Envelope};
use crate::dispatcher::Dispatcher;
use crate::models::{StatsPayload, WorkerSnapshot};
use crate::stats::ChannelCounters;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub channel: Arc<BroadcastChannel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: StatsPayload,
    pub counters: ChannelCounters,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.dispatcher.registry();
    let stats = state.dispatcher.stats();
    Json(StatsResponse {
        stats: stats.snapshot(registry.len().await),
        counters: stats.counters(),
    })
}

pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.dispatcher.registry().list().await)
}

/// Accepts a command on `<topic>`; replies go out on the channel.
pub async fn post_command(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> StatusCode {
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        dispatcher.handle(&topic, &body).await;
    });
    StatusCode::ACCEPTED
}

pub async fn channel_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn payload_bytes(payload: &serde_json::Value) -> Vec<u8> {
    match payload {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::String(s) => s.clone().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.channel.subscribe();
    let closed = state.channel.closed();
    debug!("Control channel client connected");

    let dispatcher = Arc::clone(&state.dispatcher);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            dispatcher
                                .handle(&envelope.topic, &payload_bytes(&envelope.payload))
                                .await;
                        });
                    }
                    Err(e) => warn!("Malformed control frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            _ = &mut recv_task => {
                debug!("Control channel client disconnected");
                break;
            }
            event = outbound.recv() => match event {
                Ok(envelope) => {
                    let json = match serde_json::to_string(&envelope) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize envelope: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(json)).await {
                        warn!("Failed to send envelope: {}", e);
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Control channel client lagged by {} messages", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
    recv_task.abort();
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/workers", get(list_workers))
        .route("/api/command/*topic", post(post_command))
        .route("/ws", get(channel_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(port: u16, state: AppState) -> Result<()> {
    let closed = state.channel.closed();
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {}", port))?;
    info!("Control channel: http://localhost:{} (ws: /ws)", addr.port());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { closed.cancelled().await })
        .await
        .context("API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelSink;
    use crate::prober::testing::ManualProberFactory;
    use crate::registry::Registry;
    use crate::stats::ProcessStats;
    use crate::worker::WorkerSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let channel = Arc::new(BroadcastChannel::new());
        let stats = Arc::new(ProcessStats::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new(
            WorkerSettings::default(),
            Arc::new(ManualProberFactory::default()),
            tx,
        ));
        let sink = Arc::new(ChannelSink::new(channel.clone(), "netpulse", stats.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry, channel.clone(), sink, stats, "netpulse"));
        AppState { dispatcher, channel }
    }

    #[test]
    fn test_payload_bytes() {
        assert!(payload_bytes(&serde_json::Value::Null).is_empty());
        assert_eq!(payload_bytes(&serde_json::json!({"seq": 1})), b"{\"seq\":1}".to_vec());
        assert_eq!(payload_bytes(&serde_json::json!("{\"seq\":2}")), b"{\"seq\":2}".to_vec());
    }

    #[tokio::test]
    async fn test_command_route_dispatches() {
        let state = state();
        let mut rx = state.channel.subscribe();
        let app = create_router(state.clone());

        let rsp = app
            .oneshot(
                Request::post("/api/command/netpulse/10.0.0.5/add")
                    .body(Body::from("{\"seq\":5}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::ACCEPTED);

        let ack = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.topic, "netpulse/10.0.0.5/rsp");
        assert_eq!(ack.payload["message"], "added");
        assert_eq!(ack.payload["seq"], 5);
    }

    #[tokio::test]
    async fn test_stats_route() {
        let state = state();
        let app = create_router(state);

        let rsp = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["workerCount"], 0);
        assert_eq!(json["counters"]["received"], 0);
    }

    #[tokio::test]
    async fn test_workers_route_lists_snapshots() {
        let state = state();
        state
            .dispatcher
            .handle("netpulse/10.0.0.5/add", b"")
            .await;
        let app = create_router(state);

        let rsp = app
            .oneshot(Request::get("/api/workers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json[0]["target"], "10.0.0.5");
        assert_eq!(json[0]["status"], "unknown");
        assert_eq!(json[0]["valid"], true);
    }
}
