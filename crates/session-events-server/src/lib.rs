//! Axum wiring for the real-time event distribution core: a WebSocket
//! upgrade endpoint backed by the Connection Manager, plus a health route for
//! pod readiness probes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use session_events_core::{ClientSink, ClientSource, EventCore};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<EventCore>,
    pub pool: PgPool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    listener_running: bool,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let listener_running = state.core.listener_handle().is_running();
    let status = if listener_running { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status,
        listener_running,
    })
}

#[instrument(skip(ws, state))]
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    info!("client websocket connected");
    state
        .core
        .connection_manager
        .handle_connection(Box::new(WsSource(stream)), Box::new(WsSink(sink)))
        .await;
    info!("client websocket disconnected");
}

struct WsSource(futures::stream::SplitStream<WebSocket>);

#[async_trait::async_trait]
impl ClientSource for WsSource {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(%err, "websocket read error");
                    return None;
                }
            }
        }
    }
}

struct WsSink(futures::stream::SplitSink<WebSocket, Message>);

#[async_trait::async_trait]
impl ClientSink for WsSink {
    async fn send(&mut self, text: String) -> bool {
        self.0.send(Message::Text(text)).await.is_ok()
    }
}
