//! WebSocket control server
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws` | Control WebSocket: JSON commands in, JSON events out |
//! | `/healthz` | Liveness check |
//!
//! Each socket gets a fresh [`ConnectionId`]. The server does not decide
//! anything itself: it forwards connects, disconnects and parsed commands to
//! the daemon and relays the events addressed to its connection.

use super::{ControlCommand, ControlRequest, Notifier};
use crate::error::PcmcastError;
use crate::gate::ConnectionId;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Clone)]
struct AppState {
    requests: mpsc::UnboundedSender<ControlRequest>,
    notifier: Notifier,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Running control server
pub struct ControlHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl ControlHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves if the server stops without being asked to
    ///
    /// Cancel safe; never resolves once the server has been reaped.
    pub async fn stopped(&mut self) -> PcmcastError {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.task = None;
        let reason = match result {
            Ok(Ok(())) => "server stopped".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("server task failed: {}", e),
        };
        PcmcastError::Control(reason)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Control server stopped with error: {}", e),
                Err(e) => tracing::warn!("Control server task join error: {}", e),
            }
        }
    }
}

/// Bind the control server and serve it in the background
pub async fn start(
    bind_addr: &str,
    requests: mpsc::UnboundedSender<ControlRequest>,
    notifier: Notifier,
) -> Result<ControlHandle, PcmcastError> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PcmcastError::Control(format!("Failed to bind {}: {}", bind_addr, e)))?;
    let addr = listener
        .local_addr()
        .map_err(|e| PcmcastError::Control(format!("Failed to read local address: {}", e)))?;

    let app = build_router(AppState { requests, notifier });
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = &result {
            tracing::error!("Control server failed: {}", e);
        }
        result
    });

    tracing::info!("Control server listening on http://{}", addr);
    Ok(ControlHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(handle_websocket))
        .with_state(state)
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let conn = ConnectionId::new();
    // Subscribe first so the greeting is not missed
    let mut events = state.notifier.subscribe();
    if state.requests.send(ControlRequest::Connected(conn)).is_err() {
        return;
    }
    tracing::debug!("Connection {} opened", conn);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(envelope) => {
                    if !envelope.is_for(conn) {
                        continue;
                    }
                    let text = match serde_json::to_string(&envelope.event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Cannot encode event: {}", e);
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Connection {} missed {} events", conn, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ControlCommand>(&text) {
                        Ok(command) => {
                            if state.requests.send(ControlRequest::Command(conn, command)).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed message from {}: {}", conn, e),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("Connection {} closed", conn);
    let _ = state.requests.send(ControlRequest::Disconnected(conn));
}
