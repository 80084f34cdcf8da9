//! WebSocket control server for watchers.
//!
//! `GET /` upgrades to a WebSocket carrying JSON [`ClientRequest`]s and
//! [`ServerMessage`]s; `GET /jobs` returns the job list as plain JSON. The
//! server never touches jobs itself: every request becomes an engine command,
//! and engine events are fanned out to the connections that subscribed.

use crate::engine::{EngineError, EngineHandle};
use crate::events::ServerEvent;
use crate::jobs::JobProperties;
use crate::protocol::{ClientRequest, ServerMessage, ServerReply, PING, PONG};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

struct Connection {
    sender: mpsc::UnboundedSender<Message>,
    subscribed: bool,
}

/// Connected clients and which of them receive broadcasts.
#[derive(Default)]
pub struct Clients {
    connections: RwLock<HashMap<u64, Connection>>,
    next_id: AtomicU64,
}

impl Clients {
    async fn add(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            id,
            Connection {
                sender: tx,
                subscribed: false,
            },
        );
        (id, rx)
    }

    async fn remove(&self, id: u64) {
        self.connections.write().await.remove(&id);
    }

    async fn set_subscribed(&self, id: u64, subscribed: bool) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.subscribed = subscribed;
        }
    }

    async fn send_to(&self, id: u64, message: Message) {
        if let Some(conn) = self.connections.read().await.get(&id) {
            let _ = conn.sender.send(message);
        }
    }

    /// Send to every subscriber; closed channels are cleaned up by their own loop.
    async fn broadcast(&self, message: Message) {
        for conn in self.connections.read().await.values() {
            if conn.subscribed {
                let _ = conn.sender.send(message.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.subscribed)
            .count()
    }
}

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    clients: Arc<Clients>,
    close_requested: CancellationToken,
    stop: CancellationToken,
}

pub struct ControlServer {
    state: AppState,
}

impl ControlServer {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            state: AppState {
                engine,
                clients: Arc::new(Clients::default()),
                close_requested: CancellationToken::new(),
                stop: CancellationToken::new(),
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/jobs", get(get_jobs))
            .with_state(self.state.clone())
    }

    pub fn clients(&self) -> Arc<Clients> {
        self.state.clients.clone()
    }

    /// Cancelled when a client sends `close-server`.
    pub fn close_requested(&self) -> CancellationToken {
        self.state.close_requested.clone()
    }

    /// Cancel to stop accepting connections and drop the open ones.
    pub fn stop_token(&self) -> CancellationToken {
        self.state.stop.clone()
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Serve until the stop token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Control server listening");
        }
        let forwarder = tokio::spawn(forward_events(
            self.state.engine.subscribe(),
            self.state.clients.clone(),
            self.state.stop.clone(),
        ));
        let stop = self.state.stop.clone();
        let app = self.router();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        forwarder.abort();
        info!("Control server stopped");
        result.map_err(ServerError::Io)
    }
}

/// Handler for GET /jobs
async fn get_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobProperties>>, StatusCode> {
    state
        .engine
        .jobs_info()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut rx) = state.clients.add().await;
    debug!(client = id, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text.trim() == PING {
                        state.clients.send_to(id, Message::Text(PONG.to_string())).await;
                        continue;
                    }
                    let reply = match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(request) => handle_request(&state, id, request).await,
                        Err(e) => {
                            debug!(client = id, error = %e, "Malformed request");
                            ServerReply::error(format!("Malformed request: {}", e))
                        }
                    };
                    send_json(&state.clients, id, &ServerMessage::Reply(reply)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = id, error = %e, "WebSocket receive error");
                    break;
                }
            },
            _ = state.stop.cancelled() => break,
        }
    }

    state.clients.remove(id).await;
    // let queued replies drain before the sink goes away
    let _ = send_task.await;
    debug!(client = id, "Client disconnected");
}

async fn handle_request(state: &AppState, client: u64, request: ClientRequest) -> ServerReply {
    let engine = &state.engine;
    let ok = ServerReply::ok(&request);
    let result: Result<ServerReply, EngineError> = match request {
        ClientRequest::GetJobsInfo => engine
            .jobs_info()
            .await
            .map(|jobs| ServerReply::JobsInfo { jobs }),
        ClientRequest::Subscribe => {
            state.clients.set_subscribed(client, true).await;
            Ok(ok)
        }
        ClientRequest::Unsubscribe => {
            state.clients.set_subscribed(client, false).await;
            Ok(ok)
        }
        ClientRequest::CreateJob { job } => engine
            .create_job(job)
            .await
            .map(|job| ServerReply::Created { job }),
        ClientRequest::ChangeJob { job } => engine.change_job(job).await.map(|_| ok),
        ClientRequest::SwapJobs { first, second } => {
            engine.swap_jobs(first, second).await.map(|_| ok)
        }
        ClientRequest::DeleteJobs { ids } => engine.delete_jobs(ids).await.map(|_| ok),
        ClientRequest::StartWaitingJobs => engine.start_waiting_jobs().await.map(|_| ok),
        ClientRequest::PauseActiveJobs => engine.pause_active_jobs().await.map(|_| ok),
        ClientRequest::ResumePausedJobs => engine.resume_paused_jobs().await.map(|_| ok),
        ClientRequest::AbortActiveJobs => engine.abort_active_jobs().await.map(|_| ok),
        ClientRequest::ResetJobs { ids } => engine.reset_jobs(ids).await.map(|_| ok),
        ClientRequest::GetPresets => engine
            .presets()
            .await
            .map(|presets| ServerReply::Presets { presets }),
        ClientRequest::SavePreset { preset } => engine.save_preset(preset).await.map(|_| ok),
        ClientRequest::DeletePreset { name } => engine.delete_preset(name).await.map(|_| ok),
        ClientRequest::ShowWindow => {
            engine.publish(ServerEvent::ShowWindow);
            Ok(ok)
        }
        ClientRequest::CloseServer => {
            info!(client, "Close requested by client");
            state.close_requested.cancel();
            Ok(ok)
        }
    };
    result.unwrap_or_else(|e| ServerReply::error(e.to_string()))
}

async fn send_json(clients: &Clients, id: u64, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(text) => clients.send_to(id, Message::Text(text)).await,
        Err(e) => warn!(error = %e, "Failed to serialize reply"),
    }
}

/// Relay engine events to subscribed clients, in publish order.
async fn forward_events(
    mut events: broadcast::Receiver<ServerEvent>,
    clients: Arc<Clients>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = stop.cancelled() => return,
        };
        match event {
            Ok(event) => match serde_json::to_string(&ServerMessage::Event(event)) {
                Ok(text) => clients.broadcast(Message::Text(text)).await,
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, watchers missed events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
