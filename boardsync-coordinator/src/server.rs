//! Event router and broadcaster: per-connection WebSocket ingress,
//! validation dispatch, global and private fan-out, offline-log replay, and
//! the read-only HTTP surface.
//!
//! The router is transport-thin. Per connection it binds incoming events to
//! handlers and nothing else; every handler's first act is payload
//! validation, and invalid payloads are answered privately without ever
//! touching board state.
//!
//! Connection lifecycle: the first frame must be a `Hello`; the server then
//! assigns a connection id, registers presence, sends a private
//! `BoardSnapshot`, and announces the newcomer to everyone else. On
//! disconnect the presence entry is removed and the updated participant
//! list is broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::http::{HeaderValue, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use boardsync_proto::codec;
use boardsync_proto::event::{
    ClientEvent, ErrorCode, Hello, MoveTask, PresenceUpdate, QueuedOp, ServerEvent,
    ValidationError,
};
use boardsync_proto::task::{Task, TaskId};

use crate::cache::AuthoritativeCache;
use crate::conflict;
use crate::flush::FlushQueue;
use crate::lock::{Acquire, LOCK_TTL, LockManager};
use crate::now_ms;
use crate::presence::PresenceRegistry;
use crate::service::{Actor, ServiceError, TaskService};
use crate::storage::TaskStore;

/// Shared coordinator state: the connection registry plus every board
/// component, wired once at startup and passed to services as a dependency.
pub struct BoardState {
    /// Maps connection id to the channel feeding its WebSocket writer.
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    /// Task mutation logic.
    pub service: TaskService,
    /// Authoritative hot store.
    pub cache: Arc<AuthoritativeCache>,
    /// Per-task advisory locks.
    pub locks: LockManager,
    /// Live participant registry.
    pub presence: PresenceRegistry,
    /// Write-behind queue (shared with the service).
    pub flush: FlushQueue,
    /// Durable storage, used directly only for audit rows.
    pub store: Arc<dyn TaskStore>,
}

impl BoardState {
    /// Wires up the full component graph over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_flush_delay(store, crate::flush::FLUSH_DELAY)
    }

    /// Same as [`BoardState::new`] with a custom flush debounce (tests).
    #[must_use]
    pub fn with_flush_delay(store: Arc<dyn TaskStore>, delay: std::time::Duration) -> Self {
        let cache = Arc::new(AuthoritativeCache::new(Arc::clone(&store)));
        let flush = FlushQueue::with_delay(Arc::clone(&cache), Arc::clone(&store), delay);
        let service = TaskService::new(Arc::clone(&cache), flush.clone());
        Self {
            connections: RwLock::new(HashMap::new()),
            service,
            cache,
            locks: LockManager::new(),
            presence: PresenceRegistry::new(),
            flush,
            store,
        }
    }

    /// Registers a connection, storing the sender half of its channel.
    pub async fn register(
        &self,
        user_id: &str,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.insert(user_id.to_string(), sender)
    }

    /// Removes a connection, returning the sender if it existed.
    pub async fn unregister(&self, user_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let mut conns = self.connections.write().await;
        conns.remove(user_id)
    }

    /// Sends an event privately to one connection.
    pub async fn send_to(&self, user_id: &str, event: &ServerEvent) {
        let conns = self.connections.read().await;
        if let Some(sender) = conns.get(user_id)
            && let Ok(bytes) = codec::encode_server(event)
        {
            let _ = sender.send(Message::Binary(bytes.into()));
        }
    }

    /// Broadcasts an event to every connection.
    pub async fn broadcast(&self, event: &ServerEvent) {
        self.fan_out(event, None).await;
    }

    /// Broadcasts an event to every connection except one.
    pub async fn broadcast_except(&self, skip_user_id: &str, event: &ServerEvent) {
        self.fan_out(event, Some(skip_user_id)).await;
    }

    async fn fan_out(&self, event: &ServerEvent, skip: Option<&str>) {
        let Ok(bytes) = codec::encode_server(event) else {
            tracing::error!("failed to encode broadcast event");
            return;
        };
        let bytes = axum::body::Bytes::from(bytes);
        let conns = self.connections.read().await;
        for (user_id, sender) in conns.iter() {
            if skip == Some(user_id.as_str()) {
                continue;
            }
            let _ = sender.send(Message::Binary(bytes.clone()));
        }
    }
}

/// Dispatches one decoded client event through the handler chain.
///
/// Exposed so embedders and tests can drive the router without a socket;
/// the WebSocket reader loop calls exactly this.
pub async fn dispatch(state: &Arc<BoardState>, user_id: &str, event: ClientEvent) {
    match event {
        ClientEvent::Hello(_) => {
            tracing::warn!(user = %user_id, "duplicate hello from registered connection");
        }
        ClientEvent::PresenceUpdate(payload) => {
            handle_presence_update(state, user_id, payload).await;
        }
        ClientEvent::ReplayOps(ops) => {
            handle_replay(state, user_id, ops).await;
        }
        task_event => {
            handle_task_event(state, user_id, task_event).await;
        }
    }
}

/// Handles `TASK_CREATE` / `TASK_UPDATE` / `TASK_MOVE` / `TASK_DELETE`.
///
/// Live traffic and replayed offline logs both land here, so conflict
/// resolution applies identically to either path.
async fn handle_task_event(state: &Arc<BoardState>, user_id: &str, event: ClientEvent) {
    if let Err(e) = event.validate() {
        state.send_to(user_id, &validation_error(&e)).await;
        return;
    }

    match event {
        ClientEvent::TaskCreate(payload) => {
            let actor = actor_for(state, user_id).await;
            match state.service.create_task(payload, &actor).await {
                Ok(task) => state.broadcast(&ServerEvent::TaskCreated(task)).await,
                Err(e) => {
                    state
                        .send_to(user_id, &service_error(ErrorCode::CreateFailed, &e))
                        .await;
                }
            }
        }
        ClientEvent::TaskUpdate(payload) => {
            let actor = actor_for(state, user_id).await;
            match state.service.update_task(payload, &actor).await {
                Ok(task) => state.broadcast(&ServerEvent::TaskUpdated(task)).await,
                Err(e) => {
                    state
                        .send_to(user_id, &service_error(ErrorCode::UpdateFailed, &e))
                        .await;
                }
            }
        }
        ClientEvent::TaskMove(payload) => {
            handle_move(state, user_id, payload).await;
        }
        ClientEvent::TaskDelete(payload) => {
            match state.service.delete_task(&payload.id).await {
                Ok(()) => {
                    state
                        .broadcast(&ServerEvent::TaskDeleted { id: payload.id })
                        .await;
                }
                Err(e) => {
                    state
                        .send_to(user_id, &service_error(ErrorCode::DeleteFailed, &e))
                        .await;
                }
            }
        }
        other => {
            tracing::warn!(user = %user_id, event = other.name(), "unroutable task event");
        }
    }
}

/// The `TASK_MOVE` path: fetch, acquire, move-or-notify, release.
///
/// Two concurrent moves on one task are totally ordered by the lock. The
/// acquire loser gets a private `CONFLICT_NOTIFY` carrying the authoritative
/// state, and an audit row is written off the critical path.
async fn handle_move(state: &Arc<BoardState>, user_id: &str, payload: MoveTask) {
    let current = match state.cache.get(&payload.id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            state
                .send_to(
                    user_id,
                    &ServerEvent::Error {
                        code: ErrorCode::NotFound,
                        message: format!("task not found: {}", payload.id),
                    },
                )
                .await;
            return;
        }
        Err(e) => {
            state
                .send_to(
                    user_id,
                    &ServerEvent::Error {
                        code: ErrorCode::MoveFailed,
                        message: e.to_string(),
                    },
                )
                .await;
            return;
        }
    };

    match state.locks.acquire(&payload.id, user_id, LOCK_TTL).await {
        Acquire::Held { owner } => {
            let winner_name = state
                .presence
                .get(&owner)
                .await
                .map_or_else(|| "another participant".to_string(), |p| p.display_name);
            let message = conflict::lock_loss_message(&current, &winner_name);
            state
                .send_to(
                    user_id,
                    &ServerEvent::ConflictNotify {
                        task_id: payload.id.clone(),
                        resolved_state: current.clone(),
                        message: message.clone(),
                    },
                )
                .await;

            // Audit is fire-and-forget, never on the critical path.
            let audit = conflict::lock_loss_audit(&current, &owner, user_id, message, now_ms());
            let store = Arc::clone(&state.store);
            tokio::spawn(async move {
                if let Err(e) = store.append_audit(&audit).await {
                    tracing::warn!(task = %audit.task_id, error = %e, "conflict audit write failed");
                }
            });
        }
        Acquire::Acquired => {
            let actor = actor_for(state, user_id).await;
            let result = state.service.move_task(payload.clone(), &actor).await;
            // Release on every exit path so a failed move cannot wedge the
            // task until TTL expiry.
            state.locks.release(&payload.id, user_id).await;
            match result {
                Ok(task) => state.broadcast(&ServerEvent::TaskMoved(task)).await,
                Err(e) => {
                    state
                        .send_to(user_id, &service_error(ErrorCode::MoveFailed, &e))
                        .await;
                }
            }
        }
    }
}

async fn handle_presence_update(state: &Arc<BoardState>, user_id: &str, payload: PresenceUpdate) {
    if state
        .presence
        .set_focus(user_id, payload.status, payload.task_id)
        .await
        .is_none()
    {
        tracing::warn!(user = %user_id, "presence update from unregistered connection");
        return;
    }
    let active = state.presence.list_active().await;
    state.broadcast(&ServerEvent::PresenceState(active)).await;
}

/// Replays an offline operation log in client-timestamp order.
///
/// Presence entries in the log are dropped (stale presence is meaningless);
/// everything else goes through [`handle_task_event`], so each op produces
/// its normal broadcast and any conflict notifies only the replaying
/// client.
async fn handle_replay(state: &Arc<BoardState>, user_id: &str, mut ops: Vec<QueuedOp>) {
    if let Err(e) = ClientEvent::ReplayOps(ops.clone()).validate() {
        state.send_to(user_id, &validation_error(&e)).await;
        return;
    }

    ops.sort_by_key(|op| op.client_timestamp);
    let count = ops.len();
    for op in ops {
        match op.op {
            ClientEvent::PresenceUpdate(_) => {}
            task_event => handle_task_event(state, user_id, task_event).await,
        }
    }
    tracing::info!(user = %user_id, count, "offline operation log replayed");
}

/// Resolves the mutator snapshot for a connection, refreshing its presence
/// TTL as a side effect of the activity.
async fn actor_for(state: &Arc<BoardState>, user_id: &str) -> Actor {
    state.presence.touch(user_id).await;
    match state.presence.get(user_id).await {
        Some(presence) => Actor {
            name: presence.display_name,
            color: presence.color,
        },
        None => Actor {
            name: user_id.to_string(),
            color: crate::presence::PALETTE[0].to_string(),
        },
    }
}

fn validation_error(error: &ValidationError) -> ServerEvent {
    ServerEvent::Error {
        code: ErrorCode::ValidationError,
        message: error.to_string(),
    }
}

fn service_error(fallback: ErrorCode, error: &ServiceError) -> ServerEvent {
    let code = match error {
        ServiceError::NotFound(_) => ErrorCode::NotFound,
        ServiceError::Store(_) | ServiceError::Order(_) => fallback,
    };
    ServerEvent::Error {
        code,
        message: error.to_string(),
    }
}

// ---------------------------------------------------------------------------
// WebSocket lifecycle
// ---------------------------------------------------------------------------

/// Handles an upgraded WebSocket connection for a single participant.
pub async fn handle_socket(socket: WebSocket, state: Arc<BoardState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(hello) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before handshake");
        return;
    };
    if let Err(e) = hello.validate() {
        let _ = send_event(&mut ws_sender, &validation_error(&e)).await;
        return;
    }

    let user_id = Uuid::now_v7().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.register(&user_id, tx).await;
    state.presence.register(&user_id, &hello.display_name).await;

    // The private snapshot goes out before the reader loop starts, so the
    // client never sees an incremental event it cannot anchor.
    let snapshot = match state.service.all_tasks().await {
        Ok(tasks) => ServerEvent::BoardSnapshot {
            tasks,
            presence: state.presence.list_active().await,
        },
        Err(e) => {
            tracing::error!(user = %user_id, error = %e, "board snapshot assembly failed");
            let _ = send_event(
                &mut ws_sender,
                &ServerEvent::Error {
                    code: ErrorCode::ConnectFailed,
                    message: "board snapshot unavailable, retry".to_string(),
                },
            )
            .await;
            state.presence.remove(&user_id).await;
            state.unregister(&user_id).await;
            return;
        }
    };
    if send_event(&mut ws_sender, &snapshot).await.is_err() {
        state.presence.remove(&user_id).await;
        state.unregister(&user_id).await;
        return;
    }

    let roster = ServerEvent::PresenceState(state.presence.list_active().await);
    state.broadcast_except(&user_id, &roster).await;
    tracing::info!(user = %user_id, name = %hello.display_name, "participant connected");

    // Writer task: forwards channel messages to the WebSocket.
    let writer_user_id = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user_id, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader task: decodes frames and dispatches events in arrival order.
    let reader_user_id = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match codec::decode_client(&data) {
                    Ok(event) => dispatch(&reader_state, &reader_user_id, event).await,
                    Err(e) => {
                        tracing::warn!(user = %reader_user_id, error = %e, "undecodable frame");
                        reader_state
                            .send_to(
                                &reader_user_id,
                                &ServerEvent::Error {
                                    code: ErrorCode::ValidationError,
                                    message: "undecodable event frame".to_string(),
                                },
                            )
                            .await;
                    }
                },
                Message::Close(_) => {
                    tracing::info!(user = %reader_user_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&user_id).await;
    state.presence.remove(&user_id).await;
    let roster = ServerEvent::PresenceState(state.presence.list_active().await);
    state.broadcast(&roster).await;
    tracing::info!(user = %user_id, "participant disconnected");
}

/// Waits for the first frame, expecting a `Hello` handshake.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Hello> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode_client(&data) {
                Ok(ClientEvent::Hello(hello)) => return Some(hello),
                Ok(other) => {
                    tracing::warn!(event = other.name(), "expected HELLO as first frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode handshake frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {
                // Skip ping/pong during the handshake.
            }
        }
    }
    None
}

/// Encodes and sends an event directly on a WebSocket sender.
async fn send_event(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), String> {
    let bytes = codec::encode_server(event).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

// ---------------------------------------------------------------------------
// HTTP surface and server startup
// ---------------------------------------------------------------------------

/// Builds the axum application: the WebSocket endpoint plus the read-only
/// HTTP fallback. All mutations go through the event channel so conflict
/// logic stays single-sourced.
pub fn app(state: Arc<BoardState>, allowed_origin: &str) -> axum::Router {
    let cors = if allowed_origin == "*" {
        CorsLayer::new().allow_origin(Any)
    } else if let Ok(origin) = allowed_origin.parse::<HeaderValue>() {
        CorsLayer::new().allow_origin(origin)
    } else {
        tracing::warn!(origin = %allowed_origin, "unparseable CORS origin, denying cross-origin");
        CorsLayer::new()
    };

    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/tasks", axum::routing::get(list_tasks))
        .route("/tasks/{id}", axum::routing::get(get_task))
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BoardState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn list_tasks(
    axum::extract::State(state): axum::extract::State<Arc<BoardState>>,
) -> Result<Json<Vec<Task>>, StatusCode> {
    state.service.all_tasks().await.map(Json).map_err(|e| {
        tracing::error!(error = %e, "task listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_task(
    axum::extract::State(state): axum::extract::State<Arc<BoardState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Task>, StatusCode> {
    let Ok(id) = id.parse::<TaskId>() else {
        return Err(StatusCode::NOT_FOUND);
    };
    match state.cache.get(&id).await {
        Ok(Some(task)) => Ok(Json(task)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(task = %id, error = %e, "task read failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Starts the coordinator on the given address with a fresh state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server(
    addr: &str,
    store: Arc<dyn TaskStore>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BoardState::new(store)), "*").await
}

/// Starts the coordinator with pre-wired state, the entry point shared by
/// `main` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BoardState>,
    allowed_origin: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let router = app(state, allowed_origin);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "coordinator server error");
        }
    });

    Ok((bound_addr, handle))
}
