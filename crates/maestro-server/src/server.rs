use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use maestro_core::backend::ModelBackend;
use maestro_core::events::{ClientEvent, ServerEvent};
use maestro_core::ids::WindowId;
use maestro_engine::CapabilityRegistry;
use maestro_store::Database;

use crate::handlers::{self, HandlerState};
use crate::orchestrator::SessionOrchestrator;
use crate::router::EventRouter;
use crate::scheduler::Scheduler;
use crate::tasks::TaskManager;
use crate::windows::WindowRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub event_bus_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9292,
            max_send_queue: 256,
            event_bus_capacity: 1024,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub windows: Arc<WindowRegistry>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Wire up the orchestration stack and start serving. Returns a handle
/// that keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    backend: Arc<dyn ModelBackend>,
    capabilities: Arc<CapabilityRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let (event_tx, _) = broadcast::channel::<ServerEvent>(config.event_bus_capacity);

    let windows = Arc::new(WindowRegistry::new(config.max_send_queue));
    let router_handle = EventRouter::new(Arc::clone(&windows)).start(event_tx.subscribe());

    let orchestrator = SessionOrchestrator::new(db.clone(), backend, capabilities, event_tx.clone());
    let tasks = Arc::new(TaskManager::new(
        Arc::clone(&orchestrator),
        db.clone(),
        event_tx.clone(),
    ));
    orchestrator.attach_task_manager(Arc::clone(&tasks));

    let scheduler = Arc::new(Scheduler::new(db, Arc::clone(&orchestrator), event_tx.clone()));
    let scheduler_handle = scheduler.start();

    let handler_state = Arc::new(HandlerState {
        orchestrator,
        tasks,
        scheduler: Arc::clone(&scheduler),
        windows: Arc::clone(&windows),
    });

    let app_state = AppState { handler_state, windows };
    let router = build_router(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "maestro server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        scheduler,
        _server: server_handle,
        _router: router_handle,
        _scheduler: scheduler_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    scheduler: Arc<Scheduler>,
    _server: tokio::task::JoinHandle<()>,
    _router: tokio::task::JoinHandle<()>,
    _scheduler: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self._server.abort();
        self._router.abort();
    }
}

/// WebSocket upgrade handler: one socket per UI window.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (window_id, rx) = state.windows.register();
    info!(window_id = %window_id, "window connected");

    handle_ws_connection(socket, window_id, rx, state).await;
}

/// Split the socket into reader/writer, forward outbound messages and
/// dispatch inbound client events until either side closes.
async fn handle_ws_connection(
    socket: WebSocket,
    window_id: WindowId,
    mut rx: mpsc::Receiver<String>,
    state: AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: forward events from the window queue, ping periodically.
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: parse and dispatch client events.
    let reader_window = window_id.clone();
    let reader_state = state.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            handlers::dispatch(
                                &reader_state.handler_state,
                                &reader_window,
                                event,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(window_id = %reader_window, error = %e, "unparseable client event");
                            let error = ServerEvent::RunnerError {
                                session_id: None,
                                message: format!("unparseable client event: {e}"),
                            };
                            if let Ok(json) = serde_json::to_string(&error) {
                                reader_state.windows.send_to(&reader_window, json).await;
                            }
                        }
                    }
                }
                WsMessage::Close(_) => break,
                // axum answers pings automatically.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    state.windows.unregister(&window_id);
    info!(window_id = %window_id, "window disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "windows": state.windows.count(),
    }))
}
