//! `RelayServer`: Axum HTTP + `WebSocket` relay with a managed lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::rejection::ExtensionRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::RelayError;
use crate::shutdown::{LifecycleState, ShutdownCoordinator};
use crate::status::{
    self, HealthResponse, SERVER_NAME, SERVER_VERSION, ServerInfoResponse, StatusSnapshot,
};
use crate::websocket::broadcast::broadcast;
use crate::websocket::codec::ServerMessage;
use crate::websocket::{SHUTDOWN_REASON, close_code};
use crate::websocket::registry::PeerRegistry;
use crate::websocket::session::{SessionSettings, run_peer_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live peers.
    pub registry: Arc<PeerRegistry>,
    /// Lifecycle.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server was created.
    pub start_time: Instant,
    /// Per-peer session settings.
    pub session: SessionSettings,
    /// `WebSocket` endpoint path.
    pub path: String,
    /// Bound port, `0` until listening.
    pub port: Arc<AtomicU16>,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<PeerRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    port: Arc<AtomicU16>,
    prometheus: Option<PrometheusHandle>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a stopped server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            port: Arc::new(AtomicU16::new(0)),
            prometheus: None,
            serve_task: Mutex::new(None),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            session: SessionSettings::from(&self.config),
            path: self.config.path.clone(),
            port: self.port.clone(),
            prometheus: self.prometheus.clone(),
        };
        Router::new()
            .route("/", get(info_handler))
            .route("/status", get(status_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.config.path, get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener and start accepting peers.
    ///
    /// A bind failure is fatal: the server returns to `Stopped` and never
    /// reaches `Running`.
    pub async fn listen(&self) -> Result<SocketAddr, RelayError> {
        self.config.validate()?;
        self.shutdown.begin_start()?;

        let addr = self.config.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.shutdown.fail_start();
                error!(%addr, error = %source, "failed to bind listener");
                return Err(RelayError::Bind { addr, source });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.shutdown.fail_start();
                return Err(RelayError::Io(e));
            }
        };
        self.port.store(local_addr.port(), Ordering::Relaxed);

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "listener failed");
            }
        });
        *self.serve_task.lock() = Some(task);

        self.shutdown.mark_running()?;
        info!(%local_addr, path = %self.config.path, "relay listening");
        Ok(local_addr)
    }

    /// Graceful shutdown.
    ///
    /// Notifies every peer, closes them with a normal closure, waits (bounded)
    /// for the registry to drain, then stops the listener. Returns `false`
    /// without doing anything if the server was not running.
    pub async fn stop(&self) -> bool {
        if !self.shutdown.begin_stop() {
            debug!(state = %self.shutdown.state(), "stop ignored");
            return false;
        }
        info!(peers = self.registry.size(), "relay shutting down");

        let _ = broadcast(
            &self.registry,
            &ServerMessage::broadcast("server shutting down", "server"),
            None,
        );
        let closed = self.registry.close_all(close_code::NORMAL, SHUTDOWN_REASON);
        debug!(closed, "close frames queued");

        let timeout = self.config.shutdown_timeout();
        if !self.registry.wait_empty(timeout).await {
            let forced = self.registry.remove_all();
            warn!(forced, timeout_secs = timeout.as_secs(), "peers did not drain in time");
        }

        self.shutdown.cancel_listener();
        let task = self.serve_task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!("listener did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shutdown.mark_stopped();
        info!("relay stopped");
        true
    }

    /// Listen, wait for `signal`, then stop.
    pub async fn serve_until(&self, signal: impl Future<Output = ()>) -> Result<(), RelayError> {
        let _ = self.listen().await?;
        signal.await;
        let _ = self.stop().await;
        Ok(())
    }

    /// Peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shutdown.state()
    }

    /// Read-only status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.registry.status(self.start_time)
    }
}

/// GET /
async fn info_handler(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: SERVER_NAME,
        version: SERVER_VERSION,
        status: state.shutdown.state().to_string(),
        port: state.port.load(Ordering::Relaxed),
        path: state.path.clone(),
        stats: state.registry.status(state.start_time),
    })
}

/// GET /status
async fn status_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.registry.status(state.start_time))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(status::health_check(
        state.start_time.elapsed().as_secs(),
        state.registry.size(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `WebSocket` upgrade. Refused with 503 unless the server is running.
async fn ws_handler(
    State(state): State<AppState>,
    connect_info: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.shutdown.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is not accepting connections")
            .into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let remote_addr = connect_info.map_or_else(
        |_| SocketAddr::from(([0, 0, 0, 0], 0)),
        |ConnectInfo(addr)| addr,
    );

    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();
    let settings = state.session.clone();
    ws.on_upgrade(move |mut socket| async move {
        if !shutdown.is_running() {
            debug!(%remote_addr, state = %shutdown.state(), "upgrade finished after shutdown began");
            let frame = CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(SHUTDOWN_REASON),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
        let (sink, stream) = socket.split();
        let _ = run_peer_session(sink, stream, remote_addr, registry, settings).await;
    })
}
