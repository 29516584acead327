use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use usher_core::events::TurnEvent;
use usher_core::ids::SessionId;
use usher_store::sessions::SessionRepo;
use usher_store::Database;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::gateway::SessionGateway;
use crate::handlers::HandlerState;
use crate::rpc::{self, RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    /// Sessions idle longer than this are expired by the sweep.
    pub session_idle_timeout: Duration,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9290,
            max_send_queue: 256,
            session_idle_timeout: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    gateway: Arc<SessionGateway>,
    handler_state: HandlerState,
    event_tx: broadcast::Sender<TurnEvent>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge_handle = event_bridge::create_bridge(
        Arc::clone(&client_registry),
        event_tx.subscribe(),
    );

    let _cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        Duration::from_secs(60),
    );

    let _sweep = start_expiry_sweep(
        db,
        config.session_idle_timeout,
        config.sweep_interval,
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let handler_state = Arc::new(handler_state);
    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: Arc::clone(&client_registry),
        message_tx: msg_tx,
    };

    let rpc_handle = tokio::spawn(process_rpc_messages(
        msg_rx,
        handler_state,
        Arc::clone(&client_registry),
        gateway,
    ));

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "usher server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _rpc: rpc_handle,
        _cleanup,
        _sweep,
    })
}

/// Handle returned by `start()` - keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
    _sweep: tokio::task::JoinHandle<()>,
}

/// Periodically expire idle sessions. The timeout itself is external policy;
/// this is just the enforcement loop.
fn start_expiry_sweep(
    db: Database,
    idle_timeout: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let repo = SessionRepo::new(db);
        let max_idle = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match repo.expire_idle(max_idle) {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "expired idle sessions"),
                Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
            }
        }
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(resp.result.unwrap_or_default()))
}

/// Process incoming RPC messages from WebSocket clients.
///
/// Two methods interact with the client registry and are handled here, where
/// the client id is known: `session.watch` subscribes the client to a
/// session's event stream, and `turn.submit` auto-subscribes the submitter.
/// A client disconnecting mid-turn aborts its watched session's turn.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
    gateway: Arc<SessionGateway>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                if let Ok(json) = serde_json::to_string(&resp) {
                    registry.send_to(&client_id, json).await;
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));

        let response = match request.method.as_str() {
            "session.watch" => match rpc::require_str(&params, "session_id") {
                Ok(raw) => {
                    let session_id = SessionId::from_raw(raw);
                    registry.set_session(&client_id, session_id).await;
                    RpcResponse::success(request.id, serde_json::json!({"watching": true}))
                }
                Err(e) => RpcResponse::invalid_params(request.id, e),
            },
            "turn.submit" => {
                if let Ok(raw) = rpc::require_str(&params, "session_id") {
                    registry
                        .set_session(&client_id, SessionId::from_raw(raw))
                        .await;
                }
                crate::handlers::dispatch(&state, &request.method, &params, request.id).await
            }
            _ => crate::handlers::dispatch(&state, &request.method, &params, request.id).await,
        };

        if let Ok(json) = serde_json::to_string(&response) {
            if !registry.send_to(&client_id, json).await {
                // Client went away; cancel its in-flight turn so the lock
                // releases and state stays at the last checkpoint.
                if let Some(session_id) = registry.session_for(&client_id).await {
                    if gateway.abort(&session_id) {
                        tracing::info!(
                            client_id = %client_id,
                            session_id = %session_id,
                            "aborted turn for disconnected client"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use usher_core::provider::ModelProvider;
    use usher_engine::runner::{TurnConfig, TurnRunner};
    use usher_engine::ToolRegistry;
    use usher_llm::mock::MockModel;

    fn test_stack() -> (ServerConfig, Database, Arc<SessionGateway>, HandlerState, broadcast::Sender<TurnEvent>) {
        let db = Database::in_memory().unwrap();
        let (event_tx, _) = broadcast::channel(256);
        let model: Arc<MockModel> = Arc::new(MockModel::new(vec![]));
        let runner = Arc::new(TurnRunner::new(
            model as Arc<dyn ModelProvider>,
            Arc::new(ToolRegistry::new()),
            db.clone(),
            event_tx.clone(),
            TurnConfig::default(),
        ));
        let gateway = Arc::new(SessionGateway::new(runner, db.clone(), event_tx.clone()));
        let handler_state = HandlerState::new(db.clone()).with_gateway(Arc::clone(&gateway));

        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        (config, db, gateway, handler_state, event_tx)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (config, db, gateway, handler_state, event_tx) = test_stack();
        let handle = start(config, db, gateway, handler_state, event_tx).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9290);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(24 * 3600));
    }
}
