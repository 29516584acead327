//! RPC method handlers organized by domain.

use std::sync::Arc;

use usher_core::ids::SessionId;
use usher_core::turns::TurnRole;
use usher_engine::EngineError;
use usher_store::sessions::SessionRepo;
use usher_store::summaries::SummaryRepo;
use usher_store::{Database, StoreError};
use usher_telemetry::{LogQuery, TelemetryGuard};

use crate::gateway::{SessionGateway, SubmitParams};
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub gateway: Option<Arc<SessionGateway>>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            gateway: None,
            telemetry: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<SessionGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Turns (gateway-dependent)
        "turn.submit" => turn_submit(state, params, id).await,
        "turn.abort" => turn_abort(state, params, id),

        // Sessions
        "session.create" => session_create(state, id),
        "session.get" => session_get(state, params, id),
        "session.history" => session_history(state, params, id),
        "session.delete" => session_delete(state, params, id),

        // Summaries
        "summary.list" => summary_list(state, params, id),

        // Telemetry
        "telemetry.logs" => telemetry_logs(state, params, id),

        // System
        "system.info" => system_info(state, id),
        "health" | "system.ping" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Turn handlers ──

async fn turn_submit(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref gateway) = state.gateway else {
        return RpcResponse::internal_error(id, "Session gateway not configured");
    };

    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let text = match rpc::require_str(params, "text") {
        Ok(t) => t.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let confirm_consent = rpc::optional_bool(params, "confirm_consent");

    match gateway
        .submit_turn(SubmitParams {
            session_id,
            text,
            confirm_consent,
        })
        .await
    {
        Ok(result) => RpcResponse::success(
            id,
            serde_json::json!({
                "acknowledged": true,
                "turn_ref": result.turn_ref,
            }),
        ),
        Err(EngineError::SessionBusy(session)) => RpcResponse::error(
            id,
            rpc::SESSION_BUSY,
            format!("a turn is already in flight for {session}"),
        ),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn turn_abort(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(ref gateway) = state.gateway else {
        return RpcResponse::internal_error(id, "Session gateway not configured");
    };

    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let aborted = gateway.abort(&session_id);
    RpcResponse::success(id, serde_json::json!({"aborted": aborted}))
}

// ── Session handlers ──

fn session_create(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let repo = SessionRepo::new(state.db.clone());
    match repo.create(&SessionId::new()) {
        Ok(session) => RpcResponse::success(
            id,
            serde_json::json!({"session_id": session.id, "status": session.state.to_string()}),
        ),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let repo = SessionRepo::new(state.db.clone());
    match repo.load(&session_id) {
        Ok(session) => RpcResponse::success(
            id,
            serde_json::json!({
                "session_id": session.id,
                "status": session.state.to_string(),
                "turn_count": session.turn_count(),
                "flags": session.flags,
                "identifiers": session.identifiers,
                "checkpoint_version": session.checkpoint_version,
                "consent_pending": session.pending_consent.is_some(),
            }),
        ),
        Err(StoreError::NotFound(msg)) => RpcResponse::error(id, rpc::NOT_FOUND, msg),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn session_history(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let repo = SessionRepo::new(state.db.clone());
    match repo.load(&session_id) {
        Ok(session) => {
            // Only the user-visible transcript; tool results and internal
            // notes stay out of the client view.
            let turns: Vec<serde_json::Value> = session
                .turns
                .iter()
                .filter(|t| matches!(t.role, TurnRole::User | TurnRole::Assistant))
                .map(|t| {
                    serde_json::json!({
                        "role": t.role,
                        "content": t.content,
                        "timestamp": t.timestamp,
                    })
                })
                .collect();
            RpcResponse::success(id, serde_json::json!({"turns": turns}))
        }
        Err(StoreError::NotFound(msg)) => RpcResponse::error(id, rpc::NOT_FOUND, msg),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn session_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let repo = SessionRepo::new(state.db.clone());
    match repo.delete(&session_id) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"deleted": true})),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── Summary handlers ──

fn summary_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let repo = SummaryRepo::new(state.db.clone());
    match repo.list(&session_id) {
        Ok(rows) => {
            let summaries: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "milestone": r.milestone,
                        "payload": r.payload,
                        "created_at": r.created_at,
                    })
                })
                .collect();
            RpcResponse::success(id, serde_json::json!({"summaries": summaries}))
        }
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── Telemetry & system handlers ──

fn telemetry_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(id, serde_json::json!({"logs": []}));
    };

    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(str::to_string),
        session_id: rpc::optional_str(params, "session_id").map(str::to_string),
        since: rpc::optional_str(params, "since").map(str::to_string),
        limit: params.get("limit").and_then(|v| v.as_u64()).map(|v| v as u32),
        ..Default::default()
    };

    match sink.query(&query) {
        Ok(records) => match serde_json::to_value(&records) {
            Ok(logs) => RpcResponse::success(id, serde_json::json!({"logs": logs})),
            Err(e) => RpcResponse::internal_error(id, e.to_string()),
        },
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn system_info(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let active_turns = state.gateway.as_ref().map(|g| g.active_count()).unwrap_or(0);
    let metrics = state
        .telemetry
        .as_ref()
        .map(|t| serde_json::to_value(t.metrics().snapshot()).unwrap_or_default())
        .unwrap_or_default();

    RpcResponse::success(
        id,
        serde_json::json!({
            "service": "usher",
            "version": env!("CARGO_PKG_VERSION"),
            "active_turns": active_turns,
            "metrics": metrics,
        }),
    )
}

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StoreError::Database(e.to_string()))
        })
        .is_ok();

    let status = if db_ok { "healthy" } else { "degraded" };
    RpcResponse::success(id, serde_json::json!({"status": status}))
}
