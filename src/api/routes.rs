//! Vendor-facing HTTP and websocket interface.
//!
//! Thin layer over the aggregation engine: request parsing, error mapping,
//! and websocket fan-out of group snapshots and settlement records. All
//! derived presentation fields (progress %, savings, time-left strings) are
//! computed client-side from the snapshot.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::catalog::OfferCatalog;
use crate::engine::AggregationEngine;
use crate::error::EngineError;
use crate::models::{Commitment, GroupSnapshot, Offer, WsServerEvent};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AggregationEngine>,
    pub events: broadcast::Sender<WsServerEvent>,
}

/// Create the API router
pub fn create_router(
    engine: Arc<AggregationEngine>,
    events: broadcast::Sender<WsServerEvent>,
) -> Router {
    let state = AppState { engine, events };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/offers", get(get_offers))
        .route("/api/groups/join", post(join_group))
        .route("/api/groups/modify", post(modify_commitment))
        .route("/api/groups/withdraw", post(withdraw_commitment))
        .route("/api/groups/:offer_id/:cell", get(get_group_snapshot))
        .route("/api/vendors/:vendor_id/commitments", get(get_vendor_history))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Validated offers currently purchasable through the engine.
async fn get_offers(State(state): State<AppState>) -> Json<OffersResponse> {
    let offers = state
        .engine
        .catalog()
        .offers()
        .iter()
        .map(|o| (**o).clone())
        .collect::<Vec<_>>();
    Json(OffersResponse {
        count: offers.len(),
        offers,
    })
}

async fn join_group(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<GroupSnapshot>, ApiError> {
    let snapshot = state
        .engine
        .join(&req.offer_id, &req.vendor_id, req.quantity)
        .await?;
    Ok(Json(snapshot))
}

async fn modify_commitment(
    State(state): State<AppState>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<GroupSnapshot>, ApiError> {
    let snapshot = state
        .engine
        .modify(&req.offer_id, &req.vendor_id, req.quantity)
        .await?;
    Ok(Json(snapshot))
}

async fn withdraw_commitment(
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<GroupSnapshot>, ApiError> {
    let snapshot = state
        .engine
        .withdraw(&req.offer_id, &req.vendor_id)
        .await?;
    Ok(Json(snapshot))
}

/// Live snapshot for progress-bar style consumers (also available as a
/// push stream via /ws).
async fn get_group_snapshot(
    State(state): State<AppState>,
    Path((offer_id, cell)): Path<(String, String)>,
) -> Result<Json<GroupSnapshot>, ApiError> {
    let snapshot = state.engine.snapshot(&offer_id, &cell).await?;
    Ok(Json(snapshot))
}

/// Commitment history for one vendor, newest first.
async fn get_vendor_history(
    State(state): State<AppState>,
    Path(vendor_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    let rows = state
        .engine
        .ledger()
        .store()
        .vendor_history(&vendor_id, limit)
        .map_err(EngineError::Internal)?;

    Ok(Json(HistoryResponse {
        count: rows.len(),
        commitments: rows
            .into_iter()
            .map(|(group_id, commitment)| HistoryEntry {
                group_id,
                commitment,
            })
            .collect(),
    }))
}

// ===== WebSocket =====

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();

    // On connect, replay the open group snapshots so progress bars render
    // immediately instead of waiting for the next mutation.
    for snapshot in state.engine.ledger().open_snapshots() {
        let msg = serde_json::to_string(&WsServerEvent::GroupUpdate(snapshot))
            .unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                            warn!("failed to serialize ws event: {}", e);
                            "{}".to_string()
                        });
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "websocket subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct CommitRequest {
    offer_id: String,
    vendor_id: String,
    quantity: u32,
}

#[derive(Deserialize)]
struct WithdrawRequest {
    offer_id: String,
    vendor_id: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct OffersResponse {
    count: usize,
    offers: Vec<Offer>,
}

#[derive(Serialize)]
struct HistoryEntry {
    group_id: String,
    commitment: Commitment,
}

#[derive(Serialize)]
struct HistoryResponse {
    count: usize,
    commitments: Vec<HistoryEntry>,
}

// ===== Error Handling =====

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            EngineError::InvalidQuantity { .. } | EngineError::CellMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::AlreadyCommitted { .. } | EngineError::WindowClosed { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &err {
            // Never leak internals to clients.
            EngineError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({
            "error": message,
            "code": err.code(),
        });
        if let EngineError::WindowClosed {
            retry_forms_new_group,
        } = &err
        {
            body["retry_forms_new_group"] = json!(retry_forms_new_group);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_covers_the_taxonomy() {
        let cases = [
            (
                EngineError::InvalidQuantity { quantity: 0 },
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::WindowClosed {
                    retry_forms_new_group: true,
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::Busy, StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::not_found("offer x"), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
