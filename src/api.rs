// Read-only HTTP view of the scan: health, cursor and bars

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::table::{sort_rows, BarRow};
use crate::engine::types::AssetPair;
use crate::market_data::scanner::PipelineSnapshot;
use crate::persist::{CheckpointStore, PersistError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store: {0}")]
    Store(#[from] PersistError),
}

#[derive(Debug, Serialize)]
struct ErrBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, Json(ErrBody { error: self.to_string() })).into_response()
    }
}

/// Open bars come from the latest snapshot, closed bars from the store.
#[derive(Clone)]
pub struct ApiState {
    snapshots: watch::Receiver<PipelineSnapshot>,
    store: Arc<dyn CheckpointStore>,
}

impl ApiState {
    pub fn new(snapshots: watch::Receiver<PipelineSnapshot>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { snapshots, store }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cursor", get(cursor))
        .route("/bars", get(bars))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow();
    let code = if snapshot.state.is_stalled() { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(json!({ "ok": !snapshot.state.is_stalled(), "scan": snapshot.state })))
}

pub async fn cursor(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let cursor = state.snapshots.borrow().cursor.clone();
    cursor
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no ledger committed yet".into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct BarsQuery {
    pub pair: Option<String>,
    #[serde(default)]
    pub closed_only: bool,
}

pub async fn bars(
    State(state): State<ApiState>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<Vec<BarRow>>, ApiError> {
    let pair = query
        .pair
        .as_deref()
        .map(|p| p.parse::<AssetPair>().map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()?;

    let open: Vec<BarRow> = if query.closed_only {
        Vec::new()
    } else {
        state
            .snapshots
            .borrow()
            .rows
            .iter()
            .filter(|row| !row.closed && pair.as_ref().map_or(true, |p| &row.bar.pair == p))
            .cloned()
            .collect()
    };

    let mut rows: Vec<BarRow> = state.store.closed_bars(pair.as_ref()).await?.into_iter().map(BarRow::closed).collect();
    rows.extend(open);
    sort_rows(&mut rows);
    Ok(Json(rows))
}
