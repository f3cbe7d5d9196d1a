use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fedlearn_core::{FlError, Node, PrivacyView, RoundMetrics};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::federation::FederationModule;

pub type AppState = Arc<FederationModule>;

/// `FlError` at the HTTP boundary: status by kind, `{ error, message }` body.
pub struct ApiError(FlError);

impl From<FlError> for ApiError {
    fn from(e: FlError) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FlError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            FlError::NotFound(_) => StatusCode::NOT_FOUND,
            FlError::RoundFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            FlError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "api_request_failed");
        }
        (status, Json(json!({ "error": self.0.kind(), "message": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrainingRequest {
    pub node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub id: String,
    pub data_weight: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SimulationStatus {
    pub running: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/simulation/start", post(start_simulation))
        .route("/api/simulation/stop", post(stop_simulation))
        .route("/api/rounds", post(run_round).get(round_history))
        .route("/api/metrics", get(current_metrics))
        .route("/api/nodes", get(list_nodes).post(register_node))
        .route("/api/nodes/:id/deactivate", post(deactivate_node))
        .route("/api/nodes/:id/reactivate", post(reactivate_node))
        .route("/api/privacy", get(privacy))
        .with_state(state)
}

async fn start_simulation(State(fed): State<AppState>) -> Json<SimulationStatus> {
    Json(SimulationStatus { running: fed.start_simulation() })
}

async fn stop_simulation(State(fed): State<AppState>) -> Json<SimulationStatus> {
    Json(SimulationStatus { running: fed.stop_simulation().await })
}

async fn run_round(State(fed): State<AppState>, body: Bytes) -> ApiResult<RoundMetrics> {
    let req = parse_training_request(&body)?;
    Ok(Json(fed.run_training_round(req.node_id.as_deref()).await?))
}

/// An empty body runs a plain round; a body that is present must parse.
fn parse_training_request(body: &[u8]) -> Result<TrainingRequest, FlError> {
    if body.iter().all(u8::is_ascii_whitespace) { return Ok(TrainingRequest::default()); }
    serde_json::from_slice(body).map_err(|e| FlError::invalid(format!("malformed training request: {e}")))
}

async fn round_history(State(fed): State<AppState>) -> Json<Vec<RoundMetrics>> { Json(fed.history()) }

async fn current_metrics(State(fed): State<AppState>) -> Json<RoundMetrics> { Json(fed.current_metrics()) }

async fn list_nodes(State(fed): State<AppState>) -> Json<Vec<Node>> { Json(fed.nodes()) }

async fn register_node(State(fed): State<AppState>, Json(req): Json<RegisterNodeRequest>) -> ApiResult<Node> {
    Ok(Json(fed.coordinator().registry().upsert(&req.id, req.data_weight)?))
}

async fn deactivate_node(State(fed): State<AppState>, Path(id): Path<String>) -> ApiResult<Node> {
    Ok(Json(fed.coordinator().registry().deactivate(&id)?))
}

async fn reactivate_node(State(fed): State<AppState>, Path(id): Path<String>) -> ApiResult<Node> {
    Ok(Json(fed.coordinator().registry().reactivate(&id)?))
}

async fn privacy(State(fed): State<AppState>) -> Json<PrivacyView> { Json(fed.privacy()) }
