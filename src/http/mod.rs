use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, FromRequest, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    domain::{PollEntry, PollId, Voter, VoterId},
    store::{StoreError, StoreErrorKind, VoterStore},
};

#[derive(Clone)]
pub struct AppState {
    pub store: VoterStore,
    pub stats: Arc<RequestStats>,
}

/// Process-wide request counters reported by the health endpoint.
#[derive(Debug)]
pub struct RequestStats {
    started_at: Instant,
    requests_processed: AtomicU64,
    errors_encountered: AtomicU64,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_processed: AtomicU64::new(0),
            errors_encountered: AtomicU64::new(0),
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        let message = value.to_string();
        match (value.kind(), value) {
            (StoreErrorKind::NotFound, StoreError::PollNotFound { voter_id, poll_id }) => {
                ApiError::not_found(message)
                    .with_detail("voter_id", voter_id)
                    .with_detail("poll_id", poll_id)
            }
            (StoreErrorKind::NotFound, _) => ApiError::not_found(message),
            (StoreErrorKind::AlreadyExists, _) => ApiError::conflict(message),
            (StoreErrorKind::InvalidVoter, StoreError::DuplicatePoll { voter_id, poll_id }) => {
                ApiError::invalid_request(message)
                    .with_detail("voter_id", voter_id)
                    .with_detail("poll_id", poll_id)
            }
            (StoreErrorKind::InvalidVoter, _) => ApiError::invalid_request(message),
            (StoreErrorKind::PartialFailure, StoreError::PartialFailure { expected, deleted }) => {
                warn!(expected, deleted, "bulk voter delete was partial");
                ApiError::internal(message)
                    .with_detail("expected", expected)
                    .with_detail("deleted", deleted)
            }
            (StoreErrorKind::PartialFailure | StoreErrorKind::MediumUnavailable, _) => {
                warn!(error = %message, "voter store failure");
                ApiError::internal(message)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

/// Body of `POST /voters/:id`; the id always comes from the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVoterRequest {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    poll_history: Vec<PollEntry>,
}

#[derive(Debug, Serialize)]
struct DeleteAllResponse {
    deleted: u64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    requests_processed: u64,
    errors_encountered: u64,
}

pub fn build_router(store: VoterStore) -> Router {
    let stats = Arc::new(RequestStats::new());
    let app_state = AppState {
        store,
        stats: stats.clone(),
    };

    Router::new()
        .route(
            "/voters",
            get(list_voters).put(update_voter).delete(delete_all_voters),
        )
        .route("/voters/health", get(health))
        .route(
            "/voters/:id",
            get(get_voter).post(create_voter).delete(delete_voter),
        )
        .route("/voters/:id/polls", get(get_voter_history))
        .route(
            "/voters/:id/polls/:poll_id",
            get(get_poll_entry)
                .post(add_poll_entry)
                .delete(delete_poll_entry),
        )
        .fallback(fallback_not_found)
        .layer(middleware::from_fn_with_state(stats, track_requests))
        .layer(Extension(app_state))
}

async fn track_requests(
    State(stats): State<Arc<RequestStats>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    stats.requests_processed.fetch_add(1, Ordering::Relaxed);
    let res = next.run(req).await;
    if res.status().is_server_error() {
        stats.errors_encountered.fetch_add(1, Ordering::Relaxed);
    }
    res
}

fn parse_id(raw: &str, name: &'static str) -> Result<u64, ApiError> {
    raw.parse::<u64>().map_err(|_| {
        ApiError::invalid_request(format!("{name} must be an unsigned integer: {raw:?}"))
            .with_detail("param", name)
    })
}

fn parse_voter_id(raw: &str) -> Result<VoterId, ApiError> {
    parse_id(raw, "id")
}

fn parse_poll_path(voter_id: &str, poll_id: &str) -> Result<(VoterId, PollId), ApiError> {
    Ok((parse_voter_id(voter_id)?, parse_id(poll_id, "poll_id")?))
}

async fn health(Extension(state): Extension<AppState>) -> Json<HealthResponse> {
    let stats = &state.stats;
    Json(HealthResponse {
        status: "ok",
        version: crate::version::VERSION,
        uptime_secs: stats.started_at.elapsed().as_secs(),
        requests_processed: stats.requests_processed.load(Ordering::Relaxed),
        errors_encountered: stats.errors_encountered.load(Ordering::Relaxed),
    })
}

async fn list_voters(Extension(state): Extension<AppState>) -> Result<Json<Vec<Voter>>, ApiError> {
    Ok(Json(state.store.list_voters().await?))
}

async fn get_voter(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Voter>, ApiError> {
    let id = parse_voter_id(&id)?;
    Ok(Json(state.store.get_voter(id).await?))
}

async fn create_voter(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CreateVoterRequest>,
) -> Result<(StatusCode, Json<Voter>), ApiError> {
    let id = parse_voter_id(&id)?;
    let voter = Voter {
        id,
        first_name: req.first_name,
        last_name: req.last_name,
        poll_history: req.poll_history,
    };
    let voter = state.store.add_voter(voter).await?;
    Ok((StatusCode::CREATED, Json(voter)))
}

async fn update_voter(
    Extension(state): Extension<AppState>,
    ApiJson(voter): ApiJson<Voter>,
) -> Result<Json<Voter>, ApiError> {
    Ok(Json(state.store.update_voter(voter).await?))
}

async fn delete_voter(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_voter_id(&id)?;
    state.store.delete_voter(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_voters(
    Extension(state): Extension<AppState>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let deleted = state.store.delete_all_voters().await?;
    Ok(Json(DeleteAllResponse { deleted }))
}

async fn get_voter_history(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PollEntry>>, ApiError> {
    let id = parse_voter_id(&id)?;
    Ok(Json(state.store.voter_history(id).await?))
}

async fn get_poll_entry(
    Extension(state): Extension<AppState>,
    Path((id, poll_id)): Path<(String, String)>,
) -> Result<Json<PollEntry>, ApiError> {
    let (id, poll_id) = parse_poll_path(&id, &poll_id)?;
    Ok(Json(state.store.get_poll_entry(id, poll_id).await?))
}

async fn add_poll_entry(
    Extension(state): Extension<AppState>,
    Path((id, poll_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<PollEntry>), ApiError> {
    let (id, poll_id) = parse_poll_path(&id, &poll_id)?;
    let entry = state.store.add_poll_entry(id, poll_id).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn delete_poll_entry(
    Extension(state): Extension<AppState>,
    Path((id, poll_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let (id, poll_id) = parse_poll_path(&id, &poll_id)?;
    state.store.delete_poll_entry(id, poll_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
