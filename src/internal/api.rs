use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::internal::{
    analyzer::client::HttpAnalyzerClient,
    builder::client::{BuildParams, HttpBuilderClient},
    config::RegistryConfig,
    governance::{
        library::{GovernanceError, LibraryFunction, LibraryGovernance, Participant, VoteOutcome},
        propagation::{LibraryPropagator, PropagationError, PropagationReport},
    },
    identity::{IdentityError, IdentityVerifier, SignedHeaders, ORG_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    ledger::{
        sqlite::SqliteStore,
        store::{Ledger, LedgerError, MemoryStore},
    },
    registry::programs::{ProcessingSpec, ProgramError, ProgramRegistry},
};

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Organization authenticated for the current request.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[derive(Clone)]
pub struct AppState {
    pub programs: ProgramRegistry,
    pub governance: LibraryGovernance,
    pub propagator: Arc<LibraryPropagator>,
    pub identities: Arc<IdentityVerifier>,
    pub propagate_before_register: bool,
}

impl AppState {
    /// Wires the service from configuration, including the real HTTP clients.
    pub async fn from_config(config: &RegistryConfig) -> Result<Self, StartupError> {
        let ledger = open_ledger(&config.ledger_url).await?;
        let timeout = config.request_timeout();

        let builder = HttpBuilderClient::new(&config.builder_url, timeout)
            .map_err(|e| StartupError::Client(e.to_string()))?;
        let analyzer = HttpAnalyzerClient::new(&config.analyzer_url, timeout)
            .map_err(|e| StartupError::Client(e.to_string()))?;
        let propagator =
            LibraryPropagator::new(config.propagation_targets(), config.propagation_mode, timeout)
                .map_err(|e| StartupError::Client(e.to_string()))?;

        let mut identities = IdentityVerifier::new(config.max_clock_skew_secs);
        for org in &config.organizations {
            identities.add_org(&org.id, &org.public_key)?;
        }
        if identities.is_empty() {
            tracing::warn!("no organizations configured; every authenticated route will refuse requests");
        }

        Ok(Self {
            programs: ProgramRegistry::new(ledger.clone(), Arc::new(builder), Arc::new(analyzer)),
            governance: LibraryGovernance::new(ledger),
            propagator: Arc::new(propagator),
            identities: Arc::new(identities),
            propagate_before_register: config.propagate_before_register,
        })
    }
}

pub async fn open_ledger(url: &str) -> Result<Ledger, LedgerError> {
    if url == "memory" {
        return Ok(Ledger::new(Arc::new(MemoryStore::new())));
    }
    let store = SqliteStore::connect(url).await?;
    Ok(Ledger::new(Arc::new(store)))
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("Failed to build service client: {0}")]
    Client(String),
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/programs", post(register_program).get(list_programs))
        .route(
            "/v1/programs/:measurement",
            get(get_program).delete(revoke_program),
        )
        .route("/v1/participants", post(join).get(list_participants))
        .route("/v1/library", get(get_library))
        .route("/v1/library/proposals", post(propose).get(list_proposals))
        .route("/v1/library/proposals/:name", get(get_proposal))
        .route("/v1/library/proposals/:name/votes", post(vote))
        .route("/v1/library/propagate", post(propagate))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body shared by every route.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retryable: bool,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
            "retryable": self.retryable,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Conflict { .. } => Self {
                status: StatusCode::CONFLICT,
                kind: "conflict",
                message: err.to_string(),
                retryable: true,
            },
            other => {
                tracing::error!(error = %other, "ledger failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "ledger", other.to_string())
            }
        }
    }
}

impl From<ProgramError> for ApiError {
    fn from(err: ProgramError) -> Self {
        match err {
            ProgramError::InvalidSource(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_source", err.to_string()),
            ProgramError::Build(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "build", err.to_string()),
            ProgramError::Verification(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "verification", err.to_string())
            }
            ProgramError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            ProgramError::Ledger(e) => e.into(),
        }
    }
}

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            GovernanceError::Duplicate(_) => Self::new(StatusCode::CONFLICT, "duplicate", err.to_string()),
            GovernanceError::AlreadyRejected(_) => {
                Self::new(StatusCode::CONFLICT, "already_rejected", err.to_string())
            }
            GovernanceError::NotOnBallot { .. } => {
                Self::new(StatusCode::CONFLICT, "not_on_ballot", err.to_string())
            }
            GovernanceError::InvalidName(_) | GovernanceError::EmptyBody(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_proposal", err.to_string())
            }
            GovernanceError::Ledger(e) => e.into(),
        }
    }
}

impl From<PropagationError> for ApiError {
    fn from(err: PropagationError) -> Self {
        match err {
            PropagationError::Governance(e) => e.into(),
            other => Self::new(StatusCode::BAD_GATEWAY, "propagation", other.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &'static str) -> Result<String, IdentityError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(IdentityError::MissingHeader(name))
}

fn signed_headers(headers: &HeaderMap) -> Result<SignedHeaders, IdentityError> {
    Ok(SignedHeaders {
        org: header_value(headers, ORG_HEADER)?,
        timestamp: header_value(headers, TIMESTAMP_HEADER)?,
        signature: header_value(headers, SIGNATURE_HEADER)?,
    })
}

/// Verifies the request signature over method, path and body, then records the caller.
async fn authenticate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?;

    let credentials = signed_headers(&parts.headers)?;
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let org = match state
        .identities
        .verify(&credentials, parts.method.as_str(), &path, &bytes)
    {
        Ok(org) => org,
        Err(e) => {
            tracing::warn!(org = %credentials.org, error = %e, "request authentication failed");
            return Err(e.into());
        }
    };

    parts.extensions.insert(Caller(org));
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterProgramRequest {
    pub source: String,
    pub spid: String,
    pub linkable: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterProgramResponse {
    pub status: String,
    pub summary: String,
    pub spec: ProcessingSpec,
}

async fn register_program(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(request): Json<RegisterProgramRequest>,
) -> Result<(StatusCode, Json<RegisterProgramResponse>), ApiError> {
    if request.spid.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Required field is not provided: spid",
        ));
    }

    // Builders must measure against the library as currently approved.
    if state.propagate_before_register {
        state
            .propagator
            .propagate_library(&caller, &state.governance)
            .await?;
    }

    let params = BuildParams::new(request.spid, request.linkable);
    let registration = state
        .programs
        .register_program(&caller, &request.source, &params)
        .await?;

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RegisterProgramResponse {
            status: "completed".to_string(),
            summary: registration.spec.summary(),
            spec: registration.spec,
        }),
    ))
}

async fn list_programs(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<Json<Vec<ProcessingSpec>>, ApiError> {
    Ok(Json(state.programs.list_processing_specs(&caller).await?))
}

async fn get_program(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(measurement): Path<String>,
) -> Result<Json<ProcessingSpec>, ApiError> {
    Ok(Json(
        state
            .programs
            .get_processing_spec(&caller, &measurement)
            .await?,
    ))
}

async fn revoke_program(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(measurement): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .programs
        .revoke_processing_spec(&caller, &measurement)
        .await?;
    Ok(Json(serde_json::json!({ "revoked": measurement })))
}

async fn join(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<Json<Participant>, ApiError> {
    Ok(Json(state.governance.register_participant(&caller).await?))
}

async fn list_participants(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<Json<Vec<Participant>>, ApiError> {
    Ok(Json(state.governance.list_participants(&caller).await?))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProposeRequest {
    pub name: String,
    pub source: String,
}

async fn propose(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Json(request): Json<ProposeRequest>,
) -> Result<(StatusCode, Json<LibraryFunction>), ApiError> {
    let function = state
        .governance
        .propose_function(&caller, &request.name, &request.source)
        .await?;
    Ok((StatusCode::CREATED, Json(function)))
}

async fn list_proposals(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<Json<Vec<LibraryFunction>>, ApiError> {
    Ok(Json(state.governance.list_proposals(&caller).await?))
}

async fn get_proposal(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<LibraryFunction>, ApiError> {
    Ok(Json(state.governance.get_proposal(&caller, &name).await?))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VoteRequest {
    pub approve: bool,
}

async fn vote(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Path(name): Path<String>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<VoteOutcome>, ApiError> {
    Ok(Json(
        state.governance.vote(&caller, &name, request.approve).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct LibraryQuery {
    pub accepted_before: Option<String>,
}

/// Accepts RFC 3339 or the ledger's `YYYY-MM-DD HH:MM:SS` (UTC) form.
fn parse_cutoff(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

async fn get_library(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    Query(query): Query<LibraryQuery>,
) -> Result<Response, ApiError> {
    let bundle = match query.accepted_before.as_deref() {
        None | Some("") => state.governance.current_library_bundle(&caller).await?,
        Some(raw) => {
            let cutoff = parse_cutoff(raw).ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    format!("Invalid accepted_before timestamp: {}", raw),
                )
            })?;
            state
                .governance
                .library_bundle_as_of(&caller, cutoff)
                .await?
        }
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], bundle).into_response())
}

async fn propagate(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<Json<PropagationReport>, ApiError> {
    Ok(Json(
        state
            .propagator
            .propagate_library(&caller, &state.governance)
            .await?,
    ))
}
