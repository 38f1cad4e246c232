//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/reindex` | Reindex the caller's repositories (`{token?, path?}`) |
//! | `POST` | `/index` | Reindex one repository (`{token?, repository}`) |
//! | `GET`/`POST` | `/search` | Scoped search (`q`, `kind`, `from`, `size`, `token`) |
//! | `GET`/`POST` | `/suggest` | Scoped prefix suggestions (`q`, `token`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The caller token is read from `Authorization: token <t>` (or `Bearer
//! <t>`), falling back to a `token` field in the body or query string.
//!
//! # Request signing
//!
//! When `server.key` is set, every request except `/health` must carry an
//! `X-Signature` header holding the hex HMAC-SHA256 of the request body
//! (`POST`) or of the raw query string (`GET`). Missing or wrong
//! signatures are rejected with 401.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "authorization_denied", "message": "..." } }
//! ```
//!
//! | Error | Status |
//! |-------|--------|
//! | malformed request | 400 |
//! | bad signature | 401 |
//! | authorization denied | 403 |
//! | backend unavailable / rejected | 502 |
//! | authorization service unavailable | 503 |
//! | timeout | 504 |

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::access::{AccessControl, CallerToken, GinAccessClient, PermissionResolver};
use crate::backend::{ElasticClient, SearchBackend};
use crate::config::Config;
use crate::error::Error;
use crate::indexer::{IndexNames, Indexer};
use crate::query::{QueryGateway, SearchKind, SearchRequest};
use crate::reindex::{ReindexReport, Reindexer};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Upper bound on buffered request bodies.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub reindexer: Reindexer,
    pub gateway: Arc<QueryGateway>,
}

impl AppState {
    /// Wires the pipeline components around the given access-control and
    /// backend clients.
    pub fn new(
        config: Config,
        access: Arc<dyn AccessControl>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        let config = Arc::new(config);
        let resolver = PermissionResolver::new(access);
        let indices = IndexNames::from_config(&config.backend);
        let indexer = Arc::new(Indexer::new(backend.clone(), indices.clone()));
        let reindexer = Reindexer::from_config(&config, resolver.clone(), indexer);
        let gateway = Arc::new(QueryGateway::new(resolver, backend, indices, &config.query));
        Self {
            config,
            reindexer,
            gateway,
        }
    }
}

/// Builds the router. `/health` is never subject to signature checks.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/reindex", post(handle_reindex))
        .route("/index", post(handle_index))
        .route("/search", get(handle_search_get).post(handle_search_post))
        .route("/suggest", get(handle_suggest_get).post(handle_suggest_post))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP server on `0.0.0.0:{server.port}`.
///
/// The search backend must be reachable (and its indices creatable) at
/// startup; otherwise this returns an error before binding.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let backend = Arc::new(ElasticClient::new(&config.backend)?);
    let indices = IndexNames::from_config(&config.backend);
    backend
        .init(&indices.all())
        .await
        .context("search backend is not reachable")?;
    let access = Arc::new(GinAccessClient::new(&config.access)?);

    let state = AppState::new(config.clone(), access, backend);
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    tracing::info!(%bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Error::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Error::AuthorizationServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendUnavailable(_) | Error::BackendRejected { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Extract(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::RepositoryUnreadable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "invalid_signature".to_string(),
        message: message.into(),
    }
}

// ============ Request signing ============

/// Hex HMAC-SHA256 of `data` under `key`.
pub fn sign(key: &str, data: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature.
fn signature_matches(key: &str, data: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(&expected).is_ok()
}

async fn verify_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = state.config.server.key.as_str();
    if key.is_empty() {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| bad_request(format!("unreadable request body: {}", e)))?;
    let signed: &[u8] = if parts.method == Method::GET {
        parts.uri.query().unwrap_or_default().as_bytes()
    } else {
        &bytes
    };
    let valid = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|sig| signature_matches(key, signed, sig));
    if !valid {
        tracing::warn!(path = %parts.uri.path(), "rejected request with invalid signature");
        return Err(unauthorized("missing or invalid request signature"));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

// ============ Caller token ============

/// Token from the `Authorization` header (`token <t>` or `Bearer <t>`),
/// otherwise `fallback`.
fn caller_token(headers: &HeaderMap, fallback: Option<String>) -> CallerToken {
    let from_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            (scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer"))
                .then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty());
    CallerToken::from_option(from_header.or(fallback))
}

/// Parses a JSON body; an empty body is the type's default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /reindex, POST /index ============

#[derive(Deserialize, Default)]
struct ReindexBody {
    token: Option<String>,
    path: Option<String>,
}

async fn handle_reindex(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReindexReport>, AppError> {
    let body: ReindexBody = parse_body(&body)?;
    let token = caller_token(&headers, body.token);
    let report = state.reindexer.reindex(&token, body.path.as_deref()).await?;
    Ok(Json(report))
}

#[derive(Deserialize, Default)]
struct IndexBody {
    token: Option<String>,
    #[serde(default)]
    repository: String,
}

async fn handle_index(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReindexReport>, AppError> {
    let body: IndexBody = parse_body(&body)?;
    if body.repository.trim().is_empty() {
        return Err(bad_request("repository must not be empty"));
    }
    let token = caller_token(&headers, body.token);
    let report = state
        .reindexer
        .reindex_repository(&token, &body.repository)
        .await?;
    Ok(Json(report))
}

// ============ /search, /suggest ============

#[derive(Deserialize, Default)]
struct SearchParams {
    #[serde(default, alias = "q")]
    query: String,
    #[serde(default)]
    kind: SearchKind,
    #[serde(default)]
    from: usize,
    size: Option<usize>,
    token: Option<String>,
}

impl SearchParams {
    fn into_parts(self) -> (SearchRequest, Option<String>) {
        let request = SearchRequest {
            query: self.query,
            kind: self.kind,
            from: self.from,
            size: self.size,
        };
        (request, self.token)
    }
}

async fn search(
    state: &AppState,
    headers: &HeaderMap,
    params: SearchParams,
) -> Result<Json<Value>, AppError> {
    let (request, token) = params.into_parts();
    let token = caller_token(headers, token);
    Ok(Json(state.gateway.search(&token, &request).await?))
}

async fn suggest(
    state: &AppState,
    headers: &HeaderMap,
    params: SearchParams,
) -> Result<Json<Value>, AppError> {
    let token = caller_token(headers, params.token);
    Ok(Json(state.gateway.suggest(&token, &params.query).await?))
}

async fn handle_search_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, AppError> {
    search(&state, &headers, params).await
}

async fn handle_search_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    search(&state, &headers, parse_body(&body)?).await
}

async fn handle_suggest_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, AppError> {
    suggest(&state, &headers, params).await
}

async fn handle_suggest_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    suggest(&state, &headers, parse_body(&body)?).await
}
