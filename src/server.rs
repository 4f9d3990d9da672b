//! JSON HTTP API over the query service.
//!
//! # Endpoints
//!
//! | Method | Path | Tier | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/search` | public (premium for cross-project) | Semantic search |
//! | `GET`  | `/decisions` | public | List decision extractions |
//! | `GET`  | `/patterns` | public | List pattern extractions |
//! | `GET`  | `/warnings` | public | List warning extractions |
//! | `GET`  | `/methodologies` | registered | List methodology extractions |
//! | `GET`  | `/checklists` | registered | List checklist extractions |
//! | `GET`  | `/personas` | registered | List persona extractions |
//! | `GET`  | `/workflows` | registered | List workflow extractions |
//! | `GET`  | `/sources` | public | Source inventory with counts |
//! | `POST` | `/compare` | registered | Compare a query across sources |
//! | `GET`  | `/health` | — | Health check (returns version) |
//!
//! Credentials arrive in the `x-api-key` header; requests without one
//! run as the public tier. Authorization and rate limiting run before
//! anything else in every handler.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "VALIDATION_ERROR", "message": "query must not be empty" } }
//! ```
//!
//! `RATE_LIMITED` responses carry `retry_after_secs` in the body and a
//! `Retry-After` header. 5xx responses carry a `correlation_id` that is
//! also logged server-side; the underlying message is never exposed.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients.

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, FromRequest, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::auth::{AccessControl, Operation};
use crate::config::Config;
use crate::error::Error;
use crate::models::ExtractionType;
use crate::query::{CompareResponse, QueryService, SearchRequest};
use crate::store::{DocumentStore, SourceSummary, DEFAULT_PAGE_SIZE};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    query: Arc<QueryService>,
    store: Arc<DocumentStore>,
    access: Arc<AccessControl>,
    default_project: String,
}

/// Start the HTTP server on the configured bind address. Runs until
/// the process is terminated.
pub async fn run_server(
    config: &Config,
    query: Arc<QueryService>,
    store: Arc<DocumentStore>,
) -> anyhow::Result<()> {
    let access = Arc::new(AccessControl::new(&config.auth, config.rate_limit.clone())?);

    let state = AppState {
        query,
        store,
        access,
        default_project: config.default_project.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/search", post(handle_search))
        .route("/decisions", get(handle_decisions))
        .route("/patterns", get(handle_patterns))
        .route("/warnings", get(handle_warnings))
        .route("/methodologies", get(handle_methodologies))
        .route("/checklists", get(handle_checklists))
        .route("/personas", get(handle_personas))
        .route("/workflows", get(handle_workflows))
        .route("/sources", get(handle_sources))
        .route("/compare", post(handle_compare))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    println!("knowledge API listening on http://{bind_addr}");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

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
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

/// Wrapper turning a core [`Error`] into an HTTP response with the
/// wire error envelope.
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code().to_string();

        let (status, message, retry_after_secs, correlation_id) = match &self.0 {
            Error::Validation(m) => (StatusCode::BAD_REQUEST, m.clone(), None, None),
            Error::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone(), None, None),
            Error::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone(), None, None),
            Error::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), None, None),
            Error::DuplicateId(m) => (StatusCode::CONFLICT, m.clone(), None, None),
            Error::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded".to_string(),
                Some(retry_after.as_secs().max(1)),
                None,
            ),
            Error::Embedding(_) | Error::Upstream(_) | Error::Internal(_) => {
                // Log the detail server-side; the caller sees only the
                // correlation id.
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(correlation_id = %correlation_id, error = %self.0, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                    None,
                    Some(correlation_id),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message,
                retry_after_secs,
                correlation_id,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

/// JSON body extractor whose rejections (malformed body, unknown
/// fields) come back in the wire error envelope instead of axum's
/// plain-text default.
#[derive(Debug)]
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(Error::Validation(rejection.body_text()))),
        }
    }
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
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

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let operation = if request.cross_project {
        Operation::CrossProjectSearch
    } else {
        Operation::SearchKnowledge
    };
    state
        .access
        .authorize(api_key(&headers), &addr.ip().to_string(), operation)?;

    let response = state.query.search_knowledge(&request).await?;
    Ok(Json(serde_json::to_value(response).map_err(Error::from)?))
}

// ============ GET /{extraction listings} ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    page_size: Option<i64>,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<crate::models::Extraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

async fn list_by_type(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    params: ListParams,
    extraction_type: ExtractionType,
) -> Result<Json<ListResponse>, ApiError> {
    state.access.authorize(
        api_key(headers),
        &addr.ip().to_string(),
        Operation::GetByType(extraction_type),
    )?;

    let page = state
        .query
        .get_by_type(
            params.project.as_deref(),
            extraction_type,
            params.topic.as_deref(),
            params.cursor.as_deref(),
            params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;

    Ok(Json(ListResponse {
        items: page.items,
        next_cursor: page.next_cursor,
    }))
}

macro_rules! list_handler {
    ($name:ident, $variant:ident) => {
        async fn $name(
            State(state): State<AppState>,
            ConnectInfo(addr): ConnectInfo<SocketAddr>,
            headers: HeaderMap,
            Query(params): Query<ListParams>,
        ) -> Result<Json<ListResponse>, ApiError> {
            list_by_type(&state, addr, &headers, params, ExtractionType::$variant).await
        }
    };
}

list_handler!(handle_decisions, Decision);
list_handler!(handle_patterns, Pattern);
list_handler!(handle_warnings, Warning);
list_handler!(handle_methodologies, Methodology);
list_handler!(handle_checklists, Checklist);
list_handler!(handle_personas, Persona);
list_handler!(handle_workflows, Workflow);

// ============ GET /sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceSummary>,
}

async fn handle_sources(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<SourcesResponse>, ApiError> {
    state.access.authorize(
        api_key(&headers),
        &addr.ip().to_string(),
        Operation::ListSources,
    )?;

    let project = params.project.as_deref().unwrap_or(&state.default_project);
    let sources = state.store.list_sources(project).await?;
    Ok(Json(SourcesResponse { sources }))
}

// ============ POST /compare ============

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompareRequest {
    topic: String,
    #[serde(default)]
    project_id: Option<String>,
    source_ids: Vec<String>,
}

async fn handle_compare(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CompareRequest>,
) -> Result<Json<CompareResponse>, ApiError> {
    state.access.authorize(
        api_key(&headers),
        &addr.ip().to_string(),
        Operation::CompareSources,
    )?;

    let response = state
        .query
        .compare_across_sources(
            request.project_id.as_deref(),
            &request.topic,
            &request.source_ids,
        )
        .await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};

    #[tokio::test]
    async fn test_unknown_filter_field_gets_validation_envelope() {
        let req = Request::builder()
            .method("POST")
            .uri("/search")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "rag", "projcet_id": "p1"}"#))
            .unwrap();

        let err = ApiJson::<SearchRequest>::from_request(req, &())
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_malformed_body_gets_validation_envelope() {
        let req = Request::builder()
            .method("POST")
            .uri("/compare")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let err = ApiJson::<CompareRequest>::from_request(req, &())
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }
}
