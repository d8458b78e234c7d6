//! Axum router and all HTTP handlers for mdr-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)`; scenario tests in `tests/`
//! compose the router directly.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use mdr_db::StoreError;
use mdr_schemas::{CanonicalQuery, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, Pagination, RecordsParams, RecordsResponse, ResponseMeta,
        RunsParams, RunsResponse, TriggerResponse,
    },
    state::{AppState, SweepTrigger},
};

pub const SCHEDULER_TOKEN_HEADER: &str = "x-scheduler-token";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/v1/records", get(records))
        .route("/v1/runs", get(runs))
        .route("/v1/trigger", post(trigger))
        .route("/v1/admin/purge/:source", post(purge))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

fn store_error(e: &StoreError) -> Response {
    let status = match e {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %e, "store call failed");
    error(status, e.to_string())
}

/// `None` when the caller may proceed; otherwise the 401 to return.
fn check_token(st: &AppState, headers: &HeaderMap) -> Option<Response> {
    let expected = st.scheduler_token.as_deref()?;
    let given = headers
        .get(SCHEDULER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if given == Some(expected) {
        None
    } else {
        Some(error(StatusCode::UNAUTHORIZED, "invalid scheduler token"))
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Response {
    let reach = st.store.ping().await;
    let last_run = match &reach {
        Ok(()) => st
            .store
            .list_runs(None, 1)
            .await
            .ok()
            .and_then(|mut v| v.pop()),
        Err(_) => None,
    };
    let body = HealthResponse {
        ok: reach.is_ok(),
        service: st.build.service.to_string(),
        version: st.build.version.to_string(),
        store_reachable: reach.is_ok(),
        last_run,
        last_sweep: st.last_sweep.read().await.clone(),
        sources: st.orchestrator.source_labels(),
        timestamp: Utc::now(),
        error: reach.as_ref().err().map(ToString::to_string),
    };
    let status = if body.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/stats
// ---------------------------------------------------------------------------

pub(crate) async fn stats(State(st): State<Arc<AppState>>) -> Response {
    match st.store.stats().await {
        Ok(s) => (StatusCode::OK, Json(s)).into_response(),
        Err(e) => store_error(&e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/records
// ---------------------------------------------------------------------------

pub(crate) async fn records(
    State(st): State<Arc<AppState>>,
    Query(params): Query<RecordsParams>,
) -> Response {
    let started = Instant::now();
    if let Some(l) = params.limit {
        if !(1..=MAX_PAGE_LIMIT).contains(&l) {
            return error(
                StatusCode::BAD_REQUEST,
                format!("limit must be within 1..={MAX_PAGE_LIMIT}"),
            );
        }
    }
    if params.offset.is_some_and(|o| o < 0) {
        return error(StatusCode::BAD_REQUEST, "offset must be >= 0");
    }

    let query = CanonicalQuery::from(params);
    let page = match st.store.list_canonical(&query).await {
        Ok(p) => p,
        Err(e) => return store_error(&e),
    };
    let body = RecordsResponse {
        pagination: Pagination {
            limit: page.limit,
            offset: page.offset,
            returned: page.records.len(),
            total: page.total,
        },
        data: page.records,
        meta: ResponseMeta {
            request_id: Uuid::new_v4(),
            api_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        },
    };
    (StatusCode::OK, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/runs
// ---------------------------------------------------------------------------

pub(crate) async fn runs(
    State(st): State<Arc<AppState>>,
    Query(params): Query<RunsParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    match st.store.list_runs(params.source.as_deref(), limit).await {
        Ok(runs) => (StatusCode::OK, Json(RunsResponse { runs })).into_response(),
        Err(e) => store_error(&e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/trigger
// ---------------------------------------------------------------------------

/// Start a sweep in the background and return immediately.
pub(crate) async fn trigger(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(denied) = check_token(&st, &headers) {
        return denied;
    }

    let trigger_id = Uuid::new_v4();
    let bg = Arc::clone(&st);
    tokio::spawn(async move {
        bg.sweep(SweepTrigger::Manual).await;
    });

    info!(%trigger_id, "trigger accepted");
    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            status: "triggered".to_string(),
            trigger_id,
            sources: st.orchestrator.source_labels(),
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/admin/purge/:source
// ---------------------------------------------------------------------------

pub(crate) async fn purge(
    State(st): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(denied) = check_token(&st, &headers) {
        return denied;
    }
    let source = source.trim();
    if source.is_empty() {
        return error(StatusCode::BAD_REQUEST, "source label must not be empty");
    }

    match st.store.purge_source(source).await {
        Ok(report) => {
            info!(
                source,
                canonical = report.canonical,
                runs = report.runs,
                checkpoints = report.checkpoints,
                raw = report.raw,
                "source purged"
            );
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => store_error(&e),
    }
}
