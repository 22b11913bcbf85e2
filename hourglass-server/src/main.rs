use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use uuid::Uuid;

use hourglass_core::{HttpReportExecutor, SystemClock};
use hourglass_server::config::Config;
use hourglass_server::ledger::SqliteLedger;
use hourglass_server::repair::{run_repair, RepairError, RepairRequest, StoppedReason};
use hourglass_server::status::LedgerStatusData;
use hourglass_server::{get_service_version, AppState};

/// Upper bound for row listings; a 30-day lookback is 720 rows, so this is
/// generous without letting one request stream the whole table.
const MAX_LIST_LIMIT: usize = 10_000;

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "hourglass",
        "version": get_service_version(),
    }))
}

#[derive(Debug, Deserialize)]
struct RowsParams {
    limit: Option<usize>,
}

async fn ledger_rows_handler(
    Path(namespace): Path<String>,
    Query(params): Query<RowsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let limit = params.limit.unwrap_or(168).min(MAX_LIST_LIMIT);

    match state.store.list(&namespace, limit).await {
        Ok(rows) => Json(json!({ "namespace": namespace, "rows": rows })).into_response(),
        Err(e) => storage_error_response(&namespace, e),
    }
}

async fn ledger_summary_handler(
    Path(namespace): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.store.list(&namespace, MAX_LIST_LIMIT).await {
        Ok(rows) => {
            let data = LedgerStatusData::from_entries(
                namespace,
                &rows,
                state.clock.now(),
                get_service_version(),
            );
            Json(data).into_response()
        }
        Err(e) => storage_error_response(&namespace, e),
    }
}

/// Request body for a repair trigger. Everything defaults so a bare `{}`
/// runs a standard 30-day backfill.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RepairParams {
    lookback_hours: i64,
    max_reports: usize,
    max_runtime_seconds: i64,
    dry_run: bool,
    burst_enabled: bool,
    burst_window_hours: usize,
}

impl Default for RepairParams {
    fn default() -> Self {
        Self {
            lookback_hours: 720,
            max_reports: 10,
            max_runtime_seconds: 600,
            dry_run: false,
            burst_enabled: false,
            burst_window_hours: 6,
        }
    }
}

async fn repair_handler(
    Path(namespace): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(params): Json<RepairParams>,
) -> Response {
    let request = RepairRequest {
        namespace,
        lookback_hours: params.lookback_hours,
        max_reports: params.max_reports,
        max_runtime: Duration::seconds(params.max_runtime_seconds),
        dry_run: params.dry_run,
        burst_enabled: params.burst_enabled,
        burst_window_hours: params.burst_window_hours,
        owner: format!("repair-{}", Uuid::new_v4()),
        lock_ttl: Duration::seconds(state.config.lock_ttl_seconds),
        failure_cooldown_minutes: state.config.failure_cooldown_minutes,
        quota_cooldown_minutes: state.config.quota_cooldown_minutes,
    };

    match run_repair(
        state.store.as_ref(),
        state.executor.as_ref(),
        state.clock.as_ref(),
        request,
    )
    .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(RepairError::Configuration(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "invalid_request", "error": message })),
        )
            .into_response(),
        Err(RepairError::Store(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "storage_error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn storage_error_response(namespace: &str, error: impl std::fmt::Display) -> Response {
    error!(namespace, %error, "ledger read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "storage_error", "error": error.to_string() })),
    )
        .into_response()
}

/// Steady-state sync: keep the most recent hours of every configured
/// namespace current by reusing the repair primitives with a small lookback.
///
/// Mutual exclusion against on-demand repair runs comes entirely from the
/// durable worker lock; a busy lock here is a normal skip, not an error.
/// When a run reports quota exhaustion the namespace sits out until the
/// cooldown passes; the per-hour backoff in the ledger is durable, this is
/// just the caller-side pacing on top of it.
async fn sync_loop(state: Arc<AppState>) {
    let mut ticker = interval(std::time::Duration::from_secs(
        state.config.sync_interval_seconds,
    ));
    let mut quota_cooldown_until: HashMap<String, DateTime<Utc>> = HashMap::new();

    loop {
        ticker.tick().await;

        for namespace in &state.config.sync_namespaces {
            let now = state.clock.now();
            if quota_cooldown_until
                .get(namespace)
                .is_some_and(|&until| now < until)
            {
                continue;
            }

            let request = RepairRequest {
                namespace: namespace.clone(),
                lookback_hours: state.config.sync_lookback_hours,
                max_reports: 4,
                max_runtime: Duration::seconds(state.config.sync_interval_seconds as i64),
                dry_run: false,
                burst_enabled: false,
                burst_window_hours: 1,
                owner: format!("sync-{}", Uuid::new_v4()),
                lock_ttl: Duration::seconds(state.config.lock_ttl_seconds),
                failure_cooldown_minutes: state.config.failure_cooldown_minutes,
                quota_cooldown_minutes: state.config.quota_cooldown_minutes,
            };

            match run_repair(
                state.store.as_ref(),
                state.executor.as_ref(),
                state.clock.as_ref(),
                request,
            )
            .await
            {
                Ok(summary) => {
                    if summary.stopped_reason == StoppedReason::LockBusy {
                        info!(namespace, "sync skipped; namespace lock busy");
                    }
                    if summary.quota_exhausted {
                        let until =
                            now + Duration::minutes(state.config.quota_cooldown_minutes);
                        info!(namespace, %until, "report quota exhausted; pausing sync");
                        quota_cooldown_until.insert(namespace.clone(), until);
                    }
                }
                Err(e) => {
                    error!(namespace, error = %e, "sync run failed");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting hourglass report ingestion service");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let db_path = config.state_dir.join("hourglass-ledger.db");
    info!("Using ledger database: {}", db_path.display());
    let store = SqliteLedger::new(&db_path).expect("Failed to initialize ledger database");

    let app_state = Arc::new(AppState {
        store: Arc::new(store),
        executor: Arc::new(HttpReportExecutor::new(&config.report_api_url)),
        clock: Arc::new(SystemClock),
        config,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ledger/{namespace}", get(ledger_rows_handler))
        .route("/ledger/{namespace}/summary", get(ledger_summary_handler))
        .route("/repair/{namespace}", post(repair_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state.clone());

    if app_state.config.sync_namespaces.is_empty() {
        info!("SYNC_NAMESPACES not set; steady-state sync loop disabled");
    } else {
        let sync_state = app_state.clone();
        tokio::spawn(async move {
            sync_loop(sync_state).await;
        });
    }

    let listener = TcpListener::bind(format!("0.0.0.0:{}", app_state.config.port)).await?;
    info!("Server listening on port {}", app_state.config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
