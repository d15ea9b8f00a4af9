// 🌐 Roastery Warehouse - Status Server
// Read-only REST API over batches, watermarks, quarantine and the catalog

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use roastery_warehouse::config::DEFAULT_CONFIG_PATH;
use roastery_warehouse::entities::get_all_items;
use roastery_warehouse::{
    get_all_watermarks, get_recent_batches, get_source_totals, get_unresolved_lines, init_logging,
    open_database, EtlError, Source, WarehouseConfig, VERSION,
};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

/// Run a query under the connection lock and wrap the result
fn respond<T, F>(state: &AppState, what: &str, query: F) -> Response
where
    T: Serialize,
    F: FnOnce(&Connection) -> roastery_warehouse::Result<T>,
{
    let result = state
        .db
        .lock()
        .map_err(|_| EtlError::LockPoisoned)
        .and_then(|conn| query(&*conn));

    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(err) => {
            error!(error = %err, "Error getting {}", what);
            failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    source: Option<String>,
    limit: Option<usize>,
}

impl ListParams {
    fn source(&self) -> std::result::Result<Option<Source>, Response> {
        self.source
            .as_deref()
            .map(|s| s.parse::<Source>())
            .transpose()
            .map_err(|msg| failure(StatusCode::BAD_REQUEST, msg))
    }

    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    sources: Vec<roastery_warehouse::SourceTotals>,
}

/// GET /api/health - Health check with per-source row counts
async fn health_check(State(state): State<AppState>) -> Response {
    respond(&state, "health", |conn| {
        Ok(Health {
            status: "OK",
            version: VERSION,
            sources: get_source_totals(conn)?,
        })
    })
}

/// GET /api/batches?source=&limit= - Most recent load batches
async fn list_batches(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let source = match params.source() {
        Ok(source) => source,
        Err(response) => return response,
    };
    respond(&state, "batches", |conn| get_recent_batches(conn, source, params.limit()))
}

/// GET /api/watermarks - Last committed cursor per source
async fn list_watermarks(State(state): State<AppState>) -> Response {
    respond(&state, "watermarks", get_all_watermarks)
}

/// GET /api/unresolved?source=&limit= - Quarantined lines, oldest first
async fn list_unresolved(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let source = match params.source() {
        Ok(source) => source,
        Err(response) => return response,
    };
    respond(&state, "unresolved lines", |conn| get_unresolved_lines(conn, source, params.limit()))
}

/// GET /api/items - The canonical catalog
async fn list_items(State(state): State<AppState>) -> Response {
    respond(&state, "items", get_all_items)
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/batches", get(list_batches))
        .route("/watermarks", get(list_watermarks))
        .route("/unresolved", get(list_unresolved))
        .route("/items", get(list_items))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("ROASTERY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = WarehouseConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let _guard = init_logging(&config.logging.clone().with_env_overrides()?)?;

    let conn = open_database(&config.database.path)
        .with_context(|| format!("Failed to open warehouse at {}", config.database.path.display()))?;
    info!(path = %config.database.path.display(), "Database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let addr = std::env::var("WAREHOUSE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Status server listening");
    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}
