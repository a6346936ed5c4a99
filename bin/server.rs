// co3 - Web Server
// Read-only REST API over a co3 database

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use co3::{
    Co3Error, DatabaseConfig, OrderBy, QueryResult, SearchOptions, SearchResults, SelectOptions,
    SqlDatabase,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<SqlDatabase>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

fn respond<T: Serialize>(context: &str, result: co3::Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            error!("Error {}: {}", context, e);
            let status = match e {
                Co3Error::TableNotFound(_) => StatusCode::NOT_FOUND,
                Co3Error::UnknownColumn { .. }
                | Co3Error::InvalidIdentifier(_)
                | Co3Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ApiResponse::<T>::err(e.to_string()))).into_response()
        }
    }
}

/// Run `f` against the locked database
fn with_db<T>(state: &AppState, f: impl FnOnce(&mut SqlDatabase) -> co3::Result<T>) -> co3::Result<T> {
    let mut db = state
        .db
        .lock()
        .map_err(|_| Co3Error::LockPoisoned("database"))?;
    f(&mut db)
}

/// Table listing entry
#[derive(Serialize)]
struct TableResponse {
    name: String,
    columns: Vec<String>,
}

/// Query string for GET selects
#[derive(Deserialize, Default)]
struct SelectParams {
    /// Comma separated
    cols: Option<String>,
    /// `column [asc|desc]`
    order_by: Option<String>,
    #[serde(default)]
    limit: usize,
}

impl SelectParams {
    fn into_options(self) -> co3::Result<SelectOptions> {
        let mut opts = SelectOptions::new().limit(self.limit).include_cols();
        if let Some(cols) = self.cols {
            opts = opts.cols(cols.split(',').map(str::trim).filter(|c| !c.is_empty()));
        }
        if let Some(order) = self.order_by {
            opts = opts.order_by(OrderBy::parse(&order)?);
        }
        Ok(opts)
    }
}

/// Query string for searches
#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    search_cols: Option<String>,
    tokenizer: Option<String>,
    limit: Option<usize>,
    group_by: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/tables - List tables with their columns
async fn get_tables(State(state): State<AppState>) -> Response {
    let result = with_db(&state, |db| {
        db.access()
            .table_names()?
            .into_iter()
            .map(|name| {
                let columns = db.access().table_columns(&name)?;
                Ok(TableResponse { name, columns })
            })
            .collect::<co3::Result<Vec<_>>>()
    });
    respond("listing tables", result)
}

/// GET /api/select/:table - Cached select with query string options
async fn get_select(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(params): Query<SelectParams>,
) -> Response {
    let result = with_db(&state, |db| {
        let opts = params.into_options()?;
        let relation = db.relation(&table)?;
        let rows = db.index()?.select(&relation, &opts)?;
        Ok(QueryResult::clone(&rows))
    });
    respond(&format!("selecting from {}", table), result)
}

/// POST /api/select/:table - Cached select with a full JSON options body
async fn post_select(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(opts): Json<SelectOptions>,
) -> Response {
    let result = with_db(&state, |db| {
        let relation = db.relation(&table)?;
        let rows = db.index()?.select(&relation, &opts)?;
        Ok(QueryResult::clone(&rows))
    });
    respond(&format!("selecting from {}", table), result)
}

/// GET /api/group/:table/:column - Rows grouped by a column value
async fn get_group(
    State(state): State<AppState>,
    Path((table, column)): Path<(String, String)>,
    Query(params): Query<SelectParams>,
) -> Response {
    let result = with_db(&state, |db| {
        let opts = params.into_options()?;
        let relation = db.relation(&table)?;
        let groups = db.index()?.group_by(&relation, &column, &opts)?;
        Ok(BTreeMap::clone(&groups))
    });
    respond(&format!("grouping {} by {}", table, column), result)
}

/// GET /api/search/:name - Full-text search
async fn get_search(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<SearchParams>,
) -> Response {
    let defaults = SearchOptions::new(name.clone());
    let opts = SearchOptions {
        q: params.q,
        search_cols: params.search_cols,
        tokenizer: params.tokenizer.unwrap_or(defaults.tokenizer.clone()),
        limit: params.limit.unwrap_or(defaults.limit),
        group_by: params.group_by,
        ..defaults
    };

    let result: co3::Result<SearchResults> = with_db(&state, |db| db.fts().search(&opts));
    respond(&format!("searching {}", name), result)
}

/// GET /api/stats - Read cache statistics
async fn get_stats(State(state): State<AppState>) -> Response {
    let result = with_db(&state, |db| db.index()?.stats());
    respond("reading cache stats", result)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("🌐 co3 - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = DatabaseConfig::from_env();
    let db_path = config.path.clone();
    if !config.is_memory() && !db_path.exists() {
        anyhow::bail!(
            "Database not found at {:?}; run `co3 schema apply <schema.json>` first",
            db_path
        );
    }

    let db = SqlDatabase::open(config).context("Failed to open database")?;
    println!("✓ Database opened: {:?}", db_path);
    let compositions = db.compose().table_names();
    if !compositions.is_empty() {
        println!("✓ Compositions: {}", compositions.join(", "));
    }

    // Create shared state
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/tables", get(get_tables))
        .route("/select/:table", get(get_select).post(post_select))
        .route("/group/:table/:column", get(get_group))
        .route("/search/:name", get(get_search))
        .route("/stats", get(get_stats))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    // Start server
    let addr = std::env::var("CO3_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Listening on {}", addr);
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/tables", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}
