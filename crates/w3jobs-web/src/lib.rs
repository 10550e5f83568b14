//! Axum JSON API: kick off a search in the background, poll it by id,
//! inspect the source catalog.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use w3jobs_aggregate::{run_with_config, AggregatorConfig, SourceRegistry};
use w3jobs_core::{AggregationResult, ListingRecord, SourceDescriptor, SourceKind};

pub const CRATE_NAME: &str = "w3jobs-web";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<SourceRegistry>,
    config: Arc<AggregatorConfig>,
    searches: Arc<RwLock<HashMap<Uuid, SearchState>>>,
}

impl AppState {
    pub fn new(registry: SourceRegistry, config: AggregatorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
            searches: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Clone)]
enum SearchState {
    Searching,
    Completed(ResultDocument),
    Error(String),
}

/// Wire shape of a finished search, also what the CLI prints as `--json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDocument {
    pub total: usize,
    pub updated: DateTime<Utc>,
    pub sources: Vec<SourceCountRow>,
    pub jobs: Vec<ListingRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCountRow {
    pub source: String,
    pub count: usize,
}

impl ResultDocument {
    pub fn from_result(result: AggregationResult) -> Self {
        Self {
            total: result.total(),
            updated: Utc::now(),
            sources: result
                .counts_by_source
                .iter()
                .map(|c| SourceCountRow {
                    source: c.source.clone(),
                    count: c.count,
                })
                .collect(),
            jobs: result.records,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct SearchRequest {
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SearchAccepted {
    success: bool,
    search_id: Uuid,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct SourceCatalogRow {
    id: String,
    name: String,
    kind: &'static str,
    enabled: bool,
    accounts: usize,
}

impl SourceCatalogRow {
    fn from_descriptor(source: &SourceDescriptor) -> Self {
        Self {
            id: source.id.clone(),
            name: source.display_name.clone(),
            kind: match source.kind {
                SourceKind::Api => "api",
                SourceKind::Html => "html",
            },
            enabled: source.enabled,
            accounts: source.accounts.len(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/search", post(start_search_handler))
        .route("/api/search/{id}", get(poll_search_handler))
        .route("/api/sources", get(sources_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("W3JOBS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(port).await
}

pub async fn serve(port: u16) -> anyhow::Result<()> {
    let state = AppState::new(SourceRegistry::builtin(), AggregatorConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Accept the search, spawn the aggregation in a detached task, and hand
/// back an id for polling. Panicking or failing runs land in the map as
/// an error state rather than poisoning the server.
async fn start_search_handler(
    State(state): State<AppState>,
    body: Option<Json<SearchRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let search_id = Uuid::new_v4();
    state
        .searches
        .write()
        .await
        .insert(search_id, SearchState::Searching);
    info!(%search_id, keywords = request.keywords.len(), "search accepted");

    let registry = Arc::clone(&state.registry);
    let config = Arc::clone(&state.config);
    let searches = Arc::clone(&state.searches);
    tokio::spawn(async move {
        let keywords = request.keywords;
        let keyword_slice = (!keywords.is_empty()).then_some(keywords.as_slice());
        let outcome = run_with_config(registry.list(), keyword_slice, &config).await;
        let final_state = match outcome {
            Ok(result) => SearchState::Completed(ResultDocument::from_result(result)),
            Err(err) => {
                warn!(%search_id, error = %err, "search failed");
                SearchState::Error(err.to_string())
            }
        };
        searches.write().await.insert(search_id, final_state);
    });

    (
        StatusCode::ACCEPTED,
        Json(SearchAccepted {
            success: true,
            search_id,
            status: "searching",
        }),
    )
        .into_response()
}

async fn poll_search_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let searches = state.searches.read().await;
    match searches.get(&id) {
        Some(SearchState::Searching) => {
            Json(serde_json::json!({ "success": true, "status": "searching" })).into_response()
        }
        Some(SearchState::Completed(doc)) => Json(serde_json::json!({
            "success": true,
            "status": "completed",
            "result": doc,
        }))
        .into_response(),
        Some(SearchState::Error(message)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "success": false,
                "status": "error",
                "error": message,
            })),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "success": false, "error": "unknown search id" })),
        )
            .into_response(),
    }
}

async fn sources_handler(State(state): State<AppState>) -> Response {
    let rows: Vec<SourceCatalogRow> = state
        .registry
        .list()
        .iter()
        .map(SourceCatalogRow::from_descriptor)
        .collect();
    Json(rows).into_response()
}
