//! Axum JSON surface: filter metadata, color search and a readiness probe.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gcf_catalog::CatalogSnapshot;
use gcf_core::{Backdrop, Collection, Color};
use gcf_search::{SearchError, SearchParams, SearchPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gcf-web";

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogSnapshot>,
    pub pipeline: Arc<SearchPipeline>,
}

impl AppState {
    pub fn new(catalog: CatalogSnapshot, pipeline: SearchPipeline) -> Self {
        Self {
            catalog: Arc::new(catalog),
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::default().port),
        }
    }
}

#[derive(Debug, Serialize)]
struct ColorOption {
    name: Color,
}

#[derive(Debug, Serialize)]
struct FiltersResponse<'a> {
    collections: &'a [Collection],
    colors: Vec<ColorOption>,
    backdrops: &'a [Backdrop],
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    indexed_pairs: usize,
    built_at: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn search_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/filters", get(filters_handler))
        .route("/search", get(search_handler))
}

/// Search routes are served both at the root and under `/api`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(search_routes())
        .nest("/api", search_routes())
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received terminate signal"),
    }
}

async fn filters_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = FiltersResponse {
        collections: &state.catalog.collections,
        colors: Color::ALL.into_iter().map(|name| ColorOption { name }).collect(),
        backdrops: &state.catalog.backdrops,
    };
    Json(body).into_response()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    match state.pipeline.search_params(params).await {
        Ok(gifts) => Json(gifts).into_response(),
        Err(err) => client_error(err),
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(HealthResponse {
        status: "ok",
        indexed_pairs: state.catalog.index.len(),
        built_at: state.catalog.built_at.to_rfc3339(),
    })
    .into_response()
}

fn client_error(err: SearchError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}
