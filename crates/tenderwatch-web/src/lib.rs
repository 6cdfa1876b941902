//! Read-only JSON lookup over persisted tenders.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tenderwatch_core::Tender;
use tenderwatch_storage::{StoreError, TenderStore};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tenderwatch-web";

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TenderStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn TenderStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TenderList {
    count: usize,
    tenders: Vec<Tender>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/tenders", get(list_tenders_handler))
        // Bid numbers contain slashes, so the key is taken as a wildcard.
        .route("/api/tenders/{*tender_no}", get(tender_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "tender lookup listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_tenders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    match state.store.list_recent(limit).await {
        Ok(tenders) => Json(TenderList {
            count: tenders.len(),
            tenders,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn tender_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(tender_no): Path<String>,
) -> Response {
    let tender_no = tender_no.trim_start_matches('/');
    match state.store.find_by_tender_no(tender_no).await {
        Ok(Some(tender)) => Json(tender).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("tender {tender_no} not found"),
            }),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "tender store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: "tender store unavailable".to_string(),
        }),
    )
        .into_response()
}
