use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::coordinator::ApplianceOverview;
use crate::coordinator::Bridge;
use crate::coordinator::UpdateCoordinator;
use crate::host::EntityState;
use crate::host::StateStore;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum ApiError {
    UnknownEntity(String),
    CoordinatorUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::UnknownEntity(id) => (StatusCode::NOT_FOUND, format!("unknown entity {}", id)),
            ApiError::CoordinatorUnavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    store: Arc<StateStore>,
    bridge: Bridge<UpdateCoordinator>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    Json(InfoResponse {
        version: state.version.to_string(),
        hostname,
    })
}

/// Handler for GET /v1/entities
#[tracing::instrument(skip(state))]
async fn entities(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, EntityState>> {
    Json(state.store.snapshot().entities.clone())
}

/// Handler for GET /v1/entities/:entity_id
#[tracing::instrument(skip(state))]
async fn entity(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, ApiError> {
    state
        .store
        .get(&entity_id)
        .map(Json)
        .ok_or(ApiError::UnknownEntity(entity_id))
}

/// Handler for GET /v1/appliances
///
/// Runs on the coordinator's task via the bridge.
#[tracing::instrument(skip(state))]
async fn appliances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ApplianceOverview>>, ApiError> {
    let (tx, rx) = oneshot::channel();
    state
        .bridge
        .submit(
            |coordinator: &mut UpdateCoordinator, tx: oneshot::Sender<Vec<ApplianceOverview>>| {
                let _ = tx.send(coordinator.overview());
            },
            tx,
        )
        .map_err(|e| ApiError::CoordinatorUnavailable(e.to_string()))?;

    rx.await
        .map(Json)
        .map_err(|_| ApiError::CoordinatorUnavailable("coordinator dropped the request".to_string()))
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/entities", get(entities))
        .route("/v1/entities/:entity_id", get(entity))
        .route("/v1/appliances", get(appliances))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Serves published entity state from `store` and coordinator diagnostics
/// through `bridge` until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    store: Arc<StateStore>,
    bridge: Bridge<UpdateCoordinator>,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        store,
        bridge,
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", listen, port))?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
