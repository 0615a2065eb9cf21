pub mod config;
mod error;
pub mod logging;

pub use error::ApiError;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use replication::{ReplicationManager, Strategy};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP server: the replication manager behind one
/// exclusive lock (every manager operation runs under it, start to finish),
/// and the bearer token required by the auth middleware.
pub struct AppState {
    pub manager: tokio::sync::Mutex<ReplicationManager>,
    pub api_token: String,
}

/// Assemble the API router. All routes except `GET /` sit behind the
/// bearer-token middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authed = Router::new()
        .route("/ingest", post(ingest))
        .route("/measurement/:key", get(get_measurement))
        .route("/delete/:key", delete(delete_measurement))
        .route("/fail_node/:node_id", post(fail_node))
        .route("/recover_node/:node_id", post(recover_node))
        .route("/nodes_status", get(nodes_status))
        .route("/configure_replication", post(configure_replication))
        .route("/replica_nodes/:key", get(replica_nodes))
        .route("/set_threshold", post(set_threshold))
        .route("/alerts", get(alerts))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/", get(index))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the storage nodes, bind the listener, and serve until shutdown.
pub async fn run(config: config::Config, data_dir: &std::path::Path) -> anyhow::Result<()> {
    let manager = ReplicationManager::new(config.nodes_db, config.port, data_dir)
        .context("initializing storage nodes")?;
    let state = Arc::new(AppState {
        manager: tokio::sync::Mutex::new(manager),
        api_token: config.api_token.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        nodes = config.nodes_db,
        "EnergyGuard API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("shutdown signal received, stopping server");
}

async fn require_api_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = format!("Bearer {}", state.api_token);
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value == expected);

    if !authorized {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}

async fn index() -> Json<Value> {
    Json(json!({ "status": "EnergyGuard API running" }))
}

/// Render a JSON scalar the way it would appear in a storage key or value:
/// strings verbatim, numbers and booleans in their JSON notation.
fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
        other => Some(other.to_string()),
    }
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let required = || {
        ApiError::InvalidInput("sensor_id, timestamp and value are required".to_string())
    };
    let Some(Json(body)) = body else {
        return Err(required());
    };
    let (Some(sensor_id), Some(timestamp), Some(value)) = (
        scalar(body.get("sensor_id")),
        scalar(body.get("timestamp")),
        scalar(body.get("value")),
    ) else {
        return Err(required());
    };

    let key = format!("{sensor_id}:{timestamp}");
    state.manager.lock().await.store_measurement(&key, &value)?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("Measurement {key} stored successfully"),
    })))
}

async fn get_measurement(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager.lock().await;
    match manager.retrieve_measurement(&key)? {
        Some(found) => Ok(Json(json!({
            "key": key,
            "value": found.value,
            "message": format!("Retrieved from node {}", found.source_node_id),
            "status": "success",
        }))),
        None => Err(ApiError::NotFound(
            "Measurement not found or all nodes are down".to_string(),
        )),
    }
}

async fn delete_measurement(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut manager = state.manager.lock().await;
    if !manager.measurement_exists(&key)? {
        return Err(ApiError::NotFound("Measurement does not exist".to_string()));
    }
    manager.delete_measurement(&key)?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("Measurement {key} deleted successfully"),
    })))
}

async fn fail_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<u32>,
) -> Result<Json<Value>, ApiError> {
    state.manager.lock().await.fail_node(node_id)?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Node {node_id} marked as failed"),
    })))
}

async fn recover_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<u32>,
) -> Result<Json<Value>, ApiError> {
    state.manager.lock().await.recover_node(node_id)?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Node {node_id} recovered"),
    })))
}

async fn nodes_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let manager = state.manager.lock().await;
    Ok(Json(json!({
        "status": "success",
        "nodes": manager.storage_status(),
    })))
}

async fn configure_replication(
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let strategy = body
        .as_ref()
        .and_then(|Json(body)| body.get("strategy"))
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::InvalidInput("Replication strategy is required".to_string()))?;
    let strategy = match strategy {
        "full" => Strategy::Full,
        "consistent" => Strategy::Consistent,
        other => {
            return Err(ApiError::InvalidInput(format!(
                "unknown replication strategy {other:?}"
            )))
        }
    };
    let replication_factor = body
        .as_ref()
        .and_then(|Json(body)| body.get("replication_factor"))
        .and_then(Value::as_u64)
        .map(|factor| factor as usize);

    state
        .manager
        .lock()
        .await
        .set_strategy(strategy, replication_factor);

    let factor = replication_factor.map_or_else(|| "default".to_string(), |f| f.to_string());
    Ok(Json(json!({
        "status": "success",
        "message": format!("Strategy set to {strategy} with factor {factor}"),
    })))
}

async fn replica_nodes(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager.lock().await;
    match manager.responsible_nodes(&key) {
        Some(nodes) => Ok(Json(json!({ "status": "success", "nodes": nodes }))),
        None => Err(ApiError::StrategyMismatch),
    }
}

async fn set_threshold(
    State(state): State<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let required = || ApiError::InvalidInput("sensor_id and threshold are required".to_string());
    let Some(Json(body)) = body else {
        return Err(required());
    };
    let Some(sensor_id) = body.get("sensor_id").and_then(Value::as_str) else {
        return Err(required());
    };
    let threshold = body
        .get("threshold")
        .and_then(coerce_f64)
        .ok_or_else(required)?;

    state.manager.lock().await.set_threshold(sensor_id, threshold);

    Ok(Json(json!({
        "status": "success",
        "message": format!("Threshold for sensor {sensor_id} set to {threshold}"),
    })))
}

/// Coerce a JSON number or numeric string to f64.
fn coerce_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

async fn alerts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let manager = state.manager.lock().await;
    Ok(Json(json!({
        "status": "success",
        "alerts": manager.alerts(),
    })))
}
