//! HTTP gateway: the external entry point that turns CRUD requests into
//! commands and offers a bounded long-poll over the result cache.
//!
//! - `POST /messages`, `GET /messages/{id}`, `PUT /messages/{id}`,
//!   `DELETE /messages/{id}` — submit a command, return `202` with a
//!   trace id immediately; the caller never blocks on domain processing.
//! - `GET /operations/{trace_id}` — poll for the terminal outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::Broker;
use crate::cache::{Lookup, ResultCache};
use crate::config::Config;
use crate::envelope::{encode_command, Ack, Command, Operation};
use crate::processor::partition_key;

struct GatewayState {
    broker: Arc<dyn Broker>,
    cache: Arc<ResultCache>,
    config: Arc<Config>,
}

type AppState = Arc<GatewayState>;

pub async fn serve(
    broker: Arc<dyn Broker>,
    cache: Arc<ResultCache>,
    config: Arc<Config>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = config.gateway_addr.clone();
    let app = router(broker, cache, config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(broker: Arc<dyn Broker>, cache: Arc<ResultCache>, config: Arc<Config>) -> Router {
    let state = Arc::new(GatewayState { broker, cache, config });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/messages", post(create_message))
        .route("/messages/:id", get(read_message).put(update_message).delete(delete_message))
        .route("/operations/:trace_id", get(poll_operation))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    content: String,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    trace_id: String,
    status: &'static str,
}

async fn submit(state: &AppState, operation: Operation, payload: serde_json::Value) -> Result<SubmitResponse, StatusCode> {
    let trace_id = Uuid::new_v4().to_string();
    let cmd = Command {
        trace_id: trace_id.clone(),
        correlation_id: trace_id.clone(),
        timestamp: chrono::Utc::now(),
        operation,
        resource: "messages".to_string(),
        payload,
        idempotency_key: Uuid::new_v4().to_string(),
        attempt: 0,
    };

    let key = partition_key(&cmd);
    let msg = encode_command(&cmd, key);

    state
        .broker
        .publish(&state.config.commands_topic, msg)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to publish command");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    Ok(SubmitResponse {
        trace_id,
        status: "PENDING",
    })
}

async fn create_message(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let resp = submit(&state, Operation::Create, serde_json::json!({"content": req.content})).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

async fn read_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let resp = submit(&state, Operation::Read, serde_json::json!({"id": id})).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

async fn update_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let resp = submit(&state, Operation::Update, serde_json::json!({"id": id, "content": req.content})).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    let resp = submit(&state, Operation::Delete, serde_json::json!({"id": id})).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    timeout_ms: Option<u64>,
}

async fn poll_operation(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Ack>, StatusCode> {
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.long_poll_timeout());
    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(50);

    loop {
        match state.cache.lookup(&trace_id).await {
            Lookup::Found(ack) => return Ok(Json(ack)),
            Lookup::Expired => return Err(StatusCode::GONE),
            Lookup::Pending => {
                if Instant::now() >= deadline {
                    return Err(StatusCode::NO_CONTENT);
                }
                tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1)))).await;
            }
        }
    }
}
