//! HTTP API handlers — exposes daemon state and directory records as JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use meshgate_core::{NodeAddress, Schema};
use meshgate_services::{BridgeServer, Directory, DirectoryError, MemoryDirectory, PublishRecord};

#[derive(Clone)]
pub struct ApiState {
    pub address: NodeAddress,
    pub schema: Arc<Schema>,
    /// `None` when the node only acts as a client.
    pub server: Option<BridgeServer>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub address: String,
    pub uptime_secs: u64,
    pub serving: bool,
    pub open_streams: usize,
    pub in_flight: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let (open_streams, in_flight) = state
        .server
        .as_ref()
        .map(|s| (s.streams().len(), s.in_flight()))
        .unwrap_or((0, 0));

    Json(StatusResponse {
        address: state.address.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        serving: state.server.is_some(),
        open_streams,
        in_flight,
    })
}

// ── /schema ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct SchemaInfoItem {
    pub name: String,
    pub type_tag: String,
}

#[derive(Serialize, Deserialize)]
pub struct SchemaListResponse {
    pub messages: Vec<SchemaInfoItem>,
}

pub async fn handle_schema_list(State(state): State<ApiState>) -> Json<SchemaListResponse> {
    let messages = state
        .schema
        .entries()
        .into_iter()
        .map(|(name, tag)| SchemaInfoItem {
            name: name.to_string(),
            type_tag: format!("0x{tag:08x}"),
        })
        .collect();

    Json(SchemaListResponse { messages })
}

// ── /daemon/shutdown ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    state.shutdown.cancel();
    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}

// ── /records ─────────────────────────────────────────────────────────────────

pub async fn handle_records_list(State(directory): State<MemoryDirectory>) -> Json<Vec<PublishRecord>> {
    Json(directory.records())
}

pub async fn handle_record_publish(
    State(directory): State<MemoryDirectory>,
    Json(record): Json<PublishRecord>,
) -> Result<StatusCode, (StatusCode, String)> {
    if record.is_expired() {
        return Err((StatusCode::BAD_REQUEST, "record already expired".to_string()));
    }
    directory.purge_expired();
    directory
        .publish(record)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_record_find(
    State(directory): State<MemoryDirectory>,
    Path(address): Path<String>,
) -> Result<Json<PublishRecord>, (StatusCode, String)> {
    let address: NodeAddress = address
        .parse()
        .map_err(|e: meshgate_core::AddressError| (StatusCode::BAD_REQUEST, e.to_string()))?;
    match directory.find(&address).await {
        Ok(record) => Ok(Json(record)),
        Err(e @ DirectoryError::NotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}
