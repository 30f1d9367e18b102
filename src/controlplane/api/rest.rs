//! REST API Handlers
//!
//! Implements the REST API endpoints for storage and centralized manager
//! registration, removal, credential updates and sync triggers. Handlers are
//! transport only: every operation is delegated to the orchestrators.

use crate::controlplane::discovery::DiscoveryOrchestrator;
use crate::controlplane::sync::{SyncOrchestrator, SyncSummary};
use crate::domain::models::{
    AccessInfo, CentralizedManager, ProtocolAccess, Storage, StorageStatus,
};
use crate::domain::ports::DatabaseRef;
use crate::error::Error;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Seconds a client should wait before retrying a busy sync
const SYNC_RETRY_AFTER_SECS: u64 = 30;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Connection details of a storage or centralized manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessInfoRequest {
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub rest: Option<ProtocolAccess>,
    #[serde(default)]
    pub ssh: Option<ProtocolAccess>,
    #[serde(default)]
    pub smis: Option<ProtocolAccess>,
    #[serde(default)]
    pub extra_attributes: BTreeMap<String, String>,
}

impl From<AccessInfoRequest> for AccessInfo {
    fn from(request: AccessInfoRequest) -> Self {
        AccessInfo {
            storage_id: String::new(),
            driver_id: String::new(),
            vendor: request.vendor,
            model: request.model,
            rest: request.rest,
            ssh: request.ssh,
            smis: request.smis,
            extra_attributes: request.extra_attributes,
        }
    }
}

/// Storage response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub status: StorageStatus,
    pub location: String,
    pub description: String,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub free_capacity: u64,
    pub raw_capacity: u64,
    pub subscribed_capacity: u64,
}

impl From<Storage> for StorageResponse {
    fn from(s: Storage) -> Self {
        Self {
            id: s.id,
            name: s.name,
            vendor: s.vendor,
            model: s.model,
            serial_number: s.serial_number,
            firmware_version: s.firmware_version,
            status: s.status,
            location: s.location,
            description: s.description,
            total_capacity: s.total_capacity,
            used_capacity: s.used_capacity,
            free_capacity: s.free_capacity,
            raw_capacity: s.raw_capacity,
            subscribed_capacity: s.subscribed_capacity,
        }
    }
}

/// Centralized manager response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralizedManagerResponse {
    pub id: String,
    pub derived_id: String,
    pub vendor: String,
    pub model: String,
    pub storages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CentralizedManager> for CentralizedManagerResponse {
    fn from(cm: CentralizedManager) -> Self {
        Self {
            id: cm.id,
            derived_id: cm.derived_id,
            vendor: cm.vendor,
            model: cm.model,
            storages: cm.storages,
            created_at: cm.created_at,
        }
    }
}

/// One protocol block, without the password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl From<&ProtocolAccess> for ProtocolResponse {
    fn from(p: &ProtocolAccess) -> Self {
        Self {
            host: p.host.clone(),
            port: p.port,
            username: p.username.clone(),
        }
    }
}

/// Access info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessInfoResponse {
    pub storage_id: String,
    pub driver_id: String,
    pub vendor: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest: Option<ProtocolResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<ProtocolResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smis: Option<ProtocolResponse>,
    pub extra_attributes: BTreeMap<String, String>,
}

impl From<AccessInfo> for AccessInfoResponse {
    fn from(a: AccessInfo) -> Self {
        Self {
            rest: a.rest.as_ref().map(ProtocolResponse::from),
            ssh: a.ssh.as_ref().map(ProtocolResponse::from),
            smis: a.smis.as_ref().map(ProtocolResponse::from),
            storage_id: a.storage_id,
            driver_id: a.driver_id,
            vendor: a.vendor,
            model: a.model,
            extra_attributes: a.extra_attributes,
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// HTTP status for an error
pub fn status_for(e: &Error) -> StatusCode {
    match e {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        Error::AlreadyRegistered { .. } | Error::SyncAlreadyInProgress { .. } => {
            StatusCode::CONFLICT
        }
        Error::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::DriverNotFound { .. }
        | Error::InvalidAccessInfo(_)
        | Error::InvalidCapabilities(_)
        | Error::StorageInconsistent { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(e: &Error) -> &'static str {
    match e {
        Error::StorageNotFound { .. } => "storage_not_found",
        Error::AccessInfoNotFound { .. } => "access_info_not_found",
        Error::CentralizedManagerNotFound { .. } => "centralized_manager_not_found",
        Error::AlreadyRegistered { .. } => "already_registered",
        Error::SyncAlreadyInProgress { .. } => "sync_in_progress",
        Error::LockTimeout { .. } => "lock_timeout",
        Error::DriverNotFound { .. } => "driver_not_found",
        Error::InvalidAccessInfo(_) => "invalid_access_info",
        Error::InvalidCapabilities(_) => "invalid_capabilities",
        Error::StorageInconsistent { .. } => "storage_inconsistent",
        _ => "internal_error",
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        debug!("Request rejected: {}", e);
    }

    let body = Json(ApiErrorResponse {
        error: error_code(&e).into(),
        message: e.to_string(),
        details: None,
    });
    match e {
        Error::SyncAlreadyInProgress { .. } => (
            status,
            [(header::RETRY_AFTER, SYNC_RETRY_AFTER_SECS.to_string())],
            body,
        )
            .into_response(),
        _ => (status, body).into_response(),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    discovery: Arc<DiscoveryOrchestrator>,
    sync: Arc<SyncOrchestrator>,
    db: DatabaseRef,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(
        discovery: Arc<DiscoveryOrchestrator>,
        sync: Arc<SyncOrchestrator>,
        db: DatabaseRef,
    ) -> Self {
        Self {
            discovery,
            sync,
            db,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            discovery: self.discovery,
            sync: self.sync,
            db: self.db,
        };

        Router::new()
            // Storage endpoints
            .route("/v1/storages", post(register_storage).get(list_storages))
            .route("/v1/storages/sync", post(sync_all))
            .route("/v1/storages/:id", get(get_storage).delete(remove_storage))
            .route("/v1/storages/:id/access-info", put(update_access_info))
            .route("/v1/storages/:id/sync", post(sync_storage))
            // Centralized manager endpoints
            .route(
                "/v1/centralized-managers",
                post(register_centralized_manager).get(list_centralized_managers),
            )
            .route(
                "/v1/centralized-managers/:id",
                get(get_centralized_manager).delete(remove_centralized_manager),
            )
            // Health endpoint
            .route("/health", get(health_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    discovery: Arc<DiscoveryOrchestrator>,
    sync: Arc<SyncOrchestrator>,
    db: DatabaseRef,
}

// =============================================================================
// Storage Handlers
// =============================================================================

/// Register a directly managed storage
async fn register_storage(
    State(state): State<AppState>,
    Json(request): Json<AccessInfoRequest>,
) -> Response {
    info!("Registering {} {} storage", request.vendor, request.model);
    match state.discovery.discover_single_storage(request.into()).await {
        Ok(storage) => (StatusCode::CREATED, Json(StorageResponse::from(storage))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_storages(State(state): State<AppState>) -> Response {
    match state.db.list_storages().await {
        Ok(storages) => {
            let body: Vec<StorageResponse> = storages.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_storage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_storage(&id).await {
        Ok(storage) => (StatusCode::OK, Json(StorageResponse::from(storage))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_storage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(storage_id = %id, "Removing storage");
    match state.discovery.remove_storage(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_access_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AccessInfoRequest>,
) -> Response {
    match state.discovery.update_access_info(&id, request.into()).await {
        Ok(access) => (StatusCode::OK, Json(AccessInfoResponse::from(access))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn sync_storage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sync.start_sync(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn sync_all(State(state): State<AppState>) -> Response {
    match state.sync.sync_all().await {
        Ok(summary) => (StatusCode::ACCEPTED, Json::<SyncSummary>(summary)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Centralized Manager Handlers
// =============================================================================

async fn register_centralized_manager(
    State(state): State<AppState>,
    Json(request): Json<AccessInfoRequest>,
) -> Response {
    info!("Registering {} {} centralized manager", request.vendor, request.model);
    match state.discovery.discover_managed_storages(request.into()).await {
        Ok(cm) => (
            StatusCode::CREATED,
            Json(CentralizedManagerResponse::from(cm)),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_centralized_managers(State(state): State<AppState>) -> Response {
    match state.db.list_centralized_managers().await {
        Ok(cms) => {
            let body: Vec<CentralizedManagerResponse> = cms.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_centralized_manager(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.db.get_centralized_manager(&id).await {
        Ok(cm) => (StatusCode::OK, Json(CentralizedManagerResponse::from(cm))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_centralized_manager(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    info!(cm_id = %id, "Removing centralized manager");
    match state.discovery.remove_managed_storage(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
