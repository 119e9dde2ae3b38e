// Admin HTTP surface: explicit flush, snapshot export/restore and presence
// listing for one workspace.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path, State},
    middleware,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tandem_common::protocol::ws::ServerEvent;
use tandem_common::types::PresenceEntry;
use tracing::info;

use crate::{
    auth::{
        middleware::{require_bearer_auth, AuthenticatedUser},
        IdentityVerifier,
    },
    error::{ErrorCode, RelayError},
    presence::PresenceRegistry,
    sync::{doc_store::RESTORE_AUTHOR, DocumentStore, FlushOutcome, Snapshot},
    ws::RoomRegistry,
};

#[derive(Clone)]
pub struct ApiState {
    pub documents: Arc<DocumentStore>,
    pub presence: PresenceRegistry,
    pub rooms: RoomRegistry,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub workspace_id: String,
    pub version: u64,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub workspace_id: String,
    pub version: u64,
    pub notified: usize,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub workspace_id: String,
    pub participants: Vec<PresenceEntry>,
}

pub fn router(state: ApiState, verifier: Arc<dyn IdentityVerifier>) -> Router {
    Router::new()
        .route("/v1/workspaces/{workspace_id}/flush", post(flush_workspace))
        .route("/v1/workspaces/{workspace_id}/snapshot", get(export_snapshot))
        .route("/v1/workspaces/{workspace_id}/snapshot/restore", post(restore_snapshot))
        .route("/v1/workspaces/{workspace_id}/presence", get(list_presence))
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(verifier, require_bearer_auth))
}

async fn flush_workspace(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(workspace_id): Path<String>,
) -> Result<Json<FlushResponse>, RelayError> {
    user.ensure_workspace(&workspace_id)?;

    match state.documents.persist_state(&workspace_id).await? {
        FlushOutcome::Persisted { version } => {
            info!(workspace_id = %workspace_id, version, "workspace flushed on request");
            Ok(Json(FlushResponse { workspace_id, version }))
        }
        FlushOutcome::UnknownWorkspace => Err(RelayError::new(
            ErrorCode::NotFound,
            format!("workspace `{workspace_id}` is not loaded"),
        )),
        FlushOutcome::Disabled => Err(RelayError::new(
            ErrorCode::PersistenceFailed,
            "durable storage is not configured",
        )),
    }
}

async fn export_snapshot(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(workspace_id): Path<String>,
) -> Result<Json<Snapshot>, RelayError> {
    user.ensure_workspace(&workspace_id)?;
    Ok(Json(state.documents.create_snapshot(&workspace_id).await?))
}

async fn restore_snapshot(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(workspace_id): Path<String>,
    Json(snapshot): Json<Snapshot>,
) -> Result<Json<RestoreResponse>, RelayError> {
    user.ensure_workspace(&workspace_id)?;
    if snapshot.workspace_id != workspace_id {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            "snapshot belongs to a different workspace",
        ));
    }

    let rooms = &state.rooms;
    let (document, notified) = state
        .documents
        .restore_snapshot_with(&workspace_id, snapshot, |document| {
            rooms.broadcast(
                &document.workspace_id,
                &ServerEvent::DocumentUpdated {
                    payload: document.state.clone(),
                    user_id: RESTORE_AUTHOR.to_string(),
                    version: document.version,
                },
                None,
            )
        })
        .await?;

    Ok(Json(RestoreResponse { workspace_id, version: document.version, notified }))
}

async fn list_presence(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(workspace_id): Path<String>,
) -> Result<Json<PresenceResponse>, RelayError> {
    user.ensure_workspace(&workspace_id)?;
    let participants = state.presence.list_all(&workspace_id).await;
    Ok(Json(PresenceResponse { workspace_id, participants }))
}
