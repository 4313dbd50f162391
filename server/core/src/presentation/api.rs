// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! HTTP surface: the operations API, the signature-gated artifacts API,
//! the identity endpoint, and health.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::application::artifact_service::ArtifactService;
use crate::application::operations::OperationsService;
use crate::domain::error::ServerError;
use crate::identity::IdentityService;

pub struct AppState {
    pub operations: Arc<OperationsService>,
    pub artifacts: Arc<ArtifactService>,
    pub identity: Arc<IdentityService>,
}

pub fn app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/operations", post(create_operation))
        .route("/operations/{id}", get(get_operation))
        .route("/operations/{id}/cancel", post(cancel_operation))
        .route("/operations/artifacts/list", post(list_artifacts))
        .route("/operations/artifacts/download", post(download_artifact))
        .route("/identity/{address}", get(get_identity))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Error envelope mapping the taxonomy onto HTTP statuses.
struct ApiError(ServerError);

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ServerError::Authorization(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServerError::GrantValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Chain(_)
            | ServerError::Content { .. }
            | ServerError::Compute(_)
            | ServerError::Sandbox(_) => StatusCode::BAD_GATEWAY,
            ServerError::Decryption | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        tracing::debug!(code = self.0.code(), status = %status, "request failed");
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct CreateOperationRequest {
    app_signature: String,
    /// The raw signed string; it is verified byte-for-byte, so it is
    /// carried as a string and never re-serialized.
    operation_request_json: String,
}

async fn create_operation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateOperationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state
        .operations
        .create(&body.operation_request_json, &body.app_signature)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!(receipt))))
}

async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.operations.get(&id).await?;
    Ok(Json(json!({
        "id": view.id,
        "status": view.status.as_str(),
        "started_at": view.started_at,
        "finished_at": view.finished_at,
        "result": view.result,
    })))
}

async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.operations.cancel(&id).await? {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    // Cancellation not accepted: distinguish unknown operations from
    // ones already terminal.
    state.operations.get(&id).await?;
    Ok(Json(json!({ "cancelled": false })).into_response())
}

#[derive(Deserialize)]
struct ListArtifactsRequest {
    operation_id: String,
    signature: String,
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ListArtifactsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = format!(r#"{{"operation_id":"{}","action":"list"}}"#, body.operation_id);
    let requester = state
        .operations
        .verify_signed_payload(&payload, &body.signature)?;

    let metadata = state.artifacts.list(&body.operation_id, requester).await?;
    let artifacts: Vec<_> = metadata
        .artifacts
        .iter()
        .map(|a| {
            json!({
                "path": a.path,
                "size": a.size,
                "content_type": a.content_type,
            })
        })
        .collect();

    Ok(Json(json!({
        "operation_id": metadata.operation_id,
        "artifacts": artifacts,
    })))
}

#[derive(Deserialize)]
struct DownloadArtifactRequest {
    operation_id: String,
    artifact_path: String,
    signature: String,
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DownloadArtifactRequest>,
) -> Result<Response, ApiError> {
    let payload = format!(
        r#"{{"operation_id":"{}","artifact_path":"{}"}}"#,
        body.operation_id, body.artifact_path
    );
    let requester = state
        .operations
        .verify_signed_payload(&payload, &body.signature)?;

    let (bytes, content_type) = state
        .artifacts
        .download(&body.operation_id, &body.artifact_path, requester)
        .await?;

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn get_identity(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = state.identity.derive_for(&address)?;
    Ok(Json(json!({
        "user_address": address,
        "personal_server": {
            "address": identity.address.to_string(),
            "public_key": identity.public_key_hex(),
        }
    })))
}
