//! Profile CRUD handlers.

use crate::handlers::AppState;
use crate::metrics;
use crate::routing::RequestPath;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures_util::StreamExt;
use profile_core::ServiceError;
use profile_protocol::{ChangeKind, Profile, ProfileRequest};
use std::sync::Arc;
use tracing::{debug, error};

/// A service error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Store(e) => {
                error!(error = %e, "Store operation failed");
                metrics::record_error("store");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// 201 with the profile's canonical location and an empty body.
fn created(profile: &Profile) -> Response {
    (
        StatusCode::CREATED,
        [(header::LOCATION, profile.location())],
    )
        .into_response()
}

/// `GET /profiles`
pub async fn list_profiles(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Profile>>, ApiError> {
    let profiles: Vec<Profile> = state.service.all().await?.collect().await;
    Ok(Json(profiles))
}

/// `GET /profiles/{id}`
pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(path): Extension<RequestPath>,
    Path(id): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let profile = state.service.get(&id).await.map_err(|e| {
        debug!(uri = %path.original, error = %e, "Lookup failed");
        e
    })?;
    Ok(Json(profile))
}

/// `POST /profiles`
pub async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProfileRequest>,
) -> Result<Response, ApiError> {
    let profile = state.service.create(&request.email).await?;
    metrics::record_mutation(ChangeKind::Insert);
    Ok(created(&profile))
}

/// `PUT /profiles/{id}`
///
/// Answers 201 with `Location`, like creation.
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ProfileRequest>,
) -> Result<Response, ApiError> {
    let profile = state.service.update(&id, &request.email).await?;
    metrics::record_mutation(ChangeKind::Update);
    Ok(created(&profile))
}

/// `DELETE /profiles/{id}`
pub async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Extension(path): Extension<RequestPath>,
    Path(id): Path<String>,
) -> Result<Json<Profile>, ApiError> {
    let profile = state.service.delete(&id).await.map_err(|e| {
        debug!(uri = %path.original, error = %e, "Delete failed");
        e
    })?;
    metrics::record_mutation(ChangeKind::Delete);
    Ok(Json(profile))
}
