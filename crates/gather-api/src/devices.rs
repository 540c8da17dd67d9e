use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use tracing::info;

use gather_push::Registration;
use gather_types::api::{Claims, RegisterDeviceRequest};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn register_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<RegisterDeviceRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    if req.registration_id.trim().is_empty() {
        return Err(ApiError::bad_request("registration_id must not be empty"));
    }

    let registration = state
        .notifier
        .register_device(claims.sub, &req.registration_id)
        .await?;

    Ok(match registration {
        Registration::Created => {
            info!("User {} registered a new device", claims.username);
            StatusCode::CREATED
        }
        Registration::Unchanged => StatusCode::NO_CONTENT,
    })
}

pub async fn unregister_device(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    let removed = state.notifier.unregister_device(claims.sub).await?;

    if !removed {
        return Err(ApiError::NotFound("Device"));
    }
    info!("User {} unregistered their device", claims.username);
    Ok(StatusCode::NO_CONTENT)
}
