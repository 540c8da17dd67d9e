use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use tracing::info;

use gather_types::api::{Claims, SetHiddenRequest};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// Hidden users are declined automatically when invited to a meeting.
pub async fn set_hidden(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<SetHiddenRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = payload?;
    let uid = claims.sub.to_string();

    let found = blocking(&state, move |db| Ok(db.set_user_hidden(&uid, req.hidden)?)).await?;
    if !found {
        return Err(ApiError::NotFound("User"));
    }

    info!("User {} is now {}", claims.username, if req.hidden { "hidden" } else { "visible" });
    Ok(StatusCode::NO_CONTENT)
}
