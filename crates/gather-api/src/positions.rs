use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use gather_types::api::{Claims, PositionRequest};
use gather_types::events::DomainEvent;

use crate::error::ApiError;
use crate::state::AppState;

/// Positions are relayed to the user's ongoing meetings, never stored.
pub async fn share_position(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<PositionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(position) = payload?;
    if !position.is_valid() {
        return Err(ApiError::bad_request(
            "latitude must be within [-90, 90] and longitude within [-180, 180]",
        ));
    }

    state
        .notifier
        .publish_or_log(&DomainEvent::PositionShared { user_id: claims.sub })
        .await;

    Ok((StatusCode::CREATED, Json(position)))
}
