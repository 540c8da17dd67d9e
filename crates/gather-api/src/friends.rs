use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use gather_types::api::{Claims, CreateFriendshipRequest, FriendshipResponse, UpdateFriendshipRequest};
use gather_types::events::DomainEvent;
use gather_types::models::Friendship;

use crate::error::ApiError;
use crate::state::{AppState, blocking};

pub async fn create_friendship(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<CreateFriendshipRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    if req.friend == claims.sub {
        return Err(ApiError::bad_request("You cannot befriend yourself"));
    }

    let from_id = claims.sub.to_string();
    let friendship = blocking(&state, move |db| {
        let to_id = req.friend.to_string();
        if db.get_user_by_id(&to_id)?.is_none() {
            return Err(ApiError::NotFound("User"));
        }

        let id = Uuid::new_v4().to_string();
        if !db.create_friendship(&id, &from_id, &to_id)? {
            return Err(ApiError::Conflict("You are already friends or have a pending request"));
        }

        let row = db
            .get_friendship(&id)?
            .ok_or(ApiError::NotFound("Friendship"))?;
        Ok(Friendship::try_from(row)?)
    })
    .await?;

    info!("User {} sent a friend request to {}", claims.username, friendship.to_id);
    state
        .notifier
        .publish_or_log(&DomainEvent::FriendRequestCreated {
            friendship_id: friendship.id,
            from_id: friendship.from_id,
            to_id: friendship.to_id,
        })
        .await;

    Ok((StatusCode::CREATED, Json(friendship)))
}

pub async fn update_friendship(
    State(state): State<AppState>,
    Path(friendship_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<UpdateFriendshipRequest>, JsonRejection>,
) -> Result<Json<FriendshipResponse>, ApiError> {
    let Json(req) = payload?;
    let user_id = claims.sub.to_string();

    let (friendship, newly_accepted) = blocking(&state, move |db| {
        let id = friendship_id.to_string();
        let row = db
            .get_friendship(&id)?
            .ok_or(ApiError::NotFound("Friendship"))?;
        if row.to_id != user_id {
            return Err(ApiError::Forbidden("Only the recipient can answer a friend request"));
        }
        if req.is_accepted == Some(false) && row.is_accepted {
            return Err(ApiError::bad_request("An accepted friendship cannot be revoked"));
        }

        let newly_accepted = req.is_accepted == Some(true) && !row.is_accepted;
        db.update_friendship(&id, req.is_accepted, req.is_hidden)?;

        let row = db
            .get_friendship(&id)?
            .ok_or(ApiError::NotFound("Friendship"))?;
        Ok((Friendship::try_from(row)?, newly_accepted))
    })
    .await?;

    if newly_accepted {
        info!("User {} accepted friendship {}", claims.username, friendship.id);
        state
            .notifier
            .publish_or_log(&DomainEvent::FriendRequestAccepted {
                friendship_id: friendship.id,
                from_id: friendship.from_id,
                to_id: friendship.to_id,
            })
            .await;
    }

    Ok(Json(friendship))
}
