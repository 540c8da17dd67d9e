pub mod devices;
pub mod error;
pub mod friends;
pub mod meetings;
pub mod middleware;
pub mod positions;
pub mod state;
pub mod users;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};

pub use error::ApiError;
pub use state::{AppState, AppStateInner};

/// All routes, with `/api/v1` behind bearer authentication.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/fcm/devices",
            post(devices::register_device).delete(devices::unregister_device),
        )
        .route("/meetings", post(meetings::create_meeting))
        .route("/meetings/{meeting_id}", put(meetings::update_meeting))
        .route(
            "/meetings/participants/{participant_id}",
            put(meetings::update_participant),
        )
        .route("/users/me/hidden", put(users::set_hidden))
        .route("/users/friends", post(friends::create_friendship))
        .route("/users/friends/{friendship_id}", put(friends::update_friendship))
        .route("/positions", post(positions::share_position))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
}

async fn health() -> &'static str {
    "ok"
}
