use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use gather_types::api::Claims;

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// Extract and validate the JWT from the Authorization header.
///
/// Accounts live with the identity service that mints the tokens; the first
/// authenticated request from a user creates the local user row.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        ApiError::Unauthorized
    })?;

    let claims = token_data.claims;
    let uid = claims.sub.to_string();
    let username = claims.username.clone();
    blocking(&state, move |db| Ok(db.upsert_user(&uid, &username)?)).await?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
