use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Unable to load service account key: {0}")]
    Credentials(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JWT signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}
