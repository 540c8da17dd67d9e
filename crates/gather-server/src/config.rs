use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Service account key file and project id; both or neither.
    pub fcm: Option<(PathBuf, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = var("GATHER_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("GATHER_JWT_SECRET must be set to the identity service's signing secret");
        }

        let host = var("GATHER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("GATHER_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("GATHER_PORT is not a valid port")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", host, port))?;

        let db_path = PathBuf::from(var("GATHER_DB_PATH").unwrap_or_else(|| "gather.db".into()));

        let fcm = match (var("GATHER_FCM_CREDENTIALS"), var("GATHER_FCM_PROJECT_ID")) {
            (Some(key), Some(project)) => Some((PathBuf::from(key), project)),
            (None, None) => None,
            _ => bail!("GATHER_FCM_CREDENTIALS and GATHER_FCM_PROJECT_ID must be set together"),
        };

        Ok(Self {
            addr,
            db_path,
            jwt_secret,
            fcm,
        })
    }
}
