use std::sync::Arc;

use gather_db::Database;
use gather_push::Notifier;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub notifier: Notifier,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, notifier: Notifier, jwt_secret: impl Into<String>) -> AppState {
        Arc::new(Self {
            db,
            notifier,
            jwt_secret: jwt_secret.into(),
        })
    }
}

/// Run blocking database work off the async runtime.
pub async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(db.as_ref())).await?
}
