use axum::extract::FromRef;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::services::notification::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub db: PgPool,
    pub notifier: Arc<Notifier>,
    pub http: Client,
    pub clock: Arc<dyn Clock>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
