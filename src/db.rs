use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::CoreConfig;

pub fn connect_lazy(config: &CoreConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database_pool_size + config.database_pool_overflow)
        .min_connections(config.database_pool_size.min(2))
        .acquire_timeout(Duration::from_secs(config.database_pool_timeout_seconds))
        .max_lifetime(Duration::from_secs(config.database_pool_recycle_seconds))
        .test_before_acquire(true)
        .connect_lazy(&config.database_url)
        .with_context(|| {
            format!(
                "Failed to create lazy database pool for {}",
                config.database_url
            )
        })
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run database migrations")
}
