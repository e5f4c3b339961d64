use std::sync::Arc;

use crate::clock::SystemClock;
use crate::config::{CoreConfig, NotificationConfig};
use crate::db;
use crate::services::notification::Notifier;
use crate::state::AppState;

pub fn test_config() -> CoreConfig {
    CoreConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        database_pool_size: 2,
        database_pool_overflow: 0,
        database_pool_timeout_seconds: 2,
        database_pool_recycle_seconds: 1800,
        api_key_enabled: false,
        api_key: None,
        notification: NotificationConfig {
            enabled: true,
            smtp_host: None,
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            smtp_from_address: None,
            smtp_use_tls: true,
            default_email_recipients: Vec::new(),
            default_webhook_url: None,
            webhook_timeout_seconds: 30,
        },
        reaper_interval_seconds: 60,
        reaper_grace_seconds: 0,
        reaper_max_attempts: 3,
    }
}

pub fn test_state() -> AppState {
    test_state_with_config(test_config())
}

pub fn test_state_with_config(config: CoreConfig) -> AppState {
    let pool = db::connect_lazy(&config).expect("connect_lazy");
    let http = reqwest::Client::new();
    let notifier = Arc::new(Notifier::new(config.notification.clone(), http.clone()));
    AppState {
        config,
        db: pool,
        notifier,
        http,
        clock: Arc::new(SystemClock),
    }
}
