use anyhow::{Context, Result};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub database_pool_size: u32,
    pub database_pool_overflow: u32,
    pub database_pool_timeout_seconds: u64,
    pub database_pool_recycle_seconds: u64,
    pub api_key_enabled: bool,
    pub api_key: Option<String>,
    pub notification: NotificationConfig,
    pub reaper_interval_seconds: u64,
    pub reaper_grace_seconds: u64,
    pub reaper_max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from_address: Option<String>,
    pub smtp_use_tls: bool,
    pub default_email_recipients: Vec<String>,
    pub default_webhook_url: Option<String>,
    pub webhook_timeout_seconds: u64,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env_trimmed("CORE_DATABASE_URL")
            .context("CORE_DATABASE_URL must be set for the alert pipeline runtime")?;
        let database_url = normalize_database_url(&database_url);

        let api_key_enabled = env_flag("CORE_API_KEY_ENABLED", false);
        let api_key = env_trimmed("CORE_API_KEY");
        if api_key_enabled && api_key.is_none() {
            anyhow::bail!("CORE_API_KEY_ENABLED is set but CORE_API_KEY is empty");
        }

        let notification = NotificationConfig {
            enabled: env_flag("CORE_NOTIFICATION_ENABLED", true),
            smtp_host: env_trimmed("CORE_SMTP_HOST"),
            smtp_port: env_parsed("CORE_SMTP_PORT", 587u16),
            smtp_user: env_trimmed("CORE_SMTP_USER"),
            smtp_password: env_trimmed("CORE_SMTP_PASSWORD"),
            smtp_from_address: env_trimmed("CORE_SMTP_FROM_ADDRESS"),
            smtp_use_tls: env_flag("CORE_SMTP_USE_TLS", true),
            default_email_recipients: env_list("CORE_DEFAULT_EMAIL_RECIPIENTS"),
            default_webhook_url: env_trimmed("CORE_DEFAULT_WEBHOOK_URL"),
            webhook_timeout_seconds: env_parsed("CORE_WEBHOOK_TIMEOUT_SECONDS", 30u64)
                .clamp(1, 300),
        };

        if let Some(raw) = notification.default_webhook_url.as_deref() {
            url::Url::parse(raw)
                .with_context(|| format!("CORE_DEFAULT_WEBHOOK_URL is not a valid URL: {raw}"))?;
        }

        Ok(Self {
            database_url,
            database_pool_size: env_parsed("CORE_DATABASE_POOL_SIZE", 10u32).clamp(1, 100),
            database_pool_overflow: env_parsed("CORE_DATABASE_POOL_OVERFLOW", 5u32).clamp(0, 100),
            database_pool_timeout_seconds: env_parsed("CORE_DATABASE_POOL_TIMEOUT_SECONDS", 8u64)
                .clamp(1, 120),
            database_pool_recycle_seconds: env_parsed(
                "CORE_DATABASE_POOL_RECYCLE_SECONDS",
                1800u64,
            )
            .clamp(60, 24 * 3600),
            api_key_enabled,
            api_key,
            notification,
            reaper_interval_seconds: env_parsed("CORE_REAPER_INTERVAL_SECONDS", 60u64)
                .clamp(5, 3600),
            reaper_grace_seconds: env_parsed("CORE_REAPER_GRACE_SECONDS", 120u64)
                .clamp(0, 24 * 3600),
            reaper_max_attempts: env_parsed("CORE_REAPER_MAX_ATTEMPTS", 5u32).clamp(1, 100),
        })
    }
}

impl NotificationConfig {
    pub fn is_email_configured(&self) -> bool {
        self.smtp_host.is_some() && self.smtp_from_address.is_some()
    }

    pub fn is_webhook_configured(&self) -> bool {
        self.default_webhook_url.is_some()
    }
}

/// Env var with surrounding whitespace stripped; unset and blank are both None.
fn env_trimmed(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Numeric env var; unparseable values fall back to the default.
fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    env_trimmed(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_trimmed(key).map(|value| value.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// The original deployment's SQLAlchemy URLs name a Python driver in the
// scheme; accept them so operators can reuse the same connection string.
const PYTHON_DRIVER_SCHEMES: [&str; 2] = ["postgresql+asyncpg://", "postgresql+psycopg://"];

fn normalize_database_url(url: &str) -> String {
    for scheme in PYTHON_DRIVER_SCHEMES {
        if let Some(rest) = url.strip_prefix(scheme) {
            return format!("postgresql://{rest}");
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_database_url_accepts_python_driver_schemes() {
        for raw in [
            "postgresql+asyncpg://u@h/db",
            "postgresql+psycopg://u@h/db",
            "postgresql://u@h/db",
        ] {
            assert_eq!(normalize_database_url(raw), "postgresql://u@h/db");
        }
        assert_eq!(normalize_database_url("mysql://u@h/db"), "mysql://u@h/db");
    }

    #[test]
    fn env_parsed_falls_back_on_garbage() {
        // Key deliberately absent from the environment.
        assert_eq!(env_parsed("CORE_TEST_UNSET_PORT_KEY", 587u16), 587);
    }

    #[test]
    fn from_env_refuses_to_start_without_required_settings() {
        // Exercised serially inside one test because the process environment
        // is shared across the test binary.
        std::env::remove_var("CORE_DATABASE_URL");
        let err = CoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CORE_DATABASE_URL"));

        std::env::set_var("CORE_DATABASE_URL", "postgresql+asyncpg://u@h/db");
        std::env::set_var("CORE_API_KEY_ENABLED", "true");
        std::env::remove_var("CORE_API_KEY");
        let err = CoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CORE_API_KEY"));

        std::env::set_var("CORE_API_KEY", "test-key");
        let config = CoreConfig::from_env().expect("config with key set");
        assert_eq!(config.database_url, "postgresql://u@h/db");
        assert!(config.api_key_enabled);

        std::env::remove_var("CORE_DATABASE_URL");
        std::env::remove_var("CORE_API_KEY_ENABLED");
        std::env::remove_var("CORE_API_KEY");
    }

    #[test]
    fn email_configured_requires_host_and_from_address() {
        let mut notification = NotificationConfig {
            enabled: true,
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            smtp_from_address: Some("alerts@example.com".to_string()),
            smtp_use_tls: true,
            default_email_recipients: vec!["ops@example.com".to_string()],
            default_webhook_url: None,
            webhook_timeout_seconds: 30,
        };
        assert!(notification.is_email_configured());

        notification.smtp_from_address = None;
        assert!(!notification.is_email_configured());

        assert!(!notification.is_webhook_configured());
        notification.default_webhook_url = Some("https://example.com/hook".to_string());
        assert!(notification.is_webhook_configured());
    }
}
