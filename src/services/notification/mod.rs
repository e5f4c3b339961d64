use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

mod email;
mod webhook;

pub use webhook::build_webhook_payload;

use crate::config::NotificationConfig;
use crate::domain::Alert;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Email,
    Webhook,
    Push,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Push => "push",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "email" => Some(Self::Email),
            "webhook" => Some(Self::Webhook),
            "push" => Some(Self::Push),
            _ => None,
        }
    }
}

/// Result of one delivery attempt on one channel.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DeliveryOutcome {
    pub channel: String,
    pub success: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub recipient: Option<String>,
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn success(channel: ChannelKind, recipient: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            channel: channel.as_str().to_string(),
            success: true,
            delivered_at: Some(now),
            recipient,
            error: None,
        }
    }

    pub fn failure(channel: &str, error: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            success: false,
            delivered_at: None,
            recipient: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DeliveryReport {
    pub alert_id: Uuid,
    pub outcomes: Vec<DeliveryOutcome>,
    pub all_successful: bool,
}

impl DeliveryReport {
    fn empty_success(alert_id: Uuid) -> Self {
        Self {
            alert_id,
            outcomes: Vec::new(),
            all_successful: true,
        }
    }

    pub fn successful_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Channel fan-out for one alert. Holds the process-wide notification
/// configuration and the shared HTTP client; one value is constructed at
/// startup and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct Notifier {
    config: NotificationConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// Channel resolution precedence: explicit argument, then the alert's
    /// channel list, then the rule's. An empty resolved set is a successful
    /// no-op.
    fn resolve_channels<'a>(
        &self,
        explicit: Option<&'a [String]>,
        alert: &'a Alert,
        rule_channels: Option<&'a [String]>,
    ) -> &'a [String] {
        if let Some(channels) = explicit.filter(|channels| !channels.is_empty()) {
            return channels;
        }
        if !alert.channels.is_empty() {
            return &alert.channels;
        }
        rule_channels.unwrap_or(&[])
    }

    async fn deliver_one(&self, channel: &str, alert: &Alert, now: DateTime<Utc>) -> DeliveryOutcome {
        match ChannelKind::parse(channel) {
            Some(ChannelKind::Email) => email::send(&self.config, alert, None, now).await,
            Some(ChannelKind::Webhook) => {
                webhook::send(&self.config, &self.http, alert, None, now).await
            }
            Some(ChannelKind::Push) => {
                DeliveryOutcome::failure(ChannelKind::Push.as_str(), "not_yet_implemented")
            }
            None => {
                tracing::warn!(channel = %channel, alert_id = %alert.id, "unknown notification channel");
                DeliveryOutcome::failure(channel, format!("unknown_channel:{channel}"))
            }
        }
    }

    /// Deliver an alert through every resolved channel concurrently and
    /// collect per-channel outcomes. Channels never abort each other; the
    /// report's `all_successful` drives the delivered transition upstream.
    pub async fn deliver_alert(
        &self,
        alert: &Alert,
        channels: Option<&[String]>,
        rule_channels: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> DeliveryReport {
        if !self.config.enabled {
            tracing::debug!(alert_id = %alert.id, "notifications disabled; skipping delivery");
            return DeliveryReport::empty_success(alert.id);
        }

        let resolved = self.resolve_channels(channels, alert, rule_channels);
        if resolved.is_empty() {
            return DeliveryReport::empty_success(alert.id);
        }

        let outcomes = futures::future::join_all(
            resolved
                .iter()
                .map(|channel| self.deliver_one(channel, alert, now)),
        )
        .await;

        let all_successful = !outcomes.is_empty() && outcomes.iter().all(|o| o.success);
        for outcome in &outcomes {
            if outcome.success {
                tracing::info!(alert_id = %alert.id, channel = %outcome.channel, "alert delivered");
            } else {
                tracing::warn!(
                    alert_id = %alert.id,
                    channel = %outcome.channel,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "alert delivery failed"
                );
            }
        }

        DeliveryReport {
            alert_id: alert.id,
            outcomes,
            all_successful,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertSeverity, AlertStatus};

    fn notifier(config: NotificationConfig) -> Notifier {
        Notifier::new(config, reqwest::Client::new())
    }

    fn unconfigured() -> NotificationConfig {
        NotificationConfig {
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
        }
    }

    fn alert(channels: &[&str]) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            event_id: 42,
            rule_id: None,
            severity: AlertSeverity::High,
            status: AlertStatus::Pending,
            dedup_key: "front_door:rule".to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[tokio::test]
    async fn disabled_notifications_are_a_successful_noop() {
        let mut config = unconfigured();
        config.enabled = false;
        let report = notifier(config)
            .deliver_alert(&alert(&["email", "webhook"]), None, None, Utc::now())
            .await;
        assert!(report.all_successful);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn empty_resolved_channel_set_is_a_successful_noop() {
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&[]), None, None, Utc::now())
            .await;
        assert!(report.all_successful);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn explicit_channels_take_precedence_over_alert_channels() {
        let push_only = vec!["push".to_string()];
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&["email"]), Some(&push_only), None, Utc::now())
            .await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].channel, "push");
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("not_yet_implemented")
        );
    }

    #[tokio::test]
    async fn rule_channels_fill_in_when_alert_has_none() {
        let rule_channels = vec!["push".to_string()];
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&[]), None, Some(&rule_channels), Utc::now())
            .await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].channel, "push");
    }

    #[tokio::test]
    async fn unknown_channel_fails_without_aborting_others() {
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&["pager", "push"]), None, None, Utc::now())
            .await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(!report.all_successful);
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("unknown_channel:pager")
        );
        assert_eq!(
            report.outcomes[1].error.as_deref(),
            Some("not_yet_implemented")
        );
    }

    #[tokio::test]
    async fn unconfigured_email_reports_typed_error() {
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&["email"]), None, None, Utc::now())
            .await;
        assert!(!report.all_successful);
        assert_eq!(report.successful_count(), 0);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("email_not_configured")
        );
    }

    #[tokio::test]
    async fn unconfigured_webhook_reports_typed_error() {
        let report = notifier(unconfigured())
            .deliver_alert(&alert(&["webhook"]), None, None, Utc::now())
            .await;
        assert!(!report.all_successful);
        assert_eq!(
            report.outcomes[0].error.as_deref(),
            Some("webhook_not_configured")
        );
    }
}
