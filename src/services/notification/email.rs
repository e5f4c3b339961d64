use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::NotificationConfig;
use crate::domain::Alert;

use super::{ChannelKind, DeliveryOutcome};

const CHANNEL: ChannelKind = ChannelKind::Email;

fn build_subject(alert: &Alert) -> String {
    let severity = alert.severity.as_str().to_uppercase();
    let label = alert
        .metadata
        .get("rule_name")
        .and_then(|value| value.as_str())
        .unwrap_or(&alert.dedup_key);
    format!("[{severity}] Security Alert - {label}")
}

fn build_body(alert: &Alert) -> String {
    let mut body = String::new();
    body.push_str("A security alert was raised.\n\n");
    body.push_str(&format!("Alert ID:   {}\n", alert.id));
    body.push_str(&format!("Severity:   {}\n", alert.severity.as_str()));
    body.push_str(&format!("Status:     {}\n", alert.status.as_str()));
    body.push_str(&format!("Event ID:   {}\n", alert.event_id));
    body.push_str(&format!("Dedup key:  {}\n", alert.dedup_key));
    body.push_str(&format!(
        "Created at: {}\n",
        alert.created_at.to_rfc3339()
    ));
    if let Some(metadata) = alert.metadata.as_object().filter(|map| !map.is_empty()) {
        body.push_str("\nContext:\n");
        for (key, value) in metadata {
            body.push_str(&format!("  {key}: {value}\n"));
        }
    }
    body
}

fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> String {
    let rendered = err.to_string();
    let lowered = rendered.to_lowercase();
    if lowered.contains("authentication") || lowered.contains("535") {
        "smtp_auth_failed".to_string()
    } else {
        format!("smtp_error:{rendered}")
    }
}

/// One SMTP connection per delivery; STARTTLS when configured, optional
/// credentials. Recipients default to the configured list.
pub(super) async fn send(
    config: &NotificationConfig,
    alert: &Alert,
    recipients: Option<&[String]>,
    now: DateTime<Utc>,
) -> DeliveryOutcome {
    if !config.is_email_configured() {
        return DeliveryOutcome::failure(CHANNEL.as_str(), "email_not_configured");
    }
    // is_email_configured guarantees both values.
    let Some(host) = config.smtp_host.as_deref() else {
        return DeliveryOutcome::failure(CHANNEL.as_str(), "email_not_configured");
    };
    let Some(from_address) = config.smtp_from_address.as_deref() else {
        return DeliveryOutcome::failure(CHANNEL.as_str(), "email_not_configured");
    };

    let recipients: Vec<String> = recipients
        .filter(|list| !list.is_empty())
        .map(|list| list.to_vec())
        .unwrap_or_else(|| config.default_email_recipients.clone());
    if recipients.is_empty() {
        return DeliveryOutcome::failure(CHANNEL.as_str(), "no_recipients");
    }

    let from: Mailbox = match from_address.parse() {
        Ok(from) => from,
        Err(err) => {
            return DeliveryOutcome::failure(
                CHANNEL.as_str(),
                format!("smtp_error:invalid from address: {err}"),
            );
        }
    };

    let mut builder = Message::builder()
        .from(from)
        .subject(build_subject(alert));
    for recipient in &recipients {
        match recipient.parse::<Mailbox>() {
            Ok(mailbox) => builder = builder.to(mailbox),
            Err(err) => {
                return DeliveryOutcome::failure(
                    CHANNEL.as_str(),
                    format!("smtp_error:invalid recipient {recipient}: {err}"),
                );
            }
        }
    }
    let message = match builder.body(build_body(alert)) {
        Ok(message) => message,
        Err(err) => {
            return DeliveryOutcome::failure(CHANNEL.as_str(), format!("smtp_error:{err}"));
        }
    };

    let transport = match build_transport(config, host) {
        Ok(transport) => transport,
        Err(err) => {
            return DeliveryOutcome::failure(CHANNEL.as_str(), classify_smtp_error(&err));
        }
    };

    match transport.send(message).await {
        Ok(_) => DeliveryOutcome::success(CHANNEL, Some(recipients.join(", ")), now),
        Err(err) => DeliveryOutcome::failure(CHANNEL.as_str(), classify_smtp_error(&err)),
    }
}

fn build_transport(
    config: &NotificationConfig,
    host: &str,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let mut builder = if config.smtp_use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
    };
    builder = builder.port(config.smtp_port);
    if let (Some(user), Some(password)) = (
        config.smtp_user.as_deref(),
        config.smtp_password.as_deref(),
    ) {
        builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertSeverity, AlertStatus};
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            event_id: 42,
            rule_id: None,
            severity: AlertSeverity::High,
            status: AlertStatus::Pending,
            dedup_key: "front_door:person".to_string(),
            channels: vec!["email".to_string()],
            metadata: serde_json::json!({
                "rule_name": "Night perimeter",
                "matched_conditions": ["risk_score >= 70"],
            }),
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    #[test]
    fn subject_carries_severity_and_rule_name() {
        let subject = build_subject(&alert());
        assert!(subject.contains("[HIGH]"));
        assert!(subject.contains("Security Alert"));
        assert!(subject.contains("Night perimeter"));
    }

    #[test]
    fn subject_falls_back_to_dedup_key() {
        let mut anonymous = alert();
        anonymous.metadata = serde_json::json!({});
        let subject = build_subject(&anonymous);
        assert!(subject.contains("front_door:person"));
    }

    #[test]
    fn body_includes_alert_identity_and_context() {
        let alert = alert();
        let body = build_body(&alert);
        assert!(body.contains(&alert.id.to_string()));
        assert!(body.contains("high"));
        assert!(body.contains("front_door:person"));
        assert!(body.contains("rule_name"));
        assert!(body.contains("matched_conditions"));
    }

    #[tokio::test]
    async fn missing_recipients_yield_no_recipients_error() {
        let config = NotificationConfig {
            enabled: true,
            smtp_host: Some("smtp.example.com".to_string()),
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            smtp_from_address: Some("alerts@example.com".to_string()),
            smtp_use_tls: true,
            default_email_recipients: Vec::new(),
            default_webhook_url: None,
            webhook_timeout_seconds: 30,
        };
        let outcome = send(&config, &alert(), None, Utc::now()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no_recipients"));
    }
}
