use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use crate::config::NotificationConfig;
use crate::domain::Alert;

use super::{ChannelKind, DeliveryOutcome};

const CHANNEL: ChannelKind = ChannelKind::Webhook;

/// Wire payload posted to the configured webhook endpoint.
pub fn build_webhook_payload(alert: &Alert) -> JsonValue {
    json!({
        "type": "security_alert",
        "source": "home_security_intelligence",
        "alert": {
            "id": alert.id,
            "severity": alert.severity.as_str(),
            "status": alert.status.as_str(),
            "dedup_key": alert.dedup_key,
            "event_id": alert.event_id,
            "created_at": alert.created_at.to_rfc3339(),
        },
        "metadata": alert.metadata,
    })
}

/// Single JSON POST with a per-delivery timeout; one outcome per attempt.
pub(super) async fn send(
    config: &NotificationConfig,
    http: &reqwest::Client,
    alert: &Alert,
    url_override: Option<&str>,
    now: DateTime<Utc>,
) -> DeliveryOutcome {
    let Some(url) = url_override.or(config.default_webhook_url.as_deref()) else {
        return DeliveryOutcome::failure(CHANNEL.as_str(), "webhook_not_configured");
    };

    let response = http
        .post(url)
        .json(&build_webhook_payload(alert))
        .timeout(Duration::from_secs(config.webhook_timeout_seconds))
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            DeliveryOutcome::success(CHANNEL, Some(url.to_string()), now)
        }
        Ok(response) => DeliveryOutcome::failure(
            CHANNEL.as_str(),
            format!("webhook_http_{}", response.status().as_u16()),
        ),
        Err(err) if err.is_timeout() => {
            DeliveryOutcome::failure(CHANNEL.as_str(), "webhook_timeout")
        }
        Err(err) => {
            DeliveryOutcome::failure(CHANNEL.as_str(), format!("webhook_request_failed:{err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertSeverity, AlertStatus};
    use uuid::Uuid;

    #[test]
    fn payload_matches_the_wire_contract() {
        let alert = Alert {
            id: Uuid::new_v4(),
            event_id: 42,
            rule_id: None,
            severity: AlertSeverity::Critical,
            status: AlertStatus::Pending,
            dedup_key: "front_door:person".to_string(),
            channels: vec!["webhook".to_string()],
            metadata: json!({"rule_name": "Night perimeter"}),
            created_at: Utc::now(),
            delivered_at: None,
        };
        let payload = build_webhook_payload(&alert);

        assert_eq!(payload["type"], "security_alert");
        assert_eq!(payload["source"], "home_security_intelligence");
        assert_eq!(payload["alert"]["id"], json!(alert.id));
        assert_eq!(payload["alert"]["severity"], "critical");
        assert_eq!(payload["alert"]["status"], "pending");
        assert_eq!(payload["alert"]["dedup_key"], "front_door:person");
        assert_eq!(payload["alert"]["event_id"], 42);
        assert_eq!(payload["metadata"]["rule_name"], "Night perimeter");
    }
}
