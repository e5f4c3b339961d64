use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{Alert, AlertRule, Detection, Event};
use crate::services::{alert_dedup, alert_engine, alert_store, event_store};
use crate::state::AppState;

/// Outcome summary for one `process_event` pass. The coordinator never
/// raises; everything that went sideways is in `skipped` and the log.
#[derive(Debug, Clone, Default, Serialize, utoipa::ToSchema)]
pub struct PipelineSummary {
    pub event_id: i64,
    pub triggered: usize,
    pub created: usize,
    pub delivered: usize,
    pub skipped: Vec<SkippedRule>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SkippedRule {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, utoipa::ToSchema)]
pub struct ReaperSummary {
    pub examined: usize,
    pub delivered: usize,
    pub abandoned: usize,
}

fn skipped(rule: &str, reason: impl Into<String>) -> SkippedRule {
    SkippedRule {
        rule: rule.to_string(),
        reason: reason.into(),
    }
}

/// Entry point from the ingest side: look the event up and run the pipeline.
pub async fn process_event(state: &AppState, event_id: i64) -> PipelineSummary {
    let event = match event_store::get_event(&state.db, event_id).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            tracing::warn!(event_id, "process_event called for unknown event");
            return PipelineSummary {
                event_id,
                ..PipelineSummary::default()
            };
        }
        Err(err) => {
            tracing::error!(event_id, error = %err, "failed to load event");
            return PipelineSummary {
                event_id,
                ..PipelineSummary::default()
            };
        }
    };
    process_loaded_event(state, &event, None).await
}

/// Engine -> gate -> store -> orchestrator for one event. Detections may be
/// supplied by the caller; otherwise they are resolved through the event's
/// serialized id list, tolerating malformed or stale references.
pub async fn process_loaded_event(
    state: &AppState,
    event: &Event,
    detections: Option<Vec<Detection>>,
) -> PipelineSummary {
    let mut summary = PipelineSummary {
        event_id: event.id,
        ..PipelineSummary::default()
    };

    let detections = match detections {
        Some(detections) => detections,
        None => match event_store::detections_for_event(&state.db, event).await {
            Ok(detections) => detections,
            Err(err) => {
                tracing::error!(event_id = event.id, error = %err, "failed to load detections; treating as empty");
                Vec::new()
            }
        },
    };

    let rules = match alert_store::rules_for_camera(&state.db, &event.camera_id).await {
        Ok(rules) => rules,
        Err(err) => {
            tracing::error!(event_id = event.id, camera_id = %event.camera_id, error = %err, "failed to load rules");
            return summary;
        }
    };
    if rules.is_empty() {
        return summary;
    }

    let now = state.clock.now_utc();
    let evaluation = alert_engine::evaluate(&rules, event, &detections, now);
    summary.triggered = evaluation.triggered.len();
    for (rule, reason) in &evaluation.skipped {
        summary.skipped.push(skipped(&rule.name, reason.clone()));
    }

    for triggered in &evaluation.triggered {
        let rule = &triggered.rule;
        let new_alert = alert_dedup::NewAlert {
            event_id: event.id,
            rule_id: Some(rule.id),
            severity: triggered.severity,
            dedup_key: triggered.dedup_key.clone(),
            channels: rule.channels.clone(),
            metadata: json!({
                "rule_name": rule.name,
                "matched_conditions": triggered.matched_conditions,
                "camera_id": event.camera_id,
                "risk_score": event.risk_score,
            }),
        };

        let (alert, is_new) =
            match alert_dedup::create_if_not_duplicate(&state.db, &new_alert, None, now).await {
                Ok(created) => created,
                Err(err) => {
                    tracing::error!(rule = %rule.name, error = %err, "dedup gate failed");
                    summary
                        .skipped
                        .push(skipped(&rule.name, format!("gate_error:{err}")));
                    continue;
                }
            };
        if !is_new {
            tracing::debug!(rule = %rule.name, dedup_key = %triggered.dedup_key, existing = %alert.id, "suppressed duplicate alert");
            summary.skipped.push(skipped(&rule.name, "in_cooldown"));
            continue;
        }
        summary.created += 1;

        if deliver_and_mark(state, &alert, Some(rule), 0).await {
            summary.delivered += 1;
        }
    }

    tracing::info!(
        event_id = event.id,
        triggered = summary.triggered,
        created = summary.created,
        delivered = summary.delivered,
        skipped = summary.skipped.len(),
        "pipeline pass complete"
    );
    summary
}

/// Deliver one alert and, on full success, transition it to delivered.
/// Partial failure leaves the alert pending with the per-channel outcomes
/// recorded in its metadata for the reaper.
async fn deliver_and_mark(
    state: &AppState,
    alert: &Alert,
    rule: Option<&AlertRule>,
    prior_attempts: u64,
) -> bool {
    let now = state.clock.now_utc();
    let rule_channels = rule.map(|rule| rule.channels.as_slice());
    let report = state
        .notifier
        .deliver_alert(alert, None, rule_channels, now)
        .await;

    if report.all_successful {
        match alert_store::mark_delivered(&state.db, alert.id, state.clock.now_utc()).await {
            Ok(_) => return true,
            Err(err) => {
                tracing::error!(alert_id = %alert.id, error = %err, "failed to mark alert delivered");
                return false;
            }
        }
    }

    let patch = json!({
        "delivery_outcomes": report.outcomes,
        "delivery_attempts": prior_attempts + 1,
    });
    if let Err(err) = alert_store::merge_metadata(&state.db, alert.id, &patch).await {
        tracing::error!(alert_id = %alert.id, error = %err, "failed to record delivery outcomes");
    }
    false
}

/// Redrive delivery for alerts that are still pending past the grace
/// interval. After the attempt budget is exhausted the alert is flagged
/// `delivery_abandoned` and no longer retried.
pub async fn process_undelivered(state: &AppState) -> ReaperSummary {
    let mut summary = ReaperSummary::default();
    let pending = match alert_store::get_undelivered(&state.db).await {
        Ok(pending) => pending,
        Err(err) => {
            tracing::error!(error = %err, "failed to list undelivered alerts");
            return summary;
        }
    };

    let now = state.clock.now_utc();
    let grace = chrono::Duration::seconds(state.config.reaper_grace_seconds as i64);
    let max_attempts = u64::from(state.config.reaper_max_attempts);

    for alert in pending {
        if now - alert.created_at < grace {
            continue;
        }
        if alert
            .metadata
            .get("delivery_abandoned")
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
        {
            continue;
        }
        summary.examined += 1;

        let attempts = alert
            .metadata
            .get("delivery_attempts")
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        if attempts >= max_attempts {
            tracing::warn!(alert_id = %alert.id, attempts, "delivery attempts exhausted; abandoning alert");
            let patch = json!({ "delivery_abandoned": true });
            if let Err(err) = alert_store::merge_metadata(&state.db, alert.id, &patch).await {
                tracing::error!(alert_id = %alert.id, error = %err, "failed to flag abandoned alert");
            }
            summary.abandoned += 1;
            continue;
        }

        let rule = match alert.rule_id {
            Some(rule_id) => alert_store::get_rule(&state.db, rule_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(alert_id = %alert.id, error = %err, "failed to load rule for redelivery");
                    None
                }),
            None => None,
        };

        if deliver_and_mark(state, &alert, rule.as_ref(), attempts).await {
            summary.delivered += 1;
        }
    }

    if summary.examined > 0 {
        tracing::info!(
            examined = summary.examined,
            delivered = summary.delivered,
            abandoned = summary.abandoned,
            "reaper pass complete"
        );
    }
    summary
}

/// Periodic redelivery loop; cancellation is cooperative via the token.
#[derive(Clone)]
pub struct ReaperService {
    state: AppState,
    interval: Duration,
}

impl ReaperService {
    pub fn new(state: AppState, interval_seconds: u64) -> Self {
        Self {
            state,
            interval: Duration::from_secs(interval_seconds.max(5)),
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        process_undelivered(&self.state).await;
                    }
                }
            }
        });
    }
}
