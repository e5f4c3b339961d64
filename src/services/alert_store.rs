use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use std::fmt;
use uuid::Uuid;

use crate::domain::{Alert, AlertRule, AlertSeverity, AlertStatus, Schedule};

pub const MAX_PAGE_SIZE: i64 = 1000;
pub const DEFAULT_PAGE_SIZE: i64 = 100;

pub(crate) const ALERT_COLUMNS: &str =
    "id, event_id, rule_id, severity, status, dedup_key, channels, alert_metadata, created_at, delivered_at";

const RULE_COLUMNS: &str = "id, name, description, enabled, severity, risk_threshold, camera_ids, \
     object_types, zone_ids, min_confidence, schedule, dedup_key_template, cooldown_seconds, \
     channels, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AlertRow {
    id: Uuid,
    event_id: i64,
    rule_id: Option<Uuid>,
    severity: String,
    status: String,
    dedup_key: String,
    channels: SqlJson<JsonValue>,
    alert_metadata: SqlJson<JsonValue>,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl From<AlertRow> for Alert {
    fn from(row: AlertRow) -> Self {
        let severity = AlertSeverity::parse(&row.severity).unwrap_or_else(|| {
            tracing::warn!(alert_id = %row.id, severity = %row.severity, "unknown alert severity in store; defaulting to medium");
            AlertSeverity::Medium
        });
        let status = AlertStatus::parse(&row.status).unwrap_or_else(|| {
            tracing::warn!(alert_id = %row.id, status = %row.status, "unknown alert status in store; defaulting to pending");
            AlertStatus::Pending
        });
        Self {
            id: row.id,
            event_id: row.event_id,
            rule_id: row.rule_id,
            severity,
            status,
            dedup_key: row.dedup_key,
            channels: json_string_list(row.channels.0).unwrap_or_default(),
            metadata: row.alert_metadata.0,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct AlertRuleRow {
    id: Uuid,
    name: String,
    description: String,
    enabled: bool,
    severity: String,
    risk_threshold: Option<i32>,
    camera_ids: Option<SqlJson<JsonValue>>,
    object_types: Option<SqlJson<JsonValue>>,
    zone_ids: Option<SqlJson<JsonValue>>,
    min_confidence: Option<f32>,
    schedule: Option<SqlJson<JsonValue>>,
    dedup_key_template: String,
    cooldown_seconds: i32,
    channels: SqlJson<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AlertRuleRow> for AlertRule {
    fn from(row: AlertRuleRow) -> Self {
        let severity = AlertSeverity::parse(&row.severity).unwrap_or_else(|| {
            tracing::warn!(rule_id = %row.id, severity = %row.severity, "unknown rule severity in store; defaulting to medium");
            AlertSeverity::Medium
        });
        let schedule = row.schedule.and_then(|value| {
            match serde_json::from_value::<Schedule>(value.0.clone()) {
                Ok(schedule) => Some(schedule),
                Err(err) => {
                    tracing::warn!(rule_id = %row.id, error = %err, "unparseable rule schedule; ignoring");
                    None
                }
            }
        });
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            severity,
            risk_threshold: row.risk_threshold,
            camera_ids: row.camera_ids.and_then(|value| json_string_list(value.0)),
            object_types: row.object_types.and_then(|value| json_string_list(value.0)),
            zone_ids: row.zone_ids.and_then(|value| json_string_list(value.0)),
            min_confidence: row.min_confidence,
            schedule,
            dedup_key_template: row.dedup_key_template,
            cooldown_seconds: row.cooldown_seconds,
            channels: json_string_list(row.channels.0).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn json_string_list(value: JsonValue) -> Option<Vec<String>> {
    match value {
        JsonValue::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        JsonValue::Null => None,
        _ => None,
    }
}

pub fn clamp_page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

/// Optional filters for alert listing; absent fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub event_id: Option<i64>,
    pub rule_id: Option<Uuid>,
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub dedup_key: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

pub async fn get_alert(pool: &PgPool, alert_id: Uuid) -> Result<Option<Alert>, sqlx::Error> {
    let row: Option<AlertRow> = sqlx::query_as(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1"
    ))
    .bind(alert_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Alert::from))
}

pub async fn list_alerts(
    pool: &PgPool,
    filter: &AlertFilter,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Alert>, sqlx::Error> {
    let (limit, offset) = clamp_page(limit, offset);
    let rows: Vec<AlertRow> = sqlx::query_as(&format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE ($1::bigint IS NULL OR event_id = $1)
          AND ($2::uuid IS NULL OR rule_id = $2)
          AND ($3::text IS NULL OR status = $3)
          AND ($4::text IS NULL OR severity = $4)
          AND ($5::text IS NULL OR dedup_key = $5)
          AND ($6::timestamptz IS NULL OR created_at >= $6)
        ORDER BY created_at DESC, id DESC
        LIMIT $7 OFFSET $8
        "#
    ))
    .bind(filter.event_id)
    .bind(filter.rule_id)
    .bind(filter.status.map(AlertStatus::as_str))
    .bind(filter.severity.map(AlertSeverity::as_str))
    .bind(filter.dedup_key.as_deref())
    .bind(filter.since)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

pub async fn get_recent(pool: &PgPool, limit: Option<i64>) -> Result<Vec<Alert>, sqlx::Error> {
    list_alerts(pool, &AlertFilter::default(), limit, None).await
}

/// PENDING alerts never delivered, oldest first, for the reaper.
pub async fn get_undelivered(pool: &PgPool) -> Result<Vec<Alert>, sqlx::Error> {
    let rows: Vec<AlertRow> = sqlx::query_as(&format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE status = 'pending' AND delivered_at IS NULL
        ORDER BY created_at ASC, id ASC
        "#
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

/// Alerts the reaper gave up on (`delivery_abandoned` flag in metadata).
pub async fn get_abandoned(
    pool: &PgPool,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Vec<Alert>, sqlx::Error> {
    let (limit, offset) = clamp_page(limit, offset);
    let rows: Vec<AlertRow> = sqlx::query_as(&format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE alert_metadata @> '{{"delivery_abandoned": true}}'::jsonb
        ORDER BY created_at DESC, id DESC
        LIMIT $1 OFFSET $2
        "#
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

/// Read-only cooldown check for query paths. The dedup gate, not this
/// helper, owns the creation-side invariant.
pub async fn check_duplicate(
    pool: &PgPool,
    dedup_key: &str,
    cooldown_seconds: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    if cooldown_seconds <= 0 {
        return Ok(false);
    }
    let cutoff = now - Duration::seconds(cooldown_seconds);
    let exists: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM alerts
        WHERE dedup_key = $1
          AND status <> 'dismissed'
          AND created_at > $2
        LIMIT 1
        "#,
    )
    .bind(dedup_key)
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

#[derive(Debug)]
pub enum TransitionError {
    NotFound,
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    Db(sqlx::Error),
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "alert not found"),
            Self::InvalidTransition { from, to } => write!(
                f,
                "invalid alert transition {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            Self::Db(err) => write!(f, "database error: {err}"),
        }
    }
}

impl From<sqlx::Error> for TransitionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err)
    }
}

/// Sources each transition may start from; anything else is rejected.
fn allowed_sources(target: AlertStatus) -> &'static [AlertStatus] {
    match target {
        AlertStatus::Delivered => &[AlertStatus::Pending],
        AlertStatus::Acknowledged => &[AlertStatus::Delivered],
        AlertStatus::Dismissed => &[AlertStatus::Pending, AlertStatus::Acknowledged],
        AlertStatus::Pending => &[],
    }
}

async fn transition(
    pool: &PgPool,
    alert_id: Uuid,
    target: AlertStatus,
    now: DateTime<Utc>,
) -> Result<Alert, TransitionError> {
    let sources: Vec<&str> = allowed_sources(target)
        .iter()
        .map(|status| status.as_str())
        .collect();

    // delivered_at is stamped atomically with the state change and only on
    // the pending -> delivered edge.
    let updated: Option<AlertRow> = sqlx::query_as(&format!(
        r#"
        UPDATE alerts
        SET status = $2,
            delivered_at = CASE WHEN $2 = 'delivered' THEN $3 ELSE delivered_at END
        WHERE id = $1 AND status = ANY($4)
        RETURNING {ALERT_COLUMNS}
        "#
    ))
    .bind(alert_id)
    .bind(target.as_str())
    .bind(now)
    .bind(&sources)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = updated {
        return Ok(Alert::from(row));
    }

    // No row changed: either the alert is gone, already in the target state
    // (idempotent no-op), or the transition is illegal.
    let Some(current) = get_alert(pool, alert_id).await? else {
        return Err(TransitionError::NotFound);
    };
    if current.status == target {
        return Ok(current);
    }
    Err(TransitionError::InvalidTransition {
        from: current.status,
        to: target,
    })
}

pub async fn mark_delivered(
    pool: &PgPool,
    alert_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Alert, TransitionError> {
    transition(pool, alert_id, AlertStatus::Delivered, now).await
}

pub async fn mark_acknowledged(
    pool: &PgPool,
    alert_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Alert, TransitionError> {
    transition(pool, alert_id, AlertStatus::Acknowledged, now).await
}

pub async fn mark_dismissed(
    pool: &PgPool,
    alert_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Alert, TransitionError> {
    transition(pool, alert_id, AlertStatus::Dismissed, now).await
}

/// Shallow jsonb merge into the alert's metadata map.
pub async fn merge_metadata(
    pool: &PgPool,
    alert_id: Uuid,
    patch: &JsonValue,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE alerts
        SET alert_metadata = COALESCE(alert_metadata, '{}'::jsonb) || $2
        WHERE id = $1
        "#,
    )
    .bind(alert_id)
    .bind(SqlJson(patch))
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub severity: AlertSeverity,
    pub risk_threshold: Option<i32>,
    pub camera_ids: Option<Vec<String>>,
    pub object_types: Option<Vec<String>>,
    pub zone_ids: Option<Vec<String>>,
    pub min_confidence: Option<f32>,
    pub schedule: Option<Schedule>,
    pub dedup_key_template: String,
    pub cooldown_seconds: i32,
    pub channels: Vec<String>,
}

fn string_list_json(value: &Option<Vec<String>>) -> Option<SqlJson<JsonValue>> {
    value
        .as_ref()
        .map(|items| SqlJson(JsonValue::from(items.clone())))
}

pub async fn create_rule(pool: &PgPool, rule: &NewRule) -> Result<AlertRule, sqlx::Error> {
    let schedule_json = rule
        .schedule
        .as_ref()
        .map(|schedule| SqlJson(serde_json::to_value(schedule).unwrap_or(JsonValue::Null)));
    let row: AlertRuleRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO alert_rules (
            name, description, enabled, severity, risk_threshold, camera_ids,
            object_types, zone_ids, min_confidence, schedule,
            dedup_key_template, cooldown_seconds, channels, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
        RETURNING {RULE_COLUMNS}
        "#
    ))
    .bind(rule.name.trim())
    .bind(&rule.description)
    .bind(rule.enabled)
    .bind(rule.severity.as_str())
    .bind(rule.risk_threshold)
    .bind(string_list_json(&rule.camera_ids))
    .bind(string_list_json(&rule.object_types))
    .bind(string_list_json(&rule.zone_ids))
    .bind(rule.min_confidence)
    .bind(schedule_json)
    .bind(&rule.dedup_key_template)
    .bind(rule.cooldown_seconds)
    .bind(SqlJson(JsonValue::from(rule.channels.clone())))
    .fetch_one(pool)
    .await?;
    Ok(AlertRule::from(row))
}

/// Full-row update; callers fetch, merge, then write (route-side merge).
pub async fn update_rule(pool: &PgPool, rule: &AlertRule) -> Result<AlertRule, sqlx::Error> {
    let schedule_json = rule
        .schedule
        .as_ref()
        .map(|schedule| SqlJson(serde_json::to_value(schedule).unwrap_or(JsonValue::Null)));
    let row: AlertRuleRow = sqlx::query_as(&format!(
        r#"
        UPDATE alert_rules
        SET name = $2,
            description = $3,
            enabled = $4,
            severity = $5,
            risk_threshold = $6,
            camera_ids = $7,
            object_types = $8,
            zone_ids = $9,
            min_confidence = $10,
            schedule = $11,
            dedup_key_template = $12,
            cooldown_seconds = $13,
            channels = $14,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {RULE_COLUMNS}
        "#
    ))
    .bind(rule.id)
    .bind(rule.name.trim())
    .bind(&rule.description)
    .bind(rule.enabled)
    .bind(rule.severity.as_str())
    .bind(rule.risk_threshold)
    .bind(string_list_json(&rule.camera_ids))
    .bind(string_list_json(&rule.object_types))
    .bind(string_list_json(&rule.zone_ids))
    .bind(rule.min_confidence)
    .bind(schedule_json)
    .bind(&rule.dedup_key_template)
    .bind(rule.cooldown_seconds)
    .bind(SqlJson(JsonValue::from(rule.channels.clone())))
    .fetch_one(pool)
    .await?;
    Ok(AlertRule::from(row))
}

pub async fn delete_rule(pool: &PgPool, rule_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1")
        .bind(rule_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_rule(pool: &PgPool, rule_id: Uuid) -> Result<Option<AlertRule>, sqlx::Error> {
    let row: Option<AlertRuleRow> = sqlx::query_as(&format!(
        "SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = $1"
    ))
    .bind(rule_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(AlertRule::from))
}

pub async fn get_rule_by_name(pool: &PgPool, name: &str) -> Result<Option<AlertRule>, sqlx::Error> {
    let row: Option<AlertRuleRow> = sqlx::query_as(&format!(
        "SELECT {RULE_COLUMNS} FROM alert_rules WHERE name = $1"
    ))
    .bind(name.trim())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(AlertRule::from))
}

pub async fn list_rules(
    pool: &PgPool,
    enabled: Option<bool>,
    severity: Option<AlertSeverity>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<(Vec<AlertRule>, i64), sqlx::Error> {
    let (limit, offset) = clamp_page(limit, offset);
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT count(*)
        FROM alert_rules
        WHERE ($1::boolean IS NULL OR enabled = $1)
          AND ($2::text IS NULL OR severity = $2)
        "#,
    )
    .bind(enabled)
    .bind(severity.map(AlertSeverity::as_str))
    .fetch_one(pool)
    .await?;

    let rows: Vec<AlertRuleRow> = sqlx::query_as(&format!(
        r#"
        SELECT {RULE_COLUMNS}
        FROM alert_rules
        WHERE ($1::boolean IS NULL OR enabled = $1)
          AND ($2::text IS NULL OR severity = $2)
        ORDER BY name ASC
        LIMIT $3 OFFSET $4
        "#
    ))
    .bind(enabled)
    .bind(severity.map(AlertSeverity::as_str))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok((rows.into_iter().map(AlertRule::from).collect(), total))
}

/// Enabled rules applicable to a camera: no camera list, an empty list, or a
/// list containing the camera. Highest severity first so downstream
/// evaluation observes a deterministic priority.
pub async fn rules_for_camera(
    pool: &PgPool,
    camera_id: &str,
) -> Result<Vec<AlertRule>, sqlx::Error> {
    let rows: Vec<AlertRuleRow> = sqlx::query_as(&format!(
        r#"
        SELECT {RULE_COLUMNS}
        FROM alert_rules
        WHERE enabled = TRUE
          AND (
            camera_ids IS NULL
            OR camera_ids = '[]'::jsonb
            OR camera_ids @> to_jsonb($1::text)
          )
        ORDER BY
            CASE severity
                WHEN 'critical' THEN 0
                WHEN 'high' THEN 1
                WHEN 'medium' THEN 2
                WHEN 'low' THEN 3
                ELSE 4
            END,
            name ASC
        "#
    ))
    .bind(camera_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(AlertRule::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_page_bounds_limit_and_offset() {
        assert_eq!(clamp_page(None, None), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(clamp_page(Some(0), Some(-5)), (1, 0));
        assert_eq!(clamp_page(Some(5000), Some(20)), (MAX_PAGE_SIZE, 20));
        assert_eq!(clamp_page(Some(50), Some(10)), (50, 10));
    }

    #[test]
    fn allowed_sources_follow_the_lifecycle_graph() {
        assert_eq!(
            allowed_sources(AlertStatus::Delivered),
            &[AlertStatus::Pending]
        );
        assert_eq!(
            allowed_sources(AlertStatus::Acknowledged),
            &[AlertStatus::Delivered]
        );
        assert_eq!(
            allowed_sources(AlertStatus::Dismissed),
            &[AlertStatus::Pending, AlertStatus::Acknowledged]
        );
        assert!(allowed_sources(AlertStatus::Pending).is_empty());
    }

    #[test]
    fn json_string_list_keeps_only_strings() {
        let value = serde_json::json!(["email", 3, "webhook", null]);
        assert_eq!(
            json_string_list(value),
            Some(vec!["email".to_string(), "webhook".to_string()])
        );
        assert_eq!(json_string_list(JsonValue::Null), None);
        assert_eq!(json_string_list(serde_json::json!({"a": 1})), None);
    }

    #[test]
    fn alert_row_conversion_tolerates_unknown_enum_strings() {
        let row = AlertRow {
            id: Uuid::new_v4(),
            event_id: 7,
            rule_id: None,
            severity: "apocalyptic".to_string(),
            status: "weird".to_string(),
            dedup_key: "cam:rule".to_string(),
            channels: SqlJson(serde_json::json!(["email"])),
            alert_metadata: SqlJson(serde_json::json!({})),
            created_at: Utc::now(),
            delivered_at: None,
        };
        let alert = Alert::from(row);
        assert_eq!(alert.severity, AlertSeverity::Medium);
        assert_eq!(alert.status, AlertStatus::Pending);
        assert_eq!(alert.channels, vec!["email".to_string()]);
    }

    #[test]
    fn rule_row_conversion_drops_unparseable_schedule() {
        let row = AlertRuleRow {
            id: Uuid::new_v4(),
            name: "r".to_string(),
            description: String::new(),
            enabled: true,
            severity: "high".to_string(),
            risk_threshold: Some(70),
            camera_ids: None,
            object_types: Some(SqlJson(serde_json::json!(["person"]))),
            zone_ids: None,
            min_confidence: None,
            schedule: Some(SqlJson(serde_json::json!("not a schedule"))),
            dedup_key_template: "{camera_id}:{rule_id}".to_string(),
            cooldown_seconds: 300,
            channels: SqlJson(serde_json::json!([])),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let rule = AlertRule::from(row);
        assert!(rule.schedule.is_none());
        assert_eq!(rule.object_types, Some(vec!["person".to_string()]));
        assert_eq!(rule.severity, AlertSeverity::High);
    }
}
