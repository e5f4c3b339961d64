use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, Transaction};
use std::fmt;
use uuid::Uuid;

use crate::domain::{validate_dedup_key, Alert, AlertSeverity, DEFAULT_COOLDOWN_SECONDS};
use crate::services::alert_store::{AlertRow, ALERT_COLUMNS};

#[derive(Debug)]
pub enum DedupError {
    InvalidKey(String),
    Db(sqlx::Error),
}

impl fmt::Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(reason) => write!(f, "invalid dedup key: {reason}"),
            Self::Db(err) => write!(f, "database error: {err}"),
        }
    }
}

impl From<sqlx::Error> for DedupError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupCheck {
    pub is_duplicate: bool,
    pub existing_alert_id: Option<Uuid>,
    pub seconds_until_cooldown_expires: Option<i64>,
}

/// Fields of an alert the gate is asked to create.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub event_id: i64,
    pub rule_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub dedup_key: String,
    pub channels: Vec<String>,
    pub metadata: JsonValue,
}

/// Teacher-style advisory lock key: FNV-1a over `namespace:value`, folded
/// into the i64 domain pg_advisory_xact_lock expects.
fn advisory_lock_key(namespace: &str, value: &str) -> i64 {
    fn fnv1a_64(input: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    let combined = format!("{namespace}:{value}");
    fnv1a_64(&combined) as i64
}

fn seconds_remaining(created_at: DateTime<Utc>, cooldown_seconds: i64, now: DateTime<Utc>) -> i64 {
    (cooldown_seconds - (now - created_at).num_seconds()).max(0)
}

/// Newest non-dismissed alert with the key inside the cooldown window. The
/// window is left-open, right-closed: an alert created exactly
/// `cooldown_seconds` ago is not a duplicate. Cooldown 0 disables dedup.
pub async fn check_duplicate(
    pool: &PgPool,
    dedup_key: &str,
    cooldown_seconds: i64,
    now: DateTime<Utc>,
) -> Result<DedupCheck, DedupError> {
    let dedup_key = validate_dedup_key(dedup_key).map_err(DedupError::InvalidKey)?;
    if cooldown_seconds <= 0 {
        return Ok(DedupCheck::default());
    }

    let existing: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT id, created_at
        FROM alerts
        WHERE dedup_key = $1
          AND status <> 'dismissed'
          AND created_at > $2
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(&dedup_key)
    .bind(now - Duration::seconds(cooldown_seconds))
    .fetch_optional(pool)
    .await?;

    Ok(match existing {
        Some((id, created_at)) => DedupCheck {
            is_duplicate: true,
            existing_alert_id: Some(id),
            seconds_until_cooldown_expires: Some(seconds_remaining(
                created_at,
                cooldown_seconds,
                now,
            )),
        },
        None => DedupCheck::default(),
    })
}

async fn rule_cooldown(pool: &PgPool, rule_id: Uuid) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar("SELECT cooldown_seconds FROM alert_rules WHERE id = $1")
        .bind(rule_id)
        .fetch_optional(pool)
        .await
}

/// Cooldown for a rule id; deleted rules and a missing id both resolve to
/// the 300 s default.
pub async fn cooldown_for_rule(
    pool: &PgPool,
    rule_id: Option<Uuid>,
) -> Result<i64, sqlx::Error> {
    let Some(rule_id) = rule_id else {
        return Ok(i64::from(DEFAULT_COOLDOWN_SECONDS));
    };
    Ok(rule_cooldown(pool, rule_id)
        .await?
        .map(i64::from)
        .unwrap_or(i64::from(DEFAULT_COOLDOWN_SECONDS)))
}

async fn find_duplicate_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    dedup_key: &str,
    cooldown_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Option<Alert>, sqlx::Error> {
    if cooldown_seconds <= 0 {
        return Ok(None);
    }
    let row: Option<AlertRow> = sqlx::query_as(&format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE dedup_key = $1
          AND status <> 'dismissed'
          AND created_at > $2
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#
    ))
    .bind(dedup_key)
    .bind(now - Duration::seconds(cooldown_seconds))
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(Alert::from))
}

/// Atomic check-then-insert. Concurrent creators with the same key are
/// serialized on a per-key advisory transaction lock, so within a cooldown
/// window exactly one caller observes `is_new = true`; the rest get the
/// existing alert back.
pub async fn create_if_not_duplicate(
    pool: &PgPool,
    new_alert: &NewAlert,
    cooldown_seconds: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(Alert, bool), DedupError> {
    let dedup_key = validate_dedup_key(&new_alert.dedup_key).map_err(DedupError::InvalidKey)?;

    // Resolve the cooldown and whether the rule row still exists; a rule
    // deleted between evaluation and insertion must not fail the pipeline.
    let (rule_id, cooldown_seconds) = match new_alert.rule_id {
        Some(rule_id) => {
            match rule_cooldown(pool, rule_id).await? {
                Some(rule_cooldown) => (
                    Some(rule_id),
                    cooldown_seconds.unwrap_or(i64::from(rule_cooldown)),
                ),
                None => {
                    tracing::warn!(rule_id = %rule_id, "rule deleted before alert insertion; creating alert without rule");
                    (
                        None,
                        cooldown_seconds.unwrap_or(i64::from(DEFAULT_COOLDOWN_SECONDS)),
                    )
                }
            }
        }
        None => (
            None,
            cooldown_seconds.unwrap_or(i64::from(DEFAULT_COOLDOWN_SECONDS)),
        ),
    };

    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(advisory_lock_key("alert_dedup", &dedup_key))
        .execute(&mut *tx)
        .await?;

    if let Some(existing) = find_duplicate_in_tx(&mut tx, &dedup_key, cooldown_seconds, now).await? {
        tx.commit().await?;
        return Ok((existing, false));
    }

    let inserted: AlertRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO alerts (
            event_id, rule_id, severity, status, dedup_key, channels,
            alert_metadata, created_at
        )
        VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7)
        RETURNING {ALERT_COLUMNS}
        "#
    ))
    .bind(new_alert.event_id)
    .bind(rule_id)
    .bind(new_alert.severity.as_str())
    .bind(&dedup_key)
    .bind(SqlJson(JsonValue::from(new_alert.channels.clone())))
    .bind(SqlJson(new_alert.metadata.clone()))
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((Alert::from(inserted), true))
}

/// Recent alert history for one dedup key, newest first.
pub async fn recent_alerts_for_key(
    pool: &PgPool,
    dedup_key: &str,
    hours: i64,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Alert>, DedupError> {
    let dedup_key = validate_dedup_key(dedup_key).map_err(DedupError::InvalidKey)?;
    let rows: Vec<AlertRow> = sqlx::query_as(&format!(
        r#"
        SELECT {ALERT_COLUMNS}
        FROM alerts
        WHERE dedup_key = $1 AND created_at >= $2
        ORDER BY created_at DESC, id DESC
        LIMIT $3
        "#
    ))
    .bind(&dedup_key)
    .bind(now - Duration::hours(hours.max(0)))
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

#[derive(Debug, Clone, Copy, serde::Serialize, utoipa::ToSchema)]
pub struct DuplicateStats {
    pub total_alerts: i64,
    pub unique_dedup_keys: i64,
    pub dedup_ratio: f64,
}

/// Suppression statistics over a trailing window.
pub async fn duplicate_stats(
    pool: &PgPool,
    hours: i64,
    now: DateTime<Utc>,
) -> Result<DuplicateStats, sqlx::Error> {
    let (total_alerts, unique_dedup_keys): (i64, i64) = sqlx::query_as(
        r#"
        SELECT count(*), count(DISTINCT dedup_key)
        FROM alerts
        WHERE created_at >= $1
        "#,
    )
    .bind(now - Duration::hours(hours.max(0)))
    .fetch_one(pool)
    .await?;

    let dedup_ratio = if total_alerts > 0 {
        (unique_dedup_keys as f64 / total_alerts as f64 * 100.0).round() / 100.0
    } else {
        0.0
    };
    Ok(DuplicateStats {
        total_alerts,
        unique_dedup_keys,
        dedup_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advisory_lock_key_is_stable_and_namespaced() {
        let a = advisory_lock_key("alert_dedup", "front_door:rule-1");
        let b = advisory_lock_key("alert_dedup", "front_door:rule-1");
        let c = advisory_lock_key("alert_dedup", "front_door:rule-2");
        let d = advisory_lock_key("other", "front_door:rule-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn seconds_remaining_clamps_at_zero() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let recent = now - Duration::seconds(120);
        assert_eq!(seconds_remaining(recent, 300, now), 180);

        let stale = now - Duration::seconds(600);
        assert_eq!(seconds_remaining(stale, 300, now), 0);
    }
}
