use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::auth::ApiKeyGuard;
use crate::domain::{Alert, AlertSeverity, AlertStatus};
use crate::error::map_db_error;
use crate::services::alert_dedup::{self, DuplicateStats};
use crate::services::alert_store::{self, AlertFilter, TransitionError};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertResponse {
    id: String,
    event_id: i64,
    rule_id: Option<String>,
    severity: String,
    status: String,
    dedup_key: String,
    channels: Vec<String>,
    metadata: JsonValue,
    created_at: String,
    delivered_at: Option<String>,
}

impl From<Alert> for AlertResponse {
    fn from(alert: Alert) -> Self {
        Self {
            id: alert.id.to_string(),
            event_id: alert.event_id,
            rule_id: alert.rule_id.map(|id| id.to_string()),
            severity: alert.severity.as_str().to_string(),
            status: alert.status.as_str().to_string(),
            dedup_key: alert.dedup_key,
            channels: alert.channels,
            metadata: alert.metadata,
            created_at: alert.created_at.to_rfc3339(),
            delivered_at: alert.delivered_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertListResponse {
    alerts: Vec<AlertResponse>,
    count: usize,
    limit: i64,
    offset: i64,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct ListAlertsQuery {
    status: Option<String>,
    severity: Option<String>,
    event_id: Option<i64>,
    rule_id: Option<Uuid>,
    dedup_key: Option<String>,
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct DedupStatsQuery {
    hours: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct DedupHistoryQuery {
    hours: Option<i64>,
    limit: Option<i64>,
}

fn parse_alert_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| (StatusCode::NOT_FOUND, "Alert not found".to_string()))
}

fn map_transition_error(err: TransitionError) -> (StatusCode, String) {
    match err {
        TransitionError::NotFound => (StatusCode::NOT_FOUND, "Alert not found".to_string()),
        TransitionError::InvalidTransition { from, to } => (
            StatusCode::CONFLICT,
            format!(
                "invalid alert transition {} -> {}",
                from.as_str(),
                to.as_str()
            ),
        ),
        TransitionError::Db(err) => map_db_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/alerts",
    tag = "alerts",
    params(ListAlertsQuery),
    responses((status = 200, description = "Alerts", body = AlertListResponse))
)]
pub(crate) async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<AlertListResponse>, (StatusCode, String)> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(AlertStatus::parse(raw).ok_or((
            StatusCode::BAD_REQUEST,
            "status must be one of: pending, delivered, acknowledged, dismissed".to_string(),
        ))?),
        None => None,
    };
    let severity = match query.severity.as_deref() {
        Some(raw) => Some(AlertSeverity::parse(raw).ok_or((
            StatusCode::BAD_REQUEST,
            "severity must be one of: low, medium, high, critical".to_string(),
        ))?),
        None => None,
    };

    let filter = AlertFilter {
        event_id: query.event_id,
        rule_id: query.rule_id,
        status,
        severity,
        dedup_key: query.dedup_key,
        since: query.since,
    };
    let (limit, offset) = alert_store::clamp_page(query.limit, query.offset);
    let alerts = alert_store::list_alerts(&state.db, &filter, Some(limit), Some(offset))
        .await
        .map_err(map_db_error)?;

    Ok(Json(AlertListResponse {
        count: alerts.len(),
        alerts: alerts.into_iter().map(AlertResponse::from).collect(),
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/api/alerts/abandoned",
    tag = "alerts",
    responses((status = 200, description = "Alerts the reaper gave up on", body = AlertListResponse))
)]
pub(crate) async fn list_abandoned(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<AlertListResponse>, (StatusCode, String)> {
    let (limit, offset) = alert_store::clamp_page(query.limit, query.offset);
    let alerts = alert_store::get_abandoned(&state.db, Some(limit), Some(offset))
        .await
        .map_err(map_db_error)?;
    Ok(Json(AlertListResponse {
        count: alerts.len(),
        alerts: alerts.into_iter().map(AlertResponse::from).collect(),
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/api/alerts/stats/dedup",
    tag = "alerts",
    params(DedupStatsQuery),
    responses((status = 200, description = "Dedup suppression stats", body = DuplicateStats))
)]
pub(crate) async fn dedup_stats(
    State(state): State<AppState>,
    Query(query): Query<DedupStatsQuery>,
) -> Result<Json<DuplicateStats>, (StatusCode, String)> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 30);
    let stats = alert_dedup::duplicate_stats(&state.db, hours, state.clock.now_utc())
        .await
        .map_err(map_db_error)?;
    Ok(Json(stats))
}

#[utoipa::path(
    get,
    path = "/api/alerts/history/{dedup_key}",
    tag = "alerts",
    params(
        ("dedup_key" = String, Path, description = "Deduplication key"),
        DedupHistoryQuery
    ),
    responses(
        (status = 200, description = "Alert history for one dedup key", body = AlertListResponse),
        (status = 400, description = "Invalid dedup key")
    )
)]
pub(crate) async fn dedup_history(
    State(state): State<AppState>,
    Path(dedup_key): Path<String>,
    Query(query): Query<DedupHistoryQuery>,
) -> Result<Json<AlertListResponse>, (StatusCode, String)> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 30);
    let limit = query.limit.unwrap_or(10);
    let alerts = alert_dedup::recent_alerts_for_key(
        &state.db,
        &dedup_key,
        hours,
        limit,
        state.clock.now_utc(),
    )
    .await
    .map_err(|err| match err {
        alert_dedup::DedupError::InvalidKey(reason) => (StatusCode::BAD_REQUEST, reason),
        alert_dedup::DedupError::Db(err) => map_db_error(err),
    })?;
    Ok(Json(AlertListResponse {
        count: alerts.len(),
        alerts: alerts.into_iter().map(AlertResponse::from).collect(),
        limit,
        offset: 0,
    }))
}

#[utoipa::path(
    get,
    path = "/api/alerts/{alert_id}",
    tag = "alerts",
    params(("alert_id" = String, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Alert", body = AlertResponse),
        (status = 404, description = "Not found")
    )
)]
pub(crate) async fn get_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<AlertResponse>, (StatusCode, String)> {
    let alert_id = parse_alert_id(&alert_id)?;
    let alert = alert_store::get_alert(&state.db, alert_id)
        .await
        .map_err(map_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Alert not found".to_string()))?;
    Ok(Json(AlertResponse::from(alert)))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{alert_id}/acknowledge",
    tag = "alerts",
    params(("alert_id" = String, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Acknowledged alert", body = AlertResponse),
        (status = 404, description = "Not found"),
        (status = 409, description = "Invalid transition")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn acknowledge_alert(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Path(alert_id): Path<String>,
) -> Result<Json<AlertResponse>, (StatusCode, String)> {
    let alert_id = parse_alert_id(&alert_id)?;
    let alert = alert_store::mark_acknowledged(&state.db, alert_id, state.clock.now_utc())
        .await
        .map_err(map_transition_error)?;
    Ok(Json(AlertResponse::from(alert)))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{alert_id}/dismiss",
    tag = "alerts",
    params(("alert_id" = String, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Dismissed alert", body = AlertResponse),
        (status = 404, description = "Not found"),
        (status = 409, description = "Invalid transition")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn dismiss_alert(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Path(alert_id): Path<String>,
) -> Result<Json<AlertResponse>, (StatusCode, String)> {
    let alert_id = parse_alert_id(&alert_id)?;
    let alert = alert_store::mark_dismissed(&state.db, alert_id, state.clock.now_utc())
        .await
        .map_err(map_transition_error)?;
    Ok(Json(AlertResponse::from(alert)))
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/abandoned", get(list_abandoned))
        .route("/alerts/stats/dedup", get(dedup_stats))
        .route("/alerts/history/{dedup_key}", get(dedup_history))
        .route("/alerts/{alert_id}", get(get_alert))
        .route("/alerts/{alert_id}/acknowledge", post(acknowledge_alert))
        .route("/alerts/{alert_id}/dismiss", post(dismiss_alert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_errors_map_to_http_statuses() {
        let (status, _) = map_transition_error(TransitionError::NotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, message) = map_transition_error(TransitionError::InvalidTransition {
            from: AlertStatus::Delivered,
            to: AlertStatus::Pending,
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(message.contains("delivered"));
        assert!(message.contains("pending"));
    }

    #[test]
    fn parse_alert_id_maps_garbage_to_not_found() {
        assert!(parse_alert_id("42").is_err());
        assert!(parse_alert_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
