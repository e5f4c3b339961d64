use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::ApiKeyGuard;
use crate::domain::{
    AlertRule, AlertSeverity, Schedule, DEFAULT_COOLDOWN_SECONDS, DEFAULT_DEDUP_KEY_TEMPLATE,
};
use crate::error::{map_db_conflict, map_db_error};
use crate::services::alert_engine::{self, RuleTestOutcome};
use crate::services::alert_store::{self, NewRule};
use crate::services::event_store;
use crate::services::notification::ChannelKind;
use crate::state::AppState;

const DEFAULT_TEST_EVENT_LIMIT: i64 = 10;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertRuleResponse {
    id: String,
    name: String,
    description: String,
    enabled: bool,
    severity: String,
    risk_threshold: Option<i32>,
    camera_ids: Option<Vec<String>>,
    object_types: Option<Vec<String>>,
    zone_ids: Option<Vec<String>>,
    min_confidence: Option<f32>,
    schedule: Option<Schedule>,
    dedup_key_template: String,
    cooldown_seconds: i32,
    channels: Vec<String>,
    created_at: String,
    updated_at: String,
}

impl From<AlertRule> for AlertRuleResponse {
    fn from(rule: AlertRule) -> Self {
        Self {
            id: rule.id.to_string(),
            name: rule.name,
            description: rule.description,
            enabled: rule.enabled,
            severity: rule.severity.as_str().to_string(),
            risk_threshold: rule.risk_threshold,
            camera_ids: rule.camera_ids,
            object_types: rule.object_types,
            zone_ids: rule.zone_ids,
            min_confidence: rule.min_confidence,
            schedule: rule.schedule,
            dedup_key_template: rule.dedup_key_template,
            cooldown_seconds: rule.cooldown_seconds,
            channels: rule.channels,
            created_at: rule.created_at.to_rfc3339(),
            updated_at: rule.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlertRuleListResponse {
    rules: Vec<AlertRuleResponse>,
    count: i64,
    limit: i64,
    offset: i64,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct ListRulesQuery {
    enabled: Option<bool>,
    severity: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateAlertRuleRequest {
    name: String,
    description: Option<String>,
    enabled: Option<bool>,
    severity: Option<String>,
    risk_threshold: Option<i32>,
    camera_ids: Option<Vec<String>>,
    object_types: Option<Vec<String>>,
    zone_ids: Option<Vec<String>>,
    min_confidence: Option<f32>,
    schedule: Option<Schedule>,
    dedup_key_template: Option<String>,
    cooldown_seconds: Option<i32>,
    channels: Option<Vec<String>>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UpdateAlertRuleRequest {
    name: Option<String>,
    description: Option<String>,
    enabled: Option<bool>,
    severity: Option<String>,
    risk_threshold: Option<i32>,
    camera_ids: Option<Vec<String>>,
    object_types: Option<Vec<String>>,
    zone_ids: Option<Vec<String>>,
    min_confidence: Option<f32>,
    schedule: Option<Schedule>,
    dedup_key_template: Option<String>,
    cooldown_seconds: Option<i32>,
    channels: Option<Vec<String>>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct RuleTestRequest {
    event_ids: Option<Vec<i64>>,
    limit: Option<i64>,
    test_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct RuleTestResponse {
    rule_id: String,
    events_tested: usize,
    results: Vec<RuleTestOutcome>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct RuleDeleteResponse {
    status: String,
}

fn normalize_severity(value: &str) -> Result<AlertSeverity, (StatusCode, String)> {
    AlertSeverity::parse(value).ok_or((
        StatusCode::BAD_REQUEST,
        "severity must be one of: low, medium, high, critical".to_string(),
    ))
}

fn validate_channels(channels: &[String]) -> Result<(), (StatusCode, String)> {
    for channel in channels {
        if ChannelKind::parse(channel).is_none() {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown channel {channel:?}; channels must be a subset of: email, webhook, push"),
            ));
        }
    }
    Ok(())
}

fn validate_bounds(
    risk_threshold: Option<i32>,
    min_confidence: Option<f32>,
    cooldown_seconds: i32,
) -> Result<(), (StatusCode, String)> {
    if let Some(threshold) = risk_threshold {
        if !(0..=100).contains(&threshold) {
            return Err((
                StatusCode::BAD_REQUEST,
                "risk_threshold must be between 0 and 100".to_string(),
            ));
        }
    }
    if let Some(confidence) = min_confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err((
                StatusCode::BAD_REQUEST,
                "min_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }
    }
    if cooldown_seconds < 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "cooldown_seconds must be >= 0".to_string(),
        ));
    }
    Ok(())
}

async fn fetch_rule(state: &AppState, rule_id: Uuid) -> Result<AlertRule, (StatusCode, String)> {
    alert_store::get_rule(&state.db, rule_id)
        .await
        .map_err(map_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Alert rule not found".to_string()))
}

fn parse_rule_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| (StatusCode::NOT_FOUND, "Alert rule not found".to_string()))
}

#[utoipa::path(
    get,
    path = "/api/alerts/rules",
    tag = "alert_rules",
    params(ListRulesQuery),
    responses((status = 200, description = "Alert rules", body = AlertRuleListResponse))
)]
pub(crate) async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<AlertRuleListResponse>, (StatusCode, String)> {
    let severity = match query.severity.as_deref() {
        Some(raw) => Some(normalize_severity(raw)?),
        None => None,
    };
    let (limit, offset) = alert_store::clamp_page(query.limit, query.offset);
    let (rules, count) =
        alert_store::list_rules(&state.db, query.enabled, severity, Some(limit), Some(offset))
            .await
            .map_err(map_db_error)?;
    Ok(Json(AlertRuleListResponse {
        rules: rules.into_iter().map(AlertRuleResponse::from).collect(),
        count,
        limit,
        offset,
    }))
}

#[utoipa::path(
    get,
    path = "/api/alerts/rules/{rule_id}",
    tag = "alert_rules",
    params(("rule_id" = String, Path, description = "Alert rule id")),
    responses(
        (status = 200, description = "Alert rule", body = AlertRuleResponse),
        (status = 404, description = "Not found")
    )
)]
pub(crate) async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<Json<AlertRuleResponse>, (StatusCode, String)> {
    let rule_id = parse_rule_id(&rule_id)?;
    let rule = fetch_rule(&state, rule_id).await?;
    Ok(Json(AlertRuleResponse::from(rule)))
}

#[utoipa::path(
    post,
    path = "/api/alerts/rules",
    tag = "alert_rules",
    request_body = CreateAlertRuleRequest,
    responses(
        (status = 201, description = "Created alert rule", body = AlertRuleResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Duplicate rule name")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn create_rule(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Json(payload): Json<CreateAlertRuleRequest>,
) -> Result<(StatusCode, Json<AlertRuleResponse>), (StatusCode, String)> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
    }
    let severity = normalize_severity(payload.severity.as_deref().unwrap_or("medium"))?;
    let cooldown_seconds = payload
        .cooldown_seconds
        .unwrap_or(DEFAULT_COOLDOWN_SECONDS);
    validate_bounds(payload.risk_threshold, payload.min_confidence, cooldown_seconds)?;
    let channels = payload.channels.unwrap_or_default();
    validate_channels(&channels)?;
    let dedup_key_template = payload
        .dedup_key_template
        .map(|template| template.trim().to_string())
        .filter(|template| !template.is_empty())
        .unwrap_or_else(|| DEFAULT_DEDUP_KEY_TEMPLATE.to_string());

    let new_rule = NewRule {
        name,
        description: payload.description.unwrap_or_default(),
        enabled: payload.enabled.unwrap_or(true),
        severity,
        risk_threshold: payload.risk_threshold,
        camera_ids: payload.camera_ids,
        object_types: payload.object_types,
        zone_ids: payload.zone_ids,
        min_confidence: payload.min_confidence,
        schedule: payload.schedule,
        dedup_key_template,
        cooldown_seconds,
        channels,
    };

    let rule = alert_store::create_rule(&state.db, &new_rule)
        .await
        .map_err(|err| map_db_conflict(err, "Alert rule name already exists"))?;
    Ok((StatusCode::CREATED, Json(AlertRuleResponse::from(rule))))
}

#[utoipa::path(
    put,
    path = "/api/alerts/rules/{rule_id}",
    tag = "alert_rules",
    params(("rule_id" = String, Path, description = "Alert rule id")),
    request_body = UpdateAlertRuleRequest,
    responses(
        (status = 200, description = "Updated alert rule", body = AlertRuleResponse),
        (status = 404, description = "Not found")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn update_rule(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Path(rule_id): Path<String>,
    Json(payload): Json<UpdateAlertRuleRequest>,
) -> Result<Json<AlertRuleResponse>, (StatusCode, String)> {
    let rule_id = parse_rule_id(&rule_id)?;
    let mut existing = fetch_rule(&state, rule_id).await?;

    if let Some(name) = payload.name {
        let trimmed = name.trim().to_string();
        if trimmed.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "name is required".to_string()));
        }
        existing.name = trimmed;
    }
    if let Some(description) = payload.description {
        existing.description = description;
    }
    if let Some(enabled) = payload.enabled {
        existing.enabled = enabled;
    }
    if let Some(severity) = payload.severity.as_deref() {
        existing.severity = normalize_severity(severity)?;
    }
    if payload.risk_threshold.is_some() {
        existing.risk_threshold = payload.risk_threshold;
    }
    if payload.camera_ids.is_some() {
        existing.camera_ids = payload.camera_ids;
    }
    if payload.object_types.is_some() {
        existing.object_types = payload.object_types;
    }
    if payload.zone_ids.is_some() {
        existing.zone_ids = payload.zone_ids;
    }
    if payload.min_confidence.is_some() {
        existing.min_confidence = payload.min_confidence;
    }
    if payload.schedule.is_some() {
        existing.schedule = payload.schedule;
    }
    if let Some(template) = payload.dedup_key_template {
        let trimmed = template.trim().to_string();
        if !trimmed.is_empty() {
            existing.dedup_key_template = trimmed;
        }
    }
    if let Some(cooldown_seconds) = payload.cooldown_seconds {
        existing.cooldown_seconds = cooldown_seconds;
    }
    if let Some(channels) = payload.channels {
        existing.channels = channels;
    }

    validate_bounds(
        existing.risk_threshold,
        existing.min_confidence,
        existing.cooldown_seconds,
    )?;
    validate_channels(&existing.channels)?;

    let updated = alert_store::update_rule(&state.db, &existing)
        .await
        .map_err(|err| map_db_conflict(err, "Alert rule name already exists"))?;
    Ok(Json(AlertRuleResponse::from(updated)))
}

#[utoipa::path(
    delete,
    path = "/api/alerts/rules/{rule_id}",
    tag = "alert_rules",
    params(("rule_id" = String, Path, description = "Alert rule id")),
    responses(
        (status = 200, description = "Deleted alert rule", body = RuleDeleteResponse),
        (status = 404, description = "Not found")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn delete_rule(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Path(rule_id): Path<String>,
) -> Result<Json<RuleDeleteResponse>, (StatusCode, String)> {
    let rule_id = parse_rule_id(&rule_id)?;
    let deleted = alert_store::delete_rule(&state.db, rule_id)
        .await
        .map_err(map_db_error)?;
    if !deleted {
        return Err((StatusCode::NOT_FOUND, "Alert rule not found".to_string()));
    }
    Ok(Json(RuleDeleteResponse {
        status: "deleted".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/alerts/rules/{rule_id}/test",
    tag = "alert_rules",
    params(("rule_id" = String, Path, description = "Alert rule id")),
    request_body = RuleTestRequest,
    responses(
        (status = 200, description = "Per-event rule test results", body = RuleTestResponse),
        (status = 404, description = "Not found")
    ),
    security(("ApiKey" = []))
)]
pub(crate) async fn test_rule(
    State(state): State<AppState>,
    _guard: ApiKeyGuard,
    Path(rule_id): Path<String>,
    Json(payload): Json<RuleTestRequest>,
) -> Result<Json<RuleTestResponse>, (StatusCode, String)> {
    let rule_id = parse_rule_id(&rule_id)?;
    let rule = fetch_rule(&state, rule_id).await?;

    let events = match payload.event_ids.as_deref() {
        Some(ids) => event_store::get_events_by_ids(&state.db, ids)
            .await
            .map_err(map_db_error)?,
        None => event_store::list_recent_events(
            &state.db,
            payload.limit.unwrap_or(DEFAULT_TEST_EVENT_LIMIT),
        )
        .await
        .map_err(map_db_error)?,
    };

    let mut with_detections = Vec::with_capacity(events.len());
    for event in events {
        let detections = event_store::detections_for_event(&state.db, &event)
            .await
            .map_err(map_db_error)?;
        with_detections.push((event, detections));
    }

    let now = payload.test_time.unwrap_or_else(|| state.clock.now_utc());
    let results = alert_engine::test_rule_against_events(&rule, &with_detections, now);

    Ok(Json(RuleTestResponse {
        rule_id: rule_id.to_string(),
        events_tested: results.len(),
        results,
    }))
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts/rules", get(list_rules).post(create_rule))
        .route(
            "/alerts/rules/{rule_id}",
            get(get_rule)
                .put(update_rule)
                .patch(update_rule)
                .delete(delete_rule),
        )
        .route("/alerts/rules/{rule_id}/test", post(test_rule))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_severity_accepts_known_levels() {
        assert_eq!(normalize_severity("high").unwrap(), AlertSeverity::High);
        assert_eq!(normalize_severity("CRITICAL").unwrap(), AlertSeverity::Critical);
        assert!(normalize_severity("urgent").is_err());
    }

    #[test]
    fn validate_channels_rejects_unknown_names() {
        assert!(validate_channels(&["email".to_string(), "webhook".to_string()]).is_ok());
        assert!(validate_channels(&[]).is_ok());
        assert!(validate_channels(&["pager".to_string()]).is_err());
    }

    #[test]
    fn validate_bounds_checks_ranges() {
        assert!(validate_bounds(Some(70), Some(0.9), 300).is_ok());
        assert!(validate_bounds(Some(101), None, 300).is_err());
        assert!(validate_bounds(None, Some(1.5), 300).is_err());
        assert!(validate_bounds(None, None, -1).is_err());
        assert!(validate_bounds(Some(0), Some(0.0), 0).is_ok());
    }

    #[test]
    fn parse_rule_id_maps_garbage_to_not_found() {
        assert!(parse_rule_id("not-a-uuid").is_err());
        assert!(parse_rule_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
