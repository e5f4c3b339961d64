use axum::routing::get;
use axum::{Json, Router};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::state::AppState;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "ApiKey",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "security-core-rs",
        description = "Home-security intelligence core: alert pipeline and administration"
    ),
    modifiers(&SecurityAddon),
    components(schemas(
        crate::domain::AlertSeverity,
        crate::domain::AlertStatus,
        crate::domain::Schedule,
        crate::routes::health::HealthResponse,
        crate::routes::alert_rules::AlertRuleResponse,
        crate::routes::alert_rules::AlertRuleListResponse,
        crate::routes::alert_rules::CreateAlertRuleRequest,
        crate::routes::alert_rules::UpdateAlertRuleRequest,
        crate::routes::alert_rules::RuleTestRequest,
        crate::routes::alert_rules::RuleTestResponse,
        crate::routes::alert_rules::RuleDeleteResponse,
        crate::routes::alerts::AlertResponse,
        crate::routes::alerts::AlertListResponse,
        crate::services::alert_dedup::DuplicateStats,
        crate::services::alert_engine::RuleTestOutcome,
    )),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::health::readiness_handler,
        crate::routes::alert_rules::list_rules,
        crate::routes::alert_rules::get_rule,
        crate::routes::alert_rules::create_rule,
        crate::routes::alert_rules::update_rule,
        crate::routes::alert_rules::delete_rule,
        crate::routes::alert_rules::test_rule,
        crate::routes::alerts::list_alerts,
        crate::routes::alerts::list_abandoned,
        crate::routes::alerts::dedup_stats,
        crate::routes::alerts::dedup_history,
        crate::routes::alerts::get_alert,
        crate::routes::alerts::acknowledge_alert,
        crate::routes::alerts::dismiss_alert,
    )
)]
struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

async fn openapi_handler() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
