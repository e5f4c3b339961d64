pub mod alert_rules;
pub mod alerts;
pub mod health;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::openapi;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(health::api_router())
                .merge(alert_rules::router())
                .merge(alerts::router())
                .merge(openapi::router()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_responds_without_a_database() {
        let app = router(test_support::test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutating_routes_require_the_api_key_when_enabled() {
        let mut config = test_support::test_config();
        config.api_key_enabled = true;
        config.api_key = Some("test-key".to_string());
        let app = router(test_support::test_state_with_config(config));

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/alerts/rules")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"name\":\"r\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/alerts/rules")
                    .header("content-type", "application/json")
                    .header("x-api-key", "wrong-key")
                    .body(Body::from("{\"name\":\"r\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn read_routes_skip_the_api_key_guard() {
        let mut config = test_support::test_config();
        config.api_key_enabled = true;
        config.api_key = Some("test-key".to_string());
        let app = router(test_support::test_state_with_config(config));

        // Reads never consult the guard, so no key is needed.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
