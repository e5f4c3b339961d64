use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Extractor guarding mutating routes. When `api_key_enabled` is off the
/// guard is a pass-through; read-only routes never use it.
#[derive(Debug, Clone, Copy)]
pub struct ApiKeyGuard;

impl FromRequestParts<AppState> for ApiKeyGuard {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if !state.config.api_key_enabled {
            return Ok(Self);
        }
        let Some(expected) = state.config.api_key.as_deref() else {
            return Err(AppError::internal("API key enforcement misconfigured"));
        };
        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match provided {
            Some(provided) if keys_match(provided, expected) => Ok(Self),
            Some(_) => Err(AppError::unauthorized("Invalid API key")),
            None => Err(AppError::unauthorized("Missing X-API-Key header")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_is_exact() {
        assert!(keys_match("secret-key", "secret-key"));
        assert!(!keys_match("secret-key", "secret-keY"));
        assert!(!keys_match("secret", "secret-key"));
        assert!(!keys_match("", "secret-key"));
    }
}
