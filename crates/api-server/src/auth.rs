use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Hash a key with SHA-256 so set lookups compare fixed-length digests.
fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod auth_tests;

/// Accepted API keys, stored as hashes.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    hashes: HashSet<String>,
}

impl ApiKeys {
    pub fn new<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            hashes: keys
                .into_iter()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(hash_key)
                .collect(),
        }
    }

    /// Comma-separated keys from `API_KEYS`. Unset means authentication is off.
    pub fn from_env() -> Self {
        let raw = std::env::var("API_KEYS").unwrap_or_default();
        Self::new(raw.split(','))
    }

    pub fn is_enabled(&self) -> bool {
        !self.hashes.is_empty()
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.hashes.contains(&hash_key(key))
    }
}

/// API key authentication middleware.
///
/// Checks for the key in:
/// 1. X-API-Key header
/// 2. Authorization: Api-Key <key> header (used by the scheduler)
/// 3. Authorization: Bearer <token> header
pub async fn auth_middleware(
    State(state): State<crate::AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if request.uri().path() == "/health" || !state.api_keys.is_enabled() {
        return Ok(next.run(request).await);
    }

    let api_key = extract_api_key(&headers)?;
    if !state.api_keys.accepts(&api_key) {
        tracing::warn!("Invalid API key attempted: {}", mask_api_key(&api_key));
        return Err(AuthError::InvalidApiKey);
    }

    Ok(next.run(request).await)
}

pub(crate) fn extract_api_key(headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(api_key) = headers.get("X-API-Key") {
        if let Ok(key) = api_key.to_str() {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
    }

    if let Some(auth) = headers.get("Authorization") {
        if let Ok(auth_str) = auth.to_str() {
            let token = auth_str
                .strip_prefix("Api-Key ")
                .or_else(|| auth_str.strip_prefix("Bearer "));
            if let Some(token) = token.map(str::trim) {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
    }

    Err(AuthError::MissingApiKey)
}

/// Mask API key for logging (show first 4 and last 4 characters)
pub(crate) fn mask_api_key(key: &str) -> String {
    if key.len() <= 8 || !key.is_ascii() {
        return "****".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

#[derive(Debug)]
pub enum AuthError {
    MissingApiKey,
    InvalidApiKey,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingApiKey => write!(f, "Missing API key"),
            AuthError::InvalidApiKey => write!(f, "Invalid API key"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingApiKey => (
                StatusCode::UNAUTHORIZED,
                "Missing API key. Provide via X-API-Key or Authorization: Api-Key header.",
            ),
            AuthError::InvalidApiKey => (StatusCode::FORBIDDEN, "Invalid API key."),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
