use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "X-Catalog-Key";

/// Operator API keys. An empty key set leaves the control API open.
#[derive(Clone, Default)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
}

/// Identity attached to authenticated requests.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub client_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    client_id: String,
    api_key_id: String,
}

impl AuthState {
    /// Parses `label:key` pairs separated by commas.
    pub fn from_keys(raw: &str) -> Self {
        let records = Arc::new(parse_keys(raw));
        if records.is_empty() {
            warn!(
                target = "catalog.api",
                "CATALOG_API_KEYS is empty; run control endpoints are unauthenticated"
            );
        } else {
            info!(target = "catalog.api", key_count = records.len(), "loaded API keys");
        }
        Self { records }
    }

    pub fn is_enabled(&self) -> bool {
        !self.records.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            client_id: record.client_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if !state.is_enabled() {
        return Ok(next.run(request).await);
    }

    let Some(presented) = extract_api_key(request.headers()) else {
        let response =
            unauthorized_response("missing_api_key", "Provide X-Catalog-Key or Bearer token");
        return Ok(response);
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "catalog.api", "rejected unknown api key");
        let response = unauthorized_response("invalid_api_key", "Key not recognized");
        return Ok(response);
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError::new(code, Some(message.to_string()));
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let label = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (label, key) {
            (Some(label), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    KeyRecord {
                        client_id: label.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            // never log the entry itself, it may hold a secret
            _ => warn!(
                target = "catalog.api",
                position = idx + 1,
                "ignored malformed CATALOG_API_KEYS entry"
            ),
        }
    }
    entries
}
