//! # auth
//!
//! Shared bearer-token gate for the snapshot/WS surface. In production mode
//! every protected endpoint requires the configured token; outside it the
//! checks are no-ops.

use std::collections::HashMap;

use axum::http::{HeaderMap, StatusCode};

use crate::config::Config;

/// `Bearer <token>` → `<token>`.
pub fn extract_bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Token lookup order: `token`/`access_token` query params, then the
/// Authorization bearer header, then the X-Access-Token / X-Token headers.
pub fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    for key in ["token", "access_token"] {
        if let Some(value) = query.get(key).filter(|v| !v.is_empty()) {
            return Some(value.clone());
        }
    }
    if let Some(value) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
    {
        return Some(value.to_string());
    }
    for key in ["x-access-token", "x-token"] {
        if let Some(value) = headers.get(key).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// HTTP-side access check. 503 when prod mode has no token configured,
/// 401 on a missing or mismatching token.
pub fn check_access(
    cfg: &Config,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), StatusCode> {
    if !cfg.prod_mode {
        return Ok(());
    }
    let Some(expected) = cfg.prod_token.as_deref() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    match extract_token(headers, query) {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn prod_config(token: Option<&str>) -> Config {
        let mut cfg = Config::from_env();
        cfg.prod_mode = true;
        cfg.prod_token = token.map(str::to_string);
        cfg
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer "), None);
    }

    #[test]
    fn token_lookup_order() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer header-token"));
        headers.insert("x-token", HeaderValue::from_static("x-token-value"));

        let mut query = HashMap::new();
        query.insert("token".to_string(), "query-token".to_string());

        // Query wins over headers
        assert_eq!(extract_token(&headers, &query), Some("query-token".into()));
        query.clear();
        assert_eq!(extract_token(&headers, &query), Some("header-token".into()));
        headers.remove("authorization");
        assert_eq!(extract_token(&headers, &query), Some("x-token-value".into()));
    }

    #[test]
    fn check_access_rules() {
        let open = Config::from_env();
        assert!(check_access(&open, &HeaderMap::new(), &HashMap::new()).is_ok());

        let unconfigured = prod_config(None);
        assert_eq!(
            check_access(&unconfigured, &HeaderMap::new(), &HashMap::new()),
            Err(StatusCode::SERVICE_UNAVAILABLE)
        );

        let cfg = prod_config(Some("s3cret"));
        assert_eq!(
            check_access(&cfg, &HeaderMap::new(), &HashMap::new()),
            Err(StatusCode::UNAUTHORIZED)
        );

        let mut query = HashMap::new();
        query.insert("access_token".to_string(), "s3cret".to_string());
        assert!(check_access(&cfg, &HeaderMap::new(), &query).is_ok());

        query.insert("access_token".to_string(), "wrong".to_string());
        assert_eq!(
            check_access(&cfg, &HeaderMap::new(), &query),
            Err(StatusCode::UNAUTHORIZED)
        );
    }
}
