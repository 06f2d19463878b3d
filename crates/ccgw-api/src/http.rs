//! Small HTTP helpers shared by the public and management routers.

use axum::http::HeaderMap;

/// Caller key from `x-api-key` or `Authorization: Bearer`.
pub(crate) fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

/// Best-effort client address for audit rows: proxy headers only, since the
/// gateway typically sits behind a local reverse proxy or none at all.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        let first = forwarded.split(',').next()?.trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    header_value(headers, "x-real-ip")
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = header_value(headers, "cookie")?;
    for pair in cookies.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

pub(crate) fn epoch_ms(at: time::OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_epoch_ms(ms: i64) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn api_key_prefers_x_api_key_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-a"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-b"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-a"));

        headers.remove("x-api-key");
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-b"));
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn cookie_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("theme=dark; ccgw_session=tok123"),
        );
        assert_eq!(cookie_value(&headers, "ccgw_session").as_deref(), Some("tok123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
