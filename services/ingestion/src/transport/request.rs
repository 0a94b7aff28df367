use std::collections::HashMap;

use serde::de::DeserializeOwned;

use super::HttpRequest;

pub(super) fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = target
        .split_once('?')
        .map(|(path, query)| (path, Some(query)))
        .unwrap_or((target, None));
    let mut query = HashMap::new();
    if let Some(query_str) = query_str {
        for pair in query_str.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(percent_decode(k, true), percent_decode(v, true));
        }
    }
    (percent_decode(path, false), query)
}

/// Decodes `%XX` escapes; malformed escapes are kept literally.
pub(super) fn percent_decode(raw: &str, plus_as_space: bool) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

pub(super) fn parse_query_usize(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<usize>, String> {
    match query.get(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| format!("query parameter '{key}' must be a non-negative integer")),
    }
}

pub(super) fn parse_query_u64(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<u64>, String> {
    match query.get(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("query parameter '{key}' must be a non-negative integer")),
    }
}

pub(super) fn parse_query_i64(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<i64>, String> {
    match query.get(key) {
        None => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("query parameter '{key}' must be an integer")),
    }
}

pub(super) fn parse_query_positive_ms(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<i64>, String> {
    match query.get(key) {
        None => Ok(None),
        Some(value) => match value.parse::<i64>() {
            Ok(ms) if ms > 0 => Ok(Some(ms)),
            _ => Err(format!("query parameter '{key}' must be a positive number of milliseconds")),
        },
    }
}

pub(super) fn parse_json_body<T: DeserializeOwned>(
    request: &HttpRequest,
    route: &str,
) -> Result<T, String> {
    if let Some(content_type) = request.header("content-type")
        && !content_type
            .to_ascii_lowercase()
            .contains("application/json")
    {
        return Err(format!(
            "content-type must include application/json for {route}"
        ));
    }
    let body = std::str::from_utf8(&request.body)
        .map_err(|_| "request body must be valid UTF-8".to_string())?;
    if body.trim().is_empty() {
        return Err("request body must be a JSON object".to_string());
    }
    serde_json::from_str(body).map_err(|err| format!("invalid JSON payload: {err}"))
}

/// Admin credential from `x-admin-token` or an `Authorization: Bearer` header.
pub(super) fn presented_admin_token(request: &HttpRequest) -> Option<&str> {
    if let Some(token) = request.header("x-admin-token") {
        return Some(token.trim());
    }
    request
        .header("authorization")
        .and_then(|value| value.trim().strip_prefix("Bearer "))
        .map(str::trim)
}

/// Splits `/v1/subjects/{id}/events` style paths after a fixed prefix.
pub(super) fn path_segments<'a>(path: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    let rest = path.strip_prefix(prefix)?;
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments)
}
