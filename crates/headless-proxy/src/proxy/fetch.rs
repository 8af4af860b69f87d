//! Script-level fetch used for mutating methods.
//!
//! The request is replayed from inside the session with `fetch`, so it carries
//! the session's cookies and follows redirects the way a page would.

use serde_json::{json, Value};

/// Body returned when the in-session fetch could not reach the upstream.
pub const UPSTREAM_ERROR_BODY: &str = "Error communicating with upstream server";

/// Response headers that describe the in-session transfer, not the payload.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "content-encoding",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

/// Build the fetch script. All values are embedded as JSON literals.
pub fn build_fetch_script(url: &str, method: &str, headers: &[(String, String)], body: &[u8]) -> String {
    let header_object: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    let body = if body.is_empty() {
        Value::Null
    } else {
        Value::String(String::from_utf8_lossy(body).into_owned())
    };
    let init = json!({
        "method": method,
        "headers": header_object,
        "body": body,
        "credentials": "include",
        "redirect": "follow",
    });

    format!(
        r#"(async () => {{
  try {{
    const response = await fetch({url}, {init});
    const text = await response.text();
    const headers = {{}};
    response.headers.forEach((value, key) => {{ headers[key] = value; }});
    return {{ status: response.status, statusText: response.statusText, headers, body: text }};
  }} catch (error) {{
    return {{ error: String(error), status: 500 }};
  }}
}})()"#,
        url = Value::String(url.to_string()),
        init = init,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// The script reported a network-level failure.
    NetworkError(String),
}

/// Interpret the value the fetch script evaluated to.
pub fn parse_fetch_result(value: &Value) -> Result<FetchOutcome, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("unexpected fetch result: {value}"))?;

    if let Some(error) = object.get("error") {
        let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Ok(FetchOutcome::NetworkError(message));
    }

    let status = object
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| "fetch result has no valid status".to_string())?;

    let headers = object
        .get("headers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(name, _)| !DROPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
                .map(|(name, value)| {
                    let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let body = object
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(FetchOutcome::Response {
        status,
        headers,
        body,
    })
}
