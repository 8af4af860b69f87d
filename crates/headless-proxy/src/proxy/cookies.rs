//! Cookie translation between HTTP and the session.

use crate::session::{CookieParam, SessionCookie};

/// Session cookies for the inbound request cookies, scoped to the upstream host.
pub fn request_cookie_params(cookies: &[(String, String)], upstream_host: &str) -> Vec<CookieParam> {
    cookies
        .iter()
        .map(|(name, value)| CookieParam {
            name: name.clone(),
            value: value.clone(),
            domain: Some(upstream_host.to_string()).filter(|h| !h.is_empty()),
            path: Some("/".to_string()),
        })
        .collect()
}

/// Format a session cookie as a `Set-Cookie` header value.
pub fn format_set_cookie(cookie: &SessionCookie) -> String {
    let mut out = format!("{}={}", cookie.name, cookie.value);
    if !cookie.path.is_empty() {
        out.push_str("; Path=");
        out.push_str(&cookie.path);
    }
    if !cookie.domain.is_empty() {
        out.push_str("; Domain=");
        out.push_str(&cookie.domain);
    }
    if let Some(expires) = cookie.expires_at {
        out.push_str("; Expires=");
        out.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
    }
    if cookie.secure {
        out.push_str("; Secure");
    }
    if cookie.http_only {
        out.push_str("; HttpOnly");
    }
    out
}
