//! Inbound and outbound values of the render pipeline.

use bytes::Bytes;
use hyper::header::{HeaderMap, COOKIE};
use hyper::http::request::Parts;
use hyper::Method;

/// One inbound request, detached from the HTTP server types.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Cookies from the `Cookie` header, in header order.
    pub cookies: Vec<(String, String)>,
    pub body: Bytes,
    pub request_id: String,
}

impl RenderRequest {
    /// Request for `path_and_query` with no headers or body.
    pub fn new(method: Method, path_and_query: &str, request_id: impl Into<String>) -> Self {
        let (path, query) = split_path_and_query(path_and_query);
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            request_id: request_id.into(),
        }
    }

    pub fn from_parts(parts: &Parts, body: Bytes, request_id: impl Into<String>) -> Self {
        let (path, query) = match parts.uri.path_and_query() {
            Some(pq) => (
                pq.path().to_string(),
                pq.query().map(str::to_string).filter(|q| !q.is_empty()),
            ),
            None => ("/".to_string(), None),
        };
        Self {
            method: parts.method.clone(),
            path,
            query,
            cookies: parse_cookie_header(&parts.headers),
            headers: parts.headers.clone(),
            body,
            request_id: request_id.into(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.append(name, value);
            if name.eq_ignore_ascii_case("cookie") {
                self.cookies = parse_cookie_header(&self.headers);
            }
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path plus `?query` when a query is present.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

fn split_path_and_query(path_and_query: &str) -> (String, Option<String>) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            Some(query.to_string()).filter(|q| !q.is_empty()),
        ),
        None => (path_and_query.to_string(), None),
    }
}

/// Parse every `Cookie` header into `(name, value)` pairs.
pub fn parse_cookie_header(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Result of a handled request.
#[derive(Debug, Clone)]
pub struct RenderResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub from_cache: bool,
}

impl RenderResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            from_cache: false,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
