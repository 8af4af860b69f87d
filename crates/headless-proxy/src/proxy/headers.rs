//! Safe header insertion helpers.
//!
//! Static header names and values for the proxy's own headers, so call sites
//! never parse constant strings at runtime.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::Response;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub static X_ERROR_TYPE: HeaderName = HeaderName::from_static("x-error-type");
pub static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

pub static VALUE_HIT: HeaderValue = HeaderValue::from_static("HIT");
pub static VALUE_HTML: HeaderValue = HeaderValue::from_static("text/html; charset=utf-8");
pub static VALUE_JSON: HeaderValue = HeaderValue::from_static("application/json");
pub static VALUE_TEXT: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");

/// Extension trait for inserting proxy headers.
pub trait ProxyHeadersExt {
    /// Insert a header with a static name and value.
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Insert a header with a static name and dynamic string value.
    /// Returns false if the value couldn't be converted to a valid header value.
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool;
}

impl ProxyHeadersExt for HeaderMap {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.insert(name.clone(), value.clone());
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                self.insert(name.clone(), header_value);
                true
            }
            Err(_) => false,
        }
    }
}

impl<B> ProxyHeadersExt for Response<B> {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers_mut().set_header(name, value);
    }

    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        self.headers_mut().set_header_value(name, value)
    }
}

/// Append a header whose name and value both come from untrusted text.
/// Invalid pairs are skipped.
pub fn append_raw(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::CONTENT_TYPE;

    #[test]
    fn test_set_header_on_map() {
        let mut headers = HeaderMap::new();
        headers.set_header(&X_CACHE, &VALUE_HIT);
        assert_eq!(headers.get("x-cache").unwrap(), "HIT");
    }

    #[test]
    fn test_set_header_value_rejects_invalid() {
        let mut response = Response::new(());
        assert!(response.set_header_value(&X_REQUEST_ID, "abc-123"));
        assert!(!response.set_header_value(&X_ERROR_TYPE, "bad\nvalue"));
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
        assert!(response.headers().get("x-error-type").is_none());
    }

    #[test]
    fn test_append_raw() {
        let mut headers = HeaderMap::new();
        assert!(append_raw(&mut headers, "Set-Cookie", "a=1"));
        assert!(append_raw(&mut headers, "set-cookie", "b=2"));
        assert!(!append_raw(&mut headers, "bad header", "x"));
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);

        headers.set_header(&CONTENT_TYPE, &VALUE_HTML);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html; charset=utf-8");
    }
}
