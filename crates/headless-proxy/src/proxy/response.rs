//! Conversions from pipeline results to HTTP responses.

use super::headers::{ProxyHeadersExt, VALUE_JSON, X_ERROR_TYPE, X_REQUEST_ID};
use super::request::RenderResponse;
use crate::error::{ErrorBody, ProxyError};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::convert::Infallible;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub trait ResponseExt {
    /// Wrap a `Full` body into the boxed body the server speaks.
    fn into_boxed(self) -> Response<ProxyBody>;
}

impl ResponseExt for Response<Full<Bytes>> {
    fn into_boxed(self) -> Response<ProxyBody> {
        self.map(|b| BoxBody::new(b.map_err(|never: Infallible| match never {})))
    }
}

/// Build a response with the given status; unknown codes become 502.
pub fn full_response(status: u16, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    response
}

pub fn json_response(status: u16, json: String) -> Response<Full<Bytes>> {
    let mut response = full_response(status, json);
    response.set_header(&CONTENT_TYPE, &VALUE_JSON);
    response
}

/// Convert a pipeline response, echoing the request id.
pub fn from_render(render: RenderResponse, request_id: &str) -> Response<Full<Bytes>> {
    let mut response = full_response(render.status, render.body);
    *response.headers_mut() = render.headers;
    response.set_header_value(&X_REQUEST_ID, request_id);
    response
}

/// JSON error envelope with the error kind in `X-Error-Type`.
pub fn from_error(err: &ProxyError, request_id: &str) -> Response<Full<Bytes>> {
    let body = ErrorBody::new(err, request_id);
    let mut response = json_response(err.status(), body.to_json());
    response.set_header_value(&X_REQUEST_ID, request_id);
    response.set_header_value(&X_ERROR_TYPE, err.kind.as_str());
    response
}
