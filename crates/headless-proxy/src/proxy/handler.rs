//! HTTP front of the render pipeline.
//!
//! Adapts hyper requests into [`RenderRequest`]s, serves the health report,
//! turns pipeline failures into the JSON error envelope and records the
//! per-request metrics.

use super::headers::X_REQUEST_ID;
use super::pipeline::RenderPipeline;
use super::request::RenderRequest;
use super::response::{from_error, from_render, full_response, json_response, ProxyBody, ResponseExt};
use super::status::{StatusSource, HEALTH_PATH};
use crate::metrics::Metrics;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// State shared by every connection.
pub struct ProxyState {
    pub pipeline: RenderPipeline,
    pub status: StatusSource,
    pub metrics: Arc<Metrics>,
}

/// Use the caller's `X-Request-ID` when present, otherwise mint one.
pub fn request_id_for<B>(req: &Request<B>) -> String {
    req.headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub async fn handle_request<B>(
    state: &ProxyState,
    req: Request<B>,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let start_time = Instant::now();
    let request_id = request_id_for(&req);
    let method = req.method().clone();

    if req.uri().path() == HEALTH_PATH && method == Method::GET {
        let report = state.status.report();
        let json = serde_json::to_string(&report).unwrap_or_default();
        return Ok(json_response(report.http_status(), json).into_boxed());
    }

    let (parts, body) = req.into_parts();
    let limit = state.pipeline.settings().max_body_bytes;
    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let (status, message) = if e.downcast_ref::<LengthLimitError>().is_some() {
                warn!(request_id = %request_id, limit, "Request body exceeds limit");
                (413, "Request body too large")
            } else {
                warn!(request_id = %request_id, "Failed to read request body: {}", e);
                (400, "Failed to read request body")
            };
            state
                .metrics
                .record_request(method.as_str(), status, start_time.elapsed(), 0, 0);
            return Ok(full_response(status, message).into_boxed());
        }
    };
    let request_size = body.len();
    let render_req = RenderRequest::from_parts(&parts, body, request_id.clone());
    debug!(request_id = %request_id, method = %method, path = %render_req.path, "Received request");

    let response = match state.pipeline.handle(&render_req).await {
        Ok(render) => from_render(render, &request_id),
        Err(err) => from_error(&err, &request_id),
    };

    let status = response.status().as_u16();
    let response_size = response.body().size_hint().exact().unwrap_or(0) as usize;
    state.metrics.record_request(
        method.as_str(),
        status,
        start_time.elapsed(),
        request_size,
        response_size,
    );
    Ok(response.into_boxed())
}
