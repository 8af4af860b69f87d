//! Error taxonomy for the request pipeline.
//!
//! Every failure a caller can observe is one of the [`ErrorKind`]s below. Engine
//! failures are classified by the pipeline stage they happened in, with a few
//! engine conditions (deadline, crash, dropped target, network) overriding the
//! stage default.

use crate::pool::PoolError;
use crate::session::EngineError;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Closed set of failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BrowserUnavailable,
    PageCreationFailed,
    NavigationFailed,
    Timeout,
    RequestFailed,
    #[serde(rename = "response_processing")]
    ResponseProcessingFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BrowserUnavailable => "browser_unavailable",
            ErrorKind::PageCreationFailed => "page_creation_failed",
            ErrorKind::NavigationFailed => "navigation_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RequestFailed => "request_failed",
            ErrorKind::ResponseProcessingFailed => "response_processing",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status returned for this kind.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::BrowserUnavailable => 503,
            ErrorKind::PageCreationFailed
            | ErrorKind::NavigationFailed
            | ErrorKind::RequestFailed
            | ErrorKind::ResponseProcessingFailed => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage an engine failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenPage,
    Configure,
    Navigate,
    Fetch,
    Extract,
}

impl Stage {
    fn default_kind(self) -> ErrorKind {
        match self {
            Stage::OpenPage | Stage::Configure => ErrorKind::PageCreationFailed,
            Stage::Navigate => ErrorKind::NavigationFailed,
            Stage::Fetch => ErrorKind::RequestFailed,
            Stage::Extract => ErrorKind::ResponseProcessingFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    /// The session died while serving the request and must not be pooled again.
    pub crashed: bool,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            crashed: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("request timed out after {}s", after.as_secs_f64()),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Classify an engine failure raised during `stage`.
    pub fn from_engine(stage: Stage, err: &EngineError) -> Self {
        let (kind, crashed) = match err {
            EngineError::Timeout(_) => (ErrorKind::Timeout, false),
            EngineError::Crashed => (ErrorKind::NavigationFailed, true),
            EngineError::Closed => (stage.default_kind(), true),
            EngineError::TargetClosed | EngineError::Network(_) => {
                (ErrorKind::NavigationFailed, false)
            }
            _ => (stage.default_kind(), false),
        };
        Self {
            kind,
            message: err.to_string(),
            crashed,
        }
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        Self::new(ErrorKind::BrowserUnavailable, err.to_string())
    }
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub status: u16,
    pub description: String,
    pub request_id: String,
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(err: &ProxyError, request_id: &str) -> Self {
        Self {
            error: err.kind,
            status: err.status(),
            description: err.message.clone(),
            request_id: request_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","status":{}}}"#,
                self.error.as_str(),
                self.status
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::BrowserUnavailable.status(), 503);
        assert_eq!(ErrorKind::PageCreationFailed.status(), 502);
        assert_eq!(ErrorKind::NavigationFailed.status(), 502);
        assert_eq!(ErrorKind::Timeout.status(), 504);
        assert_eq!(ErrorKind::RequestFailed.status(), 502);
        assert_eq!(ErrorKind::ResponseProcessingFailed.status(), 502);
        assert_eq!(ErrorKind::Internal.status(), 500);
    }

    #[test]
    fn test_stage_defaults() {
        let err = EngineError::Protocol("boom".into());
        assert_eq!(
            ProxyError::from_engine(Stage::OpenPage, &err).kind,
            ErrorKind::PageCreationFailed
        );
        assert_eq!(
            ProxyError::from_engine(Stage::Navigate, &err).kind,
            ErrorKind::NavigationFailed
        );
        assert_eq!(
            ProxyError::from_engine(Stage::Fetch, &err).kind,
            ErrorKind::RequestFailed
        );
        assert_eq!(
            ProxyError::from_engine(Stage::Extract, &err).kind,
            ErrorKind::ResponseProcessingFailed
        );
    }

    #[test]
    fn test_engine_overrides() {
        let timeout = ProxyError::from_engine(Stage::Extract, &EngineError::Timeout("x".into()));
        assert_eq!(timeout.kind, ErrorKind::Timeout);

        let crashed = ProxyError::from_engine(Stage::Extract, &EngineError::Crashed);
        assert_eq!(crashed.kind, ErrorKind::NavigationFailed);
        assert!(crashed.crashed);

        let closed = ProxyError::from_engine(Stage::Fetch, &EngineError::TargetClosed);
        assert_eq!(closed.kind, ErrorKind::NavigationFailed);
        assert!(!closed.crashed);

        let net = ProxyError::from_engine(
            Stage::Fetch,
            &EngineError::Network("net::ERR_NAME_NOT_RESOLVED".into()),
        );
        assert_eq!(net.kind, ErrorKind::NavigationFailed);
    }

    #[test]
    fn test_pool_error_is_browser_unavailable() {
        let err: ProxyError = PoolError::ShutDown.into();
        assert_eq!(err.kind, ErrorKind::BrowserUnavailable);
        assert_eq!(err.status(), 503);
    }

    #[test]
    fn test_error_body_json() {
        let err = ProxyError::new(ErrorKind::NavigationFailed, "net::ERR_FAILED");
        let body = ErrorBody::new(&err, "req-1");
        let json: serde_json::Value = serde_json::from_str(&body.to_json()).unwrap();

        assert_eq!(json["error"], "navigation_failed");
        assert_eq!(json["status"], 502);
        assert_eq!(json["description"], "net::ERR_FAILED");
        assert_eq!(json["request_id"], "req-1");
        assert!(chrono::DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_response_processing_wire_name() {
        let json = serde_json::to_value(ErrorKind::ResponseProcessingFailed).unwrap();
        assert_eq!(json, "response_processing");
    }
}
