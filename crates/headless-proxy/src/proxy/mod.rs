//! Rendering proxy.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and main run loop
//! - `handler` - HTTP adaptation, health endpoint and error envelope
//! - `pipeline` - per-request orchestration against the session pool
//! - `fetch` - script-level fetch for mutating methods
//! - `flight` - coalescing of identical concurrent renders
//! - `cookies` - cookie translation between HTTP and sessions
//! - `recovery` - crash recovery on a detached task
//! - `status` - health report
//! - `network` - listener utilities (SO_REUSEPORT)

mod cookies;
mod fetch;
mod flight;
mod handler;
mod headers;
mod network;
mod pipeline;
mod recovery;
mod request;
mod response;
mod server;
mod status;


pub use fetch::UPSTREAM_ERROR_BODY;
pub use handler::{handle_request, ProxyState};
pub use pipeline::{compose_target_url, MethodClass, RenderPipeline};
pub use recovery::{recover_session, spawn_recovery};
pub use request::{parse_cookie_header, RenderRequest, RenderResponse};
pub use response::ProxyBody;
pub use server::ProxyServer;
pub use status::{HealthReport, StatusSource, HEALTH_PATH};
