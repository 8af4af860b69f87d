// Library exports for the binary, benchmarks and tests

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod optimizer;
pub mod pool;
pub mod proxy;
pub mod session;

pub use config::Config;
pub use error::{ErrorKind, ProxyError};
pub use proxy::ProxyServer;
