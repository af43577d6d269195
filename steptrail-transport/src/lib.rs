//! # steptrail-transport
//!
//! Transport implementations for the steptrail tracing library.

#![warn(missing_docs)]

// Re-export core types for convenience
pub use steptrail_core::error::{Error, Result};
pub use steptrail_core::meta::{PipelineMeta, RunStatus, StepMeta};
pub use steptrail_core::transport::Transport;

pub mod http;
pub mod mock;

pub use http::{HttpTransport, HttpTransportOptions};
pub use mock::MockTransport;

/// HTTP client configuration
#[derive(Clone)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Connection pool idle timeout
    pub pool_idle_timeout_secs: u64,
    /// Max idle connections per host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 8,
        }
    }
}

impl HttpConfig {
    /// Build a reqwest client
    pub fn build_client(&self) -> Result<reqwest::Client> {
        use std::time::Duration;

        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()
            .map_err(Error::from)
    }
}
