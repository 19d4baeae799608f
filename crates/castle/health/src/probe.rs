//! Health probes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::ProbeError;

/// A single liveness check against a health URL.
///
/// The monitor bounds every call with its own timeout, so implementations
/// need not enforce one.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: &str) -> Result<(), ProbeError>;
}

/// Plain HTTP GET; any 2xx response is up.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    #[instrument(skip(self), fields(probe = "http"))]
    async fn check(&self, url: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    ProbeError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(status = status.as_u16(), "Probe answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status {
                status: status.as_u16(),
            })
        }
    }
}
