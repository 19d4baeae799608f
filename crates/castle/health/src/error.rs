//! Probe failures.
//!
//! A failed probe is recorded as `down` with the error message attached; it
//! is never returned to callers of the monitor.

use thiserror::Error;

/// Why a health probe did not report the entry as up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No response within the probe timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The endpoint answered with a non-2xx status.
    #[error("unhealthy status {status}")]
    Status { status: u16 },

    /// Connection refused, DNS failure and similar transport errors.
    #[error("request failed: {0}")]
    Request(String),
}
