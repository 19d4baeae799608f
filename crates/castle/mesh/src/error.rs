//! Error types for castle-mesh.
//!
//! Transport errors never escape the owning task: the session retries with
//! backoff and reports itself offline through the event stream instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// The bus client rejected a request.
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The broker connection dropped or could not be established.
    #[error("bus connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// mDNS daemon failure.
    #[error("discovery error: {0}")]
    Discovery(#[from] mdns_sd::Error),

    /// A message on a mesh topic could not be decoded.
    #[error("invalid payload on {topic}: {reason}")]
    Payload { topic: String, reason: String },

    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type MeshResult<T> = Result<T, MeshError>;
