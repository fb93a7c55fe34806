use thiserror::Error;

/// Errors surfaced by the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway connection closed")]
    ConnectionClosed,

    #[error("gateway connection error: {0}")]
    Connection(String),

    #[error("gateway rejected credentials: {0}")]
    Authentication(String),

    #[error("gateway request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("gateway request failed: {code}: {message}")]
    Request { code: String, message: String },

    #[error("gateway is not connected (degraded mode)")]
    Degraded,

    #[error("failed to encode gateway frame: {0}")]
    Encode(#[from] serde_json::Error),
}
