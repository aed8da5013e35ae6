//! Startup errors of the proxy.

use tollgate::ProtocolError;
use tollgate_http::FacilitatorClientError;

use crate::config::ConfigError;

/// Anything that stops the proxy from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The facilitator client could not be built.
    #[error("Facilitator client: {0}")]
    Facilitator(#[from] FacilitatorClientError),
    /// The payment gate rejected its configuration.
    #[error("Payment gate: {0}")]
    Gate(#[from] ProtocolError),
    /// A `forward_headers` entry is not a valid HTTP header.
    #[error("Invalid forward header {name}: {reason}")]
    InvalidHeader {
        /// Header name as configured.
        name: String,
        /// Parse error.
        reason: String,
    },
    /// Binding or serving failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
