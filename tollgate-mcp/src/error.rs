//! Error types for the hook pipeline.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure raised by a hook callback.
///
/// What the pipeline does with it depends on the phase: a request-phase error
/// fails the call with a JSON-RPC internal error, a response-phase error skips
/// the hook, a header-phase error is logged and ignored.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl HookError {
    /// Creates an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failures of the pipeline itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The upstream MCP server could not be reached or did not answer.
    #[error("{context}: {source}")]
    Upstream {
        /// What the pipeline was doing.
        context: &'static str,
        /// The transport error.
        #[source]
        source: BoxError,
    },
    /// A request rewritten by a hook could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wraps a transport error from an [`Upstream`](crate::engine::Upstream) implementation.
    pub fn upstream(
        context: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Upstream {
            context,
            source: Box::new(source),
        }
    }
}
