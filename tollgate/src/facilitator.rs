//! The facilitator seam.
//!
//! A facilitator verifies payment proofs and settles them on-chain on the
//! seller's behalf. The gate only ever talks to one through this trait; the
//! HTTP implementation lives in `tollgate-http`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::proto::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};

/// A boxed, sendable future, used to keep [`Facilitator`] dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport-level failure talking to a facilitator.
///
/// A facilitator that answers with a negative verdict is not an error: that is
/// [`VerifyResponse::Invalid`] or [`SettleResponse::Error`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FacilitatorError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FacilitatorError {
    /// Creates an error with a message and no underlying cause.
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

/// Verifies and settles payments.
pub trait Facilitator: Send + Sync {
    /// Checks a payment proof against a requirement without moving funds.
    fn verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>>;

    /// Captures a previously verified payment.
    fn settle<'a>(
        &'a self,
        request: &'a SettleRequest,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>>;

    /// Lists the `(scheme, network)` kinds this facilitator handles.
    fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, FacilitatorError>>;
}

impl<T: Facilitator + ?Sized> Facilitator for Arc<T> {
    fn verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>> {
        (**self).verify(request)
    }

    fn settle<'a>(
        &'a self,
        request: &'a SettleRequest,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>> {
        (**self).settle(request)
    }

    fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, FacilitatorError>> {
        (**self).supported()
    }
}
