//! Error types shared by the payment gate crates.

/// Errors produced while turning a configured price into an on-chain amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The price string is not a decimal number.
    #[error("Invalid price format: {0}")]
    InvalidFormat(String),
    /// The price is negative.
    #[error("Price must be non-negative")]
    Negative,
    /// The price has more fractional digits than the asset supports.
    #[error("Price {price} has more than {decimals} decimal places")]
    TooPrecise {
        /// The offending price.
        price: String,
        /// Decimals supported by the asset.
        decimals: u32,
    },
    /// The atomic amount does not fit in 128 bits.
    #[error("Price {0} overflows the atomic amount range")]
    Overflow(String),
}

/// Errors produced while decoding or encoding x402 wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payment token is not valid base64 JSON or an inline object.
    #[error("Invalid payment token: {0}")]
    InvalidToken(String),
    /// The network name is not in the registry.
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    /// An address failed validation for its network family.
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress {
        /// The address as configured.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
    /// JSON (de)serialization failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    /// Price conversion failed.
    #[error(transparent)]
    Amount(#[from] AmountError),
}
