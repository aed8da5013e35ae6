//! Base64 codec for payment tokens and settlement headers.

use std::fmt::{self, Display, Formatter};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::proto::SettleResponse;

/// Base64 text held as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    /// Decodes the base64 text to raw binary data.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(self.0.trim_ascii())
    }

    /// Encodes raw binary data into base64 text.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Self {
        Self(b64.encode(input.as_ref()).into_bytes())
    }
}

impl AsRef<[u8]> for Base64Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Base64Bytes {
    fn from(slice: &[u8]) -> Self {
        Self(slice.to_vec())
    }
}

impl From<&str> for Base64Bytes {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Display for Base64Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Decodes a payment token into `T`.
///
/// The token is either a base64 string wrapping a JSON document, or an
/// already-decoded JSON object supplied inline.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidToken`] if the value is neither shape or the
/// JSON does not describe a `T`.
pub fn decode_payment_token<T: DeserializeOwned>(token: &Value) -> Result<T, ProtocolError> {
    match token {
        Value::String(encoded) => {
            let bytes = Base64Bytes::from(encoded.as_str())
                .decode()
                .map_err(|e| ProtocolError::InvalidToken(format!("base64: {e}")))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| ProtocolError::InvalidToken(format!("json: {e}")))
        }
        Value::Object(_) => serde_json::from_value(token.clone())
            .map_err(|e| ProtocolError::InvalidToken(format!("json: {e}"))),
        _ => Err(ProtocolError::InvalidToken(
            "expected a base64 string or a JSON object".to_owned(),
        )),
    }
}

/// Serializes `value` to JSON and base64-encodes it, as used by the
/// `X-PAYMENT` and `X-PAYMENT-RESPONSE` headers.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if `value` cannot be serialized.
pub fn encode_json_token<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64Bytes::encode(json).to_string())
}

/// Encodes a settlement outcome as an `X-PAYMENT-RESPONSE` header value.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the response cannot be serialized.
pub fn encode_settle_header(response: &SettleResponse) -> Result<String, ProtocolError> {
    encode_json_token(response)
}
