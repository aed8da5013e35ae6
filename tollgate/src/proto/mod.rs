//! Wire format types for x402 payment messages.
//!
//! These are the shapes exchanged between the payment gate, the paying client
//! and the remote facilitator. Requirements and payloads use human-readable
//! network names (e.g. `"base"`, `"solana-devnet"`) and serialize with
//! camelCase field names.
//!
//! # Key Types
//!
//! - [`PaymentRequirements`] - One accepted `(network, recipient, asset)` option
//! - [`PaymentPayload`] - The client-submitted payment proof
//! - [`PaymentRequired`] - The structured body describing why payment is needed
//! - [`VerifyRequest`] / [`VerifyResponse`] - Facilitator verification messages
//! - [`SettleRequest`] / [`SettleResponse`] - Facilitator settlement messages
//! - [`SupportedResponse`] - Facilitator capability list from `GET /supported`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use serde_with::{VecSkipError, serde_as};

mod encoding;

pub use encoding::{Base64Bytes, decode_payment_token, encode_json_token, encode_settle_header};

/// The x402 protocol version spoken by default.
pub const X402_VERSION: u8 = 1;

/// The only payment scheme the gate builds requirements for.
pub const EXACT_SCHEME: &str = "exact";

/// One acceptable way of paying for a resource.
///
/// # JSON Format
///
/// ```json
/// {
///   "scheme": "exact",
///   "network": "base",
///   "maxAmountRequired": "20000",
///   "resource": "mcp://search",
///   "description": "Payment for MCP tool search",
///   "mimeType": "application/json",
///   "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
///   "maxTimeoutSeconds": 300,
///   "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
///   "extra": { "name": "USD Coin", "version": "2" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme identifier (always `"exact"` here).
    pub scheme: String,
    /// Network name (e.g. `"base"`).
    pub network: String,
    /// Maximum amount in the asset's smallest unit, as a decimal string.
    pub max_amount_required: String,
    /// URI of the paid resource (`mcp://{toolName}` for tool calls).
    pub resource: String,
    /// Human-readable description of what is being paid for.
    pub description: String,
    /// MIME type of the resource response.
    pub mime_type: String,
    /// Recipient address.
    pub pay_to: String,
    /// Maximum time in seconds the payment authorization may stay valid.
    pub max_timeout_seconds: u64,
    /// Asset address (ERC-20 contract or SPL mint).
    pub asset: String,
    /// Network-specific extras (EIP-712 domain, Solana fee payer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    /// Optional schema describing the resource output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// A client-submitted payment proof, decoded from the opaque payment token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version claimed by the client. Kept wide so any claimed
    /// number decodes and can be normalized.
    pub x402_version: u32,
    /// Payment scheme the proof was built for.
    pub scheme: String,
    /// Network the proof was built for.
    pub network: String,
    /// Scheme-specific signed authorization.
    pub payload: Value,
}

impl PaymentPayload {
    /// Rewrites the protocol version to `version`.
    ///
    /// Returns `true` if the payload claimed a different version.
    pub fn normalize_version(&mut self, version: u8) -> bool {
        let version = u32::from(version);
        let changed = self.x402_version != version;
        self.x402_version = version;
        changed
    }

    /// Returns `true` if the payload was built for the given requirement.
    #[must_use]
    pub fn matches(&self, requirements: &PaymentRequirements) -> bool {
        self.scheme == requirements.scheme && self.network == requirements.network
    }
}

/// The structured body explaining why a call was not served.
///
/// Carried in `_meta["x402/error"]` of an MCP tool result and as the body of
/// a literal HTTP 402 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version of the gate.
    pub x402_version: u8,
    /// Machine-readable error code or facilitator reason.
    pub error: String,
    /// Acceptable payment options.
    pub accepts: Vec<PaymentRequirements>,
    /// Payer address, when the facilitator identified one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Additional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Request body for `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Protocol version.
    pub x402_version: u8,
    /// The (version-normalized) payment proof.
    pub payment_payload: PaymentPayload,
    /// The requirement the proof is checked against.
    pub payment_requirements: PaymentRequirements,
}

/// Request body for `POST /settle`.
///
/// Same wire shape as [`VerifyRequest`], kept distinct so a verify request is
/// never sent where a settle was intended by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    /// Protocol version.
    pub x402_version: u8,
    /// The payment proof to settle.
    pub payment_payload: PaymentPayload,
    /// The requirement the proof was verified against.
    pub payment_requirements: PaymentRequirements,
}

impl From<VerifyRequest> for SettleRequest {
    fn from(request: VerifyRequest) -> Self {
        Self {
            x402_version: request.x402_version,
            payment_payload: request.payment_payload,
            payment_requirements: request.payment_requirements,
        }
    }
}

/// Result of `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    /// The proof is valid for the requirement.
    Valid {
        /// The payer address, if reported.
        payer: Option<String>,
    },
    /// The proof was rejected.
    Invalid {
        /// Machine-readable reason, passed through verbatim to the client.
        reason: String,
        /// The payer address, if identifiable.
        payer: Option<String>,
    },
}

impl VerifyResponse {
    /// Returns `true` if the proof was accepted.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Returns the payer address, whichever the outcome.
    #[must_use]
    pub fn payer(&self) -> Option<&str> {
        match self {
            Self::Valid { payer } | Self::Invalid { payer, .. } => payer.as_deref(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                invalid_reason: None,
                payer: payer.clone(),
            },
            Self::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                invalid_reason: Some(reason.clone()),
                payer: payer.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            Ok(Self::Valid { payer: wire.payer })
        } else {
            Ok(Self::Invalid {
                reason: wire
                    .invalid_reason
                    .unwrap_or_else(|| "invalid_payment".to_owned()),
                payer: wire.payer,
            })
        }
    }
}

/// Result of `POST /settle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResponse {
    /// The payment was captured on-chain.
    Success {
        /// Transaction hash or signature.
        transaction: String,
        /// Network the transaction landed on.
        network: Option<String>,
        /// The payer address.
        payer: Option<String>,
    },
    /// The payment could not be captured.
    Error {
        /// Machine-readable failure reason.
        reason: String,
        /// Transaction hash, when one was broadcast before failing.
        transaction: Option<String>,
        /// Network settlement was attempted on.
        network: Option<String>,
        /// The payer address.
        payer: Option<String>,
    },
}

impl SettleResponse {
    /// Returns `true` if the settlement succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the failure reason of an unsuccessful settlement.
    #[must_use]
    pub fn error_reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { reason, .. } => Some(reason),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
}

impl Serialize for SettleResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Success {
                transaction,
                network,
                payer,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                transaction: Some(transaction.clone()),
                network: network.clone(),
                payer: payer.clone(),
            },
            Self::Error {
                reason,
                transaction,
                network,
                payer,
            } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                transaction: transaction.clone(),
                network: network.clone(),
                payer: payer.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        if wire.success {
            let transaction = wire
                .transaction
                .ok_or_else(|| serde::de::Error::missing_field("transaction"))?;
            Ok(Self::Success {
                transaction,
                network: wire.network,
                payer: wire.payer,
            })
        } else {
            Ok(Self::Error {
                reason: wire
                    .error_reason
                    .unwrap_or_else(|| "unexpected_settle_error".to_owned()),
                transaction: wire.transaction,
                network: wire.network,
                payer: wire.payer,
            })
        }
    }
}

/// A payment kind a facilitator can verify and settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    /// Protocol version of the kind.
    #[serde(default = "default_version")]
    pub x402_version: u8,
    /// Payment scheme (e.g. `"exact"`).
    pub scheme: String,
    /// Network name.
    pub network: String,
    /// Scheme-specific data (e.g. `{"feePayer": "..."}` for Solana).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Response of `GET /supported`.
///
/// Malformed kinds are dropped on deserialization instead of failing the
/// whole list.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// Supported payment kinds.
    #[serde_as(as = "VecSkipError<_>")]
    #[serde(default)]
    pub kinds: Vec<SupportedPaymentKind>,
}

impl SupportedResponse {
    /// Finds the kind advertised for `scheme` on `network`.
    #[must_use]
    pub fn find_kind(&self, scheme: &str, network: &str) -> Option<&SupportedPaymentKind> {
        self.kinds
            .iter()
            .find(|kind| kind.scheme == scheme && kind.network == network)
    }
}

const fn default_version() -> u8 {
    X402_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requirements_wire_is_camel_case() {
        let requirements = PaymentRequirements {
            scheme: EXACT_SCHEME.to_owned(),
            network: "base".to_owned(),
            max_amount_required: "10000".to_owned(),
            resource: "mcp://search".to_owned(),
            description: "search".to_owned(),
            mime_type: "application/json".to_owned(),
            pay_to: "0xabc".to_owned(),
            max_timeout_seconds: 300,
            asset: "0xdef".to_owned(),
            extra: None,
            output_schema: None,
        };
        let value = serde_json::to_value(&requirements).unwrap();
        assert_eq!(value["maxAmountRequired"], "10000");
        assert_eq!(value["payTo"], "0xabc");
        assert_eq!(value["maxTimeoutSeconds"], 300);
        assert!(value.get("extra").is_none());
    }

    #[test]
    fn test_normalize_version_reports_change() {
        let mut payload = PaymentPayload {
            x402_version: 2,
            scheme: "exact".to_owned(),
            network: "base".to_owned(),
            payload: json!({}),
        };
        assert!(payload.normalize_version(1));
        assert_eq!(payload.x402_version, 1);
        assert!(!payload.normalize_version(1));
    }

    #[test]
    fn test_payload_with_large_version_decodes() {
        let payload: PaymentPayload = serde_json::from_value(json!({
            "x402Version": 300,
            "scheme": "exact",
            "network": "base",
            "payload": {}
        }))
        .unwrap();
        assert_eq!(payload.x402_version, 300);
    }

    #[test]
    fn test_verify_response_invalid_keeps_reason_and_payer() {
        let response: VerifyResponse = serde_json::from_value(json!({
            "isValid": false,
            "invalidReason": "insufficient_funds",
            "payer": "0xpayer"
        }))
        .unwrap();
        assert_eq!(
            response,
            VerifyResponse::Invalid {
                reason: "insufficient_funds".to_owned(),
                payer: Some("0xpayer".to_owned()),
            }
        );
        assert_eq!(response.payer(), Some("0xpayer"));
    }

    #[test]
    fn test_settle_response_success_requires_transaction() {
        let result: Result<SettleResponse, _> =
            serde_json::from_value(json!({ "success": true, "network": "base" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_settle_response_error_wire() {
        let response = SettleResponse::Error {
            reason: "invalid_transaction_state".to_owned(),
            transaction: None,
            network: Some("base".to_owned()),
            payer: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["errorReason"], "invalid_transaction_state");
        assert!(value.get("transaction").is_none());
    }

    #[test]
    fn test_supported_skips_malformed_kinds() {
        let supported: SupportedResponse = serde_json::from_value(json!({
            "kinds": [
                { "x402Version": 1, "scheme": "exact", "network": "base" },
                { "scheme": 42 },
                { "x402Version": 1, "scheme": "exact", "network": "solana-devnet",
                  "extra": { "feePayer": "FeePayer111" } }
            ]
        }))
        .unwrap();
        assert_eq!(supported.kinds.len(), 2);
        assert!(supported.find_kind("exact", "solana-devnet").is_some());
        assert!(supported.find_kind("exact", "polygon").is_none());
    }
}
