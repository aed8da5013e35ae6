//! Solana network data and fee payer discovery.
//!
//! Solana requirements need a fee payer account in `extra.feePayer`. The
//! facilitator pays transaction fees and advertises its fee payer through
//! `GET /supported`, so the gate reads it from there instead of configuring it.

use crate::error::ProtocolError;
use crate::networks::{NetworkFamily, NetworkInfo, TokenDeployment};
use crate::proto::{EXACT_SCHEME, SupportedResponse};

const PUBKEY_BYTES: usize = 32;

/// Known Solana clusters with their USDC mints.
pub static SOLANA_NETWORKS: &[NetworkInfo] = &[
    NetworkInfo {
        name: "solana",
        family: NetworkFamily::Svm,
        namespace: "solana",
        reference: "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
        usdc: TokenDeployment {
            address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            decimals: 6,
            eip712: None,
        },
    },
    NetworkInfo {
        name: "solana-devnet",
        family: NetworkFamily::Svm,
        namespace: "solana",
        reference: "EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
        usdc: TokenDeployment {
            address: "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU",
            decimals: 6,
            eip712: None,
        },
    },
];

/// Checks that `address` is a base58 Solana public key.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidAddress`] if the string is not base58 or
/// does not decode to 32 bytes.
pub fn validate_address(address: &str) -> Result<&str, ProtocolError> {
    let address = address.trim();
    let invalid = |reason: String| ProtocolError::InvalidAddress {
        address: address.to_owned(),
        reason,
    };
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| invalid(e.to_string()))?;
    if bytes.len() != PUBKEY_BYTES {
        return Err(invalid(format!(
            "decodes to {} bytes, expected {PUBKEY_BYTES}",
            bytes.len()
        )));
    }
    Ok(address)
}

impl SupportedResponse {
    /// Returns the fee payer the facilitator advertises for `network` under
    /// the `"exact"` scheme.
    #[must_use]
    pub fn fee_payer(&self, network: &str) -> Option<&str> {
        self.find_kind(EXACT_SCHEME, network)?
            .extra
            .as_ref()?
            .get("feePayer")?
            .as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v").is_ok());
        assert!(validate_address("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913").is_err());
        assert!(validate_address("short").is_err());
        assert!(validate_address("").is_err());
    }

    #[test]
    fn test_rejects_base58_that_is_not_a_32_byte_key() {
        let zeros = "1".repeat(44);
        let err = validate_address(&zeros).unwrap_err();
        assert!(err.to_string().contains("44 bytes"));
    }

    #[test]
    fn test_fee_payer_lookup() {
        let supported: SupportedResponse = serde_json::from_value(json!({
            "kinds": [
                { "x402Version": 1, "scheme": "exact", "network": "base" },
                { "x402Version": 1, "scheme": "exact", "network": "solana-devnet",
                  "extra": { "feePayer": "2wKupLR9q6wXYppw8Gr2NvWxKBUqm4PPJKkQfoxHDBg4" } }
            ]
        }))
        .unwrap();
        assert_eq!(
            supported.fee_payer("solana-devnet"),
            Some("2wKupLR9q6wXYppw8Gr2NvWxKBUqm4PPJKkQfoxHDBg4")
        );
        assert_eq!(supported.fee_payer("solana"), None);
        assert_eq!(supported.fee_payer("base"), None);
    }
}
