//! EVM network data and address helpers.

use std::str::FromStr;

use alloy_primitives::Address;
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::networks::{Eip712Domain, NetworkFamily, NetworkInfo, TokenDeployment};

/// Default EIP-712 domain version for USDC.
pub const DEFAULT_USDC_VERSION: &str = "2";

/// Default token decimals for USDC.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 6;

const fn usdc(address: &'static str, name: &'static str) -> TokenDeployment {
    TokenDeployment {
        address,
        decimals: DEFAULT_TOKEN_DECIMALS,
        eip712: Some(Eip712Domain {
            name,
            version: DEFAULT_USDC_VERSION,
        }),
    }
}

const fn eip155(name: &'static str, reference: &'static str, usdc: TokenDeployment) -> NetworkInfo {
    NetworkInfo {
        name,
        family: NetworkFamily::Evm,
        namespace: "eip155",
        reference,
        usdc,
    }
}

/// Known EVM networks with their USDC deployments.
pub static EVM_NETWORKS: &[NetworkInfo] = &[
    eip155(
        "base",
        "8453",
        usdc("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", "USD Coin"),
    ),
    eip155(
        "base-sepolia",
        "84532",
        usdc("0x036CbD53842c5426634e7929541eC2318f3dCF7e", "USDC"),
    ),
    eip155(
        "avalanche",
        "43114",
        usdc("0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E", "USD Coin"),
    ),
    eip155(
        "avalanche-fuji",
        "43113",
        usdc("0x5425890298aed601595a70AB815c96711a31Bc65", "USD Coin"),
    ),
    eip155(
        "polygon",
        "137",
        usdc("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", "USD Coin"),
    ),
    eip155(
        "polygon-amoy",
        "80002",
        usdc("0x41E94Eb71Ef8C9fAE0235d1e472b21E21B5a4dbF", "USDC"),
    ),
    eip155(
        "sei",
        "1329",
        usdc("0xe15fC38F6D8c56aF07bbCBe3BAf5708A2Bf42392", "USDC"),
    ),
    eip155(
        "sei-testnet",
        "1328",
        usdc("0x4fCF1784B31630811181f670Aea7A7bEF803eaED", "USDC"),
    ),
    eip155(
        "iotex",
        "4689",
        usdc("0xcdf79194c6c285077a58da47641d4dbe51f63542", "Bridged USDC"),
    ),
];

/// Returns the EIP-55 checksummed form of an EVM address.
///
/// Accepts lower, upper or mixed case input, with or without the `0x` prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidAddress`] if the input is not 20 hex bytes.
pub fn checksum_address(address: &str) -> Result<String, ProtocolError> {
    Address::from_str(address.trim())
        .map(|parsed| parsed.to_checksum(None))
        .map_err(|e| ProtocolError::InvalidAddress {
            address: address.to_owned(),
            reason: e.to_string(),
        })
}

/// The `extra` object carried by EVM requirements: the token's EIP-712 domain.
#[must_use]
pub fn eip712_extra(domain: &Eip712Domain) -> Value {
    json!({ "name": domain.name, "version": domain.version })
}
