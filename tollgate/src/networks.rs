//! Known networks and their USDC deployments.
//!
//! Payment requirements name networks by their human-readable x402 name
//! (e.g. `"base"`). The registry maps those names to the chain family, the
//! CAIP-2 identifier and the USDC deployment used to price calls.
//!
//! Concrete network data lives next to the family-specific helpers:
//!
//! - [`EVM_NETWORKS`](crate::evm::EVM_NETWORKS) for EIP-155 chains
//! - [`SOLANA_NETWORKS`](crate::svm::SOLANA_NETWORKS) for Solana clusters

use std::collections::HashMap;
use std::fmt;

use crate::error::ProtocolError;
use crate::evm::EVM_NETWORKS;
use crate::svm::SOLANA_NETWORKS;

/// Address and signing conventions a network follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFamily {
    /// EIP-155 chains paying with EIP-3009 `transferWithAuthorization`.
    Evm,
    /// Solana clusters paying with a partially signed SPL transfer.
    Svm,
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm => f.write_str("evm"),
            Self::Svm => f.write_str("svm"),
        }
    }
}

/// EIP-712 domain of an ERC-3009 token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eip712Domain {
    /// Domain name (e.g. `"USD Coin"`).
    pub name: &'static str,
    /// Domain version (e.g. `"2"`).
    pub version: &'static str,
}

/// The token a network is priced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenDeployment {
    /// Contract address or SPL mint.
    pub address: &'static str,
    /// Number of decimals of the token.
    pub decimals: u32,
    /// EIP-712 domain, for EVM tokens only.
    pub eip712: Option<Eip712Domain>,
}

/// A known network definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// x402 network name (e.g. `"base-sepolia"`, `"solana"`).
    pub name: &'static str,
    /// Chain family.
    pub family: NetworkFamily,
    /// CAIP-2 namespace (e.g. `"eip155"`).
    pub namespace: &'static str,
    /// CAIP-2 reference (e.g. `"84532"`).
    pub reference: &'static str,
    /// USDC deployment on this network.
    pub usdc: TokenDeployment,
}

impl NetworkInfo {
    /// CAIP-2 identifier, e.g. `eip155:8453`.
    #[must_use]
    pub fn caip2(&self) -> String {
        format!("{}:{}", self.namespace, self.reference)
    }
}

/// Name-indexed lookup over [`NetworkInfo`] slices.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    by_name: HashMap<&'static str, &'static NetworkInfo>,
}

impl NetworkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every network this crate knows about.
    #[must_use]
    pub fn known() -> Self {
        Self::from_networks(EVM_NETWORKS).with_networks(SOLANA_NETWORKS)
    }

    /// Creates a registry pre-populated from a network info slice.
    #[must_use]
    pub fn from_networks(networks: &'static [NetworkInfo]) -> Self {
        let mut registry = Self::new();
        registry.register(networks);
        registry
    }

    /// Registers additional networks.
    pub fn register(&mut self, networks: &'static [NetworkInfo]) {
        for info in networks {
            self.by_name.insert(info.name, info);
        }
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with_networks(mut self, networks: &'static [NetworkInfo]) -> Self {
        self.register(networks);
        self
    }

    /// Looks up a network by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'static NetworkInfo> {
        self.by_name.get(name).copied()
    }

    /// Looks up a network by name, failing for unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownNetwork`] if the name is not registered.
    pub fn require(&self, name: &str) -> Result<&'static NetworkInfo, ProtocolError> {
        self.get(name)
            .ok_or_else(|| ProtocolError::UnknownNetwork(name.to_owned()))
    }

    /// Number of registered networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` if no networks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_registry_contains_both_families() {
        let registry = NetworkRegistry::known();
        assert_eq!(registry.len(), EVM_NETWORKS.len() + SOLANA_NETWORKS.len());

        let base = registry.get("base").unwrap();
        assert_eq!(base.family, NetworkFamily::Evm);
        assert_eq!(base.caip2(), "eip155:8453");
        assert_eq!(base.usdc.decimals, 6);
        assert!(base.usdc.eip712.is_some());

        let devnet = registry.get("solana-devnet").unwrap();
        assert_eq!(devnet.family, NetworkFamily::Svm);
        assert!(devnet.usdc.eip712.is_none());
    }

    #[test]
    fn test_require_unknown_network() {
        let registry = NetworkRegistry::known();
        let err = registry.require("dogechain").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownNetwork(name) if name == "dogechain"));
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = EVM_NETWORKS
            .iter()
            .chain(SOLANA_NETWORKS)
            .map(|n| n.name)
            .collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);
    }
}
