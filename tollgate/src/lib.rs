#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the tollgate x402 payment proxy.
//!
//! This crate holds everything the MCP and HTTP layers share when they
//! put a price on a tool call: the x402 wire format, the opaque payment
//! token codec, human price to atomic amount conversion, the registry of
//! known networks, and the [`Facilitator`](facilitator::Facilitator)
//! abstraction used to verify and settle payment proofs.
//!
//! # Modules
//!
//! - [`amount`] - Human-readable USD price parsing and atomic conversion
//! - [`error`] - Protocol and amount error types
//! - [`evm`] - EIP-55 checksumming and EIP-712 requirement extras
//! - [`facilitator`] - Dyn-compatible verify/settle/supported trait
//! - [`networks`] - Registry of known EVM and Solana networks
//! - [`proto`] - Wire format types and token encoding
//! - [`svm`] - Solana fee payer discovery from facilitator capabilities

pub mod amount;
pub mod error;
pub mod evm;
pub mod facilitator;
pub mod networks;
pub mod proto;
pub mod svm;

pub use amount::Money;
pub use error::{AmountError, ProtocolError};
pub use facilitator::{BoxFuture, Facilitator, FacilitatorError};
