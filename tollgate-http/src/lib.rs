#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP side of the tollgate x402 proxy.
//!
//! - [`facilitator_client`] - [`FacilitatorClient`], a [`Facilitator`](tollgate::Facilitator)
//!   backed by a remote facilitator's `/verify`, `/settle` and `/supported`
//! - [`layer`] - [`X402TransportLayer`], payment enforcement inside an MCP
//!   server's own HTTP stack, for deployments without the proxy

pub mod facilitator_client;
pub mod layer;

pub use facilitator_client::{DEFAULT_FACILITATOR_URL, FacilitatorClient, FacilitatorClientError};
pub use layer::{BufferedResponse, X402TransportLayer, X402TransportService};
