//! x402 payment proxy in front of an MCP server.
//!
//! Clients speak MCP to the proxy; the proxy charges for priced `tools/call`
//! requests through a remote facilitator and forwards everything to the
//! configured upstream.
//!
//! - [`config`] - TOML configuration with environment expansion
//! - [`upstream`] - [`HttpUpstream`](upstream::HttpUpstream), the `reqwest` forwarder
//! - [`hooks`] - [`ForwardHeadersHook`](hooks::ForwardHeadersHook)
//! - [`server`] - axum router, pipeline assembly and graceful shutdown

pub mod config;
pub mod error;
pub mod hooks;
pub mod server;
pub mod upstream;

pub use config::{ConfigError, ProxyConfig};
pub use error::ProxyError;
pub use server::{build_pipeline, router, run};
