//! MCP integration for the tollgate x402 payment proxy.
//!
//! This crate drives proxied MCP JSON-RPC traffic through an ordered list of
//! [`Hook`](hook::Hook)s and provides the hook that puts a price on tool
//! calls.
//!
//! # Architecture
//!
//! ```text
//! client ──► HookPipeline ──► request hooks (in order) ──► Upstream
//!                   ▲                                          │
//!                   └──── response hooks (reverse order) ◄─────┘
//! ```
//!
//! Upstream replies may be a JSON-RPC envelope, a bare result object, or a
//! Server-Sent-Events stream; [`wire`] collapses all three into one result
//! value before response hooks see it, and the pipeline always re-emits a
//! plain `application/json` JSON-RPC envelope.
//!
//! # Modules
//!
//! - [`wire`] - JSON-RPC and SSE parsing, envelope construction
//! - [`types`] - Typed view over MCP `CallToolResult`
//! - [`hook`] - The [`Hook`](hook::Hook) contract and per-call [`RequestExtra`](hook::RequestExtra)
//! - [`engine`] - The [`HookPipeline`](engine::HookPipeline) and [`Upstream`](engine::Upstream) seam
//! - [`payment`] - The x402 [`PaymentGate`](payment::PaymentGate) and [`X402Hook`](payment::X402Hook)
//! - [`logging`] - A `tracing` observer hook

pub mod engine;
pub mod error;
pub mod hook;
pub mod logging;
pub mod payment;
pub mod types;
pub mod wire;

pub use engine::{HookPipeline, ProxyRequest, ProxyResponse, Upstream, UpstreamRequest};
pub use error::{HookError, PipelineError};
pub use hook::{Capabilities, Hook, McpMethod, RequestExtra};
pub use logging::LoggingHook;
pub use payment::{PaymentGate, PaymentGateConfig, X402Hook};

/// MCP `_meta` key carrying the client's payment token.
pub const PAYMENT_META_KEY: &str = "x402/payment";

/// MCP `_meta` key carrying the settlement outcome of a paid call.
pub const PAYMENT_RESPONSE_META_KEY: &str = "x402/payment-response";

/// MCP `_meta` key carrying the payment error body of a rejected call.
pub const PAYMENT_ERROR_KEY: &str = "x402/error";
