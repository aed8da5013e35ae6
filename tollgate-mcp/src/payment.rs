//! The x402 payment gate.
//!
//! [`PaymentGate`] holds the pricing and verification logic; [`X402Hook`]
//! plugs it into the `tools/call` slots of the pipeline. The HTTP transport
//! layer in `tollgate-http` drives the same gate without a pipeline.
//!
//! # Flow
//!
//! Request phase:
//!
//! 1. Unpriced tool: nothing happens.
//! 2. Build one requirement per configured network. Networks that cannot be
//!    priced are skipped; none left means `PRICE_COMPUTE_FAILED`.
//! 3. No token in `params._meta["x402/payment"]`: `PAYMENT_REQUIRED`.
//! 4. Undecodable token: `INVALID_PAYMENT`.
//! 5. No requirement for the token's `(scheme, network)`:
//!    `UNABLE_TO_MATCH_PAYMENT_REQUIREMENTS`.
//! 6. Facilitator rejects the proof: its reason, verbatim, with the payer.
//! 7. Otherwise a [`SettlementContext`] is parked in the call's state.
//!
//! Response phase: the context is taken; a result flagged `isError` is
//! returned without settling, any other result is settled. A failed
//! settlement replaces the result with `SETTLEMENT_FAILED`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tollgate::amount::Money;
use tollgate::error::ProtocolError;
use tollgate::evm;
use tollgate::networks::{NetworkFamily, NetworkInfo, NetworkRegistry};
use tollgate::proto::{
    self, EXACT_SCHEME, PaymentPayload, PaymentRequired, PaymentRequirements, SettleRequest,
    SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};
use tollgate::svm;
use tollgate::{BoxFuture, Facilitator};

use crate::error::HookError;
use crate::hook::{
    Capabilities, Hook, McpMethod, McpRequest, RequestExtra, ToolCallAction, ToolResultAction,
};
use crate::types::{CallToolResult, ContentItem};
use crate::{PAYMENT_ERROR_KEY, PAYMENT_META_KEY, PAYMENT_RESPONSE_META_KEY};

const fn default_x402_version() -> u8 {
    proto::X402_VERSION
}

const fn default_max_timeout_seconds() -> u64 {
    300
}

/// A recipient address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecipientAddress {
    /// The address, in the family's native format.
    pub address: String,
}

/// Where payments go, per chain family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Recipient {
    /// Recipient on EVM networks.
    #[serde(default)]
    pub evm: Option<RecipientAddress>,
    /// Recipient on Solana networks.
    #[serde(default)]
    pub svm: Option<RecipientAddress>,
}

/// Pricing and network configuration of the gate.
///
/// Deserializes from the `[payment]` table of the proxy configuration:
///
/// ```toml
/// networks = ["base", "solana-devnet"]
///
/// [recipient.evm]
/// address = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C"
///
/// [prices]
/// search = "$0.02"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentGateConfig {
    /// Protocol version the gate speaks; client payloads are normalized to it.
    #[serde(default = "default_x402_version")]
    pub x402_version: u8,
    /// Network names to accept payment on, in preference order.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Recipient addresses.
    #[serde(default)]
    pub recipient: Recipient,
    /// Tool name to USD price.
    #[serde(default)]
    pub prices: HashMap<String, Money>,
    /// Validity window offered to payers.
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
}

impl Default for PaymentGateConfig {
    fn default() -> Self {
        Self {
            x402_version: default_x402_version(),
            networks: Vec::new(),
            recipient: Recipient::default(),
            prices: HashMap::new(),
            max_timeout_seconds: default_max_timeout_seconds(),
        }
    }
}

/// Machine-readable failure codes of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    /// No requirement could be built for any configured network.
    PriceComputeFailed,
    /// The call carries no payment token.
    PaymentRequired,
    /// The payment token could not be decoded.
    InvalidPayment,
    /// The token's scheme and network match no requirement.
    UnableToMatchPaymentRequirements,
    /// The tool ran but the payment could not be captured.
    SettlementFailed,
}

impl GateErrorCode {
    /// The wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PriceComputeFailed => "PRICE_COMPUTE_FAILED",
            Self::PaymentRequired => "PAYMENT_REQUIRED",
            Self::InvalidPayment => "INVALID_PAYMENT",
            Self::UnableToMatchPaymentRequirements => "UNABLE_TO_MATCH_PAYMENT_REQUIREMENTS",
            Self::SettlementFailed => "SETTLEMENT_FAILED",
        }
    }
}

impl fmt::Display for GateErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call the gate refused to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRejection {
    /// The error body sent to the client.
    pub payment_required: PaymentRequired,
}

impl GateRejection {
    fn new(version: u8, error: impl Into<String>, accepts: Vec<PaymentRequirements>) -> Self {
        Self {
            payment_required: PaymentRequired {
                x402_version: version,
                error: error.into(),
                accepts,
                payer: None,
                details: None,
            },
        }
    }

    fn with_payer(mut self, payer: Option<String>) -> Self {
        self.payment_required.payer = payer;
        self
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.payment_required.details = Some(details.into());
        self
    }

    /// The error code or facilitator reason.
    #[must_use]
    pub fn error(&self) -> &str {
        &self.payment_required.error
    }

    /// Whether the call was refused only because it carried no payment.
    #[must_use]
    pub fn is_payment_required(&self) -> bool {
        self.error() == GateErrorCode::PaymentRequired.as_str()
    }

    /// Renders the rejection as an MCP error result: the body as JSON text
    /// and under `_meta["x402/error"]`.
    #[must_use]
    pub fn to_tool_result(&self) -> CallToolResult {
        let body = serde_json::to_value(&self.payment_required).unwrap_or_default();
        let mut result = CallToolResult::error(body.to_string());
        result.insert_meta(PAYMENT_ERROR_KEY, body);
        result
    }

    /// [`to_tool_result`](Self::to_tool_result) as JSON.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_tool_result()).unwrap_or_default()
    }
}

/// A verified payment waiting for the tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementContext {
    /// The call the payment belongs to.
    pub request_id: String,
    /// The version-normalized payment proof.
    pub payload: PaymentPayload,
    /// The requirement it was verified against.
    pub requirement: PaymentRequirements,
}

/// Request-phase verdict of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The tool has no price.
    Free,
    /// The call must not reach the tool.
    Rejected(GateRejection),
    /// The payment verified; settle it once the tool has answered.
    Authorized(SettlementContext),
}

/// Response-phase outcome of the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// The tool failed; nothing was charged and the result is unchanged.
    Skipped(Value),
    /// The payment was captured; the result carries the receipt.
    Settled {
        /// Result with `_meta["x402/payment-response"]` and a settlement note.
        result: Value,
        /// The facilitator's settlement response.
        response: SettleResponse,
    },
    /// The payment could not be captured; the result is `SETTLEMENT_FAILED`.
    Failed {
        /// The replacement error result.
        result: Value,
        /// Why settlement failed.
        reason: String,
    },
}

impl SettlementOutcome {
    /// The result to send to the client.
    #[must_use]
    pub fn into_result(self) -> Value {
        match self {
            Self::Skipped(result) | Self::Settled { result, .. } | Self::Failed { result, .. } => {
                result
            }
        }
    }
}

/// Prices, verifies and settles paid tool calls.
pub struct PaymentGate {
    config: PaymentGateConfig,
    facilitator: Arc<dyn Facilitator>,
    registry: NetworkRegistry,
}

impl fmt::Debug for PaymentGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PaymentGate {
    /// Creates a gate.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownNetwork`] if a configured network is not
    /// in the registry of known networks.
    pub fn new(
        config: PaymentGateConfig,
        facilitator: Arc<dyn Facilitator>,
    ) -> Result<Self, ProtocolError> {
        let registry = NetworkRegistry::known();
        for network in &config.networks {
            registry.require(network)?;
        }
        Ok(Self {
            config,
            facilitator,
            registry,
        })
    }

    /// The gate configuration.
    #[must_use]
    pub const fn config(&self) -> &PaymentGateConfig {
        &self.config
    }

    /// The price of `tool`, if it is paid.
    #[must_use]
    pub fn price(&self, tool: &str) -> Option<Money> {
        self.config.prices.get(tool).copied()
    }

    /// Builds the accepted requirements for one call of `tool` at `price`.
    ///
    /// Networks that cannot be priced are skipped. The facilitator's
    /// capability list is fetched at most once, and only if a Solana network
    /// is configured.
    pub async fn requirements(&self, tool: &str, price: Money) -> Vec<PaymentRequirements> {
        let mut accepts = Vec::with_capacity(self.config.networks.len());
        let mut supported: Option<Option<SupportedResponse>> = None;

        for name in &self.config.networks {
            let Some(network) = self.registry.get(name) else {
                continue;
            };
            let built = match network.family {
                NetworkFamily::Evm => self.evm_requirement(tool, price, network),
                NetworkFamily::Svm => {
                    if supported.is_none() {
                        supported = Some(self.fetch_supported().await);
                    }
                    let fee_payer = supported
                        .as_ref()
                        .and_then(Option::as_ref)
                        .and_then(|s| s.fee_payer(network.name));
                    match fee_payer {
                        Some(fee_payer) => self.svm_requirement(tool, price, network, fee_payer),
                        None => {
                            tracing::debug!(
                                network = network.name,
                                "facilitator advertises no fee payer, skipping network"
                            );
                            continue;
                        }
                    }
                }
            };
            match built {
                Ok(Some(requirement)) => accepts.push(requirement),
                Ok(None) => {
                    tracing::debug!(
                        network = network.name,
                        family = %network.family,
                        "no recipient configured, skipping network"
                    );
                }
                Err(e) => {
                    tracing::warn!(network = network.name, tool, error = %e, "cannot price network, skipping it");
                }
            }
        }
        accepts
    }

    async fn fetch_supported(&self) -> Option<SupportedResponse> {
        match self.facilitator.supported().await {
            Ok(supported) => Some(supported),
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch facilitator capabilities");
                None
            }
        }
    }

    fn base_requirement(
        &self,
        tool: &str,
        price: Money,
        network: &NetworkInfo,
        pay_to: String,
        asset: String,
    ) -> Result<PaymentRequirements, ProtocolError> {
        Ok(PaymentRequirements {
            scheme: EXACT_SCHEME.to_owned(),
            network: network.name.to_owned(),
            max_amount_required: price.to_atomic(network.usdc.decimals)?.to_string(),
            resource: format!("mcp://{tool}"),
            description: format!("Payment for MCP tool {tool}"),
            mime_type: "application/json".to_owned(),
            pay_to,
            max_timeout_seconds: self.config.max_timeout_seconds,
            asset,
            extra: None,
            output_schema: None,
        })
    }

    fn evm_requirement(
        &self,
        tool: &str,
        price: Money,
        network: &NetworkInfo,
    ) -> Result<Option<PaymentRequirements>, ProtocolError> {
        let Some(recipient) = &self.config.recipient.evm else {
            return Ok(None);
        };
        let pay_to = evm::checksum_address(&recipient.address)?;
        let asset = evm::checksum_address(network.usdc.address)?;
        let mut requirement = self.base_requirement(tool, price, network, pay_to, asset)?;
        requirement.extra = network.usdc.eip712.as_ref().map(evm::eip712_extra);
        Ok(Some(requirement))
    }

    fn svm_requirement(
        &self,
        tool: &str,
        price: Money,
        network: &NetworkInfo,
        fee_payer: &str,
    ) -> Result<Option<PaymentRequirements>, ProtocolError> {
        let Some(recipient) = &self.config.recipient.svm else {
            return Ok(None);
        };
        let pay_to = svm::validate_address(&recipient.address)?.to_owned();
        let mut requirement = self.base_requirement(
            tool,
            price,
            network,
            pay_to,
            network.usdc.address.to_owned(),
        )?;
        requirement.extra = Some(serde_json::json!({ "feePayer": fee_payer }));
        Ok(Some(requirement))
    }

    /// Decodes a payment token and normalizes its version to the gate's.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidToken`] for an undecodable token.
    pub fn decode_payment(&self, token: &Value) -> Result<PaymentPayload, ProtocolError> {
        let mut payload: PaymentPayload = proto::decode_payment_token(token)?;
        if payload.normalize_version(self.config.x402_version) {
            tracing::debug!(
                version = self.config.x402_version,
                "normalized payment payload version"
            );
        }
        Ok(payload)
    }

    /// Request phase: prices the call and verifies its payment.
    pub async fn authorize(
        &self,
        tool: &str,
        token: Option<&Value>,
        request_id: &str,
    ) -> Authorization {
        let Some(price) = self.price(tool) else {
            return Authorization::Free;
        };
        let accepts = self.requirements(tool, price).await;
        self.authorize_against(tool, accepts, token, request_id)
            .await
    }

    /// Request phase against requirements the caller already built with
    /// [`requirements`](Self::requirements).
    pub async fn authorize_against(
        &self,
        tool: &str,
        accepts: Vec<PaymentRequirements>,
        token: Option<&Value>,
        request_id: &str,
    ) -> Authorization {
        let version = self.config.x402_version;
        if accepts.is_empty() {
            tracing::warn!(request_id, tool, "no payment requirement could be built");
            return Authorization::Rejected(
                GateRejection::new(version, GateErrorCode::PriceComputeFailed.as_str(), accepts)
                    .with_details(format!("No payable network for tool {tool}")),
            );
        }

        let Some(token) = token else {
            tracing::debug!(request_id, tool, "payment required");
            return Authorization::Rejected(GateRejection::new(
                version,
                GateErrorCode::PaymentRequired.as_str(),
                accepts,
            ));
        };

        let payload = match self.decode_payment(token) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::info!(request_id, tool, error = %e, "undecodable payment token");
                return Authorization::Rejected(
                    GateRejection::new(version, GateErrorCode::InvalidPayment.as_str(), accepts)
                        .with_details(e.to_string()),
                );
            }
        };

        let Some(requirement) = accepts.iter().find(|r| payload.matches(r)).cloned() else {
            tracing::info!(
                request_id,
                tool,
                scheme = %payload.scheme,
                network = %payload.network,
                "payment matches no requirement"
            );
            return Authorization::Rejected(GateRejection::new(
                version,
                GateErrorCode::UnableToMatchPaymentRequirements.as_str(),
                accepts,
            ));
        };

        let context = SettlementContext {
            request_id: request_id.to_owned(),
            payload,
            requirement,
        };
        match self.verify(&context).await {
            Ok(payer) => {
                tracing::info!(
                    request_id,
                    tool,
                    network = %context.requirement.network,
                    payer = payer.as_deref().unwrap_or("unknown"),
                    "payment verified"
                );
                Authorization::Authorized(context)
            }
            Err(rejection) => Authorization::Rejected(GateRejection {
                payment_required: PaymentRequired {
                    accepts,
                    ..rejection.payment_required
                },
            }),
        }
    }

    /// Verifies a payment with the facilitator, returning the payer.
    ///
    /// # Errors
    ///
    /// Returns a [`GateRejection`] carrying the facilitator's reason and the
    /// payer when the proof is refused, or `INVALID_PAYMENT` when the
    /// facilitator cannot be reached.
    pub async fn verify(&self, context: &SettlementContext) -> Result<Option<String>, GateRejection> {
        let version = self.config.x402_version;
        let request = VerifyRequest {
            x402_version: version,
            payment_payload: context.payload.clone(),
            payment_requirements: context.requirement.clone(),
        };
        match self.facilitator.verify(&request).await {
            Ok(VerifyResponse::Valid { payer }) => Ok(payer),
            Ok(VerifyResponse::Invalid { reason, payer }) => {
                tracing::info!(
                    request_id = %context.request_id,
                    reason = %reason,
                    payer = payer.as_deref().unwrap_or("unknown"),
                    "payment rejected by facilitator"
                );
                Err(
                    GateRejection::new(version, reason, vec![context.requirement.clone()])
                        .with_payer(payer),
                )
            }
            Err(e) => {
                tracing::warn!(request_id = %context.request_id, error = %e, "verification failed");
                Err(GateRejection::new(
                    version,
                    GateErrorCode::InvalidPayment.as_str(),
                    vec![context.requirement.clone()],
                )
                .with_details(format!("Verification failed: {e}")))
            }
        }
    }

    /// Response phase: settles the payment unless the tool failed.
    ///
    /// Only an explicit `isError: true` counts as failure. A result that is
    /// not a tool result at all is never charged either.
    pub async fn settle(&self, context: SettlementContext, result: Value) -> SettlementOutcome {
        let mut parsed: CallToolResult = match serde_json::from_value(result.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    request_id = %context.request_id,
                    error = %e,
                    "tool returned a non tool result, not settling"
                );
                return SettlementOutcome::Skipped(result);
            }
        };
        if parsed.is_error() {
            tracing::info!(
                request_id = %context.request_id,
                "tool reported an error, payment discarded without settling"
            );
            return SettlementOutcome::Skipped(result);
        }

        let request = SettleRequest {
            x402_version: self.config.x402_version,
            payment_payload: context.payload.clone(),
            payment_requirements: context.requirement.clone(),
        };
        let reason = match self.facilitator.settle(&request).await {
            Ok(SettleResponse::Success {
                transaction,
                network,
                payer,
            }) => {
                let network = network.unwrap_or_else(|| context.requirement.network.clone());
                tracing::info!(
                    request_id = %context.request_id,
                    network = %network,
                    transaction = %transaction,
                    payer = payer.as_deref().unwrap_or("unknown"),
                    "payment settled"
                );
                let response = SettleResponse::Success {
                    transaction,
                    network: Some(network),
                    payer,
                };
                attach_receipt(&mut parsed, &response);
                return SettlementOutcome::Settled {
                    result: serde_json::to_value(&parsed).unwrap_or_default(),
                    response,
                };
            }
            Ok(SettleResponse::Error { reason, .. }) => reason,
            Err(e) => e.to_string(),
        };

        tracing::error!(
            request_id = %context.request_id,
            network = %context.requirement.network,
            reason = %reason,
            "settlement failed after the tool ran"
        );
        let rejection = GateRejection::new(
            self.config.x402_version,
            GateErrorCode::SettlementFailed.as_str(),
            vec![context.requirement],
        )
        .with_details(reason.clone());
        SettlementOutcome::Failed {
            result: rejection.to_value(),
            reason,
        }
    }
}

/// Adds the settlement note and the `x402/payment-response` receipt to a result.
fn attach_receipt(result: &mut CallToolResult, response: &SettleResponse) {
    if let SettleResponse::Success {
        transaction,
        network: Some(network),
        ..
    } = response
    {
        result.content.push(ContentItem::text(format!(
            "Payment settled on {network}: {transaction}"
        )));
    }
    result.insert_meta(
        PAYMENT_RESPONSE_META_KEY,
        serde_json::to_value(response).unwrap_or_default(),
    );
}

/// Marks a call whose payment has been captured, so a retry of the same call
/// neither re-verifies nor charges again. Holds the receipt for the retried result.
#[derive(Debug, Clone)]
struct CallSettled(SettleResponse);

/// Carries an earlier receipt onto the result of a retried, already paid call.
fn reattach_receipt(result: Value, extra: &RequestExtra) -> Value {
    let Some(settled) = extra.state.take::<CallSettled>() else {
        return result;
    };
    let reattached = match serde_json::from_value::<CallToolResult>(result.clone()) {
        Ok(mut parsed) => {
            attach_receipt(&mut parsed, &settled.0);
            serde_json::to_value(&parsed).unwrap_or(result)
        }
        Err(_) => result,
    };
    extra.state.insert(settled);
    reattached
}

/// Hook enforcing payment on priced `tools/call` requests.
#[derive(Debug, Clone)]
pub struct X402Hook {
    gate: Arc<PaymentGate>,
}

impl X402Hook {
    /// Creates the hook.
    #[must_use]
    pub const fn new(gate: Arc<PaymentGate>) -> Self {
        Self { gate }
    }
}

impl Hook for X402Hook {
    fn name(&self) -> &str {
        "x402"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .request(McpMethod::ToolsCall)
            .response(McpMethod::ToolsCall)
    }

    fn on_tool_call<'a>(
        &'a self,
        request: McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolCallAction, HookError>> {
        Box::pin(async move {
            if extra.state.contains::<CallSettled>() {
                return Ok(ToolCallAction::Continue(request));
            }
            let Some(tool) = request.tool_name() else {
                return Ok(ToolCallAction::Continue(request));
            };
            let token = request.meta_value(PAYMENT_META_KEY);
            match self.gate.authorize(tool, token, &extra.request_id).await {
                Authorization::Free => Ok(ToolCallAction::Continue(request)),
                Authorization::Rejected(rejection) => {
                    Ok(ToolCallAction::Respond(rejection.to_value()))
                }
                Authorization::Authorized(context) => {
                    extra.state.insert(context);
                    Ok(ToolCallAction::Continue(request))
                }
            }
        })
    }

    fn on_tool_result<'a>(
        &'a self,
        result: Value,
        _request: &'a McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolResultAction, HookError>> {
        Box::pin(async move {
            let Some(context) = extra.state.take::<SettlementContext>() else {
                return Ok(ToolResultAction::Continue(reattach_receipt(result, extra)));
            };
            let outcome = self.gate.settle(context, result).await;
            if let SettlementOutcome::Settled { response, .. } = &outcome {
                extra.state.insert(CallSettled(response.clone()));
            }
            Ok(ToolResultAction::Continue(outcome.into_result()))
        })
    }
}
