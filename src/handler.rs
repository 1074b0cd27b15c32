//! The payment gate: the request-processing pipeline for x402 payments.
//!
//! [`PaymentGate`] composes the codec, the matching rules, replay and
//! rate-limit protection, and the facilitator client into a single
//! verification/settlement pipeline:
//!
//! decode header → match authorization against requirements → replay and
//! abuse checks → facilitator verification (circuit-breaker guarded) → nonce
//! commit → optional settlement.
//!
//! The gate is deliberately conservative about what it decides locally. It
//! never performs signature recovery; it only rejects payloads whose declared
//! fields cannot possibly satisfy the requirements, which keeps invalid
//! traffic away from the facilitator. For transaction-based networks nothing
//! can be established locally, so verification without a facilitator fails
//! closed.

use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::collaborators::{ComplianceChecker, MetricsSink};
use crate::facilitator::{Facilitator, FacilitatorFault};
use crate::facilitator_client::FacilitatorClient;
use crate::network::NetworkFamily;
use crate::nonce_tracker::{NonceStoreError, NonceTracker};
use crate::rate_limiter::{RateLimitStoreError, RateLimiter};
use crate::record::{PaymentRecord, PaymentState};
use crate::types::{
    AccountPayload, ExactPayload, MixedAddress, PAYMENT_HEADER, PaymentHeaderError,
    PaymentPayload, PaymentRequirements, PriceTag, Scheme, SettleResponse, UnixTimestamp,
    VerifyRequest, VerifyResponse, X402Version,
};
use crate::validator::{self, ValidationError};

/// Floor for nonce retention. A nonce must outlive its authorization window,
/// but never less than this.
const MIN_NONCE_TTL_SECONDS: u64 = 60;

/// Maximum retained length of free-form requirement descriptions.
const DESCRIPTION_MAX_LEN: usize = 512;

/// Stable reason codes for payments whose declared fields do not satisfy the
/// requirements, or that the facilitator judged invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The payload scheme differs from the required scheme.
    SchemeMismatch,
    /// The payload network differs from the required network.
    NetworkMismatch,
    /// The authorized recipient differs from the required recipient.
    RecipientMismatch,
    /// The authorized value does not equal the required amount.
    AmountMismatch,
    /// `validAfter` lies in the future.
    NotYetValid,
    /// `validBefore` falls inside the confirmation buffer.
    Expired,
    /// The requirements lack a domain-separation parameter the scheme needs.
    MissingDomainParameter(&'static str),
    /// The compliance checker blocked an address.
    ComplianceBlocked(String),
    /// The facilitator reported the payment invalid; carries its reason
    /// verbatim.
    Facilitator(String),
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SchemeMismatch => write!(f, "scheme_mismatch"),
            RejectReason::NetworkMismatch => write!(f, "network_mismatch"),
            RejectReason::RecipientMismatch => write!(f, "recipient_mismatch"),
            RejectReason::AmountMismatch => write!(f, "amount_mismatch"),
            RejectReason::NotYetValid => write!(f, "not_yet_valid"),
            RejectReason::Expired => write!(f, "expired"),
            RejectReason::MissingDomainParameter(key) => {
                write!(f, "missing_domain_parameter:{key}")
            }
            RejectReason::ComplianceBlocked(reason) => write!(f, "compliance_blocked:{reason}"),
            RejectReason::Facilitator(reason) => write!(f, "{reason}"),
        }
    }
}

/// Gate construction errors. Fatal: a misconfigured gate is never built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// Transaction-based payments (or settlement) need a facilitator and none
    /// is configured.
    #[error("A facilitator is required for this operation but none is configured")]
    FacilitatorRequired,
    /// The builder was told to require a facilitator and none was provided.
    #[error("Configuration requires a facilitator but none was provided")]
    MissingFacilitator,
}

/// Everything that can terminate a payment's verification or settlement.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Malformed or out-of-range input.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The `X-Payment` header did not decode into a payload.
    #[error("Malformed payment header: {0}")]
    Header(#[from] PaymentHeaderError),
    /// The request carried no payment header at all.
    #[error("{0} header is required")]
    PaymentHeaderRequired(&'static str),
    /// The authorization does not satisfy the requirements.
    #[error("Payment rejected: {reason}")]
    Rejected { reason: RejectReason },
    /// The nonce was already spent.
    #[error("Payment authorization was already used")]
    ReplayDetected,
    /// The caller exhausted its attempt budget.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    /// The facilitator could not be reached.
    #[error("Facilitator unavailable: {0}")]
    FacilitatorUnavailable(String),
    /// This instance's circuit breaker refused the facilitator call.
    #[error("Facilitator circuit breaker is open")]
    CircuitOpen,
    /// The facilitator attempted settlement and it failed. Terminal: this
    /// layer never retries settlement.
    #[error("Settlement failed: {reason}")]
    SettlementFailed { reason: String },
    /// The gate cannot perform the operation as configured.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A shared backing store failed; the request fails closed.
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<NonceStoreError> for PaymentError {
    fn from(value: NonceStoreError) -> Self {
        PaymentError::StoreUnavailable(value.to_string())
    }
}

impl From<RateLimitStoreError> for PaymentError {
    fn from(value: RateLimitStoreError) -> Self {
        PaymentError::StoreUnavailable(value.to_string())
    }
}

impl PaymentError {
    fn from_facilitator<E: FacilitatorFault>(err: E) -> Self {
        if err.is_circuit_open() {
            PaymentError::CircuitOpen
        } else {
            PaymentError::FacilitatorUnavailable(err.to_string())
        }
    }
}

/// Builder for [`PaymentGate`].
///
/// All collaborators are optional and named; the gate that `build` returns is
/// validated once, so nothing is re-checked per request.
pub struct PaymentGateBuilder<F = FacilitatorClient> {
    facilitator: Option<F>,
    nonce_tracker: Option<NonceTracker>,
    rate_limiter: Option<RateLimiter>,
    compliance: Option<Arc<dyn ComplianceChecker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    confirmation_buffer: Duration,
    settle_after_verify: bool,
    require_facilitator: bool,
}

impl PaymentGateBuilder<FacilitatorClient> {
    pub fn new() -> Self {
        Self {
            facilitator: None,
            nonce_tracker: None,
            rate_limiter: None,
            compliance: None,
            metrics: None,
            confirmation_buffer: PaymentGate::<FacilitatorClient>::DEFAULT_CONFIRMATION_BUFFER,
            settle_after_verify: false,
            require_facilitator: false,
        }
    }
}

impl Default for PaymentGateBuilder<FacilitatorClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> PaymentGateBuilder<F> {
    /// Sets the facilitator used for remote verification and settlement.
    pub fn with_facilitator<F2: Facilitator>(self, facilitator: F2) -> PaymentGateBuilder<F2> {
        PaymentGateBuilder {
            facilitator: Some(facilitator),
            nonce_tracker: self.nonce_tracker,
            rate_limiter: self.rate_limiter,
            compliance: self.compliance,
            metrics: self.metrics,
            confirmation_buffer: self.confirmation_buffer,
            settle_after_verify: self.settle_after_verify,
            require_facilitator: self.require_facilitator,
        }
    }

    /// Enables replay prevention through the given tracker.
    pub fn with_nonce_tracker(mut self, tracker: NonceTracker) -> Self {
        self.nonce_tracker = Some(tracker);
        self
    }

    /// Enables per-identifier rate limiting.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Enables address screening.
    pub fn with_compliance_checker(mut self, checker: Arc<dyn ComplianceChecker>) -> Self {
        self.compliance = Some(checker);
        self
    }

    /// Attaches a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tunes the expiry confirmation buffer.
    ///
    /// `validBefore` must exceed now by at least this much, because server
    /// time can lag the chain by a block confirmation. Slow chains warrant a
    /// larger buffer (e.g. 36s), very fast ones a smaller (e.g. 2s).
    pub fn with_confirmation_buffer(mut self, buffer: Duration) -> Self {
        self.confirmation_buffer = buffer;
        self
    }

    /// Settles automatically inside `process_payment` after verification.
    pub fn settle_after_verify(mut self) -> Self {
        self.settle_after_verify = true;
        self
    }

    /// Refuses to build without a facilitator. Deployments that must never
    /// trust local-only verification set this.
    pub fn require_facilitator(mut self) -> Self {
        self.require_facilitator = true;
        self
    }

    /// Validates the configuration and builds the gate.
    pub fn build(self) -> Result<PaymentGate<F>, ConfigurationError> {
        if self.require_facilitator && self.facilitator.is_none() {
            return Err(ConfigurationError::MissingFacilitator);
        }
        Ok(PaymentGate {
            facilitator: self.facilitator,
            nonce_tracker: self.nonce_tracker,
            rate_limiter: self.rate_limiter,
            compliance: self.compliance,
            metrics: self.metrics,
            confirmation_buffer: self.confirmation_buffer,
            settle_after_verify: self.settle_after_verify,
        })
    }
}

/// Outcome of [`PaymentGate::process_payment`]. Never an error: every failure
/// is folded into `verified = false` with the cause attached.
#[derive(Debug)]
pub struct PaymentOutcome {
    /// Whether the payment passed verification (and settlement, when
    /// auto-settlement is enabled).
    pub verified: bool,
    /// The decoded payload, when decoding got that far.
    pub payload: Option<PaymentPayload>,
    /// The settlement result, when settlement ran.
    pub settlement: Option<SettleResponse>,
    /// The audit record for this payment.
    pub record: PaymentRecord,
    /// The failure that stopped the pipeline, if any.
    pub error: Option<PaymentError>,
}

/// Orchestrates x402 payment verification and settlement for a resource
/// server.
pub struct PaymentGate<F = FacilitatorClient> {
    facilitator: Option<F>,
    nonce_tracker: Option<NonceTracker>,
    rate_limiter: Option<RateLimiter>,
    compliance: Option<Arc<dyn ComplianceChecker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    confirmation_buffer: Duration,
    settle_after_verify: bool,
}

impl<F> fmt::Debug for PaymentGate<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentGate")
            .field("facilitator", &self.facilitator.is_some())
            .field("nonce_tracker", &self.nonce_tracker.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("compliance", &self.compliance.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("confirmation_buffer", &self.confirmation_buffer)
            .field("settle_after_verify", &self.settle_after_verify)
            .finish()
    }
}

impl PaymentGate<FacilitatorClient> {
    /// Starts building a gate.
    pub fn builder() -> PaymentGateBuilder<FacilitatorClient> {
        PaymentGateBuilder::new()
    }
}

impl<F: Facilitator> PaymentGate<F> {
    /// Default expiry confirmation buffer.
    pub const DEFAULT_CONFIRMATION_BUFFER: Duration = Duration::from_secs(6);

    fn count(&self, name: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter(name, 1);
        }
    }

    fn time(&self, name: &'static str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.timing(name, started.elapsed());
        }
    }

    /// Validates and sanitizes payment terms into immutable
    /// [`PaymentRequirements`].
    ///
    /// Account-based networks must declare the EIP-712 domain-separation
    /// parameters (`extra.name` and `extra.version`); their cryptographic
    /// correctness is the facilitator's concern, but their presence is
    /// checked here so clients can sign against a complete domain.
    pub fn create_requirements(
        &self,
        tag: &PriceTag,
        resource: &str,
        description: &str,
    ) -> Result<PaymentRequirements, ValidationError> {
        let resource = validator::sanitize_url(resource)?;
        if !validator::is_valid_address(&tag.pay_to, tag.network) {
            return Err(ValidationError::InvalidAddress {
                network: tag.network,
            });
        }
        if !validator::is_valid_address(&tag.asset, tag.network) {
            return Err(ValidationError::InvalidAddress {
                network: tag.network,
            });
        }
        let amount = validator::parse_uint256(&tag.amount)?;
        if tag.network.family() == NetworkFamily::Account {
            let name_present = tag
                .extra
                .as_ref()
                .and_then(|extra| extra.get("name"))
                .and_then(|v| v.as_str())
                .is_some();
            if !name_present {
                return Err(ValidationError::MissingDomainParameter("name"));
            }
            let version_present = tag
                .extra
                .as_ref()
                .and_then(|extra| extra.get("version"))
                .and_then(|v| v.as_str())
                .is_some();
            if !version_present {
                return Err(ValidationError::MissingDomainParameter("version"));
            }
        }
        let pay_to = MixedAddress::parse(&tag.pay_to, tag.network)
            .map_err(|_| ValidationError::InvalidAddress {
                network: tag.network,
            })?;
        let asset = MixedAddress::parse(&tag.asset, tag.network)
            .map_err(|_| ValidationError::InvalidAddress {
                network: tag.network,
            })?;
        Ok(PaymentRequirements {
            scheme: Scheme::Exact,
            network: tag.network,
            max_amount_required: crate::types::TokenAmount(amount),
            resource,
            description: validator::sanitize_string(description, DESCRIPTION_MAX_LEN),
            mime_type: "application/json".to_string(),
            output_schema: None,
            pay_to,
            max_timeout_seconds: tag.max_timeout_seconds,
            asset,
            extra: tag.extra.clone(),
        })
    }

    /// Verifies a payment header against the requirements.
    ///
    /// `identifier` names the caller for rate limiting (e.g. client IP);
    /// rate limiting is skipped when it is absent or no limiter is
    /// configured.
    ///
    /// On success the payload's nonce is committed atomically, so a
    /// concurrent duplicate of the same authorization loses the race and
    /// surfaces as [`PaymentError::ReplayDetected`].
    #[instrument(skip_all, err, fields(network = tracing::field::Empty))]
    pub async fn verify(
        &self,
        header: &[u8],
        requirements: &PaymentRequirements,
        identifier: Option<&str>,
    ) -> Result<PaymentPayload, PaymentError> {
        let payload = PaymentPayload::from_header(header)?;
        tracing::Span::current().record("network", tracing::field::display(payload.network));

        if payload.scheme != requirements.scheme {
            return self.reject(RejectReason::SchemeMismatch);
        }
        if payload.network != requirements.network {
            return self.reject(RejectReason::NetworkMismatch);
        }

        let account = match &payload.payload {
            ExactPayload::Account(account) => {
                self.match_account_authorization(account, requirements)?;
                Some(*account)
            }
            ExactPayload::Transaction(_) => {
                // Nothing about a serialized transaction can be validated
                // locally; without a facilitator this must fail closed.
                if self.facilitator.is_none() {
                    return Err(ConfigurationError::FacilitatorRequired.into());
                }
                None
            }
        };

        if let (Some(compliance), Some(account)) = (&self.compliance, &account) {
            let payer = MixedAddress::Evm(account.authorization.from);
            if let Some(reason) = compliance.check_address(&payer, payload.network).await {
                self.count("x402.verify.compliance_blocked");
                return self.reject(RejectReason::ComplianceBlocked(reason));
            }
        }

        if let (Some(tracker), Some(account)) = (&self.nonce_tracker, &account)
            && tracker.has_nonce(&account.authorization.nonce).await?
        {
            self.count("x402.verify.replay");
            return Err(PaymentError::ReplayDetected);
        }

        if let (Some(limiter), Some(identifier)) = (&self.rate_limiter, identifier) {
            if !limiter.is_allowed(identifier).await? {
                self.count("x402.verify.rate_limited");
                return Err(PaymentError::RateLimitExceeded);
            }
            limiter.record_attempt(identifier).await?;
        }

        if let Some(facilitator) = &self.facilitator {
            let request = VerifyRequest {
                x402_version: X402Version::V1,
                payment_header: String::from_utf8_lossy(header).into_owned(),
                payment_requirements: requirements.clone(),
            };
            let started = Instant::now();
            let response = facilitator
                .verify(&request)
                .await
                .map_err(PaymentError::from_facilitator)?;
            self.time("x402.facilitator.verify", started);
            if let VerifyResponse::Invalid { reason, payer } = response {
                tracing::warn!(reason = %reason, payer = ?payer, "Facilitator rejected payment");
                return self.reject(RejectReason::Facilitator(reason));
            }
        }

        if let (Some(tracker), Some(account)) = (&self.nonce_tracker, &account) {
            let now = UnixTimestamp::now();
            let ttl = now
                .seconds_until(account.authorization.valid_before)
                .max(MIN_NONCE_TTL_SECONDS);
            let newly_marked = tracker.mark_used(&account.authorization.nonce, ttl).await?;
            if !newly_marked {
                // A concurrent request spent this nonce between our check and
                // our commit. Exactly one of us wins.
                self.count("x402.verify.replay");
                return Err(PaymentError::ReplayDetected);
            }
        }

        if let (Some(limiter), Some(identifier)) = (&self.rate_limiter, identifier) {
            limiter.record_success(identifier).await?;
        }
        self.count("x402.verify.accepted");
        Ok(payload)
    }

    /// Settles a verified payment through the facilitator.
    ///
    /// A settlement the facilitator attempted and reports as failed is a
    /// terminal error here. Retrying is left to the caller on purpose: this
    /// layer cannot know whether the failed attempt moved funds, and a blind
    /// retry risks double settlement.
    #[instrument(skip_all, err)]
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, PaymentError> {
        let facilitator = self
            .facilitator
            .as_ref()
            .ok_or(ConfigurationError::FacilitatorRequired)?;
        let header = payload.to_header().map_err(PaymentHeaderError::Json)?;
        let request = VerifyRequest {
            x402_version: X402Version::V1,
            payment_header: header.to_string(),
            payment_requirements: requirements.clone(),
        };
        let started = Instant::now();
        let response = facilitator
            .settle(&request)
            .await
            .map_err(PaymentError::from_facilitator)?;
        self.time("x402.facilitator.settle", started);
        if !response.success {
            let reason = response
                .error_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(reason = %reason, "Settlement failed");
            self.count("x402.settle.failed");
            return Err(PaymentError::SettlementFailed { reason });
        }
        self.count("x402.settle.success");
        Ok(response)
    }

    /// Convenience composition: header extraction, verification, and optional
    /// auto-settlement. Never returns an error; every failure is folded into
    /// the outcome with `verified = false`.
    pub async fn process_payment(
        &self,
        headers: &http::HeaderMap,
        requirements: &PaymentRequirements,
        identifier: Option<&str>,
    ) -> PaymentOutcome {
        let mut record = PaymentRecord::new(requirements.clone());

        let Some(header) = headers.get(PAYMENT_HEADER) else {
            return PaymentOutcome {
                verified: false,
                payload: None,
                settlement: None,
                record,
                error: Some(PaymentError::PaymentHeaderRequired(PAYMENT_HEADER)),
            };
        };

        advance(&mut record, PaymentState::Verifying);
        let payload = match self
            .verify(header.as_bytes(), requirements, identifier)
            .await
        {
            Ok(payload) => {
                record.attach_payload(payload.clone());
                advance(&mut record, PaymentState::Verified);
                payload
            }
            Err(err) => {
                record.set_error(err.to_string());
                let terminal = match &err {
                    PaymentError::Rejected {
                        reason: RejectReason::Expired,
                    } => PaymentState::Expired,
                    _ => PaymentState::Failed,
                };
                advance(&mut record, terminal);
                self.count("x402.verify.rejected");
                return PaymentOutcome {
                    verified: false,
                    payload: None,
                    settlement: None,
                    record,
                    error: Some(err),
                };
            }
        };

        if !(self.settle_after_verify && self.facilitator.is_some()) {
            return PaymentOutcome {
                verified: true,
                payload: Some(payload),
                settlement: None,
                record,
                error: None,
            };
        }

        advance(&mut record, PaymentState::Settling);
        match self.settle(&payload, requirements).await {
            Ok(settlement) => {
                if let Some(transaction) = &settlement.transaction {
                    record.set_transaction(transaction.clone());
                }
                advance(&mut record, PaymentState::Settled);
                PaymentOutcome {
                    verified: true,
                    payload: Some(payload),
                    settlement: Some(settlement),
                    record,
                    error: None,
                }
            }
            Err(err) => {
                record.set_error(err.to_string());
                advance(&mut record, PaymentState::Failed);
                PaymentOutcome {
                    verified: false,
                    payload: Some(payload),
                    settlement: None,
                    record,
                    error: Some(err),
                }
            }
        }
    }

    /// The authorization-matching rules for the exact scheme on account-based
    /// networks.
    fn match_account_authorization(
        &self,
        account: &AccountPayload,
        requirements: &PaymentRequirements,
    ) -> Result<(), PaymentError> {
        let authorization = &account.authorization;

        let required_receiver = match &requirements.pay_to {
            MixedAddress::Evm(address) => address,
            MixedAddress::Base58(_) => {
                return self.reject(RejectReason::RecipientMismatch);
            }
        };
        if authorization.to != *required_receiver {
            return self.reject(RejectReason::RecipientMismatch);
        }

        // Exact scheme: big-integer equality, never a float or native cast.
        if authorization.value != requirements.max_amount_required {
            return self.reject(RejectReason::AmountMismatch);
        }

        let now = UnixTimestamp::now();
        if authorization.valid_after > now {
            return self.reject(RejectReason::NotYetValid);
        }
        // The buffer absorbs confirmation delay between server time and the
        // chain: too tight a window would be rejected on-chain anyway.
        let horizon = now + self.confirmation_buffer.as_secs();
        if authorization.valid_before < horizon {
            return self.reject(RejectReason::Expired);
        }

        if requirements.domain_parameter("name").is_none() {
            return self.reject(RejectReason::MissingDomainParameter("name"));
        }
        if requirements.domain_parameter("version").is_none() {
            return self.reject(RejectReason::MissingDomainParameter("version"));
        }
        Ok(())
    }

    fn reject<T>(&self, reason: RejectReason) -> Result<T, PaymentError> {
        self.count("x402.verify.rejected");
        Err(PaymentError::Rejected { reason })
    }
}

/// Moves a record along a statically legal edge, complaining loudly instead
/// of panicking if the state machine disagrees.
fn advance(record: &mut PaymentRecord, state: PaymentState) {
    if let Err(err) = record.transition(state) {
        tracing::error!(error = %err, "Payment record refused transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AccountAuthorization, EvmSignature, HexEncodedNonce, TokenAmount, TransactionPayload,
    };
    use serde_json::json;

    const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
    const ASSET: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";
    const PAYER: &str = "0x857b06519E91e3A54538791bDbb0E22373e36b66";

    fn gate() -> PaymentGate<FacilitatorClient> {
        PaymentGate::builder().build().unwrap()
    }

    fn price_tag() -> PriceTag {
        PriceTag {
            pay_to: PAY_TO.to_string(),
            asset: ASSET.to_string(),
            network: crate::network::Network::BaseSepolia,
            amount: "1000000".to_string(),
            max_timeout_seconds: 300,
            extra: Some(json!({"name": "USDC", "version": "2"})),
        }
    }

    fn requirements() -> PaymentRequirements {
        gate()
            .create_requirements(&price_tag(), "https://example.com/paid", "Paid resource")
            .unwrap()
    }

    fn authorization(value: u64, nonce: u8) -> AccountAuthorization {
        let now = UnixTimestamp::now();
        AccountAuthorization {
            from: PAYER.parse().unwrap(),
            to: PAY_TO.parse().unwrap(),
            value: TokenAmount::from(value),
            valid_after: UnixTimestamp(now.as_secs() - 60),
            valid_before: now + 600,
            nonce: HexEncodedNonce([nonce; 32]),
        }
    }

    fn account_header(authorization: AccountAuthorization) -> Vec<u8> {
        let payload = PaymentPayload {
            x402_version: X402Version::V1,
            scheme: Scheme::Exact,
            network: crate::network::Network::BaseSepolia,
            payload: ExactPayload::Account(AccountPayload {
                signature: EvmSignature([0x42; 65]),
                authorization,
            }),
        };
        payload.to_header().unwrap().as_ref().to_vec()
    }

    fn transaction_header() -> Vec<u8> {
        let payload = PaymentPayload {
            x402_version: X402Version::V1,
            scheme: Scheme::Exact,
            network: crate::network::Network::Solana,
            payload: ExactPayload::Transaction(TransactionPayload {
                transaction: "AQIDBA==".to_string(),
            }),
        };
        payload.to_header().unwrap().as_ref().to_vec()
    }

    #[tokio::test]
    async fn accepts_a_matching_authorization() {
        let gate = gate();
        let payload = gate
            .verify(&account_header(authorization(1_000_000, 1)), &requirements(), None)
            .await
            .unwrap();
        assert_eq!(payload.network, crate::network::Network::BaseSepolia);
    }

    #[tokio::test]
    async fn rejects_amount_mismatch() {
        let gate = gate();
        let err = gate
            .verify(&account_header(authorization(999_999, 1)), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::AmountMismatch
            }
        ));
    }

    #[tokio::test]
    async fn rejects_recipient_mismatch() {
        let gate = gate();
        let mut authorization = authorization(1_000_000, 1);
        authorization.to = PAYER.parse().unwrap();
        let err = gate
            .verify(&account_header(authorization), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::RecipientMismatch
            }
        ));
    }

    #[tokio::test]
    async fn rejects_a_not_yet_valid_authorization() {
        let gate = gate();
        let mut authorization = authorization(1_000_000, 1);
        authorization.valid_after = UnixTimestamp::now() + 120;
        let err = gate
            .verify(&account_header(authorization), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::NotYetValid
            }
        ));
    }

    #[tokio::test]
    async fn rejects_expiry_inside_the_confirmation_buffer() {
        let gate = gate();
        let mut authorization = authorization(1_000_000, 1);
        // Valid for two more seconds, but the default buffer needs six.
        authorization.valid_before = UnixTimestamp::now() + 2;
        let err = gate
            .verify(&account_header(authorization), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::Expired
            }
        ));
    }

    #[tokio::test]
    async fn a_wider_buffer_tightens_expiry() {
        let gate = PaymentGate::builder()
            .with_confirmation_buffer(Duration::from_secs(36))
            .build()
            .unwrap();
        let mut authorization = authorization(1_000_000, 1);
        authorization.valid_before = UnixTimestamp::now() + 20;
        let err = gate
            .verify(&account_header(authorization), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::Expired
            }
        ));
    }

    #[tokio::test]
    async fn rejects_scheme_and_network_mismatches() {
        let gate = gate();
        let mut requirements = requirements();
        requirements.network = crate::network::Network::Base;
        let err = gate
            .verify(&account_header(authorization(1_000_000, 1)), &requirements, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::NetworkMismatch
            }
        ));
    }

    #[tokio::test]
    async fn rejects_requirements_missing_domain_parameters() {
        let gate = gate();
        let mut requirements = requirements();
        requirements.extra = Some(json!({"name": "USDC"}));
        let err = gate
            .verify(&account_header(authorization(1_000_000, 1)), &requirements, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::MissingDomainParameter("version")
            }
        ));
    }

    #[tokio::test]
    async fn transaction_payloads_fail_closed_without_a_facilitator() {
        let gate = gate();
        let mut requirements = requirements();
        requirements.network = crate::network::Network::Solana;
        let err = gate
            .verify(&transaction_header(), &requirements, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Configuration(ConfigurationError::FacilitatorRequired)
        ));
    }

    #[tokio::test]
    async fn second_use_of_a_nonce_is_replay() {
        let tracker = NonceTracker::new(std::sync::Arc::new(
            crate::nonce_tracker::InMemoryNonceStore::new(),
        ));
        let gate = PaymentGate::builder()
            .with_nonce_tracker(tracker)
            .build()
            .unwrap();
        let requirements = requirements();
        let header = account_header(authorization(1_000_000, 9));
        gate.verify(&header, &requirements, None).await.unwrap();
        let err = gate.verify(&header, &requirements, None).await.unwrap_err();
        assert!(matches!(err, PaymentError::ReplayDetected));
    }

    /// Stub facilitator that judges every payment invalid. Exercises the
    /// gate's facilitator seam without HTTP.
    struct RejectingFacilitator;

    #[derive(Debug, thiserror::Error)]
    #[error("stub facilitator failure")]
    struct StubFault;

    impl FacilitatorFault for StubFault {}

    impl Facilitator for RejectingFacilitator {
        type Error = StubFault;

        async fn verify(&self, _request: &VerifyRequest) -> Result<VerifyResponse, StubFault> {
            Ok(VerifyResponse::invalid(None, "insufficient_funds"))
        }

        async fn settle(&self, _request: &VerifyRequest) -> Result<SettleResponse, StubFault> {
            Ok(SettleResponse {
                success: false,
                error_reason: Some("invalid_scheme".to_string()),
                payer: None,
                transaction: None,
                network: None,
                status: None,
            })
        }

        async fn supported(&self) -> Result<crate::types::SupportedResponse, StubFault> {
            Ok(crate::types::SupportedResponse::default())
        }
    }

    #[tokio::test]
    async fn rate_limiter_rejects_the_over_budget_attempt() {
        let limiter = RateLimiter::new(
            std::sync::Arc::new(crate::rate_limiter::InMemorySlidingWindowStore::new()),
            2,
            Duration::from_secs(60),
        );
        let gate = PaymentGateBuilder::new()
            .with_rate_limiter(limiter)
            .with_facilitator(RejectingFacilitator)
            .build()
            .unwrap();
        let requirements = requirements();
        // Attempts fail at the facilitator, after the rate-limit step has
        // recorded them, so the budget drains.
        for _ in 0..2 {
            let err = gate
                .verify(
                    &account_header(authorization(1_000_000, 1)),
                    &requirements,
                    Some("10.0.0.1"),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, PaymentError::Rejected { .. }));
        }
        let err = gate
            .verify(
                &account_header(authorization(1_000_000, 1)),
                &requirements,
                Some("10.0.0.1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn facilitator_reasons_propagate_verbatim() {
        let gate = PaymentGateBuilder::new()
            .with_facilitator(RejectingFacilitator)
            .build()
            .unwrap();
        let err = gate
            .verify(&account_header(authorization(1_000_000, 1)), &requirements(), None)
            .await
            .unwrap_err();
        match err {
            PaymentError::Rejected {
                reason: RejectReason::Facilitator(reason),
            } => assert_eq!(reason, "insufficient_funds"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_settlement_is_terminal() {
        let gate = PaymentGateBuilder::new()
            .with_facilitator(RejectingFacilitator)
            .build()
            .unwrap();
        let requirements = requirements();
        let payload =
            PaymentPayload::from_header(&account_header(authorization(1_000_000, 1))).unwrap();
        let err = gate.settle(&payload, &requirements).await.unwrap_err();
        match err {
            PaymentError::SettlementFailed { reason } => assert_eq!(reason, "invalid_scheme"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn compliance_blocks_a_listed_payer() {
        struct Blocklist;
        #[async_trait::async_trait]
        impl ComplianceChecker for Blocklist {
            async fn check_address(
                &self,
                address: &MixedAddress,
                _network: crate::network::Network,
            ) -> Option<String> {
                (address.to_string().to_lowercase() == PAYER.to_lowercase())
                    .then(|| "sanctioned".to_string())
            }
        }
        let gate = PaymentGate::builder()
            .with_compliance_checker(std::sync::Arc::new(Blocklist))
            .build()
            .unwrap();
        let err = gate
            .verify(&account_header(authorization(1_000_000, 1)), &requirements(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Rejected {
                reason: RejectReason::ComplianceBlocked(_)
            }
        ));
    }

    #[tokio::test]
    async fn settle_requires_a_facilitator() {
        let gate = gate();
        let requirements = requirements();
        let payload =
            PaymentPayload::from_header(&account_header(authorization(1_000_000, 1))).unwrap();
        let err = gate.settle(&payload, &requirements).await.unwrap_err();
        assert!(matches!(
            err,
            PaymentError::Configuration(ConfigurationError::FacilitatorRequired)
        ));
    }

    #[test]
    fn require_facilitator_is_validated_at_build_time() {
        let err = PaymentGate::builder()
            .require_facilitator()
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingFacilitator);
    }

    #[test]
    fn create_requirements_validates_inputs() {
        let gate = gate();
        let mut tag = price_tag();
        tag.amount = "007".to_string();
        assert!(gate
            .create_requirements(&tag, "https://example.com/paid", "")
            .is_err());

        let mut tag = price_tag();
        tag.pay_to = "not-an-address".to_string();
        assert!(gate
            .create_requirements(&tag, "https://example.com/paid", "")
            .is_err());

        let tag = price_tag();
        assert!(matches!(
            gate.create_requirements(&tag, "ftp://example.com/paid", ""),
            Err(ValidationError::ForbiddenUrlScheme(_))
        ));

        let mut tag = price_tag();
        tag.extra = Some(json!({"version": "2"}));
        assert!(matches!(
            gate.create_requirements(&tag, "https://example.com/paid", ""),
            Err(ValidationError::MissingDomainParameter("name"))
        ));
    }

    #[test]
    fn create_requirements_sanitizes_description() {
        let gate = gate();
        let requirements = gate
            .create_requirements(
                &price_tag(),
                "https://example.com/paid",
                "<script>alert(1)</script>",
            )
            .unwrap();
        assert!(!requirements.description.contains('<'));
    }

    #[tokio::test]
    async fn process_payment_without_header_reports_the_missing_header() {
        let gate = gate();
        let outcome = gate
            .process_payment(&http::HeaderMap::new(), &requirements(), None)
            .await;
        assert!(!outcome.verified);
        assert!(matches!(
            outcome.error,
            Some(PaymentError::PaymentHeaderRequired(_))
        ));
        assert_eq!(outcome.record.state(), PaymentState::Pending);
    }

    #[tokio::test]
    async fn process_payment_marks_the_record_verified() {
        let gate = gate();
        let mut headers = http::HeaderMap::new();
        headers.insert(
            PAYMENT_HEADER,
            http::HeaderValue::from_bytes(&account_header(authorization(1_000_000, 1))).unwrap(),
        );
        let outcome = gate.process_payment(&headers, &requirements(), None).await;
        assert!(outcome.verified);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.record.state(), PaymentState::Verified);
        assert!(outcome.record.payload().is_some());
    }

    #[tokio::test]
    async fn process_payment_expires_the_record_on_stale_windows() {
        let gate = gate();
        let mut authorization = authorization(1_000_000, 1);
        authorization.valid_before = UnixTimestamp::now() + 1;
        let mut headers = http::HeaderMap::new();
        headers.insert(
            PAYMENT_HEADER,
            http::HeaderValue::from_bytes(&account_header(authorization)).unwrap(),
        );
        let outcome = gate.process_payment(&headers, &requirements(), None).await;
        assert!(!outcome.verified);
        assert_eq!(outcome.record.state(), PaymentState::Expired);
    }
}
