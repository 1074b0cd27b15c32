//! Resource-server enforcement for the [x402 protocol](https://www.x402.org).
//!
//! This crate implements the server side of HTTP-native payments: a client
//! attaches a signed, scheme-specific payment authorization in the
//! `X-Payment` header, and the server validates it against locally declared
//! payment requirements, optionally confirms cryptographic validity through a
//! remote facilitator, and optionally triggers settlement — all before
//! serving the protected resource.
//!
//! # Overview
//!
//! The centerpiece is [`handler::PaymentGate`], the verification and
//! settlement pipeline. Around it sit three concurrency-safe guards:
//!
//! - [`nonce_tracker`] — atomic "check-and-mark used" nonce store, preventing
//!   replay of a previously accepted authorization.
//! - [`rate_limiter`] — sliding-window attempt counter per caller identifier.
//! - [`circuit_breaker`] — sheds calls to a failing facilitator until it
//!   shows signs of recovery.
//!
//! Cryptographic signature recovery and on-chain transaction parsing are
//! delegated entirely to the facilitator, reached through
//! [`facilitator_client::FacilitatorClient`]. The gate only rejects payloads
//! whose declared fields cannot possibly satisfy the requirements, which
//! keeps invalid traffic off the facilitator.
//!
//! # Modules
//!
//! - [`circuit_breaker`] — CLOSED/OPEN/HALF_OPEN breaker with configurable thresholds.
//! - [`collaborators`] — narrow interfaces for metrics, compliance, and webhook verification.
//! - [`facilitator`] — the [`Facilitator`](facilitator::Facilitator) trait for verification and settlement.
//! - [`facilitator_client`] — HTTP client for a remote facilitator's `/verify`, `/settle`, `/supported`.
//! - [`handler`] — the [`PaymentGate`](handler::PaymentGate) pipeline and its error taxonomy.
//! - [`network`] — known networks and their authorization families.
//! - [`nonce_tracker`] — replay prevention over a pluggable key-value store.
//! - [`rate_limiter`] — sliding-window rate limiting over a pluggable timestamp-set store.
//! - [`record`] — the payment lifecycle state machine and audit record.
//! - [`types`] — wire types: payloads, requirements, verify/settle messages, the 402 body.
//! - [`validator`] — pure format, amount, and sanitization checks.
//!
//! # Example
//!
//! ```rust,no_run
//! use x402_guard::facilitator_client::FacilitatorClient;
//! use x402_guard::handler::PaymentGate;
//! use x402_guard::network::Network;
//! use x402_guard::types::PriceTag;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let facilitator = FacilitatorClient::try_from("https://facilitator.x402.rs")?;
//! let gate = PaymentGate::builder()
//!     .with_facilitator(std::sync::Arc::new(facilitator))
//!     .build()?;
//!
//! let requirements = gate.create_requirements(
//!     &PriceTag {
//!         pay_to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".to_string(),
//!         asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
//!         network: Network::Base,
//!         amount: "10000".to_string(), // 0.01 USDC
//!         max_timeout_seconds: 300,
//!         extra: Some(serde_json::json!({"name": "USD Coin", "version": "2"})),
//!     },
//!     "https://example.com/premium",
//!     "Premium content",
//! )?;
//!
//! // Per request: gate.process_payment(request_headers, &requirements, Some(client_ip)).await
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod collaborators;
pub mod facilitator;
pub mod facilitator_client;
pub mod handler;
pub mod network;
pub mod nonce_tracker;
pub mod rate_limiter;
pub mod record;
pub mod types;
pub mod validator;
