//! Narrow interfaces for collaborators consumed by the payment pipeline.
//!
//! The pipeline never depends on concrete observability or policy backends;
//! it talks to a metrics sink, a compliance checker, and a webhook signature
//! verifier through the small traits below. Structured logging goes through
//! `tracing` directly.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

use crate::network::Network;
use crate::types::MixedAddress;

type HmacSha256 = Hmac<Sha256>;

/// Counter/timing/gauge sink.
///
/// Implementations are expected to be cheap and non-blocking; the pipeline
/// calls them inline on the request path.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64);
    fn timing(&self, name: &'static str, elapsed: Duration);
    fn gauge(&self, name: &'static str, value: f64);
}

/// Address screening policy.
#[async_trait]
pub trait ComplianceChecker: Send + Sync {
    /// Returns `Some(reason)` when the address must not transact on the
    /// network, `None` when it is clear.
    async fn check_address(&self, address: &MixedAddress, network: Network) -> Option<String>;
}

/// Verifies webhook payload signatures.
pub trait WebhookVerifier: Send + Sync {
    /// Checks `signature` (hex) against the raw payload bytes.
    fn verify(&self, payload: &[u8], signature: &str) -> bool;
}

/// HMAC-SHA256 webhook verifier over the raw request body.
pub struct HmacWebhookVerifier {
    secret: Vec<u8>,
}

impl HmacWebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl WebhookVerifier for HmacWebhookVerifier {
    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim_start_matches("sha256=")) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(payload);
        // verify_slice is constant-time.
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_valid_signature() {
        let verifier = HmacWebhookVerifier::new(b"topsecret".to_vec());
        let payload = br#"{"event":"payment.settled"}"#;
        let signature = sign(b"topsecret", payload);
        assert!(verifier.verify(payload, &signature));
        assert!(verifier.verify(payload, &format!("sha256={signature}")));
    }

    #[test]
    fn rejects_tampered_payloads_and_bad_signatures() {
        let verifier = HmacWebhookVerifier::new(b"topsecret".to_vec());
        let payload = br#"{"event":"payment.settled"}"#;
        let signature = sign(b"topsecret", payload);
        assert!(!verifier.verify(br#"{"event":"payment.failed"}"#, &signature));
        assert!(!verifier.verify(payload, "deadbeef"));
        assert!(!verifier.verify(payload, "not hex at all"));
    }
}
