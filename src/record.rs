//! Payment lifecycle records.
//!
//! A [`PaymentRecord`] binds the requirements issued for a resource to the
//! payload a client eventually submits, and tracks the payment through an
//! explicit state machine. Transitions are validated against an adjacency
//! table; an illegal transition fails loudly instead of silently coercing
//! state, and a record that reaches a terminal state can no longer change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::types::{PaymentPayload, PaymentRequirements, UnixTimestamp};

/// Lifecycle states of a single payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Requirements issued, no payload received yet.
    Pending,
    /// A payload was received and is being verified.
    Verifying,
    /// Verification succeeded; the payment can be settled.
    Verified,
    /// Settlement is in flight at the facilitator.
    Settling,
    /// Settlement confirmed. Terminal.
    Settled,
    /// Verification or settlement failed. Terminal.
    Failed,
    /// The authorization window lapsed before completion. Terminal.
    Expired,
    /// The server withdrew the payment requirement. Terminal.
    Cancelled,
}

impl Display for PaymentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentState::Pending => "pending",
            PaymentState::Verifying => "verifying",
            PaymentState::Verified => "verified",
            PaymentState::Settling => "settling",
            PaymentState::Settled => "settled",
            PaymentState::Failed => "failed",
            PaymentState::Expired => "expired",
            PaymentState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl PaymentState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Settled
                | PaymentState::Failed
                | PaymentState::Expired
                | PaymentState::Cancelled
        )
    }

    /// The states legally reachable from this one.
    pub fn successors(&self) -> &'static [PaymentState] {
        match self {
            PaymentState::Pending => &[
                PaymentState::Verifying,
                PaymentState::Expired,
                PaymentState::Cancelled,
            ],
            PaymentState::Verifying => &[
                PaymentState::Verified,
                PaymentState::Failed,
                PaymentState::Expired,
            ],
            PaymentState::Verified => &[PaymentState::Settling],
            PaymentState::Settling => &[PaymentState::Settled, PaymentState::Failed],
            PaymentState::Settled
            | PaymentState::Failed
            | PaymentState::Expired
            | PaymentState::Cancelled => &[],
        }
    }

    /// Whether `next` is legally reachable from this state.
    pub fn can_transition_to(&self, next: PaymentState) -> bool {
        self.successors().contains(&next)
    }
}

/// Error returned on an attempt to move a payment along an edge that is not
/// in the adjacency table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal payment state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PaymentState,
    pub to: PaymentState,
}

/// One payment's lifetime, from issued requirements to a terminal state.
///
/// Mutation happens only through [`PaymentRecord::transition`] and the
/// attach/annotate helpers, which keeps the audit trail consistent: the state
/// and the `updated_at` timestamp always move together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    requirements: PaymentRequirements,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<PaymentPayload>,
    state: PaymentState,
    created_at: UnixTimestamp,
    updated_at: UnixTimestamp,
    /// Transaction reference reported by the facilitator on settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<String>,
    /// Failure reason, for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PaymentRecord {
    /// Opens a record in `Pending` for freshly issued requirements.
    pub fn new(requirements: PaymentRequirements) -> Self {
        let now = UnixTimestamp::now();
        Self {
            requirements,
            payload: None,
            state: PaymentState::Pending,
            created_at: now,
            updated_at: now,
            transaction: None,
            error: None,
        }
    }

    pub fn state(&self) -> PaymentState {
        self.state
    }

    pub fn requirements(&self) -> &PaymentRequirements {
        &self.requirements
    }

    pub fn payload(&self) -> Option<&PaymentPayload> {
        self.payload.as_ref()
    }

    pub fn created_at(&self) -> UnixTimestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> UnixTimestamp {
        self.updated_at
    }

    pub fn transaction(&self) -> Option<&str> {
        self.transaction.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Moves the payment to `next`, enforcing the adjacency table.
    pub fn transition(&mut self, next: PaymentState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = UnixTimestamp::now();
        Ok(())
    }

    /// Binds the client-submitted payload to this record.
    pub fn attach_payload(&mut self, payload: PaymentPayload) {
        self.payload = Some(payload);
        self.updated_at = UnixTimestamp::now();
    }

    /// Records the settlement transaction reference.
    pub fn set_transaction(&mut self, transaction: impl Into<String>) {
        self.transaction = Some(transaction.into());
        self.updated_at = UnixTimestamp::now();
    }

    /// Records a failure reason.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.updated_at = UnixTimestamp::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::types::{MixedAddress, Scheme, TokenAmount};
    use url::Url;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: Scheme::Exact,
            network: Network::BaseSepolia,
            max_amount_required: TokenAmount::from(1_000_000u64),
            resource: Url::parse("https://example.com/paid").unwrap(),
            description: "".to_string(),
            mime_type: "application/json".to_string(),
            output_schema: None,
            pay_to: MixedAddress::Evm(
                "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap(),
            ),
            max_timeout_seconds: 300,
            asset: MixedAddress::Evm(
                "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
            ),
            extra: None,
        }
    }

    #[test]
    fn walks_the_happy_path() {
        let mut record = PaymentRecord::new(requirements());
        assert_eq!(record.state(), PaymentState::Pending);
        record.transition(PaymentState::Verifying).unwrap();
        record.transition(PaymentState::Verified).unwrap();
        record.transition(PaymentState::Settling).unwrap();
        record.transition(PaymentState::Settled).unwrap();
        assert!(record.state().is_terminal());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut record = PaymentRecord::new(requirements());
        let err = record.transition(PaymentState::Settled).unwrap_err();
        assert_eq!(err.from, PaymentState::Pending);
        assert_eq!(err.to, PaymentState::Settled);
        // State is untouched after a rejected transition.
        assert_eq!(record.state(), PaymentState::Pending);
    }

    #[test]
    fn terminal_states_are_frozen() {
        let mut record = PaymentRecord::new(requirements());
        record.transition(PaymentState::Cancelled).unwrap();
        for next in [
            PaymentState::Pending,
            PaymentState::Verifying,
            PaymentState::Settled,
        ] {
            assert!(record.transition(next).is_err());
        }
    }

    #[test]
    fn pending_can_expire_or_cancel() {
        let mut expired = PaymentRecord::new(requirements());
        expired.transition(PaymentState::Expired).unwrap();
        let mut cancelled = PaymentRecord::new(requirements());
        cancelled.transition(PaymentState::Cancelled).unwrap();
    }

    #[test]
    fn verified_cannot_skip_to_settled() {
        let mut record = PaymentRecord::new(requirements());
        record.transition(PaymentState::Verifying).unwrap();
        record.transition(PaymentState::Verified).unwrap();
        assert!(record.transition(PaymentState::Settled).is_err());
    }
}
