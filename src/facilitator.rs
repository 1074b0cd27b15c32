//! Core trait defining the verification and settlement interface for x402
//! facilitators.
//!
//! Implementors of this trait are responsible for validating payment payloads
//! against payment requirements [`Facilitator::verify`] and executing
//! on-chain transfers [`Facilitator::settle`]. The resource-server pipeline
//! only ever talks to a facilitator through this seam.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::types::{
    SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};

/// Classifies a facilitator failure for the pipeline's error taxonomy.
///
/// The one distinction the pipeline must be able to make is "the facilitator
/// is unreachable" versus "this instance's circuit breaker refused the call".
pub trait FacilitatorFault: Debug + Display + Send + Sync + 'static {
    /// True when the failure is a fast-fail from an open circuit rather than
    /// an actual transport attempt.
    fn is_circuit_open(&self) -> bool {
        false
    }
}

/// Trait defining the asynchronous interface for x402 payment facilitators.
///
/// This interface is implemented by any type that performs cryptographic
/// validation and settlement of payment payloads according to the x402
/// specification.
pub trait Facilitator {
    /// The error type returned by this facilitator.
    type Error: FacilitatorFault;

    /// Verifies a proposed x402 payment payload against a [`VerifyRequest`].
    ///
    /// This includes checking payload integrity, signature validity, balance
    /// sufficiency, network compatibility, and compliance with the declared
    /// payment requirements.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if the facilitator could not be consulted.
    /// A reachable facilitator that judges the payment invalid reports that
    /// through [`VerifyResponse::Invalid`], not through an error.
    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send;

    /// Executes an on-chain x402 settlement for a valid [`SettleRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if the facilitator could not be consulted.
    /// A settlement the facilitator attempted and that failed on-chain is
    /// reported through [`SettleResponse::success`] being false.
    fn settle(
        &self,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send;

    /// Retrieves the payment kinds this facilitator supports.
    fn supported(
        &self,
    ) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send;
}

impl<T: Facilitator> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(request)
    }

    fn settle(
        &self,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, Self::Error>> + Send {
        self.as_ref().settle(request)
    }

    fn supported(
        &self,
    ) -> impl Future<Output = Result<SupportedResponse, Self::Error>> + Send {
        self.as_ref().supported()
    }
}
