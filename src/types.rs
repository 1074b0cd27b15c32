//! Wire and domain types for the x402 payment protocol, resource-server side.
//!
//! This module defines the payload a client submits in the `X-Payment` header,
//! the requirements a payment-gated endpoint declares, the verify/settle
//! messages exchanged with a facilitator, and the `402 Payment Required`
//! response body.
//!
//! Payloads come in two variants, dispatched by network family:
//! an account-based authorization (signed transfer-with-authorization
//! structure) or a transaction-based authorization (opaque partially-signed
//! transaction blob completed by the facilitator).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use http::{HeaderMap, HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{VecSkipError, serde_as};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Add;
use std::str::FromStr;
use std::time::SystemTime;
use url::Url;

use crate::network::{Network, NetworkFamily};
use crate::validator;

/// The HTTP request header carrying a base64-encoded [`PaymentPayload`].
pub const PAYMENT_HEADER: &str = "X-Payment";

/// The HTTP response header carrying a base64-encoded [`SettleResponse`].
pub const PAYMENT_RESPONSE_HEADER: &str = "X-Payment-Response";

/// The HTTP response header advertising accepted payment schemes on a 402.
pub const PAYMENT_ACCEPT_HEADER: &str = "X-Payment-Accept";

/// Protocol versions. Only version 1 is defined by this implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum X402Version {
    #[default]
    V1,
}

impl Display for X402Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            X402Version::V1 => write!(f, "1"),
        }
    }
}

/// Error returned when an unsupported protocol version number is encountered.
#[derive(Debug, thiserror::Error)]
#[error("Unsupported x402 version: {0}")]
pub struct X402VersionError(pub u8);

impl TryFrom<u8> for X402Version {
    type Error = X402VersionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(X402Version::V1),
            other => Err(X402VersionError(other)),
        }
    }
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            X402Version::V1 => serializer.serialize_u8(1),
        }
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        X402Version::try_from(num).map_err(serde::de::Error::custom)
    }
}

/// Enumerates payment schemes. Only "exact" is supported in this
/// implementation, meaning the authorized amount must match the required
/// amount exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scheme::Exact => "exact",
        };
        write!(f, "{}", s)
    }
}

/// Represents an EVM address.
///
/// Wrapper around [`alloy_primitives::Address`], providing display and
/// serialization support. Equality is byte-level, so differing hex
/// capitalization of the same address compares equal. Serialized as the
/// EIP-55 checksummed string.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct EvmAddress(pub alloy_primitives::Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

impl Serialize for EvmAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_checksum(None))
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode EVM address")]
pub struct EvmAddressDecodingError;

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address =
            alloy_primitives::Address::from_str(s).map_err(|_| EvmAddressDecodingError)?;
        Ok(Self(address))
    }
}

impl From<alloy_primitives::Address> for EvmAddress {
    fn from(address: alloy_primitives::Address) -> Self {
        EvmAddress(address)
    }
}

static BASE58_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("Invalid base58 regex"));

/// Represents either an EVM address (`0x...`) or a base58 account address on
/// a transaction-based network. The format is validated on deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixedAddress {
    /// EVM address.
    Evm(EvmAddress),
    /// Base58 address, 32–44 characters excluding ambiguous glyphs.
    Base58(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MixedAddressError {
    #[error("Not an EVM address")]
    NotEvmAddress,
    #[error("Invalid address format")]
    InvalidAddressFormat,
}

impl MixedAddress {
    /// Parses an address string according to the network's family.
    pub fn parse(s: &str, network: Network) -> Result<Self, MixedAddressError> {
        match network.family() {
            NetworkFamily::Account => EvmAddress::from_str(s)
                .map(MixedAddress::Evm)
                .map_err(|_| MixedAddressError::InvalidAddressFormat),
            NetworkFamily::Transaction => {
                if BASE58_ADDRESS_REGEX.is_match(s) {
                    Ok(MixedAddress::Base58(s.to_string()))
                } else {
                    Err(MixedAddressError::InvalidAddressFormat)
                }
            }
        }
    }
}

impl From<EvmAddress> for MixedAddress {
    fn from(address: EvmAddress) -> Self {
        MixedAddress::Evm(address)
    }
}

impl TryFrom<MixedAddress> for EvmAddress {
    type Error = MixedAddressError;

    fn try_from(value: MixedAddress) -> Result<Self, Self::Error> {
        match value {
            MixedAddress::Evm(address) => Ok(address),
            MixedAddress::Base58(_) => Err(MixedAddressError::NotEvmAddress),
        }
    }
}

impl Display for MixedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MixedAddress::Evm(address) => write!(f, "{}", address),
            MixedAddress::Base58(address) => write!(f, "{}", address),
        }
    }
}

impl<'de> Deserialize<'de> for MixedAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(address) = EvmAddress::from_str(&s) {
            return Ok(MixedAddress::Evm(address));
        }
        if BASE58_ADDRESS_REGEX.is_match(&s) {
            Ok(MixedAddress::Base58(s))
        } else {
            Err(serde::de::Error::custom("Invalid address format"))
        }
    }
}

impl Serialize for MixedAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MixedAddress::Evm(addr) => serializer.serialize_str(&addr.to_string()),
            MixedAddress::Base58(s) => serializer.serialize_str(s),
        }
    }
}

/// Represents a 65-byte EVM signature used in EIP-712 typed data.
/// Serialized as 0x-prefixed hex string with 130 characters.
/// Used to authorize an ERC-3009 transferWithAuthorization.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EvmSignature(0x{})", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        static SIG_REGEX: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("Invalid regex for EVM signature")
        });

        if SIG_REGEX.is_match(&s) {
            let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| {
                serde::de::Error::custom("Failed to decode EVM signature hex string")
            })?;
            let array: [u8; 65] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("Signature must be exactly 65 bytes"))?;
            Ok(EvmSignature(array))
        } else {
            Err(serde::de::Error::custom(
                "Invalid EVM signature format: must be 0x-prefixed and 130 hex chars",
            ))
        }
    }
}

impl Serialize for EvmSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let hex_string = format!("0x{}", hex::encode(self.0));
        serializer.serialize_str(&hex_string)
    }
}

/// Represents a 32-byte random nonce, hex-encoded with 0x prefix.
/// Must be exactly 64 hex characters long.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HexEncodedNonce(pub [u8; 32]);

impl HexEncodedNonce {
    /// The canonical `0x`-prefixed lowercase hex rendering of this nonce.
    pub fn as_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl Debug for HexEncodedNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "HexEncodedNonce(0x{})", hex::encode(self.0))
    }
}

impl Display for HexEncodedNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if !validator::is_valid_nonce(&s) {
            return Err(serde::de::Error::custom("Invalid nonce format"));
        }
        let bytes =
            hex::decode(&s[2..]).map_err(|_| serde::de::Error::custom("Invalid hex in nonce"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length for nonce"))?;
        Ok(HexEncodedNonce(array))
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.as_hex())
    }
}

/// A Unix timestamp represented as a `u64`, used in payment authorization windows.
///
/// This type encodes the number of seconds since the Unix epoch
/// (1970-01-01T00:00:00Z). It bounds the validity window (`validAfter` and
/// `validBefore`) of a payment authorization.
///
/// Serialized as a stringified integer to avoid loss of precision in JSON.
/// For example, `1699999999` becomes `"1699999999"` in the wire format.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct UnixTimestamp(pub u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ts = s
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer"))?;
        Ok(UnixTimestamp(ts))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Seconds until `other`, saturating at zero when `other` is in the past.
    pub fn seconds_until(&self, other: UnixTimestamp) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

/// A precise on-chain token amount in base units (e.g., USDC with 6 decimals).
///
/// Serialized as a canonical decimal string in JSON to prevent precision
/// loss; deserialization applies the strict rules of
/// [`validator::parse_uint256`] (no leading zeros, 2^256 − 1 ceiling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub alloy_primitives::U256);

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(alloy_primitives::U256::from(value))
    }
}

impl FromStr for TokenAmount {
    type Err = validator::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validator::parse_uint256(s).map(TokenAmount)
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<TokenAmount>().map_err(serde::de::Error::custom)
    }
}

/// EIP-712 structured data for ERC-3009-based authorization.
/// Defines who can transfer how much and when.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

/// Full payload required to authorize a transfer on an account-based network:
/// the signature and the EIP-712 struct it signs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub signature: EvmSignature,
    pub authorization: AccountAuthorization,
}

/// Opaque partially-signed transaction for a transaction-based network,
/// base64-encoded. Completed and broadcast by the facilitator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub transaction: String,
}

impl TransactionPayload {
    /// Decodes the transaction blob. Only structure is checked locally;
    /// full validation belongs to the facilitator.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(self.transaction.as_bytes())
    }
}

/// Scheme-specific payload, dispatched by network family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExactPayload {
    /// Signed transfer authorization for account-based networks.
    Account(AccountPayload),
    /// Opaque signed transaction blob for transaction-based networks.
    Transaction(TransactionPayload),
}

impl ExactPayload {
    /// The network family this payload variant belongs to.
    pub fn family(&self) -> NetworkFamily {
        match self {
            ExactPayload::Account(_) => NetworkFamily::Account,
            ExactPayload::Transaction(_) => NetworkFamily::Transaction,
        }
    }

    /// The account authorization, if this is an account-based payload.
    pub fn as_account(&self) -> Option<&AccountPayload> {
        match self {
            ExactPayload::Account(payload) => Some(payload),
            ExactPayload::Transaction(_) => None,
        }
    }
}

/// Describes a signed request to transfer a specific amount of funds.
/// Includes the scheme, network, and signed payload contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version,
    pub scheme: Scheme,
    pub network: Network,
    pub payload: ExactPayload,
}

/// Error returned when decoding an `X-Payment` header into a
/// [`PaymentPayload`] fails, at any of the base64, JSON, or structural stages.
#[derive(Debug, thiserror::Error)]
pub enum PaymentHeaderError {
    /// The input bytes were not valid base64.
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    /// The JSON structure was invalid or did not conform to [`PaymentPayload`].
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload variant does not belong to the declared network family.
    #[error("payload variant does not match network {network}")]
    PayloadFamilyMismatch { network: Network },
    /// A transaction-based payload carried an empty transaction blob.
    #[error("empty transaction blob")]
    EmptyTransaction,
    /// A transaction-based payload carried a non-base64 transaction blob.
    #[error("malformed transaction blob")]
    MalformedTransaction,
}

impl PaymentPayload {
    /// Decodes and structurally validates a payment header.
    ///
    /// Stages: base64 decode, JSON parse, then structural checks — the payload
    /// variant must belong to the declared network's family, and a
    /// transaction blob must be non-empty valid base64.
    pub fn from_header(header: &[u8]) -> Result<Self, PaymentHeaderError> {
        let decoded = Base64Bytes::from(header).decode()?;
        let payload: PaymentPayload = serde_json::from_slice(&decoded)?;
        if payload.payload.family() != payload.network.family() {
            return Err(PaymentHeaderError::PayloadFamilyMismatch {
                network: payload.network,
            });
        }
        if let ExactPayload::Transaction(transaction) = &payload.payload {
            if transaction.transaction.is_empty() {
                return Err(PaymentHeaderError::EmptyTransaction);
            }
            transaction
                .decode()
                .map_err(|_| PaymentHeaderError::MalformedTransaction)?;
        }
        Ok(payload)
    }

    /// Encodes this payload into `X-Payment` header bytes.
    ///
    /// Round-trips losslessly through [`PaymentPayload::from_header`] for all
    /// defined fields.
    pub fn to_header(&self) -> Result<Base64Bytes<'static>, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(Base64Bytes::encode(json))
    }
}

/// Requirements set by the payment-gated endpoint for an acceptable payment.
///
/// Immutable once created; construct through
/// [`PaymentGate::create_requirements`](crate::handler::PaymentGate::create_requirements)
/// so that inputs are validated and sanitized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: Scheme,
    pub network: Network,
    pub max_amount_required: TokenAmount,
    pub resource: Url,
    pub description: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub pay_to: MixedAddress,
    pub max_timeout_seconds: u64,
    pub asset: MixedAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl PaymentRequirements {
    /// Looks up a string-valued scheme parameter in `extra`.
    pub fn domain_parameter(&self, key: &str) -> Option<&str> {
        self.extra.as_ref()?.get(key)?.as_str()
    }
}

/// Raw, not-yet-validated payment terms for a protected resource.
///
/// Turned into [`PaymentRequirements`] by
/// [`PaymentGate::create_requirements`](crate::handler::PaymentGate::create_requirements),
/// which validates addresses and amounts and sanitizes free-form text.
#[derive(Debug, Clone)]
pub struct PriceTag {
    /// The recipient address.
    pub pay_to: String,
    /// The token asset address.
    pub asset: String,
    /// The network name.
    pub network: Network,
    /// The payment amount in token base units.
    pub amount: String,
    /// Maximum time in seconds for payment validity.
    pub max_timeout_seconds: u64,
    /// Scheme-specific extra data (e.g., EIP-712 domain name/version).
    pub extra: Option<serde_json::Value>,
}

/// Wrapper for a payment header and requirements sent to a facilitator
/// to be verified.
///
/// The payment travels in its wire form (the base64 `X-Payment` header
/// value); the facilitator decodes and fully validates it itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: X402Version,
    pub payment_header: String,
    pub payment_requirements: PaymentRequirements,
}

/// Wrapper for a payment header and requirements sent to a facilitator
/// to be settled.
pub type SettleRequest = VerifyRequest;

/// Result returned by a facilitator after verifying a [`PaymentPayload`]
/// against the provided [`PaymentRequirements`].
///
/// This response indicates whether the payment authorization is valid and
/// identifies the payer. If invalid, it includes a reason describing why
/// verification failed (e.g., wrong network, an invalid scheme, insufficient
/// funds).
#[derive(Debug, Clone)]
pub enum VerifyResponse {
    /// The payload matches the requirements and passes all checks.
    Valid { payer: Option<MixedAddress> },
    /// The payload was well-formed but failed verification for the given reason.
    Invalid {
        reason: String,
        payer: Option<MixedAddress>,
    },
}

impl VerifyResponse {
    /// Constructs a successful verification response with the given `payer` address.
    pub fn valid(payer: Option<MixedAddress>) -> Self {
        VerifyResponse::Valid { payer }
    }

    /// Constructs a failed verification response with the given error `reason`.
    pub fn invalid(payer: Option<MixedAddress>, reason: impl Into<String>) -> Self {
        VerifyResponse::Invalid {
            reason: reason.into(),
            payer,
        }
    }
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = match self {
            VerifyResponse::Valid { .. } => serializer.serialize_struct("VerifyResponse", 2)?,
            VerifyResponse::Invalid { .. } => serializer.serialize_struct("VerifyResponse", 3)?,
        };
        match self {
            VerifyResponse::Valid { payer } => {
                s.serialize_field("isValid", &true)?;
                s.serialize_field("payer", payer)?;
            }
            VerifyResponse::Invalid { reason, payer } => {
                s.serialize_field("isValid", &false)?;
                s.serialize_field("invalidReason", reason)?;
                s.serialize_field("payer", payer)?;
            }
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            is_valid: bool,
            #[serde(default)]
            payer: Option<MixedAddress>,
            #[serde(default)]
            invalid_reason: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        match (raw.is_valid, raw.invalid_reason) {
            (true, None) => Ok(VerifyResponse::Valid { payer: raw.payer }),
            (false, Some(reason)) => Ok(VerifyResponse::Invalid {
                payer: raw.payer,
                reason,
            }),
            (true, Some(_)) => Err(serde::de::Error::custom(
                "`invalidReason` must be absent when `isValid` is true",
            )),
            (false, None) => Err(serde::de::Error::custom(
                "`invalidReason` must be present when `isValid` is false",
            )),
        }
    }
}

/// Returned from a facilitator after attempting to settle a payment on-chain.
/// Indicates success/failure, transaction reference, and payer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<MixedAddress>,
    /// Transaction reference: a 0x hash on account-based networks, a base58
    /// signature on transaction-based ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Error returned when encoding a [`SettleResponse`] into a response header fails.
#[derive(Debug, thiserror::Error)]
#[error("Failed to encode settle response header: {0}")]
pub struct SettleResponseEncodingError(String);

impl SettleResponse {
    /// Encodes this settlement result as the `X-Payment-Response` header value
    /// (base64 of the JSON body).
    pub fn to_header(&self) -> Result<HeaderValue, SettleResponseEncodingError> {
        let json =
            serde_json::to_vec(self).map_err(|e| SettleResponseEncodingError(e.to_string()))?;
        let encoded = Base64Bytes::encode(json);
        HeaderValue::from_bytes(encoded.as_ref())
            .map_err(|e| SettleResponseEncodingError(e.to_string()))
    }
}

/// Response from a facilitator's `GET /supported` endpoint: the protocol
/// version, networks, and schemes it can verify and settle, plus free-form
/// feature flags.
///
/// Unknown networks or schemes advertised by a newer facilitator are skipped
/// rather than failing the whole response.
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    #[serde(default)]
    pub version: u8,
    #[serde_as(as = "VecSkipError<_>")]
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde_as(as = "VecSkipError<_>")]
    #[serde(default)]
    pub schemes: Vec<Scheme>,
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,
}

/// HTTP 402 Payment Required response body.
///
/// Returned when a resource requires payment, listing the acceptable payment
/// requirements. [`PaymentRequired::to_http_parts`] renders the status code,
/// headers (`WWW-Authenticate`, `Content-Type`, `X-Payment-Accept`), and JSON
/// body for the embedding HTTP stack to emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version,
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRequired {
    /// Creates a 402 body accepting the given payment requirements.
    pub fn new(accepts: Vec<PaymentRequirements>) -> Self {
        Self {
            x402_version: X402Version::V1,
            accepts,
            error: None,
        }
    }

    /// Attaches an error message describing why the submitted payment, if
    /// any, was rejected.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Renders the status code, headers, and JSON body of the 402 response.
    pub fn to_http_parts(&self) -> Result<(StatusCode, HeaderMap, String), serde_json::Error> {
        let mut schemes: Vec<String> = self
            .accepts
            .iter()
            .map(|requirements| requirements.scheme.to_string())
            .collect();
        schemes.dedup();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static(PAYMENT_HEADER),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            PAYMENT_ACCEPT_HEADER,
            HeaderValue::from_str(&schemes.join(","))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        let body = serde_json::to_string(self)?;
        Ok((StatusCode::PAYMENT_REQUIRED, headers, body))
    }
}

/// Contains bytes of base64 encoded some other bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes<'a>(pub Cow<'a, [u8]>);

impl Base64Bytes<'_> {
    /// Decode base64 string bytes to raw binary payload.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(&self.0)
    }

    /// Encode raw binary input into base64 string bytes.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Base64Bytes<'static> {
        let encoded = b64.encode(input.as_ref());
        Base64Bytes(Cow::Owned(encoded.into_bytes()))
    }
}

impl AsRef<[u8]> for Base64Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> From<&'a [u8]> for Base64Bytes<'a> {
    fn from(slice: &'a [u8]) -> Self {
        Base64Bytes(Cow::Borrowed(slice))
    }
}

impl Display for Base64Bytes<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account_payload_json() -> serde_json::Value {
        json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base-sepolia",
            "payload": {
                "signature": format!("0x{}", "ab".repeat(65)),
                "authorization": {
                    "from": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
                    "to": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                    "value": "1000000",
                    "validAfter": "1740672089",
                    "validBefore": "1740672154",
                    "nonce": format!("0x{}", "f3".repeat(32)),
                }
            }
        })
    }

    #[test]
    fn decodes_account_payment_header() {
        let bytes = serde_json::to_vec(&account_payload_json()).unwrap();
        let header = Base64Bytes::encode(bytes);
        let payload = PaymentPayload::from_header(header.as_ref()).unwrap();
        assert_eq!(payload.scheme, Scheme::Exact);
        assert_eq!(payload.network, Network::BaseSepolia);
        let account = payload.payload.as_account().unwrap();
        assert_eq!(account.authorization.value, TokenAmount::from(1_000_000u64));
    }

    #[test]
    fn header_round_trip_is_lossless() {
        let bytes = serde_json::to_vec(&account_payload_json()).unwrap();
        let header = Base64Bytes::encode(bytes);
        let payload = PaymentPayload::from_header(header.as_ref()).unwrap();
        let reencoded = payload.to_header().unwrap();
        let reparsed = PaymentPayload::from_header(reencoded.as_ref()).unwrap();
        let account = reparsed.payload.as_account().unwrap();
        assert_eq!(
            account.authorization.nonce,
            payload.payload.as_account().unwrap().authorization.nonce
        );
    }

    #[test]
    fn rejects_garbage_header() {
        assert!(matches!(
            PaymentPayload::from_header(b"!!! not base64 !!!"),
            Err(PaymentHeaderError::Base64Decode(_))
        ));
        let header = Base64Bytes::encode(b"{\"not\": \"a payload\"}");
        assert!(matches!(
            PaymentPayload::from_header(header.as_ref()),
            Err(PaymentHeaderError::Json(_))
        ));
    }

    #[test]
    fn rejects_account_payload_on_transaction_network() {
        let mut value = account_payload_json();
        value["network"] = json!("solana");
        let bytes = serde_json::to_vec(&value).unwrap();
        let header = Base64Bytes::encode(bytes);
        assert!(matches!(
            PaymentPayload::from_header(header.as_ref()),
            Err(PaymentHeaderError::PayloadFamilyMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_transaction_blob() {
        let value = json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "solana",
            "payload": { "transaction": "" }
        });
        let bytes = serde_json::to_vec(&value).unwrap();
        let header = Base64Bytes::encode(bytes);
        assert!(matches!(
            PaymentPayload::from_header(header.as_ref()),
            Err(PaymentHeaderError::EmptyTransaction)
        ));
    }

    #[test]
    fn rejects_padded_amount_strings() {
        let mut value = account_payload_json();
        value["payload"]["authorization"]["value"] = json!("007");
        let bytes = serde_json::to_vec(&value).unwrap();
        let header = Base64Bytes::encode(bytes);
        assert!(PaymentPayload::from_header(header.as_ref()).is_err());
    }

    #[test]
    fn evm_addresses_compare_case_insensitively() {
        let lower: EvmAddress = "0x857b06519e91e3a54538791bdbb0e22373e36b66"
            .parse()
            .unwrap();
        let checksummed: EvmAddress = "0x857b06519E91e3A54538791bDbb0E22373e36b66"
            .parse()
            .unwrap();
        assert_eq!(lower, checksummed);
    }

    #[test]
    fn parses_verify_response_variants() {
        let valid: VerifyResponse = serde_json::from_value(json!({
            "isValid": true,
            "payer": "0x857b06519E91e3A54538791bDbb0E22373e36b66"
        }))
        .unwrap();
        assert!(matches!(valid, VerifyResponse::Valid { .. }));

        let invalid: VerifyResponse = serde_json::from_value(json!({
            "isValid": false,
            "invalidReason": "insufficient_funds"
        }))
        .unwrap();
        match invalid {
            VerifyResponse::Invalid { reason, payer } => {
                assert_eq!(reason, "insufficient_funds");
                assert!(payer.is_none());
            }
            VerifyResponse::Valid { .. } => panic!("expected invalid"),
        }

        let inconsistent = serde_json::from_value::<VerifyResponse>(json!({ "isValid": false }));
        assert!(inconsistent.is_err());
    }

    #[test]
    fn supported_response_skips_unknown_entries() {
        let supported: SupportedResponse = serde_json::from_value(json!({
            "version": 1,
            "networks": ["base", "some-future-network", "solana"],
            "schemes": ["exact", "upto"],
            "features": { "batchSettlement": false }
        }))
        .unwrap();
        assert_eq!(supported.networks, vec![Network::Base, Network::Solana]);
        assert_eq!(supported.schemes, vec![Scheme::Exact]);
    }

    #[test]
    fn payment_required_renders_http_parts() {
        let requirements = PaymentRequirements {
            scheme: Scheme::Exact,
            network: Network::Base,
            max_amount_required: TokenAmount::from(1_000_000u64),
            resource: Url::parse("https://example.com/paid").unwrap(),
            description: "Paid resource".to_string(),
            mime_type: "application/json".to_string(),
            output_schema: None,
            pay_to: MixedAddress::Evm(
                "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap(),
            ),
            max_timeout_seconds: 300,
            asset: MixedAddress::Evm(
                "0x036CbD53842c5426634e7929541eC2318f3dCF7e".parse().unwrap(),
            ),
            extra: Some(json!({"name": "USDC", "version": "2"})),
        };
        let (status, headers, body) = PaymentRequired::new(vec![requirements])
            .with_error("X-Payment header is required")
            .to_http_parts()
            .unwrap();
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(headers.get(http::header::WWW_AUTHENTICATE).unwrap(), "X-Payment");
        assert_eq!(headers.get(PAYMENT_ACCEPT_HEADER).unwrap(), "exact");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["x402Version"], 1);
        assert_eq!(parsed["accepts"][0]["maxAmountRequired"], "1000000");
        assert_eq!(parsed["error"], "X-Payment header is required");
    }
}
