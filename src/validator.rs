//! Pure validation and sanitization helpers.
//!
//! Every function in this module is side-effect free: format checks for
//! addresses and nonces, strict unsigned-integer string parsing with a
//! 2^256−1 ceiling, overflow-safe amount arithmetic, and string/URL
//! sanitization. Failures carry a stable machine-readable [`ValidationCode`]
//! so callers can branch without matching on error text.

use alloy_primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use url::Url;

use crate::network::{Network, NetworkFamily};

/// 2^256 − 1 in decimal, 78 digits. Uint strings longer than this are out of range.
const UINT256_MAX_DECIMAL: &str =
    "115792089237316195423570985008687907853269984665640564039457584007913129639935";

static EVM_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Invalid regex for EVM address"));

/// Base58 without the ambiguous glyphs 0, O, I, l.
static BASE58_ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("Invalid base58 regex"));

static NONCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Invalid nonce regex"));

/// Machine-readable reason codes for validation failures.
///
/// Serialized as snake_case strings on the wire so clients can branch
/// programmatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// The address does not match the format required by the network.
    InvalidAddress,
    /// The string is not a canonical unsigned decimal integer.
    InvalidUint,
    /// The value exceeds 2^256 − 1.
    Overflow,
    /// The nonce is not `0x` followed by 64 hex characters.
    InvalidNonce,
    /// The URL could not be parsed.
    MalformedUrl,
    /// The URL scheme is not http or https.
    ForbiddenUrlScheme,
    /// A required EIP-712 domain parameter is absent.
    MissingDomainParameter,
}

impl Display for ValidationCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationCode::InvalidAddress => "invalid_address",
            ValidationCode::InvalidUint => "invalid_uint",
            ValidationCode::Overflow => "overflow",
            ValidationCode::InvalidNonce => "invalid_nonce",
            ValidationCode::MalformedUrl => "malformed_url",
            ValidationCode::ForbiddenUrlScheme => "forbidden_url_scheme",
            ValidationCode::MissingDomainParameter => "missing_domain_parameter",
        };
        write!(f, "{}", s)
    }
}

/// Malformed or out-of-range input. Recoverable and always local.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The address does not match the format the network requires.
    #[error("Invalid address for network {network}")]
    InvalidAddress { network: Network },
    /// The string is not a canonical unsigned decimal integer.
    #[error("Invalid unsigned integer string")]
    InvalidUint,
    /// Arithmetic result or input exceeds 2^256 − 1.
    #[error("Value exceeds 2^256 - 1")]
    Overflow,
    /// The nonce is not 32 bytes of 0x-prefixed hex.
    #[error("Invalid nonce format")]
    InvalidNonce,
    /// The URL could not be parsed at all.
    #[error("Malformed URL: {0}")]
    MalformedUrl(String),
    /// The URL parses but uses a scheme other than http/https.
    #[error("URL scheme `{0}` is not allowed")]
    ForbiddenUrlScheme(String),
    /// `extra` lacks a domain-separation parameter the scheme requires.
    #[error("Missing required domain parameter `{0}`")]
    MissingDomainParameter(&'static str),
}

impl ValidationError {
    /// The stable reason code for this failure.
    pub fn code(&self) -> ValidationCode {
        match self {
            ValidationError::InvalidAddress { .. } => ValidationCode::InvalidAddress,
            ValidationError::InvalidUint => ValidationCode::InvalidUint,
            ValidationError::Overflow => ValidationCode::Overflow,
            ValidationError::InvalidNonce => ValidationCode::InvalidNonce,
            ValidationError::MalformedUrl(_) => ValidationCode::MalformedUrl,
            ValidationError::ForbiddenUrlScheme(_) => ValidationCode::ForbiddenUrlScheme,
            ValidationError::MissingDomainParameter(_) => ValidationCode::MissingDomainParameter,
        }
    }
}

/// Format-only address check. Does not consult any chain.
///
/// Account-based networks require `0x` + 40 hex characters; transaction-based
/// networks require 32–44 base58 characters excluding ambiguous glyphs.
pub fn is_valid_address(address: &str, network: Network) -> bool {
    match network.family() {
        NetworkFamily::Account => EVM_ADDRESS_REGEX.is_match(address),
        NetworkFamily::Transaction => BASE58_ADDRESS_REGEX.is_match(address),
    }
}

/// Checks that `s` is a canonical unsigned decimal integer no greater than 2^256 − 1.
///
/// Rejects the empty string, non-digit characters, leading zeros (except the
/// literal `"0"`), and any value above the ceiling. The 78-digit boundary is
/// compared lexicographically against the known maximum; ASCII digit order
/// makes that comparison exact for equal-length strings.
pub fn is_valid_uint_string(s: &str) -> bool {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if s.len() > 1 && s.starts_with('0') {
        return false;
    }
    match s.len().cmp(&UINT256_MAX_DECIMAL.len()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => s <= UINT256_MAX_DECIMAL,
        std::cmp::Ordering::Greater => false,
    }
}

/// Parses a canonical unsigned decimal string into a [`U256`].
///
/// Distinguishes malformed strings ([`ValidationError::InvalidUint`]) from
/// well-formed values above the ceiling ([`ValidationError::Overflow`]).
pub fn parse_uint256(s: &str) -> Result<U256, ValidationError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidUint);
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err(ValidationError::InvalidUint);
    }
    if s.len() > UINT256_MAX_DECIMAL.len()
        || (s.len() == UINT256_MAX_DECIMAL.len() && s > UINT256_MAX_DECIMAL)
    {
        return Err(ValidationError::Overflow);
    }
    U256::from_str_radix(s, 10).map_err(|_| ValidationError::InvalidUint)
}

/// Adds two unsigned decimal strings with big-integer semantics.
///
/// Returns the decimal sum, or [`ValidationError::Overflow`] when the result
/// would exceed 2^256 − 1.
pub fn safe_add_uint256(a: &str, b: &str) -> Result<String, ValidationError> {
    let a = parse_uint256(a)?;
    let b = parse_uint256(b)?;
    let sum = a.checked_add(b).ok_or(ValidationError::Overflow)?;
    Ok(sum.to_string())
}

/// Multiplies two unsigned decimal strings with big-integer semantics.
///
/// Returns the decimal product, or [`ValidationError::Overflow`] when the
/// result would exceed 2^256 − 1.
pub fn safe_mul_uint256(a: &str, b: &str) -> Result<String, ValidationError> {
    let a = parse_uint256(a)?;
    let b = parse_uint256(b)?;
    let product = a.checked_mul(b).ok_or(ValidationError::Overflow)?;
    Ok(product.to_string())
}

/// Checks that `s` is exactly `0x` followed by 64 hex characters (32 bytes).
pub fn is_valid_nonce(s: &str) -> bool {
    NONCE_REGEX.is_match(s)
}

/// Strips control characters, truncates to `max_len` characters, and
/// HTML-escapes the remainder.
pub fn sanitize_string(s: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_len));
    for c in s.chars().filter(|c| !c.is_control()).take(max_len) {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Parses a URL and rejects any scheme other than http or https.
pub fn sanitize_url(s: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(s).map_err(|e| ValidationError::MalformedUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::ForbiddenUrlScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_evm_addresses() {
        assert!(is_valid_address(
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045",
            Network::Base
        ));
        assert!(!is_valid_address("0xd8dA6BF2", Network::Base));
        assert!(!is_valid_address(
            "d8dA6BF26964aF9D7eEd9e03E53415D37aA96045",
            Network::Base
        ));
    }

    #[test]
    fn validates_base58_addresses() {
        assert!(is_valid_address(
            "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T",
            Network::Solana
        ));
        // Contains the ambiguous glyph 'O'.
        assert!(!is_valid_address(
            "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDBO",
            Network::Solana
        ));
        assert!(!is_valid_address("tooshort", Network::Solana));
        // EVM format is not acceptable on a transaction-based network.
        assert!(!is_valid_address(
            "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045",
            Network::Solana
        ));
    }

    #[test]
    fn accepts_canonical_uint_strings() {
        assert!(is_valid_uint_string("0"));
        assert!(is_valid_uint_string("1000000"));
        assert!(is_valid_uint_string(UINT256_MAX_DECIMAL));
    }

    #[test]
    fn rejects_non_canonical_uint_strings() {
        assert!(!is_valid_uint_string(""));
        assert!(!is_valid_uint_string("007"));
        assert!(!is_valid_uint_string("-1"));
        assert!(!is_valid_uint_string("12a3"));
        assert!(!is_valid_uint_string("1.5"));
        // 2^256 exactly: one above the ceiling, same digit count.
        assert!(!is_valid_uint_string(
            "115792089237316195423570985008687907853269984665640564039457584007913129639936"
        ));
        // 79 digits.
        assert!(!is_valid_uint_string(&format!("1{}", "0".repeat(78))));
    }

    #[test]
    fn adds_with_overflow_detection() {
        assert_eq!(safe_add_uint256("2", "3").unwrap(), "5");
        let max_minus_one = U256::MAX - U256::from(1u8);
        assert_eq!(
            safe_add_uint256(&max_minus_one.to_string(), "1").unwrap(),
            UINT256_MAX_DECIMAL
        );
        assert_eq!(
            safe_add_uint256(UINT256_MAX_DECIMAL, "1"),
            Err(ValidationError::Overflow)
        );
    }

    #[test]
    fn multiplies_with_overflow_detection() {
        assert_eq!(safe_mul_uint256("1000000", "0").unwrap(), "0");
        assert_eq!(safe_mul_uint256("123456789", "1000").unwrap(), "123456789000");
        assert_eq!(
            safe_mul_uint256(UINT256_MAX_DECIMAL, "2"),
            Err(ValidationError::Overflow)
        );
    }

    #[test]
    fn distinguishes_overflow_from_malformed() {
        assert_eq!(parse_uint256("007"), Err(ValidationError::InvalidUint));
        assert_eq!(
            parse_uint256(
                "115792089237316195423570985008687907853269984665640564039457584007913129639936"
            ),
            Err(ValidationError::Overflow)
        );
    }

    #[test]
    fn validates_nonces() {
        assert!(is_valid_nonce(&format!("0x{}", "ab".repeat(32))));
        assert!(!is_valid_nonce(&format!("0x{}", "ab".repeat(31))));
        assert!(!is_valid_nonce(&"ab".repeat(32)));
        assert!(!is_valid_nonce(&format!("0x{}zz", "ab".repeat(31))));
    }

    #[test]
    fn sanitizes_strings() {
        assert_eq!(
            sanitize_string("<b>bold</b>", 64),
            "&lt;b&gt;bold&lt;/b&gt;"
        );
        assert_eq!(sanitize_string("a\u{0007}b\u{001b}c", 64), "abc");
        assert_eq!(sanitize_string("abcdef", 3), "abc");
    }

    #[test]
    fn sanitizes_urls() {
        assert!(sanitize_url("https://example.com/resource").is_ok());
        assert!(sanitize_url("http://localhost:8080/paid").is_ok());
        assert_eq!(
            sanitize_url("javascript:alert(1)").unwrap_err().code(),
            ValidationCode::ForbiddenUrlScheme
        );
        assert_eq!(
            sanitize_url("not a url").unwrap_err().code(),
            ValidationCode::MalformedUrl
        );
    }
}
