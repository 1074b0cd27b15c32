//! Network definitions and authorization-family classification.
//!
//! This module defines the networks a payment-gated server can accept payments
//! on, and classifies each network by how its payment authorizations are
//! expressed: account-based networks carry a signed transfer authorization,
//! transaction-based networks carry an opaque partially-signed transaction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// How payment authorizations are expressed on a network.
///
/// The family determines which payload variant a client must submit and which
/// address format is valid for recipients and assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFamily {
    /// Pre-signed transfer authorizations (from/to/value/validity window/nonce/signature).
    Account,
    /// Opaque serialized transactions completed and broadcast by the facilitator.
    Transaction,
}

/// Supported networks.
///
/// Used to differentiate between testnet and mainnet environments for the
/// x402 protocol.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Avalanche Fuji testnet (chain ID 43113).
    #[serde(rename = "avalanche-fuji")]
    AvalancheFuji,
    /// Avalanche mainnet (chain ID 43114).
    #[serde(rename = "avalanche")]
    Avalanche,
    /// Polygon Amoy testnet (chain ID 80002).
    #[serde(rename = "polygon-amoy")]
    PolygonAmoy,
    /// Polygon mainnet (chain ID 137).
    #[serde(rename = "polygon")]
    Polygon,
    /// Sei mainnet (chain ID 1329).
    #[serde(rename = "sei")]
    Sei,
    /// Sei testnet (chain ID 1328).
    #[serde(rename = "sei-testnet")]
    SeiTestnet,
    /// Solana mainnet.
    #[serde(rename = "solana")]
    Solana,
    /// Solana devnet.
    #[serde(rename = "solana-devnet")]
    SolanaDevnet,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Network::BaseSepolia => write!(f, "base-sepolia"),
            Network::Base => write!(f, "base"),
            Network::AvalancheFuji => write!(f, "avalanche-fuji"),
            Network::Avalanche => write!(f, "avalanche"),
            Network::PolygonAmoy => write!(f, "polygon-amoy"),
            Network::Polygon => write!(f, "polygon"),
            Network::Sei => write!(f, "sei"),
            Network::SeiTestnet => write!(f, "sei-testnet"),
            Network::Solana => write!(f, "solana"),
            Network::SolanaDevnet => write!(f, "solana-devnet"),
        }
    }
}

/// Error returned when a network name is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("Unknown network: {0}")]
pub struct UnknownNetworkError(pub String);

impl FromStr for Network {
    type Err = UnknownNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::variants()
            .iter()
            .find(|network| network.to_string() == s)
            .copied()
            .ok_or_else(|| UnknownNetworkError(s.to_string()))
    }
}

impl Network {
    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[
            Network::BaseSepolia,
            Network::Base,
            Network::AvalancheFuji,
            Network::Avalanche,
            Network::PolygonAmoy,
            Network::Polygon,
            Network::Sei,
            Network::SeiTestnet,
            Network::Solana,
            Network::SolanaDevnet,
        ]
    }

    /// Returns the authorization family of this network.
    pub fn family(&self) -> NetworkFamily {
        match self {
            Network::BaseSepolia
            | Network::Base
            | Network::AvalancheFuji
            | Network::Avalanche
            | Network::PolygonAmoy
            | Network::Polygon
            | Network::Sei
            | Network::SeiTestnet => NetworkFamily::Account,
            Network::Solana | Network::SolanaDevnet => NetworkFamily::Transaction,
        }
    }
}
