//! Canonical bridge types
//!
//! `BridgeIntent` is the single record that travels from a chain watcher,
//! through the relay queue, into the swap executor and finally the ledger.
//! Both watchers produce exactly this shape; nothing chain-specific leaks
//! past the watcher boundary.

use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Networks the bridge holds a vault on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "STELLAR")]
    Stellar,
    #[serde(rename = "ETH")]
    Eth,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Stellar, Network::Eth];

    /// Wire name used in memos, queue messages and the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Stellar => "STELLAR",
            Network::Eth => "ETH",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STELLAR" => Ok(Network::Stellar),
            "ETH" => Ok(Network::Eth),
            other => Err(eyre!("Unknown network: {}", other)),
        }
    }
}

/// Terminal outcome of an intent. Absent until the executor resolves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Deposit could not be routed or validated; kept as bridge liquidity
    LiquidityAdded,
    /// Payout submitted on the destination chain
    Swap,
    /// Payout attempted and rejected
    FailedSwap,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::LiquidityAdded => "liquidity_added",
            TxStatus::Swap => "swap",
            TxStatus::FailedSwap => "failed_swap",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "liquidity_added" => Ok(TxStatus::LiquidityAdded),
            "swap" => Ok(TxStatus::Swap),
            "failed_swap" => Ok(TxStatus::FailedSwap),
            other => Err(eyre!("Unknown tx status: {}", other)),
        }
    }
}

/// Destination decoded from a deposit memo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub to_network: Network,
    pub to_asset_code: String,
    pub to_asset_issuer: String,
    pub to_address: String,
}

/// A requested cross-chain transfer, from detection to terminal outcome.
///
/// The `from_*` fields are fixed by the watcher, the `to_*` routing fields
/// by the memo router. `to_amount`, `to_tx_hash`, `tx_status` and `tx_fee`
/// are written once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeIntent {
    pub from_network: Network,
    pub from_address: String,
    #[serde(default)]
    pub from_asset_code: Option<String>,
    #[serde(default)]
    pub from_asset_issuer: Option<String>,
    #[serde(default)]
    pub from_amount: Option<BigDecimal>,
    pub from_tx_hash: String,

    #[serde(default)]
    pub to_network: Option<Network>,
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default)]
    pub to_asset_code: Option<String>,
    #[serde(default)]
    pub to_asset_issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_amount: Option<BigDecimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_tx_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_status: Option<TxStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_fee: Option<BigDecimal>,
}

impl BridgeIntent {
    /// Fresh intent for a deposit observed on `from_network`, not yet routed
    pub fn new(from_network: Network, from_address: String, from_tx_hash: String) -> Self {
        Self {
            from_network,
            from_address,
            from_asset_code: None,
            from_asset_issuer: None,
            from_amount: None,
            from_tx_hash,
            to_network: None,
            to_address: None,
            to_asset_code: None,
            to_asset_issuer: None,
            to_amount: None,
            to_tx_hash: None,
            tx_status: None,
            tx_fee: None,
        }
    }

    /// Attach the decoded destination. `None` leaves every routing field empty.
    pub fn with_route(mut self, route: Option<Route>) -> Self {
        if let Some(route) = route {
            self.to_network = Some(route.to_network);
            self.to_asset_code = Some(route.to_asset_code);
            self.to_asset_issuer = Some(route.to_asset_issuer);
            self.to_address = Some(route.to_address);
        }
        self
    }

    /// All routing fields, if the memo produced a complete destination
    pub fn route(&self) -> Option<Route> {
        Some(Route {
            to_network: self.to_network?,
            to_asset_code: self.to_asset_code.clone().filter(|s| !s.is_empty())?,
            to_asset_issuer: self.to_asset_issuer.clone().filter(|s| !s.is_empty())?,
            to_address: self.to_address.clone().filter(|s| !s.is_empty())?,
        })
    }

    /// Whether the executor has already resolved this intent
    pub fn is_terminal(&self) -> bool {
        self.tx_status.is_some()
    }
}

/// Integer base units of `amount` at `decimals` places. Precision beyond
/// `decimals` is truncated, never rounded up.
pub fn to_base_units(amount: &BigDecimal, decimals: u32) -> BigInt {
    let (units, _) = amount.with_scale(decimals as i64).into_bigint_and_exponent();
    units
}

/// Decimal amount of `units` base units at `decimals` places
pub fn from_base_units(units: BigInt, decimals: u32) -> BigDecimal {
    BigDecimal::new(units, decimals as i64)
}
