//! Static asset registry
//!
//! Maps `(network, asset_code)` to the issuer account (Stellar) or token
//! contract (EVM) and back. The table is fixed per network mode and never
//! changes while the process runs.

use crate::config::NetworkMode;
use crate::types::Network;

/// One whitelisted asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    pub network: Network,
    pub asset_code: String,
    pub issuer: String,
    /// On-chain decimal places of the asset's integer unit
    pub decimals: u32,
}

impl AssetEntry {
    pub fn new(network: Network, asset_code: &str, issuer: &str, decimals: u32) -> Self {
        Self {
            network,
            asset_code: asset_code.to_string(),
            issuer: issuer.to_string(),
            decimals,
        }
    }

    /// Identifier used by the status endpoint, e.g. `USDC.ETH`
    pub fn id(&self) -> String {
        format!("{}.{}", self.asset_code, self.network)
    }
}

/// ERC-20 stablecoins on Ethereum use 6 decimals
pub const EVM_STABLECOIN_DECIMALS: u32 = 6;
/// Stellar amounts have 7 decimal places (stroops)
pub const STELLAR_DECIMALS: u32 = 7;

/// Read-only `(network, asset_code) <-> issuer` table
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    entries: Vec<AssetEntry>,
}

impl AssetRegistry {
    pub fn new(entries: Vec<AssetEntry>) -> Self {
        Self { entries }
    }

    /// The whitelisted assets for the given network mode
    pub fn for_mode(mode: NetworkMode) -> Self {
        let entries = match mode {
            NetworkMode::Testnet => vec![
                AssetEntry::new(
                    Network::Eth,
                    "USDC",
                    "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238",
                    EVM_STABLECOIN_DECIMALS,
                ),
                AssetEntry::new(
                    Network::Eth,
                    "USDT",
                    "0xaA8E23Fb1079EA71e0a56F48a2aA51851D8433D0",
                    EVM_STABLECOIN_DECIMALS,
                ),
                AssetEntry::new(
                    Network::Stellar,
                    "USDC",
                    "GBBD47IF6LWK7P7MDEVSCWR7DPUWV3NY3DTQEVFL4NAT4AQH3ZLLFLA5",
                    STELLAR_DECIMALS,
                ),
            ],
            NetworkMode::Mainnet => vec![
                AssetEntry::new(
                    Network::Eth,
                    "USDC",
                    "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                    EVM_STABLECOIN_DECIMALS,
                ),
                AssetEntry::new(
                    Network::Eth,
                    "USDT",
                    "0xdAC17F958D2ee523a2206206994597C13D831ec7",
                    EVM_STABLECOIN_DECIMALS,
                ),
                AssetEntry::new(
                    Network::Stellar,
                    "USDC",
                    "GA5ZSEJYB37JRC5AVCIA5MOP4RHTM335X2KGX3IHOJAPP5RE34K4KZVN",
                    STELLAR_DECIMALS,
                ),
            ],
        };
        Self::new(entries)
    }

    pub fn entries(&self) -> &[AssetEntry] {
        &self.entries
    }

    fn find(&self, network: Network, asset_code: &str) -> Option<&AssetEntry> {
        self.entries
            .iter()
            .find(|e| e.network == network && e.asset_code == asset_code)
    }

    /// Issuer or contract address of `asset_code` on `network`
    pub fn resolve_issuer(&self, network: Network, asset_code: &str) -> Option<&str> {
        self.find(network, asset_code).map(|e| e.issuer.as_str())
    }

    /// Asset code of the asset issued by `issuer`, on any network.
    ///
    /// EVM addresses come in mixed checksum case, so the comparison ignores case.
    pub fn resolve_asset_code(&self, issuer: &str) -> Option<&str> {
        if issuer.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.issuer.eq_ignore_ascii_case(issuer))
            .map(|e| e.asset_code.as_str())
    }

    /// Whether `issuer` is the registered issuer of `asset_code` on `network`.
    /// EVM contract addresses compare case-insensitively.
    pub fn is_registered(&self, network: Network, asset_code: &str, issuer: &str) -> bool {
        match self.find(network, asset_code) {
            Some(entry) if network == Network::Eth => entry.issuer.eq_ignore_ascii_case(issuer),
            Some(entry) => entry.issuer == issuer,
            None => false,
        }
    }

    /// Decimal places of `asset_code` on `network`
    pub fn decimals(&self, network: Network, asset_code: &str) -> Option<u32> {
        self.find(network, asset_code).map(|e| e.decimals)
    }
}
