//! Memo decoding and routing
//!
//! A deposit names its destination in a short memo:
//!
//! ```text
//! <asset_code>.<to_network>:<to_address>
//! ```
//!
//! e.g. `USDC.ETH:0xabc...`. The asset code and network may not contain `.`
//! or `:`; the address is everything after the first `:` following the
//! network. Anything else yields no route and the deposit becomes liquidity.

use base64::Engine;

use crate::registry::AssetRegistry;
use crate::types::{Network, Route};

/// Tag that precedes the memo in EVM calldata
pub const EVM_MEMO_TAG: &str = "IONIZE:";

/// Name of the Stellar manage-data entry that carries the memo
pub const STELLAR_MEMO_KEY: &str = "ionize";

/// Raw memo fields before registry resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMemo {
    pub asset_code: String,
    pub network: String,
    pub address: String,
}

impl ParsedMemo {
    /// Render back into memo form
    pub fn to_memo(&self) -> String {
        format!("{}.{}:{}", self.asset_code, self.network, self.address)
    }
}

/// Split a memo into its three fields.
///
/// Equivalent to `^([^.:]+)\.([^.:]+):(.+)$`.
pub fn parse_memo(memo: &str) -> Option<ParsedMemo> {
    let dot = memo.find(['.', ':'])?;
    if dot == 0 || memo.as_bytes()[dot] != b'.' {
        return None;
    }
    let asset_code = &memo[..dot];

    let rest = &memo[dot + 1..];
    let colon = rest.find(['.', ':'])?;
    if colon == 0 || rest.as_bytes()[colon] != b':' {
        return None;
    }
    let network = &rest[..colon];

    let address = &rest[colon + 1..];
    if address.is_empty() || address.contains(['\n', '\r']) {
        return None;
    }

    Some(ParsedMemo {
        asset_code: asset_code.to_string(),
        network: network.to_string(),
        address: address.to_string(),
    })
}

/// Resolves memos into destinations using the asset registry
#[derive(Debug, Clone)]
pub struct MemoRouter {
    registry: AssetRegistry,
}

impl MemoRouter {
    pub fn new(registry: AssetRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    /// Decode `memo` into a full route.
    ///
    /// Returns `None` for a malformed memo, an unknown network, or an asset
    /// the registry does not list on that network.
    pub fn route(&self, memo: &str) -> Option<Route> {
        let parsed = parse_memo(memo)?;
        let to_network: Network = parsed.network.parse().ok()?;
        let issuer = self
            .registry
            .resolve_issuer(to_network, &parsed.asset_code)?;

        Some(Route {
            to_network,
            to_asset_code: parsed.asset_code,
            to_asset_issuer: issuer.to_string(),
            to_address: parsed.address,
        })
    }

    /// Route an optional memo; a missing memo is simply no route
    pub fn route_opt(&self, memo: Option<&str>) -> Option<Route> {
        memo.and_then(|m| self.route(m))
    }
}

/// Memo embedded in EVM transaction input.
///
/// The calldata is read as lossy UTF-8 and everything after the first
/// `IONIZE:` tag is taken, minus the zero padding ABI encoding leaves behind.
pub fn extract_evm_memo(input: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(input);
    let start = text.find(EVM_MEMO_TAG)? + EVM_MEMO_TAG.len();
    let memo = text[start..].trim_end_matches('\0');
    if memo.is_empty() {
        None
    } else {
        Some(memo.to_string())
    }
}

/// Decode the base64 value of a `manage_data` entry into memo text
pub fn decode_manage_data(value: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
