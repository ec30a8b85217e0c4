use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::BridgeIntent;

// Amounts are NUMERIC in the database. They are bound as text and cast in the
// query ($1::NUMERIC), and read back with ::TEXT, so rows carry strings.

/// A row of `bridge_intents`
#[derive(Debug, Clone, FromRow)]
pub struct IntentRow {
    pub id: i64,
    pub from_network: String,
    pub from_address: String,
    pub from_asset_code: Option<String>,
    pub from_asset_issuer: Option<String>,
    pub from_amount: Option<String>,
    pub from_tx_hash: String,
    pub to_network: Option<String>,
    pub to_address: Option<String>,
    pub to_asset_code: Option<String>,
    pub to_asset_issuer: Option<String>,
    pub to_amount: Option<String>,
    pub to_tx_hash: Option<String>,
    pub tx_status: String,
    pub tx_fee: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn parse_amount(field: &str, raw: Option<String>) -> Result<Option<BigDecimal>> {
    raw.map(|v| {
        BigDecimal::from_str(&v).wrap_err_with(|| format!("invalid {} in ledger: {}", field, v))
    })
    .transpose()
}

impl TryFrom<IntentRow> for BridgeIntent {
    type Error = eyre::Report;

    fn try_from(row: IntentRow) -> Result<Self> {
        Ok(BridgeIntent {
            from_network: row.from_network.parse()?,
            from_address: row.from_address,
            from_asset_code: row.from_asset_code,
            from_asset_issuer: row.from_asset_issuer,
            from_amount: parse_amount("from_amount", row.from_amount)?,
            from_tx_hash: row.from_tx_hash,
            to_network: row.to_network.map(|n| n.parse()).transpose()?,
            to_address: row.to_address,
            to_asset_code: row.to_asset_code,
            to_asset_issuer: row.to_asset_issuer,
            to_amount: parse_amount("to_amount", row.to_amount)?,
            to_tx_hash: row.to_tx_hash,
            tx_status: Some(row.tx_status.parse()?),
            tx_fee: parse_amount("tx_fee", row.tx_fee)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Network, TxStatus};

    fn row() -> IntentRow {
        IntentRow {
            id: 1,
            from_network: "STELLAR".to_string(),
            from_address: "GFROM".to_string(),
            from_asset_code: Some("USDC".to_string()),
            from_asset_issuer: Some("GISSUER".to_string()),
            from_amount: Some("10.0000000".to_string()),
            from_tx_hash: "abc".to_string(),
            to_network: Some("ETH".to_string()),
            to_address: Some("0xdest".to_string()),
            to_asset_code: Some("USDC".to_string()),
            to_asset_issuer: Some("0xissuer".to_string()),
            to_amount: Some("9.405".to_string()),
            to_tx_hash: Some("0xpaid".to_string()),
            tx_status: "swap".to_string(),
            tx_fee: Some("0.5".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_to_intent() {
        let intent = BridgeIntent::try_from(row()).unwrap();
        assert_eq!(intent.from_network, Network::Stellar);
        assert_eq!(intent.to_network, Some(Network::Eth));
        assert_eq!(intent.tx_status, Some(TxStatus::Swap));
        assert_eq!(intent.to_amount, Some(BigDecimal::from_str("9.405").unwrap()));
        assert_eq!(intent.from_amount, Some(BigDecimal::from(10)));
    }

    #[test]
    fn test_row_with_bad_status_is_rejected() {
        let mut bad = row();
        bad.tx_status = "pending".to_string();
        assert!(BridgeIntent::try_from(bad).is_err());
    }

    #[test]
    fn test_unrouted_row() {
        let mut unrouted = row();
        unrouted.to_network = None;
        unrouted.to_amount = None;
        unrouted.tx_status = "liquidity_added".to_string();
        let intent = BridgeIntent::try_from(unrouted).unwrap();
        assert!(intent.to_network.is_none());
        assert_eq!(intent.tx_status, Some(TxStatus::LiquidityAdded));
    }
}
