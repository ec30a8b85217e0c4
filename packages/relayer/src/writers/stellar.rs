use async_trait::async_trait;
use bigdecimal::BigDecimal;
use eyre::Result;
use tracing::{debug, info};

use super::{PayoutError, PayoutWriter};
use crate::config::{NetworkMode, StellarConfig};
use crate::stellar_client::{HorizonClient, PaymentRequest, StellarClient, TX_TIMEOUT_SECS};
use crate::types::{Network, Route};

/// Pays out Stellar credit assets from the vault account
pub struct StellarWriter {
    client: StellarClient,
}

impl StellarWriter {
    pub fn new(config: &StellarConfig, mode: NetworkMode) -> Result<Self> {
        let horizon = HorizonClient::new(&config.horizon_url)?;
        let client = StellarClient::new(horizon, &config.secret_key, mode.stellar_passphrase())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PayoutWriter for StellarWriter {
    fn network(&self) -> Network {
        Network::Stellar
    }

    async fn pay(&self, route: &Route, amount: &BigDecimal) -> Result<String, PayoutError> {
        let request = PaymentRequest {
            destination: &route.to_address,
            asset_code: &route.to_asset_code,
            asset_issuer: &route.to_asset_issuer,
            amount,
        };

        let horizon = self.client.horizon();
        let account = horizon
            .load_account(self.client.address())
            .await
            .map_err(|e| PayoutError::Transport(format!("{:#}", e)))?;
        let sequence = account
            .sequence_number()
            .map_err(|e| PayoutError::Transport(format!("{:#}", e)))?
            + 1;
        let max_time = chrono::Utc::now().timestamp() as u64 + TX_TIMEOUT_SECS;

        let envelope = self
            .client
            .build_payment(sequence, max_time, &request)
            .map_err(|e| PayoutError::InvalidRequest(format!("{:#}", e)))?;

        debug!(
            tx_hash = %envelope.hash,
            sequence,
            destination = %route.to_address,
            amount = %amount,
            "Submitting Stellar payment"
        );

        let result = horizon
            .submit(&envelope.xdr)
            .await
            .map_err(|e| PayoutError::Rejected(format!("{:#}", e)))?;

        info!(
            tx_hash = %result.hash,
            destination = %route.to_address,
            asset = %route.to_asset_code,
            amount = %amount,
            "Stellar payout submitted"
        );
        Ok(result.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_writer_from_config() {
        let config = test_config();
        let writer = StellarWriter::new(&config.stellar, config.network).unwrap();
        assert_eq!(writer.network(), Network::Stellar);
        assert_eq!(writer.client.address(), config.stellar.vault_address);
    }

    #[test]
    fn test_writer_rejects_bad_secret() {
        let mut config = test_config();
        config.stellar.secret_key = "SNOTASECRET".to_string();
        assert!(StellarWriter::new(&config.stellar, config.network).is_err());
    }
}
