use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::{PayoutError, PayoutWriter};
use crate::config::{EvmConfig, NetworkMode};
use crate::contracts::IERC20;
use crate::registry::{AssetRegistry, EVM_STABLECOIN_DECIMALS};
use crate::types::{to_base_units, Network, Route};

/// ERC-20 base units for a whole-unit amount; must be positive
fn token_units(amount: &BigDecimal, decimals: u32) -> Result<U256, PayoutError> {
    let units = to_base_units(amount, decimals);
    if units <= BigInt::from(0) {
        return Err(PayoutError::InvalidRequest(format!(
            "payout amount rounds to zero: {}",
            amount
        )));
    }
    U256::from_str(&units.to_string())
        .map_err(|_| PayoutError::InvalidRequest(format!("payout amount out of range: {}", amount)))
}

/// Pays out ERC-20 stablecoins from the vault key
pub struct EvmWriter {
    http_url: Url,
    signer_address: Address,
    wallet: EthereumWallet,
    chain_id: u64,
    registry: AssetRegistry,
}

impl EvmWriter {
    pub fn new(config: &EvmConfig, mode: NetworkMode, registry: AssetRegistry) -> Result<Self> {
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .wrap_err("Failed to parse private key")?;
        let signer_address = signer.address();

        let vault = Address::from_str(&config.vault_address)
            .wrap_err("Invalid EVM vault address")?;
        if vault != signer_address {
            warn!(
                vault = %vault,
                signer = %signer_address,
                "ETHEREUM_VAULT_PRIVATE_KEY does not control ETHEREUM_VAULT_ADDRESS; payouts come from the signer"
            );
        }

        let http_url = config.http_url.parse().wrap_err("Invalid ETHEREUM_HTTP URL")?;

        Ok(Self {
            http_url,
            signer_address,
            wallet: EthereumWallet::from(signer),
            chain_id: mode.evm_chain_id(),
            registry,
        })
    }

    /// Check that the node serves the chain the network mode expects
    pub async fn verify_chain(&self) -> Result<()> {
        let provider = ProviderBuilder::new().on_http(self.http_url.clone());
        let chain_id = provider
            .get_chain_id()
            .await
            .wrap_err("Failed to query EVM chain id")?;
        if chain_id != self.chain_id {
            return Err(eyre!(
                "EVM node is on chain {} but chain {} was expected",
                chain_id,
                self.chain_id
            ));
        }
        info!(chain_id, signer = %self.signer_address, "EVM writer connected");
        Ok(())
    }

    fn decimals(&self, asset_code: &str) -> u32 {
        self.registry
            .decimals(Network::Eth, asset_code)
            .unwrap_or(EVM_STABLECOIN_DECIMALS)
    }
}

#[async_trait]
impl PayoutWriter for EvmWriter {
    fn network(&self) -> Network {
        Network::Eth
    }

    async fn pay(&self, route: &Route, amount: &BigDecimal) -> Result<String, PayoutError> {
        let token = Address::from_str(&route.to_asset_issuer).map_err(|_| {
            PayoutError::InvalidRequest(format!("invalid token address: {}", route.to_asset_issuer))
        })?;
        let to = Address::from_str(&route.to_address).map_err(|_| {
            PayoutError::InvalidRequest(format!("invalid recipient address: {}", route.to_address))
        })?;
        let units = token_units(amount, self.decimals(&route.to_asset_code))?;

        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(self.wallet.clone())
            .on_http(self.http_url.clone());
        let contract = IERC20::new(token, &provider);
        let call = contract.transfer(to, units).from(self.signer_address);

        // Simulate first so a revert never costs gas
        let simulated = call
            .call()
            .await
            .map_err(|e| PayoutError::Rejected(format!("transfer simulation failed: {}", e)))?;
        if !simulated._0 {
            return Err(PayoutError::Rejected(
                "transfer simulation returned false".to_string(),
            ));
        }

        debug!(token = %token, to = %to, units = %units, "Sending ERC-20 transfer");
        let pending_tx = call
            .send()
            .await
            .map_err(|e| PayoutError::Transport(format!("failed to send transfer: {}", e)))?;
        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());

        info!(
            tx_hash = %tx_hash,
            token = %token,
            to = %to,
            amount = %amount,
            "EVM payout submitted"
        );
        Ok(tx_hash)
    }
}
