//! EVM vault watcher
//!
//! Subscribes over websocket to ERC-20 `Transfer` logs whose recipient is the
//! vault, then reads the originating transaction for the amount and the
//! `IONIZE:` memo.

use std::str::FromStr;
use std::sync::Arc;

use alloy::consensus::Transaction as _;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolCall;
use bigdecimal::num_bigint::{BigInt, Sign};
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::publish_intent;
use crate::config::EvmConfig;
use crate::contracts::erc20::{transfer_topic, IERC20};
use crate::memo::{extract_evm_memo, MemoRouter};
use crate::metrics;
use crate::queue::IntentPublisher;
use crate::registry::EVM_STABLECOIN_DECIMALS;
use crate::retry::{Reconnect, RetryPolicy};
use crate::types::{from_base_units, BridgeIntent, Network};

const CHAIN: &str = "evm";

fn u256_to_bigint(value: U256) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, &value.to_be_bytes::<32>())
}

/// Raw amount of a `transfer(address,uint256)` call, `None` when the
/// calldata is not such a call
pub fn decode_transfer_units(input: &[u8]) -> Option<U256> {
    // memo bytes trail the ABI payload, so strict validation would reject it
    IERC20::transferCall::abi_decode(input, false)
        .ok()
        .map(|call| call.amount)
}

/// Token and value carried by the `Transfer` log itself
#[derive(Debug, Clone, Copy)]
pub struct LoggedTransfer {
    pub token: Address,
    pub value: U256,
}

impl LoggedTransfer {
    pub fn from_log(log: &Log) -> Option<Self> {
        let data = &log.data().data;
        if data.len() != 32 {
            return None;
        }
        Some(Self {
            token: log.address(),
            value: U256::from_be_slice(data),
        })
    }
}

/// Normalize a vault-bound token transfer into an intent.
///
/// The token is the transaction recipient and the amount comes from the
/// `transfer` calldata. When the transaction is not a direct `transfer` call
/// (a router or multisend contract), the emitting contract and value of the
/// log are used instead.
pub fn intent_from_transfer(
    tx_hash: B256,
    from: Address,
    tx_to: Option<Address>,
    input: &[u8],
    logged: Option<LoggedTransfer>,
    router: &MemoRouter,
) -> BridgeIntent {
    let registry = router.registry();

    let (token, units) = match (tx_to, decode_transfer_units(input)) {
        (Some(to), Some(units)) => (Some(to), Some(units)),
        _ => match logged {
            Some(log) => (Some(log.token), Some(log.value)),
            None => (tx_to, None),
        },
    };
    let token = token.map(|t| t.to_string());

    let from_asset_code = token
        .as_deref()
        .and_then(|t| registry.resolve_asset_code(t))
        .map(str::to_string);
    let decimals = from_asset_code
        .as_deref()
        .and_then(|code| registry.decimals(Network::Eth, code))
        .unwrap_or(EVM_STABLECOIN_DECIMALS);

    let memo = extract_evm_memo(input);

    BridgeIntent {
        from_asset_code,
        from_asset_issuer: token,
        from_amount: units.map(|u| from_base_units(u256_to_bigint(u), decimals)),
        ..BridgeIntent::new(Network::Eth, from.to_string(), format!("0x{:x}", tx_hash))
    }
    .with_route(router.route_opt(memo.as_deref()))
}

/// What one subscription attempt got done
#[derive(Debug, Default)]
struct Session {
    subscribed: bool,
    handled: u64,
    publish_failed: bool,
}

impl Session {
    /// Idle subscriptions get dropped by nodes and proxies, so an attempt
    /// counts against the budget only if it never subscribed or could not
    /// publish
    fn made_progress(&self) -> bool {
        self.handled > 0 || (self.subscribed && !self.publish_failed)
    }
}

/// EVM Transfer-log watcher
pub struct EvmWatcher {
    ws_url: String,
    vault: Address,
    router: MemoRouter,
    publisher: Arc<dyn IntentPublisher>,
    retry: RetryPolicy,
    /// Deposits seen but not yet accepted by the relay queue. A new
    /// subscription does not replay old logs, so they are kept here.
    unpublished: Vec<BridgeIntent>,
}

impl EvmWatcher {
    pub fn new(
        config: &EvmConfig,
        router: MemoRouter,
        publisher: Arc<dyn IntentPublisher>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let vault = Address::from_str(&config.vault_address)
            .wrap_err("Invalid EVM vault address")?;

        Ok(Self {
            ws_url: config.ws_url.clone(),
            vault,
            router,
            publisher,
            retry,
            unpublished: Vec::new(),
        })
    }

    /// Run the watcher loop
    pub async fn run(mut self) -> Result<()> {
        info!(vault = %self.vault, "EVM watcher started");
        let mut reconnect = Reconnect::new(self.retry);

        loop {
            let mut session = Session::default();
            let err = match self.subscribe_once(&mut session).await {
                Ok(()) => eyre!("log subscription closed"),
                Err(e) => e,
            };

            if session.made_progress() {
                reconnect.reset();
            }
            match reconnect.on_failure() {
                Some(delay) => {
                    warn!(
                        error = %err,
                        attempt = reconnect.failures(),
                        ?delay,
                        "EVM subscription interrupted, reconnecting"
                    );
                    metrics::record_reconnect(CHAIN, "error");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(error = %err, "EVM subscription reconnect attempts exhausted");
                    for intent in &self.unpublished {
                        error!(
                            intent = %serde_json::to_string(intent).unwrap_or_default(),
                            "Deposit was never published"
                        );
                    }
                    return Err(err.wrap_err("EVM log subscription failed"));
                }
            }
        }
    }

    async fn subscribe_once(&mut self, session: &mut Session) -> Result<()> {
        if let Err(e) = self.flush_unpublished().await {
            session.publish_failed = true;
            return Err(e);
        }

        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .wrap_err("Failed to connect to EVM websocket")?;

        let filter = Filter::new()
            .event_signature(transfer_topic())
            .topic2(self.vault.into_word());

        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .wrap_err("Failed to subscribe to Transfer logs")?;
        session.subscribed = true;
        debug!(vault = %self.vault, "EVM log subscription open");

        let mut logs = subscription.into_stream();
        while let Some(log) = logs.next().await {
            if let Err(e) = self.handle_log(&provider, log).await {
                session.publish_failed = true;
                return Err(e);
            }
            session.handled += 1;
        }

        Ok(())
    }

    /// Publish held deposits in arrival order, stopping at the first failure
    async fn flush_unpublished(&mut self) -> Result<()> {
        while let Some(intent) = self.unpublished.first() {
            publish_intent(self.publisher.as_ref(), intent, CHAIN).await?;
            info!(tx_hash = %intent.from_tx_hash, "Held deposit published");
            self.unpublished.remove(0);
        }
        Ok(())
    }

    /// Turn one log into a published intent. Only a publish failure is
    /// returned; the intent is held for the next subscription.
    async fn handle_log<P: Provider<T>, T: alloy::transports::Transport + Clone>(
        &mut self,
        provider: &P,
        log: Log,
    ) -> Result<()> {
        let Some(tx_hash) = log.transaction_hash else {
            debug!("Skipping pending log without transaction hash");
            return Ok(());
        };

        let tx = match provider.get_transaction_by_hash(tx_hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                warn!(tx_hash = %tx_hash, "Transaction for Transfer log not found");
                metrics::record_error("evm_watcher", "tx_not_found");
                return Ok(());
            }
            Err(e) => {
                warn!(tx_hash = %tx_hash, error = %e, "Failed to fetch transaction");
                metrics::record_error("evm_watcher", "rpc");
                return Ok(());
            }
        };

        let intent = intent_from_transfer(
            tx_hash,
            tx.from,
            tx.to(),
            tx.input(),
            LoggedTransfer::from_log(&log),
            &self.router,
        );
        metrics::record_deposit_detected(CHAIN, intent.route().is_some());
        info!(
            tx_hash = %intent.from_tx_hash,
            from = %intent.from_address,
            token = ?intent.from_asset_issuer,
            asset = ?intent.from_asset_code,
            amount = ?intent.from_amount.as_ref().map(|a| a.to_string()),
            to_network = ?intent.to_network,
            "New EVM deposit detected"
        );
        self.publish_or_hold(intent).await
    }

    async fn publish_or_hold(&mut self, intent: BridgeIntent) -> Result<()> {
        if let Err(e) = publish_intent(self.publisher.as_ref(), &intent, CHAIN).await {
            self.unpublished.push(intent);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use alloy::primitives::address;
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;

    use super::*;
    use crate::config::NetworkMode;
    use crate::queue::MemoryQueue;
    use crate::registry::AssetRegistry;

    const USDC: Address = address!("1c7D4B196Cb0C7B01d743Fbc6116a902379C7238");

    fn router() -> MemoRouter {
        MemoRouter::new(AssetRegistry::for_mode(NetworkMode::Testnet))
    }

    fn calldata(amount: u64, memo: Option<&str>) -> Vec<u8> {
        let mut input = IERC20::transferCall {
            to: address!("00000000000000000000000000000000000000aa"),
            amount: U256::from(amount),
        }
        .abi_encode();
        if let Some(memo) = memo {
            input.extend_from_slice(memo.as_bytes());
        }
        input
    }

    #[test]
    fn test_decode_transfer_units() {
        let input = calldata(10_500_000, None);
        assert_eq!(decode_transfer_units(&input), Some(U256::from(10_500_000u64)));
        assert!(decode_transfer_units(b"not calldata").is_none());
        assert!(decode_transfer_units(&[]).is_none());
    }

    #[test]
    fn test_decode_ignores_trailing_memo() {
        let input = calldata(1_000_000, Some("IONIZE:USDC.STELLAR:GDEST"));
        assert_eq!(decode_transfer_units(&input), Some(U256::from(1_000_000u64)));
    }

    #[test]
    fn test_intent_from_routed_transfer() {
        let sender = address!("00000000000000000000000000000000000000bb");
        let input = calldata(
            25_000_000,
            Some("IONIZE:USDC.STELLAR:GBBD47IF6LWK7P7MDEVSCWR7DPUWV3NY3DTQEVFL4NAT4AQH3ZLLFLA5"),
        );
        let intent = intent_from_transfer(
            B256::repeat_byte(0x11),
            sender,
            Some(USDC),
            &input,
            None,
            &router(),
        );

        assert_eq!(intent.from_network, Network::Eth);
        assert_eq!(intent.from_address, sender.to_string());
        assert_eq!(intent.from_asset_code.as_deref(), Some("USDC"));
        assert!(intent
            .from_asset_issuer
            .as_deref()
            .unwrap()
            .eq_ignore_ascii_case("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"));
        assert_eq!(intent.from_amount, Some(BigDecimal::from(25)));
        assert_eq!(intent.from_tx_hash, format!("0x{}", "11".repeat(32)));
        assert_eq!(intent.to_network, Some(Network::Stellar));
        assert_eq!(intent.to_asset_code.as_deref(), Some("USDC"));
        assert_eq!(
            intent.to_address.as_deref(),
            Some("GBBD47IF6LWK7P7MDEVSCWR7DPUWV3NY3DTQEVFL4NAT4AQH3ZLLFLA5")
        );
    }

    #[test]
    fn test_unknown_token_and_missing_memo() {
        let token = address!("00000000000000000000000000000000000000cc");
        let input = calldata(5_000_000, None);
        let intent = intent_from_transfer(B256::ZERO, Address::ZERO, Some(token), &input, None, &router());

        assert!(intent.from_asset_code.is_none());
        assert_eq!(intent.from_amount, Some(BigDecimal::from(5)));
        assert!(intent.route().is_none());
    }

    #[test]
    fn test_router_call_falls_back_to_log() {
        let router_contract = address!("00000000000000000000000000000000000000dd");
        let logged = LoggedTransfer {
            token: USDC,
            value: U256::from(7_250_000u64),
        };
        let intent = intent_from_transfer(
            B256::ZERO,
            Address::ZERO,
            Some(router_contract),
            b"\x12\x34\x56\x78IONIZE:USDC.STELLAR:GDEST",
            Some(logged),
            &router(),
        );

        assert_eq!(intent.from_asset_code.as_deref(), Some("USDC"));
        assert_eq!(intent.from_amount, Some(BigDecimal::from_str("7.25").unwrap()));
        assert_eq!(intent.to_network, Some(Network::Stellar));
    }

    #[test]
    fn test_no_calldata_and_no_log_value() {
        let intent = intent_from_transfer(B256::ZERO, Address::ZERO, None, b"IONIZE:bad", None, &router());
        assert!(intent.from_asset_issuer.is_none());
        assert!(intent.from_amount.is_none());
        assert!(intent.to_network.is_none());
    }

    /// Relay queue whose broker can be taken down and brought back
    struct SwitchablePublisher {
        up: AtomicBool,
        queue: MemoryQueue,
    }

    #[async_trait]
    impl IntentPublisher for SwitchablePublisher {
        async fn publish(&self, intent: &BridgeIntent) -> Result<()> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(eyre!("channel closed"));
            }
            self.queue.publish(intent).await
        }
    }

    #[test]
    fn test_session_progress() {
        assert!(!Session::default().made_progress());
        let idle = Session {
            subscribed: true,
            ..Session::default()
        };
        assert!(idle.made_progress());
        let stuck = Session {
            subscribed: true,
            publish_failed: true,
            ..Session::default()
        };
        assert!(!stuck.made_progress());
    }

    #[tokio::test]
    async fn test_unpublished_deposit_is_held_until_queue_recovers() {
        let (queue, mut consumer) = MemoryQueue::new();
        let publisher = Arc::new(SwitchablePublisher {
            up: AtomicBool::new(false),
            queue,
        });
        let config = crate::config::tests::test_config();
        let mut watcher = EvmWatcher::new(
            &config.evm,
            router(),
            publisher.clone(),
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .unwrap();

        let first = intent_from_transfer(
            B256::repeat_byte(0x01),
            Address::ZERO,
            Some(USDC),
            &calldata(2_000_000, None),
            None,
            &router(),
        );
        let second = intent_from_transfer(
            B256::repeat_byte(0x02),
            Address::ZERO,
            Some(USDC),
            &calldata(3_000_000, None),
            None,
            &router(),
        );
        assert!(watcher.publish_or_hold(first.clone()).await.is_err());
        assert!(watcher.publish_or_hold(second.clone()).await.is_err());
        assert!(watcher.flush_unpublished().await.is_err());
        assert_eq!(watcher.unpublished.len(), 2);
        assert!(consumer.try_next().is_none());

        publisher.up.store(true, Ordering::SeqCst);
        watcher.flush_unpublished().await.unwrap();
        assert!(watcher.unpublished.is_empty());

        for expected in [first, second] {
            let delivery = consumer.try_next().unwrap();
            let received = crate::queue::decode_intent(delivery.payload()).unwrap();
            assert_eq!(received.from_tx_hash, expected.from_tx_hash);
        }
    }
}
