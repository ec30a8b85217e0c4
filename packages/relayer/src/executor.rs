//! Swap executor
//!
//! Consumes intents from the relay queue and drives each one to a terminal
//! status:
//!
//! 1. discard intents already in the ledger or already terminal
//! 2. validate routing fields, the source asset, bounds and the destination
//!    payout client
//! 3. compute `to_amount = (from_amount - fee) * 0.99`
//! 4. pay out on the destination chain, one payout per chain at a time
//! 5. persist the finalized intent
//! 6. broadcast it to live subscribers
//!
//! The delivery is acked only after step 6.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, ToPrimitive};
use eyre::{eyre, Result};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::SwapConfig;
use crate::db::LedgerStore;
use crate::metrics;
use crate::queue::{decode_intent, Delivery, IntentConsumer};
use crate::registry::AssetRegistry;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{BridgeIntent, Network, Route, TxStatus};
use crate::writers::PayoutWriter;

/// Default delay before a failed delivery is requeued
const DEFAULT_REQUEUE_BACKOFF: Duration = Duration::from_secs(5);

/// `(from_amount - fee) * 0.99`
pub fn compute_to_amount(from_amount: &BigDecimal, fee: &BigDecimal) -> BigDecimal {
    // 99% of the post-fee amount is paid out
    let rate = BigDecimal::new(BigInt::from(99), 2);
    (from_amount - fee) * rate
}

/// Why an intent was kept as liquidity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingRoute,
    UnknownSourceAsset,
    MissingAmount,
    BelowMinimum,
    AboveMaximum,
    NoPayoutClient,
    AmountAfterFee,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::MissingRoute => "missing destination",
            Rejection::UnknownSourceAsset => "source asset not in registry",
            Rejection::MissingAmount => "missing amount",
            Rejection::BelowMinimum => "amount below MIN_SWAP",
            Rejection::AboveMaximum => "amount above MAX_SWAP",
            Rejection::NoPayoutClient => "no payout client for destination",
            Rejection::AmountAfterFee => "amount does not cover the fee",
        }
    }
}

/// A validated payout
#[derive(Debug, Clone)]
struct PayoutPlan {
    route: Route,
    to_amount: BigDecimal,
    fee: BigDecimal,
}

struct PayoutSlot {
    writer: Arc<dyn PayoutWriter>,
    /// One payout in flight per vault
    in_flight: Mutex<()>,
}

pub struct SwapExecutor {
    ledger: Arc<dyn LedgerStore>,
    writers: HashMap<Network, PayoutSlot>,
    registry: AssetRegistry,
    swap: SwapConfig,
    updates: broadcast::Sender<BridgeIntent>,
    requeue_backoff: Duration,
    persist_retry: RetryPolicy,
}

impl SwapExecutor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        registry: AssetRegistry,
        swap: SwapConfig,
        updates: broadcast::Sender<BridgeIntent>,
    ) -> Self {
        Self {
            ledger,
            writers: HashMap::new(),
            registry,
            swap,
            updates,
            requeue_backoff: DEFAULT_REQUEUE_BACKOFF,
            persist_retry: RetryPolicy::new(5, Duration::from_secs(2)),
        }
    }

    /// Register the payout client for the writer's network
    pub fn with_writer(mut self, writer: Arc<dyn PayoutWriter>) -> Self {
        self.writers.insert(
            writer.network(),
            PayoutSlot {
                writer,
                in_flight: Mutex::new(()),
            },
        );
        self
    }

    pub fn with_requeue_backoff(mut self, backoff: Duration) -> Self {
        self.requeue_backoff = backoff;
        self
    }

    pub fn with_persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }

    /// Check an intent against the payout rules
    pub fn validate(&self, intent: &BridgeIntent) -> Result<(Route, BigDecimal), Rejection> {
        let route = intent.route().ok_or(Rejection::MissingRoute)?;
        if !self.is_registered_source(intent) {
            return Err(Rejection::UnknownSourceAsset);
        }
        let amount = intent.from_amount.as_ref().ok_or(Rejection::MissingAmount)?;

        if amount < &self.swap.min_swap {
            return Err(Rejection::BelowMinimum);
        }
        if amount > &self.swap.max_swap {
            return Err(Rejection::AboveMaximum);
        }
        if !self.writers.contains_key(&route.to_network) {
            return Err(Rejection::NoPayoutClient);
        }

        let to_amount = compute_to_amount(amount, self.swap.fee_for(route.to_network));
        if to_amount <= BigDecimal::from(0) {
            return Err(Rejection::AmountAfterFee);
        }
        Ok((route, to_amount))
    }

    /// The deposited asset must be a registry asset from its registered issuer
    fn is_registered_source(&self, intent: &BridgeIntent) -> bool {
        match (&intent.from_asset_code, &intent.from_asset_issuer) {
            (Some(code), Some(issuer)) => {
                self.registry.is_registered(intent.from_network, code, issuer)
            }
            _ => false,
        }
    }

    /// Run one intent through the pipeline.
    ///
    /// Returns the finalized intent, or `None` when it was discarded as a
    /// duplicate. An `Err` means nothing was paid out and the delivery may be
    /// retried.
    pub async fn process(&self, intent: BridgeIntent) -> Result<Option<BridgeIntent>> {
        if intent.is_terminal() {
            debug!(tx_hash = %intent.from_tx_hash, status = ?intent.tx_status, "Discarding terminal intent");
            metrics::record_duplicate("terminal");
            return Ok(None);
        }
        if self.ledger.exists(&intent.from_tx_hash).await? {
            info!(tx_hash = %intent.from_tx_hash, "Intent already processed, skipping");
            metrics::record_duplicate("ledger");
            return Ok(None);
        }

        let (finalized, paid) = match self.validate(&intent) {
            Err(reason) => {
                info!(
                    tx_hash = %intent.from_tx_hash,
                    reason = reason.as_str(),
                    "Deposit kept as liquidity"
                );
                (finalize_liquidity(intent), false)
            }
            Ok((route, to_amount)) => {
                let fee = self.swap.fee_for(route.to_network).clone();
                let plan = PayoutPlan {
                    route,
                    to_amount,
                    fee,
                };
                (self.execute(intent, plan).await, true)
            }
        };

        let inserted = if paid {
            self.persist_after_payout(&finalized).await
        } else {
            self.ledger.insert(&finalized).await?
        };
        if !inserted {
            warn!(tx_hash = %finalized.from_tx_hash, "Intent was finalized concurrently, not broadcasting");
            metrics::record_duplicate("ledger");
            return Ok(None);
        }

        let status = finalized.tx_status.map(|s| s.as_str()).unwrap_or("unknown");
        let to_chain = finalized.to_network.map(|n| n.as_str()).unwrap_or("none");
        metrics::record_finalized(to_chain, status);

        // no subscribers is fine
        let _ = self.updates.send(finalized.clone());
        Ok(Some(finalized))
    }

    /// Pay out and fill in the executor-owned fields
    async fn execute(&self, mut intent: BridgeIntent, plan: PayoutPlan) -> BridgeIntent {
        let network = plan.route.to_network;
        let chain = network.as_str();
        let Some(slot) = self.writers.get(&network) else {
            return finalize_liquidity(intent);
        };

        let result = {
            let _guard = slot.in_flight.lock().await;
            let started = Instant::now();
            let result = slot.writer.pay(&plan.route, &plan.to_amount).await;
            metrics::record_payout_latency(chain, started.elapsed().as_secs_f64());
            result
        };

        match result {
            Ok(to_tx_hash) => {
                info!(
                    from_tx_hash = %intent.from_tx_hash,
                    to_tx_hash = %to_tx_hash,
                    to_network = chain,
                    to_amount = %plan.to_amount,
                    fee = %plan.fee,
                    "Swap completed"
                );
                metrics::record_payout(
                    chain,
                    &plan.route.to_asset_code,
                    plan.to_amount.to_f64().unwrap_or(0.0),
                    plan.fee.to_f64().unwrap_or(0.0),
                );
                intent.to_amount = Some(plan.to_amount);
                intent.to_tx_hash = Some(to_tx_hash);
                intent.tx_fee = Some(plan.fee);
                intent.tx_status = Some(TxStatus::Swap);
            }
            Err(e) => {
                let class = e.class();
                error!(
                    from_tx_hash = %intent.from_tx_hash,
                    to_network = chain,
                    class = class.as_str(),
                    error = %e,
                    "Payout failed"
                );
                metrics::record_payout_failure(chain, class.as_str());
                intent.to_amount = None;
                intent.to_tx_hash = None;
                intent.tx_fee = None;
                intent.tx_status = Some(TxStatus::FailedSwap);
            }
        }
        intent
    }

    /// Funds may have moved already, so a ledger outage must not lead to a
    /// redelivery. Insert with retries; on exhaustion log the record and
    /// carry on.
    async fn persist_after_payout(&self, intent: &BridgeIntent) -> bool {
        let result = with_retry(self.persist_retry, "ledger insert", |_| {
            self.ledger.insert(intent)
        })
        .await;

        match result {
            Ok(inserted) => inserted,
            Err(e) => {
                error!(
                    tx_hash = %intent.from_tx_hash,
                    intent = %serde_json::to_string(intent).unwrap_or_default(),
                    error = %e,
                    "Failed to persist intent after payout"
                );
                metrics::record_error("executor", "ledger_after_payout");
                true
            }
        }
    }

    /// Decode, process and settle one delivery
    pub async fn handle_delivery(&self, delivery: Box<dyn Delivery>) -> Result<()> {
        let intent = match decode_intent(delivery.payload()) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(delivery.payload()),
                    "Dropping undecodable message"
                );
                metrics::record_error("executor", "decode");
                delivery.reject(false).await?;
                metrics::record_delivery("reject");
                return Ok(());
            }
        };

        let tx_hash = intent.from_tx_hash.clone();
        match self.process(intent).await {
            Ok(_) => {
                delivery.ack().await?;
                metrics::record_delivery("ack");
            }
            Err(e) => {
                error!(
                    tx_hash = %tx_hash,
                    error = %e,
                    backoff = ?self.requeue_backoff,
                    "Failed to process intent, requeueing"
                );
                metrics::record_error("executor", "process");
                tokio::time::sleep(self.requeue_backoff).await;
                delivery.reject(true).await?;
                metrics::record_delivery("requeue");
            }
        }
        Ok(())
    }

    /// Consume deliveries until shutdown or the queue closes
    pub async fn run<C: IntentConsumer>(
        self,
        mut consumer: C,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!(
            writers = ?self.writers.keys().collect::<Vec<_>>(),
            min_swap = %self.swap.min_swap,
            max_swap = %self.swap.max_swap,
            "Swap executor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping executor");
                    return Ok(());
                }
                next = consumer.next_delivery() => {
                    match next {
                        Some(Ok(delivery)) => self.handle_delivery(delivery).await?,
                        Some(Err(e)) => {
                            error!("Relay queue consumer failed: {:?}", e);
                            return Err(e);
                        }
                        None => {
                            error!("Relay queue consumer closed");
                            return Err(eyre!("relay queue consumer closed"));
                        }
                    }
                }
            }
        }
    }
}

fn finalize_liquidity(mut intent: BridgeIntent) -> BridgeIntent {
    intent.to_amount = None;
    intent.to_tx_hash = None;
    intent.tx_fee = None;
    intent.tx_status = Some(TxStatus::LiquidityAdded);
    intent
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::tests::test_config;
    use crate::config::NetworkMode;
    use crate::db::MemoryLedger;
    use crate::writers::PayoutError;

    const STELLAR_USDC_ISSUER: &str = "GBBD47IF6LWK7P7MDEVSCWR7DPUWV3NY3DTQEVFL4NAT4AQH3ZLLFLA5";

    struct CountingWriter {
        network: Network,
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl PayoutWriter for CountingWriter {
        fn network(&self) -> Network {
            self.network
        }

        async fn pay(&self, _route: &Route, _amount: &BigDecimal) -> Result<String, PayoutError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PayoutError::Rejected("execution reverted".into()))
            } else {
                Ok(format!("0xpaid{}", n))
            }
        }
    }

    fn writer(network: Network, fail: bool) -> Arc<CountingWriter> {
        Arc::new(CountingWriter {
            network,
            calls: AtomicU32::new(0),
            fail,
        })
    }

    fn routed_intent(hash: &str, amount: &str) -> BridgeIntent {
        BridgeIntent {
            from_asset_code: Some("USDC".into()),
            from_asset_issuer: Some(STELLAR_USDC_ISSUER.into()),
            from_amount: Some(BigDecimal::from_str(amount).unwrap()),
            ..BridgeIntent::new(Network::Stellar, "GFROM".into(), hash.into())
        }
        .with_route(Some(Route {
            to_network: Network::Eth,
            to_asset_code: "USDC".into(),
            to_asset_issuer: "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".into(),
            to_address: "0xdest".into(),
        }))
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::for_mode(NetworkMode::Testnet)
    }

    fn executor(ledger: Arc<MemoryLedger>, eth: Arc<CountingWriter>) -> SwapExecutor {
        let (updates, _) = broadcast::channel(16);
        SwapExecutor::new(ledger, registry(), test_config().swap, updates).with_writer(eth)
    }

    #[test]
    fn test_fee_arithmetic() {
        let to = compute_to_amount(&BigDecimal::from(10), &BigDecimal::from_str("0.5").unwrap());
        assert_eq!(to, BigDecimal::from_str("9.405").unwrap());
    }

    #[test]
    fn test_validate_bounds() {
        let exec = executor(Arc::new(MemoryLedger::new()), writer(Network::Eth, false));

        assert!(exec.validate(&routed_intent("a", "1")).is_ok());
        assert!(exec.validate(&routed_intent("b", "1000")).is_ok());
        assert_eq!(
            exec.validate(&routed_intent("c", "0.99")).unwrap_err(),
            Rejection::BelowMinimum
        );
        assert_eq!(
            exec.validate(&routed_intent("d", "1000.01")).unwrap_err(),
            Rejection::AboveMaximum
        );

        let mut no_amount = routed_intent("e", "5");
        no_amount.from_amount = None;
        assert_eq!(exec.validate(&no_amount).unwrap_err(), Rejection::MissingAmount);

        let mut no_route = routed_intent("f", "5");
        no_route.to_address = None;
        assert_eq!(exec.validate(&no_route).unwrap_err(), Rejection::MissingRoute);
    }

    #[test]
    fn test_validate_requires_registered_source_asset() {
        let exec = executor(Arc::new(MemoryLedger::new()), writer(Network::Eth, false));

        let mut native = routed_intent("xlm", "5");
        native.from_asset_code = None;
        native.from_asset_issuer = None;
        assert_eq!(exec.validate(&native).unwrap_err(), Rejection::UnknownSourceAsset);

        let mut forged = routed_intent("fake", "5");
        forged.from_asset_issuer = Some("GCFORGEDISSUER".into());
        assert_eq!(exec.validate(&forged).unwrap_err(), Rejection::UnknownSourceAsset);

        let mut no_code = routed_intent("erc", "5");
        no_code.from_network = Network::Eth;
        no_code.from_asset_code = None;
        no_code.from_asset_issuer = Some("0x00000000000000000000000000000000deadbeef".into());
        assert_eq!(exec.validate(&no_code).unwrap_err(), Rejection::UnknownSourceAsset);

        // checksum case of the token contract does not matter
        let mut usdc = routed_intent("usdc", "5");
        usdc.from_network = Network::Eth;
        usdc.from_asset_issuer = Some("0x1c7d4b196cb0c7b01d743fbc6116a902379c7238".into());
        assert!(exec.validate(&usdc).is_ok());
    }

    #[test]
    fn test_validate_requires_payout_client() {
        let exec = executor(Arc::new(MemoryLedger::new()), writer(Network::Stellar, false));
        assert_eq!(
            exec.validate(&routed_intent("a", "5")).unwrap_err(),
            Rejection::NoPayoutClient
        );
    }

    #[test]
    fn test_validate_fee_exceeds_amount() {
        let ledger = Arc::new(MemoryLedger::new());
        let (updates, _) = broadcast::channel(4);
        let mut swap = test_config().swap;
        swap.min_swap = BigDecimal::from_str("0.1").unwrap();
        let exec = SwapExecutor::new(ledger, registry(), swap, updates)
            .with_writer(writer(Network::Eth, false));
        assert_eq!(
            exec.validate(&routed_intent("a", "0.5")).unwrap_err(),
            Rejection::AmountAfterFee
        );
    }

    #[tokio::test]
    async fn test_process_swap_sets_executor_fields() {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = writer(Network::Eth, false);
        let exec = executor(ledger.clone(), eth.clone());
        let mut updates = exec.updates.subscribe();

        let finalized = exec.process(routed_intent("h1", "10")).await.unwrap().unwrap();
        assert_eq!(finalized.tx_status, Some(TxStatus::Swap));
        assert_eq!(finalized.to_amount, Some(BigDecimal::from_str("9.405").unwrap()));
        assert_eq!(finalized.tx_fee, Some(BigDecimal::from_str("0.5").unwrap()));
        assert_eq!(finalized.to_tx_hash.as_deref(), Some("0xpaid0"));
        assert_eq!(eth.calls.load(Ordering::SeqCst), 1);

        assert_eq!(ledger.get("h1").await.unwrap(), finalized);
        assert_eq!(updates.try_recv().unwrap(), finalized);
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = writer(Network::Eth, false);
        let exec = executor(ledger.clone(), eth.clone());

        assert!(exec.process(routed_intent("dup", "10")).await.unwrap().is_some());
        assert!(exec.process(routed_intent("dup", "10")).await.unwrap().is_none());
        assert_eq!(eth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_terminal_intent_is_not_mutated() {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = writer(Network::Eth, false);
        let exec = executor(ledger.clone(), eth.clone());

        let mut intent = routed_intent("t1", "10");
        intent.tx_status = Some(TxStatus::FailedSwap);
        assert!(exec.process(intent).await.unwrap().is_none());
        assert_eq!(eth.calls.load(Ordering::SeqCst), 0);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_payout_failure_is_terminal() {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = writer(Network::Eth, true);
        let exec = executor(ledger.clone(), eth.clone());

        let finalized = exec.process(routed_intent("f1", "10")).await.unwrap().unwrap();
        assert_eq!(finalized.tx_status, Some(TxStatus::FailedSwap));
        assert!(finalized.to_tx_hash.is_none());
        assert!(finalized.to_amount.is_none());
        assert!(finalized.tx_fee.is_none());

        // no retry on redelivery
        assert!(exec.process(routed_intent("f1", "10")).await.unwrap().is_none());
        assert_eq!(eth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_becomes_liquidity() {
        let ledger = Arc::new(MemoryLedger::new());
        let eth = writer(Network::Eth, false);
        let exec = executor(ledger.clone(), eth.clone());

        let finalized = exec.process(routed_intent("big", "5000")).await.unwrap().unwrap();
        assert_eq!(finalized.tx_status, Some(TxStatus::LiquidityAdded));
        assert!(finalized.to_amount.is_none());
        assert_eq!(eth.calls.load(Ordering::SeqCst), 0);
    }
}
