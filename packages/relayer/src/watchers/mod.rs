use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::memo::MemoRouter;
use crate::metrics;
use crate::queue::IntentPublisher;
use crate::stellar_client::HorizonClient;
use crate::types::BridgeIntent;

pub mod evm;
pub mod stellar;

pub use evm::EvmWatcher;
pub use stellar::StellarWatcher;

/// Publish an intent on behalf of a watcher.
///
/// A failure is logged, counted and handed back. The caller must not move
/// past the deposit until a later attempt succeeds.
pub(crate) async fn publish_intent(
    publisher: &dyn IntentPublisher,
    intent: &BridgeIntent,
    chain: &str,
) -> Result<()> {
    match publisher.publish(intent).await {
        Ok(()) => {
            metrics::record_published(chain, true);
            Ok(())
        }
        Err(e) => {
            error!(
                tx_hash = %intent.from_tx_hash,
                error = %e,
                "Failed to publish intent"
            );
            metrics::record_published(chain, false);
            metrics::record_error("watcher", "publish");
            Err(e.wrap_err(format!("publishing {}", intent.from_tx_hash)))
        }
    }
}

/// Runs one watcher per source network
pub struct WatcherManager {
    stellar_watcher: StellarWatcher,
    evm_watcher: EvmWatcher,
}

impl WatcherManager {
    pub fn new(
        config: &Config,
        router: MemoRouter,
        publisher: Arc<dyn IntentPublisher>,
    ) -> Result<Self> {
        let retry = config.stream.retry_policy();

        let stellar_watcher = StellarWatcher::new(
            HorizonClient::new(&config.stellar.horizon_url)?,
            config.stellar.vault_address.clone(),
            router.clone(),
            publisher.clone(),
            retry,
            Duration::from_millis(config.stellar.not_found_delay_ms),
        );

        let evm_watcher = EvmWatcher::new(&config.evm, router, publisher, retry)?;

        info!(
            stellar_vault = %config.stellar.vault_address,
            evm_vault = %config.evm.vault_address,
            "Watcher manager created"
        );

        Ok(Self {
            stellar_watcher,
            evm_watcher,
        })
    }

    /// Run all watchers concurrently.
    /// Returns when any watcher fails or shutdown signal received
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();

        join_set.spawn(self.stellar_watcher.run());
        join_set.spawn(self.evm_watcher.run());

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A watcher exited unexpectedly without error");
                        Err(eyre::eyre!("watcher exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A watcher stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A watcher task panicked: {:?}", e);
                        Err(eyre::eyre!("watcher task panicked: {}", e))
                    }
                    None => {
                        error!("All watcher tasks exited unexpectedly");
                        Err(eyre::eyre!("all watcher tasks exited unexpectedly"))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::types::Network;
    use async_trait::async_trait;

    struct FailingPublisher;

    #[async_trait]
    impl IntentPublisher for FailingPublisher {
        async fn publish(&self, _intent: &BridgeIntent) -> Result<()> {
            Err(eyre::eyre!("broker unavailable"))
        }
    }

    #[tokio::test]
    async fn test_publish_intent_delivers() {
        let (queue, mut consumer) = MemoryQueue::new();
        let intent = BridgeIntent::new(Network::Stellar, "GFROM".into(), "h1".into());
        publish_intent(&queue, &intent, "stellar").await.unwrap();
        assert!(consumer.try_next().is_some());
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let intent = BridgeIntent::new(Network::Eth, "0xfrom".into(), "0x1".into());
        let err = publish_intent(&FailingPublisher, &intent, "evm")
            .await
            .unwrap_err();
        assert!(format!("{:?}", err).contains("broker unavailable"));
    }

    #[tokio::test]
    async fn test_manager_builds_from_config() {
        let config = crate::config::tests::test_config();
        let router = MemoRouter::new(crate::registry::AssetRegistry::for_mode(config.network));
        let (queue, _consumer) = MemoryQueue::new();
        let manager = WatcherManager::new(&config, router, Arc::new(queue));
        assert!(manager.is_ok());
    }
}
