use std::net::SocketAddr;
use std::sync::Arc;

use eyre::WrapErr;
use tokio::sync::{broadcast, mpsc};

use ionize_relayer::api::{self, AppState, ChainLiquidity};
use ionize_relayer::config::Config;
use ionize_relayer::db::{self, LedgerStore, PgLedger};
use ionize_relayer::executor::SwapExecutor;
use ionize_relayer::memo::MemoRouter;
use ionize_relayer::queue::AmqpQueue;
use ionize_relayer::registry::AssetRegistry;
use ionize_relayer::watchers::WatcherManager;
use ionize_relayer::writers::{EvmWriter, StellarWriter};

/// Capacity of the live-update channel feeding /ws clients
const UPDATE_CHANNEL_CAPACITY: usize = 256;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Ionize Bridge Relayer");

    let config = Config::load()?;
    tracing::info!(
        network = ?config.network,
        role = ?config.role,
        stellar_vault = %config.stellar.vault_address,
        evm_vault = %config.evm.vault_address,
        "Configuration loaded"
    );

    let registry = AssetRegistry::for_mode(config.network);
    let router = MemoRouter::new(registry.clone());

    // Broker outages at startup are retried, then fatal
    let queue = Arc::new(
        AmqpQueue::connect_with_retry(&config.queue.url, config.queue.retry_policy())
            .await
            .wrap_err("Relay queue unavailable")?,
    );

    let (watcher_shutdown_tx, watcher_shutdown_rx) = mpsc::channel::<()>(1);
    let (executor_shutdown_tx, executor_shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = watcher_shutdown_tx.send(()).await;
        let _ = executor_shutdown_tx.send(()).await;
    });

    let watchers = if config.role.runs_watchers() {
        Some(WatcherManager::new(&config, router, queue.clone())?)
    } else {
        None
    };

    let executor = if config.role.runs_executor() {
        let pool = db::create_pool(&config.database.url).await?;
        tracing::info!("Database connected");
        db::run_migrations(&pool).await?;
        tracing::info!("Database migrations complete");
        let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));

        let evm_writer = EvmWriter::new(&config.evm, config.network, registry.clone())?;
        evm_writer.verify_chain().await?;
        let stellar_writer = StellarWriter::new(&config.stellar, config.network)?;

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let executor = SwapExecutor::new(
            ledger.clone(),
            registry.clone(),
            config.swap.clone(),
            updates.clone(),
        )
            .with_writer(Arc::new(stellar_writer))
            .with_writer(Arc::new(evm_writer));

        let state = AppState {
            ledger,
            liquidity: Arc::new(ChainLiquidity::new(&config)?),
            registry: registry.clone(),
            swap: config.swap.clone(),
            stellar_vault: config.stellar.vault_address.clone(),
            evm_vault: config.evm.vault_address.clone(),
            updates,
        };
        let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(api_addr, state).await {
                tracing::error!(error = %e, "API server error");
            }
        });

        let consumer = queue.consumer("ionize-executor").await?;
        Some((executor, consumer))
    } else {
        None
    };

    tracing::info!("Components initialized, starting processing");

    let watchers_task = async move {
        match watchers {
            Some(manager) => manager.run(watcher_shutdown_rx).await,
            None => std::future::pending().await,
        }
    };
    let executor_task = async move {
        match executor {
            Some((executor, consumer)) => executor.run(consumer, executor_shutdown_rx).await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = watchers_task => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Watcher manager error");
            }
            result
        }
        result = executor_task => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Swap executor error");
            }
            result
        }
    };

    tracing::info!("Ionize Bridge Relayer stopped");
    result
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ionize_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
