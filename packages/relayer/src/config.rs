use bigdecimal::BigDecimal;
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::Network;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub network: NetworkMode,
    pub role: RelayerRole,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub stellar: StellarConfig,
    pub evm: EvmConfig,
    pub swap: SwapConfig,
    pub stream: StreamConfig,
    pub api: ApiConfig,
}

/// Which deployment the relayer talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Testnet,
    Mainnet,
}

impl NetworkMode {
    pub fn stellar_passphrase(&self) -> &'static str {
        match self {
            NetworkMode::Testnet => "Test SDF Network ; September 2015",
            NetworkMode::Mainnet => "Public Global Stellar Network ; September 2015",
        }
    }

    /// Sepolia on testnet, Ethereum mainnet otherwise
    pub fn evm_chain_id(&self) -> u64 {
        match self {
            NetworkMode::Testnet => 11_155_111,
            NetworkMode::Mainnet => 1,
        }
    }
}

impl FromStr for NetworkMode {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "testnet" => Ok(NetworkMode::Testnet),
            "mainnet" | "public" => Ok(NetworkMode::Mainnet),
            other => Err(eyre!("NETWORK_TYPE must be testnet or mainnet, got {}", other)),
        }
    }
}

/// Which halves of the pipeline this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayerRole {
    /// Watchers, executor and API in one process
    All,
    /// Chain watchers only; publishes to the queue
    Observer,
    /// Queue consumer, executor and API
    Executor,
}

impl RelayerRole {
    pub fn runs_watchers(&self) -> bool {
        matches!(self, RelayerRole::All | RelayerRole::Observer)
    }

    pub fn runs_executor(&self) -> bool {
        matches!(self, RelayerRole::All | RelayerRole::Executor)
    }
}

impl FromStr for RelayerRole {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(RelayerRole::All),
            "observer" => Ok(RelayerRole::Observer),
            "executor" => Ok(RelayerRole::Executor),
            other => Err(eyre!(
                "RELAYER_ROLE must be all, observer or executor, got {}",
                other
            )),
        }
    }
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// AMQP broker configuration
#[derive(Clone)]
pub struct QueueConfig {
    pub url: String,
    pub connect_retries: u32,
    pub connect_delay_ms: u64,
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("url", &"<redacted>")
            .field("connect_retries", &self.connect_retries)
            .field("connect_delay_ms", &self.connect_delay_ms)
            .finish()
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_retries,
            Duration::from_millis(self.connect_delay_ms),
        )
    }
}

/// Stellar vault and Horizon configuration
#[derive(Clone)]
pub struct StellarConfig {
    pub horizon_url: String,
    pub vault_address: String,
    pub secret_key: String,
    /// Delay before reopening the payment stream when the vault account is missing
    pub not_found_delay_ms: u64,
}

/// Custom Debug that redacts secret_key to prevent accidental log leakage.
impl fmt::Debug for StellarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StellarConfig")
            .field("horizon_url", &self.horizon_url)
            .field("vault_address", &self.vault_address)
            .field("secret_key", &"<redacted>")
            .field("not_found_delay_ms", &self.not_found_delay_ms)
            .finish()
    }
}

/// EVM vault configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub ws_url: String,
    pub http_url: String,
    pub vault_address: String,
    /// Hex private key, always stored with a `0x` prefix
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("ws_url", &self.ws_url)
            .field("http_url", &self.http_url)
            .field("vault_address", &self.vault_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Swap bounds and fixed per-destination fees
#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub min_swap: BigDecimal,
    pub max_swap: BigDecimal,
    pub fee_eth: BigDecimal,
    pub fee_stellar: BigDecimal,
}

impl SwapConfig {
    /// Fixed fee charged for a payout on `network`
    pub fn fee_for(&self, network: Network) -> &BigDecimal {
        match network {
            Network::Eth => &self.fee_eth,
            Network::Stellar => &self.fee_stellar,
        }
    }
}

/// Reconnect behaviour for watcher streams
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect_retries: u32,
    pub reconnect_delay_ms: u64,
}

impl StreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_retries,
            Duration::from_millis(self.reconnect_delay_ms),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

/// Default functions
fn default_api_port() -> u16 {
    8080
}

fn default_queue_connect_retries() -> u32 {
    5
}

fn default_queue_connect_delay() -> u64 {
    10_000
}

fn default_not_found_delay() -> u64 {
    60_000
}

fn default_stream_reconnect_retries() -> u32 {
    5
}

fn default_stream_reconnect_delay() -> u64 {
    5_000
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn decimal(name: &str) -> Result<BigDecimal> {
    let raw = required(name)?;
    BigDecimal::from_str(raw.trim()).wrap_err_with(|| format!("{} must be a decimal number", name))
}

fn normalize_private_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("0x") {
        trimmed.to_string()
    } else {
        format!("0x{}", trimmed)
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let network = env::var("NETWORK_TYPE")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;
        let role = env::var("RELAYER_ROLE")
            .unwrap_or_else(|_| "all".to_string())
            .parse()?;

        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let queue = QueueConfig {
            url: required("CLOUDAMQP_URL")?,
            connect_retries: optional("QUEUE_CONNECT_RETRIES", default_queue_connect_retries()),
            connect_delay_ms: optional("QUEUE_CONNECT_DELAY_MS", default_queue_connect_delay()),
        };

        let stellar = StellarConfig {
            horizon_url: required("STELLAR_ES")?.trim_end_matches('/').to_string(),
            vault_address: required("STELLAR_VAULT_ADDRESS")?,
            secret_key: required("STELLAR_VAULT_SECRET_KEY")?,
            not_found_delay_ms: optional("STELLAR_NOT_FOUND_DELAY_MS", default_not_found_delay()),
        };

        let evm = EvmConfig {
            ws_url: required("ETHEREUM_WS")?,
            http_url: required("ETHEREUM_HTTP")?,
            vault_address: required("ETHEREUM_VAULT_ADDRESS")?,
            private_key: normalize_private_key(&required("ETHEREUM_VAULT_PRIVATE_KEY")?),
        };

        let swap = SwapConfig {
            min_swap: decimal("MIN_SWAP")?,
            max_swap: decimal("MAX_SWAP")?,
            fee_eth: decimal("SWAP_FEE_ETH")?,
            fee_stellar: decimal("SWAP_FEE_STELLAR")?,
        };

        let stream = StreamConfig {
            reconnect_retries: optional(
                "STREAM_RECONNECT_RETRIES",
                default_stream_reconnect_retries(),
            ),
            reconnect_delay_ms: optional(
                "STREAM_RECONNECT_DELAY_MS",
                default_stream_reconnect_delay(),
            ),
        };

        let api = ApiConfig {
            port: optional("API_PORT", default_api_port()),
        };

        let config = Config {
            network,
            role,
            database,
            queue,
            stellar,
            evm,
            swap,
            stream,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("DATABASE_URL cannot be empty"));
        }

        if self.queue.url.is_empty() {
            return Err(eyre!("CLOUDAMQP_URL cannot be empty"));
        }

        if self.stellar.horizon_url.is_empty() {
            return Err(eyre!("STELLAR_ES cannot be empty"));
        }

        stellar_strkey::ed25519::PublicKey::from_string(&self.stellar.vault_address)
            .map_err(|_| eyre!("STELLAR_VAULT_ADDRESS must be a G... account id"))?;

        let secret = stellar_strkey::ed25519::PrivateKey::from_string(&self.stellar.secret_key)
            .map_err(|_| eyre!("STELLAR_VAULT_SECRET_KEY must be an S... secret seed"))?;
        let derived = crate::stellar_client::public_key_from_seed(&secret.0);
        if derived != self.stellar.vault_address {
            return Err(eyre!(
                "STELLAR_VAULT_SECRET_KEY does not belong to STELLAR_VAULT_ADDRESS"
            ));
        }

        if self.evm.ws_url.is_empty() || self.evm.http_url.is_empty() {
            return Err(eyre!("ETHEREUM_WS and ETHEREUM_HTTP cannot be empty"));
        }

        if self.evm.vault_address.len() != 42 || !self.evm.vault_address.starts_with("0x") {
            return Err(eyre!(
                "ETHEREUM_VAULT_ADDRESS must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.evm.private_key.len() != 66 || hex::decode(self.evm.private_key.trim_start_matches("0x")).is_err() {
            return Err(eyre!(
                "ETHEREUM_VAULT_PRIVATE_KEY must be 64 hex chars (optionally 0x-prefixed)"
            ));
        }

        let zero = BigDecimal::from(0);
        if self.swap.min_swap < zero {
            return Err(eyre!("MIN_SWAP cannot be negative"));
        }
        if self.swap.min_swap > self.swap.max_swap {
            return Err(eyre!("MIN_SWAP cannot exceed MAX_SWAP"));
        }
        if self.swap.fee_eth < zero || self.swap.fee_stellar < zero {
            return Err(eyre!("swap fees cannot be negative"));
        }
        if self.swap.fee_eth >= self.swap.max_swap || self.swap.fee_stellar >= self.swap.max_swap {
            return Err(eyre!("swap fees must be below MAX_SWAP"));
        }

        Ok(())
    }
}
