//! HTTP and websocket API
//!
//! - GET /status - supported tokens, vault liquidity and swap limits
//! - GET /transactions - every finalized intent
//! - GET /ws - live feed of finalized intents
//! - GET /health - liveness
//! - GET /metrics - Prometheus metrics

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::transports::http::reqwest::Url;
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::BigDecimal;
use eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SwapConfig};
use crate::contracts::IERC20;
use crate::db::LedgerStore;
use crate::metrics;
use crate::registry::{AssetEntry, AssetRegistry};
use crate::stellar_client::HorizonClient;
use crate::types::{from_base_units, BridgeIntent, Network};

const GENERIC_ERROR: &str = "Error processing transaction";

/// Vault balance lookup for a registry asset
#[async_trait]
pub trait LiquiditySource: Send + Sync {
    /// Balance held by the vault, in whole asset units
    async fn balance(&self, asset: &AssetEntry) -> Result<BigDecimal>;
}

/// Reads vault balances from Horizon and the EVM node
pub struct ChainLiquidity {
    horizon: HorizonClient,
    stellar_vault: String,
    evm_http_url: Url,
    evm_vault: Address,
}

impl ChainLiquidity {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            horizon: HorizonClient::new(&config.stellar.horizon_url)?,
            stellar_vault: config.stellar.vault_address.clone(),
            evm_http_url: config.evm.http_url.parse().wrap_err("Invalid ETHEREUM_HTTP URL")?,
            evm_vault: Address::from_str(&config.evm.vault_address)
                .wrap_err("Invalid EVM vault address")?,
        })
    }
}

#[async_trait]
impl LiquiditySource for ChainLiquidity {
    async fn balance(&self, asset: &AssetEntry) -> Result<BigDecimal> {
        match asset.network {
            Network::Stellar => Ok(self
                .horizon
                .token_balance(&self.stellar_vault, &asset.issuer)
                .await?
                .unwrap_or_default()),
            Network::Eth => {
                let token = Address::from_str(&asset.issuer)
                    .wrap_err_with(|| format!("Invalid token address {}", asset.issuer))?;
                let provider = ProviderBuilder::new().on_http(self.evm_http_url.clone());
                let balance = IERC20::new(token, &provider)
                    .balanceOf(self.evm_vault)
                    .call()
                    .await
                    .wrap_err_with(|| format!("balanceOf failed for {}", asset.id()))?
                    ._0;
                let units = BigInt::from_bytes_be(Sign::Plus, &balance.to_be_bytes::<32>());
                Ok(from_base_units(units, asset.decimals))
            }
        }
    }
}

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub liquidity: Arc<dyn LiquiditySource>,
    pub registry: AssetRegistry,
    pub swap: SwapConfig,
    pub stellar_vault: String,
    pub evm_vault: String,
    pub updates: broadcast::Sender<BridgeIntent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub id: String,
    pub issuer_address: String,
    pub vault_address: String,
    pub liquidity: BigDecimal,
    pub min_input: BigDecimal,
    pub max_input: BigDecimal,
    pub min_output: BigDecimal,
    pub max_output: BigDecimal,
    pub tx_fee: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub tokens: Vec<TokenStatus>,
}

fn generic_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let mut tokens = Vec::with_capacity(state.registry.entries().len());

    for asset in state.registry.entries() {
        let liquidity = match state.liquidity.balance(asset).await {
            Ok(balance) => balance,
            Err(e) => {
                error!(asset = %asset.id(), error = %e, "Failed to read vault balance");
                metrics::record_error("api", "balance");
                return generic_error();
            }
        };
        let vault_address = match asset.network {
            Network::Stellar => state.stellar_vault.clone(),
            Network::Eth => state.evm_vault.clone(),
        };

        tokens.push(TokenStatus {
            id: asset.id(),
            issuer_address: asset.issuer.clone(),
            vault_address,
            liquidity,
            min_input: state.swap.min_swap.clone(),
            max_input: state.swap.max_swap.clone(),
            min_output: state.swap.min_swap.clone(),
            max_output: state.swap.max_swap.clone(),
            tx_fee: state.swap.fee_for(asset.network).clone(),
        });
    }

    Json(StatusResponse {
        status: "live",
        tokens,
    })
    .into_response()
}

async fn transactions(State(state): State<AppState>) -> Response {
    match state.ledger.list_all().await {
        Ok(intents) => Json(intents).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list transactions");
            metrics::record_error("api", "ledger");
            generic_error()
        }
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let updates = state.updates.subscribe();
    ws.on_upgrade(move |socket| forward_updates(socket, updates))
}

/// Push every finalized intent to one websocket client until it disconnects
async fn forward_updates(socket: WebSocket, mut updates: broadcast::Receiver<BridgeIntent>) {
    let (mut sender, mut receiver) = socket.split();
    debug!("Websocket client connected");

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(intent) => {
                        let json = match serde_json::to_string(&intent) {
                            Ok(json) => json,
                            Err(e) => {
                                error!(error = %e, "Failed to encode intent for websocket");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Websocket client lagging, dropped updates");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("Websocket client disconnected");
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/transactions", get(transactions))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind API server to {}", addr))?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .await
        .wrap_err("API server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::config::NetworkMode;
    use crate::db::MemoryLedger;
    use crate::types::TxStatus;

    struct FixedLiquidity(Option<BigDecimal>);

    #[async_trait]
    impl LiquiditySource for FixedLiquidity {
        async fn balance(&self, _asset: &AssetEntry) -> Result<BigDecimal> {
            self.0.clone().ok_or_else(|| eyre::eyre!("node unreachable"))
        }
    }

    fn state(liquidity: Option<BigDecimal>, ledger: Arc<MemoryLedger>) -> AppState {
        let config = test_config();
        let (updates, _) = broadcast::channel(8);
        AppState {
            ledger,
            liquidity: Arc::new(FixedLiquidity(liquidity)),
            registry: AssetRegistry::for_mode(NetworkMode::Testnet),
            swap: config.swap,
            stellar_vault: config.stellar.vault_address,
            evm_vault: config.evm.vault_address,
            updates,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_lists_registry_tokens() {
        let state = state(Some(BigDecimal::from(250)), Arc::new(MemoryLedger::new()));
        let response = status(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "live");
        let tokens = json["tokens"].as_array().unwrap();
        assert_eq!(tokens.len(), 3);

        let usdc_eth = tokens.iter().find(|t| t["id"] == "USDC.ETH").unwrap();
        assert_eq!(usdc_eth["issuerAddress"], "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238");
        assert_eq!(usdc_eth["vaultAddress"], "0x0000000000000000000000000000000000000001");
        assert_eq!(usdc_eth["liquidity"], "250");
        assert_eq!(usdc_eth["minInput"], "1");
        assert_eq!(usdc_eth["maxOutput"], "1000");
        assert_eq!(usdc_eth["txFee"], "0.5");

        let usdc_stellar = tokens.iter().find(|t| t["id"] == "USDC.STELLAR").unwrap();
        assert_eq!(usdc_stellar["txFee"], "0.1");
    }

    #[tokio::test]
    async fn test_status_balance_failure_is_generic_500() {
        let state = state(None, Arc::new(MemoryLedger::new()));
        let response = status(State(state)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], GENERIC_ERROR.as_bytes());
    }

    #[tokio::test]
    async fn test_transactions_lists_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut intent = BridgeIntent::new(Network::Eth, "0xfrom".into(), "0xabc".into());
        intent.tx_status = Some(TxStatus::LiquidityAdded);
        ledger.insert(&intent).await.unwrap();

        let response = transactions(State(state(None, ledger))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["from_tx_hash"], "0xabc");
        assert_eq!(json[0]["tx_status"], "liquidity_added");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::record_delivery("ack");
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("relayer_deliveries_total"));
    }
}
