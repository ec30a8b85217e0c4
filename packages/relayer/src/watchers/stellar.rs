//! Stellar vault watcher
//!
//! Follows Horizon's payment stream for the vault account and turns each
//! incoming payment into a [`BridgeIntent`]. The destination comes from the
//! transaction's `ionize` manage-data entry.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use eyre::{eyre, Result};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use super::publish_intent;
use crate::memo::{decode_manage_data, MemoRouter, STELLAR_MEMO_KEY};
use crate::metrics;
use crate::queue::IntentPublisher;
use crate::retry::{Reconnect, RetryPolicy, StreamError};
use crate::stellar_client::{
    HorizonClient, OperationRecord, Page, PaymentRecord, TransactionRecord,
};
use crate::types::{BridgeIntent, Network};

const CHAIN: &str = "stellar";

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Bytes arrive in arbitrary chunks; complete events are returned as soon as
/// their terminating blank line is seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.has_data {
                    events.push(std::mem::take(&mut self.current));
                } else {
                    self.current = SseEvent::default();
                }
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.has_data = true;
                }
                "id" => self.current.id = Some(value.to_string()),
                "event" => self.current.event = Some(value.to_string()),
                _ => {}
            }
        }

        events
    }
}

/// Memo carried by the `ionize` manage-data operation, if any
pub fn find_memo(operations: &[OperationRecord]) -> Option<String> {
    operations
        .iter()
        .find(|op| op.kind == "manage_data" && op.name.as_deref() == Some(STELLAR_MEMO_KEY))
        .and_then(|op| op.value.as_deref())
        .and_then(decode_manage_data)
}

/// Normalize a Horizon payment into an intent
pub fn intent_from_payment(
    payment: &PaymentRecord,
    tx_hash: &str,
    memo: Option<&str>,
    router: &MemoRouter,
) -> BridgeIntent {
    let from_amount = payment
        .amount
        .as_deref()
        .and_then(|a| BigDecimal::from_str(a).ok());

    BridgeIntent {
        from_asset_code: payment.asset_code.clone(),
        from_asset_issuer: payment.asset_issuer.clone(),
        from_amount,
        ..BridgeIntent::new(
            Network::Stellar,
            payment.from.clone().unwrap_or_default(),
            tx_hash.to_string(),
        )
    }
    .with_route(router.route_opt(memo))
}

/// Stellar payment stream watcher
pub struct StellarWatcher {
    horizon: HorizonClient,
    vault: String,
    router: MemoRouter,
    publisher: Arc<dyn IntentPublisher>,
    retry: RetryPolicy,
    not_found_delay: Duration,
    /// Paging token of the last fully handled record
    cursor: String,
    /// Whether the current attempt got the stream open
    opened: bool,
}

impl StellarWatcher {
    pub fn new(
        horizon: HorizonClient,
        vault: String,
        router: MemoRouter,
        publisher: Arc<dyn IntentPublisher>,
        retry: RetryPolicy,
        not_found_delay: Duration,
    ) -> Self {
        Self {
            horizon,
            vault,
            router,
            publisher,
            retry,
            not_found_delay,
            cursor: "now".to_string(),
            opened: false,
        }
    }

    /// Run the watcher loop
    pub async fn run(mut self) -> Result<()> {
        info!(vault = %self.vault, "Stellar watcher started");
        let mut reconnect = Reconnect::new(self.retry);

        loop {
            let cursor_before = self.cursor.clone();
            self.opened = false;
            let err = match self.stream_once().await {
                Ok(()) => StreamError::Closed,
                Err(e) => e,
            };

            if err.is_not_found() {
                warn!(
                    vault = %self.vault,
                    delay = ?self.not_found_delay,
                    "Vault account not found on Horizon, reopening stream later"
                );
                metrics::record_reconnect(CHAIN, "not_found");
                tokio::time::sleep(self.not_found_delay).await;
                continue;
            }

            // Horizon and proxies close idle streams, so only attempts that
            // never opened, or could not hand a deposit to the queue, count
            let publish_failed = matches!(err, StreamError::Publish(_));
            if self.cursor != cursor_before || (self.opened && !publish_failed) {
                reconnect.reset();
            }
            match reconnect.on_failure() {
                Some(delay) => {
                    warn!(
                        error = %err,
                        attempt = reconnect.failures(),
                        cursor = %self.cursor,
                        ?delay,
                        "Stellar stream interrupted, reconnecting"
                    );
                    let reason = match err {
                        StreamError::Closed => "closed",
                        StreamError::Publish(_) => "publish",
                        _ => "error",
                    };
                    metrics::record_reconnect(CHAIN, reason);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(error = %err, "Stellar stream reconnect attempts exhausted");
                    return Err(eyre!("Stellar stream failed: {}", err));
                }
            }
        }
    }

    /// Open the stream from the current cursor and consume it until it ends
    async fn stream_once(&mut self) -> Result<(), StreamError> {
        let path = format!("/accounts/{}/payments?cursor={}", self.vault, self.cursor);
        let response = self.horizon.open_stream(&path).await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StreamError::NotFound(path));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        self.opened = true;
        debug!(cursor = %self.cursor, "Stellar payment stream open");
        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                self.handle_event(event).await?;
            }
        }

        Ok(())
    }

    /// Handle one stream event. A Horizon fetch or publish failure is
    /// returned before the cursor moves, so the stream reopens at this record.
    async fn handle_event(&mut self, event: SseEvent) -> Result<(), StreamError> {
        let payment: PaymentRecord = match serde_json::from_str(&event.data) {
            Ok(p) => p,
            Err(_) => {
                // greetings and keep-alives carry no record
                debug!(data = %event.data, "Skipping non-record stream event");
                return Ok(());
            }
        };

        if payment.kind == "payment" && payment.to.as_deref() == Some(self.vault.as_str()) {
            let intent = self
                .build_intent(&payment)
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            if let Some(intent) = intent {
                metrics::record_deposit_detected(CHAIN, intent.route().is_some());
                info!(
                    tx_hash = %intent.from_tx_hash,
                    from = %intent.from_address,
                    asset = ?intent.from_asset_code,
                    amount = ?intent.from_amount.as_ref().map(|a| a.to_string()),
                    to_network = ?intent.to_network,
                    "New Stellar deposit detected"
                );
                publish_intent(self.publisher.as_ref(), &intent, CHAIN)
                    .await
                    .map_err(|e| StreamError::Publish(format!("{:#}", e)))?;
            }
        } else {
            debug!(
                id = %payment.id,
                kind = %payment.kind,
                "Skipping record that is not an incoming payment"
            );
        }

        self.cursor = event.id.unwrap_or(payment.paging_token);
        Ok(())
    }

    /// Fetch the payment's transaction and operations. `None` for a failed
    /// transaction, which moved no funds.
    async fn build_intent(&self, payment: &PaymentRecord) -> Result<Option<BridgeIntent>> {
        let tx_href = &payment.links.transaction.href;
        let tx: TransactionRecord = self.horizon.get_json(tx_href).await?;
        if !tx.successful {
            warn!(tx_hash = %tx.hash, "Ignoring failed Stellar transaction");
            return Ok(None);
        }

        let ops: Page<OperationRecord> = self
            .horizon
            .get_json(&format!("{}/operations", tx_href))
            .await?;
        let memo = find_memo(&ops.embedded.records);

        Ok(Some(intent_from_payment(
            payment,
            &tx.hash,
            memo.as_deref(),
            &self.router,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::extract::Query;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use base64::Engine;

    use super::*;
    use crate::config::NetworkMode;
    use crate::queue::MemoryQueue;
    use crate::registry::AssetRegistry;

    const VAULT: &str = "GBBD47IF6LWK7P7MDEVSCWR7DPUWV3NY3DTQEVFL4NAT4AQH3ZLLFLA5";

    fn router() -> MemoRouter {
        MemoRouter::new(AssetRegistry::for_mode(NetworkMode::Testnet))
    }

    fn payment_json() -> serde_json::Value {
        serde_json::json!({
            "id": "12884905985",
            "paging_token": "12884905985",
            "type": "payment",
            "from": "GSENDER",
            "to": VAULT,
            "amount": "10.0000000",
            "asset_type": "credit_alphanum4",
            "asset_code": "USDC",
            "asset_issuer": VAULT,
            "transaction_hash": "b2a5c0f4",
            "_links": {
                "transaction": {"href": "https://horizon-testnet.stellar.org/transactions/b2a5c0f4"}
            }
        })
    }

    #[test]
    fn test_sse_decoder_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"retry: 1000\n\nid: 1").is_empty());
        assert!(decoder.push(b"23\ndata: {\"a\":").is_empty());
        let events = decoder.push(b"1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("123"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_sse_decoder_multiline_and_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keepalive\r\ndata: line1\r\ndata: line2\r\n\r\ndata: \"hello\"\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[1].data, "\"hello\"");
        assert!(events[1].id.is_none());
    }

    #[test]
    fn test_find_memo() {
        let ops: Vec<OperationRecord> = serde_json::from_value(serde_json::json!([
            {"type": "payment"},
            {"type": "manage_data", "name": "other", "value": "eA=="},
            {"type": "manage_data", "name": "ionize", "value": "VVNEQy5FVEg6MHhhYmM="}
        ]))
        .unwrap();
        assert_eq!(find_memo(&ops).as_deref(), Some("USDC.ETH:0xabc"));
        assert!(find_memo(&ops[..2]).is_none());
    }

    #[test]
    fn test_intent_from_routed_payment() {
        let payment: PaymentRecord = serde_json::from_value(payment_json()).unwrap();
        let intent = intent_from_payment(&payment, "b2a5c0f4", Some("USDT.ETH:0xdest"), &router());

        assert_eq!(intent.from_network, Network::Stellar);
        assert_eq!(intent.from_address, "GSENDER");
        assert_eq!(intent.from_asset_code.as_deref(), Some("USDC"));
        assert_eq!(intent.from_amount, Some(BigDecimal::from(10)));
        assert_eq!(intent.from_tx_hash, "b2a5c0f4");
        assert_eq!(intent.to_network, Some(Network::Eth));
        assert_eq!(intent.to_address.as_deref(), Some("0xdest"));
        assert_eq!(
            intent.to_asset_issuer.as_deref(),
            Some("0xaA8E23Fb1079EA71e0a56F48a2aA51851D8433D0")
        );
        assert!(intent.tx_status.is_none());
    }

    #[test]
    fn test_intent_without_memo_has_no_route() {
        let payment: PaymentRecord = serde_json::from_value(payment_json()).unwrap();
        let intent = intent_from_payment(&payment, "b2a5c0f4", None, &router());
        assert!(intent.to_network.is_none());
        assert!(intent.to_address.is_none());
        assert!(intent.route().is_none());

        let bad = intent_from_payment(&payment, "b2a5c0f4", Some("garbage"), &router());
        assert!(bad.route().is_none());
    }

    #[test]
    fn test_native_payment_has_no_asset_code() {
        let mut json = payment_json();
        json["asset_type"] = "native".into();
        json.as_object_mut().unwrap().remove("asset_code");
        json.as_object_mut().unwrap().remove("asset_issuer");
        let payment: PaymentRecord = serde_json::from_value(json).unwrap();
        let intent = intent_from_payment(&payment, "h", None, &router());
        assert!(intent.from_asset_code.is_none());
        assert!(intent.from_asset_issuer.is_none());
    }

    const MEMO: &str = "USDC.ETH:0x00000000000000000000000000000000000000aa";

    /// Serve `app` on an ephemeral local port and return its base URL
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn payments_path() -> String {
        format!("/accounts/{}/payments", VAULT)
    }

    /// Horizon stand-in with one successful transaction `abc` carrying the memo
    fn horizon_routes(router: Router) -> Router {
        router
            .route(
                "/transactions/abc",
                get(|| async { Json(serde_json::json!({"hash": "abc", "successful": true})) }),
            )
            .route(
                "/transactions/abc/operations",
                get(|| async {
                    let value = base64::engine::general_purpose::STANDARD.encode(MEMO);
                    Json(serde_json::json!({"_embedded": {"records": [
                        {"type": "payment"},
                        {"type": "manage_data", "name": "ionize", "value": value}
                    ]}}))
                }),
            )
    }

    fn deposit_event(base: &str, id: &str) -> SseEvent {
        let mut json = payment_json();
        json["id"] = id.into();
        json["paging_token"] = id.into();
        json["transaction_hash"] = "abc".into();
        json["_links"]["transaction"]["href"] = format!("{}/transactions/abc", base).into();
        SseEvent {
            id: Some(id.to_string()),
            event: None,
            data: json.to_string(),
        }
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

    fn watcher(base: &str, publisher: Arc<dyn IntentPublisher>, retries: u32) -> StellarWatcher {
        StellarWatcher::new(
            HorizonClient::new(base).unwrap(),
            VAULT.to_string(),
            router(),
            publisher,
            RetryPolicy::new(retries, Duration::from_millis(5)),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_idle_stream_closes_do_not_exhaust_budget() {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let app = Router::new().route(
            &payments_path(),
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        "retry: 1000\nevent: open\ndata: \"hello\"\n\n",
                    )
                }
            }),
        );
        let base = serve(app).await;
        let (queue, _consumer) = MemoryQueue::new();

        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            watcher(&base, Arc::new(queue), 1).run(),
        )
        .await;

        assert!(outcome.is_err(), "watcher stopped: {:?}", outcome);
        assert!(opens.load(Ordering::SeqCst) > 3);
    }

    #[tokio::test]
    async fn test_failing_stream_exhausts_budget() {
        let app = Router::new().route(
            &payments_path(),
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        );
        let base = serve(app).await;
        let (queue, _consumer) = MemoryQueue::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watcher(&base, Arc::new(queue), 2).run(),
        )
        .await
        .expect("watcher gives up");
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_holds_cursor() {
        let base = serve(horizon_routes(Router::new())).await;
        let (queue, mut consumer) = MemoryQueue::new();
        let publisher = Arc::new(SwitchablePublisher {
            up: AtomicBool::new(false),
            queue,
        });
        let mut watcher = watcher(&base, publisher.clone(), 1);

        let err = watcher.handle_event(deposit_event(&base, "42")).await.unwrap_err();
        assert!(matches!(err, StreamError::Publish(_)));
        assert_eq!(watcher.cursor, "now");
        assert!(consumer.try_next().is_none());

        // the reopened stream delivers the same record again
        publisher.up.store(true, Ordering::SeqCst);
        watcher.handle_event(deposit_event(&base, "42")).await.unwrap();
        assert_eq!(watcher.cursor, "42");

        let delivery = consumer.try_next().unwrap();
        let intent = crate::queue::decode_intent(delivery.payload()).unwrap();
        assert_eq!(intent.from_tx_hash, "abc");
        assert_eq!(intent.to_network, Some(Network::Eth));
    }

    #[tokio::test]
    async fn test_dead_queue_stops_watcher_without_skipping() {
        let cursors = Arc::new(Mutex::new(Vec::new()));
        let seen = cursors.clone();
        let base_slot = Arc::new(Mutex::new(String::new()));
        let base_for_stream = base_slot.clone();

        let app = horizon_routes(Router::new()).route(
            &payments_path(),
            get(move |Query(query): Query<HashMap<String, String>>| {
                let seen = seen.clone();
                let base = base_for_stream.lock().unwrap().clone();
                async move {
                    seen.lock()
                        .unwrap()
                        .push(query.get("cursor").cloned().unwrap_or_default());
                    let event = deposit_event(&base, "77");
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        format!("id: 77\ndata: {}\n\n", event.data),
                    )
                }
            }),
        );
        let base = serve(app).await;
        *base_slot.lock().unwrap() = base.clone();

        let (queue, _consumer) = MemoryQueue::new();
        let publisher = Arc::new(SwitchablePublisher {
            up: AtomicBool::new(false),
            queue,
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), watcher(&base, publisher, 2).run())
            .await
            .expect("watcher gives up");
        assert!(outcome.is_err());

        let cursors = cursors.lock().unwrap().clone();
        assert_eq!(cursors.len(), 3);
        assert!(cursors.iter().all(|c| c == "now"), "{:?}", cursors);
    }
}
