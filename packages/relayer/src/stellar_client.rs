//! Stellar Horizon client for account queries and payment submission
//!
//! Payments are built as XDR envelopes with stellar-xdr, signed locally with
//! the vault's ed25519 key and submitted through Horizon's REST API.

use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use ed25519_dalek::{Signer, SigningKey};
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    AccountId, AlphaNum12, AlphaNum4, Asset, AssetCode12, AssetCode4, DecoratedSignature, Hash,
    Limits, Memo, MuxedAccount, Operation, OperationBody, PaymentOp, Preconditions, PublicKey,
    SequenceNumber, Signature, SignatureHint, TimeBounds, TimePoint, Transaction,
    TransactionEnvelope, TransactionExt, TransactionSignaturePayload,
    TransactionSignaturePayloadTaggedTransaction, TransactionV1Envelope, Uint256, WriteXdr,
};
use tracing::info;

use crate::registry::STELLAR_DECIMALS;
use crate::types::to_base_units;

/// Fee per operation in stroops
pub const BASE_FEE: u32 = 100;

/// Validity window of a payout transaction
pub const TX_TIMEOUT_SECS: u64 = 180;

/// Account id (G...) for a raw ed25519 seed
pub fn public_key_from_seed(seed: &[u8; 32]) -> String {
    let signing_key = SigningKey::from_bytes(seed);
    stellar_strkey::ed25519::PublicKey(signing_key.verifying_key().to_bytes()).to_string()
}

fn parse_account(address: &str) -> Result<[u8; 32]> {
    stellar_strkey::ed25519::PublicKey::from_string(address)
        .map(|pk| pk.0)
        .map_err(|_| eyre!("Invalid Stellar account id: {}", address))
}

fn account_id(address: &str) -> Result<AccountId> {
    Ok(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(
        parse_account(address)?,
    ))))
}

/// Credit asset for `code` issued by `issuer`
fn credit_asset(code: &str, issuer: &str) -> Result<Asset> {
    let issuer = account_id(issuer)?;
    let bytes = code.as_bytes();
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(eyre!("Invalid asset code: {}", code));
    }
    match bytes.len() {
        1..=4 => {
            let mut buf = [0u8; 4];
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum4(AlphaNum4 {
                asset_code: AssetCode4(buf),
                issuer,
            }))
        }
        5..=12 => {
            let mut buf = [0u8; 12];
            buf[..bytes.len()].copy_from_slice(bytes);
            Ok(Asset::CreditAlphanum12(AlphaNum12 {
                asset_code: AssetCode12(buf),
                issuer,
            }))
        }
        _ => Err(eyre!("Invalid asset code length: {}", code)),
    }
}

/// Amount in stroops (7 decimal places), truncated
pub fn to_stroops(amount: &BigDecimal) -> Result<i64> {
    let units = to_base_units(amount, STELLAR_DECIMALS);
    let stroops = i64::try_from(units).map_err(|_| eyre!("Amount out of range: {}", amount))?;
    if stroops <= 0 {
        return Err(eyre!("Payment amount must be positive: {}", amount));
    }
    Ok(stroops)
}

/// A payment to be made from the vault
#[derive(Debug, Clone)]
pub struct PaymentRequest<'a> {
    pub destination: &'a str,
    pub asset_code: &'a str,
    pub asset_issuer: &'a str,
    pub amount: &'a BigDecimal,
}

/// Signed transaction ready for submission
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    /// Base64 XDR `TransactionEnvelope`
    pub xdr: String,
    /// Hex transaction hash
    pub hash: String,
}

// Horizon resources. Only the fields the relayer reads are modelled.

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLinks {
    pub transaction: Link,
}

/// Record from `/accounts/{id}/payments`
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub paging_token: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub asset_code: Option<String>,
    #[serde(default)]
    pub asset_issuer: Option<String>,
    pub transaction_hash: String,
    #[serde(rename = "_links")]
    pub links: PaymentLinks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    #[serde(default = "default_true")]
    pub successful: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Embedded<T> {
    pub records: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(rename = "_embedded")]
    pub embedded: Embedded<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub balance: String,
    pub asset_type: String,
    #[serde(default)]
    pub asset_code: Option<String>,
    #[serde(default)]
    pub asset_issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub account_id: String,
    pub sequence: String,
    pub balances: Vec<Balance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub hash: String,
}

/// Problem document Horizon returns for a rejected submission
#[derive(Debug, Clone, Deserialize)]
struct SubmitProblem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    extras: Option<serde_json::Value>,
}

impl AccountResponse {
    pub fn sequence_number(&self) -> Result<i64> {
        self.sequence
            .parse()
            .wrap_err_with(|| format!("Invalid sequence number: {}", self.sequence))
    }

    /// Balance of the credit asset issued by `issuer`, if the account trusts it
    pub fn credit_balance(&self, issuer: &str) -> Option<&str> {
        self.balances
            .iter()
            .find(|b| {
                (b.asset_type == "credit_alphanum4" || b.asset_type == "credit_alphanum12")
                    && b.asset_issuer.as_deref() == Some(issuer)
            })
            .map(|b| b.balance.as_str())
    }
}

/// Read-only Horizon client
#[derive(Clone)]
pub struct HorizonClient {
    horizon_url: String,
    client: Client,
    /// No overall timeout: event streams stay open indefinitely
    stream_client: Client,
}

impl HorizonClient {
    pub fn new(horizon_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP client")?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP stream client")?;

        Ok(Self {
            horizon_url: horizon_url.trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    pub fn horizon_url(&self) -> &str {
        &self.horizon_url
    }

    /// Open a server-sent-event stream on a Horizon path such as
    /// `/accounts/{id}/payments?cursor=now`
    pub async fn open_stream(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        let url = format!("{}{}", self.horizon_url, path);
        self.stream_client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
    }

    /// GET a Horizon resource and decode it
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .wrap_err_with(|| format!("Horizon request failed: {}", url))?
            .error_for_status()
            .wrap_err_with(|| format!("Horizon returned an error for {}", url))?;

        response
            .json::<T>()
            .await
            .wrap_err_with(|| format!("Failed to decode Horizon response from {}", url))
    }

    /// Load an account (sequence number and balances)
    pub async fn load_account(&self, address: &str) -> Result<AccountResponse> {
        let url = format!("{}/accounts/{}", self.horizon_url, address);
        self.get_json(&url).await
    }

    /// Balance of `address` in the asset issued by `issuer`
    pub async fn token_balance(&self, address: &str, issuer: &str) -> Result<Option<BigDecimal>> {
        let account = self.load_account(address).await?;
        account
            .credit_balance(issuer)
            .map(|b| BigDecimal::from_str(b).wrap_err("Invalid balance from Horizon"))
            .transpose()
    }

    /// Submit a signed envelope; returns the transaction hash Horizon reports
    pub async fn submit(&self, envelope_xdr: &str) -> Result<SubmitResponse> {
        let url = format!("{}/transactions", self.horizon_url);
        let response = self
            .client
            .post(&url)
            .form(&[("tx", envelope_xdr)])
            .send()
            .await
            .wrap_err("Failed to submit transaction to Horizon")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<SubmitProblem>(&body)
                .ok()
                .map(|p| {
                    let codes = p
                        .extras
                        .as_ref()
                        .and_then(|e| e.get("result_codes"))
                        .map(|c| c.to_string())
                        .unwrap_or_default();
                    format!("{} {}", p.title.unwrap_or_default(), codes)
                })
                .unwrap_or(body);
            return Err(eyre!("Horizon rejected transaction ({}): {}", status, detail.trim()));
        }

        response
            .json::<SubmitResponse>()
            .await
            .wrap_err("Failed to decode Horizon submit response")
    }
}

/// Horizon client holding the vault's signing key
pub struct StellarClient {
    horizon: HorizonClient,
    network_passphrase: String,
    signing_key: SigningKey,
    /// Vault account id
    address: String,
}

impl StellarClient {
    /// Create a new client from an S... secret seed
    pub fn new(horizon: HorizonClient, secret_key: &str, network_passphrase: &str) -> Result<Self> {
        let seed = stellar_strkey::ed25519::PrivateKey::from_string(secret_key)
            .map_err(|_| eyre!("Invalid Stellar secret seed"))?;
        let signing_key = SigningKey::from_bytes(&seed.0);
        let address = public_key_from_seed(&seed.0);

        info!(
            address = %address,
            horizon = %horizon.horizon_url(),
            "Stellar client initialized"
        );

        Ok(Self {
            horizon,
            network_passphrase: network_passphrase.to_string(),
            signing_key,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn horizon(&self) -> &HorizonClient {
        &self.horizon
    }

    /// Build and sign a single-payment transaction from the vault.
    ///
    /// `sequence` is the sequence number the transaction consumes (the
    /// account's current sequence plus one).
    pub fn build_payment(
        &self,
        sequence: i64,
        max_time: u64,
        payment: &PaymentRequest<'_>,
    ) -> Result<SignedEnvelope> {
        let source = Uint256(self.signing_key.verifying_key().to_bytes());

        let operation = Operation {
            source_account: None,
            body: OperationBody::Payment(PaymentOp {
                destination: MuxedAccount::Ed25519(Uint256(parse_account(payment.destination)?)),
                asset: credit_asset(payment.asset_code, payment.asset_issuer)?,
                amount: to_stroops(payment.amount)?,
            }),
        };

        let tx = Transaction {
            source_account: MuxedAccount::Ed25519(source.clone()),
            fee: BASE_FEE,
            seq_num: SequenceNumber(sequence),
            cond: Preconditions::Time(TimeBounds {
                min_time: TimePoint(0),
                max_time: TimePoint(max_time),
            }),
            memo: Memo::None,
            operations: vec![operation].try_into()?,
            ext: TransactionExt::V0,
        };

        let network_id = Hash(Sha256::digest(self.network_passphrase.as_bytes()).into());
        let payload = TransactionSignaturePayload {
            network_id,
            tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
        };
        let tx_hash: [u8; 32] = Sha256::digest(payload.to_xdr(Limits::none())?).into();
        let signature = self.signing_key.sign(&tx_hash);

        let mut hint = [0u8; 4];
        hint.copy_from_slice(&source.0[28..]);
        let decorated = DecoratedSignature {
            hint: SignatureHint(hint),
            signature: Signature(signature.to_bytes().to_vec().try_into()?),
        };

        let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
            tx,
            signatures: vec![decorated].try_into()?,
        });

        Ok(SignedEnvelope {
            xdr: envelope.to_xdr_base64(Limits::none())?,
            hash: hex::encode(tx_hash),
        })
    }
}
