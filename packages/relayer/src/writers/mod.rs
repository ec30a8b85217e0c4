//! Payout writers
//!
//! One writer per destination network. A writer holds that network's vault
//! key and performs exactly one transfer per call; it never retries.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use thiserror::Error;

use crate::retry::{classify_error, ErrorClass};
use crate::types::{Network, Route};

pub mod evm;
pub mod stellar;

pub use evm::EvmWriter;
pub use stellar::StellarWriter;

/// Why a payout did not happen
#[derive(Debug, Error)]
pub enum PayoutError {
    /// The destination, asset or amount cannot be expressed on-chain
    #[error("invalid payout request: {0}")]
    InvalidRequest(String),
    /// The chain refused the transfer (simulation revert, Horizon result code)
    #[error("payout rejected: {0}")]
    Rejected(String),
    /// The node could not be reached or answered garbage
    #[error("payout transport error: {0}")]
    Transport(String),
}

impl PayoutError {
    /// Metric label for this failure
    pub fn class(&self) -> ErrorClass {
        match self {
            PayoutError::InvalidRequest(_) => ErrorClass::Permanent,
            PayoutError::Rejected(msg) | PayoutError::Transport(msg) => {
                match classify_error(msg) {
                    ErrorClass::Unknown if matches!(self, PayoutError::Rejected(_)) => {
                        ErrorClass::Permanent
                    }
                    class => class,
                }
            }
        }
    }
}

/// Sends a single transfer from the vault on one network
#[async_trait]
pub trait PayoutWriter: Send + Sync {
    fn network(&self) -> Network;

    /// Send `amount` (whole asset units) of the routed asset to the routed
    /// address. Returns the destination transaction hash.
    async fn pay(&self, route: &Route, amount: &BigDecimal) -> Result<String, PayoutError>;
}
