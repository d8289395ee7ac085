//! Mint connector boundary
//!
//! The wallet never talks HTTP or does blind-signature cryptography itself.
//! Both live behind `MintConnector`, implemented by a mint-protocol library.
//! Every call is fallible, and a timeout is ambiguous: the mint may or may
//! not have processed the request.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::stores::cashu::errors::{CashuWalletError, NutErrorCode};
use crate::stores::cashu::types::{CurrencyUnit, Proof};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MintClientError {
    /// No response within the deadline; outcome unknown
    Timeout,
    /// Request never reached the mint or the connection failed
    Network(String),
    /// Mint answered with a protocol error
    Rejected { code: NutErrorCode, message: String },
}

impl MintClientError {
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: NutErrorCode::from_code(code),
            message: message.into(),
        }
    }

    /// True when the mint may have acted on the request
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }
}

impl fmt::Display for MintClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "mint request timed out"),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Rejected { code, message } => write!(f, "{} ({})", message, code),
        }
    }
}

impl std::error::Error for MintClientError {}

impl From<MintClientError> for CashuWalletError {
    fn from(err: MintClientError) -> Self {
        match err {
            MintClientError::Timeout => CashuWalletError::NetworkUnavailable("mint request timed out".to_string()),
            MintClientError::Network(msg) => CashuWalletError::NetworkUnavailable(msg),
            MintClientError::Rejected { code, message } => CashuWalletError::MintRejected { code, message },
        }
    }
}

pub type MintClientResult<T> = Result<T, MintClientError>;

// =============================================================================
// Wire Types
// =============================================================================

/// Mint-side state of a mint quote (NUT-04)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMintQuoteState {
    Unpaid,
    Paid,
    Issued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMintQuote {
    pub quote_id: String,
    pub payment_request: String,
    pub amount: u64,
    pub state: RemoteMintQuoteState,
    /// Unix seconds; None when the mint gives no expiry
    pub expiry: Option<u64>,
}

/// Mint-side state of a melt (NUT-05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMeltState {
    Unpaid,
    Pending,
    Paid,
    /// Payment failed and inputs were not consumed
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMeltQuote {
    pub quote_id: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub state: RemoteMeltState,
    pub expiry: Option<u64>,
}

/// Result of a melt or a melt status poll
#[derive(Debug, Clone, PartialEq)]
pub struct MeltOutcome {
    pub state: RemoteMeltState,
    pub fee_paid: u64,
    pub preimage: Option<String>,
    /// Overpaid fee reserve returned as new proofs (NUT-08)
    pub change: Vec<Proof>,
}

/// Per-proof spend state reported by the mint (NUT-07)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpentState {
    Unspent,
    Pending,
    Spent,
}

// =============================================================================
// Connector Trait
// =============================================================================

/// Mint-protocol collaborator.
///
/// Implementations own blinding, signature unblinding and secret generation;
/// proofs they return must carry fresh secrets and `mint_url` set.
#[async_trait]
pub trait MintConnector: Send + Sync {
    async fn request_mint_quote(
        &self,
        mint_url: &str,
        amount: u64,
        unit: &CurrencyUnit,
        description: Option<&str>,
    ) -> MintClientResult<RemoteMintQuote>;

    async fn mint_quote_state(&self, mint_url: &str, quote_id: &str) -> MintClientResult<RemoteMintQuote>;

    /// Issue proofs for a paid quote, one per requested denomination
    async fn mint(&self, mint_url: &str, quote_id: &str, amounts: &[u64]) -> MintClientResult<Vec<Proof>>;

    async fn request_melt_quote(
        &self,
        mint_url: &str,
        invoice: &str,
        unit: &CurrencyUnit,
    ) -> MintClientResult<RemoteMeltQuote>;

    async fn melt(&self, mint_url: &str, quote_id: &str, inputs: &[Proof]) -> MintClientResult<MeltOutcome>;

    async fn melt_quote_state(&self, mint_url: &str, quote_id: &str) -> MintClientResult<MeltOutcome>;

    /// Exchange inputs for new proofs with exactly `target_amounts`, in order
    async fn swap(&self, mint_url: &str, inputs: &[Proof], target_amounts: &[u64]) -> MintClientResult<Vec<Proof>>;

    /// Spend state of each proof, same order as `proofs`
    async fn check_spent(&self, mint_url: &str, proofs: &[Proof]) -> MintClientResult<Vec<SpentState>>;
}

/// Bound a connector call by `timeout`, reporting expiry as `Timeout`
pub async fn with_deadline<T, Fut>(label: &str, timeout: Duration, fut: Fut) -> MintClientResult<T>
where
    Fut: Future<Output = MintClientResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => {
            if let Err(e) = &result {
                log::warn!("Mint call {} failed: {}", label, e);
            }
            result
        }
        Err(_) => {
            log::warn!("Mint call {} timed out after {:?}", label, timeout);
            Err(MintClientError::Timeout)
        }
    }
}
