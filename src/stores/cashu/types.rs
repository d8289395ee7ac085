//! Cashu wallet data types
//!
//! All data structures shared by the proof store, quote ledger, token codec
//! and the wallet orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Units
// =============================================================================

/// Currency unit of a proof set (NUT-00 unit string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CurrencyUnit {
    #[default]
    Sat,
    Msat,
    Usd,
    Eur,
    Custom(String),
}

impl CurrencyUnit {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sat => "sat",
            Self::Msat => "msat",
            Self::Usd => "usd",
            Self::Eur => "eur",
            Self::Custom(unit) => unit.as_str(),
        }
    }
}

impl From<&str> for CurrencyUnit {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sat" => Self::Sat,
            "msat" => Self::Msat,
            "usd" => Self::Usd,
            "eur" => Self::Eur,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for CurrencyUnit {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<CurrencyUnit> for String {
    fn from(unit: CurrencyUnit) -> Self {
        unit.as_str().to_string()
    }
}

impl fmt::Display for CurrencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Proof Types
// =============================================================================

/// A bearer proof issued by a mint.
///
/// Proofs are immutable once created; custody state lives next to them in
/// the proof store, never inside the proof itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    /// Keyset id (hex)
    pub id: String,
    pub amount: u64,
    pub secret: String,
    /// Unblinded mint signature (hex)
    #[serde(rename = "C", alias = "c")]
    pub c: String,
    #[serde(default)]
    pub mint_url: String,
}

impl Proof {
    /// Short secret prefix for log lines
    pub fn secret_prefix(&self) -> &str {
        let end = self
            .secret
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.secret.len());
        &self.secret[..end]
    }
}

/// Sum proof amounts, failing on overflow
pub fn sum_amounts<'a>(proofs: impl IntoIterator<Item = &'a Proof>) -> Option<u64> {
    proofs
        .into_iter()
        .try_fold(0u64, |acc, p| acc.checked_add(p.amount))
}

/// Custody state of a proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProofState {
    /// Available for spending, counts toward balance
    #[default]
    Unspent,
    /// Locked by an in-progress send or melt
    Reserved,
    /// Consumed; retained for audit
    Spent,
}

impl ProofState {
    /// Returns true if the proof is available for spending
    pub fn is_spendable(&self) -> bool {
        matches!(self, ProofState::Unspent)
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, ProofState::Reserved)
    }

    pub fn is_spent(&self) -> bool {
        matches!(self, ProofState::Spent)
    }
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspent => write!(f, "unspent"),
            Self::Reserved => write!(f, "reserved"),
            Self::Spent => write!(f, "spent"),
        }
    }
}

/// Opaque handle for a reservation held in the proof store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub String);

impl ReservationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored proof with its custody metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub proof: Proof,
    pub unit: CurrencyUnit,
    pub state: ProofState,
    /// Reservation holding this proof while Reserved
    #[serde(default)]
    pub reservation: Option<ReservationId>,
    /// Timestamp when state was set
    pub state_set_at: u64,
    pub added_at: u64,
}

// =============================================================================
// Quote Types
// =============================================================================

/// Lifecycle of a mint quote (lightning receive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MintQuoteState {
    Pending,
    PaymentDetected,
    Minted,
    Expired,
    Failed,
}

impl MintQuoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Minted | Self::Expired | Self::Failed)
    }
}

impl fmt::Display for MintQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::PaymentDetected => write!(f, "payment_detected"),
            Self::Minted => write!(f, "minted"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of a melt quote (lightning send)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeltQuoteState {
    Pending,
    Paying,
    Paid,
    FailedRefundable,
    Expired,
}

impl MeltQuoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::FailedRefundable | Self::Expired)
    }
}

impl fmt::Display for MeltQuoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paying => write!(f, "paying"),
            Self::Paid => write!(f, "paid"),
            Self::FailedRefundable => write!(f, "failed_refundable"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Mint quote information (lightning receive)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MintQuote {
    pub id: String,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub amount_requested: u64,
    pub payment_request: String,
    pub state: MintQuoteState,
    #[serde(default)]
    pub description: Option<String>,
    /// Amount actually issued once Minted
    #[serde(default)]
    pub amount_minted: Option<u64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub updated_at: u64,
}

/// Melt quote information (lightning send)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeltQuote {
    pub id: String,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub amount: u64,
    pub fee_reserve: u64,
    pub invoice: String,
    pub state: MeltQuoteState,
    /// Reservation backing the payment while Paying
    #[serde(default)]
    pub reservation: Option<ReservationId>,
    #[serde(default)]
    pub fee_paid: Option<u64>,
    #[serde(default)]
    pub preimage: Option<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub updated_at: u64,
}

/// Events that advance a mint quote
#[derive(Clone, Debug, PartialEq)]
pub enum MintQuoteEvent {
    PaymentObserved,
    Minted { amount: u64 },
    TtlElapsed,
    Failed { reason: String },
}

impl fmt::Display for MintQuoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PaymentObserved => write!(f, "payment_observed"),
            Self::Minted { amount } => write!(f, "minted({})", amount),
            Self::TtlElapsed => write!(f, "ttl_elapsed"),
            Self::Failed { reason } => write!(f, "failed({})", reason),
        }
    }
}

/// Events that advance a melt quote
#[derive(Clone, Debug, PartialEq)]
pub enum MeltQuoteEvent {
    Dispatched { reservation: ReservationId },
    SettlementConfirmed { fee_paid: u64, preimage: Option<String> },
    SettlementFailed,
    TtlElapsed,
}

impl fmt::Display for MeltQuoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched { .. } => write!(f, "dispatched"),
            Self::SettlementConfirmed { .. } => write!(f, "settlement_confirmed"),
            Self::SettlementFailed => write!(f, "settlement_failed"),
            Self::TtlElapsed => write!(f, "ttl_elapsed"),
        }
    }
}

// =============================================================================
// Token Types
// =============================================================================

/// Portable proof bundle; a value object independent of wallet state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub proofs: Vec<Proof>,
    pub memo: Option<String>,
}

impl Token {
    /// Total value of the token, None on overflow
    pub fn value(&self) -> Option<u64> {
        sum_amounts(&self.proofs)
    }
}

// =============================================================================
// Balance Types
// =============================================================================

/// Derived balance view, recomputed from the proof store on every commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletBalance {
    /// Monotonic commit counter; increases with every published view
    pub version: u64,
    /// mint -> unit -> Σ Unspent
    pub per_mint: BTreeMap<String, BTreeMap<CurrencyUnit, u64>>,
    /// Σ Reserved, reported separately and never part of the balance
    pub reserved: u64,
}

impl WalletBalance {
    /// Spendable balance for a mint and unit
    pub fn get(&self, mint_url: &str, unit: &CurrencyUnit) -> u64 {
        self.per_mint
            .get(mint_url)
            .and_then(|units| units.get(unit))
            .copied()
            .unwrap_or(0)
    }

    /// Spendable balance across all mints for a unit
    pub fn total(&self, unit: &CurrencyUnit) -> u64 {
        self.per_mint
            .values()
            .filter_map(|units| units.get(unit))
            .fold(0u64, |acc, amt| acc.saturating_add(*amt))
    }
}

// =============================================================================
// Operation Results
// =============================================================================

/// Result of `receive_funds`
#[derive(Clone, Debug, PartialEq)]
pub struct MintQuoteInfo {
    pub quote_id: String,
    pub payment_request: String,
    pub amount: u64,
    pub expires_at: u64,
}

/// Result of `send_payment`
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentResult {
    pub quote_id: String,
    pub paid: bool,
    pub amount: u64,
    pub fee: u64,
    pub preimage: Option<String>,
}

/// Options for `send_tokens_with_options`
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Mint to spend from (wallet default when None)
    pub mint_url: Option<String>,
    pub memo: Option<String>,
}

impl SendOptions {
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn from_mint(mut self, mint_url: impl Into<String>) -> Self {
        self.mint_url = Some(mint_url.into());
        self
    }
}

// =============================================================================
// History Types
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Lightning receive
    Mint,
    /// Lightning send
    Melt,
    /// Ecash send
    Send,
    /// Ecash receive
    Receive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Transaction history entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub kind: TransactionKind,
    pub amount: u64,
    pub fee: u64,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub status: TransactionStatus,
    #[serde(default)]
    pub quote_id: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}
