//! Cashu ecash wallet core
//!
//! This module implements custody of Cashu proofs for a single owner.
//! It provides:
//! - Proof store with reservations and an auditable transition log
//! - Coin selection with input fees and a dust threshold
//! - Mint and melt quote lifecycle (Lightning in and out)
//! - V3/V4 token encoding and decoding
//! - Reservation watchdog and melt reconciliation
//! - Mint management and transaction history

pub mod types;
pub mod errors;
pub mod signals;
pub mod proofs;
pub mod selection;
pub mod send;
pub mod receive;
pub mod lightning;
pub mod mint_mgmt;
pub mod history;
pub mod token;
pub mod denomination;
pub mod quotes;
pub mod proof_recovery;
pub mod fees;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use types::*;
pub use errors::{CashuResult, CashuWalletError, ErrorKind, NutErrorCode};
pub use signals::{ReleaseReason, WalletEvent};

pub use proofs::{ProofStore, ProofStoreConfig, Reservation, ReservationGuard};
pub use selection::{select_proofs, Selection};
pub use quotes::{QuoteLedger, QuoteStats};
pub use token::{decode_token, encode_token, encode_token_v3, TokenFormat};
pub use fees::{FeeEstimate, FeePolicy};
pub use lightning::MeltReconciliation;
pub use proof_recovery::{PendingCheckSummary, WatchdogHandle, WatchdogReport};
