//! Cashu wallet observable state
//!
//! The balance view and wallet event stream handed to callers, plus the
//! per-quote operation locks. Replaces global UI signals with channels that
//! any number of subscribers can follow.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};

use super::types::*;

// =============================================================================
// Batch Pagination Constants
// =============================================================================

/// Maximum number of proofs to sync at once (NUT-07 state check)
pub const MAX_SYNC_INPUT_SIZE: usize = 200;

/// Capacity of the wallet event channel; slow subscribers observe `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Balance View
// =============================================================================

/// Derived balance, republished on every proof store commit.
///
/// `publish` is only called while the proof store lock is held, so versions
/// reach subscribers in commit order.
#[derive(Debug)]
pub struct BalanceView {
    tx: watch::Sender<WalletBalance>,
}

impl BalanceView {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WalletBalance::default());
        Self { tx }
    }

    pub fn publish(&self, per_mint: BTreeMap<String, BTreeMap<CurrencyUnit, u64>>, reserved: u64) {
        self.tx.send_modify(|balance| {
            balance.version = balance.version.saturating_add(1);
            balance.per_mint = per_mint;
            balance.reserved = reserved;
        });
    }

    pub fn current(&self) -> WalletBalance {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WalletBalance> {
        self.tx.subscribe()
    }
}

impl Default for BalanceView {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Wallet Events
// =============================================================================

/// Why a reservation was returned to Unspent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Owning operation failed or was cancelled before dispatch
    Aborted,
    /// Mint confirmed the inputs were not consumed
    SettlementFailed,
    /// Watchdog sweep after the reservation timeout
    Expired,
}

/// Operation-level notifications, delivered in the order they were committed
#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    MintQuoteUpdated {
        quote_id: String,
        state: MintQuoteState,
    },
    MeltQuoteUpdated {
        quote_id: String,
        state: MeltQuoteState,
    },
    TokensSent {
        mint_url: String,
        amount: u64,
    },
    TokensReceived {
        mint_url: String,
        amount: u64,
    },
    ReservationReleased {
        reservation_id: ReservationId,
        amount: u64,
        reason: ReleaseReason,
    },
    ProofsSpentAtMint {
        mint_url: String,
        count: usize,
        amount: u64,
    },
}

/// Fan-out of wallet events
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: WalletEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            log::trace!("No wallet event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Per-Quote Operation Locks
// =============================================================================

/// Async locks keyed by quote id.
///
/// Serializes completion and reconciliation of a single quote while letting
/// unrelated quotes proceed in parallel.
#[derive(Debug, Default)]
pub struct QuoteLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuoteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `quote_id`, waiting for any holder to finish
    pub async fn acquire(&self, quote_id: &str) -> QuoteOperationGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(quote_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        log::debug!("Acquired operation lock for quote: {}", quote_id);
        QuoteOperationGuard {
            owner: self,
            quote_id: quote_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn cleanup(&self, quote_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // Map entry + our clone: nobody else is waiting
        if Arc::strong_count(lock) <= 2 {
            locks.remove(quote_id);
        }
    }

    pub fn active(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Guard that releases the quote lock when dropped (RAII pattern)
pub struct QuoteOperationGuard<'a> {
    owner: &'a QuoteLocks,
    quote_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for QuoteOperationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.cleanup(&self.quote_id, &self.lock);
        log::debug!("Released operation lock for quote: {}", self.quote_id);
    }
}
