//! Quote ledger
//!
//! Tracks mint quotes (lightning receive) and melt quotes (lightning send)
//! through their lifecycles. Transitions only move forward; applying any
//! event to a terminal quote is a no-op that reports the existing state, so
//! retries are harmless.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::errors::{CashuResult, CashuWalletError};
use super::types::*;

// =============================================================================
// Quote Expiry Types
// =============================================================================

/// Quote validity status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteValidity {
    /// Quote is still valid
    Valid,
    /// Quote is expiring soon (within warning threshold)
    ExpiringSoon,
    Expired,
    /// Quote has no expiry (or unknown)
    NoExpiry,
}

/// Quote expiry thresholds (in seconds)
pub mod thresholds {
    /// Warning threshold - consider quote expiring soon
    pub const WARNING_SECS: u64 = 60;
    /// Default quote TTL if the mint does not specify one
    pub const DEFAULT_TTL_SECS: u64 = 600;
}

/// Get quote validity status. An expiry of 0 means none was given.
pub fn check_quote_validity(expiry: u64, now: u64) -> QuoteValidity {
    if expiry == 0 {
        QuoteValidity::NoExpiry
    } else if now >= expiry {
        QuoteValidity::Expired
    } else if expiry - now <= thresholds::WARNING_SECS {
        QuoteValidity::ExpiringSoon
    } else {
        QuoteValidity::Valid
    }
}

/// Format time until expiry as human-readable string
pub fn format_expiry(expiry: u64, now: u64) -> String {
    match check_quote_validity(expiry, now) {
        QuoteValidity::NoExpiry => "No expiry".to_string(),
        QuoteValidity::Expired => "Expired".to_string(),
        _ => {
            let secs = expiry - now;
            if secs >= 60 {
                format!("{}m {}s", secs / 60, secs % 60)
            } else {
                format!("{}s", secs)
            }
        }
    }
}

// =============================================================================
// Transition Rules
// =============================================================================

/// Next mint quote state, `None` when the event is not valid from `state`.
/// Terminal states are handled by the caller.
fn next_mint_state(state: MintQuoteState, event: &MintQuoteEvent) -> Option<MintQuoteState> {
    use MintQuoteState::*;
    match (state, event) {
        (Pending | PaymentDetected, MintQuoteEvent::PaymentObserved) => Some(PaymentDetected),
        (PaymentDetected, MintQuoteEvent::Minted { .. }) => Some(Minted),
        (Pending, MintQuoteEvent::TtlElapsed) => Some(Expired),
        (Pending | PaymentDetected, MintQuoteEvent::Failed { .. }) => Some(Failed),
        _ => None,
    }
}

fn next_melt_state(quote: &MeltQuote, event: &MeltQuoteEvent) -> Option<MeltQuoteState> {
    use MeltQuoteState::*;
    match (quote.state, event) {
        (Pending, MeltQuoteEvent::Dispatched { .. }) => Some(Paying),
        // Re-dispatch with the same reservation is a retry
        (Paying, MeltQuoteEvent::Dispatched { reservation }) => {
            (quote.reservation.as_ref() == Some(reservation)).then_some(Paying)
        }
        (Paying, MeltQuoteEvent::SettlementConfirmed { .. }) => Some(Paid),
        (Paying, MeltQuoteEvent::SettlementFailed) => Some(FailedRefundable),
        (Pending, MeltQuoteEvent::TtlElapsed) => Some(Expired),
        _ => None,
    }
}

// =============================================================================
// Quote Ledger
// =============================================================================

/// Quote stats for display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteStats {
    pub pending_mint: usize,
    pub paid_unminted: usize,
    pub paying_melt: usize,
    pub pending_melt: usize,
    pub terminal: usize,
}

/// Quotes expired by a sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredQuotes {
    pub mint: Vec<String>,
    pub melt: Vec<String>,
}

impl ExpiredQuotes {
    pub fn is_empty(&self) -> bool {
        self.mint.is_empty() && self.melt.is_empty()
    }
}

/// Quote records awaiting persistence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteWrites {
    pub mint: Vec<MintQuote>,
    pub melt: Vec<MeltQuote>,
    pub removed_mint: Vec<String>,
    pub removed_melt: Vec<String>,
}

impl QuoteWrites {
    pub fn is_empty(&self) -> bool {
        self.mint.is_empty()
            && self.melt.is_empty()
            && self.removed_mint.is_empty()
            && self.removed_melt.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteLedgerSnapshot {
    pub mint: Vec<MintQuote>,
    pub melt: Vec<MeltQuote>,
}

#[derive(Default)]
struct Inner {
    mint: HashMap<String, MintQuote>,
    melt: HashMap<String, MeltQuote>,
    dirty_mint: HashSet<String>,
    dirty_melt: HashSet<String>,
    removed_mint: HashSet<String>,
    removed_melt: HashSet<String>,
}

/// Outstanding mint and melt quotes
#[derive(Default)]
pub struct QuoteLedger {
    inner: Mutex<Inner>,
}

impl QuoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Record a mint quote issued by the mint. Re-recording a known id returns
    /// the stored quote unchanged.
    pub fn create_mint_quote(&self, quote: MintQuote) -> MintQuote {
        let mut inner = self.lock();
        if let Some(existing) = inner.mint.get(&quote.id) {
            log::debug!("Mint quote {} already recorded", quote.id);
            return existing.clone();
        }
        log::info!(
            "Recorded mint quote {} for {} {} at {}",
            quote.id,
            quote.amount_requested,
            quote.unit,
            quote.mint_url
        );
        inner.dirty_mint.insert(quote.id.clone());
        inner.mint.insert(quote.id.clone(), quote.clone());
        quote
    }

    /// Record a melt quote issued by the mint
    pub fn create_melt_quote(&self, quote: MeltQuote) -> MeltQuote {
        let mut inner = self.lock();
        if let Some(existing) = inner.melt.get(&quote.id) {
            log::debug!("Melt quote {} already recorded", quote.id);
            return existing.clone();
        }
        log::info!(
            "Recorded melt quote {} for {} {} (fee reserve {})",
            quote.id,
            quote.amount,
            quote.unit,
            quote.fee_reserve
        );
        inner.dirty_melt.insert(quote.id.clone());
        inner.melt.insert(quote.id.clone(), quote.clone());
        quote
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    pub fn advance_mint(&self, quote_id: &str, event: MintQuoteEvent, now: u64) -> CashuResult<MintQuoteState> {
        let mut inner = self.lock();
        let quote = inner
            .mint
            .get_mut(quote_id)
            .ok_or_else(|| CashuWalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })?;

        if quote.state.is_terminal() {
            log::debug!(
                "Mint quote {} is terminal ({}); ignoring {}",
                quote_id,
                quote.state,
                event
            );
            return Ok(quote.state);
        }

        let next = next_mint_state(quote.state, &event).ok_or_else(|| {
            CashuWalletError::InvalidQuoteTransition {
                quote_id: quote_id.to_string(),
                from: quote.state.to_string(),
                event: event.to_string(),
            }
        })?;

        match &event {
            MintQuoteEvent::Minted { amount } => quote.amount_minted = Some(*amount),
            MintQuoteEvent::Failed { reason } => quote.failure_reason = Some(reason.clone()),
            _ => {}
        }

        if next != quote.state {
            log::info!("Mint quote {}: {} -> {}", quote_id, quote.state, next);
            quote.state = next;
            quote.updated_at = now;
            inner.dirty_mint.insert(quote_id.to_string());
        }
        Ok(next)
    }

    pub fn advance_melt(&self, quote_id: &str, event: MeltQuoteEvent, now: u64) -> CashuResult<MeltQuoteState> {
        let mut inner = self.lock();
        let quote = inner
            .melt
            .get_mut(quote_id)
            .ok_or_else(|| CashuWalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })?;

        if quote.state.is_terminal() {
            log::debug!(
                "Melt quote {} is terminal ({}); ignoring {}",
                quote_id,
                quote.state,
                event
            );
            return Ok(quote.state);
        }

        let next = next_melt_state(quote, &event).ok_or_else(|| {
            CashuWalletError::InvalidQuoteTransition {
                quote_id: quote_id.to_string(),
                from: quote.state.to_string(),
                event: event.to_string(),
            }
        })?;

        match event {
            MeltQuoteEvent::Dispatched { reservation } => quote.reservation = Some(reservation),
            MeltQuoteEvent::SettlementConfirmed { fee_paid, preimage } => {
                quote.fee_paid = Some(fee_paid);
                quote.preimage = preimage;
            }
            _ => {}
        }

        if next != quote.state {
            log::info!("Melt quote {}: {} -> {}", quote_id, quote.state, next);
            quote.state = next;
            quote.updated_at = now;
        }
        inner.dirty_melt.insert(quote_id.to_string());
        Ok(next)
    }

    /// Expire Pending quotes past their deadline. Paying melts never expire.
    pub fn expire_stale(&self, now: u64) -> ExpiredQuotes {
        let mut inner = self.lock();
        let mut expired = ExpiredQuotes::default();

        for quote in inner.mint.values_mut() {
            if quote.state == MintQuoteState::Pending
                && check_quote_validity(quote.expires_at, now) == QuoteValidity::Expired
            {
                quote.state = MintQuoteState::Expired;
                quote.updated_at = now;
                expired.mint.push(quote.id.clone());
            }
        }
        for quote in inner.melt.values_mut() {
            if quote.state == MeltQuoteState::Pending
                && check_quote_validity(quote.expires_at, now) == QuoteValidity::Expired
            {
                quote.state = MeltQuoteState::Expired;
                quote.updated_at = now;
                expired.melt.push(quote.id.clone());
            }
        }

        inner.dirty_mint.extend(expired.mint.iter().cloned());
        inner.dirty_melt.extend(expired.melt.iter().cloned());

        if !expired.is_empty() {
            log::info!(
                "Expired {} mint quotes and {} melt quotes",
                expired.mint.len(),
                expired.melt.len()
            );
        }
        expired
    }

    /// Drop terminal quotes whose retention window has passed
    pub fn prune(&self, now: u64, retention_secs: u64) -> usize {
        let mut inner = self.lock();
        let cutoff = now.saturating_sub(retention_secs);

        let stale_mint: Vec<String> = inner
            .mint
            .values()
            .filter(|q| q.state.is_terminal() && q.updated_at <= cutoff)
            .map(|q| q.id.clone())
            .collect();
        let stale_melt: Vec<String> = inner
            .melt
            .values()
            .filter(|q| q.state.is_terminal() && q.updated_at <= cutoff)
            .map(|q| q.id.clone())
            .collect();

        let count = stale_mint.len() + stale_melt.len();
        for id in stale_mint {
            inner.mint.remove(&id);
            inner.dirty_mint.remove(&id);
            inner.removed_mint.insert(id);
        }
        for id in stale_melt {
            inner.melt.remove(&id);
            inner.dirty_melt.remove(&id);
            inner.removed_melt.insert(id);
        }

        if count > 0 {
            log::info!("Pruned {} quotes past retention", count);
        }
        count
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get_mint_quote(&self, quote_id: &str) -> Option<MintQuote> {
        self.lock().mint.get(quote_id).cloned()
    }

    pub fn get_melt_quote(&self, quote_id: &str) -> Option<MeltQuote> {
        self.lock().melt.get(quote_id).cloned()
    }

    pub fn mint_quote(&self, quote_id: &str) -> CashuResult<MintQuote> {
        self.get_mint_quote(quote_id)
            .ok_or_else(|| CashuWalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })
    }

    pub fn melt_quote(&self, quote_id: &str) -> CashuResult<MeltQuote> {
        self.get_melt_quote(quote_id)
            .ok_or_else(|| CashuWalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })
    }

    /// Melt quotes with a payment in flight
    pub fn paying_melts(&self) -> Vec<MeltQuote> {
        let mut quotes: Vec<MeltQuote> = self
            .lock()
            .melt
            .values()
            .filter(|q| q.state == MeltQuoteState::Paying)
            .cloned()
            .collect();
        quotes.sort_by_key(|q| q.created_at);
        quotes
    }

    /// Mint quotes not yet minted, expired or failed
    pub fn open_mint_quotes(&self) -> Vec<MintQuote> {
        let mut quotes: Vec<MintQuote> = self
            .lock()
            .mint
            .values()
            .filter(|q| !q.state.is_terminal())
            .cloned()
            .collect();
        quotes.sort_by_key(|q| q.created_at);
        quotes
    }

    pub fn stats(&self) -> QuoteStats {
        let inner = self.lock();
        let mut stats = QuoteStats::default();
        for quote in inner.mint.values() {
            match quote.state {
                MintQuoteState::Pending => stats.pending_mint += 1,
                MintQuoteState::PaymentDetected => stats.paid_unminted += 1,
                _ => stats.terminal += 1,
            }
        }
        for quote in inner.melt.values() {
            match quote.state {
                MeltQuoteState::Pending => stats.pending_melt += 1,
                MeltQuoteState::Paying => stats.paying_melt += 1,
                _ => stats.terminal += 1,
            }
        }
        stats
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn take_pending_writes(&self) -> QuoteWrites {
        let mut inner = self.lock();
        let mint = std::mem::take(&mut inner.dirty_mint)
            .into_iter()
            .filter_map(|id| inner.mint.get(&id).cloned())
            .collect();
        let melt = std::mem::take(&mut inner.dirty_melt)
            .into_iter()
            .filter_map(|id| inner.melt.get(&id).cloned())
            .collect();
        QuoteWrites {
            mint,
            melt,
            removed_mint: std::mem::take(&mut inner.removed_mint).into_iter().collect(),
            removed_melt: std::mem::take(&mut inner.removed_melt).into_iter().collect(),
        }
    }

    pub fn requeue_pending_writes(&self, writes: QuoteWrites) {
        let mut inner = self.lock();
        inner.dirty_mint.extend(writes.mint.into_iter().map(|q| q.id));
        inner.dirty_melt.extend(writes.melt.into_iter().map(|q| q.id));
        inner.removed_mint.extend(writes.removed_mint);
        inner.removed_melt.extend(writes.removed_melt);
    }

    pub fn snapshot(&self) -> QuoteLedgerSnapshot {
        let inner = self.lock();
        QuoteLedgerSnapshot {
            mint: inner.mint.values().cloned().collect(),
            melt: inner.melt.values().cloned().collect(),
        }
    }

    pub fn restore(&self, snapshot: QuoteLedgerSnapshot) {
        let mut inner = self.lock();
        *inner = Inner::default();
        inner.mint = snapshot.mint.into_iter().map(|q| (q.id.clone(), q)).collect();
        inner.melt = snapshot.melt.into_iter().map(|q| (q.id.clone(), q)).collect();
        log::info!(
            "Restored {} mint quotes and {} melt quotes",
            inner.mint.len(),
            inner.melt.len()
        );
    }
}
