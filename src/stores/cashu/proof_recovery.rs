//! Proof State Recovery
//!
//! Brings local custody state back in line with the mint after timeouts,
//! crashes and external spends:
//! - `check_pending_proofs` asks the mint which Unspent proofs are gone
//! - the watchdog releases expired reservations, expires stale quotes and
//!   reconciles melts left Paying

use std::collections::BTreeMap;

use tokio::task::JoinHandle;

use super::errors::{CashuResult, CashuWalletError};
use super::lightning::MeltReconciliation;
use super::signals::{ReleaseReason, WalletEvent, MAX_SYNC_INPUT_SIZE};
use super::types::*;
use super::utils::{now_secs, with_read_retry};
use crate::stores::cashu_mint_client::{with_deadline, SpentState};
use crate::stores::cashu_wallet::{CashuWallet, WalletInner};

// =============================================================================
// Result Types
// =============================================================================

/// Result of a `check_pending_proofs` pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCheckSummary {
    /// Proofs sent to the mint for checking
    pub checked: usize,
    /// Proofs newly marked Spent
    pub spent: usize,
    /// Value newly marked Spent
    pub amount: u64,
    /// Mint -> error, for mints that could not be checked
    pub errors: Vec<(String, String)>,
}

/// Outcome of one watchdog pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchdogReport {
    pub released_reservations: usize,
    pub released_amount: u64,
    pub expired_quotes: usize,
    pub pruned_quotes: usize,
    pub melts: MeltReconciliation,
}

impl WatchdogReport {
    pub fn is_idle(&self) -> bool {
        self.released_reservations == 0
            && self.expired_quotes == 0
            && self.pruned_quotes == 0
            && self.melts == MeltReconciliation::default()
    }
}

/// Spent proofs discovered at a mint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SpentAtMint {
    pub count: usize,
    pub amount: u64,
}

// =============================================================================
// Mint Spend Checks
// =============================================================================

impl WalletInner {
    /// NUT-07 state of each proof, same order as `proofs`.
    /// Batched so no request exceeds `MAX_SYNC_INPUT_SIZE`.
    pub(crate) async fn spent_states(&self, mint_url: &str, proofs: &[Proof]) -> CashuResult<Vec<SpentState>> {
        let mut states = Vec::with_capacity(proofs.len());
        for batch in proofs.chunks(MAX_SYNC_INPUT_SIZE) {
            let batch_states = with_read_retry(
                "check spent",
                self.settings.read_retry_attempts,
                self.settings.read_retry_base_delay(),
                || async {
                    with_deadline(
                        "check_spent",
                        self.network_timeout(),
                        self.connector.check_spent(mint_url, batch),
                    )
                    .await
                    .map_err(CashuWalletError::from)
                },
            )
            .await?;

            if batch_states.len() != batch.len() {
                return Err(CashuWalletError::Internal(format!(
                    "mint returned {} spend states for {} proofs",
                    batch_states.len(),
                    batch.len()
                )));
            }
            states.extend(batch_states);
        }
        Ok(states)
    }

    /// Ask the mint about `proofs` and mark the spent ones locally
    pub(crate) async fn mark_spent_at_mint(&self, mint_url: &str, proofs: &[Proof]) -> CashuResult<SpentAtMint> {
        let states = self.spent_states(mint_url, proofs).await?;
        let spent: Vec<String> = proofs
            .iter()
            .zip(&states)
            .filter(|(_, state)| **state == SpentState::Spent)
            .map(|(p, _)| p.secret.clone())
            .collect();
        if spent.is_empty() {
            return Ok(SpentAtMint::default());
        }

        let amount = self.proofs.mark_spent(&spent);
        let found = SpentAtMint {
            count: spent.len(),
            amount,
        };
        if amount > 0 {
            log::warn!("Mint {} reports {} proofs ({}) already spent", mint_url, found.count, amount);
            self.events.emit(WalletEvent::ProofsSpentAtMint {
                mint_url: mint_url.to_string(),
                count: found.count,
                amount,
            });
        }
        Ok(found)
    }
}

// =============================================================================
// Public API
// =============================================================================

impl CashuWallet {
    /// Check Unspent proofs against the mint and mark the ones spent
    /// elsewhere. `None` checks every trusted mint.
    pub async fn check_pending_proofs(&self, mint_url: Option<&str>) -> CashuResult<PendingCheckSummary> {
        let inner = &self.inner;
        let mints = match mint_url {
            Some(url) => vec![inner.resolve_mint(Some(url))?],
            None => inner.mints.list(),
        };

        let mut summary = PendingCheckSummary::default();
        for mint in mints {
            let proofs = inner.proofs.proofs_in_state(&mint, ProofState::Unspent);
            if proofs.is_empty() {
                continue;
            }
            log::info!("Checking {} unspent proofs at {}", proofs.len(), mint);

            match inner.mark_spent_at_mint(&mint, &proofs).await {
                Ok(found) => {
                    summary.checked += proofs.len();
                    summary.spent += found.count;
                    summary.amount = summary.amount.saturating_add(found.amount);
                }
                Err(e) => {
                    log::warn!("Spent check at {} failed: {}", mint, e);
                    // A single requested mint is the whole answer
                    if mint_url.is_some() {
                        return Err(e);
                    }
                    summary.errors.push((mint, e.to_string()));
                }
            }
        }

        if summary.spent > 0 {
            inner.persist_best_effort("check_pending_proofs").await;
        }
        Ok(summary)
    }

    /// One watchdog pass at time `now` (unix seconds)
    pub async fn run_watchdog_pass(&self, now: u64) -> WatchdogReport {
        let inner = &self.inner;
        let mut report = WatchdogReport::default();

        for released in inner.proofs.sweep_expired(now) {
            report.released_reservations += 1;
            report.released_amount = report.released_amount.saturating_add(released.amount);
            inner.events.emit(WalletEvent::ReservationReleased {
                reservation_id: released.id,
                amount: released.amount,
                reason: ReleaseReason::Expired,
            });
        }

        let expired = inner.quotes.expire_stale(now);
        report.expired_quotes = expired.mint.len() + expired.melt.len();
        for quote_id in &expired.mint {
            inner
                .history
                .settle_quote(quote_id, TransactionStatus::Failed, None, None);
            inner.events.emit(WalletEvent::MintQuoteUpdated {
                quote_id: quote_id.clone(),
                state: MintQuoteState::Expired,
            });
        }
        for quote_id in &expired.melt {
            inner
                .history
                .settle_quote(quote_id, TransactionStatus::Failed, None, None);
            inner.events.emit(WalletEvent::MeltQuoteUpdated {
                quote_id: quote_id.clone(),
                state: MeltQuoteState::Expired,
            });
        }

        report.pruned_quotes = inner.quotes.prune(now, inner.settings.quote_retention_secs);
        report.melts = self.reconcile_pending_melts().await;

        if !report.is_idle() {
            log::info!(
                "Watchdog: released {} reservations ({}), expired {} quotes, pruned {}, melts paid {} refunded {} paying {}",
                report.released_reservations,
                report.released_amount,
                report.expired_quotes,
                report.pruned_quotes,
                report.melts.paid.len(),
                report.melts.refunded.len(),
                report.melts.still_paying.len()
            );
        }
        inner.persist_best_effort("watchdog").await;
        report
    }

    /// Run the watchdog every `watchdog_interval_secs` until the handle is
    /// stopped or dropped. Must be called inside a tokio runtime.
    pub fn spawn_watchdog(&self) -> WatchdogHandle {
        let wallet = self.clone();
        let period = self.inner.settings.watchdog_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                wallet.run_watchdog_pass(now_secs()).await;
            }
        });
        log::info!("Watchdog started (every {:?})", period);
        WatchdogHandle { task: Some(task) }
    }

    /// Reserved value per mint, for diagnostics
    pub fn reserved_by_mint(&self) -> BTreeMap<String, u64> {
        let mut reserved = BTreeMap::new();
        for reservation in self.inner.proofs.reservations() {
            let entry = reserved.entry(reservation.mint_url).or_insert(0u64);
            *entry = entry.saturating_add(reservation.amount);
        }
        reserved
    }
}

/// Background watchdog task; aborted when dropped
#[derive(Debug)]
pub struct WatchdogHandle {
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn stop(mut self) {
        self.abort();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::info!("Watchdog stopped");
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.abort();
    }
}
