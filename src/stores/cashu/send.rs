//! Send operations
//!
//! Produces ecash tokens for peer-to-peer transfer. When the selected proofs
//! overshoot the amount they are first swapped at the mint into an
//! exact-amount set plus change; the change goes straight back to the store
//! as Unspent.

use std::sync::Arc;

use super::denomination::{split_amount, swap_targets};
use super::errors::{CashuResult, CashuWalletError};
use super::fees::FeeEstimate;
use super::history::NewHistoryItem;
use super::proofs::{Reservation, ReservationGuard};
use super::selection::select_proofs;
use super::signals::{ReleaseReason, WalletEvent};
use super::token::encode_token;
use super::types::*;
use super::utils::with_mint_url;
use crate::stores::cashu_mint_client::{with_deadline, MintClientError, SpentState};
use crate::stores::cashu_wallet::{CashuWallet, WalletInner};

// =============================================================================
// Public API
// =============================================================================

impl CashuWallet {
    /// Send `amount` from the default mint as a serialized token
    pub async fn send_tokens(&self, amount: u64) -> CashuResult<String> {
        self.send_tokens_with_options(amount, SendOptions::default()).await
    }

    pub async fn send_tokens_with_options(&self, amount: u64, options: SendOptions) -> CashuResult<String> {
        if amount == 0 {
            return Err(CashuWalletError::InvalidAmount(
                "send amount must be greater than zero".to_string(),
            ));
        }
        let inner = &self.inner;
        let mint_url = inner.resolve_mint(options.mint_url.as_deref())?;
        let unit = inner.settings.unit.clone();
        let memo = options
            .memo
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let reservation = inner.proofs.reserve(&mint_url, &unit, amount)?;
        let guard = ReservationGuard::new(Arc::clone(&inner.proofs), reservation.id.clone());

        if !reservation.selection.requires_swap {
            // Exact match: hand the proofs over as-is. A swap must balance,
            // so any overshoot, dust included, comes back as change below.
            let token = encode_token(reservation.proofs(), &mint_url, &unit, memo.as_deref())?;
            let reservation_id = guard.disarm();
            let sent = inner.proofs.commit_reservation(&reservation_id)?;
            inner.record_send(&mint_url, &unit, sent, sent.saturating_sub(amount), memo);
            inner.persist_best_effort("send_tokens").await;
            log::info!("Sent {} {} from {} without swap", sent, unit, mint_url);
            return Ok(token);
        }

        // No await between disarm and spawn: the task owns the reservation
        let task_inner = Arc::clone(&self.inner);
        let _ = guard.disarm();
        tokio::spawn(async move { task_inner.swap_and_send(reservation, amount, memo).await })
            .await
            .map_err(|e| CashuWalletError::Internal(format!("send task failed: {}", e)))?
    }

    /// Input fee a send of `amount` would cost right now.
    /// Pure read; nothing is reserved.
    pub fn estimate_send_fee(&self, amount: u64) -> CashuResult<FeeEstimate> {
        let inner = &self.inner;
        let mint_url = inner.resolve_mint(None)?;
        let candidates: Vec<Proof> = inner
            .proofs
            .proofs_in_state(&mint_url, ProofState::Unspent)
            .into_iter()
            .filter(|p| {
                inner
                    .proofs
                    .record(&p.secret)
                    .is_some_and(|r| r.unit == inner.settings.unit)
            })
            .collect();
        let config = inner.proofs.config();
        let selection = select_proofs(&candidates, amount, &config.fee_policy, config.exact_match_limit)?;
        Ok(FeeEstimate {
            proof_count: selection.proof_count(),
            fee_ppk: config.fee_policy.input_fee_ppk,
            total_fee: selection.fee,
        })
    }
}

// =============================================================================
// Swap Path
// =============================================================================

impl WalletInner {
    fn record_send(&self, mint_url: &str, unit: &CurrencyUnit, amount: u64, fee: u64, memo: Option<String>) {
        self.history.record(NewHistoryItem {
            kind: TransactionKind::Send,
            amount,
            fee,
            mint_url: mint_url.to_string(),
            unit: unit.clone(),
            status: TransactionStatus::Completed,
            quote_id: None,
            memo,
        });
        self.events.emit(WalletEvent::TokensSent {
            mint_url: mint_url.to_string(),
            amount,
        });
    }

    fn release_aborted(&self, id: &ReservationId) {
        match self.proofs.release_reservation(id) {
            Ok(amount) => self.events.emit(WalletEvent::ReservationReleased {
                reservation_id: id.clone(),
                amount,
                reason: ReleaseReason::Aborted,
            }),
            Err(e) => log::debug!("Reservation {} already resolved: {}", id, e),
        }
    }

    /// Runs inside a spawned task
    async fn swap_and_send(&self, reservation: Reservation, amount: u64, memo: Option<String>) -> CashuResult<String> {
        let mint_url = reservation.mint_url.clone();
        let unit = reservation.unit.clone();
        let change = reservation.selection.overage();
        let targets = swap_targets(amount, change);
        let send_count = split_amount(amount).len();

        log::info!(
            "Swapping {} proofs ({} {}) into {} send + {} change",
            reservation.proofs().len(),
            reservation.amount(),
            unit,
            amount,
            change
        );

        let swapped = with_deadline(
            "swap",
            self.network_timeout(),
            self.connector.swap(&mint_url, reservation.proofs(), &targets),
        )
        .await;

        let outputs = match swapped {
            Ok(outputs) => with_mint_url(outputs, &mint_url),
            Err(MintClientError::Rejected { code, message }) => {
                if code.is_token_lost() {
                    if let Err(e) = self.mark_spent_at_mint(&mint_url, reservation.proofs()).await {
                        log::warn!("Spent check after swap rejection failed: {}", e);
                    }
                }
                self.release_aborted(&reservation.id);
                self.persist_best_effort("send_tokens").await;
                return Err(if code.is_token_lost() {
                    CashuWalletError::TokenAlreadySpent
                } else {
                    CashuWalletError::MintRejected { code, message }
                });
            }
            Err(e) => {
                self.reconcile_interrupted_swap(&reservation).await;
                self.persist_best_effort("send_tokens").await;
                return Err(e.into());
            }
        };

        // The mint consumed the inputs
        if let Err(e) = self.proofs.commit_reservation(&reservation.id) {
            log::error!("Swap succeeded but reservation {} unavailable: {}", reservation.id, e);
        }

        let matches_targets = outputs.len() == targets.len()
            && outputs.iter().zip(&targets).all(|(p, target)| p.amount == *target);
        if !matches_targets {
            log::error!(
                "Mint returned {} swap outputs, expected {:?}; keeping all as unspent",
                outputs.len(),
                targets
            );
            self.proofs.add_proofs(&unit, outputs)?;
            self.persist_best_effort("send_tokens").await;
            return Err(CashuWalletError::Internal(
                "mint returned unexpected swap outputs".to_string(),
            ));
        }

        let mut send = outputs;
        let change = send.split_off(send_count);
        let change_amount = sum_amounts(&change).unwrap_or(0);
        if !change.is_empty() {
            self.proofs.add_proofs(&unit, change)?;
        }

        let token = match encode_token(&send, &mint_url, &unit, memo.as_deref()) {
            Ok(token) => token,
            Err(e) => {
                // Keep the value rather than drop it
                self.proofs.add_proofs(&unit, send)?;
                self.persist_best_effort("send_tokens").await;
                return Err(e);
            }
        };

        let fee = reservation
            .amount()
            .saturating_sub(amount)
            .saturating_sub(change_amount);
        self.record_send(&mint_url, &unit, amount, fee, memo);
        self.persist_best_effort("send_tokens").await;

        log::info!("Sent {} {} from {} ({} change)", amount, unit, mint_url, change_amount);
        Ok(token)
    }

    /// A swap timed out or the connection dropped. Ask the mint what happened
    /// to the inputs before touching the reservation.
    async fn reconcile_interrupted_swap(&self, reservation: &Reservation) {
        let states = match self.spent_states(&reservation.mint_url, reservation.proofs()).await {
            Ok(states) => states,
            Err(e) => {
                log::warn!(
                    "Cannot check inputs of interrupted swap; reservation {} left for the watchdog: {}",
                    reservation.id,
                    e
                );
                return;
            }
        };

        let spent: Vec<String> = reservation
            .proofs()
            .iter()
            .zip(&states)
            .filter(|(_, state)| **state == SpentState::Spent)
            .map(|(p, _)| p.secret.clone())
            .collect();
        let pending = states.iter().any(|s| *s == SpentState::Pending);

        if !spent.is_empty() {
            let amount = self.proofs.mark_spent(&spent);
            log::error!(
                "Interrupted swap consumed {} inputs ({}); outputs were not received",
                spent.len(),
                amount
            );
        }
        if pending {
            log::warn!(
                "Inputs of reservation {} pending at mint; left for the watchdog",
                reservation.id
            );
            return;
        }
        self.release_aborted(&reservation.id);
    }
}
