//! Lightning integration
//!
//! Mint quotes (Lightning → ecash) and melt quotes (ecash → Lightning).
//!
//! A melt is dispatched from a spawned task: once the inputs are on the
//! wire the operation runs to a determinate outcome even if the caller
//! goes away. An ambiguous outcome leaves the quote Paying and its proofs
//! Reserved until `reconcile_melt` hears back from the mint.

use std::sync::Arc;

use super::denomination::split_amount;
use super::errors::{CashuResult, CashuWalletError, NutErrorCode};
use super::history::NewHistoryItem;
use super::proofs::ReservationGuard;
use super::quotes::{check_quote_validity, format_expiry, QuoteValidity};
use super::signals::{ReleaseReason, WalletEvent};
use super::types::*;
use super::utils::{now_secs, with_mint_url, with_read_retry};
use crate::stores::cashu_mint_client::{
    with_deadline, MeltOutcome, MintClientError, RemoteMeltState, RemoteMintQuote, RemoteMintQuoteState,
};
use crate::stores::cashu_wallet::{CashuWallet, WalletInner};

/// Summary of a `reconcile_pending_melts` pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeltReconciliation {
    pub paid: Vec<String>,
    pub refunded: Vec<String>,
    /// Mint still reports the payment in flight
    pub still_paying: Vec<String>,
    pub errors: Vec<(String, CashuWalletError)>,
}

impl MeltReconciliation {
    pub fn is_settled(&self) -> bool {
        self.still_paying.is_empty() && self.errors.is_empty()
    }
}

/// Mint rejections after which a paid quote can never be minted
fn is_irrecoverable_mint_rejection(code: NutErrorCode) -> bool {
    matches!(
        code,
        NutErrorCode::QuoteExpired
            | NutErrorCode::BlindedMessageAlreadySigned
            | NutErrorCode::MintingDisabled
            | NutErrorCode::UnsupportedUnit
            | NutErrorCode::TransactionUnbalanced
            | NutErrorCode::AmountOutOfLimitRange
    )
}

// =============================================================================
// Mint Quote Operations (Lightning → Ecash)
// =============================================================================

impl CashuWallet {
    /// Request a Lightning invoice for `amount` at the default mint.
    ///
    /// Only the quote ledger changes; no proofs exist until `complete_mint`.
    pub async fn receive_funds(&self, amount: u64, description: &str) -> CashuResult<MintQuoteInfo> {
        if amount == 0 {
            return Err(CashuWalletError::InvalidAmount(
                "mint amount must be greater than zero".to_string(),
            ));
        }
        let inner = &self.inner;
        let mint_url = inner.resolve_mint(None)?;
        let unit = inner.settings.unit.clone();
        let description = Some(description.trim()).filter(|d| !d.is_empty());

        log::info!("Creating mint quote for {} {} at {}", amount, unit, mint_url);

        let remote = with_deadline(
            "request_mint_quote",
            inner.network_timeout(),
            inner.connector.request_mint_quote(&mint_url, amount, &unit, description),
        )
        .await?;

        let now = now_secs();
        let expires_at = remote
            .expiry
            .unwrap_or_else(|| now.saturating_add(inner.settings.quote_ttl_secs));

        let quote = inner.quotes.create_mint_quote(MintQuote {
            id: remote.quote_id.clone(),
            mint_url: mint_url.clone(),
            unit: unit.clone(),
            amount_requested: amount,
            payment_request: remote.payment_request.clone(),
            state: MintQuoteState::Pending,
            description: description.map(str::to_string),
            amount_minted: None,
            failure_reason: None,
            created_at: now,
            expires_at,
            updated_at: now,
        });

        let mut state = quote.state;
        if remote.state == RemoteMintQuoteState::Paid && state == MintQuoteState::Pending {
            state = inner.quotes.advance_mint(&quote.id, MintQuoteEvent::PaymentObserved, now)?;
        }

        inner.history.record(NewHistoryItem {
            kind: TransactionKind::Mint,
            amount,
            fee: 0,
            mint_url,
            unit,
            status: TransactionStatus::Pending,
            quote_id: Some(quote.id.clone()),
            memo: description.map(str::to_string),
        });
        inner.persist().await?;

        inner.events.emit(WalletEvent::MintQuoteUpdated {
            quote_id: quote.id.clone(),
            state,
        });
        log::info!(
            "Mint quote {} created (expires in {})",
            quote.id,
            format_expiry(expires_at, now)
        );

        Ok(MintQuoteInfo {
            quote_id: quote.id,
            payment_request: quote.payment_request,
            amount: quote.amount_requested,
            expires_at: quote.expires_at,
        })
    }

    /// Poll the mint for a quote's payment state and advance the ledger
    pub async fn check_mint_quote(&self, quote_id: &str) -> CashuResult<MintQuoteState> {
        let inner = &self.inner;
        let _lock = inner.quote_locks.acquire(quote_id).await;
        let state = inner.poll_mint_quote(quote_id).await?;
        inner.persist_best_effort("check_mint_quote").await;
        Ok(state)
    }

    /// Materialize proofs for a paid quote and return the minted amount.
    ///
    /// A Pending quote is polled once; if still unpaid this fails with
    /// `QuoteNotReady`. Calling again on a Minted quote returns the amount
    /// minted the first time without contacting the mint.
    pub async fn complete_mint(&self, quote_id: &str) -> CashuResult<u64> {
        let inner = Arc::clone(&self.inner);
        let quote_id = quote_id.to_string();
        // Issued proofs must reach the store even if the caller stops waiting
        tokio::spawn(async move { inner.complete_mint(&quote_id).await })
            .await
            .map_err(|e| CashuWalletError::Internal(format!("mint task failed: {}", e)))?
    }
}

impl WalletInner {
    async fn fetch_mint_quote(&self, quote: &MintQuote) -> CashuResult<RemoteMintQuote> {
        with_read_retry(
            "mint quote status",
            self.settings.read_retry_attempts,
            self.settings.read_retry_base_delay(),
            || async {
                with_deadline(
                    "mint_quote_state",
                    self.network_timeout(),
                    self.connector.mint_quote_state(&quote.mint_url, &quote.id),
                )
                .await
                .map_err(CashuWalletError::from)
            },
        )
        .await
    }

    /// Caller holds the quote lock
    pub(crate) async fn poll_mint_quote(&self, quote_id: &str) -> CashuResult<MintQuoteState> {
        let quote = self.quotes.mint_quote(quote_id)?;
        if quote.state.is_terminal() {
            return Ok(quote.state);
        }

        let remote = self.fetch_mint_quote(&quote).await?;
        let now = now_secs();
        let event = match remote.state {
            RemoteMintQuoteState::Paid => Some(MintQuoteEvent::PaymentObserved),
            RemoteMintQuoteState::Issued => Some(MintQuoteEvent::Failed {
                reason: "mint reports the quote issued but this wallet holds no proofs for it".to_string(),
            }),
            RemoteMintQuoteState::Unpaid
                if quote.state == MintQuoteState::Pending
                    && check_quote_validity(quote.expires_at, now) == QuoteValidity::Expired =>
            {
                Some(MintQuoteEvent::TtlElapsed)
            }
            RemoteMintQuoteState::Unpaid => None,
        };

        let Some(event) = event else {
            log::debug!("Mint quote {} still {}", quote_id, quote.state);
            return Ok(quote.state);
        };

        let next = self.quotes.advance_mint(quote_id, event, now)?;
        if next != quote.state {
            if matches!(next, MintQuoteState::Expired | MintQuoteState::Failed) {
                self.history.settle_quote(quote_id, TransactionStatus::Failed, None, None);
            }
            self.events.emit(WalletEvent::MintQuoteUpdated {
                quote_id: quote_id.to_string(),
                state: next,
            });
        }
        Ok(next)
    }

    async fn complete_mint(&self, quote_id: &str) -> CashuResult<u64> {
        let _lock = self.quote_locks.acquire(quote_id).await;

        let mut quote = self.quotes.mint_quote(quote_id)?;
        if quote.state == MintQuoteState::Pending {
            self.poll_mint_quote(quote_id).await?;
            quote = self.quotes.mint_quote(quote_id)?;
        }

        match quote.state {
            MintQuoteState::Minted => {
                let amount = quote.amount_minted.unwrap_or(quote.amount_requested);
                log::debug!("Mint quote {} already minted ({})", quote_id, amount);
                return Ok(amount);
            }
            MintQuoteState::Pending => {
                self.persist_best_effort("complete_mint").await;
                return Err(CashuWalletError::QuoteNotReady {
                    quote_id: quote_id.to_string(),
                    state: quote.state.to_string(),
                });
            }
            MintQuoteState::Expired => {
                self.persist_best_effort("complete_mint").await;
                return Err(CashuWalletError::QuoteExpired {
                    quote_id: quote_id.to_string(),
                });
            }
            MintQuoteState::Failed => {
                self.persist_best_effort("complete_mint").await;
                return Err(CashuWalletError::QuoteFailed {
                    quote_id: quote_id.to_string(),
                    reason: quote.failure_reason.unwrap_or_default(),
                });
            }
            MintQuoteState::PaymentDetected => {}
        }

        let amounts = split_amount(quote.amount_requested);
        log::info!(
            "Minting {} {} for quote {} ({} outputs)",
            quote.amount_requested,
            quote.unit,
            quote_id,
            amounts.len()
        );

        let issued = with_deadline(
            "mint",
            self.network_timeout(),
            self.connector.mint(&quote.mint_url, quote_id, &amounts),
        )
        .await;

        let proofs = match issued {
            Ok(proofs) => with_mint_url(proofs, &quote.mint_url),
            Err(MintClientError::Rejected {
                code: NutErrorCode::QuoteNotPaid | NutErrorCode::QuotePending,
                ..
            }) => {
                return Err(CashuWalletError::QuoteNotReady {
                    quote_id: quote_id.to_string(),
                    state: quote.state.to_string(),
                });
            }
            Err(MintClientError::Rejected { code, message }) if is_irrecoverable_mint_rejection(code) => {
                log::error!("Mint rejected quote {} permanently: {} ({})", quote_id, message, code);
                let state = self.quotes.advance_mint(
                    quote_id,
                    MintQuoteEvent::Failed {
                        reason: message.clone(),
                    },
                    now_secs(),
                )?;
                self.history.settle_quote(quote_id, TransactionStatus::Failed, None, None);
                self.events.emit(WalletEvent::MintQuoteUpdated {
                    quote_id: quote_id.to_string(),
                    state,
                });
                self.persist_best_effort("complete_mint").await;
                return Err(CashuWalletError::QuoteFailed {
                    quote_id: quote_id.to_string(),
                    reason: message,
                });
            }
            // Quote stays PaymentDetected; a later call can retry
            Err(e) => return Err(e.into()),
        };

        let amount = sum_amounts(&proofs)
            .ok_or_else(|| CashuWalletError::Internal("minted amount overflows".to_string()))?;
        if amount != quote.amount_requested {
            log::warn!(
                "Mint issued {} for quote {} requesting {}",
                amount,
                quote_id,
                quote.amount_requested
            );
        }

        self.proofs.add_proofs(&quote.unit, proofs)?;
        let state = self
            .quotes
            .advance_mint(quote_id, MintQuoteEvent::Minted { amount }, now_secs())?;
        self.history
            .settle_quote(quote_id, TransactionStatus::Completed, Some(amount), None);
        self.events.emit(WalletEvent::MintQuoteUpdated {
            quote_id: quote_id.to_string(),
            state,
        });
        self.persist_best_effort("complete_mint").await;

        log::info!("Minted {} {} from quote {}", amount, quote.unit, quote_id);
        Ok(amount)
    }
}

// =============================================================================
// Melt Operations (Ecash → Lightning)
// =============================================================================

impl CashuWallet {
    /// Pay a Lightning invoice from the default mint.
    ///
    /// Returns `paid: false` when the mint confirms the payment failed (the
    /// proofs are back in the balance). Fails with `AmbiguousSettlement` when
    /// the outcome is unknown; the proofs stay Reserved until
    /// `reconcile_melt` resolves it.
    pub async fn send_payment(&self, invoice: &str) -> CashuResult<PaymentResult> {
        let inner = &self.inner;
        let invoice = invoice.trim();
        if invoice.is_empty() {
            return Err(CashuWalletError::InvalidAmount("invoice is empty".to_string()));
        }
        let mint_url = inner.resolve_mint(None)?;
        let unit = inner.settings.unit.clone();

        let remote = with_deadline(
            "request_melt_quote",
            inner.network_timeout(),
            inner.connector.request_melt_quote(&mint_url, invoice, &unit),
        )
        .await?;

        let now = now_secs();
        let quote = inner.quotes.create_melt_quote(MeltQuote {
            id: remote.quote_id.clone(),
            mint_url: mint_url.clone(),
            unit: unit.clone(),
            amount: remote.amount,
            fee_reserve: remote.fee_reserve,
            invoice: invoice.to_string(),
            state: MeltQuoteState::Pending,
            reservation: None,
            fee_paid: None,
            preimage: None,
            created_at: now,
            expires_at: remote
                .expiry
                .unwrap_or_else(|| now.saturating_add(inner.settings.quote_ttl_secs)),
            updated_at: now,
        });
        inner.history.record(NewHistoryItem {
            kind: TransactionKind::Melt,
            amount: quote.amount,
            fee: 0,
            mint_url: mint_url.clone(),
            unit: unit.clone(),
            status: TransactionStatus::Pending,
            quote_id: Some(quote.id.clone()),
            memo: None,
        });

        let required = quote.amount.saturating_add(quote.fee_reserve);
        let reservation = match inner.proofs.reserve(&mint_url, &unit, required) {
            Ok(reservation) => reservation,
            Err(e) => {
                log::warn!("Cannot fund melt {} ({} needed): {}", quote.id, required, e);
                inner.history.settle_quote(&quote.id, TransactionStatus::Failed, None, None);
                inner.persist_best_effort("send_payment").await;
                return Err(e);
            }
        };
        let guard = ReservationGuard::new(Arc::clone(&inner.proofs), reservation.id.clone());

        inner.proofs.pin_reservation(guard.id(), &quote.id)?;
        inner.quotes.advance_melt(
            &quote.id,
            MeltQuoteEvent::Dispatched {
                reservation: reservation.id.clone(),
            },
            now_secs(),
        )?;

        // No await between disarm and spawn: the task owns the reservation
        let reservation_id = guard.disarm();
        let inputs = reservation.proofs().to_vec();
        let task_inner = Arc::clone(&self.inner);
        let quote_id = quote.id.clone();
        tokio::spawn(async move { task_inner.persist_and_dispatch_melt(&quote_id, reservation_id, inputs).await })
            .await
            .map_err(|e| CashuWalletError::Internal(format!("melt task failed: {}", e)))?
    }

    /// Re-query a Paying melt and settle it if the mint has an answer.
    /// Non-Paying quotes are returned as-is.
    pub async fn reconcile_melt(&self, quote_id: &str) -> CashuResult<MeltQuoteState> {
        let inner = &self.inner;
        let _lock = inner.quote_locks.acquire(quote_id).await;

        let quote = inner.quotes.melt_quote(quote_id)?;
        if quote.state != MeltQuoteState::Paying {
            return Ok(quote.state);
        }

        let outcome = inner.query_melt(&quote).await?;
        let state = inner.resolve_melt(&quote, outcome)?;
        inner.persist_best_effort("reconcile_melt").await;
        Ok(state)
    }

    /// Reconcile every melt left Paying, e.g. after a restart
    pub async fn reconcile_pending_melts(&self) -> MeltReconciliation {
        let mut summary = MeltReconciliation::default();
        let paying = self.inner.quotes.paying_melts();
        if paying.is_empty() {
            return summary;
        }
        log::info!("Reconciling {} paying melt quotes", paying.len());

        for quote in paying {
            match self.reconcile_melt(&quote.id).await {
                Ok(MeltQuoteState::Paid) => summary.paid.push(quote.id),
                Ok(MeltQuoteState::FailedRefundable) => summary.refunded.push(quote.id),
                Ok(_) => summary.still_paying.push(quote.id),
                Err(e) => {
                    log::warn!("Could not reconcile melt {}: {}", quote.id, e);
                    summary.errors.push((quote.id, e));
                }
            }
        }
        summary
    }
}

impl WalletInner {
    /// The Paying record must be durable before the inputs leave. If it
    /// cannot be written the melt is abandoned and the proofs released.
    async fn persist_and_dispatch_melt(
        &self,
        quote_id: &str,
        reservation_id: ReservationId,
        inputs: Vec<Proof>,
    ) -> CashuResult<PaymentResult> {
        if let Err(e) = self.persist().await {
            log::warn!("Melt {} abandoned before dispatch: {}", quote_id, e);
            match self.proofs.release_reservation(&reservation_id) {
                Ok(amount) => self.events.emit(WalletEvent::ReservationReleased {
                    reservation_id: reservation_id.clone(),
                    amount,
                    reason: ReleaseReason::Aborted,
                }),
                Err(release_err) => log::error!("Failed to release {}: {}", reservation_id, release_err),
            }
            if let Err(advance_err) = self
                .quotes
                .advance_melt(quote_id, MeltQuoteEvent::SettlementFailed, now_secs())
            {
                log::error!("Failed to abandon melt {}: {}", quote_id, advance_err);
            }
            self.history.settle_quote(quote_id, TransactionStatus::Failed, None, None);
            return Err(e);
        }
        self.dispatch_melt(quote_id, reservation_id, inputs).await
    }

    /// Runs inside a spawned task so the outcome is always recorded
    async fn dispatch_melt(
        &self,
        quote_id: &str,
        reservation_id: ReservationId,
        inputs: Vec<Proof>,
    ) -> CashuResult<PaymentResult> {
        let _lock = self.quote_locks.acquire(quote_id).await;

        let quote = self.quotes.melt_quote(quote_id)?;
        if quote.state != MeltQuoteState::Paying || self.proofs.reservation(&reservation_id).is_none() {
            log::warn!("Melt {} resolved before dispatch ({})", quote_id, quote.state);
            return self.payment_result(quote_id);
        }

        log::info!(
            "Dispatching melt {} ({} inputs, {} {})",
            quote_id,
            inputs.len(),
            sum_amounts(&inputs).unwrap_or(0),
            quote.unit
        );

        let sent = with_deadline(
            "melt",
            self.network_timeout(),
            self.connector.melt(&quote.mint_url, quote_id, &inputs),
        )
        .await;

        let state = match sent {
            Ok(outcome) => self.resolve_melt(&quote, outcome)?,
            Err(MintClientError::Rejected { code, message }) => {
                if code.is_token_lost() {
                    if let Err(e) = self.mark_spent_at_mint(&quote.mint_url, &inputs).await {
                        log::warn!("Spent check after melt rejection failed: {}", e);
                    }
                }
                // Confirm with the mint before releasing anything
                match self.query_melt(&quote).await {
                    Ok(outcome) => {
                        let state = self.resolve_melt(&quote, outcome)?;
                        if state == MeltQuoteState::FailedRefundable {
                            self.persist_best_effort("send_payment").await;
                            return Err(if code.is_token_lost() {
                                CashuWalletError::TokenAlreadySpent
                            } else {
                                CashuWalletError::MintRejected { code, message }
                            });
                        }
                        state
                    }
                    Err(e) => {
                        log::warn!("Melt {} rejected and status unknown: {}", quote_id, e);
                        MeltQuoteState::Paying
                    }
                }
            }
            Err(e) => {
                log::warn!("Melt {} outcome unknown: {}", quote_id, e);
                MeltQuoteState::Paying
            }
        };

        self.persist_best_effort("send_payment").await;
        match state {
            MeltQuoteState::Paying => Err(CashuWalletError::AmbiguousSettlement {
                quote_id: quote_id.to_string(),
            }),
            _ => self.payment_result(quote_id),
        }
    }

    async fn query_melt(&self, quote: &MeltQuote) -> CashuResult<MeltOutcome> {
        with_read_retry(
            "melt quote status",
            self.settings.read_retry_attempts,
            self.settings.read_retry_base_delay(),
            || async {
                with_deadline(
                    "melt_quote_state",
                    self.network_timeout(),
                    self.connector.melt_quote_state(&quote.mint_url, &quote.id),
                )
                .await
                .map_err(CashuWalletError::from)
            },
        )
        .await
    }

    fn payment_result(&self, quote_id: &str) -> CashuResult<PaymentResult> {
        let quote = self.quotes.melt_quote(quote_id)?;
        match quote.state {
            MeltQuoteState::Paying => Err(CashuWalletError::AmbiguousSettlement {
                quote_id: quote.id,
            }),
            state => Ok(PaymentResult {
                paid: state == MeltQuoteState::Paid,
                amount: quote.amount,
                fee: quote.fee_paid.unwrap_or(0),
                preimage: quote.preimage,
                quote_id: quote.id,
            }),
        }
    }

    /// Apply a mint-reported outcome to a Paying quote. Caller holds the
    /// quote lock.
    pub(crate) fn resolve_melt(&self, quote: &MeltQuote, outcome: MeltOutcome) -> CashuResult<MeltQuoteState> {
        let current = self.quotes.melt_quote(&quote.id)?;
        if current.state != MeltQuoteState::Paying {
            return Ok(current.state);
        }
        match outcome.state {
            RemoteMeltState::Paid => self.settle_melt_paid(&current, outcome),
            RemoteMeltState::Failed | RemoteMeltState::Unpaid => self.settle_melt_failed(&current),
            RemoteMeltState::Pending => {
                log::info!("Melt {} still pending at mint", quote.id);
                Ok(MeltQuoteState::Paying)
            }
        }
    }

    fn settle_melt_paid(&self, quote: &MeltQuote, outcome: MeltOutcome) -> CashuResult<MeltQuoteState> {
        let spent = match &quote.reservation {
            Some(id) => self.proofs.commit_reservation(id).unwrap_or_else(|e| {
                log::error!("Melt {} paid but reservation unavailable: {}", quote.id, e);
                0
            }),
            None => {
                log::error!("Melt {} paid without a reservation", quote.id);
                0
            }
        };

        let change = with_mint_url(outcome.change, &quote.mint_url);
        let change_amount = sum_amounts(&change).unwrap_or(0);
        if !change.is_empty() {
            match self.proofs.add_proofs(&quote.unit, change) {
                Ok(added) => log::info!("Melt {} returned {} change", quote.id, added.amount),
                Err(e) => log::error!("Melt {} change rejected: {}", quote.id, e),
            }
        }

        // Effective cost beyond the invoice: lightning fee plus input fees
        let fee = if spent > 0 {
            spent.saturating_sub(quote.amount).saturating_sub(change_amount)
        } else {
            outcome.fee_paid
        };

        let state = self.quotes.advance_melt(
            &quote.id,
            MeltQuoteEvent::SettlementConfirmed {
                fee_paid: fee,
                preimage: outcome.preimage,
            },
            now_secs(),
        )?;
        self.history
            .settle_quote(&quote.id, TransactionStatus::Completed, None, Some(fee));
        self.events.emit(WalletEvent::MeltQuoteUpdated {
            quote_id: quote.id.clone(),
            state,
        });
        log::info!("Melt {} paid: {} + fee {}", quote.id, quote.amount, fee);
        Ok(state)
    }

    fn settle_melt_failed(&self, quote: &MeltQuote) -> CashuResult<MeltQuoteState> {
        if let Some(id) = &quote.reservation {
            match self.proofs.release_reservation(id) {
                Ok(amount) => self.events.emit(WalletEvent::ReservationReleased {
                    reservation_id: id.clone(),
                    amount,
                    reason: ReleaseReason::SettlementFailed,
                }),
                Err(e) => log::debug!("Melt {} reservation already resolved: {}", quote.id, e),
            }
        }

        let state = self
            .quotes
            .advance_melt(&quote.id, MeltQuoteEvent::SettlementFailed, now_secs())?;
        self.history
            .settle_quote(&quote.id, TransactionStatus::Failed, None, None);
        self.events.emit(WalletEvent::MeltQuoteUpdated {
            quote_id: quote.id.clone(),
            state,
        });
        log::warn!("Melt {} failed at mint; inputs returned", quote.id);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::cashu::testing::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mint_flow_and_idempotence() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        assert_eq!(wallet.balance(), 0);

        let info = wallet.receive_funds(100, "test").await.unwrap();
        assert!(!info.payment_request.is_empty());

        let err = wallet.complete_mint(&info.quote_id).await.unwrap_err();
        assert!(matches!(err, CashuWalletError::QuoteNotReady { .. }));
        assert_eq!(wallet.mint_quote(&info.quote_id).unwrap().state, MintQuoteState::Pending);

        mint.pay_quote(&info.quote_id);
        assert_eq!(wallet.complete_mint(&info.quote_id).await.unwrap(), 100);
        assert_eq!(wallet.balance(), 100);
        let proof_count = wallet.proof_store().snapshot().records.len();

        assert_eq!(wallet.complete_mint(&info.quote_id).await.unwrap(), 100);
        assert_eq!(wallet.balance(), 100);
        assert_eq!(wallet.proof_store().snapshot().records.len(), proof_count);
        assert_eq!(mint.mint_calls(), 1);

        let history = wallet.transaction_history();
        assert_eq!(history[0].kind, TransactionKind::Mint);
        assert_eq!(history[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_check_mint_quote_observes_payment() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        let info = wallet.receive_funds(21, "").await.unwrap();

        assert_eq!(wallet.check_mint_quote(&info.quote_id).await.unwrap(), MintQuoteState::Pending);
        mint.pay_quote(&info.quote_id);
        assert_eq!(
            wallet.check_mint_quote(&info.quote_id).await.unwrap(),
            MintQuoteState::PaymentDetected
        );
        // Paid but not minted: nothing in the balance yet
        assert_eq!(wallet.balance(), 0);
        assert_eq!(wallet.open_mint_quotes().len(), 1);
    }

    #[tokio::test]
    async fn test_receive_funds_rejects_zero() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        assert!(matches!(
            wallet.receive_funds(0, "").await,
            Err(CashuWalletError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_send_payment_paid_returns_change() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        fund_wallet(&wallet, &mint, 100).await;
        mint.set_melt_fee(1);

        // 50 + 4 fee reserve
        let invoice = mint.invoice(50, 4);
        let result = wallet.send_payment(&invoice).await.unwrap();
        assert!(result.paid);
        assert_eq!(result.amount, 50);
        assert_eq!(result.fee, 1);
        assert_eq!(wallet.balance(), 49);
        assert_eq!(wallet.melt_quote(&result.quote_id).unwrap().state, MeltQuoteState::Paid);
        assert!(wallet.proof_store().reservations().is_empty());
        wallet.proof_store().verify_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_send_payment_failure_refunds() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        fund_wallet(&wallet, &mint, 100).await;
        mint.set_melt_behavior(MeltBehavior::Fail);

        let result = wallet.send_payment(&mint.invoice(50, 2)).await.unwrap();
        assert!(!result.paid);
        assert_eq!(wallet.balance(), 100);
        assert_eq!(
            wallet.melt_quote(&result.quote_id).unwrap().state,
            MeltQuoteState::FailedRefundable
        );
        let history = wallet.transaction_history();
        assert_eq!(history[0].status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_payment_timeout_leaves_quote_paying() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        fund_wallet(&wallet, &mint, 100).await;
        mint.set_melt_behavior(MeltBehavior::TimeoutThen(RemoteMeltState::Pending));

        let invoice = mint.invoice(50, 2);
        let err = wallet.send_payment(&invoice).await.unwrap_err();
        let CashuWalletError::AmbiguousSettlement { quote_id } = err else {
            panic!("expected ambiguous settlement, got {:?}", err);
        };

        let quote = wallet.melt_quote(&quote_id).unwrap();
        assert_eq!(quote.state, MeltQuoteState::Paying);
        let reservation = quote.reservation.clone().unwrap();
        let held = wallet.proof_store().reservation(&reservation).unwrap();
        for secret in &held.secrets {
            assert_eq!(wallet.proof_store().record(secret).unwrap().state, ProofState::Reserved);
        }
        assert!(wallet.balance() < 100);

        // The watchdog never releases a pinned reservation
        wallet.proof_store().sweep_expired(u64::MAX);
        assert!(wallet.proof_store().reservation(&reservation).is_some());

        // Still pending at the mint
        assert_eq!(wallet.reconcile_melt(&quote_id).await.unwrap(), MeltQuoteState::Paying);

        mint.settle_melt(&quote_id, RemoteMeltState::Paid);
        assert_eq!(wallet.reconcile_melt(&quote_id).await.unwrap(), MeltQuoteState::Paid);
        assert!(wallet.proof_store().reservation(&reservation).is_none());
        // 64 reserved for 50 at zero fee: 14 comes back as change
        assert_eq!(wallet.balance(), 50);
        wallet.proof_store().verify_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_refunds_failed_melt() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        fund_wallet(&wallet, &mint, 64).await;
        mint.set_melt_behavior(MeltBehavior::TimeoutThen(RemoteMeltState::Unpaid));

        let err = wallet.send_payment(&mint.invoice(32, 2)).await.unwrap_err();
        assert_eq!(err.kind(), crate::stores::cashu::errors::ErrorKind::AmbiguousSettlement);

        let summary = wallet.reconcile_pending_melts().await;
        assert_eq!(summary.refunded.len(), 1);
        assert!(summary.is_settled());
        assert_eq!(wallet.balance(), 64);
    }

    #[tokio::test]
    async fn test_send_payment_insufficient_funds() {
        let mint = FakeMint::new();
        let (wallet, _db) = test_wallet(&mint);
        fund_wallet(&wallet, &mint, 10).await;

        let err = wallet.send_payment(&mint.invoice(50, 2)).await.unwrap_err();
        assert!(err.is_insufficient_funds());
        assert_eq!(wallet.balance(), 10);
        assert!(wallet.proof_store().reservations().is_empty());
        assert_eq!(mint.melt_calls(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_before_dispatch_releases() {
        let mint = FakeMint::new();
        let db = FlakyDatabase::new();
        let wallet = test_wallet_with_db(&mint, db.clone());
        fund_wallet(&wallet, &mint, 100).await;

        db.fail_writes(true);
        let err = wallet.send_payment(&mint.invoice(50, 2)).await.unwrap_err();
        assert!(matches!(err, CashuWalletError::StorageUnavailable(_)));
        assert_eq!(wallet.balance(), 100);
        assert_eq!(mint.melt_calls(), 0);
        assert!(wallet.proof_store().reservations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_payment_keeps_quote_and_proofs_in_step() {
        let mint = FakeMint::new();
        let db = FlakyDatabase::new();
        let wallet = test_wallet_with_db(&mint, db.clone());
        fund_wallet(&wallet, &mint, 100).await;

        // The caller gives up while the Paying record is being written
        db.set_write_delay(Duration::from_secs(1));
        let invoice = mint.invoice(50, 2);
        let attempt = tokio::time::timeout(Duration::from_millis(10), wallet.send_payment(&invoice)).await;
        assert!(attempt.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mint.melt_calls(), 1);
        assert!(wallet.proof_store().reservations().is_empty());
        assert_eq!(wallet.balance(), 50);
        assert_eq!(wallet.transaction_history()[0].status, TransactionStatus::Completed);
        wallet.proof_store().verify_consistency().unwrap();
    }
}
