//! Receive operations
//!
//! Redeems a token by swapping its proofs at the issuing mint. The mint is
//! the only authority on whether the proofs were already spent, so nothing
//! is credited before the swap succeeds.

use std::sync::Arc;

use super::denomination::split_amount;
use super::errors::{CashuResult, CashuWalletError};
use super::history::NewHistoryItem;
use super::signals::WalletEvent;
use super::token::decode_token;
use super::types::*;
use super::utils::{normalize_mint_url, with_mint_url};
use crate::stores::cashu_mint_client::{with_deadline, MintClientError};
use crate::stores::cashu_wallet::{CashuWallet, WalletInner};

// =============================================================================
// Public API
// =============================================================================

impl CashuWallet {
    /// Redeem a serialized token and return the amount credited.
    ///
    /// `ForeignMint`, `UnitMismatch` and `TokenAlreadySpent` are terminal for
    /// the token; retrying cannot change them.
    pub async fn receive_tokens(&self, token_str: &str) -> CashuResult<u64> {
        let mut token = decode_token(token_str)?;
        let inner = &self.inner;

        token.mint_url = normalize_mint_url(&token.mint_url);
        for proof in &mut token.proofs {
            proof.mint_url = token.mint_url.clone();
        }

        if !inner.mints.contains(&token.mint_url) {
            log::warn!("Rejecting token from untrusted mint {}", token.mint_url);
            return Err(CashuWalletError::ForeignMint {
                mint_url: token.mint_url,
            });
        }
        if token.unit != inner.settings.unit {
            return Err(CashuWalletError::UnitMismatch {
                expected: inner.settings.unit.clone(),
                actual: token.unit,
            });
        }

        let value = token.value().ok_or_else(|| CashuWalletError::MalformedToken {
            reason: "token value overflows".to_string(),
        })?;
        let fee = inner.proofs.config().fee_policy.input_fee(token.proofs.len());
        if value <= fee {
            return Err(CashuWalletError::InsufficientFundsAfterFees {
                available: value,
                required: fee.saturating_add(1),
                fee,
            });
        }

        log::info!(
            "Receiving {} {} ({} proofs, fee {}) from {}",
            value,
            token.unit,
            token.proofs.len(),
            fee,
            token.mint_url
        );

        // New proofs must reach the store even if the caller stops waiting
        let task_inner = Arc::clone(&self.inner);
        tokio::spawn(async move { task_inner.redeem_token(token, value - fee, fee).await })
            .await
            .map_err(|e| CashuWalletError::Internal(format!("receive task failed: {}", e)))?
    }
}

impl WalletInner {
    async fn redeem_token(&self, token: Token, credit: u64, fee: u64) -> CashuResult<u64> {
        let targets = split_amount(credit);
        let swapped = with_deadline(
            "swap",
            self.network_timeout(),
            self.connector.swap(&token.mint_url, &token.proofs, &targets),
        )
        .await;

        let proofs = match swapped {
            Ok(proofs) => with_mint_url(proofs, &token.mint_url),
            Err(MintClientError::Rejected { code, message }) if code.is_token_lost() => {
                log::warn!("Token already spent at {}: {}", token.mint_url, message);
                return Err(CashuWalletError::TokenAlreadySpent);
            }
            Err(e) => {
                if e.is_ambiguous() {
                    log::warn!(
                        "Receive swap at {} interrupted; retrying reports TokenAlreadySpent if the mint completed it",
                        token.mint_url
                    );
                }
                return Err(e.into());
            }
        };

        let added = self.proofs.add_proofs(&token.unit, proofs)?;
        if added.amount != credit {
            log::warn!("Expected {} from receive swap, mint returned {}", credit, added.amount);
        }

        self.history.record(NewHistoryItem {
            kind: TransactionKind::Receive,
            amount: added.amount,
            fee,
            mint_url: token.mint_url.clone(),
            unit: token.unit.clone(),
            status: TransactionStatus::Completed,
            quote_id: None,
            memo: token.memo.clone(),
        });
        self.events.emit(WalletEvent::TokensReceived {
            mint_url: token.mint_url.clone(),
            amount: added.amount,
        });
        self.persist_best_effort("receive_tokens").await;

        log::info!("Received {} {} from {}", added.amount, token.unit, token.mint_url);
        Ok(added.amount)
    }
}
