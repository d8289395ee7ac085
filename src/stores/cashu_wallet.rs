//! Wallet orchestrator
//!
//! `CashuWallet` coordinates the proof store, the quote ledger and the mint
//! connector. Operations live in `stores::cashu::{lightning, send, receive,
//! mint_mgmt, history, proof_recovery}` as further `impl CashuWallet` blocks.
//!
//! In-memory transitions happen first, inside the store critical sections.
//! Dirty records are then flushed to the `WalletDatabase` as one batch.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};

use crate::stores::cashu::errors::{CashuResult, CashuWalletError};
use crate::stores::cashu::history::TransactionHistory;
use crate::stores::cashu::mint_mgmt::{MintRegistry, MintWrites};
use crate::stores::cashu::proofs::ProofStore;
use crate::stores::cashu::quotes::{QuoteLedger, QuoteStats};
use crate::stores::cashu::signals::{EventBus, QuoteLocks, WalletEvent};
use crate::stores::cashu::types::*;
use crate::stores::cashu::utils::{normalize_mint_url, with_read_retry};
use crate::stores::cashu_memory_db::{WalletDatabase, WriteBatch};
use crate::stores::cashu_mint_client::MintConnector;
use crate::stores::settings_store::WalletSettings;

/// Shared wallet state. Spawned settlement tasks hold their own `Arc` so an
/// in-flight spend outlives a dropped caller.
pub(crate) struct WalletInner {
    pub(crate) settings: WalletSettings,
    pub(crate) proofs: Arc<ProofStore>,
    pub(crate) quotes: QuoteLedger,
    pub(crate) history: TransactionHistory,
    pub(crate) mints: MintRegistry,
    pub(crate) connector: Arc<dyn MintConnector>,
    pub(crate) db: Arc<dyn WalletDatabase>,
    pub(crate) events: EventBus,
    pub(crate) quote_locks: QuoteLocks,
    /// Serializes take-and-write so batches reach the database in order
    persist_lock: AsyncMutex<()>,
}

#[derive(Clone)]
pub struct CashuWallet {
    pub(crate) inner: Arc<WalletInner>,
}

impl CashuWallet {
    /// Create an empty wallet. Trusted mints from `settings` are registered.
    pub fn new(
        mut settings: WalletSettings,
        connector: Arc<dyn MintConnector>,
        db: Arc<dyn WalletDatabase>,
    ) -> CashuResult<Self> {
        settings.normalize();
        settings.validate()?;

        let inner = WalletInner {
            proofs: Arc::new(ProofStore::new(settings.proof_store_config())),
            quotes: QuoteLedger::new(),
            history: TransactionHistory::new(),
            mints: MintRegistry::new(),
            connector,
            db,
            events: EventBus::new(),
            quote_locks: QuoteLocks::new(),
            persist_lock: AsyncMutex::new(()),
            settings,
        };
        for mint in &inner.settings.trusted_mints {
            inner.mints.insert(mint);
        }

        log::info!(
            "Wallet created for {} ({} trusted mints, unit {})",
            inner.settings.default_mint,
            inner.settings.trusted_mints.len(),
            inner.settings.unit
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Rebuild a wallet from the database.
    ///
    /// Orphaned Reserved proofs return to Unspent. Reservations pinned to a
    /// Paying melt stay held; call `reconcile_pending_melts` (or let the
    /// watchdog do it) to resolve them.
    pub async fn load(
        settings: WalletSettings,
        connector: Arc<dyn MintConnector>,
        db: Arc<dyn WalletDatabase>,
    ) -> CashuResult<Self> {
        let wallet = Self::new(settings, connector, db)?;
        let inner = &wallet.inner;

        let stored = with_read_retry(
            "load wallet",
            inner.settings.read_retry_attempts,
            inner.settings.read_retry_base_delay(),
            || async { inner.db.load().await.map_err(CashuWalletError::from) },
        )
        .await?;

        let proof_count = stored.proofs.records.len();
        let quote_count = stored.quotes.mint.len() + stored.quotes.melt.len();
        let history_count = stored.history.len();

        inner.proofs.restore(stored.proofs);
        inner.quotes.restore(stored.quotes);
        inner.history.restore(stored.history);

        inner.mints.restore(stored.mints);
        for mint in &inner.settings.trusted_mints {
            // Settings may name mints the database has not seen yet
            inner.mints.insert(mint);
        }

        inner.proofs.verify_consistency()?;
        // Restore may have released orphaned reservations
        inner.persist().await?;

        let paying = inner.quotes.paying_melts().len();
        log::info!(
            "Wallet loaded: {} proofs, {} quotes ({} paying), {} history items",
            proof_count,
            quote_count,
            paying,
            history_count
        );
        Ok(wallet)
    }

    pub fn settings(&self) -> &WalletSettings {
        &self.inner.settings
    }

    /// Unspent balance at the default mint in the wallet unit.
    /// Pure read; never touches the network.
    pub fn balance(&self) -> u64 {
        self.inner
            .proofs
            .balance(&self.inner.settings.default_mint, &self.inner.settings.unit)
    }

    pub fn balance_for(&self, mint_url: &str, unit: &CurrencyUnit) -> u64 {
        self.inner.proofs.balance(&normalize_mint_url(mint_url), unit)
    }

    /// Full per-mint, per-unit balance snapshot
    pub fn balances(&self) -> WalletBalance {
        self.inner.proofs.balances()
    }

    /// Balance updates, in commit order
    pub fn subscribe_balance(&self) -> watch::Receiver<WalletBalance> {
        self.inner.proofs.subscribe_balance()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.inner.events.subscribe()
    }

    pub fn proof_store(&self) -> &ProofStore {
        &self.inner.proofs
    }

    pub fn mint_quote(&self, quote_id: &str) -> CashuResult<MintQuote> {
        self.inner.quotes.mint_quote(quote_id)
    }

    pub fn melt_quote(&self, quote_id: &str) -> CashuResult<MeltQuote> {
        self.inner.quotes.melt_quote(quote_id)
    }

    /// Mint quotes still waiting for payment or issuance, oldest first
    pub fn open_mint_quotes(&self) -> Vec<MintQuote> {
        self.inner.quotes.open_mint_quotes()
    }

    pub fn quote_stats(&self) -> QuoteStats {
        self.inner.quotes.stats()
    }

    /// Flush pending changes to the database
    pub async fn flush(&self) -> CashuResult<()> {
        self.inner.persist().await
    }
}

impl WalletInner {
    /// Resolve the mint an operation targets; it must be trusted
    pub(crate) fn resolve_mint(&self, mint_url: Option<&str>) -> CashuResult<String> {
        let url = match mint_url {
            Some(url) => normalize_mint_url(url),
            None => self.settings.default_mint.clone(),
        };
        if !self.mints.contains(&url) {
            return Err(CashuWalletError::MintNotFound { mint_url: url });
        }
        Ok(url)
    }

    /// Write every pending change as one batch.
    ///
    /// On failure the changes are requeued for the next flush and
    /// `StorageUnavailable` is returned.
    pub(crate) async fn persist(&self) -> CashuResult<()> {
        let _serial = self.persist_lock.lock().await;

        let mints = self.mints.take_pending_writes();
        let batch = WriteBatch {
            proofs: self.proofs.take_pending_writes(),
            quotes: self.quotes.take_pending_writes(),
            history: self.history.take_pending_writes(),
            mints_added: mints.added,
            mints_removed: mints.removed,
        };
        if batch.is_empty() {
            return Ok(());
        }

        match self.db.write_batch(batch.clone()).await {
            Ok(()) => {
                log::debug!(
                    "Persisted {} proofs, {} reservations, {} quotes, {} history items",
                    batch.proofs.records.len(),
                    batch.proofs.reservations.len(),
                    batch.quotes.mint.len() + batch.quotes.melt.len(),
                    batch.history.len()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to persist wallet changes: {}", e);
                self.proofs.requeue_pending_writes(batch.proofs);
                self.quotes.requeue_pending_writes(batch.quotes);
                self.history.requeue_pending_writes(batch.history);
                self.mints.requeue_pending_writes(MintWrites {
                    added: batch.mints_added,
                    removed: batch.mints_removed,
                });
                Err(e.into())
            }
        }
    }

    /// Flush once the mint has already acted, or after a local-only update.
    /// The in-memory result stands; a failed write stays queued for the next
    /// flush.
    pub(crate) async fn persist_best_effort(&self, label: &str) {
        if let Err(e) = self.persist().await {
            log::warn!("{}: state kept in memory, write requeued: {}", label, e);
        }
    }

    pub(crate) fn network_timeout(&self) -> std::time::Duration {
        self.settings.network_timeout()
    }
}
