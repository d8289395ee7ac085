/// Wallet persistence boundary and in-memory implementation
///
/// `WalletDatabase` is the persistent store collaborator: every write is a
/// `WriteBatch` applied atomically. `MemoryDatabase` keeps everything in
/// process memory, for tests and for embedders that persist elsewhere.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::stores::cashu::errors::CashuWalletError;
use crate::stores::cashu::proofs::{PendingWrites, ProofStoreSnapshot, ReservationRecord};
use crate::stores::cashu::quotes::{QuoteLedgerSnapshot, QuoteWrites};
use crate::stores::cashu::types::{HistoryItem, MeltQuote, MintQuote, ProofRecord, ReservationId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError(pub String);

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "database error: {}", self.0)
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for CashuWalletError {
    fn from(err: DatabaseError) -> Self {
        CashuWalletError::StorageUnavailable(err.0)
    }
}

/// Changes applied in one atomic write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub proofs: PendingWrites,
    pub quotes: QuoteWrites,
    pub history: Vec<HistoryItem>,
    pub mints_added: Vec<String>,
    pub mints_removed: Vec<String>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
            && self.quotes.is_empty()
            && self.history.is_empty()
            && self.mints_added.is_empty()
            && self.mints_removed.is_empty()
    }
}

/// Everything needed to rebuild a wallet after restart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredWallet {
    pub proofs: ProofStoreSnapshot,
    pub quotes: QuoteLedgerSnapshot,
    pub history: Vec<HistoryItem>,
    pub mints: Vec<String>,
}

#[async_trait]
pub trait WalletDatabase: Send + Sync {
    /// Apply every change in `batch` or none of them
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError>;

    async fn load(&self) -> Result<StoredWallet, DatabaseError>;
}

#[derive(Debug, Default)]
struct Tables {
    proofs: HashMap<String, ProofRecord>,
    /// Insertion order of proof secrets
    proof_order: Vec<String>,
    reservations: HashMap<ReservationId, ReservationRecord>,
    mint_quotes: HashMap<String, MintQuote>,
    melt_quotes: HashMap<String, MeltQuote>,
    history: HashMap<String, HistoryItem>,
    mints: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn proof_count(&self) -> usize {
        self.tables.read().await.proofs.len()
    }
}

#[async_trait]
impl WalletDatabase for MemoryDatabase {
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        // One write lock for the whole batch keeps it atomic to readers
        let mut tables = self.tables.write().await;

        for record in batch.proofs.records {
            let secret = record.proof.secret.clone();
            if tables.proofs.insert(secret.clone(), record).is_none() {
                tables.proof_order.push(secret);
            }
        }
        for reservation in batch.proofs.reservations {
            tables.reservations.insert(reservation.id.clone(), reservation);
        }
        for id in batch.proofs.removed_reservations {
            tables.reservations.remove(&id);
        }

        for quote in batch.quotes.mint {
            tables.mint_quotes.insert(quote.id.clone(), quote);
        }
        for quote in batch.quotes.melt {
            tables.melt_quotes.insert(quote.id.clone(), quote);
        }
        for id in batch.quotes.removed_mint {
            tables.mint_quotes.remove(&id);
        }
        for id in batch.quotes.removed_melt {
            tables.melt_quotes.remove(&id);
        }

        for item in batch.history {
            tables.history.insert(item.id.clone(), item);
        }
        for mint in batch.mints_added {
            tables.mints.insert(mint);
        }
        for mint in batch.mints_removed {
            tables.mints.remove(&mint);
        }
        Ok(())
    }

    async fn load(&self) -> Result<StoredWallet, DatabaseError> {
        let tables = self.tables.read().await;
        let mut history: Vec<HistoryItem> = tables.history.values().cloned().collect();
        history.sort_by_key(|item| item.created_at);

        Ok(StoredWallet {
            proofs: ProofStoreSnapshot {
                records: tables
                    .proof_order
                    .iter()
                    .filter_map(|secret| tables.proofs.get(secret).cloned())
                    .collect(),
                reservations: tables.reservations.values().cloned().collect(),
            },
            quotes: QuoteLedgerSnapshot {
                mint: tables.mint_quotes.values().cloned().collect(),
                melt: tables.melt_quotes.values().cloned().collect(),
            },
            history,
            mints: tables.mints.iter().cloned().collect(),
        })
    }
}
