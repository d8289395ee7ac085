//! Transaction history
//!
//! One entry per public wallet operation. Lightning entries are keyed by
//! quote id so reconciliation can settle them later.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::types::*;
use super::utils::now_secs;
use crate::stores::cashu_wallet::CashuWallet;

/// Fields of a new history entry
#[derive(Debug, Clone)]
pub struct NewHistoryItem {
    pub kind: TransactionKind,
    pub amount: u64,
    pub fee: u64,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub status: TransactionStatus,
    pub quote_id: Option<String>,
    pub memo: Option<String>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, HistoryItem>,
    order: Vec<String>,
    by_quote: HashMap<String, String>,
    dirty: HashSet<String>,
}

#[derive(Default)]
pub struct TransactionHistory {
    inner: Mutex<Inner>,
}

impl TransactionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry and return its id
    pub fn record(&self, new: NewHistoryItem) -> String {
        let now = now_secs();
        let item = HistoryItem {
            id: uuid::Uuid::new_v4().to_string(),
            kind: new.kind,
            amount: new.amount,
            fee: new.fee,
            mint_url: new.mint_url,
            unit: new.unit,
            status: new.status,
            quote_id: new.quote_id,
            memo: new.memo,
            created_at: now,
            updated_at: now,
        };
        let id = item.id.clone();

        let mut inner = self.lock();
        if let Some(quote_id) = &item.quote_id {
            inner.by_quote.insert(quote_id.clone(), id.clone());
        }
        inner.order.push(id.clone());
        inner.dirty.insert(id.clone());
        inner.items.insert(id.clone(), item);
        id
    }

    /// Settle the entry belonging to a quote. Completed and Failed entries
    /// are final; later updates are ignored.
    pub fn settle_quote(&self, quote_id: &str, status: TransactionStatus, amount: Option<u64>, fee: Option<u64>) {
        let mut inner = self.lock();
        let Some(id) = inner.by_quote.get(quote_id).cloned() else {
            log::debug!("No history entry for quote {}", quote_id);
            return;
        };
        let Some(item) = inner.items.get_mut(&id) else {
            return;
        };
        if item.status != TransactionStatus::Pending {
            return;
        }
        item.status = status;
        if let Some(amount) = amount {
            item.amount = amount;
        }
        if let Some(fee) = fee {
            item.fee = fee;
        }
        item.updated_at = now_secs();
        inner.dirty.insert(id);
    }

    pub fn find_by_quote(&self, quote_id: &str) -> Option<HistoryItem> {
        let inner = self.lock();
        inner
            .by_quote
            .get(quote_id)
            .and_then(|id| inner.items.get(id))
            .cloned()
    }

    /// All entries, newest first
    pub fn newest_first(&self) -> Vec<HistoryItem> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub fn take_pending_writes(&self) -> Vec<HistoryItem> {
        let mut inner = self.lock();
        std::mem::take(&mut inner.dirty)
            .into_iter()
            .filter_map(|id| inner.items.get(&id).cloned())
            .collect()
    }

    pub fn requeue_pending_writes(&self, items: Vec<HistoryItem>) {
        let mut inner = self.lock();
        inner.dirty.extend(items.into_iter().map(|item| item.id));
    }

    pub fn restore(&self, mut items: Vec<HistoryItem>) {
        items.sort_by_key(|item| item.created_at);
        let mut inner = self.lock();
        *inner = Inner::default();
        for item in items {
            if let Some(quote_id) = &item.quote_id {
                inner.by_quote.insert(quote_id.clone(), item.id.clone());
            }
            inner.order.push(item.id.clone());
            inner.items.insert(item.id.clone(), item);
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

impl CashuWallet {
    /// Transaction history, newest first
    pub fn transaction_history(&self) -> Vec<HistoryItem> {
        self.inner.history.newest_first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn melt_entry(quote_id: &str) -> NewHistoryItem {
        NewHistoryItem {
            kind: TransactionKind::Melt,
            amount: 50,
            fee: 0,
            mint_url: "https://mint.example.com".to_string(),
            unit: CurrencyUnit::Sat,
            status: TransactionStatus::Pending,
            quote_id: Some(quote_id.to_string()),
            memo: None,
        }
    }

    #[test]
    fn test_settle_quote_is_final() {
        let history = TransactionHistory::new();
        history.record(melt_entry("m1"));
        history.settle_quote("m1", TransactionStatus::Completed, None, Some(2));
        history.settle_quote("m1", TransactionStatus::Failed, None, None);

        let item = history.find_by_quote("m1").unwrap();
        assert_eq!(item.status, TransactionStatus::Completed);
        assert_eq!(item.fee, 2);
    }

    #[test]
    fn test_newest_first() {
        let history = TransactionHistory::new();
        let first = history.record(melt_entry("a"));
        let second = history.record(melt_entry("b"));
        let ids: Vec<String> = history.newest_first().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[test]
    fn test_pending_writes() {
        let history = TransactionHistory::new();
        history.record(melt_entry("a"));
        let writes = history.take_pending_writes();
        assert_eq!(writes.len(), 1);
        assert!(history.take_pending_writes().is_empty());
        history.requeue_pending_writes(writes);
        assert_eq!(history.take_pending_writes().len(), 1);
    }
}
