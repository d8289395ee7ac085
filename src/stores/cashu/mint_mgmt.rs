//! Mint management
//!
//! The set of mints this wallet trusts. `receive_tokens` only accepts tokens
//! from these mints, and a mint can only be removed once it holds no funds.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use super::errors::{CashuResult, CashuWalletError};
use super::utils::normalize_mint_url;
use crate::stores::cashu_wallet::CashuWallet;

#[derive(Default)]
struct Inner {
    mints: BTreeSet<String>,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
}

/// Pending registry changes, drained into a write batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MintWrites {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Normalized set of trusted mint URLs
#[derive(Default)]
pub struct MintRegistry {
    inner: Mutex<Inner>,
}

impl MintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the mint was already present
    pub fn insert(&self, mint_url: &str) -> bool {
        let url = normalize_mint_url(mint_url);
        let mut inner = self.lock();
        if !inner.mints.insert(url.clone()) {
            return false;
        }
        inner.removed.remove(&url);
        inner.added.insert(url);
        true
    }

    pub fn remove(&self, mint_url: &str) -> bool {
        let url = normalize_mint_url(mint_url);
        let mut inner = self.lock();
        if !inner.mints.remove(&url) {
            return false;
        }
        inner.added.remove(&url);
        inner.removed.insert(url);
        true
    }

    pub fn contains(&self, mint_url: &str) -> bool {
        self.lock().mints.contains(&normalize_mint_url(mint_url))
    }

    pub fn list(&self) -> Vec<String> {
        self.lock().mints.iter().cloned().collect()
    }

    pub fn take_pending_writes(&self) -> MintWrites {
        let mut inner = self.lock();
        MintWrites {
            added: std::mem::take(&mut inner.added).into_iter().collect(),
            removed: std::mem::take(&mut inner.removed).into_iter().collect(),
        }
    }

    pub fn requeue_pending_writes(&self, writes: MintWrites) {
        let mut inner = self.lock();
        // A newer change to the same mint wins over the requeued one
        for url in writes.added {
            if inner.mints.contains(&url) && !inner.removed.contains(&url) {
                inner.added.insert(url);
            }
        }
        for url in writes.removed {
            if !inner.mints.contains(&url) && !inner.added.contains(&url) {
                inner.removed.insert(url);
            }
        }
    }

    /// Replace the registry with loaded mints; nothing is marked dirty
    pub fn restore(&self, mints: impl IntoIterator<Item = String>) {
        let mut inner = self.lock();
        *inner = Inner::default();
        inner.mints = mints.into_iter().map(|m| normalize_mint_url(&m)).collect();
    }
}

// =============================================================================
// Public API
// =============================================================================

impl CashuWallet {
    /// Trust a mint. Returns the normalized URL.
    pub async fn add_mint(&self, mint_url: &str) -> CashuResult<String> {
        if mint_url.trim().is_empty() {
            return Err(CashuWalletError::InvalidConfig("mint url is empty".to_string()));
        }
        let url = normalize_mint_url(mint_url);
        if url::Url::parse(&url).is_err() {
            return Err(CashuWalletError::InvalidConfig(format!("invalid mint url: {}", mint_url)));
        }

        if !self.inner.mints.insert(&url) {
            log::debug!("Mint {} already trusted", url);
            return Ok(url);
        }
        self.inner.persist().await?;
        log::info!("Added mint {}", url);
        Ok(url)
    }

    /// Stop trusting a mint. Refused while it still holds unspent or
    /// reserved proofs, and for the default mint.
    pub async fn remove_mint(&self, mint_url: &str) -> CashuResult<()> {
        let url = normalize_mint_url(mint_url);
        if !self.inner.mints.contains(&url) {
            return Err(CashuWalletError::MintNotFound { mint_url: url });
        }
        if url == self.inner.settings.default_mint {
            return Err(CashuWalletError::InvalidConfig(format!(
                "cannot remove default mint {}",
                url
            )));
        }

        let holdings = self.inner.proofs.holdings(&url);
        if holdings > 0 {
            log::warn!("Refusing to remove mint {} holding {}", url, holdings);
            return Err(CashuWalletError::MintHasFunds {
                mint_url: url,
                amount: holdings,
            });
        }

        self.inner.mints.remove(&url);
        self.inner.persist().await?;
        log::info!("Removed mint {}", url);
        Ok(())
    }

    /// Trusted mints, sorted
    pub fn mints(&self) -> Vec<String> {
        self.inner.mints.list()
    }
}
