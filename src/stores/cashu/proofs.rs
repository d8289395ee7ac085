//! Proof custody
//!
//! The proof store owns every proof the wallet holds, tagged Unspent,
//! Reserved or Spent. Every public method is one critical section on a
//! synchronous mutex, so two reservations can never interleave over the same
//! proofs. The lock is never held across an `.await`.
//!
//! Proofs are never deleted. Each state change is appended to an in-memory
//! transition log that `verify_consistency` can replay.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::errors::{CashuResult, CashuWalletError};
use super::fees::FeePolicy;
use super::selection::{select_proofs, Selection, DEFAULT_EXACT_MATCH_LIMIT};
use super::signals::BalanceView;
use super::types::*;
use super::utils::now_secs;

// =============================================================================
// Reservation Types
// =============================================================================

/// Persisted reservation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: ReservationId,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub secrets: Vec<String>,
    pub amount: u64,
    pub created_at: u64,
    pub expires_at: u64,
    /// Melt quote whose in-flight payment owns these proofs.
    /// Pinned reservations are never released by the watchdog.
    #[serde(default)]
    pub pinned_to: Option<String>,
}

/// Handle returned by `reserve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub mint_url: String,
    pub unit: CurrencyUnit,
    pub selection: Selection,
    pub expires_at: u64,
}

impl Reservation {
    pub fn proofs(&self) -> &[Proof] {
        &self.selection.chosen
    }

    pub fn amount(&self) -> u64 {
        self.selection.total
    }
}

/// A reservation returned to Unspent by a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedReservation {
    pub id: ReservationId,
    pub mint_url: String,
    pub amount: u64,
}

/// Selection parameters applied by `reserve`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStoreConfig {
    pub fee_policy: FeePolicy,
    pub exact_match_limit: usize,
    pub reservation_timeout_secs: u64,
}

impl Default for ProofStoreConfig {
    fn default() -> Self {
        Self {
            fee_policy: FeePolicy::default(),
            exact_match_limit: DEFAULT_EXACT_MATCH_LIMIT,
            reservation_timeout_secs: 300,
        }
    }
}

/// Result of `add_proofs`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedProofs {
    pub added: usize,
    pub amount: u64,
    pub duplicates: usize,
}

// =============================================================================
// Transition Log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    Added,
    Reserved,
    Committed,
    Released,
    MarkedSpent,
    Restored,
}

/// One entry of the append-only transition log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub seq: u64,
    pub secret: String,
    pub from: Option<ProofState>,
    pub to: ProofState,
    pub cause: TransitionCause,
    pub reservation: Option<ReservationId>,
    pub at: u64,
}

/// Records and reservations awaiting persistence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingWrites {
    pub records: Vec<ProofRecord>,
    pub reservations: Vec<ReservationRecord>,
    pub removed_reservations: Vec<ReservationId>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.reservations.is_empty() && self.removed_reservations.is_empty()
    }
}

/// Full store contents, used to restore after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProofStoreSnapshot {
    pub records: Vec<ProofRecord>,
    pub reservations: Vec<ReservationRecord>,
}

// =============================================================================
// Proof Store
// =============================================================================

#[derive(Default)]
struct Inner {
    records: HashMap<String, ProofRecord>,
    /// Secrets in insertion order; keeps selection deterministic
    order: Vec<String>,
    reservations: HashMap<ReservationId, ReservationRecord>,
    log: Vec<Transition>,
    dirty_records: HashSet<String>,
    dirty_reservations: HashSet<ReservationId>,
    removed_reservations: HashSet<ReservationId>,
}

impl Inner {
    fn transition(
        &mut self,
        secret: &str,
        to: ProofState,
        cause: TransitionCause,
        reservation: Option<ReservationId>,
        now: u64,
    ) {
        let Some(record) = self.records.get_mut(secret) else {
            return;
        };
        let from = record.state;
        record.state = to;
        record.reservation = if to.is_reserved() { reservation.clone() } else { None };
        record.state_set_at = now;

        let seq = self.log.len() as u64;
        self.log.push(Transition {
            seq,
            secret: secret.to_string(),
            from: Some(from),
            to,
            cause,
            reservation,
            at: now,
        });
        self.dirty_records.insert(secret.to_string());
    }

    fn insert(&mut self, record: ProofRecord, cause: TransitionCause) {
        let secret = record.proof.secret.clone();
        let seq = self.log.len() as u64;
        self.log.push(Transition {
            seq,
            secret: secret.clone(),
            from: None,
            to: record.state,
            cause,
            reservation: record.reservation.clone(),
            at: record.state_set_at,
        });
        self.order.push(secret.clone());
        self.dirty_records.insert(secret.clone());
        self.records.insert(secret, record);
    }

    /// Resolve a reservation, moving every proof it holds to `to`
    fn resolve(
        &mut self,
        id: &ReservationId,
        to: ProofState,
        cause: TransitionCause,
    ) -> CashuResult<ReservationRecord> {
        let entry = self
            .reservations
            .remove(id)
            .ok_or_else(|| CashuWalletError::ReservationNotFound {
                reservation_id: id.clone(),
            })?;

        let now = now_secs();
        for secret in &entry.secrets {
            let held = self
                .records
                .get(secret)
                .is_some_and(|r| r.state.is_reserved() && r.reservation.as_ref() == Some(id));
            if held {
                self.transition(secret, to, cause, Some(id.clone()), now);
            }
        }

        self.dirty_reservations.remove(id);
        self.removed_reservations.insert(id.clone());
        Ok(entry)
    }

    fn totals(&self) -> (BTreeMap<String, BTreeMap<CurrencyUnit, u64>>, u64) {
        let mut per_mint: BTreeMap<String, BTreeMap<CurrencyUnit, u64>> = BTreeMap::new();
        let mut reserved = 0u64;
        for record in self.records.values() {
            match record.state {
                ProofState::Unspent => {
                    let slot = per_mint
                        .entry(record.proof.mint_url.clone())
                        .or_default()
                        .entry(record.unit.clone())
                        .or_insert(0);
                    *slot = slot.saturating_add(record.proof.amount);
                }
                ProofState::Reserved => reserved = reserved.saturating_add(record.proof.amount),
                ProofState::Spent => {}
            }
        }
        (per_mint, reserved)
    }
}

/// Durable custody of proofs with reservation semantics
pub struct ProofStore {
    inner: Mutex<Inner>,
    balance: BalanceView,
    config: ProofStoreConfig,
}

impl ProofStore {
    pub fn new(config: ProofStoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            balance: BalanceView::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProofStoreConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-section cannot leave a half-applied transition behind:
        // every mutation is a single field write per record.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recompute and publish the balance view. Caller holds the lock.
    fn publish(&self, inner: &Inner) {
        let (per_mint, reserved) = inner.totals();
        self.balance.publish(per_mint, reserved);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Add freshly minted or received proofs as Unspent.
    ///
    /// Proofs whose secret is already held are skipped. All proofs are
    /// validated before any is inserted.
    pub fn add_proofs(&self, unit: &CurrencyUnit, proofs: Vec<Proof>) -> CashuResult<AddedProofs> {
        if let Some(bad) = proofs.iter().find(|p| p.amount == 0 || p.secret.is_empty()) {
            return Err(CashuWalletError::InvalidAmount(format!(
                "proof {} has zero amount or empty secret",
                bad.secret_prefix()
            )));
        }
        if let Some(bad) = proofs.iter().find(|p| p.mint_url.is_empty()) {
            return Err(CashuWalletError::Internal(format!(
                "proof {} has no mint url",
                bad.secret_prefix()
            )));
        }

        let mut inner = self.lock();
        let now = now_secs();
        let mut outcome = AddedProofs::default();
        let mut seen = HashSet::new();

        for proof in proofs {
            if inner.records.contains_key(&proof.secret) || !seen.insert(proof.secret.clone()) {
                log::warn!("Ignoring duplicate proof {}", proof.secret_prefix());
                outcome.duplicates += 1;
                continue;
            }
            outcome.added += 1;
            outcome.amount = outcome.amount.saturating_add(proof.amount);
            inner.insert(
                ProofRecord {
                    proof,
                    unit: unit.clone(),
                    state: ProofState::Unspent,
                    reservation: None,
                    state_set_at: now,
                    added_at: now,
                },
                TransitionCause::Added,
            );
        }

        if outcome.added > 0 {
            self.publish(&inner);
            log::info!(
                "Added {} proofs ({} {}), skipped {} duplicates",
                outcome.added,
                outcome.amount,
                unit,
                outcome.duplicates
            );
        }

        Ok(outcome)
    }

    /// Atomically select Unspent proofs covering `amount` and flip them to Reserved
    pub fn reserve(&self, mint_url: &str, unit: &CurrencyUnit, amount: u64) -> CashuResult<Reservation> {
        let mut inner = self.lock();

        let candidates: Vec<Proof> = inner
            .order
            .iter()
            .filter_map(|secret| inner.records.get(secret))
            .filter(|r| r.state.is_spendable() && r.proof.mint_url == mint_url && &r.unit == unit)
            .map(|r| r.proof.clone())
            .collect();

        let selection = select_proofs(
            &candidates,
            amount,
            &self.config.fee_policy,
            self.config.exact_match_limit,
        )?;

        let id = ReservationId::new();
        let now = now_secs();
        let expires_at = now.saturating_add(self.config.reservation_timeout_secs);
        let secrets: Vec<String> = selection.chosen.iter().map(|p| p.secret.clone()).collect();

        for secret in &secrets {
            inner.transition(secret, ProofState::Reserved, TransitionCause::Reserved, Some(id.clone()), now);
        }

        inner.reservations.insert(
            id.clone(),
            ReservationRecord {
                id: id.clone(),
                mint_url: mint_url.to_string(),
                unit: unit.clone(),
                secrets,
                amount: selection.total,
                created_at: now,
                expires_at,
                pinned_to: None,
            },
        );
        inner.dirty_reservations.insert(id.clone());
        self.publish(&inner);

        log::info!(
            "Reserved {} proofs ({} {}) for target {} as {}",
            selection.chosen.len(),
            selection.total,
            unit,
            amount,
            id
        );

        Ok(Reservation {
            id,
            mint_url: mint_url.to_string(),
            unit: unit.clone(),
            selection,
            expires_at,
        })
    }

    /// Mark every proof of a reservation Spent
    pub fn commit_reservation(&self, id: &ReservationId) -> CashuResult<u64> {
        let mut inner = self.lock();
        let entry = inner.resolve(id, ProofState::Spent, TransitionCause::Committed)?;
        self.publish(&inner);
        log::info!("Committed reservation {} ({} spent)", id, entry.amount);
        Ok(entry.amount)
    }

    /// Return every proof of a reservation to Unspent
    pub fn release_reservation(&self, id: &ReservationId) -> CashuResult<u64> {
        let mut inner = self.lock();
        let entry = inner.resolve(id, ProofState::Unspent, TransitionCause::Released)?;
        self.publish(&inner);
        log::info!("Released reservation {} ({} returned)", id, entry.amount);
        Ok(entry.amount)
    }

    /// Tie a reservation to a melt quote so the watchdog leaves it alone
    pub fn pin_reservation(&self, id: &ReservationId, quote_id: &str) -> CashuResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .reservations
            .get_mut(id)
            .ok_or_else(|| CashuWalletError::ReservationNotFound {
                reservation_id: id.clone(),
            })?;
        entry.pinned_to = Some(quote_id.to_string());
        inner.dirty_reservations.insert(id.clone());
        log::debug!("Pinned reservation {} to melt quote {}", id, quote_id);
        Ok(())
    }

    /// Mark proofs Spent regardless of their current state.
    ///
    /// Used when the mint reports proofs as spent. Reserved proofs are also
    /// detached from their reservation; a reservation left empty is dropped.
    /// Returns the amount newly marked.
    pub fn mark_spent(&self, secrets: &[String]) -> u64 {
        let mut inner = self.lock();
        let now = now_secs();
        let mut amount = 0u64;

        for secret in secrets {
            let Some(record) = inner.records.get(secret) else {
                continue;
            };
            if record.state.is_spent() {
                continue;
            }
            let proof_amount = record.proof.amount;
            amount = amount.saturating_add(proof_amount);
            let holder = record.reservation.clone();
            inner.transition(secret, ProofState::Spent, TransitionCause::MarkedSpent, holder.clone(), now);

            if let Some(res_id) = holder {
                let emptied = match inner.reservations.get_mut(&res_id) {
                    Some(entry) => {
                        entry.secrets.retain(|s| s != secret);
                        entry.amount = entry.amount.saturating_sub(proof_amount);
                        entry.secrets.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    inner.reservations.remove(&res_id);
                    inner.dirty_reservations.remove(&res_id);
                    inner.removed_reservations.insert(res_id);
                } else {
                    inner.dirty_reservations.insert(res_id);
                }
            }
        }

        if amount > 0 {
            self.publish(&inner);
            log::info!("Marked {} as spent", amount);
        }
        amount
    }

    /// Release every unpinned reservation whose deadline is at or before `now`.
    ///
    /// Each reservation is removed as it is released, so a proof returns to
    /// Unspent exactly once even if sweeps overlap.
    pub fn sweep_expired(&self, now: u64) -> Vec<ReleasedReservation> {
        let mut inner = self.lock();
        let expired: Vec<ReservationId> = inner
            .reservations
            .values()
            .filter(|r| r.pinned_to.is_none() && r.expires_at <= now)
            .map(|r| r.id.clone())
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for id in expired {
            if let Ok(entry) = inner.resolve(&id, ProofState::Unspent, TransitionCause::Released) {
                log::warn!(
                    "Watchdog released expired reservation {} ({} at {})",
                    id,
                    entry.amount,
                    entry.mint_url
                );
                released.push(ReleasedReservation {
                    id,
                    mint_url: entry.mint_url,
                    amount: entry.amount,
                });
            }
        }

        if !released.is_empty() {
            self.publish(&inner);
        }
        released
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Σ Unspent for a mint and unit
    pub fn balance(&self, mint_url: &str, unit: &CurrencyUnit) -> u64 {
        self.balance.current().get(mint_url, unit)
    }

    pub fn balances(&self) -> WalletBalance {
        self.balance.current()
    }

    pub fn subscribe_balance(&self) -> watch::Receiver<WalletBalance> {
        self.balance.subscribe()
    }

    /// Σ Unspent + Reserved held at a mint, any unit
    pub fn holdings(&self, mint_url: &str) -> u64 {
        self.lock()
            .records
            .values()
            .filter(|r| r.proof.mint_url == mint_url && !r.state.is_spent())
            .fold(0u64, |acc, r| acc.saturating_add(r.proof.amount))
    }

    /// Proofs at a mint in the given state, insertion order
    pub fn proofs_in_state(&self, mint_url: &str, state: ProofState) -> Vec<Proof> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|secret| inner.records.get(secret))
            .filter(|r| r.state == state && r.proof.mint_url == mint_url)
            .map(|r| r.proof.clone())
            .collect()
    }

    pub fn record(&self, secret: &str) -> Option<ProofRecord> {
        self.lock().records.get(secret).cloned()
    }

    pub fn contains(&self, secret: &str) -> bool {
        self.lock().records.contains_key(secret)
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<ReservationRecord> {
        self.lock().reservations.get(id).cloned()
    }

    pub fn reservations(&self) -> Vec<ReservationRecord> {
        self.lock().reservations.values().cloned().collect()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.lock().log.clone()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Drain records and reservations changed since the last call
    pub fn take_pending_writes(&self) -> PendingWrites {
        let mut inner = self.lock();
        let records = std::mem::take(&mut inner.dirty_records)
            .into_iter()
            .filter_map(|secret| inner.records.get(&secret).cloned())
            .collect();
        let reservations = std::mem::take(&mut inner.dirty_reservations)
            .into_iter()
            .filter_map(|id| inner.reservations.get(&id).cloned())
            .collect();
        let removed_reservations = std::mem::take(&mut inner.removed_reservations)
            .into_iter()
            .collect();
        PendingWrites {
            records,
            reservations,
            removed_reservations,
        }
    }

    /// Put back writes that failed to persist so the next flush retries them
    pub fn requeue_pending_writes(&self, writes: PendingWrites) {
        let mut inner = self.lock();
        for record in writes.records {
            inner.dirty_records.insert(record.proof.secret);
        }
        for reservation in writes.reservations {
            if inner.reservations.contains_key(&reservation.id) {
                inner.dirty_reservations.insert(reservation.id);
            }
        }
        for id in writes.removed_reservations {
            if !inner.reservations.contains_key(&id) {
                inner.removed_reservations.insert(id);
            }
        }
    }

    pub fn snapshot(&self) -> ProofStoreSnapshot {
        let inner = self.lock();
        ProofStoreSnapshot {
            records: inner
                .order
                .iter()
                .filter_map(|secret| inner.records.get(secret).cloned())
                .collect(),
            reservations: inner.reservations.values().cloned().collect(),
        }
    }

    /// Replace the store contents with a persisted snapshot.
    ///
    /// Reserved records whose reservation did not survive are returned to
    /// Unspent; reservation entries pointing at unknown proofs are trimmed.
    pub fn restore(&self, snapshot: ProofStoreSnapshot) {
        let mut inner = self.lock();
        *inner = Inner::default();
        let now = now_secs();

        let mut reservations: HashMap<ReservationId, ReservationRecord> = snapshot
            .reservations
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut orphaned = 0usize;
        for mut record in snapshot.records {
            if inner.records.contains_key(&record.proof.secret) {
                continue;
            }
            if record.state.is_reserved() {
                let held = record
                    .reservation
                    .as_ref()
                    .and_then(|id| reservations.get(id))
                    .is_some_and(|r| r.secrets.contains(&record.proof.secret));
                if !held {
                    record.state = ProofState::Unspent;
                    record.reservation = None;
                    record.state_set_at = now;
                    orphaned += 1;
                }
            } else {
                record.reservation = None;
            }
            inner.insert(record, TransitionCause::Restored);
        }

        for entry in reservations.values_mut() {
            let id = entry.id.clone();
            entry.secrets.retain(|s| {
                inner
                    .records
                    .get(s)
                    .is_some_and(|r| r.state.is_reserved() && r.reservation.as_ref() == Some(&id))
            });
        }
        reservations.retain(|_, r| !r.secrets.is_empty());
        inner.reservations = reservations;

        // Freshly loaded state is already durable
        if orphaned == 0 {
            inner.dirty_records.clear();
        } else {
            log::warn!("Returned {} orphaned reserved proofs to unspent", orphaned);
        }

        self.publish(&inner);
        log::info!(
            "Restored {} proofs and {} reservations",
            inner.records.len(),
            inner.reservations.len()
        );
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Replay the transition log and check it reproduces the current state.
    ///
    /// Also checks that every Reserved proof belongs to exactly one live
    /// reservation and the published balance equals Σ Unspent.
    pub fn verify_consistency(&self) -> CashuResult<()> {
        let inner = self.lock();
        let mut replayed: HashMap<&str, ProofState> = HashMap::new();

        for entry in &inner.log {
            let current = replayed.get(entry.secret.as_str()).copied();
            let legal = match entry.cause {
                TransitionCause::Added => current.is_none() && entry.to == ProofState::Unspent,
                TransitionCause::Restored => current.is_none(),
                TransitionCause::Reserved => current == Some(ProofState::Unspent) && entry.to.is_reserved(),
                TransitionCause::Committed => current == Some(ProofState::Reserved) && entry.to.is_spent(),
                TransitionCause::Released => {
                    current == Some(ProofState::Reserved) && entry.to == ProofState::Unspent
                }
                TransitionCause::MarkedSpent => {
                    matches!(current, Some(s) if !s.is_spent()) && entry.to.is_spent()
                }
            };
            if !legal || entry.from != current {
                return Err(CashuWalletError::Internal(format!(
                    "illegal transition #{} for proof {}: {:?} -> {} ({:?})",
                    entry.seq,
                    entry.secret.chars().take(8).collect::<String>(),
                    current,
                    entry.to,
                    entry.cause
                )));
            }
            replayed.insert(entry.secret.as_str(), entry.to);
        }

        if replayed.len() != inner.records.len() {
            return Err(CashuWalletError::Internal(format!(
                "transition log covers {} proofs, store holds {}",
                replayed.len(),
                inner.records.len()
            )));
        }

        let mut holders: HashMap<&str, &ReservationId> = HashMap::new();
        for entry in inner.reservations.values() {
            for secret in &entry.secrets {
                if holders.insert(secret.as_str(), &entry.id).is_some() {
                    return Err(CashuWalletError::Internal(format!(
                        "proof {} held by two reservations",
                        secret.chars().take(8).collect::<String>()
                    )));
                }
            }
        }

        for (secret, record) in &inner.records {
            if replayed.get(secret.as_str()) != Some(&record.state) {
                return Err(CashuWalletError::Internal(format!(
                    "replayed state diverges for proof {}",
                    record.proof.secret_prefix()
                )));
            }
            let holder = holders.get(secret.as_str()).copied();
            if record.state.is_reserved() != holder.is_some() || (holder.is_some() && record.reservation.as_ref() != holder) {
                return Err(CashuWalletError::Internal(format!(
                    "reservation bookkeeping diverges for proof {}",
                    record.proof.secret_prefix()
                )));
            }
        }

        let (per_mint, reserved) = inner.totals();
        let published = self.balance.current();
        if published.per_mint != per_mint || published.reserved != reserved {
            return Err(CashuWalletError::Internal(
                "published balance diverges from proof store".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Reservation Guard
// =============================================================================

/// Releases a reservation when dropped unless disarmed (RAII pattern).
///
/// Held from `reserve` until the operation either dispatches to the mint or
/// commits. Dropping the guard on an error path or caller cancellation
/// returns the proofs to Unspent.
pub struct ReservationGuard {
    store: Arc<ProofStore>,
    id: ReservationId,
    armed: bool,
}

impl ReservationGuard {
    pub fn new(store: Arc<ProofStore>, id: ReservationId) -> Self {
        Self {
            store,
            id,
            armed: true,
        }
    }

    pub fn id(&self) -> &ReservationId {
        &self.id
    }

    /// Hand ownership of the reservation to the caller
    pub fn disarm(mut self) -> ReservationId {
        self.armed = false;
        self.id.clone()
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.store.release_reservation(&self.id) {
            Ok(amount) => log::debug!("Guard released reservation {} ({})", self.id, amount),
            // Already resolved elsewhere
            Err(e) => log::debug!("Guard found reservation {} resolved: {}", self.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINT: &str = "https://mint.example.com";

    fn proof(amount: u64, secret: &str) -> Proof {
        Proof {
            id: "009a1f293253e41e".to_string(),
            amount,
            secret: secret.to_string(),
            c: "02ab".to_string(),
            mint_url: MINT.to_string(),
        }
    }

    fn store_with(amounts: &[u64]) -> ProofStore {
        let store = ProofStore::new(ProofStoreConfig::default());
        let proofs = amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| proof(a, &format!("secret-{i}")))
            .collect();
        store.add_proofs(&CurrencyUnit::Sat, proofs).unwrap();
        store
    }

    #[test]
    fn test_reserve_excludes_from_balance() {
        let store = store_with(&[64, 32, 4]);
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 100);

        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 36).unwrap();
        assert_eq!(reservation.amount(), 36);
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 64);
        assert_eq!(store.balances().reserved, 36);

        store.release_reservation(&reservation.id).unwrap();
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 100);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn test_commit_marks_spent() {
        let store = store_with(&[64, 32, 4]);
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 64).unwrap();
        assert_eq!(store.commit_reservation(&reservation.id).unwrap(), 64);
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 36);

        let secret = &reservation.proofs()[0].secret;
        assert_eq!(store.record(secret).unwrap().state, ProofState::Spent);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn test_reservation_has_exactly_two_exits() {
        let store = store_with(&[8]);
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        store.commit_reservation(&reservation.id).unwrap();
        assert!(matches!(
            store.release_reservation(&reservation.id),
            Err(CashuWalletError::ReservationNotFound { .. })
        ));
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 0);
    }

    #[test]
    fn test_second_reserve_sees_first_excluded() {
        let store = store_with(&[8, 8]);
        let first = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        let second = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        assert_ne!(first.proofs()[0].secret, second.proofs()[0].secret);
        assert!(matches!(
            store.reserve(MINT, &CurrencyUnit::Sat, 8),
            Err(CashuWalletError::InsufficientFunds { available: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_secrets_ignored() {
        let store = store_with(&[8]);
        let outcome = store
            .add_proofs(&CurrencyUnit::Sat, vec![proof(8, "secret-0"), proof(4, "new"), proof(4, "new")])
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 12);
    }

    #[test]
    fn test_add_rejects_zero_amount() {
        let store = store_with(&[]);
        assert!(store.add_proofs(&CurrencyUnit::Sat, vec![proof(0, "z")]).is_err());
        assert!(!store.contains("z"));
    }

    #[test]
    fn test_units_are_isolated() {
        let store = store_with(&[8]);
        store.add_proofs(&CurrencyUnit::Usd, vec![proof(5, "usd")]).unwrap();
        assert_eq!(store.balance(MINT, &CurrencyUnit::Usd), 5);
        assert!(store.reserve(MINT, &CurrencyUnit::Usd, 8).is_err());
    }

    #[test]
    fn test_sweep_releases_expired_once() {
        let store = store_with(&[8, 4]);
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();

        assert!(store.sweep_expired(reservation.expires_at - 1).is_empty());

        let released = store.sweep_expired(reservation.expires_at);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].amount, 8);
        assert!(store.sweep_expired(reservation.expires_at + 10).is_empty());
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 12);

        let releases = store
            .transitions()
            .iter()
            .filter(|t| t.cause == TransitionCause::Released)
            .count();
        assert_eq!(releases, 1);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn test_sweep_skips_pinned() {
        let store = store_with(&[8]);
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        store.pin_reservation(&reservation.id, "melt-1").unwrap();
        assert!(store.sweep_expired(u64::MAX).is_empty());
        assert_eq!(store.balances().reserved, 8);
    }

    #[test]
    fn test_mark_spent_detaches_from_reservation() {
        let store = store_with(&[8, 4]);
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 12).unwrap();
        let secrets: Vec<String> = reservation.proofs().iter().map(|p| p.secret.clone()).collect();

        assert_eq!(store.mark_spent(&secrets[..1]), reservation.proofs()[0].amount);
        assert_eq!(store.reservation(&reservation.id).unwrap().secrets.len(), 1);

        store.mark_spent(&secrets);
        assert!(store.reservation(&reservation.id).is_none());
        assert_eq!(store.mark_spent(&secrets), 0);
        store.verify_consistency().unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let store = Arc::new(store_with(&[8]));
        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        {
            let _guard = ReservationGuard::new(store.clone(), reservation.id.clone());
        }
        assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), 8);

        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        let guard = ReservationGuard::new(store.clone(), reservation.id.clone());
        let id = guard.disarm();
        assert!(store.reservation(&id).is_some());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let store = store_with(&[8, 4, 2]);
        let kept = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        let spent = store.reserve(MINT, &CurrencyUnit::Sat, 4).unwrap();
        store.commit_reservation(&spent.id).unwrap();

        let mut snapshot = store.snapshot();
        // Lose a reservation entry: its proof must come back as Unspent
        let lost = store.reserve(MINT, &CurrencyUnit::Sat, 2).unwrap();
        snapshot = ProofStoreSnapshot {
            records: store.snapshot().records,
            reservations: snapshot.reservations,
        };

        let restored = ProofStore::new(ProofStoreConfig::default());
        restored.restore(snapshot);
        assert!(restored.reservation(&kept.id).is_some());
        assert!(restored.reservation(&lost.id).is_none());
        assert_eq!(restored.balance(MINT, &CurrencyUnit::Sat), 2);
        assert_eq!(restored.balances().reserved, 8);
        restored.verify_consistency().unwrap();
    }

    #[test]
    fn test_pending_writes_drain_and_requeue() {
        let store = store_with(&[8]);
        let first = store.take_pending_writes();
        assert_eq!(first.records.len(), 1);
        assert!(store.take_pending_writes().is_empty());

        store.requeue_pending_writes(first);
        assert_eq!(store.take_pending_writes().records.len(), 1);

        let reservation = store.reserve(MINT, &CurrencyUnit::Sat, 8).unwrap();
        let writes = store.take_pending_writes();
        assert_eq!(writes.reservations.len(), 1);
        store.commit_reservation(&reservation.id).unwrap();
        let writes = store.take_pending_writes();
        assert_eq!(writes.removed_reservations, vec![reservation.id]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(u64),
        Commit(usize),
        Release(usize),
        Sweep,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..80).prop_map(Op::Reserve),
            (0usize..8).prop_map(Op::Commit),
            (0usize..8).prop_map(Op::Release),
            Just(Op::Sweep),
        ]
    }

    proptest! {
        #[test]
        fn prop_balance_equals_unspent_sum(
            amounts in proptest::collection::vec(1u64..=64, 1..16),
            ops in proptest::collection::vec(op_strategy(), 0..40),
        ) {
            let store = store_with(&amounts);
            let mut open: Vec<Reservation> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(amount) => {
                        if let Ok(r) = store.reserve(MINT, &CurrencyUnit::Sat, amount) {
                            open.push(r);
                        }
                    }
                    Op::Commit(i) if !open.is_empty() => {
                        let r = open.remove(i % open.len());
                        store.commit_reservation(&r.id).unwrap();
                    }
                    Op::Release(i) if !open.is_empty() => {
                        let r = open.remove(i % open.len());
                        store.release_reservation(&r.id).unwrap();
                    }
                    Op::Sweep => {
                        let released = store.sweep_expired(u64::MAX);
                        open.retain(|r| !released.iter().any(|x| x.id == r.id));
                    }
                    _ => {}
                }

                let unspent: u64 = store
                    .proofs_in_state(MINT, ProofState::Unspent)
                    .iter()
                    .map(|p| p.amount)
                    .sum();
                prop_assert_eq!(store.balance(MINT, &CurrencyUnit::Sat), unspent);

                let mut held = HashSet::new();
                for r in &open {
                    for p in r.proofs() {
                        prop_assert!(held.insert(p.secret.clone()), "proof reserved twice");
                    }
                }
            }
            prop_assert!(store.verify_consistency().is_ok());
        }
    }

    #[test]
    fn test_concurrent_reserves_never_overlap() {
        let store = Arc::new(store_with(&[1; 64]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(r) = store.reserve(MINT, &CurrencyUnit::Sat, 3) {
                        got.extend(r.proofs().iter().map(|p| p.secret.clone()));
                    }
                    got
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for secret in handle.join().unwrap() {
                assert!(all.insert(secret), "proof handed to two reservations");
            }
        }
        assert_eq!(all.len(), 63);
        store.verify_consistency().unwrap();
    }
}
