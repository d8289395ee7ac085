//! Coin Selection
//!
//! Chooses which Unspent proofs back a spend. Small candidate sets are first
//! searched for an exact match (no change output needed); otherwise proofs are
//! taken largest-first until target plus input fees is covered.
//!
//! Pure functions only. The proof store calls into this while holding its
//! lock, so nothing here may block or allocate unboundedly.

use super::errors::{CashuResult, CashuWalletError};
use super::fees::FeePolicy;
use super::types::Proof;

/// Default ceiling on candidate count for the exact-match search
pub const DEFAULT_EXACT_MATCH_LIMIT: usize = 20;

/// Outcome of a selection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    /// Chosen proofs, largest first
    pub chosen: Vec<Proof>,
    /// Σ chosen
    pub total: u64,
    pub target: u64,
    /// Input fee for spending `chosen` at the mint
    pub fee: u64,
    /// Overage that must come back as change via a swap
    pub change_needed: u64,
    /// Overage below the dust threshold. Not worth its own change output,
    /// but a swap must still balance, so sends request it back.
    pub dust_absorbed: u64,
    /// True when the chosen proofs must be swapped before handing out `target`
    pub requires_swap: bool,
}

impl Selection {
    pub fn proof_count(&self) -> usize {
        self.chosen.len()
    }

    /// Σ chosen beyond target + fee, dust included
    pub fn overage(&self) -> u64 {
        self.change_needed.saturating_add(self.dust_absorbed)
    }
}

/// Select proofs covering `target` plus the input fee of the chosen set.
///
/// Fails with `InsufficientFunds` when Σ candidates < target and with
/// `InsufficientFundsAfterFees` when the target alone is coverable but no
/// subset covers target + fee.
pub fn select_proofs(
    candidates: &[Proof],
    target: u64,
    policy: &FeePolicy,
    exact_match_limit: usize,
) -> CashuResult<Selection> {
    if target == 0 {
        return Err(CashuWalletError::InvalidAmount(
            "selection target must be greater than zero".to_string(),
        ));
    }

    let available = candidates
        .iter()
        .fold(0u64, |acc, p| acc.saturating_add(p.amount));

    if available < target {
        return Err(CashuWalletError::InsufficientFunds {
            available,
            required: target,
        });
    }

    let mut sorted: Vec<&Proof> = candidates.iter().filter(|p| p.amount > 0).collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    if sorted.len() <= exact_match_limit {
        if let Some(indices) = find_exact_match(&sorted, target, policy) {
            let chosen: Vec<Proof> = indices.iter().map(|&i| sorted[i].clone()).collect();
            let total = chosen.iter().fold(0u64, |acc, p| acc.saturating_add(p.amount));
            let fee = policy.input_fee(chosen.len());
            log::debug!(
                "Exact match: {} proofs totalling {} for target {} (fee {})",
                chosen.len(),
                total,
                target,
                fee
            );
            return Ok(Selection {
                chosen,
                total,
                target,
                fee,
                change_needed: 0,
                dust_absorbed: 0,
                requires_swap: false,
            });
        }
    }

    select_greedy(&sorted, target, policy, available)
}

/// Largest-first accumulation. Because each prefix holds the largest proofs,
/// if any k-subset covers target + fee(k) then the k-prefix does too.
fn select_greedy(
    sorted: &[&Proof],
    target: u64,
    policy: &FeePolicy,
    available: u64,
) -> CashuResult<Selection> {
    let mut total = 0u64;

    for (idx, proof) in sorted.iter().enumerate() {
        total = total.saturating_add(proof.amount);
        let count = idx + 1;
        let fee = policy.input_fee(count);
        let required = target.saturating_add(fee);

        if total >= required {
            let overage = total - required;
            let (change_needed, dust_absorbed) = if overage == 0 || policy.is_dust(overage) {
                (0, overage)
            } else {
                (overage, 0)
            };

            log::debug!(
                "Greedy selection: {} proofs totalling {} for target {} (fee {}, change {}, dust {})",
                count,
                total,
                target,
                fee,
                change_needed,
                dust_absorbed
            );

            return Ok(Selection {
                chosen: sorted[..count].iter().map(|p| (*p).clone()).collect(),
                total,
                target,
                fee,
                change_needed,
                dust_absorbed,
                requires_swap: overage > 0,
            });
        }
    }

    let fee = policy.input_fee(sorted.len());
    Err(CashuWalletError::InsufficientFundsAfterFees {
        available,
        required: target.saturating_add(fee),
        fee,
    })
}

/// Depth-first search for the smallest subset summing to exactly target + fee(k).
///
/// `sorted` must be in descending amount order. Returns indices into `sorted`.
fn find_exact_match(sorted: &[&Proof], target: u64, policy: &FeePolicy) -> Option<Vec<usize>> {
    // suffix[i] = Σ sorted[i..]
    let mut suffix = vec![0u64; sorted.len() + 1];
    for i in (0..sorted.len()).rev() {
        suffix[i] = suffix[i + 1].saturating_add(sorted[i].amount);
    }

    let mut search = ExactSearch {
        sorted,
        suffix: &suffix,
        target,
        policy,
        path: Vec::new(),
        best: None,
    };
    search.descend(0, 0);
    search.best
}

struct ExactSearch<'a> {
    sorted: &'a [&'a Proof],
    suffix: &'a [u64],
    target: u64,
    policy: &'a FeePolicy,
    path: Vec<usize>,
    best: Option<Vec<usize>>,
}

impl ExactSearch<'_> {
    fn descend(&mut self, start: usize, sum: u64) {
        let count = self.path.len();
        let needed = self.target.saturating_add(self.policy.input_fee(count));

        if count > 0 && sum == needed {
            if self.best.as_ref().map_or(true, |b| count < b.len()) {
                self.best = Some(self.path.clone());
            }
            return;
        }

        // Adding a proof can only grow the path; stop once it can't beat the best
        if self
            .best
            .as_ref()
            .is_some_and(|b| count + 1 >= b.len())
        {
            return;
        }

        let mut last_amount = None;
        for i in start..self.sorted.len() {
            let amount = self.sorted[i].amount;

            // Equal amounts at the same depth lead to identical sums
            if last_amount == Some(amount) {
                continue;
            }
            last_amount = Some(amount);

            let next_sum = sum.saturating_add(amount);
            let next_needed = self.target.saturating_add(self.policy.input_fee(count + 1));

            if next_sum > next_needed.saturating_add(self.max_extra_fee(count + 1)) {
                continue;
            }
            if sum.saturating_add(self.suffix[i]) < next_needed {
                // Remaining proofs are all smaller; nothing further can reach the target
                break;
            }

            self.path.push(i);
            self.descend(i + 1, next_sum);
            self.path.pop();
        }
    }

    /// Upper bound on how much the fee can still grow beyond fee(count)
    fn max_extra_fee(&self, count: usize) -> u64 {
        let max_fee = self.policy.input_fee(self.sorted.len());
        max_fee.saturating_sub(self.policy.input_fee(count))
    }
}
