//! Fee Policy
//!
//! Per-input fees charged by the mint (NUT-02 `input_fee_ppk`) and the dust
//! threshold below which change is absorbed rather than requested.

use serde::{Deserialize, Serialize};

/// Fee configuration consulted by the coin selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Fee per input proof, parts per thousand
    pub input_fee_ppk: u64,
    /// Overage strictly below this is absorbed as fee instead of swapped into change
    pub dust_threshold: u64,
}

impl FeePolicy {
    pub fn new(input_fee_ppk: u64, dust_threshold: u64) -> Self {
        Self {
            input_fee_ppk,
            dust_threshold,
        }
    }

    /// Fee for spending `proof_count` inputs
    pub fn input_fee(&self, proof_count: usize) -> u64 {
        calculate_proof_fee(proof_count, self.input_fee_ppk)
    }

    pub fn is_dust(&self, overage: u64) -> bool {
        overage < self.dust_threshold
    }
}

/// Calculate fee for a number of proofs
pub fn calculate_proof_fee(proof_count: usize, fee_ppk: u64) -> u64 {
    // ceil(proof_count * fee_ppk / 1000)
    let base = (proof_count as u64).saturating_mul(fee_ppk);
    base.saturating_add(999) / 1000
}

/// Fee estimation result for a prospective spend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeEstimate {
    pub proof_count: usize,
    pub fee_ppk: u64,
    pub total_fee: u64,
}
