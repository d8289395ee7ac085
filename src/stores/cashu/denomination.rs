//! Denomination Splitting
//!
//! Mints issue proofs in power-of-two denominations. These helpers compute
//! the output amounts requested from the mint for swaps and mints.

// =============================================================================
// Splitting
// =============================================================================

/// Split an amount into power-of-two denominations, ascending.
///
/// `split_amount(13) == [1, 4, 8]`. Zero yields an empty split.
pub fn split_amount(amount: u64) -> Vec<u64> {
    (0..64)
        .map(|bit| 1u64 << bit)
        .filter(|denom| amount & denom != 0)
        .collect()
}

/// Output amounts for a swap that yields an exact `send` part and a `change` part.
///
/// Send denominations come first so the caller can take `split_amount(send).len()`
/// outputs as the exact-amount set.
pub fn swap_targets(send: u64, change: u64) -> Vec<u64> {
    let mut targets = split_amount(send);
    targets.extend(split_amount(change));
    targets
}

// =============================================================================
// Tests
// =============================================================================
