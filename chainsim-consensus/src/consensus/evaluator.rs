//! Quorum arithmetic shared by the voting protocols.

/// Faulty nodes tolerated among `n`: f = floor((n - 1) / 3).
pub fn fault_tolerance(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// BFT quorum: 2f + 1.
pub fn bft_quorum(n: usize) -> usize {
    2 * fault_tolerance(n) + 1
}

/// Strict majority of `n`.
pub fn is_majority(votes: usize, n: usize) -> bool {
    votes * 2 > n
}

/// Weighted quorum: `voter_stake >= fraction * total_stake`. No stake, no quorum.
pub fn stake_quorum_reached(voter_stake: u64, total_stake: u64, fraction: f64) -> bool {
    if total_stake == 0 {
        return false;
    }
    voter_stake as f64 >= total_stake as f64 * fraction
}
