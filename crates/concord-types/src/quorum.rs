//! Byzantine quorum arithmetic.
//!
//! All functions are pure and total. For a committee of `n = 3f + 1`
//! members, [`quorum`] is `2f + 1`.

/// Maximum number of simultaneously faulty members tolerated by `n`.
pub const fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Minimum number of members whose agreement is binding.
pub const fn quorum(n: usize) -> usize {
    n - max_faulty(n)
}

/// Smallest group guaranteed to contain at least one honest member.
pub const fn min_fair(n: usize) -> usize {
    max_faulty(n) + 1
}
