//! Per-query scratch region with a byte budget.
//!
//! Every artifact a cache operation synthesizes (a reassembled reply, a
//! delegation point, a synthesized CNAME) draws its buffers from one of these.
//! The region enforces the per-query ceiling and the failure mode: when the
//! budget runs out, allocation returns `None` and the caller abandons the
//! whole attempt as a miss. Buffers are owned by the artifact itself, so
//! dropping the artifact releases everything at once and `reset` rearms the
//! budget for the next query.
//!
//! A region is single-threaded by construction (one per in-flight query) and
//! must never be discarded while cache locks are held.
use std::cell::Cell;

/// Default budget, roomy enough for any one reply plus glue.
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct Region {
    limit: usize,
    used: Cell<usize>,
}

impl Region {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_REGION_SIZE)
    }

    pub fn with_limit(limit: usize) -> Self {
        Region {
            limit,
            used: Cell::new(0),
        }
    }

    /// Account for `n` bytes without handing out a buffer. Used for struct
    /// overhead and collections that live inside an artifact.
    pub fn charge(&self, n: usize) -> Option<()> {
        let total = self.used.get().checked_add(n)?;
        if total > self.limit {
            return None;
        }
        self.used.set(total);
        Some(())
    }

    /// Allocate `n` zeroed bytes against the budget.
    pub fn alloc(&self, n: usize) -> Option<Vec<u8>> {
        self.charge(n)?;
        Some(vec![0; n])
    }

    /// Allocate a copy of `src` against the budget.
    pub fn alloc_init(&self, src: &[u8]) -> Option<Vec<u8>> {
        self.charge(src.len())?;
        Some(src.to_vec())
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Rearm the budget. Only sound once artifacts from the previous query
    /// are no longer being built.
    pub fn reset(&self) {
        self.used.set(0);
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}
