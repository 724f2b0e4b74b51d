//! Static partition of dendrites across the process group.
//!
//! Every participating rank gets a contiguous range of global dendrite
//! indices. Sizes differ by at most one; the remainder goes to the
//! lowest-indexed participants.

use core::ops::Range;

use crate::config::OwnerPolicy;

/// Rank that owns and advances the soma.
pub const SOMA_OWNER: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    ranges: Vec<Range<usize>>,
}

impl Assignment {
    /// Partition `dendrites` over a group of `processes` ranks.
    ///
    /// Returns an all-empty assignment when no rank participates; callers
    /// validate the topology through `SimConfig::validate` first.
    pub fn compute(dendrites: usize, processes: usize, policy: OwnerPolicy) -> Self {
        let first_owner = match policy {
            OwnerPolicy::SharesDendrites => 0,
            OwnerPolicy::Dedicated => 1,
        };
        let participants = processes.saturating_sub(first_owner);

        let mut ranges = vec![0..0; processes];
        if participants == 0 {
            return Self { ranges };
        }

        let base = dendrites / participants;
        let remainder = dendrites % participants;

        let mut start = 0;
        for (i, range) in ranges.iter_mut().skip(first_owner).enumerate() {
            let count = base + usize::from(i < remainder);
            *range = start..start + count;
            start += count;
        }
        Self { ranges }
    }

    pub fn processes(&self) -> usize {
        self.ranges.len()
    }

    /// Global dendrite indices owned by `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        self.ranges.get(rank).cloned().unwrap_or(0..0)
    }

    pub fn count(&self, rank: usize) -> usize {
        self.range(rank).len()
    }

    pub fn total(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }
}
