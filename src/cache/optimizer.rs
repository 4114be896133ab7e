use crate::cache::router::SectionedPageCache;
use crate::cache::{CacheError, SectionId};
use crate::storage::BackingStore;

use std::cmp::Ordering;

use tracing::debug;

struct Snapshot {
    id: SectionId,
    size: usize,
    line_size: usize,
    miss_rate: f64,
}

impl<S: BackingStore> SectionedPageCache<S> {
    /// Rebalances section capacities so that each section's share of the
    /// pool (available bytes plus everything currently allocated) is
    /// proportional to its observed miss rate, subject to a floor of two
    /// lines per section.
    ///
    /// An explicit, one-shot operation: nothing invokes it periodically.
    /// With a single section, or when no section has missed, it does
    /// nothing.
    pub fn optimize(&self) -> Result<(), CacheError> {
        let sections = self.sections_snapshot();
        if sections.len() <= 1 {
            return Ok(());
        }

        let mut snapshots: Vec<Snapshot> = sections
            .iter()
            .map(|section| Snapshot {
                id: section.id(),
                size: section.capacity(),
                line_size: section.line_size(),
                miss_rate: section.stats().miss_rate(),
            })
            .collect();

        let total_rate: f64 = snapshots.iter().map(|snap| snap.miss_rate).sum();
        if total_rate <= 0.0 {
            return Ok(());
        }

        // highest miss rate first
        snapshots.sort_by(|a, b| {
            b.miss_rate
                .partial_cmp(&a.miss_rate)
                .unwrap_or(Ordering::Equal)
        });

        let pool: usize =
            self.available_bytes() + snapshots.iter().map(|snap| snap.size).sum::<usize>();

        // proportional share, floored at two lines per section
        let mut targets: Vec<usize> = snapshots
            .iter()
            .map(|snap| {
                let share = (snap.miss_rate / total_rate * pool as f64) as usize;
                share.max(2 * snap.line_size)
            })
            .collect();

        let assigned: usize = targets.iter().sum();
        if assigned > pool {
            // trim from the lowest miss rates upward, never below the floor
            let mut excess = assigned - pool;
            for i in (0..targets.len()).rev() {
                if excess == 0 {
                    break;
                }
                let floor = 2 * snapshots[i].line_size;
                let cut = excess.min(targets[i].saturating_sub(floor));
                targets[i] -= cut;
                excess -= cut;
            }
        } else if assigned < pool {
            // hand the surplus out from the highest miss rate downward;
            // the last section takes whatever division left over
            let mut surplus = pool - assigned;
            let count = targets.len();
            for (i, target) in targets.iter_mut().enumerate() {
                let share = surplus / (count - i);
                *target += share;
                surplus -= share;
            }
        }

        // shrink before growing so freed capacity is available when the
        // growing sections claim it
        let mut plan: Vec<(SectionId, usize, isize)> = snapshots
            .iter()
            .zip(&targets)
            .map(|(snap, &target)| (snap.id, target, target as isize - snap.size as isize))
            .collect();
        plan.sort_by_key(|&(_, _, delta)| delta);

        debug!(sections = plan.len(), pool, ?targets, "optimizer rebalancing");

        for (id, target, _) in plan {
            self.resize_section(id, target)?;
        }

        Ok(())
    }
}
