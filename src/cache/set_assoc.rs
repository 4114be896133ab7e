use crate::cache::CacheError;
use crate::cache::section::{Slot, spill};
use crate::pages::{Page, PageId};
use crate::storage::BackingStore;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::trace;

/// N-way set-associative storage with clock replacement per set.
///
/// The set for identifier `id` is `id mod num_sets`. The reference bit
/// is an atomic, so a hit sets it under the section's shared lock. Each
/// set rotates its own hand, clearing reference bits as it advances; the
/// first unpinned slot with a clear bit is the victim. Pinned slots are
/// skipped.
pub(crate) struct SetAssociative {
    sets: Vec<ClockSet>,
}

struct ClockSet {
    slots: Vec<Slot>,
    hand: usize,
}

impl SetAssociative {
    pub(crate) fn new(num_sets: usize, ways: usize) -> Self {
        Self {
            sets: (0..num_sets)
                .map(|_| ClockSet {
                    slots: (0..ways).map(|_| Slot::empty()).collect(),
                    hand: 0,
                })
                .collect(),
        }
    }

    fn set_index(&self, id: PageId) -> usize {
        id.get() as usize % self.sets.len()
    }

    pub(crate) fn lookup(&self, id: PageId) -> Option<Arc<Page>> {
        let set = &self.sets[self.set_index(id)];
        set.slots
            .iter()
            .find(|slot| slot.id == id && slot.page.is_some())
            .and_then(|slot| slot.page.clone())
    }

    pub(crate) fn touch(&self, id: PageId) {
        let set = &self.sets[self.set_index(id)];
        if let Some(slot) = set
            .slots
            .iter()
            .find(|slot| slot.id == id && slot.page.is_some())
        {
            slot.referenced.store(true, Ordering::Relaxed);
        }
    }

    /// Clock sweep. Two full rotations are enough: the first clears the
    /// reference bit of every unpinned slot, the second must then find
    /// one clear unless every slot in the set is pinned.
    fn find_victim(set: &mut ClockSet) -> Result<usize, CacheError> {
        if let Some(way) = set.slots.iter().position(|slot| slot.page.is_none()) {
            return Ok(way);
        }

        let ways = set.slots.len();
        for _ in 0..2 * ways {
            let way = set.hand;
            set.hand = (set.hand + 1) % ways;

            let slot = &set.slots[way];
            let pinned = slot
                .page
                .as_ref()
                .is_some_and(|page| page.pin_count() > 0);
            if pinned {
                continue;
            }
            if slot.referenced.load(Ordering::Relaxed) {
                slot.referenced.store(false, Ordering::Relaxed);
                continue;
            }
            return Ok(way);
        }

        Err(CacheError::Exhausted)
    }

    /// Places an already-loaded page, evicting within its set when full.
    /// The caller has verified the id is not resident.
    pub(crate) fn install(
        &mut self,
        page: &Arc<Page>,
        store: &dyn BackingStore,
    ) -> Result<(), CacheError> {
        let id = page.id();
        let idx = self.set_index(id);
        let way = Self::find_victim(&mut self.sets[idx])?;

        if let Some(victim) = &self.sets[idx].slots[way].page {
            spill(victim, store)?;
            trace!(victim = %victim.id(), page = %id, "set-associative eviction");
        }

        let slot = &mut self.sets[idx].slots[way];
        slot.id = id;
        slot.page = Some(page.clone());
        slot.referenced.store(true, Ordering::Relaxed);

        Ok(())
    }

    pub(crate) fn resident(&self) -> Vec<Arc<Page>> {
        self.sets
            .iter()
            .flat_map(|set| set.slots.iter())
            .filter_map(|slot| slot.page.clone())
            .collect()
    }

    /// Rebuilds at the new set count, reinserting pinned pages first,
    /// then referenced ones, then the rest. Pages whose set fills up are
    /// discarded unless pinned.
    pub(crate) fn resized(
        &self,
        num_sets: usize,
        ways: usize,
    ) -> Result<(Self, Vec<Arc<Page>>), CacheError> {
        let mut entries: Vec<(bool, bool, Arc<Page>)> = self
            .sets
            .iter()
            .flat_map(|set| set.slots.iter())
            .filter_map(|slot| {
                slot.page.as_ref().map(|page| {
                    (
                        page.pin_count() > 0,
                        slot.referenced.load(Ordering::Relaxed),
                        page.clone(),
                    )
                })
            })
            .collect();
        entries.sort_by_key(|&(pinned, referenced, _)| (!pinned, !referenced));

        let mut fresh = Self::new(num_sets, ways);
        let mut discards = Vec::new();
        for (pinned, referenced, page) in entries {
            let idx = page.id().get() as usize % num_sets;
            let set = &mut fresh.sets[idx];
            match set.slots.iter().position(|slot| slot.page.is_none()) {
                Some(way) => {
                    let slot = &mut set.slots[way];
                    slot.id = page.id();
                    slot.page = Some(page);
                    slot.referenced.store(referenced, Ordering::Relaxed);
                }
                None if pinned => return Err(CacheError::Exhausted),
                None => discards.push(page),
            }
        }

        Ok((fresh, discards))
    }

    pub(crate) fn page_count(&self) -> usize {
        self.sets
            .iter()
            .flat_map(|set| set.slots.iter())
            .filter(|slot| slot.page.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStore;

    fn page(id: u32) -> Arc<Page> {
        Arc::new(Page::new(PageId::new(id), 64))
    }

    // ids congruent mod 2 land in the same set
    fn colliding_ids(n: usize) -> Vec<PageId> {
        (0..n).map(|i| PageId::new(1 + 2 * i as u32)).collect()
    }

    #[test]
    fn overflow_evicts_exactly_one_slot() {
        let store = NullStore::new(64);
        let mut sets = SetAssociative::new(2, 2);

        let ids = colliding_ids(3);
        sets.install(&page(ids[0].get()), &store).unwrap();
        sets.install(&page(ids[1].get()), &store).unwrap();
        assert_eq!(sets.page_count(), 2);

        // third collider displaces one of the first two
        sets.install(&page(ids[2].get()), &store).unwrap();
        assert_eq!(sets.page_count(), 2);
        assert!(sets.lookup(ids[2]).is_some());
        let survivors = [ids[0], ids[1]]
            .iter()
            .filter(|&&id| sets.lookup(id).is_some())
            .count();
        assert_eq!(survivors, 1);
    }

    #[test]
    fn clock_prefers_unreferenced_slots() {
        let store = NullStore::new(64);
        let mut sets = SetAssociative::new(1, 2);

        sets.install(&page(1), &store).unwrap();
        sets.install(&page(2), &store).unwrap();

        // both referenced after install; touching 1 again changes nothing
        sets.touch(PageId::new(1));

        // first sweep clears both bits, second evicts at the hand; the
        // newcomer must land somewhere without touching the other set
        sets.install(&page(3), &store).unwrap();
        assert!(sets.lookup(PageId::new(3)).is_some());
        assert_eq!(sets.page_count(), 2);
    }

    #[test]
    fn fully_pinned_set_is_exhausted() {
        let store = NullStore::new(64);
        let mut sets = SetAssociative::new(1, 2);

        let p1 = page(1);
        let p2 = page(2);
        sets.install(&p1, &store).unwrap();
        sets.install(&p2, &store).unwrap();
        p1.pin();
        p2.pin();

        assert!(matches!(
            sets.install(&page(3), &store),
            Err(CacheError::Exhausted)
        ));

        p2.unpin();
        sets.install(&page(3), &store).unwrap();
        assert!(sets.lookup(PageId::new(1)).is_some());
        assert!(sets.lookup(PageId::new(3)).is_some());
        assert!(sets.lookup(PageId::new(2)).is_none());
    }

    #[test]
    fn resized_prefers_pinned_pages() {
        let store = NullStore::new(64);
        let mut sets = SetAssociative::new(2, 2);

        let held = page(3);
        sets.install(&page(1), &store).unwrap();
        sets.install(&held, &store).unwrap();
        sets.install(&page(5), &store).unwrap();
        held.pin();

        // one set, one way: only the pinned page can stay
        let (shrunk, discards) = sets.resized(1, 1).unwrap();
        assert_eq!(shrunk.page_count(), 1);
        assert!(shrunk.lookup(PageId::new(3)).is_some());
        assert_eq!(discards.len(), 2);

        held.unpin();
    }
}
