use crate::cache::CacheError;
use crate::cache::section::{Slot, spill};
use crate::pages::{Page, PageId};
use crate::storage::BackingStore;

use std::sync::Arc;

use tracing::trace;

/// Direct-mapped storage: one slot per identifier, `id mod num_sets`.
///
/// The incumbent is always the victim; no reference bit is kept.
pub(crate) struct DirectMapped {
    slots: Vec<Slot>,
}

impl DirectMapped {
    pub(crate) fn new(num_sets: usize) -> Self {
        Self {
            slots: (0..num_sets).map(|_| Slot::empty()).collect(),
        }
    }

    fn slot_index(&self, id: PageId) -> usize {
        id.get() as usize % self.slots.len()
    }

    pub(crate) fn lookup(&self, id: PageId) -> Option<Arc<Page>> {
        let slot = &self.slots[self.slot_index(id)];
        match &slot.page {
            Some(page) if slot.id == id => Some(page.clone()),
            _ => None,
        }
    }

    /// Places an already-loaded page, displacing the incumbent of its
    /// slot. The caller has verified the id is not resident.
    pub(crate) fn install(
        &mut self,
        page: &Arc<Page>,
        store: &dyn BackingStore,
    ) -> Result<(), CacheError> {
        let id = page.id();
        let idx = self.slot_index(id);

        if let Some(occupant) = &self.slots[idx].page {
            if occupant.pin_count() > 0 {
                return Err(CacheError::Exhausted);
            }
            spill(occupant, store)?;
            trace!(victim = %occupant.id(), page = %id, "direct-mapped eviction");
        }

        let slot = &mut self.slots[idx];
        slot.id = id;
        slot.page = Some(page.clone());

        Ok(())
    }

    pub(crate) fn resident(&self) -> Vec<Arc<Page>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.page.clone())
            .collect()
    }

    /// Rebuilds at the new slot count, reinserting pinned pages first so
    /// they always find their slot.
    pub(crate) fn resized(&self, num_sets: usize) -> Result<(Self, Vec<Arc<Page>>), CacheError> {
        let mut pages = self.resident();
        pages.sort_by_key(|page| page.pin_count() == 0);

        let mut fresh = Self::new(num_sets);
        let mut discards = Vec::new();
        for page in pages {
            let idx = page.id().get() as usize % num_sets;
            let slot = &mut fresh.slots[idx];
            if slot.page.is_none() {
                slot.id = page.id();
                slot.page = Some(page);
            } else if page.pin_count() > 0 {
                return Err(CacheError::Exhausted);
            } else {
                discards.push(page);
            }
        }

        Ok((fresh, discards))
    }

    pub(crate) fn page_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.page.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStore;

    fn page(id: u32) -> Arc<Page> {
        Arc::new(Page::new(PageId::new(id), 64))
    }

    #[test]
    fn incumbent_is_always_the_victim() {
        let store = NullStore::new(64);
        let mut slots = DirectMapped::new(4);

        // ids 1 and 5 collide in slot 1
        slots.install(&page(1), &store).unwrap();
        assert!(slots.lookup(PageId::new(1)).is_some());

        slots.install(&page(5), &store).unwrap();
        assert!(slots.lookup(PageId::new(1)).is_none());
        assert!(slots.lookup(PageId::new(5)).is_some());
        assert_eq!(slots.page_count(), 1);
    }

    #[test]
    fn pinned_incumbent_refuses_eviction() {
        let store = NullStore::new(64);
        let mut slots = DirectMapped::new(1);

        let held = page(1);
        slots.install(&held, &store).unwrap();
        held.pin();

        assert!(matches!(
            slots.install(&page(2), &store),
            Err(CacheError::Exhausted)
        ));
        assert!(slots.lookup(PageId::new(1)).is_some());

        held.unpin();
        slots.install(&page(2), &store).unwrap();
        assert!(slots.lookup(PageId::new(2)).is_some());
    }

    #[test]
    fn resized_rehashes_survivors() {
        let store = NullStore::new(64);
        let mut slots = DirectMapped::new(4);

        slots.install(&page(1), &store).unwrap();
        slots.install(&page(2), &store).unwrap();

        // both ids map to slot 0 of a single-slot layout; one survives
        let (shrunk, discards) = slots.resized(1).unwrap();
        assert_eq!(shrunk.page_count(), 1);
        assert_eq!(discards.len(), 1);
    }
}
