use crate::cache::CacheError;
use crate::cache::section::spill;
use crate::pages::{Page, PageId};
use crate::storage::BackingStore;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Fully-associative storage with LRU replacement.
///
/// Recency is a monotonic tick stamped on every access, so a hit only
/// writes an atomic and runs under the section's shared lock. The victim
/// is the unpinned entry with the oldest stamp; the observable LRU order
/// is the stamps in descending order.
pub(crate) struct FullyAssociative {
    map: HashMap<PageId, Entry>,
    tick: AtomicU64,
}

struct Entry {
    page: Arc<Page>,
    last_used: AtomicU64,
}

impl FullyAssociative {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn lookup(&self, id: PageId) -> Option<Arc<Page>> {
        self.map.get(&id).map(|entry| entry.page.clone())
    }

    pub(crate) fn touch(&self, id: PageId) {
        if let Some(entry) = self.map.get(&id) {
            entry.last_used.store(self.next_tick(), Ordering::Relaxed);
        }
    }

    fn find_victim(&self) -> Result<PageId, CacheError> {
        self.map
            .iter()
            .filter(|(_, entry)| entry.page.pin_count() == 0)
            .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
            .map(|(&id, _)| id)
            .ok_or(CacheError::Exhausted)
    }

    /// Places an already-loaded page, evicting the oldest unpinned entry
    /// when full. The caller has verified the id is not resident.
    pub(crate) fn install(
        &mut self,
        page: &Arc<Page>,
        lines: usize,
        store: &dyn BackingStore,
    ) -> Result<(), CacheError> {
        if self.map.len() >= lines {
            let victim_id = self.find_victim()?;
            let victim = self.map[&victim_id].page.clone();
            spill(&victim, store)?;
            trace!(victim = %victim_id, page = %page.id(), "lru eviction");
            self.map.remove(&victim_id);
        }

        self.map.insert(
            page.id(),
            Entry {
                page: page.clone(),
                last_used: AtomicU64::new(self.next_tick()),
            },
        );
        Ok(())
    }

    pub(crate) fn resident(&self) -> Vec<Arc<Page>> {
        self.map.values().map(|entry| entry.page.clone()).collect()
    }

    /// Rebuilds at `lines` capacity, dropping the oldest unpinned
    /// entries. Stamps carry over, so the recency order survives the
    /// rebuild.
    pub(crate) fn resized(&self, lines: usize) -> Result<(Self, Vec<Arc<Page>>), CacheError> {
        let mut entries: Vec<(PageId, u64, Arc<Page>)> = self
            .map
            .iter()
            .map(|(&id, entry)| {
                (
                    id,
                    entry.last_used.load(Ordering::Relaxed),
                    entry.page.clone(),
                )
            })
            .collect();

        let pinned = entries
            .iter()
            .filter(|(_, _, page)| page.pin_count() > 0)
            .count();
        if pinned > lines {
            return Err(CacheError::Exhausted);
        }

        entries.sort_by_key(|&(_, tick, _)| Reverse(tick));

        let mut map = HashMap::new();
        let mut discards = Vec::new();
        let mut unpinned_budget = lines - pinned;
        for (id, tick, page) in entries {
            if page.pin_count() == 0 {
                if unpinned_budget == 0 {
                    discards.push(page);
                    continue;
                }
                unpinned_budget -= 1;
            }
            map.insert(
                id,
                Entry {
                    page,
                    last_used: AtomicU64::new(tick),
                },
            );
        }

        Ok((
            Self {
                map,
                tick: AtomicU64::new(self.tick.load(Ordering::Relaxed)),
            },
            discards,
        ))
    }

    pub(crate) fn page_count(&self) -> usize {
        self.map.len()
    }

    /// Observable LRU order, most-recently-used first.
    pub(crate) fn lru_order(&self) -> Vec<PageId> {
        let mut entries: Vec<(PageId, u64)> = self
            .map
            .iter()
            .map(|(&id, entry)| (id, entry.last_used.load(Ordering::Relaxed)))
            .collect();
        entries.sort_by_key(|&(_, tick)| Reverse(tick));
        entries.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStore;

    fn page(id: u32) -> Arc<Page> {
        Arc::new(Page::new(PageId::new(id), 64))
    }

    fn ids(raw: &[u32]) -> Vec<PageId> {
        raw.iter().copied().map(PageId::new).collect()
    }

    #[test]
    fn victim_is_the_oldest_entry() {
        let store = NullStore::new(64);
        let mut lru = FullyAssociative::new();

        for id in 1..=3 {
            lru.install(&page(id), 3, &store).unwrap();
        }
        assert_eq!(lru.lru_order(), ids(&[3, 2, 1]));

        lru.install(&page(4), 3, &store).unwrap();
        assert_eq!(lru.lru_order(), ids(&[4, 3, 2]));
        assert!(lru.lookup(PageId::new(1)).is_none());
    }

    #[test]
    fn touch_refreshes_recency() {
        let store = NullStore::new(64);
        let mut lru = FullyAssociative::new();

        for id in 1..=3 {
            lru.install(&page(id), 3, &store).unwrap();
        }
        lru.touch(PageId::new(1));
        assert_eq!(lru.lru_order(), ids(&[1, 3, 2]));
    }

    #[test]
    fn pinned_oldest_is_skipped() {
        let store = NullStore::new(64);
        let mut lru = FullyAssociative::new();

        let oldest = page(1);
        lru.install(&oldest, 2, &store).unwrap();
        lru.install(&page(2), 2, &store).unwrap();
        oldest.pin();

        // 1 has the oldest stamp but is pinned, so 2 goes instead
        lru.install(&page(3), 2, &store).unwrap();
        assert!(lru.lookup(PageId::new(1)).is_some());
        assert!(lru.lookup(PageId::new(2)).is_none());
        assert!(lru.lookup(PageId::new(3)).is_some());
    }

    #[test]
    fn all_pinned_is_exhausted() {
        let store = NullStore::new(64);
        let mut lru = FullyAssociative::new();

        let pinned = page(1);
        lru.install(&pinned, 1, &store).unwrap();
        pinned.pin();

        assert!(matches!(
            lru.install(&page(2), 1, &store),
            Err(CacheError::Exhausted)
        ));
    }

    #[test]
    fn resized_keeps_pinned_and_recent() {
        let store = NullStore::new(64);
        let mut lru = FullyAssociative::new();

        let held = page(2);
        lru.install(&page(1), 3, &store).unwrap();
        lru.install(&held, 3, &store).unwrap();
        lru.install(&page(3), 3, &store).unwrap();
        held.pin();

        let (shrunk, discards) = lru.resized(2).unwrap();
        assert_eq!(shrunk.page_count(), 2);
        assert!(shrunk.lookup(PageId::new(2)).is_some());
        assert!(shrunk.lookup(PageId::new(3)).is_some());
        assert_eq!(discards.len(), 1);
        assert_eq!(discards[0].id(), PageId::new(1));

        held.unpin();
        assert!(matches!(lru.resized(0), Ok((_, _))));
    }
}
