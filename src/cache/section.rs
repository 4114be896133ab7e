use crate::cache::direct::DirectMapped;
use crate::cache::full_assoc::FullyAssociative;
use crate::cache::set_assoc::SetAssociative;
use crate::cache::stats::SectionStats;
use crate::cache::{CacheError, SectionId, SectionName, Variant};
use crate::pages::{PAGE_INVALID, Page, PageHandle, PageId};
use crate::storage::{BackingStore, StoreError};

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

pub(crate) struct Slot {
    pub(crate) id: PageId,
    pub(crate) page: Option<Arc<Page>>,
    // atomic so a hit can set it under the section's shared lock
    pub(crate) referenced: AtomicBool,
}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self {
            id: PAGE_INVALID,
            page: None,
            referenced: AtomicBool::new(false),
        }
    }
}

/// Creates the replacement page and, for a fetch, fills it from the
/// backing store. The page is still private to the caller, so taking its
/// content lock here contends with nobody, and a failed read leaves
/// section residency unchanged.
pub(crate) fn load_page(
    id: PageId,
    page_size: usize,
    source: Option<&dyn BackingStore>,
) -> Result<Arc<Page>, CacheError> {
    let page = Arc::new(Page::new(id, page_size));
    if let Some(store) = source {
        let mut buf = page.write();
        store.read(id, &mut buf).map_err(|err| match err {
            StoreError::NotFound => CacheError::NotFound,
            other => CacheError::Store(other),
        })?;
    }
    Ok(page)
}

/// Offers a dirty page to the backing store and marks it clean.
///
/// Evicted pages are unpinned, and unpinned pages have no outstanding
/// content locks, so the shared lock here cannot block.
pub(crate) fn spill(page: &Page, store: &dyn BackingStore) -> Result<(), CacheError> {
    if page.is_dirty() {
        let buf = page.read();
        store.write(page.id(), &buf)?;
        page.clear_dirty();
    }
    Ok(())
}

enum VariantState {
    Direct(DirectMapped),
    SetAssoc(SetAssociative),
    Full(FullyAssociative),
}

impl VariantState {
    fn new(variant: Variant, capacity: usize, line_size: usize, associativity: usize) -> Self {
        match variant {
            Variant::DirectMapped => {
                Self::Direct(DirectMapped::new(num_sets(capacity, line_size, 1)))
            }
            Variant::SetAssociative => Self::SetAssoc(SetAssociative::new(
                num_sets(capacity, line_size, associativity),
                associativity,
            )),
            Variant::FullyAssociative => Self::Full(FullyAssociative::new()),
        }
    }

    fn lookup(&self, id: PageId) -> Option<Arc<Page>> {
        match self {
            Self::Direct(slots) => slots.lookup(id),
            Self::SetAssoc(sets) => sets.lookup(id),
            Self::Full(lru) => lru.lookup(id),
        }
    }

    /// Marks a hit. Recency markers are atomics, so this runs under the
    /// shared lock.
    fn touch(&self, id: PageId) {
        match self {
            // a direct-mapped slot needs no reference bit
            Self::Direct(_) => {}
            Self::SetAssoc(sets) => sets.touch(id),
            Self::Full(lru) => lru.touch(id),
        }
    }

    fn install(
        &mut self,
        page: &Arc<Page>,
        lines: usize,
        store: &dyn BackingStore,
    ) -> Result<(), CacheError> {
        match self {
            Self::Direct(slots) => slots.install(page, store),
            Self::SetAssoc(sets) => sets.install(page, store),
            Self::Full(lru) => lru.install(page, lines, store),
        }
    }

    fn resident(&self) -> Vec<Arc<Page>> {
        match self {
            Self::Direct(slots) => slots.resident(),
            Self::SetAssoc(sets) => sets.resident(),
            Self::Full(lru) => lru.resident(),
        }
    }

    fn resized(
        &self,
        capacity: usize,
        line_size: usize,
        associativity: usize,
    ) -> Result<(Self, Vec<Arc<Page>>), CacheError> {
        match self {
            Self::Direct(slots) => slots
                .resized(num_sets(capacity, line_size, 1))
                .map(|(fresh, discards)| (Self::Direct(fresh), discards)),
            Self::SetAssoc(sets) => sets
                .resized(num_sets(capacity, line_size, associativity), associativity)
                .map(|(fresh, discards)| (Self::SetAssoc(fresh), discards)),
            Self::Full(lru) => lru
                .resized(capacity / line_size)
                .map(|(fresh, discards)| (Self::Full(fresh), discards)),
        }
    }

    fn page_count(&self) -> usize {
        match self {
            Self::Direct(slots) => slots.page_count(),
            Self::SetAssoc(sets) => sets.page_count(),
            Self::Full(lru) => lru.page_count(),
        }
    }
}

fn num_sets(capacity: usize, line_size: usize, associativity: usize) -> usize {
    std::cmp::max(1, capacity / (line_size * associativity))
}

struct SectionState {
    capacity: usize,
    storage: VariantState,
}

/// A self-contained cache with one replacement structure and its own
/// statistics.
///
/// Hits run under the section's shared lock: the probe, the recency
/// marker (an atomic) and the pin all happen before the guard drops.
/// The miss path reads from the backing store with no section lock held
/// and re-enters the exclusive lock only to finalize residency, where it
/// re-checks for a concurrent install (the double-check). Page content
/// locks are only ever taken by clients after the section lock has been
/// released on the return path.
///
/// Statistics live behind their own lock, taken only when no section
/// lock is held, so hit bookkeeping never serializes the slot tables.
pub struct Section {
    id: SectionId,
    name: Option<SectionName>,
    page_size: usize,
    line_size: usize,
    variant: Variant,
    associativity: usize,
    state: RwLock<SectionState>,
    stats: Mutex<SectionStats>,
}

impl Section {
    pub(crate) fn new(
        id: SectionId,
        name: Option<SectionName>,
        capacity: usize,
        page_size: usize,
        line_size: usize,
        variant: Variant,
        associativity: usize,
    ) -> Self {
        let associativity = match variant {
            Variant::DirectMapped => 1,
            _ => associativity,
        };
        Self {
            id,
            name,
            page_size,
            line_size,
            variant,
            associativity,
            state: RwLock::new(SectionState {
                capacity,
                storage: VariantState::new(variant, capacity, line_size, associativity),
            }),
            stats: Mutex::new(SectionStats::default()),
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn name(&self) -> Option<&SectionName> {
        self.name.as_ref()
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    pub fn capacity(&self) -> usize {
        self.state.read().capacity
    }

    /// Capacity in lines at the current size.
    pub fn lines(&self) -> usize {
        self.state.read().capacity / self.line_size
    }

    pub fn page_count(&self) -> usize {
        self.state.read().storage.page_count()
    }

    pub fn stats(&self) -> SectionStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        self.stats.lock().reset();
    }

    /// Shared-mode hit path: probe, mark recency, pin, all under the
    /// read lock so the pin is taken before any writer can evict.
    fn lookup_hit(&self, id: PageId) -> Option<PageHandle> {
        let state = self.state.read();
        let page = state.storage.lookup(id)?;
        state.storage.touch(id);
        page.pin();
        Some(PageHandle::new(page))
    }

    fn fetch_with(
        &self,
        id: PageId,
        store: &dyn BackingStore,
        load: bool,
    ) -> Result<PageHandle, CacheError> {
        let start = Instant::now();

        if let Some(handle) = self.lookup_hit(id) {
            self.stats.lock().record_hit(start.elapsed());
            return Ok(handle);
        }

        // Classified as a miss before any fallible step; a failed read
        // leaves the counters consistent and residency unchanged.
        self.stats.lock().record_miss();

        if load {
            // an id installed since the probe is served without the
            // redundant backing-store read
            if let Some(handle) = self.lookup_hit(id) {
                self.stats.lock().record_hit_after_miss(start.elapsed());
                return Ok(handle);
            }
        }

        // The backing-store read happens with no section lock held.
        let page = load_page(id, self.page_size, load.then_some(store))?;

        let mut state = self.state.write();
        if let Some(resident) = state.storage.lookup(id) {
            // lost the install race while reading; serve the winner's copy
            state.storage.touch(id);
            resident.pin();
            drop(state);
            self.stats.lock().record_hit_after_miss(start.elapsed());
            return Ok(PageHandle::new(resident));
        }
        let lines = state.capacity / self.line_size;
        state.storage.install(&page, lines, store)?;
        page.pin();
        drop(state);
        self.stats.lock().record_miss_time(start.elapsed());

        Ok(PageHandle::new(page))
    }

    pub(crate) fn fetch(
        &self,
        id: PageId,
        store: &dyn BackingStore,
    ) -> Result<PageHandle, CacheError> {
        self.fetch_with(id, store, true)
    }

    /// The miss path without the backing-store read: the page is born
    /// clean, zeroed and pinned. Uniformly counted as a miss.
    pub(crate) fn new_slot(
        &self,
        id: PageId,
        store: &dyn BackingStore,
    ) -> Result<PageHandle, CacheError> {
        self.fetch_with(id, store, false)
    }

    pub(crate) fn pin(&self, page: &Page) -> u32 {
        page.pin()
    }

    pub(crate) fn unpin(&self, page: &Page, dirty: bool) -> u32 {
        if dirty {
            page.set_dirty();
        }
        page.unpin()
    }

    pub(crate) fn flush(&self, page: &Page, store: &dyn BackingStore) -> Result<(), CacheError> {
        spill(page, store)
    }

    /// Flushes every resident dirty page without evicting. Best-effort:
    /// failures are collected and reported together.
    pub(crate) fn flush_all(&self, store: &dyn BackingStore) -> Vec<(PageId, StoreError)> {
        let resident = self.state.read().storage.resident();

        let mut failures = Vec::new();
        for page in resident {
            if page.is_dirty() {
                let buf = page.read();
                match store.write(page.id(), &buf) {
                    Ok(()) => page.clear_dirty(),
                    Err(err) => failures.push((page.id(), err)),
                }
            }
        }
        failures
    }

    /// Miss-path work without a pin, a lock, or statistics. Best-effort:
    /// a resident id is a no-op and failures install nothing. Like the
    /// fetch miss path, the backing-store read runs with no section lock
    /// held.
    pub(crate) fn prefetch(&self, id: PageId, store: &dyn BackingStore) {
        if self.state.read().storage.lookup(id).is_some() {
            return;
        }

        let page = match load_page(id, self.page_size, Some(store)) {
            Ok(page) => page,
            Err(err) => {
                tracing::trace!(page = %id, error = %err, "prefetch skipped");
                return;
            }
        };

        let mut state = self.state.write();
        if state.storage.lookup(id).is_some() {
            return;
        }
        let lines = state.capacity / self.line_size;
        if let Err(err) = state.storage.install(&page, lines, store) {
            tracing::trace!(page = %id, error = %err, "prefetch skipped");
        }
    }

    pub(crate) fn prefetch_many(&self, ids: &[PageId], store: &dyn BackingStore) {
        for &id in ids {
            self.prefetch(id, store);
        }
    }

    /// Rebuilds the section at `new_bytes`, keeping as many resident
    /// pages as the new geometry allows. Pinned pages are always kept;
    /// among unpinned pages the most recently used are preferred.
    /// Discarded dirty pages are flushed before the rebuild commits.
    ///
    /// Fails with [`CacheError::Exhausted`] when the pinned pages alone
    /// do not fit the new geometry; the section is left unchanged.
    pub(crate) fn resize(
        &self,
        new_bytes: usize,
        store: &dyn BackingStore,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();
        if new_bytes == state.capacity {
            return Ok(());
        }

        let (fresh, discards) =
            state
                .storage
                .resized(new_bytes, self.line_size, self.associativity)?;

        for page in &discards {
            spill(page, store)?;
        }

        debug!(
            section = %self.id,
            old_bytes = state.capacity,
            new_bytes,
            discarded = discards.len(),
            "section resized"
        );

        state.storage = fresh;
        state.capacity = new_bytes;

        Ok(())
    }

    pub(crate) fn has_pinned(&self) -> bool {
        self.state
            .read()
            .storage
            .resident()
            .iter()
            .any(|page| page.pin_count() > 0)
    }

    /// Observable LRU order of a fully-associative section, most
    /// recently used first.
    pub(crate) fn lru_order(&self) -> Option<Vec<PageId>> {
        match &self.state.read().storage {
            VariantState::Full(lru) => Some(lru.lru_order()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStore;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        page_size: usize,
        writes: AtomicUsize,
    }

    impl CountingStore {
        fn new(page_size: usize) -> Self {
            Self {
                page_size,
                writes: AtomicUsize::new(0),
            }
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::Relaxed)
        }
    }

    impl BackingStore for CountingStore {
        fn read(&self, _id: PageId, buf: &mut [u8]) -> Result<(), StoreError> {
            buf.fill(0);
            Ok(())
        }

        fn write(&self, _id: PageId, _buf: &[u8]) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    fn section(variant: Variant, capacity: usize, associativity: usize) -> Section {
        Section::new(
            SectionId(0),
            None,
            capacity,
            64,
            64,
            variant,
            associativity,
        )
    }

    #[test]
    fn direct_mapped_single_slot_never_hits() {
        let store = NullStore::new(64);
        let cache = section(Variant::DirectMapped, 64, 1);

        for id in 1..=5 {
            let page = cache.fetch(PageId::new(id), &store).unwrap();
            cache.unpin(&page, false);
        }

        let stats = cache.stats();
        assert_eq!(stats.misses, 5);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.accesses, 5);
        assert_eq!(cache.page_count(), 1);
    }

    #[test]
    fn lru_boundary_is_exact() {
        let store = NullStore::new(64);

        // capacity L: re-fetching the first id after L+1 distinct ids misses
        let cache = section(Variant::FullyAssociative, 3 * 64, 1);
        for id in 1..=4 {
            let page = cache.fetch(PageId::new(id), &store).unwrap();
            cache.unpin(&page, false);
        }
        let page = cache.fetch(PageId::new(1), &store).unwrap();
        cache.unpin(&page, false);
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 5);

        // capacity L+1: the same workload hits
        let cache = section(Variant::FullyAssociative, 4 * 64, 1);
        for id in 1..=4 {
            let page = cache.fetch(PageId::new(id), &store).unwrap();
            cache.unpin(&page, false);
        }
        let page = cache.fetch(PageId::new(1), &store).unwrap();
        cache.unpin(&page, false);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 4);
    }

    #[test]
    fn new_slot_is_a_miss_in_every_variant() {
        let store = NullStore::new(64);
        for (variant, associativity) in [
            (Variant::DirectMapped, 1),
            (Variant::SetAssociative, 2),
            (Variant::FullyAssociative, 1),
        ] {
            let cache = section(variant, 4 * 64, associativity);
            let page = cache.new_slot(PageId::new(1), &store).unwrap();
            cache.unpin(&page, false);

            let stats = cache.stats();
            assert_eq!(stats.misses, 1, "{variant:?}");
            assert_eq!(stats.hits, 0, "{variant:?}");
            assert_eq!(stats.accesses, stats.hits + stats.misses);
        }
    }

    #[test]
    fn flush_is_idempotent() {
        let store = CountingStore::new(64);
        let cache = section(Variant::FullyAssociative, 4 * 64, 1);

        let page = cache.new_slot(PageId::new(1), &store).unwrap();
        page.write()[0] = 0xEE;
        cache.unpin(&page, true);

        cache.flush(&page, &store).unwrap();
        assert_eq!(store.writes(), 1);
        assert!(!page.is_dirty());

        // clean page: no further write
        cache.flush(&page, &store).unwrap();
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn flush_all_flushes_only_dirty_pages() {
        let store = CountingStore::new(64);
        let cache = section(Variant::SetAssociative, 8 * 64, 2);

        for id in 1..=4 {
            let page = cache.new_slot(PageId::new(id), &store).unwrap();
            cache.unpin(&page, id % 2 == 0);
        }

        let failures = cache.flush_all(&store);
        assert!(failures.is_empty());
        assert_eq!(store.writes(), 2);

        // everything is clean now
        let failures = cache.flush_all(&store);
        assert!(failures.is_empty());
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn prefetch_installs_without_pin_or_stats() {
        let store = NullStore::new(64);
        let cache = section(Variant::FullyAssociative, 4 * 64, 1);

        cache.prefetch(PageId::new(9), &store);
        assert_eq!(cache.page_count(), 1);
        assert_eq!(cache.stats(), SectionStats::default());

        // the prefetched page is a hit for the next fetch
        let page = cache.fetch(PageId::new(9), &store).unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(page.pin_count(), 1);
        cache.unpin(&page, false);

        // prefetching a resident page is a no-op
        cache.prefetch(PageId::new(9), &store);
        assert_eq!(cache.page_count(), 1);
    }

    #[test]
    fn shrinking_resize_keeps_mru_and_flushes_dirty_discards() {
        let store = CountingStore::new(64);
        let cache = section(Variant::FullyAssociative, 3 * 64, 1);

        for id in 1..=3 {
            let page = cache.fetch(PageId::new(id), &store).unwrap();
            cache.unpin(&page, true);
        }

        cache.resize(64, &store).unwrap();
        assert_eq!(cache.page_count(), 1);
        assert_eq!(cache.capacity(), 64);
        // two discards, both dirty
        assert_eq!(store.writes(), 2);
        assert_eq!(cache.lru_order(), Some(vec![PageId::new(3)]));
    }

    #[test]
    fn resize_refuses_to_discard_pinned_pages() {
        let store = NullStore::new(64);
        let cache = section(Variant::FullyAssociative, 2 * 64, 1);

        let pinned = cache.fetch(PageId::new(1), &store).unwrap();
        let other = cache.fetch(PageId::new(2), &store).unwrap();
        cache.unpin(&other, false);

        // both pages cannot fit in zero lines while one is pinned
        assert!(matches!(
            cache.resize(0, &store),
            Err(CacheError::Exhausted)
        ));
        assert_eq!(cache.page_count(), 2);
        assert_eq!(cache.capacity(), 2 * 64);

        cache.unpin(&pinned, false);
        cache.resize(64, &store).unwrap();
        assert_eq!(cache.page_count(), 1);
    }

    #[test]
    fn grow_resize_discards_nothing() {
        let store = NullStore::new(64);
        let cache = section(Variant::SetAssociative, 2 * 64, 2);

        for id in 1..=2 {
            let page = cache.fetch(PageId::new(id), &store).unwrap();
            cache.unpin(&page, false);
        }

        cache.resize(8 * 64, &store).unwrap();
        assert_eq!(cache.page_count(), 2);
        assert_eq!(cache.lines(), 8);

        // previously resident pages still hit after the rebuild
        let page = cache.fetch(PageId::new(1), &store).unwrap();
        cache.unpin(&page, false);
        assert_eq!(cache.stats().hits, 1);
    }
}
