use crate::cache::section::Section;
use crate::cache::stats::SectionStats;
use crate::cache::{CacheError, SectionId, SectionName, Variant};
use crate::config::CacheConfig;
use crate::pages::{Page, PageHandle, PageId};
use crate::storage::BackingStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::debug;

struct RangeMapping {
    low: PageId,
    high: PageId,
    section: SectionId,
}

struct RouterState {
    total_bytes: usize,
    available: usize,
    next_section_id: u64,
    sections: HashMap<SectionId, Arc<Section>>,
    names: HashMap<SectionName, SectionId>,
    default_section: SectionId,
    overrides: HashMap<PageId, SectionId>,
    ranges: Vec<RangeMapping>,
}

impl RouterState {
    /// Deterministic resolution: override map, then first matching
    /// range, then the default section. Ranges never overlap, so "first
    /// matching" is unambiguous.
    fn resolve_id(&self, id: PageId) -> SectionId {
        if let Some(&section) = self.overrides.get(&id) {
            return section;
        }
        self.ranges
            .iter()
            .find(|range| range.low <= id && id <= range.high)
            .map(|range| range.section)
            .unwrap_or(self.default_section)
    }

    fn resolve(&self, id: PageId) -> Arc<Section> {
        let section_id = self.resolve_id(id);
        // every mapping entry points at a registered section
        self.sections[&section_id].clone()
    }

    /// Installs a range mapping, trimming away the intersecting parts of
    /// older ranges so that mappings never overlap. Parts of an older
    /// range outside the new one keep routing to their section.
    fn insert_range(&mut self, new: RangeMapping) {
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for old in self.ranges.drain(..) {
            if old.high < new.low || old.low > new.high {
                kept.push(old);
                continue;
            }
            if old.low < new.low {
                kept.push(RangeMapping {
                    low: old.low,
                    high: PageId::new(new.low.get() - 1),
                    section: old.section,
                });
            }
            if old.high > new.high {
                kept.push(RangeMapping {
                    low: PageId::new(new.high.get() + 1),
                    high: old.high,
                    section: old.section,
                });
            }
        }
        kept.push(new);
        kept.sort_by_key(|range| range.low);
        self.ranges = kept;
    }
}

/// The sectioned page cache: a router over one or more sections.
///
/// The router holds only section identifiers and mapping metadata; each
/// section exclusively owns the memory of its resident pages. Routine
/// operations take the router lock in shared mode, management operations
/// in exclusive mode, and the lock is always released before any section
/// lock is taken.
pub struct SectionedPageCache<S> {
    store: S,
    page_size: usize,
    next_page_id: AtomicU32,
    state: RwLock<RouterState>,
}

impl<S: BackingStore> SectionedPageCache<S> {
    /// Builds a cache whose default section is fully-associative over
    /// the whole budget, the shape the embedder then carves sections
    /// out of.
    pub fn new(config: CacheConfig, store: S) -> Result<Self, CacheError> {
        if store.page_size() != config.page_size {
            return Err(CacheError::Config("page size differs from backing store"));
        }
        if config.default_line_size < config.page_size {
            return Err(CacheError::Config("line size smaller than page size"));
        }

        let default_id = SectionId(0);
        let default_section = Arc::new(Section::new(
            default_id,
            None,
            config.total_bytes,
            config.page_size,
            config.default_line_size,
            Variant::FullyAssociative,
            1,
        ));

        Ok(Self {
            store,
            page_size: config.page_size,
            // starts past 0 so the invalid sentinel is never dispensed;
            // id 1 is reserved by convention for tree metadata
            next_page_id: AtomicU32::new(1),
            state: RwLock::new(RouterState {
                total_bytes: config.total_bytes,
                available: 0,
                next_section_id: 1,
                sections: HashMap::from([(default_id, default_section)]),
                names: HashMap::new(),
                default_section: default_id,
                overrides: HashMap::new(),
                ranges: Vec::new(),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Resident page count across all sections.
    pub fn size(&self) -> usize {
        let sections = self.sections_snapshot();
        sections.iter().map(|section| section.page_count()).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.read().total_bytes
    }

    pub fn available_bytes(&self) -> usize {
        self.state.read().available
    }

    pub fn default_section_id(&self) -> SectionId {
        self.state.read().default_section
    }

    // --- cache interface ---

    /// Allocates the next identifier and a resident slot for it. The
    /// returned page is born pinned, clean and zeroed.
    pub fn new_page(&self) -> Result<PageHandle, CacheError> {
        let id = PageId::new(self.next_page_id.fetch_add(1, Ordering::Relaxed));
        let section = self.state.read().resolve(id);
        section.new_slot(id, &self.store)
    }

    /// Returns the resident page for `id`, pinned, fetching it from the
    /// backing store on miss.
    pub fn fetch(&self, id: PageId) -> Result<PageHandle, CacheError> {
        if !id.is_valid() {
            return Err(CacheError::InvalidPageId);
        }
        let section = self.state.read().resolve(id);
        section.fetch(id, &self.store)
    }

    /// Increments the pin counter; returns the previous value.
    pub fn pin(&self, page: &Page) -> u32 {
        let section = self.state.read().resolve(page.id());
        section.pin(page)
    }

    /// Decrements the pin counter, first marking the page dirty when
    /// requested; returns the previous value. Nothing is flushed
    /// eagerly.
    pub fn unpin(&self, page: &Page, dirty: bool) -> u32 {
        let section = self.state.read().resolve(page.id());
        section.unpin(page, dirty)
    }

    /// Writes the page through to the backing store if dirty.
    pub fn flush(&self, page: &Page) -> Result<(), CacheError> {
        let section = self.state.read().resolve(page.id());
        section.flush(page, &self.store)
    }

    /// Flushes every resident dirty page in every section. Failures are
    /// collected and reported together; pages that flushed are left
    /// clean.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        let sections = self.sections_snapshot();

        let mut failures = Vec::new();
        for section in sections {
            failures.extend(section.flush_all(&self.store));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CacheError::FlushAll(failures))
        }
    }

    /// Best-effort install of `id` without transferring a pin to the
    /// caller.
    pub fn prefetch(&self, id: PageId) {
        if !id.is_valid() {
            return;
        }
        let section = self.state.read().resolve(id);
        section.prefetch(id, &self.store);
    }

    /// Prefetches a batch, grouped by owning section so each section is
    /// entered once.
    pub fn prefetch_many(&self, ids: &[PageId]) {
        let mut groups: HashMap<SectionId, (Arc<Section>, Vec<PageId>)> = HashMap::new();
        {
            let state = self.state.read();
            for &id in ids {
                if !id.is_valid() {
                    continue;
                }
                let section_id = state.resolve_id(id);
                groups
                    .entry(section_id)
                    .or_insert_with(|| (state.sections[&section_id].clone(), Vec::new()))
                    .1
                    .push(id);
            }
        }
        for (_, (section, ids)) in groups {
            section.prefetch_many(&ids, &self.store);
        }
    }

    // --- section management ---

    /// Registers a new section. Requests beyond the available budget are
    /// clamped to it.
    pub fn create_section(
        &self,
        bytes: usize,
        line_size: usize,
        variant: Variant,
        associativity: usize,
    ) -> Result<SectionId, CacheError> {
        self.add_section(None, bytes, line_size, variant, associativity)
    }

    /// Same as [`create_section`](Self::create_section), with a validated
    /// human-readable name for [`section_id_by_name`](Self::section_id_by_name).
    pub fn create_named_section(
        &self,
        name: &str,
        bytes: usize,
        line_size: usize,
        variant: Variant,
        associativity: usize,
    ) -> Result<SectionId, CacheError> {
        let name = SectionName::try_from(name).map_err(CacheError::Config)?;
        self.add_section(Some(name), bytes, line_size, variant, associativity)
    }

    fn add_section(
        &self,
        name: Option<SectionName>,
        bytes: usize,
        line_size: usize,
        variant: Variant,
        associativity: usize,
    ) -> Result<SectionId, CacheError> {
        if line_size < self.page_size {
            return Err(CacheError::Config("line size smaller than page size"));
        }
        if associativity == 0 {
            return Err(CacheError::Config("associativity must be at least 1"));
        }

        let mut state = self.state.write();
        if let Some(name) = &name
            && state.names.contains_key(name)
        {
            return Err(CacheError::Config("section name already in use"));
        }

        let granted = bytes.min(state.available);
        let id = SectionId(state.next_section_id);
        state.next_section_id += 1;

        let section = Arc::new(Section::new(
            id,
            name.clone(),
            granted,
            self.page_size,
            line_size,
            variant,
            associativity,
        ));
        state.sections.insert(id, section);
        if let Some(name) = name {
            state.names.insert(name, id);
        }
        state.available -= granted;

        debug!(section = %id, bytes = granted, ?variant, "section created");

        Ok(id)
    }

    /// Removes a section, returning its capacity to the pool and purging
    /// every mapping entry that points at it. The default section cannot
    /// be removed; a section holding pinned pages cannot either, and its
    /// dirty pages are written back before it goes away.
    pub fn remove_section(&self, id: SectionId) -> Result<(), CacheError> {
        let mut state = self.state.write();
        if id == state.default_section {
            return Err(CacheError::RemoveDefault);
        }
        let section = state
            .sections
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownSection(id))?;

        if section.has_pinned() {
            return Err(CacheError::Exhausted);
        }
        let failures = section.flush_all(&self.store);
        if !failures.is_empty() {
            return Err(CacheError::FlushAll(failures));
        }

        state.sections.remove(&id);
        state.available += section.capacity();
        state.overrides.retain(|_, section| *section != id);
        state.ranges.retain(|range| range.section != id);
        state.names.retain(|_, section| *section != id);

        debug!(section = %id, "section removed");

        Ok(())
    }

    /// Resizes a section. Growth is clamped to the available budget;
    /// shrinking discards resident pages as described on
    /// `Section::resize`.
    pub fn resize_section(&self, id: SectionId, new_bytes: usize) -> Result<(), CacheError> {
        let mut state = self.state.write();
        let section = state
            .sections
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownSection(id))?;

        let old_bytes = section.capacity();
        let granted = if new_bytes > old_bytes {
            old_bytes + (new_bytes - old_bytes).min(state.available)
        } else {
            new_bytes
        };

        section.resize(granted, &self.store)?;
        state.available = state.available + old_bytes - granted;

        Ok(())
    }

    /// Routes a single identifier to a section, overriding any range.
    pub fn map_page(&self, id: PageId, section: SectionId) -> Result<(), CacheError> {
        if !id.is_valid() {
            return Err(CacheError::InvalidPageId);
        }
        let mut state = self.state.write();
        if !state.sections.contains_key(&section) {
            return Err(CacheError::UnknownSection(section));
        }
        state.overrides.insert(id, section);
        Ok(())
    }

    /// Routes the inclusive identifier range `[low, high]` to a section.
    /// Older ranges keep only their parts outside the new one;
    /// single-id overrides are untouched.
    pub fn map_range(
        &self,
        low: PageId,
        high: PageId,
        section: SectionId,
    ) -> Result<(), CacheError> {
        if !low.is_valid() {
            return Err(CacheError::InvalidPageId);
        }
        if high < low {
            return Err(CacheError::Config("empty page range"));
        }
        let mut state = self.state.write();
        if !state.sections.contains_key(&section) {
            return Err(CacheError::UnknownSection(section));
        }
        state.insert_range(RangeMapping { low, high, section });
        Ok(())
    }

    pub fn section_for_page(&self, id: PageId) -> SectionId {
        self.state.read().resolve_id(id)
    }

    pub fn section_id_by_name(&self, name: &str) -> Option<SectionId> {
        let name = SectionName::try_from(name).ok()?;
        self.state.read().names.get(&name).copied()
    }

    // --- statistics ---

    pub fn stats_per_section(&self) -> Vec<(SectionId, SectionStats)> {
        let sections = self.sections_snapshot();
        let mut stats: Vec<(SectionId, SectionStats)> = sections
            .iter()
            .map(|section| (section.id(), section.stats()))
            .collect();
        stats.sort_by_key(|(id, _)| *id);
        stats
    }

    pub fn reset_stats(&self) {
        for section in self.sections_snapshot() {
            section.reset_stats();
        }
    }

    // --- internal ---

    pub(crate) fn sections_snapshot(&self) -> Vec<Arc<Section>> {
        self.state.read().sections.values().cloned().collect()
    }

    pub(crate) fn section(&self, id: SectionId) -> Option<Arc<Section>> {
        self.state.read().sections.get(&id).cloned()
    }
}
