use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

pub const PAGE_INVALID: PageId = PageId(0);
/// The page id reserved by convention for tree metadata.
pub const PAGE_METADATA: PageId = PageId(1);

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    pub const INVALID: PageId = PAGE_INVALID;

    pub fn new(page_id: u32) -> Self {
        Self(page_id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fixed-size page buffer with its residency metadata.
///
/// Content access goes through the page's own reader/writer lock, which
/// supports shared, upgradeable and exclusive modes. Readers planning to
/// mutate take `upgradable_read` and promote with
/// [`RwLockUpgradableReadGuard::upgrade`].
///
/// The pin counter is the eviction interlock, the lock is the data-race
/// interlock; they are independent. A page may be pinned while unlocked,
/// or locked while pinned. Holding a content lock on an unpinned page is
/// a contract violation: eviction only considers unpinned pages and
/// assumes their locks are free.
pub struct Page {
    id: PageId,
    size: usize,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Page {
    pub(crate) fn new(id: PageId, size: usize) -> Self {
        Self {
            id,
            size,
            data: RwLock::new(vec![0; size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquires the content lock in shared mode.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Acquires the content lock in upgradeable mode.
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, Box<[u8]>> {
        self.data.upgradable_read()
    }

    /// Acquires the content lock in exclusive mode.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    /// Increments the pin counter and returns the previous value.
    pub fn pin(&self) -> u32 {
        self.pins.fetch_add(1, Ordering::Relaxed)
    }

    /// Decrements the pin counter and returns the previous value.
    pub fn unpin(&self) -> u32 {
        self.pins.fetch_sub(1, Ordering::Relaxed)
    }

    /// Current pin count, without mutating the counter.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_unpin_returns_previous_value() {
        let page = Page::new(PageId::new(7), 4096);
        assert_eq!(page.pin_count(), 0);
        assert_eq!(page.pin(), 0);
        assert_eq!(page.pin(), 1);
        assert_eq!(page.pin_count(), 2);
        assert_eq!(page.unpin(), 2);
        assert_eq!(page.unpin(), 1);
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn lock_upgrade_roundtrip() {
        let page = Page::new(PageId::new(1), 64);
        let guard = page.upgradable_read();
        assert_eq!(guard[0], 0);
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        guard[0] = 0xAA;
        drop(guard);

        let guard = page.read();
        assert_eq!(guard[0], 0xAA);
    }

    #[test]
    fn dirty_flag() {
        let page = Page::new(PageId::new(2), 64);
        assert!(!page.is_dirty());
        page.set_dirty();
        assert!(page.is_dirty());
        page.clear_dirty();
        assert!(!page.is_dirty());
    }
}
