use crate::pages::PageId;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("page not found")]
    NotFound,
    #[error("timed out")]
    Timeout,
    #[error("io error")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Transient failures may succeed on a later attempt; the cache never
    /// retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout)
    }
}

/// The collaborator that materializes pages on miss and absorbs writes on
/// dirty eviction.
///
/// `read` fills `buf` with the content of `id`; `write` persists `buf`
/// under `id`. Buffers are always exactly `page_size()` bytes.
pub trait BackingStore: Send + Sync {
    fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), StoreError>;
    fn write(&self, id: PageId, buf: &[u8]) -> Result<(), StoreError>;
    fn page_size(&self) -> usize;
}

/// A store with no memory: reads zero-fill, writes are discarded.
///
/// Used by purely in-memory caches and tests that only exercise residency.
pub struct NullStore {
    page_size: usize,
}

impl NullStore {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }
}

impl BackingStore for NullStore {
    fn read(&self, _id: PageId, buf: &mut [u8]) -> Result<(), StoreError> {
        buf.fill(0);
        Ok(())
    }

    fn write(&self, _id: PageId, _buf: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_store_zero_fills() {
        let store = NullStore::new(64);
        let mut buf = vec![0xFF; 64];
        store.read(PageId::new(3), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        store.write(PageId::new(3), &buf).unwrap();
    }
}
