use crate::pages::PageId;
use crate::storage::{BackingStore, NullStore, StoreError};

use std::time::Duration;

/// Artificial access latency, in microseconds.
///
/// An explicit attribute of the store that carries it, never process-wide
/// state: two stores in the same test can simulate different distances.
#[derive(Clone, Copy, Debug, Default)]
pub struct Latency {
    pub base_us: u64,
    pub jitter_us: u64,
}

impl Latency {
    pub fn fixed(base_us: u64) -> Self {
        Self {
            base_us,
            jitter_us: 0,
        }
    }

    fn sleep(&self) {
        if self.base_us == 0 && self.jitter_us == 0 {
            return;
        }

        let mut delay = self.base_us as i64;
        if self.jitter_us > 0 {
            use rand::Rng;
            let jitter = self.jitter_us as i64;
            delay += rand::rng().random_range(-jitter..=jitter);
        }
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay as u64));
        }
    }
}

/// Simulates far memory by delaying every read by `latency`.
///
/// Wraps an inner store; the default inner store is the null sink, which
/// is enough for miss-latency experiments that never look at page
/// contents.
pub struct FarMemoryStore<S = NullStore> {
    inner: S,
    latency: Latency,
}

impl FarMemoryStore<NullStore> {
    pub fn new(page_size: usize, latency: Latency) -> Self {
        Self {
            inner: NullStore::new(page_size),
            latency,
        }
    }
}

impl<S: BackingStore> FarMemoryStore<S> {
    pub fn with_inner(inner: S, latency: Latency) -> Self {
        Self { inner, latency }
    }

    pub fn latency(&self) -> Latency {
        self.latency
    }
}

impl<S: BackingStore> BackingStore for FarMemoryStore<S> {
    fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), StoreError> {
        self.latency.sleep();
        self.inner.read(id, buf)
    }

    fn write(&self, id: PageId, buf: &[u8]) -> Result<(), StoreError> {
        self.inner.write(id, buf)
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    #[test]
    fn read_is_delayed() {
        let store = FarMemoryStore::new(64, Latency::fixed(2_000));
        let mut buf = vec![0u8; 64];

        let start = Instant::now();
        store.read(PageId::new(1), &mut buf).unwrap();
        assert!(start.elapsed() >= Duration::from_micros(2_000));
    }

    #[test]
    fn write_is_not_delayed() {
        let store = FarMemoryStore::new(64, Latency::fixed(50_000));
        let buf = vec![0u8; 64];

        let start = Instant::now();
        store.write(PageId::new(1), &buf).unwrap();
        assert!(start.elapsed() < Duration::from_micros(50_000));
    }
}
