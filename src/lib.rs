//! A page cache for a disk or far-memory backed B+Tree whose
//! organization is configured at construction time: capacity, line size,
//! replacement structure and per-page-range assignment to specialized
//! sub-caches are all first-class.

pub mod cache;
pub mod config;
pub mod pages;
pub mod storage;

pub use cache::{CacheError, Section, SectionId, SectionName, SectionStats, SectionedPageCache, Variant};
pub use config::CacheConfig;
pub use pages::{PAGE_INVALID, PAGE_METADATA, Page, PageHandle, PageId};
pub use storage::{BackingStore, FarMemoryStore, HeapFile, Latency, NullStore, StoreError};
