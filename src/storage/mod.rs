mod backend;
mod farmem;
mod heapfile;

pub use backend::{BackingStore, NullStore, StoreError};
pub use farmem::{FarMemoryStore, Latency};
pub use heapfile::HeapFile;
