/// Construction-time configuration of the sectioned cache.
///
/// `page_size` must match the backing store's page size; the default
/// section is created fully-associative over the whole budget with
/// `default_line_size` lines.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Aggregate capacity budget, in bytes.
    pub total_bytes: usize,
    /// Page granularity, in bytes.
    pub page_size: usize,
    /// Line size of the default section, in bytes.
    pub default_line_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_bytes: 64 * 1024 * 1024,
            page_size: 4096,
            default_line_size: 4096,
        }
    }
}
