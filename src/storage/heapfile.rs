use crate::pages::PageId;
use crate::storage::{BackingStore, StoreError};

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::*;

const HEAP_MAGIC: u32 = 0x7ECA_C4E7;

/// On-disk header, stored in the first bytes of page 0.
///
/// Page 0 is never served as data: page id 0 is the invalid sentinel, so
/// the header page can never collide with a cached page.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct HeapFileHeader {
    magic: U32,
    page_size: U32,
    page_count: U32,
}

/// Positioned I/O against a single heap file.
///
/// Page `n` lives at byte offset `n * page_size`. The file grows on
/// writes past the current page count; reads past it fail with
/// [`StoreError::NotFound`].
pub struct HeapFile {
    file: File,
    page_size: usize,
    page_count: Mutex<u32>,
}

impl HeapFile {
    /// Creates a new heap file, truncating any existing one.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StoreError::Io)?;

        // Page 0 holds the header and is never served as data.
        file.set_len(page_size as u64)?;

        let heap_file = Self {
            file,
            page_size,
            page_count: Mutex::new(1),
        };
        heap_file.write_header(1)?;

        Ok(heap_file)
    }

    /// Opens an existing heap file and validates its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StoreError::Io)?;

        let mut buf = [0u8; size_of::<HeapFileHeader>()];
        file.read_exact_at(&mut buf, 0)?;
        let header = HeapFileHeader::read_from_bytes(&buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad heap file header"))?;

        if header.magic.get() != HEAP_MAGIC {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad heap file magic",
            )));
        }

        Ok(Self {
            file,
            page_size: header.page_size.get() as usize,
            page_count: Mutex::new(header.page_count.get()),
        })
    }

    pub fn page_count(&self) -> u32 {
        *self.page_count.lock()
    }

    /// Attempts to sync file data and metadata to the disk.
    ///
    /// # Panics
    ///
    /// Panics if the underlying `File::sync_all` operation fails: after a
    /// failed fsync the kernel may have dropped the dirty data, so no
    /// retry can succeed.
    /// ref: https://wiki.postgresql.org/wiki/Fsync_Errors
    pub fn sync(&self) {
        if self.file.sync_all().is_err() {
            panic!("sync (fsync) failed");
        }
    }

    fn write_header(&self, page_count: u32) -> Result<(), StoreError> {
        let header = HeapFileHeader {
            magic: U32::new(HEAP_MAGIC),
            page_size: U32::new(self.page_size as u32),
            page_count: U32::new(page_count),
        };
        self.file.write_all_at(header.as_bytes(), 0)?;

        Ok(())
    }

    fn offset(&self, id: PageId) -> u64 {
        id.get() as u64 * self.page_size as u64
    }
}

impl BackingStore for HeapFile {
    fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), StoreError> {
        let page_count = *self.page_count.lock();
        if !id.is_valid() || id.get() >= page_count {
            return Err(StoreError::NotFound);
        }

        self.file.read_exact_at(buf, self.offset(id))?;

        Ok(())
    }

    fn write(&self, id: PageId, buf: &[u8]) -> Result<(), StoreError> {
        if !id.is_valid() {
            return Err(StoreError::NotFound);
        }

        let mut page_count = self.page_count.lock();
        if id.get() >= *page_count {
            self.file
                .set_len((id.get() as u64 + 1) * self.page_size as u64)?;
            *page_count = id.get() + 1;
            self.write_header(*page_count)?;
        }

        self.file.write_all_at(buf, self.offset(id))?;

        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
