//! Sized, duplicable memory objects with page-granular physical commitment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::{round_up_to_page, PAGE_SIZE};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique object id. Ids are never zero and never reused.
///
/// Shared with [`crate::Semaphore`] so buffers and semaphores live in one id
/// namespace, the way kernel object ids do.
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

pub type ObjectResult<T> = Result<T, ObjectError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("cannot create a zero-size memory object")]
    ZeroSize,

    #[error("size {size:#x} overflows page rounding")]
    SizeOverflow { size: u64 },

    #[error("page range {start}+{count} exceeds {num_pages} pages")]
    PageRangeOutOfBounds {
        start: u32,
        count: u32,
        num_pages: u32,
    },

    #[error("byte range {offset:#x}+{len:#x} exceeds object size {size:#x}")]
    ByteRangeOutOfBounds { offset: u64, len: usize, size: u64 },
}

struct ObjectState {
    /// One slot per page; `Some` while the page has committed backing.
    pages: Vec<Option<Box<[u8]>>>,
}

struct ObjectInner {
    id: u64,
    size: u64,
    state: Mutex<ObjectState>,
}

/// Handle to a page-granular memory region.
///
/// Handles are cheap to duplicate; all duplicates observe the same contents
/// and report the same id. Identity is a property of the underlying object,
/// not of any particular handle.
#[derive(Clone)]
pub struct MemoryObject {
    inner: Arc<ObjectInner>,
}

impl MemoryObject {
    /// Creates a new object of at least `size` bytes, rounded up to page
    /// granularity. No pages are committed yet.
    pub fn create(size: u64) -> ObjectResult<Self> {
        if size == 0 {
            return Err(ObjectError::ZeroSize);
        }
        let size = round_up_to_page(size).ok_or(ObjectError::SizeOverflow { size })?;
        let num_pages = (size / PAGE_SIZE) as usize;
        Ok(Self {
            inner: Arc::new(ObjectInner {
                id: next_object_id(),
                size,
                state: Mutex::new(ObjectState {
                    pages: (0..num_pages).map(|_| None).collect(),
                }),
            }),
        })
    }

    /// Returns a new handle referencing the same object with equivalent
    /// rights.
    pub fn duplicate(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn num_pages(&self) -> u32 {
        (self.inner.size / PAGE_SIZE) as u32
    }

    /// True when both handles reference the same underlying object.
    pub fn same_object(&self, other: &MemoryObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_page_range(&self, start: u32, count: u32) -> ObjectResult<()> {
        let num_pages = self.num_pages();
        let end = start
            .checked_add(count)
            .ok_or(ObjectError::PageRangeOutOfBounds {
                start,
                count,
                num_pages,
            })?;
        if end > num_pages {
            return Err(ObjectError::PageRangeOutOfBounds {
                start,
                count,
                num_pages,
            });
        }
        Ok(())
    }

    /// Ensures physical backing exists for the page range. Idempotent.
    pub fn commit_pages(&self, start: u32, count: u32) -> ObjectResult<()> {
        self.check_page_range(start, count)?;
        let mut state = self.inner.state.lock().unwrap();
        for page in start..start + count {
            let slot = &mut state.pages[page as usize];
            if slot.is_none() {
                *slot = Some(vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            }
        }
        Ok(())
    }

    /// Releases physical backing for the page range. Contents are lost;
    /// subsequent reads of a decommitted page observe zeros.
    pub fn decommit_pages(&self, start: u32, count: u32) -> ObjectResult<()> {
        self.check_page_range(start, count)?;
        let mut state = self.inner.state.lock().unwrap();
        for page in start..start + count {
            state.pages[page as usize] = None;
        }
        Ok(())
    }

    pub fn page_committed(&self, page: u32) -> bool {
        if page >= self.num_pages() {
            return false;
        }
        let state = self.inner.state.lock().unwrap();
        state.pages[page as usize].is_some()
    }

    /// Number of pages with live physical backing.
    pub fn committed_page_count(&self) -> u32 {
        let state = self.inner.state.lock().unwrap();
        state.pages.iter().filter(|p| p.is_some()).count() as u32
    }

    /// Stable physical address of a committed page; `None` when uncommitted.
    ///
    /// The address is derived from the page's backing allocation: nonzero,
    /// unique among live pages, and stable until the page is decommitted.
    pub fn page_bus_addr(&self, page: u32) -> Option<u64> {
        if page >= self.num_pages() {
            return None;
        }
        let state = self.inner.state.lock().unwrap();
        state.pages[page as usize]
            .as_ref()
            .map(|block| block.as_ptr() as u64)
    }

    /// Copies object contents into `dst`. Uncommitted pages read as zeros
    /// and stay uncommitted.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> ObjectResult<()> {
        self.check_byte_range(offset, dst.len())?;
        let state = self.inner.state.lock().unwrap();
        let mut cur = offset;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let page = (cur / PAGE_SIZE) as usize;
            let page_off = (cur % PAGE_SIZE) as usize;
            let take = remaining.len().min(PAGE_SIZE as usize - page_off);
            match &state.pages[page] {
                Some(block) => remaining[..take].copy_from_slice(&block[page_off..page_off + take]),
                None => remaining[..take].fill(0),
            }
            cur += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    /// Copies `src` into the object. Writing commits any uncommitted page it
    /// touches (fault semantics).
    pub fn write_at(&self, offset: u64, src: &[u8]) -> ObjectResult<()> {
        self.check_byte_range(offset, src.len())?;
        let mut state = self.inner.state.lock().unwrap();
        let mut cur = offset;
        let mut remaining = src;
        while !remaining.is_empty() {
            let page = (cur / PAGE_SIZE) as usize;
            let page_off = (cur % PAGE_SIZE) as usize;
            let take = remaining.len().min(PAGE_SIZE as usize - page_off);
            let block = state.pages[page]
                .get_or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            block[page_off..page_off + take].copy_from_slice(&remaining[..take]);
            cur += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    fn check_byte_range(&self, offset: u64, len: usize) -> ObjectResult<()> {
        let size = self.inner.size;
        let end = offset
            .checked_add(len as u64)
            .ok_or(ObjectError::ByteRangeOutOfBounds { offset, len, size })?;
        if end > size {
            return Err(ObjectError::ByteRangeOutOfBounds { offset, len, size });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObject")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rounds_size_and_assigns_unique_ids() {
        let a = MemoryObject::create(1).unwrap();
        let b = MemoryObject::create(PAGE_SIZE + 1).unwrap();
        assert_eq!(a.size(), PAGE_SIZE);
        assert_eq!(b.size(), 2 * PAGE_SIZE);
        assert_ne!(a.id(), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn create_zero_size_fails() {
        assert!(matches!(MemoryObject::create(0), Err(ObjectError::ZeroSize)));
    }

    #[test]
    fn duplicate_shares_identity_and_contents() {
        let a = MemoryObject::create(PAGE_SIZE).unwrap();
        let b = a.duplicate();
        assert_eq!(a.id(), b.id());
        assert!(a.same_object(&b));

        a.write_at(16, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        b.read_at(16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn commit_decommit_tracks_backing() {
        let obj = MemoryObject::create(4 * PAGE_SIZE).unwrap();
        assert_eq!(obj.committed_page_count(), 0);
        assert_eq!(obj.page_bus_addr(0), None);

        obj.commit_pages(1, 2).unwrap();
        assert_eq!(obj.committed_page_count(), 2);
        assert!(!obj.page_committed(0));
        assert!(obj.page_committed(1));
        let addr = obj.page_bus_addr(1).unwrap();
        assert_ne!(addr, 0);

        // Commit is idempotent and keeps the backing (and address) stable.
        obj.commit_pages(1, 1).unwrap();
        assert_eq!(obj.page_bus_addr(1), Some(addr));

        obj.decommit_pages(0, 4).unwrap();
        assert_eq!(obj.committed_page_count(), 0);
        assert_eq!(obj.page_bus_addr(1), None);
    }

    #[test]
    fn decommit_zeroes_contents() {
        let obj = MemoryObject::create(PAGE_SIZE).unwrap();
        obj.write_at(0, &[0xaa; 8]).unwrap();
        obj.decommit_pages(0, 1).unwrap();
        let mut buf = [0xffu8; 8];
        obj.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn write_commits_touched_pages_only() {
        let obj = MemoryObject::create(3 * PAGE_SIZE).unwrap();
        // Crosses from page 0 into page 1.
        obj.write_at(PAGE_SIZE - 2, &[1, 2, 3, 4]).unwrap();
        assert!(obj.page_committed(0));
        assert!(obj.page_committed(1));
        assert!(!obj.page_committed(2));

        let mut buf = [0u8; 4];
        obj.read_at(PAGE_SIZE - 2, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_access_fails_without_panicking() {
        let obj = MemoryObject::create(PAGE_SIZE).unwrap();
        assert!(matches!(
            obj.read_at(PAGE_SIZE - 2, &mut [0u8; 4]),
            Err(ObjectError::ByteRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            obj.write_at(u64::MAX - 1, &[0u8; 4]),
            Err(ObjectError::ByteRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            obj.commit_pages(1, 1),
            Err(ObjectError::PageRangeOutOfBounds { .. })
        ));
        assert!(matches!(
            obj.commit_pages(0, u32::MAX),
            Err(ObjectError::PageRangeOutOfBounds { .. })
        ));
    }
}
