//! GPU-addressable buffer over one memory object handle.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::object::{MemoryObject, ObjectError};
use crate::pin_table::PinTable;
use crate::{is_page_aligned, PAGE_SHIFT};

// Synthesized mapping addresses. Nothing dereferences these directly
// (content access is copy-based); they only need to be stable, nonzero, and
// distinct between the whole-buffer window and per-page windows.
const CPU_MAP_BASE: u64 = 0x0000_1000_0000_0000;
const PAGE_MAP_BASE: u64 = 0x0000_2000_0000_0000;
const MAP_WINDOW_BYTES: u64 = 1 << 32;

pub type BufferResult<T> = Result<T, BufferError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("imported object size {size:#x} is not page aligned")]
    UnalignedObject { size: u64 },

    #[error("buffer is not CPU mapped")]
    NotMapped,

    #[error("page {page} is not CPU mapped")]
    PageNotMapped { page: u32 },

    #[error("page {page} is not pinned")]
    NotPinned { page: u32 },

    #[error(transparent)]
    Object(#[from] ObjectError),
}

struct BufferState {
    cpu_map_count: u32,
    page_maps: BTreeMap<u32, u64>,
    pins: PinTable,
}

/// Owns one memory object handle and layers driver-side bookkeeping on it:
/// a reference-counted whole-buffer CPU mapping, a per-page mapping table,
/// and per-page pin counts driving physical commitment.
///
/// Buffer identity (`id`) comes from the underlying object, so two buffers
/// importing duplicated handles of one object report the same id.
pub struct PlatformBuffer {
    object: MemoryObject,
    state: Mutex<BufferState>,
}

impl PlatformBuffer {
    /// Allocates a fresh page-aligned object of at least `size` bytes.
    pub fn create(size: u64) -> BufferResult<Self> {
        let object = MemoryObject::create(size)?;
        debug!(id = object.id(), size = object.size(), "created buffer");
        Ok(Self::wrap(object))
    }

    /// Wraps an existing handle. The size check guards against foreign or
    /// corrupt handles; objects from [`MemoryObject::create`] always pass.
    pub fn import(handle: MemoryObject) -> BufferResult<Self> {
        if !is_page_aligned(handle.size()) {
            warn!(id = handle.id(), size = handle.size(), "rejecting unaligned import");
            return Err(BufferError::UnalignedObject {
                size: handle.size(),
            });
        }
        Ok(Self::wrap(handle))
    }

    fn wrap(object: MemoryObject) -> Self {
        let num_pages = object.num_pages();
        Self {
            object,
            state: Mutex::new(BufferState {
                cpu_map_count: 0,
                page_maps: BTreeMap::new(),
                pins: PinTable::new(num_pages),
            }),
        }
    }

    /// Stable 64-bit identity of the underlying memory object.
    pub fn id(&self) -> u64 {
        self.object.id()
    }

    pub fn size(&self) -> u64 {
        self.object.size()
    }

    pub fn num_pages(&self) -> u32 {
        self.object.num_pages()
    }

    /// New handle to the same object, for handing to another connection.
    pub fn duplicate_handle(&self) -> MemoryObject {
        self.object.duplicate()
    }

    /// Maps the whole buffer for CPU access. The first call establishes the
    /// mapping; every later call returns the same base address.
    pub fn map_cpu(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.cpu_map_count += 1;
        self.cpu_base()
    }

    /// Drops one mapping reference; the mapping stays valid until the count
    /// returns to zero. Unmapping an unmapped buffer fails.
    pub fn unmap_cpu(&self) -> BufferResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.cpu_map_count == 0 {
            warn!(id = self.id(), "unmap of unmapped buffer");
            return Err(BufferError::NotMapped);
        }
        state.cpu_map_count -= 1;
        Ok(())
    }

    /// Reads buffer contents through the CPU mapping.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> BufferResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.cpu_map_count == 0 {
                return Err(BufferError::NotMapped);
            }
        }
        Ok(self.object.read_at(offset, dst)?)
    }

    /// Writes buffer contents through the CPU mapping.
    pub fn write_at(&self, offset: u64, src: &[u8]) -> BufferResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.cpu_map_count == 0 {
                return Err(BufferError::NotMapped);
            }
        }
        Ok(self.object.write_at(offset, src)?)
    }

    /// Ensures physical backing for the page range without touching pin
    /// counts. Idempotent.
    pub fn commit_pages(&self, start: u32, count: u32) -> BufferResult<()> {
        Ok(self.object.commit_pages(start, count)?)
    }

    /// Commits the range and increments each page's pin count.
    pub fn pin_pages(&self, start: u32, count: u32) -> BufferResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.object.commit_pages(start, count)?;
        let mut state = self.state.lock().unwrap();
        for page in start..start + count {
            state.pins.increment(page);
        }
        Ok(())
    }

    /// Decrements pin counts for the range and releases physical backing for
    /// pages whose count reaches zero.
    ///
    /// Fails atomically: if any page in the range is not pinned, no count is
    /// changed and no page is decommitted. When every page in the range
    /// loses its last reference together the backing is released as a single
    /// range operation; otherwise drained pages are released individually.
    pub fn unpin_pages(&self, start: u32, count: u32) -> BufferResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.check_range_shape(start, count)?;

        let mut state = self.state.lock().unwrap();

        let mut pages_to_release = 0u32;
        for page in start..start + count {
            match state.pins.count(page) {
                0 => {
                    warn!(id = self.id(), page, "unpin of unpinned page");
                    return Err(BufferError::NotPinned { page });
                }
                1 => pages_to_release += 1,
                _ => {}
            }
        }

        debug!(id = self.id(), start, count, pages_to_release, "unpin");

        if pages_to_release == count {
            for page in start..start + count {
                state
                    .pins
                    .decrement(page)
                    .expect("validated pinned above");
            }
            self.object.decommit_pages(start, count)?;
        } else {
            for page in start..start + count {
                let remaining = state
                    .pins
                    .decrement(page)
                    .expect("validated pinned above");
                if remaining == 0 {
                    self.object.decommit_pages(page, 1)?;
                }
            }
        }
        Ok(())
    }

    fn check_range_shape(&self, start: u32, count: u32) -> BufferResult<()> {
        let num_pages = self.num_pages();
        let in_range = start
            .checked_add(count)
            .map(|end| end <= num_pages)
            .unwrap_or(false);
        if !in_range {
            return Err(BufferError::Object(ObjectError::PageRangeOutOfBounds {
                start,
                count,
                num_pages,
            }));
        }
        Ok(())
    }

    /// Current pin count for `page`.
    pub fn pin_count(&self, page: u32) -> u8 {
        self.state.lock().unwrap().pins.count(page)
    }

    /// Maps a single page into its dedicated window. Mapping an
    /// already-mapped page returns the existing address.
    pub fn map_page_cpu(&self, page: u32) -> BufferResult<u64> {
        self.check_range_shape(page, 1)?;
        let mut state = self.state.lock().unwrap();
        if let Some(&addr) = state.page_maps.get(&page) {
            return Ok(addr);
        }
        let addr = self.page_base(page);
        state.page_maps.insert(page, addr);
        Ok(addr)
    }

    pub fn unmap_page_cpu(&self, page: u32) -> BufferResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.page_maps.remove(&page).is_none() {
            warn!(id = self.id(), page, "unmap of unmapped page");
            return Err(BufferError::PageNotMapped { page });
        }
        Ok(())
    }

    /// Physical addresses for a pinned page range, in page order.
    ///
    /// The caller must have pinned the whole range first; any page with a
    /// zero pin count fails the lookup.
    pub fn map_page_range_bus(&self, start: u32, count: u32) -> BufferResult<Vec<u64>> {
        self.check_range_shape(start, count)?;
        let state = self.state.lock().unwrap();
        let mut addrs = Vec::with_capacity(count as usize);
        for page in start..start + count {
            if state.pins.count(page) == 0 {
                debug!(id = self.id(), page, "bus lookup of unpinned page");
                return Err(BufferError::NotPinned { page });
            }
            // Pinned implies committed.
            let addr = self
                .object
                .page_bus_addr(page)
                .expect("pinned page has committed backing");
            addrs.push(addr);
        }
        Ok(addrs)
    }

    fn cpu_base(&self) -> u64 {
        CPU_MAP_BASE.wrapping_add(self.id().wrapping_mul(MAP_WINDOW_BYTES))
    }

    fn page_base(&self, page: u32) -> u64 {
        PAGE_MAP_BASE
            .wrapping_add(self.id().wrapping_mul(MAP_WINDOW_BYTES))
            .wrapping_add(u64::from(page) << PAGE_SHIFT)
    }
}

impl Drop for PlatformBuffer {
    fn drop(&mut self) {
        let id = self.object.id();
        let num_pages = self.object.num_pages();
        let state = self.state.get_mut().unwrap();
        state.page_maps.clear();
        if state.pins.total() > 0 {
            // Force-release still-pinned pages so no physical commitment
            // outlives the buffer.
            debug!(id, pinned = state.pins.total(), "releasing pinned pages at drop");
            let _ = self.object.decommit_pages(0, num_pages);
        }
    }
}

impl std::fmt::Debug for PlatformBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformBuffer")
            .field("id", &self.id())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn create_page_aligns_and_rejects_zero() {
        for size in [1u64, 4095, 4096, 4097, 20 * PAGE_SIZE] {
            let buffer = PlatformBuffer::create(size).unwrap();
            assert!(buffer.size() >= size);
            assert_eq!(buffer.size() % PAGE_SIZE, 0);
        }
        assert!(matches!(
            PlatformBuffer::create(0),
            Err(BufferError::Object(ObjectError::ZeroSize))
        ));
    }

    #[test]
    fn import_shares_id_and_size() {
        let buffer = PlatformBuffer::create(3 * PAGE_SIZE).unwrap();
        let imported = PlatformBuffer::import(buffer.duplicate_handle()).unwrap();
        assert_eq!(imported.id(), buffer.id());
        assert_eq!(imported.size(), buffer.size());
    }

    #[test]
    fn contents_are_shared_between_imports() {
        let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();
        let imported = PlatformBuffer::import(buffer.duplicate_handle()).unwrap();

        buffer.map_cpu();
        imported.map_cpu();
        buffer.write_at(128, &[7, 8, 9]).unwrap();
        let mut got = [0u8; 3];
        imported.read_at(128, &mut got).unwrap();
        assert_eq!(got, [7, 8, 9]);
    }

    #[test]
    fn cpu_map_is_reference_counted() {
        let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();

        let addr1 = buffer.map_cpu();
        let addr2 = buffer.map_cpu();
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, 0);

        buffer.unmap_cpu().unwrap();
        // One reference remains; access still valid.
        buffer.write_at(0, &[1]).unwrap();

        buffer.unmap_cpu().unwrap();
        assert_eq!(buffer.write_at(0, &[1]), Err(BufferError::NotMapped));
        assert_eq!(buffer.unmap_cpu(), Err(BufferError::NotMapped));
    }

    #[test]
    fn pin_is_reference_counted_per_page() {
        let buffer = PlatformBuffer::create(4 * PAGE_SIZE).unwrap();

        buffer.pin_pages(0, 4).unwrap();
        buffer.pin_pages(0, 4).unwrap();
        buffer.unpin_pages(0, 4).unwrap();
        assert_eq!(buffer.pin_count(0), 1);
        assert!(buffer.map_page_range_bus(0, 4).is_ok());

        buffer.unpin_pages(0, 4).unwrap();
        assert_eq!(buffer.pin_count(0), 0);
        assert!(matches!(
            buffer.unpin_pages(0, 4),
            Err(BufferError::NotPinned { page: 0 })
        ));
    }

    #[test]
    fn unpin_failure_leaves_counts_unchanged() {
        let buffer = PlatformBuffer::create(4 * PAGE_SIZE).unwrap();
        buffer.pin_pages(0, 2).unwrap();

        // Page 2 unpinned: the whole call must fail with no side effects.
        assert!(matches!(
            buffer.unpin_pages(0, 3),
            Err(BufferError::NotPinned { page: 2 })
        ));
        assert_eq!(buffer.pin_count(0), 1);
        assert_eq!(buffer.pin_count(1), 1);
        assert!(buffer.map_page_range_bus(0, 2).is_ok());
    }

    #[test]
    fn partial_unpin_releases_only_drained_pages() {
        let buffer = PlatformBuffer::create(4 * PAGE_SIZE).unwrap();
        buffer.pin_pages(0, 4).unwrap();
        buffer.pin_pages(1, 1).unwrap();

        buffer.unpin_pages(0, 4).unwrap();
        // Page 1 kept its extra reference and its backing; the others drained.
        assert_eq!(buffer.pin_count(1), 1);
        assert!(buffer.map_page_range_bus(1, 1).is_ok());
        for page in [0u32, 2, 3] {
            assert_eq!(buffer.pin_count(page), 0);
            assert!(matches!(
                buffer.map_page_range_bus(page, 1),
                Err(BufferError::NotPinned { .. })
            ));
        }
    }

    #[test]
    fn bus_lookup_requires_pinned_range() {
        let buffer = PlatformBuffer::create(3 * PAGE_SIZE).unwrap();
        assert!(matches!(
            buffer.map_page_range_bus(0, 3),
            Err(BufferError::NotPinned { page: 0 })
        ));

        buffer.pin_pages(0, 3).unwrap();
        let addrs = buffer.map_page_range_bus(0, 3).unwrap();
        assert_eq!(addrs.len(), 3);
        for addr in &addrs {
            assert_ne!(*addr, 0);
        }
        // Distinct backing per page.
        assert_ne!(addrs[0], addrs[1]);
        assert_ne!(addrs[1], addrs[2]);
    }

    #[test]
    fn page_map_is_idempotent() {
        let buffer = PlatformBuffer::create(2 * PAGE_SIZE).unwrap();
        let addr = buffer.map_page_cpu(1).unwrap();
        assert_eq!(buffer.map_page_cpu(1).unwrap(), addr);
        assert_ne!(buffer.map_page_cpu(0).unwrap(), addr);

        buffer.unmap_page_cpu(1).unwrap();
        assert_eq!(
            buffer.unmap_page_cpu(1),
            Err(BufferError::PageNotMapped { page: 1 })
        );
    }

    #[test]
    fn commit_does_not_pin() {
        let buffer = PlatformBuffer::create(2 * PAGE_SIZE).unwrap();
        buffer.commit_pages(0, 2).unwrap();
        assert_eq!(buffer.pin_count(0), 0);
        assert!(matches!(
            buffer.map_page_range_bus(0, 1),
            Err(BufferError::NotPinned { .. })
        ));
    }

    #[test]
    fn zero_count_pin_and_unpin_are_noops() {
        let buffer = PlatformBuffer::create(PAGE_SIZE).unwrap();
        buffer.pin_pages(0, 0).unwrap();
        buffer.unpin_pages(0, 0).unwrap();
        assert_eq!(buffer.pin_count(0), 0);
    }

    #[test]
    fn drop_releases_pinned_backing() {
        let buffer = PlatformBuffer::create(2 * PAGE_SIZE).unwrap();
        let handle = buffer.duplicate_handle();
        buffer.pin_pages(0, 2).unwrap();
        assert_eq!(handle.committed_page_count(), 2);

        drop(buffer);
        assert_eq!(handle.committed_page_count(), 0);
    }
}
