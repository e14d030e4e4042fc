//! The allocator proper: one lock, two transitions.
//!
//! `allocate` pops the free-list head and gives the page its first owner;
//! `release` drops an owner and, only at zero, scrubs the page and pushes it
//! back. `retain` adds owners for shared mappings (copy-on-write). The free
//! list and the reference-count table sit behind a single spin lock, so the
//! three guarantees hold at all times: no page is handed out twice, no page
//! with an owner is on the free list, and counter updates never race.

use core::ptr::{self, NonNull};

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_sync::SpinLock;

use crate::free_list::FreeList;
use crate::layout::{LayoutError, PageIndex, PoolLayout};
use crate::phys_mapper::PhysMapper;
use crate::refcount::RefCountTable;

const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Byte written across a page when it is handed out.
///
/// Reads of memory that was allocated but never initialized show up as a
/// repeated `0x05` in diagnostics.
pub const ALLOCATED_FILL: u8 = 0x05;

/// Byte written across a page when its last owner releases it.
///
/// Distinct from [`ALLOCATED_FILL`] so a dangling pointer into freed memory
/// reads differently from uninitialized-but-live memory.
pub const RELEASED_FILL: u8 = 0x01;

/// The page pool is exhausted.
///
/// A normal outcome, not a bug: the caller decides whether to fail the
/// requesting operation or shed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of physical pages")]
pub struct OutOfPages;

/// Everything the lock guards: the free list and the owner counts move
/// together or not at all.
struct PoolState {
    free: FreeList,
    refs: RefCountTable,
}

/// The physical page allocator.
///
/// One instance manages `[managed_begin, phys_top)` and is constructed
/// exactly once at boot, then shared by reference with every subsystem that
/// needs pages. There is no ambient global; ownership of the instance is the
/// ownership of the pool.
///
/// All operations either complete immediately or spin briefly on the
/// internal lock; nothing here blocks or sleeps.
pub struct PageAllocator<M> {
    mapper: M,
    layout: PoolLayout,
    state: SpinLock<PoolState>,
}

impl<M: PhysMapper> PageAllocator<M> {
    /// Build the allocator over the physical range `[kernel_end, phys_top)`
    /// and seed the free list.
    ///
    /// The reference-count table is carved out of the front of the range and
    /// zeroed. Every page in the remaining pool then has its count bumped to
    /// one and is immediately released: seeding drives the same
    /// decrement-to-zero path used at runtime, so the free-list invariant
    /// has a single source of truth. Callers get a fully formed value back:
    /// no other thread can observe the table mid-initialization because the
    /// instance does not exist for them yet.
    ///
    /// # Errors
    /// [`LayoutError`] if the range cannot hold the table and at least one
    /// page.
    ///
    /// # Safety
    /// - `[kernel_end, phys_top)` must be unused RAM, mapped writable by
    ///   `mapper` for the allocator's whole lifetime.
    /// - Nothing else may touch that range afterwards except through pages
    ///   this allocator handed out.
    pub unsafe fn new(
        mapper: M,
        kernel_end: PhysicalAddress,
        phys_top: PhysicalAddress,
    ) -> Result<Self, LayoutError> {
        let layout = PoolLayout::compute(kernel_end, phys_top)?;

        // SAFETY: the table region lies inside the caller-guaranteed range
        // and below `managed_begin`, disjoint from every page the pool will
        // ever hand out.
        let table = unsafe { mapper.phys_to_ptr(layout.table_base()) }.cast::<u32>();
        debug_assert!(!table.is_null());
        // SAFETY: same region argument as above; `slots * 4` bytes end
        // before `managed_begin`.
        let refs = unsafe { RefCountTable::new(NonNull::new_unchecked(table), layout.slots()) };

        let allocator = Self {
            mapper,
            layout,
            state: SpinLock::new(PoolState {
                free: FreeList::new(),
                refs,
            }),
        };

        for page in allocator.layout.pages() {
            allocator.retain(page.base());
            allocator.release(page.base());
        }

        log::debug!(
            "page pool: {} pages in [{}, {}), reference table at {}",
            allocator.layout.page_count(),
            allocator.layout.managed_begin(),
            allocator.layout.phys_top(),
            allocator.layout.table_base(),
        );

        Ok(allocator)
    }

    /// Allocate one page for exclusive use by the caller.
    ///
    /// The returned page has exactly one owner. Its contents are the
    /// [`ALLOCATED_FILL`] pattern (with the `scrub` feature) or whatever the
    /// previous owner left behind; use
    /// [`allocate_zeroed`](Self::allocate_zeroed) when a clean page matters.
    ///
    /// # Errors
    /// [`OutOfPages`] when the free list is empty.
    pub fn allocate(&self) -> Result<PhysicalPage, OutOfPages> {
        let (ptr, page) = {
            let mut state = self.state.lock();
            let Some((ptr, page)) = state.free.pop() else {
                return Err(OutOfPages);
            };
            let count = state.refs.increment(self.tracked_index(page.base()));
            debug_assert_eq!(count, 1, "page on the free list had owners");
            (ptr, page)
        };

        // The caller is the sole owner now; filling shared state is over, so
        // this runs outside the lock.
        #[cfg(feature = "scrub")]
        // SAFETY: `ptr` maps `page`, which just left the free list.
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), ALLOCATED_FILL, PAGE_BYTES);
        }
        #[cfg(not(feature = "scrub"))]
        let _ = ptr;

        #[cfg(feature = "log-allocations")]
        log::trace!("allocate {page}");

        Ok(page)
    }

    /// Allocate one page and zero it.
    ///
    /// # Errors
    /// [`OutOfPages`] when the free list is empty.
    pub fn allocate_zeroed(&self) -> Result<PhysicalPage, OutOfPages> {
        let page = self.allocate()?;
        // SAFETY: `allocate` just made the caller the sole owner of `page`.
        unsafe {
            ptr::write_bytes(self.mapper.phys_to_ptr(page.base()), 0, PAGE_BYTES);
        }
        Ok(page)
    }

    /// Drop one ownership reference to the page at `addr`; returns the
    /// remaining owner count.
    ///
    /// While the count stays above zero the page remains allocated, owned by
    /// whoever else holds it. At zero the page is scrubbed with
    /// [`RELEASED_FILL`] and pushed onto the free list, both while still
    /// holding the lock, so a concurrent `allocate` can never pop a
    /// half-scrubbed page.
    ///
    /// This is the single decrement primitive: every path that drops an
    /// owner, including unsharing after copy-on-write, goes through here and
    /// gets the reclaim-at-zero behavior.
    ///
    /// # Panics
    /// Misaligned or out-of-range addresses are invalid frees (kernel bugs,
    /// not runtime conditions) and halt via panic, as does releasing a page
    /// that has no owners.
    pub fn release(&self, addr: PhysicalAddress) -> u32 {
        let index = self.checked_index(addr);
        let mut state = self.state.lock();
        let remaining = state.refs.decrement(index);
        if remaining == 0 {
            // SAFETY: `addr` passed validation, so the pointer maps a
            // managed page; its last owner is gone.
            let ptr = unsafe { self.mapper.phys_to_ptr(addr) };
            #[cfg(feature = "scrub")]
            // SAFETY: as above; nothing else references the page.
            unsafe {
                ptr::write_bytes(ptr, RELEASED_FILL, PAGE_BYTES);
            }
            // SAFETY: `ptr` is the mapped base of a page with zero owners,
            // absent from the list since its last `allocate`.
            unsafe {
                state
                    .free
                    .push(NonNull::new_unchecked(ptr), PhysicalPage::containing(addr));
            }
        }
        drop(state);

        #[cfg(feature = "log-allocations")]
        log::trace!("release {addr}: {remaining} owners remain");

        remaining
    }

    /// Add one ownership reference to the page at `addr`; returns the new
    /// owner count.
    ///
    /// The virtual-memory layer calls this when a second mapping starts
    /// sharing the page, e.g. marking it copy-on-write across a fork.
    ///
    /// # Panics
    /// On misaligned or out-of-range addresses, like [`release`](Self::release).
    pub fn retain(&self, addr: PhysicalAddress) -> u32 {
        let index = self.checked_index(addr);
        let count = self.state.lock().refs.increment(index);

        #[cfg(feature = "log-allocations")]
        log::trace!("retain {addr}: {count} owners");

        count
    }

    /// Current owner count of the page at `addr`, without changing it.
    ///
    /// # Panics
    /// On misaligned or out-of-range addresses, like [`release`](Self::release).
    #[must_use]
    pub fn ref_count(&self, addr: PhysicalAddress) -> u32 {
        let index = self.checked_index(addr);
        self.state.lock().refs.get(index)
    }

    /// Number of pages currently on the free list.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Total number of managed pages.
    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.layout.page_count()
    }

    /// The fixed range computation backing this allocator.
    #[must_use]
    pub const fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// The one place addresses from outside become table indices.
    fn checked_index(&self, addr: PhysicalAddress) -> PageIndex {
        match self.layout.index_of(addr) {
            Ok(index) => index,
            Err(err) => panic!("page allocator: {err}"),
        }
    }

    /// Index of a page the allocator itself produced; failure means the free
    /// list no longer describes the pool.
    fn tracked_index(&self, addr: PhysicalAddress) -> PageIndex {
        match self.layout.index_of(addr) {
            Ok(index) => index,
            Err(_) => panic!("page allocator: free list corrupted, popped {addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mapper::OffsetMapper;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    /// One 4 KiB-aligned frame of simulated physical RAM.
    #[repr(align(4096))]
    struct Frame([u8; PAGE_BYTES]);

    /// An owned stretch of "physical memory" with the allocator built over
    /// it. Physical addresses are the buffer's own addresses, the way an
    /// identity-mapped kernel sees RAM.
    struct TestPool {
        #[allow(dead_code)]
        ram: Box<[Frame]>,
        alloc: PageAllocator<OffsetMapper>,
    }

    fn pool_with(frames: usize) -> TestPool {
        let ram: Box<[Frame]> = (0..frames).map(|_| Frame([0; PAGE_BYTES])).collect();
        let kernel_end = PhysicalAddress::new(ram.as_ptr() as u64);
        let phys_top = kernel_end + frames as u64 * PAGE_SIZE;
        let alloc =
            unsafe { PageAllocator::new(OffsetMapper::identity(), kernel_end, phys_top) }.unwrap();
        TestPool { ram, alloc }
    }

    #[test]
    fn hands_out_every_page_exactly_once() {
        let pool = pool_with(8);
        let total = pool.alloc.total_pages();
        // One frame went to the reference-count table.
        assert_eq!(total, 7);
        assert_eq!(pool.alloc.free_pages(), total);

        let mut seen = BTreeSet::new();
        for _ in 0..total {
            let page = pool.alloc.allocate().unwrap();
            assert!(page.base().is_page_aligned());
            assert!(page.base() >= pool.alloc.layout().managed_begin());
            assert!(page.base() < pool.alloc.layout().phys_top());
            assert!(seen.insert(page.base().as_u64()), "page handed out twice");
        }
        assert_eq!(pool.alloc.allocate(), Err(OutOfPages));
        assert_eq!(pool.alloc.free_pages(), 0);
    }

    #[test]
    fn release_scrubs_and_reuses_the_page() {
        let pool = pool_with(4);
        let page = pool.alloc.allocate().unwrap();
        let ptr = page.base().as_u64() as *mut u8;
        // SAFETY: we own the page; identity map makes the base a pointer.
        unsafe { ptr::write_bytes(ptr, 0xAA, PAGE_BYTES) };

        assert_eq!(pool.alloc.release(page.base()), 0);
        // Our bytes are gone. Probe past the free-list link words at the
        // page base, which are the one part of a free page that is not fill.
        assert_eq!(unsafe { ptr.add(64).read() }, RELEASED_FILL);
        assert_eq!(unsafe { ptr.add(PAGE_BYTES - 1).read() }, RELEASED_FILL);

        // LIFO reuse: the page comes straight back, carrying the allocated
        // pattern this time.
        let again = pool.alloc.allocate().unwrap();
        assert_eq!(again, page);
        assert_eq!(unsafe { ptr.read() }, ALLOCATED_FILL);
        assert_eq!(unsafe { ptr.add(64).read() }, ALLOCATED_FILL);
    }

    #[test]
    fn allocate_zeroed_clears_the_fill() {
        let pool = pool_with(4);
        let page = pool.alloc.allocate_zeroed().unwrap();
        let ptr = page.base().as_u64() as *const u8;
        assert_eq!(unsafe { ptr.read() }, 0);
        assert_eq!(unsafe { ptr.add(PAGE_BYTES - 1).read() }, 0);
    }

    #[test]
    fn shared_page_stays_allocated_until_the_last_owner() {
        let pool = pool_with(4);
        let page = pool.alloc.allocate().unwrap();
        let free_before = pool.alloc.free_pages();
        assert_eq!(pool.alloc.ref_count(page.base()), 1);

        // Second owner appears (copy-on-write fork).
        assert_eq!(pool.alloc.retain(page.base()), 2);

        // First owner drops out: page must stay allocated.
        assert_eq!(pool.alloc.release(page.base()), 1);
        assert_eq!(pool.alloc.free_pages(), free_before);
        assert_eq!(pool.alloc.ref_count(page.base()), 1);

        // Last owner drops out: page is reclaimed and immediately
        // allocatable again.
        assert_eq!(pool.alloc.release(page.base()), 0);
        assert_eq!(pool.alloc.free_pages(), free_before + 1);
        assert_eq!(pool.alloc.allocate().unwrap(), page);
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn release_of_misaligned_address_is_fatal() {
        let pool = pool_with(4);
        let page = pool.alloc.allocate().unwrap();
        pool.alloc.release(page.base() + 1);
    }

    #[test]
    #[should_panic(expected = "outside the managed range")]
    fn release_into_the_table_region_is_fatal() {
        let pool = pool_with(4);
        // Backed by RAM, but reserved: never allocatable, never releasable.
        pool.alloc.release(pool.alloc.layout().table_base());
    }

    #[test]
    #[should_panic(expected = "outside the managed range")]
    fn release_at_the_physical_top_is_fatal() {
        let pool = pool_with(4);
        pool.alloc.release(pool.alloc.layout().phys_top());
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn double_release_is_fatal() {
        let pool = pool_with(4);
        let page = pool.alloc.allocate().unwrap();
        pool.alloc.release(page.base());
        pool.alloc.release(page.base());
    }

    #[test]
    fn pool_works_behind_a_direct_map_offset() {
        // Simulated higher-half direct map: physical addresses start at a
        // fixed base, the mapper adds the distance to the backing buffer.
        const PHYS_BASE: u64 = 0x8000_0000;
        let ram: Box<[Frame]> = (0..4).map(|_| Frame([0; PAGE_BYTES])).collect();
        let offset = (ram.as_ptr() as u64).wrapping_sub(PHYS_BASE);

        let kernel_end = PhysicalAddress::new(PHYS_BASE);
        let phys_top = kernel_end + 4 * PAGE_SIZE;
        let alloc =
            unsafe { PageAllocator::new(OffsetMapper::new(offset), kernel_end, phys_top) }.unwrap();

        let page = alloc.allocate().unwrap();
        assert!(page.base().as_u64() >= PHYS_BASE);
        assert!(page.base().as_u64() < phys_top.as_u64());
        // The fill landed in the buffer, not at the fake physical address.
        let in_buffer = page.base().as_u64().wrapping_add(offset) as *const u8;
        assert_eq!(unsafe { in_buffer.read() }, ALLOCATED_FILL);
        assert_eq!(alloc.release(page.base()), 0);
    }

    #[test]
    fn concurrent_churn_preserves_the_pool() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 2_000;

        let pool = Arc::new(pool_with(9));
        let total = pool.alloc.total_pages();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut held: Vec<PhysicalPage> = Vec::new();
                    for round in 0..ROUNDS {
                        // Skewed mix so each thread both accumulates and
                        // drains, offset per thread to desynchronize them.
                        if (round + t) % 3 == 2 {
                            if let Some(page) = held.pop() {
                                pool.alloc.release(page.base());
                            }
                        } else if let Ok(page) = pool.alloc.allocate() {
                            held.push(page);
                        }
                    }
                    for page in held {
                        pool.alloc.release(page.base());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every page came home, and each is allocatable exactly once: no
        // page was lost, duplicated, or double-inserted under contention.
        assert_eq!(pool.alloc.free_pages(), total);
        let mut seen = BTreeSet::new();
        while let Ok(page) = pool.alloc.allocate() {
            assert!(seen.insert(page.base().as_u64()));
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn concurrent_sharing_never_loses_an_owner() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1_000;

        let pool = Arc::new(pool_with(4));
        let page = pool.alloc.allocate().unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let addr = page.base();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        pool.alloc.retain(addr);
                        pool.alloc.release(addr);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // The original owner is still the only one; the page never hit the
        // free list in between.
        assert_eq!(pool.alloc.ref_count(page.base()), 1);
        assert_eq!(pool.alloc.release(page.base()), 0);
    }
}
