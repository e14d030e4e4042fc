//! Managed-range computation and address validation.
//!
//! Everything here is decided exactly once, before the first allocation, and
//! never changes: where the reference-count table sits, where the page pool
//! begins, and how many pages it holds. [`PoolLayout::index_of`] is the only
//! way to obtain a [`PageIndex`], so no address reaches the table without
//! passing the alignment and range checks first.

use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Width in bytes of one reference-count slot.
const SLOT_BYTES: u64 = size_of::<u32>() as u64;

/// The fixed placement of the reference-count table and the page pool inside
/// `[kernel_end, phys_top)`.
///
/// The slot count is sized from the *full* span above the kernel image, a
/// generous upper bound on the number of managed pages fixed before the
/// pool base itself is known. That keeps the computation a single forward
/// pass instead of a fixpoint between table size and pool size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    kernel_end: PhysicalAddress,
    table_base: PhysicalAddress,
    slots: usize,
    managed_begin: PhysicalAddress,
    phys_top: PhysicalAddress,
    page_count: usize,
}

impl PoolLayout {
    /// Compute the layout for the physical range `[kernel_end, phys_top)`.
    ///
    /// # Errors
    /// [`LayoutError`] if the range is empty or too small to hold the
    /// reference-count table plus at least one page.
    pub fn compute(
        kernel_end: PhysicalAddress,
        phys_top: PhysicalAddress,
    ) -> Result<Self, LayoutError> {
        if phys_top <= kernel_end {
            return Err(LayoutError::EmptyRegion {
                kernel_end,
                phys_top,
            });
        }

        let span = phys_top.as_u64() - kernel_end.as_u64();
        let slots = (span / PAGE_SIZE) as usize;

        let table_base = kernel_end.align_up(PAGE_SIZE);
        let table_end = table_base
            .checked_add(slots as u64 * SLOT_BYTES)
            .ok_or(LayoutError::NoUsablePages {
                kernel_end,
                phys_top,
            })?;
        let managed_begin = table_end.align_up(PAGE_SIZE);

        if managed_begin.as_u64().saturating_add(PAGE_SIZE) > phys_top.as_u64() {
            return Err(LayoutError::NoUsablePages {
                kernel_end,
                phys_top,
            });
        }
        let page_count = ((phys_top.as_u64() - managed_begin.as_u64()) / PAGE_SIZE) as usize;

        Ok(Self {
            kernel_end,
            table_base,
            slots,
            managed_begin,
            phys_top,
            page_count,
        })
    }

    /// First address after the kernel image, as supplied at construction.
    #[must_use]
    pub const fn kernel_end(&self) -> PhysicalAddress {
        self.kernel_end
    }

    /// Page-aligned base of the reference-count table.
    #[must_use]
    pub const fn table_base(&self) -> PhysicalAddress {
        self.table_base
    }

    /// Number of `u32` slots in the reference-count table.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// First page available for allocation.
    #[must_use]
    pub const fn managed_begin(&self) -> PhysicalAddress {
        self.managed_begin
    }

    /// Exclusive upper bound of the managed range.
    #[must_use]
    pub const fn phys_top(&self) -> PhysicalAddress {
        self.phys_top
    }

    /// Number of pages in `[managed_begin, phys_top)`.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    /// Validate `addr` and translate it to its reference-table index.
    ///
    /// The address must be page-aligned and lie in
    /// `[managed_begin, phys_top)`. Note the lower bound: addresses inside
    /// the reserved table region `[kernel_end, managed_begin)` are rejected
    /// as out of range, they are backed by RAM but never allocatable.
    ///
    /// # Errors
    /// [`PageRangeError`] describing which check failed.
    pub fn index_of(&self, addr: PhysicalAddress) -> Result<PageIndex, PageRangeError> {
        if !addr.is_page_aligned() {
            return Err(PageRangeError::Misaligned { addr });
        }
        if addr < self.managed_begin || addr >= self.phys_top {
            return Err(PageRangeError::OutOfRange { addr });
        }
        Ok(PageIndex(
            ((addr.as_u64() - self.managed_begin.as_u64()) / PAGE_SIZE) as usize,
        ))
    }

    /// The page a previously validated index refers to.
    #[must_use]
    pub const fn page_at(&self, index: PageIndex) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(
            self.managed_begin.as_u64() + index.0 as u64 * PAGE_SIZE,
        ))
    }

    /// All managed pages, in ascending address order.
    pub fn pages(&self) -> impl Iterator<Item = PhysicalPage> + '_ {
        (0..self.page_count).map(|i| self.page_at(PageIndex(i)))
    }
}

/// Index of a managed page in the reference-count table.
///
/// Only [`PoolLayout::index_of`] produces these, so holding one proves the
/// address behind it passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndex(usize);

impl PageIndex {
    pub(crate) const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The supplied physical range cannot host an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// `phys_top` does not lie above `kernel_end`.
    #[error("physical top {phys_top} does not lie above the kernel image end {kernel_end}")]
    EmptyRegion {
        kernel_end: PhysicalAddress,
        phys_top: PhysicalAddress,
    },
    /// The range holds the reference-count table but not a single page.
    #[error("range [{kernel_end}, {phys_top}) leaves no page after the reference-count table")]
    NoUsablePages {
        kernel_end: PhysicalAddress,
        phys_top: PhysicalAddress,
    },
}

/// An address that failed validation against the managed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageRangeError {
    /// The address has nonzero page-offset bits.
    #[error("address {addr} is not page-aligned")]
    Misaligned { addr: PhysicalAddress },
    /// The address is page-aligned but not a managed page.
    #[error("address {addr} is outside the managed range")]
    OutOfRange { addr: PhysicalAddress },
}
