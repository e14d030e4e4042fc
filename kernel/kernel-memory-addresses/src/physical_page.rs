use crate::{PAGE_SIZE, PhysicalAddress};
use core::fmt;

/// The page-aligned base of one 4 KiB physical page.
///
/// ### Invariants
/// - The low [`PAGE_SHIFT`](crate::PAGE_SHIFT) bits of the base are always
///   zero. Both constructors uphold this: [`containing`](Self::containing)
///   clears the offset bits, [`try_new`](Self::try_new) rejects them.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let page = PhysicalPage::containing(PhysicalAddress::new(0x8000_1234));
/// assert_eq!(page.base().as_u64(), 0x8000_1000);
/// assert!(PhysicalPage::try_new(PhysicalAddress::new(0x8000_1234)).is_err());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// The page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.align_down(PAGE_SIZE))
    }

    /// Checked constructor: `addr` must already be page-aligned.
    ///
    /// # Errors
    /// [`MisalignedAddress`] if any offset bit of `addr` is set.
    pub const fn try_new(addr: PhysicalAddress) -> Result<Self, MisalignedAddress> {
        if addr.is_page_aligned() {
            Ok(Self(addr))
        } else {
            Err(MisalignedAddress { addr })
        }
    }

    /// The page base as a [`PhysicalAddress`].
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    /// The immediately following page.
    ///
    /// Wraps in release builds if `self` is the last page of the address
    /// space; callers iterate within a bounded range.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(PhysicalAddress::new(self.0.as_u64() + PAGE_SIZE))
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(page: PhysicalPage) -> Self {
        page.base()
    }
}

/// An address that was required to be page-aligned but is not.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("address {addr} is not page-aligned")]
pub struct MisalignedAddress {
    /// The offending address.
    pub addr: PhysicalAddress,
}
