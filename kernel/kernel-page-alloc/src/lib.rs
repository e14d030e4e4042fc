//! # Physical Page Allocator
//!
//! Hands out fixed-size 4 KiB physical pages (for process page tables,
//! kernel stacks, pipe buffers) and reclaims them once their last owner is
//! gone. Pages can be shared, e.g. copy-on-write across forks, so every page
//! carries a reference count and only returns to the free pool when that
//! count reaches zero.
//!
//! ## Memory layout
//!
//! The allocator owns the physical range between the end of the kernel image
//! and the top of RAM. It carves its reference-count table out of the front
//! of that range; everything after the table is the page pool:
//!
//! ```text
//! kernel_end   table_base      managed_begin                      phys_top
//!     ▼            ▼                ▼                                 ▼
//! ────┬────────────┬────────────────┬─────────────────────────────────┐
//!  …  │ (rounding) │ refcount table │ managed pages                   │
//! ────┴────────────┴────────────────┴─────────────────────────────────┘
//! ```
//!
//! Free pages form a singly linked list threaded through their own storage;
//! no metadata is allocated anywhere else. One spin lock guards the list and
//! the table together, so no two callers can ever receive the same page and
//! a page is never visible on the free list with a live owner.
//!
//! ## Structure
//!
//! - [`PoolLayout`]: the one-shot range computation and the only path that
//!   turns an address into a table index.
//! - [`PhysMapper`]: the seam between physical addresses and pointers the
//!   allocator can actually write through (direct map in a kernel, an owned
//!   buffer in tests).
//! - [`PageAllocator`]: the lock, the free list, the table, and the public
//!   operations [`allocate`](PageAllocator::allocate),
//!   [`release`](PageAllocator::release), and
//!   [`retain`](PageAllocator::retain).
//!
//! Exhaustion is an ordinary error ([`OutOfPages`]); releasing an address the
//! allocator never managed is a kernel bug and panics.
//!
//! ## Example
//!
//! Hosted, with an owned buffer standing in for physical RAM (a kernel would
//! pass its direct-map offset and real boot-time bounds instead):
//!
//! ```rust
//! use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
//! use kernel_page_alloc::{OffsetMapper, PageAllocator};
//!
//! #[repr(align(4096))]
//! struct Frame([u8; PAGE_SIZE as usize]);
//!
//! let ram: Box<[Frame]> = (0..8).map(|_| Frame([0; PAGE_SIZE as usize])).collect();
//! let kernel_end = PhysicalAddress::new(ram.as_ptr() as u64);
//! let phys_top = kernel_end + 8 * PAGE_SIZE;
//!
//! let pool = unsafe { PageAllocator::new(OffsetMapper::identity(), kernel_end, phys_top) }?;
//! let page = pool.allocate()?;
//! assert_eq!(pool.ref_count(page.base()), 1);
//! assert_eq!(pool.release(page.base()), 0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod allocator;
mod free_list;
mod layout;
mod phys_mapper;
mod refcount;

pub use allocator::{ALLOCATED_FILL, OutOfPages, PageAllocator, RELEASED_FILL};
pub use layout::{LayoutError, PageIndex, PageRangeError, PoolLayout};
pub use phys_mapper::{OffsetMapper, PhysMapper};
