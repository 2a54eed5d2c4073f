//! A thread-caching, segment-based memory allocator.
//!
//! Memory comes from the OS in 4 MiB aligned *segments*, claimed from large
//! *regions* through an atomic bitmap. A segment is cut into *pages* of one
//! kind (64 KiB small, 512 KiB medium, one 4 MiB large page, or a single
//! oversized huge page), and every page serves blocks of one size class.
//!
//! Each thread allocates from its own [`Heap`] without locks. Frees by the
//! owning thread go to a page-local list; frees by other threads are pushed
//! onto an atomic per-page list the owner collects later. A heap whose
//! thread exits abandons its non-empty segments, and other threads reclaim
//! them.
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: segmalloc::Allocator = segmalloc::Allocator;
//! ```

#![allow(clippy::missing_safety_doc)]

mod alloc;
mod bitmap;
mod context;
mod error;
mod heap;
mod options;
mod os;
mod page;
mod page_queue;
mod random;
mod region;
mod segment;
mod stats;

pub use alloc::{
  Allocator, allocate, allocate_aligned, allocate_zeroed, allocated_bytes, compact_current_thread,
  compact_main_thread, deallocate, free, usable_size,
};
pub use bitmap::{Bitmap, BitmapIndex};
pub use context::{AllocatorContext, CommittedHook, DeferredFree};
pub use error::{AllocError, ErrorHandler};
pub use heap::{Collect, Heap};
pub use options::Options;
pub use page::PageCounts;
pub use stats::{StatCount, StatCounter, Stats};

// =============================================================================
// Constants
// =============================================================================

pub(crate) const WORD_SIZE: usize = size_of::<usize>();
pub(crate) const WORD_BITS: usize = usize::BITS as usize;

/// Alignment every block gets without asking.
pub(crate) const MAX_ALIGN_SIZE: usize = 16;

pub(crate) const SEGMENT_SHIFT: usize = 22;
/// 4 MiB.
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub(crate) const SEGMENT_MASK: usize = SEGMENT_SIZE - 1;

pub(crate) const SMALL_PAGE_SHIFT: usize = 16;
pub(crate) const MEDIUM_PAGE_SHIFT: usize = 3 + SMALL_PAGE_SHIFT;
pub(crate) const LARGE_PAGE_SHIFT: usize = SEGMENT_SHIFT;

const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;
const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

/// Largest block on a small page (16 KiB).
pub const SMALL_OBJ_SIZE_MAX: usize = SMALL_PAGE_SIZE / 4;
/// Largest block on a medium page (128 KiB).
pub const MEDIUM_OBJ_SIZE_MAX: usize = MEDIUM_PAGE_SIZE / 4;
/// Largest block on a large page (2 MiB); bigger requests get a huge page.
pub const LARGE_OBJ_SIZE_MAX: usize = LARGE_PAGE_SIZE / 2;
pub(crate) const LARGE_OBJ_WSIZE_MAX: usize = LARGE_OBJ_SIZE_MAX / WORD_SIZE;

/// Sizes served straight from the direct page table.
pub(crate) const SMALL_WSIZE_MAX: usize = 128;
pub(crate) const SMALL_SIZE_MAX: usize = SMALL_WSIZE_MAX * WORD_SIZE;

/// Largest alignment [`allocate_aligned`] accepts.
pub const ALIGNMENT_MAX: usize = SEGMENT_SIZE / 2;

/// Huge segments are sized in multiples of this.
pub(crate) const PAGE_HUGE_ALIGN: usize = 256 * 1024;

/// Bytes of blocks linked per free-list extension.
pub(crate) const MAX_EXTEND_SIZE: usize = 4 * 1024;
/// Blocks linked per extension at least.
pub(crate) const MIN_EXTEND: usize = if SECURE { 8 } else { 1 };

/// Free-list encoding, randomized extension, guard pages and release-mode
/// double-free checks.
pub(crate) const SECURE: bool = cfg!(feature = "secure");

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE / SMALL_PAGE_SIZE <= u8::MAX as usize);
const _: () = assert!(MEDIUM_OBJ_SIZE_MAX > SMALL_OBJ_SIZE_MAX);
const _: () = assert!(LARGE_OBJ_SIZE_MAX > MEDIUM_OBJ_SIZE_MAX);
const _: () = assert!(SMALL_SIZE_MAX <= SMALL_OBJ_SIZE_MAX);
const _: () = assert!(SMALL_PAGE_SIZE / WORD_SIZE < 1 << 16);
const _: () = assert!(MAX_ALIGN_SIZE >= WORD_SIZE && MAX_ALIGN_SIZE.is_power_of_two());
const _: () = assert!(PAGE_HUGE_ALIGN < SEGMENT_SIZE);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of `align`, a power of two.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Words needed to hold `size` bytes.
#[inline(always)]
pub(crate) const fn wsize_from_size(size: usize) -> usize {
  size.div_ceil(WORD_SIZE)
}
