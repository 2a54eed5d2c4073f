//! Memory layer between segments and the OS.
//!
//! Segment-sized requests are carved out of 256 MiB regions (64 blocks of
//! 4 MiB on 64-bit targets), each tracked by one bitmap word. Regions are
//! installed lazily into a fixed table and only handed back to the OS by an
//! explicit [`RegionTable::collect`]. Requests that are too large or too
//! aligned for a region go straight to the OS, and a reserved arena of
//! 1 GiB OS pages is tried first when large pages are allowed.

use core::ptr::{self, NonNull, null_mut};
use core::slice;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::bitmap::{Bitmap, BitmapIndex};
use crate::context::AllocatorContext;
use crate::error::AllocError;
use crate::os::{self, GIB, HUGE_OS_PAGE_SIZE, OsMemory};
use crate::{SEGMENT_SIZE, WORD_BITS, align_up};

// =============================================================================
// Constants
// =============================================================================

/// One bitmap word of segment-sized blocks.
pub(crate) const REGION_SIZE: usize = SEGMENT_SIZE * WORD_BITS;

#[cfg(target_pointer_width = "64")]
const HEAP_REGION_MAX_SIZE: usize = 256 * GIB;
#[cfg(not(target_pointer_width = "64"))]
const HEAP_REGION_MAX_SIZE: usize = 3 * GIB;

pub(crate) const REGION_MAX: usize = HEAP_REGION_MAX_SIZE / REGION_SIZE;

/// Largest request served from a region; anything bigger goes to the OS.
pub(crate) const REGION_MAX_ALLOC_SIZE: usize = (WORD_BITS / 4) * SEGMENT_SIZE;

#[cfg(target_pointer_width = "64")]
const HUGE_ARENA_MAX_PAGES: usize = 64;
#[cfg(not(target_pointer_width = "64"))]
const HUGE_ARENA_MAX_PAGES: usize = 1;

const BLOCKS_PER_HUGE_PAGE: usize = HUGE_OS_PAGE_SIZE / SEGMENT_SIZE;
const HUGE_ARENA_FIELDS: usize = HUGE_ARENA_MAX_PAGES * BLOCKS_PER_HUGE_PAGE / WORD_BITS;

/// Huge OS pages are placed from here upwards.
#[cfg(target_pointer_width = "64")]
const HUGE_ARENA_BASE: usize = 32 << 40;

const INFO_LARGE: usize = 0b001;
const INFO_COMMITTED: usize = 0b010;
/// Slot claimed by an installer or a collector; not usable yet.
const INFO_PENDING: usize = 0b100;
const INFO_FLAGS: usize = INFO_LARGE | INFO_COMMITTED | INFO_PENDING;

const _: () = assert!(REGION_MAX_ALLOC_SIZE <= REGION_SIZE);
const _: () = assert!(BLOCKS_PER_HUGE_PAGE % WORD_BITS == 0);
const _: () = assert!(SEGMENT_SIZE > INFO_FLAGS);

// =============================================================================
// Types
// =============================================================================

/// Where a segment's memory came from, so it can be returned there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemId {
  /// Mapped directly from the OS.
  Os,
  /// Blocks `bit..` of region `region`.
  Region { region: usize, bit: usize },
  /// Blocks of the huge OS page arena.
  HugeArena(BitmapIndex),
}

/// Result of a memory layer allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemBlock {
  pub(crate) ptr: NonNull<u8>,
  pub(crate) is_zero: bool,
  pub(crate) is_committed: bool,
  pub(crate) is_large: bool,
  pub(crate) id: MemId,
}

/// Per-thread search hints.
#[derive(Debug, Default)]
pub(crate) struct MemTld {
  region_hint: usize,
  arena_hint: usize,
}

impl MemTld {
  pub(crate) const fn new() -> Self {
    Self {
      region_hint: 0,
      arena_hint: 0,
    }
  }
}

/// Region start address with its flags packed into the low bits.
#[derive(Clone, Copy, PartialEq, Eq)]
struct RegionInfo(*mut u8);

impl RegionInfo {
  fn new(start: *mut u8, is_large: bool, is_committed: bool) -> Self {
    let mut flags = 0;
    if is_large {
      flags |= INFO_LARGE;
    }
    if is_committed {
      flags |= INFO_COMMITTED;
    }
    Self(start.map_addr(|a| a | flags))
  }

  fn pending() -> *mut u8 {
    ptr::without_provenance_mut(INFO_PENDING)
  }

  /// `None` for empty and pending slots.
  fn load(slot: &AtomicPtr<u8>) -> Option<Self> {
    let raw = slot.load(Ordering::Acquire);
    if raw.is_null() || raw.addr() & INFO_PENDING != 0 {
      None
    } else {
      Some(Self(raw))
    }
  }

  fn start(self) -> *mut u8 {
    self.0.map_addr(|a| a & !INFO_FLAGS)
  }

  fn is_large(self) -> bool {
    self.0.addr() & INFO_LARGE != 0
  }

  fn is_committed(self) -> bool {
    self.0.addr() & INFO_COMMITTED != 0
  }
}

struct Region {
  info: AtomicPtr<u8>,
  /// NUMA node plus one; 0 means unknown.
  numa_node: AtomicUsize,
  in_use: AtomicUsize,
  /// Blocks ever handed out since the region was reserved.
  dirty: AtomicUsize,
  /// Blocks known to be committed.
  commit: AtomicUsize,
  /// Blocks reset when they were last freed.
  reset: AtomicUsize,
}

impl Region {
  const fn new() -> Self {
    Self {
      info: AtomicPtr::new(null_mut()),
      numa_node: AtomicUsize::new(0),
      in_use: AtomicUsize::new(0),
      dirty: AtomicUsize::new(0),
      commit: AtomicUsize::new(0),
      reset: AtomicUsize::new(0),
    }
  }

  fn in_use(&self) -> Bitmap<'_> {
    Bitmap::new(slice::from_ref(&self.in_use))
  }

  fn dirty(&self) -> Bitmap<'_> {
    Bitmap::new(slice::from_ref(&self.dirty))
  }

  fn commit(&self) -> Bitmap<'_> {
    Bitmap::new(slice::from_ref(&self.commit))
  }

  fn reset(&self) -> Bitmap<'_> {
    Bitmap::new(slice::from_ref(&self.reset))
  }
}

// =============================================================================
// Region table
// =============================================================================

pub(crate) struct RegionTable {
  regions: [Region; REGION_MAX],
  /// High-water mark of installed slots.
  count: AtomicUsize,
}

impl RegionTable {
  pub(crate) const fn new() -> Self {
    Self {
      regions: [const { Region::new() }; REGION_MAX],
      count: AtomicUsize::new(0),
    }
  }

  /// Blocks currently claimed across all regions.
  pub(crate) fn blocks_in_use(&self) -> usize {
    let count = self.count.load(Ordering::Acquire);
    self.regions[..count]
      .iter()
      .filter(|r| RegionInfo::load(&r.info).is_some())
      .map(|r| r.in_use.load(Ordering::Relaxed).count_ones() as usize)
      .sum()
  }

  fn try_alloc(
    &self,
    ctx: &AllocatorContext,
    blocks: usize,
    commit: bool,
    allow_large: bool,
    tld: &mut MemTld,
  ) -> Option<MemBlock> {
    let numa = ctx.options().use_numa.then(|| ctx.os.numa_node());
    let claimed = self
      .try_claim_existing(blocks, allow_large, numa, tld.region_hint)
      .or_else(|| {
        numa.and_then(|_| self.try_claim_existing(blocks, allow_large, None, tld.region_hint))
      })
      .or_else(|| self.try_install(ctx, blocks, commit, allow_large, numa));
    let (idx, bit) = claimed?;
    tld.region_hint = idx;
    self.finish_claim(ctx, idx, bit, blocks, commit)
  }

  fn try_claim_existing(
    &self,
    blocks: usize,
    allow_large: bool,
    numa: Option<usize>,
    hint: usize,
  ) -> Option<(usize, usize)> {
    let count = self.count.load(Ordering::Acquire);
    for visited in 0..count {
      let idx = (hint + visited) % count;
      let region = &self.regions[idx];
      let Some(info) = RegionInfo::load(&region.info) else {
        continue;
      };
      if info.is_large() && !allow_large {
        continue;
      }
      if let Some(node) = numa {
        let region_node = region.numa_node.load(Ordering::Relaxed);
        if region_node != 0 && region_node != node + 1 {
          continue;
        }
      }
      let Some(bit) = region.in_use().try_claim(0, blocks) else {
        continue;
      };
      // A collector may have swapped the region out under us.
      if region.info.load(Ordering::Acquire) != info.0 {
        region.in_use().release(0, bit, blocks);
        continue;
      }
      return Some((idx, bit));
    }
    None
  }

  /// Reserves a fresh region and publishes it in the first empty slot. A
  /// lost race for a slot moves on to the next one with the same memory.
  fn try_install(
    &self,
    ctx: &AllocatorContext,
    blocks: usize,
    commit: bool,
    allow_large: bool,
    numa: Option<usize>,
  ) -> Option<(usize, usize)> {
    let region_commit = commit && ctx.options().eager_region_commit;
    let region_large = allow_large && region_commit && ctx.options().large_os_pages;
    let (start, is_large) = os::alloc_aligned(ctx, REGION_SIZE, SEGMENT_SIZE, region_commit, region_large)?;
    let is_committed = region_commit || is_large;

    for (idx, region) in self.regions.iter().enumerate() {
      if !region.info.load(Ordering::Relaxed).is_null() {
        continue;
      }
      if region
        .info
        .compare_exchange(null_mut(), RegionInfo::pending(), Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
      {
        continue;
      }
      region
        .numa_node
        .store(numa.map_or(0, |n| n + 1), Ordering::Relaxed);
      region.dirty.store(0, Ordering::Relaxed);
      region
        .commit
        .store(if is_committed { usize::MAX } else { 0 }, Ordering::Relaxed);
      region.reset.store(0, Ordering::Relaxed);
      let bit = region.in_use().try_claim(0, blocks);
      region.info.store(
        RegionInfo::new(start.as_ptr(), is_large, is_committed).0,
        Ordering::Release,
      );
      self.count.fetch_max(idx + 1, Ordering::AcqRel);
      log::debug!("installed region {idx} at {:p}", start.as_ptr());
      return bit.map(|bit| (idx, bit));
    }

    log::warn!("region table is full; serving from the OS directly");
    unsafe { os::free(ctx, start.as_ptr(), REGION_SIZE, is_committed) };
    None
  }

  fn finish_claim(
    &self,
    ctx: &AllocatorContext,
    idx: usize,
    bit: usize,
    blocks: usize,
    commit: bool,
  ) -> Option<MemBlock> {
    let region = &self.regions[idx];
    let info = RegionInfo(region.info.load(Ordering::Acquire));
    let p = info.start().wrapping_add(bit * SEGMENT_SIZE);
    let size = blocks * SEGMENT_SIZE;
    let at = BitmapIndex::new(0, bit);

    let (is_zero, _) = region.dirty().claim(at, blocks);
    let is_committed = if commit {
      let (_, any_uncommitted) = region.commit().claim(at, blocks);
      if any_uncommitted && unsafe { os::commit(ctx, p, size) }.is_none() {
        region.commit().release(0, bit, blocks);
        region.in_use().release(0, bit, blocks);
        return None;
      }
      true
    } else {
      region.commit().is_claimed(at, blocks)
    };
    if region.reset().is_any_claimed(at, blocks) {
      region.reset().release(0, bit, blocks);
      unsafe { os::unreset(ctx, p, size) };
    }

    Some(MemBlock {
      ptr: NonNull::new(p)?,
      is_zero,
      is_committed,
      is_large: info.is_large(),
      id: MemId::Region { region: idx, bit },
    })
  }

  unsafe fn free(&self, ctx: &AllocatorContext, idx: usize, bit: usize, p: *mut u8, size: usize, was_committed: bool) {
    let region = &self.regions[idx];
    let blocks = size.div_ceil(SEGMENT_SIZE);
    let info = RegionInfo(region.info.load(Ordering::Acquire));
    debug_assert!(
      info.start().wrapping_add(bit * SEGMENT_SIZE) == p,
      "pointer {p:p} does not match region {idx} block {bit}"
    );
    let at = BitmapIndex::new(0, bit);
    if !info.is_large() && ctx.options().segment_reset {
      if ctx.options().reset_decommits {
        unsafe { os::decommit(ctx, p, size) };
        region.commit().release(0, bit, blocks);
      } else {
        unsafe { os::reset(ctx, p, size) };
        region.reset().claim(at, blocks);
      }
    }
    if !was_committed && !info.is_large() {
      // Parts were decommitted while in use; the next claim commits again.
      region.commit().release(0, bit, blocks);
    }
    let was_claimed = region.in_use().release(0, bit, blocks);
    debug_assert!(was_claimed, "region {idx} blocks {bit}+{blocks} were not claimed");
  }

  /// Returns every fully unclaimed region to the OS. Returns how many were
  /// freed.
  pub(crate) fn collect(&self, ctx: &AllocatorContext) -> usize {
    let count = self.count.load(Ordering::Acquire);
    let mut freed = 0;
    for region in &self.regions[..count] {
      let Some(info) = RegionInfo::load(&region.info) else {
        continue;
      };
      if region.in_use.load(Ordering::Relaxed) != 0
        || region
          .in_use
          .compare_exchange(0, usize::MAX, Ordering::AcqRel, Ordering::Relaxed)
          .is_err()
      {
        continue;
      }
      // Claimers that raced the lock see the changed info and back off.
      if region
        .info
        .compare_exchange(info.0, RegionInfo::pending(), Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
      {
        region.in_use.store(0, Ordering::Release);
        continue;
      }
      unsafe { os::free(ctx, info.start(), REGION_SIZE, info.is_committed()) };
      region.numa_node.store(0, Ordering::Relaxed);
      region.dirty.store(0, Ordering::Relaxed);
      region.commit.store(0, Ordering::Relaxed);
      region.reset.store(0, Ordering::Relaxed);
      region.in_use.store(0, Ordering::Release);
      region.info.store(null_mut(), Ordering::Release);
      freed += 1;
    }
    if freed > 0 {
      log::debug!("returned {freed} idle regions to the OS");
    }
    freed
  }
}

// =============================================================================
// Huge OS page arena
// =============================================================================

pub(crate) struct HugeArena {
  start: AtomicPtr<u8>,
  size: AtomicUsize,
  reserving: AtomicBool,
  in_use: [AtomicUsize; HUGE_ARENA_FIELDS],
}

impl HugeArena {
  pub(crate) const fn new() -> Self {
    Self {
      start: AtomicPtr::new(null_mut()),
      size: AtomicUsize::new(0),
      reserving: AtomicBool::new(false),
      in_use: [const { AtomicUsize::new(0) }; HUGE_ARENA_FIELDS],
    }
  }

  pub(crate) fn contains(&self, p: *const u8) -> bool {
    let start = self.start.load(Ordering::Acquire);
    !start.is_null() && p.addr() >= start.addr() && p.addr() < start.addr() + self.size.load(Ordering::Relaxed)
  }

  /// Number of 1 GiB pages reserved.
  pub(crate) fn pages(&self) -> usize {
    if self.start.load(Ordering::Acquire).is_null() {
      0
    } else {
      self.size.load(Ordering::Relaxed) / HUGE_OS_PAGE_SIZE
    }
  }

  fn bitmap(&self) -> Bitmap<'_> {
    let fields = self.pages() * BLOCKS_PER_HUGE_PAGE / WORD_BITS;
    Bitmap::new(&self.in_use[..fields])
  }

  fn alloc(&self, size: usize, hint: &mut usize) -> Option<MemBlock> {
    let start = self.start.load(Ordering::Acquire);
    if start.is_null() {
      return None;
    }
    let bitmap = self.bitmap();
    if bitmap.fields() == 0 {
      return None;
    }
    let blocks = size.div_ceil(SEGMENT_SIZE);
    let idx = bitmap.try_claim_across(*hint % bitmap.fields(), blocks)?;
    *hint = idx.field();
    Some(MemBlock {
      ptr: NonNull::new(start.wrapping_add(idx.value() * SEGMENT_SIZE))?,
      is_zero: false,
      is_committed: true,
      is_large: true,
      id: MemId::HugeArena(idx),
    })
  }

  fn free(&self, idx: BitmapIndex, size: usize) {
    let all_set = self.bitmap().release_across(idx, size.div_ceil(SEGMENT_SIZE));
    debug_assert!(all_set, "huge arena blocks at {idx:?} were not claimed");
  }

  /// Reserves up to `pages` 1 GiB OS pages, giving up once `timeout` is
  /// spent or projected to be exceeded by half again. Returns the number of
  /// pages reserved; a timeout carries the partial count in the error.
  pub(crate) fn reserve(&self, ctx: &AllocatorContext, pages: usize, timeout: Duration) -> Result<usize, AllocError> {
    if pages == 0 {
      return Ok(0);
    }
    if timeout.is_zero() {
      return Err(AllocError::Timeout {
        reserved: 0,
        requested: pages,
      });
    }
    if self.reserving.swap(true, Ordering::AcqRel) {
      return Err(AllocError::InvalidArgument {
        reason: "huge OS pages were already reserved",
      });
    }
    let requested = pages;
    let pages = pages.min(HUGE_ARENA_MAX_PAGES);
    let Some(base) = huge_arena_base() else {
      self.reserving.store(false, Ordering::Release);
      return Err(AllocError::OutOfMemory {
        size: pages * HUGE_OS_PAGE_SIZE,
      });
    };

    let begin = Instant::now();
    let max_secs = timeout.as_secs_f64();
    let mut reserved = 0;
    let mut timed_out = false;
    for page in 0..pages {
      let addr = base.wrapping_add(page * HUGE_OS_PAGE_SIZE);
      if unsafe { ctx.os.map_huge_page(addr) }.is_none() {
        log::warn!("could not reserve huge OS page {page} at {addr:p}");
        break;
      }
      reserved += 1;
      ctx.stats.reserved.increase(HUGE_OS_PAGE_SIZE);
      ctx.note_committed(HUGE_OS_PAGE_SIZE);

      let elapsed = begin.elapsed().as_secs_f64();
      let estimate = elapsed / reserved as f64 * pages as f64;
      if reserved < pages && (elapsed > max_secs || estimate > 1.5 * max_secs) {
        log::warn!("huge OS page reservation timed out after {reserved} pages");
        timed_out = true;
        break;
      }
    }

    if reserved == 0 {
      self.reserving.store(false, Ordering::Release);
      return if timed_out {
        Err(AllocError::Timeout { reserved, requested })
      } else {
        Err(AllocError::OutOfMemory {
          size: HUGE_OS_PAGE_SIZE,
        })
      };
    }

    let usable = reserved * BLOCKS_PER_HUGE_PAGE;
    for (i, field) in self.in_use.iter().enumerate() {
      let value = if i * WORD_BITS < usable { 0 } else { usize::MAX };
      field.store(value, Ordering::Relaxed);
    }
    self.size.store(reserved * HUGE_OS_PAGE_SIZE, Ordering::Relaxed);
    self.start.store(base, Ordering::Release);
    if ctx.options().verbose {
      log::info!("reserved {reserved} huge OS pages at {base:p}");
    }

    if timed_out {
      Err(AllocError::Timeout { reserved, requested })
    } else {
      Ok(reserved)
    }
  }
}

#[cfg(target_pointer_width = "64")]
fn huge_arena_base() -> Option<*mut u8> {
  let mut base = HUGE_ARENA_BASE;
  if !cfg!(debug_assertions) {
    let r = crate::random::random_init(HUGE_ARENA_BASE);
    base += ((r >> 17) & 0x3FF) * HUGE_OS_PAGE_SIZE;
  }
  Some(ptr::without_provenance_mut(base))
}

#[cfg(not(target_pointer_width = "64"))]
fn huge_arena_base() -> Option<*mut u8> {
  None
}

// =============================================================================
// Memory layer entry points
// =============================================================================

/// Allocates `size` bytes aligned to `alignment` from the huge arena, a
/// region, or the OS, in that order of preference.
pub(crate) fn alloc_aligned(
  ctx: &AllocatorContext,
  size: usize,
  alignment: usize,
  commit: bool,
  allow_large: bool,
  tld: &mut MemTld,
) -> Option<MemBlock> {
  if size == 0 {
    return None;
  }
  let size = align_up(size, ctx.os.page_size());

  if allow_large
    && alignment <= SEGMENT_SIZE
    && let Some(block) = ctx.huge_arena.alloc(size, &mut tld.arena_hint)
  {
    return Some(block);
  }

  if size <= REGION_MAX_ALLOC_SIZE && alignment <= SEGMENT_SIZE {
    let blocks = size.div_ceil(SEGMENT_SIZE);
    if let Some(block) = ctx.regions.try_alloc(ctx, blocks, commit, allow_large, tld) {
      return Some(block);
    }
  }

  let large = allow_large && ctx.options().large_os_pages;
  let (ptr, is_large) = os::alloc_aligned(ctx, size, alignment, commit, large)?;
  Some(MemBlock {
    ptr,
    is_zero: true,
    is_committed: commit || is_large,
    is_large,
    id: MemId::Os,
  })
}

/// Returns memory obtained from [`alloc_aligned`].
pub(crate) unsafe fn free(ctx: &AllocatorContext, p: *mut u8, size: usize, id: MemId, was_committed: bool) {
  if p.is_null() || size == 0 {
    return;
  }
  match id {
    MemId::Os => unsafe { os::free(ctx, p, size, was_committed) },
    MemId::Region { region, bit } => unsafe { ctx.regions.free(ctx, region, bit, p, size, was_committed) },
    MemId::HugeArena(idx) => ctx.huge_arena.free(idx, size),
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::options::Options;

  fn ctx() -> &'static AllocatorContext {
    AllocatorContext::leak(Options::default())
  }

  #[test]
  fn test_region_claims_and_releases() {
    let ctx = ctx();
    let mut tld = MemTld::new();
    let a = alloc_aligned(ctx, SEGMENT_SIZE, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    let b = alloc_aligned(ctx, 2 * SEGMENT_SIZE, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    assert!(matches!(a.id, MemId::Region { .. }));
    assert!(a.is_zero && a.is_committed);
    assert_eq!(a.ptr.as_ptr().addr() % SEGMENT_SIZE, 0);
    assert_eq!(ctx.regions.blocks_in_use(), 3);
    unsafe {
      a.ptr.as_ptr().write_bytes(1, SEGMENT_SIZE);
      free(ctx, a.ptr.as_ptr(), SEGMENT_SIZE, a.id, a.is_committed);
      free(ctx, b.ptr.as_ptr(), 2 * SEGMENT_SIZE, b.id, b.is_committed);
    }
    assert_eq!(ctx.regions.blocks_in_use(), 0);

    // The first block was handed out before, so it is no longer zero.
    let c = alloc_aligned(ctx, SEGMENT_SIZE, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    assert_eq!(c.ptr, a.ptr);
    assert!(!c.is_zero);
    unsafe { free(ctx, c.ptr.as_ptr(), SEGMENT_SIZE, c.id, true) };
  }

  #[test]
  fn test_oversized_goes_to_os() {
    let ctx = ctx();
    let mut tld = MemTld::new();
    let size = REGION_MAX_ALLOC_SIZE + SEGMENT_SIZE;
    let block = alloc_aligned(ctx, size, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    assert_eq!(block.id, MemId::Os);
    assert_eq!(block.ptr.as_ptr().addr() % SEGMENT_SIZE, 0);
    unsafe { free(ctx, block.ptr.as_ptr(), size, block.id, true) };
  }

  #[test]
  fn test_overaligned_goes_to_os() {
    let ctx = ctx();
    let mut tld = MemTld::new();
    let align = 4 * SEGMENT_SIZE;
    let block = alloc_aligned(ctx, SEGMENT_SIZE, align, true, false, &mut tld).unwrap();
    assert_eq!(block.id, MemId::Os);
    assert_eq!(block.ptr.as_ptr().addr() % align, 0);
    unsafe { free(ctx, block.ptr.as_ptr(), SEGMENT_SIZE, block.id, true) };
  }

  #[test]
  fn test_collect_frees_idle_regions() {
    let ctx = ctx();
    let mut tld = MemTld::new();
    let block = alloc_aligned(ctx, SEGMENT_SIZE, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    assert_eq!(ctx.regions.collect(ctx), 0);
    unsafe { free(ctx, block.ptr.as_ptr(), SEGMENT_SIZE, block.id, true) };
    assert_eq!(ctx.regions.collect(ctx), 1);
    assert_eq!(ctx.regions.blocks_in_use(), 0);
    // The table still works after a collection.
    let again = alloc_aligned(ctx, SEGMENT_SIZE, SEGMENT_SIZE, true, false, &mut tld).unwrap();
    assert!(again.is_zero);
    unsafe { free(ctx, again.ptr.as_ptr(), SEGMENT_SIZE, again.id, true) };
  }

  #[test]
  fn test_region_info_packing() {
    let p: *mut u8 = ptr::without_provenance_mut(SEGMENT_SIZE * 3);
    let info = RegionInfo::new(p, true, false);
    assert_eq!(info.start(), p);
    assert!(info.is_large());
    assert!(!info.is_committed());
  }

  #[test]
  fn test_huge_reserve_zero_timeout() {
    let ctx = ctx();
    assert_eq!(
      ctx.huge_arena.reserve(ctx, 2, Duration::ZERO),
      Err(AllocError::Timeout {
        reserved: 0,
        requested: 2
      })
    );
    assert_eq!(ctx.huge_arena.reserve(ctx, 0, Duration::from_secs(1)), Ok(0));
  }
}
