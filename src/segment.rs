//! Segments: [`SEGMENT_SIZE`] aligned chunks holding a header followed by an
//! array of equally sized pages. The segment of any block is found by
//! masking the block address.

use core::mem::size_of;
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::context::AllocatorContext;
use crate::error::AllocError;
use crate::heap::{self, Heap};
use crate::os::{self, OsMemory};
use crate::page::{self, Block, Page};
use crate::random::ptr_cookie;
use crate::region::{self, MemId, MemTld};
use crate::{
  LARGE_OBJ_SIZE_MAX, LARGE_PAGE_SHIFT, MAX_ALIGN_SIZE, MEDIUM_OBJ_SIZE_MAX, MEDIUM_PAGE_SHIFT, PAGE_HUGE_ALIGN,
  SECURE, SEGMENT_MASK, SEGMENT_SHIFT, SEGMENT_SIZE, SMALL_OBJ_SIZE_MAX, SMALL_PAGE_SHIFT, align_up,
};

/// Cached segments allowed per eight segments of peak usage.
const CACHE_FRACTION: usize = 8;

/// Owner of a huge segment whose block was freed. Never a thread id.
const HUGE_FREED: usize = usize::MAX - 1;

// =============================================================================
// Types
// =============================================================================

/// How a segment is divided into pages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PageKind {
  /// 64 KiB pages for blocks up to [`SMALL_OBJ_SIZE_MAX`].
  Small,
  /// 512 KiB pages for blocks up to [`MEDIUM_OBJ_SIZE_MAX`].
  Medium,
  /// One page per segment for blocks up to [`LARGE_OBJ_SIZE_MAX`].
  Large,
  /// One page in an oversized segment, holding a single block.
  Huge,
}

impl PageKind {
  pub(crate) const fn for_block_size(block_size: usize) -> Self {
    if block_size <= SMALL_OBJ_SIZE_MAX {
      Self::Small
    } else if block_size <= MEDIUM_OBJ_SIZE_MAX {
      Self::Medium
    } else if block_size <= LARGE_OBJ_SIZE_MAX {
      Self::Large
    } else {
      Self::Huge
    }
  }

  const fn page_shift(self) -> usize {
    match self {
      Self::Small => SMALL_PAGE_SHIFT,
      Self::Medium => MEDIUM_PAGE_SHIFT,
      Self::Large => LARGE_PAGE_SHIFT,
      Self::Huge => SEGMENT_SHIFT,
    }
  }
}

/// Segment header. The page descriptors follow it in memory.
#[repr(C)]
pub(crate) struct Segment {
  // Describes the underlying memory; survives reuse from the cache.
  pub(crate) memid: MemId,
  pub(crate) mem_is_fixed: bool,
  pub(crate) mem_is_committed: bool,
  /// The page area was reset when the segment entered the cache.
  pub(crate) mem_is_reset: bool,
  pub(crate) ctx: *const AllocatorContext,

  pub(crate) abandoned_next: AtomicPtr<Segment>,
  pub(crate) next: *mut Segment,
  pub(crate) prev: *mut Segment,
  /// Pages in use whose heap is gone.
  pub(crate) abandoned: usize,
  /// Pages in use.
  pub(crate) used: usize,
  pub(crate) capacity: usize,
  pub(crate) segment_size: usize,
  /// Header size including the guard page, if any.
  pub(crate) segment_info_size: usize,
  pub(crate) cookie: usize,
  pub(crate) page_shift: usize,
  /// Owning thread, or 0 when abandoned (always 0 for huge segments).
  pub(crate) thread_id: AtomicUsize,
  pub(crate) page_kind: PageKind,
  pages: [Page; 0],
}

#[derive(Clone, Copy)]
struct SegmentQueue {
  first: *mut Segment,
  last: *mut Segment,
}

impl SegmentQueue {
  const fn new() -> Self {
    Self {
      first: null_mut(),
      last: null_mut(),
    }
  }
}

/// Per-heap segment bookkeeping.
pub(crate) struct SegmentsTld {
  small_free: SegmentQueue,
  medium_free: SegmentQueue,
  count: usize,
  peak_count: usize,
  current_size: usize,
  peak_size: usize,
  cache: *mut Segment,
  cache_count: usize,
  cache_size: usize,
  pub(crate) mem: MemTld,
}

impl SegmentsTld {
  pub(crate) const fn new() -> Self {
    Self {
      small_free: SegmentQueue::new(),
      medium_free: SegmentQueue::new(),
      count: 0,
      peak_count: 0,
      current_size: 0,
      peak_size: 0,
      cache: null_mut(),
      cache_count: 0,
      cache_size: 0,
      mem: MemTld::new(),
    }
  }

  fn free_queue(&mut self, kind: PageKind) -> Option<&mut SegmentQueue> {
    match kind {
      PageKind::Small => Some(&mut self.small_free),
      PageKind::Medium => Some(&mut self.medium_free),
      PageKind::Large | PageKind::Huge => None,
    }
  }

  fn track_grow(&mut self, size: usize) {
    self.count += 1;
    self.peak_count = self.peak_count.max(self.count);
    self.current_size += size;
    self.peak_size = self.peak_size.max(self.current_size);
  }

  fn track_shrink(&mut self, size: usize) {
    self.count -= 1;
    self.current_size -= size;
  }

  /// Live segments owned through this tld, including cached ones.
  pub(crate) fn count(&self) -> usize {
    self.count
  }

  pub(crate) fn cache_count(&self) -> usize {
    self.cache_count
  }
}

// =============================================================================
// Addressing
// =============================================================================

#[inline]
pub(crate) fn ptr_segment<T>(p: *const T) -> *mut Segment {
  p.cast_mut().cast::<Segment>().map_addr(|addr| addr & !SEGMENT_MASK)
}

#[inline]
pub(crate) unsafe fn pages(segment: *mut Segment) -> *mut Page {
  unsafe { (&raw mut (*segment).pages).cast::<Page>() }
}

/// Page descriptor covering `p`.
#[inline]
pub(crate) unsafe fn page_of<T>(segment: *mut Segment, p: *const T) -> *mut Page {
  unsafe {
    let diff = p.addr() - segment.addr();
    let idx = diff >> (*segment).page_shift;
    debug_assert!(idx < (*segment).capacity);
    pages(segment).add(idx)
  }
}

/// Usable area of a page. The first page starts after the header, rounded
/// so its blocks are aligned to their size; in `secure` builds the last page
/// gives up its final OS page as a guard.
pub(crate) unsafe fn page_start(segment: *mut Segment, page: *const Page, block_size: usize) -> (*mut u8, usize) {
  unsafe {
    let idx = (*page).segment_idx as usize;
    let mut psize = if (*segment).page_kind == PageKind::Huge {
      (*segment).segment_size
    } else {
      1 << (*segment).page_shift
    };
    let mut start = segment.cast::<u8>().add(idx * psize);
    if idx == 0 {
      let info = (*segment).segment_info_size;
      start = start.add(info);
      psize -= info;
      if block_size > 0 && (*segment).page_kind <= PageKind::Medium {
        let adjust = block_size - (start.addr() % block_size);
        if adjust < block_size {
          start = start.add(adjust);
          psize -= adjust;
        }
      }
    }
    if SECURE && idx == (*segment).capacity - 1 {
      psize -= (*(*segment).ctx).os.page_size();
    }
    (start, psize)
  }
}

/// Returns `(segment_size, pre_size, info_size)` for `capacity` pages. A
/// non-zero `required` asks for a huge segment fitting that many bytes;
/// `None` if no such segment is addressable.
fn segment_size(ctx: &AllocatorContext, capacity: usize, required: usize) -> Option<(usize, usize, usize)> {
  let minsize = size_of::<Segment>() + capacity * size_of::<Page>() + 16;
  let (info_size, guard_size) = if SECURE {
    let page_size = ctx.os.page_size();
    (align_up(minsize, page_size), page_size)
  } else {
    (align_up(minsize, 16 * MAX_ALIGN_SIZE), 0)
  };
  let pre_size = info_size + guard_size;
  if required == 0 {
    return Some((SEGMENT_SIZE, pre_size, info_size));
  }
  let size = required
    .checked_add(info_size + 2 * guard_size)?
    .checked_next_multiple_of(if SECURE { ctx.os.page_size() } else { 1 })?
    .checked_next_multiple_of(PAGE_HUGE_ALIGN)?;
  if size > isize::MAX as usize {
    return None;
  }
  Some((size, pre_size, info_size))
}

// =============================================================================
// Free queues
// =============================================================================

unsafe fn queue_contains(queue: &SegmentQueue, segment: *mut Segment) -> bool {
  unsafe { !(*segment).next.is_null() || !(*segment).prev.is_null() || queue.first == segment }
}

unsafe fn queue_enqueue(queue: &mut SegmentQueue, segment: *mut Segment) {
  unsafe {
    (*segment).next = null_mut();
    (*segment).prev = queue.last;
    if queue.last.is_null() {
      queue.first = segment;
    } else {
      (*queue.last).next = segment;
    }
    queue.last = segment;
  }
}

unsafe fn queue_remove(queue: &mut SegmentQueue, segment: *mut Segment) {
  unsafe {
    if !(*segment).prev.is_null() {
      (*(*segment).prev).next = (*segment).next;
    }
    if !(*segment).next.is_null() {
      (*(*segment).next).prev = (*segment).prev;
    }
    if segment == queue.first {
      queue.first = (*segment).next;
    }
    if segment == queue.last {
      queue.last = (*segment).prev;
    }
    (*segment).next = null_mut();
    (*segment).prev = null_mut();
  }
}

unsafe fn remove_from_free_queue(tld: &mut SegmentsTld, segment: *mut Segment) {
  unsafe {
    if let Some(queue) = tld.free_queue((*segment).page_kind)
      && queue_contains(queue, segment)
    {
      queue_remove(queue, segment);
    }
  }
}

unsafe fn insert_in_free_queue(tld: &mut SegmentsTld, segment: *mut Segment) {
  unsafe {
    if let Some(queue) = tld.free_queue((*segment).page_kind) {
      queue_enqueue(queue, segment);
    }
  }
}

// =============================================================================
// Cache
// =============================================================================

unsafe fn cache_pop(ctx: &AllocatorContext, segment_size: usize, tld: &mut SegmentsTld) -> *mut Segment {
  if segment_size != 0 && segment_size != SEGMENT_SIZE {
    return null_mut();
  }
  let segment = tld.cache;
  if segment.is_null() {
    return null_mut();
  }
  unsafe {
    tld.cache = (*segment).next;
    (*segment).next = null_mut();
    tld.cache_count -= 1;
    tld.cache_size -= (*segment).segment_size;
  }
  ctx.stats.segments_cache.decrease(1);
  segment
}

unsafe fn cache_full(ctx: &AllocatorContext, tld: &mut SegmentsTld) -> bool {
  let max = ctx.options().segment_cache;
  if tld.cache_count < max && tld.cache_count < 1 + tld.peak_count / CACHE_FRACTION {
    return false;
  }
  while tld.cache_count > max {
    let segment = unsafe { cache_pop(ctx, 0, tld) };
    if segment.is_null() {
      break;
    }
    unsafe { os_free(ctx, segment, Some(tld)) };
  }
  true
}

/// Keeps an empty, fully committed segment for reuse by this heap.
unsafe fn cache_push(ctx: &AllocatorContext, segment: *mut Segment, tld: &mut SegmentsTld) -> bool {
  unsafe {
    if (*segment).segment_size != SEGMENT_SIZE || !(*segment).mem_is_committed || cache_full(ctx, tld) {
      return false;
    }
    let reset_all = ctx.options().segment_reset && !(*segment).mem_is_fixed;
    let mut any_reset = false;
    for i in 0..(*segment).capacity {
      let page = pages(segment).add(i);
      if reset_all && !(*page).is_reset {
        let (start, psize) = page_start(segment, page, 0);
        os::reset(ctx, start, psize);
        (*page).is_reset = true;
      }
      any_reset |= (*page).is_reset;
    }
    (*segment).mem_is_reset = any_reset;
    (*segment).next = tld.cache;
    tld.cache = segment;
    tld.cache_count += 1;
    tld.cache_size += SEGMENT_SIZE;
  }
  ctx.stats.segments_cache.increase(1);
  true
}

/// Returns every cached segment to the memory layer.
pub(crate) unsafe fn cache_collect(ctx: &AllocatorContext, tld: &mut SegmentsTld) {
  loop {
    let segment = unsafe { cache_pop(ctx, 0, tld) };
    if segment.is_null() {
      break;
    }
    unsafe { os_free(ctx, segment, Some(tld)) };
  }
}

// =============================================================================
// Allocation and release
// =============================================================================

unsafe fn set_guards(ctx: &AllocatorContext, segment: *mut Segment, protect: bool) {
  unsafe {
    let page_size = ctx.os.page_size();
    let base = segment.cast::<u8>();
    let info_size = (*segment).segment_info_size - page_size;
    os::protect(ctx, base.add(info_size), page_size, protect);
    os::protect(ctx, base.add((*segment).segment_size - page_size), page_size, protect);
  }
}

/// Maps fresh memory for a segment and commits at least its header.
unsafe fn map(
  ctx: &AllocatorContext,
  mem: &mut MemTld,
  size: usize,
  info_size: usize,
  commit: bool,
  allow_large: bool,
) -> Option<(*mut Segment, bool)> {
  let block = region::alloc_aligned(ctx, size, SEGMENT_SIZE, commit, allow_large, mem)?;
  let segment = block.ptr.as_ptr().cast::<Segment>();
  let mut is_zero = block.is_zero;
  if !block.is_committed {
    match unsafe { os::commit(ctx, segment.cast(), info_size) } {
      Some(zero) => is_zero |= zero,
      None => {
        unsafe { region::free(ctx, segment.cast(), size, block.id, false) };
        return None;
      }
    }
  }
  unsafe {
    (&raw mut (*segment).memid).write(block.id);
    (&raw mut (*segment).mem_is_fixed).write(block.is_large);
    (&raw mut (*segment).mem_is_committed).write(block.is_committed);
    (&raw mut (*segment).mem_is_reset).write(false);
  }
  ctx.stats.segments.increase(1);
  Some((segment, is_zero))
}

/// Writes the header and page descriptors of a mapped or recycled segment.
#[allow(clippy::too_many_arguments)]
unsafe fn init(
  ctx: &AllocatorContext,
  segment: *mut Segment,
  kind: PageKind,
  capacity: usize,
  segment_size: usize,
  pre_size: usize,
  is_zero: bool,
  thread_id: usize,
) {
  unsafe {
    (&raw mut (*segment).ctx).write(ctx);
    (&raw mut (*segment).abandoned_next).write(AtomicPtr::new(null_mut()));
    (&raw mut (*segment).next).write(null_mut());
    (&raw mut (*segment).prev).write(null_mut());
    (&raw mut (*segment).abandoned).write(0);
    (&raw mut (*segment).used).write(0);
    (&raw mut (*segment).capacity).write(capacity);
    (&raw mut (*segment).segment_size).write(segment_size);
    (&raw mut (*segment).segment_info_size).write(pre_size);
    (&raw mut (*segment).cookie).write(ptr_cookie(segment));
    (&raw mut (*segment).page_shift).write(kind.page_shift());
    (&raw mut (*segment).thread_id).write(AtomicUsize::new(thread_id));
    (&raw mut (*segment).page_kind).write(kind);

    let committed = (*segment).mem_is_committed;
    let pages = pages(segment);
    for i in 0..capacity {
      pages.add(i).write(Page::new(i as u8, committed, is_zero));
    }
    if SECURE {
      set_guards(ctx, segment, true);
    }
  }
  ctx.stats.page_committed.increase(pre_size);
}

/// Restores the pages a cached segment had reset, using the page layout it
/// was cached with. Returns false if the OS refused to commit one.
unsafe fn unreset_pages(ctx: &AllocatorContext, segment: *mut Segment) -> bool {
  unsafe {
    for i in 0..(*segment).capacity {
      let page = pages(segment).add(i);
      if !(*page).is_reset {
        continue;
      }
      let (start, psize) = page_start(segment, page, 0);
      if os::unreset(ctx, start, psize).is_none() {
        return false;
      }
      (*page).is_reset = false;
    }
    true
  }
}

/// Allocates a small, medium or large segment owned by the calling thread.
unsafe fn alloc(ctx: &AllocatorContext, tld: &mut SegmentsTld, kind: PageKind) -> *mut Segment {
  debug_assert!(kind != PageKind::Huge);
  let capacity = SEGMENT_SIZE >> kind.page_shift();
  let Some((size, pre_size, info_size)) = segment_size(ctx, capacity, 0) else {
    return null_mut();
  };
  let options = ctx.options();
  let eager_delay = tld.count < options.eager_commit_delay;
  let commit = (!eager_delay && options.eager_commit) || kind > PageKind::Medium;

  let mut is_zero = false;
  let mut segment = unsafe { cache_pop(ctx, size, tld) };
  if !segment.is_null() {
    unsafe {
      if SECURE {
        set_guards(ctx, segment, false);
      }
      if (*segment).mem_is_reset {
        if unreset_pages(ctx, segment) {
          (*segment).mem_is_reset = false;
        } else {
          os_free(ctx, segment, Some(tld));
          segment = null_mut();
        }
      }
    }
  }
  if segment.is_null() {
    let allow_large = !eager_delay && !SECURE;
    let Some((fresh, zero)) = (unsafe { map(ctx, &mut tld.mem, size, info_size, commit, allow_large) }) else {
      return null_mut();
    };
    segment = fresh;
    is_zero = zero;
    tld.track_grow(size);
  }
  unsafe { init(ctx, segment, kind, capacity, size, pre_size, is_zero, heap::thread_id()) };
  segment
}

/// Hands segment memory back to its region or the OS.
unsafe fn os_free(ctx: &AllocatorContext, segment: *mut Segment, tld: Option<&mut SegmentsTld>) {
  unsafe {
    let size = (*segment).segment_size;
    if let Some(tld) = tld {
      tld.track_shrink(size);
    }
    // A freed huge segment keeps a sentinel owner so a second free of its
    // block fails the claim.
    let owner = if (*segment).page_kind == PageKind::Huge { HUGE_FREED } else { 0 };
    (*segment).thread_id.store(owner, Ordering::Release);
    if SECURE {
      set_guards(ctx, segment, false);
    }
    let memid = (*segment).memid;
    let mut committed = (*segment).mem_is_committed;
    for i in 0..(*segment).capacity {
      let page = pages(segment).add(i);
      if !(*page).is_reset {
        continue;
      }
      if ctx.options().reset_decommits {
        committed = false;
      } else {
        let (start, psize) = page_start(segment, page, 0);
        os::unreset(ctx, start, psize);
      }
    }
    ctx.stats.segments.decrease(1);
    region::free(ctx, segment.cast(), size, memid, committed);
  }
}

unsafe fn free(ctx: &AllocatorContext, segment: *mut Segment, force: bool, tld: &mut SegmentsTld) {
  unsafe {
    debug_assert_eq!((*segment).used, 0);
    remove_from_free_queue(tld, segment);
    ctx.stats.page_committed.decrease((*segment).segment_info_size);
    (*segment).thread_id.store(0, Ordering::Relaxed);
    if !force && cache_push(ctx, segment, tld) {
      return;
    }
    os_free(ctx, segment, Some(tld));
  }
}

// =============================================================================
// Pages
// =============================================================================

/// First unused page of a segment, committed and un-reset. Null if the OS
/// refused to commit it.
unsafe fn find_free(ctx: &AllocatorContext, segment: *mut Segment) -> *mut Page {
  unsafe {
    for i in 0..(*segment).capacity {
      let page = pages(segment).add(i);
      if (*page).segment_in_use {
        continue;
      }
      if !(*page).is_committed || (*page).is_reset {
        let (start, psize) = page_start(segment, page, 0);
        if !(*page).is_committed {
          match os::commit(ctx, start, psize) {
            Some(zero) => (*page).is_zero_init |= zero,
            None => return null_mut(),
          }
          (*page).is_committed = true;
        }
        if (*page).is_reset {
          match os::unreset(ctx, start, psize) {
            Some(zero) => (*page).is_zero_init |= zero,
            None => return null_mut(),
          }
          (*page).is_reset = false;
        }
      }
      return page;
    }
    debug_assert!(false, "segment {segment:p} has no free page");
    null_mut()
  }
}

unsafe fn page_alloc_in(ctx: &AllocatorContext, tld: &mut SegmentsTld, segment: *mut Segment) -> *mut Page {
  unsafe {
    let page = find_free(ctx, segment);
    if page.is_null() {
      return null_mut();
    }
    (*page).segment_in_use = true;
    (*segment).used += 1;
    if (*segment).used == (*segment).capacity {
      remove_from_free_queue(tld, segment);
    }
    ctx.stats.pages.increase(1);
    page
  }
}

/// Takes an unused page able to hold blocks of `block_size` (at most
/// [`LARGE_OBJ_SIZE_MAX`]) from this heap's segments, allocating a new
/// segment if none has room.
pub(crate) unsafe fn page_alloc(ctx: &AllocatorContext, tld: &mut SegmentsTld, block_size: usize) -> *mut Page {
  let kind = PageKind::for_block_size(block_size);
  unsafe {
    match kind {
      PageKind::Small | PageKind::Medium => {
        let empty = tld.free_queue(kind).is_none_or(|queue| queue.first.is_null());
        if empty {
          let segment = alloc(ctx, tld, kind);
          if segment.is_null() {
            return null_mut();
          }
          insert_in_free_queue(tld, segment);
        }
        let Some(segment) = tld.free_queue(kind).map(|queue| queue.first) else {
          return null_mut();
        };
        page_alloc_in(ctx, tld, segment)
      }
      PageKind::Large => {
        let segment = alloc(ctx, tld, kind);
        if segment.is_null() {
          return null_mut();
        }
        page_alloc_in(ctx, tld, segment)
      }
      PageKind::Huge => {
        debug_assert!(false, "huge pages are allocated with huge_page_alloc");
        null_mut()
      }
    }
  }
}

/// Maps a dedicated segment for one block of `size` bytes. The segment is
/// never owned by a thread: whoever frees the block releases it.
pub(crate) unsafe fn huge_page_alloc(ctx: &AllocatorContext, mem: &mut MemTld, size: usize) -> *mut Page {
  let Some((segment_size, pre_size, info_size)) = segment_size(ctx, 1, size) else {
    return null_mut();
  };
  let Some((segment, is_zero)) = (unsafe { map(ctx, mem, segment_size, info_size, true, !SECURE) }) else {
    return null_mut();
  };
  unsafe {
    init(ctx, segment, PageKind::Huge, 1, segment_size, pre_size, is_zero, 0);
    let page = pages(segment);
    (*page).segment_in_use = true;
    (*segment).used = 1;
    ctx.stats.pages.increase(1);
    page
  }
}

/// Resets a page's descriptor after its last block went away.
unsafe fn page_clear(ctx: &AllocatorContext, segment: *mut Segment, page: *mut Page) {
  unsafe {
    ctx.stats.page_committed.decrease((*page).capacity as usize * (*page).block_size);
    ctx.stats.pages.decrease(1);
    if ctx.options().page_reset
      && !(*segment).mem_is_fixed
      && !(*page).is_reset
      && (*segment).page_kind <= PageKind::Medium
    {
      let (start, psize) = page_start(segment, page, (*page).block_size);
      os::reset(ctx, start, psize);
      (*page).is_reset = true;
    }
    let idx = (*page).segment_idx;
    let is_reset = (*page).is_reset;
    let is_committed = (*page).is_committed;
    ptr::write(page, Page::new(idx, is_committed, false));
    (*page).is_reset = is_reset;
    (*segment).used -= 1;
  }
}

/// Returns an empty page to its segment. The segment goes to the cache or
/// the OS once unused, and back into the free queue once it has room again.
pub(crate) unsafe fn page_free(page: *mut Page, force: bool, tld: &mut SegmentsTld) {
  unsafe {
    let segment = ptr_segment(page);
    let ctx = &*(*segment).ctx;
    page_clear(ctx, segment, page);
    if (*segment).used == 0 {
      free(ctx, segment, force, tld);
    } else if (*segment).used == (*segment).abandoned {
      abandon(ctx, segment, tld);
    } else if (*segment).used + 1 == (*segment).capacity {
      insert_in_free_queue(tld, segment);
    }
  }
}

/// Frees the segment of a huge block. Several threads may race to free the
/// same block; only the one that claims the segment proceeds, and a losing
/// claim means the block was freed twice.
pub(crate) unsafe fn huge_page_free(segment: *mut Segment, page: *mut Page, block: *mut Block) {
  unsafe {
    debug_assert_eq!((*segment).page_kind, PageKind::Huge);
    let ctx = &*(*segment).ctx;
    let claimed = (*segment)
      .thread_id
      .compare_exchange(0, heap::thread_id(), Ordering::AcqRel, Ordering::Relaxed);
    if claimed.is_err() {
      if cfg!(debug_assertions) || SECURE {
        ctx.report(AllocError::DoubleFree {
          block: block.addr(),
          block_size: (*segment).segment_size - (*segment).segment_info_size,
        });
      }
      return;
    }
    let bsize = (*page).block_size;
    ctx.stats.malloc.decrease(bsize);
    ctx.stats.normal[(*page).bin as usize].decrease(1);
    ctx.stats.huge.decrease(bsize);
    page_clear(ctx, segment, page);
    ctx.stats.page_committed.decrease((*segment).segment_info_size);
    os_free(ctx, segment, None);
  }
}

// =============================================================================
// Abandonment
// =============================================================================

/// Pushes onto the context's abandoned stack. The head carries a counter in
/// its low (segment-alignment) bits so a pop racing a pop-push of the same
/// segment fails its CAS.
unsafe fn abandoned_push(ctx: &AllocatorContext, segment: *mut Segment) {
  let mut head = ctx.abandoned.load(Ordering::Relaxed);
  loop {
    let tag = (head.addr().wrapping_add(1)) & SEGMENT_MASK;
    unsafe {
      (*segment)
        .abandoned_next
        .store(head.map_addr(|addr| addr & !SEGMENT_MASK), Ordering::Relaxed)
    };
    let new = segment.map_addr(|addr| addr | tag);
    match ctx
      .abandoned
      .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
    {
      Ok(_) => break,
      Err(current) => head = current,
    }
  }
  ctx.abandoned_count.fetch_add(1, Ordering::Relaxed);
}

unsafe fn abandoned_pop(ctx: &AllocatorContext) -> *mut Segment {
  let mut head = ctx.abandoned.load(Ordering::Acquire);
  loop {
    let segment = head.map_addr(|addr| addr & !SEGMENT_MASK);
    if segment.is_null() {
      return null_mut();
    }
    let tag = (head.addr().wrapping_add(1)) & SEGMENT_MASK;
    let next = unsafe { (*segment).abandoned_next.load(Ordering::Relaxed) };
    let new = next.map_addr(|addr| addr | tag);
    match ctx
      .abandoned
      .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => {
        ctx.abandoned_count.fetch_sub(1, Ordering::Relaxed);
        return segment;
      }
      Err(current) => head = current,
    }
  }
}

unsafe fn abandon(ctx: &AllocatorContext, segment: *mut Segment, tld: &mut SegmentsTld) {
  unsafe {
    debug_assert!((*segment).used == (*segment).abandoned && (*segment).used > 0);
    remove_from_free_queue(tld, segment);
    tld.track_shrink((*segment).segment_size);
    ctx.stats.segments_abandoned.increase(1);
    (*segment).thread_id.store(0, Ordering::Release);
    log::trace!("abandoned segment {segment:p} with {} used pages", (*segment).used);
    abandoned_push(ctx, segment);
  }
}

/// Records that a page with live blocks lost its heap; abandons the segment
/// once all its used pages are abandoned.
pub(crate) unsafe fn page_abandon(page: *mut Page, tld: &mut SegmentsTld) {
  unsafe {
    let segment = ptr_segment(page);
    let ctx = &*(*segment).ctx;
    (*segment).abandoned += 1;
    ctx.stats.pages_abandoned.increase(1);
    if (*segment).used == (*segment).abandoned {
      abandon(ctx, segment, tld);
    }
  }
}

/// Adopts abandoned segments into `heap`. Pops at most a share of the
/// abandoned stack, or all of it (plus slack for concurrent pushes) when
/// `try_all` is set. Returns whether any segment was kept.
pub(crate) unsafe fn try_reclaim_abandoned(heap: *mut Heap, try_all: bool) -> bool {
  unsafe {
    let ctx = (*heap).context();
    let total = ctx.abandoned_count.load(Ordering::Relaxed);
    if total == 0 {
      return false;
    }
    let max = if try_all { total + 16 } else { (total / 8).max(8) };
    let thread_id = (*heap).thread_id;
    let tld = &raw mut (*heap).segments;

    let mut reclaimed = 0;
    for _ in 0..max {
      let segment = abandoned_pop(ctx);
      if segment.is_null() {
        break;
      }
      (*segment).thread_id.store(thread_id, Ordering::Relaxed);
      (*segment).abandoned_next.store(null_mut(), Ordering::Relaxed);
      (*tld).track_grow((*segment).segment_size);
      ctx.stats.segments_abandoned.decrease(1);
      ctx.stats.segments_reclaimed.increase(1);

      for i in 0..(*segment).capacity {
        let page = pages(segment).add(i);
        if !(*page).segment_in_use {
          continue;
        }
        (*segment).abandoned -= 1;
        ctx.stats.pages_abandoned.decrease(1);
        page::free_collect(page, false);
        if page::all_free(page) {
          page_clear(ctx, segment, page);
        } else {
          page::reclaim(heap, page);
        }
      }

      if (*segment).used == 0 {
        free(ctx, segment, false, &mut *tld);
      } else {
        reclaimed += 1;
        if (*segment).used < (*segment).capacity {
          insert_in_free_queue(&mut *tld, segment);
        }
      }
    }
    if reclaimed > 0 {
      log::trace!("thread {thread_id} reclaimed {reclaimed} abandoned segments");
    }
    reclaimed > 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::options::Options;

  #[test]
  fn test_page_kind_for_block_size() {
    assert_eq!(PageKind::for_block_size(8), PageKind::Small);
    assert_eq!(PageKind::for_block_size(SMALL_OBJ_SIZE_MAX), PageKind::Small);
    assert_eq!(PageKind::for_block_size(SMALL_OBJ_SIZE_MAX + 8), PageKind::Medium);
    assert_eq!(PageKind::for_block_size(MEDIUM_OBJ_SIZE_MAX + 8), PageKind::Large);
    assert_eq!(PageKind::for_block_size(LARGE_OBJ_SIZE_MAX + 8), PageKind::Huge);
  }

  #[test]
  fn test_segment_size_fits_header() {
    let ctx = AllocatorContext::leak(Options::default());
    let capacity = SEGMENT_SIZE >> SMALL_PAGE_SHIFT;
    let (size, pre_size, info_size) = segment_size(ctx, capacity, 0).unwrap();
    assert_eq!(size, SEGMENT_SIZE);
    assert!(info_size >= size_of::<Segment>() + capacity * size_of::<Page>());
    assert!(pre_size >= info_size);
    assert!(pre_size < 1 << SMALL_PAGE_SHIFT);
  }

  #[test]
  fn test_huge_segment_size_covers_request() {
    let ctx = AllocatorContext::leak(Options::default());
    let required = 16 << 20;
    let (size, pre_size, _) = segment_size(ctx, 1, required).unwrap();
    assert!(size >= required + pre_size);
    assert_eq!(size % PAGE_HUGE_ALIGN, 0);
  }

  #[test]
  fn test_huge_segment_size_rejects_overflow() {
    let ctx = AllocatorContext::leak(Options::default());
    assert!(segment_size(ctx, 1, usize::MAX - 64).is_none());
    assert!(segment_size(ctx, 1, isize::MAX as usize).is_none());
  }

  #[test]
  fn test_ptr_segment_masks_address() {
    let p = ptr::without_provenance::<u8>(5 * SEGMENT_SIZE + 1234);
    assert_eq!(ptr_segment(p).addr(), 5 * SEGMENT_SIZE);
  }

  #[test]
  fn test_abandoned_stack_is_lifo() {
    let ctx = AllocatorContext::leak(Options::default());
    let mut tld = SegmentsTld::new();
    unsafe {
      let a = alloc(ctx, &mut tld, PageKind::Small);
      let b = alloc(ctx, &mut tld, PageKind::Small);
      assert!(!a.is_null() && !b.is_null());
      abandoned_push(ctx, a);
      abandoned_push(ctx, b);
      assert_eq!(ctx.abandoned_count(), 2);
      assert_eq!(abandoned_pop(ctx), b);
      assert_eq!(abandoned_pop(ctx), a);
      assert!(abandoned_pop(ctx).is_null());
      assert_eq!(ctx.abandoned_count(), 0);
      free(ctx, a, true, &mut tld);
      free(ctx, b, true, &mut tld);
    }
    assert_eq!(tld.count(), 0);
    assert_eq!(ctx.stats.segments.current(), 0);
  }

  #[test]
  fn test_segment_cache_reuses_segment() {
    let ctx = AllocatorContext::leak(Options {
      eager_commit_delay: 0,
      ..Options::default()
    });
    let mut tld = SegmentsTld::new();
    unsafe {
      let page = page_alloc(ctx, &mut tld, 64);
      assert!(!page.is_null());
      let segment = ptr_segment(page);
      (*page).block_size = 64;
      page_free(page, false, &mut tld);
      assert_eq!(tld.cache_count(), 1);

      let again = page_alloc(ctx, &mut tld, 64);
      assert_eq!(ptr_segment(again), segment);
      assert_eq!(tld.cache_count(), 0);
      page_free(again, true, &mut tld);
      cache_collect(ctx, &mut tld);
    }
    assert_eq!(tld.count(), 0);
  }
}
