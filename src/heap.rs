//! Heaps: per-thread page queues and the allocation slow path.
//!
//! A heap owns the pages it allocates from; only the owning thread touches
//! them. Blocks freed by other threads come back through each page's
//! `thread_free` list or, for pages in the full queue, the heap's delayed
//! list.

use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::context::AllocatorContext;
use crate::error::AllocError;
use crate::os;
use crate::page::{self, Block, BlockView, Page, PageCounts};
use crate::page_queue::{self, BIN_FULL, BIN_HUGE, PageQueue};
use crate::random::{random_init, shuffle};
use crate::region::MemTld;
use crate::segment::{self, SegmentsTld};
use crate::{
  ALIGNMENT_MAX, LARGE_OBJ_SIZE_MAX, MEDIUM_OBJ_SIZE_MAX, SECURE, SMALL_SIZE_MAX, SMALL_WSIZE_MAX, WORD_SIZE,
  wsize_from_size,
};

/// Entries in the direct small-size lookup table.
pub(crate) const PAGES_DIRECT: usize = SMALL_WSIZE_MAX + 1;

/// Locally accumulated stat deltas are published past this many bytes.
const STAT_FLUSH_BYTES: isize = 64 * 1024;

// =============================================================================
// Threads
// =============================================================================

/// Small unique id of the calling thread. Never 0, which marks segments
/// without an owner.
pub(crate) fn thread_id() -> usize {
  thread_local! {
    static TID: usize = {
      static NEXT: AtomicUsize = AtomicUsize::new(1);
      NEXT.fetch_add(1, Ordering::Relaxed)
    };
  }
  TID.try_with(|&id| id).unwrap_or(usize::MAX)
}

// =============================================================================
// Heap
// =============================================================================

/// How thoroughly [`Heap::collect`] releases memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Collect {
  /// Free pages without live blocks.
  Normal,
  /// Also free retired pages and the segment cache.
  Force,
  /// Release everything; pages with live blocks are abandoned for other
  /// threads to reclaim. Used when a heap is dropped.
  Abandon,
}

/// A thread-local allocation heap.
///
/// Every thread that allocates through the global entry points gets one
/// implicitly. Explicit heaps created with [`Heap::new`] allocate from their
/// own pages; blocks from any heap may be freed with [`crate::free`] on any
/// thread. Dropping a heap abandons its pages that still have live blocks.
pub struct Heap {
  ctx: &'static AllocatorContext,
  pub(crate) thread_id: usize,
  pub(crate) pages_free_direct: [*mut Page; PAGES_DIRECT],
  pub(crate) pages: [PageQueue; BIN_FULL + 1],
  pub(crate) thread_delayed_free: AtomicPtr<Block>,
  pub(crate) key: usize,
  random: usize,
  pub(crate) page_count: usize,
  pub(crate) retired_min: usize,
  pub(crate) retired_max: usize,
  heartbeat: u64,
  in_deferred: bool,
  no_reclaim: bool,
  is_main: bool,
  pub(crate) segments: SegmentsTld,
  malloc_delta: isize,
  bin_delta: [isize; BIN_HUGE + 1],
}

impl Heap {
  /// Creates a heap for the calling thread.
  pub fn new(ctx: &'static AllocatorContext) -> Box<Self> {
    Box::new(Self::init(ctx))
  }

  pub(crate) fn init(ctx: &'static AllocatorContext) -> Self {
    let thread_id = thread_id();
    let random = random_init(thread_id ^ ptr::from_ref(ctx).addr());
    let key = if SECURE { shuffle(random) | 1 } else { 0 };
    let is_main = ctx.claim_main_thread(thread_id);
    ctx.stats.threads.increase(1);
    Self {
      ctx,
      thread_id,
      pages_free_direct: [null_mut(); PAGES_DIRECT],
      pages: page_queue::initial_queues(),
      thread_delayed_free: AtomicPtr::new(null_mut()),
      key,
      random,
      page_count: 0,
      retired_min: BIN_FULL,
      retired_max: 0,
      heartbeat: 0,
      in_deferred: false,
      no_reclaim: false,
      is_main,
      segments: SegmentsTld::new(),
      malloc_delta: 0,
      bin_delta: [0; BIN_HUGE + 1],
    }
  }

  pub fn context(&self) -> &'static AllocatorContext {
    self.ctx
  }

  pub fn thread_id(&self) -> usize {
    self.thread_id
  }

  /// Stops this heap from adopting abandoned segments.
  pub fn set_no_reclaim(&mut self, no_reclaim: bool) {
    self.no_reclaim = no_reclaim;
  }

  /// Allocates `size` bytes aligned to at least a machine word. Returns null
  /// when memory is exhausted.
  #[inline]
  pub fn malloc(&mut self, size: usize) -> *mut u8 {
    unsafe { malloc(self, size) }
  }

  /// Like [`malloc`](Self::malloc) but the memory is zeroed.
  pub fn zalloc(&mut self, size: usize) -> *mut u8 {
    unsafe { malloc_zero(self, size, true) }
  }

  /// Allocates `size` bytes aligned to `alignment`, a power of two no larger
  /// than half a segment.
  pub fn try_malloc_aligned(&mut self, size: usize, alignment: usize, zero: bool) -> Result<*mut u8, AllocError> {
    if !alignment.is_power_of_two() {
      return Err(AllocError::InvalidArgument {
        reason: "alignment is not a power of two",
      });
    }
    if alignment > ALIGNMENT_MAX {
      return Err(AllocError::InvalidArgument {
        reason: "alignment exceeds half a segment",
      });
    }
    if size > isize::MAX as usize - alignment {
      return Err(AllocError::OutOfMemory { size });
    }
    let p = unsafe { malloc_aligned(self, size, alignment, zero) };
    if p.is_null() {
      Err(AllocError::OutOfMemory { size })
    } else {
      Ok(p)
    }
  }

  pub fn malloc_aligned(&mut self, size: usize, alignment: usize) -> *mut u8 {
    self.try_malloc_aligned(size, alignment, false).unwrap_or(null_mut())
  }

  pub fn zalloc_aligned(&mut self, size: usize, alignment: usize) -> *mut u8 {
    self.try_malloc_aligned(size, alignment, true).unwrap_or(null_mut())
  }

  /// Resizes a block from any heap, moving it into this one if it has to
  /// move. On failure the old block is left untouched and null is returned.
  ///
  /// # Safety
  /// `p` must be null or a live block returned by this allocator.
  pub unsafe fn realloc(&mut self, p: *mut u8, new_size: usize) -> *mut u8 {
    if p.is_null() {
      return self.malloc(new_size);
    }
    let size = unsafe { crate::alloc::usable_size(p) };
    if new_size <= size && new_size >= size / 2 {
      return p;
    }
    let fresh = self.malloc(new_size);
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(p, fresh, size.min(new_size));
        crate::alloc::free(p);
      }
    }
    fresh
  }

  /// Releases unused memory held by this heap.
  pub fn collect(&mut self, collect: Collect) {
    unsafe { collect_ex(self, collect) };
  }

  /// Adopts segments abandoned by exited threads. Returns whether any
  /// segment with live blocks was taken over.
  pub fn try_reclaim_abandoned(&mut self, try_all: bool) -> bool {
    unsafe { segment::try_reclaim_abandoned(self, try_all) }
  }

  /// Calls `visitor` with the block accounting of every page of this heap.
  pub fn visit_pages(&self, mut visitor: impl FnMut(PageCounts)) {
    for queue in &self.pages {
      let mut page = queue.first;
      while !page.is_null() {
        unsafe {
          visitor(page::counts(page));
          page = (*page).next;
        }
      }
    }
  }

  /// Blocks of this heap's pages still held by callers.
  pub fn used_blocks(&self) -> usize {
    let mut used = 0;
    self.visit_pages(|counts| used += counts.live());
    used
  }

  /// Whether `p` points into a block of one of this heap's pages.
  pub fn contains_block(&self, p: *const u8) -> bool {
    if p.is_null() {
      return false;
    }
    for queue in &self.pages {
      let mut page = queue.first;
      while !page.is_null() {
        unsafe {
          let (start, _) = page::area(page);
          let end = start.addr() + (*page).capacity as usize * (*page).block_size;
          if p.addr() >= start.addr() && p.addr() < end {
            return true;
          }
          page = (*page).next;
        }
      }
    }
    false
  }

  #[inline]
  fn next_random(&mut self) -> usize {
    self.random = shuffle(self.random);
    self.random
  }

  #[inline]
  pub(crate) fn note_malloc(&mut self, bin: usize, block_size: usize) {
    self.malloc_delta += block_size as isize;
    self.bin_delta[bin] += 1;
  }

  #[inline]
  pub(crate) fn note_free(&mut self, bin: usize, block_size: usize) {
    self.malloc_delta -= block_size as isize;
    self.bin_delta[bin] -= 1;
  }

  /// Publishes the locally accumulated allocation stats.
  pub(crate) fn flush_stats(&mut self) {
    let stats = &self.ctx.stats;
    stats.malloc.adjust(core::mem::take(&mut self.malloc_delta));
    for (count, delta) in stats.normal.iter().zip(self.bin_delta.iter_mut()) {
      count.adjust(core::mem::take(delta));
    }
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    unsafe { collect_ex(self, Collect::Abandon) };
    self.flush_stats();
    self.ctx.stats.threads.decrease(1);
  }
}

// =============================================================================
// Allocation
// =============================================================================

/// Pops a block from `page`, falling back to the slow path when it is empty.
#[inline]
pub(crate) unsafe fn page_malloc(heap: *mut Heap, page: *mut Page, size: usize) -> *mut u8 {
  unsafe {
    let block = (*page).free;
    if block.is_null() {
      return malloc_generic(heap, size);
    }
    (*page).free = page::block_view(page).next(block);
    (*page).used += 1;
    (*heap).note_malloc((*page).bin as usize, (*page).block_size);
    block.cast()
  }
}

#[inline]
pub(crate) unsafe fn malloc(heap: *mut Heap, size: usize) -> *mut u8 {
  unsafe {
    if size <= SMALL_SIZE_MAX {
      let page = (*heap).pages_free_direct[wsize_from_size(size)];
      if !page.is_null() {
        return page_malloc(heap, page, size);
      }
    }
    malloc_generic(heap, size)
  }
}

pub(crate) unsafe fn malloc_zero(heap: *mut Heap, size: usize, zero: bool) -> *mut u8 {
  unsafe {
    let p = malloc(heap, size);
    if zero && !p.is_null() {
      zero_init(p, size);
    }
    p
  }
}

/// Zeroes a fresh block, skipping memory known to be zero already.
pub(crate) unsafe fn zero_init(p: *mut u8, size: usize) {
  unsafe {
    let segment = segment::ptr_segment(p);
    let page = segment::page_of(segment, p);
    if (*page).is_zero && size >= WORD_SIZE {
      p.cast::<usize>().write(0);
    } else {
      ptr::write_bytes(p, 0, crate::alloc::usable_size(p));
    }
  }
}

pub(crate) unsafe fn malloc_aligned(heap: *mut Heap, size: usize, alignment: usize, zero: bool) -> *mut u8 {
  unsafe {
    let mask = alignment - 1;
    if size <= SMALL_SIZE_MAX {
      let page = (*heap).pages_free_direct[wsize_from_size(size)];
      if !page.is_null() && !(*page).free.is_null() && (*page).free.addr() & mask == 0 {
        let p = page_malloc(heap, page, size);
        if zero {
          zero_init(p, size);
        }
        return p;
      }
    }
    // Blocks of these sizes are naturally aligned to any power of two
    // dividing the size.
    if alignment <= size && size <= MEDIUM_OBJ_SIZE_MAX && size & mask == 0 {
      return malloc_zero(heap, size, zero);
    }
    let p = malloc_zero(heap, size + alignment - 1, zero);
    if p.is_null() {
      return p;
    }
    align_within(p, alignment)
  }
}

/// Rounds `p` up to `alignment`, flagging its page so frees find the block
/// start again.
pub(crate) unsafe fn align_within(p: *mut u8, alignment: usize) -> *mut u8 {
  let adjust = alignment - (p.addr() & (alignment - 1));
  if adjust == alignment {
    return p;
  }
  unsafe {
    let segment = segment::ptr_segment(p);
    page::set_has_aligned(segment::page_of(segment, p), true);
    p.add(adjust)
  }
}

/// Slow path: runs deferred work, finds or makes a page with free blocks and
/// allocates from it. Retries once after a forced collection before giving
/// up.
#[cold]
pub(crate) unsafe fn malloc_generic(heap: *mut Heap, size: usize) -> *mut u8 {
  unsafe {
    let ctx = (*heap).ctx;
    deferred_free(heap, false);
    delayed_free(heap);
    if (*heap).is_main && ctx.take_main_compact_request() {
      collect_ex(heap, Collect::Force);
    }
    if (*heap).malloc_delta.abs() > STAT_FLUSH_BYTES {
      (*heap).flush_stats();
    }

    let mut page = find_page(heap, size);
    if page.is_null() {
      collect_ex(heap, Collect::Force);
      if !(*heap).no_reclaim {
        segment::try_reclaim_abandoned(heap, true);
      }
      page = find_page(heap, size);
    }
    if page.is_null() {
      ctx.report(AllocError::OutOfMemory { size });
      return null_mut();
    }
    debug_assert!(page::immediate_available(page));
    page_malloc(heap, page, size)
  }
}

unsafe fn find_page(heap: *mut Heap, size: usize) -> *mut Page {
  unsafe {
    if size > LARGE_OBJ_SIZE_MAX {
      if size > isize::MAX as usize {
        return null_mut();
      }
      return huge_page_alloc(heap, size);
    }
    let bin = page_queue::bin(size);
    let page = (*heap).pages[bin].first;
    if !page.is_null() {
      page::free_collect(page, false);
      if page::immediate_available(page) {
        (*page).retire_expire = 0;
        return page;
      }
    }
    queue_find_free(heap, bin, true)
  }
}

/// Walks a queue for a page with free blocks, extending pages that have
/// unused capacity and moving exhausted ones to the full queue.
unsafe fn queue_find_free(heap: *mut Heap, bin: usize, first_try: bool) -> *mut Page {
  unsafe {
    let mut searched = 0;
    let mut page = (*heap).pages[bin].first;
    while !page.is_null() {
      let next = (*page).next;
      searched += 1;
      page::free_collect(page, false);
      if page::immediate_available(page) {
        break;
      }
      if (*page).capacity < (*page).reserved {
        page::extend_free(page, &mut (*heap).random);
        break;
      }
      page::to_full(heap, page);
      page = next;
    }
    (*heap).ctx.stats.searches.increase(searched);

    if page.is_null() {
      collect_retired(heap, false);
      page = page_fresh(heap, bin);
      if page.is_null() && first_try {
        page = queue_find_free(heap, bin, false);
      }
    } else {
      (*page).retire_expire = 0;
    }
    page
  }
}

/// A page for `bin`, preferably from a reclaimed segment.
unsafe fn page_fresh(heap: *mut Heap, bin: usize) -> *mut Page {
  unsafe {
    let first = (*heap).pages[bin].first;
    if !(*heap).no_reclaim && segment::try_reclaim_abandoned(heap, false) {
      let page = (*heap).pages[bin].first;
      if page != first && !page.is_null() && page::immediate_available(page) {
        return page;
      }
    }
    let block_size = (*heap).pages[bin].block_size;
    let ctx = (*heap).ctx;
    let page = segment::page_alloc(ctx, &mut (*heap).segments, block_size);
    if page.is_null() {
      return null_mut();
    }
    page::init(page, block_size, &mut (*heap).random);
    page_queue::queue_push(heap, bin, page);
    page
  }
}

unsafe fn huge_page_alloc(heap: *mut Heap, size: usize) -> *mut Page {
  unsafe {
    let ctx = (*heap).ctx;
    let block_size = os::good_alloc_size(ctx, size);
    let page = segment::huge_page_alloc(ctx, &mut (*heap).segments.mem, block_size);
    if page.is_null() {
      return null_mut();
    }
    page::init(page, block_size, &mut (*heap).random);
    ctx.stats.huge.increase(block_size);
    ctx.stats.huge_count.increase(1);
    page
  }
}

/// Allocates without a thread heap, for threads whose heap is busy or
/// already destroyed. Every block gets its own huge-kind segment.
pub(crate) fn malloc_detached(ctx: &'static AllocatorContext, size: usize, alignment: usize, zero: bool) -> *mut u8 {
  if size > isize::MAX as usize - alignment {
    ctx.report(AllocError::OutOfMemory { size });
    return null_mut();
  }
  let request = if alignment > WORD_SIZE { size + alignment - 1 } else { size };
  let block_size = os::good_alloc_size(ctx, request.max(WORD_SIZE));
  let mut mem = MemTld::new();
  let mut random = random_init(block_size);
  unsafe {
    let page = segment::huge_page_alloc(ctx, &mut mem, block_size);
    if page.is_null() {
      ctx.report(AllocError::OutOfMemory { size });
      return null_mut();
    }
    page::init(page, block_size, &mut random);
    ctx.stats.huge.increase(block_size);
    ctx.stats.huge_count.increase(1);
    ctx.stats.malloc.increase(block_size);
    ctx.stats.normal[(*page).bin as usize].increase(1);

    let block = (*page).free;
    (*page).free = page::block_view(page).next(block);
    (*page).used = 1;
    let p = block.cast::<u8>();
    if zero && !(*page).is_zero {
      ptr::write_bytes(p, 0, block_size);
    } else if zero {
      p.cast::<usize>().write(0);
    }
    if alignment > WORD_SIZE { align_within(p, alignment) } else { p }
  }
}

// =============================================================================
// Deferred and delayed frees
// =============================================================================

unsafe fn deferred_free(heap: *mut Heap, force: bool) {
  unsafe {
    (*heap).heartbeat += 1;
    if (*heap).in_deferred {
      return;
    }
    if let Some(callback) = (*heap).ctx.deferred_free() {
      (*heap).in_deferred = true;
      callback(force, (*heap).heartbeat);
      (*heap).in_deferred = false;
    }
  }
}

/// Frees the blocks other threads handed over through the delayed list.
pub(crate) unsafe fn delayed_free(heap: *mut Heap) {
  unsafe {
    let list = &(*heap).thread_delayed_free;
    let mut block = list.load(Ordering::Relaxed);
    while !block.is_null() {
      match list.compare_exchange_weak(block, null_mut(), Ordering::AcqRel, Ordering::Relaxed) {
        Ok(_) => break,
        Err(current) => block = current,
      }
    }

    let view = BlockView::new((*heap).key);
    while !block.is_null() {
      let next = view.next(block);
      if !crate::alloc::free_delayed_block(block) {
        // The page is still mid delayed free; try again next time.
        let mut head = list.load(Ordering::Relaxed);
        loop {
          view.set_next(block, head);
          match list.compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => head = current,
          }
        }
      }
      block = next;
    }
  }
}

// =============================================================================
// Collection
// =============================================================================

/// Frees retired pages whose grace period ran out, or all of them if
/// `force` is set.
unsafe fn collect_retired(heap: *mut Heap, force: bool) {
  unsafe {
    let mut min = BIN_FULL;
    let mut max = 0;
    let (lo, hi) = ((*heap).retired_min, (*heap).retired_max);
    for bin in lo..=hi.min(BIN_HUGE) {
      let page = (*heap).pages[bin].first;
      if page.is_null() || (*page).retire_expire == 0 {
        continue;
      }
      if page::all_free(page) {
        (*page).retire_expire -= 1;
        if force || (*page).retire_expire == 0 {
          page::free(heap, page, force);
        } else {
          min = min.min(bin);
          max = max.max(bin);
        }
      } else {
        (*page).retire_expire = 0;
      }
    }
    (*heap).retired_min = min;
    (*heap).retired_max = max;
  }
}

unsafe fn for_each_page(heap: *mut Heap, mut f: impl FnMut(*mut Page)) {
  unsafe {
    for bin in 0..=BIN_FULL {
      let mut page = (*heap).pages[bin].first;
      while !page.is_null() {
        let next = (*page).next;
        f(page);
        page = next;
      }
    }
  }
}

pub(crate) unsafe fn collect_ex(heap: *mut Heap, collect: Collect) {
  unsafe {
    let ctx = (*heap).ctx;
    deferred_free(heap, collect >= Collect::Force);

    if collect == Collect::Abandon {
      // No thread may add to our delayed list once we start abandoning.
      for_each_page(heap, |page| {
        page::use_delayed_free(page, page::Delayed::NeverDelayedFree, false);
      });
    }
    delayed_free(heap);
    collect_retired(heap, collect >= Collect::Force);

    for_each_page(heap, |page| {
      page::free_collect(page, collect >= Collect::Force);
      if page::all_free(page) {
        page::free(heap, page, collect >= Collect::Force);
      } else if collect == Collect::Abandon {
        page::abandon(heap, page);
      }
    });

    if collect >= Collect::Force {
      segment::cache_collect(ctx, &mut (*heap).segments);
      if (*heap).is_main {
        ctx.collect_regions();
      }
    }
    (*heap).flush_stats();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::options::Options;

  fn context() -> &'static AllocatorContext {
    AllocatorContext::leak(Options::default())
  }

  #[test]
  fn test_thread_ids_are_unique_and_nonzero() {
    let here = thread_id();
    let there = std::thread::spawn(thread_id).join().unwrap();
    assert_ne!(here, 0);
    assert_ne!(there, 0);
    assert_ne!(here, there);
    assert_eq!(here, thread_id());
  }

  #[test]
  fn test_small_blocks_come_from_one_page() {
    let mut heap = Heap::new(context());
    let a = heap.malloc(24);
    let b = heap.malloc(24);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
    assert_eq!(segment::ptr_segment(a), segment::ptr_segment(b));
    assert_eq!(a.addr() % WORD_SIZE, 0);
    assert_eq!(heap.used_blocks(), 2);
    unsafe {
      crate::alloc::free(a);
      crate::alloc::free(b);
    }
    assert_eq!(heap.used_blocks(), 0);
  }

  #[test]
  fn test_zalloc_returns_zeroed_memory() {
    let mut heap = Heap::new(context());
    let p = heap.malloc(256);
    unsafe {
      ptr::write_bytes(p, 0xab, 256);
      crate::alloc::free(p);
    }
    let z = heap.zalloc(256);
    let bytes = unsafe { core::slice::from_raw_parts(z, 256) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { crate::alloc::free(z) };
  }

  #[test]
  fn test_aligned_allocations() {
    let mut heap = Heap::new(context());
    for shift in 3..=20 {
      let alignment = 1usize << shift;
      for size in [1, 24, 100, 4096, 70_000] {
        let p = heap.malloc_aligned(size, alignment);
        assert!(!p.is_null());
        assert_eq!(p.addr() % alignment, 0, "size {size} alignment {alignment}");
        unsafe {
          ptr::write_bytes(p, 0x5a, size);
          assert!(crate::alloc::usable_size(p) >= size);
          crate::alloc::free(p);
        }
      }
    }
  }

  #[test]
  fn test_invalid_alignment_is_rejected() {
    let mut heap = Heap::new(context());
    assert!(matches!(
      heap.try_malloc_aligned(8, 24, false),
      Err(AllocError::InvalidArgument { .. })
    ));
    assert!(matches!(
      heap.try_malloc_aligned(8, ALIGNMENT_MAX * 2, false),
      Err(AllocError::InvalidArgument { .. })
    ));
  }

  #[test]
  fn test_realloc_preserves_contents() {
    let mut heap = Heap::new(context());
    let p = heap.malloc(16);
    unsafe {
      for i in 0..16 {
        p.add(i).write(i as u8);
      }
      let q = heap.realloc(p, 4000);
      assert!(!q.is_null());
      for i in 0..16 {
        assert_eq!(q.add(i).read(), i as u8);
      }
      assert_eq!(heap.realloc(q, 3000), q);
      crate::alloc::free(q);
    }
  }

  #[test]
  fn test_page_accounting_stays_consistent() {
    let mut heap = Heap::new(context());
    let blocks: Vec<_> = (0..500).map(|i| heap.malloc(8 + (i % 7) * 40)).collect();
    for (i, &p) in blocks.iter().enumerate() {
      if i % 3 == 0 {
        unsafe { crate::alloc::free(p) };
      }
    }
    heap.visit_pages(|counts| assert!(counts.is_consistent(), "{counts:?}"));
    for (i, &p) in blocks.iter().enumerate() {
      if i % 3 != 0 {
        unsafe { crate::alloc::free(p) };
      }
    }
    assert_eq!(heap.used_blocks(), 0);
  }

  #[test]
  fn test_collect_releases_empty_pages() {
    let ctx = context();
    let mut heap = Heap::new(ctx);
    let blocks: Vec<_> = (0..64).map(|_| heap.malloc(2000)).collect();
    for p in blocks {
      unsafe { crate::alloc::free(p) };
    }
    heap.collect(Collect::Force);
    assert_eq!(heap.page_count, 0);
    assert_eq!(ctx.stats.pages.current(), 0);
  }
}
