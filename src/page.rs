//! Pages: one slice of a segment serving blocks of a single size.
//!
//! A page keeps three free lists. `free` and `local_free` are touched only by
//! the owning thread; `thread_free` is an atomic stack other threads push onto.
//! The low two bits of `thread_free` carry a [`Delayed`] state that lets the
//! owner ask freeing threads to route blocks through the heap's delayed list
//! while the page sits in the full queue.

use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::context::AllocatorContext;
use crate::error::AllocError;
use crate::heap::Heap;
use crate::page_queue::{self, BIN_FULL, BIN_HUGE};
use crate::random::shuffle;
use crate::segment::{self, Segment};
use crate::{LARGE_OBJ_SIZE_MAX, MAX_EXTEND_SIZE, MIN_EXTEND, SECURE, SMALL_OBJ_SIZE_MAX, WORD_SIZE};

const MAX_SLICE_SHIFT: usize = 6;
const MAX_SLICES: usize = 1 << MAX_SLICE_SHIFT;
const MIN_SLICES: usize = 2;

/// Allocation cycles a retired page survives before it is freed.
const RETIRE_CYCLES: u8 = 8;

// =============================================================================
// Blocks
// =============================================================================

/// A free block. Only the first word is ours; the rest belongs to the caller
/// once allocated.
#[repr(C)]
pub(crate) struct Block {
  next: *mut Block,
}

/// Reads and writes the free-list link stored in the first word of a free
/// block. With the `secure` feature links are stored xor'ed with a per-page
/// (or per-heap) key so a stray write cannot forge a valid pointer.
#[derive(Clone, Copy)]
pub(crate) struct BlockView {
  key: usize,
}

impl BlockView {
  #[inline]
  pub(crate) const fn new(key: usize) -> Self {
    Self { key }
  }

  #[inline]
  pub(crate) unsafe fn next(self, block: *const Block) -> *mut Block {
    let raw = unsafe { (*block).next };
    if SECURE {
      ptr::with_exposed_provenance_mut(raw.addr() ^ self.key)
    } else {
      raw
    }
  }

  #[inline]
  pub(crate) unsafe fn set_next(self, block: *mut Block, next: *mut Block) {
    let raw = if SECURE {
      ptr::without_provenance_mut(next.expose_provenance() ^ self.key)
    } else {
      next
    };
    unsafe { (*block).next = raw };
  }

  /// Length of the list at `head`, or `None` if it exceeds `max`.
  pub(crate) unsafe fn count(self, mut head: *mut Block, max: usize) -> Option<usize> {
    let mut count = 0;
    while !head.is_null() {
      count += 1;
      if count > max {
        return None;
      }
      head = unsafe { self.next(head) };
    }
    Some(count)
  }

  unsafe fn contains(self, mut head: *mut Block, block: *const Block, max: usize) -> bool {
    let mut steps = 0;
    while !head.is_null() && steps <= max {
      if ptr::eq(head, block) {
        return true;
      }
      head = unsafe { self.next(head) };
      steps += 1;
    }
    false
  }
}

// =============================================================================
// Thread free list
// =============================================================================

/// Hand-off state between the page owner and threads freeing into the page.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delayed {
  /// Push onto the page's `thread_free` list.
  NoDelayedFree = 0,
  /// Push onto the owning heap's delayed list instead.
  UseDelayedFree = 1,
  /// A freeing thread is pushing onto the heap's delayed list right now.
  DelayedFreeing = 2,
  /// The page has no heap; never use the delayed list.
  NeverDelayedFree = 3,
}

impl Delayed {
  const MASK: usize = 0b11;

  const fn from_bits(bits: usize) -> Self {
    match bits & Self::MASK {
      0 => Self::NoDelayedFree,
      1 => Self::UseDelayedFree,
      2 => Self::DelayedFreeing,
      _ => Self::NeverDelayedFree,
    }
  }
}

/// A block pointer with a [`Delayed`] state packed into its low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadFree(*mut Block);

const _: () = assert!(WORD_SIZE > Delayed::MASK);

impl ThreadFree {
  #[inline]
  pub(crate) fn new(block: *mut Block, delayed: Delayed) -> Self {
    Self(block.map_addr(|addr| addr | delayed as usize))
  }

  #[inline]
  pub(crate) fn block(self) -> *mut Block {
    self.0.map_addr(|addr| addr & !Delayed::MASK)
  }

  #[inline]
  pub(crate) fn delayed(self) -> Delayed {
    Delayed::from_bits(self.0.addr())
  }

  #[inline]
  pub(crate) fn with_block(self, block: *mut Block) -> Self {
    Self::new(block, self.delayed())
  }

  #[inline]
  pub(crate) fn with_delayed(self, delayed: Delayed) -> Self {
    Self::new(self.block(), delayed)
  }
}

pub(crate) struct AtomicThreadFree(AtomicPtr<Block>);

impl AtomicThreadFree {
  pub(crate) const fn new() -> Self {
    Self(AtomicPtr::new(null_mut()))
  }

  #[inline]
  pub(crate) fn load(&self, order: Ordering) -> ThreadFree {
    ThreadFree(self.0.load(order))
  }

  #[inline]
  pub(crate) fn compare_exchange_weak(
    &self,
    current: ThreadFree,
    new: ThreadFree,
    success: Ordering,
    failure: Ordering,
  ) -> Result<ThreadFree, ThreadFree> {
    self
      .0
      .compare_exchange_weak(current.0, new.0, success, failure)
      .map(ThreadFree)
      .map_err(ThreadFree)
  }
}

// =============================================================================
// Page descriptor
// =============================================================================

const FLAG_IN_FULL: u8 = 1 << 0;
const FLAG_HAS_ALIGNED: u8 = 1 << 1;

/// Page descriptor, stored in the segment header.
#[repr(C)]
pub(crate) struct Page {
  pub(crate) segment_idx: u8,
  pub(crate) segment_in_use: bool,
  pub(crate) is_reset: bool,
  pub(crate) is_committed: bool,
  pub(crate) is_zero_init: bool,
  /// Non-zero flags send local frees down the generic path.
  pub(crate) flags: u8,
  /// Blocks on `free` are known to be zeroed.
  pub(crate) is_zero: bool,
  pub(crate) bin: u8,
  pub(crate) retire_expire: u8,
  pub(crate) capacity: u16,
  pub(crate) reserved: u16,
  pub(crate) free: *mut Block,
  pub(crate) key: usize,
  /// Blocks not on `free` or `local_free`. Includes blocks sitting on
  /// `thread_free` until they are collected.
  pub(crate) used: usize,
  pub(crate) local_free: *mut Block,
  pub(crate) thread_free: AtomicThreadFree,
  pub(crate) block_size: usize,
  pub(crate) heap: AtomicPtr<Heap>,
  pub(crate) next: *mut Page,
  pub(crate) prev: *mut Page,
}

impl Page {
  pub(crate) const fn new(segment_idx: u8, is_committed: bool, is_zero_init: bool) -> Self {
    Self {
      segment_idx,
      segment_in_use: false,
      is_reset: false,
      is_committed,
      is_zero_init,
      flags: 0,
      is_zero: false,
      bin: 0,
      retire_expire: 0,
      capacity: 0,
      reserved: 0,
      free: null_mut(),
      key: 0,
      used: 0,
      local_free: null_mut(),
      thread_free: AtomicThreadFree::new(),
      block_size: 0,
      heap: AtomicPtr::new(null_mut()),
      next: null_mut(),
      prev: null_mut(),
    }
  }
}

/// Snapshot of a page's block accounting, as seen by its owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCounts {
  pub block_size: usize,
  pub capacity: usize,
  pub reserved: usize,
  /// Blocks not on the owner's lists, including uncollected cross-thread frees.
  pub used: usize,
  pub free: usize,
  pub local_free: usize,
  pub thread_free: usize,
}

impl PageCounts {
  /// Blocks still held by callers.
  pub fn live(&self) -> usize {
    self.used.saturating_sub(self.thread_free)
  }

  /// Every block is in exactly one of: live, `free`, `local_free`,
  /// `thread_free`.
  pub fn is_consistent(&self) -> bool {
    self.thread_free <= self.used
      && self.live() + self.free + self.local_free + self.thread_free == self.capacity
      && self.capacity <= self.reserved
  }
}

// =============================================================================
// Accessors
// =============================================================================

#[inline]
pub(crate) unsafe fn is_in_full(page: *const Page) -> bool {
  unsafe { (*page).flags & FLAG_IN_FULL != 0 }
}

#[inline]
pub(crate) unsafe fn set_in_full(page: *mut Page, in_full: bool) {
  unsafe {
    if in_full {
      (*page).flags |= FLAG_IN_FULL;
    } else {
      (*page).flags &= !FLAG_IN_FULL;
    }
  }
}

#[inline]
pub(crate) unsafe fn has_aligned(page: *const Page) -> bool {
  unsafe { (*page).flags & FLAG_HAS_ALIGNED != 0 }
}

#[inline]
pub(crate) unsafe fn set_has_aligned(page: *mut Page, has_aligned: bool) {
  unsafe {
    if has_aligned {
      (*page).flags |= FLAG_HAS_ALIGNED;
    } else {
      (*page).flags &= !FLAG_HAS_ALIGNED;
    }
  }
}

#[inline]
pub(crate) unsafe fn block_view(page: *const Page) -> BlockView {
  BlockView::new(unsafe { (*page).key })
}

#[inline]
pub(crate) unsafe fn immediate_available(page: *const Page) -> bool {
  unsafe { !(*page).free.is_null() }
}

#[inline]
pub(crate) unsafe fn all_free(page: *const Page) -> bool {
  unsafe { (*page).used == 0 }
}

#[inline]
pub(crate) unsafe fn segment_of(page: *const Page) -> *mut Segment {
  segment::ptr_segment(page)
}

#[inline]
pub(crate) unsafe fn context(page: *const Page) -> &'static AllocatorContext {
  unsafe { &*(*segment_of(page)).ctx }
}

/// Start and size of the block area.
#[inline]
pub(crate) unsafe fn area(page: *const Page) -> (*mut u8, usize) {
  unsafe { segment::page_start(segment_of(page), page, (*page).block_size) }
}

pub(crate) unsafe fn counts(page: *const Page) -> PageCounts {
  unsafe {
    let view = block_view(page);
    let capacity = (*page).capacity as usize;
    let thread_head = (*page).thread_free.load(Ordering::Acquire).block();
    PageCounts {
      block_size: (*page).block_size,
      capacity,
      reserved: (*page).reserved as usize,
      used: (*page).used,
      free: view.count((*page).free, capacity).unwrap_or(usize::MAX),
      local_free: view.count((*page).local_free, capacity).unwrap_or(usize::MAX),
      thread_free: view.count(thread_head, capacity).unwrap_or(usize::MAX),
    }
  }
}

// =============================================================================
// Initialization and extension
// =============================================================================

/// Sets up a page freshly taken from a segment and links its first blocks.
pub(crate) unsafe fn init(page: *mut Page, block_size: usize, random: &mut usize) {
  unsafe {
    let segment = segment_of(page);
    let (_, page_size) = segment::page_start(segment, page, block_size);
    debug_assert!(page_size / block_size < (1 << 16));
    (*page).block_size = block_size;
    (*page).bin = page_queue::bin(block_size).min(BIN_HUGE) as u8;
    (*page).reserved = (page_size / block_size) as u16;
    if SECURE {
      *random = shuffle(*random);
      (*page).key = *random | 1;
    }
    (*page).is_zero = (*page).is_zero_init;
    debug_assert!((*page).capacity == 0 && (*page).used == 0 && (*page).free.is_null());
    extend_free(page, random);
    debug_assert!(immediate_available(page));
  }
}

/// Links up to a page worth of not yet used blocks into `free`.
pub(crate) unsafe fn extend_free(page: *mut Page, random: &mut usize) {
  unsafe {
    if (*page).capacity >= (*page).reserved {
      return;
    }
    let ctx = context(page);
    ctx.stats.pages_extended.increase(1);

    let bsize = (*page).block_size;
    let max_extend = if bsize >= MAX_EXTEND_SIZE {
      MIN_EXTEND
    } else {
      (MAX_EXTEND_SIZE / bsize).max(MIN_EXTEND)
    };
    let extend = ((*page).reserved - (*page).capacity) as usize;
    let extend = extend.min(max_extend);

    if extend < MIN_SLICES || !SECURE {
      free_list_extend(page, extend);
    } else {
      free_list_extend_secure(page, extend, random);
    }
    (*page).capacity += extend as u16;
    ctx.stats.page_committed.increase(extend * bsize);

    if !(*page).is_zero_init {
      (*page).is_zero = false;
    }
  }
}

unsafe fn free_list_extend(page: *mut Page, extend: usize) {
  unsafe {
    let view = block_view(page);
    let bsize = (*page).block_size;
    let (start, _) = area(page);
    let first = start.add((*page).capacity as usize * bsize).cast::<Block>();
    let last = first.byte_add((extend - 1) * bsize);
    let mut block = first;
    while block < last {
      let next = block.byte_add(bsize);
      view.set_next(block, next);
      block = next;
    }
    view.set_next(last, (*page).free);
    (*page).free = first;
  }
}

/// Threads the new blocks through up to [`MAX_SLICES`] interleaved runs in a
/// pseudo-random order so neighbouring allocations are not adjacent.
unsafe fn free_list_extend_secure(page: *mut Page, extend: usize, random: &mut usize) {
  unsafe {
    let view = block_view(page);
    let bsize = (*page).block_size;
    let (start, _) = area(page);

    let mut shift = MAX_SLICE_SHIFT;
    while extend >> shift == 0 {
      shift -= 1;
    }
    let slice_count = 1 << shift;
    let slice_extend = extend / slice_count;

    let mut blocks = [null_mut::<Block>(); MAX_SLICES];
    let mut counts = [0usize; MAX_SLICES];
    for i in 0..slice_count {
      let index = (*page).capacity as usize + i * slice_extend;
      blocks[i] = start.add(index * bsize).cast();
      counts[i] = slice_extend;
    }
    counts[slice_count - 1] += extend % slice_count;

    *random = shuffle(*random);
    let r = *random;
    let mut current = r % slice_count;
    counts[current] -= 1;
    let free_start = blocks[current];
    let mut rnd = shuffle(r | 1);
    for i in 1..extend {
      let round = i % WORD_SIZE;
      if round == 0 {
        rnd = shuffle(rnd);
      }
      let mut next = (rnd >> (8 * round)) & (slice_count - 1);
      while counts[next] == 0 {
        next += 1;
        if next == slice_count {
          next = 0;
        }
      }
      counts[next] -= 1;
      let block = blocks[current];
      blocks[current] = block.byte_add(bsize);
      view.set_next(block, blocks[next]);
      current = next;
    }
    view.set_next(blocks[current], (*page).free);
    (*page).free = free_start;
  }
}

// =============================================================================
// Collection
// =============================================================================

/// Moves the cross-thread frees onto `local_free`, keeping the delayed state.
unsafe fn thread_free_collect(page: *mut Page) {
  unsafe {
    let mut tfree = (*page).thread_free.load(Ordering::Relaxed);
    loop {
      let cleared = tfree.with_block(null_mut());
      match (*page).thread_free.compare_exchange_weak(tfree, cleared, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => break,
        Err(current) => tfree = current,
      }
    }
    let head = tfree.block();
    if head.is_null() {
      return;
    }

    let view = block_view(page);
    let max = (*page).capacity as usize;
    let mut count = 1;
    let mut tail = head;
    loop {
      let next = view.next(tail);
      if next.is_null() || count > max {
        break;
      }
      count += 1;
      tail = next;
    }
    if count > max {
      context(page).report(AllocError::CorruptFreeList {
        page: page.addr(),
        count,
        capacity: max,
      });
      return;
    }

    view.set_next(tail, (*page).local_free);
    (*page).local_free = head;
    (*page).used -= count;
  }
}

/// Collects `thread_free` and `local_free` into `free`. Appending to a
/// non-empty `free` list is linear, so it only happens when `force` is set.
pub(crate) unsafe fn free_collect(page: *mut Page, force: bool) {
  unsafe {
    if force || !(*page).thread_free.load(Ordering::Relaxed).block().is_null() {
      thread_free_collect(page);
    }
    if (*page).local_free.is_null() {
      return;
    }
    if (*page).free.is_null() {
      (*page).free = (*page).local_free;
      (*page).local_free = null_mut();
      (*page).is_zero = false;
    } else if force {
      let view = block_view(page);
      let mut tail = (*page).local_free;
      loop {
        let next = view.next(tail);
        if next.is_null() {
          break;
        }
        tail = next;
      }
      view.set_next(tail, (*page).free);
      (*page).free = (*page).local_free;
      (*page).local_free = null_mut();
      (*page).is_zero = false;
    }
  }
}

// =============================================================================
// Delayed free state
// =============================================================================

/// Sets the delayed state, waiting out any in-flight delayed free.
pub(crate) unsafe fn use_delayed_free(page: *mut Page, delay: Delayed, override_never: bool) {
  unsafe {
    while !try_use_delayed_free(page, delay, override_never) {
      std::thread::yield_now();
    }
  }
}

/// Like [`use_delayed_free`] but gives up after a few yields while another
/// thread is mid delayed free.
pub(crate) unsafe fn try_use_delayed_free(page: *mut Page, delay: Delayed, override_never: bool) -> bool {
  let mut yields = 0;
  loop {
    let tfree = unsafe { (*page).thread_free.load(Ordering::Acquire) };
    let old = tfree.delayed();
    if old == Delayed::DelayedFreeing {
      if yields >= 4 {
        return false;
      }
      yields += 1;
      std::thread::yield_now();
      continue;
    }
    if old == delay || (!override_never && old == Delayed::NeverDelayedFree) {
      return true;
    }
    let updated = tfree.with_delayed(delay);
    let swapped = unsafe {
      (*page)
        .thread_free
        .compare_exchange_weak(tfree, updated, Ordering::Release, Ordering::Relaxed)
    };
    if swapped.is_ok() {
      return true;
    }
  }
}

// =============================================================================
// Queue transitions
// =============================================================================

/// Moves an exhausted page to the heap's full queue.
pub(crate) unsafe fn to_full(heap: *mut Heap, page: *mut Page) {
  unsafe {
    if is_in_full(page) {
      return;
    }
    use_delayed_free(page, Delayed::UseDelayedFree, false);
    page_queue::queue_enqueue_from(heap, BIN_FULL, (*page).bin as usize, page);
    // A thread may have freed into the page before the delayed state was set.
    free_collect(page, false);
  }
}

/// Moves a page from the full queue back to its size class queue.
pub(crate) unsafe fn unfull(page: *mut Page) {
  unsafe {
    if !is_in_full(page) {
      return;
    }
    let heap = (*page).heap.load(Ordering::Relaxed);
    use_delayed_free(page, Delayed::NoDelayedFree, false);
    page_queue::queue_enqueue_from(heap, (*page).bin as usize, BIN_FULL, page);
  }
}

/// Adopts a page of an abandoned segment into `heap`.
pub(crate) unsafe fn reclaim(heap: *mut Heap, page: *mut Page) {
  unsafe {
    use_delayed_free(page, Delayed::NoDelayedFree, true);
    page_queue::queue_push(heap, (*page).bin as usize, page);
  }
}

/// Detaches a page that still has live blocks from a dying heap. The heap
/// must already have drained its delayed list of blocks from this page.
pub(crate) unsafe fn abandon(heap: *mut Heap, page: *mut Page) {
  unsafe {
    debug_assert_eq!((*page).thread_free.load(Ordering::Relaxed).delayed(), Delayed::NeverDelayedFree);
    page_queue::queue_remove(heap, page_queue::queue_of(page), page);
    segment::page_abandon(page, &mut (*heap).segments);
  }
}

/// Returns a page without live blocks to its segment.
pub(crate) unsafe fn free(heap: *mut Heap, page: *mut Page, force: bool) {
  unsafe {
    debug_assert!(all_free(page));
    set_has_aligned(page, false);
    page_queue::queue_remove(heap, page_queue::queue_of(page), page);
    segment::page_free(page, force, &mut (*heap).segments);
  }
}

/// Called when the last block of a page is freed. The only page of a size
/// class is kept around for a few allocation cycles instead of freed, so a
/// free/malloc ping-pong does not churn through segments.
pub(crate) unsafe fn retire(page: *mut Page) {
  unsafe {
    set_has_aligned(page, false);
    let heap = (*page).heap.load(Ordering::Relaxed);
    let bin = page_queue::queue_of(page);
    if (*page).block_size <= LARGE_OBJ_SIZE_MAX && bin != BIN_FULL {
      let queue = &(*heap).pages[bin];
      if queue.first == page && queue.last == page {
        context(page).stats.page_no_retire.increase(1);
        (*page).retire_expire = if (*page).block_size <= SMALL_OBJ_SIZE_MAX {
          RETIRE_CYCLES
        } else {
          RETIRE_CYCLES / 4
        };
        (*heap).retired_min = (*heap).retired_min.min(bin);
        (*heap).retired_max = (*heap).retired_max.max(bin);
        return;
      }
    }
    free(heap, page, false);
  }
}

// =============================================================================
// Double free detection
// =============================================================================

/// Reports and returns true if `block` is already on one of the page's free
/// lists. Only runs in debug or `secure` builds.
#[inline]
pub(crate) unsafe fn check_double_free(page: *const Page, block: *const Block) -> bool {
  if !(cfg!(debug_assertions) || SECURE) {
    return false;
  }
  unsafe {
    let view = block_view(page);
    let next = view.next(block);
    let (start, size) = area(page);
    let bsize = (*page).block_size;
    let in_page = next.addr() >= start.addr()
      && next.addr() < start.addr() + size
      && (next.addr() - start.addr()) % bsize == 0;
    // A free block's link is null or points at another block of this page.
    if !next.is_null() && !in_page {
      return false;
    }
    let max = (*page).capacity as usize;
    let thread_head = (*page).thread_free.load(Ordering::Acquire).block();
    let found = view.contains((*page).free, block, max)
      || view.contains((*page).local_free, block, max)
      || view.contains(thread_head, block, max);
    if found {
      context(page).report(AllocError::DoubleFree {
        block: block.addr(),
        block_size: bsize,
      });
    }
    found
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;
  use std::sync::atomic::AtomicUsize;

  use crate::options::Options;

  #[test]
  fn test_thread_free_packs_delay_state() {
    let mut word = 0usize;
    let block = (&raw mut word).cast::<Block>();
    let tf = ThreadFree::new(block, Delayed::UseDelayedFree);
    assert_eq!(tf.block(), block);
    assert_eq!(tf.delayed(), Delayed::UseDelayedFree);

    let tf = tf.with_delayed(Delayed::NeverDelayedFree);
    assert_eq!(tf.block(), block);
    assert_eq!(tf.delayed(), Delayed::NeverDelayedFree);

    let tf = tf.with_block(null_mut());
    assert!(tf.block().is_null());
    assert_eq!(tf.delayed(), Delayed::NeverDelayedFree);
  }

  #[test]
  fn test_atomic_thread_free_cas() {
    let atomic = AtomicThreadFree::new();
    let empty = atomic.load(Ordering::Relaxed);
    assert_eq!(empty.delayed(), Delayed::NoDelayedFree);
    let flagged = empty.with_delayed(Delayed::DelayedFreeing);
    assert!(
      atomic
        .compare_exchange_weak(empty, flagged, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
        || atomic.load(Ordering::Relaxed) == empty
    );
  }

  #[test]
  fn test_block_view_links_and_counts() {
    let mut words = [0usize; 4];
    let base = words.as_mut_ptr().cast::<Block>();
    let view = BlockView::new(0x5a5a_5a5a);
    unsafe {
      view.set_next(base, base.add(1));
      view.set_next(base.add(1), base.add(2));
      view.set_next(base.add(2), null_mut());
      assert_eq!(view.next(base), base.add(1));
      assert_eq!(view.count(base, 8), Some(3));
      assert_eq!(view.count(base, 2), None);
      assert!(view.contains(base, base.add(2), 8));
      assert!(!view.contains(base, base.add(3), 8));
    }
  }

  #[test]
  fn test_page_counts_consistency() {
    let counts = PageCounts {
      block_size: 64,
      capacity: 10,
      reserved: 16,
      used: 6,
      free: 3,
      local_free: 1,
      thread_free: 2,
    };
    assert_eq!(counts.live(), 4);
    assert!(counts.is_consistent());
    assert!(!PageCounts { free: 4, ..counts }.is_consistent());
  }

  #[test]
  fn test_secure_extend_links_each_new_block_once() {
    let ctx = AllocatorContext::leak(Options::default());
    let mut heap = Heap::new(ctx);
    let p = heap.malloc(64);
    assert!(!p.is_null());
    unsafe {
      let page = segment::page_of(segment::ptr_segment(p), p);
      let old_cap = (*page).capacity as usize;
      assert!(old_cap < (*page).reserved as usize);
      let extend = ((*page).reserved as usize - old_cap).min(64);
      let old_free = (*page).free;
      (*page).free = null_mut();

      let mut random = 0x9e37_79b9usize;
      free_list_extend_secure(page, extend, &mut random);
      (*page).capacity += extend as u16;

      let view = block_view(page);
      let (start, _) = area(page);
      let bsize = (*page).block_size;
      let mut seen = BTreeSet::new();
      let mut tail = null_mut();
      let mut block = (*page).free;
      while !block.is_null() {
        let offset = block.addr() - start.addr();
        assert_eq!(offset % bsize, 0);
        assert!(seen.insert(offset / bsize));
        assert!(seen.len() <= extend);
        tail = block;
        block = view.next(block);
      }
      assert_eq!(seen, (old_cap..old_cap + extend).collect::<BTreeSet<_>>());

      view.set_next(tail, old_free);
      crate::alloc::free(p);
    }
  }

  #[test]
  fn test_cyclic_thread_free_is_reported() {
    static CORRUPT: AtomicUsize = AtomicUsize::new(0);
    fn handler(err: &AllocError) {
      if matches!(err, AllocError::CorruptFreeList { .. }) {
        CORRUPT.fetch_add(1, Ordering::Relaxed);
      }
    }
    let ctx = AllocatorContext::leak(Options {
      show_errors: false,
      ..Options::default()
    });
    ctx.set_error_handler(Some(handler));
    let mut heap = Heap::new(ctx);
    let a = heap.malloc(48);
    let b = heap.malloc(48);
    unsafe {
      let page = segment::page_of(segment::ptr_segment(a), a);
      assert_eq!(page, segment::page_of(segment::ptr_segment(b), b));
      let view = block_view(page);
      let (a_block, b_block) = (a.cast::<Block>(), b.cast::<Block>());
      view.set_next(a_block, b_block);
      view.set_next(b_block, a_block);
      let mut current = (*page).thread_free.load(Ordering::Relaxed);
      let forged = ThreadFree::new(a_block, current.delayed());
      while let Err(seen) =
        (*page).thread_free.compare_exchange_weak(current, forged, Ordering::AcqRel, Ordering::Relaxed)
      {
        current = seen;
      }

      free_collect(page, true);
      assert_eq!(CORRUPT.load(Ordering::Relaxed), 1);
      assert!((*page).thread_free.load(Ordering::Relaxed).block().is_null());
      assert_eq!((*page).used, 2);

      crate::alloc::free(a);
      crate::alloc::free(b);
    }
    assert_eq!(heap.used_blocks(), 0);
  }
}
