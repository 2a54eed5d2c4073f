//! Size classes ("bins") and the per-heap doubly linked page queues.

use core::ptr::null_mut;

use crate::heap::Heap;
use crate::page::{self, Page};
use crate::{LARGE_OBJ_SIZE_MAX, LARGE_OBJ_WSIZE_MAX, SMALL_SIZE_MAX, WORD_SIZE, wsize_from_size};

// =============================================================================
// Bins
// =============================================================================

/// Bin holding sizes above [`LARGE_OBJ_SIZE_MAX`]; never has queued pages.
pub(crate) const BIN_HUGE: usize = raw_bin(LARGE_OBJ_WSIZE_MAX) + 1;
/// Queue of pages without free blocks.
pub(crate) const BIN_FULL: usize = BIN_HUGE + 1;

const _: () = assert!(bin_block_size(BIN_HUGE - 1) == LARGE_OBJ_SIZE_MAX);
const _: () = assert!(BIN_FULL < u8::MAX as usize);

/// Exact bins up to 8 words, then four bins per power of two.
const fn raw_bin(wsize: usize) -> usize {
  if wsize <= 1 {
    1
  } else if wsize <= 8 {
    wsize
  } else {
    let w = wsize - 1;
    let b = (usize::BITS - 1 - w.leading_zeros()) as usize;
    ((b << 2) + ((w >> (b - 2)) & 0b11)) - 3
  }
}

#[inline]
pub(crate) const fn bin(size: usize) -> usize {
  let wsize = wsize_from_size(size);
  if wsize > LARGE_OBJ_WSIZE_MAX {
    BIN_HUGE
  } else {
    raw_bin(wsize)
  }
}

/// Largest size served by `bin`.
pub(crate) const fn bin_block_size(bin: usize) -> usize {
  if bin == 0 {
    WORD_SIZE
  } else if bin <= 8 {
    bin * WORD_SIZE
  } else if bin == BIN_HUGE {
    LARGE_OBJ_SIZE_MAX + WORD_SIZE
  } else if bin == BIN_FULL {
    LARGE_OBJ_SIZE_MAX + 2 * WORD_SIZE
  } else {
    let t = bin + 3;
    let b = t >> 2;
    let s = t & 0b11;
    ((5 + s) << (b - 2)) * WORD_SIZE
  }
}

// =============================================================================
// Queues
// =============================================================================

#[derive(Clone, Copy)]
pub(crate) struct PageQueue {
  pub(crate) first: *mut Page,
  pub(crate) last: *mut Page,
  pub(crate) block_size: usize,
}

impl PageQueue {
  const fn new(block_size: usize) -> Self {
    Self {
      first: null_mut(),
      last: null_mut(),
      block_size,
    }
  }

  pub(crate) const fn is_empty(&self) -> bool {
    self.first.is_null()
  }
}

pub(crate) const fn initial_queues() -> [PageQueue; BIN_FULL + 1] {
  let mut queues = [PageQueue::new(0); BIN_FULL + 1];
  let mut bin = 0;
  while bin <= BIN_FULL {
    queues[bin] = PageQueue::new(bin_block_size(bin));
    bin += 1;
  }
  queues
}

/// Queue a page currently belongs to.
#[inline]
pub(crate) unsafe fn queue_of(page: *const Page) -> usize {
  unsafe {
    if page::is_in_full(page) {
      BIN_FULL
    } else {
      (*page).bin as usize
    }
  }
}

/// Points the direct small-size lookup entries served by `bin` at the
/// queue's first page.
unsafe fn update_direct(heap: *mut Heap, bin: usize) {
  unsafe {
    let size = (*heap).pages[bin].block_size;
    if size > SMALL_SIZE_MAX {
      return;
    }
    let page = (*heap).pages[bin].first;
    let idx = wsize_from_size(size);
    if (*heap).pages_free_direct[idx] == page {
      return;
    }
    let start = if idx <= 1 {
      0
    } else {
      (1 + wsize_from_size((*heap).pages[bin - 1].block_size)).min(idx)
    };
    for slot in &mut (&mut (*heap).pages_free_direct)[start..=idx] {
      *slot = page;
    }
  }
}

pub(crate) unsafe fn queue_push(heap: *mut Heap, bin: usize, page: *mut Page) {
  unsafe {
    page::set_in_full(page, bin == BIN_FULL);
    (*page).heap.store(heap, core::sync::atomic::Ordering::Release);
    let queue = &mut (*heap).pages[bin];
    (*page).next = queue.first;
    (*page).prev = null_mut();
    if queue.first.is_null() {
      queue.last = page;
    } else {
      (*queue.first).prev = page;
    }
    queue.first = page;
    update_direct(heap, bin);
    (*heap).page_count += 1;
  }
}

/// Unlinks a page and clears its owner and full flag.
pub(crate) unsafe fn queue_remove(heap: *mut Heap, bin: usize, page: *mut Page) {
  unsafe {
    unlink(heap, bin, page);
    (*heap).page_count -= 1;
    (*page).next = null_mut();
    (*page).prev = null_mut();
    (*page).heap.store(null_mut(), core::sync::atomic::Ordering::Release);
    page::set_in_full(page, false);
  }
}

/// Moves a page from the `from` queue to the back of the `to` queue.
pub(crate) unsafe fn queue_enqueue_from(heap: *mut Heap, to: usize, from: usize, page: *mut Page) {
  unsafe {
    unlink(heap, from, page);
    let queue = &mut (*heap).pages[to];
    (*page).prev = queue.last;
    (*page).next = null_mut();
    if queue.last.is_null() {
      queue.first = page;
      queue.last = page;
      update_direct(heap, to);
    } else {
      (*queue.last).next = page;
      queue.last = page;
    }
    page::set_in_full(page, to == BIN_FULL);
  }
}

unsafe fn unlink(heap: *mut Heap, bin: usize, page: *mut Page) {
  unsafe {
    debug_assert!(queue_contains(heap, bin, page), "page {page:p} is not in queue {bin}");
    if !(*page).prev.is_null() {
      (*(*page).prev).next = (*page).next;
    }
    if !(*page).next.is_null() {
      (*(*page).next).prev = (*page).prev;
    }
    let queue = &mut (*heap).pages[bin];
    if page == queue.last {
      queue.last = (*page).prev;
    }
    if page == queue.first {
      queue.first = (*page).next;
      update_direct(heap, bin);
    }
  }
}

#[cfg(debug_assertions)]
unsafe fn queue_contains(heap: *mut Heap, bin: usize, page: *mut Page) -> bool {
  unsafe {
    let mut cursor = (*heap).pages[bin].first;
    while !cursor.is_null() {
      if cursor == page {
        return true;
      }
      cursor = (*cursor).next;
    }
    false
  }
}

#[cfg(not(debug_assertions))]
#[inline(always)]
unsafe fn queue_contains(_heap: *mut Heap, _bin: usize, _page: *mut Page) -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_small_bins_are_exact() {
    assert_eq!(bin(0), 1);
    assert_eq!(bin(1), 1);
    assert_eq!(bin(WORD_SIZE), 1);
    assert_eq!(bin(WORD_SIZE + 1), 2);
    assert_eq!(bin(8 * WORD_SIZE), 8);
  }

  #[test]
  fn test_block_size_covers_bin() {
    for size in 1..=(64 * 1024) {
      let b = bin(size);
      assert!(bin_block_size(b) >= size, "size {size} bin {b}");
      if b > 1 {
        assert!(bin_block_size(b - 1) < size, "size {size} fits a smaller bin");
      }
    }
  }

  #[test]
  fn test_bins_are_monotonic() {
    for b in 1..BIN_HUGE - 1 {
      assert!(bin_block_size(b) < bin_block_size(b + 1));
      assert_eq!(bin(bin_block_size(b)), b);
    }
  }

  #[test]
  fn test_huge_bin() {
    assert_eq!(bin(LARGE_OBJ_SIZE_MAX), BIN_HUGE - 1);
    assert_eq!(bin(LARGE_OBJ_SIZE_MAX + 1), BIN_HUGE);
  }

  #[test]
  fn test_initial_queues_have_block_sizes() {
    let queues = initial_queues();
    assert!(queues.iter().all(PageQueue::is_empty));
    assert_eq!(queues[1].block_size, WORD_SIZE);
    assert!(queues[BIN_FULL].block_size > queues[BIN_HUGE].block_size);
  }
}
