//! Process-level entry points: the per-thread heap, `free`, and the
//! `GlobalAlloc` and C front ends.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, null_mut};
use core::sync::atomic::Ordering;

use crate::context::AllocatorContext;
use crate::error::AllocError;
use crate::heap::{self, Collect, Heap};
use crate::page::{self, Block, BlockView, Delayed, Page};
use crate::random::ptr_cookie;
use crate::segment::{self, PageKind, Segment};
use crate::{ALIGNMENT_MAX, MAX_ALIGN_SIZE, SECURE};

// =============================================================================
// TLS
// =============================================================================

struct ThreadHeap(Option<Heap>);

impl Drop for ThreadHeap {
  fn drop(&mut self) {
    // Frees made while the heap abandons its pages must not re-enter it.
    let _ = IN_HEAP.try_with(|flag| flag.set(true));
    self.0.take();
  }
}

thread_local! {
  static HEAP: UnsafeCell<ThreadHeap> = const { UnsafeCell::new(ThreadHeap(None)) };
  static IN_HEAP: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is inside an operation on its own heap, or
/// past the point where its heap can be used at all.
#[inline]
fn in_heap() -> bool {
  IN_HEAP.try_with(Cell::get).unwrap_or(true)
}

/// Runs `f` on the calling thread's heap, creating it on first use. Returns
/// `None` on re-entry (an allocation made while the heap is busy, for
/// instance by a logger) or once the thread's TLS is being destroyed.
fn with_heap<R, F: FnOnce(&mut Heap) -> R>(f: F) -> Option<R> {
  let Ok(busy) = IN_HEAP.try_with(|flag| flag.replace(true)) else {
    return None;
  };
  if busy {
    return None;
  }
  let result = HEAP
    .try_with(|cell| {
      let slot = unsafe { &mut *cell.get() };
      let heap = slot.0.get_or_insert_with(|| Heap::init(AllocatorContext::global()));
      f(heap)
    })
    .ok();
  let _ = IN_HEAP.try_with(|flag| flag.set(false));
  result
}

// =============================================================================
// Allocation
// =============================================================================

/// Allocates `size` bytes from the calling thread's heap. Returns null when
/// memory is exhausted.
#[inline]
pub fn allocate(size: usize) -> *mut u8 {
  with_heap(|heap| heap.malloc(size))
    .unwrap_or_else(|| heap::malloc_detached(AllocatorContext::global(), size, 0, false))
}

/// Like [`allocate`] but the memory is zeroed.
pub fn allocate_zeroed(size: usize) -> *mut u8 {
  with_heap(|heap| heap.zalloc(size))
    .unwrap_or_else(|| heap::malloc_detached(AllocatorContext::global(), size, 0, true))
}

/// Allocates `size` bytes aligned to `alignment`. Returns null when the
/// alignment is invalid or memory is exhausted.
pub fn allocate_aligned(size: usize, alignment: usize) -> *mut u8 {
  let result = with_heap(|heap| heap.try_malloc_aligned(size, alignment, false));
  match result {
    Some(Ok(p)) => p,
    Some(Err(err)) => {
      if !matches!(err, AllocError::OutOfMemory { .. }) {
        AllocatorContext::global().report(err);
      }
      null_mut()
    }
    None if alignment.is_power_of_two() && alignment <= ALIGNMENT_MAX => {
      heap::malloc_detached(AllocatorContext::global(), size, alignment, false)
    }
    None => null_mut(),
  }
}

/// Frees a block returned by [`allocate`]. `size` is the requested size and
/// only checked in debug builds.
///
/// # Safety
/// `p` must be null or a live block from this allocator.
pub unsafe fn deallocate(p: *mut u8, size: usize) {
  debug_assert!(p.is_null() || unsafe { usable_size(p) } >= size);
  unsafe { free(p) };
}

/// Live bytes across all threads. Threads publish their counts in batches,
/// so the figure lags until they next hit the slow path, collect or exit.
pub fn allocated_bytes() -> usize {
  let _ = with_heap(|heap| heap.flush_stats());
  AllocatorContext::global().allocated_bytes()
}

/// Releases unused memory held by the calling thread.
pub fn compact_current_thread() {
  let _ = with_heap(|heap| heap.collect(Collect::Force));
}

/// Releases unused memory held by the main thread: directly when called on
/// it, otherwise on its next slow-path allocation.
pub fn compact_main_thread() {
  let ctx = AllocatorContext::global();
  if ctx.is_main_thread(heap::thread_id()) {
    compact_current_thread();
  } else {
    ctx.request_main_compact();
  }
}

// =============================================================================
// Free
// =============================================================================

/// Checks that `segment` is one of ours; the cookie only matches for
/// segments this process initialized.
#[inline]
unsafe fn is_valid_segment(segment: *mut Segment, p: *mut u8) -> bool {
  if !(cfg!(debug_assertions) || SECURE) {
    return true;
  }
  if segment.is_null() {
    return false;
  }
  let valid = unsafe { (*segment).cookie == ptr_cookie(segment) };
  if !valid {
    AllocatorContext::global().report(AllocError::InvalidPointer { ptr: p.addr() });
  }
  valid
}

/// Frees a block from any heap, on any thread.
///
/// # Safety
/// `p` must be null or a live block from this allocator.
#[inline]
pub unsafe fn free(p: *mut u8) {
  if p.is_null() {
    return;
  }
  unsafe {
    let segment = segment::ptr_segment(p);
    if !is_valid_segment(segment, p) {
      return;
    }
    let page = segment::page_of(segment, p);
    let local = (*segment).thread_id.load(Ordering::Relaxed) == heap::thread_id() && !in_heap();
    if local && (*page).flags == 0 {
      let block = p.cast::<Block>();
      if page::check_double_free(page, block) {
        return;
      }
      let heap = (*page).heap.load(Ordering::Relaxed);
      (*heap).note_free((*page).bin as usize, (*page).block_size);
      push_local(page, block);
    } else {
      free_generic(segment, page, local, p);
    }
  }
}

/// Start of the block containing `p`, for pages that handed out interior
/// pointers to satisfy an alignment.
unsafe fn unalign(segment: *mut Segment, page: *const Page, p: *mut u8) -> *mut Block {
  unsafe {
    let (start, _) = segment::page_start(segment, page, (*page).block_size);
    let offset = p.addr() - start.addr();
    p.sub(offset % (*page).block_size).cast()
  }
}

#[cold]
unsafe fn free_generic(segment: *mut Segment, page: *mut Page, local: bool, p: *mut u8) {
  unsafe {
    let block = if page::has_aligned(page) {
      unalign(segment, page, p)
    } else {
      p.cast()
    };
    if local {
      if page::check_double_free(page, block) {
        return;
      }
      let heap = (*page).heap.load(Ordering::Relaxed);
      (*heap).note_free((*page).bin as usize, (*page).block_size);
      push_local(page, block);
    } else {
      free_block_mt(segment, page, block);
    }
  }
}

/// Owner-thread free: onto `local_free`, retiring or un-fulling the page.
unsafe fn push_local(page: *mut Page, block: *mut Block) {
  unsafe {
    page::block_view(page).set_next(block, (*page).local_free);
    (*page).local_free = block;
    (*page).used -= 1;
    if (*page).used == 0 {
      page::retire(page);
    } else if page::is_in_full(page) {
      page::unfull(page);
    }
  }
}

/// Free from a thread that does not own the page.
unsafe fn free_block_mt(segment: *mut Segment, page: *mut Page, block: *mut Block) {
  unsafe {
    if (*segment).page_kind == PageKind::Huge {
      segment::huge_page_free(segment, page, block);
      return;
    }
    let ctx = page::context(page);
    ctx.stats.malloc.decrease((*page).block_size);
    ctx.stats.normal[(*page).bin as usize].decrease(1);

    let view = page::block_view(page);
    let mut tfree = (*page).thread_free.load(Ordering::Relaxed);
    let use_delayed = loop {
      let use_delayed = tfree.delayed() == Delayed::UseDelayedFree;
      let updated = if use_delayed {
        tfree.with_delayed(Delayed::DelayedFreeing)
      } else {
        view.set_next(block, tfree.block());
        tfree.with_block(block)
      };
      match (*page)
        .thread_free
        .compare_exchange_weak(tfree, updated, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => break use_delayed,
        Err(current) => tfree = current,
      }
    };
    if !use_delayed {
      return;
    }

    // The page sits in its heap's full queue; hand the block to the heap so
    // the owner moves the page back itself.
    let heap = (*page).heap.load(Ordering::Acquire);
    if !heap.is_null() {
      let list = &(*heap).thread_delayed_free;
      let heap_view = BlockView::new((*heap).key);
      let mut head = list.load(Ordering::Relaxed);
      loop {
        heap_view.set_next(block, head);
        match list.compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed) {
          Ok(_) => break,
          Err(current) => head = current,
        }
      }
    }

    let mut tfree = (*page).thread_free.load(Ordering::Relaxed);
    loop {
      debug_assert_eq!(tfree.delayed(), Delayed::DelayedFreeing);
      let mut updated = tfree.with_delayed(Delayed::NoDelayedFree);
      if heap.is_null() {
        view.set_next(block, tfree.block());
        updated = updated.with_block(block);
      }
      match (*page)
        .thread_free
        .compare_exchange_weak(tfree, updated, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(current) => tfree = current,
      }
    }
  }
}

/// Frees a block taken off the owning heap's delayed list. Returns false if
/// the page is mid delayed free and the block should be retried later.
pub(crate) unsafe fn free_delayed_block(block: *mut Block) -> bool {
  unsafe {
    let segment = segment::ptr_segment(block);
    let page = segment::page_of(segment, block);
    if !page::try_use_delayed_free(page, Delayed::NoDelayedFree, false) {
      return false;
    }
    page::free_collect(page, false);
    push_local(page, block);
    true
  }
}

/// Bytes available in the block at `p`, at least the requested size.
///
/// # Safety
/// `p` must be null or a live block from this allocator.
pub unsafe fn usable_size(p: *const u8) -> usize {
  if p.is_null() {
    return 0;
  }
  unsafe {
    let segment = segment::ptr_segment(p);
    let page = segment::page_of(segment, p);
    let bsize = (*page).block_size;
    if page::has_aligned(page) {
      let block = unalign(segment, page, p.cast_mut());
      bsize - (p.addr() - block.addr())
    } else {
      bsize
    }
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The allocator as a Rust global allocator:
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: segmalloc::Allocator = segmalloc::Allocator;
/// ```
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  #[inline]
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MAX_ALIGN_SIZE && layout.size() % layout.align() == 0 {
      allocate(layout.size())
    } else {
      allocate_aligned(layout.size(), layout.align())
    }
  }

  #[inline]
  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) };
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MAX_ALIGN_SIZE && layout.size() % layout.align() == 0 {
      return allocate_zeroed(layout.size());
    }
    let p = allocate_aligned(layout.size(), layout.align());
    if !p.is_null() {
      unsafe { ptr::write_bytes(p, 0, layout.size()) };
    }
    p
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let size = unsafe { usable_size(ptr) };
    if new_size <= size && new_size >= size / 2 && ptr.addr() % layout.align() == 0 {
      return ptr;
    }
    let fresh = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
        free(ptr);
      }
    }
    fresh
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use super::*;

  #[cfg(target_os = "linux")]
  fn set_errno(code: i32) {
    unsafe { *libc::__errno_location() = code };
  }

  #[cfg(not(target_os = "linux"))]
  fn set_errno(_code: i32) {}

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    let p = allocate(size);
    if p.is_null() {
      set_errno(AllocError::OutOfMemory { size }.errno());
    }
    p
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { super::free(ptr) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      set_errno(AllocError::OutOfMemory { size: usize::MAX }.errno());
      return null_mut();
    };
    let p = allocate_zeroed(total);
    if p.is_null() {
      set_errno(AllocError::OutOfMemory { size: total }.errno());
    }
    p
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe { malloc(size) };
    }
    if size == 0 {
      unsafe { super::free(ptr) };
      return null_mut();
    }
    let old = unsafe { usable_size(ptr) };
    if size <= old && size >= old / 2 {
      return ptr;
    }
    let fresh = unsafe { malloc(size) };
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, old.min(size));
        super::free(ptr);
      }
    }
    fresh
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() || alignment > ALIGNMENT_MAX {
      return AllocError::InvalidArgument {
        reason: "alignment is not a supported power of two",
      }
      .errno();
    }
    let p = allocate_aligned(size, alignment);
    if p.is_null() {
      return AllocError::OutOfMemory { size }.errno();
    }
    unsafe { *memptr = p };
    0
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    unsafe { usable_size(ptr) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_allocate_and_free_on_thread_heap() {
    let p = allocate(100);
    assert!(!p.is_null());
    unsafe {
      ptr::write_bytes(p, 0x11, 100);
      assert!(usable_size(p) >= 100);
      deallocate(p, 100);
    }
  }

  #[test]
  fn test_free_null_is_noop() {
    unsafe {
      free(null_mut());
      deallocate(null_mut(), 0);
    }
    assert_eq!(unsafe { usable_size(ptr::null()) }, 0);
  }

  #[test]
  fn test_reentrant_allocation_is_detached() {
    let inner = with_heap(|_| allocate(64)).unwrap();
    assert!(!inner.is_null());
    let segment = segment::ptr_segment(inner);
    assert_eq!(unsafe { (*segment).page_kind }, PageKind::Huge);
    unsafe { free(inner) };
  }

  #[test]
  fn test_detached_path_rejects_oversized_requests() {
    let p = with_heap(|_| allocate(usize::MAX - 64)).unwrap();
    assert!(p.is_null());
    let p = with_heap(|_| allocate_aligned(usize::MAX - 4096, 4096)).unwrap();
    assert!(p.is_null());
  }

  #[cfg(any(debug_assertions, feature = "secure"))]
  #[test]
  fn test_foreign_pointer_is_reported() {
    use crate::SEGMENT_SIZE;
    use std::alloc::System;

    let ctx = AllocatorContext::global();
    let layout = Layout::from_size_align(SEGMENT_SIZE, SEGMENT_SIZE).unwrap();
    let foreign = unsafe { System.alloc_zeroed(layout) };
    assert!(!foreign.is_null());
    let before = ctx.error_count();
    unsafe { free(foreign.add(256)) };
    assert!(ctx.error_count() > before);
    unsafe { System.dealloc(foreign, layout) };
  }

  #[test]
  fn test_aligned_usable_size_is_from_pointer() {
    let p = allocate_aligned(3000, 4096);
    assert_eq!(p.addr() % 4096, 0);
    unsafe {
      assert!(usable_size(p) >= 3000);
      free(p);
    }
  }

  #[test]
  fn test_cross_thread_free() {
    let blocks: Vec<usize> = (0..1000).map(|i| allocate(16 + i % 200).expose_provenance()).collect();
    std::thread::spawn(move || {
      for addr in blocks {
        unsafe { free(ptr::with_exposed_provenance_mut(addr)) };
      }
    })
    .join()
    .unwrap();
    let reused = allocate(16);
    assert!(!reused.is_null());
    unsafe { free(reused) };
  }

  #[test]
  fn test_global_alloc_layouts() {
    let a = Allocator;
    unsafe {
      let layout = Layout::from_size_align(48, 64).unwrap();
      let p = a.alloc_zeroed(layout);
      assert_eq!(p.addr() % 64, 0);
      assert!(core::slice::from_raw_parts(p, 48).iter().all(|&b| b == 0));
      let q = a.realloc(p, layout, 5000);
      assert_eq!(q.addr() % 64, 0);
      a.dealloc(q, Layout::from_size_align(5000, 64).unwrap());
    }
  }
}
