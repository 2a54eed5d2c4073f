//! End-to-end allocator behavior on independent contexts.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::Rng;
use rand::seq::SliceRandom;
use segmalloc::{AllocError, AllocatorContext, Collect, Heap, LARGE_OBJ_SIZE_MAX, Options, SEGMENT_SIZE, free};

fn context() -> &'static AllocatorContext {
  AllocatorContext::leak(Options {
    show_errors: false,
    ..Options::default()
  })
}

fn segment_of(p: *const u8) -> usize {
  p.addr() & !(SEGMENT_SIZE - 1)
}

fn expose(p: *mut u8) -> usize {
  p.expose_provenance()
}

fn restore(addr: usize) -> *mut u8 {
  ptr::with_exposed_provenance_mut(addr)
}

#[test]
fn test_freed_small_blocks_are_reused_without_os_calls() {
  let ctx = context();
  let mut heap = Heap::new(ctx);

  let first: Vec<*mut u8> = (0..1000).map(|_| heap.malloc(24)).collect();
  assert!(first.iter().all(|p| !p.is_null()));
  let segments: HashSet<usize> = first.iter().map(|&p| segment_of(p)).collect();
  for &p in first.iter().rev() {
    unsafe { free(p) };
  }
  assert_eq!(heap.used_blocks(), 0);

  let mmaps = ctx.stats().mmap_calls.count();
  let commits = ctx.stats().commit_calls.count();
  let pages = ctx.stats().pages.current();

  let second: Vec<*mut u8> = (0..1000).map(|_| heap.malloc(24)).collect();
  for &p in &second {
    assert!(segments.contains(&segment_of(p)), "block {p:p} came from a new segment");
    assert!(heap.contains_block(p));
  }
  assert_eq!(ctx.stats().mmap_calls.count(), mmaps);
  assert_eq!(ctx.stats().commit_calls.count(), commits);
  assert_eq!(ctx.stats().pages.current(), pages);

  for p in second {
    unsafe { free(p) };
  }
}

#[test]
fn test_huge_block_freed_on_another_thread() {
  let ctx = context();
  let mut heap = Heap::new(ctx);
  let size = 16 * 1024 * 1024;
  assert!(size > LARGE_OBJ_SIZE_MAX);

  let p = heap.malloc(size);
  assert!(!p.is_null());
  unsafe {
    ptr::write_bytes(p, 0xc3, size);
    assert!(segmalloc::usable_size(p) >= size);
  }
  assert_eq!(ctx.stats().huge_count.count(), 1);
  assert_eq!(ctx.stats().segments.current(), 1);
  // Huge blocks are not tracked by the heap's page queues.
  assert_eq!(heap.used_blocks(), 0);

  let addr = expose(p);
  thread::spawn(move || unsafe { free(restore(addr)) }).join().unwrap();

  assert_eq!(ctx.stats().huge.current(), 0);
  assert_eq!(ctx.stats().segments.current(), 0);
  assert_eq!(ctx.stats().pages.current(), 0);
  assert_eq!(ctx.region_blocks_in_use(), 0);
  ctx.collect_regions();
  assert_eq!(ctx.stats().reserved.current(), 0);
}

#[test]
fn test_concurrent_random_sizes_balance_out() {
  const THREADS: usize = 8;
  const OPS: usize = 10_000;
  let ctx = context();
  let shared: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

  let handles: Vec<_> = (0..THREADS)
    .map(|_| {
      let shared = Arc::clone(&shared);
      thread::spawn(move || {
        let mut heap = Heap::new(ctx);
        let mut rng = rand::thread_rng();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for _ in 0..OPS {
          match rng.gen_range(0..10) {
            0..=5 => {
              let size = rng.gen_range(8..=4096);
              let p = heap.malloc(size);
              assert!(!p.is_null());
              unsafe { p.write_bytes(size as u8, size.min(64)) };
              live.push((expose(p), size));
            }
            6..=8 if !live.is_empty() => {
              let i = rng.gen_range(0..live.len());
              let (addr, size) = live.swap_remove(i);
              let p = restore(addr);
              assert_eq!(unsafe { p.read() }, size as u8);
              unsafe { free(p) };
            }
            _ => {
              // Hand a block to whichever thread frees next.
              if let Some((addr, _)) = live.pop() {
                shared.lock().unwrap().push(addr);
              }
              if let Some(addr) = shared.lock().unwrap().pop() {
                unsafe { free(restore(addr)) };
              }
            }
          }
        }
        live.shuffle(&mut rng);
        for (addr, _) in live {
          unsafe { free(restore(addr)) };
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }
  for addr in shared.lock().unwrap().drain(..) {
    unsafe { free(restore(addr)) };
  }

  assert_eq!(ctx.allocated_bytes(), 0);
  assert_eq!(ctx.stats().threads.current(), 0);
  for bin in &ctx.stats().normal {
    assert_eq!(bin.current(), 0);
  }
}

#[test]
fn test_abandoned_blocks_are_reclaimed_by_another_thread() {
  let ctx = context();

  let blocks: Vec<usize> = thread::spawn(move || {
    let mut heap = Heap::new(ctx);
    let blocks: Vec<usize> = (0..50)
      .map(|i| {
        let p = heap.malloc(64);
        unsafe { p.write_bytes(i as u8, 64) };
        expose(p)
      })
      .collect();
    assert_eq!(heap.used_blocks(), 50);
    blocks
    // The heap drops here and abandons its segment.
  })
  .join()
  .unwrap();

  assert_eq!(ctx.abandoned_count(), 1);
  assert_eq!(ctx.stats().segments_abandoned.current(), 1);

  let mut heap = Heap::new(ctx);
  heap.set_no_reclaim(true);
  assert!(heap.try_reclaim_abandoned(true));
  assert_eq!(ctx.abandoned_count(), 0);
  assert_eq!(heap.used_blocks(), 50);

  for (i, &addr) in blocks.iter().enumerate() {
    let p = restore(addr);
    assert!(heap.contains_block(p));
    let bytes = unsafe { std::slice::from_raw_parts(p, 64) };
    assert!(bytes.iter().all(|&b| b == i as u8));
  }
  for addr in blocks {
    unsafe { free(restore(addr)) };
  }
  assert_eq!(heap.used_blocks(), 0);
  heap.collect(Collect::Force);
  assert_eq!(ctx.stats().pages.current(), 0);
}

#[test]
fn test_page_counts_hold_with_pending_remote_frees() {
  let ctx = context();
  let mut heap = Heap::new(ctx);
  let blocks: Vec<usize> = (0..2000).map(|i| expose(heap.malloc(16 + (i % 5) * 48))).collect();

  let remote: Vec<usize> = blocks.iter().copied().step_by(2).collect();
  thread::spawn(move || {
    for addr in remote {
      unsafe { free(restore(addr)) };
    }
  })
  .join()
  .unwrap();

  let mut pages = 0;
  heap.visit_pages(|counts| {
    pages += 1;
    assert!(counts.is_consistent(), "{counts:?}");
  });
  assert!(pages > 0);

  // Frees into full pages may still sit on the heap's delayed list.
  heap.collect(Collect::Normal);
  heap.visit_pages(|counts| assert!(counts.is_consistent(), "{counts:?}"));
  assert_eq!(heap.used_blocks(), 1000);

  for addr in blocks.into_iter().skip(1).step_by(2) {
    unsafe { free(restore(addr)) };
  }
  heap.collect(Collect::Force);
  assert_eq!(heap.used_blocks(), 0);
}

#[cfg(debug_assertions)]
#[test]
fn test_double_free_is_detected() {
  static DOUBLE_FREES: AtomicUsize = AtomicUsize::new(0);
  fn on_error(err: &AllocError) {
    if matches!(err, AllocError::DoubleFree { .. }) {
      DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
    }
  }

  let ctx = context();
  ctx.set_error_handler(Some(on_error));
  let mut heap = Heap::new(ctx);
  let keep = heap.malloc(32);
  let p = heap.malloc(32);
  unsafe {
    free(p);
    free(p);
  }
  assert_eq!(DOUBLE_FREES.load(Ordering::Relaxed), 1);

  // The second free was dropped, so the page still counts one live block.
  assert_eq!(heap.used_blocks(), 1);
  let q = heap.malloc(32);
  let r = heap.malloc(32);
  assert_ne!(q, r);
  unsafe {
    free(q);
    free(r);
    free(keep);
  }
  assert_eq!(heap.used_blocks(), 0);
}

#[test]
fn test_deferred_free_runs_on_slow_path() {
  static CALLS: AtomicUsize = AtomicUsize::new(0);
  fn deferred(_force: bool, _heartbeat: u64) {
    CALLS.fetch_add(1, Ordering::Relaxed);
  }

  let ctx = context();
  ctx.register_deferred_free(Some(deferred));
  let mut heap = Heap::new(ctx);
  let p = heap.malloc(100);
  assert!(CALLS.load(Ordering::Relaxed) > 0);
  unsafe { free(p) };
}

#[test]
fn test_invalid_alignment_reports_error() {
  let ctx = context();
  let mut heap = Heap::new(ctx);
  assert!(matches!(
    heap.try_malloc_aligned(64, 3, false),
    Err(AllocError::InvalidArgument { .. })
  ));
  assert!(heap.malloc_aligned(64, 3).is_null());
  let p = heap.zalloc_aligned(64, 256);
  assert_eq!(p.addr() % 256, 0);
  unsafe { free(p) };
}

#[test]
fn test_reset_option_combinations_survive_reuse() {
  for bits in 0..8u8 {
    let ctx = AllocatorContext::leak(Options {
      show_errors: false,
      eager_commit_delay: 0,
      page_reset: bits & 1 != 0,
      segment_reset: bits & 2 != 0,
      reset_decommits: bits & 4 != 0,
      ..Options::default()
    });
    let mut heap = Heap::new(ctx);
    for size in [64, 20_000, 300_000] {
      let p = heap.malloc(size);
      assert!(!p.is_null());
      unsafe {
        ptr::write_bytes(p, 0x5a, size);
        free(p);
      }
      heap.collect(Collect::Normal);

      // Reuses the cached segment, whose pages may have been reset.
      let q = heap.malloc(size);
      assert!(!q.is_null(), "options {bits:03b}, size {size}");
      unsafe {
        let usable = segmalloc::usable_size(q);
        assert!(usable >= size);
        ptr::write_bytes(q, 0xa5, usable);
        free(q);
      }
      heap.collect(Collect::Force);
    }
    assert_eq!(heap.used_blocks(), 0);
    assert_eq!(ctx.stats().segments.current(), 0);
  }
}

#[cfg(any(debug_assertions, feature = "secure"))]
#[test]
fn test_huge_double_free_is_detected() {
  static DOUBLE_FREES: AtomicUsize = AtomicUsize::new(0);
  fn on_error(err: &AllocError) {
    if matches!(err, AllocError::DoubleFree { .. }) {
      DOUBLE_FREES.fetch_add(1, Ordering::Relaxed);
    }
  }

  // Keep the freed range mapped as is so the second free sees the header.
  let ctx = AllocatorContext::leak(Options {
    show_errors: false,
    segment_reset: false,
    ..Options::default()
  });
  ctx.set_error_handler(Some(on_error));
  let mut heap = Heap::new(ctx);
  let p = heap.malloc(16 * 1024 * 1024);
  assert!(!p.is_null());
  unsafe {
    free(p);
    free(p);
  }
  assert_eq!(DOUBLE_FREES.load(Ordering::Relaxed), 1);
  assert_eq!(ctx.stats().huge.current(), 0);
  assert_eq!(ctx.stats().segments.current(), 0);
  assert_eq!(ctx.stats().pages.current(), 0);
  assert_eq!(ctx.region_blocks_in_use(), 0);
}
