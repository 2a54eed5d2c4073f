//! Process-wide allocator state.
//!
//! Everything threads share lives in one [`AllocatorContext`]: the region
//! table, the huge OS page arena, the abandoned segment stack, statistics and
//! the registered callbacks. The process allocator uses [`AllocatorContext::global`];
//! tests build independent contexts with [`AllocatorContext::leak`] so their
//! accounting does not mix.

use core::fmt::Write;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{AllocError, ErrorHandler};
use crate::options::Options;
use crate::os::Os;
use crate::region::{HugeArena, RegionTable};
use crate::segment::Segment;
use crate::stats::{StderrWriter, Stats};

/// Called from the allocation slow path with `(force, heartbeat)`; may free
/// blocks the embedder held back.
pub type DeferredFree = fn(bool, u64);

/// Called with the total committed bytes whenever that total grows.
pub type CommittedHook = fn(usize);

/// Milliseconds of reservation budget per requested huge OS page.
const HUGE_PAGE_RESERVE_MS: u64 = 500;

pub struct AllocatorContext {
  options: Options,
  pub(crate) os: Os,
  pub(crate) stats: Stats,
  pub(crate) regions: RegionTable,
  pub(crate) huge_arena: HugeArena,
  /// Head of the abandoned segment stack, tagged in its low bits.
  pub(crate) abandoned: AtomicPtr<Segment>,
  pub(crate) abandoned_count: AtomicUsize,
  error_handler: AtomicPtr<()>,
  deferred_free: AtomicPtr<()>,
  committed_hook: AtomicPtr<()>,
  error_count: AtomicUsize,
  main_thread: AtomicUsize,
  compact_requested: AtomicBool,
  torn_down: AtomicBool,
}

static GLOBAL: OnceLock<AllocatorContext> = OnceLock::new();
static PROCESS_STARTED: AtomicBool = AtomicBool::new(false);

impl AllocatorContext {
  /// Builds a context. Nothing is mapped until the first allocation.
  pub fn new(options: Options) -> Self {
    Self {
      options,
      os: Os::new(),
      stats: Stats::new(),
      regions: RegionTable::new(),
      huge_arena: HugeArena::new(),
      abandoned: AtomicPtr::new(null_mut()),
      abandoned_count: AtomicUsize::new(0),
      error_handler: AtomicPtr::new(null_mut()),
      deferred_free: AtomicPtr::new(null_mut()),
      committed_hook: AtomicPtr::new(null_mut()),
      error_count: AtomicUsize::new(0),
      main_thread: AtomicUsize::new(0),
      compact_requested: AtomicBool::new(false),
      torn_down: AtomicBool::new(false),
    }
  }

  /// Builds a context that lives for the rest of the process. Heaps need a
  /// `'static` context because segments point back at it.
  pub fn leak(options: Options) -> &'static Self {
    Box::leak(Box::new(Self::new(options)))
  }

  /// The process context, configured from `SEGMALLOC_*` variables on first
  /// use.
  #[inline]
  pub fn global() -> &'static Self {
    let ctx = GLOBAL.get_or_init(|| Self::new(Options::from_env()));
    if !PROCESS_STARTED.load(Ordering::Acquire) && !PROCESS_STARTED.swap(true, Ordering::AcqRel) {
      ctx.process_init();
    }
    ctx
  }

  fn process_init(&'static self) {
    if self.options.show_stats || self.options.verbose {
      unsafe { libc::atexit(teardown_at_exit) };
    }
    let pages = self.options.reserve_huge_os_pages;
    if pages > 0 {
      let timeout = Duration::from_millis(pages as u64 * HUGE_PAGE_RESERVE_MS);
      if let Err(err) = self.reserve_huge_os_pages(pages, timeout) {
        self.report(err);
      }
    }
  }

  #[inline]
  pub fn options(&self) -> &Options {
    &self.options
  }

  #[inline]
  pub fn stats(&self) -> &Stats {
    &self.stats
  }

  /// Bytes handed out and not yet freed, as far as heaps have published
  /// their counts.
  pub fn allocated_bytes(&self) -> usize {
    self.stats.malloc.current().max(0) as usize
  }

  /// Segments waiting on the abandoned stack.
  pub fn abandoned_count(&self) -> usize {
    self.abandoned_count.load(Ordering::Relaxed)
  }

  /// Segment-sized blocks currently claimed from regions.
  pub fn region_blocks_in_use(&self) -> usize {
    self.regions.blocks_in_use()
  }

  // ===========================================================================
  // Callbacks
  // ===========================================================================

  /// Replaces the default reporting action. With a handler installed, fatal
  /// errors no longer abort; the failing operation is skipped instead.
  pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
    let raw = handler.map_or(null_mut(), |f| f as *mut ());
    self.error_handler.store(raw, Ordering::Release);
  }

  pub fn set_committed_hook(&self, hook: Option<CommittedHook>) {
    let raw = hook.map_or(null_mut(), |f| f as *mut ());
    self.committed_hook.store(raw, Ordering::Release);
  }

  /// Registers a callback run on the allocation slow path and on collect.
  pub fn register_deferred_free(&self, callback: Option<DeferredFree>) {
    let raw = callback.map_or(null_mut(), |f| f as *mut ());
    self.deferred_free.store(raw, Ordering::Release);
  }

  fn error_handler(&self) -> Option<ErrorHandler> {
    let raw = self.error_handler.load(Ordering::Acquire);
    (!raw.is_null()).then(|| unsafe { core::mem::transmute::<*mut (), ErrorHandler>(raw) })
  }

  pub(crate) fn deferred_free(&self) -> Option<DeferredFree> {
    let raw = self.deferred_free.load(Ordering::Acquire);
    (!raw.is_null()).then(|| unsafe { core::mem::transmute::<*mut (), DeferredFree>(raw) })
  }

  /// Records `size` newly committed bytes and tells the hook.
  pub(crate) fn note_committed(&self, size: usize) {
    self.stats.committed.increase(size);
    let raw = self.committed_hook.load(Ordering::Acquire);
    if !raw.is_null() {
      let hook = unsafe { core::mem::transmute::<*mut (), CommittedHook>(raw) };
      hook(self.stats.committed.current().max(0) as usize);
    }
  }

  // ===========================================================================
  // Errors
  // ===========================================================================

  /// Routes an error to the handler, or prints it and aborts when fatal.
  #[cold]
  pub(crate) fn report(&self, err: AllocError) {
    let seen = self.error_count.fetch_add(1, Ordering::Relaxed);
    if err.is_fatal() {
      log::error!("{err}");
    } else {
      log::warn!("{err}");
    }
    if (self.options.show_errors || err.is_fatal()) && seen < self.options.max_errors {
      let mut out = StderrWriter::new();
      let _ = writeln!(out, "segmalloc: error: {err}");
    }
    if let Some(handler) = self.error_handler() {
      handler(&err);
    } else if err.is_fatal() {
      std::process::abort();
    }
  }

  /// Errors reported so far.
  pub fn error_count(&self) -> usize {
    self.error_count.load(Ordering::Relaxed)
  }

  // ===========================================================================
  // Memory
  // ===========================================================================

  /// Reserves `pages` 1 GiB OS pages for segments to be carved from.
  pub fn reserve_huge_os_pages(&self, pages: usize, timeout: Duration) -> Result<usize, AllocError> {
    self.huge_arena.reserve(self, pages, timeout)
  }

  /// Returns regions without claimed blocks to the OS. Returns how many were
  /// released.
  pub fn collect_regions(&self) -> usize {
    let released = self.regions.collect(self);
    if released > 0 {
      log::debug!("released {released} empty regions");
    }
    released
  }

  /// Writes the statistics to stderr.
  pub fn print_stats(&self) {
    let mut out = StderrWriter::new();
    let _ = write!(out, "{}", self.stats);
  }

  /// End-of-life housekeeping: prints stats when asked to and releases
  /// empty regions. Runs once; heaps still alive keep working afterwards.
  pub fn teardown(&self) {
    if self.torn_down.swap(true, Ordering::AcqRel) {
      return;
    }
    if self.options.show_stats || self.options.verbose {
      self.print_stats();
    }
    self.collect_regions();
  }

  // ===========================================================================
  // Main thread
  // ===========================================================================

  /// The first thread to create a heap becomes the context's main thread.
  pub(crate) fn claim_main_thread(&self, thread_id: usize) -> bool {
    match self
      .main_thread
      .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => true,
      Err(owner) => owner == thread_id,
    }
  }

  pub(crate) fn is_main_thread(&self, thread_id: usize) -> bool {
    self.main_thread.load(Ordering::Acquire) == thread_id
  }

  pub(crate) fn request_main_compact(&self) {
    self.compact_requested.store(true, Ordering::Release);
  }

  pub(crate) fn take_main_compact_request(&self) -> bool {
    self.compact_requested.load(Ordering::Relaxed) && self.compact_requested.swap(false, Ordering::AcqRel)
  }
}

extern "C" fn teardown_at_exit() {
  if let Some(ctx) = GLOBAL.get() {
    ctx.teardown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_main_thread_is_first_claimant() {
    let ctx = AllocatorContext::leak(Options::default());
    assert!(ctx.claim_main_thread(7));
    assert!(ctx.claim_main_thread(7));
    assert!(!ctx.claim_main_thread(8));
    assert!(ctx.is_main_thread(7));
  }

  #[test]
  fn test_compact_request_is_taken_once() {
    let ctx = AllocatorContext::leak(Options::default());
    assert!(!ctx.take_main_compact_request());
    ctx.request_main_compact();
    assert!(ctx.take_main_compact_request());
    assert!(!ctx.take_main_compact_request());
  }

  #[test]
  fn test_handler_sees_errors() {
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    fn handler(err: &AllocError) {
      if matches!(err, AllocError::DoubleFree { .. }) {
        SEEN.fetch_add(1, Ordering::Relaxed);
      }
    }
    let ctx = AllocatorContext::leak(Options {
      show_errors: false,
      ..Options::default()
    });
    ctx.set_error_handler(Some(handler));
    ctx.report(AllocError::DoubleFree { block: 0x40, block_size: 16 });
    assert_eq!(SEEN.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.error_count(), 1);
  }

  #[test]
  fn test_committed_hook_runs_on_growth() {
    static LAST: AtomicUsize = AtomicUsize::new(0);
    fn hook(total: usize) {
      LAST.store(total, Ordering::Relaxed);
    }
    let ctx = AllocatorContext::leak(Options::default());
    ctx.set_committed_hook(Some(hook));
    ctx.note_committed(4096);
    ctx.note_committed(4096);
    assert_eq!(LAST.load(Ordering::Relaxed), 8192);
    ctx.set_committed_hook(None);
    ctx.note_committed(4096);
    assert_eq!(LAST.load(Ordering::Relaxed), 8192);
  }

  #[test]
  fn test_teardown_runs_once() {
    let ctx = AllocatorContext::leak(Options::default());
    ctx.teardown();
    ctx.teardown();
    assert_eq!(ctx.region_blocks_in_use(), 0);
  }
}
