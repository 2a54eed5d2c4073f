use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::context::AllocatorContext;
use crate::{SEGMENT_SIZE, align_down, align_up};

// =============================================================================
// Constants
// =============================================================================

pub(crate) const KIB: usize = 1 << 10;
pub(crate) const MIB: usize = KIB * KIB;
pub(crate) const GIB: usize = MIB * KIB;

/// Size of a huge (1 GiB) OS page.
pub(crate) const HUGE_OS_PAGE_SIZE: usize = GIB;

/// Aligned mmap hints start here and wrap back when they pass the end.
#[cfg(target_pointer_width = "64")]
const HINT_BASE: usize = 4 << 40;
#[cfg(target_pointer_width = "64")]
const HINT_MAX: usize = 30 << 40;

// =============================================================================
// Interface
// =============================================================================

/// Virtual memory primitives of one platform.
///
/// `map` reserves (and optionally commits) address space; everything else
/// operates on ranges previously returned by `map`.
pub(crate) trait OsMemory: Sync {
  fn page_size(&self) -> usize;

  /// Large (2 MiB) page size, or 0 when unsupported.
  fn large_page_size(&self) -> usize;

  /// Maps `size` bytes near `hint`. Returns the mapping and whether it is
  /// backed by large OS pages.
  unsafe fn map(&self, hint: *mut u8, size: usize, commit: bool, allow_large: bool) -> Option<(NonNull<u8>, bool)>;

  unsafe fn unmap(&self, addr: *mut u8, size: usize) -> bool;

  unsafe fn commit(&self, addr: *mut u8, size: usize) -> bool;

  unsafe fn decommit(&self, addr: *mut u8, size: usize) -> bool;

  /// Tells the OS the contents are no longer needed. The range stays
  /// accessible; reads may return the old data or zeros.
  unsafe fn reset(&self, addr: *mut u8, size: usize) -> bool;

  unsafe fn protect(&self, addr: *mut u8, size: usize, protect: bool) -> bool;

  /// Maps one 1 GiB page exactly at `addr`.
  unsafe fn map_huge_page(&self, _addr: *mut u8) -> Option<NonNull<u8>> {
    None
  }

  fn numa_node(&self) -> usize {
    0
  }

  /// Next address worth hinting for an aligned mapping of `size` bytes.
  fn aligned_hint(&self, _alignment: usize, _size: usize) -> *mut u8 {
    null_mut()
  }

  /// Maps `size` bytes aligned to `alignment`. Tries a hinted mapping first,
  /// then over-maps and trims the excess on both sides.
  unsafe fn map_aligned(
    &self,
    size: usize,
    alignment: usize,
    commit: bool,
    allow_large: bool,
  ) -> Option<(NonNull<u8>, bool)> {
    let hint = self.aligned_hint(alignment, size);
    let (p, is_large) = unsafe { self.map(hint, size, commit, allow_large)? };
    if p.as_ptr().addr() % alignment == 0 {
      return Some((p, is_large));
    }
    unsafe { self.unmap(p.as_ptr(), size) };

    let over_size = size.checked_add(alignment)?;
    let (p, _) = unsafe { self.map(null_mut(), over_size, commit, false)? };
    let base = p.as_ptr();
    let aligned = base.map_addr(|a| align_up(a, alignment));
    let pre = aligned.addr() - base.addr();
    let post = over_size - pre - size;
    unsafe {
      if pre > 0 {
        self.unmap(base, pre);
      }
      if post > 0 {
        self.unmap(aligned.add(size), post);
      }
    }
    NonNull::new(aligned).map(|p| (p, false))
  }
}

// =============================================================================
// Unix
// =============================================================================

#[cfg(unix)]
pub(crate) struct UnixOs {
  page_size: usize,
  large_page_size: usize,
  /// Set once MAP_HUGETLB failed so later mappings stop trying.
  large_failed: AtomicBool,
  /// Set once MADV_FREE was rejected by the kernel.
  madv_free_failed: AtomicBool,
  #[cfg(target_pointer_width = "64")]
  hint: AtomicUsize,
}

#[cfg(unix)]
pub(crate) type Os = UnixOs;

#[cfg(unix)]
impl UnixOs {
  pub(crate) fn new() -> Self {
    let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      n if n > 0 => n as usize,
      _ => 4 * KIB,
    };
    Self {
      page_size,
      large_page_size: if cfg!(target_os = "linux") { 2 * MIB } else { 0 },
      large_failed: AtomicBool::new(false),
      madv_free_failed: AtomicBool::new(false),
      #[cfg(target_pointer_width = "64")]
      hint: AtomicUsize::new(0),
    }
  }

  unsafe fn mmap(&self, hint: *mut u8, size: usize, prot: libc::c_int, flags: libc::c_int) -> Option<NonNull<u8>> {
    let p = unsafe { libc::mmap(hint.cast(), size, prot, flags, -1, 0) };
    if p == libc::MAP_FAILED {
      None
    } else {
      NonNull::new(p.cast())
    }
  }
}

#[cfg(unix)]
impl OsMemory for UnixOs {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn large_page_size(&self) -> usize {
    self.large_page_size
  }

  unsafe fn map(&self, hint: *mut u8, size: usize, commit: bool, allow_large: bool) -> Option<(NonNull<u8>, bool)> {
    let prot = if commit {
      libc::PROT_READ | libc::PROT_WRITE
    } else {
      libc::PROT_NONE
    };
    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    #[cfg(not(target_os = "linux"))]
    let _ = allow_large;

    #[cfg(target_os = "linux")]
    if allow_large
      && commit
      && self.large_page_size > 0
      && size % self.large_page_size == 0
      && !self.large_failed.load(Ordering::Relaxed)
    {
      if let Some(p) = unsafe { self.mmap(hint, size, prot, flags | libc::MAP_HUGETLB) } {
        return Some((p, true));
      }
      self.large_failed.store(true, Ordering::Relaxed);
      log::warn!("large OS page allocation failed, falling back to regular pages");
    }

    let p = unsafe { self.mmap(hint, size, prot, flags)? };
    #[cfg(target_os = "linux")]
    if allow_large && self.large_page_size > 0 && size % self.large_page_size == 0 {
      // Transparent huge pages; the mapping itself stays regular.
      unsafe { libc::madvise(p.as_ptr().cast(), size, libc::MADV_HUGEPAGE) };
    }
    Some((p, false))
  }

  unsafe fn unmap(&self, addr: *mut u8, size: usize) -> bool {
    unsafe { libc::munmap(addr.cast(), size) == 0 }
  }

  unsafe fn commit(&self, addr: *mut u8, size: usize) -> bool {
    unsafe { libc::mprotect(addr.cast(), size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
  }

  unsafe fn decommit(&self, addr: *mut u8, size: usize) -> bool {
    unsafe {
      libc::madvise(addr.cast(), size, libc::MADV_DONTNEED);
      libc::mprotect(addr.cast(), size, libc::PROT_NONE) == 0
    }
  }

  unsafe fn reset(&self, addr: *mut u8, size: usize) -> bool {
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    if !self.madv_free_failed.load(Ordering::Relaxed) {
      if unsafe { libc::madvise(addr.cast(), size, libc::MADV_FREE) } == 0 {
        return true;
      }
      // Kernels before 4.5 reject MADV_FREE.
      self.madv_free_failed.store(true, Ordering::Relaxed);
    }
    unsafe { libc::madvise(addr.cast(), size, libc::MADV_DONTNEED) == 0 }
  }

  unsafe fn protect(&self, addr: *mut u8, size: usize, protect: bool) -> bool {
    let prot = if protect {
      libc::PROT_NONE
    } else {
      libc::PROT_READ | libc::PROT_WRITE
    };
    unsafe { libc::mprotect(addr.cast(), size, prot) == 0 }
  }

  #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
  unsafe fn map_huge_page(&self, addr: *mut u8) -> Option<NonNull<u8>> {
    // MAP_HUGE_1GB: log2(1 GiB) in the MAP_HUGE_SHIFT (26) field.
    const MAP_HUGE_1GB: libc::c_int = 30 << 26;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_HUGETLB | MAP_HUGE_1GB;
    let p = unsafe { self.mmap(addr, HUGE_OS_PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE, flags)? };
    if p.as_ptr() != addr {
      unsafe { self.unmap(p.as_ptr(), HUGE_OS_PAGE_SIZE) };
      return None;
    }
    Some(p)
  }

  #[cfg(target_os = "linux")]
  fn numa_node(&self) -> usize {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    let rc = unsafe {
      libc::syscall(
        libc::SYS_getcpu,
        &mut cpu as *mut libc::c_uint,
        &mut node as *mut libc::c_uint,
        null_mut::<libc::c_void>(),
      )
    };
    if rc == 0 { node as usize } else { 0 }
  }

  #[cfg(target_pointer_width = "64")]
  fn aligned_hint(&self, alignment: usize, size: usize) -> *mut u8 {
    if alignment == 0 || alignment > SEGMENT_SIZE || size % SEGMENT_SIZE != 0 {
      return null_mut();
    }
    let mut hint = self.hint.fetch_add(size, Ordering::Relaxed);
    if hint == 0 || hint > HINT_MAX {
      // Randomize the start (0 to 4 TiB past the base) outside debug builds.
      let mut init = HINT_BASE;
      if !cfg!(debug_assertions) {
        let r = crate::random::random_init(hint);
        init += SEGMENT_SIZE * ((r >> 17) & 0xF_FFFF);
      }
      let _ = self
        .hint
        .compare_exchange(hint + size, init, Ordering::Relaxed, Ordering::Relaxed);
      hint = self.hint.fetch_add(size, Ordering::Relaxed);
      if hint == 0 || hint > HINT_MAX {
        return null_mut();
      }
    }
    if hint % alignment != 0 {
      return null_mut();
    }
    core::ptr::without_provenance_mut(hint)
  }
}

// =============================================================================
// Fallback
// =============================================================================

/// Platforms without an mmap-style API get memory from the system allocator.
/// Commit, reset and protection become no-ops, and every mapping is aligned
/// to a segment so `unmap` can rebuild the layout.
#[cfg(not(unix))]
pub(crate) struct SystemOs;

#[cfg(not(unix))]
pub(crate) type Os = SystemOs;

#[cfg(not(unix))]
impl SystemOs {
  pub(crate) fn new() -> Self {
    Self
  }

  fn layout(size: usize) -> Option<std::alloc::Layout> {
    std::alloc::Layout::from_size_align(size, SEGMENT_SIZE).ok()
  }
}

#[cfg(not(unix))]
impl OsMemory for SystemOs {
  fn page_size(&self) -> usize {
    4 * KIB
  }

  fn large_page_size(&self) -> usize {
    0
  }

  unsafe fn map(&self, _hint: *mut u8, size: usize, _commit: bool, _allow_large: bool) -> Option<(NonNull<u8>, bool)> {
    use std::alloc::GlobalAlloc;
    let p = unsafe { std::alloc::System.alloc_zeroed(Self::layout(size)?) };
    NonNull::new(p).map(|p| (p, false))
  }

  unsafe fn unmap(&self, addr: *mut u8, size: usize) -> bool {
    use std::alloc::GlobalAlloc;
    match Self::layout(size) {
      Some(layout) => {
        unsafe { std::alloc::System.dealloc(addr, layout) };
        true
      }
      None => false,
    }
  }

  unsafe fn commit(&self, _addr: *mut u8, _size: usize) -> bool {
    true
  }

  unsafe fn decommit(&self, _addr: *mut u8, _size: usize) -> bool {
    true
  }

  unsafe fn reset(&self, _addr: *mut u8, _size: usize) -> bool {
    true
  }

  unsafe fn protect(&self, _addr: *mut u8, _size: usize, _protect: bool) -> bool {
    true
  }

  unsafe fn map_aligned(
    &self,
    size: usize,
    alignment: usize,
    commit: bool,
    allow_large: bool,
  ) -> Option<(NonNull<u8>, bool)> {
    if alignment > SEGMENT_SIZE {
      return None;
    }
    unsafe { self.map(null_mut(), size, commit, allow_large) }
  }
}

// =============================================================================
// Accounting wrappers
// =============================================================================

/// Maps `size` bytes aligned to `alignment`, recording the reservation.
pub(crate) fn alloc_aligned(
  ctx: &AllocatorContext,
  size: usize,
  alignment: usize,
  commit: bool,
  allow_large: bool,
) -> Option<(NonNull<u8>, bool)> {
  if size == 0 || !alignment.is_power_of_two() {
    return None;
  }
  let size = align_up(size, ctx.os.page_size());
  let alignment = alignment.max(ctx.os.page_size());
  ctx.stats.mmap_calls.increase(size);
  let Some((p, is_large)) = (unsafe { ctx.os.map_aligned(size, alignment, commit, allow_large) }) else {
    log::warn!("unable to map {size} bytes from the OS");
    return None;
  };
  ctx.stats.reserved.increase(size);
  if commit || is_large {
    ctx.note_committed(size);
  }
  Some((p, is_large))
}

/// Unmaps a range obtained from [`alloc_aligned`].
pub(crate) unsafe fn free(ctx: &AllocatorContext, p: *mut u8, size: usize, was_committed: bool) {
  if p.is_null() || size == 0 {
    return;
  }
  let size = align_up(size, ctx.os.page_size());
  if !unsafe { ctx.os.unmap(p, size) } {
    log::warn!("munmap failed for {size} bytes at {p:p}");
  }
  ctx.stats.reserved.decrease(size);
  if was_committed {
    ctx.stats.committed.decrease(size);
  }
}

/// Page range fully inside `[p, p + size)` when `conservative`, or fully
/// covering it otherwise.
fn page_area(ctx: &AllocatorContext, p: *mut u8, size: usize, conservative: bool) -> Option<(*mut u8, usize)> {
  if p.is_null() || size == 0 {
    return None;
  }
  let page = ctx.os.page_size();
  let (start, end) = if conservative {
    (align_up(p.addr(), page), align_down(p.addr() + size, page))
  } else {
    (align_down(p.addr(), page), align_up(p.addr() + size, page))
  };
  if end <= start {
    return None;
  }
  Some((p.with_addr(start), end - start))
}

/// Commits a range. Returns whether the fresh memory is known to be zeroed,
/// or `None` if the OS refused.
pub(crate) unsafe fn commit(ctx: &AllocatorContext, p: *mut u8, size: usize) -> Option<bool> {
  let Some((start, csize)) = page_area(ctx, p, size, false) else {
    return Some(false);
  };
  if ctx.huge_arena.contains(start) {
    return Some(false);
  }
  ctx.stats.commit_calls.increase(csize);
  if !unsafe { ctx.os.commit(start, csize) } {
    log::warn!("commit failed for {csize} bytes at {start:p}");
    return None;
  }
  ctx.note_committed(csize);
  Some(false)
}

pub(crate) unsafe fn decommit(ctx: &AllocatorContext, p: *mut u8, size: usize) -> bool {
  let Some((start, csize)) = page_area(ctx, p, size, true) else {
    return true;
  };
  if ctx.huge_arena.contains(start) {
    return true;
  }
  ctx.stats.committed.decrease(csize);
  unsafe { ctx.os.decommit(start, csize) }
}

/// Releases the physical backing of a range while keeping it reserved.
pub(crate) unsafe fn reset(ctx: &AllocatorContext, p: *mut u8, size: usize) -> bool {
  if ctx.options().reset_decommits {
    return unsafe { decommit(ctx, p, size) };
  }
  let Some((start, csize)) = page_area(ctx, p, size, true) else {
    return true;
  };
  if ctx.huge_arena.contains(start) {
    return true;
  }
  ctx.stats.reset.increase(csize);
  unsafe { ctx.os.reset(start, csize) }
}

/// Makes a [`reset`] range usable again. Returns whether it reads as zero.
pub(crate) unsafe fn unreset(ctx: &AllocatorContext, p: *mut u8, size: usize) -> Option<bool> {
  if ctx.options().reset_decommits {
    return unsafe { commit(ctx, p, size) };
  }
  if let Some((_, csize)) = page_area(ctx, p, size, true) {
    ctx.stats.reset.decrease(csize);
  }
  Some(false)
}

/// Turns a range into (or back from) an inaccessible guard area.
pub(crate) unsafe fn protect(ctx: &AllocatorContext, p: *mut u8, size: usize, protect: bool) -> bool {
  let Some((start, csize)) = page_area(ctx, p, size, true) else {
    return true;
  };
  unsafe { ctx.os.protect(start, csize, protect) }
}

/// Rounds a request up to a size the OS hands out without waste.
pub(crate) fn good_alloc_size(ctx: &AllocatorContext, size: usize) -> usize {
  let align = if size < 512 * KIB {
    ctx.os.page_size()
  } else if size < 2 * MIB {
    64 * KIB
  } else if size < 8 * MIB {
    256 * KIB
  } else if size < 32 * MIB {
    MIB
  } else {
    4 * MIB
  };
  if size >= usize::MAX - align {
    return size;
  }
  align_up(size, align)
}
