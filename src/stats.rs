use core::{
  fmt::{self, Write},
  sync::atomic::{AtomicIsize, Ordering},
};

use crate::page_queue::{BIN_HUGE, bin_block_size};

// =============================================================================
// Counters
// =============================================================================

/// A quantity that goes up and down, with its high-water mark.
#[derive(Debug, Default)]
pub struct StatCount {
  allocated: AtomicIsize,
  freed: AtomicIsize,
  peak: AtomicIsize,
  current: AtomicIsize,
}

impl StatCount {
  pub const fn new() -> Self {
    Self {
      allocated: AtomicIsize::new(0),
      freed: AtomicIsize::new(0),
      peak: AtomicIsize::new(0),
      current: AtomicIsize::new(0),
    }
  }

  #[inline]
  pub(crate) fn increase(&self, amount: usize) {
    self.adjust(amount as isize);
  }

  #[inline]
  pub(crate) fn decrease(&self, amount: usize) {
    self.adjust(-(amount as isize));
  }

  /// Applies a signed delta accumulated elsewhere.
  pub(crate) fn adjust(&self, delta: isize) {
    if delta == 0 {
      return;
    }
    let current = self.current.fetch_add(delta, Ordering::Relaxed) + delta;
    self.peak.fetch_max(current, Ordering::Relaxed);
    if delta > 0 {
      self.allocated.fetch_add(delta, Ordering::Relaxed);
    } else {
      self.freed.fetch_add(-delta, Ordering::Relaxed);
    }
  }

  pub fn current(&self) -> isize {
    self.current.load(Ordering::Relaxed)
  }

  pub fn peak(&self) -> isize {
    self.peak.load(Ordering::Relaxed)
  }

  pub fn allocated(&self) -> isize {
    self.allocated.load(Ordering::Relaxed)
  }

  pub fn freed(&self) -> isize {
    self.freed.load(Ordering::Relaxed)
  }
}

/// A monotonically growing event counter with a running total.
#[derive(Debug, Default)]
pub struct StatCounter {
  total: AtomicIsize,
  count: AtomicIsize,
}

impl StatCounter {
  pub const fn new() -> Self {
    Self {
      total: AtomicIsize::new(0),
      count: AtomicIsize::new(0),
    }
  }

  #[inline]
  pub(crate) fn increase(&self, amount: usize) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.total.fetch_add(amount as isize, Ordering::Relaxed);
  }

  /// Number of events recorded.
  pub fn count(&self) -> isize {
    self.count.load(Ordering::Relaxed)
  }

  /// Sum of the amounts recorded.
  pub fn total(&self) -> isize {
    self.total.load(Ordering::Relaxed)
  }
}

// =============================================================================
// Statistics
// =============================================================================

/// Context-wide statistics. All fields are updated with relaxed atomics, so
/// a snapshot taken while other threads run is only approximately coherent.
#[derive(Debug)]
pub struct Stats {
  pub segments: StatCount,
  pub pages: StatCount,
  pub reserved: StatCount,
  pub committed: StatCount,
  pub reset: StatCount,
  pub page_committed: StatCount,
  pub segments_abandoned: StatCount,
  pub pages_abandoned: StatCount,
  pub segments_cache: StatCount,
  pub threads: StatCount,
  pub huge: StatCount,
  /// Live bytes handed out to callers.
  pub malloc: StatCount,
  pub pages_extended: StatCounter,
  /// OS mappings; `total` is bytes mapped.
  pub mmap_calls: StatCounter,
  /// Explicit commits; `total` is bytes committed.
  pub commit_calls: StatCounter,
  pub page_no_retire: StatCounter,
  pub searches: StatCounter,
  pub huge_count: StatCounter,
  pub segments_reclaimed: StatCounter,
  /// Live blocks per size class.
  pub normal: [StatCount; BIN_HUGE + 1],
}

impl Stats {
  pub const fn new() -> Self {
    Self {
      segments: StatCount::new(),
      pages: StatCount::new(),
      reserved: StatCount::new(),
      committed: StatCount::new(),
      reset: StatCount::new(),
      page_committed: StatCount::new(),
      segments_abandoned: StatCount::new(),
      pages_abandoned: StatCount::new(),
      segments_cache: StatCount::new(),
      threads: StatCount::new(),
      huge: StatCount::new(),
      malloc: StatCount::new(),
      pages_extended: StatCounter::new(),
      mmap_calls: StatCounter::new(),
      commit_calls: StatCounter::new(),
      page_no_retire: StatCounter::new(),
      searches: StatCounter::new(),
      huge_count: StatCounter::new(),
      segments_reclaimed: StatCounter::new(),
      normal: [const { StatCount::new() }; BIN_HUGE + 1],
    }
  }
}

impl Default for Stats {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Formatting
// =============================================================================

/// How a row's numbers are scaled when printed.
#[derive(Clone, Copy)]
enum Unit {
  /// Amounts are bytes.
  Bytes,
  /// Amounts are blocks of the given size.
  Blocks(usize),
  /// Amounts are plain counts.
  Count,
}

struct Amount(isize, Unit);

impl fmt::Display for Amount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (n, bytes) = match self.1 {
      Unit::Bytes => (self.0, true),
      Unit::Blocks(size) => (self.0.saturating_mul(size as isize), true),
      Unit::Count => (self.0, false),
    };
    if !bytes {
      return write!(f, "{n:>10}");
    }
    const KIB: isize = 1024;
    let (div, suffix) = match n.unsigned_abs() as isize {
      v if v >= KIB * KIB * KIB => (KIB * KIB * KIB, "GiB"),
      v if v >= KIB * KIB => (KIB * KIB, "MiB"),
      v if v >= KIB => (KIB, "KiB"),
      _ => return write!(f, "{n:>8} B"),
    };
    let whole = n / div;
    let tenth = ((n % div).abs() * 10) / div;
    write!(f, "{:>6}.{} {}", whole, tenth, suffix)
  }
}

fn write_count(f: &mut fmt::Formatter<'_>, name: &str, stat: &StatCount, unit: Unit) -> fmt::Result {
  writeln!(
    f,
    "{:>12}: peak {} total {} freed {} current {}",
    name,
    Amount(stat.peak(), unit),
    Amount(stat.allocated(), unit),
    Amount(stat.freed(), unit),
    Amount(stat.current(), unit),
  )
}

fn write_counter(f: &mut fmt::Formatter<'_>, name: &str, stat: &StatCounter) -> fmt::Result {
  writeln!(f, "{:>12}: {:>10}", name, stat.count())
}

/// OS call counters, with the bytes they covered.
fn write_calls(f: &mut fmt::Formatter<'_>, name: &str, stat: &StatCounter) -> fmt::Result {
  writeln!(f, "{:>12}: {:>10} {}", name, stat.count(), Amount(stat.total(), Unit::Bytes))
}

impl fmt::Display for Stats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for bin in 1..BIN_HUGE {
      let stat = &self.normal[bin];
      if stat.allocated() == 0 {
        continue;
      }
      let mut label = LabelBuf::new();
      let _ = write!(label, "bin {}", bin_block_size(bin));
      write_count(f, label.as_str(), stat, Unit::Blocks(bin_block_size(bin)))?;
    }
    write_count(f, "malloc", &self.malloc, Unit::Bytes)?;
    write_count(f, "huge", &self.huge, Unit::Bytes)?;
    write_count(f, "reserved", &self.reserved, Unit::Bytes)?;
    write_count(f, "committed", &self.committed, Unit::Bytes)?;
    write_count(f, "reset", &self.reset, Unit::Bytes)?;
    write_count(f, "touched", &self.page_committed, Unit::Bytes)?;
    write_count(f, "segments", &self.segments, Unit::Count)?;
    write_count(f, "-abandoned", &self.segments_abandoned, Unit::Count)?;
    write_count(f, "-cached", &self.segments_cache, Unit::Count)?;
    write_count(f, "pages", &self.pages, Unit::Count)?;
    write_count(f, "-abandoned", &self.pages_abandoned, Unit::Count)?;
    write_count(f, "threads", &self.threads, Unit::Count)?;
    write_counter(f, "-extended", &self.pages_extended)?;
    write_counter(f, "-noretire", &self.page_no_retire)?;
    write_calls(f, "mmaps", &self.mmap_calls)?;
    write_calls(f, "commits", &self.commit_calls)?;
    write_counter(f, "reclaimed", &self.segments_reclaimed)?;
    write_counter(f, "huge allocs", &self.huge_count)?;
    let searches = self.searches.count();
    let avg = if searches == 0 { 0 } else { self.searches.total() / searches };
    writeln!(f, "{:>12}: {:>10} avg", "searches", avg)?;
    write_process(f)
  }
}

#[cfg(unix)]
fn write_process(f: &mut fmt::Formatter<'_>) -> fmt::Result {
  let mut usage = core::mem::MaybeUninit::<libc::rusage>::zeroed();
  if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
    return Ok(());
  }
  let usage = unsafe { usage.assume_init() };
  // Linux reports KiB, the BSDs and macOS report bytes.
  let rss = if cfg!(target_os = "linux") {
    usage.ru_maxrss as isize * 1024
  } else {
    usage.ru_maxrss as isize
  };
  writeln!(
    f,
    "{:>12}: user {}.{:03}s system {}.{:03}s faults {} peak rss {}",
    "process",
    usage.ru_utime.tv_sec,
    usage.ru_utime.tv_usec / 1000,
    usage.ru_stime.tv_sec,
    usage.ru_stime.tv_usec / 1000,
    usage.ru_majflt,
    Amount(rss, Unit::Bytes),
  )
}

#[cfg(not(unix))]
fn write_process(_f: &mut fmt::Formatter<'_>) -> fmt::Result {
  Ok(())
}

/// Small fixed buffer for row labels.
struct LabelBuf {
  buf: [u8; 24],
  len: usize,
}

impl LabelBuf {
  const fn new() -> Self {
    Self { buf: [0; 24], len: 0 }
  }

  fn as_str(&self) -> &str {
    core::str::from_utf8(&self.buf[..self.len]).unwrap_or("?")
  }
}

impl Write for LabelBuf {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let bytes = s.as_bytes();
    let end = self.len + bytes.len();
    if end > self.buf.len() {
      return Err(fmt::Error);
    }
    self.buf[self.len..end].copy_from_slice(bytes);
    self.len = end;
    Ok(())
  }
}

// =============================================================================
// Output
// =============================================================================

/// Unbuffered-ish stderr writer that never allocates. Text is staged in a
/// stack buffer and flushed with `write(2)` when full or dropped.
pub(crate) struct StderrWriter {
  buf: [u8; 256],
  len: usize,
}

impl StderrWriter {
  pub(crate) const fn new() -> Self {
    Self { buf: [0; 256], len: 0 }
  }

  pub(crate) fn flush(&mut self) {
    let mut start = 0;
    while start < self.len {
      let written = unsafe {
        libc::write(
          libc::STDERR_FILENO,
          self.buf[start..self.len].as_ptr().cast(),
          self.len - start,
        )
      };
      if written <= 0 {
        break;
      }
      start += written as usize;
    }
    self.len = 0;
  }
}

impl Write for StderrWriter {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    for chunk in s.as_bytes().chunks(self.buf.len()) {
      if self.len + chunk.len() > self.buf.len() {
        self.flush();
      }
      self.buf[self.len..self.len + chunk.len()].copy_from_slice(chunk);
      self.len += chunk.len();
    }
    Ok(())
  }
}

impl Drop for StderrWriter {
  fn drop(&mut self) {
    self.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stat_count_tracks_peak() {
    let stat = StatCount::new();
    stat.increase(10);
    stat.increase(5);
    stat.decrease(12);
    assert_eq!(stat.current(), 3);
    assert_eq!(stat.peak(), 15);
    assert_eq!(stat.allocated(), 15);
    assert_eq!(stat.freed(), 12);
  }

  #[test]
  fn test_stat_counter() {
    let stat = StatCounter::new();
    stat.increase(3);
    stat.increase(4);
    assert_eq!(stat.count(), 2);
    assert_eq!(stat.total(), 7);
  }

  #[test]
  fn test_amount_formatting() {
    assert_eq!(Amount(512, Unit::Bytes).to_string().trim(), "512 B");
    assert_eq!(Amount(1536, Unit::Bytes).to_string().trim(), "1.5 KiB");
    assert_eq!(Amount(3, Unit::Blocks(1 << 20)).to_string().trim(), "3.0 MiB");
    assert_eq!(Amount(42, Unit::Count).to_string().trim(), "42");
  }

  #[test]
  fn test_display_mentions_core_rows() {
    let stats = Stats::new();
    stats.malloc.increase(64);
    stats.normal[1].increase(1);
    let text = stats.to_string();
    assert!(text.contains("malloc"));
    assert!(text.contains("segments"));
    assert!(text.contains("bin 8"));
  }

  #[test]
  fn test_call_counters_report_bytes() {
    let stats = Stats::new();
    stats.mmap_calls.increase(4 << 20);
    stats.mmap_calls.increase(4 << 20);
    assert_eq!(stats.mmap_calls.count(), 2);
    assert_eq!(stats.mmap_calls.total(), 8 << 20);
    let text = stats.to_string();
    let line = text.lines().find(|l| l.contains("mmaps")).unwrap();
    assert!(line.contains("MiB"), "{line}");
  }
}
