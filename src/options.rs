//! Allocator tunables.
//!
//! Options are read once, when a context is constructed, and are immutable
//! afterwards. The process-wide context reads them from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SEGMALLOC_SHOW_ERRORS` | Print error messages to stderr | debug builds |
//! | `SEGMALLOC_SHOW_STATS` | Print statistics at process exit | false |
//! | `SEGMALLOC_VERBOSE` | Print informational messages | false |
//! | `SEGMALLOC_EAGER_COMMIT` | Commit whole segments up front | true |
//! | `SEGMALLOC_EAGER_REGION_COMMIT` | Commit whole regions up front | true |
//! | `SEGMALLOC_EAGER_COMMIT_DELAY` | Segments per thread committed lazily before eager commit kicks in | 1 |
//! | `SEGMALLOC_LARGE_OS_PAGES` | Use 2 MiB OS pages where available | false |
//! | `SEGMALLOC_RESERVE_HUGE_OS_PAGES` | 1 GiB pages to reserve at startup | 0 |
//! | `SEGMALLOC_SEGMENT_CACHE` | Max segments cached per thread | 8 |
//! | `SEGMALLOC_PAGE_RESET` | Reset page memory when a page is freed | false |
//! | `SEGMALLOC_SEGMENT_RESET` | Reset segment memory when it returns to a region | true |
//! | `SEGMALLOC_RESET_DECOMMITS` | Decommit instead of reset | false |
//! | `SEGMALLOC_USE_NUMA` | Prefer regions on the caller's NUMA node | true |
//! | `SEGMALLOC_MAX_ERRORS` | Error messages printed before going silent | 16 |
//!
//! Booleans accept `1/0`, `true/false`, `yes/no` and `on/off`. Values that do
//! not parse leave the default in place.

use core::ffi::CStr;

const ENV_PREFIX: &str = "SEGMALLOC_";
/// Longest variable name, prefix included, plus the trailing NUL.
const ENV_NAME_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
  pub show_errors: bool,
  pub show_stats: bool,
  pub verbose: bool,
  pub eager_commit: bool,
  pub eager_region_commit: bool,
  pub eager_commit_delay: usize,
  pub large_os_pages: bool,
  pub reserve_huge_os_pages: usize,
  pub segment_cache: usize,
  pub page_reset: bool,
  pub segment_reset: bool,
  pub reset_decommits: bool,
  pub use_numa: bool,
  pub max_errors: usize,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      show_errors: cfg!(debug_assertions),
      show_stats: false,
      verbose: false,
      eager_commit: true,
      eager_region_commit: true,
      eager_commit_delay: 1,
      large_os_pages: false,
      reserve_huge_os_pages: 0,
      segment_cache: 8,
      page_reset: false,
      segment_reset: true,
      reset_decommits: false,
      use_numa: true,
      max_errors: 16,
    }
  }
}

impl Options {
  /// Defaults overridden by `SEGMALLOC_*` environment variables.
  ///
  /// Runs while the process-wide context is being built, so it must not
  /// allocate: lookups go through `getenv` with a stack buffer for the name.
  pub fn from_env() -> Self {
    let mut opts = Self::default();
    env_bool("SHOW_ERRORS", &mut opts.show_errors);
    env_bool("SHOW_STATS", &mut opts.show_stats);
    env_bool("VERBOSE", &mut opts.verbose);
    env_bool("EAGER_COMMIT", &mut opts.eager_commit);
    env_bool("EAGER_REGION_COMMIT", &mut opts.eager_region_commit);
    env_usize("EAGER_COMMIT_DELAY", &mut opts.eager_commit_delay);
    env_bool("LARGE_OS_PAGES", &mut opts.large_os_pages);
    env_usize("RESERVE_HUGE_OS_PAGES", &mut opts.reserve_huge_os_pages);
    env_usize("SEGMENT_CACHE", &mut opts.segment_cache);
    env_bool("PAGE_RESET", &mut opts.page_reset);
    env_bool("SEGMENT_RESET", &mut opts.segment_reset);
    env_bool("RESET_DECOMMITS", &mut opts.reset_decommits);
    env_bool("USE_NUMA", &mut opts.use_numa);
    env_usize("MAX_ERRORS", &mut opts.max_errors);
    opts
  }
}

fn env_bool(name: &str, slot: &mut bool) {
  if let Some(value) = env_value(name).and_then(parse_bool) {
    *slot = value;
  }
}

fn env_usize(name: &str, slot: &mut usize) {
  if let Some(value) = env_value(name).and_then(parse_usize) {
    *slot = value;
  }
}

fn env_value(name: &str) -> Option<&'static [u8]> {
  let mut buf = [0u8; ENV_NAME_MAX];
  let len = ENV_PREFIX.len() + name.len();
  if len >= ENV_NAME_MAX {
    return None;
  }
  buf[..ENV_PREFIX.len()].copy_from_slice(ENV_PREFIX.as_bytes());
  buf[ENV_PREFIX.len()..len].copy_from_slice(name.as_bytes());

  let value = unsafe { libc::getenv(buf.as_ptr().cast()) };
  if value.is_null() {
    return None;
  }
  // The environment block lives for the whole process.
  Some(unsafe { CStr::from_ptr(value) }.to_bytes())
}

fn parse_bool(raw: &[u8]) -> Option<bool> {
  let raw = raw.trim_ascii();
  const TRUE: [&[u8]; 4] = [b"1", b"true", b"yes", b"on"];
  const FALSE: [&[u8]; 4] = [b"0", b"false", b"no", b"off"];
  if TRUE.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
    Some(true)
  } else if FALSE.iter().any(|f| raw.eq_ignore_ascii_case(f)) {
    Some(false)
  } else {
    None
  }
}

fn parse_usize(raw: &[u8]) -> Option<usize> {
  let raw = raw.trim_ascii();
  if raw.is_empty() {
    return None;
  }
  raw.iter().try_fold(0usize, |acc, &b| {
    let digit = (b as char).to_digit(10)? as usize;
    acc.checked_mul(10)?.checked_add(digit)
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let opts = Options::default();
    assert!(opts.eager_commit);
    assert_eq!(opts.eager_commit_delay, 1);
    assert_eq!(opts.reserve_huge_os_pages, 0);
    assert!(!opts.reset_decommits);
  }

  #[test]
  fn test_parse_bool() {
    assert_eq!(parse_bool(b"1"), Some(true));
    assert_eq!(parse_bool(b" TRUE "), Some(true));
    assert_eq!(parse_bool(b"off"), Some(false));
    assert_eq!(parse_bool(b"maybe"), None);
  }

  #[test]
  fn test_parse_usize() {
    assert_eq!(parse_usize(b"42"), Some(42));
    assert_eq!(parse_usize(b" 7"), Some(7));
    assert_eq!(parse_usize(b"-1"), None);
    assert_eq!(parse_usize(b""), None);
    assert_eq!(parse_usize(b"99999999999999999999999"), None);
  }

  #[test]
  fn test_unset_variable_keeps_default() {
    let mut slot = 3usize;
    env_usize("DEFINITELY_NOT_SET_ANYWHERE", &mut slot);
    assert_eq!(slot, 3);
  }
}
