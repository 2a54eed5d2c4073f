//! Cheap pseudo-randomness for free-list shuffling and pointer cookies.
//!
//! Not cryptographic. The goal is only that block addresses handed out in
//! secure mode are not trivially predictable from earlier ones.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// One splitmix step.
#[cfg(target_pointer_width = "64")]
#[inline]
pub(crate) const fn shuffle(mut x: usize) -> usize {
  x ^= x >> 30;
  x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
  x ^= x >> 27;
  x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
  x ^= x >> 31;
  x
}

#[cfg(not(target_pointer_width = "64"))]
#[inline]
pub(crate) const fn shuffle(mut x: usize) -> usize {
  x ^= x >> 16;
  x = x.wrapping_mul(0x7feb_352d);
  x ^= x >> 15;
  x = x.wrapping_mul(0x846c_a68b);
  x ^= x >> 16;
  x
}

/// Seeds a generator from `seed`, the address of this function (ASLR) and the clock.
pub(crate) fn random_init(seed: usize) -> usize {
  let mut x = (random_init as fn(usize) -> usize as usize) ^ seed;
  if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
    x ^= now.as_nanos() as usize;
  }
  let rounds = ((x ^ (x >> 17)) & 0x0F) + 1;
  for _ in 0..rounds {
    x = shuffle(x);
  }
  x
}

static PROCESS_COOKIE: AtomicUsize = AtomicUsize::new(0);

/// Process-wide random value, never zero.
pub(crate) fn process_cookie() -> usize {
  let cookie = PROCESS_COOKIE.load(Ordering::Relaxed);
  if cookie != 0 {
    return cookie;
  }
  let fresh = random_init(&PROCESS_COOKIE as *const AtomicUsize as usize) | 1;
  match PROCESS_COOKIE.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
    Ok(_) => fresh,
    Err(winner) => winner,
  }
}

/// Cookie tying a segment header to its own address.
#[inline]
pub(crate) fn ptr_cookie<T>(p: *const T) -> usize {
  p.addr() ^ process_cookie()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shuffle_is_deterministic_and_mixes() {
    assert_eq!(shuffle(42), shuffle(42));
    assert_ne!(shuffle(1), shuffle(2));
    assert_ne!(shuffle(1), 1);
  }

  #[test]
  fn process_cookie_is_stable_and_odd() {
    let a = process_cookie();
    let b = process_cookie();
    assert_eq!(a, b);
    assert_eq!(a & 1, 1);
  }

  #[test]
  fn ptr_cookie_depends_on_address() {
    let x = 0u64;
    let y = 0u64;
    assert_ne!(ptr_cookie(&x), ptr_cookie(&y));
  }
}
