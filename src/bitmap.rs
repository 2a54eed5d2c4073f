//! Lock-free claim/release of bit runs in an array of atomic words.
//!
//! A set bit means the corresponding block is claimed. Runs normally live
//! inside one word; the `_across` operations let a run continue into the
//! following words, which the huge OS page arena needs for multi-GiB claims.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::WORD_BITS;

const FIELD_BITS: usize = WORD_BITS;
const FIELD_FULL: usize = usize::MAX;

/// Attempts at an across-claim before giving up on a field.
const ACROSS_RETRIES: usize = 4;

/// Position of a bit: `field * WORD_BITS + bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitmapIndex(usize);

impl BitmapIndex {
  #[inline]
  pub const fn new(field: usize, bit: usize) -> Self {
    debug_assert!(bit < FIELD_BITS);
    Self(field * FIELD_BITS + bit)
  }

  #[inline]
  pub const fn from_raw(value: usize) -> Self {
    Self(value)
  }

  #[inline]
  pub const fn field(self) -> usize {
    self.0 / FIELD_BITS
  }

  #[inline]
  pub const fn bit(self) -> usize {
    self.0 % FIELD_BITS
  }

  #[inline]
  pub const fn value(self) -> usize {
    self.0
  }
}

/// `count` ones starting at `bit`.
#[inline]
const fn mask(count: usize, bit: usize) -> usize {
  debug_assert!(count + bit <= FIELD_BITS);
  if count >= FIELD_BITS { FIELD_FULL } else { ((1usize << count) - 1) << bit }
}

/// A view over borrowed bitmap fields.
#[derive(Clone, Copy)]
pub struct Bitmap<'a> {
  fields: &'a [AtomicUsize],
}

impl<'a> Bitmap<'a> {
  pub const fn new(fields: &'a [AtomicUsize]) -> Self {
    Self { fields }
  }

  /// Number of fields.
  pub const fn fields(&self) -> usize {
    self.fields.len()
  }

  /// Claims `count` consecutive clear bits inside `field`. Returns the
  /// first bit of the run.
  pub fn try_claim(&self, field: usize, count: usize) -> Option<usize> {
    debug_assert!(count > 0 && count <= FIELD_BITS, "bad bit count {count}");
    let word = &self.fields[field];
    let mut map = word.load(Ordering::Relaxed);
    if map == FIELD_FULL {
      return None;
    }
    let run = mask(count, 0);
    let bit_max = FIELD_BITS - count;
    // Start at the lowest clear bit.
    let mut bit = (!map).trailing_zeros() as usize;
    while bit <= bit_max {
      let m = run << bit;
      if map & m == 0 {
        match word.compare_exchange_weak(map, map | m, Ordering::AcqRel, Ordering::Acquire) {
          Ok(_) => return Some(bit),
          Err(current) => {
            // Raced; rescan this position against the fresh value.
            map = current;
            continue;
          }
        }
      }
      // Jump past the highest set bit that overlaps the window.
      let highest = (FIELD_BITS - 1) - (map & m).leading_zeros() as usize;
      bit = highest + 1;
    }
    None
  }

  /// Claims `count` bits in any field, scanning from `start` and wrapping.
  pub fn try_claim_from(&self, start: usize, count: usize) -> Option<BitmapIndex> {
    let n = self.fields.len();
    (0..n).map(|i| (start + i) % n).find_map(|field| {
      self
        .try_claim(field, count)
        .map(|bit| BitmapIndex::new(field, bit))
    })
  }

  /// Clears a run inside one field. Returns whether every bit was set.
  pub fn release(&self, field: usize, bit: usize, count: usize) -> bool {
    let m = mask(count, bit);
    let prev = self.fields[field].fetch_and(!m, Ordering::AcqRel);
    prev & m == m
  }

  /// Sets a run inside one field regardless of its state. Returns
  /// `(all_were_clear, any_was_clear)`.
  pub fn claim(&self, idx: BitmapIndex, count: usize) -> (bool, bool) {
    let m = mask(count, idx.bit());
    let prev = self.fields[idx.field()].fetch_or(m, Ordering::AcqRel);
    (prev & m == 0, prev & m != m)
  }

  pub fn is_claimed(&self, idx: BitmapIndex, count: usize) -> bool {
    let m = mask(count, idx.bit());
    self.fields[idx.field()].load(Ordering::Relaxed) & m == m
  }

  pub fn is_any_claimed(&self, idx: BitmapIndex, count: usize) -> bool {
    let m = mask(count, idx.bit());
    self.fields[idx.field()].load(Ordering::Relaxed) & m != 0
  }

  // ===========================================================================
  // Across fields
  // ===========================================================================

  /// Claims `count` bits anywhere, letting the run span fields. Scans from
  /// field `start`, wrapping around.
  pub fn try_claim_across(&self, start: usize, count: usize) -> Option<BitmapIndex> {
    let n = self.fields.len();
    for i in 0..n {
      let field = (start + i) % n;
      if count <= FIELD_BITS
        && let Some(bit) = self.try_claim(field, count)
      {
        return Some(BitmapIndex::new(field, bit));
      }
      if let Some(idx) = self.try_claim_field_across(field, count) {
        return Some(idx);
      }
    }
    None
  }

  /// Claims a run that begins in the clear high bits of `field` and
  /// continues through the following fields.
  fn try_claim_field_across(&self, field: usize, count: usize) -> Option<BitmapIndex> {
    let n = self.fields.len();
    for _ in 0..ACROSS_RETRIES {
      let map = self.fields[field].load(Ordering::Relaxed);
      let initial = map.leading_zeros() as usize;
      if initial == 0 || initial >= count {
        // Nothing free at the top, or the run fits in this field.
        return None;
      }
      let rest = count - initial;
      let mid = rest / FIELD_BITS;
      let post = rest % FIELD_BITS;
      if field + mid + usize::from(post > 0) >= n {
        return None;
      }
      // Cheap scan first: are the following fields free?
      let mut fits = (1..=mid).all(|i| self.fields[field + i].load(Ordering::Relaxed) == 0);
      if fits && post > 0 {
        fits = self.fields[field + mid + 1].load(Ordering::Relaxed) & mask(post, 0) == 0;
      }
      if !fits {
        return None;
      }

      let start_bit = FIELD_BITS - initial;
      let idx = BitmapIndex::new(field, start_bit);
      if self.lock_across(idx, initial, mid, post) {
        return Some(idx);
      }
    }
    None
  }

  /// Sets the pre, mid and post parts of an across-run in order, rolling
  /// back on the first conflict.
  fn lock_across(&self, idx: BitmapIndex, pre: usize, mid: usize, post: usize) -> bool {
    let field = idx.field();
    let pre_mask = mask(pre, idx.bit());
    if !self.set_if_clear(field, pre_mask) {
      return false;
    }
    for i in 1..=mid {
      if !self.set_if_clear(field + i, FIELD_FULL) {
        self.rollback(field, pre_mask, i - 1);
        return false;
      }
    }
    if post > 0 && !self.set_if_clear(field + mid + 1, mask(post, 0)) {
      self.rollback(field, pre_mask, mid);
      return false;
    }
    true
  }

  fn set_if_clear(&self, field: usize, m: usize) -> bool {
    let word = &self.fields[field];
    let mut map = word.load(Ordering::Relaxed);
    loop {
      if map & m != 0 {
        return false;
      }
      match word.compare_exchange_weak(map, map | m, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => return true,
        Err(current) => map = current,
      }
    }
  }

  fn rollback(&self, field: usize, pre_mask: usize, full_fields: usize) {
    self.fields[field].fetch_and(!pre_mask, Ordering::AcqRel);
    for i in 1..=full_fields {
      self.fields[field + i].store(0, Ordering::Release);
    }
  }

  /// Clears a run that may span fields. Returns whether every bit was set.
  pub fn release_across(&self, idx: BitmapIndex, count: usize) -> bool {
    let mut all_set = true;
    let mut field = idx.field();
    let mut bit = idx.bit();
    let mut left = count;
    while left > 0 {
      let take = left.min(FIELD_BITS - bit);
      all_set &= self.release(field, bit, take);
      left -= take;
      field += 1;
      bit = 0;
    }
    all_set
  }

  /// Whether every bit of a possibly multi-field run is set.
  pub fn is_claimed_across(&self, idx: BitmapIndex, count: usize) -> bool {
    let mut field = idx.field();
    let mut bit = idx.bit();
    let mut left = count;
    while left > 0 {
      let take = left.min(FIELD_BITS - bit);
      if !self.is_claimed(BitmapIndex::new(field, bit), take) {
        return false;
      }
      left -= take;
      field += 1;
      bit = 0;
    }
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fields<const N: usize>() -> [AtomicUsize; N] {
    [const { AtomicUsize::new(0) }; N]
  }

  #[test]
  fn test_claim_skips_set_bits() {
    let f = fields::<1>();
    let bm = Bitmap::new(&f);
    assert_eq!(bm.try_claim(0, 3), Some(0));
    assert_eq!(bm.try_claim(0, 2), Some(3));
    assert!(bm.release(0, 0, 3));
    assert_eq!(bm.try_claim(0, 2), Some(0));
    assert_eq!(bm.try_claim(0, 2), Some(5));
  }

  #[test]
  fn test_full_word_claim() {
    let f = fields::<1>();
    let bm = Bitmap::new(&f);
    assert_eq!(bm.try_claim(0, FIELD_BITS), Some(0));
    assert_eq!(bm.try_claim(0, 1), None);
    assert!(bm.release(0, 0, FIELD_BITS));
    assert_eq!(f[0].load(Ordering::Relaxed), 0);
  }

  #[test]
  fn test_release_reports_partial_runs() {
    let f = fields::<1>();
    let bm = Bitmap::new(&f);
    assert_eq!(bm.try_claim(0, 4), Some(0));
    assert!(!bm.release(0, 2, 4));
  }

  #[test]
  fn test_no_room_for_run() {
    let f = fields::<1>();
    f[0].store(0b1010_1010, Ordering::Relaxed);
    let bm = Bitmap::new(&f);
    assert_eq!(bm.try_claim(0, 2), Some(8));
    f[0].store(FIELD_FULL >> 1, Ordering::Relaxed);
    assert_eq!(bm.try_claim(0, 2), None);
    assert_eq!(bm.try_claim(0, 1), Some(FIELD_BITS - 1));
  }

  #[test]
  fn test_claim_from_wraps() {
    let f = fields::<3>();
    f[2].store(FIELD_FULL, Ordering::Relaxed);
    let bm = Bitmap::new(&f);
    assert_eq!(bm.try_claim_from(2, 4), Some(BitmapIndex::new(0, 0)));
  }

  #[test]
  fn test_claim_reports_prior_state() {
    let f = fields::<1>();
    let bm = Bitmap::new(&f);
    assert_eq!(bm.claim(BitmapIndex::new(0, 0), 2), (true, true));
    assert_eq!(bm.claim(BitmapIndex::new(0, 1), 2), (false, true));
    assert_eq!(bm.claim(BitmapIndex::new(0, 0), 3), (false, false));
    assert!(bm.is_claimed(BitmapIndex::new(0, 0), 3));
    assert!(bm.is_any_claimed(BitmapIndex::new(0, 2), 4));
    assert!(!bm.is_any_claimed(BitmapIndex::new(0, 3), 4));
  }

  #[test]
  fn test_across_spans_fields() {
    let f = fields::<4>();
    // Leave only the top 8 bits of field 0 free.
    f[0].store(FIELD_FULL >> 8, Ordering::Relaxed);
    let bm = Bitmap::new(&f);
    let count = 8 + FIELD_BITS + 4;
    let idx = bm.try_claim_across(0, count).unwrap();
    assert_eq!(idx, BitmapIndex::new(0, FIELD_BITS - 8));
    assert_eq!(f[0].load(Ordering::Relaxed), FIELD_FULL);
    assert_eq!(f[1].load(Ordering::Relaxed), FIELD_FULL);
    assert_eq!(f[2].load(Ordering::Relaxed), 0b1111);
    assert!(bm.is_claimed_across(idx, count));
    assert!(bm.release_across(idx, count));
    assert_eq!(f[0].load(Ordering::Relaxed), FIELD_FULL >> 8);
    assert_eq!(f[1].load(Ordering::Relaxed), 0);
    assert_eq!(f[2].load(Ordering::Relaxed), 0);
  }

  #[test]
  fn test_across_rolls_back_on_conflict() {
    let f = fields::<3>();
    f[0].store(FIELD_FULL >> 4, Ordering::Relaxed);
    f[2].store(1, Ordering::Relaxed);
    let bm = Bitmap::new(&f);
    // Needs 4 + 64 + 1 bits, but field 2's low bit is taken.
    let fields_before: Vec<usize> = f.iter().map(|w| w.load(Ordering::Relaxed)).collect();
    let claimed = bm.try_claim_field_across(0, 4 + FIELD_BITS + 1);
    assert_eq!(claimed, None);
    let fields_after: Vec<usize> = f.iter().map(|w| w.load(Ordering::Relaxed)).collect();
    assert_eq!(fields_before, fields_after);
  }

  #[test]
  fn test_lock_across_rollback_restores_fields() {
    let f = fields::<3>();
    f[2].store(1, Ordering::Relaxed);
    let bm = Bitmap::new(&f);
    let idx = BitmapIndex::new(0, FIELD_BITS - 2);
    assert!(!bm.lock_across(idx, 2, 1, 1));
    assert_eq!(f[0].load(Ordering::Relaxed), 0);
    assert_eq!(f[1].load(Ordering::Relaxed), 0);
    assert_eq!(f[2].load(Ordering::Relaxed), 1);
  }
}
