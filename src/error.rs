use thiserror::Error;

/// Conditions the allocator reports through [`AllocatorContext::report`].
///
/// Allocation entry points never return these directly to C-style callers;
/// they return null and route the error to the context's reporting path.
/// [`Heap::try_malloc_aligned`] is the one Rust-facing call that hands
/// back a `Result`.
///
/// [`AllocatorContext::report`]: crate::AllocatorContext
/// [`Heap::try_malloc_aligned`]: crate::Heap::try_malloc_aligned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("out of memory: unable to allocate {size} bytes")]
  OutOfMemory { size: usize },

  #[error("corrupted thread-free list on page {page:#x}: {count} blocks exceed capacity {capacity}")]
  CorruptFreeList {
    page: usize,
    count: usize,
    capacity: usize,
  },

  #[error("double free of block {block:#x} (block size {block_size})")]
  DoubleFree { block: usize, block_size: usize },

  #[error("timed out reserving huge OS pages: {reserved} of {requested} reserved")]
  Timeout { reserved: usize, requested: usize },

  #[error("invalid argument: {reason}")]
  InvalidArgument { reason: &'static str },

  #[error("pointer {ptr:#x} was not allocated by this allocator")]
  InvalidPointer { ptr: usize },
}

impl AllocError {
  /// Corruption is never recovered from unless a handler says otherwise.
  pub const fn is_fatal(&self) -> bool {
    matches!(self, Self::CorruptFreeList { .. } | Self::DoubleFree { .. })
  }

  /// Closest `errno` value, for the C entry points.
  pub const fn errno(&self) -> i32 {
    match self {
      Self::OutOfMemory { .. } => libc::ENOMEM,
      Self::CorruptFreeList { .. } | Self::DoubleFree { .. } => libc::EFAULT,
      Self::Timeout { .. } => libc::ETIMEDOUT,
      Self::InvalidArgument { .. } | Self::InvalidPointer { .. } => libc::EINVAL,
    }
  }
}

/// Called instead of the default report-then-abort action.
pub type ErrorHandler = fn(&AllocError);

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fatality() {
    assert!(AllocError::DoubleFree { block: 0x10, block_size: 16 }.is_fatal());
    assert!(
      AllocError::CorruptFreeList {
        page: 0x1000,
        count: 9,
        capacity: 8
      }
      .is_fatal()
    );
    assert!(!AllocError::OutOfMemory { size: 1 }.is_fatal());
    assert!(!AllocError::Timeout { reserved: 1, requested: 4 }.is_fatal());
  }

  #[test]
  fn test_messages() {
    let err = AllocError::OutOfMemory { size: 4096 };
    assert_eq!(err.to_string(), "out of memory: unable to allocate 4096 bytes");
    let err = AllocError::DoubleFree { block: 0x20, block_size: 24 };
    assert_eq!(err.to_string(), "double free of block 0x20 (block size 24)");
  }

  #[test]
  fn test_errno_mapping() {
    assert_eq!(AllocError::OutOfMemory { size: 1 }.errno(), libc::ENOMEM);
    assert_eq!(
      AllocError::InvalidArgument { reason: "alignment" }.errno(),
      libc::EINVAL
    );
  }
}
