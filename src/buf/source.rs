//! Sources of backing memory for buffer rings and fallback reads.

use std::fmt;

use crate::error::AllocError;

/// Supplies memory for a ring's slots and for reads the ring cannot serve.
///
/// A ring asks its source once, at registration, for `capacity * slot_len` bytes. The read
/// completion path asks it for one `slot_len` sized buffer per read that falls back to
/// ordinary allocation.
///
/// The returned vector must have a capacity of at least `len`. Its length is ignored; the
/// ring sets the length it needs.
pub trait BufSource: fmt::Debug + Send + Sync {
    /// Allocate a buffer able to hold `len` bytes.
    fn allocate(&self, len: usize) -> Result<Vec<u8>, AllocError>;
}

/// The global heap.
///
/// Allocation failures are reported rather than aborting the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSource;

impl BufSource for HeapSource {
    fn allocate(&self, len: usize) -> Result<Vec<u8>, AllocError> {
        let mut v = Vec::new();
        v.try_reserve_exact(len).map_err(|_| AllocError { len })?;
        Ok(v)
    }
}
