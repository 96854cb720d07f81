//! Allocation handle threaded through every cluster context.
//!
//! Each allocation on the request path first asks the context's
//! [`Allocator`] for permission and then performs a fallible reservation.
//! Either refusal surfaces as [`Error::OutOfMemory`]. Tests install a
//! counting allocator to fail the n-th allocation of an API call.

use std::fmt;
use std::sync::Arc;

use crate::proto::error::{Error, Result};

/// Grants or refuses memory reservations.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Requests permission to allocate `bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] to refuse the allocation.
    fn reserve(&self, bytes: usize) -> Result<()>;
}

/// Allocator that always grants; real exhaustion is still caught by
/// `try_reserve`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    #[inline]
    fn reserve(&self, _bytes: usize) -> Result<()> {
        Ok(())
    }
}

/// Shared allocator handle.
pub(crate) type AllocatorRef = Arc<dyn Allocator>;

/// Builds an empty vector with room for `len` elements.
pub(crate) fn vec_with_capacity<T>(alloc: &dyn Allocator, len: usize) -> Result<Vec<T>> {
    alloc.reserve(len.saturating_mul(std::mem::size_of::<T>()))?;
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    Ok(v)
}

/// Grows `v` so that one more element fits without reallocating.
pub(crate) fn reserve_one<T>(alloc: &dyn Allocator, v: &mut Vec<T>) -> Result<()> {
    if v.len() < v.capacity() {
        return Ok(());
    }
    alloc.reserve(std::mem::size_of::<T>())?;
    v.try_reserve(1).map_err(|_| Error::OutOfMemory)
}
