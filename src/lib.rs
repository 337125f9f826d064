#![no_std]
#![allow(unused_unsafe)]
extern crate maybe_std as base;

/// A smart pointer that keeps track of how many pointers refer to the same allocation and
/// exposes this information in its API.
pub trait ReferenceCounted<T: ?Sized>: Clone {
    /// Get the number of owning pointers referring to the same allocation.
    ///
    /// An empty pointer refers to no allocation and reports a count of zero.
    fn reference_count(this: &Self) -> usize;
}

#[cfg(feature = "handle")]
mod handle;
#[cfg(feature = "handle")]
pub use handle::*;
