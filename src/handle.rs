// This code is adapted from the rust standard library Rc.

use base::alloc::{alloc, dealloc, Layout};
use base::cell::Cell;
use base::cmp::Ordering;
use base::convert::From;
use base::fmt;
use base::hash::{Hash, Hasher};
use base::marker::{PhantomData, Unpin};
use base::mem;
use base::ops::Deref;
use base::ptr::{self, NonNull};

use base::prelude::v1::*;

use crate::ReferenceCounted;

/// A non-thread-safe reference-counted owning handle.
///
/// A `Handle` is either *empty* (it refers to no value, like a null pointer)
/// or it shares ownership of a heap-allocated value with every other handle
/// cloned from the same origin. The shared count lives in its own allocation,
/// separate from the value, so the wrapped type needs no knowledge of the
/// counting and trait objects can be adopted from an already-coerced `Box`.
///
/// Dropping the last handle of a group releases the count storage and then
/// the value. Moving a handle transfers ownership without touching the count;
/// only [`Clone`] increments it.
///
/// The count is an unsynchronized [`Cell`], making `Handle` neither [`Send`]
/// nor [`Sync`]; sharing across threads is not supported.
pub struct Handle<T: ?Sized> {
    inner: Option<Inner<T>>,
    phantom: PhantomData<T>,
}

struct Inner<T: ?Sized> {
    value: NonNull<T>,
    count: NonNull<Cell<usize>>,
}

impl<T: ?Sized> Clone for Inner<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Inner<T> {}

impl<T: ?Sized> Inner<T> {
    #[inline]
    fn count_cell(&self) -> &Cell<usize> {
        // This unsafety is ok because while any handle of the group is alive
        // we're guaranteed that the count allocation is valid.
        unsafe { self.count.as_ref() }
    }

    fn count(&self) -> usize {
        self.count_cell().get()
    }

    #[inline]
    fn inc_count(&self) {
        let count = self.count();

        // We want to abort on overflow instead of dropping the value.
        // The count will never be zero when this is called; nevertheless,
        // we insert an abort here to hint LLVM at an otherwise missed
        // optimization.
        if count == 0 || count == usize::MAX {
            panic!();
        }
        self.count_cell().set(count + 1);
    }

    #[inline]
    fn dec_count(&self) -> usize {
        let count = self.count() - 1;
        self.count_cell().set(count);
        count
    }
}

/// The error returned when the count storage of a new handle cannot be
/// allocated. The value the handle was to own has already been released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation error")
    }
}

fn alloc_count() -> Result<NonNull<Cell<usize>>, AllocError> {
    let layout = Layout::new::<Cell<usize>>();
    let ptr = unsafe { alloc(layout) }.cast::<Cell<usize>>();
    match NonNull::new(ptr) {
        Some(count) => {
            unsafe { count.as_ptr().write(Cell::new(1)) };
            Ok(count)
        }
        None => Err(AllocError),
    }
}

impl<T: ?Sized> Handle<T> {
    /// Creates an empty handle, owning nothing.
    ///
    /// Empty handles can be dropped, cloned, and assigned over freely; only
    /// dereferencing them is an error.
    pub fn empty() -> Handle<T> {
        Handle { inner: None, phantom: PhantomData }
    }

    /// Creates a handle from an explicit null pointer value.
    ///
    /// Observably identical to [`Handle::empty`]; provided so call sites
    /// modelling a nulled-out pointer can say so.
    pub fn null() -> Handle<T> {
        Handle::empty()
    }

    /// Takes ownership of an already-boxed value, allocating the shared
    /// count for it.
    ///
    /// Construction is atomic: if the count storage cannot be allocated, the
    /// boxed value is released and the failure is reported, leaving no
    /// half-initialized handle behind.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_handle::Handle;
    ///
    /// let value: Box<dyn std::fmt::Display> = Box::new(4u8);
    /// let handle = Handle::try_from_box(value).unwrap();
    /// assert_eq!(format!("{}", &*handle), "4");
    /// ```
    pub fn try_from_box(value: Box<T>) -> Result<Handle<T>, AllocError> {
        // The count is allocated before the box is dismantled; on failure
        // the box is still owned here and drops normally.
        let count = alloc_count()?;
        let value = NonNull::from(Box::leak(value));
        Ok(Handle { inner: Some(Inner { value, count }), phantom: PhantomData })
    }

    /// Returns a reference to the owned value, or `None` for an empty handle.
    pub fn get(this: &Self) -> Option<&T> {
        this.inner.as_ref().map(|inner| {
            // This unsafety is ok because while this handle is alive we're
            // guaranteed that the value pointer is valid.
            unsafe { inner.value.as_ref() }
        })
    }

    /// Returns a mutable reference to the owned value if this handle is the
    /// only one referring to it, and `None` otherwise (or when empty).
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        match this.inner {
            Some(inner) if inner.count() == 1 => Some(unsafe { &mut *inner.value.as_ptr() }),
            _ => None,
        }
    }

    /// Returns `true` if this handle owns nothing.
    pub fn is_empty(this: &Self) -> bool {
        this.inner.is_none()
    }

    /// Returns `true` if the two handles share one value and one count.
    ///
    /// Two empty handles compare equal.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        match (this.inner, other.inner) {
            (Some(a), Some(b)) => a.count == b.count,
            (None, None) => true,
            _ => false,
        }
    }

    /// Moves the handle out, leaving `this` empty.
    ///
    /// The count is not touched: the returned handle simply takes over the
    /// membership `this` held.
    pub fn take(this: &mut Self) -> Handle<T> {
        mem::replace(this, Handle::empty())
    }

    /// Get the number of handles sharing this handle's value, or zero for an
    /// empty handle.
    pub fn reference_count(this: &Self) -> usize {
        match this.inner {
            Some(inner) => inner.count(),
            None => 0,
        }
    }
}

impl<T> Handle<T> {
    /// Allocates `value` on the heap and returns the sole handle owning it.
    ///
    /// # Panics
    ///
    /// Panics if the count storage cannot be allocated. Use
    /// [`Handle::try_new`] to handle that failure.
    pub fn new(value: T) -> Handle<T> {
        Handle::from(Box::new(value))
    }

    /// Fallible version of [`Handle::new`]. On count-allocation failure the
    /// value is dropped and the error returned.
    pub fn try_new(value: T) -> Result<Handle<T>, AllocError> {
        Handle::try_from_box(Box::new(value))
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    /// Makes a clone of the `Handle`.
    ///
    /// This creates another handle to the same allocation, increasing the
    /// shared count. Cloning an empty handle yields an empty handle.
    #[inline]
    fn clone(&self) -> Handle<T> {
        match self.inner {
            Some(inner) => {
                inner.inc_count();
                Handle { inner: Some(inner), phantom: PhantomData }
            }
            None => Handle::empty(),
        }
    }

    /// Assigns `source`'s value to this handle, releasing whatever this
    /// handle held before.
    ///
    /// The source's membership is adopted before the old membership is
    /// released, so assignment between handles of the same group never drives
    /// the count to zero; assigning a handle its own group is a no-op.
    fn clone_from(&mut self, source: &Handle<T>) {
        if Handle::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized> Drop for Handle<T> {
    /// Drops the `Handle`.
    ///
    /// This will decrement the shared count if the handle is non-empty;
    /// dropping an empty handle does nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_handle::Handle;
    ///
    /// struct Foo;
    ///
    /// impl Drop for Foo {
    ///     fn drop(&mut self) {
    ///         println!("dropped!");
    ///     }
    /// }
    ///
    /// let foo  = Handle::new(Foo);
    /// let foo2 = Handle::clone(&foo);
    ///
    /// drop(foo);    // Doesn't print anything
    /// drop(foo2);   // Prints "dropped!"
    /// ```
    #[inline]
    fn drop(&mut self) {
        let inner = match self.inner {
            Some(inner) => inner,
            None => return,
        };

        if inner.dec_count() == 0 {
            unsafe {
                // The count storage goes first, then the value. Dropping the
                // value through the (possibly fat) pointer runs the concrete
                // type's teardown even behind a trait-object handle.
                dealloc(inner.count.as_ptr().cast(), Layout::new::<Cell<usize>>());

                let value = inner.value.as_ptr();
                let layout = Layout::for_value(&*value);
                ptr::drop_in_place(value);
                if layout.size() != 0 {
                    dealloc(value.cast(), layout);
                }
            }
        }
    }
}

impl<T: ?Sized> Deref for Handle<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty. Use [`Handle::get`] for checked access.
    #[inline]
    fn deref(&self) -> &T {
        match Handle::get(self) {
            Some(value) => value,
            None => panic!("dereferenced an empty Handle"),
        }
    }
}

impl<T: ?Sized> AsRef<T> for Handle<T> {
    /// Same precondition as [`Deref`]: the handle must be non-empty.
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Handle::get(self) {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("Handle::empty"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(inner) => fmt::Pointer::fmt(&(inner.value.as_ptr() as *const T), f),
            None => fmt::Pointer::fmt(&ptr::null::<()>(), f),
        }
    }
}

impl<T: ?Sized> ReferenceCounted<T> for Handle<T> {
    fn reference_count(this: &Self) -> usize {
        Handle::reference_count(this)
    }
}

impl<T: ?Sized> Default for Handle<T> {
    /// Creates an empty `Handle<T>`.
    ///
    /// # Examples
    ///
    /// ```
    /// use shared_handle::Handle;
    ///
    /// let x: Handle<i32> = Default::default();
    /// assert!(Handle::is_empty(&x));
    /// ```
    fn default() -> Handle<T> {
        Handle::empty()
    }
}

impl<T: ?Sized + PartialEq> PartialEq for Handle<T> {
    /// Equality for two `Handle`s.
    ///
    /// Two non-empty `Handle`s are equal if their inner values are equal,
    /// even if they are stored in different allocations. Two empty `Handle`s
    /// are equal; an empty and a non-empty `Handle` are not.
    #[inline]
    fn eq(&self, other: &Handle<T>) -> bool {
        Handle::get(self).eq(&Handle::get(other))
    }

    /// Inequality for two `Handle`s.
    ///
    /// Two `Handle`s are unequal if their inner values are unequal. This
    /// implementation does not check for pointer equality.
    #[inline]
    fn ne(&self, other: &Handle<T>) -> bool {
        Handle::get(self).ne(&Handle::get(other))
    }
}

impl<T: ?Sized + Eq> Eq for Handle<T> {}

impl<T: ?Sized + PartialOrd> PartialOrd for Handle<T> {
    /// Partial comparison for two `Handle`s.
    ///
    /// The two are compared by calling `partial_cmp()` on their inner values;
    /// an empty `Handle` orders before any non-empty one.
    fn partial_cmp(&self, other: &Handle<T>) -> Option<Ordering> {
        Handle::get(self).partial_cmp(&Handle::get(other))
    }

    /// Less-than comparison for two `Handle`s.
    ///
    /// The two are compared by calling `<` on their inner values.
    fn lt(&self, other: &Handle<T>) -> bool {
        Handle::get(self) < Handle::get(other)
    }

    /// 'Less than or equal to' comparison for two `Handle`s.
    ///
    /// The two are compared by calling `<=` on their inner values.
    fn le(&self, other: &Handle<T>) -> bool {
        Handle::get(self) <= Handle::get(other)
    }

    /// Greater-than comparison for two `Handle`s.
    ///
    /// The two are compared by calling `>` on their inner values.
    fn gt(&self, other: &Handle<T>) -> bool {
        Handle::get(self) > Handle::get(other)
    }

    /// 'Greater than or equal to' comparison for two `Handle`s.
    ///
    /// The two are compared by calling `>=` on their inner values.
    fn ge(&self, other: &Handle<T>) -> bool {
        Handle::get(self) >= Handle::get(other)
    }
}

impl<T: ?Sized + Ord> Ord for Handle<T> {
    /// Comparison for two `Handle`s.
    ///
    /// The two are compared by calling `cmp()` on their inner values.
    fn cmp(&self, other: &Handle<T>) -> Ordering {
        Handle::get(self).cmp(&Handle::get(other))
    }
}

impl<T> From<T> for Handle<T> {
    fn from(t: T) -> Self {
        Handle::new(t)
    }
}

impl<T: ?Sized> From<Box<T>> for Handle<T> {
    /// Takes ownership of an already-boxed value.
    ///
    /// # Panics
    ///
    /// Panics if the count storage cannot be allocated; the boxed value is
    /// released first. Use [`Handle::try_from_box`] to handle that failure.
    fn from(value: Box<T>) -> Self {
        match Handle::try_from_box(value) {
            Ok(handle) => handle,
            Err(_) => panic!("memory allocation error"),
        }
    }
}

impl<T: ?Sized + Hash> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Handle::get(self).hash(state)
    }
}

impl<T: ?Sized> Unpin for Handle<T> {}
