//! Allocation through the game's own heap.
//!
//! Anything we hand back to the game (or that the game might free) has to come from the same
//! allocator the game uses, so it is allocated here rather than through Rust's global allocator.

#![allow(clippy::unreadable_literal)]

use std::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use thiserror::Error;

use crate::interop::Function;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("the heap could not provide {bytes} bytes")]
    Exhausted { bytes: usize },

    #[error("allocation size overflows")]
    Overflow,
}

/// A `malloc`/`free` pair.
pub trait HostAllocator {
    /// Allocates `size` bytes, returning null on failure.
    ///
    /// # Safety
    /// The returned memory is uninitialised.
    unsafe fn allocate(&self, size: usize) -> *mut u8;

    /// Frees memory returned by `allocate` on the same allocator.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` and not have been freed yet.
    unsafe fn free(&self, ptr: *mut u8);
}

impl<A: HostAllocator + ?Sized> HostAllocator for &A {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        (**self).allocate(size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        (**self).free(ptr)
    }
}

type MallocFn = extern "C" fn(usize) -> *mut u8;
type FreeFn = extern "C" fn(*mut u8);

static GAME_MALLOC: Function<MallocFn> = Function::new(0x004AD640);
static GAME_FREE: Function<FreeFn> = Function::new(0x004AD4B0);

/// The game's C runtime heap. Only usable from inside the game process.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostHeap;

impl HostAllocator for HostHeap {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        GAME_MALLOC.get()(size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        GAME_FREE.get()(ptr)
    }
}

/// The C heap of whatever process we're in.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

impl HostAllocator for SystemHeap {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        libc::malloc(size).cast()
    }

    unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr.cast())
    }
}

/// Allocates zeroed space for `count` values of `T`. Every successful call must be paired with
/// exactly one `dealloc` on the same heap.
///
/// `T` can't need more alignment than the heap guarantees (8 bytes for the game's heap).
pub fn alloc<T>(heap: &impl HostAllocator, count: usize) -> Result<NonNull<T>, AllocError> {
    let bytes = std::mem::size_of::<T>()
        .checked_mul(count)
        .ok_or(AllocError::Overflow)?;

    // Zero-sized requests still get a unique pointer.
    let request = bytes.max(1);

    let ptr = unsafe { heap.allocate(request) };
    let ptr = NonNull::new(ptr).ok_or(AllocError::Exhausted { bytes: request })?;

    unsafe {
        ptr.as_ptr().write_bytes(0, request);
    }

    Ok(ptr.cast())
}

/// Releases memory from `alloc`.
///
/// # Safety
/// `ptr` must come from `alloc` on `heap` and must not be used afterwards.
pub unsafe fn dealloc<T>(heap: &impl HostAllocator, ptr: NonNull<T>) {
    heap.free(ptr.as_ptr().cast());
}

/// A zeroed byte buffer on a host heap, freed when dropped unless ownership is given away with
/// `into_raw`.
pub struct HostBuffer<A: HostAllocator> {
    ptr: NonNull<u8>,
    len: usize,
    heap: A,
}

impl<A: HostAllocator> HostBuffer<A> {
    pub fn zeroed(heap: A, len: usize) -> Result<HostBuffer<A>, AllocError> {
        let ptr = alloc::<u8>(&heap, len)?;
        Ok(HostBuffer { ptr, len, heap })
    }

    /// Gives up ownership of the buffer. The caller becomes responsible for freeing it with the
    /// heap it came from.
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl<A: HostAllocator> Deref for HostBuffer<A> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: HostAllocator> DerefMut for HostBuffer<A> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<A: HostAllocator> Drop for HostBuffer<A> {
    fn drop(&mut self) {
        unsafe { dealloc(&self.heap, self.ptr) }
    }
}

impl<A: HostAllocator> std::fmt::Debug for HostBuffer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// The buffer owns its memory exclusively.
unsafe impl<A: HostAllocator + Send> Send for HostBuffer<A> {}

/// A growable array of plain values on a host heap. Nothing is allocated until the first push.
pub struct HostVec<T: Copy, A: HostAllocator> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    heap: A,
}

impl<T: Copy, A: HostAllocator> HostVec<T, A> {
    const MIN_CAPACITY: usize = 16;

    pub fn new(heap: A) -> HostVec<T, A> {
        HostVec {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            heap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `value`, returning its index.
    pub fn push(&mut self, value: T) -> Result<usize, AllocError> {
        if self.len == self.capacity {
            self.grow()?;
        }

        unsafe {
            self.ptr.as_ptr().add(self.len).write(value);
        }

        self.len += 1;
        Ok(self.len - 1)
    }

    fn grow(&mut self) -> Result<(), AllocError> {
        let capacity = match self.capacity {
            0 => Self::MIN_CAPACITY,
            n => n.checked_mul(2).ok_or(AllocError::Overflow)?,
        };

        let ptr = alloc::<T>(&self.heap, capacity)?;

        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), ptr.as_ptr(), self.len);

            if self.capacity > 0 {
                dealloc(&self.heap, self.ptr);
            }
        }

        self.ptr = ptr;
        self.capacity = capacity;

        Ok(())
    }
}

impl<T: Copy, A: HostAllocator> Deref for HostVec<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy, A: HostAllocator> DerefMut for HostVec<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy, A: HostAllocator> Drop for HostVec<T, A> {
    fn drop(&mut self) {
        if self.capacity > 0 {
            unsafe { dealloc(&self.heap, self.ptr) }
        }
    }
}

impl<T: Copy + std::fmt::Debug, A: HostAllocator> std::fmt::Debug for HostVec<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
