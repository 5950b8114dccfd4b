// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where a [`Pool`][crate::Pool] gets memory once its free list runs dry.
//!
//! A pool only asks its provider when it has nothing left to hand out, and it
//! never gives memory back to the provider: blocks obtained this way join the
//! pool's circulation when they're freed. So the usual shape is an [`Arena`]
//! that a pool (or several, through `&Arena`) slowly grows into.

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use critical_section::Mutex;

/// Source of fresh blocks for a pool whose free list is empty.
pub trait Provider {
    /// Produces a region of at least `size` bytes, aligned to `align`, or
    /// `None` if that's not possible. `align` is always a power of two.
    ///
    /// The region must stay valid, and must not be handed to anyone else, for
    /// as long as the pool that asked for it is alive.
    fn provide(&self, size: usize, align: usize) -> Option<NonNull<u8>>;
}

impl<P: Provider + ?Sized> Provider for &P {
    fn provide(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        P::provide(self, size, align)
    }
}

/// A provider that never provides, giving a pool a fixed capacity.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoProvider;

impl Provider for NoProvider {
    #[inline(always)]
    fn provide(&self, _size: usize, _align: usize) -> Option<NonNull<u8>> {
        None
    }
}

/// Bump allocator over a caller-owned buffer.
///
/// Hands out aligned chunks from the front of the buffer until it's used up.
/// Nothing is ever reclaimed, which is fine for pools, since they keep every
/// block they've been given.
///
/// The bump pointer is updated in a critical section, so one arena can be
/// shared (as `&Arena`) by pools used from different contexts.
pub struct Arena<'a> {
    base: NonNull<u8>,
    len: usize,
    used: Mutex<Cell<usize>>,
    _buffer: PhantomData<&'a mut [MaybeUninit<u8>]>,
}

// Safety: the arena owns its buffer exclusively for 'a, and the only mutable
// state (the bump offset) is behind a critical section. Regions it hands out
// never overlap.
unsafe impl Send for Arena<'_> {}
unsafe impl Sync for Arena<'_> {}

impl<'a> Arena<'a> {
    /// Creates an arena carving from `buffer`.
    pub fn new(buffer: &'a mut [MaybeUninit<u8>]) -> Self {
        let len = buffer.len();
        Self {
            base: NonNull::from(buffer).cast(),
            len,
            used: Mutex::new(Cell::new(0)),
            _buffer: PhantomData,
        }
    }

    /// Total size of the buffer, in bytes.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Bytes not yet handed out. Alignment padding may make some of them
    /// unusable for a given request.
    pub fn remaining(&self) -> usize {
        critical_section::with(|cs| self.len - self.used.borrow(cs).get())
    }
}

impl Provider for Arena<'_> {
    fn provide(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        let base = self.base.as_ptr() as usize;
        critical_section::with(|cs| {
            let used = self.used.borrow(cs);
            let start = align_up(base.checked_add(used.get())?, align)?;
            let offset = start - base;
            let end = offset.checked_add(size)?;
            if end > self.len {
                return None;
            }
            used.set(end);
            // Offsetting the base pointer (rather than casting `start` back)
            // keeps the buffer's provenance.
            //
            // Safety: offset <= end <= len, so we're within the buffer.
            let p = unsafe { self.base.as_ptr().add(offset) };
            NonNull::new(p)
        })
    }
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("capacity", &self.len)
            .field("remaining", &self.remaining())
            .finish()
    }
}

fn align_up(x: usize, align: usize) -> Option<usize> {
    Some(x.checked_add(align - 1)? & !(align - 1))
}

/// Provider backed by a closure; see [`from_fn`].
#[derive(Copy, Clone)]
pub struct FromFn<F>(F);

/// Wraps a closure taking `(size, align)` as a [`Provider`].
///
/// The closure has to uphold the [`Provider::provide`] contract.
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: Fn(usize, usize) -> Option<NonNull<u8>>,
{
    FromFn(f)
}

impl<F> Provider for FromFn<F>
where
    F: Fn(usize, usize) -> Option<NonNull<u8>>,
{
    fn provide(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        (self.0)(size, align)
    }
}

impl<F> fmt::Debug for FromFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FromFn")
    }
}
