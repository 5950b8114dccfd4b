// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block pools.
//!
//! A [`Pool`] keeps an intrusive singly linked list of free blocks: each free
//! block's first word points at the next one. Taking a block pops the head,
//! giving one back pushes it, and both happen inside a critical section, so
//! they're constant time and safe to use from interrupt handlers.
//!
//! Blocks get into a pool in three ways:
//!
//! - In bulk, from an array of [`Slot`]s ([`Pool::load_array`]) or from raw
//!   memory ([`Pool::load_raw`]).
//! - From the pool's [`Provider`], on demand, when the free list is empty.
//! - By being freed ([`Pool::free`]). Any block of suitable size and alignment
//!   can be freed into a pool, even one that didn't come from it; that's how a
//!   pool grows.
//!
//! A pool never blocks. If you want to wait for a block, see
//! [`GuardedPool`][crate::guarded::GuardedPool].

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of, ManuallyDrop, MaybeUninit};
use core::ptr::NonNull;

use critical_section::Mutex;

use crate::cheap_assert;
use crate::provider::{NoProvider, Provider};
use crate::semaphore::WaitError;

/// Header written into each block while it sits on a free list.
struct FreeBlock {
    next: Link,
}

type Link = Option<NonNull<FreeBlock>>;

/// Storage for one pool block holding a `T`.
///
/// A `Slot<T>` is big enough and aligned enough to be either a `T` or a free
/// list link, so an array of them can be handed to [`Pool::load_array`]
/// without worrying about the pool's minimum block size:
///
/// ```ignore
/// static mut BUFFERS: [Slot<[u8; 64]>; 8] = Slot::array();
/// ```
#[repr(C)]
pub union Slot<T> {
    _link: Link,
    _value: ManuallyDrop<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const EMPTY: Self = Slot { _link: None };

    /// Returns an empty slot.
    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// Returns an array of `N` empty slots.
    pub const fn array<const N: usize>() -> [Self; N] {
        [Self::EMPTY; N]
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Slot")
    }
}

/// Smallest block a pool will manage: one link.
const MIN_BLOCK_SIZE: usize = size_of::<FreeBlock>();
/// Smallest alignment a pool will use, so links can be written in place.
const MIN_ALIGN: usize = align_of::<FreeBlock>();

/// Works out the block size and alignment a pool actually uses for a request.
/// The alignment is raised to at least a pointer's, the size to at least one
/// pointer and then up to a multiple of the alignment.
const fn block_layout(size: usize, align: usize) -> (usize, usize) {
    cheap_assert!(align.is_power_of_two());
    let align = if align > MIN_ALIGN { align } else { MIN_ALIGN };
    let size = if size > MIN_BLOCK_SIZE { size } else { MIN_BLOCK_SIZE };
    let size = (size + align - 1) & !(align - 1);
    (size, align)
}

/// A pool of fixed-size blocks.
///
/// `'a` is the lifetime of memory loaded into the pool with
/// [`Pool::load_array`]; `P` is where more blocks come from when the free list
/// is empty (by default, nowhere).
///
/// A `Pool` doesn't need to be pinned and can be placed in a `static`.
pub struct Pool<'a, P = NoProvider> {
    head: Mutex<Cell<Link>>,
    block_size: usize,
    align: usize,
    provider: P,
    _storage: PhantomData<&'a mut [u8]>,
}

// Safety: the free list is only touched inside critical sections, and the
// blocks on it are owned by the pool. Sharing the pool shares the provider.
unsafe impl<P: Send> Send for Pool<'_, P> {}
unsafe impl<P: Sync> Sync for Pool<'_, P> {}

impl Pool<'_> {
    /// Creates an empty, fixed-capacity pool of `block_size` byte blocks with
    /// natural (pointer) alignment.
    ///
    /// `block_size` is rounded up to at least the size of a pointer.
    pub const fn new(block_size: usize) -> Self {
        Self::with_alignment(block_size, MIN_ALIGN, NoProvider)
    }
}

impl<P: Provider> Pool<'_, P> {
    /// Creates an empty pool of `block_size` byte blocks, naturally aligned,
    /// that falls back to `provider` when it runs out.
    pub const fn with_provider(block_size: usize, provider: P) -> Self {
        Self::with_alignment(block_size, MIN_ALIGN, provider)
    }

    /// Creates an empty pool of `block_size` byte blocks aligned to `align`,
    /// falling back to `provider` when it runs out.
    ///
    /// `align` must be a power of two. It's raised to at least pointer
    /// alignment, and `block_size` is rounded up to a multiple of it.
    pub const fn with_alignment(
        block_size: usize,
        align: usize,
        provider: P,
    ) -> Self {
        let (block_size, align) = block_layout(block_size, align);
        Self {
            head: Mutex::new(Cell::new(None)),
            block_size,
            align,
            provider,
            _storage: PhantomData,
        }
    }
}

impl<'a, P: Provider> Pool<'a, P> {
    /// Size of each block, after rounding.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Alignment of each block.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Checks whether the free list is empty. A pool with a provider may still
    /// be able to allocate.
    ///
    /// This is a snapshot and may be stale by the time you look at it.
    pub fn is_empty(&self) -> bool {
        critical_section::with(|cs| self.head.borrow(cs).get().is_none())
    }

    /// Adds every slot in `slots` to the free list.
    ///
    /// The slots are borrowed for as long as the pool lives. Returns the
    /// number of blocks added.
    ///
    /// # Panics
    ///
    /// If `Slot<T>` is smaller or less aligned than this pool's blocks.
    pub fn load_array<T>(&self, slots: &'a mut [Slot<T>]) -> usize {
        cheap_assert!(size_of::<Slot<T>>() >= self.block_size);
        cheap_assert!(align_of::<Slot<T>>() >= self.align);

        let count = slots.len();
        for slot in slots {
            self.push(NonNull::from(slot).cast());
        }
        count
    }

    /// Adds `count` blocks carved out of the memory at `base` to the free
    /// list, each [`block_size`][Pool::block_size] bytes.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`align`][Pool::align] and point at
    /// `count * block_size()` bytes of writable memory that nothing else will
    /// touch while the pool is alive (other than through blocks the pool hands
    /// out).
    pub unsafe fn load_raw(&self, base: NonNull<u8>, count: usize) {
        for i in 0..count {
            // Safety: within the region our caller vouched for.
            let block = unsafe { base.as_ptr().add(i * self.block_size) };
            // Safety: derived from a non-null base without wrapping.
            self.push(unsafe { NonNull::new_unchecked(block) });
        }
    }

    /// Takes a block.
    ///
    /// If the free list is empty, asks the provider; a block from the provider
    /// is returned directly. Fails with [`AllocError::Exhausted`] if neither
    /// has anything.
    ///
    /// The block's contents are unspecified.
    pub fn alloc(&self) -> Result<NonNull<u8>, AllocError> {
        if let Some(block) = self.take() {
            return Ok(block);
        }
        match self.provider.provide(self.block_size, self.align) {
            Some(block) => {
                tracing::trace!(
                    block_size = self.block_size,
                    "pool empty, block from provider"
                );
                Ok(block)
            }
            None => {
                tracing::debug!(block_size = self.block_size, "pool exhausted");
                Err(AllocError::Exhausted)
            }
        }
    }

    /// Gives a block to the pool.
    ///
    /// # Safety
    ///
    /// `block` must be [`block_size`][Pool::block_size] bytes aligned to
    /// [`align`][Pool::align], usually because it came from this pool's
    /// `alloc`. It must not already be free, and nobody may use it after this
    /// call.
    pub unsafe fn free(&self, block: NonNull<u8>) {
        self.push(block)
    }

    /// Pops the free list without consulting the provider.
    pub(crate) fn take(&self) -> Option<NonNull<u8>> {
        critical_section::with(|cs| {
            let head = self.head.borrow(cs);
            let block = head.get()?;
            // Safety: everything on the list had a FreeBlock written into it
            // by push, and is ours until popped.
            head.set(unsafe { block.as_ptr().read().next });
            Some(block.cast())
        })
    }

    fn push(&self, block: NonNull<u8>) {
        let block = block.cast::<FreeBlock>();
        critical_section::with(|cs| {
            let head = self.head.borrow(cs);
            // Safety: the block is suitably sized and aligned, and its owner
            // has given it up.
            unsafe {
                block.as_ptr().write(FreeBlock { next: head.get() });
            }
            head.set(Some(block));
        })
    }
}

impl<P: fmt::Debug> fmt::Debug for Pool<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.block_size)
            .field("align", &self.align)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Why a block couldn't be allocated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    /// No free blocks, and none to be had without waiting.
    #[error("pool exhausted")]
    Exhausted,
    /// No block was freed before the timeout expired.
    #[error("timed out waiting for a free block")]
    TimedOut,
}

impl From<WaitError> for AllocError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::NoPermits => Self::Exhausted,
            WaitError::TimedOut => Self::TimedOut,
        }
    }
}
