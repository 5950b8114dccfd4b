// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pools you can wait on.
//!
//! A [`GuardedPool`] is a [`Pool`] with a [`Semaphore`] counting its free
//! blocks. Allocating takes a permit and then a block; freeing pushes the
//! block and then releases a permit, which goes straight to the oldest
//! blocked allocator if there is one. Since permits and free blocks move in
//! lock-step, holding a permit means a block is there to be taken.
//!
//! Guarded pools have no provider. Their capacity is whatever has been loaded
//! or freed into them.
//!
//! ```ignore
//! create_guarded_pool!(buffers, 64);
//! buffers.load_array(&mut STORAGE);
//!
//! let b = buffers.alloc_timeout(clock, Timeout::from_millis(100, rate)).await?;
//! ```

use core::pin::Pin;
use core::ptr::NonNull;

use pin_project::pin_project;

use crate::pool::{AllocError, Pool, Slot};
use crate::provider::NoProvider;
use crate::semaphore::Semaphore;
use crate::time::{Clock, Timeout};

/// A fixed-capacity pool whose allocations can wait for a block to be freed.
///
/// This must be pinned to be used; see [`create_guarded_pool!`].
///
/// [`create_guarded_pool!`]: crate::create_guarded_pool
#[derive(Debug)]
#[pin_project]
pub struct GuardedPool<'a> {
    pool: Pool<'a>,
    #[pin]
    permits: Semaphore,
}

impl<'a> GuardedPool<'a> {
    /// Creates an empty guarded pool of `block_size` byte blocks with natural
    /// alignment. It needs to be pinned before use.
    pub const fn new(block_size: usize) -> Self {
        Self {
            pool: Pool::new(block_size),
            permits: Semaphore::new(0),
        }
    }

    /// Creates an empty guarded pool of `block_size` byte blocks aligned to
    /// `align`, which must be a power of two. Rounding is as for
    /// [`Pool::with_alignment`].
    pub const fn with_alignment(block_size: usize, align: usize) -> Self {
        Self {
            pool: Pool::with_alignment(block_size, align, NoProvider),
            permits: Semaphore::new(0),
        }
    }

    /// Size of each block, after rounding.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Number of blocks that can be allocated right now without waiting.
    ///
    /// This is a snapshot and may be stale by the time you look at it.
    pub fn available(&self) -> usize {
        self.permits.permits_available()
    }

    /// Adds every slot in `slots` to the pool, waking up to that many blocked
    /// allocators.
    ///
    /// # Panics
    ///
    /// If `Slot<T>` is smaller or less aligned than this pool's blocks.
    pub fn load_array<T>(self: Pin<&Self>, slots: &'a mut [Slot<T>]) {
        let p = self.project_ref();
        let count = p.pool.load_array(slots);
        p.permits.release_multiple(count);
    }

    /// Adds `count` blocks carved out of the memory at `base`, waking up to
    /// that many blocked allocators.
    ///
    /// # Safety
    ///
    /// As for [`Pool::load_raw`].
    pub unsafe fn load_raw(self: Pin<&Self>, base: NonNull<u8>, count: usize) {
        let p = self.project_ref();
        // Safety: passed through from our caller.
        unsafe { p.pool.load_raw(base, count) };
        p.permits.release_multiple(count);
    }

    /// Takes a block, waiting according to `timeout` if none is free.
    ///
    /// - `Timeout::Immediate` never suspends, and fails with
    ///   [`AllocError::Exhausted`] if the pool is empty.
    /// - `Timeout::After(t)` waits for up to `t` ticks of `clock`, and fails
    ///   with [`AllocError::TimedOut`] if nothing is freed by then.
    /// - `Timeout::Infinite` waits as long as it takes, like
    ///   [`GuardedPool::alloc`].
    ///
    /// Waiters are served in the order they arrived.
    ///
    /// # Cancellation
    ///
    /// Cancel-safe, but dropping the future loses your place in line. A block
    /// freed to this future just before it was dropped stays in the pool.
    pub async fn alloc_timeout(
        self: Pin<&Self>,
        clock: Pin<&Clock<'_>>,
        timeout: Timeout,
    ) -> Result<NonNull<u8>, AllocError> {
        self.project_ref()
            .permits
            .acquire_timeout(clock, timeout)
            .await?;
        Ok(self.take_reserved())
    }

    /// Takes a block if one is free, without waiting.
    pub fn try_alloc(&self) -> Result<NonNull<u8>, AllocError> {
        self.permits.try_acquire()?;
        Ok(self.take_reserved())
    }

    /// Takes a block, waiting for as long as it takes.
    ///
    /// # Cancellation
    ///
    /// Same as [`GuardedPool::alloc_timeout`].
    pub async fn alloc(self: Pin<&Self>) -> NonNull<u8> {
        self.project_ref().permits.acquire().await;
        self.take_reserved()
    }

    /// Gives a block back, handing it to the oldest blocked allocator if there
    /// is one.
    ///
    /// # Safety
    ///
    /// As for [`Pool::free`]: `block` must fit this pool's block size and
    /// alignment, must not already be free, and must not be used afterwards.
    pub unsafe fn free(self: Pin<&Self>, block: NonNull<u8>) {
        let p = self.project_ref();
        // The block has to be on the list before its permit can be taken.
        // Safety: passed through from our caller.
        unsafe { p.pool.free(block) };
        p.permits.release();
    }

    /// Pops a block we hold a permit for.
    fn take_reserved(&self) -> NonNull<u8> {
        match self.pool.take() {
            Some(block) => block,
            // Permits never outnumber free blocks.
            None => panic!(),
        }
    }
}

/// Convenience macro for creating a [`GuardedPool`] on the stack.
///
/// `create_guarded_pool!(ident, block_size)` declares a local `ident` of type
/// `Pin<&GuardedPool>`; `create_guarded_pool!(ident, block_size, align)` does
/// the same with explicit alignment.
#[macro_export]
macro_rules! create_guarded_pool {
    ($var:ident, $block_size:expr) => {
        let $var = core::pin::pin!(
            $crate::guarded::GuardedPool::new($block_size)
        );
        let $var = $var.into_ref();
    };
    ($var:ident, $block_size:expr, $align:expr) => {
        let $var = core::pin::pin!(
            $crate::guarded::GuardedPool::with_alignment($block_size, $align)
        );
        let $var = $var.into_ref();
    };
}
