// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [counting semaphore] with bounded waits.
//!
//! This is what turns a plain free list into a
//! [`GuardedPool`][crate::guarded::GuardedPool]: the pool keeps one permit
//! per free block, and allocating means taking a permit first.
//!
//! [counting semaphore]: https://en.wikipedia.org/wiki/Semaphore_(programming)

use core::pin::Pin;

use pin_project::pin_project;
use portable_atomic::{AtomicUsize, Ordering};

use crate::list::WaitList;
use crate::time::{Clock, Ticks, Timeout};

/// A [counting semaphore].
///
/// A `Semaphore` holds some number of _permits._ [`Semaphore::acquire`] takes
/// one, blocking until one is available; [`Semaphore::release`] puts one back,
/// waking a blocked acquirer if there is one.
///
/// There's no "permit object" here: permits are plain counts, and whoever
/// takes one is responsible for eventually giving it back (or not, if it
/// stands for something that was consumed). This suits the producer/consumer
/// shape where `release` and `acquire` happen in different places, which is
/// exactly how pools use it.
///
/// Like everything containing a [`WaitList`], a `Semaphore` must be pinned:
///
/// ```ignore
/// let permits = pin!(Semaphore::new(5));
/// let permits = permits.into_ref();
///
/// permits.acquire().await;
/// ```
///
/// or, equivalently, [`create_semaphore!`][crate::create_semaphore].
///
/// # Fairness
///
/// Permits are handed out in the order they're requested. Once anyone is
/// waiting, a released permit goes straight to the oldest waiter instead of
/// back into the count, so late arrivals can't barge in.
///
/// [counting semaphore]: https://en.wikipedia.org/wiki/Semaphore_(programming)
#[derive(Debug)]
#[pin_project]
pub struct Semaphore {
    available: AtomicUsize,
    #[pin]
    waiters: WaitList<()>,
}

impl Semaphore {
    /// Returns a `Semaphore` holding `permits` permits. It needs to be pinned
    /// before use.
    pub const fn new(permits: usize) -> Self {
        Semaphore {
            available: AtomicUsize::new(permits),
            waiters: WaitList::new(),
        }
    }

    /// Takes one permit, waiting as long as it takes.
    ///
    /// # Cancellation
    ///
    /// Cancel-safe, but dropping the future loses your place in line.
    ///
    /// If a permit had already been handed to this future when it's dropped,
    /// the permit is released again, so nothing leaks.
    pub async fn acquire(self: Pin<&Self>) {
        if self.try_acquire().is_ok() {
            return;
        }

        self.project_ref()
            .waiters
            .join_with_cleanup((), || {
                // We were handed a permit but are being dropped before we
                // could notice. Pass it on.
                self.release();
            })
            .await
    }

    /// Takes one permit if one is available right now.
    pub fn try_acquire(&self) -> Result<(), WaitError> {
        self.available
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |a| {
                a.checked_sub(1)
            })
            .map_err(|_| WaitError::NoPermits)?;
        Ok(())
    }

    /// Takes one permit, waiting according to `timeout`.
    ///
    /// - `Timeout::Immediate` never suspends, and fails with
    ///   [`WaitError::NoPermits`] if nothing is available. So does a
    ///   zero-tick `Timeout::After`.
    /// - `Timeout::After(t)` waits up to `t` ticks of `clock`, failing with
    ///   [`WaitError::TimedOut`].
    /// - `Timeout::Infinite` is [`Semaphore::acquire`].
    ///
    /// A timed-out wait leaves the permit count as it found it.
    ///
    /// # Cancellation
    ///
    /// Same as [`Semaphore::acquire`].
    pub async fn acquire_timeout(
        self: Pin<&Self>,
        clock: Pin<&Clock<'_>>,
        timeout: Timeout,
    ) -> Result<(), WaitError> {
        match timeout {
            Timeout::Immediate | Timeout::After(Ticks(0)) => {
                self.try_acquire()
            }
            Timeout::Infinite => {
                self.acquire().await;
                Ok(())
            }
            Timeout::After(t) => {
                let r = clock.with_timeout(t, self.acquire()).await;
                if r.is_none() {
                    tracing::debug!(ticks = t.0, "semaphore wait timed out");
                }
                r.ok_or(WaitError::TimedOut)
            }
        }
    }

    /// Returns how many permits are available.
    ///
    /// This is a snapshot: by the time you act on it, someone else may have
    /// taken some.
    pub fn permits_available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Checks whether anyone is blocked in `acquire`.
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Puts one permit back.
    #[inline(always)]
    pub fn release(self: Pin<&Self>) {
        self.release_multiple(1)
    }

    /// Puts `n` permits back. Waiters are served first, oldest first; whatever
    /// is left over goes into the count.
    pub fn release_multiple(self: Pin<&Self>, mut n: usize) {
        let p = self.project_ref();
        let mut handed_over = 0;
        while n > 0 && p.waiters.wake_one() {
            n -= 1;
            handed_over += 1;
        }
        if handed_over > 0 {
            tracing::trace!(handed_over, "transferred permits to waiters");
        }

        if n > 0 {
            // Nothing can join the wait list while we're in here: joining
            // takes a poll, and we don't yield. So the list is still empty.
            //
            // Atomic addition wraps on overflow.
            self.available.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Why a permit couldn't be taken.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum WaitError {
    /// None were available and the caller wasn't willing to wait.
    #[error("no permits available")]
    NoPermits,
    /// None became available before the timeout expired.
    #[error("timed out waiting for a permit")]
    TimedOut,
}

/// Convenience macro for creating a [`Semaphore`] on the stack.
///
/// `create_semaphore!(ident, num_permits)` declares a local `ident` of type
/// `Pin<&Semaphore>` holding `num_permits` permits.
#[macro_export]
macro_rules! create_semaphore {
    ($var:ident, $permits:expr) => {
        let $var = core::pin::pin!($crate::semaphore::Semaphore::new($permits));
        let $var = $var.into_ref();
    };
}
