// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory pools for small embedded systems.
//!
//! A _pool_ hands out equally sized blocks of memory from a free list. Taking
//! a block and giving it back are both constant-time and never touch a general
//! purpose heap, which makes pools suitable for interrupt handlers and for
//! code with hard timing requirements.
//!
//! There are two flavors:
//!
//! - [`Pool`] is the plain version. Asking an empty pool for a block either
//!   falls back to a [`Provider`] (which might carve memory out of an
//!   [`Arena`], say) or fails immediately. It never blocks.
//!
//! - [`GuardedPool`] pairs a pool with a counting
//!   [`Semaphore`][semaphore::Semaphore] so that allocation can _wait_ for
//!   someone to give a block back, with a timeout measured on a
//!   [`Clock`][time::Clock]. This is the one to use when blocks circulate
//!   between producers and consumers.
//!
//! # Design principles
//!
//! 1. Be compact. Internal asserts are few and use [`cheap_assert!`], which
//!    doesn't drag format strings into flash.
//!
//! 2. No magic. Pinned objects can be created with the `create_*!` macros, but
//!    those are only shorthand for `core::pin::pin!` and `into_ref`.
//!
//! 3. Be predictable. Nothing here allocates from a heap. Every operation on a
//!    pool is bounded, except waiting, which is bounded by the timeout you ask
//!    for.
//!
//! # Concurrency
//!
//! Free-list updates happen inside a [`critical_section`], so a plain
//! [`Pool`] (and an [`Arena`] behind it) can be placed in a `static` and used
//! from interrupt handlers. The same goes for a
//! [`TickCounter`][time::TickCounter], which the tick interrupt advances.
//!
//! Everything built on a [`WaitList`][list::WaitList] is task-context only:
//! [`GuardedPool`], [`Semaphore`][semaphore::Semaphore] and
//! [`Clock`][time::Clock] are `!Sync`, and live with the tasks of one
//! executor. Interrupt handlers hand blocks to a guarded pool by way of a
//! task, and the task that owns a clock calls
//! [`Clock::process_timers`][time::Clock::process_timers] after ticks arrive.
//!
//! # Features
//!
//! - `guarded` (default): the [`guarded`] module.
//! - `systick`: pulls in `cortex-m` and provides
//!   `time::initialize_sys_tick` for programming the SysTick timer from a
//!   [`SysTickConfig`][time::SysTickConfig].

#![cfg_attr(not(test), no_std)]
#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications,
)]

/// Internal assert macro that doesn't stringify its expression or generate any
/// fancy messages. This means failures must be diagnosed by file:line only, so,
/// don't use this more than once on the same line. In exchange, this makes
/// asserts significantly smaller in terms of text size.
macro_rules! cheap_assert {
    ($x:expr) => {
        if !$x { panic!(); };
    }
}
pub(crate) use cheap_assert;

pub mod list;
pub mod time;
pub mod semaphore;
pub mod provider;
pub mod pool;
#[cfg(feature = "guarded")]
pub mod guarded;

pub use pool::{AllocError, Pool, Slot};
pub use provider::{Arena, NoProvider, Provider};
#[cfg(feature = "guarded")]
pub use guarded::GuardedPool;

/// Marker trait implementing the "Captures Trick" from Rust RFC 3498, ensuring
/// that we do lifetime capturing right in the 2021 edition.
pub trait Captures<T> {}

impl<U: ?Sized, T> Captures<T> for U {}
