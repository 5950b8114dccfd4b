// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ticks, timeouts, and the timer queue used for bounded waits.
//!
//! Time is counted in _ticks_ of a periodic interrupt. The tick rate is set
//! at startup from the system clock frequency (see [`SysTickConfig`]); a rate
//! of 1 kHz, giving millisecond ticks, is the common choice.
//!
//! # Types for describing time
//!
//! - [`TickTime`] is a point in time: ticks since the counter started. It's
//!   64 bits wide, so we ignore overflow.
//! - [`Ticks`] is an interval, in ticks. Adding one to a `TickTime` is cheap.
//! - [`Timeout`] is what blocking operations accept: don't wait at all, wait
//!   up to some number of ticks, or wait forever.
//!
//! Use [`TickRate`] to convert milliseconds or [`Duration`]s into ticks. The
//! conversions round _up_, so a timeout is never shorter than what you asked
//! for.
//!
//! # Counting and waiting
//!
//! Timekeeping is split in two:
//!
//! - A [`TickCounter`] holds the current time. It's `Sync`, so it can live in
//!   a `static` and be advanced by the tick interrupt handler calling
//!   [`TickCounter::tick`].
//! - A [`Clock`] borrows a counter and keeps a queue of processes sleeping
//!   until some deadline. The executor (or the test driving things by hand)
//!   calls [`Clock::process_timers`] to wake everyone whose deadline has
//!   arrived.
//!
//! To give up on an operation that takes too long, wrap it in
//! [`Clock::with_deadline`] or [`Clock::with_timeout`].

use core::future::Future;
use core::ops::{Add, AddAssign};
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use pin_project::pin_project;
use portable_atomic::{AtomicU64, Ordering};

use crate::list::WaitList;
use crate::Captures;

/// A point in time, as a number of ticks since the counter started.
/// System-specific analog of `std::time::Instant`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct TickTime(u64);

impl TickTime {
    /// Constructs a `TickTime` a certain number of ticks after the counter
    /// started.
    pub const fn from_ticks_since_boot(t: u64) -> Self {
        Self(t)
    }

    /// Returns the interval from `earlier` to `self`, or zero if `earlier`
    /// is actually later.
    pub fn ticks_since(self, earlier: TickTime) -> Ticks {
        Ticks(self.0.saturating_sub(earlier.0))
    }
}

/// Saturates at the end of time, so a deadline `now + Ticks(u64::MAX)` is
/// "never" rather than somewhere in the past.
impl Add<Ticks> for TickTime {
    type Output = Self;
    fn add(self, other: Ticks) -> Self::Output {
        TickTime(self.0.saturating_add(other.0))
    }
}

impl AddAssign<Ticks> for TickTime {
    fn add_assign(&mut self, other: Ticks) {
        *self = *self + other;
    }
}

impl From<TickTime> for u64 {
    fn from(t: TickTime) -> Self {
        t.0
    }
}

/// An interval measured in ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Ticks(pub u64);

impl From<u64> for Ticks {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

impl From<Ticks> for u64 {
    fn from(x: Ticks) -> Self {
        x.0
    }
}

/// Frequency of the tick interrupt, in Hz.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TickRate(u32);

impl TickRate {
    /// One tick per millisecond.
    pub const MILLIS: Self = Self(1000);

    /// Creates a tick rate of `hz` ticks per second.
    ///
    /// # Panics
    ///
    /// If `hz` is zero.
    pub const fn from_hz(hz: u32) -> Self {
        if hz == 0 {
            panic!();
        }
        Self(hz)
    }

    /// Returns the rate in Hz.
    pub const fn hz(self) -> u32 {
        self.0
    }

    /// Converts milliseconds to ticks, rounding up.
    pub fn ticks_from_millis(self, ms: u64) -> Ticks {
        Ticks(div_ceil_saturating(u128::from(ms) * u128::from(self.0), 1_000))
    }

    /// Converts a `Duration` to ticks, rounding up.
    pub fn ticks_from_duration(self, d: Duration) -> Ticks {
        Ticks(div_ceil_saturating(
            d.as_nanos().saturating_mul(u128::from(self.0)),
            1_000_000_000,
        ))
    }
}

impl Default for TickRate {
    fn default() -> Self {
        Self::MILLIS
    }
}

fn div_ceil_saturating(n: u128, d: u128) -> u64 {
    u64::try_from(n.div_ceil(d)).unwrap_or(u64::MAX)
}

/// How long a blocking operation is willing to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Don't wait. Fail right away if the resource isn't available.
    Immediate,
    /// Wait up to this many ticks.
    After(Ticks),
    /// Wait as long as it takes.
    Infinite,
}

impl Timeout {
    /// Waits up to `t` ticks. Zero ticks is the same as `Immediate`.
    pub const fn ticks(t: u64) -> Self {
        if t == 0 {
            Self::Immediate
        } else {
            Self::After(Ticks(t))
        }
    }

    /// Waits up to `ms` milliseconds, rounded up to whole ticks at `rate`.
    pub fn from_millis(ms: u64, rate: TickRate) -> Self {
        Self::ticks(rate.ticks_from_millis(ms).0)
    }

    /// Waits up to `d`, rounded up to whole ticks at `rate`.
    pub fn from_duration(d: Duration, rate: TickRate) -> Self {
        Self::ticks(rate.ticks_from_duration(d).0)
    }
}

/// Largest reload value the 24-bit SysTick down-counter accepts.
pub const SYST_RELOAD_MAX: u32 = 0x00FF_FFFF;

/// Tick source configuration derived from the system clock frequency.
///
/// The system clock (what the clock tree ends up feeding the core) is divided
/// down to the tick rate by reloading the SysTick counter every
/// `sysclk_hz / tick_hz` cycles. The division has to come out exact, or every
/// conversion between ticks and real time would drift.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SysTickConfig {
    sysclk_hz: u32,
    rate: TickRate,
    reload: u32,
}

impl SysTickConfig {
    /// Checks that `tick_hz` can be derived from `sysclk_hz` and computes the
    /// SysTick reload value.
    pub fn new(sysclk_hz: u32, tick_hz: u32) -> Result<Self, ConfigError> {
        if sysclk_hz == 0 || tick_hz == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        if sysclk_hz % tick_hz != 0 {
            return Err(ConfigError::InexactTickRate { sysclk_hz, tick_hz });
        }
        let reload = sysclk_hz / tick_hz - 1;
        // A reload value of zero stops the counter.
        if reload == 0 || reload > SYST_RELOAD_MAX {
            return Err(ConfigError::ReloadOutOfRange { reload });
        }
        Ok(Self {
            sysclk_hz,
            rate: TickRate(tick_hz),
            reload,
        })
    }

    /// System clock frequency this configuration was derived from.
    pub fn sysclk_hz(&self) -> u32 {
        self.sysclk_hz
    }

    /// Resulting tick rate.
    pub fn rate(&self) -> TickRate {
        self.rate
    }

    /// Value to program into the SysTick reload register.
    pub fn reload(&self) -> u32 {
        self.reload
    }
}

/// Reasons a [`SysTickConfig`] can't be built.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// One of the frequencies was zero.
    #[error("clock frequencies must be nonzero")]
    ZeroFrequency,
    /// The system clock isn't an exact multiple of the tick rate.
    #[error("a {tick_hz} Hz tick is not obtainable from a {sysclk_hz} Hz system clock")]
    InexactTickRate {
        /// Requested system clock.
        sysclk_hz: u32,
        /// Requested tick rate.
        tick_hz: u32,
    },
    /// The tick period is zero cycles, or too long for the 24-bit counter.
    #[error("SysTick reload value {reload} is outside 1..=0xFF_FFFF")]
    ReloadOutOfRange {
        /// Reload value that would have been needed.
        reload: u32,
    },
}

/// Programs the SysTick timer to interrupt at `config`'s tick rate.
///
/// Your SysTick handler should then call [`TickCounter::tick`] on the counter
/// your clocks use.
#[cfg(feature = "systick")]
pub fn initialize_sys_tick(
    syst: &mut cortex_m::peripheral::SYST,
    config: &SysTickConfig,
) {
    use cortex_m::peripheral::syst::SystClkSource;

    syst.set_reload(config.reload());
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_interrupt();
    syst.enable_counter();
}

/// Monotonic count of ticks, advanced by the tick source.
///
/// This is `Sync` and `const`-constructible, so it can be a `static` shared
/// with an interrupt handler.
#[derive(Debug)]
pub struct TickCounter {
    ticks: AtomicU64,
    rate: TickRate,
}

impl TickCounter {
    /// Creates a counter at time zero, ticking at `rate`.
    pub const fn new(rate: TickRate) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            rate,
        }
    }

    /// Reads the current time.
    pub fn now(&self) -> TickTime {
        TickTime(self.ticks.load(Ordering::Acquire))
    }

    /// Advances the counter by one tick. Call this from the tick interrupt.
    ///
    /// This doesn't wake anything by itself; see [`Clock::process_timers`].
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Release);
    }

    /// Advances the counter by `t` ticks at once.
    pub fn advance(&self, t: Ticks) {
        self.ticks.fetch_add(t.0, Ordering::Release);
    }

    /// Returns the rate this counter ticks at.
    pub fn rate(&self) -> TickRate {
        self.rate
    }
}

/// A timer queue on top of a [`TickCounter`].
///
/// Like other structures containing a wait list, a `Clock` must be pinned
/// before use; [`create_clock!`][crate::create_clock] does that for you.
#[derive(Debug)]
#[pin_project]
pub struct Clock<'c> {
    counter: &'c TickCounter,
    #[pin]
    timers: WaitList<TickTime>,
}

impl<'c> Clock<'c> {
    /// Creates a clock with no sleepers, reading time from `counter`.
    pub const fn new(counter: &'c TickCounter) -> Self {
        Self {
            counter,
            timers: WaitList::new(),
        }
    }

    /// Reads the current time.
    pub fn now(&self) -> TickTime {
        self.counter.now()
    }

    /// Returns the tick rate of the underlying counter.
    pub fn rate(&self) -> TickRate {
        self.counter.rate()
    }

    /// Wakes every sleeper whose deadline is at or before the current time.
    ///
    /// Returns `true` if anyone was woken.
    pub fn process_timers(self: Pin<&Self>) -> bool {
        let now = self.now();
        self.project_ref().timers.wake_while(|&deadline| deadline <= now)
    }

    /// Sleeps until the time is `>= deadline`.
    ///
    /// If `deadline` has already passed, resolves on first poll.
    ///
    /// # Cancellation
    ///
    /// **Cancel safety:** Strict.
    ///
    /// Dropping this future just removes it from the timer queue.
    pub async fn sleep_until(self: Pin<&Self>, deadline: TickTime) {
        if self.now() >= deadline {
            return;
        }
        self.project_ref().timers.join(deadline).await
    }

    /// Sleeps for `t` ticks, counted from when this is called.
    pub fn sleep_for<'a>(
        self: Pin<&'a Self>,
        t: Ticks,
    ) -> impl Future<Output = ()> + Captures<&'a Self> {
        self.sleep_until(self.now() + t)
    }

    /// Imposes a deadline on `code`.
    ///
    /// The result resolves to `Some(output)` if `code` finishes on a poll that
    /// starts before `deadline`, and `None` once the deadline has been reached.
    /// The deadline is checked first, so if both happen at once, the deadline
    /// wins.
    ///
    /// `code` is not dropped when the deadline passes, but when the returned
    /// future is; `await` takes care of that promptly.
    pub fn with_deadline<'a, F>(
        self: Pin<&'a Self>,
        deadline: TickTime,
        code: F,
    ) -> impl Future<Output = Option<F::Output>> + Captures<&'a Self>
    where
        F: Future,
    {
        TimeLimited {
            limiter: self.sleep_until(deadline),
            process: code,
        }
    }

    /// Imposes a timeout on `code`: a deadline of `now + timeout`, where `now`
    /// is captured when this is called (not at first poll).
    pub fn with_timeout<'a, F>(
        self: Pin<&'a Self>,
        timeout: Ticks,
        code: F,
    ) -> impl Future<Output = Option<F::Output>> + Captures<&'a Self>
    where
        F: Future,
    {
        self.with_deadline(self.now() + timeout, code)
    }
}

/// Gates polling `process` on whether `limiter` has resolved yet.
#[derive(Debug)]
#[pin_project]
struct TimeLimited<A, B> {
    #[pin]
    limiter: A,
    #[pin]
    process: B,
}

impl<A, B> Future for TimeLimited<A, B>
where
    A: Future<Output = ()>,
    B: Future,
{
    type Output = Option<B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let p = self.project();
        if let Poll::Ready(()) = p.limiter.poll(cx) {
            return Poll::Ready(None);
        }
        p.process.poll(cx).map(Some)
    }
}

/// Convenience macro for creating a pinned [`Clock`] on the stack.
///
/// `create_clock!(ident, &counter)` declares a local `ident` of type
/// `Pin<&Clock>` reading time from `counter`.
#[macro_export]
macro_rules! create_clock {
    ($var:ident, $counter:expr) => {
        let $var = core::pin::pin!($crate::time::Clock::new($counter));
        let $var = $var.into_ref();
    };
}

#[cfg(test)]
mod tests {
    use core::future::{pending, Future};
    use core::pin::pin;
    use core::sync::atomic::Ordering;
    use core::task::{Context, Poll};
    use core::time::Duration;

    use super::*;
    use crate::test_util::spy_waker;

    #[test]
    fn millis_round_up() {
        assert_eq!(TickRate::MILLIS.ticks_from_millis(0), Ticks(0));
        assert_eq!(TickRate::MILLIS.ticks_from_millis(100), Ticks(100));

        let slow = TickRate::from_hz(300);
        assert_eq!(slow.ticks_from_millis(1), Ticks(1));
        assert_eq!(slow.ticks_from_millis(10), Ticks(3));
        assert_eq!(slow.ticks_from_millis(1000), Ticks(300));

        let fast = TickRate::from_hz(10_000);
        assert_eq!(fast.ticks_from_millis(100), Ticks(1000));
    }

    #[test]
    fn durations_round_up() {
        let r = TickRate::MILLIS;
        assert_eq!(r.ticks_from_duration(Duration::from_micros(1)), Ticks(1));
        assert_eq!(r.ticks_from_duration(Duration::from_micros(1500)), Ticks(2));
        assert_eq!(r.ticks_from_duration(Duration::from_secs(2)), Ticks(2000));
        assert_eq!(r.ticks_from_duration(Duration::MAX), Ticks(u64::MAX));
    }

    #[test]
    fn deadlines_saturate() {
        let t = TickTime::from_ticks_since_boot(5);
        assert_eq!(
            t + Ticks(u64::MAX),
            TickTime::from_ticks_since_boot(u64::MAX),
        );

        let mut u = TickTime::from_ticks_since_boot(u64::MAX - 1);
        u += Ticks(3);
        assert_eq!(u, TickTime::from_ticks_since_boot(u64::MAX));
    }

    #[test]
    fn zero_timeout_is_immediate() {
        assert_eq!(Timeout::ticks(0), Timeout::Immediate);
        assert_eq!(Timeout::ticks(5), Timeout::After(Ticks(5)));
        assert_eq!(
            Timeout::from_millis(100, TickRate::MILLIS),
            Timeout::After(Ticks(100)),
        );
        assert_eq!(
            Timeout::from_duration(Duration::ZERO, TickRate::MILLIS),
            Timeout::Immediate,
        );
    }

    #[test]
    fn systick_config_from_sysclk() {
        let cfg = SysTickConfig::new(170_000_000, 1000).unwrap();
        assert_eq!(cfg.reload(), 169_999);
        assert_eq!(cfg.rate(), TickRate::MILLIS);
        assert_eq!(cfg.sysclk_hz(), 170_000_000);

        let cfg = SysTickConfig::new(26_000_000, 1000).unwrap();
        assert_eq!(cfg.reload(), 25_999);

        // 16 MHz / 1 Hz still fits in 24 bits.
        let cfg = SysTickConfig::new(16_000_000, 1).unwrap();
        assert_eq!(cfg.reload(), 15_999_999);
        assert_eq!(cfg.rate().hz(), 1);
    }

    #[test]
    fn systick_config_rejects_bad_rates() {
        assert_eq!(SysTickConfig::new(0, 1000), Err(ConfigError::ZeroFrequency));
        assert_eq!(SysTickConfig::new(1000, 0), Err(ConfigError::ZeroFrequency));
        assert_eq!(
            SysTickConfig::new(170_000_000, 10),
            Err(ConfigError::ReloadOutOfRange { reload: 16_999_999 }),
        );
        assert_eq!(
            SysTickConfig::new(16_000_000, 16_000_000),
            Err(ConfigError::ReloadOutOfRange { reload: 0 }),
        );
        let cfg = SysTickConfig::new(16_000_000, 8_000_000).unwrap();
        assert_eq!(cfg.reload(), 1);
        assert_eq!(
            SysTickConfig::new(16_000_000, 3000),
            Err(ConfigError::InexactTickRate {
                sysclk_hz: 16_000_000,
                tick_hz: 3000,
            }),
        );
        assert_eq!(
            SysTickConfig::new(1000, 2000),
            Err(ConfigError::InexactTickRate {
                sysclk_hz: 1000,
                tick_hz: 2000,
            }),
        );
    }

    #[test]
    fn counter_advances() {
        let counter = TickCounter::new(TickRate::MILLIS);
        assert_eq!(counter.now(), TickTime::default());
        counter.tick();
        counter.advance(Ticks(9));
        assert_eq!(counter.now(), TickTime::from_ticks_since_boot(10));
        assert_eq!(
            counter.now().ticks_since(TickTime::from_ticks_since_boot(4)),
            Ticks(6),
        );
    }

    #[test]
    fn sleep_until_past_is_ready() {
        let counter = TickCounter::new(TickRate::MILLIS);
        counter.advance(Ticks(50));
        crate::create_clock!(clock, &counter);

        let (_, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let fut = pin!(clock.sleep_until(TickTime::from_ticks_since_boot(50)));
        assert!(fut.poll(&mut ctx).is_ready());
    }

    #[test]
    fn sleep_for_wakes_at_deadline() {
        let counter = TickCounter::new(TickRate::MILLIS);
        crate::create_clock!(clock, &counter);

        let (wakes, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let mut fut = pin!(clock.sleep_for(Ticks(3)));
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        counter.advance(Ticks(2));
        assert!(!clock.process_timers());
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        counter.tick();
        assert!(clock.process_timers());
        assert_eq!(wakes.load(Ordering::Relaxed), 1);
        assert!(fut.as_mut().poll(&mut ctx).is_ready());
    }

    #[test]
    fn with_timeout_gives_up_at_deadline() {
        let counter = TickCounter::new(TickRate::MILLIS);
        crate::create_clock!(clock, &counter);

        let (_, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let mut fut = pin!(clock.with_timeout(Ticks(100), pending::<()>()));
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        counter.advance(Ticks(99));
        clock.process_timers();
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        counter.tick();
        clock.process_timers();
        assert_eq!(fut.as_mut().poll(&mut ctx), Poll::Ready(None));
    }

    #[test]
    fn longest_timeout_is_not_already_expired() {
        let counter = TickCounter::new(TickRate::MILLIS);
        counter.advance(Ticks(5));
        crate::create_clock!(clock, &counter);

        let (_, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let mut fut = pin!(clock.with_timeout(Ticks(u64::MAX), pending::<()>()));
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        counter.advance(Ticks(1_000_000));
        assert!(!clock.process_timers());
        assert!(fut.as_mut().poll(&mut ctx).is_pending());
    }

    #[test]
    fn with_deadline_passes_through_result() {
        let counter = TickCounter::new(TickRate::MILLIS);
        crate::create_clock!(clock, &counter);

        let (_, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let fut = pin!(clock.with_deadline(
            TickTime::from_ticks_since_boot(10),
            async { 42 },
        ));
        assert_eq!(fut.poll(&mut ctx), Poll::Ready(Some(42)));
    }

    #[test]
    fn timers_wake_in_deadline_order() {
        let counter = TickCounter::new(TickRate::MILLIS);
        crate::create_clock!(clock, &counter);

        let (_, waker) = spy_waker();
        let mut ctx = Context::from_waker(&waker);

        let mut late = pin!(clock.sleep_for(Ticks(20)));
        let mut early = pin!(clock.sleep_for(Ticks(5)));
        assert!(late.as_mut().poll(&mut ctx).is_pending());
        assert!(early.as_mut().poll(&mut ctx).is_pending());

        counter.advance(Ticks(5));
        clock.process_timers();
        assert!(early.as_mut().poll(&mut ctx).is_ready());
        assert!(late.as_mut().poll(&mut ctx).is_pending());

        counter.advance(Ticks(15));
        clock.process_timers();
        assert!(late.as_mut().poll(&mut ctx).is_ready());
    }
}
