// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end pool scenarios against the public API.

use core::mem::{size_of, MaybeUninit};
use core::pin::pin;
use core::ptr::NonNull;
use core::task::{Context, Poll};
use std::future::Future;

use futures::executor::block_on;
use futures::task::noop_waker;

use rtpool::provider::from_fn;
use rtpool::time::{TickCounter, TickRate, Timeout};
use rtpool::{AllocError, Arena, Pool, Slot};

const POOL_SIZE: usize = 4;

fn distinct(blocks: &[NonNull<u8>]) -> bool {
    let mut sorted = blocks.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.len() == blocks.len()
}

#[test]
fn loading_and_emptying_a_pool() {
    let mut objects = Slot::<u32>::array::<POOL_SIZE>();
    let pool = Pool::new(size_of::<u32>());

    pool.load_array(&mut objects);

    let blocks: Vec<_> = (0..POOL_SIZE)
        .map(|_| pool.alloc().expect("list empty"))
        .collect();
    assert!(distinct(&blocks));
    assert_eq!(pool.alloc(), Err(AllocError::Exhausted), "list not empty");

    for b in blocks {
        unsafe { pool.free(b) };
    }

    for _ in 0..POOL_SIZE {
        assert!(pool.alloc().is_ok(), "list empty");
    }
    assert_eq!(pool.alloc(), Err(AllocError::Exhausted), "list not empty");
}

#[test]
fn provider_unable_to_return_memory() {
    let pool = Pool::with_provider(size_of::<u32>(), from_fn(|_, _| None));
    assert_eq!(pool.alloc(), Err(AllocError::Exhausted));
    assert_eq!(pool.alloc(), Err(AllocError::Exhausted));
}

#[test]
fn arena_backs_pool_after_preloaded_blocks() {
    #[repr(align(16))]
    struct Heap([MaybeUninit<u8>; 64]);
    let mut heap = Heap([MaybeUninit::uninit(); 64]);
    let arena = Arena::new(&mut heap.0);

    #[repr(align(16))]
    struct Block([u8; 16]);
    let mut objects = Slot::<Block>::array::<2>();
    let pool = Pool::with_alignment(16, 16, &arena);
    pool.load_array(&mut objects);

    let mut blocks = vec![];
    while let Ok(b) = pool.alloc() {
        blocks.push(b);
    }
    assert_eq!(blocks.len(), 2 + 4);
    assert!(distinct(&blocks));
    assert_eq!(arena.remaining(), 0);
}

#[cfg(feature = "guarded")]
mod guarded {
    use super::*;
    use rtpool::time::Ticks;

    #[test]
    fn loading_and_emptying_a_guarded_pool() {
        let counter = TickCounter::new(TickRate::MILLIS);
        rtpool::create_clock!(clock, &counter);
        let mut objects = Slot::<u32>::array::<POOL_SIZE>();
        rtpool::create_guarded_pool!(gmp, size_of::<u32>());

        gmp.load_array(&mut objects);

        block_on(async {
            let mut blocks = vec![];
            for _ in 0..POOL_SIZE {
                let b = gmp.alloc_timeout(clock, Timeout::Immediate).await;
                blocks.push(b.expect("list empty"));
            }
            assert!(distinct(&blocks));
            assert_eq!(
                gmp.alloc_timeout(clock, Timeout::Immediate).await,
                Err(AllocError::Exhausted),
                "list not empty",
            );

            for b in blocks {
                unsafe { gmp.free(b) };
            }

            for _ in 0..POOL_SIZE {
                assert!(
                    gmp.alloc_timeout(clock, Timeout::Immediate).await.is_ok(),
                    "list empty",
                );
            }
            assert_eq!(
                gmp.alloc_timeout(clock, Timeout::Immediate).await,
                Err(AllocError::Exhausted),
                "list not empty",
            );
        });
    }

    #[test]
    fn guarded_pool_timeout() {
        let counter = TickCounter::new(TickRate::MILLIS);
        rtpool::create_clock!(clock, &counter);
        rtpool::create_guarded_pool!(gmp, size_of::<u32>());

        let waker = noop_waker();
        let mut ctx = Context::from_waker(&waker);

        let start = clock.now();
        let timeout = Timeout::from_millis(100, clock.rate());
        let mut fut = pin!(gmp.alloc_timeout(clock, timeout));

        let result = loop {
            if let Poll::Ready(r) = fut.as_mut().poll(&mut ctx) {
                break r;
            }
            counter.tick();
            clock.process_timers();
        };

        assert_eq!(result, Err(AllocError::TimedOut), "allocation not failed");
        assert_eq!(clock.now().ticks_since(start), Ticks(100));
    }

    #[test]
    fn consumer_waits_for_producer() {
        let mut objects = Slot::<u64>::array::<1>();
        rtpool::create_guarded_pool!(gmp, 8);
        gmp.load_array(&mut objects);

        block_on(async {
            let held = gmp.try_alloc().unwrap();
            let (got, ()) = futures::join!(gmp.alloc(), async {
                unsafe { gmp.free(held) };
            });
            assert_eq!(got, held);
            assert_eq!(gmp.available(), 0);
        });
    }

    #[test]
    fn finite_wait_satisfied_before_deadline() {
        let counter = TickCounter::new(TickRate::from_hz(300));
        rtpool::create_clock!(clock, &counter);
        let mut objects = Slot::<u64>::array::<1>();
        rtpool::create_guarded_pool!(gmp, 8);
        gmp.load_array(&mut objects);
        let held = gmp.try_alloc().unwrap();

        let waker = noop_waker();
        let mut ctx = Context::from_waker(&waker);

        // 10ms at 300Hz rounds up to 3 ticks.
        let timeout = Timeout::from_millis(10, clock.rate());
        assert_eq!(timeout, Timeout::After(Ticks(3)));

        let mut fut = pin!(gmp.alloc_timeout(clock, timeout));
        assert!(fut.as_mut().poll(&mut ctx).is_pending());
        counter.advance(Ticks(2));
        clock.process_timers();
        assert!(fut.as_mut().poll(&mut ctx).is_pending());

        unsafe { gmp.free(held) };
        assert_eq!(fut.as_mut().poll(&mut ctx), Poll::Ready(Ok(held)));
    }
}
