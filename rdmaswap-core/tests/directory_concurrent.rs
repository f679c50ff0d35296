//! Concurrent tests for the remote page directory behind RdmaSwap.
//!
//! Tests thread safety of:
//! - Concurrent stores of distinct ids
//! - Concurrent stores of one id
//! - Concurrent stores overflowing the directory
//! - Readers racing a writer of the same id
//! - Shutdown while operations are in flight
//! - Remove, restore and read while a remote write or read is held in flight

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::Rng;
use rdmaswap_core::{IndexKind, Page, SwapError, SwapState};
use rdmaswap_transfer::TransferOp;

use common::{assert_page_eq, gated_swap, page_for, ready_swap, INDEX_KINDS};

fn random_page() -> Page {
    let mut page = Page::zeroed();
    rand::thread_rng().fill(&mut page.as_bytes_mut()[..]);
    page
}

/// Helper to run concurrent operations and collect results.
fn run_concurrent<T, F>(num_threads: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(i))
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Helper to run concurrent operations with a barrier for synchronization.
fn run_concurrent_with_barrier<T, F>(num_threads: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, &Barrier) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|i| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || f(i, &barrier))
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Distinct ids stored from many threads all land in distinct slots and read
/// back intact.
#[test]
fn test_concurrent_store_distinct_ids() {
    for kind in INDEX_KINDS {
        let num_threads = 8;
        let ids_per_thread = 16_u64;
        let swap = Arc::new(ready_swap(num_threads * ids_per_thread as usize, kind));

        let worker_swap = Arc::clone(&swap);
        run_concurrent_with_barrier(num_threads, move |thread_id, barrier| {
            barrier.wait();
            for i in 0..ids_per_thread {
                let local_id = thread_id as u64 * 1000 + i;
                worker_swap
                    .store_page(local_id, &page_for(local_id))
                    .expect("store should succeed");
            }
        });

        assert_eq!(swap.stats().resident_pages, num_threads * ids_per_thread as usize);
        for thread_id in 0..num_threads as u64 {
            for i in 0..ids_per_thread {
                let local_id = thread_id * 1000 + i;
                let page = swap.try_get_page(local_id).expect("page should be present");
                assert_eq!(page, page_for(local_id), "kind={kind} id={local_id}");
            }
        }

        let mut out = String::new();
        swap.debug_dump(&mut out).expect("dump");
        let ids: HashSet<_> = out.lines().skip(1).collect();
        assert_eq!(ids.len(), num_threads * ids_per_thread as usize);
    }
}

/// Many threads storing the same id: each store either commits or is refused
/// because another write of the id is in flight, and the entry holds the page
/// of a store that reported success.
#[test]
fn test_concurrent_store_same_id() {
    for kind in INDEX_KINDS {
        let num_threads = 8;
        let swap = Arc::new(ready_swap(4, kind));

        let worker_swap = Arc::clone(&swap);
        let results = run_concurrent_with_barrier(num_threads, move |thread_id, barrier| {
            let page = page_for(thread_id as u64);
            barrier.wait();
            worker_swap.store_page(0x99, &page)
        });
        let committed: Vec<u64> = results
            .iter()
            .enumerate()
            .filter_map(|(thread_id, result)| match result {
                Ok(()) => Some(thread_id as u64),
                Err(SwapError::StoreInFlight { local_id: 0x99 }) => None,
                Err(err) => panic!("kind={kind}: unexpected error: {err}"),
            })
            .collect();
        assert!(!committed.is_empty(), "kind={kind}: {results:?}");

        assert_eq!(swap.stats().resident_pages, 1);
        let page = swap.try_get_page(0x99).expect("page should be present");
        assert!(
            committed.iter().any(|id| page == page_for(*id)),
            "kind={kind}: content is not from a committed store"
        );
        // The other three slots are still available.
        for local_id in 1..=3 {
            swap.store_page(local_id, &random_page()).expect("free slot");
        }
    }
}

/// Oversubscribed stores: exactly `capacity` succeed, the rest see
/// ResourceExhausted and never reach the transport.
#[test]
fn test_concurrent_store_overflow() {
    for kind in INDEX_KINDS {
        let capacity = 16;
        let swap = Arc::new(ready_swap(capacity, kind));

        let worker_swap = Arc::clone(&swap);
        let results = run_concurrent_with_barrier(8, move |thread_id, barrier| {
            barrier.wait();
            (0..4_u64)
                .map(|i| worker_swap.store_page(thread_id as u64 * 10 + i, &random_page()))
                .collect::<Vec<_>>()
        });
        let results: Vec<_> = results.into_iter().flatten().collect();

        let stored = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(SwapError::ResourceExhausted { capacity: 16 })))
            .count();
        assert_eq!(stored, capacity, "kind={kind}");
        assert_eq!(exhausted, 32 - capacity, "kind={kind}");
        assert_eq!(
            swap.transport().backend().counters().writes_posted,
            capacity as u64
        );
        assert_eq!(swap.stats().store_failures, (32 - capacity) as u64);
    }
}

/// Readers racing a writer that keeps re-storing the same id only ever see
/// a complete page, or a miss while the rewrite is in flight.
#[test]
fn test_readers_race_rewrites() {
    let swap = Arc::new(ready_swap(2, IndexKind::Hashed));
    swap.store_page(1, &page_for(0)).expect("initial store");

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let swap = Arc::clone(&swap);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for round in 1..=50_u64 {
                swap.store_page(1, &page_for(round % 2)).expect("rewrite");
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let reader_swap = Arc::clone(&swap);
    let reader_done = Arc::clone(&done);
    let torn = run_concurrent(4, move |_| {
        let mut torn = 0_usize;
        while !reader_done.load(Ordering::SeqCst) {
            match reader_swap.try_get_page(1) {
                Ok(page) if page != page_for(0) && page != page_for(1) => torn += 1,
                Ok(_) | Err(SwapError::NotFound { .. }) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        torn
    });
    writer.join().expect("writer panicked");

    assert_eq!(torn.iter().sum::<usize>(), 0);
    assert_eq!(swap.stats().resident_pages, 1);
}

/// exit() fences in-flight operations: every operation either completes
/// normally or is rejected with InvalidState.
#[test]
fn test_exit_during_operations() {
    let swap = Arc::new(ready_swap(64, IndexKind::Linear));

    let worker_swap = Arc::clone(&swap);
    let workers = thread::spawn(move || {
        run_concurrent(4, move |thread_id| {
            let mut rejected = 0_usize;
            for i in 0..200_u64 {
                let local_id = thread_id as u64 * 16 + i % 16;
                let result = if i % 2 == 0 {
                    worker_swap.store_page(local_id, &page_for(local_id)).map(|_| ())
                } else {
                    worker_swap.try_get_page(local_id).map(|_| ())
                };
                match result {
                    Ok(()) | Err(SwapError::NotFound { .. }) => {}
                    Err(SwapError::InvalidState { .. }) => rejected += 1,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
            rejected
        })
    });

    thread::sleep(std::time::Duration::from_millis(2));
    swap.exit();
    assert_eq!(swap.state(), SwapState::Uninitialized);
    assert!(!swap.transport().is_initialized());

    workers.join().expect("workers panicked");
    assert!(!swap.page_exists(0));
}

/// Removing an id whose write is in flight cancels the store, and the slot
/// stays out of the free pool until that write has landed.
#[test]
fn test_remove_during_write_keeps_slot_reserved() {
    for kind in INDEX_KINDS {
        let swap = Arc::new(gated_swap(2, kind));
        let (x, y, z) = (0x1_u64, 0x2_u64, 0x3_u64);

        swap.transport().backend().hold_next(TransferOp::Write);
        let writer = {
            let swap = Arc::clone(&swap);
            thread::spawn(move || swap.store_page(x, &page_for(x)))
        };
        swap.transport().backend().wait_parked();

        assert_eq!(swap.invalidate_page(x), Ok(false));
        assert!(!swap.page_exists(x));

        // Y must not be handed X's remote page while X's write is pending.
        swap.store_page(y, &page_for(y)).expect("second slot is free");
        assert_eq!(
            swap.store_page(z, &page_for(z)),
            Err(SwapError::ResourceExhausted { capacity: 2 })
        );

        swap.transport().backend().release();
        assert_eq!(
            writer.join().expect("writer panicked"),
            Err(SwapError::StoreCancelled { local_id: x })
        );

        assert!(!swap.page_exists(x));
        assert_page_eq(&swap.try_get_page(y).expect("Y present"), &page_for(y));

        // The cancelled slot is free again once its write finished.
        swap.store_page(z, &page_for(z)).expect("cancelled slot released");
        let mut out = String::new();
        swap.debug_dump(&mut out).expect("dump");
        assert!(out.contains("entry 0: addr=0x3"), "kind={kind}: {out}");
        assert!(out.contains("entry 1: addr=0x2"), "kind={kind}: {out}");
    }
}

/// A second store of an id whose first write is in flight is refused without
/// touching the transport; the first store then commits its own page.
#[test]
fn test_restore_during_write_is_refused() {
    for kind in INDEX_KINDS {
        let swap = Arc::new(gated_swap(2, kind));
        let first = Page::filled(0xaa);

        swap.transport().backend().hold_next(TransferOp::Write);
        let writer = {
            let swap = Arc::clone(&swap);
            let page = first.clone();
            thread::spawn(move || swap.store_page(0x1, &page))
        };
        swap.transport().backend().wait_parked();

        let posted = swap.transport().backend().loopback().counters().writes_posted;
        assert_eq!(
            swap.store_page(0x1, &Page::filled(0xcc)),
            Err(SwapError::StoreInFlight { local_id: 0x1 })
        );
        assert_eq!(
            swap.transport().backend().loopback().counters().writes_posted,
            posted
        );

        swap.transport().backend().release();
        writer.join().expect("writer panicked").expect("first store commits");
        assert_page_eq(&swap.try_get_page(0x1).expect("page present"), &first);
        assert_eq!(swap.stats().resident_pages, 1);
    }
}

/// Only the store that commits reports success. The refused store of the
/// same id gets a non-I/O error and cannot take the committed page with it,
/// even when a write failure is armed on the transport at the time.
#[test]
fn test_refused_store_keeps_committed_page() {
    let swap = Arc::new(gated_swap(2, IndexKind::Hashed));

    swap.transport().backend().hold_next(TransferOp::Write);
    let writer = {
        let swap = Arc::clone(&swap);
        thread::spawn(move || swap.store_page(0x1, &Page::filled(0xaa)))
    };
    swap.transport().backend().wait_parked();

    swap.transport().backend().loopback().fail_writes(1);
    let err = swap
        .store_page(0x1, &Page::filled(0xcc))
        .expect_err("refused while in flight");
    assert!(!err.is_io());
    swap.transport().backend().loopback().fail_writes(0);

    swap.transport().backend().release();
    let first = writer.join().expect("writer panicked");
    assert_eq!(first, Ok(()));
    assert!(swap.page_exists(0x1));
    assert_page_eq(
        &swap.try_get_page(0x1).expect("committed page present"),
        &Page::filled(0xaa),
    );
}

/// A read whose entry is invalidated and whose slot is reused by another id
/// before the read reaches the peer reports a miss, never the new owner's page.
#[test]
fn test_read_racing_slot_reuse_misses() {
    for kind in INDEX_KINDS {
        let swap = Arc::new(gated_swap(1, kind));
        swap.store_page(0x1, &page_for(0x1)).expect("store X");

        swap.transport().backend().hold_next(TransferOp::Read);
        let reader = {
            let swap = Arc::clone(&swap);
            thread::spawn(move || swap.try_get_page(0x1))
        };
        swap.transport().backend().wait_parked();

        assert_eq!(swap.invalidate_page(0x1), Ok(true));
        swap.store_page(0x2, &page_for(0x2)).expect("Y reuses the only slot");

        swap.transport().backend().release();
        assert_eq!(
            reader.join().expect("reader panicked"),
            Err(SwapError::NotFound { local_id: 0x1 })
        );
        assert_page_eq(&swap.try_get_page(0x2).expect("Y present"), &page_for(0x2));
    }
}
