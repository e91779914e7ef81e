use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hybrid_list::{EpochManager, GuardMode, HybridGuard, HybridLatch, Restart};

const NO_THREADS: usize = 10;
const ROUNDS: usize = 1000;

/// Payload that reports its own release.
struct CountsDrop(Arc<AtomicUsize>);

impl Drop for CountsDrop {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn optimistic_validation_detects_writer() {
    let latch = HybridLatch::new();
    let mut outer = HybridGuard::optimistic(&latch);
    {
        let _writer = HybridGuard::exclusive(&latch);
    }
    assert_eq!(outer.validate(), Err(Restart));
}

#[test]
fn optimistic_validation_commits_without_writer() {
    let latch = HybridLatch::new();
    let mut outer = HybridGuard::optimistic(&latch);
    {
        // Shared traffic must not induce restarts.
        let _reader = HybridGuard::shared(&latch);
    }
    assert_eq!(outer.validate(), Ok(()));
}

#[test]
#[should_panic(expected = "moved mode")]
fn moved_mode_is_a_programmer_error() {
    let latch = HybridLatch::new();
    let _ = HybridGuard::new(&latch, GuardMode::Moved);
}

#[test]
fn explicit_unlock_disarms_drop() {
    let latch = HybridLatch::new();
    let mut guard = HybridGuard::exclusive(&latch);
    guard.unlock();
    assert_eq!(guard.mode(), GuardMode::Moved);
    drop(guard);
    // The word is back to unlocked with the version bumped once.
    assert_eq!(HybridLatch::state(latch.state_and_version()), HybridLatch::UNLOCKED);
    assert_eq!(HybridLatch::version(latch.state_and_version()), 1);
}

struct RacyCounter(UnsafeCell<i64>);

// SAFETY: written only under the exclusive latch; optimistic readers may race
// the reads, which is exactly what validation is for.
unsafe impl Sync for RacyCounter {}

#[test]
fn guards_under_contention() {
    let latch = HybridLatch::new();
    let counter = RacyCounter(UnsafeCell::new(0));
    let restarts = AtomicUsize::new(0);
    let writers = NO_THREADS / 2;

    thread::scope(|s| {
        for idx in 0..NO_THREADS {
            let latch = &latch;
            let counter = &counter;
            let restarts = &restarts;
            s.spawn(move || {
                if idx % 2 == 0 {
                    let _guard = HybridGuard::exclusive(latch);
                    unsafe { *counter.0.get() += 1 };
                } else {
                    loop {
                        let mode = if idx % 4 == 1 {
                            GuardMode::Shared
                        } else {
                            GuardMode::Optimistic
                        };
                        let mut guard = HybridGuard::new(latch, mode);
                        let seen = unsafe { *counter.0.get() };
                        match guard.validate() {
                            Ok(()) => {
                                assert!((0..=writers as i64).contains(&seen));
                                break;
                            }
                            Err(Restart) => {
                                restarts.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            });
        }
    });

    assert_eq!(unsafe { *counter.0.get() }, writers as i64);
}

#[test]
fn scope_pins_and_unpins() {
    let man = EpochManager::new(4);
    assert_eq!(man.local_epoch(1), EpochManager::NOT_PINNED);

    man.advance_global_epoch();
    man.advance_global_epoch();
    {
        let _scope = man.enter(1);
        assert_eq!(man.local_epoch(1), 2);
        assert!(man.local_epoch(1) <= man.global_epoch());
    }
    assert_eq!(man.local_epoch(1), EpochManager::NOT_PINNED);
}

#[test]
fn participant_count_is_clamped() {
    let man = EpochManager::new(4096);
    assert_eq!(man.participants(), EpochManager::MAX_PARTICIPANTS);
}

#[test]
#[should_panic(expected = "thread id 0")]
fn identity_zero_is_rejected() {
    let man = EpochManager::new(4);
    let _ = man.enter(0);
}

#[test]
fn pinned_reader_blocks_release() {
    let man = EpochManager::new(4);
    let freed = Arc::new(AtomicUsize::new(0));

    let pin = man.enter(1);
    {
        let _scope = man.enter(2);
        man.defer_free(2, Box::new(CountsDrop(freed.clone())));
    }
    man.advance_global_epoch();

    // Thread 1 still pins the stamp's epoch, so nothing may be released.
    man.reclaim_outdated(2);
    assert_eq!(freed.load(Ordering::Relaxed), 0);
    assert_eq!(man.deferred_len(2), 1);

    drop(pin);
    man.reclaim_outdated(2);
    assert_eq!(freed.load(Ordering::Relaxed), 1);
    assert_eq!(man.deferred_len(2), 0);
}

#[test]
fn destructor_releases_the_rest() {
    let freed = Arc::new(AtomicUsize::new(0));
    {
        let man = EpochManager::new(4);
        let _scope = man.enter(1);
        for _ in 0..5 {
            man.defer_free(1, Box::new(CountsDrop(freed.clone())));
        }
        // Still pinned: nothing can be released before the manager dies.
        assert_eq!(freed.load(Ordering::Relaxed), 0);
    }
    assert_eq!(freed.load(Ordering::Relaxed), 5);
}

/// The soak from the reference workload: every participant defers one pointer
/// per round, the first participant advances the epoch, and no deferred list
/// is ever more than two entries deep.
#[test]
fn soak_bounds_deferred_lists() {
    let man = Arc::new(EpochManager::new(NO_THREADS));
    let barrier = Arc::new(Barrier::new(NO_THREADS + 1));
    let freed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(NO_THREADS);
    for tid in 1..=NO_THREADS {
        let man = Arc::clone(&man);
        let barrier = Arc::clone(&barrier);
        let freed = Arc::clone(&freed);
        handles.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                barrier.wait();
                man.reclaim_outdated(tid);
                {
                    let _scope = man.enter(tid);
                    man.defer_free(tid, Box::new(CountsDrop(freed.clone())));
                }
                if tid == 1 {
                    man.advance_global_epoch();
                }
                barrier.wait();
            }
        }));
    }

    for _ in 0..ROUNDS {
        barrier.wait(); // release the round
        barrier.wait(); // wait for every worker to finish it
        for tid in 1..=NO_THREADS {
            assert!(man.deferred_len(tid) <= 2);
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(man.global_epoch(), ROUNDS as u64);
    drop(man);
    // The destructor released whatever the rounds left behind.
    assert_eq!(freed.load(Ordering::Relaxed), NO_THREADS * ROUNDS);
}
