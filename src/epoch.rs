//! Epoch-based deferred reclamation.
//!
//! The basic problem: a writer that unlinks a node from a shared structure
//! cannot free it immediately, because optimistic readers may still be
//! walking through it. Instead the node is *deferred* with a stamp of the
//! epoch it was unlinked in, and physically released only once every thread
//! that could have observed it has moved on.
//!
//! Three pieces of state make that decision possible:
//!
//! - a global epoch, advanced periodically by whoever the embedding chooses;
//! - one local-epoch slot per participating thread: while a thread is inside
//!   an [`EpochScope`] its slot holds the epoch it pinned, otherwise the
//!   [`NOT_PINNED`](EpochManager::NOT_PINNED) sentinel;
//! - one deferred list per participating thread, appended and trimmed in
//!   stamp order.
//!
//! A deferred record is safe to release once its stamp is strictly below the
//! minimum over all local-epoch slots: any reader pinned at or before the
//! stamp would hold that minimum down, so the node it might still see stays
//! allocated.

use std::marker::PhantomData;

#[cfg(loom)]
use loom::sync::{
    atomic::{fence, AtomicU64, Ordering},
    Mutex,
};
#[cfg(not(loom))]
use std::sync::{
    atomic::{fence, AtomicU64, Ordering},
    Mutex,
};

/// A deferred pointer: the erased object plus the epoch it was retired in.
///
/// Dropping the record frees the object, so draining a deferred list *is*
/// the physical release and nothing can leak on an unwind.
struct Deferred {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
    epoch: u64,
}

// SAFETY: a Deferred is only ever built from a `Box<T: Send + 'static>` in
// `defer_free`, so handing it to whichever thread drops the manager is fine.
unsafe impl Send for Deferred {}

impl Deferred {
    fn new<T: Send + 'static>(garbage: Box<T>, epoch: u64) -> Deferred {
        unsafe fn drop_boxed<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut T) });
        }
        Deferred {
            ptr: Box::into_raw(garbage) as *mut (),
            drop_fn: drop_boxed::<T>,
            epoch,
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        // SAFETY: `ptr` came out of `Box::into_raw` in `new` and nothing else
        // ever reconstitutes it; `drop_fn` was instantiated for the same `T`.
        unsafe { (self.drop_fn)(self.ptr) }
    }
}

/// Tracks the global epoch, every participant's pinned epoch, and every
/// participant's deferred-free list.
///
/// Participants are identified by the dense ids the
/// [registry](crate::init_thread) hands out, starting at 1; slot 0 exists but
/// is never pinned, so an unregistered thread cannot alias a live
/// participant. Dropping the manager releases every record still deferred.
pub struct EpochManager {
    participants: usize,
    global_epoch: AtomicU64,
    local_epoch: Box<[AtomicU64]>,
    deferred: Box<[Mutex<Vec<Deferred>>]>,
}

impl EpochManager {
    /// Slot value meaning "this thread pins no epoch".
    pub const NOT_PINNED: u64 = u64::MAX;
    /// Hard cap on participants; larger requests are silently clamped.
    pub const MAX_PARTICIPANTS: usize = 128;

    /// A manager for `participants` threads (clamped to
    /// [`MAX_PARTICIPANTS`](Self::MAX_PARTICIPANTS)), global epoch 0, nothing
    /// pinned, nothing deferred.
    pub fn new(participants: usize) -> EpochManager {
        let participants = participants.min(Self::MAX_PARTICIPANTS);
        EpochManager {
            participants,
            global_epoch: AtomicU64::new(0),
            local_epoch: (0..=participants)
                .map(|_| AtomicU64::new(Self::NOT_PINNED))
                .collect(),
            deferred: (0..=participants).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Number of participant slots.
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Current global epoch.
    pub fn global_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// The epoch `tid` currently pins, or
    /// [`NOT_PINNED`](Self::NOT_PINNED) if it is outside any scope.
    pub fn local_epoch(&self, tid: usize) -> u64 {
        self.check_tid(tid);
        self.local_epoch[tid].load(Ordering::Acquire)
    }

    /// How many records `tid` has deferred and not yet released.
    pub fn deferred_len(&self, tid: usize) -> usize {
        self.check_tid(tid);
        self.deferred[tid].lock().unwrap().len()
    }

    fn check_tid(&self, tid: usize) {
        assert!(
            tid >= 1 && tid <= self.participants,
            "thread id {} outside 1..={} (did you call init_thread, and size the manager for it?)",
            tid,
            self.participants,
        );
    }

    /// Atomically advance the global epoch.
    ///
    /// When to call this is the embedding's policy; a writer or a designated
    /// coordinator calling it periodically is enough to let reclamation make
    /// progress. A thread must not advance while relying on its own pin.
    pub fn advance_global_epoch(&self) {
        self.global_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Pin the current global epoch into `tid`'s slot until the returned
    /// scope is dropped.
    pub fn enter(&self, tid: usize) -> EpochScope<'_> {
        self.check_tid(tid);
        let epoch = self.global_epoch.load(Ordering::Acquire);
        self.local_epoch[tid].store(epoch, Ordering::Relaxed);
        // The pin must be visible before any traversal load; pairs with the
        // fence at the top of reclaim_outdated.
        fence(Ordering::SeqCst);
        EpochScope {
            slot: &self.local_epoch[tid],
            _marker: PhantomData,
        }
    }

    /// Hand an object over for deferred release, stamped with `tid`'s
    /// currently pinned epoch.
    ///
    /// The caller guarantees no further writes to the object will happen and
    /// that `tid` is pinned to the epoch in which the object's unlink became
    /// visible; stamps in a slot are then non-decreasing by construction.
    pub fn defer_free<T: Send + 'static>(&self, tid: usize, garbage: Box<T>) {
        self.check_tid(tid);
        let stamp = self.local_epoch[tid].load(Ordering::Relaxed);
        debug_assert!(
            stamp != Self::NOT_PINNED,
            "defer_free while not inside an epoch scope"
        );
        self.deferred[tid]
            .lock()
            .unwrap()
            .push(Deferred::new(garbage, stamp));
    }

    /// Release the front run of `tid`'s deferred records whose stamp
    /// precedes the minimum epoch any thread still pins.
    ///
    /// Reclamation is self-service: each thread trims its own list, so there
    /// is nothing to coordinate beyond the epoch protocol itself.
    pub fn reclaim_outdated(&self, tid: usize) {
        self.check_tid(tid);
        // See every pin published before this call; pairs with the fence in
        // enter.
        fence(Ordering::SeqCst);
        let mut min_epoch = Self::NOT_PINNED;
        for slot in self.local_epoch.iter() {
            min_epoch = min_epoch.min(slot.load(Ordering::Relaxed));
        }
        let mut deferred = self.deferred[tid].lock().unwrap();
        let safe = deferred.iter().take_while(|d| d.epoch < min_epoch).count();
        // Stamps are non-decreasing, so everything past the first survivor
        // stays; dropping the drained records frees them.
        drop(deferred.drain(..safe));
    }
}

/// Pins an epoch for the lifetime of the scope.
///
/// On construction the thread's slot takes the current global epoch; on drop
/// it returns to the not-pinned sentinel. The holding thread must finish
/// every traversal it started before letting the scope end, and must not
/// advance the global epoch while relying on its own pin.
pub struct EpochScope<'a> {
    slot: &'a AtomicU64,
    _marker: PhantomData<*mut ()>, // !Send and !Sync: the pin belongs to this thread
}

impl<'a> EpochScope<'a> {
    /// Equivalent to [`EpochManager::enter`].
    pub fn new(manager: &'a EpochManager, tid: usize) -> EpochScope<'a> {
        manager.enter(tid)
    }
}

impl Drop for EpochScope<'_> {
    fn drop(&mut self) {
        // Release: the traversal's reads are done before the pin disappears.
        self.slot.store(EpochManager::NOT_PINNED, Ordering::Release);
    }
}
