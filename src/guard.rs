//! Scoped guard over a [`HybridLatch`] and the optimistic restart signal.

use std::error::Error;
use std::fmt;
use std::marker::PhantomData;

#[cfg(loom)]
use loom::{sync::atomic, thread};
#[cfg(not(loom))]
use std::{sync::atomic, thread};

use crate::latch::HybridLatch;

/// Raised by optimistic validation when an intervening writer is detected.
///
/// Strictly a control-flow notification: the optimistic traversal that
/// receives it discards its tentative result and retries. It is never fatal
/// and carries no data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Restart;

impl fmt::Display for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("optimistic read invalidated by a concurrent writer")
    }
}

impl Error for Restart {}

/// Acquisition protocol selected at guard construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardMode {
    /// Snapshot the latch word; validate later instead of acquiring.
    Optimistic,
    /// Spin until a shared hold is taken.
    Shared,
    /// Spin until the exclusive hold is taken.
    Exclusive,
    /// Disarmed: the hold was released (or the validation consumed). Drop
    /// does nothing. Not a constructible mode.
    Moved,
}

/// Ties one latch acquisition to a lexical scope.
///
/// Shared and exclusive guards release on drop. An optimistic guard must be
/// checked with [`validate`](HybridGuard::validate) before its traversal's
/// result is used; dropping one without validating merely disarms it and
/// tells the caller nothing about concurrent writers.
pub struct HybridGuard<'a> {
    latch: &'a HybridLatch,
    mode: GuardMode,
    snapshot: u64,
    _marker: PhantomData<*mut ()>, // !Send and !Sync
}

impl<'a> HybridGuard<'a> {
    /// Construct a guard in the given mode.
    ///
    /// # Panics
    ///
    /// Panics if `mode` is [`GuardMode::Moved`]; that state is reachable only
    /// by releasing or validating an existing guard.
    pub fn new(latch: &'a HybridLatch, mode: GuardMode) -> HybridGuard<'a> {
        match mode {
            GuardMode::Optimistic => Self::optimistic(latch),
            GuardMode::Shared => Self::shared(latch),
            GuardMode::Exclusive => Self::exclusive(latch),
            GuardMode::Moved => panic!("cannot construct a guard in moved mode"),
        }
    }

    /// Snapshot the latch for an optimistic read, waiting out any writer that
    /// currently holds it exclusively.
    pub fn optimistic(latch: &'a HybridLatch) -> HybridGuard<'a> {
        let mut sv = latch.state_and_version();
        while HybridLatch::is_exclusive(sv) {
            thread::yield_now();
            sv = latch.state_and_version();
        }
        HybridGuard {
            latch,
            mode: GuardMode::Optimistic,
            snapshot: sv,
            _marker: PhantomData,
        }
    }

    /// Spin until a shared hold is acquired.
    pub fn shared(latch: &'a HybridLatch) -> HybridGuard<'a> {
        loop {
            let sv = latch.state_and_version();
            if latch.try_lock_shared(sv) {
                return HybridGuard {
                    latch,
                    mode: GuardMode::Shared,
                    snapshot: sv,
                    _marker: PhantomData,
                };
            }
            thread::yield_now();
        }
    }

    /// Spin until the exclusive hold is acquired.
    pub fn exclusive(latch: &'a HybridLatch) -> HybridGuard<'a> {
        loop {
            let sv = latch.state_and_version();
            if latch.try_lock_exclusive(sv) {
                return HybridGuard {
                    latch,
                    mode: GuardMode::Exclusive,
                    snapshot: sv,
                    _marker: PhantomData,
                };
            }
            thread::yield_now();
        }
    }

    /// The mode the guard is currently in.
    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Release a shared or exclusive hold now instead of at end of scope.
    ///
    /// No-op in any other mode, matching the latch's permissive surface: an
    /// optimistic guard has nothing to release.
    pub fn unlock(&mut self) {
        match self.mode {
            GuardMode::Shared => self.latch.unlock_shared(),
            GuardMode::Exclusive => self.latch.unlock_exclusive(),
            GuardMode::Optimistic | GuardMode::Moved => return,
        }
        self.mode = GuardMode::Moved;
    }

    /// Check an optimistic snapshot against the current latch word.
    ///
    /// Disarms the guard first, then re-reads: if the latch is exclusively
    /// held right now, or the version moved since the snapshot, some writer
    /// ran (or is running) and the traversal's result must be discarded.
    /// Returns `Ok(())` for non-optimistic modes, which have nothing to
    /// validate.
    pub fn validate(&mut self) -> Result<(), Restart> {
        if self.mode != GuardMode::Optimistic {
            return Ok(());
        }
        self.mode = GuardMode::Moved;
        // Order the traversal's data reads before the re-read of the word;
        // pairs with the release store in unlock_exclusive/downgrade.
        atomic::fence(atomic::Ordering::Acquire);
        let sv = self.latch.state_and_version();
        if HybridLatch::is_exclusive(sv)
            || HybridLatch::version(sv) != HybridLatch::version(self.snapshot)
        {
            return Err(Restart);
        }
        Ok(())
    }
}

impl Drop for HybridGuard<'_> {
    fn drop(&mut self) {
        match self.mode {
            GuardMode::Shared => self.latch.unlock_shared(),
            GuardMode::Exclusive => self.latch.unlock_exclusive(),
            // An unvalidated optimistic guard is dropped on the retry path;
            // there is no hold to release either way.
            GuardMode::Optimistic | GuardMode::Moved => {}
        }
    }
}
