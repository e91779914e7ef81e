//! The hybrid latch: one 64-bit word carrying both lock state and version.
//!
//! Layout: the high 8 bits are the lock state, the low 56 bits a version
//! counter. State 0 is unlocked, 1..=254 counts shared holders, 255 is
//! exclusive. The version moves exactly when the latch leaves exclusive mode
//! (unlock or downgrade); shared traffic leaves it alone. An optimistic
//! reader that sees the same version before and after its traversal, with the
//! state not exclusive at either end, knows no writer ran in between.
//!
//! All primitives here are try-variants plus unconditional releases; spinning
//! lives in the guard, not in the latch.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

pub struct HybridLatch {
    state_and_version: AtomicU64,
}

impl HybridLatch {
    pub const VERSION_MASK: u64 = (1 << 56) - 1;
    pub const UNLOCKED: u64 = 0;
    /// Shared-holder count saturates here; holders are 1..=MAX_SHARED.
    pub const MAX_SHARED: u64 = 254;
    pub const EXCLUSIVE: u64 = 255;

    /// A fresh latch: unlocked, version 0.
    pub fn new() -> HybridLatch {
        HybridLatch {
            state_and_version: AtomicU64::new(0),
        }
    }

    /// Lock state encoded in a snapshot of the word.
    pub fn state(sv: u64) -> u64 {
        sv >> 56
    }

    /// Version counter encoded in a snapshot of the word.
    pub fn version(sv: u64) -> u64 {
        sv & Self::VERSION_MASK
    }

    pub(crate) fn is_exclusive(sv: u64) -> bool {
        Self::state(sv) == Self::EXCLUSIVE
    }

    pub(crate) fn is_shared(sv: u64) -> bool {
        let state = Self::state(sv);
        Self::UNLOCKED < state && state < Self::EXCLUSIVE
    }

    /// Snapshot the whole word. Never blocks.
    ///
    /// The load is `Acquire` so that a snapshot taken for an optimistic read
    /// observes everything published before the version it carries.
    pub fn state_and_version(&self) -> u64 {
        self.state_and_version.load(Ordering::Acquire)
    }

    fn same_version_new_state(sv: u64, state: u64) -> u64 {
        (sv & Self::VERSION_MASK) | (state << 56)
    }

    fn next_version_new_state(sv: u64, state: u64) -> u64 {
        // Version is modulo 2^56; the increment must not leak into the state.
        (((sv & Self::VERSION_MASK) + 1) & Self::VERSION_MASK) | (state << 56)
    }

    /// Try to take the latch exclusively.
    ///
    /// Succeeds only if the word still equals `expected` and `expected` says
    /// unlocked. The version does not change on entry; it changes on exit.
    pub fn try_lock_exclusive(&self, expected: u64) -> bool {
        if Self::state(expected) != Self::UNLOCKED {
            return false;
        }
        self.state_and_version
            .compare_exchange(
                expected,
                Self::same_version_new_state(expected, Self::EXCLUSIVE),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Release an exclusive hold, bumping the version.
    pub fn unlock_exclusive(&self) {
        // While we hold exclusive no other transition can succeed (shared
        // try rejects state 255, exclusive try requires 0), so the word is
        // ours and a plain store is enough.
        let sv = self.state_and_version.load(Ordering::Relaxed);
        debug_assert!(Self::is_exclusive(sv), "unlock_exclusive without exclusive hold");
        self.state_and_version.store(
            Self::next_version_new_state(sv, Self::UNLOCKED),
            Ordering::Release,
        );
    }

    /// Trade an exclusive hold for a shared one, bumping the version.
    ///
    /// The version bump is what tells optimistic readers the exclusive
    /// section ended; the single remaining shared hold is ours.
    pub fn downgrade(&self) {
        let sv = self.state_and_version.load(Ordering::Relaxed);
        debug_assert!(Self::is_exclusive(sv), "downgrade without exclusive hold");
        self.state_and_version
            .store(Self::next_version_new_state(sv, 1), Ordering::Release);
    }

    /// Try to add a shared holder.
    ///
    /// Rejects when `expected` is exclusive or the holder count is saturated.
    pub fn try_lock_shared(&self, expected: u64) -> bool {
        let state = Self::state(expected);
        if state < Self::MAX_SHARED {
            return self
                .state_and_version
                .compare_exchange(
                    expected,
                    Self::same_version_new_state(expected, state + 1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok();
        }
        false
    }

    /// Drop one shared holder. The version is untouched even when this is the
    /// last holder out; only writers need to be visible to optimistic readers.
    pub fn unlock_shared(&self) {
        loop {
            let sv = self.state_and_version.load(Ordering::Relaxed);
            debug_assert!(Self::is_shared(sv), "unlock_shared without shared hold");
            let state = Self::state(sv);
            if self
                .state_and_version
                .compare_exchange_weak(
                    sv,
                    Self::same_version_new_state(sv, state - 1),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    /// Try to trade a sole shared hold for an exclusive one.
    ///
    /// Only legal when `expected` shows exactly one shared holder (us); the
    /// version does not change, matching exclusive entry.
    pub fn upgrade(&self, expected: u64) -> bool {
        if Self::state(expected) != 1 {
            return false;
        }
        self.state_and_version
            .compare_exchange(
                expected,
                Self::same_version_new_state(expected, Self::EXCLUSIVE),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

impl Default for HybridLatch {
    fn default() -> Self {
        Self::new()
    }
}
