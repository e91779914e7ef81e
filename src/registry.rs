//! Thread registry: hands out small dense positive identities.
//!
//! The epoch manager's per-thread slots are plain arrays indexed by these
//! identities, so they have to be dense and they have to be stable for the
//! life of the thread. Identity 0 is reserved and means "never registered";
//! epoch operations reject it.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

/// Register the calling thread, assigning it the next free identity.
///
/// Identities start at 1 and only ever grow; calling this twice from the same
/// thread burns the old identity and takes a fresh one, so call it once per
/// thread, before the first epoch or list operation.
pub fn init_thread() {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
    THREAD_ID.with(|t| t.set(id));
}

/// The calling thread's identity, or 0 if [`init_thread`] was never called
/// on this thread.
pub fn thread_id() -> usize {
    THREAD_ID.with(|t| t.get())
}
