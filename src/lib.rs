//! Concurrent sorted lists built from two shared primitives: a hybrid latch
//! and an epoch-based reclamation manager.
//!
//! The hybrid latch packs a lock state and a 56-bit version counter into one
//! 64-bit atomic word. Readers can traverse a structure *optimistically*:
//! snapshot the word, walk the nodes without acquiring anything, then
//! re-check the word. Any writer that ran in between bumped the version when
//! it released its exclusive hold, so the reader notices and retries. Shared
//! holders never touch the version, which is what lets optimistic readers and
//! shared readers coexist without induced restarts.
//!
//! Optimistic traversal only works if a node a reader is looking at is never
//! handed back to the allocator mid-walk. That is the epoch manager's job:
//! writers hand unlinked nodes to [`EpochManager::defer_free`] instead of
//! dropping them, and the manager releases a node only once every thread that
//! could still see it has moved past the epoch in which it was unlinked.
//!
//! - A thread joins once with [`init_thread`], which assigns it a small dense
//!   positive identity used to index the per-thread epoch slots.
//! - Before a traversal the thread pins the current epoch with
//!   [`EpochManager::enter`]; the returned [`EpochScope`] unpins on drop.
//! - [`HybridGuard`] ties one latch acquisition to a lexical scope. For
//!   optimistic guards, [`HybridGuard::validate`] either commits the read or
//!   reports [`Restart`], and the caller retries.
//!
//! Two list variants share one node layout and ordering contract:
//! [`MutexList`] is the blocking baseline (a reader-writer lock around the
//! whole list) and doubles as an observational oracle; [`OptimisticList`]
//! runs lookups optimistically, takes the latch exclusively for writes, and
//! defers physical deletion to the epoch manager.
//!
//! ```
//! use std::sync::Arc;
//! use hybrid_list::{init_thread, EpochManager, OptimisticList};
//!
//! init_thread();
//! let epoch = Arc::new(EpochManager::new(8));
//! let list = OptimisticList::new(epoch);
//!
//! list.insert(3, 30);
//! list.insert(1, 10);
//! list.insert(3, 33); // overwrites in place
//! assert_eq!(list.lookup(&3), Some(33));
//! assert!(list.delete(&3));
//! assert_eq!(list.lookup(&3), None);
//! ```

mod epoch;
mod guard;
mod latch;
mod list;
mod registry;

pub use epoch::{EpochManager, EpochScope};
pub use guard::{GuardMode, HybridGuard, Restart};
pub use latch::HybridLatch;
pub use list::{MutexList, OptimisticList};
pub use registry::{init_thread, thread_id};
