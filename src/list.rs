//! Singly linked, key-ordered sets of `(key, value)` pairs.
//!
//! Both variants share one node layout and one set of ordered-traversal
//! routines ([`ListCore`]); they differ only in synchronisation discipline.
//! [`MutexList`] takes a reader-writer lock around every operation and frees
//! deleted nodes on the spot. [`OptimisticList`] reads without acquiring
//! anything, validates afterwards, and hands deleted nodes to the epoch
//! manager because an optimistic reader may still be walking through them.

use std::cell::UnsafeCell;
use std::cmp::Ordering as KeyOrdering;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::RwLock;

use crate::epoch::EpochManager;
use crate::guard::HybridGuard;
use crate::latch::HybridLatch;
use crate::registry::thread_id;

struct Node<K, V> {
    key: K,
    /// Mutated in place on duplicate insert, only ever under an exclusive
    /// hold. Optimistic readers may race this; validation discards what they
    /// saw.
    value: UnsafeCell<V>,
    next: AtomicPtr<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn boxed(key: K, value: V, next: *mut Node<K, V>) -> *mut Node<K, V> {
        Box::into_raw(Box::new(Node {
            key,
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(next),
        }))
    }
}

/// Node layout plus the ordered search/splice/unlink logic, shared by both
/// variants. Every method is unsafe: the caller supplies the synchronisation
/// that makes the traversal sound.
struct ListCore<K, V> {
    head: AtomicPtr<Node<K, V>>,
    // An AtomicPtr is Send + Sync no matter what it points at; this marker
    // restores the node ownership in the auto traits so the variants below
    // must justify their own Send/Sync.
    _marker: PhantomData<*mut Node<K, V>>,
}

impl<K: Ord, V> ListCore<K, V> {
    fn new() -> ListCore<K, V> {
        ListCore {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Walk to the node with `key`, or null if the list has none.
    ///
    /// Stops at the first node whose key exceeds `key`; keys are strictly
    /// increasing so nothing past it can match.
    ///
    /// # Safety
    ///
    /// Every node reachable from `head` must stay allocated for the duration
    /// of the walk: hold the variant's lock, or be pinned to an epoch no
    /// deferred node outlives.
    unsafe fn search(&self, key: &K) -> *const Node<K, V> {
        // Acquire pairs with the release store that published each link, so
        // a node is fully initialised before we look at it.
        let mut cur = self.head.load(Ordering::Acquire);
        unsafe {
            while !cur.is_null() {
                match (*cur).key.cmp(key) {
                    KeyOrdering::Greater => return ptr::null(),
                    KeyOrdering::Equal => return cur,
                    KeyOrdering::Less => cur = (*cur).next.load(Ordering::Acquire),
                }
            }
        }
        ptr::null()
    }

    /// Splice `(key, value)` into position, or overwrite the value in place
    /// if `key` is already present.
    ///
    /// # Safety
    ///
    /// Caller holds the variant's exclusive synchronisation.
    unsafe fn insert(&self, key: K, value: V) {
        unsafe {
            let head = self.head.load(Ordering::Relaxed);
            if head.is_null() || (*head).key > key {
                self.head.store(Node::boxed(key, value, head), Ordering::Release);
                return;
            }
            if (*head).key == key {
                *(*head).value.get() = value;
                return;
            }
            let mut prev = head;
            loop {
                let next = (*prev).next.load(Ordering::Relaxed);
                if next.is_null() || (*next).key > key {
                    // New node carries its link before the release store
                    // publishes it.
                    (*prev).next.store(Node::boxed(key, value, next), Ordering::Release);
                    return;
                }
                if (*next).key == key {
                    *(*next).value.get() = value;
                    return;
                }
                prev = next;
            }
        }
    }

    /// Detach the node with `key` and return it, or null if absent. The
    /// caller decides how the detached node dies.
    ///
    /// # Safety
    ///
    /// Caller holds the variant's exclusive synchronisation.
    unsafe fn unlink(&self, key: &K) -> *mut Node<K, V> {
        unsafe {
            let head = self.head.load(Ordering::Relaxed);
            if head.is_null() {
                return ptr::null_mut();
            }
            match (*head).key.cmp(key) {
                KeyOrdering::Greater => return ptr::null_mut(),
                KeyOrdering::Equal => {
                    self.head
                        .store((*head).next.load(Ordering::Relaxed), Ordering::Release);
                    return head;
                }
                KeyOrdering::Less => {}
            }
            let mut prev = head;
            loop {
                let cur = (*prev).next.load(Ordering::Relaxed);
                if cur.is_null() {
                    return ptr::null_mut();
                }
                match (*cur).key.cmp(key) {
                    KeyOrdering::Greater => return ptr::null_mut(),
                    KeyOrdering::Equal => {
                        (*prev)
                            .next
                            .store((*cur).next.load(Ordering::Relaxed), Ordering::Release);
                        return cur;
                    }
                    KeyOrdering::Less => prev = cur,
                }
            }
        }
    }

    /// Copy out the whole list in key order.
    ///
    /// # Safety
    ///
    /// Caller holds at least the variant's shared synchronisation; values
    /// must not be mutated concurrently.
    unsafe fn pairs(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::new();
        let mut cur = self.head.load(Ordering::Acquire);
        unsafe {
            while !cur.is_null() {
                out.push(((*cur).key.clone(), (*(*cur).value.get()).clone()));
                cur = (*cur).next.load(Ordering::Acquire);
            }
        }
        out
    }
}

impl<K, V> Drop for ListCore<K, V> {
    fn drop(&mut self) {
        // Only nodes still linked are ours; deferred nodes already belong to
        // an epoch manager.
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            // SAFETY: we have `&mut self`, so no reader or writer is live,
            // and every linked node was created by Node::boxed.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

/// The blocking variant: a reader-writer lock around the whole list.
///
/// Serves both as a baseline and as an observational oracle for the
/// optimistic variant — under a serial schedule the two are indistinguishable.
pub struct MutexList<K, V> {
    core: RwLock<ListCore<K, V>>,
}

// SAFETY: the raw node pointers inside ListCore are only followed under the
// RwLock, so the list is exactly as thread-safe as its key and value types.
unsafe impl<K: Send, V: Send> Send for MutexList<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for MutexList<K, V> {}

impl<K: Ord, V> MutexList<K, V> {
    pub fn new() -> MutexList<K, V> {
        MutexList {
            core: RwLock::new(ListCore::new()),
        }
    }

    /// Insert `(key, value)`, overwriting the value in place if `key` is
    /// already present.
    pub fn insert(&self, key: K, value: V) {
        let core = self.core.write();
        // SAFETY: write lock held.
        unsafe { core.insert(key, value) }
    }

    /// Look up `key`, cloning out its value.
    pub fn lookup(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let core = self.core.read();
        // SAFETY: read lock held; writers are excluded.
        unsafe {
            let node = core.search(key);
            if node.is_null() {
                None
            } else {
                Some((*(*node).value.get()).clone())
            }
        }
    }

    /// Remove `key`, freeing its node immediately. Returns whether it was
    /// present.
    pub fn delete(&self, key: &K) -> bool {
        let core = self.core.write();
        // SAFETY: write lock held; the detached node has no remaining
        // observer, so it can die right here.
        unsafe {
            let node = core.unlink(key);
            if node.is_null() {
                return false;
            }
            drop(Box::from_raw(node));
        }
        true
    }

    /// The list's contents in key order.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let core = self.core.read();
        // SAFETY: read lock held.
        unsafe { core.pairs() }
    }
}

impl<K: Ord, V> Default for MutexList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The optimistic variant: lookups validate instead of locking, writes take
/// the hybrid latch exclusively, deletions defer reclamation to the epoch
/// manager.
///
/// Threads calling [`lookup`](OptimisticList::lookup) or
/// [`delete`](OptimisticList::delete) must have registered with
/// [`init_thread`](crate::init_thread), and the manager must be sized for
/// every identity that will touch the list.
pub struct OptimisticList<K, V> {
    core: ListCore<K, V>,
    latch: HybridLatch,
    epoch: Arc<EpochManager>,
}

// SAFETY: nodes are only mutated or unlinked under the exclusive latch, and
// optimistic readers never observe a freed node thanks to the epoch protocol;
// what crosses threads is only K and V themselves.
unsafe impl<K: Send, V: Send> Send for OptimisticList<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for OptimisticList<K, V> {}

impl<K: Ord, V> OptimisticList<K, V> {
    pub fn new(epoch: Arc<EpochManager>) -> OptimisticList<K, V> {
        OptimisticList {
            core: ListCore::new(),
            latch: HybridLatch::new(),
            epoch,
        }
    }

    /// Insert `(key, value)`, overwriting the value in place if `key` is
    /// already present.
    pub fn insert(&self, key: K, value: V) {
        let _guard = HybridGuard::exclusive(&self.latch);
        // SAFETY: exclusive latch held.
        unsafe { self.core.insert(key, value) }
    }

    /// Look up `key` without taking the latch, retrying until a traversal
    /// validates.
    ///
    /// The value is copied out before validation, so a racing in-place
    /// overwrite can hand us a torn copy; validation fails in exactly that
    /// case and the copy is discarded. `V: Copy` keeps the discarded read
    /// free of side effects.
    pub fn lookup(&self, key: &K) -> Option<V>
    where
        V: Copy,
    {
        let tid = thread_id();
        loop {
            let _pin = self.epoch.enter(tid);
            let mut guard = HybridGuard::optimistic(&self.latch);
            // SAFETY: the pin keeps every node a concurrent delete unlinks
            // alive until we are out of the scope.
            let result = unsafe {
                let node = self.core.search(key);
                if node.is_null() {
                    None
                } else {
                    Some(*(*node).value.get())
                }
            };
            if guard.validate().is_ok() {
                return result;
            }
        }
    }

    /// Remove `key`. The detached node goes to the epoch manager, stamped
    /// with the epoch this thread pins for the duration of the unlink.
    ///
    /// Starts with a self-service [`reclaim_outdated`](EpochManager::reclaim_outdated)
    /// pass so a steady stream of deletes keeps its own deferred list bounded.
    pub fn delete(&self, key: &K) -> bool
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let tid = thread_id();
        self.epoch.reclaim_outdated(tid);
        let _pin = self.epoch.enter(tid);
        let _guard = HybridGuard::exclusive(&self.latch);
        // SAFETY: exclusive latch held.
        let node = unsafe { self.core.unlink(key) };
        if node.is_null() {
            return false;
        }
        // SAFETY: the node is unlinked, so no new traversal can reach it;
        // ownership moves to the manager, which frees it once no pinned
        // thread can still be walking through it.
        self.epoch.defer_free(tid, unsafe { Box::from_raw(node) });
        true
    }

    /// The list's contents in key order, under a shared hold.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let _guard = HybridGuard::shared(&self.latch);
        // SAFETY: shared hold excludes writers.
        unsafe { self.core.pairs() }
    }
}
