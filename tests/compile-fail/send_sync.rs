// Check that non-Sync payloads can't be shared between threads via the lists
// edition:2021

use std::cell::RefCell;
use std::sync::Arc;
use std::thread;

// NOTE: we include this so the error points to local source which gives reliable trybuild output
fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(f).join().unwrap();
}

fn main() {
    let list = Arc::new(hybrid_list::MutexList::new());
    list.insert(1, RefCell::new(0));

    let shared = Arc::clone(&list);
    spawn(move || {
        shared.insert(2, RefCell::new(0));
    });
    //~^ ERROR: `RefCell<i32>` cannot be shared between threads safely

    assert!(list.lookup(&1).is_some());
}
