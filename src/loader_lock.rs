//! Reentrant process-wide loader lock.
//!
//! Every public entry point (open/close/sym/addr/iterate_phdr, and the DSU
//! controller's update path) serializes through one lock so that a symbol
//! lookup never observes a half-relocated image. It must be reentrant: a
//! `DT_INIT`/`IFUNC` resolver running under the lock, or an `iterate_phdr`
//! callback, is allowed to call back into `open`/`sym` on the same thread.

use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

struct State {
    holder: Option<ThreadId>,
    depth: u32,
}

/// A `Mutex`+`Condvar`-backed recursive lock, tagged by holding thread, so a
/// thread already holding the lock can acquire it again without deadlocking.
pub struct LoaderLock {
    state: Mutex<State>,
    released: Condvar,
}

impl Default for LoaderLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LoaderLock {
    pub fn new() -> Self {
        LoaderLock {
            state: Mutex::new(State { holder: None, depth: 0 }),
            released: Condvar::new(),
        }
    }

    /// Acquires the lock, blocking until free unless the calling thread
    /// already holds it (in which case the recursion depth is bumped and
    /// the call returns immediately).
    pub fn acquire(&self) -> LoaderLockGuard<'_> {
        let this_thread = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.holder {
                Some(holder) if holder == this_thread => break,
                None => {
                    state.holder = Some(this_thread);
                    break;
                }
                Some(_) => {
                    state = self.released.wait(state).unwrap();
                }
            }
        }
        state.depth += 1;
        drop(state);
        LoaderLockGuard { lock: self }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            drop(state);
            self.released.notify_one();
        }
    }
}

/// RAII guard releasing one level of recursion on drop.
pub struct LoaderLockGuard<'a> {
    lock: &'a LoaderLock,
}

impl Drop for LoaderLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Picks a load base for a newly mapped image. A real ASLR policy would
/// consult `/proc/self/maps` for a free region; this derives a stable,
/// page-aligned pseudo-address from the file's inode so that repeated test
/// runs and non-PIE callers observing `base == 0` both behave predictably.
pub fn choose_base(ino: u64) -> usize {
    const PAGE: usize = 0x1000;
    const REGION_BASE: usize = 0x7f00_0000_0000;
    let slot = (ino as usize).wrapping_mul(0x2000) % 0x1_0000_0000;
    (REGION_BASE + slot) & !(PAGE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reentrant_acquire_does_not_deadlock() {
        let lock = LoaderLock::new();
        let _outer = lock.acquire();
        let _inner = lock.acquire();
    }

    #[test]
    fn second_thread_blocks_until_release() {
        let lock = Arc::new(LoaderLock::new());
        let guard = lock.acquire();
        let lock2 = lock.clone();
        let handle = std::thread::spawn(move || {
            let _g = lock2.acquire();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn choose_base_is_page_aligned() {
        assert_eq!(choose_base(12345) % 0x1000, 0);
    }
}
