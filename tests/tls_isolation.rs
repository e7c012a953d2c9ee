//! Integration coverage for TLS isolation across real OS threads: one
//! thread's write to a dynamic TLS slot must not be visible to another
//! thread, and a thread's slot is independently allocated.

use luci::tls::TlsManager;
use std::sync::Arc;
use std::sync::Barrier;

#[test]
fn writes_on_one_thread_are_invisible_to_another() {
    let mgr = Arc::new(TlsManager::new());
    let module = mgr.register_module(8, 8, vec![0u8; 8], false);

    let barrier = Arc::new(Barrier::new(2));

    let mgr_a = mgr.clone();
    let barrier_a = barrier.clone();
    let thread_a = std::thread::spawn(move || {
        mgr_a.allocate_for_new_thread();
        let addr = mgr_a.get_addr(module, 0).unwrap();
        unsafe {
            *(addr as *mut i64) = 7;
        }
        barrier_a.wait();
        mgr_a.deallocate_current_thread();
    });

    let mgr_b = mgr.clone();
    let barrier_b = barrier.clone();
    let thread_b = std::thread::spawn(move || {
        mgr_b.allocate_for_new_thread();
        let addr = mgr_b.get_addr(module, 0).unwrap();
        let observed = unsafe { *(addr as *const i64) };
        barrier_b.wait();
        mgr_b.deallocate_current_thread();
        observed
    });

    thread_a.join().unwrap();
    let observed_by_b = thread_b.join().unwrap();
    assert_eq!(observed_by_b, 0, "thread B must not see thread A's write to the same TLS module");
}

#[test]
fn thread_exit_frees_its_block_without_disturbing_other_threads() {
    let mgr = Arc::new(TlsManager::new());
    let module = mgr.register_module(16, 8, vec![1, 2, 3, 4, 5, 6, 7, 8], false);

    let mgr_main = mgr.clone();
    mgr_main.allocate_for_new_thread();
    let main_addr = mgr_main.get_addr(module, 0).unwrap();

    let mgr_worker = mgr.clone();
    let worker = std::thread::spawn(move || {
        mgr_worker.allocate_for_new_thread();
        let addr = mgr_worker.get_addr(module, 0).unwrap();
        mgr_worker.deallocate_current_thread();
        addr
    });
    let worker_addr = worker.join().unwrap();
    assert_ne!(main_addr, worker_addr);

    // The main thread's own slot is unaffected by the worker's teardown.
    let main_addr_again = mgr_main.get_addr(module, 0).unwrap();
    assert_eq!(main_addr, main_addr_again);
    mgr_main.deallocate_current_thread();
}
