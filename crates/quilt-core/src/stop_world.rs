//! Process-wide stop-the-world.
//!
//! Contract: no thread of the process other than the initiator executes user
//! code between entry and exit of the callback. The Linux implementation
//! signals every peer task with the first real-time signal; the handler
//! parks the thread on an atomic handshake until the initiator releases it.
//!
//! Passes are serialized process-wide. The initiator re-lists
//! `/proc/self/task` until the signaled set is stable, so threads spawned
//! while the pass is being set up are still caught.

#![allow(unsafe_code)]

use parking_lot::Mutex;

static STW_SERIALIZE: Mutex<()> = Mutex::new(());

/// Runs `callback` with every other thread of the process suspended.
#[cfg(target_os = "linux")]
pub fn stop_the_world<F: FnOnce()>(callback: F) {
    linux::stop_the_world(callback, &STW_SERIALIZE);
}

/// Portability fallback: serialized, but nothing is suspended.
#[cfg(not(target_os = "linux"))]
pub fn stop_the_world<F: FnOnce()>(callback: F) {
    let _serial = STW_SERIALIZE.lock();
    callback();
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use parking_lot::Mutex;

    use crate::fatal;

    /// Threads currently parked in the suspend handler.
    static PARKED: AtomicUsize = AtomicUsize::new(0);
    /// Set by the initiator to release parked threads.
    static RESUME: AtomicBool = AtomicBool::new(false);
    static HANDLER_INSTALLED: OnceLock<()> = OnceLock::new();

    fn suspend_signal() -> libc::c_int {
        libc::SIGRTMIN()
    }

    /// Signal handler: park until the initiator releases the world.
    ///
    /// Only async-signal-safe operations: atomics and sched_yield.
    extern "C" fn park_thread(_sig: libc::c_int) {
        PARKED.fetch_add(1, Ordering::SeqCst);
        while !RESUME.load(Ordering::SeqCst) {
            unsafe { libc::sched_yield() };
        }
        PARKED.fetch_sub(1, Ordering::SeqCst);
    }

    fn install_handler() {
        HANDLER_INSTALLED.get_or_init(|| unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = park_thread as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(suspend_signal(), &sa, std::ptr::null_mut()) != 0 {
                fatal("stop-the-world: installing the suspend handler failed");
            }
        });
    }

    fn gettid() -> i64 {
        unsafe { libc::syscall(libc::SYS_gettid) as i64 }
    }

    fn list_tasks() -> Vec<i64> {
        let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    }

    fn task_alive(tid: i64) -> bool {
        std::path::Path::new(&format!("/proc/self/task/{tid}")).exists()
    }

    pub fn stop_the_world<F: FnOnce()>(callback: F, serialize: &Mutex<()>) {
        let _serial = serialize.lock();
        install_handler();

        RESUME.store(false, Ordering::SeqCst);
        let me = gettid();
        let pid = unsafe { libc::getpid() };
        let mut signaled: HashSet<i64> = HashSet::new();

        // Signal until no new task appears; a task set that stopped growing
        // cannot grow again once every peer is parked.
        loop {
            let mut newly_signaled = false;
            for tid in list_tasks() {
                if tid != me && signaled.insert(tid) {
                    unsafe {
                        libc::syscall(libc::SYS_tgkill, pid as libc::c_long, tid, suspend_signal());
                    }
                    newly_signaled = true;
                }
            }
            // Wait for every signaled peer that still exists to park.
            loop {
                signaled.retain(|&tid| task_alive(tid));
                if PARKED.load(Ordering::SeqCst) >= signaled.len() {
                    break;
                }
                unsafe { libc::sched_yield() };
            }
            if !newly_signaled {
                break;
            }
        }

        callback();

        RESUME.store(true, Ordering::SeqCst);
        while PARKED.load(Ordering::SeqCst) > 0 {
            unsafe { libc::sched_yield() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn world_actually_stops() {
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        // Let the worker get going.
        while counter.load(Ordering::Relaxed) < 1000 {
            std::hint::spin_loop();
        }

        let mut frozen = (0, 0);
        stop_the_world(|| {
            let before = counter.load(Ordering::Relaxed);
            std::thread::sleep(std::time::Duration::from_millis(50));
            let after = counter.load(Ordering::Relaxed);
            frozen = (before, after);
        });

        assert_eq!(frozen.0, frozen.1, "worker advanced while world stopped");

        // And it resumes afterwards.
        let resumed_from = counter.load(Ordering::Relaxed);
        while counter.load(Ordering::Relaxed) == resumed_from {
            std::hint::spin_loop();
        }

        done.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }

    #[test]
    fn nested_callers_serialize() {
        let mut order = Vec::new();
        stop_the_world(|| order.push(1));
        stop_the_world(|| order.push(2));
        assert_eq!(order, vec![1, 2]);
    }
}
