//!
//! Lock Objects
//!
//! A `VeldLock` pairs a blocking binary semaphore with an advisory
//! held/free flag. The semaphore is a Mutex/Condvar pair so a lock may
//! be released by a thread other than the one that acquired it; no
//! ownership is verified on release. The advisory flag is not updated
//! atomically with the semaphore, so `locked()` may observe stale
//! values under races.
//!

use std::alloc::{Layout, alloc, dealloc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use veld_std_core::{
    HeapHeader, HeapTag, veld_obj_set_lock_finalizer, veld_raise_os_error,
};

#[repr(C)]
pub struct VeldLock {
    pub header: HeapHeader,
    held: Mutex<bool>,
    waiters: Condvar,
    locked: AtomicBool,
}

unsafe extern "C" fn finalize_lock(obj: *mut HeapHeader) {
    unsafe {
        let lock = obj as *mut VeldLock;
        std::ptr::drop_in_place(lock);
        dealloc(lock as *mut u8, Layout::new::<VeldLock>());
    }
}

/// Allocate a new lock in the unlocked state
#[unsafe(no_mangle)]
pub extern "C" fn veld_lock_new() -> *mut VeldLock {
    veld_obj_set_lock_finalizer(finalize_lock);
    unsafe {
        let ptr = alloc(Layout::new::<VeldLock>()) as *mut VeldLock;
        if ptr.is_null() {
            panic!("Failed to allocate lock");
        }

        std::ptr::write(ptr, VeldLock {
            header: HeapHeader::new(HeapTag::Lock),
            held: Mutex::new(false),
            waiters: Condvar::new(),
            locked: AtomicBool::new(false),
        });

        ptr
    }
}

/// `allocate_lock()` - new lock as a tagged value
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_allocate_lock() -> i64 {
    veld_lock_new() as i64
}

/// Acquire the lock. With `wait` nonzero, blocks until the lock is
/// free; otherwise fails immediately when it is taken. Returns 1 on
/// success, 0 on failure. A broken underlying primitive raises an
/// OSError carrying the platform error code and returns 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_acquire(lock: *mut VeldLock, wait: i64) -> i64 {
    if lock.is_null() {
        return 0;
    }
    let lock = unsafe { &*lock };

    let mut held = match lock.held.lock() {
        Ok(guard) => guard,
        Err(_) => {
            veld_raise_os_error(libc::EINVAL as i64);
            return 0;
        }
    };

    if wait == 0 {
        if *held {
            return 0;
        }
    } else {
        while *held {
            held = match lock.waiters.wait(held) {
                Ok(guard) => guard,
                Err(_) => {
                    veld_raise_os_error(libc::EINVAL as i64);
                    return 0;
                }
            };
        }
    }

    *held = true;
    drop(held);
    lock.locked.store(true, Ordering::Relaxed);
    1
}

/// Acquire with a timeout argument. The timeout is accepted for call
/// compatibility but not honored; blocking behavior follows `wait`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_acquire_timeout(
    lock: *mut VeldLock,
    wait: i64,
    _timeout_ms: i64,
) -> i64 {
    unsafe { veld_lock_acquire(lock, wait) }
}

/// Release the lock and wake one waiter. No ownership check: releasing
/// an unheld lock, or one held by another thread, succeeds silently.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_release(lock: *mut VeldLock) {
    if lock.is_null() {
        return;
    }
    let lock = unsafe { &*lock };

    lock.locked.store(false, Ordering::Relaxed);
    if let Ok(mut held) = lock.held.lock() {
        *held = false;
    }
    lock.waiters.notify_one();
}

/// Advisory held/free flag
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_locked(lock: *const VeldLock) -> i64 {
    if lock.is_null() {
        return 0;
    }
    unsafe { (*lock).locked.load(Ordering::Relaxed) as i64 }
}

/// Scope entry hook: blocking acquire
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_enter(lock: *mut VeldLock) -> i64 {
    unsafe { veld_lock_acquire(lock, 1) }
}

/// Scope exit hook: runs on both normal and exceptional exit
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_lock_exit(lock: *mut VeldLock) {
    unsafe { veld_lock_release(lock) }
}
