//!
//! Per-Thread Interpreter State
//!
//! Every thread executing veld code has a `VeldThreadState` holding its
//! stack bounds. The interpreter machinery (recursion guard, exception
//! cells) assumes the state exists and is never touched by another
//! thread. Spawned threads install a fresh state on their own stack
//! before any user code runs; threads that never installed one (the
//! initial thread, foreign host threads) get a lazily created
//! thread-local fallback so state queries are total.
//!
//! The state's address doubles as the thread identity: unique among live
//! threads, meaningless after the thread ends.
//!

use crate::exception::veld_raise_recursion_error;
use std::cell::{Cell, RefCell};

#[repr(C)]
pub struct VeldThreadState {
    /// Highest stack address veld code on this thread may use
    pub stack_top: *const u8,
    /// Depth in bytes past `stack_top` at which calls are rejected;
    /// 0 disables the guard
    pub stack_limit: usize,
}

impl VeldThreadState {
    pub fn new() -> Self {
        Self {
            stack_top: std::ptr::null(),
            stack_limit: 0,
        }
    }
}

impl Default for VeldThreadState {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static THREAD_STATE: Cell<*mut VeldThreadState> = const { Cell::new(std::ptr::null_mut()) };
    static FALLBACK_STATE: RefCell<Option<Box<VeldThreadState>>> = const { RefCell::new(None) };
}

/// Publish this thread's state. The pointee must outlive every veld call
/// made on this thread; clear it again before the storage goes away.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_thread_set_state(state: *mut VeldThreadState) {
    THREAD_STATE.with(|ts| ts.set(state));
}

/// Unpublish this thread's state (on trampoline exit)
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_clear_state() {
    THREAD_STATE.with(|ts| ts.set(std::ptr::null_mut()));
}

/// Current thread's state. Installs the fallback state on threads that
/// never published one, so the result is always non-null.
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_get_state() -> *mut VeldThreadState {
    THREAD_STATE.with(|ts| {
        let mut state = ts.get();
        if state.is_null() {
            state = FALLBACK_STATE.with(|fallback| {
                let mut slot = fallback.borrow_mut();
                let boxed = slot.get_or_insert_with(|| Box::new(VeldThreadState::new()));
                &raw mut **boxed
            });
            ts.set(state);
        }
        state
    })
}

/// Record the top of this thread's usable stack
#[unsafe(no_mangle)]
pub extern "C" fn veld_stack_set_top(top: *const u8) {
    unsafe { (*veld_thread_get_state()).stack_top = top };
}

/// Set the recursion guard depth (0 disables)
#[unsafe(no_mangle)]
pub extern "C" fn veld_stack_set_limit(limit: usize) {
    unsafe { (*veld_thread_get_state()).stack_limit = limit };
}

/// Reject the call if this thread is deeper than its stack limit.
/// Returns nonzero with a RecursionError pending when the guard trips.
#[unsafe(no_mangle)]
pub extern "C" fn veld_stack_check() -> i64 {
    let state = veld_thread_get_state();
    let probe = 0u8;
    let sp = &raw const probe as usize;
    unsafe {
        let top = (*state).stack_top as usize;
        let limit = (*state).stack_limit;
        if top == 0 || limit == 0 {
            return 0;
        }
        // stacks grow downward; a probe above the recorded top means the
        // top was recorded in a deeper frame and the depth is zero
        if sp < top && top - sp > limit {
            veld_raise_recursion_error();
            return 1;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::{
        EXCEPTION_TYPE_RECURSION_ERROR, veld_exception_discard, veld_exception_get_type_id,
    };

    #[test]
    fn test_get_state_is_stable_and_non_null() {
        let first = veld_thread_get_state();
        let second = veld_thread_get_state();
        assert!(!first.is_null());
        assert_eq!(first, second);
    }

    #[test]
    fn test_states_differ_across_threads() {
        let here = veld_thread_get_state() as usize;
        let there = std::thread::spawn(|| veld_thread_get_state() as usize)
            .join()
            .unwrap();
        assert_ne!(here, 0);
        assert_ne!(there, 0);
        assert_ne!(here, there);
    }

    #[test]
    fn test_installed_state_wins_over_fallback() {
        std::thread::spawn(|| {
            let mut state = VeldThreadState::new();
            unsafe { veld_thread_set_state(&raw mut state) };
            assert_eq!(veld_thread_get_state(), &raw mut state);
            veld_thread_clear_state();
            // after clearing, queries fall back to a fresh slot
            assert_ne!(veld_thread_get_state(), &raw mut state);
        })
        .join()
        .unwrap();
    }

    #[inline(never)]
    fn check_from_deeper_frame() -> i64 {
        let pad = [0u8; 256];
        std::hint::black_box(&pad);
        veld_stack_check()
    }

    #[test]
    fn test_stack_guard_trips() {
        std::thread::spawn(|| {
            let marker = 0u8;
            veld_stack_set_top(&raw const marker);
            veld_stack_set_limit(1);
            assert_ne!(check_from_deeper_frame(), 0);
            assert_eq!(veld_exception_get_type_id(), EXCEPTION_TYPE_RECURSION_ERROR);
            veld_exception_discard();

            veld_stack_set_limit(0);
            assert_eq!(veld_stack_check(), 0);
        })
        .join()
        .unwrap();
    }
}
