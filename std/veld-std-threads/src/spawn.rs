//!
//! Thread Launch Path
//!
//! `start_new_thread` validates the call arguments, flattens them into a
//! self-contained bundle, and hands the bundle to a new OS thread. The
//! thread runs a fixed entry trampoline: install interpreter state,
//! invoke the callable, classify whatever escapes. The exit signal ends
//! the thread silently; any other uncaught exception is reported once
//! through the platform print sink. Nothing a spawned thread does can
//! fail the spawner or the process.
//!
//! There is no join handle and no way to wait: the only user-visible
//! guarantee of `start_new_thread` is that it returns without blocking
//! on the callable.
//!

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use veld_std_core::{
    EXCEPTION_TYPE_SYSTEM_EXIT, HeapTag, VeldArray, VeldMap, VeldThreadState,
    veld_call_function_n_kw, veld_closure_repr, veld_exception_check, veld_exception_discard,
    veld_exception_is_type, veld_is_obj, veld_obj_decref, veld_obj_incref, veld_obj_tag,
    veld_plat_print_str, veld_raise_os_error, veld_raise_system_exit, veld_raise_type_error,
    veld_stack_set_limit, veld_stack_set_top, veld_thread_clear_state, veld_thread_get_state,
    veld_thread_set_state,
};

/// Process-wide default stack size for spawned threads; 0 defers to the
/// platform default
static THREAD_STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Recursion guard depth installed for every spawned thread
const THREAD_STACK_LIMIT: usize = 16 * 1024;

/// The marshalled call: callable plus the flattened argument vector,
/// `n_pos` positional values followed by `n_kw` key/value pairs. Holds
/// one reference to the callable and to every flattened value; exactly
/// one owner exists at a time - the spawner until the OS thread starts,
/// the spawned thread afterwards.
struct ThreadEntryArgs {
    fun: i64,
    n_pos: usize,
    n_kw: usize,
    args: Vec<i64>,
}

impl Drop for ThreadEntryArgs {
    fn drop(&mut self) {
        unsafe {
            for &value in &self.args {
                veld_obj_decref(value);
            }
            veld_obj_decref(self.fun);
        }
    }
}

/// Validate and flatten the call arguments. Returns None with a
/// TypeError pending when the positional argument is not an array or
/// the keyword argument is not a map.
fn marshal_args(fun: i64, pos_args: i64, kw_args: i64) -> Option<Box<ThreadEntryArgs>> {
    unsafe {
        if !veld_is_obj(pos_args) || veld_obj_tag(pos_args) != HeapTag::Array {
            veld_raise_type_error("expecting an array of positional args");
            return None;
        }
        if kw_args != 0 && (!veld_is_obj(kw_args) || veld_obj_tag(kw_args) != HeapTag::Map) {
            veld_raise_type_error("expecting a map for keyword args");
            return None;
        }

        let pos = pos_args as *const VeldArray;
        let n_pos = (*pos).len;

        let mut n_kw = 0;
        let mut args = Vec::with_capacity(n_pos + 2 * n_kw);
        for i in 0..n_pos {
            args.push(*(*pos).data.add(i));
        }

        if kw_args != 0 {
            // key/value pairs in the map's own table order
            let map = kw_args as *const VeldMap;
            n_kw = (*map).length;
            args.reserve(2 * n_kw);
            for i in 0..(*map).capacity {
                let entry = (*map).entries.add(i);
                if (*entry).occupied {
                    args.push((*entry).key);
                    args.push((*entry).value);
                }
            }
        }

        veld_obj_incref(fun);
        for &value in &args {
            veld_obj_incref(value);
        }

        Some(Box::new(ThreadEntryArgs { fun, n_pos, n_kw, args }))
    }
}

/// Entry trampoline run by every spawned thread
fn thread_entry(bundle: Box<ThreadEntryArgs>) {
    // interpreter state must exist before any user code runs; it lives
    // on this thread's stack and is unpublished again before it dies
    let mut state = VeldThreadState::new();
    unsafe { veld_thread_set_state(&raw mut state) };
    veld_stack_set_top(&raw const state as *const u8);
    veld_stack_set_limit(THREAD_STACK_LIMIT);

    unsafe {
        veld_call_function_n_kw(bundle.fun, bundle.n_pos, bundle.n_kw, bundle.args.as_ptr());
    }

    if veld_exception_check() != 0 {
        if veld_exception_is_type(EXCEPTION_TYPE_SYSTEM_EXIT) == 0 {
            veld_plat_print_str(&format!(
                "Unhandled exception in thread started by {}\n",
                veld_closure_repr(bundle.fun)
            ));
            if let Some(rendered) = veld_std_core::veld_exception_format() {
                veld_plat_print_str(&format!("{}\n", rendered));
            }
        }
        veld_exception_discard();
    }

    veld_thread_clear_state();
    // bundle dropped here, releasing the callable and argument references
}

/// `start_new_thread(fn, pos_args[, kw_args])` - spawn a detached thread
/// running `fn`. `kw_args` may be the null value. Validation failures
/// raise synchronously and no thread is created. Spawn failures raise an
/// OSError carrying the platform error code.
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_start_new_thread(fun: i64, pos_args: i64, kw_args: i64) -> i64 {
    let Some(bundle) = marshal_args(fun, pos_args, kw_args) else {
        return 0;
    };

    let stack_size = THREAD_STACK_SIZE.load(Ordering::Relaxed);
    let mut builder = thread::Builder::new();
    if stack_size > 0 {
        builder = builder.stack_size(stack_size);
    }

    match builder.spawn(move || thread_entry(bundle)) {
        Ok(handle) => {
            // detached: the handle is never joined
            drop(handle);
        }
        Err(err) => {
            let code = err.raw_os_error().unwrap_or(libc::EAGAIN);
            veld_raise_os_error(code as i64);
        }
    }
    0
}

/// `stack_size()` - return the configured default stack size and reset
/// it to 0 (platform default)
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_stack_size_get() -> i64 {
    THREAD_STACK_SIZE.swap(0, Ordering::Relaxed) as i64
}

/// `stack_size(n)` - set the default stack size for subsequently spawned
/// threads, returning the previous value
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_stack_size_set(size: i64) -> i64 {
    let size = if size < 0 { 0 } else { size as usize };
    THREAD_STACK_SIZE.swap(size, Ordering::Relaxed) as i64
}

/// `get_ident()` - opaque identity of the calling thread, derived from
/// its interpreter-state address. Unique among live threads only.
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_get_ident() -> i64 {
    veld_thread_get_state() as i64
}

/// `exit()` - raise the exit signal on the calling thread. Inside a
/// spawned thread the trampoline swallows it and the thread ends
/// silently.
#[unsafe(no_mangle)]
pub extern "C" fn veld_thread_exit() {
    veld_raise_system_exit();
}
