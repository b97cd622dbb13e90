//!
//! Closure Objects and the Call Entry Point
//!
//! A `VeldClosure` packages a compiled function with its captured
//! environment. `veld_call_function_n_kw` is the single entry point the
//! runtime uses to invoke a callable with a flattened argument vector:
//! `n_pos` positional values followed by `n_kw` key/value pairs.
//!
//! Escapes from the callee travel through the thread-local pending
//! exception, never by unwinding across the call boundary.
//!

use crate::exception::veld_raise_type_error;
use crate::state::veld_stack_check;
use crate::value::{HeapHeader, HeapTag, veld_is_obj, veld_obj_decref, veld_obj_tag};
use std::alloc::{Layout, alloc, dealloc};
use std::ffi::{CStr, c_char};

/// Signature of a compiled veld function: captured environment, then the
/// positional/keyword split of the flattened argument vector.
pub type VeldClosureFn = extern "C" fn(env: i64, n_pos: usize, n_kw: usize, args: *const i64) -> i64;

#[repr(C)]
pub struct VeldClosure {
    pub header: HeapHeader,
    pub func: VeldClosureFn,
    pub env: i64,
    pub name: *const c_char, // static literal, may be null
}

/// Allocate a closure. Takes ownership of the `env` reference.
#[unsafe(no_mangle)]
pub extern "C" fn veld_closure_new(func: VeldClosureFn, env: i64, name: *const c_char) -> *mut VeldClosure {
    unsafe {
        let layout = Layout::new::<VeldClosure>();
        let ptr = alloc(layout) as *mut VeldClosure;
        if ptr.is_null() {
            panic!("Failed to allocate closure");
        }

        std::ptr::write(ptr, VeldClosure {
            header: HeapHeader::new(HeapTag::Closure),
            func,
            env,
            name,
        });

        ptr
    }
}

/// Printable form of a callable, for diagnostics
pub fn veld_closure_repr(fun: i64) -> String {
    unsafe {
        if veld_is_obj(fun) && veld_obj_tag(fun) == HeapTag::Closure {
            let name = (*(fun as *const VeldClosure)).name;
            if !name.is_null() {
                if let Ok(s) = CStr::from_ptr(name).to_str() {
                    return format!("<closure {}>", s);
                }
            }
            return format!("<closure at {:#x}>", fun);
        }
        format!("<object at {:#x}>", fun)
    }
}

/// Invoke a callable with `n_pos` positional values followed by `n_kw`
/// key/value pairs, all flattened into `args`. Returns the callee's
/// result, or the null value with an exception pending.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_call_function_n_kw(
    fun: i64,
    n_pos: usize,
    n_kw: usize,
    args: *const i64,
) -> i64 {
    if veld_stack_check() != 0 {
        return 0;
    }
    unsafe {
        if !veld_is_obj(fun) || veld_obj_tag(fun) != HeapTag::Closure {
            veld_raise_type_error("object is not callable");
            return 0;
        }
        let closure = fun as *const VeldClosure;
        ((*closure).func)((*closure).env, n_pos, n_kw, args)
    }
}

/// Free a closure whose refcount reached zero. Releases the captured
/// environment. Called from the generic decref dispatch.
pub(crate) unsafe fn free_closure(closure: *mut VeldClosure) {
    unsafe {
        veld_obj_decref((*closure).env);
        std::ptr::drop_in_place(closure);
        dealloc(closure as *mut u8, Layout::new::<VeldClosure>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::{
        EXCEPTION_TYPE_TYPE_ERROR, veld_exception_check, veld_exception_discard,
        veld_exception_get_type_id,
    };
    use crate::value::{veld_int_new, veld_int_value};

    extern "C" fn add_positionals(_env: i64, n_pos: usize, _n_kw: usize, args: *const i64) -> i64 {
        let mut sum = 0;
        for i in 0..n_pos {
            sum += veld_int_value(unsafe { *args.add(i) });
        }
        veld_int_new(sum)
    }

    #[test]
    fn test_call_with_positionals() {
        let fun = veld_closure_new(add_positionals, 0, c"add".as_ptr());
        let args = [veld_int_new(2), veld_int_new(40)];
        unsafe {
            let result = veld_call_function_n_kw(fun as i64, 2, 0, args.as_ptr());
            assert_eq!(veld_int_value(result), 42);
            assert_eq!(veld_exception_check(), 0);
            veld_obj_decref(fun as i64);
        }
    }

    #[test]
    fn test_call_non_callable_raises() {
        unsafe {
            let result = veld_call_function_n_kw(veld_int_new(9), 0, 0, std::ptr::null());
            assert_eq!(result, 0);
            assert_eq!(veld_exception_check(), 1);
            assert_eq!(veld_exception_get_type_id(), EXCEPTION_TYPE_TYPE_ERROR);
            veld_exception_discard();
        }
    }

    #[test]
    fn test_repr_uses_name() {
        let fun = veld_closure_new(add_positionals, 0, c"worker".as_ptr());
        assert_eq!(veld_closure_repr(fun as i64), "<closure worker>");
        assert!(veld_closure_repr(veld_int_new(5)).starts_with("<object"));
        unsafe { veld_obj_decref(fun as i64) };
    }
}
