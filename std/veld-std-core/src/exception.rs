//!
//! Exception Handling Primitives
//!
//! Thread-local pending-exception storage for veld's structured escape
//! handling. A raise stores a payload struct plus a type id; callers and
//! the thread trampoline classify the escape by id alone, never by
//! message text. `SystemExit` is the sanctioned early-termination signal
//! and is distinguished from every failure the same way.
//!
//! Exception Type IDs:
//! - 0: none pending
//! - 1: SystemExit
//! - 2: TypeError
//! - 3: OSError (carries the platform error code)
//! - 4: RecursionError
//! - 5: RuntimeError
//!

use crate::value::{
    VeldString, VeldStruct, veld_int_new, veld_int_value, veld_is_obj, veld_obj_decref,
    veld_string_from, veld_struct_get_field, veld_struct_new, veld_struct_set_field,
};
use std::cell::Cell;

thread_local! {
    static CURRENT_EXCEPTION: Cell<i64> = const { Cell::new(0) };
    static CURRENT_EXCEPTION_TYPE_ID: Cell<i64> = const { Cell::new(0) };
}

pub const EXCEPTION_TYPE_NONE: i64 = 0;
pub const EXCEPTION_TYPE_SYSTEM_EXIT: i64 = 1;
pub const EXCEPTION_TYPE_TYPE_ERROR: i64 = 2;
pub const EXCEPTION_TYPE_OS_ERROR: i64 = 3;
pub const EXCEPTION_TYPE_RECURSION_ERROR: i64 = 4;
pub const EXCEPTION_TYPE_RUNTIME_ERROR: i64 = 5;

/// Struct type ids of the built-in exception payloads
pub const SYSTEM_EXIT_STRUCT_TYPE_ID: u32 = 0xFFFF_0001;
pub const TYPE_ERROR_STRUCT_TYPE_ID: u32 = 0xFFFF_0002;
pub const OS_ERROR_STRUCT_TYPE_ID: u32 = 0xFFFF_0003;
pub const RECURSION_ERROR_STRUCT_TYPE_ID: u32 = 0xFFFF_0004;
pub const RUNTIME_ERROR_STRUCT_TYPE_ID: u32 = 0xFFFF_0005;

/// Set the current exception with type ID (called by throw)
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_set_typed(value: i64, type_id: i64) {
    CURRENT_EXCEPTION.with(|ex| ex.set(value));
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.set(type_id));
}

/// Get the current exception payload (0 if none)
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_get() -> i64 {
    CURRENT_EXCEPTION.with(|ex| ex.get())
}

/// Get the current exception type ID
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_get_type_id() -> i64 {
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.get())
}

/// Check whether the current exception matches the given type ID
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_is_type(type_id: i64) -> i64 {
    let current = CURRENT_EXCEPTION_TYPE_ID.with(|id| id.get());
    if current == type_id { 1 } else { 0 }
}

/// Check if there's a pending exception
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_check() -> i64 {
    CURRENT_EXCEPTION_TYPE_ID.with(|id| if id.get() == EXCEPTION_TYPE_NONE { 0 } else { 1 })
}

/// Clear the current exception (called after a catch takes ownership of
/// the payload)
#[unsafe(no_mangle)]
pub extern "C" fn veld_exception_clear() {
    CURRENT_EXCEPTION.with(|ex| ex.set(0));
    CURRENT_EXCEPTION_TYPE_ID.with(|id| id.set(EXCEPTION_TYPE_NONE));
}

/// Drop the current exception: release the payload and clear the cells.
/// Used where nothing takes ownership, e.g. the thread trampoline.
pub fn veld_exception_discard() {
    let value = veld_exception_get();
    unsafe { veld_obj_decref(value) };
    veld_exception_clear();
}

/// Build an OSError payload carrying a platform error code
#[unsafe(no_mangle)]
pub extern "C" fn veld_os_error_new(message: *mut VeldString, code: i64) -> *mut VeldStruct {
    unsafe {
        let exc = veld_struct_new(OS_ERROR_STRUCT_TYPE_ID, 2);
        veld_struct_set_field(exc, 0, message as i64);
        veld_struct_set_field(exc, 1, veld_int_new(code));
        exc
    }
}

fn message_payload(struct_type_id: u32, message: &str) -> *mut VeldStruct {
    unsafe {
        let exc = veld_struct_new(struct_type_id, 1);
        veld_struct_set_field(exc, 0, veld_string_from(message) as i64);
        exc
    }
}

pub fn veld_raise_type_error(message: &str) {
    let exc = message_payload(TYPE_ERROR_STRUCT_TYPE_ID, message);
    veld_exception_set_typed(exc as i64, EXCEPTION_TYPE_TYPE_ERROR);
}

pub fn veld_raise_runtime_error(message: &str) {
    let exc = message_payload(RUNTIME_ERROR_STRUCT_TYPE_ID, message);
    veld_exception_set_typed(exc as i64, EXCEPTION_TYPE_RUNTIME_ERROR);
}

pub fn veld_raise_recursion_error() {
    let exc = message_payload(RECURSION_ERROR_STRUCT_TYPE_ID, "maximum recursion depth exceeded");
    veld_exception_set_typed(exc as i64, EXCEPTION_TYPE_RECURSION_ERROR);
}

pub fn veld_raise_os_error(code: i64) {
    let exc = veld_os_error_new(std::ptr::null_mut(), code);
    veld_exception_set_typed(exc as i64, EXCEPTION_TYPE_OS_ERROR);
}

/// Raise the exit signal. Inside a spawned thread the trampoline swallows
/// it; on the initial thread the host's top-level handler decides.
pub fn veld_raise_system_exit() {
    let exc = veld_struct_new(SYSTEM_EXIT_STRUCT_TYPE_ID, 0);
    veld_exception_set_typed(exc as i64, EXCEPTION_TYPE_SYSTEM_EXIT);
}

fn exception_name(type_id: i64) -> &'static str {
    match type_id {
        EXCEPTION_TYPE_SYSTEM_EXIT => "SystemExit",
        EXCEPTION_TYPE_TYPE_ERROR => "TypeError",
        EXCEPTION_TYPE_OS_ERROR => "OSError",
        EXCEPTION_TYPE_RECURSION_ERROR => "RecursionError",
        EXCEPTION_TYPE_RUNTIME_ERROR => "RuntimeError",
        _ => "Exception",
    }
}

/// One-line rendering of the pending exception, or None if nothing is
/// pending. Does not consume the exception.
pub fn veld_exception_format() -> Option<String> {
    if veld_exception_check() == 0 {
        return None;
    }
    let type_id = veld_exception_get_type_id();
    let name = exception_name(type_id);
    let value = veld_exception_get();

    if !veld_is_obj(value) {
        return Some(name.to_string());
    }
    unsafe {
        let exc = value as *const VeldStruct;
        let message = veld_struct_get_field(exc, 0) as *const VeldString;
        let message = if message.is_null() { None } else { Some((*message).as_str()) };

        if type_id == EXCEPTION_TYPE_OS_ERROR {
            let code = veld_int_value(veld_struct_get_field(exc, 1));
            return Some(match message {
                Some(m) => format!("{}: {} (os error {})", name, m, code),
                None => format!("{}: {}", name, code),
            });
        }
        Some(match message {
            Some(m) => format!("{}: {}", name, m),
            None => name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_classify() {
        assert_eq!(veld_exception_check(), 0);
        veld_raise_type_error("expecting a map for keyword args");
        assert_eq!(veld_exception_check(), 1);
        assert_eq!(veld_exception_is_type(EXCEPTION_TYPE_TYPE_ERROR), 1);
        assert_eq!(veld_exception_is_type(EXCEPTION_TYPE_SYSTEM_EXIT), 0);
        assert_eq!(
            veld_exception_format().as_deref(),
            Some("TypeError: expecting a map for keyword args")
        );
        veld_exception_discard();
        assert_eq!(veld_exception_check(), 0);
        assert_eq!(veld_exception_format(), None);
    }

    #[test]
    fn test_os_error_carries_code() {
        veld_raise_os_error(11);
        assert_eq!(veld_exception_get_type_id(), EXCEPTION_TYPE_OS_ERROR);
        assert_eq!(veld_exception_format().as_deref(), Some("OSError: 11"));
        veld_exception_discard();
    }

    #[test]
    fn test_exit_signal_is_identified_by_id() {
        veld_raise_system_exit();
        assert_eq!(veld_exception_get_type_id(), EXCEPTION_TYPE_SYSTEM_EXIT);
        // the payload carries no message; identity is the id
        assert_eq!(veld_exception_format().as_deref(), Some("SystemExit"));
        veld_exception_discard();
    }

    #[test]
    fn test_pending_is_thread_local() {
        veld_raise_runtime_error("only here");
        let other = std::thread::spawn(|| veld_exception_check());
        assert_eq!(other.join().unwrap(), 0);
        veld_exception_discard();
    }
}
