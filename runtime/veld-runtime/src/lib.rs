//!
//! veld Runtime
//!
//! Re-exports the runtime surface from the standard library crates:
//!
//! - Core types, call machinery and exceptions (from veld-std-core)
//! - Detached threads and locks (from veld-std-threads)
//!

pub use veld_std_core::*;
pub use veld_std_threads::*;

/// Initialize the runtime on the process's initial thread (call once at
/// program start). Pins the main thread's interpreter state so identity
/// queries are stable, and records an approximate stack top. The main
/// thread runs with the platform's default stack and no recursion
/// guard.
pub fn init() {
    use std::io::Write;

    let stack_marker = 0u8;
    veld_stack_set_top(&raw const stack_marker);
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_pins_main_identity() {
        init();
        let first = veld_thread_get_ident();
        init();
        assert_eq!(veld_thread_get_ident(), first);
        assert_ne!(first, 0);
    }
}
