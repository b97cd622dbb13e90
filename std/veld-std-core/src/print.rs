///
/// Platform Print Sink
///
/// The sink every runtime diagnostic goes through, most importantly the
/// uncaught-exception report of the thread trampoline. Defaults to
/// stderr; embedders can redirect it to route diagnostics into their own
/// output machinery.
///

use std::sync::Mutex;

pub type PlatSink = fn(&str);

fn stderr_sink(text: &str) {
    eprint!("{}", text);
}

static PLAT_SINK: Mutex<PlatSink> = Mutex::new(stderr_sink as PlatSink);

/// Write a string to the platform sink
pub fn veld_plat_print_str(text: &str) {
    let sink = *PLAT_SINK.lock().unwrap();
    sink(text);
}

/// FFI variant taking a raw byte range; invalid UTF-8 is replaced
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_plat_print_strn(data: *const u8, len: usize) {
    if data.is_null() {
        return;
    }
    let bytes = unsafe { std::slice::from_raw_parts(data, len) };
    veld_plat_print_str(&String::from_utf8_lossy(bytes));
}

/// Replace the platform sink, returning the previous one
pub fn veld_plat_print_redirect(sink: PlatSink) -> PlatSink {
    let mut current = PLAT_SINK.lock().unwrap();
    std::mem::replace(&mut *current, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    static CAPTURED: StdMutex<String> = StdMutex::new(String::new());

    fn capture_sink(text: &str) {
        CAPTURED.lock().unwrap().push_str(text);
    }

    #[test]
    fn test_redirect_and_restore() {
        let previous = veld_plat_print_redirect(capture_sink);
        veld_plat_print_str("one ");
        unsafe { veld_plat_print_strn(b"two".as_ptr(), 3) };
        let restored = veld_plat_print_redirect(previous);
        assert_eq!(restored as usize, capture_sink as usize);
        assert_eq!(CAPTURED.lock().unwrap().as_str(), "one two");
    }
}
