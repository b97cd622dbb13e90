//!
//! Runtime Value Representation
//!
//! veld values at runtime are 64-bit tagged words:
//!
//! - Bit 0 set: an immediate integer, payload in bits 1..63
//! - Bit 0 clear: a pointer to a reference-counted heap object, or the
//!   null value 0
//!
//! Heap objects are 8-byte aligned so pointer values never collide with
//! the immediate tag. Every heap object starts with a `HeapHeader` whose
//! tag identifies the concrete layout.
//!

use std::alloc::{Layout, alloc, dealloc};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Type tags for heap objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTag {
    String = 0,
    Array = 1,
    Map = 2,
    Struct = 3,
    Closure = 4,
    Lock = 5,
}

/// Header for all heap-allocated objects
#[repr(C)]
pub struct HeapHeader {
    pub refcount: AtomicUsize,
    pub tag: HeapTag,
    pub _pad: [u8; 7],
}

impl HeapHeader {
    pub fn new(tag: HeapTag) -> Self {
        Self {
            refcount: AtomicUsize::new(1),
            tag,
            _pad: [0; 7],
        }
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::Release) == 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Box an integer as an immediate value
#[unsafe(no_mangle)]
pub extern "C" fn veld_int_new(n: i64) -> i64 {
    (n << 1) | 1
}

/// Unbox an immediate integer
#[unsafe(no_mangle)]
pub extern "C" fn veld_int_value(v: i64) -> i64 {
    v >> 1
}

/// True if the value is an immediate integer
#[unsafe(no_mangle)]
pub extern "C" fn veld_is_int(v: i64) -> i64 {
    v & 1
}

/// True if the value is a heap object pointer (non-null, bit 0 clear)
pub fn veld_is_obj(v: i64) -> bool {
    v != 0 && v & 1 == 0
}

/// Read the heap tag of an object value. Caller must ensure `v` is a
/// heap pointer (`veld_is_obj`).
pub unsafe fn veld_obj_tag(v: i64) -> HeapTag {
    unsafe { (*(v as *const HeapHeader)).tag }
}

/// A heap-allocated string
#[repr(C)]
pub struct VeldString {
    pub header: HeapHeader,
    pub len: usize,
    pub data: [u8; 0], // flexible array member
}

impl VeldString {
    pub fn as_str(&self) -> &str {
        unsafe {
            let slice = std::slice::from_raw_parts(self.data.as_ptr(), self.len);
            std::str::from_utf8_unchecked(slice)
        }
    }

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(
            std::mem::size_of::<VeldString>() + len,
            std::mem::align_of::<VeldString>(),
        )
        .unwrap()
    }
}

/// Allocate a new string on the heap
#[unsafe(no_mangle)]
pub extern "C" fn veld_string_new(data: *const u8, len: usize) -> *mut VeldString {
    unsafe {
        let ptr = alloc(VeldString::layout(len)) as *mut VeldString;
        if ptr.is_null() {
            panic!("Failed to allocate string");
        }

        (*ptr).header = HeapHeader::new(HeapTag::String);
        (*ptr).len = len;

        if !data.is_null() && len > 0 {
            std::ptr::copy_nonoverlapping(data, (*ptr).data.as_mut_ptr(), len);
        }

        ptr
    }
}

/// Allocate a string from a Rust `&str`
pub fn veld_string_from(s: &str) -> *mut VeldString {
    veld_string_new(s.as_ptr(), s.len())
}

/// Compare two strings for byte equality
#[unsafe(no_mangle)]
pub extern "C" fn veld_string_eq(a: *const VeldString, b: *const VeldString) -> i64 {
    unsafe {
        if a.is_null() && b.is_null() {
            return 1;
        }
        if a.is_null() || b.is_null() {
            return 0;
        }
        if (*a).len != (*b).len {
            return 0;
        }
        let a_slice = std::slice::from_raw_parts((*a).data.as_ptr(), (*a).len);
        let b_slice = std::slice::from_raw_parts((*b).data.as_ptr(), (*b).len);
        if a_slice == b_slice { 1 } else { 0 }
    }
}

/// A heap-allocated struct instance. Fields hold owned references:
/// the struct releases them when it is freed.
#[repr(C)]
pub struct VeldStruct {
    pub header: HeapHeader,
    pub type_id: u32,
    pub field_count: u32,
    pub fields: [i64; 0], // flexible array of field values
}

impl VeldStruct {
    fn layout(field_count: u32) -> Layout {
        Layout::from_size_align(
            std::mem::size_of::<VeldStruct>()
                + (field_count as usize) * std::mem::size_of::<i64>(),
            std::mem::align_of::<VeldStruct>(),
        )
        .unwrap()
    }
}

/// Allocate a new struct with all fields set to the null value
#[unsafe(no_mangle)]
pub extern "C" fn veld_struct_new(type_id: u32, field_count: u32) -> *mut VeldStruct {
    unsafe {
        let ptr = alloc(VeldStruct::layout(field_count)) as *mut VeldStruct;
        if ptr.is_null() {
            panic!("Failed to allocate struct");
        }

        (*ptr).header = HeapHeader::new(HeapTag::Struct);
        (*ptr).type_id = type_id;
        (*ptr).field_count = field_count;

        let fields_ptr = (*ptr).fields.as_mut_ptr();
        for i in 0..field_count as usize {
            *fields_ptr.add(i) = 0;
        }

        ptr
    }
}

/// Get field value by index
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_struct_get_field(s: *const VeldStruct, field_index: u32) -> i64 {
    if s.is_null() {
        return 0;
    }
    unsafe {
        if field_index >= (*s).field_count {
            return 0;
        }
        *(*s).fields.as_ptr().add(field_index as usize)
    }
}

/// Set field value by index. The struct takes ownership of the reference.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_struct_set_field(s: *mut VeldStruct, field_index: u32, value: i64) {
    if s.is_null() {
        return;
    }
    unsafe {
        if field_index < (*s).field_count {
            *(*s).fields.as_mut_ptr().add(field_index as usize) = value;
        }
    }
}

/// Finalizer for heap tags whose layout lives outside this crate.
/// Receives an object whose refcount has already reached zero and must
/// free it.
pub type ExternFinalizer = unsafe extern "C" fn(*mut HeapHeader);

static LOCK_FINALIZER: OnceLock<ExternFinalizer> = OnceLock::new();

/// Register the finalizer for `HeapTag::Lock` objects. Called by the
/// threads crate when it allocates its first lock.
pub fn veld_obj_set_lock_finalizer(f: ExternFinalizer) {
    let _ = LOCK_FINALIZER.set(f);
}

/// Increment the reference count of a value. No-op for immediates and
/// the null value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_obj_incref(v: i64) {
    if veld_is_obj(v) {
        unsafe { (*(v as *const HeapHeader)).incref() }
    }
}

/// Decrement the reference count of a value, freeing the object (and
/// releasing references it owns) when the count reaches zero. No-op for
/// immediates and the null value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_obj_decref(v: i64) {
    if !veld_is_obj(v) {
        return;
    }
    unsafe {
        let header = v as *mut HeapHeader;
        if !(*header).decref() {
            return;
        }
        match (*header).tag {
            HeapTag::String => {
                let s = v as *mut VeldString;
                dealloc(s as *mut u8, VeldString::layout((*s).len));
            }
            HeapTag::Array => crate::array::free_array(v as *mut crate::array::VeldArray),
            HeapTag::Map => crate::map::free_map(v as *mut crate::map::VeldMap),
            HeapTag::Struct => {
                let s = v as *mut VeldStruct;
                for i in 0..(*s).field_count as usize {
                    veld_obj_decref(*(*s).fields.as_ptr().add(i));
                }
                dealloc(s as *mut u8, VeldStruct::layout((*s).field_count));
            }
            HeapTag::Closure => crate::closure::free_closure(v as *mut crate::closure::VeldClosure),
            HeapTag::Lock => {
                if let Some(finalize) = LOCK_FINALIZER.get() {
                    finalize(header);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_tagging() {
        for n in [0i64, 1, -1, 42, -42, i64::MAX >> 1, i64::MIN >> 1] {
            let v = veld_int_new(n);
            assert_eq!(veld_is_int(v), 1);
            assert!(!veld_is_obj(v));
            assert_eq!(veld_int_value(v), n);
        }
    }

    #[test]
    fn test_string_creation_and_eq() {
        let a = veld_string_from("hello");
        let b = veld_string_from("hello");
        let c = veld_string_from("world");
        unsafe {
            assert_eq!((*a).len, 5);
            assert_eq!((*a).as_str(), "hello");
            assert_eq!((*a).header.refcount(), 1);
            assert_eq!(veld_string_eq(a, b), 1);
            assert_eq!(veld_string_eq(a, c), 0);
            veld_obj_decref(a as i64);
            veld_obj_decref(b as i64);
            veld_obj_decref(c as i64);
        }
    }

    #[test]
    fn test_struct_fields_owned() {
        let msg = veld_string_from("boom");
        let s = veld_struct_new(7, 2);
        unsafe {
            veld_struct_set_field(s, 0, msg as i64);
            veld_struct_set_field(s, 1, veld_int_new(11));
            assert_eq!(veld_struct_get_field(s, 0), msg as i64);
            assert_eq!(veld_int_value(veld_struct_get_field(s, 1)), 11);

            // keep a second reference to the message so we can observe
            // the struct releasing its own
            veld_obj_incref(msg as i64);
            assert_eq!((*msg).header.refcount(), 2);
            veld_obj_decref(s as i64);
            assert_eq!((*msg).header.refcount(), 1);
            veld_obj_decref(msg as i64);
        }
    }

    #[test]
    fn test_refcount_roundtrip() {
        let s = veld_string_from("ref");
        unsafe {
            veld_obj_incref(s as i64);
            veld_obj_incref(s as i64);
            assert_eq!((*s).header.refcount(), 3);
            veld_obj_decref(s as i64);
            veld_obj_decref(s as i64);
            assert_eq!((*s).header.refcount(), 1);
            veld_obj_decref(s as i64);
        }
    }

    #[test]
    fn test_incref_ignores_immediates() {
        // must not deref the payload as a pointer
        unsafe {
            veld_obj_incref(veld_int_new(1234));
            veld_obj_decref(veld_int_new(1234));
            veld_obj_incref(0);
            veld_obj_decref(0);
        }
    }
}
