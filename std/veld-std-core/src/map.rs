//!
//! Runtime Map Type
//!
//! Hash map implementation for the veld map<K, V> type. String keys with
//! FNV-1a hashing and open addressing (linear probing). The map owns a
//! reference to each key and value.
//!
//! Keyword arguments to `start_new_thread` must have this shape; their
//! marshalling order is the table's probe order, which is neither sorted
//! nor insertion order.
//!

use crate::value::{HeapHeader, HeapTag, VeldString, veld_obj_decref, veld_obj_incref};
use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};

const INITIAL_CAPACITY: usize = 16;
const LOAD_FACTOR: f64 = 0.75;

#[repr(C)]
pub struct VeldMap {
    pub header: HeapHeader,
    pub capacity: usize,
    pub length: usize,
    pub entries: *mut MapEntry,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub key: i64,   // VeldString pointer, 0 if the slot is empty
    pub value: i64, // the stored value
    pub occupied: bool,
}

fn hash_string(s: *const VeldString) -> u64 {
    if s.is_null() {
        return 0;
    }
    unsafe {
        let len = (*s).len;
        let data = (*s).data.as_ptr();
        // FNV-1a
        let mut hash: u64 = 0xcbf29ce484222325;
        for i in 0..len {
            hash ^= *data.add(i) as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

fn string_eq(a: *const VeldString, b: *const VeldString) -> bool {
    crate::value::veld_string_eq(a, b) != 0
}

#[unsafe(no_mangle)]
pub extern "C" fn veld_map_new(capacity: usize) -> *mut VeldMap {
    let cap = if capacity < INITIAL_CAPACITY { INITIAL_CAPACITY } else { capacity };
    unsafe {
        let map_layout = Layout::new::<VeldMap>();
        let map_ptr = alloc(map_layout) as *mut VeldMap;
        if map_ptr.is_null() {
            panic!("Failed to allocate map");
        }

        let entries_layout = Layout::array::<MapEntry>(cap).unwrap();
        let entries_ptr = alloc_zeroed(entries_layout) as *mut MapEntry;
        if entries_ptr.is_null() {
            panic!("Failed to allocate map entries");
        }

        (*map_ptr).header = HeapHeader::new(HeapTag::Map);
        (*map_ptr).capacity = cap;
        (*map_ptr).length = 0;
        (*map_ptr).entries = entries_ptr;
        map_ptr
    }
}

/// Insert or update a key. The map takes its own reference to the key
/// and the value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_map_set(map: *mut VeldMap, key: i64, value: i64) {
    if map.is_null() {
        return;
    }
    unsafe {
        if ((*map).length + 1) as f64 / (*map).capacity as f64 > LOAD_FACTOR {
            resize_map(map);
        }
        let hash = hash_string(key as *const VeldString);
        let mut idx = (hash as usize) % (*map).capacity;
        loop {
            let entry = (*map).entries.add(idx);
            if !(*entry).occupied {
                veld_obj_incref(key);
                veld_obj_incref(value);
                (*entry).key = key;
                (*entry).value = value;
                (*entry).occupied = true;
                (*map).length += 1;
                return;
            }
            if string_eq((*entry).key as *const VeldString, key as *const VeldString) {
                veld_obj_incref(value);
                veld_obj_decref((*entry).value);
                (*entry).value = value;
                return;
            }
            idx = (idx + 1) % (*map).capacity;
        }
    }
}

/// Look up a key. Returns the stored value (borrowed) or the null value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_map_get(map: *const VeldMap, key: i64) -> i64 {
    if map.is_null() {
        return 0;
    }
    unsafe {
        let hash = hash_string(key as *const VeldString);
        let mut idx = (hash as usize) % (*map).capacity;
        let start_idx = idx;
        loop {
            let entry = (*map).entries.add(idx);
            if !(*entry).occupied {
                return 0;
            }
            if string_eq((*entry).key as *const VeldString, key as *const VeldString) {
                return (*entry).value;
            }
            idx = (idx + 1) % (*map).capacity;
            if idx == start_idx {
                return 0;
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn veld_map_len(map: *const VeldMap) -> i64 {
    if map.is_null() { 0 } else { unsafe { (*map).length as i64 } }
}

unsafe fn resize_map(map: *mut VeldMap) {
    unsafe {
        let old_cap = (*map).capacity;
        let old_entries = (*map).entries;
        let new_cap = old_cap * 2;

        let entries_layout = Layout::array::<MapEntry>(new_cap).unwrap();
        let new_entries = alloc_zeroed(entries_layout) as *mut MapEntry;
        if new_entries.is_null() {
            panic!("Failed to grow map");
        }
        (*map).entries = new_entries;
        (*map).capacity = new_cap;

        for i in 0..old_cap {
            let entry = old_entries.add(i);
            if (*entry).occupied {
                // rehash into the new table; references carry over
                let hash = hash_string((*entry).key as *const VeldString);
                let mut idx = (hash as usize) % new_cap;
                while (*new_entries.add(idx)).occupied {
                    idx = (idx + 1) % new_cap;
                }
                *new_entries.add(idx) = *entry;
            }
        }

        dealloc(old_entries as *mut u8, Layout::array::<MapEntry>(old_cap).unwrap());
    }
}

/// Free a map whose refcount reached zero. Releases key and value
/// references first. Called from the generic decref dispatch.
pub(crate) unsafe fn free_map(map: *mut VeldMap) {
    unsafe {
        for i in 0..(*map).capacity {
            let entry = (*map).entries.add(i);
            if (*entry).occupied {
                veld_obj_decref((*entry).key);
                veld_obj_decref((*entry).value);
            }
        }
        dealloc(
            (*map).entries as *mut u8,
            Layout::array::<MapEntry>((*map).capacity).unwrap(),
        );
        dealloc(map as *mut u8, Layout::new::<VeldMap>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{veld_int_new, veld_int_value, veld_string_from};

    #[test]
    fn test_set_get_overwrite() {
        let map = veld_map_new(0);
        let k = veld_string_from("answer");
        unsafe {
            veld_map_set(map, k as i64, veld_int_new(41));
            veld_map_set(map, k as i64, veld_int_new(42));
            assert_eq!(veld_map_len(map), 1);
            assert_eq!(veld_int_value(veld_map_get(map, k as i64)), 42);
            veld_obj_decref(k as i64);
            veld_obj_decref(map as i64);
        }
    }

    #[test]
    fn test_missing_key_is_null() {
        let map = veld_map_new(0);
        let k = veld_string_from("absent");
        unsafe {
            assert_eq!(veld_map_get(map, k as i64), 0);
            veld_obj_decref(k as i64);
            veld_obj_decref(map as i64);
        }
    }

    #[test]
    fn test_growth_keeps_all_entries() {
        let map = veld_map_new(0);
        let mut keys = Vec::new();
        unsafe {
            for i in 0..100 {
                let k = veld_string_from(&format!("key{}", i));
                veld_map_set(map, k as i64, veld_int_new(i));
                keys.push(k);
            }
            assert_eq!(veld_map_len(map), 100);
            assert!((*map).capacity > INITIAL_CAPACITY);
            for (i, k) in keys.iter().enumerate() {
                assert_eq!(veld_int_value(veld_map_get(map, *k as i64)), i as i64);
                veld_obj_decref(*k as i64);
            }
            veld_obj_decref(map as i64);
        }
    }

    #[test]
    fn test_table_order_iteration_sees_every_pair() {
        let map = veld_map_new(0);
        unsafe {
            for name in ["x", "alpha", "beta"] {
                let k = veld_string_from(name);
                veld_map_set(map, k as i64, veld_int_new(name.len() as i64));
                veld_obj_decref(k as i64);
            }
            // walk the table the way the argument marshaller does
            let mut seen = 0;
            for i in 0..(*map).capacity {
                let entry = (*map).entries.add(i);
                if (*entry).occupied {
                    seen += 1;
                }
            }
            assert_eq!(seen, 3);
            veld_obj_decref(map as i64);
        }
    }
}
