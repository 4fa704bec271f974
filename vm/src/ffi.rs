//! Foreign-function lookup registry.
//!
//! A process-wide list of default shared libraries, consulted when a symbol
//! lookup does not name a library (or the named library misses). The
//! lifecycle is explicit: the embedder calls [`ForeignFunctionInterface::setup`]
//! before the first lookup and [`ForeignFunctionInterface::tear_down`] when
//! shutting down, which releases every installed name. `dlopen`/`dlclose`
//! pairs are balanced per lookup; no library stays open between calls.

use std::ffi::{c_char, c_void, CStr, CString};

use parking_lot::Mutex;

#[cfg(target_family = "unix")]
#[cfg_attr(target_os = "linux", link(name = "dl"))]
extern "C" {
    fn dlopen(filename: *const c_char, flag: i32) -> *mut c_void;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
    fn dlclose(handle: *mut c_void) -> i32;
}

#[cfg(target_os = "linux")]
extern "C" {
    fn __errno_location() -> *mut i32;
}

#[cfg(target_os = "macos")]
extern "C" {
    #[link_name = "__error"]
    fn __errno_location() -> *mut i32;
}

#[cfg(target_os = "macos")]
const RTLD_LOCAL: i32 = 0x4;
#[cfg(not(target_os = "macos"))]
const RTLD_LOCAL: i32 = 0;
const RTLD_LAZY: i32 = 0x1;

pub fn errno() -> i32 {
    unsafe { *__errno_location() }
}

pub fn set_errno(value: i32) {
    unsafe { *__errno_location() = value };
}

static LIBRARIES: Mutex<Option<Vec<CString>>> = Mutex::new(None);

pub struct ForeignFunctionInterface;

impl ForeignFunctionInterface {
    pub fn setup() {
        let mut libraries = LIBRARIES.lock();
        if libraries.is_none() {
            *libraries = Some(Vec::new());
        }
    }

    /// Release every installed library name.
    pub fn tear_down() {
        *LIBRARIES.lock() = None;
    }

    pub fn add_default_shared_library(library: &str) {
        let mut libraries = LIBRARIES.lock();
        if let Some(list) = libraries.as_mut() {
            if let Ok(name) = CString::new(library) {
                list.push(name);
            }
        }
    }

    pub fn installed_library_count() -> usize {
        LIBRARIES.lock().as_ref().map_or(0, Vec::len)
    }

    /// Try each default library in insertion order until one resolves
    /// `symbol`.
    pub fn lookup_in_default_libraries(symbol: &CStr) -> *mut c_void {
        let libraries = LIBRARIES.lock();
        if let Some(list) = libraries.as_ref() {
            for library in list {
                let result = perform_foreign_lookup(Some(library), symbol);
                if !result.is_null() {
                    return result;
                }
            }
        }
        std::ptr::null_mut()
    }
}

/// One balanced dlopen/dlsym/dlclose round. A `None` library opens the main
/// program's own handle.
pub fn perform_foreign_lookup(library: Option<&CStr>, name: &CStr) -> *mut c_void {
    let filename = library.map_or(std::ptr::null(), CStr::as_ptr);
    // SAFETY: both pointers are valid NUL-terminated strings (or null).
    unsafe {
        let handle = dlopen(filename, RTLD_LOCAL | RTLD_LAZY);
        if handle.is_null() {
            return std::ptr::null_mut();
        }
        let result = dlsym(handle, name.as_ptr());
        if dlclose(handle) != 0 {
            return std::ptr::null_mut();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lifecycle_releases_everything() {
        ForeignFunctionInterface::setup();
        ForeignFunctionInterface::add_default_shared_library("libfirst.so");
        ForeignFunctionInterface::add_default_shared_library("libsecond.so");
        assert_eq!(ForeignFunctionInterface::installed_library_count(), 2);

        ForeignFunctionInterface::tear_down();
        assert_eq!(ForeignFunctionInterface::installed_library_count(), 0);

        // Adding after teardown is a no-op, not a resurrection.
        ForeignFunctionInterface::add_default_shared_library("liblate.so");
        assert_eq!(ForeignFunctionInterface::installed_library_count(), 0);
    }

    #[test]
    fn lookup_in_own_binary() {
        // dlopen(NULL) opens the running binary, which links libc
        // dynamically; a libc symbol must resolve through it.
        let symbol = CString::new("malloc").unwrap();
        let address = perform_foreign_lookup(None, &symbol);
        assert!(!address.is_null());
    }

    #[test]
    fn missing_symbol_is_null() {
        let symbol = CString::new("no_such_symbol_in_any_library").unwrap();
        assert!(perform_foreign_lookup(None, &symbol).is_null());
    }

    #[test]
    fn errno_round_trip() {
        set_errno(0);
        assert_eq!(errno(), 0);
        set_errno(7);
        assert_eq!(errno(), 7);
        set_errno(0);
    }
}
