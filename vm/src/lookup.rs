use object::{Array, Class, Value};

use crate::program::Program;

/// Entries in the per-process inline cache. `tag != 0` means the class
/// responds to the selector; a zero tag binds the no-such-method
/// trampoline so invokes and responds-tests share one resolution path.
#[derive(Clone, Copy)]
pub struct CacheEntry {
    pub class: Value,
    pub selector: u32,
    pub target: Value,
    pub tag: u32,
}

const CACHE_SIZE: usize = 512;

/// Direct-mapped cache from `(receiver class, selector)` to a resolved
/// target. Owned by the process; the engine takes it for the duration of
/// an `interpret` call.
///
/// Every value stored here lives in program space, so the cache needs no
/// GC tracing.
pub struct LookupCache {
    entries: Box<[CacheEntry; CACHE_SIZE]>,
}

impl LookupCache {
    pub fn new() -> Self {
        let empty = CacheEntry {
            class: Value::from_raw(0),
            selector: 0,
            target: Value::from_raw(0),
            tag: 0,
        };
        Self { entries: Box::new([empty; CACHE_SIZE]) }
    }

    #[inline(always)]
    fn index(class: Value, selector: u32) -> usize {
        let hash = (class.raw() >> 4) as u32 ^ selector;
        hash as usize & (CACHE_SIZE - 1)
    }

    pub fn lookup(&mut self, program: &Program, class: Value, selector: u32) -> CacheEntry {
        let entry = &mut self.entries[Self::index(class, selector)];
        if entry.class.raw() == class.raw() && entry.selector == selector {
            return *entry;
        }
        let (target, tag) = slow_lookup(program, class, selector);
        *entry = CacheEntry { class, selector, target, tag };
        *entry
    }

    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.class = Value::from_raw(0);
            entry.selector = 0;
        }
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the class chain's method arrays. Misses resolve to the
/// no-such-method trampoline with tag 0.
fn slow_lookup(program: &Program, class: Value, selector: u32) -> (Value, u32) {
    let selector_value = selector as i64;
    let mut current = class;
    while current.is_ref() {
        // SAFETY: class chains only contain Class objects.
        let class_ref: &Class = unsafe { current.as_ref() };
        let methods = class_ref.methods;
        if methods.is_ref() {
            // SAFETY: a class's methods field is an Array of
            // [selector, function] pairs.
            let array: &Array = unsafe { methods.as_ref() };
            let mut i = 0;
            while i + 1 < array.len() {
                let candidate = unsafe { array.get(i) };
                if candidate.is_smi() && unsafe { candidate.to_i64() } == selector_value {
                    return (unsafe { array.get(i + 1) }, 1);
                }
                i += 2;
            }
        }
        current = class_ref.superclass;
    }
    (program.nsm_trampoline(), 0)
}
