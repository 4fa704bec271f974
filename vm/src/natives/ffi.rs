//! Foreign natives: symbol lookup, raw buffers, typed memory access and
//! integer calls through the C ABI.

use std::ffi::{c_void, CString};

use libffi::middle::{Arg, Cif, CodePtr, Type};
use object::{Class, Failure, Header, Instance, LargeInteger, ObjectType, Str, Value};

use crate::ffi::{errno, perform_foreign_lookup, ForeignFunctionInterface};
use crate::natives::Arguments;
use crate::port::Port;
use crate::process::Process;

extern "C" {
    fn calloc(count: usize, size: usize) -> *mut c_void;
    fn free(ptr: *mut c_void);
}

/// Integer view of a value at the native boundary: smi payload,
/// LargeInteger payload, or 0 for anything else.
pub fn as_foreign_word(value: Value) -> i64 {
    if value.is_smi() {
        // SAFETY: checked.
        return unsafe { value.to_i64() };
    }
    if value.is_ref() {
        // SAFETY: references carry headers.
        let header: &Header = unsafe { value.as_ref() };
        if header.object_type() == ObjectType::LargeInteger {
            // SAFETY: the header says LargeInteger.
            return unsafe { value.as_ref::<LargeInteger>() }.value;
        }
    }
    0
}

fn string_argument(value: Value) -> Option<CString> {
    if !value.is_ref() {
        return None;
    }
    // SAFETY: references carry headers.
    let header: &Header = unsafe { value.as_ref() };
    if header.object_type() != ObjectType::Str {
        return None;
    }
    // SAFETY: the header says Str.
    let text = unsafe { value.as_ref::<Str>().as_str() };
    CString::new(text).ok()
}

/// Resolve a symbol: the named library first (none names the running
/// binary), then the default-library list.
pub unsafe fn foreign_lookup(process: &mut Process, arguments: Arguments) -> Value {
    let Some(name) = string_argument(arguments.get(0)) else {
        return Failure::WRONG_ARGUMENT_TYPE;
    };
    let library = string_argument(arguments.get(1));

    let mut result = perform_foreign_lookup(library.as_deref(), &name);
    if result.is_null() {
        result = ForeignFunctionInterface::lookup_in_default_libraries(&name);
    }
    if result.is_null() {
        tracing::warn!(target: "ffi", symbol = ?name, "failed foreign lookup");
        return Failure::INDEX_OUT_OF_BOUNDS;
    }
    process.to_integer(result as i64)
}

pub unsafe fn foreign_allocate(process: &mut Process, arguments: Arguments) -> Value {
    let size = as_foreign_word(arguments.get(0));
    if size < 0 {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    let buffer = calloc(1, size as usize);
    process.to_integer(buffer as i64)
}

pub unsafe fn foreign_free(process: &mut Process, arguments: Arguments) -> Value {
    let address = as_foreign_word(arguments.get(0));
    free(address as *mut c_void);
    process.program().null_object()
}

pub unsafe fn foreign_mark_for_finalization(process: &mut Process, arguments: Arguments) -> Value {
    let foreign = arguments.get(0);
    if !foreign.is_ref() {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    process.register_finalizer(foreign, finalize_foreign);
    process.program().null_object()
}

/// Finalizer for instances wrapping a foreign buffer in field 0.
pub unsafe fn finalize_foreign(obj: Value) {
    let instance: &Instance = obj.as_ref();
    let address = as_foreign_word(instance.field(0));
    if address != 0 {
        free(address as *mut c_void);
    }
}

pub unsafe fn foreign_bits_per_word(_process: &mut Process, _arguments: Arguments) -> Value {
    Value::from_i64(usize::BITS as i64)
}

pub unsafe fn foreign_errno(_process: &mut Process, _arguments: Arguments) -> Value {
    Value::from_i64(errno() as i64)
}

pub unsafe fn foreign_platform(_process: &mut Process, _arguments: Arguments) -> Value {
    let os = if cfg!(target_os = "linux") {
        1
    } else if cfg!(target_os = "macos") {
        2
    } else {
        0
    };
    Value::from_i64(os)
}

/// Bump the refcount of the port wrapped by an instance of a port class
/// and answer its raw address; zero for anything else.
pub unsafe fn foreign_convert_port(process: &mut Process, arguments: Arguments) -> Value {
    let wrapper = arguments.get(0);
    if !wrapper.is_ref() {
        return Value::from_i64(0);
    }
    let header: &Header = wrapper.as_ref();
    if header.object_type() != ObjectType::Instance {
        return Value::from_i64(0);
    }
    let instance: &Instance = wrapper.as_ref();
    let class: &Class = instance.class.as_ref();
    if !class.is_port_class() {
        return Value::from_i64(0);
    }
    let address = as_foreign_word(instance.field(0));
    if address == 0 {
        return Value::from_i64(0);
    }
    let port = address as *mut Port;
    (*port).increment_ref();
    process.to_integer(address)
}

// ── calls by arity ─────────────────────────────────────────────────

unsafe fn foreign_call(process: &mut Process, address: i64, words: &[i64]) -> Value {
    let cif = Cif::new(words.iter().map(|_| Type::i64()), Type::i32());
    let args: Vec<Arg> = words.iter().map(Arg::new).collect();
    let result: i32 = cif.call(CodePtr(address as *mut c_void), &args);
    process.to_integer(result as i64)
}

macro_rules! foreign_call_arity {
    ($name:ident, $arity:expr) => {
        pub unsafe fn $name(process: &mut Process, arguments: Arguments) -> Value {
            let address = as_foreign_word(arguments.get(0));
            let mut words = [0i64; $arity];
            for (i, word) in words.iter_mut().enumerate() {
                *word = as_foreign_word(arguments.get(i + 1));
            }
            foreign_call(process, address, &words)
        }
    };
}

foreign_call_arity!(foreign_call0, 0);
foreign_call_arity!(foreign_call1, 1);
foreign_call_arity!(foreign_call2, 2);
foreign_call_arity!(foreign_call3, 3);
foreign_call_arity!(foreign_call4, 4);
foreign_call_arity!(foreign_call5, 5);
foreign_call_arity!(foreign_call6, 6);

// ── typed memory access ────────────────────────────────────────────

macro_rules! foreign_accessors {
    ($get:ident, $set:ident, $ty:ty) => {
        pub unsafe fn $get(process: &mut Process, arguments: Arguments) -> Value {
            let address = as_foreign_word(arguments.get(0)) as *const $ty;
            process.to_integer(address.read_unaligned() as i64)
        }

        pub unsafe fn $set(_process: &mut Process, arguments: Arguments) -> Value {
            let value = arguments.get(1);
            let address = as_foreign_word(arguments.get(0)) as *mut $ty;
            address.write_unaligned(as_foreign_word(value) as $ty);
            value
        }
    };
}

foreign_accessors!(foreign_get_int8, foreign_set_int8, i8);
foreign_accessors!(foreign_get_int16, foreign_set_int16, i16);
foreign_accessors!(foreign_get_int32, foreign_set_int32, i32);
foreign_accessors!(foreign_get_int64, foreign_set_int64, i64);
foreign_accessors!(foreign_get_uint8, foreign_set_uint8, u8);
foreign_accessors!(foreign_get_uint16, foreign_set_uint16, u16);
foreign_accessors!(foreign_get_uint32, foreign_set_uint32, u32);
foreign_accessors!(foreign_get_uint64, foreign_set_uint64, u64);
