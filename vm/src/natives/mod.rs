use object::Value;

use crate::process::Process;

pub mod kernel;
pub mod ffi;

/// A native reads its arguments through the engine's stack pointer and
/// answers with a Value or a failure sentinel. It must not hold raw heap
/// pointers across its own allocation calls.
pub type NativeFn = unsafe fn(&mut Process, Arguments) -> Value;

/// Ascending view of a native's argument slots: `get(0)` is the first
/// pushed argument.
#[derive(Clone, Copy)]
pub struct Arguments {
    base: *const Value,
}

impl Arguments {
    pub fn new(base: *const Value) -> Self {
        Self { base }
    }

    /// # Safety
    ///
    /// `index` must be below the invoking bytecode's arity.
    #[inline(always)]
    pub unsafe fn get(self, index: usize) -> Value {
        *self.base.add(index)
    }
}

macro_rules! define_natives {
    ($(($variant:ident, $function:path)),* $(,)?) => {
        /// Index space of the `InvokeNative` operand.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Native {
            $($variant),*
        }

        impl Native {
            pub const COUNT: usize = [$(Native::$variant),*].len();
        }

        static TABLE: [NativeFn; Native::COUNT] = [$($function),*];
    };
}

define_natives! {
    (SmiAdd, kernel::smi_add),
    (CoroutineNew, kernel::coroutine_new),
    (CoroutineCurrent, kernel::coroutine_current),
    (PortSend, kernel::port_send),
    (ForeignLookup, ffi::foreign_lookup),
    (ForeignAllocate, ffi::foreign_allocate),
    (ForeignFree, ffi::foreign_free),
    (ForeignMarkForFinalization, ffi::foreign_mark_for_finalization),
    (ForeignBitsPerWord, ffi::foreign_bits_per_word),
    (ForeignErrno, ffi::foreign_errno),
    (ForeignPlatform, ffi::foreign_platform),
    (ForeignConvertPort, ffi::foreign_convert_port),
    (ForeignCall0, ffi::foreign_call0),
    (ForeignCall1, ffi::foreign_call1),
    (ForeignCall2, ffi::foreign_call2),
    (ForeignCall3, ffi::foreign_call3),
    (ForeignCall4, ffi::foreign_call4),
    (ForeignCall5, ffi::foreign_call5),
    (ForeignCall6, ffi::foreign_call6),
    (ForeignGetInt8, ffi::foreign_get_int8),
    (ForeignSetInt8, ffi::foreign_set_int8),
    (ForeignGetInt16, ffi::foreign_get_int16),
    (ForeignSetInt16, ffi::foreign_set_int16),
    (ForeignGetInt32, ffi::foreign_get_int32),
    (ForeignSetInt32, ffi::foreign_set_int32),
    (ForeignGetInt64, ffi::foreign_get_int64),
    (ForeignSetInt64, ffi::foreign_set_int64),
    (ForeignGetUint8, ffi::foreign_get_uint8),
    (ForeignSetUint8, ffi::foreign_set_uint8),
    (ForeignGetUint16, ffi::foreign_get_uint16),
    (ForeignSetUint16, ffi::foreign_set_uint16),
    (ForeignGetUint32, ffi::foreign_get_uint32),
    (ForeignSetUint32, ffi::foreign_set_uint32),
    (ForeignGetUint64, ffi::foreign_get_uint64),
    (ForeignSetUint64, ffi::foreign_set_uint64),
}

/// Dispatch an `InvokeNative` operand. An index outside the table is
/// corrupt bytecode.
///
/// # Safety
///
/// `arguments` must point at the invoke's first argument slot on the
/// current stack.
pub unsafe fn call(process: &mut Process, index: u8, arguments: Arguments) -> Value {
    let Some(native) = TABLE.get(index as usize) else {
        panic!("invalid native index {index}");
    };
    native(process, arguments)
}
