pub mod ffi;
pub mod interpreter;
pub mod lookup;
pub mod natives;
pub mod port;
pub mod process;
pub mod program;
pub mod session;
pub mod unwind;

use object::{Array, Boxed, Class, Coroutine, Function, Header, Initializer, ObjectType, Stack, Value};

/// The class descriptor word every heap object carries right after its
/// header.
///
/// # Safety
///
/// `value` must reference a valid, live heap object.
#[inline(always)]
pub unsafe fn class_of(value: Value) -> Value {
    *(value.ref_bits() as *const Value).add(1)
}

/// Trace all Value edges of a heap object for the GC.
///
/// Stack slots holding return addresses (marker values) are visited like
/// any other slot; the collector ignores non-references, and the functions
/// those addresses point into live in uncollected program space.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub unsafe fn trace_object(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
    let header = &*(obj as *const Header);
    // Every kind stores its class word right after the header.
    visitor(&mut *(obj as *mut Value).add(1));

    match header.object_type() {
        ObjectType::Instance => {
            let instance = obj as *mut object::Instance;
            let class_value = (*instance).class;
            if class_value.is_ref() {
                let class: &Class = class_value.as_ref();
                let fields = (obj as *mut Value).add(2);
                for i in 0..class.instance_fields() as usize {
                    visitor(&mut *fields.add(i));
                }
            }
        }
        ObjectType::Boxed => {
            let boxed = &mut *(obj as *mut Boxed);
            visitor(&mut boxed.value);
        }
        ObjectType::Array => {
            let array = &*(obj as *const Array);
            let elements = (obj as *mut Value).add(3);
            for i in 0..array.len() as usize {
                visitor(&mut *elements.add(i));
            }
        }
        ObjectType::Str | ObjectType::LargeInteger | ObjectType::Double => {
            // No reference fields beyond the class word.
        }
        ObjectType::Function => {
            let function = &mut *(obj as *mut Function);
            visitor(&mut function.catch_table);
            let pool =
                function.bytecode_address_for(function.constants_offset()) as *mut Value;
            for i in 0..function.constants_count() as usize {
                visitor(&mut *pool.add(i));
            }
        }
        ObjectType::Initializer => {
            let initializer = &mut *(obj as *mut Initializer);
            visitor(&mut initializer.function);
        }
        ObjectType::Class => {
            let class = &mut *(obj as *mut Class);
            visitor(&mut class.superclass);
            visitor(&mut class.methods);
        }
        ObjectType::Stack => {
            let stack = &*(obj as *const Stack);
            let slots = (obj as *mut Value).add(4);
            for i in 0..=stack.top() as usize {
                visitor(&mut *slots.add(i));
            }
        }
        ObjectType::Coroutine => {
            let coroutine = &mut *(obj as *mut Coroutine);
            visitor(&mut coroutine.stack);
            visitor(&mut coroutine.caller);
        }
    }
}
