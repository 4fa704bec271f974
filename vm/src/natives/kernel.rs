use object::{Coroutine, Failure, Function, Header, Instance, ObjectType, Stack, Value};

use crate::natives::ffi::as_foreign_word;
use crate::natives::Arguments;
use crate::port::Port;
use crate::process::Process;

const COROUTINE_STACK_CAPACITY: u64 = 64;

/// Fixed-width integer addition for two smis. Anything else answers the
/// wrong-argument failure, which surfaces as a user-level exception at the
/// invoke site.
pub unsafe fn smi_add(process: &mut Process, arguments: Arguments) -> Value {
    let left = arguments.get(0);
    let right = arguments.get(1);
    if !left.is_smi() || !right.is_smi() {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    match left.to_i64().checked_add(right.to_i64()) {
        Some(sum) => process.to_integer(sum),
        None => Failure::WRONG_ARGUMENT_TYPE,
    }
}

/// Create a coroutine suspended at its body's first bytecode.
///
/// The body function must begin with a `CoroutineChange` opcode: the fresh
/// stack is shaped exactly like a stack suspended mid-switch, so the first
/// switch into the coroutine resumes past that opcode with the delivered
/// argument on top.
pub unsafe fn coroutine_new(process: &mut Process, arguments: Arguments) -> Value {
    let body = arguments.get(0);
    if !body.is_ref() {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    let header: &Header = body.as_ref();
    if header.object_type() != ObjectType::Function {
        return Failure::WRONG_ARGUMENT_TYPE;
    }

    let mut stack_value = process.new_stack(COROUTINE_STACK_CAPACITY);
    if stack_value.is_failure() {
        return stack_value;
    }
    let null = process.program().null_object();
    let function: &Function = body.as_ref();
    let stack: &mut Stack = stack_value.as_mut();
    stack.set(0, null);
    stack.set(1, null);
    stack.set(2, null);
    stack.set(3, Value::from_bytecode_address(function.bytecode_address_for(0)));
    stack.set_top(3);

    process.new_coroutine(stack_value)
}

/// The coroutine currently holding the process's stack.
pub unsafe fn coroutine_current(process: &mut Process, _arguments: Arguments) -> Value {
    process.coroutine()
}

/// Lock the port wrapped by the argument instance and hand its address to
/// the engine, which surrenders with TargetYield. The lock travels with
/// the surrender; the scheduler releases it after delivery.
pub unsafe fn port_send(_process: &mut Process, arguments: Arguments) -> Value {
    let wrapper = arguments.get(0);
    if !wrapper.is_ref() {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    let header: &Header = wrapper.as_ref();
    if header.object_type() != ObjectType::Instance {
        return Failure::WRONG_ARGUMENT_TYPE;
    }
    let instance: &Instance = wrapper.as_ref();
    let address = as_foreign_word(instance.field(0));
    if address == 0 {
        return Failure::ILLEGAL_STATE;
    }
    let port = address as *mut Port;
    (*port).lock();
    // The engine reinterprets this non-null word as the port address.
    Value::from_raw(port as u64)
}

/// True when a coroutine has unwound: stack slot cleared to null and
/// caller self-looped.
pub fn coroutine_is_done(program: &crate::program::Program, coroutine: Value) -> bool {
    if !coroutine.is_ref() {
        return false;
    }
    // SAFETY: callers pass Coroutine values.
    let coroutine_ref: &Coroutine = unsafe { coroutine.as_ref() };
    !coroutine_ref.has_caller() && coroutine_ref.stack.raw() == program.null_object().raw()
}
