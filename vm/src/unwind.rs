//! Exception unwinding: the stack walker that finds a catch block and the
//! coroutine-crossing throw handler.

use object::{Array, Coroutine, Function, Header, Instance, ObjectType, Stack, Str, Value};

use crate::process::Process;

/// Outcome of a throw once the walker has run.
pub enum ThrowResult {
    /// Resume at `catch_bcp` after dropping `stack_delta` slots (counted
    /// on a stack that still includes the saved bytecode pointer).
    Caught { catch_bcp: *const u8, stack_delta: u64 },
    /// No handler anywhere and a debug session recorded the exception;
    /// the engine surrenders.
    Uncaught,
}

/// Walk handlers outward from the current frame, popping coroutines as
/// they fail to catch. Without a debug session an uncaught exception ends
/// the process.
pub fn handle_throw(process: &mut Process, exception: Value) -> ThrowResult {
    loop {
        if let Some((catch_bcp, stack_delta)) = compute_catch_block(process) {
            return ThrowResult::Caught { catch_bcp, stack_delta };
        }

        let current = process.coroutine();
        // SAFETY: the process always runs a live coroutine.
        let has_caller = unsafe { current.as_ref::<Coroutine>() }.has_caller();
        if !has_caller {
            tracing::error!(target: "unwind", "uncaught exception");
            eprintln!("Uncaught exception:");
            eprintln!("{}", format_value(exception));

            let program = process.program().clone();
            if program.has_debug_session() {
                program.record_uncaught_exception();
                return ThrowResult::Uncaught;
            }
            std::process::exit(1);
        }

        // SAFETY: as above.
        let caller = unsafe { current.as_ref::<Coroutine>() }.caller;
        process.unwind_to(caller);

        // Mark the coroutine that didn't catch as done and drop its stack
        // reference so the memory can be reclaimed.
        let null = process.program().null_object();
        // SAFETY: `current` is a live Coroutine no longer executing.
        unsafe {
            let mut value = current;
            let coroutine = value.as_mut::<Coroutine>();
            coroutine.stack = null;
            coroutine.caller = current;
        }
    }
}

/// One coroutine's worth of frame walking.
///
/// The slot at `top` holds the saved bytecode pointer; frame boundaries
/// below it are the marker-tagged return addresses, with the entry frame
/// bounded by the sentinel in slot 0. The throwing frame's pc sits on the
/// faulting opcode, so its ranges match `start <= pc < end`; resumed
/// frames hold return addresses one past their invoke, matching
/// `start < pc <= end`.
pub fn compute_catch_block(process: &Process) -> Option<(*const u8, u64)> {
    let stack_value = process.stack_value();
    // SAFETY: the current coroutine owns a live stack with saved state.
    let stack: &Stack = unsafe { stack_value.as_ref() };
    let program = process.program();

    let mut top = stack.top();
    let mut throwing_frame = true;
    loop {
        let saved = unsafe { stack.get(top) };
        if !saved.is_return_address() {
            return None;
        }
        // SAFETY: marker slots on a stack are encoded bytecode addresses.
        let pc = unsafe { saved.to_bytecode_address() };
        let function_ptr = program.function_from_bytecode_pointer(pc)?;
        // SAFETY: program-space functions are immortal.
        let function: &Function = unsafe { &*function_ptr };
        let offset = pc as usize - function.bytecode_address_for(0) as usize;

        // The frame boundary below: the nearest return address, or the
        // entry sentinel.
        let mut base = 0;
        let mut below = top;
        while below > 0 {
            below -= 1;
            if unsafe { stack.get(below) }.is_return_address() {
                base = below;
                break;
            }
        }

        if function.catch_table.is_ref() {
            // SAFETY: catch tables are Arrays of smi quadruples.
            let table: &Array = unsafe { function.catch_table.as_ref() };
            let mut i = 0;
            while i + 3 < table.len() {
                let start = unsafe { table.get(i).to_i64() } as usize;
                let end = unsafe { table.get(i + 1).to_i64() } as usize;
                let handler = unsafe { table.get(i + 2).to_i64() } as usize;
                let frame_slots = unsafe { table.get(i + 3).to_i64() } as u64;
                let covered = if throwing_frame {
                    start <= offset && offset < end
                } else {
                    start < offset && offset <= end
                };
                if covered {
                    let target = base + frame_slots;
                    debug_assert!(target < stack.top());
                    let stack_delta = stack.top() - target;
                    return Some((function.bytecode_address_for(handler), stack_delta));
                }
                i += 4;
            }
        }

        if base == 0 {
            return None;
        }
        top = base;
        throwing_frame = false;
    }
}

/// Human-readable rendering for uncaught-exception reports.
pub fn format_value(value: Value) -> String {
    if value.is_smi() {
        // SAFETY: checked.
        return unsafe { value.to_i64() }.to_string();
    }
    if value.is_ref() {
        // SAFETY: references carry headers.
        let header: &Header = unsafe { value.as_ref() };
        return match header.object_type() {
            // SAFETY: matching the header's kind below.
            ObjectType::Str => unsafe { value.as_ref::<Str>().as_str() }.to_string(),
            ObjectType::Double => unsafe { value.as_ref::<object::Double>() }.value.to_string(),
            ObjectType::LargeInteger => {
                unsafe { value.as_ref::<object::LargeInteger>() }.value.to_string()
            }
            ObjectType::Instance => {
                let instance: &Instance = unsafe { value.as_ref() };
                let class_id = if instance.class.is_ref() {
                    unsafe { instance.class.as_ref::<object::Class>() }.id()
                } else {
                    0
                };
                format!("instance of class {class_id}")
            }
            other => format!("{other:?}"),
        };
    }
    format!("{value:?}")
}
