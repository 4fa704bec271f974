//! The bytecode interpreter: a match-threaded dispatch loop over raw
//! `bcp`/`sp` registers.
//!
//! The two working pointers are cached in the [`Engine`] and flushed to
//! the stack object (`save_state`) around anything that can collect,
//! switch coroutines, enter a native that yields, or surrender — that
//! save/restore discipline is the only thing keeping the engine's state
//! visible to the collector and the stack walker.

use std::ptr::NonNull;
use std::sync::Arc;

use bytecode::Op;
use object::{
    Array, Boxed, Class, Double, Function, Header, Initializer, Instance, LargeInteger,
    ObjectType, Selector, SelectorKind, Stack, Value,
};

use crate::lookup::LookupCache;
use crate::natives::{self, Arguments};
use crate::port::Port;
use crate::process::Process;
use crate::program::Program;
use crate::unwind::{handle_throw, ThrowResult};
use crate::class_of;

/// Why the engine surrendered control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// A yield opcode ran; the scheduler may resume later.
    Yield,
    /// A native delivered to this port, returned locked.
    TargetYield(NonNull<Port>),
    /// A yield opcode ran with a true argument.
    Terminate,
    /// A stack-overflow request was refused.
    Interrupt,
    /// The debug info flagged this position; state is already saved.
    Breakpoint,
    /// The unwinder walked out of every coroutine.
    UncaughtException,
}

/// Run `process` until it surrenders. The lookup cache and the errno view
/// are private to the run: taken on entry, released on any surrender.
pub fn interpret(process: &mut Process) -> Interruption {
    process.restore_errno();
    let cache = process.take_lookup_cache();
    let mut engine = Engine::new(process, cache);
    let interruption = engine.run();
    let cache = engine.cache;
    process.release_lookup_cache(cache);
    process.store_errno();
    tracing::trace!(target: "interpreter", ?interruption, "surrendered");
    interruption
}

// Evaluate an allocating expression; on the retry-after-gc sentinel,
// collect and re-dispatch the same bytecode (bcp is untouched, so the
// `continue` re-enters the opcode with its operands still on the stack).
macro_rules! gc_retry {
    ($self:ident, $expr:expr) => {{
        let result = $expr;
        if result.is_retry_after_gc() {
            $self.collect_garbage();
            continue;
        }
        result
    }};
}

struct Engine<'a> {
    process: &'a mut Process,
    program: Arc<Program>,
    cache: Box<LookupCache>,
    /// Top-of-stack slot.
    sp: *mut Value,
    /// Next opcode byte.
    bcp: *const u8,
}

impl<'a> Engine<'a> {
    fn new(process: &'a mut Process, cache: Box<LookupCache>) -> Self {
        let program = process.program().clone();
        let mut engine = Engine {
            process,
            program,
            cache,
            sp: std::ptr::null_mut(),
            bcp: std::ptr::null(),
        };
        engine.restore_state();
        engine
    }

    // ── save/restore discipline ────────────────────────────────────

    fn save_state(&mut self) {
        self.push(Value::from_bytecode_address(self.bcp));
        let mut stack_value = self.process.stack_value();
        // SAFETY: the current coroutine owns a live stack; sp points into
        // it.
        unsafe { stack_value.as_mut::<Stack>().set_top_from_pointer(self.sp) };
    }

    fn restore_state(&mut self) {
        let stack_value = self.process.stack_value();
        // SAFETY: a suspended stack always has the saved bytecode pointer
        // on top.
        unsafe {
            let stack: &Stack = stack_value.as_ref();
            self.sp = stack.slot_pointer(stack.top());
            let saved = *self.sp;
            self.sp = self.sp.sub(1);
            self.bcp = saved.to_bytecode_address();
        }
    }

    // ── bytecode pointer ───────────────────────────────────────────

    #[inline(always)]
    fn read_byte(&self, offset: usize) -> u8 {
        // SAFETY: bcp points at a valid opcode with its operands.
        unsafe { *self.bcp.add(offset) }
    }

    #[inline(always)]
    fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: as above; operands are read in host byte order.
        unsafe { (self.bcp.add(offset) as *const u32).read_unaligned() }
    }

    #[inline(always)]
    fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    /// The constant word an `Unfold` opcode embeds via a byte delta from
    /// its own address.
    #[inline(always)]
    fn read_constant(&self) -> Value {
        let delta = self.read_i32(1) as isize;
        // SAFETY: unfold deltas land inside the function's constant
        // section.
        unsafe { (self.bcp.offset(delta) as *const Value).read_unaligned() }
    }

    #[inline(always)]
    fn advance(&mut self, delta: isize) {
        self.bcp = self.bcp.wrapping_offset(delta);
    }

    #[inline(always)]
    fn goto(&mut self, bcp: *const u8) {
        debug_assert!(!bcp.is_null());
        self.bcp = bcp;
    }

    fn goto_function(&mut self, target: Value) {
        // SAFETY: dispatch only resolves to Function objects.
        let function: &Function = unsafe { target.as_ref() };
        self.goto(function.bytecode_address_for(0));
    }

    // ── stack pointer ──────────────────────────────────────────────

    #[inline(always)]
    fn set_top(&mut self, value: Value) {
        self.set_local(0, value);
    }

    #[inline(always)]
    fn local(&self, n: usize) -> Value {
        // SAFETY: the compiler guarantees operand depth.
        unsafe { *self.sp.sub(n) }
    }

    #[inline(always)]
    fn set_local(&mut self, n: usize, value: Value) {
        // SAFETY: as above.
        unsafe { *self.sp.sub(n) = value };
    }

    #[inline(always)]
    fn local_pointer(&self, n: usize) -> *const Value {
        self.sp.wrapping_sub(n)
    }

    #[inline(always)]
    fn push(&mut self, value: Value) {
        // SAFETY: overflow polls keep a margin above sp.
        unsafe {
            self.sp = self.sp.add(1);
            *self.sp = value;
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        // SAFETY: the compiler guarantees operand depth.
        unsafe {
            let value = *self.sp;
            self.sp = self.sp.sub(1);
            value
        }
    }

    #[inline(always)]
    fn drop_slots(&mut self, n: usize) {
        self.sp = self.sp.wrapping_sub(n);
    }

    fn push_return_address(&mut self, opcode_length: usize) {
        let resume = self.bcp.wrapping_add(opcode_length);
        self.push(Value::from_bytecode_address(resume));
    }

    fn pop_return_address(&mut self) {
        let saved = self.pop();
        // SAFETY: the frame protocol puts the return address here.
        self.bcp = unsafe { saved.to_bytecode_address() };
    }

    fn has_stack_space_for(&self, slots: usize) -> bool {
        let needed = self.sp as usize + slots * size_of::<Value>();
        needed < self.process.stack_limit() as usize
    }

    // ── helpers ────────────────────────────────────────────────────

    fn to_bool(&self, value: bool) -> Value {
        if value {
            self.program.true_object()
        } else {
            self.program.false_object()
        }
    }

    fn receiver_class(&self, receiver: Value) -> Value {
        if receiver.is_smi() {
            self.program.smi_class()
        } else {
            // SAFETY: stack operands are smis or live references.
            unsafe { class_of(receiver) }
        }
    }

    fn receiver_class_id(&self, receiver: Value) -> i64 {
        let class = self.receiver_class(receiver);
        // SAFETY: class words reference Class objects.
        unsafe { class.as_ref::<Class>() }.id() as i64
    }

    fn collect_garbage(&mut self) {
        // Flush bcp so the collector can traverse this frame.
        self.save_state();
        self.process.collect_garbage();
        self.restore_state();
    }

    /// Post-call poll. False means the process refused to grow and the
    /// engine must surrender with Interrupt.
    fn stack_overflow_check(&mut self, slots: usize) -> bool {
        if self.has_stack_space_for(slots) {
            return true;
        }
        self.save_state();
        if !self.process.handle_stack_overflow(slots) {
            return false;
        }
        self.restore_state();
        true
    }

    fn branch(&mut self, true_offset: isize, false_offset: isize) {
        let condition = self.pop();
        let offset = if condition.raw() == self.program.true_object().raw() {
            true_offset
        } else {
            false_offset
        };
        self.advance(offset);
    }

    fn push_delta(&mut self, delta: i64) {
        self.push(Value::from_i64(delta));
    }

    fn pop_delta(&mut self) -> i64 {
        let delta = self.pop();
        debug_assert!(delta.is_smi());
        // SAFETY: subroutine deltas are pushed as smis.
        unsafe { delta.to_i64() }
    }

    fn handle_identical(&self, left: Value, right: Value) -> Value {
        let identical = if left.is_ref() && right.is_ref() {
            // SAFETY: operands reference live objects.
            let left_header: &Header = unsafe { left.as_ref() };
            let right_header: &Header = unsafe { right.as_ref() };
            match (left_header.object_type(), right_header.object_type()) {
                (ObjectType::Double, ObjectType::Double) => {
                    let a = unsafe { left.as_ref::<Double>() }.value;
                    let b = unsafe { right.as_ref::<Double>() }.value;
                    if a.is_nan() && b.is_nan() {
                        true
                    } else {
                        a == b
                    }
                }
                (ObjectType::LargeInteger, ObjectType::LargeInteger) => {
                    let a = unsafe { left.as_ref::<LargeInteger>() }.value;
                    let b = unsafe { right.as_ref::<LargeInteger>() }.value;
                    a == b
                }
                _ => left.raw() == right.raw(),
            }
        } else {
            left.raw() == right.raw()
        };
        self.to_bool(identical)
    }

    fn should_break(&mut self) -> bool {
        let bcp = self.bcp;
        let hit = match self.process.debug_info_mut() {
            Some(info) if info.should_break(bcp) => {
                info.set_at_breakpoint();
                true
            }
            _ => false,
        };
        if hit {
            self.save_state();
        }
        hit
    }

    fn resuming_at_breakpoint(&mut self) -> bool {
        self.process.debug_info_mut().map_or(false, |info| info.take_at_breakpoint())
    }

    // ── the dispatch loop ──────────────────────────────────────────

    fn run(&mut self) -> Interruption {
        // Skip the gate once when resuming at the breakpoint that paused
        // us.
        let mut check_break = !self.resuming_at_breakpoint();

        loop {
            if check_break && self.should_break() {
                return Interruption::Breakpoint;
            }
            check_break = true;

            let opcode = self.read_byte(0);
            if opcode as usize >= Op::COUNT {
                panic!("failed to interpret: bad bytecode (opcode = {opcode})");
            }
            // SAFETY: bounds-checked above.
            let op = unsafe { Op::from_u8_unchecked(opcode) };

            match op {
                Op::LoadLocal0 => {
                    let value = self.local(0);
                    self.push(value);
                    self.advance(1);
                }

                Op::LoadLocal1 => {
                    let value = self.local(1);
                    self.push(value);
                    self.advance(1);
                }

                Op::LoadLocal2 => {
                    let value = self.local(2);
                    self.push(value);
                    self.advance(1);
                }

                Op::LoadLocal => {
                    let value = self.local(self.read_byte(1) as usize);
                    self.push(value);
                    self.advance(2);
                }

                Op::LoadBoxed => {
                    let cell = self.local(self.read_byte(1) as usize);
                    // SAFETY: LoadBoxed operands are Boxed cells.
                    let value = unsafe { cell.as_ref::<Boxed>() }.value;
                    self.push(value);
                    self.advance(2);
                }

                Op::LoadStatic => {
                    let index = self.read_u32(1) as u64;
                    let statics_value = self.process.statics();
                    // SAFETY: the statics array is a live Array.
                    let value = unsafe { statics_value.as_ref::<Array>().get(index) };
                    self.push(value);
                    self.advance(5);
                }

                Op::LoadStaticInit => {
                    let index = self.read_u32(1) as u64;
                    let statics_value = self.process.statics();
                    // SAFETY: the statics array is a live Array.
                    let value = unsafe { statics_value.as_ref::<Array>().get(index) };
                    let initializer = value.is_ref() && {
                        // SAFETY: references carry headers.
                        let header: &Header = unsafe { value.as_ref() };
                        header.object_type() == ObjectType::Initializer
                    };
                    if initializer {
                        // SAFETY: checked above.
                        let target = unsafe { value.as_ref::<Initializer>() }.function;
                        self.push_return_address(Op::LoadStaticInit.length());
                        self.goto_function(target);
                        if !self.stack_overflow_check(0) {
                            return Interruption::Interrupt;
                        }
                    } else {
                        self.push(value);
                        self.advance(5);
                    }
                }

                Op::LoadField => {
                    let target = self.pop();
                    // SAFETY: LoadField operands are Instances.
                    let value =
                        unsafe { target.as_ref::<Instance>().field(self.read_byte(1) as usize) };
                    self.push(value);
                    self.advance(2);
                }

                Op::LoadConst => {
                    let index = self.read_u32(1) as usize;
                    let value = self.program.constant_at(index);
                    self.push(value);
                    self.advance(5);
                }

                Op::LoadConstUnfold => {
                    let value = self.read_constant();
                    self.push(value);
                    self.advance(5);
                }

                Op::StoreLocal => {
                    let value = self.local(0);
                    self.set_local(self.read_byte(1) as usize, value);
                    self.advance(2);
                }

                Op::StoreBoxed => {
                    let value = self.local(0);
                    let mut cell = self.local(self.read_byte(1) as usize);
                    // SAFETY: StoreBoxed operands are Boxed cells.
                    unsafe { cell.as_mut::<Boxed>() }.value = value;
                    self.advance(2);
                }

                Op::StoreStatic => {
                    let index = self.read_u32(1) as u64;
                    let value = self.local(0);
                    let mut statics_value = self.process.statics();
                    // SAFETY: the statics array is a live Array.
                    unsafe { statics_value.as_mut::<Array>().set(index, value) };
                    self.advance(5);
                }

                Op::StoreField => {
                    let value = self.pop();
                    let mut target = self.pop();
                    // SAFETY: StoreField operands are Instances.
                    unsafe {
                        target.as_mut::<Instance>().set_field(self.read_byte(1) as usize, value)
                    };
                    self.push(value);
                    self.advance(2);
                }

                Op::LoadLiteralNull => {
                    let null = self.program.null_object();
                    self.push(null);
                    self.advance(1);
                }

                Op::LoadLiteralTrue => {
                    let value = self.program.true_object();
                    self.push(value);
                    self.advance(1);
                }

                Op::LoadLiteralFalse => {
                    let value = self.program.false_object();
                    self.push(value);
                    self.advance(1);
                }

                Op::LoadLiteral0 => {
                    self.push(Value::from_i64(0));
                    self.advance(1);
                }

                Op::LoadLiteral1 => {
                    self.push(Value::from_i64(1));
                    self.advance(1);
                }

                Op::LoadLiteral => {
                    self.push(Value::from_i64(self.read_byte(1) as i64));
                    self.advance(2);
                }

                Op::LoadLiteralWide => {
                    self.push(Value::from_i64(self.read_i32(1) as i64));
                    self.advance(5);
                }

                Op::InvokeStatic | Op::InvokeFactory => {
                    let index = self.read_u32(1) as usize;
                    let target = self.program.static_method_at(index);
                    self.push_return_address(op.length());
                    self.goto_function(target);
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                }

                Op::InvokeStaticUnfold | Op::InvokeFactoryUnfold => {
                    let target = self.read_constant();
                    self.push_return_address(op.length());
                    self.goto_function(target);
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                }

                Op::InvokeNative => {
                    let arity = self.read_byte(1) as usize;
                    let native = self.read_byte(2);
                    let arguments = Arguments::new(self.local_pointer(arity));
                    // SAFETY: arguments point at this invoke's argument
                    // slots.
                    let result =
                        gc_retry!(self, unsafe { natives::call(self.process, native, arguments) });
                    if result.is_failure() {
                        let wrapped = self.program.object_from_failure(result);
                        self.push(wrapped);
                        self.advance(3);
                    } else {
                        self.pop_return_address();
                        self.drop_slots(arity);
                        self.push(result);
                    }
                }

                Op::InvokeNativeYield => {
                    let arity = self.read_byte(1) as usize;
                    let native = self.read_byte(2);
                    let arguments = Arguments::new(self.local_pointer(arity));
                    // SAFETY: arguments point at this invoke's argument
                    // slots.
                    let result =
                        gc_retry!(self, unsafe { natives::call(self.process, native, arguments) });
                    if result.is_failure() {
                        let wrapped = self.program.object_from_failure(result);
                        self.push(wrapped);
                        self.advance(3);
                    } else {
                        self.pop_return_address();
                        self.drop_slots(arity);
                        let null = self.program.null_object();
                        self.push(null);
                        if result.raw() != null.raw() {
                            self.save_state();
                            // The native answered a locked port address.
                            let port = result.raw() as *mut Port;
                            // SAFETY: the target-yield contract.
                            unsafe {
                                debug_assert!((*port).is_locked());
                                return Interruption::TargetYield(NonNull::new_unchecked(port));
                            }
                        }
                    }
                }

                Op::InvokeTest => {
                    let selector = self.read_u32(1);
                    let receiver = self.local(0);
                    let class = self.receiver_class(receiver);
                    let entry = self.cache.lookup(&self.program, class, selector);
                    let responds = self.to_bool(entry.tag != 0);
                    self.set_top(responds);
                    self.advance(5);
                }

                Op::InvokeTestFast => {
                    let index = self.read_u32(1) as u64;
                    let table_value = self.program.dispatch_table();
                    // SAFETY: the dispatch table is a live Array.
                    let table: &Array = unsafe { table_value.as_ref() };
                    let receiver = self.local(0);
                    let class_id = self.receiver_class_id(receiver);

                    let mut offset = 4;
                    loop {
                        // SAFETY: range rows are smi pairs; a terminal
                        // catch-all row always matches.
                        let lower = unsafe { table.get(index + offset).to_i64() };
                        if class_id < lower {
                            offset += 4;
                            continue;
                        }
                        let upper = unsafe { table.get(index + offset + 1).to_i64() };
                        if class_id >= upper {
                            offset += 4;
                            continue;
                        }
                        let responds = self.to_bool(upper != Value::MAX_SMI);
                        self.set_top(responds);
                        break;
                    }
                    self.advance(5);
                }

                Op::InvokeTestVtable => {
                    let selector = self.read_u32(1);
                    let offset = Selector::id(selector) as i64;
                    let receiver = self.local(0);
                    let class_id = self.receiver_class_id(receiver);

                    let vtable_value = self.program.vtable();
                    // SAFETY: the vtable is a live Array of entry Arrays.
                    let entry = unsafe {
                        let vtable: &Array = vtable_value.as_ref();
                        vtable.get((class_id + offset) as u64)
                    };
                    let stored = unsafe { entry.as_ref::<Array>().get(0).to_i64() };
                    let responds = self.to_bool(stored == offset);
                    self.set_top(responds);
                    self.advance(5);
                }

                Op::Pop => {
                    self.drop_slots(1);
                    self.advance(1);
                }

                Op::Return => {
                    let locals = self.read_byte(1) as usize;
                    let arguments = self.read_byte(2) as usize;
                    let result = self.local(0);
                    self.drop_slots(locals);
                    self.pop_return_address();
                    self.drop_slots(arguments);
                    self.push(result);
                }

                Op::BranchLong => {
                    let delta = self.read_i32(1) as isize;
                    self.advance(delta);
                }

                Op::BranchIfTrueLong => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(delta, Op::BranchIfTrueLong.length() as isize);
                }

                Op::BranchIfFalseLong => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(Op::BranchIfFalseLong.length() as isize, delta);
                }

                Op::BranchBack => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = self.read_byte(1) as isize;
                    self.advance(-delta);
                }

                Op::BranchBackIfTrue => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = -(self.read_byte(1) as isize);
                    self.branch(delta, Op::BranchBackIfTrue.length() as isize);
                }

                Op::BranchBackIfFalse => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = -(self.read_byte(1) as isize);
                    self.branch(Op::BranchBackIfFalse.length() as isize, delta);
                }

                Op::BranchBackLong => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = self.read_i32(1) as isize;
                    self.advance(-delta);
                }

                Op::BranchBackIfTrueLong => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(delta, Op::BranchBackIfTrueLong.length() as isize);
                }

                Op::BranchBackIfFalseLong => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(Op::BranchBackIfFalseLong.length() as isize, delta);
                }

                Op::PopAndBranchLong => {
                    let pop_count = self.read_byte(1) as usize;
                    let delta = self.read_i32(2) as isize;
                    self.drop_slots(pop_count);
                    self.advance(delta);
                }

                Op::PopAndBranchBackLong => {
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                    let pop_count = self.read_byte(1) as usize;
                    let delta = self.read_i32(2) as isize;
                    self.drop_slots(pop_count);
                    self.advance(-delta);
                }

                Op::Allocate | Op::AllocateUnfold => {
                    let class = if op == Op::Allocate {
                        self.program.class_at(self.read_u32(1) as usize)
                    } else {
                        self.read_constant()
                    };
                    let result = gc_retry!(self, self.process.new_instance(class, false));
                    // SAFETY: a non-failure result is a fresh Instance.
                    let fields = unsafe { class.as_ref::<Class>() }.instance_fields() as usize;
                    let mut instance = result;
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        unsafe { instance.as_mut::<Instance>().set_field(i, value) };
                    }
                    self.push(instance);
                    self.advance(5);
                }

                Op::AllocateImmutable | Op::AllocateImmutableUnfold => {
                    let class = if op == Op::AllocateImmutable {
                        self.program.class_at(self.read_u32(1) as usize)
                    } else {
                        self.read_constant()
                    };
                    // SAFETY: Allocate operands name Class objects.
                    let fields = unsafe { class.as_ref::<Class>() }.instance_fields() as usize;
                    let mut immutable = true;
                    for i in 0..fields {
                        if !object::is_immutable(self.local(i)) {
                            immutable = false;
                            break;
                        }
                    }
                    let result = gc_retry!(self, self.process.new_instance(class, immutable));
                    let mut instance = result;
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        // SAFETY: a non-failure result is a fresh Instance.
                        unsafe { instance.as_mut::<Instance>().set_field(i, value) };
                    }
                    self.push(instance);
                    self.advance(5);
                }

                Op::AllocateBoxed => {
                    let value = self.local(0);
                    let boxed = gc_retry!(self, self.process.new_boxed(value));
                    self.set_top(boxed);
                    self.advance(1);
                }

                Op::Negate => {
                    let condition = self.local(0);
                    if condition.raw() == self.program.true_object().raw() {
                        let value = self.program.false_object();
                        self.set_top(value);
                    } else if condition.raw() == self.program.false_object().raw() {
                        let value = self.program.true_object();
                        self.set_top(value);
                    } else {
                        panic!("Negate on a non-boolean operand");
                    }
                    self.advance(1);
                }

                Op::StackOverflowCheck => {
                    let size = self.read_u32(1) as usize;
                    if !self.stack_overflow_check(size) {
                        return Interruption::Interrupt;
                    }
                    self.advance(5);
                }

                Op::Throw => {
                    // The walker does not allocate, so holding the
                    // exception across it is safe.
                    let exception = self.local(0);
                    self.save_state();
                    match handle_throw(self.process, exception) {
                        ThrowResult::Caught { catch_bcp, stack_delta } => {
                            self.restore_state();
                            self.goto(catch_bcp);
                            // The delta counts the saved bcp, which
                            // restore_state already popped.
                            self.drop_slots(stack_delta as usize - 1);
                            self.set_top(exception);
                        }
                        ThrowResult::Uncaught => return Interruption::UncaughtException,
                    }
                }

                Op::SubroutineCall => {
                    let delta = self.read_i32(1) as isize;
                    let return_delta = self.read_i32(5) as i64;
                    self.push_delta(return_delta);
                    self.advance(delta);
                }

                Op::SubroutineReturn => {
                    let delta = self.pop_delta() as isize;
                    self.advance(-delta);
                }

                Op::ProcessYield => {
                    let value = self.local(0);
                    let null = self.program.null_object();
                    self.set_top(null);
                    self.advance(1);
                    self.save_state();
                    let terminated = value.raw() == self.program.true_object().raw();
                    return if terminated { Interruption::Terminate } else { Interruption::Yield };
                }

                Op::CoroutineChange => {
                    let argument = self.local(0);
                    let null = self.program.null_object();
                    self.set_local(0, null);
                    let coroutine = self.local(1);
                    self.set_local(1, null);

                    self.save_state();
                    self.process.update_coroutine(coroutine);
                    self.restore_state();

                    self.advance(1);
                    self.drop_slots(1);
                    self.set_top(argument);
                }

                Op::Identical => {
                    let result = self.handle_identical(self.local(1), self.local(0));
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }

                Op::IdenticalNonNumeric => {
                    let identical = self.local(0).raw() == self.local(1).raw();
                    let result = self.to_bool(identical);
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }

                Op::EnterNoSuchMethod => {
                    // SAFETY: the trampoline is entered like a method, so
                    // Local(0) is the failing invoke's return address.
                    let return_address = unsafe { self.local(0).to_bytecode_address() };
                    // Every invoke is five bytes: tag + 32-bit operand.
                    let invoke = Op::try_from(unsafe { *return_address.sub(5) })
                        .unwrap_or_else(|byte| panic!("bad invoke at nsm entry: {byte}"));
                    let operand = unsafe {
                        (return_address.sub(4) as *const u32).read_unaligned()
                    };

                    let selector = if invoke.is_invoke_fast() {
                        let table_value = self.program.dispatch_table();
                        // SAFETY: the dispatch table is a live Array.
                        let table: &Array = unsafe { table_value.as_ref() };
                        (unsafe { table.get(operand as u64 + 1).to_i64() }) as u32
                    } else {
                        // Vtable invokes keep their operand: the id field
                        // holds the table offset rather than the method id.
                        debug_assert!(invoke.is_invoke_vtable() || invoke.is_invoke_normal());
                        operand
                    };

                    let arity = Selector::arity(selector) as usize;
                    let selector_smi = Value::from_i64(selector as i64);
                    let receiver = self.local(arity + 1);

                    self.push(selector_smi);
                    self.push(receiver);
                    self.push(selector_smi);
                    self.advance(1);
                }

                Op::ExitNoSuchMethod => {
                    let mut result = self.pop();
                    let selector_smi = self.pop();
                    debug_assert!(selector_smi.is_smi());
                    // SAFETY: EnterNoSuchMethod pushed this smi.
                    let selector = unsafe { selector_smi.to_i64() } as u32;
                    self.pop_return_address();

                    // The result of invoking setters must be the assigned
                    // value, even through noSuchMethod.
                    if Selector::kind(selector) == SelectorKind::Setter {
                        result = self.local(0);
                    }

                    let arity = Selector::arity(selector) as usize;
                    self.drop_slots(arity + 1);
                    self.push(result);
                }

                Op::FrameSize => {
                    self.advance(2);
                }

                Op::MethodEnd => {
                    panic!("cannot interpret method-end bytecodes");
                }

                // Cache-dispatched invokes, including the builtin
                // selector aliases.
                op if op.is_invoke_normal() => {
                    let selector = self.read_u32(1);
                    let arity = Selector::arity(selector) as usize;
                    let receiver = self.local(arity);
                    self.push_return_address(op.length());
                    let class = self.receiver_class(receiver);
                    let entry = self.cache.lookup(&self.program, class, selector);
                    self.goto_function(entry.target);
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                }

                // Linear class-id range scan over the dispatch table.
                op if op.is_invoke_fast() => {
                    let index = self.read_u32(1) as u64;
                    let table_value = self.program.dispatch_table();
                    // SAFETY: the dispatch table is a live Array.
                    let table: &Array = unsafe { table_value.as_ref() };
                    let selector = unsafe { table.get(index + 1).to_i64() } as u32;
                    let arity = Selector::arity(selector) as usize;
                    let receiver = self.local(arity);
                    self.push_return_address(op.length());

                    let class_id = self.receiver_class_id(receiver);
                    let target;
                    let mut offset = 4;
                    loop {
                        // SAFETY: range rows are smi pairs; a terminal
                        // catch-all row always matches.
                        let lower = unsafe { table.get(index + offset).to_i64() };
                        if class_id < lower {
                            offset += 4;
                            continue;
                        }
                        let upper = unsafe { table.get(index + offset + 1).to_i64() };
                        if class_id >= upper {
                            offset += 4;
                            continue;
                        }
                        target = unsafe { table.get(index + offset + 3) };
                        break;
                    }

                    self.goto_function(target);
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                }

                // Vtable offset dispatch with a catch-all fallback.
                op if op.is_invoke_vtable() => {
                    let selector = self.read_u32(1);
                    let arity = Selector::arity(selector) as usize;
                    let offset = Selector::id(selector) as i64;
                    let receiver = self.local(arity);
                    self.push_return_address(op.length());

                    let class_id = self.receiver_class_id(receiver);
                    let vtable_value = self.program.vtable();
                    // SAFETY: the vtable is a live Array of entry Arrays.
                    let target = unsafe {
                        let vtable: &Array = vtable_value.as_ref();
                        let mut entry = vtable.get((class_id + offset) as u64);
                        if entry.as_ref::<Array>().get(0).to_i64() != offset {
                            entry = vtable.get(0);
                        }
                        entry.as_ref::<Array>().get(2)
                    };

                    self.goto_function(target);
                    if !self.stack_overflow_check(0) {
                        return Interruption::Interrupt;
                    }
                }

                op => panic!("unhandled opcode {op:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natives::kernel::coroutine_is_done;
    use crate::natives::Native;
    use crate::program::{unfold_delta, CatchRange, ProgramBuilder};
    use crate::session::Session;
    use bytecode::BytecodeBuilder;
    use object::{ClassFlags, Coroutine};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    const HEAP_LIMIT: usize = 256 * 1024;

    fn finish_entry(b: &mut BytecodeBuilder) {
        b.load_literal_true();
        b.process_yield();
        b.method_end();
    }

    fn spawn(builder: ProgramBuilder, entry: Value) -> Process {
        let program = builder.finish();
        let mut process = Process::new(program, HEAP_LIMIT);
        process.setup_entry(entry);
        process
    }

    fn stack_slots(process: &Process) -> Vec<Value> {
        let stack_value = process.stack_value();
        let stack: &Stack = unsafe { stack_value.as_ref() };
        (0..=stack.top()).map(|i| unsafe { stack.get(i) }).collect()
    }

    fn smi(value: Value) -> i64 {
        assert!(value.is_smi(), "expected smi, got {value:?}");
        unsafe { value.to_i64() }
    }

    fn class_id_of(class: Value) -> u32 {
        unsafe { class.as_ref::<Class>() }.id()
    }

    fn native_wrapper(builder: &mut ProgramBuilder, arity: u8, native: Native) -> Value {
        let mut b = BytecodeBuilder::new();
        b.invoke_native(arity, native as u8);
        b.throw();
        b.method_end();
        builder.add_function(arity as u32, b.as_bytes(), &[], &[])
    }

    fn install_smi_add(builder: &mut ProgramBuilder) -> u32 {
        let selector = Selector::encode(100, SelectorKind::Method, 1);
        let add = native_wrapper(builder, 2, Native::SmiAdd);
        let smi_class = builder.builtin_class(crate::program::BuiltinClass::Smi);
        builder.set_class_methods(smi_class, &[(selector, add)]);
        selector
    }

    // S1: compiled `return 2+3` terminates with the result on the stack.
    #[test]
    fn arithmetic_return_terminates() {
        let mut builder = ProgramBuilder::new();
        let selector = install_smi_add(&mut builder);
        let mut b = BytecodeBuilder::new();
        b.load_literal(2);
        b.load_literal(3);
        b.invoke_method(selector);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 5);
        assert_eq!(slots[2].raw(), process.program().null_object().raw());
    }

    // S2: an exhausted heap triggers exactly one collection and the same
    // bytecode re-dispatches with its operands intact.
    #[test]
    fn allocation_retries_after_one_collection() {
        let mut builder = ProgramBuilder::new();
        let class = builder.add_class(2, ClassFlags::NONE, Value::from_raw(0));
        let class_id = class_id_of(class);
        let mut b = BytecodeBuilder::new();
        b.load_literal(7);
        b.load_literal(8);
        b.allocate(class_id);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        let used = process.heap().bytes_allocated();
        process.heap_mut().set_limit(used + 8);

        assert_eq!(interpret(&mut process), Interruption::Terminate);
        assert_eq!(process.collections(), 1);

        let slots = stack_slots(&process);
        let instance: &Instance = unsafe { slots[1].as_ref() };
        assert_eq!(smi(unsafe { instance.field(0) }), 7);
        assert_eq!(smi(unsafe { instance.field(1) }), 8);
    }

    // S3: all three invoke strategies resolve the same call site to the
    // same method, and the responds-tests agree.
    #[test]
    fn dispatch_strategies_agree() {
        let mut builder = ProgramBuilder::new();
        let foo_id = 7u32;
        let selector = Selector::encode(foo_id, SelectorKind::Method, 0);
        let class = builder.add_class(0, ClassFlags::NONE, Value::from_raw(0));
        let class_id = class_id_of(class) as i64;

        let mut fb = BytecodeBuilder::new();
        fb.load_literal(42);
        fb.ret(1, 1);
        fb.method_end();
        let foo = builder.add_function(0, fb.as_bytes(), &[], &[]);
        builder.set_class_methods(class, &[(selector, foo)]);

        let receiver = builder.new_instance(class, &[], false);
        let receiver_idx = builder.add_constant(receiver);

        let null = Value::from_raw(0);
        let nsm = builder.nsm_trampoline();
        let table = builder.new_array(&[
            null,
            Value::from_i64(selector as i64),
            null,
            null,
            Value::from_i64(class_id),
            Value::from_i64(class_id + 1),
            null,
            foo,
            Value::from_i64(0),
            Value::from_i64(Value::MAX_SMI),
            null,
            nsm,
        ]);
        builder.set_dispatch_table(table);

        let hit = builder.new_array(&[Value::from_i64(foo_id as i64), null, foo, null]);
        let miss = builder.new_array(&[Value::from_i64(-1), null, nsm, null]);
        let mut rows = vec![null; (class_id as usize + foo_id as usize) + 1];
        rows[0] = miss;
        rows[class_id as usize + foo_id as usize] = hit;
        let vtable = builder.new_array(&rows);
        builder.set_vtable(vtable);

        let mut b = BytecodeBuilder::new();
        b.load_const(receiver_idx);
        b.invoke_method(selector);
        b.load_const(receiver_idx);
        b.invoke_method_fast(0);
        b.load_const(receiver_idx);
        b.invoke_method_vtable(selector);
        b.load_const(receiver_idx);
        b.invoke_test(selector);
        b.load_const(receiver_idx);
        b.invoke_test_fast(0);
        b.load_const(receiver_idx);
        b.invoke_test_vtable(selector);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let slots = stack_slots(&process);
        let truth = process.program().true_object();
        assert_eq!(smi(slots[1]), 42);
        assert_eq!(smi(slots[2]), 42);
        assert_eq!(smi(slots[3]), 42);
        assert_eq!(slots[4].raw(), truth.raw());
        assert_eq!(slots[5].raw(), truth.raw());
        assert_eq!(slots[6].raw(), truth.raw());
    }

    // Invariant 5: switching A -> B -> A restores A's stack and position.
    #[test]
    fn coroutine_round_trip() {
        let mut builder = ProgramBuilder::new();

        let mut bb = BytecodeBuilder::new();
        bb.coroutine_change(); // resume point of the fresh coroutine
        bb.load_literal(9);
        bb.coroutine_change(); // back to the creator, delivering 9
        bb.method_end();
        let body = builder.add_function(0, bb.as_bytes(), &[], &[]);
        let body_idx = builder.add_constant(body);

        let new_co = native_wrapper(&mut builder, 1, Native::CoroutineNew);
        let new_co_idx = builder.add_static_method(new_co);
        let current = native_wrapper(&mut builder, 0, Native::CoroutineCurrent);
        let current_idx = builder.add_static_method(current);
        let b_static = builder.add_static_field(Value::from_i64(0));

        let mut b = BytecodeBuilder::new();
        b.load_const(body_idx);
        b.invoke_static(new_co_idx);
        b.store_static(b_static);
        b.invoke_static(current_idx);
        b.coroutine_change();
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        let main = process.coroutine();
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 9);
        assert_eq!(process.coroutine().raw(), main.raw());

        let statics_value = process.statics();
        let statics: &Array = unsafe { statics_value.as_ref() };
        let other = unsafe { statics.get(b_static as u64) };
        let other_ref: &Coroutine = unsafe { other.as_ref() };
        // Still suspended mid-switch, not done; its caller is the main
        // coroutine it switched away from.
        assert!(!coroutine_is_done(process.program(), other));
        assert_eq!(other_ref.caller.raw(), main.raw());
    }

    // S4: an exception thrown in coroutine B is caught in A; B is marked
    // done with its stack dropped.
    #[test]
    fn exception_crosses_coroutine_boundary() {
        let mut builder = ProgramBuilder::new();

        let mut bb = BytecodeBuilder::new();
        bb.coroutine_change();
        bb.throw();
        bb.method_end();
        let body = builder.add_function(0, bb.as_bytes(), &[], &[]);
        let body_idx = builder.add_constant(body);

        let new_co = native_wrapper(&mut builder, 1, Native::CoroutineNew);
        let new_co_idx = builder.add_static_method(new_co);
        let b_static = builder.add_static_field(Value::from_i64(0));

        let mut b = BytecodeBuilder::new();
        b.load_const(body_idx); //      0..5
        b.invoke_static(new_co_idx); // 5..10
        b.store_static(b_static); //    10..15
        b.load_literal(13); //          15..17
        b.coroutine_change(); //        17..18
        finish_entry(&mut b); //        handler at 18
        let entry = builder.add_function(
            0,
            b.as_bytes(),
            &[],
            &[CatchRange { start: 0, end: 18, handler: 18, frame_slots: 1 }],
        );

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        // Control resumed in A with the exception on the stack.
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 13);

        // B is done: stack slot nulled, caller self-looped.
        let statics_value = process.statics();
        let statics: &Array = unsafe { statics_value.as_ref() };
        let other = unsafe { statics.get(b_static as u64) };
        assert!(coroutine_is_done(process.program(), other));
    }

    // A throw in a callee unwinds into the calling frame's handler.
    #[test]
    fn throw_unwinds_to_calling_frame() {
        let mut builder = ProgramBuilder::new();

        let mut gb = BytecodeBuilder::new();
        gb.load_literal(99);
        gb.throw();
        gb.method_end();
        let g = builder.add_function(0, gb.as_bytes(), &[], &[]);
        let g_idx = builder.add_static_method(g);

        let mut b = BytecodeBuilder::new();
        b.invoke_static(g_idx); // 0..5; return address 5 is covered below
        finish_entry(&mut b); // handler at 5
        let entry = builder.add_function(
            0,
            b.as_bytes(),
            &[],
            &[CatchRange { start: 0, end: 5, handler: 5, frame_slots: 1 }],
        );

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 99);
    }

    struct RecordingSession {
        recorded: StdArc<AtomicBool>,
    }

    impl Session for RecordingSession {
        fn is_debugging(&self) -> bool {
            true
        }

        fn uncaught_exception(&mut self) {
            self.recorded.store(true, Ordering::Relaxed);
        }
    }

    // S5 (session variant): an exception that unwinds out of every
    // coroutine is recorded and surrendered.
    #[test]
    fn uncaught_exception_reaches_session() {
        let recorded = StdArc::new(AtomicBool::new(false));
        let mut builder = ProgramBuilder::new();
        builder.set_session(Box::new(RecordingSession { recorded: recorded.clone() }));

        let mut b = BytecodeBuilder::new();
        b.load_literal(99);
        b.throw();
        b.method_end();
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::UncaughtException);
        assert!(recorded.load(Ordering::Relaxed));
    }

    // Invariant 6: Identical refines doubles and large integers;
    // IdenticalNonNumeric stays pointer equality.
    #[test]
    fn identical_numeric_refinements() {
        let mut builder = ProgramBuilder::new();
        let value = builder.new_double(f64::NAN);
        let nan_a = builder.add_constant(value);
        let value = builder.new_double(f64::NAN);
        let nan_b = builder.add_constant(value);
        let value = builder.new_double(0.0);
        let zero_pos = builder.add_constant(value);
        let value = builder.new_double(-0.0);
        let zero_neg = builder.add_constant(value);
        let big = 5_000_000_000_000_000_000i64;
        let value = builder.new_large_integer(big);
        let big_a = builder.add_constant(value);
        let value = builder.new_large_integer(big);
        let big_b = builder.add_constant(value);

        let mut b = BytecodeBuilder::new();
        b.load_const(nan_a);
        b.load_const(nan_b);
        b.identical();
        b.load_const(zero_pos);
        b.load_const(zero_neg);
        b.identical();
        b.load_const(big_a);
        b.load_const(big_b);
        b.identical();
        b.load_const(nan_a);
        b.load_const(nan_b);
        b.identical_non_numeric();
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let slots = stack_slots(&process);
        let truth = process.program().true_object();
        let lies = process.program().false_object();
        assert_eq!(slots[1].raw(), truth.raw());
        assert_eq!(slots[2].raw(), truth.raw());
        assert_eq!(slots[3].raw(), truth.raw());
        assert_eq!(slots[4].raw(), lies.raw());
    }

    // S6: allocate, poke, peek and free a foreign buffer.
    #[test]
    fn foreign_memory_round_trip() {
        let mut builder = ProgramBuilder::new();
        let alloc = native_wrapper(&mut builder, 1, Native::ForeignAllocate);
        let alloc_idx = builder.add_static_method(alloc);
        let set = native_wrapper(&mut builder, 2, Native::ForeignSetInt32);
        let set_idx = builder.add_static_method(set);
        let get = native_wrapper(&mut builder, 1, Native::ForeignGetInt32);
        let get_idx = builder.add_static_method(get);
        let release = native_wrapper(&mut builder, 1, Native::ForeignFree);
        let release_idx = builder.add_static_method(release);

        let mut b = BytecodeBuilder::new();
        b.load_literal(8);
        b.invoke_static(alloc_idx); // [addr]
        b.load_local(0); // [addr, addr]
        b.load_literal(-1); // [addr, addr, -1]
        b.invoke_static(set_idx); // [addr, -1]
        b.pop(); // [addr]
        b.load_local(0); // [addr, addr]
        b.invoke_static(get_idx); // [addr, got]
        b.load_local(1); // [addr, got, addr]
        b.invoke_static(release_idx); // [addr, got, null]
        b.pop(); // [addr, got]
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[2]), -1);
    }

    // S7: a send native yields to a locked port.
    #[test]
    fn native_yield_surrenders_locked_port() {
        let mut builder = ProgramBuilder::new();
        let port_class = builder.add_class(1, ClassFlags::PORT, Value::from_raw(0));
        let port = Port::new();
        let wrapper = builder.new_instance(port_class, &[Value::from_i64(port as i64)], false);
        let wrapper_idx = builder.add_constant(wrapper);

        let mut sb = BytecodeBuilder::new();
        sb.invoke_native_yield(1, Native::PortSend as u8);
        sb.throw();
        sb.method_end();
        let send = builder.add_function(1, sb.as_bytes(), &[], &[]);
        let send_idx = builder.add_static_method(send);

        let mut b = BytecodeBuilder::new();
        b.load_const(wrapper_idx);
        b.invoke_static(send_idx);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        match interpret(&mut process) {
            Interruption::TargetYield(target) => {
                assert_eq!(target.as_ptr(), port);
                assert!(unsafe { target.as_ref() }.is_locked());
            }
            other => panic!("expected TargetYield, got {other:?}"),
        }

        // The saved stack has null on top (below the saved position).
        let slots = stack_slots(&process);
        let null = process.program().null_object();
        assert_eq!(slots[slots.len() - 2].raw(), null.raw());

        unsafe {
            (*port).unlock();
            Port::decrement_ref(port);
        }
    }

    fn nsm_program(selector_kind: SelectorKind) -> (ProgramBuilder, Value) {
        let mut builder = ProgramBuilder::new();
        let class = builder.add_class(0, ClassFlags::NONE, Value::from_raw(0));

        let mut hb = BytecodeBuilder::new();
        hb.load_literal(77);
        hb.ret(1, 2);
        hb.method_end();
        let handler = builder.add_function(1, hb.as_bytes(), &[], &[]);
        let nsm_selector = builder.nsm_selector();
        builder.set_class_methods(class, &[(nsm_selector, handler)]);

        let receiver = builder.new_instance(class, &[], false);
        let receiver_idx = builder.add_constant(receiver);

        let missing = Selector::encode(60, selector_kind, 1);
        let mut b = BytecodeBuilder::new();
        b.load_const(receiver_idx);
        b.load_literal(5);
        b.invoke_method(missing);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);
        (builder, entry)
    }

    // A miss binds the trampoline; the user-visible handler's result
    // replaces the invoke's.
    #[test]
    fn no_such_method_returns_handler_result() {
        let (builder, entry) = nsm_program(SelectorKind::Method);
        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 77);
    }

    // Setter sends answer the assigned value even through noSuchMethod.
    #[test]
    fn no_such_method_setter_returns_assigned_value() {
        let (builder, entry) = nsm_program(SelectorKind::Setter);
        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 5);
    }

    // The fast-invoke catch-all row reaches the same trampoline, which
    // recovers the selector through the dispatch table.
    #[test]
    fn no_such_method_through_dispatch_table() {
        let mut builder = ProgramBuilder::new();
        let class = builder.add_class(0, ClassFlags::NONE, Value::from_raw(0));

        let mut hb = BytecodeBuilder::new();
        hb.load_literal(77);
        hb.ret(1, 2);
        hb.method_end();
        let handler = builder.add_function(1, hb.as_bytes(), &[], &[]);
        let nsm_selector = builder.nsm_selector();
        builder.set_class_methods(class, &[(nsm_selector, handler)]);

        let receiver = builder.new_instance(class, &[], false);
        let receiver_idx = builder.add_constant(receiver);

        let missing = Selector::encode(60, SelectorKind::Method, 1);
        let null = Value::from_raw(0);
        let nsm = builder.nsm_trampoline();
        let table = builder.new_array(&[
            null,
            Value::from_i64(missing as i64),
            null,
            null,
            Value::from_i64(0),
            Value::from_i64(Value::MAX_SMI),
            null,
            nsm,
        ]);
        builder.set_dispatch_table(table);

        let mut b = BytecodeBuilder::new();
        b.load_const(receiver_idx);
        b.load_literal(5);
        b.invoke_method_fast(0);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 77);
    }

    // Hitting a breakpoint saves state; resuming skips the immediate
    // re-check and runs to completion.
    #[test]
    fn breakpoint_pauses_and_resumes() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal(3); // 0..2
        finish_entry(&mut b); // LoadLiteralTrue at 2
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        let entry_ref: &Function = unsafe { entry.as_ref() };
        let position = entry_ref.bytecode_address_for(2);
        process.ensure_debug_info().set_breakpoint(position);

        assert_eq!(interpret(&mut process), Interruption::Breakpoint);
        // Position is already saved on the stack.
        let slots = stack_slots(&process);
        assert!(slots.last().unwrap().is_return_address());

        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 3);
    }

    // The overflow poll grows the stack and execution continues on the
    // copy.
    #[test]
    fn stack_overflow_grows_and_continues() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.stack_overflow_check(600);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let stack_value = process.stack_value();
        let stack: &Stack = unsafe { stack_value.as_ref() };
        assert!(stack.capacity() > 256);
    }

    // When the process refuses to grow, the engine surrenders Interrupt.
    #[test]
    fn stack_overflow_refusal_interrupts() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.stack_overflow_check(600);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        process.set_max_stack_size(300);
        assert_eq!(interpret(&mut process), Interruption::Interrupt);
    }

    // LoadStaticInit runs the initializer once; afterwards the static
    // holds the computed value.
    #[test]
    fn static_initializer_runs_once() {
        let mut builder = ProgramBuilder::new();
        let mut ib = BytecodeBuilder::new();
        ib.load_literal(99);
        ib.store_static(0);
        ib.ret(1, 0);
        ib.method_end();
        let init = builder.add_function(0, ib.as_bytes(), &[], &[]);
        let initializer = builder.new_initializer(init);
        let index = builder.add_static_field(initializer);

        let mut b = BytecodeBuilder::new();
        b.load_static_init(index);
        b.pop();
        b.load_static_init(index);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 99);
        let statics_value = process.statics();
        let statics: &Array = unsafe { statics_value.as_ref() };
        assert_eq!(smi(unsafe { statics.get(index as u64) }), 99);
    }

    // Boxed cells mutate in place through Store/LoadBoxed.
    #[test]
    fn boxed_cells_mutate_in_place() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal(5); // [5]
        b.allocate_boxed(); // [box(5)]
        b.load_literal(9); // [box, 9]
        b.store_boxed(1); // box.value = 9
        b.pop(); // [box]
        b.load_boxed(0); // [box, 9]
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[2]), 9);
        let cell: &Boxed = unsafe { slots[1].as_ref() };
        assert_eq!(smi(cell.value), 9);
    }

    // Field loads and stores against a freshly allocated instance.
    #[test]
    fn instance_field_access() {
        let mut builder = ProgramBuilder::new();
        let class = builder.add_class(2, ClassFlags::NONE, Value::from_raw(0));
        let class_id = class_id_of(class);

        let mut b = BytecodeBuilder::new();
        b.load_literal(7);
        b.load_literal(8);
        b.allocate(class_id); // [inst] fields (7, 8)
        b.load_local(0); // [inst, inst]
        b.load_literal(3); // [inst, inst, 3]
        b.store_field(0); // [inst, 3]
        b.pop(); // [inst]
        b.load_local(0);
        b.load_field(0); // [inst, 3]
        b.load_local(1);
        b.load_field(1); // [inst, 3, 8]
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[2]), 3);
        assert_eq!(smi(slots[3]), 8);
    }

    // AllocateImmutable publishes the bit only when every field is
    // immutable at allocation time.
    #[test]
    fn immutability_computed_from_fields() {
        let mut builder = ProgramBuilder::new();
        let imm = builder.add_class(1, ClassFlags::IMMUTABLE_INSTANCES, Value::from_raw(0));
        let imm_id = class_id_of(imm);
        let plain = builder.add_class(2, ClassFlags::NONE, Value::from_raw(0));
        let plain_id = class_id_of(plain);
        let wrap = builder.add_class(1, ClassFlags::IMMUTABLE_INSTANCES, Value::from_raw(0));
        let wrap_id = class_id_of(wrap);

        let mut b = BytecodeBuilder::new();
        b.load_literal(3);
        b.allocate_immutable(imm_id); // [imm(3)]
        b.load_literal(7);
        b.load_literal(8);
        b.allocate(plain_id); // [imm, plain]
        b.allocate_immutable(wrap_id); // [imm, wrap(plain)]
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert!(object::is_immutable(slots[1]));
        assert!(!object::is_immutable(slots[2]));
    }

    // Forward conditional plus backward unconditional branches.
    #[test]
    fn branches_route_control() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal_false();
        let skip = b.branch_if_false();
        let back_target = b.current_offset();
        b.load_literal(5);
        finish_entry(&mut b);
        b.bind(skip);
        b.branch_back(back_target);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 5);
    }

    // SubroutineCall/Return: the finally-clause helpers push and consume
    // a resume delta.
    #[test]
    fn subroutine_call_and_return() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal(0); //        0: the surviving operand
        b.subroutine_call(11, 5); // 1: jump to 12, resume delta 5
        b.load_literal_true(); //    10
        b.process_yield(); //        11
        b.load_literal(9); //        12: subroutine body
        b.pop(); //                  14
        b.subroutine_return(); //    15: back to 15 - 5 = 10
        b.method_end();
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 0);
    }

    // Unfold opcodes read their constants through inline byte deltas.
    #[test]
    fn unfold_constants_resolve_inline() {
        let mut builder = ProgramBuilder::new();
        let mut fb = BytecodeBuilder::new();
        fb.load_literal(42);
        fb.ret(1, 0);
        fb.method_end();
        let f42 = builder.add_function(0, fb.as_bytes(), &[], &[]);

        // Layout: InvokeStaticUnfold at 0, LoadConstUnfold at 5, then
        // true/yield/end = 13 bytes, so the pool starts at 16.
        let mut b = BytecodeBuilder::new();
        b.invoke_static_unfold(unfold_delta(13, 0, 0));
        b.load_const_unfold(unfold_delta(13, 5, 1));
        finish_entry(&mut b);
        assert_eq!(b.current_offset(), 13);
        let constants = [f42, Value::from_i64(1234)];
        let entry = builder.add_function(0, b.as_bytes(), &constants, &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 42);
        assert_eq!(smi(slots[2]), 1234);
    }

    // Property 1 (sampled): the declarative stack-diff table matches the
    // engine's actual depth changes.
    #[test]
    fn stack_diff_table_matches_execution() {
        let ops = [
            Op::LoadLiteralNull,
            Op::Pop,
            Op::LoadLiteral,
            Op::LoadLiteral1,
            Op::Identical,
            Op::Pop,
            Op::LoadLiteralTrue,
            Op::Negate,
            Op::Pop,
            Op::LoadLiteral,
        ];
        let predicted: i64 = ops.iter().map(|op| op.info().stack_diff as i64).sum();

        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal_null();
        b.pop();
        b.load_literal(7);
        b.load_literal(1);
        b.identical();
        b.pop();
        b.load_literal_true();
        b.negate();
        b.pop();
        b.load_literal(9);
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);

        let stack_value = process.stack_value();
        let stack: &Stack = unsafe { stack_value.as_ref() };
        // Slot 0 is the entry sentinel; the surrender adds the yield null
        // and the saved position.
        let measured = stack.top() as i64 - 2;
        assert_eq!(measured, predicted);
        let slots = stack_slots(&process);
        assert_eq!(smi(slots[1]), 9);
    }

    // Property 3: the bytecode pointer after a return equals the address
    // pushed at the call site (observable as straight-line completion).
    #[test]
    fn return_resumes_at_pushed_address() {
        let mut builder = ProgramBuilder::new();
        let mut fb = BytecodeBuilder::new();
        fb.load_literal(6);
        fb.ret(1, 0);
        fb.method_end();
        let f = builder.add_function(0, fb.as_bytes(), &[], &[]);
        let f_idx = builder.add_static_method(f);

        let mut b = BytecodeBuilder::new();
        b.invoke_static(f_idx);
        b.load_literal(1);
        b.identical(); // 6 == 1 is false, but proves both slots exist
        finish_entry(&mut b);
        let entry = builder.add_function(0, b.as_bytes(), &[], &[]);

        let mut process = spawn(builder, entry);
        assert_eq!(interpret(&mut process), Interruption::Terminate);
        let slots = stack_slots(&process);
        assert_eq!(slots[1].raw(), process.program().false_object().raw());
    }
}
