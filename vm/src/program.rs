use std::alloc::Layout;
use std::cell::RefCell;
use std::ptr;
use std::sync::Arc;

use bytecode::BytecodeBuilder;
use heap::Heap;
use object::{
    array_allocation_size, function_allocation_size, instance_allocation_size,
    str_allocation_size, Array, Class, ClassFlags, Double, Failure, Function, Header,
    Initializer, Instance, LargeInteger, ObjectType, Selector, SelectorKind, Str, Value,
};

use crate::session::Session;
use crate::trace_object;

/// Class ids handed out before any user class, in declaration order.
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum BuiltinClass {
    Smi = 0,
    Null,
    True,
    False,
    Boxed,
    LargeInteger,
    Double,
    Str,
    Array,
    Function,
    Initializer,
    Stack,
    Coroutine,
    Error,
}

const BUILTIN_CLASS_COUNT: usize = BuiltinClass::Error as usize + 1;

/// The program: singletons, class/method/constant tables, the dispatch
/// table and vtable, and the no-such-method trampoline. All of it lives in
/// an uncollected space, so the engine and the lookup cache may hold raw
/// references across process collections.
pub struct Program {
    heap: Heap,
    null_object: Value,
    true_object: Value,
    false_object: Value,
    classes: Vec<Value>,
    static_methods: Vec<Value>,
    constants: Vec<Value>,
    statics_template: Vec<Value>,
    dispatch_table: Value,
    vtable: Value,
    nsm_selector: u32,
    nsm_trampoline: Value,
    wrong_argument_type_error: Value,
    index_out_of_bounds_error: Value,
    illegal_state_error: Value,
    session: RefCell<Option<Box<dyn Session>>>,
}

impl Program {
    pub fn null_object(&self) -> Value {
        self.null_object
    }

    pub fn true_object(&self) -> Value {
        self.true_object
    }

    pub fn false_object(&self) -> Value {
        self.false_object
    }

    pub fn class_at(&self, index: usize) -> Value {
        self.classes[index]
    }

    pub fn static_method_at(&self, index: usize) -> Value {
        self.static_methods[index]
    }

    pub fn constant_at(&self, index: usize) -> Value {
        self.constants[index]
    }

    pub fn statics_template(&self) -> &[Value] {
        &self.statics_template
    }

    pub fn dispatch_table(&self) -> Value {
        self.dispatch_table
    }

    pub fn vtable(&self) -> Value {
        self.vtable
    }

    pub fn smi_class(&self) -> Value {
        self.classes[BuiltinClass::Smi as usize]
    }

    pub fn builtin_class(&self, builtin: BuiltinClass) -> Value {
        self.classes[builtin as usize]
    }

    /// The selector the no-such-method trampoline re-dispatches to.
    pub fn nsm_selector(&self) -> u32 {
        self.nsm_selector
    }

    pub fn nsm_trampoline(&self) -> Value {
        self.nsm_trampoline
    }

    /// Map a (non-retry) failure sentinel to its user-level exception
    /// object.
    pub fn object_from_failure(&self, failure: Value) -> Value {
        debug_assert!(failure.is_failure() && !failure.is_retry_after_gc());
        if failure == Failure::WRONG_ARGUMENT_TYPE {
            self.wrong_argument_type_error
        } else if failure == Failure::INDEX_OUT_OF_BOUNDS {
            self.index_out_of_bounds_error
        } else {
            self.illegal_state_error
        }
    }

    /// The Function whose bytecode stream contains `bcp`, if any.
    pub fn function_from_bytecode_pointer(&self, bcp: *const u8) -> Option<*const Function> {
        let start = self.heap.find_object(bcp as usize)?;
        // SAFETY: every program-space allocation starts with a header.
        let header = unsafe { &*(start as *const Header) };
        if header.object_type() != ObjectType::Function {
            return None;
        }
        let function = start as *const Function;
        // SAFETY: the header says this is a Function.
        if unsafe { (*function).contains_address(bcp) } {
            Some(function)
        } else {
            None
        }
    }

    pub fn set_session(&self, session: Box<dyn Session>) {
        *self.session.borrow_mut() = Some(session);
    }

    pub fn has_debug_session(&self) -> bool {
        self.session.borrow().as_ref().map_or(false, |s| s.is_debugging())
    }

    pub fn record_uncaught_exception(&self) {
        if let Some(session) = self.session.borrow_mut().as_mut() {
            session.uncaught_exception();
        }
    }
}

/// A bytecode-level catch range: `[start, end)` byte offsets, the handler
/// entry offset and the operand height the handler expects (counting the
/// slot that receives the exception).
#[derive(Debug, Clone, Copy)]
pub struct CatchRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub frame_slots: u32,
}

/// Byte delta an `Unfold` opcode at `opcode_offset` must carry to reach
/// constant `index` of a function whose bytecode is `bytecode_len` bytes.
pub fn unfold_delta(bytecode_len: usize, opcode_offset: usize, index: usize) -> i32 {
    let constants_offset = (bytecode_len + 7) & !7;
    (constants_offset + index * size_of::<Value>()) as i32 - opcode_offset as i32
}

/// Builds a [`Program`] in place of the external snapshot loader. Tests
/// declare classes, functions and tables through this, then `finish()`.
pub struct ProgramBuilder {
    heap: Heap,
    classes: Vec<Value>,
    static_methods: Vec<Value>,
    constants: Vec<Value>,
    statics: Vec<Value>,
    dispatch_table: Value,
    vtable: Value,
    nsm_selector: u32,
    nsm_trampoline: Value,
    session: Option<Box<dyn Session>>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            heap: Heap::unlimited(trace_object),
            classes: Vec::new(),
            static_methods: Vec::new(),
            constants: Vec::new(),
            statics: Vec::new(),
            dispatch_table: Value::from_raw(0),
            vtable: Value::from_raw(0),
            nsm_selector: Selector::encode(1, SelectorKind::Method, 1),
            nsm_trampoline: Value::from_raw(0),
            session: None,
        };
        for builtin in 0..BUILTIN_CLASS_COUNT {
            let (fields, flags) = match builtin {
                b if b == BuiltinClass::Null as usize
                    || b == BuiltinClass::True as usize
                    || b == BuiltinClass::False as usize =>
                {
                    (0, ClassFlags::IMMUTABLE_INSTANCES)
                }
                b if b == BuiltinClass::Error as usize => (1, ClassFlags::IMMUTABLE_INSTANCES),
                _ => (0, ClassFlags::NONE),
            };
            builder.add_class(fields, flags, Value::from_raw(0));
        }

        // The catch-all dispatch target: recover the failing invoke from
        // its return address, call the user-visible handler, unmarshal.
        let mut trampoline = BytecodeBuilder::new();
        trampoline.enter_no_such_method();
        trampoline.invoke_method(builder.nsm_selector);
        trampoline.exit_no_such_method();
        trampoline.method_end();
        let bytes = trampoline.into_bytes();
        builder.nsm_trampoline = builder.add_function(1, &bytes, &[], &[]);
        builder
    }

    /// The catch-all target every dispatch table and vtable falls back to.
    pub fn nsm_trampoline(&self) -> Value {
        self.nsm_trampoline
    }

    pub fn builtin_class(&self, builtin: BuiltinClass) -> Value {
        self.classes[builtin as usize]
    }

    /// The selector the no-such-method trampoline re-dispatches to; classes
    /// wanting a user-visible handler register a method under it.
    pub fn nsm_selector(&self) -> u32 {
        self.nsm_selector
    }

    fn allocate(&mut self, size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size, 8).unwrap();
        self.heap.try_allocate(layout).expect("program space exhausted").as_ptr()
    }

    /// Declare a class; its id is its index in the class table.
    pub fn add_class(&mut self, instance_fields: u32, flags: ClassFlags, superclass: Value) -> Value {
        let id = self.classes.len() as u32;
        let ptr = self.allocate(size_of::<Class>()) as *mut Class;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new(ObjectType::Class));
            (*ptr).class = Value::from_raw(0);
            (*ptr).init(id, instance_fields, flags);
            (*ptr).superclass = superclass;
            (*ptr).methods = Value::from_raw(0);
        }
        let class = Value::from_ptr(ptr);
        self.classes.push(class);
        class
    }

    /// Attach the `[selector, function]` method array the lookup slow path
    /// walks. Separate from [`add_class`](Self::add_class) because methods
    /// reference functions that reference classes.
    pub fn set_class_methods(&mut self, class: Value, methods: &[(u32, Value)]) {
        let mut flat = Vec::with_capacity(methods.len() * 2);
        for (selector, function) in methods {
            flat.push(Value::from_i64(*selector as i64));
            flat.push(*function);
        }
        let array = self.new_array(&flat);
        // SAFETY: `class` came from add_class.
        unsafe {
            let mut class = class;
            class.as_mut::<Class>().methods = array;
        }
    }

    pub fn add_function(
        &mut self,
        arity: u32,
        bytecode: &[u8],
        constants: &[Value],
        catch_ranges: &[CatchRange],
    ) -> Value {
        let catch_table = if catch_ranges.is_empty() {
            Value::from_raw(0)
        } else {
            let mut flat = Vec::with_capacity(catch_ranges.len() * 4);
            for range in catch_ranges {
                flat.push(Value::from_i64(range.start as i64));
                flat.push(Value::from_i64(range.end as i64));
                flat.push(Value::from_i64(range.handler as i64));
                flat.push(Value::from_i64(range.frame_slots as i64));
            }
            self.new_array(&flat)
        };

        let size = function_allocation_size(bytecode.len(), constants.len());
        let ptr = self.allocate(size) as *mut Function;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new(ObjectType::Function));
            (*ptr).class = self.classes[BuiltinClass::Function as usize];
            (*ptr).init(arity, bytecode.len() as u32, constants.len() as u32);
            (*ptr).catch_table = catch_table;
            let code = (*ptr).bytecode_address_for(0) as *mut u8;
            ptr::copy_nonoverlapping(bytecode.as_ptr(), code, bytecode.len());
            let pool = (*ptr).bytecode_address_for((*ptr).constants_offset()) as *mut Value;
            for (i, constant) in constants.iter().enumerate() {
                *pool.add(i) = *constant;
            }
        }
        Value::from_ptr(ptr)
    }

    pub fn add_static_method(&mut self, function: Value) -> u32 {
        self.static_methods.push(function);
        (self.static_methods.len() - 1) as u32
    }

    pub fn add_constant(&mut self, value: Value) -> u32 {
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn add_static_field(&mut self, value: Value) -> u32 {
        self.statics.push(value);
        (self.statics.len() - 1) as u32
    }

    pub fn set_dispatch_table(&mut self, table: Value) {
        self.dispatch_table = table;
    }

    pub fn set_vtable(&mut self, table: Value) {
        self.vtable = table;
    }

    pub fn set_session(&mut self, session: Box<dyn Session>) {
        self.session = Some(session);
    }

    // ── program-space object constructors ──────────────────────────

    pub fn new_array(&mut self, elements: &[Value]) -> Value {
        let ptr = self.allocate(array_allocation_size(elements.len() as u64)) as *mut Array;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new(ObjectType::Array));
            (*ptr).class = self.classes[BuiltinClass::Array as usize];
            (*ptr).init_length(elements.len() as u64);
            for (i, element) in elements.iter().enumerate() {
                (*ptr).set(i as u64, *element);
            }
        }
        Value::from_ptr(ptr)
    }

    pub fn new_string(&mut self, text: &str) -> Value {
        let ptr = self.allocate(str_allocation_size(text.len())) as *mut Str;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new_immutable(ObjectType::Str));
            (*ptr).class = self.classes[BuiltinClass::Str as usize];
            (*ptr).init_length(text.len() as u64);
            let bytes = (ptr.add(1)) as *mut u8;
            ptr::copy_nonoverlapping(text.as_ptr(), bytes, text.len());
        }
        Value::from_ptr(ptr)
    }

    pub fn new_double(&mut self, value: f64) -> Value {
        let ptr = self.allocate(size_of::<Double>()) as *mut Double;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new_immutable(ObjectType::Double));
            (*ptr).class = self.classes[BuiltinClass::Double as usize];
            (*ptr).value = value;
        }
        Value::from_ptr(ptr)
    }

    pub fn new_large_integer(&mut self, value: i64) -> Value {
        let ptr = self.allocate(size_of::<LargeInteger>()) as *mut LargeInteger;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new_immutable(ObjectType::LargeInteger));
            (*ptr).class = self.classes[BuiltinClass::LargeInteger as usize];
            (*ptr).value = value;
        }
        Value::from_ptr(ptr)
    }

    pub fn new_instance(&mut self, class: Value, fields: &[Value], immutable: bool) -> Value {
        // SAFETY: `class` came from add_class.
        let declared = unsafe { class.as_ref::<Class>().instance_fields() } as usize;
        debug_assert_eq!(declared, fields.len());
        let ptr = self.allocate(instance_allocation_size(fields.len() as u32)) as *mut Instance;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            let header = if immutable {
                Header::new_immutable(ObjectType::Instance)
            } else {
                Header::new(ObjectType::Instance)
            };
            ptr::write(&mut (*ptr).header, header);
            (*ptr).class = class;
            for (i, field) in fields.iter().enumerate() {
                (*ptr).set_field(i, *field);
            }
        }
        Value::from_ptr(ptr)
    }

    pub fn new_initializer(&mut self, function: Value) -> Value {
        let ptr = self.allocate(size_of::<Initializer>()) as *mut Initializer;
        // SAFETY: freshly allocated, correctly sized.
        unsafe {
            ptr::write(&mut (*ptr).header, Header::new(ObjectType::Initializer));
            (*ptr).class = self.classes[BuiltinClass::Initializer as usize];
            (*ptr).function = function;
        }
        Value::from_ptr(ptr)
    }

    pub fn finish(mut self) -> Arc<Program> {
        let null_class = self.classes[BuiltinClass::Null as usize];
        let true_class = self.classes[BuiltinClass::True as usize];
        let false_class = self.classes[BuiltinClass::False as usize];
        let null_object = self.new_instance(null_class, &[], true);
        let true_object = self.new_instance(true_class, &[], true);
        let false_object = self.new_instance(false_class, &[], true);

        let error_class = self.classes[BuiltinClass::Error as usize];
        let wrong_argument_type_error =
            self.new_instance(error_class, &[Value::from_i64(1)], true);
        let index_out_of_bounds_error =
            self.new_instance(error_class, &[Value::from_i64(2)], true);
        let illegal_state_error = self.new_instance(error_class, &[Value::from_i64(3)], true);

        Arc::new(Program {
            heap: self.heap,
            null_object,
            true_object,
            false_object,
            classes: self.classes,
            static_methods: self.static_methods,
            constants: self.constants,
            statics_template: self.statics,
            dispatch_table: self.dispatch_table,
            vtable: self.vtable,
            nsm_selector: self.nsm_selector,
            nsm_trampoline: self.nsm_trampoline,
            wrong_argument_type_error,
            index_out_of_bounds_error,
            illegal_state_error,
            session: RefCell::new(self.session),
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singletons_are_distinct_and_immutable() {
        let program = ProgramBuilder::new().finish();
        let singletons = [program.null_object(), program.true_object(), program.false_object()];
        for v in singletons {
            assert!(v.is_ref());
            assert!(object::is_immutable(v));
        }
        assert_ne!(singletons[0].raw(), singletons[1].raw());
        assert_ne!(singletons[1].raw(), singletons[2].raw());
    }

    #[test]
    fn class_ids_match_table_indices() {
        let mut builder = ProgramBuilder::new();
        let user = builder.add_class(2, ClassFlags::NONE, Value::from_raw(0));
        let id = unsafe { user.as_ref::<Class>().id() };
        let program = builder.finish();
        assert_eq!(program.class_at(id as usize).raw(), user.raw());
    }

    #[test]
    fn function_from_bcp_finds_owner() {
        let mut builder = ProgramBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.load_literal(3);
        b.ret(1, 1);
        let function = builder.add_function(0, b.as_bytes(), &[], &[]);
        let program = builder.finish();

        let function_ref: &Function = unsafe { function.as_ref() };
        let inside = function_ref.bytecode_address_for(2);
        let found = program.function_from_bytecode_pointer(inside).expect("function");
        assert_eq!(found as usize, function.ref_bits() as usize);

        let outside = [0u8; 4];
        assert!(program.function_from_bytecode_pointer(outside.as_ptr()).is_none());
    }

    #[test]
    fn failure_objects_are_distinct() {
        let program = ProgramBuilder::new().finish();
        let wrong = program.object_from_failure(Failure::WRONG_ARGUMENT_TYPE);
        let oob = program.object_from_failure(Failure::INDEX_OUT_OF_BOUNDS);
        let illegal = program.object_from_failure(Failure::ILLEGAL_STATE);
        assert_ne!(wrong.raw(), oob.raw());
        assert_ne!(oob.raw(), illegal.raw());
    }

    #[test]
    fn unfold_delta_reaches_aligned_pool() {
        // 7 bytes of bytecode pad to 8; constant 1 sits at byte 16.
        assert_eq!(unfold_delta(7, 2, 1), 14);
        assert_eq!(unfold_delta(8, 0, 0), 8);
    }
}
