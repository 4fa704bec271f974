use std::alloc::Layout;
use std::ptr;
use std::sync::Arc;

use heap::{FinalizerFn, Heap, RootProvider};
use object::{
    array_allocation_size, instance_allocation_size, stack_allocation_size, Array, Boxed, Class,
    Coroutine, Header, Instance, LargeInteger, ObjectType, Stack, Value,
};

use crate::ffi;
use crate::lookup::LookupCache;
use crate::program::{BuiltinClass, Program};
use crate::session::DebugInfo;
use crate::trace_object;

/// Slots kept free above the overflow-poll boundary, so a call can push its
/// return address and the no-such-method marshalling without re-polling.
pub const STACK_MARGIN: usize = 16;

const DEFAULT_STACK_CAPACITY: u64 = 256;
const DEFAULT_MAX_STACK_SLOTS: usize = 128 * 1024;
const HEAP_LOW_WATER: usize = 4096;

/// A user-space process: one coroutine executing at a time against a
/// private heap, statics array, lookup cache and errno view.
pub struct Process {
    program: Arc<Program>,
    heap: Heap,
    coroutine: Value,
    statics: Value,
    lookup_cache: Option<Box<LookupCache>>,
    debug_info: Option<DebugInfo>,
    saved_errno: i32,
    max_stack_size: usize,
    collections: usize,
}

struct ProcessRoots<'a> {
    coroutine: &'a mut Value,
    statics: &'a mut Value,
}

impl RootProvider for ProcessRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(self.coroutine);
        visitor(self.statics);
    }
}

impl Process {
    pub fn new(program: Arc<Program>, heap_limit: usize) -> Self {
        let mut process = Self {
            program,
            heap: Heap::new(heap_limit, trace_object),
            coroutine: Value::from_raw(0),
            statics: Value::from_raw(0),
            lookup_cache: Some(Box::new(LookupCache::new())),
            debug_info: None,
            saved_errno: 0,
            max_stack_size: DEFAULT_MAX_STACK_SLOTS,
            collections: 0,
        };
        let template = process.program.statics_template().to_vec();
        let statics = process.new_value_array(&template);
        assert!(!statics.is_failure(), "heap limit too small for process setup");
        process.statics = statics;
        process
    }

    /// Build the main coroutine suspended at `entry`'s first bytecode.
    ///
    /// The stack bottom holds a null sentinel (the entry frame's pseudo
    /// frame boundary); entry functions surrender via `ProcessYield`
    /// instead of returning past it.
    pub fn setup_entry(&mut self, entry: Value) {
        self.setup_entry_with_stack(entry, DEFAULT_STACK_CAPACITY);
    }

    pub fn setup_entry_with_stack(&mut self, entry: Value, capacity: u64) {
        let stack = self.new_stack(capacity);
        assert!(!stack.is_failure(), "heap limit too small for process setup");
        // SAFETY: freshly allocated stack with at least two slots.
        unsafe {
            let mut stack_value = stack;
            let stack_ref: &mut Stack = stack_value.as_mut();
            stack_ref.set(0, self.program.null_object());
            let function: &object::Function = entry.as_ref();
            stack_ref.set(1, Value::from_bytecode_address(function.bytecode_address_for(0)));
            stack_ref.set_top(1);
        }
        let coroutine = self.new_coroutine(stack);
        assert!(!coroutine.is_failure(), "heap limit too small for process setup");
        self.coroutine = coroutine;
    }

    // ── accessors ──────────────────────────────────────────────────

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    pub fn stack_value(&self) -> Value {
        debug_assert!(self.coroutine.is_ref());
        // SAFETY: the current coroutine is always a live Coroutine.
        unsafe { self.coroutine.as_ref::<Coroutine>() }.stack
    }

    /// Overflow-poll boundary for the current stack.
    pub fn stack_limit(&self) -> *const Value {
        let stack_value = self.stack_value();
        // SAFETY: the current coroutine owns a live stack.
        let stack: &Stack = unsafe { stack_value.as_ref() };
        stack.limit_pointer().wrapping_sub(STACK_MARGIN)
    }

    pub fn statics(&self) -> Value {
        self.statics
    }

    pub fn set_max_stack_size(&mut self, slots: usize) {
        self.max_stack_size = slots;
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    // ── lookup cache ownership ─────────────────────────────────────

    pub fn take_lookup_cache(&mut self) -> Box<LookupCache> {
        self.lookup_cache.take().expect("process already interpreting")
    }

    pub fn release_lookup_cache(&mut self, cache: Box<LookupCache>) {
        debug_assert!(self.lookup_cache.is_none());
        self.lookup_cache = Some(cache);
    }

    // ── debugging ──────────────────────────────────────────────────

    pub fn ensure_debug_info(&mut self) -> &mut DebugInfo {
        self.debug_info.get_or_insert_with(DebugInfo::new)
    }

    pub fn debug_info_mut(&mut self) -> Option<&mut DebugInfo> {
        self.debug_info.as_mut()
    }

    // ── errno proxy ────────────────────────────────────────────────

    pub fn restore_errno(&self) {
        ffi::set_errno(self.saved_errno);
    }

    pub fn store_errno(&mut self) {
        self.saved_errno = ffi::errno();
    }

    // ── allocation ─────────────────────────────────────────────────

    fn allocate_object(&mut self, size: usize, object_type: ObjectType, class: Value) -> Value {
        let layout = Layout::from_size_align(size, 8).unwrap();
        match self.heap.try_allocate(layout) {
            None => object::Failure::RETRY_AFTER_GC,
            Some(raw) => {
                let ptr = raw.as_ptr();
                // SAFETY: freshly allocated, correctly sized; the class
                // word of every kind sits right after the header.
                unsafe {
                    ptr::write(ptr as *mut Header, Header::new(object_type));
                    *(ptr as *mut Value).add(1) = class;
                }
                Value::from_ptr(ptr)
            }
        }
    }

    /// Fresh instance with zeroed (smi 0) fields; the engine fills them in
    /// reverse push order before the value escapes.
    pub fn new_instance(&mut self, class: Value, immutable: bool) -> Value {
        // SAFETY: class tables only hold Class objects.
        let fields = unsafe { class.as_ref::<Class>() }.instance_fields();
        let result =
            self.allocate_object(instance_allocation_size(fields), ObjectType::Instance, class);
        if immutable && result.is_ref() {
            // SAFETY: result was just allocated.
            unsafe { result.as_ref::<Instance>() }
                .header
                .add_flag(object::HeaderFlags::IMMUTABLE);
        }
        result
    }

    pub fn new_boxed(&mut self, value: Value) -> Value {
        let class = self.program.builtin_class(BuiltinClass::Boxed);
        let mut result = self.allocate_object(size_of::<Boxed>(), ObjectType::Boxed, class);
        if result.is_ref() {
            // SAFETY: result was just allocated.
            unsafe { result.as_mut::<Boxed>() }.value = value;
        }
        result
    }

    /// A smi when the value fits, a LargeInteger otherwise.
    pub fn to_integer(&mut self, value: i64) -> Value {
        if Value::smi_fits(value) {
            return Value::from_i64(value);
        }
        let class = self.program.builtin_class(BuiltinClass::LargeInteger);
        let mut result =
            self.allocate_object(size_of::<LargeInteger>(), ObjectType::LargeInteger, class);
        if result.is_ref() {
            // SAFETY: result was just allocated.
            let boxed = unsafe { result.as_mut::<LargeInteger>() };
            boxed.header.add_flag(object::HeaderFlags::IMMUTABLE);
            boxed.value = value;
        }
        result
    }

    pub fn new_value_array(&mut self, elements: &[Value]) -> Value {
        let class = self.program.builtin_class(BuiltinClass::Array);
        let size = array_allocation_size(elements.len() as u64);
        let mut result = self.allocate_object(size, ObjectType::Array, class);
        if result.is_ref() {
            // SAFETY: result was just allocated.
            let array = unsafe { result.as_mut::<Array>() };
            array.init_length(elements.len() as u64);
            for (i, element) in elements.iter().enumerate() {
                unsafe { array.set(i as u64, *element) };
            }
        }
        result
    }

    pub fn new_stack(&mut self, capacity: u64) -> Value {
        let class = self.program.builtin_class(BuiltinClass::Stack);
        let size = stack_allocation_size(capacity);
        let mut result = self.allocate_object(size, ObjectType::Stack, class);
        if result.is_ref() {
            // SAFETY: result was just allocated; slots are zeroed.
            unsafe { result.as_mut::<Stack>() }.init(capacity);
        }
        result
    }

    pub fn new_coroutine(&mut self, stack: Value) -> Value {
        let class = self.program.builtin_class(BuiltinClass::Coroutine);
        let mut result = self.allocate_object(size_of::<Coroutine>(), ObjectType::Coroutine, class);
        if result.is_ref() {
            // SAFETY: result was just allocated.
            let result_value = result;
            let coroutine = unsafe { result.as_mut::<Coroutine>() };
            coroutine.stack = stack;
            coroutine.caller = result_value;
        }
        result
    }

    pub fn register_finalizer(&mut self, obj: Value, finalizer: FinalizerFn) {
        self.heap.register_finalizer(obj, finalizer);
    }

    // ── collection ─────────────────────────────────────────────────

    /// Mark-sweep the process heap. The caller must have flushed the
    /// engine state onto the stack first. Keeps a headroom so the
    /// allocation that triggered the collection can succeed on retry.
    pub fn collect_garbage(&mut self) {
        let Process { heap, coroutine, statics, .. } = self;
        let mut roots = ProcessRoots { coroutine, statics };
        heap.collect(&mut roots);
        self.collections += 1;
        let free = self.heap.limit().saturating_sub(self.heap.bytes_allocated());
        if free < HEAP_LOW_WATER {
            self.heap.grow_limit(HEAP_LOW_WATER);
        }
    }

    // ── stack growth ───────────────────────────────────────────────

    /// Replace the current stack with a larger copy. Returns false when the
    /// configured maximum is reached (the engine surrenders Interrupt) or
    /// the heap cannot hold the new stack.
    pub fn handle_stack_overflow(&mut self, size: usize) -> bool {
        let old_value = self.stack_value();
        // SAFETY: the current coroutine owns a live stack, with the saved
        // bytecode pointer on top.
        let (old_top, old_capacity) = unsafe {
            let stack: &Stack = old_value.as_ref();
            (stack.top(), stack.capacity())
        };
        let needed = old_top as usize + 1 + size + STACK_MARGIN;
        let new_capacity = needed.max(old_capacity as usize * 2);
        if new_capacity > self.max_stack_size {
            tracing::warn!(target: "process", new_capacity, "stack growth refused");
            return false;
        }

        let mut new_value = self.new_stack(new_capacity as u64);
        if new_value.is_retry_after_gc() {
            self.collect_garbage();
            new_value = self.new_stack(new_capacity as u64);
            if new_value.is_retry_after_gc() {
                return false;
            }
        }

        // SAFETY: both stacks are live; the old one's slots up to top are
        // initialized.
        unsafe {
            let old: &Stack = old_value.as_ref();
            let new: &mut Stack = new_value.as_mut();
            for i in 0..=old_top {
                new.set(i, old.get(i));
            }
            new.set_top(old_top);
            let mut coroutine = self.coroutine;
            coroutine.as_mut::<Coroutine>().stack = new_value;
        }
        true
    }

    // ── coroutine switching ────────────────────────────────────────

    /// Switch the current stack to `target`, recording the back-link the
    /// unwinder follows. Used by the CoroutineChange opcode.
    pub fn update_coroutine(&mut self, target: Value) {
        debug_assert!(target.is_ref());
        if target.raw() != self.coroutine.raw() {
            let mut target_value = target;
            // SAFETY: CoroutineChange operands are Coroutine objects.
            unsafe { target_value.as_mut::<Coroutine>() }.caller = self.coroutine;
        }
        self.coroutine = target;
    }

    /// Plain switch without touching caller links; the unwinder has
    /// already decided where control goes.
    pub fn unwind_to(&mut self, target: Value) {
        debug_assert!(target.is_ref());
        self.coroutine = target;
    }
}
