use crate::op::Op;

/// A forward branch whose 32-bit delta has not been resolved yet.
///
/// Branch deltas are relative to the branch opcode's own address, which is
/// where the engine's bytecode pointer still sits when it applies them.
#[derive(Debug)]
pub struct Label {
    /// Position of the i32 delta bytes in the buffer.
    offset_pos: usize,
    /// Position of the branch opcode byte (base for the delta).
    opcode_start: usize,
}

/// Assembles a bytecode byte sequence.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    // 32-bit operands are read back in host byte order.
    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    // ── loads and stores ───────────────────────────────────────────

    /// `LoadLocal n`, using the compressed encodings for n < 3.
    pub fn load_local(&mut self, n: u8) {
        match n {
            0 => self.emit_op(Op::LoadLocal0),
            1 => self.emit_op(Op::LoadLocal1),
            2 => self.emit_op(Op::LoadLocal2),
            _ => {
                self.emit_op(Op::LoadLocal);
                self.emit_u8(n);
            }
        }
    }

    pub fn load_boxed(&mut self, n: u8) {
        self.emit_op(Op::LoadBoxed);
        self.emit_u8(n);
    }

    pub fn load_static(&mut self, index: u32) {
        self.emit_op(Op::LoadStatic);
        self.emit_u32(index);
    }

    pub fn load_static_init(&mut self, index: u32) {
        self.emit_op(Op::LoadStaticInit);
        self.emit_u32(index);
    }

    pub fn load_field(&mut self, field: u8) {
        self.emit_op(Op::LoadField);
        self.emit_u8(field);
    }

    pub fn load_const(&mut self, index: u32) {
        self.emit_op(Op::LoadConst);
        self.emit_u32(index);
    }

    /// `LoadConstUnfold` with a byte delta from the opcode to the inline
    /// constant word.
    pub fn load_const_unfold(&mut self, delta: i32) {
        self.emit_op(Op::LoadConstUnfold);
        self.emit_i32(delta);
    }

    pub fn store_local(&mut self, n: u8) {
        self.emit_op(Op::StoreLocal);
        self.emit_u8(n);
    }

    pub fn store_boxed(&mut self, n: u8) {
        self.emit_op(Op::StoreBoxed);
        self.emit_u8(n);
    }

    pub fn store_static(&mut self, index: u32) {
        self.emit_op(Op::StoreStatic);
        self.emit_u32(index);
    }

    pub fn store_field(&mut self, field: u8) {
        self.emit_op(Op::StoreField);
        self.emit_u8(field);
    }

    // ── literals ───────────────────────────────────────────────────

    pub fn load_literal_null(&mut self) {
        self.emit_op(Op::LoadLiteralNull);
    }

    pub fn load_literal_true(&mut self) {
        self.emit_op(Op::LoadLiteralTrue);
    }

    pub fn load_literal_false(&mut self) {
        self.emit_op(Op::LoadLiteralFalse);
    }

    /// `LoadLiteral n`, picking the narrowest of the four encodings.
    pub fn load_literal(&mut self, n: i32) {
        match n {
            0 => self.emit_op(Op::LoadLiteral0),
            1 => self.emit_op(Op::LoadLiteral1),
            2..=255 => {
                self.emit_op(Op::LoadLiteral);
                self.emit_u8(n as u8);
            }
            _ => {
                self.emit_op(Op::LoadLiteralWide);
                self.emit_i32(n);
            }
        }
    }

    // ── invokes ────────────────────────────────────────────────────

    pub fn invoke_method(&mut self, selector: u32) {
        self.emit_op(Op::InvokeMethod);
        self.emit_u32(selector);
    }

    pub fn invoke_method_fast(&mut self, index: u32) {
        self.emit_op(Op::InvokeMethodFast);
        self.emit_u32(index);
    }

    pub fn invoke_method_vtable(&mut self, selector: u32) {
        self.emit_op(Op::InvokeMethodVtable);
        self.emit_u32(selector);
    }

    pub fn invoke_static(&mut self, index: u32) {
        self.emit_op(Op::InvokeStatic);
        self.emit_u32(index);
    }

    pub fn invoke_static_unfold(&mut self, delta: i32) {
        self.emit_op(Op::InvokeStaticUnfold);
        self.emit_i32(delta);
    }

    pub fn invoke_native(&mut self, arity: u8, native: u8) {
        self.emit_op(Op::InvokeNative);
        self.emit_u8(arity);
        self.emit_u8(native);
    }

    pub fn invoke_native_yield(&mut self, arity: u8, native: u8) {
        self.emit_op(Op::InvokeNativeYield);
        self.emit_u8(arity);
        self.emit_u8(native);
    }

    pub fn invoke_test(&mut self, selector: u32) {
        self.emit_op(Op::InvokeTest);
        self.emit_u32(selector);
    }

    pub fn invoke_test_fast(&mut self, index: u32) {
        self.emit_op(Op::InvokeTestFast);
        self.emit_u32(index);
    }

    pub fn invoke_test_vtable(&mut self, selector: u32) {
        self.emit_op(Op::InvokeTestVtable);
        self.emit_u32(selector);
    }

    /// Emit any of the builtin-selector invoke aliases (or the plain invoke
    /// opcodes) with a 32-bit operand.
    pub fn invoke_op(&mut self, op: Op, operand: u32) {
        debug_assert!(op.is_invoke_normal() || op.is_invoke_fast() || op.is_invoke_vtable());
        self.emit_op(op);
        self.emit_u32(operand);
    }

    // ── stack and control ──────────────────────────────────────────

    pub fn pop(&mut self) {
        self.emit_op(Op::Pop);
    }

    /// `Return locals args`.
    pub fn ret(&mut self, locals: u8, args: u8) {
        self.emit_op(Op::Return);
        self.emit_u8(locals);
        self.emit_u8(args);
    }

    pub fn branch(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchLong)
    }

    pub fn branch_if_true(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchIfTrueLong)
    }

    pub fn branch_if_false(&mut self) -> Label {
        self.emit_branch_placeholder(Op::BranchIfFalseLong)
    }

    /// Bind a forward branch to the current position.
    pub fn bind(&mut self, label: Label) {
        let delta = (self.buf.len() - label.opcode_start) as i32;
        self.buf[label.offset_pos..label.offset_pos + 4].copy_from_slice(&delta.to_ne_bytes());
    }

    /// Backward branch to `target` (an offset from
    /// [`current_offset`](Self::current_offset)), using the byte encoding
    /// when the distance allows.
    pub fn branch_back(&mut self, target: usize) {
        let distance = self.buf.len() - target;
        if distance <= u8::MAX as usize {
            self.emit_op(Op::BranchBack);
            self.emit_u8(distance as u8);
        } else {
            self.emit_op(Op::BranchBackLong);
            self.emit_u32(distance as u32);
        }
    }

    pub fn branch_back_if_true(&mut self, target: usize) {
        let distance = self.buf.len() - target;
        if distance <= u8::MAX as usize {
            self.emit_op(Op::BranchBackIfTrue);
            self.emit_u8(distance as u8);
        } else {
            self.emit_op(Op::BranchBackIfTrueLong);
            self.emit_u32(distance as u32);
        }
    }

    pub fn branch_back_if_false(&mut self, target: usize) {
        let distance = self.buf.len() - target;
        if distance <= u8::MAX as usize {
            self.emit_op(Op::BranchBackIfFalse);
            self.emit_u8(distance as u8);
        } else {
            self.emit_op(Op::BranchBackIfFalseLong);
            self.emit_u32(distance as u32);
        }
    }

    pub fn pop_and_branch(&mut self, pop_count: u8) -> Label {
        let opcode_start = self.buf.len();
        self.emit_op(Op::PopAndBranchLong);
        self.emit_u8(pop_count);
        let offset_pos = self.buf.len();
        self.emit_i32(0);
        Label { offset_pos, opcode_start }
    }

    pub fn pop_and_branch_back(&mut self, pop_count: u8, target: usize) {
        let distance = self.buf.len() - target;
        self.emit_op(Op::PopAndBranchBackLong);
        self.emit_u8(pop_count);
        self.emit_u32(distance as u32);
    }

    // ── allocation ─────────────────────────────────────────────────

    pub fn allocate(&mut self, class_index: u32) {
        self.emit_op(Op::Allocate);
        self.emit_u32(class_index);
    }

    pub fn allocate_immutable(&mut self, class_index: u32) {
        self.emit_op(Op::AllocateImmutable);
        self.emit_u32(class_index);
    }

    pub fn allocate_boxed(&mut self) {
        self.emit_op(Op::AllocateBoxed);
    }

    // ── the rest ───────────────────────────────────────────────────

    pub fn negate(&mut self) {
        self.emit_op(Op::Negate);
    }

    pub fn stack_overflow_check(&mut self, size: u32) {
        self.emit_op(Op::StackOverflowCheck);
        self.emit_u32(size);
    }

    pub fn throw(&mut self) {
        self.emit_op(Op::Throw);
    }

    /// Raw `SubroutineCall delta return_delta`; both deltas are relative to
    /// the opcode's own address the way the engine applies them.
    pub fn subroutine_call(&mut self, delta: i32, return_delta: i32) {
        self.emit_op(Op::SubroutineCall);
        self.emit_i32(delta);
        self.emit_i32(return_delta);
    }

    pub fn subroutine_return(&mut self) {
        self.emit_op(Op::SubroutineReturn);
    }

    pub fn process_yield(&mut self) {
        self.emit_op(Op::ProcessYield);
    }

    pub fn coroutine_change(&mut self) {
        self.emit_op(Op::CoroutineChange);
    }

    pub fn identical(&mut self) {
        self.emit_op(Op::Identical);
    }

    pub fn identical_non_numeric(&mut self) {
        self.emit_op(Op::IdenticalNonNumeric);
    }

    pub fn enter_no_such_method(&mut self) {
        self.emit_op(Op::EnterNoSuchMethod);
    }

    pub fn exit_no_such_method(&mut self) {
        self.emit_op(Op::ExitNoSuchMethod);
    }

    pub fn frame_size(&mut self, slots: u8) {
        self.emit_op(Op::FrameSize);
        self.emit_u8(slots);
    }

    pub fn method_end(&mut self) {
        self.emit_op(Op::MethodEnd);
    }

    fn emit_branch_placeholder(&mut self, op: Op) -> Label {
        let opcode_start = self.buf.len();
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i32(0); // placeholder
        Label { offset_pos, opcode_start }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
