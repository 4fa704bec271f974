/// Operand layout of an opcode. One byte of tag followed by 0–8 operand
/// bytes; 32-bit operands are read in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    Plain,
    /// One u8 operand.
    Byte,
    /// One 32-bit operand.
    Int32,
    /// Two u8 operands.
    ByteByte,
    /// A u8 operand followed by a 32-bit operand.
    ByteInt32,
    /// Two 32-bit operands.
    Int32Int32,
}

/// Static description of one opcode: everything the decoder, the
/// disassembler and the stack walker need to know about it.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    /// Whether the opcode can transfer control away from the next byte.
    pub branching: bool,
    pub format: Format,
    /// Encoded length in bytes, tag included.
    pub length: usize,
    /// Net operand-stack effect, or [`VARIES`] when it depends on operands.
    pub stack_diff: i8,
    pub printable: &'static str,
}

/// Stack-diff sentinel for opcodes whose effect depends on their operands
/// (invokes, returns, allocations).
pub const VARIES: i8 = i8::MIN;

macro_rules! define_opcodes {
    ($(($name:ident, $branching:expr, $format:ident, $length:expr, $diff:expr, $printable:expr)),* $(,)?) => {
        /// Bytecode opcodes. Every invoke variant is exactly five bytes
        /// (tag + 32-bit operand) so the no-such-method trampoline can
        /// decode the invoke site from a return address alone.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Op {
            $($name),*
        }

        impl Op {
            pub const COUNT: usize = [$(Op::$name),*].len();

            const INFO: [OpInfo; Op::COUNT] = [
                $(OpInfo {
                    branching: $branching,
                    format: Format::$format,
                    length: $length,
                    stack_diff: $diff,
                    printable: $printable,
                }),*
            ];
        }
    };
}

define_opcodes! {
    (LoadLocal0,              false, Plain,      1,  1,      "load local 0"),
    (LoadLocal1,              false, Plain,      1,  1,      "load local 1"),
    (LoadLocal2,              false, Plain,      1,  1,      "load local 2"),
    (LoadLocal,               false, Byte,       2,  1,      "load local"),
    (LoadBoxed,               false, Byte,       2,  1,      "load boxed"),
    (LoadStatic,              false, Int32,      5,  1,      "load static"),
    (LoadStaticInit,          false, Int32,      5,  1,      "load static init"),
    (LoadField,               false, Byte,       2,  0,      "load field"),
    (LoadConst,               false, Int32,      5,  1,      "load const"),
    (LoadConstUnfold,         false, Int32,      5,  1,      "load const @"),
    (StoreLocal,              false, Byte,       2,  0,      "store local"),
    (StoreBoxed,              false, Byte,       2,  0,      "store boxed"),
    (StoreStatic,             false, Int32,      5,  0,      "store static"),
    (StoreField,              false, Byte,       2, -1,      "store field"),
    (LoadLiteralNull,         false, Plain,      1,  1,      "load literal null"),
    (LoadLiteralTrue,         false, Plain,      1,  1,      "load literal true"),
    (LoadLiteralFalse,        false, Plain,      1,  1,      "load literal false"),
    (LoadLiteral0,            false, Plain,      1,  1,      "load literal 0"),
    (LoadLiteral1,            false, Plain,      1,  1,      "load literal 1"),
    (LoadLiteral,             false, Byte,       2,  1,      "load literal"),
    (LoadLiteralWide,         false, Int32,      5,  1,      "load literal wide"),
    (InvokeMethod,            true,  Int32,      5,  VARIES, "invoke method"),
    (InvokeMethodFast,        true,  Int32,      5,  VARIES, "invoke fast"),
    (InvokeMethodVtable,      true,  Int32,      5,  VARIES, "invoke vtable"),
    (InvokeStatic,            true,  Int32,      5,  VARIES, "invoke static"),
    (InvokeStaticUnfold,      true,  Int32,      5,  VARIES, "invoke static @"),
    (InvokeFactory,           true,  Int32,      5,  VARIES, "invoke factory"),
    (InvokeFactoryUnfold,     true,  Int32,      5,  VARIES, "invoke factory @"),
    (InvokeNative,            true,  ByteByte,   3,  VARIES, "invoke native"),
    (InvokeNativeYield,       true,  ByteByte,   3,  VARIES, "invoke native yield"),
    (InvokeTest,              false, Int32,      5,  0,      "invoke test"),
    (InvokeTestFast,          false, Int32,      5,  0,      "invoke test fast"),
    (InvokeTestVtable,        false, Int32,      5,  0,      "invoke test vtable"),
    (InvokeEq,                true,  Int32,      5, -1,      "invoke eq"),
    (InvokeLt,                true,  Int32,      5, -1,      "invoke lt"),
    (InvokeLe,                true,  Int32,      5, -1,      "invoke le"),
    (InvokeGt,                true,  Int32,      5, -1,      "invoke gt"),
    (InvokeGe,                true,  Int32,      5, -1,      "invoke ge"),
    (InvokeAdd,               true,  Int32,      5, -1,      "invoke add"),
    (InvokeSub,               true,  Int32,      5, -1,      "invoke sub"),
    (InvokeMod,               true,  Int32,      5, -1,      "invoke mod"),
    (InvokeMul,               true,  Int32,      5, -1,      "invoke mul"),
    (InvokeTruncDiv,          true,  Int32,      5, -1,      "invoke trunc div"),
    (InvokeBitNot,            true,  Int32,      5,  0,      "invoke bit not"),
    (InvokeBitAnd,            true,  Int32,      5, -1,      "invoke bit and"),
    (InvokeBitOr,             true,  Int32,      5, -1,      "invoke bit or"),
    (InvokeBitXor,            true,  Int32,      5, -1,      "invoke bit xor"),
    (InvokeBitShr,            true,  Int32,      5, -1,      "invoke bit shr"),
    (InvokeBitShl,            true,  Int32,      5, -1,      "invoke bit shl"),
    (InvokeEqFast,            true,  Int32,      5, -1,      "invoke eq fast"),
    (InvokeLtFast,            true,  Int32,      5, -1,      "invoke lt fast"),
    (InvokeLeFast,            true,  Int32,      5, -1,      "invoke le fast"),
    (InvokeGtFast,            true,  Int32,      5, -1,      "invoke gt fast"),
    (InvokeGeFast,            true,  Int32,      5, -1,      "invoke ge fast"),
    (InvokeAddFast,           true,  Int32,      5, -1,      "invoke add fast"),
    (InvokeSubFast,           true,  Int32,      5, -1,      "invoke sub fast"),
    (InvokeModFast,           true,  Int32,      5, -1,      "invoke mod fast"),
    (InvokeMulFast,           true,  Int32,      5, -1,      "invoke mul fast"),
    (InvokeTruncDivFast,      true,  Int32,      5, -1,      "invoke trunc div fast"),
    (InvokeBitNotFast,        true,  Int32,      5,  0,      "invoke bit not fast"),
    (InvokeBitAndFast,        true,  Int32,      5, -1,      "invoke bit and fast"),
    (InvokeBitOrFast,         true,  Int32,      5, -1,      "invoke bit or fast"),
    (InvokeBitXorFast,        true,  Int32,      5, -1,      "invoke bit xor fast"),
    (InvokeBitShrFast,        true,  Int32,      5, -1,      "invoke bit shr fast"),
    (InvokeBitShlFast,        true,  Int32,      5, -1,      "invoke bit shl fast"),
    (InvokeEqVtable,          true,  Int32,      5, -1,      "invoke eq vtable"),
    (InvokeLtVtable,          true,  Int32,      5, -1,      "invoke lt vtable"),
    (InvokeLeVtable,          true,  Int32,      5, -1,      "invoke le vtable"),
    (InvokeGtVtable,          true,  Int32,      5, -1,      "invoke gt vtable"),
    (InvokeGeVtable,          true,  Int32,      5, -1,      "invoke ge vtable"),
    (InvokeAddVtable,         true,  Int32,      5, -1,      "invoke add vtable"),
    (InvokeSubVtable,         true,  Int32,      5, -1,      "invoke sub vtable"),
    (InvokeModVtable,         true,  Int32,      5, -1,      "invoke mod vtable"),
    (InvokeMulVtable,         true,  Int32,      5, -1,      "invoke mul vtable"),
    (InvokeTruncDivVtable,    true,  Int32,      5, -1,      "invoke trunc div vtable"),
    (InvokeBitNotVtable,      true,  Int32,      5,  0,      "invoke bit not vtable"),
    (InvokeBitAndVtable,      true,  Int32,      5, -1,      "invoke bit and vtable"),
    (InvokeBitOrVtable,       true,  Int32,      5, -1,      "invoke bit or vtable"),
    (InvokeBitXorVtable,      true,  Int32,      5, -1,      "invoke bit xor vtable"),
    (InvokeBitShrVtable,      true,  Int32,      5, -1,      "invoke bit shr vtable"),
    (InvokeBitShlVtable,      true,  Int32,      5, -1,      "invoke bit shl vtable"),
    (Pop,                     false, Plain,      1, -1,      "pop"),
    (Return,                  true,  ByteByte,   3,  VARIES, "return"),
    (BranchLong,              true,  Int32,      5,  0,      "branch +"),
    (BranchIfTrueLong,        true,  Int32,      5, -1,      "branch if true +"),
    (BranchIfFalseLong,       true,  Int32,      5, -1,      "branch if false +"),
    (BranchBack,              true,  Byte,       2,  0,      "branch -"),
    (BranchBackIfTrue,        true,  Byte,       2, -1,      "branch if true -"),
    (BranchBackIfFalse,       true,  Byte,       2, -1,      "branch if false -"),
    (BranchBackLong,          true,  Int32,      5,  0,      "branch long -"),
    (BranchBackIfTrueLong,    true,  Int32,      5, -1,      "branch if true long -"),
    (BranchBackIfFalseLong,   true,  Int32,      5, -1,      "branch if false long -"),
    (PopAndBranchLong,        true,  ByteInt32,  6,  VARIES, "pop and branch +"),
    (PopAndBranchBackLong,    true,  ByteInt32,  6,  VARIES, "pop and branch -"),
    (Allocate,                false, Int32,      5,  VARIES, "allocate"),
    (AllocateUnfold,          false, Int32,      5,  VARIES, "allocate @"),
    (AllocateImmutable,       false, Int32,      5,  VARIES, "allocate immutable"),
    (AllocateImmutableUnfold, false, Int32,      5,  VARIES, "allocate immutable @"),
    (AllocateBoxed,           false, Plain,      1,  0,      "allocate boxed"),
    (Negate,                  false, Plain,      1,  0,      "negate"),
    (StackOverflowCheck,      true,  Int32,      5,  0,      "stack overflow check"),
    (Throw,                   true,  Plain,      1,  0,      "throw"),
    (SubroutineCall,          true,  Int32Int32, 9,  1,      "subroutine call"),
    (SubroutineReturn,        true,  Plain,      1, -1,      "subroutine return"),
    (ProcessYield,            true,  Plain,      1,  0,      "process yield"),
    (CoroutineChange,         true,  Plain,      1, -1,      "coroutine change"),
    (Identical,               false, Plain,      1, -1,      "identical"),
    (IdenticalNonNumeric,     false, Plain,      1, -1,      "identical non numeric"),
    (EnterNoSuchMethod,       false, Plain,      1,  3,      "enter noSuchMethod"),
    (ExitNoSuchMethod,        true,  Plain,      1,  VARIES, "exit noSuchMethod"),
    (FrameSize,               false, Byte,       2,  0,      "frame size"),
    (MethodEnd,               false, Plain,      1,  0,      "method end"),
}

impl Op {
    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!((byte as usize) < Self::COUNT, "invalid opcode: 0x{byte:02x}");
        core::mem::transmute::<u8, Op>(byte)
    }

    #[inline(always)]
    pub fn info(self) -> &'static OpInfo {
        &Self::INFO[self as usize]
    }

    #[inline(always)]
    pub fn length(self) -> usize {
        self.info().length
    }

    /// Whether this is a cache-dispatched invoke (including the builtin
    /// selector aliases).
    #[inline(always)]
    pub fn is_invoke_normal(self) -> bool {
        self == Op::InvokeMethod
            || (self as u8 >= Op::InvokeEq as u8 && self as u8 <= Op::InvokeBitShl as u8)
    }

    /// Whether this is a dispatch-table invoke.
    #[inline(always)]
    pub fn is_invoke_fast(self) -> bool {
        self == Op::InvokeMethodFast
            || (self as u8 >= Op::InvokeEqFast as u8 && self as u8 <= Op::InvokeBitShlFast as u8)
    }

    /// Whether this is a vtable invoke.
    #[inline(always)]
    pub fn is_invoke_vtable(self) -> bool {
        self == Op::InvokeMethodVtable
            || (self as u8 >= Op::InvokeEqVtable as u8
                && self as u8 <= Op::InvokeBitShlVtable as u8)
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
