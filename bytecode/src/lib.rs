mod builder;
mod decoder;
mod instruction;
mod op;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::BytecodeDecoder;
pub use instruction::{Instruction, Operands};
pub use op::{Format, Op, OpInfo, VARIES};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes).map(|(_, i)| i).collect()
    }

    #[test]
    fn load_store_round_trip() {
        let mut b = BytecodeBuilder::new();
        b.load_local(0);
        b.load_local(2);
        b.load_local(9);
        b.load_boxed(3);
        b.load_static(40);
        b.load_field(1);
        b.store_local(9);
        b.store_field(1);
        b.pop();
        b.ret(2, 1);

        assert_eq!(
            decode_all(b.as_bytes()),
            vec![
                Instruction { op: Op::LoadLocal0, operands: Operands::None },
                Instruction { op: Op::LoadLocal2, operands: Operands::None },
                Instruction { op: Op::LoadLocal, operands: Operands::Byte(9) },
                Instruction { op: Op::LoadBoxed, operands: Operands::Byte(3) },
                Instruction { op: Op::LoadStatic, operands: Operands::Int32(40) },
                Instruction { op: Op::LoadField, operands: Operands::Byte(1) },
                Instruction { op: Op::StoreLocal, operands: Operands::Byte(9) },
                Instruction { op: Op::StoreField, operands: Operands::Byte(1) },
                Instruction { op: Op::Pop, operands: Operands::None },
                Instruction { op: Op::Return, operands: Operands::ByteByte(2, 1) },
            ]
        );
    }

    #[test]
    fn literal_encoding_narrows() {
        let mut b = BytecodeBuilder::new();
        b.load_literal(0);
        b.load_literal(1);
        b.load_literal(200);
        b.load_literal(70_000);
        b.load_literal(-1);

        assert_eq!(
            decode_all(b.as_bytes()),
            vec![
                Instruction { op: Op::LoadLiteral0, operands: Operands::None },
                Instruction { op: Op::LoadLiteral1, operands: Operands::None },
                Instruction { op: Op::LoadLiteral, operands: Operands::Byte(200) },
                Instruction { op: Op::LoadLiteralWide, operands: Operands::Int32(70_000) },
                Instruction { op: Op::LoadLiteralWide, operands: Operands::Int32(-1) },
            ]
        );
    }

    #[test]
    fn forward_branch_is_opcode_relative() {
        let mut b = BytecodeBuilder::new();
        b.load_literal_true();
        let label = b.branch_if_false();
        b.load_literal(7);
        b.bind(label);
        b.ret(0, 0);

        // The branch opcode sits at offset 1; the bound target is at
        // offset 8 (after the two-byte LoadLiteral), so the delta is 7.
        assert_eq!(
            decode_all(b.as_bytes()),
            vec![
                Instruction { op: Op::LoadLiteralTrue, operands: Operands::None },
                Instruction { op: Op::BranchIfFalseLong, operands: Operands::Int32(7) },
                Instruction { op: Op::LoadLiteral, operands: Operands::Byte(7) },
                Instruction { op: Op::Return, operands: Operands::ByteByte(0, 0) },
            ]
        );
    }

    #[test]
    fn backward_branch_picks_narrow_encoding() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.load_local(0);
        b.branch_back(top);
        assert_eq!(
            decode_all(b.as_bytes()),
            vec![
                Instruction { op: Op::LoadLocal0, operands: Operands::None },
                Instruction { op: Op::BranchBack, operands: Operands::Byte(1) },
            ]
        );
    }

    #[test]
    fn backward_branch_long_when_distant() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        for _ in 0..300 {
            b.load_local(0);
        }
        b.branch_back(top);
        let last = decode_all(b.as_bytes()).pop().unwrap();
        assert_eq!(last, Instruction { op: Op::BranchBackLong, operands: Operands::Int32(300) });
    }

    #[test]
    fn invoke_forms() {
        let mut b = BytecodeBuilder::new();
        b.invoke_method(0xCAFE);
        b.invoke_method_fast(12);
        b.invoke_method_vtable(0xCAFE);
        b.invoke_static(3);
        b.invoke_native(2, 7);
        b.invoke_op(Op::InvokeAdd, 0xCAFE);

        assert_eq!(
            decode_all(b.as_bytes()),
            vec![
                Instruction { op: Op::InvokeMethod, operands: Operands::Int32(0xCAFE) },
                Instruction { op: Op::InvokeMethodFast, operands: Operands::Int32(12) },
                Instruction { op: Op::InvokeMethodVtable, operands: Operands::Int32(0xCAFE) },
                Instruction { op: Op::InvokeStatic, operands: Operands::Int32(3) },
                Instruction { op: Op::InvokeNative, operands: Operands::ByteByte(2, 7) },
                Instruction { op: Op::InvokeAdd, operands: Operands::Int32(0xCAFE) },
            ]
        );
    }

    #[test]
    fn subroutine_operands() {
        let mut b = BytecodeBuilder::new();
        b.subroutine_call(20, -4);
        assert_eq!(
            decode_all(b.as_bytes()),
            vec![Instruction { op: Op::SubroutineCall, operands: Operands::Int32Int32(20, -4) }]
        );
    }

    #[test]
    fn disassembly_lines() {
        let mut b = BytecodeBuilder::new();
        b.load_literal(5);
        b.invoke_method(66);
        b.ret(0, 1);
        let text = BytecodeDecoder::disassemble(b.as_bytes());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("load literal 5"));
        assert!(lines[1].contains("invoke method 66"));
        assert!(lines[2].contains("return 0 1"));
    }

    #[test]
    fn truncated_stream_stops_cleanly() {
        let mut b = BytecodeBuilder::new();
        b.invoke_method(1);
        let mut bytes = b.into_bytes();
        bytes.truncate(3);
        assert!(decode_all(&bytes).is_empty());
    }
}
