//! Bytecode instructions for the Melee VM
//!
//! Every instruction is a one-byte opcode followed by fixed-width big-endian
//! operands. The widths for each opcode are declared once in
//! [`OpCode::operand_widths`].

use std::fmt;
use std::rc::Rc;

use crate::token::Span;
use crate::value::Value;

/// An immutable, finalized instruction stream
pub type Instructions = Rc<[u8]>;

/// Source span of each instruction byte, parallel to [`Instructions`]
pub type Spans = Rc<[Span]>;

/// Opcodes for the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // Literals
    Const,
    True,
    False,
    Null,

    // Arithmetic and logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Bang,
    Minus,
    And,
    Or,

    // Comparison
    Eq,
    NotEq,
    Gt,
    Gte,

    // Data structures
    Array,
    Len,
    Index,
    SetIndex,

    // Variables
    SetGlobal,
    GetGlobal,
    Set,
    Get,
    SetFree,
    GetFree,
    GetNative,
    SelfRef,

    // Control flow
    Jmp,
    JmpIfNot,
    Call,
    Ret,

    Closure,

    // Music
    Note,
    Skip,
    Cc,
    Yield,
    Next,
    IsSeq,

    Pop,
    Halt,
    NotImplemented,
}

const ALL_OPCODES: [OpCode; 43] = [
    OpCode::Const,
    OpCode::True,
    OpCode::False,
    OpCode::Null,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Bang,
    OpCode::Minus,
    OpCode::And,
    OpCode::Or,
    OpCode::Eq,
    OpCode::NotEq,
    OpCode::Gt,
    OpCode::Gte,
    OpCode::Array,
    OpCode::Len,
    OpCode::Index,
    OpCode::SetIndex,
    OpCode::SetGlobal,
    OpCode::GetGlobal,
    OpCode::Set,
    OpCode::Get,
    OpCode::SetFree,
    OpCode::GetFree,
    OpCode::GetNative,
    OpCode::SelfRef,
    OpCode::Jmp,
    OpCode::JmpIfNot,
    OpCode::Call,
    OpCode::Ret,
    OpCode::Closure,
    OpCode::Note,
    OpCode::Skip,
    OpCode::Cc,
    OpCode::Yield,
    OpCode::Next,
    OpCode::IsSeq,
    OpCode::Pop,
    OpCode::Halt,
    OpCode::NotImplemented,
];

impl OpCode {
    /// Decode an opcode byte
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        let op = *ALL_OPCODES.get(byte as usize)?;
        (op as u8 == byte).then_some(op)
    }

    /// Byte width of each operand, in order
    pub fn operand_widths(self) -> &'static [usize] {
        match self {
            OpCode::Const
            | OpCode::Array
            | OpCode::SetGlobal
            | OpCode::GetGlobal
            | OpCode::Jmp
            | OpCode::JmpIfNot => &[2],
            OpCode::Set
            | OpCode::Get
            | OpCode::SetFree
            | OpCode::GetFree
            | OpCode::GetNative
            | OpCode::Call => &[1],
            OpCode::Closure => &[2, 1],
            _ => &[],
        }
    }

    /// Total encoded size of an instruction with this opcode
    pub fn size(self) -> usize {
        1 + self.operand_widths().iter().sum::<usize>()
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Const => "CONST",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Null => "NULL",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Bang => "BANG",
            OpCode::Minus => "MINUS",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Eq => "EQ",
            OpCode::NotEq => "NOT_EQ",
            OpCode::Gt => "GT",
            OpCode::Gte => "GTE",
            OpCode::Array => "ARRAY",
            OpCode::Len => "LEN",
            OpCode::Index => "INDEX",
            OpCode::SetIndex => "SET_INDEX",
            OpCode::SetGlobal => "SETG",
            OpCode::GetGlobal => "GETG",
            OpCode::Set => "SET",
            OpCode::Get => "GET",
            OpCode::SetFree => "SETC",
            OpCode::GetFree => "GETC",
            OpCode::GetNative => "GETN",
            OpCode::SelfRef => "SELF",
            OpCode::Jmp => "JMP",
            OpCode::JmpIfNot => "JMP_IF_NOT",
            OpCode::Call => "CALL",
            OpCode::Ret => "RET",
            OpCode::Closure => "CLOSURE",
            OpCode::Note => "NOTE",
            OpCode::Skip => "SKIP",
            OpCode::Cc => "CC",
            OpCode::Yield => "YIELD",
            OpCode::Next => "NEXT",
            OpCode::IsSeq => "IS_SEQ",
            OpCode::Pop => "POP",
            OpCode::Halt => "HALT",
            OpCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Encode `value` into `width` big-endian bytes
pub fn pack_big_endian(value: usize, width: usize) -> Vec<u8> {
    (0..width)
        .rev()
        .map(|i| ((value >> (8 * i)) & 0xFF) as u8)
        .collect()
}

/// Decode a big-endian unsigned integer
pub fn unpack_big_endian(bytes: &[u8]) -> usize {
    bytes.iter().fold(0, |acc, &b| (acc << 8) | b as usize)
}

/// Encode one instruction. Missing operands encode as zero, extra ones are ignored.
pub fn create_instruction(op: OpCode, operands: &[usize]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(op.size());
    bytes.push(op.into());
    for (i, width) in op.operand_widths().iter().enumerate() {
        let operand = operands.get(i).copied().unwrap_or(0);
        bytes.extend(pack_big_endian(operand, *width));
    }
    bytes
}

/// Decode the operands of `op` from the bytes following the opcode.
/// Returns the operands and the number of bytes consumed.
pub fn read_operands(op: OpCode, bytes: &[u8]) -> Option<(Vec<usize>, usize)> {
    let mut offset = 0;
    let mut operands = Vec::with_capacity(op.operand_widths().len());
    for width in op.operand_widths() {
        let slice = bytes.get(offset..offset + width)?;
        operands.push(unpack_big_endian(slice));
        offset += width;
    }
    Some((operands, offset))
}

/// Render a human-readable listing: one `address MNEMONIC operands` line per instruction
pub fn disassemble(instructions: &[u8]) -> String {
    let mut out = String::new();
    let mut offset = 0;

    while offset < instructions.len() {
        let byte = instructions[offset];
        let Some(op) = OpCode::from_byte(byte) else {
            out.push_str(&format!("{:04} <unknown opcode {}>\n", offset, byte));
            offset += 1;
            continue;
        };
        match read_operands(op, &instructions[offset + 1..]) {
            Some((operands, read)) => {
                out.push_str(&format!("{:04} {}", offset, op.mnemonic()));
                for operand in operands {
                    out.push_str(&format!(" {}", operand));
                }
                out.push('\n');
                offset += 1 + read;
            }
            None => {
                out.push_str(&format!("{:04} {} <truncated>\n", offset, op.mnemonic()));
                break;
            }
        }
    }

    out
}

/// Output of one top-level compilation: the instructions to run and the
/// constant pool as it stood afterwards.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub spans: Spans,
    pub constants: Rc<[Value]>,
}

impl Bytecode {
    /// Listing of the top-level code followed by every compiled callable in the pool
    pub fn disassemble(&self) -> String {
        let mut out = format!("== <main> ==\n{}", disassemble(&self.instructions));
        for (index, constant) in self.constants.iter().enumerate() {
            if let Value::Callable(callable) = constant {
                out.push_str(&format!(
                    "== {:04} {} ==\n{}",
                    index,
                    callable.repr,
                    disassemble(&callable.instructions)
                ));
            }
        }
        out
    }
}

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.disassemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_opcode_table_matches_discriminants() {
        for byte in 0..=OpCode::NotImplemented as u8 {
            let op = OpCode::from_byte(byte).expect("every discriminant decodes");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(OpCode::from_byte(200), None);
    }

    #[test]
    fn test_pack_unpack() {
        for width in [1, 2] {
            let max = (1usize << (8 * width)) - 1;
            for value in [0, 1, 127, 255, max / 2, max] {
                if value > max {
                    continue;
                }
                let packed = pack_big_endian(value, width);
                assert_eq!(packed.len(), width);
                assert_eq!(unpack_big_endian(&packed), value);
            }
        }
        assert_eq!(pack_big_endian(65534, 2), vec![0xFF, 0xFE]);
    }

    #[test]
    fn test_create_instruction() {
        assert_eq!(create_instruction(OpCode::Const, &[65534]), vec![OpCode::Const as u8, 255, 254]);
        assert_eq!(create_instruction(OpCode::Get, &[255]), vec![OpCode::Get as u8, 255]);
        assert_eq!(
            create_instruction(OpCode::Closure, &[65534, 255]),
            vec![OpCode::Closure as u8, 255, 254, 255]
        );
        assert_eq!(create_instruction(OpCode::Add, &[]), vec![OpCode::Add as u8]);
    }

    #[test]
    fn test_disassemble() {
        let mut bytes = Vec::new();
        bytes.extend(create_instruction(OpCode::Const, &[1]));
        bytes.extend(create_instruction(OpCode::Get, &[3]));
        bytes.extend(create_instruction(OpCode::Closure, &[2, 1]));
        bytes.extend(create_instruction(OpCode::JmpIfNot, &[300]));
        bytes.extend(create_instruction(OpCode::Add, &[]));

        let expected = "\
0000 CONST 1
0003 GET 3
0005 CLOSURE 2 1
0009 JMP_IF_NOT 300
0012 ADD
";
        assert_eq!(disassemble(&bytes), expected);
    }

    #[test]
    fn test_disassemble_recovers_every_opcode() {
        for byte in 0..=OpCode::NotImplemented as u8 {
            let op = OpCode::from_byte(byte).unwrap();
            let operands: Vec<usize> = op.operand_widths().iter().map(|w| w * 7).collect();
            let listing = disassemble(&create_instruction(op, &operands));
            let mut expected = format!("0000 {}", op.mnemonic());
            for operand in &operands {
                expected.push_str(&format!(" {}", operand));
            }
            expected.push('\n');
            assert_eq!(listing, expected);
        }
    }
}
