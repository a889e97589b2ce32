//! Opcode enumeration, operand layouts and instruction sizes
//!
//! Every opcode has a fixed operand encoding and therefore a fixed
//! instruction size; the dispatch loop advances the instruction pointer by
//! [`OpCode::code_size`] (control flow reloads it instead). The
//! [`disassemble`] walker decodes a code section into `(offset, opcode,
//! operands)` triples for the inspect tooling and the debugger.

use std::fmt;

/// Kind of one encoded operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Register index, one byte
    Reg,
    /// 8-bit immediate
    Val8,
    /// 16-bit immediate
    Val16,
    /// 32-bit immediate
    Val32,
    /// 64-bit immediate
    Val64,
    /// Memory address tuple `(base, offset_reg, factor, term)`, four bytes
    Mem,
    /// 32-bit signed code offset
    Off32,
}

impl OperandKind {
    /// Encoded size in bytes
    pub fn size(self) -> u64 {
        match self {
            OperandKind::Reg | OperandKind::Val8 => 1,
            OperandKind::Val16 => 2,
            OperandKind::Val32 | OperandKind::Mem | OperandKind::Off32 => 4,
            OperandKind::Val64 => 8,
        }
    }
}

macro_rules! opcodes {
    ($(($name:ident, $text:literal, [$($operand:ident),*])),* $(,)?) => {
        /// All VM opcodes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        #[allow(non_camel_case_types, missing_docs)]
        pub enum OpCode {
            $($name),*
        }

        /// Opcodes in encoding order
        pub const OPCODE_TABLE: &[OpCode] = &[$(OpCode::$name),*];

        impl OpCode {
            /// Mnemonic
            pub fn name(self) -> &'static str {
                match self {
                    $(OpCode::$name => $text),*
                }
            }

            /// Operand layout
            pub fn layout(self) -> &'static [OperandKind] {
                match self {
                    $(OpCode::$name => &[$(OperandKind::$operand),*]),*
                }
            }
        }
    };
}

opcodes! {
    // Calls and returns
    (call, "call", [Off32, Reg]),
    (icallr, "icallr", [Reg, Reg]),
    (icallm, "icallm", [Mem, Reg]),
    (ret, "ret", []),
    (cfng, "cfng", [Reg, Val16]),
    (cbltn, "cbltn", [Reg, Val16]),
    (terminate, "terminate", []),

    // Moves
    (mov64RR, "mov64RR", [Reg, Reg]),
    (mov64RV, "mov64RV", [Reg, Val64]),
    (mov8MR, "mov8MR", [Mem, Reg]),
    (mov16MR, "mov16MR", [Mem, Reg]),
    (mov32MR, "mov32MR", [Mem, Reg]),
    (mov64MR, "mov64MR", [Mem, Reg]),
    (mov8RM, "mov8RM", [Reg, Mem]),
    (mov16RM, "mov16RM", [Reg, Mem]),
    (mov32RM, "mov32RM", [Reg, Mem]),
    (mov64RM, "mov64RM", [Reg, Mem]),

    // Conditional moves
    (cmove64RR, "cmove64RR", [Reg, Reg]),
    (cmove64RV, "cmove64RV", [Reg, Val64]),
    (cmove8RM, "cmove8RM", [Reg, Mem]),
    (cmove16RM, "cmove16RM", [Reg, Mem]),
    (cmove32RM, "cmove32RM", [Reg, Mem]),
    (cmove64RM, "cmove64RM", [Reg, Mem]),
    (cmovne64RR, "cmovne64RR", [Reg, Reg]),
    (cmovne64RV, "cmovne64RV", [Reg, Val64]),
    (cmovne8RM, "cmovne8RM", [Reg, Mem]),
    (cmovne16RM, "cmovne16RM", [Reg, Mem]),
    (cmovne32RM, "cmovne32RM", [Reg, Mem]),
    (cmovne64RM, "cmovne64RM", [Reg, Mem]),
    (cmovl64RR, "cmovl64RR", [Reg, Reg]),
    (cmovl64RV, "cmovl64RV", [Reg, Val64]),
    (cmovl8RM, "cmovl8RM", [Reg, Mem]),
    (cmovl16RM, "cmovl16RM", [Reg, Mem]),
    (cmovl32RM, "cmovl32RM", [Reg, Mem]),
    (cmovl64RM, "cmovl64RM", [Reg, Mem]),
    (cmovle64RR, "cmovle64RR", [Reg, Reg]),
    (cmovle64RV, "cmovle64RV", [Reg, Val64]),
    (cmovle8RM, "cmovle8RM", [Reg, Mem]),
    (cmovle16RM, "cmovle16RM", [Reg, Mem]),
    (cmovle32RM, "cmovle32RM", [Reg, Mem]),
    (cmovle64RM, "cmovle64RM", [Reg, Mem]),
    (cmovg64RR, "cmovg64RR", [Reg, Reg]),
    (cmovg64RV, "cmovg64RV", [Reg, Val64]),
    (cmovg8RM, "cmovg8RM", [Reg, Mem]),
    (cmovg16RM, "cmovg16RM", [Reg, Mem]),
    (cmovg32RM, "cmovg32RM", [Reg, Mem]),
    (cmovg64RM, "cmovg64RM", [Reg, Mem]),
    (cmovge64RR, "cmovge64RR", [Reg, Reg]),
    (cmovge64RV, "cmovge64RV", [Reg, Val64]),
    (cmovge8RM, "cmovge8RM", [Reg, Mem]),
    (cmovge16RM, "cmovge16RM", [Reg, Mem]),
    (cmovge32RM, "cmovge32RM", [Reg, Mem]),
    (cmovge64RM, "cmovge64RM", [Reg, Mem]),

    // Stack pointer manipulation and address computation
    (lincsp, "lincsp", [Reg, Val16]),
    (lea, "lea", [Reg, Mem]),

    // Jumps
    (jmp, "jmp", [Off32]),
    (je, "je", [Off32]),
    (jne, "jne", [Off32]),
    (jl, "jl", [Off32]),
    (jle, "jle", [Off32]),
    (jg, "jg", [Off32]),
    (jge, "jge", [Off32]),

    // Comparison
    (ucmp8RR, "ucmp8RR", [Reg, Reg]),
    (ucmp16RR, "ucmp16RR", [Reg, Reg]),
    (ucmp32RR, "ucmp32RR", [Reg, Reg]),
    (ucmp64RR, "ucmp64RR", [Reg, Reg]),
    (scmp8RR, "scmp8RR", [Reg, Reg]),
    (scmp16RR, "scmp16RR", [Reg, Reg]),
    (scmp32RR, "scmp32RR", [Reg, Reg]),
    (scmp64RR, "scmp64RR", [Reg, Reg]),
    (ucmp8RV, "ucmp8RV", [Reg, Val8]),
    (ucmp16RV, "ucmp16RV", [Reg, Val16]),
    (ucmp32RV, "ucmp32RV", [Reg, Val32]),
    (ucmp64RV, "ucmp64RV", [Reg, Val64]),
    (scmp8RV, "scmp8RV", [Reg, Val8]),
    (scmp16RV, "scmp16RV", [Reg, Val16]),
    (scmp32RV, "scmp32RV", [Reg, Val32]),
    (scmp64RV, "scmp64RV", [Reg, Val64]),
    (fcmp32RR, "fcmp32RR", [Reg, Reg]),
    (fcmp64RR, "fcmp64RR", [Reg, Reg]),
    (fcmp32RV, "fcmp32RV", [Reg, Val32]),
    (fcmp64RV, "fcmp64RV", [Reg, Val64]),
    (stest8, "stest8", [Reg]),
    (stest16, "stest16", [Reg]),
    (stest32, "stest32", [Reg]),
    (stest64, "stest64", [Reg]),
    (utest8, "utest8", [Reg]),
    (utest16, "utest16", [Reg]),
    (utest32, "utest32", [Reg]),
    (utest64, "utest64", [Reg]),

    // Load comparison results
    (sete, "sete", [Reg]),
    (setne, "setne", [Reg]),
    (setl, "setl", [Reg]),
    (setle, "setle", [Reg]),
    (setg, "setg", [Reg]),
    (setge, "setge", [Reg]),

    // Unary operations
    (lnt, "lnt", [Reg]),
    (bnt, "bnt", [Reg]),
    (neg8, "neg8", [Reg]),
    (neg16, "neg16", [Reg]),
    (neg32, "neg32", [Reg]),
    (neg64, "neg64", [Reg]),

    // Integer arithmetic, 32 and 64 bit
    (add32RR, "add32RR", [Reg, Reg]),
    (add32RV, "add32RV", [Reg, Val32]),
    (add32RM, "add32RM", [Reg, Mem]),
    (add64RR, "add64RR", [Reg, Reg]),
    (add64RV, "add64RV", [Reg, Val64]),
    (add64RM, "add64RM", [Reg, Mem]),
    (sub32RR, "sub32RR", [Reg, Reg]),
    (sub32RV, "sub32RV", [Reg, Val32]),
    (sub32RM, "sub32RM", [Reg, Mem]),
    (sub64RR, "sub64RR", [Reg, Reg]),
    (sub64RV, "sub64RV", [Reg, Val64]),
    (sub64RM, "sub64RM", [Reg, Mem]),
    (mul32RR, "mul32RR", [Reg, Reg]),
    (mul32RV, "mul32RV", [Reg, Val32]),
    (mul32RM, "mul32RM", [Reg, Mem]),
    (mul64RR, "mul64RR", [Reg, Reg]),
    (mul64RV, "mul64RV", [Reg, Val64]),
    (mul64RM, "mul64RM", [Reg, Mem]),
    (udiv32RR, "udiv32RR", [Reg, Reg]),
    (udiv32RV, "udiv32RV", [Reg, Val32]),
    (udiv32RM, "udiv32RM", [Reg, Mem]),
    (udiv64RR, "udiv64RR", [Reg, Reg]),
    (udiv64RV, "udiv64RV", [Reg, Val64]),
    (udiv64RM, "udiv64RM", [Reg, Mem]),
    (sdiv32RR, "sdiv32RR", [Reg, Reg]),
    (sdiv32RV, "sdiv32RV", [Reg, Val32]),
    (sdiv32RM, "sdiv32RM", [Reg, Mem]),
    (sdiv64RR, "sdiv64RR", [Reg, Reg]),
    (sdiv64RV, "sdiv64RV", [Reg, Val64]),
    (sdiv64RM, "sdiv64RM", [Reg, Mem]),
    (urem32RR, "urem32RR", [Reg, Reg]),
    (urem32RV, "urem32RV", [Reg, Val32]),
    (urem32RM, "urem32RM", [Reg, Mem]),
    (urem64RR, "urem64RR", [Reg, Reg]),
    (urem64RV, "urem64RV", [Reg, Val64]),
    (urem64RM, "urem64RM", [Reg, Mem]),
    (srem32RR, "srem32RR", [Reg, Reg]),
    (srem32RV, "srem32RV", [Reg, Val32]),
    (srem32RM, "srem32RM", [Reg, Mem]),
    (srem64RR, "srem64RR", [Reg, Reg]),
    (srem64RV, "srem64RV", [Reg, Val64]),
    (srem64RM, "srem64RM", [Reg, Mem]),

    // Floating point arithmetic
    (fadd32RR, "fadd32RR", [Reg, Reg]),
    (fadd32RV, "fadd32RV", [Reg, Val32]),
    (fadd32RM, "fadd32RM", [Reg, Mem]),
    (fadd64RR, "fadd64RR", [Reg, Reg]),
    (fadd64RV, "fadd64RV", [Reg, Val64]),
    (fadd64RM, "fadd64RM", [Reg, Mem]),
    (fsub32RR, "fsub32RR", [Reg, Reg]),
    (fsub32RV, "fsub32RV", [Reg, Val32]),
    (fsub32RM, "fsub32RM", [Reg, Mem]),
    (fsub64RR, "fsub64RR", [Reg, Reg]),
    (fsub64RV, "fsub64RV", [Reg, Val64]),
    (fsub64RM, "fsub64RM", [Reg, Mem]),
    (fmul32RR, "fmul32RR", [Reg, Reg]),
    (fmul32RV, "fmul32RV", [Reg, Val32]),
    (fmul32RM, "fmul32RM", [Reg, Mem]),
    (fmul64RR, "fmul64RR", [Reg, Reg]),
    (fmul64RV, "fmul64RV", [Reg, Val64]),
    (fmul64RM, "fmul64RM", [Reg, Mem]),
    (fdiv32RR, "fdiv32RR", [Reg, Reg]),
    (fdiv32RV, "fdiv32RV", [Reg, Val32]),
    (fdiv32RM, "fdiv32RM", [Reg, Mem]),
    (fdiv64RR, "fdiv64RR", [Reg, Reg]),
    (fdiv64RV, "fdiv64RV", [Reg, Val64]),
    (fdiv64RM, "fdiv64RM", [Reg, Mem]),

    // Shifts; the RV forms take 8-bit shift amounts
    (lsl32RR, "lsl32RR", [Reg, Reg]),
    (lsl32RV, "lsl32RV", [Reg, Val8]),
    (lsl32RM, "lsl32RM", [Reg, Mem]),
    (lsl64RR, "lsl64RR", [Reg, Reg]),
    (lsl64RV, "lsl64RV", [Reg, Val8]),
    (lsl64RM, "lsl64RM", [Reg, Mem]),
    (lsr32RR, "lsr32RR", [Reg, Reg]),
    (lsr32RV, "lsr32RV", [Reg, Val8]),
    (lsr32RM, "lsr32RM", [Reg, Mem]),
    (lsr64RR, "lsr64RR", [Reg, Reg]),
    (lsr64RV, "lsr64RV", [Reg, Val8]),
    (lsr64RM, "lsr64RM", [Reg, Mem]),
    (asl32RR, "asl32RR", [Reg, Reg]),
    (asl32RV, "asl32RV", [Reg, Val8]),
    (asl32RM, "asl32RM", [Reg, Mem]),
    (asl64RR, "asl64RR", [Reg, Reg]),
    (asl64RV, "asl64RV", [Reg, Val8]),
    (asl64RM, "asl64RM", [Reg, Mem]),
    (asr32RR, "asr32RR", [Reg, Reg]),
    (asr32RV, "asr32RV", [Reg, Val8]),
    (asr32RM, "asr32RM", [Reg, Mem]),
    (asr64RR, "asr64RR", [Reg, Reg]),
    (asr64RV, "asr64RV", [Reg, Val8]),
    (asr64RM, "asr64RM", [Reg, Mem]),

    // Bitwise operations
    (and32RR, "and32RR", [Reg, Reg]),
    (and32RV, "and32RV", [Reg, Val32]),
    (and32RM, "and32RM", [Reg, Mem]),
    (and64RR, "and64RR", [Reg, Reg]),
    (and64RV, "and64RV", [Reg, Val64]),
    (and64RM, "and64RM", [Reg, Mem]),
    (or32RR, "or32RR", [Reg, Reg]),
    (or32RV, "or32RV", [Reg, Val32]),
    (or32RM, "or32RM", [Reg, Mem]),
    (or64RR, "or64RR", [Reg, Reg]),
    (or64RV, "or64RV", [Reg, Val64]),
    (or64RM, "or64RM", [Reg, Mem]),
    (xor32RR, "xor32RR", [Reg, Reg]),
    (xor32RV, "xor32RV", [Reg, Val32]),
    (xor32RM, "xor32RM", [Reg, Mem]),
    (xor64RR, "xor64RR", [Reg, Reg]),
    (xor64RV, "xor64RV", [Reg, Val64]),
    (xor64RM, "xor64RM", [Reg, Mem]),

    // Conversions
    (sext1, "sext1", [Reg]),
    (sext8, "sext8", [Reg]),
    (sext16, "sext16", [Reg]),
    (sext32, "sext32", [Reg]),
    (fext, "fext", [Reg]),
    (ftrunc, "ftrunc", [Reg]),
    (s8tof32, "s8tof32", [Reg]),
    (s16tof32, "s16tof32", [Reg]),
    (s32tof32, "s32tof32", [Reg]),
    (s64tof32, "s64tof32", [Reg]),
    (s8tof64, "s8tof64", [Reg]),
    (s16tof64, "s16tof64", [Reg]),
    (s32tof64, "s32tof64", [Reg]),
    (s64tof64, "s64tof64", [Reg]),
    (u8tof32, "u8tof32", [Reg]),
    (u16tof32, "u16tof32", [Reg]),
    (u32tof32, "u32tof32", [Reg]),
    (u64tof32, "u64tof32", [Reg]),
    (u8tof64, "u8tof64", [Reg]),
    (u16tof64, "u16tof64", [Reg]),
    (u32tof64, "u32tof64", [Reg]),
    (u64tof64, "u64tof64", [Reg]),
    (f32tos8, "f32tos8", [Reg]),
    (f32tos16, "f32tos16", [Reg]),
    (f32tos32, "f32tos32", [Reg]),
    (f32tos64, "f32tos64", [Reg]),
    (f64tos8, "f64tos8", [Reg]),
    (f64tos16, "f64tos16", [Reg]),
    (f64tos32, "f64tos32", [Reg]),
    (f64tos64, "f64tos64", [Reg]),
    (f32tou8, "f32tou8", [Reg]),
    (f32tou16, "f32tou16", [Reg]),
    (f32tou32, "f32tou32", [Reg]),
    (f32tou64, "f32tou64", [Reg]),
    (f64tou8, "f64tou8", [Reg]),
    (f64tou16, "f64tou16", [Reg]),
    (f64tou32, "f64tou32", [Reg]),
    (f64tou64, "f64tou64", [Reg]),
}

impl OpCode {
    /// Total encoded size of an instruction with this opcode
    pub fn code_size(self) -> u64 {
        1 + self.layout().iter().map(|k| k.size()).sum::<u64>()
    }

    /// Decode from the opcode byte
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OPCODE_TABLE.get(byte as usize).copied()
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedOperand {
    /// Register index
    Reg(u8),
    /// Immediate, zero-extended
    Value(u64),
    /// Memory address tuple
    Mem {
        /// Base pointer register
        base: u8,
        /// Index register; 0xFF means none
        offset_reg: u8,
        /// Index scale
        offset_factor: u8,
        /// Constant displacement
        offset_term: u8,
    },
    /// Signed code offset
    Offset(i32),
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInst {
    /// Byte offset within the code section
    pub offset: u64,
    /// The opcode
    pub opcode: OpCode,
    /// Decoded operands in layout order
    pub operands: Vec<DecodedOperand>,
}

impl fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:6}  {}", self.offset, self.opcode)?;
        for op in &self.operands {
            match op {
                DecodedOperand::Reg(r) => write!(f, " R{r}")?,
                DecodedOperand::Value(v) => write!(f, " {v}")?,
                DecodedOperand::Offset(o) => write!(f, " {o:+}")?,
                DecodedOperand::Mem {
                    base,
                    offset_reg,
                    offset_factor,
                    offset_term,
                } => {
                    if *offset_reg == 0xFF {
                        write!(f, " [R{base} + {offset_term}]")?;
                    } else {
                        write!(
                            f,
                            " [R{base} + R{offset_reg} * {offset_factor} + {offset_term}]"
                        )?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Walk a code section, decoding one instruction at a time.
///
/// Returns `None` at the first byte that is not a valid opcode or whose
/// operands run past the end of the section.
pub fn disassemble(code: &[u8]) -> Vec<DecodedInst> {
    let mut result = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let Some(opcode) = OpCode::from_byte(code[offset]) else {
            break;
        };
        let size = opcode.code_size() as usize;
        if offset + size > code.len() {
            break;
        }
        let mut operands = Vec::new();
        let mut cursor = offset + 1;
        for kind in opcode.layout() {
            let operand = match kind {
                OperandKind::Reg => DecodedOperand::Reg(code[cursor]),
                OperandKind::Val8 => DecodedOperand::Value(u64::from(code[cursor])),
                OperandKind::Val16 => DecodedOperand::Value(u64::from(u16::from_le_bytes(
                    code[cursor..cursor + 2].try_into().unwrap(),
                ))),
                OperandKind::Val32 => DecodedOperand::Value(u64::from(u32::from_le_bytes(
                    code[cursor..cursor + 4].try_into().unwrap(),
                ))),
                OperandKind::Val64 => DecodedOperand::Value(u64::from_le_bytes(
                    code[cursor..cursor + 8].try_into().unwrap(),
                )),
                OperandKind::Mem => DecodedOperand::Mem {
                    base: code[cursor],
                    offset_reg: code[cursor + 1],
                    offset_factor: code[cursor + 2],
                    offset_term: code[cursor + 3],
                },
                OperandKind::Off32 => DecodedOperand::Offset(i32::from_le_bytes(
                    code[cursor..cursor + 4].try_into().unwrap(),
                )),
            };
            cursor += kind.size() as usize;
            operands.push(operand);
        }
        result.push(DecodedInst {
            offset: offset as u64,
            opcode,
            operands,
        });
        offset += size;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_byte_addressable() {
        assert!(OPCODE_TABLE.len() <= 256);
        for (i, &op) in OPCODE_TABLE.iter().enumerate() {
            assert_eq!(op as usize, i);
            assert_eq!(OpCode::from_byte(i as u8), Some(op));
        }
    }

    #[test]
    fn sizes_follow_layouts() {
        assert_eq!(OpCode::ret.code_size(), 1);
        assert_eq!(OpCode::mov64RR.code_size(), 3);
        assert_eq!(OpCode::mov64RV.code_size(), 10);
        assert_eq!(OpCode::mov64RM.code_size(), 6);
        assert_eq!(OpCode::call.code_size(), 6);
        assert_eq!(OpCode::jmp.code_size(), 5);
        assert_eq!(OpCode::cfng.code_size(), 4);
        assert_eq!(OpCode::lincsp.code_size(), 4);
        assert_eq!(OpCode::lsl64RV.code_size(), 3);
    }

    #[test]
    fn disassembles_simple_sequence() {
        let mut code = vec![OpCode::mov64RV as u8, 3];
        code.extend_from_slice(&42u64.to_le_bytes());
        code.push(OpCode::terminate as u8);

        let insts = disassemble(&code);
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].opcode, OpCode::mov64RV);
        assert_eq!(
            insts[0].operands,
            vec![DecodedOperand::Reg(3), DecodedOperand::Value(42)]
        );
        assert_eq!(insts[1].opcode, OpCode::terminate);
        assert_eq!(insts[1].offset, 10);
    }

    #[test]
    fn stops_at_invalid_opcode() {
        let code = vec![0xFE, 0x00];
        assert!(disassemble(&code).is_empty());
    }
}
