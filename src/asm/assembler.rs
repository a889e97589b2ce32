//! Assembler: assembly stream to binary program
//!
//! Serializes the blocks into a contiguous buffer beginning with a
//! [`ProgramHeader`], resolving every internal jump and call target once
//! all blocks have been emitted. Foreign calls leave a two-byte 0xFFFF
//! placeholder for the linker; the offsets of those placeholders are
//! returned together with the symbol table.

use std::collections::HashMap;

use tracing::trace;

use crate::vm::opcode::OpCode;

use super::{
    ArithmeticOperation, AsmInst, AsmValue, AssemblyStream, Condition, ConversionKind,
    ForeignFunctionInterface, LabelId, MemoryAddress, Type, UnaryArithmeticOperation,
};

/// Binary magic: `\x7FSBT`
pub const MAGIC: u32 = 0x5442_537F;
/// Current binary format version
pub const VERSION: u32 = 1;
/// Serialized header size
pub const HEADER_SIZE: u64 = 24;

/// Fixed-layout program header
///
/// `size` is the size of the executable image (header, static data and
/// code); a dynamic-link section, when present, begins at offset `size`
/// and runs to the end of the file. `entry_offset` is relative to the end
/// of the header and doubles as the boundary between the static-data and
/// code sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Magic bytes
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Image size in bytes
    pub size: u64,
    /// Entry point, relative to the end of the header
    pub entry_offset: u64,
}

impl ProgramHeader {
    /// Serialize little-endian
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.entry_offset.to_le_bytes());
    }

    /// Deserialize; `None` when the buffer is too small or the magic is
    /// wrong
    pub fn read_from(bytes: &[u8]) -> Option<ProgramHeader> {
        if bytes.len() < HEADER_SIZE as usize {
            return None;
        }
        let header = ProgramHeader {
            magic: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            entry_offset: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        };
        (header.magic == MAGIC).then_some(header)
    }
}

/// Assembler output
#[derive(Debug, Clone)]
pub struct AssemblerResult {
    /// The serialized program (header, data, code)
    pub binary: Vec<u8>,
    /// `(binary_offset, interface)` for every unresolved foreign call; the
    /// offset points at the two placeholder bytes
    pub unresolved_symbols: Vec<(usize, ForeignFunctionInterface)>,
    /// Label id to image offset
    pub symbols: HashMap<LabelId, u64>,
}

struct Assembler {
    binary: Vec<u8>,
    symbols: HashMap<LabelId, u64>,
    /// `(binary_offset_of_i32, label, inst_image_offset)` jump patches
    jump_patches: Vec<(usize, LabelId, u64)>,
    unresolved: Vec<(usize, ForeignFunctionInterface)>,
}

/// Assemble a stream into a binary program
pub fn assemble(stream: &AssemblyStream) -> AssemblerResult {
    let mut asm = Assembler {
        binary: vec![0; HEADER_SIZE as usize],
        symbols: HashMap::new(),
        jump_patches: Vec::new(),
        unresolved: Vec::new(),
    };
    asm.binary.extend_from_slice(&stream.data);
    let entry_offset = stream.data.len() as u64;

    for block in &stream.blocks {
        let image_offset = asm.binary.len() as u64 - HEADER_SIZE;
        trace!(name = %block.name, offset = image_offset, "placing block");
        debug_assert!(
            !asm.symbols.contains_key(&block.id),
            "duplicate label id {:?}",
            block.id
        );
        asm.symbols.insert(block.id, image_offset);
        for inst in &block.insts {
            asm.put_inst(inst);
        }
    }

    // Patch every internal jump and call in place
    for &(pos, label, inst_offset) in &asm.jump_patches {
        let target = asm.symbols[&label];
        let rel = target as i64 - inst_offset as i64;
        asm.binary[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    // Patch function addresses referenced from the data section
    for (data_offset, name) in &stream.address_placeholders {
        let block = stream
            .blocks
            .iter()
            .find(|b| &b.name == name)
            .unwrap_or_else(|| panic!("address placeholder references unknown block {name}"));
        let target = asm.symbols[&block.id];
        let pos = HEADER_SIZE as usize + data_offset;
        asm.binary[pos..pos + 8].copy_from_slice(&target.to_le_bytes());
    }

    let header = ProgramHeader {
        magic: MAGIC,
        version: VERSION,
        size: asm.binary.len() as u64,
        entry_offset,
    };
    let mut head = [0u8; HEADER_SIZE as usize];
    header.write_to(&mut head);
    asm.binary[..HEADER_SIZE as usize].copy_from_slice(&head);

    AssemblerResult {
        binary: asm.binary,
        unresolved_symbols: asm.unresolved,
        symbols: asm.symbols,
    }
}

impl Assembler {
    fn image_offset(&self) -> u64 {
        self.binary.len() as u64 - HEADER_SIZE
    }

    fn put_op(&mut self, op: OpCode) {
        self.binary.push(op as u8);
    }

    fn put_u8(&mut self, v: u8) {
        self.binary.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.binary.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.binary.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.binary.extend_from_slice(&v.to_le_bytes());
    }

    fn put_mem(&mut self, addr: MemoryAddress) {
        self.binary.extend_from_slice(&[
            addr.base,
            addr.offset_reg,
            addr.offset_factor,
            addr.offset_term,
        ]);
    }

    fn put_label(&mut self, label: LabelId, inst_offset: u64) {
        self.jump_patches
            .push((self.binary.len(), label, inst_offset));
        self.put_u32(0);
    }

    fn put_value(&mut self, value: AsmValue) {
        match value {
            AsmValue::RegisterIndex(r) => self.put_u8(r),
            AsmValue::Value8(v) => self.put_u8(v),
            AsmValue::Value16(v) => self.put_u16(v),
            AsmValue::Value32(v) => self.put_u32(v),
            AsmValue::Value64(v) => self.put_u64(v),
            AsmValue::Memory(addr) => self.put_mem(addr),
        }
    }

    fn put_inst(&mut self, inst: &AsmInst) {
        let inst_offset = self.image_offset();
        match inst {
            AsmInst::Move { dest, src, width } => self.put_move(*dest, *src, *width),
            AsmInst::CondMove {
                cond,
                dest,
                src,
                width,
            } => {
                let op = cmove_opcode(*cond, *src, *width);
                self.put_op(op);
                self.put_u8(*dest);
                self.put_value(*src);
            }
            AsmInst::Jump { cond, target } => {
                let op = match cond {
                    None => OpCode::jmp,
                    Some(Condition::Equal) => OpCode::je,
                    Some(Condition::NotEqual) => OpCode::jne,
                    Some(Condition::Less) => OpCode::jl,
                    Some(Condition::LessEq) => OpCode::jle,
                    Some(Condition::Greater) => OpCode::jg,
                    Some(Condition::GreaterEq) => OpCode::jge,
                };
                self.put_op(op);
                self.put_label(*target, inst_offset);
            }
            AsmInst::Call { target, reg_offset } => {
                self.put_op(OpCode::call);
                self.put_label(*target, inst_offset);
                self.put_u8(*reg_offset);
            }
            AsmInst::CallReg { callee, reg_offset } => {
                self.put_op(OpCode::icallr);
                self.put_u8(*callee);
                self.put_u8(*reg_offset);
            }
            AsmInst::CallMem { callee, reg_offset } => {
                self.put_op(OpCode::icallm);
                self.put_mem(*callee);
                self.put_u8(*reg_offset);
            }
            AsmInst::CallForeign {
                reg_offset,
                interface,
            } => {
                self.put_op(OpCode::cfng);
                self.put_u8(*reg_offset);
                // The linker replaces the placeholder with the resolved
                // table index
                self.unresolved
                    .push((self.binary.len(), interface.clone()));
                self.put_u16(0xFFFF);
            }
            AsmInst::CallBuiltin { reg_offset, index } => {
                self.put_op(OpCode::cbltn);
                self.put_u8(*reg_offset);
                self.put_u16(*index);
            }
            AsmInst::Return => self.put_op(OpCode::ret),
            AsmInst::Terminate => self.put_op(OpCode::terminate),
            AsmInst::Compare {
                ty,
                lhs,
                rhs,
                width,
            } => {
                let op = compare_opcode(*ty, *rhs, *width);
                self.put_op(op);
                self.put_u8(*lhs);
                self.put_value(*rhs);
            }
            AsmInst::Test { ty, reg, width } => {
                let op = match (ty, width) {
                    (Type::Signed, 1) => OpCode::stest8,
                    (Type::Signed, 2) => OpCode::stest16,
                    (Type::Signed, 4) => OpCode::stest32,
                    (Type::Signed, _) => OpCode::stest64,
                    (_, 1) => OpCode::utest8,
                    (_, 2) => OpCode::utest16,
                    (_, 4) => OpCode::utest32,
                    (_, _) => OpCode::utest64,
                };
                self.put_op(op);
                self.put_u8(*reg);
            }
            AsmInst::Set { cond, dest } => {
                let op = match cond {
                    Condition::Equal => OpCode::sete,
                    Condition::NotEqual => OpCode::setne,
                    Condition::Less => OpCode::setl,
                    Condition::LessEq => OpCode::setle,
                    Condition::Greater => OpCode::setg,
                    Condition::GreaterEq => OpCode::setge,
                };
                self.put_op(op);
                self.put_u8(*dest);
            }
            AsmInst::UnaryArithmetic { op, reg, width } => {
                let opcode = match (op, width) {
                    (UnaryArithmeticOperation::LogicalNot, _) => OpCode::lnt,
                    (UnaryArithmeticOperation::BitwiseNot, _) => OpCode::bnt,
                    (UnaryArithmeticOperation::Negate, 1) => OpCode::neg8,
                    (UnaryArithmeticOperation::Negate, 2) => OpCode::neg16,
                    (UnaryArithmeticOperation::Negate, 4) => OpCode::neg32,
                    (UnaryArithmeticOperation::Negate, _) => OpCode::neg64,
                };
                self.put_op(opcode);
                self.put_u8(*reg);
            }
            AsmInst::Arithmetic {
                op,
                ty,
                dest,
                src,
                width,
            } => {
                let opcode = arithmetic_opcode(*op, *ty, *width, *src);
                self.put_op(opcode);
                self.put_u8(*dest);
                self.put_value(*src);
            }
            AsmInst::Convert { conv, reg } => {
                self.put_op(conversion_opcode(*conv));
                self.put_u8(*reg);
            }
            AsmInst::LIncSP { dest, offset } => {
                self.put_op(OpCode::lincsp);
                self.put_u8(*dest);
                self.put_u16(*offset);
            }
            AsmInst::Lea { dest, addr } => {
                self.put_op(OpCode::lea);
                self.put_u8(*dest);
                self.put_mem(*addr);
            }
        }
    }

    fn put_move(&mut self, dest: AsmValue, src: AsmValue, width: u8) {
        match (dest, src) {
            (AsmValue::RegisterIndex(d), AsmValue::RegisterIndex(s)) => {
                self.put_op(OpCode::mov64RR);
                self.put_u8(d);
                self.put_u8(s);
            }
            (AsmValue::RegisterIndex(d), AsmValue::Memory(addr)) => {
                let op = match width {
                    1 => OpCode::mov8RM,
                    2 => OpCode::mov16RM,
                    4 => OpCode::mov32RM,
                    _ => OpCode::mov64RM,
                };
                self.put_op(op);
                self.put_u8(d);
                self.put_mem(addr);
            }
            (AsmValue::Memory(addr), AsmValue::RegisterIndex(s)) => {
                let op = match width {
                    1 => OpCode::mov8MR,
                    2 => OpCode::mov16MR,
                    4 => OpCode::mov32MR,
                    _ => OpCode::mov64MR,
                };
                self.put_op(op);
                self.put_mem(addr);
                self.put_u8(s);
            }
            (AsmValue::RegisterIndex(d), src) => {
                let bits = match src {
                    AsmValue::Value8(v) => u64::from(v),
                    AsmValue::Value16(v) => u64::from(v),
                    AsmValue::Value32(v) => u64::from(v),
                    AsmValue::Value64(v) => v,
                    _ => unreachable!(),
                };
                self.put_op(OpCode::mov64RV);
                self.put_u8(d);
                self.put_u64(bits);
            }
            (dest, src) => panic!("unencodable move {dest:?} <- {src:?}"),
        }
    }
}

fn cmove_opcode(cond: Condition, src: AsmValue, width: u8) -> OpCode {
    use Condition::*;
    use OpCode::*;
    match src {
        AsmValue::RegisterIndex(_) => match cond {
            Equal => cmove64RR,
            NotEqual => cmovne64RR,
            Less => cmovl64RR,
            LessEq => cmovle64RR,
            Greater => cmovg64RR,
            GreaterEq => cmovge64RR,
        },
        AsmValue::Memory(_) => match (cond, width) {
            (Equal, 1) => cmove8RM,
            (Equal, 2) => cmove16RM,
            (Equal, 4) => cmove32RM,
            (Equal, _) => cmove64RM,
            (NotEqual, 1) => cmovne8RM,
            (NotEqual, 2) => cmovne16RM,
            (NotEqual, 4) => cmovne32RM,
            (NotEqual, _) => cmovne64RM,
            (Less, 1) => cmovl8RM,
            (Less, 2) => cmovl16RM,
            (Less, 4) => cmovl32RM,
            (Less, _) => cmovl64RM,
            (LessEq, 1) => cmovle8RM,
            (LessEq, 2) => cmovle16RM,
            (LessEq, 4) => cmovle32RM,
            (LessEq, _) => cmovle64RM,
            (Greater, 1) => cmovg8RM,
            (Greater, 2) => cmovg16RM,
            (Greater, 4) => cmovg32RM,
            (Greater, _) => cmovg64RM,
            (GreaterEq, 1) => cmovge8RM,
            (GreaterEq, 2) => cmovge16RM,
            (GreaterEq, 4) => cmovge32RM,
            (GreaterEq, _) => cmovge64RM,
        },
        _ => match cond {
            Equal => cmove64RV,
            NotEqual => cmovne64RV,
            Less => cmovl64RV,
            LessEq => cmovle64RV,
            Greater => cmovg64RV,
            GreaterEq => cmovge64RV,
        },
    }
}

fn compare_opcode(ty: Type, rhs: AsmValue, width: u8) -> OpCode {
    use OpCode::*;
    let register = matches!(rhs, AsmValue::RegisterIndex(_));
    match (ty, width, register) {
        (Type::Signed, 1, true) => scmp8RR,
        (Type::Signed, 2, true) => scmp16RR,
        (Type::Signed, 4, true) => scmp32RR,
        (Type::Signed, _, true) => scmp64RR,
        (Type::Signed, 1, false) => scmp8RV,
        (Type::Signed, 2, false) => scmp16RV,
        (Type::Signed, 4, false) => scmp32RV,
        (Type::Signed, _, false) => scmp64RV,
        (Type::Unsigned, 1, true) => ucmp8RR,
        (Type::Unsigned, 2, true) => ucmp16RR,
        (Type::Unsigned, 4, true) => ucmp32RR,
        (Type::Unsigned, _, true) => ucmp64RR,
        (Type::Unsigned, 1, false) => ucmp8RV,
        (Type::Unsigned, 2, false) => ucmp16RV,
        (Type::Unsigned, 4, false) => ucmp32RV,
        (Type::Unsigned, _, false) => ucmp64RV,
        (Type::Float, 4, true) => fcmp32RR,
        (Type::Float, _, true) => fcmp64RR,
        (Type::Float, 4, false) => fcmp32RV,
        (Type::Float, _, false) => fcmp64RV,
    }
}

fn arithmetic_opcode(op: ArithmeticOperation, ty: Type, width: u8, src: AsmValue) -> OpCode {
    use ArithmeticOperation::*;
    use OpCode::*;
    #[derive(Clone, Copy, PartialEq)]
    enum Form {
        RR,
        RV,
        RM,
    }
    let form = match src {
        AsmValue::RegisterIndex(_) => Form::RR,
        AsmValue::Memory(_) => Form::RM,
        _ => Form::RV,
    };
    let wide = width > 4;
    macro_rules! pick {
        ($n32rr:ident, $n32rv:ident, $n32rm:ident, $n64rr:ident, $n64rv:ident, $n64rm:ident) => {
            match (wide, form) {
                (false, Form::RR) => $n32rr,
                (false, Form::RV) => $n32rv,
                (false, Form::RM) => $n32rm,
                (true, Form::RR) => $n64rr,
                (true, Form::RV) => $n64rv,
                (true, Form::RM) => $n64rm,
            }
        };
    }
    match (op, ty) {
        (Add, Type::Float) => pick!(fadd32RR, fadd32RV, fadd32RM, fadd64RR, fadd64RV, fadd64RM),
        (Sub, Type::Float) => pick!(fsub32RR, fsub32RV, fsub32RM, fsub64RR, fsub64RV, fsub64RM),
        (Mul, Type::Float) => pick!(fmul32RR, fmul32RV, fmul32RM, fmul64RR, fmul64RV, fmul64RM),
        (Div, Type::Float) => pick!(fdiv32RR, fdiv32RV, fdiv32RM, fdiv64RR, fdiv64RV, fdiv64RM),
        (Add, _) => pick!(add32RR, add32RV, add32RM, add64RR, add64RV, add64RM),
        (Sub, _) => pick!(sub32RR, sub32RV, sub32RM, sub64RR, sub64RV, sub64RM),
        (Mul, _) => pick!(mul32RR, mul32RV, mul32RM, mul64RR, mul64RV, mul64RM),
        (Div, Type::Signed) => pick!(sdiv32RR, sdiv32RV, sdiv32RM, sdiv64RR, sdiv64RV, sdiv64RM),
        (Div, _) => pick!(udiv32RR, udiv32RV, udiv32RM, udiv64RR, udiv64RV, udiv64RM),
        (Rem, Type::Signed) => pick!(srem32RR, srem32RV, srem32RM, srem64RR, srem64RV, srem64RM),
        (Rem, _) => pick!(urem32RR, urem32RV, urem32RM, urem64RR, urem64RV, urem64RM),
        (LShL, _) => pick!(lsl32RR, lsl32RV, lsl32RM, lsl64RR, lsl64RV, lsl64RM),
        (LShR, _) => pick!(lsr32RR, lsr32RV, lsr32RM, lsr64RR, lsr64RV, lsr64RM),
        (AShL, _) => pick!(asl32RR, asl32RV, asl32RM, asl64RR, asl64RV, asl64RM),
        (AShR, _) => pick!(asr32RR, asr32RV, asr32RM, asr64RR, asr64RV, asr64RM),
        (And, _) => pick!(and32RR, and32RV, and32RM, and64RR, and64RV, and64RM),
        (Or, _) => pick!(or32RR, or32RV, or32RM, or64RR, or64RV, or64RM),
        (XOr, _) => pick!(xor32RR, xor32RV, xor32RM, xor64RR, xor64RV, xor64RM),
    }
}

fn conversion_opcode(conv: ConversionKind) -> OpCode {
    use ConversionKind::*;
    use OpCode::*;
    match conv {
        Sext1 => sext1,
        Sext8 => sext8,
        Sext16 => sext16,
        Sext32 => sext32,
        ConversionKind::Fext => OpCode::fext,
        ConversionKind::Ftrunc => OpCode::ftrunc,
        IntToFloat {
            signed,
            from_bits,
            to_bits,
        } => match (signed, from_bits, to_bits) {
            (true, 8, 32) => s8tof32,
            (true, 16, 32) => s16tof32,
            (true, 32, 32) => s32tof32,
            (true, _, 32) => s64tof32,
            (true, 8, _) => s8tof64,
            (true, 16, _) => s16tof64,
            (true, 32, _) => s32tof64,
            (true, _, _) => s64tof64,
            (false, 8, 32) => u8tof32,
            (false, 16, 32) => u16tof32,
            (false, 32, 32) => u32tof32,
            (false, _, 32) => u64tof32,
            (false, 8, _) => u8tof64,
            (false, 16, _) => u16tof64,
            (false, 32, _) => u32tof64,
            (false, _, _) => u64tof64,
        },
        FloatToInt {
            signed,
            from_bits,
            to_bits,
        } => match (signed, from_bits, to_bits) {
            (true, 32, 8) => f32tos8,
            (true, 32, 16) => f32tos16,
            (true, 32, 32) => f32tos32,
            (true, 32, _) => f32tos64,
            (true, _, 8) => f64tos8,
            (true, _, 16) => f64tos16,
            (true, _, 32) => f64tos32,
            (true, _, _) => f64tos64,
            (false, 32, 8) => f32tou8,
            (false, 32, 16) => f32tou16,
            (false, 32, 32) => f32tou32,
            (false, 32, _) => f32tou64,
            (false, _, 8) => f64tou8,
            (false, _, 16) => f64tou16,
            (false, _, 32) => f64tou32,
            (false, _, _) => f64tou64,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Block;
    use crate::vm::opcode::disassemble;

    #[test]
    fn header_round_trip() {
        let header = ProgramHeader {
            magic: MAGIC,
            version: VERSION,
            size: 1234,
            entry_offset: 8,
        };
        let mut bytes = [0u8; HEADER_SIZE as usize];
        header.write_to(&mut bytes);
        assert_eq!(ProgramHeader::read_from(&bytes), Some(header));
        assert_eq!(ProgramHeader::read_from(&bytes[..10]), None);
    }

    #[test]
    fn resolves_backward_and_forward_jumps() {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::Jump {
                    cond: None,
                    target: LabelId(1),
                },
                AsmInst::Terminate,
            ],
        });
        stream.add(Block {
            id: LabelId(1),
            name: "next".to_string(),
            external: false,
            insts: vec![AsmInst::Jump {
                cond: None,
                target: LabelId(0),
            }],
        });

        let result = assemble(&stream);
        assert_eq!(result.symbols[&LabelId(0)], 0);
        assert_eq!(result.symbols[&LabelId(1)], 6);

        let code = &result.binary[HEADER_SIZE as usize..];
        let insts = disassemble(code);
        // jmp +6 (to "next"), terminate, jmp -6 (back to "start")
        assert_eq!(insts[0].opcode, OpCode::jmp);
        assert_eq!(
            insts[0].operands[0],
            crate::vm::opcode::DecodedOperand::Offset(6)
        );
        assert_eq!(insts[2].opcode, OpCode::jmp);
        assert_eq!(
            insts[2].operands[0],
            crate::vm::opcode::DecodedOperand::Offset(-6)
        );
    }

    #[test]
    fn foreign_calls_leave_placeholders() {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::CallForeign {
                    reg_offset: 4,
                    interface: ForeignFunctionInterface {
                        name: "puts".to_string(),
                        argument_types: vec![super::super::FFIType::Pointer],
                        return_type: super::super::FFIType::Void,
                    },
                },
                AsmInst::Terminate,
            ],
        });

        let result = assemble(&stream);
        assert_eq!(result.unresolved_symbols.len(), 1);
        let (pos, interface) = &result.unresolved_symbols[0];
        assert_eq!(interface.name, "puts");
        assert_eq!(&result.binary[*pos..pos + 2], &[0xFF, 0xFF]);
    }

    #[test]
    fn entry_offset_skips_data_section() {
        let mut stream = AssemblyStream::new();
        stream.data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![AsmInst::Terminate],
        });
        let result = assemble(&stream);
        let header = ProgramHeader::read_from(&result.binary).unwrap();
        assert_eq!(header.entry_offset, 8);
        assert_eq!(header.size, result.binary.len() as u64);
        assert_eq!(result.symbols[&LabelId(0)], 8);
    }
}
