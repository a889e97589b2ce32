//! The dispatch core
//!
//! One `match` over the opcode byte executes an instruction and yields the
//! next instruction pointer. Handlers never commit partial state on
//! failure: the instruction pointer only advances after a handler
//! succeeds, so a raised exception leaves it at the faulting instruction.

use crate::error::{MemoryAccessReason, RuntimeException, VmResult};

use super::memory::VirtualPointer;
use super::opcode::OpCode;
use super::{builtin, ffi, VirtualMachine};

/// Integer operation selector shared by the 32- and 64-bit families
#[derive(Clone, Copy, PartialEq)]
enum IntOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Lsl,
    Lsr,
    Asl,
    Asr,
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, PartialEq)]
enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Operand source of binary operations
#[derive(Clone, Copy)]
enum Src {
    Reg,
    Imm(u8),
    Mem,
}

impl VirtualMachine {
    /// Fetch, decode and execute a single instruction
    pub(crate) fn dispatch_one(&mut self) -> VmResult<()> {
        let iptr = self.iptr;
        let opcode_byte = self.fetch_bytes(iptr, 1)?[0];
        let opcode = OpCode::from_byte(opcode_byte).ok_or(RuntimeException::InvalidOpcode {
            opcode: opcode_byte,
            offset: iptr,
        })?;
        let size = opcode.code_size();
        let mut operands = [0u8; 15];
        let operand_len = (size - 1) as usize;
        operands[..operand_len].copy_from_slice(self.fetch_bytes(iptr + 1, size - 1)?);
        let next = self.exec(opcode, &operands[..operand_len], iptr)?;
        self.iptr = next;
        Ok(())
    }

    fn fetch_bytes(&self, offset: u64, len: u64) -> VmResult<&[u8]> {
        self.memory
            .dereference_read(super::memory::VirtualMemory::static_data_pointer(offset), len)
    }

    fn reg(&self, index: u8) -> u64 {
        self.registers[self.reg_offset + index as usize]
    }

    fn set_reg(&mut self, index: u8, value: u64) {
        self.registers[self.reg_offset + index as usize] = value;
    }

    /// Resolve a 4-byte memory operand into a guest pointer
    fn operand_pointer(&self, bytes: &[u8]) -> VirtualPointer {
        let base = VirtualPointer::from_bits(self.reg(bytes[0]));
        let base = base.with_added_offset(u64::from(bytes[3]));
        if bytes[1] == 0xFF {
            return base;
        }
        let count = self.reg(bytes[1]);
        base.with_added_offset(count.wrapping_mul(u64::from(bytes[2])))
    }

    fn load_mem(&mut self, addr_bytes: &[u8], width: u8) -> VmResult<u64> {
        let ptr = self.operand_pointer(addr_bytes);
        if ptr.offset % u64::from(width) != 0 {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::MisalignedAccess,
                pointer: ptr,
                size: u64::from(width),
            });
        }
        let bytes = self.memory.dereference_read(ptr, u64::from(width))?;
        let mut buf = [0u8; 8];
        buf[..width as usize].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn store_mem(&mut self, addr_bytes: &[u8], width: u8, value: u64) -> VmResult<()> {
        let ptr = self.operand_pointer(addr_bytes);
        if ptr.offset % u64::from(width) != 0 {
            return Err(RuntimeException::MemoryAccess {
                reason: MemoryAccessReason::MisalignedAccess,
                pointer: ptr,
                size: u64::from(width),
            });
        }
        let bytes = self.memory.dereference(ptr, u64::from(width))?;
        bytes.copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    fn read_imm(bytes: &[u8], width: u8) -> u64 {
        let mut buf = [0u8; 8];
        buf[..width as usize].copy_from_slice(&bytes[..width as usize]);
        u64::from_le_bytes(buf)
    }

    fn cond(&self, opcode_group: u8) -> bool {
        let f = self.flags;
        match opcode_group {
            0 => f.equal,
            1 => !f.equal,
            2 => f.less,
            3 => f.less || f.equal,
            4 => !f.less && !f.equal,
            _ => !f.less,
        }
    }

    fn set_int_flags(&mut self, width: u8, a: u64, b: u64, signed: bool) {
        if signed {
            let (x, y) = (sext(a, width), sext(b, width));
            self.flags.less = x < y;
            self.flags.equal = x == y;
        } else {
            let (x, y) = (mask(a, width), mask(b, width));
            self.flags.less = x < y;
            self.flags.equal = x == y;
        }
    }

    fn set_float_flags(&mut self, width: u8, a: u64, b: u64) {
        if width == 4 {
            let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
            self.flags.less = x < y;
            self.flags.equal = x == y;
        } else {
            let (x, y) = (f64::from_bits(a), f64::from_bits(b));
            self.flags.less = x < y;
            self.flags.equal = x == y;
        }
    }

    /// Push a call frame: three reserved words below the callee window
    fn push_frame(&mut self, reg_shift: u8, return_iptr: u64) {
        let new_offset = self.reg_offset + reg_shift as usize;
        self.ensure_registers(new_offset + 256);
        self.registers[new_offset - 3] = self.stack_ptr.to_bits();
        self.registers[new_offset - 2] = u64::from(reg_shift);
        self.registers[new_offset - 1] = return_iptr;
        self.reg_offset = new_offset;
    }

    fn exec(&mut self, opcode: OpCode, b: &[u8], iptr: u64) -> VmResult<u64> {
        use OpCode::*;
        let size = opcode.code_size();
        let next = iptr + size;
        match opcode {
            // -- Calls and returns ----------------------------------------
            call => {
                let offset = i32::from_le_bytes(b[0..4].try_into().unwrap());
                self.push_frame(b[4], next);
                Ok(iptr.wrapping_add_signed(i64::from(offset)))
            }
            icallr => {
                let target = self.reg(b[0]);
                self.push_frame(b[1], next);
                Ok(target)
            }
            icallm => {
                let target = self.load_mem(&b[0..4], 8)?;
                self.push_frame(b[4], next);
                Ok(target)
            }
            ret => {
                if self.reg_offset == 0 {
                    // Root of the call tree: returning ends execution
                    return Ok(self.program_break);
                }
                let return_iptr = self.registers[self.reg_offset - 1];
                let reg_shift = self.registers[self.reg_offset - 2] as usize;
                self.stack_ptr =
                    VirtualPointer::from_bits(self.registers[self.reg_offset - 3]);
                self.reg_offset -= reg_shift;
                Ok(return_iptr)
            }
            cfng => {
                let window = self.reg_offset + b[0] as usize;
                let index = u16::from_le_bytes(b[1..3].try_into().unwrap());
                ffi::call_foreign(self, window, index)?;
                Ok(next)
            }
            cbltn => {
                let window = self.reg_offset + b[0] as usize;
                let index = u16::from_le_bytes(b[1..3].try_into().unwrap());
                if builtin::call_builtin(self, window, index)? {
                    Ok(self.program_break)
                } else {
                    Ok(next)
                }
            }
            terminate => Ok(self.program_break),

            // -- Moves ----------------------------------------------------
            mov64RR => {
                self.set_reg(b[0], self.reg(b[1]));
                Ok(next)
            }
            mov64RV => {
                self.set_reg(b[0], Self::read_imm(&b[1..], 8));
                Ok(next)
            }
            mov8MR | mov16MR | mov32MR | mov64MR => {
                let width = mov_width(opcode);
                self.store_mem(&b[0..4], width, self.reg(b[4]))?;
                Ok(next)
            }
            mov8RM | mov16RM | mov32RM | mov64RM => {
                let width = mov_width(opcode);
                let value = self.load_mem(&b[1..5], width)?;
                self.set_reg(b[0], value);
                Ok(next)
            }

            // -- Conditional moves ---------------------------------------
            cmove64RR | cmovne64RR | cmovl64RR | cmovle64RR | cmovg64RR | cmovge64RR => {
                if self.cond(cmov_cc(opcode)) {
                    self.set_reg(b[0], self.reg(b[1]));
                }
                Ok(next)
            }
            cmove64RV | cmovne64RV | cmovl64RV | cmovle64RV | cmovg64RV | cmovge64RV => {
                if self.cond(cmov_cc(opcode)) {
                    self.set_reg(b[0], Self::read_imm(&b[1..], 8));
                }
                Ok(next)
            }
            cmove8RM | cmove16RM | cmove32RM | cmove64RM | cmovne8RM | cmovne16RM
            | cmovne32RM | cmovne64RM | cmovl8RM | cmovl16RM | cmovl32RM | cmovl64RM
            | cmovle8RM | cmovle16RM | cmovle32RM | cmovle64RM | cmovg8RM | cmovg16RM
            | cmovg32RM | cmovg64RM | cmovge8RM | cmovge16RM | cmovge32RM | cmovge64RM => {
                // The load must be valid whether or not the move happens
                let value = self.load_mem(&b[1..5], cmov_width(opcode))?;
                if self.cond(cmov_cc(opcode)) {
                    self.set_reg(b[0], value);
                }
                Ok(next)
            }

            // -- Stack and addresses -------------------------------------
            lincsp => {
                let offset = u64::from(u16::from_le_bytes(b[1..3].try_into().unwrap()));
                if offset % 8 != 0 {
                    return Err(RuntimeException::InvalidStackAllocation { size: offset });
                }
                self.set_reg(b[0], self.stack_ptr.to_bits());
                self.stack_ptr = self.stack_ptr.with_added_offset(offset);
                Ok(next)
            }
            lea => {
                let ptr = self.operand_pointer(&b[1..5]);
                self.set_reg(b[0], ptr.to_bits());
                Ok(next)
            }

            // -- Jumps ----------------------------------------------------
            jmp | je | jne | jl | jle | jg | jge => {
                let taken = match opcode {
                    jmp => true,
                    je => self.cond(0),
                    jne => self.cond(1),
                    jl => self.cond(2),
                    jle => self.cond(3),
                    jg => self.cond(4),
                    _ => self.cond(5),
                };
                if taken {
                    let offset = i32::from_le_bytes(b[0..4].try_into().unwrap());
                    Ok(iptr.wrapping_add_signed(i64::from(offset)))
                } else {
                    Ok(next)
                }
            }

            // -- Compare, test, set --------------------------------------
            ucmp8RR | ucmp16RR | ucmp32RR | ucmp64RR | scmp8RR | scmp16RR | scmp32RR
            | scmp64RR => {
                let (width, signed) = cmp_info(opcode);
                self.set_int_flags(width, self.reg(b[0]), self.reg(b[1]), signed);
                Ok(next)
            }
            ucmp8RV | ucmp16RV | ucmp32RV | ucmp64RV | scmp8RV | scmp16RV | scmp32RV
            | scmp64RV => {
                let (width, signed) = cmp_info(opcode);
                let rhs = Self::read_imm(&b[1..], width);
                self.set_int_flags(width, self.reg(b[0]), rhs, signed);
                Ok(next)
            }
            fcmp32RR | fcmp64RR => {
                let width = if opcode == fcmp32RR { 4 } else { 8 };
                self.set_float_flags(width, self.reg(b[0]), self.reg(b[1]));
                Ok(next)
            }
            fcmp32RV | fcmp64RV => {
                let width = if opcode == fcmp32RV { 4 } else { 8 };
                let rhs = Self::read_imm(&b[1..], width);
                self.set_float_flags(width, self.reg(b[0]), rhs);
                Ok(next)
            }
            stest8 | stest16 | stest32 | stest64 | utest8 | utest16 | utest32 | utest64 => {
                let (width, signed) = test_info(opcode);
                self.set_int_flags(width, self.reg(b[0]), 0, signed);
                Ok(next)
            }
            sete | setne | setl | setle | setg | setge => {
                let cc = opcode as u8 - sete as u8;
                self.set_reg(b[0], u64::from(self.cond(cc)));
                Ok(next)
            }

            // -- Unary ----------------------------------------------------
            lnt => {
                self.set_reg(b[0], u64::from(self.reg(b[0]) == 0));
                Ok(next)
            }
            bnt => {
                self.set_reg(b[0], !self.reg(b[0]));
                Ok(next)
            }
            neg8 | neg16 | neg32 | neg64 => {
                let width = match opcode {
                    neg8 => 1,
                    neg16 => 2,
                    neg32 => 4,
                    _ => 8,
                };
                let value = mask(self.reg(b[0]).wrapping_neg(), width);
                self.set_reg(b[0], value);
                Ok(next)
            }

            // -- Conversions ---------------------------------------------
            sext1 => {
                let value = if self.reg(b[0]) & 1 != 0 { u64::MAX } else { 0 };
                self.set_reg(b[0], value);
                Ok(next)
            }
            sext8 | sext16 | sext32 => {
                let width = match opcode {
                    sext8 => 1,
                    sext16 => 2,
                    _ => 4,
                };
                self.set_reg(b[0], sext(self.reg(b[0]), width) as u64);
                Ok(next)
            }
            OpCode::fext => {
                let value = f64::from(f32::from_bits(self.reg(b[0]) as u32));
                self.set_reg(b[0], value.to_bits());
                Ok(next)
            }
            OpCode::ftrunc => {
                let value = f64::from_bits(self.reg(b[0])) as f32;
                self.set_reg(b[0], u64::from(value.to_bits()));
                Ok(next)
            }

            // -- Arithmetic ----------------------------------------------
            _ => {
                if let Some((op, width, src)) = int_arith_info(opcode) {
                    let a = self.reg(b[0]);
                    let rhs = match src {
                        Src::Reg => self.reg(b[1]),
                        Src::Imm(w) => Self::read_imm(&b[1..], w),
                        Src::Mem => self.load_mem(&b[1..5], width)?,
                    };
                    let result = eval_int_arith(op, width, a, rhs)?;
                    self.set_reg(b[0], result);
                    return Ok(next);
                }
                if let Some((op, width, src)) = float_arith_info(opcode) {
                    let a = self.reg(b[0]);
                    let rhs = match src {
                        Src::Reg => self.reg(b[1]),
                        Src::Imm(w) => Self::read_imm(&b[1..], w),
                        Src::Mem => self.load_mem(&b[1..5], width)?,
                    };
                    let result = eval_float_arith(op, width, a, rhs);
                    self.set_reg(b[0], result);
                    return Ok(next);
                }
                if let Some((signed, from_bits, to_bits)) = int_to_float_info(opcode) {
                    let raw = self.reg(b[0]);
                    let value = if signed {
                        sext(raw, from_bits / 8) as f64
                    } else {
                        mask(raw, from_bits / 8) as f64
                    };
                    let bits = if to_bits == 32 {
                        u64::from((value as f32).to_bits())
                    } else {
                        value.to_bits()
                    };
                    self.set_reg(b[0], bits);
                    return Ok(next);
                }
                if let Some((signed, from_bits, to_bits)) = float_to_int_info(opcode) {
                    let raw = self.reg(b[0]);
                    let value = if from_bits == 32 {
                        f64::from(f32::from_bits(raw as u32))
                    } else {
                        f64::from_bits(raw)
                    };
                    let bits = if signed {
                        mask((value as i64) as u64, to_bits / 8)
                    } else {
                        mask(value as u64, to_bits / 8)
                    };
                    self.set_reg(b[0], bits);
                    return Ok(next);
                }
                unreachable!("unhandled opcode {opcode}")
            }
        }
    }
}

fn mask(value: u64, width: u8) -> u64 {
    if width >= 8 {
        value
    } else {
        value & ((1u64 << (u64::from(width) * 8)) - 1)
    }
}

fn sext(value: u64, width: u8) -> i64 {
    if width >= 8 {
        return value as i64;
    }
    let shift = 64 - u32::from(width) * 8;
    ((value << shift) as i64) >> shift
}

fn mov_width(opcode: OpCode) -> u8 {
    use OpCode::*;
    match opcode {
        mov8MR | mov8RM => 1,
        mov16MR | mov16RM => 2,
        mov32MR | mov32RM => 4,
        _ => 8,
    }
}

/// Condition group of a conditional move: 0 e, 1 ne, 2 l, 3 le, 4 g, 5 ge
fn cmov_cc(opcode: OpCode) -> u8 {
    let index = opcode as u8 - OpCode::cmove64RR as u8;
    index / 6
}

fn cmov_width(opcode: OpCode) -> u8 {
    let index = (opcode as u8 - OpCode::cmove64RR as u8) % 6;
    match index {
        2 => 1,
        3 => 2,
        4 => 4,
        _ => 8,
    }
}

fn cmp_info(opcode: OpCode) -> (u8, bool) {
    use OpCode::*;
    match opcode {
        ucmp8RR | ucmp8RV => (1, false),
        ucmp16RR | ucmp16RV => (2, false),
        ucmp32RR | ucmp32RV => (4, false),
        ucmp64RR | ucmp64RV => (8, false),
        scmp8RR | scmp8RV => (1, true),
        scmp16RR | scmp16RV => (2, true),
        scmp32RR | scmp32RV => (4, true),
        _ => (8, true),
    }
}

fn test_info(opcode: OpCode) -> (u8, bool) {
    use OpCode::*;
    match opcode {
        stest8 => (1, true),
        stest16 => (2, true),
        stest32 => (4, true),
        stest64 => (8, true),
        utest8 => (1, false),
        utest16 => (2, false),
        utest32 => (4, false),
        _ => (8, false),
    }
}

fn int_arith_info(opcode: OpCode) -> Option<(IntOp, u8, Src)> {
    use OpCode::*;
    let base = add32RR as u8;
    let last = xor64RM as u8;
    let code = opcode as u8;
    if code < base || code > last {
        return None;
    }
    // Skip the float block in the middle of the range
    if (fadd32RR as u8..=fdiv64RM as u8).contains(&code) {
        return None;
    }
    let (op, group_base) = match code {
        c if c >= xor32RR as u8 => (IntOp::Xor, xor32RR as u8),
        c if c >= or32RR as u8 => (IntOp::Or, or32RR as u8),
        c if c >= and32RR as u8 => (IntOp::And, and32RR as u8),
        c if c >= asr32RR as u8 => (IntOp::Asr, asr32RR as u8),
        c if c >= asl32RR as u8 => (IntOp::Asl, asl32RR as u8),
        c if c >= lsr32RR as u8 => (IntOp::Lsr, lsr32RR as u8),
        c if c >= lsl32RR as u8 => (IntOp::Lsl, lsl32RR as u8),
        c if c >= srem32RR as u8 => (IntOp::SRem, srem32RR as u8),
        c if c >= urem32RR as u8 => (IntOp::URem, urem32RR as u8),
        c if c >= sdiv32RR as u8 => (IntOp::SDiv, sdiv32RR as u8),
        c if c >= udiv32RR as u8 => (IntOp::UDiv, udiv32RR as u8),
        c if c >= mul32RR as u8 => (IntOp::Mul, mul32RR as u8),
        c if c >= sub32RR as u8 => (IntOp::Sub, sub32RR as u8),
        _ => (IntOp::Add, add32RR as u8),
    };
    let index = code - group_base;
    let width = if index < 3 { 4 } else { 8 };
    let shift = matches!(op, IntOp::Lsl | IntOp::Lsr | IntOp::Asl | IntOp::Asr);
    let src = match index % 3 {
        0 => Src::Reg,
        1 => Src::Imm(if shift { 1 } else { width }),
        _ => Src::Mem,
    };
    Some((op, width, src))
}

fn float_arith_info(opcode: OpCode) -> Option<(FloatOp, u8, Src)> {
    use OpCode::*;
    let code = opcode as u8;
    if !(fadd32RR as u8..=fdiv64RM as u8).contains(&code) {
        return None;
    }
    let index = code - fadd32RR as u8;
    let op = match index / 6 {
        0 => FloatOp::Add,
        1 => FloatOp::Sub,
        2 => FloatOp::Mul,
        _ => FloatOp::Div,
    };
    let width = if index % 6 < 3 { 4 } else { 8 };
    let src = match index % 3 {
        0 => Src::Reg,
        1 => Src::Imm(width),
        _ => Src::Mem,
    };
    Some((op, width, src))
}

fn int_to_float_info(opcode: OpCode) -> Option<(bool, u8, u8)> {
    use OpCode::*;
    let code = opcode as u8;
    if !(s8tof32 as u8..=u64tof64 as u8).contains(&code) {
        return None;
    }
    let index = code - s8tof32 as u8;
    let signed = index < 8;
    let from_bits = 8u8 << (index % 4);
    let to_bits = if (index / 4) % 2 == 0 { 32 } else { 64 };
    Some((signed, from_bits, to_bits))
}

fn float_to_int_info(opcode: OpCode) -> Option<(bool, u8, u8)> {
    use OpCode::*;
    let code = opcode as u8;
    if !(f32tos8 as u8..=f64tou64 as u8).contains(&code) {
        return None;
    }
    let index = code - f32tos8 as u8;
    let signed = index < 8;
    let from_bits = if (index / 4) % 2 == 0 { 32 } else { 64 };
    let to_bits = 8u8 << (index % 4);
    Some((signed, from_bits, to_bits))
}

fn eval_int_arith(op: IntOp, width: u8, a: u64, b: u64) -> VmResult<u64> {
    let bits = u32::from(width) * 8;
    let result = match op {
        IntOp::Add => a.wrapping_add(b),
        IntOp::Sub => a.wrapping_sub(b),
        IntOp::Mul => a.wrapping_mul(b),
        IntOp::UDiv | IntOp::URem => {
            let (x, y) = (mask(a, width), mask(b, width));
            if y == 0 {
                return Err(RuntimeException::Arithmetic(
                    "division by zero".to_string(),
                ));
            }
            if op == IntOp::UDiv {
                x / y
            } else {
                x % y
            }
        }
        IntOp::SDiv | IntOp::SRem => {
            let (x, y) = (sext(a, width), sext(b, width));
            if y == 0 {
                return Err(RuntimeException::Arithmetic(
                    "signed division by zero".to_string(),
                ));
            }
            let checked = if op == IntOp::SDiv {
                x.checked_div(y)
            } else {
                x.checked_rem(y)
            };
            match checked {
                Some(v) => v as u64,
                None => {
                    return Err(RuntimeException::Arithmetic(
                        "signed overflow in division".to_string(),
                    ))
                }
            }
        }
        IntOp::Lsl | IntOp::Asl => {
            let shift = (b as u32) % bits;
            mask(a, width) << shift
        }
        IntOp::Lsr => {
            let shift = (b as u32) % bits;
            mask(a, width) >> shift
        }
        IntOp::Asr => {
            let shift = (b as u32) % bits;
            (sext(a, width) >> shift) as u64
        }
        IntOp::And => a & b,
        IntOp::Or => a | b,
        IntOp::Xor => a ^ b,
    };
    Ok(mask(result, width))
}

fn eval_float_arith(op: FloatOp, width: u8, a: u64, b: u64) -> u64 {
    if width == 4 {
        let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
        let r = match op {
            FloatOp::Add => x + y,
            FloatOp::Sub => x - y,
            FloatOp::Mul => x * y,
            FloatOp::Div => x / y,
        };
        u64::from(r.to_bits())
    } else {
        let (x, y) = (f64::from_bits(a), f64::from_bits(b));
        let r = match op {
            FloatOp::Add => x + y,
            FloatOp::Sub => x - y,
            FloatOp::Mul => x * y,
            FloatOp::Div => x / y,
        };
        r.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith_info_classification() {
        assert!(matches!(
            int_arith_info(OpCode::add32RR),
            Some((IntOp::Add, 4, Src::Reg))
        ));
        assert!(matches!(
            int_arith_info(OpCode::add64RV),
            Some((IntOp::Add, 8, Src::Imm(8)))
        ));
        assert!(matches!(
            int_arith_info(OpCode::srem64RM),
            Some((IntOp::SRem, 8, Src::Mem))
        ));
        assert!(matches!(
            int_arith_info(OpCode::lsl64RV),
            Some((IntOp::Lsl, 8, Src::Imm(1)))
        ));
        assert!(int_arith_info(OpCode::fadd32RR).is_none());
        assert!(int_arith_info(OpCode::mov64RR).is_none());
    }

    #[test]
    fn float_info_classification() {
        assert!(matches!(
            float_arith_info(OpCode::fadd32RR),
            Some((FloatOp::Add, 4, Src::Reg))
        ));
        assert!(matches!(
            float_arith_info(OpCode::fdiv64RM),
            Some((FloatOp::Div, 8, Src::Mem))
        ));
    }

    #[test]
    fn conversion_info_classification() {
        assert_eq!(int_to_float_info(OpCode::s8tof32), Some((true, 8, 32)));
        assert_eq!(int_to_float_info(OpCode::s64tof64), Some((true, 64, 64)));
        assert_eq!(int_to_float_info(OpCode::u32tof32), Some((false, 32, 32)));
        assert_eq!(float_to_int_info(OpCode::f32tos8), Some((true, 32, 8)));
        assert_eq!(float_to_int_info(OpCode::f64tou64), Some((false, 64, 64)));
    }

    #[test]
    fn signed_division_errors() {
        assert!(eval_int_arith(IntOp::SDiv, 8, 1, 0).is_err());
        assert!(eval_int_arith(IntOp::SDiv, 8, i64::MIN as u64, u64::MAX).is_err());
        assert_eq!(
            eval_int_arith(IntOp::SDiv, 8, (-6i64) as u64, 2).unwrap() as i64,
            -3
        );
    }

    #[test]
    fn unsigned_wraps() {
        assert_eq!(eval_int_arith(IntOp::Add, 4, 0xFFFF_FFFF, 1).unwrap(), 0);
        assert_eq!(
            eval_int_arith(IntOp::Sub, 8, 2, (-6i64) as u64).unwrap(),
            8
        );
    }
}
