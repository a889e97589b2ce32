//! # Code generation
//!
//! Turns allocated MIR into the assembly stream. MIR's three-address
//! arithmetic becomes the target's two-address form with an extra move;
//! selects expand to a test plus conditional move; calls materialize the
//! argument window above the frame's registers and collect results from
//! it afterwards.
//!
//! The emitted stream starts with a synthetic start block that calls
//! `main` and terminates with its result in register 0.

use std::collections::HashMap;

use tracing::debug;

use crate::asm::{
    ArithmeticOperation, AsmInst, AsmValue, AssemblyStream, Block, Condition, ConversionKind,
    FFIType, ForeignFunctionInterface, LabelId, MemoryAddress, Type, UnaryArithmeticOperation,
};
use crate::ir::{Context, ForeignFunctionDecl, TypeData, TypeId};
use crate::mir::{
    Callee, CondCode, MemAddr, MirArithOp, MirConv, MirFunction, MirInst, MirModule, MirUnaryOp,
    Operand, OperandMode, Reg,
};

/// The register window shift of a call: three reserved frame words sit
/// between the caller's registers and the callee's window
const FRAME_METADATA_WORDS: u32 = 3;

/// Generate the assembly stream for a lowered module
pub fn generate(ctx: &Context, mir: &MirModule) -> AssemblyStream {
    let mut stream = AssemblyStream::new();
    stream.data = mir.data.clone();
    stream.address_placeholders = mir
        .address_placeholders
        .iter()
        .map(|(offset, name)| (*offset, name.clone()))
        .collect();

    let mut labels = LabelAllocator::default();
    // Function entry labels first so calls can reference them
    let mut entry_labels: HashMap<String, LabelId> = HashMap::new();
    for function in &mir.functions {
        entry_labels.insert(function.name.clone(), labels.fresh());
    }

    // Synthetic entry: call main, keep its result as the exit code
    if let Some(main_label) = entry_labels.get("main").copied() {
        stream.add(Block {
            id: labels.fresh(),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::Call {
                    target: main_label,
                    reg_offset: FRAME_METADATA_WORDS as u8,
                },
                AsmInst::Move {
                    dest: AsmValue::RegisterIndex(0),
                    src: AsmValue::RegisterIndex(FRAME_METADATA_WORDS as u8),
                    width: 8,
                },
                AsmInst::Terminate,
            ],
        });
    }

    for function in &mir.functions {
        debug!(function = %function.name, regs = function.next_reg, "generating code");
        FunctionCodegen {
            ctx,
            mir,
            function,
            labels: &mut labels,
            entry_labels: &entry_labels,
            block_labels: HashMap::new(),
        }
        .run(&mut stream);
    }
    stream
}

#[derive(Default)]
struct LabelAllocator {
    next: u64,
}

impl LabelAllocator {
    fn fresh(&mut self) -> LabelId {
        let id = LabelId(self.next);
        self.next += 1;
        id
    }
}

struct FunctionCodegen<'a> {
    ctx: &'a Context,
    mir: &'a MirModule,
    function: &'a MirFunction,
    labels: &'a mut LabelAllocator,
    entry_labels: &'a HashMap<String, LabelId>,
    block_labels: HashMap<u32, LabelId>,
}

impl FunctionCodegen<'_> {
    fn run(mut self, stream: &mut AssemblyStream) {
        for (index, _) in self.function.blocks.iter().enumerate() {
            let label = if index == 0 {
                self.entry_labels[&self.function.name]
            } else {
                self.labels.fresh()
            };
            self.block_labels.insert(index as u32, label);
        }
        for (index, block) in self.function.blocks.iter().enumerate() {
            let name = if index == 0 {
                self.function.name.clone()
            } else {
                format!("{}.{}", self.function.name, block.name)
            };
            let mut out = Block {
                id: self.block_labels[&(index as u32)],
                name,
                external: index == 0 && self.function.external,
                insts: Vec::new(),
            };
            for inst in &block.insts {
                self.emit(inst, &mut out.insts);
            }
            stream.add(out);
        }
    }

    fn reg8(&self, reg: Reg) -> u8 {
        debug_assert!(reg.0 < 256, "register index exceeds encoding");
        reg.0 as u8
    }

    fn mem(&self, addr: &MemAddr) -> MemoryAddress {
        MemoryAddress {
            base: self.reg8(addr.base),
            offset_reg: addr
                .offset_reg
                .map(|r| self.reg8(r))
                .unwrap_or(MemoryAddress::NO_OFFSET_REG),
            offset_factor: addr.offset_factor,
            offset_term: addr.offset_term,
        }
    }

    fn operand(&self, op: &Operand, width: u8) -> AsmValue {
        match op {
            Operand::Reg(r) => AsmValue::RegisterIndex(self.reg8(*r)),
            Operand::Imm(bits) => AsmValue::imm(*bits, width),
            Operand::Mem(addr) => AsmValue::Memory(self.mem(addr)),
        }
    }

    fn emit(&self, inst: &MirInst, out: &mut Vec<AsmInst>) {
        match inst {
            MirInst::Mov { dest, src, width } => match src {
                Operand::Reg(s) if s == dest => {}
                Operand::Reg(s) => out.push(AsmInst::Move {
                    dest: AsmValue::RegisterIndex(self.reg8(*dest)),
                    src: AsmValue::RegisterIndex(self.reg8(*s)),
                    width: 8,
                }),
                Operand::Imm(bits) => out.push(AsmInst::Move {
                    dest: AsmValue::RegisterIndex(self.reg8(*dest)),
                    src: AsmValue::Value64(*bits),
                    width: 8,
                }),
                Operand::Mem(addr) => out.push(AsmInst::Move {
                    dest: AsmValue::RegisterIndex(self.reg8(*dest)),
                    src: AsmValue::Memory(self.mem(addr)),
                    width: *width,
                }),
            },
            MirInst::Store { addr, src, width } => out.push(AsmInst::Move {
                dest: AsmValue::Memory(self.mem(addr)),
                src: AsmValue::RegisterIndex(self.reg8(*src)),
                width: *width,
            }),
            MirInst::CondMov {
                cc,
                dest,
                src,
                width,
            } => out.push(AsmInst::CondMove {
                cond: condition(*cc),
                dest: self.reg8(*dest),
                src: self.operand(src, 8),
                width: *width,
            }),
            MirInst::Lea { dest, addr } => out.push(AsmInst::Lea {
                dest: self.reg8(*dest),
                addr: self.mem(addr),
            }),
            MirInst::Lisp { dest, bytes } => out.push(AsmInst::LIncSP {
                dest: self.reg8(*dest),
                offset: *bytes,
            }),
            MirInst::Arith {
                op,
                mode,
                width,
                dest,
                lhs,
                rhs,
            } => self.emit_arith(*op, *mode, *width, *dest, *lhs, rhs, out),
            MirInst::UnaryArith {
                op,
                width,
                dest,
                src,
            } => {
                if dest != src {
                    out.push(AsmInst::Move {
                        dest: AsmValue::RegisterIndex(self.reg8(*dest)),
                        src: AsmValue::RegisterIndex(self.reg8(*src)),
                        width: 8,
                    });
                }
                let op = match op {
                    MirUnaryOp::LogicalNot => UnaryArithmeticOperation::LogicalNot,
                    MirUnaryOp::BitwiseNot => UnaryArithmeticOperation::BitwiseNot,
                    MirUnaryOp::Negate => UnaryArithmeticOperation::Negate,
                };
                out.push(AsmInst::UnaryArithmetic {
                    op,
                    reg: self.reg8(*dest),
                    width: *width,
                });
            }
            MirInst::Compare {
                mode,
                width,
                lhs,
                rhs,
            } => out.push(AsmInst::Compare {
                ty: operand_type(*mode),
                lhs: self.reg8(*lhs),
                rhs: self.operand(rhs, *width),
                width: *width,
            }),
            MirInst::Test {
                mode,
                width,
                operand,
            } => out.push(AsmInst::Test {
                ty: operand_type(*mode),
                reg: self.reg8(*operand),
                width: *width,
            }),
            MirInst::Set { cc, dest } => out.push(AsmInst::Set {
                cond: condition(*cc),
                dest: self.reg8(*dest),
            }),
            MirInst::Conv {
                conv,
                from_bits,
                to_bits,
                dest,
                src,
            } => self.emit_conv(*conv, *from_bits, *to_bits, *dest, *src, out),
            MirInst::Jump { cc, target } => out.push(AsmInst::Jump {
                cond: cc.map(condition),
                target: self.block_labels[&target.0],
            }),
            MirInst::Call {
                callee,
                args,
                dests,
            } => self.emit_call(callee, args, dests, out),
            MirInst::Return { values } => {
                self.emit_parallel_moves(
                    values
                        .iter()
                        .enumerate()
                        .map(|(i, &src)| (i as u8, self.reg8(src)))
                        .collect(),
                    out,
                );
                out.push(AsmInst::Return);
            }
            MirInst::Select {
                dest,
                cond,
                then_src,
                else_src,
                width,
            } => {
                out.push(AsmInst::Test {
                    ty: Type::Unsigned,
                    reg: self.reg8(*cond),
                    width: 1,
                });
                let dest8 = self.reg8(*dest);
                if *else_src == Operand::Reg(*dest) {
                    // The destination already holds the else value; only
                    // the taken case needs a move
                    out.push(AsmInst::CondMove {
                        cond: Condition::NotEqual,
                        dest: dest8,
                        src: self.operand(then_src, *width),
                        width: *width,
                    });
                } else {
                    if *then_src != Operand::Reg(*dest) {
                        out.push(AsmInst::Move {
                            dest: AsmValue::RegisterIndex(dest8),
                            src: self.operand(then_src, 8),
                            width: 8,
                        });
                    }
                    out.push(AsmInst::CondMove {
                        cond: Condition::Equal,
                        dest: dest8,
                        src: self.operand(else_src, *width),
                        width: *width,
                    });
                }
            }
            MirInst::Phi { .. } => unreachable!("phis are eliminated by register allocation"),
        }
    }

    fn emit_arith(
        &self,
        op: MirArithOp,
        mode: OperandMode,
        width: u8,
        dest: Reg,
        lhs: Reg,
        rhs: &Operand,
        out: &mut Vec<AsmInst>,
    ) {
        let asm_op = arithmetic_operation(op);
        let ty = operand_type(mode);
        let dest8 = self.reg8(dest);

        if *rhs == Operand::Reg(dest) && dest != lhs {
            // The destination aliases the right operand; commutative
            // operations simply swap sides
            let commutative = matches!(
                op,
                MirArithOp::Add | MirArithOp::Mul | MirArithOp::And | MirArithOp::Or
                    | MirArithOp::XOr
            ) && mode != OperandMode::Float;
            if commutative {
                out.push(AsmInst::Arithmetic {
                    op: asm_op,
                    ty,
                    dest: dest8,
                    src: AsmValue::RegisterIndex(self.reg8(lhs)),
                    width,
                });
                return;
            }
            // Otherwise stage the right operand in a scratch register
            let scratch = self.scratch_reg();
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(scratch),
                src: AsmValue::RegisterIndex(dest8),
                width: 8,
            });
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(dest8),
                src: AsmValue::RegisterIndex(self.reg8(lhs)),
                width: 8,
            });
            out.push(AsmInst::Arithmetic {
                op: asm_op,
                ty,
                dest: dest8,
                src: AsmValue::RegisterIndex(scratch),
                width,
            });
            return;
        }

        if dest != lhs {
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(dest8),
                src: AsmValue::RegisterIndex(self.reg8(lhs)),
                width: 8,
            });
        }
        let src = match op {
            // Shift amounts encode as 8-bit immediates
            MirArithOp::LShL | MirArithOp::LShR | MirArithOp::AShL | MirArithOp::AShR => {
                match rhs {
                    Operand::Imm(bits) => AsmValue::Value8(*bits as u8),
                    other => self.operand(other, width),
                }
            }
            _ => self.operand(rhs, width),
        };
        out.push(AsmInst::Arithmetic {
            op: asm_op,
            ty,
            dest: dest8,
            src,
            width,
        });
    }

    fn emit_conv(
        &self,
        conv: MirConv,
        from_bits: u8,
        to_bits: u8,
        dest: Reg,
        src: Reg,
        out: &mut Vec<AsmInst>,
    ) {
        let dest8 = self.reg8(dest);
        if dest != src {
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(dest8),
                src: AsmValue::RegisterIndex(self.reg8(src)),
                width: 8,
            });
        }
        match conv {
            MirConv::Sext => {
                let kind = match from_bits {
                    1 => ConversionKind::Sext1,
                    8 => ConversionKind::Sext8,
                    16 => ConversionKind::Sext16,
                    32 => ConversionKind::Sext32,
                    _ => return,
                };
                out.push(AsmInst::Convert {
                    conv: kind,
                    reg: dest8,
                });
            }
            MirConv::ZextTrunc => {
                if to_bits < 64 {
                    let mask = (1u64 << to_bits) - 1;
                    out.push(AsmInst::Arithmetic {
                        op: ArithmeticOperation::And,
                        ty: Type::Unsigned,
                        dest: dest8,
                        src: AsmValue::Value64(mask),
                        width: 8,
                    });
                }
            }
            MirConv::Fext => out.push(AsmInst::Convert {
                conv: ConversionKind::Fext,
                reg: dest8,
            }),
            MirConv::Ftrunc => out.push(AsmInst::Convert {
                conv: ConversionKind::Ftrunc,
                reg: dest8,
            }),
            MirConv::StoF | MirConv::UtoF => out.push(AsmInst::Convert {
                conv: ConversionKind::IntToFloat {
                    signed: conv == MirConv::StoF,
                    // The one-bit type widens through the byte form
                    from_bits: from_bits.max(8),
                    to_bits,
                },
                reg: dest8,
            }),
            MirConv::FtoS | MirConv::FtoU => out.push(AsmInst::Convert {
                conv: ConversionKind::FloatToInt {
                    signed: conv == MirConv::FtoS,
                    from_bits,
                    to_bits: to_bits.max(8),
                },
                reg: dest8,
            }),
        }
    }

    fn emit_call(
        &self,
        callee: &Callee,
        args: &[Reg],
        dests: &[Reg],
        out: &mut Vec<AsmInst>,
    ) {
        // Arguments go contiguously into the callee window, which starts
        // past every live register of this frame plus the metadata words
        let window = self.function.next_reg + FRAME_METADATA_WORDS;
        assert!(
            window as usize + args.len() <= 256,
            "call window exceeds the encodable register range"
        );
        for (i, &arg) in args.iter().enumerate() {
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex((window + i as u32) as u8),
                src: AsmValue::RegisterIndex(self.reg8(arg)),
                width: 8,
            });
        }
        let reg_offset = window as u8;
        match callee {
            Callee::Internal(name) => out.push(AsmInst::Call {
                target: self.entry_labels[name],
                reg_offset,
            }),
            Callee::Foreign(decl) => {
                let decl = &self.mir.foreign_decls[*decl as usize];
                out.push(AsmInst::CallForeign {
                    reg_offset,
                    interface: foreign_interface(self.ctx, decl),
                });
            }
            Callee::Reg(r) => out.push(AsmInst::CallReg {
                callee: self.reg8(*r),
                reg_offset,
            }),
            Callee::Mem(addr) => out.push(AsmInst::CallMem {
                callee: self.mem(addr),
                reg_offset,
            }),
        }
        for (i, &dest) in dests.iter().enumerate() {
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(self.reg8(dest)),
                src: AsmValue::RegisterIndex((window + i as u32) as u8),
                width: 8,
            });
        }
    }

    /// Sequence `dest <- src` register copies so no source is clobbered
    /// before it is read
    fn emit_parallel_moves(&self, mut copies: Vec<(u8, u8)>, out: &mut Vec<AsmInst>) {
        copies.retain(|&(d, s)| d != s);
        while !copies.is_empty() {
            if let Some(pos) = copies
                .iter()
                .position(|&(d, _)| !copies.iter().any(|&(_, s)| s == d))
            {
                let (d, s) = copies.remove(pos);
                out.push(AsmInst::Move {
                    dest: AsmValue::RegisterIndex(d),
                    src: AsmValue::RegisterIndex(s),
                    width: 8,
                });
                continue;
            }
            // Cycle: stage one source in the scratch register. Returns are
            // the only caller, so the scratch cannot be live here.
            let scratch = self.scratch_reg();
            let (_, src) = copies[0];
            out.push(AsmInst::Move {
                dest: AsmValue::RegisterIndex(scratch),
                src: AsmValue::RegisterIndex(src),
                width: 8,
            });
            for (_, s) in copies.iter_mut() {
                if *s == src {
                    *s = scratch;
                }
            }
        }
    }

    /// A register guaranteed dead at the point of use: one past the
    /// allocated frame registers
    fn scratch_reg(&self) -> u8 {
        let scratch = self.function.next_reg;
        assert!(scratch < 256, "no scratch register available");
        scratch as u8
    }
}

fn condition(cc: CondCode) -> Condition {
    match cc {
        CondCode::E => Condition::Equal,
        CondCode::NE => Condition::NotEqual,
        CondCode::L => Condition::Less,
        CondCode::LE => Condition::LessEq,
        CondCode::G => Condition::Greater,
        CondCode::GE => Condition::GreaterEq,
    }
}

fn operand_type(mode: OperandMode) -> Type {
    match mode {
        OperandMode::Signed => Type::Signed,
        OperandMode::Unsigned => Type::Unsigned,
        OperandMode::Float => Type::Float,
    }
}

fn arithmetic_operation(op: MirArithOp) -> ArithmeticOperation {
    match op {
        MirArithOp::Add => ArithmeticOperation::Add,
        MirArithOp::Sub => ArithmeticOperation::Sub,
        MirArithOp::Mul => ArithmeticOperation::Mul,
        MirArithOp::Div => ArithmeticOperation::Div,
        MirArithOp::Rem => ArithmeticOperation::Rem,
        MirArithOp::LShL => ArithmeticOperation::LShL,
        MirArithOp::LShR => ArithmeticOperation::LShR,
        MirArithOp::AShL => ArithmeticOperation::AShL,
        MirArithOp::AShR => ArithmeticOperation::AShR,
        MirArithOp::And => ArithmeticOperation::And,
        MirArithOp::Or => ArithmeticOperation::Or,
        MirArithOp::XOr => ArithmeticOperation::XOr,
    }
}

/// Convert an IR foreign declaration into the wire-level interface
pub fn foreign_interface(ctx: &Context, decl: &ForeignFunctionDecl) -> ForeignFunctionInterface {
    ForeignFunctionInterface {
        name: decl.name.clone(),
        argument_types: decl.params.iter().map(|&t| ffi_type(ctx, t)).collect(),
        return_type: ffi_type(ctx, decl.return_type),
    }
}

fn ffi_type(ctx: &Context, ty: TypeId) -> FFIType {
    match ctx.type_data(ty) {
        TypeData::Void => FFIType::Void,
        TypeData::Ptr | TypeData::Function { .. } => FFIType::Pointer,
        TypeData::Int { width } => match width {
            1 | 8 => FFIType::Int8,
            16 => FFIType::Int16,
            32 => FFIType::Int32,
            _ => FFIType::Int64,
        },
        TypeData::Float { width: 32 } => FFIType::Float32,
        TypeData::Float { .. } => FFIType::Float64,
        TypeData::Array { elem, count } => {
            FFIType::Struct(vec![ffi_type(ctx, *elem); *count as usize])
        }
        TypeData::Struct { members, .. } => {
            FFIType::Struct(members.iter().map(|&m| ffi_type(ctx, m)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::MirBlock;

    fn single_block_function(insts: Vec<MirInst>, next_reg: u32) -> MirModule {
        MirModule {
            functions: vec![MirFunction {
                name: "main".to_string(),
                external: true,
                num_params: 0,
                blocks: vec![MirBlock {
                    name: "entry".to_string(),
                    insts,
                    preds: vec![],
                }],
                next_reg,
                frame_size: 0,
            }],
            ..MirModule::default()
        }
    }

    #[test]
    fn emits_start_block_calling_main() {
        let ctx = Context::new();
        let mir = single_block_function(vec![MirInst::Return { values: vec![] }], 0);
        let stream = generate(&ctx, &mir);
        assert_eq!(stream.blocks[0].name, "start");
        assert!(matches!(
            stream.blocks[0].insts[0],
            AsmInst::Call { reg_offset: 3, .. }
        ));
        assert!(matches!(stream.blocks[0].insts[2], AsmInst::Terminate));
        assert_eq!(stream.blocks[1].name, "main");
    }

    #[test]
    fn three_address_arith_gets_a_move() {
        let ctx = Context::new();
        let mir = single_block_function(
            vec![
                MirInst::Arith {
                    op: MirArithOp::Add,
                    mode: OperandMode::Unsigned,
                    width: 8,
                    dest: Reg(2),
                    lhs: Reg(0),
                    rhs: Operand::Reg(Reg(1)),
                },
                MirInst::Return {
                    values: vec![Reg(2)],
                },
            ],
            3,
        );
        let stream = generate(&ctx, &mir);
        let insts = &stream.blocks[1].insts;
        assert!(matches!(
            insts[0],
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(2),
                src: AsmValue::RegisterIndex(0),
                ..
            }
        ));
        assert!(matches!(
            insts[1],
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Add,
                dest: 2,
                src: AsmValue::RegisterIndex(1),
                ..
            }
        ));
        // Return moves the value into register 0
        assert!(matches!(
            insts[2],
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(0),
                src: AsmValue::RegisterIndex(2),
                ..
            }
        ));
        assert!(matches!(insts[3], AsmInst::Return));
    }
}
