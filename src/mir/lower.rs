//! IR to MIR lowering (instruction selection)
//!
//! Each IR instruction maps to one or more MIR instructions in the same
//! control-flow structure. Types lower to byte widths; values wider than a
//! register occupy a group of consecutive virtual registers in 8-byte
//! chunks (fat pointers are the two-register case). Sub-register integers
//! keep whatever high bits their producers left behind: consumers that are
//! sensitive to them (divisions, conversions) normalize explicitly, while
//! width-specific compares and memory accesses read only the low bytes.

use std::collections::HashMap;

use crate::ir::{
    ArithmeticOp, CompareMode, CompareOp, ConstData, Context, Conversion, Function, InstId,
    InstKind, Module, TypeData, UnaryOp, Value,
};

use super::{
    Callee, CondCode, MemAddr, MirArithOp, MirBlock, MirBlockId, MirConv, MirFunction, MirInst,
    MirModule, MirUnaryOp, Operand, OperandMode, Reg,
};

/// The pointer bits of static-data offset `o`: slot 1, offset `o`
pub fn static_data_pointer(offset: u64) -> u64 {
    (1u64 << 48) | offset
}

/// Lower a whole IR module
pub fn lower_module(ctx: &Context, module: &Module) -> MirModule {
    let mut out = MirModule {
        foreign_decls: module.foreign_decls.clone(),
        ..MirModule::default()
    };

    // Globals go into the data section in declaration order
    let mut global_offsets = Vec::new();
    for global in &module.globals {
        let align = ctx.align_of(global.value_type).max(8);
        while out.data.len() as u64 % align != 0 {
            out.data.push(0);
        }
        global_offsets.push(out.data.len() as u64);
        serialize_const(ctx, global.init, &mut out.data);
        let size = ctx.size_of(global.value_type) as usize;
        while out.data.len() < global_offsets.last().copied().unwrap() as usize + size {
            out.data.push(0);
        }
    }

    for id in module.function_ids() {
        out.functions
            .push(lower_function(ctx, module, module.function(id), &global_offsets));
    }
    out
}

fn serialize_const(ctx: &Context, c: crate::ir::ConstId, out: &mut Vec<u8>) {
    match ctx.const_data(c) {
        ConstData::Int { bits, ty } => {
            let size = ctx.size_of(*ty) as usize;
            out.extend_from_slice(&bits.to_le_bytes()[..size]);
        }
        ConstData::Float { bits, ty } => {
            let size = ctx.size_of(*ty) as usize;
            out.extend_from_slice(&bits.to_le_bytes()[..size]);
        }
        ConstData::NullPtr => out.extend_from_slice(&0u64.to_le_bytes()),
        ConstData::Undef(ty) => {
            out.extend(std::iter::repeat(0).take(ctx.size_of(*ty) as usize));
        }
        ConstData::Aggregate { ty, elems } => {
            let start = out.len() as u64;
            for (i, &elem) in elems.iter().enumerate() {
                let offset = ctx.member_offset(*ty, i as u32);
                while (out.len() as u64) < start + offset {
                    out.push(0);
                }
                serialize_const(ctx, elem, out);
            }
            let total = ctx.size_of(*ty);
            while (out.len() as u64) < start + total {
                out.push(0);
            }
        }
    }
}

/// Lower one function
pub fn lower_function(
    ctx: &Context,
    module: &Module,
    function: &Function,
    global_offsets: &[u64],
) -> MirFunction {
    Lowerer::new(ctx, module, function, global_offsets).run()
}

struct Lowerer<'a> {
    ctx: &'a Context,
    module: &'a Module,
    function: &'a Function,
    global_offsets: &'a [u64],
    out: MirFunction,
    block_map: HashMap<crate::ir::BlockId, MirBlockId>,
    /// Register group per IR instruction result
    inst_regs: HashMap<InstId, Vec<Reg>>,
    /// Register group per parameter
    param_regs: Vec<Vec<Reg>>,
    /// Frame pointer register (old stack pointer), present when the
    /// function has allocas
    frame_reg: Option<Reg>,
    /// Frame offset per alloca
    alloca_offsets: HashMap<InstId, u32>,
    current: MirBlockId,
}

impl<'a> Lowerer<'a> {
    fn new(
        ctx: &'a Context,
        module: &'a Module,
        function: &'a Function,
        global_offsets: &'a [u64],
    ) -> Self {
        Lowerer {
            ctx,
            module,
            function,
            global_offsets,
            out: MirFunction {
                name: function.name.clone(),
                external: matches!(function.visibility, crate::ir::Visibility::External),
                num_params: 0,
                blocks: Vec::new(),
                next_reg: 0,
                frame_size: 0,
            },
            block_map: HashMap::new(),
            inst_regs: HashMap::new(),
            param_regs: Vec::new(),
            frame_reg: None,
            alloca_offsets: HashMap::new(),
            current: MirBlockId(0),
        }
    }

    fn run(mut self) -> MirFunction {
        // Parameters occupy the first registers of the window
        for param in &self.function.params {
            let regs = self.reg_group(self.ctx.size_of(param.ty));
            self.param_regs.push(regs);
        }
        self.out.num_params = self.out.next_reg;

        for (index, block) in self.function.block_ids().into_iter().enumerate() {
            let id = MirBlockId(index as u32);
            self.block_map.insert(block, id);
            self.out.blocks.push(MirBlock {
                name: self.function.block(block).name.clone(),
                ..MirBlock::default()
            });
        }

        // Frame layout: one pass over the allocas, then a single stack
        // increment in the entry block
        for block in self.function.block_ids() {
            for &inst in self.function.block(block).insts() {
                if let InstKind::Alloca { allocated } = &self.function.inst(inst).kind {
                    let count = match self.function.inst(inst).operands()[0] {
                        Value::Const(c) => match self.ctx.const_data(c) {
                            ConstData::Int { bits, .. } => *bits,
                            _ => panic!("alloca count must be an integer constant"),
                        },
                        _ => panic!("dynamic alloca counts are not supported"),
                    };
                    let size = (self.ctx.size_of(*allocated) * count + 7) & !7;
                    self.alloca_offsets.insert(inst, self.out.frame_size);
                    self.out.frame_size += size as u32;
                }
            }
        }
        if self.out.frame_size > 0 {
            let fp = self.out.fresh_reg();
            self.frame_reg = Some(fp);
            let bytes = self.out.frame_size as u16;
            self.out.blocks[0].insts.push(MirInst::Lisp { dest: fp, bytes });
        }

        // Pre-assign result groups so phis can reference forward values
        for block in self.function.block_ids() {
            for &inst in self.function.block(block).insts() {
                let ty = self.function.inst(inst).ty;
                let size = self.ctx.size_of(ty);
                if size > 0 {
                    let regs = self.reg_group(size);
                    self.inst_regs.insert(inst, regs);
                }
            }
        }

        for block in self.function.block_ids() {
            self.current = self.block_map[&block];
            for &pred in self.function.block(block).predecessors() {
                let mapped = self.block_map[&pred];
                self.out.blocks[self.current.0 as usize].preds.push(mapped);
            }
            for &inst in self.function.block(block).insts().to_vec().iter() {
                self.lower_inst(inst);
            }
        }
        self.out
    }

    fn reg_group(&mut self, size: u64) -> Vec<Reg> {
        let count = size.div_ceil(8).max(1);
        (0..count).map(|_| self.out.fresh_reg()).collect()
    }

    fn emit(&mut self, inst: MirInst) {
        self.out.blocks[self.current.0 as usize].insts.push(inst);
    }

    /// Materialize any IR value into its register group
    fn value_regs(&mut self, value: Value) -> Vec<Reg> {
        match value {
            Value::Inst(i) => self.inst_regs[&i].clone(),
            Value::Param(i) => self.param_regs[i as usize].clone(),
            Value::Const(c) => {
                let words = const_words(self.ctx, c);
                let mut regs = Vec::new();
                for word in words {
                    let dest = self.out.fresh_reg();
                    self.emit(MirInst::Mov {
                        dest,
                        src: Operand::Imm(word),
                        width: 8,
                    });
                    regs.push(dest);
                }
                regs
            }
            Value::Global(g) => {
                let dest = self.out.fresh_reg();
                let ptr = static_data_pointer(self.global_offsets[g.0 as usize]);
                self.emit(MirInst::Mov {
                    dest,
                    src: Operand::Imm(ptr),
                    width: 8,
                });
                vec![dest]
            }
            Value::Function(_) | Value::Block(_) => {
                panic!("code addresses are lowered by their consumers")
            }
        }
    }

    fn scalar(&mut self, value: Value) -> Reg {
        let regs = self.value_regs(value);
        debug_assert_eq!(regs.len(), 1);
        regs[0]
    }

    fn value_width(&self, value: Value) -> u8 {
        self.ctx.size_of(self.function.value_type(self.ctx, value)).max(1) as u8
    }

    /// An address whose byte offset may exceed the 8-bit term
    fn address_with_offset(&mut self, base: Reg, offset: u64) -> MemAddr {
        if offset <= u8::MAX as u64 {
            return MemAddr::base_offset(base, offset as u8);
        }
        let off = self.out.fresh_reg();
        self.emit(MirInst::Mov {
            dest: off,
            src: Operand::Imm(offset),
            width: 8,
        });
        let sum = self.out.fresh_reg();
        self.emit(MirInst::Arith {
            op: MirArithOp::Add,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: sum,
            lhs: base,
            rhs: Operand::Reg(off),
        });
        MemAddr::base(sum)
    }

    fn lower_inst(&mut self, inst: InstId) {
        let data = self.function.inst(inst);
        let kind = data.kind.clone();
        let operands: Vec<Value> = data.operands().to_vec();
        let result_ty = data.ty;

        match kind {
            InstKind::Alloca { .. } => {
                let offset = self.alloca_offsets[&inst];
                let fp = self.frame_reg.expect("frame register exists");
                let dest = self.inst_regs[&inst][0];
                let addr = self.address_with_offset(fp, u64::from(offset));
                self.emit(MirInst::Lea { dest, addr });
            }
            InstKind::Load => {
                let base = self.scalar(operands[0]);
                let dests = self.inst_regs[&inst].clone();
                let size = self.ctx.size_of(result_ty);
                let align = self.ctx.align_of(result_ty);
                self.emit_chunked_load(base, &dests, size, align);
            }
            InstKind::Store => {
                let base = self.scalar(operands[0]);
                let srcs = self.value_regs(operands[1]);
                let value_ty = self.function.value_type(self.ctx, operands[1]);
                let size = self.ctx.size_of(value_ty);
                let align = self.ctx.align_of(value_ty);
                self.emit_chunked_store(base, &srcs, size, align);
            }
            InstKind::GetElementPointer {
                inbounds,
                member_indices,
            } => {
                self.lower_gep(inst, inbounds, &member_indices, &operands);
            }
            InstKind::ExtractValue { indices } => {
                self.lower_extract(inst, &indices, &operands);
            }
            InstKind::InsertValue { indices } => {
                self.lower_insert(inst, &indices, &operands);
            }
            InstKind::Arithmetic(op) => self.lower_arith(inst, op, &operands, result_ty),
            InstKind::UnaryArithmetic(op) => {
                let dest = self.inst_regs[&inst][0];
                let src = self.scalar(operands[0]);
                let width = self.ctx.size_of(result_ty).max(1) as u8;
                let op = match op {
                    UnaryOp::BitwiseNot => MirUnaryOp::BitwiseNot,
                    UnaryOp::LogicalNot => MirUnaryOp::LogicalNot,
                    UnaryOp::Negate => MirUnaryOp::Negate,
                };
                self.emit(MirInst::UnaryArith {
                    op,
                    width,
                    dest,
                    src,
                });
            }
            InstKind::Compare { mode, op } => {
                let lhs = self.scalar(operands[0]);
                let rhs = self.scalar(operands[1]);
                let width = self.value_width(operands[0]);
                let mode = match mode {
                    CompareMode::Signed => OperandMode::Signed,
                    CompareMode::Unsigned => OperandMode::Unsigned,
                    CompareMode::Float => OperandMode::Float,
                };
                self.emit(MirInst::Compare {
                    mode,
                    width,
                    lhs,
                    rhs: Operand::Reg(rhs),
                });
                let dest = self.inst_regs[&inst][0];
                self.emit(MirInst::Set {
                    cc: cond_code(op),
                    dest,
                });
            }
            InstKind::Conversion(conv) => self.lower_conversion(inst, conv, &operands),
            InstKind::Phi { preds } => {
                let dests = self.inst_regs[&inst].clone();
                for (chunk, &dest) in dests.iter().enumerate() {
                    let mut args = Vec::new();
                    for (&pred, &value) in preds.iter().zip(operands.iter()) {
                        // Constant phi inputs are materialized in the
                        // predecessor by register allocation's phi
                        // elimination; here we still need a register, so
                        // constants get a dedicated one at the pred's end.
                        let reg = self.phi_input_reg(pred, value, chunk);
                        args.push((self.block_map[&pred], reg));
                    }
                    self.emit(MirInst::Phi { dest, args });
                }
            }
            InstKind::Select => {
                let cond = self.scalar(operands[0]);
                let then_regs = self.value_regs(operands[1]);
                let else_regs = self.value_regs(operands[2]);
                let dests = self.inst_regs[&inst].clone();
                let width = 8u8;
                for ((dest, t), e) in dests.iter().zip(&then_regs).zip(&else_regs) {
                    self.emit(MirInst::Select {
                        dest: *dest,
                        cond,
                        then_src: Operand::Reg(*t),
                        else_src: Operand::Reg(*e),
                        width,
                    });
                }
            }
            InstKind::Call => {
                let callee = match operands[0] {
                    Value::Function(f) => Callee::Internal(self.module.function(f).name.clone()),
                    other => Callee::Reg(self.scalar(other)),
                };
                let mut args = Vec::new();
                for &arg in &operands[1..] {
                    args.extend(self.value_regs(arg));
                }
                let dests = self.inst_regs.get(&inst).cloned().unwrap_or_default();
                self.emit(MirInst::Call {
                    callee,
                    args,
                    dests,
                });
            }
            InstKind::ForeignCall { decl } => {
                let mut args = Vec::new();
                for &arg in &operands {
                    args.extend(self.value_regs(arg));
                }
                let dests = self.inst_regs.get(&inst).cloned().unwrap_or_default();
                self.emit(MirInst::Call {
                    callee: Callee::Foreign(decl),
                    args,
                    dests,
                });
            }
            InstKind::Goto => {
                let Value::Block(target) = operands[0] else {
                    unreachable!()
                };
                self.emit(MirInst::Jump {
                    cc: None,
                    target: self.block_map[&target],
                });
            }
            InstKind::Branch => {
                let cond = self.scalar(operands[0]);
                let (Value::Block(then_b), Value::Block(else_b)) = (operands[1], operands[2])
                else {
                    unreachable!()
                };
                self.emit(MirInst::Test {
                    mode: OperandMode::Unsigned,
                    width: 1,
                    operand: cond,
                });
                self.emit(MirInst::Jump {
                    cc: Some(CondCode::NE),
                    target: self.block_map[&then_b],
                });
                self.emit(MirInst::Jump {
                    cc: None,
                    target: self.block_map[&else_b],
                });
            }
            InstKind::Return => {
                let values = match operands.first() {
                    Some(&v) => self.value_regs(v),
                    None => Vec::new(),
                };
                self.emit(MirInst::Return { values });
            }
        }
    }

    /// Register for a phi input, materializing constants at the end of the
    /// predecessor block
    fn phi_input_reg(&mut self, pred: crate::ir::BlockId, value: Value, chunk: usize) -> Reg {
        match value {
            Value::Inst(i) => self.inst_regs[&i][chunk],
            Value::Param(i) => self.param_regs[i as usize][chunk],
            Value::Const(c) => {
                let word = const_words(self.ctx, c)[chunk];
                let dest = self.out.fresh_reg();
                let pred_id = self.block_map[&pred];
                let block = &mut self.out.blocks[pred_id.0 as usize];
                // Keep the materialization ahead of the terminator when the
                // predecessor is already lowered
                let pos = block
                    .insts
                    .iter()
                    .position(MirInst::is_terminator)
                    .unwrap_or(block.insts.len());
                block.insts.insert(
                    pos,
                    MirInst::Mov {
                        dest,
                        src: Operand::Imm(word),
                        width: 8,
                    },
                );
                dest
            }
            _ => panic!("unsupported phi input"),
        }
    }

    fn emit_chunked_load(&mut self, base: Reg, dests: &[Reg], size: u64, align: u64) {
        let max_width = align.min(8) as u8;
        let mut remaining = size;
        let mut offset = 0u64;
        while remaining > 0 {
            let width = chunk_width(remaining).min(max_width);
            let chunk = (offset / 8) as usize;
            let in_chunk = offset % 8;
            let addr = self.address_with_offset(base, offset);
            if in_chunk == 0 {
                self.emit(MirInst::Mov {
                    dest: dests[chunk],
                    src: Operand::Mem(addr),
                    width,
                });
            } else {
                // A later part of an odd-sized chunk: merge shifted bits
                // into the register already holding the low part
                let part = self.out.fresh_reg();
                self.emit(MirInst::Mov {
                    dest: part,
                    src: Operand::Mem(addr),
                    width,
                });
                self.emit(MirInst::Arith {
                    op: MirArithOp::LShL,
                    mode: OperandMode::Unsigned,
                    width: 8,
                    dest: part,
                    lhs: part,
                    rhs: Operand::Imm(in_chunk * 8),
                });
                self.emit(MirInst::Arith {
                    op: MirArithOp::Or,
                    mode: OperandMode::Unsigned,
                    width: 8,
                    dest: dests[chunk],
                    lhs: dests[chunk],
                    rhs: Operand::Reg(part),
                });
            }
            remaining -= u64::from(width);
            offset += u64::from(width);
        }
    }

    fn emit_chunked_store(&mut self, base: Reg, srcs: &[Reg], size: u64, align: u64) {
        let max_width = align.min(8) as u8;
        let mut remaining = size;
        let mut offset = 0u64;
        while remaining > 0 {
            let width = chunk_width(remaining).min(max_width);
            let chunk = (offset / 8) as usize;
            let in_chunk = offset % 8;
            let addr = self.address_with_offset(base, offset);
            let src = if in_chunk == 0 {
                srcs[chunk]
            } else {
                // Stores read the low bytes, so shift the part down first
                let part = self.out.fresh_reg();
                self.emit(MirInst::Mov {
                    dest: part,
                    src: Operand::Reg(srcs[chunk]),
                    width: 8,
                });
                self.emit(MirInst::Arith {
                    op: MirArithOp::LShR,
                    mode: OperandMode::Unsigned,
                    width: 8,
                    dest: part,
                    lhs: part,
                    rhs: Operand::Imm(in_chunk * 8),
                });
                part
            };
            self.emit(MirInst::Store { addr, src, width });
            remaining -= u64::from(width);
            offset += u64::from(width);
        }
    }

    fn lower_gep(
        &mut self,
        inst: InstId,
        inbounds: crate::ir::TypeId,
        member_indices: &[u32],
        operands: &[Value],
    ) {
        let base = self.scalar(operands[0]);
        let elem_size = self.ctx.size_of(inbounds);
        // Static member path offset
        let mut member_offset = 0u64;
        let mut ty = inbounds;
        for &index in member_indices {
            member_offset += self.ctx.member_offset(ty, index);
            ty = self.ctx.member_type(ty, index);
        }
        let dest = self.inst_regs[&inst][0];

        if let Value::Const(c) = operands[1] {
            if let ConstData::Int { bits, .. } = self.ctx.const_data(c) {
                let offset = elem_size * bits + member_offset;
                let addr = self.address_with_offset(base, offset);
                self.emit(MirInst::Lea { dest, addr });
                return;
            }
        }
        let index = self.scalar(operands[1]);
        if elem_size <= u8::MAX as u64 && member_offset <= u8::MAX as u64 {
            self.emit(MirInst::Lea {
                dest,
                addr: MemAddr {
                    base,
                    offset_reg: Some(index),
                    offset_factor: elem_size as u8,
                    offset_term: member_offset as u8,
                },
            });
            return;
        }
        // Oversized scale or displacement: compute explicitly
        let scale = self.out.fresh_reg();
        self.emit(MirInst::Mov {
            dest: scale,
            src: Operand::Imm(elem_size),
            width: 8,
        });
        let scaled = self.out.fresh_reg();
        self.emit(MirInst::Arith {
            op: MirArithOp::Mul,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: scaled,
            lhs: index,
            rhs: Operand::Reg(scale),
        });
        let sum = self.out.fresh_reg();
        self.emit(MirInst::Arith {
            op: MirArithOp::Add,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: sum,
            lhs: base,
            rhs: Operand::Reg(scaled),
        });
        let addr = self.address_with_offset(sum, member_offset);
        self.emit(MirInst::Lea { dest, addr });
    }

    fn lower_extract(&mut self, inst: InstId, indices: &[u32], operands: &[Value]) {
        let agg_regs = self.value_regs(operands[0]);
        let mut ty = self.function.value_type(self.ctx, operands[0]);
        let mut offset = 0u64;
        for &index in indices {
            offset += self.ctx.member_offset(ty, index);
            ty = self.ctx.member_type(ty, index);
        }
        let size = self.ctx.size_of(ty);
        let dests = self.inst_regs[&inst].clone();

        if offset % 8 == 0 {
            // Aligned chunk: straight register copies
            let first = (offset / 8) as usize;
            for (i, &dest) in dests.iter().enumerate() {
                self.emit(MirInst::Mov {
                    dest,
                    src: Operand::Reg(agg_regs[first + i]),
                    width: 8,
                });
            }
            return;
        }
        // Sub-register member: shift it down and mask
        debug_assert!(size < 8);
        let chunk = agg_regs[(offset / 8) as usize];
        let shift = (offset % 8) * 8;
        let dest = dests[0];
        self.emit(MirInst::Mov {
            dest,
            src: Operand::Reg(chunk),
            width: 8,
        });
        self.emit(MirInst::Arith {
            op: MirArithOp::LShR,
            mode: OperandMode::Unsigned,
            width: 8,
            dest,
            lhs: dest,
            rhs: Operand::Imm(shift),
        });
        let mask = (1u64 << (size * 8)) - 1;
        self.emit(MirInst::Arith {
            op: MirArithOp::And,
            mode: OperandMode::Unsigned,
            width: 8,
            dest,
            lhs: dest,
            rhs: Operand::Imm(mask),
        });
    }

    fn lower_insert(&mut self, inst: InstId, indices: &[u32], operands: &[Value]) {
        let agg_regs = self.value_regs(operands[0]);
        let elem_regs = self.value_regs(operands[1]);
        let mut ty = self.function.value_type(self.ctx, operands[0]);
        let mut offset = 0u64;
        for &index in indices {
            offset += self.ctx.member_offset(ty, index);
            ty = self.ctx.member_type(ty, index);
        }
        let size = self.ctx.size_of(ty);
        let dests = self.inst_regs[&inst].clone();

        // Copy the aggregate wholesale first
        for (&dest, &src) in dests.iter().zip(&agg_regs) {
            self.emit(MirInst::Mov {
                dest,
                src: Operand::Reg(src),
                width: 8,
            });
        }
        if offset % 8 == 0 && size % 8 == 0 {
            let first = (offset / 8) as usize;
            for (i, &src) in elem_regs.iter().enumerate() {
                self.emit(MirInst::Mov {
                    dest: dests[first + i],
                    src: Operand::Reg(src),
                    width: 8,
                });
            }
            return;
        }
        debug_assert!(size < 8);
        let chunk = dests[(offset / 8) as usize];
        let shift = (offset % 8) * 8;
        let mask = ((1u64 << (size * 8)) - 1) << shift;
        // chunk = (chunk & !mask) | ((elem << shift) & mask)
        self.emit(MirInst::Arith {
            op: MirArithOp::And,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: chunk,
            lhs: chunk,
            rhs: Operand::Imm(!mask),
        });
        let shifted = self.out.fresh_reg();
        self.emit(MirInst::Mov {
            dest: shifted,
            src: Operand::Reg(elem_regs[0]),
            width: 8,
        });
        self.emit(MirInst::Arith {
            op: MirArithOp::LShL,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: shifted,
            lhs: shifted,
            rhs: Operand::Imm(shift),
        });
        self.emit(MirInst::Arith {
            op: MirArithOp::And,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: shifted,
            lhs: shifted,
            rhs: Operand::Imm(mask),
        });
        self.emit(MirInst::Arith {
            op: MirArithOp::Or,
            mode: OperandMode::Unsigned,
            width: 8,
            dest: chunk,
            lhs: chunk,
            rhs: Operand::Reg(shifted),
        });
    }

    fn lower_arith(
        &mut self,
        inst: InstId,
        op: ArithmeticOp,
        operands: &[Value],
        result_ty: crate::ir::TypeId,
    ) {
        let dest = self.inst_regs[&inst][0];
        let mut lhs = self.scalar(operands[0]);
        let mut rhs = self.scalar(operands[1]);
        let size = self.ctx.size_of(result_ty).max(1) as u8;
        // The VM computes at 32 and 64 bits; narrower operations use the
        // 32-bit form, whose low bits match modular semantics
        let width = size.max(4);
        let (mir_op, mode) = match op {
            ArithmeticOp::Add => (MirArithOp::Add, OperandMode::Unsigned),
            ArithmeticOp::Sub => (MirArithOp::Sub, OperandMode::Unsigned),
            ArithmeticOp::Mul => (MirArithOp::Mul, OperandMode::Unsigned),
            ArithmeticOp::UDiv => (MirArithOp::Div, OperandMode::Unsigned),
            ArithmeticOp::SDiv => (MirArithOp::Div, OperandMode::Signed),
            ArithmeticOp::URem => (MirArithOp::Rem, OperandMode::Unsigned),
            ArithmeticOp::SRem => (MirArithOp::Rem, OperandMode::Signed),
            ArithmeticOp::FAdd => (MirArithOp::Add, OperandMode::Float),
            ArithmeticOp::FSub => (MirArithOp::Sub, OperandMode::Float),
            ArithmeticOp::FMul => (MirArithOp::Mul, OperandMode::Float),
            ArithmeticOp::FDiv => (MirArithOp::Div, OperandMode::Float),
            ArithmeticOp::LShL => (MirArithOp::LShL, OperandMode::Unsigned),
            ArithmeticOp::LShR => (MirArithOp::LShR, OperandMode::Unsigned),
            ArithmeticOp::AShL => (MirArithOp::AShL, OperandMode::Unsigned),
            ArithmeticOp::AShR => (MirArithOp::AShR, OperandMode::Signed),
            ArithmeticOp::And => (MirArithOp::And, OperandMode::Unsigned),
            ArithmeticOp::Or => (MirArithOp::Or, OperandMode::Unsigned),
            ArithmeticOp::XOr => (MirArithOp::XOr, OperandMode::Unsigned),
        };
        // Divisions and right shifts see the whole register: normalize
        // narrow operands first
        if size < width
            && matches!(
                mir_op,
                MirArithOp::Div | MirArithOp::Rem | MirArithOp::LShR | MirArithOp::AShR
            )
        {
            lhs = self.normalize(lhs, size, mode);
            rhs = self.normalize(rhs, size, mode);
        }
        self.emit(MirInst::Arith {
            op: mir_op,
            mode,
            width,
            dest,
            lhs,
            rhs: Operand::Reg(rhs),
        });
    }

    /// Produce a register holding `reg`'s low `size` bytes extended to the
    /// operation width
    fn normalize(&mut self, reg: Reg, size: u8, mode: OperandMode) -> Reg {
        let dest = self.out.fresh_reg();
        if mode == OperandMode::Signed {
            self.emit(MirInst::Conv {
                conv: MirConv::Sext,
                from_bits: size * 8,
                to_bits: 64,
                dest,
                src: reg,
            });
        } else {
            self.emit(MirInst::Mov {
                dest,
                src: Operand::Reg(reg),
                width: 8,
            });
            let mask = (1u64 << (u64::from(size) * 8)) - 1;
            self.emit(MirInst::Arith {
                op: MirArithOp::And,
                mode: OperandMode::Unsigned,
                width: 8,
                dest,
                lhs: dest,
                rhs: Operand::Imm(mask),
            });
        }
        dest
    }

    fn lower_conversion(&mut self, inst: InstId, conv: Conversion, operands: &[Value]) {
        let dest = self.inst_regs[&inst][0];
        let src = self.scalar(operands[0]);
        let from = self.type_bits(self.function.value_type(self.ctx, operands[0]));
        let to = self.type_bits(self.function.inst(inst).ty);
        let conv = match conv {
            Conversion::Sext => MirConv::Sext,
            Conversion::Zext | Conversion::Trunc => MirConv::ZextTrunc,
            Conversion::Fext => MirConv::Fext,
            Conversion::Ftrunc => MirConv::Ftrunc,
            Conversion::StoF => MirConv::StoF,
            Conversion::UtoF => MirConv::UtoF,
            Conversion::FtoS => MirConv::FtoS,
            Conversion::FtoU => MirConv::FtoU,
            Conversion::Bitcast => {
                self.emit(MirInst::Mov {
                    dest,
                    src: Operand::Reg(src),
                    width: 8,
                });
                return;
            }
        };
        self.emit(MirInst::Conv {
            conv,
            from_bits: from,
            to_bits: to,
            dest,
            src,
        });
    }

    /// Bit width of a scalar type
    fn type_bits(&self, ty: crate::ir::TypeId) -> u8 {
        match self.ctx.type_data(ty) {
            TypeData::Int { width } => *width as u8,
            TypeData::Float { width } => *width as u8,
            _ => 64,
        }
    }
}

fn cond_code(op: CompareOp) -> CondCode {
    match op {
        CompareOp::Less => CondCode::L,
        CompareOp::LessEq => CondCode::LE,
        CompareOp::Greater => CondCode::G,
        CompareOp::GreaterEq => CondCode::GE,
        CompareOp::Equal => CondCode::E,
        CompareOp::NotEqual => CondCode::NE,
    }
}

fn chunk_width(remaining: u64) -> u8 {
    if remaining >= 8 {
        8
    } else if remaining >= 4 {
        4
    } else if remaining >= 2 {
        2
    } else {
        1
    }
}

/// Constant value as 8-byte little-endian words
fn const_words(ctx: &Context, c: crate::ir::ConstId) -> Vec<u64> {
    match ctx.const_data(c) {
        ConstData::Int { bits, .. } => vec![*bits],
        ConstData::Float { bits, ty } => {
            if matches!(ctx.type_data(*ty), TypeData::Float { width: 32 }) {
                vec![*bits & 0xFFFF_FFFF]
            } else {
                vec![*bits]
            }
        }
        ConstData::NullPtr => vec![0],
        ConstData::Undef(ty) => {
            let count = ctx.size_of(*ty).div_ceil(8).max(1);
            vec![0; count as usize]
        }
        ConstData::Aggregate { ty, .. } => {
            let mut bytes = Vec::new();
            serialize_const(ctx, c, &mut bytes);
            let total = ctx.size_of(*ty).div_ceil(8).max(1) as usize * 8;
            bytes.resize(total, 0);
            bytes
                .chunks(8)
                .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{TypeId, Visibility};

    #[test]
    fn lowers_add_function() {
        let ctx = Context::new();
        let module = Module::new();
        let mut f = Function::new(
            "add",
            vec![
                ("a".to_string(), ctx.int_ty(64)),
                ("b".to_string(), ctx.int_ty(64)),
            ],
            ctx.int_ty(64),
            Visibility::External,
        );
        let entry = f.add_block("entry");
        let sum = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "sum",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.append_inst(entry, sum);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(sum)]);
        f.append_inst(entry, ret);

        let mir = lower_function(&ctx, &module, &f, &[]);
        assert_eq!(mir.num_params, 2);
        assert_eq!(mir.blocks.len(), 1);
        assert!(mir.blocks[0].insts.iter().any(|i| matches!(
            i,
            MirInst::Arith {
                op: MirArithOp::Add,
                ..
            }
        )));
        assert!(matches!(
            mir.blocks[0].insts.last(),
            Some(MirInst::Return { values }) if values.len() == 1
        ));
    }

    #[test]
    fn branch_lowers_to_test_and_jumps() {
        let ctx = Context::new();
        let module = Module::new();
        let mut f = Function::new(
            "f",
            vec![("c".to_string(), ctx.bool_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let a = f.add_block("a");
        let b = f.add_block("b");
        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Block(a), Value::Block(b)],
        );
        f.append_inst(entry, br);
        f.add_predecessor(a, entry);
        f.add_predecessor(b, entry);
        for blk in [a, b] {
            let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
            f.append_inst(blk, ret);
        }

        let mir = lower_function(&ctx, &module, &f, &[]);
        let entry_insts = &mir.blocks[0].insts;
        assert!(matches!(entry_insts[0], MirInst::Test { width: 1, .. }));
        assert!(matches!(
            entry_insts[1],
            MirInst::Jump {
                cc: Some(CondCode::NE),
                ..
            }
        ));
        assert!(matches!(entry_insts[2], MirInst::Jump { cc: None, .. }));
    }
}
