//! Cloning of blocks and functions
//!
//! Clones are structurally equivalent copies. An internal value map rewrites
//! intra-clone references to their copies; references to values outside the
//! cloned region are left pointing at the originals.

use std::collections::HashMap;

use super::instruction::InstKind;
use super::module::{BlockId, Function, InstId, Value, Visibility};

/// Mapping from original to cloned entities
#[derive(Debug, Default, Clone)]
pub struct CloneMap {
    /// Instruction results
    pub insts: HashMap<InstId, InstId>,
    /// Blocks
    pub blocks: HashMap<BlockId, BlockId>,
}

impl CloneMap {
    /// Remap a value; values outside the clone are returned unchanged
    pub fn map_value(&self, value: Value) -> Value {
        match value {
            Value::Inst(i) => Value::Inst(self.insts.get(&i).copied().unwrap_or(i)),
            Value::Block(b) => Value::Block(self.blocks.get(&b).copied().unwrap_or(b)),
            other => other,
        }
    }

    /// Remap a block
    pub fn map_block(&self, block: BlockId) -> BlockId {
        self.blocks.get(&block).copied().unwrap_or(block)
    }
}

/// Clone a single block within its function.
///
/// The clone carries the source's predecessor list and its terminator, so it
/// starts out with the same successors. Phi predecessor entries are kept
/// verbatim; the caller rewires them along with the CFG.
pub fn clone_block(function: &mut Function, source: BlockId, name: &str) -> (BlockId, CloneMap) {
    let mut map = CloneMap::default();
    let clone = function.add_block(name);
    map.blocks.insert(source, clone);

    let insts = function.block(source).insts().to_vec();
    for inst in insts {
        let data = function.inst(inst);
        let kind = data.kind.clone();
        let ty = data.ty;
        let name = data.name.clone();
        let operands: Vec<Value> = data
            .operands()
            .iter()
            .map(|&op| map.map_value(op))
            .collect();
        let copy = function.new_inst(kind, ty, &name, operands);
        function.append_inst(clone, copy);
        map.insts.insert(inst, copy);
    }

    for pred in function.block(source).predecessors().to_vec() {
        function.add_predecessor(clone, pred);
    }
    (clone, map)
}

/// Clone a whole function under a new name.
///
/// Cross-clone references (constants, globals, other functions) remain
/// pointing at the originals; everything defined inside the function is
/// remapped.
pub fn clone_function(source: &Function, name: &str) -> Function {
    let params = source
        .params
        .iter()
        .map(|p| (p.name.clone(), p.ty))
        .collect();
    let mut clone = Function::new(name, params, source.return_type, Visibility::Internal);

    let mut map = CloneMap::default();
    for block in source.block_ids() {
        let copy = clone.add_block(&source.block(block).name);
        map.blocks.insert(block, copy);
    }

    // First create every instruction without operands so forward references
    // (phi edges) can be resolved, then fill the operand lists
    for block in source.block_ids() {
        for &inst in source.block(block).insts() {
            let data = source.inst(inst);
            let kind = match &data.kind {
                InstKind::Phi { preds } => InstKind::Phi {
                    preds: preds.iter().map(|&p| map.map_block(p)).collect(),
                },
                other => other.clone(),
            };
            let copy = clone.new_inst(kind, data.ty, &data.name, vec![]);
            clone.append_inst(map.map_block(block), copy);
            map.insts.insert(inst, copy);
        }
    }
    for block in source.block_ids() {
        for &inst in source.block(block).insts() {
            let copy = map.insts[&inst];
            for &op in source.inst(inst).operands() {
                clone.push_operand(copy, map.map_value(op));
            }
        }
        let copy = map.map_block(block);
        for &pred in source.block(block).predecessors() {
            clone.add_predecessor(copy, map.map_block(pred));
        }
    }
    clone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{ArithmeticOp, InstKind};
    use crate::ir::types::TypeId;
    use crate::ir::Context;

    #[test]
    fn block_clone_remaps_internal_refs() {
        let ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("a".to_string(), ctx.int_ty(64))],
            ctx.int_ty(64),
            Visibility::Internal,
        );
        let b = f.add_block("b");
        let x = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Param(0)],
        );
        let y = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Mul),
            ctx.int_ty(64),
            "y",
            vec![Value::Inst(x), Value::Param(0)],
        );
        f.append_inst(b, x);
        f.append_inst(b, y);

        let (clone, map) = clone_block(&mut f, b, "b.clone");
        let cloned_insts = f.block(clone).insts().to_vec();
        assert_eq!(cloned_insts.len(), 2);
        // The second clone must reference the first clone, not the original
        assert_eq!(
            f.inst(cloned_insts[1]).operands()[0],
            Value::Inst(map.insts[&x])
        );
        assert_eq!(f.inst(cloned_insts[1]).operands()[1], Value::Param(0));
    }

    #[test]
    fn function_clone_is_structurally_equal() {
        let ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("c".to_string(), ctx.bool_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let exit = f.add_block("exit");
        let goto = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(exit)]);
        f.append_inst(entry, goto);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(exit, ret);
        f.add_predecessor(exit, entry);

        let g = clone_function(&f, "g");
        assert_eq!(g.name, "g");
        assert_eq!(g.block_ids().len(), 2);
        let g_entry = g.entry();
        assert_eq!(g.successors(g_entry).len(), 1);
        let g_exit = g.successors(g_entry)[0];
        assert_eq!(g.block(g_exit).predecessors(), &[g_entry]);
    }
}
