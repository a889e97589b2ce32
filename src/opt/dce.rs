//! Dead code elimination
//!
//! An instruction with no users and no side effects is removable. Side
//! effects are stores, calls, and terminators; everything else is pure.

use super::PassArgs;
use crate::ir::{Context, Function, InstId, Value};

/// Remove dead instructions until none remain
pub fn dce(_ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let mut any = false;
    loop {
        let mut dead: Vec<InstId> = Vec::new();
        for block in function.block_ids() {
            for &inst in function.block(block).insts() {
                let data = function.inst(inst);
                if data.kind.has_side_effects() {
                    continue;
                }
                if !function.is_used(Value::Inst(inst)) {
                    dead.push(inst);
                }
            }
        }
        if dead.is_empty() {
            return any;
        }
        any = true;
        // Erasing may render operands of the erased instruction dead in
        // turn, hence the outer fixpoint
        for inst in dead {
            function.erase_inst(inst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArithmeticOp, InstKind, TypeId, Visibility};

    #[test]
    fn removes_unused_chain() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("a".to_string(), ctx.int_ty(64))],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
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
        f.append_inst(entry, x);
        f.append_inst(entry, y);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(entry, ret);

        assert!(dce(&mut ctx, &mut f, &PassArgs::default()));
        assert_eq!(f.block(entry).insts().len(), 1);
    }

    #[test]
    fn keeps_stores() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("p".to_string(), ctx.ptr_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let c = ctx.int_const(1, 64);
        let st = f.new_inst(
            InstKind::Store,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Const(c)],
        );
        f.append_inst(entry, st);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(entry, ret);

        assert!(!dce(&mut ctx, &mut f, &PassArgs::default()));
        assert_eq!(f.block(entry).insts().len(), 2);
    }
}
