//! CFG simplification
//!
//! Folds branches on constant conditions, elides empty forwarding blocks,
//! merges straight-line block pairs, simplifies single-valued phis and
//! removes unreachable blocks.

use super::PassArgs;
use crate::ir::{ConstData, Context, DomInfo, Function, InstKind, TypeId, Value};

/// Run all CFG simplifications to a local fixpoint
pub fn simplify_cfg(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let mut any = false;
    loop {
        let changed = fold_constant_branches(ctx, function)
            | simplify_phis(function)
            | elide_forwarding_blocks(function)
            | merge_straight_line(function)
            | remove_unreachable(function);
        if !changed {
            return any;
        }
        any = true;
    }
}

/// `branch const, a, b` becomes `goto a` or `goto b`
fn fold_constant_branches(ctx: &Context, function: &mut Function) -> bool {
    let mut changed = false;
    for block in function.block_ids() {
        let Some(term) = function.terminator(block) else {
            continue;
        };
        if !matches!(function.inst(term).kind, InstKind::Branch) {
            continue;
        }
        let Value::Const(c) = function.inst(term).operands()[0] else {
            continue;
        };
        let ConstData::Int { bits, .. } = ctx.const_data(c) else {
            continue;
        };
        let (Value::Block(then_b), Value::Block(else_b)) = (
            function.inst(term).operands()[1],
            function.inst(term).operands()[2],
        ) else {
            continue;
        };
        let (taken, dead) = if *bits != 0 {
            (then_b, else_b)
        } else {
            (else_b, then_b)
        };
        function.erase_inst(term);
        let goto = function.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(taken)]);
        function.append_inst(block, goto);
        if dead != taken {
            function.remove_predecessor(dead, block);
        }
        changed = true;
    }
    changed
}

/// Phis with a single predecessor or all-equal arguments forward their value
fn simplify_phis(function: &mut Function) -> bool {
    let mut changed = false;
    for block in function.block_ids() {
        for phi in function.phis(block) {
            let operands = function.inst(phi).operands();
            let mut unique: Option<Value> = None;
            let mut trivial = true;
            for &op in operands {
                if op == Value::Inst(phi) {
                    continue;
                }
                match unique {
                    None => unique = Some(op),
                    Some(u) if u == op => {}
                    Some(_) => {
                        trivial = false;
                        break;
                    }
                }
            }
            if let (true, Some(value)) = (trivial, unique) {
                function.replace_value(Value::Inst(phi), value);
                function.erase_inst(phi);
                changed = true;
            }
        }
    }
    changed
}

/// A block containing only `goto t` is removed; its predecessors jump to
/// `t` directly. Skipped when `t` has phis and the elision would create
/// duplicate or conflicting incoming edges.
fn elide_forwarding_blocks(function: &mut Function) -> bool {
    let mut changed = false;
    for block in function.block_ids() {
        if block == function.entry() {
            continue;
        }
        let insts = function.block(block).insts();
        if insts.len() != 1 {
            continue;
        }
        let term = insts[0];
        if !matches!(function.inst(term).kind, InstKind::Goto) {
            continue;
        }
        let Value::Block(target) = function.inst(term).operands()[0] else {
            continue;
        };
        if target == block {
            continue;
        }
        let preds = function.block(block).predecessors().to_vec();
        if preds.is_empty() {
            continue;
        }
        // With phis in the target the rewrite is only sound when the edge
        // stays unique: no predecessor may already branch to the target
        let target_preds = function.block(target).predecessors().to_vec();
        if preds.iter().any(|p| target_preds.contains(p)) {
            continue;
        }
        let has_phis = !function.phis(target).is_empty();
        if has_phis && preds.len() > 1 {
            // Each phi argument for `block` would need to fan out to
            // several predecessors; keep the block to stay conservative
            continue;
        }
        // Rewire: first predecessor replaces `block` in the target's phi
        // edges, the rest append as new incoming edges
        let incoming: Vec<(crate::ir::InstId, Value)> = function
            .phis(target)
            .into_iter()
            .map(|phi| (phi, function.phi_incoming(phi, block).unwrap()))
            .collect();
        function.update_predecessor(target, block, preds[0]);
        for &pred in &preds[1..] {
            function.add_predecessor(target, pred);
            for &(phi, value) in &incoming {
                function.phi_add_argument(phi, pred, value);
            }
        }
        for &pred in &preds {
            function.update_target(pred, block, target);
        }
        function.erase_block(block);
        changed = true;
    }
    changed
}

/// Merge `a -> b` when `a` has a single successor and `b` a single
/// predecessor
fn merge_straight_line(function: &mut Function) -> bool {
    let mut changed = false;
    'outer: loop {
        for a in function.block_ids() {
            let succs = function.successors(a);
            if succs.len() != 1 {
                continue;
            }
            let b = succs[0];
            if b == a || b == function.entry() {
                continue;
            }
            if function.block(b).predecessors() != [a] {
                continue;
            }
            // Phis in `b` are single-valued here; forward them first
            for phi in function.phis(b) {
                let value = function.inst(phi).operands()[0];
                function.replace_value(Value::Inst(phi), value);
                function.erase_inst(phi);
            }
            let term = function.terminator(a).unwrap();
            function.erase_inst(term);
            for inst in function.block(b).insts().to_vec() {
                function.detach_inst(inst);
                function.append_inst(a, inst);
            }
            for succ in function.successors(a) {
                function.update_predecessor(succ, b, a);
            }
            function.erase_block(b);
            changed = true;
            continue 'outer;
        }
        return changed;
    }
}

/// Remove blocks not reachable from the entry
fn remove_unreachable(function: &mut Function) -> bool {
    let dom = DomInfo::compute(function);
    let unreachable: Vec<_> = function
        .block_ids()
        .into_iter()
        .filter(|&b| !dom.is_reachable(b))
        .collect();
    if unreachable.is_empty() {
        return false;
    }
    for &block in &unreachable {
        for succ in function.successors(block) {
            if dom.is_reachable(succ) {
                function.remove_predecessor(succ, block);
            }
        }
    }
    for block in unreachable {
        function.erase_block(block);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{assert_invariants, Visibility};

    #[test]
    fn folds_constant_branch_and_removes_dead_arm() {
        let mut ctx = Context::new();
        let mut f = Function::new("f", vec![], ctx.int_ty(64), Visibility::Internal);
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");

        let cond = ctx.bool_const(true);
        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![
                Value::Const(cond),
                Value::Block(then_b),
                Value::Block(else_b),
            ],
        );
        f.append_inst(entry, br);
        f.add_predecessor(then_b, entry);
        f.add_predecessor(else_b, entry);
        for b in [then_b, else_b] {
            let c = ctx.int_const(1, 64);
            let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Const(c)]);
            f.append_inst(b, ret);
        }

        assert!(simplify_cfg(&mut ctx, &mut f, &PassArgs::default()));
        assert_eq!(f.successors(entry).len(), 0); // merged straight line
        assert!(!f.block_ids().iter().any(|&b| b == else_b));
        assert_invariants(&ctx, &f);
    }

    #[test]
    fn elides_forwarding_block() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("c".to_string(), ctx.bool_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let fwd = f.add_block("fwd");
        let exit = f.add_block("exit");

        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Block(fwd), Value::Block(exit)],
        );
        f.append_inst(entry, br);
        f.add_predecessor(fwd, entry);
        let goto = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(exit)]);
        f.append_inst(fwd, goto);
        f.add_predecessor(exit, entry);
        f.add_predecessor(exit, fwd);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(exit, ret);

        // entry already branches to exit directly, so removing fwd would
        // duplicate the edge; the block must be kept
        assert!(!elide_forwarding_blocks(&mut f));
        assert_invariants(&ctx, &f);
    }

    #[test]
    fn elides_forwarding_block_between_distinct_blocks() {
        let mut ctx = Context::new();
        let mut f = Function::new("f", vec![], ctx.void_ty(), Visibility::Internal);
        let entry = f.add_block("entry");
        let fwd = f.add_block("fwd");
        let exit = f.add_block("exit");

        let g1 = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(fwd)]);
        f.append_inst(entry, g1);
        f.add_predecessor(fwd, entry);
        let g2 = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(exit)]);
        f.append_inst(fwd, g2);
        f.add_predecessor(exit, fwd);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(exit, ret);

        assert!(simplify_cfg(&mut ctx, &mut f, &PassArgs::default()));
        // Everything collapses into the entry block
        assert_eq!(f.block_ids().len(), 1);
        assert_invariants(&ctx, &f);
    }
}
