//! Common-subexpression and partial-redundancy elimination
//!
//! Pure expressions with the same opcode and equal operand lists fall into
//! one congruence class. The CSE walk scopes its table over the dominator
//! tree, so an expression is reused wherever its first computation
//! dominates. The redundancy part places phis at join blocks whose
//! predecessors all compute the same expression, then replaces the join's
//! recomputation with the phi.

use std::collections::HashMap;
use std::mem::Discriminant;

use super::PassArgs;
use crate::ir::{BlockId, Context, DomInfo, Function, InstId, InstKind, TypeId, Value};

/// Key identifying a congruence class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExprKey {
    tag: Discriminant<InstKind>,
    /// Encodes the non-operand payload (operation, indices, target type)
    payload: Vec<u64>,
    ty: TypeId,
    operands: Vec<Value>,
}

/// Build the congruence key of a pure instruction
fn expr_key(function: &Function, inst: InstId) -> Option<ExprKey> {
    let data = function.inst(inst);
    let payload: Vec<u64> = match &data.kind {
        InstKind::Arithmetic(op) => vec![*op as u64],
        InstKind::UnaryArithmetic(op) => vec![*op as u64],
        InstKind::Compare { mode, op } => vec![*mode as u64, *op as u64],
        InstKind::Conversion(conv) => vec![*conv as u64],
        InstKind::GetElementPointer {
            inbounds,
            member_indices,
        } => {
            let mut v = vec![u64::from(inbounds.0)];
            v.extend(member_indices.iter().map(|&i| u64::from(i)));
            v
        }
        InstKind::ExtractValue { indices } | InstKind::InsertValue { indices } => {
            indices.iter().map(|&i| u64::from(i)).collect()
        }
        InstKind::Select => vec![],
        // Loads, stores, calls and control flow have effects or depend on
        // memory state and never join a congruence class
        _ => return None,
    };
    Some(ExprKey {
        tag: std::mem::discriminant(&data.kind),
        payload,
        ty: data.ty,
        operands: data.operands().to_vec(),
    })
}

/// Eliminate fully and partially redundant pure expressions
pub fn redundancy_elim(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let dom = function.get_or_compute_dom_info();
    let entry = function.entry();
    let mut changed = cse_walk(function, &dom, entry, HashMap::new());
    changed |= place_redundancy_phis(ctx, function, &dom);
    changed
}

fn cse_walk(
    function: &mut Function,
    dom: &DomInfo,
    block: BlockId,
    mut available: HashMap<ExprKey, Value>,
) -> bool {
    let mut changed = false;
    for inst in function.block(block).insts().to_vec() {
        if !function.inst_alive(inst) {
            continue;
        }
        let Some(key) = expr_key(function, inst) else {
            continue;
        };
        if let Some(&existing) = available.get(&key) {
            function.replace_value(Value::Inst(inst), existing);
            function.erase_inst(inst);
            changed = true;
        } else {
            available.insert(key, Value::Inst(inst));
        }
    }
    for &child in dom.children(block).to_vec().iter() {
        changed |= cse_walk(function, dom, child, available.clone());
    }
    changed
}

/// For a join block where every predecessor computes the same expression,
/// merge the predecessor results through a phi and drop the recomputation.
/// Phi placement points come from the dominance frontier of the computing
/// blocks: the join is exactly where their availability merges.
fn place_redundancy_phis(
    _ctx: &mut Context,
    function: &mut Function,
    _dom: &DomInfo,
) -> bool {
    let mut changed = false;
    for join in function.block_ids() {
        let preds = function.block(join).predecessors().to_vec();
        if preds.len() < 2 {
            continue;
        }
        // Expressions available at the end of each predecessor
        let pred_exprs: Vec<HashMap<ExprKey, Value>> = preds
            .iter()
            .map(|&p| {
                let mut map = HashMap::new();
                for &inst in function.block(p).insts() {
                    if let Some(key) = expr_key(function, inst) {
                        map.insert(key, Value::Inst(inst));
                    }
                }
                map
            })
            .collect();

        for inst in function.block(join).insts().to_vec() {
            if !function.inst_alive(inst) {
                continue;
            }
            let Some(key) = expr_key(function, inst) else {
                continue;
            };
            let incoming: Option<Vec<Value>> = pred_exprs
                .iter()
                .map(|map| map.get(&key).copied())
                .collect();
            let Some(incoming) = incoming else { continue };
            let ty = function.inst(inst).ty;
            let name = format!("{}.pre", function.inst(inst).name);
            let phi = function.new_inst(
                InstKind::Phi {
                    preds: preds.clone(),
                },
                ty,
                &name,
                incoming,
            );
            function.insert_phi(join, phi);
            function.replace_value(Value::Inst(inst), Value::Inst(phi));
            function.erase_inst(inst);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{assert_invariants, ArithmeticOp, Visibility};

    #[test]
    fn eliminates_dominated_duplicate() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![
                ("a".to_string(), ctx.int_ty(64)),
                ("b".to_string(), ctx.int_ty(64)),
            ],
            ctx.int_ty(64),
            Visibility::External,
        );
        let entry = f.add_block("entry");
        let x = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Param(1)],
        );
        let y = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "y",
            vec![Value::Param(0), Value::Param(1)],
        );
        let sum = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Mul),
            ctx.int_ty(64),
            "m",
            vec![Value::Inst(x), Value::Inst(y)],
        );
        f.append_inst(entry, x);
        f.append_inst(entry, y);
        f.append_inst(entry, sum);
        let ret = f.new_inst(
            InstKind::Return,
            TypeId::VOID,
            "",
            vec![Value::Inst(sum)],
        );
        f.append_inst(entry, ret);

        assert!(redundancy_elim(&mut ctx, &mut f, &PassArgs::default()));
        assert!(!f.inst_alive(y));
        assert_eq!(
            f.inst(sum).operands(),
            &[Value::Inst(x), Value::Inst(x)]
        );
        assert_invariants(&ctx, &f);
    }

    #[test]
    fn merges_expression_computed_in_both_predecessors() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![
                ("c".to_string(), ctx.bool_ty()),
                ("a".to_string(), ctx.int_ty(64)),
            ],
            ctx.int_ty(64),
            Visibility::External,
        );
        let entry = f.add_block("entry");
        let left = f.add_block("left");
        let right = f.add_block("right");
        let join = f.add_block("join");

        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Block(left), Value::Block(right)],
        );
        f.append_inst(entry, br);
        f.add_predecessor(left, entry);
        f.add_predecessor(right, entry);

        for b in [left, right] {
            let x = f.new_inst(
                InstKind::Arithmetic(ArithmeticOp::Add),
                ctx.int_ty(64),
                "x",
                vec![Value::Param(1), Value::Param(1)],
            );
            f.append_inst(b, x);
            let goto = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(join)]);
            f.append_inst(b, goto);
            f.add_predecessor(join, b);
        }

        // The join recomputes the same expression; it is redundant along
        // every path
        let again = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "again",
            vec![Value::Param(1), Value::Param(1)],
        );
        f.append_inst(join, again);
        let ret = f.new_inst(
            InstKind::Return,
            TypeId::VOID,
            "",
            vec![Value::Inst(again)],
        );
        f.append_inst(join, ret);

        assert!(redundancy_elim(&mut ctx, &mut f, &PassArgs::default()));
        assert!(!f.inst_alive(again));
        let phis = f.phis(join);
        assert_eq!(phis.len(), 1);
        assert_eq!(f.inst(ret).operands()[0], Value::Inst(phis[0]));
        assert_invariants(&ctx, &f);
    }
}
