//! Promotion of stack slots to SSA registers
//!
//! Scalar allocas whose address never escapes (only loads and stores touch
//! it) are rewritten into SSA values. Phi placement uses the iterated
//! dominance frontier of the defining stores; renaming walks the dominator
//! tree carrying the reaching definition per slot.

use std::collections::HashMap;

use super::PassArgs;
use crate::ir::{
    ConstData, Context, Function, InstId, InstKind, TypeData, Value,
};

/// Promote eligible allocas to SSA values
pub fn mem2reg(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let candidates = promotable_allocas(ctx, function);
    if candidates.is_empty() {
        return false;
    }

    let dom = function.get_or_compute_dom_info();
    // Phi placement: one phi per slot at each block of the IDF of its stores
    let mut phi_slot: HashMap<InstId, usize> = HashMap::new();
    for (slot_index, &(alloca, ty)) in candidates.iter().enumerate() {
        let mut def_blocks = Vec::new();
        for user in function.users(Value::Inst(alloca)) {
            if matches!(function.inst(user).kind, InstKind::Store) {
                if let Some(b) = function.inst(user).parent() {
                    def_blocks.push(b);
                }
            }
        }
        for join in dom.iterated_frontier(&def_blocks) {
            let preds = function.block(join).predecessors().to_vec();
            let undef = ctx.undef(ty);
            let operands = vec![Value::Const(undef); preds.len()];
            let name = format!("{}.phi", function.inst(alloca).name);
            let phi = function.new_inst(InstKind::Phi { preds }, ty, &name, operands);
            function.insert_phi(join, phi);
            phi_slot.insert(phi, slot_index);
        }
    }

    // Renaming over the dominator tree
    let slot_of_alloca: HashMap<InstId, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, &(a, _))| (a, i))
        .collect();
    let mut reaching: Vec<Value> = candidates
        .iter()
        .map(|&(_, ty)| Value::Const(ctx.undef(ty)))
        .collect();
    let entry = function.entry();
    rename(
        function,
        &dom,
        entry,
        &slot_of_alloca,
        &phi_slot,
        &mut reaching,
    );

    // All loads and stores of the promoted slots are gone; drop the slots
    for &(alloca, _) in &candidates {
        debug_assert!(!function.is_used(Value::Inst(alloca)));
        function.erase_inst(alloca);
    }
    true
}

/// Allocas of scalar type with a constant count of one whose only users are
/// loads and non-escaping stores
fn promotable_allocas(
    ctx: &Context,
    function: &Function,
) -> Vec<(InstId, crate::ir::TypeId)> {
    let mut result = Vec::new();
    let entry = function.entry();
    for &inst in function.block(entry).insts() {
        let data = function.inst(inst);
        let InstKind::Alloca { allocated } = &data.kind else {
            continue;
        };
        let allocated = *allocated;
        if !matches!(
            ctx.type_data(allocated),
            TypeData::Int { .. } | TypeData::Float { .. } | TypeData::Ptr
        ) {
            continue;
        }
        let Value::Const(count) = data.operands()[0] else {
            continue;
        };
        if !matches!(ctx.const_data(count), ConstData::Int { bits: 1, .. }) {
            continue;
        }
        let escapes = function.users(Value::Inst(inst)).iter().any(|&user| {
            match &function.inst(user).kind {
                InstKind::Load => false,
                // The slot address may be the store *target* but must not be
                // the stored value
                InstKind::Store => function.inst(user).operands()[1] == Value::Inst(inst),
                _ => true,
            }
        });
        if !escapes {
            result.push((inst, allocated));
        }
    }
    result
}

fn rename(
    function: &mut Function,
    dom: &crate::ir::DomInfo,
    block: crate::ir::BlockId,
    slot_of_alloca: &HashMap<InstId, usize>,
    phi_slot: &HashMap<InstId, usize>,
    reaching: &mut Vec<Value>,
) {
    let saved = reaching.clone();

    for inst in function.block(block).insts().to_vec() {
        if !function.inst_alive(inst) {
            continue;
        }
        if let Some(&slot) = phi_slot.get(&inst) {
            reaching[slot] = Value::Inst(inst);
            continue;
        }
        match &function.inst(inst).kind {
            InstKind::Load => {
                let Value::Inst(addr) = function.inst(inst).operands()[0] else {
                    continue;
                };
                if let Some(&slot) = slot_of_alloca.get(&addr) {
                    function.replace_value(Value::Inst(inst), reaching[slot]);
                    function.erase_inst(inst);
                }
            }
            InstKind::Store => {
                let Value::Inst(addr) = function.inst(inst).operands()[0] else {
                    continue;
                };
                if let Some(&slot) = slot_of_alloca.get(&addr) {
                    reaching[slot] = function.inst(inst).operands()[1];
                    function.erase_inst(inst);
                }
            }
            _ => {}
        }
    }

    // Feed reaching definitions into successor phis
    for succ in function.successors(block) {
        for phi in function.phis(succ) {
            if let Some(&slot) = phi_slot.get(&phi) {
                let index = match &function.inst(phi).kind {
                    InstKind::Phi { preds } => preds.iter().position(|&p| p == block),
                    _ => unreachable!(),
                };
                if let Some(index) = index {
                    function.set_operand(phi, index, reaching[slot]);
                }
            }
        }
    }

    for &child in dom.children(block).to_vec().iter() {
        rename(function, dom, child, slot_of_alloca, phi_slot, reaching);
    }

    *reaching = saved;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{assert_invariants, TypeId, Visibility};

    /// if (c) store 1; else store 2; return load
    #[test]
    fn promotes_branchy_slot_with_phi() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("c".to_string(), ctx.bool_ty())],
            ctx.int_ty(64),
            Visibility::External,
        );
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let join = f.add_block("join");

        let one = ctx.int_const(1, 64);
        let two = ctx.int_const(2, 64);
        let count = ctx.int_const(1, 32);
        let slot = f.new_inst(
            InstKind::Alloca {
                allocated: ctx.int_ty(64),
            },
            ctx.ptr_ty(),
            "x",
            vec![Value::Const(count)],
        );
        f.append_inst(entry, slot);
        let br = f.new_inst(
            InstKind::Branch,
            TypeId::VOID,
            "",
            vec![
                Value::Param(0),
                Value::Block(then_b),
                Value::Block(else_b),
            ],
        );
        f.append_inst(entry, br);
        f.add_predecessor(then_b, entry);
        f.add_predecessor(else_b, entry);

        for (b, c) in [(then_b, one), (else_b, two)] {
            let st = f.new_inst(
                InstKind::Store,
                TypeId::VOID,
                "",
                vec![Value::Inst(slot), Value::Const(c)],
            );
            f.append_inst(b, st);
            let goto = f.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(join)]);
            f.append_inst(b, goto);
            f.add_predecessor(join, b);
        }

        let load = f.new_inst(InstKind::Load, ctx.int_ty(64), "v", vec![Value::Inst(slot)]);
        f.append_inst(join, load);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(load)]);
        f.append_inst(join, ret);

        assert!(mem2reg(&mut ctx, &mut f, &PassArgs::default()));
        assert_invariants(&ctx, &f);

        // The join block now carries a phi merging the two stored values
        let phis = f.phis(join);
        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(f.phi_incoming(phi, then_b), Some(Value::Const(one)));
        assert_eq!(f.phi_incoming(phi, else_b), Some(Value::Const(two)));
        assert_eq!(f.inst(ret).operands()[0], Value::Inst(phi));

        // No memory traffic remains
        for block in f.block_ids() {
            for &inst in f.block(block).insts() {
                assert!(!matches!(
                    f.inst(inst).kind,
                    InstKind::Alloca { .. } | InstKind::Load | InstKind::Store
                ));
            }
        }
    }

    /// Escaping allocas must not be promoted
    #[test]
    fn escaping_alloca_is_kept() {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("p".to_string(), ctx.ptr_ty())],
            ctx.void_ty(),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let count = ctx.int_const(1, 32);
        let slot = f.new_inst(
            InstKind::Alloca {
                allocated: ctx.int_ty(64),
            },
            ctx.ptr_ty(),
            "x",
            vec![Value::Const(count)],
        );
        f.append_inst(entry, slot);
        // The slot address itself is stored to memory: it escapes
        let st = f.new_inst(
            InstKind::Store,
            TypeId::VOID,
            "",
            vec![Value::Param(0), Value::Inst(slot)],
        );
        f.append_inst(entry, st);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![]);
        f.append_inst(entry, ret);

        assert!(!mem2reg(&mut ctx, &mut f, &PassArgs::default()));
    }
}
