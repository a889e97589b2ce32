//! IR invariant validation
//!
//! Violations are programming errors, not user-visible diagnostics:
//! [`assert_invariants`] panics in debug builds (and whenever it is called
//! explicitly). [`validate`] is the non-panicking form used by tests and by
//! tools after experimental transformations.

use std::collections::HashSet;

use super::context::Context;
use super::instruction::{CompareMode, InstKind};
use super::module::{Function, Value};
use super::types::TypeData;

/// Check all structural, SSA and typing invariants of a function
pub fn validate(ctx: &Context, function: &Function) -> Result<(), String> {
    let err = |msg: String| -> Result<(), String> { Err(format!("{}: {msg}", function.name)) };

    // Structural: one terminator per block, at the end; phis at the top
    for block in function.block_ids() {
        let insts = function.block(block).insts();
        if insts.is_empty() {
            return err(format!("block {} is empty", function.block(block).name));
        }
        for (i, &inst) in insts.iter().enumerate() {
            let is_last = i + 1 == insts.len();
            if function.inst(inst).kind.is_terminator() != is_last {
                return err(format!(
                    "block {} must end with exactly one terminator",
                    function.block(block).name
                ));
            }
        }
        let mut seen_non_phi = false;
        for &inst in insts {
            let is_phi = matches!(function.inst(inst).kind, InstKind::Phi { .. });
            if is_phi && seen_non_phi {
                return err(format!(
                    "phi after non-phi in block {}",
                    function.block(block).name
                ));
            }
            seen_non_phi |= !is_phi;
        }
    }

    // Predecessor lists and successor edges agree
    for block in function.block_ids() {
        for succ in function.successors(block) {
            if !function.block(succ).predecessors().contains(&block) {
                return err(format!(
                    "edge {} -> {} missing from predecessor list",
                    function.block(block).name,
                    function.block(succ).name
                ));
            }
        }
        for &pred in function.block(block).predecessors() {
            if !function.successors(pred).contains(&block) {
                return err(format!(
                    "stale predecessor {} of {}",
                    function.block(pred).name,
                    function.block(block).name
                ));
            }
        }
    }

    // Phi edges agree with predecessor lists
    for block in function.block_ids() {
        let preds: HashSet<_> = function.block(block).predecessors().iter().copied().collect();
        for phi in function.phis(block) {
            let InstKind::Phi { preds: phi_preds } = &function.inst(phi).kind else {
                unreachable!()
            };
            if phi_preds.len() != preds.len()
                || phi_preds.iter().any(|p| !preds.contains(p))
                || function.inst(phi).operands().len() != phi_preds.len()
            {
                return err(format!(
                    "phi %{} disagrees with predecessors of {}",
                    function.inst(phi).name,
                    function.block(block).name
                ));
            }
        }
    }

    // Named values: non-void results carry names, unique by construction
    let mut names = HashSet::new();
    for block in function.block_ids() {
        for &inst in function.block(block).insts() {
            let data = function.inst(inst);
            if data.ty != ctx.void_ty() {
                if data.name.is_empty() {
                    return err(format!("unnamed {} result", data.kind.mnemonic()));
                }
                if !names.insert(data.name.clone()) {
                    return err(format!("duplicate name %{}", data.name));
                }
            }
        }
    }

    // Use dominance
    let dom = super::dominance::DomInfo::compute(function);
    for block in function.block_ids() {
        if !dom.is_reachable(block) {
            continue;
        }
        for &inst in function.block(block).insts() {
            let data = function.inst(inst);
            for (index, &op) in data.operands().iter().enumerate() {
                let Value::Inst(def) = op else { continue };
                let def_block = match function.inst(def).parent() {
                    Some(b) => b,
                    None => return err(format!("use of detached instruction")),
                };
                match &data.kind {
                    InstKind::Phi { preds } => {
                        let pred = preds[index];
                        if !dom.dominates(def_block, pred) {
                            return err(format!(
                                "phi operand %{} does not dominate predecessor {}",
                                function.inst(def).name,
                                function.block(pred).name
                            ));
                        }
                    }
                    _ => {
                        let ok = if def_block == block {
                            let insts = function.block(block).insts();
                            let def_pos = insts.iter().position(|&i| i == def);
                            let use_pos = insts.iter().position(|&i| i == inst);
                            def_pos < use_pos
                        } else {
                            dom.dominates(def_block, block)
                        };
                        if !ok {
                            return err(format!(
                                "%{} used before definition dominates it",
                                function.inst(def).name
                            ));
                        }
                    }
                }
            }
        }
    }

    // Type rules
    for block in function.block_ids() {
        for &inst in function.block(block).insts() {
            let data = function.inst(inst);
            let operand_ty = |i: usize| function.value_type(ctx, data.operands()[i]);
            match &data.kind {
                InstKind::Arithmetic(_) => {
                    let (a, b) = (operand_ty(0), operand_ty(1));
                    if a != b || !ctx.type_data(a).is_arithmetic() {
                        return err(format!(
                            "arithmetic on mismatched types {} and {}",
                            ctx.display_type(a),
                            ctx.display_type(b)
                        ));
                    }
                }
                InstKind::Compare { mode, .. } => {
                    let (a, b) = (operand_ty(0), operand_ty(1));
                    if a != b {
                        return err("compare on mismatched types".to_string());
                    }
                    if data.ty != ctx.bool_ty() {
                        return err("compare result must be i1".to_string());
                    }
                    let float_operands = matches!(ctx.type_data(a), TypeData::Float { .. });
                    if (*mode == CompareMode::Float) != float_operands {
                        return err("compare mode disagrees with operand type".to_string());
                    }
                }
                InstKind::Branch => {
                    if operand_ty(0) != ctx.bool_ty() {
                        return err("branch condition must be i1".to_string());
                    }
                }
                InstKind::GetElementPointer { .. } => {
                    if operand_ty(0) != ctx.ptr_ty() {
                        return err("gep base must be a pointer".to_string());
                    }
                }
                InstKind::Load | InstKind::Store => {
                    if operand_ty(0) != ctx.ptr_ty() {
                        return err("memory address must be a pointer".to_string());
                    }
                }
                InstKind::Phi { .. } => {
                    for i in 0..data.operands().len() {
                        if operand_ty(i) != data.ty {
                            return err(format!(
                                "phi %{} operand type mismatch",
                                data.name
                            ));
                        }
                    }
                }
                InstKind::Select => {
                    if operand_ty(0) != ctx.bool_ty() || operand_ty(1) != operand_ty(2) {
                        return err("malformed select".to_string());
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

/// Panic if any IR invariant is violated
///
/// Debug builds call this after every structural transformation.
#[track_caller]
pub fn assert_invariants(ctx: &Context, function: &Function) {
    if let Err(msg) = validate(ctx, function) {
        panic!("IR invariant violated: {msg}");
    }
}
