//! Cost-bounded function inlining
//!
//! Direct calls to small internal functions are expanded at the call site.
//! The callee body is spliced between the call block and a continuation
//! block; multiple returns merge through a phi in the continuation.

use std::collections::HashMap;

use tracing::debug;

use super::PassArgs;
use crate::ir::{
    clone_function, BlockId, Context, FuncId, Function, InstId, InstKind, Module, TypeId, Value,
};

/// Inline eligible call sites across the module
pub fn inline_functions(ctx: &mut Context, module: &mut Module, args: &PassArgs) -> bool {
    let budget = args.get_u64("budget", 60);
    let mut any = false;
    // A bounded number of rounds keeps call chains from exploding
    for _ in 0..3 {
        let mut changed = false;
        for caller_id in module.function_ids() {
            loop {
                let Some((call, callee_id)) = find_candidate(module, caller_id, budget) else {
                    break;
                };
                let snapshot = clone_function(module.function(callee_id), "inline.snapshot");
                debug!(
                    caller = %module.function(caller_id).name,
                    callee = %module.function(callee_id).name,
                    "inlining call"
                );
                inline_call(ctx, module.function_mut(caller_id), call, &snapshot);
                changed = true;
                any = true;
            }
        }
        if !changed {
            break;
        }
    }
    any
}

/// First call site in `caller` whose callee is a different function small
/// enough for the budget
fn find_candidate(module: &Module, caller_id: FuncId, budget: u64) -> Option<(InstId, FuncId)> {
    let caller = module.function(caller_id);
    for block in caller.block_ids() {
        for &inst in caller.block(block).insts() {
            if !matches!(caller.inst(inst).kind, InstKind::Call) {
                continue;
            }
            let Value::Function(callee_id) = caller.inst(inst).operands()[0] else {
                continue;
            };
            if callee_id == caller_id {
                continue;
            }
            let callee = module.function(callee_id);
            if callee.block_ids().is_empty() {
                continue;
            }
            let size: usize = callee
                .block_ids()
                .iter()
                .map(|&b| callee.block(b).insts().len())
                .sum();
            if size as u64 <= budget {
                return Some((inst, callee_id));
            }
        }
    }
    None
}

/// Splice `callee` (a detached snapshot) into `caller` at `call`
fn inline_call(ctx: &mut Context, caller: &mut Function, call: InstId, callee: &Function) {
    let call_block = caller.inst(call).parent().expect("call is attached");
    let call_args: Vec<Value> = caller.inst(call).operands()[1..].to_vec();
    let call_ty = caller.inst(call).ty;

    // Split the call block: everything after the call moves into the
    // continuation, which takes over the terminator and the successor edges
    let cont = caller.insert_block_after(call_block, "inline.cont");
    let insts = caller.block(call_block).insts().to_vec();
    let call_pos = insts.iter().position(|&i| i == call).unwrap();
    for &inst in &insts[call_pos + 1..] {
        caller.detach_inst(inst);
        caller.append_inst(cont, inst);
    }
    for succ in caller.successors(cont) {
        caller.update_predecessor(succ, call_block, cont);
    }

    // Import the callee body
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    for block in callee.block_ids() {
        let name = format!("inline.{}", callee.block(block).name);
        let copy = caller.add_block(&name);
        caller.move_block_before(copy, cont);
        block_map.insert(block, copy);
    }
    let mut inst_map: HashMap<InstId, InstId> = HashMap::new();
    let mut returns: Vec<(BlockId, Option<Value>)> = Vec::new();
    for block in callee.block_ids() {
        for &inst in callee.block(block).insts() {
            let data = callee.inst(inst);
            if matches!(data.kind, InstKind::Return) {
                // Returns become jumps to the continuation
                let value = data.operands().first().copied();
                returns.push((block, value));
                let goto = caller.new_inst(
                    InstKind::Goto,
                    TypeId::VOID,
                    "",
                    vec![Value::Block(cont)],
                );
                caller.append_inst(block_map[&block], goto);
                continue;
            }
            let kind = match &data.kind {
                InstKind::Phi { preds } => InstKind::Phi {
                    preds: preds.iter().map(|p| block_map[p]).collect(),
                },
                other => other.clone(),
            };
            let copy = caller.new_inst(kind, data.ty, &data.name, vec![]);
            caller.append_inst(block_map[&block], copy);
            inst_map.insert(inst, copy);
        }
    }
    let map_value = |v: Value, inst_map: &HashMap<InstId, InstId>| match v {
        Value::Param(i) => call_args[i as usize],
        Value::Inst(i) => Value::Inst(inst_map[&i]),
        Value::Block(b) => Value::Block(block_map[&b]),
        other => other,
    };
    for block in callee.block_ids() {
        for &inst in callee.block(block).insts() {
            let Some(&copy) = inst_map.get(&inst) else {
                continue;
            };
            for &op in callee.inst(inst).operands() {
                let mapped = map_value(op, &inst_map);
                caller.push_operand(copy, mapped);
            }
        }
        for &pred in callee.block(block).predecessors() {
            caller.add_predecessor(block_map[&block], block_map[&pred]);
        }
    }

    // Enter the callee instead of calling it
    let entry_copy = block_map[&callee.entry()];
    let enter = caller.new_inst(
        InstKind::Goto,
        TypeId::VOID,
        "",
        vec![Value::Block(entry_copy)],
    );
    caller.append_inst(call_block, enter);
    caller.add_predecessor(entry_copy, call_block);
    for (block, _) in &returns {
        caller.add_predecessor(cont, block_map[block]);
    }

    // Route the return value into the former call result
    let result: Option<Value> = match returns.len() {
        0 => None,
        1 => returns[0].1.map(|v| map_value(v, &inst_map)),
        _ => {
            if call_ty == ctx.void_ty() {
                None
            } else {
                let preds: Vec<BlockId> = returns.iter().map(|&(b, _)| block_map[&b]).collect();
                let operands: Vec<Value> = returns
                    .iter()
                    .map(|&(_, v)| map_value(v.expect("typed return"), &inst_map))
                    .collect();
                let phi = caller.new_inst(
                    InstKind::Phi { preds },
                    call_ty,
                    "inline.ret",
                    operands,
                );
                caller.insert_phi(cont, phi);
                Some(Value::Inst(phi))
            }
        }
    };
    if let Some(result) = result {
        caller.replace_value(Value::Inst(call), result);
    } else if call_ty != ctx.void_ty() {
        // A callee that never returns a value leaves the result undefined
        let undef = ctx.undef(call_ty);
        caller.replace_value(Value::Inst(call), Value::Const(undef));
    }
    caller.erase_inst(call);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{assert_invariants, ArithmeticOp, Visibility};

    #[test]
    fn inlines_small_callee() {
        let mut ctx = Context::new();
        let mut module = Module::new();

        let mut callee = Function::new(
            "double",
            vec![("x".to_string(), ctx.int_ty(64))],
            ctx.int_ty(64),
            Visibility::Internal,
        );
        let b = callee.add_block("entry");
        let twice = callee.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "twice",
            vec![Value::Param(0), Value::Param(0)],
        );
        callee.append_inst(b, twice);
        let ret = callee.new_inst(
            InstKind::Return,
            TypeId::VOID,
            "",
            vec![Value::Inst(twice)],
        );
        callee.append_inst(b, ret);
        let callee_id = module.add_function(callee);

        let mut caller = Function::new(
            "main",
            vec![("a".to_string(), ctx.int_ty(64))],
            ctx.int_ty(64),
            Visibility::External,
        );
        let b = caller.add_block("entry");
        let call = caller.new_inst(
            InstKind::Call,
            ctx.int_ty(64),
            "r",
            vec![Value::Function(callee_id), Value::Param(0)],
        );
        caller.append_inst(b, call);
        let ret = caller.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(call)]);
        caller.append_inst(b, ret);
        let caller_id = module.add_function(caller);

        assert!(inline_functions(
            &mut ctx,
            &mut module,
            &PassArgs::default()
        ));
        let caller = module.function(caller_id);
        assert_invariants(&ctx, caller);

        // No calls remain
        for block in caller.block_ids() {
            for &inst in caller.block(block).insts() {
                assert!(!matches!(caller.inst(inst).kind, InstKind::Call));
            }
        }
    }

    #[test]
    fn respects_budget() {
        let mut ctx = Context::new();
        let mut module = Module::new();

        let mut callee = Function::new("big", vec![], ctx.int_ty(64), Visibility::Internal);
        let b = callee.add_block("entry");
        let zero = ctx.int_const(0, 64);
        let mut acc = Value::Const(zero);
        for i in 0..40 {
            let one = ctx.int_const(1, 64);
            let next = callee.new_inst(
                InstKind::Arithmetic(ArithmeticOp::Add),
                ctx.int_ty(64),
                &format!("s{i}"),
                vec![acc, Value::Const(one)],
            );
            callee.append_inst(b, next);
            acc = Value::Inst(next);
        }
        let ret = callee.new_inst(InstKind::Return, TypeId::VOID, "", vec![acc]);
        callee.append_inst(b, ret);
        let callee_id = module.add_function(callee);

        let mut caller = Function::new("main", vec![], ctx.int_ty(64), Visibility::External);
        let b = caller.add_block("entry");
        let call = caller.new_inst(
            InstKind::Call,
            ctx.int_ty(64),
            "r",
            vec![Value::Function(callee_id)],
        );
        caller.append_inst(b, call);
        let ret = caller.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(call)]);
        caller.append_inst(b, ret);
        let caller_id = module.add_function(caller);

        let args = crate::opt::Pipeline::parse("inline(budget=10)").unwrap();
        assert!(!args.run(&mut ctx, &mut module));
        let caller = module.function(caller_id);
        let call_count = caller
            .block_ids()
            .iter()
            .flat_map(|&b| caller.block(b).insts().to_vec())
            .filter(|&i| matches!(caller.inst(i).kind, InstKind::Call))
            .count();
        assert_eq!(call_count, 1);
    }
}
