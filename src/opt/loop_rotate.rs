//! Loop rotation
//!
//! Rewrites while loops so the loop-closing test sits at the bottom.
//!
//! Before rotation the header `H` tests the condition and branches into the
//! loop (`E`) or past it (`S`); every iteration jumps back up to `H`. After
//! rotation `H` has been renamed to the guard `G`, a copy of it (the footer
//! `F`) sits at the bottom of the loop, all latches target `F`, and `E` is
//! the new loop header with predecessors `{G, F}`.
//!
//! The transformation, per header:
//! 1. If `H` has several non-loop predecessors, join them in a preheader.
//! 2. If `E` (or `S`) has several predecessors, split the `H -> E`
//!    (resp. `H -> S`) edge so each has exactly one.
//! 3. For every non-terminator instruction `i` of `H`, insert single-value
//!    phis `(H, i)` into `E` and `S` and route the uses of `i` dominated by
//!    `E` (resp. `S`) through them. Pre-existing single-valued phis in `E`
//!    and `S` are forwarded to their argument first.
//! 4. Clone `H` as `F`, rename `H` to `G`, register `F` as a predecessor of
//!    `E` and `S` and extend the inserted phis with the cloned values.
//! 5. Rewire every loop predecessor of `G` to `F`; unregister the non-loop
//!    predecessors from `F`.
//! 6. Phi arguments in `F` that still name instructions in `F` are replaced
//!    by the corresponding phi in `E`, because `F` does not dominate the
//!    loop body.
//! 7. Inserted phis that ended up unused are dropped.
//!
//! Nested while loops rotate in BFS rank order of the loop-nesting forest;
//! analyses are recomputed between headers since each rotation edits the
//! CFG.

use std::collections::HashMap;

use tracing::trace;

use super::PassArgs;
use crate::ir::{
    assert_invariants, BlockId, Context, Function, InstId, InstKind, LoopNestingForest, TypeId,
    Value,
};

/// Rotate every while loop of the function
pub fn rotate_loops(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    // Collect while-loop headers in BFS rank order of the loop-nesting
    // forest; rotating an outer loop does not disturb the headers of inner
    // loops collected here
    let lnf = function.get_or_compute_lnf();
    let rank_of = bfs_ranks(function);
    let mut headers_by_rank: Vec<Vec<BlockId>> = Vec::new();
    collect_while_headers(function, &lnf, &rank_of, lnf.roots(), 0, &mut headers_by_rank);

    let any = !headers_by_rank.is_empty();
    for rank in headers_by_rank {
        for header in rank {
            trace!(header = header.0, "rotating loop");
            rotate_one(function, header);
            function.invalidate_cfg_info();
        }
    }
    if any {
        assert_invariants(ctx, function);
    }
    any
}

/// BFS order of the CFG, used to rank forest nodes deterministically
fn bfs_ranks(function: &Function) -> HashMap<BlockId, usize> {
    let mut order = HashMap::new();
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(function.entry());
    order.insert(function.entry(), 0);
    let mut rank = 1;
    while let Some(block) = queue.pop_front() {
        for succ in function.successors(block) {
            if !order.contains_key(&succ) {
                order.insert(succ, rank);
                rank += 1;
                queue.push_back(succ);
            }
        }
    }
    order
}

fn collect_while_headers(
    function: &Function,
    lnf: &LoopNestingForest,
    rank_of: &HashMap<BlockId, usize>,
    nodes: &[BlockId],
    depth: usize,
    out: &mut Vec<Vec<BlockId>>,
) {
    let mut sorted = nodes.to_vec();
    sorted.sort_unstable_by_key(|b| rank_of.get(b).copied().unwrap_or(usize::MAX));
    for node in sorted {
        let mut next_depth = depth;
        if is_while_loop(function, lnf, node) {
            if out.len() == depth {
                out.push(Vec::new());
            }
            out[depth].push(node);
            next_depth = depth + 1;
        }
        collect_while_headers(function, lnf, rank_of, lnf.children(node), next_depth, out);
    }
}

/// A while loop: a proper header with loop body blocks and an exit edge
/// leaving directly from the header
fn is_while_loop(function: &Function, lnf: &LoopNestingForest, header: BlockId) -> bool {
    if !lnf.is_proper_loop(header) || lnf.children(header).is_empty() {
        return false;
    }
    function
        .successors(header)
        .iter()
        .any(|&succ| !lnf.is_loop_node_of(succ, header))
}

/// Forward and erase all phis of a single-predecessor block
fn erase_single_value_phis(function: &mut Function, block: BlockId) {
    debug_assert_eq!(function.block(block).predecessors().len(), 1);
    for phi in function.phis(block) {
        let arg = function.inst(phi).operands()[0];
        function.replace_value(Value::Inst(phi), arg);
        function.erase_inst(phi);
    }
}

struct Preprocessed {
    entry: BlockId,
    skip: BlockId,
    loop_preds: Vec<BlockId>,
    non_loop_preds: Vec<BlockId>,
}

fn preprocess(function: &mut Function, header: BlockId) -> Preprocessed {
    let lnf = function.get_or_compute_lnf();
    let (loop_preds, mut non_loop_preds): (Vec<_>, Vec<_>) = function
        .block(header)
        .predecessors()
        .iter()
        .copied()
        .partition(|&p| lnf.is_loop_node_of(p, header));

    if non_loop_preds.len() > 1 {
        let preheader = add_joining_predecessor(function, header, &non_loop_preds, "preheader");
        non_loop_preds = vec![preheader];
    }

    let succs = function.successors(header);
    debug_assert_eq!(
        succs.len(),
        2,
        "a while-loop header branches into and past the loop"
    );
    let (entry, skip) = if lnf.is_loop_node_of(succs[0], header) {
        (succs[0], succs[1])
    } else {
        (succs[1], succs[0])
    };

    let entry = if function.block(entry).predecessors().len() > 1 {
        function.split_edge("loop.entry", header, entry)
    } else {
        erase_single_value_phis(function, entry);
        entry
    };
    let skip = if function.block(skip).predecessors().len() > 1 {
        function.split_edge("loop.end", header, skip)
    } else {
        erase_single_value_phis(function, skip);
        skip
    };

    Preprocessed {
        entry,
        skip,
        loop_preds,
        non_loop_preds,
    }
}

/// Insert a block joining `preds` in front of `block`; phis in `block` that
/// merged values from those predecessors are split accordingly
fn add_joining_predecessor(
    function: &mut Function,
    block: BlockId,
    preds: &[BlockId],
    name: &str,
) -> BlockId {
    let joiner = function.insert_block_before(block, name);
    for phi in function.phis(block) {
        let incoming: Vec<(BlockId, Value)> = preds
            .iter()
            .map(|&p| (p, function.phi_incoming(phi, p).unwrap()))
            .collect();
        let ty = function.inst(phi).ty;
        let name = function.inst(phi).name.clone();
        let values: Vec<Value> = incoming.iter().map(|&(_, v)| v).collect();
        let joined = function.new_inst(
            InstKind::Phi {
                preds: incoming.iter().map(|&(p, _)| p).collect(),
            },
            ty,
            &name,
            values,
        );
        function.insert_phi(joiner, joined);
        // Shrink the original phi to the remaining predecessors plus the
        // joiner
        for &(p, _) in &incoming {
            let index = match &function.inst(phi).kind {
                InstKind::Phi { preds } => preds.iter().position(|&q| q == p).unwrap(),
                _ => unreachable!(),
            };
            function.remove_operand(phi, index);
            if let InstKind::Phi { preds } = function.inst_kind_mut(phi) {
                preds.remove(index);
            }
        }
        function.phi_add_argument(phi, joiner, Value::Inst(joined));
    }
    for &pred in preds {
        function.update_target(pred, block, joiner);
        // The phi entries for `pred` were already rewritten above, so only
        // the predecessor edge itself remains to be moved
        function.remove_predecessor(block, pred);
        function.add_predecessor(joiner, pred);
    }
    let goto = function.new_inst(InstKind::Goto, TypeId::VOID, "", vec![Value::Block(block)]);
    function.append_inst(joiner, goto);
    function.add_predecessor(block, joiner);
    joiner
}

fn rotate_one(function: &mut Function, header: BlockId) {
    let pre = preprocess(function, header);
    let dom = function.get_or_compute_dom_info();

    // Step 1: single-value phis in the entry and skip blocks take over all
    // uses of header instructions dominated by them. Together with the
    // header itself, the blocks dominated by entry and by skip partition
    // everything the header dominates.
    let mut added_phis: Vec<InstId> = Vec::new();
    add_single_value_phis(function, &dom, header, pre.entry, &mut added_phis);
    add_single_value_phis(function, &dom, header, pre.skip, &mut added_phis);

    // Step 2: clone the header as the footer; the original becomes the
    // guard. The footer keeps the guard's successors.
    let (footer, _) = crate::ir::clone_block(function, header, "loop.footer");
    function.move_block_before(footer, pre.skip);
    function.rename_block(header, "loop.guard");
    let guard = header;

    function.add_predecessor(pre.entry, footer);
    augment_single_value_phis(function, footer, pre.entry);
    function.add_predecessor(pre.skip, footer);
    augment_single_value_phis(function, footer, pre.skip);

    // Step 3: loop predecessors of the guard move to the footer; the footer
    // drops the cloned non-loop predecessor edges
    for &pred in &pre.loop_preds {
        function.update_target(pred, guard, footer);
        function.remove_predecessor(guard, pred);
    }
    for &pred in &pre.non_loop_preds {
        function.remove_predecessor(footer, pred);
    }

    // The guard could keep self-referential phi arguments because it
    // dominated the loop body; the footer dominates nothing, so its phi
    // arguments into itself are rerouted through the phis in the entry
    let footer_insts = function.block(footer).insts().to_vec();
    let entry_insts = function.block(pre.entry).insts().to_vec();
    let f_to_e: HashMap<InstId, InstId> = footer_insts
        .iter()
        .copied()
        .zip(entry_insts.iter().copied())
        .collect();
    for phi in function.phis(footer) {
        for (index, op) in function.inst(phi).operands().to_vec().into_iter().enumerate() {
            if let Value::Inst(arg) = op {
                if function.inst(arg).parent() == Some(footer) {
                    function.set_operand(phi, index, Value::Inst(f_to_e[&arg]));
                }
            }
        }
    }

    // Step 4: drop the phis nobody ended up using
    for phi in added_phis {
        if function.inst_alive(phi) && !function.is_used(Value::Inst(phi)) {
            function.erase_inst(phi);
        }
    }
}

fn add_single_value_phis(
    function: &mut Function,
    dom: &crate::ir::DomInfo,
    header: BlockId,
    succ: BlockId,
    added: &mut Vec<InstId>,
) {
    for inst in function.block(header).insts().to_vec() {
        if function.inst(inst).kind.is_terminator() {
            break;
        }
        let dominated_users: Vec<InstId> = function
            .users(Value::Inst(inst))
            .into_iter()
            .filter(|&user| {
                let Some(parent) = function.inst(user).parent() else {
                    return false;
                };
                if !dom.dominates(succ, parent) {
                    return false;
                }
                // Phis already sitting in `succ` keep their direct edge
                !(parent == succ && matches!(function.inst(user).kind, InstKind::Phi { .. }))
            })
            .collect();
        let ty = function.inst(inst).ty;
        let name = function.inst(inst).name.clone();
        let phi = function.new_inst(
            InstKind::Phi {
                preds: vec![header],
            },
            ty,
            &name,
            vec![Value::Inst(inst)],
        );
        function.insert_phi(succ, phi);
        for user in dominated_users {
            function.update_operand(user, Value::Inst(inst), Value::Inst(phi));
        }
        added.push(phi);
    }
}

/// One phi exists in `succ` for every non-terminator instruction of the
/// footer, in order, so extending is a positional zip
fn augment_single_value_phis(function: &mut Function, footer: BlockId, succ: BlockId) {
    let phis = function.phis(succ);
    let insts = function.block(footer).insts().to_vec();
    for (phi, inst) in phis.into_iter().zip(insts) {
        function.phi_add_argument(phi, footer, Value::Inst(inst));
    }
}
