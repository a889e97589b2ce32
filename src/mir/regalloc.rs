//! Register allocation
//!
//! Linear-scan allocation over live intervals computed from a post-SSA
//! linearization. Phi nodes are eliminated first by inserting parallel
//! copies into predecessor blocks, placed immediately before the
//! terminating jump sequence; cycles among the copies are broken with a
//! temporary. Move-related registers are coalesced greedily through
//! allocation hints when their intervals do not interfere.
//!
//! The target has a flat per-frame register file addressed by a byte, so
//! pressure beyond the encodable range is rare; when it happens, the
//! furthest-ending interval is spilled to a dedicated stack slot with
//! reload temporaries in the reserved top registers.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::{MemAddr, MirBlockId, MirFunction, MirInst, Operand, Reg};

/// Highest hardware register index usable by the allocator; the three
/// registers above it are reserved for the spill base and reload temps
const MAX_ALLOCATABLE: u32 = 252;
const SPILL_BASE: u32 = 253;
const SPILL_TMP0: u32 = 254;
const SPILL_TMP1: u32 = 255;

/// The interference edges of a function's registers: pairs whose live
/// intervals overlap. Used by the `graph --interference` tooling.
pub fn interference_edges(function: &MirFunction) -> Vec<(u32, u32)> {
    let intervals = compute_intervals(function);
    let mut edges = Vec::new();
    for i in 0..intervals.len() {
        for j in i + 1..intervals.len() {
            let (a, b) = (&intervals[i], &intervals[j]);
            if a.start <= b.end && b.start <= a.end {
                edges.push((a.reg.0.min(b.reg.0), a.reg.0.max(b.reg.0)));
            }
        }
    }
    edges
}

/// Replace every virtual register with a hardware register index.
///
/// After return, `function.next_reg` is the number of hardware registers
/// the frame uses; parameters sit in registers `0..num_params`.
pub fn allocate_registers(function: &mut MirFunction) {
    eliminate_phis(function);

    loop {
        let intervals = compute_intervals(function);
        match linear_scan(function, &intervals) {
            ScanResult::Assigned(assignment, used) => {
                for block in &mut function.blocks {
                    for inst in &mut block.insts {
                        inst.for_each_reg_mut(|r| *r = Reg(assignment[&r.0]));
                    }
                }
                // Drop the moves coalescing made redundant
                for block in &mut function.blocks {
                    block.insts.retain(|inst| {
                        !matches!(
                            inst,
                            MirInst::Mov {
                                dest,
                                src: Operand::Reg(src),
                                ..
                            } if dest == src
                        )
                    });
                }
                function.next_reg = used;
                return;
            }
            ScanResult::Spill(victim) => {
                trace!(reg = victim.0, "spilling register");
                spill(function, victim);
            }
        }
    }
}

/// Replace phis with moves at the end of each predecessor
fn eliminate_phis(function: &mut MirFunction) {
    for block_index in 0..function.blocks.len() {
        let phis: Vec<(Reg, Vec<(MirBlockId, Reg)>)> = function.blocks[block_index]
            .insts
            .iter()
            .filter_map(|inst| match inst {
                MirInst::Phi { dest, args } => Some((*dest, args.clone())),
                _ => None,
            })
            .collect();
        if phis.is_empty() {
            continue;
        }
        function.blocks[block_index]
            .insts
            .retain(|inst| !matches!(inst, MirInst::Phi { .. }));

        let preds: HashSet<MirBlockId> = phis
            .iter()
            .flat_map(|(_, args)| args.iter().map(|&(p, _)| p))
            .collect();
        for pred in preds {
            let copies: Vec<(Reg, Reg)> = phis
                .iter()
                .filter_map(|(dest, args)| {
                    args.iter()
                        .find(|&&(p, _)| p == pred)
                        .map(|&(_, src)| (*dest, src))
                })
                .collect();
            let sequence = sequence_parallel_copies(function, copies);
            let block = &mut function.blocks[pred.0 as usize];
            let pos = block
                .insts
                .iter()
                .position(|inst| matches!(inst, MirInst::Jump { .. }))
                .unwrap_or(block.insts.len());
            for (i, (dest, src)) in sequence.into_iter().enumerate() {
                block.insts.insert(
                    pos + i,
                    MirInst::Mov {
                        dest,
                        src: Operand::Reg(src),
                        width: 8,
                    },
                );
            }
        }
    }
}

/// Order parallel copies so every source is read before its register is
/// overwritten, breaking cycles through a fresh temporary
fn sequence_parallel_copies(
    function: &mut MirFunction,
    mut copies: Vec<(Reg, Reg)>,
) -> Vec<(Reg, Reg)> {
    let mut out = Vec::new();
    copies.retain(|&(d, s)| d != s);
    while !copies.is_empty() {
        if let Some(pos) = copies
            .iter()
            .position(|&(d, _)| !copies.iter().any(|&(_, s)| s == d))
        {
            out.push(copies.remove(pos));
            continue;
        }
        // Every destination is still needed as a source: a cycle. Park one
        // source in a temporary and retarget its readers.
        let (_, src) = copies[0];
        let temp = function.fresh_reg();
        out.push((temp, src));
        for (_, s) in copies.iter_mut() {
            if *s == src {
                *s = temp;
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
struct Interval {
    reg: Reg,
    start: usize,
    end: usize,
    /// Move-related register whose assignment we would like to share
    hint: Option<Reg>,
}

/// Block-level liveness then per-instruction interval bounds
fn compute_intervals(function: &MirFunction) -> Vec<Interval> {
    let num_blocks = function.blocks.len();
    let mut use_sets: Vec<HashSet<Reg>> = vec![HashSet::new(); num_blocks];
    let mut def_sets: Vec<HashSet<Reg>> = vec![HashSet::new(); num_blocks];
    for (i, block) in function.blocks.iter().enumerate() {
        for inst in &block.insts {
            inst.for_each_use(|r| {
                if !def_sets[i].contains(&r) {
                    use_sets[i].insert(r);
                }
            });
            inst.for_each_def(|r| {
                def_sets[i].insert(r);
            });
        }
    }

    let mut live_in: Vec<HashSet<Reg>> = vec![HashSet::new(); num_blocks];
    let mut live_out: Vec<HashSet<Reg>> = vec![HashSet::new(); num_blocks];
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..num_blocks).rev() {
            let mut out = HashSet::new();
            for succ in function.successors(MirBlockId(i as u32)) {
                out.extend(live_in[succ.0 as usize].iter().copied());
            }
            let mut inn: HashSet<Reg> = use_sets[i].clone();
            inn.extend(out.difference(&def_sets[i]).copied());
            if inn != live_in[i] || out != live_out[i] {
                live_in[i] = inn;
                live_out[i] = out;
                changed = true;
            }
        }
    }

    // Global numbering in layout order
    let mut intervals: HashMap<Reg, Interval> = HashMap::new();
    let mut touch = |r: Reg, pos: usize, hint: Option<Reg>, map: &mut HashMap<Reg, Interval>| {
        let entry = map.entry(r).or_insert(Interval {
            reg: r,
            start: pos,
            end: pos,
            hint: None,
        });
        entry.start = entry.start.min(pos);
        entry.end = entry.end.max(pos);
        if entry.hint.is_none() {
            entry.hint = hint;
        }
    };

    // Parameters are live from the very beginning
    for p in 0..function.num_params {
        touch(Reg(p), 0, None, &mut intervals);
    }

    let mut pos = 1usize;
    for (i, block) in function.blocks.iter().enumerate() {
        let block_start = pos;
        for r in &live_in[i] {
            touch(*r, block_start, None, &mut intervals);
        }
        for inst in &block.insts {
            inst.for_each_use(|r| touch(r, pos, None, &mut intervals));
            let hint = match inst {
                MirInst::Mov {
                    src: Operand::Reg(s),
                    ..
                } => Some(*s),
                _ => None,
            };
            inst.for_each_def(|r| touch(r, pos, hint, &mut intervals));
            pos += 1;
        }
        let block_end = pos;
        for r in &live_out[i] {
            touch(*r, block_end, None, &mut intervals);
        }
        pos += 1;
    }

    let mut result: Vec<Interval> = intervals.into_values().collect();
    result.sort_by_key(|iv| (iv.start, iv.reg.0));
    result
}

enum ScanResult {
    /// Virtual register -> hardware index, and the number of registers used
    Assigned(HashMap<u32, u32>, u32),
    /// Allocation ran out of encodable registers; spill this one
    Spill(Reg),
}

fn linear_scan(function: &MirFunction, intervals: &[Interval]) -> ScanResult {
    let mut assignment: HashMap<u32, u32> = HashMap::new();
    let mut active: Vec<(usize, u32, Reg)> = Vec::new(); // (end, hw, reg)
    let mut free: Vec<u32> = (function.num_params..=MAX_ALLOCATABLE).rev().collect();
    let mut used = function.num_params;

    // Parameters are precolored to their window slots
    for p in 0..function.num_params {
        assignment.insert(p, p);
    }

    for interval in intervals {
        active.retain(|&(end, hw, _)| {
            if end < interval.start {
                free.push(hw);
                false
            } else {
                true
            }
        });
        if interval.reg.0 >= SPILL_BASE {
            // Reserved spill registers keep their fixed indices
            assignment.insert(interval.reg.0, interval.reg.0);
            used = used.max(interval.reg.0 + 1);
            continue;
        }
        if assignment.contains_key(&interval.reg.0) {
            // Precolored parameter: occupy its slot
            active.push((interval.end, interval.reg.0, interval.reg));
            free.retain(|&hw| hw != interval.reg.0);
            continue;
        }
        // Coalescing hint: reuse the move source's register when free
        let hinted = interval
            .hint
            .and_then(|h| assignment.get(&h.0).copied())
            .filter(|hw| free.contains(hw));
        let hw = match hinted {
            Some(hw) => {
                free.retain(|&x| x != hw);
                hw
            }
            None => match free.pop() {
                Some(hw) => hw,
                None => {
                    // Spill the active interval that ends last
                    let victim = active
                        .iter()
                        .max_by_key(|&&(end, _, _)| end)
                        .map(|&(_, _, r)| r)
                        .unwrap_or(interval.reg);
                    return ScanResult::Spill(victim);
                }
            },
        };
        assignment.insert(interval.reg.0, hw);
        active.push((interval.end, hw, interval.reg));
        used = used.max(hw + 1);
    }
    ScanResult::Assigned(assignment, used)
}

/// Rewrite a register through a stack slot: stores after defs, reloads
/// before uses
fn spill(function: &mut MirFunction, victim: Reg) {
    // Spill slots live in their own stack region addressed off a reserved
    // base register, separate from the alloca frame
    let base = Reg(SPILL_BASE);
    let mut slot_offset = None;
    for inst in &mut function.blocks[0].insts {
        if let MirInst::Lisp { dest, bytes } = inst {
            if *dest == base {
                slot_offset = Some(*bytes);
                *bytes += 8;
            }
        }
    }
    let slot_offset = match slot_offset {
        Some(offset) => offset,
        None => {
            function.blocks[0].insts.insert(
                0,
                MirInst::Lisp {
                    dest: base,
                    bytes: 8,
                },
            );
            0
        }
    };
    function.frame_size += 8;
    assert!(slot_offset <= u16::from(u8::MAX), "spill region exceeds addressable range");

    let addr = MemAddr::base_offset(base, slot_offset as u8);
    for block in &mut function.blocks {
        let mut rewritten = Vec::new();
        for mut inst in block.insts.drain(..) {
            let mut uses_victim = false;
            inst.for_each_use(|r| uses_victim |= r == victim);
            let mut defs_victim = false;
            inst.for_each_def(|r| defs_victim |= r == victim);

            if uses_victim {
                rewritten.push(MirInst::Mov {
                    dest: Reg(SPILL_TMP0),
                    src: Operand::Mem(addr),
                    width: 8,
                });
            }
            inst.for_each_reg_mut(|r| {
                if *r == victim {
                    *r = if defs_victim { Reg(SPILL_TMP1) } else { Reg(SPILL_TMP0) };
                }
            });
            rewritten.push(inst);
            if defs_victim {
                rewritten.push(MirInst::Store {
                    addr,
                    src: Reg(SPILL_TMP1),
                    width: 8,
                });
            }
        }
        block.insts = rewritten;
    }
}
