//! End-to-end pipeline tests
//!
//! Parse textual IR, drive it through the whole backend (optionally with
//! the optimizer) and execute the binary, checking that every lowering
//! stage preserves the program's meaning.

use scatha::ir::{self, Context};
use scatha::opt::{PassArgs, Pipeline};
use scatha::vm::VirtualMachine;

fn run_ir(source: &str, optimize: bool, args: &[u64]) -> u64 {
    let mut ctx = Context::new();
    let mut module = ir::parse_module(&mut ctx, source).expect("IR parses");
    let binary = scatha::compile(&mut ctx, &mut module, optimize).expect("module links");
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).expect("binary loads");
    vm.execute(args).expect("program runs")
}

const GCD: &str = r#"
func i64 @gcd(i64 %a, i64 %b) {
  %entry:
    goto %header
  %header:
    %a1 = phi i64 [%entry: i64 %a], [%body: i64 %b1]
    %b1 = phi i64 [%entry: i64 %b], [%body: i64 %rem]
    %c = cmp signed neq i64 %b1, i64 0
    branch i1 %c, %body, %exit
  %body:
    %rem = srem i64 %a1, i64 %b1
    goto %header
  %exit:
    return i64 %a1
}

func i64 @main() {
  %entry:
    %r = call i64 @gcd, i64 54, i64 24
    return i64 %r
}
"#;

const SUM_BELOW: &str = r#"
func i64 @main() {
  %entry:
    goto %header
  %header:
    %i = phi i64 [%entry: i64 0], [%body: i64 %i.next]
    %acc = phi i64 [%entry: i64 0], [%body: i64 %acc.next]
    %c = cmp signed ls i64 %i, i64 100
    branch i1 %c, %body, %exit
  %body:
    %acc.next = add i64 %acc, i64 %i
    %i.next = add i64 %i, i64 1
    goto %header
  %exit:
    return i64 %acc
}
"#;

const MEMORY: &str = r#"
func i64 @main() {
  %entry:
    %slot = alloca i64, i32 1
    store ptr %slot, i64 41
    %v = load i64, ptr %slot
    %r = add i64 %v, i64 1
    return i64 %r
}
"#;

const SELECT_MAX: &str = r#"
func i64 @max(i64 %a, i64 %b) {
  %entry:
    %c = cmp signed grt i64 %a, i64 %b
    %r = select i1 %c, i64 %a, i64 %b
    return i64 %r
}

func i64 @main() {
  %entry:
    %x = call i64 @max, i64 17, i64 42
    %y = call i64 @max, i64 9, i64 3
    %r = add i64 %x, i64 %y
    return i64 %r
}
"#;

#[test]
fn gcd_computes_through_the_whole_pipeline() {
    assert_eq!(run_ir(GCD, false, &[]), 6);
}

#[test]
fn optimization_preserves_gcd() {
    assert_eq!(run_ir(GCD, true, &[]), 6);
}

#[test]
fn counting_loop_sums_correctly() {
    assert_eq!(run_ir(SUM_BELOW, false, &[]), 4950);
    assert_eq!(run_ir(SUM_BELOW, true, &[]), 4950);
}

#[test]
fn stack_slots_round_trip() {
    assert_eq!(run_ir(MEMORY, false, &[]), 42);
    // mem2reg removes the slot entirely; the result must not change
    assert_eq!(run_ir(MEMORY, true, &[]), 42);
}

#[test]
fn select_lowers_to_conditional_moves() {
    assert_eq!(run_ir(SELECT_MAX, false, &[]), 51);
    assert_eq!(run_ir(SELECT_MAX, true, &[]), 51);
}

#[test]
fn custom_pipeline_specification_runs() {
    let mut ctx = Context::new();
    let mut module = ir::parse_module(&mut ctx, SUM_BELOW).unwrap();
    let pipeline = Pipeline::parse("mem2reg,(constfold,instcombine,dce,simplifycfg)").unwrap();
    pipeline.run(&mut ctx, &mut module);
    for id in module.function_ids() {
        ir::validate(&ctx, module.function(id)).unwrap();
    }
    let binary = scatha::compile(&mut ctx, &mut module, false).unwrap();
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    assert_eq!(vm.execute(&[]).unwrap(), 4950);
}

// =============================================================================
// Loop rotation - structural post-conditions (scenario: entry -> H;
// H -> E | S; body -> H)
// =============================================================================

#[test]
fn loop_rotation_structure_and_semantics() {
    let mut ctx = Context::new();
    let mut module = ir::parse_module(&mut ctx, SUM_BELOW).unwrap();
    let main = module.function_by_name("main").unwrap();

    let function = module.function_mut(main);
    let entry = function.entry();
    let guard = function.successors(entry)[0];

    let changed = scatha::opt::rotate_loops(&mut ctx, function, &PassArgs::default());
    assert!(changed);
    ir::validate(&ctx, function).unwrap();

    // entry -> G; G -> E | S
    assert_eq!(function.successors(entry), vec![guard]);
    let guard_succs = function.successors(guard);
    assert_eq!(guard_succs.len(), 2);

    // E is the new header with predecessors {G, F}
    let lnf = function.get_or_compute_lnf();
    let new_header = guard_succs
        .iter()
        .copied()
        .find(|&b| lnf.is_proper_loop(b))
        .expect("one guard successor heads the rotated loop");
    let header_preds = function.block(new_header).predecessors().to_vec();
    assert_eq!(header_preds.len(), 2);
    assert!(header_preds.contains(&guard));
    let footer = header_preds.into_iter().find(|&p| p != guard).unwrap();

    // No loop-body block may branch back to the guard
    for block in function.block_ids() {
        if lnf.is_loop_node_of(block, new_header) {
            assert!(!function.successors(block).contains(&guard));
        }
    }
    // The footer closes the loop: F -> E | S
    assert!(function.successors(footer).contains(&new_header));
    assert_eq!(function.successors(footer).len(), 2);

    // Uses of loop values outside the loop flow through phis in E or S:
    // the return value is a phi in one of the guard successors
    let exit = guard_succs
        .iter()
        .copied()
        .find(|&b| !lnf.is_proper_loop(b))
        .expect("the other guard successor leaves the loop");
    let mut found_phi_use = false;
    for block in function.block_ids() {
        for &inst in function.block(block).insts() {
            if matches!(function.inst(inst).kind, ir::InstKind::Return) {
                if let Some(&ir::Value::Inst(source)) = function.inst(inst).operands().first() {
                    let parent = function.inst(source).parent().unwrap();
                    found_phi_use = parent == exit || parent == new_header;
                }
            }
        }
    }
    assert!(found_phi_use, "loop results must be reached through phis");

    // And the rotated program still computes the same sum
    let binary = scatha::compile(&mut ctx, &mut module, false).unwrap();
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    assert_eq!(vm.execute(&[]).unwrap(), 4950);
}

// =============================================================================
// Invariant preservation across passes
// =============================================================================

#[test]
fn all_passes_preserve_invariants_on_every_sample() {
    let samples = [GCD, SUM_BELOW, MEMORY, SELECT_MAX];
    for source in samples {
        let mut ctx = Context::new();
        let mut module = ir::parse_module(&mut ctx, source).unwrap();
        Pipeline::default_optimization().run(&mut ctx, &mut module);
        for id in module.function_ids() {
            ir::validate(&ctx, module.function(id))
                .unwrap_or_else(|e| panic!("invariants broken after pipeline: {e}"));
        }
    }
}

#[test]
fn inlining_flattens_the_call_graph() {
    let mut ctx = Context::new();
    let mut module = ir::parse_module(&mut ctx, SELECT_MAX).unwrap();
    Pipeline::parse("inline").unwrap().run(&mut ctx, &mut module);
    let main = module.function(module.function_by_name("main").unwrap());
    for block in main.block_ids() {
        for &inst in main.block(block).insts() {
            assert!(!matches!(main.inst(inst).kind, ir::InstKind::Call));
        }
    }
    ir::validate(&ctx, main).unwrap();
}
