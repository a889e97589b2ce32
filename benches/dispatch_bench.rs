//! VM dispatch-loop benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use scatha::asm::{
    assemble, ArithmeticOperation, AsmInst, AsmValue, AssemblyStream, Block, Condition, LabelId,
    Type,
};
use scatha::vm::VirtualMachine;

/// A counting loop: R0 = 0; while R0 < n { R0 += 1 }
fn counting_program(n: u64) -> Vec<u8> {
    const HEADER: LabelId = LabelId(1);
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(0),
                src: AsmValue::Value64(0),
                width: 8,
            },
            AsmInst::Jump {
                cond: None,
                target: HEADER,
            },
        ],
    });
    stream.add(Block {
        id: HEADER,
        name: "header".to_string(),
        external: false,
        insts: vec![
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Add,
                ty: Type::Unsigned,
                dest: 0,
                src: AsmValue::Value64(1),
                width: 8,
            },
            AsmInst::Compare {
                ty: Type::Unsigned,
                lhs: 0,
                rhs: AsmValue::Value64(n),
                width: 8,
            },
            AsmInst::Jump {
                cond: Some(Condition::Less),
                target: HEADER,
            },
            AsmInst::Terminate,
        ],
    });
    assemble(&stream).binary
}

fn bench_dispatch(c: &mut Criterion) {
    let binary = counting_program(10_000);
    c.bench_function("dispatch_counting_loop_10k", |b| {
        let mut vm = VirtualMachine::new();
        vm.load_binary(&binary).unwrap();
        b.iter(|| {
            let result = vm.execute(&[]).unwrap();
            black_box(result);
        });
    });
}

fn bench_load(c: &mut Criterion) {
    let binary = counting_program(16);
    c.bench_function("load_binary", |b| {
        b.iter(|| {
            let mut vm = VirtualMachine::new();
            vm.load_binary(black_box(&binary)).unwrap();
            black_box(&vm);
        });
    });
}

criterion_group!(benches, bench_dispatch, bench_load);
criterion_main!(benches);
