//! Assembler + VM integration tests
//!
//! These build assembly streams by hand, assemble them and execute the
//! binary, checking the architectural contract: register windows, compare
//! flags, conditional moves and the foreign-call protocol.

use scatha::asm::{
    assemble, ArithmeticOperation, AsmInst, AsmValue, AssemblyStream, Block, Condition, FFIType,
    ForeignFunctionInterface, LabelId, Type,
};
use scatha::vm::builtin::builtin_index;
use scatha::vm::VirtualMachine;

fn assemble_and_execute(stream: &AssemblyStream) -> VirtualMachine {
    let binary = assemble(stream).binary;
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).expect("binary loads");
    vm.execute(&[]).expect("program runs to completion");
    vm
}

fn mov_ri(reg: u8, value: u64) -> AsmInst {
    AsmInst::Move {
        dest: AsmValue::RegisterIndex(reg),
        src: AsmValue::Value64(value),
        width: 8,
    }
}

fn mov_rr(dest: u8, src: u8) -> AsmInst {
    AsmInst::Move {
        dest: AsmValue::RegisterIndex(dest),
        src: AsmValue::RegisterIndex(src),
        width: 8,
    }
}

// =============================================================================
// SCENARIO A - Euclidean GCD through the call protocol
// =============================================================================

#[test]
fn euclidean_gcd() {
    const START: LabelId = LabelId(0);
    const GCD: LabelId = LabelId(1);
    const GCD_ELSE: LabelId = LabelId(2);

    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: START,
        name: "start".to_string(),
        external: true,
        insts: vec![
            // Arguments go above the three frame metadata words
            mov_ri(6, 54),
            mov_ri(7, 24),
            AsmInst::Call {
                target: GCD,
                reg_offset: 6,
            },
            // The callee's return value aliases its argument slot 0
            mov_rr(3, 6),
            AsmInst::Terminate,
        ],
    });
    // gcd(a = R0, b = R1): while b != 0 { (a, b) = (b, a % b) } return a
    stream.add(Block {
        id: GCD,
        name: "gcd".to_string(),
        external: false,
        insts: vec![
            AsmInst::Test {
                ty: Type::Signed,
                reg: 1,
                width: 8,
            },
            AsmInst::Jump {
                cond: Some(Condition::NotEqual),
                target: GCD_ELSE,
            },
            AsmInst::Return,
        ],
    });
    stream.add(Block {
        id: GCD_ELSE,
        name: "gcd.else".to_string(),
        external: false,
        insts: vec![
            mov_rr(2, 0),
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Rem,
                ty: Type::Signed,
                dest: 2,
                src: AsmValue::RegisterIndex(1),
                width: 8,
            },
            mov_rr(0, 1),
            mov_rr(1, 2),
            AsmInst::Jump {
                cond: None,
                target: GCD,
            },
        ],
    });

    let vm = assemble_and_execute(&stream);
    // gcd(54, 24) == 6
    assert_eq!(vm.registers[3], 6);
}

// =============================================================================
// SCENARIO B - Signed arithmetic
// =============================================================================

#[test]
fn signed_subtraction() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(0, 2),
            mov_ri(1, (-6i64) as u64),
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Sub,
                ty: Type::Signed,
                dest: 0,
                src: AsmValue::RegisterIndex(1),
                width: 8,
            },
            AsmInst::Terminate,
        ],
    });
    let vm = assemble_and_execute(&stream);
    assert_eq!(vm.registers[0] as i64, 8);
}

#[test]
fn arithmetic_reference_values() {
    // (op, ty, lhs, rhs, expected) triplets for the RR form
    let cases: Vec<(ArithmeticOperation, Type, u64, u64, i64)> = vec![
        (ArithmeticOperation::Add, Type::Unsigned, 6, 2, 8),
        (ArithmeticOperation::Add, Type::Signed, 2, (-6i64) as u64, -4),
        (ArithmeticOperation::Sub, Type::Unsigned, 6, 2, 4),
        (ArithmeticOperation::Mul, Type::Signed, 2, (-6i64) as u64, -12),
        (ArithmeticOperation::Div, Type::Unsigned, 100, 3, 33),
        (ArithmeticOperation::Div, Type::Signed, 100, (-3i64) as u64, -33),
        (ArithmeticOperation::Rem, Type::Unsigned, 100, 3, 1),
        (ArithmeticOperation::Rem, Type::Signed, (-100i64) as u64, 3, -1),
    ];
    for (op, ty, lhs, rhs, expected) in cases {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                mov_ri(0, lhs),
                mov_ri(1, rhs),
                AsmInst::Arithmetic {
                    op,
                    ty,
                    dest: 0,
                    src: AsmValue::RegisterIndex(1),
                    width: 8,
                },
                AsmInst::Terminate,
            ],
        });
        let vm = assemble_and_execute(&stream);
        assert_eq!(vm.registers[0] as i64, expected, "{op:?} {ty:?} {lhs} {rhs}");
    }
}

#[test]
fn float_arithmetic() {
    let cases: Vec<(ArithmeticOperation, f64, f64, f64)> = vec![
        (ArithmeticOperation::Add, 6.4, -2.2, 4.2),
        (ArithmeticOperation::Sub, 6.0, 2.3, 3.7),
        (ArithmeticOperation::Mul, 2.4, 2.5, 6.0),
        (ArithmeticOperation::Div, 6.3, 3.0, 2.1),
    ];
    for (op, lhs, rhs, expected) in cases {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                mov_ri(0, lhs.to_bits()),
                mov_ri(1, rhs.to_bits()),
                AsmInst::Arithmetic {
                    op,
                    ty: Type::Float,
                    dest: 0,
                    src: AsmValue::RegisterIndex(1),
                    width: 8,
                },
                AsmInst::Terminate,
            ],
        });
        let vm = assemble_and_execute(&stream);
        let result = f64::from_bits(vm.registers[0]);
        assert!((result - expected).abs() < 1e-9, "{op:?} {lhs} {rhs}");
    }
}

// =============================================================================
// SCENARIO C - Conditional jumps
// =============================================================================

#[test]
fn conditional_jump_takes_jle_iff_lhs_below_rhs() {
    for (arg1, arg2) in [(-2i64, 7i64), (5, 0), (100, -3)] {
        const TAKEN: LabelId = LabelId(1);
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                mov_ri(0, arg1 as u64),
                AsmInst::Compare {
                    ty: Type::Signed,
                    lhs: 0,
                    rhs: AsmValue::Value64(arg2 as u64),
                    width: 8,
                },
                AsmInst::Jump {
                    cond: Some(Condition::LessEq),
                    target: TAKEN,
                },
                mov_ri(1, 2),
                AsmInst::Terminate,
            ],
        });
        stream.add(Block {
            id: TAKEN,
            name: "taken".to_string(),
            external: false,
            insts: vec![mov_ri(1, 1), AsmInst::Terminate],
        });

        let vm = assemble_and_execute(&stream);
        let expected = if arg1 <= arg2 { 1 } else { 2 };
        assert_eq!(vm.registers[1], expected, "args ({arg1}, {arg2})");
    }
}

// =============================================================================
// SCENARIO D - Conditional move
// =============================================================================

#[test]
fn conditional_move_respects_flags() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(0, 5),
            mov_ri(1, 7),
            AsmInst::Test {
                ty: Type::Signed,
                reg: 1,
                width: 8,
            },
            // R1 != 0, so `equal` is false and the move must not happen
            AsmInst::CondMove {
                cond: Condition::Equal,
                dest: 0,
                src: AsmValue::RegisterIndex(1),
                width: 8,
            },
            AsmInst::Terminate,
        ],
    });
    let vm = assemble_and_execute(&stream);
    assert_eq!(vm.registers[0], 5);
}

#[test]
fn test_and_set_materialize_flags() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(0, (-1i64) as u64),
            AsmInst::Test {
                ty: Type::Signed,
                reg: 0,
                width: 8,
            },
            AsmInst::Set {
                cond: Condition::Equal,
                dest: 0,
            },
            AsmInst::Set {
                cond: Condition::NotEqual,
                dest: 1,
            },
            AsmInst::Set {
                cond: Condition::Less,
                dest: 2,
            },
            AsmInst::Set {
                cond: Condition::LessEq,
                dest: 3,
            },
            AsmInst::Set {
                cond: Condition::Greater,
                dest: 4,
            },
            AsmInst::Set {
                cond: Condition::GreaterEq,
                dest: 5,
            },
            AsmInst::Terminate,
        ],
    });
    let vm = assemble_and_execute(&stream);
    assert_eq!(&vm.registers[0..6], &[0, 1, 1, 1, 0, 0]);
}

// =============================================================================
// SCENARIO E - Foreign call round trip
// =============================================================================

#[test]
fn foreign_call_round_trips_through_sqrt() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(0, 2.0f64.to_bits()),
            AsmInst::CallForeign {
                reg_offset: 0,
                interface: ForeignFunctionInterface {
                    name: "__builtin_sqrt_f64".to_string(),
                    argument_types: vec![FFIType::Float64],
                    return_type: FFIType::Float64,
                },
            },
            AsmInst::Terminate,
        ],
    });

    let result = assemble(&stream);
    let mut binary = result.binary;
    // Bind foreign slot 0 by hand: patch the placeholder index and install
    // the function in the VM's foreign table
    let (pos, _) = &result.unresolved_symbols[0];
    binary[*pos..pos + 2].copy_from_slice(&0u16.to_le_bytes());

    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    vm.set_foreign_builtin(0, builtin_index("__builtin_sqrt_f64").unwrap());
    vm.execute(&[]).unwrap();
    assert_eq!(f64::from_bits(vm.registers[0]), std::f64::consts::SQRT_2);
}

// =============================================================================
// Indirect calls through the data section
// =============================================================================

#[test]
fn indirect_call_through_patched_function_address() {
    const INCR: LabelId = LabelId(1);
    let mut stream = AssemblyStream::new();
    // Eight placeholder bytes; the assembler patches in the code offset of
    // the "incr" block
    stream.data = vec![0; 8];
    stream.address_placeholders = vec![(0, "incr".to_string())];
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            // R1 = pointer to the data slot, R2 = *R1 (the code offset)
            mov_ri(1, 1u64 << 48),
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(2),
                src: AsmValue::Memory(scatha::asm::MemoryAddress::base(1)),
                width: 8,
            },
            mov_ri(6, 5),
            AsmInst::CallReg {
                callee: 2,
                reg_offset: 6,
            },
            mov_rr(0, 6),
            AsmInst::Terminate,
        ],
    });
    stream.add(Block {
        id: INCR,
        name: "incr".to_string(),
        external: false,
        insts: vec![
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Add,
                ty: Type::Unsigned,
                dest: 0,
                src: AsmValue::Value64(1),
                width: 8,
            },
            AsmInst::Return,
        ],
    });

    let vm = assemble_and_execute(&stream);
    assert_eq!(vm.registers[0], 6);
}

// =============================================================================
// Memory operands and the stack
// =============================================================================

#[test]
fn stack_allocation_and_memory_round_trip() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            AsmInst::LIncSP { dest: 1, offset: 16 },
            mov_ri(0, 128),
            // *ptr = R0
            AsmInst::Move {
                dest: AsmValue::Memory(scatha::asm::MemoryAddress::base(1)),
                src: AsmValue::RegisterIndex(0),
                width: 8,
            },
            // R2 = *ptr
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(2),
                src: AsmValue::Memory(scatha::asm::MemoryAddress::base(1)),
                width: 8,
            },
            AsmInst::Terminate,
        ],
    });
    let vm = assemble_and_execute(&stream);
    assert_eq!(vm.registers[0], 128);
    assert_eq!(vm.registers[2], 128);
}

#[test]
fn misaligned_stack_increment_raises() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![AsmInst::LIncSP { dest: 0, offset: 12 }, AsmInst::Terminate],
    });
    let binary = assemble(&stream).binary;
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    let err = vm.execute(&[]).unwrap_err();
    assert!(matches!(
        err,
        scatha::RuntimeException::InvalidStackAllocation { size: 12 }
    ));
    // The instruction pointer still points at the faulting instruction
    assert_eq!(vm.instruction_pointer_offset(), 0);
}

#[test]
fn signed_division_by_zero_raises_and_rewinds() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(0, 10),
            mov_ri(1, 0),
            AsmInst::Arithmetic {
                op: ArithmeticOperation::Div,
                ty: Type::Signed,
                dest: 0,
                src: AsmValue::RegisterIndex(1),
                width: 8,
            },
            AsmInst::Terminate,
        ],
    });
    let binary = assemble(&stream).binary;
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    let err = vm.execute(&[]).unwrap_err();
    assert!(matches!(err, scatha::RuntimeException::Arithmetic(_)));
    // Two 10-byte moves precede the division
    assert_eq!(vm.instruction_pointer_offset(), 20);
}

#[test]
fn null_dereference_is_a_memory_access_error() {
    let mut stream = AssemblyStream::new();
    stream.add(Block {
        id: LabelId(0),
        name: "start".to_string(),
        external: true,
        insts: vec![
            mov_ri(1, 0),
            AsmInst::Move {
                dest: AsmValue::RegisterIndex(0),
                src: AsmValue::Memory(scatha::asm::MemoryAddress::base(1)),
                width: 8,
            },
            AsmInst::Terminate,
        ],
    });
    let binary = assemble(&stream).binary;
    let mut vm = VirtualMachine::new();
    vm.load_binary(&binary).unwrap();
    let err = vm.execute(&[]).unwrap_err();
    assert!(matches!(
        err,
        scatha::RuntimeException::MemoryAccess { .. }
    ));
}
