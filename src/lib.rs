//! # Scatha
//!
//! A compiler and runtime for a statically typed, systems-oriented source
//! language. Programs lower through successively lower-level forms down to
//! bytecode executed by a stack+register virtual machine:
//!
//! ```text
//! SSA IR -> optimizer -> MIR -> register allocation -> assembly
//!        -> assembler -> linker -> binary -> VM
//! ```
//!
//! ## Main Components
//!
//! - [`ir`] - SSA control-flow graph with interned types, dominators and a
//!   loop-nesting forest
//! - [`opt`] - the pass registry and pipeline (mem2reg, DCE, constant
//!   folding, CSE/PRE, loop rotation, inlining, CFG simplification)
//! - [`mir`] - machine IR lowering and linear-scan register allocation
//! - [`cg`] - MIR to assembly-stream code generation
//! - [`asm`] - assembler and linker producing the binary program format
//! - [`vm`] - the virtual machine: paged virtual memory, opcode dispatch,
//!   builtins and the foreign-function interface
//! - [`exec`] - the debugger executor thread and its event bus
//! - [`bignum`] - arbitrary-precision rationals for constant arithmetic
//!
//! ## Example
//!
//! Compile an IR module to a binary and execute it:
//!
//! ```rust
//! use scatha::ir::{Context, Function, InstKind, Module, Value, Visibility};
//! use scatha::ir::{ArithmeticOp, TypeId};
//!
//! let mut ctx = Context::new();
//! let mut module = Module::new();
//! let mut f = Function::new("main", vec![], ctx.int_ty(64), Visibility::External);
//! let entry = f.add_block("entry");
//! let a = ctx.int_const(54, 64);
//! let b = ctx.int_const(12, 64);
//! let sum = f.new_inst(
//!     InstKind::Arithmetic(ArithmeticOp::Add),
//!     ctx.int_ty(64),
//!     "sum",
//!     vec![Value::Const(a), Value::Const(b)],
//! );
//! f.append_inst(entry, sum);
//! let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(sum)]);
//! f.append_inst(entry, ret);
//! module.add_function(f);
//!
//! let binary = scatha::compile(&mut ctx, &mut module, false).unwrap();
//! let mut vm = scatha::vm::VirtualMachine::new();
//! vm.load_binary(&binary).unwrap();
//! assert_eq!(vm.execute(&[]).unwrap(), 66);
//! ```

/// Version of the Scatha toolchain
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod asm;
pub mod bignum;
pub mod cg;
pub mod error;
pub mod exec;
pub mod ir;
pub mod mir;
pub mod opt;
pub mod vm;

pub use bignum::BigNum;
pub use error::{LinkerError, PipelineError, RuntimeException};

use asm::{ForeignLibraryDecl, LinkerOptions};

/// Drive the whole backend: optimize (optionally), lower, allocate
/// registers, generate code, assemble and link against the given foreign
/// libraries.
pub fn compile_and_link(
    ctx: &mut ir::Context,
    module: &mut ir::Module,
    optimize: bool,
    foreign_libs: &[ForeignLibraryDecl],
    linker_options: LinkerOptions,
) -> Result<Vec<u8>, LinkerError> {
    if optimize {
        opt::Pipeline::default_optimization().run(ctx, module);
    }
    let mut mir_module = mir::lower_module(ctx, module);
    for function in &mut mir_module.functions {
        mir::allocate_registers(function);
    }
    let stream = cg::generate(ctx, &mir_module);
    let result = asm::assemble(&stream);
    let mut binary = result.binary;
    asm::link(
        linker_options,
        &mut binary,
        foreign_libs,
        &result.unresolved_symbols,
    )?;
    Ok(binary)
}

/// [`compile_and_link`] with no foreign libraries and default options
pub fn compile(
    ctx: &mut ir::Context,
    module: &mut ir::Module,
    optimize: bool,
) -> Result<Vec<u8>, LinkerError> {
    compile_and_link(
        ctx,
        module,
        optimize,
        &[],
        LinkerOptions { search_host: true },
    )
}
