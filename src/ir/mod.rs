//! # Intermediate Representation
//!
//! An SSA-form control-flow graph with typed values. The IR is the hub of
//! the pipeline: IR generation produces it, the optimizer transforms it and
//! the MIR lowering consumes it.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── context.rs      # Interning context for types and constants
//! ├── types.rs        # TypeId, TypeData
//! ├── instruction.rs  # InstKind and operation enums
//! ├── module.rs       # Module, Function, BasicBlock, def-use maintenance
//! ├── clone.rs        # Block and function cloning with value maps
//! ├── dominance.rs    # Dominator tree, dominance frontiers, IDF
//! ├── loops.rs        # Loop-nesting forest
//! ├── validate.rs     # Invariant checking
//! ├── print.rs        # Textual writer
//! └── parse.rs        # Textual parser (.scir)
//! ```
//!
//! ## Invariants
//!
//! Well-formed modules satisfy, at all times: every non-constant,
//! non-parameter value is defined exactly once; operand definitions
//! dominate their uses (phi operands dominate the matching predecessor);
//! every block ends with exactly one terminator; predecessor lists and phi
//! edges agree; names are unique per function. [`validate`] checks all of
//! them; violations are programming errors.

mod clone;
mod context;
mod dominance;
mod instruction;
mod loops;
mod module;
mod parse;
mod print;
mod types;
mod validate;

pub use clone::{clone_block, clone_function, CloneMap};
pub use context::{ConstData, ConstId, Context};
pub use dominance::DomInfo;
pub use instruction::{
    ArithmeticOp, CompareMode, CompareOp, Conversion, InstKind, UnaryOp,
};
pub use loops::LoopNestingForest;
pub use module::{
    BlockData, BlockId, ForeignFunctionDecl, FuncId, Function, GlobalId, GlobalVariable, InstData,
    InstId, Module, Parameter, Value, Visibility,
};
pub use parse::{parse_module, ParseError};
pub use print::{print_function, print_module};
pub use types::{TypeData, TypeId};
pub use validate::{assert_invariants, validate};
