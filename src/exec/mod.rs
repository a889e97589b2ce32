//! # Debugger collaborator
//!
//! The [`Executor`] runs the VM on its own thread behind a command queue;
//! the [`Messenger`] carries its events to whatever UI subscribes. See the
//! module docs of [`executor`] for the state machine.

pub mod executor;
pub mod messenger;

pub use executor::{
    BreakEvent, BreakState, DidStepInstruction, DidStepOut, DidStepSourceLine, Executor,
    ProcessKilled, ProcessTerminated, WillStepInstruction, WillStepOut, WillStepSourceLine,
};
pub use messenger::Messenger;
