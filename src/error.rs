//! Error types for the Scatha compiler and virtual machine

use thiserror::Error;

use crate::vm::memory::VirtualPointer;

/// Reasons a memory access can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessReason {
    /// Tried to dereference a pointer that has not been allocated before
    MemoryNotAllocated,
    /// Tried to dereference a pointer beyond its valid range
    DerefRangeTooBig,
    /// Tried to access memory at an address that is not a multiple of the
    /// access width
    MisalignedAccess,
}

/// Reasons an allocation request can be rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationReason {
    /// Requested size exceeds the 48-bit addressable range
    InvalidSize,
    /// Alignment is not a power of two, exceeds 32, or does not divide the
    /// size
    InvalidAlign,
}

/// Runtime exceptions raised by the virtual machine
///
/// Exceptions are not caught by the VM itself. The executor observes them,
/// publishes a break event and rewinds the instruction pointer to the
/// faulting instruction so the host can inspect state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeException {
    /// Invalid memory access (null, out of bounds, or unaligned)
    #[error("memory access error: {reason:?} at {pointer} (size {size})")]
    MemoryAccess {
        /// Why the access failed
        reason: MemoryAccessReason,
        /// The pointer of the invalid operation
        pointer: VirtualPointer,
        /// The size of the attempted access
        size: u64,
    },

    /// Tried to deallocate a block that was not allocated with the given
    /// size and alignment
    #[error("invalid deallocation of {pointer} (size {size}, align {align})")]
    Deallocation {
        /// The pointer passed to `deallocate`
        pointer: VirtualPointer,
        /// The size passed to `deallocate`
        size: u64,
        /// The alignment passed to `deallocate`
        align: u64,
    },

    /// Allocation request with invalid size or alignment
    #[error("allocation error: {reason:?} (size {size}, align {align})")]
    Allocation {
        /// Why the request was rejected
        reason: AllocationReason,
        /// The requested size
        size: u64,
        /// The requested alignment
        align: u64,
    },

    /// `lincsp` with an increment that is not a multiple of 8
    #[error("invalid stack allocation of {size} bytes")]
    InvalidStackAllocation {
        /// The requested stack increment
        size: u64,
    },

    /// Signed division or remainder by zero, or signed overflow
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// The byte at the instruction pointer is not a valid opcode
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode {
        /// The offending byte
        opcode: u8,
        /// Instruction pointer offset of the byte
        offset: u64,
    },

    /// Execution was interrupted by the host
    ///
    /// Raised from the cooperative interruption check; the instruction
    /// pointer is left at the instruction that would have executed next.
    #[error("execution interrupted")]
    Interrupt,

    /// A foreign call could not be dispatched
    #[error("foreign function error: {0}")]
    ForeignFunction(String),
}

impl RuntimeException {
    /// `true` for host-requested interruptions, which resume execution
    /// rather than reporting an error break
    pub fn is_interrupt(&self) -> bool {
        matches!(self, RuntimeException::Interrupt)
    }
}

/// Linking failed because foreign symbols remained unresolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("undefined reference(s): {}", missing_symbols.join(", "))]
pub struct LinkerError {
    /// Names of the symbols no library exported
    pub missing_symbols: Vec<String>,
}

/// Errors from the optimizer pipeline driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline specification string could not be parsed
    #[error("malformed pipeline specification at position {position}: {message}")]
    Parse {
        /// Byte offset into the specification string
        position: usize,
        /// What went wrong
        message: String,
    },

    /// A pass name does not exist in the registry
    #[error("unknown pass: {0}")]
    UnknownPass(String),
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, RuntimeException>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linker_error_lists_all_symbols() {
        let err = LinkerError {
            missing_symbols: vec!["foo".to_string(), "bar".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("bar"));
    }

    #[test]
    fn interrupt_classification() {
        assert!(RuntimeException::Interrupt.is_interrupt());
        assert!(!RuntimeException::Arithmetic("division by zero".into()).is_interrupt());
    }
}
