//! # Virtual machine
//!
//! A single-threaded interpreter over the binary program format. State is a
//! flat register file addressed through a window pointer, an instruction
//! pointer into the loaded image, a stack pointer into the static slot,
//! two compare flags, and the paged virtual memory.
//!
//! A call frame is `(iptr, register offset, stack pointer)`; the three
//! words directly below a callee's register window hold the caller's stack
//! pointer, the window offset and the return instruction pointer, which is
//! everything `ret` needs to unwind.

pub mod builtin;
mod exec;
pub mod ffi;
pub mod memory;
pub mod opcode;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::asm::{parse_link_section, ProgramHeader, HEADER_SIZE};
use crate::error::{RuntimeException, VmResult};

use ffi::ForeignFunction;
use memory::{VirtualMemory, VirtualPointer};

/// Compare flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmFlags {
    /// Result of the last compare: left operand was smaller
    pub less: bool,
    /// Result of the last compare: operands were equal
    pub equal: bool,
}

/// Bytes of stack memory reserved after the loaded image
const DEFAULT_STACK_SIZE: u64 = 1 << 20;

/// The virtual machine
pub struct VirtualMachine {
    /// Flat register file; frames are windows into it
    pub registers: Vec<u64>,
    /// Start of the current frame's window
    pub reg_offset: usize,
    /// Instruction pointer, an offset into the loaded image
    pub iptr: u64,
    /// One past the last code byte; reaching it ends execution
    pub program_break: u64,
    /// Compare flags
    pub flags: VmFlags,
    /// Guest memory
    pub memory: VirtualMemory,
    /// Stack pointer (inside the static slot, above the image)
    pub stack_ptr: VirtualPointer,

    entry_offset: u64,
    foreign_table: Vec<ForeignFunction>,
    /// Keeps resolved libraries loaded for the lifetime of the VM
    libraries: Vec<libloading::Library>,
    interrupt: Arc<AtomicBool>,
    running: bool,
    output: Box<dyn Write + Send>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    /// Create a VM with no program loaded
    pub fn new() -> Self {
        VirtualMachine {
            registers: vec![0; 4096],
            reg_offset: 0,
            iptr: 0,
            program_break: 0,
            flags: VmFlags::default(),
            memory: VirtualMemory::new(0),
            stack_ptr: VirtualPointer::NULL,
            entry_offset: 0,
            foreign_table: Vec::new(),
            libraries: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            running: false,
            output: Box::new(std::io::stdout()),
        }
    }

    /// Redirect builtin output (tests and tooling)
    pub fn set_output(&mut self, output: Box<dyn Write + Send>) {
        self.output = output;
    }

    /// Load a binary program: copies the image into the static slot, sets
    /// up the stack above it and rebuilds the foreign-function table from
    /// the dynamic-link section
    pub fn load_binary(&mut self, binary: &[u8]) -> VmResult<()> {
        let header = ProgramHeader::read_from(binary).ok_or_else(|| {
            RuntimeException::ForeignFunction("malformed program header".to_string())
        })?;
        let image = &binary[HEADER_SIZE as usize..header.size as usize];
        let image_len = image.len() as u64;
        let stack_base = (image_len + 15) & !15;
        self.memory
            .resize_static_slot((stack_base + DEFAULT_STACK_SIZE) as usize);
        self.memory
            .dereference(VirtualMemory::static_data_pointer(0), image_len)?
            .copy_from_slice(image);

        self.entry_offset = header.entry_offset;
        self.program_break = image_len;
        self.iptr = header.entry_offset;
        self.stack_ptr = VirtualMemory::static_data_pointer(stack_base);
        self.reg_offset = 0;
        self.flags = VmFlags::default();

        let linked = parse_link_section(binary);
        let (table, libraries) = ffi::build_foreign_table(&linked)?;
        self.foreign_table = table;
        self.libraries = libraries;
        debug!(
            image = image_len,
            entry = header.entry_offset,
            foreign = self.foreign_table.len(),
            "binary loaded"
        );
        Ok(())
    }

    /// Seed registers of the root frame with arguments and mark the VM
    /// running
    pub fn begin_execution(&mut self, args: &[u64]) {
        self.iptr = self.entry_offset;
        self.reg_offset = 0;
        for (i, &arg) in args.iter().enumerate() {
            self.registers[i] = arg;
        }
        self.running = true;
    }

    /// `true` while the instruction pointer has not reached the program
    /// break
    pub fn running(&self) -> bool {
        self.running && self.iptr < self.program_break
    }

    /// Finish execution bookkeeping
    pub fn end_execution(&mut self) {
        self.running = false;
    }

    /// Run to completion. Equivalent to `begin_execution` + a dispatch
    /// loop; returns the value of register 0 (the exit register).
    pub fn execute(&mut self, args: &[u64]) -> VmResult<u64> {
        self.begin_execution(args);
        while self.running() {
            self.dispatch_one()?;
        }
        self.end_execution();
        Ok(self.registers[0])
    }

    /// Run until completion or until the interruption flag is raised; the
    /// flag is checked once per instruction
    pub fn execute_interruptible(&mut self) -> VmResult<()> {
        while self.running() {
            if self.interrupt.swap(false, Ordering::AcqRel) {
                return Err(RuntimeException::Interrupt);
            }
            self.dispatch_one()?;
        }
        Ok(())
    }

    /// Execute exactly one instruction
    pub fn step_execution(&mut self) -> VmResult<()> {
        if self.running() {
            self.dispatch_one()?;
        }
        Ok(())
    }

    /// Handle other threads can use to request cooperative interruption
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Request that a concurrent `execute_interruptible` returns at the
    /// next instruction boundary
    pub fn interrupt_execution(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Drop a pending interruption request whose cause was already
    /// serviced (the executor calls this before starting a burst)
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    /// Current instruction pointer offset
    pub fn instruction_pointer_offset(&self) -> u64 {
        self.iptr
    }

    /// Rewind or reposition the instruction pointer (used by the debugger
    /// after a runtime exception)
    pub fn set_instruction_pointer_offset(&mut self, offset: u64) {
        self.iptr = offset;
    }

    /// Read a register of the current window
    pub fn get_register(&self, index: usize) -> u64 {
        self.registers[self.reg_offset + index]
    }

    /// Write a register of the current window
    pub fn set_register(&mut self, index: usize, value: u64) {
        self.ensure_registers(self.reg_offset + index + 1);
        self.registers[self.reg_offset + index] = value;
    }

    pub(crate) fn ensure_registers(&mut self, len: usize) {
        if self.registers.len() < len {
            self.registers.resize(len.next_power_of_two(), 0);
        }
    }

    pub(crate) fn write_output(&mut self, bytes: &[u8]) {
        let _ = self.output.write_all(bytes);
        let _ = self.output.flush();
    }
}

/// Copy run arguments into guest memory and produce the register seed the
/// entry function expects: a pointer to the argument block and its size
pub fn setup_arguments(vm: &mut VirtualMachine, args: &[String]) -> VmResult<Vec<u64>> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    let total: u64 = args.iter().map(|a| a.len() as u64 + 1).sum();
    let block = vm.memory.allocate(total.next_multiple_of(8), 8)?;
    let bytes = vm.memory.dereference(block, total)?;
    let mut cursor = 0;
    for arg in args {
        bytes[cursor..cursor + arg.len()].copy_from_slice(arg.as_bytes());
        bytes[cursor + arg.len()] = 0;
        cursor += arg.len() + 1;
    }
    Ok(vec![block.to_bits(), total])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{assemble, AsmInst, AsmValue, AssemblyStream, Block, LabelId};

    fn simple_program() -> Vec<u8> {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::Move {
                    dest: AsmValue::RegisterIndex(0),
                    src: AsmValue::Value64(99),
                    width: 8,
                },
                AsmInst::Terminate,
            ],
        });
        assemble(&stream).binary
    }

    #[test]
    fn loads_and_runs_trivial_program() {
        let mut vm = VirtualMachine::new();
        vm.load_binary(&simple_program()).unwrap();
        let exit = vm.execute(&[]).unwrap();
        assert_eq!(exit, 99);
        assert!(!vm.running());
    }

    #[test]
    fn interruption_pauses_without_advancing() {
        let mut vm = VirtualMachine::new();
        vm.load_binary(&simple_program()).unwrap();
        vm.begin_execution(&[]);
        vm.interrupt_execution();
        let err = vm.execute_interruptible().unwrap_err();
        assert!(err.is_interrupt());
        // Nothing executed yet
        assert_eq!(vm.instruction_pointer_offset(), 0);
        // Resuming finishes normally
        vm.execute_interruptible().unwrap();
        assert_eq!(vm.get_register(0), 99);
    }

    #[test]
    fn argument_setup_allocates_guest_memory() {
        let mut vm = VirtualMachine::new();
        vm.load_binary(&simple_program()).unwrap();
        let seed = setup_arguments(&mut vm, &["ab".to_string(), "c".to_string()]).unwrap();
        assert_eq!(seed.len(), 2);
        assert_eq!(seed[1], 5);
        let ptr = VirtualPointer::from_bits(seed[0]);
        let bytes = vm.memory.dereference_read(ptr, 5).unwrap();
        assert_eq!(bytes, b"ab\0c\0");
    }
}
