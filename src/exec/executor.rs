//! Debugger executor
//!
//! Wraps the VM in a dedicated thread driven by a command queue. The
//! executor is an explicit state machine (Idle, RunningIndef, Paused,
//! Stopped); transitions happen when a command is consumed or when the VM
//! raises a runtime exception. All VM mutation happens on the executor
//! thread; the host observes through published events and the locked
//! [`Executor::with_vm`] accessor.
//!
//! Source-line stepping and step-out are instruction-level single steps:
//! the executor keeps stepping until a host-installed predicate, consulted
//! after every step, reports that the target line or frame has been
//! reached.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::RuntimeException;
use crate::vm::{setup_arguments, VirtualMachine};

use super::messenger::Messenger;

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

/// Why execution broke back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakState {
    /// Paused on request
    Paused,
    /// Paused after a single step
    Step,
    /// Paused on a runtime exception
    Error,
}

/// Execution halted at an instruction
#[derive(Debug, Clone)]
pub struct BreakEvent {
    /// Instruction pointer offset of the halt
    pub offset: u64,
    /// Reason
    pub state: BreakState,
    /// The exception payload for error breaks
    pub exception: Option<RuntimeException>,
}

/// Published before a single instruction step
#[derive(Debug, Clone, Copy)]
pub struct WillStepInstruction {
    /// Offset of the instruction about to execute
    pub offset: u64,
}

/// Published after a single instruction step
#[derive(Debug, Clone, Copy)]
pub struct DidStepInstruction {
    /// Offset of the instruction that executed
    pub offset: u64,
}

/// Published when source-line stepping begins
#[derive(Debug, Clone, Copy)]
pub struct WillStepSourceLine {
    /// Offset at the start of the step
    pub offset: u64,
}

/// Published when source-line stepping reached a new line
#[derive(Debug, Clone, Copy)]
pub struct DidStepSourceLine {
    /// Offset at the end of the step
    pub offset: u64,
}

/// Published when step-out begins
#[derive(Debug, Clone, Copy)]
pub struct WillStepOut {
    /// Offset at the start of the step
    pub offset: u64,
}

/// Published when step-out reached the calling frame
#[derive(Debug, Clone, Copy)]
pub struct DidStepOut {
    /// Offset at the end of the step
    pub offset: u64,
}

/// The guest program ran to completion
#[derive(Debug, Clone, Copy)]
pub struct ProcessTerminated {
    /// Exit code (register 0)
    pub exit_code: u64,
}

/// Execution was stopped by the host before completion
#[derive(Debug, Clone, Copy)]
pub struct ProcessKilled;

// ---------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------

const STATE_IDLE: u8 = 0;
const STATE_RUNNING_INDEF: u8 = 1;
const STATE_PAUSED: u8 = 2;
const STATE_STOPPED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    StartExecution,
    StopExecution,
    ToggleExecution,
    StepInstruction,
    StepSourceLine,
    StepOut,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    None,
    Line,
    Out,
}

/// Predicate consulted during multi-instruction stepping
pub type StepPredicate = Box<dyn Fn(&VirtualMachine) -> bool + Send>;
/// Callback executed on the executor thread with the VM lock held
pub type VmCallback = Box<dyn FnOnce(&mut VirtualMachine) + Send>;

struct CommandQueue {
    queue: Mutex<VecDeque<Command>>,
    condvar: Condvar,
}

impl CommandQueue {
    fn new() -> Self {
        CommandQueue {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    fn push(&self, command: Command) {
        self.queue.lock().push_back(command);
        self.condvar.notify_one();
    }

    fn try_pop(&self) -> Option<Command> {
        self.queue.lock().pop_front()
    }

    fn wait(&self) -> Command {
        let mut queue = self.queue.lock();
        loop {
            if let Some(command) = queue.pop_front() {
                return command;
            }
            self.condvar.wait(&mut queue);
        }
    }
}

struct Shared {
    state: AtomicU8,
    commands: CommandQueue,
    vm: Mutex<VirtualMachine>,
    messenger: Arc<Messenger>,
    binary: Mutex<Vec<u8>>,
    run_arguments: Mutex<Vec<String>>,
    interrupt_callbacks: Mutex<Vec<VmCallback>>,
    line_predicate: Mutex<Option<StepPredicate>>,
    out_predicate: Mutex<Option<StepPredicate>>,
}

/// The executor: owns the VM thread
pub struct Executor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Executor {
    /// Spawn the executor thread
    pub fn new(messenger: Arc<Messenger>) -> Executor {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_IDLE),
            commands: CommandQueue::new(),
            vm: Mutex::new(VirtualMachine::new()),
            messenger,
            binary: Mutex::new(Vec::new()),
            run_arguments: Mutex::new(Vec::new()),
            interrupt_callbacks: Mutex::new(Vec::new()),
            line_predicate: Mutex::new(None),
            out_predicate: Mutex::new(None),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("executor".to_string())
            .spawn(move || thread_main(thread_shared))
            .expect("spawning the executor thread");
        Executor {
            shared,
            thread: Some(thread),
        }
    }

    /// Install the program to execute
    pub fn set_binary(&self, binary: Vec<u8>) {
        *self.shared.binary.lock() = binary;
    }

    /// Install the guest's run arguments
    pub fn set_arguments(&self, arguments: Vec<String>) {
        *self.shared.run_arguments.lock() = arguments;
    }

    /// Predicate deciding when a source-line step is complete
    pub fn set_source_line_predicate(&self, predicate: StepPredicate) {
        *self.shared.line_predicate.lock() = Some(predicate);
    }

    /// Predicate deciding when a step-out is complete
    pub fn set_step_out_predicate(&self, predicate: StepPredicate) {
        *self.shared.out_predicate.lock() = Some(predicate);
    }

    /// Begin or restart execution
    pub fn start_execution(&self) {
        self.push_command(Command::StartExecution);
    }

    /// Stop execution and wait until the executor is idle
    pub fn stop_execution(&self) {
        self.push_command(Command::StopExecution);
        while self.shared.state.load(Ordering::Acquire) != STATE_IDLE {
            std::thread::yield_now();
        }
    }

    /// Pause when running, resume when paused
    pub fn toggle_execution(&self) {
        if self.is_running() {
            self.shared.vm.lock().interrupt_execution();
        } else {
            self.push_command(Command::ToggleExecution);
        }
    }

    /// Execute one instruction (paused state)
    pub fn step_instruction(&self) {
        self.push_command(Command::StepInstruction);
    }

    /// Run until the source-line predicate is satisfied
    pub fn step_source_line(&self) {
        self.push_command(Command::StepSourceLine);
    }

    /// Run until the current frame returns
    pub fn step_out(&self) {
        self.push_command(Command::StepOut);
    }

    /// Shut the executor thread down and join it
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.push_command(Command::Shutdown);
            let _ = thread.join();
        }
    }

    /// `true` while executing indefinitely
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RUNNING_INDEF
    }

    /// `true` while waiting for commands with no program running
    pub fn is_idle(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_IDLE
    }

    /// `true` while paused mid-execution
    pub fn is_paused(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_PAUSED
    }

    /// Run `f` with the VM locked. Blocks while the executor holds the
    /// lock for an execution burst; prefer [`Executor::run_on_vm`] during
    /// indefinite execution.
    pub fn with_vm<R>(&self, f: impl FnOnce(&mut VirtualMachine) -> R) -> R {
        f(&mut self.shared.vm.lock())
    }

    /// Schedule `f` on the executor thread with the VM lock held. While
    /// running, the VM is interrupted cooperatively to service the
    /// callback; otherwise it runs immediately.
    pub fn run_on_vm(&self, f: VmCallback) {
        if self.is_running() {
            self.shared.interrupt_callbacks.lock().push(f);
            self.shared.vm.lock().interrupt_execution();
        } else {
            f(&mut self.shared.vm.lock());
        }
    }

    fn push_command(&self, command: Command) {
        self.shared.commands.push(command);
        self.shared.vm.lock().interrupt_execution();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------
// Executor thread
// ---------------------------------------------------------------------

fn thread_main(shared: Arc<Shared>) {
    info!("executor thread started");
    loop {
        let before = shared.state.load(Ordering::Relaxed);
        if before == STATE_STOPPED {
            return;
        }
        let after = match before {
            STATE_IDLE => do_idle(&shared),
            STATE_RUNNING_INDEF => do_running(&shared),
            _ => do_paused(&shared),
        };
        shared.state.store(after, Ordering::Release);
    }
}

// Step bookkeeping lives on the executor thread only
thread_local! {
    static STEP: std::cell::Cell<StepMode> = const { std::cell::Cell::new(StepMode::None) };
}

fn step_mode() -> StepMode {
    STEP.with(|s| s.get())
}

fn set_step_mode(mode: StepMode) {
    STEP.with(|s| s.set(mode));
}

fn do_idle(shared: &Arc<Shared>) -> u8 {
    match shared.commands.wait() {
        Command::StartExecution => {
            set_step_mode(StepMode::None);
            let mut vm = shared.vm.lock();
            let binary = shared.binary.lock().clone();
            if let Err(exception) = vm.load_binary(&binary) {
                shared.messenger.send_buffered(BreakEvent {
                    offset: 0,
                    state: BreakState::Error,
                    exception: Some(exception),
                });
                return STATE_IDLE;
            }
            let arguments = shared.run_arguments.lock().clone();
            let seed = match setup_arguments(&mut vm, &arguments) {
                Ok(seed) => seed,
                Err(exception) => {
                    shared.messenger.send_buffered(BreakEvent {
                        offset: 0,
                        state: BreakState::Error,
                        exception: Some(exception),
                    });
                    return STATE_IDLE;
                }
            };
            vm.begin_execution(&seed);
            debug!("execution started");
            STATE_RUNNING_INDEF
        }
        Command::Shutdown => STATE_STOPPED,
        // Stop, toggle and stepping are meaningless while idle
        _ => STATE_IDLE,
    }
}

fn do_running(shared: &Arc<Shared>) -> u8 {
    if let Some(command) = shared.commands.try_pop() {
        return handle_running_command(shared, command);
    }

    // Source-line and step-out stepping are instruction-level single
    // stepping: one instruction per state-machine turn, then the post-step
    // predicate decides whether the target has been reached
    let mode = step_mode();
    if mode != StepMode::None {
        let mut vm = shared.vm.lock();
        return match step_once(shared, &mut vm) {
            StepOutcome::Error => {
                set_step_mode(StepMode::None);
                STATE_PAUSED
            }
            StepOutcome::Finished => {
                set_step_mode(StepMode::None);
                STATE_IDLE
            }
            StepOutcome::Stepped => {
                let predicate = match mode {
                    StepMode::Line => &shared.line_predicate,
                    _ => &shared.out_predicate,
                };
                let done = predicate.lock().as_ref().map(|p| p(&vm)).unwrap_or(true);
                if !done {
                    return STATE_RUNNING_INDEF;
                }
                set_step_mode(StepMode::None);
                let offset = vm.instruction_pointer_offset();
                match mode {
                    StepMode::Line => shared.messenger.send_now(DidStepSourceLine { offset }),
                    _ => shared.messenger.send_now(DidStepOut { offset }),
                }
                shared.messenger.send_buffered(BreakEvent {
                    offset,
                    state: BreakState::Paused,
                    exception: None,
                });
                STATE_PAUSED
            }
        };
    }

    // The lock is held for the duration of the burst; interruption yields
    // it back cooperatively
    let mut vm = shared.vm.lock();
    // Command pushes raise the interrupt flag; any flag set while the
    // queue is empty is a leftover from a command that was already
    // consumed. A push racing with this clear re-raises the flag after
    // it, so no wakeup is lost.
    vm.clear_interrupt();
    if let Some(command) = shared.commands.try_pop() {
        drop(vm);
        return handle_running_command(shared, command);
    }
    // Callbacks that raced with the clear are serviced before the burst
    run_interrupt_callbacks(shared, &mut vm);
    match vm.execute_interruptible() {
        Ok(()) => {
            end_execution(shared, &mut vm);
            STATE_IDLE
        }
        Err(exception) => handle_runtime_exception(shared, &mut vm, exception),
    }
}

fn handle_running_command(shared: &Arc<Shared>, command: Command) -> u8 {
    match command {
        Command::StartExecution => STATE_RUNNING_INDEF,
        Command::StopExecution => {
            kill_execution(shared);
            STATE_IDLE
        }
        Command::ToggleExecution => {
            let offset = shared.vm.lock().instruction_pointer_offset();
            shared.messenger.send_buffered(BreakEvent {
                offset,
                state: BreakState::Paused,
                exception: None,
            });
            STATE_PAUSED
        }
        Command::Shutdown => {
            kill_execution(shared);
            STATE_STOPPED
        }
        Command::StepInstruction | Command::StepSourceLine | Command::StepOut => {
            STATE_RUNNING_INDEF
        }
    }
}

fn do_paused(shared: &Arc<Shared>) -> u8 {
    match shared.commands.wait() {
        Command::StartExecution => STATE_PAUSED,
        Command::StopExecution => {
            kill_execution(shared);
            STATE_IDLE
        }
        Command::ToggleExecution => STATE_RUNNING_INDEF,
        Command::StepInstruction => {
            let mut vm = shared.vm.lock();
            step_instruction(shared, &mut vm, true)
        }
        Command::StepSourceLine => {
            let vm = shared.vm.lock();
            shared.messenger.send_now(WillStepSourceLine {
                offset: vm.instruction_pointer_offset(),
            });
            drop(vm);
            set_step_mode(StepMode::Line);
            STATE_RUNNING_INDEF
        }
        Command::StepOut => {
            let vm = shared.vm.lock();
            shared.messenger.send_now(WillStepOut {
                offset: vm.instruction_pointer_offset(),
            });
            drop(vm);
            set_step_mode(StepMode::Out);
            STATE_RUNNING_INDEF
        }
        Command::Shutdown => STATE_STOPPED,
    }
}

fn handle_runtime_exception(
    shared: &Arc<Shared>,
    vm: &mut VirtualMachine,
    exception: RuntimeException,
) -> u8 {
    let offset = vm.instruction_pointer_offset();
    if !exception.is_interrupt() {
        // The dispatch loop leaves the instruction pointer at the faulting
        // instruction; reassert that so the host can inspect state
        vm.set_instruction_pointer_offset(offset);
        shared.messenger.send_buffered(BreakEvent {
            offset,
            state: BreakState::Error,
            exception: Some(exception),
        });
        return STATE_PAUSED;
    }
    if run_interrupt_callbacks(shared, vm) {
        return STATE_RUNNING_INDEF;
    }
    if !vm.running() {
        end_execution(shared, vm);
        return STATE_IDLE;
    }
    shared.messenger.send_buffered(BreakEvent {
        offset,
        state: BreakState::Paused,
        exception: None,
    });
    STATE_PAUSED
}

fn run_interrupt_callbacks(shared: &Arc<Shared>, vm: &mut VirtualMachine) -> bool {
    let callbacks: Vec<VmCallback> = shared.interrupt_callbacks.lock().drain(..).collect();
    if callbacks.is_empty() {
        return false;
    }
    for callback in callbacks {
        callback(vm);
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    /// One instruction executed, more remain
    Stepped,
    /// The program ran off its end
    Finished,
    /// The instruction raised an exception
    Error,
}

/// Execute a single instruction with the will/did events around it
fn step_once(shared: &Arc<Shared>, vm: &mut VirtualMachine) -> StepOutcome {
    let offset = vm.instruction_pointer_offset();
    shared.messenger.send_now(WillStepInstruction { offset });
    if let Err(exception) = vm.step_execution() {
        shared.messenger.send_buffered(BreakEvent {
            offset,
            state: BreakState::Error,
            exception: Some(exception),
        });
        vm.set_instruction_pointer_offset(offset);
        shared.messenger.send_now(DidStepInstruction { offset });
        return StepOutcome::Error;
    }
    shared.messenger.send_now(DidStepInstruction { offset });
    if vm.running() {
        StepOutcome::Stepped
    } else {
        end_execution(shared, vm);
        StepOutcome::Finished
    }
}

fn step_instruction(shared: &Arc<Shared>, vm: &mut VirtualMachine, announce: bool) -> u8 {
    match step_once(shared, vm) {
        StepOutcome::Error => STATE_PAUSED,
        StepOutcome::Finished => STATE_IDLE,
        StepOutcome::Stepped => {
            if announce {
                let after = vm.instruction_pointer_offset();
                shared.messenger.send_buffered(BreakEvent {
                    offset: after,
                    state: BreakState::Step,
                    exception: None,
                });
            }
            STATE_PAUSED
        }
    }
}

fn kill_execution(shared: &Arc<Shared>) {
    shared.vm.lock().end_execution();
    shared.messenger.send_now(ProcessKilled);
    debug!("process killed");
}

fn end_execution(shared: &Arc<Shared>, vm: &mut VirtualMachine) {
    vm.end_execution();
    let exit_code = vm.get_register(0);
    shared.messenger.send_now(ProcessTerminated { exit_code });
    debug!(exit_code, "process terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{assemble, AsmInst, AsmValue, AssemblyStream, Block, LabelId};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn counting_program() -> Vec<u8> {
        // R1 = 7; R0 = R1; terminate
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::Move {
                    dest: AsmValue::RegisterIndex(1),
                    src: AsmValue::Value64(7),
                    width: 8,
                },
                AsmInst::Move {
                    dest: AsmValue::RegisterIndex(0),
                    src: AsmValue::RegisterIndex(1),
                    width: 8,
                },
                AsmInst::Terminate,
            ],
        });
        assemble(&stream).binary
    }

    fn wait_until(f: impl Fn() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn runs_to_completion_and_reports_exit() {
        let messenger = Messenger::new();
        let exit = Arc::new(AtomicU64::new(u64::MAX));
        let exit2 = Arc::clone(&exit);
        messenger.listen(move |event: &ProcessTerminated| {
            exit2.store(event.exit_code, Ordering::SeqCst);
        });

        let mut executor = Executor::new(Arc::clone(&messenger));
        executor.set_binary(counting_program());
        executor.start_execution();
        wait_until(|| exit.load(Ordering::SeqCst) != u64::MAX);
        assert_eq!(exit.load(Ordering::SeqCst), 7);
        assert!(executor.is_idle());
        executor.shutdown();
    }

    /// A program that loops forever so pausing is deterministic
    fn spinning_program() -> Vec<u8> {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "spin".to_string(),
            external: true,
            insts: vec![AsmInst::Jump {
                cond: None,
                target: LabelId(0),
            }],
        });
        assemble(&stream).binary
    }

    #[test]
    fn pause_step_resume_kill() {
        let messenger = Messenger::new();
        let steps = Arc::new(AtomicU64::new(0));
        let steps2 = Arc::clone(&steps);
        messenger.listen(move |_: &DidStepInstruction| {
            steps2.fetch_add(1, Ordering::SeqCst);
        });
        let killed = Arc::new(AtomicU64::new(0));
        let killed2 = Arc::clone(&killed);
        messenger.listen(move |_: &ProcessKilled| {
            killed2.store(1, Ordering::SeqCst);
        });

        let mut executor = Executor::new(Arc::clone(&messenger));
        executor.set_binary(spinning_program());
        executor.start_execution();
        // Pausing works whether the toggle lands before or after the
        // thread enters the execution burst
        executor.toggle_execution();
        wait_until(|| executor.is_paused());

        executor.step_instruction();
        executor.step_instruction();
        executor.step_instruction();
        wait_until(|| steps.load(Ordering::SeqCst) == 3);
        assert!(executor.is_paused());

        executor.stop_execution();
        assert!(executor.is_idle());
        assert_eq!(killed.load(Ordering::SeqCst), 1);
        executor.shutdown();
    }

    #[test]
    fn source_line_stepping_consults_predicate() {
        let messenger = Messenger::new();
        let line_done = Arc::new(AtomicU64::new(0));
        let line_done2 = Arc::clone(&line_done);
        messenger.listen(move |_: &DidStepSourceLine| {
            line_done2.fetch_add(1, Ordering::SeqCst);
        });

        let mut executor = Executor::new(Arc::clone(&messenger));
        executor.set_binary(spinning_program());
        // "Line reached" after the second instruction step
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = Arc::clone(&calls);
        executor.set_source_line_predicate(Box::new(move |_vm| {
            calls2.fetch_add(1, Ordering::SeqCst) >= 1
        }));

        executor.start_execution();
        executor.toggle_execution();
        wait_until(|| executor.is_paused());

        executor.step_source_line();
        wait_until(|| line_done.load(Ordering::SeqCst) == 1);
        wait_until(|| executor.is_paused());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        executor.stop_execution();
        executor.shutdown();
    }

    #[test]
    fn run_on_vm_executes_when_idle() {
        let messenger = Messenger::new();
        let mut executor = Executor::new(messenger);
        executor.set_binary(counting_program());
        let touched = Arc::new(AtomicU64::new(0));
        let touched2 = Arc::clone(&touched);
        executor.run_on_vm(Box::new(move |vm| {
            vm.set_register(5, 42);
            touched2.store(1, Ordering::SeqCst);
        }));
        wait_until(|| touched.load(Ordering::SeqCst) == 1);
        assert_eq!(executor.with_vm(|vm| vm.get_register(5)), 42);
        executor.shutdown();
    }
}
