//! Builtin functions
//!
//! Builtins are implemented by the VM itself and dispatched through a
//! fixed table by `cbltn`. Like foreign functions they receive a register
//! window: arguments sit in consecutive slots and the return value, if
//! any, is written to slot 0 of the same window.

use crate::error::{RuntimeException, VmResult};

use super::memory::VirtualPointer;
use super::VirtualMachine;

/// Names of the builtins in table order
pub const BUILTIN_NAMES: &[&str] = &[
    "__builtin_abort",
    "__builtin_exit",
    "__builtin_memcpy",
    "__builtin_memset",
    "__builtin_alloc",
    "__builtin_dealloc",
    "__builtin_putchar",
    "__builtin_puti64",
    "__builtin_putf64",
    "__builtin_putstr",
    "__builtin_sqrt_f32",
    "__builtin_sqrt_f64",
];

/// The fixed table index of a builtin symbol
pub fn builtin_index(name: &str) -> Option<u16> {
    BUILTIN_NAMES
        .iter()
        .position(|&n| n == name)
        .map(|i| i as u16)
}

/// Dispatch builtin `index` with the register window starting at `window`.
///
/// Returns `true` when the builtin ends execution (`__builtin_exit`).
pub fn call_builtin(vm: &mut VirtualMachine, window: usize, index: u16) -> VmResult<bool> {
    vm.ensure_registers(window + 8);
    let arg = |vm: &VirtualMachine, i: usize| vm.registers[window + i];
    match index {
        // __builtin_abort
        0 => Err(RuntimeException::ForeignFunction(
            "abort called".to_string(),
        )),
        // __builtin_exit(code)
        1 => {
            let code = arg(vm, 0);
            vm.registers[0] = code;
            Ok(true)
        }
        // __builtin_memcpy(dest, size, src)
        2 => {
            let dest = VirtualPointer::from_bits(arg(vm, 0));
            let size = arg(vm, 1);
            let src = VirtualPointer::from_bits(arg(vm, 2));
            let data = vm.memory.dereference_read(src, size)?.to_vec();
            vm.memory.dereference(dest, size)?.copy_from_slice(&data);
            Ok(false)
        }
        // __builtin_memset(dest, size, value)
        3 => {
            let dest = VirtualPointer::from_bits(arg(vm, 0));
            let size = arg(vm, 1);
            let value = arg(vm, 2) as u8;
            vm.memory.dereference(dest, size)?.fill(value);
            Ok(false)
        }
        // __builtin_alloc(size, align) -> (ptr, size)
        4 => {
            let size = arg(vm, 0);
            let align = arg(vm, 1);
            let ptr = vm.memory.allocate(size, align)?;
            vm.registers[window] = ptr.to_bits();
            vm.registers[window + 1] = size;
            Ok(false)
        }
        // __builtin_dealloc(ptr, size, align)
        5 => {
            let ptr = VirtualPointer::from_bits(arg(vm, 0));
            let size = arg(vm, 1);
            let align = arg(vm, 2);
            vm.memory.deallocate(ptr, size, align)?;
            Ok(false)
        }
        // __builtin_putchar(char)
        6 => {
            let byte = arg(vm, 0) as u8;
            vm.write_output(&[byte]);
            Ok(false)
        }
        // __builtin_puti64(value)
        7 => {
            let text = (arg(vm, 0) as i64).to_string();
            vm.write_output(text.as_bytes());
            Ok(false)
        }
        // __builtin_putf64(value)
        8 => {
            let text = f64::from_bits(arg(vm, 0)).to_string();
            vm.write_output(text.as_bytes());
            Ok(false)
        }
        // __builtin_putstr(ptr, size)
        9 => {
            let ptr = VirtualPointer::from_bits(arg(vm, 0));
            let size = arg(vm, 1);
            let bytes = vm.memory.dereference_read(ptr, size)?.to_vec();
            vm.write_output(&bytes);
            Ok(false)
        }
        // __builtin_sqrt_f32(value) -> value
        10 => {
            let value = f32::from_bits(arg(vm, 0) as u32).sqrt();
            vm.registers[window] = u64::from(value.to_bits());
            Ok(false)
        }
        // __builtin_sqrt_f64(value) -> value
        11 => {
            let value = f64::from_bits(arg(vm, 0)).sqrt();
            vm.registers[window] = value.to_bits();
            Ok(false)
        }
        _ => Err(RuntimeException::ForeignFunction(format!(
            "invalid builtin index {index}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_stable_indices() {
        assert_eq!(builtin_index("__builtin_abort"), Some(0));
        assert_eq!(builtin_index("__builtin_exit"), Some(1));
        assert_eq!(builtin_index("__builtin_sqrt_f64"), Some(11));
        assert_eq!(builtin_index("__builtin_nope"), None);
    }

    #[test]
    fn sqrt_writes_result_into_slot_zero() {
        let mut vm = VirtualMachine::new();
        vm.registers[4] = 2.0f64.to_bits();
        call_builtin(&mut vm, 4, 11).unwrap();
        assert_eq!(f64::from_bits(vm.registers[4]), std::f64::consts::SQRT_2);
    }

    #[test]
    fn alloc_and_dealloc_round_trip() {
        let mut vm = VirtualMachine::new();
        vm.registers[4] = 64;
        vm.registers[5] = 8;
        call_builtin(&mut vm, 4, 4).unwrap();
        let ptr = vm.registers[4];
        assert_ne!(ptr, 0);
        assert_eq!(vm.registers[5], 64);

        vm.registers[4] = ptr;
        vm.registers[5] = 64;
        vm.registers[6] = 8;
        call_builtin(&mut vm, 4, 5).unwrap();
    }
}
