//! Foreign-function interface
//!
//! The VM's foreign table is rebuilt at load time from the binary's
//! dynamic-link section: every entry names its library (empty = host
//! process), so the loader opens the libraries again and resolves the raw
//! symbol addresses. Invocation goes through an ABI-correct trampoline
//! driven by the recorded type descriptors: integer and pointer arguments
//! are passed as 64-bit words, floats as doubles, and the return value is
//! written back to slot 0 of the caller-specified register window.

use tracing::debug;

use crate::asm::{FFIType, LinkedFunction};
use crate::error::{RuntimeException, VmResult};

use super::builtin;
use super::VirtualMachine;

/// Argument class for trampoline selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgClass {
    Int,
    Float,
}

/// Return class for trampoline selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetClass {
    Void,
    Int,
    Float,
}

/// A callable entry in the foreign-function table
pub struct ForeignFunction {
    /// Symbol name, kept for diagnostics
    pub name: String,
    kind: ForeignKind,
}

#[derive(Clone)]
enum ForeignKind {
    /// Slot exists but nothing was bound to it
    Unbound,
    /// Native symbol with its classified signature
    Native {
        address: *const std::ffi::c_void,
        args: Vec<ArgClass>,
        ret: RetClass,
    },
    /// A builtin routed through the foreign table (test harnesses register
    /// these directly)
    Builtin(u16),
}

// Raw symbol addresses are only dereferenced on the VM thread
unsafe impl Send for ForeignFunction {}

fn classify_arg(ty: &FFIType) -> VmResult<ArgClass> {
    match ty {
        FFIType::Float32 | FFIType::Float64 => Ok(ArgClass::Float),
        FFIType::Void => Err(RuntimeException::ForeignFunction(
            "void argument in foreign signature".to_string(),
        )),
        FFIType::Struct(_) => Err(RuntimeException::ForeignFunction(
            "aggregate arguments are passed by pointer".to_string(),
        )),
        _ => Ok(ArgClass::Int),
    }
}

fn classify_ret(ty: &FFIType) -> VmResult<RetClass> {
    match ty {
        FFIType::Void => Ok(RetClass::Void),
        FFIType::Float32 | FFIType::Float64 => Ok(RetClass::Float),
        FFIType::Struct(_) => Err(RuntimeException::ForeignFunction(
            "aggregate returns are passed by pointer".to_string(),
        )),
        _ => Ok(RetClass::Int),
    }
}

/// Rebuild the foreign table from a parsed dynamic-link section. Returns
/// the table and the opened libraries, which must stay loaded while the
/// table is in use.
pub fn build_foreign_table(
    linked: &[LinkedFunction],
) -> VmResult<(Vec<ForeignFunction>, Vec<libloading::Library>)> {
    let mut libraries: Vec<(String, libloading::Library)> = Vec::new();
    let max_index = linked.iter().map(|f| f.index).max().map_or(0, |i| i + 1);
    let mut table: Vec<ForeignFunction> = (0..max_index)
        .map(|i| ForeignFunction {
            name: format!("<unbound slot {i}>"),
            kind: ForeignKind::Unbound,
        })
        .collect();

    for function in linked {
        let address = if function.library.is_empty() {
            resolve_host_symbol(&function.interface.name)?
        } else {
            if !libraries.iter().any(|(name, _)| name == &function.library) {
                let lib =
                    unsafe { libloading::Library::new(&function.library) }.map_err(|err| {
                        RuntimeException::ForeignFunction(format!(
                            "cannot open library {}: {err}",
                            function.library
                        ))
                    })?;
                libraries.push((function.library.clone(), lib));
            }
            let (_, lib) = libraries
                .iter()
                .find(|(name, _)| name == &function.library)
                .unwrap();
            let symbol: libloading::Symbol<*mut std::ffi::c_void> = unsafe {
                lib.get(function.interface.name.as_bytes()).map_err(|err| {
                    RuntimeException::ForeignFunction(format!(
                        "unresolved symbol {}: {err}",
                        function.interface.name
                    ))
                })?
            };
            // The library outlives the table, so the address stays valid
            *symbol as *const std::ffi::c_void
        };
        let args = function
            .interface
            .argument_types
            .iter()
            .map(classify_arg)
            .collect::<VmResult<Vec<_>>>()?;
        let ret = classify_ret(&function.interface.return_type)?;
        debug!(
            symbol = %function.interface.name,
            index = function.index,
            "bound foreign function"
        );
        table[function.index as usize] = ForeignFunction {
            name: function.interface.name.clone(),
            kind: ForeignKind::Native { address, args, ret },
        };
    }
    Ok((table, libraries.into_iter().map(|(_, l)| l).collect()))
}

#[cfg(unix)]
fn resolve_host_symbol(name: &str) -> VmResult<*const std::ffi::c_void> {
    let this = libloading::os::unix::Library::this();
    let address = {
        let symbol: libloading::os::unix::Symbol<*mut std::ffi::c_void> =
            unsafe { this.get(name.as_bytes()) }.map_err(|err| {
                RuntimeException::ForeignFunction(format!(
                    "unresolved host symbol {name}: {err}"
                ))
            })?;
        *symbol as *const std::ffi::c_void
    };
    // The handle refers to the running process; keep it open
    std::mem::forget(this);
    Ok(address)
}

#[cfg(not(unix))]
fn resolve_host_symbol(name: &str) -> VmResult<*const std::ffi::c_void> {
    Err(RuntimeException::ForeignFunction(format!(
        "host symbol search unavailable for {name}"
    )))
}

impl VirtualMachine {
    /// Install a foreign function backed by a builtin (test and tooling
    /// hook; production tables come from the link section)
    pub fn set_foreign_builtin(&mut self, index: u16, builtin: u16) {
        let table = self.foreign_table_mut();
        while table.len() <= index as usize {
            table.push(ForeignFunction {
                name: format!("<unbound slot {}>", table.len()),
                kind: ForeignKind::Unbound,
            });
        }
        table[index as usize] = ForeignFunction {
            name: builtin::BUILTIN_NAMES
                .get(builtin as usize)
                .copied()
                .unwrap_or("<builtin>")
                .to_string(),
            kind: ForeignKind::Builtin(builtin),
        };
    }
}

/// Invoke foreign function `index` with the register window at `window`
pub fn call_foreign(vm: &mut VirtualMachine, window: usize, index: u16) -> VmResult<()> {
    vm.ensure_registers(window + 16);
    let kind = vm
        .foreign_table_ref()
        .get(index as usize)
        .map(|f| f.kind.clone())
        .ok_or_else(|| {
            RuntimeException::ForeignFunction(format!("invalid foreign index {index}"))
        })?;
    match kind {
        ForeignKind::Unbound => Err(RuntimeException::ForeignFunction(format!(
            "call through unbound foreign slot {index}"
        ))),
        ForeignKind::Builtin(builtin_index) => {
            builtin::call_builtin(vm, window, builtin_index)?;
            Ok(())
        }
        ForeignKind::Native { address, args, ret } => {
            let args: Vec<(ArgClass, u64)> = args
                .iter()
                .enumerate()
                .map(|(i, &class)| (class, vm.registers[window + i]))
                .collect();
            let result = unsafe { invoke_native(address, &args, ret)? };
            if ret != RetClass::Void {
                vm.registers[window] = result;
            }
            Ok(())
        }
    }
}

/// Call a native function through a shape-selected trampoline.
///
/// Each argument is classified into the integer or floating-point
/// parameter sequence exactly as a C compiler classifies these primitive
/// types, so passing the two sequences in order reproduces the original
/// call. Shapes up to six integer words or four mixed arguments are
/// supported.
///
/// # Safety
///
/// `address` must be a valid function of the described signature.
unsafe fn invoke_native(
    address: *const std::ffi::c_void,
    args: &[(ArgClass, u64)],
    ret: RetClass,
) -> VmResult<u64> {
    let ints: Vec<u64> = args
        .iter()
        .filter(|(c, _)| *c == ArgClass::Int)
        .map(|&(_, v)| v)
        .collect();
    let floats: Vec<f64> = args
        .iter()
        .filter(|(c, _)| *c == ArgClass::Float)
        .map(|&(_, v)| f64::from_bits(v))
        .collect();

    macro_rules! call {
        ($($value:expr => $ty:ty),*) => {{
            if ret == RetClass::Float {
                let f: unsafe extern "C" fn($($ty),*) -> f64 =
                    std::mem::transmute(address);
                f($($value),*).to_bits()
            } else {
                let f: unsafe extern "C" fn($($ty),*) -> u64 =
                    std::mem::transmute(address);
                f($($value),*)
            }
        }};
    }

    let result = match (ints.len(), floats.len()) {
        (0, 0) => call!(),
        (1, 0) => call!(ints[0] => u64),
        (2, 0) => call!(ints[0] => u64, ints[1] => u64),
        (3, 0) => call!(ints[0] => u64, ints[1] => u64, ints[2] => u64),
        (4, 0) => call!(ints[0] => u64, ints[1] => u64, ints[2] => u64, ints[3] => u64),
        (5, 0) => call!(
            ints[0] => u64, ints[1] => u64, ints[2] => u64, ints[3] => u64, ints[4] => u64
        ),
        (6, 0) => call!(
            ints[0] => u64, ints[1] => u64, ints[2] => u64, ints[3] => u64,
            ints[4] => u64, ints[5] => u64
        ),
        (0, 1) => call!(floats[0] => f64),
        (0, 2) => call!(floats[0] => f64, floats[1] => f64),
        (0, 3) => call!(floats[0] => f64, floats[1] => f64, floats[2] => f64),
        (0, 4) => call!(
            floats[0] => f64, floats[1] => f64, floats[2] => f64, floats[3] => f64
        ),
        (1, 1) => call!(ints[0] => u64, floats[0] => f64),
        (1, 2) => call!(ints[0] => u64, floats[0] => f64, floats[1] => f64),
        (2, 1) => call!(ints[0] => u64, ints[1] => u64, floats[0] => f64),
        (2, 2) => call!(
            ints[0] => u64, ints[1] => u64, floats[0] => f64, floats[1] => f64
        ),
        (3, 1) => call!(ints[0] => u64, ints[1] => u64, ints[2] => u64, floats[0] => f64),
        _ => {
            return Err(RuntimeException::ForeignFunction(format!(
                "unsupported foreign signature: {} int, {} float arguments",
                ints.len(),
                floats.len()
            )))
        }
    };
    Ok(result)
}

impl VirtualMachine {
    fn foreign_table_ref(&self) -> &Vec<ForeignFunction> {
        &self.foreign_table
    }

    fn foreign_table_mut(&mut self) -> &mut Vec<ForeignFunction> {
        &mut self.foreign_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rejects_aggregates() {
        assert!(classify_arg(&FFIType::Struct(vec![FFIType::Int32])).is_err());
        assert!(classify_arg(&FFIType::Int64).is_ok());
        assert_eq!(classify_ret(&FFIType::Void).unwrap(), RetClass::Void);
    }

    #[cfg(unix)]
    #[test]
    fn calls_host_strlen_through_trampoline() {
        let address = resolve_host_symbol("strlen").unwrap();
        let text = b"hello\0";
        let result = unsafe {
            invoke_native(
                address,
                &[(ArgClass::Int, text.as_ptr() as u64)],
                RetClass::Int,
            )
            .unwrap()
        };
        assert_eq!(result, 5);
    }

    #[cfg(unix)]
    #[test]
    fn calls_host_sqrt_with_float_argument() {
        let address = resolve_host_symbol("sqrt").unwrap();
        let result = unsafe {
            invoke_native(
                address,
                &[(ArgClass::Float, 9.0f64.to_bits())],
                RetClass::Float,
            )
            .unwrap()
        };
        assert_eq!(f64::from_bits(result), 3.0);
    }
}
