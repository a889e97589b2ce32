//! Linker: foreign symbol resolution and the dynamic-link section
//!
//! Takes the assembled binary and the unresolved-symbol list and produces a
//! self-contained program: builtin symbols are bound to their fixed table
//! indices, foreign symbols are numbered and searched in the supplied
//! libraries (optionally also in the host process), and a dynamic-link
//! section describing every resolved foreign function is appended so the VM
//! can rebuild its foreign-function table at load time.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::LinkerError;
use crate::vm::builtin::builtin_index;
use crate::vm::opcode::OpCode;

use super::assembler::{ProgramHeader, HEADER_SIZE};
use super::ForeignFunctionInterface;

/// A foreign library supplied on the command line
#[derive(Debug, Clone)]
pub struct ForeignLibraryDecl {
    /// Library name as given by the user
    pub name: String,
    /// Path resolved against the library search paths; linking requires it
    pub resolved_path: Option<PathBuf>,
}

/// Linker options
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkerOptions {
    /// Also search the host process's own dynamic symbols
    pub search_host: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FFIKind {
    Builtin,
    Foreign,
}

#[derive(Debug, Clone, Copy)]
struct FFIAddress {
    kind: FFIKind,
    index: u16,
}

/// Assigns addresses: builtins from the fixed table, foreign functions
/// from a running counter
#[derive(Default)]
struct AddressFactory {
    ffi_index: u16,
}

impl AddressFactory {
    fn make(&mut self, name: &str) -> FFIAddress {
        if name.starts_with("__builtin_") {
            let index = builtin_index(name).expect("undefined builtin");
            return FFIAddress {
                kind: FFIKind::Builtin,
                index,
            };
        }
        let index = self.ffi_index;
        self.ffi_index += 1;
        FFIAddress {
            kind: FFIKind::Foreign,
            index,
        }
    }
}

struct FFIDecl {
    interface: ForeignFunctionInterface,
    index: u16,
}

/// Resolved functions of one library; an empty name means the host process
struct FFIList {
    lib_name: String,
    functions: Vec<FFIDecl>,
}

/// Link the assembled binary in place.
///
/// On success the binary carries a dynamic-link section after the
/// executable image; on failure the missing symbol names are reported and
/// the binary is left unmodified apart from address patching.
pub fn link(
    options: LinkerOptions,
    binary: &mut Vec<u8>,
    foreign_libs: &[ForeignLibraryDecl],
    unresolved_symbols: &[(usize, ForeignFunctionInterface)],
) -> Result<(), LinkerError> {
    assert!(
        binary.len() >= HEADER_SIZE as usize,
        "binary must at least contain a header"
    );

    // Walk in reverse order so earlier rewrites cannot invalidate later
    // placeholder positions
    let mut factory = AddressFactory::default();
    let mut foreign_functions: Vec<FFIDecl> = Vec::new();
    for (sym_pos, interface) in unresolved_symbols.iter().rev() {
        let address = factory.make(&interface.name);
        assert_eq!(
            &binary[*sym_pos..sym_pos + 2],
            &[0xFF, 0xFF],
            "two placeholder bytes expected at the recorded offset"
        );
        binary[*sym_pos..sym_pos + 2].copy_from_slice(&address.index.to_le_bytes());
        if address.kind == FFIKind::Builtin {
            // Builtins dispatch through their own table; retarget the
            // opcode accordingly
            binary[sym_pos - 2] = OpCode::cbltn as u8;
        } else {
            foreign_functions.push(FFIDecl {
                interface: interface.clone(),
                index: address.index,
            });
        }
    }

    // Search the supplied libraries, then optionally the host process
    let mut ffi_lists: Vec<FFIList> = foreign_libs
        .iter()
        .map(|lib| FFIList {
            lib_name: lib.name.clone(),
            functions: Vec::new(),
        })
        .collect();
    for (list, decl) in ffi_lists.iter_mut().zip(foreign_libs) {
        let path = decl
            .resolved_path
            .as_ref()
            .expect("tried to link symbol in unresolved library");
        match unsafe { libloading::Library::new(path) } {
            Ok(lib) => resolve_in_object(&lib, list, &mut foreign_functions),
            Err(err) => warn!(library = %decl.name, %err, "failed to open library"),
        }
    }
    if !foreign_functions.is_empty() && options.search_host {
        let mut host_list = FFIList {
            lib_name: String::new(),
            functions: Vec::new(),
        };
        resolve_in_host(&mut host_list, &mut foreign_functions);
        ffi_lists.push(host_list);
    }

    if !foreign_functions.is_empty() {
        return Err(LinkerError {
            missing_symbols: foreign_functions
                .into_iter()
                .map(|d| d.interface.name)
                .collect(),
        });
    }

    // Append the dynamic-link section and record the image size in the
    // header so loaders can find the section
    let image_size = binary.len() as u64;
    binary.extend_from_slice(&(ffi_lists.len() as u32).to_le_bytes());
    for list in &ffi_lists {
        binary.extend_from_slice(list.lib_name.as_bytes());
        binary.push(0);
        binary.extend_from_slice(&(list.functions.len() as u32).to_le_bytes());
        for decl in &list.functions {
            binary.extend_from_slice(decl.interface.name.as_bytes());
            binary.push(0);
            binary.push(decl.interface.argument_types.len() as u8);
            for ty in &decl.interface.argument_types {
                ty.serialize(binary);
            }
            decl.interface.return_type.serialize(binary);
            binary.extend_from_slice(&u32::from(decl.index).to_le_bytes());
        }
    }
    let mut header =
        ProgramHeader::read_from(binary).expect("assembler produced a valid header");
    header.size = image_size;
    let mut head = [0u8; HEADER_SIZE as usize];
    header.write_to(&mut head);
    binary[..HEADER_SIZE as usize].copy_from_slice(&head);
    Ok(())
}

/// Move every function exported by `lib` from `pending` into `list`
fn resolve_in_object(lib: &libloading::Library, list: &mut FFIList, pending: &mut Vec<FFIDecl>) {
    pending.retain(|decl| {
        let found = unsafe {
            lib.get::<*mut std::ffi::c_void>(decl.interface.name.as_bytes())
                .is_ok()
        };
        if found {
            debug!(symbol = %decl.interface.name, library = %list.lib_name, "resolved");
            list.functions.push(FFIDecl {
                interface: decl.interface.clone(),
                index: decl.index,
            });
        }
        !found
    });
}

#[cfg(unix)]
fn resolve_in_host(list: &mut FFIList, pending: &mut Vec<FFIDecl>) {
    let this = libloading::os::unix::Library::this();
    pending.retain(|decl| {
        let found = unsafe {
            this.get::<*mut std::ffi::c_void>(decl.interface.name.as_bytes())
                .is_ok()
        };
        if found {
            debug!(symbol = %decl.interface.name, "resolved in host");
            list.functions.push(FFIDecl {
                interface: decl.interface.clone(),
                index: decl.index,
            });
        }
        !found
    });
}

#[cfg(not(unix))]
fn resolve_in_host(_list: &mut FFIList, _pending: &mut Vec<FFIDecl>) {
    warn!("host symbol search is not supported on this platform");
}

/// One entry of the parsed dynamic-link section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedFunction {
    /// Library name; empty means the host process
    pub library: String,
    /// The function's interface
    pub interface: ForeignFunctionInterface,
    /// Foreign-function table index
    pub index: u32,
}

/// Parse the dynamic-link section beginning at `header.size`
pub fn parse_link_section(binary: &[u8]) -> Vec<LinkedFunction> {
    let Some(header) = ProgramHeader::read_from(binary) else {
        return Vec::new();
    };
    let mut cursor = header.size as usize;
    let mut result = Vec::new();
    let read_u32 = |bytes: &[u8], cursor: &mut usize| -> Option<u32> {
        let v = u32::from_le_bytes(bytes.get(*cursor..*cursor + 4)?.try_into().ok()?);
        *cursor += 4;
        Some(v)
    };
    let read_str = |bytes: &[u8], cursor: &mut usize| -> Option<String> {
        let end = bytes[*cursor..].iter().position(|&b| b == 0)? + *cursor;
        let s = String::from_utf8(bytes[*cursor..end].to_vec()).ok()?;
        *cursor = end + 1;
        Some(s)
    };
    let Some(num_libraries) = read_u32(binary, &mut cursor) else {
        return Vec::new();
    };
    for _ in 0..num_libraries {
        let Some(library) = read_str(binary, &mut cursor) else {
            return result;
        };
        let Some(num_functions) = read_u32(binary, &mut cursor) else {
            return result;
        };
        for _ in 0..num_functions {
            let Some(name) = read_str(binary, &mut cursor) else {
                return result;
            };
            let Some(&arg_count) = binary.get(cursor) else {
                return result;
            };
            cursor += 1;
            let mut argument_types = Vec::new();
            for _ in 0..arg_count {
                let Some(ty) = super::FFIType::deserialize(binary, &mut cursor) else {
                    return result;
                };
                argument_types.push(ty);
            }
            let Some(return_type) = super::FFIType::deserialize(binary, &mut cursor) else {
                return result;
            };
            let Some(index) = read_u32(binary, &mut cursor) else {
                return result;
            };
            result.push(LinkedFunction {
                library: library.clone(),
                interface: ForeignFunctionInterface {
                    name,
                    argument_types,
                    return_type,
                },
                index,
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{
        assemble, AsmInst, AssemblyStream, Block, FFIType, LabelId,
    };

    fn stream_with_foreign(name: &str) -> AssemblyStream {
        let mut stream = AssemblyStream::new();
        stream.add(Block {
            id: LabelId(0),
            name: "start".to_string(),
            external: true,
            insts: vec![
                AsmInst::CallForeign {
                    reg_offset: 4,
                    interface: ForeignFunctionInterface {
                        name: name.to_string(),
                        argument_types: vec![FFIType::Float64],
                        return_type: FFIType::Float64,
                    },
                },
                AsmInst::Terminate,
            ],
        });
        stream
    }

    #[test]
    fn builtin_symbols_bind_to_fixed_indices() {
        let result = assemble(&stream_with_foreign("__builtin_sqrt_f64"));
        let mut binary = result.binary;
        link(
            LinkerOptions::default(),
            &mut binary,
            &[],
            &result.unresolved_symbols,
        )
        .unwrap();
        // The call now dispatches through the builtin table
        let (pos, _) = &result.unresolved_symbols[0];
        assert_eq!(binary[pos - 2], OpCode::cbltn as u8);
        let index = u16::from_le_bytes(binary[*pos..pos + 2].try_into().unwrap());
        assert_eq!(index, builtin_index("__builtin_sqrt_f64").unwrap());
    }

    #[test]
    fn missing_symbols_are_reported() {
        let result = assemble(&stream_with_foreign("definitely_not_a_symbol_42"));
        let mut binary = result.binary;
        let err = link(
            LinkerOptions::default(),
            &mut binary,
            &[],
            &result.unresolved_symbols,
        )
        .unwrap_err();
        assert_eq!(err.missing_symbols, vec!["definitely_not_a_symbol_42"]);
    }

    #[test]
    fn host_search_resolves_libc_symbols() {
        let result = assemble(&stream_with_foreign("strlen"));
        let mut binary = result.binary;
        link(
            LinkerOptions { search_host: true },
            &mut binary,
            &[],
            &result.unresolved_symbols,
        )
        .unwrap();
        let linked = parse_link_section(&binary);
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].interface.name, "strlen");
        assert_eq!(linked[0].library, "");
        assert_eq!(linked[0].index, 0);
    }
}
