//! Interned IR types
//!
//! Types are owned by the per-module [`Context`](super::Context) and referred
//! to by [`TypeId`] handles. Structural equality is resolved at interning
//! time, so equal types always compare equal by handle.

use std::fmt;

/// Handle to an interned type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    /// The void type. [`Context`](super::Context) interns void first, so
    /// this handle is stable across contexts.
    pub const VOID: TypeId = TypeId(0);
}

/// Structural description of a type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeData {
    /// The void type (function returns only)
    Void,
    /// Opaque pointer
    Ptr,
    /// Integral type of width 1, 8, 16, 32 or 64 bits
    Int {
        /// Bit width
        width: u32,
    },
    /// Floating-point type of width 32 or 64 bits
    Float {
        /// Bit width
        width: u32,
    },
    /// Fixed-count array
    Array {
        /// Element type
        elem: TypeId,
        /// Number of elements
        count: u64,
    },
    /// Structure with ordered members, optionally named
    Struct {
        /// Name for nominal display; anonymous structs are structural
        name: Option<String>,
        /// Ordered member types
        members: Vec<TypeId>,
    },
    /// Function type
    Function {
        /// Parameter types
        params: Vec<TypeId>,
        /// Return type
        ret: TypeId,
    },
}

impl TypeData {
    /// `true` for integral and floating-point types
    pub fn is_arithmetic(&self) -> bool {
        matches!(self, TypeData::Int { .. } | TypeData::Float { .. })
    }
}

/// Formats a type for the textual IR writer
pub(crate) struct DisplayType<'a> {
    pub(crate) ctx: &'a super::Context,
    pub(crate) id: TypeId,
}

impl fmt::Display for DisplayType<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ctx.type_data(self.id) {
            TypeData::Void => write!(f, "void"),
            TypeData::Ptr => write!(f, "ptr"),
            TypeData::Int { width } => write!(f, "i{width}"),
            TypeData::Float { width } => write!(f, "f{width}"),
            TypeData::Array { elem, count } => {
                write!(
                    f,
                    "[{} x {}]",
                    DisplayType {
                        ctx: self.ctx,
                        id: *elem
                    },
                    count
                )
            }
            TypeData::Struct { name: Some(n), .. } => write!(f, "@{n}"),
            TypeData::Struct {
                name: None,
                members,
            } => {
                write!(f, "{{ ")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "{}",
                        DisplayType {
                            ctx: self.ctx,
                            id: *m
                        }
                    )?;
                }
                write!(f, " }}")
            }
            TypeData::Function { params, ret } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "{}",
                        DisplayType {
                            ctx: self.ctx,
                            id: *p
                        }
                    )?;
                }
                write!(
                    f,
                    ") -> {}",
                    DisplayType {
                        ctx: self.ctx,
                        id: *ret
                    }
                )
            }
        }
    }
}
