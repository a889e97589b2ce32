//! Textual IR parser (`.scir` files)
//!
//! Accepts the syntax the writer produces, plus `ext` declarations for
//! foreign functions. Example:
//!
//! ```text
//! ext @sqrt(f64) -> f64
//!
//! func i64 @main() {
//!   %entry:
//!     %x = add i64 40, i64 2
//!     return i64 %x
//! }
//! ```
//!
//! Forward references (phi operands, mutually recursive calls) resolve in
//! a patch pass after all definitions are read.

use std::collections::HashMap;

use thiserror::Error;

use super::context::Context;
use super::instruction::{
    ArithmeticOp, CompareMode, CompareOp, Conversion, InstKind, UnaryOp,
};
use super::module::{
    BlockId, ForeignFunctionDecl, Function, InstId, Module, Value, Visibility,
};
use super::types::{TypeData, TypeId};

/// Parse failures with line information
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    /// 1-based source line
    pub line: usize,
    /// What went wrong
    pub message: String,
}

/// Parse a whole module
pub fn parse_module(ctx: &mut Context, source: &str) -> Result<Module, ParseError> {
    Parser::new(ctx, source).run()
}

struct Parser<'a> {
    ctx: &'a mut Context,
    lines: Vec<(usize, String)>,
    cursor: usize,
}

/// Operand reference before resolution
#[derive(Debug, Clone)]
enum RawValue {
    Const(super::context::ConstId),
    Named(String),
    Block(String),
    Function(String),
}

struct PendingFunction {
    function: Function,
    blocks: HashMap<String, BlockId>,
    /// `(inst, operand_index, name)` patches for named values
    patches: Vec<(InstId, usize, RawValue)>,
    names: HashMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn new(ctx: &'a mut Context, source: &str) -> Self {
        let lines = source
            .lines()
            .enumerate()
            .map(|(i, l)| {
                let text = match l.split_once("//") {
                    Some((before, _)) => before,
                    None => l,
                };
                (i + 1, text.trim().to_string())
            })
            .filter(|(_, l)| !l.is_empty())
            .collect();
        Parser {
            ctx,
            lines,
            cursor: 0,
        }
    }

    fn err<T>(&self, line: usize, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            line,
            message: message.into(),
        })
    }

    fn next_line(&mut self) -> Option<(usize, String)> {
        let line = self.lines.get(self.cursor).cloned();
        self.cursor += 1;
        line
    }

    fn run(mut self) -> Result<Module, ParseError> {
        let mut module = Module::new();
        let mut pending: Vec<PendingFunction> = Vec::new();
        while let Some((line_no, line)) = self.next_line() {
            if let Some(rest) = line.strip_prefix("ext ") {
                let decl = self.parse_ext(line_no, rest)?;
                module.add_foreign_decl(decl);
            } else if let Some(rest) = line.strip_prefix("func ") {
                pending.push(self.parse_function(line_no, rest)?);
            } else {
                return self.err(line_no, format!("expected 'func' or 'ext', got '{line}'"));
            }
        }

        // Functions are registered in declaration order, so call targets
        // resolve by position
        let mut resolved_ids = HashMap::new();
        for p in pending.iter() {
            resolved_ids.insert(p.function.name.clone(), resolved_ids.len() as u32);
        }
        for mut p in pending {
            for (inst, index, raw) in std::mem::take(&mut p.patches) {
                let value = match &raw {
                    RawValue::Named(name) => match p.names.get(name) {
                        Some(&v) => v,
                        None => {
                            return self.err(0, format!("undefined value %{name}"));
                        }
                    },
                    RawValue::Block(name) => match p.blocks.get(name) {
                        Some(&b) => Value::Block(b),
                        None => {
                            return self.err(0, format!("undefined block %{name}"));
                        }
                    },
                    RawValue::Function(name) => match resolved_ids.get(name) {
                        Some(&id) => Value::Function(super::module::FuncId(id)),
                        None => {
                            return self.err(0, format!("undefined function @{name}"));
                        }
                    },
                    RawValue::Const(c) => Value::Const(*c),
                };
                p.function.set_operand(inst, index, value);
            }
            // Predecessor lists from the resolved CFG
            let blocks = p.function.block_ids();
            for &block in &blocks {
                for succ in p.function.successors(block) {
                    if !p.function.block(succ).predecessors().contains(&block) {
                        p.function.add_predecessor(succ, block);
                    }
                }
            }
            module.add_function(p.function);
        }
        Ok(module)
    }

    fn parse_ext(&mut self, line_no: usize, rest: &str) -> Result<ForeignFunctionDecl, ParseError> {
        // @name(ty, ty) -> ty
        let rest = rest.trim();
        let Some(rest) = rest.strip_prefix('@') else {
            return self.err(line_no, "expected '@name' after 'ext'");
        };
        let Some(open) = rest.find('(') else {
            return self.err(line_no, "expected parameter list");
        };
        let name = rest[..open].to_string();
        let Some(close) = rest.find(')') else {
            return self.err(line_no, "unterminated parameter list");
        };
        let mut params = Vec::new();
        let param_text = &rest[open + 1..close];
        if !param_text.trim().is_empty() {
            for part in param_text.split(',') {
                params.push(self.parse_type(line_no, part.trim())?);
            }
        }
        let ret = match rest[close + 1..].trim().strip_prefix("->") {
            Some(ty) => self.parse_type(line_no, ty.trim())?,
            None => self.ctx.void_ty(),
        };
        Ok(ForeignFunctionDecl {
            name,
            params,
            return_type: ret,
        })
    }

    fn parse_type(&mut self, line_no: usize, text: &str) -> Result<TypeId, ParseError> {
        match text {
            "void" => Ok(self.ctx.void_ty()),
            "ptr" => Ok(self.ctx.ptr_ty()),
            "i1" => Ok(self.ctx.int_ty(1)),
            "i8" => Ok(self.ctx.int_ty(8)),
            "i16" => Ok(self.ctx.int_ty(16)),
            "i32" => Ok(self.ctx.int_ty(32)),
            "i64" => Ok(self.ctx.int_ty(64)),
            "f32" => Ok(self.ctx.float_ty(32)),
            "f64" => Ok(self.ctx.float_ty(64)),
            _ => {
                if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                    let Some((elem, count)) = inner.rsplit_once(" x ") else {
                        return self.err(line_no, format!("malformed array type '{text}'"));
                    };
                    let elem = self.parse_type(line_no, elem.trim())?;
                    let Ok(count) = count.trim().parse::<u64>() else {
                        return self.err(line_no, "malformed array count");
                    };
                    return Ok(self.ctx.array_ty(elem, count));
                }
                if let Some(inner) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                    let mut members = Vec::new();
                    for part in inner.split(',') {
                        members.push(self.parse_type(line_no, part.trim())?);
                    }
                    return Ok(self.ctx.anon_struct_ty(members));
                }
                self.err(line_no, format!("unknown type '{text}'"))
            }
        }
    }

    fn parse_function(
        &mut self,
        line_no: usize,
        rest: &str,
    ) -> Result<PendingFunction, ParseError> {
        // <ret-ty> @name(<ty> %p, ...) {
        let rest = rest.trim_end_matches('{').trim();
        let Some(at) = rest.find('@') else {
            return self.err(line_no, "expected '@name'");
        };
        let ret = self.parse_type(line_no, rest[..at].trim())?;
        let Some(open) = rest.find('(') else {
            return self.err(line_no, "expected parameter list");
        };
        let name = rest[at + 1..open].to_string();
        let Some(close) = rest.rfind(')') else {
            return self.err(line_no, "unterminated parameter list");
        };
        let mut params = Vec::new();
        let param_text = &rest[open + 1..close];
        if !param_text.trim().is_empty() {
            for part in param_text.split(',') {
                let part = part.trim();
                let Some((ty, pname)) = part.rsplit_once(' ') else {
                    return self.err(line_no, format!("malformed parameter '{part}'"));
                };
                let ty = self.parse_type(line_no, ty.trim())?;
                let Some(pname) = pname.trim().strip_prefix('%') else {
                    return self.err(line_no, "parameter names start with '%'");
                };
                params.push((pname.to_string(), ty));
            }
        }
        let mut pending = PendingFunction {
            names: params
                .iter()
                .enumerate()
                .map(|(i, (n, _))| (n.clone(), Value::Param(i as u32)))
                .collect(),
            function: Function::new(&name, params, ret, Visibility::External),
            blocks: HashMap::new(),
            patches: Vec::new(),
        };

        // First pass inside the body: block headers
        let body_start = self.cursor;
        let mut depth_end = None;
        for i in self.cursor..self.lines.len() {
            let (bline, text) = &self.lines[i];
            if text.as_str() == "}" {
                depth_end = Some(i);
                break;
            }
            if let Some(header) = text.strip_suffix(':') {
                let Some(bname) = header.strip_prefix('%') else {
                    return self.err(*bline, "block labels start with '%'");
                };
                let id = pending.function.add_block(bname);
                pending.blocks.insert(bname.to_string(), id);
            }
        }
        let Some(end) = depth_end else {
            return self.err(line_no, "unterminated function body");
        };

        // Second pass: instructions
        let mut current: Option<BlockId> = None;
        self.cursor = body_start;
        while self.cursor < end {
            let (iline, text) = self.next_line().unwrap();
            if let Some(header) = text.strip_suffix(':') {
                let bname = header.trim_start_matches('%');
                current = Some(pending.blocks[bname]);
                continue;
            }
            let Some(block) = current else {
                return self.err(iline, "instruction outside of a block");
            };
            self.parse_inst(iline, &text, block, &mut pending)?;
        }
        self.cursor = end + 1;
        Ok(pending)
    }

    /// `<ty> <literal>` or `<ty> %name` or `ptr null` etc.
    fn parse_value(
        &mut self,
        line_no: usize,
        text: &str,
    ) -> Result<(TypeId, RawValue), ParseError> {
        let text = text.trim();
        let Some((ty_text, value_text)) = text.rsplit_once(' ') else {
            return self.err(line_no, format!("expected '<type> <value>', got '{text}'"));
        };
        let ty = self.parse_type(line_no, ty_text.trim())?;
        let value_text = value_text.trim();
        if let Some(name) = value_text.strip_prefix('%') {
            return Ok((ty, RawValue::Named(name.to_string())));
        }
        if let Some(name) = value_text.strip_prefix('@') {
            return Ok((ty, RawValue::Function(name.to_string())));
        }
        if value_text == "null" {
            let c = self.ctx.null_ptr();
            return Ok((ty, RawValue::Const(c)));
        }
        if value_text == "undef" {
            let c = self.ctx.undef(ty);
            return Ok((ty, RawValue::Const(c)));
        }
        match self.ctx.type_data(ty).clone() {
            TypeData::Int { width } => {
                let Ok(v) = value_text.parse::<i64>() else {
                    return self.err(line_no, format!("malformed integer '{value_text}'"));
                };
                let c = self.ctx.int_const(v as u64, width);
                Ok((ty, RawValue::Const(c)))
            }
            TypeData::Float { width } => {
                let Ok(v) = value_text.parse::<f64>() else {
                    return self.err(line_no, format!("malformed float '{value_text}'"));
                };
                let c = if width == 32 {
                    self.ctx.f32_const(v as f32)
                } else {
                    self.ctx.f64_const(v)
                };
                Ok((ty, RawValue::Const(c)))
            }
            _ => self.err(line_no, format!("cannot parse literal of type {ty_text}")),
        }
    }

    fn parse_inst(
        &mut self,
        line_no: usize,
        text: &str,
        block: BlockId,
        pending: &mut PendingFunction,
    ) -> Result<(), ParseError> {
        let (result_name, body) = match text.split_once('=') {
            Some((lhs, rhs)) if lhs.trim_start().starts_with('%') => {
                let name = lhs.trim().trim_start_matches('%').to_string();
                (Some(name), rhs.trim())
            }
            _ => (None, text),
        };
        let (mnemonic, rest) = body.split_once(' ').unwrap_or((body, ""));
        let rest = rest.trim();

        let mut raw_operands: Vec<RawValue> = Vec::new();
        let mut ty = self.ctx.void_ty();
        let kind: InstKind;

        match mnemonic {
            "alloca" => {
                // alloca <type>, <count-value>
                let Some((allocated, count)) = rest.split_once(',') else {
                    return self.err(line_no, "alloca needs a type and a count");
                };
                let allocated = self.parse_type(line_no, allocated.trim())?;
                let (_, count) = self.parse_value(line_no, count.trim())?;
                raw_operands.push(count);
                ty = self.ctx.ptr_ty();
                kind = InstKind::Alloca { allocated };
            }
            "load" => {
                let Some((loaded, addr)) = rest.split_once(',') else {
                    return self.err(line_no, "load needs a type and an address");
                };
                ty = self.parse_type(line_no, loaded.trim())?;
                let (_, addr) = self.parse_value(line_no, addr.trim())?;
                raw_operands.push(addr);
                kind = InstKind::Load;
            }
            "store" => {
                let Some((addr, value)) = rest.split_once(',') else {
                    return self.err(line_no, "store needs an address and a value");
                };
                let (_, addr) = self.parse_value(line_no, addr.trim())?;
                let (_, value) = self.parse_value(line_no, value.trim())?;
                raw_operands.push(addr);
                raw_operands.push(value);
                kind = InstKind::Store;
            }
            "getelementptr" => {
                // getelementptr inbounds <type>, <base>, <index>[, members...]
                let rest = rest.strip_prefix("inbounds").unwrap_or(rest).trim();
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                if parts.len() < 3 {
                    return self.err(line_no, "getelementptr needs type, base and index");
                }
                let inbounds = self.parse_type(line_no, parts[0])?;
                let (_, base) = self.parse_value(line_no, parts[1])?;
                let (_, index) = self.parse_value(line_no, parts[2])?;
                raw_operands.push(base);
                raw_operands.push(index);
                let mut member_indices = Vec::new();
                for part in &parts[3..] {
                    let Ok(i) = part.parse::<u32>() else {
                        return self.err(line_no, "member indices are integers");
                    };
                    member_indices.push(i);
                }
                ty = self.ctx.ptr_ty();
                kind = InstKind::GetElementPointer {
                    inbounds,
                    member_indices,
                };
            }
            "extract_value" | "insert_value" => {
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                let value_count = if mnemonic == "extract_value" { 1 } else { 2 };
                if parts.len() <= value_count {
                    return self.err(line_no, "missing member indices");
                }
                let mut result_ty = self.ctx.void_ty();
                for part in &parts[..value_count] {
                    let (t, v) = self.parse_value(line_no, part)?;
                    if raw_operands.is_empty() {
                        result_ty = t;
                    }
                    raw_operands.push(v);
                }
                let mut indices = Vec::new();
                for part in &parts[value_count..] {
                    let Ok(i) = part.parse::<u32>() else {
                        return self.err(line_no, "member indices are integers");
                    };
                    indices.push(i);
                }
                if mnemonic == "extract_value" {
                    let mut t = result_ty;
                    for &i in &indices {
                        t = self.ctx.member_type(t, i);
                    }
                    ty = t;
                    kind = InstKind::ExtractValue { indices };
                } else {
                    ty = result_ty;
                    kind = InstKind::InsertValue { indices };
                }
            }
            "cmp" => {
                // cmp <mode> <op> <a>, <b>
                let parts: Vec<&str> = rest.splitn(3, ' ').collect();
                if parts.len() != 3 {
                    return self.err(line_no, "cmp needs mode, relation and operands");
                }
                let mode = match parts[0] {
                    "signed" => CompareMode::Signed,
                    "unsigned" => CompareMode::Unsigned,
                    "float" => CompareMode::Float,
                    other => return self.err(line_no, format!("unknown compare mode '{other}'")),
                };
                let op = match parts[1] {
                    "ls" => CompareOp::Less,
                    "leq" => CompareOp::LessEq,
                    "grt" => CompareOp::Greater,
                    "geq" => CompareOp::GreaterEq,
                    "eq" => CompareOp::Equal,
                    "neq" => CompareOp::NotEqual,
                    other => {
                        return self.err(line_no, format!("unknown compare relation '{other}'"))
                    }
                };
                let Some((a, b)) = parts[2].split_once(',') else {
                    return self.err(line_no, "cmp needs two operands");
                };
                let (_, a) = self.parse_value(line_no, a)?;
                let (_, b) = self.parse_value(line_no, b)?;
                raw_operands.push(a);
                raw_operands.push(b);
                ty = self.ctx.bool_ty();
                kind = InstKind::Compare { mode, op };
            }
            "phi" => {
                // phi <ty> [%pred: <value>], ...
                let Some((phi_ty, args)) = rest.split_once(' ') else {
                    return self.err(line_no, "phi needs a type and arguments");
                };
                ty = self.parse_type(line_no, phi_ty.trim())?;
                let mut preds = Vec::new();
                for arg in args.split("],") {
                    let arg = arg.trim().trim_start_matches('[').trim_end_matches(']');
                    let Some((pred, value)) = arg.split_once(':') else {
                        return self.err(line_no, "phi arguments are '[%pred: <value>]'");
                    };
                    let pred = pred.trim().trim_start_matches('%');
                    let Some(&pred_id) = pending.blocks.get(pred) else {
                        return self.err(line_no, format!("unknown predecessor %{pred}"));
                    };
                    preds.push(pred_id);
                    let (_, v) = self.parse_value(line_no, value.trim())?;
                    raw_operands.push(v);
                }
                kind = InstKind::Phi { preds };
            }
            "select" => {
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                if parts.len() != 3 {
                    return self.err(line_no, "select needs condition and two values");
                }
                let (_, c) = self.parse_value(line_no, parts[0])?;
                let (then_ty, t) = self.parse_value(line_no, parts[1])?;
                let (_, e) = self.parse_value(line_no, parts[2])?;
                raw_operands.extend([c, t, e]);
                ty = then_ty;
                kind = InstKind::Select;
            }
            "call" => {
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                let (callee_ty, callee) = self.parse_value(line_no, parts[0])?;
                raw_operands.push(callee);
                for part in &parts[1..] {
                    let (_, v) = self.parse_value(line_no, part)?;
                    raw_operands.push(v);
                }
                ty = callee_ty;
                kind = InstKind::Call;
            }
            "foreign" => {
                // foreign call #<decl> [, args...]
                let rest = rest.strip_prefix("call").unwrap_or(rest).trim();
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                let Some(decl_text) = parts[0].strip_prefix('#') else {
                    return self.err(line_no, "foreign call references a declaration '#n'");
                };
                let Ok(decl) = decl_text.trim().parse::<u32>() else {
                    return self.err(line_no, "malformed declaration index");
                };
                for part in &parts[1..] {
                    let (_, v) = self.parse_value(line_no, part)?;
                    raw_operands.push(v);
                }
                kind = InstKind::ForeignCall { decl };
                ty = TypeId::VOID;
            }
            "goto" => {
                let target = rest.trim().trim_start_matches('%').to_string();
                raw_operands.push(RawValue::Block(target));
                kind = InstKind::Goto;
            }
            "branch" => {
                let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
                if parts.len() != 3 {
                    return self.err(line_no, "branch needs condition and two targets");
                }
                let (_, c) = self.parse_value(line_no, parts[0])?;
                raw_operands.push(c);
                for part in &parts[1..] {
                    raw_operands.push(RawValue::Block(
                        part.trim_start_matches('%').to_string(),
                    ));
                }
                kind = InstKind::Branch;
            }
            "return" => {
                if !rest.is_empty() {
                    let (_, v) = self.parse_value(line_no, rest)?;
                    raw_operands.push(v);
                }
                kind = InstKind::Return;
            }
            "bnt" | "lnt" | "neg" => {
                let (operand_ty, v) = self.parse_value(line_no, rest)?;
                raw_operands.push(v);
                ty = operand_ty;
                kind = InstKind::UnaryArithmetic(match mnemonic {
                    "bnt" => UnaryOp::BitwiseNot,
                    "lnt" => UnaryOp::LogicalNot,
                    _ => UnaryOp::Negate,
                });
            }
            "zext" | "sext" | "trunc" | "fext" | "ftrunc" | "utof" | "stof" | "ftou"
            | "ftos" | "bitcast" => {
                // <conv> <value> to <type>
                let Some((value, target)) = rest.rsplit_once(" to ") else {
                    return self.err(line_no, "conversions are '<value> to <type>'");
                };
                let (_, v) = self.parse_value(line_no, value.trim())?;
                raw_operands.push(v);
                ty = self.parse_type(line_no, target.trim())?;
                kind = InstKind::Conversion(match mnemonic {
                    "zext" => Conversion::Zext,
                    "sext" => Conversion::Sext,
                    "trunc" => Conversion::Trunc,
                    "fext" => Conversion::Fext,
                    "ftrunc" => Conversion::Ftrunc,
                    "utof" => Conversion::UtoF,
                    "stof" => Conversion::StoF,
                    "ftou" => Conversion::FtoU,
                    "ftos" => Conversion::FtoS,
                    _ => Conversion::Bitcast,
                });
            }
            _ => {
                // Binary arithmetic mnemonics
                let op = match mnemonic {
                    "add" => ArithmeticOp::Add,
                    "sub" => ArithmeticOp::Sub,
                    "mul" => ArithmeticOp::Mul,
                    "sdiv" => ArithmeticOp::SDiv,
                    "udiv" => ArithmeticOp::UDiv,
                    "srem" => ArithmeticOp::SRem,
                    "urem" => ArithmeticOp::URem,
                    "fadd" => ArithmeticOp::FAdd,
                    "fsub" => ArithmeticOp::FSub,
                    "fmul" => ArithmeticOp::FMul,
                    "fdiv" => ArithmeticOp::FDiv,
                    "lshl" => ArithmeticOp::LShL,
                    "lshr" => ArithmeticOp::LShR,
                    "ashl" => ArithmeticOp::AShL,
                    "ashr" => ArithmeticOp::AShR,
                    "and" => ArithmeticOp::And,
                    "or" => ArithmeticOp::Or,
                    "xor" => ArithmeticOp::XOr,
                    other => {
                        return self.err(line_no, format!("unknown instruction '{other}'"))
                    }
                };
                let Some((a, b)) = rest.split_once(',') else {
                    return self.err(line_no, "binary arithmetic needs two operands");
                };
                let (a_ty, a) = self.parse_value(line_no, a.trim())?;
                let (_, b) = self.parse_value(line_no, b.trim())?;
                raw_operands.push(a);
                raw_operands.push(b);
                ty = a_ty;
                kind = InstKind::Arithmetic(op);
            }
        }

        // Create with placeholder operands, then record patches; constants
        // resolve immediately
        let placeholder = Value::Const(self.ctx.undef(TypeId::VOID));
        let operand_count = raw_operands.len();
        let inst = pending.function.new_inst(
            kind,
            ty,
            result_name.as_deref().unwrap_or(""),
            vec![placeholder; operand_count],
        );
        pending.function.append_inst(block, inst);
        for (index, raw) in raw_operands.into_iter().enumerate() {
            match raw {
                RawValue::Const(c) => pending.function.set_operand(inst, index, Value::Const(c)),
                other => pending.patches.push((inst, index, other)),
            }
        }
        if let Some(name) = result_name {
            pending.names.insert(name, Value::Inst(inst));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::validate;

    #[test]
    fn parses_straight_line_function() {
        let mut ctx = Context::new();
        let module = parse_module(
            &mut ctx,
            r#"
func i64 @main() {
  %entry:
    %x = add i64 40, i64 2
    return i64 %x
}
"#,
        )
        .unwrap();
        let main = module.function(module.function_by_name("main").unwrap());
        assert!(validate(&ctx, main).is_ok());
        assert_eq!(main.block_ids().len(), 1);
    }

    #[test]
    fn parses_loop_with_phi() {
        let mut ctx = Context::new();
        let module = parse_module(
            &mut ctx,
            r#"
// Sum the numbers below n
func i64 @sum(i64 %n) {
  %entry:
    goto %header
  %header:
    %i = phi i64 [%entry: i64 0], [%body: i64 %i.next]
    %acc = phi i64 [%entry: i64 0], [%body: i64 %acc.next]
    %c = cmp signed ls i64 %i, i64 %n
    branch i1 %c, %body, %exit
  %body:
    %acc.next = add i64 %acc, i64 %i
    %i.next = add i64 %i, i64 1
    goto %header
  %exit:
    return i64 %acc
}
"#,
        )
        .unwrap();
        let f = module.function(module.function_by_name("sum").unwrap());
        assert!(validate(&ctx, f).is_ok(), "{:?}", validate(&ctx, f));
        let header = f.block_ids()[1];
        assert_eq!(f.phis(header).len(), 2);
    }

    #[test]
    fn parses_calls_and_ext_declarations() {
        let mut ctx = Context::new();
        let module = parse_module(
            &mut ctx,
            r#"
ext @sqrt(f64) -> f64

func i64 @helper(i64 %x) {
  %entry:
    return i64 %x
}

func i64 @main() {
  %entry:
    %r = call i64 @helper, i64 5
    return i64 %r
}
"#,
        )
        .unwrap();
        assert_eq!(module.foreign_decls.len(), 1);
        assert_eq!(module.foreign_decls[0].name, "sqrt");
        let main = module.function(module.function_by_name("main").unwrap());
        assert!(validate(&ctx, main).is_ok());
    }

    #[test]
    fn reports_unknown_instruction() {
        let mut ctx = Context::new();
        let err = parse_module(
            &mut ctx,
            "func void @f() {\n  %entry:\n    frobnicate i64 1, i64 2\n    return\n}",
        )
        .unwrap_err();
        assert!(err.message.contains("frobnicate"));
    }
}
