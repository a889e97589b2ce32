//! Textual IR writer

use std::fmt::Write;

use super::context::{ConstData, Context};
use super::instruction::InstKind;
use super::module::{Function, Module, Value};

/// Render a module
pub fn print_module(ctx: &Context, module: &Module) -> String {
    let mut out = String::new();
    for global in &module.globals {
        let _ = writeln!(
            out,
            "@{} = global {}",
            global.name,
            ctx.display_type(global.value_type)
        );
    }
    if !module.globals.is_empty() {
        out.push('\n');
    }
    for id in module.function_ids() {
        out.push_str(&print_function(ctx, module.function(id)));
        out.push('\n');
    }
    out
}

/// Render one function
pub fn print_function(ctx: &Context, function: &Function) -> String {
    let mut out = String::new();
    let params = function
        .params
        .iter()
        .map(|p| format!("{} %{}", ctx.display_type(p.ty), p.name))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(
        out,
        "func {} @{}({}) {{",
        ctx.display_type(function.return_type),
        function.name,
        params
    );
    for block in function.block_ids() {
        let _ = writeln!(out, "  %{}:", function.block(block).name);
        for &inst in function.block(block).insts() {
            let _ = writeln!(out, "    {}", render_inst(ctx, function, inst));
        }
    }
    out.push_str("}\n");
    out
}

fn render_value(ctx: &Context, function: &Function, value: Value) -> String {
    match value {
        Value::Const(c) => match ctx.const_data(c) {
            ConstData::Int { bits, ty } => {
                format!("{} {}", ctx.display_type(*ty), *bits as i64)
            }
            ConstData::Float { bits, ty } => {
                let text = if *ty == ctx.float_ty(32) {
                    f32::from_bits(*bits as u32).to_string()
                } else {
                    f64::from_bits(*bits).to_string()
                };
                format!("{} {}", ctx.display_type(*ty), text)
            }
            ConstData::NullPtr => "ptr null".to_string(),
            ConstData::Undef(ty) => format!("{} undef", ctx.display_type(*ty)),
            ConstData::Aggregate { ty, .. } => format!("{} aggregate", ctx.display_type(*ty)),
        },
        other => {
            let ty = function.value_type(ctx, other);
            format!("{} {}", ctx.display_type(ty), function.value_name(other))
        }
    }
}

fn render_inst(ctx: &Context, function: &Function, inst: super::module::InstId) -> String {
    let data = function.inst(inst);
    let result = if data.name.is_empty() {
        String::new()
    } else {
        format!("%{} = ", data.name)
    };
    let operands = |range: std::ops::Range<usize>| {
        data.operands()[range]
            .iter()
            .map(|&v| render_value(ctx, function, v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let all = operands(0..data.operands().len());
    match &data.kind {
        InstKind::Alloca { allocated } => format!(
            "{result}alloca {}, {all}",
            ctx.display_type(*allocated)
        ),
        InstKind::Load => format!("{result}load {}, {all}", ctx.display_type(data.ty)),
        InstKind::GetElementPointer {
            inbounds,
            member_indices,
        } => {
            let path = member_indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            if path.is_empty() {
                format!(
                    "{result}getelementptr inbounds {}, {all}",
                    ctx.display_type(*inbounds)
                )
            } else {
                format!(
                    "{result}getelementptr inbounds {}, {all}, {path}",
                    ctx.display_type(*inbounds)
                )
            }
        }
        InstKind::Compare { mode, op } => {
            let mode = match mode {
                crate::ir::CompareMode::Signed => "signed",
                crate::ir::CompareMode::Unsigned => "unsigned",
                crate::ir::CompareMode::Float => "float",
            };
            format!("{result}cmp {mode} {} {all}", op.mnemonic())
        }
        InstKind::Phi { preds } => {
            let args = preds
                .iter()
                .zip(data.operands())
                .map(|(&p, &v)| {
                    format!(
                        "[%{}: {}]",
                        function.block(p).name,
                        render_value(ctx, function, v)
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{result}phi {} {args}", ctx.display_type(data.ty))
        }
        InstKind::ForeignCall { decl } => format!("{result}foreign call #{decl} {all}"),
        InstKind::Conversion(conv) => format!(
            "{result}{} {all} to {}",
            conv.mnemonic(),
            ctx.display_type(data.ty)
        ),
        kind => {
            if all.is_empty() {
                format!("{result}{}", kind.mnemonic())
            } else {
                format!("{result}{} {all}", kind.mnemonic())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::ArithmeticOp;
    use crate::ir::module::Visibility;
    use crate::ir::types::TypeId;

    #[test]
    fn prints_add_and_return() {
        let ctx = Context::new();
        let mut f = Function::new(
            "sum",
            vec![
                ("a".to_string(), ctx.int_ty(64)),
                ("b".to_string(), ctx.int_ty(64)),
            ],
            ctx.int_ty(64),
            Visibility::External,
        );
        let entry = f.add_block("entry");
        let x = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::Add),
            ctx.int_ty(64),
            "res",
            vec![Value::Param(0), Value::Param(1)],
        );
        f.append_inst(entry, x);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(x)]);
        f.append_inst(entry, ret);

        let text = print_function(&ctx, &f);
        assert!(text.contains("func i64 @sum(i64 %a, i64 %b)"));
        assert!(text.contains("%res = add i64 %a, i64 %b"));
        assert!(text.contains("return i64 %res"));
    }
}
