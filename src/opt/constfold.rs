//! Constant folding and propagation
//!
//! Arithmetic, comparisons and conversions over constants are evaluated at
//! compile time. Integer evaluation goes through [`BigNum`] and the result
//! is truncated to the operation width, which gives exact semantics for
//! every width without host overflow; floats are evaluated in IEEE-754
//! `f32`/`f64` directly. Phis whose incoming values collapse to a single
//! value propagate it.

use num_traits::Zero;

use super::PassArgs;
use crate::bignum::BigNum;
use crate::ir::{
    ArithmeticOp, CompareMode, CompareOp, ConstData, Context, Conversion, Function, InstId,
    InstKind, TypeData, UnaryOp, Value,
};

/// Fold constant expressions and propagate single-valued phis
pub fn constfold(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let mut any = false;
    loop {
        let mut replacements: Vec<(InstId, Value)> = Vec::new();
        for block in function.block_ids() {
            for &inst in function.block(block).insts() {
                if let Some(value) = fold_inst(ctx, function, inst) {
                    replacements.push((inst, value));
                }
            }
        }
        if replacements.is_empty() {
            return any;
        }
        any = true;
        for (inst, value) in replacements {
            if !function.inst_alive(inst) {
                continue;
            }
            function.replace_value(Value::Inst(inst), value);
            function.erase_inst(inst);
        }
    }
}

fn fold_inst(ctx: &mut Context, function: &Function, inst: InstId) -> Option<Value> {
    let data = function.inst(inst);
    match &data.kind {
        InstKind::Arithmetic(op) => {
            let (a, b) = (data.operands()[0], data.operands()[1]);
            fold_arithmetic(ctx, function, *op, a, b)
        }
        InstKind::UnaryArithmetic(op) => fold_unary(ctx, function, *op, data.operands()[0]),
        InstKind::Compare { mode, op } => {
            let (a, b) = (data.operands()[0], data.operands()[1]);
            fold_compare(ctx, function, *mode, *op, a, b)
        }
        InstKind::Conversion(conv) => fold_conversion(ctx, function, *conv, data.operands()[0], data.ty),
        InstKind::Select => {
            let cond = as_int(ctx, data.operands()[0])?;
            Some(if cond.1 != 0 {
                data.operands()[1]
            } else {
                data.operands()[2]
            })
        }
        InstKind::Phi { .. } => {
            // A phi whose incoming values are all identical (ignoring
            // self references) is that value
            let mut unique: Option<Value> = None;
            for &op in data.operands() {
                if op == Value::Inst(inst) {
                    continue;
                }
                match unique {
                    None => unique = Some(op),
                    Some(u) if u == op => {}
                    Some(_) => return None,
                }
            }
            unique
        }
        _ => None,
    }
}

/// Integer constant as `(width, bits)`
fn as_int(ctx: &Context, value: Value) -> Option<(u32, u64)> {
    let Value::Const(c) = value else { return None };
    match ctx.const_data(c) {
        ConstData::Int { bits, ty } => match ctx.type_data(*ty) {
            TypeData::Int { width } => Some((*width, *bits)),
            _ => None,
        },
        _ => None,
    }
}

/// Float constant as `(width, f64 value)`
fn as_float(ctx: &Context, value: Value) -> Option<(u32, f64)> {
    let Value::Const(c) = value else { return None };
    match ctx.const_data(c) {
        ConstData::Float { bits, ty } => match ctx.type_data(*ty) {
            TypeData::Float { width: 32 } => Some((32, f64::from(f32::from_bits(*bits as u32)))),
            TypeData::Float { width } => Some((*width, f64::from_bits(*bits))),
            _ => None,
        },
        _ => None,
    }
}

fn sign_extend(bits: u64, width: u32) -> i64 {
    if width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

fn fold_arithmetic(
    ctx: &mut Context,
    _function: &Function,
    op: ArithmeticOp,
    a: Value,
    b: Value,
) -> Option<Value> {
    if op.is_float() {
        let (width, x) = as_float(ctx, a)?;
        let (_, y) = as_float(ctx, b)?;
        let result = match op {
            ArithmeticOp::FAdd => x + y,
            ArithmeticOp::FSub => x - y,
            ArithmeticOp::FMul => x * y,
            ArithmeticOp::FDiv => x / y,
            _ => unreachable!(),
        };
        let c = if width == 32 {
            ctx.f32_const(result as f32)
        } else {
            ctx.f64_const(result)
        };
        return Some(Value::Const(c));
    }

    let (width, xb) = as_int(ctx, a)?;
    let (_, yb) = as_int(ctx, b)?;
    let xs = BigNum::from(sign_extend(xb, width));
    let ys = BigNum::from(sign_extend(yb, width));
    let xu = BigNum::from(xb);
    let yu = BigNum::from(yb);
    let result: BigNum = match op {
        ArithmeticOp::Add => xu + yu,
        ArithmeticOp::Sub => xu - yu,
        ArithmeticOp::Mul => xu * yu,
        // Division by zero is not folded; it stays for the runtime to trap
        ArithmeticOp::SDiv => {
            if ys.is_zero() {
                return None;
            }
            let (q, _) = div_trunc(&xs, &ys);
            q
        }
        ArithmeticOp::UDiv => {
            if yu.is_zero() {
                return None;
            }
            let (q, _) = div_trunc(&xu, &yu);
            q
        }
        ArithmeticOp::SRem => {
            if ys.is_zero() {
                return None;
            }
            let (_, r) = div_trunc(&xs, &ys);
            r
        }
        ArithmeticOp::URem => {
            if yu.is_zero() {
                return None;
            }
            let (_, r) = div_trunc(&xu, &yu);
            r
        }
        ArithmeticOp::LShL | ArithmeticOp::AShL => {
            let shift = (yb % 64) as u32;
            BigNum::from(if shift >= width { 0 } else { xb << shift })
        }
        ArithmeticOp::LShR => {
            let shift = (yb % 64) as u32;
            BigNum::from(if shift >= width { 0 } else { xb >> shift })
        }
        ArithmeticOp::AShR => {
            let shift = ((yb % 64) as u32).min(width - 1);
            BigNum::from((sign_extend(xb, width) >> shift) as u64)
        }
        ArithmeticOp::And => BigNum::from(xb & yb),
        ArithmeticOp::Or => BigNum::from(xb | yb),
        ArithmeticOp::XOr => BigNum::from(xb ^ yb),
        _ => unreachable!(),
    };
    // `int_const` truncates the 64-bit result to the operation width
    let c = ctx.int_const(result.truncated_bits(8), width);
    Some(Value::Const(c))
}

/// Quotient and remainder truncated toward zero
fn div_trunc(a: &BigNum, b: &BigNum) -> (BigNum, BigNum) {
    let q = a / b;
    let q_trunc = BigNum::from(q.to_i64().unwrap_or_else(|| {
        // Quotients of 64-bit inputs always fit; keep the bits on overflow
        q.truncated_bits(8) as i64
    }));
    let r = a.clone() - q_trunc.clone() * b.clone();
    (q_trunc, r)
}

fn fold_unary(
    ctx: &mut Context,
    _function: &Function,
    op: UnaryOp,
    operand: Value,
) -> Option<Value> {
    let (width, bits) = as_int(ctx, operand)?;
    let result = match op {
        UnaryOp::BitwiseNot => !bits,
        UnaryOp::LogicalNot => u64::from(bits == 0),
        UnaryOp::Negate => bits.wrapping_neg(),
    };
    Some(Value::Const(ctx.int_const(result, width)))
}

fn fold_compare(
    ctx: &mut Context,
    _function: &Function,
    mode: CompareMode,
    op: CompareOp,
    a: Value,
    b: Value,
) -> Option<Value> {
    let (less, equal) = match mode {
        CompareMode::Float => {
            let (_, x) = as_float(ctx, a)?;
            let (_, y) = as_float(ctx, b)?;
            if x.is_nan() || y.is_nan() {
                // Unordered comparisons only satisfy !=
                let result = op == CompareOp::NotEqual;
                return Some(Value::Const(ctx.bool_const(result)));
            }
            (x < y, x == y)
        }
        CompareMode::Signed => {
            let (width, xb) = as_int(ctx, a)?;
            let (_, yb) = as_int(ctx, b)?;
            let (x, y) = (sign_extend(xb, width), sign_extend(yb, width));
            (x < y, x == y)
        }
        CompareMode::Unsigned => {
            let (_, x) = as_int(ctx, a)?;
            let (_, y) = as_int(ctx, b)?;
            (x < y, x == y)
        }
    };
    let result = match op {
        CompareOp::Less => less,
        CompareOp::LessEq => less || equal,
        CompareOp::Greater => !less && !equal,
        CompareOp::GreaterEq => !less,
        CompareOp::Equal => equal,
        CompareOp::NotEqual => !equal,
    };
    Some(Value::Const(ctx.bool_const(result)))
}

fn fold_conversion(
    ctx: &mut Context,
    _function: &Function,
    conv: Conversion,
    operand: Value,
    target: crate::ir::TypeId,
) -> Option<Value> {
    let target_data = ctx.type_data(target).clone();
    match conv {
        Conversion::Zext | Conversion::Trunc => {
            let (_, bits) = as_int(ctx, operand)?;
            let TypeData::Int { width } = target_data else {
                return None;
            };
            Some(Value::Const(ctx.int_const(bits, width)))
        }
        Conversion::Sext => {
            let (width, bits) = as_int(ctx, operand)?;
            let TypeData::Int { width: to } = target_data else {
                return None;
            };
            Some(Value::Const(
                ctx.int_const(sign_extend(bits, width) as u64, to),
            ))
        }
        Conversion::Fext | Conversion::Ftrunc => {
            let (_, value) = as_float(ctx, operand)?;
            let TypeData::Float { width } = target_data else {
                return None;
            };
            let c = if width == 32 {
                ctx.f32_const(value as f32)
            } else {
                ctx.f64_const(value)
            };
            Some(Value::Const(c))
        }
        Conversion::StoF => {
            let (width, bits) = as_int(ctx, operand)?;
            let TypeData::Float { width: to } = target_data else {
                return None;
            };
            let value = sign_extend(bits, width) as f64;
            let c = if to == 32 {
                ctx.f32_const(value as f32)
            } else {
                ctx.f64_const(value)
            };
            Some(Value::Const(c))
        }
        Conversion::UtoF => {
            let (_, bits) = as_int(ctx, operand)?;
            let TypeData::Float { width: to } = target_data else {
                return None;
            };
            let c = if to == 32 {
                ctx.f32_const(bits as f32)
            } else {
                ctx.f64_const(bits as f64)
            };
            Some(Value::Const(c))
        }
        Conversion::FtoS | Conversion::FtoU => {
            let (_, value) = as_float(ctx, operand)?;
            let TypeData::Int { width } = target_data else {
                return None;
            };
            if !value.is_finite() {
                return None;
            }
            let bits = if conv == Conversion::FtoS {
                (value as i64) as u64
            } else {
                value as u64
            };
            Some(Value::Const(ctx.int_const(bits, width)))
        }
        Conversion::Bitcast => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{TypeId, Visibility};

    fn fold_binary(op: ArithmeticOp, width: u32, a: u64, b: u64) -> u64 {
        let mut ctx = Context::new();
        let mut f = Function::new("f", vec![], ctx.int_ty(width), Visibility::Internal);
        let entry = f.add_block("entry");
        let ca = ctx.int_const(a, width);
        let cb = ctx.int_const(b, width);
        let inst = f.new_inst(
            InstKind::Arithmetic(op),
            ctx.int_ty(width),
            "x",
            vec![Value::Const(ca), Value::Const(cb)],
        );
        f.append_inst(entry, inst);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(inst)]);
        f.append_inst(entry, ret);

        assert!(constfold(&mut ctx, &mut f, &PassArgs::default()));
        let Value::Const(c) = f.inst(ret).operands()[0] else {
            panic!("expected folded constant")
        };
        match ctx.const_data(c) {
            ConstData::Int { bits, .. } => *bits,
            other => panic!("unexpected constant {other:?}"),
        }
    }

    #[test]
    fn folds_add_with_wrapping() {
        assert_eq!(fold_binary(ArithmeticOp::Add, 64, 10, 20), 30);
        assert_eq!(fold_binary(ArithmeticOp::Add, 8, 0xFF, 1), 0);
    }

    #[test]
    fn folds_signed_division_toward_zero() {
        assert_eq!(
            fold_binary(ArithmeticOp::SDiv, 64, (-7i64) as u64, 2) as i64,
            -3
        );
        assert_eq!(
            fold_binary(ArithmeticOp::SRem, 64, 100, (-3i64) as u64) as i64,
            1
        );
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut ctx = Context::new();
        let mut f = Function::new("f", vec![], ctx.int_ty(64), Visibility::Internal);
        let entry = f.add_block("entry");
        let ca = ctx.int_const(1, 64);
        let cb = ctx.int_const(0, 64);
        let inst = f.new_inst(
            InstKind::Arithmetic(ArithmeticOp::SDiv),
            ctx.int_ty(64),
            "x",
            vec![Value::Const(ca), Value::Const(cb)],
        );
        f.append_inst(entry, inst);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(inst)]);
        f.append_inst(entry, ret);
        assert!(!constfold(&mut ctx, &mut f, &PassArgs::default()));
    }

    #[test]
    fn folds_signed_compare() {
        let mut ctx = Context::new();
        let mut f = Function::new("f", vec![], ctx.bool_ty(), Visibility::Internal);
        let entry = f.add_block("entry");
        let ca = ctx.int_const((-5i64) as u64, 64);
        let cb = ctx.int_const(3, 64);
        let inst = f.new_inst(
            InstKind::Compare {
                mode: CompareMode::Signed,
                op: CompareOp::Less,
            },
            ctx.bool_ty(),
            "c",
            vec![Value::Const(ca), Value::Const(cb)],
        );
        f.append_inst(entry, inst);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(inst)]);
        f.append_inst(entry, ret);

        assert!(constfold(&mut ctx, &mut f, &PassArgs::default()));
        let expected = ctx.bool_const(true);
        assert_eq!(f.inst(ret).operands()[0], Value::Const(expected));
    }
}
