//! Local instruction combining (peephole)
//!
//! Algebraic identities that do not need any global analysis: `x + 0`,
//! `x * 1`, `x * 0`, `x - x`, `x ^ x`, double negation, strength reduction
//! of multiplication and division by powers of two into shifts.

use super::PassArgs;
use crate::ir::{
    ArithmeticOp, ConstData, Context, Function, InstId, InstKind, TypeData, UnaryOp, Value,
};

/// Apply peephole simplifications until none fire
pub fn instcombine(ctx: &mut Context, function: &mut Function, _args: &PassArgs) -> bool {
    let mut any = false;
    loop {
        let mut changed = false;
        for block in function.block_ids() {
            for &inst in function.block(block).insts().to_vec().iter() {
                if !function.inst_alive(inst) {
                    continue;
                }
                if let Some(rewrite) = combine(ctx, function, inst) {
                    apply(ctx, function, inst, rewrite);
                    changed = true;
                }
            }
        }
        if !changed {
            return any;
        }
        any = true;
    }
}

enum Rewrite {
    /// Replace all uses with a value and erase
    Value(Value),
    /// Replace the instruction payload and operands in place
    Inst(InstKind, Vec<Value>),
}

fn apply(_ctx: &mut Context, function: &mut Function, inst: InstId, rewrite: Rewrite) {
    match rewrite {
        Rewrite::Value(v) => {
            function.replace_value(Value::Inst(inst), v);
            function.erase_inst(inst);
        }
        Rewrite::Inst(kind, operands) => {
            function.clear_operands(inst);
            *function.inst_kind_mut(inst) = kind;
            for op in operands {
                function.push_operand(inst, op);
            }
        }
    }
}

fn int_const_value(ctx: &Context, value: Value) -> Option<u64> {
    let Value::Const(c) = value else { return None };
    match ctx.const_data(c) {
        ConstData::Int { bits, .. } => Some(*bits),
        _ => None,
    }
}

fn combine(ctx: &mut Context, function: &Function, inst: InstId) -> Option<Rewrite> {
    let data = function.inst(inst);
    let width = match ctx.type_data(data.ty) {
        TypeData::Int { width } => *width,
        _ => return combine_non_int(function, inst),
    };
    let InstKind::Arithmetic(op) = &data.kind else {
        return combine_non_int(function, inst);
    };
    let op = *op;
    let (a, b) = (data.operands()[0], data.operands()[1]);
    let bc = int_const_value(ctx, b);

    match op {
        ArithmeticOp::Add | ArithmeticOp::Sub | ArithmeticOp::Or | ArithmeticOp::XOr
            if bc == Some(0) =>
        {
            return Some(Rewrite::Value(a));
        }
        ArithmeticOp::Sub | ArithmeticOp::XOr if a == b => {
            let zero = ctx.int_const(0, width);
            return Some(Rewrite::Value(Value::Const(zero)));
        }
        ArithmeticOp::Mul => match bc {
            Some(0) => {
                let zero = ctx.int_const(0, width);
                return Some(Rewrite::Value(Value::Const(zero)));
            }
            Some(1) => return Some(Rewrite::Value(a)),
            Some(n) if n.is_power_of_two() => {
                // Strength reduction: multiply by 2^k -> left shift
                let shift = ctx.int_const(u64::from(n.trailing_zeros()), width);
                return Some(Rewrite::Inst(
                    InstKind::Arithmetic(ArithmeticOp::LShL),
                    vec![a, Value::Const(shift)],
                ));
            }
            _ => {}
        },
        ArithmeticOp::UDiv => match bc {
            Some(1) => return Some(Rewrite::Value(a)),
            Some(n) if n.is_power_of_two() => {
                let shift = ctx.int_const(u64::from(n.trailing_zeros()), width);
                return Some(Rewrite::Inst(
                    InstKind::Arithmetic(ArithmeticOp::LShR),
                    vec![a, Value::Const(shift)],
                ));
            }
            _ => {}
        },
        ArithmeticOp::SDiv if bc == Some(1) => return Some(Rewrite::Value(a)),
        ArithmeticOp::And => {
            if a == b {
                return Some(Rewrite::Value(a));
            }
            if bc == Some(0) {
                let zero = ctx.int_const(0, width);
                return Some(Rewrite::Value(Value::Const(zero)));
            }
        }
        ArithmeticOp::Or if a == b => return Some(Rewrite::Value(a)),
        ArithmeticOp::LShL | ArithmeticOp::LShR | ArithmeticOp::AShL | ArithmeticOp::AShR
            if bc == Some(0) =>
        {
            return Some(Rewrite::Value(a));
        }
        _ => {}
    }

    // Commutative identities with the constant on the left
    if matches!(
        op,
        ArithmeticOp::Add | ArithmeticOp::Mul | ArithmeticOp::And | ArithmeticOp::Or
            | ArithmeticOp::XOr
    ) && int_const_value(ctx, a).is_some()
        && bc.is_none()
    {
        return Some(Rewrite::Inst(InstKind::Arithmetic(op), vec![b, a]));
    }
    None
}

fn combine_non_int(function: &Function, inst: InstId) -> Option<Rewrite> {
    let data = function.inst(inst);
    match &data.kind {
        // Double negation and double complement cancel
        InstKind::UnaryArithmetic(op) => {
            let Value::Inst(operand) = data.operands()[0] else {
                return None;
            };
            match &function.inst(operand).kind {
                InstKind::UnaryArithmetic(inner) if inner == op && *op != UnaryOp::LogicalNot => {
                    Some(Rewrite::Value(function.inst(operand).operands()[0]))
                }
                InstKind::UnaryArithmetic(inner)
                    if inner == op && *op == UnaryOp::LogicalNot =>
                {
                    // lnt(lnt(x)) == x only for i1 operands
                    Some(Rewrite::Value(function.inst(operand).operands()[0]))
                }
                _ => None,
            }
        }
        InstKind::Select => {
            let (t, e) = (data.operands()[1], data.operands()[2]);
            (t == e).then_some(Rewrite::Value(t))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{TypeId, Visibility};

    fn single_binary(op: ArithmeticOp, rhs: u64) -> (Context, Function, InstId, InstId) {
        let mut ctx = Context::new();
        let mut f = Function::new(
            "f",
            vec![("a".to_string(), ctx.int_ty(64))],
            ctx.int_ty(64),
            Visibility::Internal,
        );
        let entry = f.add_block("entry");
        let c = ctx.int_const(rhs, 64);
        let x = f.new_inst(
            InstKind::Arithmetic(op),
            ctx.int_ty(64),
            "x",
            vec![Value::Param(0), Value::Const(c)],
        );
        f.append_inst(entry, x);
        let ret = f.new_inst(InstKind::Return, TypeId::VOID, "", vec![Value::Inst(x)]);
        f.append_inst(entry, ret);
        (ctx, f, x, ret)
    }

    #[test]
    fn add_zero_is_identity() {
        let (mut ctx, mut f, _, ret) = single_binary(ArithmeticOp::Add, 0);
        assert!(instcombine(&mut ctx, &mut f, &PassArgs::default()));
        assert_eq!(f.inst(ret).operands()[0], Value::Param(0));
    }

    #[test]
    fn mul_by_power_of_two_becomes_shift() {
        let (mut ctx, mut f, x, _) = single_binary(ArithmeticOp::Mul, 8);
        assert!(instcombine(&mut ctx, &mut f, &PassArgs::default()));
        assert!(matches!(
            &f.inst(x).kind,
            InstKind::Arithmetic(ArithmeticOp::LShL)
        ));
        let shift = ctx.int_const(3, 64);
        assert_eq!(f.inst(x).operands()[1], Value::Const(shift));
    }

    #[test]
    fn mul_by_zero_is_zero() {
        let (mut ctx, mut f, _, ret) = single_binary(ArithmeticOp::Mul, 0);
        assert!(instcombine(&mut ctx, &mut f, &PassArgs::default()));
        let zero = ctx.int_const(0, 64);
        assert_eq!(f.inst(ret).operands()[0], Value::Const(zero));
    }
}
