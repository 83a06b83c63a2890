#![forbid(unsafe_code)]

use std::collections::HashMap;

use oath_ast::{BinOp, Expr, ExprKind, UnaryOp};
use oath_core::{decimal_cmp, ConstValue};

pub type Env = HashMap<String, ConstValue>;

/// Evaluates a pure predicate expression over statically known bindings.
/// `None` means "not statically evaluable here": an unbound name, an effectful
/// or unsupported operation, or a cross-kind numeric comparison (those need an
/// explicit conversion and never evaluate implicitly).
pub fn eval(expr: &Expr, env: &Env) -> Option<ConstValue> {
    match &expr.kind {
        ExprKind::Ident(id) => env.get(&id.node).cloned(),
        ExprKind::Int(n) => Some(ConstValue::Int(*n)),
        ExprKind::Float(x) => Some(ConstValue::Float(*x)),
        ExprKind::Decimal { mantissa, scale } => Some(ConstValue::Decimal {
            mantissa: *mantissa,
            scale: *scale,
        }),
        ExprKind::Bool(b) => Some(ConstValue::Bool(*b)),
        ExprKind::Str(s) => Some(ConstValue::Str(s.clone())),
        ExprKind::Unary { op, expr } => {
            let v = eval(expr, env)?;
            match (op, v) {
                (UnaryOp::Neg, ConstValue::Int(n)) => Some(ConstValue::Int(n.checked_neg()?)),
                (UnaryOp::Neg, ConstValue::Float(x)) => Some(ConstValue::Float(-x)),
                (UnaryOp::Neg, ConstValue::Decimal { mantissa, scale }) => {
                    Some(ConstValue::Decimal {
                        mantissa: -mantissa,
                        scale,
                    })
                }
                (UnaryOp::Not, ConstValue::Bool(b)) => Some(ConstValue::Bool(!b)),
                _ => None,
            }
        }
        ExprKind::Binary { left, op, right } => eval_binary(left, *op, right, env),
        ExprKind::Call { callee, args } => {
            let path = oath_ast::callee_path(callee)?;
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, env)?);
            }
            eval_pure_builtin(&path, &values)
        }
        _ => None,
    }
}

fn eval_binary(left: &Expr, op: BinOp, right: &Expr, env: &Env) -> Option<ConstValue> {
    // Short-circuit forms first; the right side may be unevaluable and the
    // result still determined.
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = as_bool(eval(left, env)?)?;
        return match (op, l) {
            (BinOp::And, false) => Some(ConstValue::Bool(false)),
            (BinOp::Or, true) => Some(ConstValue::Bool(true)),
            _ => Some(ConstValue::Bool(as_bool(eval(right, env)?)?)),
        };
    }

    let l = eval(left, env)?;
    let r = eval(right, env)?;

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arith(op, l, r),
        BinOp::Eq => Some(ConstValue::Bool(const_eq(&l, &r)?)),
        BinOp::Ne => Some(ConstValue::Bool(!const_eq(&l, &r)?)),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let ord = const_cmp(&l, &r)?;
            let b = match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Le => ord.is_le(),
                BinOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Some(ConstValue::Bool(b))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn arith(op: BinOp, l: ConstValue, r: ConstValue) -> Option<ConstValue> {
    match (l, r) {
        (ConstValue::Int(a), ConstValue::Int(b)) => {
            let v = match op {
                BinOp::Add => a.checked_add(b)?,
                BinOp::Sub => a.checked_sub(b)?,
                BinOp::Mul => a.checked_mul(b)?,
                BinOp::Div => {
                    if b == 0 {
                        return None;
                    }
                    a.checked_div(b)?
                }
                BinOp::Rem => {
                    if b == 0 {
                        return None;
                    }
                    a.checked_rem(b)?
                }
                _ => return None,
            };
            Some(ConstValue::Int(v))
        }
        (ConstValue::Float(a), ConstValue::Float(b)) => {
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                _ => return None,
            };
            Some(ConstValue::Float(v))
        }
        (
            ConstValue::Decimal {
                mantissa: am,
                scale: as_,
            },
            ConstValue::Decimal {
                mantissa: bm,
                scale: bs,
            },
        ) => {
            match op {
                BinOp::Add | BinOp::Sub => {
                    let scale = as_.max(bs);
                    let a = am.checked_mul(10i128.checked_pow(scale - as_)?)?;
                    let b = bm.checked_mul(10i128.checked_pow(scale - bs)?)?;
                    let m = if op == BinOp::Add {
                        a.checked_add(b)?
                    } else {
                        a.checked_sub(b)?
                    };
                    Some(ConstValue::Decimal { mantissa: m, scale })
                }
                BinOp::Mul => Some(ConstValue::Decimal {
                    mantissa: am.checked_mul(bm)?,
                    scale: as_.checked_add(bs)?,
                }),
                // Exact division is not closed over scaled decimals.
                _ => None,
            }
        }
        _ => None,
    }
}

fn const_eq(l: &ConstValue, r: &ConstValue) -> Option<bool> {
    match (l, r) {
        (ConstValue::Int(a), ConstValue::Int(b)) => Some(a == b),
        (ConstValue::Float(a), ConstValue::Float(b)) => Some(a == b),
        (
            ConstValue::Decimal {
                mantissa: am,
                scale: as_,
            },
            ConstValue::Decimal {
                mantissa: bm,
                scale: bs,
            },
        ) => Some(decimal_cmp(*am, *as_, *bm, *bs).is_eq()),
        (ConstValue::Bool(a), ConstValue::Bool(b)) => Some(a == b),
        (ConstValue::Str(a), ConstValue::Str(b)) => Some(a == b),
        _ => None,
    }
}

fn const_cmp(l: &ConstValue, r: &ConstValue) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (ConstValue::Int(a), ConstValue::Int(b)) => Some(a.cmp(b)),
        (ConstValue::Float(a), ConstValue::Float(b)) => a.partial_cmp(b),
        (
            ConstValue::Decimal {
                mantissa: am,
                scale: as_,
            },
            ConstValue::Decimal {
                mantissa: bm,
                scale: bs,
            },
        ) => Some(decimal_cmp(*am, *as_, *bm, *bs)),
        (ConstValue::Str(a), ConstValue::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn as_bool(v: ConstValue) -> Option<bool> {
    match v {
        ConstValue::Bool(b) => Some(b),
        _ => None,
    }
}

fn eval_pure_builtin(name: &str, args: &[ConstValue]) -> Option<ConstValue> {
    match (name, args) {
        ("math.abs", [ConstValue::Int(n)]) => Some(ConstValue::Int(n.checked_abs()?)),
        ("math.min", [ConstValue::Int(a), ConstValue::Int(b)]) => {
            Some(ConstValue::Int(*a.min(b)))
        }
        ("math.max", [ConstValue::Int(a), ConstValue::Int(b)]) => {
            Some(ConstValue::Int(*a.max(b)))
        }
        ("str.len", [ConstValue::Str(s)]) => Some(ConstValue::Int(s.chars().count() as i64)),
        ("str.concat", [ConstValue::Str(a), ConstValue::Str(b)]) => {
            Some(ConstValue::Str(format!("{a}{b}")))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oath_ast::{span, Expr};

    fn binop(l: Expr, op: BinOp, r: Expr) -> Expr {
        Expr {
            span: span(0, 0),
            kind: ExprKind::Binary {
                left: Box::new(l),
                op,
                right: Box::new(r),
            },
        }
    }

    #[test]
    fn folds_comparisons() {
        let e = binop(Expr::int(span(0, 2), 10), BinOp::Gt, Expr::int(span(5, 1), 0));
        assert_eq!(eval(&e, &Env::new()), Some(ConstValue::Bool(true)));
    }

    #[test]
    fn division_by_zero_is_not_evaluable() {
        let e = binop(Expr::int(span(0, 2), 10), BinOp::Div, Expr::int(span(5, 1), 0));
        assert_eq!(eval(&e, &Env::new()), None);
    }

    #[test]
    fn short_circuit_ignores_unevaluable_side() {
        let unbound = Expr::ident(span(9, 1), "x");
        let e = binop(
            Expr {
                span: span(0, 5),
                kind: ExprKind::Bool(false),
            },
            BinOp::And,
            unbound,
        );
        assert_eq!(eval(&e, &Env::new()), Some(ConstValue::Bool(false)));
    }

    #[test]
    fn cross_kind_comparison_never_evaluates() {
        let e = binop(
            Expr::int(span(0, 1), 1),
            BinOp::Lt,
            Expr {
                span: span(4, 3),
                kind: ExprKind::Float(2.0),
            },
        );
        assert_eq!(eval(&e, &Env::new()), None);
    }

    #[test]
    fn environment_bindings_resolve() {
        let mut env = Env::new();
        env.insert("b".to_string(), ConstValue::Int(0));
        let e = binop(Expr::ident(span(0, 1), "b"), BinOp::Ne, Expr::int(span(5, 1), 0));
        assert_eq!(eval(&e, &env), Some(ConstValue::Bool(false)));
    }
}
