//! Formula evaluation.

use std::cmp::Ordering;

use super::{BinaryOp, Bindings, FormulaError, FormulaExpr, FormulaResult, Func, UnaryOp};
use crate::model::Value;

pub(super) fn evaluate(expr: &FormulaExpr, bindings: &dyn Bindings) -> FormulaResult<Value> {
    match expr {
        FormulaExpr::Ident(name) => bindings
            .lookup(name)
            .cloned()
            .ok_or_else(|| FormulaError::UnknownIdentifier(name.clone())),

        FormulaExpr::Literal(value) => Ok(value.clone()),

        FormulaExpr::Unary { op, expr } => unary(*op, evaluate(expr, bindings)?),

        FormulaExpr::Binary { left, op, right } => {
            let left = evaluate(left, bindings)?;
            // Short-circuit only where the result is already decided.
            match (op, &left) {
                (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            binary(*op, left, evaluate(right, bindings)?)
        }

        FormulaExpr::IsNull { expr, negated } => {
            let is_null = evaluate(expr, bindings)?.is_null();
            Ok(Value::Bool(is_null != *negated))
        }

        FormulaExpr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = evaluate(expr, bindings)?;
            let above = binary(BinaryOp::Gte, value.clone(), evaluate(low, bindings)?)?;
            let below = binary(BinaryOp::Lte, value, evaluate(high, bindings)?)?;
            let within = binary(BinaryOp::And, above, below)?;
            if *negated {
                unary(UnaryOp::Not, within)
            } else {
                Ok(within)
            }
        }

        FormulaExpr::InList {
            expr,
            list,
            negated,
        } => {
            let value = evaluate(expr, bindings)?;
            if value.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            let mut found = false;
            for item in list {
                match binary(BinaryOp::Eq, value.clone(), evaluate(item, bindings)?)? {
                    Value::Bool(true) => {
                        found = true;
                        break;
                    }
                    Value::Null => saw_null = true,
                    _ => {}
                }
            }
            let result = if found {
                Value::Bool(true)
            } else if saw_null {
                Value::Null
            } else {
                Value::Bool(false)
            };
            if *negated {
                unary(UnaryOp::Not, result)
            } else {
                Ok(result)
            }
        }

        FormulaExpr::Case {
            operand,
            branches,
            else_result,
        } => {
            let operand = operand
                .as_ref()
                .map(|e| evaluate(e, bindings))
                .transpose()?;

            for (condition, result) in branches {
                let candidate = evaluate(condition, bindings)?;
                let matched = match &operand {
                    Some(op) => binary(BinaryOp::Eq, op.clone(), candidate)?,
                    None => candidate,
                };
                if matched == Value::Bool(true) {
                    return evaluate(result, bindings);
                }
            }

            match else_result {
                Some(e) => evaluate(e, bindings),
                None => Ok(Value::Null),
            }
        }

        FormulaExpr::Function { func, args } => {
            let args = args
                .iter()
                .map(|a| evaluate(a, bindings))
                .collect::<FormulaResult<Vec<_>>>()?;
            call(*func, args)
        }
    }
}

fn unary(op: UnaryOp, value: Value) -> FormulaResult<Value> {
    match (op, value) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Neg, Value::Int(i)) => Ok(i
            .checked_neg()
            .map(Value::Int)
            .unwrap_or(Value::Float(-(i as f64)))),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, other) => Err(FormulaError::TypeMismatch {
            op: "-",
            left: "number",
            right: other.type_name(),
        }),
        (UnaryOp::Not, other) => Err(FormulaError::TypeMismatch {
            op: "NOT",
            left: "bool",
            right: other.type_name(),
        }),
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> FormulaError {
    FormulaError::TypeMismatch {
        op: op.symbol(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> FormulaResult<Value> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }
        BinaryOp::Eq
        | BinaryOp::Ne
        | BinaryOp::Lt
        | BinaryOp::Lte
        | BinaryOp::Gt
        | BinaryOp::Gte => comparison(op, left, right),
        BinaryOp::And | BinaryOp::Or => logical(op, left, right),
        BinaryOp::Concat => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            match (to_text(&left), to_text(&right)) {
                (Some(l), Some(r)) => Ok(Value::Text(l + &r)),
                _ => Err(mismatch(op, &left, &right)),
            }
        }
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value) -> FormulaResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    if let (Value::Int(l), Value::Int(r)) = (&left, &right) {
        let (l, r) = (*l, *r);
        let checked = match op {
            BinaryOp::Add => l.checked_add(r),
            BinaryOp::Sub => l.checked_sub(r),
            BinaryOp::Mul => l.checked_mul(r),
            BinaryOp::Mod if r == 0 => return Ok(Value::Null),
            BinaryOp::Mod => l.checked_rem(r),
            // Integer division is not truncating: 50 / 200 = 0.25
            BinaryOp::Div if r == 0 => return Ok(Value::Null),
            BinaryOp::Div => return Ok(Value::Float(l as f64 / r as f64)),
            _ => unreachable!("non-arithmetic operator"),
        };
        if let Some(v) = checked {
            return Ok(Value::Int(v));
        }
        // Overflow falls through to floating point.
    }

    let (l, r) = match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => (l, r),
        _ => return Err(mismatch(op, &left, &right)),
    };

    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div | BinaryOp::Mod if r == 0.0 => return Ok(Value::Null),
        BinaryOp::Div => l / r,
        BinaryOp::Mod => l % r,
        _ => unreachable!("non-arithmetic operator"),
    };

    if result.is_finite() {
        Ok(Value::Float(result))
    } else {
        Ok(Value::Null)
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => Some(l.cmp(r)),
        (Value::Text(l), Value::Text(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
    }
}

fn comparison(op: BinaryOp, left: Value, right: Value) -> FormulaResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let ordering = compare(&left, &right).ok_or_else(|| mismatch(op, &left, &right))?;
    let result = match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::Ne => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Lte => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Gte => ordering != Ordering::Less,
        _ => unreachable!("non-comparison operator"),
    };
    Ok(Value::Bool(result))
}

fn logical(op: BinaryOp, left: Value, right: Value) -> FormulaResult<Value> {
    let as_tristate = |v: &Value| match v {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        _ => Err(mismatch(op, &left, &right)),
    };
    let (l, r) = (as_tristate(&left)?, as_tristate(&right)?);
    let result = match op {
        BinaryOp::And => match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        BinaryOp::Or => match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        _ => unreachable!("non-logical operator"),
    };
    Ok(result.map(Value::Bool).unwrap_or(Value::Null))
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

fn numeric_arg(func: Func, value: &Value) -> FormulaResult<f64> {
    value.as_f64().ok_or(FormulaError::InvalidArgument {
        func: func.name(),
        expected: "number",
        got: value.type_name(),
    })
}

fn call(func: Func, mut args: Vec<Value>) -> FormulaResult<Value> {
    match func {
        Func::Coalesce => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),

        Func::NullIf => {
            let right = args.pop().unwrap_or_default();
            let left = args.pop().unwrap_or_default();
            match comparison(BinaryOp::Eq, left.clone(), right)? {
                Value::Bool(true) => Ok(Value::Null),
                _ => Ok(left),
            }
        }

        Func::If => {
            let otherwise = args.pop().unwrap_or_default();
            let then = args.pop().unwrap_or_default();
            match args.pop().unwrap_or_default() {
                Value::Bool(true) => Ok(then),
                Value::Bool(false) | Value::Null => Ok(otherwise),
                other => Err(FormulaError::InvalidArgument {
                    func: func.name(),
                    expected: "bool",
                    got: other.type_name(),
                }),
            }
        }

        Func::Abs | Func::Floor | Func::Ceil => {
            let value = args.pop().unwrap_or_default();
            match value {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(match func {
                    Func::Abs => i.checked_abs().map(Value::Int).unwrap_or(Value::Null),
                    _ => Value::Int(i),
                }),
                other => {
                    let f = numeric_arg(func, &other)?;
                    Ok(Value::Float(match func {
                        Func::Abs => f.abs(),
                        Func::Floor => f.floor(),
                        _ => f.ceil(),
                    }))
                }
            }
        }

        Func::Round => {
            let digits = if args.len() == 2 {
                match args.pop().unwrap_or_default() {
                    Value::Null => return Ok(Value::Null),
                    Value::Int(d) => d,
                    other => {
                        return Err(FormulaError::InvalidArgument {
                            func: func.name(),
                            expected: "int",
                            got: other.type_name(),
                        })
                    }
                }
            } else {
                0
            };
            match args.pop().unwrap_or_default() {
                Value::Null => Ok(Value::Null),
                Value::Int(i) if digits >= 0 => Ok(Value::Int(i)),
                other => {
                    let f = numeric_arg(func, &other)?;
                    let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
                    Ok(Value::Float((f * factor).round() / factor))
                }
            }
        }

        Func::Least | Func::Greatest => {
            let mut best: Option<Value> = None;
            for value in args.into_iter().filter(|v| !v.is_null()) {
                best = Some(match best {
                    None => value,
                    Some(current) => {
                        let ordering = compare(&value, &current).ok_or_else(|| {
                            FormulaError::TypeMismatch {
                                op: func.name(),
                                left: current.type_name(),
                                right: value.type_name(),
                            }
                        })?;
                        let replace = match func {
                            Func::Least => ordering == Ordering::Less,
                            _ => ordering == Ordering::Greater,
                        };
                        if replace {
                            value
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }

        Func::Upper | Func::Lower | Func::Length => match args.pop().unwrap_or_default() {
            Value::Null => Ok(Value::Null),
            Value::Text(s) => Ok(match func {
                Func::Upper => Value::Text(s.to_uppercase()),
                Func::Lower => Value::Text(s.to_lowercase()),
                _ => Value::Int(s.chars().count() as i64),
            }),
            other => Err(FormulaError::InvalidArgument {
                func: func.name(),
                expected: "text",
                got: other.type_name(),
            }),
        },

        // Nulls are skipped, as in most SQL dialects' CONCAT().
        Func::Concat => {
            let mut out = String::new();
            for value in args.iter().filter(|v| !v.is_null()) {
                let text = to_text(value).ok_or(FormulaError::InvalidArgument {
                    func: func.name(),
                    expected: "scalar",
                    got: value.type_name(),
                })?;
                out.push_str(&text);
            }
            Ok(Value::Text(out))
        }
    }
}
