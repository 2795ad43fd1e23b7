use osmosis_common::JsonValue;
use serde::{Deserialize, Serialize};

use super::JsonPathError;

/// A filter/subscript expression. Plain data rather than a compiled closure:
/// compiled paths travel inside ops, so the AST has to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathExpr {
    Literal(JsonValue),
    /// `@`, the value the expression is being evaluated against.
    SelfValue,
    Unary(UnaryOp, Box<PathExpr>),
    Binary(BinaryOp, Box<PathExpr>, Box<PathExpr>),
    If {
        cond: Box<PathExpr>,
        then: Box<PathExpr>,
        or_else: Box<PathExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    /// `a[b]`: index a list by number or a map by key.
    Subscript,
}

impl PathExpr {
    pub fn unary(op: UnaryOp, operand: PathExpr) -> Self {
        PathExpr::Unary(op, Box::new(operand))
    }

    pub fn binary(op: BinaryOp, lhs: PathExpr, rhs: PathExpr) -> Self {
        PathExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Evaluates against `current` (`@`). Errors are recoverable: the query
    /// engine records them as per-path failures and moves on.
    pub fn eval(&self, current: &JsonValue) -> Result<JsonValue, JsonPathError> {
        match self {
            PathExpr::Literal(value) => Ok(value.clone()),
            PathExpr::SelfValue => Ok(current.clone()),
            PathExpr::Unary(op, operand) => {
                let value = operand.eval(current)?;
                match op {
                    UnaryOp::Not => Ok(JsonValue::Bool(!value.is_truthy())),
                    UnaryOp::Neg => match value {
                        JsonValue::Number(n) => Ok(JsonValue::Number(-n)),
                        other => Err(JsonPathError::EvaluationError(format!(
                            "cannot negate a {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            PathExpr::Binary(BinaryOp::And, lhs, rhs) => {
                // Short-circuit, returning the decisive operand.
                let left = lhs.eval(current)?;
                if left.is_truthy() {
                    rhs.eval(current)
                } else {
                    Ok(left)
                }
            }
            PathExpr::Binary(BinaryOp::Or, lhs, rhs) => {
                let left = lhs.eval(current)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    rhs.eval(current)
                }
            }
            PathExpr::Binary(BinaryOp::Eq, lhs, rhs) => Ok(JsonValue::Bool(
                lhs.eval(current)? == rhs.eval(current)?,
            )),
            PathExpr::Binary(BinaryOp::Ne, lhs, rhs) => Ok(JsonValue::Bool(
                lhs.eval(current)? != rhs.eval(current)?,
            )),
            PathExpr::Binary(BinaryOp::Subscript, lhs, rhs) => {
                let target = lhs.eval(current)?;
                let key = rhs.eval(current)?;
                match (&target, &key) {
                    (JsonValue::List(items), JsonValue::Number(n)) => {
                        let index = as_index(*n, items.len())?;
                        items.get(index).cloned().ok_or_else(|| {
                            JsonPathError::EvaluationError(format!(
                                "index {} out of bounds (len {})",
                                n,
                                items.len()
                            ))
                        })
                    }
                    (JsonValue::Map(entries), JsonValue::String(k)) => {
                        entries.get(k).cloned().ok_or_else(|| {
                            JsonPathError::EvaluationError(format!("no such key {k:?}"))
                        })
                    }
                    _ => Err(JsonPathError::EvaluationError(format!(
                        "cannot subscript a {} with a {}",
                        target.type_name(),
                        key.type_name()
                    ))),
                }
            }
            PathExpr::Binary(op, lhs, rhs) => {
                let left = lhs.eval(current)?;
                let right = rhs.eval(current)?;
                let (JsonValue::Number(a), JsonValue::Number(b)) = (&left, &right) else {
                    return Err(JsonPathError::EvaluationError(format!(
                        "operator needs numbers, got {} and {}",
                        left.type_name(),
                        right.type_name()
                    )));
                };
                Ok(match op {
                    BinaryOp::Add => JsonValue::Number(a + b),
                    BinaryOp::Sub => JsonValue::Number(a - b),
                    BinaryOp::Mul => JsonValue::Number(a * b),
                    BinaryOp::Div => JsonValue::Number(a / b),
                    BinaryOp::Mod => JsonValue::Number(a % b),
                    BinaryOp::Lt => JsonValue::Bool(a < b),
                    BinaryOp::Le => JsonValue::Bool(a <= b),
                    BinaryOp::Gt => JsonValue::Bool(a > b),
                    BinaryOp::Ge => JsonValue::Bool(a >= b),
                    _ => unreachable!("handled above"),
                })
            }
            PathExpr::If {
                cond,
                then,
                or_else,
            } => {
                if cond.eval(current)?.is_truthy() {
                    then.eval(current)
                } else {
                    or_else.eval(current)
                }
            }
        }
    }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathExpr::Literal(v) => write!(f, "{v}"),
            PathExpr::SelfValue => f.write_str("@"),
            PathExpr::Unary(UnaryOp::Neg, operand) => write!(f, "-{operand}"),
            PathExpr::Unary(UnaryOp::Not, operand) => write!(f, "!{operand}"),
            PathExpr::Binary(BinaryOp::Subscript, lhs, rhs) => write!(f, "{lhs}[{rhs}]"),
            PathExpr::Binary(op, lhs, rhs) => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                    BinaryOp::Subscript => unreachable!("handled above"),
                };
                write!(f, "({lhs} {symbol} {rhs})")
            }
            PathExpr::If {
                cond,
                then,
                or_else,
            } => write!(f, "({cond} ? {then} : {or_else})"),
        }
    }
}

/// Converts an expression result into an array index, wrapping one negative
/// step by `len`.
pub fn as_index(n: f64, len: usize) -> Result<usize, JsonPathError> {
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(JsonPathError::EvaluationError(format!(
            "{n} is not a valid index"
        )));
    }
    let i = n as i64;
    let wrapped = if i < 0 { i + len as i64 } else { i };
    usize::try_from(wrapped)
        .map_err(|_| JsonPathError::EvaluationError(format!("{n} is not a valid index")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lit(v: serde_json::Value) -> PathExpr {
        PathExpr::Literal(v.into())
    }

    #[test]
    fn short_circuit_returns_operand() {
        let expr = PathExpr::binary(BinaryOp::Or, lit(json!(0)), lit(json!("fallback")));
        assert_eq!(expr.eval(&JsonValue::Null).unwrap(), "fallback".into());
        let expr = PathExpr::binary(BinaryOp::And, lit(json!(0)), lit(json!("unused")));
        assert_eq!(expr.eval(&JsonValue::Null).unwrap(), 0.0.into());
        let expr = PathExpr::binary(BinaryOp::And, lit(json!(1)), lit(json!(2)));
        assert_eq!(expr.eval(&JsonValue::Null).unwrap(), 2.0.into());
    }

    #[test]
    fn deep_equality() {
        let expr = PathExpr::binary(
            BinaryOp::Eq,
            lit(json!({"a": [1, 2]})),
            lit(json!({"a": [1, 2]})),
        );
        assert_eq!(expr.eval(&JsonValue::Null).unwrap(), true.into());
    }

    #[test]
    fn subscript_on_self() {
        let expr = PathExpr::binary(BinaryOp::Subscript, PathExpr::SelfValue, lit(json!("k")));
        let current: JsonValue = json!({"k": 5}).into();
        assert_eq!(expr.eval(&current).unwrap(), 5.0.into());
        assert!(expr.eval(&JsonValue::Null).is_err());
    }

    #[test]
    fn arithmetic_and_comparison() {
        let expr = PathExpr::binary(
            BinaryOp::Lt,
            PathExpr::binary(BinaryOp::Add, lit(json!(2)), lit(json!(3))),
            lit(json!(10)),
        );
        assert_eq!(expr.eval(&JsonValue::Null).unwrap(), true.into());
        let bad = PathExpr::binary(BinaryOp::Add, lit(json!("x")), lit(json!(1)));
        assert!(bad.eval(&JsonValue::Null).is_err());
    }

    #[test]
    fn ternary() {
        let expr = PathExpr::If {
            cond: Box::new(PathExpr::SelfValue),
            then: Box::new(lit(json!("yes"))),
            or_else: Box::new(lit(json!("no"))),
        };
        assert_eq!(expr.eval(&json!(1).into()).unwrap(), "yes".into());
        assert_eq!(expr.eval(&json!(0).into()).unwrap(), "no".into());
    }
}
