//! Runtime values and the arithmetic defined on them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::ast::{BinOp, CmpOp, FunctionDef};
use super::EvalError;

/// Signature of a host function exposed to reward code.
pub type NativeFn = fn(&[Value], &[(String, Value)]) -> Result<Value, EvalError>;

/// A named host function.
#[derive(Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// An importable namespace such as `numpy` or `math`.
#[derive(Debug)]
pub struct ModuleValue {
    pub name: String,
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Number(f64),
    Str(String),
    /// One-dimensional numeric array.
    Array(Vec<f64>),
    /// Python list or tuple.
    List(Vec<Value>),
    Module(Arc<ModuleValue>),
    Native(Native),
    Function(Arc<FunctionDef>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Number(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "ndarray",
            Value::List(_) => "list",
            Value::Module(_) => "module",
            Value::Native(_) => "builtin_function",
            Value::Function(_) => "function",
        }
    }

    /// Python truthiness. Arrays with more than one element are ambiguous.
    pub fn truthy(&self) -> Result<bool, EvalError> {
        Ok(match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Array(values) => match values.as_slice() {
                [] => false,
                [single] => *single != 0.0,
                _ => {
                    return Err(EvalError::Value(
                        "the truth value of an array with more than one element is ambiguous"
                            .to_string(),
                    ))
                }
            },
            Value::Module(_) | Value::Native(_) | Value::Function(_) => true,
        })
    }

    /// Numeric view of a scalar (numbers, booleans and one-element arrays).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Array(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    /// Numeric view of a sequence; scalars become one-element vectors.
    pub fn to_vector(&self) -> Option<Vec<f64>> {
        match self {
            Value::Array(values) => Some(values.clone()),
            Value::List(items) => items.iter().map(Value::as_f64).collect(),
            Value::Number(_) | Value::Bool(_) => self.as_f64().map(|x| vec![x]),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Result<i64, EvalError> {
        match self.as_f64() {
            Some(x) if x.fract() == 0.0 && !matches!(self, Value::Array(_)) => Ok(x as i64),
            _ => Err(EvalError::Type(format!(
                "indices must be integers, not {}",
                self.type_name()
            ))),
        }
    }

    /// Depth of nested lists: 0 for scalars and arrays.
    pub fn nesting(&self) -> usize {
        match self {
            Value::List(items) => 1 + items.iter().map(Value::nesting).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Items produced when iterating over this value.
    pub fn iter_values(&self) -> Result<Vec<Value>, EvalError> {
        match self {
            Value::Array(values) => Ok(values.iter().map(|x| Value::Number(*x)).collect()),
            Value::List(items) => Ok(items.clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(EvalError::Type(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    pub fn len(&self) -> Result<usize, EvalError> {
        match self {
            Value::Array(values) => Ok(values.len()),
            Value::List(items) => Ok(items.len()),
            Value::Str(s) => Ok(s.chars().count()),
            other => Err(EvalError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Array(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "array([{}])", parts.join(", "))
            }
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Module(m) => write!(f, "<module '{}'>", m.name),
            Value::Native(n) => write!(f, "{:?}", n),
            Value::Function(def) => write!(f, "<function {}>", def.name),
        }
    }
}

/// Normalizes a possibly negative index against `len`.
pub fn resolve_index(index: i64, len: usize) -> Result<usize, EvalError> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::Index { index, len });
    }
    Ok(resolved as usize)
}

/// Indices selected by a Python slice over a sequence of length `len`.
pub fn slice_indices(
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Result<Vec<usize>, EvalError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(EvalError::Value("slice step cannot be zero".to_string()));
    }
    let len = len as i64;
    let clamp = |value: i64, low: i64, high: i64| value.max(low).min(high);
    let normalize = |value: i64| if value < 0 { value + len } else { value };

    let mut out = Vec::new();
    if step > 0 {
        let start = clamp(lower.map(normalize).unwrap_or(0), 0, len);
        let stop = clamp(upper.map(normalize).unwrap_or(len), 0, len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = clamp(lower.map(normalize).unwrap_or(len - 1), -1, len - 1);
        let stop = clamp(upper.map(normalize).unwrap_or(-1), -1, len - 1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

enum Operand {
    Scalar(f64),
    Vector(Vec<f64>),
}

fn operand(value: &Value) -> Option<Operand> {
    match value {
        Value::Number(_) | Value::Bool(_) => value.as_f64().map(Operand::Scalar),
        Value::Array(values) => Some(Operand::Vector(values.clone())),
        _ => None,
    }
}

/// Applies `f` elementwise with numpy-style broadcasting of scalars and
/// one-element arrays.
pub fn broadcast(
    left: &Value,
    right: &Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let (Some(l), Some(r)) = (operand(left), operand(right)) else {
        return Err(EvalError::Type(format!(
            "unsupported operand types: '{}' and '{}'",
            left.type_name(),
            right.type_name()
        )));
    };
    Ok(match (l, r) {
        (Operand::Scalar(a), Operand::Scalar(b)) => Value::Number(f(a, b)),
        (Operand::Vector(a), Operand::Scalar(b)) => Value::Array(a.iter().map(|x| f(*x, b)).collect()),
        (Operand::Scalar(a), Operand::Vector(b)) => Value::Array(b.iter().map(|y| f(a, *y)).collect()),
        (Operand::Vector(a), Operand::Vector(b)) => {
            if a.len() == b.len() {
                Value::Array(a.iter().zip(&b).map(|(x, y)| f(*x, *y)).collect())
            } else if a.len() == 1 {
                Value::Array(b.iter().map(|y| f(a[0], *y)).collect())
            } else if b.len() == 1 {
                Value::Array(a.iter().map(|x| f(*x, b[0])).collect())
            } else {
                return Err(EvalError::Value(format!(
                    "operands could not be broadcast together with shapes ({},) ({},)",
                    a.len(),
                    b.len()
                )));
            }
        }
    })
}

fn python_mod(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

fn both_scalars(left: &Value, right: &Value) -> Option<(f64, f64)> {
    match (left, right) {
        (Value::Number(_) | Value::Bool(_), Value::Number(_) | Value::Bool(_)) => {
            Some((left.as_f64()?, right.as_f64()?))
        }
        _ => None,
    }
}

/// Evaluates a binary arithmetic operator.
pub fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    // Sequence concatenation keeps Python list/str semantics.
    if op == BinOp::Add {
        match (left, right) {
            (Value::List(a), Value::List(b)) => {
                return Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            (Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
            _ => {}
        }
    }

    // Scalars follow Python float rules, arrays follow numpy.
    if let Some((a, b)) = both_scalars(left, right) {
        match op {
            BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
                return Err(EvalError::ZeroDivision("float division by zero".to_string()))
            }
            BinOp::Pow if a == 0.0 && b < 0.0 => {
                return Err(EvalError::ZeroDivision(
                    "0.0 cannot be raised to a negative power".to_string(),
                ))
            }
            _ => {}
        }
    }

    let left = promote_list(left);
    let right = promote_list(right);
    match op {
        BinOp::Add => broadcast(&left, &right, |a, b| a + b),
        BinOp::Sub => broadcast(&left, &right, |a, b| a - b),
        BinOp::Mul => broadcast(&left, &right, |a, b| a * b),
        BinOp::Div => broadcast(&left, &right, |a, b| a / b),
        BinOp::FloorDiv => broadcast(&left, &right, |a, b| (a / b).floor()),
        BinOp::Mod => broadcast(&left, &right, python_mod),
        BinOp::Pow => broadcast(&left, &right, f64::powf),
        BinOp::MatMul => match (&left, &right) {
            (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
                Ok(Value::Number(a.iter().zip(b).map(|(x, y)| x * y).sum()))
            }
            _ => Err(EvalError::Value(format!(
                "matmul: unsupported operands '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

/// Numeric lists take part in arithmetic as arrays when mixed with arrays.
fn promote_list(value: &Value) -> Value {
    match value {
        Value::List(_) => value
            .to_vector()
            .map(Value::Array)
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

/// Structural equality used by `==`, `in` and `is`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Array(a), Value::Array(b)) => a == b,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn bool_value(values: Value) -> Value {
    match values {
        Value::Number(x) => Value::Bool(x != 0.0),
        other => other,
    }
}

/// Evaluates a single comparison operator.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let indicator = |cond: bool| if cond { 1.0 } else { 0.0 };
    let numeric = operand(left).is_some() && operand(right).is_some();

    match op {
        CmpOp::Eq | CmpOp::NotEq if numeric => {
            let negate = op == CmpOp::NotEq;
            broadcast(left, right, |a, b| indicator((a == b) != negate)).map(bool_value)
        }
        CmpOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        CmpOp::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            if numeric {
                let f = move |a: f64, b: f64| {
                    indicator(match op {
                        CmpOp::Lt => a < b,
                        CmpOp::LtE => a <= b,
                        CmpOp::Gt => a > b,
                        _ => a >= b,
                    })
                };
                return broadcast(left, right, f).map(bool_value);
            }
            match (left, right) {
                (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(match op {
                    CmpOp::Lt => a < b,
                    CmpOp::LtE => a <= b,
                    CmpOp::Gt => a > b,
                    _ => a >= b,
                })),
                _ => Err(EvalError::Type(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ))),
            }
        }
        CmpOp::In | CmpOp::NotIn => {
            let found = match right {
                Value::Str(haystack) => match left {
                    Value::Str(needle) => haystack.contains(needle.as_str()),
                    other => {
                        return Err(EvalError::Type(format!(
                            "'in <string>' requires string as left operand, not {}",
                            other.type_name()
                        )))
                    }
                },
                container => container
                    .iter_values()?
                    .iter()
                    .any(|item| values_equal(left, item)),
            };
            Ok(Value::Bool(found != (op == CmpOp::NotIn)))
        }
        CmpOp::Is | CmpOp::IsNot => {
            let same = match (left, right) {
                (Value::None, Value::None) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => false,
            };
            Ok(Value::Bool(same != (op == CmpOp::IsNot)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_division_by_zero() {
        let err = binary_op(BinOp::Div, &Value::Number(1.0), &Value::Number(0.0)).unwrap_err();
        assert!(matches!(err, EvalError::ZeroDivision(_)));
    }

    #[test]
    fn test_array_division_follows_ieee() {
        let result =
            binary_op(BinOp::Div, &Value::Array(vec![1.0, -1.0]), &Value::Number(0.0)).unwrap();
        match result {
            Value::Array(values) => {
                assert_eq!(values[0], f64::INFINITY);
                assert_eq!(values[1], f64::NEG_INFINITY);
            }
            other => panic!("expected array, got {}", other),
        }
    }

    #[test]
    fn test_python_modulo_sign() {
        let result = binary_op(BinOp::Mod, &Value::Number(-7.0), &Value::Number(3.0)).unwrap();
        assert_eq!(result.as_f64(), Some(2.0));
        let result = binary_op(BinOp::FloorDiv, &Value::Number(-7.0), &Value::Number(2.0)).unwrap();
        assert_eq!(result.as_f64(), Some(-4.0));
    }

    #[test]
    fn test_broadcast_shape_mismatch() {
        let err = binary_op(
            BinOp::Add,
            &Value::Array(vec![1.0, 2.0]),
            &Value::Array(vec![1.0, 2.0, 3.0]),
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::Value(_)));
    }

    #[test]
    fn test_list_concatenation() {
        let result = binary_op(
            BinOp::Add,
            &Value::List(vec![Value::Number(1.0)]),
            &Value::List(vec![Value::Number(2.0)]),
        )
        .unwrap();
        assert_eq!(result.len().unwrap(), 2);
    }

    #[test]
    fn test_array_truthiness() {
        assert!(Value::Array(vec![2.0]).truthy().unwrap());
        assert!(!Value::Array(vec![]).truthy().unwrap());
        assert!(Value::Array(vec![1.0, 2.0]).truthy().is_err());
    }

    #[test]
    fn test_comparisons() {
        let lt = compare(CmpOp::Lt, &Value::Number(1.0), &Value::Number(2.0)).unwrap();
        assert!(matches!(lt, Value::Bool(true)));

        let elementwise =
            compare(CmpOp::Gt, &Value::Array(vec![1.0, 3.0]), &Value::Number(2.0)).unwrap();
        assert_eq!(elementwise.to_vector(), Some(vec![0.0, 1.0]));

        let contains = compare(
            CmpOp::In,
            &Value::Number(3.0),
            &Value::Array(vec![1.0, 3.0]),
        )
        .unwrap();
        assert!(matches!(contains, Value::Bool(true)));

        let is_none = compare(CmpOp::IsNot, &Value::Number(0.0), &Value::None).unwrap();
        assert!(matches!(is_none, Value::Bool(true)));
    }

    #[test]
    fn test_slices() {
        assert_eq!(slice_indices(None, Some(2), None, 4).unwrap(), vec![0, 1]);
        assert_eq!(slice_indices(Some(-2), None, None, 4).unwrap(), vec![2, 3]);
        assert_eq!(slice_indices(None, None, Some(-1), 3).unwrap(), vec![2, 1, 0]);
        assert_eq!(slice_indices(None, None, Some(2), 5).unwrap(), vec![0, 2, 4]);
        assert!(slice_indices(None, None, Some(0), 5).is_err());
    }

    #[test]
    fn test_negative_index() {
        assert_eq!(resolve_index(-1, 4).unwrap(), 3);
        assert!(resolve_index(4, 4).is_err());
        assert!(resolve_index(-5, 4).is_err());
    }
}
