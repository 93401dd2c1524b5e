//! The data-storage operation engine.
//!
//! A `Set` carries an ordered list of operations; each operation's result
//! becomes the next operation's original value. All JSON numbers are treated
//! as doubles, matching how they arrive off the wire.

use serde_json::{Number, Value};

use mwbridge_core::approto::DataStorageOperation;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DataStorageError {
    #[error("{op}: operands are not of the same type")]
    MismatchedTypes { op: &'static str },
    #[error("{op}: operands are not both numbers")]
    NotNumbers { op: &'static str },
    #[error("{op}: operand is not a number")]
    NotANumber { op: &'static str },
    #[error("{op}: operand is not comparable")]
    NotComparable { op: &'static str },
    #[error("{op}: operand is not a list")]
    NotAList { op: &'static str },
    #[error("{op}: operand is not a dictionary or list")]
    NotAContainer { op: &'static str },
    #[error("{op}: operands are not both dictionaries")]
    NotDictionaries { op: &'static str },
    #[error("unknown data storage op: {0:?}")]
    UnknownOperation(String),
    #[error("{op}: result is not a finite number")]
    NotFinite { op: &'static str },
}

/// Applies the operation list. `stored` is the currently stored value, if
/// any; an absent value starts from `default`. Returns the initial original
/// value and the final result.
pub fn apply(
    stored: Option<Value>,
    default: &Value,
    operations: &[DataStorageOperation],
) -> Result<(Value, Value), DataStorageError> {
    let original = stored.unwrap_or_else(|| default.clone());
    let mut current = original.clone();
    for op in operations {
        current = apply_op(current, &op.operation, &op.value)?;
    }
    Ok((original, current))
}

fn apply_op(current: Value, operation: &str, operand: &Value) -> Result<Value, DataStorageError> {
    match operation {
        "replace" => Ok(operand.clone()),
        "default" => Ok(current),
        "add" => match current {
            Value::Number(n) => {
                let a = n.as_f64().ok_or(DataStorageError::NotFinite { op: "add" })?;
                let b = operand
                    .as_f64()
                    .ok_or(DataStorageError::MismatchedTypes { op: "add" })?;
                number(a + b, "add")
            }
            Value::Array(mut list) => {
                let Value::Array(tail) = operand else {
                    return Err(DataStorageError::MismatchedTypes { op: "add" });
                };
                list.extend(tail.iter().cloned());
                Ok(Value::Array(list))
            }
            _ => Err(DataStorageError::MismatchedTypes { op: "add" }),
        },
        "mul" => math_op(current, operand, "mul", |a, b| a * b),
        "pow" => math_op(current, operand, "pow", f64::powf),
        "mod" => math_op(current, operand, "mod", |a, b| a % b),
        "max" => math_op(current, operand, "max", f64::max),
        "min" => math_op(current, operand, "min", f64::min),
        "floor" => unary_op(current, "floor", f64::floor),
        "ceil" => unary_op(current, "ceil", f64::ceil),
        "and" => int_op(current, operand, "and", |a, b| a & b),
        "or" => int_op(current, operand, "or", |a, b| a | b),
        "xor" => int_op(current, operand, "xor", |a, b| a ^ b),
        "left_shift" => int_op(current, operand, "left_shift", |a, b| {
            u32::try_from(b).ok().and_then(|s| a.checked_shl(s)).unwrap_or(0)
        }),
        "right_shift" => int_op(current, operand, "right_shift", |a, b| {
            u32::try_from(b).ok().and_then(|s| a.checked_shr(s)).unwrap_or(0)
        }),
        "remove" => {
            let Value::Array(mut list) = current else {
                return Err(DataStorageError::NotAList { op: "remove" });
            };
            if !matches!(operand, Value::Number(_) | Value::String(_)) {
                return Err(DataStorageError::NotComparable { op: "remove" });
            }
            if let Some(i) = list.iter().position(|v| values_equal(v, operand)) {
                list.remove(i);
            }
            Ok(Value::Array(list))
        }
        "pop" => match current {
            Value::Array(mut list) => {
                let Some(index) = operand.as_f64() else {
                    return Err(DataStorageError::NotANumber { op: "pop" });
                };
                let i = index as i64;
                if i >= 0 && (i as usize) < list.len() {
                    list.remove(i as usize);
                }
                Ok(Value::Array(list))
            }
            Value::Object(mut map) => {
                let Value::String(key) = operand else {
                    return Err(DataStorageError::NotComparable { op: "pop" });
                };
                map.remove(key);
                Ok(Value::Object(map))
            }
            _ => Err(DataStorageError::NotAContainer { op: "pop" }),
        },
        "update" => {
            let Value::Object(mut map) = current else {
                return Err(DataStorageError::NotDictionaries { op: "update" });
            };
            let Value::Object(additions) = operand else {
                return Err(DataStorageError::NotDictionaries { op: "update" });
            };
            for (k, v) in additions {
                map.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(map))
        }
        other => Err(DataStorageError::UnknownOperation(other.to_string())),
    }
}

fn math_op(
    current: Value,
    operand: &Value,
    op: &'static str,
    f: fn(f64, f64) -> f64,
) -> Result<Value, DataStorageError> {
    let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
        return Err(DataStorageError::NotNumbers { op });
    };
    number(f(a, b), op)
}

fn unary_op(
    current: Value,
    op: &'static str,
    f: fn(f64) -> f64,
) -> Result<Value, DataStorageError> {
    let Some(a) = current.as_f64() else {
        return Err(DataStorageError::NotANumber { op });
    };
    number(f(a), op)
}

// Numbers pass through int64 for the bitwise family.
fn int_op(
    current: Value,
    operand: &Value,
    op: &'static str,
    f: fn(i64, i64) -> i64,
) -> Result<Value, DataStorageError> {
    let (Some(a), Some(b)) = (current.as_f64(), operand.as_f64()) else {
        return Err(DataStorageError::NotNumbers { op });
    };
    number(f(a as i64, b as i64) as f64, op)
}

fn number(x: f64, op: &'static str) -> Result<Value, DataStorageError> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or(DataStorageError::NotFinite { op })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
