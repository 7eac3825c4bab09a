//! Evaluation of built-in binary operators on bound values.
//!
//! Shared by the VM and by constant folding of bound operands, so a folded
//! expression and its runtime evaluation cannot disagree.

use crate::bytecode::op::Operator;
use crate::lang::types::Kind;
use crate::lang::value::Value;
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};

fn not_defined(op: Operator, kind: Kind) -> RuntimeError {
    RuntimeError::new(
        RuntimeErrorKind::Type,
        format!("operator {} not defined on {}", op, kind),
    )
}

macro_rules! int_op {
    ($op:expr, $kind:expr, $a:expr, $b:expr, $variant:ident) => {{
        let (a, b) = ($a, $b);
        match $op {
            Operator::Add => Ok(Value::$variant(a.wrapping_add(b))),
            Operator::Sub => Ok(Value::$variant(a.wrapping_sub(b))),
            Operator::Mul => Ok(Value::$variant(a.wrapping_mul(b))),
            Operator::Quo if b == 0 => Err(RuntimeError::division_by_zero()),
            Operator::Quo => Ok(Value::$variant(a.wrapping_div(b))),
            Operator::Rem if b == 0 => Err(RuntimeError::division_by_zero()),
            Operator::Rem => Ok(Value::$variant(a.wrapping_rem(b))),
            Operator::And => Ok(Value::$variant(a & b)),
            Operator::Or => Ok(Value::$variant(a | b)),
            Operator::Xor => Ok(Value::$variant(a ^ b)),
            Operator::AndNot => Ok(Value::$variant(a & !b)),
            Operator::Lt => Ok(Value::Bool(a < b)),
            Operator::Le => Ok(Value::Bool(a <= b)),
            Operator::Gt => Ok(Value::Bool(a > b)),
            Operator::Ge => Ok(Value::Bool(a >= b)),
            Operator::Eq => Ok(Value::Bool(a == b)),
            Operator::Ne => Ok(Value::Bool(a != b)),
            op => Err(not_defined(op, $kind)),
        }
    }};
}

macro_rules! float_op {
    ($op:expr, $kind:expr, $a:expr, $b:expr, $variant:ident) => {{
        let (a, b) = ($a, $b);
        match $op {
            Operator::Add => Ok(Value::$variant(a + b)),
            Operator::Sub => Ok(Value::$variant(a - b)),
            Operator::Mul => Ok(Value::$variant(a * b)),
            Operator::Quo => Ok(Value::$variant(a / b)),
            Operator::Lt => Ok(Value::Bool(a < b)),
            Operator::Le => Ok(Value::Bool(a <= b)),
            Operator::Gt => Ok(Value::Bool(a > b)),
            Operator::Ge => Ok(Value::Bool(a >= b)),
            Operator::Eq => Ok(Value::Bool(a == b)),
            Operator::Ne => Ok(Value::Bool(a != b)),
            op => Err(not_defined(op, $kind)),
        }
    }};
}

macro_rules! complex_op {
    ($op:expr, $kind:expr, $a:expr, $b:expr, $variant:ident) => {{
        let (a, b) = ($a, $b);
        match $op {
            Operator::Add => Ok(Value::$variant(a + b)),
            Operator::Sub => Ok(Value::$variant(a - b)),
            Operator::Mul => Ok(Value::$variant(a * b)),
            Operator::Quo => Ok(Value::$variant(a / b)),
            Operator::Eq => Ok(Value::Bool(a == b)),
            Operator::Ne => Ok(Value::Bool(a != b)),
            op => Err(not_defined(op, $kind)),
        }
    }};
}

macro_rules! shift_op {
    ($op:expr, $a:expr, $count:expr, $variant:ident, $t:ty) => {{
        let a: $t = $a;
        let count: u64 = $count;
        let bits = <$t>::BITS as u64;
        let shifted = match $op {
            Operator::Shl if count >= bits => 0,
            Operator::Shl => a << count,
            // sign fill for signed kinds, zero for unsigned
            _ if count >= bits => (a >> (bits - 1)) >> 1,
            _ => a >> count,
        };
        Ok(Value::$variant(shifted))
    }};
}

/// Shift counts may be of any integer kind; negative counts are an error.
fn shift_count(count: &Value) -> Result<u64, RuntimeError> {
    if count.kind().is_unsigned() {
        return count
            .as_u64()
            .ok_or_else(|| RuntimeError::type_error("unsigned integer", count));
    }
    match count.as_i64() {
        Some(n) if n < 0 => Err(RuntimeError::new(
            RuntimeErrorKind::Type,
            format!("negative shift amount {}", n),
        )),
        Some(n) => Ok(n as u64),
        None => Err(RuntimeError::type_error("integer shift count", count)),
    }
}

fn shift(op: Operator, x: Value, count: &Value) -> Result<Value, RuntimeError> {
    let n = shift_count(count)?;
    match x {
        Value::Int(a) => shift_op!(op, a, n, Int, i64),
        Value::Int8(a) => shift_op!(op, a, n, Int8, i8),
        Value::Int16(a) => shift_op!(op, a, n, Int16, i16),
        Value::Int32(a) => shift_op!(op, a, n, Int32, i32),
        Value::Int64(a) => shift_op!(op, a, n, Int64, i64),
        Value::Uint(a) => shift_op!(op, a, n, Uint, u64),
        Value::Uint8(a) => shift_op!(op, a, n, Uint8, u8),
        Value::Uint16(a) => shift_op!(op, a, n, Uint16, u16),
        Value::Uint32(a) => shift_op!(op, a, n, Uint32, u32),
        Value::Uint64(a) => shift_op!(op, a, n, Uint64, u64),
        other => Err(not_defined(op, other.kind())),
    }
}

/// Apply `op` to two operands of `kind` (for shifts, `kind` is the left
/// operand's and the count may be any integer).
pub fn eval(op: Operator, kind: Kind, x: Value, y: Value) -> Result<Value, RuntimeError> {
    if x.kind() != kind {
        return Err(RuntimeError::type_error(kind, &x));
    }
    if op.is_shift() {
        return shift(op, x, &y);
    }
    if y.kind() != kind {
        return Err(RuntimeError::type_error(kind, &y));
    }
    match (x, y) {
        (Value::Int(a), Value::Int(b)) => int_op!(op, kind, a, b, Int),
        (Value::Int8(a), Value::Int8(b)) => int_op!(op, kind, a, b, Int8),
        (Value::Int16(a), Value::Int16(b)) => int_op!(op, kind, a, b, Int16),
        (Value::Int32(a), Value::Int32(b)) => int_op!(op, kind, a, b, Int32),
        (Value::Int64(a), Value::Int64(b)) => int_op!(op, kind, a, b, Int64),
        (Value::Uint(a), Value::Uint(b)) => int_op!(op, kind, a, b, Uint),
        (Value::Uint8(a), Value::Uint8(b)) => int_op!(op, kind, a, b, Uint8),
        (Value::Uint16(a), Value::Uint16(b)) => int_op!(op, kind, a, b, Uint16),
        (Value::Uint32(a), Value::Uint32(b)) => int_op!(op, kind, a, b, Uint32),
        (Value::Uint64(a), Value::Uint64(b)) => int_op!(op, kind, a, b, Uint64),
        (Value::Float32(a), Value::Float32(b)) => float_op!(op, kind, a, b, Float32),
        (Value::Float64(a), Value::Float64(b)) => float_op!(op, kind, a, b, Float64),
        (Value::Complex64(a), Value::Complex64(b)) => complex_op!(op, kind, a, b, Complex64),
        (Value::Complex128(a), Value::Complex128(b)) => complex_op!(op, kind, a, b, Complex128),
        (Value::String(a), Value::String(b)) => match op {
            Operator::Add => Ok(Value::String(a + &b)),
            Operator::Lt => Ok(Value::Bool(a < b)),
            Operator::Le => Ok(Value::Bool(a <= b)),
            Operator::Gt => Ok(Value::Bool(a > b)),
            Operator::Ge => Ok(Value::Bool(a >= b)),
            Operator::Eq => Ok(Value::Bool(a == b)),
            Operator::Ne => Ok(Value::Bool(a != b)),
            op => Err(not_defined(op, kind)),
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            Operator::Eq => Ok(Value::Bool(a == b)),
            Operator::Ne => Ok(Value::Bool(a != b)),
            Operator::LAnd => Ok(Value::Bool(a && b)),
            Operator::LOr => Ok(Value::Bool(a || b)),
            op => Err(not_defined(op, kind)),
        },
        _ => Err(not_defined(op, kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(op: Operator, a: i64, b: i64) -> Result<Value, RuntimeError> {
        eval(op, Kind::Int, Value::Int(a), Value::Int(b))
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(int(Operator::Add, 2, 3).unwrap(), Value::Int(5));
        assert_eq!(int(Operator::Add, i64::MAX, 1).unwrap(), Value::Int(i64::MIN));
        assert_eq!(
            eval(Operator::Mul, Kind::Uint8, Value::Uint8(16), Value::Uint8(17)).unwrap(),
            Value::Uint8(16)
        );
        assert_eq!(int(Operator::Quo, -7, 2).unwrap(), Value::Int(-3));
        assert_eq!(int(Operator::Rem, -7, 2).unwrap(), Value::Int(-1));
        assert_eq!(int(Operator::AndNot, 0b1111, 0b0101).unwrap(), Value::Int(0b1010));
    }

    #[test]
    fn test_division_by_zero() {
        let err = int(Operator::Quo, 1, 0).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert!(int(Operator::Rem, 1, 0).is_err());
        assert_eq!(
            eval(Operator::Quo, Kind::Float64, Value::Float64(1.0), Value::Float64(0.0)).unwrap(),
            Value::Float64(f64::INFINITY)
        );
    }

    #[test]
    fn test_comparisons_yield_bool() {
        assert_eq!(int(Operator::Lt, 1, 2).unwrap(), Value::Bool(true));
        assert_eq!(
            eval(
                Operator::Ge,
                Kind::String,
                Value::String("b".into()),
                Value::String("a".into())
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval(Operator::Ne, Kind::Bool, Value::Bool(true), Value::Bool(false)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_shifts() {
        assert_eq!(
            eval(Operator::Shl, Kind::Int, Value::Int(1), Value::Uint(4)).unwrap(),
            Value::Int(16)
        );
        assert_eq!(
            eval(Operator::Shl, Kind::Int32, Value::Int32(1), Value::Uint(40)).unwrap(),
            Value::Int32(0)
        );
        assert_eq!(
            eval(Operator::Shr, Kind::Int8, Value::Int8(-8), Value::Int(100)).unwrap(),
            Value::Int8(-1)
        );
        assert_eq!(
            eval(Operator::Shr, Kind::Uint16, Value::Uint16(256), Value::Uint8(4)).unwrap(),
            Value::Uint16(16)
        );
        assert!(eval(Operator::Shl, Kind::Int, Value::Int(1), Value::Int(-1)).is_err());
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(
            eval(
                Operator::Add,
                Kind::String,
                Value::String("ab".into()),
                Value::String("cd".into())
            )
            .unwrap(),
            Value::String("abcd".into())
        );
    }

    #[test]
    fn test_kind_mismatch_is_type_error() {
        let err = eval(Operator::Add, Kind::Int, Value::Int(1), Value::Int64(1)).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Type);
        assert!(eval(Operator::Rem, Kind::Float64, Value::Float64(1.0), Value::Float64(1.0)).is_err());
    }
}
