//! Compile-time evaluation of binary operators on constants.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{self, Operator};
use crate::lang::literal::Constant;
use crate::lang::types::Kind;
use crate::lang::value::{Complex, Value};
use crate::runtime::builtin_ops;
use crate::runtime::runtime_error::RuntimeErrorKind;

/// Fold `x op y`.
///
/// Two unbound operands are combined at extended precision and stay unbound
/// (comparisons give a bound `bool`). As soon as either side is bound the
/// operands are resolved to a kind and evaluated exactly as the VM would.
pub fn fold(op: Operator, x: &Constant, y: &Constant) -> Result<Constant, CompileError> {
    if x.kind().is_bound() || y.kind().is_bound() {
        return fold_bound(op, x, y);
    }
    if op.is_shift() {
        return fold_shift(op, x, y);
    }
    match x.kind().rank().max(y.kind().rank()) {
        1 => fold_int(op, to_i128(x)?, to_i128(y)?),
        2 => fold_float(op, to_f64(x), to_f64(y)),
        _ => fold_complex(op, to_complex(x), to_complex(y)),
    }
}

fn fold_bound(op: Operator, x: &Constant, y: &Constant) -> Result<Constant, CompileError> {
    let res = op::resolve(op, x.kind(), y.kind())?;
    let xv = coerce(x, res.x)?;
    let yv = match res.y {
        Some(kind) => coerce(y, kind)?,
        None => y.bind_default()?,
    };
    builtin_ops::eval(op, res.operand, xv, yv)
        .map(Constant::Bound)
        .map_err(|e| match e.kind {
            RuntimeErrorKind::DivisionByZero => CompileError::ConstDivisionByZero,
            _ => CompileError::internal(e.message),
        })
}

/// Bind an unbound constant, or convert a bound one to a wider kind.
fn coerce(c: &Constant, kind: Kind) -> Result<Value, CompileError> {
    match c {
        Constant::Bound(v) if v.kind() != kind => v
            .convert(kind)
            .ok_or_else(|| CompileError::const_not_representable(c.to_string(), kind)),
        _ => c.bind(kind),
    }
}

fn to_i128(c: &Constant) -> Result<i128, CompileError> {
    match c {
        Constant::Int(n) => Ok(*n),
        Constant::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i128),
        Constant::Complex(z) if z.im == 0.0 => to_i128(&Constant::Float(z.re)),
        other => Err(CompileError::const_truncated(other.to_string(), Kind::Int)),
    }
}

fn to_f64(c: &Constant) -> f64 {
    match c {
        Constant::Int(n) => *n as f64,
        Constant::Float(f) => *f,
        Constant::Complex(z) => z.re,
        Constant::Bound(v) => v.as_f64().unwrap_or_default(),
    }
}

fn to_complex(c: &Constant) -> Complex<f64> {
    match c {
        Constant::Complex(z) => *z,
        other => Complex::new(to_f64(other), 0.0),
    }
}

fn overflow(op: Operator) -> CompileError {
    CompileError::const_overflow(format!("result of {}", op), Kind::Int)
}

fn bool_const(b: bool) -> Result<Constant, CompileError> {
    Ok(Constant::Bound(Value::Bool(b)))
}

fn fold_int(op: Operator, a: i128, b: i128) -> Result<Constant, CompileError> {
    use Operator::*;
    let n = match op {
        Add => a.checked_add(b).ok_or_else(|| overflow(op))?,
        Sub => a.checked_sub(b).ok_or_else(|| overflow(op))?,
        Mul => a.checked_mul(b).ok_or_else(|| overflow(op))?,
        Quo | Rem if b == 0 => return Err(CompileError::ConstDivisionByZero),
        Quo => a / b,
        Rem => a % b,
        And => a & b,
        Or => a | b,
        Xor => a ^ b,
        AndNot => a & !b,
        Lt => return bool_const(a < b),
        Le => return bool_const(a <= b),
        Gt => return bool_const(a > b),
        Ge => return bool_const(a >= b),
        Eq => return bool_const(a == b),
        Ne => return bool_const(a != b),
        Shl | Shr | LAnd | LOr => {
            return Err(CompileError::operator_not_defined(op, Kind::Int));
        }
    };
    Ok(Constant::Int(n))
}

fn fold_float(op: Operator, a: f64, b: f64) -> Result<Constant, CompileError> {
    use Operator::*;
    let f = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Quo if b == 0.0 => return Err(CompileError::ConstDivisionByZero),
        Quo => a / b,
        Lt => return bool_const(a < b),
        Le => return bool_const(a <= b),
        Gt => return bool_const(a > b),
        Ge => return bool_const(a >= b),
        Eq => return bool_const(a == b),
        Ne => return bool_const(a != b),
        _ => return Err(CompileError::operator_not_defined(op, Kind::Float64)),
    };
    if !f.is_finite() {
        return Err(CompileError::const_overflow(format!("result of {}", op), Kind::Float64));
    }
    Ok(Constant::Float(f))
}

fn fold_complex(op: Operator, a: Complex<f64>, b: Complex<f64>) -> Result<Constant, CompileError> {
    use Operator::*;
    let z = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Quo if b.re == 0.0 && b.im == 0.0 => return Err(CompileError::ConstDivisionByZero),
        Quo => a / b,
        Eq => return bool_const(a == b),
        Ne => return bool_const(a != b),
        _ => return Err(CompileError::operator_not_defined(op, Kind::Complex128)),
    };
    Ok(Constant::Complex(z))
}

/// Shift of two unbound constants; the left side must be integral.
fn fold_shift(op: Operator, x: &Constant, y: &Constant) -> Result<Constant, CompileError> {
    let a = to_i128(x)?;
    let count = to_i128(y)?;
    if count < 0 {
        return Err(CompileError::invalid_literal(
            &y.to_string(),
            "negative shift count",
        ));
    }
    let n = match op {
        Operator::Shl => {
            let count = u32::try_from(count).map_err(|_| overflow(op))?;
            if count >= 127 {
                if a == 0 {
                    0
                } else {
                    return Err(overflow(op));
                }
            } else {
                let shifted = a << count;
                if shifted >> count != a {
                    return Err(overflow(op));
                }
                shifted
            }
        }
        _ => {
            if count >= 127 {
                if a < 0 { -1 } else { 0 }
            } else {
                a >> count
            }
        }
    };
    Ok(Constant::Int(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_int_stays_unbound() {
        let c = fold(Operator::Add, &Constant::Int(1), &Constant::Int(2)).unwrap();
        assert_eq!(c, Constant::Int(3));
    }

    #[test]
    fn test_extended_precision() {
        let big = Constant::Int(1 << 62);
        let c = fold(Operator::Mul, &big, &Constant::Int(8)).unwrap();
        assert_eq!(c, Constant::Int(1 << 65));
        assert!(c.bind(Kind::Int).is_err());
        let back = fold(Operator::Quo, &c, &Constant::Int(16)).unwrap();
        assert_eq!(back.bind(Kind::Int).unwrap(), Value::Int(1 << 61));
    }

    #[test]
    fn test_int_and_float_mix_to_float() {
        let c = fold(Operator::Add, &Constant::Int(1), &Constant::Float(2.5)).unwrap();
        assert_eq!(c, Constant::Float(3.5));
    }

    #[test]
    fn test_float_quotient_can_be_integral() {
        let c = fold(Operator::Quo, &Constant::Float(5.0), &Constant::Int(2)).unwrap();
        assert_eq!(c, Constant::Float(2.5));
        let c = fold(Operator::Quo, &Constant::Int(5), &Constant::Int(2)).unwrap();
        assert_eq!(c, Constant::Int(2));
    }

    #[test]
    fn test_comparison_gives_bound_bool() {
        let c = fold(Operator::Lt, &Constant::Int(1), &Constant::Float(1.5)).unwrap();
        assert_eq!(c, Constant::Bound(Value::Bool(true)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            fold(Operator::Quo, &Constant::Int(1), &Constant::Int(0)),
            Err(CompileError::ConstDivisionByZero)
        );
        assert_eq!(
            fold(Operator::Rem, &Constant::Int(1), &Constant::Int(0)),
            Err(CompileError::ConstDivisionByZero)
        );
        assert_eq!(
            fold(
                Operator::Quo,
                &Constant::Bound(Value::Int32(1)),
                &Constant::Int(0)
            ),
            Err(CompileError::ConstDivisionByZero)
        );
    }

    #[test]
    fn test_bound_operand_binds_the_other() {
        let rune = Constant::Bound(Value::Int32(97));
        let c = fold(Operator::Add, &rune, &Constant::Int(1)).unwrap();
        assert_eq!(c, Constant::Bound(Value::Int32(98)));
    }

    #[test]
    fn test_bound_int_widens_to_float() {
        let c = fold(
            Operator::Add,
            &Constant::Bound(Value::Int(1)),
            &Constant::Bound(Value::Float64(0.5)),
        )
        .unwrap();
        assert_eq!(c, Constant::Bound(Value::Float64(1.5)));
    }

    #[test]
    fn test_bound_strings_concatenate() {
        let a = Constant::Bound(Value::String("ab".into()));
        let b = Constant::Bound(Value::String("c".into()));
        assert_eq!(
            fold(Operator::Add, &a, &b).unwrap(),
            Constant::Bound(Value::String("abc".into()))
        );
        assert!(fold(Operator::Sub, &a, &b).is_err());
    }

    #[test]
    fn test_shift() {
        assert_eq!(
            fold(Operator::Shl, &Constant::Int(1), &Constant::Int(70)).unwrap(),
            Constant::Int(1 << 70)
        );
        assert_eq!(
            fold(Operator::Shr, &Constant::Int(-8), &Constant::Int(1)).unwrap(),
            Constant::Int(-4)
        );
        assert_eq!(
            fold(Operator::Shl, &Constant::Complex(Complex::new(2.0, 0.0)), &Constant::Float(1.0))
                .unwrap(),
            Constant::Int(4)
        );
        assert!(fold(Operator::Shl, &Constant::Float(1.5), &Constant::Int(1)).is_err());
        assert!(fold(Operator::Shl, &Constant::Int(1), &Constant::Int(-1)).is_err());
    }

    #[test]
    fn test_operators_not_defined_on_floats() {
        assert!(matches!(
            fold(Operator::Rem, &Constant::Float(1.0), &Constant::Float(1.0)),
            Err(CompileError::OperatorNotDefined { .. })
        ));
    }
}
