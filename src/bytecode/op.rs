use crate::bytecode::compile_error::CompileError;
use crate::lang::types::{ConstKind, Kind};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// OPERATOR - binary operators and their typing metadata
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Operator {
    Add = 0,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LAnd,
    LOr,
}

const OPERATORS: [Operator; 19] = [
    Operator::Add,
    Operator::Sub,
    Operator::Mul,
    Operator::Quo,
    Operator::Rem,
    Operator::And,
    Operator::Or,
    Operator::Xor,
    Operator::AndNot,
    Operator::Shl,
    Operator::Shr,
    Operator::Lt,
    Operator::Le,
    Operator::Gt,
    Operator::Ge,
    Operator::Eq,
    Operator::Ne,
    Operator::LAnd,
    Operator::LOr,
];

/// Rule the second operand follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondOperand {
    /// Same kind as the first operand (after promotion).
    SameKind,
    /// Any integer kind; the count of a shift.
    ShiftCount,
}

/// Result kind convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    SameAsFirst,
    Fixed(Kind),
}

/// How operands of different numeric categories are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The lower category (integer < float < complex) is converted up.
    Widen,
    /// Operands must already agree.
    Strict,
}

#[derive(Debug, Clone, Copy)]
pub struct OperatorInfo {
    pub symbol: &'static str,
    /// Kinds the (promoted) first operand may have.
    pub first: u32,
    pub second: SecondOperand,
    pub out: ResultKind,
    pub promotion: Promotion,
}

const INTEGER: u32 = bits(&[
    Kind::Int,
    Kind::Int8,
    Kind::Int16,
    Kind::Int32,
    Kind::Int64,
    Kind::Uint,
    Kind::Uint8,
    Kind::Uint16,
    Kind::Uint32,
    Kind::Uint64,
]);
const FLOAT: u32 = bits(&[Kind::Float32, Kind::Float64]);
const COMPLEX: u32 = bits(&[Kind::Complex64, Kind::Complex128]);
const NUMBER: u32 = INTEGER | FLOAT | COMPLEX;
const ORDERED: u32 = INTEGER | FLOAT | STRING;
const STRING: u32 = bits(&[Kind::String]);
const BOOL: u32 = bits(&[Kind::Bool]);

const fn bits(kinds: &[Kind]) -> u32 {
    let mut mask = 0;
    let mut i = 0;
    while i < kinds.len() {
        mask |= 1 << (kinds[i] as u32);
        i += 1;
    }
    mask
}

const fn info(
    symbol: &'static str,
    first: u32,
    second: SecondOperand,
    out: ResultKind,
    promotion: Promotion,
) -> OperatorInfo {
    OperatorInfo {
        symbol,
        first,
        second,
        out,
        promotion,
    }
}

use Promotion::{Strict, Widen};
use ResultKind::{Fixed, SameAsFirst};
use SecondOperand::{SameKind, ShiftCount};

const INFOS: [OperatorInfo; 19] = [
    info("+", NUMBER | STRING, SameKind, SameAsFirst, Widen),
    info("-", NUMBER, SameKind, SameAsFirst, Widen),
    info("*", NUMBER, SameKind, SameAsFirst, Widen),
    info("/", NUMBER, SameKind, SameAsFirst, Widen),
    info("%", INTEGER, SameKind, SameAsFirst, Strict),
    info("&", INTEGER, SameKind, SameAsFirst, Strict),
    info("|", INTEGER, SameKind, SameAsFirst, Strict),
    info("^", INTEGER, SameKind, SameAsFirst, Strict),
    info("&^", INTEGER, SameKind, SameAsFirst, Strict),
    info("<<", INTEGER, ShiftCount, SameAsFirst, Strict),
    info(">>", INTEGER, ShiftCount, SameAsFirst, Strict),
    info("<", ORDERED, SameKind, Fixed(Kind::Bool), Widen),
    info("<=", ORDERED, SameKind, Fixed(Kind::Bool), Widen),
    info(">", ORDERED, SameKind, Fixed(Kind::Bool), Widen),
    info(">=", ORDERED, SameKind, Fixed(Kind::Bool), Widen),
    info("==", NUMBER | STRING | BOOL, SameKind, Fixed(Kind::Bool), Widen),
    info("!=", NUMBER | STRING | BOOL, SameKind, Fixed(Kind::Bool), Widen),
    info("&&", BOOL, SameKind, SameAsFirst, Strict),
    info("||", BOOL, SameKind, SameAsFirst, Strict),
];

impl Operator {
    pub fn from_u8(n: u8) -> Option<Operator> {
        OPERATORS.get(n as usize).copied()
    }

    pub fn info(self) -> &'static OperatorInfo {
        &INFOS[self as usize]
    }

    pub fn symbol(self) -> &'static str {
        self.info().symbol
    }

    pub fn is_comparison(self) -> bool {
        matches!(self.info().out, ResultKind::Fixed(Kind::Bool)) && self.info().first != BOOL
    }

    pub fn is_shift(self) -> bool {
        self.info().second == SecondOperand::ShiftCount
    }

    pub fn defined_on(self, kind: Kind) -> bool {
        kind.is_basic() && self.info().first & kind.bit() != 0
    }

    pub fn result_kind(self, operand: Kind) -> Kind {
        match self.info().out {
            ResultKind::SameAsFirst => operand,
            ResultKind::Fixed(k) => k,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Operator {
    /// Whether `x op= y` is a valid update: arithmetic, bitwise and shifts.
    pub fn has_update_form(self) -> bool {
        (self as u8) <= Operator::Shr as u8
    }
}

// =============================================================================
// ADDRESS OPERATORS - operations through a pointer
// =============================================================================

/// What an `AddrOp` instruction does with the pointer on top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrOperator {
    /// Replace the pointer with the value it points to.
    Val,
    /// Store the value below the pointer through it.
    Assign,
    Inc,
    Dec,
    /// `*p = *p op v`, with `v` below the pointer.
    Update(Operator),
}

const ADDR_UPDATE_BASE: u32 = 4;

impl AddrOperator {
    pub fn code(self) -> u32 {
        match self {
            AddrOperator::Val => 0,
            AddrOperator::Assign => 1,
            AddrOperator::Inc => 2,
            AddrOperator::Dec => 3,
            AddrOperator::Update(op) => ADDR_UPDATE_BASE + op as u32,
        }
    }

    pub fn from_code(code: u32) -> Option<AddrOperator> {
        match code {
            0 => Some(AddrOperator::Val),
            1 => Some(AddrOperator::Assign),
            2 => Some(AddrOperator::Inc),
            3 => Some(AddrOperator::Dec),
            n => Operator::from_u8(n.checked_sub(ADDR_UPDATE_BASE)? as u8)
                .filter(|op| op.has_update_form())
                .map(AddrOperator::Update),
        }
    }

    /// Values popped and pushed, the pointer included.
    pub fn stack_effect(self) -> (i64, i64) {
        match self {
            AddrOperator::Val => (1, 1),
            AddrOperator::Assign | AddrOperator::Update(_) => (2, 0),
            AddrOperator::Inc | AddrOperator::Dec => (1, 0),
        }
    }
}

impl fmt::Display for AddrOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrOperator::Val => f.write_str("*"),
            AddrOperator::Assign => f.write_str("="),
            AddrOperator::Inc => f.write_str("++"),
            AddrOperator::Dec => f.write_str("--"),
            AddrOperator::Update(op) => write!(f, "{}=", op),
        }
    }
}

// =============================================================================
// Operand kind resolution
// =============================================================================

/// Outcome of typing a binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Kind tagged into the operator instruction.
    pub operand: Kind,
    /// Kind the first operand must be brought to.
    pub x: Kind,
    /// Kind the second operand must be brought to; `None` leaves it as is.
    pub y: Option<Kind>,
    pub result: Kind,
}

/// Decide the operand and result kinds of `x op y`.
///
/// The operand kind is the first operand's kind if bound, else the
/// second's. Under `Widen`, operands from different numeric categories meet
/// at the higher category; an unbound constant of a higher category lifts a
/// bound operand to that category's default kind.
pub fn resolve(op: Operator, x: ConstKind, y: ConstKind) -> Result<Resolution, CompileError> {
    let info = op.info();

    if info.second == SecondOperand::ShiftCount {
        // Unbound float and complex operands of a shift must hold integers.
        let kind = match x {
            ConstKind::UnboundFloat | ConstKind::UnboundComplex => Kind::Int,
            other => other.default_kind(),
        };
        if !op.defined_on(kind) {
            return Err(CompileError::operator_not_defined(op, kind));
        }
        let y_target = match y {
            ConstKind::Bound(k) if k.is_integer() => None,
            ConstKind::Bound(k) => return Err(CompileError::invalid_shift_count(op, k)),
            _ => Some(Kind::Uint),
        };
        return Ok(Resolution {
            operand: kind,
            x: kind,
            y: y_target,
            result: op.result_kind(kind),
        });
    }

    let kind = match (x, y) {
        (ConstKind::Bound(a), ConstKind::Bound(b)) if a == b => a,
        (ConstKind::Bound(a), ConstKind::Bound(b)) => match info.promotion {
            Promotion::Widen if a.rank() > 0 && b.rank() > 0 && a.rank() != b.rank() => {
                if a.rank() > b.rank() { a } else { b }
            }
            _ => return Err(CompileError::mismatched_kinds(op, a, b)),
        },
        (ConstKind::Bound(a), unbound) | (unbound, ConstKind::Bound(a)) => match info.promotion {
            Promotion::Widen if a.rank() > 0 && unbound.rank() > a.rank() => {
                unbound.default_kind()
            }
            _ => a,
        },
        _ => return Err(CompileError::unbound_operands(op)),
    };

    if !op.defined_on(kind) {
        return Err(CompileError::operator_not_defined(op, kind));
    }

    Ok(Resolution {
        operand: kind,
        x: kind,
        y: Some(kind),
        result: op.result_kind(kind),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(k: Kind) -> ConstKind {
        ConstKind::Bound(k)
    }

    #[test]
    fn test_operator_table_is_aligned() {
        for (i, op) in OPERATORS.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(Operator::from_u8(i as u8), Some(*op));
        }
        assert_eq!(Operator::AndNot.symbol(), "&^");
        assert_eq!(Operator::LOr.symbol(), "||");
    }

    #[test]
    fn test_addr_operator_codes() {
        for op in OPERATORS {
            let update = AddrOperator::from_code(AddrOperator::Update(op).code());
            if op.has_update_form() {
                assert_eq!(update, Some(AddrOperator::Update(op)));
            } else {
                assert_eq!(update, None);
            }
        }
        assert_eq!(AddrOperator::from_code(2), Some(AddrOperator::Inc));
        assert!(AddrOperator::Update(Operator::Shr).code() < 32);
        assert_eq!(AddrOperator::Update(Operator::AndNot).to_string(), "&^=");
    }

    #[test]
    fn test_first_bound_operand_decides() {
        let r = resolve(Operator::Add, bound(Kind::Int8), ConstKind::UnboundInt).unwrap();
        assert_eq!(r.operand, Kind::Int8);
        assert_eq!(r.y, Some(Kind::Int8));
        let r = resolve(Operator::Sub, ConstKind::UnboundInt, bound(Kind::Uint16)).unwrap();
        assert_eq!(r.operand, Kind::Uint16);
        assert_eq!(r.result, Kind::Uint16);
    }

    #[test]
    fn test_widen_int_and_float() {
        let r = resolve(Operator::Add, bound(Kind::Int), bound(Kind::Float64)).unwrap();
        assert_eq!(r.operand, Kind::Float64);
        assert_eq!(r.x, Kind::Float64);

        let r = resolve(Operator::Mul, bound(Kind::Int32), ConstKind::UnboundFloat).unwrap();
        assert_eq!(r.operand, Kind::Float64);

        let r = resolve(Operator::Quo, bound(Kind::Float32), ConstKind::UnboundInt).unwrap();
        assert_eq!(r.operand, Kind::Float32);
    }

    #[test]
    fn test_widen_rejects_same_category_mismatch() {
        let err = resolve(Operator::Add, bound(Kind::Int), bound(Kind::Int64)).unwrap_err();
        assert!(err.to_string().contains("mismatched"));
    }

    #[test]
    fn test_strict_rejects_category_mismatch() {
        assert!(resolve(Operator::Rem, bound(Kind::Int), bound(Kind::Float64)).is_err());
        let r = resolve(Operator::Rem, bound(Kind::Int), ConstKind::UnboundFloat).unwrap();
        assert_eq!(r.operand, Kind::Int);
    }

    #[test]
    fn test_comparison_yields_bool_tagged_with_operand_kind() {
        let r = resolve(Operator::Lt, bound(Kind::Int), bound(Kind::Float64)).unwrap();
        assert_eq!(r.operand, Kind::Float64);
        assert_eq!(r.result, Kind::Bool);
        assert!(Operator::Lt.is_comparison());
        assert!(!Operator::LAnd.is_comparison());
    }

    #[test]
    fn test_operator_not_defined() {
        let err = resolve(Operator::Sub, bound(Kind::String), bound(Kind::String)).unwrap_err();
        assert!(err.to_string().contains("not defined"));
        assert!(resolve(Operator::Lt, bound(Kind::Bool), bound(Kind::Bool)).is_err());
        assert!(resolve(Operator::Eq, bound(Kind::Bool), bound(Kind::Bool)).is_ok());
    }

    #[test]
    fn test_unbound_operands_rejected() {
        assert!(resolve(Operator::Add, ConstKind::UnboundInt, ConstKind::UnboundFloat).is_err());
    }

    #[test]
    fn test_shift_count_rules() {
        let r = resolve(Operator::Shl, bound(Kind::Int), bound(Kind::Uint8)).unwrap();
        assert_eq!(r.operand, Kind::Int);
        assert_eq!(r.y, None);
        let r = resolve(Operator::Shr, bound(Kind::Uint32), ConstKind::UnboundInt).unwrap();
        assert_eq!(r.y, Some(Kind::Uint));
        assert!(resolve(Operator::Shl, bound(Kind::Int), bound(Kind::Float64)).is_err());
        assert!(resolve(Operator::Shl, bound(Kind::Float64), bound(Kind::Uint)).is_err());
    }

    #[test]
    fn test_shift_binds_unbound_float_operands_to_integers() {
        let r = resolve(Operator::Shl, ConstKind::UnboundInt, ConstKind::UnboundFloat).unwrap();
        assert_eq!(r.operand, Kind::Int);
        assert_eq!(r.y, Some(Kind::Uint));
        let r = resolve(Operator::Shr, ConstKind::UnboundFloat, ConstKind::UnboundInt).unwrap();
        assert_eq!(r.x, Kind::Int);
        let r = resolve(Operator::Shl, bound(Kind::Int16), ConstKind::UnboundComplex).unwrap();
        assert_eq!(r.y, Some(Kind::Uint));
    }
}
