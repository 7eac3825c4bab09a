use crate::bytecode::op::{AddrOperator, Operator};
use crate::lang::types::Kind;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// INSTRUCTION WORD
//
//   31      26 25                                  0
//  +----------+-------------------------------------+
//  |  opcode  |               operand               |
//  +----------+-------------------------------------+
//
// Operand layouts:
//   var address    scope:6 | index:20          scope 63 = global context
//   funcv call     arity:10 | index:16         arity 1023 = spread, 1022 = extra pushed
//   closure        variadic:1 | index:25
//   builtin op     kind:5 | operator:5
//   addr op        kind:5 | addr operator:5
//   push int       kind:4 | value:22 (signed)
// =============================================================================

pub const OPCODE_BITS: u32 = 6;
pub const OPERAND_BITS: u32 = 32 - OPCODE_BITS;
pub const OPERAND_MASK: u32 = (1 << OPERAND_BITS) - 1;

pub const ADDR_INDEX_BITS: u32 = 20;
pub const ADDR_SCOPE_BITS: u32 = OPERAND_BITS - ADDR_INDEX_BITS;
pub const ADDR_INDEX_MASK: u32 = (1 << ADDR_INDEX_BITS) - 1;
/// Scope value reserved for variables of the global context.
pub const SCOPE_GLOBAL: u32 = (1 << ADDR_SCOPE_BITS) - 1;

pub const FUNCV_INDEX_BITS: u32 = 16;
pub const FUNCV_INDEX_MASK: u32 = (1 << FUNCV_INDEX_BITS) - 1;
/// Arity field value meaning "last argument is a spread slice".
pub const ARITY_SPREAD: u32 = (1 << (OPERAND_BITS - FUNCV_INDEX_BITS)) - 1;
/// Arity field value meaning "the count above this was pushed as an extra operand".
pub const ARITY_MAX: u32 = ARITY_SPREAD - 1;

pub const CLOSURE_INDEX_BITS: u32 = OPERAND_BITS - 1;
pub const CLOSURE_INDEX_MASK: u32 = (1 << CLOSURE_INDEX_BITS) - 1;
pub const CLOSURE_VARIADIC: u32 = 1 << CLOSURE_INDEX_BITS;

pub const PUSH_INT_BITS: u32 = OPERAND_BITS - 4;
pub const PUSH_INT_MIN: i64 = -(1 << (PUSH_INT_BITS - 1));
pub const PUSH_INT_MAX: i64 = (1 << (PUSH_INT_BITS - 1)) - 1;

/// Return operand meaning "return the current result variables".
pub const RETURN_VARS: u32 = OPERAND_MASK;
/// Arity operand of dynamic calls meaning "last argument is a spread slice".
pub const CALL_SPREAD: u32 = OPERAND_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Reserved slot not yet patched.
    Nop = 0,
    PushInt,
    PushConst,
    Pop,
    LoadVar,
    StoreVar,
    /// Push a pointer aliasing the variable at the address in the operand.
    AddrVar,
    /// Operate through the pointer on top of the stack.
    AddrOp,
    /// Load a parameter of the running function, `operand` slots below the frame base.
    LoadArg,
    StoreArg,
    LoadNativeVar,
    BuiltinOp,
    /// Convert the top of stack to the basic kind in the operand.
    Convert,
    CallFunc,
    CallFuncv,
    CallNative,
    CallNativev,
    PushNative,
    PushNativev,
    /// Create a VM closure over the current context.
    Closure,
    /// Create a closure wrapped as a native callable.
    HostClosure,
    CallClosure,
    /// Call a dynamically typed callable value (callee on top of its arguments).
    CallValue,
    Deref,
    Field,
    Return,
}

impl Opcode {
    pub fn from_u8(n: u8) -> Option<Opcode> {
        use Opcode::*;
        const TABLE: [Opcode; 26] = [
            Nop,
            PushInt,
            PushConst,
            Pop,
            LoadVar,
            StoreVar,
            AddrVar,
            AddrOp,
            LoadArg,
            StoreArg,
            LoadNativeVar,
            BuiltinOp,
            Convert,
            CallFunc,
            CallFuncv,
            CallNative,
            CallNativev,
            PushNative,
            PushNativev,
            Closure,
            HostClosure,
            CallClosure,
            CallValue,
            Deref,
            Field,
            Return,
        ];
        TABLE.get(n as usize).copied()
    }

    /// Whether the operand of this opcode names a script function (and so
    /// may sit in a forward-reference patch list).
    pub fn references_func(self) -> bool {
        matches!(
            self,
            Opcode::CallFunc | Opcode::CallFuncv | Opcode::Closure | Opcode::HostClosure
        )
    }
}

/// A packed instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instr(pub u32);

impl Instr {
    /// Encode an instruction. Panics if `operand` does not fit the operand field.
    pub fn new(op: Opcode, operand: u32) -> Instr {
        assert!(
            operand <= OPERAND_MASK,
            "operand {:#x} overflows the {}-bit field of {:?}",
            operand,
            OPERAND_BITS,
            op
        );
        Instr(((op as u32) << OPERAND_BITS) | operand)
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_u8((self.0 >> OPERAND_BITS) as u8)
    }

    pub fn operand(self) -> u32 {
        self.0 & OPERAND_MASK
    }

    /// Return a copy with `bits` or-ed into the operand (used by patching).
    pub fn with_operand_bits(self, bits: u32) -> Instr {
        assert!(bits <= OPERAND_MASK, "patch bits {:#x} overflow operand", bits);
        Instr(self.0 | bits)
    }

    pub fn push_int(kind: Kind, value: i64) -> Instr {
        assert!(kind.is_integer(), "inline push of non-integer kind {}", kind);
        assert!(
            (PUSH_INT_MIN..=PUSH_INT_MAX).contains(&value),
            "inline integer {} out of range",
            value
        );
        let bits = (value as u32) & ((1 << PUSH_INT_BITS) - 1);
        Instr::new(Opcode::PushInt, ((kind as u32) << PUSH_INT_BITS) | bits)
    }

    pub fn fits_push_int(value: i64) -> bool {
        (PUSH_INT_MIN..=PUSH_INT_MAX).contains(&value)
    }

    pub fn decode_push_int(self) -> (Option<Kind>, i64) {
        let operand = self.operand();
        let kind = Kind::from_u8((operand >> PUSH_INT_BITS) as u8);
        let raw = operand & ((1 << PUSH_INT_BITS) - 1);
        let shift = 64 - PUSH_INT_BITS;
        let value = ((raw as i64) << shift) >> shift;
        (kind, value)
    }

    pub fn builtin(kind: Kind, op: Operator) -> Instr {
        Instr::new(Opcode::BuiltinOp, ((kind as u32) << 5) | op as u32)
    }

    pub fn decode_builtin(self) -> (Option<Kind>, Option<Operator>) {
        let operand = self.operand();
        (
            Kind::from_u8(((operand >> 5) & 0x1F) as u8),
            Operator::from_u8((operand & 0x1F) as u8),
        )
    }

    pub fn addr_op(kind: Kind, op: AddrOperator) -> Instr {
        Instr::new(Opcode::AddrOp, ((kind as u32) << 5) | op.code())
    }

    pub fn decode_addr_op(self) -> (Option<Kind>, Option<AddrOperator>) {
        let operand = self.operand();
        (
            Kind::from_u8(((operand >> 5) & 0x1F) as u8),
            AddrOperator::from_code(operand & 0x1F),
        )
    }

    pub fn var(op: Opcode, scope: u32, index: u32) -> Instr {
        Instr::new(op, make_addr(scope, index))
    }

    /// Split a variable address operand into `(scope, index)`.
    pub fn decode_addr(self) -> (u32, u32) {
        let operand = self.operand();
        (operand >> ADDR_INDEX_BITS, operand & ADDR_INDEX_MASK)
    }

    pub fn funcv(op: Opcode, arity: u32, index: u32) -> Instr {
        assert!(arity <= ARITY_SPREAD, "funcv arity {} overflows", arity);
        assert!(index <= FUNCV_INDEX_MASK, "funcv index {} overflows", index);
        Instr::new(op, (arity << FUNCV_INDEX_BITS) | index)
    }

    /// Split a variadic call operand into `(arity, index)`.
    pub fn decode_funcv(self) -> (u32, u32) {
        let operand = self.operand();
        (operand >> FUNCV_INDEX_BITS, operand & FUNCV_INDEX_MASK)
    }

    /// Split a closure operand into `(variadic, index)`.
    pub fn decode_closure(self) -> (bool, u32) {
        let operand = self.operand();
        (operand & CLOSURE_VARIADIC != 0, operand & CLOSURE_INDEX_MASK)
    }
}

/// Pack a scope-relative address. Panics when either field overflows.
pub fn make_addr(scope: u32, index: u32) -> u32 {
    assert!(scope <= SCOPE_GLOBAL, "scope distance {} overflows", scope);
    assert!(index <= ADDR_INDEX_MASK, "variable index {} overflows", index);
    (scope << ADDR_INDEX_BITS) | index
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{:?} {:#x}", op, self.operand()),
            None => write!(f, "<bad {:#010x}>", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for n in 0..26u8 {
            let op = Opcode::from_u8(n).unwrap();
            let instr = Instr::new(op, 5);
            assert_eq!(instr.opcode(), Some(op));
            assert_eq!(instr.operand(), 5);
        }
        assert_eq!(Opcode::from_u8(26), None);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_operand_overflow_panics() {
        Instr::new(Opcode::Pop, OPERAND_MASK + 1);
    }

    #[test]
    fn test_addr_packing() {
        let instr = Instr::var(Opcode::LoadVar, 3, 17);
        assert_eq!(instr.decode_addr(), (3, 17));
        let global = Instr::var(Opcode::StoreVar, SCOPE_GLOBAL, ADDR_INDEX_MASK);
        assert_eq!(global.decode_addr(), (SCOPE_GLOBAL, ADDR_INDEX_MASK));
    }

    #[test]
    #[should_panic(expected = "variable index")]
    fn test_addr_index_overflow_panics() {
        make_addr(0, ADDR_INDEX_MASK + 1);
    }

    #[test]
    fn test_push_int_sign_extends() {
        for value in [0, 1, -1, PUSH_INT_MIN, PUSH_INT_MAX, -12345] {
            let instr = Instr::push_int(Kind::Int16, value);
            assert_eq!(instr.decode_push_int(), (Some(Kind::Int16), value));
        }
        assert!(!Instr::fits_push_int(PUSH_INT_MAX + 1));
    }

    #[test]
    fn test_funcv_fields() {
        let instr = Instr::funcv(Opcode::CallNativev, ARITY_SPREAD, 9);
        assert_eq!(instr.decode_funcv(), (ARITY_SPREAD, 9));
        assert_eq!(ARITY_MAX, 1022);
    }

    #[test]
    fn test_builtin_fields() {
        let instr = Instr::builtin(Kind::Float64, Operator::Lt);
        assert_eq!(
            instr.decode_builtin(),
            (Some(Kind::Float64), Some(Operator::Lt))
        );
    }

    #[test]
    fn test_addr_op_fields() {
        let instr = Instr::addr_op(Kind::Uint8, AddrOperator::Update(Operator::Shl));
        assert_eq!(instr.opcode(), Some(Opcode::AddrOp));
        assert_eq!(
            instr.decode_addr_op(),
            (Some(Kind::Uint8), Some(AddrOperator::Update(Operator::Shl)))
        );
        let assign = Instr::addr_op(Kind::Int, AddrOperator::Assign);
        assert_eq!(assign.decode_addr_op().1, Some(AddrOperator::Assign));
    }

    #[test]
    fn test_closure_patch_bits() {
        let placeholder = Instr::new(Opcode::Closure, 0);
        let patched = placeholder.with_operand_bits(CLOSURE_VARIADIC | 42);
        assert_eq!(patched.decode_closure(), (true, 42));
    }
}
