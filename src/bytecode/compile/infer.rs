//! The compile-time shadow of the runtime value stack.

use crate::bytecode::func::FuncId;
use crate::bytecode::program::Reserved;
use crate::lang::literal::Constant;
use crate::lang::types::{ConstKind, FuncType, Type};
use std::sync::Arc;

/// Where the instruction of a constant stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstSlot {
    /// Inferred without emitting anything.
    Pending,
    /// An unbound constant holding a placeholder, patched once its kind is known.
    Reserved(Reserved),
    /// Already emitted with its final kind.
    Emitted,
}

/// A callee known at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncRef {
    Script {
        id: FuncId,
        /// Function literals are called through a closure of the current context.
        literal: bool,
    },
    Native {
        addr: u32,
        variadic: bool,
        /// Methods take their receiver as the first argument.
        method: bool,
        name: String,
    },
}

/// Names that take part in member lookup but are not values.
#[derive(Debug, Clone, PartialEq)]
pub enum NonValue {
    Package { path: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inferred {
    Const { value: Constant, slot: ConstSlot },
    Value(Type),
    /// Results of a call returning zero or several values.
    Results(Vec<Type>),
    Func { func: FuncRef, sig: Arc<FuncType> },
    NonValue(NonValue),
}

impl Inferred {
    /// The kind this entry contributes to operator resolution, if it is a single value.
    pub fn const_kind(&self) -> Option<ConstKind> {
        match self {
            Inferred::Const { value, .. } => Some(value.kind()),
            Inferred::Value(ty) => Some(ConstKind::Bound(ty.kind())),
            Inferred::Func { .. } => Some(ConstKind::Bound(crate::lang::types::Kind::Func)),
            Inferred::Results(_) | Inferred::NonValue(_) => None,
        }
    }

    /// How many runtime stack slots the entry stands for.
    pub fn width(&self) -> usize {
        match self {
            Inferred::Results(types) => types.len(),
            _ => 1,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Inferred::Const { value, .. } => format!("constant {}", value),
            Inferred::Value(ty) => format!("value of type {}", ty),
            Inferred::Results(types) => format!("{} values", types.len()),
            Inferred::Func { sig, .. } => format!("function {}", sig),
            Inferred::NonValue(NonValue::Package { name, .. }) => format!("package {}", name),
        }
    }
}

/// Stack of inferred values, kept in lock-step with the code emitted.
///
/// A `Results` entry counts as one entry here even though it stands for
/// several runtime slots; statements expand or pop it as a unit.
#[derive(Debug, Default)]
pub struct InferStack {
    entries: Vec<Inferred>,
}

impl InferStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, value: Inferred) {
        self.entries.push(value);
    }

    /// Panics on underflow: the compiler popped something it never pushed.
    pub fn pop(&mut self) -> Inferred {
        match self.entries.pop() {
            Some(v) => v,
            None => panic!("inference stack underflow"),
        }
    }

    pub fn top(&self) -> &Inferred {
        self.get(-1)
    }

    pub fn top_mut(&mut self) -> &mut Inferred {
        match self.entries.last_mut() {
            Some(v) => v,
            None => panic!("inference stack is empty"),
        }
    }

    /// Entry at `index`; negative indices count from the top (-1 = top).
    pub fn get(&self, index: isize) -> &Inferred {
        let len = self.entries.len() as isize;
        let at = if index < 0 { len + index } else { index };
        match usize::try_from(at).ok().and_then(|i| self.entries.get(i)) {
            Some(v) => v,
            None => panic!("inference stack index {} out of range (len {})", index, len),
        }
    }

    /// Replace the top `consumed` entries with `produced`.
    pub fn ret(&mut self, consumed: usize, produced: impl IntoIterator<Item = Inferred>) {
        let len = self.entries.len();
        assert!(
            consumed <= len,
            "inference stack underflow: ret({}) with {} entries",
            consumed,
            len
        );
        self.entries.truncate(len - consumed);
        self.entries.extend(produced);
    }

    pub fn set_len(&mut self, n: usize) {
        assert!(n <= self.entries.len(), "set_len({}) grows the inference stack", n);
        self.entries.truncate(n);
    }
}
