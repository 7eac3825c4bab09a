use super::types::{Kind, Type};
use crate::runtime::closure::Closure;
use crate::runtime::context::Context;
use crate::runtime::native::NativeFunc;
use crate::runtime::runtime_error::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::sync::{Arc, Mutex};

/// Runtime value in the Quill language.
///
/// Values are the only data that can exist on the VM value stack. Each basic
/// kind has its own variant, so a value always knows its own kind and the
/// stack needs no side table of types. Scalars (and `Nil`) are what a
/// constant pool may hold; the reference variants are never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint(u64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
    String(String),

    #[serde(skip)]
    Slice(Arc<SliceValue>),

    #[serde(skip)]
    Struct(Arc<StructValue>),

    /// Shared mutable cell, the receiver of pointer methods.
    #[serde(skip)]
    Ptr(Arc<PtrValue>),

    /// Script function paired with its captured parent context.
    #[serde(skip)]
    Closure(Arc<Closure>),

    /// Native callable: a host function, or a script closure wrapped for the host.
    #[serde(skip)]
    Func(NativeFunc),
}

#[derive(Debug)]
pub struct SliceValue {
    pub elem: Type,
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct StructValue {
    pub ty: Type,
    pub fields: Vec<Value>,
}

#[derive(Debug)]
pub struct PtrValue {
    pub elem: Type,
    target: PtrTarget,
}

/// Storage a pointer refers to.
enum PtrTarget {
    /// A standalone heap cell, as host code creates.
    Cell(Mutex<Value>),
    /// A variable slot of a live frame.
    Slot { ctx: Arc<Context>, index: u32 },
}

// A frame may hold a pointer to itself; print slots by index only.
impl fmt::Debug for PtrTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtrTarget::Cell(cell) => f.debug_tuple("Cell").field(cell).finish(),
            PtrTarget::Slot { index, .. } => write!(f, "Slot({})", index),
        }
    }
}

impl PtrValue {
    pub fn load(&self) -> Result<Value, RuntimeError> {
        match &self.target {
            PtrTarget::Cell(cell) => Ok(cell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()),
            PtrTarget::Slot { ctx, index } => ctx.load(*index),
        }
    }

    pub fn store(&self, value: Value) -> Result<(), RuntimeError> {
        match &self.target {
            PtrTarget::Cell(cell) => {
                *cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
                Ok(())
            }
            PtrTarget::Slot { ctx, index } => ctx.store(*index, value),
        }
    }

    /// Whether this pointer aliases a frame variable.
    pub fn is_slot(&self) -> bool {
        matches!(self.target, PtrTarget::Slot { .. })
    }
}

impl Value {
    pub fn slice(elem: Type, items: Vec<Value>) -> Value {
        Value::Slice(Arc::new(SliceValue { elem, items }))
    }

    pub fn new_struct(ty: Type, fields: Vec<Value>) -> Value {
        Value::Struct(Arc::new(StructValue { ty, fields }))
    }

    pub fn ptr(elem: Type, value: Value) -> Value {
        Value::Ptr(Arc::new(PtrValue {
            elem,
            target: PtrTarget::Cell(Mutex::new(value)),
        }))
    }

    /// Pointer to variable `index` of `ctx`. The frame stays alive as long
    /// as the pointer does.
    pub(crate) fn slot_ptr(elem: Type, ctx: Arc<Context>, index: u32) -> Value {
        Value::Ptr(Arc::new(PtrValue {
            elem,
            target: PtrTarget::Slot { ctx, index },
        }))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Interface,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Int8(_) => Kind::Int8,
            Value::Int16(_) => Kind::Int16,
            Value::Int32(_) => Kind::Int32,
            Value::Int64(_) => Kind::Int64,
            Value::Uint(_) => Kind::Uint,
            Value::Uint8(_) => Kind::Uint8,
            Value::Uint16(_) => Kind::Uint16,
            Value::Uint32(_) => Kind::Uint32,
            Value::Uint64(_) => Kind::Uint64,
            Value::Float32(_) => Kind::Float32,
            Value::Float64(_) => Kind::Float64,
            Value::Complex64(_) => Kind::Complex64,
            Value::Complex128(_) => Kind::Complex128,
            Value::String(_) => Kind::String,
            Value::Slice(_) => Kind::Slice,
            Value::Struct(_) => Kind::Struct,
            Value::Ptr(_) => Kind::Ptr,
            Value::Closure(_) | Value::Func(_) => Kind::Func,
        }
    }

    /// Dynamic type of the value.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Nil => Type::Any,
            Value::Slice(s) => Type::slice_of(s.elem.clone()),
            Value::Struct(s) => s.ty.clone(),
            Value::Ptr(p) => Type::ptr_to(p.elem.clone()),
            Value::Closure(c) => Type::Func(c.signature().clone()),
            Value::Func(f) => Type::Func(f.signature().clone()),
            other => Type::Basic(other.kind()),
        }
    }

    /// Zero value of a type.
    pub fn zero(ty: &Type) -> Value {
        match ty.underlying() {
            Type::Basic(kind) => Value::zero_of_kind(*kind),
            Type::Struct(st) => Value::new_struct(
                ty.clone(),
                st.fields.iter().map(|f| Value::zero(&f.ty)).collect(),
            ),
            _ => Value::Nil,
        }
    }

    pub fn zero_of_kind(kind: Kind) -> Value {
        match kind {
            Kind::Bool => Value::Bool(false),
            Kind::Int => Value::Int(0),
            Kind::Int8 => Value::Int8(0),
            Kind::Int16 => Value::Int16(0),
            Kind::Int32 => Value::Int32(0),
            Kind::Int64 => Value::Int64(0),
            Kind::Uint => Value::Uint(0),
            Kind::Uint8 => Value::Uint8(0),
            Kind::Uint16 => Value::Uint16(0),
            Kind::Uint32 => Value::Uint32(0),
            Kind::Uint64 => Value::Uint64(0),
            Kind::Float32 => Value::Float32(0.0),
            Kind::Float64 => Value::Float64(0.0),
            Kind::Complex64 => Value::Complex64(Complex::new(0.0, 0.0)),
            Kind::Complex128 => Value::Complex128(Complex::new(0.0, 0.0)),
            Kind::String => Value::String(String::new()),
            _ => Value::Nil,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(n) | Value::Int64(n) => Some(n),
            Value::Int8(n) => Some(n as i64),
            Value::Int16(n) => Some(n as i64),
            Value::Int32(n) => Some(n as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(n) | Value::Uint64(n) => Some(n),
            Value::Uint8(n) => Some(n as u64),
            Value::Uint16(n) => Some(n as u64),
            Value::Uint32(n) => Some(n as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(f) => Some(f as f64),
            Value::Float64(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_complex(&self) -> Option<Complex<f64>> {
        match *self {
            Value::Complex64(c) => Some(Complex::new(c.re as f64, c.im as f64)),
            Value::Complex128(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric conversion to another basic kind.
    ///
    /// Integer conversions wrap, float to integer truncates. Complex values
    /// only convert to another complex kind. Returns `None` when the value
    /// is not numeric or the conversion is not defined.
    pub fn convert(&self, kind: Kind) -> Option<Value> {
        if self.kind() == kind {
            return Some(self.clone());
        }
        if let Some(c) = self.as_complex() {
            return match kind {
                Kind::Complex64 => Some(Value::Complex64(Complex::new(c.re as f32, c.im as f32))),
                Kind::Complex128 => Some(Value::Complex128(c)),
                _ => None,
            };
        }
        if kind.is_complex() {
            let re = self
                .as_f64()
                .or_else(|| self.as_i64().map(|n| n as f64))
                .or_else(|| self.as_u64().map(|n| n as f64))?;
            return Value::Complex128(Complex::new(re, 0.0)).convert(kind);
        }
        if let Some(f) = self.as_f64() {
            return Some(match kind {
                Kind::Float32 => Value::Float32(f as f32),
                Kind::Float64 => Value::Float64(f),
                k if k.is_signed() => Value::from_i64(k, f as i64),
                k if k.is_unsigned() => Value::from_u64(k, f as u64),
                _ => return None,
            });
        }
        let (signed, unsigned) = match (self.as_i64(), self.as_u64()) {
            (Some(n), _) => (n, n as u64),
            (None, Some(n)) => (n as i64, n),
            _ => return None,
        };
        Some(match kind {
            Kind::Float32 if self.kind().is_signed() => Value::Float32(signed as f32),
            Kind::Float32 => Value::Float32(unsigned as f32),
            Kind::Float64 if self.kind().is_signed() => Value::Float64(signed as f64),
            Kind::Float64 => Value::Float64(unsigned as f64),
            k if k.is_signed() => Value::from_i64(k, signed),
            k if k.is_unsigned() => Value::from_u64(k, unsigned),
            _ => return None,
        })
    }

    /// Build a signed integer value of `kind`, wrapping to its width.
    pub fn from_i64(kind: Kind, n: i64) -> Value {
        match kind {
            Kind::Int8 => Value::Int8(n as i8),
            Kind::Int16 => Value::Int16(n as i16),
            Kind::Int32 => Value::Int32(n as i32),
            Kind::Int64 => Value::Int64(n),
            Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64 => {
                Value::from_u64(kind, n as u64)
            }
            _ => Value::Int(n),
        }
    }

    /// Build an unsigned integer value of `kind`, wrapping to its width.
    pub fn from_u64(kind: Kind, n: u64) -> Value {
        match kind {
            Kind::Uint8 => Value::Uint8(n as u8),
            Kind::Uint16 => Value::Uint16(n as u16),
            Kind::Uint32 => Value::Uint32(n as u32),
            Kind::Uint64 => Value::Uint64(n),
            Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64 => {
                Value::from_i64(kind, n as i64)
            }
            _ => Value::Uint(n),
        }
    }

    /// Whether the value can be stored in a slot of type `ty`.
    pub fn fits(&self, ty: &Type) -> bool {
        match ty.underlying() {
            Type::Any => true,
            Type::Basic(kind) => self.kind() == *kind,
            Type::Func(_) => matches!(self, Value::Func(_) | Value::Closure(_) | Value::Nil),
            Type::Slice(_) | Type::Ptr(_) => {
                matches!(self, Value::Nil) || self.type_of().underlying() == ty.underlying()
            }
            Type::Struct(_) => match self {
                Value::Struct(s) => &s.ty == ty || s.ty.underlying() == ty.underlying(),
                _ => false,
            },
            Type::Named(_) => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) | (Int64(a), Int64(b)) => a == b,
            (Int8(a), Int8(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (Uint(a), Uint(b)) | (Uint64(a), Uint64(b)) => a == b,
            (Uint8(a), Uint8(b)) => a == b,
            (Uint16(a), Uint16(b)) => a == b,
            (Uint32(a), Uint32(b)) => a == b,
            (Float32(a), Float32(b)) => a == b,
            (Float64(a), Float64(b)) => a == b,
            (Complex64(a), Complex64(b)) => a == b,
            (Complex128(a), Complex128(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Slice(a), Slice(b)) => Arc::ptr_eq(a, b) || a.items == b.items,
            (Struct(a), Struct(b)) => Arc::ptr_eq(a, b) || (a.ty == b.ty && a.fields == b.fields),
            (Ptr(a), Ptr(b)) => Arc::ptr_eq(a, b),
            (Closure(a), Closure(b)) => Arc::ptr_eq(a, b),
            (Func(a), Func(b)) => a.same(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// Format a value the way `println` shows it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) | Value::Int64(n) => write!(f, "{}", n),
            Value::Int8(n) => write!(f, "{}", n),
            Value::Int16(n) => write!(f, "{}", n),
            Value::Int32(n) => write!(f, "{}", n),
            Value::Uint(n) | Value::Uint64(n) => write!(f, "{}", n),
            Value::Uint8(n) => write!(f, "{}", n),
            Value::Uint16(n) => write!(f, "{}", n),
            Value::Uint32(n) => write!(f, "{}", n),
            Value::Float32(n) => write!(f, "{}", n),
            Value::Float64(n) => write!(f, "{}", n),
            Value::Complex64(c) => write!(f, "{}", c),
            Value::Complex128(c) => write!(f, "{}", c),
            Value::String(s) => write!(f, "{}", s),
            Value::Slice(s) => {
                write!(f, "[")?;
                for (i, item) in s.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(s) => {
                write!(f, "{{")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
            Value::Ptr(p) => match p.load() {
                Ok(value) => write!(f, "&{}", value),
                Err(_) => f.write_str("&<invalid>"),
            },
            Value::Closure(_) | Value::Func(_) => write!(f, "<func>"),
        }
    }
}

// =============================================================================
// COMPLEX
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub fn new(re: T, im: T) -> Self {
        Complex { re, im }
    }
}

impl<T: fmt::Display + PartialOrd + Default> fmt::Display for Complex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im < T::default() {
            write!(f, "({}{}i)", self.re, self.im)
        } else {
            write!(f, "({}+{}i)", self.re, self.im)
        }
    }
}

macro_rules! complex_ops {
    ($($t:ty),*) => {$(
        impl ops::Add for Complex<$t> {
            type Output = Self;
            fn add(self, o: Self) -> Self {
                Complex::new(self.re + o.re, self.im + o.im)
            }
        }

        impl ops::Sub for Complex<$t> {
            type Output = Self;
            fn sub(self, o: Self) -> Self {
                Complex::new(self.re - o.re, self.im - o.im)
            }
        }

        impl ops::Mul for Complex<$t> {
            type Output = Self;
            fn mul(self, o: Self) -> Self {
                Complex::new(
                    self.re * o.re - self.im * o.im,
                    self.re * o.im + self.im * o.re,
                )
            }
        }

        impl ops::Div for Complex<$t> {
            type Output = Self;
            fn div(self, o: Self) -> Self {
                let d = o.re * o.re + o.im * o.im;
                Complex::new(
                    (self.re * o.re + self.im * o.im) / d,
                    (self.im * o.re - self.re * o.im) / d,
                )
            }
        }
    )*};
}

complex_ops!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_type_of() {
        assert_eq!(Value::Int(1).kind(), Kind::Int);
        assert_eq!(Value::Float64(1.0).type_of(), Type::FLOAT64);
        let s = Value::slice(Type::STRING, vec![Value::String("a".into())]);
        assert_eq!(s.type_of(), Type::slice_of(Type::STRING));
        assert_eq!(Value::Nil.type_of(), Type::Any);
    }

    #[test]
    fn test_convert_int_to_float() {
        assert_eq!(Value::Int(3).convert(Kind::Float64), Some(Value::Float64(3.0)));
        assert_eq!(
            Value::Uint8(200).convert(Kind::Float32),
            Some(Value::Float32(200.0))
        );
    }

    #[test]
    fn test_convert_wraps_integers() {
        assert_eq!(Value::Int(300).convert(Kind::Uint8), Some(Value::Uint8(44)));
        assert_eq!(Value::Int(-1).convert(Kind::Uint16), Some(Value::Uint16(u16::MAX)));
        assert_eq!(Value::Float64(2.9).convert(Kind::Int), Some(Value::Int(2)));
    }

    #[test]
    fn test_convert_to_complex() {
        assert_eq!(
            Value::Float64(1.5).convert(Kind::Complex128),
            Some(Value::Complex128(Complex::new(1.5, 0.0)))
        );
        assert_eq!(Value::Complex128(Complex::new(1.0, 1.0)).convert(Kind::Int), None);
        assert_eq!(Value::String("x".into()).convert(Kind::Int), None);
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(Value::zero(&Type::STRING), Value::String(String::new()));
        assert_eq!(Value::zero(&Type::slice_of(Type::INT)), Value::Nil);
        assert_eq!(Value::zero(&Type::FLOAT64), Value::Float64(0.0));
    }

    #[test]
    fn test_display() {
        let s = Value::slice(Type::INT, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(s.to_string(), "[1 2]");
        assert_eq!(Value::Complex128(Complex::new(1.0, -2.0)).to_string(), "(1-2i)");
        assert_eq!(Value::Float64(3.5).to_string(), "3.5");
        assert_eq!(Value::Nil.to_string(), "<nil>");
    }

    #[test]
    fn test_ptr_is_shared_cell() {
        let p = Value::ptr(Type::INT, Value::Int(1));
        let q = p.clone();
        if let Value::Ptr(cell) = &p {
            cell.store(Value::Int(7)).unwrap();
            assert!(!cell.is_slot());
        }
        match q {
            Value::Ptr(cell) => assert_eq!(cell.load().unwrap(), Value::Int(7)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_complex_arithmetic() {
        let a = Complex::new(1.0_f64, 2.0);
        let b = Complex::new(3.0_f64, -1.0);
        assert_eq!(a + b, Complex::new(4.0, 1.0));
        assert_eq!(a * b, Complex::new(5.0, 5.0));
        let q = (a * b) / b;
        assert!((q.re - 1.0).abs() < 1e-12 && (q.im - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_fits() {
        assert!(Value::Int(1).fits(&Type::INT));
        assert!(!Value::Int(1).fits(&Type::INT64));
        assert!(Value::Int(1).fits(&Type::Any));
        assert!(Value::Nil.fits(&Type::slice_of(Type::INT)));
    }
}
