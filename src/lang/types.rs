use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// KIND - the shape of a runtime type
// =============================================================================

/// Runtime kind of a value.
///
/// Basic kinds come first and are the only ones operators are defined on.
/// The discriminant doubles as the kind field of builtin-operator
/// instructions, so the order of the basic kinds is part of the bytecode
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Kind {
    Bool = 0,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,

    Slice,
    Ptr,
    Func,
    Struct,
    Interface,
}

/// Number of basic kinds (the kinds that can be encoded into an operator instruction).
pub const BASIC_KINDS: usize = Kind::String as usize + 1;

impl Kind {
    /// Decode a basic kind from its instruction-field encoding.
    pub fn from_u8(n: u8) -> Option<Kind> {
        use Kind::*;
        const TABLE: [Kind; BASIC_KINDS] = [
            Bool, Int, Int8, Int16, Int32, Int64, Uint, Uint8, Uint16, Uint32, Uint64, Float32,
            Float64, Complex64, Complex128, String,
        ];
        TABLE.get(n as usize).copied()
    }

    pub fn is_basic(self) -> bool {
        (self as usize) < BASIC_KINDS
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Kind::Int | Kind::Int8 | Kind::Int16 | Kind::Int32 | Kind::Int64
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64
        )
    }

    pub fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_float(self) -> bool {
        matches!(self, Kind::Float32 | Kind::Float64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, Kind::Complex64 | Kind::Complex128)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float() || self.is_complex()
    }

    /// Numeric category rank: integer 1, float 2, complex 3, non-numeric 0.
    pub fn rank(self) -> u8 {
        if self.is_integer() {
            1
        } else if self.is_float() {
            2
        } else if self.is_complex() {
            3
        } else {
            0
        }
    }

    /// Bit mask of this kind, for operator kind sets.
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Int8 => "int8",
            Kind::Int16 => "int16",
            Kind::Int32 => "int32",
            Kind::Int64 => "int64",
            Kind::Uint => "uint",
            Kind::Uint8 => "uint8",
            Kind::Uint16 => "uint16",
            Kind::Uint32 => "uint32",
            Kind::Uint64 => "uint64",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::Complex64 => "complex64",
            Kind::Complex128 => "complex128",
            Kind::String => "string",
            Kind::Slice => "slice",
            Kind::Ptr => "ptr",
            Kind::Func => "func",
            Kind::Struct => "struct",
            Kind::Interface => "interface",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// CONST KIND - literal kinds before and after binding
// =============================================================================

/// Kind of a compile-time constant.
///
/// Unbound kinds belong to integer/float/imaginary literals whose runtime
/// representation is chosen later by context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Bound(Kind),
    UnboundInt,
    UnboundFloat,
    UnboundComplex,
}

impl ConstKind {
    pub fn is_bound(self) -> bool {
        matches!(self, ConstKind::Bound(_))
    }

    /// The kind an unbound constant takes when nothing else decides.
    pub fn default_kind(self) -> Kind {
        match self {
            ConstKind::Bound(k) => k,
            ConstKind::UnboundInt => Kind::Int,
            ConstKind::UnboundFloat => Kind::Float64,
            ConstKind::UnboundComplex => Kind::Complex128,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            ConstKind::Bound(k) => k.rank(),
            ConstKind::UnboundInt => 1,
            ConstKind::UnboundFloat => 2,
            ConstKind::UnboundComplex => 3,
        }
    }
}

impl fmt::Display for ConstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstKind::Bound(k) => write!(f, "{}", k),
            ConstKind::UnboundInt => f.write_str("untyped int"),
            ConstKind::UnboundFloat => f.write_str("untyped float"),
            ConstKind::UnboundComplex => f.write_str("untyped complex"),
        }
    }
}

// =============================================================================
// TYPE - runtime type descriptors
// =============================================================================

/// A runtime type descriptor.
///
/// `Any` is the empty interface: a slot of this type holds any value and is
/// what makes a native parameter "dynamically typed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Basic(Kind),
    Any,
    Slice(Arc<Type>),
    Ptr(Arc<Type>),
    Func(Arc<FuncType>),
    Struct(Arc<StructType>),
    Named(Arc<NamedType>),
}

impl Type {
    pub const BOOL: Type = Type::Basic(Kind::Bool);
    pub const INT: Type = Type::Basic(Kind::Int);
    pub const INT32: Type = Type::Basic(Kind::Int32);
    pub const INT64: Type = Type::Basic(Kind::Int64);
    pub const UINT: Type = Type::Basic(Kind::Uint);
    pub const FLOAT64: Type = Type::Basic(Kind::Float64);
    pub const COMPLEX128: Type = Type::Basic(Kind::Complex128);
    pub const STRING: Type = Type::Basic(Kind::String);

    pub fn slice_of(elem: Type) -> Type {
        Type::Slice(Arc::new(elem))
    }

    pub fn ptr_to(elem: Type) -> Type {
        Type::Ptr(Arc::new(elem))
    }

    pub fn func(params: Vec<Type>, results: Vec<Type>, variadic: bool) -> Type {
        Type::Func(Arc::new(FuncType {
            params,
            results,
            variadic,
        }))
    }

    pub fn named(pkg_path: &str, name: &str, underlying: Type) -> Type {
        Type::Named(Arc::new(NamedType {
            pkg_path: pkg_path.to_string(),
            name: name.to_string(),
            underlying,
        }))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Type::Basic(k) => *k,
            Type::Any => Kind::Interface,
            Type::Slice(_) => Kind::Slice,
            Type::Ptr(_) => Kind::Ptr,
            Type::Func(_) => Kind::Func,
            Type::Struct(_) => Kind::Struct,
            Type::Named(n) => n.underlying.kind(),
        }
    }

    /// The type with any `Named` wrapper peeled off.
    pub fn underlying(&self) -> &Type {
        match self {
            Type::Named(n) => n.underlying.underlying(),
            other => other,
        }
    }

    pub fn elem(&self) -> Option<&Type> {
        match self.underlying() {
            Type::Slice(e) | Type::Ptr(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&Arc<FuncType>> {
        match self.underlying() {
            Type::Func(f) => Some(f),
            _ => None,
        }
    }

    /// Count pointer indirections and return the pointed-to base type.
    pub fn count_ptr(&self) -> (usize, &Type) {
        let mut n = 0;
        let mut t = self;
        while let Type::Ptr(elem) = t {
            t = elem;
            n += 1;
        }
        (n, t)
    }

    /// Field lookup on a struct (or named struct) type.
    pub fn field(&self, name: &str) -> Option<(usize, &Type)> {
        match self.underlying() {
            Type::Struct(st) => st
                .fields
                .iter()
                .enumerate()
                .find(|(_, f)| f.name == name)
                .map(|(i, f)| (i, &f.ty)),
            _ => None,
        }
    }

    /// Whether a value of type `self` may be stored in a slot of type `target`.
    pub fn assignable_to(&self, target: &Type) -> bool {
        matches!(target, Type::Any) || self == target
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Basic(k) => write!(f, "{}", k),
            Type::Any => f.write_str("any"),
            Type::Slice(e) => write!(f, "[]{}", e),
            Type::Ptr(e) => write!(f, "*{}", e),
            Type::Func(ft) => write!(f, "{}", ft),
            Type::Struct(st) => {
                f.write_str("struct { ")?;
                for field in &st.fields {
                    write!(f, "{} {}; ", field.name, field.ty)?;
                }
                f.write_str("}")
            }
            Type::Named(n) => {
                if n.pkg_path.is_empty() {
                    write!(f, "{}", n.name)
                } else {
                    write!(f, "{}.{}", n.pkg_path, n.name)
                }
            }
        }
    }
}

/// Signature of a function: parameter types, result types, variadic flag.
///
/// For a variadic signature the last parameter is the slice type that
/// receives the trailing arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
    pub variadic: bool,
}

impl FuncType {
    /// Element type of the trailing variadic parameter.
    pub fn variadic_elem(&self) -> Option<&Type> {
        if !self.variadic {
            return None;
        }
        self.params.last().and_then(Type::elem)
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("func(")?;
        let last = self.params.len().saturating_sub(1);
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match (self.variadic && i == last, p.elem()) {
                (true, Some(elem)) => write!(f, "...{}", elem)?,
                _ => write!(f, "{}", p)?,
            }
        }
        f.write_str(")")?;
        match self.results.len() {
            0 => Ok(()),
            1 => write!(f, " {}", self.results[0]),
            _ => {
                f.write_str(" (")?;
                for (i, r) in self.results.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// A named type declared by a native package.
///
/// Identity is the `(pkg_path, name)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedType {
    pub pkg_path: String,
    pub name: String,
    pub underlying: Type,
}

impl PartialEq for NamedType {
    fn eq(&self, other: &Self) -> bool {
        self.pkg_path == other.pkg_path && self.name == other.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_through_u8() {
        for n in 0..BASIC_KINDS as u8 {
            let kind = Kind::from_u8(n).unwrap();
            assert_eq!(kind as u8, n);
            assert!(kind.is_basic());
        }
        assert_eq!(Kind::from_u8(BASIC_KINDS as u8), None);
    }

    #[test]
    fn test_rank_orders_categories() {
        assert!(Kind::Int8.rank() < Kind::Float32.rank());
        assert!(Kind::Float64.rank() < Kind::Complex64.rank());
        assert_eq!(Kind::String.rank(), 0);
        assert_eq!(ConstKind::UnboundFloat.rank(), Kind::Float64.rank());
    }

    #[test]
    fn test_count_ptr() {
        let point = Type::named("geo", "Point", Type::INT);
        let pp = Type::ptr_to(Type::ptr_to(point.clone()));
        let (n, base) = pp.count_ptr();
        assert_eq!(n, 2);
        assert_eq!(base, &point);
    }

    #[test]
    fn test_named_identity_ignores_underlying_clone() {
        let a = Type::named("geo", "Point", Type::INT);
        let b = Type::named("geo", "Point", Type::INT);
        let c = Type::named("other", "Point", Type::INT);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.kind(), Kind::Int);
    }

    #[test]
    fn test_assignable_to_any() {
        assert!(Type::STRING.assignable_to(&Type::Any));
        assert!(Type::INT.assignable_to(&Type::INT));
        assert!(!Type::INT.assignable_to(&Type::INT64));
    }

    #[test]
    fn test_func_type_display() {
        let ft = FuncType {
            params: vec![Type::STRING, Type::slice_of(Type::Any)],
            results: vec![Type::INT, Type::BOOL],
            variadic: true,
        };
        assert_eq!(ft.to_string(), "func(string, ...any) (int, bool)");
        assert_eq!(ft.variadic_elem(), Some(&Type::Any));
    }
}
