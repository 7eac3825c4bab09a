use super::ast::{BasicLit, LitKind};
use super::types::{ConstKind, Kind};
use super::value::{Complex, Value};
use crate::bytecode::compile_error::CompileError;
use std::fmt;

/// A compile-time constant.
///
/// `Bound` constants already have their runtime representation. The other
/// variants are untyped numeric literals (or folds of them) held at extended
/// precision until context chooses a kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Bound(Value),
    Int(i128),
    Float(f64),
    Complex(Complex<f64>),
}

impl Constant {
    pub fn kind(&self) -> ConstKind {
        match self {
            Constant::Bound(v) => ConstKind::Bound(v.kind()),
            Constant::Int(_) => ConstKind::UnboundInt,
            Constant::Float(_) => ConstKind::UnboundFloat,
            Constant::Complex(_) => ConstKind::UnboundComplex,
        }
    }

    /// Bind to the default kind of the constant's category.
    pub fn bind_default(&self) -> Result<Value, CompileError> {
        self.bind(self.kind().default_kind())
    }

    /// Produce the runtime value of this constant as `kind`.
    ///
    /// Fails if the value cannot be represented exactly (integer overflow,
    /// a float with a fractional part bound to an integer kind, a complex
    /// with an imaginary part bound to a real kind).
    pub fn bind(&self, kind: Kind) -> Result<Value, CompileError> {
        match self {
            Constant::Bound(v) if v.kind() == kind => Ok(v.clone()),
            Constant::Bound(v) => Err(CompileError::const_not_representable(v.to_string(), kind)),
            Constant::Int(n) => bind_int(*n, kind),
            Constant::Float(f) => {
                if kind.is_integer() {
                    if f.fract() != 0.0 || !f.is_finite() {
                        return Err(CompileError::const_truncated(self.to_string(), kind));
                    }
                    return bind_int(*f as i128, kind);
                }
                bind_float(*f, kind).ok_or_else(|| {
                    CompileError::const_not_representable(self.to_string(), kind)
                })
            }
            Constant::Complex(c) => {
                if kind.is_complex() {
                    return Ok(Value::Complex128(*c)
                        .convert(kind)
                        .unwrap_or(Value::Complex128(*c)));
                }
                if c.im != 0.0 {
                    return Err(CompileError::const_not_representable(self.to_string(), kind));
                }
                Constant::Float(c.re).bind(kind)
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Constant::Int(n) => *n == 0,
            Constant::Float(f) => *f == 0.0,
            Constant::Complex(c) => c.re == 0.0 && c.im == 0.0,
            Constant::Bound(v) => {
                v.as_i64() == Some(0)
                    || v.as_u64() == Some(0)
                    || v.as_f64() == Some(0.0)
                    || v.as_complex() == Some(Complex::new(0.0, 0.0))
            }
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Bound(Value::String(s)) => write!(f, "{:?}", s),
            Constant::Bound(v) => write!(f, "{}", v),
            Constant::Int(n) => write!(f, "{}", n),
            Constant::Float(x) => write!(f, "{}", x),
            Constant::Complex(c) => write!(f, "{}", c),
        }
    }
}

fn bind_int(n: i128, kind: Kind) -> Result<Value, CompileError> {
    let out_of_range = || CompileError::const_overflow(n.to_string(), kind);
    let value = match kind {
        Kind::Int => Value::Int(i64::try_from(n).map_err(|_| out_of_range())?),
        Kind::Int8 => Value::Int8(i8::try_from(n).map_err(|_| out_of_range())?),
        Kind::Int16 => Value::Int16(i16::try_from(n).map_err(|_| out_of_range())?),
        Kind::Int32 => Value::Int32(i32::try_from(n).map_err(|_| out_of_range())?),
        Kind::Int64 => Value::Int64(i64::try_from(n).map_err(|_| out_of_range())?),
        Kind::Uint => Value::Uint(u64::try_from(n).map_err(|_| out_of_range())?),
        Kind::Uint8 => Value::Uint8(u8::try_from(n).map_err(|_| out_of_range())?),
        Kind::Uint16 => Value::Uint16(u16::try_from(n).map_err(|_| out_of_range())?),
        Kind::Uint32 => Value::Uint32(u32::try_from(n).map_err(|_| out_of_range())?),
        Kind::Uint64 => Value::Uint64(u64::try_from(n).map_err(|_| out_of_range())?),
        k => {
            return bind_float(n as f64, k)
                .ok_or_else(|| CompileError::const_not_representable(n.to_string(), k));
        }
    };
    Ok(value)
}

fn bind_float(f: f64, kind: Kind) -> Option<Value> {
    match kind {
        Kind::Float32 => Some(Value::Float32(f as f32)),
        Kind::Float64 => Some(Value::Float64(f)),
        Kind::Complex64 => Some(Value::Complex64(Complex::new(f as f32, 0.0))),
        Kind::Complex128 => Some(Value::Complex128(Complex::new(f, 0.0))),
        _ => None,
    }
}

// =============================================================================
// Literal conversion
// =============================================================================

/// Convert a literal token to a constant.
///
/// Integer, float and imaginary literals stay unbound. Character literals
/// are bound runes (`int32`), string literals are bound strings.
pub fn to_const(lit: &BasicLit) -> Result<Constant, CompileError> {
    let text = lit.value.as_str();
    match lit.kind {
        LitKind::Int => parse_int(text)
            .map(Constant::Int)
            .ok_or_else(|| CompileError::invalid_literal(text, "malformed integer")),
        LitKind::Float => parse_float(text)
            .map(Constant::Float)
            .ok_or_else(|| CompileError::invalid_literal(text, "malformed float")),
        LitKind::Imag => {
            let digits = text
                .strip_suffix('i')
                .ok_or_else(|| CompileError::invalid_literal(text, "imaginary literal must end in 'i'"))?;
            let im = parse_float(digits)
                .or_else(|| parse_int(digits).map(|n| n as f64))
                .ok_or_else(|| CompileError::invalid_literal(text, "malformed imaginary"))?;
            Ok(Constant::Complex(Complex::new(0.0, im)))
        }
        LitKind::Char => {
            let inner = text
                .strip_prefix('\'')
                .and_then(|t| t.strip_suffix('\''))
                .ok_or_else(|| CompileError::invalid_literal(text, "unterminated character"))?;
            let decoded =
                unescape(inner, '\'').map_err(|why| CompileError::invalid_literal(text, why))?;
            let mut chars = decoded.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Constant::Bound(Value::Int32(c as i32))),
                _ => Err(CompileError::invalid_literal(
                    text,
                    "character literal must hold exactly one character",
                )),
            }
        }
        LitKind::String => unquote(text)
            .map(|s| Constant::Bound(Value::String(s)))
            .map_err(|why| CompileError::invalid_literal(text, why)),
    }
}

/// Parse an integer literal with an inferred base (`0x`, `0o`, `0b`, legacy `0` octal).
///
/// Values above `i64::MAX` are kept as long as they fit in `u64`.
fn parse_int(text: &str) -> Option<i128> {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    let (digits, radix) = match clean.get(..2) {
        Some("0x") | Some("0X") => (&clean[2..], 16),
        Some("0o") | Some("0O") => (&clean[2..], 8),
        Some("0b") | Some("0B") => (&clean[2..], 2),
        _ if clean.len() > 1 && clean.starts_with('0') => (&clean[1..], 8),
        _ => (clean.as_str(), 10),
    };
    if digits.is_empty() {
        return None;
    }
    match i64::from_str_radix(digits, radix) {
        Ok(n) => Some(n as i128),
        Err(_) => u64::from_str_radix(digits, radix).ok().map(|n| n as i128),
    }
}

fn parse_float(text: &str) -> Option<f64> {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    clean.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Interpret a quoted string literal: `"..."` with escapes, or a raw `` `...` `` literal.
pub fn unquote(text: &str) -> Result<String, &'static str> {
    if let Some(raw) = text.strip_prefix('`').and_then(|t| t.strip_suffix('`')) {
        return Ok(raw.replace('\r', ""));
    }
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or("unterminated string")?;
    unescape(inner, '"')
}

fn unescape(s: &str, quote: char) -> Result<String, &'static str> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == quote {
            return Err("unescaped quote");
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        let esc = chars.next().ok_or("trailing backslash")?;
        let decoded = match esc {
            'a' => '\u{07}',
            'b' => '\u{08}',
            'f' => '\u{0C}',
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            'v' => '\u{0B}',
            '\\' => '\\',
            '\'' if quote == '\'' => '\'',
            '"' if quote == '"' => '"',
            'x' => hex_escape(&mut chars, 2)?,
            'u' => hex_escape(&mut chars, 4)?,
            'U' => hex_escape(&mut chars, 8)?,
            d @ '0'..='7' => {
                let mut n = d.to_digit(8).ok_or("bad octal escape")?;
                for _ in 0..2 {
                    let next = chars.next().and_then(|c| c.to_digit(8));
                    n = n * 8 + next.ok_or("bad octal escape")?;
                }
                char::from_u32(n).ok_or("bad octal escape")?
            }
            _ => return Err("unknown escape sequence"),
        };
        out.push(decoded);
    }
    Ok(out)
}

fn hex_escape(chars: &mut std::str::Chars<'_>, width: usize) -> Result<char, &'static str> {
    let mut n = 0u32;
    for _ in 0..width {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or("bad hex escape")?;
        n = n * 16 + digit;
    }
    char::from_u32(n).ok_or("escape is not a valid character")
}
