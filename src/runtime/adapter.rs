//! Typed adapters from Rust functions to [`NativeFunc`].
//!
//! `IntoNative` covers fixed-arity functions, `IntoNativeVariadic` covers
//! functions whose last parameter is a `Vec<T>` receiving the packed
//! trailing arguments.

use crate::lang::types::{FuncType, Kind, Type};
use crate::lang::value::{Complex, Value};
use crate::runtime::native::NativeFunc;
use crate::runtime::runtime_error::RuntimeError;

/// A Rust type with a fixed script type.
pub trait Native: Sized {
    fn native_type() -> Type;
    fn from_value(value: Value) -> Result<Self, RuntimeError>;
    fn into_value(self) -> Value;
}

macro_rules! native_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Native for $t {
                fn native_type() -> Type {
                    Type::Basic(Kind::$variant)
                }

                fn from_value(value: Value) -> Result<Self, RuntimeError> {
                    match value {
                        Value::$variant(x) => Ok(x),
                        other => Err(RuntimeError::type_error(Kind::$variant, &other)),
                    }
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }
        )*
    };
}

native_scalar! {
    bool => Bool,
    i64 => Int,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    u64 => Uint,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    f32 => Float32,
    f64 => Float64,
    Complex<f32> => Complex64,
    Complex<f64> => Complex128,
    String => String,
}

/// Any value, unchecked.
impl Native for Value {
    fn native_type() -> Type {
        Type::Any
    }

    fn from_value(value: Value) -> Result<Self, RuntimeError> {
        Ok(value)
    }

    fn into_value(self) -> Value {
        self
    }
}

impl<T: Native> Native for Vec<T> {
    fn native_type() -> Type {
        Type::slice_of(T::native_type())
    }

    fn from_value(value: Value) -> Result<Self, RuntimeError> {
        match value {
            Value::Nil => Ok(Vec::new()),
            Value::Slice(s) => s.items.iter().cloned().map(T::from_value).collect(),
            other => Err(RuntimeError::type_error(Self::native_type(), &other)),
        }
    }

    fn into_value(self) -> Value {
        Value::slice(
            T::native_type(),
            self.into_iter().map(Native::into_value).collect(),
        )
    }
}

/// Result side of an adapted function.
pub trait NativeReturn {
    fn result_types() -> Vec<Type>;
    fn into_values(self) -> Result<Vec<Value>, RuntimeError>;
}

impl NativeReturn for () {
    fn result_types() -> Vec<Type> {
        Vec::new()
    }

    fn into_values(self) -> Result<Vec<Value>, RuntimeError> {
        Ok(Vec::new())
    }
}

impl<T: Native> NativeReturn for T {
    fn result_types() -> Vec<Type> {
        vec![T::native_type()]
    }

    fn into_values(self) -> Result<Vec<Value>, RuntimeError> {
        Ok(vec![self.into_value()])
    }
}

impl<A: Native, B: Native> NativeReturn for (A, B) {
    fn result_types() -> Vec<Type> {
        vec![A::native_type(), B::native_type()]
    }

    fn into_values(self) -> Result<Vec<Value>, RuntimeError> {
        Ok(vec![self.0.into_value(), self.1.into_value()])
    }
}

impl<R: NativeReturn> NativeReturn for Result<R, RuntimeError> {
    fn result_types() -> Vec<Type> {
        R::result_types()
    }

    fn into_values(self) -> Result<Vec<Value>, RuntimeError> {
        self?.into_values()
    }
}

pub trait IntoNative<Args> {
    fn into_native(self) -> NativeFunc;
}

pub trait IntoNativeVariadic<Args> {
    fn into_native_variadic(self) -> NativeFunc;
}

fn next_arg(args: &mut std::vec::IntoIter<Value>) -> Result<Value, RuntimeError> {
    args.next()
        .ok_or_else(|| RuntimeError::native("missing native argument"))
}

macro_rules! impl_into_native {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> IntoNative<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: NativeReturn,
            $($arg: Native,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_native(self) -> NativeFunc {
                let params: Vec<Type> = vec![$($arg::native_type()),*];
                let sig = FuncType {
                    params,
                    results: Ret::result_types(),
                    variadic: false,
                };
                NativeFunc::new(sig, move |args: Vec<Value>| {
                    let mut args = args.into_iter();
                    $(let $arg = $arg::from_value(next_arg(&mut args)?)?;)*
                    (self)($($arg),*).into_values()
                })
            }
        }

        impl<Func, Ret, Elem, $($arg,)*> IntoNativeVariadic<($($arg,)* Vec<Elem>,)> for Func
        where
            Func: Fn($($arg,)* Vec<Elem>) -> Ret + Send + Sync + 'static,
            Ret: NativeReturn,
            Elem: Native,
            $($arg: Native,)*
        {
            #[allow(non_snake_case, unused_mut)]
            fn into_native_variadic(self) -> NativeFunc {
                let params: Vec<Type> =
                    vec![$($arg::native_type(),)* Type::slice_of(Elem::native_type())];
                let sig = FuncType {
                    params,
                    results: Ret::result_types(),
                    variadic: true,
                };
                NativeFunc::new(sig, move |args: Vec<Value>| {
                    let mut args = args.into_iter();
                    $(let $arg = $arg::from_value(next_arg(&mut args)?)?;)*
                    let rest = Vec::<Elem>::from_value(next_arg(&mut args)?)?;
                    (self)($($arg,)* rest).into_values()
                })
            }
        }
    };
}

impl_into_native!();
impl_into_native!(A);
impl_into_native!(A, B);
impl_into_native!(A, B, C);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_adapter_signature_and_call() {
        let f = (|a: i64, b: i64| a * b).into_native();
        let sig = f.signature();
        assert_eq!(sig.params, vec![Type::INT, Type::INT]);
        assert_eq!(sig.results, vec![Type::INT]);
        assert!(!sig.variadic);
        assert_eq!(
            f.call(vec![Value::Int(6), Value::Int(7)]).unwrap(),
            vec![Value::Int(42)]
        );
    }

    #[test]
    fn test_zero_arity_unit_return() {
        let f = (|| ()).into_native();
        assert!(f.signature().params.is_empty());
        assert!(f.call(vec![]).unwrap().is_empty());
    }

    #[test]
    fn test_two_results() {
        let f = (|s: String| (s.len() as i64, s.is_empty())).into_native();
        assert_eq!(f.signature().results, vec![Type::INT, Type::BOOL]);
        assert_eq!(
            f.call(vec![Value::String("abc".into())]).unwrap(),
            vec![Value::Int(3), Value::Bool(false)]
        );
    }

    #[test]
    fn test_result_error_propagates() {
        let f = (|n: i64| -> Result<i64, RuntimeError> {
            if n < 0 {
                Err(RuntimeError::native("negative"))
            } else {
                Ok(n)
            }
        })
        .into_native();
        assert!(f.call(vec![Value::Int(-1)]).is_err());
        assert_eq!(f.call(vec![Value::Int(1)]).unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_variadic_adapter_receives_packed_slice() {
        let f = (|sep: String, parts: Vec<Value>| {
            parts
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .into_native_variadic();
        let sig = f.signature();
        assert!(sig.variadic);
        assert_eq!(sig.params, vec![Type::STRING, Type::slice_of(Type::Any)]);

        let packed = Value::slice(Type::Any, vec![Value::Int(1), Value::Bool(true)]);
        assert_eq!(
            f.call(vec![Value::String(",".into()), packed]).unwrap(),
            vec![Value::String("1,true".into())]
        );
    }

    #[test]
    fn test_variadic_nil_slice_is_empty() {
        let f = (|xs: Vec<i64>| xs.len() as i64).into_native_variadic();
        assert_eq!(f.call(vec![Value::Nil]).unwrap(), vec![Value::Int(0)]);
    }

    #[test]
    fn test_wrong_argument_kind_is_type_error() {
        let f = (|x: f64| x).into_native();
        assert!(f.call(vec![Value::Int(1)]).is_err());
    }
}
