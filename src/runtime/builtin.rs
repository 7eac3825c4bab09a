//! The universe package: built-in functions visible without an import.

use crate::lang::value::Value;
use crate::runtime::adapter::{IntoNative, IntoNativeVariadic};
use crate::runtime::native::{NativePackage, RegistryError};
use crate::runtime::runtime_error::RuntimeError;
use std::io::Write;
use std::sync::OnceLock;

/// Import path of the universe package.
pub const UNIVERSE: &str = "";

static INSTALLED: OnceLock<Result<(), RegistryError>> = OnceLock::new();

/// Register the universe package once per process.
pub fn install() -> Result<(), RegistryError> {
    INSTALLED.get_or_init(register).clone()
}

fn register() -> Result<(), RegistryError> {
    let pkg = NativePackage::new(UNIVERSE)?;
    pkg.register_funcvs(vec![
        ("print", print.into_native_variadic()),
        ("println", println.into_native_variadic()),
    ])?;
    pkg.register_funcs(vec![("len", len.into_native())])?;
    Ok(())
}

/// Operands separated by a space when neither side is a string.
fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        let is_str = matches!(arg, Value::String(_));
        if i > 0 && !is_str && !matches!(args[i - 1], Value::String(_)) {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    out
}

/// Operands always separated by a space, newline appended.
fn sprintln(args: &[Value]) -> String {
    let mut out = args
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    out.push('\n');
    out
}

fn write_stdout(text: &str) -> Result<i64, RuntimeError> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| RuntimeError::native(format!("write to stdout: {}", e)))?;
    Ok(text.len() as i64)
}

fn print(args: Vec<Value>) -> Result<i64, RuntimeError> {
    write_stdout(&sprint(&args))
}

fn println(args: Vec<Value>) -> Result<i64, RuntimeError> {
    write_stdout(&sprintln(&args))
}

fn len(value: Value) -> Result<i64, RuntimeError> {
    match &value {
        Value::String(s) => Ok(s.len() as i64),
        Value::Slice(s) => Ok(s.items.len() as i64),
        Value::Nil => Ok(0),
        other => Err(RuntimeError::type_error("string or slice", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::types::Type;
    use crate::runtime::native::{SymbolKind, find_package};

    #[test]
    fn test_install_is_idempotent() {
        install().unwrap();
        install().unwrap();
        let pkg = find_package(UNIVERSE).unwrap();
        assert!(matches!(pkg.find("println"), Some((_, SymbolKind::Funcv))));
        assert!(matches!(pkg.find("print"), Some((_, SymbolKind::Funcv))));
        assert!(matches!(pkg.find("len"), Some((_, SymbolKind::Func))));
    }

    #[test]
    fn test_sprint_spacing() {
        let args = vec![
            Value::Int(1),
            Value::Int(2),
            Value::String("x".into()),
            Value::Int(3),
        ];
        assert_eq!(sprint(&args), "1 2x3");
        assert_eq!(sprintln(&args), "1 2 x 3\n");
        assert_eq!(sprintln(&[]), "\n");
    }

    #[test]
    fn test_len() {
        assert_eq!(len(Value::String("héllo".into())).unwrap(), 6);
        assert_eq!(
            len(Value::slice(Type::INT, vec![Value::Int(1), Value::Int(2)])).unwrap(),
            2
        );
        assert!(len(Value::Int(1)).is_err());
    }
}
