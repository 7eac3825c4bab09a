use crate::lang::value::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    StackUnderflow,
    Type,
    DivisionByZero,
    VariableNotGlobal,
    NotCallable,
    Arity,
    LimitExceeded,
    Native,
    Verify,
    Internal,
}

#[derive(Debug, Clone, Error)]
#[error("runtime error: {message}{}", call_stack_lines(.call_stack))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub call_stack: Vec<String>,
}

fn call_stack_lines(frames: &[String]) -> String {
    if frames.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  call stack:");
    for (i, frame) in frames.iter().enumerate() {
        out.push_str(&format!("\n    {}: {}", i, frame));
    }
    out
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, msg: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: msg.into(),
            call_stack: Vec::new(),
        }
    }

    /// Record the frame the error passed through, innermost first.
    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    pub fn stack_underflow(what: impl fmt::Display) -> Self {
        Self::new(
            RuntimeErrorKind::StackUnderflow,
            format!("stack underflow in {}", what),
        )
    }

    pub fn type_error(expected: impl fmt::Display, got: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::Type,
            format!("type error: expected {}, got {}", expected, got.type_of()),
        )
    }

    pub fn division_by_zero() -> Self {
        Self::new(RuntimeErrorKind::DivisionByZero, "integer divide by zero")
    }

    pub fn not_global() -> Self {
        Self::new(
            RuntimeErrorKind::VariableNotGlobal,
            "variable not defined, or not a global variable",
        )
    }

    pub fn not_callable(got: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::NotCallable,
            format!("cannot call value of type {}", got.type_of()),
        )
    }

    pub fn arity(callee: &str, expected: usize, got: usize) -> Self {
        Self::new(
            RuntimeErrorKind::Arity,
            format!(
                "wrong argument count in call to {}: expected {}, got {}",
                callee, expected, got
            ),
        )
    }

    pub fn limit(msg: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::LimitExceeded, msg)
    }

    pub fn native(msg: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Native, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_call_stack() {
        let err = RuntimeError::division_by_zero();
        assert_eq!(err.to_string(), "runtime error: integer divide by zero");
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
    }

    #[test]
    fn test_with_context_builds_call_stack() {
        let err = RuntimeError::native("boom")
            .with_context("inner")
            .with_context("outer");
        let msg = err.to_string();
        assert!(msg.contains("call stack:"));
        assert!(msg.contains("0: inner"));
        assert!(msg.contains("1: outer"));
    }

    #[test]
    fn test_type_error_names_dynamic_type() {
        let err = RuntimeError::type_error("int", &Value::String("s".into()));
        assert!(err.message.contains("expected int, got string"));
    }

    #[test]
    fn test_not_global_message() {
        assert_eq!(
            RuntimeError::not_global().message,
            "variable not defined, or not a global variable"
        );
    }
}
