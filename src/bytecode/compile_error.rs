use crate::bytecode::op::Operator;
use crate::lang::types::Kind;
use crate::runtime::native::RegistryError;
use thiserror::Error;

fn hint_line(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("compile error: undefined: {name}{}", hint_line(.hint))]
    Unresolved { name: String, hint: Option<String> },

    #[error("compile error: '{name}' redeclared in this block")]
    Redefined { name: String },

    #[error("compile error: cannot assign to undeclared name '{name}'{}", hint_line(.hint))]
    AssignUndeclared { name: String, hint: Option<String> },

    #[error("compile error: cannot assign to {target}")]
    InvalidAssignTarget { target: String },

    #[error(
        "compile error: wrong argument count in call to {callee}: expected {expected}, got {got}"
    )]
    ArityMismatch {
        callee: String,
        expected: String,
        got: usize,
    },

    #[error("compile error: cannot use {got} as {expected} in {context}")]
    TypeMismatch {
        expected: String,
        got: String,
        context: String,
    },

    #[error("compile error: operator {op} not defined on {kind}")]
    OperatorNotDefined { op: Operator, kind: Kind },

    #[error("compile error: invalid shift count of kind {kind} for operator {op}")]
    InvalidShiftCount { op: Operator, kind: Kind },

    #[error("compile error: mismatched kinds {left} and {right} for operator {op}")]
    MismatchedKinds { op: Operator, left: Kind, right: Kind },

    #[error(
        "compile error: operator {op} needs at least one operand of known kind{}",
        hint_line(.hint)
    )]
    UnboundOperands { op: Operator, hint: Option<String> },

    #[error("compile error: constant {value} overflows {kind}")]
    ConstOverflow { value: String, kind: Kind },

    #[error("compile error: constant {value} truncated to {kind}")]
    ConstTruncated { value: String, kind: Kind },

    #[error("compile error: cannot represent constant {value} as {kind}")]
    ConstNotRepresentable { value: String, kind: Kind },

    #[error("compile error: constant division by zero")]
    ConstDivisionByZero,

    #[error("compile error: invalid literal {text}: {reason}")]
    InvalidLiteral { text: String, reason: String },

    #[error("compile error: cannot call non-function {what}")]
    NotCallable { what: String },

    #[error("compile error: {base} has no field or method {member}")]
    MemberNotFound { base: String, member: String },

    #[error("compile error: malformed receiver {recv}{}", hint_line(.hint))]
    MalformedReceiver { recv: String, hint: Option<String> },

    #[error("compile error: {what} is not a value")]
    NotAValue { what: String },

    #[error("compile error: assignment mismatch: {lhs} variables but {rhs} values")]
    ValueCount { lhs: usize, rhs: usize },

    #[error("compile error: multiple-value {what} in single-value context")]
    MultiValue { what: String },

    #[error("compile error: return statement outside function")]
    ReturnOutsideFunction,

    #[error("compile error: not enough return values in {func}{}", hint_line(.hint))]
    BareReturn { func: String, hint: Option<String> },

    #[error(
        "compile error: wrong number of return values in {func}: expected {expected}, got {got}"
    )]
    ReturnCount {
        func: String,
        expected: usize,
        got: usize,
    },

    #[error(
        "compile error: cannot capture parameter '{name}' of an enclosing function{}",
        hint_line(.hint)
    )]
    CaptureParameter { name: String, hint: Option<String> },

    #[error("compile error: package \"{path}\" not found")]
    PackageNotFound { path: String },

    #[error("compile error: unknown type {name}")]
    UnknownType { name: String },

    #[error("compile error: {what} is not supported{}", hint_line(.hint))]
    Unsupported { what: String, hint: Option<String> },

    #[error("compile error: {0}")]
    Build(#[from] BuildError),

    #[error("compile error: {0}")]
    Registry(#[from] RegistryError),

    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unresolved(name: &str) -> Self {
        CompileError::Unresolved {
            name: name.to_string(),
            hint: None,
        }
    }

    pub fn assign_undeclared(name: &str) -> Self {
        CompileError::AssignUndeclared {
            name: name.to_string(),
            hint: Some(format!("use '{} := ...' to declare a new variable", name)),
        }
    }

    pub fn arity(callee: impl Into<String>, expected: impl Into<String>, got: usize) -> Self {
        CompileError::ArityMismatch {
            callee: callee.into(),
            expected: expected.into(),
            got,
        }
    }

    pub fn type_mismatch(
        expected: impl ToString,
        got: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        CompileError::TypeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
            context: context.into(),
        }
    }

    pub fn operator_not_defined(op: Operator, kind: Kind) -> Self {
        CompileError::OperatorNotDefined { op, kind }
    }

    pub fn invalid_shift_count(op: Operator, kind: Kind) -> Self {
        CompileError::InvalidShiftCount { op, kind }
    }

    pub fn mismatched_kinds(op: Operator, left: Kind, right: Kind) -> Self {
        CompileError::MismatchedKinds { op, left, right }
    }

    pub fn unbound_operands(op: Operator) -> Self {
        CompileError::UnboundOperands {
            op,
            hint: Some("bind one operand to a typed variable first".to_string()),
        }
    }

    pub fn const_overflow(value: String, kind: Kind) -> Self {
        CompileError::ConstOverflow { value, kind }
    }

    pub fn const_truncated(value: String, kind: Kind) -> Self {
        CompileError::ConstTruncated { value, kind }
    }

    pub fn const_not_representable(value: String, kind: Kind) -> Self {
        CompileError::ConstNotRepresentable { value, kind }
    }

    pub fn invalid_literal(text: &str, reason: impl Into<String>) -> Self {
        CompileError::InvalidLiteral {
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_callable(what: impl ToString) -> Self {
        CompileError::NotCallable {
            what: what.to_string(),
        }
    }

    pub fn member_not_found(base: impl ToString, member: &str) -> Self {
        CompileError::MemberNotFound {
            base: base.to_string(),
            member: member.to_string(),
        }
    }

    pub fn not_a_value(what: impl ToString) -> Self {
        CompileError::NotAValue {
            what: what.to_string(),
        }
    }

    pub fn multi_value(what: impl Into<String>) -> Self {
        CompileError::MultiValue { what: what.into() }
    }

    pub fn bare_return(func: &str) -> Self {
        CompileError::BareReturn {
            func: func.to_string(),
            hint: Some("a bare return requires named results".to_string()),
        }
    }

    pub fn capture_parameter(name: &str) -> Self {
        CompileError::CaptureParameter {
            name: name.to_string(),
            hint: Some(format!(
                "copy it into a local first: '{0}_ := {0}'",
                name
            )),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        CompileError::Unsupported {
            what: what.into(),
            hint: None,
        }
    }

    pub fn unsupported_with_hint(what: impl Into<String>, hint: impl Into<String>) -> Self {
        CompileError::Unsupported {
            what: what.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

/// Failures detected while assembling functions into a finished program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("function {name} defined twice")]
    FuncRedefined { name: String },

    #[error("EndFunc({got}) does not match DefineFunc({expected})")]
    UnpairedEnd { expected: String, got: String },

    #[error("function {name} is still open")]
    FuncOpen { name: String },

    #[error("function {name} is referenced but never defined")]
    UndefinedFunc { name: String },

    #[error("function {name}: variadic flag mismatch")]
    VariadicMismatch { name: String },

    #[error("function {name}: last parameter of a variadic function must be a slice")]
    VargsNotSlice { name: String },

    #[error("function {name}: results must be declared before any local variable")]
    ResultsAfterVars { name: String },

    #[error("instruction slot {offset} patched twice")]
    DoublePatch { offset: usize },

    #[error("instruction slot {offset} reserved but never patched")]
    Unpatched { offset: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_display() {
        let err = CompileError::unresolved("foo");
        let msg = err.to_string();
        assert!(msg.starts_with("compile error:"));
        assert!(msg.contains("undefined: foo"));
        assert!(!msg.contains("hint"));
    }

    #[test]
    fn test_assign_undeclared_has_hint() {
        let msg = CompileError::assign_undeclared("x").to_string();
        assert!(msg.contains("undeclared name 'x'"));
        assert!(msg.contains("\n  hint: use 'x := ...'"));
    }

    #[test]
    fn test_operator_errors_mention_operator_and_kind() {
        let msg = CompileError::operator_not_defined(Operator::Sub, Kind::String).to_string();
        assert!(msg.contains('-'));
        assert!(msg.contains("string"));

        let msg =
            CompileError::mismatched_kinds(Operator::Add, Kind::Int, Kind::Int64).to_string();
        assert!(msg.contains("int and int64"));
    }

    #[test]
    fn test_build_error_wraps() {
        let err: CompileError = BuildError::UndefinedFunc {
            name: "b".to_string(),
        }
        .into();
        assert!(matches!(err, CompileError::Build(_)));
        assert!(err.to_string().contains("referenced but never defined"));
    }

    #[test]
    fn test_capture_parameter_hint() {
        let msg = CompileError::capture_parameter("n").to_string();
        assert!(msg.contains("parameter 'n'"));
        assert!(msg.contains("n_ := n"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::internal("test");
        let _: &dyn std::error::Error = &err;
    }

    #[test]
    fn test_error_clone() {
        let err1 = CompileError::bare_return("f");
        let err2 = err1.clone();
        assert_eq!(err1.to_string(), err2.to_string());
    }
}
