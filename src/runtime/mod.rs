pub mod adapter;
pub mod builtin;
pub mod builtin_ops;
pub mod closure;
pub mod context;
pub mod native;
pub mod runtime_error;
pub mod stack;
pub mod vm;

pub use context::Context;
pub use native::{NativeFunc, NativePackage, NativeVar};
pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use vm::{Executable, VmConfig};
