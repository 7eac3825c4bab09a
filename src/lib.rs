//! Quill: an embeddable, statically typed scripting core.
//!
//! A host builds a syntax tree ([`lang::ast::File`]), compiles it to a
//! [`Program`] and runs it on an [`Executable`]:
//!
//! ```no_run
//! use quill::lang::ast::{Expr, File, Stmt};
//! use quill::{Executable, compile};
//!
//! let file = File::with_stmts(vec![Stmt::define(&["x"], vec![Expr::int("40")])]);
//! let program = compile(&file)?;
//! let ctx = Executable::new(program)?.run()?;
//! println!("{}", ctx.global_value("x")?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Host functions and variables are registered per package with
//! [`NativePackage`] and become importable by path.

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::{CompileError, CompilerConfig, Program, compile, compile_with};
pub use runtime::{Context, Executable, NativePackage, RuntimeError, VmConfig};
