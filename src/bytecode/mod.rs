pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod func;
pub mod instr;
pub mod op;
pub mod program;
pub mod stack_check_error;

pub use compile::{CompilerConfig, compile, compile_with};
pub use compile_error::{BuildError, CompileError};
pub use instr::{Instr, Opcode};
pub use op::Operator;
pub use program::{Builder, Program};
