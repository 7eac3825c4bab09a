use crate::bytecode::func::FuncId;
use crate::lang::types::FuncType;
use crate::lang::value::Value;
use crate::runtime::context::Context;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::stack::Stack;
use crate::runtime::vm::{Executable, host_depth};
use std::fmt;
use std::sync::Arc;

/// A script function paired with the frame it was created in.
pub struct Closure {
    exe: Arc<Executable>,
    func: FuncId,
    parent: Arc<Context>,
    signature: Arc<FuncType>,
}

impl Closure {
    pub(crate) fn new(exe: Arc<Executable>, func: FuncId, parent: Arc<Context>) -> Closure {
        let signature = exe.signature_of(func);
        Closure {
            exe,
            func,
            parent,
            signature,
        }
    }

    pub fn signature(&self) -> &Arc<FuncType> {
        &self.signature
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn executable(&self) -> &Arc<Executable> {
        &self.exe
    }

    pub fn parent(&self) -> &Arc<Context> {
        &self.parent
    }

    /// Run the closure on a fresh stack.
    ///
    /// Variadic closures expect the trailing arguments already packed into
    /// the last slot. When called back from native code the call depth of
    /// the VM that entered the native carries over.
    pub fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        let info = self.exe.program().func(self.func);
        if args.len() != info.num_in() {
            return Err(RuntimeError::arity(&info.name, info.num_in(), args.len()));
        }
        let mut stack = Stack::with_depth(host_depth());
        for arg in args {
            stack.push(arg);
        }
        self.exe
            .call_func(self.func, self.parent.clone(), &mut stack)?;
        Ok(stack.into_vec())
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Closure({} {})",
            self.exe.program().func(self.func).name,
            self.signature
        )
    }
}
