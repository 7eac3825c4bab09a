use crate::bytecode::func::{FuncId, Var};
use crate::lang::types::Type;
use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::Executable;
use std::sync::{Arc, Mutex, MutexGuard};

/// One activation's variable frame.
///
/// Frames form a chain through `parent`: a closure keeps the frame it was
/// created in alive, so captured variables are shared by reference. The
/// root of every chain is the global context of the executable.
#[derive(Debug)]
pub struct Context {
    exe: Arc<Executable>,
    /// Function whose activation this is; `None` for the global context.
    func: Option<FuncId>,
    parent: Option<Arc<Context>>,
    vars: Mutex<Vec<Value>>,
    /// Stack length right after this activation's arguments.
    base: usize,
}

impl Context {
    pub(crate) fn new(
        exe: Arc<Executable>,
        func: Option<FuncId>,
        parent: Option<Arc<Context>>,
        base: usize,
        vars: Vec<Value>,
    ) -> Arc<Context> {
        Arc::new(Context {
            exe,
            func,
            parent,
            vars: Mutex::new(vars),
            base,
        })
    }

    pub fn executable(&self) -> &Arc<Executable> {
        &self.exe
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub(crate) fn base(&self) -> usize {
        self.base
    }

    /// Walk `n` frames up the parent chain.
    pub(crate) fn ancestor(&self, n: u32) -> Result<&Context, RuntimeError> {
        let mut ctx = self;
        for _ in 0..n {
            ctx = ctx
                .parent
                .as_deref()
                .ok_or_else(|| RuntimeError::internal("scope distance beyond the global context"))?;
        }
        Ok(ctx)
    }

    /// Like `ancestor`, as a shared handle.
    pub(crate) fn ancestor_handle(self: &Arc<Self>, n: u32) -> Result<Arc<Context>, RuntimeError> {
        let mut ctx = self.clone();
        for _ in 0..n {
            ctx = ctx
                .parent
                .clone()
                .ok_or_else(|| RuntimeError::internal("scope distance beyond the global context"))?;
        }
        Ok(ctx)
    }

    pub fn root(&self) -> &Context {
        let mut ctx = self;
        while let Some(parent) = ctx.parent.as_deref() {
            ctx = parent;
        }
        ctx
    }

    /// The root frame as a shared handle.
    pub(crate) fn global(self: &Arc<Self>) -> Arc<Context> {
        let mut ctx = self.clone();
        while let Some(parent) = ctx.parent.clone() {
            ctx = parent;
        }
        ctx
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Value>> {
        self.vars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn load(&self, index: u32) -> Result<Value, RuntimeError> {
        self.lock()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("variable slot {} out of range", index)))
    }

    pub(crate) fn store(&self, index: u32, value: Value) -> Result<(), RuntimeError> {
        match self.lock().get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::internal(format!(
                "variable slot {} out of range",
                index
            ))),
        }
    }

    /// Declared type of variable `index` of this frame.
    pub(crate) fn var_type(&self, index: u32) -> Option<&Type> {
        let program = self.exe.program();
        let vars = match self.func {
            Some(id) => &program.func(id).vars,
            None => &program.main_vars,
        };
        vars.get(index as usize).map(|v| &program.var(*v).ty)
    }

    /// Snapshot of the first `n` variables.
    pub(crate) fn leading(&self, n: usize) -> Vec<Value> {
        self.lock().iter().take(n).cloned().collect()
    }

    /// Read a global variable from the host.
    pub fn get_var(&self, var: &Var) -> Result<Value, RuntimeError> {
        match var.addr() {
            Some(addr) if var.is_global() => self.root().load(addr.index),
            _ => Err(RuntimeError::not_global()),
        }
    }

    /// Write a global variable from the host.
    pub fn set_var(&self, var: &Var, value: Value) -> Result<(), RuntimeError> {
        match var.addr() {
            Some(addr) if var.is_global() => self.root().store(addr.index, value),
            _ => Err(RuntimeError::not_global()),
        }
    }

    /// Look up a global variable by name and read it.
    pub fn global_value(&self, name: &str) -> Result<Value, RuntimeError> {
        let var = self
            .exe
            .program()
            .global(name)
            .ok_or_else(RuntimeError::not_global)?;
        self.get_var(var)
    }
}
