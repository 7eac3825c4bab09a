use crate::bytecode::func::{FuncId, FuncInfo};
use crate::bytecode::instr::{
    ARITY_MAX, ARITY_SPREAD, CALL_SPREAD, Instr, Opcode, RETURN_VARS, SCOPE_GLOBAL,
};
use crate::bytecode::op::{AddrOperator, Operator};
use crate::bytecode::program::{CallArity, Program};
use crate::bytecode::stack_check_error::check_program;
use crate::lang::types::{FuncType, Kind, Type};
use crate::lang::value::{PtrValue, Value};
use crate::runtime::builtin;
use crate::runtime::builtin_ops;
use crate::runtime::closure::Closure;
use crate::runtime::context::Context;
use crate::runtime::native::{NativeFunc, NativeFuncvInfo, NativeTables};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::stack::Stack;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

thread_local! {
    /// Call depth of the innermost VM frame currently inside native code on
    /// this thread. Script functions re-entered from a native callback
    /// continue counting from here.
    static HOST_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Publishes a VM call depth for the duration of a native call.
struct HostDepth {
    saved: usize,
}

impl HostDepth {
    fn enter(depth: usize) -> HostDepth {
        HostDepth {
            saved: HOST_DEPTH.with(|d| d.replace(depth)),
        }
    }
}

impl Drop for HostDepth {
    fn drop(&mut self) {
        HOST_DEPTH.with(|d| d.set(self.saved));
    }
}

/// Call depth a fresh stack entered from native code starts at.
pub(crate) fn host_depth() -> usize {
    HOST_DEPTH.with(Cell::get)
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
    /// Run the stack-effect verifier before accepting a program.
    pub verify_stack: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
            verify_stack: true,
        }
    }
}

/// A program bound to the native tables it was linked against, ready to run.
pub struct Executable {
    program: Program,
    config: VmConfig,
    natives: NativeTables,
    /// Zero-valued variable frame per function, indexed by `FuncId`.
    frames: Vec<Vec<Value>>,
    globals: Vec<Value>,
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("instrs", &self.program.code.len())
            .field("funcs", &self.program.funcs.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Executable {
    pub fn new(program: Program) -> Result<Arc<Executable>, RuntimeError> {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Program, config: VmConfig) -> Result<Arc<Executable>, RuntimeError> {
        builtin::install().map_err(|e| RuntimeError::native(e.to_string()))?;
        let natives = NativeTables::snapshot();

        if config.verify_stack {
            check_program(&program, &natives)
                .map_err(|e| RuntimeError::new(RuntimeErrorKind::Verify, e.to_string()))?;
        }

        let frames = program
            .funcs
            .iter()
            .map(|f| {
                f.vars
                    .iter()
                    .map(|v| Value::zero(&program.var(*v).ty))
                    .collect()
            })
            .collect();
        let globals = program
            .main_vars
            .iter()
            .map(|v| Value::zero(&program.var(*v).ty))
            .collect();

        debug!(
            instrs = program.code.len(),
            funcs = program.funcs.len(),
            "executable ready"
        );

        Ok(Arc::new(Executable {
            program,
            config,
            natives,
            frames,
            globals,
        }))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Execute the main body and return the global context.
    pub fn run(self: &Arc<Self>) -> Result<Arc<Context>, RuntimeError> {
        let mut stack = Stack::new();
        let ctx = Context::new(self.clone(), None, None, 0, self.globals.clone());
        self.exec(&ctx, &mut stack, 0, self.program.main_end)?;
        Ok(ctx)
    }

    pub(crate) fn signature_of(&self, id: FuncId) -> Arc<FuncType> {
        let func = self.program.func(id);
        match &func.signature {
            Some(sig) => sig.clone(),
            None => Arc::new(FuncType {
                params: func.params.clone(),
                results: func.vars[..func.num_out]
                    .iter()
                    .map(|v| self.program.var(*v).ty.clone())
                    .collect(),
                variadic: func.is_variadic(),
            }),
        }
    }

    fn check_limits(&self, stack: &mut Stack) -> Result<(), RuntimeError> {
        stack.steps += 1;

        if let Some(max) = self.config.max_steps {
            if stack.steps > max {
                return Err(RuntimeError::limit(format!(
                    "execution step limit exceeded ({})",
                    max
                )));
            }
        }

        if stack.len() > self.config.max_stack_size {
            return Err(RuntimeError::limit(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    /// Call script function `id` whose arguments are on top of `stack`.
    /// On success the arguments are replaced by the results.
    pub(crate) fn call_func(
        self: &Arc<Self>,
        id: FuncId,
        parent: Arc<Context>,
        stack: &mut Stack,
    ) -> Result<(), RuntimeError> {
        let func = self.program.func(id);
        let (entry, end) = match (func.entry, func.end) {
            (Some(entry), Some(end)) => (entry, end),
            _ => {
                return Err(RuntimeError::internal(format!(
                    "function {} has no body",
                    func.name
                )));
            }
        };

        stack.depth += 1;
        if stack.depth > self.config.max_call_depth {
            return Err(RuntimeError::limit(format!(
                "call depth limit exceeded ({}) - possible infinite recursion in '{}'",
                self.config.max_call_depth, func.name
            )));
        }

        let nin = func.num_in();
        let base = stack.len();
        if base < nin {
            return Err(RuntimeError::stack_underflow(&func.name));
        }
        trace!(func = %func.name, depth = stack.depth, "call");

        let ctx = Context::new(
            self.clone(),
            Some(id),
            Some(parent),
            base,
            self.frames[id.0 as usize].clone(),
        );
        let ret = self
            .exec(&ctx, stack, entry, end)
            .map_err(|e| e.with_context(&func.name))?;

        match ret {
            Some(n) if n != RETURN_VARS => stack.ret(base - nin, n as usize)?,
            _ => {
                stack.truncate(base - nin);
                for value in ctx.leading(func.num_out) {
                    stack.push(value);
                }
            }
        }
        stack.depth -= 1;
        Ok(())
    }

    fn read_arity(field: u32, stack: &mut Stack) -> Result<CallArity, RuntimeError> {
        match field {
            ARITY_SPREAD => Ok(CallArity::Spread),
            ARITY_MAX => {
                let extra = stack.pop()?;
                let n = extra
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| RuntimeError::type_error("argument count", &extra))?;
                Ok(CallArity::Count(ARITY_MAX as usize + n as usize))
            }
            n => Ok(CallArity::Count(n as usize)),
        }
    }

    fn dynamic_arity(operand: u32) -> CallArity {
        if operand == CALL_SPREAD {
            CallArity::Spread
        } else {
            CallArity::Count(operand as usize)
        }
    }

    /// Split a variadic signature declaring `num_in` parameters into its
    /// trailing slice type and fixed parameter count.
    fn variadic_tail<'t>(
        params: &'t [Type],
        num_in: usize,
        callee: &str,
    ) -> Result<(&'t Type, usize), RuntimeError> {
        let nfixed = num_in
            .checked_sub(1)
            .ok_or_else(|| RuntimeError::internal(format!("{} is variadic without params", callee)))?;
        let last = params.get(nfixed).ok_or_else(|| {
            RuntimeError::internal(format!(
                "{} declares {} params but its signature has {}",
                callee,
                num_in,
                params.len()
            ))
        })?;
        Ok((last, nfixed))
    }

    /// Rewrite the trailing arguments on the stack into the slice a
    /// variadic callee expects after its `nfixed` fixed parameters.
    fn pack_variadic(
        last: &Type,
        nfixed: usize,
        callee: &str,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<(), RuntimeError> {
        let elem = last.elem().cloned().unwrap_or(Type::Any);

        match arity {
            CallArity::Spread => {
                let packed = match stack.pop()? {
                    Value::Nil => Value::slice(elem, Vec::new()),
                    slice @ Value::Slice(_) => slice,
                    other => return Err(RuntimeError::type_error(last, &other)),
                };
                stack.push(packed);
            }
            CallArity::Count(n) => {
                if n < nfixed {
                    return Err(RuntimeError::arity(callee, nfixed, n));
                }
                let items = stack.pop_n(n - nfixed)?;
                if let Some(bad) = items.iter().find(|v| !v.fits(&elem)) {
                    return Err(RuntimeError::type_error(&elem, bad));
                }
                stack.push(Value::slice(elem, items));
            }
        }
        Ok(())
    }

    /// Pack the arguments of a script function call for `func`.
    fn pack_script_variadic(
        func: &FuncInfo,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<(), RuntimeError> {
        let (last, nfixed) = Self::variadic_tail(&func.params, func.num_in(), &func.name)?;
        Self::pack_variadic(last, nfixed, &func.name, stack, arity)
    }

    /// Pop the arguments of a native call, packing variadic ones.
    fn native_args(
        sig: &FuncType,
        callee: &str,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<Vec<Value>, RuntimeError> {
        if sig.variadic {
            let (last, nfixed) = Self::variadic_tail(&sig.params, sig.params.len(), callee)?;
            Self::pack_variadic(last, nfixed, callee, stack, arity)?;
        } else if arity != CallArity::Count(sig.params.len()) {
            let got = match arity {
                CallArity::Count(n) => n,
                CallArity::Spread => sig.params.len(),
            };
            return Err(RuntimeError::arity(callee, sig.params.len(), got));
        }
        stack.pop_n(sig.params.len())
    }

    fn call_native(
        func: &NativeFunc,
        name: &str,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<(), RuntimeError> {
        let args = Self::native_args(func.signature(), name, stack, arity)?;
        Self::invoke_native(func, name, args, stack)
    }

    /// Call a registered variadic native, packing against its cached
    /// parameter count.
    fn call_nativev(
        info: &NativeFuncvInfo,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<(), RuntimeError> {
        let num_in = info.num_in();
        let (last, nfixed) = Self::variadic_tail(&info.func.signature().params, num_in, &info.name)?;
        Self::pack_variadic(last, nfixed, &info.name, stack, arity)?;
        let args = stack.pop_n(num_in)?;
        Self::invoke_native(&info.func, &info.name, args, stack)
    }

    fn invoke_native(
        func: &NativeFunc,
        name: &str,
        args: Vec<Value>,
        stack: &mut Stack,
    ) -> Result<(), RuntimeError> {
        trace!(func = name, args = args.len(), "native call");
        let results = {
            let _depth = HostDepth::enter(stack.depth);
            func.call(args).map_err(|e| e.with_context(name))?
        };
        for value in results {
            stack.push(value);
        }
        Ok(())
    }

    /// Call a closure value whose arguments are on top of `stack`.
    fn call_closure(
        closure: &Arc<Closure>,
        stack: &mut Stack,
        arity: CallArity,
    ) -> Result<(), RuntimeError> {
        let exe = closure.executable();
        let func = exe.program.func(closure.func());
        if func.is_variadic() {
            Self::pack_script_variadic(func, stack, arity)?;
        } else if arity != CallArity::Count(func.num_in()) {
            let got = match arity {
                CallArity::Count(n) => n,
                CallArity::Spread => func.num_in(),
            };
            return Err(RuntimeError::arity(&func.name, func.num_in(), got));
        }
        exe.call_func(closure.func(), closure.parent().clone(), stack)
    }

    /// Frame that a new closure of `id` captures: top-level functions see
    /// only the global context.
    fn closure_parent(&self, id: FuncId, ctx: &Arc<Context>) -> Arc<Context> {
        if self.program.func(id).nest_depth <= 1 {
            ctx.global()
        } else {
            ctx.clone()
        }
    }

    fn make_closure(
        self: &Arc<Self>,
        instr: Instr,
        ctx: &Arc<Context>,
    ) -> Result<Arc<Closure>, RuntimeError> {
        let (variadic, index) = instr.decode_closure();
        let table = if variadic {
            &self.program.variadic
        } else {
            &self.program.fixed
        };
        let id = *table
            .get(index as usize)
            .ok_or_else(|| RuntimeError::internal(format!("no function at table index {}", index)))?;
        let parent = self.closure_parent(id, ctx);
        Ok(Arc::new(Closure::new(self.clone(), id, parent)))
    }

    fn frame<'c>(&self, ctx: &'c Context, scope: u32) -> Result<&'c Context, RuntimeError> {
        if scope == SCOPE_GLOBAL {
            Ok(ctx.root())
        } else {
            ctx.ancestor(scope)
        }
    }

    fn frame_handle(&self, ctx: &Arc<Context>, scope: u32) -> Result<Arc<Context>, RuntimeError> {
        if scope == SCOPE_GLOBAL {
            Ok(ctx.global())
        } else {
            ctx.ancestor_handle(scope)
        }
    }

    fn pointer(value: Value) -> Result<Arc<PtrValue>, RuntimeError> {
        match value {
            Value::Ptr(p) => Ok(p),
            Value::Nil => Err(RuntimeError::new(
                RuntimeErrorKind::Type,
                "nil pointer dereference",
            )),
            other => Err(RuntimeError::type_error("pointer", &other)),
        }
    }

    /// Apply `aop` through `ptr`; operands below the pointer are on `stack`.
    fn addr_op(
        kind: Kind,
        aop: AddrOperator,
        ptr: &PtrValue,
        stack: &mut Stack,
    ) -> Result<(), RuntimeError> {
        match aop {
            AddrOperator::Val => stack.push(ptr.load()?),
            AddrOperator::Assign => {
                let value = stack.pop()?;
                ptr.store(value)?;
            }
            AddrOperator::Inc | AddrOperator::Dec => {
                let one = Value::Int(1)
                    .convert(kind)
                    .ok_or_else(|| RuntimeError::type_error(kind, &Value::Int(1)))?;
                let bop = if aop == AddrOperator::Inc {
                    Operator::Add
                } else {
                    Operator::Sub
                };
                ptr.store(builtin_ops::eval(bop, kind, ptr.load()?, one)?)?;
            }
            AddrOperator::Update(bop) => {
                let y = stack.pop()?;
                ptr.store(builtin_ops::eval(bop, kind, ptr.load()?, y)?)?;
            }
        }
        Ok(())
    }

    fn arg_slot(ctx: &Context, below: u32) -> Result<usize, RuntimeError> {
        let below = below as usize;
        if below == 0 || below > ctx.base() {
            return Err(RuntimeError::internal(format!(
                "argument slot {} outside the frame",
                below
            )));
        }
        Ok(ctx.base() - below)
    }

    /// Run `code[start..end]` in `ctx`. Returns the operand of the `Return`
    /// that ended the range, if any.
    fn exec(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        stack: &mut Stack,
        start: usize,
        end: usize,
    ) -> Result<Option<u32>, RuntimeError> {
        let code = &self.program.code;
        let mut ip = start;

        while ip < end {
            self.check_limits(stack)?;
            let instr = code[ip];
            ip += 1;
            let operand = instr.operand();

            let op = instr.opcode().ok_or_else(|| {
                RuntimeError::internal(format!("bad instruction {:#010x} at {}", instr.0, ip - 1))
            })?;

            match op {
                Opcode::Nop => {}

                Opcode::PushInt => match instr.decode_push_int() {
                    (Some(kind), n) => stack.push(Value::from_i64(kind, n)),
                    (None, _) => return Err(RuntimeError::internal("bad inline integer kind")),
                },

                Opcode::PushConst => {
                    let value = self.program.consts.get(operand as usize).ok_or_else(|| {
                        RuntimeError::internal(format!("constant {} out of range", operand))
                    })?;
                    stack.push(value.clone());
                }

                Opcode::Pop => {
                    let n = operand as usize;
                    if n > stack.len() {
                        return Err(RuntimeError::stack_underflow("pop"));
                    }
                    stack.truncate(stack.len() - n);
                }

                Opcode::LoadVar => {
                    let (scope, index) = instr.decode_addr();
                    let value = self.frame(ctx, scope)?.load(index)?;
                    stack.push(value);
                }

                Opcode::StoreVar => {
                    let (scope, index) = instr.decode_addr();
                    let value = stack.pop()?;
                    self.frame(ctx, scope)?.store(index, value)?;
                }

                Opcode::AddrVar => {
                    let (scope, index) = instr.decode_addr();
                    let frame = self.frame_handle(ctx, scope)?;
                    let elem = frame.var_type(index).cloned().ok_or_else(|| {
                        RuntimeError::internal(format!("variable slot {} out of range", index))
                    })?;
                    stack.push(Value::slot_ptr(elem, frame, index));
                }

                Opcode::AddrOp => {
                    let (kind, aop) = match instr.decode_addr_op() {
                        (Some(kind), Some(aop)) => (kind, aop),
                        _ => return Err(RuntimeError::internal("bad address operand")),
                    };
                    let ptr = Self::pointer(stack.pop()?)?;
                    Self::addr_op(kind, aop, &ptr, stack)?;
                }

                Opcode::LoadArg => {
                    let slot = Self::arg_slot(ctx, operand)?;
                    let value = stack.get(slot)?.clone();
                    stack.push(value);
                }

                Opcode::StoreArg => {
                    let slot = Self::arg_slot(ctx, operand)?;
                    let value = stack.pop()?;
                    stack.set(slot, value)?;
                }

                Opcode::LoadNativeVar => {
                    let value = self.natives.var(operand)?.var.load();
                    stack.push(value);
                }

                Opcode::BuiltinOp => {
                    let (kind, bop) = match instr.decode_builtin() {
                        (Some(kind), Some(bop)) => (kind, bop),
                        _ => return Err(RuntimeError::internal("bad builtin operand")),
                    };
                    let y = stack.pop()?;
                    let x = stack.pop()?;
                    stack.push(builtin_ops::eval(bop, kind, x, y)?);
                }

                Opcode::Convert => {
                    let kind = Kind::from_u8(operand as u8)
                        .ok_or_else(|| RuntimeError::internal("bad conversion kind"))?;
                    let value = stack.pop()?;
                    let converted = value
                        .convert(kind)
                        .ok_or_else(|| RuntimeError::type_error(kind, &value))?;
                    stack.push(converted);
                }

                Opcode::CallFunc => {
                    let id = *self.program.fixed.get(operand as usize).ok_or_else(|| {
                        RuntimeError::internal(format!("no fixed function {}", operand))
                    })?;
                    let parent = self.closure_parent(id, ctx);
                    self.call_func(id, parent, stack)?;
                }

                Opcode::CallFuncv => {
                    let (field, index) = instr.decode_funcv();
                    let id = *self.program.variadic.get(index as usize).ok_or_else(|| {
                        RuntimeError::internal(format!("no variadic function {}", index))
                    })?;
                    let arity = Self::read_arity(field, stack)?;
                    Self::pack_script_variadic(self.program.func(id), stack, arity)?;
                    let parent = self.closure_parent(id, ctx);
                    self.call_func(id, parent, stack)?;
                }

                Opcode::CallNative => {
                    let info = self.natives.func(operand)?;
                    let arity = CallArity::Count(info.func.signature().params.len());
                    Self::call_native(&info.func, &info.name, stack, arity)?;
                }

                Opcode::CallNativev => {
                    let (field, addr) = instr.decode_funcv();
                    let info = self.natives.funcv(addr)?;
                    let arity = Self::read_arity(field, stack)?;
                    Self::call_nativev(info, stack, arity)?;
                }

                Opcode::PushNative => {
                    let func = self.natives.func(operand)?.func.clone();
                    stack.push(Value::Func(func));
                }

                Opcode::PushNativev => {
                    let func = self.natives.funcv(operand)?.func.clone();
                    stack.push(Value::Func(func));
                }

                Opcode::Closure => {
                    let closure = self.make_closure(instr, ctx)?;
                    stack.push(Value::Closure(closure));
                }

                Opcode::HostClosure => {
                    let closure = self.make_closure(instr, ctx)?;
                    stack.push(Value::Func(NativeFunc::from_closure(closure)));
                }

                Opcode::CallClosure => {
                    let arity = Self::dynamic_arity(operand);
                    match stack.pop()? {
                        Value::Closure(c) => Self::call_closure(&c, stack, arity)?,
                        other => return Err(RuntimeError::not_callable(&other)),
                    }
                }

                Opcode::CallValue => {
                    let arity = Self::dynamic_arity(operand);
                    match stack.pop()? {
                        Value::Closure(c) => Self::call_closure(&c, stack, arity)?,
                        Value::Func(f) => match f.as_closure() {
                            Some(c) => Self::call_closure(c, stack, arity)?,
                            None => Self::call_native(&f, "func value", stack, arity)?,
                        },
                        Value::Nil => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::NotCallable,
                                "call of nil function value",
                            ));
                        }
                        other => return Err(RuntimeError::not_callable(&other)),
                    }
                }

                Opcode::Deref => {
                    let ptr = Self::pointer(stack.pop()?)?;
                    stack.push(ptr.load()?);
                }

                Opcode::Field => match stack.pop()? {
                    Value::Struct(s) => {
                        let value = s.fields.get(operand as usize).cloned().ok_or_else(|| {
                            RuntimeError::internal(format!("field {} out of range", operand))
                        })?;
                        stack.push(value);
                    }
                    other => return Err(RuntimeError::type_error("struct", &other)),
                },

                Opcode::Return => return Ok(Some(operand)),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::func::Var;
    use crate::bytecode::program::Builder;
    use crate::runtime::adapter::IntoNativeVariadic;
    use crate::runtime::native::NativePackage;

    fn run(b: Builder, main_end: usize) -> Result<Arc<Context>, RuntimeError> {
        run_with_config(b, main_end, VmConfig::default())
    }

    fn run_with_config(
        b: Builder,
        main_end: usize,
        config: VmConfig,
    ) -> Result<Arc<Context>, RuntimeError> {
        let program = b.resolve(main_end).unwrap();
        Executable::with_config(program, config)?.run()
    }

    fn global(ctx: &Context, name: &str) -> Value {
        ctx.global_value(name).unwrap()
    }

    #[test]
    fn test_main_arithmetic_into_global() {
        let mut b = Builder::new();
        b.define_var(None, Var::new("x", Type::INT));
        b.push_value(Value::Int(40));
        b.push_value(Value::Int(2));
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();
        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "x"), Value::Int(42));
    }

    #[test]
    fn test_call_fixed_function_explicit_return() {
        let mut b = Builder::new();
        let f = b.new_func("sub", 1);
        b.define_var(None, Var::new("x", Type::INT));
        b.push_value(Value::Int(10));
        b.push_value(Value::Int(3));
        b.call_func(f);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        b.args(f, vec![Type::INT, Type::INT]).unwrap();
        b.results(f, vec![Var::positional(0, Type::INT)]).unwrap();
        b.define_func(f).unwrap();
        b.load_arg(2);
        b.load_arg(1);
        b.builtin_op(Kind::Int, Operator::Sub);
        b.ret(1);
        b.end_func(f).unwrap();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "x"), Value::Int(7));
    }

    #[test]
    fn test_named_results_fall_through() {
        let mut b = Builder::new();
        let f = b.new_func("pair", 1);
        b.define_var(None, Var::new("a", Type::INT));
        b.define_var(None, Var::new("s", Type::STRING));
        b.call_func(f);
        b.store_var(SCOPE_GLOBAL, 1);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        b.args(f, vec![]).unwrap();
        b.results(
            f,
            vec![Var::new("n", Type::INT), Var::new("label", Type::STRING)],
        )
        .unwrap();
        b.define_func(f).unwrap();
        b.push_value(Value::Int(9));
        b.store_var(0, 0);
        b.end_func(f).unwrap();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "a"), Value::Int(9));
        assert_eq!(global(&ctx, "s"), Value::String(String::new()));
    }

    #[test]
    fn test_nested_closure_shares_enclosing_variable() {
        let mut b = Builder::new();
        let outer = b.new_func("outer", 1);
        let inner = b.new_func("inner", 2);
        b.define_var(None, Var::new("x", Type::INT));
        b.call_func(outer);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        b.args(outer, vec![]).unwrap();
        b.results(outer, vec![Var::positional(0, Type::INT)]).unwrap();
        b.define_var(Some(outer), Var::new("v", Type::INT));
        b.define_func(outer).unwrap();
        b.push_value(Value::Int(10));
        b.store_var(0, 1);
        b.closure(inner);
        b.call_closure(CallArity::Count(0));
        b.load_var(0, 1);
        b.ret(1);
        b.end_func(outer).unwrap();

        b.args(inner, vec![]).unwrap();
        b.define_func(inner).unwrap();
        b.load_var(1, 1);
        b.push_value(Value::Int(1));
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(1, 1);
        b.end_func(inner).unwrap();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "x"), Value::Int(11));
    }

    #[test]
    fn test_top_level_closure_parent_is_global() {
        let mut b = Builder::new();
        let set = b.new_func("set", 1);
        b.define_var(None, Var::new("x", Type::INT));
        b.closure(set);
        b.call_closure(CallArity::Count(0));
        let end = b.len();

        b.args(set, vec![]).unwrap();
        b.define_func(set).unwrap();
        b.push_value(Value::Int(5));
        b.store_var(SCOPE_GLOBAL, 0);
        b.end_func(set).unwrap();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "x"), Value::Int(5));
    }

    fn variadic_count_program(nargs: usize) -> (Builder, usize) {
        let mut b = Builder::new();
        let f = b.new_func("count", 1);
        b.define_var(None, Var::new("n", Type::INT));
        for i in 0..nargs {
            b.push_value(Value::Int(i as i64));
        }
        b.call_funcv(f, CallArity::Count(nargs));
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        let len = crate::runtime::native::find_package(builtin::UNIVERSE)
            .unwrap()
            .find_func("len")
            .unwrap();
        b.vargs(f, vec![Type::slice_of(Type::INT)]).unwrap();
        b.results(f, vec![Var::positional(0, Type::INT)]).unwrap();
        b.define_func(f).unwrap();
        b.load_arg(1);
        b.call_native(len);
        b.ret(1);
        b.end_func(f).unwrap();
        (b, end)
    }

    #[test]
    fn test_variadic_script_function_packs_arguments() {
        builtin::install().unwrap();
        for nargs in [0, 3, 1100] {
            let (b, end) = variadic_count_program(nargs);
            let ctx = run(b, end).unwrap();
            assert_eq!(global(&ctx, "n"), Value::Int(nargs as i64));
        }
    }

    #[test]
    fn test_variadic_native_call() {
        let pkg = NativePackage::new("test/vm/join").unwrap();
        let join = (|sep: String, parts: Vec<Value>| {
            parts
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(&sep)
        })
        .into_native_variadic();
        pkg.register_funcvs(vec![("Join", join)]).unwrap();
        let addr = pkg.find_funcv("Join").unwrap();

        let mut b = Builder::new();
        b.define_var(None, Var::new("s", Type::STRING));
        b.push_value(Value::String("-".into()));
        b.push_value(Value::Int(1));
        b.push_value(Value::Bool(true));
        b.call_nativev(addr, CallArity::Count(3));
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "s"), Value::String("1-true".into()));
    }

    #[test]
    fn test_recursion_hits_call_depth_limit() {
        let mut b = Builder::new();
        let f = b.new_func("forever", 1);
        b.call_func(f);
        let end = b.len();
        b.args(f, vec![]).unwrap();
        b.define_func(f).unwrap();
        b.call_func(f);
        b.end_func(f).unwrap();

        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let err = run_with_config(b, end, config).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::LimitExceeded);
        assert!(err.message.contains("call depth limit exceeded (50)"));
        assert!(!err.call_stack.is_empty());
    }

    #[test]
    fn test_step_limit() {
        let mut b = Builder::new();
        for _ in 0..10 {
            b.push_value(Value::Int(1));
            b.pop(1);
        }
        let end = b.len();
        let config = VmConfig {
            max_steps: Some(5),
            ..VmConfig::default()
        };
        let err = run_with_config(b, end, config).unwrap_err();
        assert!(err.message.contains("execution step limit exceeded (5)"));
    }

    #[test]
    fn test_runtime_division_by_zero() {
        let mut b = Builder::new();
        b.define_var(None, Var::new("x", Type::INT));
        b.push_value(Value::Int(1));
        b.push_value(Value::Int(0));
        b.builtin_op(Kind::Int, Operator::Quo);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();
        let err = run(b, end).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
    }

    #[test]
    fn test_verifier_rejects_underflow() {
        let mut b = Builder::new();
        b.builtin_op(Kind::Int, Operator::Add);
        let end = b.len();
        let err = run(b, end).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Verify);
    }

    #[test]
    fn test_unverified_underflow_is_runtime_error() {
        let mut b = Builder::new();
        b.pop(2);
        let end = b.len();
        let config = VmConfig {
            verify_stack: false,
            ..VmConfig::default()
        };
        let err = run_with_config(b, end, config).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackUnderflow);
    }

    #[test]
    fn test_get_var_rejects_locals() {
        let mut b = Builder::new();
        let f = b.new_func("f", 1);
        let local = b.define_var(Some(f), Var::new("v", Type::INT));
        b.args(f, vec![]).unwrap();
        b.define_func(f).unwrap();
        b.end_func(f).unwrap();
        let program = b.resolve(0).unwrap();
        let local = program.var(local).clone();
        let ctx = Executable::new(program).unwrap().run().unwrap();
        let err = ctx.get_var(&local).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::VariableNotGlobal);
        assert!(ctx.set_var(&local, Value::Int(1)).is_err());
    }

    #[test]
    fn test_host_closure_callable_from_host() {
        let mut b = Builder::new();
        let double = b.new_func("double", 1);
        b.define_var(None, Var::new("f", Type::func(vec![Type::INT], vec![Type::INT], false)));
        b.host_closure(double);
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();

        b.args(double, vec![Type::INT]).unwrap();
        b.results(double, vec![Var::positional(0, Type::INT)]).unwrap();
        b.define_func(double).unwrap();
        b.load_arg(1);
        b.load_arg(1);
        b.builtin_op(Kind::Int, Operator::Add);
        b.ret(1);
        b.end_func(double).unwrap();

        let ctx = run(b, end).unwrap();
        match global(&ctx, "f") {
            Value::Func(f) => {
                assert!(f.as_closure().is_some());
                assert_eq!(f.call(vec![Value::Int(21)]).unwrap(), vec![Value::Int(42)]);
            }
            other => panic!("expected func value, got {:?}", other),
        }
    }

    #[test]
    fn test_operations_through_variable_address() {
        let mut b = Builder::new();
        b.define_var(None, Var::new("x", Type::INT));
        b.define_var(None, Var::new("p", Type::ptr_to(Type::INT)));
        b.push_value(Value::Int(1));
        b.store_var(SCOPE_GLOBAL, 0);
        b.addr_var(SCOPE_GLOBAL, 0);
        b.store_var(SCOPE_GLOBAL, 1);
        b.push_value(Value::Int(5));
        b.load_var(SCOPE_GLOBAL, 1);
        b.addr_op(Kind::Int, AddrOperator::Assign);
        b.push_value(Value::Int(3));
        b.load_var(SCOPE_GLOBAL, 1);
        b.addr_op(Kind::Int, AddrOperator::Update(Operator::Mul));
        b.load_var(SCOPE_GLOBAL, 1);
        b.addr_op(Kind::Int, AddrOperator::Inc);
        let end = b.len();

        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "x"), Value::Int(16));
        match global(&ctx, "p") {
            Value::Ptr(p) => {
                assert_eq!(p.elem, Type::INT);
                p.store(Value::Int(40)).unwrap();
            }
            other => panic!("expected pointer, got {:?}", other),
        }
        assert_eq!(global(&ctx, "x"), Value::Int(40));
    }

    #[test]
    fn test_addr_op_on_nil_pointer() {
        let mut b = Builder::new();
        b.push_value(Value::Nil);
        b.addr_op(Kind::Int, AddrOperator::Val);
        b.pop(1);
        let end = b.len();
        let err = run(b, end).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Type);
        assert!(err.message.contains("nil pointer"));
    }

    #[test]
    fn test_variadic_native_packs_against_declared_count() {
        let pkg = NativePackage::new("test/vm/label").unwrap();
        let label = (|name: String, xs: Vec<i64>| format!("{}{}", name, xs.len()))
            .into_native_variadic();
        pkg.register_funcvs(vec![("Label", label)]).unwrap();
        let addr = pkg.find_funcv("Label").unwrap();
        assert_eq!(crate::runtime::native::funcv_info(addr).unwrap().num_in(), 2);

        let mut b = Builder::new();
        b.define_var(None, Var::new("s", Type::STRING));
        b.push_value(Value::String("n".into()));
        b.push_value(Value::Int(4));
        b.push_value(Value::Int(5));
        b.call_nativev(addr, CallArity::Count(3));
        b.store_var(SCOPE_GLOBAL, 0);
        let end = b.len();
        let ctx = run(b, end).unwrap();
        assert_eq!(global(&ctx, "s"), Value::String("n2".into()));

        let mut b = Builder::new();
        b.call_nativev(addr, CallArity::Count(0));
        b.pop(1);
        let end = b.len();
        let config = VmConfig {
            verify_stack: false,
            ..VmConfig::default()
        };
        let err = run_with_config(b, end, config).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Arity);
        assert!(err.message.contains("expected 1, got 0"));
    }

    #[test]
    fn test_host_depth_restored_after_native_call() {
        let outer = HostDepth::enter(7);
        assert_eq!(host_depth(), 7);
        {
            let _inner = HostDepth::enter(12);
            assert_eq!(host_depth(), 12);
        }
        assert_eq!(host_depth(), 7);
        drop(outer);
        assert_eq!(host_depth(), 0);
    }
}
