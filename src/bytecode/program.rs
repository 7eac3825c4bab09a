use crate::bytecode::compile_error::BuildError;
use crate::bytecode::func::{FuncId, FuncInfo, Var, VarId, VarName};
use crate::bytecode::instr::{
    ARITY_MAX, ARITY_SPREAD, CALL_SPREAD, CLOSURE_VARIADIC, FUNCV_INDEX_MASK, Instr, Opcode,
    RETURN_VARS,
};
use crate::bytecode::op::{AddrOperator, Operator};
use crate::lang::types::{FuncType, Kind, Type};
use crate::lang::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A finished bytecode program.
///
/// Everything needed to execute without the source tree: instruction words,
/// constant pool, function descriptors with their two call tables, and the
/// variable arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Instr>,
    pub consts: Vec<Value>,
    pub funcs: Vec<FuncInfo>,
    /// Table of fixed-arity functions; `CallFunc` operands index it.
    pub fixed: Vec<FuncId>,
    /// Table of variadic functions; `CallFuncv` operands index it.
    pub variadic: Vec<FuncId>,
    pub vars: Vec<Var>,
    /// Variables of the global context, in slot order.
    pub main_vars: Vec<VarId>,
    /// Main body is `code[0..main_end]`.
    pub main_end: usize,
}

impl Program {
    pub fn func(&self, id: FuncId) -> &FuncInfo {
        &self.funcs[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }

    pub fn fixed_func(&self, index: u32) -> Option<&FuncInfo> {
        self.fixed.get(index as usize).map(|id| self.func(*id))
    }

    pub fn variadic_func(&self, index: u32) -> Option<&FuncInfo> {
        self.variadic.get(index as usize).map(|id| self.func(*id))
    }

    /// Table entry of a closure operand.
    pub fn closure_func(&self, variadic: bool, index: u32) -> Option<&FuncInfo> {
        if variadic {
            self.variadic_func(index)
        } else {
            self.fixed_func(index)
        }
    }

    /// Look up a global variable by name. Variables declared in nested
    /// blocks of the main body are not globals and never match.
    pub fn global(&self, name: &str) -> Option<&Var> {
        self.main_vars
            .iter()
            .map(|id| self.var(*id))
            .filter(|v| !v.is_block_scoped())
            .find(|v| matches!(&v.name, VarName::Named(n) if n == name))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Program, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Arity of a call site whose callee takes trailing arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArity {
    Count(usize),
    /// The last argument is a slice spread with `...`.
    Spread,
}

/// A reserved instruction slot, patched exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserved(usize);

impl Reserved {
    pub fn offset(self) -> usize {
        self.0
    }
}

// =============================================================================
// BUILDER
// =============================================================================

#[derive(Debug, Default)]
pub struct Builder {
    code: Vec<Instr>,
    consts: Vec<Value>,
    funcs: Vec<FuncInfo>,
    vars: Vec<Var>,
    main_vars: Vec<VarId>,
    open: Vec<FuncId>,
    reserved: BTreeSet<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    // -------------------------------------------------------------------------
    // Functions and variables
    // -------------------------------------------------------------------------

    pub fn new_func(&mut self, name: &str, nest_depth: u32) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(FuncInfo::new(name, nest_depth));
        id
    }

    pub fn func(&self, id: FuncId) -> &FuncInfo {
        &self.funcs[id.0 as usize]
    }

    fn func_mut(&mut self, id: FuncId) -> &mut FuncInfo {
        &mut self.funcs[id.0 as usize]
    }

    pub fn set_variadic(&mut self, id: FuncId, variadic: bool) -> Result<(), BuildError> {
        self.func_mut(id).set_variadic(variadic)
    }

    pub fn set_signature(&mut self, id: FuncId, sig: Arc<FuncType>) {
        self.func_mut(id).signature = Some(sig);
    }

    pub fn args(&mut self, id: FuncId, params: Vec<Type>) -> Result<(), BuildError> {
        self.func_mut(id).args(params)
    }

    pub fn vargs(&mut self, id: FuncId, params: Vec<Type>) -> Result<(), BuildError> {
        self.func_mut(id).vargs(params)
    }

    /// Declare the result variables of `id`. Must precede any local variable.
    pub fn results(&mut self, id: FuncId, vars: Vec<Var>) -> Result<Vec<VarId>, BuildError> {
        if !self.func(id).vars.is_empty() {
            return Err(BuildError::ResultsAfterVars {
                name: self.func(id).name.clone(),
            });
        }
        let ids: Vec<VarId> = vars
            .into_iter()
            .map(|v| self.define_var(Some(id), v))
            .collect();
        self.func_mut(id).num_out = ids.len();
        Ok(ids)
    }

    /// Add a variable to the frame of `owner` (`None` = global context) and
    /// assign its address.
    pub fn define_var(&mut self, owner: Option<FuncId>, mut var: Var) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let (nest_depth, index) = match owner {
            Some(f) => {
                let func = self.func_mut(f);
                func.vars.push(id);
                (func.nest_depth, func.vars.len() - 1)
            }
            None => {
                self.main_vars.push(id);
                (0, self.main_vars.len() - 1)
            }
        };
        var.set_addr(nest_depth, index as u32);
        self.vars.push(var);
        id
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.0 as usize]
    }

    /// Open the instruction range of `id` at the current offset.
    pub fn define_func(&mut self, id: FuncId) -> Result<(), BuildError> {
        let at = self.code.len();
        let func = self.func_mut(id);
        if func.entry.is_some() {
            return Err(BuildError::FuncRedefined {
                name: func.name.clone(),
            });
        }
        func.entry = Some(at);
        debug!(func = %func.name, entry = at, "define func");
        self.open.push(id);
        Ok(())
    }

    /// Close the range opened by the matching `define_func`.
    pub fn end_func(&mut self, id: FuncId) -> Result<(), BuildError> {
        match self.open.pop() {
            Some(top) if top == id => {
                let at = self.code.len();
                self.func_mut(id).end = Some(at);
                Ok(())
            }
            top => Err(BuildError::UnpairedEnd {
                expected: top
                    .map(|t| self.func(t).name.clone())
                    .unwrap_or_else(|| "<none>".to_string()),
                got: self.func(id).name.clone(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    pub fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn emit_func_ref(&mut self, instr: Instr, id: FuncId) -> usize {
        let at = self.emit(instr);
        self.func_mut(id).offs.push(at);
        at
    }

    pub fn reserve(&mut self) -> Reserved {
        let at = self.emit(Instr::new(Opcode::Nop, 0));
        self.reserved.insert(at);
        Reserved(at)
    }

    pub fn patch(&mut self, slot: Reserved, instr: Instr) -> Result<(), BuildError> {
        if !self.reserved.remove(&slot.0) {
            return Err(BuildError::DoublePatch { offset: slot.0 });
        }
        self.code[slot.0] = instr;
        Ok(())
    }

    /// Instruction that pushes `value`, pooling it when it cannot be inlined.
    pub fn value_instr(&mut self, value: Value) -> Instr {
        if value.kind().is_signed() {
            if let Some(n) = value.as_i64().filter(|n| Instr::fits_push_int(*n)) {
                return Instr::push_int(value.kind(), n);
            }
        }
        if value.kind().is_unsigned() {
            if let Some(n) = value.as_u64().filter(|n| *n <= i64::MAX as u64) {
                if Instr::fits_push_int(n as i64) {
                    return Instr::push_int(value.kind(), n as i64);
                }
            }
        }
        let index = match self.consts.iter().position(|c| c == &value && c.kind() == value.kind()) {
            Some(i) => i,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        };
        Instr::new(Opcode::PushConst, index as u32)
    }

    pub fn push_value(&mut self, value: Value) -> usize {
        let instr = self.value_instr(value);
        self.emit(instr)
    }

    pub fn pop(&mut self, n: usize) {
        if n > 0 {
            self.emit(Instr::new(Opcode::Pop, n as u32));
        }
    }

    pub fn load_var(&mut self, scope: u32, index: u32) {
        self.emit(Instr::var(Opcode::LoadVar, scope, index));
    }

    pub fn store_var(&mut self, scope: u32, index: u32) {
        self.emit(Instr::var(Opcode::StoreVar, scope, index));
    }

    pub fn addr_var(&mut self, scope: u32, index: u32) {
        self.emit(Instr::var(Opcode::AddrVar, scope, index));
    }

    pub fn addr_op(&mut self, kind: Kind, op: AddrOperator) {
        self.emit(Instr::addr_op(kind, op));
    }

    /// `below` is the distance of the argument under the frame base (1 = last parameter).
    pub fn load_arg(&mut self, below: u32) {
        self.emit(Instr::new(Opcode::LoadArg, below));
    }

    pub fn store_arg(&mut self, below: u32) {
        self.emit(Instr::new(Opcode::StoreArg, below));
    }

    pub fn load_native_var(&mut self, addr: u32) {
        self.emit(Instr::new(Opcode::LoadNativeVar, addr));
    }

    pub fn builtin_op(&mut self, kind: Kind, op: Operator) {
        self.emit(Instr::builtin(kind, op));
    }

    pub fn convert(&mut self, kind: Kind) {
        self.emit(Instr::new(Opcode::Convert, kind as u32));
    }

    pub fn call_func(&mut self, id: FuncId) {
        self.emit_func_ref(Instr::new(Opcode::CallFunc, 0), id);
    }

    /// Arity field for a variadic call, pushing the overflow count when needed.
    fn funcv_arity(&mut self, arity: CallArity) -> u32 {
        match arity {
            CallArity::Spread => ARITY_SPREAD,
            CallArity::Count(n) if n as u32 >= ARITY_MAX => {
                self.push_value(Value::Int((n as u32 - ARITY_MAX) as i64));
                ARITY_MAX
            }
            CallArity::Count(n) => n as u32,
        }
    }

    pub fn call_funcv(&mut self, id: FuncId, arity: CallArity) {
        let field = self.funcv_arity(arity);
        self.emit_func_ref(Instr::funcv(Opcode::CallFuncv, field, 0), id);
    }

    pub fn call_native(&mut self, addr: u32) {
        self.emit(Instr::new(Opcode::CallNative, addr));
    }

    pub fn call_nativev(&mut self, addr: u32, arity: CallArity) {
        let field = self.funcv_arity(arity);
        self.emit(Instr::funcv(Opcode::CallNativev, field, addr));
    }

    pub fn push_native(&mut self, addr: u32) {
        self.emit(Instr::new(Opcode::PushNative, addr));
    }

    pub fn push_nativev(&mut self, addr: u32) {
        self.emit(Instr::new(Opcode::PushNativev, addr));
    }

    pub fn closure(&mut self, id: FuncId) {
        self.emit_func_ref(Instr::new(Opcode::Closure, 0), id);
    }

    pub fn host_closure(&mut self, id: FuncId) {
        self.emit_func_ref(Instr::new(Opcode::HostClosure, 0), id);
    }

    pub fn call_closure(&mut self, arity: CallArity) {
        self.emit(Instr::new(Opcode::CallClosure, call_operand(arity)));
    }

    pub fn call_value(&mut self, arity: CallArity) {
        self.emit(Instr::new(Opcode::CallValue, call_operand(arity)));
    }

    pub fn deref(&mut self) {
        self.emit(Instr::new(Opcode::Deref, 0));
    }

    pub fn field(&mut self, index: usize) {
        self.emit(Instr::new(Opcode::Field, index as u32));
    }

    /// Return the top `n` stack values.
    pub fn ret(&mut self, n: usize) {
        self.emit(Instr::new(Opcode::Return, n as u32));
    }

    /// Return the current values of the result variables.
    pub fn ret_vars(&mut self) {
        self.emit(Instr::new(Opcode::Return, RETURN_VARS));
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Assign table indices, patch every forward reference and produce the program.
    pub fn resolve(mut self, main_end: usize) -> Result<Program, BuildError> {
        if let Some(open) = self.open.last() {
            return Err(BuildError::FuncOpen {
                name: self.func(*open).name.clone(),
            });
        }
        if let Some(offset) = self.reserved.first() {
            return Err(BuildError::Unpatched { offset: *offset });
        }

        let mut fixed = Vec::new();
        let mut variadic = Vec::new();
        let mut table_index = vec![None; self.funcs.len()];
        for (i, func) in self.funcs.iter().enumerate() {
            if !func.is_defined() {
                continue;
            }
            let table = if func.is_variadic() {
                &mut variadic
            } else {
                &mut fixed
            };
            table_index[i] = Some(table.len() as u32);
            table.push(FuncId(i as u32));
        }

        for (i, func) in self.funcs.iter_mut().enumerate() {
            let offs = std::mem::take(&mut func.offs);
            if offs.is_empty() {
                continue;
            }
            let index = table_index[i].ok_or_else(|| BuildError::UndefinedFunc {
                name: func.name.clone(),
            })?;
            for off in offs {
                let instr = self.code[off];
                let bits = match instr.opcode() {
                    Some(Opcode::Closure) | Some(Opcode::HostClosure) if func.is_variadic() => {
                        index | CLOSURE_VARIADIC
                    }
                    Some(Opcode::CallFuncv) => {
                        assert!(index <= FUNCV_INDEX_MASK, "variadic table overflow");
                        index
                    }
                    _ => index,
                };
                self.code[off] = instr.with_operand_bits(bits);
            }
        }

        debug!(
            fixed = fixed.len(),
            variadic = variadic.len(),
            instrs = self.code.len(),
            "resolved program"
        );

        Ok(Program {
            code: self.code,
            consts: self.consts,
            funcs: self.funcs,
            fixed,
            variadic,
            vars: self.vars,
            main_vars: self.main_vars,
            main_end,
        })
    }
}

fn call_operand(arity: CallArity) -> u32 {
    match arity {
        CallArity::Spread => CALL_SPREAD,
        CallArity::Count(n) => n as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_func(b: &mut Builder, name: &str) -> FuncId {
        let id = b.new_func(name, 1);
        b.args(id, vec![]).unwrap();
        id
    }

    #[test]
    fn test_forward_reference_is_patched() {
        let mut b = Builder::new();
        let a = fixed_func(&mut b, "a");
        let c = fixed_func(&mut b, "c");
        b.call_func(c);
        let call_at = b.len() - 1;
        let main_end = b.len();

        b.define_func(a).unwrap();
        b.ret(0);
        b.end_func(a).unwrap();
        b.define_func(c).unwrap();
        b.ret(0);
        b.end_func(c).unwrap();

        let prog = b.resolve(main_end).unwrap();
        let operand = prog.code[call_at].operand();
        assert_eq!(prog.fixed_func(operand).unwrap().name, "c");
        assert_eq!(prog.fixed.len(), 2);
    }

    #[test]
    fn test_undefined_function_rejected() {
        let mut b = Builder::new();
        let g = fixed_func(&mut b, "g");
        b.call_func(g);
        let err = b.resolve(1).unwrap_err();
        assert_eq!(err, BuildError::UndefinedFunc { name: "g".into() });
    }

    #[test]
    fn test_unreferenced_undefined_function_is_fine() {
        let mut b = Builder::new();
        fixed_func(&mut b, "unused");
        assert!(b.resolve(0).is_ok());
    }

    #[test]
    fn test_closure_carries_variadic_flag() {
        let mut b = Builder::new();
        let f = b.new_func("f", 1);
        b.vargs(f, vec![Type::slice_of(Type::INT)]).unwrap();
        b.host_closure(f);
        b.define_func(f).unwrap();
        b.ret_vars();
        b.end_func(f).unwrap();
        let prog = b.resolve(1).unwrap();
        assert_eq!(prog.code[0].decode_closure(), (true, 0));
        assert_eq!(prog.variadic_func(0).unwrap().name, "f");
    }

    #[test]
    fn test_unpaired_end_func() {
        let mut b = Builder::new();
        let f = fixed_func(&mut b, "f");
        let g = fixed_func(&mut b, "g");
        b.define_func(f).unwrap();
        let err = b.end_func(g).unwrap_err();
        assert!(matches!(err, BuildError::UnpairedEnd { .. }));
    }

    #[test]
    fn test_define_func_twice() {
        let mut b = Builder::new();
        let f = fixed_func(&mut b, "f");
        b.define_func(f).unwrap();
        b.end_func(f).unwrap();
        assert!(matches!(
            b.define_func(f),
            Err(BuildError::FuncRedefined { .. })
        ));
    }

    #[test]
    fn test_open_function_at_resolve() {
        let mut b = Builder::new();
        let f = fixed_func(&mut b, "f");
        b.define_func(f).unwrap();
        assert!(matches!(b.resolve(0), Err(BuildError::FuncOpen { .. })));
    }

    #[test]
    fn test_reserved_slot_patched_once() {
        let mut b = Builder::new();
        let slot = b.reserve();
        let instr = b.value_instr(Value::Float64(2.5));
        b.patch(slot, instr).unwrap();
        assert_eq!(
            b.patch(slot, instr),
            Err(BuildError::DoublePatch {
                offset: slot.offset()
            })
        );
        let prog = b.resolve(1).unwrap();
        assert_eq!(prog.code[0].opcode(), Some(Opcode::PushConst));
        assert_eq!(prog.consts, vec![Value::Float64(2.5)]);
    }

    #[test]
    fn test_unpatched_reservation_rejected() {
        let mut b = Builder::new();
        b.reserve();
        assert_eq!(b.resolve(1).unwrap_err(), BuildError::Unpatched { offset: 0 });
    }

    #[test]
    fn test_small_ints_inline_large_ints_pool() {
        let mut b = Builder::new();
        let small = b.value_instr(Value::Int(-7));
        assert_eq!(small.decode_push_int(), (Some(Kind::Int), -7));
        let large = b.value_instr(Value::Int(1 << 40));
        assert_eq!(large.opcode(), Some(Opcode::PushConst));
        let again = b.value_instr(Value::Int(1 << 40));
        assert_eq!(large, again);
    }

    #[test]
    fn test_large_arity_pushes_extra_count() {
        let mut b = Builder::new();
        b.call_nativev(3, CallArity::Count(1100));
        let code = b.code();
        assert_eq!(code.len(), 2);
        assert_eq!(code[0].decode_push_int(), (Some(Kind::Int), 78));
        assert_eq!(code[1].decode_funcv(), (ARITY_MAX, 3));
    }

    #[test]
    fn test_results_before_vars() {
        let mut b = Builder::new();
        let f = fixed_func(&mut b, "f");
        b.define_var(Some(f), Var::new("x", Type::INT));
        let err = b.results(f, vec![Var::positional(0, Type::INT)]).unwrap_err();
        assert!(matches!(err, BuildError::ResultsAfterVars { .. }));
    }

    #[test]
    fn test_var_addresses() {
        let mut b = Builder::new();
        let f = b.new_func("f", 2);
        let g0 = b.define_var(None, Var::new("a", Type::INT));
        let l0 = b.define_var(Some(f), Var::new("b", Type::INT));
        let l1 = b.define_var(Some(f), Var::new("c", Type::INT));
        assert!(b.var(g0).is_global());
        assert_eq!(b.var(l0).addr().unwrap().nest_depth, 2);
        assert_eq!(b.var(l1).addr().unwrap().index, 1);
    }

    #[test]
    fn test_program_postcard_roundtrip() {
        let mut b = Builder::new();
        b.define_var(None, Var::new("s", Type::STRING));
        b.push_value(Value::String("hello".into()));
        b.store_var(crate::bytecode::instr::SCOPE_GLOBAL, 0);
        let prog = b.resolve(2).unwrap();

        let bytes = prog.to_bytes().unwrap();
        let back = Program::from_bytes(&bytes).unwrap();
        assert_eq!(back.code, prog.code);
        assert_eq!(back.consts, prog.consts);
        assert_eq!(back.global("s").unwrap().ty, Type::STRING);
    }
}
