use super::consts;
use super::infer::{ConstSlot, FuncRef, Inferred, NonValue};
use super::{Compiler, Mode, Symbol};
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::func::FuncId;
use crate::bytecode::op::{self, AddrOperator};
use crate::bytecode::program::CallArity;
use crate::lang::ast::{BinaryExpr, CallExpr, Expr, FuncLit, SelectorExpr};
use crate::lang::literal::{Constant, to_const};
use crate::lang::types::{ConstKind, FuncType, Kind, Type};
use crate::lang::value::Value;
use crate::runtime::builtin::UNIVERSE;
use crate::runtime::native::{self, NativePackage, SymbolKind, find_package};
use std::sync::Arc;

/// Short source-like rendering of an expression for error messages.
pub(super) fn expr_name(e: &Expr) -> String {
    match e {
        Expr::Ident(name) => name.clone(),
        Expr::BasicLit(lit) => lit.value.clone(),
        Expr::Binary(b) => format!("{} {} {}", expr_name(&b.x), b.op, expr_name(&b.y)),
        Expr::Call(c) => format!("{}(...)", expr_name(&c.fun)),
        Expr::Selector(s) => format!("{}.{}", expr_name(&s.x), s.sel),
        Expr::FuncLit(_) => "func literal".to_string(),
        Expr::AddrOf(x) => format!("&{}", expr_name(x)),
        Expr::Star(x) => format!("*{}", expr_name(x)),
    }
}

fn qualified(pkg: &str, name: &str) -> String {
    if pkg.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", pkg, name)
    }
}

impl<'a> Compiler<'a> {
    pub(super) fn expr(&mut self, e: &'a Expr, mode: Mode) -> Result<(), CompileError> {
        match (e, mode) {
            (Expr::Ident(name), Mode::Assign) => self.assign_ident(name),
            (Expr::Ident(name), Mode::Define) => self.define_ident(name),
            (Expr::Star(p), Mode::Assign) => self.assign_through(p),
            (other, Mode::Assign | Mode::Define) => Err(CompileError::InvalidAssignTarget {
                target: expr_name(other),
            }),
            (Expr::Ident(name), _) => self.ident(name, mode),
            (Expr::BasicLit(lit), _) => {
                let value = to_const(lit)?;
                self.push_const(value, mode);
                Ok(())
            }
            (Expr::Binary(b), _) => self.binary(b, mode),
            (Expr::Call(c), _) => self.call(c, mode),
            (Expr::Selector(s), _) => self.selector(s, mode),
            (Expr::FuncLit(f), _) => self.func_lit(f, mode),
            (Expr::AddrOf(x), _) => self.addr_of(x, mode),
            (Expr::Star(p), _) => self.star(p, mode),
        }
    }

    // =========================================================================
    // Identifiers
    // =========================================================================

    fn ident(&mut self, name: &str, mode: Mode) -> Result<(), CompileError> {
        match self.lookup(name) {
            Some(Symbol::Var(id)) => {
                let ty = self.builder.var(id).ty.clone();
                if mode == Mode::Eval {
                    let (scope, index) = self.var_operand(id)?;
                    self.builder.load_var(scope, index);
                }
                self.infer.push(Inferred::Value(ty));
            }
            Some(Symbol::Param { func, index, ty }) => {
                let below = self.param_slot(name, func, index)?;
                if mode == Mode::Eval {
                    self.builder.load_arg(below);
                }
                self.infer.push(Inferred::Value(ty));
            }
            Some(Symbol::Package(pkg)) => {
                self.infer.push(Inferred::NonValue(NonValue::Package {
                    path: pkg.path().to_string(),
                    name: name.to_string(),
                }));
            }
            Some(Symbol::Func(id)) => self.func_value(id, false, mode)?,
            None => self.universe(name, mode)?,
        }
        Ok(())
    }

    // =========================================================================
    // Pointers
    // =========================================================================

    /// `&x`: only variables have addresses.
    pub(super) fn addr_of(&mut self, x: &'a Expr, mode: Mode) -> Result<(), CompileError> {
        let Expr::Ident(name) = x else {
            return Err(CompileError::unsupported(format!("address of {}", expr_name(x))));
        };
        match self.lookup(name) {
            Some(Symbol::Var(id)) => {
                let ty = self.builder.var(id).ty.clone();
                if mode == Mode::Eval {
                    let (scope, index) = self.var_operand(id)?;
                    self.builder.addr_var(scope, index);
                }
                self.infer.push(Inferred::Value(Type::ptr_to(ty)));
                Ok(())
            }
            Some(Symbol::Param { .. }) => Err(CompileError::unsupported_with_hint(
                format!("address of parameter {}", name),
                "copy it into a local variable first",
            )),
            Some(Symbol::Func(_)) | Some(Symbol::Package(_)) => {
                Err(CompileError::unsupported(format!("address of {}", name)))
            }
            None => Err(CompileError::unresolved(name)),
        }
    }

    /// Element type of the pointer `p` evaluates to.
    pub(super) fn pointee(&mut self, p: &'a Expr) -> Result<Type, CompileError> {
        self.expr(p, Mode::InferOnly)?;
        match self.infer.pop() {
            Inferred::Value(ty) if ty.kind() == Kind::Ptr => ty
                .elem()
                .cloned()
                .ok_or_else(|| CompileError::internal(format!("pointer type {} has no element", ty))),
            Inferred::Value(ty) => Err(CompileError::type_mismatch(
                "pointer",
                ty,
                format!("dereference of {}", expr_name(p)),
            )),
            other => Err(CompileError::not_a_value(other.describe())),
        }
    }

    /// `*p` read.
    fn star(&mut self, p: &'a Expr, mode: Mode) -> Result<(), CompileError> {
        let elem = self.pointee(p)?;
        if mode == Mode::Eval {
            self.expr(p, Mode::Eval)?;
            self.infer.pop();
            self.builder.addr_op(elem.kind(), AddrOperator::Val);
        }
        self.infer.push(Inferred::Value(elem));
        Ok(())
    }

    /// `*p = <top>`
    fn assign_through(&mut self, p: &'a Expr) -> Result<(), CompileError> {
        let elem = self.pointee(p)?;
        self.check_type(&elem, &format!("assignment to *{}", expr_name(p)))?;
        self.infer.pop();
        self.expr(p, Mode::Eval)?;
        self.infer.pop();
        self.builder.addr_op(elem.kind(), AddrOperator::Assign);
        Ok(())
    }

    fn universe(&mut self, name: &str, mode: Mode) -> Result<(), CompileError> {
        if name == "true" || name == "false" {
            self.push_const(Constant::Bound(Value::Bool(name == "true")), mode);
            return Ok(());
        }
        let found = match find_package(UNIVERSE) {
            Some(pkg) => self.native_member(&pkg, name, mode)?,
            None => false,
        };
        if found {
            Ok(())
        } else {
            Err(CompileError::unresolved(name))
        }
    }

    /// A script function used as an expression. Only an evaluated use
    /// produces a value: a closure over the current context.
    fn func_value(&mut self, id: FuncId, literal: bool, mode: Mode) -> Result<(), CompileError> {
        let sig = self.func_sig(id)?;
        if mode == Mode::InferOnly {
            self.infer.push(Inferred::Func {
                func: FuncRef::Script { id, literal },
                sig,
            });
        } else {
            self.builder.host_closure(id);
            self.infer.push(Inferred::Value(Type::Func(sig)));
        }
        Ok(())
    }

    /// Resolve `name` in a native package. Returns false if it is not there.
    fn native_member(
        &mut self,
        pkg: &NativePackage,
        name: &str,
        mode: Mode,
    ) -> Result<bool, CompileError> {
        let Some((addr, kind)) = pkg.find(name) else {
            return Ok(false);
        };
        let missing = || CompileError::internal(format!("native symbol {} has no entry", name));
        match kind {
            SymbolKind::Var => {
                let info = native::var_info(addr).ok_or_else(missing)?;
                if mode == Mode::Eval {
                    self.builder.load_native_var(addr);
                }
                self.infer.push(Inferred::Value(info.var.ty.clone()));
            }
            SymbolKind::Func | SymbolKind::Funcv => {
                let variadic = kind == SymbolKind::Funcv;
                let sig = if variadic {
                    native::funcv_info(addr).ok_or_else(missing)?.func.signature().clone()
                } else {
                    native::func_info(addr).ok_or_else(missing)?.func.signature().clone()
                };
                match mode {
                    Mode::InferOnly => self.infer.push(Inferred::Func {
                        func: FuncRef::Native {
                            addr,
                            variadic,
                            method: false,
                            name: qualified(pkg.path(), name),
                        },
                        sig,
                    }),
                    _ => {
                        if variadic {
                            self.builder.push_nativev(addr);
                        } else {
                            self.builder.push_native(addr);
                        }
                        self.infer.push(Inferred::Value(Type::Func(sig)));
                    }
                }
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Constants and coercion
    // =========================================================================

    /// Bound constants are emitted right away; unbound ones hold a reserved
    /// slot until context decides their kind.
    pub(super) fn push_const(&mut self, value: Constant, mode: Mode) {
        let slot = match (mode, &value) {
            (Mode::InferOnly, _) => ConstSlot::Pending,
            (_, Constant::Bound(v)) => {
                self.builder.push_value(v.clone());
                ConstSlot::Emitted
            }
            _ => ConstSlot::Reserved(self.builder.reserve()),
        };
        self.infer.push(Inferred::Const { value, slot });
    }

    /// Bind a reserved constant to `value` and patch its slot.
    fn patch_const(&mut self, slot: ConstSlot, value: Value) -> Result<Inferred, CompileError> {
        if let ConstSlot::Reserved(r) = slot {
            let instr = self.builder.value_instr(value.clone());
            self.builder.patch(r, instr)?;
        }
        Ok(Inferred::Const {
            value: Constant::Bound(value),
            slot: ConstSlot::Emitted,
        })
    }

    /// Bring the top value to `kind`: binds a reserved constant, converts
    /// anything else of a different kind.
    pub(super) fn coerce_top(&mut self, kind: Kind) -> Result<(), CompileError> {
        let top = self.infer.pop();
        let out = match top {
            Inferred::Const {
                value,
                slot: slot @ ConstSlot::Reserved(_),
            } => self.patch_const(slot, value.bind(kind)?)?,
            Inferred::Const {
                value: Constant::Bound(v),
                slot,
            } if v.kind() != kind => {
                if slot != ConstSlot::Emitted {
                    return Err(CompileError::internal("coercing an unemitted constant"));
                }
                self.builder.convert(kind);
                Inferred::Value(Type::Basic(kind))
            }
            Inferred::Value(ty) if ty.kind() != kind => {
                self.builder.convert(kind);
                Inferred::Value(Type::Basic(kind))
            }
            other => other,
        };
        self.infer.push(out);
        Ok(())
    }

    /// Give a reserved constant on top its default kind.
    pub(super) fn bind_default_top(&mut self) -> Result<(), CompileError> {
        let kind = match self.infer.top() {
            Inferred::Const {
                value,
                slot: ConstSlot::Reserved(_),
            } => value.kind().default_kind(),
            _ => return Ok(()),
        };
        self.coerce_top(kind)
    }

    /// Check the top value can be stored in a slot of type `target` and
    /// retype it as `target`.
    pub(super) fn check_type(&mut self, target: &Type, context: &str) -> Result<(), CompileError> {
        let top = self.infer.pop();
        match top {
            Inferred::Const { value, slot } => {
                let kind = match target {
                    Type::Any => value.kind().default_kind(),
                    t if t.kind().is_basic() => t.kind(),
                    t => return Err(CompileError::type_mismatch(t, value.kind(), context)),
                };
                match (&value, slot) {
                    (_, ConstSlot::Reserved(_)) => {
                        self.patch_const(slot, value.bind(kind)?)?;
                    }
                    (Constant::Bound(v), _) if v.kind() != kind => {
                        return Err(CompileError::type_mismatch(target, v.kind(), context));
                    }
                    _ => {}
                }
            }
            Inferred::Value(ty) => {
                if !ty.assignable_to(target) {
                    return Err(CompileError::type_mismatch(target, ty, context));
                }
            }
            Inferred::Results(types) if types.is_empty() => {
                return Err(CompileError::not_a_value(format!("empty result in {}", context)));
            }
            Inferred::Results(_) => return Err(CompileError::multi_value(context)),
            other => return Err(CompileError::not_a_value(other.describe())),
        }
        self.infer.push(Inferred::Value(target.clone()));
        Ok(())
    }

    // =========================================================================
    // Binary operators
    // =========================================================================

    pub(super) fn operand_kind(entry: &Inferred, e: &Expr) -> Result<ConstKind, CompileError> {
        match entry {
            Inferred::Results(types) if types.len() > 1 => {
                Err(CompileError::multi_value(expr_name(e)))
            }
            Inferred::Results(_) | Inferred::NonValue(_) => {
                Err(CompileError::not_a_value(expr_name(e)))
            }
            other => other
                .const_kind()
                .ok_or_else(|| CompileError::not_a_value(expr_name(e))),
        }
    }

    fn binary(&mut self, b: &'a BinaryExpr, mode: Mode) -> Result<(), CompileError> {
        let base = self.infer.len();
        self.expr(&b.x, Mode::InferOnly)?;
        self.expr(&b.y, Mode::InferOnly)?;
        let x = self.infer.get(-2).clone();
        let y = self.infer.get(-1).clone();
        self.infer.set_len(base);

        let mut kx = Self::operand_kind(&x, &b.x)?;
        let mut ky = Self::operand_kind(&y, &b.y)?;

        if let (Inferred::Const { value: cx, .. }, Inferred::Const { value: cy, .. }) = (&x, &y) {
            if self.config.fold_constants {
                let folded = consts::fold(b.op, cx, cy)?;
                self.push_const(folded, mode);
                return Ok(());
            }
            if !kx.is_bound() && !ky.is_bound() && !b.op.is_shift() {
                kx = ConstKind::Bound(kx.default_kind());
                ky = ConstKind::Bound(ky.default_kind());
            }
        }

        let res = op::resolve(b.op, kx, ky)?;
        if mode == Mode::InferOnly {
            self.infer.push(Inferred::Value(Type::Basic(res.result)));
            return Ok(());
        }

        self.expr(&b.x, Mode::Eval)?;
        self.coerce_top(res.x)?;
        self.expr(&b.y, Mode::Eval)?;
        match res.y {
            Some(kind) => self.coerce_top(kind)?,
            None => self.bind_default_top()?,
        }
        self.builder.builtin_op(res.operand, b.op);
        self.infer.ret(2, [Inferred::Value(Type::Basic(res.result))]);
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn push_results(&mut self, results: &[Type]) {
        if results.len() == 1 {
            self.infer.push(Inferred::Value(results[0].clone()));
        } else {
            self.infer.push(Inferred::Results(results.to_vec()));
        }
    }

    fn call(&mut self, c: &'a CallExpr, mode: Mode) -> Result<(), CompileError> {
        let base = self.infer.len();
        self.expr(&c.fun, Mode::InferOnly)?;
        let (func, sig) = match self.infer.pop() {
            Inferred::Func { func, sig } => (Some(func), sig),
            Inferred::Value(ty) => match ty.as_func() {
                Some(sig) => (None, sig.clone()),
                None => return Err(CompileError::not_callable(format!("{} of type {}", expr_name(&c.fun), ty))),
            },
            other => return Err(CompileError::not_callable(other.describe())),
        };

        if mode == Mode::InferOnly {
            self.push_results(&sig.results);
            return Ok(());
        }

        let callee = expr_name(&c.fun);
        match func {
            Some(FuncRef::Script { id, literal }) => {
                let arity = self.args(c, &sig, 0, &callee)?;
                if literal {
                    self.builder.closure(id);
                    self.builder.call_closure(arity);
                } else if sig.variadic {
                    self.builder.call_funcv(id, arity);
                } else {
                    self.builder.call_func(id);
                }
            }
            Some(FuncRef::Native {
                addr,
                variadic,
                method,
                ..
            }) => {
                let skip = if method {
                    let Expr::Selector(s) = &c.fun else {
                        return Err(CompileError::internal("method call without a selector"));
                    };
                    let recv = sig
                        .params
                        .first()
                        .ok_or_else(|| CompileError::internal(format!("method {} has no receiver", callee)))?;
                    self.expr(&s.x, Mode::Eval)?;
                    self.check_type(recv, &format!("receiver of {}", callee))?;
                    1
                } else {
                    0
                };
                let arity = match self.args(c, &sig, skip, &callee)? {
                    CallArity::Count(n) => CallArity::Count(n + skip),
                    CallArity::Spread => CallArity::Spread,
                };
                if variadic {
                    self.builder.call_nativev(addr, arity);
                } else {
                    self.builder.call_native(addr);
                }
            }
            None => {
                let arity = self.args(c, &sig, 0, &callee)?;
                self.expr(&c.fun, Mode::Eval)?;
                self.builder.call_value(arity);
            }
        }

        self.infer.set_len(base);
        self.push_results(&sig.results);
        Ok(())
    }

    /// Compile call arguments against `sig.params[skip..]`.
    fn args(
        &mut self,
        c: &'a CallExpr,
        sig: &FuncType,
        skip: usize,
        callee: &str,
    ) -> Result<CallArity, CompileError> {
        let params = &sig.params[skip.min(sig.params.len())..];
        let context = format!("argument to {}", callee);

        if c.ellipsis {
            if !sig.variadic {
                return Err(CompileError::unsupported(format!(
                    "'...' in call to non-variadic {}",
                    callee
                )));
            }
            if c.args.len() != params.len() {
                return Err(CompileError::arity(callee, params.len().to_string(), c.args.len()));
            }
            for (arg, param) in c.args.iter().zip(params) {
                self.expr(arg, Mode::Eval)?;
                self.check_type(param, &context)?;
            }
            return Ok(CallArity::Spread);
        }

        let nfixed = if sig.variadic {
            params.len().saturating_sub(1)
        } else {
            params.len()
        };
        let elem = sig.variadic_elem().cloned().unwrap_or(Type::Any);
        let param_type = |i: usize| {
            if i < nfixed {
                params[i].clone()
            } else {
                elem.clone()
            }
        };
        let check_count = |got: usize| {
            if sig.variadic && got < nfixed {
                Err(CompileError::arity(callee, format!("at least {}", nfixed), got))
            } else if !sig.variadic && got != nfixed {
                Err(CompileError::arity(callee, nfixed.to_string(), got))
            } else {
                Ok(())
            }
        };

        if let [sole] = c.args.as_slice() {
            self.expr(sole, Mode::InferOnly)?;
            let multi = matches!(self.infer.pop(), Inferred::Results(ref t) if t.len() > 1);
            if multi {
                self.expr(sole, Mode::Eval)?;
                let Inferred::Results(types) = self.infer.pop() else {
                    return Err(CompileError::internal("call results changed between passes"));
                };
                check_count(types.len())?;
                for (i, ty) in types.iter().enumerate() {
                    let target = param_type(i);
                    if !ty.assignable_to(&target) {
                        return Err(CompileError::type_mismatch(&target, ty, &context));
                    }
                    self.infer.push(Inferred::Value(target));
                }
                return Ok(CallArity::Count(types.len()));
            }
        }

        check_count(c.args.len())?;
        for (i, arg) in c.args.iter().enumerate() {
            self.expr(arg, Mode::Eval)?;
            self.check_type(&param_type(i), &context)?;
        }
        Ok(CallArity::Count(c.args.len()))
    }

    // =========================================================================
    // Selectors
    // =========================================================================

    fn selector(&mut self, s: &'a SelectorExpr, mode: Mode) -> Result<(), CompileError> {
        self.expr(&s.x, Mode::InferOnly)?;
        match self.infer.pop() {
            Inferred::NonValue(NonValue::Package { path, name }) => {
                let pkg = find_package(&path).ok_or(CompileError::PackageNotFound { path })?;
                if self.native_member(&pkg, &s.sel, mode)? {
                    Ok(())
                } else {
                    Err(CompileError::member_not_found(format!("package {}", name), &s.sel))
                }
            }
            Inferred::Value(ty) => {
                let (nptr, base) = ty.count_ptr();
                if let Some((index, field_ty)) = base.field(&s.sel) {
                    let field_ty = field_ty.clone();
                    if mode == Mode::Eval {
                        self.expr(&s.x, Mode::Eval)?;
                        self.infer.pop();
                        for _ in 0..nptr {
                            self.builder.deref();
                        }
                        self.builder.field(index);
                    }
                    self.infer.push(Inferred::Value(field_ty));
                    return Ok(());
                }
                match Self::method(&ty, &s.sel)? {
                    Some((func, sig)) if mode == Mode::InferOnly => {
                        self.infer.push(Inferred::Func { func, sig });
                        Ok(())
                    }
                    Some(_) => Err(CompileError::unsupported_with_hint(
                        format!("method value {}", expr_name(&s.x)),
                        format!("call the method directly: {}.{}(...)", expr_name(&s.x), s.sel),
                    )),
                    None => Err(CompileError::member_not_found(&ty, &s.sel)),
                }
            }
            other => Err(CompileError::member_not_found(other.describe(), &s.sel)),
        }
    }

    /// Native method lookup, keyed `(T).M` or `(*T).M` in the package of `T`.
    fn method(ty: &Type, sel: &str) -> Result<Option<(FuncRef, Arc<FuncType>)>, CompileError> {
        let (nptr, base) = ty.count_ptr();
        let Type::Named(named) = base else {
            return Ok(None);
        };
        let Some(pkg) = find_package(&named.pkg_path) else {
            return Ok(None);
        };
        let key = format!("({}{}).{}", "*".repeat(nptr), named.name, sel);
        let missing = || CompileError::internal(format!("native method {} has no entry", key));
        let (addr, variadic, sig) = match pkg.find(&key) {
            Some((addr, SymbolKind::Func)) => {
                let info = native::func_info(addr).ok_or_else(missing)?;
                (addr, false, info.func.signature().clone())
            }
            Some((addr, SymbolKind::Funcv)) => {
                let info = native::funcv_info(addr).ok_or_else(missing)?;
                (addr, true, info.func.signature().clone())
            }
            _ => return Ok(None),
        };
        let func = FuncRef::Native {
            addr,
            variadic,
            method: true,
            name: qualified(pkg.path(), &key),
        };
        Ok(Some((func, sig)))
    }

    // =========================================================================
    // Function literals
    // =========================================================================

    fn func_lit(&mut self, lit: &'a FuncLit, mode: Mode) -> Result<(), CompileError> {
        let id = self.literal_func(lit)?;
        self.func_value(id, true, mode)
    }
}
