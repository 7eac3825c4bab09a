use super::expr::expr_name;
use super::infer::{Inferred, NonValue};
use super::{Compiler, Mode, Symbol};
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::{self, AddrOperator, Operator};
use crate::lang::ast::{AssignStmt, AssignTok, Expr, Stmt};
use crate::lang::literal::Constant;
use crate::lang::types::{ConstKind, Type};
use crate::lang::value::Value;
use tracing::warn;

/// Target of an update or increment statement.
enum Place {
    /// A variable or pointee, written through its address.
    Addr(Type),
    /// A parameter of the running function, `below` slots under the frame base.
    Arg { below: u32, ty: Type },
}

impl Place {
    fn ty(&self) -> &Type {
        match self {
            Place::Addr(ty) | Place::Arg { ty, .. } => ty,
        }
    }
}

impl<'a> Compiler<'a> {
    pub(super) fn compile_stmts(&mut self, stmts: &'a [Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.stmt(stmt)?;
            assert!(
                self.infer.is_empty(),
                "inference stack holds {} entries after a statement in {}",
                self.infer.len(),
                self.state.name
            );
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &'a Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(e) => self.expr_stmt(e),
            Stmt::Assign(a) => self.assign(a),
            Stmt::Return(values) => self.return_stmt(values),
            Stmt::IncDec(s) => self.inc_dec(&s.x, s.inc),
            Stmt::Block(block) => {
                self.push_scope();
                let result = self.compile_stmts(&block.stmts);
                self.pop_scope();
                result
            }
        }
    }

    /// Evaluate and drop.
    fn expr_stmt(&mut self, e: &'a Expr) -> Result<(), CompileError> {
        self.expr(e, Mode::Eval)?;
        match self.infer.top() {
            Inferred::Results(types) => {
                let n = types.len();
                self.infer.pop();
                self.builder.pop(n);
            }
            Inferred::NonValue(NonValue::Package { name, .. }) => {
                return Err(CompileError::not_a_value(format!("package {}", name)));
            }
            _ => {
                self.bind_default_top()?;
                self.infer.pop();
                self.builder.pop(1);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    fn assign(&mut self, a: &'a AssignStmt) -> Result<(), CompileError> {
        let mode = match a.tok {
            AssignTok::Assign => Mode::Assign,
            AssignTok::Define => Mode::Define,
            AssignTok::Update(op) => {
                return match (a.lhs.as_slice(), a.rhs.as_slice()) {
                    ([target], [value]) => self.update(op, target, value),
                    _ => Err(CompileError::ValueCount {
                        lhs: a.lhs.len(),
                        rhs: a.rhs.len(),
                    }),
                };
            }
        };
        let n = a.lhs.len();

        if let ([rhs], true) = (a.rhs.as_slice(), n != 1) {
            self.expr(rhs, Mode::Eval)?;
            match self.infer.pop() {
                Inferred::Results(types) if types.len() == n => {
                    self.infer.ret(0, types.into_iter().map(Inferred::Value));
                }
                Inferred::Results(types) => {
                    return Err(CompileError::ValueCount {
                        lhs: n,
                        rhs: types.len(),
                    });
                }
                _ => return Err(CompileError::ValueCount { lhs: n, rhs: 1 }),
            }
        } else {
            if a.rhs.len() != n {
                return Err(CompileError::ValueCount {
                    lhs: n,
                    rhs: a.rhs.len(),
                });
            }
            for e in &a.rhs {
                self.expr(e, Mode::Eval)?;
                match self.infer.top() {
                    Inferred::Results(types) if types.is_empty() => {
                        return Err(CompileError::not_a_value(format!(
                            "{} (no value)",
                            expr_name(e)
                        )));
                    }
                    Inferred::Results(_) => return Err(CompileError::multi_value(expr_name(e))),
                    Inferred::NonValue(_) => return Err(CompileError::not_a_value(expr_name(e))),
                    _ => {}
                }
            }
        }

        for target in a.lhs.iter().rev() {
            self.expr(target, mode)?;
        }
        Ok(())
    }

    fn discard_top(&mut self) -> Result<(), CompileError> {
        self.bind_default_top()?;
        self.infer.pop();
        self.builder.pop(1);
        Ok(())
    }

    /// `name := <top>`
    pub(super) fn define_ident(&mut self, name: &str) -> Result<(), CompileError> {
        if name == "_" {
            return self.discard_top();
        }
        if self.declared_here(name) {
            return Err(CompileError::Redefined {
                name: name.to_string(),
            });
        }
        if self.lookup(name).is_some() {
            warn!(name, func = %self.state.name, "declaration shadows an outer binding");
        }

        self.bind_default_top()?;
        let ty = match self.infer.pop() {
            Inferred::Const {
                value: Constant::Bound(v),
                ..
            } => Type::Basic(v.kind()),
            Inferred::Value(ty) => ty,
            other => return Err(CompileError::not_a_value(other.describe())),
        };
        let id = self.define_var(name, ty);
        self.declare(name, Symbol::Var(id))?;
        let (scope, index) = self.var_operand(id)?;
        self.builder.store_var(scope, index);
        Ok(())
    }

    /// `name = <top>`
    pub(super) fn assign_ident(&mut self, name: &str) -> Result<(), CompileError> {
        if name == "_" {
            return self.discard_top();
        }
        let context = format!("assignment to {}", name);
        match self.lookup(name) {
            Some(Symbol::Var(id)) => {
                let ty = self.builder.var(id).ty.clone();
                self.check_type(&ty, &context)?;
                self.infer.pop();
                let (scope, index) = self.var_operand(id)?;
                self.builder.store_var(scope, index);
                Ok(())
            }
            Some(Symbol::Param { func, index, ty }) => {
                let below = self.param_slot(name, func, index)?;
                self.check_type(&ty, &context)?;
                self.infer.pop();
                self.builder.store_arg(below);
                Ok(())
            }
            Some(Symbol::Func(_)) | Some(Symbol::Package(_)) => {
                Err(CompileError::InvalidAssignTarget {
                    target: name.to_string(),
                })
            }
            None => Err(CompileError::assign_undeclared(name)),
        }
    }

    // =========================================================================
    // Updates through a place
    // =========================================================================

    fn place(&mut self, target: &'a Expr) -> Result<Place, CompileError> {
        match target {
            Expr::Ident(name) => match self.lookup(name) {
                Some(Symbol::Var(id)) => Ok(Place::Addr(self.builder.var(id).ty.clone())),
                Some(Symbol::Param { func, index, ty }) => Ok(Place::Arg {
                    below: self.param_slot(name, func, index)?,
                    ty,
                }),
                Some(Symbol::Func(_)) | Some(Symbol::Package(_)) => {
                    Err(CompileError::InvalidAssignTarget {
                        target: name.to_string(),
                    })
                }
                None => Err(CompileError::assign_undeclared(name)),
            },
            Expr::Star(p) => Ok(Place::Addr(self.pointee(p)?)),
            other => Err(CompileError::InvalidAssignTarget {
                target: expr_name(other),
            }),
        }
    }

    /// Emit the pointer to an addressable place.
    fn place_addr(&mut self, target: &'a Expr) -> Result<(), CompileError> {
        match target {
            Expr::Star(p) => self.expr(p, Mode::Eval)?,
            other => self.addr_of(other, Mode::Eval)?,
        }
        self.infer.pop();
        Ok(())
    }

    /// `target op= value`
    fn update(&mut self, op: Operator, target: &'a Expr, value: &'a Expr) -> Result<(), CompileError> {
        if !op.has_update_form() {
            return Err(CompileError::unsupported(format!("{}= assignment", op)));
        }
        let context = format!("{}= to {}", op, expr_name(target));
        let place = self.place(target)?;
        let ty = place.ty().clone();
        let kind = ty.kind();

        self.expr(value, Mode::InferOnly)?;
        let entry = self.infer.pop();
        let res = op::resolve(op, ConstKind::Bound(kind), Self::operand_kind(&entry, value)?)?;
        if res.x != kind {
            return Err(CompileError::type_mismatch(&ty, res.x, context));
        }

        if let Place::Arg { below, .. } = place {
            self.builder.load_arg(below);
        }
        self.expr(value, Mode::Eval)?;
        match res.y {
            Some(k) => self.coerce_top(k)?,
            None => self.bind_default_top()?,
        }
        self.infer.pop();

        match place {
            Place::Addr(_) => {
                self.place_addr(target)?;
                self.builder.addr_op(kind, AddrOperator::Update(op));
            }
            Place::Arg { below, .. } => {
                self.builder.builtin_op(res.operand, op);
                self.builder.store_arg(below);
            }
        }
        Ok(())
    }

    /// `target++` / `target--`
    fn inc_dec(&mut self, target: &'a Expr, inc: bool) -> Result<(), CompileError> {
        let place = self.place(target)?;
        let kind = place.ty().kind();
        let op = if inc { Operator::Add } else { Operator::Sub };
        if !kind.is_numeric() {
            return Err(CompileError::operator_not_defined(op, kind));
        }
        match place {
            Place::Addr(_) => {
                self.place_addr(target)?;
                let aop = if inc { AddrOperator::Inc } else { AddrOperator::Dec };
                self.builder.addr_op(kind, aop);
            }
            Place::Arg { below, .. } => {
                let one = Value::Int(1)
                    .convert(kind)
                    .ok_or_else(|| CompileError::internal(format!("no unit value of {}", kind)))?;
                self.builder.load_arg(below);
                self.builder.push_value(one);
                self.builder.builtin_op(kind, op);
                self.builder.store_arg(below);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Return
    // =========================================================================

    fn return_stmt(&mut self, values: &'a [Expr]) -> Result<(), CompileError> {
        if self.state.id.is_none() {
            return Err(CompileError::ReturnOutsideFunction);
        }
        let results = self.state.results.clone();
        let func = self.state.name.clone();

        if values.is_empty() {
            if results.is_empty() || self.state.named_results {
                self.builder.ret_vars();
                return Ok(());
            }
            return Err(CompileError::bare_return(&func));
        }

        let count_error = |got: usize| CompileError::ReturnCount {
            func: func.clone(),
            expected: results.len(),
            got,
        };

        if let ([value], true) = (values, results.len() > 1) {
            self.expr(value, Mode::Eval)?;
            match self.infer.pop() {
                Inferred::Results(types) if types.len() == results.len() => {
                    for (ty, want) in types.iter().zip(&results) {
                        if !ty.assignable_to(want) {
                            return Err(CompileError::type_mismatch(want, ty, "return statement"));
                        }
                    }
                }
                Inferred::Results(types) => return Err(count_error(types.len())),
                _ => return Err(count_error(1)),
            }
            self.builder.ret(results.len());
            return Ok(());
        }

        if values.len() != results.len() {
            return Err(count_error(values.len()));
        }
        for (value, want) in values.iter().zip(&results) {
            self.expr(value, Mode::Eval)?;
            self.check_type(want, "return statement")?;
        }
        self.infer.set_len(0);
        self.builder.ret(results.len());
        Ok(())
    }
}
