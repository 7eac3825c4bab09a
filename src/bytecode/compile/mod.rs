//! # Quill Compiler
//!
//! Single pass from a [`File`] to a bytecode [`Program`].
//!
//! Expressions are compiled against an [`InferStack`] that shadows the
//! runtime stack. Every routine that emits code pushes exactly as many
//! inferred entries as the code leaves values; statements check that the
//! shadow stack is empty again when they finish.
//!
//! Function bodies never interleave with the main body: declarations and
//! function literals are queued and compiled after the main body, each into
//! its own `define_func`/`end_func` range. Calls that precede a body are
//! forward references patched by [`Builder::resolve`].

mod consts;
mod expr;
mod infer;
mod stmt;


pub use infer::{ConstSlot, FuncRef, InferStack, Inferred, NonValue};

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::func::{FuncId, Var, VarId};
use crate::bytecode::instr::SCOPE_GLOBAL;
use crate::bytecode::program::{Builder, Program};
use crate::lang::ast::{Block, File, FuncDecl, FuncLit, FuncTypeExpr, TypeExpr};
use crate::lang::types::{FuncType, Kind, Type};
use crate::runtime::builtin;
use crate::runtime::native::{NativePackage, find_package};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Evaluate operators on constants at compile time.
    pub fold_constants: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            fold_constants: true,
        }
    }
}

/// Compile a file with the default configuration.
pub fn compile(file: &File) -> Result<Program, CompileError> {
    compile_with(file, CompilerConfig::default())
}

pub fn compile_with(file: &File, config: CompilerConfig) -> Result<Program, CompileError> {
    builtin::install()?;
    let mut compiler = Compiler::new(config);
    let main_end = compiler.compile_file(file)?;
    let program = compiler.builder.resolve(main_end)?;
    debug!(
        instrs = program.code.len(),
        funcs = program.funcs.len(),
        globals = program.main_vars.len(),
        "compiled file"
    );
    Ok(program)
}

/// How an expression is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Push the inferred value only; emit nothing.
    InferOnly,
    /// Emit code leaving the value on the stack.
    Eval,
    /// Store the value on top of the stack into the expression.
    Assign,
    /// Declare the expression as a new variable holding the top value.
    Define,
}

#[derive(Debug, Clone)]
enum Symbol {
    Var(VarId),
    /// A parameter of `func`, addressed relative to its frame base.
    Param { func: FuncId, index: usize, ty: Type },
    Package(NativePackage),
    Func(FuncId),
}

#[derive(Debug)]
struct Scope {
    parent: Option<usize>,
    /// Symbol plus its declaration sequence number.
    symbols: HashMap<String, (Symbol, u64)>,
}

/// A function body waiting to be compiled.
struct Body<'a> {
    id: FuncId,
    sig: Arc<FuncType>,
    ty: &'a FuncTypeExpr,
    block: &'a Block,
    /// Scope the body is nested in.
    scope: usize,
    visibility: Vec<(usize, u64)>,
}

/// The function whose body is being compiled.
#[derive(Debug, Clone)]
struct FuncState {
    id: Option<FuncId>,
    name: String,
    depth: u32,
    nparams: usize,
    results: Vec<Type>,
    named_results: bool,
    /// First scope created for this body; later scopes belong to it.
    body_floor: usize,
    /// `(floor, limit)` per enclosing body: in scopes from `floor` up, only
    /// symbols declared at or before `limit` are visible. A deferred body
    /// must not see what its creator declared after it.
    visibility: Vec<(usize, u64)>,
}

impl FuncState {
    fn main() -> FuncState {
        FuncState {
            id: None,
            name: "main".to_string(),
            depth: 0,
            nparams: 0,
            results: Vec::new(),
            named_results: false,
            body_floor: 0,
            visibility: Vec::new(),
        }
    }
}

pub(crate) struct Compiler<'a> {
    config: CompilerConfig,
    builder: Builder,
    infer: InferStack,
    scopes: Vec<Scope>,
    scope: usize,
    state: FuncState,
    seq: u64,
    queue: VecDeque<Body<'a>>,
    literals: HashMap<*const FuncLit, FuncId>,
}

impl<'a> Compiler<'a> {
    fn new(config: CompilerConfig) -> Self {
        Compiler {
            config,
            builder: Builder::new(),
            infer: InferStack::new(),
            scopes: vec![Scope {
                parent: None,
                symbols: HashMap::new(),
            }],
            scope: 0,
            state: FuncState::main(),
            seq: 0,
            queue: VecDeque::new(),
            literals: HashMap::new(),
        }
    }

    /// Compile everything; returns the end of the main body.
    fn compile_file(&mut self, file: &'a File) -> Result<usize, CompileError> {
        for import in &file.imports {
            let pkg = find_package(&import.path).ok_or_else(|| CompileError::PackageNotFound {
                path: import.path.clone(),
            })?;
            self.declare(import.local_name(), Symbol::Package(pkg))?;
        }
        for decl in &file.funcs {
            self.declare_func(decl)?;
        }

        self.compile_stmts(&file.stmts)?;
        let main_end = self.builder.len();

        while let Some(body) = self.queue.pop_front() {
            self.compile_body(body)?;
        }
        Ok(main_end)
    }

    // =========================================================================
    // Scopes and symbols
    // =========================================================================

    fn push_scope(&mut self) {
        self.scopes.push(Scope {
            parent: Some(self.scope),
            symbols: HashMap::new(),
        });
        self.scope = self.scopes.len() - 1;
    }

    fn pop_scope(&mut self) {
        if let Some(parent) = self.scopes[self.scope].parent {
            self.scope = parent;
        }
    }

    fn declare(&mut self, name: &str, symbol: Symbol) -> Result<(), CompileError> {
        self.seq += 1;
        let scope = &mut self.scopes[self.scope];
        if scope.symbols.contains_key(name) {
            return Err(CompileError::Redefined {
                name: name.to_string(),
            });
        }
        scope.symbols.insert(name.to_string(), (symbol, self.seq));
        Ok(())
    }

    fn declared_here(&self, name: &str) -> bool {
        self.scopes[self.scope].symbols.contains_key(name)
    }

    fn visible(&self, scope: usize, seq: u64) -> bool {
        if scope >= self.state.body_floor {
            return true;
        }
        match self.state.visibility.iter().rev().find(|(floor, _)| *floor <= scope) {
            Some((_, limit)) => seq <= *limit,
            None => true,
        }
    }

    fn lookup(&self, name: &str) -> Option<Symbol> {
        let mut at = Some(self.scope);
        while let Some(id) = at {
            let scope = &self.scopes[id];
            if let Some((symbol, seq)) = scope.symbols.get(name) {
                if self.visible(id, *seq) {
                    return Some(symbol.clone());
                }
            }
            at = scope.parent;
        }
        None
    }

    /// Scope-relative operand of a variable seen from the current function.
    fn var_operand(&self, id: VarId) -> Result<(u32, u32), CompileError> {
        let var = self.builder.var(id);
        let addr = var
            .addr()
            .ok_or_else(|| CompileError::internal(format!("variable {} has no address", var.name)))?;
        if addr.nest_depth == 0 {
            return Ok((SCOPE_GLOBAL, addr.index));
        }
        let distance = self.state.depth.checked_sub(addr.nest_depth).ok_or_else(|| {
            CompileError::internal(format!("variable {} is deeper than its user", var.name))
        })?;
        if distance >= SCOPE_GLOBAL {
            return Err(CompileError::unsupported(format!(
                "closures nested more than {} levels deep",
                SCOPE_GLOBAL - 1
            )));
        }
        Ok((distance, addr.index))
    }

    /// Distance below the frame base of a parameter of the current function.
    fn param_slot(&self, name: &str, func: FuncId, index: usize) -> Result<u32, CompileError> {
        if self.state.id != Some(func) {
            return Err(CompileError::capture_parameter(name));
        }
        Ok((self.state.nparams - index) as u32)
    }

    fn define_var(&mut self, name: &str, ty: Type) -> VarId {
        let var = Var::new(name, ty);
        let var = if self.scope != self.state.body_floor {
            var.in_block()
        } else {
            var
        };
        self.builder.define_var(self.state.id, var)
    }

    fn func_sig(&self, id: FuncId) -> Result<Arc<FuncType>, CompileError> {
        let func = self.builder.func(id);
        func.signature
            .clone()
            .ok_or_else(|| CompileError::internal(format!("function {} has no signature", func.name)))
    }

    // =========================================================================
    // Types
    // =========================================================================

    fn resolve_type(&self, ty: &TypeExpr) -> Result<Type, CompileError> {
        match ty {
            TypeExpr::Name(name) => basic_type(name).ok_or_else(|| CompileError::UnknownType {
                name: name.clone(),
            }),
            TypeExpr::Qualified { pkg, name } => {
                let unknown = || CompileError::UnknownType {
                    name: format!("{}.{}", pkg, name),
                };
                match self.lookup(pkg) {
                    Some(Symbol::Package(p)) => p.find_type(name).ok_or_else(unknown),
                    _ => Err(unknown()),
                }
            }
            TypeExpr::Slice(elem) => Ok(Type::slice_of(self.resolve_type(elem)?)),
            TypeExpr::Ptr(elem) => Ok(Type::ptr_to(self.resolve_type(elem)?)),
            TypeExpr::Func(f) => Ok(Type::Func(Arc::new(self.resolve_signature(f)?))),
        }
    }

    fn resolve_signature(&self, ty: &FuncTypeExpr) -> Result<FuncType, CompileError> {
        let mut params = ty
            .params
            .iter()
            .map(|f| self.resolve_type(&f.ty))
            .collect::<Result<Vec<_>, _>>()?;
        if ty.variadic {
            let last = params
                .pop()
                .ok_or_else(|| CompileError::unsupported("variadic signature without parameters"))?;
            params.push(Type::slice_of(last));
        }
        let results = ty
            .results
            .iter()
            .map(|f| self.resolve_type(&f.ty))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FuncType {
            params,
            results,
            variadic: ty.variadic,
        })
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn declare_func(&mut self, decl: &'a FuncDecl) -> Result<(), CompileError> {
        if let Some(recv) = &decl.recv {
            let ty = self.resolve_type(&recv.ty)?;
            let (_, base) = ty.count_ptr();
            return Err(match base {
                Type::Named(_) => CompileError::unsupported_with_hint(
                    format!("method declaration {}.{}", ty, decl.name),
                    "methods are provided by native packages",
                ),
                _ => CompileError::MalformedReceiver {
                    recv: ty.to_string(),
                    hint: Some("a receiver must be a named type or a pointer to one".to_string()),
                },
            });
        }

        let sig = Arc::new(self.resolve_signature(&decl.ty)?);
        let id = self.builder.new_func(&decl.name, 1);
        self.builder.set_variadic(id, sig.variadic)?;
        self.builder.set_signature(id, sig.clone());
        self.declare(&decl.name, Symbol::Func(id))?;

        if let Some(block) = &decl.body {
            self.queue.push_back(Body {
                id,
                sig,
                ty: &decl.ty,
                block,
                scope: 0,
                visibility: Vec::new(),
            });
        }
        Ok(())
    }

    /// Register a function literal once and queue its body.
    fn literal_func(&mut self, lit: &'a FuncLit) -> Result<FuncId, CompileError> {
        let key = lit as *const FuncLit;
        if let Some(id) = self.literals.get(&key) {
            return Ok(*id);
        }
        let sig = Arc::new(self.resolve_signature(&lit.ty)?);
        let name = format!("func·{}", self.literals.len() + 1);
        let id = self.builder.new_func(&name, self.state.depth + 1);
        self.builder.set_variadic(id, sig.variadic)?;
        self.builder.set_signature(id, sig.clone());

        let mut visibility = self.state.visibility.clone();
        visibility.push((self.state.body_floor, self.seq));
        self.queue.push_back(Body {
            id,
            sig,
            ty: &lit.ty,
            block: &lit.body,
            scope: self.scope,
            visibility,
        });
        self.literals.insert(key, id);
        Ok(id)
    }

    fn compile_body(&mut self, body: Body<'a>) -> Result<(), CompileError> {
        let Body {
            id,
            sig,
            ty,
            block,
            scope,
            visibility,
        } = body;

        if sig.variadic {
            self.builder.vargs(id, sig.params.clone())?;
        } else {
            self.builder.args(id, sig.params.clone())?;
        }
        let result_vars = ty
            .results
            .iter()
            .zip(&sig.results)
            .enumerate()
            .map(|(i, (field, rty))| match &field.name {
                Some(name) => Var::new(name, rty.clone()),
                None => Var::positional(i, rty.clone()),
            })
            .collect();
        let result_ids = self.builder.results(id, result_vars)?;
        self.builder.define_func(id)?;

        let saved_scope = self.scope;
        self.scope = scope;
        self.push_scope();
        let func = self.builder.func(id);
        let state = FuncState {
            id: Some(id),
            name: func.name.clone(),
            depth: func.nest_depth,
            nparams: sig.params.len(),
            results: sig.results.clone(),
            named_results: ty.results.iter().any(|f| f.name.is_some()),
            body_floor: self.scope,
            visibility,
        };
        let saved_state = std::mem::replace(&mut self.state, state);

        let compiled = self.compile_func_scope(id, ty, &sig, &result_ids, block);

        self.state = saved_state;
        self.scope = saved_scope;
        compiled?;

        self.builder.end_func(id)?;
        debug!(func = %self.builder.func(id).name, "compiled function");
        Ok(())
    }

    fn compile_func_scope(
        &mut self,
        id: FuncId,
        ty: &'a FuncTypeExpr,
        sig: &FuncType,
        result_ids: &[VarId],
        block: &'a Block,
    ) -> Result<(), CompileError> {
        for (index, (field, pty)) in ty.params.iter().zip(&sig.params).enumerate() {
            match field.name.as_deref() {
                Some("_") | None => {}
                Some(name) => self.declare(
                    name,
                    Symbol::Param {
                        func: id,
                        index,
                        ty: pty.clone(),
                    },
                )?,
            }
        }
        for (field, var) in ty.results.iter().zip(result_ids) {
            match field.name.as_deref() {
                Some("_") | None => {}
                Some(name) => self.declare(name, Symbol::Var(*var))?,
            }
        }
        self.compile_stmts(&block.stmts)
    }
}

/// Predeclared type names.
fn basic_type(name: &str) -> Option<Type> {
    let kind = match name {
        "bool" => Kind::Bool,
        "int" => Kind::Int,
        "int8" => Kind::Int8,
        "int16" => Kind::Int16,
        "int32" | "rune" => Kind::Int32,
        "int64" => Kind::Int64,
        "uint" => Kind::Uint,
        "uint8" | "byte" => Kind::Uint8,
        "uint16" => Kind::Uint16,
        "uint32" => Kind::Uint32,
        "uint64" => Kind::Uint64,
        "float32" => Kind::Float32,
        "float64" => Kind::Float64,
        "complex64" => Kind::Complex64,
        "complex128" => Kind::Complex128,
        "string" => Kind::String,
        "any" => return Some(Type::Any),
        _ => return None,
    };
    Some(Type::Basic(kind))
}
