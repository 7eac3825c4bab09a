//! Native function bridge.
//!
//! Host code exposes packages of functions, variables, and types through a
//! process-wide registry. Fixed-arity and variadic functions live in separate
//! tables so the compiler can pick the matching call instruction from the
//! symbol alone. Registration is append-only: an address handed out once
//! stays valid for the life of the process.

use crate::bytecode::stack_check_error::NativeArity;
use crate::lang::types::{FuncType, Type};
use crate::lang::value::Value;
use crate::runtime::closure::Closure;
use crate::runtime::runtime_error::RuntimeError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock, RwLock};
use thiserror::Error;
use tracing::debug;

/// Host-side implementation of a native function.
///
/// Arguments arrive in declaration order. For a variadic function the
/// trailing arguments are already packed into a slice in the last position.
pub trait NativeFn: Send + Sync {
    fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError>;
}

impl<F> NativeFn for F
where
    F: Fn(Vec<Value>) -> Result<Vec<Value>, RuntimeError> + Send + Sync,
{
    fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        self(args)
    }
}

#[derive(Clone)]
enum Repr {
    Host(Arc<dyn NativeFn>),
    Script(Arc<Closure>),
}

/// A callable with a static signature, as seen by the host.
#[derive(Clone)]
pub struct NativeFunc {
    sig: Arc<FuncType>,
    repr: Repr,
}

impl NativeFunc {
    pub fn new<F>(sig: FuncType, f: F) -> NativeFunc
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>, RuntimeError> + Send + Sync + 'static,
    {
        NativeFunc {
            sig: Arc::new(sig),
            repr: Repr::Host(Arc::new(f)),
        }
    }

    /// Wrap a script closure so host code can call it like any native.
    pub fn from_closure(closure: Arc<Closure>) -> NativeFunc {
        NativeFunc {
            sig: closure.signature().clone(),
            repr: Repr::Script(closure),
        }
    }

    pub fn signature(&self) -> &Arc<FuncType> {
        &self.sig
    }

    pub fn is_variadic(&self) -> bool {
        self.sig.variadic
    }

    /// The script closure behind this callable, if it wraps one.
    pub fn as_closure(&self) -> Option<&Arc<Closure>> {
        match &self.repr {
            Repr::Script(c) => Some(c),
            Repr::Host(_) => None,
        }
    }

    /// Invoke with arguments matching the signature.
    ///
    /// Arguments are checked against the declared parameter types, and the
    /// result count against the declared results.
    pub fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        if args.len() != self.sig.params.len() {
            return Err(RuntimeError::arity(
                &self.sig.to_string(),
                self.sig.params.len(),
                args.len(),
            ));
        }
        for (arg, ty) in args.iter().zip(&self.sig.params) {
            if !arg.fits(ty) {
                return Err(RuntimeError::type_error(ty, arg));
            }
        }
        let results = match &self.repr {
            Repr::Host(f) => f.call(args)?,
            Repr::Script(c) => c.call(args)?,
        };
        if results.len() != self.sig.results.len() {
            return Err(RuntimeError::native(format!(
                "native function returned {} values, signature declares {}",
                results.len(),
                self.sig.results.len()
            )));
        }
        Ok(results)
    }

    /// Identity comparison.
    pub fn same(&self, other: &NativeFunc) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Host(a), Repr::Host(b)) => Arc::ptr_eq(a, b),
            (Repr::Script(a), Repr::Script(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repr = match self.repr {
            Repr::Host(_) => "host",
            Repr::Script(_) => "script",
        };
        write!(f, "NativeFunc({} {})", repr, self.sig)
    }
}

/// A host variable shared with scripts.
#[derive(Debug, Clone)]
pub struct NativeVar {
    pub ty: Type,
    cell: Arc<RwLock<Value>>,
}

impl NativeVar {
    pub fn new(ty: Type, value: Value) -> NativeVar {
        NativeVar {
            ty,
            cell: Arc::new(RwLock::new(value)),
        }
    }

    pub fn load(&self) -> Value {
        self.cell
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn store(&self, value: Value) {
        *self
            .cell
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Debug)]
pub struct NativeFuncInfo {
    pub pkg: String,
    pub name: String,
    pub func: NativeFunc,
}

#[derive(Debug)]
pub struct NativeFuncvInfo {
    pub pkg: String,
    pub name: String,
    pub func: NativeFunc,
    num_in: OnceLock<usize>,
}

impl NativeFuncvInfo {
    /// Declared parameter count, the trailing slice included.
    pub fn num_in(&self) -> usize {
        *self.num_in.get_or_init(|| self.func.signature().params.len())
    }
}

#[derive(Debug)]
pub struct NativeVarInfo {
    pub pkg: String,
    pub name: String,
    pub var: NativeVar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Var,
    Func,
    Funcv,
}

const SYM_KIND_SHIFT: u32 = 28;
const SYM_ADDR_MASK: u32 = (1 << SYM_KIND_SHIFT) - 1;

fn encode_sym(addr: u32, kind: SymbolKind) -> u32 {
    let tag = match kind {
        SymbolKind::Var => 0,
        SymbolKind::Func => 1,
        SymbolKind::Funcv => 2,
    };
    addr | (tag << SYM_KIND_SHIFT)
}

fn decode_sym(sym: u32) -> (u32, SymbolKind) {
    let kind = match sym >> SYM_KIND_SHIFT {
        0 => SymbolKind::Var,
        1 => SymbolKind::Func,
        _ => SymbolKind::Funcv,
    };
    (sym & SYM_ADDR_MASK, kind)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("native package \"{path}\" is already registered")]
    DuplicatePackage { path: String },

    #[error("native package \"{path}\": symbol {name} registered twice")]
    DuplicateSymbol { path: String, name: String },

    #[error("native package \"{path}\": type {name} registered twice")]
    DuplicateType { path: String, name: String },

    #[error("native package \"{path}\": only named types can be registered, got {ty}")]
    UnnamedType { path: String, ty: String },

    #[error("native package \"{path}\": {name} is variadic, use register_funcvs")]
    ExpectedFixed { path: String, name: String },

    #[error("native package \"{path}\": {name} is not variadic, use register_funcs")]
    ExpectedVariadic { path: String, name: String },

    #[error("native package \"{path}\" is not registered")]
    UnknownPackage { path: String },
}

#[derive(Debug, Default)]
struct PackageData {
    syms: HashMap<String, u32>,
    types: HashMap<String, Type>,
}

#[derive(Debug, Default)]
struct Registry {
    packages: HashMap<String, PackageData>,
    funcs: Vec<Arc<NativeFuncInfo>>,
    funcvs: Vec<Arc<NativeFuncvInfo>>,
    vars: Vec<Arc<NativeVarInfo>>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

fn read_registry() -> std::sync::RwLockReadGuard<'static, Registry> {
    REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_registry() -> std::sync::RwLockWriteGuard<'static, Registry> {
    REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Registry {
    fn package_mut(&mut self, path: &str) -> Result<&mut PackageData, RegistryError> {
        self.packages
            .get_mut(path)
            .ok_or_else(|| RegistryError::UnknownPackage {
                path: path.to_string(),
            })
    }

    fn check_fresh<'n>(
        &self,
        path: &str,
        names: impl Iterator<Item = &'n str>,
    ) -> Result<(), RegistryError> {
        let pkg = self
            .packages
            .get(path)
            .ok_or_else(|| RegistryError::UnknownPackage {
                path: path.to_string(),
            })?;
        let mut seen = std::collections::HashSet::new();
        for name in names {
            if pkg.syms.contains_key(name) || !seen.insert(name) {
                return Err(RegistryError::DuplicateSymbol {
                    path: path.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Handle to a registered native package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePackage {
    path: String,
}

/// Look up a package by import path.
pub fn find_package(path: &str) -> Option<NativePackage> {
    read_registry()
        .packages
        .contains_key(path)
        .then(|| NativePackage {
            path: path.to_string(),
        })
}

impl NativePackage {
    /// Register a new, empty package. Only one registration per path succeeds.
    pub fn new(path: &str) -> Result<NativePackage, RegistryError> {
        let mut reg = write_registry();
        if reg.packages.contains_key(path) {
            return Err(RegistryError::DuplicatePackage {
                path: path.to_string(),
            });
        }
        reg.packages.insert(path.to_string(), PackageData::default());
        debug!(path, "native package registered");
        Ok(NativePackage {
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn register_funcs(&self, funcs: Vec<(&str, NativeFunc)>) -> Result<(), RegistryError> {
        let mut reg = write_registry();
        reg.check_fresh(&self.path, funcs.iter().map(|(n, _)| *n))?;
        if let Some((name, _)) = funcs.iter().find(|(_, f)| f.is_variadic()) {
            return Err(RegistryError::ExpectedFixed {
                path: self.path.clone(),
                name: name.to_string(),
            });
        }
        for (name, func) in funcs {
            let addr = reg.funcs.len() as u32;
            reg.funcs.push(Arc::new(NativeFuncInfo {
                pkg: self.path.clone(),
                name: name.to_string(),
                func,
            }));
            reg.package_mut(&self.path)?
                .syms
                .insert(name.to_string(), encode_sym(addr, SymbolKind::Func));
        }
        Ok(())
    }

    pub fn register_funcvs(&self, funcs: Vec<(&str, NativeFunc)>) -> Result<(), RegistryError> {
        let mut reg = write_registry();
        reg.check_fresh(&self.path, funcs.iter().map(|(n, _)| *n))?;
        if let Some((name, _)) = funcs.iter().find(|(_, f)| !f.is_variadic()) {
            return Err(RegistryError::ExpectedVariadic {
                path: self.path.clone(),
                name: name.to_string(),
            });
        }
        for (name, func) in funcs {
            let addr = reg.funcvs.len() as u32;
            reg.funcvs.push(Arc::new(NativeFuncvInfo {
                pkg: self.path.clone(),
                name: name.to_string(),
                func,
                num_in: OnceLock::new(),
            }));
            reg.package_mut(&self.path)?
                .syms
                .insert(name.to_string(), encode_sym(addr, SymbolKind::Funcv));
        }
        Ok(())
    }

    pub fn register_vars(&self, vars: Vec<(&str, NativeVar)>) -> Result<(), RegistryError> {
        let mut reg = write_registry();
        reg.check_fresh(&self.path, vars.iter().map(|(n, _)| *n))?;
        for (name, var) in vars {
            let addr = reg.vars.len() as u32;
            reg.vars.push(Arc::new(NativeVarInfo {
                pkg: self.path.clone(),
                name: name.to_string(),
                var,
            }));
            reg.package_mut(&self.path)?
                .syms
                .insert(name.to_string(), encode_sym(addr, SymbolKind::Var));
        }
        Ok(())
    }

    /// Register named types, keyed by their own name.
    pub fn register_types(&self, types: Vec<Type>) -> Result<(), RegistryError> {
        let mut reg = write_registry();
        let pkg = reg.package_mut(&self.path)?;
        let mut named = Vec::with_capacity(types.len());
        for ty in types {
            let name = match &ty {
                Type::Named(n) => n.name.clone(),
                other => {
                    return Err(RegistryError::UnnamedType {
                        path: self.path.clone(),
                        ty: other.to_string(),
                    });
                }
            };
            if pkg.types.contains_key(&name) || named.iter().any(|(n, _)| n == &name) {
                return Err(RegistryError::DuplicateType {
                    path: self.path.clone(),
                    name,
                });
            }
            named.push((name, ty));
        }
        pkg.types.extend(named);
        Ok(())
    }

    /// Find a symbol: its table address and which table it lives in.
    pub fn find(&self, name: &str) -> Option<(u32, SymbolKind)> {
        let reg = read_registry();
        reg.packages
            .get(&self.path)?
            .syms
            .get(name)
            .map(|sym| decode_sym(*sym))
    }

    pub fn find_func(&self, name: &str) -> Option<u32> {
        match self.find(name)? {
            (addr, SymbolKind::Func) => Some(addr),
            _ => None,
        }
    }

    pub fn find_funcv(&self, name: &str) -> Option<u32> {
        match self.find(name)? {
            (addr, SymbolKind::Funcv) => Some(addr),
            _ => None,
        }
    }

    pub fn find_var(&self, name: &str) -> Option<u32> {
        match self.find(name)? {
            (addr, SymbolKind::Var) => Some(addr),
            _ => None,
        }
    }

    pub fn find_type(&self, name: &str) -> Option<Type> {
        read_registry().packages.get(&self.path)?.types.get(name).cloned()
    }
}

pub fn func_info(addr: u32) -> Option<Arc<NativeFuncInfo>> {
    read_registry().funcs.get(addr as usize).cloned()
}

pub fn funcv_info(addr: u32) -> Option<Arc<NativeFuncvInfo>> {
    read_registry().funcvs.get(addr as usize).cloned()
}

pub fn var_info(addr: u32) -> Option<Arc<NativeVarInfo>> {
    read_registry().vars.get(addr as usize).cloned()
}

/// Frozen copy of the native tables, taken when an executable is built.
#[derive(Debug, Clone, Default)]
pub struct NativeTables {
    pub funcs: Vec<Arc<NativeFuncInfo>>,
    pub funcvs: Vec<Arc<NativeFuncvInfo>>,
    pub vars: Vec<Arc<NativeVarInfo>>,
}

impl NativeTables {
    pub fn snapshot() -> NativeTables {
        let reg = read_registry();
        NativeTables {
            funcs: reg.funcs.clone(),
            funcvs: reg.funcvs.clone(),
            vars: reg.vars.clone(),
        }
    }

    pub fn func(&self, addr: u32) -> Result<&Arc<NativeFuncInfo>, RuntimeError> {
        self.funcs
            .get(addr as usize)
            .ok_or_else(|| RuntimeError::internal(format!("no native function at {}", addr)))
    }

    pub fn funcv(&self, addr: u32) -> Result<&Arc<NativeFuncvInfo>, RuntimeError> {
        self.funcvs.get(addr as usize).ok_or_else(|| {
            RuntimeError::internal(format!("no variadic native function at {}", addr))
        })
    }

    pub fn var(&self, addr: u32) -> Result<&Arc<NativeVarInfo>, RuntimeError> {
        self.vars
            .get(addr as usize)
            .ok_or_else(|| RuntimeError::internal(format!("no native variable at {}", addr)))
    }
}

impl NativeArity for NativeTables {
    fn func_arity(&self, addr: u32) -> Option<(usize, usize)> {
        let sig = self.funcs.get(addr as usize)?.func.signature();
        Some((sig.params.len(), sig.results.len()))
    }

    fn funcv_arity(&self, addr: u32) -> Option<(usize, usize)> {
        let info = self.funcvs.get(addr as usize)?;
        Some((info.num_in(), info.func.signature().results.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> NativeFunc {
        NativeFunc::new(
            FuncType {
                params: vec![Type::INT, Type::INT],
                results: vec![Type::INT],
                variadic: false,
            },
            |args| match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => Ok(vec![Value::Int(a + b)]),
                _ => Err(RuntimeError::native("bad args")),
            },
        )
    }

    fn concat() -> NativeFunc {
        NativeFunc::new(
            FuncType {
                params: vec![Type::slice_of(Type::Any)],
                results: vec![Type::STRING],
                variadic: true,
            },
            |args| match &args[0] {
                Value::Slice(s) => Ok(vec![Value::String(
                    s.items.iter().map(|v| v.to_string()).collect(),
                )]),
                _ => Err(RuntimeError::native("bad args")),
            },
        )
    }

    #[test]
    fn test_duplicate_package_rejected() {
        NativePackage::new("test/native/dup").unwrap();
        assert!(matches!(
            NativePackage::new("test/native/dup"),
            Err(RegistryError::DuplicatePackage { .. })
        ));
    }

    #[test]
    fn test_register_and_find() {
        let pkg = NativePackage::new("test/native/find").unwrap();
        pkg.register_funcs(vec![("Add", add())]).unwrap();
        pkg.register_funcvs(vec![("Concat", concat())]).unwrap();
        pkg.register_vars(vec![("Limit", NativeVar::new(Type::INT, Value::Int(3)))])
            .unwrap();

        assert!(matches!(pkg.find("Add"), Some((_, SymbolKind::Func))));
        assert!(matches!(pkg.find("Concat"), Some((_, SymbolKind::Funcv))));
        assert!(matches!(pkg.find("Limit"), Some((_, SymbolKind::Var))));
        assert!(pkg.find("Missing").is_none());
        assert!(pkg.find_func("Concat").is_none());

        let addr = pkg.find_funcv("Concat").unwrap();
        assert_eq!(funcv_info(addr).unwrap().num_in(), 1);
        let addr = pkg.find_var("Limit").unwrap();
        assert_eq!(var_info(addr).unwrap().var.load(), Value::Int(3));
    }

    #[test]
    fn test_variadic_in_fixed_table_rejected() {
        let pkg = NativePackage::new("test/native/misfiled").unwrap();
        assert!(matches!(
            pkg.register_funcs(vec![("Concat", concat())]),
            Err(RegistryError::ExpectedFixed { .. })
        ));
        assert!(matches!(
            pkg.register_funcvs(vec![("Add", add())]),
            Err(RegistryError::ExpectedVariadic { .. })
        ));
        assert!(pkg.find("Add").is_none());
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let pkg = NativePackage::new("test/native/dupsym").unwrap();
        pkg.register_funcs(vec![("Add", add())]).unwrap();
        assert!(matches!(
            pkg.register_vars(vec![("Add", NativeVar::new(Type::INT, Value::Int(0)))]),
            Err(RegistryError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn test_register_types() {
        let pkg = NativePackage::new("test/native/types").unwrap();
        let duration = Type::named("test/native/types", "Duration", Type::INT64);
        pkg.register_types(vec![duration.clone()]).unwrap();
        assert_eq!(pkg.find_type("Duration"), Some(duration.clone()));
        assert!(matches!(
            pkg.register_types(vec![duration]),
            Err(RegistryError::DuplicateType { .. })
        ));
        assert!(matches!(
            pkg.register_types(vec![Type::INT]),
            Err(RegistryError::UnnamedType { .. })
        ));
    }

    #[test]
    fn test_call_checks_arguments() {
        let f = add();
        assert_eq!(
            f.call(vec![Value::Int(2), Value::Int(3)]).unwrap(),
            vec![Value::Int(5)]
        );
        assert!(f.call(vec![Value::Int(2)]).is_err());
        assert!(f.call(vec![Value::Int(2), Value::Float64(1.0)]).is_err());
    }

    #[test]
    fn test_same_is_identity() {
        let f = add();
        let g = f.clone();
        assert!(f.same(&g));
        assert!(!f.same(&add()));
    }

    #[test]
    fn test_snapshot_sees_registered_entries() {
        let pkg = NativePackage::new("test/native/snapshot").unwrap();
        pkg.register_funcs(vec![("Add", add())]).unwrap();
        let addr = pkg.find_func("Add").unwrap();
        let tables = NativeTables::snapshot();
        assert_eq!(tables.func(addr).unwrap().name, "Add");
        assert!(tables.func(u32::MAX >> 4).is_err());
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| NativePackage::new("test/native/race").is_ok()))
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
