use crate::bytecode::compile_error::BuildError;
use crate::lang::types::{FuncType, Type};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Index of a function descriptor in the program's function arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

/// Index of a variable in the program's variable arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

// =============================================================================
// VARIABLES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarName {
    Named(String),
    /// Synthetic marker of an unnamed result, by position.
    Positional(usize),
}

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarName::Named(name) => f.write_str(name),
            VarName::Positional(i) => write!(f, "${}", i),
        }
    }
}

/// Address of a variable: the nesting depth of the function owning it
/// (0 = the global context) and its slot index in that function's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarAddr {
    pub nest_depth: u32,
    pub index: u32,
}

/// A typed variable slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub name: VarName,
    pub ty: Type,
    addr: Option<VarAddr>,
    /// Declared in a nested block rather than the function body itself.
    #[serde(default)]
    block: bool,
}

impl Var {
    pub fn new(name: &str, ty: Type) -> Var {
        Var {
            name: VarName::Named(name.to_string()),
            ty,
            addr: None,
            block: false,
        }
    }

    pub fn positional(index: usize, ty: Type) -> Var {
        Var {
            name: VarName::Positional(index),
            ty,
            addr: None,
            block: false,
        }
    }

    /// Mark the variable as declared inside a nested block.
    pub fn in_block(mut self) -> Var {
        self.block = true;
        self
    }

    pub fn is_block_scoped(&self) -> bool {
        self.block
    }

    pub fn is_unnamed_output(&self) -> bool {
        matches!(self.name, VarName::Positional(_))
    }

    pub fn addr(&self) -> Option<VarAddr> {
        self.addr
    }

    /// Assign the address. Panics if this variable already has one.
    pub fn set_addr(&mut self, nest_depth: u32, index: u32) {
        if let Some(old) = self.addr {
            panic!(
                "variable {} already has address {:?}; cannot assign ({}, {})",
                self.name, old, nest_depth, index
            );
        }
        self.addr = Some(VarAddr { nest_depth, index });
    }

    pub fn is_global(&self) -> bool {
        matches!(self.addr, Some(VarAddr { nest_depth: 0, .. }))
    }
}

// =============================================================================
// FUNCTIONS
// =============================================================================

/// Variadic state of a function: set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variadic {
    Unresolved,
    Fixed,
    Variadic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncInfo {
    pub name: String,
    /// 1 for top-level functions; a function literal is one deeper than its creator.
    pub nest_depth: u32,
    pub params: Vec<Type>,
    pub variadic: Variadic,
    /// Result variables; always the first `num_out` entries of `vars`.
    pub num_out: usize,
    pub vars: Vec<VarId>,
    pub entry: Option<usize>,
    pub end: Option<usize>,
    /// Signature as seen by callers.
    pub signature: Option<Arc<FuncType>>,
    /// Instruction offsets still waiting for this function's table index.
    #[serde(skip)]
    pub offs: Vec<usize>,
}

impl FuncInfo {
    pub fn new(name: &str, nest_depth: u32) -> FuncInfo {
        FuncInfo {
            name: name.to_string(),
            nest_depth,
            params: Vec::new(),
            variadic: Variadic::Unresolved,
            num_out: 0,
            vars: Vec::new(),
            entry: None,
            end: None,
            signature: None,
            offs: Vec::new(),
        }
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic == Variadic::Variadic
    }

    pub fn is_defined(&self) -> bool {
        self.entry.is_some() && self.end.is_some()
    }

    pub fn num_in(&self) -> usize {
        self.params.len()
    }

    /// Resolve the variadic flag. Resolving twice to different values is an error.
    pub fn set_variadic(&mut self, variadic: bool) -> Result<(), BuildError> {
        let want = if variadic {
            Variadic::Variadic
        } else {
            Variadic::Fixed
        };
        match self.variadic {
            Variadic::Unresolved => {
                self.variadic = want;
                Ok(())
            }
            current if current == want => Ok(()),
            _ => Err(BuildError::VariadicMismatch {
                name: self.name.clone(),
            }),
        }
    }

    /// Declare fixed parameters.
    pub fn args(&mut self, params: Vec<Type>) -> Result<(), BuildError> {
        self.set_variadic(false)?;
        self.params = params;
        Ok(())
    }

    /// Declare parameters of a variadic function; the last must be a slice.
    pub fn vargs(&mut self, params: Vec<Type>) -> Result<(), BuildError> {
        match params.last() {
            Some(Type::Slice(_)) => {}
            _ => {
                return Err(BuildError::VargsNotSlice {
                    name: self.name.clone(),
                });
            }
        }
        self.set_variadic(true)?;
        self.params = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_addr_once() {
        let mut v = Var::new("x", Type::INT);
        assert!(!v.is_global());
        v.set_addr(0, 3);
        assert!(v.is_global());
        assert_eq!(v.addr(), Some(VarAddr { nest_depth: 0, index: 3 }));
    }

    #[test]
    #[should_panic(expected = "already has address")]
    fn test_set_addr_twice_panics() {
        let mut v = Var::new("x", Type::INT);
        v.set_addr(1, 0);
        v.set_addr(1, 1);
    }

    #[test]
    fn test_positional_is_unnamed_output() {
        assert!(Var::positional(0, Type::INT).is_unnamed_output());
        assert!(!Var::new("r", Type::INT).is_unnamed_output());
    }

    #[test]
    fn test_variadic_tri_state() {
        let mut f = FuncInfo::new("f", 1);
        assert_eq!(f.variadic, Variadic::Unresolved);
        f.set_variadic(true).unwrap();
        f.set_variadic(true).unwrap();
        assert!(matches!(
            f.set_variadic(false),
            Err(BuildError::VariadicMismatch { .. })
        ));
    }

    #[test]
    fn test_vargs_requires_trailing_slice() {
        let mut f = FuncInfo::new("f", 1);
        assert!(matches!(
            f.vargs(vec![Type::INT]),
            Err(BuildError::VargsNotSlice { .. })
        ));
        f.vargs(vec![Type::STRING, Type::slice_of(Type::Any)]).unwrap();
        assert!(f.is_variadic());
        assert_eq!(f.num_in(), 2);
    }

    #[test]
    fn test_args_after_variadic_use_is_mismatch() {
        let mut f = FuncInfo::new("f", 1);
        f.set_variadic(true).unwrap();
        assert!(f.args(vec![Type::INT]).is_err());
    }
}
