//! # Quill Abstract Syntax Tree
//!
//! The tree a front-end hands to the compiler. It mirrors a conventional
//! expression/statement grammar. Only the forms the compiler understands are
//! represented; anything else is rejected by the front-end.
//!
//! Construction helpers (`Expr::int`, `Stmt::define`, ...) exist so that
//! hosts and tests can build trees without a parser.

use crate::bytecode::op::Operator;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(String),
    BasicLit(BasicLit),
    Binary(Box<BinaryExpr>),
    Call(Box<CallExpr>),
    Selector(Box<SelectorExpr>),
    FuncLit(Box<FuncLit>),
    /// `&x`
    AddrOf(Box<Expr>),
    /// `*x`
    Star(Box<Expr>),
}

/// Lexical kind of a literal token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LitKind {
    Int,
    Float,
    Imag,
    Char,
    String,
}

/// A literal token, still in source form (`0x1F`, `2.5`, `'a'`, `"hi\n"`).
#[derive(Debug, Clone, PartialEq)]
pub struct BasicLit {
    pub kind: LitKind,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: Operator,
    pub x: Expr,
    pub y: Expr,
}

/// `fun(args...)`; `ellipsis` is set when the last argument is spread (`xs...`).
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub fun: Expr,
    pub args: Vec<Expr>,
    pub ellipsis: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorExpr {
    pub x: Expr,
    pub sel: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncLit {
    pub ty: FuncTypeExpr,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    /// A predeclared type name (`int`, `string`, `any`, ...).
    Name(String),
    /// A type exported by a package: `pkg.Name`.
    Qualified { pkg: String, name: String },
    Slice(Box<TypeExpr>),
    Ptr(Box<TypeExpr>),
    Func(Box<FuncTypeExpr>),
}

/// A parameter or result entry. Results with names are "named results".
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeExpr,
}

/// Function signature. When `variadic` is set the last parameter is
/// written `...T` and its `ty` is the element type `T`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuncTypeExpr {
    pub params: Vec<Field>,
    pub variadic: bool,
    pub results: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign(AssignStmt),
    Return(Vec<Expr>),
    Block(Block),
    /// `x++` or `x--`
    IncDec(IncDecStmt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignTok {
    /// `=`
    Assign,
    /// `:=`
    Define,
    /// `op=`, e.g. `+=` or `<<=`
    Update(Operator),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub lhs: Vec<Expr>,
    pub tok: AssignTok,
    pub rhs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncDecStmt {
    pub x: Expr,
    pub inc: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

/// Top-level function declaration. A declaration without a body names a
/// function that must be provided elsewhere; referencing it without a
/// definition fails at program finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    pub name: String,
    pub recv: Option<Field>,
    pub ty: FuncTypeExpr,
    pub body: Option<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub path: String,
    pub alias: Option<String>,
}

impl Import {
    /// The name the package is bound to in the file scope.
    pub fn local_name(&self) -> &str {
        match &self.alias {
            Some(alias) => alias,
            None => self.path.rsplit('/').next().unwrap_or(&self.path),
        }
    }
}

/// A compilation unit: imports, function declarations and the top-level
/// statements that form the main body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct File {
    pub imports: Vec<Import>,
    pub funcs: Vec<FuncDecl>,
    pub stmts: Vec<Stmt>,
}

// =============================================================================
// Construction helpers
// =============================================================================

impl Expr {
    pub fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    pub fn lit(kind: LitKind, value: &str) -> Expr {
        Expr::BasicLit(BasicLit {
            kind,
            value: value.to_string(),
        })
    }

    pub fn int(value: &str) -> Expr {
        Expr::lit(LitKind::Int, value)
    }

    pub fn float(value: &str) -> Expr {
        Expr::lit(LitKind::Float, value)
    }

    pub fn imag(value: &str) -> Expr {
        Expr::lit(LitKind::Imag, value)
    }

    pub fn char(value: &str) -> Expr {
        Expr::lit(LitKind::Char, value)
    }

    /// A string literal from its unquoted contents.
    pub fn string(contents: &str) -> Expr {
        Expr::lit(LitKind::String, &format!("{:?}", contents))
    }

    pub fn binary(op: Operator, x: Expr, y: Expr) -> Expr {
        Expr::Binary(Box::new(BinaryExpr { op, x, y }))
    }

    pub fn call(fun: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call(Box::new(CallExpr {
            fun,
            args,
            ellipsis: false,
        }))
    }

    pub fn call_spread(fun: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call(Box::new(CallExpr {
            fun,
            args,
            ellipsis: true,
        }))
    }

    pub fn selector(x: Expr, sel: &str) -> Expr {
        Expr::Selector(Box::new(SelectorExpr {
            x,
            sel: sel.to_string(),
        }))
    }

    pub fn func_lit(ty: FuncTypeExpr, body: Vec<Stmt>) -> Expr {
        Expr::FuncLit(Box::new(FuncLit {
            ty,
            body: Block { stmts: body },
        }))
    }

    pub fn addr_of(x: Expr) -> Expr {
        Expr::AddrOf(Box::new(x))
    }

    pub fn star(x: Expr) -> Expr {
        Expr::Star(Box::new(x))
    }
}

impl Stmt {
    pub fn expr(e: Expr) -> Stmt {
        Stmt::Expr(e)
    }

    pub fn define(names: &[&str], rhs: Vec<Expr>) -> Stmt {
        Stmt::Assign(AssignStmt {
            lhs: names.iter().map(|n| Expr::ident(n)).collect(),
            tok: AssignTok::Define,
            rhs,
        })
    }

    pub fn assign(names: &[&str], rhs: Vec<Expr>) -> Stmt {
        Stmt::Assign(AssignStmt {
            lhs: names.iter().map(|n| Expr::ident(n)).collect(),
            tok: AssignTok::Assign,
            rhs,
        })
    }

    /// `=` with arbitrary targets, such as `*p = v`.
    pub fn assign_to(lhs: Vec<Expr>, rhs: Vec<Expr>) -> Stmt {
        Stmt::Assign(AssignStmt {
            lhs,
            tok: AssignTok::Assign,
            rhs,
        })
    }

    /// `x op= value`
    pub fn update(x: Expr, op: Operator, value: Expr) -> Stmt {
        Stmt::Assign(AssignStmt {
            lhs: vec![x],
            tok: AssignTok::Update(op),
            rhs: vec![value],
        })
    }

    pub fn inc(x: Expr) -> Stmt {
        Stmt::IncDec(IncDecStmt { x, inc: true })
    }

    pub fn dec(x: Expr) -> Stmt {
        Stmt::IncDec(IncDecStmt { x, inc: false })
    }

    pub fn ret(values: Vec<Expr>) -> Stmt {
        Stmt::Return(values)
    }

    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        Stmt::Block(Block { stmts })
    }
}

impl TypeExpr {
    pub fn name(name: &str) -> TypeExpr {
        TypeExpr::Name(name.to_string())
    }

    pub fn qualified(pkg: &str, name: &str) -> TypeExpr {
        TypeExpr::Qualified {
            pkg: pkg.to_string(),
            name: name.to_string(),
        }
    }

    pub fn slice(elem: TypeExpr) -> TypeExpr {
        TypeExpr::Slice(Box::new(elem))
    }

    pub fn ptr(elem: TypeExpr) -> TypeExpr {
        TypeExpr::Ptr(Box::new(elem))
    }
}

impl Field {
    pub fn named(name: &str, ty: TypeExpr) -> Field {
        Field {
            name: Some(name.to_string()),
            ty,
        }
    }

    pub fn anon(ty: TypeExpr) -> Field {
        Field { name: None, ty }
    }
}

impl FuncTypeExpr {
    pub fn new(params: Vec<Field>, results: Vec<Field>) -> FuncTypeExpr {
        FuncTypeExpr {
            params,
            variadic: false,
            results,
        }
    }

    pub fn variadic(params: Vec<Field>, results: Vec<Field>) -> FuncTypeExpr {
        FuncTypeExpr {
            params,
            variadic: true,
            results,
        }
    }
}

impl FuncDecl {
    pub fn new(name: &str, ty: FuncTypeExpr, body: Vec<Stmt>) -> FuncDecl {
        FuncDecl {
            name: name.to_string(),
            recv: None,
            ty,
            body: Some(Block { stmts: body }),
        }
    }

    /// A declaration with no body.
    pub fn external(name: &str, ty: FuncTypeExpr) -> FuncDecl {
        FuncDecl {
            name: name.to_string(),
            recv: None,
            ty,
            body: None,
        }
    }
}

impl File {
    pub fn with_stmts(stmts: Vec<Stmt>) -> File {
        File {
            stmts,
            ..File::default()
        }
    }

    pub fn import(mut self, path: &str) -> File {
        self.imports.push(Import {
            path: path.to_string(),
            alias: None,
        });
        self
    }

    pub fn func(mut self, decl: FuncDecl) -> File {
        self.funcs.push(decl);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_local_name() {
        let imp = Import {
            path: "encoding/hex".to_string(),
            alias: None,
        };
        assert_eq!(imp.local_name(), "hex");

        let aliased = Import {
            path: "encoding/hex".to_string(),
            alias: Some("h".to_string()),
        };
        assert_eq!(aliased.local_name(), "h");
    }

    #[test]
    fn test_string_helper_quotes_contents() {
        match Expr::string("a\"b\n") {
            Expr::BasicLit(lit) => {
                assert_eq!(lit.kind, LitKind::String);
                assert_eq!(lit.value, "\"a\\\"b\\n\"");
            }
            other => panic!("expected literal, got {:?}", other),
        }
    }
}
