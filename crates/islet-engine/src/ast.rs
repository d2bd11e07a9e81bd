//! Syntax tree for the supported JavaScript subset.

use std::rc::Rc;

use num_bigint::BigInt;

#[derive(Debug)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    VarDecl {
        kind: DeclKind,
        name: String,
        init: Option<Expr>,
    },
    /// Several declarators from one `let a = 1, b = 2;` statement; executes
    /// in the current scope, unlike a block.
    Multi(Vec<Stmt>),
    Func(Rc<FunctionLiteral>),
    Return(Option<Expr>),
    If {
        cond: Expr,
        cons: Box<Stmt>,
        alt: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        param: Option<String>,
        handler: Option<Vec<Stmt>>,
        finalizer: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    /// `import { a as b } from "mod"` / `import * as ns from "mod"`.
    Import {
        named: Vec<(String, String)>,
        namespace: Option<String>,
        source: String,
    },
    /// `export <decl>` — the inner statement must introduce bindings.
    ExportDecl(Box<Stmt>),
    /// `export { a as b }`.
    ExportNamed(Vec<(String, String)>),
    Empty,
}

#[derive(Debug)]
pub enum Expr {
    Number(f64),
    BigInt(BigInt),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    This,
    Array(Vec<Expr>),
    ObjectLit(Vec<(String, Expr)>),
    Func(Rc<FunctionLiteral>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Update {
        prefix: bool,
        increment: bool,
        target: Box<Expr>,
    },
    Cond {
        test: Box<Expr>,
        cons: Box<Expr>,
        alt: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: MemberKey,
    },
}

#[derive(Debug)]
pub enum MemberKey {
    Static(String),
    Computed(Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
    Delete,
    Void,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    EqLoose,
    NeLoose,
    EqStrict,
    NeStrict,
    InstanceOf,
    In,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug)]
pub struct FunctionLiteral {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Rc<Vec<Stmt>>,
    pub is_async: bool,
    pub is_arrow: bool,
}
