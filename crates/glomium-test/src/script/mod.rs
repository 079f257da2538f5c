//! The toy script language.
//!
//! Statements are separated by `;` and the value of the last one is the
//! result. Expressions: number and string literals, `true`, `false`,
//! `null`, `undefined`, arrays, objects, identifiers, `name = expr`,
//! `+ - * ==`, unary `-`, `a.b`, `a[i]`, calls, `fn(a, b) => expr`,
//! `throw expr` and `loop expr`.

mod lexer;
mod parser;

pub(crate) use parser::parse;

/// A parsed program.
#[derive(Debug)]
pub(crate) struct Program {
    pub(crate) statements: Vec<Expr>,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
}

/// Function literal.
#[derive(Debug)]
pub(crate) struct Lambda {
    pub(crate) params: Vec<String>,
    pub(crate) body: Expr,
}

/// Expression tree.
#[derive(Debug)]
pub(crate) enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Assign(String, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Lambda(std::sync::Arc<Lambda>),
    Throw(Box<Expr>),
    Loop(Box<Expr>),
}
