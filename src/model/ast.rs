// AST for the symbolic model language: arithmetic and assignment over named
// compartments, parameters and covariates.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Num(f64),
    Ident(String),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Assign,
    Op(char),
}

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn precedence(&self) -> u8 {
        match self {
            BinOp::Add | BinOp::Sub => 1,
            BinOp::Mul | BinOp::Div => 2,
            BinOp::Pow => 3,
        }
    }

    fn symbol(&self) -> char {
        match self {
            BinOp::Add => '+',
            BinOp::Sub => '-',
            BinOp::Mul => '*',
            BinOp::Div => '/',
            BinOp::Pow => '^',
        }
    }
}

/// An expression node
///
/// The parser produces only `Number`, `Ident`, `Indexed`, `Neg`, `Binary` and
/// `Call` nodes; the compiler's resolution pass rewrites `Ident` and `Indexed`
/// into the typed variants (`Time`, `Param`, `State`, `Rate`, `Covariate`,
/// `Aux`) so that kernel evaluation never needs name lookup beyond auxiliary
/// locals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Number(f64),
    /// Unresolved identifier (parser output only)
    Ident(String),
    /// Unresolved indexed reference, 1-based (parser output only)
    Indexed { name: String, index: usize },
    /// The integration time `t`
    Time,
    /// Parameter by declaration index
    Param(usize),
    /// Compartment state, zero-indexed
    State(usize),
    /// Per-compartment infusion rate, zero-indexed; injected by the compiler
    Rate(usize),
    /// Covariate, evaluated from per-segment runtime bindings
    Covariate(String),
    /// Auxiliary local variable
    Aux(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// Assignment target as written by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Lhs {
    Ident(String),
    /// Indexed target, 1-based as written (`dx[k]` or `x[k]`)
    Indexed { name: String, index: usize },
}

/// A parsed statement: always an assignment in this language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub lhs: Lhs,
    pub rhs: Expr,
}

/// A compiled kernel statement, index-normalized and fully resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelStmt {
    /// Assignment to an auxiliary local
    Aux { name: String, expr: Expr },
    /// Assignment to a compartment slot (zero-indexed): a derivative in the
    /// dynamics block, a state value in the init block
    Compartment { index: usize, expr: Expr },
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub pos: usize,
    pub found: Option<String>,
    pub expected: &'static str,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.found {
            Some(found) => write!(
                f,
                "at token {}: found `{}`, expected {}",
                self.pos, found, self.expected
            ),
            None => write!(f, "at token {}: unexpected end, expected {}", self.pos, self.expected),
        }
    }
}

impl std::error::Error for ParseError {}

// The emitter: renders resolved expressions back to kernel text for the
// diagnostic listing. Parenthesization follows operator precedence.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.emit(f, 0)
    }
}

impl Expr {
    fn emit(&self, f: &mut fmt::Formatter<'_>, parent_precedence: u8) -> fmt::Result {
        match self {
            Expr::Number(v) => write!(f, "{}", v),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Indexed { name, index } => write!(f, "{}[{}]", name, index),
            Expr::Time => write!(f, "t"),
            Expr::Param(index) => write!(f, "p[{}]", index),
            Expr::State(index) => write!(f, "x[{}]", index),
            Expr::Rate(index) => write!(f, "rate[{}]", index),
            Expr::Covariate(name) => write!(f, "{}", name),
            Expr::Aux(name) => write!(f, "{}", name),
            Expr::Neg(inner) => {
                write!(f, "-")?;
                inner.emit(f, 4)
            }
            Expr::Binary { op, lhs, rhs } => {
                let precedence = op.precedence();
                let parenthesize = precedence < parent_precedence;
                if parenthesize {
                    write!(f, "(")?;
                }
                lhs.emit(f, precedence)?;
                write!(f, " {} ", op.symbol())?;
                rhs.emit(f, precedence + 1)?;
                if parenthesize {
                    write!(f, ")")?;
                }
                Ok(())
            }
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    arg.emit(f, 0)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_precedence() {
        // -ka * x[0] + rate[0]
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(Expr::Binary {
                op: BinOp::Mul,
                lhs: Box::new(Expr::Neg(Box::new(Expr::Param(0)))),
                rhs: Box::new(Expr::State(0)),
            }),
            rhs: Box::new(Expr::Rate(0)),
        };
        assert_eq!(expr.to_string(), "-p[0] * x[0] + rate[0]");
    }

    #[test]
    fn test_emitter_parenthesizes_lower_precedence() {
        // (a + b) * c
        let expr = Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Aux("a".into())),
                rhs: Box::new(Expr::Aux("b".into())),
            }),
            rhs: Box::new(Expr::Aux("c".into())),
        };
        assert_eq!(expr.to_string(), "(a + b) * c");
    }

    #[test]
    fn test_emitter_call() {
        let expr = Expr::Call {
            name: "exp".into(),
            args: vec![Expr::Neg(Box::new(Expr::Time))],
        };
        assert_eq!(expr.to_string(), "exp(-t)");
    }
}
