// Kernel evaluation over the resolved AST. All name resolution happens at
// compile time; evaluation is a straight tree walk with no lookups other than
// auxiliary locals.
use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::model::ast::{BinOp, Expr, KernelStmt};
use crate::model::CovariateRuntime;
use crate::simulator::{T, V};

lazy_static! {
    /// Builtin functions and their arities, shared by compile-time validation
    /// and the evaluator
    pub(crate) static ref BUILTINS: HashMap<&'static str, usize> = {
        let mut m = HashMap::new();
        m.insert("exp", 1);
        m.insert("ln", 1);
        m.insert("log", 1);
        m.insert("log10", 1);
        m.insert("log2", 1);
        m.insert("sqrt", 1);
        m.insert("abs", 1);
        m.insert("floor", 1);
        m.insert("ceil", 1);
        m.insert("round", 1);
        m.insert("sin", 1);
        m.insert("cos", 1);
        m.insert("tan", 1);
        m.insert("pow", 2);
        m.insert("powf", 2);
        m.insert("min", 2);
        m.insert("max", 2);
        m
    };
}

pub(crate) fn builtin_arity(name: &str) -> Option<usize> {
    BUILTINS.get(name).copied()
}

fn eval_call(name: &str, args: &[f64]) -> f64 {
    match name {
        "exp" => args.first().copied().unwrap_or(0.0).exp(),
        "ln" | "log" => args.first().copied().unwrap_or(0.0).ln(),
        "log10" => args.first().copied().unwrap_or(0.0).log10(),
        "log2" => args.first().copied().unwrap_or(0.0).log2(),
        "sqrt" => args.first().copied().unwrap_or(0.0).sqrt(),
        "abs" => args.first().copied().unwrap_or(0.0).abs(),
        "floor" => args.first().copied().unwrap_or(0.0).floor(),
        "ceil" => args.first().copied().unwrap_or(0.0).ceil(),
        "round" => args.first().copied().unwrap_or(0.0).round(),
        "sin" => args.first().copied().unwrap_or(0.0).sin(),
        "cos" => args.first().copied().unwrap_or(0.0).cos(),
        "tan" => args.first().copied().unwrap_or(0.0).tan(),
        "pow" | "powf" => {
            let a = args.first().copied().unwrap_or(0.0);
            let b = args.get(1).copied().unwrap_or(0.0);
            a.powf(b)
        }
        "min" => {
            let a = args.first().copied().unwrap_or(0.0);
            let b = args.get(1).copied().unwrap_or(0.0);
            a.min(b)
        }
        "max" => {
            let a = args.first().copied().unwrap_or(0.0);
            let b = args.get(1).copied().unwrap_or(0.0);
            a.max(b)
        }
        // Unknown names are rejected at compile time
        _ => 0.0,
    }
}

pub(crate) fn eval_expr(
    expr: &Expr,
    x: &V,
    p: &V,
    t: T,
    rates: &V,
    locals: &HashMap<String, f64>,
    covariates: &CovariateRuntime,
) -> f64 {
    match expr {
        Expr::Number(v) => *v,
        Expr::Time => t,
        Expr::Param(index) => p[*index],
        Expr::State(index) => x[*index],
        Expr::Rate(index) => rates[*index],
        Expr::Covariate(name) => covariates.value(name, t),
        Expr::Aux(name) => locals.get(name).copied().unwrap_or(0.0),
        Expr::Neg(inner) => -eval_expr(inner, x, p, t, rates, locals, covariates),
        Expr::Binary { op, lhs, rhs } => {
            let a = eval_expr(lhs, x, p, t, rates, locals, covariates);
            let b = eval_expr(rhs, x, p, t, rates, locals, covariates);
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Pow => a.powf(b),
            }
        }
        Expr::Call { name, args } => {
            let values: Vec<f64> = args
                .iter()
                .map(|arg| eval_expr(arg, x, p, t, rates, locals, covariates))
                .collect();
            eval_call(name, &values)
        }
        // Unresolved nodes cannot survive compilation
        Expr::Ident(_) | Expr::Indexed { .. } => {
            debug_assert!(false, "unresolved expression node reached evaluation");
            0.0
        }
    }
}

/// Evaluate a compiled statement block
///
/// Auxiliary locals are zero-initialized before the block runs; `Compartment`
/// assignments write into `out` (the derivative vector for the dynamics block,
/// the state vector for the init block).
#[allow(clippy::too_many_arguments)]
pub(crate) fn eval_kernel(
    statements: &[KernelStmt],
    aux_names: &[String],
    x: &V,
    p: &V,
    t: T,
    rates: &V,
    covariates: &CovariateRuntime,
    out: &mut V,
) {
    let mut locals: HashMap<String, f64> = aux_names
        .iter()
        .map(|name| (name.clone(), 0.0))
        .collect();

    for statement in statements {
        match statement {
            KernelStmt::Aux { name, expr } => {
                let value = eval_expr(expr, x, p, t, rates, &locals, covariates);
                locals.insert(name.clone(), value);
            }
            KernelStmt::Compartment { index, expr } => {
                out[*index] = eval_expr(expr, x, p, t, rates, &locals, covariates);
            }
        }
    }
}
