//! Algebraic simplifier.
//!
//! [`simplify`] rebuilds a tree bottom-up and applies a small set of local
//! rewrites at every node: flattening nested sums and products, constant
//! folding, identity and annihilator elimination, double negation and
//! trivial powers. Every rewrite emits a node that is already in normal form
//! for its own rules, which makes the pass idempotent:
//! `simplify(simplify(e)) == simplify(e)`.
//!
//! The simplifier is not a canonicalizer. It never reorders operands, so two
//! mathematically equal inputs may still differ afterwards.

use crate::equation::Equation;
use crate::expr::{Expr, Operator};

/// Simplifies `expr` into an equivalent, usually smaller tree.
pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::Const(_) | Expr::Sym(_) => expr.clone(),
        Expr::Op(Operator::Differential { .. }, _) => expr.clone(),
        Expr::Op(op, args) => {
            let args: Vec<Expr> = args.iter().map(simplify).collect();
            rebuild(op, args)
        }
    }
}

/// Simplifies both sides of an equation.
pub fn simplify_equation(equation: &Equation) -> Equation {
    Equation {
        lhs: simplify(&equation.lhs),
        rhs: simplify(&equation.rhs),
    }
}

/// Applies the node-local rules to `op` over already simplified `args`.
fn rebuild(op: &Operator, mut args: Vec<Expr>) -> Expr {
    match (op, args.len()) {
        (Operator::Add, _) => simplify_add(args),
        (Operator::Mul, _) => simplify_mul(args),
        (Operator::Sub, 2) => {
            let rhs = args.pop().unwrap_or_else(Expr::zero);
            let lhs = args.pop().unwrap_or_else(Expr::zero);
            simplify_sub(lhs, rhs)
        }
        (Operator::Div, 2) => {
            let rhs = args.pop().unwrap_or_else(Expr::one);
            let lhs = args.pop().unwrap_or_else(Expr::zero);
            simplify_div(lhs, rhs)
        }
        (Operator::Pow, 2) => {
            let exponent = args.pop().unwrap_or_else(Expr::one);
            let base = args.pop().unwrap_or_else(Expr::zero);
            simplify_pow(base, exponent)
        }
        (Operator::Neg, 1) => simplify_neg(args.remove(0)),
        (Operator::Abs, 1) => simplify_abs(args.remove(0)),
        (Operator::Differential { .. }, _) | (Operator::Function(_), _) => {
            Expr::apply(op.clone(), args)
        }
        (_, 1) => fold_unary(op, args.remove(0)),
        _ => Expr::apply(op.clone(), args),
    }
}

/// Folds a constant result, but only inside the operator's real domain.
fn fold(op: &Operator, values: &[f64]) -> Option<Expr> {
    op.apply_numeric(values)
        .filter(|value| value.is_finite())
        .map(Expr::Const)
}

fn fold_unary(op: &Operator, arg: Expr) -> Expr {
    if let Some(value) = arg.as_const() {
        if let Some(folded) = fold(op, &[value]) {
            return folded;
        }
    }
    Expr::apply(op.clone(), vec![arg])
}

fn simplify_add(args: Vec<Expr>) -> Expr {
    let mut terms = Vec::with_capacity(args.len());
    let mut constant = 0.0;
    let flattened = args.into_iter().flat_map(|arg| match arg {
        Expr::Op(Operator::Add, inner) => inner.to_vec(),
        other => vec![other],
    });
    for term in flattened {
        match term {
            Expr::Const(value) => constant += value,
            other => terms.push(other),
        }
    }
    if constant != 0.0 || constant.is_nan() {
        terms.push(Expr::Const(constant));
    }
    match terms.len() {
        0 => Expr::zero(),
        1 => terms.remove(0),
        _ => Expr::add(terms),
    }
}

fn simplify_sub(lhs: Expr, rhs: Expr) -> Expr {
    if rhs.is_zero() {
        return lhs;
    }
    if lhs.is_zero() {
        return simplify_neg(rhs);
    }
    if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
        return Expr::Const(a - b);
    }
    if lhs == rhs {
        return Expr::zero();
    }
    Expr::sub(lhs, rhs)
}

fn simplify_mul(args: Vec<Expr>) -> Expr {
    let mut factors = Vec::with_capacity(args.len());
    let mut constant = 1.0;
    let flattened = args.into_iter().flat_map(|arg| match arg {
        Expr::Op(Operator::Mul, inner) => inner.to_vec(),
        other => vec![other],
    });
    for factor in flattened {
        match factor {
            Expr::Const(value) => constant *= value,
            other => factors.push(other),
        }
    }
    if constant == 0.0 || factors.is_empty() {
        return Expr::Const(constant);
    }
    if constant == 1.0 {
        return match factors.len() {
            1 => factors.remove(0),
            _ => Expr::mul(factors),
        };
    }
    if constant == -1.0 {
        return match factors.len() {
            1 => simplify_neg(factors.remove(0)),
            _ => Expr::neg(Expr::mul(factors)),
        };
    }
    factors.insert(0, Expr::Const(constant));
    Expr::mul(factors)
}

fn simplify_neg(inner: Expr) -> Expr {
    match inner {
        Expr::Const(value) => Expr::Const(-value),
        Expr::Op(Operator::Neg, ref args) if args.len() == 1 => args[0].clone(),
        Expr::Op(Operator::Mul, ref args) if args.first().and_then(Expr::as_const).is_some() => {
            let mut factors = args.to_vec();
            if let Some(value) = factors[0].as_const() {
                factors[0] = Expr::Const(-value);
            }
            simplify_mul(factors)
        }
        other => Expr::neg(other),
    }
}

fn simplify_div(numerator: Expr, denominator: Expr) -> Expr {
    if denominator.is_one() {
        return numerator;
    }
    if numerator.is_zero() {
        return Expr::zero();
    }
    if let (Some(a), Some(b)) = (numerator.as_const(), denominator.as_const()) {
        if b != 0.0 {
            return Expr::Const(a / b);
        }
    }
    if denominator.as_const() == Some(-1.0) {
        return simplify_neg(numerator);
    }
    if numerator == denominator {
        return Expr::one();
    }
    Expr::div(numerator, denominator)
}

fn is_integer(value: f64) -> bool {
    value.is_finite() && value.fract() == 0.0
}

fn simplify_pow(base: Expr, exponent: Expr) -> Expr {
    if exponent.is_zero() {
        return Expr::one();
    }
    if exponent.is_one() {
        return base;
    }
    if let (Some(b), Some(e)) = (base.as_const(), exponent.as_const()) {
        if let Some(folded) = fold(&Operator::Pow, &[b, e]) {
            return folded;
        }
    }
    if base.is_one() {
        return Expr::one();
    }
    if base.is_zero() && exponent.as_const().is_some_and(|e| e > 0.0) {
        return Expr::zero();
    }
    // (x^a)^b -> x^(a*b) for integer exponents
    if let Expr::Op(Operator::Pow, inner) = &base {
        if let ([x, a], Some(b)) = (&inner[..], exponent.as_const()) {
            if let Some(a) = a.as_const().filter(|a| is_integer(*a) && is_integer(b)) {
                return simplify_pow(x.clone(), Expr::Const(a * b));
            }
        }
    }
    Expr::pow(base, exponent)
}

fn simplify_abs(inner: Expr) -> Expr {
    match inner {
        Expr::Op(Operator::Abs, _) => inner,
        Expr::Op(Operator::Neg, ref args) if args.len() == 1 => simplify_abs(args[0].clone()),
        other => fold_unary(&Operator::Abs, other),
    }
}
