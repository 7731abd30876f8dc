//! Differentiation engine.
//!
//! Derivatives are computed by the chain rule over the per-operator rules of
//! a [`RuleRegistry`]: for an operator node `op(a_1, .., a_n)` the result is
//! the sum over every argument `a_i` with a nonzero inner derivative of
//! `partial_i(op) * d(a_i)`. Inner derivatives that are structurally zero
//! are skipped, which keeps results free of `0 * ..` noise and means the
//! `Pow` exponent rule is never consulted for a constant exponent.
//!
//! Two flavours exist:
//!
//! - [`differentiate`] honours implicit dependencies. A state differentiated
//!   by an independent variable turns into a `Differential` node.
//! - [`partial`] treats every symbol other than `wrt` as an independent
//!   constant, which is what the explicit time gradient needs.
//!
//! [`expand_derivatives`] rewrites the `Differential` nodes inside a tree
//! until only derivatives of genuine states remain.

use std::collections::HashMap;

use log::trace;

use crate::errors::SymbolicError;
use crate::expr::{Expr, Operator, Symbol};
use crate::registry::RuleRegistry;
use crate::simplify::simplify;

/// Settings of [`expand_derivatives_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandOptions {
    /// Number of rewrite passes before giving up with `NonTerminating`
    pub max_iterations: usize,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self { max_iterations: 64 }
    }
}

/// Total derivative of `expr` with respect to `wrt`.
///
/// # Errors
/// `UnregisteredDerivative` when the tree contains an operator without a
/// derivative rule, even if that subtree does not depend on `wrt`.
pub fn differentiate(expr: &Expr, wrt: &Symbol) -> Result<Expr, SymbolicError> {
    differentiate_with(expr, wrt, RuleRegistry::standard())
}

/// [`differentiate`] with a caller supplied rule table.
pub fn differentiate_with(
    expr: &Expr,
    wrt: &Symbol,
    registry: &RuleRegistry,
) -> Result<Expr, SymbolicError> {
    Differentiator {
        registry,
        implicit: true,
    }
    .derive(expr, wrt)
}

/// Partial derivative of `expr` with respect to `wrt`.
///
/// States, parameters and existing `Differential` leaves are held fixed.
pub fn partial(expr: &Expr, wrt: &Symbol) -> Result<Expr, SymbolicError> {
    partial_with(expr, wrt, RuleRegistry::standard())
}

/// [`partial`] with a caller supplied rule table.
pub fn partial_with(
    expr: &Expr,
    wrt: &Symbol,
    registry: &RuleRegistry,
) -> Result<Expr, SymbolicError> {
    Differentiator {
        registry,
        implicit: false,
    }
    .derive(expr, wrt)
}

struct Differentiator<'a> {
    registry: &'a RuleRegistry,
    implicit: bool,
}

impl Differentiator<'_> {
    fn derive(&self, expr: &Expr, wrt: &Symbol) -> Result<Expr, SymbolicError> {
        match expr {
            Expr::Const(_) => Ok(Expr::zero()),
            Expr::Sym(symbol) if symbol == wrt => Ok(Expr::one()),
            Expr::Sym(symbol) if self.implicit && symbol.depends_on(wrt) => {
                Ok(Expr::differential(symbol, wrt, 1))
            }
            Expr::Sym(_) => Ok(Expr::zero()),
            Expr::Op(Operator::Differential { wrt: inner_wrt, order }, args) => {
                let Some(target) = args.first().and_then(Expr::as_symbol) else {
                    return Err(SymbolicError::ShapeMismatch(format!(
                        "differential of non-symbol `{expr}`"
                    )));
                };
                if !self.implicit {
                    return Ok(Expr::zero());
                }
                if inner_wrt == wrt {
                    return Ok(Expr::differential(target, wrt, order + 1));
                }
                // mixed derivatives have no leaf form
                if target.depends_on(wrt) {
                    return Err(SymbolicError::UnregisteredDerivative(format!(
                        "{expr} with respect to {wrt}"
                    )));
                }
                Ok(Expr::zero())
            }
            Expr::Op(op, args) => {
                if op.arity().is_some_and(|arity| arity != args.len()) {
                    return Err(SymbolicError::ShapeMismatch(format!(
                        "`{op}` applied to {} arguments",
                        args.len()
                    )));
                }
                let rule = self
                    .registry
                    .derivative(op)
                    .ok_or_else(|| SymbolicError::UnregisteredDerivative(op.to_string()))?;

                let mut terms = Vec::with_capacity(args.len());
                for (position, arg) in args.iter().enumerate() {
                    let inner = self.derive(arg, wrt)?;
                    if inner.is_zero() {
                        continue;
                    }
                    let outer = rule.partial(args, position).ok_or_else(|| {
                        SymbolicError::UnregisteredDerivative(format!("{op}[{position}]"))
                    })?;
                    terms.push(chain(outer, inner));
                }
                Ok(match terms.len() {
                    0 => Expr::zero(),
                    1 => terms.remove(0),
                    _ => Expr::add(terms),
                })
            }
        }
    }
}

fn chain(outer: Expr, inner: Expr) -> Expr {
    if outer.is_one() {
        inner
    } else if inner.is_one() {
        outer
    } else {
        Expr::mul(vec![outer, inner])
    }
}

/// Expands the `Differential` nodes of `expr` with the standard rules.
///
/// `definitions` maps derived quantities to their defining expressions;
/// derivatives of such a quantity are replaced by the derivative of its
/// definition.
pub fn expand_derivatives(
    expr: &Expr,
    definitions: &HashMap<Symbol, Expr>,
) -> Result<Expr, SymbolicError> {
    expand_derivatives_with(
        expr,
        definitions,
        RuleRegistry::standard(),
        ExpandOptions::default(),
    )
}

/// Rewrites every `Differential` node until only derivatives of states with
/// respect to an independent variable remain.
///
/// Per node `D_w^k(s)`:
///
/// - `k == 0` becomes `s`
/// - `s == w` becomes `1` for `k == 1`, else `0`
/// - a defined `s` becomes the `k`-th derivative of its definition
/// - a state differentiated by an independent variable is kept
/// - anything else is `0`
///
/// # Errors
/// `NonTerminating` when expandable nodes remain after the iteration budget,
/// as happens for self-referential definitions such as `y := y + 1`.
pub fn expand_derivatives_with(
    expr: &Expr,
    definitions: &HashMap<Symbol, Expr>,
    registry: &RuleRegistry,
    options: ExpandOptions,
) -> Result<Expr, SymbolicError> {
    let mut current = simplify(expr);
    for pass in 0..options.max_iterations {
        if !has_expandable(&current, definitions) {
            return Ok(current);
        }
        current = simplify(&expand_pass(&current, definitions, registry)?);
        trace!("derivative expansion pass {}: {} nodes", pass + 1, current.size());
    }
    if has_expandable(&current, definitions) {
        return Err(SymbolicError::NonTerminating {
            iterations: options.max_iterations,
            expr: current.to_string(),
        });
    }
    Ok(current)
}

fn is_expandable(node: &Expr, definitions: &HashMap<Symbol, Expr>) -> bool {
    match node.as_differential() {
        Some((target, wrt, order)) => {
            order == 0
                || target == wrt
                || definitions.contains_key(target)
                || !target.depends_on(wrt)
        }
        None => false,
    }
}

fn has_expandable(expr: &Expr, definitions: &HashMap<Symbol, Expr>) -> bool {
    is_expandable(expr, definitions)
        || expr
            .args()
            .iter()
            .any(|arg| has_expandable(arg, definitions))
}

fn expand_pass(
    expr: &Expr,
    definitions: &HashMap<Symbol, Expr>,
    registry: &RuleRegistry,
) -> Result<Expr, SymbolicError> {
    if let Some((target, wrt, order)) = expr.as_differential() {
        if order == 0 {
            return Ok(target.to_expr());
        }
        if target == wrt {
            return Ok(if order == 1 { Expr::one() } else { Expr::zero() });
        }
        if let Some(definition) = definitions.get(target) {
            let mut derived = definition.clone();
            for _ in 0..order {
                derived = differentiate_with(&derived, wrt, registry)?;
            }
            return Ok(derived);
        }
        if target.depends_on(wrt) {
            return Ok(expr.clone());
        }
        return Ok(Expr::zero());
    }
    match expr {
        Expr::Op(op, args) => {
            let args = args
                .iter()
                .map(|arg| expand_pass(arg, definitions, registry))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::apply(op.clone(), args))
        }
        _ => Ok(expr.clone()),
    }
}
