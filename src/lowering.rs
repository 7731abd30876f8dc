//! Order lowering of differential systems.
//!
//! A state `s` whose highest derivative in the system is `D^n(s)` with
//! `n >= 2` gets `n - 1` auxiliary states `s^(1) .. s^(n-1)` and the chain
//!
//! ```text
//! D(s^(n-2)) ~ s^(n-1)
//! ...
//! D(s)       ~ s^(1)
//! ```
//!
//! Every `D^k(s)` with `k < n` becomes `s^(k)` and `D^n(s)` becomes
//! `D(s^(n-1))`, so the result only holds first derivatives.

use std::collections::{HashMap, HashSet};

use log::info;

use crate::equation::Equation;
use crate::errors::SymbolicError;
use crate::expr::{Expr, Symbol};
use crate::system::EquationSystem;

/// Name of the `order`-th auxiliary state of `base`.
///
/// `ˍ` (U+02CD) never appears in names produced by the builders of this
/// crate, which keeps the map from `(base, order)` to names injective.
pub fn auxiliary_name(base: &Symbol, iv: &Symbol, order: u32) -> String {
    format!("{}ˍ{}^{order}", base.name(), iv.name())
}

/// Rewrites `system` into an equivalent first-order system.
///
/// Auxiliary equations come first, highest order first and grouped by the
/// first appearance of their base state; the substituted original equations
/// follow. States are ordered by the equation that defines their derivative,
/// followed by the remaining states in their original order. A first-order
/// system comes back unchanged apart from its identity.
///
/// # Errors
/// - `InvalidSystem` when the system has no independent variable
/// - `DuplicateSymbol` when an auxiliary name is already declared
pub fn lower_order(system: &EquationSystem) -> Result<EquationSystem, SymbolicError> {
    let iv = system.require_independent()?;
    let states: HashSet<&Symbol> = system.states().iter().collect();

    let mut max_order: HashMap<Symbol, u32> = HashMap::new();
    let mut appearance: Vec<Symbol> = Vec::new();
    for equation in system.equations() {
        for side in [&equation.lhs, &equation.rhs] {
            side.walk(&mut |node| {
                if let Some((target, wrt, order)) = node.as_differential() {
                    if wrt == iv && states.contains(target) {
                        let entry = max_order.entry(target.clone()).or_insert(0);
                        *entry = (*entry).max(order);
                    }
                }
                if let Expr::Sym(symbol) = node {
                    if states.contains(symbol) && !appearance.contains(symbol) {
                        appearance.push(symbol.clone());
                    }
                }
            });
        }
    }

    let declared: HashSet<&str> = system.declared_symbols().map(Symbol::name).collect();
    let mut rules = HashMap::new();
    let mut auxiliary_equations = Vec::new();
    let mut auxiliary_states = Vec::new();

    for base in &appearance {
        let order = max_order.get(base).copied().unwrap_or(0);
        if order < 2 {
            continue;
        }
        // chain[k] is s^(k), chain[0] the state itself
        let mut chain = vec![base.clone()];
        for k in 1..order {
            let name = auxiliary_name(base, iv, k);
            if declared.contains(name.as_str()) {
                return Err(SymbolicError::DuplicateSymbol(name));
            }
            chain.push(Symbol::state(&name));
        }
        for k in 1..order {
            rules.insert(
                Expr::differential(base, iv, k),
                chain[k as usize].to_expr(),
            );
        }
        rules.insert(
            Expr::differential(base, iv, order),
            Expr::differential(&chain[order as usize - 1], iv, 1),
        );
        for k in (0..order as usize - 1).rev() {
            auxiliary_equations.push(Equation::ode(&chain[k], iv, chain[k + 1].to_expr()));
        }
        auxiliary_states.extend(chain.into_iter().skip(1));
    }

    if auxiliary_states.is_empty() {
        return Ok(system.derive(system.states().to_vec(), system.equations().to_vec()));
    }

    let mut equations = auxiliary_equations;
    equations.extend(system.equations().iter().map(|eq| eq.substitute(&rules)));

    let mut ordered: Vec<Symbol> = Vec::new();
    for equation in &equations {
        if let Some((target, _, _)) = equation.differential_lhs() {
            if !ordered.contains(target) {
                ordered.push(target.clone());
            }
        }
    }
    for state in system.states().iter().chain(&auxiliary_states) {
        if !ordered.contains(state) {
            ordered.push(state.clone());
        }
    }

    info!(
        "lowered system `{}`: {} auxiliary states, {} equations",
        system.name(),
        auxiliary_states.len(),
        equations.len(),
    );
    Ok(system.derive(ordered, equations))
}
