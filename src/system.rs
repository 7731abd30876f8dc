//! Equation systems.
//!
//! An [`EquationSystem`] bundles an independent variable, ordered lists of
//! states and parameters, ordered equations and optional observed
//! definitions. Systems are immutable once built; every transformation
//! returns a new system with a fresh [`SystemId`], so derivative caches keyed
//! by identity never see stale data.
//!
//! # Example
//!
//! ```
//! use symsys::prelude::*;
//!
//! let t = Symbol::independent("t");
//! let x = Symbol::state("x");
//! let k = Symbol::parameter("k");
//!
//! let system = EquationSystem::builder("decay")
//!     .independent(&t)
//!     .states(&[x.clone()])
//!     .parameters(&[k.clone()])
//!     .equation(Equation::ode(&x, &t, Expr::neg(Expr::mul(vec![k.to_expr(), x.to_expr()]))))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(system.states(), &[x]);
//! assert_eq!(system.equations().len(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use colored::Colorize;
use itertools::Itertools;

use crate::equation::Equation;
use crate::errors::SymbolicError;
use crate::expr::{Expr, Symbol, SymbolKind};

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of one built system, used as the derivative cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(u64);

impl SystemId {
    fn fresh() -> Self {
        SystemId(NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable system of equations.
pub struct EquationSystem {
    id: SystemId,
    // dropped with the system; caches hold the weak side
    alive: Arc<()>,
    name: String,
    independent: Option<Symbol>,
    states: Vec<Symbol>,
    parameters: Vec<Symbol>,
    equations: Vec<Equation>,
    observed: Vec<(Symbol, Expr)>,
}

impl EquationSystem {
    /// Starts building a system called `name`.
    pub fn builder(name: &str) -> SystemBuilder {
        SystemBuilder::new(name)
    }

    /// Dies when the system is dropped.
    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.alive)
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The independent variable; `None` for purely algebraic systems.
    pub fn independent(&self) -> Option<&Symbol> {
        self.independent.as_ref()
    }

    /// The independent variable, or `InvalidSystem` when there is none.
    pub fn require_independent(&self) -> Result<&Symbol, SymbolicError> {
        self.independent.as_ref().ok_or_else(|| {
            SymbolicError::InvalidSystem(format!("system `{}` has no independent variable", self.name))
        })
    }

    pub fn states(&self) -> &[Symbol] {
        &self.states
    }

    pub fn parameters(&self) -> &[Symbol] {
        &self.parameters
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// Observed quantities with their defining expressions, in declaration order.
    pub fn observed(&self) -> &[(Symbol, Expr)] {
        &self.observed
    }

    /// Observed definitions as a lookup table for derivative expansion.
    pub fn definitions(&self) -> HashMap<Symbol, Expr> {
        self.observed.iter().cloned().collect()
    }

    /// Right-hand sides in equation order.
    pub fn rhss(&self) -> Vec<Expr> {
        self.equations.iter().map(|eq| eq.rhs.clone()).collect()
    }

    /// Right-hand sides with every observed quantity replaced by its definition.
    ///
    /// # Errors
    /// `NonTerminating` when observed definitions refer to each other in a cycle.
    pub fn full_rhss(&self) -> Result<Vec<Expr>, SymbolicError> {
        let rules: HashMap<Expr, Expr> = self
            .observed
            .iter()
            .map(|(symbol, definition)| (symbol.to_expr(), definition.clone()))
            .collect();
        let rounds = self.observed.len() + 1;
        self.equations
            .iter()
            .map(|eq| {
                let mut current = eq.rhs.clone();
                for _ in 0..rounds {
                    let next = current.substitute(&rules);
                    if next == current {
                        return Ok(current);
                    }
                    current = next;
                }
                Err(SymbolicError::NonTerminating {
                    iterations: rounds,
                    expr: current.to_string(),
                })
            })
            .collect()
    }

    /// States as expressions, in order.
    pub fn state_exprs(&self) -> Vec<Expr> {
        self.states.iter().map(Symbol::to_expr).collect()
    }

    /// Every symbol declared by the system.
    pub fn declared_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.independent
            .iter()
            .chain(&self.states)
            .chain(&self.parameters)
            .chain(self.observed.iter().map(|(symbol, _)| symbol))
    }

    /// A new system sharing this one's name, independent variable,
    /// parameters and observed definitions.
    pub(crate) fn derive(&self, states: Vec<Symbol>, equations: Vec<Equation>) -> EquationSystem {
        EquationSystem {
            id: SystemId::fresh(),
            alive: Arc::new(()),
            name: self.name.clone(),
            independent: self.independent.clone(),
            states,
            parameters: self.parameters.clone(),
            equations,
            observed: self.observed.clone(),
        }
    }
}

impl fmt::Debug for EquationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {} {}", "System".cyan(), self.name, self.id)?;
        if let Some(iv) = &self.independent {
            writeln!(f, "    {}: {}", "Independent".cyan(), iv)?;
        }
        writeln!(f, "    {}: [{}]", "States".cyan(), self.states.iter().join(", "))?;
        writeln!(
            f,
            "    {}: [{}]",
            "Parameters".cyan(),
            self.parameters.iter().join(", ")
        )?;
        writeln!(f, "    {}:", "Equations".cyan())?;
        for equation in &self.equations {
            writeln!(f, "        {equation}")?;
        }
        if !self.observed.is_empty() {
            writeln!(f, "    {}:", "Observed".cyan())?;
            for (symbol, definition) in &self.observed {
                writeln!(f, "        {symbol} := {definition}")?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for EquationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for equation in &self.equations {
            writeln!(f, "{equation}")?;
        }
        Ok(())
    }
}

/// Collects the pieces of an [`EquationSystem`] and validates them on
/// [`SystemBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct SystemBuilder {
    name: String,
    independent: Option<Symbol>,
    states: Vec<Symbol>,
    parameters: Vec<Symbol>,
    equations: Vec<Equation>,
    observed: Vec<(Symbol, Expr)>,
}

impl SystemBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn independent(mut self, iv: &Symbol) -> Self {
        self.independent = Some(iv.clone());
        self
    }

    pub fn states(mut self, states: &[Symbol]) -> Self {
        self.states.extend_from_slice(states);
        self
    }

    pub fn parameters(mut self, parameters: &[Symbol]) -> Self {
        self.parameters.extend_from_slice(parameters);
        self
    }

    pub fn equation(mut self, equation: Equation) -> Self {
        self.equations.push(equation);
        self
    }

    pub fn equations(mut self, equations: impl IntoIterator<Item = Equation>) -> Self {
        self.equations.extend(equations);
        self
    }

    /// Declares `symbol := definition`.
    pub fn observed(mut self, symbol: &Symbol, definition: Expr) -> Self {
        self.observed.push((symbol.clone(), definition));
        self
    }

    /// Validates roles and uniqueness and freezes the system.
    ///
    /// # Errors
    /// - `InvalidSystem` for a symbol declared under the wrong role
    /// - `DuplicateSymbol` for a symbol or name declared twice
    pub fn build(self) -> Result<EquationSystem, SymbolicError> {
        if let Some(iv) = &self.independent {
            expect_kind(iv, SymbolKind::Independent, "independent variable")?;
        }
        for state in &self.states {
            expect_kind(state, SymbolKind::State, "state")?;
        }
        for parameter in &self.parameters {
            if !matches!(parameter.kind(), SymbolKind::Parameter | SymbolKind::Constant) {
                return Err(SymbolicError::InvalidSystem(format!(
                    "`{parameter}` is declared as a parameter but has role {:?}",
                    parameter.kind()
                )));
            }
        }

        let mut names = HashSet::new();
        let declared = self
            .independent
            .iter()
            .chain(&self.states)
            .chain(&self.parameters)
            .chain(self.observed.iter().map(|(symbol, _)| symbol));
        for symbol in declared {
            if !names.insert(symbol.name()) {
                return Err(SymbolicError::DuplicateSymbol(symbol.name().to_string()));
            }
        }

        Ok(EquationSystem {
            id: SystemId::fresh(),
            alive: Arc::new(()),
            name: self.name,
            independent: self.independent,
            states: self.states,
            parameters: self.parameters,
            equations: self.equations,
            observed: self.observed,
        })
    }
}

fn expect_kind(symbol: &Symbol, kind: SymbolKind, role: &str) -> Result<(), SymbolicError> {
    if symbol.kind() == kind {
        Ok(())
    } else {
        Err(SymbolicError::InvalidSystem(format!(
            "`{symbol}` is declared as {role} but has role {:?}",
            symbol.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_assigns_fresh_identities() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");
        let build = || {
            EquationSystem::builder("growth")
                .independent(&t)
                .states(&[x.clone()])
                .equation(Equation::ode(&x, &t, x.to_expr()))
                .build()
        };
        let first = build()?;
        let second = build()?;
        assert_ne!(first.id(), second.id());

        let derived = first.derive(first.states().to_vec(), first.equations().to_vec());
        assert_ne!(derived.id(), first.id());
        assert_eq!(derived.equations(), first.equations());
        Ok(())
    }

    #[test]
    fn test_rejects_duplicates_and_wrong_roles() {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");

        let duplicate = EquationSystem::builder("dup")
            .independent(&t)
            .states(&[x.clone(), x.clone()])
            .build();
        assert!(matches!(duplicate, Err(SymbolicError::DuplicateSymbol(name)) if name == "x"));

        let shadowed = EquationSystem::builder("shadow")
            .states(&[x.clone()])
            .parameters(&[Symbol::parameter("x")])
            .build();
        assert!(matches!(shadowed, Err(SymbolicError::DuplicateSymbol(_))));

        let wrong_role = EquationSystem::builder("role")
            .states(&[Symbol::parameter("k")])
            .build();
        assert!(matches!(wrong_role, Err(SymbolicError::InvalidSystem(_))));
    }

    #[test]
    fn test_full_rhss_substitutes_observed() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");
        let y = Symbol::state("y");
        let z = Symbol::state("z");
        let system = EquationSystem::builder("observed")
            .independent(&t)
            .states(&[x.clone()])
            .observed(&y, Expr::powi(z.to_expr(), 2))
            .observed(&z, Expr::add(vec![x.to_expr(), Expr::one()]))
            .equation(Equation::ode(&x, &t, Expr::neg(y.to_expr())))
            .build()?;
        let rhss = system.full_rhss()?;
        assert_eq!(
            rhss,
            vec![Expr::neg(Expr::powi(
                Expr::add(vec![x.to_expr(), Expr::one()]),
                2
            ))]
        );

        let cyclic = EquationSystem::builder("cyclic")
            .independent(&t)
            .states(&[x.clone()])
            .observed(&y, Expr::add(vec![y.to_expr(), Expr::one()]))
            .equation(Equation::ode(&x, &t, y.to_expr()))
            .build()?;
        assert!(matches!(
            cyclic.full_rhss(),
            Err(SymbolicError::NonTerminating { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_summary_lists_equations() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");
        let system = EquationSystem::builder("growth")
            .independent(&t)
            .states(&[x.clone()])
            .equation(Equation::ode(&x, &t, x.to_expr()))
            .build()?;
        assert_eq!(system.to_string(), "D_t(x) ~ x\n");
        assert!(format!("{system:?}").contains("D_t(x) ~ x"));
        assert!(system.require_independent().is_ok());
        Ok(())
    }
}
