//! Equations `lhs ~ rhs` over expression trees.

use std::collections::HashMap;
use std::fmt;

use crate::expr::{Expr, Symbol};

/// A pair of expressions stating `lhs ~ rhs`.
///
/// Ordinary differential equations put the derivative of one state on the
/// left, algebraic constraints put a `0` there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Equation {
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Equation {
    pub fn new(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Self {
        Self {
            lhs: lhs.into(),
            rhs: rhs.into(),
        }
    }

    /// Shorthand for `D_wrt(state) ~ rhs`.
    pub fn ode(state: &Symbol, wrt: &Symbol, rhs: Expr) -> Self {
        Self::new(Expr::differential(state, wrt, 1), rhs)
    }

    /// Shorthand for `0 ~ rhs`.
    pub fn algebraic(rhs: Expr) -> Self {
        Self::new(Expr::zero(), rhs)
    }

    /// `(target, wrt, order)` when the left-hand side is a single derivative.
    pub fn differential_lhs(&self) -> Option<(&Symbol, &Symbol, u32)> {
        self.lhs.as_differential()
    }

    /// Whether the left-hand side is the constant `0`.
    pub fn is_algebraic(&self) -> bool {
        self.lhs.is_zero()
    }

    /// `rhs - lhs`, zero whenever the equation holds.
    pub fn residual(&self) -> Expr {
        if self.lhs.is_zero() {
            self.rhs.clone()
        } else {
            Expr::sub(self.rhs.clone(), self.lhs.clone())
        }
    }

    /// Applies [`Expr::substitute`] to both sides.
    pub fn substitute(&self, rules: &HashMap<Expr, Expr>) -> Equation {
        Equation {
            lhs: self.lhs.substitute(rules),
            rhs: self.rhs.substitute(rules),
        }
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.lhs, self.rhs)
    }
}
