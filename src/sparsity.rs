//! Structural analysis: sparsity patterns and dependency graphs.
//!
//! Sparsity is inferred without differentiating anything. Each tracked
//! variable gets an index and every node is abstract-interpreted bottom-up
//! into a [`Footprint`]: the set of variables it reads, the set of variable
//! pairs with a nonzero mixed second derivative, and a coarse
//! [`Linearity`] class. Jacobian sparsity only needs the first set and works
//! for any operator. Hessian sparsity needs the pair set and therefore the
//! [`LinearityClass`] of every operator on the way; an operator without one
//! is an error, never a conservative guess.
//!
//! `Differential` leaves are opaque: they neither read their target nor any
//! other tracked variable.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::equation::Equation;
use crate::errors::SymbolicError;
use crate::expr::{Expr, Operator, Symbol};
use crate::registry::{LinearityClass, RuleRegistry};

/// Boolean matrix of structurally nonzero entries, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    rows: usize,
    cols: usize,
    cells: Vec<bool>,
}

impl SparsityPattern {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![false; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols && self.cells[row * self.cols + col]
    }

    pub(crate) fn set(&mut self, row: usize, col: usize) {
        self.cells[row * self.cols + col] = true;
    }

    /// Number of structurally nonzero entries.
    pub fn nnz(&self) -> usize {
        self.cells.iter().filter(|cell| **cell).count()
    }

    /// `(row, col)` of every nonzero entry, row-major.
    pub fn iter_nonzeros(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| **cell)
            .map(move |(index, _)| (index / cols, index % cols))
    }
}

impl fmt::Display for SparsityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.rows {
            let line: String = (0..self.cols)
                .map(|col| if self.get(row, col) { '•' } else { '·' })
                .collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Lattice of the abstract interpretation, `Constant < Linear < Nonlinear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Linearity {
    Constant,
    Linear,
    Nonlinear,
}

/// Abstract value of one node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Footprint {
    /// Tracked variables the node reads
    pub vars: BTreeSet<usize>,
    /// Pairs `(i, j)` with `i <= j` whose mixed second derivative may be nonzero
    pub pairs: BTreeSet<(usize, usize)>,
    nonlinear: bool,
}

impl Footprint {
    fn variable(index: usize) -> Self {
        Self {
            vars: BTreeSet::from([index]),
            ..Self::default()
        }
    }

    pub fn linearity(&self) -> Linearity {
        if self.vars.is_empty() {
            Linearity::Constant
        } else if self.nonlinear || !self.pairs.is_empty() {
            Linearity::Nonlinear
        } else {
            Linearity::Linear
        }
    }

    fn union(parts: &[Footprint]) -> Self {
        let mut out = Footprint::default();
        for part in parts {
            out.vars.extend(&part.vars);
            out.pairs.extend(&part.pairs);
            out.nonlinear |= part.nonlinear;
        }
        out
    }

    fn add_cross(&mut self, a: &BTreeSet<usize>, b: &BTreeSet<usize>) {
        for &i in a {
            for &j in b {
                self.pairs.insert((i.min(j), i.max(j)));
            }
        }
    }

    /// Every pair of read variables interacts.
    fn saturate(mut self) -> Self {
        let vars = self.vars.clone();
        self.add_cross(&vars, &vars);
        self.nonlinear |= !vars.is_empty();
        self
    }
}

fn index_vars(vars: &[Symbol]) -> HashMap<&Symbol, usize> {
    vars.iter().enumerate().map(|(i, var)| (var, i)).collect()
}

fn collect_reads(expr: &Expr, index: &HashMap<&Symbol, usize>, out: &mut BTreeSet<usize>) {
    match expr {
        Expr::Sym(symbol) => {
            if let Some(&i) = index.get(symbol) {
                out.insert(i);
            }
        }
        Expr::Op(Operator::Differential { .. }, _) | Expr::Const(_) => {}
        Expr::Op(_, args) => {
            for arg in args.iter() {
                collect_reads(arg, index, out);
            }
        }
    }
}

/// Tracked variables `expr` reads, ignoring `Differential` leaves.
pub fn dependencies(expr: &Expr, vars: &[Symbol]) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    collect_reads(expr, &index_vars(vars), &mut out);
    out
}

/// Jacobian sparsity of `exprs` with respect to `vars` by presence propagation.
///
/// Entry `(i, j)` is set when `exprs[i]` reads `vars[j]`. No linearity
/// information is needed, so user functions of any kind are fine.
pub fn jacobian_sparsity(exprs: &[Expr], vars: &[Symbol]) -> SparsityPattern {
    let index = index_vars(vars);
    let mut pattern = SparsityPattern::new(exprs.len(), vars.len());
    for (row, expr) in exprs.iter().enumerate() {
        let mut reads = BTreeSet::new();
        collect_reads(expr, &index, &mut reads);
        for col in reads {
            pattern.set(row, col);
        }
    }
    pattern
}

/// Hessian sparsity of a scalar `expr` with the standard rule table.
pub fn hessian_sparsity(expr: &Expr, vars: &[Symbol]) -> Result<SparsityPattern, SymbolicError> {
    hessian_sparsity_with(expr, vars, RuleRegistry::standard())
}

/// Hessian sparsity of a scalar `expr` with respect to `vars`.
///
/// # Errors
/// `UnknownLinearity` when `expr` contains an operator without a
/// registered linearity class.
pub fn hessian_sparsity_with(
    expr: &Expr,
    vars: &[Symbol],
    registry: &RuleRegistry,
) -> Result<SparsityPattern, SymbolicError> {
    let value = interpret(expr, &index_vars(vars), registry)?;
    let mut pattern = SparsityPattern::new(vars.len(), vars.len());
    for &(i, j) in &value.pairs {
        pattern.set(i, j);
        pattern.set(j, i);
    }
    Ok(pattern)
}

/// Abstract value of `expr` over the tracked variables `vars`.
pub fn footprint(
    expr: &Expr,
    vars: &[Symbol],
    registry: &RuleRegistry,
) -> Result<Footprint, SymbolicError> {
    interpret(expr, &index_vars(vars), registry)
}

fn interpret(
    expr: &Expr,
    index: &HashMap<&Symbol, usize>,
    registry: &RuleRegistry,
) -> Result<Footprint, SymbolicError> {
    let (op, args) = match expr {
        Expr::Const(_) => return Ok(Footprint::default()),
        Expr::Sym(symbol) => {
            return Ok(index
                .get(symbol)
                .map(|&i| Footprint::variable(i))
                .unwrap_or_default())
        }
        Expr::Op(Operator::Differential { .. }, _) => return Ok(Footprint::default()),
        Expr::Op(op, args) => (op, args),
    };

    let class = registry
        .linearity(op)
        .ok_or_else(|| SymbolicError::UnknownLinearity(op.to_string()))?;
    let parts = args
        .iter()
        .map(|arg| interpret(arg, index, registry))
        .collect::<Result<Vec<_>, _>>()?;

    let value = match class {
        LinearityClass::Additive | LinearityClass::PiecewiseLinear => Footprint::union(&parts),
        LinearityClass::Multiplicative => {
            let mut out = Footprint::union(&parts);
            for (a, left) in parts.iter().enumerate() {
                for right in &parts[a + 1..] {
                    out.add_cross(&left.vars, &right.vars);
                }
            }
            out
        }
        LinearityClass::Quotient => match parts.as_slice() {
            [numerator, denominator] => {
                let denominator = denominator.clone().saturate();
                let mut out = Footprint::union(&[numerator.clone(), denominator.clone()]);
                out.add_cross(&numerator.vars, &denominator.vars);
                out
            }
            _ => Footprint::union(&parts).saturate(),
        },
        LinearityClass::Power => match (parts.as_slice(), args.get(1).and_then(Expr::as_const)) {
            ([base, _], Some(exponent)) if exponent == 0.0 || exponent == 1.0 => base.clone(),
            ([base, exponent], _) if exponent.vars.is_empty() => base.clone().saturate(),
            _ => Footprint::union(&parts).saturate(),
        },
        LinearityClass::Nonlinear => Footprint::union(&parts).saturate(),
    };
    Ok(value)
}

/// Bipartite adjacency between sources (equations) and destinations.
///
/// `fadjlist[i]` lists the destinations of source `i` in ascending order,
/// `badjlist[j]` the sources pointing at destination `j`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    fadjlist: Vec<Vec<usize>>,
    badjlist: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph from forward adjacency and the destination count.
    pub fn from_forward(fadjlist: Vec<Vec<usize>>, destinations: usize) -> Self {
        let mut badjlist = vec![Vec::new(); destinations];
        for (source, targets) in fadjlist.iter().enumerate() {
            for &target in targets {
                badjlist[target].push(source);
            }
        }
        Self { fadjlist, badjlist }
    }

    pub fn fadjlist(&self) -> &[Vec<usize>] {
        &self.fadjlist
    }

    pub fn badjlist(&self) -> &[Vec<usize>] {
        &self.badjlist
    }

    /// Destinations of `source`.
    pub fn neighbors(&self, source: usize) -> &[usize] {
        self.fadjlist.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sources that point at `destination`.
    pub fn inneighbors(&self, destination: usize) -> &[usize] {
        self.badjlist
            .get(destination)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.fadjlist.iter().map(Vec::len).sum()
    }
}

/// Equation `i` -> variables its right-hand side reads.
pub fn equation_dependencies(equations: &[Equation], vars: &[Symbol]) -> DependencyGraph {
    let index = index_vars(vars);
    let fadjlist = equations
        .iter()
        .map(|eq| {
            let reads: BTreeSet<usize> = eq
                .rhs
                .free_symbols()
                .iter()
                .filter_map(|symbol| index.get(symbol).copied())
                .collect();
            reads.into_iter().collect()
        })
        .collect();
    DependencyGraph::from_forward(fadjlist, vars.len())
}

/// The variable equation `i` writes: the target of a derivative left-hand
/// side or a plain symbol left-hand side.
fn written_variable(eq: &Equation, index: &HashMap<&Symbol, usize>) -> Option<usize> {
    let target = match eq.differential_lhs() {
        Some((target, _, _)) => target,
        None => eq.lhs.as_symbol()?,
    };
    index.get(target).copied()
}

/// Equation `i` -> the variable its left-hand side writes.
pub fn variable_dependencies(equations: &[Equation], vars: &[Symbol]) -> DependencyGraph {
    let index = index_vars(vars);
    let fadjlist = equations
        .iter()
        .map(|eq| written_variable(eq, &index).into_iter().collect())
        .collect();
    DependencyGraph::from_forward(fadjlist, vars.len())
}

/// Equation `i` -> equations whose right-hand side reads what `i` writes.
///
/// This is the recomputation set after equation `i` changes its variable.
pub fn equation_graph(equations: &[Equation], vars: &[Symbol]) -> DependencyGraph {
    let index = index_vars(vars);
    let reads = equation_dependencies(equations, vars);
    let fadjlist = equations
        .iter()
        .map(|eq| match written_variable(eq, &index) {
            Some(var) => reads.inneighbors(var).to_vec(),
            None => Vec::new(),
        })
        .collect();
    DependencyGraph::from_forward(fadjlist, equations.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionDef;

    struct Robertson {
        states: Vec<Symbol>,
        equations: Vec<Equation>,
    }

    /// `[D(y1) ~ -k1*y1 + k3*y2*y3, 0 ~ y1 + y2 + y3 - 1, D(y2) ~ k1*y1 - k2*y2^2 - k3*y2*y3]`
    fn robertson() -> Robertson {
        let t = Symbol::independent("t");
        let [y1, y2, y3] = ["y1", "y2", "y3"].map(Symbol::state);
        let [k1, k2, k3] = ["k1", "k2", "k3"].map(Symbol::parameter);
        let e = Symbol::to_expr;

        let equations = vec![
            Equation::ode(
                &y1,
                &t,
                Expr::add(vec![
                    Expr::neg(Expr::mul(vec![e(&k1), e(&y1)])),
                    Expr::mul(vec![e(&k3), e(&y2), e(&y3)]),
                ]),
            ),
            Equation::algebraic(Expr::sub(
                Expr::add(vec![e(&y1), e(&y2), e(&y3)]),
                Expr::one(),
            )),
            Equation::ode(
                &y2,
                &t,
                Expr::sub(
                    Expr::sub(
                        Expr::mul(vec![e(&k1), e(&y1)]),
                        Expr::mul(vec![e(&k2), Expr::powi(e(&y2), 2)]),
                    ),
                    Expr::mul(vec![e(&k3), e(&y2), e(&y3)]),
                ),
            ),
        ];
        Robertson {
            states: vec![y1, y2, y3],
            equations,
        }
    }

    #[test]
    fn test_equation_dependencies() {
        let system = robertson();
        let graph = equation_dependencies(&system.equations, &system.states);
        assert_eq!(graph.neighbors(0), &[0, 1, 2]);
        assert_eq!(graph.neighbors(1), &[0, 1, 2]);
        assert_eq!(graph.neighbors(2), &[0, 1, 2]);
        assert_eq!(graph.inneighbors(2), &[0, 1, 2]);
        assert_eq!(graph.num_edges(), 9);
    }

    #[test]
    fn test_variable_dependencies_and_equation_graph() {
        let system = robertson();
        let writes = variable_dependencies(&system.equations, &system.states);
        assert_eq!(writes.fadjlist(), &[vec![0usize], vec![], vec![1]]);
        assert_eq!(writes.inneighbors(1), &[2]);

        let graph = equation_graph(&system.equations, &system.states);
        assert_eq!(graph.neighbors(0), &[0, 1, 2]);
        assert!(graph.neighbors(1).is_empty());
    }

    #[test]
    fn test_jacobian_sparsity() {
        let system = robertson();
        let rhss: Vec<Expr> = system.equations.iter().map(|eq| eq.rhs.clone()).collect();
        let pattern = jacobian_sparsity(&rhss, &system.states);
        assert_eq!(pattern.nnz(), 9);

        // x * f(y) with an unclassified user function still has a Jacobian pattern
        let [x, y, z] = ["x", "y", "z"].map(Symbol::state);
        let expr = Expr::mul(vec![x.to_expr(), Expr::call("f", vec![y.to_expr()])]);
        let pattern = jacobian_sparsity(&[expr], &[x, y, z]);
        assert_eq!(pattern.iter_nonzeros().collect::<Vec<_>>(), vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn test_hessian_sparsity() -> Result<(), Box<dyn std::error::Error>> {
        let [x, y, z] = ["x", "y", "z"].map(Symbol::state);
        let vars = [x.clone(), y.clone(), z.clone()];

        // x*y + z: only the mixed x-y entry
        let expr = Expr::add(vec![Expr::mul(vec![x.to_expr(), y.to_expr()]), z.to_expr()]);
        let pattern = hessian_sparsity(&expr, &vars)?;
        assert_eq!(
            pattern.iter_nonzeros().collect::<Vec<_>>(),
            vec![(0, 1), (1, 0)]
        );

        // sin(x) + y^2 + 3*z: diagonal entries for x and y only
        let expr = Expr::add(vec![
            Expr::sin(x.to_expr()),
            Expr::powi(y.to_expr(), 2),
            Expr::mul(vec![Expr::Const(3.0), z.to_expr()]),
        ]);
        let pattern = hessian_sparsity(&expr, &vars)?;
        assert_eq!(
            pattern.iter_nonzeros().collect::<Vec<_>>(),
            vec![(0, 0), (1, 1)]
        );

        // x / y: the numerator stays linear
        let expr = Expr::div(x.to_expr(), y.to_expr());
        let pattern = hessian_sparsity(&expr, &vars)?;
        assert!(!pattern.get(0, 0));
        assert!(pattern.get(0, 1) && pattern.get(1, 1));

        // abs is piecewise linear
        let expr = Expr::unary(Operator::Abs, Expr::sub(x.to_expr(), z.to_expr()));
        assert_eq!(hessian_sparsity(&expr, &vars)?.nnz(), 0);
        Ok(())
    }

    #[test]
    fn test_unknown_linearity_fails() {
        let x = Symbol::state("x");
        let expr = Expr::call("f", vec![x.to_expr()]);
        assert!(matches!(
            hessian_sparsity(&expr, &[x.clone()]),
            Err(SymbolicError::UnknownLinearity(name)) if name == "f"
        ));

        let mut registry = RuleRegistry::with_standard_rules();
        registry.register_function(FunctionDef::new("f").with_linearity(LinearityClass::Nonlinear));
        let pattern = hessian_sparsity_with(&expr, &[x], &registry).map(|p| p.nnz());
        assert_eq!(pattern.ok(), Some(1));
    }

    #[test]
    fn test_footprint_linearity() -> Result<(), Box<dyn std::error::Error>> {
        let [x, y] = ["x", "y"].map(Symbol::state);
        let vars = [x.clone(), y.clone()];
        let registry = RuleRegistry::standard();

        let linear = Expr::add(vec![x.to_expr(), Expr::mul(vec![Expr::Const(2.0), y.to_expr()])]);
        assert_eq!(footprint(&linear, &vars, registry)?.linearity(), Linearity::Linear);
        let nonlinear = Expr::exp(x.to_expr());
        assert_eq!(footprint(&nonlinear, &vars, registry)?.linearity(), Linearity::Nonlinear);
        assert_eq!(
            footprint(&Expr::Const(1.0), &vars, registry)?.linearity(),
            Linearity::Constant
        );
        Ok(())
    }
}
