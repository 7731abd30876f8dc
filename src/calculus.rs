//! Derivative-matrix calculators.
//!
//! Every entry produced here is `simplify(differentiate(..))`. The sparse
//! variants consult [`crate::sparsity`] first and only differentiate
//! structurally nonzero entries.

use std::fmt;

use itertools::Itertools;
use rayon::prelude::*;

use crate::diff::{differentiate_with, partial_with};
use crate::equation::Equation;
use crate::errors::SymbolicError;
use crate::expr::{Expr, Symbol};
use crate::registry::RuleRegistry;
use crate::simplify::simplify;
use crate::sparsity::{hessian_sparsity_with, jacobian_sparsity, SparsityPattern};

/// Settings shared by the matrix calculators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalculusOptions {
    /// Assemble rows on the rayon thread pool
    pub parallel: bool,
}

/// Dense matrix of expressions, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<Expr>,
}

impl ExprMatrix {
    /// # Errors
    /// `ShapeMismatch` when `entries.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, entries: Vec<Expr>) -> Result<Self, SymbolicError> {
        if entries.len() != rows * cols {
            return Err(SymbolicError::length(
                &format!("{rows}x{cols} matrix entries"),
                rows * cols,
                entries.len(),
            ));
        }
        Ok(Self {
            rows,
            cols,
            entries,
        })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: vec![Expr::zero(); rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut matrix = Self::zeros(n, n);
        for i in 0..n {
            matrix.entries[i * n + i] = Expr::one();
        }
        matrix
    }

    /// Builds a matrix from equally long rows.
    pub fn from_rows(rows: Vec<Vec<Expr>>) -> Result<Self, SymbolicError> {
        let n_rows = rows.len();
        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|row| row.len() != n_cols) {
            return Err(SymbolicError::length("matrix row", n_cols, bad.len()));
        }
        Ok(Self {
            rows: n_rows,
            cols: n_cols,
            entries: rows.into_iter().flatten().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> &Expr {
        &self.entries[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[Expr] {
        &self.entries[row * self.cols..(row + 1) * self.cols]
    }

    /// All entries, row-major.
    pub fn entries(&self) -> &[Expr] {
        &self.entries
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, value: Expr) {
        self.entries[row * self.cols + col] = value;
    }

    /// Structurally nonzero entries.
    pub fn pattern(&self) -> SparsityPattern {
        let mut pattern = SparsityPattern::new(self.rows, self.cols);
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.is_zero() {
                pattern.set(index / self.cols, index % self.cols);
            }
        }
        pattern
    }
}

impl fmt::Display for ExprMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.rows {
            writeln!(f, "[{}]", self.row(row).iter().join(", "))?;
        }
        Ok(())
    }
}

/// Coordinate list of structurally nonzero entries, sorted row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExprMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, Expr)>,
}

impl SparseExprMatrix {
    /// # Errors
    /// `ShapeMismatch` for an entry outside the matrix or a repeated position.
    pub fn new(
        rows: usize,
        cols: usize,
        mut entries: Vec<(usize, usize, Expr)>,
    ) -> Result<Self, SymbolicError> {
        entries.sort_by_key(|(row, col, _)| (*row, *col));
        if let Some((row, col, _)) = entries.iter().find(|(r, c, _)| *r >= rows || *c >= cols) {
            return Err(SymbolicError::ShapeMismatch(format!(
                "entry ({row}, {col}) outside {rows}x{cols} matrix"
            )));
        }
        if let Some(pair) = entries
            .windows(2)
            .find(|pair| (pair[0].0, pair[0].1) == (pair[1].0, pair[1].1))
        {
            return Err(SymbolicError::ShapeMismatch(format!(
                "repeated entry ({}, {})",
                pair[0].0, pair[0].1
            )));
        }
        Ok(Self {
            rows,
            cols,
            entries,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    /// `(row, col, value)` triples in row-major order.
    pub fn entries(&self) -> &[(usize, usize, Expr)] {
        &self.entries
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Expr> {
        self.entries
            .binary_search_by_key(&(row, col), |(r, c, _)| (*r, *c))
            .ok()
            .map(|index| &self.entries[index].2)
    }

    pub fn pattern(&self) -> SparsityPattern {
        let mut pattern = SparsityPattern::new(self.rows, self.cols);
        for (row, col, _) in &self.entries {
            pattern.set(*row, *col);
        }
        pattern
    }

    pub fn to_dense(&self) -> ExprMatrix {
        let mut dense = ExprMatrix::zeros(self.rows, self.cols);
        for (row, col, value) in &self.entries {
            dense.set(*row, *col, value.clone());
        }
        dense
    }
}

/// `W = L * U` with unit lower triangular `L`, computed without pivoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicLu {
    l: ExprMatrix,
    u: ExprMatrix,
}

impl SymbolicLu {
    pub fn l(&self) -> &ExprMatrix {
        &self.l
    }

    pub fn u(&self) -> &ExprMatrix {
        &self.u
    }

    /// Strict lower part of `L` and upper part of `U` in one matrix, the
    /// layout LAPACK-style solvers expect.
    pub fn packed(&self) -> ExprMatrix {
        let n = self.u.rows();
        let mut packed = self.u.clone();
        for i in 0..n {
            for j in 0..i {
                packed.set(i, j, self.l.get(i, j).clone());
            }
        }
        packed
    }
}

fn assemble<T, F>(count: usize, options: CalculusOptions, f: F) -> Result<Vec<T>, SymbolicError>
where
    T: Send,
    F: Fn(usize) -> Result<T, SymbolicError> + Sync + Send,
{
    if options.parallel {
        (0..count).into_par_iter().map(f).collect()
    } else {
        (0..count).map(f).collect()
    }
}

/// Dense Jacobian of `exprs` with respect to `vars`.
pub fn jacobian(exprs: &[Expr], vars: &[Symbol]) -> Result<ExprMatrix, SymbolicError> {
    jacobian_with(exprs, vars, RuleRegistry::standard(), CalculusOptions::default())
}

/// Dense Jacobian; entry `(i, j)` is `simplify(differentiate(exprs[i], vars[j]))`.
pub fn jacobian_with(
    exprs: &[Expr],
    vars: &[Symbol],
    registry: &RuleRegistry,
    options: CalculusOptions,
) -> Result<ExprMatrix, SymbolicError> {
    let rows = assemble(exprs.len(), options, |i| {
        vars.iter()
            .map(|var| Ok(simplify(&differentiate_with(&exprs[i], var, registry)?)))
            .collect::<Result<Vec<_>, SymbolicError>>()
    })?;
    ExprMatrix::from_rows(rows).map(|matrix| {
        if matrix.rows == 0 {
            ExprMatrix::zeros(0, vars.len())
        } else {
            matrix
        }
    })
}

/// Sparsity-guided Jacobian of `exprs` with respect to `vars`.
pub fn sparse_jacobian(exprs: &[Expr], vars: &[Symbol]) -> Result<SparseExprMatrix, SymbolicError> {
    sparse_jacobian_with(exprs, vars, RuleRegistry::standard(), CalculusOptions::default())
}

/// Differentiates only the entries [`jacobian_sparsity`] marks as present.
///
/// Entries that simplify to zero anyway (e.g. `x - x`) are dropped, so the
/// result's pattern can be tighter than the structural one.
pub fn sparse_jacobian_with(
    exprs: &[Expr],
    vars: &[Symbol],
    registry: &RuleRegistry,
    options: CalculusOptions,
) -> Result<SparseExprMatrix, SymbolicError> {
    let pattern = jacobian_sparsity(exprs, vars);
    let rows = assemble(exprs.len(), options, |i| {
        let mut row = Vec::new();
        for j in (0..vars.len()).filter(|&j| pattern.get(i, j)) {
            let entry = simplify(&differentiate_with(&exprs[i], &vars[j], registry)?);
            if !entry.is_zero() {
                row.push((i, j, entry));
            }
        }
        Ok(row)
    })?;
    SparseExprMatrix::new(exprs.len(), vars.len(), rows.into_iter().flatten().collect())
}

/// Hessian of a scalar `expr` with respect to `vars`.
pub fn hessian(expr: &Expr, vars: &[Symbol]) -> Result<ExprMatrix, SymbolicError> {
    hessian_with(expr, vars, RuleRegistry::standard())
}

/// Symmetric Hessian; only entries of the Hessian sparsity pattern are
/// differentiated, the lower triangle is mirrored from the upper one.
pub fn hessian_with(
    expr: &Expr,
    vars: &[Symbol],
    registry: &RuleRegistry,
) -> Result<ExprMatrix, SymbolicError> {
    let pattern = hessian_sparsity_with(expr, vars, registry)?;
    let n = vars.len();
    let mut matrix = ExprMatrix::zeros(n, n);
    for (i, var_i) in vars.iter().enumerate() {
        if !(i..n).any(|j| pattern.get(i, j)) {
            continue;
        }
        let gradient = differentiate_with(expr, var_i, registry)?;
        for j in (i..n).filter(|&j| pattern.get(i, j)) {
            let entry = simplify(&differentiate_with(&gradient, &vars[j], registry)?);
            matrix.set(j, i, entry.clone());
            matrix.set(i, j, entry);
        }
    }
    Ok(matrix)
}

/// Explicit derivative of each expression with respect to the independent variable.
pub fn time_gradient(exprs: &[Expr], iv: &Symbol) -> Result<Vec<Expr>, SymbolicError> {
    time_gradient_with(exprs, iv, RuleRegistry::standard())
}

pub fn time_gradient_with(
    exprs: &[Expr],
    iv: &Symbol,
    registry: &RuleRegistry,
) -> Result<Vec<Expr>, SymbolicError> {
    exprs
        .iter()
        .map(|expr| Ok(simplify(&partial_with(expr, iv, registry)?)))
        .collect()
}

/// 0/1 mass matrix of a semi-explicit system.
///
/// Row `i` holds a `1` in the column of the state whose first derivative is
/// the left-hand side of equation `i`, or nothing for an algebraic equation.
///
/// # Errors
/// `UnsupportedMassMatrix` for any other left-hand side, including higher
/// order derivatives and derivatives of non-states.
pub fn mass_matrix(equations: &[Equation], states: &[Symbol]) -> Result<ExprMatrix, SymbolicError> {
    let mut matrix = ExprMatrix::zeros(equations.len(), states.len());
    for (row, eq) in equations.iter().enumerate() {
        if eq.is_algebraic() {
            continue;
        }
        let unsupported = || SymbolicError::UnsupportedMassMatrix {
            equation: row,
            lhs: eq.lhs.to_string(),
        };
        let (target, _, order) = eq.differential_lhs().ok_or_else(unsupported)?;
        if order != 1 {
            return Err(unsupported());
        }
        let col = states
            .iter()
            .position(|state| state == target)
            .ok_or_else(unsupported)?;
        matrix.set(row, col, Expr::one());
    }
    Ok(matrix)
}

/// Builds `W = M - gamma*J` (or `W = M/gamma - J` when `transformed`) and
/// factorizes it by symbolic LU without pivoting.
///
/// # Errors
/// - `ShapeMismatch` when `mass` and `jac` are not square of one size
/// - `SingularSymbolicFactorization` when a pivot simplifies to zero
pub fn factorized_operator(
    mass: &ExprMatrix,
    jac: &ExprMatrix,
    gamma: &Symbol,
    transformed: bool,
) -> Result<SymbolicLu, SymbolicError> {
    if !mass.is_square() || !jac.is_square() || mass.rows() != jac.rows() {
        return Err(SymbolicError::ShapeMismatch(format!(
            "factorized operator needs square matrices of one size, got {}x{} and {}x{}",
            mass.rows(),
            mass.cols(),
            jac.rows(),
            jac.cols()
        )));
    }
    let gamma = gamma.to_expr();
    let entries = mass
        .entries()
        .iter()
        .zip(jac.entries())
        .map(|(m, j)| {
            let w = if transformed {
                Expr::sub(Expr::div(m.clone(), gamma.clone()), j.clone())
            } else {
                Expr::sub(m.clone(), Expr::mul(vec![gamma.clone(), j.clone()]))
            };
            simplify(&w)
        })
        .collect();
    let w = ExprMatrix::new(mass.rows(), mass.cols(), entries)?;
    lu(&w)
}

/// `Σ_{s<k} a(i, s) * b(s, j)` subtracted from `w(i, j)`.
fn reduced(w: &Expr, products: impl Iterator<Item = (Expr, Expr)>) -> Expr {
    let terms: Vec<Expr> = products
        .filter(|(a, b)| !a.is_zero() && !b.is_zero())
        .map(|(a, b)| Expr::mul(vec![a, b]))
        .collect();
    if terms.is_empty() {
        return w.clone();
    }
    simplify(&Expr::sub(w.clone(), Expr::add(terms)))
}

/// Doolittle factorization without pivoting.
pub fn lu(w: &ExprMatrix) -> Result<SymbolicLu, SymbolicError> {
    if !w.is_square() {
        return Err(SymbolicError::ShapeMismatch(format!(
            "LU needs a square matrix, got {}x{}",
            w.rows(),
            w.cols()
        )));
    }
    let n = w.rows();
    let mut l = ExprMatrix::identity(n);
    let mut u = ExprMatrix::zeros(n, n);
    for k in 0..n {
        for j in k..n {
            let value = reduced(
                w.get(k, j),
                (0..k).map(|s| (l.get(k, s).clone(), u.get(s, j).clone())),
            );
            u.set(k, j, value);
        }
        let pivot = u.get(k, k).clone();
        if pivot.is_zero() {
            return Err(SymbolicError::SingularSymbolicFactorization { pivot: k });
        }
        for i in k + 1..n {
            let numerator = reduced(
                w.get(i, k),
                (0..k).map(|s| (l.get(i, s).clone(), u.get(s, k).clone())),
            );
            l.set(i, k, simplify(&Expr::div(numerator, pivot.clone())));
        }
    }
    Ok(SymbolicLu { l, u })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn lotka_volterra() -> (Vec<Symbol>, Vec<Expr>) {
        let [x, y] = ["x", "y"].map(Symbol::state);
        let [a, b, c, d] = ["a", "b", "c", "d"].map(Symbol::parameter);
        let e = Symbol::to_expr;
        let rhss = vec![
            Expr::sub(
                Expr::mul(vec![e(&a), e(&x)]),
                Expr::mul(vec![e(&b), e(&x), e(&y)]),
            ),
            Expr::sub(
                Expr::mul(vec![e(&d), e(&x), e(&y)]),
                Expr::mul(vec![e(&c), e(&y)]),
            ),
        ];
        (vec![x, y], rhss)
    }

    #[test]
    fn test_jacobian_entries() -> Result<(), Box<dyn std::error::Error>> {
        let (states, rhss) = lotka_volterra();
        let jac = jacobian(&rhss, &states)?;
        assert_eq!((jac.rows(), jac.cols()), (2, 2));
        assert_eq!(jac.get(0, 1).to_string(), "-(b * x)");
        assert_eq!(jac.get(1, 1).to_string(), "((d * x) + -(c))");
        Ok(())
    }

    #[test]
    fn test_dense_and_sparse_jacobian_agree() -> Result<(), Box<dyn std::error::Error>> {
        let [x, y, z] = ["x", "y", "z"].map(Symbol::state);
        let e = Symbol::to_expr;
        let rhss = vec![
            Expr::mul(vec![Expr::sin(e(&x)), Expr::exp(e(&y))]),
            Expr::div(e(&z), Expr::add(vec![Expr::one(), Expr::powi(e(&x), 2)])),
            Expr::sub(e(&y), e(&y)),
        ];
        let vars = [x, y, z];
        let dense = jacobian(&rhss, &vars)?;
        let sparse = sparse_jacobian(&rhss, &vars)?;

        for (row, col, value) in sparse.entries() {
            assert_eq!(dense.get(*row, *col), value);
        }
        assert_eq!(dense.pattern(), sparse.pattern());
        assert_eq!(sparse.to_dense(), dense);
        assert_eq!(sparse.nnz(), 4);
        Ok(())
    }

    #[test]
    fn test_hessian_is_symmetric_and_sparse() -> Result<(), Box<dyn std::error::Error>> {
        let [x, y, z] = ["x", "y", "z"].map(Symbol::state);
        // x^2*y + z
        let expr = Expr::add(vec![
            Expr::mul(vec![Expr::powi(x.to_expr(), 2), y.to_expr()]),
            z.to_expr(),
        ]);
        let vars = [x.clone(), y.clone(), z];
        let h = hessian(&expr, &vars)?;
        assert_eq!(h.get(0, 0), &Expr::mul(vec![Expr::Const(2.0), y.to_expr()]));
        assert_eq!(h.get(0, 1), h.get(1, 0));
        assert_eq!(h.get(0, 1), &Expr::mul(vec![Expr::Const(2.0), x.to_expr()]));
        assert!(h.get(1, 1).is_zero());
        assert!(h.row(2).iter().all(Expr::is_zero));
        Ok(())
    }

    #[test]
    fn test_time_gradient() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");
        // x * sin(t)
        let rhss = vec![
            Expr::mul(vec![x.to_expr(), Expr::sin(t.to_expr())]),
            x.to_expr(),
        ];
        let grad = time_gradient(&rhss, &t)?;
        assert_eq!(grad[0], Expr::mul(vec![x.to_expr(), Expr::cos(t.to_expr())]));
        assert!(grad[1].is_zero());
        Ok(())
    }

    #[test]
    fn test_mass_matrix() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let [x1, x2] = ["x1", "x2"].map(Symbol::state);
        // [D(x1) ~ -x1, 0 ~ x1 - x2]
        let equations = vec![
            Equation::ode(&x1, &t, Expr::neg(x1.to_expr())),
            Equation::algebraic(Expr::sub(x1.to_expr(), x2.to_expr())),
        ];
        let states = [x1.clone(), x2.clone()];
        let mass = mass_matrix(&equations, &states)?;
        let expected = ExprMatrix::from_rows(vec![
            vec![Expr::one(), Expr::zero()],
            vec![Expr::zero(), Expr::zero()],
        ])?;
        assert_eq!(mass, expected);

        let implicit = vec![Equation::new(
            Expr::mul(vec![Expr::Const(2.0), Expr::differential(&x1, &t, 1)]),
            x1.to_expr(),
        )];
        assert!(matches!(
            mass_matrix(&implicit, &states),
            Err(SymbolicError::UnsupportedMassMatrix { equation: 0, .. })
        ));

        let second_order = vec![Equation::new(Expr::differential(&x1, &t, 2), x1.to_expr())];
        assert!(matches!(
            mass_matrix(&second_order, &states),
            Err(SymbolicError::UnsupportedMassMatrix { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_factorized_operator_reconstructs_w() -> Result<(), Box<dyn std::error::Error>> {
        let (states, rhss) = lotka_volterra();
        let jac = jacobian(&rhss, &states)?;
        let gamma = Symbol::parameter("γ");
        let mass = ExprMatrix::identity(2);
        let lu_w = factorized_operator(&mass, &jac, &gamma, false)?;

        let env: HashMap<Symbol, f64> = [
            ("x", 1.2, true),
            ("y", 0.8, true),
            ("a", 1.5, false),
            ("b", 1.0, false),
            ("c", 3.0, false),
            ("d", 1.0, false),
            ("γ", 0.1, false),
        ]
        .into_iter()
        .map(|(name, value, state)| {
            let symbol = if state {
                Symbol::state(name)
            } else {
                Symbol::parameter(name)
            };
            (symbol, value)
        })
        .collect();

        // L * U == I - gamma * J at a sample point
        for i in 0..2 {
            for j in 0..2 {
                let mut product = 0.0;
                for k in 0..2 {
                    product += lu_w.l().get(i, k).evaluate(&env)? * lu_w.u().get(k, j).evaluate(&env)?;
                }
                let identity = if i == j { 1.0 } else { 0.0 };
                let expected = identity - 0.1 * jac.get(i, j).evaluate(&env)?;
                assert_relative_eq!(product, expected, epsilon = 1e-12);
            }
        }

        let packed = lu_w.packed();
        assert_eq!(packed.get(1, 0), lu_w.l().get(1, 0));
        assert_eq!(packed.get(0, 1), lu_w.u().get(0, 1));
        Ok(())
    }

    #[test]
    fn test_zero_pivot_is_singular() {
        let t = Symbol::independent("t");
        let [x1, x2] = ["x1", "x2"].map(Symbol::state);
        let equations = vec![
            Equation::algebraic(x2.to_expr()),
            Equation::ode(&x2, &t, x1.to_expr()),
        ];
        let states = [x1, x2];
        let mass = mass_matrix(&equations, &states).unwrap();
        let rhss: Vec<Expr> = equations.iter().map(|eq| eq.rhs.clone()).collect();
        let jac = jacobian(&rhss, &states).unwrap();
        // W(0, 0) = 0 - gamma * d(x2)/d(x1) = 0
        let result = factorized_operator(&mass, &jac, &Symbol::parameter("γ"), false);
        assert!(matches!(
            result,
            Err(SymbolicError::SingularSymbolicFactorization { pivot: 0 })
        ));
    }

    #[test]
    fn test_parallel_assembly_matches_serial() -> Result<(), Box<dyn std::error::Error>> {
        let (states, rhss) = lotka_volterra();
        let registry = RuleRegistry::standard();
        let serial = jacobian_with(&rhss, &states, registry, CalculusOptions::default())?;
        let parallel = jacobian_with(&rhss, &states, registry, CalculusOptions { parallel: true })?;
        assert_eq!(serial, parallel);
        Ok(())
    }
}
