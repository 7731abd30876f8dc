//! Generated functions in the calling convention of ODE solvers.
//!
//! [`OdeFunction::build`] compiles the right-hand side of a system into
//! `f(u, p, t)` and `f(du, u, p, t)` and, on request, the companions a
//! stiff or implicit solver asks for: the Jacobian, the explicit time
//! gradient, the mass matrix and the factorized operators `W = M - γJ` and
//! `W_t = M/γ - J`. Every symbolic artifact comes from the caller's
//! [`DerivativeCache`], so building a second bundle for the same system does
//! not differentiate again.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::builder::{
    compile, ArgumentGroup, CodegenTarget, GeneratedFunction, IndexedAccess, JitOptions,
    LeafRenderer,
};
use crate::cache::{gamma, DerivativeCache};
use crate::errors::SymbolicError;
use crate::sparsity::SparsityPattern;
use crate::system::EquationSystem;
use crate::types::Output;

/// Which companions to generate.
#[derive(Debug, Clone)]
pub struct OdeFunctionOptions {
    pub jac: bool,
    pub tgrad: bool,
    /// Compile the Jacobian as the vector of its structural nonzeros
    pub sparse: bool,
    /// Compile `W` and `W_t`
    pub wfact: bool,
    pub renderer: Arc<dyn LeafRenderer>,
    pub jit: JitOptions,
}

impl Default for OdeFunctionOptions {
    fn default() -> Self {
        Self {
            jac: false,
            tgrad: false,
            sparse: false,
            wfact: false,
            renderer: Arc::new(IndexedAccess),
            jit: JitOptions::default(),
        }
    }
}

/// A generated function called as `f(u, p, t)` or `f(out, u, p, t)`.
#[derive(Clone)]
pub struct SolverFunction {
    generated: Arc<GeneratedFunction>,
}

impl SolverFunction {
    pub fn call(&self, u: &[f64], p: &[f64], t: f64) -> Result<Output, SymbolicError> {
        self.generated.call(&[u, p, &[t]])
    }

    pub fn call_into(
        &self,
        out: &mut [f64],
        u: &[f64],
        p: &[f64],
        t: f64,
    ) -> Result<(), SymbolicError> {
        self.generated.call_into(out, &[u, p, &[t]])
    }

    pub fn generated(&self) -> &GeneratedFunction {
        &self.generated
    }
}

/// A generated function called as `W(u, p, γ, t)`, returning the packed LU
/// factors of the operator row-major.
#[derive(Clone)]
pub struct FactorizedFunction {
    generated: Arc<GeneratedFunction>,
}

impl FactorizedFunction {
    pub fn call(&self, u: &[f64], p: &[f64], gamma: f64, t: f64) -> Result<Output, SymbolicError> {
        self.generated.call(&[u, p, &[gamma], &[t]])
    }

    pub fn call_into(
        &self,
        out: &mut [f64],
        u: &[f64],
        p: &[f64],
        gamma: f64,
        t: f64,
    ) -> Result<(), SymbolicError> {
        self.generated.call_into(out, &[u, p, &[gamma], &[t]])
    }
}

/// Compiled right-hand side of a system and its companions.
pub struct OdeFunction {
    f: SolverFunction,
    jac: Option<SolverFunction>,
    jac_pattern: Option<SparsityPattern>,
    tgrad: Option<SolverFunction>,
    mass_matrix: Output,
    w: Option<FactorizedFunction>,
    w_t: Option<FactorizedFunction>,
}

impl fmt::Debug for OdeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OdeFunction")
            .field("f", &self.f.generated)
            .field("jac", &self.jac.is_some())
            .field("sparse", &self.jac_pattern.is_some())
            .field("tgrad", &self.tgrad.is_some())
            .field("wfact", &self.w.is_some())
            .finish()
    }
}

impl OdeFunction {
    /// Compiles the bundle selected by `options`.
    ///
    /// Arguments are bound as `[states, parameters, t]`; the factorized
    /// operators take `[states, parameters, γ, t]`.
    ///
    /// # Errors
    /// Whatever the derivative calculators or the code generator report,
    /// `InvalidSystem` when the system has no independent variable and
    /// `ShapeMismatch` when states and equations differ in number.
    pub fn build(
        system: &EquationSystem,
        cache: &DerivativeCache,
        options: OdeFunctionOptions,
    ) -> Result<Self, SymbolicError> {
        let iv = system.require_independent()?;
        if system.states().len() != system.equations().len() {
            return Err(SymbolicError::ShapeMismatch(format!(
                "`{}` has {} states but {} equations",
                system.name(),
                system.states().len(),
                system.equations().len()
            )));
        }
        let registry = cache.registry();
        let renderer = options.renderer.as_ref();
        let groups = [
            ArgumentGroup::symbols("u", system.states()),
            ArgumentGroup::symbols("p", system.parameters()),
            ArgumentGroup::scalar("t", iv),
        ];
        let compile_target = |target: CodegenTarget, groups: &[ArgumentGroup]| {
            compile(&target, groups, renderer, registry, options.jit).map(Arc::new)
        };

        let f = SolverFunction {
            generated: compile_target(CodegenTarget::Vector(system.full_rhss()?), &groups)?,
        };

        let (jac, jac_pattern) = match (options.jac, options.sparse) {
            (false, _) => (None, None),
            (true, false) => {
                let jac = cache.jacobian(system)?;
                let generated = compile_target(CodegenTarget::Matrix((*jac).clone()), &groups)?;
                (Some(SolverFunction { generated }), None)
            }
            (true, true) => {
                let jac = cache.sparse_jacobian(system)?;
                let pattern = jac.pattern();
                let generated = compile_target(CodegenTarget::Sparse((*jac).clone()), &groups)?;
                (Some(SolverFunction { generated }), Some(pattern))
            }
        };

        let tgrad = if options.tgrad {
            let grad = cache.time_gradient(system)?;
            let generated = compile_target(CodegenTarget::Vector((*grad).clone()), &groups)?;
            Some(SolverFunction { generated })
        } else {
            None
        };

        let mass = cache.mass_matrix(system)?;
        let mass_values = mass
            .entries()
            .iter()
            .map(|entry| entry.evaluate_with(registry, &|_| None))
            .collect::<Result<Vec<f64>, _>>()?;
        let mass_matrix = Output::Matrix {
            rows: mass.rows(),
            cols: mass.cols(),
            data: mass_values,
        };

        let (w, w_t) = if options.wfact {
            let scaled = [
                groups[0].clone(),
                groups[1].clone(),
                ArgumentGroup::scalar("gamma", gamma()),
                groups[2].clone(),
            ];
            let mut factorized = [None, None];
            for (slot, transformed) in factorized.iter_mut().zip([false, true]) {
                let lu = cache.factorized(system, transformed)?;
                let generated = compile_target(CodegenTarget::Matrix(lu.packed()), &scaled)?;
                *slot = Some(FactorizedFunction { generated });
            }
            let [w, w_t] = factorized;
            (w, w_t)
        } else {
            (None, None)
        };

        debug!(
            "built ode function for system `{}` {} (jac: {}, tgrad: {}, wfact: {})",
            system.name(),
            system.id(),
            jac.is_some(),
            tgrad.is_some(),
            w.is_some()
        );

        Ok(Self {
            f,
            jac,
            jac_pattern,
            tgrad,
            mass_matrix,
            w,
            w_t,
        })
    }

    /// `f(u, p, t)`, allocating the derivative.
    pub fn rhs(&self, u: &[f64], p: &[f64], t: f64) -> Result<Vec<f64>, SymbolicError> {
        Ok(self.f.call(u, p, t)?.into_vec())
    }

    /// `f(du, u, p, t)`, writing the derivative into `du`.
    pub fn rhs_into(&self, du: &mut [f64], u: &[f64], p: &[f64], t: f64) -> Result<(), SymbolicError> {
        self.f.call_into(du, u, p, t)
    }

    pub fn f(&self) -> &SolverFunction {
        &self.f
    }

    /// Dense Jacobian, or its nonzeros in [`OdeFunction::jac_pattern`] order.
    pub fn jac(&self) -> Option<&SolverFunction> {
        self.jac.as_ref()
    }

    /// Sparsity pattern of a sparse Jacobian.
    pub fn jac_pattern(&self) -> Option<&SparsityPattern> {
        self.jac_pattern.as_ref()
    }

    pub fn tgrad(&self) -> Option<&SolverFunction> {
        self.tgrad.as_ref()
    }

    /// Numeric mass matrix, row-major.
    pub fn mass_matrix(&self) -> &Output {
        &self.mass_matrix
    }

    /// Packed LU factors of `M - γJ`.
    pub fn wfact(&self) -> Option<&FactorizedFunction> {
        self.w.as_ref()
    }

    /// Packed LU factors of `M/γ - J`.
    pub fn wfact_t(&self) -> Option<&FactorizedFunction> {
        self.w_t.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PlainIdentifier;
    use crate::equation::Equation;
    use crate::expr::{Expr, Symbol};
    use approx::assert_relative_eq;
    use nalgebra::U2;
    use ode_solvers::dopri5::*;
    use ode_solvers::*;

    type State = OVector<f64, U2>;

    fn pendulum() -> EquationSystem {
        let t = Symbol::independent("t");
        let [theta, omega] = ["θ", "ω"].map(Symbol::state);
        let g = Symbol::parameter("g");
        EquationSystem::builder("pendulum")
            .independent(&t)
            .states(&[theta.clone(), omega.clone()])
            .parameters(&[g.clone()])
            .equation(Equation::ode(&theta, &t, omega.to_expr()))
            .equation(Equation::ode(
                &omega,
                &t,
                Expr::neg(Expr::mul(vec![g.to_expr(), Expr::sin(theta.to_expr())])),
            ))
            .build()
            .unwrap()
    }

    fn all_companions() -> OdeFunctionOptions {
        OdeFunctionOptions {
            jac: true,
            tgrad: true,
            wfact: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_rhs_variants_agree() -> Result<(), Box<dyn std::error::Error>> {
        let system = pendulum();
        let cache = DerivativeCache::new();
        let ode = OdeFunction::build(&system, &cache, OdeFunctionOptions::default())?;
        assert!(ode.jac().is_none() && ode.tgrad().is_none() && ode.wfact().is_none());

        let u = [0.3, -0.1];
        let p = [9.81];
        let allocated = ode.rhs(&u, &p, 0.0)?;
        let mut du = [0.0; 2];
        ode.rhs_into(&mut du, &u, &p, 0.0)?;
        assert_eq!(allocated, du.to_vec());
        assert_relative_eq!(du[1], -9.81 * 0.3f64.sin());
        assert_eq!(ode.mass_matrix().as_slice(), &[1.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_jacobian_matches_finite_differences() -> Result<(), Box<dyn std::error::Error>> {
        let system = pendulum();
        let cache = DerivativeCache::new();
        let ode = OdeFunction::build(&system, &cache, all_companions())?;
        let jac = ode.jac().ok_or("no jacobian")?;

        let u = [0.7, 0.2];
        let p = [9.81];
        let analytic = jac.call(&u, &p, 0.0)?;
        let h = 1e-6;
        for col in 0..2 {
            let mut plus = u;
            let mut minus = u;
            plus[col] += h;
            minus[col] -= h;
            let fp = ode.rhs(&plus, &p, 0.0)?;
            let fm = ode.rhs(&minus, &p, 0.0)?;
            for row in 0..2 {
                let fd = (fp[row] - fm[row]) / (2.0 * h);
                let value = analytic.get(row, col).ok_or("missing entry")?;
                assert_relative_eq!(value, fd, epsilon = 1e-6);
            }
        }

        let tgrad = ode.tgrad().ok_or("no time gradient")?;
        assert_eq!(tgrad.call(&u, &p, 0.0)?.into_vec(), vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_factorized_operator_reconstructs() -> Result<(), Box<dyn std::error::Error>> {
        let system = pendulum();
        let cache = DerivativeCache::new();
        let ode = OdeFunction::build(&system, &cache, all_companions())?;
        let u = [0.4, 0.0];
        let p = [9.81];
        let gamma = 0.05;

        let jac = ode.jac().ok_or("no jacobian")?.call(&u, &p, 0.0)?;
        let packed = ode.wfact().ok_or("no W")?.call(&u, &p, gamma, 0.0)?;
        let packed = packed.as_slice();
        // L = [[1, 0], [l, 1]], U = [[u00, u01], [0, u11]]
        let (u00, u01, l10, u11) = (packed[0], packed[1], packed[2], packed[3]);
        let w = [u00, u01, l10 * u00, l10 * u01 + u11];
        let mass = [1.0, 0.0, 0.0, 1.0];
        for (k, value) in w.iter().enumerate() {
            assert_relative_eq!(*value, mass[k] - gamma * jac.as_slice()[k], epsilon = 1e-12);
        }

        let packed_t = ode.wfact_t().ok_or("no W_t")?.call(&u, &p, gamma, 0.0)?;
        assert_relative_eq!(packed_t.as_slice()[0], 1.0 / gamma - jac.as_slice()[0]);
        Ok(())
    }

    #[test]
    fn test_sparse_jacobian_and_dae_mass_matrix() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let [x1, x2] = ["x1", "x2"].map(Symbol::state);
        // D(x1) ~ -x1, 0 ~ x1 - x2
        let system = EquationSystem::builder("dae")
            .independent(&t)
            .states(&[x1.clone(), x2.clone()])
            .equation(Equation::ode(&x1, &t, Expr::neg(x1.to_expr())))
            .equation(Equation::algebraic(Expr::sub(x1.to_expr(), x2.to_expr())))
            .build()?;
        let cache = DerivativeCache::new();
        let options = OdeFunctionOptions {
            jac: true,
            sparse: true,
            renderer: Arc::new(PlainIdentifier),
            ..Default::default()
        };
        let ode = OdeFunction::build(&system, &cache, options)?;

        assert_eq!(ode.mass_matrix().as_slice(), &[1.0, 0.0, 0.0, 0.0]);
        let pattern = ode.jac_pattern().ok_or("no pattern")?;
        assert_eq!(pattern.nnz(), 3);
        let values = ode.jac().ok_or("no jacobian")?.call(&[2.0, 5.0], &[], 0.0)?;
        assert_eq!(values, Output::Vector(vec![-1.0, 1.0, -1.0]));
        Ok(())
    }

    #[test]
    fn test_explicit_time_dependence() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let x = Symbol::state("x");
        let w = Symbol::parameter("w");
        // D(x) ~ sin(w * t) - x
        let system = EquationSystem::builder("forced")
            .independent(&t)
            .states(&[x.clone()])
            .parameters(&[w.clone()])
            .equation(Equation::ode(
                &x,
                &t,
                Expr::sub(
                    Expr::sin(Expr::mul(vec![w.to_expr(), t.to_expr()])),
                    x.to_expr(),
                ),
            ))
            .build()?;
        let cache = DerivativeCache::new();
        let ode = OdeFunction::build(&system, &cache, all_companions())?;
        let tgrad = ode.tgrad().ok_or("no time gradient")?;
        let value = tgrad.call(&[1.0], &[2.0], 0.5)?.into_vec()[0];
        assert_relative_eq!(value, 2.0 * 1.0f64.cos(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_underdetermined_system_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let [x, y] = ["x", "y"].map(Symbol::state);
        let system = EquationSystem::builder("underdetermined")
            .independent(&t)
            .states(&[x.clone(), y])
            .equation(Equation::ode(&x, &t, Expr::neg(x.to_expr())))
            .build()?;
        let cache = DerivativeCache::new();
        assert!(matches!(
            OdeFunction::build(&system, &cache, OdeFunctionOptions::default()),
            Err(SymbolicError::ShapeMismatch(_))
        ));
        Ok(())
    }

    struct Decay {
        ode: OdeFunction,
        p: [f64; 1],
    }

    impl System<f64, State> for Decay {
        fn system(&self, t: f64, y: &State, dy: &mut State) {
            let u = [y[0], y[1]];
            if self.ode.rhs_into(dy.as_mut_slice(), &u, &self.p, t).is_err() {
                dy.fill(f64::NAN);
            }
        }
    }

    #[test]
    fn test_integrates_with_ode_solvers() -> Result<(), Box<dyn std::error::Error>> {
        let t = Symbol::independent("t");
        let [x, y] = ["x", "y"].map(Symbol::state);
        let k = Symbol::parameter("k");
        // x decays into y
        let flux = Expr::mul(vec![k.to_expr(), x.to_expr()]);
        let system = EquationSystem::builder("decay")
            .independent(&t)
            .states(&[x.clone(), y.clone()])
            .parameters(&[k])
            .equation(Equation::ode(&x, &t, Expr::neg(flux.clone())))
            .equation(Equation::ode(&y, &t, flux))
            .build()?;
        let cache = DerivativeCache::new();
        let ode = OdeFunction::build(&system, &cache, OdeFunctionOptions::default())?;

        let mut stepper = Dopri5::new(
            Decay { ode, p: [0.5] },
            0.0,
            2.0,
            0.1,
            State::new(1.0, 0.0),
            1.0e-10,
            1.0e-10,
        );
        stepper
            .integrate()
            .map_err(|err| format!("{err:?}"))?;
        // the output grid accumulates rounding, so read back the last time
        let t_last = *stepper.x_out().last().ok_or("no output")?;
        let last = stepper.y_out().last().ok_or("no output")?;
        assert!(t_last > 1.8);
        assert_relative_eq!(last[0], (-0.5 * t_last).exp(), epsilon = 1e-7);
        assert_relative_eq!(last[0] + last[1], 1.0, epsilon = 1e-9);
        Ok(())
    }
}
