//! Symbolic differentiation and JIT code generation for equation systems.
//!
//! This crate turns systems of differential-algebraic equations into fast native
//! callables. Expressions are immutable trees over symbols; derivatives are taken
//! through an extensible rule table, Jacobians can be assembled only where a
//! structural analysis finds nonzeros, higher-order systems are lowered to first
//! order, and the results are compiled with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! into functions with the calling convention ODE solvers expect. Text input is
//! parsed with [evalexpr](https://github.com/ISibboI/evalexpr).
//!
//! # Features
//!
//! - Symbolic differentiation with per-operator derivative rules
//! - Dense and sparsity-guided Jacobians, Hessians, time gradients, mass matrices
//!   and symbolic LU factors of `M - γJ`
//! - Order lowering of higher-order systems
//! - Cranelift JIT compilation into out-of-place and in-place callables
//! - Optional `ndarray` and `nalgebra` output backends
//!
//! # Example
//!
//! ```rust
//! use symsys::prelude::*;
//!
//! let t = Symbol::independent("t");
//! let [x, y] = ["x", "y"].map(Symbol::state);
//! let [a, b] = ["a", "b"].map(Symbol::parameter);
//! let scope = Scope::new()
//!     .independent(&t)
//!     .symbols(&[x.clone(), y.clone(), a.clone(), b.clone()]);
//!
//! let system = EquationSystem::builder("oscillator")
//!     .independent(&t)
//!     .states(&[x, y])
//!     .parameters(&[a, b])
//!     .equations(parse_equations("D(x) ~ a*y\nD(y) ~ -b*x", &scope).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let cache = DerivativeCache::new();
//! let options = OdeFunctionOptions { jac: true, ..Default::default() };
//! let ode = OdeFunction::build(&system, &cache, options).unwrap();
//!
//! let du = ode.rhs(&[1.0, 2.0], &[3.0, 4.0], 0.0).unwrap();
//! assert_eq!(du, vec![6.0, -4.0]);
//!
//! let jac = ode.jac().unwrap().call(&[1.0, 2.0], &[3.0, 4.0], 0.0).unwrap();
//! assert_eq!(jac.as_slice(), &[0.0, 3.0, -4.0, 0.0]);
//! ```

pub use equation::Equation;
pub use errors::SymbolicError;
pub use expr::{Expr, Symbol};
pub use system::EquationSystem;

pub mod prelude {
    pub use crate::backends::matrix::Matrix;
    pub use crate::backends::vector::Vector;
    pub use crate::builder::{
        build_function, ArgumentGroup, CodegenTarget, IndexedAccess, LeafRenderer,
        PlainIdentifier,
    };
    pub use crate::cache::DerivativeCache;
    pub use crate::calculus::{jacobian, sparse_jacobian};
    pub use crate::convert::{parse_equation, parse_equations, parse_expr, Scope};
    pub use crate::diff::differentiate;
    pub use crate::equation::Equation;
    pub use crate::errors::SymbolicError;
    pub use crate::expr::{Expr, Symbol};
    pub use crate::lowering::lower_order;
    pub use crate::ode::{OdeFunction, OdeFunctionOptions};
    pub use crate::simplify::simplify;
    pub use crate::system::EquationSystem;
}

/// Output containers generated functions can fill
pub mod backends {
    pub mod matrix;
    pub mod vector;
}
/// JIT compilation functionality using Cranelift
pub mod builder;
/// Per-system memoization of derivative matrices
pub mod cache;
/// Jacobians, Hessians, time gradients, mass matrices and symbolic LU
pub mod calculus;
/// Conversion from parsed text to expression trees
pub mod convert;
/// Symbolic differentiation
pub mod diff;
pub mod equation;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation
pub mod expr;
/// Rewriting higher-order systems to first order
pub mod lowering;
/// Generated functions in solver calling convention
pub mod ode;
/// Native math shims linked into generated code
pub(crate) mod operators;
/// Operator rule tables
pub mod registry;
pub mod simplify;
/// Structural sparsity and dependency graphs
pub mod sparsity;
/// Systems of equations
pub mod system;
/// Function and output types of generated code
pub mod types;
