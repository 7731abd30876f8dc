//! # Derivative Benchmarks
//!
//! Measures the symbolic side of the pipeline on a discretized 1D reaction
//! diffusion chain `D(u_i) ~ d * (u_{i-1} - 2 u_i + u_{i+1}) - k * u_i^2`,
//! whose Jacobian is tridiagonal:
//!
//! - **Jacobian**: dense assembly against sparsity-guided assembly
//! - **Compilation**: JIT compilation of the right-hand side and of the
//!   sparse Jacobian
//! - **Evaluation**: one in-place call of each compiled function
//!
//! Run with: `cargo bench --bench derivatives`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use symsys::builder::{build_function, ArgumentGroup, CodegenTarget, IndexedAccess};
use symsys::prelude::*;

/// Reaction diffusion chain with `n` cells and zero-flux ends.
fn chain(n: usize) -> EquationSystem {
    let t = Symbol::independent("t");
    let u: Vec<Symbol> = (0..n).map(|i| Symbol::state(&format!("u_{i}"))).collect();
    let d = Symbol::parameter("d");
    let k = Symbol::parameter("k");

    let equations = (0..n).map(|i| {
        let left = u[i.saturating_sub(1)].to_expr();
        let right = u[(i + 1).min(n - 1)].to_expr();
        let laplacian = Expr::add(vec![
            left,
            Expr::mul(vec![Expr::Const(-2.0), u[i].to_expr()]),
            right,
        ]);
        Equation::ode(
            &u[i],
            &t,
            Expr::sub(
                Expr::mul(vec![d.to_expr(), laplacian]),
                Expr::mul(vec![k.to_expr(), Expr::powi(u[i].to_expr(), 2)]),
            ),
        )
    });

    EquationSystem::builder("reaction diffusion")
        .independent(&t)
        .states(&u)
        .parameters(&[d, k])
        .equations(equations)
        .build()
        .expect("Failed to build the chain")
}

fn benchmark_jacobians(c: &mut Criterion) {
    let mut group = c.benchmark_group("Jacobian");
    for n in [10, 50] {
        let system = chain(n);
        let rhss = system.full_rhss().expect("Failed to collect right-hand sides");

        group.bench_with_input(BenchmarkId::new("Dense", n), &n, |b, _| {
            b.iter(|| jacobian(black_box(&rhss), system.states()))
        });
        group.bench_with_input(BenchmarkId::new("Sparse", n), &n, |b, _| {
            b.iter(|| sparse_jacobian(black_box(&rhss), system.states()))
        });
    }
    group.finish();
}

fn benchmark_compilation(c: &mut Criterion) {
    let system = chain(50);
    let rhss = system.full_rhss().expect("Failed to collect right-hand sides");
    let jac = sparse_jacobian(&rhss, system.states()).expect("Failed to differentiate");
    let groups = [
        ArgumentGroup::symbols("u", system.states()),
        ArgumentGroup::symbols("p", system.parameters()),
    ];

    let mut group = c.benchmark_group("Compilation");
    group.bench_function("Right-hand side", |b| {
        b.iter(|| build_function(&CodegenTarget::Vector(rhss.clone()), &groups, &IndexedAccess))
    });
    group.bench_function("Sparse Jacobian", |b| {
        b.iter(|| build_function(&CodegenTarget::Sparse(jac.clone()), &groups, &IndexedAccess))
    });
    group.finish();
}

fn benchmark_evaluation(c: &mut Criterion) {
    let system = chain(50);
    let cache = DerivativeCache::new();
    let options = OdeFunctionOptions {
        jac: true,
        sparse: true,
        ..Default::default()
    };
    let ode = OdeFunction::build(&system, &cache, options).expect("Failed to compile");
    let jac = ode.jac().expect("Jacobian was requested");
    let u: Vec<f64> = (0..50).map(|i| 1.0 + i as f64 / 50.0).collect();
    let p = [0.1, 0.5];
    let mut du = vec![0.0; 50];
    let mut values = vec![0.0; ode.jac_pattern().map_or(0, |pattern| pattern.nnz())];

    let mut group = c.benchmark_group("Evaluation");
    group.bench_function("Right-hand side", |b| {
        b.iter(|| ode.rhs_into(black_box(&mut du), black_box(&u), &p, 0.0))
    });
    group.bench_function("Sparse Jacobian", |b| {
        b.iter(|| jac.call_into(black_box(&mut values), black_box(&u), &p, 0.0))
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_jacobians,
    benchmark_compilation,
    benchmark_evaluation
);
criterion_main!(benches);
