//! Per-system, write-once storage of derivative matrices.
//!
//! Systems are immutable, so a derivative computed once stays valid for the
//! life of the system. [`DerivativeCache`] is owned by the caller and keyed
//! by [`SystemId`]. Each artifact sits in its own `OnceLock` slot: the first
//! caller computes the value outside of any lock and publishes it with
//! `get_or_init`, every later caller reads the published value. When two
//! threads race, both compute and exactly one result is kept; the values are
//! equal because every computation is deterministic.
//!
//! Entries live as long as their system: slots of dropped systems are
//! released on the next access to the cache, or at once through
//! [`DerivativeCache::forget`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use log::debug;

use crate::calculus::{
    factorized_operator, hessian_with, jacobian_with, mass_matrix, sparse_jacobian_with,
    time_gradient_with, CalculusOptions, ExprMatrix, SparseExprMatrix, SymbolicLu,
};
use crate::errors::SymbolicError;
use crate::expr::{Expr, Symbol};
use crate::registry::RuleRegistry;
use crate::system::{EquationSystem, SystemId};

/// Name of the scaling symbol in factorized operators.
pub const GAMMA: &str = "γ";

/// The scaling symbol `γ` of `W = M - γJ`.
pub fn gamma() -> Symbol {
    Symbol::parameter(GAMMA)
}

#[derive(Default)]
struct Slots {
    jacobian: OnceLock<Arc<ExprMatrix>>,
    sparse_jacobian: OnceLock<Arc<SparseExprMatrix>>,
    time_gradient: OnceLock<Arc<Vec<Expr>>>,
    mass_matrix: OnceLock<Arc<ExprMatrix>>,
    factorized: OnceLock<Arc<SymbolicLu>>,
    factorized_transformed: OnceLock<Arc<SymbolicLu>>,
    hessians: Mutex<HashMap<usize, Arc<ExprMatrix>>>,
}

struct Entry {
    system: Weak<()>,
    slots: Arc<Slots>,
}

/// Lazily populated derivative matrices for any number of systems.
pub struct DerivativeCache {
    registry: RuleRegistry,
    options: CalculusOptions,
    systems: Mutex<HashMap<SystemId, Entry>>,
}

impl Default for DerivativeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivativeCache {
    /// A cache computing with the standard rule table.
    pub fn new() -> Self {
        Self::with_registry(RuleRegistry::with_standard_rules(), CalculusOptions::default())
    }

    pub fn with_registry(registry: RuleRegistry, options: CalculusOptions) -> Self {
        Self {
            registry,
            options,
            systems: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Number of live systems the cache holds slots for.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every artifact of system `id`.
    ///
    /// Returns whether the cache held anything for it. Artifacts already
    /// handed out stay valid.
    pub fn forget(&self, id: SystemId) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Releases every artifact of every system.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// The entry map with the slots of dropped systems removed.
    fn entries(&self) -> MutexGuard<'_, HashMap<SystemId, Entry>> {
        // entries are inserted whole, so a poisoned map is still consistent
        let mut systems = self
            .systems
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = systems.len();
        systems.retain(|_, entry| entry.system.strong_count() > 0);
        if systems.len() < before {
            debug!("released slots of {} dropped systems", before - systems.len());
        }
        systems
    }

    fn slots(&self, system: &EquationSystem) -> Arc<Slots> {
        let mut systems = self.entries();
        let entry = systems.entry(system.id()).or_insert_with(|| Entry {
            system: system.liveness(),
            slots: Arc::default(),
        });
        Arc::clone(&entry.slots)
    }

    /// Compute-or-fetch on one slot.
    fn fetch<T>(
        slot: &OnceLock<Arc<T>>,
        artifact: &str,
        system: &EquationSystem,
        compute: impl FnOnce() -> Result<T, SymbolicError>,
    ) -> Result<Arc<T>, SymbolicError> {
        if let Some(value) = slot.get() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(compute()?);
        debug!("cached {artifact} for system `{}` {}", system.name(), system.id());
        Ok(Arc::clone(slot.get_or_init(|| value)))
    }

    /// Jacobian of the right-hand sides with respect to the states.
    pub fn jacobian(&self, system: &EquationSystem) -> Result<Arc<ExprMatrix>, SymbolicError> {
        let slots = self.slots(system);
        Self::fetch(&slots.jacobian, "jacobian", system, || {
            jacobian_with(&system.full_rhss()?, system.states(), &self.registry, self.options)
        })
    }

    /// Sparsity-guided Jacobian of the right-hand sides.
    pub fn sparse_jacobian(
        &self,
        system: &EquationSystem,
    ) -> Result<Arc<SparseExprMatrix>, SymbolicError> {
        let slots = self.slots(system);
        Self::fetch(&slots.sparse_jacobian, "sparse jacobian", system, || {
            sparse_jacobian_with(
                &system.full_rhss()?,
                system.states(),
                &self.registry,
                self.options,
            )
        })
    }

    /// Explicit time derivative of the right-hand sides.
    pub fn time_gradient(&self, system: &EquationSystem) -> Result<Arc<Vec<Expr>>, SymbolicError> {
        let slots = self.slots(system);
        Self::fetch(&slots.time_gradient, "time gradient", system, || {
            let iv = system.require_independent()?;
            time_gradient_with(&system.full_rhss()?, iv, &self.registry)
        })
    }

    pub fn mass_matrix(&self, system: &EquationSystem) -> Result<Arc<ExprMatrix>, SymbolicError> {
        let slots = self.slots(system);
        Self::fetch(&slots.mass_matrix, "mass matrix", system, || {
            mass_matrix(system.equations(), system.states())
        })
    }

    /// LU factors of `M - γJ`, or of `M/γ - J` when `transformed`.
    pub fn factorized(
        &self,
        system: &EquationSystem,
        transformed: bool,
    ) -> Result<Arc<SymbolicLu>, SymbolicError> {
        let slots = self.slots(system);
        let (slot, artifact) = if transformed {
            (&slots.factorized_transformed, "transformed factorized operator")
        } else {
            (&slots.factorized, "factorized operator")
        };
        Self::fetch(slot, artifact, system, || {
            let mass = self.mass_matrix(system)?;
            let jac = self.jacobian(system)?;
            factorized_operator(&mass, &jac, &gamma(), transformed)
        })
    }

    /// Hessian of equation `equation`'s right-hand side with respect to the states.
    pub fn hessian(
        &self,
        system: &EquationSystem,
        equation: usize,
    ) -> Result<Arc<ExprMatrix>, SymbolicError> {
        let slots = self.slots(system);
        let cached = slots
            .hessians
            .lock()
            .ok()
            .and_then(|hessians| hessians.get(&equation).cloned());
        if let Some(hessian) = cached {
            return Ok(hessian);
        }

        let rhss = system.full_rhss()?;
        let rhs = rhss
            .get(equation)
            .ok_or_else(|| SymbolicError::length("equation index", rhss.len(), equation))?;
        let value = Arc::new(hessian_with(rhs, system.states(), &self.registry)?);
        debug!(
            "cached hessian of equation {equation} for system `{}` {}",
            system.name(),
            system.id()
        );
        let mut hessians = slots
            .hessians
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(Arc::clone(hessians.entry(equation).or_insert(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::Equation;
    use std::thread;

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

    #[test]
    fn test_fetch_returns_the_same_artifact() -> Result<(), Box<dyn std::error::Error>> {
        let _ = simplelog::TestLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let system = pendulum();
        let cache = DerivativeCache::new();
        assert!(cache.is_empty());

        let first = cache.jacobian(&system)?;
        let second = cache.jacobian(&system)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let other = pendulum();
        let third = cache.jacobian(&other)?;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(*first, *third);
        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[test]
    fn test_slots_die_with_their_system() -> Result<(), Box<dyn std::error::Error>> {
        let cache = DerivativeCache::new();
        let kept = pendulum();
        cache.jacobian(&kept)?;
        for _ in 0..100 {
            let transient = pendulum();
            cache.jacobian(&transient)?;
        }
        assert_eq!(cache.len(), 1);

        let jac = cache.jacobian(&kept)?;
        assert!(cache.forget(kept.id()));
        assert!(!cache.forget(kept.id()));
        assert!(cache.is_empty());
        assert_eq!(jac.get(0, 1), &Expr::one());

        let refreshed = cache.jacobian(&kept)?;
        assert!(!Arc::ptr_eq(&jac, &refreshed));
        assert_eq!(*jac, *refreshed);
        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_concurrent_population_publishes_one_value() -> Result<(), Box<dyn std::error::Error>> {
        let system = pendulum();
        let cache = DerivativeCache::new();
        let results: Vec<Arc<ExprMatrix>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| cache.jacobian(&system)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker panicked"))
                .collect::<Result<_, _>>()
        })?;
        for result in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], result));
        }
        Ok(())
    }

    #[test]
    fn test_every_artifact() -> Result<(), Box<dyn std::error::Error>> {
        let system = pendulum();
        let cache = DerivativeCache::new();

        let mass = cache.mass_matrix(&system)?;
        assert_eq!(*mass, ExprMatrix::identity(2));

        let grad = cache.time_gradient(&system)?;
        assert!(grad.iter().all(Expr::is_zero));

        let sparse = cache.sparse_jacobian(&system)?;
        assert_eq!(sparse.nnz(), 2);

        let w = cache.factorized(&system, false)?;
        let w_t = cache.factorized(&system, true)?;
        assert_ne!(w, w_t);
        assert!(Arc::ptr_eq(&w, &cache.factorized(&system, false)?));

        let h = cache.hessian(&system, 1)?;
        assert!(Arc::ptr_eq(&h, &cache.hessian(&system, 1)?));
        assert!(!h.get(0, 0).is_zero());
        assert!(matches!(
            cache.hessian(&system, 2),
            Err(SymbolicError::ShapeMismatch(_))
        ));
        Ok(())
    }
}
