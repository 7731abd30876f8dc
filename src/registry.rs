//! Per-operator rule table.
//!
//! Every operator the differentiation engine and the sparsity analyzer
//! understand is described by an entry in a [`RuleRegistry`]:
//!
//! - a [`DerivativeRule`] giving the partial derivative with respect to each
//!   argument position
//! - a [`LinearityClass`] telling the Hessian sparsity pass how second
//!   derivatives propagate through the operator
//! - for user functions, a [`NativeFn`] used by numeric evaluation and by
//!   the code generator
//!
//! The standard table is built once and shared read-only through
//! [`RuleRegistry::standard`]. Extending it means cloning it with
//! [`RuleRegistry::with_standard_rules`] and registering more entries; the
//! shared table is never mutated.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::expr::{Expr, Operator};

/// Partial derivative for one argument position of an n-ary operator.
pub type PositionalFn = Arc<dyn Fn(&[Expr], usize) -> Expr + Send + Sync>;

/// Partial derivative with respect to one fixed argument.
pub type ArgumentFn = Arc<dyn Fn(&[Expr]) -> Expr + Send + Sync>;

/// Derivative rule of one operator.
#[derive(Clone)]
pub enum DerivativeRule {
    /// One closure serving every argument position
    Positional(PositionalFn),
    /// One closure per argument position
    PerArgument(Vec<ArgumentFn>),
}

impl DerivativeRule {
    /// Rule with one closure for each argument position.
    pub fn per_argument<I>(partials: I) -> Self
    where
        I: IntoIterator<Item = ArgumentFn>,
    {
        DerivativeRule::PerArgument(partials.into_iter().collect())
    }

    /// Rule for a unary operator.
    pub fn unary(partial: impl Fn(&Expr) -> Expr + Send + Sync + 'static) -> Self {
        DerivativeRule::PerArgument(vec![Arc::new(move |args: &[Expr]| partial(&args[0]))])
    }

    /// The partial derivative with respect to argument `position`.
    ///
    /// `None` when the rule does not cover that position, or when a
    /// per-argument rule is applied to a different number of arguments.
    pub fn partial(&self, args: &[Expr], position: usize) -> Option<Expr> {
        if position >= args.len() {
            return None;
        }
        match self {
            DerivativeRule::Positional(rule) => Some(rule(args, position)),
            DerivativeRule::PerArgument(rules) if rules.len() == args.len() => {
                rules.get(position).map(|rule| rule(args))
            }
            DerivativeRule::PerArgument(_) => None,
        }
    }
}

impl fmt::Debug for DerivativeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivativeRule::Positional(_) => write!(f, "Positional"),
            DerivativeRule::PerArgument(rules) => write!(f, "PerArgument({})", rules.len()),
        }
    }
}

/// How an operator propagates second-order interactions between variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearityClass {
    /// Sums, differences and negation: argument interactions pass through unchanged
    Additive,
    /// Products: adds cross interactions between variables of different factors
    Multiplicative,
    /// Quotients: the numerator stays linear, the denominator becomes nonlinear
    Quotient,
    /// Powers: linear for a constant exponent of 0 or 1, nonlinear otherwise
    Power,
    /// Second derivative vanishes almost everywhere, e.g. `abs`
    PiecewiseLinear,
    /// Every pair of argument variables interacts
    Nonlinear,
}

/// A native implementation of a user function.
///
/// The same pointer serves numeric evaluation and generated code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeFn {
    Unary(extern "C" fn(f64) -> f64),
    Binary(extern "C" fn(f64, f64) -> f64),
}

impl NativeFn {
    pub fn arity(&self) -> usize {
        match self {
            NativeFn::Unary(_) => 1,
            NativeFn::Binary(_) => 2,
        }
    }

    /// Calls the function; `None` on an arity mismatch.
    pub fn call(&self, args: &[f64]) -> Option<f64> {
        match (self, args) {
            (NativeFn::Unary(f), [a]) => Some(f(*a)),
            (NativeFn::Binary(f), [a, b]) => Some(f(*a, *b)),
            _ => None,
        }
    }

    /// Address handed to the JIT linker.
    pub fn address(&self) -> *const u8 {
        match self {
            NativeFn::Unary(f) => *f as *const u8,
            NativeFn::Binary(f) => *f as *const u8,
        }
    }
}

/// Everything the core needs to know about one user function.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Arc<str>,
    pub derivative: Option<DerivativeRule>,
    pub linearity: Option<LinearityClass>,
    pub native: Option<NativeFn>,
}

impl FunctionDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            derivative: None,
            linearity: None,
            native: None,
        }
    }

    pub fn with_derivative(mut self, rule: DerivativeRule) -> Self {
        self.derivative = Some(rule);
        self
    }

    pub fn with_linearity(mut self, class: LinearityClass) -> Self {
        self.linearity = Some(class);
        self
    }

    pub fn with_native(mut self, native: NativeFn) -> Self {
        self.native = Some(native);
        self
    }
}

/// Lookup table from operator identity to its rules.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    derivatives: HashMap<Operator, DerivativeRule>,
    linearity: HashMap<Operator, LinearityClass>,
    natives: HashMap<Arc<str>, NativeFn>,
}

static STANDARD: OnceLock<RuleRegistry> = OnceLock::new();

impl RuleRegistry {
    /// A table without any rule.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The shared, immutable table of builtin rules.
    pub fn standard() -> &'static RuleRegistry {
        STANDARD.get_or_init(build_standard)
    }

    /// An owned copy of the builtin table, ready to be extended.
    pub fn with_standard_rules() -> Self {
        Self::standard().clone()
    }

    pub fn register_derivative(&mut self, op: Operator, rule: DerivativeRule) {
        self.derivatives.insert(op, rule);
    }

    pub fn register_linearity(&mut self, op: Operator, class: LinearityClass) {
        self.linearity.insert(op, class);
    }

    /// Registers every rule carried by a user function definition.
    pub fn register_function(&mut self, def: FunctionDef) {
        let op = Operator::Function(def.name.clone());
        if let Some(rule) = def.derivative {
            self.derivatives.insert(op.clone(), rule);
        }
        if let Some(class) = def.linearity {
            self.linearity.insert(op, class);
        }
        if let Some(native) = def.native {
            self.natives.insert(def.name, native);
        }
    }

    pub fn derivative(&self, op: &Operator) -> Option<&DerivativeRule> {
        self.derivatives.get(op)
    }

    pub fn linearity(&self, op: &Operator) -> Option<LinearityClass> {
        self.linearity.get(op).copied()
    }

    pub fn native(&self, name: &str) -> Option<NativeFn> {
        self.natives.get(name).copied()
    }

    /// Every registered native, by function name.
    pub fn natives(&self) -> impl Iterator<Item = (&str, NativeFn)> + '_ {
        self.natives
            .iter()
            .map(|(name, native)| (name.as_ref(), *native))
    }

    /// Whether `name` is known as a user function in any role.
    pub fn has_function(&self, name: &str) -> bool {
        let op = Operator::Function(Arc::from(name));
        self.natives.contains_key(name)
            || self.derivatives.contains_key(&op)
            || self.linearity.contains_key(&op)
    }
}

fn constant(value: f64) -> Expr {
    Expr::Const(value)
}

/// `1 - a^2`
fn one_minus_square(a: &Expr) -> Expr {
    Expr::sub(constant(1.0), Expr::powi(a.clone(), 2))
}

fn build_standard() -> RuleRegistry {
    let mut registry = RuleRegistry::empty();

    registry.register_derivative(
        Operator::Add,
        DerivativeRule::Positional(Arc::new(|_, _| constant(1.0))),
    );
    registry.register_derivative(
        Operator::Sub,
        DerivativeRule::per_argument([
            Arc::new(|_: &[Expr]| constant(1.0)) as ArgumentFn,
            Arc::new(|_: &[Expr]| constant(-1.0)),
        ]),
    );
    // d/dx_i (x_1 * ... * x_n) is the product of every other factor
    registry.register_derivative(
        Operator::Mul,
        DerivativeRule::Positional(Arc::new(|args, position| {
            let others: Vec<Expr> = args
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != position)
                .map(|(_, arg)| arg.clone())
                .collect();
            match others.len() {
                0 => constant(1.0),
                1 => others[0].clone(),
                _ => Expr::mul(others),
            }
        })),
    );
    registry.register_derivative(
        Operator::Div,
        DerivativeRule::per_argument([
            Arc::new(|args: &[Expr]| Expr::div(constant(1.0), args[1].clone())) as ArgumentFn,
            Arc::new(|args: &[Expr]| {
                Expr::neg(Expr::div(
                    args[0].clone(),
                    Expr::powi(args[1].clone(), 2),
                ))
            }),
        ]),
    );
    registry.register_derivative(Operator::Neg, DerivativeRule::unary(|_| constant(-1.0)));
    registry.register_derivative(
        Operator::Pow,
        DerivativeRule::per_argument([
            Arc::new(|args: &[Expr]| {
                let (base, exponent) = (&args[0], &args[1]);
                let lowered = match exponent.as_const() {
                    Some(value) => constant(value - 1.0),
                    None => Expr::sub(exponent.clone(), constant(1.0)),
                };
                Expr::mul(vec![exponent.clone(), Expr::pow(base.clone(), lowered)])
            }) as ArgumentFn,
            Arc::new(|args: &[Expr]| {
                Expr::mul(vec![
                    Expr::pow(args[0].clone(), args[1].clone()),
                    Expr::ln(args[0].clone()),
                ])
            }),
        ]),
    );

    registry.register_derivative(
        Operator::Abs,
        DerivativeRule::unary(|a| Expr::div(a.clone(), Expr::unary(Operator::Abs, a.clone()))),
    );
    registry.register_derivative(
        Operator::Sqrt,
        DerivativeRule::unary(|a| {
            Expr::div(
                constant(1.0),
                Expr::mul(vec![constant(2.0), Expr::sqrt(a.clone())]),
            )
        }),
    );
    registry.register_derivative(Operator::Exp, DerivativeRule::unary(|a| Expr::exp(a.clone())));
    registry.register_derivative(
        Operator::Ln,
        DerivativeRule::unary(|a| Expr::div(constant(1.0), a.clone())),
    );
    registry.register_derivative(Operator::Sin, DerivativeRule::unary(|a| Expr::cos(a.clone())));
    registry.register_derivative(
        Operator::Cos,
        DerivativeRule::unary(|a| Expr::neg(Expr::sin(a.clone()))),
    );
    registry.register_derivative(
        Operator::Tan,
        DerivativeRule::unary(|a| {
            Expr::add(vec![
                constant(1.0),
                Expr::powi(Expr::unary(Operator::Tan, a.clone()), 2),
            ])
        }),
    );
    registry.register_derivative(
        Operator::Asin,
        DerivativeRule::unary(|a| Expr::div(constant(1.0), Expr::sqrt(one_minus_square(a)))),
    );
    registry.register_derivative(
        Operator::Acos,
        DerivativeRule::unary(|a| {
            Expr::neg(Expr::div(constant(1.0), Expr::sqrt(one_minus_square(a))))
        }),
    );
    registry.register_derivative(
        Operator::Atan,
        DerivativeRule::unary(|a| {
            Expr::div(
                constant(1.0),
                Expr::add(vec![constant(1.0), Expr::powi(a.clone(), 2)]),
            )
        }),
    );
    registry.register_derivative(
        Operator::Sinh,
        DerivativeRule::unary(|a| Expr::unary(Operator::Cosh, a.clone())),
    );
    registry.register_derivative(
        Operator::Cosh,
        DerivativeRule::unary(|a| Expr::unary(Operator::Sinh, a.clone())),
    );
    registry.register_derivative(
        Operator::Tanh,
        DerivativeRule::unary(|a| {
            Expr::sub(
                constant(1.0),
                Expr::powi(Expr::unary(Operator::Tanh, a.clone()), 2),
            )
        }),
    );

    for op in [Operator::Add, Operator::Sub, Operator::Neg] {
        registry.register_linearity(op, LinearityClass::Additive);
    }
    registry.register_linearity(Operator::Mul, LinearityClass::Multiplicative);
    registry.register_linearity(Operator::Div, LinearityClass::Quotient);
    registry.register_linearity(Operator::Pow, LinearityClass::Power);
    for op in Operator::ELEMENTARY {
        let class = if op == Operator::Abs {
            LinearityClass::PiecewiseLinear
        } else {
            LinearityClass::Nonlinear
        };
        registry.register_linearity(op, class);
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Symbol;
    use approx::assert_relative_eq;

    extern "C" fn hypot(a: f64, b: f64) -> f64 {
        a.hypot(b)
    }

    #[test]
    fn test_standard_table_covers_builtins() {
        let registry = RuleRegistry::standard();
        let builtins = [
            Operator::Add,
            Operator::Sub,
            Operator::Mul,
            Operator::Div,
            Operator::Neg,
            Operator::Pow,
        ];
        for op in builtins.iter().chain(Operator::ELEMENTARY.iter()) {
            assert!(registry.derivative(op).is_some(), "missing derivative for {op}");
            assert!(registry.linearity(op).is_some(), "missing linearity for {op}");
        }
        assert_eq!(
            registry.linearity(&Operator::Abs),
            Some(LinearityClass::PiecewiseLinear)
        );
    }

    #[test]
    fn test_mul_rule_drops_the_differentiated_factor() {
        let (x, y, z) = (Symbol::state("x"), Symbol::state("y"), Symbol::state("z"));
        let args = [x.to_expr(), y.to_expr(), z.to_expr()];
        let rule = RuleRegistry::standard()
            .derivative(&Operator::Mul)
            .cloned()
            .unwrap();
        assert_eq!(
            rule.partial(&args, 1),
            Some(Expr::mul(vec![x.to_expr(), z.to_expr()]))
        );
        assert_eq!(rule.partial(&args, 3), None);
    }

    #[test]
    fn test_binary_rules_reject_other_arities() {
        let x = Symbol::state("x").to_expr();
        for op in [Operator::Div, Operator::Pow] {
            let rule = RuleRegistry::standard().derivative(&op).cloned().unwrap();
            assert_eq!(rule.partial(std::slice::from_ref(&x), 0), None);
            assert!(rule.partial(&[x.clone(), Expr::Const(2.0)], 1).is_some());
        }
    }

    #[test]
    fn test_register_function_extends_a_copy_only() {
        let mut registry = RuleRegistry::with_standard_rules();
        registry.register_function(
            FunctionDef::new("hypot")
                .with_native(NativeFn::Binary(hypot))
                .with_linearity(LinearityClass::Nonlinear),
        );

        assert!(registry.has_function("hypot"));
        assert!(!RuleRegistry::standard().has_function("hypot"));

        let native = registry.native("hypot").unwrap();
        assert_eq!(native.arity(), 2);
        assert_relative_eq!(native.call(&[3.0, 4.0]).unwrap(), 5.0);
        assert_eq!(native.call(&[3.0]), None);
    }
}
