//! Expression model: symbols, immutable expression trees and the operations
//! every other pass is built on.
//!
//! An expression is one of three node kinds:
//!
//! - `Const`: a numeric constant leaf
//! - `Sym`: a [`Symbol`] leaf carrying a name and a role
//! - `Op`: an [`Operator`] applied to an ordered argument list
//!
//! Children are stored behind an `Arc<[Expr]>`, so cloning a tree is cheap and
//! transformed trees share every untouched subtree with their input. Trees are
//! never mutated; substitution, differentiation and simplification all return
//! new trees.
//!
//! Equality and hashing are purely syntactic. `x + y` and `y + x` are different
//! expressions, and `2 * x` differs from `x * 2`. Constants compare by bit
//! pattern with `-0.0` folded into `0.0`, which keeps `Eq` and `Hash`
//! consistent.
//!
//! There is no operator overloading: trees are built through explicit
//! constructors such as [`Expr::add`] or [`Expr::differential`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use itertools::Itertools;

use crate::errors::SymbolicError;
use crate::registry::RuleRegistry;

/// Role of a symbol inside an equation system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolKind {
    /// The independent variable, usually time
    Independent,
    /// A state; implicitly a function of every independent variable
    State,
    /// A parameter, constant in time
    Parameter,
    /// A named numeric constant
    Constant,
}

/// A named atomic quantity.
///
/// Two symbols are identical when both name and role agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    name: Arc<str>,
    kind: SymbolKind,
}

impl Symbol {
    pub fn new(name: impl Into<Arc<str>>, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn independent(name: &str) -> Self {
        Self::new(name, SymbolKind::Independent)
    }

    pub fn state(name: &str) -> Self {
        Self::new(name, SymbolKind::State)
    }

    pub fn parameter(name: &str) -> Self {
        Self::new(name, SymbolKind::Parameter)
    }

    pub fn constant(name: &str) -> Self {
        Self::new(name, SymbolKind::Constant)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    pub fn is_state(&self) -> bool {
        self.kind == SymbolKind::State
    }

    /// Whether this symbol varies implicitly with `wrt`.
    ///
    /// States depend on every independent variable; nothing else has an
    /// implicit dependency.
    pub fn depends_on(&self, wrt: &Symbol) -> bool {
        self.kind == SymbolKind::State && wrt.kind == SymbolKind::Independent
    }

    pub fn to_expr(&self) -> Expr {
        Expr::Sym(self.clone())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Operator identity of an `Op` node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    /// n-ary sum
    Add,
    /// binary difference
    Sub,
    /// n-ary product
    Mul,
    /// binary quotient
    Div,
    /// unary negation
    Neg,
    /// binary power, `base ^ exponent`
    Pow,
    Abs,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    /// `order`-th derivative with respect to `wrt`; its single argument is a symbol
    Differential { wrt: Symbol, order: u32 },
    /// A user function resolved through a [`RuleRegistry`]
    Function(Arc<str>),
}

impl Operator {
    /// Printable name of the operator.
    pub fn name(&self) -> &str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Neg => "neg",
            Operator::Pow => "^",
            Operator::Abs => "abs",
            Operator::Sqrt => "sqrt",
            Operator::Exp => "exp",
            Operator::Ln => "ln",
            Operator::Sin => "sin",
            Operator::Cos => "cos",
            Operator::Tan => "tan",
            Operator::Asin => "asin",
            Operator::Acos => "acos",
            Operator::Atan => "atan",
            Operator::Sinh => "sinh",
            Operator::Cosh => "cosh",
            Operator::Tanh => "tanh",
            Operator::Differential { .. } => "Differential",
            Operator::Function(name) => name,
        }
    }

    /// Number of arguments the operator takes; `None` when any count is valid.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Operator::Add | Operator::Mul | Operator::Function(_) => None,
            Operator::Sub | Operator::Div | Operator::Pow => Some(2),
            _ => Some(1),
        }
    }

    /// Unary elementary functions, in the order the text front door lists them.
    pub const ELEMENTARY: [Operator; 13] = [
        Operator::Abs,
        Operator::Sqrt,
        Operator::Exp,
        Operator::Ln,
        Operator::Sin,
        Operator::Cos,
        Operator::Tan,
        Operator::Asin,
        Operator::Acos,
        Operator::Atan,
        Operator::Sinh,
        Operator::Cosh,
        Operator::Tanh,
    ];

    /// Numeric semantics of the builtin operators.
    ///
    /// Returns `None` for `Differential` and user functions, whose values
    /// come from the evaluation environment and the registry respectively.
    pub fn apply_numeric(&self, args: &[f64]) -> Option<f64> {
        let unary = || args.first().copied();
        let value = match self {
            Operator::Add => args.iter().sum(),
            Operator::Mul => args.iter().product(),
            Operator::Sub => args.first()? - args.get(1)?,
            Operator::Div => args.first()? / args.get(1)?,
            Operator::Pow => powf(*args.first()?, *args.get(1)?),
            Operator::Neg => -unary()?,
            Operator::Abs => unary()?.abs(),
            Operator::Sqrt => unary()?.sqrt(),
            Operator::Exp => unary()?.exp(),
            Operator::Ln => unary()?.ln(),
            Operator::Sin => unary()?.sin(),
            Operator::Cos => unary()?.cos(),
            Operator::Tan => unary()?.tan(),
            Operator::Asin => unary()?.asin(),
            Operator::Acos => unary()?.acos(),
            Operator::Atan => unary()?.atan(),
            Operator::Sinh => unary()?.sinh(),
            Operator::Cosh => unary()?.cosh(),
            Operator::Tanh => unary()?.tanh(),
            Operator::Differential { .. } | Operator::Function(_) => return None,
        };
        Some(value)
    }
}

/// Power with an integer fast path, matching what generated code computes.
pub(crate) fn powf(base: f64, exponent: f64) -> f64 {
    if exponent.fract() == 0.0 && exponent.abs() <= i32::MAX as f64 {
        base.powi(exponent as i32)
    } else {
        base.powf(exponent)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Differential { wrt, order: 1 } => write!(f, "D_{wrt}"),
            Operator::Differential { wrt, order } => write!(f, "D_{wrt}^{order}"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// An immutable expression tree node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A symbol leaf
    Sym(Symbol),
    /// An operator applied to its ordered arguments
    Op(Operator, Arc<[Expr]>),
}

/// Bit pattern used for constant equality and hashing.
fn const_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Const(a), Expr::Const(b)) => const_bits(*a) == const_bits(*b),
            (Expr::Sym(a), Expr::Sym(b)) => a == b,
            (Expr::Op(op_a, args_a), Expr::Op(op_b, args_b)) => {
                op_a == op_b && (Arc::ptr_eq(args_a, args_b) || args_a == args_b)
            }
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Expr::Const(value) => const_bits(*value).hash(state),
            Expr::Sym(symbol) => symbol.hash(state),
            Expr::Op(op, args) => {
                op.hash(state);
                args.hash(state);
            }
        }
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::Sym(symbol)
    }
}

impl From<&Symbol> for Expr {
    fn from(symbol: &Symbol) -> Self {
        Expr::Sym(symbol.clone())
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl Expr {
    pub fn constant(value: f64) -> Self {
        Expr::Const(value)
    }

    pub fn zero() -> Self {
        Expr::Const(0.0)
    }

    pub fn one() -> Self {
        Expr::Const(1.0)
    }

    pub fn symbol(symbol: &Symbol) -> Self {
        Expr::Sym(symbol.clone())
    }

    /// Applies `op` to `args` without any rewriting.
    pub fn apply(op: Operator, args: Vec<Expr>) -> Self {
        Expr::Op(op, Arc::from(args))
    }

    /// n-ary sum.
    pub fn add(terms: Vec<Expr>) -> Self {
        Self::apply(Operator::Add, terms)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::apply(Operator::Sub, vec![lhs, rhs])
    }

    /// n-ary product.
    pub fn mul(factors: Vec<Expr>) -> Self {
        Self::apply(Operator::Mul, factors)
    }

    pub fn div(numerator: Expr, denominator: Expr) -> Self {
        Self::apply(Operator::Div, vec![numerator, denominator])
    }

    pub fn pow(base: Expr, exponent: Expr) -> Self {
        Self::apply(Operator::Pow, vec![base, exponent])
    }

    pub fn powi(base: Expr, exponent: i32) -> Self {
        Self::pow(base, Expr::Const(exponent as f64))
    }

    pub fn neg(inner: Expr) -> Self {
        Self::apply(Operator::Neg, vec![inner])
    }

    /// Applies a unary operator such as [`Operator::Sin`].
    pub fn unary(op: Operator, arg: Expr) -> Self {
        Self::apply(op, vec![arg])
    }

    pub fn exp(arg: Expr) -> Self {
        Self::unary(Operator::Exp, arg)
    }

    pub fn ln(arg: Expr) -> Self {
        Self::unary(Operator::Ln, arg)
    }

    pub fn sqrt(arg: Expr) -> Self {
        Self::unary(Operator::Sqrt, arg)
    }

    pub fn sin(arg: Expr) -> Self {
        Self::unary(Operator::Sin, arg)
    }

    pub fn cos(arg: Expr) -> Self {
        Self::unary(Operator::Cos, arg)
    }

    /// Applies the user function `name`.
    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Self::apply(Operator::Function(Arc::from(name)), args)
    }

    /// The `order`-th derivative of `target` with respect to `wrt`.
    ///
    /// The target is a symbol by construction; derivatives of composite
    /// trees are computed with [`crate::diff::differentiate`] instead.
    pub fn differential(target: &Symbol, wrt: &Symbol, order: u32) -> Self {
        Self::apply(
            Operator::Differential {
                wrt: wrt.clone(),
                order,
            },
            vec![Expr::Sym(target.clone())],
        )
    }

    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Expr::Sym(symbol) => Some(symbol),
            _ => None,
        }
    }

    /// Decomposes a `Differential` node into `(target, wrt, order)`.
    pub fn as_differential(&self) -> Option<(&Symbol, &Symbol, u32)> {
        match self {
            Expr::Op(Operator::Differential { wrt, order }, args) => match args.first() {
                Some(Expr::Sym(target)) => Some((target, wrt, *order)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_const() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.as_const() == Some(1.0)
    }

    /// Symbols and `Differential` nodes: the nodes a generated function binds to arguments.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Sym(_)) || self.as_differential().is_some()
    }

    pub fn operator(&self) -> Option<&Operator> {
        match self {
            Expr::Op(op, _) => Some(op),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Expr] {
        match self {
            Expr::Op(_, args) => args,
            _ => &[],
        }
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.args().iter().map(Expr::size).sum::<usize>()
    }

    /// Visits every node in pre-order.
    pub fn walk<F: FnMut(&Expr)>(&self, visit: &mut F) {
        visit(self);
        for arg in self.args() {
            arg.walk(visit);
        }
    }

    /// Whether `needle` occurs anywhere in the tree.
    pub fn contains(&self, needle: &Expr) -> bool {
        self == needle || self.args().iter().any(|arg| arg.contains(needle))
    }

    /// Free symbols in order of first appearance.
    ///
    /// A `Differential` contributes its target; the differentiation variable
    /// is data of the operator, not an operand.
    pub fn free_symbols(&self) -> Vec<Symbol> {
        let mut seen = HashSet::new();
        let mut symbols = Vec::new();
        self.walk(&mut |node| {
            if let Expr::Sym(symbol) = node {
                if seen.insert(symbol.clone()) {
                    symbols.push(symbol.clone());
                }
            }
        });
        symbols
    }

    /// Replaces every syntactic occurrence of a key of `rules` by its value.
    ///
    /// Matching is outermost-first and replacements are not scanned again.
    /// Targets of `Differential` nodes are only ever renamed to other
    /// symbols; a composite replacement leaves the node untouched.
    pub fn substitute(&self, rules: &HashMap<Expr, Expr>) -> Expr {
        if rules.is_empty() {
            return self.clone();
        }
        if let Some(replacement) = rules.get(self) {
            return replacement.clone();
        }
        match self {
            Expr::Const(_) | Expr::Sym(_) => self.clone(),
            Expr::Op(op @ Operator::Differential { .. }, args) => match args.first().and_then(|target| rules.get(target)) {
                Some(renamed @ Expr::Sym(_)) => Expr::Op(op.clone(), Arc::from(vec![renamed.clone()])),
                _ => self.clone(),
            },
            Expr::Op(op, args) => {
                let mut changed = false;
                let new_args: Vec<Expr> = args
                    .iter()
                    .map(|arg| {
                        let new_arg = arg.substitute(rules);
                        changed |= new_arg != *arg;
                        new_arg
                    })
                    .collect();
                if changed {
                    Expr::Op(op.clone(), Arc::from(new_args))
                } else {
                    self.clone()
                }
            }
        }
    }

    /// Single-rule form of [`Expr::substitute`].
    pub fn substitute_one(&self, from: &Expr, to: &Expr) -> Expr {
        let rules = HashMap::from([(from.clone(), to.clone())]);
        self.substitute(&rules)
    }

    /// Evaluates the tree with symbol values from `env`.
    ///
    /// # Errors
    /// `UnboundSymbol` for a symbol missing from `env`, a `Differential`
    /// leaf, or a user function the standard registry does not know.
    pub fn evaluate(&self, env: &HashMap<Symbol, f64>) -> Result<f64, SymbolicError> {
        self.evaluate_with(RuleRegistry::standard(), &|leaf| {
            leaf.as_symbol().and_then(|symbol| env.get(symbol).copied())
        })
    }

    /// Evaluates the tree, resolving leaves through `leaf` and user functions
    /// through `registry`.
    pub fn evaluate_with(
        &self,
        registry: &RuleRegistry,
        leaf: &dyn Fn(&Expr) -> Option<f64>,
    ) -> Result<f64, SymbolicError> {
        if self.is_leaf() {
            return leaf(self).ok_or_else(|| SymbolicError::UnboundSymbol(self.to_string()));
        }
        match self {
            Expr::Const(value) => Ok(*value),
            Expr::Sym(symbol) => Err(SymbolicError::UnboundSymbol(symbol.to_string())),
            Expr::Op(op, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate_with(registry, leaf))
                    .collect::<Result<Vec<f64>, _>>()?;
                match op {
                    Operator::Function(name) => registry
                        .native(name)
                        .and_then(|native| native.call(&values))
                        .ok_or_else(|| {
                            SymbolicError::UnboundSymbol(format!("function {name}/{}", values.len()))
                        }),
                    _ => op
                        .apply_numeric(&values)
                        .ok_or_else(|| SymbolicError::UnboundSymbol(self.to_string())),
                }
            }
        }
    }
}

/// Implements string formatting for expressions.
///
/// Binary and n-ary operations are wrapped in parentheses, functions use call
/// notation and derivatives print as `D_t(x)` or `D_t^2(x)`.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Sym(symbol) => write!(f, "{symbol}"),
            Expr::Op(op, args) => match op {
                Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => {
                    let sep = format!(" {} ", op.name());
                    write!(f, "({})", args.iter().join(&sep))
                }
                Operator::Pow => write!(f, "({})", args.iter().join("^")),
                Operator::Neg => match args.as_ref() {
                    [inner @ Expr::Op(
                        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Pow,
                        _,
                    )] => write!(f, "-{inner}"),
                    _ => write!(f, "-({})", args.iter().join(", ")),
                },
                _ => write!(f, "{op}({})", args.iter().join(", ")),
            },
        }
    }
}
