//! Conversion from evalexpr operator trees into expression trees.
//!
//! Text is parsed by evalexpr and the resulting tree is mapped node by node
//! onto [`Expr`]. Identifiers resolve against a [`Scope`]; function calls
//! resolve to the builtin elementary operators, to `D(..)` for derivatives
//! with respect to the scope's independent variable, or to user functions
//! known to the scope's registry.
//!
//! Equations are written `lhs ~ rhs`.

use std::collections::HashMap;

use evalexpr::{build_operator_tree, DefaultNumericTypes, Node, Operator as EvalOperator, Value};

use crate::equation::Equation;
use crate::errors::ConvertError;
use crate::expr::{Expr, Operator, Symbol};
use crate::registry::RuleRegistry;
use crate::system::EquationSystem;

/// Name of the derivative function in text.
pub const DIFFERENTIAL: &str = "D";

/// The symbols and functions identifiers in text may refer to.
#[derive(Debug, Clone)]
pub struct Scope<'a> {
    iv: Option<Symbol>,
    symbols: HashMap<String, Symbol>,
    registry: &'a RuleRegistry,
}

impl Default for Scope<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Scope<'a> {
    /// An empty scope over the standard registry.
    pub fn new() -> Self {
        Self {
            iv: None,
            symbols: HashMap::new(),
            registry: RuleRegistry::standard(),
        }
    }

    /// Every symbol `system` declares, including observed symbols.
    pub fn for_system(system: &EquationSystem) -> Self {
        let mut scope = Self::new();
        if let Some(iv) = system.independent() {
            scope = scope.independent(iv);
        }
        scope
            .symbols(system.states())
            .symbols(system.parameters())
            .symbols(&system.observed().iter().map(|(symbol, _)| symbol.clone()).collect::<Vec<_>>())
    }

    /// Sets the variable `D(..)` differentiates against; it is also in scope
    /// as a plain symbol.
    pub fn independent(mut self, iv: &Symbol) -> Self {
        self.symbols.insert(iv.name().to_string(), iv.clone());
        self.iv = Some(iv.clone());
        self
    }

    pub fn symbols(mut self, symbols: &[Symbol]) -> Self {
        for symbol in symbols {
            self.symbols.insert(symbol.name().to_string(), symbol.clone());
        }
        self
    }

    /// Resolves user functions through `registry` instead of the standard one.
    pub fn registry(mut self, registry: &'a RuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }
}

/// Parses `text` into an expression.
///
/// # Errors
/// `Parse` when evalexpr rejects the text, otherwise whatever
/// [`build_expr`] reports.
pub fn parse_expr(text: &str, scope: &Scope) -> Result<Expr, ConvertError> {
    let node = build_operator_tree::<DefaultNumericTypes>(text)
        .map_err(|err| ConvertError::Parse(format!("{text}: {err}")))?;
    build_expr(&node, scope)
}

/// Parses `lhs ~ rhs` into an equation.
pub fn parse_equation(text: &str, scope: &Scope) -> Result<Equation, ConvertError> {
    let mut sides = text.split('~');
    match (sides.next(), sides.next(), sides.next()) {
        (Some(lhs), Some(rhs), None) => Ok(Equation::new(
            parse_expr(lhs, scope)?,
            parse_expr(rhs, scope)?,
        )),
        _ => Err(ConvertError::MalformedEquation(text.to_string())),
    }
}

/// Parses every line of `text` that is not blank into an equation.
pub fn parse_equations(text: &str, scope: &Scope) -> Result<Vec<Equation>, ConvertError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| parse_equation(line, scope))
        .collect()
}

/// Converts an evalexpr node into an expression.
///
/// Supported:
/// * `+`, `-`, `*`, `/`, unary `-` and `^` with any exponent
/// * integer and float constants
/// * identifiers of the scope
/// * `abs`, `sqrt`, `exp`, `ln` (alias `log`) and the trigonometric and
///   hyperbolic functions with their inverses `asin`, `acos`, `atan`
/// * `D(x)` and nested `D(D(x))`
/// * registered user functions, `f(a, b)`
pub fn build_expr(node: &Node, scope: &Scope) -> Result<Expr, ConvertError> {
    let children = node.children();
    match node.operator() {
        EvalOperator::RootNode => match children {
            [child] => build_expr(child, scope),
            _ => Err(ConvertError::Parse(format!(
                "expected a single expression, got {} parts",
                children.len()
            ))),
        },
        EvalOperator::Add => Ok(Expr::add(flatten(children, scope, &Operator::Add)?)),
        EvalOperator::Mul => Ok(Expr::mul(flatten(children, scope, &Operator::Mul)?)),
        EvalOperator::Sub => {
            let [lhs, rhs] = binary(children, "-")?;
            Ok(Expr::sub(build_expr(lhs, scope)?, build_expr(rhs, scope)?))
        }
        EvalOperator::Div => {
            let [lhs, rhs] = binary(children, "/")?;
            Ok(Expr::div(build_expr(lhs, scope)?, build_expr(rhs, scope)?))
        }
        EvalOperator::Exp => {
            let [base, exponent] = binary(children, "^")?;
            Ok(Expr::pow(build_expr(base, scope)?, build_expr(exponent, scope)?))
        }
        EvalOperator::Neg => match children {
            [child] => match build_expr(child, scope)? {
                Expr::Const(value) => Ok(Expr::Const(-value)),
                inner => Ok(Expr::neg(inner)),
            },
            _ => Err(ConvertError::UnsupportedOperator(format!(
                "negation of {} operands",
                children.len()
            ))),
        },
        EvalOperator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Const(*f)),
            Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        EvalOperator::VariableIdentifierRead { identifier } => scope
            .lookup(identifier)
            .map(Symbol::to_expr)
            .ok_or_else(|| ConvertError::SymbolNotFound(identifier.to_string())),
        EvalOperator::FunctionIdentifier { identifier } => {
            let args = arguments(children)
                .iter()
                .map(|arg| build_expr(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            build_call(identifier, args, scope)
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn build_call(name: &str, mut args: Vec<Expr>, scope: &Scope) -> Result<Expr, ConvertError> {
    if name == DIFFERENTIAL {
        return differential(args, scope);
    }
    let elementary = match name {
        "log" => Some(Operator::Ln),
        _ => Operator::ELEMENTARY.into_iter().find(|op| op.name() == name),
    };
    if let Some(op) = elementary {
        return match args.pop() {
            Some(arg) if args.is_empty() => Ok(Expr::unary(op, arg)),
            _ => Err(ConvertError::UnsupportedFunction(format!(
                "{name} takes one argument"
            ))),
        };
    }
    if scope.registry.has_function(name) {
        return Ok(Expr::call(name, args));
    }
    Err(ConvertError::UnsupportedFunction(name.to_string()))
}

fn differential(mut args: Vec<Expr>, scope: &Scope) -> Result<Expr, ConvertError> {
    let iv = scope.iv.as_ref().ok_or_else(|| {
        ConvertError::InvalidDifferential("no independent variable in scope".to_string())
    })?;
    let arg = match args.pop() {
        Some(arg) if args.is_empty() => arg,
        _ => {
            return Err(ConvertError::InvalidDifferential(
                "D takes one argument".to_string(),
            ))
        }
    };
    if let Some((target, wrt, order)) = arg.as_differential() {
        if wrt == iv {
            return Ok(Expr::differential(target, iv, order + 1));
        }
    }
    match arg.as_symbol() {
        Some(target) if target != iv => Ok(Expr::differential(target, iv, 1)),
        _ => Err(ConvertError::InvalidDifferential(arg.to_string())),
    }
}

/// Children of a nested `+` or `*` chain as one operand list.
fn flatten(children: &[Node], scope: &Scope, op: &Operator) -> Result<Vec<Expr>, ConvertError> {
    let mut operands = Vec::with_capacity(children.len());
    for child in children {
        match build_expr(child, scope)? {
            Expr::Op(inner, args) if &inner == op => operands.extend(args.iter().cloned()),
            expr => operands.push(expr),
        }
    }
    Ok(operands)
}

fn binary<'n>(children: &'n [Node], op: &str) -> Result<[&'n Node; 2], ConvertError> {
    match children {
        [lhs, rhs] => Ok([lhs, rhs]),
        _ => Err(ConvertError::UnsupportedOperator(format!(
            "`{op}` with {} operands",
            children.len()
        ))),
    }
}

/// Argument nodes of a call: a parenthesized tuple spreads into its members.
fn arguments(children: &[Node]) -> Vec<&Node> {
    let mut node = match children {
        [child] => child,
        _ => return children.iter().collect(),
    };
    while let (EvalOperator::RootNode, [inner]) = (node.operator(), node.children()) {
        node = inner;
    }
    match node.operator() {
        EvalOperator::Tuple => node.children().iter().collect(),
        _ => vec![node],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionDef, NativeFn};
    use approx::assert_relative_eq;

    fn scope_xy() -> (Scope<'static>, Symbol, Symbol, Symbol) {
        let t = Symbol::independent("t");
        let [x, y] = ["x", "y"].map(Symbol::state);
        let scope = Scope::new().independent(&t).symbols(&[x.clone(), y.clone()]);
        (scope, t, x, y)
    }

    #[test]
    fn test_arithmetic() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, _, x, y) = scope_xy();
        let expr = parse_expr("2*x + y^2", &scope)?;
        assert_eq!(
            expr,
            Expr::add(vec![
                Expr::mul(vec![Expr::Const(2.0), x.to_expr()]),
                Expr::pow(y.to_expr(), Expr::Const(2.0)),
            ])
        );
        let env = HashMap::from([(x, 1.0), (y, 2.0)]);
        assert_eq!(expr.evaluate(&env)?, 6.0);
        Ok(())
    }

    #[test]
    fn test_sums_are_flattened() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, t, x, y) = scope_xy();
        let expr = parse_expr("x + y + t", &scope)?;
        assert_eq!(expr, Expr::add(vec![x.to_expr(), y.to_expr(), t.to_expr()]));
        assert_eq!(parse_expr("-3", &scope)?, Expr::Const(-3.0));
        Ok(())
    }

    #[test]
    fn test_elementary_functions() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, _, x, y) = scope_xy();
        let expr = parse_expr("sin(x) * log(y) + sqrt(abs(x - y)) / exp(x)", &scope)?;
        let env = HashMap::from([(x, 0.5), (y, 2.0)]);
        let expected = 0.5f64.sin() * 2.0f64.ln() + 1.5f64.sqrt() / 0.5f64.exp();
        assert_relative_eq!(expr.evaluate(&env)?, expected, epsilon = 1e-12);
        assert!(matches!(
            parse_expr("sin(x, y)", &scope),
            Err(ConvertError::UnsupportedFunction(_))
        ));
        Ok(())
    }

    #[test]
    fn test_differentials() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, t, x, _) = scope_xy();
        assert_eq!(parse_expr("D(x)", &scope)?, Expr::differential(&x, &t, 1));
        assert_eq!(parse_expr("D(D(x))", &scope)?, Expr::differential(&x, &t, 2));
        assert!(matches!(
            parse_expr("D(x + 1)", &scope),
            Err(ConvertError::InvalidDifferential(_))
        ));
        assert!(matches!(
            parse_expr("D(t)", &scope),
            Err(ConvertError::InvalidDifferential(_))
        ));

        let without_iv = Scope::new().symbols(&[x]);
        assert!(matches!(
            parse_expr("D(x)", &without_iv),
            Err(ConvertError::InvalidDifferential(_))
        ));
        Ok(())
    }

    #[test]
    fn test_user_functions() -> Result<(), Box<dyn std::error::Error>> {
        extern "C" fn hypot(a: f64, b: f64) -> f64 {
            a.hypot(b)
        }
        let mut registry = RuleRegistry::with_standard_rules();
        registry.register_function(FunctionDef::new("hypot").with_native(NativeFn::Binary(hypot)));
        let (scope, _, x, y) = scope_xy();

        assert!(matches!(
            parse_expr("hypot(x, y)", &scope),
            Err(ConvertError::UnsupportedFunction(name)) if name == "hypot"
        ));
        let scope = scope.registry(&registry);
        let expr = parse_expr("hypot(x, y)", &scope)?;
        assert_eq!(expr, Expr::call("hypot", vec![x.to_expr(), y.to_expr()]));
        let value = expr.evaluate_with(&registry, &|leaf| match leaf.as_symbol()?.name() {
            "x" => Some(3.0),
            "y" => Some(4.0),
            _ => None,
        })?;
        assert_eq!(value, 5.0);
        Ok(())
    }

    #[test]
    fn test_equations() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, t, x, y) = scope_xy();
        let equations = parse_equations(
            "D(x) ~ -y
             0 ~ x - y",
            &scope,
        )?;
        assert_eq!(
            equations,
            vec![
                Equation::ode(&x, &t, Expr::neg(y.to_expr())),
                Equation::new(Expr::Const(0.0), Expr::sub(x.to_expr(), y.to_expr())),
            ]
        );
        for malformed in ["x + y", "D(x) ~ y ~ x"] {
            assert!(matches!(
                parse_equation(malformed, &scope),
                Err(ConvertError::MalformedEquation(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_scope_of_system() -> Result<(), Box<dyn std::error::Error>> {
        let (scope, t, x, y) = scope_xy();
        let k = Symbol::parameter("k");
        let system = EquationSystem::builder("decay")
            .independent(&t)
            .states(&[x.clone(), y.clone()])
            .parameters(&[k.clone()])
            .equations(parse_equations("D(x) ~ -x\nD(y) ~ x", &scope)?)
            .build()?;
        let scope = Scope::for_system(&system);
        assert_eq!(scope.lookup("k"), Some(&k));
        assert_eq!(
            parse_expr("k * D(x)", &scope)?,
            Expr::mul(vec![k.to_expr(), Expr::differential(&x, &t, 1)])
        );
        Ok(())
    }

    #[test]
    fn test_errors() {
        let (scope, _, _, _) = scope_xy();
        assert!(matches!(
            parse_expr("x + z", &scope),
            Err(ConvertError::SymbolNotFound(name)) if name == "z"
        ));
        assert!(matches!(
            parse_expr("gamma(x)", &scope),
            Err(ConvertError::UnsupportedFunction(_))
        ));
        assert!(matches!(
            parse_expr("x % 2", &scope),
            Err(ConvertError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            parse_expr("\"text\"", &scope),
            Err(ConvertError::ConstOperator(_))
        ));
        assert!(matches!(
            parse_expr("(x + y", &scope),
            Err(ConvertError::Parse(_))
        ));
    }
}
