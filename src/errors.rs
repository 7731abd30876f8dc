//! Error types for the symsys crate.
//!
//! Three layers mirror the three ways a request can fail:
//!
//! - `ConvertError`: building an expression from text failed
//! - `BuilderError`: Cranelift could not compile a generated function
//! - `SymbolicError`: the public error of every symbolic operation; it wraps
//!   the two lower layers through `#[from]`
//!
//! Every failure is fatal and deterministic. All operations are pure, so
//! retrying with unchanged input reproduces the same error.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use thiserror::Error;

/// Errors that can occur while turning text into an expression tree.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// evalexpr rejected the input
    #[error("could not parse expression: {0}")]
    Parse(String),
    /// The parsed tree uses an operator the core has no node for
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// The parsed tree calls a function that is neither builtin nor registered
    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),
    /// A constant that is not numeric
    #[error("expected numeric constant: {0}")]
    ConstOperator(String),
    /// An identifier that is not part of the scope
    #[error("symbol not found in scope: {0}")]
    SymbolNotFound(String),
    /// `D(..)` applied to something other than a symbol, or without an independent variable
    #[error("invalid differential: {0}")]
    InvalidDifferential(String),
    /// Equation text without exactly one `~`
    #[error("expected `lhs ~ rhs`, got: {0}")]
    MalformedEquation(String),
}

/// Errors raised by the Cranelift backend.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// A Cranelift flag could not be set
    #[error("invalid compiler setting: {0}")]
    Setting(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
}

/// Errors of the symbolic core.
#[derive(Debug, Error)]
pub enum SymbolicError {
    /// The rule table has no derivative for this operator
    #[error("no derivative rule registered for operator `{0}`")]
    UnregisteredDerivative(String),
    /// Derivative expansion did not reach a fixpoint within its iteration budget
    #[error("derivative expansion did not terminate after {iterations} passes: {expr}")]
    NonTerminating { iterations: usize, expr: String },
    /// Hessian sparsity reached an operator without a linearity class
    #[error("no linearity class registered for operator `{0}`")]
    UnknownLinearity(String),
    /// A left-hand side that is neither `0` nor the derivative of one state
    #[error("mass matrix requires a semi-explicit system, equation {equation} has lhs `{lhs}`")]
    UnsupportedMassMatrix { equation: usize, lhs: String },
    /// Symbolic LU hit a structurally zero pivot
    #[error("symbolic factorization hit a zero pivot at position {pivot}")]
    SingularSymbolicFactorization { pivot: usize },
    /// Argument or output layout inconsistent with the declared variables
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// A leaf that no argument group (or evaluation environment) binds
    #[error("unbound symbol: {0}")]
    UnboundSymbol(String),
    /// Two different declarations share one symbol
    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),
    /// A system that violates the builder's role checks
    #[error("invalid system: {0}")]
    InvalidSystem(String),
    /// Error when building an expression from text
    #[error("failed to build expression from text")]
    Convert(#[from] ConvertError),
    /// Error when JIT compiling a generated function
    #[error("failed to build JIT function")]
    Builder(#[from] BuilderError),
}

impl SymbolicError {
    /// Shorthand for a [`SymbolicError::ShapeMismatch`] on length checks.
    pub(crate) fn length(what: &str, expected: usize, got: usize) -> Self {
        SymbolicError::ShapeMismatch(format!("{what}: expected length {expected}, got {got}"))
    }
}
