//! Native math linked into generated code.
//!
//! Cranelift has instructions for `abs`, `sqrt` and negation; every other
//! elementary function is an `extern "C"` shim registered with the JIT
//! linker under a `symsys_` prefixed symbol. User functions carrying a
//! [`NativeFn`] are registered the same way under `symsys_user_{name}`.
//!
//! Linking is split in two steps, as for any imported function:
//! - [`link_function`] declares the import once per module
//! - [`call_function`] emits the call inside the function being built

use cranelift::prelude::*;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;
use crate::expr::Operator;
use crate::registry::{NativeFn, RuleRegistry};

extern "C" fn symsys_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn symsys_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn symsys_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn symsys_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn symsys_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn symsys_asin(x: f64) -> f64 {
    x.asin()
}

extern "C" fn symsys_acos(x: f64) -> f64 {
    x.acos()
}

extern "C" fn symsys_atan(x: f64) -> f64 {
    x.atan()
}

extern "C" fn symsys_sinh(x: f64) -> f64 {
    x.sinh()
}

extern "C" fn symsys_cosh(x: f64) -> f64 {
    x.cosh()
}

extern "C" fn symsys_tanh(x: f64) -> f64 {
    x.tanh()
}

extern "C" fn symsys_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// Symbol of the non-integer power shim.
pub(crate) const POW: &str = "symsys_pow";

/// Shim symbol and implementation for an elementary operator that has no
/// Cranelift instruction.
pub(crate) fn builtin(op: &Operator) -> Option<(&'static str, NativeFn)> {
    let shim = match op {
        Operator::Exp => ("symsys_exp", NativeFn::Unary(symsys_exp)),
        Operator::Ln => ("symsys_ln", NativeFn::Unary(symsys_ln)),
        Operator::Sin => ("symsys_sin", NativeFn::Unary(symsys_sin)),
        Operator::Cos => ("symsys_cos", NativeFn::Unary(symsys_cos)),
        Operator::Tan => ("symsys_tan", NativeFn::Unary(symsys_tan)),
        Operator::Asin => ("symsys_asin", NativeFn::Unary(symsys_asin)),
        Operator::Acos => ("symsys_acos", NativeFn::Unary(symsys_acos)),
        Operator::Atan => ("symsys_atan", NativeFn::Unary(symsys_atan)),
        Operator::Sinh => ("symsys_sinh", NativeFn::Unary(symsys_sinh)),
        Operator::Cosh => ("symsys_cosh", NativeFn::Unary(symsys_cosh)),
        Operator::Tanh => ("symsys_tanh", NativeFn::Unary(symsys_tanh)),
        _ => return None,
    };
    Some(shim)
}

/// Linker symbol of a user function.
pub(crate) fn user_symbol(name: &str) -> String {
    format!("symsys_user_{name}")
}

/// Makes every builtin shim and every native of `registry` resolvable by
/// the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder, registry: &RuleRegistry) {
    for op in &Operator::ELEMENTARY {
        if let Some((symbol, native)) = builtin(op) {
            builder.symbol(symbol, native.address());
        }
    }
    builder.symbol(POW, NativeFn::Binary(symsys_pow).address());
    for (name, native) in registry.natives() {
        builder.symbol(user_symbol(name), native.address());
    }
}

/// Declares an imported `fn(f64, ..) -> f64` of the given arity.
///
/// # Errors
/// `DeclarationError` when the module already holds `name` with another signature.
pub(crate) fn link_function(
    module: &mut dyn Module,
    name: &str,
    arity: usize,
) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..arity {
        sig.params.push(AbiParam::new(types::F64));
    }
    sig.returns.push(AbiParam::new(types::F64));

    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

/// Emits a call to a previously linked function and returns its result.
pub(crate) fn call_function(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    args: &[Value],
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, args);
    builder.inst_results(call)[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shims_match_std() {
        let cases = [
            (Operator::Exp, 0.7f64.exp()),
            (Operator::Ln, 0.7f64.ln()),
            (Operator::Sin, 0.7f64.sin()),
            (Operator::Acos, 0.7f64.acos()),
            (Operator::Tanh, 0.7f64.tanh()),
        ];
        for (op, expected) in cases {
            let (symbol, native) = builtin(&op).unwrap();
            assert!(symbol.starts_with("symsys_"));
            assert_eq!(native.call(&[0.7]), Some(expected));
        }
    }

    #[test]
    fn test_instruction_backed_operators_have_no_shim() {
        assert!(builtin(&Operator::Abs).is_none());
        assert!(builtin(&Operator::Sqrt).is_none());
        assert!(builtin(&Operator::Add).is_none());
        let shimmed = Operator::ELEMENTARY
            .iter()
            .filter(|op| builtin(op).is_some())
            .count();
        assert_eq!(shimmed, Operator::ELEMENTARY.len() - 2);
    }
}
