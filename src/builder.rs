//! This module compiles symbolic targets into native code with Cranelift.
//!
//! A target (scalar, vector, dense or sparse matrix of expressions) is bound
//! to caller-ordered [`ArgumentGroup`]s and compiled once into a function
//!
//! ```text
//! extern "C" fn(out: *mut f64, groups: *const *const f64)
//! ```
//!
//! that writes every output slot. Both public callables returned by
//! [`build_function`] share that code: the out-of-place one allocates the
//! output, the in-place one writes into the caller's buffer.
//!
//! How a leaf (a symbol or a `Differential` node) turns into a value is
//! decided by a [`LeafRenderer`]. The same renderer drives the Cranelift
//! backend and the Rust-source backend of [`emit_source`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::TargetIsa;
use itertools::Itertools;
use log::debug;

use crate::backends::matrix::Matrix;
use crate::backends::vector::Vector;
use crate::calculus::{ExprMatrix, SparseExprMatrix};
use crate::errors::{BuilderError, SymbolicError};
use crate::expr::{Expr, Operator, Symbol};
use crate::operators::{builtin, call_function, link_function, register_symbols, user_symbol, POW};
use crate::registry::RuleRegistry;
use crate::types::{InPlaceFn, OutOfPlaceFn, Output, OutputShape};

/// Largest number of argument groups a generated function accepts.
pub const MAX_GROUPS: usize = 8;

const FUNCTION_NAME: &str = "symsys_generated";

// byte offsets of loads and stores are i32
const MAX_SLOTS: usize = (i32::MAX / 8) as usize;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// One positional argument of a generated function.
///
/// A vector group binds its leaves to consecutive slots of one slice. A
/// scalar group binds a single leaf, e.g. the independent variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentGroup {
    name: String,
    leaves: Vec<Expr>,
    scalar: bool,
}

impl ArgumentGroup {
    pub fn vector(name: &str, leaves: Vec<Expr>) -> Self {
        Self {
            name: name.to_string(),
            leaves,
            scalar: false,
        }
    }

    /// A vector group of plain symbols.
    pub fn symbols(name: &str, symbols: &[Symbol]) -> Self {
        Self::vector(name, symbols.iter().map(Symbol::to_expr).collect())
    }

    pub fn scalar(name: &str, leaf: impl Into<Expr>) -> Self {
        Self {
            name: name.to_string(),
            leaves: vec![leaf.into()],
            scalar: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn leaves(&self) -> &[Expr] {
        &self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.scalar
    }
}

/// Position of a leaf among the argument groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafBinding {
    pub group: usize,
    pub index: usize,
}

/// What a generated function computes.
#[derive(Debug, Clone, PartialEq)]
pub enum CodegenTarget {
    Scalar(Expr),
    Vector(Vec<Expr>),
    /// Written row-major
    Matrix(ExprMatrix),
    /// Written as the vector of structural nonzeros in pattern order
    Sparse(SparseExprMatrix),
}

impl CodegenTarget {
    pub fn shape(&self) -> OutputShape {
        match self {
            CodegenTarget::Scalar(_) => OutputShape::Scalar,
            CodegenTarget::Vector(exprs) => OutputShape::Vector(exprs.len()),
            CodegenTarget::Matrix(matrix) => OutputShape::Matrix {
                rows: matrix.rows(),
                cols: matrix.cols(),
            },
            CodegenTarget::Sparse(matrix) => OutputShape::Vector(matrix.nnz()),
        }
    }

    /// Output expressions in the order they are written.
    pub fn outputs(&self) -> Vec<&Expr> {
        match self {
            CodegenTarget::Scalar(expr) => vec![expr],
            CodegenTarget::Vector(exprs) => exprs.iter().collect(),
            CodegenTarget::Matrix(matrix) => matrix.entries().iter().collect(),
            CodegenTarget::Sparse(matrix) => matrix.entries().iter().map(|(_, _, e)| e).collect(),
        }
    }
}

impl From<Expr> for CodegenTarget {
    fn from(expr: Expr) -> Self {
        CodegenTarget::Scalar(expr)
    }
}

impl From<Vec<Expr>> for CodegenTarget {
    fn from(exprs: Vec<Expr>) -> Self {
        CodegenTarget::Vector(exprs)
    }
}

impl From<ExprMatrix> for CodegenTarget {
    fn from(matrix: ExprMatrix) -> Self {
        CodegenTarget::Matrix(matrix)
    }
}

impl From<SparseExprMatrix> for CodegenTarget {
    fn from(matrix: SparseExprMatrix) -> Self {
        CodegenTarget::Sparse(matrix)
    }
}

/// Leaf access inside the function being built.
///
/// Handed to a [`LeafRenderer`]; every value it produces lives in the entry
/// block and dominates the rest of the function.
pub struct LeafIr<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    group_ptrs: &'a [Value],
    bound: HashMap<LeafBinding, Value>,
}

impl LeafIr<'_, '_> {
    /// Emits a load of the leaf's slot.
    pub fn load(&mut self, binding: LeafBinding) -> Value {
        let offset = (binding.index * 8) as i32;
        self.builder.ins().load(
            types::F64,
            MemFlags::trusted(),
            self.group_ptrs[binding.group],
            offset,
        )
    }

    /// A value previously stored with [`LeafIr::bind`].
    pub fn bound(&self, binding: LeafBinding) -> Option<Value> {
        self.bound.get(&binding).copied()
    }

    pub fn bind(&mut self, binding: LeafBinding, value: Value) {
        self.bound.insert(binding, value);
    }
}

/// Strategy turning leaves into values, for both backends.
pub trait LeafRenderer: fmt::Debug + Send + Sync {
    /// Runs once before any output is computed, with every leaf the target reads.
    fn prologue_ir(&self, ir: &mut LeafIr<'_, '_>, used: &[LeafBinding]);

    /// Value of a leaf at one use site.
    fn render_ir(&self, ir: &mut LeafIr<'_, '_>, binding: LeafBinding) -> Value;

    /// Statements placed before the output assignments.
    fn prologue_source(&self, groups: &[ArgumentGroup], used: &[LeafBinding]) -> Vec<String>;

    /// Source text of a leaf at one use site.
    fn render_source(&self, groups: &[ArgumentGroup], binding: LeafBinding) -> String;
}

/// Reads the argument container at every use: `u[i]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedAccess;

impl LeafRenderer for IndexedAccess {
    fn prologue_ir(&self, _ir: &mut LeafIr<'_, '_>, _used: &[LeafBinding]) {}

    fn render_ir(&self, ir: &mut LeafIr<'_, '_>, binding: LeafBinding) -> Value {
        ir.load(binding)
    }

    fn prologue_source(&self, _groups: &[ArgumentGroup], _used: &[LeafBinding]) -> Vec<String> {
        Vec::new()
    }

    fn render_source(&self, groups: &[ArgumentGroup], binding: LeafBinding) -> String {
        indexed(groups, binding)
    }
}

/// Binds each used leaf once to a named value: `let x = u[0];`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainIdentifier;

impl LeafRenderer for PlainIdentifier {
    fn prologue_ir(&self, ir: &mut LeafIr<'_, '_>, used: &[LeafBinding]) {
        for binding in used {
            let value = ir.load(*binding);
            ir.bind(*binding, value);
        }
    }

    fn render_ir(&self, ir: &mut LeafIr<'_, '_>, binding: LeafBinding) -> Value {
        match ir.bound(binding) {
            Some(value) => value,
            None => ir.load(binding),
        }
    }

    fn prologue_source(&self, groups: &[ArgumentGroup], used: &[LeafBinding]) -> Vec<String> {
        let names = identifiers(groups);
        used.iter()
            .map(|binding| {
                format!(
                    "let {} = {};",
                    names[binding],
                    indexed(groups, *binding)
                )
            })
            .collect()
    }

    fn render_source(&self, groups: &[ArgumentGroup], binding: LeafBinding) -> String {
        identifiers(groups)
            .remove(&binding)
            .unwrap_or_else(|| indexed(groups, binding))
    }
}

fn indexed(groups: &[ArgumentGroup], binding: LeafBinding) -> String {
    let group = &groups[binding.group];
    if group.is_scalar() {
        group.name().to_string()
    } else {
        format!("{}[{}]", group.name(), binding.index)
    }
}

fn sanitize(text: &str) -> String {
    let mut ident: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

/// Distinct identifiers for every leaf, avoiding the group names.
fn identifiers(groups: &[ArgumentGroup]) -> HashMap<LeafBinding, String> {
    let mut taken: HashSet<String> = groups.iter().map(|g| g.name().to_string()).collect();
    let mut names = HashMap::new();
    for (g, group) in groups.iter().enumerate() {
        for (index, leaf) in group.leaves().iter().enumerate() {
            let mut name = sanitize(&leaf.to_string());
            while taken.contains(&name) {
                name.push('_');
            }
            taken.insert(name.clone());
            names.insert(LeafBinding { group: g, index }, name);
        }
    }
    names
}

/// Cranelift settings of the JIT backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    /// `"none"`, `"speed"` or `"speed_and_size"`
    pub opt_level: &'static str,
    /// Run the IR verifier before compilation
    pub verifier: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            opt_level: "speed",
            verifier: cfg!(debug_assertions),
        }
    }
}

/// A compiled target together with its calling contract.
pub struct GeneratedFunction {
    code: ThreadSafeFunction,
    group_lens: Vec<usize>,
    shape: OutputShape,
    ir: String,
}

impl fmt::Debug for GeneratedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedFunction")
            .field("group_lens", &self.group_lens)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl GeneratedFunction {
    pub fn shape(&self) -> OutputShape {
        self.shape
    }

    /// Expected length of each argument group.
    pub fn group_lens(&self) -> &[usize] {
        &self.group_lens
    }

    /// Cranelift IR of the function before optimization.
    pub fn ir(&self) -> &str {
        &self.ir
    }

    fn check_args(&self, args: &[&[f64]]) -> Result<(), SymbolicError> {
        if args.len() != self.group_lens.len() {
            return Err(SymbolicError::length(
                "argument groups",
                self.group_lens.len(),
                args.len(),
            ));
        }
        for (g, (arg, expected)) in args.iter().zip(&self.group_lens).enumerate() {
            if arg.len() != *expected {
                return Err(SymbolicError::length(
                    &format!("argument group {g}"),
                    *expected,
                    arg.len(),
                ));
            }
        }
        Ok(())
    }

    /// Writes the outputs into `out`.
    ///
    /// # Errors
    /// `ShapeMismatch` when `out` or any argument has the wrong length.
    pub fn call_into(&self, out: &mut [f64], args: &[&[f64]]) -> Result<(), SymbolicError> {
        self.check_args(args)?;
        if out.len() != self.shape.len() {
            return Err(SymbolicError::length("output buffer", self.shape.len(), out.len()));
        }
        let mut ptrs = [std::ptr::null::<f64>(); MAX_GROUPS];
        for (slot, arg) in ptrs.iter_mut().zip(args) {
            *slot = arg.as_ptr();
        }
        // SAFETY: the code was compiled with this signature, reads exactly
        // `group_lens[g]` values behind pointer `g` and writes exactly
        // `shape.len()` values to `out`; both were checked above.
        unsafe {
            let f: extern "C" fn(*mut f64, *const *const f64) = std::mem::transmute(self.code.0);
            f(out.as_mut_ptr(), ptrs.as_ptr());
        }
        Ok(())
    }

    /// Allocates the output and evaluates into it.
    pub fn call(&self, args: &[&[f64]]) -> Result<Output, SymbolicError> {
        let mut data = vec![0.0; self.shape.len()];
        self.call_into(&mut data, args)?;
        Ok(self.shape.wrap(data))
    }

    /// Evaluates into any [`Vector`] backend, in place when it is contiguous.
    pub fn eval_vector_into<V: Vector>(
        &self,
        out: &mut V,
        args: &[&[f64]],
    ) -> Result<(), SymbolicError> {
        if out.len() != self.shape.len() {
            return Err(SymbolicError::length("output vector", self.shape.len(), out.len()));
        }
        match out.as_mut_slice() {
            Some(slice) => self.call_into(slice, args),
            None => {
                let data = self.call(args)?.into_vec();
                out.assign(&data);
                Ok(())
            }
        }
    }

    pub fn eval_vector<V: Vector>(&self, args: &[&[f64]]) -> Result<V, SymbolicError> {
        let mut out = V::zeros(self.shape.len());
        self.eval_vector_into(&mut out, args)?;
        Ok(out)
    }

    /// Evaluates a matrix target into any [`Matrix`] backend.
    ///
    /// # Errors
    /// `ShapeMismatch` when the target is not a dense matrix.
    pub fn eval_matrix<M: Matrix>(&self, args: &[&[f64]]) -> Result<M, SymbolicError> {
        let OutputShape::Matrix { rows, cols } = self.shape else {
            return Err(SymbolicError::ShapeMismatch(format!(
                "expected a matrix target, got {:?}",
                self.shape
            )));
        };
        let data = self.call(args)?.into_vec();
        let mut out = M::zeros(rows, cols);
        out.fill_row_major(&data);
        Ok(out)
    }
}

/// Builds the out-of-place and in-place callables of `target` with the
/// standard registry and default [`JitOptions`].
///
/// # Errors
/// `ShapeMismatch` for more than [`MAX_GROUPS`] groups, a group member that
/// is not a leaf or a leaf bound twice; `UnboundSymbol` for a leaf of the
/// target that no group binds.
pub fn build_function(
    target: &CodegenTarget,
    groups: &[ArgumentGroup],
    renderer: &dyn LeafRenderer,
) -> Result<(OutOfPlaceFn, InPlaceFn), SymbolicError> {
    build_function_with(
        target,
        groups,
        renderer,
        RuleRegistry::standard(),
        JitOptions::default(),
    )
}

/// [`build_function`] with user function natives from `registry`.
pub fn build_function_with(
    target: &CodegenTarget,
    groups: &[ArgumentGroup],
    renderer: &dyn LeafRenderer,
    registry: &RuleRegistry,
    options: JitOptions,
) -> Result<(OutOfPlaceFn, InPlaceFn), SymbolicError> {
    let generated = Arc::new(compile(target, groups, renderer, registry, options)?);
    let shared = Arc::clone(&generated);
    let out_of_place: OutOfPlaceFn = Arc::new(move |args: &[&[f64]]| shared.call(args));
    let in_place: InPlaceFn =
        Arc::new(move |out: &mut [f64], args: &[&[f64]]| generated.call_into(out, args));
    Ok((out_of_place, in_place))
}

/// Compiles `target` into a [`GeneratedFunction`].
pub fn compile(
    target: &CodegenTarget,
    groups: &[ArgumentGroup],
    renderer: &dyn LeafRenderer,
    registry: &RuleRegistry,
    options: JitOptions,
) -> Result<GeneratedFunction, SymbolicError> {
    let bindings = bind_leaves(groups)?;
    let outputs = target.outputs();
    if outputs.len() > MAX_SLOTS {
        return Err(SymbolicError::ShapeMismatch(format!(
            "{} outputs exceed the addressable {MAX_SLOTS}",
            outputs.len()
        )));
    }
    let used = used_leaves(&outputs, &bindings, registry)?;

    let isa = create_isa(options)?;
    if isa.flags().is_pic() {
        return Err(BuilderError::Setting("the JIT cannot load position independent code".into()).into());
    }
    let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    register_symbols(&mut jit_builder, registry);
    let mut module = JITModule::new(jit_builder);
    let mut ctx = module.make_context();

    let pointer_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer_type)); // out
    sig.params.push(AbiParam::new(pointer_type)); // groups
    ctx.func.signature = sig;

    build_body(
        &mut ctx,
        &mut module,
        &outputs,
        groups.len(),
        &bindings,
        &used,
        renderer,
        registry,
    )?;

    let ir = ctx.func.display().to_string();
    let code = compile_and_finalize(&mut module, &mut ctx)?;
    debug!(
        "compiled {:?} target over {} argument groups ({} IR lines)",
        target.shape(),
        groups.len(),
        ir.lines().count()
    );

    Ok(GeneratedFunction {
        code,
        group_lens: groups.iter().map(ArgumentGroup::len).collect(),
        shape: target.shape(),
        ir,
    })
}

/// Slot of every leaf of every group.
fn bind_leaves(groups: &[ArgumentGroup]) -> Result<HashMap<Expr, LeafBinding>, SymbolicError> {
    if groups.len() > MAX_GROUPS {
        return Err(SymbolicError::ShapeMismatch(format!(
            "{} argument groups, at most {MAX_GROUPS} are supported",
            groups.len()
        )));
    }
    let mut bindings = HashMap::new();
    for (g, group) in groups.iter().enumerate() {
        if group.len() > MAX_SLOTS {
            return Err(SymbolicError::ShapeMismatch(format!(
                "argument group `{}` exceeds {MAX_SLOTS} entries",
                group.name()
            )));
        }
        for (index, leaf) in group.leaves().iter().enumerate() {
            if !leaf.is_leaf() {
                return Err(SymbolicError::ShapeMismatch(format!(
                    "`{leaf}` in argument group `{}` is neither a symbol nor a derivative",
                    group.name()
                )));
            }
            let binding = LeafBinding { group: g, index };
            if let Some(previous) = bindings.insert(leaf.clone(), binding) {
                return Err(SymbolicError::ShapeMismatch(format!(
                    "`{leaf}` bound twice, in groups {} and {g}",
                    previous.group
                )));
            }
        }
    }
    Ok(bindings)
}

/// Leaves read by the outputs, in first-use order.
fn used_leaves(
    outputs: &[&Expr],
    bindings: &HashMap<Expr, LeafBinding>,
    registry: &RuleRegistry,
) -> Result<Vec<LeafBinding>, SymbolicError> {
    fn visit(
        expr: &Expr,
        bindings: &HashMap<Expr, LeafBinding>,
        registry: &RuleRegistry,
        seen: &mut HashSet<LeafBinding>,
        used: &mut Vec<LeafBinding>,
    ) -> Result<(), SymbolicError> {
        if expr.is_leaf() {
            let binding = bindings
                .get(expr)
                .copied()
                .ok_or_else(|| SymbolicError::UnboundSymbol(expr.to_string()))?;
            if seen.insert(binding) {
                used.push(binding);
            }
            return Ok(());
        }
        if let Expr::Op(Operator::Function(name), args) = expr {
            let callable = registry
                .native(name)
                .is_some_and(|native| native.arity() == args.len());
            if !callable {
                return Err(SymbolicError::UnboundSymbol(format!(
                    "function {name}/{}",
                    args.len()
                )));
            }
        }
        for arg in expr.args() {
            visit(arg, bindings, registry, seen, used)?;
        }
        Ok(())
    }

    let mut seen = HashSet::new();
    let mut used = Vec::new();
    for output in outputs {
        visit(output, bindings, registry, &mut seen, &mut used)?;
    }
    Ok(used)
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// Detects the host machine and applies the optimization settings of
/// `options`. Code is never position independent, which the JIT requires.
pub(crate) fn create_isa(options: JitOptions) -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );
    let colocated = if is_x86 { "true" } else { "false" };
    let verifier = if options.verifier { "true" } else { "false" };

    for (flag, value) in [
        ("use_colocated_libcalls", colocated),
        ("is_pic", "false"),
        ("opt_level", options.opt_level),
        ("enable_verifier", verifier),
    ] {
        flag_builder
            .set(flag, value)
            .map_err(|e| BuilderError::Setting(format!("{flag}={value}: {e}")))?;
    }

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

#[allow(clippy::too_many_arguments)]
fn build_body(
    ctx: &mut Context,
    module: &mut JITModule,
    outputs: &[&Expr],
    group_count: usize,
    bindings: &HashMap<Expr, LeafBinding>,
    used: &[LeafBinding],
    renderer: &dyn LeafRenderer,
    registry: &RuleRegistry,
) -> Result<(), SymbolicError> {
    let pointer_type = module.target_config().pointer_type();
    let pointer_bytes = pointer_type.bytes() as usize;

    let mut builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let out_ptr = builder.block_params(entry_block)[0];
    let groups_ptr = builder.block_params(entry_block)[1];
    let group_ptrs: Vec<Value> = (0..group_count)
        .map(|g| {
            builder.ins().load(
                pointer_type,
                MemFlags::trusted(),
                groups_ptr,
                (g * pointer_bytes) as i32,
            )
        })
        .collect();

    {
        let mut emitter = Emitter {
            ir: LeafIr {
                builder: &mut builder,
                group_ptrs: &group_ptrs,
                bound: HashMap::new(),
            },
            module,
            bindings,
            renderer,
            registry,
            imports: HashMap::new(),
        };
        renderer.prologue_ir(&mut emitter.ir, used);
        for (slot, expr) in outputs.iter().enumerate() {
            let value = emitter.emit(expr)?;
            emitter
                .ir
                .builder
                .ins()
                .store(MemFlags::trusted(), value, out_ptr, (slot * 8) as i32);
        }
    }

    builder.ins().return_(&[]);
    builder.finalize();
    Ok(())
}

/// Declares, defines and finalizes the function, returning its code pointer.
fn compile_and_finalize(
    module: &mut JITModule,
    ctx: &mut Context,
) -> Result<ThreadSafeFunction, BuilderError> {
    let func_id = module
        .declare_function(FUNCTION_NAME, Linkage::Export, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    // Dropping a JITModule does not release its code memory, so the pointer
    // stays valid for the life of the process.
    Ok(ThreadSafeFunction(module.get_finalized_function(func_id)))
}

/// Tree-walking IR emitter of one function body.
struct Emitter<'a, 'b> {
    ir: LeafIr<'a, 'b>,
    module: &'a mut JITModule,
    bindings: &'a HashMap<Expr, LeafBinding>,
    renderer: &'a dyn LeafRenderer,
    registry: &'a RuleRegistry,
    imports: HashMap<String, FuncId>,
}

impl Emitter<'_, '_> {
    fn emit(&mut self, expr: &Expr) -> Result<Value, SymbolicError> {
        if expr.is_leaf() {
            let binding = self
                .bindings
                .get(expr)
                .copied()
                .ok_or_else(|| SymbolicError::UnboundSymbol(expr.to_string()))?;
            return Ok(self.renderer.render_ir(&mut self.ir, binding));
        }
        match expr {
            Expr::Const(value) => Ok(self.ir.builder.ins().f64const(*value)),
            Expr::Sym(symbol) => Err(SymbolicError::UnboundSymbol(symbol.to_string())),
            Expr::Op(op, args) => self.emit_op(op, args),
        }
    }

    fn emit_all(&mut self, args: &[Expr]) -> Result<Vec<Value>, SymbolicError> {
        args.iter().map(|arg| self.emit(arg)).collect()
    }

    fn emit_arity<const N: usize>(
        &mut self,
        op: &Operator,
        args: &[Expr],
    ) -> Result<[Value; N], SymbolicError> {
        let values = self.emit_all(args)?;
        <[Value; N]>::try_from(values).map_err(|values| {
            SymbolicError::ShapeMismatch(format!(
                "operator `{op}` takes {N} arguments, got {}",
                values.len()
            ))
        })
    }

    fn emit_op(&mut self, op: &Operator, args: &[Expr]) -> Result<Value, SymbolicError> {
        match op {
            Operator::Add | Operator::Mul => {
                let values = self.emit_all(args)?;
                let builder = &mut self.ir.builder;
                let mut values = values.into_iter();
                let Some(first) = values.next() else {
                    let identity = if *op == Operator::Add { 0.0 } else { 1.0 };
                    return Ok(builder.ins().f64const(identity));
                };
                Ok(values.fold(first, |acc, value| {
                    if *op == Operator::Add {
                        builder.ins().fadd(acc, value)
                    } else {
                        builder.ins().fmul(acc, value)
                    }
                }))
            }
            Operator::Sub => {
                let [a, b] = self.emit_arity(op, args)?;
                Ok(self.ir.builder.ins().fsub(a, b))
            }
            Operator::Div => {
                let [a, b] = self.emit_arity(op, args)?;
                Ok(self.ir.builder.ins().fdiv(a, b))
            }
            Operator::Neg => {
                let [a] = self.emit_arity(op, args)?;
                Ok(self.ir.builder.ins().fneg(a))
            }
            Operator::Abs => {
                let [a] = self.emit_arity(op, args)?;
                Ok(self.ir.builder.ins().fabs(a))
            }
            Operator::Sqrt => {
                let [a] = self.emit_arity(op, args)?;
                Ok(self.ir.builder.ins().sqrt(a))
            }
            Operator::Pow => {
                let integer = args
                    .get(1)
                    .and_then(Expr::as_const)
                    .and_then(integer_exponent);
                match (args, integer) {
                    ([base, _], Some(n)) => {
                        let base = self.emit(base)?;
                        Ok(generate_optimized_power(self.ir.builder, base, n))
                    }
                    _ => {
                        let [base, exponent] = self.emit_arity(op, args)?;
                        self.call(POW, &[base, exponent])
                    }
                }
            }
            Operator::Function(name) => {
                let values = self.emit_all(args)?;
                self.call(&user_symbol(name), &values)
            }
            Operator::Differential { .. } => Err(SymbolicError::UnboundSymbol(
                Expr::apply(op.clone(), args.to_vec()).to_string(),
            )),
            other => match builtin(other) {
                Some((symbol, _)) => {
                    let [a] = self.emit_arity(op, args)?;
                    self.call(symbol, &[a])
                }
                None => Err(SymbolicError::ShapeMismatch(format!(
                    "no native code for operator `{other}`"
                ))),
            },
        }
    }

    fn call(&mut self, symbol: &str, args: &[Value]) -> Result<Value, SymbolicError> {
        let func_id = match self.imports.get(symbol) {
            Some(func_id) => *func_id,
            None => {
                let func_id = link_function(self.module, symbol, args.len())?;
                self.imports.insert(symbol.to_string(), func_id);
                func_id
            }
        };
        Ok(call_function(self.ir.builder, self.module, func_id, args))
    }
}

/// Exponents expanded into multiplications.
fn integer_exponent(exponent: f64) -> Option<i64> {
    (exponent.fract() == 0.0 && exponent.abs() <= i32::MAX as f64).then_some(exponent as i64)
}

/// Multiplication chain for `base^exp`; negative exponents end in one division.
fn generate_optimized_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        3 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, base)
        }
        4 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, square)
        }
        n if n < 0 => {
            let positive = generate_optimized_power(builder, base, -n);
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, positive)
        }
        n => {
            // binary exponentiation
            let mut result: Option<Value> = None;
            let mut current = base;
            let mut remaining = n;
            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = Some(match result {
                        Some(acc) => builder.ins().fmul(acc, current),
                        None => current,
                    });
                }
                if remaining > 1 {
                    current = builder.ins().fmul(current, current);
                }
                remaining >>= 1;
            }
            result.unwrap_or(base)
        }
    }
}

/// Renders `target` as a Rust function `name(out, group..)`.
///
/// Vector groups become `&[f64]` parameters and scalar groups `f64`
/// parameters; group names must be valid identifiers.
///
/// # Errors
/// Same binding errors as [`build_function`], and `ShapeMismatch` for a
/// group name that is not an identifier.
pub fn emit_source(
    target: &CodegenTarget,
    groups: &[ArgumentGroup],
    renderer: &dyn LeafRenderer,
    name: &str,
) -> Result<String, SymbolicError> {
    emit_source_with(target, groups, renderer, name, RuleRegistry::standard())
}

pub fn emit_source_with(
    target: &CodegenTarget,
    groups: &[ArgumentGroup],
    renderer: &dyn LeafRenderer,
    name: &str,
    registry: &RuleRegistry,
) -> Result<String, SymbolicError> {
    for ident in std::iter::once(name).chain(groups.iter().map(ArgumentGroup::name)) {
        if sanitize(ident) != ident || ident == "out" {
            return Err(SymbolicError::ShapeMismatch(format!(
                "`{ident}` is not usable as an identifier"
            )));
        }
    }
    let bindings = bind_leaves(groups)?;
    let outputs = target.outputs();
    let used = used_leaves(&outputs, &bindings, registry)?;

    let params = std::iter::once("out: &mut [f64]".to_string())
        .chain(groups.iter().map(|group| {
            let ty = if group.is_scalar() { "f64" } else { "&[f64]" };
            format!("{}: {ty}", group.name())
        }))
        .join(", ");

    let source = SourceEmitter {
        groups,
        bindings: &bindings,
        renderer,
    };
    let mut lines = vec![format!("pub fn {name}({params}) {{")];
    for statement in renderer.prologue_source(groups, &used) {
        lines.push(format!("    {statement}"));
    }
    for (slot, expr) in outputs.iter().enumerate() {
        lines.push(format!("    out[{slot}] = {};", source.render(expr)?));
    }
    lines.push("}".to_string());
    Ok(lines.join("\n"))
}

struct SourceEmitter<'a> {
    groups: &'a [ArgumentGroup],
    bindings: &'a HashMap<Expr, LeafBinding>,
    renderer: &'a dyn LeafRenderer,
}

impl SourceEmitter<'_> {
    fn render(&self, expr: &Expr) -> Result<String, SymbolicError> {
        if expr.is_leaf() {
            let binding = self
                .bindings
                .get(expr)
                .copied()
                .ok_or_else(|| SymbolicError::UnboundSymbol(expr.to_string()))?;
            return Ok(self.renderer.render_source(self.groups, binding));
        }
        let (op, args) = match expr {
            Expr::Const(value) => return Ok(float_literal(*value)),
            Expr::Sym(symbol) => return Err(SymbolicError::UnboundSymbol(symbol.to_string())),
            Expr::Op(op, args) => (op, args),
        };
        let rendered = args
            .iter()
            .map(|arg| self.render(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let text = match (op, rendered.as_slice()) {
            (Operator::Add, []) => float_literal(0.0),
            (Operator::Mul, []) => float_literal(1.0),
            (Operator::Add | Operator::Mul | Operator::Sub | Operator::Div, _) => {
                format!("({})", rendered.join(&format!(" {} ", op.name())))
            }
            (Operator::Neg, [a]) => format!("(-{a})"),
            (Operator::Pow, [base, exponent]) => {
                match args[1].as_const().and_then(integer_exponent) {
                    Some(n) => format!("{base}.powi({n})"),
                    None => format!("{base}.powf({exponent})"),
                }
            }
            (Operator::Function(name), _) => format!("{name}({})", rendered.join(", ")),
            (op, [a]) if builtin(op).is_some() || matches!(op, Operator::Abs | Operator::Sqrt) => {
                format!("{a}.{}()", op.name())
            }
            _ => {
                return Err(SymbolicError::ShapeMismatch(format!(
                    "cannot render `{expr}` as source"
                )))
            }
        };
        Ok(text)
    }
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "f64::NAN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "f64::INFINITY" } else { "f64::NEG_INFINITY" }.to_string()
    } else if value.is_sign_negative() && value != 0.0 {
        format!("({value:?}_f64)")
    } else {
        format!("{:?}_f64", value.abs())
    }
}
