// registry.rs — Named operations: arity, parameters, shape inference, kernel.
//
// An `Operation` bundles everything the executor needs to know about a
// named GPU operation:
//
//   arity       — how many input and output buffers it takes
//   params      — which scalar parameters it accepts (see params.rs)
//   infer       — a PURE function from input descriptors + parameters to
//                 output descriptors. Runs during validation, before any
//                 device memory is touched.
//   kernel      — the implementation: a reference body that runs on host
//                 memory, and optionally a WGSL program the GPU backend
//                 dispatches directly.
//
// Every kernel must have a reference body. The GPU backend uses the WGSL
// program when one exists and all bound buffers are float32, and otherwise
// stages the buffers through host memory and runs the reference body. The
// reference body is therefore the authoritative semantics of the operation;
// WGSL programs are validated against it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{KernelError, PipelineError, Result};
use crate::params::{ParamSpec, Params};
use crate::tensor::{Shape, TensorData, TensorDesc};

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Read-only view of one kernel input.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub desc: &'a TensorDesc,
    pub data: &'a TensorData,
}

/// One kernel output: its descriptor and zero-initialised storage.
#[derive(Debug)]
pub struct TensorOut<'a> {
    pub desc: &'a TensorDesc,
    pub data: &'a mut TensorData,
}

/// Shape inference: input descriptors + bound parameters → output descriptors.
pub type ShapeFn = dyn Fn(&[TensorDesc], &Params) -> Result<Vec<TensorDesc>> + Send + Sync;

/// Reference kernel body, executed on host-resident tensors.
pub type ReferenceFn = dyn Fn(&[TensorView<'_>], &mut [TensorOut<'_>], &Params) -> std::result::Result<(), KernelError>
    + Send
    + Sync;

/// Packs bound parameters into the 16 float uniform slots a WGSL program
/// reads as `u.values`.
pub type UniformFn = fn(&Params) -> std::result::Result<[f32; 16], KernelError>;

/// A WGSL compute program for float32 buffers.
///
/// Binding convention (group 0): inputs at bindings `0..n` as
/// `array<f32>` storage (read), outputs at `n..n+m` as `array<f32>`
/// storage (read_write), and the `Uniforms` block at binding `n+m`.
/// The grid covers the first output's shape (x, y, planes).
#[derive(Clone)]
pub struct GpuProgram {
    pub label: &'static str,
    pub source: &'static str,
    pub entry_point: &'static str,
    pub uniforms: UniformFn,
}

impl fmt::Debug for GpuProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuProgram")
            .field("label", &self.label)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

/// A kernel implementation.
#[derive(Clone)]
pub struct Kernel {
    reference: Arc<ReferenceFn>,
    program: Option<GpuProgram>,
}

impl Kernel {
    /// Kernel with only a reference body.
    pub fn reference<F>(body: F) -> Self
    where
        F: Fn(&[TensorView<'_>], &mut [TensorOut<'_>], &Params) -> std::result::Result<(), KernelError>
            + Send
            + Sync
            + 'static,
    {
        Kernel { reference: Arc::new(body), program: None }
    }

    /// Attach a WGSL program the GPU backend can dispatch directly.
    pub fn with_program(mut self, program: GpuProgram) -> Self {
        self.program = Some(program);
        self
    }

    pub fn program(&self) -> Option<&GpuProgram> {
        self.program.as_ref()
    }

    /// Run the reference body on decoded inputs, producing fresh outputs.
    pub(crate) fn run_reference(
        &self,
        inputs: &[(TensorDesc, TensorData)],
        output_descs: &[TensorDesc],
        params: &Params,
    ) -> std::result::Result<Vec<TensorData>, KernelError> {
        let views: Vec<TensorView<'_>> = inputs
            .iter()
            .map(|(desc, data)| TensorView { desc, data })
            .collect();
        let mut storage: Vec<TensorData> = output_descs
            .iter()
            .map(|d| TensorData::zeros(d.dtype, d.element_count()))
            .collect();
        {
            let mut outs: Vec<TensorOut<'_>> = output_descs
                .iter()
                .zip(storage.iter_mut())
                .map(|(desc, data)| TensorOut { desc, data })
                .collect();
            (self.reference)(&views, &mut outs, params)?;
        }
        for (desc, data) in output_descs.iter().zip(&storage) {
            if data.dtype() != desc.dtype || data.len() != desc.element_count() {
                return Err(KernelError::new(
                    KernelError::TYPE,
                    format!("kernel replaced output storage with {} × {}", data.len(), data.dtype()),
                ));
            }
        }
        Ok(storage)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("program", &self.program).finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Number of input and output buffers an operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub inputs: usize,
    pub outputs: usize,
}

impl Arity {
    pub const fn new(inputs: usize, outputs: usize) -> Self {
        Arity { inputs, outputs }
    }
}

/// A registrable operation.
#[derive(Clone)]
pub struct Operation {
    arity: Arity,
    params: Vec<ParamSpec>,
    infer: Arc<ShapeFn>,
    kernel: Kernel,
}

impl Operation {
    pub fn new<F>(arity: Arity, infer: F, kernel: Kernel) -> Self
    where
        F: Fn(&[TensorDesc], &Params) -> Result<Vec<TensorDesc>> + Send + Sync + 'static,
    {
        Operation { arity, params: Vec::new(), infer: Arc::new(infer), kernel }
    }

    /// Declare a parameter.
    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Bind raw step parameters against the declaration.
    pub fn bind_params(&self, name: &str, params: &Params) -> Result<Params> {
        params.bind(name, &self.params)
    }

    /// Validate inputs against the arity and run shape inference.
    ///
    /// `params` must already be bound (see [`Operation::bind_params`]).
    /// Never touches a device.
    pub fn infer_shapes(&self, name: &str, inputs: &[TensorDesc], params: &Params) -> Result<Vec<TensorDesc>> {
        if inputs.len() != self.arity.inputs {
            return Err(PipelineError::shape(
                Shape::new([self.arity.inputs]),
                Shape::new([inputs.len()]),
                format!("`{name}` takes {} input buffer(s)", self.arity.inputs),
            ));
        }
        let outputs = (self.infer)(inputs, params).map_err(|e| e.with_op(name))?;
        if outputs.len() != self.arity.outputs {
            return Err(PipelineError::shape(
                Shape::new([self.arity.outputs]),
                Shape::new([outputs.len()]),
                format!("`{name}` shape inference produced the wrong number of outputs"),
            ));
        }
        for out in &outputs {
            out.shape.validate()?;
        }
        Ok(outputs)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("arity", &self.arity)
            .field("params", &self.params)
            .field("kernel", &self.kernel)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Name → operation table.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    ops: BTreeMap<String, Operation>,
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OperationRegistry::default()
    }

    /// A registry pre-populated with the built-in operations (see `ops`).
    pub fn with_builtins() -> Self {
        let mut reg = OperationRegistry::new();
        crate::ops::register_builtins(&mut reg);
        reg
    }

    /// Add an operation. A second registration under the same name fails
    /// with `DuplicateOperation` and leaves the first one in place.
    pub fn register(&mut self, name: &str, op: Operation) -> Result<()> {
        if self.ops.contains_key(name) {
            return Err(PipelineError::DuplicateOperation { name: name.to_string() });
        }
        log::debug!("registered operation `{name}` ({:?})", op.arity);
        self.ops.insert(name.to_string(), op);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&Operation> {
        self.ops
            .get(name)
            .ok_or_else(|| PipelineError::UnknownOperation { name: name.to_string(), step: None })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
