// pipeline.rs — Pipeline builder, validation and sequential executor.
//
// LIFECYCLE
// ──────────
//   Pipeline            (Built)      steps + declared inputs/outputs
//      │ validate(&registry, &input_descs)
//      ▼
//   ValidatedPipeline   (Validated)  operations resolved, parameters bound,
//      │                             every buffer's descriptor inferred
//      │ execute(&ctx, &inputs, &cancel)        ← repeatable
//      ▼
//   Executing → Completed | Failed
//
// `validate` consumes the `Pipeline`, so `execute` is only reachable on a
// pipeline that passed validation. Validation is pure: it never touches a
// device, so an unknown operation or a shape error is reported before a
// single byte is allocated.
//
// BUFFER NAMESPACE
// ─────────────────
// Steps refer to buffers by name. A name is bound exactly once, either as
// a pipeline input or as the output of one step, and may only be read by
// later steps. Declared pipeline outputs must be produced by a step.
//
// RUN ALLOCATIONS
// ────────────────
// Every buffer a run allocates goes into a `RunAllocations` guard. An
// intermediate is released right after its last reader. On success the
// declared outputs are moved out of the guard and handed to the caller;
// on any error or cancellation the guard's drop releases everything the
// run allocated, so the context's live-buffer count is back where it
// started.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::device::{BufferId, DeviceContext};
use crate::error::{PipelineError, Result};
use crate::params::Params;
use crate::registry::{Operation, OperationRegistry};
use crate::tensor::{Shape, TensorDesc};

// ============================================================
// Cancellation
// ============================================================

/// Cooperative cancellation flag, checked before every step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Built,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================
// Builder
// ============================================================

/// One operation invocation: names of the buffers it reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub params: Params,
}

/// An ordered list of steps over a shared buffer namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    inputs: Vec<String>,
    steps: Vec<Step>,
    outputs: Vec<String>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pipeline input. Inputs are bound positionally, in
    /// declaration order, at `validate` and `execute`.
    pub fn input(mut self, name: &str) -> Self {
        self.inputs.push(name.to_string());
        self
    }

    pub fn step(mut self, op: &str, inputs: &[&str], outputs: &[&str], params: Params) -> Self {
        self.steps.push(Step {
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            params,
        });
        self
    }

    /// Declare a buffer to hand back to the caller after a run.
    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::Built
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Resolve operations, check buffer references and infer every
    /// buffer's descriptor. Fails fast with the first error.
    ///
    /// `input_descs` holds one descriptor per declared input, in order.
    pub fn validate(self, registry: &OperationRegistry, input_descs: &[TensorDesc]) -> Result<ValidatedPipeline> {
        if input_descs.len() != self.inputs.len() {
            return Err(PipelineError::shape(
                Shape::new([self.inputs.len()]),
                Shape::new([input_descs.len()]),
                "one descriptor per declared pipeline input",
            ));
        }

        let mut table: HashMap<String, TensorDesc> = HashMap::new();
        for (name, desc) in self.inputs.iter().zip(input_descs) {
            desc.shape.validate()?;
            if table.insert(name.clone(), desc.clone()).is_some() {
                return Err(PipelineError::DuplicateBinding { step: 0, name: name.clone() });
            }
        }

        let mut resolved = Vec::with_capacity(self.steps.len());
        let mut last_use: HashMap<String, usize> = HashMap::new();
        for (index, step) in self.steps.into_iter().enumerate() {
            let op = registry.resolve(&step.op).map_err(|e| e.at_step(index))?;

            let mut in_descs = Vec::with_capacity(step.inputs.len());
            for name in &step.inputs {
                let desc = table
                    .get(name)
                    .ok_or_else(|| PipelineError::UnboundBuffer { step: index, name: name.clone() })?;
                in_descs.push(desc.clone());
                last_use.insert(name.clone(), index);
            }

            let mut seen = HashSet::new();
            for name in &step.outputs {
                if table.contains_key(name) || !seen.insert(name.as_str()) {
                    return Err(PipelineError::DuplicateBinding { step: index, name: name.clone() });
                }
            }
            if step.outputs.len() != op.arity().outputs {
                return Err(PipelineError::shape(
                    Shape::new([op.arity().outputs]),
                    Shape::new([step.outputs.len()]),
                    format!("`{}` writes {} output buffer(s)", step.op, op.arity().outputs),
                )
                .at_step(index));
            }

            let params = op.bind_params(&step.op, &step.params)?;
            let out_descs = op
                .infer_shapes(&step.op, &in_descs, &params)
                .map_err(|e| e.at_step(index))?;
            for (name, desc) in step.outputs.iter().zip(&out_descs) {
                log::trace!("step {index} `{}` binds {name}: {desc}", step.op);
                table.insert(name.clone(), desc.clone());
            }

            resolved.push(ResolvedStep {
                name: step.op,
                op: op.clone(),
                inputs: step.inputs,
                outputs: step.outputs,
                params,
            });
        }

        let produced: HashSet<&str> = resolved.iter().flat_map(|s| s.outputs.iter().map(String::as_str)).collect();
        let mut declared = HashSet::new();
        for name in &self.outputs {
            if !produced.contains(name.as_str()) {
                return Err(PipelineError::UnboundBuffer { step: resolved.len(), name: name.clone() });
            }
            if !declared.insert(name.as_str()) {
                return Err(PipelineError::DuplicateBinding { step: resolved.len(), name: name.clone() });
            }
        }

        log::debug!(
            "validated pipeline: {} step(s), {} input(s), {} output(s)",
            resolved.len(),
            self.inputs.len(),
            self.outputs.len()
        );
        Ok(ValidatedPipeline {
            inputs: self.inputs,
            input_descs: input_descs.to_vec(),
            steps: resolved,
            outputs: self.outputs,
            table,
            last_use,
            state: PipelineState::Validated,
            last_error: None,
        })
    }
}

// ============================================================
// Validated pipeline
// ============================================================

struct ResolvedStep {
    name: String,
    op: Operation,
    inputs: Vec<String>,
    outputs: Vec<String>,
    /// Bound: defaults filled, kinds coerced.
    params: Params,
}

/// A pipeline that passed validation and can be executed.
pub struct ValidatedPipeline {
    inputs: Vec<String>,
    input_descs: Vec<TensorDesc>,
    steps: Vec<ResolvedStep>,
    outputs: Vec<String>,
    table: HashMap<String, TensorDesc>,
    /// Index of the last step that reads each buffer.
    last_use: HashMap<String, usize>,
    state: PipelineState,
    last_error: Option<PipelineError>,
}

impl ValidatedPipeline {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Error of the most recent failed run, cleared when a run starts.
    pub fn last_error(&self) -> Option<&PipelineError> {
        self.last_error.as_ref()
    }

    /// Inferred descriptor of any bound buffer name.
    pub fn inferred(&self, name: &str) -> Option<&TensorDesc> {
        self.table.get(name)
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Run every step in order on `ctx`.
    ///
    /// `inputs` holds one buffer per declared input, in order; they must
    /// match the validated descriptors and stay untouched. On failure all
    /// buffers the run allocated are released before the error returns.
    pub fn execute(
        &mut self,
        ctx: &DeviceContext,
        inputs: &[&Buffer],
        cancel: &CancellationToken,
    ) -> Result<PipelineOutputs> {
        self.state = PipelineState::Executing;
        self.last_error = None;
        match self.run(ctx, inputs, cancel) {
            Ok(outputs) => {
                self.state = PipelineState::Completed;
                Ok(outputs)
            }
            Err(e) => {
                log::warn!("pipeline run failed: {e}");
                self.state = PipelineState::Failed;
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn run(&self, ctx: &DeviceContext, inputs: &[&Buffer], cancel: &CancellationToken) -> Result<PipelineOutputs> {
        if inputs.len() != self.inputs.len() {
            return Err(PipelineError::shape(
                Shape::new([self.inputs.len()]),
                Shape::new([inputs.len()]),
                "one buffer per declared pipeline input",
            ));
        }
        let mut ids: HashMap<&str, BufferId> = HashMap::new();
        for ((name, expected), buffer) in self.inputs.iter().zip(&self.input_descs).zip(inputs) {
            if buffer.desc() != expected {
                return Err(PipelineError::shape(
                    expected.shape.clone(),
                    buffer.shape().clone(),
                    format!("input `{name}` is {}, validated as {expected}", buffer.desc()),
                ));
            }
            ids.insert(name.as_str(), buffer.live_id(ctx)?);
        }

        let mut run = RunAllocations::default();
        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                log::debug!("pipeline cancelled before step {index}");
                return Err(PipelineError::Cancelled { step: index });
            }

            let in_ids = step
                .inputs
                .iter()
                .map(|n| ids.get(n.as_str()).copied().ok_or_else(|| PipelineError::UnboundBuffer { step: index, name: n.clone() }))
                .collect::<Result<Vec<_>>>()?;
            let mut out_ids = Vec::with_capacity(step.outputs.len());
            for name in &step.outputs {
                let desc = self
                    .table
                    .get(name)
                    .ok_or_else(|| PipelineError::UnboundBuffer { step: index, name: name.clone() })?;
                let buffer = Buffer::allocate_desc(ctx, desc)?;
                out_ids.push(buffer.id());
                ids.insert(name.as_str(), buffer.id());
                run.insert(name, buffer);
            }

            log::debug!("step {index}: `{}` {:?} → {:?}", step.name, step.inputs, step.outputs);
            ctx.shared().launch(&step.name, step.op.kernel(), &in_ids, &out_ids, &step.params)?;

            // Intermediates whose last reader was this step can go.
            for name in &step.inputs {
                if self.last_use.get(name) == Some(&index) && !self.outputs.contains(name) {
                    run.release(name);
                }
            }
        }

        let mut outputs = BTreeMap::new();
        for name in &self.outputs {
            let buffer = run
                .take(name)
                .ok_or_else(|| PipelineError::UnboundBuffer { step: self.steps.len(), name: name.clone() })?;
            outputs.insert(name.clone(), buffer);
        }
        Ok(PipelineOutputs { buffers: outputs })
    }
}

impl fmt::Debug for ValidatedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedPipeline")
            .field("inputs", &self.inputs)
            .field("steps", &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .field("state", &self.state)
            .finish()
    }
}

/// Buffers allocated by one run. Dropping the guard releases whatever is
/// still in it.
#[derive(Default)]
struct RunAllocations {
    buffers: HashMap<String, Buffer>,
}

impl RunAllocations {
    fn insert(&mut self, name: &str, buffer: Buffer) {
        self.buffers.insert(name.to_string(), buffer);
    }

    fn release(&mut self, name: &str) {
        if let Some(buffer) = self.buffers.remove(name) {
            buffer.release();
        }
    }

    fn take(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(name)
    }
}

impl Drop for RunAllocations {
    fn drop(&mut self) {
        for (_, buffer) in self.buffers.drain() {
            buffer.release();
        }
    }
}

// ============================================================
// Outputs
// ============================================================

/// Buffers a successful run hands to the caller, by declared name.
#[derive(Debug, Default)]
pub struct PipelineOutputs {
    buffers: BTreeMap<String, Buffer>,
}

impl PipelineOutputs {
    pub fn get(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    /// Move one buffer out; the caller becomes responsible for it.
    pub fn take(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Release every buffer still held.
    pub fn release_all(&mut self) {
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            buffer.release();
        }
    }
}

impl IntoIterator for PipelineOutputs {
    type Item = (String, Buffer);
    type IntoIter = std::collections::btree_map::IntoIter<String, Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}
