// error.rs — Error taxonomy shared by every layer of the pipeline.
//
// One enum for the whole crate. Device, buffer, registry and executor errors
// all flow to the caller of `ValidatedPipeline::execute`, so splitting them
// into per-module types would only force callers to write conversion glue.
//
// Kernels report failures with the narrower `KernelError` (a diagnostic
// code + message). The registry wraps it into `PipelineError::KernelExecution`
// together with the operation name, so the kernel body never needs to know
// what it was registered as.

use crate::tensor::Shape;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure the pipeline can report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// No compute device matched the requested configuration.
    #[error("no compatible compute device available: {reason}")]
    DeviceUnavailable { reason: String },

    /// The device cannot satisfy an allocation request.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: u64, available: u64 },

    /// A buffer was used after `release()` or after its context was closed.
    #[error("stale buffer handle #{id}: released or its device context was closed")]
    StaleHandle { id: u64 },

    /// Shapes or element types disagree. `step` is `None` when the mismatch
    /// is detected outside a pipeline (e.g. a ragged host array).
    #[error("shape mismatch{}: expected {expected}, got {actual} ({detail})", fmt_step(.step))]
    ShapeMismatch {
        step: Option<usize>,
        expected: Shape,
        actual: Shape,
        detail: String,
    },

    #[error("unknown operation `{name}`{}", fmt_step(.step))]
    UnknownOperation { name: String, step: Option<usize> },

    #[error("operation `{name}` is already registered")]
    DuplicateOperation { name: String },

    #[error("pipeline run cancelled before step {step}")]
    Cancelled { step: usize },

    /// A kernel failed while running on the device.
    #[error("kernel `{op}` failed with code {code}: {message}")]
    KernelExecution { op: String, code: i32, message: String },

    /// A scalar parameter is missing, of the wrong kind, or out of range.
    #[error("invalid parameter `{name}` for `{op}`: {reason}")]
    InvalidParameter { op: String, name: String, reason: String },

    /// A step references a buffer name that is neither a pipeline input nor
    /// produced by an earlier step.
    #[error("step {step} references unbound buffer `{name}`")]
    UnboundBuffer { step: usize, name: String },

    /// A buffer name is bound twice (by two steps, or by a step and an input).
    #[error("buffer `{name}` is bound more than once (step {step})")]
    DuplicateBinding { step: usize, name: String },

    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
}

fn fmt_step(step: &Option<usize>) -> String {
    match step {
        Some(s) => format!(" at step {s}"),
        None => String::new(),
    }
}

impl PipelineError {
    /// Attach a step index to errors that carry one. Other variants are
    /// returned unchanged.
    pub(crate) fn at_step(self, index: usize) -> Self {
        match self {
            PipelineError::ShapeMismatch { expected, actual, detail, .. } => {
                PipelineError::ShapeMismatch { step: Some(index), expected, actual, detail }
            }
            PipelineError::UnknownOperation { name, .. } => {
                PipelineError::UnknownOperation { name, step: Some(index) }
            }
            other => other,
        }
    }

    /// Fill in the operation name of an `InvalidParameter` raised by a
    /// parameter accessor that did not know it.
    pub(crate) fn with_op(self, op: &str) -> Self {
        match self {
            PipelineError::InvalidParameter { op: o, name, reason } if o.is_empty() => {
                PipelineError::InvalidParameter { op: op.to_string(), name, reason }
            }
            other => other,
        }
    }

    /// Shape mismatch outside of a pipeline step.
    pub(crate) fn shape(expected: Shape, actual: Shape, detail: impl Into<String>) -> Self {
        PipelineError::ShapeMismatch {
            step: None,
            expected,
            actual,
            detail: detail.into(),
        }
    }
}

/// Failure reported by a kernel body.
///
/// `code` is an implementation-defined diagnostic code. Reference kernels
/// use the constants below; GPU backends forward driver error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelError {
    pub code: i32,
    pub message: String,
}

impl KernelError {
    /// Input data cannot be processed (e.g. a histogram over NaNs).
    pub const BAD_INPUT: i32 = 1;
    /// Buffer contents do not have the element type the kernel expected.
    pub const TYPE: i32 = 2;
    /// Device-side failure (submission, mapping, validation).
    pub const DEVICE: i32 = 3;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        KernelError { code, message: message.into() }
    }

    pub(crate) fn into_pipeline(self, op: &str) -> PipelineError {
        PipelineError::KernelExecution {
            op: op.to_string(),
            code: self.code,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display_names_step() {
        let err = PipelineError::shape(Shape::new([4, 4]), Shape::new([4, 5]), "plane size")
            .at_step(3);
        let msg = err.to_string();
        assert!(msg.contains("at step 3"), "{msg}");
        assert!(msg.contains("[4, 4]"), "{msg}");
        assert!(msg.contains("[4, 5]"), "{msg}");
    }

    #[test]
    fn test_at_step_leaves_other_variants_alone() {
        let err = PipelineError::StaleHandle { id: 7 }.at_step(2);
        assert_eq!(err, PipelineError::StaleHandle { id: 7 });
    }

    #[test]
    fn test_kernel_error_wraps_op_name() {
        let err = KernelError::new(KernelError::BAD_INPUT, "nan").into_pipeline("automatic_threshold");
        assert_eq!(
            err,
            PipelineError::KernelExecution {
                op: "automatic_threshold".into(),
                code: 1,
                message: "nan".into()
            }
        );
    }
}
