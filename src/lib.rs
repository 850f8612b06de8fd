// gpupipe: GPU buffer pipelines
// Push host images to a compute device, chain named kernels over device
// buffers, pull the results back and release every buffer deterministically.
//
//   device     DeviceContext, configuration, host reference backend
//   gpu        wgpu backend (adapter selection, dispatch, staging)
//   buffer     Buffer handles bound to a context
//   registry   name → Operation table, kernels, shape inference
//   ops        built-in operations
//   pipeline   builder, validation, sequential executor
//   bridge     host array ↔ device buffer transfers

pub mod error;
pub mod tensor;
pub mod params;
pub mod image;
pub mod convolution;
pub mod affine;

pub mod device;
pub mod gpu;
pub mod buffer;
pub mod registry;
pub mod ops;
pub mod pipeline;
pub mod bridge;

pub use affine::AffineTransform2D;
pub use bridge::{from_device, to_device};
pub use buffer::Buffer;
pub use device::{BackendKind, DeviceConfig, DeviceContext, DeviceInfo, DeviceProfile};
pub use error::{KernelError, PipelineError, Result};
pub use image::HostImage;
pub use params::{ParamValue, Params};
pub use pipeline::{CancellationToken, Pipeline, PipelineOutputs, PipelineState, ValidatedPipeline};
pub use registry::{Arity, Kernel, Operation, OperationRegistry};
pub use tensor::{ElementType, Shape, TensorDesc};
