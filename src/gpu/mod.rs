// gpu/mod.rs — wgpu backend.
//
// The host reference device (device.rs) defines what every operation
// means; this module makes the same operations run on a real GPU:
//
//   adapter.rs  — adapter enumeration / selection, profile limits
//   backend.rs  — `WgpuBackend`: storage buffers, staging transfers,
//                 compute-pipeline cache and dispatch
//
// Kernels that ship a WGSL program (see registry::GpuProgram) run as a
// single compute dispatch when every bound buffer is float32. Everything
// else is staged through host memory and runs the reference body, so the
// GPU backend accepts exactly the same pipelines as the host device.

pub mod adapter;
pub mod backend;

pub use adapter::AdapterInfo;
pub use backend::WgpuBackend;
