// gpu/backend.rs — wgpu implementation of the `Backend` seam.
//
// MEMORY
// ───────
// Every tensor lives in one `wgpu::Buffer` with
// STORAGE | COPY_DST | COPY_SRC usage, sized to the tensor's dense byte
// length rounded up to `wgpu::COPY_BUFFER_ALIGNMENT` (4). u8/u16 tensors
// therefore carry up to 3 bytes of tail padding; reads strip it again.
//
// Uploads go through `queue.write_buffer`. Readback copies into a
// MAP_READ staging buffer, maps it and blocks on `device.poll(Wait)`,
// the same pattern the pyramid readback uses.
//
// KERNELS
// ────────
// A launch takes the direct path when the kernel carries a `GpuProgram`
// and every bound buffer is float32. The WGSL source is specialised with
// the workgroup size ({{WG_X}}/{{WG_Y}} replacement, since naga does not
// accept `override` expressions in @workgroup_size) and the compute
// pipeline is cached per (source, entry point).
//
// Anything else is staged: buffers are read back, the kernel's reference
// body runs on the host and the results are uploaded again. That keeps the
// semantics of every operation identical across backends, at the cost of
// two transfers for ops without a WGSL program.
//
// ERROR SCOPES
// ─────────────
// wgpu reports validation and out-of-memory errors asynchronously through
// the device's uncaptured-error handler, which panics by default. Every
// allocation and dispatch is wrapped in push_error_scope/pop_error_scope so
// failures come back as `OutOfDeviceMemory` / `KernelError::DEVICE`
// instead.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::device::{
    run_staged, Backend, BackendKind, BufferBinding, BufferId, DeviceConfig, DeviceInfo, DeviceProfile, Launch,
    WorkgroupSize,
};
use crate::error::{KernelError, PipelineError, Result};
use crate::gpu::adapter::{limits_for_profile, select_adapter, AdapterInfo};
use crate::registry::GpuProgram;
use crate::tensor::{ElementType, TensorDesc};

/// Uniform block shared by every WGSL program (see `registry::GpuProgram`).
///
/// Layout matches the WGSL struct:
/// ```wgsl
/// struct Uniforms {
///     dims: vec4<u32>,                 // width, height, planes, count
///     values: array<vec4<f32>, 4>,     // op-specific scalars
/// }
/// ```
/// 16 + 64 = 80 bytes, a multiple of 16 as uniform layout requires.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct KernelUniforms {
    pub dims: [u32; 4],
    pub values: [[f32; 4]; 4],
}

impl KernelUniforms {
    pub(crate) fn new(desc: &TensorDesc, values: [f32; 16]) -> Self {
        let shape = &desc.shape;
        let mut packed = [[0.0f32; 4]; 4];
        for (i, v) in values.iter().enumerate() {
            packed[i / 4][i % 4] = *v;
        }
        KernelUniforms {
            dims: [
                shape.dim(0) as u32,
                shape.dim(1) as u32,
                shape.plane_count() as u32,
                desc.element_count() as u32,
            ],
            values: packed,
        }
    }
}

/// Round `n` up to a multiple of `alignment` (a power of two).
pub(crate) fn align_to(n: u64, alignment: u64) -> u64 {
    (n + alignment - 1) & !(alignment - 1)
}

struct CachedPipeline {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

/// A GPU opened through wgpu (Vulkan).
///
/// # Field drop order
/// Fields drop top to bottom. Buffers and pipelines go first, then the
/// device and queue, and `_instance` last: dzn (the D3D12-to-Vulkan layer
/// on WSL2) crashes if the Vulkan instance dies before device objects.
pub struct WgpuBackend {
    buffers: HashMap<BufferId, wgpu::Buffer>,
    pipelines: HashMap<(&'static str, &'static str), CachedPipeline>,
    workgroup: WorkgroupSize,
    max_workgroups: u32,
    adapter: AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    _instance: wgpu::Instance,
}

impl WgpuBackend {
    /// Open the best Vulkan adapter matching `config`.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no adapter passes the name filter or the
    /// device request fails.
    pub fn open(config: &DeviceConfig, workgroup: WorkgroupSize) -> Result<(Self, DeviceInfo)> {
        pollster::block_on(Self::open_async(config, workgroup))
    }

    async fn open_async(config: &DeviceConfig, workgroup: WorkgroupSize) -> Result<(Self, DeviceInfo)> {
        // dzn on WSL2 declares itself non-conformant; without this flag wgpu
        // hides it and we would only see llvmpipe.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        if adapters.is_empty() {
            return Err(PipelineError::DeviceUnavailable { reason: "no Vulkan adapter found".to_string() });
        }
        let adapter = select_adapter(adapters, config).ok_or_else(|| PipelineError::DeviceUnavailable {
            reason: format!(
                "no Vulkan adapter matches name filter {:?}",
                config.device_name.as_deref().unwrap_or_default()
            ),
        })?;
        let adapter_info = AdapterInfo::from_wgpu(&adapter.get_info());

        // A V3D adapter under the Native profile is a Raspberry Pi; use its
        // limits so the default config works there unchanged.
        let mut profile = config.profile;
        let mut workgroup = workgroup;
        if profile == DeviceProfile::Native && adapter_info.name.to_ascii_lowercase().contains("v3d") {
            log::info!("V3D adapter detected, using RaspberryPi profile");
            profile = DeviceProfile::RaspberryPi;
            if config.workgroup.is_none() {
                workgroup = WorkgroupSize::for_profile(profile);
            }
        }

        let limits = limits_for_profile(profile);
        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpupipe"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| PipelineError::DeviceUnavailable { reason: format!("device request failed: {e}") })?;

        let max_buffer_bytes = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: BackendKind::Gpu,
            memory_bytes: config.memory_budget.unwrap_or_else(|| profile.default_memory_budget()),
            max_buffer_bytes,
            profile,
            workgroup,
        };
        log::info!("wgpu adapter: {adapter_info}");

        let backend = WgpuBackend {
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            workgroup,
            max_workgroups: limits.max_compute_workgroups_per_dimension,
            adapter: adapter_info,
            device,
            queue,
            _instance: instance,
        };
        Ok((backend, info))
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn buffer(&self, id: BufferId) -> std::result::Result<&wgpu::Buffer, KernelError> {
        self.buffers
            .get(&id)
            .ok_or_else(|| KernelError::new(KernelError::DEVICE, format!("buffer {id} not resident")))
    }

    fn read_bytes(&self, id: BufferId, len: u64) -> std::result::Result<Vec<u8>, KernelError> {
        let src = self.buffer(id)?;
        let padded = align_to(len.max(1), wgpu::COPY_BUFFER_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpupipe::readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("gpupipe::readback") });
        encoder.copy_buffer_to_buffer(src, 0, &readback, 0, padded);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver outlives the poll below.
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| KernelError::new(KernelError::DEVICE, "readback callback never fired"))?
            .map_err(|e| KernelError::new(KernelError::DEVICE, format!("readback map failed: {e}")))?;

        let bytes = slice.get_mapped_range()[..len as usize].to_vec();
        readback.unmap();
        Ok(bytes)
    }

    fn write_bytes(&self, id: BufferId, bytes: &[u8]) -> std::result::Result<(), KernelError> {
        let dst = self.buffer(id)?;
        let padded = align_to(bytes.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        if padded == bytes.len() {
            self.queue.write_buffer(dst, 0, bytes);
        } else {
            let mut data = bytes.to_vec();
            data.resize(padded, 0);
            self.queue.write_buffer(dst, 0, &data);
        }
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(KernelError::new(KernelError::DEVICE, format!("queue write failed: {err}")));
        }
        Ok(())
    }

    /// Whether `launch` can run as a single WGSL dispatch.
    fn direct_program<'a>(&self, launch: &Launch<'a>) -> Option<&'a GpuProgram> {
        let program = launch.kernel.program()?;
        let all_f32 = launch
            .inputs
            .iter()
            .chain(launch.outputs)
            .all(|b| b.desc.dtype == ElementType::F32);
        let grid = &launch.outputs.first()?.desc;
        let (dx, dy) = self.workgroup.dispatch_size(grid.shape.dim(0) as u32, grid.shape.dim(1) as u32);
        let fits = dx <= self.max_workgroups
            && dy <= self.max_workgroups
            && grid.shape.plane_count() as u64 <= self.max_workgroups as u64;
        (all_f32 && fits).then_some(program)
    }

    fn ensure_pipeline(
        &mut self,
        program: &GpuProgram,
        n_inputs: usize,
        n_outputs: usize,
    ) -> std::result::Result<(), KernelError> {
        let key = (program.label, program.entry_point);
        if !self.pipelines.contains_key(&key) {
            let cached = self.create_pipeline(program, n_inputs, n_outputs)?;
            self.pipelines.insert(key, cached);
        }
        Ok(())
    }

    fn create_pipeline(
        &self,
        program: &GpuProgram,
        n_inputs: usize,
        n_outputs: usize,
    ) -> std::result::Result<CachedPipeline, KernelError> {
        let source = program
            .source
            .replace("{{WG_X}}", &self.workgroup.x.to_string())
            .replace("{{WG_Y}}", &self.workgroup.y.to_string());

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = Vec::with_capacity(n_inputs + n_outputs + 1);
        for i in 0..n_inputs {
            entries.push(storage(i as u32, true));
        }
        for o in 0..n_outputs {
            entries.push(storage((n_inputs + o) as u32, false));
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: (n_inputs + n_outputs) as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        let bgl = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program.label),
            entries: &entries,
        });
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.label),
            bind_group_layouts: &[&bgl],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(program.entry_point),
            layout: Some(&layout),
            module: &shader,
            entry_point: program.entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(KernelError::new(
                KernelError::DEVICE,
                format!("compiling `{}` failed: {err}", program.entry_point),
            ));
        }
        log::debug!("compiled WGSL `{}::{}` ({})", program.label, program.entry_point, self.workgroup);
        Ok(CachedPipeline { pipeline, bgl })
    }

    fn dispatch(&mut self, launch: &Launch<'_>, program: &GpuProgram) -> std::result::Result<(), KernelError> {
        let values = (program.uniforms)(launch.params)?;
        let grid = launch.outputs[0].desc.clone();
        let uniforms = KernelUniforms::new(&grid, values);
        let (dx, dy) = self.workgroup.dispatch_size(grid.shape.dim(0) as u32, grid.shape.dim(1) as u32);
        let planes = grid.shape.plane_count() as u32;

        let n_in = launch.inputs.len();
        let n_out = launch.outputs.len();
        self.ensure_pipeline(program, n_in, n_out)?;
        let this = &*self;
        let cached = this
            .pipelines
            .get(&(program.label, program.entry_point))
            .ok_or_else(|| KernelError::new(KernelError::DEVICE, "pipeline cache miss"))?;

        let uniform_buf = this.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpupipe::uniforms"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let mut entries = Vec::with_capacity(n_in + n_out + 1);
        for (i, b) in launch.inputs.iter().chain(launch.outputs).enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: this.buffer(b.id)?.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: (n_in + n_out) as u32,
            resource: uniform_buf.as_entire_binding(),
        });

        this.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = this.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(launch.op),
            layout: &cached.bgl,
            entries: &entries,
        });
        let mut encoder = this
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(launch.op) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(launch.op),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dx, dy, planes);
        }
        this.queue.submit(std::iter::once(encoder.finish()));
        if let Some(err) = pollster::block_on(this.device.pop_error_scope()) {
            return Err(KernelError::new(KernelError::DEVICE, format!("dispatch of `{}` failed: {err}", launch.op)));
        }
        Ok(())
    }
}

impl Backend for WgpuBackend {
    fn allocate(&mut self, id: BufferId, desc: &TensorDesc) -> Result<()> {
        let requested = desc.size_bytes();
        let size = align_to(requested.max(1), wgpu::COPY_BUFFER_ALIGNMENT);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpupipe::tensor"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            log::warn!("wgpu allocation of {size} bytes failed: {err}");
            return Err(PipelineError::OutOfDeviceMemory { requested, available: 0 });
        }
        self.buffers.insert(id, buffer);
        Ok(())
    }

    fn free(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        }
    }

    fn write(&mut self, id: BufferId, bytes: &[u8]) -> Result<()> {
        if !self.buffers.contains_key(&id) {
            return Err(PipelineError::StaleHandle { id: id.0 });
        }
        self.write_bytes(id, bytes).map_err(|e| e.into_pipeline("write"))
    }

    fn read(&mut self, id: BufferId, desc: &TensorDesc) -> Result<Vec<u8>> {
        self.read_bytes(id, desc.size_bytes()).map_err(|e| e.into_pipeline("read"))
    }

    fn launch(&mut self, launch: &Launch<'_>) -> std::result::Result<(), KernelError> {
        if let Some(program) = self.direct_program(launch) {
            return self.dispatch(launch, program);
        }
        log::trace!("`{}` has no direct WGSL path for these buffers; staging through host", launch.op);
        let this = &*self;
        let mut staged: Vec<(BufferId, Vec<u8>)> = Vec::with_capacity(launch.outputs.len());
        run_staged(
            launch,
            |b: &BufferBinding| this.read_bytes(b.id, b.desc.size_bytes()),
            |b: &BufferBinding, bytes: &[u8]| {
                staged.push((b.id, bytes.to_vec()));
                Ok(())
            },
        )?;
        for (id, bytes) in staged {
            this.write_bytes(id, &bytes)?;
        }
        Ok(())
    }

    fn synchronize(&mut self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}
