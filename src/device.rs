// device.rs — Device context: backend selection, allocation bookkeeping.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `DeviceConfig` — which backend to open, optional device-name filter,
//    memory budget and hardware profile. Buildable in code or from the
//    environment (`DeviceConfig::from_env`).
//
// 2. `DeviceContext` — the one handle to an opened device. It owns the
//    backend (device + command queue) and the allocation table. Every
//    allocation, release, transfer and kernel launch goes through the
//    context's lock, so calls against one context are serialized.
//
// 3. `Backend` — the seam between bookkeeping and actual memory. Two
//    implementations ship with the crate:
//      HostBackend  (this file)  reference device in host RAM
//      WgpuBackend  (gpu/)       real GPU via wgpu
//
//
// HANDLE VALIDITY
// ────────────────
// Buffers hold a `Weak<ContextShared>` plus a `BufferId`. Ids are handed
// out from a monotonically increasing counter and never reused, so "is
// this id still in the allocation table" is a complete staleness check:
//
//   released buffer          → id removed from table     → StaleHandle
//   context closed           → table cleared             → StaleHandle
//   context dropped          → Weak upgrade fails        → StaleHandle
//
// MEMORY ACCOUNTING
// ──────────────────
// The context, not the backend, enforces the memory budget. Backends only
// report hard failures from the driver. Bytes are counted at their logical
// (dense) size; GPU buffers are padded to 4 bytes internally but that
// padding is not charged against the budget.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{KernelError, PipelineError, Result};
use crate::params::Params;
use crate::registry::Kernel;
use crate::tensor::{TensorData, TensorDesc};

// ============================================================
// Configuration
// ============================================================

/// Which kind of device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Try the GPU first, fall back to the host reference device.
    Auto,
    /// Require a GPU adapter.
    Gpu,
    /// The host reference device (always available).
    Host,
}

impl BackendKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(BackendKind::Auto),
            "gpu" | "wgpu" => Some(BackendKind::Gpu),
            "host" | "cpu" => Some(BackendKind::Host),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Auto => write!(f, "auto"),
            BackendKind::Gpu => write!(f, "gpu"),
            BackendKind::Host => write!(f, "host"),
        }
    }
}

/// Hardware profile controlling device limits and default workgroup sizes.
///
/// `RaspberryPi` requests the limits of a VideoCore VI/VII (V3DV) device
/// even on a bigger GPU, so dispatches that would fail on the target are
/// caught on the development machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    Native,
    RaspberryPi,
}

impl DeviceProfile {
    /// Memory budget used when the config does not set one.
    pub fn default_memory_budget(self) -> u64 {
        match self {
            DeviceProfile::Native => 1 << 30,
            DeviceProfile::RaspberryPi => 256 << 20,
        }
    }

    /// Upper bound on `x * y` workgroup invocations. V3DV and the wgpu
    /// defaults agree, so every profile shares it.
    pub const MAX_INVOCATIONS: u32 = 256;

    /// Largest single buffer any profile allows (storage binding limit).
    pub const MAX_BUFFER_BYTES: u64 = 128 << 20;

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Some(DeviceProfile::Native),
            "rpi" | "raspberrypi" | "raspberry-pi" => Some(DeviceProfile::RaspberryPi),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// A workgroup size for 2D compute dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Default for the profile.
    ///
    /// - `Native`: 16×8 = 128 invocations (4 NVIDIA warps / 2 AMD waves).
    /// - `RaspberryPi`: 8×8 = 64, well inside the V3DV limit of 256.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Workgroups needed to cover a `w × h` plane (ceiling division).
    /// Shaders must guard against the out-of-range tail.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        (w.div_ceil(self.x), h.div_ceil(self.y))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// How to open a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    /// Case-insensitive substring the device name must contain.
    pub device_name: Option<String>,
    /// Bytes of device memory the context may hand out. `None` uses the
    /// profile default.
    pub memory_budget: Option<u64>,
    pub profile: DeviceProfile,
    /// Override the profile's default workgroup size.
    pub workgroup: Option<WorkgroupSize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            backend: BackendKind::Auto,
            device_name: None,
            memory_budget: None,
            profile: DeviceProfile::Native,
            workgroup: None,
        }
    }
}

impl DeviceConfig {
    /// Config for the host reference device.
    pub fn host() -> Self {
        DeviceConfig { backend: BackendKind::Host, ..Default::default() }
    }

    /// Config that requires a GPU.
    pub fn gpu() -> Self {
        DeviceConfig { backend: BackendKind::Gpu, ..Default::default() }
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = Some(name.to_string());
        self
    }

    pub fn with_profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_workgroup(mut self, x: u32, y: u32) -> Self {
        self.workgroup = Some(WorkgroupSize { x, y });
        self
    }

    /// Read configuration from the process environment:
    ///
    /// | variable                | values                              |
    /// |-------------------------|-------------------------------------|
    /// | `GPUPIPE_BACKEND`       | `auto`, `gpu`, `host`               |
    /// | `GPUPIPE_DEVICE`        | device-name substring               |
    /// | `GPUPIPE_MEMORY_BUDGET` | bytes, optional `K`/`M`/`G` suffix  |
    /// | `GPUPIPE_PROFILE`       | `native`, `rpi`                     |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`DeviceConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = DeviceConfig::default();
        if let Some(v) = lookup("GPUPIPE_BACKEND") {
            cfg.backend = BackendKind::parse(&v)
                .ok_or_else(|| PipelineError::InvalidConfig(format!("GPUPIPE_BACKEND={v}")))?;
        }
        if let Some(v) = lookup("GPUPIPE_DEVICE") {
            if !v.trim().is_empty() {
                cfg.device_name = Some(v.trim().to_string());
            }
        }
        if let Some(v) = lookup("GPUPIPE_MEMORY_BUDGET") {
            cfg.memory_budget = Some(
                parse_bytes(&v)
                    .ok_or_else(|| PipelineError::InvalidConfig(format!("GPUPIPE_MEMORY_BUDGET={v}")))?,
            );
        }
        if let Some(v) = lookup("GPUPIPE_PROFILE") {
            cfg.profile = DeviceProfile::parse(&v)
                .ok_or_else(|| PipelineError::InvalidConfig(format!("GPUPIPE_PROFILE={v}")))?;
        }
        Ok(cfg)
    }

    /// Effective memory budget.
    pub fn budget(&self) -> u64 {
        self.memory_budget.unwrap_or_else(|| self.profile.default_memory_budget())
    }

    /// Effective workgroup size, validated against the profile.
    pub fn workgroup_size(&self) -> Result<WorkgroupSize> {
        let ws = self.workgroup.unwrap_or_else(|| WorkgroupSize::for_profile(self.profile));
        let max = DeviceProfile::MAX_INVOCATIONS;
        if ws.x == 0 || ws.y == 0 || ws.total() > max {
            return Err(PipelineError::InvalidConfig(format!(
                "workgroup size {}×{} outside 1..={max} invocations for profile {}",
                ws.x, ws.y, self.profile
            )));
        }
        Ok(ws)
    }

    /// Whether `name` passes the device-name filter.
    pub(crate) fn matches_name(&self, name: &str) -> bool {
        match &self.device_name {
            None => true,
            Some(f) => name.to_ascii_lowercase().contains(&f.to_ascii_lowercase()),
        }
    }
}

/// Parse "1048576", "512K", "64M", "2G".
fn parse_bytes(s: &str) -> Option<u64> {
    let s = s.trim();
    let (num, shift) = match s.chars().last()?.to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 10),
        'M' => (&s[..s.len() - 1], 20),
        'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    num.trim().parse::<u64>().ok()?.checked_mul(1u64 << shift)
}

// ============================================================
// Device info
// ============================================================

/// Description of an opened device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    /// `Gpu` or `Host`; never `Auto`.
    pub backend: BackendKind,
    pub memory_bytes: u64,
    pub max_buffer_bytes: u64,
    pub profile: DeviceProfile,
    pub workgroup: WorkgroupSize,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] budget {} MiB, profile {}, workgroup {}",
            self.name,
            self.backend,
            self.memory_bytes >> 20,
            self.profile,
            self.workgroup
        )
    }
}

// ============================================================
// Backend seam
// ============================================================

/// Identifier of one device allocation. Never reused within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A buffer bound to a kernel launch.
#[derive(Debug, Clone)]
pub struct BufferBinding {
    pub id: BufferId,
    pub desc: TensorDesc,
}

/// Everything a backend needs to run one kernel.
pub struct Launch<'a> {
    pub op: &'a str,
    pub kernel: &'a Kernel,
    pub inputs: &'a [BufferBinding],
    pub outputs: &'a [BufferBinding],
    pub params: &'a Params,
}

/// Device memory + kernel dispatch.
///
/// Buffer contents cross this boundary as dense little-endian bytes.
/// Callers guarantee that ids passed in are live and that output ids are
/// distinct from input ids.
pub trait Backend: Send {
    fn allocate(&mut self, id: BufferId, desc: &TensorDesc) -> Result<()>;

    fn free(&mut self, id: BufferId);

    fn write(&mut self, id: BufferId, bytes: &[u8]) -> Result<()>;

    fn read(&mut self, id: BufferId, desc: &TensorDesc) -> Result<Vec<u8>>;

    fn launch(&mut self, launch: &Launch<'_>) -> std::result::Result<(), KernelError>;

    /// Block until all submitted work has finished.
    fn synchronize(&mut self) {}
}

/// Run a kernel's reference body by staging its buffers through host
/// memory: read + decode inputs, run, encode + write outputs.
pub(crate) fn run_staged(
    launch: &Launch<'_>,
    mut read: impl FnMut(&BufferBinding) -> std::result::Result<Vec<u8>, KernelError>,
    mut write: impl FnMut(&BufferBinding, &[u8]) -> std::result::Result<(), KernelError>,
) -> std::result::Result<(), KernelError> {
    let mut inputs = Vec::with_capacity(launch.inputs.len());
    for b in launch.inputs {
        let bytes = read(b)?;
        let data = TensorData::from_le_bytes(b.desc.dtype, &bytes, b.desc.element_count())
            .ok_or_else(|| KernelError::new(KernelError::DEVICE, format!("short read of buffer {}", b.id)))?;
        inputs.push((b.desc.clone(), data));
    }
    let out_descs: Vec<TensorDesc> = launch.outputs.iter().map(|b| b.desc.clone()).collect();
    let results = launch.kernel.run_reference(&inputs, &out_descs, launch.params)?;
    for (b, data) in launch.outputs.iter().zip(results) {
        write(b, &data.to_le_bytes())?;
    }
    Ok(())
}

// ============================================================
// HostBackend
// ============================================================

/// Reference device: buffer memory lives in host RAM as little-endian
/// bytes, and every kernel runs its reference body.
#[derive(Debug, Default)]
pub struct HostBackend {
    memory: HashMap<BufferId, Vec<u8>>,
}

/// Name the host reference device reports.
pub const HOST_DEVICE_NAME: &str = "host-reference";

impl HostBackend {
    pub fn new() -> Self {
        HostBackend::default()
    }
}

impl Backend for HostBackend {
    fn allocate(&mut self, id: BufferId, desc: &TensorDesc) -> Result<()> {
        let len = usize::try_from(desc.size_bytes()).map_err(|_| PipelineError::OutOfDeviceMemory {
            requested: desc.size_bytes(),
            available: usize::MAX as u64,
        })?;
        self.memory.insert(id, vec![0u8; len]);
        Ok(())
    }

    fn free(&mut self, id: BufferId) {
        self.memory.remove(&id);
    }

    fn write(&mut self, id: BufferId, bytes: &[u8]) -> Result<()> {
        let mem = self.memory.get_mut(&id).ok_or(PipelineError::StaleHandle { id: id.0 })?;
        let n = bytes.len().min(mem.len());
        mem[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    fn read(&mut self, id: BufferId, _desc: &TensorDesc) -> Result<Vec<u8>> {
        self.memory.get(&id).cloned().ok_or(PipelineError::StaleHandle { id: id.0 })
    }

    fn launch(&mut self, launch: &Launch<'_>) -> std::result::Result<(), KernelError> {
        let memory = &mut self.memory;
        let mut staged: Vec<(BufferId, Vec<u8>)> = Vec::with_capacity(launch.outputs.len());
        run_staged(
            launch,
            |b| {
                memory
                    .get(&b.id)
                    .cloned()
                    .ok_or_else(|| KernelError::new(KernelError::DEVICE, format!("buffer {} not resident", b.id)))
            },
            |b, bytes| {
                staged.push((b.id, bytes.to_vec()));
                Ok(())
            },
        )?;
        // Outputs are committed only once the whole kernel succeeded.
        for (id, bytes) in staged {
            if let Some(mem) = memory.get_mut(&id) {
                *mem = bytes;
            }
        }
        Ok(())
    }
}

// ============================================================
// DeviceContext
// ============================================================

struct ContextState {
    /// `None` once the context has been closed.
    backend: Option<Box<dyn Backend>>,
    allocations: HashMap<BufferId, TensorDesc>,
    next_id: u64,
    bytes_in_use: u64,
    peak_bytes: u64,
}

/// State shared between a context and the buffers it handed out.
pub(crate) struct ContextShared {
    info: DeviceInfo,
    state: Mutex<ContextState>,
}

/// An opened compute device.
///
/// Pass it by reference to everything that allocates or dispatches. The
/// context releases every live buffer when closed or dropped; handles that
/// outlive it report `StaleHandle`.
pub struct DeviceContext {
    shared: Arc<ContextShared>,
}

impl DeviceContext {
    /// Open a device according to `config`.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no device of the requested kind matches the
    /// name filter; `InvalidConfig` for an invalid workgroup override.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let workgroup = config.workgroup_size()?;
        match config.backend {
            BackendKind::Host => Self::open_host_backend(config, workgroup),
            BackendKind::Gpu => {
                let (backend, info) = crate::gpu::WgpuBackend::open(config, workgroup)?;
                Ok(Self::with_backend(Box::new(backend), info))
            }
            BackendKind::Auto => match crate::gpu::WgpuBackend::open(config, workgroup) {
                Ok((backend, info)) => Ok(Self::with_backend(Box::new(backend), info)),
                Err(e) => {
                    log::warn!("GPU unavailable ({e}); falling back to the host reference device");
                    Self::open_host_backend(config, workgroup)
                }
            },
        }
    }

    /// Open the host reference device with default settings.
    pub fn open_host() -> Result<Self> {
        Self::open(&DeviceConfig::host())
    }

    fn open_host_backend(config: &DeviceConfig, workgroup: WorkgroupSize) -> Result<Self> {
        if !config.matches_name(HOST_DEVICE_NAME) {
            return Err(PipelineError::DeviceUnavailable {
                reason: format!(
                    "no device matches name filter {:?}",
                    config.device_name.as_deref().unwrap_or_default()
                ),
            });
        }
        let budget = config.budget();
        let info = DeviceInfo {
            name: HOST_DEVICE_NAME.to_string(),
            backend: BackendKind::Host,
            memory_bytes: budget,
            max_buffer_bytes: budget,
            profile: config.profile,
            workgroup,
        };
        Ok(Self::with_backend(Box::new(HostBackend::new()), info))
    }

    /// Wrap a custom backend.
    pub fn with_backend(backend: Box<dyn Backend>, info: DeviceInfo) -> Self {
        log::info!("opened device: {info}");
        DeviceContext {
            shared: Arc::new(ContextShared {
                info,
                state: Mutex::new(ContextState {
                    backend: Some(backend),
                    allocations: HashMap::new(),
                    next_id: 1,
                    bytes_in_use: 0,
                    peak_bytes: 0,
                }),
            }),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Release every live buffer and the device queue. Buffers allocated
    /// from this context report `StaleHandle` afterwards. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().backend.is_none()
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.shared.state.lock().allocations.len()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.shared.state.lock().bytes_in_use
    }

    /// High-water mark of `bytes_in_use` since the context was opened.
    pub fn peak_bytes(&self) -> u64 {
        self.shared.state.lock().peak_bytes
    }

    /// Bytes the context can still hand out.
    pub fn available_bytes(&self) -> u64 {
        let st = self.shared.state.lock();
        self.shared.info.memory_bytes.saturating_sub(st.bytes_in_use)
    }

    /// Block until all submitted device work has finished.
    pub fn synchronize(&self) {
        if let Some(b) = self.shared.state.lock().backend.as_mut() {
            b.synchronize();
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("info", &self.shared.info)
            .field("live_buffers", &self.live_buffers())
            .finish()
    }
}

impl ContextShared {
    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn close(&self) {
        let mut st = self.state.lock();
        let Some(mut backend) = st.backend.take() else {
            return;
        };
        let leaked = st.allocations.len();
        for id in st.allocations.keys() {
            backend.free(*id);
        }
        st.allocations.clear();
        st.bytes_in_use = 0;
        if leaked > 0 {
            log::debug!("closing device `{}` released {leaked} live buffer(s)", self.info.name);
        }
        log::info!("closed device `{}`", self.info.name);
    }

    pub(crate) fn allocate(&self, desc: &TensorDesc) -> Result<BufferId> {
        desc.shape.validate()?;
        let mut st = self.state.lock();
        let st = &mut *st;
        let backend = st.backend.as_mut().ok_or(PipelineError::StaleHandle { id: 0 })?;

        let requested = desc.size_bytes();
        let free = self.info.memory_bytes.saturating_sub(st.bytes_in_use);
        let available = free.min(self.info.max_buffer_bytes);
        if requested > available {
            return Err(PipelineError::OutOfDeviceMemory { requested, available });
        }

        let id = BufferId(st.next_id);
        st.next_id += 1;
        backend.allocate(id, desc)?;
        st.allocations.insert(id, desc.clone());
        st.bytes_in_use += requested;
        st.peak_bytes = st.peak_bytes.max(st.bytes_in_use);
        log::debug!("allocate {id} {desc} ({requested} bytes, {} in use)", st.bytes_in_use);
        Ok(id)
    }

    /// Free `id`. Returns false if it was not live (already released, or
    /// the context is closed).
    pub(crate) fn free(&self, id: BufferId) -> bool {
        let mut st = self.state.lock();
        let Some(desc) = st.allocations.remove(&id) else {
            return false;
        };
        st.bytes_in_use = st.bytes_in_use.saturating_sub(desc.size_bytes());
        if let Some(b) = st.backend.as_mut() {
            b.free(id);
        }
        log::debug!("release {id} {desc}");
        true
    }

    pub(crate) fn is_live(&self, id: BufferId) -> bool {
        self.state.lock().allocations.contains_key(&id)
    }

    pub(crate) fn write(&self, id: BufferId, bytes: &[u8]) -> Result<()> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let desc = st.allocations.get(&id).ok_or(PipelineError::StaleHandle { id: id.0 })?;
        if bytes.len() as u64 != desc.size_bytes() {
            return Err(PipelineError::shape(
                desc.shape.clone(),
                crate::tensor::Shape::new([bytes.len() / desc.dtype.size_bytes().max(1)]),
                format!("write of {} bytes into a {} byte buffer", bytes.len(), desc.size_bytes()),
            ));
        }
        let backend = st.backend.as_mut().ok_or(PipelineError::StaleHandle { id: id.0 })?;
        backend.write(id, bytes)
    }

    pub(crate) fn read(&self, id: BufferId) -> Result<Vec<u8>> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let desc = st.allocations.get(&id).ok_or(PipelineError::StaleHandle { id: id.0 })?;
        let backend = st.backend.as_mut().ok_or(PipelineError::StaleHandle { id: id.0 })?;
        backend.read(id, desc)
    }

    /// Dispatch one kernel. All buffers must be live.
    pub(crate) fn launch(
        &self,
        op: &str,
        kernel: &Kernel,
        inputs: &[BufferId],
        outputs: &[BufferId],
        params: &Params,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let bind = |id: &BufferId| -> Result<BufferBinding> {
            let desc = st.allocations.get(id).ok_or(PipelineError::StaleHandle { id: id.0 })?;
            Ok(BufferBinding { id: *id, desc: desc.clone() })
        };
        let in_bindings = inputs.iter().map(bind).collect::<Result<Vec<_>>>()?;
        let out_bindings = outputs.iter().map(bind).collect::<Result<Vec<_>>>()?;
        if let Some(dup) = outputs.iter().find(|o| inputs.contains(o)) {
            return Err(KernelError::new(
                KernelError::BAD_INPUT,
                format!("buffer {dup} bound as both input and output"),
            )
            .into_pipeline(op));
        }
        let backend = st.backend.as_mut().ok_or(PipelineError::StaleHandle { id: 0 })?;
        log::debug!("launch `{op}` inputs {inputs:?} outputs {outputs:?}");
        backend
            .launch(&Launch {
                op,
                kernel,
                inputs: &in_bindings,
                outputs: &out_bindings,
                params,
            })
            .map_err(|e| e.into_pipeline(op))
    }
}

/// Weak handle from a buffer back to its context.
pub(crate) type ContextRef = Weak<ContextShared>;
