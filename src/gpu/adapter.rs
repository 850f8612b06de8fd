// gpu/adapter.rs — wgpu adapter selection and per-profile device limits.
//
// ADAPTER SELECTION
// ──────────────────
// wgpu's default `request_adapter` uses power-preference heuristics that
// happily return llvmpipe/softpipe (a software rasterizer reporting itself
// as a valid device). We enumerate explicitly and rank:
//
//   DiscreteGpu / IntegratedGpu   real hardware              ← preferred
//   VirtualGpu / Other            VM pass-through, dzn       ← acceptable
//   Cpu                           llvmpipe / software        ← last resort
//
// A configured device-name filter is applied before ranking. If nothing
// passes the filter the open fails with `DeviceUnavailable`.
//
// DEVICE LIMITS
// ──────────────
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch against the requested limits, so
// a workload that would fail on a Raspberry Pi fails the same way on the
// development machine.

use std::fmt;

use crate::device::{DeviceConfig, DeviceProfile};

/// Adapter information cached for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl AdapterInfo {
    pub(crate) fn from_wgpu(info: &wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: info.name.clone(),
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Rank of a device type; lower is better.
pub(crate) fn adapter_rank(device_type: wgpu::DeviceType) -> u8 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 2,
        wgpu::DeviceType::Cpu => 3,
    }
}

/// Pick the best adapter that passes the config's name filter.
pub(crate) fn select_adapter(adapters: Vec<wgpu::Adapter>, config: &DeviceConfig) -> Option<wgpu::Adapter> {
    for a in &adapters {
        log::debug!("candidate adapter: {}", AdapterInfo::from_wgpu(&a.get_info()));
    }
    adapters
        .into_iter()
        .filter(|a| config.matches_name(&a.get_info().name))
        .min_by_key(|a| adapter_rank(a.get_info().device_type))
}

/// Limits to request for the given profile.
pub(crate) fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::RaspberryPi => wgpu::Limits {
            // V3DV reports 256 invocations and caps each dimension at 256.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 4 GiB shared with the CPU; keep single bindings modest.
            max_storage_buffer_binding_size: DeviceProfile::MAX_BUFFER_BYTES as u32,
            ..wgpu::Limits::default()
        },
    }
}
