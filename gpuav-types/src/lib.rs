/*! Plain data types shared between the GPU-assisted validation core and its
 *  hardware abstraction layer.
 */

use std::env;

bitflags::bitflags! {
    /// Shader stages a descriptor binding is visible to.
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESSELLATION_CONTROL = 1 << 1;
        const TESSELLATION_EVALUATION = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const TASK = 1 << 6;
        const MESH = 1 << 7;
        const RAY_GENERATION = 1 << 8;
        const ANY_HIT = 1 << 9;
        const CLOSEST_HIT = 1 << 10;
        const MISS = 1 << 11;
        const INTERSECTION = 1 << 12;
        const CALLABLE = 1 << 13;
        const ALL_GRAPHICS = Self::VERTEX.bits | Self::TESSELLATION_CONTROL.bits
            | Self::TESSELLATION_EVALUATION.bits | Self::GEOMETRY.bits | Self::FRAGMENT.bits;
        const ALL_RAY_TRACING = Self::RAY_GENERATION.bits | Self::ANY_HIT.bits
            | Self::CLOSEST_HIT.bits | Self::MISS.bits | Self::INTERSECTION.bits
            | Self::CALLABLE.bits;
    }
}

/// Pipeline bind point of a validated command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
    RayTracing,
}

impl BindPoint {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::RayTracing => 2,
        }
    }

    /// Human readable operation noun used in violation reports.
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::Graphics => "Draw",
            Self::Compute => "Compute",
            Self::RayTracing => "Ray Trace",
        }
    }
}

/// The command that triggered per-command validation resource allocation.
///
/// Used to pick the exact violation identifier for an out-of-bounds report
/// and to route the command to the right operation counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    DrawIndirectCount,
    DrawIndexedIndirectCount,
    DrawIndirectByteCount,
    DrawMeshTasks,
    DrawMeshTasksIndirect,
    DrawMeshTasksIndirectCount,
    Dispatch,
    DispatchIndirect,
    DispatchBase,
    TraceRays,
    TraceRaysIndirect,
}

impl CommandKind {
    pub fn bind_point(self) -> BindPoint {
        match self {
            Self::Draw
            | Self::DrawIndexed
            | Self::DrawIndirect
            | Self::DrawIndexedIndirect
            | Self::DrawIndirectCount
            | Self::DrawIndexedIndirectCount
            | Self::DrawIndirectByteCount
            | Self::DrawMeshTasks
            | Self::DrawMeshTasksIndirect
            | Self::DrawMeshTasksIndirectCount => BindPoint::Graphics,
            Self::Dispatch | Self::DispatchIndirect | Self::DispatchBase => BindPoint::Compute,
            Self::TraceRays | Self::TraceRaysIndirect => BindPoint::RayTracing,
        }
    }

    /// The API entry point this kind corresponds to.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Draw => "vkCmdDraw",
            Self::DrawIndexed => "vkCmdDrawIndexed",
            Self::DrawIndirect => "vkCmdDrawIndirect",
            Self::DrawIndexedIndirect => "vkCmdDrawIndexedIndirect",
            Self::DrawIndirectCount => "vkCmdDrawIndirectCount",
            Self::DrawIndexedIndirectCount => "vkCmdDrawIndexedIndirectCount",
            Self::DrawIndirectByteCount => "vkCmdDrawIndirectByteCountEXT",
            Self::DrawMeshTasks => "vkCmdDrawMeshTasksNV",
            Self::DrawMeshTasksIndirect => "vkCmdDrawMeshTasksIndirectNV",
            Self::DrawMeshTasksIndirectCount => "vkCmdDrawMeshTasksIndirectCountNV",
            Self::Dispatch => "vkCmdDispatch",
            Self::DispatchIndirect => "vkCmdDispatchIndirect",
            Self::DispatchBase => "vkCmdDispatchBase",
            Self::TraceRays => "vkCmdTraceRaysKHR",
            Self::TraceRaysIndirect => "vkCmdTraceRaysIndirectKHR",
        }
    }
}

/// Configuration toggles, read once when the validation context is created.
#[derive(Clone, Debug)]
pub struct GpuValidationSettings {
    /// Instrument shaders with out-of-bounds buffer access checks. Forced
    /// off when the device already runs with robust buffer access.
    pub buffer_oob: bool,
    /// Track descriptor-indexing style descriptor arrays (lengths, write
    /// status, update-after-bind patching).
    pub descriptor_indexing: bool,
    /// Hide one descriptor set slot from the application so the diagnostics
    /// set always has room.
    pub reserve_binding_slot: bool,
}

impl Default for GpuValidationSettings {
    fn default() -> Self {
        Self {
            buffer_oob: true,
            descriptor_indexing: true,
            reserve_binding_slot: true,
        }
    }
}

impl GpuValidationSettings {
    /// Layered configuration: defaults, overridden by `GPUAV_*` environment
    /// variables where present.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_flag("GPUAV_BUFFER_OOB") {
            settings.buffer_oob = v;
        }
        if let Some(v) = env_flag("GPUAV_DESCRIPTOR_INDEXING") {
            settings.descriptor_indexing = v;
        }
        if let Some(v) = env_flag("GPUAV_RESERVE_BINDING_SLOT") {
            settings.reserve_binding_slot = v;
        }
        settings
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) => match value.as_str() {
            "1" | "true" | "on" => Some(true),
            "0" | "false" | "off" => Some(false),
            _ => None,
        },
        Err(_) => None,
    }
}

/// Device features the layer inspects at context creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCapabilities {
    /// Vulkan-style packed API version of the device.
    pub api_version: u32,
    pub vertex_pipeline_stores_and_atomics: bool,
    pub fragment_stores_and_atomics: bool,
    pub shader_int64: bool,
    /// Robust buffer access is already enabled, making shader-side buffer
    /// bounds checks redundant.
    pub robust_buffer_access: bool,
    pub descriptor_indexing: bool,
    pub buffer_device_address: bool,
    pub ray_tracing: bool,
}

pub const API_VERSION_1_1: u32 = 1 << 22 | 1 << 12;

impl DeviceCapabilities {
    pub fn supports_required_features(&self) -> bool {
        self.api_version >= API_VERSION_1_1
            && self.vertex_pipeline_stores_and_atomics
            && self.fragment_stores_and_atomics
    }
}

/// Device limits the layer consumes.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub max_bound_descriptor_sets: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_bound_descriptor_sets: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_routing() {
        assert_eq!(CommandKind::DrawIndexed.bind_point(), BindPoint::Graphics);
        assert_eq!(CommandKind::DispatchBase.bind_point(), BindPoint::Compute);
        assert_eq!(CommandKind::TraceRays.bind_point(), BindPoint::RayTracing);
    }

    #[test]
    fn required_features() {
        let mut caps = DeviceCapabilities {
            api_version: API_VERSION_1_1,
            vertex_pipeline_stores_and_atomics: true,
            fragment_stores_and_atomics: true,
            ..Default::default()
        };
        assert!(caps.supports_required_features());
        caps.api_version = 1 << 22;
        assert!(!caps.supports_required_features());
    }
}
