//! Violation identifier strings, selected by the command kind recorded
//! with each validated operation.

use gvt::CommandKind;

pub(crate) const UNASSIGNED: &str = "UNASSIGNED-GPU-Assisted-Validation";
pub(crate) const SETUP_ERROR: &str = "UNASSIGNED-GPU-Assisted Validation Error";
pub(crate) const SETUP_WARNING: &str = "UNASSIGNED-GPU-Assisted Validation Warning";
pub(crate) const DESCRIPTOR_OOB: &str = "UNASSIGNED-Descriptor index out of bounds";
pub(crate) const DESCRIPTOR_UNINITIALIZED: &str = "UNASSIGNED-Descriptor uninitialized";
pub(crate) const DEVICE_ADDRESS_OOB: &str = "UNASSIGNED-Device address out of bounds";
pub(crate) const INTERNAL_ERROR: &str = "UNASSIGNED-Internal Error";
pub(crate) const ACCELERATION_STRUCTURE: &str = "UNASSIGNED-AccelerationStructure";

#[derive(Clone, Copy, Debug)]
pub(crate) struct GpuVuid {
    pub uniform_access_oob: &'static str,
    pub storage_access_oob: &'static str,
}

const UNDEFINED: GpuVuid = GpuVuid {
    uniform_access_oob: UNASSIGNED,
    storage_access_oob: UNASSIGNED,
};

macro_rules! oob_vuids {
    ($name:literal) => {
        GpuVuid {
            uniform_access_oob: concat!("VUID-", $name, "-None-02705"),
            storage_access_oob: concat!("VUID-", $name, "-None-02706"),
        }
    };
}

pub(crate) fn vuids_for(kind: CommandKind) -> &'static GpuVuid {
    macro_rules! table {
        ($($kind:ident => $name:literal,)*) => {
            match kind {
                $(CommandKind::$kind => {
                    const VUID: GpuVuid = oob_vuids!($name);
                    &VUID
                })*
                #[allow(unreachable_patterns)]
                _ => &UNDEFINED,
            }
        };
    }
    table! {
        Draw => "vkCmdDraw",
        DrawIndexed => "vkCmdDrawIndexed",
        DrawIndirect => "vkCmdDrawIndirect",
        DrawIndexedIndirect => "vkCmdDrawIndexedIndirect",
        DrawIndirectCount => "vkCmdDrawIndirectCount",
        DrawIndexedIndirectCount => "vkCmdDrawIndexedIndirectCount",
        DrawIndirectByteCount => "vkCmdDrawIndirectByteCountEXT",
        DrawMeshTasks => "vkCmdDrawMeshTasksNV",
        DrawMeshTasksIndirect => "vkCmdDrawMeshTasksIndirectNV",
        DrawMeshTasksIndirectCount => "vkCmdDrawMeshTasksIndirectCountNV",
        Dispatch => "vkCmdDispatch",
        DispatchIndirect => "vkCmdDispatchIndirect",
        DispatchBase => "vkCmdDispatchBase",
        TraceRays => "vkCmdTraceRaysKHR",
        TraceRaysIndirect => "vkCmdTraceRaysIndirectKHR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vuids_match_the_command() {
        assert_eq!(
            vuids_for(CommandKind::Draw).uniform_access_oob,
            "VUID-vkCmdDraw-None-02705"
        );
        assert_eq!(
            vuids_for(CommandKind::DispatchIndirect).storage_access_oob,
            "VUID-vkCmdDispatchIndirect-None-02706"
        );
    }
}
