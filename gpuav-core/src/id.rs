//! Opaque handles for the application-owned driver objects the layer
//! tracks but never dereferences.

use std::fmt;

macro_rules! define_ids {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({:#x})"), self.0)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{:#x}", self.0)
                }
            }
        )*
    };
}

define_ids! {
    QueueId,
    CommandBufferId,
    BufferId,
    ShaderModuleId,
    PipelineId,
    DescriptorSetLayoutId,
    DescriptorSetId,
    AccelerationStructureId,
}
