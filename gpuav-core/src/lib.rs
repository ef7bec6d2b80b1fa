/*! GPU-assisted validation runtime.
 *
 *  This crate layers a small validation machine over a graphics driver
 *  exposed through the `gpuav-hal` traits: shader modules are rewritten at
 *  creation time to report invalid descriptor and memory accesses into a
 *  diagnostic buffer, every draw/dispatch/trace command gets such a buffer
 *  bound at a reserved descriptor set slot, top-level acceleration structure
 *  builds get an injected compute pass that neutralizes invalid
 *  bottom-level handles, and queue submissions are harvested for the
 *  records the GPU wrote.
 *
 *  The whole machine is fail-open: when anything about the validation
 *  plumbing itself goes wrong, it reports the problem once and gets out of
 *  the application's way.
 */

pub mod accel;
pub mod alloc;
pub mod binding;
pub mod context;
pub mod id;
pub mod instrument;
pub mod queue;
pub mod record;
pub mod report;
pub mod track;
mod vuid;

pub use accel::AccelerationStructureBuildInfo;
pub use context::{InstrumentedShader, PipelineLayoutPadding, ShaderTracker, ValidationContext};
pub use report::{LogSink, ObjectRef, ReportLevel, ReportSink};

/// Fast hash map used internally.
type FastHashMap<K, V> =
    std::collections::HashMap<K, V, std::hash::BuildHasherDefault<fxhash::FxHasher>>;
/// Fast hash set used internally.
type FastHashSet<K> =
    std::collections::HashSet<K, std::hash::BuildHasherDefault<fxhash::FxHasher>>;
