//! Host-side mirrors of the application state the layer needs: what is
//! bound on each command buffer, what every tracked descriptor set
//! contains, and a capture/restore value for the compute binding state the
//! acceleration-structure validator temporarily disturbs.

use std::ops::Range;
use std::sync::Arc;

use hal::{Api, CommandEncoder as _};
use smallvec::SmallVec;

use crate::accel::AccelBuildResources;
use crate::binding::ValidationResources;
use crate::id::{CommandBufferId, DescriptorSetId, PipelineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    UniformTexelBuffer,
    StorageTexelBuffer,
    /// Inline uniform blocks are tracked as a single scalar and never
    /// validated.
    InlineUniform,
    Other,
}

impl DescriptorKind {
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::UniformBuffer
                | Self::StorageBuffer
                | Self::UniformTexelBuffer
                | Self::StorageTexelBuffer
        )
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorBindingLayout {
    pub binding: u32,
    pub count: u32,
    pub kind: DescriptorKind,
    pub update_after_bind: bool,
    /// Actual count supplied at set allocation time; only valid on the
    /// highest binding.
    pub variable_count: bool,
}

#[derive(Debug)]
pub struct DescriptorSetLayoutInfo {
    bindings: Vec<DescriptorBindingLayout>,
    max_binding: u32,
}

impl DescriptorSetLayoutInfo {
    pub fn new(mut bindings: Vec<DescriptorBindingLayout>) -> Self {
        bindings.sort_by_key(|binding| binding.binding);
        let max_binding = bindings.last().map_or(0, |binding| binding.binding);
        Self {
            bindings,
            max_binding,
        }
    }

    pub fn bindings(&self) -> &[DescriptorBindingLayout] {
        &self.bindings
    }

    pub fn max_binding(&self) -> u32 {
        self.max_binding
    }

    pub fn binding(&self, binding: u32) -> Option<&DescriptorBindingLayout> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    pub fn has_buffers(&self) -> bool {
        self.bindings.iter().any(|binding| binding.kind.is_buffer())
    }

    fn binding_count(&self, binding: &DescriptorBindingLayout, variable_count: u32) -> u32 {
        if binding.variable_count {
            variable_count
        } else {
            binding.count
        }
    }

    pub fn total_descriptors(&self, variable_count: u32) -> u32 {
        self.bindings
            .iter()
            .map(|binding| self.binding_count(binding, variable_count))
            .sum()
    }

    /// Flat descriptor index range covered by a binding.
    pub fn index_range(&self, binding: u32, variable_count: u32) -> Option<Range<u32>> {
        let mut start = 0;
        for candidate in &self.bindings {
            let count = self.binding_count(candidate, variable_count);
            if candidate.binding == binding {
                return Some(start..start + count);
            }
            start += count;
        }
        None
    }
}

/// What one descriptor slot currently holds.
#[derive(Clone, Debug, PartialEq)]
pub enum WrittenState {
    NotWritten,
    Buffer { size: Option<u64> },
    TexelBuffer { size: Option<u64> },
    Other,
}

#[derive(Debug)]
pub struct DescriptorSetState {
    pub layout: Arc<DescriptorSetLayoutInfo>,
    pub variable_count: u32,
    written: Vec<WrittenState>,
}

impl DescriptorSetState {
    pub fn new(layout: Arc<DescriptorSetLayoutInfo>, variable_count: u32) -> Self {
        let total = layout.total_descriptors(variable_count) as usize;
        Self {
            layout,
            variable_count,
            written: vec![WrittenState::NotWritten; total],
        }
    }

    pub fn write(&mut self, binding: u32, array_element: u32, states: &[WrittenState]) {
        let range = match self.layout.index_range(binding, self.variable_count) {
            Some(range) => range,
            None => return,
        };
        let start = (range.start + array_element) as usize;
        for (offset, state) in states.iter().enumerate() {
            let index = start + offset;
            if index >= range.end as usize {
                break;
            }
            if let Some(slot) = self.written.get_mut(index) {
                *slot = state.clone();
            }
        }
    }

    pub fn state(&self, index: u32) -> Option<&WrittenState> {
        self.written.get(index as usize)
    }
}

#[derive(Clone, Debug)]
pub struct BoundPipeline<A: Api> {
    pub id: PipelineId,
    pub raw: A::Pipeline,
    pub layout: A::PipelineLayout,
    pub layout_set_count: u32,
}

#[derive(Clone, Debug)]
pub struct BoundDescriptorSet<A: Api> {
    pub id: DescriptorSetId,
    pub raw: A::DescriptorSet,
    pub dynamic_offsets: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct PushConstantData {
    pub stages: gvt::ShaderStages,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Last-bound state for one bind point.
#[derive(Clone, Debug)]
pub struct BoundState<A: Api> {
    pub pipeline: Option<BoundPipeline<A>>,
    pub sets: Vec<Option<BoundDescriptorSet<A>>>,
}

impl<A: Api> Default for BoundState<A> {
    fn default() -> Self {
        Self {
            pipeline: None,
            sets: Vec::new(),
        }
    }
}

impl<A: Api> BoundState<A> {
    pub fn bind_sets(&mut self, first_set: u32, sets: Vec<BoundDescriptorSet<A>>) {
        let needed = first_set as usize + sets.len();
        if self.sets.len() < needed {
            self.sets.resize_with(needed, || None);
        }
        for (offset, set) in sets.into_iter().enumerate() {
            self.sets[first_set as usize + offset] = Some(set);
        }
    }
}

/// Everything the layer tracks per command buffer.
pub struct CommandBufferState<A: Api> {
    pub resources: Vec<ValidationResources<A>>,
    pub accel_builds: Vec<AccelBuildResources<A>>,
    pub has_draw: bool,
    pub has_dispatch: bool,
    pub has_trace: bool,
    pub has_accel_build: bool,
    pub linked_secondaries: SmallVec<[CommandBufferId; 4]>,
    /// Push constant data is shared across bind points, like the API it
    /// mirrors.
    pub push_constants: Vec<PushConstantData>,
    bound: [BoundState<A>; gvt::BindPoint::COUNT],
}

impl<A: Api> Default for CommandBufferState<A> {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            accel_builds: Vec::new(),
            has_draw: false,
            has_dispatch: false,
            has_trace: false,
            has_accel_build: false,
            linked_secondaries: SmallVec::new(),
            push_constants: Vec::new(),
            bound: Default::default(),
        }
    }
}

impl<A: Api> CommandBufferState<A> {
    pub fn bound(&self, bind_point: gvt::BindPoint) -> &BoundState<A> {
        &self.bound[bind_point.index()]
    }

    pub fn bound_mut(&mut self, bind_point: gvt::BindPoint) -> &mut BoundState<A> {
        &mut self.bound[bind_point.index()]
    }

    pub fn mark_command(&mut self, bind_point: gvt::BindPoint) {
        match bind_point {
            gvt::BindPoint::Graphics => self.has_draw = true,
            gvt::BindPoint::Compute => self.has_dispatch = true,
            gvt::BindPoint::RayTracing => self.has_trace = true,
        }
    }

    pub fn has_validated_commands(&self) -> bool {
        self.has_draw || self.has_dispatch || self.has_trace
    }
}

/// Snapshot of the binding state the injected validation dispatch
/// clobbers, taken before the dispatch and replayed right after.
#[derive(Clone)]
pub struct CapturedBindingState<A: Api> {
    bind_point: gvt::BindPoint,
    state: BoundState<A>,
    push_constants: Vec<PushConstantData>,
}

impl<A: Api> CapturedBindingState<A> {
    pub fn capture(state: &CommandBufferState<A>, bind_point: gvt::BindPoint) -> Self {
        Self {
            bind_point,
            state: state.bound(bind_point).clone(),
            push_constants: state.push_constants.clone(),
        }
    }

    pub unsafe fn restore(&self, encoder: &mut A::CommandEncoder) {
        let pipeline = match &self.state.pipeline {
            Some(pipeline) => pipeline,
            None => return,
        };
        encoder.bind_pipeline(self.bind_point, &pipeline.raw);
        for (index, slot) in self.state.sets.iter().enumerate() {
            if let Some(set) = slot {
                encoder.bind_descriptor_sets(
                    self.bind_point,
                    &pipeline.layout,
                    index as u32,
                    &[&set.raw],
                    &set.dynamic_offsets,
                );
            }
        }
        for push in &self.push_constants {
            encoder.push_constants(&pipeline.layout, push.stages, push.offset, &push.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> DescriptorSetLayoutInfo {
        DescriptorSetLayoutInfo::new(vec![
            DescriptorBindingLayout {
                binding: 2,
                count: 4,
                kind: DescriptorKind::StorageBuffer,
                update_after_bind: false,
                variable_count: false,
            },
            DescriptorBindingLayout {
                binding: 0,
                count: 1,
                kind: DescriptorKind::Other,
                update_after_bind: false,
                variable_count: false,
            },
        ])
    }

    #[test]
    fn index_ranges_follow_binding_order() {
        let layout = layout();
        assert_eq!(layout.max_binding(), 2);
        assert_eq!(layout.index_range(0, 0), Some(0..1));
        assert_eq!(layout.index_range(2, 0), Some(1..5));
        assert_eq!(layout.index_range(1, 0), None);
        assert_eq!(layout.total_descriptors(0), 5);
    }

    #[test]
    fn variable_count_applies_to_flagged_binding() {
        let layout = DescriptorSetLayoutInfo::new(vec![DescriptorBindingLayout {
            binding: 0,
            count: 0,
            kind: DescriptorKind::StorageBuffer,
            update_after_bind: true,
            variable_count: true,
        }]);
        assert_eq!(layout.index_range(0, 12), Some(0..12));
        assert_eq!(layout.total_descriptors(12), 12);
    }

    #[test]
    fn writes_update_flat_slots() {
        let mut state = DescriptorSetState::new(Arc::new(layout()), 0);
        state.write(
            2,
            1,
            &[
                WrittenState::Buffer { size: Some(64) },
                WrittenState::Buffer { size: None },
            ],
        );
        assert_eq!(state.state(1), Some(&WrittenState::NotWritten));
        assert_eq!(state.state(2), Some(&WrittenState::Buffer { size: Some(64) }));
        assert_eq!(state.state(3), Some(&WrittenState::Buffer { size: None }));
        assert_eq!(state.state(4), Some(&WrittenState::NotWritten));
    }

    #[test]
    fn writes_never_cross_their_binding() {
        let mut state = DescriptorSetState::new(Arc::new(layout()), 0);
        state.write(0, 0, &[WrittenState::Other, WrittenState::Other]);
        // Binding 0 holds a single descriptor; the overflow is dropped.
        assert_eq!(state.state(0), Some(&WrittenState::Other));
        assert_eq!(state.state(1), Some(&WrittenState::NotWritten));
    }
}
