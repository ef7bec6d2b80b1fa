//! Per-command validation resources: one output block per validated draw,
//! dispatch or trace, plus the descriptor-indexing and device-address
//! input tables the instrumented shader consults, all bound as the
//! reserved diagnostics descriptor set.

use std::collections::BTreeMap;

use arrayvec::ArrayVec;
use hal::{Api, CommandEncoder as _, Device as _};

use crate::alloc::{DeviceMemoryBlock, DiagnosticSet};
use crate::context::ValidationContext;
use crate::id::{CommandBufferId, DescriptorSetId};
use crate::record;
use crate::report::ObjectRef;
use crate::track::{DescriptorKind, DescriptorSetState, WrittenState};
use gvt::{BindPoint, CommandKind};

/// A descriptor that was still unwritten at record time and must be
/// rechecked when the batch is submitted (update-after-bind).
#[derive(Clone, Debug, PartialEq)]
pub struct DeferredDescriptorUpdate {
    /// Word to patch inside the mapped input block.
    pub word_index: u32,
    pub set: DescriptorSetId,
    /// Flat descriptor index within the set.
    pub index: u32,
}

/// The descriptor-indexing input block plus its submit-time worklist.
pub struct InputMemoryBlock<A: Api> {
    pub(crate) block: DeviceMemoryBlock<A>,
    pub(crate) update_at_submit: Vec<DeferredDescriptorUpdate>,
}

/// Everything allocated for one validated command.
pub struct ValidationResources<A: Api> {
    pub(crate) output_block: DeviceMemoryBlock<A>,
    pub(crate) di_input_block: Option<InputMemoryBlock<A>>,
    pub(crate) bda_input_block: Option<DeviceMemoryBlock<A>>,
    pub(crate) desc_set: DiagnosticSet<A>,
    pub(crate) bind_point: BindPoint,
    pub(crate) command_kind: CommandKind,
}

/// Status word for one descriptor slot: 0 = never written, otherwise the
/// buffer size (capped to 32 bits), `u32::MAX` for null resources and 1
/// for non-buffer descriptors.
pub(crate) fn status_word(state: &WrittenState) -> u32 {
    match state {
        WrittenState::NotWritten => 0,
        WrittenState::Buffer { size: None } | WrittenState::TexelBuffer { size: None } => u32::MAX,
        WrittenState::Buffer { size: Some(size) }
        | WrittenState::TexelBuffer { size: Some(size) } => (*size).min(u32::MAX as u64) as u32,
        WrittenState::Other => 1,
    }
}

pub(crate) struct DescriptorInput {
    pub words: Vec<u32>,
    pub deferred: Vec<DeferredDescriptorUpdate>,
}

/// Serialize the bound descriptor sets into the offset-table format the
/// instrumented shader walks.
///
/// With descriptor indexing the layout is
/// `[sets_to_bindings_start, sets_to_sizes[S], sizes[B], sets_to_bindings[S],
/// bindings_to_written[B], written[D]]`; without it the two size regions
/// are omitted and word 0 is 1. In both variants the status of
/// `(set, binding, index)` resolves as
/// `w[w[w[w[0] + set] + binding] + index]`.
pub(crate) fn build_descriptor_input(
    sets: &[Option<(DescriptorSetId, &DescriptorSetState)>],
    descriptor_indexing: bool,
) -> DescriptorInput {
    let set_count = sets.len() as u32;
    let mut binding_slots = 0u32;
    let mut descriptor_count = 0u32;
    for slot in sets {
        if let Some((_, state)) = slot {
            if !state.layout.bindings().is_empty() {
                binding_slots += state.layout.max_binding() + 1;
                descriptor_count += state.layout.total_descriptors(state.variable_count);
            }
        }
    }

    let words_needed = if descriptor_indexing {
        1 + 2 * set_count + 2 * binding_slots + descriptor_count
    } else {
        1 + set_count + binding_slots + descriptor_count
    } as usize;
    let mut words = vec![0u32; words_needed];
    let mut deferred = Vec::new();

    // Absolute index of the first per-set binding slot region.
    let mut bind_counter = set_count + 1;
    let mut written_index = if descriptor_indexing {
        words[0] = set_count + binding_slots + 1;
        1 + 2 * set_count + 2 * binding_slots
    } else {
        words[0] = 1;
        1 + set_count + binding_slots
    };

    for (set_index, slot) in sets.iter().enumerate() {
        let (set_id, state) = match slot {
            Some((id, state)) if !state.layout.bindings().is_empty() => (*id, *state),
            _ => continue,
        };
        let layout = &state.layout;
        if descriptor_indexing {
            // Index of this set's length table, then of its write table.
            words[1 + set_index] = bind_counter;
            let write_table_index = (words[0] + set_index as u32) as usize;
            words[write_table_index] =
                bind_counter + set_count + binding_slots;
        } else {
            words[1 + set_index] = bind_counter;
        }
        let written_table = if descriptor_indexing {
            bind_counter + set_count + binding_slots
        } else {
            bind_counter
        };

        for binding in layout.bindings() {
            let range = layout
                .index_range(binding.binding, state.variable_count)
                .unwrap_or(0..0);
            let count = range.end - range.start;
            if descriptor_indexing {
                words[(bind_counter + binding.binding) as usize] =
                    if binding.kind == DescriptorKind::InlineUniform {
                        1
                    } else {
                        count
                    };
            }
            words[(written_table + binding.binding) as usize] = written_index;

            if binding.kind == DescriptorKind::InlineUniform {
                words[written_index as usize] = u32::MAX;
                written_index += 1;
                continue;
            }

            for element in 0..count {
                let flat = range.start + element;
                match state.state(flat) {
                    Some(WrittenState::NotWritten) | None => {
                        if binding.update_after_bind {
                            deferred.push(DeferredDescriptorUpdate {
                                word_index: written_index,
                                set: set_id,
                                index: flat,
                            });
                        }
                    }
                    Some(written) => {
                        words[written_index as usize] = status_word(written);
                    }
                }
                written_index += 1;
            }
        }
        bind_counter += layout.max_binding() + 1;
    }

    DescriptorInput { words, deferred }
}

/// Serialize the device address table: a sentinel-bounded ascending
/// address run followed by the matching sizes, as 64-bit words.
pub(crate) fn build_address_table(map: &BTreeMap<u64, u64>) -> Vec<u64> {
    let count = map.len();
    let sizes_start = 3 + count;
    let mut words = vec![0u64; (count + 3) + (count + 2)];
    words[0] = sizes_start as u64;
    let mut address_index = 1;
    let mut size_index = sizes_start;
    // Null "allocation" below every real address, zero sized.
    words[address_index] = 0;
    address_index += 1;
    words[size_index] = 0;
    size_index += 1;
    for (&address, &size) in map {
        words[address_index] = address;
        address_index += 1;
        words[size_index] = size;
        size_index += 1;
    }
    words[address_index] = u64::MAX;
    words[size_index] = 0;
    words
}

fn write_u32_words(bytes: &mut [u8], words: &[u32]) {
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
}

fn write_u64_words(bytes: &mut [u8], words: &[u64]) {
    for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
}

impl<A: Api> ValidationContext<A> {
    pub(crate) fn descriptor_indexing_enabled(&self) -> bool {
        self.settings.descriptor_indexing && self.capabilities.descriptor_indexing
    }

    /// Set up the validation binding environment for one draw, dispatch or
    /// trace command. Called exactly once per eligible command, before it
    /// is recorded.
    pub fn allocate_validation_resources(
        &mut self,
        cb: CommandBufferId,
        encoder: &mut A::CommandEncoder,
        kind: CommandKind,
    ) {
        if self.aborted {
            return;
        }
        let bind_point = kind.bind_point();

        let layout = match &self.debug_layout {
            Some(layout) => layout,
            None => return,
        };
        let desc_set = match unsafe { self.desc_sets.allocate(&self.device, layout) } {
            Ok(set) => set,
            Err(_) => {
                self.abort_with(
                    ObjectRef::Device,
                    "Unable to allocate descriptor sets. Device could become unstable.",
                );
                return;
            }
        };

        // Output block sized for one record, zeroed so only GPU-written
        // error data is ever present.
        let mut output_block = match unsafe {
            self.mem.create_buffer(
                &self.device,
                record::OUTPUT_BUFFER_BYTES,
                hal::BufferUses::STORAGE,
                gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::DOWNLOAD,
            )
        } {
            Ok(block) => block,
            Err(_) => {
                unsafe { self.desc_sets.free(&self.device, desc_set) };
                self.abort_with(
                    ObjectRef::Device,
                    "Unable to allocate device memory. Device could become unstable.",
                );
                return;
            }
        };
        let _ = unsafe {
            self.mem
                .with_mapping(&self.device, &mut output_block, |bytes| {
                    for byte in bytes.iter_mut() {
                        *byte = 0;
                    }
                })
        };

        // Snapshot the bound sets of this bind point.
        let descriptor_indexing = self.descriptor_indexing_enabled();
        let (bound_pipeline, bound_set_ids) = {
            let state = self.cb_state_mut(cb);
            state.mark_command(bind_point);
            let bound = state.bound(bind_point);
            let ids: Vec<Option<DescriptorSetId>> = bound
                .sets
                .iter()
                .map(|slot| slot.as_ref().map(|set| set.id))
                .collect();
            (bound.pipeline.clone(), ids)
        };

        let mut di_input_block = None;
        if !bound_set_ids.is_empty() && (descriptor_indexing || self.settings.buffer_oob) {
            let snapshot: Vec<Option<(DescriptorSetId, &DescriptorSetState)>> = bound_set_ids
                .iter()
                .map(|slot| {
                    slot.and_then(|id| self.descriptor_sets.get(&id).map(|state| (id, state)))
                })
                .collect();
            let has_buffers = snapshot.iter().any(|slot| {
                slot.map_or(false, |(_, state)| state.layout.has_buffers())
            });
            if descriptor_indexing || has_buffers {
                let input = build_descriptor_input(&snapshot, descriptor_indexing);
                match unsafe {
                    self.mem.create_buffer(
                        &self.device,
                        (input.words.len() * 4) as u64,
                        hal::BufferUses::STORAGE,
                        gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD,
                    )
                } {
                    Ok(mut block) => {
                        let write = unsafe {
                            self.mem.with_mapping(&self.device, &mut block, |bytes| {
                                write_u32_words(bytes, &input.words)
                            })
                        };
                        if write.is_ok() {
                            di_input_block = Some(InputMemoryBlock {
                                block,
                                update_at_submit: input.deferred,
                            });
                        } else {
                            unsafe { self.mem.destroy_buffer(&self.device, block) };
                        }
                    }
                    Err(_) => {
                        unsafe {
                            self.mem.destroy_buffer(&self.device, output_block);
                            self.desc_sets.free(&self.device, desc_set);
                        }
                        self.abort_with(
                            ObjectRef::Device,
                            "Unable to allocate device memory. Device could become unstable.",
                        );
                        return;
                    }
                }
            }
        }

        let mut bda_input_block = None;
        if self.bda_checks && !self.address_map.is_empty() {
            let table = build_address_table(&self.address_map);
            match unsafe {
                self.mem.create_buffer(
                    &self.device,
                    (table.len() * 8) as u64,
                    hal::BufferUses::STORAGE,
                    gpu_alloc::UsageFlags::HOST_ACCESS | gpu_alloc::UsageFlags::UPLOAD,
                )
            } {
                Ok(mut block) => {
                    let write = unsafe {
                        self.mem.with_mapping(&self.device, &mut block, |bytes| {
                            write_u64_words(bytes, &table)
                        })
                    };
                    if write.is_ok() {
                        bda_input_block = Some(block);
                    } else {
                        unsafe { self.mem.destroy_buffer(&self.device, block) };
                    }
                }
                Err(_) => {
                    unsafe {
                        if let Some(input) = di_input_block {
                            self.mem.destroy_buffer(&self.device, input.block);
                        }
                        self.mem.destroy_buffer(&self.device, output_block);
                        self.desc_sets.free(&self.device, desc_set);
                    }
                    self.abort_with(
                        ObjectRef::Device,
                        "Unable to allocate device memory. Device could become unstable.",
                    );
                    return;
                }
            }
        }

        // One batched update for every binding present.
        {
            let mut writes: ArrayVec<hal::DescriptorWrite<'_, A>, 3> = ArrayVec::new();
            writes.push(hal::DescriptorWrite {
                set: desc_set.raw(),
                binding: 0,
                buffer: hal::BufferBinding {
                    buffer: &output_block.buffer,
                    offset: 0,
                    size: output_block.size(),
                },
            });
            if let Some(input) = &di_input_block {
                writes.push(hal::DescriptorWrite {
                    set: desc_set.raw(),
                    binding: 1,
                    buffer: hal::BufferBinding {
                        buffer: &input.block.buffer,
                        offset: 0,
                        size: input.block.size(),
                    },
                });
            }
            if let Some(block) = &bda_input_block {
                writes.push(hal::DescriptorWrite {
                    set: desc_set.raw(),
                    binding: 2,
                    buffer: hal::BufferBinding {
                        buffer: &block.buffer,
                        offset: 0,
                        size: block.size(),
                    },
                });
            }
            unsafe { self.device.update_descriptor_sets(&writes) };
        }

        // Bind right after the application's own sets, if the bound
        // pipeline left the slot free.
        match bound_pipeline {
            Some(pipeline) => {
                if pipeline.layout_set_count <= self.desc_set_bind_index {
                    unsafe {
                        encoder.bind_descriptor_sets(
                            bind_point,
                            &pipeline.layout,
                            self.desc_set_bind_index,
                            &[desc_set.raw()],
                            &[],
                        );
                    }
                }
                self.cb_state_mut(cb).resources.push(ValidationResources {
                    output_block,
                    di_input_block,
                    bda_input_block,
                    desc_set,
                    bind_point,
                    command_kind: kind,
                });
            }
            None => {
                unsafe {
                    if let Some(input) = di_input_block {
                        self.mem.destroy_buffer(&self.device, input.block);
                    }
                    if let Some(block) = bda_input_block {
                        self.mem.destroy_buffer(&self.device, block);
                    }
                    self.mem.destroy_buffer(&self.device, output_block);
                    self.desc_sets.free(&self.device, desc_set);
                }
                self.abort_with(ObjectRef::Device, "Unable to find pipeline state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{DescriptorBindingLayout, DescriptorSetLayoutInfo};
    use std::sync::Arc;

    fn state_with(
        bindings: Vec<DescriptorBindingLayout>,
        variable_count: u32,
    ) -> DescriptorSetState {
        DescriptorSetState::new(Arc::new(DescriptorSetLayoutInfo::new(bindings)), variable_count)
    }

    fn binding(
        index: u32,
        count: u32,
        kind: DescriptorKind,
        update_after_bind: bool,
    ) -> DescriptorBindingLayout {
        DescriptorBindingLayout {
            binding: index,
            count,
            kind,
            update_after_bind,
            variable_count: false,
        }
    }

    /// The dereference chain the instrumented shader performs.
    fn status(words: &[u32], set: u32, binding: u32, index: u32) -> u32 {
        let sets_to_bindings = words[0];
        let bindings_to_written = words[(sets_to_bindings + set) as usize];
        let written = words[(bindings_to_written + binding) as usize];
        words[(written + index) as usize]
    }

    fn length(words: &[u32], set: u32, binding: u32) -> u32 {
        let sizes = words[(1 + set) as usize];
        words[(sizes + binding) as usize]
    }

    #[test]
    fn descriptor_indexing_layout_resolves() {
        let mut state = state_with(
            vec![
                binding(0, 2, DescriptorKind::StorageBuffer, false),
                binding(2, 3, DescriptorKind::Other, false),
            ],
            0,
        );
        state.write(0, 0, &[WrittenState::Buffer { size: Some(64) }]);
        state.write(2, 1, &[WrittenState::Other]);

        let input = build_descriptor_input(
            &[Some((DescriptorSetId(1), &state))],
            true,
        );
        let words = &input.words;
        // 1 header + 2*1 set tables + 2*3 binding slots + 5 descriptors.
        assert_eq!(words.len(), 1 + 2 + 6 + 5);

        assert_eq!(length(words, 0, 0), 2);
        assert_eq!(length(words, 0, 2), 3);
        assert_eq!(status(words, 0, 0, 0), 64);
        assert_eq!(status(words, 0, 0, 1), 0);
        assert_eq!(status(words, 0, 2, 0), 0);
        assert_eq!(status(words, 0, 2, 1), 1);
        assert!(input.deferred.is_empty());
    }

    #[test]
    fn plain_layout_resolves_status_the_same_way() {
        let mut state = state_with(
            vec![binding(0, 2, DescriptorKind::UniformBuffer, false)],
            0,
        );
        state.write(0, 1, &[WrittenState::Buffer { size: None }]);

        let input = build_descriptor_input(
            &[Some((DescriptorSetId(3), &state))],
            false,
        );
        let words = &input.words;
        assert_eq!(words[0], 1);
        assert_eq!(words.len(), 1 + 1 + 1 + 2);
        assert_eq!(status(words, 0, 0, 0), 0);
        assert_eq!(status(words, 0, 0, 1), u32::MAX);
    }

    #[test]
    fn unwritten_update_after_bind_descriptors_are_deferred() {
        let mut state = state_with(
            vec![binding(0, 3, DescriptorKind::StorageBuffer, true)],
            0,
        );
        state.write(0, 0, &[WrittenState::Buffer { size: Some(16) }]);

        let input = build_descriptor_input(
            &[Some((DescriptorSetId(9), &state))],
            true,
        );
        assert_eq!(status(&input.words, 0, 0, 0), 16);
        // Elements 1 and 2 wait for submit time.
        let written_base = {
            let bindings_to_written = input.words[input.words[0] as usize];
            input.words[bindings_to_written as usize]
        };
        assert_eq!(
            input.deferred,
            vec![
                DeferredDescriptorUpdate {
                    word_index: written_base + 1,
                    set: DescriptorSetId(9),
                    index: 1,
                },
                DeferredDescriptorUpdate {
                    word_index: written_base + 2,
                    set: DescriptorSetId(9),
                    index: 2,
                },
            ]
        );
    }

    #[test]
    fn inline_uniform_blocks_are_opaque() {
        let state = state_with(vec![binding(0, 1, DescriptorKind::InlineUniform, false)], 0);
        let input = build_descriptor_input(&[Some((DescriptorSetId(2), &state))], true);
        assert_eq!(status(&input.words, 0, 0, 0), u32::MAX);
    }

    #[test]
    fn empty_slots_leave_zero_entries() {
        let state = state_with(vec![binding(1, 1, DescriptorKind::Other, false)], 0);
        let input = build_descriptor_input(
            &[None, Some((DescriptorSetId(5), &state))],
            true,
        );
        // Set 0 has no table pointers.
        assert_eq!(input.words[1], 0);
        assert_eq!(input.words[(input.words[0]) as usize], 0);
        assert_eq!(status(&input.words, 1, 1, 0), 0);
    }

    #[test]
    fn address_table_layout() {
        let mut map = BTreeMap::new();
        map.insert(0x1000u64, 256u64);
        map.insert(0x8000u64, 64u64);
        let words = build_address_table(&map);
        assert_eq!(
            words,
            vec![
                5,         // start of the size region
                0,         // null address
                0x1000,    // addresses, ascending
                0x8000,
                u64::MAX,  // sentinel
                0,         // size of the null region
                256,
                64,
                0,         // size of the sentinel region
            ]
        );
    }

    #[test]
    fn status_words() {
        assert_eq!(status_word(&WrittenState::NotWritten), 0);
        assert_eq!(status_word(&WrittenState::Buffer { size: Some(640) }), 640);
        assert_eq!(status_word(&WrittenState::Buffer { size: None }), u32::MAX);
        assert_eq!(status_word(&WrittenState::TexelBuffer { size: Some(4) }), 4);
        assert_eq!(status_word(&WrittenState::Other), 1);
    }
}
