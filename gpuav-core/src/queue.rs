//! Submission-time synchronization and diagnostic harvesting.
//!
//! A submission with no validated work costs nothing here. When validated
//! work is present, a per-queue helper command buffer carrying a
//! device-to-host memory barrier is submitted behind the batch and the
//! queue is idled, trading latency for a readback that is guaranteed to
//! observe every GPU write of the batch.

use hal::{Api, CommandEncoder as _, Device as _, Queue as _};

use crate::binding::status_word;
use crate::context::ValidationContext;
use crate::id::{CommandBufferId, QueueId};
use crate::record;
use crate::report::{self, ObjectRef};
use crate::track::WrittenState;

impl<A: Api> ValidationContext<A> {
    /// Called before the driver sees the submission: descriptors that were
    /// deferred at record time (update-after-bind) and have been written
    /// since get their status patched into the mapped input blocks.
    pub fn pre_queue_submit(&mut self, submits: &[&[CommandBufferId]]) {
        if self.aborted {
            return;
        }
        for cb in self.submitted_command_buffers(submits) {
            self.update_instrumentation_buffer(cb);
        }
    }

    /// Called after the driver accepted the submission. Decides whether
    /// any validated work exists, synchronizes, and decodes every
    /// diagnostic buffer the batch touched.
    pub fn post_queue_submit(
        &mut self,
        queue_id: QueueId,
        queue: &mut A::Queue,
        queue_family: u32,
        submits: &[&[CommandBufferId]],
    ) {
        if self.aborted {
            return;
        }
        // First use of a queue is the earliest point the build validator
        // can bootstrap itself (it needs somewhere to submit the
        // replacement structure build).
        self.initialize_acceleration_structure_validation(queue);
        if self.aborted {
            return;
        }

        if !self.has_validated_work(submits) {
            return;
        }

        self.submit_barrier(queue_id, queue, queue_family);
        if unsafe { queue.wait_idle() }.is_err() {
            self.report_setup_problem(
                ObjectRef::Queue(queue_id),
                "Queue wait-idle failed; diagnostic buffers were not read back.",
            );
            return;
        }

        for submit in submits {
            for &cb in submit.iter() {
                let secondaries = self
                    .command_buffers
                    .get(&cb)
                    .map(|state| state.linked_secondaries.clone())
                    .unwrap_or_default();
                self.process_instrumentation_buffers(queue_id, cb);
                self.process_acceleration_structure_builds(cb);
                for secondary in secondaries {
                    self.process_instrumentation_buffers(queue_id, secondary);
                    self.process_acceleration_structure_builds(secondary);
                }
            }
        }
    }

    fn submitted_command_buffers(&self, submits: &[&[CommandBufferId]]) -> Vec<CommandBufferId> {
        let mut all = Vec::new();
        for submit in submits {
            for &cb in submit.iter() {
                all.push(cb);
                if let Some(state) = self.command_buffers.get(&cb) {
                    all.extend_from_slice(&state.linked_secondaries);
                }
            }
        }
        all
    }

    fn has_validated_work(&self, submits: &[&[CommandBufferId]]) -> bool {
        self.submitted_command_buffers(submits)
            .iter()
            .any(|cb| {
                self.command_buffers
                    .get(cb)
                    .map_or(false, |state| !state.resources.is_empty() || state.has_accel_build)
            })
    }

    fn update_instrumentation_buffer(&mut self, cb: CommandBufferId) {
        let mut resources = match self.command_buffers.get_mut(&cb) {
            Some(state) => std::mem::take(&mut state.resources),
            None => return,
        };
        for entry in resources.iter_mut() {
            let input = match entry.di_input_block.as_mut() {
                Some(input) if !input.update_at_submit.is_empty() => input,
                _ => continue,
            };
            let patches: Vec<(u32, u32)> = input
                .update_at_submit
                .iter()
                .filter_map(|deferred| {
                    let state = self.descriptor_sets.get(&deferred.set)?;
                    match state.state(deferred.index)? {
                        WrittenState::NotWritten => None,
                        written => Some((deferred.word_index, status_word(written))),
                    }
                })
                .collect();
            if patches.is_empty() {
                continue;
            }
            // Host visible, so no GPU synchronization is needed for this.
            let _ = unsafe {
                self.mem
                    .with_mapping(&self.device, &mut input.block, |bytes| {
                        for &(word_index, value) in &patches {
                            let offset = word_index as usize * 4;
                            if offset + 4 <= bytes.len() {
                                bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
                            }
                        }
                    })
            };
        }
        if let Some(state) = self.command_buffers.get_mut(&cb) {
            state.resources = resources;
        }
    }

    /// Lazily record and submit the per-queue barrier command buffer that
    /// makes GPU writes available to the host.
    fn submit_barrier(&mut self, queue_id: QueueId, queue: &mut A::Queue, queue_family: u32) {
        if !self.queue_barriers.contains_key(&queue_id) {
            let encoder = unsafe { self.record_barrier_encoder(queue_family) };
            if encoder.is_none() {
                self.report_setup_problem(
                    ObjectRef::Queue(queue_id),
                    "Unable to create barrier command buffer.",
                );
            }
            self.queue_barriers.insert(queue_id, encoder);
        }
        if let Some(Some(encoder)) = self.queue_barriers.get(&queue_id) {
            let _ = unsafe { queue.submit(&[encoder]) };
        }
    }

    unsafe fn record_barrier_encoder(&self, queue_family: u32) -> Option<A::CommandEncoder> {
        let mut encoder = self.device.create_command_encoder(queue_family).ok()?;
        if encoder.begin().is_err() {
            self.device.destroy_command_encoder(encoder);
            return None;
        }
        encoder.pipeline_barrier(
            hal::PipelineStages::ALL_COMMANDS,
            hal::PipelineStages::HOST,
            &[hal::MemoryBarrier {
                src_access: hal::AccessFlags::MEMORY_WRITE,
                dst_access: hal::AccessFlags::HOST_READ,
            }],
            &[],
        );
        if encoder.end().is_err() {
            self.device.destroy_command_encoder(encoder);
            return None;
        }
        Some(encoder)
    }

    fn process_instrumentation_buffers(&mut self, queue_id: QueueId, cb: CommandBufferId) {
        let eligible = self
            .command_buffers
            .get(&cb)
            .map_or(false, |state| state.has_validated_commands());
        if !eligible {
            return;
        }
        let mut resources = match self.command_buffers.get_mut(&cb) {
            Some(state) => std::mem::take(&mut state.resources),
            None => return,
        };

        // Draws, dispatches and traces are counted independently so the
        // report can say "Draw 2" rather than a global ordinal.
        let mut operation_indices = [0u32; gvt::BindPoint::COUNT];
        for entry in resources.iter_mut() {
            let operation_index = operation_indices[entry.bind_point.index()];
            operation_indices[entry.bind_point.index()] += 1;

            let sink = self.sink.as_ref();
            let shader_map = &self.shader_map;
            let bind_point = entry.bind_point;
            let command_kind = entry.command_kind;
            let _ = unsafe {
                self.mem
                    .with_mapping(&self.device, &mut entry.output_block, |bytes| {
                        let mut words: Vec<u32> = bytes
                            .chunks_exact(4)
                            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                            .collect();
                        if words.first().copied().unwrap_or(0) != 0 {
                            let shader_id = words
                                .get(record::RECORD_START_OFFSET + record::REC_SHADER_ID)
                                .copied()
                                .unwrap_or(0);
                            let tracker = shader_map.get(&shader_id);
                            report::analyze_output_buffer(
                                sink,
                                ObjectRef::Queue(queue_id),
                                cb,
                                bind_point,
                                command_kind,
                                operation_index,
                                tracker,
                                &mut words,
                            );
                            for (chunk, word) in bytes.chunks_exact_mut(4).zip(&words) {
                                chunk.copy_from_slice(&word.to_ne_bytes());
                            }
                        }
                    })
            };
        }

        if let Some(state) = self.command_buffers.get_mut(&cb) {
            state.resources = resources;
        }
    }
}
