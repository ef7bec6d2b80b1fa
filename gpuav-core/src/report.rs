//! Decoding of diagnostic records into violation reports, and the sink
//! they are delivered to.

use std::fmt::Write as _;

use spirv::Op;

use crate::context::ShaderTracker;
use crate::id::CommandBufferId;
use crate::instrument::module::{literal_string_words, SpirvModule};
use crate::record::{self, ErrorKind};
use crate::vuid;
use gvt::{BindPoint, CommandKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportLevel {
    Error,
    Warning,
    Info,
}

/// The driver-side object a report is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectRef {
    Device,
    Queue(crate::id::QueueId),
    CommandBuffer(CommandBufferId),
    Pipeline(crate::id::PipelineId),
    AccelerationStructure(crate::id::AccelerationStructureId),
}

/// Downstream consumer of everything the layer has to say: detected
/// application bugs and the layer's own setup problems alike.
pub trait ReportSink: Send + Sync {
    fn report(&self, level: ReportLevel, object: ObjectRef, vuid: &str, message: &str);
}

/// Default sink forwarding to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, level: ReportLevel, object: ObjectRef, vuid: &str, message: &str) {
        match level {
            ReportLevel::Error => log::error!("[{}] {} ({:?})", vuid, message, object),
            ReportLevel::Warning => log::warn!("[{}] {} ({:?})", vuid, message, object),
            ReportLevel::Info => log::info!("[{}] {} ({:?})", vuid, message, object),
        }
    }
}

/// Decode one output block and deliver at most one violation report.
/// The consumed part of the block is zeroed afterwards so the block can be
/// reused without a fresh allocation.
pub(crate) fn analyze_output_buffer(
    sink: &dyn ReportSink,
    object: ObjectRef,
    command_buffer: CommandBufferId,
    bind_point: BindPoint,
    command_kind: CommandKind,
    operation_index: u32,
    tracker: Option<&ShaderTracker>,
    buffer: &mut [u32],
) {
    let total_words = match buffer.first() {
        Some(&words) => words,
        None => return,
    };
    // Zero means the instrumentation had nothing to say.
    if total_words == 0 {
        return;
    }
    if buffer.len() < record::OUTPUT_BUFFER_WORDS {
        sink.report(
            ReportLevel::Error,
            object,
            vuid::INTERNAL_ERROR,
            "Diagnostic output buffer is shorter than one record.",
        );
        buffer[0] = 0;
        return;
    }

    let rec = &buffer[record::RECORD_START_OFFSET..];
    let (validation_message, vuid_str) = if rec[record::REC_VERSION] != record::STREAM_VERSION {
        (
            format!(
                "Internal Error (record version {} does not match decoder version {}). ",
                rec[record::REC_VERSION],
                record::STREAM_VERSION
            ),
            vuid::INTERNAL_ERROR,
        )
    } else {
        validation_message(rec, command_kind)
    };
    let stage = stage_message(rec);
    let common = common_message(rec, command_buffer, bind_point, operation_index, tracker);
    let (filename, source) = match tracker {
        Some(tracker) => source_messages(&tracker.words, rec[record::REC_INSTRUCTION_INDEX]),
        None => (String::new(), String::new()),
    };

    let message = format!(
        "{} {} {} {}{}",
        validation_message, common, stage, filename, source
    );
    sink.report(ReportLevel::Error, object, vuid_str, &message);

    // Clear the consumed region: the count word plus as much of the record
    // as the shader reported writing.
    let words_to_clear =
        1 + (rec[record::REC_LEN] as usize).min(record::RECORD_WORDS);
    for word in buffer.iter_mut().take(words_to_clear) {
        *word = 0;
    }
}

fn validation_message(rec: &[u32], kind: CommandKind) -> (String, &'static str) {
    let mut msg = String::new();
    let vuid_str;
    match ErrorKind::from_word(rec[record::REC_ERROR_KIND]) {
        Some(ErrorKind::DescriptorIndexOob) => {
            let _ = write!(
                msg,
                "Index of {} used to index descriptor array of length {}. ",
                rec[record::REC_PARAM_0],
                rec[record::REC_PARAM_1]
            );
            vuid_str = vuid::DESCRIPTOR_OOB;
        }
        Some(ErrorKind::DescriptorUninitialized) => {
            let _ = write!(
                msg,
                "Descriptor index {} is uninitialized.",
                rec[record::REC_PARAM_0]
            );
            vuid_str = vuid::DESCRIPTOR_UNINITIALIZED;
        }
        Some(ErrorKind::DeviceAddressUnallocated) => {
            let address =
                rec[record::REC_PARAM_0] as u64 | (rec[record::REC_PARAM_1] as u64) << 32;
            let _ = write!(msg, "Device address {:#x} access out of bounds. ", address);
            vuid_str = vuid::DEVICE_ADDRESS_OOB;
        }
        Some(buffer_kind @ ErrorKind::UniformBufferOob)
        | Some(buffer_kind @ ErrorKind::StorageBufferOob)
        | Some(buffer_kind @ ErrorKind::UniformTexelOob)
        | Some(buffer_kind @ ErrorKind::StorageTexelOob) => {
            let size = rec[record::REC_PARAM_1];
            if size == 0 {
                // A zero-sized descriptor reads as never initialized.
                let _ = write!(
                    msg,
                    "Descriptor index {} is uninitialized.",
                    rec[record::REC_PARAM_0]
                );
                vuid_str = vuid::DESCRIPTOR_UNINITIALIZED;
            } else {
                let texel = matches!(
                    buffer_kind,
                    ErrorKind::UniformTexelOob | ErrorKind::StorageTexelOob
                );
                let unit = if texel { " texels" } else { "" };
                let what = if texel { "texel" } else { "byte" };
                let _ = write!(
                    msg,
                    "Descriptor index {} access out of bounds. Descriptor size is {}{} and highest {} accessed was {}",
                    rec[record::REC_PARAM_0],
                    size,
                    unit,
                    what,
                    rec[record::REC_PARAM_2]
                );
                let vuids = vuid::vuids_for(kind);
                vuid_str = match buffer_kind {
                    ErrorKind::UniformBufferOob | ErrorKind::UniformTexelOob => {
                        vuids.uniform_access_oob
                    }
                    _ => vuids.storage_access_oob,
                };
            }
        }
        None => {
            let _ = write!(
                msg,
                "Internal Error (unexpected error type = {}). ",
                rec[record::REC_ERROR_KIND]
            );
            vuid_str = vuid::INTERNAL_ERROR;
        }
    }
    (msg, vuid_str)
}

fn stage_message(rec: &[u32]) -> String {
    let w0 = rec[record::REC_STAGE_WORD_0];
    let w1 = rec[record::REC_STAGE_WORD_1];
    let w2 = rec[record::REC_STAGE_WORD_2];
    match rec[record::REC_STAGE] {
        m if m == spirv::ExecutionModel::Vertex as u32 => format!(
            "Stage = Vertex. Vertex Index = {} Instance Index = {}. ",
            w0, w1
        ),
        m if m == spirv::ExecutionModel::TessellationControl as u32 => format!(
            "Stage = Tessellation Control. Invocation ID = {}, Primitive ID = {}. ",
            w0, w1
        ),
        m if m == spirv::ExecutionModel::TessellationEvaluation as u32 => format!(
            "Stage = Tessellation Eval. Primitive ID = {}, TessCoord (u, v) = ({}, {}). ",
            w0,
            f32::from_bits(w1),
            f32::from_bits(w2)
        ),
        m if m == spirv::ExecutionModel::Geometry as u32 => format!(
            "Stage = Geometry. Primitive ID = {} Invocation ID = {}. ",
            w0, w1
        ),
        m if m == spirv::ExecutionModel::Fragment as u32 => format!(
            "Stage = Fragment. Fragment coord (x, y) = ({}, {}). ",
            f32::from_bits(w0),
            f32::from_bits(w1)
        ),
        m if m == spirv::ExecutionModel::GLCompute as u32 => format!(
            "Stage = Compute. Global invocation ID (x, y, z) = ({}, {}, {}). ",
            w0, w1, w2
        ),
        m if (5313..=5318).contains(&m) => {
            let name = match m {
                5313 => "Ray Generation",
                5314 => "Intersection",
                5315 => "Any Hit",
                5316 => "Closest Hit",
                5317 => "Miss",
                _ => "Callable",
            };
            format!(
                "Stage = {}. Global Launch ID (x, y, z) = ({}, {}, {}). ",
                name, w0, w1, w2
            )
        }
        5267 => format!(
            "Stage = Task. Global invocation ID (x, y, z) = ({}, {}, {}). ",
            w0, w1, w2
        ),
        5268 => format!(
            "Stage = Mesh. Global invocation ID (x, y, z) = ({}, {}, {}). ",
            w0, w1, w2
        ),
        other => format!("Internal Error (unexpected stage = {}). ", other),
    }
}

fn common_message(
    rec: &[u32],
    command_buffer: CommandBufferId,
    bind_point: BindPoint,
    operation_index: u32,
    tracker: Option<&ShaderTracker>,
) -> String {
    let mut msg = match tracker {
        Some(tracker) => {
            let pipeline = tracker
                .pipeline
                .map(|id| format!("{}", id))
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "Command buffer {}. {} Index {}. Pipeline {}. Shader Module {}. ",
                command_buffer,
                bind_point.operation_name(),
                operation_index,
                pipeline,
                tracker.shader_module,
            )
        }
        None => format!(
            "Internal Error: Unable to locate information for shader used in command buffer {}. ",
            command_buffer
        ),
    };
    let _ = write!(
        msg,
        "Shader Instruction Index = {}. ",
        rec[record::REC_INSTRUCTION_INDEX]
    );
    msg
}

/// Recover source-level context from the original module: the `OpLine`
/// preceding the faulting instruction, the filename it points at, and the
/// offending source line quoted out of `OpSource` text.
fn source_messages(words: &[u32], instruction_index: u32) -> (String, String) {
    let module = match SpirvModule::parse(words) {
        Ok(module) => module,
        Err(_) => return (String::new(), String::new()),
    };

    let mut reported_file_id = 0;
    let mut reported_line = 0u32;
    let mut reported_column = 0u32;
    for (index, ins) in module.instructions.iter().enumerate() {
        if ins.is(Op::Line) && ins.operands.len() >= 3 {
            reported_file_id = ins.operands[0];
            reported_line = ins.operands[1];
            reported_column = ins.operands[2];
        }
        if index as u32 == instruction_index {
            break;
        }
    }

    if reported_file_id == 0 {
        return (
            "Unable to find SPIR-V OpLine for source information. Build shader with debug info to get source information.".to_string(),
            String::new(),
        );
    }

    let mut filename_msg = String::new();
    let mut reported_filename = String::new();
    for ins in &module.instructions {
        if ins.is(Op::String) && ins.operands.first() == Some(&reported_file_id) {
            reported_filename = decode_literal_string(&ins.operands, 1);
            if reported_filename.is_empty() {
                let _ = write!(
                    filename_msg,
                    "Shader validation error occurred at line {}",
                    reported_line
                );
            } else {
                let _ = write!(
                    filename_msg,
                    "Shader validation error occurred in file {} at line {}",
                    reported_filename, reported_line
                );
            }
            if reported_column > 0 {
                let _ = write!(filename_msg, ", column {}", reported_column);
            }
            filename_msg.push('.');
            break;
        }
    }
    if filename_msg.is_empty() {
        let _ = write!(
            filename_msg,
            "Unable to find SPIR-V OpString for file id {} from OpLine instruction.",
            reported_file_id
        );
    }

    let source_msg = source_line_message(&module, reported_file_id, &reported_filename, reported_line);
    (filename_msg, source_msg)
}

fn source_line_message(
    module: &SpirvModule,
    file_id: u32,
    reported_filename: &str,
    reported_line: u32,
) -> String {
    let lines = read_op_source(module, file_id);
    if lines.is_empty() {
        return "Unable to find SPIR-V OpSource.".to_string();
    }

    // Find the `#line` directive closest to, but not after, the reported
    // line, staying within the reported file.
    let mut current_filename = reported_filename.to_string();
    let mut best: Option<(u32, usize)> = None;
    for (offset, line) in lines.iter().enumerate() {
        let (parsed_line, parsed_file) = match parse_line_directive(line) {
            Some(parsed) => parsed,
            None => continue,
        };
        if let Some(file) = parsed_file {
            current_filename = file;
        }
        if current_filename == reported_filename && reported_line >= parsed_line {
            match best {
                Some((previous, _)) if reported_line - parsed_line > reported_line - previous => {}
                _ => best = Some((parsed_line, offset)),
            }
        }
    }

    match best {
        Some((line_number, offset)) => {
            let index = (reported_line - line_number) as usize + 1 + offset;
            match lines.get(index) {
                Some(text) => format!("\n{}: {}", reported_line, text),
                None => format!(
                    "Internal error: calculated source line of {} for source size of {} lines.",
                    index,
                    lines.len()
                ),
            }
        }
        None => "Unable to find suitable #line directive in SPIR-V OpSource.".to_string(),
    }
}

/// Collect the `OpSource` text (plus continuations) for a file, split into
/// lines.
fn read_op_source(module: &SpirvModule, file_id: u32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut collecting = false;
    for ins in &module.instructions {
        if ins.is(Op::Source) {
            collecting = ins.operands.get(2) == Some(&file_id) && ins.operands.len() > 3;
            if collecting {
                let text = decode_literal_string(&ins.operands, 3);
                lines.extend(text.lines().map(str::to_string));
            }
        } else if ins.is(Op::SourceContinued) {
            if collecting {
                let text = decode_literal_string(&ins.operands, 0);
                lines.extend(text.lines().map(str::to_string));
            }
        } else if collecting && !ins.is(Op::String) {
            // Source text for one file is contiguous.
            break;
        }
    }
    lines
}

fn decode_literal_string(operands: &[u32], start: usize) -> String {
    let len = literal_string_words(operands, start);
    let mut bytes = Vec::with_capacity(len * 4);
    for &word in &operands[start..start + len] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse `#line <number> ["<filename>"]`.
fn parse_line_directive(line: &str) -> Option<(u32, Option<String>)> {
    let rest = line.trim_start();
    let rest = rest.strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("line")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim_start();
    let number_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if number_end == 0 {
        return None;
    }
    let number: u32 = rest[..number_end].parse().ok()?;
    let rest = rest[number_end..].trim_start();
    let filename = if rest.len() >= 2 && rest.starts_with('"') {
        rest[1..].find('"').map(|end| rest[1..1 + end].to_string())
    } else {
        None
    };
    Some((number, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{PipelineId, ShaderModuleId};
    use std::sync::Mutex;

    pub(crate) struct CapturingSink {
        pub reports: Mutex<Vec<(ReportLevel, String, String)>>,
    }

    impl CapturingSink {
        pub fn new() -> Self {
            Self {
                reports: Mutex::new(Vec::new()),
            }
        }
    }

    impl ReportSink for CapturingSink {
        fn report(&self, level: ReportLevel, _object: ObjectRef, vuid: &str, message: &str) {
            self.reports
                .lock()
                .unwrap()
                .push((level, vuid.to_string(), message.to_string()));
        }
    }

    fn record_buffer(kind: ErrorKind, p0: u32, p1: u32, p2: u32) -> Vec<u32> {
        let mut buffer = vec![0u32; record::OUTPUT_BUFFER_WORDS];
        buffer[0] = record::RECORD_WORDS as u32;
        let rec = &mut buffer[record::RECORD_START_OFFSET..];
        rec[record::REC_LEN] = record::RECORD_WORDS as u32;
        rec[record::REC_VERSION] = record::STREAM_VERSION;
        rec[record::REC_SHADER_ID] = 9;
        rec[record::REC_INSTRUCTION_INDEX] = 42;
        rec[record::REC_STAGE] = spirv::ExecutionModel::GLCompute as u32;
        rec[record::REC_STAGE_WORD_0] = 1;
        rec[record::REC_STAGE_WORD_1] = 2;
        rec[record::REC_STAGE_WORD_2] = 3;
        rec[record::REC_ERROR_KIND] = kind as u32;
        rec[record::REC_PARAM_0] = p0;
        rec[record::REC_PARAM_1] = p1;
        rec[record::REC_PARAM_2] = p2;
        buffer
    }

    fn tracker() -> ShaderTracker {
        ShaderTracker {
            pipeline: Some(PipelineId(0x30)),
            shader_module: ShaderModuleId(0x40),
            words: Vec::new(),
        }
    }

    fn decode(sink: &CapturingSink, buffer: &mut [u32], kind: CommandKind) {
        let tracker = tracker();
        analyze_output_buffer(
            sink,
            ObjectRef::Device,
            CommandBufferId(0x10),
            kind.bind_point(),
            kind,
            0,
            Some(&tracker),
            buffer,
        );
    }

    #[test]
    fn storage_oob_scenario() {
        // A compute shader read at byte 128 of a 64-byte storage buffer.
        let sink = CapturingSink::new();
        let mut buffer = record_buffer(ErrorKind::StorageBufferOob, 0, 64, 128);
        decode(&sink, &mut buffer, CommandKind::Dispatch);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let (level, vuid_str, message) = &reports[0];
        assert_eq!(*level, ReportLevel::Error);
        assert_eq!(vuid_str, "VUID-vkCmdDispatch-None-02706");
        assert!(message.contains("Descriptor size is 64"));
        assert!(message.contains("highest byte accessed was 128"));
        assert!(message.contains("Stage = Compute"));
        assert!(message.contains("Global invocation ID (x, y, z) = (1, 2, 3)"));
    }

    #[test]
    fn decode_is_idempotent_then_clears() {
        let sink = CapturingSink::new();
        let buffer = record_buffer(ErrorKind::DescriptorIndexOob, 8, 4, 0);

        let mut first = buffer.clone();
        decode(&sink, &mut first, CommandKind::Draw);
        let mut second = buffer.clone();
        decode(&sink, &mut second, CommandKind::Draw);

        {
            let reports = sink.reports.lock().unwrap();
            assert_eq!(reports.len(), 2);
            assert_eq!(reports[0].2, reports[1].2);
            assert!(reports[0]
                .2
                .contains("Index of 8 used to index descriptor array of length 4"));
        }

        // The consumed region is zeroed, so a third decode sees nothing.
        assert!(first.iter().all(|&word| word == 0));
        decode(&sink, &mut first, CommandKind::Draw);
        assert_eq!(sink.reports.lock().unwrap().len(), 2);
    }

    #[test]
    fn zero_size_buffer_oob_reads_as_uninitialized() {
        let sink = CapturingSink::new();
        let mut buffer = record_buffer(ErrorKind::UniformBufferOob, 3, 0, 16);
        decode(&sink, &mut buffer, CommandKind::Draw);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].1, vuid::DESCRIPTOR_UNINITIALIZED);
        assert!(reports[0].2.contains("Descriptor index 3 is uninitialized."));
    }

    #[test]
    fn unknown_kind_is_internal_error() {
        let sink = CapturingSink::new();
        let mut buffer = record_buffer(ErrorKind::DescriptorIndexOob, 0, 0, 0);
        buffer[record::RECORD_START_OFFSET + record::REC_ERROR_KIND] = 0xdead;
        decode(&sink, &mut buffer, CommandKind::Draw);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].1, vuid::INTERNAL_ERROR);
    }

    #[test]
    fn version_mismatch_is_internal_error() {
        let sink = CapturingSink::new();
        let mut buffer = record_buffer(ErrorKind::DescriptorIndexOob, 1, 2, 0);
        buffer[record::RECORD_START_OFFSET + record::REC_VERSION] = 999;
        decode(&sink, &mut buffer, CommandKind::Draw);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].1, vuid::INTERNAL_ERROR);
        assert!(reports[0].2.contains("record version 999"));
    }

    #[test]
    fn device_address_report_carries_the_address() {
        let sink = CapturingSink::new();
        let mut buffer = record_buffer(
            ErrorKind::DeviceAddressUnallocated,
            0xdead_beef,
            0x1,
            0,
        );
        decode(&sink, &mut buffer, CommandKind::Dispatch);
        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports[0].1, vuid::DEVICE_ADDRESS_OOB);
        assert!(reports[0].2.contains("0x1deadbeef"));
    }

    #[test]
    fn empty_buffer_reports_nothing() {
        let sink = CapturingSink::new();
        let mut buffer = vec![0u32; record::OUTPUT_BUFFER_WORDS];
        decode(&sink, &mut buffer, CommandKind::Draw);
        assert!(sink.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn line_directive_parsing() {
        assert_eq!(parse_line_directive("#line 12"), Some((12, None)));
        assert_eq!(
            parse_line_directive("  # line 7 \"shader.comp\""),
            Some((7, Some("shader.comp".to_string())))
        );
        assert_eq!(parse_line_directive("int x = 0;"), None);
        assert_eq!(parse_line_directive("#linear"), None);
    }
}
