//! Word layout of the diagnostic stream written by instrumented shaders.
//!
//! The output block bound at binding 0 of the reserved descriptor set is a
//! storage buffer of 32-bit words:
//!
//! | word | contents |
//! |------|----------|
//! | 0    | number of words the instrumentation wanted to write; 0 means no violation |
//! | 1..  | the first (and, with the default buffer size, only) record |
//!
//! A record is [`RECORD_WORDS`] words, offsets relative to its first word:
//!
//! | offset | contents |
//! |--------|----------|
//! | 0      | record length in words |
//! | 1      | stream layout version ([`STREAM_VERSION`]) |
//! | 2      | unique shader id |
//! | 3      | index of the faulting instruction in the original module |
//! | 4      | execution model of the reporting stage |
//! | 5..=7  | stage payload (vertex/instance index, fragment coordinate, invocation id, launch id) |
//! | 8      | error kind |
//! | 9..=11 | kind payload |
//!
//! Both the instrumentation pass (producer) and the decoder (consumer) are
//! compiled against these constants; the version word catches a mismatch
//! between the two at decode time instead of producing garbage reports.

/// Bumped whenever the record layout changes.
pub const STREAM_VERSION: u32 = 2;

/// Buffer word holding the written-word count.
pub const WRITTEN_COUNT_OFFSET: usize = 0;
/// Buffer word where the first record starts.
pub const RECORD_START_OFFSET: usize = 1;

pub const REC_LEN: usize = 0;
pub const REC_VERSION: usize = 1;
pub const REC_SHADER_ID: usize = 2;
pub const REC_INSTRUCTION_INDEX: usize = 3;
pub const REC_STAGE: usize = 4;
pub const REC_STAGE_WORD_0: usize = 5;
pub const REC_STAGE_WORD_1: usize = 6;
pub const REC_STAGE_WORD_2: usize = 7;
pub const REC_ERROR_KIND: usize = 8;
pub const REC_PARAM_0: usize = 9;
pub const REC_PARAM_1: usize = 10;
pub const REC_PARAM_2: usize = 11;

pub const RECORD_WORDS: usize = 12;
pub const OUTPUT_BUFFER_WORDS: usize = RECORD_START_OFFSET + RECORD_WORDS;
pub const OUTPUT_BUFFER_BYTES: u64 = (OUTPUT_BUFFER_WORDS * 4) as u64;

/// Violation kinds an instrumented shader can report.
///
/// Zero is deliberately not a valid kind: a zero-filled record decodes as an
/// internal error rather than a plausible violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    /// Descriptor array indexed past its declared length.
    /// Payload: (attempted index, declared length).
    DescriptorIndexOob = 1,
    /// Descriptor slot read without ever having been written.
    /// Payload: (descriptor array index,).
    DescriptorUninitialized = 2,
    /// Load or store through a device address no allocated buffer covers.
    /// Payload: (address low, address high).
    DeviceAddressUnallocated = 3,
    /// Uniform buffer access past the bound range.
    /// Payload: (descriptor array index, declared size, highest byte accessed).
    UniformBufferOob = 4,
    /// Storage buffer access past the bound range. Payload as above.
    StorageBufferOob = 5,
    /// Uniform texel buffer access past the bound range; sizes and offsets
    /// are in texels. Payload as above.
    UniformTexelOob = 6,
    /// Storage texel buffer access past the bound range. Payload as above.
    StorageTexelOob = 7,
}

impl ErrorKind {
    pub fn from_word(word: u32) -> Option<Self> {
        Some(match word {
            1 => Self::DescriptorIndexOob,
            2 => Self::DescriptorUninitialized,
            3 => Self::DeviceAddressUnallocated,
            4 => Self::UniformBufferOob,
            5 => Self::StorageBufferOob,
            6 => Self::UniformTexelOob,
            7 => Self::StorageTexelOob,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_contiguous() {
        assert_eq!(REC_STAGE_WORD_2 + 1, REC_ERROR_KIND);
        assert_eq!(REC_PARAM_2 + 1, RECORD_WORDS);
        assert_eq!(OUTPUT_BUFFER_WORDS, 13);
    }

    #[test]
    fn error_kind_round_trip() {
        for &kind in &[
            ErrorKind::DescriptorIndexOob,
            ErrorKind::DescriptorUninitialized,
            ErrorKind::DeviceAddressUnallocated,
            ErrorKind::UniformBufferOob,
            ErrorKind::StorageBufferOob,
            ErrorKind::UniformTexelOob,
            ErrorKind::StorageTexelOob,
        ] {
            assert_eq!(ErrorKind::from_word(kind as u32), Some(kind));
        }
        assert_eq!(ErrorKind::from_word(0), None);
        assert_eq!(ErrorKind::from_word(8), None);
    }
}
