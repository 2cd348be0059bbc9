//! Engine (command-processor) classes and their capability tables.
//!
//! Alignment, segment sizing and submission capabilities differ per engine
//! and per chip generation, so they are carried as plain configuration data
//! in [`EngineInfo`] rather than hard-coded at the use sites. The table in
//! [`EngineInfo::default_table`] describes a typical discrete part; device
//! creation accepts any table, which is also how tests shrink segments down
//! to a handful of words.

use crate::packet;

/// A class of hardware command processor with its own queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EngineType {
    Graphics = 0,
    Compute = 1,
    Transfer = 2,
    VideoDecode = 3,
    VideoEncode = 4,
}

impl EngineType {
    pub const COUNT: usize = 5;

    pub const ALL: [EngineType; EngineType::COUNT] = [
        EngineType::Graphics,
        EngineType::Compute,
        EngineType::Transfer,
        EngineType::VideoDecode,
        EngineType::VideoEncode,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Capabilities and limits of one engine type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineInfo {
    /// Independently scheduled queues of this engine on the device.
    pub queue_count: u32,
    /// Submitted lengths must be a multiple of this (a power of two).
    pub align_words: u32,
    /// Filler word understood as a no-op by this engine.
    pub pad_word: u32,
    /// The engine honors chain packets linking one IB to the next.
    pub supports_chaining: bool,
    /// The kernel accepts several IB descriptors per request for this
    /// engine; if not, content must be copied into one bounded buffer.
    pub supports_multiple_ibs: bool,
    /// The kernel writes a completion fence for this engine.
    pub has_user_fence: bool,
    /// Size of a fresh first segment, in words.
    pub initial_segment_words: u32,
    /// Hard ceiling on one segment's length, in words.
    pub max_segment_words: u32,
}

impl EngineInfo {
    /// Built-in description of `engine` on a typical discrete part.
    pub const fn default_for(engine: EngineType) -> Self {
        match engine {
            EngineType::Graphics => EngineInfo {
                queue_count: 1,
                align_words: 8,
                pad_word: packet::nop_word(),
                supports_chaining: true,
                supports_multiple_ibs: true,
                has_user_fence: true,
                initial_segment_words: 4096,
                max_segment_words: packet::MAX_INDIRECT_SIZE_DW,
            },
            EngineType::Compute => EngineInfo {
                queue_count: 4,
                align_words: 8,
                pad_word: packet::nop_word(),
                supports_chaining: true,
                supports_multiple_ibs: true,
                has_user_fence: true,
                initial_segment_words: 4096,
                max_segment_words: packet::MAX_INDIRECT_SIZE_DW,
            },
            EngineType::Transfer => EngineInfo {
                queue_count: 2,
                align_words: 16,
                pad_word: 0,
                supports_chaining: false,
                supports_multiple_ibs: true,
                has_user_fence: true,
                initial_segment_words: 4096,
                max_segment_words: 0xf_fff8,
            },
            EngineType::VideoDecode | EngineType::VideoEncode => EngineInfo {
                queue_count: 2,
                align_words: 16,
                pad_word: 0x8000_0000,
                supports_chaining: false,
                supports_multiple_ibs: false,
                has_user_fence: false,
                initial_segment_words: 4096,
                max_segment_words: 0xf_fff8,
            },
        }
    }

    pub fn default_table() -> [EngineInfo; EngineType::COUNT] {
        EngineType::ALL.map(EngineInfo::default_for)
    }

    /// Streams for engines without IB support are assembled in host memory
    /// and copied into bounce buffers at submission.
    #[inline]
    pub(crate) fn uses_host_backing(&self) -> bool {
        !self.supports_chaining && !self.supports_multiple_ibs
    }

    #[inline]
    pub(crate) fn pad_mask(&self) -> u32 {
        debug_assert!(self.align_words.is_power_of_two());
        self.align_words - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_consistent() {
        for engine in EngineType::ALL {
            let info = EngineInfo::default_for(engine);
            assert!(info.align_words.is_power_of_two());
            assert!(info.initial_segment_words <= info.max_segment_words);
            if info.supports_chaining {
                // Chained growth writes through IB descriptors, so the
                // segment ceiling cannot exceed the packet's length field.
                assert!(info.max_segment_words <= packet::MAX_INDIRECT_SIZE_DW);
                assert!(info.supports_multiple_ibs);
                assert!(info.align_words >= packet::CHAIN_PACKET_WORDS);
            }
        }
    }
}
