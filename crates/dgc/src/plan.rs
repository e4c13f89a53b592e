//! Output buffer layout.
//!
//! ```text
//! | main trailer | main preamble | main | secondary trailer | secondary preamble | secondary | upload |
//! ```
//!
//! Every region starts and ends on the region alignment so any of them can be handed to a command
//! engine as an indirect buffer, provided the buffer itself starts on that alignment.
//!
//! Only the main trailer and preamble have offsets independent of the sequence count; the
//! secondary regions and the upload area follow the main body and move with it.
//!
//! The same function runs on the host (sizing, submission) and in the generator program (slot
//! addresses), so it must stay a pure function of its inputs.

use dgc_packets::JUMP_PACKET_BYTES;

use crate::arena::align_up;
use crate::config::{DeviceRules, DgcConfig, Engine};
use crate::cost::SequenceCost;

/// Byte range relative to the start of the output buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    MainTrailer,
    MainPreamble,
    Main,
    SecondaryTrailer,
    SecondaryPreamble,
    Secondary,
    Upload,
}

/// Which command stream of a generated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Primary,
    Secondary,
}

/// Whether a request with these inputs goes through a preamble.
///
/// Only worth it when the real count lives on the GPU and the maximum is large enough that
/// executing the NOP padding of unused slots would cost more than the extra jump.
pub fn use_preamble(has_count_address: bool, max_sequence_count: u32, config: &DgcConfig) -> bool {
    has_count_address && max_sequence_count >= config.preamble_threshold
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdbufLayout {
    pub main_trailer: Region,
    pub main_preamble: Region,
    pub main: Region,
    pub secondary_trailer: Region,
    pub secondary_preamble: Region,
    pub secondary: Region,
    pub upload: Region,

    pub primary_stride: u32,
    pub secondary_stride: u32,
    pub upload_stride: u32,
    pub sequence_count: u32,
    pub use_preamble: bool,
    pub alignment: u64,
    pub total_size: u64,
}

impl CmdbufLayout {
    pub fn plan(
        cost: &SequenceCost,
        sequence_count: u32,
        use_preamble: bool,
        rules: &DeviceRules,
        primary_engine: Engine,
    ) -> Self {
        let has_secondary = cost.has_secondary();
        let mut alignment = rules.engine(primary_engine).region_alignment();
        if has_secondary {
            alignment = alignment.max(rules.compute.region_alignment());
        }
        let count = u64::from(sequence_count);
        let jump = u64::from(JUMP_PACKET_BYTES);
        let aligned = |size: u64| align_up(size, alignment);
        let preamble = if use_preamble { aligned(jump) } else { 0 };

        let mut cursor = 0u64;
        let mut take = |size: u64| {
            let region = Region {
                offset: cursor,
                size,
            };
            cursor += size;
            region
        };

        let main_trailer = take(aligned(jump));
        let main_preamble = take(preamble);
        let main = take(aligned(count * u64::from(cost.primary_stride) + jump));
        let (secondary_trailer, secondary_preamble, secondary) = if has_secondary {
            (
                take(aligned(jump)),
                take(preamble),
                take(aligned(count * u64::from(cost.secondary_stride) + jump)),
            )
        } else {
            (take(0), take(0), take(0))
        };
        let upload = take(aligned(count * u64::from(cost.upload_stride)));

        Self {
            main_trailer,
            main_preamble,
            main,
            secondary_trailer,
            secondary_preamble,
            secondary,
            upload,
            primary_stride: cost.primary_stride,
            secondary_stride: cost.secondary_stride,
            upload_stride: cost.upload_stride,
            sequence_count,
            use_preamble,
            alignment,
            total_size: cursor,
        }
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary_stride != 0
    }

    pub fn regions(&self) -> [(RegionKind, Region); 7] {
        [
            (RegionKind::MainTrailer, self.main_trailer),
            (RegionKind::MainPreamble, self.main_preamble),
            (RegionKind::Main, self.main),
            (RegionKind::SecondaryTrailer, self.secondary_trailer),
            (RegionKind::SecondaryPreamble, self.secondary_preamble),
            (RegionKind::Secondary, self.secondary),
            (RegionKind::Upload, self.upload),
        ]
    }

    pub fn trailer(&self, stream: Stream) -> Region {
        match stream {
            Stream::Primary => self.main_trailer,
            Stream::Secondary => self.secondary_trailer,
        }
    }

    pub fn preamble(&self, stream: Stream) -> Region {
        match stream {
            Stream::Primary => self.main_preamble,
            Stream::Secondary => self.secondary_preamble,
        }
    }

    pub fn body(&self, stream: Stream) -> Region {
        match stream {
            Stream::Primary => self.main,
            Stream::Secondary => self.secondary,
        }
    }

    pub fn stride(&self, stream: Stream) -> u32 {
        match stream {
            Stream::Primary => self.primary_stride,
            Stream::Secondary => self.secondary_stride,
        }
    }

    /// Bytes of the stream body the engine executes when `effective` sequences are live.
    ///
    /// Without a preamble the engine always runs the whole body; with one, the preamble's jump
    /// covers just the live slots plus the closing jump.
    pub fn executed_size(&self, stream: Stream, effective: u32) -> u64 {
        let body = self.body(stream);
        if self.use_preamble {
            let live = u64::from(effective.min(self.sequence_count)) * u64::from(self.stride(stream));
            align_up(live + u64::from(JUMP_PACKET_BYTES), self.alignment).min(body.size)
        } else {
            body.size
        }
    }

    /// Offset inside the body where the slots written by sequence threads stop.
    ///
    /// Everything from here to the end of the body belongs to thread 0.
    pub fn tail_start(&self, stream: Stream, effective: u32) -> u64 {
        let count = if self.use_preamble {
            effective.min(self.sequence_count)
        } else {
            self.sequence_count
        };
        u64::from(count) * u64::from(self.stride(stream))
    }

    /// Where the engine enters `stream`: the preamble when present, the body otherwise.
    pub fn entry(&self, stream: Stream) -> Region {
        if self.use_preamble {
            self.preamble(stream)
        } else {
            self.body(stream)
        }
    }

    pub fn upload_slot(&self, sequence: u32) -> u64 {
        self.upload.offset + u64::from(sequence) * u64::from(self.upload_stride)
    }
}
