//! Scalar parameters of one generator dispatch and the layout of its parameter blob.
//!
//! [`DgcParams`] is passed by value (root constants); everything variable-sized goes into the
//! blob, whose layout both sides derive from the scalars alone:
//!
//! ```text
//! [vertex table: vertex_binding_count * 24] [stage table: 5 * 32, static pipelines only]
//! [push word offsets: push_words * 4] [push base bytes: push_constant_size]
//! ```
//!
//! The last two are only present when the layout updates push constants.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::arena::align_up;
use crate::config::{DeviceRules, EngineRules, Engine};
use crate::metadata::STAGE_TABLE_BYTES;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ParamFlags: u32 {
        const HAS_COUNT = 1 << 0;
        const HAS_PREDICATION = 1 << 1;
        const PREDICATION_INVERTED = 1 << 2;
        const USE_PREAMBLE = 1 << 3;
        const STATIC_PIPELINE = 1 << 4;
        const TRACE_MARKERS = 1 << 5;
        const HAS_CONTINUATION = 1 << 6;
        const HAS_SECONDARY_CONTINUATION = 1 << 7;
        const PRIMARY_COMPUTE = 1 << 8;
        const PRIMARY_NESTING = 1 << 9;
        const SECONDARY_NESTING = 1 << 10;
        const DXGI_INDEX_TYPES = 1 << 11;
        /// Layout updates push constants, so the blob carries the push word sections.
        const PUSH_UPDATES = 1 << 12;
    }
}

/// Root constants of the generator program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DgcParams {
    pub output_address: u64,
    pub input_address: u64,
    pub count_address: u64,
    pub predication_address: u64,
    pub execution_set_address: u64,
    pub blob_address: u64,
    pub continuation_address: u64,
    pub secondary_continuation_address: u64,
    pub push_input_mask: u64,
    pub push_sequence_index_mask: u64,

    pub max_sequence_count: u32,
    pub input_stride: u32,
    pub primary_stride: u32,
    pub secondary_stride: u32,
    pub upload_stride: u32,
    pub flags: u32,
    pub continuation_size_dw: u32,
    pub secondary_continuation_size_dw: u32,
    pub action_offset: u32,
    pub index_buffer_offset: u32,
    pub execution_set_offset: u32,
    pub execution_set_stride: u32,
    pub execution_set_count: u32,
    pub execution_set_max_words: u32,
    pub push_constant_size: u32,
    pub vertex_binding_count: u32,
    pub bound_max_index_count: u32,
    pub primary_ib_alignment: u32,
    pub primary_pad_dw_mask: u32,
    pub compute_ib_alignment: u32,
    pub compute_pad_dw_mask: u32,
    pub reserved0: u32,
}

impl DgcParams {
    pub fn flags(&self) -> ParamFlags {
        ParamFlags::from_bits_truncate(self.flags)
    }

    pub fn primary_engine(&self) -> Engine {
        if self.flags().contains(ParamFlags::PRIMARY_COMPUTE) {
            Engine::Compute
        } else {
            Engine::Graphics
        }
    }

    /// Rebuild the device rules the host planned with.
    ///
    /// Only the primary engine and the compute engine matter to the plan, so the engine not in
    /// use mirrors the compute rules when the primary stream runs on compute.
    pub fn device_rules(&self) -> DeviceRules {
        let flags = self.flags();
        let primary = EngineRules {
            ib_alignment: self.primary_ib_alignment,
            pad_dw_mask: self.primary_pad_dw_mask,
            supports_nesting: flags.contains(ParamFlags::PRIMARY_NESTING),
        };
        let compute = EngineRules {
            ib_alignment: self.compute_ib_alignment,
            pad_dw_mask: self.compute_pad_dw_mask,
            supports_nesting: flags.contains(ParamFlags::SECONDARY_NESTING),
        };
        match self.primary_engine() {
            Engine::Graphics => DeviceRules {
                graphics: primary,
                compute,
            },
            Engine::Compute => DeviceRules {
                graphics: compute,
                compute: primary,
            },
        }
    }

    pub fn blob_layout(&self) -> BlobLayout {
        BlobLayout::new(
            self.vertex_binding_count,
            self.flags().contains(ParamFlags::STATIC_PIPELINE),
            self.flags().contains(ParamFlags::PUSH_UPDATES),
            self.push_constant_size,
        )
    }
}

/// One vertex table entry in the blob.
///
/// Slots the layout does not patch carry the bound buffer; patched slots carry the input record
/// offset of their [`VertexBufferArgs`](crate::token::VertexBufferArgs).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexTableEntry {
    pub address: u64,
    pub size: u32,
    pub stride: u32,
    pub input_offset: u32,
    pub reserved0: u32,
}

impl VertexTableEntry {
    pub const NOT_PATCHED: u32 = u32::MAX;

    pub fn input_offset(&self) -> Option<u32> {
        (self.input_offset != Self::NOT_PATCHED).then_some(self.input_offset)
    }
}

pub const VERTEX_TABLE_ENTRY_BYTES: u64 = core::mem::size_of::<VertexTableEntry>() as u64;

const BLOB_ALIGNMENT: u64 = 16;

/// Byte offsets of the blob sections. Empty sections have size zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobLayout {
    pub vertex_table: u64,
    pub stage_table: u64,
    pub push_offsets: u64,
    pub push_base: u64,
    pub push_words: u32,
    pub size: u64,
}

impl BlobLayout {
    pub fn new(
        vertex_binding_count: u32,
        static_pipeline: bool,
        push_updates: bool,
        push_constant_size: u32,
    ) -> Self {
        let vertex_table = 0;
        let stage_table = vertex_table + u64::from(vertex_binding_count) * VERTEX_TABLE_ENTRY_BYTES;
        let push_offsets = stage_table + if static_pipeline { STAGE_TABLE_BYTES as u64 } else { 0 };
        let push_words = if push_updates { push_constant_size.div_ceil(4) } else { 0 };
        let push_base = push_offsets + u64::from(push_words) * 4;
        let end = push_base + u64::from(push_words) * 4;
        Self {
            vertex_table,
            stage_table,
            push_offsets,
            push_base,
            push_words,
            size: align_up(end, BLOB_ALIGNMENT),
        }
    }

    pub fn alignment() -> u64 {
        BLOB_ALIGNMENT
    }
}
