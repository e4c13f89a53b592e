//! Pipeline/shader register metadata consumed by the generator.
//!
//! The shader compiler decides which user registers receive push constants, grid sizes, vertex
//! buffer tables and so on. The generator cannot call back into the host, so the metadata is
//! serialised into fixed-size [`StageRecord`]s that live in GPU memory (parameter blob or
//! execution-set entries).

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Largest number of push-constant words a stage may receive inline.
pub const MAX_INLINE_PUSH_WORDS: u32 = 8;

/// Register value meaning "not assigned" in serialised records.
pub const REG_UNASSIGNED: u16 = 0xFFFF;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex = 0,
    Fragment = 1,
    Task = 2,
    Mesh = 3,
    Compute = 4,
}

impl ShaderStage {
    pub const COUNT: usize = 5;
    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::Fragment,
        ShaderStage::Task,
        ShaderStage::Mesh,
        ShaderStage::Compute,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn flag(self) -> StageFlags {
        match self {
            ShaderStage::Vertex => StageFlags::VERTEX,
            ShaderStage::Fragment => StageFlags::FRAGMENT,
            ShaderStage::Task => StageFlags::TASK,
            ShaderStage::Mesh => StageFlags::MESH,
            ShaderStage::Compute => StageFlags::COMPUTE,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct StageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const TASK = 1 << 2;
        const MESH = 1 << 3;
        const COMPUTE = 1 << 4;
    }
}

impl StageFlags {
    /// Stages in this set, in [`ShaderStage::ALL`] order.
    pub fn stages(self) -> impl Iterator<Item = ShaderStage> {
        ShaderStage::ALL
            .into_iter()
            .filter(move |stage| self.contains(stage.flag()))
    }
}

/// How the grid size reaches the shader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GridSizeForm {
    /// Three registers holding x/y/z.
    #[default]
    Immediate,
    /// A register pair holding the address of x/y/z in memory.
    Pointer,
}

/// Register assignment of one compiled shader stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageMetadata {
    /// Register pair receiving the address of the full push-constant block.
    pub push_constant_reg: Option<u16>,
    /// First register of the inline push-constant words.
    pub inline_push_reg: Option<u16>,
    /// Push-constant words delivered inline, one register per set bit in ascending order.
    pub inline_push_mask: u64,
    pub grid_size_reg: Option<u16>,
    pub grid_size_form: GridSizeForm,
    /// 32 or 64.
    pub wave_size: u8,
    /// Base vertex at `reg`, start instance at `reg + 1`.
    pub vertex_offset_reg: Option<u16>,
    pub vertex_buffer_table_reg: Option<u16>,
    pub ring_entry_reg: Option<u16>,
    pub sbt_reg: Option<u16>,
    pub launch_size_reg: Option<u16>,
}

impl Default for StageMetadata {
    fn default() -> Self {
        Self {
            push_constant_reg: None,
            inline_push_reg: None,
            inline_push_mask: 0,
            grid_size_reg: None,
            grid_size_form: GridSizeForm::Immediate,
            wave_size: 64,
            vertex_offset_reg: None,
            vertex_buffer_table_reg: None,
            ring_entry_reg: None,
            sbt_reg: None,
            launch_size_reg: None,
        }
    }
}

impl StageMetadata {
    /// Number of words written by the inline push-constant update, zero when absent.
    pub fn inline_push_words(&self) -> u32 {
        match self.inline_push_reg {
            Some(_) => self.inline_push_mask.count_ones(),
            None => 0,
        }
    }

    pub fn uses_push_constant_pointer(&self) -> bool {
        self.push_constant_reg.is_some()
    }
}

/// Everything the generator needs to know about one pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetadata {
    pub stages: [Option<StageMetadata>; ShaderStage::COUNT],
    /// Size of the push-constant block in bytes.
    pub push_constant_size: u32,
    /// Number of vertex buffer slots the vertex stage reads.
    pub vertex_binding_count: u32,
    /// Pre-encoded packets binding this pipeline, copied verbatim on a pipeline switch.
    pub command_words: Vec<u32>,
}

impl PipelineMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: ShaderStage, metadata: StageMetadata) -> Self {
        self.stages[stage.index()] = Some(metadata);
        self
    }

    pub fn with_push_constant_size(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_vertex_binding_count(mut self, count: u32) -> Self {
        self.vertex_binding_count = count;
        self
    }

    pub fn with_command_words(mut self, words: Vec<u32>) -> Self {
        self.command_words = words;
        self
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&StageMetadata> {
        self.stages[stage.index()].as_ref()
    }

    pub fn stage_flags(&self) -> StageFlags {
        ShaderStage::ALL
            .into_iter()
            .filter(|s| self.stages[s.index()].is_some())
            .fold(StageFlags::empty(), |acc, s| acc | s.flag())
    }

    /// Serialised stage table, one record per [`ShaderStage`].
    pub fn stage_records(&self) -> [StageRecord; ShaderStage::COUNT] {
        let mut out = [StageRecord::UNASSIGNED; ShaderStage::COUNT];
        for stage in ShaderStage::ALL {
            if let Some(meta) = self.stage(stage) {
                out[stage.index()] = StageRecord::from_metadata(meta);
            }
        }
        out
    }

    /// Rebuild metadata from a serialised stage table. Command words are not part of the
    /// table and come back empty.
    pub fn from_stage_records(
        records: &[StageRecord; ShaderStage::COUNT],
        push_constant_size: u32,
        vertex_binding_count: u32,
    ) -> Self {
        let mut out = Self {
            push_constant_size,
            vertex_binding_count,
            ..Self::default()
        };
        for stage in ShaderStage::ALL {
            out.stages[stage.index()] = records[stage.index()].to_metadata();
        }
        out
    }
}

const RECORD_PRESENT: u16 = 1 << 0;
const RECORD_GRID_POINTER: u16 = 1 << 1;
const RECORD_WAVE32: u16 = 1 << 2;

/// GPU-visible form of [`StageMetadata`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct StageRecord {
    pub push_constant_reg: u16,
    pub inline_push_reg: u16,
    pub inline_push_mask_lo: u32,
    pub inline_push_mask_hi: u32,
    pub grid_size_reg: u16,
    pub flags: u16,
    pub vertex_offset_reg: u16,
    pub vertex_buffer_table_reg: u16,
    pub ring_entry_reg: u16,
    pub sbt_reg: u16,
    pub launch_size_reg: u16,
    pub reserved0: u16,
    pub reserved1: u32,
}

pub const STAGE_RECORD_BYTES: usize = core::mem::size_of::<StageRecord>();
pub const STAGE_TABLE_BYTES: usize = STAGE_RECORD_BYTES * ShaderStage::COUNT;

fn reg_to_raw(reg: Option<u16>) -> u16 {
    reg.unwrap_or(REG_UNASSIGNED)
}

fn reg_from_raw(raw: u16) -> Option<u16> {
    (raw != REG_UNASSIGNED).then_some(raw)
}

impl StageRecord {
    pub const UNASSIGNED: Self = Self {
        push_constant_reg: REG_UNASSIGNED,
        inline_push_reg: REG_UNASSIGNED,
        inline_push_mask_lo: 0,
        inline_push_mask_hi: 0,
        grid_size_reg: REG_UNASSIGNED,
        flags: 0,
        vertex_offset_reg: REG_UNASSIGNED,
        vertex_buffer_table_reg: REG_UNASSIGNED,
        ring_entry_reg: REG_UNASSIGNED,
        sbt_reg: REG_UNASSIGNED,
        launch_size_reg: REG_UNASSIGNED,
        reserved0: 0,
        reserved1: 0,
    };

    pub fn from_metadata(meta: &StageMetadata) -> Self {
        let mut flags = RECORD_PRESENT;
        if meta.grid_size_form == GridSizeForm::Pointer {
            flags |= RECORD_GRID_POINTER;
        }
        if meta.wave_size == 32 {
            flags |= RECORD_WAVE32;
        }
        Self {
            push_constant_reg: reg_to_raw(meta.push_constant_reg),
            inline_push_reg: reg_to_raw(meta.inline_push_reg),
            inline_push_mask_lo: meta.inline_push_mask as u32,
            inline_push_mask_hi: (meta.inline_push_mask >> 32) as u32,
            grid_size_reg: reg_to_raw(meta.grid_size_reg),
            flags,
            vertex_offset_reg: reg_to_raw(meta.vertex_offset_reg),
            vertex_buffer_table_reg: reg_to_raw(meta.vertex_buffer_table_reg),
            ring_entry_reg: reg_to_raw(meta.ring_entry_reg),
            sbt_reg: reg_to_raw(meta.sbt_reg),
            launch_size_reg: reg_to_raw(meta.launch_size_reg),
            reserved0: 0,
            reserved1: 0,
        }
    }

    pub fn to_metadata(&self) -> Option<StageMetadata> {
        if self.flags & RECORD_PRESENT == 0 {
            return None;
        }
        Some(StageMetadata {
            push_constant_reg: reg_from_raw(self.push_constant_reg),
            inline_push_reg: reg_from_raw(self.inline_push_reg),
            inline_push_mask: u64::from(self.inline_push_mask_lo)
                | (u64::from(self.inline_push_mask_hi) << 32),
            grid_size_reg: reg_from_raw(self.grid_size_reg),
            grid_size_form: if self.flags & RECORD_GRID_POINTER != 0 {
                GridSizeForm::Pointer
            } else {
                GridSizeForm::Immediate
            },
            wave_size: if self.flags & RECORD_WAVE32 != 0 { 32 } else { 64 },
            vertex_offset_reg: reg_from_raw(self.vertex_offset_reg),
            vertex_buffer_table_reg: reg_from_raw(self.vertex_buffer_table_reg),
            ring_entry_reg: reg_from_raw(self.ring_entry_reg),
            sbt_reg: reg_from_raw(self.sbt_reg),
            launch_size_reg: reg_from_raw(self.launch_size_reg),
        })
    }
}

/// Decode a stage table from raw bytes (unaligned reads).
pub fn decode_stage_table(bytes: &[u8]) -> [StageRecord; ShaderStage::COUNT] {
    assert!(bytes.len() >= STAGE_TABLE_BYTES);
    let mut out = [StageRecord::UNASSIGNED; ShaderStage::COUNT];
    for (i, rec) in out.iter_mut().enumerate() {
        let start = i * STAGE_RECORD_BYTES;
        *rec = bytemuck::pod_read_unaligned(&bytes[start..start + STAGE_RECORD_BYTES]);
    }
    out
}
