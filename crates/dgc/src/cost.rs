//! Per-sequence size model.
//!
//! The host sizes the output buffer with this model and the generator program recomputes it to
//! find its slots, so every packet the program can emit for a sequence must be counted here.
//! Emitting less is fine: the rest of the slot is NOP padding.

use dgc_packets::packet::{
    set_sh_reg_dwords, DISPATCH_DIRECT_DWORDS, DISPATCH_MESH_DIRECT_DWORDS,
    DISPATCH_TASKMESH_DIRECT_ACE_DWORDS, DISPATCH_TASKMESH_GFX_DWORDS, DRAW_INDEX_AUTO_DWORDS,
    DRAW_INDEX_OFFSET_2_DWORDS, DRAW_INDIRECT_MULTI_DWORDS, INDEX_BASE_DWORDS,
    INDEX_BUFFER_SIZE_DWORDS, INDEX_TYPE_DWORDS, MARKER_DWORDS, NUM_INSTANCES_DWORDS,
    SET_BASE_DWORDS, SET_SH_REG_PTR_DWORDS,
};

use crate::arena::align_up;
use crate::execution_set::ExecutionSetBounds;
use crate::layout::{DrawShape, LayoutKind, LayoutShape};
use crate::metadata::{GridSizeForm, PipelineMetadata, ShaderStage, StageFlags, MAX_INLINE_PUSH_WORDS};
use crate::token::TokenSet;

/// Bytes of one vertex buffer descriptor in the upload area.
pub const VERTEX_DESCRIPTOR_BYTES: u32 = 16;

/// Alignment of the per-sequence push-constant copy.
pub const PUSH_UPLOAD_ALIGNMENT: u64 = 16;

const IMMEDIATE_GRID_DWORDS: usize = set_sh_reg_dwords(3);
const VERTEX_OFFSET_DWORDS: usize = set_sh_reg_dwords(2);
const INDEX_BUFFER_DWORDS: usize = INDEX_TYPE_DWORDS + INDEX_BASE_DWORDS + INDEX_BUFFER_SIZE_DWORDS;
const DRAW_DWORDS: usize = VERTEX_OFFSET_DWORDS + NUM_INSTANCES_DWORDS + DRAW_INDEX_AUTO_DWORDS;
const DRAW_INDEXED_DWORDS: usize = VERTEX_OFFSET_DWORDS + NUM_INSTANCES_DWORDS + DRAW_INDEX_OFFSET_2_DWORDS;
const DRAW_COUNT_DWORDS: usize = SET_BASE_DWORDS + DRAW_INDIRECT_MULTI_DWORDS;
const TRACE_RAYS_DWORDS: usize = 2 * SET_SH_REG_PTR_DWORDS + DISPATCH_DIRECT_DWORDS;

/// Byte strides of one sequence in each region of the output buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SequenceCost {
    pub primary_stride: u32,
    /// Zero when the layout has no secondary stream.
    pub secondary_stride: u32,
    pub upload_stride: u32,
}

impl SequenceCost {
    pub fn has_secondary(&self) -> bool {
        self.secondary_stride != 0
    }
}

/// Pipeline information the model sizes against.
#[derive(Clone, Copy, Debug)]
pub enum CostContext<'a> {
    Pipeline(&'a PipelineMetadata),
    /// Any pipeline of the set may be selected; size for the worst case.
    ExecutionSet(ExecutionSetBounds),
}

impl CostContext<'_> {
    fn push_constant_size(&self) -> u32 {
        match self {
            CostContext::Pipeline(p) => p.push_constant_size,
            CostContext::ExecutionSet(b) => b.push_constant_size,
        }
    }

    fn vertex_binding_count(&self) -> u32 {
        match self {
            CostContext::Pipeline(p) => p.vertex_binding_count,
            CostContext::ExecutionSet(b) => b.vertex_binding_count,
        }
    }

    /// Push-constant update dwords for `stages`, and whether any of them takes the pointer form.
    fn push_constants(&self, stages: StageFlags) -> (usize, bool) {
        match self {
            CostContext::Pipeline(pipeline) => stages
                .stages()
                .filter_map(|s| pipeline.stage(s))
                .fold((0, false), |(dw, ptr), meta| {
                    let mut dw = dw;
                    if meta.uses_push_constant_pointer() {
                        dw += SET_SH_REG_PTR_DWORDS;
                    }
                    let inline = meta.inline_push_words() as usize;
                    if inline != 0 {
                        dw += set_sh_reg_dwords(inline);
                    }
                    (dw, ptr || meta.uses_push_constant_pointer())
                }),
            CostContext::ExecutionSet(_) => {
                let per_stage =
                    SET_SH_REG_PTR_DWORDS + set_sh_reg_dwords(MAX_INLINE_PUSH_WORDS as usize);
                let n = stages.bits().count_ones() as usize;
                (n * per_stage, n != 0)
            }
        }
    }

    /// Grid-size delivery cost for `stage`.
    fn grid(&self, stage: ShaderStage) -> usize {
        match self {
            CostContext::Pipeline(pipeline) => match pipeline.stage(stage) {
                Some(meta) if meta.grid_size_reg.is_some() => match meta.grid_size_form {
                    GridSizeForm::Immediate => IMMEDIATE_GRID_DWORDS,
                    GridSizeForm::Pointer => SET_SH_REG_PTR_DWORDS,
                },
                _ => 0,
            },
            CostContext::ExecutionSet(_) => IMMEDIATE_GRID_DWORDS.max(SET_SH_REG_PTR_DWORDS),
        }
    }

    fn pipeline_switch_dwords(&self) -> usize {
        match self {
            CostContext::Pipeline(_) => 0,
            CostContext::ExecutionSet(b) => b.max_cmd_words as usize,
        }
    }
}

fn stride_bytes(dwords: usize) -> u32 {
    let dwords = u32::try_from(dwords.max(1)).unwrap_or(u32::MAX / 4);
    dwords * 4
}

/// Size one sequence of `shape` against `ctx`.
pub fn sequence_cost(shape: &LayoutShape, ctx: &CostContext<'_>, trace_markers: bool) -> SequenceCost {
    let tokens = shape.tokens;
    let marker = if trace_markers { MARKER_DWORDS } else { 0 };

    let mut primary = marker;
    let mut secondary = 0usize;
    let mut upload = 0u64;
    let mut pointer_push = false;

    if tokens.contains(TokenSet::EXECUTION_SET) {
        assert!(
            matches!(ctx, CostContext::ExecutionSet(_)),
            "pipeline switch layouts are sized against an execution set"
        );
        primary += ctx.pipeline_switch_dwords();
    }

    if shape.updates_push_constants() {
        let (dw, ptr) = ctx.push_constants(shape.primary_stages());
        primary += dw;
        pointer_push |= ptr;
    }

    if tokens.contains(TokenSet::VERTEX_BUFFER) {
        primary += SET_SH_REG_PTR_DWORDS;
        upload += u64::from(ctx.vertex_binding_count()) * u64::from(VERTEX_DESCRIPTOR_BYTES);
    }

    if tokens.contains(TokenSet::INDEX_BUFFER) {
        primary += INDEX_BUFFER_DWORDS;
    }

    match shape.kind {
        LayoutKind::Graphics { shape: draw } => {
            primary += match draw {
                DrawShape::Draw => DRAW_DWORDS,
                DrawShape::DrawIndexed => DRAW_INDEXED_DWORDS,
                DrawShape::DrawCount { .. } => DRAW_COUNT_DWORDS,
            };
        }
        LayoutKind::Dispatch => {
            primary += ctx.grid(ShaderStage::Compute) + DISPATCH_DIRECT_DWORDS;
        }
        LayoutKind::MeshOnly { task: false } => {
            primary += ctx.grid(ShaderStage::Mesh) + DISPATCH_MESH_DIRECT_DWORDS;
        }
        LayoutKind::MeshOnly { task: true } => {
            primary += DISPATCH_TASKMESH_GFX_DWORDS;
            secondary += marker;
            if shape.updates_push_constants() {
                let (dw, ptr) = ctx.push_constants(shape.secondary_stages());
                secondary += dw;
                pointer_push |= ptr;
            }
            secondary += ctx.grid(ShaderStage::Task) + DISPATCH_TASKMESH_DIRECT_ACE_DWORDS;
        }
        LayoutKind::RayTrace => {
            primary += TRACE_RAYS_DWORDS;
        }
    }

    if pointer_push {
        upload += align_up(u64::from(ctx.push_constant_size()), PUSH_UPLOAD_ALIGNMENT);
    }

    SequenceCost {
        primary_stride: stride_bytes(primary),
        secondary_stride: if shape.has_secondary() {
            stride_bytes(secondary)
        } else {
            0
        },
        upload_stride: u32::try_from(upload).unwrap_or(u32::MAX),
    }
}

/// Byte offsets inside one sequence's upload slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadSlotLayout {
    /// Size of the push-constant copy at offset 0; zero when no stage takes the pointer form.
    pub push_size: u32,
    pub vertex_offset: u32,
}

impl UploadSlotLayout {
    pub fn new(cost: &SequenceCost, shape: &LayoutShape, vertex_binding_count: u32) -> Self {
        let vertex_bytes = if shape.tokens.contains(TokenSet::VERTEX_BUFFER) {
            vertex_binding_count.saturating_mul(VERTEX_DESCRIPTOR_BYTES)
        } else {
            0
        };
        let push_size = cost.upload_stride.saturating_sub(vertex_bytes);
        Self {
            push_size,
            vertex_offset: push_size,
        }
    }
}
