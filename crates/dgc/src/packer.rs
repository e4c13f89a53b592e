//! Host side of a generation: packs the scalar parameters and uploads the parameter blob.

use crate::arena::{LinearAllocator, UploadAllocation};
use crate::config::{DeviceRules, DgcConfig};
use crate::error::DgcError;
use crate::layout::{IndirectCommandLayout, MAX_PUSH_CONSTANT_SIZE, MAX_PUSH_WORDS, MAX_VERTEX_BINDINGS};
use crate::memory::DeviceMemory;
use crate::metadata::PipelineMetadata;
use crate::params::{BlobLayout, DgcParams, ParamFlags, VertexTableEntry, VERTEX_TABLE_ENTRY_BYTES};
use crate::plan::CmdbufLayout;
use crate::service::GenerationRequest;
use crate::token::{IndexType, IndexTypeMode};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexBinding {
    pub address: u64,
    pub size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBinding {
    pub address: u64,
    pub size: u32,
    pub index_type: IndexType,
}

/// Command buffer state the generated commands inherit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundState {
    /// Bound pipeline; `None` when the layout switches pipelines through an execution set.
    pub pipeline: Option<PipelineMetadata>,
    pub push_constants: Vec<u8>,
    /// Indexed by binding slot.
    pub vertex_buffers: Vec<VertexBinding>,
    pub index_buffer: Option<IndexBinding>,
}

impl BoundState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, pipeline: PipelineMetadata) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_push_constants(mut self, bytes: &[u8]) -> Self {
        self.push_constants = bytes.to_vec();
        self
    }

    pub fn with_vertex_buffer(mut self, slot: u32, binding: VertexBinding) -> Self {
        let slot = slot as usize;
        if self.vertex_buffers.len() <= slot {
            self.vertex_buffers.resize(slot + 1, VertexBinding::default());
        }
        self.vertex_buffers[slot] = binding;
        self
    }

    pub fn with_index_buffer(mut self, binding: IndexBinding) -> Self {
        self.index_buffer = Some(binding);
        self
    }
}

/// Everything [`pack_parameters`] reads.
pub struct PackInputs<'a> {
    pub layout: &'a IndirectCommandLayout,
    pub request: &'a GenerationRequest<'a>,
    pub state: &'a BoundState,
    pub plan: &'a CmdbufLayout,
    pub rules: &'a DeviceRules,
    pub config: &'a DgcConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedParameters {
    pub params: DgcParams,
    /// `None` when the blob would be empty.
    pub blob: Option<UploadAllocation>,
}

/// Allocate and fill the parameter blob, then build the dispatch parameters pointing at it.
pub fn pack_parameters(
    inputs: &PackInputs<'_>,
    allocator: &mut dyn LinearAllocator,
    memory: &dyn DeviceMemory,
) -> Result<PackedParameters, DgcError> {
    let PackInputs {
        layout,
        request,
        state,
        plan,
        rules,
        config,
    } = *inputs;
    let shape = layout.shape();
    let execution_set = request.execution_set;

    let static_pipeline = match execution_set {
        Some(_) => None,
        None => Some(
            state
                .pipeline
                .as_ref()
                .ok_or(DgcError::InvalidRequest("no pipeline bound and no execution set"))?,
        ),
    };
    let (push_constant_size, vertex_binding_count) = match static_pipeline {
        Some(p) => (p.push_constant_size, p.vertex_binding_count),
        None => {
            let b = execution_set.map(|set| set.bounds()).unwrap_or_default();
            (b.push_constant_size, b.vertex_binding_count)
        }
    };
    if push_constant_size > MAX_PUSH_CONSTANT_SIZE {
        return Err(DgcError::InvalidRequest("push constant block exceeds 256 bytes"));
    }
    if vertex_binding_count > MAX_VERTEX_BINDINGS {
        return Err(DgcError::InvalidRequest("vertex binding count exceeds 32"));
    }

    let blob_layout = BlobLayout::new(
        vertex_binding_count,
        static_pipeline.is_some(),
        shape.updates_push_constants(),
        push_constant_size,
    );

    let blob = if blob_layout.size == 0 {
        None
    } else {
        let size = blob_layout.size;
        let alloc = allocator
            .alloc(size, BlobLayout::alignment())
            .ok_or(DgcError::OutOfMemory { size })?;
        let bytes = build_blob(&blob_layout, layout, state, static_pipeline, vertex_binding_count);
        memory.write(alloc.device_address, &bytes)?;
        tracing::trace!(
            address = alloc.device_address,
            size,
            vertex_bindings = vertex_binding_count,
            push_words = blob_layout.push_words,
            "uploaded parameter blob"
        );
        Some(alloc)
    };

    let mut flags = ParamFlags::empty();
    flags.set(ParamFlags::HAS_COUNT, request.count_address.is_some());
    flags.set(ParamFlags::HAS_PREDICATION, request.predication.is_some());
    flags.set(
        ParamFlags::PREDICATION_INVERTED,
        request.predication.is_some_and(|p| p.inverted),
    );
    flags.set(ParamFlags::USE_PREAMBLE, plan.use_preamble);
    flags.set(ParamFlags::STATIC_PIPELINE, static_pipeline.is_some());
    flags.set(ParamFlags::TRACE_MARKERS, config.trace_markers);
    flags.set(ParamFlags::HAS_CONTINUATION, request.continuation.is_some());
    flags.set(
        ParamFlags::HAS_SECONDARY_CONTINUATION,
        request.secondary_continuation.is_some(),
    );
    flags.set(
        ParamFlags::PRIMARY_COMPUTE,
        request.primary_engine == crate::config::Engine::Compute,
    );
    let primary_rules = rules.engine(request.primary_engine);
    flags.set(ParamFlags::PRIMARY_NESTING, primary_rules.supports_nesting);
    flags.set(ParamFlags::SECONDARY_NESTING, rules.compute.supports_nesting);
    flags.set(
        ParamFlags::DXGI_INDEX_TYPES,
        layout.index_type_mode() == IndexTypeMode::Dxgi,
    );
    flags.set(ParamFlags::PUSH_UPDATES, shape.updates_push_constants());

    let (es_address, es_stride, es_count, es_max_words) = match execution_set {
        Some(set) => (
            set.address(),
            u32::try_from(set.stride())
                .map_err(|_| DgcError::InvalidRequest("execution set stride too large"))?,
            set.entry_count(),
            set.bounds().max_cmd_words,
        ),
        None => (0, 0, 0, 0),
    };

    let params = DgcParams {
        output_address: request.output_address,
        input_address: request.input_address,
        count_address: request.count_address.unwrap_or(0),
        predication_address: request.predication.map_or(0, |p| p.address),
        execution_set_address: es_address,
        blob_address: blob.map_or(0, |b| b.device_address),
        continuation_address: request.continuation.map_or(0, |c| c.address),
        secondary_continuation_address: request.secondary_continuation.map_or(0, |c| c.address),
        push_input_mask: layout.push_words().input_mask(),
        push_sequence_index_mask: layout.push_words().sequence_index_mask(),

        max_sequence_count: request.max_sequence_count,
        input_stride: layout.input_stride(),
        primary_stride: plan.primary_stride,
        secondary_stride: plan.secondary_stride,
        upload_stride: plan.upload_stride,
        flags: flags.bits(),
        continuation_size_dw: request.continuation.map_or(0, |c| c.size_dw),
        secondary_continuation_size_dw: request.secondary_continuation.map_or(0, |c| c.size_dw),
        action_offset: layout.action_offset(),
        index_buffer_offset: layout.index_buffer_offset().unwrap_or(0),
        execution_set_offset: layout.execution_set_offset().unwrap_or(0),
        execution_set_stride: es_stride,
        execution_set_count: es_count,
        execution_set_max_words: es_max_words,
        push_constant_size,
        vertex_binding_count,
        bound_max_index_count: state
            .index_buffer
            .map_or(0, |ib| ib.index_type.max_index_count(ib.size)),
        primary_ib_alignment: primary_rules.ib_alignment,
        primary_pad_dw_mask: primary_rules.pad_dw_mask,
        compute_ib_alignment: rules.compute.ib_alignment,
        compute_pad_dw_mask: rules.compute.pad_dw_mask,
        reserved0: 0,
    };

    Ok(PackedParameters { params, blob })
}

fn build_blob(
    blob_layout: &BlobLayout,
    layout: &IndirectCommandLayout,
    state: &BoundState,
    static_pipeline: Option<&PipelineMetadata>,
    vertex_binding_count: u32,
) -> Vec<u8> {
    let mut bytes = vec![0u8; blob_layout.size as usize];

    for slot in 0..vertex_binding_count {
        let entry = match layout.vertex_input_offset(slot) {
            Some(input_offset) => VertexTableEntry {
                input_offset,
                ..VertexTableEntry::default()
            },
            None => {
                let bound = state
                    .vertex_buffers
                    .get(slot as usize)
                    .copied()
                    .unwrap_or_default();
                VertexTableEntry {
                    address: bound.address,
                    size: bound.size,
                    stride: bound.stride,
                    input_offset: VertexTableEntry::NOT_PATCHED,
                    reserved0: 0,
                }
            }
        };
        let at = (blob_layout.vertex_table + u64::from(slot) * VERTEX_TABLE_ENTRY_BYTES) as usize;
        bytes[at..at + VERTEX_TABLE_ENTRY_BYTES as usize].copy_from_slice(bytemuck::bytes_of(&entry));
    }

    if let Some(pipeline) = static_pipeline {
        let records = pipeline.stage_records();
        let table = bytemuck::bytes_of(&records);
        let at = blob_layout.stage_table as usize;
        bytes[at..at + table.len()].copy_from_slice(table);
    }

    let offsets = layout.push_words().input_offsets();
    for word in 0..(blob_layout.push_words as usize).min(MAX_PUSH_WORDS) {
        let at = blob_layout.push_offsets as usize + word * 4;
        bytes[at..at + 4].copy_from_slice(&offsets[word].to_le_bytes());
    }

    let base_len = (blob_layout.push_words as usize * 4).min(state.push_constants.len());
    let at = blob_layout.push_base as usize;
    bytes[at..at + base_len].copy_from_slice(&state.push_constants[..base_len]);

    bytes
}
