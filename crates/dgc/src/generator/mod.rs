//! The generator program.
//!
//! One program is compiled per [`LayoutShape`] and cached in a [`ProgramArena`]. A dispatch runs
//! it on `max(1, ceil(max_sequence_count / threads_per_group))` workgroups; thread `i` owns
//! sequence slot `i` of every stream, and thread 0 additionally owns the trailers, preambles and
//! the tail of each stream body. Ownership is disjoint, so threads may run in any order.

mod dispatch;
mod emit;

use std::collections::HashMap;

use dgc_packets::{PacketEmitter, JUMP_PACKET_BYTES};

use crate::config::{DeviceRules, EngineRules};
use crate::cost::{sequence_cost, CostContext, UploadSlotLayout};
use crate::error::DgcError;
use crate::execution_set::ExecutionSetBounds;
use crate::layout::LayoutShape;
use crate::memory::{DeviceMemory, MemoryError};
use crate::metadata::{decode_stage_table, PipelineMetadata, STAGE_TABLE_BYTES};
use crate::params::{DgcParams, ParamFlags, VertexTableEntry, VERTEX_TABLE_ENTRY_BYTES};
use crate::plan::{CmdbufLayout, Region, Stream};
use crate::predication::{Predication, PredicationGate};

pub use dispatch::{ComputeDispatch, CpuDispatch, ThreadOrder};

/// Index of a compiled program inside a [`ProgramArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u16);

/// Number of workgroups needed for `max_sequence_count` threads.
///
/// Never zero: thread 0 must run even for an empty request so the trailer gets written.
pub fn workgroup_count(max_sequence_count: u32, threads_per_group: u32) -> u32 {
    max_sequence_count.div_ceil(threads_per_group.max(1)).max(1)
}

/// A generator specialised for one layout shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorProgram {
    shape: LayoutShape,
}

impl GeneratorProgram {
    pub fn compile(shape: LayoutShape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> &LayoutShape {
        &self.shape
    }

    /// Run one invocation.
    pub fn run_thread(
        &self,
        memory: &dyn DeviceMemory,
        params: &DgcParams,
        thread_id: u32,
    ) -> Result<(), MemoryError> {
        if thread_id != 0 && thread_id >= params.max_sequence_count {
            return Ok(());
        }

        let ctx = ProgramContext::load(&self.shape, memory, params)?;
        if thread_id == 0 {
            ctx.write_frame(memory, Stream::Primary)?;
            if ctx.plan.has_secondary() {
                ctx.write_frame(memory, Stream::Secondary)?;
            }
        }
        if thread_id < params.max_sequence_count {
            emit::write_sequence(&ctx, memory, thread_id)?;
        }
        Ok(())
    }
}

/// State every thread derives from the parameters before writing anything.
pub(crate) struct ProgramContext<'p> {
    pub shape: &'p LayoutShape,
    pub params: &'p DgcParams,
    pub flags: ParamFlags,
    pub effective: u32,
    pub plan: CmdbufLayout,
    pub rules: DeviceRules,
    pub static_pipeline: Option<PipelineMetadata>,
    pub vertex_table: Vec<VertexTableEntry>,
    pub push_offsets: Vec<u32>,
    pub push_base: Vec<u32>,
    pub upload_slot: UploadSlotLayout,
}

fn read_words(memory: &dyn DeviceMemory, address: u64, count: u32) -> Result<Vec<u32>, MemoryError> {
    // An omitted blob has address 0; empty sections are never read.
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = memory.read_vec(address, count as usize * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl<'p> ProgramContext<'p> {
    fn load(
        shape: &'p LayoutShape,
        memory: &dyn DeviceMemory,
        params: &'p DgcParams,
    ) -> Result<Self, MemoryError> {
        let flags = params.flags();

        let mut effective = params.max_sequence_count;
        if flags.contains(ParamFlags::HAS_COUNT) {
            effective = effective.min(memory.read_u32(params.count_address)?);
        }
        if flags.contains(ParamFlags::HAS_PREDICATION) {
            let predication = Predication {
                address: params.predication_address,
                inverted: flags.contains(ParamFlags::PREDICATION_INVERTED),
            };
            effective = PredicationGate::effective_count(memory, Some(&predication), effective)?;
        }

        let blob = params.blob_layout();
        let static_pipeline = if flags.contains(ParamFlags::STATIC_PIPELINE) {
            let table = memory.read_vec(params.blob_address + blob.stage_table, STAGE_TABLE_BYTES)?;
            Some(PipelineMetadata::from_stage_records(
                &decode_stage_table(&table),
                params.push_constant_size,
                params.vertex_binding_count,
            ))
        } else {
            None
        };

        let mut vertex_table = Vec::with_capacity(params.vertex_binding_count as usize);
        if params.vertex_binding_count != 0 {
            let bytes = memory.read_vec(
                params.blob_address + blob.vertex_table,
                (u64::from(params.vertex_binding_count) * VERTEX_TABLE_ENTRY_BYTES) as usize,
            )?;
            vertex_table.extend(
                bytes
                    .chunks_exact(VERTEX_TABLE_ENTRY_BYTES as usize)
                    .map(bytemuck::pod_read_unaligned::<VertexTableEntry>),
            );
        }
        let push_offsets = read_words(memory, params.blob_address + blob.push_offsets, blob.push_words)?;
        let push_base = read_words(memory, params.blob_address + blob.push_base, blob.push_words)?;

        let cost_ctx = match &static_pipeline {
            Some(pipeline) => CostContext::Pipeline(pipeline),
            None => CostContext::ExecutionSet(ExecutionSetBounds {
                max_cmd_words: params.execution_set_max_words,
                push_constant_size: params.push_constant_size,
                vertex_binding_count: params.vertex_binding_count,
            }),
        };
        let cost = sequence_cost(shape, &cost_ctx, flags.contains(ParamFlags::TRACE_MARKERS));
        debug_assert_eq!(cost.primary_stride, params.primary_stride);
        debug_assert_eq!(cost.secondary_stride, params.secondary_stride);
        debug_assert_eq!(cost.upload_stride, params.upload_stride);

        let rules = params.device_rules();
        let plan = CmdbufLayout::plan(
            &cost,
            params.max_sequence_count,
            flags.contains(ParamFlags::USE_PREAMBLE),
            &rules,
            params.primary_engine(),
        );
        let upload_slot = UploadSlotLayout::new(&cost, shape, params.vertex_binding_count);

        Ok(Self {
            shape,
            params,
            flags,
            effective,
            plan,
            rules,
            static_pipeline,
            vertex_table,
            push_offsets,
            push_base,
            upload_slot,
        })
    }

    fn engine_rules(&self, stream: Stream) -> &EngineRules {
        match stream {
            Stream::Primary => self.rules.engine(self.params.primary_engine()),
            Stream::Secondary => &self.rules.compute,
        }
    }

    fn continuation(&self, stream: Stream) -> Option<(u64, u32)> {
        match stream {
            Stream::Primary => self
                .flags
                .contains(ParamFlags::HAS_CONTINUATION)
                .then_some((self.params.continuation_address, self.params.continuation_size_dw)),
            Stream::Secondary => self
                .flags
                .contains(ParamFlags::HAS_SECONDARY_CONTINUATION)
                .then_some((
                    self.params.secondary_continuation_address,
                    self.params.secondary_continuation_size_dw,
                )),
        }
    }

    pub(crate) fn address(&self, region: &Region) -> u64 {
        self.params.output_address + region.offset
    }

    /// Trailer, preamble and body tail of `stream`. Thread 0 only.
    fn write_frame(&self, memory: &dyn DeviceMemory, stream: Stream) -> Result<(), MemoryError> {
        let chaining = !self.engine_rules(stream).supports_nesting;
        let jump = u64::from(JUMP_PACKET_BYTES);

        let trailer = self.plan.trailer(stream);
        let mut buf = vec![0u8; trailer.size as usize];
        let mut em = PacketEmitter::new(&mut buf);
        match self.continuation(stream) {
            Some((address, size_dw)) if chaining => {
                em.pad_to((trailer.size - jump) as usize);
                em.indirect_buffer(address, size_dw, true);
            }
            _ => em.pad_to_end(),
        }
        memory.write(self.address(&trailer), &buf)?;

        let body = self.plan.body(stream);
        let executed = self.plan.executed_size(stream, self.effective);

        if self.plan.use_preamble {
            let preamble = self.plan.preamble(stream);
            let mut buf = vec![0u8; preamble.size as usize];
            let mut em = PacketEmitter::new(&mut buf);
            em.pad_to((preamble.size - jump) as usize);
            em.indirect_buffer(self.address(&body), (executed / 4) as u32, true);
            memory.write(self.address(&preamble), &buf)?;
        }

        let tail_start = self.plan.tail_start(stream, self.effective);
        let mut buf = vec![0u8; (body.size - tail_start) as usize];
        let mut em = PacketEmitter::new(&mut buf);
        let window = (executed - tail_start) as usize;
        if chaining {
            em.pad_to(window - JUMP_PACKET_BYTES as usize);
            em.indirect_buffer(self.address(&trailer), (trailer.size / 4) as u32, true);
        } else {
            em.pad_to(window);
        }
        // The preamble stops the engine at `executed`; packets must not straddle it.
        em.pad_to_end();
        memory.write(self.address(&body) + tail_start, &buf)?;

        tracing::trace!(
            ?stream,
            effective = self.effective,
            executed,
            tail_start,
            chaining,
            "wrote stream frame"
        );
        Ok(())
    }
}

/// Compiled programs, one per layout shape.
#[derive(Debug, Default)]
pub struct ProgramArena {
    programs: Vec<GeneratorProgram>,
    by_shape: HashMap<LayoutShape, ProgramId>,
}

impl ProgramArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the program for `shape`, compiling it on first use. The flag reports a cache hit.
    pub fn get_or_compile(&mut self, shape: &LayoutShape) -> Result<(ProgramId, bool), DgcError> {
        if let Some(&id) = self.by_shape.get(shape) {
            return Ok((id, true));
        }
        let id = u16::try_from(self.programs.len())
            .map(ProgramId)
            .map_err(|_| DgcError::InvalidRequest("generator program arena exhausted"))?;
        self.programs.push(GeneratorProgram::compile(*shape));
        self.by_shape.insert(*shape, id);
        tracing::debug!(?shape, id = id.0, "compiled generator program");
        Ok((id, false))
    }

    pub fn get(&self, id: ProgramId) -> Option<&GeneratorProgram> {
        self.programs.get(usize::from(id.0))
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
