//! Packets of one sequence.
//!
//! Emission order inside a primary slot is fixed: pipeline switch words, debug marker, push
//! constants, vertex buffers, index buffer, action. The secondary slot (task shaders on the
//! compute engine) carries the marker, the task stage push constants and the task launch.

use std::borrow::Cow;

use bytemuck::Pod;
use dgc_packets::packet::{
    DISPATCH_COMPUTE_SHADER_EN, DISPATCH_CS_W32_EN, DISPATCH_FORCE_START_AT_000,
    DISPATCH_ORDER_MODE,
};
use dgc_packets::{MultiDrawArgs, PacketEmitter};

use crate::execution_set::read_entry;
use crate::layout::{DrawShape, LayoutKind};
use crate::memory::{DeviceMemory, MemoryError};
use crate::metadata::{GridSizeForm, PipelineMetadata, ShaderStage, StageFlags, StageMetadata};
use crate::params::ParamFlags;
use crate::plan::Stream;
use crate::token::{
    DispatchArgs, DrawArgs, DrawCountArgs, DrawIndexedArgs, ExecutionSetArgs, IndexBufferArgs,
    IndexTypeMode, TokenSet, TraceRaysArgs, VertexBufferArgs,
};

use super::ProgramContext;

/// A live sequence with its input record and resolved pipeline.
struct Sequence<'p> {
    index: u32,
    record_address: u64,
    record: Vec<u8>,
    pipeline: Cow<'p, PipelineMetadata>,
    switch_words: Vec<u32>,
    push_words: Vec<u32>,
    upload_address: u64,
    upload: Vec<u8>,
}

impl Sequence<'_> {
    fn field<T: Pod>(&self, offset: u32) -> T {
        let start = offset as usize;
        bytemuck::pod_read_unaligned(&self.record[start..start + core::mem::size_of::<T>()])
    }

    fn stage(&self, stage: ShaderStage) -> Option<&StageMetadata> {
        self.pipeline.stage(stage)
    }
}

/// Write every slot thread `index` owns.
pub(crate) fn write_sequence(
    ctx: &ProgramContext<'_>,
    memory: &dyn DeviceMemory,
    index: u32,
) -> Result<(), MemoryError> {
    let mut sequence = if index < ctx.effective {
        resolve(ctx, memory, index)?
    } else {
        None
    };

    write_slot(ctx, memory, Stream::Primary, index, |em| {
        if let Some(seq) = sequence.as_mut() {
            emit_primary(ctx, seq, em);
        }
    })?;
    if ctx.plan.has_secondary() {
        write_slot(ctx, memory, Stream::Secondary, index, |em| {
            if let Some(seq) = sequence.as_mut() {
                emit_secondary(ctx, seq, em);
            }
        })?;
    }

    if let Some(seq) = sequence.filter(|s| !s.upload.is_empty()) {
        memory.write(seq.upload_address, &seq.upload)?;
    }
    Ok(())
}

fn write_slot(
    ctx: &ProgramContext<'_>,
    memory: &dyn DeviceMemory,
    stream: Stream,
    index: u32,
    emit: impl FnOnce(&mut PacketEmitter<'_>),
) -> Result<(), MemoryError> {
    let stride = u64::from(ctx.plan.stride(stream));
    let offset = u64::from(index) * stride;
    if offset >= ctx.plan.tail_start(stream, ctx.effective) {
        return Ok(());
    }

    let mut buf = vec![0u8; stride as usize];
    let mut em = PacketEmitter::new(&mut buf);
    emit(&mut em);
    em.pad_to_end();
    memory.write(ctx.address(&ctx.plan.body(stream)) + offset, &buf)
}

fn resolve<'p>(
    ctx: &'p ProgramContext<'p>,
    memory: &dyn DeviceMemory,
    index: u32,
) -> Result<Option<Sequence<'p>>, MemoryError> {
    let params = ctx.params;
    let record_address = params.input_address + u64::from(index) * u64::from(params.input_stride);
    let record = memory.read_vec(record_address, params.input_stride as usize)?;

    let (pipeline, switch_words) = match &ctx.static_pipeline {
        Some(pipeline) => (Cow::Borrowed(pipeline), Vec::new()),
        None => {
            let start = params.execution_set_offset as usize;
            let selected: ExecutionSetArgs =
                bytemuck::pod_read_unaligned(&record[start..start + 4]);
            if selected.index >= params.execution_set_count {
                tracing::trace!(sequence = index, entry = selected.index, "execution set entry out of range");
                return Ok(None);
            }
            let address = params.execution_set_address
                + u64::from(selected.index) * u64::from(params.execution_set_stride);
            let (header, words) = read_entry(memory, address, params.execution_set_max_words)?;
            (Cow::Owned(header.pipeline()), words)
        }
    };

    let mut sequence = Sequence {
        index,
        record_address,
        record,
        pipeline,
        switch_words,
        push_words: Vec::new(),
        upload_address: params.output_address + ctx.plan.upload_slot(index),
        upload: vec![0u8; params.upload_stride as usize],
    };
    sequence.push_words = (0..ctx.push_base.len())
        .map(|w| {
            let bit = 1u64 << w;
            if params.push_sequence_index_mask & bit != 0 {
                index
            } else if params.push_input_mask & bit != 0 {
                sequence.field::<u32>(ctx.push_offsets[w])
            } else {
                ctx.push_base[w]
            }
        })
        .collect();
    Ok(Some(sequence))
}

fn emit_marker(ctx: &ProgramContext<'_>, seq: &Sequence<'_>, em: &mut PacketEmitter<'_>) {
    if ctx.flags.contains(ParamFlags::TRACE_MARKERS) {
        em.marker(seq.index, (ctx.shape.tokens & TokenSet::ACTIONS).bits());
    }
}

fn emit_primary(ctx: &ProgramContext<'_>, seq: &mut Sequence<'_>, em: &mut PacketEmitter<'_>) {
    let tokens = ctx.shape.tokens;

    em.raw_words(&seq.switch_words);
    emit_marker(ctx, seq, em);
    if ctx.shape.updates_push_constants() {
        emit_push_constants(ctx, seq, em, ctx.shape.primary_stages());
    }
    if tokens.contains(TokenSet::VERTEX_BUFFER) {
        emit_vertex_buffers(ctx, seq, em);
    }
    let max_index_count = if tokens.contains(TokenSet::INDEX_BUFFER) {
        emit_index_buffer(ctx, seq, em)
    } else {
        ctx.params.bound_max_index_count
    };

    let action = ctx.params.action_offset;
    match ctx.shape.kind {
        LayoutKind::Graphics { shape } => {
            let base_vertex_reg = seq.stage(ShaderStage::Vertex).and_then(|m| m.vertex_offset_reg);
            match shape {
                DrawShape::Draw => {
                    let args: DrawArgs = seq.field(action);
                    if args.vertex_count == 0 || args.instance_count == 0 {
                        return;
                    }
                    if let Some(reg) = base_vertex_reg {
                        em.set_sh_reg(reg, &[args.first_vertex, args.first_instance]);
                    }
                    em.num_instances(args.instance_count);
                    em.draw_index_auto(args.vertex_count);
                }
                DrawShape::DrawIndexed => {
                    let args: DrawIndexedArgs = seq.field(action);
                    if args.index_count == 0 || args.instance_count == 0 {
                        return;
                    }
                    if let Some(reg) = base_vertex_reg {
                        em.set_sh_reg(reg, &[args.vertex_offset as u32, args.first_instance]);
                    }
                    em.num_instances(args.instance_count);
                    em.draw_index_offset_2(max_index_count, args.first_index, args.index_count);
                }
                DrawShape::DrawCount { indexed } => {
                    let args: DrawCountArgs = seq.field(action);
                    if args.command_count == 0 {
                        return;
                    }
                    em.set_draw_indirect_base(args.address);
                    em.draw_indirect_multi(
                        indexed,
                        &MultiDrawArgs {
                            base_vertex_reg: base_vertex_reg.unwrap_or(0),
                            draw_index_reg: 0,
                            count: args.command_count,
                            count_address: 0,
                            stride: args.stride,
                        },
                    );
                }
            }
        }
        LayoutKind::Dispatch => {
            let args: DispatchArgs = seq.field(action);
            if args.is_empty() {
                return;
            }
            let cs = seq.stage(ShaderStage::Compute);
            emit_grid(em, cs, seq.record_address + u64::from(action), &args);
            em.dispatch_direct(args.x, args.y, args.z, compute_initiator(cs));
        }
        LayoutKind::MeshOnly { task: false } => {
            let args: DispatchArgs = seq.field(action);
            if args.is_empty() {
                return;
            }
            emit_grid(em, seq.stage(ShaderStage::Mesh), seq.record_address + u64::from(action), &args);
            em.dispatch_mesh_direct(args.x, args.y, args.z);
        }
        LayoutKind::MeshOnly { task: true } => {
            let args: DispatchArgs = seq.field(action);
            if args.is_empty() {
                return;
            }
            let ms = seq.stage(ShaderStage::Mesh);
            em.dispatch_taskmesh_gfx(
                ms.and_then(|m| m.grid_size_reg).unwrap_or(0),
                ms.and_then(|m| m.ring_entry_reg).unwrap_or(0),
                0,
            );
        }
        LayoutKind::RayTrace => {
            let args: TraceRaysArgs = seq.field(action);
            if args.width == 0 || args.height == 0 || args.depth == 0 {
                return;
            }
            let cs = seq.stage(ShaderStage::Compute);
            let table = seq.record_address + u64::from(action);
            if let Some(reg) = cs.and_then(|m| m.sbt_reg) {
                em.set_sh_reg_ptr(reg, table);
            }
            if let Some(reg) = cs.and_then(|m| m.launch_size_reg) {
                em.set_sh_reg_ptr(reg, table + u64::from(TraceRaysArgs::LAUNCH_SIZE_OFFSET));
            }
            em.dispatch_direct(args.width, args.height, args.depth, compute_initiator(cs));
        }
    }
}

fn emit_secondary(ctx: &ProgramContext<'_>, seq: &mut Sequence<'_>, em: &mut PacketEmitter<'_>) {
    emit_marker(ctx, seq, em);
    if ctx.shape.updates_push_constants() {
        emit_push_constants(ctx, seq, em, ctx.shape.secondary_stages());
    }

    let action = ctx.params.action_offset;
    let args: DispatchArgs = seq.field(action);
    if args.is_empty() {
        return;
    }
    let ts = seq.stage(ShaderStage::Task);
    emit_grid(em, ts, seq.record_address + u64::from(action), &args);
    em.dispatch_taskmesh_direct_ace(
        args.x,
        args.y,
        args.z,
        ts.and_then(|m| m.ring_entry_reg).unwrap_or(0),
        compute_initiator(ts),
    );
}

/// Push-constant updates for `stages`: the upload copy through a pointer, inline words, or both.
fn emit_push_constants(
    ctx: &ProgramContext<'_>,
    seq: &mut Sequence<'_>,
    em: &mut PacketEmitter<'_>,
    stages: StageFlags,
) {
    let push_size = ctx.upload_slot.push_size as usize;
    let copied = push_size.min(seq.push_words.len() * 4);
    for (i, word) in seq.push_words.iter().enumerate() {
        if (i + 1) * 4 > copied {
            break;
        }
        seq.upload[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    for stage in stages.stages() {
        let Some(meta) = seq.pipeline.stage(stage).copied() else {
            continue;
        };
        if let Some(reg) = meta.push_constant_reg {
            if push_size != 0 {
                em.set_sh_reg_ptr(reg, seq.upload_address);
            }
        }
        if let Some(reg) = meta.inline_push_reg {
            let values: Vec<u32> = (0..64usize)
                .filter(|w| meta.inline_push_mask & (1u64 << w) != 0)
                .map(|w| seq.push_words.get(w).copied().unwrap_or(0))
                .collect();
            if !values.is_empty() {
                em.set_sh_reg(reg, &values);
            }
        }
    }
}

/// Fill the per-sequence vertex buffer table and point the vertex stage at it.
fn emit_vertex_buffers(ctx: &ProgramContext<'_>, seq: &mut Sequence<'_>, em: &mut PacketEmitter<'_>) {
    let table = ctx.upload_slot.vertex_offset as usize;
    for (slot, entry) in ctx.vertex_table.iter().enumerate() {
        let descriptor = match entry.input_offset() {
            Some(offset) => seq.field::<VertexBufferArgs>(offset),
            None => VertexBufferArgs {
                address: entry.address,
                size: entry.size,
                stride: entry.stride,
            },
        };
        let at = table + slot * core::mem::size_of::<VertexBufferArgs>();
        seq.upload[at..at + core::mem::size_of::<VertexBufferArgs>()]
            .copy_from_slice(bytemuck::bytes_of(&descriptor));
    }

    if let Some(reg) = seq.stage(ShaderStage::Vertex).and_then(|m| m.vertex_buffer_table_reg) {
        em.set_sh_reg_ptr(reg, seq.upload_address + table as u64);
    }
}

/// Rebind the index buffer; returns the index count the new buffer can hold.
fn emit_index_buffer(ctx: &ProgramContext<'_>, seq: &Sequence<'_>, em: &mut PacketEmitter<'_>) -> u32 {
    let args: IndexBufferArgs = seq.field(ctx.params.index_buffer_offset);
    let mode = if ctx.flags.contains(ParamFlags::DXGI_INDEX_TYPES) {
        IndexTypeMode::Dxgi
    } else {
        IndexTypeMode::Vulkan
    };
    let index_type = mode.resolve(args.index_type);
    let max_index_count = index_type.max_index_count(args.size);
    em.index_type(index_type.hw_value());
    em.index_base(args.address);
    em.index_buffer_size(max_index_count);
    max_index_count
}

fn emit_grid(
    em: &mut PacketEmitter<'_>,
    meta: Option<&StageMetadata>,
    args_address: u64,
    args: &DispatchArgs,
) {
    let Some(meta) = meta else {
        return;
    };
    let Some(reg) = meta.grid_size_reg else {
        return;
    };
    match meta.grid_size_form {
        GridSizeForm::Immediate => em.set_sh_reg(reg, &[args.x, args.y, args.z]),
        GridSizeForm::Pointer => em.set_sh_reg_ptr(reg, args_address),
    }
}

fn compute_initiator(meta: Option<&StageMetadata>) -> u32 {
    let mut initiator = DISPATCH_COMPUTE_SHADER_EN | DISPATCH_FORCE_START_AT_000 | DISPATCH_ORDER_MODE;
    if meta.is_some_and(|m| m.wave_size == 32) {
        initiator |= DISPATCH_CS_W32_EN;
    }
    initiator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_follows_wave_size() {
        let base = DISPATCH_COMPUTE_SHADER_EN | DISPATCH_FORCE_START_AT_000 | DISPATCH_ORDER_MODE;
        assert_eq!(compute_initiator(None), base);
        let w32 = StageMetadata {
            wave_size: 32,
            ..StageMetadata::default()
        };
        assert_eq!(compute_initiator(Some(&w32)), base | DISPATCH_CS_W32_EN);
        assert_eq!(compute_initiator(Some(&StageMetadata::default())), base);
    }

    #[test]
    fn grid_takes_immediate_or_pointer_form() {
        let args = DispatchArgs { x: 2, y: 3, z: 4 };
        let mut buf = [0u8; 64];

        let mut em = PacketEmitter::new(&mut buf);
        emit_grid(&mut em, None, 0x1000, &args);
        assert_eq!(em.cursor(), 0);

        let immediate = StageMetadata {
            grid_size_reg: Some(0x30),
            ..StageMetadata::default()
        };
        emit_grid(&mut em, Some(&immediate), 0x1000, &args);
        assert_eq!(em.cursor(), 20);

        let pointer = StageMetadata {
            grid_size_form: GridSizeForm::Pointer,
            ..immediate
        };
        emit_grid(&mut em, Some(&pointer), 0x1000, &args);
        assert_eq!(em.cursor(), 36);
    }
}
