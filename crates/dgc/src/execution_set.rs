//! Indirect execution sets: GPU-resident pipeline tables selectable per sequence.
//!
//! Each entry is an [`ExecutionSetEntryHeader`] followed by up to `max_cmd_words` pre-encoded
//! command words that bind the pipeline. The generator copies those words into the sequence and
//! resolves registers from the entry's own stage table.

use bytemuck::{Pod, Zeroable};

use crate::arena::{align_up, LinearAllocator};
use crate::error::DgcError;
use crate::memory::{DeviceMemory, MemoryError};
use crate::metadata::{PipelineMetadata, ShaderStage, StageFlags, StageRecord, MAX_INLINE_PUSH_WORDS};

const ENTRY_ALIGNMENT: u64 = 16;

/// Which pipelines an execution set holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionSetKind {
    Compute,
    Graphics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionSetDesc {
    pub kind: ExecutionSetKind,
    pub entry_count: u32,
    /// Largest pipeline command blob any entry may hold.
    pub max_cmd_words: u32,
    /// Largest push-constant block of any entry.
    pub push_constant_size: u32,
    pub vertex_binding_count: u32,
}

/// Worst-case sizing inputs of a set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExecutionSetBounds {
    pub max_cmd_words: u32,
    pub push_constant_size: u32,
    pub vertex_binding_count: u32,
}

/// Fixed part of every entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ExecutionSetEntryHeader {
    pub stages: [StageRecord; ShaderStage::COUNT],
    pub push_constant_size: u32,
    pub vertex_binding_count: u32,
    pub command_word_count: u32,
    pub reserved: u32,
}

pub const ENTRY_HEADER_BYTES: u64 = core::mem::size_of::<ExecutionSetEntryHeader>() as u64;

impl ExecutionSetEntryHeader {
    fn empty() -> Self {
        Self {
            stages: [StageRecord::UNASSIGNED; ShaderStage::COUNT],
            push_constant_size: 0,
            vertex_binding_count: 0,
            command_word_count: 0,
            reserved: 0,
        }
    }

    pub fn pipeline(&self) -> PipelineMetadata {
        PipelineMetadata::from_stage_records(
            &self.stages,
            self.push_constant_size,
            self.vertex_binding_count,
        )
    }
}

/// Byte stride between consecutive entries.
pub fn entry_stride(max_cmd_words: u32) -> u64 {
    align_up(ENTRY_HEADER_BYTES + u64::from(max_cmd_words) * 4, ENTRY_ALIGNMENT)
}

/// Read the entry at `address` as the generator sees it.
///
/// `max_cmd_words` caps the copied payload so a corrupt header can never overrun the slot
/// reserved by the cost model.
pub fn read_entry(
    memory: &dyn DeviceMemory,
    address: u64,
    max_cmd_words: u32,
) -> Result<(ExecutionSetEntryHeader, Vec<u32>), MemoryError> {
    let bytes = memory.read_vec(address, ENTRY_HEADER_BYTES as usize)?;
    let header: ExecutionSetEntryHeader = bytemuck::pod_read_unaligned(&bytes);
    let words = header.command_word_count.min(max_cmd_words) as usize;
    let payload = memory.read_vec(address + ENTRY_HEADER_BYTES, words * 4)?;
    let words = payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((header, words))
}

#[derive(Debug)]
pub struct IndirectExecutionSet {
    desc: ExecutionSetDesc,
    address: u64,
    stride: u64,
    alive: bool,
}

impl IndirectExecutionSet {
    /// Allocate the set and reset every entry to "no pipeline".
    pub fn create(
        desc: ExecutionSetDesc,
        allocator: &mut dyn LinearAllocator,
        memory: &dyn DeviceMemory,
    ) -> Result<Self, DgcError> {
        if desc.entry_count == 0 {
            return Err(DgcError::InvalidRequest("execution set needs at least one entry"));
        }
        let stride = entry_stride(desc.max_cmd_words);
        let size = stride * u64::from(desc.entry_count);
        let alloc = allocator
            .alloc(size, ENTRY_ALIGNMENT)
            .ok_or(DgcError::OutOfMemory { size })?;

        let empty = ExecutionSetEntryHeader::empty();
        for i in 0..u64::from(desc.entry_count) {
            memory.write(alloc.device_address + i * stride, bytemuck::bytes_of(&empty))?;
        }

        tracing::debug!(
            kind = ?desc.kind,
            entries = desc.entry_count,
            max_cmd_words = desc.max_cmd_words,
            address = alloc.device_address,
            "created execution set"
        );

        Ok(Self {
            desc,
            address: alloc.device_address,
            stride,
            alive: true,
        })
    }

    /// Store `pipeline` at `index`. An out-of-range index is a caller bug.
    pub fn update(
        &mut self,
        memory: &dyn DeviceMemory,
        index: u32,
        pipeline: &PipelineMetadata,
    ) -> Result<(), DgcError> {
        assert!(self.alive, "update of a destroyed execution set");
        assert!(
            index < self.desc.entry_count,
            "execution set index {index} out of range ({} entries)",
            self.desc.entry_count
        );

        let stages = pipeline.stage_flags();
        let kind_ok = match self.desc.kind {
            ExecutionSetKind::Compute => stages == StageFlags::COMPUTE,
            ExecutionSetKind::Graphics => {
                stages.intersects(StageFlags::VERTEX | StageFlags::MESH)
                    && !stages.contains(StageFlags::COMPUTE)
            }
        };
        if !kind_ok {
            return Err(DgcError::ExecutionSetMismatch {
                reason: "pipeline stages do not match the set kind",
            });
        }
        if pipeline.command_words.len() > self.desc.max_cmd_words as usize {
            return Err(DgcError::ExecutionSetEntryTooLarge {
                words: pipeline.command_words.len(),
                max: self.desc.max_cmd_words,
            });
        }
        if pipeline.push_constant_size > self.desc.push_constant_size {
            return Err(DgcError::ExecutionSetMismatch {
                reason: "push constant block larger than the set allows",
            });
        }
        if pipeline.vertex_binding_count > self.desc.vertex_binding_count {
            return Err(DgcError::ExecutionSetMismatch {
                reason: "more vertex bindings than the set allows",
            });
        }
        let too_many_inline = ShaderStage::ALL
            .into_iter()
            .filter_map(|s| pipeline.stage(s))
            .any(|m| m.inline_push_words() > MAX_INLINE_PUSH_WORDS);
        if too_many_inline {
            return Err(DgcError::ExecutionSetMismatch {
                reason: "too many inline push constant words",
            });
        }

        let header = ExecutionSetEntryHeader {
            stages: pipeline.stage_records(),
            push_constant_size: pipeline.push_constant_size,
            vertex_binding_count: pipeline.vertex_binding_count,
            command_word_count: pipeline.command_words.len() as u32,
            reserved: 0,
        };
        let entry = self.entry_address(index);
        memory.write(entry, bytemuck::bytes_of(&header))?;
        memory.write(
            entry + ENTRY_HEADER_BYTES,
            bytemuck::cast_slice(pipeline.command_words.as_slice()),
        )?;
        Ok(())
    }

    /// Mark the set dead. Its memory belongs to the allocator's owner.
    pub fn destroy(&mut self) {
        assert!(self.alive, "execution set destroyed twice");
        self.alive = false;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn desc(&self) -> &ExecutionSetDesc {
        &self.desc
    }

    pub fn address(&self) -> u64 {
        assert!(self.alive, "use of a destroyed execution set");
        self.address
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn entry_count(&self) -> u32 {
        self.desc.entry_count
    }

    pub fn entry_address(&self, index: u32) -> u64 {
        self.address() + u64::from(index) * self.stride
    }

    pub fn bounds(&self) -> ExecutionSetBounds {
        ExecutionSetBounds {
            max_cmd_words: self.desc.max_cmd_words,
            push_constant_size: self.desc.push_constant_size,
            vertex_binding_count: self.desc.vertex_binding_count,
        }
    }
}
