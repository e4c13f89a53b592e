//! Minimal command processor for generated streams.
//!
//! This is not a GPU model. It walks packets the way an engine's front end does, follows
//! `INDIRECT_BUFFER` jumps and calls, and records the work that would be launched so tests and
//! tooling can check what a generated buffer actually does.

use std::collections::HashMap;

use dgc_packets::packet::{IB_CHAIN, IB_SIZE_MASK, MARKER_MAGIC, MULTI_DRAW_COUNT_INDIRECT_ENABLE};
use dgc_packets::{DecodeError, Opcode, PacketIter};
use thiserror::Error;

use crate::config::{DeviceRules, Engine, EngineRules};
use crate::memory::{DeviceMemory, MemoryError};

/// Upper bound on jumps followed in one run; a loop in the chain would otherwise never end.
pub const MAX_JUMPS: usize = 4096;

/// Nested calls may go one level deep.
const MAX_CALL_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("failed to decode packet stream at 0x{address:x}: {error:?}")]
    Decode { address: u64, error: DecodeError },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("unknown opcode 0x{opcode:02x} at 0x{address:x}")]
    UnknownOpcode { opcode: u8, address: u64 },

    #[error("{opcode:?} packet at 0x{address:x} carries {len} payload dwords")]
    ShortPacket { opcode: Opcode, address: u64, len: usize },

    #[error("nested indirect buffer call at 0x{address:x} on an engine that can only chain")]
    NestedCallOnChainingEngine { address: u64 },

    #[error("indirect buffer call at 0x{address:x} exceeds the nesting depth")]
    NestingTooDeep { address: u64 },

    #[error("more than {} jumps followed; the chain probably loops", MAX_JUMPS)]
    JumpLimit,
}

/// Work and control flow observed while replaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    SetShReg {
        reg: u16,
        values: Vec<u32>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_base: u64,
        index_type: u32,
        max_index_count: u32,
        first_index: u32,
        index_count: u32,
        instance_count: u32,
    },
    DrawIndirectMulti {
        indexed: bool,
        data_address: u64,
        count: u32,
        stride: u32,
        base_vertex_reg: u16,
        count_indirect: bool,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
        initiator: u32,
    },
    DispatchMesh {
        x: u32,
        y: u32,
        z: u32,
    },
    TaskMeshGfx {
        xyz_reg: u16,
        ring_entry_reg: u16,
    },
    TaskMeshAce {
        x: u32,
        y: u32,
        z: u32,
        ring_entry_reg: u16,
    },
    Marker {
        sequence: u32,
        kind: u32,
    },
    Jump {
        from: u64,
        address: u64,
        size_dw: u32,
        chain: bool,
    },
}

impl ReplayEvent {
    /// Whether the event launches GPU work.
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            ReplayEvent::Draw { .. }
                | ReplayEvent::DrawIndexed { .. }
                | ReplayEvent::DrawIndirectMulti { .. }
                | ReplayEvent::Dispatch { .. }
                | ReplayEvent::DispatchMesh { .. }
                | ReplayEvent::TaskMeshGfx { .. }
                | ReplayEvent::TaskMeshAce { .. }
        )
    }
}

struct Frame {
    address: u64,
    bytes: Vec<u8>,
    offset: usize,
}

impl Frame {
    fn load(memory: &dyn DeviceMemory, address: u64, size_dw: u32) -> Result<Self, MemoryError> {
        Ok(Self {
            address,
            bytes: memory.read_vec(address, size_dw as usize * 4)?,
            offset: 0,
        })
    }
}

/// Payload dwords [`CommandProcessor`] reads from each packet kind.
fn min_payload_dwords(opcode: Opcode) -> usize {
    match opcode {
        Opcode::Nop => 0,
        Opcode::IndexType
        | Opcode::IndexBufferSize
        | Opcode::NumInstances
        | Opcode::DrawIndexAuto
        | Opcode::DispatchTaskMeshGfx => 1,
        Opcode::IndexBase | Opcode::SetShReg => 2,
        Opcode::SetBase
        | Opcode::DrawIndexOffset2
        | Opcode::DispatchMeshDirect
        | Opcode::IndirectBuffer => 3,
        Opcode::DispatchDirect | Opcode::DispatchTaskMeshDirectAce => 4,
        Opcode::DrawIndirectMulti | Opcode::DrawIndexIndirectMulti => 8,
    }
}

/// Front end of one engine.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    rules: EngineRules,
    sh_regs: HashMap<u16, u32>,
    index_type: u32,
    index_base: u64,
    max_index_count: u32,
    num_instances: u32,
    draw_indirect_base: u64,
    jumps: usize,
}

impl CommandProcessor {
    pub fn new(rules: EngineRules) -> Self {
        Self {
            rules,
            sh_regs: HashMap::new(),
            index_type: 0,
            index_base: 0,
            max_index_count: 0,
            num_instances: 1,
            draw_indirect_base: 0,
            jumps: 0,
        }
    }

    pub fn for_engine(rules: &DeviceRules, engine: Engine) -> Self {
        Self::new(*rules.engine(engine))
    }

    /// Last value written to `reg`.
    pub fn sh_reg(&self, reg: u16) -> Option<u32> {
        self.sh_regs.get(&reg).copied()
    }

    /// Address held by the register pair starting at `reg`.
    pub fn sh_reg_u64(&self, reg: u16) -> Option<u64> {
        let lo = self.sh_reg(reg)?;
        let hi = self.sh_reg(reg.wrapping_add(1))?;
        Some(u64::from(lo) | (u64::from(hi) << 32))
    }

    pub fn num_instances(&self) -> u32 {
        self.num_instances
    }

    /// Index count bound by the last `INDEX_BUFFER_SIZE`.
    pub fn max_index_count(&self) -> u32 {
        self.max_index_count
    }

    /// Execute `size_dw` dwords at `address` until the stream (and every chained stream) ends.
    pub fn run(
        &mut self,
        memory: &dyn DeviceMemory,
        address: u64,
        size_dw: u32,
    ) -> Result<Vec<ReplayEvent>, ReplayError> {
        self.jumps = 0;
        let mut events = Vec::new();
        let mut stack = vec![Frame::load(memory, address, size_dw)?];

        while let Some(frame) = stack.last_mut() {
            if frame.offset >= frame.bytes.len() {
                stack.pop();
                continue;
            }

            let packet_address = frame.address + frame.offset as u64;
            let decode_err = |error| ReplayError::Decode {
                address: packet_address,
                error,
            };
            let packet = PacketIter::new(&frame.bytes[frame.offset..])
                .map_err(decode_err)?
                .next()
                .ok_or(ReplayError::Decode {
                    address: packet_address,
                    error: DecodeError::UnalignedLength { len: 0 },
                })?
                .map_err(decode_err)?;
            frame.offset += packet.byte_len();

            let Some(opcode) = packet.opcode() else {
                return Err(ReplayError::UnknownOpcode {
                    opcode: packet.header.opcode_raw,
                    address: packet_address,
                });
            };
            let w: Vec<u32> = packet.words().collect();
            if w.len() < min_payload_dwords(opcode) {
                return Err(ReplayError::ShortPacket {
                    opcode,
                    address: packet_address,
                    len: w.len(),
                });
            }

            if opcode == Opcode::IndirectBuffer {
                let target = u64::from(w[0]) | (u64::from(w[1]) << 32);
                let size_dw = w[2] & IB_SIZE_MASK;
                let chain = w[2] & IB_CHAIN != 0;
                events.push(ReplayEvent::Jump {
                    from: packet_address,
                    address: target,
                    size_dw,
                    chain,
                });

                self.jumps += 1;
                if self.jumps > MAX_JUMPS {
                    return Err(ReplayError::JumpLimit);
                }
                if chain {
                    stack.pop();
                } else if !self.rules.supports_nesting {
                    return Err(ReplayError::NestedCallOnChainingEngine {
                        address: packet_address,
                    });
                } else if stack.len() >= MAX_CALL_DEPTH {
                    return Err(ReplayError::NestingTooDeep {
                        address: packet_address,
                    });
                }
                stack.push(Frame::load(memory, target, size_dw)?);
                continue;
            }

            if let Some(event) = self.execute(opcode, &w) {
                events.push(event);
            }
        }

        tracing::trace!(events = events.len(), jumps = self.jumps, "replay finished");
        Ok(events)
    }

    fn execute(&mut self, opcode: Opcode, w: &[u32]) -> Option<ReplayEvent> {
        let u64_at = |i: usize| u64::from(w[i]) | (u64::from(w[i + 1]) << 32);
        match opcode {
            Opcode::Nop => {
                if w.len() == 3 && w[0] == MARKER_MAGIC {
                    return Some(ReplayEvent::Marker {
                        sequence: w[1],
                        kind: w[2],
                    });
                }
                None
            }
            Opcode::SetShReg => {
                let reg = w[0] as u16;
                for (i, &v) in w[1..].iter().enumerate() {
                    self.sh_regs.insert(reg.wrapping_add(i as u16), v);
                }
                Some(ReplayEvent::SetShReg {
                    reg,
                    values: w[1..].to_vec(),
                })
            }
            Opcode::SetBase => {
                self.draw_indirect_base = u64_at(1);
                None
            }
            Opcode::IndexType => {
                self.index_type = w[0];
                None
            }
            Opcode::IndexBase => {
                self.index_base = u64_at(0);
                None
            }
            Opcode::IndexBufferSize => {
                self.max_index_count = w[0];
                None
            }
            Opcode::NumInstances => {
                self.num_instances = w[0];
                None
            }
            Opcode::DrawIndexAuto => Some(ReplayEvent::Draw {
                vertex_count: w[0],
                instance_count: self.num_instances,
            }),
            Opcode::DrawIndexOffset2 => Some(ReplayEvent::DrawIndexed {
                index_base: self.index_base,
                index_type: self.index_type,
                max_index_count: w[0],
                first_index: w[1],
                index_count: w[2],
                instance_count: self.num_instances,
            }),
            Opcode::DrawIndirectMulti | Opcode::DrawIndexIndirectMulti => {
                Some(ReplayEvent::DrawIndirectMulti {
                    indexed: opcode == Opcode::DrawIndexIndirectMulti,
                    data_address: self.draw_indirect_base + u64::from(w[0]),
                    count: w[4],
                    stride: w[7],
                    base_vertex_reg: w[1] as u16,
                    count_indirect: w[3] & MULTI_DRAW_COUNT_INDIRECT_ENABLE != 0,
                })
            }
            Opcode::DispatchDirect => Some(ReplayEvent::Dispatch {
                x: w[0],
                y: w[1],
                z: w[2],
                initiator: w[3],
            }),
            Opcode::DispatchMeshDirect => Some(ReplayEvent::DispatchMesh {
                x: w[0],
                y: w[1],
                z: w[2],
            }),
            Opcode::DispatchTaskMeshGfx => Some(ReplayEvent::TaskMeshGfx {
                xyz_reg: w[0] as u16,
                ring_entry_reg: (w[0] >> 16) as u16,
            }),
            Opcode::DispatchTaskMeshDirectAce => Some(ReplayEvent::TaskMeshAce {
                x: w[0],
                y: w[1],
                z: w[2],
                ring_entry_reg: w[3] as u16,
            }),
            Opcode::IndirectBuffer => None,
        }
    }
}
