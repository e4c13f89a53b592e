//! Cursor-based packet writer.
//!
//! Unlike a growable stream builder, [`PacketEmitter`] writes into a fixed slice: generated
//! command buffers reserve their space up front, and overrunning a reservation is a bug in
//! the sizing code, so every append asserts that the packet fits.

use crate::packet::{
    packet_header, Opcode, BASE_INDEX_DRAW_INDIRECT, DI_SRC_SEL_AUTO_INDEX, DI_SRC_SEL_DMA,
    IB_CHAIN, IB_SIZE_MASK, IB_VALID, MARKER_MAGIC, MAX_PACKET_DWORDS, MULTI_DRAW_COUNT_INDIRECT_ENABLE,
    MULTI_DRAW_INDEX_ENABLE, MULTI_DRAW_REG_MASK, NOP_FILLER,
};

/// Arguments of `DRAW_INDIRECT_MULTI` / `DRAW_INDEX_INDIRECT_MULTI`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultiDrawArgs {
    /// Register receiving the base vertex (start instance goes to `+1`). `0` disables.
    pub base_vertex_reg: u16,
    /// Register receiving the draw index. `0` disables.
    pub draw_index_reg: u16,
    pub count: u32,
    /// Address of a GPU-side count clamp; `0` when the count is direct.
    pub count_address: u64,
    pub stride: u32,
}

#[derive(Debug)]
pub struct PacketEmitter<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> PacketEmitter<'a> {
    /// Wrap `buf`. Its length must be a multiple of 4.
    pub fn new(buf: &'a mut [u8]) -> Self {
        assert_eq!(buf.len() % 4, 0, "packet buffer must be dword sized");
        Self { buf, cursor: 0 }
    }

    /// Byte offset of the next packet.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining_dwords(&self) -> usize {
        (self.buf.len() - self.cursor) / 4
    }

    /// Move the cursor to `offset` without writing (used to place packets at fixed slots).
    pub fn seek(&mut self, offset: usize) {
        assert!(offset % 4 == 0 && offset <= self.buf.len());
        self.cursor = offset;
    }

    fn write_u32_at(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn push(&mut self, v: u32) {
        let at = self.cursor;
        self.write_u32_at(at, v);
        self.cursor += 4;
    }

    fn begin(&mut self, opcode: Opcode, payload_dwords: usize) {
        assert!(
            1 + payload_dwords <= self.remaining_dwords(),
            "{opcode:?} packet ({} dwords) overruns reservation ({} dwords left)",
            1 + payload_dwords,
            self.remaining_dwords()
        );
        self.push(packet_header(opcode, payload_dwords));
    }

    /// Copy pre-encoded command words verbatim.
    pub fn raw_words(&mut self, words: &[u32]) {
        assert!(words.len() <= self.remaining_dwords(), "raw words overrun reservation");
        for &w in words {
            self.push(w);
        }
    }

    /// Emit exactly `dwords` dwords of NOP.
    pub fn nop(&mut self, dwords: usize) {
        assert!(dwords <= self.remaining_dwords(), "nop padding overruns reservation");
        let mut left = dwords;
        while left > 0 {
            if left == 1 {
                self.push(NOP_FILLER);
                left = 0;
                continue;
            }
            let mut n = left.min(MAX_PACKET_DWORDS);
            if left - n == 1 {
                // Never leave a lone dword behind a maximal packet; split evenly instead.
                n -= 1;
            }
            self.push(packet_header(Opcode::Nop, n - 1));
            // Payload contents are ignored by the processor; keep them zeroed so generated
            // buffers are deterministic.
            let end = self.cursor + (n - 1) * 4;
            self.buf[self.cursor..end].fill(0);
            self.cursor = end;
            left -= n;
        }
    }

    /// NOP-fill from the cursor up to byte offset `end`.
    pub fn pad_to(&mut self, end: usize) {
        assert!(end >= self.cursor && end <= self.buf.len() && end % 4 == 0);
        self.nop((end - self.cursor) / 4);
    }

    /// NOP-fill the rest of the slice.
    pub fn pad_to_end(&mut self) {
        let end = self.buf.len();
        self.pad_to(end);
    }

    pub fn set_sh_reg(&mut self, reg: u16, values: &[u32]) {
        assert!(!values.is_empty());
        self.begin(Opcode::SetShReg, 1 + values.len());
        self.push(u32::from(reg));
        for &v in values {
            self.push(v);
        }
    }

    /// Write a 64-bit address into the register pair starting at `reg`.
    pub fn set_sh_reg_ptr(&mut self, reg: u16, address: u64) {
        self.set_sh_reg(reg, &[address as u32, (address >> 32) as u32]);
    }

    /// `INDIRECT_BUFFER`: call (`chain == false`) or jump (`chain == true`) into `size_dw`
    /// dwords at `address`.
    pub fn indirect_buffer(&mut self, address: u64, size_dw: u32, chain: bool) {
        assert!(size_dw <= IB_SIZE_MASK, "indirect buffer too large ({size_dw} dwords)");
        self.begin(Opcode::IndirectBuffer, 3);
        self.push(address as u32);
        self.push((address >> 32) as u32);
        let mut control = size_dw | IB_VALID;
        if chain {
            control |= IB_CHAIN;
        }
        self.push(control);
    }

    pub fn index_type(&mut self, hw_index_type: u32) {
        self.begin(Opcode::IndexType, 1);
        self.push(hw_index_type);
    }

    pub fn index_base(&mut self, address: u64) {
        self.begin(Opcode::IndexBase, 2);
        self.push(address as u32);
        self.push((address >> 32) as u32);
    }

    pub fn index_buffer_size(&mut self, max_index_count: u32) {
        self.begin(Opcode::IndexBufferSize, 1);
        self.push(max_index_count);
    }

    pub fn num_instances(&mut self, instance_count: u32) {
        self.begin(Opcode::NumInstances, 1);
        self.push(instance_count);
    }

    pub fn draw_index_auto(&mut self, vertex_count: u32) {
        self.begin(Opcode::DrawIndexAuto, 2);
        self.push(vertex_count);
        self.push(DI_SRC_SEL_AUTO_INDEX);
    }

    pub fn draw_index_offset_2(&mut self, max_index_count: u32, first_index: u32, index_count: u32) {
        self.begin(Opcode::DrawIndexOffset2, 4);
        self.push(max_index_count);
        self.push(first_index);
        self.push(index_count);
        self.push(DI_SRC_SEL_DMA);
    }

    pub fn set_draw_indirect_base(&mut self, address: u64) {
        self.begin(Opcode::SetBase, 3);
        self.push(BASE_INDEX_DRAW_INDIRECT);
        self.push(address as u32);
        self.push((address >> 32) as u32);
    }

    pub fn draw_indirect_multi(&mut self, indexed: bool, args: &MultiDrawArgs) {
        let opcode = if indexed {
            Opcode::DrawIndexIndirectMulti
        } else {
            Opcode::DrawIndirectMulti
        };
        let base_vertex_reg = u32::from(args.base_vertex_reg);
        let start_instance_reg = if args.base_vertex_reg == 0 {
            0
        } else {
            base_vertex_reg + 1
        };
        let mut draw_index = u32::from(args.draw_index_reg) & MULTI_DRAW_REG_MASK;
        if args.draw_index_reg != 0 {
            draw_index |= MULTI_DRAW_INDEX_ENABLE;
        }
        if args.count_address != 0 {
            draw_index |= MULTI_DRAW_COUNT_INDIRECT_ENABLE;
        }

        self.begin(opcode, 9);
        self.push(0); // data offset from the SET_BASE address
        self.push(base_vertex_reg);
        self.push(start_instance_reg);
        self.push(draw_index);
        self.push(args.count);
        self.push(args.count_address as u32);
        self.push((args.count_address >> 32) as u32);
        self.push(args.stride);
        self.push(if indexed { DI_SRC_SEL_DMA } else { DI_SRC_SEL_AUTO_INDEX });
    }

    pub fn dispatch_direct(&mut self, x: u32, y: u32, z: u32, initiator: u32) {
        self.begin(Opcode::DispatchDirect, 4);
        self.push(x);
        self.push(y);
        self.push(z);
        self.push(initiator);
    }

    pub fn dispatch_mesh_direct(&mut self, x: u32, y: u32, z: u32) {
        self.begin(Opcode::DispatchMeshDirect, 4);
        self.push(x);
        self.push(y);
        self.push(z);
        self.push(DI_SRC_SEL_AUTO_INDEX);
    }

    /// Graphics half of a task+mesh launch; dimensions come from the task ring.
    pub fn dispatch_taskmesh_gfx(&mut self, xyz_reg: u16, ring_entry_reg: u16, draw_id_reg: u16) {
        self.begin(Opcode::DispatchTaskMeshGfx, 3);
        self.push(u32::from(xyz_reg) | (u32::from(ring_entry_reg) << 16));
        self.push(u32::from(draw_id_reg));
        self.push(DI_SRC_SEL_AUTO_INDEX);
    }

    /// Compute-engine half of a task+mesh launch.
    pub fn dispatch_taskmesh_direct_ace(&mut self, x: u32, y: u32, z: u32, ring_entry_reg: u16, initiator: u32) {
        self.begin(Opcode::DispatchTaskMeshDirectAce, 5);
        self.push(x);
        self.push(y);
        self.push(z);
        self.push(u32::from(ring_entry_reg));
        self.push(initiator);
    }

    /// Debug marker: a NOP packet carrying a tag the replay tooling recognises.
    pub fn marker(&mut self, sequence: u32, kind: u32) {
        self.begin(Opcode::Nop, 3);
        self.push(MARKER_MAGIC);
        self.push(sequence);
        self.push(kind);
    }
}
