//! Packet layouts.
//!
//! Every packet is one header dword followed by `N >= 1` payload dwords:
//!
//! ```text
//! header = 0xC000_0000 | ((N - 1) & 0x3FFF) << 16 | opcode << 8
//! ```
//!
//! The word [`NOP_FILLER`] is a complete one-dword NOP and is the only packet without a payload.

/// Type-3 packet marker in bits 30..31 of the header.
pub const PACKET_TYPE3: u32 = 0xC000_0000;
const PACKET_TYPE_MASK: u32 = 0xC000_0000;
const COUNT_SHIFT: u32 = 16;
const COUNT_MASK: u32 = 0x3FFF;
const OPCODE_SHIFT: u32 = 8;

/// One-dword NOP. Encodes as a NOP header with the maximum count, so real NOP packets are
/// limited to [`MAX_PAYLOAD_DWORDS`] to keep the two distinguishable.
pub const NOP_FILLER: u32 = 0xFFFF_1000;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD_DWORDS: usize = COUNT_MASK as usize;

/// Largest packet (header included) the emitter will produce.
pub const MAX_PACKET_DWORDS: usize = MAX_PAYLOAD_DWORDS + 1;

/// Size of an `INDIRECT_BUFFER` packet, the minimal jump.
pub const JUMP_PACKET_DWORDS: usize = 4;
pub const JUMP_PACKET_BYTES: u32 = (JUMP_PACKET_DWORDS * 4) as u32;

/* ------------------------------ INDIRECT_BUFFER ------------------------------ */

pub const IB_SIZE_MASK: u32 = 0x000F_FFFF;
pub const IB_CHAIN: u32 = 1 << 20;
pub const IB_VALID: u32 = 1 << 23;

/* --------------------------------- SET_BASE ---------------------------------- */

/// `SET_BASE` index selecting the indirect draw argument base.
pub const BASE_INDEX_DRAW_INDIRECT: u32 = 1;

/* --------------------------------- initiators -------------------------------- */

pub const DI_SRC_SEL_DMA: u32 = 0;
pub const DI_SRC_SEL_AUTO_INDEX: u32 = 2;

pub const DISPATCH_COMPUTE_SHADER_EN: u32 = 1 << 0;
pub const DISPATCH_FORCE_START_AT_000: u32 = 1 << 2;
pub const DISPATCH_ORDER_MODE: u32 = 1 << 3;
pub const DISPATCH_USE_THREAD_DIMENSIONS: u32 = 1 << 5;
pub const DISPATCH_CS_W32_EN: u32 = 1 << 15;

/* ------------------------------- multi draw ---------------------------------- */

pub const MULTI_DRAW_COUNT_INDIRECT_ENABLE: u32 = 1 << 30;
pub const MULTI_DRAW_INDEX_ENABLE: u32 = 1 << 31;
pub const MULTI_DRAW_REG_MASK: u32 = 0xFFFF;

/* -------------------------------- index types -------------------------------- */

pub const HW_INDEX_TYPE_U16: u32 = 0;
pub const HW_INDEX_TYPE_U32: u32 = 1;
pub const HW_INDEX_TYPE_U8: u32 = 2;

/// Payload tag of the debug marker NOP packet ("DGCM" LE).
pub const MARKER_MAGIC: u32 = 0x4D43_4744;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop = 0x10,
    SetBase = 0x11,
    IndexBufferSize = 0x13,
    DispatchDirect = 0x15,
    IndexBase = 0x26,
    IndexType = 0x2A,
    DrawIndirectMulti = 0x2C,
    DrawIndexAuto = 0x2D,
    NumInstances = 0x2F,
    DrawIndexOffset2 = 0x35,
    DrawIndexIndirectMulti = 0x38,
    IndirectBuffer = 0x3F,
    SetShReg = 0x76,
    DispatchMeshDirect = 0x9E,
    DispatchTaskMeshGfx = 0xA7,
    DispatchTaskMeshDirectAce = 0xA9,
}

impl Opcode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(Self::Nop),
            0x11 => Some(Self::SetBase),
            0x13 => Some(Self::IndexBufferSize),
            0x15 => Some(Self::DispatchDirect),
            0x26 => Some(Self::IndexBase),
            0x2A => Some(Self::IndexType),
            0x2C => Some(Self::DrawIndirectMulti),
            0x2D => Some(Self::DrawIndexAuto),
            0x2F => Some(Self::NumInstances),
            0x35 => Some(Self::DrawIndexOffset2),
            0x38 => Some(Self::DrawIndexIndirectMulti),
            0x3F => Some(Self::IndirectBuffer),
            0x76 => Some(Self::SetShReg),
            0x9E => Some(Self::DispatchMeshDirect),
            0xA7 => Some(Self::DispatchTaskMeshGfx),
            0xA9 => Some(Self::DispatchTaskMeshDirectAce),
            _ => None,
        }
    }
}

/// Encode a packet header for `payload_dwords` payload words.
pub const fn packet_header(opcode: Opcode, payload_dwords: usize) -> u32 {
    assert!(payload_dwords >= 1 && payload_dwords <= MAX_PAYLOAD_DWORDS);
    PACKET_TYPE3 | (((payload_dwords as u32 - 1) & COUNT_MASK) << COUNT_SHIFT) | ((opcode as u32) << OPCODE_SHIFT)
}

/* ------------------------------- dword costs --------------------------------- */

pub const fn set_sh_reg_dwords(values: usize) -> usize {
    2 + values
}

pub const SET_SH_REG_PTR_DWORDS: usize = set_sh_reg_dwords(2);
pub const SET_BASE_DWORDS: usize = 4;
pub const INDEX_TYPE_DWORDS: usize = 2;
pub const INDEX_BASE_DWORDS: usize = 3;
pub const INDEX_BUFFER_SIZE_DWORDS: usize = 2;
pub const NUM_INSTANCES_DWORDS: usize = 2;
pub const DRAW_INDEX_AUTO_DWORDS: usize = 3;
pub const DRAW_INDEX_OFFSET_2_DWORDS: usize = 5;
pub const DRAW_INDIRECT_MULTI_DWORDS: usize = 10;
pub const DISPATCH_DIRECT_DWORDS: usize = 5;
pub const DISPATCH_MESH_DIRECT_DWORDS: usize = 5;
pub const DISPATCH_TASKMESH_GFX_DWORDS: usize = 4;
pub const DISPATCH_TASKMESH_DIRECT_ACE_DWORDS: usize = 6;
pub const MARKER_DWORDS: usize = 4;

/* --------------------------------- decoding ---------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The header word is not a type-3 packet.
    BadPacketType { offset: usize, word: u32 },
    /// The packet claims more payload than the stream holds.
    Truncated {
        offset: usize,
        packet_dwords: usize,
        remaining_dwords: usize,
    },
    /// The stream length is not a whole number of dwords.
    UnalignedLength { len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode_raw: u8,
    /// Number of payload dwords; zero only for [`NOP_FILLER`].
    pub payload_dwords: usize,
}

impl PacketHeader {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_raw)
    }

    pub fn total_dwords(&self) -> usize {
        self.payload_dwords + 1
    }
}

pub fn decode_header(word: u32) -> Option<PacketHeader> {
    if word == NOP_FILLER {
        return Some(PacketHeader {
            opcode_raw: Opcode::Nop as u8,
            payload_dwords: 0,
        });
    }
    if word & PACKET_TYPE_MASK != PACKET_TYPE3 {
        return None;
    }
    Some(PacketHeader {
        opcode_raw: ((word >> OPCODE_SHIFT) & 0xFF) as u8,
        payload_dwords: ((word >> COUNT_SHIFT) & COUNT_MASK) as usize + 1,
    })
}

#[inline]
pub fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// A decoded packet borrowing its payload from the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Byte offset of the header inside the decoded slice.
    pub offset: usize,
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn opcode(&self) -> Option<Opcode> {
        self.header.opcode()
    }

    pub fn payload_dwords(&self) -> usize {
        self.payload.len() / 4
    }

    /// Payload word `index`. Panics when out of range.
    pub fn word(&self, index: usize) -> u32 {
        read_u32_le(self.payload, index * 4)
    }

    pub fn words(&self) -> impl Iterator<Item = u32> + 'a {
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    pub fn byte_len(&self) -> usize {
        self.header.total_dwords() * 4
    }

    pub fn is_nop(&self) -> bool {
        self.header.opcode_raw == Opcode::Nop as u8
    }
}

/// Iterates packets in a dword-aligned byte slice.
pub struct PacketIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> PacketIter<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, DecodeError> {
        if buf.len() % 4 != 0 {
            return Err(DecodeError::UnalignedLength { len: buf.len() });
        }
        Ok(Self {
            buf,
            offset: 0,
            done: false,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<Packet<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let word = read_u32_le(self.buf, self.offset);
        let Some(header) = decode_header(word) else {
            self.done = true;
            return Some(Err(DecodeError::BadPacketType {
                offset: self.offset,
                word,
            }));
        };

        let remaining_dwords = (self.buf.len() - self.offset) / 4;
        if header.total_dwords() > remaining_dwords {
            self.done = true;
            return Some(Err(DecodeError::Truncated {
                offset: self.offset,
                packet_dwords: header.total_dwords(),
                remaining_dwords,
            }));
        }

        let payload_start = self.offset + 4;
        let payload_end = payload_start + header.payload_dwords * 4;
        let packet = Packet {
            offset: self.offset,
            header,
            payload: &self.buf[payload_start..payload_end],
        };
        self.offset = payload_end;
        Some(Ok(packet))
    }
}

/// Decode every packet in `buf`.
pub fn decode_stream(buf: &[u8]) -> Result<Vec<Packet<'_>>, DecodeError> {
    PacketIter::new(buf)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_count_minus_one() {
        let hdr = packet_header(Opcode::SetShReg, 3);
        assert_eq!(hdr, 0xC002_7600);
        let decoded = decode_header(hdr).unwrap();
        assert_eq!(decoded.opcode(), Some(Opcode::SetShReg));
        assert_eq!(decoded.payload_dwords, 3);
    }

    #[test]
    fn filler_is_a_single_dword_nop() {
        let decoded = decode_header(NOP_FILLER).unwrap();
        assert_eq!(decoded.opcode(), Some(Opcode::Nop));
        assert_eq!(decoded.total_dwords(), 1);

        // The largest real NOP packet must not alias the filler.
        let largest = packet_header(Opcode::Nop, MAX_PAYLOAD_DWORDS);
        assert_ne!(largest, NOP_FILLER);
    }

    #[test]
    fn non_type3_words_are_rejected() {
        assert!(decode_header(0).is_none());
        assert!(decode_header(0x8000_0000).is_none());
    }

    #[test]
    fn iterator_reports_truncation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&packet_header(Opcode::DispatchDirect, 4).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        let err = decode_stream(&buf).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                offset: 0,
                packet_dwords: 5,
                remaining_dwords: 2,
            }
        );
    }

    #[test]
    fn iterator_rejects_unaligned_streams() {
        assert!(matches!(
            PacketIter::new(&[0u8; 6]),
            Err(DecodeError::UnalignedLength { len: 6 })
        ));
    }

    #[test]
    fn opcode_table_round_trips() {
        for op in [
            Opcode::Nop,
            Opcode::SetBase,
            Opcode::IndexBufferSize,
            Opcode::DispatchDirect,
            Opcode::IndexBase,
            Opcode::IndexType,
            Opcode::DrawIndirectMulti,
            Opcode::DrawIndexAuto,
            Opcode::NumInstances,
            Opcode::DrawIndexOffset2,
            Opcode::DrawIndexIndirectMulti,
            Opcode::IndirectBuffer,
            Opcode::SetShReg,
            Opcode::DispatchMeshDirect,
            Opcode::DispatchTaskMeshGfx,
            Opcode::DispatchTaskMeshDirectAce,
        ] {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
    }
}
