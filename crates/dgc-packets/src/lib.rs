//! Command processor packet formats consumed by device-generated command buffers.
//!
//! This crate is the fixed target ISA for the generator:
//! - [`packet`] holds the header encoding, opcode table and field constants, plus a
//!   little-endian stream decoder ([`PacketIter`]).
//! - [`emitter`] holds [`PacketEmitter`], a cursor-based writer that appends packets into a
//!   caller-provided byte slice and pads the remainder with NOPs.
//!
//! Dword costs of every packet shape are exposed as `const fn`s so sizing code can never
//! disagree with what the emitter actually writes.

pub mod emitter;
pub mod packet;

pub use emitter::{MultiDrawArgs, PacketEmitter};
pub use packet::{
    decode_header, DecodeError, Opcode, Packet, PacketHeader, PacketIter, JUMP_PACKET_BYTES,
    JUMP_PACKET_DWORDS, NOP_FILLER,
};
