//! Indirect command tokens and the input records they read.
//!
//! Each sequence in the application's input buffer is one record of `input_stride` bytes; every
//! token of the layout reads its argument struct at a fixed offset inside that record. The
//! argument structs mirror the usual indirect-argument layouts (little-endian, tightly packed).

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use dgc_packets::packet::{HW_INDEX_TYPE_U16, HW_INDEX_TYPE_U32, HW_INDEX_TYPE_U8};

bitflags! {
    /// Enabled token kinds of a layout.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct TokenSet: u32 {
        const DRAW = 1 << 0;
        const DRAW_INDEXED = 1 << 1;
        const DRAW_COUNT = 1 << 2;
        const DISPATCH = 1 << 3;
        const DRAW_MESH_TASKS = 1 << 4;
        const TRACE_RAYS = 1 << 5;
        const VERTEX_BUFFER = 1 << 6;
        const INDEX_BUFFER = 1 << 7;
        const PUSH_CONSTANT = 1 << 8;
        const SEQUENCE_INDEX = 1 << 9;
        const EXECUTION_SET = 1 << 10;
    }
}

impl TokenSet {
    /// Tokens that produce the sequence's draw/dispatch work.
    pub const ACTIONS: Self = Self::DRAW
        .union(Self::DRAW_INDEXED)
        .union(Self::DRAW_COUNT)
        .union(Self::DISPATCH)
        .union(Self::DRAW_MESH_TASKS)
        .union(Self::TRACE_RAYS);

    /// Tokens that update push-constant words.
    pub const PUSH_UPDATES: Self = Self::PUSH_CONSTANT.union(Self::SEQUENCE_INDEX);

    pub fn updates_push_constants(self) -> bool {
        self.intersects(Self::PUSH_UPDATES)
    }
}

/// `drawIndirect` arguments.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// `drawIndexedIndirect` arguments.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Indirect draw-with-count arguments: `command_count` draws read from `address`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawCountArgs {
    pub address: u64,
    pub stride: u32,
    pub command_count: u32,
}

/// Dispatch / mesh-task grid.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchArgs {
    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

/// Trace-rays arguments: shader binding table ranges followed by the launch size.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TraceRaysArgs {
    pub raygen_address: u64,
    pub raygen_size: u64,
    pub miss_address: u64,
    pub miss_size: u64,
    pub miss_stride: u64,
    pub hit_address: u64,
    pub hit_size: u64,
    pub hit_stride: u64,
    pub callable_address: u64,
    pub callable_size: u64,
    pub callable_stride: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub reserved0: u32,
}

impl TraceRaysArgs {
    /// Byte offset of `width` (the launch size triple).
    pub const LAUNCH_SIZE_OFFSET: u32 = 88;
}

/// Vertex buffer rebind.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VertexBufferArgs {
    pub address: u64,
    pub size: u32,
    pub stride: u32,
}

/// Index buffer rebind. `index_type` is interpreted per [`IndexTypeMode`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndexBufferArgs {
    pub address: u64,
    pub size: u32,
    pub index_type: u32,
}

/// Pipeline switch: selects an execution-set entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ExecutionSetArgs {
    pub index: u32,
}

/// Size in bytes of each argument struct, for bounds validation.
pub const fn args_size<T: Pod>() -> u32 {
    core::mem::size_of::<T>() as u32
}

/// Which enumeration the application's index-type values come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexTypeMode {
    #[default]
    Vulkan,
    Dxgi,
}

/// Index element type understood by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub const fn hw_value(self) -> u32 {
        match self {
            IndexType::U8 => HW_INDEX_TYPE_U8,
            IndexType::U16 => HW_INDEX_TYPE_U16,
            IndexType::U32 => HW_INDEX_TYPE_U32,
        }
    }

    pub const fn size_bytes(self) -> u32 {
        match self {
            IndexType::U8 => 1,
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }

    pub fn max_index_count(self, buffer_size: u32) -> u32 {
        buffer_size / self.size_bytes()
    }
}

const VK_INDEX_TYPE_UINT16: u32 = 0;
const VK_INDEX_TYPE_UINT8: u32 = 1_000_265_000;
const DXGI_FORMAT_R32_UINT: u32 = 42;
const DXGI_FORMAT_R16_UINT: u32 = 57;
const DXGI_FORMAT_R8_UINT: u32 = 62;

impl IndexTypeMode {
    /// Map an application index-type value. Unknown values fall back to 32-bit indices.
    pub fn resolve(self, raw: u32) -> IndexType {
        match (self, raw) {
            (IndexTypeMode::Vulkan, VK_INDEX_TYPE_UINT16) => IndexType::U16,
            (IndexTypeMode::Vulkan, VK_INDEX_TYPE_UINT8) => IndexType::U8,
            (IndexTypeMode::Dxgi, DXGI_FORMAT_R16_UINT) => IndexType::U16,
            (IndexTypeMode::Dxgi, DXGI_FORMAT_R8_UINT) => IndexType::U8,
            (IndexTypeMode::Dxgi, DXGI_FORMAT_R32_UINT) => IndexType::U32,
            _ => IndexType::U32,
        }
    }
}
