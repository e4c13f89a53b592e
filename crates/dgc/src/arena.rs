use std::fmt;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    // Saturates near u64::MAX; device addresses never get there.
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A successful sub-allocation from a [`LinearAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadAllocation {
    /// Offset from the start of the allocator's backing range (the host mapping).
    pub offset: u64,
    /// GPU-visible address of the allocation.
    pub device_address: u64,
    pub size: u64,
}

/// Opaque linear allocator for per-submission upload data.
///
/// Returns `None` when exhausted; callers surface that as out-of-memory.
pub trait LinearAllocator {
    fn alloc(&mut self, size: u64, alignment: u64) -> Option<UploadAllocation>;
}

/// Upload heap for one submission: parameter blobs and execution-set tables.
///
/// Tracks offsets only; the bytes live in whatever [`DeviceMemory`](crate::memory::DeviceMemory)
/// backs `[device_base, device_base + capacity)`.
#[derive(Clone)]
pub struct BufferArena {
    device_base: u64,
    capacity: u64,
    cursor: u64,
}

impl BufferArena {
    /// Create an arena that hands out `[device_base, device_base + capacity)`.
    pub fn new(device_base: u64, capacity: u64) -> Self {
        Self {
            device_base,
            capacity,
            cursor: 0,
        }
    }

    /// Reset the arena cursor back to the base.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn device_base(&self) -> u64 {
        self.device_base
    }

    /// Bytes remaining until the arena is full.
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }

    /// Current cursor (next allocation will be at or after this offset).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl LinearAllocator for BufferArena {
    fn alloc(&mut self, size: u64, alignment: u64) -> Option<UploadAllocation> {
        let alignment = alignment.max(1);

        // Align the device address, not just the offset, so callers can rely on it.
        let aligned_addr = align_up(self.device_base.checked_add(self.cursor)?, alignment);
        let offset = aligned_addr - self.device_base;

        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.cursor = end;
        Some(UploadAllocation {
            offset,
            device_address: aligned_addr,
            size,
        })
    }
}

impl fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferArena")
            .field("device_base", &format_args!("0x{:x}", self.device_base))
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}
