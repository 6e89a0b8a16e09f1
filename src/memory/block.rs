use super::metadata::BlockMetadata;
use crate::device::{DeviceMemory, MemoryDevice};
use crate::error::{VmaError, VmaResult};
use std::ptr;

/// Identifier of a block, unique within its block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// One native memory block and the free-list describing its contents.
///
/// The block owns its `DeviceMemory`; [`MemoryBlock::destroy`] must be called
/// before it is dropped, with the device that created it.
#[derive(Debug)]
pub struct MemoryBlock {
    pub id: BlockId,
    pub memory: DeviceMemory,
    pub memory_type_index: u32,
    pub metadata: BlockMetadata,

    /// Number of outstanding map requests sharing one native mapping.
    map_count: u32,
    mapped_ptr: *mut u8,
}

// The mapped pointer is only dereferenced by the allocator's owner thread.
unsafe impl Send for MemoryBlock {}

impl MemoryBlock {
    #[must_use]
    pub fn new(id: BlockId, memory: DeviceMemory, memory_type_index: u32, size: u64) -> Self {
        Self {
            id,
            memory,
            memory_type_index,
            metadata: BlockMetadata::new(size),
            map_count: 0,
            mapped_ptr: ptr::null_mut(),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[must_use]
    pub const fn map_count(&self) -> u32 {
        self.map_count
    }

    /// Base address of the block mapping, null if unmapped.
    #[must_use]
    pub const fn mapped_ptr(&self) -> *mut u8 {
        self.mapped_ptr
    }

    /// Adds `count` map references, mapping the block on the first one.
    ///
    /// # Errors
    /// `MemoryMapFailed` from the device.
    pub fn map(&mut self, device: &dyn MemoryDevice, count: u32) -> VmaResult<*mut u8> {
        if count == 0 {
            return Ok(self.mapped_ptr);
        }
        if self.map_count == 0 {
            let ptr = device.map_memory(self.memory)?;
            if ptr.is_null() {
                return Err(VmaError::MemoryMapFailed);
            }
            self.mapped_ptr = ptr;
        }
        self.map_count += count;
        Ok(self.mapped_ptr)
    }

    /// Drops `count` map references, unmapping the block on the last one.
    pub fn unmap(&mut self, device: &dyn MemoryDevice, count: u32) {
        if count == 0 {
            return;
        }
        if count > self.map_count {
            tracing::warn!(
                block = self.id.0,
                count,
                map_count = self.map_count,
                "unmap of a block that is not mapped that many times"
            );
        }
        self.map_count = self.map_count.saturating_sub(count);
        if self.map_count == 0 && !self.mapped_ptr.is_null() {
            device.unmap_memory(self.memory);
            self.mapped_ptr = ptr::null_mut();
        }
    }

    /// Unmaps if needed and releases the native memory.
    pub fn destroy(mut self, device: &dyn MemoryDevice) {
        if !self.metadata.is_empty() {
            tracing::warn!(
                block = self.id.0,
                allocations = self.metadata.allocation_count(),
                "destroying a block that still holds allocations"
            );
        }
        if !self.mapped_ptr.is_null() {
            device.unmap_memory(self.memory);
            self.mapped_ptr = ptr::null_mut();
            self.map_count = 0;
        }
        device.free_memory(self.memory);
    }
}
