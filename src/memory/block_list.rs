use super::StatInfo;
use super::block::{BlockId, MemoryBlock};
use super::heap::HeapTracker;
use super::metadata::{AllocationId, Suballocation};
use crate::device::{DeviceMemory, MemoryDevice};
use crate::error::{VmaError, VmaResult};

/// How many times block creation is retried at half the previous size.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockListConfig {
    pub memory_type_index: u32,
    pub preferred_block_size: u64,
    pub max_block_size: u64,
    pub min_block_count: usize,
    pub max_block_count: usize,
    /// Every block is exactly `preferred_block_size` bytes (custom pools).
    pub explicit_block_size: bool,
}

impl BlockListConfig {
    #[must_use]
    pub const fn new(memory_type_index: u32, preferred_block_size: u64) -> Self {
        Self {
            memory_type_index,
            preferred_block_size,
            max_block_size: preferred_block_size,
            min_block_count: 0,
            max_block_count: usize::MAX,
            explicit_block_size: false,
        }
    }
}

/// Placement of a range handed out by a [`BlockList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAllocation {
    pub block: BlockId,
    pub offset: u64,
    pub memory: DeviceMemory,
}

/// Result of returning a range to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedRange {
    pub suballocation: Suballocation,
    /// Size of the block, if it became empty and was released.
    pub released_block: Option<u64>,
}

/// The blocks of one memory type or one custom pool.
///
/// Blocks are kept in creation order; placement tries them front to back.
#[derive(Debug)]
pub struct BlockList {
    config: BlockListConfig,
    blocks: Vec<MemoryBlock>,
    next_block_id: u32,
}

impl BlockList {
    #[must_use]
    pub const fn new(config: BlockListConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            next_block_id: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BlockListConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory_type_index(&self) -> u32 {
        self.config.memory_type_index
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.blocks.iter().map(|b| b.metadata.allocation_count()).sum()
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(MemoryBlock::size).sum()
    }

    /// Creates blocks until `min_block_count` is reached.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` if a block cannot be created.
    pub fn create_min_blocks(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
    ) -> VmaResult<()> {
        while self.blocks.len() < self.config.min_block_count {
            self.create_block(device, heaps, self.config.preferred_block_size)?;
        }
        Ok(())
    }

    /// Places `size` bytes in the first block with room, creating a new block
    /// if none has any and `can_create` allows it.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` when no block fits and none can be created.
    pub fn allocate(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
        size: u64,
        alignment: u64,
        owner: AllocationId,
        can_create: bool,
    ) -> VmaResult<BlockAllocation> {
        if size == 0 {
            return Err(VmaError::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }

        for block in &mut self.blocks {
            match block.metadata.allocate(size, alignment, owner) {
                Ok(offset) => {
                    return Ok(BlockAllocation {
                        block: block.id,
                        offset,
                        memory: block.memory,
                    });
                }
                Err(VmaError::OutOfBlockSpace { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !can_create || self.blocks.len() >= self.config.max_block_count {
            return Err(VmaError::OutOfDeviceMemory);
        }

        let index = self.create_block_for(device, heaps, size)?;
        let block = &mut self.blocks[index];
        let offset = block.metadata.allocate(size, alignment, owner)?;
        Ok(BlockAllocation {
            block: block.id,
            offset,
            memory: block.memory,
        })
    }

    /// Returns a range to its block and releases the block if it became
    /// empty while the list holds more than `min_block_count` blocks.
    ///
    /// # Errors
    /// `InvalidAllocation` if the block or offset is unknown.
    pub fn free(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
        block: BlockId,
        offset: u64,
    ) -> VmaResult<FreedRange> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.id == block)
            .ok_or(VmaError::InvalidAllocation)?;
        let suballocation = self.blocks[index]
            .metadata
            .free(offset)
            .ok_or(VmaError::InvalidAllocation)?;

        let released_block = (self.blocks[index].metadata.is_empty()
            && self.blocks.len() > self.config.min_block_count)
            .then(|| self.destroy_block(index, device, heaps));

        Ok(FreedRange {
            suballocation,
            released_block,
        })
    }

    /// Releases empty blocks down to `min_block_count`.
    ///
    /// Returns the number of blocks and bytes released.
    pub fn release_empty_blocks(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
    ) -> (usize, u64) {
        let mut count = 0;
        let mut bytes = 0;
        let mut index = self.blocks.len();
        while index > 0 && self.blocks.len() > self.config.min_block_count {
            index -= 1;
            if self.blocks[index].metadata.is_empty() {
                bytes += self.destroy_block(index, device, heaps);
                count += 1;
            }
        }
        (count, bytes)
    }

    /// Releases every block, regardless of `min_block_count`.
    pub fn destroy(&mut self, device: &dyn MemoryDevice, heaps: &mut HeapTracker) {
        while !self.blocks.is_empty() {
            self.destroy_block(self.blocks.len() - 1, device, heaps);
        }
    }

    pub fn add_stats(&self, stats: &mut StatInfo) {
        for block in &self.blocks {
            stats.add_block(&block.metadata);
        }
    }

    #[must_use]
    pub fn validate(&self) -> bool {
        self.blocks.iter().all(|b| {
            b.memory_type_index == self.config.memory_type_index && b.metadata.validate()
        }) && self.blocks.len() <= self.config.max_block_count
    }

    fn create_block_for(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
        size: u64,
    ) -> VmaResult<usize> {
        if self.config.explicit_block_size {
            if size > self.config.preferred_block_size {
                return Err(VmaError::OutOfDeviceMemory);
            }
            return self.create_block(device, heaps, self.config.preferred_block_size);
        }

        let mut block_size = size
            .max(self.config.preferred_block_size)
            .min(self.config.max_block_size);
        if block_size < size {
            return Err(VmaError::OutOfDeviceMemory);
        }

        let mut shift = 0;
        loop {
            match self.create_block(device, heaps, block_size) {
                Err(VmaError::OutOfDeviceMemory)
                    if shift < NEW_BLOCK_SIZE_SHIFT_MAX && block_size / 2 >= size =>
                {
                    shift += 1;
                    block_size /= 2;
                    tracing::debug!(
                        memory_type = self.config.memory_type_index,
                        block_size,
                        "block creation failed, retrying smaller"
                    );
                }
                other => return other,
            }
        }
    }

    fn create_block(
        &mut self,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
        size: u64,
    ) -> VmaResult<usize> {
        let memory = heaps.allocate(device, size, self.config.memory_type_index)?;
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.blocks.push(MemoryBlock::new(
            id,
            memory,
            self.config.memory_type_index,
            size,
        ));
        tracing::debug!(
            memory_type = self.config.memory_type_index,
            block = id.0,
            size,
            "created memory block"
        );
        Ok(self.blocks.len() - 1)
    }

    fn destroy_block(
        &mut self,
        index: usize,
        device: &dyn MemoryDevice,
        heaps: &mut HeapTracker,
    ) -> u64 {
        let block = self.blocks.remove(index);
        let size = block.size();
        tracing::debug!(
            memory_type = self.config.memory_type_index,
            block = block.id.0,
            size,
            "released memory block"
        );
        heaps.release(size, block.memory_type_index);
        block.destroy(device);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    const KIB: u64 = 1024;

    fn setup(config: BlockListConfig) -> (HostDevice, HeapTracker, BlockList) {
        let device = HostDevice::with_heap_sizes(16 * 1024 * KIB, 16 * 1024 * KIB);
        let heaps = HeapTracker::new(&device, &[]);
        (device, heaps, BlockList::new(config))
    }

    #[test]
    fn existing_blocks_are_tried_in_creation_order() {
        let (device, mut heaps, mut list) = setup(BlockListConfig::new(1, 64 * KIB));

        let a = list
            .allocate(&device, &mut heaps, 48 * KIB, 16, 1, true)
            .unwrap();
        let b = list
            .allocate(&device, &mut heaps, 48 * KIB, 16, 2, true)
            .unwrap();
        assert_ne!(a.block, b.block);
        assert_eq!(list.block_count(), 2);

        // Fits in the tail of the first block.
        let c = list
            .allocate(&device, &mut heaps, 8 * KIB, 16, 3, true)
            .unwrap();
        assert_eq!(c.block, a.block);
        assert_eq!(c.offset, 48 * KIB);
        assert!(list.validate());
    }

    #[test]
    fn min_block_count_keeps_last_block() {
        let mut config = BlockListConfig::new(1, 64 * KIB);
        config.min_block_count = 1;
        let (device, mut heaps, mut list) = setup(config);

        let only = list
            .allocate(&device, &mut heaps, 60 * KIB, 16, 1, true)
            .unwrap();
        let freed = list
            .free(&device, &mut heaps, only.block, only.offset)
            .unwrap();
        assert_eq!(freed.released_block, None);
        assert_eq!(list.block_count(), 1);

        let first = list
            .allocate(&device, &mut heaps, 60 * KIB, 16, 2, true)
            .unwrap();
        let second = list
            .allocate(&device, &mut heaps, 60 * KIB, 16, 3, true)
            .unwrap();
        assert_eq!(list.block_count(), 2);

        let freed = list
            .free(&device, &mut heaps, first.block, first.offset)
            .unwrap();
        assert_eq!(freed.released_block, Some(64 * KIB));
        assert_eq!(list.block_count(), 1);
        assert_eq!(list.blocks()[0].id, second.block);
        assert_eq!(device.live_block_count(), 1);
    }

    #[test]
    fn oversized_request_gets_a_block_of_its_own_size() {
        let mut config = BlockListConfig::new(0, 64 * KIB);
        config.max_block_size = 1024 * KIB;
        let (device, mut heaps, mut list) = setup(config);

        list.allocate(&device, &mut heaps, 200 * KIB, 256, 1, true)
            .unwrap();
        assert_eq!(list.blocks()[0].size(), 200 * KIB);

        assert!(matches!(
            list.allocate(&device, &mut heaps, 2048 * KIB, 256, 2, true),
            Err(VmaError::OutOfDeviceMemory)
        ));
    }

    #[test]
    fn failed_block_creation_retries_at_half_size() {
        let (device, mut heaps, mut list) = setup(BlockListConfig::new(0, 1024 * KIB));
        device.fail_next_allocations(2);

        list.allocate(&device, &mut heaps, 100 * KIB, 256, 1, true)
            .unwrap();
        assert_eq!(list.blocks()[0].size(), 256 * KIB);
        assert_eq!(heaps.usage(0), 256 * KIB);
    }

    #[test]
    fn fallback_never_shrinks_below_the_request() {
        let (device, mut heaps, mut list) = setup(BlockListConfig::new(0, 1024 * KIB));
        device.fail_next_allocations(2);

        assert!(matches!(
            list.allocate(&device, &mut heaps, 600 * KIB, 256, 1, true),
            Err(VmaError::OutOfDeviceMemory)
        ));
        assert_eq!(list.block_count(), 0);
    }

    #[test]
    fn creation_limits_surface_out_of_device_memory() {
        let mut config = BlockListConfig::new(1, 64 * KIB);
        config.max_block_count = 1;
        config.explicit_block_size = true;
        let (device, mut heaps, mut list) = setup(config);

        assert!(matches!(
            list.allocate(&device, &mut heaps, 16 * KIB, 16, 1, false),
            Err(VmaError::OutOfDeviceMemory)
        ));
        list.allocate(&device, &mut heaps, 60 * KIB, 16, 1, true)
            .unwrap();
        assert!(matches!(
            list.allocate(&device, &mut heaps, 16 * KIB, 16, 2, true),
            Err(VmaError::OutOfDeviceMemory)
        ));
        assert!(matches!(
            list.allocate(&device, &mut heaps, 128 * KIB, 16, 3, true),
            Err(VmaError::OutOfDeviceMemory)
        ));
    }

    #[test]
    fn release_and_destroy_return_memory_to_the_heap() {
        let mut config = BlockListConfig::new(1, 64 * KIB);
        config.min_block_count = 2;
        let (device, mut heaps, mut list) = setup(config);

        list.create_min_blocks(&device, &mut heaps).unwrap();
        assert_eq!(list.block_count(), 2);
        assert_eq!(heaps.usage(1), 128 * KIB);
        assert_eq!(list.release_empty_blocks(&device, &mut heaps), (0, 0));

        list.destroy(&device, &mut heaps);
        assert_eq!(heaps.usage(1), 0);
        assert_eq!(device.live_block_count(), 0);
    }

    #[test]
    fn stats_cover_every_block() {
        let (device, mut heaps, mut list) = setup(BlockListConfig::new(1, 64 * KIB));
        list.allocate(&device, &mut heaps, 1000, 256, 1, true)
            .unwrap();
        list.allocate(&device, &mut heaps, 3000, 256, 2, true)
            .unwrap();

        let mut stats = StatInfo::default();
        list.add_stats(&mut stats);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.used_bytes, 4000);
        assert_eq!(stats.used_bytes + stats.unused_bytes, 64 * KIB);
        assert_eq!(stats.allocation_size_min, 1000);
        assert_eq!(stats.allocation_size_max, 3000);

        list.destroy(&device, &mut heaps);
    }
}
