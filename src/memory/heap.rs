use crate::device::{DeviceMemory, MemoryDevice};
use crate::error::{VmaError, VmaResult};

/// Per-heap byte accounting for every native block the allocator owns,
/// with optional caps below the physical heap size.
#[derive(Debug, Clone)]
pub struct HeapTracker {
    type_to_heap: Vec<u32>,
    sizes: Vec<u64>,
    limits: Vec<Option<u64>>,
    usage: Vec<u64>,
    block_counts: Vec<u32>,
}

impl HeapTracker {
    #[must_use]
    pub fn new(device: &dyn MemoryDevice, limits: &[Option<u64>]) -> Self {
        let heaps = device.memory_heaps();
        let sizes: Vec<u64> = heaps.iter().map(|h| h.size).collect();
        let limits = (0..heaps.len())
            .map(|i| limits.get(i).copied().flatten())
            .collect();

        Self {
            type_to_heap: device
                .memory_types()
                .iter()
                .map(|t| t.heap_index)
                .collect(),
            usage: vec![0; sizes.len()],
            block_counts: vec![0; sizes.len()],
            sizes,
            limits,
        }
    }

    #[must_use]
    pub fn heap_index(&self, memory_type_index: u32) -> u32 {
        self.type_to_heap[memory_type_index as usize]
    }

    /// Heap size as the allocator sees it: the physical size, or the
    /// configured limit if that is smaller.
    #[must_use]
    pub fn effective_size(&self, heap_index: u32) -> u64 {
        let heap = heap_index as usize;
        self.limits[heap].map_or(self.sizes[heap], |limit| limit.min(self.sizes[heap]))
    }

    #[must_use]
    pub fn usage(&self, heap_index: u32) -> u64 {
        self.usage[heap_index as usize]
    }

    #[must_use]
    pub fn block_count(&self, heap_index: u32) -> u32 {
        self.block_counts[heap_index as usize]
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.sizes.len()
    }

    /// Allocates native memory, refusing it up front if it would break the heap limit.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` from the limit or the device.
    pub fn allocate(
        &mut self,
        device: &dyn MemoryDevice,
        size: u64,
        memory_type_index: u32,
    ) -> VmaResult<DeviceMemory> {
        let heap = self.heap_index(memory_type_index) as usize;
        if let Some(limit) = self.limits[heap] {
            if self.usage[heap]
                .checked_add(size)
                .is_none_or(|total| total > limit)
            {
                tracing::debug!(heap, size, limit, "heap size limit reached");
                return Err(VmaError::OutOfDeviceMemory);
            }
        }

        let memory = device.allocate_memory(size, memory_type_index)?;
        self.usage[heap] += size;
        self.block_counts[heap] += 1;
        Ok(memory)
    }

    /// Forgets `size` bytes of a block that is being released.
    pub fn release(&mut self, size: u64, memory_type_index: u32) {
        let heap = self.heap_index(memory_type_index) as usize;
        self.usage[heap] = self.usage[heap].saturating_sub(size);
        self.block_counts[heap] = self.block_counts[heap].saturating_sub(1);
    }
}
