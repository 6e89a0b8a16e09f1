#![allow(clippy::cast_possible_truncation)]

use super::block::BlockId;
use super::block_list::{BlockAllocation, BlockList, BlockListConfig, FreedRange};
use super::heap::HeapTracker;
use super::metadata::AllocationId;
use super::{
    Allocation, AllocationCreateInfo, AllocationInfo, AllocatorCreateInfo, MemoryRequirements,
    PoolCreateInfo, PoolId, PoolKey, SMALL_HEAP_MAX_SIZE, StatInfo, Stats,
};
use crate::defrag::{DefragmentationContext, DefragmentationInfo};
use crate::device::{DeviceMemory, MemoryDevice, MemoryType, ResourceHandle};
use crate::error::{VmaError, VmaResult};
use crate::utils::{align_up, is_pow2};
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

/// Where the bytes of an allocation live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Block {
        pool: PoolKey,
        block: BlockId,
        offset: u64,
        memory: DeviceMemory,
    },
    Dedicated {
        memory: DeviceMemory,
        mapped_ptr: *mut u8,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_index: u32,
    pub placement: Placement,
    /// Outstanding explicit `map` calls.
    pub map_count: u32,
    pub persistent: bool,
    pub last_use_frame: u32,
}

impl AllocationRecord {
    /// Map references this allocation holds on its memory.
    const fn map_refs(&self) -> u32 {
        self.map_count + self.persistent as u32
    }
}

/// The public allocator: default block lists per memory type, custom pools,
/// dedicated allocations and the handle table that resolves [`Allocation`]s.
///
/// All mutating calls take `&mut self`; callers that share an allocator
/// across threads wrap it in a lock.
pub struct Allocator {
    device: Arc<dyn MemoryDevice>,
    frame_in_use_count: u32,
    current_frame: u32,
    heaps: HeapTracker,
    default_lists: Vec<BlockList>,
    pools: HashMap<PoolId, BlockList>,
    next_pool_id: u64,
    allocations: HashMap<AllocationId, AllocationRecord>,
    next_allocation_id: AllocationId,
    /// Destination ranges reserved for in-flight defragmentation moves,
    /// keyed by the moving allocation.
    reservations: HashMap<AllocationId, Reservation>,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    pool: PoolKey,
    block: BlockId,
    offset: u64,
}

// Mapped pointers held in records are plain addresses handed to the caller.
unsafe impl Send for Allocator {}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("memory_types", &self.default_lists.len())
            .field("pools", &self.pools.len())
            .field("allocations", &self.allocations.len())
            .field("current_frame", &self.current_frame)
            .finish_non_exhaustive()
    }
}

fn select_list<'a>(
    default_lists: &'a mut [BlockList],
    pools: &'a mut HashMap<PoolId, BlockList>,
    key: PoolKey,
) -> VmaResult<&'a mut BlockList> {
    match key {
        PoolKey::Default(memory_type) => default_lists
            .get_mut(memory_type as usize)
            .ok_or(VmaError::InvalidPool),
        PoolKey::Custom(pool) => pools.get_mut(&pool).ok_or(VmaError::InvalidPool),
    }
}

impl Allocator {
    /// # Errors
    /// `InvalidArgument` for a zero block size.
    pub fn new(device: Arc<dyn MemoryDevice>, info: &AllocatorCreateInfo) -> VmaResult<Self> {
        if info.preferred_large_heap_block_size == 0 {
            return Err(VmaError::InvalidArgument(
                "preferred block size must be non-zero".to_string(),
            ));
        }

        let heaps = HeapTracker::new(device.as_ref(), &info.heap_size_limits);
        let default_lists = (0..device.memory_types().len() as u32)
            .map(|memory_type| {
                let heap_size = heaps.effective_size(heaps.heap_index(memory_type));
                let preferred = if heap_size <= SMALL_HEAP_MAX_SIZE {
                    align_up(heap_size / 8, 32).max(32)
                } else {
                    info.preferred_large_heap_block_size
                };
                BlockList::new(BlockListConfig::new(memory_type, preferred))
            })
            .collect();

        Ok(Self {
            device,
            frame_in_use_count: info.frame_in_use_count,
            current_frame: 0,
            heaps,
            default_lists,
            pools: HashMap::new(),
            next_pool_id: 1,
            allocations: HashMap::new(),
            next_allocation_id: 1,
            reservations: HashMap::new(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    #[must_use]
    pub fn memory_types(&self) -> &[MemoryType] {
        self.device.memory_types()
    }

    /// Preferred block size of the default block list for `memory_type_index`.
    #[must_use]
    pub fn preferred_block_size(&self, memory_type_index: u32) -> Option<u64> {
        self.default_lists
            .get(memory_type_index as usize)
            .map(|list| list.config().preferred_block_size)
    }

    #[must_use]
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.heaps.usage(heap_index)
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub const fn current_frame_index(&self) -> u32 {
        self.current_frame
    }

    #[must_use]
    pub const fn frame_in_use_count(&self) -> u32 {
        self.frame_in_use_count
    }

    pub fn set_current_frame_index(&mut self, frame: u32) {
        self.current_frame = frame;
    }

    /// Marks the allocation as used in the current frame.
    ///
    /// # Errors
    /// `InvalidAllocation` for an unknown handle.
    pub fn touch_allocation(&mut self, allocation: Allocation) -> VmaResult<()> {
        let frame = self.current_frame;
        self.record_mut(allocation)?.last_use_frame = frame;
        Ok(())
    }

    /// Best memory type for `memory_type_bits` and `info`.
    ///
    /// A type qualifies if its bit is set and it has every required flag
    /// (explicit or implied by the usage). Among those, the one missing the
    /// fewest preferred flags wins, ties going to the lowest index.
    ///
    /// # Errors
    /// `NoSuitableMemoryType` if nothing qualifies.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> VmaResult<u32> {
        self.memory_type_candidates(memory_type_bits, info)
            .first()
            .copied()
            .ok_or(VmaError::NoSuitableMemoryType(memory_type_bits))
    }

    fn memory_type_candidates(
        &self,
        memory_type_bits: u32,
        info: &AllocationCreateInfo,
    ) -> Vec<u32> {
        let mut bits = if memory_type_bits == 0 {
            u32::MAX
        } else {
            memory_type_bits
        };
        if info.memory_type_bits != 0 {
            bits &= info.memory_type_bits;
        }

        let (usage_required, usage_preferred) = info.usage.property_flags();
        let required = info.required_flags.union(usage_required);
        let preferred = info.preferred_flags.union(usage_preferred);

        let mut candidates: Vec<(u32, u32)> = self
            .memory_types()
            .iter()
            .enumerate()
            .take(32)
            .filter(|(i, t)| bits & (1u32 << *i) != 0 && t.property_flags.contains(required))
            .map(|(i, t)| (t.property_flags.missing(preferred), i as u32))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().map(|(_, i)| i).collect()
    }

    /// Allocates memory for a resource with the given requirements.
    ///
    /// If the best memory type is out of memory, the next suitable one is tried.
    ///
    /// # Errors
    /// `NoSuitableMemoryType`, `OutOfDeviceMemory`, `InvalidPool`,
    /// `MemoryMapFailed` for a persistent map, or `InvalidArgument`.
    pub fn allocate(
        &mut self,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
    ) -> VmaResult<Allocation> {
        if requirements.size == 0 {
            return Err(VmaError::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if requirements.alignment != 0 && !is_pow2(requirements.alignment) {
            return Err(VmaError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                requirements.alignment
            )));
        }
        if info.flags.dedicated_memory && info.flags.never_allocate {
            return Err(VmaError::InvalidArgument(
                "dedicated_memory and never_allocate are mutually exclusive".to_string(),
            ));
        }

        let id = self.next_allocation_id;
        self.next_allocation_id += 1;

        let (memory_type_index, placement) = if let Some(pool) = info.pool {
            let memory_type = self
                .pools
                .get(&pool)
                .ok_or(VmaError::InvalidPool)?
                .memory_type_index();
            if requirements.memory_type_bits != 0
                && requirements.memory_type_bits & (1 << memory_type) == 0
            {
                return Err(VmaError::NoSuitableMemoryType(requirements.memory_type_bits));
            }
            let placement = self.allocate_from_list(
                PoolKey::Custom(pool),
                requirements,
                id,
                !info.flags.never_allocate,
            )?;
            (memory_type, placement)
        } else {
            let candidates = self.memory_type_candidates(requirements.memory_type_bits, info);
            if candidates.is_empty() {
                return Err(VmaError::NoSuitableMemoryType(requirements.memory_type_bits));
            }
            let mut found = None;
            for memory_type in candidates {
                match self.allocate_in_type(memory_type, requirements, info, id) {
                    Ok(placement) => {
                        found = Some((memory_type, placement));
                        break;
                    }
                    Err(VmaError::OutOfDeviceMemory) => {
                        tracing::debug!(memory_type, "memory type exhausted, trying next");
                    }
                    Err(e) => return Err(e),
                }
            }
            found.ok_or(VmaError::OutOfDeviceMemory)?
        };

        let mut record = AllocationRecord {
            size: requirements.size,
            alignment: requirements.alignment.max(1),
            memory_type_index,
            placement,
            map_count: 0,
            persistent: false,
            last_use_frame: self.current_frame,
        };

        if info.flags.mapped {
            if let Err(e) = self.map_placement(&mut record.placement, 1) {
                self.release_placement(&record);
                return Err(e);
            }
            record.persistent = true;
        }

        tracing::trace!(
            allocation = id,
            size = record.size,
            memory_type = memory_type_index,
            "allocated"
        );
        self.allocations.insert(id, record);
        Ok(Allocation(id))
    }

    fn allocate_in_type(
        &mut self,
        memory_type: u32,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        id: AllocationId,
    ) -> VmaResult<Placement> {
        let preferred = self.default_lists[memory_type as usize]
            .config()
            .preferred_block_size;
        let flags = info.flags;

        if flags.never_allocate {
            return self.allocate_from_list(PoolKey::Default(memory_type), requirements, id, false);
        }

        if flags.dedicated_memory || requirements.size > preferred / 2 {
            match self.allocate_dedicated(memory_type, requirements.size) {
                Err(VmaError::OutOfDeviceMemory) if !flags.dedicated_memory => {}
                other => return other,
            }
        }

        match self.allocate_from_list(PoolKey::Default(memory_type), requirements, id, true) {
            Err(VmaError::OutOfDeviceMemory) if requirements.size <= preferred / 2 => {
                self.allocate_dedicated(memory_type, requirements.size)
            }
            other => other,
        }
    }

    fn allocate_from_list(
        &mut self,
        key: PoolKey,
        requirements: &MemoryRequirements,
        id: AllocationId,
        can_create: bool,
    ) -> VmaResult<Placement> {
        let list = select_list(&mut self.default_lists, &mut self.pools, key)?;
        let BlockAllocation {
            block,
            offset,
            memory,
        } = list.allocate(
            self.device.as_ref(),
            &mut self.heaps,
            requirements.size,
            requirements.alignment,
            id,
            can_create,
        )?;
        Ok(Placement::Block {
            pool: key,
            block,
            offset,
            memory,
        })
    }

    fn allocate_dedicated(&mut self, memory_type: u32, size: u64) -> VmaResult<Placement> {
        let memory = self.heaps.allocate(self.device.as_ref(), size, memory_type)?;
        tracing::debug!(memory_type, size, "created dedicated allocation");
        Ok(Placement::Dedicated {
            memory,
            mapped_ptr: ptr::null_mut(),
        })
    }

    /// Releases an allocation. Its memory returns to its block, or to the
    /// device for a dedicated allocation.
    ///
    /// # Errors
    /// `InvalidAllocation` for an unknown or already freed handle.
    pub fn free(&mut self, allocation: Allocation) -> VmaResult<()> {
        let record = self
            .allocations
            .remove(&allocation.0)
            .ok_or(VmaError::InvalidAllocation)?;
        self.release_placement(&record);
        if let Err(e) = self.release_reservation(allocation.0) {
            tracing::warn!(allocation = allocation.0, "cannot release move destination: {e}");
        }
        tracing::trace!(allocation = allocation.0, size = record.size, "freed");
        Ok(())
    }

    fn release_placement(&mut self, record: &AllocationRecord) {
        let refs = record.map_refs();
        match record.placement {
            Placement::Block {
                pool, block, offset, ..
            } => {
                let Ok(list) = select_list(&mut self.default_lists, &mut self.pools, pool) else {
                    tracing::warn!(?pool, "allocation refers to a destroyed pool");
                    return;
                };
                if let Some(b) = list.block_mut(block) {
                    b.unmap(self.device.as_ref(), refs);
                }
                if let Err(e) = list.free(self.device.as_ref(), &mut self.heaps, block, offset) {
                    tracing::warn!(block = block.0, offset, "failed to free range: {e}");
                }
            }
            Placement::Dedicated { memory, mapped_ptr } => {
                if !mapped_ptr.is_null() {
                    self.device.unmap_memory(memory);
                }
                self.heaps.release(record.size, record.memory_type_index);
                self.device.free_memory(memory);
            }
        }
    }

    /// Maps the allocation and returns the CPU address of its first byte.
    ///
    /// Maps are reference-counted; every call needs a matching [`Self::unmap`].
    ///
    /// # Errors
    /// `InvalidAllocation`, or `MemoryMapFailed` for memory that is not host-visible.
    pub fn map(&mut self, allocation: Allocation) -> VmaResult<*mut u8> {
        let frame = self.current_frame;
        let mut placement = self.record(allocation)?.placement;
        let ptr = self.map_placement(&mut placement, 1)?;

        let record = self.record_mut(allocation)?;
        record.placement = placement;
        record.map_count += 1;
        record.last_use_frame = frame;
        Ok(ptr)
    }

    /// Drops one explicit map reference.
    ///
    /// # Errors
    /// `InvalidAllocation` for an unknown handle.
    pub fn unmap(&mut self, allocation: Allocation) -> VmaResult<()> {
        let record = self.record_mut(allocation)?;
        if record.map_count == 0 {
            tracing::warn!(allocation = allocation.0, "unmap of an allocation that is not mapped");
            return Ok(());
        }
        record.map_count -= 1;
        let mut placement = record.placement;
        let last = record.map_refs() == 0;

        self.unmap_placement(&mut placement, last);
        self.record_mut(allocation)?.placement = placement;
        Ok(())
    }

    /// Adds `count` map references to the memory behind `placement`.
    fn map_placement(&mut self, placement: &mut Placement, count: u32) -> VmaResult<*mut u8> {
        match placement {
            Placement::Block {
                pool, block, offset, ..
            } => {
                let list = select_list(&mut self.default_lists, &mut self.pools, *pool)?;
                let block = list.block_mut(*block).ok_or(VmaError::InvalidAllocation)?;
                let base = block.map(self.device.as_ref(), count)?;
                Ok(base.wrapping_add(*offset as usize))
            }
            Placement::Dedicated { memory, mapped_ptr } => {
                if mapped_ptr.is_null() {
                    let ptr = self.device.map_memory(*memory)?;
                    if ptr.is_null() {
                        return Err(VmaError::MemoryMapFailed);
                    }
                    *mapped_ptr = ptr;
                }
                Ok(*mapped_ptr)
            }
        }
    }

    fn unmap_placement(&mut self, placement: &mut Placement, last: bool) {
        match placement {
            Placement::Block { pool, block, .. } => {
                if let Ok(list) = select_list(&mut self.default_lists, &mut self.pools, *pool) {
                    if let Some(block) = list.block_mut(*block) {
                        block.unmap(self.device.as_ref(), 1);
                    }
                }
            }
            Placement::Dedicated { memory, mapped_ptr } => {
                if last && !mapped_ptr.is_null() {
                    self.device.unmap_memory(*memory);
                    *mapped_ptr = ptr::null_mut();
                }
            }
        }
    }

    /// # Errors
    /// `InvalidAllocation` for an unknown handle.
    pub fn allocation_info(&self, allocation: Allocation) -> VmaResult<AllocationInfo> {
        let record = self.record(allocation)?;
        let mapped = record.map_refs() > 0;

        let info = match record.placement {
            Placement::Block {
                pool,
                block,
                offset,
                memory,
            } => {
                let base = self
                    .list(pool)
                    .and_then(|list| list.block(block))
                    .map_or(ptr::null_mut(), |b| b.mapped_ptr());
                AllocationInfo {
                    memory_type_index: record.memory_type_index,
                    device_memory: memory,
                    offset,
                    size: record.size,
                    mapped_data: if mapped && !base.is_null() {
                        base.wrapping_add(offset as usize)
                    } else {
                        ptr::null_mut()
                    },
                    dedicated: false,
                    pool: match pool {
                        PoolKey::Custom(id) => Some(id),
                        PoolKey::Default(_) => None,
                    },
                    last_use_frame: record.last_use_frame,
                }
            }
            Placement::Dedicated { memory, mapped_ptr } => AllocationInfo {
                memory_type_index: record.memory_type_index,
                device_memory: memory,
                offset: 0,
                size: record.size,
                mapped_data: mapped_ptr,
                dedicated: true,
                pool: None,
                last_use_frame: record.last_use_frame,
            },
        };
        Ok(info)
    }

    /// Binds `resource` to the allocation's current memory and offset.
    ///
    /// # Errors
    /// `InvalidAllocation`, or the device's bind error.
    pub fn bind_resource(&self, allocation: Allocation, resource: ResourceHandle) -> VmaResult<()> {
        let (memory, offset) = match self.record(allocation)?.placement {
            Placement::Block { memory, offset, .. } => (memory, offset),
            Placement::Dedicated { memory, .. } => (memory, 0),
        };
        self.device.bind_resource(resource, memory, offset)
    }

    /// Creates a custom pool with fixed-size blocks. `min_block_count` blocks
    /// are created immediately.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad memory type or block counts,
    /// `OutOfDeviceMemory` if the initial blocks cannot be created.
    pub fn create_pool(&mut self, info: &PoolCreateInfo) -> VmaResult<PoolId> {
        let preferred = self
            .preferred_block_size(info.memory_type_index)
            .ok_or_else(|| {
                VmaError::InvalidArgument(format!(
                    "memory type {} out of range",
                    info.memory_type_index
                ))
            })?;
        if info.min_block_count > info.max_block_count || info.max_block_count == 0 {
            return Err(VmaError::InvalidArgument(format!(
                "invalid pool block count range {}..={}",
                info.min_block_count, info.max_block_count
            )));
        }

        let block_size = if info.block_size == 0 {
            preferred
        } else {
            info.block_size
        };
        let mut list = BlockList::new(BlockListConfig {
            memory_type_index: info.memory_type_index,
            preferred_block_size: block_size,
            max_block_size: block_size,
            min_block_count: info.min_block_count,
            max_block_count: info.max_block_count,
            explicit_block_size: true,
        });
        if let Err(e) = list.create_min_blocks(self.device.as_ref(), &mut self.heaps) {
            list.destroy(self.device.as_ref(), &mut self.heaps);
            return Err(e);
        }

        let id = PoolId(self.next_pool_id);
        self.next_pool_id += 1;
        tracing::debug!(
            pool = id.0,
            memory_type = info.memory_type_index,
            block_size,
            "created pool"
        );
        self.pools.insert(id, list);
        Ok(id)
    }

    /// # Errors
    /// `InvalidPool` for an unknown pool, `PoolInUse` while it holds allocations.
    pub fn destroy_pool(&mut self, pool: PoolId) -> VmaResult<()> {
        let list = self.pools.get(&pool).ok_or(VmaError::InvalidPool)?;
        if list.allocation_count() > 0 {
            return Err(VmaError::PoolInUse);
        }
        if let Some(mut list) = self.pools.remove(&pool) {
            list.destroy(self.device.as_ref(), &mut self.heaps);
        }
        tracing::debug!(pool = pool.0, "destroyed pool");
        Ok(())
    }

    /// Statistics per memory type, per heap and in total.
    #[must_use]
    pub fn calculate_stats(&self) -> Stats {
        let mut memory_type = vec![StatInfo::default(); self.default_lists.len()];
        for list in self.default_lists.iter().chain(self.pools.values()) {
            list.add_stats(&mut memory_type[list.memory_type_index() as usize]);
        }
        for record in self.allocations.values() {
            if matches!(record.placement, Placement::Dedicated { .. }) {
                memory_type[record.memory_type_index as usize].add_dedicated(record.size);
            }
        }

        let mut memory_heap = vec![StatInfo::default(); self.heaps.heap_count()];
        let mut total = StatInfo::default();
        for (index, info) in memory_type.iter().enumerate() {
            memory_heap[self.heaps.heap_index(index as u32) as usize].merge(info);
            total.merge(info);
        }

        Stats {
            total,
            memory_type,
            memory_heap,
        }
    }

    /// Checks every block's free-list and that each handle resolves to the
    /// range it owns.
    #[must_use]
    pub fn validate(&self) -> bool {
        let lists_ok = self
            .default_lists
            .iter()
            .chain(self.pools.values())
            .all(BlockList::validate);

        let records_ok = self.allocations.iter().all(|(&id, record)| match record.placement {
            Placement::Block {
                pool,
                block,
                offset,
                memory,
            } => self
                .list(pool)
                .and_then(|list| list.block(block))
                .is_some_and(|b| {
                    b.memory == memory
                        && b.metadata
                            .get(offset)
                            .is_some_and(|s| s.owner == id && s.size == record.size)
                }),
            Placement::Dedicated { .. } => true,
        });

        // Destination reservations of an active defragmentation pass are
        // owned by the moving allocation, so every owner must still be live.
        let owners_ok = self
            .default_lists
            .iter()
            .chain(self.pools.values())
            .flat_map(|list| list.blocks())
            .flat_map(|b| b.metadata.suballocations())
            .all(|s| self.allocations.contains_key(&s.owner));

        let reservations_ok = self
            .reservations
            .keys()
            .all(|id| self.allocations.contains_key(id));

        lists_ok && records_ok && owners_ok && reservations_ok
    }

    /// Starts a defragmentation context bound to this allocator's current frame.
    ///
    /// # Errors
    /// `InvalidPool` if `info` names an unknown pool.
    pub fn begin_defragmentation(
        &self,
        info: &DefragmentationInfo,
    ) -> VmaResult<DefragmentationContext> {
        DefragmentationContext::new(self, info)
    }

    fn record(&self, allocation: Allocation) -> VmaResult<&AllocationRecord> {
        self.allocations
            .get(&allocation.0)
            .ok_or(VmaError::InvalidAllocation)
    }

    fn record_mut(&mut self, allocation: Allocation) -> VmaResult<&mut AllocationRecord> {
        self.allocations
            .get_mut(&allocation.0)
            .ok_or(VmaError::InvalidAllocation)
    }

    // Defragmentation support.

    pub(crate) fn allocation_record(&self, id: AllocationId) -> Option<&AllocationRecord> {
        self.allocations.get(&id)
    }

    pub(crate) fn pool_allocations(&self, pool: PoolKey) -> Vec<AllocationId> {
        let mut ids: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|(_, r)| matches!(r.placement, Placement::Block { pool: p, .. } if p == pool))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn has_pool(&self, pool: PoolId) -> bool {
        self.pools.contains_key(&pool)
    }

    pub(crate) fn list(&self, key: PoolKey) -> Option<&BlockList> {
        match key {
            PoolKey::Default(memory_type) => self.default_lists.get(memory_type as usize),
            PoolKey::Custom(pool) => self.pools.get(&pool),
        }
    }

    pub(crate) fn list_mut(&mut self, key: PoolKey) -> Option<&mut BlockList> {
        select_list(&mut self.default_lists, &mut self.pools, key).ok()
    }

    /// Whether the allocation was used recently enough that in-flight GPU
    /// work may still read it.
    pub(crate) fn in_use_by_frame(&self, record: &AllocationRecord, frame: u32) -> bool {
        self.frame_in_use_count > 0
            && frame <= record.last_use_frame.saturating_add(self.frame_in_use_count)
    }

    pub(crate) fn is_host_visible(&self, memory_type_index: u32) -> bool {
        self.memory_types()
            .get(memory_type_index as usize)
            .is_some_and(|t| t.property_flags.host_visible)
    }

    pub(crate) fn map_block(&mut self, key: PoolKey, block: BlockId) -> VmaResult<*mut u8> {
        let list = select_list(&mut self.default_lists, &mut self.pools, key)?;
        list.block_mut(block)
            .ok_or(VmaError::InvalidAllocation)?
            .map(self.device.as_ref(), 1)
    }

    pub(crate) fn unmap_block(&mut self, key: PoolKey, block: BlockId) {
        if let Ok(list) = select_list(&mut self.default_lists, &mut self.pools, key) {
            if let Some(b) = list.block_mut(block) {
                b.unmap(self.device.as_ref(), 1);
            }
        }
    }

    /// Records the destination range reserved for moving `id`. A reservation
    /// left behind by an earlier context for the same allocation is released.
    pub(crate) fn track_reservation(
        &mut self,
        id: AllocationId,
        pool: PoolKey,
        block: BlockId,
        offset: u64,
    ) {
        let reservation = Reservation {
            pool,
            block,
            offset,
        };
        if let Some(stale) = self.reservations.insert(id, reservation) {
            tracing::debug!(allocation = id, block = stale.block.0, "releasing stale reservation");
            if let Err(e) = self.free_reserved(stale) {
                tracing::warn!(allocation = id, "cannot release stale reservation: {e}");
            }
        }
    }

    /// Returns the destination range reserved for `id` to its block. Does
    /// nothing if the reservation was already released or committed.
    pub(crate) fn release_reservation(&mut self, id: AllocationId) -> VmaResult<()> {
        match self.reservations.remove(&id) {
            Some(reservation) => self.free_reserved(reservation).map(|_| ()),
            None => Ok(()),
        }
    }

    fn free_reserved(&mut self, reservation: Reservation) -> VmaResult<FreedRange> {
        let list = select_list(&mut self.default_lists, &mut self.pools, reservation.pool)?;
        list.free(
            self.device.as_ref(),
            &mut self.heaps,
            reservation.block,
            reservation.offset,
        )
    }

    /// Repoints an allocation at a destination range that already holds its
    /// contents, then frees the source range.
    ///
    /// Map references move with the allocation.
    pub(crate) fn commit_move(
        &mut self,
        id: AllocationId,
        dst_block: BlockId,
        dst_offset: u64,
    ) -> VmaResult<FreedRange> {
        let record = self
            .allocations
            .get(&id)
            .ok_or(VmaError::InvalidAllocation)?;
        let refs = record.map_refs();
        let Placement::Block {
            pool,
            block: src_block,
            offset: src_offset,
            ..
        } = record.placement
        else {
            return Err(VmaError::InvalidAllocation);
        };

        let list = select_list(&mut self.default_lists, &mut self.pools, pool)?;
        let dst = list.block_mut(dst_block).ok_or(VmaError::InvalidAllocation)?;
        let dst_memory = dst.memory;
        if refs > 0 {
            dst.map(self.device.as_ref(), refs)?;
        }
        if let Some(src) = list.block_mut(src_block) {
            src.unmap(self.device.as_ref(), refs);
        }
        let freed = list.free(self.device.as_ref(), &mut self.heaps, src_block, src_offset)?;

        if let Some(record) = self.allocations.get_mut(&id) {
            record.placement = Placement::Block {
                pool,
                block: dst_block,
                offset: dst_offset,
                memory: dst_memory,
            };
        }
        self.reservations.remove(&id);
        Ok(freed)
    }

    pub(crate) fn release_empty_blocks(&mut self, key: PoolKey) -> (usize, u64) {
        match select_list(&mut self.default_lists, &mut self.pools, key) {
            Ok(list) => list.release_empty_blocks(self.device.as_ref(), &mut self.heaps),
            Err(_) => (0, 0),
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            tracing::warn!(
                count = self.allocations.len(),
                "allocator dropped with live allocations"
            );
        }
        let records: Vec<AllocationRecord> = self.allocations.drain().map(|(_, r)| r).collect();
        for record in &records {
            if matches!(record.placement, Placement::Dedicated { .. }) {
                self.release_placement(record);
            }
        }
        for list in self.default_lists.iter_mut().chain(self.pools.values_mut()) {
            list.destroy(self.device.as_ref(), &mut self.heaps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostDevice, MemoryPropertyFlags};
    use crate::memory::{AllocationCreateFlags, MemoryUsage};

    const MIB: u64 = 1024 * 1024;

    fn setup() -> (Arc<HostDevice>, Allocator) {
        let device = Arc::new(HostDevice::discrete());
        let allocator = Allocator::new(device.clone(), &AllocatorCreateInfo::default()).unwrap();
        (device, allocator)
    }

    fn req(size: u64, alignment: u64) -> MemoryRequirements {
        MemoryRequirements::new(size, alignment)
    }

    #[test]
    fn usage_selects_memory_type() {
        let (_device, allocator) = setup();
        let pick = |usage| {
            allocator
                .find_memory_type_index(0, &AllocationCreateInfo::new(usage))
                .unwrap()
        };
        assert_eq!(pick(MemoryUsage::GpuOnly), 0);
        assert_eq!(pick(MemoryUsage::CpuOnly), 1);
        assert_eq!(pick(MemoryUsage::CpuToGpu), 3);
        assert_eq!(pick(MemoryUsage::GpuToCpu), 2);

        let info = AllocationCreateInfo::new(MemoryUsage::CpuOnly)
            .required_flags(MemoryPropertyFlags::new().host_cached());
        assert!(matches!(
            allocator.find_memory_type_index(0b0011, &info),
            Err(VmaError::NoSuitableMemoryType(0b0011))
        ));
    }

    #[test]
    fn small_heaps_use_an_eighth_as_block_size() {
        let (_device, allocator) = setup();
        assert_eq!(allocator.preferred_block_size(0), Some(32 * MIB));
    }

    #[test]
    fn small_requests_share_a_block() {
        let (device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly);
        let a = allocator.allocate(&req(1000, 256), &info).unwrap();
        let b = allocator.allocate(&req(1000, 256), &info).unwrap();

        let ia = allocator.allocation_info(a).unwrap();
        let ib = allocator.allocation_info(b).unwrap();
        assert_eq!(ia.device_memory, ib.device_memory);
        assert_eq!((ia.offset, ib.offset), (0, 1024));
        assert_eq!(device.live_block_count(), 1);

        allocator.free(a).unwrap();
        allocator.free(b).unwrap();
        assert_eq!(device.live_block_count(), 0);
        assert!(matches!(allocator.free(a), Err(VmaError::InvalidAllocation)));
    }

    #[test]
    fn large_or_flagged_requests_are_dedicated() {
        let (device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly);

        let big = allocator.allocate(&req(20 * MIB, 256), &info).unwrap();
        assert!(allocator.allocation_info(big).unwrap().dedicated);

        let flagged = allocator
            .allocate(
                &req(4096, 256),
                &info.flags(AllocationCreateFlags::new().dedicated_memory()),
            )
            .unwrap();
        let flagged_info = allocator.allocation_info(flagged).unwrap();
        assert!(flagged_info.dedicated);
        assert_eq!(flagged_info.offset, 0);
        assert_eq!(device.live_block_count(), 2);

        let stats = allocator.calculate_stats();
        assert_eq!(stats.memory_type[0].block_count, 2);
        assert_eq!(stats.total.used_bytes, 20 * MIB + 4096);

        allocator.free(big).unwrap();
        allocator.free(flagged).unwrap();
        assert_eq!(allocator.heap_usage(0), 0);
    }

    #[test]
    fn never_allocate_uses_existing_blocks_only() {
        let (_device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly)
            .flags(AllocationCreateFlags::new().never_allocate());
        assert!(matches!(
            allocator.allocate(&req(4096, 256), &info),
            Err(VmaError::OutOfDeviceMemory)
        ));

        let first = allocator
            .allocate(&req(4096, 256), &AllocationCreateInfo::new(MemoryUsage::GpuOnly))
            .unwrap();
        let second = allocator.allocate(&req(4096, 256), &info).unwrap();
        assert_eq!(
            allocator.allocation_info(first).unwrap().device_memory,
            allocator.allocation_info(second).unwrap().device_memory
        );
    }

    #[test]
    fn persistent_maps_share_one_block_mapping() {
        let (device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::CpuOnly)
            .flags(AllocationCreateFlags::new().mapped());
        let a = allocator.allocate(&req(256, 64), &info).unwrap();
        let b = allocator.allocate(&req(256, 64), &info).unwrap();

        let ia = allocator.allocation_info(a).unwrap();
        let ib = allocator.allocation_info(b).unwrap();
        assert!(!ia.mapped_data.is_null());
        assert_eq!(ib.mapped_data as usize - ia.mapped_data as usize, 256);

        unsafe { ib.mapped_data.write_bytes(0xAB, 256) };
        let bytes = device.read_bytes(ib.device_memory, ib.offset, 256).unwrap();
        assert!(bytes.iter().all(|&x| x == 0xAB));

        allocator.free(a).unwrap();
        assert!(!allocator.allocation_info(b).unwrap().mapped_data.is_null());
        allocator.free(b).unwrap();
    }

    #[test]
    fn explicit_maps_are_reference_counted() {
        let (_device, mut allocator) = setup();
        let a = allocator
            .allocate(&req(512, 16), &AllocationCreateInfo::new(MemoryUsage::CpuOnly))
            .unwrap();
        assert!(allocator.allocation_info(a).unwrap().mapped_data.is_null());

        let p1 = allocator.map(a).unwrap();
        let p2 = allocator.map(a).unwrap();
        assert_eq!(p1, p2);
        allocator.unmap(a).unwrap();
        assert_eq!(allocator.allocation_info(a).unwrap().mapped_data, p1);
        allocator.unmap(a).unwrap();
        assert!(allocator.allocation_info(a).unwrap().mapped_data.is_null());
    }

    #[test]
    fn mapping_device_local_memory_fails() {
        let (_device, mut allocator) = setup();
        let a = allocator
            .allocate(&req(512, 16), &AllocationCreateInfo::new(MemoryUsage::GpuOnly))
            .unwrap();
        assert!(matches!(allocator.map(a), Err(VmaError::MemoryMapFailed)));

        let mapped = AllocationCreateInfo::new(MemoryUsage::GpuOnly)
            .flags(AllocationCreateFlags::new().mapped());
        assert!(matches!(
            allocator.allocate(&req(512, 16), &mapped),
            Err(VmaError::MemoryMapFailed)
        ));
        assert!(allocator.validate());
    }

    #[test]
    fn exhausted_type_falls_back_to_next_candidate() {
        let device = Arc::new(HostDevice::discrete());
        let info = AllocatorCreateInfo::new().heap_size_limit(0, 0);
        let mut allocator = Allocator::new(device, &info).unwrap();

        let a = allocator
            .allocate(&req(4096, 256), &AllocationCreateInfo::new(MemoryUsage::CpuToGpu))
            .unwrap();
        assert_eq!(allocator.allocation_info(a).unwrap().memory_type_index, 1);

        let vram_only = AllocationCreateInfo::new(MemoryUsage::GpuOnly)
            .required_flags(MemoryPropertyFlags::new().device_local());
        assert!(matches!(
            allocator.allocate(&req(4096, 256), &vram_only),
            Err(VmaError::OutOfDeviceMemory)
        ));
    }

    #[test]
    fn pools_enforce_block_size_and_lifetime() {
        let (device, mut allocator) = setup();
        let pool = allocator
            .create_pool(&PoolCreateInfo::new(1).block_size(MIB).block_count(1, 2))
            .unwrap();
        assert_eq!(device.live_block_count(), 1);

        let info = AllocationCreateInfo::new(MemoryUsage::Unknown).pool(pool);
        let a = allocator.allocate(&req(MIB, 256), &info).unwrap();
        let b = allocator.allocate(&req(MIB, 256), &info).unwrap();
        assert_eq!(allocator.allocation_info(a).unwrap().pool, Some(pool));
        assert!(matches!(
            allocator.allocate(&req(4096, 256), &info),
            Err(VmaError::OutOfDeviceMemory)
        ));
        assert!(matches!(
            allocator.allocate(&req(2 * MIB, 256), &info),
            Err(VmaError::OutOfDeviceMemory)
        ));

        assert!(matches!(allocator.destroy_pool(pool), Err(VmaError::PoolInUse)));
        allocator.free(a).unwrap();
        allocator.free(b).unwrap();
        assert_eq!(device.live_block_count(), 1);
        allocator.destroy_pool(pool).unwrap();
        assert_eq!(device.live_block_count(), 0);
        assert!(matches!(allocator.destroy_pool(pool), Err(VmaError::InvalidPool)));
    }

    #[test]
    fn bind_uses_current_placement() {
        let (device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly);
        let _pad = allocator.allocate(&req(4096, 256), &info).unwrap();
        let a = allocator.allocate(&req(4096, 256), &info).unwrap();

        allocator.bind_resource(a, ResourceHandle(7)).unwrap();
        let ia = allocator.allocation_info(a).unwrap();
        assert_eq!(device.binding(ResourceHandle(7)), Some((ia.device_memory, 4096)));
    }

    #[test]
    fn frames_are_recorded_on_use() {
        let (_device, mut allocator) = setup();
        allocator.set_current_frame_index(3);
        let a = allocator
            .allocate(&req(64, 16), &AllocationCreateInfo::new(MemoryUsage::CpuOnly))
            .unwrap();
        assert_eq!(allocator.allocation_info(a).unwrap().last_use_frame, 3);

        allocator.set_current_frame_index(9);
        allocator.touch_allocation(a).unwrap();
        assert_eq!(allocator.allocation_info(a).unwrap().last_use_frame, 9);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let (_device, mut allocator) = setup();
        let info = AllocationCreateInfo::new(MemoryUsage::GpuOnly);
        assert!(matches!(
            allocator.allocate(&req(0, 16), &info),
            Err(VmaError::InvalidArgument(_))
        ));
        assert!(matches!(
            allocator.allocate(&req(64, 48), &info),
            Err(VmaError::InvalidArgument(_))
        ));
        assert!(matches!(
            allocator.allocate(&req(64, 16), &info.pool(PoolId(99))),
            Err(VmaError::InvalidPool)
        ));
    }
}
