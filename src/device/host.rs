#![allow(clippy::cast_possible_truncation)]

use super::{
    CommandBuffer, CommandDevice, DeviceMemory, Fence, FenceDevice, FenceStatus, MemoryDevice,
    MemoryHeap, MemoryPropertyFlags, MemoryType, ResourceHandle, WaitOutcome,
};
use crate::error::{VmaError, VmaResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

/// Backing pages of one simulated device memory block.
#[derive(Debug)]
struct HostBlock {
    ptr: *mut u8,
    size: u64,
    memory_type_index: u32,
    mapped: bool,
}

// The pages are owned by the block and only touched under the state lock.
unsafe impl Send for HostBlock {}

#[derive(Debug, Clone, Copy)]
struct CopyCommand {
    src: DeviceMemory,
    src_offset: u64,
    dst: DeviceMemory,
    dst_offset: u64,
    size: u64,
}

#[derive(Debug)]
enum FenceState {
    Pending(CopyCommand),
    Signaled,
    Failed(String),
}

#[derive(Debug, Default)]
struct HostState {
    blocks: HashMap<u64, HostBlock>,
    commands: HashMap<u64, CopyCommand>,
    fences: HashMap<u64, FenceState>,
    bindings: HashMap<u64, (DeviceMemory, u64)>,
    heap_usage: Vec<u64>,
    next_handle: u64,
    fail_allocations: u32,
    fail_submits: u32,
    device_lost: bool,
}

impl HostState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Executes a copy between two blocks. Ranges are bounds-checked first.
    fn execute(&self, copy: CopyCommand) -> Result<(), String> {
        let src = self
            .blocks
            .get(&copy.src.0)
            .ok_or_else(|| format!("copy source 0x{:x} is not a live block", copy.src.0))?;
        let dst = self
            .blocks
            .get(&copy.dst.0)
            .ok_or_else(|| format!("copy destination 0x{:x} is not a live block", copy.dst.0))?;

        if copy.src_offset + copy.size > src.size || copy.dst_offset + copy.size > dst.size {
            return Err("copy range exceeds block bounds".to_string());
        }

        unsafe {
            // Source and destination may be the same block; `copy` handles overlap.
            ptr::copy(
                src.ptr.add(copy.src_offset as usize),
                dst.ptr.add(copy.dst_offset as usize),
                copy.size as usize,
            );
        }
        Ok(())
    }
}

/// An in-process device whose "device memory" is anonymous host pages.
///
/// It implements all three capability traits so the allocator, the
/// defragmenter and the wait scheduler can be exercised without a GPU.
/// Device-local memory types refuse `map_memory` like real hardware, but their
/// contents stay observable through [`HostDevice::read_bytes`].
///
/// Submitted copies complete immediately unless auto-completion is disabled,
/// in which case fences stay pending until [`HostDevice::signal_fence`] or
/// [`HostDevice::fail_fence`] is called.
#[derive(Debug)]
pub struct HostDevice {
    memory_types: Vec<MemoryType>,
    memory_heaps: Vec<MemoryHeap>,
    state: Mutex<HostState>,
    fence_changed: Condvar,
    auto_complete: AtomicBool,
}

impl HostDevice {
    #[must_use]
    pub fn new(memory_types: Vec<MemoryType>, memory_heaps: Vec<MemoryHeap>) -> Self {
        let state = HostState {
            heap_usage: vec![0; memory_heaps.len()],
            ..HostState::default()
        };

        Self {
            memory_types,
            memory_heaps,
            state: Mutex::new(state),
            fence_changed: Condvar::new(),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// A discrete-GPU layout with 256 MiB of VRAM and 256 MiB of system memory.
    #[must_use]
    pub fn discrete() -> Self {
        Self::with_heap_sizes(256 * MIB, 256 * MIB)
    }

    /// Memory types, in order:
    /// 0 device-local, 1 host-visible + coherent, 2 host-visible + coherent + cached,
    /// 3 device-local + host-visible + coherent (heap 0).
    #[must_use]
    pub fn with_heap_sizes(device_local_heap: u64, host_heap: u64) -> Self {
        let memory_heaps = vec![
            MemoryHeap {
                size: device_local_heap,
                device_local: true,
            },
            MemoryHeap {
                size: host_heap,
                device_local: false,
            },
        ];

        let memory_types = vec![
            MemoryType {
                property_flags: MemoryPropertyFlags::new().device_local(),
                heap_index: 0,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::new().host_visible().host_coherent(),
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::new()
                    .host_visible()
                    .host_coherent()
                    .host_cached(),
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::new()
                    .device_local()
                    .host_visible()
                    .host_coherent(),
                heap_index: 0,
            },
        ];

        Self::new(memory_types, memory_heaps)
    }

    /// When disabled, fences stay pending until signaled or failed explicitly.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
    }

    /// Makes the next `count` block allocations fail with `OutOfDeviceMemory`.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_allocations = count;
    }

    /// Makes the next `count` submissions fail.
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().fail_submits = count;
    }

    /// Every later submission, status query and wait reports `DeviceLost`.
    pub fn set_device_lost(&self) {
        self.state.lock().device_lost = true;
        self.fence_changed.notify_all();
    }

    /// Runs the fence's copy and marks it signaled.
    pub fn signal_fence(&self, fence: Fence) {
        let mut state = self.state.lock();
        if let Some(&FenceState::Pending(copy)) = state.fences.get(&fence.0) {
            let new_state = match state.execute(copy) {
                Ok(()) => FenceState::Signaled,
                Err(msg) => FenceState::Failed(msg),
            };
            state.fences.insert(fence.0, new_state);
        }
        drop(state);
        self.fence_changed.notify_all();
    }

    /// Marks a pending fence as failed without running its copy.
    pub fn fail_fence(&self, fence: Fence, reason: &str) {
        let mut state = self.state.lock();
        if let Some(slot) = state.fences.get_mut(&fence.0) {
            *slot = FenceState::Failed(reason.to_string());
        }
        drop(state);
        self.fence_changed.notify_all();
    }

    #[must_use]
    pub fn pending_fences(&self) -> Vec<Fence> {
        let state = self.state.lock();
        let mut pending: Vec<Fence> = state
            .fences
            .iter()
            .filter(|(_, s)| matches!(s, FenceState::Pending(_)))
            .map(|(&id, _)| Fence(id))
            .collect();
        pending.sort_by_key(|f| f.0);
        pending
    }

    /// Signals every pending fence, oldest first.
    pub fn complete_all(&self) {
        for fence in self.pending_fences() {
            self.signal_fence(fence);
        }
    }

    #[must_use]
    pub fn live_block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Fences submitted and not yet destroyed, in any state.
    #[must_use]
    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    #[must_use]
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.state
            .lock()
            .heap_usage
            .get(heap_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Reads block contents regardless of memory type.
    ///
    /// # Errors
    /// `InvalidArgument` if the block is unknown or the range is out of bounds.
    pub fn read_bytes(&self, memory: DeviceMemory, offset: u64, len: u64) -> VmaResult<Vec<u8>> {
        let state = self.state.lock();
        let block = Self::checked_block(&state, memory, offset, len)?;
        let mut out = vec![0u8; len as usize];
        unsafe {
            ptr::copy_nonoverlapping(
                block.ptr.add(offset as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        Ok(out)
    }

    /// Writes block contents regardless of memory type.
    ///
    /// # Errors
    /// `InvalidArgument` if the block is unknown or the range is out of bounds.
    pub fn write_bytes(&self, memory: DeviceMemory, offset: u64, data: &[u8]) -> VmaResult<()> {
        let state = self.state.lock();
        let block = Self::checked_block(&state, memory, offset, data.len() as u64)?;
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                block.ptr.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Where `resource` was last bound.
    #[must_use]
    pub fn binding(&self, resource: ResourceHandle) -> Option<(DeviceMemory, u64)> {
        self.state.lock().bindings.get(&resource.0).copied()
    }

    fn checked_block<'a>(
        state: &'a HostState,
        memory: DeviceMemory,
        offset: u64,
        len: u64,
    ) -> VmaResult<&'a HostBlock> {
        let block = state.blocks.get(&memory.0).ok_or_else(|| {
            VmaError::InvalidArgument(format!("unknown device memory 0x{:x}", memory.0))
        })?;
        if offset + len > block.size {
            return Err(VmaError::InvalidArgument(format!(
                "range {offset}+{len} exceeds block of {} bytes",
                block.size
            )));
        }
        Ok(block)
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, block) in state.blocks.drain() {
            unsafe {
                libc::munmap(block.ptr.cast(), block.size as usize);
            }
        }
    }
}

impl MemoryDevice for HostDevice {
    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn memory_heaps(&self) -> &[MemoryHeap] {
        &self.memory_heaps
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VmaResult<DeviceMemory> {
        if size == 0 {
            return Err(VmaError::InvalidArgument(
                "zero-sized device memory".to_string(),
            ));
        }
        let heap_index = self
            .memory_types
            .get(memory_type_index as usize)
            .ok_or_else(|| {
                VmaError::InvalidArgument(format!("memory type {memory_type_index} out of range"))
            })?
            .heap_index as usize;

        let mut state = self.state.lock();
        if state.device_lost {
            return Err(VmaError::DeviceLost);
        }
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(VmaError::OutOfDeviceMemory);
        }
        if state.heap_usage[heap_index]
            .checked_add(size)
            .is_none_or(|total| total > self.memory_heaps[heap_index].size)
        {
            return Err(VmaError::OutOfDeviceMemory);
        }

        let ptr = unsafe {
            let ret = libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ret == libc::MAP_FAILED {
                return Err(VmaError::OutOfDeviceMemory);
            }
            ret.cast::<u8>()
        };

        let handle = state.next_handle();
        state.heap_usage[heap_index] += size;
        state.blocks.insert(
            handle,
            HostBlock {
                ptr,
                size,
                memory_type_index,
                mapped: false,
            },
        );
        Ok(DeviceMemory(handle))
    }

    fn free_memory(&self, memory: DeviceMemory) {
        let mut state = self.state.lock();
        let Some(block) = state.blocks.remove(&memory.0) else {
            tracing::warn!(memory = memory.0, "free of unknown device memory");
            return;
        };
        let heap_index = self.memory_types[block.memory_type_index as usize].heap_index as usize;
        state.heap_usage[heap_index] -= block.size;
        unsafe {
            libc::munmap(block.ptr.cast(), block.size as usize);
        }
    }

    fn map_memory(&self, memory: DeviceMemory) -> VmaResult<*mut u8> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .get_mut(&memory.0)
            .ok_or(VmaError::MemoryMapFailed)?;
        let flags = self.memory_types[block.memory_type_index as usize].property_flags;
        // Mapping twice is a usage error on real devices as well.
        if !flags.host_visible || block.mapped {
            return Err(VmaError::MemoryMapFailed);
        }
        block.mapped = true;
        Ok(block.ptr)
    }

    fn unmap_memory(&self, memory: DeviceMemory) {
        if let Some(block) = self.state.lock().blocks.get_mut(&memory.0) {
            block.mapped = false;
        }
    }

    fn bind_resource(
        &self,
        resource: ResourceHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> VmaResult<()> {
        let mut state = self.state.lock();
        Self::checked_block(&state, memory, offset, 0)?;
        state.bindings.insert(resource.0, (memory, offset));
        Ok(())
    }
}

impl CommandDevice for HostDevice {
    fn record_copy(
        &self,
        src: DeviceMemory,
        src_offset: u64,
        dst: DeviceMemory,
        dst_offset: u64,
        size: u64,
    ) -> VmaResult<CommandBuffer> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(VmaError::DeviceLost);
        }
        let handle = state.next_handle();
        state.commands.insert(
            handle,
            CopyCommand {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            },
        );
        Ok(CommandBuffer(handle))
    }

    fn submit(&self, commands: CommandBuffer) -> VmaResult<Fence> {
        let mut state = self.state.lock();
        if state.device_lost {
            return Err(VmaError::DeviceLost);
        }
        let copy = state.commands.remove(&commands.0).ok_or_else(|| {
            VmaError::InvalidArgument(format!("unknown command buffer 0x{:x}", commands.0))
        })?;
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(VmaError::MoveExecutionFailed(
                "queue submission rejected".to_string(),
            ));
        }

        let handle = state.next_handle();
        let fence_state = if self.auto_complete.load(Ordering::Acquire) {
            match state.execute(copy) {
                Ok(()) => FenceState::Signaled,
                Err(msg) => FenceState::Failed(msg),
            }
        } else {
            FenceState::Pending(copy)
        };
        state.fences.insert(handle, fence_state);
        drop(state);

        self.fence_changed.notify_all();
        Ok(Fence(handle))
    }
}

impl FenceDevice for HostDevice {
    fn fence_status(&self, fence: Fence) -> VmaResult<FenceStatus> {
        let state = self.state.lock();
        if state.device_lost {
            return Err(VmaError::DeviceLost);
        }
        match state.fences.get(&fence.0) {
            Some(FenceState::Signaled) => Ok(FenceStatus::Signaled),
            Some(FenceState::Pending(_)) => Ok(FenceStatus::NotReady),
            Some(FenceState::Failed(msg)) => Err(VmaError::WaitFailed(msg.clone())),
            None => Err(VmaError::WaitFailed(format!("unknown fence 0x{:x}", fence.0))),
        }
    }

    fn wait_for_fences(&self, fences: &[Fence], timeout: Duration) -> VmaResult<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.device_lost {
                return Err(VmaError::DeviceLost);
            }
            let any_done = fences
                .iter()
                .any(|f| !matches!(state.fences.get(&f.0), Some(FenceState::Pending(_))));
            if any_done {
                return Ok(WaitOutcome::Signaled);
            }
            if self
                .fence_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    fn destroy_fence(&self, fence: Fence) {
        self.state.lock().fences.remove(&fence.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_capacity_is_enforced() {
        let device = HostDevice::with_heap_sizes(4 * MIB, 4 * MIB);
        let a = device.allocate_memory(3 * MIB, 0).unwrap();
        assert!(matches!(
            device.allocate_memory(2 * MIB, 0),
            Err(VmaError::OutOfDeviceMemory)
        ));
        device.free_memory(a);
        assert!(device.allocate_memory(2 * MIB, 0).is_ok());
    }

    #[test]
    fn huge_request_does_not_overflow_heap_usage() {
        let device = HostDevice::discrete();
        let _a = device.allocate_memory(4096, 0).unwrap();
        assert!(matches!(
            device.allocate_memory(u64::MAX - 16, 0),
            Err(VmaError::OutOfDeviceMemory)
        ));
        assert_eq!(device.heap_usage(0), 4096);
    }

    #[test]
    fn device_local_memory_is_not_mappable() {
        let device = HostDevice::discrete();
        let vram = device.allocate_memory(4096, 0).unwrap();
        let sys = device.allocate_memory(4096, 1).unwrap();
        assert!(matches!(
            device.map_memory(vram),
            Err(VmaError::MemoryMapFailed)
        ));
        assert!(device.map_memory(sys).is_ok());
        assert!(device.map_memory(sys).is_err());
        device.unmap_memory(sys);
        assert!(device.map_memory(sys).is_ok());
    }

    #[test]
    fn deferred_copy_runs_on_signal() {
        let device = HostDevice::discrete();
        device.set_auto_complete(false);
        let src = device.allocate_memory(4096, 0).unwrap();
        let dst = device.allocate_memory(4096, 0).unwrap();
        device.write_bytes(src, 16, &[1, 2, 3, 4]).unwrap();

        let cmd = device.record_copy(src, 16, dst, 64, 4).unwrap();
        let fence = device.submit(cmd).unwrap();
        assert_eq!(device.fence_status(fence).unwrap(), FenceStatus::NotReady);
        assert_eq!(
            device
                .wait_for_fences(&[fence], Duration::from_millis(1))
                .unwrap(),
            WaitOutcome::TimedOut
        );

        device.signal_fence(fence);
        assert_eq!(device.fence_status(fence).unwrap(), FenceStatus::Signaled);
        assert_eq!(device.read_bytes(dst, 64, 4).unwrap(), vec![1, 2, 3, 4]);

        device.destroy_fence(fence);
        assert_eq!(device.live_fence_count(), 0);
        assert!(matches!(
            device.fence_status(fence),
            Err(VmaError::WaitFailed(ref msg)) if msg.starts_with("unknown fence")
        ));
    }
}
