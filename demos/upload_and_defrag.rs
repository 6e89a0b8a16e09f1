use std::sync::Arc;
use vma_rs::{
    AllocationCreateFlags, AllocationCreateInfo, Allocator, AllocatorCreateInfo, CommandDevice,
    DefragmentationInfo, HostDevice, MemoryRequirements, MemoryUsage, WaitScheduler,
};

const KIB: u64 = 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("=== Upload and Defragmentation Demo ===");

    // 1. Device, allocator and fence waiter
    let device = Arc::new(HostDevice::with_heap_sizes(1024 * KIB, 1024 * KIB));
    let mut allocator = Allocator::new(device.clone(), &AllocatorCreateInfo::default())?;
    let scheduler = WaitScheduler::new(device.clone())?;
    println!(
        "[+] Block size for device-local memory: {} KiB",
        allocator.preferred_block_size(0).unwrap_or(0) / KIB
    );

    // 2. Fill a persistently mapped staging buffer
    let payload: Vec<u8> = (0..16 * KIB).map(|i| (i % 251) as u8).collect();
    let staging = allocator.allocate(
        &MemoryRequirements::new(payload.len() as u64, 256),
        &AllocationCreateInfo::new(MemoryUsage::CpuOnly)
            .flags(AllocationCreateFlags::new().mapped()),
    )?;
    let staging_info = allocator.allocation_info(staging)?;
    unsafe {
        std::ptr::copy_nonoverlapping(payload.as_ptr(), staging_info.mapped_data, payload.len());
    }
    println!(
        "[+] Staging buffer in memory type {} at offset {}",
        staging_info.memory_type_index, staging_info.offset
    );

    // 3. Copy into device-local memory and wait for the fence
    let target = allocator.allocate(
        &MemoryRequirements::new(payload.len() as u64, 256),
        &AllocationCreateInfo::new(MemoryUsage::GpuOnly),
    )?;
    let target_info = allocator.allocation_info(target)?;
    let cmd = device.record_copy(
        staging_info.device_memory,
        staging_info.offset,
        target_info.device_memory,
        target_info.offset,
        payload.len() as u64,
    )?;
    let fence = device.submit(cmd)?;
    scheduler.wait_async(fence).wait()?;
    allocator.free(staging)?;

    let uploaded = device.read_bytes(
        target_info.device_memory,
        target_info.offset,
        payload.len() as u64,
    )?;
    println!("[+] Upload complete, contents match: {}", uploaded == payload);

    // 4. Churn the device-local heap to leave holes behind
    let mut scratch = Vec::new();
    for i in 0..48u64 {
        scratch.push(allocator.allocate(
            &MemoryRequirements::new((i % 4 + 1) * 2 * KIB, 256),
            &AllocationCreateInfo::new(MemoryUsage::GpuOnly),
        )?);
    }
    let mut kept = Vec::new();
    for (i, a) in scratch.into_iter().enumerate() {
        if i % 4 == 0 {
            kept.push(a);
        } else {
            allocator.free(a)?;
        }
    }

    let before = allocator.calculate_stats();
    println!(
        "[+] Before: {} blocks, {} allocations, {} KiB unused",
        before.total.block_count,
        before.total.allocation_count,
        before.total.unused_bytes / KIB
    );

    // 5. Compact
    let mut ctx = allocator.begin_defragmentation(&DefragmentationInfo::new())?;
    ctx.add_default_pools(&allocator);
    let stats = ctx.defragment(&mut allocator, device.as_ref(), &scheduler)?;
    let moved = ctx.moved_allocations();
    ctx.end(&mut allocator);

    let after = allocator.calculate_stats();
    println!(
        "[+] Moved {} allocations ({} KiB), released {} blocks",
        stats.allocations_moved,
        stats.bytes_moved / KIB,
        stats.device_memory_blocks_freed
    );
    println!(
        "[+] After: {} blocks, {} KiB unused, {} handles need rebinding",
        after.total.block_count,
        after.total.unused_bytes / KIB,
        moved.len()
    );

    let target_info = allocator.allocation_info(target)?;
    let uploaded = device.read_bytes(
        target_info.device_memory,
        target_info.offset,
        payload.len() as u64,
    )?;
    println!("[+] Uploaded data intact after compaction: {}", uploaded == payload);

    // 6. Cleanup
    for a in kept {
        allocator.free(a)?;
    }
    allocator.free(target)?;
    println!("[+] Allocator valid: {}", allocator.validate());

    Ok(())
}
