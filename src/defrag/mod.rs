//! Defragmentation: moving live allocations out of sparsely used blocks so
//! the blocks can be released.
//!
//! A [`DefragmentationContext`] runs in passes. [`DefragmentationContext::pass_begin`]
//! plans a batch of moves within the budget and reserves their destinations;
//! the caller copies the bytes (host-visible memory directly, device-local
//! memory through recorded copy commands) and reports the outcome to
//! [`DefragmentationContext::pass_end`], which repoints handles and frees
//! source ranges. [`DefragmentationContext::run_pass`] and
//! [`DefragmentationContext::defragment`] drive that loop themselves.

#![allow(clippy::cast_possible_truncation)]

pub mod planner;

use crate::device::{CommandDevice, DeviceMemory};
use crate::error::{VmaError, VmaResult};
use crate::memory::allocator::{AllocationRecord, Allocator, Placement};
use crate::memory::block::BlockId;
use crate::memory::block_list::BlockList;
use crate::memory::metadata::AllocationId;
use crate::memory::{Allocation, PoolId, PoolKey};
use crate::sync::{CompletionFuture, WaitScheduler};
use planner::MoveCandidate;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Range;
use std::ptr;

/// Budgets for one defragmentation context. Every limit covers the whole
/// context; [`Default`] is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefragmentationInfo {
    pub max_cpu_bytes_to_move: u64,
    pub max_cpu_allocations_to_move: u32,
    pub max_gpu_bytes_to_move: u64,
    pub max_gpu_allocations_to_move: u32,
    /// Pools whose allocations are all candidates for moving.
    pub pools: Vec<PoolId>,
}

impl Default for DefragmentationInfo {
    fn default() -> Self {
        Self {
            max_cpu_bytes_to_move: u64::MAX,
            max_cpu_allocations_to_move: u32::MAX,
            max_gpu_bytes_to_move: u64::MAX,
            max_gpu_allocations_to_move: u32::MAX,
            pools: Vec::new(),
        }
    }
}

impl DefragmentationInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn cpu_budget(mut self, bytes: u64, allocations: u32) -> Self {
        self.max_cpu_bytes_to_move = bytes;
        self.max_cpu_allocations_to_move = allocations;
        self
    }

    #[must_use]
    pub const fn gpu_budget(mut self, bytes: u64, allocations: u32) -> Self {
        self.max_gpu_bytes_to_move = bytes;
        self.max_gpu_allocations_to_move = allocations;
        self
    }

    #[must_use]
    pub fn pool(mut self, pool: PoolId) -> Self {
        self.pools.push(pool);
        self
    }
}

/// How a move's bytes get copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveKind {
    /// Host-visible memory, copied through a CPU mapping.
    Cpu,
    /// Device-local memory, copied by a recorded command.
    Gpu,
}

/// Remaining move allowance, split by [`MoveKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Budget {
    pub cpu_bytes: u64,
    pub cpu_moves: u32,
    pub gpu_bytes: u64,
    pub gpu_moves: u32,
}

impl Budget {
    #[cfg(test)]
    pub(crate) const fn unlimited() -> Self {
        Self {
            cpu_bytes: u64::MAX,
            cpu_moves: u32::MAX,
            gpu_bytes: u64::MAX,
            gpu_moves: u32::MAX,
        }
    }

    const fn from_info(info: &DefragmentationInfo) -> Self {
        Self {
            cpu_bytes: info.max_cpu_bytes_to_move,
            cpu_moves: info.max_cpu_allocations_to_move,
            gpu_bytes: info.max_gpu_bytes_to_move,
            gpu_moves: info.max_gpu_allocations_to_move,
        }
    }

    fn slot(&mut self, kind: MoveKind) -> (&mut u64, &mut u32) {
        match kind {
            MoveKind::Cpu => (&mut self.cpu_bytes, &mut self.cpu_moves),
            MoveKind::Gpu => (&mut self.gpu_bytes, &mut self.gpu_moves),
        }
    }

    pub(crate) const fn can_take(&self, kind: MoveKind, bytes: u64, moves: u32) -> bool {
        match kind {
            MoveKind::Cpu => bytes <= self.cpu_bytes && moves <= self.cpu_moves,
            MoveKind::Gpu => bytes <= self.gpu_bytes && moves <= self.gpu_moves,
        }
    }

    pub(crate) fn take(&mut self, kind: MoveKind, bytes: u64, moves: u32) {
        let (b, m) = self.slot(kind);
        *b = b.saturating_sub(bytes);
        *m = m.saturating_sub(moves);
    }

    fn refund(&mut self, kind: MoveKind, bytes: u64, moves: u32) {
        let (b, m) = self.slot(kind);
        *b = b.saturating_add(bytes);
        *m = m.saturating_add(moves);
    }
}

/// One planned relocation. Valid from `pass_begin` until the matching
/// `pass_end` or `abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveDescriptor {
    pub allocation: Allocation,
    pub kind: MoveKind,
    pub memory_type_index: u32,
    pub pool: Option<PoolId>,
    pub size: u64,
    pub src_memory: DeviceMemory,
    pub src_block: BlockId,
    pub src_offset: u64,
    pub dst_memory: DeviceMemory,
    pub dst_block: BlockId,
    pub dst_offset: u64,
}

impl MoveDescriptor {
    const fn pool_key(&self) -> PoolKey {
        match self.pool {
            Some(pool) => PoolKey::Custom(pool),
            None => PoolKey::Default(self.memory_type_index),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragmentationStats {
    pub bytes_moved: u64,
    pub bytes_freed: u64,
    pub allocations_moved: u32,
    pub device_memory_blocks_freed: u32,
}

impl DefragmentationStats {
    fn add(&mut self, other: &Self) {
        self.bytes_moved += other.bytes_moved;
        self.bytes_freed += other.bytes_freed;
        self.allocations_moved += other.allocations_moved;
        self.device_memory_blocks_freed += other.device_memory_blocks_freed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    /// Between passes; the next `pass_begin` may plan more moves.
    Idle,
    /// Moves were handed out and await `pass_end`.
    Active,
    /// No beneficial move is left within the budget.
    Finished,
    /// A fatal device error or an explicit abort stopped the context.
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: AllocationId,
    changed: bool,
}

#[derive(Default)]
struct Execution {
    completed: Vec<Allocation>,
    failed: Vec<Allocation>,
    waits: Vec<(Allocation, CompletionFuture)>,
    fatal: Option<VmaError>,
}

impl Execution {
    fn record_wait(&mut self, allocation: Allocation, result: VmaResult<()>) {
        match result {
            Ok(()) => self.completed.push(allocation),
            Err(e) if e.is_fatal() => {
                self.failed.push(allocation);
                self.fatal.get_or_insert(e);
            }
            Err(e) => {
                tracing::warn!(allocation = allocation.0, "move copy failed: {e}");
                self.failed.push(allocation);
            }
        }
    }
}

/// Multi-pass compaction over a set of allocations and pools.
///
/// Allocations are frozen out of consideration when they are dedicated,
/// explicitly mapped, or were used within the allocator's
/// `frame_in_use_count` frames of the frame current at creation. Each
/// allocation moves at most once per context.
#[derive(Debug)]
pub struct DefragmentationContext {
    budget: Budget,
    frame: u32,
    candidates: Vec<Candidate>,
    pools: Vec<PoolKey>,
    state: PassState,
    pending: Vec<MoveDescriptor>,
    moved: HashSet<AllocationId>,
    failed: HashSet<AllocationId>,
    stats: DefragmentationStats,
    passes: u32,
}

impl DefragmentationContext {
    pub(crate) fn new(allocator: &Allocator, info: &DefragmentationInfo) -> VmaResult<Self> {
        let mut ctx = Self {
            budget: Budget::from_info(info),
            frame: allocator.current_frame_index(),
            candidates: Vec::new(),
            pools: Vec::new(),
            state: PassState::Idle,
            pending: Vec::new(),
            moved: HashSet::new(),
            failed: HashSet::new(),
            stats: DefragmentationStats::default(),
            passes: 0,
        };
        ctx.add_pools(allocator, &info.pools)?;
        Ok(ctx)
    }

    #[must_use]
    pub const fn state(&self) -> PassState {
        self.state
    }

    /// Totals over every finished pass.
    #[must_use]
    pub const fn stats(&self) -> DefragmentationStats {
        self.stats
    }

    #[must_use]
    pub const fn pass_count(&self) -> u32 {
        self.passes
    }

    /// Enrolls individual allocations and returns their indices into
    /// [`Self::allocations_changed`].
    pub fn add_allocations(&mut self, allocations: &[Allocation]) -> Range<usize> {
        let start = self.candidates.len();
        self.candidates
            .extend(allocations.iter().map(|a| Candidate {
                id: a.0,
                changed: false,
            }));
        start..self.candidates.len()
    }

    /// Enrolls every allocation of the given pools, including ones made later.
    ///
    /// # Errors
    /// `InvalidPool` for an unknown pool; nothing is enrolled then.
    pub fn add_pools(&mut self, allocator: &Allocator, pools: &[PoolId]) -> VmaResult<()> {
        if let Some(&bad) = pools.iter().find(|p| !allocator.has_pool(**p)) {
            tracing::warn!(pool = bad.0, "defragmentation of an unknown pool");
            return Err(VmaError::InvalidPool);
        }
        for &pool in pools {
            let key = PoolKey::Custom(pool);
            if !self.pools.contains(&key) {
                self.pools.push(key);
            }
        }
        Ok(())
    }

    /// Enrolls every allocation in the default block lists of all memory types.
    pub fn add_default_pools(&mut self, allocator: &Allocator) {
        for memory_type in 0..allocator.memory_types().len() as u32 {
            let key = PoolKey::Default(memory_type);
            if !self.pools.contains(&key) {
                self.pools.push(key);
            }
        }
    }

    /// Whether each allocation passed to [`Self::add_allocations`] was moved,
    /// in enrollment order.
    #[must_use]
    pub fn allocations_changed(&self) -> Vec<bool> {
        self.candidates.iter().map(|c| c.changed).collect()
    }

    /// Every allocation this context has moved so far; resources bound to
    /// them need to be rebound.
    #[must_use]
    pub fn moved_allocations(&self) -> Vec<Allocation> {
        let mut moved: Vec<Allocation> = self.moved.iter().map(|&id| Allocation(id)).collect();
        moved.sort_unstable();
        moved
    }

    /// Plans the next batch of moves and reserves their destination ranges.
    ///
    /// An empty list means the context is done.
    ///
    /// # Errors
    /// `InvalidArgument` if the previous pass has not ended.
    pub fn pass_begin(&mut self, allocator: &mut Allocator) -> VmaResult<Vec<MoveDescriptor>> {
        match self.state {
            PassState::Active => {
                return Err(VmaError::InvalidArgument(
                    "previous defragmentation pass has not ended".to_string(),
                ));
            }
            PassState::Finished | PassState::Aborted => return Ok(Vec::new()),
            PassState::Idle => {}
        }

        let mut moves = Vec::new();
        for (pool, candidates) in self.collect_candidates(allocator) {
            if candidates.is_empty() {
                continue;
            }
            let Some(memory_type_index) = allocator.list(pool).map(BlockList::memory_type_index)
            else {
                continue;
            };
            let kind = if allocator.is_host_visible(memory_type_index) {
                MoveKind::Cpu
            } else {
                MoveKind::Gpu
            };
            let Some(list) = allocator.list_mut(pool) else {
                continue;
            };

            let planned = planner::plan_moves(list, &candidates, kind, &mut self.budget);
            for mv in planned {
                tracing::trace!(
                    allocation = mv.id,
                    src_block = mv.src_block.0,
                    src_offset = mv.src_offset,
                    dst_block = mv.dst_block.0,
                    dst_offset = mv.dst_offset,
                    size = mv.size,
                    "planned move"
                );
                allocator.track_reservation(mv.id, pool, mv.dst_block, mv.dst_offset);
                moves.push(MoveDescriptor {
                    allocation: Allocation(mv.id),
                    kind,
                    memory_type_index,
                    pool: match pool {
                        PoolKey::Custom(id) => Some(id),
                        PoolKey::Default(_) => None,
                    },
                    size: mv.size,
                    src_memory: mv.src_memory,
                    src_block: mv.src_block,
                    src_offset: mv.src_offset,
                    dst_memory: mv.dst_memory,
                    dst_block: mv.dst_block,
                    dst_offset: mv.dst_offset,
                });
            }
        }

        if moves.is_empty() {
            tracing::debug!(passes = self.passes, "defragmentation finished");
            self.state = PassState::Finished;
        } else {
            self.passes += 1;
            tracing::debug!(pass = self.passes, moves = moves.len(), "defragmentation pass begins");
            self.state = PassState::Active;
            self.pending.clone_from(&moves);
        }
        Ok(moves)
    }

    fn collect_candidates(&self, allocator: &Allocator) -> BTreeMap<PoolKey, Vec<MoveCandidate>> {
        let mut ids: BTreeMap<PoolKey, BTreeSet<AllocationId>> = BTreeMap::new();
        for &pool in &self.pools {
            ids.entry(pool)
                .or_default()
                .extend(allocator.pool_allocations(pool));
        }
        for candidate in &self.candidates {
            if let Some(AllocationRecord {
                placement: Placement::Block { pool, .. },
                ..
            }) = allocator.allocation_record(candidate.id)
            {
                ids.entry(*pool).or_default().insert(candidate.id);
            }
        }

        ids.into_iter()
            .map(|(pool, set)| {
                let movable = set
                    .into_iter()
                    .filter(|id| !self.moved.contains(id) && !self.failed.contains(id))
                    .filter_map(|id| {
                        let record = allocator.allocation_record(id)?;
                        let Placement::Block { block, offset, .. } = record.placement else {
                            return None;
                        };
                        if record.map_count > 0 || allocator.in_use_by_frame(record, self.frame) {
                            return None;
                        }
                        Some(MoveCandidate {
                            id,
                            block,
                            offset,
                            size: record.size,
                            alignment: record.alignment,
                        })
                    })
                    .collect();
                (pool, movable)
            })
            .collect()
    }

    /// Finalizes the active pass.
    ///
    /// Moves listed in `completed` are committed: the handle is repointed to
    /// the destination and the source range is freed. Moves in `failed`, or
    /// in neither list, are rolled back and their budget is returned. Blocks
    /// left empty are released as their list's minimum block count allows.
    ///
    /// # Errors
    /// `InvalidArgument` if no pass is active.
    pub fn pass_end(
        &mut self,
        allocator: &mut Allocator,
        completed: &[Allocation],
        failed: &[Allocation],
    ) -> VmaResult<DefragmentationStats> {
        if self.state != PassState::Active {
            return Err(VmaError::InvalidArgument(
                "no defragmentation pass is active".to_string(),
            ));
        }

        let mut pass = DefragmentationStats::default();
        let mut touched = BTreeSet::new();

        for mv in std::mem::take(&mut self.pending) {
            touched.insert(mv.pool_key());
            let is_failed = failed.contains(&mv.allocation);
            if is_failed || !completed.contains(&mv.allocation) {
                if !is_failed {
                    tracing::warn!(
                        allocation = mv.allocation.0,
                        "move reported neither completed nor failed"
                    );
                }
                self.rollback(allocator, &mv);
                continue;
            }

            match allocator.commit_move(mv.allocation.0, mv.dst_block, mv.dst_offset) {
                Ok(freed) => {
                    pass.bytes_moved += mv.size;
                    pass.allocations_moved += 1;
                    if let Some(size) = freed.released_block {
                        pass.bytes_freed += size;
                        pass.device_memory_blocks_freed += 1;
                    }
                    self.moved.insert(mv.allocation.0);
                    for candidate in &mut self.candidates {
                        if candidate.id == mv.allocation.0 {
                            candidate.changed = true;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(allocation = mv.allocation.0, "cannot commit move: {e}");
                    self.rollback(allocator, &mv);
                }
            }
        }

        for key in touched {
            let (count, bytes) = allocator.release_empty_blocks(key);
            pass.device_memory_blocks_freed += count as u32;
            pass.bytes_freed += bytes;
        }

        tracing::debug!(
            pass = self.passes,
            moved = pass.allocations_moved,
            bytes_moved = pass.bytes_moved,
            blocks_freed = pass.device_memory_blocks_freed,
            "defragmentation pass ended"
        );
        self.stats.add(&pass);
        self.state = PassState::Idle;
        Ok(pass)
    }

    fn rollback(&mut self, allocator: &mut Allocator, mv: &MoveDescriptor) {
        if let Err(e) = allocator.release_reservation(mv.allocation.0) {
            tracing::warn!(
                allocation = mv.allocation.0,
                "cannot release move destination: {e}"
            );
        }
        self.budget.refund(mv.kind, mv.size, 1);
        self.failed.insert(mv.allocation.0);
    }

    /// Rolls back every unfinished move and stops the context.
    pub fn abort(&mut self, allocator: &mut Allocator) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::warn!(moves = pending.len(), "defragmentation aborted, rolling back");
        }
        for mv in &pending {
            self.rollback(allocator, mv);
        }
        self.state = PassState::Aborted;
    }

    /// Ends the context, aborting an unfinished pass, and returns the totals.
    pub fn end(mut self, allocator: &mut Allocator) -> DefragmentationStats {
        if self.state == PassState::Active {
            self.abort(allocator);
        }
        self.state = PassState::Finished;
        self.stats
    }

    /// Runs one full pass: plans moves, copies host-visible ones directly,
    /// submits copy commands for device-local ones, waits for their fences
    /// and finalizes. Blocks the calling thread while copies run, so it must
    /// not be called from inside an async runtime; see [`Self::run_pass_async`].
    ///
    /// # Errors
    /// A fatal device error aborts the context and is returned.
    pub fn run_pass(
        &mut self,
        allocator: &mut Allocator,
        commands: &dyn CommandDevice,
        scheduler: &WaitScheduler,
    ) -> VmaResult<DefragmentationStats> {
        let moves = self.pass_begin(allocator)?;
        if moves.is_empty() {
            return Ok(DefragmentationStats::default());
        }

        let mut exec = Self::execute(allocator, &moves, commands, scheduler);
        for (allocation, completion) in std::mem::take(&mut exec.waits) {
            exec.record_wait(allocation, completion.wait());
        }
        self.finish(allocator, exec)
    }

    /// [`Self::run_pass`] for async callers: fence waits are awaited instead
    /// of blocking.
    ///
    /// # Errors
    /// A fatal device error aborts the context and is returned.
    pub async fn run_pass_async(
        &mut self,
        allocator: &mut Allocator,
        commands: &dyn CommandDevice,
        scheduler: &WaitScheduler,
    ) -> VmaResult<DefragmentationStats> {
        let moves = self.pass_begin(allocator)?;
        if moves.is_empty() {
            return Ok(DefragmentationStats::default());
        }

        let mut exec = Self::execute(allocator, &moves, commands, scheduler);
        for (allocation, completion) in std::mem::take(&mut exec.waits) {
            exec.record_wait(allocation, completion.await);
        }
        self.finish(allocator, exec)
    }

    /// Runs passes until nothing is left to move or the budget is spent.
    ///
    /// # Errors
    /// A fatal device error aborts the context and is returned.
    pub fn defragment(
        &mut self,
        allocator: &mut Allocator,
        commands: &dyn CommandDevice,
        scheduler: &WaitScheduler,
    ) -> VmaResult<DefragmentationStats> {
        while self.state == PassState::Idle {
            self.run_pass(allocator, commands, scheduler)?;
        }
        Ok(self.stats)
    }

    fn execute(
        allocator: &mut Allocator,
        moves: &[MoveDescriptor],
        commands: &dyn CommandDevice,
        scheduler: &WaitScheduler,
    ) -> Execution {
        let mut exec = Execution::default();
        for mv in moves {
            if exec.fatal.is_some() {
                exec.failed.push(mv.allocation);
                continue;
            }
            match mv.kind {
                MoveKind::Cpu => match copy_on_host(allocator, mv) {
                    Ok(()) => exec.completed.push(mv.allocation),
                    Err(e) => {
                        tracing::warn!(allocation = mv.allocation.0, "host copy failed: {e}");
                        exec.failed.push(mv.allocation);
                    }
                },
                MoveKind::Gpu => {
                    let submitted = commands
                        .record_copy(
                            mv.src_memory,
                            mv.src_offset,
                            mv.dst_memory,
                            mv.dst_offset,
                            mv.size,
                        )
                        .and_then(|cmd| commands.submit(cmd));
                    match submitted {
                        Ok(fence) => exec.waits.push((mv.allocation, scheduler.wait_async(fence))),
                        Err(e) if e.is_fatal() => {
                            exec.failed.push(mv.allocation);
                            exec.fatal = Some(e);
                        }
                        Err(e) => {
                            tracing::warn!(
                                allocation = mv.allocation.0,
                                "copy submission failed: {e}"
                            );
                            exec.failed.push(mv.allocation);
                        }
                    }
                }
            }
        }
        exec
    }

    fn finish(
        &mut self,
        allocator: &mut Allocator,
        exec: Execution,
    ) -> VmaResult<DefragmentationStats> {
        if let Some(e) = exec.fatal {
            tracing::error!("defragmentation aborted by device error: {e}");
            self.abort(allocator);
            return Err(e);
        }
        self.pass_end(allocator, &exec.completed, &exec.failed)
    }
}

impl Drop for DefragmentationContext {
    fn drop(&mut self) {
        if self.state == PassState::Active {
            tracing::warn!(
                moves = self.pending.len(),
                "defragmentation context dropped during a pass; \
                 destinations stay reserved until freed"
            );
        }
    }
}

/// Copies a host-visible move through temporary block mappings.
fn copy_on_host(allocator: &mut Allocator, mv: &MoveDescriptor) -> VmaResult<()> {
    let key = mv.pool_key();
    let src = allocator.map_block(key, mv.src_block)?;
    let dst = match allocator.map_block(key, mv.dst_block) {
        Ok(ptr) => ptr,
        Err(e) => {
            allocator.unmap_block(key, mv.src_block);
            return Err(e);
        }
    };

    // Source and destination are in different blocks.
    unsafe {
        ptr::copy_nonoverlapping(
            src.add(mv.src_offset as usize),
            dst.add(mv.dst_offset as usize),
            mv.size as usize,
        );
    }

    allocator.unmap_block(key, mv.dst_block);
    allocator.unmap_block(key, mv.src_block);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::memory::{
        AllocationCreateInfo, AllocatorCreateInfo, MemoryRequirements, MemoryUsage,
        PoolCreateInfo,
    };
    use std::sync::Arc;

    const BLOCK: u64 = 64 * 1024;

    fn setup(memory_type: u32) -> (Arc<HostDevice>, Allocator, PoolId) {
        let device = Arc::new(HostDevice::discrete());
        let mut allocator =
            Allocator::new(device.clone(), &AllocatorCreateInfo::default()).unwrap();
        let pool = allocator
            .create_pool(&PoolCreateInfo::new(memory_type).block_size(BLOCK))
            .unwrap();
        (device, allocator, pool)
    }

    fn alloc(allocator: &mut Allocator, pool: PoolId, size: u64) -> Allocation {
        allocator
            .allocate(
                &MemoryRequirements::new(size, 256),
                &AllocationCreateInfo::new(MemoryUsage::Unknown).pool(pool),
            )
            .unwrap()
    }

    /// Block 0 keeps `sparse` allocations of 8 KiB; block 1 is three quarters full.
    fn fragment(allocator: &mut Allocator, pool: PoolId, sparse: usize) -> Vec<Allocation> {
        let fillers: Vec<Allocation> = (0..8).map(|_| alloc(allocator, pool, 8 * 1024)).collect();
        let _full = alloc(allocator, pool, 48 * 1024);
        for (i, a) in fillers.iter().enumerate() {
            if i >= sparse {
                allocator.free(*a).unwrap();
            }
        }
        fillers[..sparse].to_vec()
    }

    #[test]
    fn manual_pass_relocates_and_frees_source_block() {
        let (device, mut allocator, pool) = setup(1);
        let moving = fragment(&mut allocator, pool, 2);
        assert_eq!(device.live_block_count(), 2);

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new())
            .unwrap();
        let range = ctx.add_allocations(&moving);

        let moves = ctx.pass_begin(&mut allocator).unwrap();
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.kind == MoveKind::Cpu));
        assert!(allocator.validate());

        let done: Vec<Allocation> = moves.iter().map(|m| m.allocation).collect();
        let stats = ctx.pass_end(&mut allocator, &done, &[]).unwrap();
        assert_eq!(stats.allocations_moved, 2);
        assert_eq!(stats.device_memory_blocks_freed, 1);
        assert_eq!(stats.bytes_freed, BLOCK);
        assert_eq!(device.live_block_count(), 1);
        assert_eq!(ctx.allocations_changed()[range], [true, true]);

        assert!(ctx.pass_begin(&mut allocator).unwrap().is_empty());
        assert_eq!(ctx.state(), PassState::Finished);
        assert!(allocator.validate());
    }

    #[test]
    fn failed_move_leaves_allocation_in_place() {
        let (_device, mut allocator, pool) = setup(1);
        let moving = fragment(&mut allocator, pool, 1);
        let before = allocator.allocation_info(moving[0]).unwrap();

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new())
            .unwrap();
        ctx.add_allocations(&moving);
        let moves = ctx.pass_begin(&mut allocator).unwrap();
        assert_eq!(moves.len(), 1);

        let stats = ctx.pass_end(&mut allocator, &[], &[moving[0]]).unwrap();
        assert_eq!(stats.allocations_moved, 0);
        assert_eq!(allocator.allocation_info(moving[0]).unwrap(), before);
        assert_eq!(ctx.allocations_changed(), [false]);
        assert!(allocator.validate());

        // A failed allocation is not retried by the same context.
        assert!(ctx.pass_begin(&mut allocator).unwrap().is_empty());
    }

    #[test]
    fn freeing_after_an_abandoned_pass_releases_the_destination() {
        let (device, mut allocator, pool) = setup(1);
        let moving = fragment(&mut allocator, pool, 1);

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new())
            .unwrap();
        ctx.add_allocations(&moving);
        assert_eq!(ctx.pass_begin(&mut allocator).unwrap().len(), 1);
        drop(ctx);

        allocator.free(moving[0]).unwrap();
        assert!(allocator.validate());
        assert_eq!(allocator.calculate_stats().total.used_bytes, 48 * 1024);
        assert_eq!(device.live_block_count(), 1);
    }

    #[test]
    fn allocation_freed_mid_pass_is_not_committed() {
        let (_device, mut allocator, pool) = setup(1);
        let moving = fragment(&mut allocator, pool, 1);

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new())
            .unwrap();
        ctx.add_allocations(&moving);
        let moves = ctx.pass_begin(&mut allocator).unwrap();
        allocator.free(moving[0]).unwrap();
        assert!(allocator.validate());

        let done: Vec<Allocation> = moves.iter().map(|m| m.allocation).collect();
        let stats = ctx.pass_end(&mut allocator, &done, &[]).unwrap();
        assert_eq!(stats.allocations_moved, 0);
        assert_eq!(allocator.calculate_stats().total.used_bytes, 48 * 1024);
        assert!(allocator.validate());
    }

    #[test]
    fn pass_protocol_is_enforced() {
        let (_device, mut allocator, pool) = setup(1);
        let moving = fragment(&mut allocator, pool, 1);

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new())
            .unwrap();
        assert!(matches!(
            ctx.pass_end(&mut allocator, &[], &[]),
            Err(VmaError::InvalidArgument(_))
        ));
        ctx.add_allocations(&moving);
        ctx.pass_begin(&mut allocator).unwrap();
        assert!(matches!(
            ctx.pass_begin(&mut allocator),
            Err(VmaError::InvalidArgument(_))
        ));

        ctx.abort(&mut allocator);
        assert_eq!(ctx.state(), PassState::Aborted);
        assert!(ctx.pass_begin(&mut allocator).unwrap().is_empty());
        assert!(allocator.validate());
    }

    #[test]
    fn mapped_and_recent_allocations_stay_put() {
        let device = Arc::new(HostDevice::discrete());
        let info = AllocatorCreateInfo::new().frame_in_use_count(2);
        let mut allocator = Allocator::new(device, &info).unwrap();
        let pool = allocator
            .create_pool(&PoolCreateInfo::new(1).block_size(BLOCK))
            .unwrap();
        let moving = fragment(&mut allocator, pool, 2);

        allocator.set_current_frame_index(10);
        allocator.touch_allocation(moving[1]).unwrap();
        allocator.map(moving[0]).unwrap();

        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new().pool(pool))
            .unwrap();
        assert!(ctx.pass_begin(&mut allocator).unwrap().is_empty());

        allocator.unmap(moving[0]).unwrap();
        let mut ctx = allocator
            .begin_defragmentation(&DefragmentationInfo::new().pool(pool))
            .unwrap();
        let moves = ctx.pass_begin(&mut allocator).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].allocation, moving[0]);
        ctx.abort(&mut allocator);
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let (_device, mut allocator, pool) = setup(1);
        allocator.destroy_pool(pool).unwrap();
        assert!(matches!(
            allocator.begin_defragmentation(&DefragmentationInfo::new().pool(pool)),
            Err(VmaError::InvalidPool)
        ));
    }

    #[test]
    fn budget_accounting() {
        let mut budget = Budget::from_info(&DefragmentationInfo::new().gpu_budget(1000, 2));
        assert!(budget.can_take(MoveKind::Gpu, 1000, 2));
        assert!(!budget.can_take(MoveKind::Gpu, 1001, 1));
        budget.take(MoveKind::Gpu, 600, 1);
        assert!(!budget.can_take(MoveKind::Gpu, 600, 1));
        budget.refund(MoveKind::Gpu, 600, 1);
        assert!(budget.can_take(MoveKind::Gpu, 1000, 2));
        assert!(budget.can_take(MoveKind::Cpu, u64::MAX, u32::MAX));
    }
}
