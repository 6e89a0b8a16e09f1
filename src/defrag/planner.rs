//! Move selection for one block list.
//!
//! Blocks are ranked by occupied bytes, least full first. Allocations only
//! ever move towards blocks ranked after their own, so every move packs
//! memory into fuller blocks and no move stays within one block.
//!
//! The first phase tries to empty whole blocks: a block qualifies when all of
//! its allocations are movable, the budget covers all of them at once, and
//! every one of them finds room in a fuller block. The second phase spends
//! what is left of the budget on single moves into blocks that are at least
//! as full as the source.

use super::{Budget, MoveKind};
use crate::device::DeviceMemory;
use crate::memory::block::BlockId;
use crate::memory::block_list::BlockList;
use crate::memory::metadata::AllocationId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MoveCandidate {
    pub id: AllocationId,
    pub block: BlockId,
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlannedMove {
    pub id: AllocationId,
    pub size: u64,
    pub src_block: BlockId,
    pub src_memory: DeviceMemory,
    pub src_offset: u64,
    pub dst_block: BlockId,
    pub dst_memory: DeviceMemory,
    pub dst_offset: u64,
}

/// Picks moves for `candidates` and reserves their destination ranges in
/// `list`. The reservations are owned by the moving allocation's id and stay
/// in place until the move is committed or rolled back.
pub(crate) fn plan_moves(
    list: &mut BlockList,
    candidates: &[MoveCandidate],
    kind: MoveKind,
    budget: &mut Budget,
) -> Vec<PlannedMove> {
    let mut by_block: HashMap<BlockId, Vec<MoveCandidate>> = HashMap::new();
    for candidate in candidates {
        by_block.entry(candidate.block).or_default().push(*candidate);
    }
    for movable in by_block.values_mut() {
        movable.sort_by(|a, b| b.size.cmp(&a.size).then(a.offset.cmp(&b.offset)));
    }

    let mut used: HashMap<BlockId, u64> = list
        .blocks()
        .iter()
        .map(|b| (b.id, b.metadata.used_bytes()))
        .collect();
    let mut order: Vec<BlockId> = list
        .blocks()
        .iter()
        .filter(|b| !b.metadata.is_empty())
        .map(|b| b.id)
        .collect();
    order.sort_by_key(|id| used[id]);

    let mut moves = Vec::new();
    let mut emptying: HashSet<BlockId> = HashSet::new();

    for (pos, &src) in order.iter().enumerate() {
        let Some(movable) = by_block.get(&src) else {
            continue;
        };
        let resident = list.block(src).map_or(0, |b| b.metadata.allocation_count());
        let bytes: u64 = movable.iter().map(|c| c.size).sum();
        let count = movable.len() as u32;
        if movable.len() < resident || !budget.can_take(kind, bytes, count) {
            continue;
        }

        // Fullest blocks first, so the emptied block's contents fill existing gaps.
        let targets: Vec<BlockId> = order[pos + 1..]
            .iter()
            .rev()
            .filter(|id| !emptying.contains(*id))
            .copied()
            .collect();

        let mut placed = Vec::with_capacity(movable.len());
        for candidate in movable {
            match reserve(list, &targets, candidate) {
                Some(mv) => placed.push(mv),
                None => break,
            }
        }

        if placed.len() == movable.len() {
            budget.take(kind, bytes, count);
            for mv in &placed {
                refresh_used(list, &mut used, mv.dst_block);
            }
            used.insert(src, 0);
            emptying.insert(src);
            tracing::trace!(block = src.0, moves = placed.len(), "planned block evacuation");
            moves.extend(placed);
        } else {
            for mv in placed {
                if let Some(block) = list.block_mut(mv.dst_block) {
                    block.metadata.free(mv.dst_offset);
                }
            }
        }
    }

    for (pos, &src) in order.iter().enumerate() {
        if emptying.contains(&src) {
            continue;
        }
        let Some(movable) = by_block.get(&src) else {
            continue;
        };

        for candidate in movable {
            if !budget.can_take(kind, candidate.size, 1) {
                continue;
            }
            let src_used = used[&src];
            let targets: Vec<BlockId> = order[pos + 1..]
                .iter()
                .rev()
                .filter(|id| !emptying.contains(*id) && used[*id] >= src_used)
                .copied()
                .collect();

            if let Some(mv) = reserve(list, &targets, candidate) {
                let occupied = list
                    .block(src)
                    .and_then(|b| b.metadata.get(candidate.offset))
                    .map_or(candidate.size, |s| s.occupied());
                budget.take(kind, candidate.size, 1);
                refresh_used(list, &mut used, mv.dst_block);
                if let Some(u) = used.get_mut(&src) {
                    *u = u.saturating_sub(occupied);
                }
                moves.push(mv);
            }
        }
    }

    moves
}

fn reserve(
    list: &mut BlockList,
    targets: &[BlockId],
    candidate: &MoveCandidate,
) -> Option<PlannedMove> {
    let src_memory = list.block(candidate.block)?.memory;
    targets.iter().find_map(|&dst| {
        let block = list.block_mut(dst)?;
        let offset = block
            .metadata
            .allocate(candidate.size, candidate.alignment, candidate.id)
            .ok()?;
        Some(PlannedMove {
            id: candidate.id,
            size: candidate.size,
            src_block: candidate.block,
            src_memory,
            src_offset: candidate.offset,
            dst_block: dst,
            dst_memory: block.memory,
            dst_offset: offset,
        })
    })
}

fn refresh_used(list: &BlockList, used: &mut HashMap<BlockId, u64>, block: BlockId) {
    if let Some(b) = list.block(block) {
        used.insert(block, b.metadata.used_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::memory::block_list::BlockListConfig;
    use crate::memory::heap::HeapTracker;

    const BLOCK: u64 = 4096;

    struct Fixture {
        device: HostDevice,
        heaps: HeapTracker,
        list: BlockList,
        next_id: AllocationId,
    }

    impl Fixture {
        fn new(blocks: usize) -> Self {
            let device = HostDevice::discrete();
            let mut heaps = HeapTracker::new(&device, &[]);
            let mut config = BlockListConfig::new(0, BLOCK);
            config.explicit_block_size = true;
            config.min_block_count = blocks;
            let mut list = BlockList::new(config);
            list.create_min_blocks(&device, &mut heaps).unwrap();
            Self {
                device,
                heaps,
                list,
                next_id: 1,
            }
        }

        /// Places `size` bytes directly in block `index`.
        fn put(&mut self, index: usize, size: u64) -> MoveCandidate {
            let id = self.next_id;
            self.next_id += 1;
            let block_id = self.list.blocks()[index].id;
            let block = self.list.block_mut(block_id).unwrap();
            let offset = block.metadata.allocate(size, 256, id).unwrap();
            MoveCandidate {
                id,
                block: block_id,
                offset,
                size,
                alignment: 256,
            }
        }
    }

    #[test]
    fn sparse_block_is_evacuated_into_fuller_one() {
        let mut fx = Fixture::new(2);
        let a = fx.put(0, 256);
        let b = fx.put(0, 256);
        let c = fx.put(1, 3072);

        let mut budget = Budget::unlimited();
        let moves = plan_moves(&mut fx.list, &[a, b, c], MoveKind::Gpu, &mut budget);

        assert_eq!(moves.len(), 2);
        let dst = fx.list.blocks()[1].id;
        assert!(moves.iter().all(|m| m.dst_block == dst));
        assert_eq!(fx.list.blocks()[1].metadata.sum_free_size(), 512);
        assert!(fx.list.validate());
        fx.list.destroy(&fx.device, &mut fx.heaps);
    }

    #[test]
    fn pinned_allocation_prevents_evacuation_but_not_packing() {
        let mut fx = Fixture::new(2);
        let a = fx.put(0, 256);
        let _pinned = fx.put(0, 256);
        let c = fx.put(1, 2048);

        let mut budget = Budget::unlimited();
        let moves = plan_moves(&mut fx.list, &[a, c], MoveKind::Gpu, &mut budget);

        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].id, a.id);
        assert_eq!(moves[0].dst_block, fx.list.blocks()[1].id);
        fx.list.destroy(&fx.device, &mut fx.heaps);
    }

    #[test]
    fn evacuation_needing_more_than_the_budget_is_deferred() {
        let mut fx = Fixture::new(2);
        let a = fx.put(0, 512);
        let b = fx.put(0, 512);
        let c = fx.put(1, 2048);

        let mut budget = Budget::unlimited();
        budget.gpu_bytes = 600;
        let moves = plan_moves(&mut fx.list, &[a, b, c], MoveKind::Gpu, &mut budget);

        // Only one of the two fits the byte budget, so the block stays.
        assert_eq!(moves.len(), 1);
        assert_eq!(budget.gpu_bytes, 88);
        assert!(fx.list.validate());
        fx.list.destroy(&fx.device, &mut fx.heaps);
    }

    #[test]
    fn failed_evacuation_rolls_back_reservations() {
        let mut fx = Fixture::new(2);
        let a = fx.put(0, 1024);
        let b = fx.put(0, 1024);
        let _c = fx.put(1, 2560);

        let mut budget = Budget::unlimited();
        budget.gpu_moves = 2;
        let free_before = fx.list.blocks()[1].metadata.sum_free_size();
        let moves = plan_moves(&mut fx.list, &[a, b], MoveKind::Gpu, &mut budget);

        // Block 1 has room for one of them only; the second phase moves that one.
        assert_eq!(moves.len(), 1);
        assert_eq!(
            fx.list.blocks()[1].metadata.sum_free_size(),
            free_before - 1024
        );
        assert_eq!(budget.gpu_moves, 1);
        fx.list.destroy(&fx.device, &mut fx.heaps);
    }

    #[test]
    fn never_moves_into_a_less_full_block() {
        let mut fx = Fixture::new(2);
        let a = fx.put(0, 3072);
        let _b = fx.put(1, 256);

        let mut budget = Budget::unlimited();
        let moves = plan_moves(&mut fx.list, &[a], MoveKind::Gpu, &mut budget);
        assert!(moves.is_empty());
        assert_eq!(fx.list.blocks()[1].metadata.allocation_count(), 1);
        fx.list.destroy(&fx.device, &mut fx.heaps);
    }
}
