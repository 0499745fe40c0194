//! Block allocation notification (§4.10's "From personalities" contract,
//! fleshed out from `original_source/fscore/block_alloc.h` — the
//! distilled spec only gestures at this via `block_alloc_set_freed`/
//! `get_freed`/`notify_alloc`).
//!
//! A CFS/LFS-style personality frees a block by creating a patch that
//! zeroes or otherwise records the free, then calls `set_freed` so the
//! registry remembers which patch that was. When the block number is
//! handed back out by the allocator, `notify_alloc` hands back that
//! same patch (and forgets it) so the new content's `create_*` calls
//! can depend on "the free landed" instead of inheriting a dependency
//! on the stale bytes the free patch itself superseded.
//!
//! The weak-reference/satisfaction-callback mechanism spec.md §9
//! describes for this exact use case doesn't otherwise exist on
//! [`crate::patch::Patch`] itself (callbacks aren't part of the patch
//! node), so this module provides its own: [`AllocWeakRef::upgrade`]
//! fails once the registry has observed the underlying patch satisfied,
//! via [`BlockAllocRegistry::reap_satisfied`], which the scheduler tick
//! calls once a tick (see `Engine::tick` in `engine.rs`).

use std::collections::HashMap;

use crate::bd::BdId;
use crate::patch::{PatchGraph, PatchId};

/// A handle to a freed-patch registration that stops resolving once
/// the registry has observed that patch satisfied. Mirrors the
/// upgrade-fails-after-satisfaction weak reference spec.md §9 calls
/// for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocWeakRef {
    patch: PatchId,
    token: u64,
}

impl AllocWeakRef {
    /// Resolves to the underlying patch, unless the registry has
    /// already reaped it as satisfied.
    pub fn upgrade(&self, registry: &BlockAllocRegistry) -> Option<PatchId> {
        if registry.alive.contains(&self.token) {
            Some(self.patch)
        } else {
            None
        }
    }
}

/// `(bd, block_no) -> freed patch` plus the weak-reference bookkeeping
/// that retires entries once their patch actually lands.
#[derive(Default)]
pub struct BlockAllocRegistry {
    freed: HashMap<(BdId, u32), PatchId>,
    watched: Vec<(u64, PatchId)>,
    alive: std::collections::HashSet<u64>,
    next_token: u64,
}

impl BlockAllocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `block_alloc_set_freed`: records the patch representing a block
    /// having just been freed, and returns a weak handle to it.
    pub fn set_freed(&mut self, bd: BdId, block_no: u32, freed_patch: PatchId) -> AllocWeakRef {
        self.freed.insert((bd, block_no), freed_patch);
        let token = self.next_token;
        self.next_token += 1;
        self.watched.push((token, freed_patch));
        self.alive.insert(token);
        AllocWeakRef {
            patch: freed_patch,
            token,
        }
    }

    /// `block_alloc_get_freed`: looks up the freed patch for a block
    /// number without consuming the registration.
    pub fn get_freed(&self, bd: BdId, block_no: u32) -> Option<PatchId> {
        self.freed.get(&(bd, block_no)).copied()
    }

    /// `notify_alloc`: a personality calls this when handing the block
    /// back out for new content. Removes the stale mapping and returns
    /// the freed patch so the caller can depend on it directly instead
    /// of on whatever patches happened to touch the block before the
    /// free.
    pub fn notify_alloc(&mut self, bd: BdId, block_no: u32) -> Option<PatchId> {
        self.freed.remove(&(bd, block_no))
    }

    /// Drops weak-reference bookkeeping for every watched patch the
    /// graph now reports satisfied. Called once per scheduler tick.
    pub fn reap_satisfied(&mut self, graph: &PatchGraph) {
        self.watched.retain(|&(token, patch)| {
            let satisfied = graph.get(patch).map(|p| p.is_satisfied()).unwrap_or(true);
            if satisfied {
                self.alive.remove(&token);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockTable;
    use crate::patch::PatchOwner;

    fn owner(level: u16, graph_index: u16) -> PatchOwner {
        PatchOwner {
            id: BdId(0),
            level,
            graph_index,
        }
    }

    #[test]
    fn notify_alloc_consumes_the_mapping() {
        let mut graph = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let block = blocks.alloc(3, 16);
        let freed = graph
            .create_byte(&mut blocks, block, owner(0, 0), 0, 1, vec![0], &[])
            .unwrap();

        let mut registry = BlockAllocRegistry::new();
        registry.set_freed(BdId(0), 3, freed);
        assert_eq!(registry.get_freed(BdId(0), 3), Some(freed));

        let handed_back = registry.notify_alloc(BdId(0), 3);
        assert_eq!(handed_back, Some(freed));
        assert_eq!(registry.get_freed(BdId(0), 3), None, "mapping is consumed by notify_alloc");
    }

    #[test]
    fn weak_ref_fails_to_upgrade_once_reaped() {
        let mut graph = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let block = blocks.alloc(4, 16);
        let before = graph
            .create_byte(&mut blocks, block, owner(0, 0), 0, 1, vec![1], &[])
            .unwrap();
        let freed = graph
            .create_byte(&mut blocks, block, owner(0, 0), 1, 1, vec![0], &[before])
            .unwrap();

        let mut registry = BlockAllocRegistry::new();
        let weak = registry.set_freed(BdId(0), 4, freed);
        assert_eq!(weak.upgrade(&registry), Some(freed));

        registry.reap_satisfied(&graph);
        assert_eq!(weak.upgrade(&registry), Some(freed), "not yet landed, still upgrades");

        graph.satisfy(&mut blocks, before);
        registry.reap_satisfied(&graph);
        assert_eq!(weak.upgrade(&registry), None, "upgrade fails once the patch has landed");
    }
}
