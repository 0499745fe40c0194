//! Concrete Rust shape for spec.md §4.10's two external contracts: what
//! the core expects *from* a personality (CFS/LFS-style filesystem code
//! built on top), and what it expects *from* the host OS underneath it.
//!
//! Both are traits with default method bodies wired against an
//! [`Engine`] handle, so a personality or host gets working behavior for
//! free and only overrides the hook it actually needs to customize (a
//! personality with its own block-space heuristic, say, or a host that
//! wants `request_landing` to hop a real interrupt boundary instead of
//! calling straight through).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::bd::BdId;
use crate::block::BlockId;
use crate::engine::Engine;
use crate::error::FstitchResult;
use crate::patch::{PatchId, PatchOwner};
use crate::scheduler::LandingRequest;

/// The "from personalities" half of §4.10: every `create_*` call a
/// filesystem layer makes before handing a block to `write_block`, plus
/// the free/realloc threading spec.md §9 describes.
///
/// A personality implements this as a thin marker (or a struct carrying
/// its own `BdId`/defaults); the default bodies do the real work against
/// whatever [`Engine`] is passed in.
pub trait PersonalityHooks {
    fn create_byte(
        &mut self,
        engine: &mut Engine,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        length: u16,
        new_data: Vec<u8>,
        pass_set: &[PatchId],
    ) -> FstitchResult<PatchId> {
        engine.with_graph(|state| {
            state
                .patches
                .create_byte(state.blocks, block, owner, offset, length, new_data, pass_set)
        })
    }

    fn create_bit(
        &mut self,
        engine: &mut Engine,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        xor_mask: u32,
        pass_set: &[PatchId],
    ) -> FstitchResult<PatchId> {
        engine.with_graph(|state| {
            state
                .patches
                .create_bit(state.blocks, block, owner, offset, xor_mask, pass_set)
        })
    }

    fn create_empty(&mut self, engine: &mut Engine, owner: PatchOwner, pass_set: &[PatchId]) -> FstitchResult<PatchId> {
        engine.with_graph(|state| state.patches.create_empty(state.blocks, owner, pass_set))
    }

    fn create_diff(
        &mut self,
        engine: &mut Engine,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        old: &[u8],
        new: &[u8],
        pass_set: &[PatchId],
    ) -> FstitchResult<Option<PatchId>> {
        engine.with_graph(|state| {
            state
                .patches
                .create_diff(state.blocks, block, owner, offset, old, new, pass_set)
        })
    }

    /// Advisory only, per §4.10 ("must treat `get_block_space` as
    /// advisory backpressure"): a personality should slow down, not
    /// refuse outright, when this goes negative.
    fn block_space_hint(&self, engine: &mut Engine) -> i32 {
        engine.root().map(|root| root.get_block_space()).unwrap_or(0)
    }

    fn set_freed(&mut self, engine: &mut Engine, bd: BdId, block_no: u32, freed_patch: PatchId) {
        engine.alloc().set_freed(bd, block_no, freed_patch);
    }

    fn get_freed(&self, engine: &mut Engine, bd: BdId, block_no: u32) -> Option<PatchId> {
        engine.alloc().get_freed(bd, block_no)
    }

    fn notify_alloc(&mut self, engine: &mut Engine, bd: BdId, block_no: u32) -> Option<PatchId> {
        engine.alloc().notify_alloc(bd, block_no)
    }
}

/// The "from host OS" half of §4.10: a landing entry point callable from
/// interrupt context, small/page allocation, and a monotonic jiffy
/// counter for periodic callbacks.
pub trait HostHooks {
    /// `request_landing`: notifies the engine that a block's in-flight
    /// patches have completed, from whatever context the underlying
    /// device's completion handler runs in. Must not block.
    fn request_landing(&self, request: LandingRequest) -> FstitchResult<()>;

    /// Allocates a small (sub-page) buffer of `len` bytes.
    fn alloc_small(&self, len: usize) -> Vec<u8>;

    /// Allocates a page-sized buffer (`len` rounded up by the host).
    fn alloc_pages(&self, len: usize) -> Vec<u8>;

    /// Monotonic tick counter for periodic callbacks (`sched_register`).
    /// Not wall-clock time; only required to be non-decreasing.
    fn jiffies(&self) -> u64;
}

/// The default [`HostHooks`] implementation: `std::alloc` (via plain
/// `Vec` allocation, which already routes through the global allocator)
/// for memory, a `std::time::Instant`-based monotonic counter for
/// jiffies, and the engine's own landing channel for `request_landing`.
pub struct StdHostHooks {
    landing: crate::scheduler::LandingHandle,
    epoch: Instant,
    jiffy_scale_millis: u64,
    counter: AtomicU64,
}

impl StdHostHooks {
    /// `jiffy_scale_millis` controls how many milliseconds map to one
    /// jiffy tick; most callers just want a counter that advances, so
    /// `new_counting` below is the simpler constructor to reach for.
    pub fn new(landing: crate::scheduler::LandingHandle, jiffy_scale_millis: u64) -> Self {
        Self {
            landing,
            epoch: Instant::now(),
            jiffy_scale_millis: jiffy_scale_millis.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// A jiffy counter that just increments once per call instead of
    /// tracking wall-clock time; adequate for tests and for hosts that
    /// only need monotonicity, not real timing.
    pub fn new_counting(landing: crate::scheduler::LandingHandle) -> Self {
        Self::new(landing, 1)
    }
}

impl HostHooks for StdHostHooks {
    fn request_landing(&self, request: LandingRequest) -> FstitchResult<()> {
        self.landing.notify(request)
    }

    fn alloc_small(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    fn alloc_pages(&self, len: usize) -> Vec<u8> {
        const PAGE: usize = 4096;
        let rounded = (len + PAGE - 1) / PAGE * PAGE;
        vec![0u8; rounded]
    }

    fn jiffies(&self) -> u64 {
        if self.jiffy_scale_millis == 1 && self.epoch.elapsed().as_millis() == 0 {
            return self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        (self.epoch.elapsed().as_millis() as u64) / self.jiffy_scale_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::memory::MemoryBd;
    use crate::bd::BdId;
    use crate::config::EngineConfig;

    struct NullPersonality;
    impl PersonalityHooks for NullPersonality {}

    fn engine_with_memory_root() -> Engine {
        let mut engine = Engine::new(EngineConfig::default());
        let term = MemoryBd::new(BdId(0), 4, 16, engine.scheduler().landing_handle());
        engine.attach_root(Box::new(term));
        engine
    }

    #[test]
    fn default_personality_hooks_create_a_real_patch() {
        let mut engine = engine_with_memory_root();
        let mut hooks = NullPersonality;
        let block = engine.read_block(0).unwrap();
        let owner = PatchOwner {
            id: BdId(0),
            level: 0,
            graph_index: 0,
        };
        let id = hooks
            .create_byte(&mut engine, block, owner, 0, 3, vec![1, 2, 3], &[])
            .unwrap();
        engine.with_graph(|state| assert!(state.patches.exists(id)));
    }

    #[test]
    fn notify_alloc_round_trips_through_the_personality_hook() {
        let mut engine = engine_with_memory_root();
        let mut hooks = NullPersonality;
        let block = engine.read_block(0).unwrap();
        let owner = PatchOwner {
            id: BdId(0),
            level: 0,
            graph_index: 0,
        };
        let freed = hooks.create_byte(&mut engine, block, owner, 0, 1, vec![0], &[]).unwrap();
        hooks.set_freed(&mut engine, BdId(0), 0, freed);
        assert_eq!(hooks.get_freed(&mut engine, BdId(0), 0), Some(freed));
        assert_eq!(hooks.notify_alloc(&mut engine, BdId(0), 0), Some(freed));
        assert_eq!(hooks.notify_alloc(&mut engine, BdId(0), 0), None, "second call finds nothing left to consume");
    }

    #[test]
    fn std_host_hooks_jiffies_is_monotonic() {
        let mut engine = engine_with_memory_root();
        let hooks = StdHostHooks::new_counting(engine.scheduler().landing_handle());
        let a = hooks.jiffies();
        let b = hooks.jiffies();
        assert!(b > a);
    }

    #[test]
    fn std_host_hooks_pages_round_up_to_page_size() {
        let mut engine = engine_with_memory_root();
        let hooks = StdHostHooks::new_counting(engine.scheduler().landing_handle());
        assert_eq!(hooks.alloc_pages(1).len(), 4096);
        assert_eq!(hooks.alloc_pages(4096).len(), 4096);
        assert_eq!(hooks.alloc_pages(4097).len(), 8192);
    }
}
