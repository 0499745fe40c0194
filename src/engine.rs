//! The engine handle (C13): owns the patch/block arenas, the scheduler,
//! the patchgroup scope, the block-allocation registry, and the
//! registered BD stack's root, behind the single reentrant lock spec.md
//! §4.7 describes (`global_enter`/`global_leave`, unlock-callback
//! coalescing).
//!
//! Grounded on the teacher's "one struct owns the runtime, methods take
//! `&mut self`" shape (`proxmox_backup::server` modules hand around a
//! `&ServerState`-like handle); here everything genuinely is one
//! process's worth of state, so there is exactly one `Engine` rather
//! than a registry of them.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use log::error;

use crate::alloc::BlockAllocRegistry;
use crate::bd::{BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::{BlockId, BlockTable};
use crate::config::EngineConfig;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchGraph;
use crate::patchgroup::PatchgroupScope;
use crate::scheduler::Scheduler;

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A reentrant mutex: the same thread may call `global_enter` any
/// number of times without deadlocking itself, per spec.md §4.7. A
/// different thread blocks on the condvar until the owner's depth
/// drops back to zero.
struct EngineLock {
    state: Mutex<LockState>,
    cond: Condvar,
    callbacks: Mutex<HashMap<&'static str, (u32, Box<dyn FnMut(u32) + Send>)>>,
}

impl EngineLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState { owner: None, depth: 0 }),
            cond: Condvar::new(),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    fn global_enter(&self) {
        let tid = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == tid => {
                    state.depth += 1;
                    return;
                }
                None => {
                    state.owner = Some(tid);
                    state.depth = 1;
                    return;
                }
                Some(_) => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
    }

    /// `global_leave`: decrements the reentrancy depth; at zero, drains
    /// and fires every coalesced unlock callback once with its
    /// aggregated hit count, then wakes a waiting thread.
    fn global_leave(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, Some(thread::current().id()), "global_leave without a matching global_enter");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            let mut callbacks = self.callbacks.lock().unwrap();
            for (_, (hits, mut run)) in callbacks.drain() {
                run(hits);
            }
            self.cond.notify_one();
        }
    }

    /// `unlock_callback`: coalesces repeated registrations under the
    /// same key into a hit counter; `run` fires once, at the next
    /// `global_leave` that drops depth to zero, with the total count.
    fn unlock_callback(&self, key: &'static str, run: impl FnMut(u32) + Send + 'static) {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks
            .entry(key)
            .and_modify(|(hits, _)| *hits += 1)
            .or_insert_with(|| (1, Box::new(run)));
    }
}

/// The engine handle. One per process; owns every arena the BD stack
/// and patchgroup machinery share.
pub struct Engine {
    patches: PatchGraph,
    blocks: BlockTable,
    scheduler: Scheduler,
    patchgroups: PatchgroupScope,
    alloc: BlockAllocRegistry,
    lock: EngineLock,
    config: EngineConfig,
    root: Option<Box<dyn BlockDevice>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            patches: PatchGraph::new(),
            blocks: BlockTable::new(),
            scheduler: Scheduler::new(),
            patchgroups: PatchgroupScope::new(),
            alloc: BlockAllocRegistry::new(),
            lock: EngineLock::new(),
            config,
            root: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registers the top of the BD stack. A caller assembles the chain
    /// of `BlockDevice` wrappers first (terminal device at the bottom,
    /// whatever filter/cache/journal layers on top) and hands the top
    /// one over here.
    pub fn attach_root(&mut self, root: Box<dyn BlockDevice>) {
        self.root = Some(root);
    }

    pub fn root(&mut self) -> Option<&mut Box<dyn BlockDevice>> {
        self.root.as_mut()
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn patchgroups(&mut self) -> &mut PatchgroupScope {
        &mut self.patchgroups
    }

    pub fn alloc(&mut self) -> &mut BlockAllocRegistry {
        &mut self.alloc
    }

    pub fn global_enter(&self) {
        self.lock.global_enter();
    }

    pub fn global_leave(&self) {
        self.lock.global_leave();
    }

    pub fn unlock_callback(&self, key: &'static str, run: impl FnMut(u32) + Send + 'static) {
        self.lock.unlock_callback(key, run);
    }

    /// Runs `f` with a [`GraphState`] borrowing the patch and block
    /// arenas, under the reentrant lock. The natural way to call
    /// `PatchGraph`/`BlockDevice` operations from outside the crate.
    pub fn with_graph<R>(&mut self, f: impl FnOnce(&mut GraphState) -> R) -> R {
        self.lock.global_enter();
        let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
        let result = f(&mut state);
        self.lock.global_leave();
        result
    }

    /// Like [`Self::with_graph`], but also hands `f` the patchgroup
    /// scope so a caller can thread a group's engaged heads/tails
    /// through a patch it creates in the same call, the way
    /// [`crate::patchgroup::PatchgroupScope::engaged_heads`]'s own doc
    /// comment describes.
    pub fn with_graph_and_patchgroups<R>(
        &mut self,
        f: impl FnOnce(&mut GraphState, &mut crate::patchgroup::PatchgroupScope) -> R,
    ) -> R {
        self.lock.global_enter();
        let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
        let result = f(&mut state, &mut self.patchgroups);
        self.lock.global_leave();
        result
    }

    /// `create(flags) -> id` (§4.9), against this engine's own scope and
    /// graph.
    pub fn patchgroup_create(
        &mut self,
        owner: crate::patch::PatchOwner,
        flags: crate::patchgroup::PatchgroupFlags,
    ) -> FstitchResult<crate::patchgroup::PatchgroupId> {
        self.lock.global_enter();
        let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
        let result = self.patchgroups.create(&mut state, owner, flags);
        self.lock.global_leave();
        result
    }

    pub fn patchgroup_engage(&mut self, id: crate::patchgroup::PatchgroupId) -> FstitchResult<()> {
        self.patchgroups.engage(id)
    }

    pub fn patchgroup_disengage(&mut self, id: crate::patchgroup::PatchgroupId) -> FstitchResult<()> {
        self.patchgroups.disengage(id)
    }

    pub fn patchgroup_release(&mut self, id: crate::patchgroup::PatchgroupId) -> FstitchResult<()> {
        self.patchgroups.release(id)
    }

    pub fn patchgroup_add_depend(
        &mut self,
        after: crate::patchgroup::PatchgroupId,
        before: crate::patchgroup::PatchgroupId,
    ) -> FstitchResult<()> {
        self.lock.global_enter();
        let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
        let result = self.patchgroups.add_depend(&mut state, after, before);
        self.lock.global_leave();
        result
    }

    /// One scheduler tick plus the allocation registry's weak-reference
    /// reap pass, under the lock.
    pub fn tick(&mut self) -> usize {
        self.lock.global_enter();
        let landed = self.scheduler.tick(&mut self.patches, &mut self.blocks);
        self.alloc.reap_satisfied(&self.patches);
        self.lock.global_leave();
        landed
    }

    /// A `DeviceError` reaching here means the terminal BD reported a
    /// write failure; per spec.md §7 this is fatal to engine
    /// consistency, not a recoverable condition, so this logs and
    /// panics rather than returning.
    fn acknowledge<T>(result: FstitchResult<T>) -> FstitchResult<T> {
        if let Err(FstitchError::DeviceError { ref source }) = result {
            error!("fatal device error, engine state is no longer consistent: {:#}", source);
            panic!("fstitch: terminal device write failed: {:#}", source);
        }
        result
    }

    pub fn read_block(&mut self, block_no: u32) -> FstitchResult<BlockId> {
        self.lock.global_enter();
        let result = match self.root.as_mut() {
            Some(root) => {
                let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
                root.read_block(&mut state, block_no)
            }
            None => Err(FstitchError::InvariantViolation {
                reason: "read_block with no root BD attached".into(),
            }),
        };
        self.lock.global_leave();
        result
    }

    pub fn write_block(&mut self, block: BlockId, block_no: u32) -> FstitchResult<()> {
        self.lock.global_enter();
        let result = match self.root.as_mut() {
            Some(root) => {
                let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
                Self::acknowledge(root.write_block(&mut state, block, block_no))
            }
            None => Err(FstitchError::InvariantViolation {
                reason: "write_block with no root BD attached".into(),
            }),
        };
        self.lock.global_leave();
        result
    }

    /// `fstitch_sync` (§4.8): repeatedly flushes the whole stack until
    /// every device reports `FLUSH_EMPTY`. A pass that makes no
    /// progress at all (`FLUSH_NONE`) fails with [`FstitchError::SyncBusy`].
    pub fn sync(&mut self) -> FstitchResult<()> {
        self.lock.global_enter();
        let result = self.sync_inner();
        self.lock.global_leave();
        result
    }

    fn sync_inner(&mut self) -> FstitchResult<()> {
        loop {
            let progress = {
                let root = self.root.as_mut().ok_or_else(|| FstitchError::InvariantViolation {
                    reason: "sync with no root BD attached".into(),
                })?;
                let mut state = GraphState::new(&mut self.patches, &mut self.blocks);
                Self::acknowledge(root.flush(&mut state, FlushTarget::Device))?
            };
            if progress == FlushProgress::EMPTY {
                return Ok(());
            }
            if !progress.made_progress() {
                return Err(FstitchError::SyncBusy);
            }
        }
    }

    /// Drives `tick()` in a loop until the given patchgroup's tail has
    /// been satisfied, bounding the wait at `max_ticks` (this crate has
    /// no kernel-style blocking wait of its own — see
    /// [`crate::patchgroup::PatchgroupScope::sync_ready`]).
    pub fn patchgroup_sync(&mut self, id: crate::patchgroup::PatchgroupId, max_ticks: u32) -> FstitchResult<bool> {
        for _ in 0..max_ticks {
            self.lock.global_enter();
            let ready = {
                let state = GraphState::new(&mut self.patches, &mut self.blocks);
                self.patchgroups.sync_ready(&state, id)
            };
            self.lock.global_leave();
            match ready {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    self.tick();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::memory::MemoryBd;
    use crate::bd::BdId;
    use crate::patch::PatchOwner;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn engine_with_memory_root() -> Engine {
        let mut engine = Engine::new(EngineConfig::default());
        let term = MemoryBd::new(BdId(0), 8, 16, engine.scheduler().landing_handle());
        engine.attach_root(Box::new(term));
        engine
    }

    #[test]
    fn write_then_sync_then_read_round_trips() {
        let mut engine = engine_with_memory_root();
        let block = engine.read_block(1).unwrap();
        engine.with_graph(|state| {
            let owner = PatchOwner {
                id: BdId(0),
                level: 0,
                graph_index: 0,
            };
            state.patches.create_byte(state.blocks, block, owner, 0, 4, b"DATA".to_vec(), &[]).unwrap();
        });
        engine.write_block(block, 1).unwrap();
        engine.tick();
        engine.sync().unwrap();

        let reread = engine.read_block(1).unwrap();
        engine.with_graph(|state| {
            assert_eq!(&state.blocks.get(reread).unwrap().data()[0..4], b"DATA");
        });
    }

    #[test]
    fn reentrant_enter_does_not_deadlock_the_owning_thread() {
        let engine = Engine::new(EngineConfig::default());
        engine.global_enter();
        engine.global_enter();
        engine.global_leave();
        engine.global_leave();
    }

    #[test]
    fn unlock_callbacks_coalesce_and_fire_once_at_depth_zero() {
        let engine = Engine::new(EngineConfig::default());
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();

        engine.global_enter();
        engine.global_enter();
        engine.unlock_callback("wakeup", move |count| {
            seen.store(count, Ordering::SeqCst);
        });
        engine.unlock_callback("wakeup", |_| {});
        engine.global_leave();
        assert_eq!(hits.load(Ordering::SeqCst), 0, "callback only fires once depth reaches zero");
        engine.global_leave();
        assert_eq!(hits.load(Ordering::SeqCst), 2, "two registrations coalesced into one call with count 2");
    }

    #[test]
    fn sync_without_a_root_is_an_invariant_violation() {
        let mut engine = Engine::new(EngineConfig::default());
        let err = engine.sync().unwrap_err();
        assert!(matches!(err, FstitchError::InvariantViolation { .. }));
    }
}
