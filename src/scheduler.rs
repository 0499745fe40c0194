//! The scheduler (C8): periodic callbacks, the interrupt-time landing
//! queue, and the block-descriptor autorelease pool.
//!
//! The engine is single-threaded under one reentrant lock (see
//! [`crate::engine::Engine`]); the only genuine concurrency it has to
//! account for is a lower device completing I/O from an interrupt or a
//! background thread and wanting to notify the engine that some patches
//! landed. That notification crosses into engine-owned state through a
//! bounded MPSC channel so the producer never blocks on the engine lock.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, warn};

use crate::block::{BlockId, BlockTable};
use crate::error::{FstitchError, FstitchResult};
use crate::patch::{PatchGraph, PatchId};

/// Depth of the landing ring. Sized generously; a producer that overflows
/// this is a device issuing more concurrent I/O than the stack was
/// configured for, which is a host-layer misconfiguration, not something
/// the engine should silently swallow.
const LANDING_RING_CAPACITY: usize = 4096;

/// One completed write, reported by a lower device: these patches may
/// now transition `INFLIGHT -> satisfied`.
pub struct LandingRequest {
    pub block: BlockId,
    pub patches: Vec<PatchId>,
}

/// A periodic callback, run once per elapsed `period_ticks` on
/// [`Scheduler::tick`].
struct Callback {
    period_ticks: u64,
    next_due: u64,
    name: &'static str,
    run: Box<dyn FnMut() + Send>,
}

pub struct LandingHandle {
    sender: Sender<LandingRequest>,
}

impl LandingHandle {
    /// Enqueues a landing request from interrupt/completion context.
    /// Never blocks: a full ring is a configuration error surfaced to
    /// the caller rather than stalling the I/O completion path.
    pub fn notify(&self, request: LandingRequest) -> FstitchResult<()> {
        self.sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => FstitchError::Backpressure("landing ring full".into()),
            TrySendError::Disconnected(_) => FstitchError::ProtocolViolation {
                reason: "landing ring has no scheduler attached".into(),
            },
        })
    }
}

impl Clone for LandingHandle {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Blocks whose refcount has dropped to zero but whose freeing is
/// deferred to the next tick boundary, per the design's scoped-lifetime
/// treatment of `bdesc` autorelease.
pub struct AutoreleasePool {
    pending: Vec<BlockId>,
}

impl AutoreleasePool {
    fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn enroll(&mut self, block: BlockId) {
        self.pending.push(block);
    }

    /// "Pop and re-push": anything still at zero refcount and patch-free
    /// is actually freed; anything revived in the meantime carries over
    /// to the next tick.
    fn drain(&mut self, blocks: &mut BlockTable) {
        let carried = std::mem::take(&mut self.pending);
        for id in carried {
            match blocks.get(id) {
                Some(bdesc) if bdesc.refcount() == 0 && !blocks.has_any_patches(id) => {
                    blocks.free(id);
                }
                Some(_) => self.pending.push(id),
                None => {}
            }
        }
    }
}

pub struct Scheduler {
    callbacks: Vec<Callback>,
    tick_count: u64,
    landing_tx: Sender<LandingRequest>,
    landing_rx: Receiver<LandingRequest>,
    pub autorelease: AutoreleasePool,
}

impl Scheduler {
    pub fn new() -> Self {
        let (landing_tx, landing_rx) = crossbeam_channel::bounded(LANDING_RING_CAPACITY);
        Self {
            callbacks: Vec::new(),
            tick_count: 0,
            landing_tx,
            landing_rx,
            autorelease: AutoreleasePool::new(),
        }
    }

    pub fn landing_handle(&self) -> LandingHandle {
        LandingHandle {
            sender: self.landing_tx.clone(),
        }
    }

    /// `sched_register`: runs `run` every `period_ticks` ticks, starting
    /// on the first tick.
    pub fn register(&mut self, name: &'static str, period_ticks: u64, run: Box<dyn FnMut() + Send>) {
        self.callbacks.push(Callback {
            period_ticks: period_ticks.max(1),
            next_due: 0,
            name,
            run,
        });
    }

    /// One scheduler tick, per §4.6:
    /// 1. run due periodic callbacks;
    /// 2. drain the landing ring, converting `INFLIGHT -> satisfied`;
    /// 3. drain the autorelease pool;
    /// returns the number of patches landed, for callers (tests, mostly)
    /// that want to assert forward progress.
    pub fn tick(&mut self, patches: &mut PatchGraph, blocks: &mut BlockTable) -> usize {
        for cb in &mut self.callbacks {
            if self.tick_count >= cb.next_due {
                debug!("running scheduler callback {}", cb.name);
                (cb.run)();
                cb.next_due = self.tick_count + cb.period_ticks;
            }
        }

        let mut landed = 0;
        while let Ok(request) = self.landing_rx.try_recv() {
            for id in request.patches {
                if !patches.exists(id) {
                    warn!("landing request for a patch that no longer exists: {:?}", id);
                    continue;
                }
                patches.clear_inflight(id);
                let mut eligible = patches.satisfy(blocks, id);
                landed += 1;
                while let Some(next) = eligible.pop() {
                    if patches.collect_dead_empty(blocks, next) {
                        continue;
                    }
                }
            }
            let _ = request.block;
        }

        self.autorelease.drain(blocks);
        self.tick_count += 1;
        landed
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
