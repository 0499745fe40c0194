//! Patchgroups (C9): the application-visible grouping primitive that
//! composes ordering over the patches a personality creates while a group
//! is engaged.
//!
//! A patchgroup is, internally, nothing but two anchor [`Patch`]es: `head`
//! (every enclosed patch depends on it) and `tail` (it depends on every
//! enclosed patch). `add_depend(after, before)` between two patchgroups is
//! just `add_depend` on their anchors: `after.head` gets a before-edge to
//! `before.tail`. Everything else here is bookkeeping — the per-scope id
//! table, the engaged set, and the four-bit legality lattice from §4.9.
//!
//! [`Patch`]: crate::patch::Patch

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;

use crate::bd::GraphState;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::{PatchId, PatchOwner};

/// Process-visible handle. Historically `opgroup_id_t`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PatchgroupId(pub i32);

bitflags! {
    /// Flag bits from the ioctl argument struct. `ATOMIC`'s bit pattern
    /// (0x6) overlaps `HIDDEN`'s (0x2) in the source; kept as specified
    /// rather than renumbered, since the ioctl ABI is fixed.
    pub struct PatchgroupFlags: i32 {
        const HIDDEN = 0x2;
        const ATOMIC = 0x6;
    }
}

/// One bit of the four-bit legality lattice (`C`: has_afters, `R`:
/// released, `W`: has_writes, `T`: has_befores).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LatticeState {
    pub has_afters: bool,
    pub released: bool,
    pub has_writes: bool,
    pub has_befores: bool,
}

bitflags! {
    /// Which of the four operations the lattice still permits in a given
    /// state, per the table in §4.9. `CAN_RELEASE` is in every reachable
    /// row (release is monotonic and always legal); the others gate
    /// `add_depend` in each direction and whether new content may still
    /// be enclosed.
    pub struct AllowedOps: u8 {
        /// May still be named as the `before` of another group's
        /// `add_depend` (its `has_afters`/`C` bit may still flip to 1).
        const CAN_GAIN_AFTER  = 0b0001;
        const CAN_RELEASE     = 0b0010;
        /// New patches may still be enclosed while engaged.
        const CAN_WRITE       = 0b0100;
        /// May still be named as the `after` of an `add_depend` (its
        /// `has_befores`/`T` bit may still flip to 1).
        const CAN_GAIN_BEFORE = 0b1000;
    }
}

/// Table from §4.9. Missing `(C,_,W=1,T)` combinations (`R=0` with a
/// write already recorded) are the ones the design calls out as
/// unreachable; [`allowed_ops`] falls back to "nothing" for them rather
/// than guessing, since the spec leaves their meaning an open question.
pub fn allowed_ops(s: LatticeState) -> AllowedOps {
    use AllowedOps as Op;
    match (s.has_afters, s.released, s.has_writes, s.has_befores) {
        (false, false, false, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_GAIN_BEFORE,
        (false, false, false, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_GAIN_BEFORE,
        (false, true, false, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_WRITE,
        (false, true, false, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_WRITE,
        (false, true, true, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_WRITE,
        (false, true, true, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_WRITE,
        (true, false, false, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_GAIN_BEFORE,
        (true, false, false, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE | Op::CAN_GAIN_BEFORE,
        (true, true, false, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE,
        (true, true, false, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE,
        (true, true, true, false) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE,
        (true, true, true, true) => Op::CAN_GAIN_AFTER | Op::CAN_RELEASE,
        // (_, false, true, _): W set without R — unreachable per spec.
        _ => AllowedOps::empty(),
    }
}

/// One patchgroup's state.
pub struct Patchgroup {
    id: PatchgroupId,
    flags: PatchgroupFlags,
    head: PatchId,
    tail: PatchId,
    released: bool,
    has_writes: bool,
    has_befores: bool,
    has_afters: bool,
    /// Caller (abandon) refcount; starts at 1 on `create`.
    refs: u32,
    label: Option<String>,
}

impl Patchgroup {
    pub fn id(&self) -> PatchgroupId {
        self.id
    }
    pub fn head(&self) -> PatchId {
        self.head
    }
    pub fn tail(&self) -> PatchId {
        self.tail
    }
    pub fn is_released(&self) -> bool {
        self.released
    }
    pub fn is_atomic(&self) -> bool {
        self.flags.contains(PatchgroupFlags::ATOMIC)
    }
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
    fn state(&self) -> LatticeState {
        LatticeState {
            has_afters: self.has_afters,
            released: self.released,
            has_writes: self.has_writes,
            has_befores: self.has_befores,
        }
    }
}

/// Per-process mapping `patchgroup_id -> patchgroup`, plus the set of
/// currently engaged groups that every freshly created patch in this
/// scope is threaded through. One scope per process/task; `fork` deep
/// copies it (the child inherits the parent's groups and engaged set as
/// of the fork point, sharing the same underlying head/tail patches since
/// those live in the one global graph).
pub struct PatchgroupScope {
    groups: HashMap<PatchgroupId, Patchgroup>,
    engaged: HashSet<PatchgroupId>,
    next_id: i32,
}

impl PatchgroupScope {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            engaged: HashSet::new(),
            next_id: 1,
        }
    }

    /// Deep-copies this scope for an inheriting child, per spec.md §5's
    /// "copy-on-fork produces a deep copy including empty-patch
    /// heads/tails" (the patches themselves are shared by id; what is
    /// copied is the scope's bookkeeping of which ids exist and which are
    /// engaged).
    pub fn fork(&self) -> Self {
        Self {
            groups: self.groups.iter().map(|(k, v)| (*k, v.clone_handle())).collect(),
            engaged: self.engaged.clone(),
            next_id: self.next_id,
        }
    }

    pub fn get(&self, id: PatchgroupId) -> Option<&Patchgroup> {
        self.groups.get(&id)
    }

    pub fn is_engaged(&self, id: PatchgroupId) -> bool {
        self.engaged.contains(&id)
    }

    /// The heads/tails a freshly created patch in this scope must be
    /// wired to: depend on every engaged group's head, and become a
    /// before of every engaged group's tail. See
    /// [`Self::note_patch_created`], called right after.
    pub fn engaged_heads(&self) -> Vec<PatchId> {
        self.engaged.iter().filter_map(|id| self.groups.get(id)).map(|g| g.head).collect()
    }

    pub fn engaged_tails(&self) -> Vec<PatchId> {
        self.engaged.iter().filter_map(|id| self.groups.get(id)).map(|g| g.tail).collect()
    }

    /// Marks every currently engaged group `has_writes`. Call once a new
    /// patch has actually been wired to the engaged heads/tails.
    pub fn note_patch_created(&mut self) {
        for id in self.engaged.clone() {
            if let Some(g) = self.groups.get_mut(&id) {
                g.has_writes = true;
            }
        }
    }

    /// `create(flags) -> id`: allocates head/tail anchor patches at
    /// `owner`'s level and starts the group in lattice state 0000.
    pub fn create(
        &mut self,
        state: &mut GraphState,
        owner: PatchOwner,
        flags: PatchgroupFlags,
    ) -> FstitchResult<PatchgroupId> {
        let head = state.patches.create_anchor_empty(owner, &[])?;
        let tail = state.patches.create_anchor_empty(owner, &[])?;
        let id = PatchgroupId(self.next_id);
        self.next_id += 1;
        self.groups.insert(
            id,
            Patchgroup {
                id,
                flags,
                head,
                tail,
                released: false,
                has_writes: false,
                has_befores: false,
                has_afters: false,
                refs: 1,
                label: None,
            },
        );
        Ok(id)
    }

    /// `add_depend(after, before)`: installs `after.head <- before.tail`.
    /// Legal only while `after` has no writes yet and `before` is
    /// released (§4.9's explicit text; the lattice table in
    /// [`allowed_ops`] is the same rule restated as bit transitions).
    pub fn add_depend(
        &mut self,
        state: &mut GraphState,
        after: PatchgroupId,
        before: PatchgroupId,
    ) -> FstitchResult<()> {
        let (after_head, after_has_writes) = {
            let g = self.group(after)?;
            (g.head, g.has_writes)
        };
        let (before_tail, before_released) = {
            let g = self.group(before)?;
            (g.tail, g.released)
        };
        if after_has_writes {
            return Err(FstitchError::ProtocolViolation {
                reason: format!("add_depend: {:?} already has writes enclosed", after),
            });
        }
        if !before_released {
            return Err(FstitchError::ProtocolViolation {
                reason: format!("add_depend: {:?} is not released", before),
            });
        }
        state.patches.add_depend(after_head, before_tail)?;
        self.groups.get_mut(&after).unwrap().has_befores = true;
        self.groups.get_mut(&before).unwrap().has_afters = true;
        Ok(())
    }

    /// `engage(id)`: marks `id` engaged in this scope. Atomic groups
    /// (`flags & ATOMIC`) forbid a second atomic group being engaged at
    /// the same time.
    pub fn engage(&mut self, id: PatchgroupId) -> FstitchResult<()> {
        let atomic = self.group(id)?.is_atomic();
        if atomic {
            let other_atomic_engaged = self
                .engaged
                .iter()
                .any(|e| *e != id && self.groups.get(e).map_or(false, |g| g.is_atomic()));
            if other_atomic_engaged {
                return Err(FstitchError::ProtocolViolation {
                    reason: "an atomic patchgroup is already engaged in this scope".into(),
                });
            }
        }
        self.engaged.insert(id);
        Ok(())
    }

    pub fn disengage(&mut self, id: PatchgroupId) -> FstitchResult<()> {
        self.group(id)?;
        self.engaged.remove(&id);
        Ok(())
    }

    /// `release(id)`: always legal (monotonic `R` bit); idempotent.
    pub fn release(&mut self, id: PatchgroupId) -> FstitchResult<()> {
        self.groups.get_mut(&id).ok_or(unknown(id))?.released = true;
        Ok(())
    }

    /// `abandon(id)`: drops the caller's reference. At zero refcount, a
    /// group that was never released and never linked to anything
    /// (nothing enclosed, nothing depends on it) is freed outright;
    /// otherwise its head/tail are left in the graph as ordinary patches,
    /// to be satisfied and garbage-collected through the normal flush
    /// path. Either way the id itself is retired from this scope.
    pub fn abandon(&mut self, state: &mut GraphState, id: PatchgroupId) -> FstitchResult<()> {
        let g = self.groups.get_mut(&id).ok_or(unknown(id))?;
        g.refs = g.refs.saturating_sub(1);
        if g.refs > 0 {
            return Ok(());
        }
        let g = self.groups.remove(&id).unwrap();
        self.engaged.remove(&id);
        if !g.released
            && state.patches.get(g.head).map_or(true, |p| p.afters().is_empty())
            && state.patches.get(g.tail).map_or(true, |p| p.befores().is_empty())
        {
            state.patches.collect_dead_empty(state.blocks, g.head);
            state.patches.collect_dead_empty(state.blocks, g.tail);
        }
        Ok(())
    }

    /// `sync(id)`: requires prior `release`; reports whether `tail` has
    /// already been satisfied. This crate has no kernel-style blocking
    /// wait of its own — a caller that wants to block until `true` drives
    /// [`crate::scheduler::Scheduler::tick`]/[`crate::engine::Engine::sync`]
    /// in a loop (see `Engine::patchgroup_sync`).
    pub fn sync_ready(&self, state: &GraphState, id: PatchgroupId) -> FstitchResult<bool> {
        let g = self.group(id)?;
        if !g.released {
            return Err(FstitchError::ProtocolViolation {
                reason: format!("sync({:?}) called before release", id),
            });
        }
        Ok(!state.patches.exists(g.tail))
    }

    pub fn set_label(&mut self, id: PatchgroupId, label: impl Into<String>) -> FstitchResult<()> {
        let label = label.into();
        if label.len() > 128 {
            return Err(FstitchError::ProtocolViolation {
                reason: "patchgroup label exceeds 128 bytes".into(),
            });
        }
        self.groups.get_mut(&id).ok_or(unknown(id))?.label = Some(label);
        Ok(())
    }

    fn group(&self, id: PatchgroupId) -> FstitchResult<&Patchgroup> {
        self.groups.get(&id).ok_or_else(|| unknown(id))
    }
}

fn unknown(id: PatchgroupId) -> FstitchError {
    FstitchError::ProtocolViolation {
        reason: format!("unknown patchgroup {:?}", id),
    }
}

impl Patchgroup {
    /// Shallow clone used by `PatchgroupScope::fork`; shares the
    /// underlying head/tail `PatchId`s (they name the same graph nodes),
    /// copies everything else by value.
    fn clone_handle(&self) -> Self {
        Patchgroup {
            id: self.id,
            flags: self.flags,
            head: self.head,
            tail: self.tail,
            released: self.released,
            has_writes: self.has_writes,
            has_befores: self.has_befores,
            has_afters: self.has_afters,
            refs: self.refs,
            label: self.label.clone(),
        }
    }
}

impl Default for PatchgroupScope {
    fn default() -> Self {
        Self::new()
    }
}

/// The host character-device ioctl surface (§4.9/§6), realized without an
/// actual `/dev` node: a command enum plus the 4-field argument struct,
/// and a dispatcher a host bridge can call directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BridgeCommand {
    Create = 1,
    Sync = 2,
    AddDepend = 3,
    Engage = 4,
    Disengage = 5,
    Release = 6,
    Abandon = 7,
    Label = 8,
    TxnStart = 9,
    TxnFinish = 10,
    TxnAbort = 11,
}

/// `{i32 id_a; i32 id_b; i32 flags; ptr str}` from §6, with `str` decoded
/// to an owned `String` (≤128 bytes) rather than a raw pointer.
#[derive(Clone, Debug, Default)]
pub struct BridgeArgs {
    pub id_a: i32,
    pub id_b: i32,
    pub flags: i32,
    pub label: Option<String>,
}

/// Dispatches one ioctl-style command. Returns the nonnegative result
/// (the new id, on `Create`/`TxnStart`; `0` otherwise) on success.
pub fn dispatch(
    scope: &mut PatchgroupScope,
    state: &mut GraphState,
    owner: PatchOwner,
    cmd: BridgeCommand,
    args: BridgeArgs,
) -> FstitchResult<i32> {
    match cmd {
        BridgeCommand::Create => {
            let flags = PatchgroupFlags::from_bits_truncate(args.flags);
            let id = scope.create(state, owner, flags)?;
            Ok(id.0)
        }
        BridgeCommand::Sync => {
            let ready = scope.sync_ready(state, PatchgroupId(args.id_a))?;
            Ok(if ready { 1 } else { 0 })
        }
        BridgeCommand::AddDepend => {
            scope.add_depend(state, PatchgroupId(args.id_a), PatchgroupId(args.id_b))?;
            Ok(0)
        }
        BridgeCommand::Engage => {
            scope.engage(PatchgroupId(args.id_a))?;
            Ok(0)
        }
        BridgeCommand::Disengage => {
            scope.disengage(PatchgroupId(args.id_a))?;
            Ok(0)
        }
        BridgeCommand::Release => {
            scope.release(PatchgroupId(args.id_a))?;
            Ok(0)
        }
        BridgeCommand::Abandon => {
            scope.abandon(state, PatchgroupId(args.id_a))?;
            Ok(0)
        }
        BridgeCommand::Label => {
            let label = args.label.unwrap_or_default();
            scope.set_label(PatchgroupId(args.id_a), label)?;
            Ok(0)
        }
        BridgeCommand::TxnStart => {
            let id = scope.create(state, owner, PatchgroupFlags::empty())?;
            scope.engage(id)?;
            Ok(id.0)
        }
        BridgeCommand::TxnFinish => {
            let id = PatchgroupId(args.id_a);
            scope.release(id)?;
            scope.disengage(id)?;
            Ok(0)
        }
        BridgeCommand::TxnAbort => {
            let id = PatchgroupId(args.id_a);
            scope.disengage(id)?;
            scope.abandon(state, id)?;
            Ok(0)
        }
    }
}
