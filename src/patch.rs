//! The patch graph (C1 in the design).
//!
//! A patch is one pending change to a block's in-memory image. Patches are
//! nodes in a DAG: `befores` are the patches that must reach the disk
//! first, `afters` are the back-links used to propagate satisfaction.
//! Patches live in a flat arena (a `PatchId` is a stable slab index, per
//! the design notes) rather than behind raw pointers, so the graph can be
//! mutated without `Rc<RefCell<_>>` cycles or unsafe aliasing.
//!
//! Patches are also spliced into their block's per-`graph_index` sublist
//! (see [`crate::block::BlockDescriptor`]) so that [`PatchGraph::push_down`]
//! and merge lookups only ever walk the patches a single BD owns on a
//! single block, not the whole arena.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::bd::BdId;
use crate::block::{BlockId, BlockTable};
use crate::error::FstitchError;

/// Stable index of a patch inside the engine's patch arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PatchId(pub(crate) u32);

bitflags! {
    /// Transient and lifecycle flags carried by every patch.
    pub struct PatchFlags: u8 {
        /// Set transiently during a graph walk (cycle detection).
        const MARKED        = 0b0000_0001;
        /// The patch's `old_bytes` are what currently live in the block
        /// buffer; the patch has not (yet, or again) been applied.
        const ROLLED_BACK   = 0b0000_0010;
        /// Handed to the storage layer, not yet acknowledged.
        const INFLIGHT      = 0b0000_0100;
        /// The before-edge is semantic only; it does not require a
        /// rollback/roll-forward pairing to honor.
        const SAFE_AFTER    = 0b0000_1000;
        /// Exempt from patchgroup engagement (used by `unlink_bd`).
        const NO_PATCHGROUP = 0b0001_0000;
    }
}

/// What kind of change a patch represents.
#[derive(Debug, Clone)]
pub enum PatchKind {
    /// Overwrite a contiguous byte range.
    Byte {
        offset: u16,
        length: u16,
        new_bytes: Vec<u8>,
        old_bytes: Vec<u8>,
    },
    /// Toggle the bits set in `xor_mask` at a word offset.
    Bit { offset: u16, xor_mask: u32 },
    /// A pure sync/barrier node; carries no data change.
    Empty,
}

impl PatchKind {
    pub fn type_tag(&self) -> u8 {
        match self {
            PatchKind::Byte { .. } => 1,
            PatchKind::Bit { .. } => 2,
            PatchKind::Empty => 3,
        }
    }
}

/// One node of the patch DAG.
#[derive(Debug)]
pub struct Patch {
    id: PatchId,
    owner: BdId,
    /// The level of `owner` at the time this patch was created or most
    /// recently pushed down; used to enforce level monotonicity.
    level: u16,
    block: Option<BlockId>,
    kind: PatchKind,
    befores: Vec<PatchId>,
    afters: Vec<PatchId>,
    flags: PatchFlags,
    /// `graph_index` of `owner`; determines which per-block sublist this
    /// patch is spliced into.
    graph_index: u16,
}

impl Patch {
    pub fn id(&self) -> PatchId {
        self.id
    }
    pub fn owner(&self) -> BdId {
        self.owner
    }
    pub fn level(&self) -> u16 {
        self.level
    }
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }
    pub fn kind(&self) -> &PatchKind {
        &self.kind
    }
    pub fn befores(&self) -> &[PatchId] {
        &self.befores
    }
    pub fn afters(&self) -> &[PatchId] {
        &self.afters
    }
    pub fn flags(&self) -> PatchFlags {
        self.flags
    }
    pub fn graph_index(&self) -> u16 {
        self.graph_index
    }
    pub fn is_inflight(&self) -> bool {
        self.flags.contains(PatchFlags::INFLIGHT)
    }
    pub fn is_rolled_back(&self) -> bool {
        self.flags.contains(PatchFlags::ROLLED_BACK)
    }
    pub fn is_satisfied(&self) -> bool {
        self.befores.is_empty() && !self.is_inflight()
    }

    fn overlaps_byte_range(&self, offset: u16, length: u16) -> bool {
        match &self.kind {
            PatchKind::Byte {
                offset: o, length: l, ..
            } => {
                let (a0, a1) = (*o as u32, *o as u32 + *l as u32);
                let (b0, b1) = (offset as u32, offset as u32 + length as u32);
                a0 < b1 && b0 < a1
            }
            _ => false,
        }
    }
}

/// A BD identity plus the level/graph_index a patch should be stamped
/// with at creation time. Kept separate from `crate::bd::BdHeader` so
/// `patch.rs` does not need to know about the `BlockDevice` trait.
#[derive(Clone, Copy, Debug)]
pub struct PatchOwner {
    pub id: BdId,
    pub level: u16,
    pub graph_index: u16,
}

/// The arena owning every live patch.
pub struct PatchGraph {
    slots: Vec<Option<Patch>>,
    free: Vec<u32>,
}

impl PatchGraph {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: PatchId) -> Option<&mut Patch> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    fn alloc(&mut self, patch: Patch) -> PatchId {
        if let Some(slot) = self.free.pop() {
            let id = PatchId(slot);
            self.slots[slot as usize] = Some(patch);
            id
        } else {
            let id = PatchId(self.slots.len() as u32);
            self.slots.push(Some(patch));
            id
        }
    }

    /// Frees a patch slot, detaching it from its block's per-BD sublist
    /// first if it had one. Callers must have already unlinked the patch
    /// from every `befores`/`afters` edge (satisfaction does this).
    fn free(&mut self, blocks: &mut BlockTable, id: PatchId) {
        if let Some(Some(p)) = self.slots.get(id.0 as usize) {
            if let Some(block) = p.block {
                if let Some(bdesc) = blocks.get_mut(block) {
                    bdesc.detach(p.graph_index, id);
                }
            }
            self.slots[id.0 as usize] = None;
            self.free.push(id.0);
        }
    }

    /// `patch_mark_graph`: sets `MARKED` on `root` and everything
    /// transitively reachable through `befores`.
    pub fn mark_graph(&mut self, root: PatchId) {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(p) = self.get_mut(id) {
                p.flags.insert(PatchFlags::MARKED);
                stack.extend(p.befores.iter().copied());
            }
        }
    }

    /// `patch_unmark_graph`: the inverse of [`Self::mark_graph`].
    pub fn unmark_graph(&mut self, root: PatchId) {
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(p) = self.get_mut(id) {
                p.flags.remove(PatchFlags::MARKED);
                stack.extend(p.befores.iter().copied());
            }
        }
    }

    /// True if adding the edge `after -> before` (before must land first)
    /// would introduce a cycle, i.e. `after` is already reachable from
    /// `before` via `befores` edges.
    fn would_cycle(&self, after: PatchId, before: PatchId) -> bool {
        if after == before {
            return true;
        }
        let mut stack = vec![before];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == after {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(p) = self.get(id) {
                stack.extend(p.befores.iter().copied());
            }
        }
        false
    }

    /// `add_depend(after, before)`: installs the edge iff it would not
    /// introduce a cycle. Edge removal (satisfaction) is always legal and
    /// handled by [`Self::satisfy`].
    pub fn add_depend(&mut self, after: PatchId, before: PatchId) -> Result<(), FstitchError> {
        if self.would_cycle(after, before) {
            return Err(FstitchError::InvariantViolation {
                reason: format!("add_depend({:?}, {:?}) would create a cycle", after, before),
            });
        }
        {
            let after_level = self.get(after).ok_or(FstitchError::StalePatch(after))?.level;
            let before_level = self
                .get(before)
                .ok_or(FstitchError::StalePatch(before))?
                .level;
            if before_level > after_level {
                return Err(FstitchError::InvariantViolation {
                    reason: format!(
                        "add_depend would point upward in the stack (before level {} > after level {})",
                        before_level, after_level
                    ),
                });
            }
        }
        if let Some(p) = self.get(after) {
            if p.is_inflight() {
                return Err(FstitchError::InvariantViolation {
                    reason: "cannot add a before to an inflight patch".into(),
                });
            }
        }
        if let Some(p) = self.get_mut(after) {
            if !p.befores.contains(&before) {
                p.befores.push(before);
            }
        }
        if let Some(p) = self.get_mut(before) {
            if !p.afters.contains(&after) {
                p.afters.push(after);
            }
        }
        Ok(())
    }

    /// Drops every before-edge of `id` that `keep` rejects. Used by
    /// `unlink_bd`, which severs all but same-block and write-head
    /// dependencies on the patches that pass through it.
    pub fn prune_befores<F: FnMut(PatchId) -> bool>(&mut self, id: PatchId, mut keep: F) {
        let befores = self.get(id).map(|p| p.befores.clone()).unwrap_or_default();
        for before in befores {
            if !keep(before) {
                self.remove_edge(id, before);
            }
        }
    }

    fn remove_edge(&mut self, after: PatchId, before: PatchId) {
        if let Some(p) = self.get_mut(after) {
            p.befores.retain(|&b| b != before);
        }
        if let Some(p) = self.get_mut(before) {
            p.afters.retain(|&a| a != after);
        }
    }

    /// Installs an edge without re-running the cycle/level checks
    /// `add_depend` does for caller-supplied dependencies. Only for
    /// internal graph surgery ([`Self::retire`]) that transplants an
    /// edge already known to have been valid on the patch it replaces;
    /// re-validating the level here would spuriously reject the common
    /// case of retiring into a patch that has since been pushed further
    /// down the stack than the original.
    fn install_edge(&mut self, after: PatchId, before: PatchId) {
        if let Some(p) = self.get_mut(after) {
            if !p.befores.contains(&before) {
                p.befores.push(before);
            }
        }
        if let Some(p) = self.get_mut(before) {
            if !p.afters.contains(&after) {
                p.afters.push(after);
            }
        }
    }

    /// Creates an empty/barrier patch with the given pass-set. Per the
    /// boundary case in the design, a patch created with no befores (and
    /// therefore, being brand new, no afters either) is freed on the spot
    /// rather than retained.
    pub fn create_empty(
        &mut self,
        blocks: &mut BlockTable,
        owner: PatchOwner,
        pass_set: &[PatchId],
    ) -> Result<PatchId, FstitchError> {
        let id = self.alloc_empty(owner, pass_set)?;
        if self.get(id).unwrap().befores.is_empty() {
            self.free(blocks, id);
        }
        Ok(id)
    }

    /// Creates an empty patch that is exempt from the immediate-GC rule
    /// `create_empty` applies to zero-edge barriers. Used for a
    /// patchgroup's `head`/`tail` (`crate::patchgroup`), which must
    /// survive with no edges at all between `create` and the first patch
    /// enclosed under it, and for a BD's own `get_write_head` anchor.
    pub fn create_anchor_empty(
        &mut self,
        owner: PatchOwner,
        pass_set: &[PatchId],
    ) -> Result<PatchId, FstitchError> {
        self.alloc_empty(owner, pass_set)
    }

    fn alloc_empty(
        &mut self,
        owner: PatchOwner,
        pass_set: &[PatchId],
    ) -> Result<PatchId, FstitchError> {
        let id = self.alloc(Patch {
            id: PatchId(0),
            owner: owner.id,
            level: owner.level,
            block: None,
            kind: PatchKind::Empty,
            befores: Vec::new(),
            afters: Vec::new(),
            flags: PatchFlags::empty(),
            graph_index: owner.graph_index,
        });
        self.get_mut(id).unwrap().id = id;
        for &before in pass_set {
            self.add_depend(id, before)?;
        }
        Ok(id)
    }

    /// Creates (or merges into an existing compatible patch) a byte
    /// overwrite. `blocks` supplies the block's current in-memory buffer,
    /// which is needed to fill the untouched portion of a merged range
    /// (see [`Self::try_merge_byte`]).
    pub fn create_byte(
        &mut self,
        blocks: &mut BlockTable,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        length: u16,
        new_data: Vec<u8>,
        pass_set: &[PatchId],
    ) -> Result<PatchId, FstitchError> {
        if length == 0 || new_data.len() != length as usize {
            return Err(FstitchError::InvariantViolation {
                reason: "zero-length or size-mismatched byte patch rejected".into(),
            });
        }

        let old_bytes = {
            let current = blocks
                .get(block)
                .ok_or_else(|| FstitchError::InvariantViolation {
                    reason: "create_byte on unknown block".into(),
                })?;
            current.data()[offset as usize..offset as usize + length as usize].to_vec()
        };

        // The live buffer always holds the latest-applied value regardless
        // of which patch ends up owning the byte range; only a rolled-back
        // (not-ready) patch's span is ever out of sync with it, via
        // `revision_slice_create`/`revision_slice_roll_forward`.
        {
            let bdesc = blocks.get_mut(block).unwrap();
            let start = offset as usize;
            bdesc.data_mut()[start..start + length as usize].copy_from_slice(&new_data);
        }

        if let Some(existing_id) = self.find_mergeable(blocks, block, owner, offset, length) {
            let block_data = blocks.get(block).unwrap().data().to_vec();
            if let Some(merged) = self.try_merge_byte(
                existing_id,
                &block_data,
                offset,
                length,
                &old_bytes,
                &new_data,
                pass_set,
            )? {
                return Ok(merged);
            }
        }

        let id = self.alloc(Patch {
            id: PatchId(0),
            owner: owner.id,
            level: owner.level,
            block: Some(block),
            kind: PatchKind::Byte {
                offset,
                length,
                new_bytes: new_data,
                old_bytes,
            },
            befores: Vec::new(),
            afters: Vec::new(),
            flags: PatchFlags::empty(),
            graph_index: owner.graph_index,
        });
        self.get_mut(id).unwrap().id = id;
        blocks.get_mut(block).unwrap().attach(owner.graph_index, id);
        for &before in pass_set {
            self.add_depend(id, before)?;
        }
        Ok(id)
    }

    /// Creates (or merges into an existing compatible patch) a bit-flip.
    pub fn create_bit(
        &mut self,
        blocks: &mut BlockTable,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        xor_mask: u32,
        pass_set: &[PatchId],
    ) -> Result<PatchId, FstitchError> {
        {
            let bdesc = blocks.get_mut(block).unwrap();
            let o = offset as usize * 4;
            let mut word = u32::from_le_bytes(bdesc.data()[o..o + 4].try_into().unwrap());
            word ^= xor_mask;
            bdesc.data_mut()[o..o + 4].copy_from_slice(&word.to_le_bytes());
        }

        if let Some(existing_id) = self.find_bit_mergeable(blocks, block, owner, offset) {
            let existing = self.get_mut(existing_id).unwrap();
            if let PatchKind::Bit { xor_mask: mask, .. } = &mut existing.kind {
                *mask ^= xor_mask;
            }
            for &before in pass_set {
                self.add_depend(existing_id, before)?;
            }
            return Ok(existing_id);
        }

        let id = self.alloc(Patch {
            id: PatchId(0),
            owner: owner.id,
            level: owner.level,
            block: Some(block),
            kind: PatchKind::Bit { offset, xor_mask },
            befores: Vec::new(),
            afters: Vec::new(),
            flags: PatchFlags::empty(),
            graph_index: owner.graph_index,
        });
        self.get_mut(id).unwrap().id = id;
        blocks.get_mut(block).unwrap().attach(owner.graph_index, id);
        for &before in pass_set {
            self.add_depend(id, before)?;
        }
        Ok(id)
    }

    /// `create_diff`: computes the minimal differing byte range and
    /// delegates to [`Self::create_byte`], or elides the patch entirely
    /// if `old` and `new` are identical.
    pub fn create_diff(
        &mut self,
        blocks: &mut BlockTable,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        old: &[u8],
        new: &[u8],
        pass_set: &[PatchId],
    ) -> Result<Option<PatchId>, FstitchError> {
        assert_eq!(old.len(), new.len());
        let first_diff = match old.iter().zip(new.iter()).position(|(a, b)| a != b) {
            Some(i) => i,
            None => return Ok(None),
        };
        let last_diff = old
            .iter()
            .zip(new.iter())
            .rposition(|(a, b)| a != b)
            .unwrap();
        let length = (last_diff - first_diff + 1) as u16;
        let sub_offset = offset + first_diff as u16;
        let id = self.create_byte(
            blocks,
            block,
            owner,
            sub_offset,
            length,
            new[first_diff..=last_diff].to_vec(),
            pass_set,
        )?;
        Ok(Some(id))
    }

    fn find_mergeable(
        &self,
        blocks: &BlockTable,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
        length: u16,
    ) -> Option<PatchId> {
        let bdesc = blocks.get(block)?;
        bdesc
            .patches_for(owner.graph_index)
            .iter()
            .copied()
            .find(|&id| {
                self.get(id).map_or(false, |p| {
                    !p.is_inflight()
                        && matches!(p.kind, PatchKind::Byte { .. })
                        && p.overlaps_byte_range(offset, length)
                })
            })
    }

    fn find_bit_mergeable(
        &self,
        blocks: &BlockTable,
        block: BlockId,
        owner: PatchOwner,
        offset: u16,
    ) -> Option<PatchId> {
        let bdesc = blocks.get(block)?;
        bdesc
            .patches_for(owner.graph_index)
            .iter()
            .copied()
            .find(|&id| {
                self.get(id).map_or(false, |p| {
                    !p.is_inflight()
                        && matches!(p.kind, PatchKind::Bit { offset: o, .. } if o == offset)
                })
            })
    }

    /// Attempts to merge a new byte write into `existing_id`. Returns
    /// `Ok(None)` (never merges, always creates a fresh patch) if folding
    /// in `pass_set` would introduce a cycle — merging is an optimization,
    /// never a correctness requirement. Byte ranges need not be
    /// identical or even touching: the combined range spans both, and any
    /// gap between them is filled from the block's current buffer (a byte
    /// neither patch touches has no diff there, so old == new == current
    /// for that sub-range). Where the two ranges do overlap, the
    /// chronologically earlier (`existing`) patch wins for `old_bytes`
    /// (it captured the truer original pre-image) and the chronologically
    /// later (`new`) one wins for `new_bytes`.
    fn try_merge_byte(
        &mut self,
        existing_id: PatchId,
        block_data: &[u8],
        new_offset: u16,
        new_length: u16,
        new_old_bytes: &[u8],
        new_new_bytes: &[u8],
        pass_set: &[PatchId],
    ) -> Result<Option<PatchId>, FstitchError> {
        for &before in pass_set {
            if self.would_cycle(existing_id, before) {
                return Ok(None);
            }
        }

        let (ex_offset, ex_length) = match self.get(existing_id).unwrap().kind {
            PatchKind::Byte { offset, length, .. } => (offset, length),
            _ => return Ok(None),
        };

        let combined_start = ex_offset.min(new_offset);
        let combined_end =
            (ex_offset as u32 + ex_length as u32).max(new_offset as u32 + new_length as u32);
        let combined_len = (combined_end - combined_start as u32) as usize;

        let base = combined_start as usize;
        let mut old_buf = block_data[base..base + combined_len].to_vec();
        let mut new_buf = old_buf.clone();

        let new_rel = (new_offset - combined_start) as usize;
        old_buf[new_rel..new_rel + new_length as usize].copy_from_slice(new_old_bytes);
        if let PatchKind::Byte {
            old_bytes: ex_old, ..
        } = &self.get(existing_id).unwrap().kind
        {
            let ex_rel = (ex_offset - combined_start) as usize;
            old_buf[ex_rel..ex_rel + ex_length as usize].copy_from_slice(ex_old);
        }

        if let PatchKind::Byte {
            new_bytes: ex_new, ..
        } = &self.get(existing_id).unwrap().kind
        {
            let ex_rel = (ex_offset - combined_start) as usize;
            new_buf[ex_rel..ex_rel + ex_length as usize].copy_from_slice(ex_new);
        }
        new_buf[new_rel..new_rel + new_length as usize].copy_from_slice(new_new_bytes);

        let patch = self.get_mut(existing_id).unwrap();
        patch.kind = PatchKind::Byte {
            offset: combined_start,
            length: combined_len as u16,
            new_bytes: new_buf,
            old_bytes: old_buf,
        };

        for &before in pass_set {
            self.add_depend(existing_id, before)?;
        }

        Ok(Some(existing_id))
    }

    /// `push_down`: reassigns ownership (and graph_index/level) of every
    /// patch on `block` owned by `from` to `to`. O(k) where k is the
    /// number of patches `from` owns on that block, because it walks only
    /// `index_patches[from.graph_index]`.
    pub fn push_down(
        &mut self,
        blocks: &mut BlockTable,
        block: BlockId,
        from: PatchOwner,
        to: PatchOwner,
    ) -> Vec<PatchId> {
        let moved = match blocks.get_mut(block) {
            Some(bdesc) => bdesc.splice_index(from.graph_index, to.graph_index),
            None => return Vec::new(),
        };
        for &id in &moved {
            if let Some(p) = self.get_mut(id) {
                p.owner = to.id;
                p.level = to.level;
                p.graph_index = to.graph_index;
            }
        }
        moved
    }

    /// Like [`Self::push_down`] but moves only the named subset of
    /// `from`'s patches on `block`, leaving the rest in place. Used by a
    /// cache's partial flush, where only the revision slice's `ready`
    /// patches move to the next level and the `not_ready` ones stay
    /// behind until their own befores clear.
    pub fn push_down_ids(
        &mut self,
        blocks: &mut BlockTable,
        block: BlockId,
        from: PatchOwner,
        to: PatchOwner,
        ids: &[PatchId],
    ) -> Vec<PatchId> {
        let bdesc = match blocks.get_mut(block) {
            Some(b) => b,
            None => return Vec::new(),
        };
        let mut moved = Vec::new();
        for &id in ids {
            bdesc.detach(from.graph_index, id);
            bdesc.attach(to.graph_index, id);
            moved.push(id);
        }
        for &id in &moved {
            if let Some(p) = self.get_mut(id) {
                p.owner = to.id;
                p.level = to.level;
                p.graph_index = to.graph_index;
            }
        }
        moved
    }

    /// Marks `id` `INFLIGHT`. Inflight patches are immutable: no further
    /// merges, splits, or new befores may be added.
    pub fn mark_inflight(&mut self, id: PatchId) {
        if let Some(p) = self.get_mut(id) {
            p.flags.insert(PatchFlags::INFLIGHT);
        }
    }

    pub fn clear_inflight(&mut self, id: PatchId) {
        if let Some(p) = self.get_mut(id) {
            p.flags.remove(PatchFlags::INFLIGHT);
        }
    }

    pub fn mark_rolled_back(&mut self, id: PatchId, rolled_back: bool) {
        if let Some(p) = self.get_mut(id) {
            p.flags.set(PatchFlags::ROLLED_BACK, rolled_back);
        }
    }

    pub fn set_no_patchgroup(&mut self, id: PatchId) {
        if let Some(p) = self.get_mut(id) {
            p.flags.insert(PatchFlags::NO_PATCHGROUP);
        }
    }

    /// True iff every before of `id` is already satisfied (removed) or
    /// inflight. Does not itself look at ownership/level; callers
    /// building a revision slice filter by level/owner separately.
    ///
    /// A before that is itself a befores-less `Empty` (a patchgroup
    /// head/tail, a BD write-head anchor, a resizer join patch) is
    /// treated as settled even when it is not inflight: nothing ever
    /// writes such an anchor to a device, so waiting for it to go
    /// inflight would block forever.
    pub fn is_ready(&self, id: PatchId) -> bool {
        match self.get(id) {
            Some(p) => p.befores.iter().all(|&b| self.before_is_settled(b)),
            None => true,
        }
    }

    fn before_is_settled(&self, id: PatchId) -> bool {
        match self.get(id) {
            Some(p) => p.is_inflight() || (matches!(p.kind, PatchKind::Empty) && p.befores.is_empty()),
            None => true,
        }
    }

    /// Satisfies a patch: drops the before-edge from every after, drops
    /// `id`'s own before-edges (so an anchor `id` depended on loses `id`
    /// from its `afters` instead of carrying a dangling reference), and
    /// frees `id`. Returns the afters that became newly eligible (zero
    /// remaining befores and not inflight) so the caller can recurse into
    /// `Empty` garbage collection or schedule further flushes. Befores
    /// that turn into dead empties (no befores, no afters left) as a
    /// result are collected immediately rather than left for the caller
    /// to notice, since nothing but this unlink ever drops their last
    /// after.
    pub fn satisfy(&mut self, blocks: &mut BlockTable, id: PatchId) -> Vec<PatchId> {
        let afters = self.get(id).map(|p| p.afters.clone()).unwrap_or_default();
        let befores = self.get(id).map(|p| p.befores.clone()).unwrap_or_default();
        let mut newly_eligible = Vec::new();
        for after in &afters {
            self.remove_edge(*after, id);
            if let Some(ap) = self.get(*after) {
                if ap.befores.is_empty() && !ap.is_inflight() {
                    newly_eligible.push(*after);
                }
            }
        }
        for before in &befores {
            self.remove_edge(id, *before);
            self.collect_dead_empty(blocks, *before);
        }
        self.free(blocks, id);
        newly_eligible
    }

    /// Garbage-collects an `Empty` patch with zero befores and zero
    /// afters (created as a dead barrier, or drained down to one by
    /// satisfaction of its last dependent).
    pub fn collect_dead_empty(&mut self, blocks: &mut BlockTable, id: PatchId) -> bool {
        let dead = self.get(id).map_or(false, |p| {
            matches!(p.kind, PatchKind::Empty) && p.befores.is_empty() && p.afters.is_empty()
        });
        if dead {
            self.free(blocks, id);
        }
        dead
    }

    /// Replaces `old` with `replacement` in the graph: `replacement`
    /// inherits `old`'s befores, `old`'s afters are redirected onto
    /// `replacement`, and `old` is freed without being satisfied. Used by
    /// `block_resizer_bd` to retire a byte patch that straddles a
    /// lower-block boundary behind the empty join patch that replaces it,
    /// so patches depending on the original keep seeing the same order
    /// even though the original itself never reaches disk.
    pub fn retire(
        &mut self,
        blocks: &mut BlockTable,
        old: PatchId,
        replacement: PatchId,
    ) -> Result<(), FstitchError> {
        let (befores, afters) = match self.get(old) {
            Some(p) => (p.befores.clone(), p.afters.clone()),
            None => return Ok(()),
        };
        for before in befores {
            self.install_edge(replacement, before);
        }
        for after in afters {
            self.remove_edge(after, old);
            self.install_edge(after, replacement);
        }
        self.free(blocks, old);
        Ok(())
    }

    pub fn exists(&self, id: PatchId) -> bool {
        self.get(id).is_some()
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

impl Default for PatchGraph {
    fn default() -> Self {
        Self::new()
    }
}
