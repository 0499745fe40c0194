//! Block descriptors (C2): in-memory images of disk blocks, plus the
//! per-BD-graph-index patch sublists attached to them.

use std::collections::HashMap;

use crate::patch::PatchId;

/// Stable index of a block descriptor inside a [`BlockTable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlockId(pub(crate) u32);

/// In-memory image of one disk block, plus the patches attached to it at
/// every BD level that currently has a stake in it. A single descriptor
/// can be shared by several BD levels (a pass-through module like
/// `partition_bd` does not create a new descriptor); `index_patches` is
/// keyed by `graph_index` so each level's sublist is found in O(1)
/// without scanning patches belonging to other levels.
pub struct BlockDescriptor {
    id: BlockId,
    block_no: u32,
    length: u16,
    data: Vec<u8>,
    /// True if this descriptor's content was synthesized by
    /// `synthetic_read_block` rather than read from storage. Cleared by
    /// a real read, or implicitly once the block is fully overwritten.
    synthetic: bool,
    refcount: u32,
    index_patches: HashMap<u16, Vec<PatchId>>,
}

impl BlockDescriptor {
    pub fn id(&self) -> BlockId {
        self.id
    }
    pub fn block_no(&self) -> u32 {
        self.block_no
    }
    pub fn length(&self) -> u16 {
        self.length
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
    pub fn set_synthetic(&mut self, synthetic: bool) {
        self.synthetic = synthetic;
    }
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
    pub fn inc_ref(&mut self) {
        self.refcount += 1;
    }
    pub fn dec_ref(&mut self) -> u32 {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }

    /// The sublist of patches on this block owned by the BD at
    /// `graph_index`.
    pub fn patches_for(&self, graph_index: u16) -> &[PatchId] {
        self.index_patches
            .get(&graph_index)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn attach(&mut self, graph_index: u16, id: PatchId) {
        self.index_patches.entry(graph_index).or_default().push(id);
    }

    pub fn detach(&mut self, graph_index: u16, id: PatchId) {
        if let Some(list) = self.index_patches.get_mut(&graph_index) {
            list.retain(|&x| x != id);
        }
    }

    /// Moves every patch id from `list[from]` to `list[to]`, preserving
    /// order, for `push_down`.
    pub fn splice_index(&mut self, from: u16, to: u16) -> Vec<PatchId> {
        let moved = self.index_patches.remove(&from).unwrap_or_default();
        if !moved.is_empty() {
            self.index_patches
                .entry(to)
                .or_default()
                .extend(moved.iter().copied());
        }
        moved
    }
}

/// The arena of every live block descriptor. One `BlockTable` is shared
/// by the whole engine; per-device lookup by block number is the job of
/// [`crate::block_manager::BlockManager`], which maps `block_no ->
/// BlockId` for one device at a time.
pub struct BlockTable {
    slots: Vec<Option<BlockDescriptor>>,
    free: Vec<u32>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// `bdesc_alloc`: allocates a zero-refcount descriptor. Callers that
    /// want pool-scoped lifetime should immediately hand the id to the
    /// scheduler's autorelease pool (`bdesc_autorelease`).
    pub fn alloc(&mut self, block_no: u32, length: u16) -> BlockId {
        let bdesc = BlockDescriptor {
            id: BlockId(0),
            block_no,
            length,
            data: vec![0u8; length as usize],
            synthetic: false,
            refcount: 0,
            index_patches: HashMap::new(),
        };
        let id = if let Some(slot) = self.free.pop() {
            BlockId(slot)
        } else {
            let id = BlockId(self.slots.len() as u32);
            self.slots.push(None);
            id
        };
        let mut bdesc = bdesc;
        bdesc.id = id;
        self.slots[id.0 as usize] = Some(bdesc);
        id
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockDescriptor> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut BlockDescriptor> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Frees a descriptor's slot. Called by the autorelease pool once
    /// `refcount` reaches zero and no patches remain attached.
    pub fn free(&mut self, id: BlockId) {
        if self.slots.get(id.0 as usize).map_or(false, |s| s.is_some()) {
            self.slots[id.0 as usize] = None;
            self.free.push(id.0);
        }
    }

    pub fn has_any_patches(&self, id: BlockId) -> bool {
        self.get(id)
            .map(|b| b.index_patches.values().any(|v| !v.is_empty()))
            .unwrap_or(false)
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}
