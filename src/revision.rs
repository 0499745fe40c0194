//! Revision slices (C4): partitioning a block's patches into what can be
//! flushed right now and what must wait, and rolling the in-memory
//! buffer across that partition.

use crate::bd::BdHeader;
use crate::block::{BlockId, BlockTable};
use crate::patch::{Patch, PatchGraph, PatchId, PatchKind};

/// How rollback materializes the "not ready" patches' pre-image.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum RevisionMode {
    /// Mutate the block buffer in place; forward-roll restores it.
    InPlace,
    /// Leave the live buffer untouched; build a scratch copy with
    /// `old_bytes` applied instead. No forward-roll is needed.
    Copy,
}

/// `{owner_bd, target_bd, ready[], all_ready}` from §3: which patches on
/// a block are eligible to move from `owner` to `target` right now.
pub struct RevisionSlice {
    pub ready: Vec<PatchId>,
    pub not_ready: Vec<PatchId>,
    pub all_ready: bool,
    /// Only populated in [`RevisionMode::Copy`] mode: the pre-image
    /// buffer with `not_ready` patches rolled back, for callers that
    /// write a scratch copy downward instead of mutating in place.
    pub scratch: Option<Vec<u8>>,
}

fn apply_patch_forward(buf: &mut [u8], patch: &Patch) {
    match patch.kind() {
        PatchKind::Byte {
            offset, new_bytes, ..
        } => {
            let o = *offset as usize;
            buf[o..o + new_bytes.len()].copy_from_slice(new_bytes);
        }
        PatchKind::Bit { offset, xor_mask } => {
            let o = *offset as usize * 4;
            let mut word = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
            word ^= xor_mask;
            buf[o..o + 4].copy_from_slice(&word.to_le_bytes());
        }
        PatchKind::Empty => {}
    }
}

fn apply_patch_backward(buf: &mut [u8], patch: &Patch) {
    match patch.kind() {
        PatchKind::Byte {
            offset, old_bytes, ..
        } => {
            let o = *offset as usize;
            buf[o..o + old_bytes.len()].copy_from_slice(old_bytes);
        }
        PatchKind::Bit { offset, xor_mask } => {
            let o = *offset as usize * 4;
            let mut word = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
            word ^= xor_mask;
            buf[o..o + 4].copy_from_slice(&word.to_le_bytes());
        }
        PatchKind::Empty => {}
    }
}

/// Builds the revision slice for `block` at `owner`, rolling back every
/// not-ready patch per `mode`. Does not push anything down; the caller
/// does that with [`PatchGraph::push_down`] once it has decided to act
/// on the slice.
pub fn revision_slice_create(
    patches: &PatchGraph,
    blocks: &mut BlockTable,
    block: BlockId,
    owner: &BdHeader,
    mode: RevisionMode,
) -> RevisionSlice {
    let ids: Vec<PatchId> = blocks
        .get(block)
        .map(|b| b.patches_for(owner.graph_index).to_vec())
        .unwrap_or_default();

    let mut ready = Vec::new();
    let mut not_ready = Vec::new();
    for id in ids {
        if patches.is_ready(id) {
            ready.push(id);
        } else {
            not_ready.push(id);
        }
    }

    let scratch = match mode {
        RevisionMode::InPlace => {
            if let Some(bdesc) = blocks.get_mut(block) {
                for id in &not_ready {
                    if let Some(p) = patches.get(*id) {
                        apply_patch_backward(bdesc.data_mut(), p);
                    }
                }
            }
            None
        }
        RevisionMode::Copy => blocks.get(block).map(|bdesc| {
            let mut buf = bdesc.data().to_vec();
            for id in &not_ready {
                if let Some(p) = patches.get(*id) {
                    apply_patch_backward(&mut buf, p);
                }
            }
            buf
        }),
    };

    RevisionSlice {
        all_ready: not_ready.is_empty(),
        ready,
        not_ready,
        scratch,
    }
}

/// Rolls every not-ready patch forward again (in-place mode only; a
/// no-op under copy mode, which never mutated the live buffer).
pub fn revision_slice_roll_forward(
    patches: &PatchGraph,
    blocks: &mut BlockTable,
    block: BlockId,
    slice: &RevisionSlice,
    mode: RevisionMode,
) {
    if mode != RevisionMode::InPlace {
        return;
    }
    if let Some(bdesc) = blocks.get_mut(block) {
        for id in &slice.not_ready {
            if let Some(p) = patches.get(*id) {
                apply_patch_forward(bdesc.data_mut(), p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::BdId;
    use crate::patch::PatchOwner;

    fn header() -> BdHeader {
        BdHeader {
            id: BdId(0),
            level: 0,
            graph_index: 0,
            numblocks: 16,
            blocksize: 64,
            atomicsize: 64,
        }
    }

    #[test]
    fn not_ready_patch_rolls_back_and_forward_losslessly() {
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let block = blocks.alloc(3, 64);
        let owner = PatchOwner {
            id: BdId(0),
            level: 0,
            graph_index: 0,
        };
        let blocker = patches
            .create_byte(&mut blocks, block, owner, 8, 1, vec![7], &[])
            .unwrap();
        let not_ready = patches
            .create_byte(&mut blocks, block, owner, 0, 4, b"AAAA".to_vec(), &[blocker])
            .unwrap();

        let before = blocks.get(block).unwrap().data().to_vec();
        let slice = revision_slice_create(&patches, &mut blocks, block, &header(), RevisionMode::InPlace);
        assert!(!slice.all_ready);
        assert_eq!(slice.not_ready, vec![not_ready]);
        assert_ne!(blocks.get(block).unwrap().data(), &before[..]);

        revision_slice_roll_forward(&patches, &mut blocks, block, &slice, RevisionMode::InPlace);
        assert_eq!(blocks.get(block).unwrap().data(), &before[..]);
    }

    #[test]
    fn copy_mode_leaves_live_buffer_untouched() {
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let block = blocks.alloc(3, 64);
        let owner = PatchOwner {
            id: BdId(0),
            level: 0,
            graph_index: 0,
        };
        let blocker = patches
            .create_byte(&mut blocks, block, owner, 8, 1, vec![7], &[])
            .unwrap();
        patches
            .create_byte(&mut blocks, block, owner, 0, 4, b"AAAA".to_vec(), &[blocker])
            .unwrap();

        let live_before = blocks.get(block).unwrap().data().to_vec();
        let slice = revision_slice_create(&patches, &mut blocks, block, &header(), RevisionMode::Copy);
        assert_eq!(blocks.get(block).unwrap().data(), &live_before[..]);
        assert!(slice.scratch.is_some());
    }
}
