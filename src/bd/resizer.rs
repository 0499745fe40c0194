//! `block_resizer_bd` (§4.5.2): converts between an upper block size and
//! a lower one, where the upper size is a multiple of the lower. A byte
//! patch that straddles a lower-block boundary is split into one
//! sub-patch per lower block; the original is retired behind a fresh
//! empty join patch (see [`PatchGraph::retire`]) so the patches that
//! depended on it keep seeing the same order.

use std::collections::HashMap;

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::{PatchId, PatchKind, PatchOwner};

pub struct BlockResizerBd {
    header: BdHeader,
    child: Box<dyn BlockDevice>,
    ratio: u32,
    /// Composite upper-block images, since they don't correspond
    /// one-to-one with any single lower block descriptor.
    composite: HashMap<u32, BlockId>,
}

impl BlockResizerBd {
    pub fn new(mut header: BdHeader, child: Box<dyn BlockDevice>) -> Self {
        let lower_size = child.header().blocksize as u32;
        assert!(header.blocksize as u32 % lower_size == 0, "upper block size must be a multiple of the lower");
        let ratio = header.blocksize as u32 / lower_size;
        header.level = child.header().level + 1;
        header.graph_index = child.header().graph_index + 1;
        header.numblocks = child.header().numblocks / ratio;
        header.atomicsize = child.header().atomicsize;
        Self {
            header,
            child,
            ratio,
            composite: HashMap::new(),
        }
    }

    fn lower_range(&self, block_no: u32) -> std::ops::Range<u32> {
        let first = block_no * self.ratio;
        first..first + self.ratio
    }

    fn lower_blocksize(&self) -> u32 {
        self.child.header().blocksize as u32
    }
}

impl BlockDevice for BlockResizerBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        if let Some(&id) = self.composite.get(&block_no) {
            return Ok(id);
        }
        let composite = state.blocks.alloc(block_no, self.header.blocksize);
        for (i, lower_no) in self.lower_range(block_no).enumerate() {
            let lower = self.child.read_block(state, lower_no)?;
            let lower_data = state.blocks.get(lower).unwrap().data().to_vec();
            let dst = state.blocks.get_mut(composite).unwrap().data_mut();
            let start = i * self.lower_blocksize() as usize;
            dst[start..start + lower_data.len()].copy_from_slice(&lower_data);
        }
        self.composite.insert(block_no, composite);
        Ok(composite)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        self.read_block(state, block_no)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        let graph_index = self.header.graph_index;
        let lower_size = self.lower_blocksize();
        let owned: Vec<PatchId> = state
            .blocks
            .get(block)
            .map(|b| b.patches_for(graph_index).to_vec())
            .unwrap_or_default();

        for id in owned {
            let kind = state.patches.get(id).map(|p| p.kind().clone());
            let (offset, length, new_bytes, old_bytes) = match kind {
                Some(PatchKind::Byte {
                    offset,
                    length,
                    new_bytes,
                    old_bytes,
                }) => (offset, length, new_bytes, old_bytes),
                _ => continue,
            };

            let first_lower = offset as u32 / lower_size;
            let last_lower = (offset as u32 + length as u32 - 1) / lower_size;
            if first_lower == last_lower {
                // Entirely within one lower block: translate offset and
                // push straight down, no split needed.
                let lower_no = self.lower_range(block_no).nth(first_lower as usize).unwrap();
                let lower_block = self.child.read_block(state, lower_no)?;
                let owner = PatchOwner {
                    id: self.child.header().id,
                    level: self.child.header().level,
                    graph_index: self.child.header().graph_index,
                };
                let local_offset = offset as u32 - first_lower * lower_size;
                let replacement = state.patches.create_byte(
                    state.blocks,
                    lower_block,
                    owner,
                    local_offset as u16,
                    length,
                    new_bytes,
                    &[],
                )?;
                state.patches.retire(state.blocks, id, replacement)?;
                self.child.write_block(state, lower_block, lower_no)?;
                continue;
            }

            // Sub-patches are owned at the (lower, closer-to-disk) child
            // level, so they are created first, each depending on
            // nothing new of its own; the join patch is created
            // afterward, at the resizer's own level, depending on all of
            // them — that is the only direction `add_depend`'s level
            // check allows, since a patch may only depend on something
            // at or below its own level. `retire` then transplants `id`'s
            // original edges onto `join` (same level as `id`, so no
            // level-check concern there either).
            let child_owner = PatchOwner {
                id: self.child.header().id,
                level: self.child.header().level,
                graph_index: self.child.header().graph_index,
            };
            let mut sub_ids = Vec::new();
            for lower_idx in first_lower..=last_lower {
                let lower_no = self.lower_range(block_no).nth((lower_idx - first_lower) as usize).unwrap();
                let seg_start = (lower_idx * lower_size).max(offset as u32);
                let seg_end = ((lower_idx + 1) * lower_size).min(offset as u32 + length as u32);
                let rel = (seg_start - offset as u32) as usize;
                let seg_len = (seg_end - seg_start) as usize;
                let lower_block = self.child.read_block(state, lower_no)?;
                let sub_id = state.patches.create_byte(
                    state.blocks,
                    lower_block,
                    child_owner,
                    (seg_start - lower_idx * lower_size) as u16,
                    seg_len as u16,
                    new_bytes[rel..rel + seg_len].to_vec(),
                    &[],
                )?;
                sub_ids.push(sub_id);
                self.child.write_block(state, lower_block, lower_no)?;
            }
            let join = state.patches.create_empty(state.blocks, self.header.owner(), &sub_ids)?;
            state.patches.retire(state.blocks, id, join)?;
            let _ = old_bytes;
        }
        Ok(())
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        match target {
            FlushTarget::Device => self.child.flush(state, FlushTarget::Device),
            FlushTarget::Block(block) => {
                let block_no = state
                    .blocks
                    .get(block)
                    .ok_or(FstitchError::InvariantViolation {
                        reason: "flush on unknown block".into(),
                    })?
                    .block_no();
                let mut worst = FlushProgress::EMPTY;
                for lower_no in self.lower_range(block_no) {
                    let lower = self.child.read_block(state, lower_no)?;
                    worst = worst.worst_of(self.child.flush(state, FlushTarget::Block(lower))?);
                }
                Ok(worst)
            }
        }
    }

    fn get_write_head(&self) -> Option<PatchId> {
        self.child.get_write_head()
    }

    fn get_block_space(&self) -> i32 {
        self.child.get_block_space()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::memory::MemoryBd;
    use crate::bd::BdId;
    use crate::block::BlockTable;
    use crate::patch::PatchGraph;
    use crate::scheduler::Scheduler;

    fn resizer(upper_blocksize: u16) -> (Scheduler, BlockResizerBd) {
        let mut scheduler = Scheduler::new();
        let lower = MemoryBd::new(BdId(0), 8, 4, scheduler.landing_handle());
        let header = BdHeader {
            id: BdId(1),
            level: 0,
            graph_index: 0,
            numblocks: 0,
            blocksize: upper_blocksize,
            atomicsize: 0,
        };
        (scheduler, BlockResizerBd::new(header, Box::new(lower)))
    }

    #[test]
    fn read_composes_the_upper_block_from_its_lower_blocks() {
        let (mut scheduler, mut rz) = resizer(8);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);

        let lower0 = rz.child.read_block(&mut state, 0).unwrap();
        let owner = PatchOwner {
            id: rz.child.header().id,
            level: rz.child.header().level,
            graph_index: rz.child.header().graph_index,
        };
        state.patches.create_byte(state.blocks, lower0, owner, 0, 4, b"AAAA".to_vec(), &[]).unwrap();
        let lower1 = rz.child.read_block(&mut state, 1).unwrap();
        state.patches.create_byte(state.blocks, lower1, owner, 0, 4, b"BBBB".to_vec(), &[]).unwrap();

        let upper = rz.read_block(&mut state, 0).unwrap();
        assert_eq!(&state.blocks.get(upper).unwrap().data()[0..8], b"AAAABBBB");
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn a_write_confined_to_one_lower_block_needs_no_split() {
        let (mut scheduler, mut rz) = resizer(8);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = rz.header().owner();

        let upper = rz.read_block(&mut state, 0).unwrap();
        let patch = state.patches.create_byte(state.blocks, upper, owner, 0, 2, b"XX".to_vec(), &[]).unwrap();
        rz.write_block(&mut state, upper, 0).unwrap();

        // The original patch was retired in favor of a replacement pushed
        // down to the lower device; it no longer exists under its own id.
        assert!(!state.patches.exists(patch));
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn a_straddling_write_splits_into_one_sub_patch_per_lower_block() {
        let (mut scheduler, mut rz) = resizer(8);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = rz.header().owner();

        let upper = rz.read_block(&mut state, 0).unwrap();
        let patch = state
            .patches
            .create_byte(state.blocks, upper, owner, 2, 4, b"ZZZZ".to_vec(), &[])
            .unwrap();
        rz.write_block(&mut state, upper, 0).unwrap();
        assert!(!state.patches.exists(patch), "the straddling patch was retired behind a join patch");
        scheduler.tick(&mut patches, &mut blocks);

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let reread = rz.read_block(&mut state, 0).unwrap();
        assert_eq!(&state.blocks.get(reread).unwrap().data()[2..6], b"ZZZZ");
    }
}
