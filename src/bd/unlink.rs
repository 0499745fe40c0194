//! `unlink_bd` (§4.5.4): severs every dependency edge leaving a passing
//! patch except intra-block edges and the configured write-head edge.
//! Used below layers whose correctness depends only on same-block
//! ordering (the canonical case is the personality's own unlink/rename
//! bookkeeping, which the spec names but does not define further).

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::FstitchResult;
use crate::patch::{PatchId, PatchOwner};

pub struct UnlinkBd {
    header: BdHeader,
    child: Box<dyn BlockDevice>,
    write_head: Option<PatchId>,
}

impl UnlinkBd {
    pub fn new(mut header: BdHeader, child: Box<dyn BlockDevice>) -> Self {
        header.level = child.header().level + 1;
        header.graph_index = child.header().graph_index + 1;
        header.numblocks = child.header().numblocks;
        header.blocksize = child.header().blocksize;
        header.atomicsize = child.header().atomicsize;
        Self {
            header,
            child,
            write_head: None,
        }
    }

    pub fn set_write_head(&mut self, head: Option<PatchId>) {
        self.write_head = head;
    }

    fn owner(&self) -> PatchOwner {
        self.header.owner()
    }
}

impl BlockDevice for UnlinkBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        self.child.read_block(state, block_no)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        self.child.synthetic_read_block(state, block_no)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        let graph_index = self.header.graph_index;
        let write_head = self.write_head;
        let same_block: Vec<PatchId> = state
            .blocks
            .get(block)
            .map(|b| b.patches_for(graph_index).to_vec())
            .unwrap_or_default();

        for &id in &same_block {
            state.patches.prune_befores(id, |before| {
                Some(before) == write_head || same_block.contains(&before)
            });
            state.patches.set_no_patchgroup(id);
        }

        state
            .patches
            .push_down(state.blocks, block, self.owner(), self.child.header().owner());
        self.child.write_block(state, block, block_no)
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        self.child.flush(state, target)
    }

    fn get_write_head(&self) -> Option<PatchId> {
        self.write_head
    }

    fn get_block_space(&self) -> i32 {
        self.child.get_block_space()
    }
}
