//! `md_bd` (§4.5.5): splits block space across two devices by parity of
//! block number. A write is never duplicated — the mirror dispatches to
//! whichever child owns that block's parity, it does not keep two copies
//! of the same block. (A redundancy-style mirror, which *would* copy, is
//! out of scope; the spec describes dispatch-by-parity only.)

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchId;

pub struct MirrorBd {
    header: BdHeader,
    even: Box<dyn BlockDevice>,
    odd: Box<dyn BlockDevice>,
}

impl MirrorBd {
    pub fn new(mut header: BdHeader, even: Box<dyn BlockDevice>, odd: Box<dyn BlockDevice>) -> Self {
        header.level = even.header().level.max(odd.header().level) + 1;
        header.numblocks = even.header().numblocks + odd.header().numblocks;
        header.blocksize = even.header().blocksize;
        header.atomicsize = even.header().atomicsize.min(odd.header().atomicsize);
        Self { header, even, odd }
    }

    fn route(&self, block_no: u32) -> (bool, u32) {
        (block_no % 2 == 0, block_no / 2)
    }

    fn child(&mut self, is_even: bool) -> &mut Box<dyn BlockDevice> {
        if is_even {
            &mut self.even
        } else {
            &mut self.odd
        }
    }
}

impl BlockDevice for MirrorBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        let (is_even, child_no) = self.route(block_no);
        self.child(is_even).read_block(state, child_no)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        let (is_even, child_no) = self.route(block_no);
        self.child(is_even).synthetic_read_block(state, child_no)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        let (is_even, child_no) = self.route(block_no);
        let from = self.header.owner();
        let to = self.child(is_even).header().owner();
        state.patches.push_down(state.blocks, block, from, to);
        self.child(is_even).write_block(state, block, child_no)
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        match target {
            FlushTarget::Device => {
                let a = self.even.flush(state, FlushTarget::Device)?;
                let b = self.odd.flush(state, FlushTarget::Device)?;
                Ok(a.worst_of(b))
            }
            FlushTarget::Block(block) => {
                let block_no = state
                    .blocks
                    .get(block)
                    .ok_or(FstitchError::InvariantViolation {
                        reason: "flush on unknown block".into(),
                    })?
                    .block_no();
                let (is_even, _) = self.route(block_no);
                self.child(is_even).flush(state, target)
            }
        }
    }

    fn get_write_head(&self) -> Option<PatchId> {
        None
    }

    /// Open question in the spec: `mirror_bd` never correctly composed
    /// two children's block space in the original. `min` of the two is
    /// the conservative, sensible answer the spec settles on.
    fn get_block_space(&self) -> i32 {
        self.even.get_block_space().min(self.odd.get_block_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::memory::MemoryBd;
    use crate::bd::BdId;
    use crate::block::BlockTable;
    use crate::patch::{PatchGraph, PatchOwner};
    use crate::scheduler::Scheduler;

    fn mirror() -> (Scheduler, MirrorBd) {
        let mut scheduler = Scheduler::new();
        let even = MemoryBd::new(BdId(0), 4, 8, scheduler.landing_handle());
        let odd = MemoryBd::new(BdId(1), 4, 8, scheduler.landing_handle());
        let header = BdHeader {
            id: BdId(2),
            level: 0,
            graph_index: 0,
            numblocks: 0,
            blocksize: 0,
            atomicsize: 0,
        };
        (scheduler, MirrorBd::new(header, Box::new(even), Box::new(odd)))
    }

    #[test]
    fn even_and_odd_block_numbers_route_to_distinct_children() {
        let (mut scheduler, mut md) = mirror();
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = PatchOwner {
            id: md.header().id,
            level: md.header().level,
            graph_index: md.header().graph_index,
        };

        let even_block = md.read_block(&mut state, 4).unwrap();
        state.patches.create_byte(state.blocks, even_block, owner, 0, 4, b"EVEN".to_vec(), &[]).unwrap();
        md.write_block(&mut state, even_block, 4).unwrap();

        let odd_block = md.read_block(&mut state, 5).unwrap();
        state.patches.create_byte(state.blocks, odd_block, owner, 0, 3, b"ODD".to_vec(), &[]).unwrap();
        md.write_block(&mut state, odd_block, 5).unwrap();

        assert_ne!(even_block, odd_block);
        scheduler.tick(&mut patches, &mut blocks);

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let reread_even = md.read_block(&mut state, 4).unwrap();
        let reread_odd = md.read_block(&mut state, 5).unwrap();
        assert_eq!(&state.blocks.get(reread_even).unwrap().data()[0..4], b"EVEN");
        assert_eq!(&state.blocks.get(reread_odd).unwrap().data()[0..3], b"ODD");
    }

    #[test]
    fn block_space_is_the_minimum_of_both_children() {
        let (_scheduler, md) = mirror();
        assert_eq!(md.get_block_space(), md.even.get_block_space().min(md.odd.get_block_space()));
    }
}
