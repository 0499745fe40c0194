//! `partition_bd` (§4.5.3): pure offset translation over a child device.
//! Passes patches through unchanged except that `graph_index` is
//! incremented, per spec.

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchId;

pub struct PartitionBd {
    header: BdHeader,
    child: Box<dyn BlockDevice>,
    /// First block of the partition, in the child's numbering.
    start_block: u32,
}

impl PartitionBd {
    pub fn new(mut header: BdHeader, child: Box<dyn BlockDevice>, start_block: u32, numblocks: u32) -> Self {
        header.level = child.header().level + 1;
        header.graph_index = child.header().graph_index + 1;
        header.numblocks = numblocks;
        header.blocksize = child.header().blocksize;
        header.atomicsize = child.header().atomicsize;
        let end = start_block as u64 + numblocks as u64;
        assert!(
            end <= child.header().numblocks as u64,
            "partition [{}, {}) does not fit inside child of {} blocks",
            start_block,
            end,
            child.header().numblocks
        );
        Self {
            header,
            child,
            start_block,
        }
    }

    fn translate(&self, block_no: u32) -> FstitchResult<u32> {
        if block_no >= self.header.numblocks {
            return Err(FstitchError::InvariantViolation {
                reason: format!("block {} out of partition bounds ({})", block_no, self.header.numblocks),
            });
        }
        Ok(self.start_block + block_no)
    }
}

impl BlockDevice for PartitionBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        let child_no = self.translate(block_no)?;
        self.child.read_block(state, child_no)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        let child_no = self.translate(block_no)?;
        self.child.synthetic_read_block(state, child_no)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        let child_no = self.translate(block_no)?;
        let from = self.header.graph_index;
        let to = self.child.header().graph_index;
        state.patches.push_down(
            state.blocks,
            block,
            crate::patch::PatchOwner {
                id: self.header.id,
                level: self.header.level,
                graph_index: from,
            },
            crate::patch::PatchOwner {
                id: self.child.header().id,
                level: self.child.header().level,
                graph_index: to,
            },
        );
        self.child.write_block(state, block, child_no)
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        let translated = match target {
            FlushTarget::Block(block) => FlushTarget::Block(block),
            FlushTarget::Device => FlushTarget::Device,
        };
        self.child.flush(state, translated)
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
    use crate::patch::{PatchGraph, PatchOwner};
    use crate::scheduler::Scheduler;

    fn partition(start: u32, len: u32) -> (Scheduler, PartitionBd) {
        let mut scheduler = Scheduler::new();
        let disk = MemoryBd::new(BdId(0), 16, 8, scheduler.landing_handle());
        let header = BdHeader {
            id: BdId(1),
            level: 0,
            graph_index: 0,
            numblocks: 0,
            blocksize: 0,
            atomicsize: 0,
        };
        (scheduler, PartitionBd::new(header, Box::new(disk), start, len))
    }

    #[test]
    fn reads_and_writes_translate_into_the_child_offset() {
        let (mut scheduler, mut part) = partition(4, 4);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);

        let block = part.read_block(&mut state, 0).unwrap();
        let owner = PatchOwner {
            id: part.header().id,
            level: part.header().level,
            graph_index: part.header().graph_index,
        };
        state.patches.create_byte(state.blocks, block, owner, 0, 4, b"PART".to_vec(), &[]).unwrap();
        part.write_block(&mut state, block, 0).unwrap();
        scheduler.tick(&mut patches, &mut blocks);

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let reread = part.read_block(&mut state, 0).unwrap();
        assert_eq!(&state.blocks.get(reread).unwrap().data()[0..4], b"PART");
    }

    #[test]
    fn out_of_bounds_block_is_rejected() {
        let (_scheduler, mut part) = partition(0, 2);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let err = part.read_block(&mut state, 2).unwrap_err();
        assert!(matches!(err, FstitchError::InvariantViolation { .. }));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn partition_must_fit_inside_child() {
        let mut scheduler = Scheduler::new();
        let disk = MemoryBd::new(BdId(0), 16, 4, scheduler.landing_handle());
        let header = BdHeader {
            id: BdId(1),
            level: 0,
            graph_index: 0,
            numblocks: 0,
            blocksize: 0,
            atomicsize: 0,
        };
        let _ = PartitionBd::new(header, Box::new(disk), 3, 2);
    }
}
