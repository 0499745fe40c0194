//! `bd::memory` — a RAM-backed terminal device (C6/§4.5.7), grounded on
//! the original `fscore/mem_bd.h`. The simplest concrete [`BlockDevice`]:
//! a flat byte buffer standing in for the disk.

use log::{debug, trace};

use crate::bd::{BdHeader, BdId, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::block_manager::BlockManager;
use crate::error::{FstitchError, FstitchResult};
use crate::scheduler::{LandingHandle, LandingRequest};

pub struct MemoryBd {
    header: BdHeader,
    backing: Vec<u8>,
    manager: BlockManager,
    landing: LandingHandle,
}

impl MemoryBd {
    pub fn new(id: BdId, numblocks: u32, blocksize: u16, landing: LandingHandle) -> Self {
        Self {
            header: BdHeader {
                id,
                level: 0,
                graph_index: 0,
                numblocks,
                blocksize,
                atomicsize: blocksize,
            },
            backing: vec![0u8; numblocks as usize * blocksize as usize],
            manager: BlockManager::new(),
            landing,
        }
    }

    pub fn set_graph_index(&mut self, graph_index: u16) {
        self.header.graph_index = graph_index;
    }

    pub fn set_level(&mut self, level: u16) {
        self.header.level = level;
    }

    fn backing_range(&self, block_no: u32) -> std::ops::Range<usize> {
        let start = block_no as usize * self.header.blocksize as usize;
        start..start + self.header.blocksize as usize
    }

    fn read_or_alloc(&mut self, state: &mut GraphState, block_no: u32, synthetic: bool) -> FstitchResult<BlockId> {
        if let Some(id) = self.manager.lookup(block_no) {
            return Ok(id);
        }
        if block_no >= self.header.numblocks {
            return Err(FstitchError::InvariantViolation {
                reason: format!("block {} out of range (numblocks={})", block_no, self.header.numblocks),
            });
        }
        let id = state.blocks.alloc(block_no, self.header.blocksize);
        let bdesc = state.blocks.get_mut(id).unwrap();
        if !synthetic {
            let range = self.backing_range(block_no);
            bdesc.data_mut().copy_from_slice(&self.backing[range]);
        }
        bdesc.set_synthetic(synthetic);
        self.manager.add(block_no, id);
        Ok(id)
    }
}

impl BlockDevice for MemoryBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        trace!("memory_bd: read_block({})", block_no);
        self.read_or_alloc(state, block_no, false)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        trace!("memory_bd: synthetic_read_block({})", block_no);
        self.read_or_alloc(state, block_no, true)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        let graph_index = self.header.graph_index;
        let pending: Vec<_> = state
            .blocks
            .get(block)
            .map(|b| b.patches_for(graph_index).to_vec())
            .unwrap_or_default();

        let bdesc = state
            .blocks
            .get_mut(block)
            .ok_or_else(|| FstitchError::InvariantViolation {
                reason: "write_block on unknown block".into(),
            })?;
        bdesc.set_synthetic(false);
        let range = self.backing_range(block_no);
        self.backing[range].copy_from_slice(bdesc.data());
        self.manager.add(block_no, block);

        for &id in &pending {
            state.patches.mark_inflight(id);
        }
        debug!("memory_bd: landed write of {} patches to block {}", pending.len(), block_no);
        self.landing.notify(LandingRequest {
            block,
            patches: pending,
        })?;
        Ok(())
    }

    fn flush(&mut self, _state: &mut GraphState, _target: FlushTarget) -> FstitchResult<FlushProgress> {
        // Writes already land synchronously in `write_block`; there is
        // nothing buffered at this level to push further.
        Ok(FlushProgress::EMPTY)
    }

    fn get_write_head(&self) -> Option<crate::patch::PatchId> {
        None
    }

    fn get_block_space(&self) -> i32 {
        i32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockTable;
    use crate::patch::{PatchGraph, PatchOwner};
    use crate::scheduler::Scheduler;

    #[test]
    fn write_then_read_round_trips_after_landing() {
        let mut scheduler = Scheduler::new();
        let mut bd = MemoryBd::new(BdId(0), 4, 16, scheduler.landing_handle());
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let block = bd.read_block(&mut state, 2).unwrap();

        let owner = PatchOwner {
            id: bd.header().id,
            level: bd.header().level,
            graph_index: bd.header().graph_index,
        };
        state
            .patches
            .create_byte(state.blocks, block, owner, 0, 4, b"ABCD".to_vec(), &[])
            .unwrap();

        bd.write_block(&mut state, block, 2).unwrap();
        scheduler.tick(&mut patches, &mut blocks);

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let reread = bd.read_block(&mut state, 2).unwrap();
        assert_eq!(&state.blocks.get(reread).unwrap().data()[0..4], b"ABCD");
    }
}
