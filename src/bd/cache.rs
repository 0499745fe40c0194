//! The write-back cache (§4.5.1): `wb_cache_bd`/`wb2_cache_bd`/`wbr_cache_bd`
//! in the source are three eviction-policy variants of the same contract;
//! this crate implements that one contract and parameterizes the policy
//! (LRU here — CLOCK is a drop-in replacement over the same `resident`
//! queue, noted in [`DESIGN.md`](../../DESIGN.md)).
//!
//! `write_block` absorbs patches without pushing past itself — the block
//! simply becomes dirty. A flush builds a [`RevisionSlice`] and pushes
//! only the patches that are actually ready down to the child, leaving
//! the rest dirty for a later pass.

use std::collections::{HashSet, VecDeque};

use log::{debug, trace};

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::block_manager::BlockManager;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchId;
use crate::revision::{revision_slice_create, revision_slice_roll_forward, RevisionMode};

pub struct WbCacheBd {
    header: BdHeader,
    child: Box<dyn BlockDevice>,
    manager: BlockManager,
    mode: RevisionMode,
    /// Dirty-block capacity; `get_block_space` is `capacity - dirty.len()`.
    capacity: usize,
    /// All resident blocks, least-recently-used at the front.
    resident: VecDeque<BlockId>,
    dirty: HashSet<BlockId>,
}

impl WbCacheBd {
    pub fn new(mut header: BdHeader, child: Box<dyn BlockDevice>, capacity: usize, mode: RevisionMode) -> Self {
        header.level = child.header().level + 1;
        header.graph_index = child.header().graph_index + 1;
        header.numblocks = child.header().numblocks;
        header.blocksize = child.header().blocksize;
        header.atomicsize = child.header().atomicsize;
        Self {
            header,
            child,
            manager: BlockManager::new(),
            mode,
            capacity,
            resident: VecDeque::new(),
            dirty: HashSet::new(),
        }
    }

    fn touch(&mut self, id: BlockId) {
        if let Some(pos) = self.resident.iter().position(|&b| b == id) {
            self.resident.remove(pos);
        }
        self.resident.push_back(id);
    }

    /// Evicts clean blocks from the LRU front until resident count is
    /// back at or under `capacity`; dirty blocks are never evicted before
    /// being flushed (§4.5.1).
    fn evict_if_needed(&mut self) {
        while self.resident.len() > self.capacity {
            let victim = match self.resident.iter().find(|b| !self.dirty.contains(b)) {
                Some(&b) => b,
                None => break,
            };
            let pos = self.resident.iter().position(|&b| b == victim).unwrap();
            self.resident.remove(pos);
        }
    }

    fn flush_one(&mut self, state: &mut GraphState, block: BlockId) -> FstitchResult<FlushProgress> {
        let block_no = state
            .blocks
            .get(block)
            .ok_or_else(|| FstitchError::InvariantViolation {
                reason: "flush on unknown block".into(),
            })?
            .block_no();

        let slice = revision_slice_create(state.patches, state.blocks, block, &self.header, self.mode);
        if slice.ready.is_empty() {
            revision_slice_roll_forward(state.patches, state.blocks, block, &slice, self.mode);
            return Ok(FlushProgress::NONE);
        }

        let saved = if self.mode == RevisionMode::Copy {
            state.blocks.get(block).map(|b| b.data().to_vec())
        } else {
            None
        };
        if let (RevisionMode::Copy, Some(scratch)) = (self.mode, &slice.scratch) {
            state.blocks.get_mut(block).unwrap().data_mut().copy_from_slice(scratch);
        }

        state.patches.push_down_ids(
            state.blocks,
            block,
            self.header.owner(),
            self.child.header().owner(),
            &slice.ready,
        );
        self.child.write_block(state, block, block_no)?;

        if let Some(orig) = saved {
            state.blocks.get_mut(block).unwrap().data_mut().copy_from_slice(&orig);
        }
        revision_slice_roll_forward(state.patches, state.blocks, block, &slice, self.mode);

        if slice.all_ready {
            self.dirty.remove(&block);
            debug!("wb_cache: block {} fully flushed, now clean", block_no);
            Ok(FlushProgress::DONE)
        } else {
            trace!("wb_cache: block {} partially flushed, {} patches remain", block_no, slice.not_ready.len());
            Ok(FlushProgress::SOME)
        }
    }
}

impl BlockDevice for WbCacheBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        if let Some(id) = self.manager.lookup(block_no) {
            self.touch(id);
            return Ok(id);
        }
        let id = self.child.read_block(state, block_no)?;
        self.manager.add(block_no, id);
        self.resident.push_back(id);
        self.evict_if_needed();
        Ok(id)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        if let Some(id) = self.manager.lookup(block_no) {
            self.touch(id);
            return Ok(id);
        }
        let id = self.child.synthetic_read_block(state, block_no)?;
        self.manager.add(block_no, id);
        self.resident.push_back(id);
        self.evict_if_needed();
        Ok(id)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        self.manager.add(block_no, block);
        self.touch(block);
        self.dirty.insert(block);
        let _ = state;
        Ok(())
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        match target {
            FlushTarget::Block(block) => {
                if self.dirty.contains(&block) {
                    self.flush_one(state, block)
                } else {
                    Ok(FlushProgress::EMPTY)
                }
            }
            FlushTarget::Device => {
                let victims: Vec<BlockId> = self.dirty.iter().copied().collect();
                if victims.is_empty() {
                    return Ok(FlushProgress::EMPTY);
                }
                let mut worst = FlushProgress::EMPTY;
                for block in victims {
                    worst = worst.worst_of(self.flush_one(state, block)?);
                }
                Ok(worst)
            }
        }
    }

    fn get_write_head(&self) -> Option<PatchId> {
        self.child.get_write_head()
    }

    fn get_block_space(&self) -> i32 {
        self.capacity as i32 - self.dirty.len() as i32
    }
}
