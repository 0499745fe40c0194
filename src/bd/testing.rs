//! A scripted wrapper BD for exercising the seed scenarios in spec §8.
//! It does not implement a contract feature of its own — it sits
//! between a stack under test and its terminal device and lets a test
//! control exactly when (and whether) each write actually reaches the
//! child, so crash points, delayed completions, and device failures
//! can be asserted on without an actual process death.
//!
//! Grounded on the same wrapper shape as `unlink_bd`/`partition_bd`
//! (a single child, `write_block` is the only place with nontrivial
//! logic) plus a scripted queue, the way `bd::loopback`'s tests use
//! `tempfile` to get a real but disposable backing store.

use std::collections::VecDeque;

use anyhow::anyhow;

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchId;

/// One scripted outcome for the next `write_block` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward to the child immediately, as normal.
    Pass,
    /// Fail with a device error; the write never reaches the child.
    Fail,
    /// Hold the write in `pending` instead of forwarding it, as if the
    /// I/O were still in flight. Released by `release_pending`.
    Delay,
    /// Simulate the process dying right here: this write and every
    /// write after it (including anything already `Delay`ed) is lost.
    /// Once crashed, the BD stays crashed.
    Crash,
}

pub struct TestingBd {
    header: BdHeader,
    child: Box<dyn BlockDevice>,
    script: VecDeque<Action>,
    pending: Vec<(BlockId, u32)>,
    crashed: bool,
    write_counts: std::collections::HashMap<u32, u32>,
}

impl TestingBd {
    pub fn new(mut header: BdHeader, child: Box<dyn BlockDevice>) -> Self {
        header.level = child.header().level + 1;
        header.graph_index = child.header().graph_index + 1;
        header.numblocks = child.header().numblocks;
        header.blocksize = child.header().blocksize;
        header.atomicsize = child.header().atomicsize;
        Self {
            header,
            child,
            script: VecDeque::new(),
            pending: Vec::new(),
            crashed: false,
            write_counts: std::collections::HashMap::new(),
        }
    }

    /// Appends one scripted action, consumed in order as writes come
    /// in. Once the script runs dry, every further write is `Pass`.
    pub fn script(&mut self, action: Action) -> &mut Self {
        self.script.push_back(action);
        self
    }

    pub fn has_crashed(&self) -> bool {
        self.crashed
    }

    /// How many times `write_block` actually forwarded to the child
    /// for a given block number — S2 asserts this is 1 even after a
    /// hundred merged byte patches land on the same block.
    pub fn write_count(&self, block_no: u32) -> u32 {
        self.write_counts.get(&block_no).copied().unwrap_or(0)
    }

    /// Releases every currently delayed write to the child, in the
    /// order they were delayed. A no-op once crashed — delayed writes
    /// don't survive a crash.
    pub fn release_pending(&mut self, state: &mut GraphState) -> FstitchResult<()> {
        if self.crashed {
            self.pending.clear();
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        for (block, block_no) in pending {
            self.forward(state, block, block_no)?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn forward(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        state
            .patches
            .push_down(state.blocks, block, self.header.owner(), self.child.header().owner());
        self.child.write_block(state, block, block_no)?;
        *self.write_counts.entry(block_no).or_insert(0) += 1;
        Ok(())
    }
}

impl BlockDevice for TestingBd {
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
        if self.crashed {
            return Ok(());
        }
        let action = self.script.pop_front().unwrap_or(Action::Pass);
        match action {
            Action::Pass => self.forward(state, block, block_no),
            Action::Fail => Err(FstitchError::DeviceError {
                source: anyhow!("testing_bd: scripted failure on block {}", block_no),
            }),
            Action::Delay => {
                self.pending.push((block, block_no));
                Ok(())
            }
            Action::Crash => {
                self.crashed = true;
                self.pending.clear();
                Ok(())
            }
        }
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        if self.crashed {
            return Ok(FlushProgress::NONE);
        }
        self.child.flush(state, target)
    }

    fn get_write_head(&self) -> Option<PatchId> {
        self.child.get_write_head()
    }

    fn get_block_space(&self) -> i32 {
        if self.crashed {
            FlushProgress::NONE.raw()
        } else {
            self.child.get_block_space()
        }
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

    fn stack() -> (Scheduler, TestingBd) {
        let mut scheduler = Scheduler::new();
        let term = MemoryBd::new(BdId(0), 32, 16, scheduler.landing_handle());
        let header = BdHeader {
            id: BdId(1),
            level: 0,
            graph_index: 0,
            numblocks: 0,
            blocksize: 0,
            atomicsize: 0,
        };
        let bd = TestingBd::new(header, Box::new(term));
        (scheduler, bd)
    }

    #[test]
    fn ordered_writes_do_not_reach_the_child_out_of_order_across_a_crash() {
        let (mut scheduler, mut bd) = stack();
        bd.script(Action::Pass).script(Action::Crash);

        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = PatchOwner {
            id: bd.header().id,
            level: bd.header().level,
            graph_index: bd.header().graph_index,
        };

        let a = bd.read_block(&mut state, 10).unwrap();
        state.patches.create_byte(state.blocks, a, owner, 0, 4, b"AAAA".to_vec(), &[]).unwrap();
        bd.write_block(&mut state, a, 10).unwrap();

        let b = bd.read_block(&mut state, 20).unwrap();
        state.patches.create_byte(state.blocks, b, owner, 0, 4, b"BBBB".to_vec(), &[]).unwrap();
        bd.write_block(&mut state, b, 20).unwrap();

        scheduler.tick(&mut patches, &mut blocks);

        assert!(bd.has_crashed());
        assert_eq!(bd.write_count(10), 1, "A landed before the crash");
        assert_eq!(bd.write_count(20), 0, "B was lost to the crash, never reaching the terminal device");
    }

    #[test]
    fn delayed_write_only_lands_after_release() {
        let (mut scheduler, mut bd) = stack();
        bd.script(Action::Delay);

        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = PatchOwner {
            id: bd.header().id,
            level: bd.header().level,
            graph_index: bd.header().graph_index,
        };

        let block = bd.read_block(&mut state, 5).unwrap();
        state.patches.create_byte(state.blocks, block, owner, 0, 1, vec![1], &[]).unwrap();
        bd.write_block(&mut state, block, 5).unwrap();

        assert_eq!(bd.write_count(5), 0);
        assert_eq!(bd.pending_count(), 1);

        bd.release_pending(&mut state).unwrap();
        assert_eq!(bd.write_count(5), 1);
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn scripted_failure_is_reported_and_never_forwarded() {
        let (_scheduler, mut bd) = stack();
        bd.script(Action::Fail);

        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);
        let owner = PatchOwner {
            id: bd.header().id,
            level: bd.header().level,
            graph_index: bd.header().graph_index,
        };

        let block = bd.read_block(&mut state, 7).unwrap();
        state.patches.create_byte(state.blocks, block, owner, 0, 1, vec![9], &[]).unwrap();
        let err = bd.write_block(&mut state, block, 7).unwrap_err();
        assert!(matches!(err, FstitchError::DeviceError { .. }));
        assert_eq!(bd.write_count(7), 0);
    }
}
