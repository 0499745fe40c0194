//! `journal_bd` (§4.5.6): write-ahead logging over a data device. Before
//! attachment (no log device yet) this is pure passthrough, same as
//! `unlink_bd`. Once a log is attached, writes are absorbed into the
//! open transaction instead of being pushed through immediately; a
//! transaction commits (by block count, or explicitly) through the
//! four-stage chain the spec lays out:
//!
//! 1. copy every dirty block's current bytes into the journal area,
//!    one patch per block;
//! 2. write a commit record depending on all of those copies;
//! 3. push the original patches down to the data device, each now
//!    depending on the commit record;
//! 4. write a completion record depending on the (now data-level)
//!    original patches, and drop the transaction.
//!
//! The data-half copies (step 1) carry no dependency on the originals:
//! they copy the block's in-memory bytes as they stand right now, into
//! a fresh journal slot nothing else has touched, so nothing upstream
//! needs to finish first. `add_depend` also would reject the edge the
//! other way around — the copies live one level closer to the disk
//! than the still-unpushed originals, and a patch may only depend on
//! something at its own level or closer to disk (see the note in
//! `resizer.rs` and the level-monotonicity test in `patch.rs`).
//!
//! Replaying the log on mount is a personality concern (§4.5.6, item
//! 5) — this module only produces the dependency chain that makes
//! replay possible, it does not read it back.

use log::debug;

use crate::bd::{BdHeader, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::error::{FstitchError, FstitchResult};
use crate::patch::PatchId;

struct Transaction {
    seq: u64,
    dirty: Vec<(BlockId, u32)>,
}

impl Transaction {
    fn new(seq: u64) -> Self {
        Self { seq, dirty: Vec::new() }
    }

    fn contains(&self, block: BlockId) -> bool {
        self.dirty.iter().any(|&(b, _)| b == block)
    }
}

pub struct JournalBd {
    header: BdHeader,
    data: Box<dyn BlockDevice>,
    journal: Option<Box<dyn BlockDevice>>,
    current: Option<Transaction>,
    max_txn_blocks: usize,
    hold_count: u32,
    next_seq: u64,
    next_slot: u32,
    /// Completion record of the most recently committed transaction;
    /// exposed through `get_write_head` as the barrier later writes
    /// at this level should depend on.
    last_completion: Option<PatchId>,
}

impl JournalBd {
    pub fn new(mut header: BdHeader, data: Box<dyn BlockDevice>, max_txn_blocks: usize) -> Self {
        header.level = data.header().level + 1;
        header.graph_index = data.header().graph_index + 1;
        header.numblocks = data.header().numblocks;
        header.blocksize = data.header().blocksize;
        header.atomicsize = data.header().atomicsize;
        Self {
            header,
            data,
            journal: None,
            current: None,
            max_txn_blocks: max_txn_blocks.max(1),
            hold_count: 0,
            next_seq: 0,
            next_slot: 0,
            last_completion: None,
        }
    }

    /// Attaches the log device. Until this is called, `write_block`
    /// passes through to the data device untouched (§4.5.6, "before a
    /// log device is attached").
    pub fn attach_journal(&mut self, journal: Box<dyn BlockDevice>) {
        self.journal = Some(journal);
    }

    pub fn is_attached(&self) -> bool {
        self.journal.is_some()
    }

    /// Prevents the next transaction boundary from firing, for a
    /// caller whose writes must land in the same transaction as
    /// whatever follows.
    pub fn add_hold(&mut self) {
        self.hold_count += 1;
    }

    /// Releases a hold taken by `add_hold`; if the open transaction is
    /// over the size bound and no hold remains, commits it right away.
    pub fn remove_hold(&mut self, state: &mut GraphState) -> FstitchResult<()> {
        self.hold_count = self.hold_count.saturating_sub(1);
        if self.hold_count == 0 && self.due() {
            self.commit(state)?;
        }
        Ok(())
    }

    fn due(&self) -> bool {
        match &self.current {
            Some(txn) => txn.dirty.len() >= self.max_txn_blocks,
            None => false,
        }
    }

    fn next_slot_no(&mut self) -> u32 {
        let numblocks = self.journal.as_ref().map(|j| j.header().numblocks).unwrap_or(1).max(1);
        let slot = self.next_slot % numblocks;
        self.next_slot = self.next_slot.wrapping_add(1);
        slot
    }

    /// Explicit commit, usable even under the size bound (an `fsync`,
    /// say). A no-op if no transaction is open or it's empty, or if a
    /// hold is outstanding.
    pub fn commit_now(&mut self, state: &mut GraphState) -> FstitchResult<()> {
        if self.hold_count > 0 {
            return Ok(());
        }
        self.commit(state)
    }

    fn commit(&mut self, state: &mut GraphState) -> FstitchResult<()> {
        let txn = match self.current.take() {
            Some(t) if !t.dirty.is_empty() => t,
            _ => return Ok(()),
        };
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| FstitchError::InvariantViolation {
                reason: "journal_bd: commit with no log device attached".into(),
            })?;
        let journal_owner = journal.header().owner();

        let mut data_half = Vec::with_capacity(txn.dirty.len());
        for &(block, _) in &txn.dirty {
            let content = state
                .blocks
                .get(block)
                .ok_or_else(|| FstitchError::InvariantViolation {
                    reason: "journal_bd: dirty block vanished before commit".into(),
                })?
                .data()
                .to_vec();
            let slot_no = self.next_slot_no();
            let slot_block = journal.read_block(state, slot_no)?;
            let copy = state.patches.create_byte(
                state.blocks,
                slot_block,
                journal_owner,
                0,
                content.len() as u16,
                content,
                &[],
            )?;
            journal.write_block(state, slot_block, slot_no)?;
            data_half.push(copy);
        }

        let commit_slot_no = self.next_slot_no();
        let commit_block = journal.read_block(state, commit_slot_no)?;
        let marker = txn.seq.to_le_bytes().to_vec();
        let commit_id = state.patches.create_byte(
            state.blocks,
            commit_block,
            journal_owner,
            0,
            marker.len() as u16,
            marker,
            &data_half,
        )?;
        journal.write_block(state, commit_block, commit_slot_no)?;

        let mut pushed = Vec::new();
        for &(block, block_no) in &txn.dirty {
            let originals: Vec<PatchId> = state
                .blocks
                .get(block)
                .map(|b| b.patches_for(self.header.graph_index).to_vec())
                .unwrap_or_default();
            for &id in &originals {
                state.patches.add_depend(id, commit_id)?;
            }
            state
                .patches
                .push_down(state.blocks, block, self.header.owner(), self.data.header().owner());
            self.data.write_block(state, block, block_no)?;
            pushed.extend(originals);
        }

        let completion_slot_no = self.next_slot_no();
        let completion_block = journal.read_block(state, completion_slot_no)?;
        let marker = txn.seq.to_le_bytes().to_vec();
        let completion_id = state.patches.create_byte(
            state.blocks,
            completion_block,
            journal_owner,
            0,
            marker.len() as u16,
            marker,
            &pushed,
        )?;
        journal.write_block(state, completion_block, completion_slot_no)?;

        debug!("journal_bd: committed transaction {} ({} blocks)", txn.seq, txn.dirty.len());
        self.last_completion = Some(completion_id);
        Ok(())
    }
}

impl BlockDevice for JournalBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        self.data.read_block(state, block_no)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        self.data.synthetic_read_block(state, block_no)
    }

    fn write_block(&mut self, state: &mut GraphState, block: BlockId, block_no: u32) -> FstitchResult<()> {
        if self.journal.is_none() {
            state
                .patches
                .push_down(state.blocks, block, self.header.owner(), self.data.header().owner());
            return self.data.write_block(state, block, block_no);
        }

        if self.current.is_none() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.current = Some(Transaction::new(seq));
        }
        let txn = self.current.as_mut().unwrap();
        if !txn.contains(block) {
            txn.dirty.push((block, block_no));
        }

        if self.hold_count == 0 && self.due() {
            self.commit(state)?;
        }
        Ok(())
    }

    fn flush(&mut self, state: &mut GraphState, target: FlushTarget) -> FstitchResult<FlushProgress> {
        if self.journal.is_none() {
            return self.data.flush(state, target);
        }
        match target {
            FlushTarget::Device => {
                let had_txn = self.current.is_some();
                self.commit_now(state)?;
                let progress = self.data.flush(state, FlushTarget::Device)?;
                if had_txn && self.current.is_none() {
                    Ok(progress.worst_of(FlushProgress::DONE))
                } else if self.current.is_some() {
                    // Hold still outstanding: nothing actually moved.
                    Ok(FlushProgress::NONE)
                } else {
                    Ok(progress)
                }
            }
            FlushTarget::Block(block) => {
                let in_open_txn = self.current.as_ref().map(|t| t.contains(block)).unwrap_or(false);
                if in_open_txn {
                    self.commit_now(state)?;
                    if self.current.is_some() {
                        return Ok(FlushProgress::NONE);
                    }
                }
                self.data.flush(state, FlushTarget::Block(block))
            }
        }
    }

    fn get_write_head(&self) -> Option<PatchId> {
        self.last_completion.or_else(|| self.data.get_write_head())
    }

    fn get_block_space(&self) -> i32 {
        let open = self.current.as_ref().map(|t| t.dirty.len()).unwrap_or(0) as i32;
        let mut txn_free = self.max_txn_blocks as i32 - open;
        if self.hold_count > 0 {
            txn_free = txn_free.min(-1);
        }
        txn_free.min(self.data.get_block_space())
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

    fn header(id: u32, level: u16, graph_index: u16) -> BdHeader {
        BdHeader {
            id: BdId(id),
            level,
            graph_index,
            numblocks: 0,
            blocksize: 0,
            atomicsize: 0,
        }
    }

    fn stack(max_txn_blocks: usize) -> (Scheduler, JournalBd) {
        let mut scheduler = Scheduler::new();
        let data = MemoryBd::new(BdId(0), 8, 16, scheduler.landing_handle());
        let log = MemoryBd::new(BdId(1), 8, 16, scheduler.landing_handle());
        let mut jbd = JournalBd::new(header(2, 0, 0), Box::new(data), max_txn_blocks);
        jbd.attach_journal(Box::new(log));
        (scheduler, jbd)
    }

    fn owner_of(bd: &JournalBd) -> PatchOwner {
        bd.header().owner()
    }

    #[test]
    fn passthrough_before_journal_attached() {
        let mut scheduler = Scheduler::new();
        let data = MemoryBd::new(BdId(0), 8, 16, scheduler.landing_handle());
        let mut jbd = JournalBd::new(header(1, 0, 0), Box::new(data), 4);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();
        let mut state = GraphState::new(&mut patches, &mut blocks);

        assert!(!jbd.is_attached());
        let block = jbd.read_block(&mut state, 0).unwrap();
        let owner = owner_of(&jbd);
        state
            .patches
            .create_byte(state.blocks, block, owner, 0, 4, b"DATA".to_vec(), &[])
            .unwrap();
        jbd.write_block(&mut state, block, 0).unwrap();
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn commits_on_size_bound_and_produces_a_completion_record() {
        let (mut scheduler, mut jbd) = stack(2);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();

        for block_no in 0..2u32 {
            let mut state = GraphState::new(&mut patches, &mut blocks);
            let block = jbd.read_block(&mut state, block_no).unwrap();
            let owner = owner_of(&jbd);
            state
                .patches
                .create_byte(state.blocks, block, owner, 0, 1, vec![block_no as u8], &[])
                .unwrap();
            jbd.write_block(&mut state, block, block_no).unwrap();
        }

        assert!(jbd.get_write_head().is_some(), "hitting the size bound commits and leaves a completion record");
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn hold_defers_commit_past_the_size_bound() {
        let (mut scheduler, mut jbd) = stack(1);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();

        jbd.add_hold();
        {
            let mut state = GraphState::new(&mut patches, &mut blocks);
            let block = jbd.read_block(&mut state, 0).unwrap();
            let owner = owner_of(&jbd);
            state
                .patches
                .create_byte(state.blocks, block, owner, 0, 1, vec![9], &[])
                .unwrap();
            jbd.write_block(&mut state, block, 0).unwrap();
        }
        assert!(jbd.get_block_space() < 0, "held transaction past its bound reports backpressure");

        let mut state = GraphState::new(&mut patches, &mut blocks);
        jbd.remove_hold(&mut state).unwrap();
        assert!(jbd.get_write_head().is_some(), "releasing the last hold commits the overdue transaction");
        scheduler.tick(&mut patches, &mut blocks);
    }

    #[test]
    fn explicit_flush_commits_a_partial_transaction() {
        let (mut scheduler, mut jbd) = stack(8);
        let mut patches = PatchGraph::new();
        let mut blocks = BlockTable::new();

        {
            let mut state = GraphState::new(&mut patches, &mut blocks);
            let block = jbd.read_block(&mut state, 0).unwrap();
            let owner = owner_of(&jbd);
            state
                .patches
                .create_byte(state.blocks, block, owner, 0, 1, vec![5], &[])
                .unwrap();
            jbd.write_block(&mut state, block, 0).unwrap();
        }
        assert!(jbd.get_write_head().is_none(), "one block under an 8-block bound doesn't auto-commit");

        let mut state = GraphState::new(&mut patches, &mut blocks);
        let progress = jbd.flush(&mut state, FlushTarget::Device).unwrap();
        assert!(progress.made_progress());
        assert!(jbd.get_write_head().is_some());
        scheduler.tick(&mut patches, &mut blocks);
    }
}
