//! `bd::loopback` — a file-backed terminal device (C6/§4.5.7), grounded
//! on the original `fscore/loop_bd.c` / `core/unix_file_bd.h`. Reads and
//! writes a regular host file as if it were a block device; the actual
//! file I/O is the host-OS-driver boundary spec.md §1 puts out of scope,
//! not this shim around it.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::Context;
use log::{debug, trace};

use crate::bd::{BdHeader, BdId, BlockDevice, FlushProgress, FlushTarget, GraphState};
use crate::block::BlockId;
use crate::block_manager::BlockManager;
use crate::error::{FstitchError, FstitchResult};
use crate::scheduler::{LandingHandle, LandingRequest};

pub struct LoopbackBd {
    header: BdHeader,
    file: File,
    manager: BlockManager,
    landing: LandingHandle,
}

impl LoopbackBd {
    /// Opens (or creates) `path` and sizes it to `numblocks * blocksize`
    /// if it is smaller, mirroring the original loopback device's
    /// lazy-grow-on-attach behavior.
    pub fn open<P: AsRef<Path>>(
        id: BdId,
        path: P,
        numblocks: u32,
        blocksize: u16,
        landing: LandingHandle,
    ) -> FstitchResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .with_context(|| format!("opening loopback backing file {:?}", path.as_ref()))
            .map_err(|source| FstitchError::DeviceError { source })?;
        let needed = numblocks as u64 * blocksize as u64;
        if file.metadata().map(|m| m.len()).unwrap_or(0) < needed {
            file.set_len(needed)
                .context("growing loopback backing file")
                .map_err(|source| FstitchError::DeviceError { source })?;
        }
        Ok(Self {
            header: BdHeader {
                id,
                level: 0,
                graph_index: 0,
                numblocks,
                blocksize,
                atomicsize: blocksize,
            },
            file,
            manager: BlockManager::new(),
            landing,
        })
    }

    pub fn set_graph_index(&mut self, graph_index: u16) {
        self.header.graph_index = graph_index;
    }

    fn offset(&self, block_no: u32) -> u64 {
        block_no as u64 * self.header.blocksize as u64
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
            self.file
                .read_exact_at(bdesc.data_mut(), self.offset(block_no))
                .context("loopback read_exact_at")
                .map_err(|source| FstitchError::DeviceError { source })?;
        }
        bdesc.set_synthetic(synthetic);
        self.manager.add(block_no, id);
        Ok(id)
    }
}

impl BlockDevice for LoopbackBd {
    fn header(&self) -> &BdHeader {
        &self.header
    }

    fn read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        trace!("loopback_bd: read_block({})", block_no);
        self.read_or_alloc(state, block_no, false)
    }

    fn synthetic_read_block(&mut self, state: &mut GraphState, block_no: u32) -> FstitchResult<BlockId> {
        trace!("loopback_bd: synthetic_read_block({})", block_no);
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
        self.file
            .write_all_at(bdesc.data(), self.offset(block_no))
            .context("loopback write_all_at")
            .map_err(|source| FstitchError::DeviceError { source })?;
        self.manager.add(block_no, block);

        for &id in &pending {
            state.patches.mark_inflight(id);
        }
        debug!("loopback_bd: landed write of {} patches to block {}", pending.len(), block_no);
        self.landing.notify(LandingRequest {
            block,
            patches: pending,
        })?;
        Ok(())
    }

    fn flush(&mut self, _state: &mut GraphState, _target: FlushTarget) -> FstitchResult<FlushProgress> {
        self.file
            .sync_data()
            .context("loopback sync_data")
            .map_err(|source| FstitchError::DeviceError { source })?;
        Ok(FlushProgress::EMPTY)
    }

    fn get_write_head(&self) -> Option<crate::patch::PatchId> {
        None
    }

    fn get_block_space(&self) -> i32 {
        i32::MAX
    }
}
