//! Error taxonomy for the engine.
//!
//! Every public entry point into the engine returns `Result<_, FstitchError>`
//! rather than `anyhow::Error`, so that callers at the personality/host-OS
//! boundary can match on the failure kind instead of just formatting it.
//! `anyhow::Error` is still used at that outer boundary (see
//! [`crate::hooks`]) for the same reason the teacher reserves it for
//! call sites that only need to propagate and log.

use thiserror::Error;

use crate::patch::PatchId;

/// The failure taxonomy from the design's error handling section.
#[derive(Error, Debug)]
pub enum FstitchError {
    /// Allocation of a patch, block descriptor, or buffer failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A graph mutation would have broken an invariant (cycle, wrong-level
    /// edge, mutation of an inflight patch).
    #[error("invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// Advisory backpressure; not every caller treats this as an error
    /// (`get_block_space` just returns a negative `i32`), but APIs that
    /// must fail outright surface it through this variant.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The terminal device reported a write failure. This is fatal to
    /// engine consistency (see [`crate::engine::Engine::acknowledge`]);
    /// the variant exists so the panic site has a typed error to log
    /// before aborting.
    #[error("device error: {source}")]
    DeviceError {
        #[source]
        source: anyhow::Error,
    },

    /// The caller violated the API's usage contract (`add_depend` on a
    /// released patchgroup, engaging a second atomic patchgroup, etc).
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// `fstitch_sync` made no progress across a full pass over the BD
    /// stack.
    #[error("sync busy: no progress in a full flush pass")]
    SyncBusy,

    /// A patch id referenced a slot that is no longer live (already
    /// satisfied and freed, or never allocated).
    #[error("stale patch reference: {0:?}")]
    StalePatch(PatchId),
}

pub type FstitchResult<T> = Result<T, FstitchError>;
