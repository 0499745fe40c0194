//! fstitch-core: a modular, stackable block-device write-ordering engine
//! built from first-class in-memory "patch" objects forming a DAG.
//!
//! A block-device stack is assembled by wrapping [`bd::BlockDevice`]
//! implementations around each other (terminal device at the bottom, a
//! cache, resizer, partition mapper, unlink filter, mirror, or journal on
//! top), and driven through one [`engine::Engine`] handle. Personalities
//! (the CFS/LFS-style filesystem code that actually decides what to
//! write) express every intended change as a patch via
//! [`hooks::PersonalityHooks`] before handing the affected block to
//! `write_block`; the engine's scheduler and revision-slice machinery
//! take it from there, keeping write order consistent across crashes
//! without blocking on synchronous writes.

pub mod alloc;
pub mod bd;
pub mod block;
pub mod block_manager;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod patch;
pub mod patchgroup;
pub mod revision;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{FstitchError, FstitchResult};
pub use patch::{Patch, PatchGraph, PatchId, PatchOwner};
