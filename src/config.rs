//! Engine configuration (C13): a small `serde`-serializable struct
//! carrying the few runtime knobs the design calls out as configuration
//! rather than code — the revision-rollback strategy (spec.md §4.4/§9,
//! "a runtime config knob, not a compile-time `cfg`"), the write-back
//! cache's capacity, and the journal's transaction size bound.
//!
//! Grounded on the teacher's small typed-struct-saved-as-JSON shape
//! (`config/datastore.rs`'s `DataStoreConfig`, not carried into this
//! crate since it depends on crates this workspace doesn't — see
//! `DESIGN.md`); `EngineConfig` keeps the same idea without the
//! proxmox-specific schema/section-config machinery.

use serde::{Deserialize, Serialize};

use crate::revision::RevisionMode;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// In-place vs. copy rollback for revision slices (§4.4).
    pub revision_mode: RevisionMode,
    /// Dirty-block capacity for `bd::cache::WbCacheBd`.
    pub cache_capacity: usize,
    /// Block-count transaction size bound for `bd::journal::JournalBd`.
    pub journal_txn_blocks: usize,
    /// Depth of the scheduler's landing ring (§4.6); informational —
    /// the ring itself is sized by a const, this is what callers should
    /// assume when reasoning about `Backpressure("landing ring full")`.
    pub landing_ring_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            revision_mode: RevisionMode::InPlace,
            cache_capacity: 256,
            journal_txn_blocks: 64,
            landing_ring_capacity: 4096,
        }
    }
}

impl EngineConfig {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut cfg = EngineConfig::default();
        cfg.revision_mode = RevisionMode::Copy;
        cfg.cache_capacity = 12;

        let json = cfg.to_json().unwrap();
        let back = EngineConfig::from_json(&json).unwrap();
        assert_eq!(back.cache_capacity, 12);
        assert_eq!(back.revision_mode, RevisionMode::Copy);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = EngineConfig::from_json("{\"cache_capacity\": 8}").unwrap();
        assert_eq!(cfg.cache_capacity, 8);
        assert_eq!(cfg.journal_txn_blocks, EngineConfig::default().journal_txn_blocks);
    }
}
