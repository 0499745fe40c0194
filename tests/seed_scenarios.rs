//! Black-box coverage for the whole-crate seed scenarios in spec.md §8
//! that need more than one module wired together. S1 (ordered writes
//! survive a crash) and S3's size-bound/hold/explicit-commit mechanics
//! are exercised at the unit level inside `bd::testing`/`bd::journal`;
//! this file drives the public `Engine` API the way a personality
//! actually would, matching the teacher's own placement convention of
//! keeping end-to-end coverage under `tests/` and narrower unit tests
//! beside the modules they cover.

use fstitch_core::bd::cache::WbCacheBd;
use fstitch_core::bd::memory::MemoryBd;
use fstitch_core::bd::{BdHeader, BdId, BlockDevice};
use fstitch_core::config::EngineConfig;
use fstitch_core::hooks::PersonalityHooks;
use fstitch_core::patch::PatchOwner;
use fstitch_core::patchgroup::PatchgroupFlags;
use fstitch_core::revision::RevisionMode;
use fstitch_core::Engine;

struct Personality;
impl PersonalityHooks for Personality {}

fn memory_engine(numblocks: u32, blocksize: u16) -> Engine {
    let mut engine = Engine::new(EngineConfig::default());
    let term = MemoryBd::new(BdId(0), numblocks, blocksize, engine.scheduler().landing_handle());
    engine.attach_root(Box::new(term));
    engine
}

fn terminal_owner() -> PatchOwner {
    PatchOwner {
        id: BdId(0),
        level: 0,
        graph_index: 0,
    }
}

/// S2 — write absorption: a hundred successive overwrites of the same
/// byte merge into one patch, and a single flush transfers only the
/// final value.
#[test]
fn s2_write_absorption_merges_a_hundred_overwrites_into_one_flush() {
    let mut engine = memory_engine(4, 16);
    let mut personality = Personality;
    let block = engine.read_block(5).unwrap();
    let owner = terminal_owner();

    for value in 0..100u8 {
        personality
            .create_byte(&mut engine, block, owner, 0, 1, vec![value], &[])
            .unwrap();
    }

    // All hundred writes merged into the same patch on the block: there
    // is exactly one patch attached at the terminal device's own index.
    engine.with_graph(|state| {
        let attached = state.blocks.get(block).unwrap().patches_for(owner.graph_index);
        assert_eq!(attached.len(), 1, "all hundred overwrites merged into a single patch");
    });

    engine.write_block(block, 5).unwrap();
    engine.tick();
    engine.sync().unwrap();

    let reread = engine.read_block(5).unwrap();
    engine.with_graph(|state| {
        assert_eq!(state.blocks.get(reread).unwrap().data()[0], 99, "only the final value ever reached the device");
    });
}

/// S4 — patchgroup dependency across files: once G2 `add_depend`s on
/// G1 and G1 is released, G2's write carries a real DAG dependency on
/// G1's, even though the two touch unrelated blocks that would
/// otherwise have no edge between them at all. (A bare `MemoryBd`
/// lands writes synchronously in call order regardless of readiness,
/// so this checks the dependency edge and the API mechanics rather
/// than an enforced flush order — the ordering itself is
/// `revision_slice_create`'s job, exercised directly in
/// `revision.rs`'s own tests.)
#[test]
fn s4_patchgroup_add_depend_orders_unrelated_writes() {
    let mut engine = memory_engine(4, 16);
    let owner = terminal_owner();

    let g1 = {
        let id = engine.patchgroup_create(owner, PatchgroupFlags::empty()).unwrap();
        engine.patchgroup_engage(id).unwrap();

        let block10 = engine.read_block(10).unwrap();
        engine.with_graph_and_patchgroups(|state, scope| {
            let pass_set = scope.engaged_heads();
            let w1 = state
                .patches
                .create_byte(state.blocks, block10, owner, 0, 4, b"AAAA".to_vec(), &pass_set)
                .unwrap();
            for tail in scope.engaged_tails() {
                state.patches.add_depend(tail, w1).unwrap();
            }
            scope.note_patch_created();
        });
        engine.write_block(block10, 10).unwrap();

        engine.patchgroup_disengage(id).unwrap();
        engine.patchgroup_release(id).unwrap();
        id
    };

    let g2 = engine.patchgroup_create(owner, PatchgroupFlags::empty()).unwrap();
    engine.patchgroup_add_depend(g2, g1).unwrap();
    engine.patchgroup_engage(g2).unwrap();

    let block20 = engine.read_block(20).unwrap();
    let w2 = engine.with_graph_and_patchgroups(|state, scope| {
        let pass_set = scope.engaged_heads();
        let w2 = state
            .patches
            .create_byte(state.blocks, block20, owner, 0, 4, b"BBBB".to_vec(), &pass_set)
            .unwrap();
        for tail in scope.engaged_tails() {
            state.patches.add_depend(tail, w2).unwrap();
        }
        scope.note_patch_created();
        w2
    });
    engine.write_block(block20, 20).unwrap();
    engine.patchgroup_disengage(g2).unwrap();
    engine.patchgroup_release(g2).unwrap();

    // The dependency survives as a real DAG edge: g2's write traces back
    // through g2's head to g1's tail, not just "both writes happened".
    engine.with_graph_and_patchgroups(|state, scope| {
        let g2_head = scope.get(g2).unwrap().head();
        let g1_tail = scope.get(g1).unwrap().tail();
        assert!(state.patches.get(w2).unwrap().befores().contains(&g2_head));
        assert!(state.patches.get(g2_head).unwrap().befores().contains(&g1_tail));
    });

    engine.sync().unwrap();
    engine.tick();

    let reread10 = engine.read_block(10).unwrap();
    let reread20 = engine.read_block(20).unwrap();
    engine.with_graph(|state| {
        assert_eq!(&state.blocks.get(reread10).unwrap().data()[0..4], b"AAAA");
        assert_eq!(&state.blocks.get(reread20).unwrap().data()[0..4], b"BBBB");
    });
}

/// S5 — atomic patchgroup exclusivity: a second atomic patchgroup
/// cannot be engaged while one is already engaged in the same scope;
/// disengaging the first clears the way for the second.
#[test]
fn s5_atomic_patchgroup_exclusivity() {
    let mut engine = memory_engine(2, 8);
    let owner = terminal_owner();

    let a1 = engine.patchgroup_create(owner, PatchgroupFlags::ATOMIC).unwrap();
    let a2 = engine.patchgroup_create(owner, PatchgroupFlags::ATOMIC).unwrap();

    engine.patchgroup_engage(a1).unwrap();
    assert!(engine.patchgroup_engage(a2).is_err(), "a second atomic group cannot engage while one is already engaged");

    engine.patchgroup_disengage(a1).unwrap();
    engine.patchgroup_engage(a2).unwrap();
}

/// S6 — backpressure: filling a write-back cache past its dirty
/// threshold makes `get_block_space` go negative; one flush pass clears
/// it back to nonnegative.
#[test]
fn s6_cache_backpressure_clears_after_a_flush_pass() {
    let mut scheduler_engine = Engine::new(EngineConfig::default());
    let term = MemoryBd::new(BdId(0), 8, 16, scheduler_engine.scheduler().landing_handle());
    let cache_header = BdHeader {
        id: BdId(1),
        level: 0,
        graph_index: 0,
        numblocks: 0,
        blocksize: 0,
        atomicsize: 0,
    };
    let cache = WbCacheBd::new(cache_header, Box::new(term), 2, RevisionMode::InPlace);
    let owner = cache.header().owner();
    scheduler_engine.attach_root(Box::new(cache));

    for block_no in 0..3u32 {
        let block = scheduler_engine.read_block(block_no).unwrap();
        scheduler_engine.with_graph(|state| {
            state
                .patches
                .create_byte(state.blocks, block, owner, 0, 1, vec![block_no as u8], &[])
                .unwrap();
        });
        scheduler_engine.write_block(block, block_no).unwrap();
    }

    assert!(
        scheduler_engine.root().unwrap().get_block_space() < 0,
        "three dirty blocks over a cache capacity of two reports backpressure"
    );

    scheduler_engine.sync().unwrap();
    scheduler_engine.tick();

    assert!(
        scheduler_engine.root().unwrap().get_block_space() >= 0,
        "a full sync pass clears every dirty block and backpressure lifts"
    );
}
