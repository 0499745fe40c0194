//! A small end-to-end walkthrough: attach a loopback-backed terminal
//! device, write a few patches through the default personality hooks,
//! and drive the engine to `sync()` so the backing file reflects them.
//!
//! Run with `cargo run --example loopback_walkthrough` once this file is
//! wired into `Cargo.toml`'s `[[example]]` table.

use fstitch_core::bd::loopback::LoopbackBd;
use fstitch_core::bd::BdId;
use fstitch_core::config::EngineConfig;
use fstitch_core::hooks::PersonalityHooks;
use fstitch_core::patch::PatchOwner;
use fstitch_core::Engine;

/// Stands in for a CFS/LFS-style filesystem driver: the only thing a
/// personality needs is something to implement the trait against.
struct DemoPersonality;
impl PersonalityHooks for DemoPersonality {}

fn main() -> anyhow::Result<()> {
    fstitch_core::logging::init_logging();

    let dir = tempfile::tempdir()?;
    let disk_path = dir.path().join("disk.img");

    let mut engine = Engine::new(EngineConfig::default());
    let term = LoopbackBd::open(BdId(0), &disk_path, 16, 512, engine.scheduler().landing_handle())?;
    engine.attach_root(Box::new(term));

    let mut personality = DemoPersonality;
    let block = engine.read_block(3)?;
    let owner = PatchOwner {
        id: BdId(0),
        level: 0,
        graph_index: 0,
    };
    personality.create_byte(&mut engine, block, owner, 0, 10, b"hello disk".to_vec(), &[])?;
    engine.write_block(block, 3)?;

    engine.tick();
    engine.sync()?;

    println!("wrote to {:?}; block space hint: {}", disk_path, personality.block_space_hint(&mut engine));
    Ok(())
}
