//! Logging setup (C12/C13). The engine itself only calls `log::{trace,
//! debug, warn, error}`; wiring an actual subscriber is a host concern,
//! but a convenience entry point is provided for binaries and the
//! `demos/` example that don't want to hand-roll `env_logger::Builder`
//! boilerplate themselves.

use std::io::Write;

/// Initializes `env_logger` with the crate's conventional default
/// filter (`warn` crate-wide, `debug` for `fstitch_core` itself) unless
/// `RUST_LOG` is already set in the environment. Safe to call more than
/// once; only the first call takes effect.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder.format(|buf, record| {
        writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args())
    });
    match std::env::var("RUST_LOG") {
        Ok(filter) => {
            builder.parse_filters(&filter);
        }
        Err(_) => {
            builder.parse_filters("warn,fstitch_core=debug");
        }
    }
    let _ = builder.try_init();
}
