//! Logging utilities

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system, honouring `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize the logging system with a default level when `RUST_LOG` is unset
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}
