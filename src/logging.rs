//! Logging utilities

use env_logger::Builder;
use log::LevelFilter;

/// Initialize the logger with the given [`LevelFilter`].
///
/// `RUST_LOG` still takes precedence over `filter`, so a more verbose run
/// never requires a rebuild.
pub fn initialize_logger(filter: LevelFilter) {
    Builder::new()
        .format_target(false)
        .format_timestamp(None)
        .filter_level(filter)
        .parse_default_env()
        .init();
}
