//! Logging bootstrap for hosts embedding the manager.

use log::LevelFilter;

/// Initializes host logging. Safe to call more than once; later calls are
/// no-ops.
pub fn init_logging(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new().filter(None, level).parse_default_env().try_init().ok();
    log::set_max_level(level);
}
