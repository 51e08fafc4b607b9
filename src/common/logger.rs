use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the process logger once. `default` applies to pool modules
/// unless RUST_LOG says otherwise.
pub fn initialize_logger(default: LevelFilter) {
    // call_once_force recovers from an initialization attempt that panicked.
    INIT.call_once_force(|_| {
        let mut builder = Builder::new();
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("zpipe", default)
            .format_timestamp_millis()
            .parse_default_env();

        // Someone else may have installed a logger already.
        let _ = builder.try_init();
    });
}
