use log::LevelFilter;
use zpipe::common::logger::initialize_logger;

/// Warnings only unless RUST_LOG asks for more.
pub fn init_test_logger() {
    initialize_logger(LevelFilter::Warn);
}
