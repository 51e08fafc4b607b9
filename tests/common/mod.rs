pub mod harness;
pub mod logger;
pub mod macros;
