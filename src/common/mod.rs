pub mod config;
pub mod exception;
pub mod logger;
pub mod rwlatch;
