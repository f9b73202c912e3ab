//! CLI subcommand implementations.

pub mod decode;
pub mod masters;
pub mod process;
pub mod topology;
