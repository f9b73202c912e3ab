//! DPF trace reconstruction CLI library.
//!
//! This crate provides the CLI interface over `dpf-core` and `dpf-load`.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands};
pub use config::Config;
