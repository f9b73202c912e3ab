//! Configuration loading and management.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use dpf_core::{Arch, CorrelationConfig, PairingConfig, SessionConfig, Topology, TopologyError};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Chip architecture of the traced device.
    pub arch: Arch,
    /// Pairing worker threads.
    pub jobs: usize,
    /// Candidate tasks tested per activity in the windowed passes.
    pub max_backtrace: usize,
    /// Samples logged per failure class.
    pub print_quota: usize,
    /// Unmatched ends kept per detector.
    pub sample_limit: usize,
    /// Default metadata directory for `process`.
    pub meta_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let correlation = CorrelationConfig::default();
        Self {
            arch: Arch::Dorado,
            jobs: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_backtrace: correlation.max_backtrace,
            print_quota: correlation.print_quota,
            sample_limit: PairingConfig::default().sample_limit,
            meta_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // DPF_* environment variables
        figment = figment.merge(Env::prefixed("DPF_"));

        figment.extract()
    }

    pub fn topology(&self) -> Result<Topology, TopologyError> {
        Topology::new(self.arch)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            jobs: self.jobs.max(1),
            pairing: PairingConfig {
                sample_limit: self.sample_limit,
            },
            correlation: CorrelationConfig {
                max_backtrace: self.max_backtrace,
                print_quota: self.print_quota,
            },
            print_quota: self.print_quota,
        }
    }
}

/// Returns the platform-specific config directory for dpf.
///
/// On Linux: `~/.config/dpf`
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dpf"))
}
