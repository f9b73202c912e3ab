//! Core logic for reconstructing DPF device traces.
//!
//! This crate contains:
//! - Topology: master-value resolution for each chip architecture
//! - Decoding: 16-byte records into typed events
//! - Pairing: per-channel start/end matching, sequential or sharded
//! - Correlation: attributing activities to runtime tasks and compiled ops
//! - Timeline: mapping device cycles onto host time

pub mod activity;
pub mod codes;
pub mod correlate;
pub mod engine;
pub mod event;
pub mod loader;
pub mod pairing;
pub mod session;
pub mod shard;
pub mod source;
pub mod timeline;
pub mod topology;

pub use activity::{Activity, ActivityKind};
pub use correlate::{CorrelationConfig, CorrelationReport, Correlator, ExecRegistry, ExecScope, TaskTable};
pub use engine::{EngineType, UnknownEngineType};
pub use event::{DecodeError, Event, Format, decode, decode_bytes};
pub use loader::{ExecScopeLoader, TaskLoader, TimepointLoader};
pub use pairing::{Detector, PairingConfig, PairingEngine, PairingError, PairingStats};
pub use session::{Session, SessionConfig, SessionError, SessionReport};
pub use source::{DecodeStats, MasterWord, SourceError, decode_chunk, decode_master_text};
pub use timeline::{HostTimepoint, Timeline, TimelineError, TimelineStats};
pub use topology::{Arch, Topology, TopologyError};
