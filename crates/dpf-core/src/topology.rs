//! Hardware topology registry.
//!
//! Each architecture ships a static table mapping a master id, split into a
//! 5-bit low half and a 5-bit high half, to a typed engine coordinate. The
//! table is turned into a [`Topology`] once at startup and passed around by
//! reference; nothing here is global.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::EngineType;
use crate::engine::EngineType::{
    Cdma, CdmaLite, Cqm, Gsync, Hcvg, Odma, Pcie, Sdma, SdmaLite, Sip, SipLite, Ts, Vdec,
};

/// Width of a master value in both record layouts.
pub const MASTER_VALUE_BITS: u32 = 10;

/// Width of the runtime context field in the V1 layout.
pub const CONTEXT_BITS: u32 = 4;

const MASTER_LO_BITS: u32 = 5;
const MASTER_VALUE_MASK: u32 = (1 << MASTER_VALUE_BITS) - 1;
const CONTEXT_SHIFT: u32 = 12;

/// Errors raised while building or querying a topology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("no engine at cluster {cluster}, master ({hi}, {lo})")]
    NotFound { cluster: u32, lo: u32, hi: u32 },

    #[error("no engine for master value {0:#x}")]
    UnknownMaster(u32),

    #[error("duplicate unique engine index {index} in {arch} table")]
    DuplicateUniqueIndex { arch: Arch, index: u32 },

    #[error("unknown architecture: {0}")]
    UnknownArch(String),
}

/// Supported accelerator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Dorado,
    Pavo,
}

impl Arch {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dorado => "dorado",
            Self::Pavo => "pavo",
        }
    }

    /// Per-cluster engine counts used to derive engine-group order indices.
    pub const fn layout(self) -> ArchLayout {
        match self {
            Self::Dorado => ArchLayout {
                clusters: 2,
                cqm_per_cluster: 3,
                sip_per_cluster: 12,
                sdma_per_cluster: 12,
                cdma_per_cluster: 4,
            },
            Self::Pavo => ArchLayout {
                clusters: 4,
                cqm_per_cluster: 1,
                sip_per_cluster: 7,
                sdma_per_cluster: 7,
                cdma_per_cluster: 4,
            },
        }
    }

    const fn table(self) -> &'static [EngineEntry] {
        match self {
            Self::Dorado => DORADO,
            Self::Pavo => PAVO,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dorado" => Ok(Self::Dorado),
            "pavo" => Ok(Self::Pavo),
            _ => Err(TopologyError::UnknownArch(s.to_string())),
        }
    }
}

/// Engine counts of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchLayout {
    pub clusters: u32,
    /// Engine groups per cluster; one command queue manager drives each group.
    pub cqm_per_cluster: u32,
    pub sip_per_cluster: u32,
    pub sdma_per_cluster: u32,
    pub cdma_per_cluster: u32,
}

/// One row of a topology table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineEntry {
    pub cluster: u32,
    pub master_hi: u32,
    pub master_lo: u32,
    pub engine_index: u32,
    pub engine_type: EngineType,
}

impl EngineEntry {
    pub const fn unique_index(&self) -> u32 {
        self.master_lo | (self.master_hi << MASTER_LO_BITS)
    }

    const fn resolved(&self) -> ResolvedEngine {
        ResolvedEngine {
            engine_type: self.engine_type,
            engine_index: self.engine_index,
            unique_index: self.unique_index(),
            cluster: self.cluster,
        }
    }
}

/// Typed coordinates of a physical engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedEngine {
    pub engine_type: EngineType,
    pub engine_index: u32,
    pub unique_index: u32,
    pub cluster: u32,
}

impl fmt::Display for ResolvedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.engine_type, self.cluster, self.engine_index)
    }
}

/// Immutable lookup registry built from one architecture's table.
#[derive(Debug, Clone)]
pub struct Topology {
    arch: Arch,
    entries: Vec<EngineEntry>,
    by_unique: HashMap<u32, usize>,
}

impl Topology {
    /// Builds the registry for one of the cataloged architectures.
    pub fn new(arch: Arch) -> Result<Self, TopologyError> {
        Self::from_entries(arch, arch.table())
    }

    /// Builds a registry from an arbitrary table.
    ///
    /// Two rows sharing a unique index make the table unusable, so this fails
    /// rather than letting one row shadow the other.
    pub fn from_entries(arch: Arch, entries: &[EngineEntry]) -> Result<Self, TopologyError> {
        let mut by_unique = HashMap::with_capacity(entries.len());
        for (pos, entry) in entries.iter().enumerate() {
            let index = entry.unique_index();
            if by_unique.insert(index, pos).is_some() {
                return Err(TopologyError::DuplicateUniqueIndex { arch, index });
            }
        }
        tracing::debug!(%arch, engines = entries.len(), "built topology");
        Ok(Self {
            arch,
            entries: entries.to_vec(),
            by_unique,
        })
    }

    pub const fn arch(&self) -> Arch {
        self.arch
    }

    pub const fn layout(&self) -> ArchLayout {
        self.arch.layout()
    }

    pub fn entries(&self) -> &[EngineEntry] {
        &self.entries
    }

    /// Resolves a (cluster, master low, master high) coordinate.
    pub fn resolve(&self, cluster: u32, lo: u32, hi: u32) -> Result<ResolvedEngine, TopologyError> {
        let unique = lo | (hi << MASTER_LO_BITS);
        self.by_unique
            .get(&unique)
            .map(|&pos| &self.entries[pos])
            .filter(|entry| {
                entry.cluster == cluster && entry.master_lo == lo && entry.master_hi == hi
            })
            .map(EngineEntry::resolved)
            .ok_or(TopologyError::NotFound { cluster, lo, hi })
    }

    /// Resolves a raw 10-bit master value; the cluster comes from the table.
    pub fn resolve_master(&self, value: u32) -> Result<ResolvedEngine, TopologyError> {
        self.by_unique
            .get(&(value & MASTER_VALUE_MASK))
            .map(|&pos| self.entries[pos].resolved())
            .ok_or(TopologyError::UnknownMaster(value & MASTER_VALUE_MASK))
    }

    /// Reverse lookup from a unique engine index.
    pub fn engine_type_of(&self, unique_index: u32) -> EngineType {
        self.by_unique
            .get(&unique_index)
            .map_or(EngineType::Unknown, |&pos| self.entries[pos].engine_type)
    }

    /// Interprets a V1 value: master in bits 0..10, context in bits 12..16.
    pub fn decode_v1(&self, raw: u32) -> Result<(ResolvedEngine, u8), TopologyError> {
        let engine = self.resolve_master(raw)?;
        let context = ((raw >> CONTEXT_SHIFT) & ((1 << CONTEXT_BITS) - 1)) as u8;
        Ok((engine, context))
    }

    /// Interprets a V2 value: master in bits 0..10 only.
    pub fn decode_v2(&self, raw: u32) -> Result<ResolvedEngine, TopologyError> {
        self.resolve_master(raw)
    }
}

const fn entry(
    cluster: u32,
    master_hi: u32,
    master_lo: u32,
    engine_index: u32,
    engine_type: EngineType,
) -> EngineEntry {
    EngineEntry {
        cluster,
        master_hi,
        master_lo,
        engine_index,
        engine_type,
    }
}

const DORADO: &[EngineEntry] = &[
    entry(0, 0, 0, 0, Sip),
    entry(0, 0, 1, 0, Sdma),
    entry(0, 0, 2, 1, Sip),
    entry(0, 0, 3, 1, Sdma),
    entry(0, 0, 4, 2, Sip),
    entry(0, 0, 5, 2, Sdma),
    entry(0, 0, 6, 3, Sip),
    entry(0, 0, 7, 3, Sdma),
    entry(0, 0, 8, 0, Cqm),
    entry(0, 0, 13, 0, Gsync),
    entry(0, 1, 0, 4, Sip),
    entry(0, 1, 1, 4, Sdma),
    entry(0, 1, 2, 5, Sip),
    entry(0, 1, 3, 5, Sdma),
    entry(0, 1, 4, 6, Sip),
    entry(0, 1, 5, 6, Sdma),
    entry(0, 1, 6, 7, Sip),
    entry(0, 1, 7, 7, Sdma),
    entry(0, 1, 8, 1, Cqm),
    entry(0, 1, 13, 1, Gsync),
    entry(0, 2, 0, 8, Sip),
    entry(0, 2, 1, 8, Sdma),
    entry(0, 2, 2, 9, Sip),
    entry(0, 2, 3, 9, Sdma),
    entry(0, 2, 4, 10, Sip),
    entry(0, 2, 5, 10, Sdma),
    entry(0, 2, 6, 11, Sip),
    entry(0, 2, 7, 11, Sdma),
    entry(0, 2, 8, 2, Cqm),
    entry(0, 2, 13, 2, Gsync),
    entry(0, 3, 0, 0, Cdma),
    entry(0, 4, 0, 1, Cdma),
    entry(0, 5, 0, 2, Cdma),
    entry(0, 6, 0, 3, Cdma),
    entry(0, 7, 0, 0, SipLite),
    entry(0, 7, 1, 0, SdmaLite),

    entry(1, 8, 0, 0, Sip),
    entry(1, 8, 1, 0, Sdma),
    entry(1, 8, 2, 1, Sip),
    entry(1, 8, 3, 1, Sdma),
    entry(1, 8, 4, 2, Sip),
    entry(1, 8, 5, 2, Sdma),
    entry(1, 8, 6, 3, Sip),
    entry(1, 8, 7, 3, Sdma),
    entry(1, 8, 8, 0, Cqm),
    entry(1, 8, 13, 0, Gsync),
    entry(1, 9, 0, 4, Sip),
    entry(1, 9, 1, 4, Sdma),
    entry(1, 9, 2, 5, Sip),
    entry(1, 9, 3, 5, Sdma),
    entry(1, 9, 4, 6, Sip),
    entry(1, 9, 5, 6, Sdma),
    entry(1, 9, 6, 7, Sip),
    entry(1, 9, 7, 7, Sdma),
    entry(1, 9, 8, 1, Cqm),
    entry(1, 9, 13, 1, Gsync),
    entry(1, 10, 0, 8, Sip),
    entry(1, 10, 1, 8, Sdma),
    entry(1, 10, 2, 9, Sip),
    entry(1, 10, 3, 9, Sdma),
    entry(1, 10, 4, 10, Sip),
    entry(1, 10, 5, 10, Sdma),
    entry(1, 10, 6, 11, Sip),
    entry(1, 10, 7, 11, Sdma),
    entry(1, 10, 8, 2, Cqm),
    entry(1, 10, 13, 2, Gsync),
    entry(1, 11, 0, 0, Cdma),
    entry(1, 12, 0, 1, Cdma),
    entry(1, 13, 0, 2, Cdma),
    entry(1, 14, 0, 3, Cdma),
    entry(1, 15, 0, 0, SipLite),
    entry(1, 15, 1, 0, SdmaLite),

    entry(2, 22, 0, 0, Pcie),
    entry(2, 24, 0, 0, Ts),
    entry(2, 25, 0, 0, Odma),
    entry(2, 27, 0, 0, Hcvg),
    entry(2, 28, 0, 1, Hcvg),
    entry(2, 29, 0, 0, Vdec),
];

const PAVO: &[EngineEntry] = &[
    entry(0, 0, 0, 0, Sip),
    entry(0, 0, 1, 0, Sdma),
    entry(0, 0, 2, 1, Sip),
    entry(0, 0, 3, 1, Sdma),
    entry(0, 0, 4, 2, Sip),
    entry(0, 0, 5, 2, Sdma),
    entry(0, 0, 6, 3, Sip),
    entry(0, 0, 7, 3, Sdma),
    entry(0, 0, 8, 4, Sip),
    entry(0, 0, 9, 4, Sdma),
    entry(0, 0, 10, 5, Sip),
    entry(0, 0, 11, 5, Sdma),
    entry(0, 0, 12, 6, Sip),
    entry(0, 0, 13, 6, Sdma),
    entry(0, 0, 14, 0, Cdma),
    entry(0, 0, 15, 1, Cdma),
    entry(0, 0, 16, 2, Cdma),
    entry(0, 0, 17, 3, Cdma),
    entry(0, 0, 18, 0, Cqm),
    entry(0, 0, 22, 0, Gsync),

    entry(1, 1, 0, 0, Sip),
    entry(1, 1, 1, 0, Sdma),
    entry(1, 1, 2, 1, Sip),
    entry(1, 1, 3, 1, Sdma),
    entry(1, 1, 4, 2, Sip),
    entry(1, 1, 5, 2, Sdma),
    entry(1, 1, 6, 3, Sip),
    entry(1, 1, 7, 3, Sdma),
    entry(1, 1, 8, 4, Sip),
    entry(1, 1, 9, 4, Sdma),
    entry(1, 1, 10, 5, Sip),
    entry(1, 1, 11, 5, Sdma),
    entry(1, 1, 12, 6, Sip),
    entry(1, 1, 13, 6, Sdma),
    entry(1, 1, 14, 0, Cdma),
    entry(1, 1, 15, 1, Cdma),
    entry(1, 1, 16, 2, Cdma),
    entry(1, 1, 17, 3, Cdma),
    entry(1, 1, 18, 0, Cqm),
    entry(1, 1, 22, 0, Gsync),

    entry(2, 2, 0, 0, Sip),
    entry(2, 2, 1, 0, Sdma),
    entry(2, 2, 2, 1, Sip),
    entry(2, 2, 3, 1, Sdma),
    entry(2, 2, 4, 2, Sip),
    entry(2, 2, 5, 2, Sdma),
    entry(2, 2, 6, 3, Sip),
    entry(2, 2, 7, 3, Sdma),
    entry(2, 2, 8, 4, Sip),
    entry(2, 2, 9, 4, Sdma),
    entry(2, 2, 10, 5, Sip),
    entry(2, 2, 11, 5, Sdma),
    entry(2, 2, 12, 6, Sip),
    entry(2, 2, 13, 6, Sdma),
    entry(2, 2, 14, 0, Cdma),
    entry(2, 2, 15, 1, Cdma),
    entry(2, 2, 16, 2, Cdma),
    entry(2, 2, 17, 3, Cdma),
    entry(2, 2, 18, 0, Cqm),
    entry(2, 2, 22, 0, Gsync),

    entry(3, 3, 0, 0, Sip),
    entry(3, 3, 1, 0, Sdma),
    entry(3, 3, 2, 1, Sip),
    entry(3, 3, 3, 1, Sdma),
    entry(3, 3, 4, 2, Sip),
    entry(3, 3, 5, 2, Sdma),
    entry(3, 3, 6, 3, Sip),
    entry(3, 3, 7, 3, Sdma),
    entry(3, 3, 8, 4, Sip),
    entry(3, 3, 9, 4, Sdma),
    entry(3, 3, 10, 5, Sip),
    entry(3, 3, 11, 5, Sdma),
    entry(3, 3, 12, 6, Sip),
    entry(3, 3, 13, 6, Sdma),
    entry(3, 3, 14, 0, Cdma),
    entry(3, 3, 15, 1, Cdma),
    entry(3, 3, 16, 2, Cdma),
    entry(3, 3, 17, 3, Cdma),
    entry(3, 3, 18, 0, Cqm),
    entry(3, 3, 22, 0, Gsync),

    entry(6, 4, 0, 0, Pcie),
    entry(6, 6, 0, 0, Ts),

    entry(4, 15, 0, 0, SipLite),
    entry(4, 15, 1, 0, SdmaLite),
    entry(4, 15, 2, 0, CdmaLite),
    entry(4, 15, 3, 1, CdmaLite),

    entry(5, 16, 0, 0, SipLite),
    entry(5, 16, 1, 0, SdmaLite),
    entry(5, 16, 2, 0, CdmaLite),
    entry(5, 16, 3, 1, CdmaLite),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entry_round_trips_through_reverse_lookup() {
        for arch in [Arch::Dorado, Arch::Pavo] {
            let topo = Topology::new(arch).unwrap();
            for entry in topo.entries() {
                let resolved = topo
                    .resolve(entry.cluster, entry.master_lo, entry.master_hi)
                    .unwrap();
                assert_eq!(resolved.engine_index, entry.engine_index);
                assert_eq!(topo.engine_type_of(resolved.unique_index), entry.engine_type);
            }
        }
    }

    #[test]
    fn resolves_second_sip_of_first_cluster() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let resolved = topo.resolve(0, 2, 0).unwrap();
        assert_eq!(
            resolved,
            ResolvedEngine {
                engine_type: EngineType::Sip,
                engine_index: 1,
                unique_index: 2,
                cluster: 0,
            }
        );
    }

    #[test]
    fn resolve_rejects_wrong_cluster() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let err = topo.resolve(1, 2, 0).unwrap_err();
        assert_eq!(err, TopologyError::NotFound { cluster: 1, lo: 2, hi: 0 });
    }

    #[test]
    fn duplicate_unique_index_is_fatal() {
        let table = [entry(0, 0, 1, 0, Sip), entry(1, 0, 1, 0, Sdma)];
        let err = Topology::from_entries(Arch::Pavo, &table).unwrap_err();
        assert_eq!(
            err,
            TopologyError::DuplicateUniqueIndex {
                arch: Arch::Pavo,
                index: 1
            }
        );
    }

    #[test]
    fn unknown_unique_index_reads_as_unknown_type() {
        let topo = Topology::new(Arch::Pavo).unwrap();
        assert_eq!(topo.engine_type_of(1000), EngineType::Unknown);
    }

    #[test]
    fn v1_layout_carries_context() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let (engine, context) = topo.decode_v1(0x0000_5148).unwrap();
        assert_eq!(engine.engine_type, EngineType::Cqm);
        assert_eq!(engine.cluster, 1);
        assert_eq!(engine.engine_index, 2);
        assert_eq!(engine.unique_index, 328);
        assert_eq!(context, 5);
    }

    #[test]
    fn v2_layout_ignores_upper_bits() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let engine = topo.decode_v2(0xffff_f2c0).unwrap();
        assert_eq!(engine.engine_type, EngineType::Pcie);
        assert_eq!(engine.cluster, 2);
    }

    #[test]
    fn unresolvable_master_errors() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        assert_eq!(
            topo.resolve_master(0x3ff).unwrap_err(),
            TopologyError::UnknownMaster(0x3ff)
        );
    }

    #[test]
    fn arch_parses_case_insensitively() {
        assert_eq!("PAVO".parse::<Arch>().unwrap(), Arch::Pavo);
        assert!(matches!(
            "scorpio".parse::<Arch>(),
            Err(TopologyError::UnknownArch(_))
        ));
    }

    #[test]
    fn layouts_cover_table_engine_groups() {
        for arch in [Arch::Dorado, Arch::Pavo] {
            let topo = Topology::new(arch).unwrap();
            let layout = topo.layout();
            let cqms = topo
                .entries()
                .iter()
                .filter(|e| e.engine_type == EngineType::Cqm)
                .count();
            assert_eq!(cqms as u32, layout.clusters * layout.cqm_per_cluster);
        }
    }
}
