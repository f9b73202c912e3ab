//! Per-executable op and packet metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::loader::ExecScopeLoader;

/// A compiled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtuOp {
    pub op_id: u32,
    pub op_name: String,
    /// Remaining dump columns, kept verbatim.
    pub detail: String,
}

/// A DMA command packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmaOp {
    pub packet_id: u32,
    pub dma_op: String,
    pub engine_type: String,
    pub engine_index: u32,
    pub input: String,
    pub output: String,
    pub attrs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("packet {packet_id} unknown to executable {exec_uuid:#018x}")]
    UnknownPacket { exec_uuid: u64, packet_id: u32 },

    #[error("packet {packet_id} of executable {exec_uuid:#018x} maps to op {op_id} with no metadata")]
    PacketWithoutOp {
        exec_uuid: u64,
        packet_id: u32,
        op_id: u32,
    },
}

/// Metadata of one executable. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ExecScope {
    exec_uuid: u64,
    packet_to_op: HashMap<u32, u32>,
    ops: HashMap<u32, DtuOp>,
    dma: HashMap<u32, DmaOp>,
}

impl ExecScope {
    pub fn new(exec_uuid: u64, packet_to_op: HashMap<u32, u32>, ops: impl IntoIterator<Item = DtuOp>) -> Self {
        Self {
            exec_uuid,
            packet_to_op,
            ops: ops.into_iter().map(|op| (op.op_id, op)).collect(),
            dma: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_dma(mut self, dma: impl IntoIterator<Item = DmaOp>) -> Self {
        self.dma = dma.into_iter().map(|op| (op.packet_id, op)).collect();
        self
    }

    pub const fn exec_uuid(&self) -> u64 {
        self.exec_uuid
    }

    pub fn knows_packet(&self, packet_id: u32) -> bool {
        self.packet_to_op.contains_key(&packet_id)
    }

    pub fn op_id_of(&self, packet_id: u32) -> Option<u32> {
        self.packet_to_op.get(&packet_id).copied()
    }

    pub fn find_op(&self, packet_id: u32) -> Result<&DtuOp, LookupError> {
        let op_id = self.op_id_of(packet_id).ok_or(LookupError::UnknownPacket {
            exec_uuid: self.exec_uuid,
            packet_id,
        })?;
        self.ops.get(&op_id).ok_or(LookupError::PacketWithoutOp {
            exec_uuid: self.exec_uuid,
            packet_id,
            op_id,
        })
    }

    pub fn has_dma(&self) -> bool {
        !self.dma.is_empty()
    }

    pub fn find_dma(&self, packet_id: u32) -> Option<&DmaOp> {
        self.dma.get(&packet_id)
    }

    pub fn packet_count(&self) -> usize {
        self.packet_to_op.len()
    }
}

/// Loaded executables, cached by uuid.
#[derive(Debug, Clone, Default)]
pub struct ExecRegistry {
    scopes: BTreeMap<u64, ExecScope>,
    wild: BTreeSet<u64>,
    missing: BTreeSet<u64>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a scope loaded outside of any loader.
    pub fn insert(&mut self, scope: ExecScope) {
        self.missing.remove(&scope.exec_uuid);
        self.scopes.insert(scope.exec_uuid, scope);
    }

    /// Loads `exec_uuid` unless it was already loaded or already found missing.
    pub fn load(&mut self, exec_uuid: u64, loader: &impl ExecScopeLoader) -> Option<&ExecScope> {
        if !self.scopes.contains_key(&exec_uuid) && !self.missing.contains(&exec_uuid) {
            match loader.load_exec_scope(exec_uuid) {
                Some(scope) => {
                    self.scopes.insert(exec_uuid, scope);
                }
                None => {
                    tracing::warn!("no metadata for executable {exec_uuid:#018x}");
                    self.missing.insert(exec_uuid);
                }
            }
        }
        self.scopes.get(&exec_uuid)
    }

    /// Loads every executable on disk that no task references.
    pub fn load_wildcards(&mut self, loader: &impl ExecScopeLoader) -> usize {
        let known: BTreeSet<u64> = self.scopes.keys().copied().collect();
        let mut found = Vec::new();
        loader.load_wildcards(&|uuid| known.contains(&uuid), &mut |uuid, scope| {
            found.push((uuid, scope));
        });
        let count = found.len();
        for (uuid, scope) in found {
            self.wild.insert(uuid);
            self.missing.remove(&uuid);
            self.scopes.insert(uuid, scope);
        }
        tracing::debug!(count, "loaded wildcard executables");
        count
    }

    pub fn get(&self, exec_uuid: u64) -> Option<&ExecScope> {
        self.scopes.get(&exec_uuid)
    }

    pub fn contains(&self, exec_uuid: u64) -> bool {
        self.scopes.contains_key(&exec_uuid)
    }

    pub fn is_wild(&self, exec_uuid: u64) -> bool {
        self.wild.contains(&exec_uuid)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// First executable, in uuid order, that knows `packet_id`.
    pub fn find_any(&self, packet_id: u32) -> Option<&ExecScope> {
        self.scopes.values().find(|s| s.knows_packet(packet_id))
    }

    /// First executable, in uuid order, with DMA metadata for `packet_id`.
    pub fn find_any_dma(&self, packet_id: u32) -> Option<(&ExecScope, &DmaOp)> {
        self.scopes
            .values()
            .find_map(|s| s.find_dma(packet_id).map(|op| (s, op)))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::scope;
    use super::*;
    use std::cell::Cell;

    struct CountingLoader {
        calls: Cell<usize>,
    }

    impl ExecScopeLoader for CountingLoader {
        fn load_exec_scope(&self, exec_uuid: u64) -> Option<ExecScope> {
            self.calls.set(self.calls.get() + 1);
            (exec_uuid == 1).then(|| scope(1, [10]))
        }

        fn load_wildcards(&self, exists: &dyn Fn(u64) -> bool, on_new: &mut dyn FnMut(u64, ExecScope)) {
            for uuid in [1, 7] {
                if !exists(uuid) {
                    on_new(uuid, scope(uuid, [20]));
                }
            }
        }
    }

    #[test]
    fn known_packet_without_op_is_distinct_error() {
        let scope = ExecScope::new(3, HashMap::from([(1, 5), (2, 6)]), [DtuOp {
            op_id: 5,
            op_name: "conv".to_string(),
            detail: String::new(),
        }]);
        assert_eq!(scope.find_op(1).unwrap().op_name, "conv");
        assert_eq!(
            scope.find_op(2).unwrap_err(),
            LookupError::PacketWithoutOp {
                exec_uuid: 3,
                packet_id: 2,
                op_id: 6
            }
        );
        assert_eq!(
            scope.find_op(9).unwrap_err(),
            LookupError::UnknownPacket {
                exec_uuid: 3,
                packet_id: 9
            }
        );
    }

    #[test]
    fn registry_caches_hits_and_misses() {
        let loader = CountingLoader { calls: Cell::new(0) };
        let mut registry = ExecRegistry::new();
        assert!(registry.load(1, &loader).is_some());
        assert!(registry.load(1, &loader).is_some());
        assert!(registry.load(2, &loader).is_none());
        assert!(registry.load(2, &loader).is_none());
        assert_eq!(loader.calls.get(), 2);
    }

    #[test]
    fn wildcards_skip_known_executables() {
        let loader = CountingLoader { calls: Cell::new(0) };
        let mut registry = ExecRegistry::new();
        registry.load(1, &loader);
        assert_eq!(registry.load_wildcards(&loader), 1);
        assert!(registry.is_wild(7));
        assert!(!registry.is_wild(1));
        assert_eq!(registry.find_any(20).map(ExecScope::exec_uuid), Some(7));
        assert_eq!(registry.find_any(10).map(ExecScope::exec_uuid), Some(1));
    }

    #[test]
    fn dma_lookup_searches_every_scope() {
        let mut registry = ExecRegistry::new();
        registry.insert(scope(1, []));
        registry.insert(scope(2, []).with_dma([DmaOp {
            packet_id: 4,
            dma_op: "memcpy".to_string(),
            engine_type: "SDMA".to_string(),
            engine_index: 0,
            input: String::new(),
            output: String::new(),
            attrs: String::new(),
        }]));
        let (owner, op) = registry.find_any_dma(4).unwrap();
        assert_eq!(owner.exec_uuid(), 2);
        assert_eq!(op.dma_op, "memcpy");
        assert!(registry.find_any_dma(5).is_none());
    }
}
