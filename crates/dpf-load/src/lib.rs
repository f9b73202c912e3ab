//! Plain-text loaders for DPF session metadata.
//!
//! [`MetaDirLoader`] reads a metadata directory written by the runtime dump
//! tools and implements the `dpf-core` loader traits over it.
//!
//! # Layout
//!
//! | File | Line format |
//! |---|---|
//! | `runtime_task.txt` | `task_id exec_uuid_hex pg_mask` |
//! | `timepoints.txt` | `cluster_id host_time sync_index` |
//! | `<mark>_pkt2op.dumptxt` | `packet_id op_id` |
//! | `<mark>_dtuop.dumptxt` | `op_id op_name [detail]` |
//! | `<mark>_memcpy_meta.dumptxt` | `packet_id dma_op engine_type engine_index input output [attrs]` |
//!
//! `<mark>` is the top 32 bits of the executable uuid, formatted as
//! `0x%08x` (see [`exec_mark`]). The DMA dump is optional. Blank lines are
//! ignored in every file.
//!
//! # Failure Handling
//!
//! A broken task table fails the session. Executable dumps are read on
//! demand through [`ExecScopeLoader`], which has no error channel: a broken
//! dump is logged and the executable is treated as having no metadata. A
//! missing `timepoints.txt` disables clock alignment.

mod parse;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use dpf_core::correlate::{ExecScope, TaskTable};
use dpf_core::loader::{ExecScopeLoader, TaskLoader, TimepointLoader};
use dpf_core::timeline::HostTimepoint;
use regex::Regex;
use thiserror::Error;

pub const RUNTIME_TASK_FILE: &str = "runtime_task.txt";
pub const TIMEPOINTS_FILE: &str = "timepoints.txt";
pub const PKT2OP_SUFFIX: &str = "_pkt2op.dumptxt";
pub const DTUOP_SUFFIX: &str = "_dtuop.dumptxt";
pub const MEMCPY_META_SUFFIX: &str = "_memcpy_meta.dumptxt";

static DTUOP_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x([a-f\d]{8})[a-f\d]*_dtuop\.dumptxt$").unwrap());

/// Loader errors.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A metadata file could not be read.
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A line does not follow its file's format.
    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    /// An id appears twice in one file.
    #[error("{}:{line}: duplicate {what} {id}", .path.display())]
    Duplicate {
        path: PathBuf,
        line: usize,
        what: &'static str,
        id: u64,
    },
}

/// File name prefix for an executable's dumps.
pub fn exec_mark(exec_uuid: u64) -> String {
    format!("0x{:08x}", exec_uuid >> 32)
}

fn read(path: &Path) -> Result<Option<String>, LoadError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_required(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads session metadata from one directory.
#[derive(Debug, Clone)]
pub struct MetaDirLoader {
    dir: PathBuf,
}

impl MetaDirLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn exec_path(&self, exec_uuid: u64, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{suffix}", exec_mark(exec_uuid)))
    }

    /// Reads `runtime_task.txt`. The file must exist.
    pub fn read_tasks(&self) -> Result<TaskTable, LoadError> {
        let path = self.dir.join(RUNTIME_TASK_FILE);
        let text = read_required(&path)?;
        let table = parse::tasks(&path, &text)?;
        tracing::debug!(path = %path.display(), tasks = table.len(), "read runtime tasks");
        Ok(table)
    }

    /// Reads `timepoints.txt`, or `None` when it does not exist.
    pub fn read_timepoints(&self) -> Result<Option<Vec<HostTimepoint>>, LoadError> {
        let path = self.dir.join(TIMEPOINTS_FILE);
        read(&path)?
            .map(|text| parse::timepoints(&path, &text))
            .transpose()
    }

    /// Reads one executable's dumps, or `None` when its op or packet dump
    /// does not exist.
    pub fn read_exec_scope(&self, exec_uuid: u64) -> Result<Option<ExecScope>, LoadError> {
        let pkt_path = self.exec_path(exec_uuid, PKT2OP_SUFFIX);
        let op_path = self.exec_path(exec_uuid, DTUOP_SUFFIX);
        let (Some(pkt_text), Some(op_text)) = (read(&pkt_path)?, read(&op_path)?) else {
            return Ok(None);
        };
        let scope = ExecScope::new(
            exec_uuid,
            parse::packet_map(&pkt_path, &pkt_text)?,
            parse::dtu_ops(&op_path, &op_text)?,
        );

        let dma_path = self.exec_path(exec_uuid, MEMCPY_META_SUFFIX);
        let scope = match read(&dma_path)? {
            Some(text) => scope.with_dma(parse::dma_ops(&dma_path, &text)?),
            None => scope,
        };
        tracing::debug!(
            exec = %exec_mark(exec_uuid),
            packets = scope.packet_count(),
            dma = scope.has_dma(),
            "read executable metadata"
        );
        Ok(Some(scope))
    }

    /// Uuids of every executable with an op dump in the directory, ascending.
    pub fn wildcard_uuids(&self) -> Result<Vec<u64>, LoadError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| LoadError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut uuids: Vec<u64> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let caps = DTUOP_FILE_RE.captures(name.to_str()?)?;
                let high = u32::from_str_radix(&caps[1], 16).ok()?;
                Some(u64::from(high) << 32)
            })
            .collect();
        uuids.sort_unstable();
        uuids.dedup();
        Ok(uuids)
    }
}

impl TaskLoader for MetaDirLoader {
    type Error = LoadError;

    fn load_tasks(&self) -> Result<TaskTable, LoadError> {
        self.read_tasks()
    }
}

impl ExecScopeLoader for MetaDirLoader {
    fn load_exec_scope(&self, exec_uuid: u64) -> Option<ExecScope> {
        match self.read_exec_scope(exec_uuid) {
            Ok(Some(scope)) => Some(scope),
            Ok(None) => {
                tracing::warn!(exec = %exec_mark(exec_uuid), "no metadata for executable");
                None
            }
            Err(e) => {
                tracing::error!(exec = %exec_mark(exec_uuid), error = %e, "failed to load executable metadata");
                None
            }
        }
    }

    fn load_wildcards(&self, exists: &dyn Fn(u64) -> bool, on_new: &mut dyn FnMut(u64, ExecScope)) {
        let uuids = match self.wildcard_uuids() {
            Ok(uuids) => uuids,
            Err(e) => {
                tracing::warn!(error = %e, "cannot scan for extra executables");
                return;
            }
        };
        for uuid in uuids.into_iter().filter(|&uuid| !exists(uuid)) {
            if let Some(scope) = self.load_exec_scope(uuid) {
                tracing::info!(exec = %exec_mark(uuid), "loaded executable without a task");
                on_new(uuid, scope);
            }
        }
    }
}

impl TimepointLoader for MetaDirLoader {
    fn load_timepoints(&self) -> Option<Vec<HostTimepoint>> {
        match self.read_timepoints() {
            Ok(points) => points,
            Err(e) => {
                tracing::error!(error = %e, "failed to load host timepoints");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXEC: u64 = 0xab00_0000_0000_0000;

    fn write(dir: &Path, name: &str, text: &str) {
        fs::write(dir.join(name), text).unwrap();
    }

    fn write_exec(dir: &Path, exec_uuid: u64) {
        let mark = exec_mark(exec_uuid);
        write(dir, &format!("{mark}{PKT2OP_SUFFIX}"), "40 3\n41 3\n42 4\n");
        write(dir, &format!("{mark}{DTUOP_SUFFIX}"), "3 matmul tile=4\n4 relu\n");
    }

    #[test]
    fn exec_mark_is_top_half() {
        assert_eq!(exec_mark(EXEC), "0xab000000");
        assert_eq!(exec_mark(0x0000_0001_ffff_ffff), "0x00000001");
    }

    #[test]
    fn reads_tasks_and_timepoints() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), RUNTIME_TASK_FILE, "7 0xab00000000000000 1\n8 0xab00000000000000 2\n");
        write(temp.path(), TIMEPOINTS_FILE, "0 1000 1\n0 4000 2\n");

        let loader = MetaDirLoader::new(temp.path());
        let tasks = loader.load_tasks().unwrap();
        assert_eq!(tasks.ids(), &[7, 8]);
        assert_eq!(tasks.exec_uuids(), vec![EXEC]);
        let points = loader.load_timepoints().unwrap();
        assert_eq!(points[1].sync_index, 2);
    }

    #[test]
    fn missing_task_table_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = MetaDirLoader::new(temp.path()).load_tasks().unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn missing_timepoints_disable_alignment() {
        let temp = TempDir::new().unwrap();
        assert!(MetaDirLoader::new(temp.path()).load_timepoints().is_none());
    }

    #[test]
    fn reads_exec_scope_with_optional_dma() {
        let temp = TempDir::new().unwrap();
        write_exec(temp.path(), EXEC);
        let loader = MetaDirLoader::new(temp.path());

        let scope = loader.load_exec_scope(EXEC).unwrap();
        assert_eq!(scope.find_op(41).unwrap().op_name, "matmul");
        assert_eq!(scope.find_op(40).unwrap().detail, "tile=4");
        assert!(!scope.has_dma());

        write(
            temp.path(),
            &format!("0xab000000{MEMCPY_META_SUFFIX}"),
            "42 copy sip launch 1 [a, b] out\n",
        );
        let scope = loader.load_exec_scope(EXEC).unwrap();
        let dma = scope.find_dma(42).unwrap();
        assert_eq!((dma.engine_type.as_str(), dma.input.as_str()), ("sip launch", "[a,b]"));
    }

    #[test]
    fn absent_or_broken_dumps_yield_no_scope() {
        let temp = TempDir::new().unwrap();
        let loader = MetaDirLoader::new(temp.path());
        assert!(loader.load_exec_scope(EXEC).is_none());

        write_exec(temp.path(), EXEC);
        write(temp.path(), &format!("0xab000000{DTUOP_SUFFIX}"), "3 a\n3 b\n");
        assert!(matches!(
            loader.read_exec_scope(EXEC),
            Err(LoadError::Duplicate { what: "op id", line: 2, .. })
        ));
        assert!(loader.load_exec_scope(EXEC).is_none());
    }

    #[test]
    fn wildcards_skip_known_executables() {
        let temp = TempDir::new().unwrap();
        write_exec(temp.path(), EXEC);
        write_exec(temp.path(), 0x0000_00cd_0000_0000);
        write(temp.path(), "0xzz_dtuop.dumptxt", "");
        write(temp.path(), "notes.txt", "");
        let loader = MetaDirLoader::new(temp.path());
        assert_eq!(loader.wildcard_uuids().unwrap(), vec![0x0000_00cd_0000_0000, EXEC]);

        let mut found = Vec::new();
        loader.load_wildcards(&|uuid| uuid == EXEC, &mut |uuid, scope| {
            found.push((uuid, scope.packet_count()));
        });
        assert_eq!(found, vec![(0x0000_00cd_0000_0000, 3)]);
    }
}
