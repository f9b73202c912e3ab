//! Collaborator interfaces for session bootstrap data.
//!
//! The core never reads task tables, metadata dumps or host timepoints
//! itself; these traits let callers supply them from files, a database, or
//! test fixtures.

use crate::correlate::{ExecScope, TaskTable};
use crate::timeline::HostTimepoint;

/// Supplies the runtime task table.
pub trait TaskLoader {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load_tasks(&self) -> Result<TaskTable, Self::Error>;
}

/// Supplies per-executable metadata.
pub trait ExecScopeLoader {
    /// Returns `None` when no metadata exists for the executable.
    fn load_exec_scope(&self, exec_uuid: u64) -> Option<ExecScope>;

    /// Reports every executable available out of band. `exists` filters out
    /// ones already loaded; `on_new` receives the rest.
    fn load_wildcards(&self, exists: &dyn Fn(u64) -> bool, on_new: &mut dyn FnMut(u64, ExecScope));
}

/// Supplies host-side clock sync points.
pub trait TimepointLoader {
    /// Returns `None` when the session has no host timepoints.
    fn load_timepoints(&self) -> Option<Vec<HostTimepoint>>;
}
