//! Runtime task table.

use std::collections::HashMap;

use serde::Serialize;

use crate::activity::{Activity, ActivityKind};

/// A software task as recorded by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeTask {
    pub task_id: u64,
    pub exec_uuid: u64,
    /// Engine groups owned by the task; zero means every group.
    pub pg_mask: u32,
    pub start_cycle: u64,
    pub end_cycle: u64,
    pub cycle_valid: bool,
    pub meta_valid: bool,
}

impl RuntimeTask {
    pub const fn new(task_id: u64, exec_uuid: u64, pg_mask: u32) -> Self {
        Self {
            task_id,
            exec_uuid,
            pg_mask,
            start_cycle: 0,
            end_cycle: 0,
            cycle_valid: false,
            meta_valid: false,
        }
    }

    /// Cycle bounds and executable metadata are both known.
    pub const fn is_valid(&self) -> bool {
        self.cycle_valid && self.meta_valid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("duplicate task id {0}")]
    DuplicateTask(u64),
}

/// Outcome of applying launch activities to the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaunchStats {
    pub applied: u64,
    /// Launches naming a task id absent from the table.
    pub unknown: u64,
    /// Launches for a task whose cycles were already set.
    pub repeated: u64,
}

/// All runtime tasks of a session, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: HashMap<u64, RuntimeTask>,
    ids: Vec<u64>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: impl IntoIterator<Item = RuntimeTask>) -> Result<Self, TaskError> {
        let mut table = Self::new();
        for task in tasks {
            table.insert(task)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, task: RuntimeTask) -> Result<(), TaskError> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(TaskError::DuplicateTask(task.task_id));
        }
        let pos = self.ids.partition_point(|&id| id < task.task_id);
        self.ids.insert(pos, task.task_id);
        self.tasks.insert(task.task_id, task);
        Ok(())
    }

    pub fn get(&self, task_id: u64) -> Option<&RuntimeTask> {
        self.tasks.get(&task_id)
    }

    /// Tasks in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &RuntimeTask> {
        self.ids.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Distinct executables referenced by the table, ascending.
    pub fn exec_uuids(&self) -> Vec<u64> {
        let mut uuids: Vec<u64> = self.tasks.values().map(|t| t.exec_uuid).collect();
        uuids.sort_unstable();
        uuids.dedup();
        uuids
    }

    /// Sets `meta_valid` from a predicate over executable ids.
    pub fn mark_meta(&mut self, loaded: impl Fn(u64) -> bool) {
        for task in self.tasks.values_mut() {
            task.meta_valid = loaded(task.exec_uuid);
        }
    }

    /// Fills task cycle bounds from executable-launch activities.
    ///
    /// The launch payload carries the task id. The first launch of a task
    /// wins; later ones are counted and ignored.
    pub fn apply_launches(&mut self, launches: &[Activity]) -> LaunchStats {
        let mut stats = LaunchStats::default();
        for act in launches.iter().filter(|a| a.kind() == ActivityKind::TaskLaunch) {
            let task_id = u64::from(act.start().payload);
            let Some(task) = self.tasks.get_mut(&task_id) else {
                stats.unknown += 1;
                continue;
            };
            if task.cycle_valid {
                stats.repeated += 1;
                continue;
            }
            task.start_cycle = act.start_cycle();
            task.end_cycle = act.end_cycle();
            task.cycle_valid = true;
            stats.applied += 1;
        }
        if stats.unknown > 0 {
            tracing::warn!(unknown = stats.unknown, "launches reference tasks missing from the task table");
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::fixtures::event;
    use crate::codes::ts;
    use crate::engine::EngineType;
    use crate::event::Format;

    fn launch(task_id: u32, start: u64, end: u64) -> Activity {
        let mut s = event(EngineType::Ts, 2, 0, ts::CQM_EXECUTABLE_LAUNCH_START, 0, start);
        let mut e = event(EngineType::Ts, 2, 0, ts::CQM_EXECUTABLE_LAUNCH_END, 0, end);
        for ev in [&mut s, &mut e] {
            ev.format = Format::V2;
            ev.payload = task_id;
        }
        Activity::pair(ActivityKind::TaskLaunch, s, e)
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let err = TaskTable::from_tasks([RuntimeTask::new(1, 9, 1), RuntimeTask::new(1, 9, 2)]).unwrap_err();
        assert_eq!(err, TaskError::DuplicateTask(1));
    }

    #[test]
    fn iterates_in_id_order() {
        let table = TaskTable::from_tasks([
            RuntimeTask::new(30, 1, 1),
            RuntimeTask::new(10, 2, 1),
            RuntimeTask::new(20, 1, 1),
        ])
        .unwrap();
        let ids: Vec<u64> = table.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(table.exec_uuids(), vec![1, 2]);
    }

    #[test]
    fn launches_fill_cycles_once() {
        let mut table = TaskTable::from_tasks([RuntimeTask::new(5, 1, 1)]).unwrap();
        let stats = table.apply_launches(&[launch(5, 100, 900), launch(5, 1000, 1100), launch(6, 0, 1)]);
        assert_eq!(
            stats,
            LaunchStats {
                applied: 1,
                unknown: 1,
                repeated: 1
            }
        );
        let task = table.get(5).unwrap();
        assert!(task.cycle_valid);
        assert_eq!((task.start_cycle, task.end_cycle), (100, 900));
    }

    #[test]
    fn validity_needs_cycles_and_meta() {
        let mut table = TaskTable::from_tasks([RuntimeTask::new(5, 1, 1), RuntimeTask::new(6, 2, 1)]).unwrap();
        table.apply_launches(&[launch(5, 1, 2), launch(6, 3, 4)]);
        table.mark_meta(|uuid| uuid == 1);
        assert!(table.get(5).unwrap().is_valid());
        assert!(!table.get(6).unwrap().is_valid());
    }
}
