//! Cycle-ordered task search.
//!
//! Tasks with known cycle bounds and metadata are sorted by launch cycle.
//! An activity is attributed by binary-searching for the last task launched
//! at or before it and walking backward over a bounded window, testing
//! each candidate's engine-group mask.

use std::collections::{BTreeMap, BTreeSet};

use crate::correlate::task::{RuntimeTask, TaskTable};
use crate::engine::EngineType;
use crate::event::Event;
use crate::topology::ArchLayout;

/// Index of the engine group an event's engine belongs to.
pub fn engine_order(layout: &ArchLayout, event: &Event) -> Option<u32> {
    let groups = layout.cqm_per_cluster.max(1);
    let base = event.cluster_id * groups;
    let per_group = |per_cluster: u32| (per_cluster / groups).max(1);
    match event.engine_type {
        EngineType::Cqm | EngineType::Gsync => Some(base + event.engine_index),
        EngineType::Sip => Some(base + event.engine_index / per_group(layout.sip_per_cluster)),
        EngineType::Sdma => Some(base + event.engine_index / per_group(layout.sdma_per_cluster)),
        EngineType::Cdma if event.engine_index < groups => Some(base + event.engine_index),
        EngineType::Cdma => Some(base),
        _ => None,
    }
}

/// Whether `task` owns the engine group that produced `event`.
///
/// CQM-class events require the group to be the lowest set bit of the
/// mask: a task drives exactly one command queue at a time. Compute and
/// DMA engines only need their group bit set. An empty mask owns everything.
pub fn claims(layout: &ArchLayout, task: &RuntimeTask, event: &Event) -> bool {
    if task.pg_mask == 0 {
        return true;
    }
    let Some(order) = engine_order(layout, event) else {
        return false;
    };
    if event.engine_type.is_cqm_like() {
        task.pg_mask.trailing_zeros() == order
    } else {
        order < u32::BITS && task.pg_mask & (1 << order) != 0
    }
}

/// A task plus the packets attributed to it during one pass.
#[derive(Debug, Clone)]
pub struct OrderTask {
    pub task: RuntimeTask,
    matched: BTreeSet<u32>,
}

impl OrderTask {
    const fn new(task: RuntimeTask) -> Self {
        Self {
            task,
            matched: BTreeSet::new(),
        }
    }

    pub fn record(&mut self, packet_id: u32) {
        self.matched.insert(packet_id);
    }

    pub const fn matched(&self) -> &BTreeSet<u32> {
        &self.matched
    }
}

/// Valid tasks sorted by `(start_cycle, task_id)`.
#[derive(Debug, Clone, Default)]
pub struct OrderedTasks {
    tasks: Vec<OrderTask>,
}

impl OrderedTasks {
    pub fn new(table: &TaskTable) -> Self {
        let mut tasks: Vec<OrderTask> = table
            .iter()
            .filter(|t| t.is_valid())
            .copied()
            .map(OrderTask::new)
            .collect();
        tasks.sort_by_key(|t| (t.task.start_cycle, t.task.task_id));
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&OrderTask> {
        self.tasks.get(pos)
    }

    pub fn first_task_id(&self) -> Option<u64> {
        self.tasks.first().map(|t| t.task.task_id)
    }

    /// Index of the first task launched strictly after `cycle`.
    pub fn upper_bound(&self, cycle: u64) -> usize {
        self.tasks.partition_point(|t| t.task.start_cycle <= cycle)
    }

    /// Walks back from the last task launched at or before `cycle`, testing
    /// at most `max_backtrace` candidates. The closest accepted one wins.
    pub fn locate(
        &self,
        cycle: u64,
        max_backtrace: usize,
        accept: impl Fn(&RuntimeTask) -> bool,
    ) -> Option<usize> {
        (0..self.upper_bound(cycle))
            .rev()
            .take(max_backtrace)
            .find(|&pos| {
                let task = &self.tasks[pos].task;
                task.is_valid() && accept(task)
            })
    }

    /// Like [`locate`](Self::locate) over the whole vector, latest first.
    pub fn locate_exhaustive(&self, accept: impl Fn(&RuntimeTask) -> bool) -> Option<usize> {
        (0..self.tasks.len())
            .rev()
            .find(|&pos| accept(&self.tasks[pos].task))
    }

    pub fn record(&mut self, pos: usize, packet_id: u32) {
        if let Some(t) = self.tasks.get_mut(pos) {
            t.record(packet_id);
        }
    }

    /// Moves this pass's match state into a per-task tally.
    pub fn drain_matches(&mut self, tally: &mut BTreeMap<u64, BTreeSet<u32>>) {
        for t in &mut self.tasks {
            if !t.matched.is_empty() {
                tally
                    .entry(t.task.task_id)
                    .or_default()
                    .append(&mut t.matched);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::fixtures::event;
    use crate::topology::Arch;

    fn task(task_id: u64, pg_mask: u32, start: u64) -> RuntimeTask {
        RuntimeTask {
            start_cycle: start,
            end_cycle: start + 100,
            cycle_valid: true,
            meta_valid: true,
            ..RuntimeTask::new(task_id, 1, pg_mask)
        }
    }

    fn ordered(tasks: impl IntoIterator<Item = RuntimeTask>) -> OrderedTasks {
        OrderedTasks::new(&TaskTable::from_tasks(tasks).unwrap())
    }

    #[test]
    fn engine_order_follows_dorado_groups() {
        let layout = Arch::Dorado.layout();
        assert_eq!(engine_order(&layout, &event(EngineType::Cqm, 1, 2, 9, 0, 0)), Some(5));
        assert_eq!(engine_order(&layout, &event(EngineType::Sip, 0, 7, 1, 0, 0)), Some(1));
        assert_eq!(engine_order(&layout, &event(EngineType::Sdma, 1, 11, 2, 0, 0)), Some(5));
        assert_eq!(engine_order(&layout, &event(EngineType::Cdma, 1, 1, 2, 0, 0)), Some(4));
        assert_eq!(engine_order(&layout, &event(EngineType::Cdma, 1, 3, 2, 0, 0)), Some(3));
        assert_eq!(engine_order(&layout, &event(EngineType::Pcie, 2, 0, 2, 0, 0)), None);
    }

    #[test]
    fn cqm_claim_needs_lowest_set_bit() {
        let layout = Arch::Dorado.layout();
        let cqm1 = event(EngineType::Cqm, 0, 1, 9, 0, 0);
        assert!(claims(&layout, &task(1, 0b010, 0), &cqm1));
        assert!(!claims(&layout, &task(1, 0b011, 0), &cqm1));
        assert!(claims(&layout, &task(1, 0, 0), &cqm1));
    }

    #[test]
    fn compute_claim_tests_group_bit() {
        let layout = Arch::Dorado.layout();
        let sip = event(EngineType::Sip, 0, 5, 1, 0, 0);
        assert!(claims(&layout, &task(1, 0b011, 0), &sip));
        assert!(!claims(&layout, &task(1, 0b101, 0), &sip));
    }

    #[test]
    fn sorts_by_cycle_then_id() {
        let tasks = ordered([task(3, 1, 50), task(1, 1, 50), task(2, 1, 10)]);
        let ids: Vec<u64> = (0..tasks.len()).map(|i| tasks.get(i).unwrap().task.task_id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn invalid_tasks_are_left_out() {
        let mut no_cycles = task(9, 1, 5);
        no_cycles.cycle_valid = false;
        let tasks = ordered([task(1, 1, 10), no_cycles]);
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn upper_bound_is_inclusive_of_equal_starts() {
        let tasks = ordered([task(1, 1, 10), task(2, 1, 20), task(3, 1, 30)]);
        assert_eq!(tasks.upper_bound(5), 0);
        assert_eq!(tasks.upper_bound(20), 2);
        assert_eq!(tasks.upper_bound(99), 3);
    }

    #[test]
    fn locate_prefers_closest_preceding_task() {
        let tasks = ordered([task(1, 1, 10), task(2, 1, 20), task(3, 2, 30)]);
        assert_eq!(tasks.locate(35, 6, |t| t.pg_mask == 1), Some(1));
        assert_eq!(tasks.locate(35, 6, |_| true), Some(2));
        assert_eq!(tasks.locate(5, 6, |_| true), None);
    }

    #[test]
    fn locate_respects_backtrace_window() {
        let mut all = vec![task(1, 2, 0)];
        all.extend((2..=8).map(|id| task(id, 1, id * 10)));
        let tasks = ordered(all);
        assert_eq!(tasks.locate(1_000, 6, |t| t.pg_mask == 2), None);
        assert_eq!(tasks.locate(1_000, 8, |t| t.pg_mask == 2), Some(0));
        assert_eq!(tasks.locate_exhaustive(|t| t.pg_mask == 2), Some(0));
    }

    #[test]
    fn locate_is_repeatable() {
        let tasks = ordered([task(1, 1, 10), task(2, 1, 20)]);
        let first = tasks.locate(25, 6, |_| true);
        for _ in 0..10 {
            assert_eq!(tasks.locate(25, 6, |_| true), first);
        }
    }

    #[test]
    fn match_state_drains_into_tally() {
        let mut tasks = ordered([task(1, 1, 10)]);
        tasks.record(0, 4);
        tasks.record(0, 4);
        tasks.record(0, 5);
        let mut tally = BTreeMap::new();
        tasks.drain_matches(&mut tally);
        assert_eq!(tally[&1], BTreeSet::from([4, 5]));
        assert!(tasks.get(0).unwrap().matched().is_empty());
    }
}
