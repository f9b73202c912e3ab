//! Attribution of hardware activities to runtime tasks and compiled ops.
//!
//! Op activities go through four passes, each one looser than the last:
//!
//! 1. **Strict**: windowed backtrack from the activity's cycle, requiring
//!    the engine-group predicate and a packet the task's executable knows.
//!    Resolved activities are coalesced into per `(task, context)` lanes that
//!    firmware terminators close.
//! 2. **Overcook**: the same test over every launched task, latest first.
//! 3. **Ever since**: forward over the id-ordered task history starting at
//!    the earliest launched task, including tasks whose launch was never
//!    observed.
//! 4. **Wildcard**: packet lookup across every loaded executable, without a
//!    task.
//!
//! Whatever survives all four is reported and kept as unresolved.

mod exec;
mod order;
mod task;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

pub use exec::{DmaOp, DtuOp, ExecRegistry, ExecScope, LookupError};
pub use order::{OrderTask, OrderedTasks, claims, engine_order};
pub use task::{LaunchStats, RuntimeTask, TaskError, TaskTable};

use crate::activity::Activity;
use crate::topology::ArchLayout;

/// Configuration for task attribution.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Candidate tasks tested by a windowed lookup.
    /// Default: 6.
    pub max_backtrace: usize,
    /// Unresolved activities logged one by one before only a total is given.
    /// Default: 10.
    pub print_quota: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_backtrace: 6,
            print_quota: 10,
        }
    }
}

/// The pass that resolved an op activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Strict,
    Overcook,
    EverSince,
    Wildcard,
}

impl Pass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Overcook => "overcook",
            Self::EverSince => "ever_since",
            Self::Wildcard => "wildcard",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Resolution counts per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub total: u64,
    pub strict: u64,
    pub overcook: u64,
    pub ever_since: u64,
    pub wildcard: u64,
    pub unresolved: u64,
}

impl PassStats {
    const fn count(&mut self, pass: Pass) {
        match pass {
            Pass::Strict => self.strict += 1,
            Pass::Overcook => self.overcook += 1,
            Pass::EverSince => self.ever_since += 1,
            Pass::Wildcard => self.wildcard += 1,
        }
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} strict={} overcook={} ever_since={} wildcard={} unresolved={}",
            self.total, self.strict, self.overcook, self.ever_since, self.wildcard, self.unresolved
        )
    }
}

/// An op activity with its owner.
#[derive(Debug, Clone, Serialize)]
pub struct OpActivity {
    pub activity: Activity,
    pub pass: Pass,
    /// `None` when only the wildcard pass found the packet.
    pub task_id: Option<u64>,
    pub exec_uuid: u64,
    pub op_id: Option<u32>,
    pub op: Option<DtuOp>,
    pub host_span: Option<(u64, u64)>,
}

/// Coalesced cycle range of one task on one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSpan {
    pub task_id: u64,
    pub context: u8,
    pub start_cycle: u64,
    pub end_cycle: u64,
    /// Strictly resolved activities in the span.
    pub activities: usize,
    /// Activities placed in the span by engine group alone.
    pub absorbed: usize,
    /// Closed by a firmware terminator rather than end of stream.
    pub terminated: bool,
}

/// How much of a task's executable was seen on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskCoverage {
    pub task_id: u64,
    pub exec_uuid: u64,
    pub matched: usize,
    pub missed: usize,
}

/// Outcome of op attribution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationReport {
    pub ops: Vec<OpActivity>,
    pub unresolved: Vec<Activity>,
    pub spans: Vec<TaskSpan>,
    pub stats: PassStats,
    /// Packets the overcook pass could not place, keyed by engine master value.
    pub overcook_misses: BTreeMap<u32, BTreeSet<u32>>,
    pub coverage: Vec<TaskCoverage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmaActivity {
    pub activity: Activity,
    pub task_id: Option<u64>,
    pub exec_uuid: Option<u64>,
    pub dma: Option<DmaOp>,
    pub host_span: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelActivity {
    pub activity: Activity,
    pub task_id: Option<u64>,
    pub op_id: Option<u32>,
    pub op_name: Option<String>,
    /// Position among kernels of the same op on the same engine.
    pub sub_index: u32,
    pub host_span: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirmwareActivity {
    pub activity: Activity,
    pub task_id: Option<u64>,
    pub host_span: Option<(u64, u64)>,
}

/// An annotated activity that can carry a host-time span.
pub trait HostAligned {
    fn activity(&self) -> &Activity;
    fn set_host_span(&mut self, span: Option<(u64, u64)>);
}

impl HostAligned for OpActivity {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn set_host_span(&mut self, span: Option<(u64, u64)>) {
        self.host_span = span;
    }
}

impl HostAligned for DmaActivity {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn set_host_span(&mut self, span: Option<(u64, u64)>) {
        self.host_span = span;
    }
}

impl HostAligned for KernelActivity {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn set_host_span(&mut self, span: Option<(u64, u64)>) {
        self.host_span = span;
    }
}

impl HostAligned for FirmwareActivity {
    fn activity(&self) -> &Activity {
        &self.activity
    }

    fn set_host_span(&mut self, span: Option<(u64, u64)>) {
        self.host_span = span;
    }
}

#[derive(Debug, Default)]
struct Lane {
    /// First resolved activity, widened over every later one.
    resolved: Option<Activity>,
    parked: Option<Activity>,
    activities: usize,
    absorbed: usize,
}

fn widen(slot: &mut Option<Activity>, act: &Activity) {
    match slot {
        Some(lane) => lane.widen(act),
        None => *slot = Some(act.clone()),
    }
}

/// Open lanes keyed by `(task, context)`.
#[derive(Debug, Default)]
struct Lanes {
    open: BTreeMap<(u64, u8), Lane>,
}

impl Lanes {
    fn add(&mut self, task_id: u64, context: u8, act: &Activity) {
        let lane = self.open.entry((task_id, context)).or_default();
        widen(&mut lane.resolved, act);
        lane.activities += 1;
    }

    fn park(&mut self, task_id: u64, context: u8, act: &Activity) {
        let lane = self.open.entry((task_id, context)).or_default();
        widen(&mut lane.parked, act);
        lane.absorbed += 1;
    }

    /// Closes every lane of `task_id`.
    fn flush_task(&mut self, task_id: u64, spans: &mut Vec<TaskSpan>) {
        let keys: Vec<(u64, u8)> = self
            .open
            .range((task_id, 0)..=(task_id, u8::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(lane) = self.open.remove(&key) {
                spans.extend(Self::span(key, lane, true));
            }
        }
    }

    fn flush_all(&mut self, spans: &mut Vec<TaskSpan>) {
        for (key, lane) in std::mem::take(&mut self.open) {
            spans.extend(Self::span(key, lane, false));
        }
    }

    fn span((task_id, context): (u64, u8), lane: Lane, terminated: bool) -> Option<TaskSpan> {
        let bounds = lane.resolved.or(lane.parked)?;
        Some(TaskSpan {
            task_id,
            context,
            start_cycle: bounds.start_cycle(),
            end_cycle: bounds.end_cycle(),
            activities: lane.activities,
            absorbed: lane.absorbed,
            terminated,
        })
    }
}

#[derive(Clone, Copy)]
enum Item<'b> {
    Op(&'b Activity),
    Terminator(&'b Activity),
}

impl<'b> Item<'b> {
    const fn activity(self) -> &'b Activity {
        match self {
            Self::Op(act) | Self::Terminator(act) => act,
        }
    }
}

/// Attributes activities against one session's tasks and executables.
#[derive(Debug, Clone)]
pub struct Correlator<'a> {
    layout: ArchLayout,
    tasks: &'a TaskTable,
    execs: &'a ExecRegistry,
    config: CorrelationConfig,
}

impl<'a> Correlator<'a> {
    pub const fn new(
        layout: ArchLayout,
        tasks: &'a TaskTable,
        execs: &'a ExecRegistry,
        config: CorrelationConfig,
    ) -> Self {
        Self {
            layout,
            tasks,
            execs,
            config,
        }
    }

    fn knows(&self, task: &RuntimeTask, packet_id: u32) -> bool {
        self.execs
            .get(task.exec_uuid)
            .is_some_and(|scope| scope.knows_packet(packet_id))
    }

    fn winner(&self, ordered: &OrderedTasks, pos: Option<usize>) -> Option<(usize, RuntimeTask, &'a ExecScope)> {
        let pos = pos?;
        let task = ordered.get(pos)?.task;
        let scope = self.execs.get(task.exec_uuid)?;
        Some((pos, task, scope))
    }

    fn resolved(act: &Activity, pass: Pass, task_id: Option<u64>, scope: &ExecScope) -> OpActivity {
        let packet_id = act.packet_id();
        let op = match scope.find_op(packet_id) {
            Ok(op) => Some(op.clone()),
            Err(e) => {
                tracing::debug!(error = %e, "op metadata missing");
                None
            }
        };
        OpActivity {
            activity: act.clone(),
            pass,
            task_id,
            exec_uuid: scope.exec_uuid(),
            op_id: scope.op_id_of(packet_id),
            op,
            host_span: None,
        }
    }

    fn push(report: &mut CorrelationReport, op: OpActivity) {
        report.stats.count(op.pass);
        report.ops.push(op);
    }

    /// Runs all four passes over `ops`. `terminators` are the firmware
    /// marker activities that close lanes during the strict pass.
    pub fn correlate_ops(&self, ops: &[Activity], terminators: &[Activity]) -> CorrelationReport {
        let mut report = CorrelationReport::default();
        report.stats.total = ops.len() as u64;
        let mut tally = BTreeMap::new();

        let pending = self.strict_pass(ops, terminators, &mut report, &mut tally);
        let pending = self.overcook_pass(pending, &mut report, &mut tally);
        let pending = self.ever_since_pass(pending, &mut report, &mut tally);
        self.wildcard_pass(pending, &mut report);

        report.coverage = self.coverage(&tally);
        report.ops.sort_by_key(|op| op.activity.sort_key());
        tracing::info!(stats = %report.stats, spans = report.spans.len(), "op correlation done");
        report
    }

    fn strict_pass<'b>(
        &self,
        ops: &'b [Activity],
        terminators: &'b [Activity],
        report: &mut CorrelationReport,
        tally: &mut BTreeMap<u64, BTreeSet<u32>>,
    ) -> Vec<&'b Activity> {
        let mut items: Vec<Item<'b>> = ops
            .iter()
            .map(Item::Op)
            .chain(terminators.iter().map(Item::Terminator))
            .collect();
        items.sort_by_key(|item| item.activity().sort_key());

        let mut ordered = OrderedTasks::new(self.tasks);
        let mut lanes = Lanes::default();
        let mut misses = Vec::new();
        let window = self.config.max_backtrace;

        for item in items {
            let act = item.activity();
            let event = act.start();
            let by_group = |t: &RuntimeTask| claims(&self.layout, t, event);
            match item {
                Item::Terminator(_) => {
                    if let Some(o) = ordered
                        .locate(act.start_cycle(), window, by_group)
                        .and_then(|pos| ordered.get(pos))
                    {
                        lanes.flush_task(o.task.task_id, &mut report.spans);
                    }
                }
                Item::Op(_) => {
                    let packet_id = act.packet_id();
                    let pos = ordered.locate(act.start_cycle(), window, |t| {
                        by_group(t) && self.knows(t, packet_id)
                    });
                    if let Some((pos, task, scope)) = self.winner(&ordered, pos) {
                        ordered.record(pos, packet_id);
                        lanes.add(task.task_id, event.context, act);
                        Self::push(report, Self::resolved(act, Pass::Strict, Some(task.task_id), scope));
                        continue;
                    }
                    if let Some(o) = ordered
                        .locate(act.start_cycle(), window, by_group)
                        .and_then(|pos| ordered.get(pos))
                    {
                        lanes.park(o.task.task_id, event.context, act);
                    }
                    misses.push(act);
                }
            }
        }
        lanes.flush_all(&mut report.spans);
        report.spans.sort_by_key(|s| (s.start_cycle, s.task_id, s.context));
        ordered.drain_matches(tally);
        misses
    }

    /// Tests every launched task regardless of the window. When several
    /// tasks claim the activity, the latest launched one wins.
    fn overcook_pass<'b>(
        &self,
        pending: Vec<&'b Activity>,
        report: &mut CorrelationReport,
        tally: &mut BTreeMap<u64, BTreeSet<u32>>,
    ) -> Vec<&'b Activity> {
        let mut ordered = OrderedTasks::new(self.tasks);
        let mut misses = Vec::new();
        for act in pending {
            let event = act.start();
            let packet_id = act.packet_id();
            let pos = ordered.locate_exhaustive(|t| claims(&self.layout, t, event) && self.knows(t, packet_id));
            if let Some((pos, task, scope)) = self.winner(&ordered, pos) {
                ordered.record(pos, packet_id);
                Self::push(report, Self::resolved(act, Pass::Overcook, Some(task.task_id), scope));
            } else {
                report
                    .overcook_misses
                    .entry(event.unique_index)
                    .or_default()
                    .insert(packet_id);
                misses.push(act);
            }
        }
        ordered.drain_matches(tally);
        misses
    }

    fn ever_since_pass<'b>(
        &self,
        pending: Vec<&'b Activity>,
        report: &mut CorrelationReport,
        tally: &mut BTreeMap<u64, BTreeSet<u32>>,
    ) -> Vec<&'b Activity> {
        if pending.is_empty() {
            return pending;
        }
        let ids = self.tasks.ids();
        let from = OrderedTasks::new(self.tasks)
            .first_task_id()
            .map_or(0, |first| ids.partition_point(|&id| id < first));
        let history: Vec<&RuntimeTask> = ids[from..]
            .iter()
            .filter_map(|&id| self.tasks.get(id))
            .filter(|t| self.execs.contains(t.exec_uuid))
            .collect();

        let mut misses = Vec::new();
        for act in pending {
            let event = act.start();
            let packet_id = act.packet_id();
            let found = history
                .iter()
                .find(|t| claims(&self.layout, t, event) && self.knows(t, packet_id))
                .and_then(|t| self.execs.get(t.exec_uuid).map(|scope| (t.task_id, scope)));
            match found {
                Some((task_id, scope)) => {
                    tally.entry(task_id).or_default().insert(packet_id);
                    Self::push(report, Self::resolved(act, Pass::EverSince, Some(task_id), scope));
                }
                None => misses.push(act),
            }
        }
        misses
    }

    fn wildcard_pass(&self, pending: Vec<&Activity>, report: &mut CorrelationReport) {
        for act in pending {
            if let Some(scope) = self.execs.find_any(act.packet_id()) {
                Self::push(report, Self::resolved(act, Pass::Wildcard, None, scope));
                continue;
            }
            report.stats.unresolved += 1;
            if report.unresolved.len() < self.config.print_quota {
                let event = act.start();
                tracing::error!(
                    offset = event.offset_index,
                    master = event.unique_index,
                    packet_id = event.packet_id,
                    cycle = act.start_cycle(),
                    "op activity matched no task or executable"
                );
            }
            report.unresolved.push(act.clone());
        }
        let unresolved = report.stats.unresolved;
        if unresolved > self.config.print_quota as u64 {
            tracing::error!(unresolved, "op activities left unresolved after all passes");
        }
    }

    fn coverage(&self, tally: &BTreeMap<u64, BTreeSet<u32>>) -> Vec<TaskCoverage> {
        self.tasks
            .iter()
            .filter_map(|task| {
                let scope = self.execs.get(task.exec_uuid)?;
                let matched = tally.get(&task.task_id).map_or(0, BTreeSet::len);
                Some(TaskCoverage {
                    task_id: task.task_id,
                    exec_uuid: task.exec_uuid,
                    matched,
                    missed: scope.packet_count().saturating_sub(matched),
                })
            })
            .collect()
    }

    /// Attributes DMA activities. The packet check applies only to
    /// executables that carry DMA metadata; the fallback searches every
    /// executable's DMA table without a task.
    pub fn correlate_dma(&self, acts: &[Activity]) -> Vec<DmaActivity> {
        let ordered = OrderedTasks::new(self.tasks);
        let window = self.config.max_backtrace;
        let mut unresolved = 0_u64;
        let out: Vec<DmaActivity> = acts
            .iter()
            .map(|act| {
                let event = act.start();
                let packet_id = act.packet_id();
                let pos = ordered.locate(act.start_cycle(), window, |t| {
                    claims(&self.layout, t, event)
                        && self
                            .execs
                            .get(t.exec_uuid)
                            .is_some_and(|s| !s.has_dma() || s.find_dma(packet_id).is_some())
                });
                let (task_id, scope, dma) = if let Some((_, task, scope)) = self.winner(&ordered, pos) {
                    (Some(task.task_id), Some(scope), scope.find_dma(packet_id))
                } else if let Some((scope, dma)) = self.execs.find_any_dma(packet_id) {
                    (None, Some(scope), Some(dma))
                } else {
                    unresolved += 1;
                    (None, None, None)
                };
                DmaActivity {
                    activity: act.clone(),
                    task_id,
                    exec_uuid: scope.map(ExecScope::exec_uuid),
                    dma: dma.cloned(),
                    host_span: None,
                }
            })
            .collect();
        if unresolved > 0 {
            tracing::warn!(unresolved, "DMA activities without task or metadata");
        }
        out
    }

    /// Attributes kernels to a task by engine group, then to the latest op
    /// of that task started at or before the kernel.
    pub fn correlate_kernels(&self, kernels: &[Activity], ops: &[OpActivity]) -> Vec<KernelActivity> {
        let ordered = OrderedTasks::new(self.tasks);
        let window = self.config.max_backtrace;

        let mut by_task: HashMap<u64, Vec<&OpActivity>> = HashMap::new();
        for op in ops {
            if let Some(task_id) = op.task_id {
                by_task.entry(task_id).or_default().push(op);
            }
        }
        for list in by_task.values_mut() {
            list.sort_by_key(|op| op.activity.start_cycle());
        }

        let mut seen: HashMap<(u64, u32, u32), u32> = HashMap::new();
        kernels
            .iter()
            .map(|act| {
                let event = act.start();
                let task_id = ordered
                    .locate(act.start_cycle(), window, |t| claims(&self.layout, t, event))
                    .and_then(|pos| ordered.get(pos))
                    .map(|o| o.task.task_id);
                let op = task_id.and_then(|id| by_task.get(&id)).and_then(|list| {
                    let after = list.partition_point(|op| op.activity.start_cycle() <= act.start_cycle());
                    after.checked_sub(1).map(|i| list[i])
                });
                let op_id = op.and_then(|op| op.op_id);
                let sub_index = match (task_id, op_id) {
                    (Some(task_id), Some(op_id)) => {
                        let n = seen.entry((task_id, event.unique_index, op_id)).or_insert(0);
                        *n += 1;
                        *n - 1
                    }
                    _ => 0,
                };
                KernelActivity {
                    activity: act.clone(),
                    task_id,
                    op_id,
                    op_name: op.and_then(|op| op.op.as_ref()).map(|d| d.op_name.clone()),
                    sub_index,
                    host_span: None,
                }
            })
            .collect()
    }

    /// Tags firmware activities with the task owning their engine group.
    pub fn annotate_firmware(&self, acts: &[Activity]) -> Vec<FirmwareActivity> {
        let ordered = OrderedTasks::new(self.tasks);
        acts.iter()
            .map(|act| {
                let event = act.start();
                let task_id = ordered
                    .locate(act.start_cycle(), self.config.max_backtrace, |t| {
                        claims(&self.layout, t, event)
                    })
                    .and_then(|pos| ordered.get(pos))
                    .map(|o| o.task.task_id);
                FirmwareActivity {
                    activity: act.clone(),
                    task_id,
                    host_span: None,
                }
            })
            .collect()
    }
}
