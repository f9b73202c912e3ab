//! End-to-end processing of one trace.
//!
//! Decode, pair (sharded), apply task launches, load executable metadata,
//! correlate, then align device cycles to host time.

use std::num::NonZeroUsize;

use serde::Serialize;

use crate::correlate::{
    CorrelationConfig, CorrelationReport, Correlator, DmaActivity, ExecRegistry, FirmwareActivity, HostAligned,
    KernelActivity, LaunchStats,
};
use crate::loader::{ExecScopeLoader, TaskLoader, TimepointLoader};
use crate::pairing::{Detector, PairingConfig, PairingEngine, PairingStats};
use crate::shard::{self, SinkSet};
use crate::source::{self, DecodeStats};
use crate::timeline::{Timeline, TimelineError, TimelineStats};
use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pairing worker threads.
    /// Default: available parallelism.
    pub jobs: usize,
    pub pairing: PairingConfig,
    pub correlation: CorrelationConfig,
    /// Decode failures logged per class.
    /// Default: 10.
    pub print_quota: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            pairing: PairingConfig::default(),
            correlation: CorrelationConfig::default(),
            print_quota: 10,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load runtime tasks")]
    Tasks(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Timeline(#[from] TimelineError),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DetectorStats {
    pub detector: Detector,
    pub stats: PairingStats,
}

/// Everything a session produced, grouped by activity kind.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub decode: DecodeStats,
    pub pairing: Vec<DetectorStats>,
    pub launches: LaunchStats,
    pub executables: usize,
    pub correlation: CorrelationReport,
    pub dma: Vec<DmaActivity>,
    pub kernels: Vec<KernelActivity>,
    pub firmware: Vec<FirmwareActivity>,
    /// `None` when the session has no host timepoints.
    pub timeline: Option<Timeline>,
    pub timeline_stats: TimelineStats,
}

fn align<T: HostAligned>(items: &mut [T], timeline: &Timeline, stats: &mut TimelineStats) {
    for item in items {
        let act = item.activity();
        let span = timeline.map_span(act.start_cycle(), act.end_cycle(), stats);
        item.set_host_span(span);
    }
}

/// Runs the whole pipeline against one topology.
#[derive(Debug, Clone)]
pub struct Session<'a> {
    topology: &'a Topology,
    config: SessionConfig,
}

impl<'a> Session<'a> {
    pub const fn new(topology: &'a Topology, config: SessionConfig) -> Self {
        Self { topology, config }
    }

    pub fn run<L>(&self, bytes: &[u8], loader: &L) -> Result<SessionReport, SessionError>
    where
        L: TaskLoader + ExecScopeLoader + TimepointLoader,
    {
        let (events, decode) = source::decode_chunk(bytes, self.topology, self.config.print_quota);

        let mut sinks = SinkSet::new(&self.config.pairing);
        shard::run_sharded(&events, self.config.jobs, &mut sinks);
        drop(events);
        let pairing: Vec<DetectorStats> = sinks
            .engines()
            .iter()
            .map(|e| DetectorStats {
                detector: e.detector(),
                stats: e.stats(),
            })
            .collect();
        for s in &pairing {
            tracing::info!(detector = ?s.detector, stats = %s.stats, "pairing done");
        }

        let mut tasks = loader.load_tasks().map_err(|e| SessionError::Tasks(Box::new(e)))?;
        let mut take = |detector| {
            sinks
                .engine_mut(detector)
                .map(PairingEngine::take_activities)
                .unwrap_or_default()
        };
        let launches = take(Detector::TaskLaunch);
        let ops = take(Detector::DebugOp);
        let firmware = take(Detector::Firmware);
        let dma = take(Detector::Dma);
        let kernels = take(Detector::Kernel);
        let launch_stats = tasks.apply_launches(&launches);

        let mut execs = ExecRegistry::new();
        for uuid in tasks.exec_uuids() {
            execs.load(uuid, loader);
        }
        execs.load_wildcards(loader);
        tasks.mark_meta(|uuid| execs.contains(uuid));
        tracing::info!(
            tasks = tasks.len(),
            launched = launch_stats.applied,
            executables = execs.len(),
            "loaded session metadata"
        );

        let correlator = Correlator::new(
            self.topology.layout(),
            &tasks,
            &execs,
            self.config.correlation.clone(),
        );
        let terminators: Vec<_> = firmware.iter().filter(|a| a.is_marker()).cloned().collect();
        let mut correlation = correlator.correlate_ops(&ops, &terminators);
        let mut dma = correlator.correlate_dma(&dma);
        let mut kernels = correlator.correlate_kernels(&kernels, &correlation.ops);
        let mut firmware = correlator.annotate_firmware(&firmware);

        let mut timeline_stats = TimelineStats::default();
        let timeline = match loader.load_timepoints() {
            Some(host) => {
                let timeline = Timeline::build(sinks.sync().points(), &host);
                timeline.verify()?;
                align(&mut correlation.ops, &timeline, &mut timeline_stats);
                align(&mut dma, &timeline, &mut timeline_stats);
                align(&mut kernels, &timeline, &mut timeline_stats);
                align(&mut firmware, &timeline, &mut timeline_stats);
                if timeline_stats.unmappable > 0 {
                    tracing::warn!(
                        unmappable = timeline_stats.unmappable,
                        "activities outside the aligned clock range"
                    );
                }
                Some(timeline)
            }
            None => {
                tracing::warn!("no host timepoints, skipping clock alignment");
                None
            }
        };

        Ok(SessionReport {
            decode,
            pairing,
            launches: launch_stats,
            executables: execs.len(),
            correlation,
            dma,
            kernels,
            firmware,
            timeline,
            timeline_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{cqm, ts};
    use crate::correlate::{DtuOp, ExecScope, Pass, RuntimeTask, TaskError, TaskTable};
    use crate::timeline::HostTimepoint;
    use crate::topology::Arch;
    use std::collections::HashMap;

    /// V1 word 0 for a code and packet.
    fn v1(code: u32, pid: u32) -> u32 {
        (pid << 9) | (code << 1)
    }

    /// V2 word 0 for a code and payload.
    fn v2(code: u32, payload: u32) -> u32 {
        (payload << 8) | (code << 1) | 1
    }

    const CQM_0_0: u32 = 0x8;
    const TS: u32 = 0x300;
    const PCIE: u32 = 0x2c0;

    fn bytes(records: &[[u32; 3]]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|[w0, w1, cycle]| [*w0, *w1, *cycle, 0])
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    struct Fixture {
        timepoints: Option<Vec<HostTimepoint>>,
    }

    impl TaskLoader for Fixture {
        type Error = TaskError;

        fn load_tasks(&self) -> Result<TaskTable, TaskError> {
            TaskTable::from_tasks([RuntimeTask::new(7, 0xab00_0000_0000_0000, 1)])
        }
    }

    impl ExecScopeLoader for Fixture {
        fn load_exec_scope(&self, exec_uuid: u64) -> Option<ExecScope> {
            let op = DtuOp {
                op_id: 3,
                op_name: "matmul".to_string(),
                detail: String::new(),
            };
            Some(ExecScope::new(exec_uuid, HashMap::from([(40, 3)]), [op]))
        }

        fn load_wildcards(&self, _exists: &dyn Fn(u64) -> bool, _on_new: &mut dyn FnMut(u64, ExecScope)) {}
    }

    impl TimepointLoader for Fixture {
        fn load_timepoints(&self) -> Option<Vec<HostTimepoint>> {
            self.timepoints.clone()
        }
    }

    fn trace() -> Vec<u8> {
        bytes(&[
            [1 << 1, PCIE, 100],
            [v2(ts::CQM_EXECUTABLE_LAUNCH_START, 7), TS, 150],
            [v1(cqm::DBG_PACKET_OP_START, 40), CQM_0_0, 200],
            [v1(cqm::DBG_PACKET_OP_END, 41), CQM_0_0, 300],
            [v2(ts::CQM_EXECUTABLE_LAUNCH_END, 7), TS, 350],
            [2 << 1, PCIE, 400],
        ])
    }

    fn host(sync_index: u32, host_time: u64) -> HostTimepoint {
        HostTimepoint {
            cluster_id: 0,
            host_time,
            sync_index,
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            jobs: 2,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn runs_trace_end_to_end() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let fixture = Fixture {
            timepoints: Some(vec![host(1, 1_000), host(2, 4_000)]),
        };
        let report = Session::new(&topo, session_config()).run(&trace(), &fixture).unwrap();

        assert_eq!(report.decode.decoded, 6);
        assert_eq!(report.launches.applied, 1);
        let op = &report.correlation.ops[0];
        assert_eq!((op.task_id, op.pass), (Some(7), Pass::Strict));
        assert_eq!(op.op.as_ref().unwrap().op_name, "matmul");
        assert_eq!(op.host_span, Some((2_000, 3_000)));
        assert_eq!(report.timeline_stats.unmappable, 0);
    }

    #[test]
    fn missing_timepoints_skip_alignment() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let report = Session::new(&topo, session_config())
            .run(&trace(), &Fixture { timepoints: None })
            .unwrap();
        assert!(report.timeline.is_none());
        assert_eq!(report.correlation.ops[0].host_span, None);
    }

    #[test]
    fn bad_alignment_is_fatal() {
        let topo = Topology::new(Arch::Dorado).unwrap();
        let fixture = Fixture {
            timepoints: Some(vec![host(1, 4_000), host(2, 1_000)]),
        };
        let err = Session::new(&topo, session_config())
            .run(&trace(), &fixture)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeline(TimelineError::AlignmentInvariantViolated { field: "host_time", .. })
        ));
    }
}
