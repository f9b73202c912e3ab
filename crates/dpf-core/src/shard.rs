//! Parallel pairing over contiguous partitions of the event stream.
//!
//! Each worker pairs its own slice with a blank [`SinkSet`]. Ends whose
//! start lies in an earlier partition fail locally; they travel backward one
//! worker at a time, tagged with the sinks that rejected them, until a worker
//! pairs them or worker 0 records them as unmatched. A paired end that
//! purges stale starts also travels backward, so the purge reaches starts
//! held by every earlier worker. Results are merged in partition order and
//! sorted, which makes the output identical to a sequential run.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use crate::event::Event;
use crate::pairing::{Detector, PairingConfig, PairingEngine};
use crate::timeline::SyncCollector;

/// Smallest partition worth a thread.
pub const MIN_PARTITION: usize = 1000;

/// Bound on in-flight forwarded events between neighbouring workers.
const FORWARD_QUEUE: usize = 4096;

/// Sink indices that rejected an event, one bit per engine.
pub type FailureMask = u32;

/// Every pairing engine plus the sync point collector.
#[derive(Debug, Clone)]
pub struct SinkSet {
    engines: Vec<PairingEngine>,
    sync: SyncCollector,
}

impl SinkSet {
    /// One engine per detector, in [`Detector::ALL`] order.
    pub fn new(config: &PairingConfig) -> Self {
        Self {
            engines: Detector::ALL
                .iter()
                .map(|&d| PairingEngine::new(d, config.clone()))
                .collect(),
            sync: SyncCollector::default(),
        }
    }

    /// Feeds `event` to every subscribed sink. Returns the sinks that could
    /// not pair it; nothing is recorded for them yet.
    pub fn dispatch(&mut self, event: &Event) -> FailureMask {
        if SyncCollector::subscribes(event.engine_type) {
            self.sync.observe(event);
        }
        self.redispatch(event, FailureMask::MAX)
    }

    /// Feeds `event` only to the sinks named in `mask`.
    pub fn redispatch(&mut self, event: &Event, mask: FailureMask) -> FailureMask {
        let mut failed = 0;
        for (i, engine) in self.engines.iter_mut().enumerate() {
            if mask & (1 << i) != 0 && engine.subscribes(event.engine_type) && engine.dispatch(event).is_err() {
                failed |= 1 << i;
            }
        }
        failed
    }

    /// Sinks among `handled` that paired `event` and must purge older
    /// starts with it.
    pub fn purge_mask(&self, event: &Event, handled: FailureMask) -> FailureMask {
        let mut mask = 0;
        for (i, engine) in self.engines.iter().enumerate() {
            if handled & (1 << i) != 0 && engine.purges_on(event) {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Replays the purge of a paired `event` on the sinks named in `mask`.
    pub fn purge(&mut self, event: &Event, mask: FailureMask) {
        for (i, engine) in self.engines.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                engine.purge(event);
            }
        }
    }

    pub fn record_unmatched(&mut self, event: &Event, mask: FailureMask) {
        for (i, engine) in self.engines.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                engine.record_unmatched(event);
            }
        }
    }

    /// Dispatches and immediately records failures.
    pub fn process(&mut self, event: &Event) {
        let failed = self.dispatch(event);
        if failed != 0 {
            self.record_unmatched(event, failed);
        }
    }

    pub fn fresh_clone(&self) -> Self {
        Self {
            engines: self.engines.iter().map(PairingEngine::fresh_clone).collect(),
            sync: self.sync.fresh_clone(),
        }
    }

    pub fn finalize(&mut self) {
        for engine in &mut self.engines {
            engine.finalize();
        }
    }

    pub fn merge_into(self, canonical: &mut Self) {
        for (engine, target) in self.engines.into_iter().zip(&mut canonical.engines) {
            engine.merge_into(target);
        }
        self.sync.merge_into(&mut canonical.sync);
    }

    pub fn sort(&mut self) {
        for engine in &mut self.engines {
            engine.sort();
        }
    }

    pub fn engine(&self, detector: Detector) -> Option<&PairingEngine> {
        self.engines.iter().find(|e| e.detector() == detector)
    }

    pub fn engine_mut(&mut self, detector: Detector) -> Option<&mut PairingEngine> {
        self.engines.iter_mut().find(|e| e.detector() == detector)
    }

    pub fn engines(&self) -> &[PairingEngine] {
        &self.engines
    }

    pub const fn sync(&self) -> &SyncCollector {
        &self.sync
    }
}

/// Splits `len` events into at most `jobs` contiguous ranges of at least
/// [`MIN_PARTITION`] events each.
pub fn partition(len: usize, jobs: usize) -> Vec<std::ops::Range<usize>> {
    partition_with(len, jobs, MIN_PARTITION)
}

fn partition_with(len: usize, jobs: usize, min: usize) -> Vec<std::ops::Range<usize>> {
    let parts = (len / min.max(1)).clamp(1, jobs.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let end = start + base + usize::from(i < extra);
            let range = start..end;
            start = end;
            range
        })
        .collect()
}

/// Pairs every event on the calling thread.
pub fn run_sequential(events: &[Event], sinks: &mut SinkSet) {
    for event in events {
        sinks.process(event);
    }
    sinks.finalize();
    sinks.sort();
}

/// Pairs `events` on up to `jobs` threads and merges into `sinks`.
pub fn run_sharded(events: &[Event], jobs: usize, sinks: &mut SinkSet) {
    run_partitions(events, &partition(events.len(), jobs), sinks);
}

/// Traffic from a worker to the one before it, in stream order.
#[derive(Debug, Clone, Copy)]
enum Forward {
    /// An end the named sinks could not pair.
    End(Event, FailureMask),
    /// A paired end whose purge the named sinks must replay.
    Purge(Event, FailureMask),
}

/// Queues whatever `event` still owes earlier partitions.
fn settle(sinks: &SinkSet, event: &Event, offered: FailureMask, failed: FailureMask, out: &mut Vec<Forward>) {
    if failed != 0 {
        out.push(Forward::End(*event, failed));
    }
    let purging = sinks.purge_mask(event, offered & !failed);
    if purging != 0 {
        out.push(Forward::Purge(*event, purging));
    }
}

fn worker(
    mut sinks: SinkSet,
    slice: &[Event],
    inbound: Option<Receiver<Forward>>,
    outbound: Option<SyncSender<Forward>>,
) -> SinkSet {
    let mut backlog: Vec<Forward> = Vec::new();
    for event in slice {
        let failed = sinks.dispatch(event);
        settle(&sinks, event, FailureMask::MAX, failed, &mut backlog);
    }
    // Traffic from the next partition arrives in that partition's stream
    // order, after every event of this one.
    if let Some(rx) = inbound {
        for forward in rx {
            match forward {
                Forward::End(event, mask) => {
                    let failed = sinks.redispatch(&event, mask);
                    settle(&sinks, &event, mask, failed, &mut backlog);
                }
                Forward::Purge(event, mask) => {
                    sinks.purge(&event, mask);
                    backlog.push(forward);
                }
            }
        }
    }
    match outbound {
        Some(tx) => {
            for forward in backlog {
                if tx.send(forward).is_err() {
                    break;
                }
            }
        }
        None => {
            for forward in &backlog {
                if let Forward::End(event, mask) = forward {
                    sinks.record_unmatched(event, *mask);
                }
            }
        }
    }
    sinks.finalize();
    sinks
}

pub(crate) fn run_partitions(events: &[Event], ranges: &[std::ops::Range<usize>], sinks: &mut SinkSet) {
    if ranges.len() <= 1 {
        run_sequential(events, sinks);
        return;
    }
    tracing::debug!(partitions = ranges.len(), events = events.len(), "pairing in parallel");

    // Channel i carries failures from worker i + 1 to worker i.
    let mut senders = Vec::with_capacity(ranges.len());
    let mut receivers = Vec::with_capacity(ranges.len());
    for _ in 1..ranges.len() {
        let (tx, rx) = mpsc::sync_channel::<Forward>(FORWARD_QUEUE);
        senders.push(Some(tx));
        receivers.push(Some(rx));
    }
    receivers.push(None);
    senders.insert(0, None);

    let results: Vec<SinkSet> = thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .iter()
            .zip(receivers)
            .zip(senders)
            .map(|((range, inbound), outbound)| {
                let local = sinks.fresh_clone();
                let slice = &events[range.clone()];
                scope.spawn(move || worker(local, slice, inbound, outbound))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    for local in results {
        local.merge_into(sinks);
    }
    sinks.finalize();
    sinks.sort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::fixtures::event;
    use crate::codes::cqm;
    use crate::engine::EngineType;

    fn stream() -> Vec<Event> {
        let mut events = Vec::new();
        let mut cycle = 0;
        for pid in 0..200_u32 {
            let engine_index = pid % 3;
            let mut push = |ty, code, pid| {
                cycle += 10;
                events.push(event(ty, 0, engine_index, code, pid, cycle));
            };
            push(EngineType::Cqm, cqm::DBG_PACKET_OP_START, pid * 2);
            push(EngineType::Ts, 5, pid);
            push(EngineType::Cqm, cqm::CMD_PACKET_START, pid * 2);
            push(EngineType::Ts, 4, pid);
            push(EngineType::Cqm, cqm::CMD_PACKET_END, pid * 2);
            push(EngineType::Cqm, cqm::DBG_PACKET_OP_END, pid * 2 + 1);
        }
        // A stray end and a start that never closes.
        events.push(event(EngineType::Ts, 0, 0, 6, 999, 1_000_000));
        events.push(event(EngineType::Ts, 0, 0, 7, 998, 1_000_010));
        events
    }

    fn sequential(events: &[Event]) -> SinkSet {
        let mut sinks = SinkSet::new(&PairingConfig::default());
        run_sequential(events, &mut sinks);
        sinks
    }

    fn assert_same(a: &SinkSet, b: &SinkSet) {
        for (x, y) in a.engines().iter().zip(b.engines()) {
            assert_eq!(x.activities(), y.activities(), "{:?}", x.detector());
            assert_eq!(x.dangling(), y.dangling(), "{:?}", x.detector());
            assert_eq!(x.stats(), y.stats(), "{:?}", x.detector());
        }
    }

    #[test]
    fn partitions_cover_input() {
        assert_eq!(partition(0, 4), vec![0..0]);
        assert_eq!(partition(999, 4), vec![0..999]);
        assert_eq!(partition(2500, 8), vec![0..1250, 1250..2500]);
        assert_eq!(partition(10_000, 3), vec![0..3334, 3334..6667, 6667..10_000]);
    }

    #[test]
    fn sharded_equals_sequential() {
        let events = stream();
        let expected = sequential(&events);
        let mut sharded = SinkSet::new(&PairingConfig::default());
        run_partitions(&events, &partition_with(events.len(), 7, 50), &mut sharded);
        assert_same(&sharded, &expected);
        assert_eq!(sharded.engine(Detector::DebugOp).unwrap().stats().paired, 200);
        assert_eq!(sharded.engine(Detector::Firmware).unwrap().stats().unmatched_ends, 1);
    }

    #[test]
    fn end_pairs_with_start_several_partitions_back() {
        let mut events = vec![event(EngineType::Ts, 0, 0, 5, 1, 0)];
        events.extend((1..40).map(|c| event(EngineType::Sip, 0, 0, 40, 0, c)));
        events.push(event(EngineType::Ts, 0, 0, 4, 1, 40));

        let mut sinks = SinkSet::new(&PairingConfig::default());
        run_partitions(&events, &partition_with(events.len(), 4, 10), &mut sinks);
        let fw = sinks.engine(Detector::Firmware).unwrap();
        assert_eq!(fw.activities().len(), 1);
        assert_eq!(fw.activities()[0].duration(), 40);
        assert_eq!(fw.stats().unmatched_ends, 0);
        assert_eq!(fw.dangling().len(), 0);
    }

    #[test]
    fn purge_reaches_stale_start_in_earlier_partition() {
        let dbg = |code, pid, cycle| event(EngineType::Cqm, 0, 0, code, pid, cycle);
        let mut events = vec![dbg(cqm::DBG_PACKET_OP_START, 10, 0)];
        events.extend((1..20).map(|c| event(EngineType::Sip, 0, 0, 40, 0, c)));
        events.push(dbg(cqm::DBG_PACKET_OP_START, 10, 20));
        events.push(dbg(cqm::DBG_PACKET_OP_END, 11, 21));

        let expected = sequential(&events);
        let ops = expected.engine(Detector::DebugOp).unwrap().stats();
        assert_eq!((ops.paired, ops.purged, ops.dangling_starts), (1, 1, 0));

        let mut sharded = SinkSet::new(&PairingConfig::default());
        run_partitions(&events, &partition_with(events.len(), 2, 10), &mut sharded);
        assert_same(&sharded, &expected);
    }

    #[test]
    fn purge_follows_forwarded_end_across_partitions() {
        let dbg = |code, pid, cycle| event(EngineType::Cqm, 0, 0, code, pid, cycle);
        let filler = |c| event(EngineType::Sip, 0, 0, 40, 0, c);
        let mut events = vec![dbg(cqm::DBG_PACKET_OP_START, 10, 0)];
        events.extend((1..10).map(filler));
        events.push(dbg(cqm::DBG_PACKET_OP_START, 10, 10));
        events.extend((11..20).map(filler));
        events.extend((20..29).map(filler));
        events.push(dbg(cqm::DBG_PACKET_OP_END, 11, 29));

        let expected = sequential(&events);
        let ops = expected.engine(Detector::DebugOp).unwrap();
        assert_eq!(ops.activities()[0].start().cycle, 10);
        assert_eq!(ops.stats().purged, 1);

        let mut sharded = SinkSet::new(&PairingConfig::default());
        run_partitions(&events, &partition_with(events.len(), 3, 10), &mut sharded);
        assert_same(&sharded, &expected);
    }

    #[test]
    fn failure_mask_names_rejecting_sinks() {
        let mut sinks = SinkSet::new(&PairingConfig::default());
        let stray = event(EngineType::Ts, 0, 0, 4, 1, 10);
        assert_eq!(sinks.dispatch(&stray), 1 << 0);
    }

    #[test]
    fn redispatch_only_touches_masked_sinks() {
        let mut sinks = SinkSet::new(&PairingConfig::default());
        let start = event(EngineType::Cqm, 0, 0, cqm::DBG_PACKET_OP_START, 4, 10);
        assert_eq!(sinks.dispatch(&start), 0);
        let end = event(EngineType::Cqm, 0, 0, cqm::DBG_PACKET_OP_END, 5, 20);
        assert_eq!(sinks.redispatch(&end, 1 << 1), 0);
        assert_eq!(sinks.engine(Detector::DebugOp).unwrap().activities().len(), 1);
        let fw = sinks.engine(Detector::Firmware).unwrap();
        assert!(fw.activities().is_empty());
        assert_eq!(fw.pending(), 1);
    }

    #[test]
    fn small_input_stays_sequential() {
        let events = stream();
        let mut sinks = SinkSet::new(&PairingConfig::default());
        run_sharded(&events, 16, &mut sinks);
        assert_same(&sinks, &sequential(&events));
    }
}
