//! Device-cycle to host-time alignment.
//!
//! PCIE records carry a sync index alongside the device cycle; the host side
//! logs the same index with its own clock. Joining the two lists by sync
//! index yields a correspondence table that device cycles are interpolated
//! against.

use std::collections::HashMap;

use serde::Serialize;

use crate::engine::EngineType;
use crate::event::{Event, Format};

/// A sync index observed on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceSyncPoint {
    pub cycle: u64,
    pub sync_index: u32,
}

/// A sync index logged by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostTimepoint {
    pub cluster_id: u32,
    pub host_time: u64,
    pub sync_index: u32,
}

/// One device/host correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncPoint {
    pub device_cycle: u64,
    pub host_time: u64,
    pub sync_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimelineError {
    #[error("aligned timeline is not strictly increasing in {field} at point {position}")]
    AlignmentInvariantViolated { position: usize, field: &'static str },

    #[error("device and host share no sync points")]
    NoSyncPoints,
}

/// Counts of cycles that could and could not be mapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimelineStats {
    pub mapped: u64,
    pub unmappable: u64,
}

/// Gathers device sync points from PCIE records during pairing.
#[derive(Debug, Clone, Default)]
pub struct SyncCollector {
    points: Vec<DeviceSyncPoint>,
}

impl SyncCollector {
    pub fn subscribes(engine_type: EngineType) -> bool {
        engine_type == EngineType::Pcie
    }

    pub fn observe(&mut self, event: &Event) {
        if event.engine_type == EngineType::Pcie && event.format == Format::V1 {
            self.points.push(DeviceSyncPoint {
                cycle: event.cycle,
                sync_index: event.sync_index(),
            });
        }
    }

    pub fn fresh_clone(&self) -> Self {
        Self::default()
    }

    pub fn merge_into(mut self, canonical: &mut Self) {
        canonical.points.append(&mut self.points);
    }

    pub fn points(&self) -> &[DeviceSyncPoint] {
        &self.points
    }
}

/// Longest prefix whose keys strictly increase.
pub fn monotonic_prefix<T>(points: &[T], key: impl Fn(&T) -> u32) -> &[T] {
    let len = points
        .windows(2)
        .position(|w| key(&w[1]) <= key(&w[0]))
        .map_or(points.len(), |pos| pos + 1);
    &points[..len]
}

/// Aligned device/host correspondence table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    aligned: Vec<SyncPoint>,
}

impl Timeline {
    /// Trims both lists to their first well-ordered run and joins them.
    pub fn build(device: &[DeviceSyncPoint], host: &[HostTimepoint]) -> Self {
        let device_run = monotonic_prefix(device, |p| p.sync_index);
        let host_run = monotonic_prefix(host, |p| p.sync_index);
        if device_run.len() < device.len() || host_run.len() < host.len() {
            tracing::warn!(
                device_dropped = device.len() - device_run.len(),
                host_dropped = host.len() - host_run.len(),
                "trimmed non-monotonic sync point tail"
            );
        }

        let host_by_index: HashMap<u32, u64> = host_run
            .iter()
            .map(|p| (p.sync_index, p.host_time))
            .collect();
        let aligned: Vec<SyncPoint> = device_run
            .iter()
            .filter_map(|d| {
                host_by_index.get(&d.sync_index).map(|&host_time| SyncPoint {
                    device_cycle: d.cycle,
                    host_time,
                    sync_index: d.sync_index,
                })
            })
            .collect();
        tracing::debug!(
            device = device_run.len(),
            host = host_run.len(),
            aligned = aligned.len(),
            "built timeline"
        );
        Self { aligned }
    }

    pub const fn from_points(aligned: Vec<SyncPoint>) -> Self {
        Self { aligned }
    }

    pub fn points(&self) -> &[SyncPoint] {
        &self.aligned
    }

    pub fn is_empty(&self) -> bool {
        self.aligned.is_empty()
    }

    /// Confirms every column strictly increases. A failure means the table
    /// must not be used for export.
    pub fn verify(&self) -> Result<(), TimelineError> {
        if self.aligned.is_empty() {
            return Err(TimelineError::NoSyncPoints);
        }
        for (pos, w) in self.aligned.windows(2).enumerate() {
            let field = if w[1].sync_index <= w[0].sync_index {
                Some("sync_index")
            } else if w[1].host_time <= w[0].host_time {
                Some("host_time")
            } else if w[1].device_cycle <= w[0].device_cycle {
                Some("device_cycle")
            } else {
                None
            };
            if let Some(field) = field {
                return Err(TimelineError::AlignmentInvariantViolated {
                    position: pos + 1,
                    field,
                });
            }
        }
        Ok(())
    }

    /// Interpolates a device cycle to host time; `None` outside the table.
    pub fn map_to_host_time(&self, cycle: u64) -> Option<u64> {
        let first = self.aligned.first()?;
        let last = self.aligned.last()?;
        if cycle < first.device_cycle || cycle > last.device_cycle {
            return None;
        }
        let idx = self.aligned.partition_point(|p| p.device_cycle <= cycle) - 1;
        let lo = self.aligned[idx];
        let Some(hi) = self.aligned.get(idx + 1) else {
            return Some(lo.host_time);
        };
        if hi.device_cycle == lo.device_cycle {
            return Some(lo.host_time);
        }

        let offset = i128::from(cycle - lo.device_cycle);
        let host_span = i128::from(hi.host_time) - i128::from(lo.host_time);
        let cycle_span = i128::from(hi.device_cycle - lo.device_cycle);
        let host = i128::from(lo.host_time) + offset * host_span / cycle_span;
        u64::try_from(host).ok()
    }

    /// Maps both ends of a cycle range, counting the outcome.
    pub fn map_span(&self, start: u64, end: u64, stats: &mut TimelineStats) -> Option<(u64, u64)> {
        let mapped = self
            .map_to_host_time(start)
            .zip(self.map_to_host_time(end));
        if mapped.is_some() {
            stats.mapped += 1;
        } else {
            stats.unmappable += 1;
        }
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(sync_index: u32, device_cycle: u64, host_time: u64) -> SyncPoint {
        SyncPoint {
            device_cycle,
            host_time,
            sync_index,
        }
    }

    fn dev(sync_index: u32, cycle: u64) -> DeviceSyncPoint {
        DeviceSyncPoint { cycle, sync_index }
    }

    fn host(sync_index: u32, host_time: u64) -> HostTimepoint {
        HostTimepoint {
            cluster_id: 0,
            host_time,
            sync_index,
        }
    }

    #[test]
    fn interpolates_between_two_points() {
        let tl = Timeline::from_points(vec![point(1, 100, 1000), point(2, 200, 2000)]);
        assert_eq!(tl.map_to_host_time(150), Some(1500));
        assert_eq!(tl.map_to_host_time(100), Some(1000));
        assert_eq!(tl.map_to_host_time(200), Some(2000));
    }

    #[test]
    fn outside_range_is_unmappable() {
        let tl = Timeline::from_points(vec![point(1, 100, 1000), point(2, 200, 2000)]);
        assert_eq!(tl.map_to_host_time(99), None);
        assert_eq!(tl.map_to_host_time(201), None);
        assert_eq!(Timeline::default().map_to_host_time(0), None);
    }

    #[test]
    fn mapping_is_monotonic() {
        let tl = Timeline::from_points(vec![
            point(1, 0, 5_000),
            point(2, 1_000, 5_333),
            point(3, 7_000, 9_000),
            point(4, 7_001, 1_000_000),
        ]);
        let mut prev = 0;
        for cycle in 0..=7_001 {
            let host = tl.map_to_host_time(cycle).unwrap();
            assert!(host >= prev, "cycle {cycle}: {host} < {prev}");
            prev = host;
        }
    }

    #[test]
    fn large_spans_do_not_overflow() {
        let tl = Timeline::from_points(vec![
            point(1, 0, 1_700_000_000_000_000_000),
            point(2, u64::MAX / 2, 1_700_000_100_000_000_000),
        ]);
        let mid = tl.map_to_host_time(u64::MAX / 4).unwrap();
        assert!((1_700_000_049_999_999_999..=1_700_000_050_000_000_000).contains(&mid));
    }

    #[test]
    fn trims_to_first_monotonic_run() {
        let device = [dev(1, 10), dev(2, 20), dev(3, 30), dev(1, 40), dev(2, 50)];
        let hosts = [host(1, 100), host(2, 200), host(3, 300)];
        let tl = Timeline::build(&device, &hosts);
        assert_eq!(
            tl.points(),
            &[point(1, 10, 100), point(2, 20, 200), point(3, 30, 300)]
        );
        assert!(tl.verify().is_ok());
    }

    #[test]
    fn join_skips_indices_missing_on_host() {
        let device = [dev(1, 10), dev(2, 20), dev(3, 30)];
        let hosts = [host(1, 100), host(3, 300)];
        let tl = Timeline::build(&device, &hosts);
        assert_eq!(tl.points(), &[point(1, 10, 100), point(3, 30, 300)]);
    }

    #[test]
    fn verify_rejects_non_increasing_host_time() {
        let tl = Timeline::from_points(vec![point(1, 10, 100), point(2, 20, 100)]);
        assert_eq!(
            tl.verify().unwrap_err(),
            TimelineError::AlignmentInvariantViolated {
                position: 1,
                field: "host_time"
            }
        );
    }

    #[test]
    fn verify_rejects_empty_table() {
        assert_eq!(Timeline::default().verify(), Err(TimelineError::NoSyncPoints));
    }

    #[test]
    fn monotonic_prefix_keeps_head() {
        let keys = [3, 5, 9, 9, 10];
        assert_eq!(monotonic_prefix(&keys, |k| *k), &[3, 5, 9]);
        assert!(monotonic_prefix::<u32>(&[], |k| *k).is_empty());
    }

    #[test]
    fn map_span_counts_outcomes() {
        let tl = Timeline::from_points(vec![point(1, 100, 1000), point(2, 200, 2000)]);
        let mut stats = TimelineStats::default();
        assert_eq!(tl.map_span(110, 120, &mut stats), Some((1100, 1200)));
        assert_eq!(tl.map_span(110, 220, &mut stats), None);
        assert_eq!(stats, TimelineStats { mapped: 1, unmappable: 1 });
    }

    #[test]
    fn collector_keeps_only_pcie_v1() {
        use crate::topology::{Arch, Topology};
        let topo = Topology::new(Arch::Dorado).unwrap();
        let mut sync = SyncCollector::default();
        sync.observe(&crate::event::decode(&[4, 0x2c0, 77, 0], 0, &topo).unwrap());
        sync.observe(&crate::event::decode(&[5, 0x2c0, 78, 0], 1, &topo).unwrap());
        sync.observe(&crate::event::decode(&[4, 0x300, 79, 0], 2, &topo).unwrap());
        assert_eq!(sync.points(), &[dev(2, 77)]);
    }
}
