//! Channel pairing engine.
//!
//! Events are demultiplexed by [`ChannelKey`]. Each channel keeps the starts
//! it has not closed yet, most recent first, and an end closes the first
//! start its [`Detector`] accepts. Nested scopes therefore close innermost
//! first.
//!
//! Engines are cloned blank for parallel workers and merged back in
//! partition order, see [`crate::shard`].

mod channel;
mod detector;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

pub use channel::{CHANNEL_COUNT, ChannelKey, PendingList};
pub use detector::{Detector, Mark, virtual_channel};

use crate::activity::Activity;
use crate::engine::EngineType;
use crate::event::Event;

/// Configuration for pairing diagnostics.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Maximum unmatched ends kept for diagnosis.
    /// Default: 30.
    pub sample_limit: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { sample_limit: 30 }
    }
}

/// Errors reported for a single dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("unmatched end at record {offset_index} on channel {channel}")]
    UnmatchedEnd { offset_index: usize, channel: ChannelKey },
}

/// Aggregate pairing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PairingStats {
    pub starts: u64,
    pub paired: u64,
    pub terminators: u64,
    pub unmatched_ends: u64,
    pub dangling_starts: u64,
    pub negative_durations: u64,
    /// Stale starts discarded by a purging detector.
    pub purged: u64,
}

impl PairingStats {
    fn absorb(&mut self, other: &Self) {
        self.starts += other.starts;
        self.paired += other.paired;
        self.terminators += other.terminators;
        self.unmatched_ends += other.unmatched_ends;
        self.dangling_starts += other.dangling_starts;
        self.negative_durations += other.negative_durations;
        self.purged += other.purged;
    }
}

impl fmt::Display for PairingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "starts={} paired={} terminators={} unmatched_ends={} dangling={}",
            self.starts, self.paired, self.terminators, self.unmatched_ends, self.dangling_starts
        )?;
        if self.negative_durations > 0 {
            write!(f, " negative_durations={}", self.negative_durations)?;
        }
        if self.purged > 0 {
            write!(f, " purged={}", self.purged)?;
        }
        Ok(())
    }
}

/// Pairs starts and ends for one detector.
#[derive(Debug, Clone)]
pub struct PairingEngine {
    detector: Detector,
    config: PairingConfig,
    channels: BTreeMap<ChannelKey, PendingList>,
    activities: Vec<Activity>,
    dangling: Vec<Event>,
    unmatched: Vec<Event>,
    stats: PairingStats,
    finalized: bool,
}

impl PairingEngine {
    pub const fn new(detector: Detector, config: PairingConfig) -> Self {
        Self {
            detector,
            config,
            channels: BTreeMap::new(),
            activities: Vec::new(),
            dangling: Vec::new(),
            unmatched: Vec::new(),
            stats: PairingStats {
                starts: 0,
                paired: 0,
                terminators: 0,
                unmatched_ends: 0,
                dangling_starts: 0,
                negative_durations: 0,
                purged: 0,
            },
            finalized: false,
        }
    }

    pub const fn detector(&self) -> Detector {
        self.detector
    }

    pub fn subscribes(&self, engine_type: EngineType) -> bool {
        self.detector.subscribes(engine_type)
    }

    /// Feeds one event without recording failures.
    ///
    /// An unmatched end leaves every pending list untouched and is returned
    /// to the caller, who either forwards it or calls
    /// [`record_unmatched`](Self::record_unmatched).
    pub fn dispatch(&mut self, event: &Event) -> Result<(), PairingError> {
        match self.detector.classify(event) {
            Mark::Ignore => {}
            Mark::Start => {
                self.stats.starts += 1;
                self.channels.entry(event.channel()).or_default().push(*event);
            }
            Mark::Terminator => {
                self.stats.terminators += 1;
                self.activities
                    .push(Activity::marker(self.detector.activity_kind(), *event));
            }
            Mark::End => {
                let detector = self.detector;
                let unmatched = PairingError::UnmatchedEnd {
                    offset_index: event.offset_index,
                    channel: event.channel(),
                };
                let list = self.channels.get_mut(&event.channel()).ok_or_else(|| unmatched.clone())?;
                let start = list
                    .take_first(|start| detector.matches(start, event))
                    .ok_or(unmatched)?;
                if detector.purges_previous() {
                    self.purge(event);
                }
                let activity = Activity::pair(detector.activity_kind(), start, *event);
                if activity.duration() < 0 {
                    self.stats.negative_durations += 1;
                    tracing::warn!(
                        detector = ?detector,
                        start = %activity.start().raw_repr(),
                        end = %activity.end().raw_repr(),
                        "paired activity has negative duration"
                    );
                }
                self.stats.paired += 1;
                self.activities.push(activity);
            }
        }
        Ok(())
    }

    /// Drops every pending start on `end`'s channel that `end` would close.
    ///
    /// Only meaningful for a purging detector once `end` has paired. Parallel
    /// workers use it to replay a purge against an earlier partition.
    pub fn purge(&mut self, end: &Event) {
        let detector = self.detector;
        if let Some(list) = self.channels.get_mut(&end.channel()) {
            while list.take_first(|older| detector.matches(older, end)).is_some() {
                self.stats.purged += 1;
            }
        }
    }

    /// Whether a paired `event` purges older starts through this engine.
    pub fn purges_on(&self, event: &Event) -> bool {
        self.detector.purges_previous() && self.detector.classify(event) == Mark::End
    }

    /// Counts an end that will not be paired, keeping a bounded sample.
    pub fn record_unmatched(&mut self, event: &Event) {
        self.stats.unmatched_ends += 1;
        if self.unmatched.len() < self.config.sample_limit {
            self.unmatched.push(*event);
        }
    }

    /// Feeds one event, recording it as unmatched if no start closes it.
    pub fn process(&mut self, event: &Event) -> bool {
        match self.dispatch(event) {
            Ok(()) => true,
            Err(_) => {
                self.record_unmatched(event);
                false
            }
        }
    }

    /// Moves every start still pending into the dangling list.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        for list in self.channels.values_mut() {
            self.dangling.extend(list.drain_oldest_first());
        }
        self.channels.clear();
        self.stats.dangling_starts = self.dangling.len() as u64;
        self.finalized = true;
    }

    /// A blank engine with the same detector and configuration.
    pub fn fresh_clone(&self) -> Self {
        debug_assert!(
            self.channels.values().all(PendingList::is_empty),
            "cloning an engine with pending starts"
        );
        Self::new(self.detector, self.config.clone())
    }

    /// Appends this engine's results to `canonical`.
    pub fn merge_into(mut self, canonical: &mut Self) {
        self.finalize();
        canonical.activities.append(&mut self.activities);
        canonical.dangling.append(&mut self.dangling);
        let room = canonical.config.sample_limit.saturating_sub(canonical.unmatched.len());
        canonical.unmatched.extend(self.unmatched.into_iter().take(room));
        canonical.stats.absorb(&self.stats);
    }

    /// Orders results by cycle so that sharded and sequential runs agree.
    pub fn sort(&mut self) {
        self.activities.sort_by_key(Activity::sort_key);
        self.dangling.sort_by_key(|e| e.offset_index);
        self.unmatched.sort_by_key(|e| e.offset_index);
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    pub fn take_activities(&mut self) -> Vec<Activity> {
        std::mem::take(&mut self.activities)
    }

    pub fn dangling(&self) -> &[Event] {
        &self.dangling
    }

    pub fn unmatched_samples(&self) -> &[Event] {
        &self.unmatched
    }

    pub const fn stats(&self) -> PairingStats {
        self.stats
    }

    /// Starts currently waiting for an end.
    pub fn pending(&self) -> usize {
        self.channels.values().map(PendingList::len).sum()
    }
}
