//! Paired start/end events.

use serde::Serialize;

use crate::event::Event;
use crate::pairing::ChannelKey;

/// Which detector produced an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Op,
    Firmware,
    Dma,
    TaskLaunch,
    Kernel,
}

impl ActivityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Op => "op",
            Self::Firmware => "firmware",
            Self::Dma => "dma",
            Self::TaskLaunch => "task_launch",
            Self::Kernel => "kernel",
        }
    }
}

/// A matched (start, end) pair on one channel.
///
/// Cycle bounds start out as the two events' cycles and only ever widen,
/// when activities of one lane are coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    kind: ActivityKind,
    start: Event,
    end: Event,
    start_cycle: u64,
    end_cycle: u64,
}

impl Activity {
    pub(crate) const fn pair(kind: ActivityKind, start: Event, end: Event) -> Self {
        Self {
            kind,
            start,
            end,
            start_cycle: start.cycle,
            end_cycle: end.cycle,
        }
    }

    /// A zero-length activity standing for a single marker event.
    pub(crate) const fn marker(kind: ActivityKind, event: Event) -> Self {
        Self::pair(kind, event, event)
    }

    pub const fn kind(&self) -> ActivityKind {
        self.kind
    }

    pub const fn start(&self) -> &Event {
        &self.start
    }

    pub const fn end(&self) -> &Event {
        &self.end
    }

    pub const fn start_cycle(&self) -> u64 {
        self.start_cycle
    }

    pub const fn end_cycle(&self) -> u64 {
        self.end_cycle
    }

    /// Signed cycle count; negative means the pair was matched out of order.
    #[expect(
        clippy::cast_possible_wrap,
        reason = "two's complement difference is the signed duration"
    )]
    pub const fn duration(&self) -> i64 {
        self.end_cycle.wrapping_sub(self.start_cycle) as i64
    }

    pub const fn channel(&self) -> ChannelKey {
        self.start.channel()
    }

    pub fn is_marker(&self) -> bool {
        self.start == self.end
    }

    /// Packet id used for metadata lookups.
    pub const fn packet_id(&self) -> u32 {
        self.start.packet_id
    }

    /// Extends the cycle range to cover `other`.
    pub(crate) fn widen(&mut self, other: &Self) {
        self.start_cycle = self.start_cycle.min(other.start_cycle);
        self.end_cycle = self.end_cycle.max(other.end_cycle);
    }

    pub(crate) fn sort_key(&self) -> (u64, u64, usize) {
        (self.start_cycle, self.end_cycle, self.start.offset_index)
    }
}
