//! Channel keys and per-channel pending lists.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::event::Event;
use crate::topology::{CONTEXT_BITS, MASTER_VALUE_BITS};

/// Number of distinct channel keys.
pub const CHANNEL_COUNT: usize = 1 << (MASTER_VALUE_BITS + CONTEXT_BITS);

const CONTEXT_MASK: u32 = (1 << CONTEXT_BITS) - 1;
const MASTER_MASK: u32 = (1 << MASTER_VALUE_BITS) - 1;

/// Packed `(master value, context)` demultiplexing coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKey(u16);

impl ChannelKey {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "master and context are masked to 14 bits"
    )]
    pub const fn new(master: u32, context: u8) -> Self {
        Self((((master & MASTER_MASK) << CONTEXT_BITS) | (context as u32 & CONTEXT_MASK)) as u16)
    }

    pub const fn master(self) -> u32 {
        self.0 as u32 >> CONTEXT_BITS
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "context is masked to 4 bits"
    )]
    pub const fn context(self) -> u8 {
        (self.0 as u32 & CONTEXT_MASK) as u8
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.master(), self.context())
    }
}

/// Unmatched starts of one channel, most recent first.
#[derive(Debug, Clone, Default)]
pub struct PendingList {
    starts: VecDeque<Event>,
}

impl PendingList {
    pub fn push(&mut self, start: Event) {
        self.starts.push_front(start);
    }

    /// Removes and returns the most recent start accepted by `matches`.
    pub fn take_first(&mut self, mut matches: impl FnMut(&Event) -> bool) -> Option<Event> {
        let pos = self.starts.iter().position(|start| matches(start))?;
        self.starts.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Empties the list, oldest first.
    pub fn drain_oldest_first(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.starts.drain(..).rev()
    }
}
