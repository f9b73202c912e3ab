//! Start/end classification and matching rules.
//!
//! Every rule is a pure function of the events involved so that each
//! detector can be exercised without a pairing engine around it.

use std::fmt;

use serde::Serialize;

use crate::activity::ActivityKind;
use crate::codes::{self, cqm, dma, ts};
use crate::engine::EngineType;
use crate::event::{Event, Format};

/// Role of an event with respect to one detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Start,
    End,
    /// Packet-less marker that becomes an activity on its own.
    Terminator,
    Ignore,
}

/// Pairing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    /// Firmware trace points on CQM, GSYNC and TS.
    Firmware,
    /// CQM/GSYNC debug-op packets only.
    DebugOp,
    /// SDMA/CDMA virtual-channel execution.
    Dma,
    /// TS executable launches, keyed by task id.
    TaskLaunch,
    /// SIP kernel execution.
    Kernel,
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Detector {
    pub const ALL: [Self; 5] = [
        Self::Firmware,
        Self::DebugOp,
        Self::Dma,
        Self::TaskLaunch,
        Self::Kernel,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Firmware => "firmware",
            Self::DebugOp => "debug_op",
            Self::Dma => "dma",
            Self::TaskLaunch => "task_launch",
            Self::Kernel => "kernel",
        }
    }

    /// Engine types whose events this detector wants to see.
    pub const fn engine_types(self) -> &'static [EngineType] {
        match self {
            Self::Firmware => &[EngineType::Cqm, EngineType::Gsync, EngineType::Ts],
            Self::DebugOp => &[EngineType::Cqm, EngineType::Gsync],
            Self::Dma => &[EngineType::Sdma, EngineType::Cdma],
            Self::TaskLaunch => &[EngineType::Ts],
            Self::Kernel => &[EngineType::Sip],
        }
    }

    pub fn subscribes(self, engine_type: EngineType) -> bool {
        self.engine_types().contains(&engine_type)
    }

    /// After a match, whether older starts the same end would also close are
    /// discarded. Debug-op packets never nest, so stale starts left by a
    /// lost end are dropped instead of pairing with a later end.
    pub const fn purges_previous(self) -> bool {
        matches!(self, Self::DebugOp)
    }

    pub const fn activity_kind(self) -> ActivityKind {
        match self {
            Self::Firmware => ActivityKind::Firmware,
            Self::DebugOp => ActivityKind::Op,
            Self::Dma => ActivityKind::Dma,
            Self::TaskLaunch => ActivityKind::TaskLaunch,
            Self::Kernel => ActivityKind::Kernel,
        }
    }

    pub fn classify(self, event: &Event) -> Mark {
        if !self.subscribes(event.engine_type) {
            return Mark::Ignore;
        }
        let code = event.event_code;
        match (self, event.format) {
            (Self::Firmware, Format::V2) if event.engine_type.is_cqm_like() => Mark::Terminator,
            (Self::Firmware | Self::Kernel, Format::V1) => odd_even(code),
            (Self::DebugOp, Format::V1) => match code {
                cqm::DBG_PACKET_OP_START => Mark::Start,
                cqm::DBG_PACKET_OP_END => Mark::End,
                _ => Mark::Ignore,
            },
            (Self::Dma, Format::V1) => match code & dma::PHASE_MASK {
                dma::VC_EXEC_START => Mark::Start,
                dma::VC_EXEC_END => Mark::End,
                _ => Mark::Ignore,
            },
            (Self::TaskLaunch, Format::V2) => match code {
                ts::CQM_EXECUTABLE_LAUNCH_START => Mark::Start,
                ts::CQM_EXECUTABLE_LAUNCH_END => Mark::End,
                _ => Mark::Ignore,
            },
            _ => Mark::Ignore,
        }
    }

    /// Whether `end` closes `start`. Both are assumed to be on one channel.
    pub fn matches(self, start: &Event, end: &Event) -> bool {
        match self {
            Self::Firmware => {
                let pid_ok = if codes::is_debug_op_start(start.engine_type, start.event_code) {
                    start.packet_id.wrapping_add(1) == end.packet_id
                } else {
                    start.packet_id == end.packet_id
                };
                closes_code(start, end) && same_engine(start, end) && pid_ok
            }
            Self::DebugOp => {
                start.packet_id.wrapping_add(1) == end.packet_id && start.cluster_id == end.cluster_id
            }
            Self::Dma => {
                start.packet_id == end.packet_id
                    && start.cluster_id == end.cluster_id
                    && virtual_channel(start.event_code) == virtual_channel(end.event_code)
            }
            Self::TaskLaunch => start.payload == end.payload,
            Self::Kernel => {
                closes_code(start, end) && same_engine(start, end) && start.packet_id == end.packet_id
            }
        }
    }
}

const fn odd_even(code: u32) -> Mark {
    if code & 1 == 1 { Mark::Start } else { Mark::End }
}

fn closes_code(start: &Event, end: &Event) -> bool {
    start.event_code.checked_sub(1) == Some(end.event_code)
}

fn same_engine(a: &Event, b: &Event) -> bool {
    a.unique_index == b.unique_index && a.cluster_id == b.cluster_id
}

/// DMA virtual channel: the event code without its start/end bit.
pub const fn virtual_channel(code: u32) -> u32 {
    (code >> 1) & 0x7f
}
