//! Event code dictionaries.
//!
//! Firmware start codes are odd and their end codes are the next even value
//! down. DMA engines encode start/end in the low two bits instead.

use crate::engine::EngineType;

/// Command queue manager (and GSYNC) codes.
pub mod cqm {
    pub const SLEEP_START: u32 = 0x1;
    pub const SLEEP_END: u32 = 0x0;
    pub const EXECUTABLE_START: u32 = 0x3;
    pub const EXECUTABLE_END: u32 = 0x2;
    pub const LOOP_TASK_START: u32 = 0x5;
    pub const LOOP_TASK_END: u32 = 0x4;
    pub const CMD_PACKET_START: u32 = 0x7;
    pub const CMD_PACKET_END: u32 = 0x6;
    pub const DBG_PACKET_OP_START: u32 = 0x9;
    pub const DBG_PACKET_OP_END: u32 = 0x8;
    pub const DBG_PACKET_STEP_START: u32 = 0xb;
    pub const DBG_PACKET_STEP_END: u32 = 0xa;
    pub const SIGNAL_COUNTER: u32 = 0xd;
    pub const WAIT_COUNTER: u32 = 0xc;
    pub const WRITE_MEMORY: u32 = 0xf;
    pub const WAIT_MEMORY: u32 = 0xe;
}

/// Task scheduler codes.
pub mod ts {
    pub const CMD_PACKET_START: u32 = 1;
    pub const CMD_PACKET_END: u32 = 0;
    pub const CQM_EXECUTABLE_LAUNCH_START: u32 = 23;
    pub const CQM_EXECUTABLE_LAUNCH_END: u32 = 22;
}

/// DMA codes, significant in the low two bits only.
pub mod dma {
    pub const BUSY_START: u32 = 0;
    pub const BUSY_END: u32 = 1;
    pub const VC_EXEC_START: u32 = 2;
    pub const VC_EXEC_END: u32 = 3;
    pub const PHASE_MASK: u32 = 0x3;
}

const CQM_NAMES: &[(u32, &str)] = &[
    (0x1, "CQM_SLEEP_START"),
    (0x0, "CQM_SLEEP_END"),
    (0x3, "CQM_EXECUTABLE_START"),
    (0x2, "CQM_EXECUTABLE_END"),
    (0x5, "CQM_LOOP_TASK_START"),
    (0x4, "CQM_LOOP_TASK_END"),
    (0x7, "CQM_CMD_PACKET_START"),
    (0x6, "CQM_CMD_PACKET_END"),
    (0x9, "CQM_DBG_PACKET_OP_START"),
    (0x8, "CQM_DBG_PACKET_OP_END"),
    (0xb, "CQM_DBG_PACKET_STEP_START"),
    (0xa, "CQM_DBG_PACKET_STEP_END"),
    (0xd, "CQM_SIGNAL_COUNTER"),
    (0xc, "CQM_WAIT_COUNTER"),
    (0xf, "CQM_WRITE_MEMORY"),
    (0xe, "CQM_WAIT_MEMORY"),
];

const TS_NAMES: &[(u32, &str)] = &[
    (1, "TS_CMD_PACKET_START"),
    (0, "TS_CMD_PACKET_END"),
    (3, "TS_PARSE_STREAM_START"),
    (2, "TS_PARSE_STREAM_END"),
    (5, "TS_READ_PACKET_START"),
    (4, "TS_READ_PACKET_END"),
    (7, "TS_PARSE_GDMA_START"),
    (6, "TS_PARSE_GDMA_END"),
    (9, "TS_ISR_START"),
    (8, "TS_ISR_END"),
    (11, "TS_REGISTER_WRITE_START"),
    (10, "TS_REGISTER_WRITE_END"),
    (13, "TS_MEMORY_WRITE_START"),
    (12, "TS_MEMORY_WRITE_END"),
    (15, "TS_REGISTER_WAIT_START"),
    (14, "TS_REGISTER_WAIT_END"),
    (17, "TS_MEMORY_WAIT_START"),
    (16, "TS_MEMORY_WAIT_END"),
    (19, "TS_VG_CONFIG_START"),
    (18, "TS_VG_CONFIG_END"),
    (21, "TS_PARSE_EDMA_START"),
    (20, "TS_PARSE_EDMA_END"),
    (23, "TS_CQM_EXECUTABLE_LAUNCH_START"),
    (22, "TS_CQM_EXECUTABLE_LAUNCH_END"),
    (25, "TS_HCVG_EXECUTABLE_LAUNCH_START"),
    (24, "TS_HCVG_EXECUTABLE_LAUNCH_END"),
    (27, "TS_VDEC_EXECUTABLE_LAUNCH_START"),
    (26, "TS_VDEC_EXECUTABLE_LAUNCH_END"),
    (29, "TS_WAIT_STREAM_START"),
    (28, "TS_WAIT_STREAM_END"),
    (31, "TS_RECORD_STREAM_START"),
    (30, "TS_RECORD_STREAM_END"),
];

const DMA_NAMES: [&str; 4] = [
    "DMA_BUSY_START",
    "DMA_BUSY_END",
    "DMA_VC_EXEC_START",
    "DMA_VC_EXEC_END",
];

fn lookup(table: &[(u32, &'static str)], code: u32) -> Option<&'static str> {
    table
        .iter()
        .find_map(|&(value, name)| (value == code).then_some(name))
}

/// Symbolic name of an event code, if the engine class has a dictionary.
pub fn event_name(engine_type: EngineType, code: u32) -> Option<&'static str> {
    match engine_type {
        EngineType::Cqm | EngineType::Gsync => lookup(CQM_NAMES, code),
        EngineType::Ts => lookup(TS_NAMES, code),
        EngineType::Sdma | EngineType::Cdma => Some(DMA_NAMES[(code & dma::PHASE_MASK) as usize]),
        _ => None,
    }
}

/// Whether a CQM-class event opens a debug op.
pub const fn is_debug_op_start(engine_type: EngineType, code: u32) -> bool {
    engine_type.is_cqm_like() && code == cqm::DBG_PACKET_OP_START
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_cqm_and_ts() {
        assert_eq!(
            event_name(EngineType::Gsync, cqm::DBG_PACKET_OP_START),
            Some("CQM_DBG_PACKET_OP_START")
        );
        assert_eq!(
            event_name(EngineType::Ts, ts::CQM_EXECUTABLE_LAUNCH_END),
            Some("TS_CQM_EXECUTABLE_LAUNCH_END")
        );
        assert_eq!(event_name(EngineType::Cqm, 0x40), None);
        assert_eq!(event_name(EngineType::Sip, 1), None);
    }

    #[test]
    fn dma_names_use_low_bits() {
        assert_eq!(event_name(EngineType::Sdma, 0x16), Some("DMA_VC_EXEC_START"));
        assert_eq!(event_name(EngineType::Cdma, 0x17), Some("DMA_VC_EXEC_END"));
    }

    #[test]
    fn firmware_pairs_differ_by_one() {
        for table in [CQM_NAMES, TS_NAMES] {
            for &(code, name) in table {
                if let Some(stem) = name.strip_suffix("_START") {
                    let end = lookup(table, code - 1).unwrap();
                    assert_eq!(end, format!("{stem}_END"));
                }
            }
        }
    }

    #[test]
    fn debug_op_start_is_cqm_only() {
        assert!(is_debug_op_start(EngineType::Cqm, 9));
        assert!(is_debug_op_start(EngineType::Gsync, 9));
        assert!(!is_debug_op_start(EngineType::Ts, 9));
        assert!(!is_debug_op_start(EngineType::Cqm, 8));
    }
}
