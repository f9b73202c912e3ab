//! Decode command for printing the events of a record file.

use std::io::Write;

use anyhow::Result;

use dpf_core::{DecodeStats, EngineType, Topology, decode_chunk};

/// What to print out of a decoded buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter {
    pub limit: Option<usize>,
    pub engine: Option<EngineType>,
}

pub fn run<W: Write>(
    writer: &mut W,
    bytes: &[u8],
    topology: &Topology,
    filter: Filter,
    print_quota: usize,
) -> Result<DecodeStats> {
    let (events, stats) = decode_chunk(bytes, topology, print_quota);
    let shown = events
        .iter()
        .filter(|e| filter.engine.is_none_or(|ty| e.engine_type == ty))
        .take(filter.limit.unwrap_or(usize::MAX));
    for event in shown {
        writeln!(writer, "{} {event}", event.raw_repr())?;
    }
    writeln!(writer, "{stats}")?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    use dpf_core::Arch;

    fn record(words: [u32; 4]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(record([0x0132_9c0e, 0x5148, 10, 0]));
        bytes.extend(record([0x4, 0x2c0, 11, 0]));
        bytes.extend(record([0x12, 0x3ff, 12, 0]));
        bytes.extend(record([0x0132_9c0c, 0x5148, 13, 0]));
        bytes
    }

    #[test]
    fn decode_command_prints_events_and_stats() {
        let topology = Topology::new(Arch::Dorado).unwrap();
        let mut output = Vec::new();
        let stats = run(&mut output, &sample(), &topology, Filter::default(), 10).unwrap();
        assert_eq!((stats.decoded, stats.unresolved), (3, 1));

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("[00000000: 01329c0e 00005148 0000000a 00000000] CQM 1.2 ctx=5 "));
        assert_eq!(lines[1], "[00000010: 00000004 000002c0 0000000b 00000000] PCIE 2.0 sync=2 cycle=11");
        assert_eq!(lines[3], "records=4 decoded=3 malformed=0 unresolved=1");
    }

    #[test]
    fn engine_filter_and_limit() {
        let topology = Topology::new(Arch::Dorado).unwrap();
        let filter = Filter {
            limit: Some(1),
            engine: Some(EngineType::Cqm),
        };
        let mut output = Vec::new();
        run(&mut output, &sample(), &topology, filter, 10).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.starts_with("[00000000:"));
    }
}
