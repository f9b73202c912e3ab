//! Raw record sources: binary record buffers and hex master-word text.

use std::fmt;

use rayon::prelude::*;
use serde::Serialize;

use crate::event::{self, DecodeError, Event, RECORD_SIZE};
use crate::topology::{ResolvedEngine, Topology, TopologyError};

/// Records decoded per parallel segment.
const SEGMENT_RECORDS: usize = 1 << 16;

/// Decode outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub records: u64,
    pub decoded: u64,
    pub malformed: u64,
    pub unresolved: u64,
}

impl DecodeStats {
    fn absorb(&mut self, other: &Self) {
        self.records += other.records;
        self.decoded += other.decoded;
        self.malformed += other.malformed;
        self.unresolved += other.unresolved;
    }
}

impl fmt::Display for DecodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records={} decoded={} malformed={} unresolved={}",
            self.records, self.decoded, self.malformed, self.unresolved
        )
    }
}

/// Logs decode failures until each class exhausts its quota.
#[derive(Debug)]
struct ErrorWatcher {
    quota: usize,
    malformed: usize,
    unresolved: usize,
}

impl ErrorWatcher {
    const fn new(quota: usize) -> Self {
        Self {
            quota,
            malformed: 0,
            unresolved: 0,
        }
    }

    fn report(&mut self, offset: usize, error: &DecodeError) {
        let seen = match error {
            DecodeError::MalformedInput { .. } => &mut self.malformed,
            DecodeError::UnresolvedEngine { .. } => &mut self.unresolved,
        };
        *seen += 1;
        if *seen <= self.quota {
            tracing::warn!(offset, error = %error, "failed to decode record");
        }
    }

    fn sum_up(&self, stats: &DecodeStats) {
        if stats.malformed + stats.unresolved > 0 {
            tracing::warn!(
                decoded = stats.decoded,
                malformed = stats.malformed,
                unresolved = stats.unresolved,
                "records failed to decode"
            );
        }
    }
}

#[derive(Debug, Default)]
struct Segment {
    events: Vec<Event>,
    stats: DecodeStats,
    /// Leading failures, at most one quota per segment.
    errors: Vec<(usize, DecodeError)>,
}

fn decode_segment(bytes: &[u8], first: usize, topology: &Topology, quota: usize) -> Segment {
    let mut seg = Segment {
        events: Vec::with_capacity(bytes.len() / RECORD_SIZE),
        ..Segment::default()
    };
    for (i, record) in bytes.chunks(RECORD_SIZE).enumerate() {
        let offset = first + i;
        seg.stats.records += 1;
        match event::decode_bytes(record, offset, topology) {
            Ok(ev) => {
                seg.stats.decoded += 1;
                seg.events.push(ev);
            }
            Err(e) => {
                match e {
                    DecodeError::MalformedInput { .. } => seg.stats.malformed += 1,
                    DecodeError::UnresolvedEngine { .. } => seg.stats.unresolved += 1,
                }
                if seg.errors.len() < quota {
                    seg.errors.push((offset, e));
                }
            }
        }
    }
    seg
}

/// Decodes a buffer of 16-byte little-endian records in parallel.
///
/// Events come back in stream order. A trailing partial record counts as
/// malformed. Failures are logged at most `print_quota` times per class.
pub fn decode_chunk(bytes: &[u8], topology: &Topology, print_quota: usize) -> (Vec<Event>, DecodeStats) {
    let segment_bytes = SEGMENT_RECORDS * RECORD_SIZE;
    let segments: Vec<Segment> = bytes
        .par_chunks(segment_bytes)
        .enumerate()
        .map(|(n, chunk)| decode_segment(chunk, n * SEGMENT_RECORDS, topology, print_quota * 2))
        .collect();

    let mut watcher = ErrorWatcher::new(print_quota);
    let mut stats = DecodeStats::default();
    let mut events = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    for mut seg in segments {
        stats.absorb(&seg.stats);
        for (offset, e) in &seg.errors {
            watcher.report(*offset, e);
        }
        events.append(&mut seg.events);
    }
    watcher.sum_up(&stats);
    tracing::debug!(%stats, "decoded record buffer");
    (events, stats)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("line {line}: invalid hex word {text:?}")]
    InvalidHex { line: usize, text: String },

    #[error("line {line}: cannot decode {raw:#010x}: {source}")]
    Unresolved {
        line: usize,
        raw: u32,
        #[source]
        source: TopologyError,
    },
}

/// A master word decoded without the rest of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MasterWord {
    pub raw: u32,
    pub engine: ResolvedEngine,
    pub context: u8,
}

impl fmt::Display for MasterWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}  {} {} {} {}",
            self.raw, self.engine.engine_type, self.engine.cluster, self.engine.engine_index, self.context
        )
    }
}

/// Decodes one text line. Blank lines yield `Ok(None)`.
pub fn decode_master_line(line_no: usize, line: &str, topology: &Topology) -> Result<Option<MasterWord>, SourceError> {
    let text = line.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return Ok(None);
    }
    let raw = u32::from_str_radix(digits, 16).map_err(|_| SourceError::InvalidHex {
        line: line_no,
        text: text.to_string(),
    })?;
    let (engine, context) = topology.decode_v1(raw).map_err(|source| SourceError::Unresolved {
        line: line_no,
        raw,
        source,
    })?;
    Ok(Some(MasterWord { raw, engine, context }))
}

/// Decodes every line of `text`, numbering lines from 1.
pub fn decode_master_text(text: &str, topology: &Topology) -> Vec<Result<MasterWord, SourceError>> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| decode_master_line(i + 1, line, topology).transpose())
        .collect()
}
