//! DPF record decoding.
//!
//! A record is four little-endian 32-bit words:
//!
//! | word | V1 (bit 0 clear)                          | V2 (bit 0 set)                 |
//! |------|-------------------------------------------|--------------------------------|
//! | 0    | flag:1, code:8, packet id:23              | flag:1, code:7, payload:24     |
//! | 1    | master:10, reserved:2, context:4          | master:10                      |
//! | 2    | cycle, low half                           | cycle, low half                |
//! | 3    | cycle, high half                          | cycle, high half               |

use std::fmt;

use serde::Serialize;

use crate::codes;
use crate::engine::EngineType;
use crate::pairing::ChannelKey;
use crate::topology::{Topology, TopologyError};

/// Number of 32-bit words in one record.
pub const RECORD_WORDS: usize = 4;

/// Size of one record in bytes.
pub const RECORD_SIZE: usize = RECORD_WORDS * 4;

/// Errors raised while decoding a single record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed record: expected {RECORD_WORDS} words, got {words}")]
    MalformedInput { words: usize },

    #[error("record {offset_index}: {source}")]
    UnresolvedEngine {
        offset_index: usize,
        #[source]
        source: TopologyError,
    },
}

/// Record sub-format, selected by bit 0 of the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Format {
    /// Packet id and runtime context present.
    V1,
    /// Payload present; no context or packet id.
    V2,
}

impl Format {
    pub const fn from_word(word0: u32) -> Self {
        if word0 & 1 == 0 { Self::V1 } else { Self::V2 }
    }

    pub const fn flag(self) -> u32 {
        match self {
            Self::V1 => 0,
            Self::V2 => 1,
        }
    }
}

/// One decoded hardware record. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Record position within the source stream.
    pub offset_index: usize,
    pub format: Format,
    pub engine_type: EngineType,
    pub engine_index: u32,
    pub unique_index: u32,
    pub cluster_id: u32,
    /// Runtime context; always 0 for V2 records.
    pub context: u8,
    /// Command packet id; always 0 for V2 records.
    pub packet_id: u32,
    pub event_code: u32,
    /// Format-dependent payload; always 0 for V1 records.
    pub payload: u32,
    pub cycle: u64,
    pub raw: [u32; RECORD_WORDS],
}

/// Decodes one record from its words.
pub fn decode(words: &[u32], offset_index: usize, topology: &Topology) -> Result<Event, DecodeError> {
    let raw: [u32; RECORD_WORDS] = words
        .get(..RECORD_WORDS)
        .and_then(|w| w.try_into().ok())
        .ok_or(DecodeError::MalformedInput { words: words.len() })?;

    let unresolved = |source| DecodeError::UnresolvedEngine {
        offset_index,
        source,
    };
    let format = Format::from_word(raw[0]);
    let (engine, context, packet_id, event_code, payload) = match format {
        Format::V1 => {
            let (engine, context) = topology.decode_v1(raw[1]).map_err(unresolved)?;
            (engine, context, raw[0] >> 9, (raw[0] >> 1) & 0xff, 0)
        }
        Format::V2 => {
            let engine = topology.decode_v2(raw[1]).map_err(unresolved)?;
            (engine, 0, 0, (raw[0] >> 1) & 0x7f, raw[0] >> 8)
        }
    };

    Ok(Event {
        offset_index,
        format,
        engine_type: engine.engine_type,
        engine_index: engine.engine_index,
        unique_index: engine.unique_index,
        cluster_id: engine.cluster,
        context,
        packet_id,
        event_code,
        payload,
        cycle: u64::from(raw[2]) | (u64::from(raw[3]) << 32),
        raw,
    })
}

/// Decodes one little-endian 16-byte record.
pub fn decode_bytes(bytes: &[u8], offset_index: usize, topology: &Topology) -> Result<Event, DecodeError> {
    if bytes.len() < RECORD_SIZE {
        return Err(DecodeError::MalformedInput {
            words: bytes.len() / 4,
        });
    }
    let mut words = [0u32; RECORD_WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    decode(&words, offset_index, topology)
}

impl Event {
    /// Demultiplexing key for the pairing engine.
    pub const fn channel(&self) -> ChannelKey {
        ChannelKey::new(self.unique_index, self.context)
    }

    /// Raw 10-bit master value from the second word.
    pub const fn master_value(&self) -> u32 {
        self.raw[1] & 0x3ff
    }

    /// Sync index carried by PCIE clock-sync records.
    pub const fn sync_index(&self) -> u32 {
        self.raw[0] >> 1
    }

    pub fn name(&self) -> Option<&'static str> {
        codes::event_name(self.engine_type, self.event_code)
    }

    pub fn raw_repr(&self) -> String {
        format!(
            "[{:08x}: {:08x} {:08x} {:08x} {:08x}]",
            self.offset_index * RECORD_SIZE,
            self.raw[0],
            self.raw[1],
            self.raw[2],
            self.raw[3]
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{} ", self.engine_type, self.cluster_id, self.engine_index)?;
        match (self.format, self.engine_type) {
            (Format::V1, EngineType::Pcie) => write!(f, "sync={}", self.sync_index())?,
            (Format::V1, _) => {
                write!(f, "ctx={} ", self.context)?;
                match self.name() {
                    Some(name) => f.write_str(name)?,
                    None => write!(f, "event={}", self.event_code)?,
                }
                write!(f, " pid={}", self.packet_id)?;
            }
            (Format::V2, _) => write!(f, "event={} payload={}", self.event_code, self.payload)?,
        }
        write!(f, " cycle={}", self.cycle)
    }
}
