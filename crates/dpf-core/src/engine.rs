//! Engine type enum as the single source of truth for engine type strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hardware engine classes that can emit DPF records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineType {
    Sip,
    Sdma,
    Cdma,
    Cqm,
    Gsync,
    SipLite,
    SdmaLite,
    CdmaLite,
    Pcie,
    Ts,
    Odma,
    Hcvg,
    Vdec,
    Unknown,
}

impl EngineType {
    /// Every engine type, in table order.
    pub const ALL: [Self; 14] = [
        Self::Sip,
        Self::Sdma,
        Self::Cdma,
        Self::Cqm,
        Self::Gsync,
        Self::SipLite,
        Self::SdmaLite,
        Self::CdmaLite,
        Self::Pcie,
        Self::Ts,
        Self::Odma,
        Self::Hcvg,
        Self::Vdec,
        Self::Unknown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sip => "SIP",
            Self::Sdma => "SDMA",
            Self::Cdma => "CDMA",
            Self::Cqm => "CQM",
            Self::Gsync => "GSYNC",
            Self::SipLite => "SIP_LITE",
            Self::SdmaLite => "SDMA_LITE",
            Self::CdmaLite => "CDMA_LITE",
            Self::Pcie => "PCIE",
            Self::Ts => "TS",
            Self::Odma => "ODMA",
            Self::Hcvg => "HCVG",
            Self::Vdec => "VDEC",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Command queue managers and the sync engine share the firmware event set.
    pub const fn is_cqm_like(self) -> bool {
        matches!(self, Self::Cqm | Self::Gsync)
    }

    pub const fn is_dma(self) -> bool {
        matches!(self, Self::Sdma | Self::Cdma)
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = UnknownEngineType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == upper)
            .ok_or_else(|| UnknownEngineType(s.to_string()))
    }
}

impl Serialize for EngineType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EngineType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown engine type strings.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown engine type: {0}")]
pub struct UnknownEngineType(String);
