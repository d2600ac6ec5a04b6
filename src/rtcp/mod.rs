//! RTCP quality reports.
//!
//! Capture agents forward RTCP as a JSON document inside HEP (protocol type 5)
//! and tag it with the SIP Call-ID in the correlation chunk. Only the fields
//! needed to score a call are modelled.
use serde::{Deserialize, Deserializer, Serialize};

pub mod report;
pub mod service;

pub use report::{aggregate, QualityMetrics};
pub use service::{LegReport, RtcpReportService};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_XR: u8 = 207;

/// XR block carrying VoIP metrics (RFC 3611 section 4.7).
pub const XR_BLOCK_VOIP_METRICS: u8 = 7;

/// Agents emit `null` for fields they could not fill.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderInformation {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ntp_timestamp_sec: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ntp_timestamp_usec: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rtp_timestamp: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub packets: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub octets: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportBlock {
    #[serde(default, deserialize_with = "null_as_default")]
    pub source_ssrc: u32,
    /// Loss since the previous report, in 1/256 units.
    #[serde(default, deserialize_with = "null_as_default")]
    pub fraction_lost: u8,
    /// Cumulative loss since session start, a signed 24-bit counter on the wire.
    #[serde(default, deserialize_with = "null_as_default")]
    pub packets_lost: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub highest_seq_no: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ia_jitter: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lsr: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dlsr: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrReportBlock {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub block_type: u8,
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fraction_lost: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fraction_discard: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub burst_density: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gap_density: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub burst_duration: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gap_duration: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub round_trip_delay: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub end_system_delay: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtcpPacket {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ssrc: u32,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub packet_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_information: Option<SenderInformation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub report_count: u8,
    #[serde(default, deserialize_with = "null_as_default")]
    pub report_blocks: Vec<ReportBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_blocks_xr: Option<XrReportBlock>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sdes_ssrc: u32,
    /// Capture time of the envelope that carried this packet.
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp_micro: i64,
    #[serde(skip)]
    pub raw: String,
}

impl RtcpPacket {
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        let mut packet: RtcpPacket = serde_json::from_slice(payload)?;
        packet.raw = String::from_utf8_lossy(payload).into_owned();
        Ok(packet)
    }

    /// Report blocks are only meaningful on SR, RR and SDES packets.
    pub fn carries_report_blocks(&self) -> bool {
        matches!(self.packet_type, PT_SR | PT_RR | PT_SDES)
    }

    pub fn voip_metrics(&self) -> Option<&XrReportBlock> {
        if self.packet_type != PT_XR {
            return None;
        }
        self.report_blocks_xr
            .as_ref()
            .filter(|xr| xr.block_type == XR_BLOCK_VOIP_METRICS)
    }
}

#[cfg(test)]
mod tests;
