use super::{aggregate, RtcpPacket};
use crate::{
    callrecord::{RtcpRawPacket, RtcpReport},
    hep::{Envelope, ProtocolType},
};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, net::SocketAddr};
use tracing::{debug, info};
use uuid::Uuid;

const CLEANUP_BATCH_SIZE: usize = 100;

/// Packets of one media direction.
#[derive(Debug, Clone)]
pub struct LegReport {
    pub node_ip: String,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub packets: Vec<RtcpPacket>,
}

struct CallReports {
    // arrival order, the first leg seen is the A-leg
    legs: Vec<LegReport>,
    last_updated: DateTime<Utc>,
}

/// Collects RTCP packets per call until the call is flushed.
pub struct RtcpReportService {
    reports: RwLock<HashMap<String, CallReports>>,
    ttl: Duration,
}

impl RtcpReportService {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            reports: RwLock::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
        }
    }

    /// Store one RTCP envelope. Returns `Ok(false)` when the envelope is not
    /// RTCP or carries no correlation id.
    pub fn receive(&self, node_ip: &str, envelope: &Envelope) -> Result<bool> {
        if envelope.protocol_type != ProtocolType::Rtcp {
            return Ok(false);
        }
        let Some(call_id) = envelope
            .correlation_id
            .as_deref()
            .filter(|id| !id.is_empty())
        else {
            return Ok(false);
        };

        let mut packet = RtcpPacket::from_json(&envelope.payload).with_context(|| {
            format!(
                "invalid rtcp payload for call {} from {} to {}",
                call_id, envelope.src, envelope.dst
            )
        })?;
        packet.timestamp_micro = envelope
            .captured_at()
            .unwrap_or_else(Utc::now)
            .timestamp_micros();

        self.add_packet(node_ip, call_id, envelope.src, envelope.dst, packet, Utc::now());
        Ok(true)
    }

    pub fn add_packet(
        &self,
        node_ip: &str,
        call_id: &str,
        src: SocketAddr,
        dst: SocketAddr,
        packet: RtcpPacket,
        now: DateTime<Utc>,
    ) {
        let mut reports = self.reports.write();
        let report = reports
            .entry(call_id.to_string())
            .or_insert_with(|| CallReports {
                legs: Vec::new(),
                last_updated: now,
            });
        report.last_updated = now;

        match report
            .legs
            .iter_mut()
            .find(|leg| leg.src == src && leg.dst == dst)
        {
            Some(leg) => leg.packets.push(packet),
            None => report.legs.push(LegReport {
                node_ip: node_ip.to_string(),
                src,
                dst,
                packets: vec![packet],
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.reports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.read().is_empty()
    }

    pub fn legs(&self, call_id: &str) -> Vec<LegReport> {
        self.reports
            .read()
            .get(call_id)
            .map(|r| r.legs.clone())
            .unwrap_or_default()
    }

    /// Remove the call's packets and summarise them. `None` when no RTCP was
    /// seen for the call.
    pub fn finalize(&self, call_id: &str) -> Option<(RtcpReport, Vec<RtcpRawPacket>)> {
        let call = self.reports.write().remove(call_id)?;
        let first = call.legs.first()?;

        let now = Utc::now();
        let mut report = RtcpReport {
            id: Uuid::new_v4(),
            node_ip: first.node_ip.clone(),
            call_id: call_id.to_string(),
            src_addr: first.src.to_string(),
            dst_addr: first.dst.to_string(),
            a_leg: aggregate(&first.packets),
            b_leg: Default::default(),
            create_time: now,
            timestamp_micro: now.timestamp_micros(),
        };
        if let Some(second) = call.legs.get(1) {
            report.b_leg = aggregate(&second.packets);
        }

        let raws = call
            .legs
            .iter()
            .flat_map(|leg| {
                leg.packets.iter().map(move |packet| RtcpRawPacket {
                    id: Uuid::new_v4(),
                    node_ip: leg.node_ip.clone(),
                    call_id: call_id.to_string(),
                    src_addr: leg.src.to_string(),
                    dst_addr: leg.dst.to_string(),
                    raw: packet.raw.clone(),
                    create_time: DateTime::from_timestamp_micros(packet.timestamp_micro)
                        .unwrap_or(now),
                })
            })
            .collect();
        Some((report, raws))
    }

    /// Drop calls whose last packet is older than the ttl. Expired ids are
    /// collected under the read lock and removed in batches under the write
    /// lock, yielding between batches.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.ttl) else {
            return 0;
        };
        let expired: Vec<String> = self
            .reports
            .read()
            .iter()
            .filter(|(_, report)| report.last_updated < cutoff)
            .map(|(call_id, _)| call_id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut batches = expired.chunks(CLEANUP_BATCH_SIZE).peekable();
        while let Some(batch) = batches.next() {
            {
                let mut reports = self.reports.write();
                for call_id in batch {
                    // may have been refreshed since the scan
                    if reports
                        .get(call_id)
                        .is_some_and(|r| r.last_updated < cutoff)
                    {
                        reports.remove(call_id);
                        removed += 1;
                    }
                }
            }
            if batches.peek().is_some() {
                tokio::task::yield_now().await;
            }
        }
        if removed > 0 {
            info!(removed, "rtcp reports expired");
        } else {
            debug!("rtcp cleanup found nothing to remove");
        }
        removed
    }
}
