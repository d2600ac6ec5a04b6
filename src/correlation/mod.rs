//! Call correlation.
//!
//! Messages arrive serially from the ingestion queue. Each one is persisted as
//! a [`SipRecord`] and then folded into the in-memory [`CallRecord`] of its
//! Call-ID. Records leave the cache when the call ends or when the periodic
//! sweep finds them stale.
use crate::{
    callrecord::{CallRecord, CallStatus, RawRecord, SipRecord},
    repository::Repository,
    rtcp::RtcpReportService,
    sip::SipMessage,
    utils::sanitize_raw_text,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error, info};
use uuid::Uuid;

pub const DEFAULT_HANGUP_CODES: [u16; 14] = [
    480, 487, 404, 403, 408, 413, 416, 486, 488, 513, 500, 503, 504, 580,
];
pub const NORMAL_CLEARING: &str = "Normal Clearing";

/// CSeq methods whose messages may change a call's state.
const CALL_METHODS: [&str; 5] = ["INVITE", "BYE", "ACK", "CANCEL", "UPDATE"];
/// Never correlated nor stored.
const IGNORED_METHODS: [&str; 2] = ["REGISTER", "NOTIFY"];

#[derive(Debug, Clone)]
pub struct CorrelatorOption {
    pub hangup_codes: Vec<u16>,
    pub unanswered_timeout: std::time::Duration,
    pub answered_timeout: std::time::Duration,
}

impl Default for CorrelatorOption {
    fn default() -> Self {
        Self {
            hangup_codes: DEFAULT_HANGUP_CODES.to_vec(),
            unanswered_timeout: std::time::Duration::from_secs(60),
            answered_timeout: std::time::Duration::from_secs(900),
        }
    }
}

pub struct CallCorrelator {
    repository: Arc<dyn Repository>,
    rtcp: Arc<RtcpReportService>,
    calls: RwLock<HashMap<String, CallRecord>>,
    hangup_codes: HashSet<u16>,
    unanswered_timeout: Duration,
    answered_timeout: Duration,
}

impl CallCorrelator {
    pub fn new(
        repository: Arc<dyn Repository>,
        rtcp: Arc<RtcpReportService>,
        option: CorrelatorOption,
    ) -> Self {
        Self {
            repository,
            rtcp,
            calls: RwLock::new(HashMap::new()),
            hangup_codes: option.hangup_codes.into_iter().collect(),
            unanswered_timeout: Duration::from_std(option.unanswered_timeout)
                .unwrap_or(Duration::MAX),
            answered_timeout: Duration::from_std(option.answered_timeout).unwrap_or(Duration::MAX),
        }
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.read().get(call_id).cloned()
    }

    pub fn active_calls(&self) -> Vec<CallRecord> {
        let mut calls: Vec<_> = self.calls.read().values().cloned().collect();
        calls.sort_by(|a, b| a.create_time.cmp(&b.create_time));
        calls
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }

    /// Store the message and fold it into its call. A call that reaches the
    /// terminal state is written out before this returns.
    pub async fn handle(&self, msg: SipMessage) {
        if IGNORED_METHODS.contains(&msg.cseq_method.as_str()) {
            return;
        }
        self.spawn_store_message(&msg);

        let finished = {
            let mut calls = self.calls.write();
            self.apply(&mut calls, &msg)
        };
        if let Some(record) = finished {
            self.flush(record).await;
        }
    }

    /// Returns the record when the message ended the call. The record has
    /// already been removed from the cache.
    fn apply(&self, calls: &mut HashMap<String, CallRecord>, msg: &SipMessage) -> Option<CallRecord> {
        let Some(record) = calls.get_mut(&msg.call_id) else {
            if msg.is_initial_invite() {
                debug!(call_id = msg.call_id, "new call");
                calls.insert(msg.call_id.clone(), CallRecord::from_invite(msg));
            }
            return None;
        };
        if !CALL_METHODS.contains(&msg.cseq_method.as_str()) {
            return None;
        }

        let at = msg.created_at;
        if msg.is_request {
            if msg.title == "CANCEL" {
                self.end_call(record, msg);
            }
        } else {
            match msg.response_code {
                180 | 183 => {
                    if record.ringing_time.is_none() {
                        record.ringing_time = Some(at);
                        if record.status == CallStatus::New {
                            record.status = CallStatus::Ringing;
                        }
                    }
                }
                200 => match msg.cseq_method.as_str() {
                    "INVITE" | "ACK" if record.answer_time.is_none() => {
                        record.answer_time = Some(at);
                        record.status = CallStatus::Answered;
                    }
                    "BYE" if record.end_time.is_none() => {
                        record.end_time = Some(at);
                        record.status = CallStatus::Ended;
                        record.hangup_code = Some(200);
                        record.hangup_cause = Some(NORMAL_CLEARING.to_string());
                    }
                    _ => {}
                },
                code if self.hangup_codes.contains(&code) => self.end_call(record, msg),
                _ => {}
            }
        }

        if record.end_time.is_none() {
            return None;
        }
        let mut record = calls.remove(&msg.call_id)?;
        record.compute_durations();
        Some(record)
    }

    fn end_call(&self, record: &mut CallRecord, msg: &SipMessage) {
        if record.end_time.is_none() {
            record.end_time = Some(msg.created_at);
            record.status = CallStatus::Ended;
        }
        // only the far side's answer explains the hangup
        if !msg.is_request && msg.src_addr == record.dst_addr {
            if record.hangup_code.is_none() {
                record.hangup_code = Some(msg.response_code);
            }
            if record.hangup_cause.is_none() {
                record.hangup_cause = Some(msg.response_desc.clone());
            }
        }
    }

    /// Write out and evict calls that outlived their timeout: unanswered calls
    /// after `unanswered_timeout`, answered ones after `answered_timeout`.
    pub async fn flush_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CallRecord> = {
            let mut calls = self.calls.write();
            let ids: Vec<String> = calls
                .iter()
                .filter(|(_, record)| self.is_expired(record, now))
                .map(|(call_id, _)| call_id.clone())
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };

        let count = expired.len();
        for mut record in expired {
            record.compute_durations();
            self.flush(record).await;
        }
        if count > 0 {
            info!(count, "flushed expired calls");
        }
        count
    }

    fn is_expired(&self, record: &CallRecord, now: DateTime<Utc>) -> bool {
        let timeout = if record.status == CallStatus::Answered {
            self.answered_timeout
        } else {
            self.unanswered_timeout
        };
        now.signed_duration_since(record.create_time) > timeout
    }

    async fn flush(&self, record: CallRecord) {
        self.spawn_rtcp_report(&record.call_id);
        match self.repository.create_call_record(&record).await {
            Ok(_) => info!(
                call_id = record.call_id,
                status = ?record.status,
                call_duration = record.call_duration,
                "call record saved"
            ),
            Err(e) => error!(call_id = record.call_id, "failed to save call record: {}", e),
        }
    }

    fn spawn_store_message(&self, msg: &SipMessage) {
        let repository = self.repository.clone();
        let record = SipRecord {
            id: Uuid::new_v4(),
            message: msg.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = repository.create_record(&record).await {
                error!(call_id = record.message.call_id, "failed to save sip record: {}", e);
                return;
            }
            let raw = RawRecord {
                id: record.id,
                raw: sanitize_raw_text(&record.message.raw),
                create_time: record.message.created_at,
            };
            if let Err(e) = repository.create_raw_record(&raw).await {
                error!(call_id = record.message.call_id, "failed to save raw record: {}", e);
            }
        });
    }

    fn spawn_rtcp_report(&self, call_id: &str) {
        let Some((report, packets)) = self.rtcp.finalize(call_id) else {
            return;
        };
        let repository = self.repository.clone();
        tokio::spawn(async move {
            if let Err(e) = repository.create_rtcp_report(&report).await {
                error!(call_id = report.call_id, "failed to save rtcp report: {}", e);
            }
            if packets.is_empty() {
                return;
            }
            if let Err(e) = repository.create_rtcp_raw_packets(&packets).await {
                error!(
                    call_id = report.call_id,
                    count = packets.len(),
                    "failed to save rtcp packets: {}",
                    e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests;
