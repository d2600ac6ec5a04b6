use crate::{rtcp::QualityMetrics, sip::SipMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    New,
    Ringing,
    Answered,
    Ended,
}

/// One correlated call, keyed by its SIP Call-ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub session_id: Option<String>,
    pub node_ip: String,
    pub from_user: String,
    pub to_user: String,
    pub user_agent: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub create_time: DateTime<Utc>,
    pub ringing_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub call_duration: i64,
    pub ringing_duration: i64,
    pub talk_duration: i64,
    pub status: CallStatus,
    pub hangup_code: Option<u16>,
    pub hangup_cause: Option<String>,
    pub timestamp_micro: i64,
}

impl CallRecord {
    /// Capture the identifying fields of a call from its initial INVITE.
    pub fn from_invite(msg: &SipMessage) -> Self {
        Self {
            call_id: msg.call_id.clone(),
            session_id: msg.session_id.clone(),
            node_ip: msg.node_ip.clone(),
            from_user: msg.from_user.clone(),
            to_user: msg.to_user.clone(),
            user_agent: msg.user_agent.clone(),
            src_addr: msg.src_addr.clone(),
            dst_addr: msg.dst_addr.clone(),
            create_time: msg.created_at,
            ringing_time: None,
            answer_time: None,
            end_time: None,
            call_duration: 0,
            ringing_duration: 0,
            talk_duration: 0,
            status: CallStatus::New,
            hangup_code: None,
            hangup_cause: None,
            timestamp_micro: msg.timestamp_micro,
        }
    }

    pub fn compute_durations(&mut self) {
        let Some(end) = self.end_time else {
            return;
        };
        self.call_duration = (end - self.create_time).num_seconds();
        if let Some(ringing) = self.ringing_time {
            self.ringing_duration = (self.answer_time.unwrap_or(end) - ringing).num_seconds();
        }
        if let Some(answer) = self.answer_time {
            self.talk_duration = (end - answer).num_seconds();
        }
    }
}

/// Persisted form of every accepted SIP message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub message: SipMessage,
}

/// Sanitized raw text of a [`SipRecord`], stored under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: Uuid,
    pub raw: String,
    pub create_time: DateTime<Utc>,
}

/// Quality summary of a call, one entry per media direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcpReport {
    pub id: Uuid,
    pub node_ip: String,
    pub call_id: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub a_leg: QualityMetrics,
    pub b_leg: QualityMetrics,
    pub create_time: DateTime<Utc>,
    pub timestamp_micro: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpRawPacket {
    pub id: Uuid,
    pub node_ip: String,
    pub call_id: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub raw: String,
    pub create_time: DateTime<Utc>,
}
