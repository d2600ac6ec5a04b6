use super::*;
use crate::{
    hep::{Envelope, HepVersion, ProtocolType},
    repository::MemoryRepository,
    rtcp::{RtcpPacket, PT_RR},
    sip::SipParser,
};
use bytes::Bytes;
use chrono::TimeZone;

const CALLER: &str = "10.0.0.1:5060";
const CALLEE: &str = "10.0.0.2:5060";
const T0: i64 = 1_700_000_000;

fn request(method: &str, call_id: &str, cseq: &str) -> String {
    format!(
        "{method} sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 {cseq}\r\n\
User-Agent: softphone/1.0\r\n\
X-JCallId: session-1\r\n\
Content-Length: 0\r\n\r\n"
    )
}

fn response(code: u16, reason: &str, call_id: &str, cseq: &str) -> String {
    format!(
        "SIP/2.0 {code} {reason}\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 {cseq}\r\n\
Content-Length: 0\r\n\r\n"
    )
}

fn message(text: String, src: &str, dst: &str, at: i64) -> SipMessage {
    let envelope = Envelope {
        version: HepVersion::V3,
        ip_family: 2,
        ip_protocol: 17,
        src: src.parse().unwrap(),
        dst: dst.parse().unwrap(),
        timestamp_sec: at as u32,
        timestamp_usec: 0,
        protocol_type: ProtocolType::Sip,
        capture_id: 2001,
        keepalive_timer: 0,
        auth_key: None,
        correlation_id: None,
        payload: Bytes::from(text),
    };
    SipParser::default()
        .parse_message(&envelope, "192.168.1.10")
        .expect("accepted")
}

fn at(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + offset, 0).unwrap()
}

fn correlator() -> (Arc<MemoryRepository>, Arc<RtcpReportService>, CallCorrelator) {
    let repository = Arc::new(MemoryRepository::new());
    let rtcp = Arc::new(RtcpReportService::new(std::time::Duration::from_secs(180)));
    let correlator = CallCorrelator::new(
        repository.clone(),
        rtcp.clone(),
        CorrelatorOption::default(),
    );
    (repository, rtcp, correlator)
}

/// Let the detached store tasks run.
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_answered_call_lifecycle() {
    let (repository, _, correlator) = correlator();
    let id = "call-lifecycle";

    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    let record = correlator.get(id).expect("cached");
    assert_eq!(record.status, CallStatus::New);
    assert_eq!(record.from_user, "alice");
    assert_eq!(record.to_user, "bob");
    assert_eq!(record.session_id.as_deref(), Some("session-1"));
    assert_eq!(record.user_agent, "softphone/1.0");

    correlator
        .handle(message(response(180, "Ringing", id, "INVITE"), CALLEE, CALLER, T0 + 2))
        .await;
    assert_eq!(correlator.get(id).unwrap().status, CallStatus::Ringing);

    // a duplicate 180 keeps the first ringing time
    correlator
        .handle(message(response(180, "Ringing", id, "INVITE"), CALLEE, CALLER, T0 + 4))
        .await;
    assert_eq!(correlator.get(id).unwrap().ringing_time, Some(at(2)));

    correlator
        .handle(message(response(200, "OK", id, "INVITE"), CALLEE, CALLER, T0 + 5))
        .await;
    assert_eq!(correlator.get(id).unwrap().status, CallStatus::Answered);

    // a late 183 after answer neither moves the status back nor the time
    correlator
        .handle(message(response(183, "Session Progress", id, "INVITE"), CALLEE, CALLER, T0 + 6))
        .await;
    let record = correlator.get(id).unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert_eq!(record.ringing_time, Some(at(2)));

    correlator
        .handle(message(request("BYE", id, "BYE"), CALLER, CALLEE, T0 + 65))
        .await;
    assert!(correlator.get(id).is_some());
    correlator
        .handle(message(response(200, "OK", id, "BYE"), CALLEE, CALLER, T0 + 65))
        .await;
    assert!(correlator.get(id).is_none());
    assert!(correlator.is_empty());

    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.create_time, at(0));
    assert_eq!(record.ringing_time, Some(at(2)));
    assert_eq!(record.answer_time, Some(at(5)));
    assert_eq!(record.end_time, Some(at(65)));
    assert_eq!(record.call_duration, 65);
    assert_eq!(record.ringing_duration, 3);
    assert_eq!(record.talk_duration, 60);
    assert_eq!(record.hangup_code, Some(200));
    assert_eq!(record.hangup_cause.as_deref(), Some(NORMAL_CLEARING));

    settle().await;
    let stored = repository.records().await;
    assert_eq!(stored.len(), 7);
    let raws = repository.raw_records().await;
    assert_eq!(raws.len(), 7);
    let first = stored.iter().find(|r| r.message.title == "INVITE").unwrap();
    let raw = raws.iter().find(|r| r.id == first.id).expect("raw shares the id");
    assert!(raw.raw.starts_with("INVITE sip:bob@biloxi.com SIP/2.0\r\n"));
    assert_eq!(raw.create_time, at(0));
}

#[tokio::test]
async fn test_far_side_failure_sets_hangup_cause() {
    let (repository, _, correlator) = correlator();
    let id = "call-busy";
    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(180, "Ringing", id, "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;
    correlator
        .handle(message(response(486, "Busy Here", id, "INVITE"), CALLEE, CALLER, T0 + 4))
        .await;
    assert!(correlator.is_empty());

    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Ended);
    assert_eq!(records[0].hangup_code, Some(486));
    assert_eq!(records[0].hangup_cause.as_deref(), Some("Busy Here"));
    assert_eq!(records[0].ringing_duration, 3);
    assert_eq!(records[0].talk_duration, 0);
    assert_eq!(records[0].call_duration, 4);
}

#[tokio::test]
async fn test_failure_from_near_side_leaves_cause_empty() {
    let (repository, _, correlator) = correlator();
    let id = "call-proxy-timeout";
    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    // generated by a proxy sitting elsewhere
    correlator
        .handle(message(response(408, "Request Timeout", id, "INVITE"), "10.0.0.9:5060", CALLER, T0 + 30))
        .await;

    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].end_time, Some(at(30)));
    assert_eq!(records[0].hangup_code, None);
    assert_eq!(records[0].hangup_cause, None);
}

#[tokio::test]
async fn test_cancel_ends_call() {
    let (repository, _, correlator) = correlator();
    let id = "call-cancel";
    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(request("CANCEL", id, "CANCEL"), CALLER, CALLEE, T0 + 3))
        .await;
    assert!(correlator.get(id).is_none());

    // the 487 that follows finds nothing to update
    correlator
        .handle(message(response(487, "Request Terminated", id, "INVITE"), CALLEE, CALLER, T0 + 3))
        .await;
    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Ended);
    assert_eq!(records[0].call_duration, 3);
    assert_eq!(records[0].hangup_code, None);
}

#[tokio::test]
async fn test_only_invite_opens_a_call() {
    let (repository, _, correlator) = correlator();
    correlator
        .handle(message(request("BYE", "orphan", "BYE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(200, "OK", "orphan", "BYE"), CALLEE, CALLER, T0))
        .await;
    assert!(correlator.is_empty());
    assert!(repository.call_records().await.is_empty());

    settle().await;
    // still stored as signaling
    assert_eq!(repository.records().await.len(), 2);
}

#[tokio::test]
async fn test_register_and_notify_are_dropped() {
    let (repository, _, correlator) = correlator();
    correlator
        .handle(message(request("REGISTER", "reg-1", "REGISTER"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(request("NOTIFY", "sub-1", "NOTIFY"), CALLER, CALLEE, T0))
        .await;
    settle().await;
    assert!(correlator.is_empty());
    assert!(repository.records().await.is_empty());
    assert!(repository.raw_records().await.is_empty());
}

#[tokio::test]
async fn test_unanswered_call_is_swept() {
    let (repository, _, correlator) = correlator();
    let id = "call-timeout";
    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;

    assert_eq!(correlator.flush_expired(at(30)).await, 0);
    assert_eq!(correlator.flush_expired(at(61)).await, 1);
    assert!(correlator.get(id).is_none());

    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, CallStatus::New);
    assert_eq!(record.ringing_time, None);
    assert_eq!(record.answer_time, None);
    assert_eq!(record.end_time, None);
    assert_eq!(record.call_duration, 0);

    // a late BYE does not revive the call
    correlator
        .handle(message(response(200, "OK", id, "BYE"), CALLEE, CALLER, T0 + 70))
        .await;
    assert!(correlator.is_empty());
    assert_eq!(repository.call_records().await.len(), 1);
}

fn reinvite(call_id: &str) -> String {
    request("INVITE", call_id, "INVITE").replace(
        "To: Bob <sip:bob@biloxi.com>\r\n",
        "To: Bob <sip:bob@biloxi.com>;tag=a6c85cf\r\n",
    )
}

#[tokio::test]
async fn test_reinvite_after_sweep_does_not_reopen_call() {
    let (repository, _, correlator) = correlator();
    let id = "call-refresh";
    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(200, "OK", id, "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;
    assert_eq!(correlator.flush_expired(at(901)).await, 1);

    // session timer refresh inside the swept dialog
    let refresh = message(reinvite(id), CALLER, CALLEE, T0 + 950);
    assert_eq!(refresh.to_tag, "a6c85cf");
    assert!(!refresh.is_initial_invite());
    correlator.handle(refresh).await;
    assert!(correlator.get(id).is_none());

    correlator
        .handle(message(response(200, "OK", id, "BYE"), CALLEE, CALLER, T0 + 1000))
        .await;
    assert!(correlator.is_empty());

    let records = repository.call_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Answered);
    assert_eq!(records[0].end_time, None);
}

#[tokio::test]
async fn test_answered_call_uses_longer_timeout() {
    let (repository, _, correlator) = correlator();
    correlator
        .handle(message(request("INVITE", "answered", "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(200, "OK", "answered", "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;
    correlator
        .handle(message(request("INVITE", "ringing", "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(180, "Ringing", "ringing", "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;

    assert_eq!(correlator.flush_expired(at(120)).await, 1);
    assert!(correlator.get("answered").is_some());
    assert_eq!(correlator.active_calls().len(), 1);

    assert_eq!(correlator.flush_expired(at(901)).await, 1);
    assert!(correlator.is_empty());
    let records = repository.call_records().await;
    assert_eq!(records[0].call_id, "ringing");
    assert_eq!(records[0].status, CallStatus::Ringing);
    assert_eq!(records[1].status, CallStatus::Answered);
}

#[tokio::test]
async fn test_custom_hangup_codes() {
    let repository = Arc::new(MemoryRepository::new());
    let rtcp = Arc::new(RtcpReportService::new(std::time::Duration::from_secs(180)));
    let correlator = CallCorrelator::new(
        repository.clone(),
        rtcp,
        CorrelatorOption {
            hangup_codes: vec![603],
            ..Default::default()
        },
    );
    correlator
        .handle(message(request("INVITE", "c", "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(486, "Busy Here", "c", "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;
    assert!(correlator.get("c").is_some());
    correlator
        .handle(message(response(603, "Decline", "c", "INVITE"), CALLEE, CALLER, T0 + 2))
        .await;
    assert!(correlator.get("c").is_none());
    assert_eq!(repository.call_records().await[0].hangup_code, Some(603));
}

#[tokio::test]
async fn test_call_end_flushes_rtcp() {
    let (repository, rtcp, correlator) = correlator();
    let id = "call-media";
    let packet = RtcpPacket {
        packet_type: PT_RR,
        report_blocks: vec![crate::rtcp::ReportBlock {
            highest_seq_no: 400,
            ..Default::default()
        }],
        raw: r#"{"type":201}"#.to_string(),
        ..Default::default()
    };
    let a = "10.0.0.1:20000".parse().unwrap();
    let b = "10.0.0.2:30000".parse().unwrap();
    rtcp.add_packet("192.168.1.10", id, a, b, packet.clone(), Utc::now());
    rtcp.add_packet("192.168.1.10", id, b, a, packet, Utc::now());

    correlator
        .handle(message(request("INVITE", id, "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(response(200, "OK", id, "INVITE"), CALLEE, CALLER, T0 + 1))
        .await;
    correlator
        .handle(message(response(200, "OK", id, "BYE"), CALLEE, CALLER, T0 + 10))
        .await;
    settle().await;

    assert!(rtcp.is_empty());
    let reports = repository.rtcp_reports().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].call_id, id);
    assert_eq!(reports[0].a_leg.packet_count, 400);
    assert_eq!(reports[0].b_leg.packet_count, 400);
    assert_eq!(repository.rtcp_raw_packets().await.len(), 2);
}

#[tokio::test]
async fn test_failed_write_still_evicts() {
    let mut repository = crate::repository::MockRepository::new();
    repository
        .expect_create_record()
        .returning(|_| Err(anyhow::anyhow!("disk full")));
    repository.expect_create_raw_record().never();
    repository
        .expect_create_call_record()
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("disk full")));

    let correlator = CallCorrelator::new(
        Arc::new(repository),
        Arc::new(RtcpReportService::new(std::time::Duration::from_secs(180))),
        CorrelatorOption::default(),
    );
    correlator
        .handle(message(request("INVITE", "lost", "INVITE"), CALLER, CALLEE, T0))
        .await;
    correlator
        .handle(message(request("CANCEL", "lost", "CANCEL"), CALLER, CALLEE, T0 + 1))
        .await;
    settle().await;
    assert!(correlator.is_empty());
}
