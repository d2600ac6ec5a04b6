use super::*;
use crate::hep::{encode_hep3, Envelope, HepVersion};
use tokio::sync::mpsc;

const OPTIONS: &str = "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKhjhs8ass877\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: <sip:carol@chicago.com>\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 63104 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
Call-ID: server-test-call\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";

fn envelope(protocol_type: ProtocolType, payload: &str, correlation_id: Option<&str>) -> Envelope {
    Envelope {
        version: HepVersion::V3,
        ip_family: 2,
        ip_protocol: 17,
        src: "10.0.0.1:5060".parse().unwrap(),
        dst: "10.0.0.2:5060".parse().unwrap(),
        timestamp_sec: 1_700_000_000,
        timestamp_usec: 0,
        protocol_type,
        capture_id: 7,
        keepalive_timer: 0,
        auth_key: None,
        correlation_id: correlation_id.map(str::to_string),
        payload: Bytes::from(payload.to_string()),
    }
}

const MIN_PAYLOAD: usize = 24;

fn remote() -> SocketAddr {
    "192.168.1.10:40000".parse().unwrap()
}

#[test]
fn test_handle_sip_datagram() {
    let parser = SipParser::default();
    let rtcp = RtcpReportService::new(Duration::from_secs(180));

    let datagram = encode_hep3(&envelope(ProtocolType::Sip, INVITE, None));
    let msg = handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).expect("accepted");
    assert_eq!(msg.call_id, "server-test-call");
    assert_eq!(msg.node_ip, "192.168.1.10");
    assert_eq!(msg.node_id, "7");
    assert_eq!(msg.src_addr, "10.0.0.1:5060");

    // keep-alive traffic is filtered
    let datagram = encode_hep3(&envelope(ProtocolType::Sip, OPTIONS, None));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());
}

#[test]
fn test_handle_rtcp_datagram() {
    let parser = SipParser::default();
    let rtcp = RtcpReportService::new(Duration::from_secs(180));
    let report = r#"{"ssrc":1,"type":201,"report_blocks":[{"highest_seq_no":10}]}"#;

    let datagram = encode_hep3(&envelope(ProtocolType::Rtcp, report, Some("server-test-call")));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());
    let legs = rtcp.legs("server-test-call");
    assert_eq!(legs.len(), 1);
    assert_eq!(legs[0].node_ip, "192.168.1.10");

    // no call id, nothing stored
    let datagram = encode_hep3(&envelope(ProtocolType::Rtcp, report, None));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());
    assert_eq!(rtcp.len(), 1);
}

#[test]
fn test_handle_undecodable_datagram() {
    let parser = SipParser::default();
    let rtcp = RtcpReportService::new(Duration::from_secs(180));
    assert!(handle_datagram(b"\x05garbage garbage garbage", remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());

    let mut datagram = encode_hep3(&envelope(ProtocolType::Sip, INVITE, None));
    datagram.truncate(datagram.len() - 10);
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());

    let datagram = encode_hep3(&envelope(ProtocolType::Rtp, "rtp", None));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());
    assert!(rtcp.is_empty());
}

#[test]
fn test_handle_short_payload() {
    let parser = SipParser::default();
    let rtcp = RtcpReportService::new(Duration::from_secs(180));

    // the envelope clears the datagram limit, the payload does not
    let datagram = encode_hep3(&envelope(ProtocolType::Sip, "I", None));
    assert!(datagram.len() > MIN_PAYLOAD);
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());

    let datagram = encode_hep3(&envelope(ProtocolType::Sip, "", None));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());

    // an empty payload is refused even without a minimum
    assert!(handle_datagram(&datagram, remote(), 0, &parser, &rtcp).is_none());

    let report = r#"{"ssrc":1}"#;
    let datagram = encode_hep3(&envelope(ProtocolType::Rtcp, report, Some("tiny")));
    assert!(handle_datagram(&datagram, remote(), MIN_PAYLOAD, &parser, &rtcp).is_none());
    assert!(rtcp.is_empty());

    let datagram = encode_hep3(&envelope(ProtocolType::Sip, INVITE, None));
    assert!(handle_datagram(&datagram, remote(), INVITE.len(), &parser, &rtcp).is_some());
    assert!(handle_datagram(&datagram, remote(), INVITE.len() + 1, &parser, &rtcp).is_none());
}

#[tokio::test]
async fn test_serve_filters_and_queues() {
    let (sender, mut receiver) = mpsc::channel(16);
    let token = CancellationToken::new();
    let server = HepServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        HepServerOption {
            max_packet_length: 1024,
            min_packet_length: 24,
            read_timeout: Duration::from_millis(50),
        },
        Arc::new(SipParser::default()),
        Arc::new(RtcpReportService::new(Duration::from_secs(180))),
        sender,
        token.clone(),
    )
    .await
    .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let serve = tokio::spawn(async move { server.serve().await });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // too short, then too long, then a real one
    client.send_to(b"HEP3", addr).await.unwrap();
    let mut long = envelope(ProtocolType::Sip, INVITE, None);
    long.payload = Bytes::from(format!("{}{}", INVITE, "x".repeat(2048)));
    client.send_to(&encode_hep3(&long), addr).await.unwrap();
    client
        .send_to(&encode_hep3(&envelope(ProtocolType::Sip, INVITE, None)), addr)
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("message in time")
        .expect("message");
    assert_eq!(msg.call_id, "server-test-call");
    assert_eq!(msg.raw.len(), INVITE.len());
    assert!(receiver.try_recv().is_err());

    token.cancel();
    serve.await.unwrap().expect("serve");
}
