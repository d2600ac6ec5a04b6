use super::*;
use crate::hep::{Envelope, HepVersion, ProtocolType};
use bytes::Bytes;
use chrono::{Duration, Utc};
use std::net::SocketAddr;

fn rr(highest_seq_no: u64, packets_lost: u64, ia_jitter: u64, dlsr: u64) -> RtcpPacket {
    RtcpPacket {
        ssrc: 0x1234,
        packet_type: PT_RR,
        report_count: 1,
        report_blocks: vec![ReportBlock {
            source_ssrc: 0x5678,
            fraction_lost: 0,
            packets_lost,
            highest_seq_no,
            ia_jitter,
            lsr: 0,
            dlsr,
        }],
        ..Default::default()
    }
}

fn xr(fraction_lost: u64, round_trip_delay: u64) -> RtcpPacket {
    RtcpPacket {
        packet_type: PT_XR,
        report_blocks_xr: Some(XrReportBlock {
            block_type: XR_BLOCK_VOIP_METRICS,
            fraction_lost,
            round_trip_delay,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn test_packet_json_with_nulls() {
    let payload = br#"{
        "ssrc": 305419896,
        "type": 200,
        "sender_information": {"ntp_timestamp_sec": 3913056000, "ntp_timestamp_usec": null, "rtp_timestamp": 160, "packets": 50, "octets": 8000},
        "report_count": 1,
        "report_blocks": [{"source_ssrc": 1, "fraction_lost": null, "packets_lost": 3, "highest_seq_no": 120, "ia_jitter": 40, "lsr": 0, "dlsr": null}],
        "report_blocks_xr": null,
        "sdes_ssrc": null
    }"#;
    let packet = RtcpPacket::from_json(payload).expect("valid json");
    assert_eq!(packet.ssrc, 305419896);
    assert_eq!(packet.packet_type, PT_SR);
    assert!(packet.carries_report_blocks());
    assert_eq!(packet.sender_information.as_ref().map(|s| s.packets), Some(50));
    assert_eq!(packet.report_blocks.len(), 1);
    assert_eq!(packet.report_blocks[0].fraction_lost, 0);
    assert_eq!(packet.report_blocks[0].dlsr, 0);
    assert_eq!(packet.report_blocks[0].highest_seq_no, 120);
    assert!(packet.report_blocks_xr.is_none());
    assert_eq!(packet.raw, String::from_utf8_lossy(payload));

    let packet = RtcpPacket::from_json(br#"{"type": 201, "report_blocks": null}"#).expect("valid");
    assert!(packet.report_blocks.is_empty());
    assert!(RtcpPacket::from_json(b"not json").is_err());
}

#[test]
fn test_aggregate_without_packets() {
    let metrics = aggregate(&[]);
    assert_eq!(metrics, QualityMetrics::default());
    assert_eq!(metrics.mos, 0.0);
}

#[test]
fn test_perfect_call_mos() {
    let metrics = aggregate(&[rr(1000, 0, 0, 0)]);
    assert_eq!(metrics.packet_count, 1000);
    assert_eq!(metrics.packet_lost_rate, 0.0);
    // R0 = 93.2 maps to roughly 4.41
    assert!(metrics.mos > 4.3 && metrics.mos < 4.5, "mos {}", metrics.mos);
}

#[test]
fn test_cumulative_counters_are_watermarks() {
    let packets = vec![rr(100, 1, 0, 0), rr(200, 5, 0, 0), rr(300, 3, 0, 0)];
    let metrics = aggregate(&packets);
    assert_eq!(metrics.packet_count, 300);
    assert_eq!(metrics.packet_lost, 5);
    assert!((metrics.packet_lost_rate - 5.0 / 3.0).abs() < 1e-9);

    let mut shuffled = packets.clone();
    shuffled.reverse();
    shuffled.swap(0, 1);
    assert_eq!(aggregate(&shuffled), metrics);
}

#[test]
fn test_negative_cumulative_loss_counts_as_zero() {
    let metrics = aggregate(&[rr(500, 0xFF_FFFF, 0, 0)]);
    assert_eq!(metrics.packet_lost, 0);
    assert_eq!(metrics.packet_lost_rate, 0.0);
}

#[test]
fn test_extreme_loss_without_counts() {
    let mut packet = rr(0, 0, 0, 0);
    packet.report_blocks[0].fraction_lost = 210;
    let metrics = aggregate(&[packet]);
    assert_eq!(metrics.packet_count, 0);
    assert_eq!(metrics.packet_lost_rate, 100.0);
    assert_eq!(metrics.mos, 1.0);
}

#[test]
fn test_jitter_and_delay_sanity_bound() {
    let packets = vec![
        rr(10, 0, 100, 0),
        rr(20, 0, 300, 6554),
        rr(30, 0, 20_000_000, 50_000_000),
    ];
    let metrics = aggregate(&packets);
    assert_eq!(metrics.jitter_avg, 200);
    assert_eq!(metrics.jitter_max, 300);
    assert_eq!(metrics.delay_avg, 6554);
    assert_eq!(metrics.delay_max, 6554);
}

#[test]
fn test_delay_lowers_mos() {
    let perfect = aggregate(&[rr(1000, 0, 0, 0)]).mos;
    // about 100ms
    let delayed = aggregate(&[rr(1000, 0, 0, 6554)]).mos;
    assert!(delayed < perfect);
    assert!(delayed > 4.0, "mos {}", delayed);
}

#[test]
fn test_heavy_loss_clamps_to_floor() {
    let metrics = aggregate(&[rr(100, 50, 0, 0)]);
    assert_eq!(metrics.packet_lost_rate, 50.0);
    assert_eq!(metrics.mos, 1.0);

    // moderate loss stays above the floor
    let metrics = aggregate(&[rr(100, 5, 0, 0)]);
    assert!(metrics.mos > 3.5 && metrics.mos < 4.3, "mos {}", metrics.mos);
}

#[test]
fn test_voip_metrics_block_drives_mos() {
    let metrics = aggregate(&[xr(0, 1000), rr(50, 0, 0, 0)]);
    assert!((metrics.mos - 4.5).abs() < 1e-9);
    assert_eq!(metrics.delay_avg, 1000);

    let metrics = aggregate(&[xr(0, 0), xr(128, 0)]);
    // R = 100 and R = 50
    let expected = (4.5 + (1.0 + 0.035 * 50.0 + 7e-6 * 50.0 * -10.0 * 50.0)) / 2.0;
    assert!((metrics.mos - expected).abs() < 1e-9);

    // non VoIP XR blocks are ignored
    let mut other = xr(0, 0);
    other.report_blocks_xr.as_mut().unwrap().block_type = 4;
    assert!(other.voip_metrics().is_none());
}

fn rtcp_envelope(call_id: Option<&str>, src: &str, dst: &str, payload: &str) -> Envelope {
    Envelope {
        version: HepVersion::V3,
        ip_family: 2,
        ip_protocol: 17,
        src: src.parse().unwrap(),
        dst: dst.parse().unwrap(),
        timestamp_sec: 1_700_000_000,
        timestamp_usec: 0,
        protocol_type: ProtocolType::Rtcp,
        capture_id: 1,
        keepalive_timer: 0,
        auth_key: None,
        correlation_id: call_id.map(str::to_string),
        payload: Bytes::from(payload.to_string()),
    }
}

const RR_JSON: &str = r#"{"ssrc":1,"type":201,"report_count":1,"report_blocks":[{"source_ssrc":2,"fraction_lost":0,"packets_lost":2,"highest_seq_no":200,"ia_jitter":10,"lsr":0,"dlsr":0}]}"#;

#[tokio::test]
async fn test_service_groups_packets_by_leg() {
    let service = RtcpReportService::new(std::time::Duration::from_secs(180));
    let a = ("10.0.0.1:20000", "10.0.0.2:30000");
    let b = ("10.0.0.2:30000", "10.0.0.1:20000");

    for (src, dst) in [a, b, a] {
        let envelope = rtcp_envelope(Some("call-1"), src, dst, RR_JSON);
        assert!(service.receive("192.168.0.5", &envelope).expect("receive"));
    }
    let legs = service.legs("call-1");
    assert_eq!(legs.len(), 2);
    assert_eq!(legs[0].src, a.0.parse::<SocketAddr>().unwrap());
    assert_eq!(legs[0].packets.len(), 2);
    assert_eq!(legs[1].packets.len(), 1);
    assert_eq!(legs[0].packets[0].timestamp_micro, 1_700_000_000_000_000);

    let (report, raws) = service.finalize("call-1").expect("report");
    assert_eq!(report.call_id, "call-1");
    assert_eq!(report.node_ip, "192.168.0.5");
    assert_eq!(report.src_addr, "10.0.0.1:20000");
    assert_eq!(report.a_leg.packet_count, 200);
    assert_eq!(report.b_leg.packet_count, 200);
    assert_eq!(report.a_leg.packet_lost, 2);
    assert_eq!(raws.len(), 3);
    assert!(raws.iter().all(|r| r.raw == RR_JSON));
    assert_eq!(raws[0].create_time.timestamp(), 1_700_000_000);

    assert!(service.is_empty());
    assert!(service.finalize("call-1").is_none());
}

#[tokio::test]
async fn test_service_ignores_unbound_packets() {
    let service = RtcpReportService::new(std::time::Duration::from_secs(180));
    let unbound = rtcp_envelope(None, "10.0.0.1:1", "10.0.0.2:2", RR_JSON);
    assert!(!service.receive("n", &unbound).expect("receive"));

    let mut sip = rtcp_envelope(Some("c"), "10.0.0.1:1", "10.0.0.2:2", RR_JSON);
    sip.protocol_type = ProtocolType::Sip;
    assert!(!service.receive("n", &sip).expect("receive"));

    let broken = rtcp_envelope(Some("c"), "10.0.0.1:1", "10.0.0.2:2", "{oops");
    assert!(service.receive("n", &broken).is_err());
    assert!(service.is_empty());
}

#[tokio::test]
async fn test_cleanup_expired_in_batches() {
    let service = RtcpReportService::new(std::time::Duration::from_secs(180));
    let now = Utc::now();
    let src: SocketAddr = "10.0.0.1:1".parse().unwrap();
    let dst: SocketAddr = "10.0.0.2:2".parse().unwrap();

    for i in 0..250 {
        service.add_packet(
            "n",
            &format!("stale-{}", i),
            src,
            dst,
            rr(1, 0, 0, 0),
            now - Duration::seconds(300),
        );
    }
    service.add_packet("n", "fresh", src, dst, rr(1, 0, 0, 0), now - Duration::seconds(10));
    assert_eq!(service.len(), 251);

    assert_eq!(service.cleanup_expired(now).await, 250);
    assert_eq!(service.len(), 1);
    assert_eq!(service.legs("fresh").len(), 1);
    assert_eq!(service.cleanup_expired(now).await, 0);
}
