//! HEP (Homer Encapsulation Protocol) envelope decoding.
//!
//! Capture agents wrap every SIP message or RTCP report they see into a HEP
//! datagram. Three wire versions are in the field: the fixed layouts of HEPv1
//! and HEPv2, and the chunked (type-length-value) layout of HEPv3.
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const HEP1_ID: u8 = 0x01;
pub const HEP2_ID: u8 = 0x02;
/// First byte of the `HEP3` magic.
pub const HEP3_ID: u8 = 0x48;
const HEP3_MAGIC: &[u8; 4] = b"HEP3";

const HEP1_MIN_LENGTH: usize = 21;
const HEP2_MIN_LENGTH: usize = 31;
const HEP1_PAYLOAD_OFFSET: usize = 16;
const HEP2_PAYLOAD_OFFSET: usize = 28;
const HEP3_HEADER_LENGTH: usize = 6;
const CHUNK_HEADER_LENGTH: usize = 6;

// HEPv3 generic chunk types
const CHUNK_IP_FAMILY: u16 = 1;
const CHUNK_IP_PROTOCOL_ID: u16 = 2;
const CHUNK_IP4_SRC: u16 = 3;
const CHUNK_IP4_DST: u16 = 4;
const CHUNK_IP6_SRC: u16 = 5;
const CHUNK_IP6_DST: u16 = 6;
const CHUNK_SRC_PORT: u16 = 7;
const CHUNK_DST_PORT: u16 = 8;
const CHUNK_TIMESTAMP: u16 = 9;
const CHUNK_TIMESTAMP_MICRO: u16 = 10;
const CHUNK_PROTOCOL_TYPE: u16 = 11;
const CHUNK_CAPTURE_ID: u16 = 12;
const CHUNK_KEEPALIVE_TIMER: u16 = 13;
const CHUNK_AUTH_KEY: u16 = 14;
const CHUNK_PAYLOAD: u16 = 15;
const CHUNK_CORRELATION_ID: u16 = 17;

const FAMILY_IPV4: u8 = 2;
const FAMILY_IPV6: u8 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unsupported HEP version byte 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("HEPv{version} packet too short: needed {needed} bytes, got {got}")]
    TooShort {
        version: u8,
        needed: usize,
        got: usize,
    },
    #[error("HEP3 packet truncated at offset {offset}: declared {declared} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        declared: usize,
        remaining: usize,
    },
    #[error("malformed HEP3 chunk type {chunk_type} with length {length}")]
    MalformedChunk { chunk_type: u16, length: usize },
    #[error("HEP payload is empty")]
    EmptyPayload,
    #[error("HEP payload too small: {len} bytes, minimum {min}")]
    PayloadTooSmall { len: usize, min: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HepVersion {
    V1,
    V2,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Sip,
    Xmpp,
    Sdp,
    Rtp,
    Rtcp,
    Other(u8),
}

impl From<u8> for ProtocolType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ProtocolType::Sip,
            0x02 => ProtocolType::Xmpp,
            0x03 => ProtocolType::Sdp,
            0x04 => ProtocolType::Rtp,
            0x05 => ProtocolType::Rtcp,
            other => ProtocolType::Other(other),
        }
    }
}

impl From<ProtocolType> for u8 {
    fn from(value: ProtocolType) -> Self {
        match value {
            ProtocolType::Sip => 0x01,
            ProtocolType::Xmpp => 0x02,
            ProtocolType::Sdp => 0x03,
            ProtocolType::Rtp => 0x04,
            ProtocolType::Rtcp => 0x05,
            ProtocolType::Other(other) => other,
        }
    }
}

/// One decoded HEP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: HepVersion,
    pub ip_family: u8,
    pub ip_protocol: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub timestamp_sec: u32,
    pub timestamp_usec: u32,
    pub protocol_type: ProtocolType,
    pub capture_id: u32,
    pub keepalive_timer: u16,
    pub auth_key: Option<String>,
    /// Internal correlation key, set by agents on RTCP reports to name the call.
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl Envelope {
    /// Capture time reported by the agent, `None` when the agent sent no timestamp.
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp_sec == 0 {
            return None;
        }
        let micros = self.timestamp_sec as i64 * 1_000_000 + self.timestamp_usec as i64;
        DateTime::from_timestamp_micros(micros)
    }

    /// Reject payloads that are empty or shorter than `min_length`.
    pub fn check_payload(&self, min_length: usize) -> Result<(), DecodeError> {
        let len = self.payload.len();
        if len == 0 {
            return Err(DecodeError::EmptyPayload);
        }
        if len < min_length {
            return Err(DecodeError::PayloadTooSmall {
                len,
                min: min_length,
            });
        }
        Ok(())
    }
}

pub fn decode(datagram: &[u8]) -> Result<Envelope, DecodeError> {
    match datagram.first() {
        None => Err(DecodeError::Empty),
        Some(&HEP1_ID) => decode_legacy(datagram, HepVersion::V1),
        Some(&HEP2_ID) => decode_legacy(datagram, HepVersion::V2),
        Some(&HEP3_ID) => decode_chunked(datagram),
        Some(&other) => Err(DecodeError::UnsupportedVersion(other)),
    }
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}

fn decode_legacy(data: &[u8], version: HepVersion) -> Result<Envelope, DecodeError> {
    let (needed, version_no) = match version {
        HepVersion::V1 => (HEP1_MIN_LENGTH, 1),
        _ => (HEP2_MIN_LENGTH, 2),
    };
    if data.len() < needed {
        return Err(DecodeError::TooShort {
            version: version_no,
            needed,
            got: data.len(),
        });
    }

    let src_port = BigEndian::read_u16(&data[4..6]);
    let dst_port = BigEndian::read_u16(&data[6..8]);
    let src_ip = ipv4_at(data, 8);
    let dst_ip = ipv4_at(data, 12);

    let (timestamp_sec, timestamp_usec, capture_id, payload_offset) = match version {
        HepVersion::V1 => (0, 0, 0, HEP1_PAYLOAD_OFFSET),
        _ => (
            LittleEndian::read_u32(&data[16..20]),
            LittleEndian::read_u32(&data[20..24]),
            BigEndian::read_u16(&data[24..26]) as u32,
            HEP2_PAYLOAD_OFFSET,
        ),
    };

    Ok(Envelope {
        version,
        ip_family: data[2],
        ip_protocol: data[3],
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        timestamp_sec,
        timestamp_usec,
        // legacy versions only ever carried SIP
        protocol_type: ProtocolType::Sip,
        capture_id,
        keepalive_timer: 0,
        auth_key: None,
        correlation_id: None,
        payload: Bytes::copy_from_slice(&data[payload_offset..]),
    })
}

fn malformed(chunk_type: u16, body: &[u8]) -> DecodeError {
    DecodeError::MalformedChunk {
        chunk_type,
        length: body.len() + CHUNK_HEADER_LENGTH,
    }
}

fn chunk_u8(chunk_type: u16, body: &[u8]) -> Result<u8, DecodeError> {
    match body {
        [value] => Ok(*value),
        _ => Err(malformed(chunk_type, body)),
    }
}

fn chunk_u16(chunk_type: u16, body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() != 2 {
        return Err(malformed(chunk_type, body));
    }
    Ok(BigEndian::read_u16(body))
}

fn chunk_u32(chunk_type: u16, body: &[u8]) -> Result<u32, DecodeError> {
    if body.len() != 4 {
        return Err(malformed(chunk_type, body));
    }
    Ok(BigEndian::read_u32(body))
}

fn chunk_ipv4(chunk_type: u16, body: &[u8]) -> Result<Ipv4Addr, DecodeError> {
    let octets: [u8; 4] = body.try_into().map_err(|_| malformed(chunk_type, body))?;
    Ok(Ipv4Addr::from(octets))
}

fn chunk_ipv6(chunk_type: u16, body: &[u8]) -> Result<Ipv6Addr, DecodeError> {
    let octets: [u8; 16] = body.try_into().map_err(|_| malformed(chunk_type, body))?;
    Ok(Ipv6Addr::from(octets))
}

fn decode_chunked(data: &[u8]) -> Result<Envelope, DecodeError> {
    if data.len() < HEP3_HEADER_LENGTH {
        return Err(DecodeError::TooShort {
            version: 3,
            needed: HEP3_HEADER_LENGTH,
            got: data.len(),
        });
    }
    let total = BigEndian::read_u16(&data[4..6]) as usize;
    if total > data.len() {
        return Err(DecodeError::Truncated {
            offset: 0,
            declared: total,
            remaining: data.len(),
        });
    }

    let mut ip_family = 0;
    let mut ip_protocol = 0;
    let mut ip4_src = None;
    let mut ip4_dst = None;
    let mut ip6_src = None;
    let mut ip6_dst = None;
    let mut src_port = 0;
    let mut dst_port = 0;
    let mut timestamp_sec = 0;
    let mut timestamp_usec = 0;
    let mut protocol_type = ProtocolType::Other(0);
    let mut capture_id = 0;
    let mut keepalive_timer = 0;
    let mut auth_key = None;
    let mut correlation_id = None;
    let mut payload: Vec<u8> = Vec::new();

    let mut cursor = HEP3_HEADER_LENGTH;
    while cursor < total {
        let remaining = total - cursor;
        if remaining < CHUNK_HEADER_LENGTH {
            return Err(DecodeError::Truncated {
                offset: cursor,
                declared: CHUNK_HEADER_LENGTH,
                remaining,
            });
        }
        let chunk = &data[cursor..total];
        let chunk_type = BigEndian::read_u16(&chunk[2..4]);
        let length = BigEndian::read_u16(&chunk[4..6]) as usize;
        if length < CHUNK_HEADER_LENGTH {
            return Err(DecodeError::MalformedChunk { chunk_type, length });
        }
        if length > remaining {
            return Err(DecodeError::Truncated {
                offset: cursor,
                declared: length,
                remaining,
            });
        }
        let body = &chunk[CHUNK_HEADER_LENGTH..length];

        match chunk_type {
            CHUNK_IP_FAMILY => ip_family = chunk_u8(chunk_type, body)?,
            CHUNK_IP_PROTOCOL_ID => ip_protocol = chunk_u8(chunk_type, body)?,
            CHUNK_IP4_SRC => ip4_src = Some(chunk_ipv4(chunk_type, body)?),
            CHUNK_IP4_DST => ip4_dst = Some(chunk_ipv4(chunk_type, body)?),
            CHUNK_IP6_SRC => ip6_src = Some(chunk_ipv6(chunk_type, body)?),
            CHUNK_IP6_DST => ip6_dst = Some(chunk_ipv6(chunk_type, body)?),
            CHUNK_SRC_PORT => src_port = chunk_u16(chunk_type, body)?,
            CHUNK_DST_PORT => dst_port = chunk_u16(chunk_type, body)?,
            CHUNK_TIMESTAMP => timestamp_sec = chunk_u32(chunk_type, body)?,
            CHUNK_TIMESTAMP_MICRO => timestamp_usec = chunk_u32(chunk_type, body)?,
            CHUNK_PROTOCOL_TYPE => protocol_type = chunk_u8(chunk_type, body)?.into(),
            CHUNK_CAPTURE_ID => {
                capture_id = match body.len() {
                    2 => BigEndian::read_u16(body) as u32,
                    4 => BigEndian::read_u32(body),
                    _ => return Err(malformed(chunk_type, body)),
                }
            }
            CHUNK_KEEPALIVE_TIMER => keepalive_timer = chunk_u16(chunk_type, body)?,
            CHUNK_AUTH_KEY => auth_key = Some(String::from_utf8_lossy(body).into_owned()),
            CHUNK_PAYLOAD => payload.extend_from_slice(body),
            CHUNK_CORRELATION_ID => {
                correlation_id = Some(String::from_utf8_lossy(body).into_owned())
            }
            _ => {}
        }
        cursor += length;
    }

    let src_ip = ip4_src
        .map(IpAddr::V4)
        .or(ip6_src.map(IpAddr::V6))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let dst_ip = ip4_dst
        .map(IpAddr::V4)
        .or(ip6_dst.map(IpAddr::V6))
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    Ok(Envelope {
        version: HepVersion::V3,
        ip_family,
        ip_protocol,
        src: SocketAddr::new(src_ip, src_port),
        dst: SocketAddr::new(dst_ip, dst_port),
        timestamp_sec,
        timestamp_usec,
        protocol_type,
        capture_id,
        keepalive_timer,
        auth_key,
        correlation_id,
        payload: payload.into(),
    })
}

fn push_chunk(buf: &mut Vec<u8>, chunk_type: u16, body: &[u8]) {
    buf.extend_from_slice(&0u16.to_be_bytes()); // vendor: generic
    buf.extend_from_slice(&chunk_type.to_be_bytes());
    buf.extend_from_slice(&((body.len() + CHUNK_HEADER_LENGTH) as u16).to_be_bytes());
    buf.extend_from_slice(body);
}

fn push_ip(buf: &mut Vec<u8>, v4_type: u16, v6_type: u16, ip: IpAddr) {
    match ip {
        IpAddr::V4(ip) => push_chunk(buf, v4_type, &ip.octets()),
        IpAddr::V6(ip) => push_chunk(buf, v6_type, &ip.octets()),
    }
}

/// Encode an envelope as a HEPv3 datagram, used to replay or forward captures.
pub fn encode_hep3(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEP3_HEADER_LENGTH + 96 + envelope.payload.len());
    buf.extend_from_slice(HEP3_MAGIC);
    buf.extend_from_slice(&0u16.to_be_bytes()); // patched below

    let family = match envelope.src.ip() {
        IpAddr::V4(_) => FAMILY_IPV4,
        IpAddr::V6(_) => FAMILY_IPV6,
    };
    push_chunk(&mut buf, CHUNK_IP_FAMILY, &[family]);
    push_chunk(&mut buf, CHUNK_IP_PROTOCOL_ID, &[envelope.ip_protocol]);
    push_ip(&mut buf, CHUNK_IP4_SRC, CHUNK_IP6_SRC, envelope.src.ip());
    push_ip(&mut buf, CHUNK_IP4_DST, CHUNK_IP6_DST, envelope.dst.ip());
    push_chunk(&mut buf, CHUNK_SRC_PORT, &envelope.src.port().to_be_bytes());
    push_chunk(&mut buf, CHUNK_DST_PORT, &envelope.dst.port().to_be_bytes());
    push_chunk(&mut buf, CHUNK_TIMESTAMP, &envelope.timestamp_sec.to_be_bytes());
    push_chunk(
        &mut buf,
        CHUNK_TIMESTAMP_MICRO,
        &envelope.timestamp_usec.to_be_bytes(),
    );
    push_chunk(
        &mut buf,
        CHUNK_PROTOCOL_TYPE,
        &[u8::from(envelope.protocol_type)],
    );
    push_chunk(&mut buf, CHUNK_CAPTURE_ID, &envelope.capture_id.to_be_bytes());
    if envelope.keepalive_timer > 0 {
        push_chunk(
            &mut buf,
            CHUNK_KEEPALIVE_TIMER,
            &envelope.keepalive_timer.to_be_bytes(),
        );
    }
    if let Some(ref key) = envelope.auth_key {
        push_chunk(&mut buf, CHUNK_AUTH_KEY, key.as_bytes());
    }
    if let Some(ref correlation_id) = envelope.correlation_id {
        push_chunk(&mut buf, CHUNK_CORRELATION_ID, correlation_id.as_bytes());
    }
    push_chunk(&mut buf, CHUNK_PAYLOAD, &envelope.payload);

    let total = buf.len() as u16;
    buf[4..6].copy_from_slice(&total.to_be_bytes());
    buf
}
