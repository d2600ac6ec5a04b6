//! SIP message parsing.
//!
//! [`SipMsg`] is a single forward pass over the payload that borrows every
//! field from the input bytes. [`SipParser`] applies the pipeline filter on top
//! of it and builds the owned [`SipMessage`] handed to the correlator.
use crate::hep::Envelope;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

pub mod request_line;
pub mod sdp;
pub mod uri;
pub mod via;

pub use request_line::RequestLine;
pub use sdp::Sdp;
pub use uri::{NameAddr, Uri, UriScheme};
pub use via::{Transport, Via};

pub const DEFAULT_SESSION_ID_HEADER: &str = "X-JCallId";
/// Keep-alive and other non-call traffic.
pub const DEFAULT_DISCARD_METHODS: [&str; 5] = ["OPTIONS", "INFO", "MESSAGE", "SUBSCRIBE", "PUBLISH"];

pub(crate) fn trim(v: &[u8]) -> &[u8] {
    let start = v
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(v.len());
    let end = v
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &v[start..end.max(start)]
}

/// Split on LF, dropping the CR of CRLF line endings.
pub(crate) fn lines<'a>(v: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    v.split(|c| *c == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CSeq<'a> {
    pub id: &'a [u8],
    pub method: &'a [u8],
}

impl<'a> CSeq<'a> {
    pub fn parse(v: &'a [u8]) -> Self {
        let v = trim(v);
        match v.iter().position(|c| *c == b' ' || *c == b'\t') {
            Some(space) => CSeq {
                id: &v[..space],
                method: trim(&v[space + 1..]),
            },
            None => CSeq { id: v, method: &[] },
        }
    }

    pub fn number(&self) -> Option<u32> {
        std::str::from_utf8(self.id).ok()?.parse().ok()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Header {
    From,
    To,
    Via,
    Contact,
    CallId,
    ContentType,
    ContentLength,
    UserAgent,
    Expires,
    MaxForwards,
    CSeq,
}

const HEADER_TABLE: [(&[u8], Header); 18] = [
    (b"from", Header::From),
    (b"f", Header::From),
    (b"to", Header::To),
    (b"t", Header::To),
    (b"via", Header::Via),
    (b"v", Header::Via),
    (b"contact", Header::Contact),
    (b"m", Header::Contact),
    (b"call-id", Header::CallId),
    (b"i", Header::CallId),
    (b"content-type", Header::ContentType),
    (b"c", Header::ContentType),
    (b"content-length", Header::ContentLength),
    (b"l", Header::ContentLength),
    (b"user-agent", Header::UserAgent),
    (b"expires", Header::Expires),
    (b"max-forwards", Header::MaxForwards),
    (b"cseq", Header::CSeq),
];

fn header_kind(name: &[u8]) -> Option<Header> {
    HEADER_TABLE
        .iter()
        .find(|(n, _)| name.eq_ignore_ascii_case(n))
        .map(|(_, h)| *h)
}

/// A SIP message borrowing from the captured payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SipMsg<'a> {
    pub req: RequestLine<'a>,
    pub from: NameAddr<'a>,
    pub to: NameAddr<'a>,
    pub contact: NameAddr<'a>,
    pub via: Vec<Via<'a>>,
    pub cseq: CSeq<'a>,
    pub call_id: &'a [u8],
    pub user_agent: &'a [u8],
    pub expires: &'a [u8],
    pub max_forwards: &'a [u8],
    pub content_type: &'a [u8],
    pub content_length: &'a [u8],
    pub session_id: &'a [u8],
    pub sdp: Option<Sdp<'a>>,
    pub body: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> SipMsg<'a> {
    /// Parse a message, `session_header` names the custom correlation header.
    pub fn parse(payload: &'a [u8], session_header: &str) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let (head, body) = match find(payload, b"\r\n\r\n") {
            Some(pos) => (&payload[..pos], &payload[pos + 4..]),
            None => match find(payload, b"\n\n") {
                Some(pos) => (&payload[..pos], &payload[pos + 2..]),
                None => (payload, &payload[payload.len()..]),
            },
        };

        let mut msg = SipMsg {
            raw: payload,
            body,
            ..Default::default()
        };
        let mut header_lines = lines(head);
        if let Some(first) = header_lines.next() {
            msg.req = RequestLine::parse(first);
        }

        for line in header_lines {
            let Some(colon) = line.iter().position(|c| *c == b':') else {
                continue;
            };
            let name = trim(&line[..colon]);
            let value = trim(&line[colon + 1..]);
            if name.is_empty() {
                continue;
            }
            match header_kind(name) {
                Some(Header::From) => msg.from = NameAddr::parse(value),
                Some(Header::To) => msg.to = NameAddr::parse(value),
                Some(Header::Contact) => msg.contact = NameAddr::parse(value),
                Some(Header::Via) => via::parse_via_values(value, &mut msg.via),
                Some(Header::CallId) => msg.call_id = value,
                Some(Header::ContentType) => msg.content_type = value,
                Some(Header::ContentLength) => msg.content_length = value,
                Some(Header::UserAgent) => msg.user_agent = value,
                Some(Header::Expires) => msg.expires = value,
                Some(Header::MaxForwards) => msg.max_forwards = value,
                Some(Header::CSeq) => msg.cseq = CSeq::parse(value),
                None if name.eq_ignore_ascii_case(session_header.as_bytes()) => {
                    msg.session_id = value
                }
                None => {}
            }
        }

        if !body.is_empty() && is_sdp(msg.content_type) {
            msg.sdp = Some(Sdp::parse(body));
        }
        Some(msg)
    }

    pub fn is_request(&self) -> bool {
        !self.req.is_response()
    }

    /// Method for requests, status code for responses.
    pub fn title(&self) -> &'a [u8] {
        if self.req.is_response() {
            self.req.status_code
        } else {
            self.req.method
        }
    }
}

fn is_sdp(content_type: &[u8]) -> bool {
    content_type
        .windows(3)
        .any(|w| w.eq_ignore_ascii_case(b"sdp"))
}

fn text(v: &[u8]) -> String {
    String::from_utf8_lossy(v).into_owned()
}

/// A SIP message accepted into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipMessage {
    pub call_id: String,
    pub session_id: Option<String>,
    /// Method for requests, status code for responses.
    pub title: String,
    pub is_request: bool,
    pub response_code: u16,
    pub response_desc: String,
    pub cseq_number: u32,
    pub cseq_method: String,
    pub request_user: String,
    pub request_host: String,
    pub from_user: String,
    pub from_host: String,
    pub to_user: String,
    pub to_host: String,
    /// Empty on an initial INVITE, set once the dialog exists.
    #[serde(default)]
    pub to_tag: String,
    pub user_agent: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub node_id: String,
    pub node_ip: String,
    pub ip_protocol: u8,
    pub created_at: DateTime<Utc>,
    pub timestamp_micro: i64,
    #[serde(skip)]
    pub raw: Bytes,
}

impl SipMessage {
    /// An INVITE outside any dialog. Re-INVITEs carry a To tag.
    pub fn is_initial_invite(&self) -> bool {
        self.is_request
            && self.title == "INVITE"
            && self.cseq_method == "INVITE"
            && self.to_tag.is_empty()
    }
}

/// Why a payload was not turned into a [`SipMessage`]. These are filter
/// outcomes, not faults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("payload is not a SIP message")]
    NotSip,
    #[error("missing request or status line")]
    MissingTitle,
    #[error("missing Call-ID")]
    MissingCallId,
    #[error("unparsable CSeq")]
    BadCSeq,
    #[error("method {0} is discarded")]
    Discarded(String),
}

#[derive(Debug, Clone)]
pub struct SipParser {
    session_header: String,
    discard_methods: HashSet<String>,
}

impl Default for SipParser {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_ID_HEADER, &DEFAULT_DISCARD_METHODS)
    }
}

impl SipParser {
    pub fn new<S: AsRef<str>>(session_header: &str, discard_methods: &[S]) -> Self {
        Self {
            session_header: session_header.to_string(),
            discard_methods: discard_methods
                .iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn parse_message(
        &self,
        envelope: &Envelope,
        node_ip: &str,
    ) -> Result<SipMessage, Rejection> {
        let msg = SipMsg::parse(&envelope.payload, &self.session_header).ok_or(Rejection::NotSip)?;

        if msg.call_id.is_empty() {
            return Err(Rejection::MissingCallId);
        }
        let cseq_number = msg.cseq.number().ok_or(Rejection::BadCSeq)?;
        if msg.cseq.method.is_empty() {
            return Err(Rejection::BadCSeq);
        }
        let cseq_method = text(msg.cseq.method).to_ascii_uppercase();
        if self.discard_methods.contains(&cseq_method) {
            return Err(Rejection::Discarded(cseq_method));
        }
        let title = msg.title();
        if title.is_empty() {
            return Err(Rejection::MissingTitle);
        }

        let created_at = envelope.captured_at().unwrap_or_else(Utc::now);
        let response_code = if msg.req.is_response() {
            text(msg.req.status_code).parse().unwrap_or(0)
        } else {
            0
        };
        let session_id = (!msg.session_id.is_empty()).then(|| text(msg.session_id));

        Ok(SipMessage {
            call_id: text(msg.call_id),
            session_id,
            title: text(title),
            is_request: msg.is_request(),
            response_code,
            response_desc: text(msg.req.status_desc),
            cseq_number,
            cseq_method,
            request_user: text(msg.req.uri.user),
            request_host: text(msg.req.uri.host),
            from_user: text(msg.from.uri.user),
            from_host: text(msg.from.uri.host),
            to_user: text(msg.to.uri.user),
            to_host: text(msg.to.uri.host),
            to_tag: text(msg.to.tag),
            user_agent: text(msg.user_agent),
            src_addr: envelope.src.to_string(),
            dst_addr: envelope.dst.to_string(),
            node_id: envelope.capture_id.to_string(),
            node_ip: node_ip.to_string(),
            ip_protocol: envelope.ip_protocol,
            created_at,
            timestamp_micro: created_at.timestamp_micros(),
            raw: envelope.payload.clone(),
        })
    }

    /// Like [`SipParser::parse_message`], logging the rejection at debug level.
    pub fn accept(&self, envelope: &Envelope, node_ip: &str) -> Option<SipMessage> {
        match self.parse_message(envelope, node_ip) {
            Ok(msg) => Some(msg),
            Err(reason) => {
                debug!(node_ip, src = %envelope.src, %reason, "sip message rejected");
                None
            }
        }
    }
}
