use super::{lines, trim};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnData<'a> {
    pub net_type: &'a [u8],
    pub addr_type: &'a [u8],
    pub conn_addr: &'a [u8],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MediaDesc<'a> {
    pub media_type: &'a [u8],
    pub port: &'a [u8],
    pub proto: &'a [u8],
    /// Remaining format list, e.g. `0 8 101`.
    pub fmt: &'a [u8],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Attrib<'a> {
    pub cat: &'a [u8],
    pub val: &'a [u8],
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sdp<'a> {
    pub version: &'a [u8],
    pub origin: &'a [u8],
    pub session_name: &'a [u8],
    pub timing: &'a [u8],
    /// Session level `c=` line, or the first media level one when absent.
    pub conn: ConnData<'a>,
    pub media: Vec<MediaDesc<'a>>,
    pub attribs: Vec<Attrib<'a>>,
}

impl<'a> Sdp<'a> {
    pub fn parse(body: &'a [u8]) -> Self {
        let mut sdp = Sdp::default();
        for line in lines(body) {
            let line = trim(line);
            if line.len() < 2 || line[1] != b'=' {
                continue;
            }
            let value = trim(&line[2..]);
            match line[0] {
                b'v' => sdp.version = value,
                b'o' => sdp.origin = value,
                b's' => sdp.session_name = value,
                b't' => sdp.timing = value,
                b'c' if sdp.conn.conn_addr.is_empty() => sdp.conn = parse_conn_data(value),
                b'm' => sdp.media.push(parse_media_desc(value)),
                b'a' => sdp.attribs.push(parse_attrib(value)),
                _ => {}
            }
        }
        sdp
    }

    pub fn attrib(&self, cat: &str) -> Option<&'a [u8]> {
        self.attribs
            .iter()
            .find(|a| a.cat.eq_ignore_ascii_case(cat.as_bytes()))
            .map(|a| a.val)
    }
}

/// Split off the next space separated token, returning it and the trimmed rest.
fn next_token(v: &[u8]) -> (&[u8], &[u8]) {
    match v.iter().position(|c| *c == b' ' || *c == b'\t') {
        Some(end) => (&v[..end], trim(&v[end..])),
        None => (v, &v[v.len()..]),
    }
}

// c=IN IP4 224.2.36.42/127
fn parse_conn_data(v: &[u8]) -> ConnData<'_> {
    let (net_type, rest) = next_token(v);
    let (addr_type, rest) = next_token(rest);
    let (conn_addr, _) = next_token(rest);
    ConnData {
        net_type,
        addr_type,
        conn_addr,
    }
}

// m=audio 49172 RTP/AVP 0 8 101
fn parse_media_desc(v: &[u8]) -> MediaDesc<'_> {
    let (media_type, rest) = next_token(v);
    let (port, rest) = next_token(rest);
    let (proto, fmt) = next_token(rest);
    MediaDesc {
        media_type,
        port,
        proto,
        fmt,
    }
}

// a=rtpmap:0 PCMU/8000 or a flag like a=sendrecv
fn parse_attrib(v: &[u8]) -> Attrib<'_> {
    match v.iter().position(|c| *c == b':') {
        Some(colon) => Attrib {
            cat: trim(&v[..colon]),
            val: trim(&v[colon + 1..]),
        },
        None => Attrib { cat: v, val: &[] },
    }
}
