use super::{trim, uri::Uri};

const RESPONSE_PREFIX: &[u8] = b"SIP/2.0 ";

/// First line of a SIP message.
///
/// `INVITE sip:01798300765@87.252.61.202;user=phone SIP/2.0` or `SIP/2.0 200 OK`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    /// Empty for responses.
    pub method: &'a [u8],
    pub uri: Uri<'a>,
    pub version: &'a [u8],
    pub status_code: &'a [u8],
    pub status_desc: &'a [u8],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineState {
    Method,
    Uri,
    Version,
}

impl<'a> RequestLine<'a> {
    pub fn parse(line: &'a [u8]) -> Self {
        let line = trim(line);
        let mut out = RequestLine::default();

        if let Some(status) = line.strip_prefix(RESPONSE_PREFIX) {
            out.version = &line[..RESPONSE_PREFIX.len() - 1];
            let status = trim(status);
            match status.iter().position(|c| *c == b' ') {
                Some(space) => {
                    out.status_code = &status[..space];
                    out.status_desc = trim(&status[space + 1..]);
                }
                None => out.status_code = status,
            }
            return out;
        }

        let mut state = LineState::Method;
        let mut start = 0;
        let mut end = line.len();
        for (pos, c) in line.iter().enumerate() {
            if *c != b' ' {
                continue;
            }
            match state {
                LineState::Method => {
                    out.method = &line[..pos];
                    start = pos + 1;
                    state = LineState::Uri;
                }
                LineState::Uri => {
                    out.uri = Uri::parse(&line[start..pos]);
                    start = pos + 1;
                    state = LineState::Version;
                }
                LineState::Version => {
                    end = pos;
                    break;
                }
            }
        }
        match state {
            // a lone token is not a request line
            LineState::Method => {}
            LineState::Uri => out.uri = Uri::parse(&line[start..]),
            LineState::Version => out.version = trim(&line[start..end]),
        }
        if !out.method.iter().all(|c| c.is_ascii_uppercase()) {
            return RequestLine::default();
        }
        out
    }

    pub fn is_response(&self) -> bool {
        !self.status_code.is_empty()
    }
}
