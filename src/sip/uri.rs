//! URI and name-addr scanners.
//!
//! Handles the forms seen in From/To/Contact headers and request lines:
//!
//! ```text
//! "Bob" <sips:bob@biloxi.com> ;tag=a48s
//! sip:+12125551212@phone2net.com;tag=887s
//! Anonymous <sip:c8oqz84zk7z@privacy.org>;tag=hyh8
//! sip:carol@chicago.com
//! ```
//!
//! A URI without `@` has an empty user and everything up to the first `;`
//! is the host.
use super::trim;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    #[default]
    None,
    Sip,
    Sips,
    Tel,
    Other,
}

impl UriScheme {
    fn from_bytes(v: &[u8]) -> Self {
        if v.eq_ignore_ascii_case(b"sip") {
            UriScheme::Sip
        } else if v.eq_ignore_ascii_case(b"sips") {
            UriScheme::Sips
        } else if v.eq_ignore_ascii_case(b"tel") {
            UriScheme::Tel
        } else {
            UriScheme::Other
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Uri<'a> {
    pub scheme: UriScheme,
    pub user: &'a [u8],
    pub host: &'a [u8],
    pub port: &'a [u8],
    pub transport: &'a [u8],
    pub user_type: &'a [u8],
    pub maddr: &'a [u8],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NameAddr<'a> {
    pub name: &'a [u8],
    pub uri: Uri<'a>,
    pub tag: &'a [u8],
    pub expires: &'a [u8],
    pub q: &'a [u8],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum UriState {
    Scheme,
    User,
    // saw `:` inside the user part; either a password or a port of a host-only URI
    UserColon,
    Host,
    HostV6,
    Port,
}

impl<'a> Uri<'a> {
    /// Scan a bare URI, applying any `;` parameters to the URI itself.
    pub fn parse(v: &'a [u8]) -> Self {
        let (mut uri, params) = Self::scan(v);
        for (name, value) in Params::new(params) {
            uri.apply_param(name, value);
        }
        uri
    }

    /// Scan up to the first parameter, returning the unconsumed parameter tail.
    pub(crate) fn scan(v: &'a [u8]) -> (Self, &'a [u8]) {
        let mut uri = Uri::default();
        let mut state = UriState::Scheme;
        let mut start = 0;
        // end of the user span when a `:` was seen inside it
        let mut colon = 0;
        let mut params: &'a [u8] = &[];

        let mut pos = 0;
        while pos < v.len() {
            let c = v[pos];
            match state {
                UriState::Scheme => {
                    if c == b':' {
                        uri.scheme = UriScheme::from_bytes(trim(&v[..pos]));
                        start = pos + 1;
                        state = if v.get(start) == Some(&b'[') {
                            UriState::HostV6
                        } else {
                            UriState::User
                        };
                    }
                }
                UriState::User => match c {
                    b'@' => {
                        uri.user = &v[start..pos];
                        start = pos + 1;
                        state = UriState::Host;
                    }
                    b':' => {
                        colon = pos;
                        state = UriState::UserColon;
                    }
                    b';' => {
                        uri.host = &v[start..pos];
                        params = &v[pos..];
                        break;
                    }
                    _ => {}
                },
                UriState::UserColon => match c {
                    b'@' => {
                        uri.user = &v[start..colon];
                        start = pos + 1;
                        state = UriState::Host;
                    }
                    b';' => {
                        uri.host = &v[start..colon];
                        uri.port = &v[colon + 1..pos];
                        params = &v[pos..];
                        break;
                    }
                    _ => {}
                },
                UriState::Host => match c {
                    b'[' if pos == start => state = UriState::HostV6,
                    b':' => {
                        uri.host = &v[start..pos];
                        start = pos + 1;
                        state = UriState::Port;
                    }
                    b';' => {
                        uri.host = &v[start..pos];
                        params = &v[pos..];
                        break;
                    }
                    _ => {}
                },
                UriState::HostV6 => {
                    if c == b']' {
                        uri.host = &v[start..=pos];
                        start = pos + 1;
                        state = UriState::Port;
                    }
                }
                UriState::Port => {
                    if c == b';' {
                        if pos > start {
                            uri.port = &v[start..pos];
                        }
                        params = &v[pos..];
                        break;
                    }
                    if c == b':' && pos == start {
                        start = pos + 1;
                    }
                }
            }
            pos += 1;
        }

        if params.is_empty() {
            // input exhausted without reaching parameters
            match state {
                UriState::Scheme => {}
                UriState::User => uri.host = &v[start..],
                UriState::UserColon => {
                    uri.host = &v[start..colon];
                    uri.port = &v[colon + 1..];
                }
                UriState::Host | UriState::HostV6 => uri.host = &v[start..],
                UriState::Port => {
                    if start < v.len() {
                        uri.port = &v[start..];
                    }
                }
            }
        }
        uri.user = trim(uri.user);
        uri.host = trim(uri.host);
        uri.port = trim(uri.port);
        (uri, params)
    }

    fn apply_param(&mut self, name: &'a [u8], value: &'a [u8]) -> bool {
        if name.eq_ignore_ascii_case(b"transport") {
            self.transport = value;
        } else if name.eq_ignore_ascii_case(b"user") {
            self.user_type = value;
        } else if name.eq_ignore_ascii_case(b"maddr") {
            self.maddr = value;
        } else {
            return false;
        }
        true
    }
}

impl<'a> NameAddr<'a> {
    pub fn parse(v: &'a [u8]) -> Self {
        let v = trim(v);
        let mut addr = NameAddr::default();

        let Some(lt) = find_unquoted(v, b'<') else {
            let (uri, params) = Uri::scan(v);
            addr.uri = uri;
            for (name, value) in Params::new(params) {
                addr.apply_param(name, value);
            }
            return addr;
        };

        addr.name = unquote(trim(&v[..lt]));
        let inner = &v[lt + 1..];
        let (uri_part, header_params) = match inner.iter().position(|c| *c == b'>') {
            Some(gt) => (&inner[..gt], &inner[gt + 1..]),
            None => (inner, &inner[inner.len()..]),
        };
        addr.uri = Uri::parse(uri_part);
        for (name, value) in Params::new(header_params) {
            addr.apply_param(name, value);
        }
        addr
    }

    fn apply_param(&mut self, name: &'a [u8], value: &'a [u8]) {
        if name.eq_ignore_ascii_case(b"tag") {
            self.tag = value;
        } else if name.eq_ignore_ascii_case(b"expires") {
            self.expires = value;
        } else if name.eq_ignore_ascii_case(b"q") {
            self.q = value;
        } else {
            self.uri.apply_param(name, value);
        }
    }
}

/// Position of `needle` outside any quoted string, honouring `\"` escapes.
fn find_unquoted(v: &[u8], needle: u8) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (pos, c) in v.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if quoted {
            match *c {
                b'\\' => escaped = true,
                b'"' => quoted = false,
                _ => {}
            }
        } else if *c == b'"' {
            quoted = true;
        } else if *c == needle {
            return Some(pos);
        }
    }
    None
}

fn unquote(v: &[u8]) -> &[u8] {
    match v {
        [b'"', inner @ .., b'"'] => inner,
        _ => v,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParamState {
    Name,
    Value,
}

/// Iterator over `;name=value` pairs. Flag parameters yield an empty value.
pub(crate) struct Params<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Params<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }
}

impl<'a> Iterator for Params<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.input;
        while self.pos < v.len() {
            if v[self.pos] == b';' || v[self.pos] == b' ' || v[self.pos] == b'\t' {
                self.pos += 1;
                continue;
            }
            let mut state = ParamState::Name;
            let start = self.pos;
            let mut name_end = v.len();
            let mut value_start = v.len();
            while self.pos < v.len() && v[self.pos] != b';' {
                if state == ParamState::Name && v[self.pos] == b'=' {
                    name_end = self.pos;
                    value_start = self.pos + 1;
                    state = ParamState::Value;
                }
                self.pos += 1;
            }
            let end = self.pos;
            let (name, value) = match state {
                ParamState::Name => (&v[start..end], &v[end..end]),
                ParamState::Value => (&v[start..name_end], &v[value_start..end]),
            };
            let name = trim(name);
            if name.is_empty() {
                continue;
            }
            return Some((name, trim(value)));
        }
        None
    }
}
