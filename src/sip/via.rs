use super::{trim, uri::Params};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    #[default]
    Unknown,
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Transport {
    fn from_bytes(v: &[u8]) -> Self {
        const TABLE: [(&[u8], Transport); 6] = [
            (b"udp", Transport::Udp),
            (b"tcp", Transport::Tcp),
            (b"tls", Transport::Tls),
            (b"sctp", Transport::Sctp),
            (b"ws", Transport::Ws),
            (b"wss", Transport::Wss),
        ];
        TABLE
            .iter()
            .find(|(name, _)| v.eq_ignore_ascii_case(name))
            .map(|(_, t)| *t)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Via<'a> {
    pub transport: Transport,
    pub host: &'a [u8],
    pub port: &'a [u8],
    pub branch: &'a [u8],
    pub received: &'a [u8],
    pub rport: &'a [u8],
    pub maddr: &'a [u8],
    pub ttl: &'a [u8],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ViaState {
    Protocol,
    Gap,
    Host,
    HostV6,
    Port,
}

impl<'a> Via<'a> {
    /// One `Via` value, e.g. `SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds`.
    pub fn parse(v: &'a [u8]) -> Self {
        let v = trim(v);
        let mut via = Via::default();
        let mut state = ViaState::Protocol;
        // start of the last `/`-separated protocol segment, then of host/port
        let mut start = 0;
        let mut params: &'a [u8] = &[];

        let mut pos = 0;
        while pos < v.len() {
            let c = v[pos];
            match state {
                ViaState::Protocol => match c {
                    b'/' => start = pos + 1,
                    b' ' | b'\t' => {
                        via.transport = Transport::from_bytes(&v[start..pos]);
                        state = ViaState::Gap;
                    }
                    _ => {}
                },
                ViaState::Gap => {
                    if c != b' ' && c != b'\t' {
                        start = pos;
                        state = if c == b'[' {
                            ViaState::HostV6
                        } else {
                            ViaState::Host
                        };
                    }
                }
                ViaState::Host => match c {
                    b':' => {
                        via.host = &v[start..pos];
                        start = pos + 1;
                        state = ViaState::Port;
                    }
                    b';' => {
                        via.host = &v[start..pos];
                        params = &v[pos..];
                        break;
                    }
                    _ => {}
                },
                ViaState::HostV6 => {
                    if c == b']' {
                        via.host = &v[start..=pos];
                        start = pos + 1;
                        state = ViaState::Port;
                    }
                }
                ViaState::Port => match c {
                    b':' if pos == start => start = pos + 1,
                    b';' => {
                        via.port = &v[start..pos];
                        params = &v[pos..];
                        break;
                    }
                    _ => {}
                },
            }
            pos += 1;
        }

        if params.is_empty() {
            match state {
                ViaState::Protocol => via.transport = Transport::from_bytes(&v[start..]),
                ViaState::Gap => {}
                ViaState::Host | ViaState::HostV6 => via.host = &v[start..],
                ViaState::Port => via.port = &v[start.min(v.len())..],
            }
        }
        via.host = trim(via.host);
        via.port = trim(via.port);

        for (name, value) in Params::new(params) {
            via.apply_param(name, value);
        }
        via
    }

    fn apply_param(&mut self, name: &'a [u8], value: &'a [u8]) {
        if name.eq_ignore_ascii_case(b"branch") {
            self.branch = value;
        } else if name.eq_ignore_ascii_case(b"received") {
            self.received = value;
        } else if name.eq_ignore_ascii_case(b"rport") {
            self.rport = value;
        } else if name.eq_ignore_ascii_case(b"maddr") {
            self.maddr = value;
        } else if name.eq_ignore_ascii_case(b"ttl") {
            self.ttl = value;
        }
    }
}

/// A Via header line may carry several comma separated values.
pub fn parse_via_values<'a>(v: &'a [u8], out: &mut Vec<Via<'a>>) {
    out.extend(
        v.split(|c| *c == b',')
            .map(trim)
            .filter(|value| !value.is_empty())
            .map(Via::parse),
    );
}
