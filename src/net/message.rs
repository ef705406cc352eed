//! Request and response bodies on top of the frame layer.
//!
//! Point reads answer with the single-tuple shape (`ttl · keylen · key ·
//! value-to-end`); prefix reads answer with a counted list of tuples, each
//! carrying an explicit value length, and set the prefix bit in the response
//! header so clients know which shape to parse.

use super::codec::{encode_frame, split_frame, Header, Opcode, ProtocolError};

/// Return code: success.
pub const OK: u8 = 0;
/// Return code: failure (missing key, type mismatch, empty delete set).
pub const NOK: u8 = 1;

/// One `(ttl, key, value)` unit of a read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub ttl: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decoded request, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put {
        prefix: bool,
        ttl: i32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Get {
        prefix: bool,
        key: Vec<u8>,
    },
    Del {
        prefix: bool,
        key: Vec<u8>,
    },
    Ttl {
        ttl: i32,
        key: Vec<u8>,
    },
    Inc {
        prefix: bool,
        key: Vec<u8>,
    },
    Dec {
        prefix: bool,
        key: Vec<u8>,
    },
    Count {
        prefix: bool,
        key: Vec<u8>,
    },
    Use {
        name: Vec<u8>,
    },
    Keys {
        prefix: Vec<u8>,
    },
    Ping,
    Quit,
    DbName,
    Info,
    Flush,
    /// Cluster membership announcement; `addr` is `host:port`.
    Join {
        addr: Vec<u8>,
    },
    /// Opcodes with no request semantics (ACK) land here.
    Noop,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Put { .. } => Opcode::Put,
            Request::Get { .. } => Opcode::Get,
            Request::Del { .. } => Opcode::Del,
            Request::Ttl { .. } => Opcode::Ttl,
            Request::Inc { .. } => Opcode::Inc,
            Request::Dec { .. } => Opcode::Dec,
            Request::Count { .. } => Opcode::Count,
            Request::Use { .. } => Opcode::Use,
            Request::Keys { .. } => Opcode::Keys,
            Request::Ping => Opcode::Ping,
            Request::Quit => Opcode::Quit,
            Request::DbName => Opcode::Db,
            Request::Info => Opcode::Info,
            Request::Flush => Opcode::Flush,
            Request::Join { .. } => Opcode::Join,
            Request::Noop => Opcode::Ack,
        }
    }

    fn prefix_flag(&self) -> bool {
        match self {
            Request::Put { prefix, .. }
            | Request::Get { prefix, .. }
            | Request::Del { prefix, .. }
            | Request::Inc { prefix, .. }
            | Request::Dec { prefix, .. }
            | Request::Count { prefix, .. } => *prefix,
            _ => false,
        }
    }

    /// Encode as a complete frame. JOIN frames carry the sync flag, marking
    /// them as cluster-origin.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let header = Header::request(self.opcode())
            .with_prefix(self.prefix_flag())
            .with_sync(matches!(self, Request::Join { .. }));

        let mut body = Vec::new();
        match self {
            Request::Put { ttl, key, value, .. } => {
                put_shaped(&mut body, *ttl, key, value);
            }
            Request::Get { key, .. }
            | Request::Del { key, .. }
            | Request::Inc { key, .. }
            | Request::Dec { key, .. }
            | Request::Count { key, .. } => body.extend_from_slice(key),
            Request::Use { name } => body.extend_from_slice(name),
            Request::Keys { prefix } => body.extend_from_slice(prefix),
            Request::Ttl { ttl, key } => {
                body.extend_from_slice(&ttl.to_be_bytes());
                body.extend_from_slice(key);
            }
            Request::Join { addr } => put_shaped(&mut body, 0, addr, &[]),
            Request::Ping
            | Request::Quit
            | Request::DbName
            | Request::Info
            | Request::Flush
            | Request::Noop => {}
        }
        encode_frame(header, &body)
    }

    /// Decode a request body for an already-unpacked header.
    pub fn decode(header: Header, body: &[u8]) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::BadBody(header.opcode);
        Ok(match header.opcode {
            Opcode::Put => {
                let (ttl, key, value) = parse_put_shaped(body).ok_or_else(bad)?;
                Request::Put {
                    prefix: header.prefix,
                    ttl,
                    key,
                    value,
                }
            }
            Opcode::Get => Request::Get {
                prefix: header.prefix,
                key: body.to_vec(),
            },
            Opcode::Del => Request::Del {
                prefix: header.prefix,
                key: body.to_vec(),
            },
            Opcode::Ttl => {
                if body.len() < 4 {
                    return Err(bad());
                }
                Request::Ttl {
                    ttl: i32::from_be_bytes(body[0..4].try_into().map_err(|_| bad())?),
                    key: body[4..].to_vec(),
                }
            }
            Opcode::Inc => Request::Inc {
                prefix: header.prefix,
                key: body.to_vec(),
            },
            Opcode::Dec => Request::Dec {
                prefix: header.prefix,
                key: body.to_vec(),
            },
            Opcode::Count => Request::Count {
                prefix: header.prefix,
                key: body.to_vec(),
            },
            Opcode::Use => Request::Use {
                name: body.to_vec(),
            },
            Opcode::Keys => Request::Keys {
                prefix: body.to_vec(),
            },
            Opcode::Ping => empty_bodied(body, Request::Ping).ok_or_else(bad)?,
            Opcode::Quit => empty_bodied(body, Request::Quit).ok_or_else(bad)?,
            Opcode::Db => empty_bodied(body, Request::DbName).ok_or_else(bad)?,
            Opcode::Info => empty_bodied(body, Request::Info).ok_or_else(bad)?,
            Opcode::Flush => empty_bodied(body, Request::Flush).ok_or_else(bad)?,
            Opcode::Join => {
                let (_, addr, _) = parse_put_shaped(body).ok_or_else(bad)?;
                Request::Join { addr }
            }
            Opcode::Ack => empty_bodied(body, Request::Noop).ok_or_else(bad)?,
        })
    }
}

/// Decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack {
        code: u8,
    },
    Count(u64),
    /// Single-tuple shape; `opcode` echoes the request (GET, DB, INFO).
    Single {
        opcode: Opcode,
        tuple: Tuple,
    },
    /// Counted multi-tuple shape; the prefix bit is set on the wire.
    Many {
        opcode: Opcode,
        tuples: Vec<Tuple>,
    },
    /// JOIN reply: known cluster members as `(host, port)` pairs.
    Members(Vec<(String, u16)>),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ack { code: OK }
    }

    pub fn nok() -> Self {
        Response::Ack { code: NOK }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ack { code: OK })
    }

    /// Encode as a complete frame. `sync` marks cluster-bus frames.
    pub fn encode(&self, sync: bool) -> Result<Vec<u8>, ProtocolError> {
        let (header, body) = match self {
            Response::Ack { code } => (Header::response(Opcode::Ack), vec![*code]),
            Response::Count(count) => {
                (Header::response(Opcode::Count), count.to_be_bytes().to_vec())
            }
            Response::Single { opcode, tuple } => {
                let mut body = Vec::new();
                put_shaped(&mut body, tuple.ttl, &tuple.key, &tuple.value);
                (Header::response(*opcode), body)
            }
            Response::Many { opcode, tuples } => {
                let mut body = Vec::new();
                let count =
                    u16::try_from(tuples.len()).map_err(|_| ProtocolError::BadBody(*opcode))?;
                body.extend_from_slice(&count.to_be_bytes());
                for tuple in tuples {
                    let keylen = u16::try_from(tuple.key.len())
                        .map_err(|_| ProtocolError::BadBody(*opcode))?;
                    let vallen = u32::try_from(tuple.value.len())
                        .map_err(|_| ProtocolError::BadBody(*opcode))?;
                    body.extend_from_slice(&tuple.ttl.to_be_bytes());
                    body.extend_from_slice(&keylen.to_be_bytes());
                    body.extend_from_slice(&vallen.to_be_bytes());
                    body.extend_from_slice(&tuple.key);
                    body.extend_from_slice(&tuple.value);
                }
                (Header::response(*opcode).with_prefix(true), body)
            }
            Response::Members(members) => {
                let mut body = Vec::new();
                let count = u16::try_from(members.len())
                    .map_err(|_| ProtocolError::BadBody(Opcode::Join))?;
                body.extend_from_slice(&count.to_be_bytes());
                for (host, port) in members {
                    let hostlen = u16::try_from(host.len())
                        .map_err(|_| ProtocolError::BadBody(Opcode::Join))?;
                    body.extend_from_slice(&hostlen.to_be_bytes());
                    body.extend_from_slice(host.as_bytes());
                    body.extend_from_slice(&port.to_be_bytes());
                }
                (Header::response(Opcode::Join).with_prefix(true), body)
            }
        };
        encode_frame(header.with_sync(sync), &body)
    }

    /// Decode a complete response frame.
    pub fn decode(bytes: &[u8], max_body: usize) -> Result<Self, ProtocolError> {
        let (header, body) = split_frame(bytes, max_body)?;
        Self::decode_body(header, body)
    }

    pub fn decode_body(header: Header, body: &[u8]) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::BadBody(header.opcode);
        Ok(match header.opcode {
            Opcode::Ack => Response::Ack {
                code: *body.first().ok_or_else(bad)?,
            },
            Opcode::Count => {
                Response::Count(u64::from_be_bytes(body.try_into().map_err(|_| bad())?))
            }
            Opcode::Join => {
                let mut members = Vec::new();
                let mut rest = body;
                let count = take_u16(&mut rest).ok_or_else(bad)?;
                for _ in 0..count {
                    let hostlen = take_u16(&mut rest).ok_or_else(bad)? as usize;
                    let host = take_bytes(&mut rest, hostlen).ok_or_else(bad)?;
                    let port = take_u16(&mut rest).ok_or_else(bad)?;
                    members.push((String::from_utf8_lossy(host).into_owned(), port));
                }
                Response::Members(members)
            }
            opcode if header.prefix => {
                let mut tuples = Vec::new();
                let mut rest = body;
                let count = take_u16(&mut rest).ok_or_else(bad)?;
                for _ in 0..count {
                    let ttl_bytes = take_bytes(&mut rest, 4).ok_or_else(bad)?;
                    let ttl = i32::from_be_bytes(ttl_bytes.try_into().map_err(|_| bad())?);
                    let keylen = take_u16(&mut rest).ok_or_else(bad)? as usize;
                    let val_bytes = take_bytes(&mut rest, 4).ok_or_else(bad)?;
                    let vallen = u32::from_be_bytes(val_bytes.try_into().map_err(|_| bad())?);
                    let key = take_bytes(&mut rest, keylen).ok_or_else(bad)?.to_vec();
                    let value = take_bytes(&mut rest, vallen as usize)
                        .ok_or_else(bad)?
                        .to_vec();
                    tuples.push(Tuple { ttl, key, value });
                }
                Response::Many { opcode, tuples }
            }
            opcode => {
                let (ttl, key, value) = parse_put_shaped(body).ok_or_else(bad)?;
                Response::Single {
                    opcode,
                    tuple: Tuple { ttl, key, value },
                }
            }
        })
    }
}

/// `ttl(4) keylen(2) key value`: the PUT body and single-tuple shape.
fn put_shaped(body: &mut Vec<u8>, ttl: i32, key: &[u8], value: &[u8]) {
    body.extend_from_slice(&ttl.to_be_bytes());
    body.extend_from_slice(&(key.len() as u16).to_be_bytes());
    body.extend_from_slice(key);
    body.extend_from_slice(value);
}

fn parse_put_shaped(body: &[u8]) -> Option<(i32, Vec<u8>, Vec<u8>)> {
    if body.len() < 6 {
        return None;
    }
    let ttl = i32::from_be_bytes(body[0..4].try_into().ok()?);
    let keylen = u16::from_be_bytes(body[4..6].try_into().ok()?) as usize;
    let key = body.get(6..6 + keylen)?.to_vec();
    let value = body[6 + keylen..].to_vec();
    Some((ttl, key, value))
}

/// Empty-bodied opcodes tolerate one ignored placeholder byte.
fn empty_bodied(body: &[u8], request: Request) -> Option<Request> {
    (body.len() <= 1).then_some(request)
}

fn take_u16(rest: &mut &[u8]) -> Option<u16> {
    let bytes = take_bytes(rest, 2)?;
    Some(u16::from_be_bytes(bytes.try_into().ok()?))
}

fn take_bytes<'a>(rest: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if rest.len() < n {
        return None;
    }
    let (taken, remaining) = rest.split_at(n);
    *rest = remaining;
    Some(taken)
}
