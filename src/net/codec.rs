//! Frame layer of the wire protocol.
//!
//! A frame is a 1-byte header (opcode in the high nibble, flag bits below),
//! a body length encoded as a 7-bit-continuation varint of at most 4 bytes,
//! and the body itself. All multi-byte integers inside bodies are
//! big-endian; the length varint is the only little-endian-grouped field.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Opcode lives in bits 7..4 of the header byte.
const OPCODE_SHIFT: u8 = 4;

/// Header flag: operate on a prefix instead of a single key.
pub const FLAG_PREFIX: u8 = 0b0000_1000;
/// Header flag: frame originated on the cluster bus.
pub const FLAG_SYNC: u8 = 0b0000_0100;
/// Header flag: frame is a request (clear on responses).
pub const FLAG_REQUEST: u8 = 0b0000_0010;

/// Largest body length the 4-byte varint can express (2^28 - 1).
pub const MAX_BODY_LEN: usize = (1 << 28) - 1;

const MAX_LENGTH_BYTES: usize = 4;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame shorter than its declared length")]
    ShortFrame,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("body length {len} exceeds cap {max}")]
    Oversize { len: usize, max: usize },
    #[error("body length varint does not terminate")]
    BadLength,
    #[error("malformed {0:?} body")]
    BadBody(Opcode),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Command identifiers, one per protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ack = 0,
    Put = 1,
    Get = 2,
    Del = 3,
    Ttl = 4,
    Inc = 5,
    Dec = 6,
    Count = 7,
    Use = 8,
    Keys = 9,
    Ping = 10,
    Quit = 11,
    Db = 12,
    Info = 13,
    Flush = 14,
    Join = 15,
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        Ok(match bits {
            0 => Opcode::Ack,
            1 => Opcode::Put,
            2 => Opcode::Get,
            3 => Opcode::Del,
            4 => Opcode::Ttl,
            5 => Opcode::Inc,
            6 => Opcode::Dec,
            7 => Opcode::Count,
            8 => Opcode::Use,
            9 => Opcode::Keys,
            10 => Opcode::Ping,
            11 => Opcode::Quit,
            12 => Opcode::Db,
            13 => Opcode::Info,
            14 => Opcode::Flush,
            15 => Opcode::Join,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Unpacked header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub prefix: bool,
    pub sync: bool,
    pub request: bool,
}

impl Header {
    pub fn request(opcode: Opcode) -> Self {
        Self {
            opcode,
            prefix: false,
            sync: false,
            request: true,
        }
    }

    pub fn response(opcode: Opcode) -> Self {
        Self {
            opcode,
            prefix: false,
            sync: false,
            request: false,
        }
    }

    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn pack(&self) -> u8 {
        let mut byte = (self.opcode as u8) << OPCODE_SHIFT;
        if self.prefix {
            byte |= FLAG_PREFIX;
        }
        if self.sync {
            byte |= FLAG_SYNC;
        }
        if self.request {
            byte |= FLAG_REQUEST;
        }
        byte
    }

    pub fn unpack(byte: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode: Opcode::from_bits(byte >> OPCODE_SHIFT)?,
            prefix: byte & FLAG_PREFIX != 0,
            sync: byte & FLAG_SYNC != 0,
            request: byte & FLAG_REQUEST != 0,
        })
    }
}

/// Append `len` as a length varint: 7 bits of magnitude per byte, low group
/// first, bit 7 set on every byte but the last.
pub fn write_length(buf: &mut Vec<u8>, mut len: usize) {
    loop {
        let group = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            buf.push(group);
            return;
        }
        buf.push(group | 0x80);
    }
}

/// Decode a length varint. Returns `(length, bytes consumed)`.
pub fn read_length(bytes: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut len: usize = 0;
    for (i, &byte) in bytes.iter().take(MAX_LENGTH_BYTES).enumerate() {
        len |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    if bytes.len() < MAX_LENGTH_BYTES {
        Err(ProtocolError::ShortFrame)
    } else {
        Err(ProtocolError::BadLength)
    }
}

/// Number of bytes the length varint occupies for a body of `len` bytes.
pub fn length_size(len: usize) -> usize {
    match len {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        _ => 4,
    }
}

/// Assemble a complete frame. Fails when the body exceeds what the length
/// field can carry.
pub fn encode_frame(header: Header, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::Oversize {
            len: body.len(),
            max: MAX_BODY_LEN,
        });
    }
    let mut frame = Vec::with_capacity(1 + MAX_LENGTH_BYTES + body.len());
    frame.push(header.pack());
    write_length(&mut frame, body.len());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Split a complete frame into header and body without copying. The input
/// is never mutated; a declared length above `max_body` is rejected before
/// the body is touched.
pub fn split_frame(bytes: &[u8], max_body: usize) -> Result<(Header, &[u8]), ProtocolError> {
    let (&header_byte, rest) = bytes.split_first().ok_or(ProtocolError::ShortFrame)?;
    let header = Header::unpack(header_byte)?;
    let (len, consumed) = read_length(rest)?;
    if len > max_body {
        return Err(ProtocolError::Oversize {
            len,
            max: max_body,
        });
    }
    let body = rest
        .get(consumed..consumed + len)
        .ok_or(ProtocolError::ShortFrame)?;
    Ok((header, body))
}

/// Read one frame from a stream. The declared length is checked against
/// `max_body` before any body byte is read, so an oversize frame costs at
/// most 5 bytes of input before the connection is dropped.
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<(Header, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    let header = Header::unpack(byte[0])?;

    let mut len: usize = 0;
    for i in 0..MAX_LENGTH_BYTES {
        reader.read_exact(&mut byte).await?;
        len |= ((byte[0] & 0x7f) as usize) << (7 * i);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if i == MAX_LENGTH_BYTES - 1 {
            return Err(ProtocolError::BadLength);
        }
    }
    if len > max_body {
        return Err(ProtocolError::Oversize {
            len,
            max: max_body,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip_all_opcodes() {
        for bits in 0u8..=15 {
            let opcode = Opcode::from_bits(bits).unwrap();
            for (prefix, sync, request) in [
                (false, false, true),
                (true, false, true),
                (false, true, false),
                (true, true, true),
            ] {
                let header = Header {
                    opcode,
                    prefix,
                    sync,
                    request,
                };
                assert_eq!(Header::unpack(header.pack()).unwrap(), header);
            }
        }
    }

    #[test]
    fn test_length_varint_roundtrip() {
        for len in [0usize, 1, 127, 128, 300, 16_383, 16_384, MAX_BODY_LEN] {
            let mut buf = Vec::new();
            write_length(&mut buf, len);
            assert!(buf.len() <= 4);
            let (decoded, consumed) = read_length(&buf).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_length_varint_boundaries() {
        let mut buf = Vec::new();
        write_length(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);

        buf.clear();
        write_length(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn test_length_varint_does_not_terminate() {
        assert!(matches!(
            read_length(&[0x80, 0x80, 0x80, 0x80]),
            Err(ProtocolError::BadLength)
        ));
        assert!(matches!(
            read_length(&[0x80, 0x80]),
            Err(ProtocolError::ShortFrame)
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let header = Header::request(Opcode::Put).with_prefix(true);
        let body = b"some body".to_vec();
        let frame = encode_frame(header, &body).unwrap();
        let (decoded_header, decoded_body) = split_frame(&frame, MAX_BODY_LEN).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_body, body.as_slice());
    }

    #[test]
    fn test_split_rejects_oversize() {
        let frame = encode_frame(Header::request(Opcode::Put), &[0u8; 100]).unwrap();
        assert!(matches!(
            split_frame(&frame, 99),
            Err(ProtocolError::Oversize { len: 100, max: 99 })
        ));
    }

    #[test]
    fn test_split_rejects_truncated_body() {
        let frame = encode_frame(Header::request(Opcode::Get), b"abcdef").unwrap();
        assert!(matches!(
            split_frame(&frame[..frame.len() - 1], MAX_BODY_LEN),
            Err(ProtocolError::ShortFrame)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let header = Header::request(Opcode::Get);
        let frame = encode_frame(header, b"mykey").unwrap();
        let mut cursor = std::io::Cursor::new(frame);
        let (decoded, body) = read_frame(&mut cursor, MAX_BODY_LEN).await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"mykey");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversize_before_body() {
        // Declares a 1 MB body but carries none; the cap fires first.
        let mut frame = vec![Header::request(Opcode::Put).pack()];
        write_length(&mut frame, 1024 * 1024);
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor, 1024).await,
            Err(ProtocolError::Oversize { .. })
        ));
    }
}
