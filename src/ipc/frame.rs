//! CLI forwarding frames between `turf -H` and the daemon.
//!
//! ```text
//! 0       4      5      6       8
//! | magic | type | code | size  | body (size bytes)
//! ```
//!
//! A request body is the argv after the program name, each argument
//! NUL-terminated. A response has an empty body and carries the result in
//! `code`: 0 on success, a negated errno otherwise.
use super::codec::{CodecResult, Reader, Writer};
use crate::config::types::ProtocolError;

/// Builds a little-endian tag from four bytes
pub const fn def_magic(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (d as u32) << 24 | (c as u32) << 16 | (b as u32) << 8 | a as u32
}

pub const FRAME_VERSION: u8 = 1;
pub const FRAME_MAGIC: u32 = def_magic(b'T', b'F', b'D', FRAME_VERSION);
pub const FRAME_HDR_LEN: usize = 8;
/// Upper bound of a request body
pub const MAX_BODY_LEN: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    CliRequest = 1,
    CliResponse = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub frame_type: u8,
    pub code: i8,
    pub size: u16,
}

impl FrameHeader {
    pub fn request(size: u16) -> Self {
        Self {
            magic: FRAME_MAGIC,
            frame_type: FrameType::CliRequest as u8,
            code: 0,
            size,
        }
    }

    /// Response carrying `code` (0 or a negated errno).
    pub fn response(code: i32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            frame_type: FrameType::CliResponse as u8,
            code: code.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
            size: 0,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HDR_LEN] {
        let mut out = [0u8; FRAME_HDR_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.frame_type;
        out[5] = self.code as u8;
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(buf);
        let hdr = Self {
            magic: r.get_u32()?,
            frame_type: r.get_u8()?,
            code: r.get_u8()? as i8,
            size: r.get_u16()?,
        };
        if hdr.magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        Ok(hdr)
    }

    /// Check a received request header: right type and a body of 1..=1024 bytes.
    pub fn validate_request(&self) -> CodecResult<usize> {
        if self.frame_type != FrameType::CliRequest as u8 {
            return Err(ProtocolError::UnexpectedType {
                expected: FrameType::CliRequest as u8,
                found: self.frame_type,
            });
        }
        let size = self.size as usize;
        if !(1..=MAX_BODY_LEN).contains(&size) {
            return Err(ProtocolError::BadLength {
                declared: size,
                actual: MAX_BODY_LEN,
            });
        }
        Ok(size)
    }
}

/// Build a complete request frame (header + NUL-joined args).
pub fn encode_request(args: &[String]) -> CodecResult<Vec<u8>> {
    let mut body = vec![0u8; MAX_BODY_LEN];
    let mut w = Writer::new(&mut body);
    for arg in args {
        if arg.as_bytes().contains(&0) {
            return Err(ProtocolError::BadString);
        }
        w.put_bytes(arg.as_bytes())?;
        w.put_u8(0)?;
    }
    let size = w.position();
    if size == 0 {
        return Err(ProtocolError::BadLength {
            declared: 0,
            actual: MAX_BODY_LEN,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HDR_LEN + size);
    frame.extend_from_slice(&FrameHeader::request(size as u16).encode());
    frame.extend_from_slice(&body[..size]);
    Ok(frame)
}

/// Split a request body back into arguments.
///
/// A missing final terminator still yields the last argument.
pub fn decode_args(body: &[u8]) -> CodecResult<Vec<String>> {
    let body = body.strip_suffix(&[0]).unwrap_or(body);
    body.split(|b| *b == 0)
        .map(|arg| {
            std::str::from_utf8(arg)
                .map(str::to_string)
                .map_err(|_| ProtocolError::BadString)
        })
        .collect()
}

/// Parse a request out of the bytes received so far.
///
/// Returns `None` until the header and the whole declared body are
/// present, otherwise the arguments and the number of bytes consumed. The
/// header is validated as soon as it is complete.
pub fn parse_request(buf: &[u8]) -> CodecResult<Option<(Vec<String>, usize)>> {
    if buf.len() < FRAME_HDR_LEN {
        return Ok(None);
    }
    let size = FrameHeader::decode(&buf[..FRAME_HDR_LEN])?.validate_request()?;
    let end = FRAME_HDR_LEN + size;
    if buf.len() < end {
        return Ok(None);
    }
    let args = decode_args(&buf[FRAME_HDR_LEN..end])?;
    Ok(Some((args, end)))
}
