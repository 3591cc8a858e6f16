//! Seed/warm-fork messages.
//!
//! Every message starts with a 16-byte header:
//!
//! ```text
//! 0       8          12     13       14       16
//! | magic | checksum | type | padding | length |
//! ```
//!
//! `magic` is all ones, `padding` is zero and `length` counts the whole
//! message including the header. `checksum` is the CRC32 of bytes
//! `12..length`: the header minus magic and checksum, plus the body.
use super::codec::{CodecResult, Reader, Writer};
use crate::config::types::{Mode, ProtocolError, RealmFlags, Result, TurfError};
use std::io::{ErrorKind, Read, Write};

pub const HDR_MAGIC: u64 = u64::MAX;
pub const HDR_LEN: usize = 16;
/// Receive buffer size; larger messages are rejected
pub const MAX_MSG_LEN: usize = 4096;

const CHECKSUM_OFFSET: usize = 8;
const CRC_START: usize = 12;
const LENGTH_OFFSET: usize = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    SeedReady = 0,
    ForkReq = 1,
    ForkRsp = 2,
}

impl MsgType {
    pub fn from_u8(v: u8) -> CodecResult<Self> {
        match v {
            0 => Ok(MsgType::SeedReady),
            1 => Ok(MsgType::ForkReq),
            2 => Ok(MsgType::ForkRsp),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::SeedReady => "seed_ready",
            MsgType::ForkReq => "fork_req",
            MsgType::ForkRsp => "fork_rsp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u64,
    pub checksum: u32,
    pub msg_type: u8,
    pub padding: u8,
    pub length: u16,
}

impl Header {
    pub fn parse(buf: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(buf);
        Ok(Self {
            magic: r.get_u64()?,
            checksum: r.get_u32()?,
            msg_type: r.get_u8()?,
            padding: r.get_u8()?,
            length: r.get_u16()?,
        })
    }
}

/// Realm configuration carried by FORK_REQ.
///
/// Optional strings that are empty travel as absent and come back empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForkRequest {
    pub flags: RealmFlags,
    pub mode: Mode,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub binary: String,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub chroot: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForkResponse {
    pub pid: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    SeedReady,
    ForkReq(ForkRequest),
    ForkRsp(ForkResponse),
}

fn optional(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn begin(w: &mut Writer<'_>, t: MsgType) -> CodecResult<()> {
    w.put_u64(HDR_MAGIC)?;
    w.put_u32(0)?;
    w.put_u8(t as u8)?;
    w.put_u8(0)?;
    w.put_u16(0)
}

/// Patch length and checksum once the body is written; returns the length.
fn finish(w: &mut Writer<'_>) -> CodecResult<usize> {
    let len = w.position();
    let declared = u16::try_from(len).map_err(|_| ProtocolError::NoSpace {
        needed: len,
        left: u16::MAX as usize,
    })?;
    w.patch(LENGTH_OFFSET, &declared.to_le_bytes())?;
    let crc = crc32fast::hash(&w.written()[CRC_START..len]);
    w.patch(CHECKSUM_OFFSET, &crc.to_le_bytes())?;
    Ok(len)
}

/// Validate magic, declared length and checksum; return the type byte and
/// a reader positioned at the body.
fn open(buf: &[u8]) -> CodecResult<(u8, Reader<'_>)> {
    let hdr = Header::parse(buf)?;
    if hdr.magic != HDR_MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let len = hdr.length as usize;
    if len < HDR_LEN || len > buf.len() {
        return Err(ProtocolError::BadLength {
            declared: len,
            actual: buf.len(),
        });
    }
    let computed = crc32fast::hash(&buf[CRC_START..len]);
    if computed != hdr.checksum {
        return Err(ProtocolError::BadChecksum {
            expected: hdr.checksum,
            computed,
        });
    }
    let mut r = Reader::new(&buf[..len]);
    r.get_bytes(HDR_LEN)?;
    Ok((hdr.msg_type, r))
}

/// Every body byte up to the declared length must belong to a field.
fn close<T>(r: &Reader<'_>, value: T) -> CodecResult<T> {
    match r.remaining() {
        0 => Ok(value),
        extra => Err(ProtocolError::TrailingBytes(extra)),
    }
}

fn open_expecting(buf: &[u8], expected: MsgType) -> CodecResult<Reader<'_>> {
    let (found, r) = open(buf)?;
    if found != expected as u8 {
        return Err(ProtocolError::UnexpectedType {
            expected: expected as u8,
            found,
        });
    }
    Ok(r)
}

pub fn encode_seed_ready(buf: &mut [u8]) -> CodecResult<usize> {
    let mut w = Writer::new(buf);
    begin(&mut w, MsgType::SeedReady)?;
    finish(&mut w)
}

pub fn decode_seed_ready(buf: &[u8]) -> CodecResult<()> {
    let r = open_expecting(buf, MsgType::SeedReady)?;
    close(&r, ())
}

pub fn encode_fork_req(buf: &mut [u8], req: &ForkRequest) -> CodecResult<usize> {
    let mut w = Writer::new(buf);
    begin(&mut w, MsgType::ForkReq)?;
    w.put_u32(req.flags.bits())?;
    w.put_u32(req.mode.as_u32())?;

    w.put_u32(req.argv.len() as u32)?;
    for arg in &req.argv {
        w.put_str(Some(arg))?;
    }
    w.put_u32(req.env.len() as u32)?;
    for entry in &req.env {
        w.put_str(Some(entry))?;
    }

    w.put_str(optional(&req.binary))?;
    w.put_str(optional(&req.name))?;
    w.put_u32(req.uid)?;
    w.put_u32(req.gid)?;
    w.put_str(optional(&req.chroot))?;
    w.put_str(optional(&req.stdout))?;
    w.put_str(optional(&req.stderr))?;
    finish(&mut w)
}

fn get_list(r: &mut Reader<'_>) -> CodecResult<Vec<String>> {
    let count = r.get_u32()? as usize;
    // each entry takes at least one byte
    if count > r.remaining() {
        return Err(ProtocolError::Truncated {
            needed: count,
            left: r.remaining(),
        });
    }
    (0..count)
        .map(|_| r.get_str().map(Option::unwrap_or_default))
        .collect()
}

fn get_string(r: &mut Reader<'_>) -> CodecResult<String> {
    r.get_str().map(Option::unwrap_or_default)
}

pub fn decode_fork_req(buf: &[u8]) -> CodecResult<ForkRequest> {
    let mut r = open_expecting(buf, MsgType::ForkReq)?;
    let flags = RealmFlags::from_bits(r.get_u32()?);
    let mode_raw = r.get_u32()?;
    let mode = Mode::from_u32(mode_raw).map_err(|_| ProtocolError::UnknownMode(mode_raw))?;
    let req = ForkRequest {
        flags,
        mode,
        argv: get_list(&mut r)?,
        env: get_list(&mut r)?,
        binary: get_string(&mut r)?,
        name: get_string(&mut r)?,
        uid: r.get_u32()?,
        gid: r.get_u32()?,
        chroot: get_string(&mut r)?,
        stdout: get_string(&mut r)?,
        stderr: get_string(&mut r)?,
    };
    close(&r, req)
}

pub fn encode_fork_rsp(buf: &mut [u8], rsp: &ForkResponse) -> CodecResult<usize> {
    let mut w = Writer::new(buf);
    begin(&mut w, MsgType::ForkRsp)?;
    w.put_u32(rsp.pid)?;
    w.put_str(optional(&rsp.name))?;
    finish(&mut w)
}

pub fn decode_fork_rsp(buf: &[u8]) -> CodecResult<ForkResponse> {
    let mut r = open_expecting(buf, MsgType::ForkRsp)?;
    let rsp = ForkResponse {
        pid: r.get_u32()?,
        name: get_string(&mut r)?,
    };
    close(&r, rsp)
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::SeedReady => MsgType::SeedReady,
            Message::ForkReq(_) => MsgType::ForkReq,
            Message::ForkRsp(_) => MsgType::ForkRsp,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> CodecResult<usize> {
        match self {
            Message::SeedReady => encode_seed_ready(buf),
            Message::ForkReq(req) => encode_fork_req(buf, req),
            Message::ForkRsp(rsp) => encode_fork_rsp(buf, rsp),
        }
    }

    /// Decode any message type after full integrity checks.
    pub fn decode(buf: &[u8]) -> CodecResult<Self> {
        let (found, _) = open(buf)?;
        match MsgType::from_u8(found)? {
            MsgType::SeedReady => decode_seed_ready(buf).map(|_| Message::SeedReady),
            MsgType::ForkReq => decode_fork_req(buf).map(Message::ForkReq),
            MsgType::ForkRsp => decode_fork_rsp(buf).map(Message::ForkRsp),
        }
    }
}

/// Total length announced by a header, checked against the receive limit.
fn frame_len(hdr: &[u8]) -> CodecResult<usize> {
    let hdr = Header::parse(hdr)?;
    if hdr.magic != HDR_MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    let len = hdr.length as usize;
    if !(HDR_LEN..=MAX_MSG_LEN).contains(&len) {
        return Err(ProtocolError::BadLength {
            declared: len,
            actual: MAX_MSG_LEN,
        });
    }
    Ok(len)
}

/// Read exactly one framed message from a blocking stream.
///
/// The header is validated before the body is read, so a peer announcing an
/// absurd length is rejected without consuming it. A frame that fails its
/// checksum has been consumed in full and the stream stays aligned.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut buf = [0u8; MAX_MSG_LEN];
    reader.read_exact(&mut buf[..HDR_LEN])?;
    let len = frame_len(&buf[..HDR_LEN])?;
    reader.read_exact(&mut buf[HDR_LEN..len])?;
    Ok(Message::decode(&buf[..len])?)
}

/// What one read from a nonblocking stream produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    Read(usize),
    WouldBlock,
    Closed,
}

/// Reassembles messages arriving in arbitrary pieces on a nonblocking
/// stream. Nothing is decoded until the whole declared length is buffered.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append whatever `reader` has available right now.
    pub fn fill<R: Read>(&mut self, reader: &mut R) -> Result<Fill> {
        let mut chunk = [0u8; MAX_MSG_LEN];
        loop {
            return match reader.read(&mut chunk) {
                Ok(0) => Ok(Fill::Closed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    Ok(Fill::Read(n))
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
                Err(e) => Err(e.into()),
            };
        }
    }

    /// Pop the next complete message, `None` while it is still partial.
    ///
    /// A frame that fails decoding is dropped and reported. A header that
    /// cannot be trusted leaves no way to find the next frame, so the
    /// whole buffer goes with it.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HDR_LEN {
            return Ok(None);
        }
        let len = match frame_len(&self.buf[..HDR_LEN]) {
            Ok(len) => len,
            Err(e) => {
                self.buf.clear();
                return Err(e.into());
            }
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let decoded = Message::decode(&self.buf[..len]);
        self.buf.drain(..len);
        Ok(Some(decoded?))
    }
}

/// Encode and write one message.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<()> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = msg.encode(&mut buf)?;
    writer.write_all(&buf[..len]).map_err(TurfError::from)
}
