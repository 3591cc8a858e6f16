//! Bounds-checked cursors over a byte buffer.
//!
//! Integers are little-endian. Strings are written as one presence byte
//! followed, when present, by the bytes and a terminating NUL.
use crate::config::types::ProtocolError;

pub type CodecResult<T> = std::result::Result<T, ProtocolError>;

/// Sequential writer into a caller-provided buffer; never writes past its end.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn reserve(&mut self, needed: usize) -> CodecResult<&mut [u8]> {
        if needed > self.remaining() {
            return Err(ProtocolError::NoSpace {
                needed,
                left: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += needed;
        Ok(&mut self.buf[start..start + needed])
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> CodecResult<()> {
        self.put_bytes(&[v])
    }

    pub fn put_u16(&mut self, v: u16) -> CodecResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> CodecResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> CodecResult<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    /// `None` writes only the absent marker. Strings containing NUL are rejected.
    pub fn put_str(&mut self, s: Option<&str>) -> CodecResult<()> {
        match s {
            None => self.put_u8(0),
            Some(s) => {
                if s.as_bytes().contains(&0) {
                    return Err(ProtocolError::BadString);
                }
                let needed = 1 + s.len() + 1;
                let out = self.reserve(needed)?;
                out[0] = 1;
                out[1..1 + s.len()].copy_from_slice(s.as_bytes());
                out[needed - 1] = 0;
                Ok(())
            }
        }
    }

    /// Overwrite already-written bytes (used to patch header fields).
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> CodecResult<()> {
        let end = offset + bytes.len();
        if end > self.pos {
            return Err(ProtocolError::NoSpace {
                needed: end,
                left: self.pos,
            });
        }
        self.buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

/// Sequential reader over a received buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(ProtocolError::Truncated {
                needed: n,
                left: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub fn get_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn get_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    /// Absent strings decode to `None`; a missing terminator is `Truncated`.
    pub fn get_str(&mut self) -> CodecResult<Option<String>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => {
                let rest = &self.buf[self.pos..];
                let len = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(ProtocolError::Truncated {
                        needed: rest.len() + 1,
                        left: rest.len(),
                    })?;
                let bytes = self.get_bytes(len + 1)?;
                let s = std::str::from_utf8(&bytes[..len]).map_err(|_| ProtocolError::BadString)?;
                Ok(Some(s.to_string()))
            }
            _ => Err(ProtocolError::BadString),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_and_strings() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        w.put_u8(7).unwrap();
        w.put_u16(0x1234).unwrap();
        w.put_u32(0xdead_beef).unwrap();
        w.put_u64(u64::MAX).unwrap();
        w.put_str(Some("abc")).unwrap();
        w.put_str(None).unwrap();
        w.put_str(Some("")).unwrap();
        let len = w.position();
        assert_eq!(len, 1 + 2 + 4 + 8 + 5 + 1 + 2);

        let mut r = Reader::new(&buf[..len]);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), u64::MAX);
        assert_eq!(r.get_str().unwrap().as_deref(), Some("abc"));
        assert_eq!(r.get_str().unwrap(), None);
        assert_eq!(r.get_str().unwrap().as_deref(), Some(""));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = [0u8; 4];
        Writer::new(&mut buf).put_u32(1).unwrap();
        assert_eq!(buf, [1, 0, 0, 0]);
    }

    #[test]
    fn test_writer_refuses_overflow() {
        let mut buf = [0u8; 5];
        let mut w = Writer::new(&mut buf);
        w.put_u32(1).unwrap();
        assert_eq!(
            w.put_u16(2),
            Err(ProtocolError::NoSpace { needed: 2, left: 1 })
        );
        assert!(matches!(
            w.put_str(Some("x")),
            Err(ProtocolError::NoSpace { .. })
        ));
        // a failed put leaves the cursor untouched
        assert_eq!(w.position(), 4);
    }

    #[test]
    fn test_reader_truncation() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.get_u32(), Err(ProtocolError::Truncated { .. })));

        // present string without terminator
        let mut r = Reader::new(&[1, b'a', b'b']);
        assert!(matches!(r.get_str(), Err(ProtocolError::Truncated { .. })));

        let mut r = Reader::new(&[9]);
        assert_eq!(r.get_str(), Err(ProtocolError::BadString));
    }

    #[test]
    fn test_put_str_rejects_interior_nul() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        assert_eq!(w.put_str(Some("a\0b")), Err(ProtocolError::BadString));
    }
}
