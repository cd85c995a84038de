//! Wire models for both legs.
//!
//! `codec` holds the version registry, `front` the client-facing packets,
//! `back` the backend-facing packets. Both packet models share the checked
//! cursor in this module so a short or corrupt body surfaces as a
//! `DecodeError` instead of a panic.

pub mod back;
pub mod codec;
pub mod front;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unknown packet id {0:#06x}")]
    UnknownPacketId(u16),

    #[error("Packet {0:#06x} not valid in this state")]
    UnexpectedPacket(u16),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: i64 },

    #[error("Length {0} exceeds limit")]
    LengthOverflow(usize),

    #[error("VarInt too long")]
    VarIntTooLong,
}

/// Longest string or blob field accepted from a peer
pub const MAX_FIELD_LEN: usize = 4 * 1024 * 1024;

/// Checked little cursor over a packet body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    pub fn varint(&mut self) -> Result<i32, DecodeError> {
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = self.u8()?;
            value |= ((byte & 0x7F) as u32) << (7 * shift);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(DecodeError::VarIntTooLong)
    }

    fn checked_len(len: usize) -> Result<usize, DecodeError> {
        if len > MAX_FIELD_LEN {
            return Err(DecodeError::LengthOverflow(len));
        }
        Ok(len)
    }

    /// `u32 BE` length-prefixed blob
    pub fn blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = Self::checked_len(self.u32()? as usize)?;
        self.take(len)
    }

    /// `u32 BE` length-prefixed UTF-8 string
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.blob()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// VarInt length-prefixed UTF-8 string
    pub fn var_string(&mut self) -> Result<String, DecodeError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::InvalidValue {
            field: "string length",
            value: len as i64,
        })?;
        let raw = self.take(Self::checked_len(len)?)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// VarInt length-prefixed blob
    pub fn var_blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::InvalidValue {
            field: "blob length",
            value: len as i64,
        })?;
        self.take(Self::checked_len(len)?)
    }

    /// `u16 BE` counted list
    pub fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let count = self.u16()? as usize;
        let mut out = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_short_body() {
        let mut r = Reader::new(&[0x00, 0x01]);
        assert_eq!(r.u16().unwrap(), 1);
        assert!(matches!(r.u8(), Err(DecodeError::UnexpectedEof { needed: 1, remaining: 0 })));
    }

    #[test]
    fn test_reader_string_and_list() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_be_bytes());
        for s in ["ab", "c"] {
            buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        let mut r = Reader::new(&buf);
        let items = r.list(|r| r.string()).unwrap();
        assert_eq!(items, vec!["ab".to_string(), "c".to_string()]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reader_rejects_huge_length() {
        let buf = u32::MAX.to_be_bytes();
        let mut r = Reader::new(&buf);
        assert!(matches!(r.blob(), Err(DecodeError::LengthOverflow(_))));
    }

    #[test]
    fn test_reader_varint() {
        let mut r = Reader::new(&[0xAC, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(r.varint().unwrap(), 300);
        assert_eq!(r.varint().unwrap(), -1);
    }
}
