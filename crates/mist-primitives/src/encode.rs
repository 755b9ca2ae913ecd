//! Hand-rolled wire encoding.
//!
//! Little-endian fixed-width integers, length-prefixed byte strings. Every
//! persisted structure in the node goes through this pair, so the format is
//! part of the on-disk contract.

use crate::hash::Hash32;
use thiserror::Error;

/// Decoding failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran past the end of the buffer.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// Structurally invalid content.
    #[error("malformed field: {0}")]
    Malformed(&'static str),

    /// Input had bytes left after a complete decode.
    #[error("trailing bytes after decode")]
    TrailingBytes,
}

/// Byte-stream writer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Encoder {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Raw bytes, no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed byte string (u32 length).
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_raw(bytes);
    }

    pub fn write_hash(&mut self, hv: &Hash32) {
        self.write_raw(&hv.0);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Byte-stream reader over a borrowed slice.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Decoder { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let n = self.read_u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_hash(&mut self) -> Result<Hash32, DecodeError> {
        let b = self.take(32)?;
        Ok(Hash32::from_slice(b).expect("length checked"))
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::Malformed("bool")),
        }
    }

    /// Fail unless the whole input was consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(())
    }
}

/// A structure with a canonical wire form.
pub trait Serialize {
    fn write(&self, w: &mut Encoder);

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write(&mut enc);
        enc.into_bytes()
    }
}

/// A structure decodable from its canonical wire form.
pub trait Deserialize: Sized {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let out = Self::read(&mut dec)?;
        dec.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut enc = Encoder::new();
        enc.write_u8(7);
        enc.write_u32(0xdead_beef);
        enc.write_u64(u64::MAX - 1);
        enc.write_i64(-42);
        enc.write_bytes(b"abc");
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 7);
        assert_eq!(dec.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(dec.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(dec.read_i64().unwrap(), -42);
        assert_eq!(dec.read_bytes().unwrap(), b"abc");
        dec.finish().unwrap();
    }

    #[test]
    fn truncated_input_fails() {
        let mut dec = Decoder::new(&[1, 2, 3]);
        assert_eq!(dec.read_u32(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let dec = Decoder::new(&[0]);
        assert_eq!(dec.finish(), Err(DecodeError::TrailingBytes));
    }
}
