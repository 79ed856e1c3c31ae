//! Length-prefixed wire encoding helpers
//!
//! Handshake messages and session tickets are sequences of big-endian
//! integers and length-prefixed byte vectors. Decoding never panics: running
//! off the end of the input is a decode error naming the structure being read.

use crate::error::TlsError;
use bytes::{BufMut, BytesMut};

/// Bounds-checked cursor over an encoded structure
pub struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Reader { buf, what }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], TlsError> {
        if self.buf.len() < n {
            return Err(TlsError::decode(self.what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], TlsError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, TlsError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, TlsError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u24(&mut self) -> Result<usize, TlsError> {
        let b = self.bytes(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }

    pub fn u32(&mut self) -> Result<u32, TlsError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, TlsError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn vec_u8(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    pub fn vec_u16(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    pub fn vec_u24(&mut self) -> Result<&'a [u8], TlsError> {
        let len = self.u24()?;
        self.bytes(len)
    }

    /// Sub-reader over a u16-length-prefixed block
    pub fn sub_u16(&mut self) -> Result<Reader<'a>, TlsError> {
        Ok(Reader::new(self.vec_u16()?, self.what))
    }

    pub fn sub_u24(&mut self) -> Result<Reader<'a>, TlsError> {
        Ok(Reader::new(self.vec_u24()?, self.what))
    }

    pub fn sub_u8(&mut self) -> Result<Reader<'a>, TlsError> {
        Ok(Reader::new(self.vec_u8()?, self.what))
    }

    /// Fail if any bytes are left over
    pub fn finish(self) -> Result<(), TlsError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(TlsError::decode(self.what))
        }
    }
}

fn too_long(what: &str, len: usize) -> TlsError {
    TlsError::ProtocolViolation(format!("{} too long to encode ({} bytes)", what, len))
}

pub fn put_vec_u8(buf: &mut BytesMut, data: &[u8]) -> Result<(), TlsError> {
    let len = u8::try_from(data.len()).map_err(|_| too_long("u8 vector", data.len()))?;
    buf.put_u8(len);
    buf.put_slice(data);
    Ok(())
}

pub fn put_vec_u16(buf: &mut BytesMut, data: &[u8]) -> Result<(), TlsError> {
    let len = u16::try_from(data.len()).map_err(|_| too_long("u16 vector", data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

pub fn put_u24(buf: &mut BytesMut, value: usize) -> Result<(), TlsError> {
    if value >= 1 << 24 {
        return Err(too_long("u24 length", value));
    }
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
    Ok(())
}

pub fn put_vec_u24(buf: &mut BytesMut, data: &[u8]) -> Result<(), TlsError> {
    put_u24(buf, data.len())?;
    buf.put_slice(data);
    Ok(())
}

/// Encode a nested block behind a length prefix of `width` bytes (1, 2 or 3)
pub fn put_nested<F>(buf: &mut BytesMut, width: usize, body: F) -> Result<(), TlsError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), TlsError>,
{
    let mut inner = BytesMut::new();
    body(&mut inner)?;
    match width {
        1 => put_vec_u8(buf, &inner),
        2 => put_vec_u16(buf, &inner),
        _ => put_vec_u24(buf, &inner),
    }
}
