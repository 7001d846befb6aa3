//! Binary wire protocol: message framing and body encoding.
//!
//! Every message is `{u32 words, u8 type, u8 flags, u16 reserved}` followed
//! by a body of `words * 8` bytes. All integers are little-endian, strings
//! are NUL-terminated and padded to the next 8-byte boundary, doubles travel
//! as IEEE 754 bit patterns in a u64.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub mod request;
pub mod response;
pub mod value;

pub use request::Request;
pub use response::Response;
pub use value::Value;

/// Protocol magic sent by clients when a connection is established.
pub const PROTOCOL_VERSION: u64 = 0x86104dd760433fe5;

/// Secondary magic denoting a Raft-transport upgrade.
pub const PROTOCOL_RAFT_UPGRADE: u64 = 0x60c1f653be904bd1;

pub const WORD_SIZE: usize = 8;

/// Maximum number of words in a message body.
pub const MAX_WORDS: u32 = 1 << 25;

/// Static response buffer size; row batches are flushed when they outgrow it.
pub const RESPONSE_BUFFER_SIZE: usize = 4096;

/// Sentinel ending a non-final batch of rows: more batches follow.
pub const ROWS_PART: u64 = 0xeeeeeeeeeeeeeeee;

/// Sentinel ending the final batch of rows.
pub const ROWS_DONE: u64 = 0xffffffffffffffff;

pub const MESSAGE_HEADER_LEN: usize = 8;

/// A decoded message frame: type, flags and the raw 8-byte-aligned body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub body: BytesMut,
}

impl Frame {
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
        let mut header = [0u8; MESSAGE_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let words = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let kind = header[4];
        let flags = header[5];
        if words == 0 {
            return Err(Error::Proto("empty message body".into()));
        }
        if words > MAX_WORDS {
            return Err(Error::Proto("message body too large".into()));
        }
        let mut body = BytesMut::zeroed(words as usize * WORD_SIZE);
        reader.read_exact(&mut body).await?;
        Ok(Frame { kind, flags, body })
    }

    pub async fn write<W: AsyncWrite + Unpin>(
        writer: &mut W,
        kind: u8,
        flags: u8,
        body: &[u8],
    ) -> Result<()> {
        debug_assert!(!body.is_empty() && body.len() % WORD_SIZE == 0);
        let mut header = [0u8; MESSAGE_HEADER_LEN];
        header[0..4].copy_from_slice(&((body.len() / WORD_SIZE) as u32).to_le_bytes());
        header[4] = kind;
        header[5] = flags;
        writer.write_all(&header).await?;
        writer.write_all(body).await?;
        Ok(())
    }
}

/// Read cursor over a message body, enforcing alignment and bounds the way
/// the protocol requires: a read of `len` bytes must start at an offset
/// aligned to 8, 4 or 1 depending on `len`, and may never cross the end of
/// the body.
pub struct Cursor<'a> {
    body: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.body.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let align = if len % 8 == 0 {
            8
        } else if len % 4 == 0 {
            4
        } else {
            1
        };
        if self.offset % align != 0 {
            return Err(Error::Parse("misaligned read".into()));
        }
        if self.offset + len > self.body.len() {
            return Err(Error::Overflow("read overflow".into()));
        }
        let out = &self.body[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a NUL-terminated string padded to the next word boundary.
    pub fn get_text(&mut self) -> Result<&'a str> {
        let tail = &self.body[self.offset..];
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Parse("no string found".into()))?;
        let mut len = nul + 1;
        if len % WORD_SIZE != 0 {
            len += WORD_SIZE - len % WORD_SIZE;
        }
        let raw = self.take(len)?;
        std::str::from_utf8(&raw[..nul]).map_err(|_| Error::Parse("invalid utf-8 string".into()))
    }

    /// Read a u64-length-prefixed blob padded to the next word boundary.
    pub fn get_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u64()? as usize;
        let mut padded = len;
        if padded % WORD_SIZE != 0 {
            padded += WORD_SIZE - padded % WORD_SIZE;
        }
        let raw = self.take(padded)?;
        Ok(&raw[..len])
    }

    /// Raw unaligned bytes; used for nibble-packed row headers.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.body.len() {
            return Err(Error::Overflow("read overflow".into()));
        }
        let out = &self.body[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }
}

/// Write buffer for a message body. The finished buffer is always a
/// multiple of the word size.
#[derive(Default)]
pub struct Builder {
    buf: BytesMut,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(RESPONSE_BUFFER_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        debug_assert!(self.buf.len() % 4 == 0, "misaligned write");
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        debug_assert!(self.buf.len() % 8 == 0, "misaligned write");
        self.buf.put_u64_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_u64(v as u64);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.put_u64(v.to_bits());
    }

    pub fn put_text(&mut self, v: &str) {
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
        self.pad();
    }

    pub fn put_blob(&mut self, v: &[u8]) {
        self.put_u64(v.len() as u64);
        self.buf.put_slice(v);
        self.pad();
    }

    /// Pad the buffer up to the next word boundary with zeroes.
    pub fn pad(&mut self) {
        while self.buf.len() % WORD_SIZE != 0 {
            self.buf.put_u8(0);
        }
    }

    pub fn finish(mut self) -> BytesMut {
        self.pad();
        if self.buf.is_empty() {
            // The body of a message can never be empty.
            self.buf.put_u64_le(0);
        }
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut builder = Builder::new();
        builder.put_u64(42);
        builder.put_text("hello");
        let body = builder.finish();

        let mut wire = Vec::new();
        Frame::write(&mut wire, 6, 0, &body).await.unwrap();

        let mut reader = wire.as_slice();
        let frame = Frame::read(&mut reader).await.unwrap();
        assert_eq!(frame.kind, 6);
        assert_eq!(frame.body.len(), 16);

        let mut cursor = Cursor::new(&frame.body);
        assert_eq!(cursor.get_u64().unwrap(), 42);
        assert_eq!(cursor.get_text().unwrap(), "hello");
        assert_eq!(cursor.remaining(), 0);
    }

    #[tokio::test]
    async fn empty_body_rejected() {
        let wire = [0u8, 0, 0, 0, 1, 0, 0, 0];
        let mut reader = wire.as_slice();
        let err = Frame::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Proto(_)));
        assert_eq!(err.to_string(), "protocol error: empty message body");
    }

    #[tokio::test]
    async fn oversize_body_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_WORDS + 1).to_le_bytes());
        wire.extend_from_slice(&[0; 4]);
        let mut reader = wire.as_slice();
        let err = Frame::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Proto(_)));
    }

    #[test]
    fn text_padding() {
        let mut builder = Builder::new();
        builder.put_text("12345678");
        let body = builder.finish();
        // 8 bytes + NUL, padded to 16.
        assert_eq!(body.len(), 16);

        let mut cursor = Cursor::new(&body);
        assert_eq!(cursor.get_text().unwrap(), "12345678");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn unterminated_text() {
        let body = [b'a'; 8];
        let mut cursor = Cursor::new(&body);
        let err = cursor.get_text().unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn overflow_reads() {
        let body = 7u64.to_le_bytes();
        let mut cursor = Cursor::new(&body);
        cursor.get_u64().unwrap();
        assert!(matches!(cursor.get_u64(), Err(Error::Overflow(_))));
    }

    #[test]
    fn misaligned_read() {
        let mut body = Vec::new();
        body.extend_from_slice(&[1u8; 8]);
        let mut cursor = Cursor::new(&body);
        cursor.get_u8().unwrap();
        assert!(matches!(cursor.get_u32(), Err(Error::Parse(_))));
    }
}
